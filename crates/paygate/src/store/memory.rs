//! In-memory store for tests and embedded deployments.

use super::{
    before_cursor, decode_cursor, encode_cursor, BillingSummary, GatewayStore, Page,
    ServiceTypeUsage, StoreError, TimeBucket, UsagePoint,
};
use crate::model::{LogStatus, RequestLogEntry, Session, SessionStatus};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use paygate_core::Amount;

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    logs: Vec<RequestLogEntry>,
}

/// Thread-safe in-memory [`GatewayStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions held. Test helper.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn page_sessions(
        mut rows: Vec<Session>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError> {
        let cursor = cursor.map(decode_cursor).transpose()?;
        rows.sort_by(|a, b| {
            (b.created_at_ns, &b.id).cmp(&(a.created_at_ns, &a.id))
        });
        if let Some(cursor) = &cursor {
            rows.retain(|s| before_cursor(s.created_at_ns, &s.id, cursor));
        }
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map(|s| encode_cursor(s.created_at_ns, &s.id))
        } else {
            None
        };
        Ok(Page {
            items: rows,
            next_cursor,
        })
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::Backend(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        self.state
            .lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match state.sessions.get_mut(&session.id) {
            Some(slot) => {
                *slot = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_sessions(
        &self,
        buyer: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError> {
        let rows: Vec<Session> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.buyer.eq_ignore_ascii_case(buyer))
            .cloned()
            .collect();
        Self::page_sessions(rows, limit, cursor)
    }

    async fn list_by_tenant(
        &self,
        tenant_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError> {
        let rows: Vec<Session> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.tenant_id.as_deref() == Some(tenant_id))
            .cloned()
            .collect();
        Self::page_sessions(rows, limit, cursor)
    }

    async fn list_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let mut rows: Vec<Session> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at_ns, &a.id).cmp(&(b.created_at_ns, &b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_expired(&self, before_ns: i64, limit: usize) -> Result<Vec<Session>, StoreError> {
        let mut rows: Vec<Session> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Active
                    && s.expires_at_ns > 0
                    && s.expires_at_ns <= before_ns
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.expires_at_ns, &a.id).cmp(&(b.expires_at_ns, &b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn create_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError> {
        self.state.lock().logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(
        &self,
        session_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<RequestLogEntry>, StoreError> {
        let cursor = cursor.map(decode_cursor).transpose()?;
        let mut rows: Vec<RequestLogEntry> = self
            .state
            .lock()
            .logs
            .iter()
            .filter(|l| l.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at_ns, &b.id).cmp(&(a.created_at_ns, &a.id)));
        if let Some(cursor) = &cursor {
            rows.retain(|l| before_cursor(l.created_at_ns, &l.id, cursor));
        }
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map(|l| encode_cursor(l.created_at_ns, &l.id))
        } else {
            None
        };
        Ok(Page {
            items: rows,
            next_cursor,
        })
    }

    async fn billing_summary(
        &self,
        buyer: &str,
        since_ns: i64,
    ) -> Result<BillingSummary, StoreError> {
        let state = self.state.lock();
        let session_ids: Vec<&String> = state
            .sessions
            .values()
            .filter(|s| s.buyer.eq_ignore_ascii_case(buyer))
            .map(|s| &s.id)
            .collect();

        let mut summary = BillingSummary {
            total_spent: Amount::ZERO,
            total_fees: Amount::ZERO,
            request_count: 0,
            session_count: session_ids.len() as u64,
        };
        for log in state.logs.iter().filter(|l| {
            l.status == LogStatus::Success
                && l.created_at_ns >= since_ns
                && session_ids.contains(&&l.session_id)
        }) {
            summary.total_spent = summary
                .total_spent
                .checked_add(log.amount)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            summary.total_fees = summary
                .total_fees
                .checked_add(log.platform_fee)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            summary.request_count += 1;
        }
        Ok(summary)
    }

    async fn usage_series(
        &self,
        buyer: &str,
        since_ns: i64,
        bucket: TimeBucket,
    ) -> Result<Vec<UsagePoint>, StoreError> {
        let width = bucket.width_ns();
        let state = self.state.lock();
        let session_ids: Vec<&String> = state
            .sessions
            .values()
            .filter(|s| s.buyer.eq_ignore_ascii_case(buyer))
            .map(|s| &s.id)
            .collect();

        let mut buckets: HashMap<i64, (u64, Amount)> = HashMap::new();
        for log in state.logs.iter().filter(|l| {
            l.status == LogStatus::Success
                && l.created_at_ns >= since_ns
                && session_ids.contains(&&l.session_id)
        }) {
            let start = (log.created_at_ns / width) * width;
            let slot = buckets.entry(start).or_insert((0, Amount::ZERO));
            slot.0 += 1;
            slot.1 = slot
                .1
                .checked_add(log.amount)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        }

        let mut series: Vec<UsagePoint> = buckets
            .into_iter()
            .map(|(bucket_start_ns, (requests, spent))| UsagePoint {
                bucket_start_ns,
                requests,
                spent,
            })
            .collect();
        series.sort_by_key(|p| p.bucket_start_ns);
        Ok(series)
    }

    async fn top_service_types(
        &self,
        buyer: &str,
        since_ns: i64,
        limit: usize,
    ) -> Result<Vec<ServiceTypeUsage>, StoreError> {
        let state = self.state.lock();
        let session_ids: Vec<&String> = state
            .sessions
            .values()
            .filter(|s| s.buyer.eq_ignore_ascii_case(buyer))
            .map(|s| &s.id)
            .collect();

        let mut by_type: HashMap<String, (u64, Amount)> = HashMap::new();
        for log in state.logs.iter().filter(|l| {
            l.status == LogStatus::Success
                && l.created_at_ns >= since_ns
                && session_ids.contains(&&l.session_id)
        }) {
            let service_type = log.service_type.clone().unwrap_or_default();
            let slot = by_type.entry(service_type).or_insert((0, Amount::ZERO));
            slot.0 += 1;
            slot.1 = slot
                .1
                .checked_add(log.amount)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        }

        let mut usage: Vec<ServiceTypeUsage> = by_type
            .into_iter()
            .map(|(service_type, (requests, spent))| ServiceTypeUsage {
                service_type,
                requests,
                spent,
            })
            .collect();
        usage.sort_by(|a, b| b.requests.cmp(&a.requests));
        usage.truncate(limit);
        Ok(usage)
    }

    async fn policy_denied_logs(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<RequestLogEntry>, StoreError> {
        let mut rows: Vec<RequestLogEntry> = self
            .state
            .lock()
            .logs
            .iter()
            .filter(|l| {
                l.tenant_id.as_deref() == Some(tenant_id)
                    && matches!(l.status, LogStatus::PolicyDenied | LogStatus::ShadowDenied)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at_ns, &b.id).cmp(&(a.created_at_ns, &a.id)));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_session_id, now_ns, Strategy};

    fn session(buyer: &str, created_at_ns: i64) -> Session {
        Session {
            id: new_session_id(),
            buyer: buyer.to_string(),
            tenant_id: None,
            max_total: Amount::from_micros(5_000_000),
            max_per_request: Amount::from_micros(1_000_000),
            total_spent: Amount::ZERO,
            request_count: 0,
            strategy: Strategy::Cheapest,
            allowed_service_types: None,
            warn_at_percent: 80,
            rate_limit_per_minute: 60,
            status: SessionStatus::Active,
            expires_at_ns: 0,
            created_at_ns,
            updated_at_ns: created_at_ns,
        }
    }

    #[tokio::test]
    async fn create_get_update_round_trip() {
        let store = MemoryStore::new();
        let mut s = session("buyer", now_ns());
        store.create_session(&s).await.unwrap();

        let loaded = store.get_session(&s.id).await.unwrap();
        assert_eq!(loaded.buyer, "buyer");

        s.total_spent = Amount::from_micros(42);
        store.update_session(&s).await.unwrap();
        assert_eq!(
            store.get_session(&s.id).await.unwrap().total_spent,
            Amount::from_micros(42)
        );
    }

    #[tokio::test]
    async fn update_missing_session_is_not_found() {
        let store = MemoryStore::new();
        let s = session("buyer", now_ns());
        assert_eq!(
            store.update_session(&s).await.unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryStore::new();
        let s = session("buyer", now_ns());
        store.create_session(&s).await.unwrap();
        assert!(store.create_session(&s).await.is_err());
    }

    #[tokio::test]
    async fn pagination_walks_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create_session(&session("buyer", 1_000 + i))
                .await
                .unwrap();
        }

        let first = store.list_sessions("buyer", 2, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].created_at_ns, 1_004);
        assert_eq!(first.items[1].created_at_ns, 1_003);
        let cursor = first.next_cursor.expect("more pages");

        let second = store
            .list_sessions("buyer", 2, Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.items[0].created_at_ns, 1_002);
        assert_eq!(second.items[1].created_at_ns, 1_001);

        let third = store
            .list_sessions("buyer", 2, Some(&second.next_cursor.unwrap()))
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert_eq!(third.items[0].created_at_ns, 1_000);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_expired_skips_settlement_failed_and_unexpiring() {
        let store = MemoryStore::new();
        let now = 1_000_000;

        let mut expired = session("buyer", 1);
        expired.expires_at_ns = now - 1;
        store.create_session(&expired).await.unwrap();

        let mut failed = session("buyer", 2);
        failed.expires_at_ns = now - 1;
        failed.status = SessionStatus::SettlementFailed;
        store.create_session(&failed).await.unwrap();

        let mut forever = session("buyer", 3);
        forever.expires_at_ns = 0;
        store.create_session(&forever).await.unwrap();

        let mut future = session("buyer", 4);
        future.expires_at_ns = now + 1_000;
        store.create_session(&future).await.unwrap();

        let rows = store.list_expired(now, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, expired.id);
    }

    #[tokio::test]
    async fn logs_list_reverse_chronological() {
        let store = MemoryStore::new();
        let s = session("buyer", now_ns());
        store.create_session(&s).await.unwrap();

        for i in 0..3 {
            let mut entry = RequestLogEntry::for_session(&s, LogStatus::Success);
            entry.created_at_ns = 100 + i;
            entry.amount = Amount::from_micros(10);
            store.create_log(&entry).await.unwrap();
        }

        let page = store.list_logs(&s.id, 10, None).await.unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].created_at_ns, 102);
        assert_eq!(page.items[2].created_at_ns, 100);
    }

    #[tokio::test]
    async fn billing_summary_counts_only_success() {
        let store = MemoryStore::new();
        let s = session("buyer", now_ns());
        store.create_session(&s).await.unwrap();

        let mut ok = RequestLogEntry::for_session(&s, LogStatus::Success);
        ok.amount = Amount::from_micros(500_000);
        ok.platform_fee = Amount::from_micros(5_000);
        store.create_log(&ok).await.unwrap();

        let mut failed = RequestLogEntry::for_session(&s, LogStatus::ForwardFailed);
        failed.amount = Amount::ZERO;
        store.create_log(&failed).await.unwrap();

        let summary = store.billing_summary("buyer", 0).await.unwrap();
        assert_eq!(summary.request_count, 1);
        assert_eq!(summary.total_spent, Amount::from_micros(500_000));
        assert_eq!(summary.total_fees, Amount::from_micros(5_000));
        assert_eq!(summary.session_count, 1);
    }
}
