//! Postgres-backed store.
//!
//! Uses runtime-bound queries only. Amounts live in `NUMERIC(20,6)` columns
//! and cross the wire as text (`$n::numeric` on the way in, `::text` on the
//! way out), so monetary values never pass through floating point.

use super::{
    decode_cursor, encode_cursor, BillingSummary, GatewayStore, Page, ServiceTypeUsage,
    StoreError, TimeBucket, UsagePoint,
};
use crate::model::{LogStatus, RequestLogEntry, Session, SessionStatus, Strategy};
use async_trait::async_trait;
use paygate_core::Amount;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("../../migrations/0001_schema.sql"))];

// Prevents concurrent migrations when several gateway processes start at once.
const MIGRATION_LOCK_KEY: i64 = 0x5041_5947_4154_4531; // "PAYGATE1"

const SESSION_COLUMNS: &str = "id, buyer, tenant_id, \
     max_total::text AS max_total, max_per_request::text AS max_per_request, \
     total_spent::text AS total_spent, request_count, strategy, \
     allowed_service_types, warn_at_percent, rate_limit_per_minute, status, \
     expires_at, created_at, updated_at";

const LOG_COLUMNS: &str = "id, session_id, tenant_id, service_type, called_agent, status, \
     amount::text AS amount, platform_fee::text AS platform_fee, latency_ms, \
     error, policy_decision, created_at";

/// Postgres [`GatewayStore`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies embedded migrations under an advisory lock.
    ///
    /// The whole sequence runs on a single connection: advisory locks are
    /// per-session, so acquiring on one connection and releasing on another
    /// would leave the original lock held.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;

        let result: Result<(), StoreError> = async {
            for (version, sql) in MIGRATIONS {
                if *version > 1 {
                    let applied: Option<i32> = sqlx::query_scalar(
                        "SELECT version FROM paygate.schema_migrations WHERE version = $1",
                    )
                    .bind(*version)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(backend)?;
                    if applied.is_some() {
                        continue;
                    }
                }

                sqlx::raw_sql(sql)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;

                sqlx::query(
                    "INSERT INTO paygate.schema_migrations (version) VALUES ($1) \
                     ON CONFLICT (version) DO NOTHING",
                )
                .bind(*version)
                .execute(&mut *conn)
                .await
                .map_err(backend)?;
            }
            Ok(())
        }
        .await;

        let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if let Err(err) = unlock {
            tracing::warn!(error = %err, "failed to release migration advisory lock");
        }

        result
    }

    async fn page_query(
        &self,
        filter_column: &str,
        filter_value: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError> {
        let cursor = cursor.map(decode_cursor).transpose()?;
        let fetch = (limit + 1) as i64;

        let sql = match (&cursor, filter_column) {
            (None, "buyer") => format!(
                "SELECT {SESSION_COLUMNS} FROM paygate.sessions \
                 WHERE lower(buyer) = lower($1) \
                 ORDER BY created_at DESC, id DESC LIMIT $2"
            ),
            (Some(_), "buyer") => format!(
                "SELECT {SESSION_COLUMNS} FROM paygate.sessions \
                 WHERE lower(buyer) = lower($1) AND (created_at, id) < ($3, $4) \
                 ORDER BY created_at DESC, id DESC LIMIT $2"
            ),
            (None, _) => format!(
                "SELECT {SESSION_COLUMNS} FROM paygate.sessions \
                 WHERE tenant_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT $2"
            ),
            (Some(_), _) => format!(
                "SELECT {SESSION_COLUMNS} FROM paygate.sessions \
                 WHERE tenant_id = $1 AND (created_at, id) < ($3, $4) \
                 ORDER BY created_at DESC, id DESC LIMIT $2"
            ),
        };

        let mut query = sqlx::query(&sql).bind(filter_value).bind(fetch);
        if let Some((ts, id)) = &cursor {
            query = query.bind(ts).bind(id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        let mut sessions = rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = sessions.len() > limit;
        sessions.truncate(limit);
        let next_cursor = if has_more {
            sessions
                .last()
                .map(|s| encode_cursor(s.created_at_ns, &s.id))
        } else {
            None
        };
        Ok(Page {
            items: sessions,
            next_cursor,
        })
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Backend(other.to_string()),
    }
}

fn parse_amount(raw: &str) -> Result<Amount, StoreError> {
    raw.parse()
        .map_err(|e: paygate_core::AmountError| StoreError::Corrupt(e.to_string()))
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown session status {status:?}")))?;
    let strategy: String = row.try_get("strategy").map_err(backend)?;
    let strategy = Strategy::parse(&strategy)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown strategy {strategy:?}")))?;

    let max_total: String = row.try_get("max_total").map_err(backend)?;
    let max_per_request: String = row.try_get("max_per_request").map_err(backend)?;
    let total_spent: String = row.try_get("total_spent").map_err(backend)?;
    let request_count: i64 = row.try_get("request_count").map_err(backend)?;
    let warn_at_percent: i32 = row.try_get("warn_at_percent").map_err(backend)?;
    let rate_limit: i32 = row.try_get("rate_limit_per_minute").map_err(backend)?;

    Ok(Session {
        id: row.try_get("id").map_err(backend)?,
        buyer: row.try_get("buyer").map_err(backend)?,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        max_total: parse_amount(&max_total)?,
        max_per_request: parse_amount(&max_per_request)?,
        total_spent: parse_amount(&total_spent)?,
        request_count: request_count.max(0) as u64,
        strategy,
        allowed_service_types: row.try_get("allowed_service_types").map_err(backend)?,
        warn_at_percent: warn_at_percent.max(0) as u32,
        rate_limit_per_minute: rate_limit.max(0) as u32,
        status,
        expires_at_ns: row.try_get("expires_at").map_err(backend)?,
        created_at_ns: row.try_get("created_at").map_err(backend)?,
        updated_at_ns: row.try_get("updated_at").map_err(backend)?,
    })
}

fn log_from_row(row: &PgRow) -> Result<RequestLogEntry, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let status = LogStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown log status {status:?}")))?;
    let amount: String = row.try_get("amount").map_err(backend)?;
    let platform_fee: String = row.try_get("platform_fee").map_err(backend)?;
    let latency_ms: i64 = row.try_get("latency_ms").map_err(backend)?;
    let policy_decision: Option<String> = row.try_get("policy_decision").map_err(backend)?;
    let policy_decision = match policy_decision {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("policy decision: {e}")))?,
        ),
        None => None,
    };

    Ok(RequestLogEntry {
        id: row.try_get("id").map_err(backend)?,
        session_id: row.try_get("session_id").map_err(backend)?,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        service_type: row.try_get("service_type").map_err(backend)?,
        called_agent: row.try_get("called_agent").map_err(backend)?,
        status,
        amount: parse_amount(&amount)?,
        platform_fee: parse_amount(&platform_fee)?,
        latency_ms: latency_ms.max(0) as u64,
        error: row.try_get("error").map_err(backend)?,
        policy_decision,
        created_at_ns: row.try_get("created_at").map_err(backend)?,
    })
}

#[async_trait]
impl GatewayStore for PgStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO paygate.sessions \
             (id, buyer, tenant_id, max_total, max_per_request, total_spent, \
              request_count, strategy, allowed_service_types, warn_at_percent, \
              rate_limit_per_minute, status, expires_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4::numeric, $5::numeric, $6::numeric, $7, $8, \
                     $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&session.id)
        .bind(&session.buyer)
        .bind(&session.tenant_id)
        .bind(session.max_total.to_string())
        .bind(session.max_per_request.to_string())
        .bind(session.total_spent.to_string())
        .bind(session.request_count as i64)
        .bind(session.strategy.as_str())
        .bind(&session.allowed_service_types)
        .bind(session.warn_at_percent as i32)
        .bind(session.rate_limit_per_minute as i32)
        .bind(session.status.as_str())
        .bind(session.expires_at_ns)
        .bind(session.created_at_ns)
        .bind(session.updated_at_ns)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM paygate.sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StoreError::NotFound)?;
        session_from_row(&row)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE paygate.sessions SET \
             total_spent = $2::numeric, request_count = $3, status = $4, \
             expires_at = $5, updated_at = $6 \
             WHERE id = $1",
        )
        .bind(&session.id)
        .bind(session.total_spent.to_string())
        .bind(session.request_count as i64)
        .bind(session.status.as_str())
        .bind(session.expires_at_ns)
        .bind(session.updated_at_ns)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        buyer: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError> {
        self.page_query("buyer", buyer, limit, cursor).await
    }

    async fn list_by_tenant(
        &self,
        tenant_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError> {
        self.page_query("tenant_id", tenant_id, limit, cursor).await
    }

    async fn list_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM paygate.sessions \
             WHERE status = $1 ORDER BY created_at, id LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn list_expired(&self, before_ns: i64, limit: usize) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM paygate.sessions \
             WHERE status = 'active' AND expires_at > 0 AND expires_at <= $1 \
             ORDER BY expires_at, id LIMIT $2"
        ))
        .bind(before_ns)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn create_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError> {
        let policy_decision = entry
            .policy_decision
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());

        sqlx::query(
            "INSERT INTO paygate.request_logs \
             (id, session_id, tenant_id, service_type, called_agent, status, \
              amount, platform_fee, latency_ms, error, policy_decision, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7::numeric, $8::numeric, $9, $10, $11, $12)",
        )
        .bind(&entry.id)
        .bind(&entry.session_id)
        .bind(&entry.tenant_id)
        .bind(&entry.service_type)
        .bind(&entry.called_agent)
        .bind(entry.status.as_str())
        .bind(entry.amount.to_string())
        .bind(entry.platform_fee.to_string())
        .bind(entry.latency_ms as i64)
        .bind(&entry.error)
        .bind(policy_decision)
        .bind(entry.created_at_ns)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_logs(
        &self,
        session_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<RequestLogEntry>, StoreError> {
        let cursor = cursor.map(decode_cursor).transpose()?;
        let fetch = (limit + 1) as i64;

        let sql = if cursor.is_some() {
            format!(
                "SELECT {LOG_COLUMNS} FROM paygate.request_logs \
                 WHERE session_id = $1 AND (created_at, id) < ($3, $4) \
                 ORDER BY created_at DESC, id DESC LIMIT $2"
            )
        } else {
            format!(
                "SELECT {LOG_COLUMNS} FROM paygate.request_logs \
                 WHERE session_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
            )
        };

        let mut query = sqlx::query(&sql).bind(session_id).bind(fetch);
        if let Some((ts, id)) = &cursor {
            query = query.bind(ts).bind(id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        let mut logs = rows
            .iter()
            .map(log_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = logs.len() > limit;
        logs.truncate(limit);
        let next_cursor = if has_more {
            logs.last().map(|l| encode_cursor(l.created_at_ns, &l.id))
        } else {
            None
        };
        Ok(Page {
            items: logs,
            next_cursor,
        })
    }

    async fn billing_summary(
        &self,
        buyer: &str,
        since_ns: i64,
    ) -> Result<BillingSummary, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(l.amount), 0)::text AS total_spent, \
                    COALESCE(SUM(l.platform_fee), 0)::text AS total_fees, \
                    COUNT(*) AS request_count \
             FROM paygate.request_logs l \
             JOIN paygate.sessions s ON s.id = l.session_id \
             WHERE lower(s.buyer) = lower($1) AND l.status = 'success' \
               AND l.created_at >= $2",
        )
        .bind(buyer)
        .bind(since_ns)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let total_spent: String = row.try_get("total_spent").map_err(backend)?;
        let total_fees: String = row.try_get("total_fees").map_err(backend)?;
        let request_count: i64 = row.try_get("request_count").map_err(backend)?;

        let session_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM paygate.sessions WHERE lower(buyer) = lower($1)",
        )
        .bind(buyer)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(BillingSummary {
            total_spent: parse_amount(&total_spent)?,
            total_fees: parse_amount(&total_fees)?,
            request_count: request_count.max(0) as u64,
            session_count: session_count.max(0) as u64,
        })
    }

    async fn usage_series(
        &self,
        buyer: &str,
        since_ns: i64,
        bucket: TimeBucket,
    ) -> Result<Vec<UsagePoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT (l.created_at / $3) * $3 AS bucket_start, \
                    COUNT(*) AS requests, \
                    COALESCE(SUM(l.amount), 0)::text AS spent \
             FROM paygate.request_logs l \
             JOIN paygate.sessions s ON s.id = l.session_id \
             WHERE lower(s.buyer) = lower($1) AND l.status = 'success' \
               AND l.created_at >= $2 \
             GROUP BY bucket_start ORDER BY bucket_start",
        )
        .bind(buyer)
        .bind(since_ns)
        .bind(bucket.width_ns())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let bucket_start_ns: i64 = row.try_get("bucket_start").map_err(backend)?;
                let requests: i64 = row.try_get("requests").map_err(backend)?;
                let spent: String = row.try_get("spent").map_err(backend)?;
                Ok(UsagePoint {
                    bucket_start_ns,
                    requests: requests.max(0) as u64,
                    spent: parse_amount(&spent)?,
                })
            })
            .collect()
    }

    async fn top_service_types(
        &self,
        buyer: &str,
        since_ns: i64,
        limit: usize,
    ) -> Result<Vec<ServiceTypeUsage>, StoreError> {
        let rows = sqlx::query(
            "SELECT COALESCE(l.service_type, '') AS service_type, \
                    COUNT(*) AS requests, \
                    COALESCE(SUM(l.amount), 0)::text AS spent \
             FROM paygate.request_logs l \
             JOIN paygate.sessions s ON s.id = l.session_id \
             WHERE lower(s.buyer) = lower($1) AND l.status = 'success' \
               AND l.created_at >= $2 \
             GROUP BY l.service_type ORDER BY requests DESC LIMIT $3",
        )
        .bind(buyer)
        .bind(since_ns)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let service_type: String = row.try_get("service_type").map_err(backend)?;
                let requests: i64 = row.try_get("requests").map_err(backend)?;
                let spent: String = row.try_get("spent").map_err(backend)?;
                Ok(ServiceTypeUsage {
                    service_type,
                    requests: requests.max(0) as u64,
                    spent: parse_amount(&spent)?,
                })
            })
            .collect()
    }

    async fn policy_denied_logs(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<RequestLogEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM paygate.request_logs \
             WHERE tenant_id = $1 AND status IN ('policy_denied', 'shadow_denied') \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(log_from_row).collect()
    }
}
