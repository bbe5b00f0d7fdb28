//! Durable session and request-log storage.
//!
//! Two implementations ship: [`MemoryStore`] for tests and embedded use, and
//! [`PgStore`] backed by Postgres. Both honor the same contract:
//!
//! - `update_session` checks rows-affected and reports [`StoreError::NotFound`]
//!   for missing ids.
//! - Request logs are append-only and listed in reverse chronological order.
//! - List cursors encode `"<unix-nanos>|<id>"` in base64; a page continues at
//!   rows with `(created_at, id)` strictly less than the cursor pair.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::model::{RequestLogEntry, Session, SessionStatus};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use paygate_core::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store failures. Backend details are flattened to strings so the error
/// stays cheap to clone and pass through the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("invalid pagination cursor")]
    InvalidCursor,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store backend: {0}")]
    Backend(String),
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; None when this page exhausted the result.
    pub next_cursor: Option<String>,
}

/// Aggregate spend for a buyer over a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSummary {
    pub total_spent: Amount,
    pub total_fees: Amount,
    pub request_count: u64,
    pub session_count: u64,
}

/// Bucketing granularity for usage time-series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Hour,
    Day,
    Week,
}

impl TimeBucket {
    /// Bucket width in nanoseconds.
    pub fn width_ns(self) -> i64 {
        match self {
            TimeBucket::Hour => 3_600_000_000_000,
            TimeBucket::Day => 86_400_000_000_000,
            TimeBucket::Week => 604_800_000_000_000,
        }
    }
}

/// One point of a usage time-series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePoint {
    pub bucket_start_ns: i64,
    pub requests: u64,
    pub spent: Amount,
}

/// Spend aggregated by service type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceTypeUsage {
    pub service_type: String,
    pub requests: u64,
    pub spent: Amount,
}

/// Durable gateway state.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, id: &str) -> Result<Session, StoreError>;

    /// Persists the full session row. Missing id is an error, not an upsert.
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn list_sessions(
        &self,
        buyer: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError>;

    async fn list_by_tenant(
        &self,
        tenant_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Session>, StoreError>;

    async fn list_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError>;

    /// Active sessions whose expiry has passed `before_ns`. Drives the expiry
    /// sweep; sessions without an expiry (0) are never returned.
    async fn list_expired(&self, before_ns: i64, limit: usize) -> Result<Vec<Session>, StoreError>;

    /// Appends a request-log entry. Entries are never mutated.
    async fn create_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError>;

    /// Request logs for one session, newest first.
    async fn list_logs(
        &self,
        session_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<RequestLogEntry>, StoreError>;

    /// Spend summary across a buyer's successful calls since `since_ns`.
    async fn billing_summary(
        &self,
        buyer: &str,
        since_ns: i64,
    ) -> Result<BillingSummary, StoreError>;

    /// Successful-call volume over time. Approximate is acceptable.
    async fn usage_series(
        &self,
        buyer: &str,
        since_ns: i64,
        bucket: TimeBucket,
    ) -> Result<Vec<UsagePoint>, StoreError>;

    /// Most-used service types for a buyer, by request count.
    async fn top_service_types(
        &self,
        buyer: &str,
        since_ns: i64,
        limit: usize,
    ) -> Result<Vec<ServiceTypeUsage>, StoreError>;

    /// Recent policy-denied log entries for a tenant.
    async fn policy_denied_logs(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<RequestLogEntry>, StoreError>;
}

/// Encodes a pagination cursor for the row `(created_at_ns, id)`.
pub fn encode_cursor(created_at_ns: i64, id: &str) -> String {
    BASE64.encode(format!("{created_at_ns}|{id}"))
}

/// Decodes a cursor produced by [`encode_cursor`].
pub fn decode_cursor(cursor: &str) -> Result<(i64, String), StoreError> {
    let raw = BASE64.decode(cursor).map_err(|_| StoreError::InvalidCursor)?;
    let raw = String::from_utf8(raw).map_err(|_| StoreError::InvalidCursor)?;
    let (ts, id) = raw.split_once('|').ok_or(StoreError::InvalidCursor)?;
    let ts: i64 = ts.parse().map_err(|_| StoreError::InvalidCursor)?;
    if id.is_empty() {
        return Err(StoreError::InvalidCursor);
    }
    Ok((ts, id.to_string()))
}

/// Returns true when the row `(created_at_ns, id)` belongs on a page that
/// continues from `cursor` (strictly older rows first by timestamp, id as the
/// tiebreak).
pub(crate) fn before_cursor(created_at_ns: i64, id: &str, cursor: &(i64, String)) -> bool {
    created_at_ns < cursor.0 || (created_at_ns == cursor.0 && id < cursor.1.as_str())
}
