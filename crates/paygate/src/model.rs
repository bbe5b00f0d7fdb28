//! Session aggregate, request logs, and the gateway's request/response types.

use paygate_core::Amount;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current unix time in nanoseconds.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Mints a fresh session id. The id doubles as the proxy bearer token, so it
/// must be unguessable.
pub fn new_session_id() -> String {
    format!("gws_{}", Uuid::new_v4().simple())
}

/// Returns true when `id` looks like a gateway session id. Used by the
/// orphan-hold reconciler to recognize gateway references in the ledger.
pub fn is_session_reference(id: &str) -> bool {
    id.len() == 36 && id.starts_with("gws_")
}

/// Candidate selection strategy for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Lowest price first.
    #[default]
    Cheapest,
    /// Highest reputation first.
    Reputation,
    /// Highest reputation-per-price first.
    BestValue,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Cheapest => "cheapest",
            Strategy::Reputation => "reputation",
            Strategy::BestValue => "best_value",
        }
    }

    pub fn parse(s: &str) -> Option<Strategy> {
        match s {
            "cheapest" => Some(Strategy::Cheapest),
            "reputation" => Some(Strategy::Reputation),
            "best_value" => Some(Strategy::BestValue),
            _ => None,
        }
    }
}

/// Lifecycle status of a session.
///
/// Once non-active, a session only moves forward:
/// `active -> {closed, expired, settlement_failed}` and
/// `settlement_failed -> closed` via the reconcile sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
    SettlementFailed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Expired => "expired",
            SessionStatus::SettlementFailed => "settlement_failed",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "active" => Some(SessionStatus::Active),
            "closed" => Some(SessionStatus::Closed),
            "expired" => Some(SessionStatus::Expired),
            "settlement_failed" => Some(SessionStatus::SettlementFailed),
            _ => None,
        }
    }
}

/// The buyer's budget envelope. The id is the proxy bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub buyer: String,
    pub tenant_id: Option<String>,
    /// Held budget for the whole session.
    pub max_total: Amount,
    /// Cap applied to each individual proxy call.
    pub max_per_request: Amount,
    /// Settled spend so far; monotonically non-decreasing, <= max_total.
    pub total_spent: Amount,
    pub request_count: u64,
    pub strategy: Strategy,
    /// When set, only these service types may be proxied.
    pub allowed_service_types: Option<Vec<String>>,
    /// Percentage of budget at which responses start carrying a low-budget
    /// warning.
    pub warn_at_percent: u32,
    /// Per-minute request cap enforced by the rate limiter.
    pub rate_limit_per_minute: u32,
    pub status: SessionStatus,
    /// Unix nanos; 0 means the session never expires.
    pub expires_at_ns: i64,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
}

impl Session {
    /// Returns true when the session has an expiry and it has passed.
    pub fn is_expired(&self, now_ns: i64) -> bool {
        self.expires_at_ns > 0 && now_ns >= self.expires_at_ns
    }

    /// Returns true when `service_type` is allowed for this session.
    pub fn allows_service_type(&self, service_type: &str) -> bool {
        match &self.allowed_service_types {
            Some(allowed) => allowed.iter().any(|t| t == service_type),
            None => true,
        }
    }
}

/// Validated service-type names: 1-100 chars of `[A-Za-z0-9_-]`.
pub fn valid_service_type(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Request to open a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub max_total: Amount,
    pub max_per_request: Amount,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub allowed_service_types: Option<Vec<String>>,
    #[serde(default)]
    pub warn_at_percent: Option<u32>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// 0 = never expires; otherwise 60..=86_400 seconds.
    #[serde(default)]
    pub expires_in_secs: u64,
}

/// One proxy call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub service_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// When set, the matching candidate is tried first.
    #[serde(default)]
    pub prefer_agent: Option<String>,
}

/// Single-shot create -> proxy -> close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleCallRequest {
    pub service_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Budget for the one call; becomes both max_total and max_per_request.
    pub max_price: Amount,
    #[serde(default)]
    pub prefer_agent: Option<String>,
}

/// Successful proxy outcome returned to the buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResult {
    pub session_id: String,
    /// Settlement reference (`<session>:req:<n>:<service>`); empty when
    /// settlement did not complete.
    pub request_reference: String,
    /// Agent id of the seller that served the call.
    pub service_used: String,
    pub endpoint: String,
    /// What the buyer was charged; `0.000000` when settlement failed after
    /// delivery.
    pub amount_paid: Amount,
    pub platform_fee: Amount,
    pub total_spent: Amount,
    pub remaining: Amount,
    pub request_count: u64,
    /// Failed candidates before this one answered.
    pub retries: u32,
    /// True once spend crosses the session's warn-at threshold.
    pub budget_low: bool,
    pub response: serde_json::Value,
    pub latency_ms: u64,
}

/// Read-only preflight result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunResult {
    pub allowed: bool,
    pub deny_reason: Option<String>,
    pub budget_ok: bool,
    pub remaining: Amount,
    pub service_found: bool,
    pub best_price: Option<Amount>,
    pub best_service: Option<String>,
    pub policy_result: Option<crate::policy::PolicyDecision>,
}

/// Request-log entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    ForwardFailed,
    PolicyDenied,
    ShadowDenied,
    PolicyError,
    NoService,
    SettlementFailed,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::ForwardFailed => "forward_failed",
            LogStatus::PolicyDenied => "policy_denied",
            LogStatus::ShadowDenied => "shadow_denied",
            LogStatus::PolicyError => "policy_error",
            LogStatus::NoService => "no_service",
            LogStatus::SettlementFailed => "settlement_failed",
        }
    }

    pub fn parse(s: &str) -> Option<LogStatus> {
        match s {
            "success" => Some(LogStatus::Success),
            "forward_failed" => Some(LogStatus::ForwardFailed),
            "policy_denied" => Some(LogStatus::PolicyDenied),
            "shadow_denied" => Some(LogStatus::ShadowDenied),
            "policy_error" => Some(LogStatus::PolicyError),
            "no_service" => Some(LogStatus::NoService),
            "settlement_failed" => Some(LogStatus::SettlementFailed),
            _ => None,
        }
    }
}

/// Append-only record of one proxy attempt. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub id: String,
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub service_type: Option<String>,
    /// Seller agent that was called, when one was reached.
    pub called_agent: Option<String>,
    pub status: LogStatus,
    /// Amount charged to the buyer (zero for failed attempts).
    pub amount: Amount,
    pub platform_fee: Amount,
    pub latency_ms: u64,
    pub error: Option<String>,
    /// Policy decision attached to policy-related entries, as recorded JSON.
    pub policy_decision: Option<serde_json::Value>,
    pub created_at_ns: i64,
}

impl RequestLogEntry {
    /// Starts a log entry for a session with zero amounts and a fresh id.
    pub fn for_session(session: &Session, status: LogStatus) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            session_id: session.id.clone(),
            tenant_id: session.tenant_id.clone(),
            service_type: None,
            called_agent: None,
            status,
            amount: Amount::ZERO,
            platform_fee: Amount::ZERO,
            latency_ms: 0,
            error: None,
            policy_decision: None,
            created_at_ns: now_ns(),
        }
    }
}
