//! Policy evaluator integration.
//!
//! The evaluator is consulted twice: at session creation (with an empty
//! service type) and in the proxy pipeline's reserve phase. The session copy
//! handed to the evaluator carries `total_spent + pending_spend`, so two
//! concurrent large calls cannot both slip under a spend-velocity rule by
//! each seeing only the persisted spend.
//!
//! Failure handling is fail-closed: an evaluator error that still carries a
//! decision is treated as that denial; an error without one denies outright.

use async_trait::async_trait;
use paygate_core::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a denial is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Denials block the request.
    Enforce,
    /// Denials are logged; the request proceeds.
    Shadow,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub mode: PolicyMode,
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// An allowing decision in enforce mode.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            mode: PolicyMode::Enforce,
            rule: None,
            reason: None,
        }
    }

    /// Serializes the decision for attachment to a request-log entry.
    pub fn to_log_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// What the evaluator sees. `total_spent` is the projected value (persisted
/// spend plus in-flight reservations), not the raw row.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub buyer: String,
    pub tenant_id: Option<String>,
    /// Empty string for the session-creation check.
    pub service_type: String,
    /// Amount this evaluation gates: the candidate price, or the session's
    /// max_total at creation.
    pub amount: Amount,
    pub total_spent: Amount,
    pub max_total: Amount,
    pub request_count: u64,
}

/// Evaluator failure, possibly still carrying a decision.
#[derive(Debug, Error, Clone)]
#[error("policy evaluator: {message}")]
pub struct PolicyError {
    pub message: String,
    /// When present, the error is treated as this denial rather than an
    /// evaluation failure.
    pub decision: Option<PolicyDecision>,
}

/// Tenant-scoped spend rules, evaluated out of process.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyDecision, PolicyError>;
}

/// Evaluator that allows everything. Useful for tests and tenants without
/// policies.
pub struct AllowAll;

#[async_trait]
impl PolicyEvaluator for AllowAll {
    async fn evaluate(&self, _ctx: &PolicyContext) -> Result<PolicyDecision, PolicyError> {
        Ok(PolicyDecision::allow())
    }
}
