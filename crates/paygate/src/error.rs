//! Error taxonomy for the gateway.
//!
//! Everything below the proxy pipeline returns typed errors; the pipeline
//! translates fatal conditions into terminal session status or a
//! [`MoneyError`]. `MoneyError` is the only error that carries fund-state, so
//! a caller (or the HTTP layer merging it into a response body) can always
//! tell what happened to the money.

use crate::store::StoreError;
use paygate_core::{Amount, AmountError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Disposition of funds after a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundsStatus {
    /// No funds moved; safe to retry.
    NoChange,
    /// A hold exists with no matching session; needs reconciliation.
    HeldPending,
    /// Funds were settled but the response was not delivered.
    SpentNotDelivered,
    /// The hold is intact; nothing was spent.
    HeldSafe,
    /// Funds settled correctly; only bookkeeping failed.
    SettledSafe,
}

impl FundsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FundsStatus::NoChange => "no_change",
            FundsStatus::HeldPending => "held_pending",
            FundsStatus::SpentNotDelivered => "spent_not_delivered",
            FundsStatus::HeldSafe => "held_safe",
            FundsStatus::SettledSafe => "settled_safe",
        }
    }
}

impl fmt::Display for FundsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed money error: what failed, where the funds are, and how to recover.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{cause} (funds {funds_status}, amount {amount}, ref {reference})")]
pub struct MoneyError {
    /// Rendering of the underlying failure.
    pub cause: String,
    /// Where the funds are now.
    pub funds_status: FundsStatus,
    /// Human-readable recovery hint.
    pub recovery: String,
    /// The amount in question.
    pub amount: Amount,
    /// Reconciliation reference (session id or request reference).
    pub reference: String,
}

impl MoneyError {
    pub fn new(
        cause: impl Into<String>,
        funds_status: FundsStatus,
        recovery: impl Into<String>,
        amount: Amount,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            cause: cause.into(),
            funds_status,
            recovery: recovery.into(),
            amount,
            reference: reference.into(),
        }
    }
}

/// Gateway error taxonomy.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Malformed input; nothing happened.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Malformed monetary amount.
    #[error(transparent)]
    Amount(#[from] AmountError),

    /// Session token missing or unknown.
    #[error("session not found")]
    SessionNotFound,

    /// Caller is not the session's buyer.
    #[error("caller does not own this session")]
    OwnerMismatch,

    /// The session is closed.
    #[error("session is closed")]
    SessionClosed,

    /// The session has expired.
    #[error("session has expired")]
    SessionExpired,

    /// The tenant is suspended or cancelled.
    #[error("tenant {tenant_id} is suspended")]
    TenantSuspended { tenant_id: String },

    /// A policy rule denied the request (enforce mode).
    #[error("denied by policy rule {rule}: {reason}")]
    PolicyDenied { rule: String, reason: String },

    /// The policy evaluator failed without a decision; fail closed.
    #[error("policy evaluation failed: {0}")]
    PolicyEvaluation(String),

    /// No candidate service matched the request.
    #[error("no service available for type {service_type}")]
    NoServiceAvailable { service_type: String },

    /// The session's per-minute request cap was hit.
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    /// The price exceeds the remaining budget.
    #[error("budget exceeded: requested {requested}, remaining {remaining}")]
    BudgetExceeded { requested: Amount, remaining: Amount },

    /// Every candidate failed; no payment was made.
    #[error("all candidate services failed")]
    ProxyFailed,

    /// Durable-store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure with an explicit fund-state disposition.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl GatewayError {
    /// HTTP status code for this error, per the gateway's public contract.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) | GatewayError::Amount(_) => 400,
            GatewayError::SessionClosed => 409,
            GatewayError::SessionExpired => 410,
            GatewayError::OwnerMismatch
            | GatewayError::PolicyDenied { .. }
            | GatewayError::TenantSuspended { .. } => 403,
            GatewayError::SessionNotFound => 404,
            GatewayError::NoServiceAvailable { .. } => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::BudgetExceeded { .. } => 402,
            GatewayError::ProxyFailed => 502,
            GatewayError::PolicyEvaluation(_) => 403,
            GatewayError::Store(StoreError::NotFound) => 404,
            GatewayError::Store(_) => 500,
            GatewayError::Money(_) => 500,
        }
    }

    /// Returns the money error, if this error carries fund-state context.
    pub fn money(&self) -> Option<&MoneyError> {
        match self {
            GatewayError::Money(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_contract() {
        assert_eq!(GatewayError::Validation("x".into()).http_status(), 400);
        assert_eq!(
            GatewayError::BudgetExceeded {
                requested: Amount::from_micros(2),
                remaining: Amount::from_micros(1),
            }
            .http_status(),
            402
        );
        assert_eq!(GatewayError::OwnerMismatch.http_status(), 403);
        assert_eq!(GatewayError::SessionNotFound.http_status(), 404);
        assert_eq!(GatewayError::SessionClosed.http_status(), 409);
        assert_eq!(GatewayError::SessionExpired.http_status(), 410);
        assert_eq!(
            GatewayError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .http_status(),
            429
        );
        assert_eq!(GatewayError::ProxyFailed.http_status(), 502);
    }

    #[test]
    fn money_error_renders_disposition() {
        let err = MoneyError::new(
            "release failed",
            FundsStatus::HeldPending,
            "funds are held; reconciliation will release them",
            Amount::from_micros(1_000_000),
            "gws_abc",
        );
        let rendered = err.to_string();
        assert!(rendered.contains("held_pending"));
        assert!(rendered.contains("gws_abc"));
        assert!(rendered.contains("1.000000"));
    }

    #[test]
    fn funds_status_serializes_snake_case() {
        let s = serde_json::to_string(&FundsStatus::SpentNotDelivered).unwrap();
        assert_eq!(s, "\"spent_not_delivered\"");
    }
}
