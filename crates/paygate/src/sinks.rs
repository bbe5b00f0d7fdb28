//! Side-effect sinks and the tenant-settings provider.
//!
//! Sinks are fire-and-forget: failures are logged by the caller and never
//! fail the proxy call that triggered them.

use async_trait::async_trait;
use paygate_core::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
#[error("sink: {0}")]
pub struct SinkError(pub String);

/// Whether a recorded transaction settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Confirmed,
    Failed,
}

/// One proxied payment attempt, as handed to the transaction recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub session_id: String,
    pub reference: String,
    pub buyer: String,
    pub seller: String,
    pub amount: Amount,
    pub platform_fee: Amount,
    pub service_type: String,
    pub status: TransactionStatus,
    pub error: Option<String>,
    pub created_at_ns: i64,
}

/// Receipt for a settled call, as handed to the receipt issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub session_id: String,
    pub reference: String,
    pub buyer: String,
    pub seller: String,
    pub amount: Amount,
    pub service_type: String,
    pub created_at_ns: i64,
}

/// Outbound webhook payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    /// The forward succeeded but settlement could not be completed; the debt
    /// is recoverable only out of band.
    SettlementFailed {
        session_id: String,
        reference: String,
        amount: Amount,
        error: String,
    },
    /// A proxy call settled.
    PaymentCompleted {
        session_id: String,
        reference: String,
        amount: Amount,
        platform_fee: Amount,
        seller: String,
        service_type: String,
    },
}

#[async_trait]
pub trait TransactionRecorder: Send + Sync {
    async fn record(&self, tx: &TransactionRecord) -> Result<(), SinkError>;
}

#[async_trait]
pub trait RevenueAccumulator: Send + Sync {
    async fn add(&self, tenant_id: Option<&str>, fee: Amount) -> Result<(), SinkError>;
}

#[async_trait]
pub trait ReceiptIssuer: Send + Sync {
    async fn issue(&self, receipt: &Receipt) -> Result<(), SinkError>;
}

#[async_trait]
pub trait WebhookEmitter: Send + Sync {
    async fn emit(&self, event: &WebhookEvent) -> Result<(), SinkError>;
}

/// Tenant account state, as reported by the settings provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Cancelled,
}

impl TenantStatus {
    /// Suspended and cancelled tenants cannot open sessions or proxy.
    pub fn is_blocked(self) -> bool {
        matches!(self, TenantStatus::Suspended | TenantStatus::Cancelled)
    }
}

/// Tenant-scoped settings: account status and platform take rate.
#[async_trait]
pub trait TenantSettingsProvider: Send + Sync {
    async fn tenant_status(&self, tenant_id: &str) -> Result<TenantStatus, SinkError>;

    /// Platform take rate in basis points for this tenant (None = default).
    async fn take_rate_bps(&self, tenant_id: Option<&str>) -> Result<u32, SinkError>;
}

/// No-op sinks for tests and minimal deployments.
pub struct NullSinks;

#[async_trait]
impl TransactionRecorder for NullSinks {
    async fn record(&self, _tx: &TransactionRecord) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl RevenueAccumulator for NullSinks {
    async fn add(&self, _tenant_id: Option<&str>, _fee: Amount) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl ReceiptIssuer for NullSinks {
    async fn issue(&self, _receipt: &Receipt) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl WebhookEmitter for NullSinks {
    async fn emit(&self, _event: &WebhookEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl TenantSettingsProvider for NullSinks {
    async fn tenant_status(&self, _tenant_id: &str) -> Result<TenantStatus, SinkError> {
        Ok(TenantStatus::Active)
    }

    async fn take_rate_bps(&self, _tenant_id: Option<&str>) -> Result<u32, SinkError> {
        Ok(0)
    }
}
