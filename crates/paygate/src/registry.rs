//! Service registry interface.

use async_trait::async_trait;
use paygate_core::Amount;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
#[error("registry: {0}")]
pub struct RegistryError(pub String);

/// A discovered seller endpoint.
#[derive(Debug, Clone)]
pub struct ServiceCandidate {
    pub service_id: String,
    /// Seller agent id; payments are settled to this identity.
    pub agent: String,
    pub endpoint: String,
    pub price: Amount,
    pub reputation: f64,
    pub service_type: String,
}

/// Discovery of seller services by type. Ranking is the resolver's job.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn discover(&self, service_type: &str) -> Result<Vec<ServiceCandidate>, RegistryError>;
}
