//! Outbound HTTP forwarding with payment headers.
//!
//! The forwarder POSTs the buyer's params as JSON to a candidate endpoint,
//! attaching the payment headers the seller uses to verify what it will be
//! paid (`X-Payment-Amount`, `X-Payment-From`, `X-Payment-Ref`).
//!
//! Status handling mirrors the settlement contract: a 2xx/4xx response means
//! the seller handled the call (4xx is its own application contract, still
//! payable); 5xx and transport failures are retryable and advance the proxy
//! loop to the next candidate.

use crate::error::GatewayError;
use async_trait::async_trait;
use futures::StreamExt;
use paygate_core::Amount;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Hard cap on how much of a response body is read.
pub const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

/// Outbound request handed to the forwarder.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub endpoint: String,
    pub params: serde_json::Value,
    /// Candidate price; becomes `X-Payment-Amount`.
    pub amount: Amount,
    /// Buyer identity; becomes `X-Payment-From`.
    pub buyer: String,
    /// Request reference; becomes `X-Payment-Ref` and always contains the
    /// session id.
    pub reference: String,
}

/// Seller response as seen by the proxy pipeline.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub latency_ms: u64,
}

/// Forwarding failures. All variants are retryable with the next candidate.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The endpoint answered with a server error. The response is preserved
    /// for logging.
    #[error("upstream returned {status}")]
    Upstream {
        status: u16,
        response: ForwardResponse,
    },

    /// The request never completed (connect failure, timeout, bad body).
    #[error("forward transport failed: {0}")]
    Transport(String),
}

impl From<ForwardError> for GatewayError {
    fn from(_: ForwardError) -> Self {
        GatewayError::ProxyFailed
    }
}

/// Forwarding of one HTTP call to a seller endpoint.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError>;
}

/// Configuration for the HTTP forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Per-request timeout.
    ///
    /// Default: 30 seconds
    pub timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest-backed [`Forwarder`].
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Validation(format!("forwarder client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let started = Instant::now();

        let response = self
            .client
            .post(&request.endpoint)
            .header("Content-Type", "application/json")
            .header("X-Payment-Amount", request.amount.to_string())
            .header("X-Payment-From", &request.buyer)
            .header("X-Payment-Ref", &request.reference)
            .json(&request.params)
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = read_capped_body(response).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let forward_response = ForwardResponse {
            status,
            body,
            latency_ms,
        };

        if status >= 500 {
            return Err(ForwardError::Upstream {
                status,
                response: forward_response,
            });
        }
        Ok(forward_response)
    }
}

/// Reads at most [`MAX_RESPONSE_BYTES`] of the body, parsing JSON when
/// possible and wrapping anything else as `{"raw": "<text>"}`.
async fn read_capped_body(response: reqwest::Response) -> Result<serde_json::Value, ForwardError> {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ForwardError::Transport(e.to_string()))?;
        let remaining = MAX_RESPONSE_BYTES - buf.len();
        if chunk.len() >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(parse_body(&buf))
}

fn parse_body(bytes: &[u8]) -> serde_json::Value {
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "raw": String::from_utf8_lossy(bytes) }),
    }
}
