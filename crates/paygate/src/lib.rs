//! Transparent payment-proxy gateway.
//!
//! A buyer opens a budgeted **session** that pre-holds funds in an external
//! ledger. Proxy calls discover candidate seller services, forward the HTTP
//! payload, and settle payment from the buyer's hold to the seller that
//! delivered. The gateway guarantees at-most-one payment per delivered
//! response, bounded buyer spend, and eventual release of unused holds.
//!
//! # Architecture
//!
//! Data flows leaves-first: the ledger and store sit under the resolver,
//! forwarder, idempotency cache, rate limiter, and circuit breaker, which the
//! [`GatewayService`] orchestrates; the [`GatewayTimer`] drives background
//! lifecycle (expiry, cache sweeps, reconciliation). The service is the sole
//! mutator of session state, always under a 256-shard session lock.
//!
//! External collaborators (the ledger, service registry, policy evaluator,
//! and side-effect sinks) are consumed through traits and injected via
//! [`Collaborators`].
//!
//! # Example
//!
//! ```no_run
//! use paygate::{Collaborators, GatewayConfig, GatewayService};
//! # fn collaborators() -> Collaborators { unimplemented!() }
//!
//! # async fn run() -> Result<(), paygate::GatewayError> {
//! let gateway = GatewayService::new(collaborators(), GatewayConfig::default());
//! let session = gateway
//!     .create_session(
//!         "0xbuyer",
//!         None,
//!         paygate::CreateSessionRequest {
//!             max_total: "10.000000".parse()?,
//!             max_per_request: "1.000000".parse()?,
//!             strategy: None,
//!             allowed_service_types: None,
//!             warn_at_percent: None,
//!             rate_limit_per_minute: None,
//!             expires_in_secs: 3_600,
//!         },
//!     )
//!     .await?;
//! # let _ = session;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod forwarder;
pub mod ledger;
pub mod model;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod sinks;
pub mod store;
pub mod timer;

mod pending;
mod service;
mod shard;

pub use error::{FundsStatus, GatewayError, MoneyError};
pub use forwarder::{
    ForwardError, ForwardRequest, ForwardResponse, Forwarder, ForwarderConfig, HttpForwarder,
};
pub use ledger::{Ledger, LedgerError, OpenHold};
pub use model::{
    CreateSessionRequest, DryRunResult, LogStatus, ProxyRequest, ProxyResult, RequestLogEntry,
    Session, SessionStatus, SingleCallRequest, Strategy,
};
pub use policy::{PolicyContext, PolicyDecision, PolicyError, PolicyEvaluator, PolicyMode};
pub use reconcile::reconcile_orphan_holds;
pub use registry::{RegistryError, ServiceCandidate, ServiceRegistry};
pub use resolver::MAX_RETRIES;
pub use sinks::{
    Receipt, ReceiptIssuer, RevenueAccumulator, SinkError, TenantSettingsProvider, TenantStatus,
    TransactionRecord, TransactionRecorder, TransactionStatus, WebhookEmitter, WebhookEvent,
};
pub use service::{Collaborators, GatewayConfig, GatewayService};
pub use store::{
    BillingSummary, GatewayStore, MemoryStore, Page, PgStore, ServiceTypeUsage, StoreError,
    TimeBucket, UsagePoint,
};
pub use timer::{GatewayTimer, TimerConfig};

pub use paygate_core::{Amount, AmountError};
