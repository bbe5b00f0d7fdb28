//! The gateway service: session lifecycle and orchestration.
//!
//! `GatewayService` is the sole mutator of session state. Every mutation
//! happens under the session's shard lock; the background timer drives
//! expiry and reconciliation through the same entry points.

mod proxy;

use crate::error::{FundsStatus, GatewayError, MoneyError};
use crate::forwarder::Forwarder;
use crate::ledger::Ledger;
use crate::model::{
    now_ns, new_session_id, valid_service_type, CreateSessionRequest, DryRunResult, ProxyRequest,
    ProxyResult, Session, SessionStatus, SingleCallRequest,
};
use crate::pending::PendingSpend;
use crate::policy::{PolicyContext, PolicyDecision, PolicyEvaluator, PolicyMode};
use crate::registry::ServiceRegistry;
use crate::resolver::Resolver;
use crate::shard::{SessionGuard, SessionLocks};
use crate::sinks::{
    ReceiptIssuer, RevenueAccumulator, TenantSettingsProvider, TransactionRecorder, WebhookEmitter,
};
use crate::store::GatewayStore;
use paygate_breaker::{BreakerConfig, CircuitBreaker};
use paygate_core::Amount;
use paygate_idempotency::{IdempotencyCache, IdempotencyConfig};
use paygate_ratelimit::{RateLimitConfig, RateLimiter};
use std::sync::Arc;
use std::time::Duration;

/// Service-level tunables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Platform fee destination. Without it, settlements never split a fee.
    pub platform_address: Option<String>,
    /// Settlement / persistence attempts before giving up.
    pub settle_max_attempts: u32,
    /// Linear backoff unit between attempts (sleep = unit * attempt).
    pub settle_backoff: Duration,
    /// Per-minute request cap applied when a session does not set one.
    pub default_rate_limit: u32,
    /// Upper bound any session's cap is clamped to.
    pub max_rate_limit: u32,
    /// Warn-at threshold applied when a session does not set one.
    pub default_warn_at_percent: u32,
    /// Expiry given to sessions minted by `single_call`.
    pub single_call_expiry_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            platform_address: None,
            settle_max_attempts: 3,
            settle_backoff: Duration::from_millis(50),
            default_rate_limit: 60,
            max_rate_limit: 1_000,
            // Warn once no more than this share of the budget remains.
            default_warn_at_percent: 20,
            single_call_expiry_secs: 300,
        }
    }
}

/// External collaborators consumed by the gateway.
pub struct Collaborators {
    pub store: Arc<dyn GatewayStore>,
    pub ledger: Arc<dyn Ledger>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub forwarder: Arc<dyn Forwarder>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub recorder: Arc<dyn TransactionRecorder>,
    pub revenue: Arc<dyn RevenueAccumulator>,
    pub receipts: Arc<dyn ReceiptIssuer>,
    pub webhooks: Arc<dyn WebhookEmitter>,
    pub tenants: Arc<dyn TenantSettingsProvider>,
}

/// The payment-proxy gateway.
pub struct GatewayService {
    pub(crate) store: Arc<dyn GatewayStore>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) resolver: Resolver,
    pub(crate) forwarder: Arc<dyn Forwarder>,
    pub(crate) policy: Arc<dyn PolicyEvaluator>,
    pub(crate) recorder: Arc<dyn TransactionRecorder>,
    pub(crate) revenue: Arc<dyn RevenueAccumulator>,
    pub(crate) receipts: Arc<dyn ReceiptIssuer>,
    pub(crate) webhooks: Arc<dyn WebhookEmitter>,
    pub(crate) tenants: Arc<dyn TenantSettingsProvider>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) limiter: RateLimiter,
    pub(crate) idem: IdempotencyCache<ProxyResult>,
    pub(crate) locks: SessionLocks,
    pub(crate) pending: PendingSpend,
    pub(crate) config: GatewayConfig,
}

impl GatewayService {
    /// Builds a service with default component configurations.
    pub fn new(collaborators: Collaborators, config: GatewayConfig) -> Self {
        Self::with_components(
            collaborators,
            config,
            CircuitBreaker::new(BreakerConfig::default()),
            RateLimiter::new(RateLimitConfig::default()),
            IdempotencyCache::new(IdempotencyConfig::default()),
        )
    }

    /// Builds a service with explicitly configured components.
    pub fn with_components(
        collaborators: Collaborators,
        config: GatewayConfig,
        breaker: CircuitBreaker,
        limiter: RateLimiter,
        idem: IdempotencyCache<ProxyResult>,
    ) -> Self {
        Self {
            store: collaborators.store,
            ledger: collaborators.ledger,
            resolver: Resolver::new(collaborators.registry),
            forwarder: collaborators.forwarder,
            policy: collaborators.policy,
            recorder: collaborators.recorder,
            revenue: collaborators.revenue,
            receipts: collaborators.receipts,
            webhooks: collaborators.webhooks,
            tenants: collaborators.tenants,
            breaker,
            limiter,
            idem,
            locks: SessionLocks::new(),
            pending: PendingSpend::new(),
            config,
        }
    }

    /// The durable store, shared with the timer.
    pub fn store(&self) -> Arc<dyn GatewayStore> {
        Arc::clone(&self.store)
    }

    /// The ledger, shared with the startup reconciler.
    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Sweeps the idempotency cache and the rate limiter. Timer entry point.
    pub fn sweep_components(&self) -> (usize, usize) {
        (self.idem.sweep(), self.limiter.sweep())
    }

    /// Opens a budgeted session: hold first, persist second.
    ///
    /// Ordering is the crash-safety contract. A failed hold changes nothing.
    /// A failed persist after a successful hold attempts a release, and a
    /// double failure surfaces as a `held_pending` money error carrying the
    /// session id as the reconciliation reference.
    pub async fn create_session(
        &self,
        buyer: &str,
        tenant_id: Option<&str>,
        req: CreateSessionRequest,
    ) -> Result<Session, GatewayError> {
        if buyer.trim().is_empty() {
            return Err(GatewayError::Validation("buyer is required".into()));
        }
        if req.max_total.is_zero() {
            return Err(GatewayError::Validation("max_total must be positive".into()));
        }
        if req.max_per_request.is_zero() {
            return Err(GatewayError::Validation(
                "max_per_request must be positive".into(),
            ));
        }
        if let Some(types) = &req.allowed_service_types {
            if types.len() > 100 {
                return Err(GatewayError::Validation(
                    "at most 100 allowed service types".into(),
                ));
            }
            for service_type in types {
                if !valid_service_type(service_type) {
                    return Err(GatewayError::Validation(format!(
                        "invalid service type {service_type:?}"
                    )));
                }
            }
        }
        if req.expires_in_secs != 0 && !(60..=86_400).contains(&req.expires_in_secs) {
            return Err(GatewayError::Validation(
                "expires_in_secs must be 0 or between 60 and 86400".into(),
            ));
        }
        if let Some(warn) = req.warn_at_percent {
            if !(1..=100).contains(&warn) {
                return Err(GatewayError::Validation(
                    "warn_at_percent must be between 1 and 100".into(),
                ));
            }
        }

        let rate_limit = req
            .rate_limit_per_minute
            .unwrap_or(self.config.default_rate_limit)
            .clamp(1, self.config.max_rate_limit);

        if let Some(tenant) = tenant_id {
            let status = self
                .tenants
                .tenant_status(tenant)
                .await
                .map_err(|e| GatewayError::PolicyEvaluation(format!("tenant status: {e}")))?;
            if status.is_blocked() {
                return Err(GatewayError::TenantSuspended {
                    tenant_id: tenant.to_string(),
                });
            }
        }

        // Session-creation policy check runs with an empty service type.
        let ctx = PolicyContext {
            buyer: buyer.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            service_type: String::new(),
            amount: req.max_total,
            total_spent: Amount::ZERO,
            max_total: req.max_total,
            request_count: 0,
        };
        match self.evaluate_policy(&ctx).await {
            PolicyOutcome::Allowed(_) | PolicyOutcome::Shadow(_) => {}
            PolicyOutcome::DeniedWith(_, err) | PolicyOutcome::FailedWith(err) => return Err(err),
        }

        let now = now_ns();
        let session = Session {
            id: new_session_id(),
            buyer: buyer.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            max_total: req.max_total,
            max_per_request: req.max_per_request,
            total_spent: Amount::ZERO,
            request_count: 0,
            strategy: req.strategy.unwrap_or_default(),
            allowed_service_types: req.allowed_service_types,
            warn_at_percent: req
                .warn_at_percent
                .unwrap_or(self.config.default_warn_at_percent),
            rate_limit_per_minute: rate_limit,
            status: SessionStatus::Active,
            expires_at_ns: if req.expires_in_secs > 0 {
                now + (req.expires_in_secs as i64) * 1_000_000_000
            } else {
                0
            },
            created_at_ns: now,
            updated_at_ns: now,
        };

        self.ledger
            .hold(buyer, session.max_total, &session.id)
            .await
            .map_err(|e| {
                MoneyError::new(
                    format!("hold failed: {e}"),
                    FundsStatus::NoChange,
                    "no funds moved; the request can be retried",
                    session.max_total,
                    &session.id,
                )
            })?;

        if let Err(store_err) = self.store.create_session(&session).await {
            return Err(match self
                .ledger
                .release_hold(buyer, session.max_total, &session.id)
                .await
            {
                Ok(()) => MoneyError::new(
                    format!("session persistence failed: {store_err}"),
                    FundsStatus::NoChange,
                    "hold was released; the request can be retried",
                    session.max_total,
                    &session.id,
                )
                .into(),
                Err(release_err) => MoneyError::new(
                    format!(
                        "session persistence failed: {store_err}; release failed: {release_err}"
                    ),
                    FundsStatus::HeldPending,
                    "funds remain held; startup reconciliation will release them",
                    session.max_total,
                    &session.id,
                )
                .into(),
            });
        }

        tracing::info!(
            session_id = %session.id,
            buyer = %session.buyer,
            max_total = %session.max_total,
            expires_at = session.expires_at_ns,
            "session opened"
        );
        Ok(session)
    }

    /// Closes a session on the buyer's request and releases the unused hold.
    ///
    /// Idempotent on closed/expired sessions. A `settlement_failed` session is
    /// closeable: this is how the reconcile sweep consumes the sentinel.
    pub async fn close_session(
        &self,
        session_id: &str,
        caller: &str,
    ) -> Result<Session, GatewayError> {
        self.finalize_session(session_id, Some(caller), SessionStatus::Closed)
            .await
    }

    /// Timer entry point: closes an expired session with terminal status
    /// `expired`. No-op unless the session is still active.
    pub async fn auto_close_expired(&self, session_id: &str) -> Result<Session, GatewayError> {
        self.finalize_session(session_id, None, SessionStatus::Expired)
            .await
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        caller: Option<&str>,
        terminal: SessionStatus,
    ) -> Result<Session, GatewayError> {
        let guard = self.locks.acquire(session_id).await;
        let mut session = self.store.get_session(session_id).await?;

        if let Some(caller) = caller {
            if !caller.eq_ignore_ascii_case(&session.buyer) {
                return Err(GatewayError::OwnerMismatch);
            }
        }

        let proceed = match session.status {
            SessionStatus::Active => true,
            // Reconciliation: an explicit close consumes the sentinel.
            SessionStatus::SettlementFailed => caller.is_some(),
            SessionStatus::Closed | SessionStatus::Expired => false,
        };
        if !proceed {
            return Ok(session);
        }

        let pending = self.pending.get(session_id);
        let unused = session
            .max_total
            .saturating_sub(session.total_spent)
            .saturating_sub(pending);

        if !unused.is_zero() {
            self.ledger
                .release_hold(&session.buyer, unused, session_id)
                .await
                .map_err(|e| {
                    MoneyError::new(
                        format!("release failed: {e}"),
                        FundsStatus::HeldPending,
                        "unused funds remain held; retry the close or wait for reconciliation",
                        unused,
                        session_id,
                    )
                })?;
        }

        if pending.is_zero() {
            self.pending.clear(session_id);
        }
        self.limiter.remove(session_id);

        session.status = terminal;
        session.updated_at_ns = now_ns();

        let (guard, persisted) = self.persist_with_retry(guard, &session).await;
        let _guard = guard;
        match persisted {
            Ok(()) => {
                tracing::info!(
                    session_id,
                    status = terminal.as_str(),
                    released = %unused,
                    "session finalized"
                );
                Ok(session)
            }
            Err(err) => {
                // Funds already moved; only the status write is stuck. The
                // sentinel keeps the expiry sweep from re-releasing.
                session.status = SessionStatus::SettlementFailed;
                if let Err(mark_err) = self.store.update_session(&session).await {
                    tracing::error!(
                        session_id,
                        error = %mark_err,
                        "failed to mark session settlement_failed"
                    );
                }
                Err(MoneyError::new(
                    format!("status persistence failed: {err}"),
                    FundsStatus::SettledSafe,
                    "funds are settled correctly; session status will be repaired by reconciliation",
                    unused,
                    session_id,
                )
                .into())
            }
        }
    }

    /// Convenience composition: open a throwaway session sized for one call,
    /// proxy it, and close. The close runs regardless of the proxy outcome so
    /// a failed call still releases its hold.
    pub async fn single_call(
        &self,
        buyer: &str,
        tenant_id: Option<&str>,
        req: SingleCallRequest,
    ) -> Result<ProxyResult, GatewayError> {
        let session = self
            .create_session(
                buyer,
                tenant_id,
                CreateSessionRequest {
                    max_total: req.max_price,
                    max_per_request: req.max_price,
                    strategy: None,
                    allowed_service_types: None,
                    warn_at_percent: None,
                    rate_limit_per_minute: None,
                    expires_in_secs: self.config.single_call_expiry_secs,
                },
            )
            .await?;

        let proxy_result = self
            .proxy(
                &session.id,
                ProxyRequest {
                    service_type: req.service_type,
                    params: req.params,
                    idempotency_key: None,
                    prefer_agent: req.prefer_agent,
                },
            )
            .await;

        if let Err(close_err) = self.close_session(&session.id, buyer).await {
            tracing::warn!(
                session_id = %session.id,
                error = %close_err,
                "single-call session close failed"
            );
        }

        proxy_result
    }

    /// Read-only preflight. Takes no locks and mutates nothing.
    pub async fn dry_run(
        &self,
        session_id: &str,
        req: &ProxyRequest,
    ) -> Result<DryRunResult, GatewayError> {
        let session = self.store.get_session(session_id).await?;
        let pending = self.pending.get(session_id);
        let remaining = session
            .max_total
            .saturating_sub(session.total_spent)
            .saturating_sub(pending);

        let mut result = DryRunResult {
            allowed: true,
            deny_reason: None,
            budget_ok: true,
            remaining,
            service_found: false,
            best_price: None,
            best_service: None,
            policy_result: None,
        };
        let deny = |result: &mut DryRunResult, reason: &str| {
            if result.allowed {
                result.allowed = false;
                result.deny_reason = Some(reason.to_string());
            }
        };

        if !valid_service_type(&req.service_type) {
            deny(&mut result, "invalid service type");
        }
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Closed | SessionStatus::SettlementFailed => {
                deny(&mut result, "session closed")
            }
            SessionStatus::Expired => deny(&mut result, "session expired"),
        }
        if session.is_expired(now_ns()) {
            deny(&mut result, "session expired");
        }
        if let Some(tenant) = &session.tenant_id {
            match self.tenants.tenant_status(tenant).await {
                Ok(status) if status.is_blocked() => deny(&mut result, "tenant suspended"),
                Ok(_) => {}
                Err(_) => deny(&mut result, "tenant status unavailable"),
            }
        }
        if !session.allows_service_type(&req.service_type) {
            deny(&mut result, "service type not allowed for this session");
        }

        let ctx = PolicyContext {
            buyer: session.buyer.clone(),
            tenant_id: session.tenant_id.clone(),
            service_type: req.service_type.clone(),
            amount: session.max_per_request,
            total_spent: session.total_spent.checked_add(pending).unwrap_or(session.total_spent),
            max_total: session.max_total,
            request_count: session.request_count,
        };
        match self.policy.evaluate(&ctx).await {
            Ok(decision) => {
                if !decision.allowed && decision.mode == PolicyMode::Enforce {
                    deny(&mut result, "denied by policy");
                }
                result.policy_result = Some(decision);
            }
            Err(err) => {
                result.policy_result = err.decision.clone();
                deny(&mut result, "policy evaluation failed");
            }
        }

        match self
            .resolver
            .resolve(
                &req.service_type,
                session.strategy,
                session.max_per_request,
                req.prefer_agent.as_deref(),
            )
            .await
        {
            Ok(candidates) => {
                let best = &candidates[0];
                result.service_found = true;
                result.best_price = Some(best.price);
                result.best_service = Some(best.service_id.clone());
                if best.price > remaining {
                    result.budget_ok = false;
                    deny(&mut result, "budget exceeded");
                }
            }
            Err(_) => {
                deny(&mut result, "no service available");
            }
        }

        Ok(result)
    }

    /// Persists a session with bounded retries, sleeping with the shard lock
    /// released so co-sharded sessions are not blocked by the backoff. The
    /// guard travels through so the caller keeps holding the shard afterwards.
    pub(crate) async fn persist_with_retry(
        &self,
        mut guard: SessionGuard,
        session: &Session,
    ) -> (SessionGuard, Result<(), GatewayError>) {
        let mut attempt = 1u32;
        loop {
            match self.store.update_session(session).await {
                Ok(()) => return (guard, Ok(())),
                Err(err) if attempt < self.config.settle_max_attempts => {
                    tracing::warn!(
                        session_id = %session.id,
                        attempt,
                        error = %err,
                        "session persistence failed; retrying"
                    );
                    guard = self.unlocked_backoff(guard, &session.id, attempt).await;
                    attempt += 1;
                }
                Err(err) => return (guard, Err(err.into())),
            }
        }
    }

    /// Drops the shard lock, sleeps the linear backoff for `attempt`, and
    /// reacquires.
    pub(crate) async fn unlocked_backoff(
        &self,
        guard: SessionGuard,
        session_id: &str,
        attempt: u32,
    ) -> SessionGuard {
        drop(guard);
        tokio::time::sleep(self.config.settle_backoff * attempt).await;
        self.locks.acquire(session_id).await
    }

    pub(crate) async fn evaluate_policy(&self, ctx: &PolicyContext) -> PolicyOutcome {
        match self.policy.evaluate(ctx).await {
            Ok(decision) if decision.allowed => PolicyOutcome::Allowed(decision),
            Ok(decision) => match decision.mode {
                PolicyMode::Shadow => PolicyOutcome::Shadow(decision),
                PolicyMode::Enforce => {
                    let err = GatewayError::PolicyDenied {
                        rule: decision.rule.clone().unwrap_or_default(),
                        reason: decision.reason.clone().unwrap_or_default(),
                    };
                    PolicyOutcome::DeniedWith(decision, err)
                }
            },
            Err(err) => match err.decision {
                // An error that still carries a decision is that denial.
                Some(decision) => {
                    let gateway_err = GatewayError::PolicyDenied {
                        rule: decision.rule.clone().unwrap_or_default(),
                        reason: decision.reason.clone().unwrap_or_default(),
                    };
                    PolicyOutcome::DeniedWith(decision, gateway_err)
                }
                // Fail closed on a bare evaluator crash.
                None => PolicyOutcome::FailedWith(GatewayError::PolicyEvaluation(err.message)),
            },
        }
    }
}

/// Internal policy evaluation outcome.
pub(crate) enum PolicyOutcome {
    Allowed(PolicyDecision),
    Shadow(PolicyDecision),
    DeniedWith(PolicyDecision, GatewayError),
    FailedWith(GatewayError),
}
