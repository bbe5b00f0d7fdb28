//! The three-phase proxy pipeline: validate -> reserve -> forward -> settle.
//!
//! Locking discipline: the session's shard is held for phase 1 (validate and
//! resolve), phase 2a (policy + reserve), and phase 2c (settle + persist).
//! The HTTP forward in phase 2b always runs unlocked, and every backoff sleep
//! inside 2c drops the shard and reacquires it.
//!
//! Settlement policy is pay-first-then-respond: once a seller has delivered,
//! the pipeline never tries another candidate. If settlement exhausts its
//! retries the buyer still gets the delivered response, with
//! `amount_paid = 0.000000` and the debt surfaced out of band.

use crate::error::GatewayError;
use crate::forwarder::ForwardRequest;
use crate::model::{
    now_ns, valid_service_type, LogStatus, ProxyRequest, ProxyResult, RequestLogEntry, Session,
    SessionStatus,
};
use crate::pending::Reservation;
use crate::policy::PolicyContext;
use crate::registry::ServiceCandidate;
use crate::service::{GatewayService, PolicyOutcome};
use crate::sinks::{Receipt, TransactionRecord, TransactionStatus, WebhookEvent};
use paygate_core::Amount;
use paygate_idempotency::Acquire;
use paygate_ratelimit::RateDecision;

impl GatewayService {
    /// Proxies one call for a session, settling payment to the seller that
    /// delivered.
    pub async fn proxy(
        &self,
        session_id: &str,
        req: ProxyRequest,
    ) -> Result<ProxyResult, GatewayError> {
        // Pre-phase: cheap rejections, no lock.
        if !valid_service_type(&req.service_type) {
            return Err(GatewayError::Validation(format!(
                "invalid service type {:?}",
                req.service_type
            )));
        }

        // Unlocked read; the authoritative load happens under the lock in
        // phase 1. Here we only need existence and the rate cap.
        let session = self.store.get_session(session_id).await?;
        if let RateDecision::Denied { retry_after } = self
            .limiter
            .check(session_id, session.rate_limit_per_minute)
        {
            return Err(GatewayError::RateLimited { retry_after });
        }

        let reservation = match &req.idempotency_key {
            Some(key) => match self.idem.get_or_reserve(session_id, key).await {
                Acquire::Found(result) => return Ok(result),
                Acquire::Reserved(guard) => Some(guard),
                Acquire::Bypass => None,
            },
            None => None,
        };

        let outcome = self.proxy_inner(session_id, &req).await;

        match (&outcome, reservation) {
            (Ok(result), Some(guard)) => guard.complete(result.clone()),
            // A failed attempt is not cached: waiters wake and re-reserve so
            // a retry can succeed.
            (Err(_), Some(guard)) => guard.cancel(),
            (_, None) => {}
        }
        outcome
    }

    async fn proxy_inner(
        &self,
        session_id: &str,
        req: &ProxyRequest,
    ) -> Result<ProxyResult, GatewayError> {
        // Phase 1: validate and resolve under the lock.
        let guard = self.locks.acquire(session_id).await;
        let session = self.store.get_session(session_id).await?;
        self.ensure_proxyable(&session, &req.service_type).await?;

        let resolved = self
            .resolver
            .resolve(
                &req.service_type,
                session.strategy,
                session.max_per_request,
                req.prefer_agent.as_deref(),
            )
            .await;
        let candidates = match resolved {
            Ok(candidates) => candidates,
            Err(err) => {
                drop(guard);
                let mut entry = RequestLogEntry::for_session(&session, LogStatus::NoService);
                entry.service_type = Some(req.service_type.clone());
                entry.error = Some(err.to_string());
                self.write_log(entry).await;
                return Err(err);
            }
        };

        let buyer = session.buyer.clone();
        let tenant_id = session.tenant_id.clone();
        let max_total = session.max_total;
        let max_per_request = session.max_per_request;
        let warn_at_percent = session.warn_at_percent;
        drop(guard);

        // Phase 2: candidate loop. Breaks on the first settled response.
        let mut retries: u32 = 0;
        let mut last_err: Option<GatewayError> = None;

        for candidate in &candidates {
            // Open circuits are skipped entirely; a half-open circuit admits
            // this call as its probe.
            if !self.breaker.try_acquire(&candidate.endpoint) {
                last_err.get_or_insert(GatewayError::ProxyFailed);
                continue;
            }
            if candidate.price > max_per_request {
                continue;
            }

            // Phase 2a: policy on the projected session, then reserve.
            let guard = self.locks.acquire(session_id).await;
            let session = self.store.get_session(session_id).await?;
            if session.status != SessionStatus::Active {
                return Err(match session.status {
                    SessionStatus::Expired => GatewayError::SessionExpired,
                    _ => GatewayError::SessionClosed,
                });
            }

            let pending = self.pending.get(session_id);
            let projected_spent = session
                .total_spent
                .checked_add(pending)
                .unwrap_or(session.total_spent);
            let ctx = PolicyContext {
                buyer: buyer.clone(),
                tenant_id: tenant_id.clone(),
                service_type: req.service_type.clone(),
                amount: candidate.price,
                total_spent: projected_spent,
                max_total,
                request_count: session.request_count,
            };
            match self.evaluate_policy(&ctx).await {
                PolicyOutcome::Allowed(_) => {}
                PolicyOutcome::Shadow(decision) => {
                    // Observability only: record the would-be denial and
                    // proceed with this candidate.
                    let mut entry =
                        RequestLogEntry::for_session(&session, LogStatus::ShadowDenied);
                    entry.service_type = Some(req.service_type.clone());
                    entry.policy_decision = Some(decision.to_log_json());
                    self.write_log(entry).await;
                }
                PolicyOutcome::DeniedWith(decision, err) => {
                    drop(guard);
                    let mut entry =
                        RequestLogEntry::for_session(&session, LogStatus::PolicyDenied);
                    entry.service_type = Some(req.service_type.clone());
                    entry.policy_decision = Some(decision.to_log_json());
                    entry.error = Some(err.to_string());
                    self.write_log(entry).await;
                    return Err(err);
                }
                PolicyOutcome::FailedWith(err) => {
                    drop(guard);
                    let mut entry = RequestLogEntry::for_session(&session, LogStatus::PolicyError);
                    entry.service_type = Some(req.service_type.clone());
                    entry.error = Some(err.to_string());
                    self.write_log(entry).await;
                    return Err(err);
                }
            }

            let remaining = max_total
                .saturating_sub(session.total_spent)
                .saturating_sub(pending);
            if candidate.price > remaining {
                last_err = Some(GatewayError::BudgetExceeded {
                    requested: candidate.price,
                    remaining,
                });
                drop(guard);
                continue;
            }
            // The guard releases the reservation even if this future is
            // dropped mid-flight; completed paths finish it explicitly.
            let reservation = self.pending.reserve_guarded(session_id, candidate.price);
            drop(guard);

            // Phases 2b + 2c for this candidate.
            match self
                .attempt_candidate(
                    session_id,
                    req,
                    candidate,
                    reservation,
                    &buyer,
                    tenant_id.as_deref(),
                    max_total,
                    warn_at_percent,
                    &mut retries,
                    &mut last_err,
                )
                .await?
            {
                Some(result) => return Ok(result),
                None => continue,
            }
        }

        // Loop exhausted without a settlement. Budget and money errors keep
        // their specific shape; plain forward failures collapse to
        // ProxyFailed.
        Err(last_err.unwrap_or(GatewayError::ProxyFailed))
    }

    /// Forwards to one candidate and settles on success. The reservation for
    /// `candidate.price` is held on entry and always released before return.
    ///
    /// Returns `Ok(Some(result))` when the call completes (including the
    /// settlement-failed success shape), `Ok(None)` to advance to the next
    /// candidate, and `Err` to abort the loop.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_candidate(
        &self,
        session_id: &str,
        req: &ProxyRequest,
        candidate: &ServiceCandidate,
        reservation: Reservation<'_>,
        buyer: &str,
        tenant_id: Option<&str>,
        max_total: Amount,
        warn_at_percent: u32,
        retries: &mut u32,
        last_err: &mut Option<GatewayError>,
    ) -> Result<Option<ProxyResult>, GatewayError> {
        // Phase 2b: forward without the lock.
        let wire_reference = format!(
            "{session_id}:req:{}:{}",
            *retries, candidate.service_id
        );
        let forward_req = ForwardRequest {
            endpoint: candidate.endpoint.clone(),
            params: req.params.clone(),
            amount: candidate.price,
            buyer: buyer.to_string(),
            reference: wire_reference.clone(),
        };

        let response = match self.forwarder.forward(&forward_req).await {
            Ok(response) => {
                self.breaker.record_success(&candidate.endpoint);
                response
            }
            Err(err) => {
                self.breaker.record_failure(&candidate.endpoint);

                let guard = self.locks.acquire(session_id).await;
                reservation.finish();
                drop(guard);

                let session_view = self.store.get_session(session_id).await;
                if let Ok(session) = &session_view {
                    let mut entry =
                        RequestLogEntry::for_session(session, LogStatus::ForwardFailed);
                    entry.service_type = Some(req.service_type.clone());
                    entry.called_agent = Some(candidate.agent.clone());
                    entry.error = Some(err.to_string());
                    self.write_log(entry).await;
                }
                self.record_transaction(TransactionRecord {
                    session_id: session_id.to_string(),
                    reference: wire_reference,
                    buyer: buyer.to_string(),
                    seller: candidate.agent.clone(),
                    amount: candidate.price,
                    platform_fee: Amount::ZERO,
                    service_type: req.service_type.clone(),
                    status: TransactionStatus::Failed,
                    error: Some(err.to_string()),
                    created_at_ns: now_ns(),
                })
                .await;

                tracing::warn!(
                    session_id,
                    endpoint = %candidate.endpoint,
                    error = %err,
                    "forward failed; trying next candidate"
                );
                *retries += 1;
                *last_err = Some(GatewayError::ProxyFailed);
                return Ok(None);
            }
        };

        // Phase 2c: settle under the lock, authoritative state.
        let mut guard = self.locks.acquire(session_id).await;
        let mut session = match self.store.get_session(session_id).await {
            Ok(session) => session,
            Err(err) => {
                reservation.finish();
                return Err(err.into());
            }
        };
        // Closed/expired mid-flight stays settleable: close and auto-close
        // account for in-flight reservations when they release.
        if !matches!(
            session.status,
            SessionStatus::Active | SessionStatus::Closed | SessionStatus::Expired
        ) {
            reservation.finish();
            return Err(GatewayError::SessionClosed);
        }

        let reference = format!(
            "{session_id}:req:{}:{}",
            session.request_count + 1,
            candidate.service_id
        );

        let bps = match self.tenants.take_rate_bps(tenant_id).await {
            Ok(bps) => bps,
            Err(err) => {
                tracing::warn!(session_id, error = %err, "take-rate lookup failed; fee waived");
                0
            }
        };
        let (fee, _seller_share) = candidate.price.fee_split(bps);
        let platform_fee = match &self.config.platform_address {
            Some(_) if !fee.is_zero() => fee,
            _ => Amount::ZERO,
        };

        let mut attempt = 1u32;
        let settle_err = loop {
            let result = match (&self.config.platform_address, platform_fee.is_zero()) {
                (Some(platform), false) => {
                    self.ledger
                        .settle_hold_with_fee(
                            buyer,
                            &candidate.agent,
                            candidate.price,
                            platform_fee,
                            platform,
                            &reference,
                        )
                        .await
                }
                _ => {
                    self.ledger
                        .settle_hold(buyer, &candidate.agent, candidate.price, &reference)
                        .await
                }
            };
            match result {
                Ok(()) => break None,
                Err(err) if attempt < self.config.settle_max_attempts => {
                    tracing::warn!(
                        session_id,
                        attempt,
                        error = %err,
                        "settlement failed; retrying"
                    );
                    guard = self.unlocked_backoff(guard, session_id, attempt).await;
                    attempt += 1;
                }
                Err(err) => break Some(err),
            }
        };

        if let Some(err) = settle_err {
            // The seller delivered; refusing the response or re-forwarding to
            // another candidate would be worse than the unpaid debt. Surface
            // the debt out of band and hand the buyer the response unpaid.
            reservation.finish();
            let total_spent = session.total_spent;
            let request_count = session.request_count;
            drop(guard);

            let mut entry = RequestLogEntry::for_session(&session, LogStatus::SettlementFailed);
            entry.service_type = Some(req.service_type.clone());
            entry.called_agent = Some(candidate.agent.clone());
            entry.error = Some(err.to_string());
            entry.latency_ms = response.latency_ms;
            self.write_log(entry).await;

            if let Err(webhook_err) = self
                .webhooks
                .emit(&WebhookEvent::SettlementFailed {
                    session_id: session_id.to_string(),
                    reference: reference.clone(),
                    amount: candidate.price,
                    error: err.to_string(),
                })
                .await
            {
                tracing::warn!(session_id, error = %webhook_err, "settlement-failed webhook failed");
            }

            tracing::error!(
                session_id,
                reference = %reference,
                amount = %candidate.price,
                error = %err,
                "settlement exhausted retries; returning unpaid response"
            );

            let remaining = max_total
                .saturating_sub(total_spent)
                .saturating_sub(self.pending.get(session_id));
            return Ok(Some(ProxyResult {
                session_id: session_id.to_string(),
                request_reference: reference,
                service_used: candidate.agent.clone(),
                endpoint: candidate.endpoint.clone(),
                amount_paid: Amount::ZERO,
                platform_fee: Amount::ZERO,
                total_spent,
                remaining,
                request_count,
                retries: *retries,
                budget_low: budget_low(max_total, total_spent, warn_at_percent),
                response: response.body,
                latency_ms: response.latency_ms,
            }));
        }

        // Settled: fold the reservation into the authoritative totals.
        session.total_spent = session
            .total_spent
            .checked_add(candidate.price)
            .map_err(|e| GatewayError::Validation(format!("spend accounting overflow: {e}")))?;
        session.request_count += 1;
        session.updated_at_ns = now_ns();
        reservation.finish();

        let (guard, persisted) = self.persist_with_retry(guard, &session).await;
        if let Err(persist_err) = persisted {
            // Funds moved but the row is stale. The sentinel keeps the expiry
            // sweep from releasing already-settled funds; reconciliation
            // repairs the status later.
            session.status = SessionStatus::SettlementFailed;
            if let Err(mark_err) = self.store.update_session(&session).await {
                tracing::error!(
                    session_id,
                    error = %mark_err,
                    "failed to mark session settlement_failed after persist failure"
                );
            }
            tracing::error!(
                session_id,
                error = %persist_err,
                "session persistence failed after settlement; sentinel set"
            );
        }
        drop(guard);

        // Step 7: fire-and-forget side effects, no lock.
        let mut entry = RequestLogEntry::for_session(&session, LogStatus::Success);
        entry.service_type = Some(req.service_type.clone());
        entry.called_agent = Some(candidate.agent.clone());
        entry.amount = candidate.price;
        entry.platform_fee = platform_fee;
        entry.latency_ms = response.latency_ms;
        self.write_log(entry).await;

        self.record_transaction(TransactionRecord {
            session_id: session_id.to_string(),
            reference: reference.clone(),
            buyer: buyer.to_string(),
            seller: candidate.agent.clone(),
            amount: candidate.price,
            platform_fee,
            service_type: req.service_type.clone(),
            status: TransactionStatus::Confirmed,
            error: None,
            created_at_ns: now_ns(),
        })
        .await;

        if let Err(err) = self
            .receipts
            .issue(&Receipt {
                session_id: session_id.to_string(),
                reference: reference.clone(),
                buyer: buyer.to_string(),
                seller: candidate.agent.clone(),
                amount: candidate.price,
                service_type: req.service_type.clone(),
                created_at_ns: now_ns(),
            })
            .await
        {
            tracing::warn!(session_id, error = %err, "receipt issuance failed");
        }

        if !platform_fee.is_zero() {
            if let Err(err) = self.revenue.add(tenant_id, platform_fee).await {
                tracing::warn!(session_id, error = %err, "revenue accumulation failed");
            }
        }

        if let Err(err) = self
            .webhooks
            .emit(&WebhookEvent::PaymentCompleted {
                session_id: session_id.to_string(),
                reference: reference.clone(),
                amount: candidate.price,
                platform_fee,
                seller: candidate.agent.clone(),
                service_type: req.service_type.clone(),
            })
            .await
        {
            tracing::warn!(session_id, error = %err, "payment webhook failed");
        }

        let remaining = max_total
            .saturating_sub(session.total_spent)
            .saturating_sub(self.pending.get(session_id));
        Ok(Some(ProxyResult {
            session_id: session_id.to_string(),
            request_reference: reference,
            service_used: candidate.agent.clone(),
            endpoint: candidate.endpoint.clone(),
            amount_paid: candidate.price,
            platform_fee,
            total_spent: session.total_spent,
            remaining,
            request_count: session.request_count,
            retries: *retries,
            budget_low: budget_low(max_total, session.total_spent, warn_at_percent),
            response: response.body,
            latency_ms: response.latency_ms,
        }))
    }

    /// Phase-1 admission checks.
    async fn ensure_proxyable(
        &self,
        session: &Session,
        service_type: &str,
    ) -> Result<(), GatewayError> {
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Expired => return Err(GatewayError::SessionExpired),
            SessionStatus::Closed | SessionStatus::SettlementFailed => {
                return Err(GatewayError::SessionClosed)
            }
        }
        if session.is_expired(now_ns()) {
            return Err(GatewayError::SessionExpired);
        }
        if let Some(tenant) = &session.tenant_id {
            let status = self
                .tenants
                .tenant_status(tenant)
                .await
                .map_err(|e| GatewayError::PolicyEvaluation(format!("tenant status: {e}")))?;
            if status.is_blocked() {
                return Err(GatewayError::TenantSuspended {
                    tenant_id: tenant.clone(),
                });
            }
        }
        if !session.allows_service_type(service_type) {
            return Err(GatewayError::Validation(format!(
                "service type {service_type:?} not allowed for this session"
            )));
        }
        Ok(())
    }

    pub(crate) async fn write_log(&self, entry: RequestLogEntry) {
        if let Err(err) = self.store.create_log(&entry).await {
            tracing::warn!(
                session_id = %entry.session_id,
                error = %err,
                "request log write failed"
            );
        }
    }

    async fn record_transaction(&self, record: TransactionRecord) {
        if let Err(err) = self.recorder.record(&record).await {
            tracing::warn!(
                session_id = %record.session_id,
                error = %err,
                "transaction recorder failed"
            );
        }
    }
}

/// True once spend has crossed the warn-at threshold: the session warns when
/// no more than `warn_at_percent` percent of budget remains.
fn budget_low(max_total: Amount, total_spent: Amount, warn_at_percent: u32) -> bool {
    if max_total.is_zero() {
        return false;
    }
    let threshold = max_total.percent(100u32.saturating_sub(warn_at_percent.min(100)));
    total_spent >= threshold
}
