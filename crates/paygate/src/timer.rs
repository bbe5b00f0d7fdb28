//! Background lifecycle driver.
//!
//! One task owns every periodic duty: draining expired sessions, sweeping the
//! idempotency cache and rate limiter, and (on a slower cadence) reconciling
//! `settlement_failed` sessions. Each tick's work runs on a spawned task so a
//! panic in one sweep is contained and the loop keeps running.

use crate::model::{now_ns, SessionStatus};
use crate::service::GatewayService;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Timer cadence configuration.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Tick interval.
    ///
    /// Default: 30 seconds
    pub interval: Duration,
    /// Expired sessions processed per store query.
    pub expiry_batch: usize,
    /// How often the `settlement_failed` reconcile pass runs.
    ///
    /// Default: 5 minutes
    pub reconcile_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            expiry_batch: 100,
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

/// Periodic sweeper over a [`GatewayService`].
pub struct GatewayTimer {
    service: Arc<GatewayService>,
    config: TimerConfig,
}

impl GatewayTimer {
    pub fn new(service: Arc<GatewayService>, config: TimerConfig) -> Self {
        Self { service, config }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_reconcile = Instant::now();

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "gateway timer starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway timer stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let reconcile = last_reconcile.elapsed() >= self.config.reconcile_interval;
            if reconcile {
                last_reconcile = Instant::now();
            }

            let service = Arc::clone(&self.service);
            let config = self.config.clone();
            let handle = tokio::spawn(async move {
                run_tick(service, config, reconcile).await;
            });
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    tracing::error!("timer sweep panicked; continuing");
                }
            }
        }
    }

    /// Runs one tick inline. Test entry point.
    pub async fn tick_once(&self, reconcile: bool) {
        run_tick(Arc::clone(&self.service), self.config.clone(), reconcile).await;
    }
}

async fn run_tick(service: Arc<GatewayService>, config: TimerConfig, reconcile: bool) {
    sweep_expired(&service, &config).await;

    let (idem_swept, limiter_swept) = service.sweep_components();
    if idem_swept > 0 || limiter_swept > 0 {
        tracing::debug!(idem_swept, limiter_swept, "component caches swept");
    }

    if reconcile {
        reconcile_settlement_failed(&service, &config).await;
    }
}

/// Drains expired sessions in batches until a short batch comes back. Bails
/// out of the tick when a whole batch fails to make progress, so a stuck
/// ledger cannot spin this loop forever.
async fn sweep_expired(service: &GatewayService, config: &TimerConfig) {
    let now = now_ns();
    loop {
        let batch = match service.store().list_expired(now, config.expiry_batch).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error = %err, "expiry sweep query failed");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        let batch_len = batch.len();
        let mut closed = 0usize;
        for session in batch {
            match service.auto_close_expired(&session.id).await {
                Ok(_) => closed += 1,
                Err(err) => {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "auto-close failed"
                    );
                }
            }
        }
        tracing::info!(expired = batch_len, closed, "expiry sweep batch processed");

        if closed == 0 || batch_len < config.expiry_batch {
            return;
        }
    }
}

/// The reconcile pass: `settlement_failed` sessions are closed on the buyer's
/// behalf, releasing whatever the store says is still unused.
async fn reconcile_settlement_failed(service: &GatewayService, config: &TimerConfig) {
    let stuck = match service
        .store()
        .list_by_status(SessionStatus::SettlementFailed, config.expiry_batch)
        .await
    {
        Ok(stuck) => stuck,
        Err(err) => {
            tracing::warn!(error = %err, "reconcile sweep query failed");
            return;
        }
    };
    if stuck.is_empty() {
        return;
    }

    tracing::info!(count = stuck.len(), "reconciling settlement_failed sessions");
    for session in stuck {
        match service.close_session(&session.id, &session.buyer).await {
            Ok(_) => {
                tracing::info!(session_id = %session.id, "settlement_failed session reconciled");
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "settlement_failed reconcile attempt failed"
                );
            }
        }
    }
}
