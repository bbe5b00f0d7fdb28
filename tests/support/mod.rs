//! Shared mock collaborators for gateway integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use paygate::{
    Amount, Collaborators, ForwardError, ForwardRequest, ForwardResponse, Forwarder,
    GatewayConfig, GatewayService, Ledger, LedgerError, MemoryStore, OpenHold, PolicyContext,
    PolicyDecision, PolicyError, PolicyEvaluator, PolicyMode, Receipt, ReceiptIssuer,
    RegistryError, RevenueAccumulator, ServiceCandidate, ServiceRegistry, SinkError,
    TenantSettingsProvider, TenantStatus, TransactionRecord, TransactionRecorder,
    TransactionStatus, WebhookEmitter, WebhookEvent,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn amount(s: &str) -> Amount {
    s.parse().expect("test amount")
}

/// One recorded ledger operation.
#[derive(Debug, Clone)]
pub enum LedgerOp {
    Hold {
        buyer: String,
        amount: Amount,
        reference: String,
    },
    Settle {
        buyer: String,
        seller: String,
        amount: Amount,
        fee: Amount,
        platform: Option<String>,
        reference: String,
    },
    Release {
        buyer: String,
        amount: Amount,
        reference: String,
    },
}

/// Recording ledger with failure injection.
#[derive(Default)]
pub struct MockLedger {
    ops: Mutex<Vec<LedgerOp>>,
    injected_holds: Mutex<Vec<OpenHold>>,
    fail_hold: AtomicBool,
    fail_release: AtomicBool,
    /// Number of upcoming settle attempts that fail; u32::MAX = always.
    settle_failures: AtomicU32,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_hold(&self, fail: bool) {
        self.fail_hold.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn set_settle_failures(&self, count: u32) {
        self.settle_failures.store(count, Ordering::SeqCst);
    }

    /// Adds a hold the gateway never created (crash simulation).
    pub fn inject_open_hold(&self, buyer: &str, amount: Amount, reference: &str) {
        self.injected_holds.lock().push(OpenHold {
            buyer: buyer.to_string(),
            amount,
            reference: reference.to_string(),
        });
    }

    pub fn ops(&self) -> Vec<LedgerOp> {
        self.ops.lock().clone()
    }

    pub fn settlements(&self) -> Vec<LedgerOp> {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, LedgerOp::Settle { .. }))
            .cloned()
            .collect()
    }

    pub fn settled_total(&self) -> Amount {
        let mut total = Amount::ZERO;
        for op in self.ops.lock().iter() {
            if let LedgerOp::Settle { amount, .. } = op {
                total = total.checked_add(*amount).expect("settled total");
            }
        }
        total
    }

    pub fn releases(&self) -> Vec<(String, Amount, String)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                LedgerOp::Release {
                    buyer,
                    amount,
                    reference,
                } => Some((buyer.clone(), *amount, reference.clone())),
                _ => None,
            })
            .collect()
    }

    fn take_settle_failure(&self) -> bool {
        let current = self.settle_failures.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if current != u32::MAX {
            self.settle_failures.store(current - 1, Ordering::SeqCst);
        }
        true
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn hold(&self, buyer: &str, amount: Amount, reference: &str) -> Result<(), LedgerError> {
        if self.fail_hold.load(Ordering::SeqCst) {
            return Err(LedgerError("hold rejected".into()));
        }
        self.ops.lock().push(LedgerOp::Hold {
            buyer: buyer.to_string(),
            amount,
            reference: reference.to_string(),
        });
        Ok(())
    }

    async fn settle_hold(
        &self,
        buyer: &str,
        seller: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        if self.take_settle_failure() {
            return Err(LedgerError("settle rejected".into()));
        }
        self.ops.lock().push(LedgerOp::Settle {
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            amount,
            fee: Amount::ZERO,
            platform: None,
            reference: reference.to_string(),
        });
        Ok(())
    }

    async fn settle_hold_with_fee(
        &self,
        buyer: &str,
        seller: &str,
        amount: Amount,
        fee: Amount,
        platform: &str,
        reference: &str,
    ) -> Result<(), LedgerError> {
        if self.take_settle_failure() {
            return Err(LedgerError("settle rejected".into()));
        }
        self.ops.lock().push(LedgerOp::Settle {
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            amount,
            fee,
            platform: Some(platform.to_string()),
            reference: reference.to_string(),
        });
        Ok(())
    }

    async fn release_hold(
        &self,
        buyer: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(LedgerError("release rejected".into()));
        }
        self.ops.lock().push(LedgerOp::Release {
            buyer: buyer.to_string(),
            amount,
            reference: reference.to_string(),
        });
        Ok(())
    }

    async fn open_holds(&self) -> Result<Vec<OpenHold>, LedgerError> {
        let ops = self.ops.lock();
        let mut holds: Vec<OpenHold> = self.injected_holds.lock().clone();
        for op in ops.iter() {
            if let LedgerOp::Hold {
                buyer,
                amount,
                reference,
            } = op
            {
                let settled = ops.iter().any(|o| {
                    matches!(o, LedgerOp::Settle { reference: r, .. } if r.starts_with(reference.as_str()))
                });
                let released = ops.iter().any(|o| {
                    matches!(o, LedgerOp::Release { reference: r, .. } if r == reference)
                });
                if !settled && !released {
                    holds.push(OpenHold {
                        buyer: buyer.clone(),
                        amount: *amount,
                        reference: reference.clone(),
                    });
                }
            }
        }
        Ok(holds)
    }
}

/// Registry returning a fixed candidate list.
#[derive(Default)]
pub struct MockRegistry {
    candidates: Mutex<Vec<ServiceCandidate>>,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_candidates(&self, candidates: Vec<ServiceCandidate>) {
        *self.candidates.lock() = candidates;
    }
}

#[async_trait]
impl ServiceRegistry for MockRegistry {
    async fn discover(&self, service_type: &str) -> Result<Vec<ServiceCandidate>, RegistryError> {
        Ok(self
            .candidates
            .lock()
            .iter()
            .filter(|c| c.service_type == service_type)
            .cloned()
            .collect())
    }
}

pub fn candidate(id: &str, price: &str, reputation: f64) -> ServiceCandidate {
    ServiceCandidate {
        service_id: id.to_string(),
        agent: format!("agent-{id}"),
        endpoint: format!("https://{id}.example/api"),
        price: amount(price),
        reputation,
        service_type: "inference".to_string(),
    }
}

/// Per-endpoint forwarder behavior.
#[derive(Debug, Clone)]
pub enum ForwardBehavior {
    Ok(u16, serde_json::Value),
    ServerError(u16),
    Transport,
}

/// Recording forwarder with per-endpoint behavior and optional delay.
#[derive(Default)]
pub struct MockForwarder {
    behaviors: Mutex<Vec<(String, ForwardBehavior)>>,
    requests: Mutex<Vec<ForwardRequest>>,
    delay_ms: AtomicU32,
}

impl MockForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_behavior(&self, endpoint: &str, behavior: ForwardBehavior) {
        let mut behaviors = self.behaviors.lock();
        behaviors.retain(|(existing, _)| existing != endpoint);
        behaviors.push((endpoint.to_string(), behavior));
    }

    /// Delays every forward; used to force in-flight overlap.
    pub fn set_delay_ms(&self, delay: u32) {
        self.delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Forwarder for MockForwarder {
    async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        self.requests.lock().push(request.clone());

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let behavior = self
            .behaviors
            .lock()
            .iter()
            .find(|(endpoint, _)| endpoint == &request.endpoint)
            .map(|(_, b)| b.clone())
            .unwrap_or(ForwardBehavior::Ok(200, serde_json::json!({"ok": true})));

        match behavior {
            ForwardBehavior::Ok(status, body) => Ok(ForwardResponse {
                status,
                body,
                latency_ms: 5,
            }),
            ForwardBehavior::ServerError(status) => Err(ForwardError::Upstream {
                status,
                response: ForwardResponse {
                    status,
                    body: serde_json::json!({"raw": "upstream error"}),
                    latency_ms: 5,
                },
            }),
            ForwardBehavior::Transport => {
                Err(ForwardError::Transport("connection refused".into()))
            }
        }
    }
}

/// Policy evaluator behavior.
#[derive(Debug, Clone)]
pub enum PolicyBehavior {
    Allow,
    Deny { rule: String },
    ShadowDeny { rule: String },
    FailBare,
    FailWithDenial { rule: String },
}

/// Recording policy evaluator.
pub struct MockPolicy {
    behavior: Mutex<PolicyBehavior>,
    contexts: Mutex<Vec<PolicyContext>>,
}

impl MockPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(PolicyBehavior::Allow),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: PolicyBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn contexts(&self) -> Vec<PolicyContext> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl PolicyEvaluator for MockPolicy {
    async fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyDecision, PolicyError> {
        self.contexts.lock().push(ctx.clone());
        match self.behavior.lock().clone() {
            PolicyBehavior::Allow => Ok(PolicyDecision::allow()),
            PolicyBehavior::Deny { rule } => Ok(PolicyDecision {
                allowed: false,
                mode: PolicyMode::Enforce,
                rule: Some(rule),
                reason: Some("denied by test rule".into()),
            }),
            PolicyBehavior::ShadowDeny { rule } => Ok(PolicyDecision {
                allowed: false,
                mode: PolicyMode::Shadow,
                rule: Some(rule),
                reason: Some("shadow denial".into()),
            }),
            PolicyBehavior::FailBare => Err(PolicyError {
                message: "evaluator crashed".into(),
                decision: None,
            }),
            PolicyBehavior::FailWithDenial { rule } => Err(PolicyError {
                message: "evaluator errored mid-decision".into(),
                decision: Some(PolicyDecision {
                    allowed: false,
                    mode: PolicyMode::Enforce,
                    rule: Some(rule),
                    reason: Some("denial carried by error".into()),
                }),
            }),
        }
    }
}

/// Recording sinks + tenant settings.
pub struct RecordingSinks {
    pub transactions: Mutex<Vec<TransactionRecord>>,
    pub receipts: Mutex<Vec<Receipt>>,
    pub webhooks: Mutex<Vec<WebhookEvent>>,
    pub revenue: Mutex<Vec<(Option<String>, Amount)>>,
    tenant_statuses: Mutex<Vec<(String, TenantStatus)>>,
    take_rate_bps: AtomicU32,
}

impl RecordingSinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transactions: Mutex::new(Vec::new()),
            receipts: Mutex::new(Vec::new()),
            webhooks: Mutex::new(Vec::new()),
            revenue: Mutex::new(Vec::new()),
            tenant_statuses: Mutex::new(Vec::new()),
            take_rate_bps: AtomicU32::new(0),
        })
    }

    pub fn set_tenant_status(&self, tenant_id: &str, status: TenantStatus) {
        self.tenant_statuses
            .lock()
            .push((tenant_id.to_string(), status));
    }

    pub fn set_take_rate_bps(&self, bps: u32) {
        self.take_rate_bps.store(bps, Ordering::SeqCst);
    }

    pub fn confirmed_transactions(&self) -> Vec<TransactionRecord> {
        self.transactions
            .lock()
            .iter()
            .filter(|t| t.status == TransactionStatus::Confirmed)
            .cloned()
            .collect()
    }

    pub fn settlement_failed_webhooks(&self) -> Vec<WebhookEvent> {
        self.webhooks
            .lock()
            .iter()
            .filter(|w| matches!(w, WebhookEvent::SettlementFailed { .. }))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransactionRecorder for RecordingSinks {
    async fn record(&self, tx: &TransactionRecord) -> Result<(), SinkError> {
        self.transactions.lock().push(tx.clone());
        Ok(())
    }
}

#[async_trait]
impl RevenueAccumulator for RecordingSinks {
    async fn add(&self, tenant_id: Option<&str>, fee: Amount) -> Result<(), SinkError> {
        self.revenue
            .lock()
            .push((tenant_id.map(str::to_string), fee));
        Ok(())
    }
}

#[async_trait]
impl ReceiptIssuer for RecordingSinks {
    async fn issue(&self, receipt: &Receipt) -> Result<(), SinkError> {
        self.receipts.lock().push(receipt.clone());
        Ok(())
    }
}

#[async_trait]
impl WebhookEmitter for RecordingSinks {
    async fn emit(&self, event: &WebhookEvent) -> Result<(), SinkError> {
        self.webhooks.lock().push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl TenantSettingsProvider for RecordingSinks {
    async fn tenant_status(&self, tenant_id: &str) -> Result<TenantStatus, SinkError> {
        Ok(self
            .tenant_statuses
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == tenant_id)
            .map(|(_, status)| *status)
            .unwrap_or(TenantStatus::Active))
    }

    async fn take_rate_bps(&self, _tenant_id: Option<&str>) -> Result<u32, SinkError> {
        Ok(self.take_rate_bps.load(Ordering::SeqCst))
    }
}

/// Everything a gateway test needs, wired to a memory store.
pub struct TestGateway {
    pub gateway: Arc<GatewayService>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MockLedger>,
    pub registry: Arc<MockRegistry>,
    pub forwarder: Arc<MockForwarder>,
    pub policy: Arc<MockPolicy>,
    pub sinks: Arc<RecordingSinks>,
}

pub fn test_gateway(config: GatewayConfig) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    let ledger = MockLedger::new();
    let registry = MockRegistry::new();
    let forwarder = MockForwarder::new();
    let policy = MockPolicy::new();
    let sinks = RecordingSinks::new();

    let gateway = Arc::new(GatewayService::new(
        Collaborators {
            store: store.clone(),
            ledger: ledger.clone(),
            registry: registry.clone(),
            forwarder: forwarder.clone(),
            policy: policy.clone(),
            recorder: sinks.clone(),
            revenue: sinks.clone(),
            receipts: sinks.clone(),
            webhooks: sinks.clone(),
            tenants: sinks.clone(),
        },
        config,
    ));

    TestGateway {
        gateway,
        store,
        ledger,
        registry,
        forwarder,
        policy,
        sinks,
    }
}

pub fn default_gateway() -> TestGateway {
    test_gateway(GatewayConfig::default())
}
