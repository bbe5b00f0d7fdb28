//! Candidate resolution: discovery, ranking, and truncation.

use crate::error::GatewayError;
use crate::model::Strategy;
use crate::registry::{ServiceCandidate, ServiceRegistry};
use paygate_core::Amount;
use std::cmp::Ordering;
use std::sync::Arc;

/// At most this many candidates are tried per proxy call.
pub const MAX_RETRIES: usize = 3;

/// Ranks registry candidates for one proxy call.
pub struct Resolver {
    registry: Arc<dyn ServiceRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Discovers candidates for `service_type`, filters out unusable ones,
    /// ranks by `strategy`, honors `prefer_agent`, and truncates to
    /// [`MAX_RETRIES`].
    pub async fn resolve(
        &self,
        service_type: &str,
        strategy: Strategy,
        max_per_request: Amount,
        prefer_agent: Option<&str>,
    ) -> Result<Vec<ServiceCandidate>, GatewayError> {
        let discovered = self
            .registry
            .discover(service_type)
            .await
            .map_err(|err| {
                tracing::warn!(service_type, error = %err, "registry discovery failed");
                GatewayError::NoServiceAvailable {
                    service_type: service_type.to_string(),
                }
            })?;

        let mut candidates: Vec<ServiceCandidate> = discovered
            .into_iter()
            .filter(|c| !c.endpoint.is_empty())
            .filter(|c| c.price <= max_per_request)
            .collect();

        rank(&mut candidates, strategy);

        if let Some(agent) = prefer_agent {
            if let Some(pos) = candidates.iter().position(|c| c.agent == agent) {
                let preferred = candidates.remove(pos);
                candidates.insert(0, preferred);
            }
        }

        candidates.truncate(MAX_RETRIES);

        if candidates.is_empty() {
            return Err(GatewayError::NoServiceAvailable {
                service_type: service_type.to_string(),
            });
        }
        Ok(candidates)
    }
}

fn rank(candidates: &mut [ServiceCandidate], strategy: Strategy) {
    match strategy {
        Strategy::Cheapest => candidates.sort_by(|a, b| a.price.cmp(&b.price)),
        Strategy::Reputation => candidates.sort_by(|a, b| {
            b.reputation
                .partial_cmp(&a.reputation)
                .unwrap_or(Ordering::Equal)
        }),
        Strategy::BestValue => candidates.sort_by(|a, b| {
            value_score(b)
                .partial_cmp(&value_score(a))
                .unwrap_or(Ordering::Equal)
        }),
    }
}

/// Reputation per whole unit of price. Prices below representational
/// precision score zero.
fn value_score(candidate: &ServiceCandidate) -> f64 {
    if candidate.price.is_zero() {
        return 0.0;
    }
    candidate.reputation / (candidate.price.micros() as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryError;
    use async_trait::async_trait;

    struct FixedRegistry(Vec<ServiceCandidate>);

    #[async_trait]
    impl ServiceRegistry for FixedRegistry {
        async fn discover(
            &self,
            _service_type: &str,
        ) -> Result<Vec<ServiceCandidate>, RegistryError> {
            Ok(self.0.clone())
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl ServiceRegistry for FailingRegistry {
        async fn discover(
            &self,
            _service_type: &str,
        ) -> Result<Vec<ServiceCandidate>, RegistryError> {
            Err(RegistryError("unreachable".into()))
        }
    }

    fn candidate(id: &str, price_micros: u64, reputation: f64) -> ServiceCandidate {
        ServiceCandidate {
            service_id: id.to_string(),
            agent: format!("agent-{id}"),
            endpoint: format!("https://{id}.example/api"),
            price: Amount::from_micros(price_micros),
            reputation,
            service_type: "inference".to_string(),
        }
    }

    fn cap() -> Amount {
        Amount::from_micros(10_000_000)
    }

    #[tokio::test]
    async fn cheapest_sorts_ascending_by_price() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            candidate("b", 300, 0.5),
            candidate("a", 100, 0.1),
            candidate("c", 200, 0.9),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::Cheapest, cap(), None)
            .await
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|c| c.service_id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[tokio::test]
    async fn reputation_sorts_descending() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            candidate("low", 100, 0.2),
            candidate("high", 500, 0.9),
            candidate("mid", 50, 0.5),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::Reputation, cap(), None)
            .await
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|c| c.service_id.as_str()).collect();
        assert_eq!(ids, ["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn best_value_scores_zero_price_as_zero() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            candidate("free", 0, 0.99),
            candidate("cheap-good", 100_000, 0.9),
            candidate("pricey-good", 1_000_000, 0.95),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::BestValue, cap(), None)
            .await
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|c| c.service_id.as_str()).collect();
        // 0.9/0.1 = 9.0 beats 0.95/1.0; zero-priced candidate scores 0 and
        // ranks last.
        assert_eq!(ids, ["cheap-good", "pricey-good", "free"]);
    }

    #[tokio::test]
    async fn preferred_agent_moves_to_front_after_ranking() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            candidate("a", 100, 0.1),
            candidate("b", 300, 0.5),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::Cheapest, cap(), Some("agent-b"))
            .await
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|c| c.service_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[tokio::test]
    async fn unknown_preferred_agent_changes_nothing() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            candidate("a", 100, 0.1),
            candidate("b", 300, 0.5),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::Cheapest, cap(), Some("agent-zz"))
            .await
            .unwrap();
        assert_eq!(ranked[0].service_id, "a");
    }

    #[tokio::test]
    async fn truncates_to_three() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            candidate("a", 100, 0.0),
            candidate("b", 200, 0.0),
            candidate("c", 300, 0.0),
            candidate("d", 400, 0.0),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::Cheapest, cap(), None)
            .await
            .unwrap();
        assert_eq!(ranked.len(), MAX_RETRIES);
    }

    #[tokio::test]
    async fn drops_empty_endpoints_and_over_cap_prices() {
        let mut no_endpoint = candidate("bad", 100, 0.9);
        no_endpoint.endpoint.clear();
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![
            no_endpoint,
            candidate("pricey", 20_000_000, 0.9),
            candidate("ok", 100, 0.9),
        ])));
        let ranked = resolver
            .resolve("inference", Strategy::Cheapest, cap(), None)
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].service_id, "ok");
    }

    #[tokio::test]
    async fn empty_result_is_no_service_available() {
        let resolver = Resolver::new(Arc::new(FixedRegistry(vec![])));
        let err = resolver
            .resolve("inference", Strategy::Cheapest, cap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoServiceAvailable { .. }));
    }

    #[tokio::test]
    async fn registry_failure_is_no_service_available() {
        let resolver = Resolver::new(Arc::new(FailingRegistry));
        let err = resolver
            .resolve("inference", Strategy::Cheapest, cap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoServiceAvailable { .. }));
    }
}
