//! The rate limit decision engine.
//!
//! A check runs through validation, the tenant's quota, rule resolution and
//! then each applicable rule in priority order. The first denying rule
//! decides; otherwise the most restrictive allow wins. Store failures are
//! resolved by the configured [`FailurePolicy`] and never surface to callers.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::algorithm::Algorithms;
use super::breaker::{CircuitBreaker, FailurePolicy};
use super::decision::{CheckRequest, Decision};
use super::key::RuleKey;
use super::resolver::RuleResolver;
use super::rules::RuleSource;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Result, TollgateError};
use crate::tenancy::{Alert, AlertDispatcher, MetricsRecorder, QuotaService, UsageRecord};

/// Width of the band above each alert threshold in which an alert fires.
const ALERT_BAND_PERCENT: f64 = 5.0;

/// Multi-tenant rate limit engine.
pub struct RateLimitEngine {
    resolver: RuleResolver,
    algorithms: Algorithms,
    quota: Arc<dyn QuotaService>,
    metrics: Arc<dyn MetricsRecorder>,
    alerts: Arc<dyn AlertDispatcher>,
    clock: Arc<dyn Clock>,
    policy: FailurePolicy,
    breaker: CircuitBreaker,
    alert_thresholds: Vec<u8>,
}

impl RateLimitEngine {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        algorithms: Algorithms,
        quota: Arc<dyn QuotaService>,
        metrics: Arc<dyn MetricsRecorder>,
        alerts: Arc<dyn AlertDispatcher>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            resolver: RuleResolver::new(rules),
            algorithms,
            quota,
            metrics,
            alerts,
            clock,
            policy: config.failure_policy(),
            breaker: CircuitBreaker::new(config.failure_threshold),
            alert_thresholds: config.alert_thresholds.clone(),
        }
    }

    /// Decide whether `request` by `tenant_id` may proceed.
    ///
    /// Only returns `Err` for `Validation` and `QuotaExceeded`; every other
    /// failure is resolved by the failure policy.
    pub async fn check(&self, tenant_id: Uuid, request: &CheckRequest) -> Result<Decision> {
        request.validate()?;
        let started = Instant::now();

        let decision = match self.evaluate(tenant_id, request).await {
            Ok(decision) => decision,
            Err(e @ TollgateError::QuotaExceeded(_)) => return Err(e),
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "Rate limit check failed");
                self.fallback()
            }
        };

        self.record_usage(tenant_id, request, &decision, started);
        Ok(decision)
    }

    /// Consecutive store failures seen by this engine.
    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    fn fallback(&self) -> Decision {
        let now = self.clock.now_millis();
        match self.policy {
            FailurePolicy::FailOpen => Decision::default_allow(now),
            FailurePolicy::FailClosed => Decision::fail_closed(now),
        }
    }

    async fn evaluate(&self, tenant_id: Uuid, request: &CheckRequest) -> Result<Decision> {
        let limits = match self.quota.validate_check(tenant_id).await {
            Ok(limits) => limits,
            Err(e @ TollgateError::QuotaExceeded(_)) => {
                warn!(tenant_id = %tenant_id, "Monthly check quota exhausted");
                self.alerts.dispatch(Alert::QuotaExceeded { tenant_id });
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if limits.allow_custom_algorithms {
            trace!(tenant_id = %tenant_id, "Tenant tier allows custom algorithms");
        }
        self.raise_usage_alerts(tenant_id).await;

        let identifier = request.identifier();
        let rules = self
            .resolver
            .resolve(tenant_id, &request.resource, identifier)
            .await?;
        if rules.is_empty() {
            debug!(
                tenant_id = %tenant_id,
                resource = %request.resource,
                "No rate limit rules apply"
            );
            return Ok(Decision::default_allow(self.clock.now_millis()));
        }

        let mut most_restrictive: Option<Decision> = None;
        for rule in &rules {
            let key = RuleKey::new(tenant_id, rule, &request.resource, identifier).to_string_key();
            let result = self
                .algorithms
                .get(rule.algorithm)
                .check(&key, &rule.limit(), request.tokens)
                .await;

            match result {
                Ok(decision) => {
                    self.breaker.record_success();
                    if !decision.allowed {
                        debug!(
                            tenant_id = %tenant_id,
                            rule_id = %rule.id,
                            retry_after = decision.retry_after,
                            "Request denied"
                        );
                        return Ok(decision);
                    }
                    if most_restrictive.map_or(true, |d| decision.remaining < d.remaining) {
                        most_restrictive = Some(decision);
                    }
                }
                Err(e) => {
                    let failures = self.breaker.record_failure();
                    warn!(
                        tenant_id = %tenant_id,
                        rule_id = %rule.id,
                        error = %e,
                        consecutive_failures = failures,
                        "Store unavailable during rule evaluation"
                    );
                    if self.breaker.is_tripped() {
                        error!(
                            consecutive_failures = failures,
                            "Rate limit store failing repeatedly"
                        );
                    }
                    if failures == self.breaker.threshold() {
                        self.alerts.dispatch(Alert::StoreDegraded {
                            tenant_id,
                            consecutive_failures: failures,
                        });
                    }
                    if self.policy == FailurePolicy::FailClosed {
                        return Ok(Decision::fail_closed(self.clock.now_millis()));
                    }
                }
            }
        }

        Ok(most_restrictive.unwrap_or_else(|| Decision::default_allow(self.clock.now_millis())))
    }

    async fn raise_usage_alerts(&self, tenant_id: Uuid) {
        let usage = match self.quota.usage(tenant_id).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Failed to read quota usage");
                return;
            }
        };
        let (Some(percent), Some(limit)) = (usage.percent(), usage.limit) else {
            return;
        };

        for &threshold in &self.alert_thresholds {
            let lower = f64::from(threshold);
            if percent >= lower && percent < lower + ALERT_BAND_PERCENT {
                self.alerts.dispatch(Alert::QuotaApproaching {
                    tenant_id,
                    percent: threshold,
                    used: usage.used,
                    limit,
                });
            }
        }
    }

    fn record_usage(
        &self,
        tenant_id: Uuid,
        request: &CheckRequest,
        decision: &Decision,
        started: Instant,
    ) {
        let record = UsageRecord {
            tenant_id,
            resource: request.resource.clone(),
            identifier: request.identifier().map(str::to_string),
            allowed: decision.allowed,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp_ms: self.clock.now_millis(),
        };
        if let Err(e) = self.metrics.record(record) {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to record usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::decision::DEFAULT_ALLOW_REMAINING;
    use crate::ratelimit::rules::{AlgorithmKind, LimitScope, RateLimitRule, RuleSet};
    use crate::store::{MemoryStore, Store};
    use crate::tenancy::{Tier, UsageLedger};
    use crate::testing::{
        CountingAlgorithm, CountingStore, FailingMetrics, FailingRules, FailingStore,
        RecordingAlerts, StaticQuota,
    };

    const NOW: u64 = 1_700_000_040_000;

    struct Harness {
        engine: RateLimitEngine,
        alerts: Arc<RecordingAlerts>,
        ledger: Arc<UsageLedger>,
        clock: Arc<ManualClock>,
    }

    fn harness(
        rules: RuleSet,
        algorithms: Algorithms,
        quota: StaticQuota,
        clock: Arc<ManualClock>,
        config: EngineConfig,
    ) -> Harness {
        let alerts = Arc::new(RecordingAlerts::default());
        let ledger = Arc::new(UsageLedger::new());
        let engine = RateLimitEngine::new(
            Arc::new(rules),
            algorithms,
            Arc::new(quota),
            ledger.clone(),
            alerts.clone(),
            clock.clone(),
            &config,
        );
        Harness {
            engine,
            alerts,
            ledger,
            clock,
        }
    }

    fn store_harness(rules: RuleSet, store: Arc<dyn Store>, config: EngineConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(NOW));
        let algorithms = Algorithms::new(store, clock.clone());
        harness(rules, algorithms, StaticQuota::unlimited(), clock, config)
    }

    fn fail_closed() -> EngineConfig {
        EngineConfig {
            fail_open: false,
            ..EngineConfig::default()
        }
    }

    fn single_rule(tenant: Uuid, max: u64) -> RuleSet {
        let mut rules = RuleSet::new();
        rules
            .push(RateLimitRule::new(tenant, "orders", AlgorithmKind::FixedWindow, max, 60))
            .unwrap();
        rules
    }

    #[tokio::test]
    async fn test_fixed_window_rule_enforced() {
        let tenant = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let h = harness(
            single_rule(tenant, 3),
            Algorithms::new(store, clock.clone()),
            StaticQuota::unlimited(),
            clock,
            EngineConfig::default(),
        );
        let request = CheckRequest::new("orders");

        for remaining in [2, 1, 0] {
            let decision = h.engine.check(tenant, &request).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
        }
        let denied = h.engine.check(tenant, &request).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after > 0);

        let usage = h.ledger.summary(tenant, h.clock.now_millis()).unwrap();
        assert_eq!(usage.checks, 4);
        assert_eq!(usage.denied, 1);
    }

    #[tokio::test]
    async fn test_higher_priority_denial_short_circuits() {
        let tenant = Uuid::new_v4();
        let mut rules = RuleSet::new();
        rules
            .push(
                RateLimitRule::new(tenant, "*", AlgorithmKind::SlidingWindow, 100, 60)
                    .with_scope(LimitScope::Global)
                    .with_priority(5),
            )
            .unwrap();
        rules
            .push(
                RateLimitRule::new(tenant, "orders", AlgorithmKind::FixedWindow, 1, 60)
                    .with_priority(10),
            )
            .unwrap();

        let denying = Arc::new(CountingAlgorithm::new(Decision::deny(0, NOW + 60_000, 60)));
        let allowing = Arc::new(CountingAlgorithm::new(Decision::allow(99, NOW + 60_000)));
        let unused = Arc::new(CountingAlgorithm::new(Decision::allow(0, NOW)));
        let algorithms = Algorithms::from_parts(denying.clone(), allowing.clone(), unused);

        let h = harness(
            rules,
            algorithms,
            StaticQuota::unlimited(),
            Arc::new(ManualClock::new(NOW)),
            EngineConfig::default(),
        );
        let decision = h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();

        assert!(!decision.allowed);
        assert_eq!(denying.calls(), 1);
        assert_eq!(allowing.calls(), 0);
        assert!(denying.keys()[0].starts_with(&format!("rl:{tenant}:res:orders:")));
    }

    #[tokio::test]
    async fn test_most_restrictive_allow_wins() {
        let tenant = Uuid::new_v4();
        let mut rules = RuleSet::new();
        rules
            .push(RateLimitRule::new(tenant, "orders", AlgorithmKind::FixedWindow, 10, 60))
            .unwrap();
        rules
            .push(RateLimitRule::new(tenant, "orders", AlgorithmKind::TokenBucket, 10, 60))
            .unwrap();

        let loose = Arc::new(CountingAlgorithm::new(Decision::allow(40, NOW + 60_000)));
        let tight = Arc::new(CountingAlgorithm::new(Decision::allow(3, NOW + 5_000)));
        let unused = Arc::new(CountingAlgorithm::new(Decision::allow(0, NOW)));
        let algorithms = Algorithms::from_parts(loose.clone(), unused, tight.clone());

        let h = harness(
            rules,
            algorithms,
            StaticQuota::unlimited(),
            Arc::new(ManualClock::new(NOW)),
            EngineConfig::default(),
        );
        let decision = h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();

        assert_eq!(decision, Decision::allow(3, NOW + 5_000));
        assert_eq!(loose.calls(), 1);
        assert_eq!(tight.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_rules_is_default_allow() {
        let h = store_harness(
            RuleSet::new(),
            Arc::new(FailingStore::default()),
            fail_closed(),
        );
        let decision = h
            .engine
            .check(Uuid::new_v4(), &CheckRequest::new("orders"))
            .await
            .unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining, DEFAULT_ALLOW_REMAINING);
        assert_eq!(decision.reset_at, NOW + 3_600_000);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_is_down() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(FailingStore::default());
        let h = store_harness(single_rule(tenant, 5), store.clone(), EngineConfig::default());

        for _ in 0..3 {
            let decision = h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, DEFAULT_ALLOW_REMAINING);
        }
        assert_eq!(store.calls(), 3);
        assert_eq!(h.engine.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_fail_closed_when_store_is_down() {
        let tenant = Uuid::new_v4();
        let h = store_harness(
            single_rule(tenant, 5),
            Arc::new(FailingStore::default()),
            fail_closed(),
        );

        let decision = h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
        assert_eq!(decision, Decision::fail_closed(NOW));
        assert_eq!(decision.retry_after, 60);
    }

    #[tokio::test]
    async fn test_store_degraded_alert_at_threshold() {
        let tenant = Uuid::new_v4();
        let config = EngineConfig {
            failure_threshold: 2,
            ..EngineConfig::default()
        };
        let h = store_harness(
            single_rule(tenant, 5),
            Arc::new(FailingStore::default()),
            config,
        );

        for _ in 0..4 {
            h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
        }
        assert_eq!(
            h.alerts.alerts(),
            vec![Alert::StoreDegraded {
                tenant_id: tenant,
                consecutive_failures: 2
            }]
        );
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let tenant = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new(NOW));
        let failing = Arc::new(CountingAlgorithm::new(Decision::allow(1, NOW)));
        let h = harness(
            single_rule(tenant, 5),
            Algorithms::from_parts(failing.clone(), failing.clone(), failing),
            StaticQuota::unlimited(),
            clock,
            EngineConfig::default(),
        );
        h.engine.breaker.record_failure();
        h.engine.breaker.record_failure();

        h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
        assert_eq!(h.engine.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_never_touches_store() {
        let tenant = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(CountingStore::new(clock.clone()));
        let h = harness(
            single_rule(tenant, 5),
            Algorithms::new(store.clone(), clock.clone()),
            StaticQuota::unlimited(),
            clock,
            EngineConfig::default(),
        );

        let result = h.engine.check(tenant, &CheckRequest::new("a:b")).await;
        assert!(matches!(result, Err(TollgateError::Validation(_))));
        assert_eq!(store.calls(), 0);
        assert_eq!(h.ledger.checks_in_month(tenant, NOW).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_is_an_error_and_alerts() {
        let tenant = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(CountingStore::new(clock.clone()));
        let h = harness(
            single_rule(tenant, 5),
            Algorithms::new(store.clone(), clock.clone()),
            StaticQuota::new(Tier::Free, 10_000),
            clock,
            EngineConfig::default(),
        );

        let result = h.engine.check(tenant, &CheckRequest::new("orders")).await;
        assert!(matches!(result, Err(TollgateError::QuotaExceeded(_))));
        assert_eq!(store.calls(), 0);
        assert_eq!(h.alerts.alerts(), vec![Alert::QuotaExceeded { tenant_id: tenant }]);
    }

    #[tokio::test]
    async fn test_quota_approaching_alert() {
        let tenant = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let h = harness(
            single_rule(tenant, 5),
            Algorithms::new(store, clock.clone()),
            StaticQuota::new(Tier::Free, 8_100),
            clock,
            EngineConfig::default(),
        );

        h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
        assert_eq!(
            h.alerts.alerts(),
            vec![Alert::QuotaApproaching {
                tenant_id: tenant,
                percent: 80,
                used: 8_100,
                limit: 10_000
            }]
        );
    }

    #[tokio::test]
    async fn test_metrics_failure_is_swallowed() {
        let tenant = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let engine = RateLimitEngine::new(
            Arc::new(single_rule(tenant, 5)),
            Algorithms::new(store, clock.clone()),
            Arc::new(StaticQuota::unlimited()),
            Arc::new(FailingMetrics),
            Arc::new(RecordingAlerts::default()),
            clock,
            &EngineConfig::default(),
        );

        let decision = engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_identifier_rules_keep_callers_apart() {
        let tenant = Uuid::new_v4();
        let mut rules = RuleSet::new();
        rules
            .push(
                RateLimitRule::new(tenant, "orders", AlgorithmKind::FixedWindow, 1, 60)
                    .with_scope(LimitScope::Identifier),
            )
            .unwrap();
        let h = store_harness(
            rules,
            Arc::new(MemoryStore::new(Arc::new(ManualClock::new(NOW)))),
            EngineConfig::default(),
        );

        let alice = CheckRequest::new("orders").with_identifier("alice");
        let bob = CheckRequest::new("orders").with_identifier("bob");
        assert!(h.engine.check(tenant, &alice).await.unwrap().allowed);
        assert!(!h.engine.check(tenant, &alice).await.unwrap().allowed);
        assert!(h.engine.check(tenant, &bob).await.unwrap().allowed);

        // Without an identifier the rule does not apply
        let anonymous = h.engine.check(tenant, &CheckRequest::new("orders")).await.unwrap();
        assert_eq!(anonymous.remaining, DEFAULT_ALLOW_REMAINING);
    }

    fn engine_with(
        rules: Arc<dyn RuleSource>,
        quota: StaticQuota,
        config: &EngineConfig,
    ) -> RateLimitEngine {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        RateLimitEngine::new(
            rules,
            Algorithms::new(store, clock.clone()),
            Arc::new(quota),
            Arc::new(UsageLedger::new()),
            Arc::new(RecordingAlerts::default()),
            clock,
            config,
        )
    }

    #[tokio::test]
    async fn test_rule_source_failure_follows_policy() {
        let tenant = Uuid::new_v4();
        let request = CheckRequest::new("orders");

        let open = engine_with(
            Arc::new(FailingRules),
            StaticQuota::unlimited(),
            &EngineConfig::default(),
        );
        assert_eq!(
            open.check(tenant, &request).await.unwrap(),
            Decision::default_allow(NOW)
        );

        let closed = engine_with(Arc::new(FailingRules), StaticQuota::unlimited(), &fail_closed());
        assert_eq!(
            closed.check(tenant, &request).await.unwrap(),
            Decision::fail_closed(NOW)
        );
    }

    #[tokio::test]
    async fn test_quota_backend_failure_follows_policy() {
        let tenant = Uuid::new_v4();
        let request = CheckRequest::new("orders");

        let open = engine_with(
            Arc::new(single_rule(tenant, 1)),
            StaticQuota::unavailable(),
            &EngineConfig::default(),
        );
        assert_eq!(
            open.check(tenant, &request).await.unwrap(),
            Decision::default_allow(NOW)
        );

        let closed = engine_with(
            Arc::new(single_rule(tenant, 1)),
            StaticQuota::unavailable(),
            &fail_closed(),
        );
        assert_eq!(
            closed.check(tenant, &request).await.unwrap(),
            Decision::fail_closed(NOW)
        );
    }

    #[tokio::test]
    async fn test_oversized_cost_cannot_bypass_exhausted_limit() {
        let tenant = Uuid::new_v4();
        let h = store_harness(
            single_rule(tenant, 1),
            Arc::new(MemoryStore::new(Arc::new(ManualClock::new(NOW)))),
            EngineConfig::default(),
        );
        let request = CheckRequest::new("orders");

        assert!(h.engine.check(tenant, &request).await.unwrap().allowed);
        assert!(!h.engine.check(tenant, &request).await.unwrap().allowed);

        let huge = request.clone().with_tokens(u64::MAX);
        let result = h.engine.check(tenant, &huge).await;
        assert!(matches!(result, Err(TollgateError::Validation(_))));

        let above_limit = request.with_tokens(5);
        assert!(!h.engine.check(tenant, &above_limit).await.unwrap().allowed);
        assert_eq!(h.engine.consecutive_failures(), 0);
        assert!(h.alerts.alerts().is_empty());
    }
}
