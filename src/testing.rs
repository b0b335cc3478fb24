//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    Decision, Limit, LimitScope, RateLimitAlgorithm, RateLimitRule, RuleSource,
};
use crate::store::{Command, MemoryStore, Script, Store, StoreError, Value};
use crate::tenancy::{
    Alert, AlertDispatcher, MetricsRecorder, QuotaService, QuotaUsage, Tier, TierLimits,
    UsageRecord,
};

/// [`MemoryStore`] that counts every call made to it.
pub struct CountingStore {
    inner: MemoryStore,
    calls: AtomicUsize,
}

impl CountingStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStore::new(clock),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn execute(&self, command: Command) -> std::result::Result<Value, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(command).await
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<Vec<Value>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.eval(script, keys, args).await
    }
}

/// Store whose every call fails with a transport error.
#[derive(Default)]
pub struct FailingStore {
    calls: AtomicUsize,
}

impl FailingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn execute(&self, _command: Command) -> std::result::Result<Value, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Transport("connection refused".to_string()))
    }

    async fn eval(
        &self,
        _script: &Script,
        _keys: &[String],
        _args: &[String],
    ) -> std::result::Result<Vec<Value>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Transport("connection refused".to_string()))
    }
}

/// Algorithm returning a canned decision and recording the keys it saw.
pub struct CountingAlgorithm {
    decision: Decision,
    keys: Mutex<Vec<String>>,
}

impl CountingAlgorithm {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().clone()
    }
}

#[async_trait]
impl RateLimitAlgorithm for CountingAlgorithm {
    async fn check(
        &self,
        key: &str,
        _limit: &Limit,
        _cost: u64,
    ) -> std::result::Result<Decision, StoreError> {
        self.keys.lock().push(key.to_string());
        Ok(self.decision)
    }
}

/// Rule source whose every lookup fails.
#[derive(Default)]
pub struct FailingRules;

#[async_trait]
impl RuleSource for FailingRules {
    async fn active_rules(&self, _tenant_id: Uuid) -> Result<Vec<RateLimitRule>> {
        Err(TollgateError::Rules("rule source unavailable".to_string()))
    }

    async fn rules_for_tenant(&self, _tenant_id: Uuid) -> Result<Vec<RateLimitRule>> {
        Err(TollgateError::Rules("rule source unavailable".to_string()))
    }

    async fn rules_by_scope(
        &self,
        _tenant_id: Uuid,
        _scope: LimitScope,
    ) -> Result<Vec<RateLimitRule>> {
        Err(TollgateError::Rules("rule source unavailable".to_string()))
    }
}

/// Alert sink keeping everything it receives.
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertDispatcher for RecordingAlerts {
    fn dispatch(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

/// Metrics sink that always fails.
#[derive(Default)]
pub struct FailingMetrics;

impl MetricsRecorder for FailingMetrics {
    fn record(&self, _record: UsageRecord) -> Result<()> {
        Err(TollgateError::Metrics("sink unavailable".to_string()))
    }
}

/// Quota service with fixed answers.
pub struct StaticQuota {
    tier: Tier,
    usage: QuotaUsage,
    unavailable: bool,
}

impl StaticQuota {
    pub fn new(tier: Tier, used: u64) -> Self {
        Self {
            tier,
            usage: QuotaUsage {
                used,
                limit: tier.limits().max_checks_per_month,
            },
            unavailable: false,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Tier::Enterprise, 0)
    }

    /// Quota backend that cannot be reached.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::unlimited()
        }
    }
}

#[async_trait]
impl QuotaService for StaticQuota {
    async fn validate_check(&self, tenant_id: Uuid) -> Result<TierLimits> {
        if self.unavailable {
            return Err(StoreError::Transport("quota backend unreachable".to_string()).into());
        }
        match self.usage.limit {
            Some(limit) if self.usage.used >= limit => Err(TollgateError::QuotaExceeded(
                format!("tenant {tenant_id} exhausted {limit} checks"),
            )),
            _ => Ok(self.tier.limits()),
        }
    }

    async fn usage(&self, _tenant_id: Uuid) -> Result<QuotaUsage> {
        Ok(self.usage)
    }
}
