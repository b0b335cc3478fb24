//! Ingress self-protection.
//!
//! [`ApiGuard`] throttles callers per API key before any tenant work happens,
//! so a single abusive key cannot saturate the engine or the store. Keys that
//! were denied are remembered locally until their window resets, which keeps
//! a flood from a denied key off the store entirely.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use super::algorithm::{Limit, RateLimitAlgorithm, Window};
use super::breaker::{CircuitBreaker, FailurePolicy};
use super::decision::Decision;
use super::fixed_window::FixedWindow;
use super::key::{credential_key, mask_credential, sanitize_credential};
use crate::clock::Clock;
use crate::config::ApiGuardConfig;
use crate::store::{Store, StoreError, StoreExt};

/// Current window consumption of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUsage {
    pub current_count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds
    pub reset_at: u64,
}

/// Per-credential ingress limiter with a local negative cache.
pub struct ApiGuard {
    limiter: FixedWindow,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    limit: Limit,
    policy: FailurePolicy,
    breaker: CircuitBreaker,
    /// Sanitized credential to the instant its denial lapses
    denied_until: DashMap<String, u64>,
    prune_threshold: usize,
}

impl ApiGuard {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &ApiGuardConfig) -> Self {
        Self {
            limiter: FixedWindow::new(store.clone(), clock.clone()),
            store,
            clock,
            limit: Limit::new(config.max_requests, config.window_seconds),
            policy: config.failure_policy(),
            breaker: CircuitBreaker::new(config.failure_threshold),
            denied_until: DashMap::new(),
            prune_threshold: config.cache_prune_threshold,
        }
    }

    /// Whether a request presenting `credential` may enter.
    pub async fn is_allowed(&self, credential: &str) -> bool {
        let sanitized = sanitize_credential(credential);
        if sanitized.is_empty() {
            return false;
        }

        let now = self.clock.now_millis();
        let cached = self.denied_until.get(&sanitized).map(|until| *until);
        if let Some(until) = cached {
            if until > now {
                trace!(key = %mask_credential(credential), "API key denied from cache");
                return false;
            }
            self.denied_until.remove(&sanitized);
        }

        match self
            .limiter
            .check(&credential_key(credential), &self.limit, 1)
            .await
        {
            Ok(decision) => {
                self.breaker.record_success();
                if decision.allowed {
                    if self.denied_until.len() > self.prune_threshold {
                        self.prune(now);
                    }
                    true
                } else {
                    warn!(
                        key = %mask_credential(credential),
                        reset_at = decision.reset_at,
                        "API key rate limit exceeded"
                    );
                    self.denied_until.insert(sanitized, decision.reset_at);
                    false
                }
            }
            Err(e) => {
                let failures = self.breaker.record_failure();
                if self.breaker.is_tripped() {
                    error!(
                        consecutive_failures = failures,
                        error = %e,
                        "API guard store failing repeatedly"
                    );
                } else {
                    warn!(error = %e, "API guard store check failed");
                }
                self.policy == FailurePolicy::FailOpen
            }
        }
    }

    /// Decision reported to callers the guard turned away.
    pub fn rejection(&self) -> Decision {
        Decision::fail_closed(self.clock.now_millis())
    }

    /// Consumption of the current window by `credential`.
    pub async fn usage(&self, credential: &str) -> Result<ApiUsage, StoreError> {
        let now = self.clock.now_millis();
        let window = Window::containing(now, self.limit.window_millis());
        let count = self
            .store
            .get_i64(&window.key(&credential_key(credential)))
            .await?
            .map_or(0, |n| u64::try_from(n).unwrap_or(0));

        Ok(ApiUsage {
            current_count: count,
            limit: self.limit.max_requests,
            remaining: self.limit.max_requests.saturating_sub(count),
            reset_at: window.end(),
        })
    }

    /// Number of credentials currently held in the negative cache.
    pub fn cached_denials(&self) -> usize {
        self.denied_until.len()
    }

    fn prune(&self, now: u64) {
        let before = self.denied_until.len();
        self.denied_until.retain(|_, until| *until > now);
        trace!(
            pruned = before - self.denied_until.len(),
            "Pruned expired API key denials"
        );
    }
}
