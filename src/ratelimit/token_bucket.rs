//! Token bucket.
//!
//! State lives in a hash with two fields, `tokens` and `last_refill`, read
//! and written back as independent commands. Two callers racing on the same
//! bucket can lose an update; this is accepted for the smoother admission
//! curve the bucket gives.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{Limit, RateLimitAlgorithm};
use super::decision::Decision;
use crate::clock::Clock;
use crate::store::{Store, StoreError, StoreExt};

const TOKENS_FIELD: &str = "tokens";
const LAST_REFILL_FIELD: &str = "last_refill";

/// Token bucket algorithm.
pub struct TokenBucket {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn field<T: std::str::FromStr>(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.store.hget(key, field).await? {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                StoreError::Malformed(format!("{key}.{field} holds {raw:?}"))
            }),
            None => Ok(None),
        }
    }
}

/// Milliseconds needed to accrue `tokens` at `max_requests` per `window_millis`.
fn refill_millis(tokens: f64, limit: &Limit) -> u64 {
    if tokens <= 0.0 {
        return 0;
    }
    (tokens * limit.window_millis() as f64 / limit.max_requests as f64).ceil() as u64
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucket {
    async fn check(&self, key: &str, limit: &Limit, cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        if cost > limit.capacity() {
            trace!(key, cost, "Cost exceeds the bucket capacity");
            return Ok(Decision::deny(
                0,
                now + limit.window_millis(),
                limit.window_seconds.max(1),
            ));
        }
        let capacity = limit.capacity() as f64;

        let stored: Option<f64> = self.field(key, TOKENS_FIELD).await?;
        let last_refill: Option<u64> = self.field(key, LAST_REFILL_FIELD).await?;

        let mut tokens = match (stored, last_refill) {
            (Some(stored), Some(last_refill)) => {
                let elapsed = now.saturating_sub(last_refill) as f64;
                let refilled =
                    elapsed * limit.max_requests as f64 / limit.window_millis() as f64;
                (stored + refilled).min(capacity)
            }
            _ => capacity,
        };

        let cost = cost as f64;
        let allowed = tokens >= cost;
        if allowed {
            tokens -= cost;
            self.store
                .hset(key, TOKENS_FIELD, &format!("{tokens:.6}"))
                .await?;
            self.store
                .hset(key, LAST_REFILL_FIELD, &now.to_string())
                .await?;
            self.store
                .expire(key, limit.window_seconds.max(1) * 2)
                .await?;
        }

        let remaining = tokens.floor().max(0.0) as u64;
        let reset_at = now + refill_millis(capacity - tokens, limit);
        trace!(key, tokens, allowed, "Token bucket checked");

        if allowed {
            Ok(Decision::allow(remaining, reset_at))
        } else {
            let retry_after = refill_millis(cost - tokens, limit).div_ceil(1000);
            Ok(Decision::deny(remaining, reset_at, retry_after))
        }
    }
}
