//! Sliding window counter.
//!
//! Approximates a true sliding log with two adjacent fixed windows: the
//! previous window's count is weighted by how much of it still overlaps the
//! sliding interval. The read and the increment are separate round trips, so
//! concurrent callers near the limit may overshoot it slightly.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{Limit, RateLimitAlgorithm, Window};
use super::decision::Decision;
use crate::clock::Clock;
use crate::store::script::{int_arg, key_at};
use crate::store::{Command, Keyspace, Script, Store, StoreError, StoreExt, Value};

const SLIDING_INCREMENT_LUA: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return {count}
"#;

fn sliding_increment_native(
    keyspace: &mut Keyspace,
    now: u64,
    keys: &[String],
    args: &[String],
) -> Result<Vec<Value>, StoreError> {
    let key = key_at(keys, 0)?;
    let cost = int_arg(args, 0)?;
    let ttl = int_arg(args, 1)?;

    let count = keyspace
        .apply(
            now,
            Command::IncrBy {
                key: key.to_string(),
                delta: cost,
            },
        )?
        .as_i64()?;
    if count == cost {
        keyspace.apply(
            now,
            Command::Expire {
                key: key.to_string(),
                seconds: u64::try_from(ttl).unwrap_or(0),
            },
        )?;
    }
    Ok(vec![Value::Int(count)])
}

/// Increment a window counter, setting its TTL when the key is created.
///
/// `KEYS[1]` is the window key; `ARGV` is `cost, ttl_seconds`. Replies
/// `{count}`.
pub static SLIDING_INCREMENT_SCRIPT: Script = Script::new(
    "sliding_increment",
    SLIDING_INCREMENT_LUA,
    sliding_increment_native,
);

/// Sliding window counter algorithm.
pub struct SlidingWindow {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get_i64(key)
            .await?
            .map_or(0, |n| u64::try_from(n).unwrap_or(0)))
    }
}

fn remaining(max_requests: u64, estimate: f64) -> u64 {
    (max_requests as f64 - estimate).floor().max(0.0) as u64
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindow {
    async fn check(&self, key: &str, limit: &Limit, cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let current = Window::containing(now, limit.window_millis());
        let previous = current.previous();
        let current_key = current.key(key);

        if cost > limit.max_requests {
            trace!(key = %current_key, cost, "Cost exceeds the window limit");
            return Ok(Decision::deny(0, current.end(), current.retry_after_secs(now)));
        }

        let current_count = self.count(&current_key).await?;
        // The first window after the epoch has no predecessor
        let previous_count = if previous.start() == current.start() {
            0
        } else {
            self.count(&previous.key(key)).await?
        };

        let weight = 1.0 - current.progress(now);
        let estimate = previous_count as f64 * weight + current_count as f64;
        let extra = cost.saturating_sub(1) as f64;
        let max = limit.max_requests as f64;
        let allowed = estimate + extra < max;

        if !allowed {
            trace!(key = %current_key, estimate, "Sliding window denied");
            return Ok(Decision::deny(
                remaining(limit.max_requests, estimate),
                current.end(),
                current.retry_after_secs(now),
            ));
        }

        let reply = self
            .store
            .eval(
                &SLIDING_INCREMENT_SCRIPT,
                &[current_key.clone()],
                &[
                    cost.to_string(),
                    (limit.window_seconds.max(1) * 2).to_string(),
                ],
            )
            .await?;
        let updated = reply
            .first()
            .ok_or_else(|| StoreError::Malformed("empty sliding window reply".to_string()))?
            .as_i64()?;

        let estimate = previous_count as f64 * weight + updated.max(0) as f64;
        trace!(key = %current_key, estimate, "Sliding window allowed");
        Ok(Decision::allow(
            remaining(limit.max_requests, estimate),
            current.end(),
        ))
    }
}
