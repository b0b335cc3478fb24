//! Fixed window counter.
//!
//! The whole read-increment-decide sequence runs as one atomic script, so two
//! concurrent callers can never both observe spare capacity and both be
//! admitted past the limit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{Limit, RateLimitAlgorithm, Window};
use super::decision::Decision;
use crate::clock::Clock;
use crate::store::{Command, Keyspace, Script, Store, StoreError, Value};

const FIXED_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window_seconds = tonumber(ARGV[2])
local window_start = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local cost = tonumber(ARGV[5])

local count = tonumber(redis.call('GET', key) or '0')

local allowed = 0
if count + cost <= max_requests then
    allowed = 1
    count = redis.call('INCRBY', key, cost)
    if count == cost then
        redis.call('EXPIRE', key, window_seconds)
    end
else
    count = count + cost
end

local remaining = math.max(0, max_requests - count)
local reset_at = window_start + (window_seconds * 1000)
local retry_after = 0
if allowed == 0 then
    retry_after = math.ceil((reset_at - now) / 1000)
end

return {allowed, remaining, reset_at, retry_after, count}
"#;

fn fixed_window_native(
    keyspace: &mut Keyspace,
    _now: u64,
    keys: &[String],
    args: &[String],
) -> Result<Vec<Value>, StoreError> {
    use crate::store::script::{int_arg, key_at};

    let key = key_at(keys, 0)?;
    let max_requests = int_arg(args, 0)?;
    let window_seconds = int_arg(args, 1)?;
    let window_start = int_arg(args, 2)?;
    let now = int_arg(args, 3)?;
    let cost = int_arg(args, 4)?;

    let now_ms = u64::try_from(now).unwrap_or(0);
    let mut count = match keyspace.apply(now_ms, Command::Get { key: key.to_string() })? {
        Value::Nil => 0,
        value => value.as_i64()?,
    };

    let total = count.saturating_add(cost);
    let allowed = total <= max_requests;
    if allowed {
        count = keyspace
            .apply(
                now_ms,
                Command::IncrBy {
                    key: key.to_string(),
                    delta: cost,
                },
            )?
            .as_i64()?;
        if count == cost {
            keyspace.apply(
                now_ms,
                Command::Expire {
                    key: key.to_string(),
                    seconds: u64::try_from(window_seconds).unwrap_or(0),
                },
            )?;
        }
    } else {
        count = total;
    }

    let remaining = (max_requests - count).max(0);
    let reset_at = window_start + window_seconds * 1000;
    let retry_after = if allowed {
        0
    } else {
        ((reset_at - now).max(0) + 999) / 1000
    };

    Ok(vec![
        Value::Int(i64::from(allowed)),
        Value::Int(remaining),
        Value::Int(reset_at),
        Value::Int(retry_after),
        Value::Int(count),
    ])
}

/// Atomic fixed-window check script.
///
/// `KEYS[1]` is the window key; `ARGV` is `max, window_seconds,
/// window_start, now, cost`. Replies `{allowed, remaining, reset_at,
/// retry_after, count}`.
pub static FIXED_WINDOW_SCRIPT: Script =
    Script::new("fixed_window", FIXED_WINDOW_LUA, fixed_window_native);

/// Parse a fixed-window script reply.
fn decision_from_reply(reply: &[Value]) -> Result<Decision, StoreError> {
    if reply.len() < 4 {
        return Err(StoreError::Malformed(format!(
            "fixed window reply has {} elements, expected at least 4",
            reply.len()
        )));
    }
    let non_negative = |v: &Value| v.as_i64().map(|n| u64::try_from(n).unwrap_or(0));

    Ok(Decision {
        allowed: reply[0].as_i64()? == 1,
        remaining: non_negative(&reply[1])?,
        reset_at: non_negative(&reply[2])?,
        retry_after: non_negative(&reply[3])?,
    })
}

/// Fixed window algorithm.
pub struct FixedWindow {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl FixedWindow {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindow {
    async fn check(&self, key: &str, limit: &Limit, cost: u64) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let window = Window::containing(now, limit.window_millis());
        let window_key = window.key(key);

        if cost > limit.max_requests {
            trace!(key = %window_key, cost, "Cost exceeds the window limit");
            return Ok(Decision::deny(0, window.end(), window.retry_after_secs(now)));
        }

        let reply = self
            .store
            .eval(
                &FIXED_WINDOW_SCRIPT,
                &[window_key.clone()],
                &[
                    limit.max_requests.to_string(),
                    limit.window_seconds.max(1).to_string(),
                    window.start().to_string(),
                    now.to_string(),
                    cost.to_string(),
                ],
            )
            .await?;

        let decision = decision_from_reply(&reply)?;
        trace!(
            key = %window_key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Fixed window checked"
        );
        Ok(decision)
    }
}
