//! Rate limit check requests and decisions.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Remaining count reported when no rule constrains the request.
pub const DEFAULT_ALLOW_REMAINING: u64 = 999;
/// How far out the default-allow decision resets.
const DEFAULT_ALLOW_RESET_MS: u64 = 3_600_000;
/// Retry-after applied when the store is unavailable and the policy is fail-closed.
pub const FAIL_CLOSED_RETRY_SECS: u64 = 60;
/// Largest token cost a request may carry; store counters are signed 64-bit.
pub const MAX_TOKENS: u64 = i64::MAX as u64;

/// Characters reserved for store key composition.
fn is_reserved(c: char) -> bool {
    c == ':' || c.is_whitespace()
}

/// An inbound "may I proceed?" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Caller-specific discriminator (user id, IP, ...)
    #[serde(default)]
    pub identifier: Option<String>,
    /// The protected resource
    pub resource: String,
    /// Token cost of the request
    #[serde(default = "default_tokens")]
    pub tokens: u64,
}

fn default_tokens() -> u64 {
    1
}

impl CheckRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            identifier: None,
            resource: resource.into(),
            tokens: default_tokens(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    /// The identifier, treating an empty string as absent.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref().filter(|id| !id.is_empty())
    }

    /// Reject requests that could not be safely composed into store keys.
    pub fn validate(&self) -> Result<()> {
        if self.resource.trim().is_empty() {
            return Err(TollgateError::Validation(
                "resource cannot be empty".to_string(),
            ));
        }
        if self.resource.chars().any(is_reserved) {
            return Err(TollgateError::Validation(
                "invalid characters in resource".to_string(),
            ));
        }
        if self.identifier().is_some_and(|id| id.chars().any(is_reserved)) {
            return Err(TollgateError::Validation(
                "invalid characters in identifier".to_string(),
            ));
        }
        if self.tokens == 0 {
            return Err(TollgateError::Validation(
                "tokens must be positive".to_string(),
            ));
        }
        if self.tokens > MAX_TOKENS {
            return Err(TollgateError::Validation(format!(
                "tokens must not exceed {MAX_TOKENS}"
            )));
        }
        Ok(())
    }
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the limit resets, epoch milliseconds
    pub reset_at: u64,
    /// Seconds to wait before retrying; zero when allowed
    pub retry_after: u64,
}

impl Decision {
    pub fn allow(remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after: 0,
        }
    }

    pub fn deny(remaining: u64, reset_at: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            reset_at,
            retry_after,
        }
    }

    /// Decision used when no rule applies or every rule failed open.
    pub fn default_allow(now_millis: u64) -> Self {
        Self::allow(DEFAULT_ALLOW_REMAINING, now_millis + DEFAULT_ALLOW_RESET_MS)
    }

    /// Decision used when the store is unavailable under a fail-closed policy.
    pub fn fail_closed(now_millis: u64) -> Self {
        Self::deny(
            0,
            now_millis + FAIL_CLOSED_RETRY_SECS * 1000,
            FAIL_CLOSED_RETRY_SECS,
        )
    }
}
