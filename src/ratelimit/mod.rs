//! Rate limiting logic and state management.

mod algorithm;
mod breaker;
mod decision;
mod engine;
mod fixed_window;
mod guard;
mod key;
mod resolver;
mod rules;
mod sliding_window;
mod token_bucket;

pub use algorithm::{Algorithms, Limit, RateLimitAlgorithm, Window};
pub use breaker::{CircuitBreaker, FailurePolicy};
pub use decision::{
    CheckRequest, Decision, DEFAULT_ALLOW_REMAINING, FAIL_CLOSED_RETRY_SECS, MAX_TOKENS,
};
pub use engine::RateLimitEngine;
pub use fixed_window::{FixedWindow, FIXED_WINDOW_SCRIPT};
pub use guard::{ApiGuard, ApiUsage};
pub use key::{credential_key, mask_credential, sanitize, sanitize_credential, RuleKey};
pub use resolver::RuleResolver;
pub use rules::{
    AlgorithmKind, IdentifierType, LimitScope, RateLimitRule, RuleSet, RuleSource, ANY_RESOURCE,
};
pub use sliding_window::{SlidingWindow, SLIDING_INCREMENT_SCRIPT};
pub use token_bucket::TokenBucket;
