//! Algorithm strategy seam.
//!
//! The engine dispatches each rule to one of exactly three
//! [`RateLimitAlgorithm`] implementations, selected by the rule's
//! [`AlgorithmKind`].

use std::sync::Arc;

use async_trait::async_trait;

use super::decision::Decision;
use super::fixed_window::FixedWindow;
use super::rules::AlgorithmKind;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use crate::clock::Clock;
use crate::store::{Store, StoreError};

/// Bounds applied by one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Bucket capacity override for token buckets
    pub burst_capacity: Option<u64>,
}

impl Limit {
    pub fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
            burst_capacity: None,
        }
    }

    pub fn with_burst(mut self, burst_capacity: u64) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }

    /// Largest cost a single request can ever be granted.
    pub fn capacity(&self) -> u64 {
        self.burst_capacity.unwrap_or(self.max_requests)
    }

    /// Window length in milliseconds, never zero.
    pub fn window_millis(&self) -> u64 {
        self.window_seconds.max(1) * 1000
    }
}

/// An epoch-aligned fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    start: u64,
    length: u64,
}

impl Window {
    /// The window of `length` milliseconds containing `now`.
    pub fn containing(now: u64, length: u64) -> Self {
        let length = length.max(1);
        Self {
            start: now - now % length,
            length,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive end, which is also when the window's limit resets.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn previous(&self) -> Self {
        Self {
            start: self.start.saturating_sub(self.length),
            length: self.length,
        }
    }

    /// Fraction of the window elapsed at `now`, in `[0, 1)`.
    pub fn progress(&self, now: u64) -> f64 {
        (now.saturating_sub(self.start) as f64 / self.length as f64).min(1.0)
    }

    /// Store key for this window's counter.
    pub fn key(&self, base: &str) -> String {
        format!("{}:{}", base, self.start)
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        self.end().saturating_sub(now).div_ceil(1000)
    }
}

/// A counting algorithm deciding one (key, limit) check.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Charge `cost` against `key` under `limit` and decide.
    async fn check(&self, key: &str, limit: &Limit, cost: u64) -> Result<Decision, StoreError>;
}

/// The closed set of algorithm implementations, one per [`AlgorithmKind`].
#[derive(Clone)]
pub struct Algorithms {
    fixed_window: Arc<dyn RateLimitAlgorithm>,
    sliding_window: Arc<dyn RateLimitAlgorithm>,
    token_bucket: Arc<dyn RateLimitAlgorithm>,
}

impl Algorithms {
    /// Build the store-backed implementations.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            fixed_window: Arc::new(FixedWindow::new(store.clone(), clock.clone())),
            sliding_window: Arc::new(SlidingWindow::new(store.clone(), clock.clone())),
            token_bucket: Arc::new(TokenBucket::new(store, clock)),
        }
    }

    /// Assemble from explicit implementations.
    pub fn from_parts(
        fixed_window: Arc<dyn RateLimitAlgorithm>,
        sliding_window: Arc<dyn RateLimitAlgorithm>,
        token_bucket: Arc<dyn RateLimitAlgorithm>,
    ) -> Self {
        Self {
            fixed_window,
            sliding_window,
            token_bucket,
        }
    }

    pub fn get(&self, kind: AlgorithmKind) -> &dyn RateLimitAlgorithm {
        match kind {
            AlgorithmKind::FixedWindow => self.fixed_window.as_ref(),
            AlgorithmKind::SlidingWindow => self.sliding_window.as_ref(),
            AlgorithmKind::TokenBucket => self.token_bucket.as_ref(),
        }
    }
}
