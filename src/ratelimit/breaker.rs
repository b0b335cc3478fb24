//! Store failure tracking and degradation policy.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// What to decide when the store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep serving traffic as if no limit applied
    #[default]
    FailOpen,
    /// Deny with a fixed retry delay
    FailClosed,
}

impl FailurePolicy {
    pub fn from_fail_open(fail_open: bool) -> Self {
        if fail_open {
            Self::FailOpen
        } else {
            Self::FailClosed
        }
    }
}

/// Consecutive store failure counter.
///
/// Purely observational: crossing the threshold is reported but never
/// short-circuits store calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// Count a failure, returning the new consecutive total.
    pub fn record_failure(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive_failures() >= self.threshold
    }
}
