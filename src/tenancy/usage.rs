//! Per-check usage records and the monthly usage ledger.

use chrono::{DateTime, Datelike};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TollgateError};

/// Outcome of one engine check, emitted after every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: Uuid,
    pub resource: String,
    pub identifier: Option<String>,
    pub allowed: bool,
    pub latency_ms: u64,
    /// Epoch milliseconds
    pub timestamp_ms: u64,
}

/// Sink for usage records. Must not block the request path.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, record: UsageRecord) -> Result<()>;
}

/// Aggregated usage of one tenant over one calendar month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub checks: u64,
    pub denied: u64,
    pub total_latency_ms: u64,
}

impl UsageSummary {
    pub fn average_latency_ms(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.checks as f64
        }
    }
}

/// UTC (year, month) bucket containing an epoch-millisecond instant.
type MonthKey = (i32, u32);

fn month_of(timestamp_ms: u64) -> Result<MonthKey> {
    let millis = i64::try_from(timestamp_ms)
        .map_err(|_| TollgateError::Metrics(format!("timestamp {timestamp_ms} out of range")))?;
    let at = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| TollgateError::Metrics(format!("timestamp {timestamp_ms} out of range")))?;
    Ok((at.year(), at.month()))
}

/// In-memory usage counters per tenant and calendar month (UTC).
#[derive(Debug, Default)]
pub struct UsageLedger {
    months: DashMap<(Uuid, MonthKey), UsageSummary>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage of `tenant_id` in the month containing `at_ms`.
    pub fn summary(&self, tenant_id: Uuid, at_ms: u64) -> Result<UsageSummary> {
        let month = month_of(at_ms)?;
        Ok(self
            .months
            .get(&(tenant_id, month))
            .map(|entry| *entry)
            .unwrap_or_default())
    }

    /// Checks recorded for `tenant_id` in the month containing `at_ms`.
    pub fn checks_in_month(&self, tenant_id: Uuid, at_ms: u64) -> Result<u64> {
        self.summary(tenant_id, at_ms).map(|s| s.checks)
    }
}

impl MetricsRecorder for UsageLedger {
    fn record(&self, record: UsageRecord) -> Result<()> {
        let month = month_of(record.timestamp_ms)?;
        let mut entry = self.months.entry((record.tenant_id, month)).or_default();
        entry.checks += 1;
        if !record.allowed {
            entry.denied += 1;
        }
        entry.total_latency_ms += record.latency_ms;
        Ok(())
    }
}
