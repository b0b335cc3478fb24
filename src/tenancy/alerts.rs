//! Operational alerts.

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Events worth a human's attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// Monthly usage crossed an alert threshold
    QuotaApproaching {
        tenant_id: Uuid,
        percent: u8,
        used: u64,
        limit: u64,
    },
    /// Monthly quota exhausted; checks are being rejected
    QuotaExceeded { tenant_id: Uuid },
    /// The shared store keeps failing
    StoreDegraded {
        tenant_id: Uuid,
        consecutive_failures: u32,
    },
}

/// Sink for alerts. Must not block the request path.
pub trait AlertDispatcher: Send + Sync {
    fn dispatch(&self, alert: Alert);
}

/// Reports alerts as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertDispatcher;

impl AlertDispatcher for LogAlertDispatcher {
    fn dispatch(&self, alert: Alert) {
        match alert {
            Alert::QuotaApproaching {
                tenant_id,
                percent,
                used,
                limit,
            } => warn!(
                tenant_id = %tenant_id,
                percent,
                used,
                limit,
                "Tenant approaching monthly check quota"
            ),
            Alert::QuotaExceeded { tenant_id } => {
                warn!(tenant_id = %tenant_id, "Tenant exceeded monthly check quota")
            }
            Alert::StoreDegraded {
                tenant_id,
                consecutive_failures,
            } => warn!(
                tenant_id = %tenant_id,
                consecutive_failures,
                "Rate limit store degraded"
            ),
        }
    }
}
