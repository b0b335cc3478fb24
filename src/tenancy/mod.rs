//! Tenant-facing collaborators of the engine.
//!
//! Each concern is a trait so the engine can be wired against remote
//! services; the in-process implementations here are driven by configuration.

mod alerts;
mod credentials;
mod quota;
mod usage;

pub use alerts::{Alert, AlertDispatcher, LogAlertDispatcher};
pub use credentials::{CredentialEntry, CredentialValidator, StaticCredentials};
pub use quota::{QuotaService, QuotaUsage, TenantTier, Tier, TierLimits, TierQuota};
pub use usage::{MetricsRecorder, UsageLedger, UsageRecord, UsageSummary};
