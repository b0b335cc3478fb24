//! Subscription tiers and monthly check quotas.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::usage::UsageLedger;
use crate::clock::Clock;
use crate::error::{Result, TollgateError};

/// Subscription tier of a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

/// Entitlements of a tier. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub max_rules: Option<usize>,
    pub max_checks_per_month: Option<u64>,
    pub allow_custom_algorithms: bool,
}

impl Tier {
    pub fn limits(self) -> TierLimits {
        match self {
            Tier::Free => TierLimits {
                max_rules: Some(1),
                max_checks_per_month: Some(10_000),
                allow_custom_algorithms: false,
            },
            Tier::Pro => TierLimits {
                max_rules: None,
                max_checks_per_month: Some(1_000_000),
                allow_custom_algorithms: false,
            },
            Tier::Enterprise => TierLimits {
                max_rules: None,
                max_checks_per_month: None,
                allow_custom_algorithms: true,
            },
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// A tenant's consumption of its monthly quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: Option<u64>,
}

impl QuotaUsage {
    /// Percentage of the quota consumed, `None` when unlimited.
    pub fn percent(&self) -> Option<f64> {
        match self.limit {
            Some(0) => Some(100.0),
            Some(limit) => Some(self.used as f64 * 100.0 / limit as f64),
            None => None,
        }
    }
}

/// Tier entitlements and quota enforcement.
#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Limits of the tenant's tier; `TollgateError::QuotaExceeded` when the
    /// monthly check quota is exhausted.
    async fn validate_check(&self, tenant_id: Uuid) -> Result<TierLimits>;

    /// Current monthly usage.
    async fn usage(&self, tenant_id: Uuid) -> Result<QuotaUsage>;
}

/// Configured tier assignment of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantTier {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub tier: Tier,
}

/// Quota service over configured tiers and the in-memory usage ledger.
///
/// Tenants without an assignment are on the free tier.
pub struct TierQuota {
    tiers: HashMap<Uuid, Tier>,
    ledger: Arc<UsageLedger>,
    clock: Arc<dyn Clock>,
}

impl TierQuota {
    pub fn new(
        tenants: impl IntoIterator<Item = TenantTier>,
        ledger: Arc<UsageLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers: tenants.into_iter().map(|t| (t.tenant_id, t.tier)).collect(),
            ledger,
            clock,
        }
    }

    pub fn tier_of(&self, tenant_id: Uuid) -> Tier {
        self.tiers.get(&tenant_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl QuotaService for TierQuota {
    async fn validate_check(&self, tenant_id: Uuid) -> Result<TierLimits> {
        let tier = self.tier_of(tenant_id);
        let limits = tier.limits();

        if let Some(max) = limits.max_checks_per_month {
            let used = self
                .ledger
                .checks_in_month(tenant_id, self.clock.now_millis())?;
            if used >= max {
                return Err(TollgateError::QuotaExceeded(format!(
                    "{tier} tier allows {max} checks per month, {used} used"
                )));
            }
        }
        Ok(limits)
    }

    async fn usage(&self, tenant_id: Uuid) -> Result<QuotaUsage> {
        let used = self
            .ledger
            .checks_in_month(tenant_id, self.clock.now_millis())?;
        Ok(QuotaUsage {
            used,
            limit: self.tier_of(tenant_id).limits().max_checks_per_month,
        })
    }
}
