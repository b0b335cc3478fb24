//! Rate limit rules and rule storage.
//!
//! Rules are owned by an external management surface; the engine only reads
//! them through a [`RuleSource`]. [`RuleSet`] is the in-memory source, loaded
//! from a YAML file of the form:
//!
//! ```yaml
//! rules:
//!   - tenant_id: 6f1c2b9e-0c1d-4a8f-9a55-7d3c51a0b001
//!     resource: orders
//!     algorithm: sliding_window
//!     max_requests: 100
//!     window_seconds: 60
//!     scope: identifier
//!     priority: 10
//! ```
//!
//! The rule id is part of every store key. Rules loaded without an `id` get
//! one derived from their tenant, position, resource, scope and algorithm, so
//! every instance reading the same file shares counters.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::algorithm::Limit;
use crate::error::{Result, TollgateError};

/// Wildcard resource pattern matching every resource.
pub const ANY_RESOURCE: &str = "*";

/// Counting algorithm applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// What the request identifier represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    #[default]
    UserId,
    IpAddress,
    ApiKey,
    Custom,
}

/// Granularity at which a rule counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// One counter per tenant
    Global,
    /// One counter per tenant and resource
    #[default]
    Resource,
    /// One counter per tenant, resource and identifier
    Identifier,
}

fn default_active() -> bool {
    true
}

/// A tenant-owned rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Derived when omitted from a rule file; see [`RuleSet::from_yaml`]
    #[serde(default)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Exact resource name or `*`
    pub resource: String,
    pub algorithm: AlgorithmKind,
    pub max_requests: u64,
    pub window_seconds: u64,
    /// Token bucket capacity override
    #[serde(default)]
    pub burst_capacity: Option<u64>,
    #[serde(default)]
    pub identifier_type: IdentifierType,
    #[serde(default)]
    pub scope: LimitScope,
    /// Higher values are evaluated first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl RateLimitRule {
    /// Create an active resource-scoped rule with a fresh id.
    pub fn new(
        tenant_id: Uuid,
        resource: impl Into<String>,
        algorithm: AlgorithmKind,
        max_requests: u64,
        window_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            resource: resource.into(),
            algorithm,
            max_requests,
            window_seconds,
            burst_capacity: None,
            identifier_type: IdentifierType::default(),
            scope: LimitScope::default(),
            priority: 0,
            active: true,
        }
    }

    pub fn with_scope(mut self, scope: LimitScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_burst(mut self, burst_capacity: u64) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }

    pub fn with_identifier_type(mut self, identifier_type: IdentifierType) -> Self {
        self.identifier_type = identifier_type;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// The bounds this rule applies.
    pub fn limit(&self) -> Limit {
        Limit {
            max_requests: self.max_requests,
            window_seconds: self.window_seconds,
            burst_capacity: self.burst_capacity,
        }
    }

    fn matches_resource(&self, resource: &str) -> bool {
        self.resource == ANY_RESOURCE || self.resource == resource
    }

    /// Whether the rule applies to a request for `resource` by `identifier`.
    pub fn matches(&self, resource: &str, identifier: Option<&str>) -> bool {
        match self.scope {
            LimitScope::Global => true,
            LimitScope::Resource => self.matches_resource(resource),
            LimitScope::Identifier => {
                identifier.is_some_and(|id| !id.is_empty()) && self.matches_resource(resource)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(TollgateError::Rules(format!(
                "rule {} must allow at least one request",
                self.id
            )));
        }
        if self.window_seconds == 0 {
            return Err(TollgateError::Rules(format!(
                "rule {} must have a positive window",
                self.id
            )));
        }
        if self.burst_capacity == Some(0) {
            return Err(TollgateError::Rules(format!(
                "rule {} has a zero burst capacity",
                self.id
            )));
        }
        Ok(())
    }

    /// Deterministic id for the rule at `position` of a rule file.
    fn derived_id(&self, position: usize) -> Uuid {
        let name = format!(
            "{position}:{}:{:?}:{:?}",
            self.resource, self.scope, self.algorithm
        );
        Uuid::new_v5(&self.tenant_id, name.as_bytes())
    }
}

/// Read access to tenant rules.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Active rules of a tenant, in source order.
    async fn active_rules(&self, tenant_id: Uuid) -> Result<Vec<RateLimitRule>>;

    /// Every rule of a tenant, active or not.
    async fn rules_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RateLimitRule>>;

    /// Active rules of a tenant at one scope.
    async fn rules_by_scope(&self, tenant_id: Uuid, scope: LimitScope)
        -> Result<Vec<RateLimitRule>>;
}

/// In-memory rule repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Rules without an explicit `id` are given a deterministic one.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut set: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Rules(format!("Failed to parse rules: {}", e)))?;
        for (position, rule) in set.rules.iter_mut().enumerate() {
            if rule.id.is_nil() {
                let id = rule.derived_id(position);
                rule.id = id;
            }
            rule.validate()?;
        }
        Ok(set)
    }

    /// Add a rule, rejecting ones that can never be evaluated.
    pub fn push(&mut self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;
        self.rules.push(rule);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn tenant_rules(&self, tenant_id: Uuid) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter().filter(move |r| r.tenant_id == tenant_id)
    }
}

#[async_trait]
impl RuleSource for RuleSet {
    async fn active_rules(&self, tenant_id: Uuid) -> Result<Vec<RateLimitRule>> {
        Ok(self
            .tenant_rules(tenant_id)
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    async fn rules_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<RateLimitRule>> {
        Ok(self.tenant_rules(tenant_id).cloned().collect())
    }

    async fn rules_by_scope(
        &self,
        tenant_id: Uuid,
        scope: LimitScope,
    ) -> Result<Vec<RateLimitRule>> {
        Ok(self
            .tenant_rules(tenant_id)
            .filter(|r| r.active && r.scope == scope)
            .cloned()
            .collect())
    }
}
