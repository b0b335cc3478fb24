//! Rule resolution for a single request.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::rules::{RateLimitRule, RuleSource};
use crate::error::Result;

/// Selects the rules that apply to a request, highest priority first.
#[derive(Clone)]
pub struct RuleResolver {
    source: Arc<dyn RuleSource>,
}

impl RuleResolver {
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        Self { source }
    }

    /// Applicable active rules ordered by priority descending.
    ///
    /// Rules of equal priority keep their source order.
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        resource: &str,
        identifier: Option<&str>,
    ) -> Result<Vec<RateLimitRule>> {
        let mut rules: Vec<RateLimitRule> = self
            .source
            .active_rules(tenant_id)
            .await?
            .into_iter()
            .filter(|rule| rule.active && rule.matches(resource, identifier))
            .collect();

        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(
            tenant_id = %tenant_id,
            resource,
            matched = rules.len(),
            "Resolved rate limit rules"
        );
        Ok(rules)
    }
}
