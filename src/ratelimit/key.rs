//! Store key generation.
//!
//! Caller-supplied values never reach a store key verbatim: everything
//! outside `[A-Za-z0-9_-]` is replaced (rule keys) or dropped (credential
//! keys).

use uuid::Uuid;

use super::rules::{LimitScope, RateLimitRule};

fn is_key_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| if is_key_safe(c) { c } else { '_' })
        .collect()
}

/// Drop every character outside `[A-Za-z0-9_-]`.
pub fn sanitize_credential(input: &str) -> String {
    input.chars().filter(|&c| is_key_safe(c)).collect()
}

/// Key identifying the counter a rule maintains for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    /// Owning tenant
    pub tenant_id: Uuid,
    /// Scope the rule applies at
    pub scope: LimitScope,
    /// Sanitized resource, empty for global rules
    pub resource: String,
    /// Sanitized identifier, empty unless identifier scoped
    pub identifier: String,
    /// The rule maintaining the counter
    pub rule_id: Uuid,
}

impl RuleKey {
    /// Build the key for `rule` evaluated against a request.
    pub fn new(
        tenant_id: Uuid,
        rule: &RateLimitRule,
        resource: &str,
        identifier: Option<&str>,
    ) -> Self {
        let (resource, identifier) = match rule.scope {
            LimitScope::Global => (String::new(), String::new()),
            LimitScope::Resource => (sanitize(resource), String::new()),
            LimitScope::Identifier => (
                sanitize(resource),
                sanitize(identifier.unwrap_or_default()),
            ),
        };

        Self {
            tenant_id,
            scope: rule.scope,
            resource,
            identifier,
            rule_id: rule.id,
        }
    }

    /// Convert the key to its store representation.
    pub fn to_string_key(&self) -> String {
        match self.scope {
            LimitScope::Global => format!("rl:{}:global:{}", self.tenant_id, self.rule_id),
            LimitScope::Resource => {
                format!("rl:{}:res:{}:{}", self.tenant_id, self.resource, self.rule_id)
            }
            LimitScope::Identifier => format!(
                "rl:{}:id:{}:{}:{}",
                self.tenant_id, self.resource, self.identifier, self.rule_id
            ),
        }
    }
}

impl std::fmt::Display for RuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Store key for the ingress guard's counter of one credential.
pub fn credential_key(credential: &str) -> String {
    format!("api_rl:{}", sanitize_credential(credential))
}

/// Characters of a credential kept visible in logs.
const MASK_PREFIX_LEN: usize = 8;

/// Credential shortened for logs: the first 8 characters followed by `***`.
/// Credentials no longer than the prefix are masked entirely.
pub fn mask_credential(credential: &str) -> String {
    if credential.chars().count() <= MASK_PREFIX_LEN {
        return "***".to_string();
    }
    let prefix: String = credential.chars().take(MASK_PREFIX_LEN).collect();
    format!("{prefix}***")
}
