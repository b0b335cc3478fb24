//! Caller credential validation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TollgateError};
use crate::ratelimit::mask_credential;

/// Resolves a caller credential to its tenant.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// The tenant owning `credential`, or `TollgateError::Credential`.
    async fn validate(&self, credential: &str) -> Result<Uuid>;
}

fn default_active() -> bool {
    true
}

/// One configured API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub key: String,
    pub tenant_id: Uuid,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Credentials held in memory, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, CredentialEntry>,
}

impl StaticCredentials {
    pub fn new(entries: impl IntoIterator<Item = CredentialEntry>) -> Self {
        Self {
            keys: entries
                .into_iter()
                .map(|entry| (entry.key.clone(), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl CredentialValidator for StaticCredentials {
    async fn validate(&self, credential: &str) -> Result<Uuid> {
        match self.keys.get(credential) {
            Some(entry) if entry.active => Ok(entry.tenant_id),
            Some(_) => {
                debug!(key = %mask_credential(credential), "Inactive API key presented");
                Err(TollgateError::Credential("API key is inactive".to_string()))
            }
            None => {
                debug!(key = %mask_credential(credential), "Unknown API key presented");
                Err(TollgateError::Credential("invalid API key".to_string()))
            }
        }
    }
}
