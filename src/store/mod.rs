//! Shared counter store abstraction.
//!
//! Every algorithm talks to the store through the narrow [`Store`] trait:
//! single primitive commands via [`Store::execute`] and atomic multi-step
//! scripts via [`Store::eval`]. [`RestStore`] speaks to a remote Redis over its
//! REST interface; [`MemoryStore`] is an in-process emulation with the same
//! atomicity guarantees, used for tests and single-node deployments.

mod command;
mod memory;
mod rest;
pub(crate) mod script;

use async_trait::async_trait;
use thiserror::Error;

pub use command::{Command, Value};
pub use memory::{Keyspace, MemoryStore};
pub use rest::RestStore;
pub use script::{NativeScript, Script};

/// Errors surfaced by store implementations.
///
/// A store never hides a failure behind a default value; callers decide
/// how to degrade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request did not complete within the client timeout
    #[error("store request timed out")]
    Timeout,

    /// Connection or protocol level failure
    #[error("store transport failure: {0}")]
    Transport(String),

    /// The store executed the command and reported an error
    #[error("store reported an error: {0}")]
    Remote(String),

    /// The reply could not be interpreted
    #[error("malformed store reply: {0}")]
    Malformed(String),

    /// The store cannot run the requested script
    #[error("unsupported script: {0}")]
    UnsupportedScript(String),

    /// The command targeted a key holding another data type
    #[error("wrong type for key {0}")]
    WrongType(String),
}

/// Typed interface to a shared, network-accessible counter store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute a single primitive command.
    async fn execute(&self, command: Command) -> Result<Value, StoreError>;

    /// Execute a script atomically with the given ordered keys and arguments.
    ///
    /// Returns the script's reply as an ordered tuple.
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<Value>, StoreError>;
}

/// Typed helpers over the primitive commands.
#[async_trait]
pub trait StoreExt: Store {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.execute(Command::Get { key: key.to_string() })
            .await?
            .into_optional_string()
    }

    /// Read an integer counter, `None` when the key is absent.
    async fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.get(key).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| StoreError::Malformed(format!("{key} is not an integer: {raw}"))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.execute(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.execute(Command::Incr { key: key.to_string() })
            .await?
            .as_i64()
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        self.execute(Command::Expire {
            key: key.to_string(),
            seconds,
        })
        .await?
        .as_i64()
        .map(|n| n == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.execute(Command::HGet {
            key: key.to_string(),
            field: field.to_string(),
        })
        .await?
        .into_optional_string()
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.execute(Command::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<i64, StoreError> {
        self.execute(Command::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        })
        .await?
        .as_i64()
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<i64, StoreError> {
        self.execute(Command::ZRemRangeByScore {
            key: key.to_string(),
            min,
            max,
        })
        .await?
        .as_i64()
    }

    async fn zcard(&self, key: &str) -> Result<i64, StoreError> {
        self.execute(Command::ZCard { key: key.to_string() })
            .await?
            .as_i64()
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.execute(Command::Del { key: key.to_string() })
            .await?
            .as_i64()
            .map(|n| n == 1)
    }
}

impl<T: Store + ?Sized> StoreExt for T {}
