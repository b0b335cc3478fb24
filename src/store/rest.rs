//! Redis REST client.
//!
//! Speaks the Upstash-style REST protocol: every command is POSTed as a JSON
//! array of words with a bearer token, and the reply is a JSON object with
//! either a `result` or an `error` field.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

use super::command::{Command, Value};
use super::script::Script;
use super::{Store, StoreError};

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// [`Store`] backed by a remote Redis reached over HTTPS.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl RestStore {
    /// Create a client whose every request is bounded by `timeout`.
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn send(&self, words: Vec<String>) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&words)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        let reply: RestReply = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                error!(status = %status, "Store request failed");
                return Err(StoreError::Remote(format!("HTTP {status}")));
            }
            Err(e) => return Err(StoreError::Malformed(e.to_string())),
        };

        if let Some(message) = reply.error {
            return Err(StoreError::Remote(message));
        }
        if !status.is_success() {
            return Err(StoreError::Remote(format!("HTTP {status}")));
        }

        Value::from_json(reply.result.unwrap_or(serde_json::Value::Null))
    }
}

fn map_transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Transport(e.to_string())
    }
}

/// Build `EVAL script numkeys key [key ...] arg [arg ...]`.
fn eval_words(script: &Script, keys: &[String], args: &[String]) -> Vec<String> {
    let mut words = Vec::with_capacity(3 + keys.len() + args.len());
    words.push("EVAL".to_string());
    words.push(script.source().to_string());
    words.push(keys.len().to_string());
    words.extend(keys.iter().cloned());
    words.extend(args.iter().cloned());
    words
}

#[async_trait]
impl Store for RestStore {
    async fn execute(&self, command: Command) -> Result<Value, StoreError> {
        debug!(command = command.name(), key = command.key(), "store execute");
        self.send(command.into_words()).await
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        debug!(script = script.name(), keys = ?keys, "store eval");
        match self.send(eval_words(script, keys, args)).await? {
            Value::Array(items) => Ok(items),
            other => Err(StoreError::Malformed(format!(
                "script {} returned {other:?}, expected a tuple",
                script.name()
            ))),
        }
    }
}
