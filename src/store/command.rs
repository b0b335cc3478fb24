//! Primitive store commands and reply values.

use super::StoreError;

/// A primitive store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Incr { key: String },
    IncrBy { key: String, delta: i64 },
    Get { key: String },
    Set { key: String, value: String },
    Expire { key: String, seconds: u64 },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    ZAdd { key: String, score: f64, member: String },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    ZCard { key: String },
    Del { key: String },
}

impl Command {
    /// The Redis command name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Incr { .. } => "INCR",
            Command::IncrBy { .. } => "INCRBY",
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Expire { .. } => "EXPIRE",
            Command::HGet { .. } => "HGET",
            Command::HSet { .. } => "HSET",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZCard { .. } => "ZCARD",
            Command::Del { .. } => "DEL",
        }
    }

    /// The key this command operates on.
    pub fn key(&self) -> &str {
        match self {
            Command::Incr { key }
            | Command::IncrBy { key, .. }
            | Command::Get { key }
            | Command::Set { key, .. }
            | Command::Expire { key, .. }
            | Command::HGet { key, .. }
            | Command::HSet { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRemRangeByScore { key, .. }
            | Command::ZCard { key }
            | Command::Del { key } => key,
        }
    }

    /// Serialize into the word list understood by the Redis REST protocol.
    pub fn into_words(self) -> Vec<String> {
        let name = self.name().to_string();
        match self {
            Command::Incr { key }
            | Command::Get { key }
            | Command::ZCard { key }
            | Command::Del { key } => vec![name, key],
            Command::IncrBy { key, delta } => vec![name, key, delta.to_string()],
            Command::Set { key, value } => vec![name, key, value],
            Command::Expire { key, seconds } => vec![name, key, seconds.to_string()],
            Command::HGet { key, field } => vec![name, key, field],
            Command::HSet { key, field, value } => vec![name, key, field, value],
            Command::ZAdd { key, score, member } => vec![name, key, score.to_string(), member],
            Command::ZRemRangeByScore { key, min, max } => {
                vec![name, key, min.to_string(), max.to_string()]
            }
        }
    }
}

/// A reply from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Text(String),
    Array(Vec<Value>),
}

impl Value {
    /// Interpret the reply as an integer.
    ///
    /// Text replies holding a decimal integer are accepted since some
    /// transports stringify numbers.
    pub fn as_i64(&self) -> Result<i64, StoreError> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| StoreError::Malformed(format!("expected integer, got {s:?}"))),
            other => Err(StoreError::Malformed(format!("expected integer, got {other:?}"))),
        }
    }

    /// Interpret the reply as an optional string; `Nil` maps to `None`.
    pub fn into_optional_string(self) -> Result<Option<String>, StoreError> {
        match self {
            Value::Nil => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            Value::Int(n) => Ok(Some(n.to_string())),
            other => Err(StoreError::Malformed(format!("expected string, got {other:?}"))),
        }
    }

    /// Convert a JSON reply from the REST protocol.
    pub fn from_json(json: serde_json::Value) -> Result<Self, StoreError> {
        match json {
            serde_json::Value::Null => Ok(Value::Nil),
            serde_json::Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::Int)
                .ok_or_else(|| StoreError::Malformed(format!("unrepresentable number {n}"))),
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            serde_json::Value::Object(_) => {
                Err(StoreError::Malformed("unexpected object in reply".to_string()))
            }
        }
    }
}
