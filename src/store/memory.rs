//! In-process store emulation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::command::{Command, Value};
use super::script::Script;
use super::{Store, StoreError};
use crate::clock::Clock;

#[derive(Debug, Clone)]
enum Data {
    Text(String),
    Hash(HashMap<String, String>),
    SortedSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    /// Absolute expiry in epoch milliseconds
    expires_at: Option<u64>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }
}

/// The data held by a [`MemoryStore`].
///
/// Native scripts operate on the keyspace directly through
/// [`Keyspace::apply`], mirroring `redis.call` in Lua.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_if_expired(&mut self, key: &str, now: u64) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    /// Look up a live entry, evicting it if its TTL has elapsed.
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        self.evict_if_expired(key, now);
        self.entries.get_mut(key)
    }

    /// Look up a live entry or create it with `init`.
    fn live_or_insert(&mut self, key: &str, now: u64, init: fn() -> Data) -> &mut Entry {
        self.evict_if_expired(key, now);
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(init()))
    }

    /// Apply one primitive command at time `now` (epoch millis).
    pub fn apply(&mut self, now: u64, command: Command) -> Result<Value, StoreError> {
        match command {
            Command::Incr { key } => self.incr_by(now, key, 1),
            Command::IncrBy { key, delta } => self.incr_by(now, key, delta),
            Command::Get { key } => match self.live(&key, now) {
                None => Ok(Value::Nil),
                Some(Entry {
                    data: Data::Text(s),
                    ..
                }) => Ok(Value::Text(s.clone())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::Set { key, value } => {
                self.entries.insert(key, Entry::new(Data::Text(value)));
                Ok(Value::Text("OK".to_string()))
            }
            Command::Expire { key, seconds } => match self.live(&key, now) {
                Some(entry) => {
                    entry.expires_at = Some(now.saturating_add(seconds.saturating_mul(1000)));
                    Ok(Value::Int(1))
                }
                None => Ok(Value::Int(0)),
            },
            Command::HGet { key, field } => match self.live(&key, now) {
                None => Ok(Value::Nil),
                Some(Entry {
                    data: Data::Hash(map),
                    ..
                }) => Ok(map.get(&field).cloned().map_or(Value::Nil, Value::Text)),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::HSet { key, field, value } => {
                match &mut self.live_or_insert(&key, now, || Data::Hash(HashMap::new())).data {
                    Data::Hash(map) => {
                        let created = map.insert(field, value).is_none();
                        Ok(Value::Int(i64::from(created)))
                    }
                    _ => Err(StoreError::WrongType(key)),
                }
            }
            Command::ZAdd { key, score, member } => {
                match &mut self.live_or_insert(&key, now, || Data::SortedSet(Vec::new())).data {
                    Data::SortedSet(set) => {
                        if let Some(existing) = set.iter_mut().find(|(_, m)| *m == member) {
                            existing.0 = score;
                            Ok(Value::Int(0))
                        } else {
                            set.push((score, member));
                            Ok(Value::Int(1))
                        }
                    }
                    _ => Err(StoreError::WrongType(key)),
                }
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let (removed, now_empty) = match self.live(&key, now) {
                    None => return Ok(Value::Int(0)),
                    Some(Entry {
                        data: Data::SortedSet(set),
                        ..
                    }) => {
                        let before = set.len();
                        set.retain(|(score, _)| *score < min || *score > max);
                        (before - set.len(), set.is_empty())
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                if now_empty {
                    self.entries.remove(&key);
                }
                Ok(Value::Int(removed as i64))
            }
            Command::ZCard { key } => match self.live(&key, now) {
                None => Ok(Value::Int(0)),
                Some(Entry {
                    data: Data::SortedSet(set),
                    ..
                }) => Ok(Value::Int(set.len() as i64)),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::Del { key } => {
                let existed = self.live(&key, now).is_some();
                self.entries.remove(&key);
                Ok(Value::Int(i64::from(existed)))
            }
        }
    }

    fn incr_by(&mut self, now: u64, key: String, delta: i64) -> Result<Value, StoreError> {
        let entry = self.live_or_insert(&key, now, || Data::Text("0".to_string()));
        let Data::Text(current) = &mut entry.data else {
            return Err(StoreError::WrongType(key));
        };
        let value: i64 = current
            .parse()
            .map_err(|_| {
                StoreError::Remote("value is not an integer or out of range".to_string())
            })?;
        let updated = value
            .checked_add(delta)
            .ok_or_else(|| StoreError::Remote("increment would overflow".to_string()))?;
        *current = updated.to_string();
        Ok(Value::Int(updated))
    }

    /// Remaining time to live for a key, `None` when absent or persistent.
    pub fn ttl(&mut self, key: &str, now: u64) -> Option<Duration> {
        self.live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    /// Number of live keys.
    pub fn len(&mut self, now: u64) -> usize {
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        self.entries.len()
    }

    pub fn is_empty(&mut self, now: u64) -> bool {
        self.len(now) == 0
    }
}

/// In-process [`Store`] with true atomic script execution.
///
/// Commands and scripts run under one lock, so a script observes and
/// mutates the keyspace without interleaving. Expiry is driven by the
/// injected clock and applied lazily on access.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::new()),
            clock,
        }
    }

    /// Remaining time to live for a key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.keyspace.lock().ttl(key, now)
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.keyspace.lock().len(now)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, command: Command) -> Result<Value, StoreError> {
        let now = self.clock.now_millis();
        trace!(command = command.name(), key = command.key(), "memory store execute");
        self.keyspace.lock().apply(now, command)
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        let now = self.clock.now_millis();
        trace!(script = script.name(), keys = ?keys, "memory store eval");
        let mut keyspace = self.keyspace.lock();
        script.run_native(&mut keyspace, now, keys, args)
    }
}
