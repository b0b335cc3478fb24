//! Atomic scripts.
//!
//! A [`Script`] carries two renditions of the same multi-step operation: Lua
//! source for a remote Redis (`EVAL`) and a native body that
//! [`MemoryStore`](super::MemoryStore) runs while holding its keyspace lock.
//! Both must implement identical semantics.

use super::command::Value;
use super::memory::Keyspace;
use super::StoreError;

/// Native script body: `(keyspace, now_millis, keys, args) -> reply tuple`.
pub type NativeScript =
    fn(&mut Keyspace, u64, &[String], &[String]) -> Result<Vec<Value>, StoreError>;

/// A named atomic script.
#[derive(Clone, Copy)]
pub struct Script {
    name: &'static str,
    source: &'static str,
    native: NativeScript,
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str, native: NativeScript) -> Self {
        Self {
            name,
            source,
            native,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua source sent to a remote store.
    pub fn source(&self) -> &'static str {
        self.source
    }

    pub(crate) fn run_native(
        &self,
        keyspace: &mut Keyspace,
        now_millis: u64,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        (self.native)(keyspace, now_millis, keys, args)
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// Fetch `KEYS[index]`, failing like Redis would on a short key list.
pub(crate) fn key_at(keys: &[String], index: usize) -> Result<&str, StoreError> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Remote(format!("missing KEYS[{}]", index + 1)))
}

/// Fetch and parse `ARGV[index]` as an integer.
pub(crate) fn int_arg(args: &[String], index: usize) -> Result<i64, StoreError> {
    let raw = args
        .get(index)
        .ok_or_else(|| StoreError::Remote(format!("missing ARGV[{}]", index + 1)))?;
    raw.parse()
        .map_err(|_| StoreError::Remote(format!("ARGV[{}] is not a number: {raw}", index + 1)))
}
