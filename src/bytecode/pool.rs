use crate::lang::value::Value;
use serde::{Deserialize, Serialize};

/// Index into a [`Pool`].
pub type PoolIndex = u32;

/// Append-only, index-addressed sequence of values.
///
/// Slot 0 always holds `Null`, so index 0 can double as "no entry" in
/// compact tables such as the per-instruction source map. Entries are never
/// removed or moved: an index handed out once stays valid for the lifetime
/// of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    entries: Vec<Value>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            entries: vec![Value::Null],
        }
    }

    /// Append a value and return its index.
    pub fn add(&mut self, value: Value) -> PoolIndex {
        self.entries.push(value);
        (self.entries.len() - 1) as PoolIndex
    }

    pub fn get(&self, index: PoolIndex) -> Option<&Value> {
        self.entries.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when only the sentinel is present.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolIndex, &Value)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, v)| (i as PoolIndex, v))
    }
}
