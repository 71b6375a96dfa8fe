//! In-memory key-value state shared by every request handler on a node.
//!
//! All access goes through one reader/writer lock: reads share it, `put`/`delete`
//! hold it exclusively. There is no per-key locking.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::protocol::{ReplicationKind, ReplicationOp};

/// An opaque JSON value. The store never looks inside it; the JSON text is kept
/// exactly as received and persisted byte-for-byte.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(Box<RawValue>);

impl Value {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.to_string()).map(Self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<Box<RawValue>>(bytes).map(Self)
    }

    pub fn as_json_str(&self) -> &str {
        self.0.get()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.get().as_bytes()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.as_json_str() == other.as_json_str()
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.as_json_str())
    }
}

pub type Entries = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Stored,
    Deleted,
    Missing,
}

#[derive(Debug, Default)]
pub struct Store {
    entries: RwLock<Entries>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_entries(entries: Entries) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Returns `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: String, value: Value) {
        self.entries.write().await.insert(key, value);
    }

    /// Returns `false` (and changes nothing) when the key is absent.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Applies an operation pushed by the leader. The caller has already validated
    /// the operation, so a put without a value is treated as a no-op miss.
    pub async fn apply(&self, op: ReplicationOp) -> ApplyOutcome {
        match op.kind {
            ReplicationKind::Put => match op.value {
                Some(value) => {
                    self.put(op.key, value).await;
                    ApplyOutcome::Stored
                }
                None => ApplyOutcome::Missing,
            },
            ReplicationKind::Delete => {
                if self.delete(&op.key).await {
                    ApplyOutcome::Deleted
                } else {
                    ApplyOutcome::Missing
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Holds the shared lock for as long as the guard lives.
    pub async fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().await
    }

    /// Holds the exclusive lock for as long as the guard lives.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().await
    }

    #[cfg(test)]
    pub async fn to_entries(&self) -> Entries {
        self.entries.read().await.clone()
    }
}
