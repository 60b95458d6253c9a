//! Session state persistence.
//!
//! Between cycles an account's bookkeeping lives in a small key/value side
//! store, separate from the record store. Each account uses exactly four
//! keys under its own scope. Values are opaque strings owned by the engine:
//! timestamps are RFC 3339, lists are JSON wrapped in a versioned envelope.

use crate::error::{Error, Result, StoreError};
use crate::{LocalId, Record, Timestamp};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Version of the envelope around serialized lists.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// The keys an account's session state is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateKey {
    RemoteSince,
    LocalSince,
    PrevRemote,
    ExportedIds,
}

impl StateKey {
    pub const ALL: [StateKey; 4] = [
        StateKey::RemoteSince,
        StateKey::LocalSince,
        StateKey::PrevRemote,
        StateKey::ExportedIds,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StateKey::RemoteSince => "remoteSince",
            StateKey::LocalSince => "localSince",
            StateKey::PrevRemote => "prevRemote",
            StateKey::ExportedIds => "exportedIds",
        }
    }
}

/// A scoped key/value side store.
pub trait StateStore: Send + Sync {
    /// Values of `keys` in `scope`; missing keys are simply absent.
    fn get(&self, scope: &str, keys: &[StateKey])
        -> std::result::Result<BTreeMap<StateKey, String>, StoreError>;

    /// Write `values` into `scope`.
    fn put(
        &self,
        scope: &str,
        values: BTreeMap<StateKey, String>,
    ) -> std::result::Result<(), StoreError>;

    /// Remove `keys` from `scope`.
    fn remove(&self, scope: &str, keys: &[StateKey]) -> std::result::Result<(), StoreError>;
}

impl<T: StateStore + ?Sized> StateStore for std::sync::Arc<T> {
    fn get(
        &self,
        scope: &str,
        keys: &[StateKey],
    ) -> std::result::Result<BTreeMap<StateKey, String>, StoreError> {
        (**self).get(scope, keys)
    }

    fn put(
        &self,
        scope: &str,
        values: BTreeMap<StateKey, String>,
    ) -> std::result::Result<(), StoreError> {
        (**self).put(scope, values)
    }

    fn remove(&self, scope: &str, keys: &[StateKey]) -> std::result::Result<(), StoreError> {
        (**self).remove(scope, keys)
    }
}

/// Versioned wrapper for serialized lists.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    format_version: u32,
    data: T,
}

fn encode<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string(&Envelope {
        format_version: STATE_FORMAT_VERSION,
        data,
    })
    .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: StateKey, raw: &str) -> Result<T> {
    let envelope: Envelope<T> =
        serde_json::from_str(raw).map_err(|e| corrupt(key, e.to_string()))?;
    if envelope.format_version != STATE_FORMAT_VERSION {
        return Err(corrupt(
            key,
            format!("unsupported format version {}", envelope.format_version),
        ));
    }
    Ok(envelope.data)
}

fn decode_timestamp(key: StateKey, raw: &str) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(key, e.to_string()))
}

/// A stored value that cannot be read back.
fn corrupt(key: StateKey, reason: String) -> Error {
    Error::StateStore(StoreError::Corrupt(format!("{}: {}", key.as_str(), reason)))
}

/// An account's state as persisted between cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub remote_since: Option<Timestamp>,
    pub local_since: Option<Timestamp>,
    pub prev_remote: Vec<Record>,
    pub exported_ids: Vec<LocalId>,
}

impl PersistedState {
    /// Load from `scope`. Missing keys read as empty or unset.
    pub fn load<S: StateStore + ?Sized>(store: &S, scope: &str) -> Result<Self> {
        let values = store
            .get(scope, &StateKey::ALL)
            .map_err(Error::StateStore)?;

        let timestamp = |key| {
            values
                .get(&key)
                .map(|raw: &String| decode_timestamp(key, raw))
                .transpose()
        };

        Ok(Self {
            remote_since: timestamp(StateKey::RemoteSince)?,
            local_since: timestamp(StateKey::LocalSince)?,
            prev_remote: values
                .get(&StateKey::PrevRemote)
                .map(|raw| decode(StateKey::PrevRemote, raw))
                .transpose()?
                .unwrap_or_default(),
            exported_ids: values
                .get(&StateKey::ExportedIds)
                .map(|raw| decode(StateKey::ExportedIds, raw))
                .transpose()?
                .unwrap_or_default(),
        })
    }

    /// Write all four keys to `scope`. Unset timestamps are removed.
    pub fn save<S: StateStore + ?Sized>(&self, store: &S, scope: &str) -> Result<()> {
        let mut values = BTreeMap::new();
        let mut unset = Vec::new();

        for (key, value) in [
            (StateKey::RemoteSince, self.remote_since),
            (StateKey::LocalSince, self.local_since),
        ] {
            match value {
                Some(t) => {
                    values.insert(key, t.to_rfc3339());
                }
                None => unset.push(key),
            }
        }
        values.insert(StateKey::PrevRemote, encode(&self.prev_remote)?);
        values.insert(StateKey::ExportedIds, encode(&self.exported_ids)?);

        store.put(scope, values).map_err(Error::StateStore)?;
        if !unset.is_empty() {
            store.remove(scope, &unset).map_err(Error::StateStore)?;
        }
        Ok(())
    }

    /// Remove every key of `scope`.
    pub fn purge<S: StateStore + ?Sized>(store: &S, scope: &str) -> Result<()> {
        store
            .remove(scope, &StateKey::ALL)
            .map_err(Error::StateStore)
    }
}

/// An in-memory side store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    scopes: DashMap<String, BTreeMap<StateKey, String>>,
    fail_next: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> std::result::Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    /// Raw value of one key.
    pub fn raw(&self, scope: &str, key: StateKey) -> Option<String> {
        self.scopes.get(scope).and_then(|s| s.get(&key).cloned())
    }

    /// Overwrite one raw value.
    pub fn set_raw(&self, scope: &str, key: StateKey, value: impl Into<String>) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key, value.into());
    }

    /// Whether `scope` holds any key.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.get(scope).is_some_and(|s| !s.is_empty())
    }
}

impl StateStore for MemoryStateStore {
    fn get(
        &self,
        scope: &str,
        keys: &[StateKey],
    ) -> std::result::Result<BTreeMap<StateKey, String>, StoreError> {
        self.check()?;
        let Some(values) = self.scopes.get(scope) else {
            return Ok(BTreeMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| values.get(k).map(|v| (*k, v.clone())))
            .collect())
    }

    fn put(
        &self,
        scope: &str,
        values: BTreeMap<StateKey, String>,
    ) -> std::result::Result<(), StoreError> {
        self.check()?;
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .extend(values);
        Ok(())
    }

    fn remove(&self, scope: &str, keys: &[StateKey]) -> std::result::Result<(), StoreError> {
        self.check()?;
        if let Some(mut values) = self.scopes.get_mut(scope) {
            for key in keys {
                values.remove(key);
            }
        }
        Ok(())
    }
}
