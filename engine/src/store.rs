//! Local record store contract and an in-memory implementation.
//!
//! The engine needs two things from the local record store: apply a batch
//! of `(previous, updated)` pairs atomically, and report what changed since
//! a point in time. [`MemoryRecordStore`] implements both with sync-target
//! tagging, tombstones, and modification timestamps, and is what the tests
//! and benchmarks run against.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::{LocalId, Record, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// How a store write treats local changes made since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Apply only the remote delta; skip records deleted locally
    #[default]
    PreserveLocalChanges,
    /// Overwrite the local record with the remote version
    PreferRemote,
}

/// One write: `None` previous inserts, `None` updated deletes, both present
/// updates while preserving detail identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPair {
    pub prev: Option<Record>,
    pub updated: Option<Record>,
}

impl SyncPair {
    pub fn insert(record: Record) -> Self {
        Self {
            prev: None,
            updated: Some(record),
        }
    }

    pub fn update(prev: Record, updated: Record) -> Self {
        Self {
            prev: Some(prev),
            updated: Some(updated),
        }
    }

    pub fn delete(prev: Record) -> Self {
        Self {
            prev: Some(prev),
            updated: None,
        }
    }
}

/// Local changes reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedChanges {
    pub modified: Vec<Record>,
    pub added: Vec<Record>,
    pub deleted_ids: Vec<LocalId>,
}

/// The local record store, as the engine sees it.
pub trait RecordStore: Send + Sync {
    /// Whether the store connection is usable.
    fn is_available(&self) -> bool {
        true
    }

    /// Apply `pairs` atomically. On success every inserted or updated record
    /// in `pairs` carries its local id and the identities of its details.
    fn store_sync_records(
        &self,
        sync_target: &str,
        policy: ConflictPolicy,
        pairs: &mut [SyncPair],
    ) -> Result<(), StoreError>;

    /// Records tagged with `sync_target`, or listed in `exported_ids`, that
    /// changed after `since` (everything when `since` is unset).
    fn fetch_sync_records(
        &self,
        sync_target: &str,
        since: Option<Timestamp>,
        exported_ids: &[LocalId],
    ) -> Result<FetchedChanges, StoreError>;
}

impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn store_sync_records(
        &self,
        sync_target: &str,
        policy: ConflictPolicy,
        pairs: &mut [SyncPair],
    ) -> Result<(), StoreError> {
        (**self).store_sync_records(sync_target, policy, pairs)
    }

    fn fetch_sync_records(
        &self,
        sync_target: &str,
        since: Option<Timestamp>,
        exported_ids: &[LocalId],
    ) -> Result<FetchedChanges, StoreError> {
        (**self).fetch_sync_records(sync_target, since, exported_ids)
    }
}

/// Who created a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created by a local user
    Local,
    /// Created by a sync write
    Remote,
}

#[derive(Debug, Clone)]
struct Row {
    record: Record,
    origin: Origin,
    created_at: Timestamp,
    modified_at: Timestamp,
    deleted_at: Option<Timestamp>,
    seq: u64,
}

impl Row {
    fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<LocalId, Row>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Give every detail without an identity a fresh one.
fn assign_detail_ids(record: &mut Record) {
    for detail in &mut record.details {
        if detail.id.is_none() {
            detail.id = Some(new_id());
        }
    }
}

/// Apply the `prev -> updated` delta to `current`, matching details by
/// identity. Local details that the delta does not touch are kept.
fn merge_preserving_local(current: &mut Record, prev: &Record, updated: &Record) {
    for old in prev.details.iter().filter(|d| d.id.is_some()) {
        let counterpart = updated.details.iter().find(|d| d.id == old.id);
        match counterpart {
            None => current.details.retain(|d| d.id != old.id),
            Some(new) if !new.same_values(old) => {
                if let Some(slot) = current.details.iter_mut().find(|d| d.id == old.id) {
                    *slot = new.clone();
                }
            }
            Some(_) => {}
        }
    }

    for new in &updated.details {
        let known = current.details.iter().any(|d| d.id == new.id)
            || prev.details.iter().any(|d| d.id == new.id);
        if !known {
            current.details.push(new.clone());
        }
    }
}

/// An in-memory local record store.
#[derive(Debug)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    fail_next_write: AtomicBool,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryRecordStore {
    /// Create an empty store that timestamps writes with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            available: AtomicBool::new(true),
            fail_next_write: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }

    /// Simulate the connection going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next batch write fail without applying anything.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Create a record as a local user would. Returns its local id.
    pub fn insert_local(
        &self,
        mut record: Record,
        sync_target: Option<&str>,
    ) -> Result<LocalId, StoreError> {
        let now = self.clock.now();
        let id = new_id();
        record.id = Some(id.clone());
        if let Some(target) = sync_target {
            record.set_sync_target(target);
        }
        record.touch(now);
        assign_detail_ids(&mut record);

        let mut inner = self.lock()?;
        let seq = inner.next_seq();
        inner.rows.insert(
            id.clone(),
            Row {
                record,
                origin: Origin::Local,
                created_at: now,
                modified_at: now,
                deleted_at: None,
                seq,
            },
        );
        Ok(id)
    }

    /// Edit a record as a local user would.
    pub fn modify_local<F>(&self, id: &str, edit: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Record),
    {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let row = inner
            .rows
            .get_mut(id)
            .filter(|r| r.is_active())
            .ok_or_else(|| StoreError::Rejected(format!("no active record {}", id)))?;
        edit(&mut row.record);
        row.record.touch(now);
        assign_detail_ids(&mut row.record);
        row.modified_at = now;
        Ok(())
    }

    /// Delete a record as a local user would.
    pub fn delete_local(&self, id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let row = inner
            .rows
            .get_mut(id)
            .filter(|r| r.is_active())
            .ok_or_else(|| StoreError::Rejected(format!("no active record {}", id)))?;
        row.deleted_at = Some(now);
        row.modified_at = now;
        Ok(())
    }

    /// An active record by local id.
    pub fn get(&self, id: &str) -> Option<Record> {
        let inner = self.lock().ok()?;
        inner
            .rows
            .get(id)
            .filter(|r| r.is_active())
            .map(|r| r.record.clone())
    }

    /// All active records, in creation order.
    pub fn records(&self) -> Vec<Record> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let mut rows: Vec<&Row> = inner.rows.values().filter(|r| r.is_active()).collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.record.clone()).collect()
    }

    /// The active record carrying `guid`.
    pub fn find_by_guid(&self, guid: &str) -> Option<Record> {
        self.records().into_iter().find(|r| r.guid() == Some(guid))
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(inner: &Inner, pairs: &[SyncPair]) -> Result<(), StoreError> {
        for pair in pairs {
            match (&pair.prev, &pair.updated) {
                (None, None) => {
                    return Err(StoreError::Rejected("empty sync pair".into()));
                }
                (Some(prev), _) => {
                    let id = prev.id.as_deref().ok_or_else(|| {
                        StoreError::Rejected("previous snapshot has no local id".into())
                    })?;
                    if !inner.rows.contains_key(id) {
                        return Err(StoreError::Rejected(format!("unknown record {}", id)));
                    }
                }
                (None, Some(_)) => {}
            }
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn store_sync_records(
        &self,
        sync_target: &str,
        policy: ConflictPolicy,
        pairs: &mut [SyncPair],
    ) -> Result<(), StoreError> {
        if !self.is_available() {
            return Err(StoreError::Unavailable);
        }
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Rejected("injected write failure".into()));
        }

        let now = self.clock.now();
        let mut inner = self.lock()?;
        Self::validate(&inner, pairs)?;

        for pair in pairs.iter_mut() {
            let prev_id = pair.prev.as_ref().and_then(|p| p.id.clone());
            match (prev_id, pair.updated.as_mut()) {
                (None, Some(updated)) => {
                    let id = new_id();
                    updated.id = Some(id.clone());
                    updated.touch(now);
                    assign_detail_ids(updated);

                    let mut stored = updated.clone();
                    stored.set_sync_target(sync_target);
                    assign_detail_ids(&mut stored);
                    let seq = inner.next_seq();
                    inner.rows.insert(
                        id,
                        Row {
                            record: stored,
                            origin: Origin::Remote,
                            created_at: now,
                            modified_at: now,
                            deleted_at: None,
                            seq,
                        },
                    );
                }
                (Some(id), None) => {
                    if let Some(row) = inner.rows.get_mut(&id).filter(|r| r.is_active()) {
                        row.deleted_at = Some(now);
                        row.modified_at = now;
                    }
                }
                (Some(id), Some(updated)) => {
                    let Some(row) = inner.rows.get_mut(&id) else {
                        continue;
                    };
                    if !row.is_active() && policy == ConflictPolicy::PreserveLocalChanges {
                        tracing::debug!(id = %id, "Skipping remote update of locally deleted record");
                        continue;
                    }

                    updated.id = Some(id.clone());
                    updated.touch(now);
                    assign_detail_ids(updated);

                    match policy {
                        ConflictPolicy::PreserveLocalChanges => {
                            if let Some(prev) = pair.prev.as_ref() {
                                merge_preserving_local(&mut row.record, prev, updated);
                            }
                        }
                        ConflictPolicy::PreferRemote => {
                            row.record.details = updated.details.clone();
                            row.deleted_at = None;
                        }
                    }
                    row.record.set_sync_target(sync_target);
                    row.record.touch(now);
                    assign_detail_ids(&mut row.record);
                    row.modified_at = now;
                }
                (None, None) => {}
            }
        }

        Ok(())
    }

    fn fetch_sync_records(
        &self,
        sync_target: &str,
        since: Option<Timestamp>,
        exported_ids: &[LocalId],
    ) -> Result<FetchedChanges, StoreError> {
        if !self.is_available() {
            return Err(StoreError::Unavailable);
        }

        let inner = self.lock()?;
        let mut rows: Vec<(&LocalId, &Row)> = inner
            .rows
            .iter()
            .filter(|(id, row)| {
                row.record.sync_target() == Some(sync_target) || exported_ids.contains(*id)
            })
            .collect();
        rows.sort_by_key(|(_, row)| row.seq);

        let after = |t: Timestamp| since.map_or(true, |s| t > s);
        let mut changes = FetchedChanges::default();

        for (id, row) in rows {
            if let Some(deleted_at) = row.deleted_at {
                if after(deleted_at) {
                    changes.deleted_ids.push(id.clone());
                }
                continue;
            }
            if !after(row.modified_at) {
                continue;
            }
            // A local record that already has a GUID has been synced before.
            if row.origin == Origin::Local && after(row.created_at) && row.record.guid().is_none() {
                changes.added.push(row.record.clone());
            } else {
                changes.modified.push(row.record.clone());
            }
        }

        Ok(changes)
    }
}
