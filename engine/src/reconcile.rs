//! Reconciliation of a remote change report against the retained snapshot.
//!
//! Given the remote snapshot as last reconciled (`prevRemote`) and a report
//! of deleted and added-or-modified remote records, this module produces:
//! - the `(previous, updated)` pairs to write to the local record store, and
//! - the snapshot as it will be once those writes land (`mutatedPrevRemote`).
//!
//! # Algorithm
//!
//! 1. Index the snapshot by GUID (and by group-id for records that have no
//!    GUID yet), and the report by GUID and group-id.
//! 2. Deletions: a reported GUID or group-id found in the snapshot yields a
//!    `(prev, None)` pair.
//! 3. Additions/modifications: a GUID match is diffed with
//!    [`apply_delta`](crate::delta::apply_delta) and emitted only if the
//!    content changed. A group-id match is the remote assigning a GUID to a
//!    record we exported, and is always emitted. Anything else is a pure
//!    remote addition.
//! 4. The new snapshot is the old one with replacements applied, deletions
//!    dropped, and pure additions appended.

use crate::correlate::IdentityIndex;
use crate::delta::apply_delta;
use crate::store::SyncPair;
use crate::{LocalId, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Result of reconciling one remote report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDelta {
    /// Writes for the local record store
    pub pairs: Vec<SyncPair>,
    /// Snapshot after the writes
    pub mutated_prev_remote: Vec<Record>,
    /// Counts, for logging
    pub stats: RemoteDeltaStats,
}

/// What a reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeltaStats {
    pub deleted: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub correlated: usize,
    pub added: usize,
    pub ignored: usize,
}

fn remove_exported(exported_ids: &mut Vec<LocalId>, id: &str) {
    exported_ids.retain(|e| e != id);
}

/// Reconcile a remote change report. `exported_ids` loses the identifiers of
/// records that were deleted remotely or have now received a GUID.
pub fn reconcile_remote(
    prev_remote: &[Record],
    remote_deleted: &[Record],
    remote_added_or_modified: &[Record],
    exported_ids: &mut Vec<LocalId>,
) -> RemoteDelta {
    let prev_index = IdentityIndex::for_snapshot(prev_remote);
    let deleted_index = IdentityIndex::for_report(remote_deleted);
    let changed_index = IdentityIndex::for_report(remote_added_or_modified);

    let mut stats = RemoteDeltaStats::default();
    let mut pairs = Vec::new();
    let mut removed: BTreeSet<usize> = BTreeSet::new();
    let mut replaced: BTreeMap<usize, Record> = BTreeMap::new();
    let mut appended: Vec<Record> = Vec::new();

    for (i, deleted) in remote_deleted.iter().enumerate() {
        if deleted_index.is_duplicate(i) {
            stats.ignored += 1;
            continue;
        }

        let by_guid = deleted.guid().and_then(|g| prev_index.by_guid(g));
        let by_group = deleted.group_id().and_then(|g| prev_index.by_group_id(g));

        let target = match (by_guid, by_group) {
            (Some(p), _) => p,
            (None, Some(p)) => {
                if let Some(group_id) = deleted.group_id() {
                    remove_exported(exported_ids, group_id);
                }
                p
            }
            (None, None) => {
                tracing::debug!(
                    guid = deleted.guid().unwrap_or_default(),
                    "Remote deletion has no local counterpart"
                );
                stats.ignored += 1;
                continue;
            }
        };

        if removed.insert(target) {
            pairs.push(SyncPair::delete(prev_remote[target].clone()));
            stats.deleted += 1;
        }
    }

    for (i, current) in remote_added_or_modified.iter().enumerate() {
        if changed_index.is_duplicate(i) {
            tracing::warn!(
                guid = current.guid().unwrap_or_default(),
                "Remote report lists the same record twice, keeping the first"
            );
            stats.ignored += 1;
            continue;
        }

        let Some(guid) = current.guid() else {
            tracing::warn!("Remote record without GUID ignored");
            stats.ignored += 1;
            continue;
        };

        if let Some(p) = prev_index.by_guid(guid) {
            if removed.contains(&p) {
                tracing::warn!(guid, "Remote record reported both deleted and modified");
                stats.ignored += 1;
                continue;
            }
            let prev = &prev_remote[p];
            let updated = apply_delta(prev, current);
            if updated.same_content(prev) {
                stats.unchanged += 1;
            } else {
                pairs.push(SyncPair::update(prev.clone(), updated.clone()));
                replaced.insert(p, updated);
                stats.modified += 1;
            }
            continue;
        }

        let by_group = current
            .group_id()
            .and_then(|g| prev_index.by_group_id(g))
            .filter(|p| !removed.contains(p) && !replaced.contains_key(p));
        if let Some(p) = by_group {
            let prev = &prev_remote[p];
            let updated = apply_delta(prev, current);
            if let Some(group_id) = current.group_id() {
                remove_exported(exported_ids, group_id);
            }
            if let Some(id) = &prev.id {
                remove_exported(exported_ids, id);
            }
            pairs.push(SyncPair::update(prev.clone(), updated.clone()));
            replaced.insert(p, updated);
            stats.correlated += 1;
            continue;
        }

        let addition = Record {
            id: None,
            ..current.clone()
        };
        pairs.push(SyncPair::insert(addition.clone()));
        appended.push(addition);
        stats.added += 1;
    }

    let mut mutated_prev_remote: Vec<Record> = prev_remote
        .iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(i, record)| replaced.remove(&i).unwrap_or_else(|| record.clone()))
        .collect();
    mutated_prev_remote.extend(appended);

    RemoteDelta {
        pairs,
        mutated_prev_remote,
        stats,
    }
}
