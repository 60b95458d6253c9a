//! Local change determination.
//!
//! Turns what the local record store reports as changed since the last
//! cycle into the changes that must be pushed to the remote, and folds them
//! into the working remote snapshot.

use crate::correlate::IdentityIndex;
use crate::provenance::ProvenanceFilter;
use crate::session::SessionState;
use crate::store::FetchedChanges;
use crate::{Record, Timestamp};
use serde::{Deserialize, Serialize};

/// Local changes to push to the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChanges {
    /// Watermark the changes were collected from (unset on a clean sync)
    pub local_since: Option<Timestamp>,
    /// New local records; each carries its local id as group-id and no GUID
    pub added: Vec<Record>,
    /// Modified local records
    pub modified: Vec<Record>,
    /// Last known remote snapshot of each locally deleted record
    pub deleted: Vec<Record>,
}

impl LocalChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Whether a reported local record is the stored form of a snapshot entry.
fn absorbs(entry: &Record, reported: &Record) -> bool {
    (entry.id.is_none() || entry.same_identity(reported)) && entry.same_content(reported)
}

/// Fold reported modifications into the snapshot on a clean sync. Returns
/// the modifications that match no snapshot entry.
fn fold_clean_sync(account: &str, session: &mut SessionState, modified: Vec<Record>) -> Vec<Record> {
    let index = IdentityIndex::for_snapshot(&session.mutated_prev_remote);
    let mut unmatched = Vec::new();

    for record in modified {
        match index.find(&record) {
            Some(i) => session.mutated_prev_remote[i] = record,
            None if record.guid().is_some() => {
                tracing::warn!(
                    account = %account,
                    guid = record.guid().unwrap_or_default(),
                    "Local record with GUID missing from remote snapshot during clean sync"
                );
            }
            None => unmatched.push(record),
        }
    }

    unmatched
}

/// Determine local changes for `account` and fold them into
/// `session.mutated_prev_remote`.
pub fn determine_local_changes<F>(
    account: &str,
    session: &mut SessionState,
    fetched: FetchedChanges,
    filter: &F,
) -> LocalChanges
where
    F: ProvenanceFilter + ?Sized,
{
    session.ensure_mutated();

    let FetchedChanges {
        mut added,
        mut modified,
        deleted_ids,
    } = fetched;
    let mut deleted = Vec::new();

    match session.local_since {
        None => {
            if !deleted_ids.is_empty() {
                tracing::debug!(
                    account = %account,
                    count = deleted_ids.len(),
                    "Ignoring local deletions during clean sync"
                );
            }
            // Never uploaded and not remote-origin: these are additions.
            let unmatched = fold_clean_sync(account, session, std::mem::take(&mut modified));
            added.extend(unmatched);
        }
        Some(_) => {
            for id in &deleted_ids {
                let position = session
                    .mutated_prev_remote
                    .iter()
                    .position(|r| r.id.as_deref() == Some(id.as_str()));
                match position {
                    Some(i) => deleted.push(session.mutated_prev_remote.remove(i)),
                    None => tracing::debug!(
                        account = %account,
                        id = %id,
                        "Local deletion of a record already removed remotely"
                    ),
                }
            }

            for entry in session.mutated_prev_remote.iter_mut() {
                if let Some(i) = added.iter().position(|r| absorbs(entry, r)) {
                    *entry = added.remove(i);
                } else if let Some(i) = modified.iter().position(|r| absorbs(entry, r)) {
                    *entry = modified.remove(i);
                }
            }

            let index = IdentityIndex::for_snapshot(&session.mutated_prev_remote);
            for record in &modified {
                if index.find(record).is_none() {
                    tracing::warn!(
                        account = %account,
                        id = record.id.as_deref().unwrap_or_default(),
                        "Local modification has no counterpart in the remote snapshot"
                    );
                }
            }
        }
    }

    // Without a local id the remote copy could never be correlated back.
    added.retain(|record| {
        if record.id.is_none() {
            tracing::warn!(account = %account, "Dropping local addition without identifier");
        }
        record.id.is_some()
    });
    for record in &mut added {
        if let Some(id) = record.id.clone() {
            session.export(&id);
            record.strip_guid();
            record.set_group_id(id);
        }
    }

    let mut changes = LocalChanges {
        local_since: session.local_since,
        added,
        modified,
        deleted,
    };
    filter.filter(account, &mut changes, &session.exported_ids);

    for record in &changes.deleted {
        if let Some(id) = &record.id {
            session.exported_ids.retain(|e| e != id);
        }
    }

    session
        .mutated_prev_remote
        .extend(changes.added.iter().cloned());
    for record in &changes.modified {
        let existing = session
            .mutated_prev_remote
            .iter()
            .position(|e| e.same_identity(record));
        match existing {
            Some(i) => session.mutated_prev_remote[i] = record.clone(),
            None => session.mutated_prev_remote.push(record.clone()),
        }
    }

    tracing::debug!(
        account = %account,
        added = changes.added.len(),
        modified = changes.modified.len(),
        deleted = changes.deleted.len(),
        "Determined local changes"
    );

    changes
}
