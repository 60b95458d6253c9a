//! Account provenance filtering of local changes.
//!
//! Several accounts may feed the same local record store. Before local
//! changes are pushed to one account's remote, everything that this account
//! cannot have produced is dropped.

use crate::local::LocalChanges;
use crate::record::guid_belongs_to;
use crate::{LocalId, Record};

/// Decides which local changes belong to an account.
pub trait ProvenanceFilter: Send + Sync {
    /// Filter `changes` in place for `account`.
    fn filter(&self, account: &str, changes: &mut LocalChanges, exported_ids: &[LocalId]);
}

/// Default policy.
///
/// - Additions lose their GUID; they cannot have a valid remote one yet.
/// - Modifications and deletions are kept only if their GUID was stamped by
///   this account or their local identifier was exported by it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountProvenance;

impl AccountProvenance {
    fn belongs(account: &str, record: &Record, exported_ids: &[LocalId]) -> bool {
        record.guid().is_some_and(|g| guid_belongs_to(g, account))
            || record
                .id
                .as_ref()
                .is_some_and(|id| exported_ids.contains(id))
    }
}

impl ProvenanceFilter for AccountProvenance {
    fn filter(&self, account: &str, changes: &mut LocalChanges, exported_ids: &[LocalId]) {
        for added in &mut changes.added {
            added.strip_guid();
        }

        let before = changes.modified.len() + changes.deleted.len();
        changes
            .modified
            .retain(|r| Self::belongs(account, r, exported_ids));
        changes
            .deleted
            .retain(|r| Self::belongs(account, r, exported_ids));
        let dropped = before - changes.modified.len() - changes.deleted.len();

        if dropped > 0 {
            tracing::debug!(
                account = %account,
                dropped,
                "Discarded local changes belonging to other accounts"
            );
        }
    }
}
