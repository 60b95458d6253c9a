//! Identity correlation between remote-origin records and local records.
//!
//! Indices are rebuilt from scratch every cycle; nothing here is persisted.

use crate::Record;
use std::collections::HashMap;

/// How group-ids are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupIdIndexing {
    /// Only records without a GUID are reachable by group-id (the retained
    /// remote snapshot)
    WithoutGuidOnly,
    /// Every record carrying a group-id is reachable by it (a remote report)
    All,
}

/// GUID, group-id and local-id lookups over a slice of records.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    by_guid: HashMap<String, usize>,
    by_group_id: HashMap<String, usize>,
    by_local_id: HashMap<String, usize>,
    duplicates: Vec<usize>,
}

impl IdentityIndex {
    /// Build an index. When two records share a key, the first one wins and
    /// the later one is listed in [`duplicates`](Self::duplicates).
    pub fn build(records: &[Record], group_ids: GroupIdIndexing) -> Self {
        let mut index = Self::default();

        for (i, record) in records.iter().enumerate() {
            let mut duplicate = false;

            if let Some(guid) = record.guid() {
                duplicate |= *index.by_guid.entry(guid.to_string()).or_insert(i) != i;
            }

            let index_group = group_ids == GroupIdIndexing::All || record.guid().is_none();
            if let Some(group_id) = record.group_id().filter(|_| index_group) {
                let first = *index.by_group_id.entry(group_id.to_string()).or_insert(i);
                // A record reachable by GUID is only a duplicate by its GUID.
                duplicate |= first != i && record.guid().is_none();
            }

            if let Some(id) = &record.id {
                index.by_local_id.entry(id.clone()).or_insert(i);
            }

            if duplicate {
                index.duplicates.push(i);
            }
        }

        index
    }

    /// Index of the retained remote snapshot.
    pub fn for_snapshot(records: &[Record]) -> Self {
        Self::build(records, GroupIdIndexing::WithoutGuidOnly)
    }

    /// Index of a remote change report.
    pub fn for_report(records: &[Record]) -> Self {
        Self::build(records, GroupIdIndexing::All)
    }

    pub fn by_guid(&self, guid: &str) -> Option<usize> {
        self.by_guid.get(guid).copied()
    }

    pub fn by_group_id(&self, group_id: &str) -> Option<usize> {
        self.by_group_id.get(group_id).copied()
    }

    pub fn by_local_id(&self, id: &str) -> Option<usize> {
        self.by_local_id.get(id).copied()
    }

    /// Find the entry a record corresponds to: by GUID, then by local id.
    pub fn find(&self, record: &Record) -> Option<usize> {
        record
            .guid()
            .and_then(|g| self.by_guid(g))
            .or_else(|| record.id.as_deref().and_then(|id| self.by_local_id(id)))
    }

    /// Records that shadowed an earlier record with the same key.
    pub fn duplicates(&self) -> &[usize] {
        &self.duplicates
    }

    pub fn is_duplicate(&self, index: usize) -> bool {
        self.duplicates.contains(&index)
    }
}
