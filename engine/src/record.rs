//! Records and the GUID format.

use crate::detail::{Detail, DetailKind, FieldId, FieldValue};
use crate::{delta, LocalId, Timestamp};
use serde::{Deserialize, Serialize};

/// Build a GUID: `"<accountId>:<remoteId>"`.
pub fn format_guid(account: &str, remote_id: &str) -> String {
    format!("{}:{}", account, remote_id)
}

/// Split a GUID into `(accountId, remoteId)`.
pub fn parse_guid(guid: &str) -> Option<(&str, &str)> {
    guid.split_once(':')
}

/// Whether a GUID was stamped by the given account.
pub fn guid_belongs_to(guid: &str, account: &str) -> bool {
    guid.strip_prefix(account)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// A record: a set of details plus the local identifier once persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Local store identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LocalId>,
    /// Details, in store order
    #[serde(default)]
    pub details: Vec<Detail>,
}

impl Record {
    /// Create an empty, unpersisted record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a detail.
    pub fn with_detail(mut self, detail: Detail) -> Self {
        self.details.push(detail);
        self
    }

    /// Builder: set the local identifier.
    pub fn with_id(mut self, id: impl Into<LocalId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builder: set the GUID detail.
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.set_guid(guid);
        self
    }

    pub fn details_of(&self, kind: DetailKind) -> impl Iterator<Item = &Detail> {
        self.details.iter().filter(move |d| d.kind == kind)
    }

    pub fn detail(&self, kind: DetailKind) -> Option<&Detail> {
        self.details_of(kind).next()
    }

    fn text_of(&self, kind: DetailKind, field: FieldId) -> Option<&str> {
        self.detail(kind)
            .and_then(|d| d.get(field))
            .and_then(FieldValue::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The GUID, if this record has a remote-origin constituent.
    pub fn guid(&self) -> Option<&str> {
        self.text_of(DetailKind::Guid, FieldId::Guid)
    }

    /// The group-id cross-reference.
    pub fn group_id(&self) -> Option<&str> {
        self.text_of(DetailKind::GroupId, FieldId::GroupId)
    }

    /// The sync target this record is tagged with.
    pub fn sync_target(&self) -> Option<&str> {
        self.text_of(DetailKind::SyncTarget, FieldId::SyncTarget)
    }

    /// Last modification time from the timestamp detail.
    pub fn last_modified(&self) -> Option<Timestamp> {
        self.detail(DetailKind::Timestamp)
            .and_then(|d| d.get(FieldId::Modified))
            .and_then(FieldValue::as_datetime)
    }

    /// Replace (or add) the single detail of `kind`, keeping its identity.
    fn set_single(&mut self, kind: DetailKind, field: FieldId, value: FieldValue) {
        match self.details.iter_mut().find(|d| d.kind == kind) {
            Some(detail) => {
                detail.fields.clear();
                detail.set(field, value);
            }
            None => self.details.push(Detail::new(kind).with(field, value)),
        }
        let mut seen = false;
        self.details.retain(|d| {
            if d.kind != kind {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });
    }

    pub fn set_guid(&mut self, guid: impl Into<String>) {
        self.set_single(DetailKind::Guid, FieldId::Guid, FieldValue::text(guid));
    }

    /// Remove every GUID detail.
    pub fn strip_guid(&mut self) {
        self.details.retain(|d| d.kind != DetailKind::Guid);
    }

    pub fn set_group_id(&mut self, group_id: impl Into<String>) {
        self.set_single(DetailKind::GroupId, FieldId::GroupId, FieldValue::text(group_id));
    }

    pub fn set_sync_target(&mut self, target: impl Into<String>) {
        self.set_single(DetailKind::SyncTarget, FieldId::SyncTarget, FieldValue::text(target));
    }

    /// Stamp the timestamp detail, keeping an existing creation time.
    pub fn touch(&mut self, now: Timestamp) {
        match self
            .details
            .iter_mut()
            .find(|d| d.kind == DetailKind::Timestamp)
        {
            Some(detail) => {
                if detail.get(FieldId::Created).is_none() {
                    detail.set(FieldId::Created, FieldValue::DateTime(now));
                }
                detail.set(FieldId::Modified, FieldValue::DateTime(now));
            }
            None => self.details.push(Detail::timestamp(now, now)),
        }
    }

    /// Content equality ignoring ignorable detail kinds, detail identity,
    /// and detail order.
    pub fn same_content(&self, other: &Record) -> bool {
        delta::fallback_delta(&self.details, &other.details).is_empty()
    }

    /// Whether this record matches another by GUID or, failing that, by local id.
    pub fn same_identity(&self, other: &Record) -> bool {
        match (self.guid(), other.guid()) {
            (Some(a), Some(b)) => a == b,
            _ => self.id.is_some() && self.id == other.id,
        }
    }
}
