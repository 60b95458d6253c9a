//! Details: the typed field bags a record is made of.
//!
//! A detail has a kind, a map of field values, and an optional identity
//! assigned by the local record store. The identity is what lets a merged
//! record keep "the same phone number, edited" instead of "a phone number
//! removed and another added".

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store-assigned identity of a detail.
pub type DetailId = String;

/// Closed set of detail kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetailKind {
    Name,
    DisplayLabel,
    Nickname,
    PhoneNumber,
    EmailAddress,
    Address,
    Url,
    Note,
    Birthday,
    Anniversary,
    Organization,
    Avatar,
    Gender,
    Hobby,
    Tag,
    Family,
    GeoLocation,
    Ringtone,
    OnlineAccount,
    Presence,
    GlobalPresence,
    /// Remote-origin identifier, `"<accountId>:<remoteId>"`
    Guid,
    /// Cross-reference used before a record has a GUID
    GroupId,
    SyncTarget,
    Timestamp,
    StatusFlags,
    Deactivated,
    Incidental,
}

/// Kinds that are derived locally or expected to differ between a live
/// remote fetch and a stored copy. They never take part in equality or
/// delta computation.
pub const IGNORABLE_KINDS: &[DetailKind] = &[
    DetailKind::DisplayLabel,
    DetailKind::GlobalPresence,
    DetailKind::Presence,
    DetailKind::OnlineAccount,
    DetailKind::SyncTarget,
    DetailKind::Timestamp,
    DetailKind::StatusFlags,
    DetailKind::Deactivated,
    DetailKind::Incidental,
];

impl DetailKind {
    /// Whether details of this kind are excluded from comparison.
    pub fn is_ignorable(self) -> bool {
        IGNORABLE_KINDS.contains(&self)
    }
}

/// Field identifiers, grouped by the detail kinds that use them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldId {
    // Shared
    Context,
    SubTypes,
    Label,
    // Name
    Prefix,
    FirstName,
    MiddleName,
    LastName,
    Suffix,
    CustomLabel,
    // Nickname / Hobby / Tag / Gender / Note
    Nickname,
    Hobby,
    Tag,
    Gender,
    Note,
    // PhoneNumber / EmailAddress / Url
    Number,
    EmailAddress,
    Url,
    // Address
    Street,
    Locality,
    Region,
    PostCode,
    Country,
    PostOfficeBox,
    // Birthday / Anniversary
    Date,
    Calendar,
    // Organization
    OrganizationName,
    Department,
    Title,
    Role,
    // Avatar / Ringtone
    ImageUrl,
    AudioRingtoneUrl,
    // Family
    Spouse,
    Children,
    // GeoLocation
    Latitude,
    Longitude,
    Accuracy,
    // OnlineAccount / Presence
    AccountUri,
    ServiceProvider,
    Capabilities,
    PresenceState,
    CustomMessage,
    // Bookkeeping kinds
    Guid,
    GroupId,
    SyncTarget,
    Created,
    Modified,
    Flags,
}

/// A primitive inside a list value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Primitive {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(Timestamp),
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Text(String),
    Url(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(Timestamp),
    IntList(Vec<i64>),
    List(Vec<Primitive>),
}

/// Coarse shape of a [`FieldValue`], used by the scoring equivalence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Text,
    Url,
    Int,
    Float,
    Bool,
    DateTime,
    IntList,
    List,
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn url(value: impl Into<String>) -> Self {
        FieldValue::Url(value.into())
    }

    pub fn shape(&self) -> ValueShape {
        match self {
            FieldValue::Text(_) => ValueShape::Text,
            FieldValue::Url(_) => ValueShape::Url,
            FieldValue::Int(_) => ValueShape::Int,
            FieldValue::Float(_) => ValueShape::Float,
            FieldValue::Bool(_) => ValueShape::Bool,
            FieldValue::DateTime(_) => ValueShape::DateTime,
            FieldValue::IntList(_) => ValueShape::IntList,
            FieldValue::List(_) => ValueShape::List,
        }
    }

    /// Empty strings and empty lists compare equal to an absent value.
    pub fn is_emptyish(&self) -> bool {
        match self {
            FieldValue::Text(s) | FieldValue::Url(s) => s.is_empty(),
            FieldValue::IntList(v) => v.is_empty(),
            FieldValue::List(v) => v.is_empty(),
            _ => false,
        }
    }

    /// The string content of a text or URL value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Url(s) => Some(s),
            _ => None,
        }
    }

    /// The integers of a list value, if every element is an integer.
    pub fn as_ints(&self) -> Option<Vec<i64>> {
        match self {
            FieldValue::IntList(v) => Some(v.clone()),
            FieldValue::List(items) => items
                .iter()
                .map(|p| match p {
                    Primitive::Int(i) => Some(*i),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<Timestamp> {
        match self {
            FieldValue::DateTime(t) => Some(*t),
            _ => None,
        }
    }
}

/// A typed bag of field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    /// Identity assigned by the local record store (absent until persisted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DetailId>,
    /// Detail kind
    pub kind: DetailKind,
    /// Which constituent the detail came from, engine-internal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    /// Field values
    #[serde(default)]
    pub fields: BTreeMap<FieldId, FieldValue>,
}

impl Detail {
    /// Create an empty detail of the given kind.
    pub fn new(kind: DetailKind) -> Self {
        Self {
            id: None,
            kind,
            provenance: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder: set a field.
    pub fn with(mut self, field: FieldId, value: FieldValue) -> Self {
        self.fields.insert(field, value);
        self
    }

    /// Builder: set the store identity.
    pub fn with_id(mut self, id: impl Into<DetailId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn get(&self, field: FieldId) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn set(&mut self, field: FieldId, value: FieldValue) {
        self.fields.insert(field, value);
    }

    pub fn remove(&mut self, field: FieldId) -> Option<FieldValue> {
        self.fields.remove(&field)
    }

    pub fn is_ignorable(&self) -> bool {
        self.kind.is_ignorable()
    }

    /// Value equality: same kind and same fields. Identity and provenance
    /// are not compared.
    pub fn same_values(&self, other: &Detail) -> bool {
        self.kind == other.kind && self.fields == other.fields
    }

    pub fn name(first: impl Into<String>, last: impl Into<String>) -> Self {
        Detail::new(DetailKind::Name)
            .with(FieldId::FirstName, FieldValue::text(first))
            .with(FieldId::LastName, FieldValue::text(last))
    }

    pub fn phone(number: impl Into<String>) -> Self {
        Detail::new(DetailKind::PhoneNumber).with(FieldId::Number, FieldValue::text(number))
    }

    pub fn email(address: impl Into<String>) -> Self {
        Detail::new(DetailKind::EmailAddress)
            .with(FieldId::EmailAddress, FieldValue::text(address))
    }

    pub fn url(url: impl Into<String>) -> Self {
        Detail::new(DetailKind::Url).with(FieldId::Url, FieldValue::url(url))
    }

    pub fn note(text: impl Into<String>) -> Self {
        Detail::new(DetailKind::Note).with(FieldId::Note, FieldValue::text(text))
    }

    pub fn guid(guid: impl Into<String>) -> Self {
        Detail::new(DetailKind::Guid).with(FieldId::Guid, FieldValue::text(guid))
    }

    pub fn group_id(group_id: impl Into<String>) -> Self {
        Detail::new(DetailKind::GroupId).with(FieldId::GroupId, FieldValue::text(group_id))
    }

    pub fn sync_target(target: impl Into<String>) -> Self {
        Detail::new(DetailKind::SyncTarget).with(FieldId::SyncTarget, FieldValue::text(target))
    }

    pub fn timestamp(created: Timestamp, modified: Timestamp) -> Self {
        Detail::new(DetailKind::Timestamp)
            .with(FieldId::Created, FieldValue::DateTime(created))
            .with(FieldId::Modified, FieldValue::DateTime(modified))
    }
}
