//! Directory sync operation types
//!
//! Raw directory entries, search requests and pages, normalized records and
//! the change events delivered to sinks.

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single attribute value as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A UTF-8 string value.
    Text(String),
    /// Binary data (e.g. `objectGUID`, `objectSid`).
    Binary(Vec<u8>),
}

impl AttributeValue {
    /// Get as text if this is a string value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Binary(_) => None,
        }
    }

    /// Render the value as a string; binary values are base64 encoded.
    pub fn to_canonical_string(&self) -> String {
        match self {
            AttributeValue::Text(s) => s.clone(),
            AttributeValue::Binary(b) => base64::engine::general_purpose::STANDARD.encode(b),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(b: Vec<u8>) -> Self {
        AttributeValue::Binary(b)
    }
}

/// An entry exactly as read from the directory server.
///
/// Attribute names keep the server's casing; lookups through [`get`](Self::get)
/// are case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Distinguished name; unique within a sync domain.
    pub distinguished_name: String,
    /// Values of `objectClass`.
    pub object_classes: Vec<String>,
    /// Attribute name to ordered values.
    pub attributes: BTreeMap<String, Vec<AttributeValue>>,
    /// Server-side modification timestamp.
    pub when_changed: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    /// Create an entry with no attributes.
    pub fn new(distinguished_name: impl Into<String>) -> Self {
        Self {
            distinguished_name: distinguished_name.into(),
            object_classes: Vec::new(),
            attributes: BTreeMap::new(),
            when_changed: None,
        }
    }

    /// Add an object class.
    pub fn with_object_class(mut self, class: impl Into<String>) -> Self {
        self.object_classes.push(class.into());
        self
    }

    /// Add a single-valued attribute.
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(name.into(), vec![value.into()]);
        self
    }

    /// Add a multi-valued attribute.
    pub fn with_values<V: Into<AttributeValue>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Set the modification timestamp.
    pub fn with_when_changed(mut self, when_changed: DateTime<Utc>) -> Self {
        self.when_changed = Some(when_changed);
        self
    }

    /// Get all values of an attribute, matching the name case-insensitively.
    ///
    /// If the server returned the same attribute under several casings the
    /// values are concatenated in attribute-name order.
    pub fn get(&self, name: &str) -> Vec<&AttributeValue> {
        self.attributes
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter())
            .collect()
    }

    /// Get the first text value of an attribute.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).into_iter().find_map(|v| v.as_text())
    }

    /// Whether the entry carries the given object class (case-insensitive).
    pub fn has_object_class(&self, class: &str) -> bool {
        self.object_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class))
    }
}

/// Parse an LDAP GeneralizedTime value (`20240620153045.0Z`).
///
/// Fractional seconds are ignored; values without a `Z` suffix are treated
/// as UTC.
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.len() < 14 || !value.is_char_boundary(14) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&value[..14], "%Y%m%d%H%M%S").ok()?;
    Some(naive.and_utc())
}

/// Format a timestamp as LDAP GeneralizedTime, the way Active Directory does.
pub fn format_generalized_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%S.0Z").to_string()
}

/// Escape special characters in LDAP filter values (RFC 4515).
///
/// Characters that must be escaped: * ( ) \ NUL
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Opaque paging cursor returned by the server (RFC 2696 cookie).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(pub Vec<u8>);

impl ResumeToken {
    /// Whether the server signalled the end of the result set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Default attribute carrying the server-side modification time.
pub const DEFAULT_CHANGE_ATTRIBUTE: &str = "whenChanged";

fn default_change_attribute() -> String {
    DEFAULT_CHANGE_ATTRIBUTE.to_string()
}

/// A paged subtree search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Search base DN. Empty means the server's default naming context.
    pub base_dn: String,
    /// LDAP filter (RFC 4515 string form).
    pub filter: String,
    /// Requested page size; the server may return fewer entries.
    pub page_size: u32,
    /// Attributes to return (`*` for all user attributes).
    pub attributes: Vec<String>,
    /// Attribute decoded into [`DirectoryEntry::when_changed`] and bounded by
    /// incremental searches.
    #[serde(default = "default_change_attribute")]
    pub change_attribute: String,
}

impl SearchRequest {
    /// Create a request for all user attributes.
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>, page_size: u32) -> Self {
        Self {
            base_dn: base_dn.into(),
            filter: filter.into(),
            page_size,
            attributes: vec!["*".to_string()],
            change_attribute: default_change_attribute(),
        }
    }

    /// Track modifications through a different attribute.
    pub fn with_change_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.change_attribute = attribute.into();
        self
    }

    /// Restrict the returned attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Derive a request that only matches entries changed at or after `since`.
    ///
    /// The bound is inclusive because GeneralizedTime has one-second
    /// resolution; entries re-read at the boundary are filtered out later by
    /// fingerprint comparison.
    pub fn changed_since(&self, since: &DateTime<Utc>) -> Self {
        let base = if self.filter.trim_start().starts_with('(') {
            self.filter.clone()
        } else {
            format!("({})", self.filter)
        };
        let stamp = escape_filter_value(&format_generalized_time(since));
        Self {
            filter: format!("(&{}({}>={}))", base, self.change_attribute, stamp),
            ..self.clone()
        }
    }
}

/// An entry the server returned but the client could not decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedEntry {
    /// DN of the entry, if known.
    pub dn: String,
    /// Why decoding failed.
    pub message: String,
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Decoded entries in server order.
    pub entries: Vec<DirectoryEntry>,
    /// Entries skipped because they could not be decoded.
    pub malformed: Vec<MalformedEntry>,
    /// Token for the next page; `None` when this was the last page.
    pub next: Option<ResumeToken>,
}

impl Page {
    /// Create a page.
    pub fn new(entries: Vec<DirectoryEntry>, next: Option<ResumeToken>) -> Self {
        Self {
            entries,
            malformed: Vec::new(),
            next,
        }
    }

    /// Whether more pages follow.
    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }
}

/// Record classification derived from `objectClass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A user or person.
    User,
    /// A group.
    Group,
    /// Anything else (computers, contacts, containers).
    Other,
}

impl RecordKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::User => "user",
            RecordKind::Group => "group",
            RecordKind::Other => "other",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag.
    Flag(bool),
    /// Single value.
    Text(String),
    /// Sorted, de-duplicated values.
    List(Vec<String>),
}

impl FieldValue {
    /// Get as text if single-valued.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get as list if multi-valued.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// Get as flag.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

/// A directory entry mapped to the stable shape delivered downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Stable key within the sync domain.
    pub key: String,
    /// Record classification.
    pub kind: RecordKind,
    /// Canonical field name to value.
    pub fields: BTreeMap<String, FieldValue>,
    /// Content hash over `kind` and `fields`.
    pub fingerprint: String,
}

impl NormalizedRecord {
    /// Get a field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// A change to apply downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeEvent {
    /// Create or replace the record stored under `key`.
    Upsert {
        key: String,
        record: NormalizedRecord,
    },
    /// Remove the record stored under `key`.
    Delete { key: String },
}

impl ChangeEvent {
    /// Create an upsert event for a record.
    pub fn upsert(record: NormalizedRecord) -> Self {
        ChangeEvent::Upsert {
            key: record.key.clone(),
            record,
        }
    }

    /// Create a delete event.
    pub fn delete(key: impl Into<String>) -> Self {
        ChangeEvent::Delete { key: key.into() }
    }

    /// The key this event applies to.
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Upsert { key, .. } | ChangeEvent::Delete { key } => key,
        }
    }

    /// Whether this is a delete.
    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeEvent::Delete { .. })
    }
}
