//! Entry normalization.
//!
//! Maps raw directory entries to canonical records and computes the content
//! fingerprint used for change detection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::{DirectoryEntry, FieldValue, NormalizedRecord, RecordKind};

/// ACCOUNTDISABLE bit of `userAccountControl`.
const UAC_ACCOUNT_DISABLE: u32 = 0x0002;

/// Attributes that change without a semantic change to the object
/// (replication bookkeeping, logon tracking). They are never fingerprinted.
pub const VOLATILE_ATTRIBUTES: &[&str] = &[
    "whenchanged",
    "whencreated",
    "usnchanged",
    "usncreated",
    "lastlogon",
    "lastlogontimestamp",
    "lastlogoff",
    "logoncount",
    "badpwdcount",
    "badpasswordtime",
    "pwdlastset",
    "lockouttime",
    "dscorepropagationdata",
    "modifytimestamp",
    "createtimestamp",
];

/// Object classes checked in order; the first match decides the kind.
const KIND_PRECEDENCE: &[(&str, RecordKind)] = &[
    ("group", RecordKind::Group),
    ("groupofnames", RecordKind::Group),
    ("groupofuniquenames", RecordKind::Group),
    ("posixgroup", RecordKind::Group),
    // Computer accounts also carry `user`; they are not people.
    ("computer", RecordKind::Other),
    ("user", RecordKind::User),
    ("person", RecordKind::User),
    ("organizationalperson", RecordKind::User),
    ("inetorgperson", RecordKind::User),
];

/// How many values a canonical field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// One value; the lexicographically smallest is picked when several exist.
    Single,
    /// Sorted, deduplicated list.
    Multi,
}

/// Mapping of one canonical field to its source attribute(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Canonical field name.
    pub field: String,
    /// Source attributes; the first one present on the entry is used.
    pub attributes: Vec<String>,
    /// Single- or multi-valued.
    #[serde(default = "default_cardinality")]
    pub cardinality: Cardinality,
    /// Whether values compare case-insensitively (mail, DNs).
    #[serde(default)]
    pub case_insensitive: bool,
}

fn default_cardinality() -> Cardinality {
    Cardinality::Single
}

impl FieldMapping {
    /// Single-valued field read from the first present attribute.
    pub fn single(field: impl Into<String>, attributes: &[&str]) -> Self {
        Self {
            field: field.into(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            cardinality: Cardinality::Single,
            case_insensitive: false,
        }
    }

    /// Multi-valued field.
    pub fn multi(field: impl Into<String>, attribute: &str) -> Self {
        Self {
            field: field.into(),
            attributes: vec![attribute.to_string()],
            cardinality: Cardinality::Multi,
            case_insensitive: false,
        }
    }

    /// Compare and store values lower-cased.
    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }
}

/// Normalizer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Attribute providing the record key (e.g. `objectGUID`). The lower-cased
    /// DN is used when unset.
    #[serde(default)]
    pub key_attribute: Option<String>,

    /// Field mappings.
    #[serde(default = "default_mappings")]
    pub mappings: Vec<FieldMapping>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            key_attribute: None,
            mappings: default_mappings(),
        }
    }
}

/// Standard Active Directory user and group mappings.
pub fn default_mappings() -> Vec<FieldMapping> {
    vec![
        // Identity
        FieldMapping::single("username", &["sAMAccountName"]),
        FieldMapping::single("upn", &["userPrincipalName"]).case_insensitive(),
        FieldMapping::single("email", &["mail"]).case_insensitive(),
        // Names
        FieldMapping::single("display_name", &["displayName", "cn"]),
        FieldMapping::single("first_name", &["givenName"]),
        FieldMapping::single("last_name", &["sn"]),
        // Organization
        FieldMapping::single("department", &["department"]),
        FieldMapping::single("job_title", &["title"]),
        FieldMapping::single("company", &["company"]),
        FieldMapping::single("employee_id", &["employeeID"]),
        FieldMapping::single("employee_number", &["employeeNumber"]),
        FieldMapping::single("phone", &["telephoneNumber"]),
        FieldMapping::single("manager_dn", &["manager"]).case_insensitive(),
        // Membership
        FieldMapping::multi("member_of", "memberOf").case_insensitive(),
        FieldMapping::multi("members", "member").case_insensitive(),
        // Groups
        FieldMapping::single("description", &["description"]),
        FieldMapping::single("group_type", &["groupType"]),
    ]
}

impl NormalizerConfig {
    /// Key records by the given attribute instead of the DN.
    pub fn with_key_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.key_attribute = Some(attribute.into());
        self
    }

    /// Add or replace a field mapping.
    #[must_use]
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mappings.retain(|m| m.field != mapping.field);
        self.mappings.push(mapping);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(key) = &self.key_attribute {
            if key.trim().is_empty() {
                return Err(SyncError::configuration("key attribute must not be empty"));
            }
        }

        for mapping in &self.mappings {
            if mapping.field.trim().is_empty() || mapping.attributes.is_empty() {
                return Err(SyncError::configuration(format!(
                    "field mapping '{}' needs a name and at least one attribute",
                    mapping.field
                )));
            }
            if let Some(attr) = mapping.attributes.iter().find(|a| is_volatile(a)) {
                return Err(SyncError::configuration(format!(
                    "field '{}' maps volatile attribute '{}'",
                    mapping.field, attr
                )));
            }
        }

        Ok(())
    }
}

/// Whether an attribute is excluded from fingerprinting.
pub fn is_volatile(attribute: &str) -> bool {
    let lower = attribute.to_ascii_lowercase();
    VOLATILE_ATTRIBUTES.contains(&lower.as_str())
}

/// Classify an entry by its object classes.
pub fn classify<S: AsRef<str>>(object_classes: &[S]) -> RecordKind {
    KIND_PRECEDENCE
        .iter()
        .find(|(class, _)| {
            object_classes
                .iter()
                .any(|c| c.as_ref().eq_ignore_ascii_case(class))
        })
        .map(|(_, kind)| *kind)
        .unwrap_or(RecordKind::Other)
}

/// Compute the fingerprint of a record's content.
///
/// SHA-256 over the canonical JSON of kind and fields. Fields live in a
/// `BTreeMap`, so the encoding does not depend on insertion order.
pub fn fingerprint(kind: RecordKind, fields: &BTreeMap<String, FieldValue>) -> SyncResult<String> {
    #[derive(Serialize)]
    struct Canonical<'a> {
        kind: RecordKind,
        fields: &'a BTreeMap<String, FieldValue>,
    }

    let bytes = serde_json::to_vec(&Canonical { kind, fields })
        .map_err(|e| SyncError::protocol(format!("cannot encode record for hashing: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Pure `DirectoryEntry -> NormalizedRecord` mapper.
#[derive(Debug, Clone, Default)]
pub struct EntryNormalizer {
    config: NormalizerConfig,
}

impl EntryNormalizer {
    /// Create a normalizer.
    #[must_use]
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Derive the record key of an entry.
    pub fn derive_key(&self, entry: &DirectoryEntry) -> SyncResult<String> {
        let dn = entry.distinguished_name.trim();
        if dn.is_empty() {
            return Err(SyncError::normalization("", "entry has no distinguished name"));
        }

        match &self.config.key_attribute {
            None => Ok(dn.to_lowercase()),
            Some(attribute) => entry
                .get(attribute)
                .into_iter()
                .map(|v| v.to_canonical_string())
                .find(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    SyncError::normalization(dn, format!("missing key attribute '{}'", attribute))
                }),
        }
    }

    /// Normalize an entry.
    ///
    /// # Errors
    /// `Normalization` for an empty DN, a missing key attribute or an entry
    /// without object classes. The error carries the key when it could be
    /// derived.
    pub fn normalize(&self, entry: &DirectoryEntry) -> SyncResult<NormalizedRecord> {
        let key = self.derive_key(entry)?;

        if entry.object_classes.is_empty() {
            return Err(SyncError::Normalization {
                dn: entry.distinguished_name.clone(),
                key: Some(key),
                message: "entry has no objectClass".to_string(),
            });
        }

        let kind = classify(entry.object_classes.as_slice());
        let mut fields = BTreeMap::new();

        fields.insert(
            "dn".to_string(),
            FieldValue::Text(entry.distinguished_name.trim().to_lowercase()),
        );

        for mapping in &self.config.mappings {
            if let Some(value) = map_field(entry, mapping) {
                fields.insert(mapping.field.clone(), value);
            }
        }

        if kind == RecordKind::User {
            fields.insert("is_active".to_string(), FieldValue::Flag(is_active(entry)));
        }

        let fingerprint = fingerprint(kind, &fields)?;

        Ok(NormalizedRecord {
            key,
            kind,
            fields,
            fingerprint,
        })
    }
}

fn map_field(entry: &DirectoryEntry, mapping: &FieldMapping) -> Option<FieldValue> {
    let mut values: Vec<String> = mapping
        .attributes
        .iter()
        .map(|attr| {
            entry
                .get(attr)
                .into_iter()
                .map(|v| v.to_canonical_string())
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
        })
        .find(|values| !values.is_empty())?;

    if mapping.case_insensitive {
        for value in &mut values {
            *value = value.to_lowercase();
        }
    }
    values.sort();

    match mapping.cardinality {
        Cardinality::Single => values.into_iter().next().map(FieldValue::Text),
        Cardinality::Multi => {
            values.dedup();
            Some(FieldValue::List(values))
        }
    }
}

/// Account state from `userAccountControl`; missing or unparsable means active.
fn is_active(entry: &DirectoryEntry) -> bool {
    entry
        .get_text("userAccountControl")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|uac| (uac as u32) & UAC_ACCOUNT_DISABLE == 0)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_connector::operation::AttributeValue;

    fn jane() -> DirectoryEntry {
        DirectoryEntry::new("CN=Jane Doe,OU=Staff,DC=example,DC=com")
            .with_object_class("top")
            .with_object_class("person")
            .with_object_class("user")
            .with_attribute("sAMAccountName", "jdoe")
            .with_attribute("mail", "Jane.Doe@Example.com")
            .with_attribute("givenName", "Jane")
            .with_attribute("sn", "Doe")
            .with_values(
                "memberOf",
                [
                    "CN=Staff,OU=Groups,DC=example,DC=com",
                    "CN=Admins,OU=Groups,DC=example,DC=com",
                ],
            )
            .with_attribute("userAccountControl", "512")
    }

    #[test]
    fn test_normalize_user() {
        let record = EntryNormalizer::default().normalize(&jane()).unwrap();

        assert_eq!(record.key, "cn=jane doe,ou=staff,dc=example,dc=com");
        assert_eq!(record.kind, RecordKind::User);
        assert_eq!(
            record.field("email").and_then(|v| v.as_text()),
            Some("jane.doe@example.com")
        );
        assert_eq!(
            record.field("member_of").and_then(|v| v.as_list()),
            Some(
                &[
                    "cn=admins,ou=groups,dc=example,dc=com".to_string(),
                    "cn=staff,ou=groups,dc=example,dc=com".to_string(),
                ][..]
            )
        );
        assert_eq!(
            record.field("is_active").and_then(|v| v.as_flag()),
            Some(true)
        );
        assert_eq!(record.fingerprint.len(), 64);
    }

    #[test]
    fn test_fingerprint_stable_under_reordering_and_case() {
        let normalizer = EntryNormalizer::default();
        let a = normalizer.normalize(&jane()).unwrap();

        let b = DirectoryEntry::new("cn=jane doe,ou=staff,dc=example,dc=com")
            .with_object_class("USER")
            .with_object_class("Person")
            .with_object_class("top")
            .with_attribute("USERACCOUNTCONTROL", "512")
            .with_values(
                "MEMBEROF",
                [
                    "cn=admins,ou=groups,dc=example,dc=com",
                    "CN=Staff,OU=Groups,DC=example,DC=com",
                    "CN=Admins,OU=Groups,DC=example,DC=com",
                ],
            )
            .with_attribute("sn", "Doe")
            .with_attribute("GivenName", "Jane")
            .with_attribute("MAIL", "jane.doe@example.com")
            .with_attribute("samaccountname", "jdoe");
        let b = normalizer.normalize(&b).unwrap();

        assert_eq!(a.key, b.key);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_fingerprint_ignores_volatile_attributes() {
        let normalizer = EntryNormalizer::default();
        let a = normalizer.normalize(&jane()).unwrap();
        let b = normalizer
            .normalize(
                &jane()
                    .with_attribute("whenChanged", "20240101000000.0Z")
                    .with_attribute("uSNChanged", "99887")
                    .with_attribute("lastLogon", "133000000000000000"),
            )
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let normalizer = EntryNormalizer::default();
        let a = normalizer.normalize(&jane()).unwrap();
        let b = normalizer
            .normalize(&jane().with_attribute("department", "Radiology"))
            .unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_case_sensitive_field_keeps_case() {
        let normalizer = EntryNormalizer::default();
        let a = normalizer.normalize(&jane()).unwrap();
        let b = normalizer
            .normalize(&jane().with_attribute("givenName", "JANE"))
            .unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_single_valued_picks_smallest() {
        let entry = jane().with_values("telephoneNumber", ["+49 555 2", "+49 555 1"]);
        let record = EntryNormalizer::default().normalize(&entry).unwrap();
        assert_eq!(
            record.field("phone").and_then(|v| v.as_text()),
            Some("+49 555 1")
        );
    }

    #[test]
    fn test_display_name_falls_back_to_cn() {
        let entry = jane().with_attribute("cn", "Jane Doe");
        let record = EntryNormalizer::default().normalize(&entry).unwrap();
        assert_eq!(
            record.field("display_name").and_then(|v| v.as_text()),
            Some("Jane Doe")
        );

        let entry = entry.with_attribute("displayName", "Doe, Jane");
        let record = EntryNormalizer::default().normalize(&entry).unwrap();
        assert_eq!(
            record.field("display_name").and_then(|v| v.as_text()),
            Some("Doe, Jane")
        );
    }

    #[test]
    fn test_disabled_account() {
        let entry = jane().with_attribute("userAccountControl", "514");
        let record = EntryNormalizer::default().normalize(&entry).unwrap();
        assert_eq!(
            record.field("is_active").and_then(|v| v.as_flag()),
            Some(false)
        );

        let entry = jane().with_attribute("userAccountControl", "garbage");
        let record = EntryNormalizer::default().normalize(&entry).unwrap();
        assert_eq!(
            record.field("is_active").and_then(|v| v.as_flag()),
            Some(true)
        );
    }

    #[test]
    fn test_kind_precedence() {
        assert_eq!(classify(&["top", "group"]), RecordKind::Group);
        assert_eq!(classify(&["groupOfNames"]), RecordKind::Group);
        assert_eq!(classify(&["posixGroup", "person"]), RecordKind::Group);
        assert_eq!(
            classify(&["top", "person", "organizationalPerson", "user", "computer"]),
            RecordKind::Other
        );
        assert_eq!(classify(&["inetOrgPerson"]), RecordKind::User);
        assert_eq!(classify(&["organizationalUnit"]), RecordKind::Other);
        assert_eq!(classify::<&str>(&[]), RecordKind::Other);
    }

    #[test]
    fn test_groups_have_no_active_flag() {
        let entry = DirectoryEntry::new("CN=Staff,OU=Groups,DC=example,DC=com")
            .with_object_class("group")
            .with_values("member", ["CN=B,DC=example,DC=com", "CN=A,DC=example,DC=com"])
            .with_attribute("groupType", "-2147483646");
        let record = EntryNormalizer::default().normalize(&entry).unwrap();
        assert_eq!(record.kind, RecordKind::Group);
        assert!(record.field("is_active").is_none());
        assert_eq!(
            record.field("members").and_then(|v| v.as_list()).map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn test_key_attribute_binary_is_base64() {
        let normalizer =
            EntryNormalizer::new(NormalizerConfig::default().with_key_attribute("objectGUID"));
        let entry = jane().with_attribute("objectGUID", AttributeValue::Binary(vec![0xde, 0xad]));
        let record = normalizer.normalize(&entry).unwrap();
        assert_eq!(record.key, "3q0=");
    }

    #[test]
    fn test_missing_key_attribute_fails_without_key() {
        let normalizer =
            EntryNormalizer::new(NormalizerConfig::default().with_key_attribute("objectGUID"));
        match normalizer.normalize(&jane()) {
            Err(SyncError::Normalization { dn, key, .. }) => {
                assert_eq!(dn, "CN=Jane Doe,OU=Staff,DC=example,DC=com");
                assert!(key.is_none());
            }
            other => panic!("expected normalization error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_object_class_carries_key() {
        let entry = DirectoryEntry::new("CN=Orphan,DC=example,DC=com").with_attribute("cn", "x");
        match EntryNormalizer::default().normalize(&entry) {
            Err(SyncError::Normalization { key, .. }) => {
                assert_eq!(key.as_deref(), Some("cn=orphan,dc=example,dc=com"));
            }
            other => panic!("expected normalization error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_dn_fails() {
        let entry = DirectoryEntry::new("  ").with_object_class("user");
        assert!(matches!(
            EntryNormalizer::default().normalize(&entry),
            Err(SyncError::Normalization { key: None, .. })
        ));
    }

    #[test]
    fn test_config_rejects_volatile_mapping() {
        let config = NormalizerConfig::default()
            .with_mapping(FieldMapping::single("changed", &["whenChanged"]));
        assert!(config.validate().is_err());
        assert!(NormalizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_with_mapping_replaces_existing() {
        let config = NormalizerConfig::default()
            .with_mapping(FieldMapping::single("email", &["proxyAddresses"]));
        let email: Vec<_> = config
            .mappings
            .iter()
            .filter(|m| m.field == "email")
            .collect();
        assert_eq!(email.len(), 1);
        assert_eq!(email[0].attributes, vec!["proxyAddresses".to_string()]);
    }
}
