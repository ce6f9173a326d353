//! Domain model for the CA tree.
//!
//! A tree node is either a [`CertificateAuthority`] or a leaf [`Certificate`].
//! Both share the subject/validity/serial surface exposed by [`CertificateBase`];
//! code that works on "any node" takes an [`Entity`] and dispatches on the tag.
//!
//! ```text
//! Root CA (parent = None, self-signed)
//!   ├── Intermediate CA (subcas_allowed = true)
//!   │     ├── Edge CA (v3_edge_ca, subcas_allowed = false)
//!   │     │     └── Certificate
//!   │     └── Certificate
//!   └── Certificate
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::configs::SELF_SIGNED_STORE;
use crate::error::{PkiError, PkiResult};

pub use crate::altname::{AltName, SubjectAltNames};
pub use crate::extensions::{ExtensionClass, X509Extension};

pub type EntityId = i64;

pub const KEY_LENGTHS: [u32; 3] = [1024, 2048, 4096];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Authority,
    Certificate,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Authority => "ca",
            EntityKind::Certificate => "cert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ca" => Some(EntityKind::Authority),
            "cert" => Some(EntityKind::Certificate),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signer policy of a CA: whether issued subjects must match the issuer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Policy {
    Match,
    Anything,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Match => "policy_match",
            Policy::Anything => "policy_anything",
        }
    }

    pub fn parse(value: &str) -> PkiResult<Self> {
        match value {
            "policy_match" | "match" => Ok(Policy::Match),
            "policy_anything" | "anything" => Ok(Policy::Anything),
            other => Err(PkiError::validation(
                "policy",
                format!("unknown policy '{}'", other),
            )),
        }
    }
}

/// Distinguished name fields shared by CAs and certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub common_name: String,
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: Option<String>,
    pub email: Option<String>,
}

impl Subject {
    /// Subject in the signer's `-subj` slash grammar.
    pub fn to_openssl(&self) -> String {
        let mut subject = format!(
            "/CN={}/C={}/ST={}/localityName={}/O={}",
            escape_rdn(&self.common_name),
            escape_rdn(&self.country),
            escape_rdn(&self.state),
            escape_rdn(&self.locality),
            escape_rdn(&self.organization),
        );
        if let Some(ou) = self.organizational_unit.as_deref().filter(|v| !v.is_empty()) {
            subject.push_str(&format!("/organizationalUnitName={}", escape_rdn(ou)));
        }
        if let Some(email) = self.email.as_deref().filter(|v| !v.is_empty()) {
            subject.push_str(&format!("/emailAddress={}", escape_rdn(email)));
        }
        subject
    }

    pub fn validate(&self) -> PkiResult<()> {
        require_text("common_name", &self.common_name, 64)?;
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PkiError::validation(
                "country",
                "must be a two letter country code",
            ));
        }
        require_text("state", &self.state, 32)?;
        require_text("locality", &self.locality, 32)?;
        require_text("organization", &self.organization, 64)?;
        if let Some(ou) = &self.organizational_unit {
            if ou.chars().count() > 64 {
                return Err(PkiError::validation(
                    "organizational_unit",
                    "must be at most 64 characters",
                ));
            }
        }
        if let Some(email) = self.email.as_deref().filter(|v| !v.is_empty()) {
            if !crate::altname::is_email(email) {
                return Err(PkiError::validation("email", "not a valid email address"));
            }
        }
        Ok(())
    }

    /// Upper-case the country code; the store keeps it normalized.
    pub fn normalized(mut self) -> Self {
        self.country = self.country.to_ascii_uppercase();
        self
    }
}

fn escape_rdn(value: &str) -> String {
    value.replace('\\', "\\\\").replace('/', "\\/")
}

fn require_text(field: &str, value: &str, max: usize) -> PkiResult<()> {
    if value.trim().is_empty() {
        return Err(PkiError::validation(field, "may not be empty"));
    }
    if value.chars().count() > max {
        return Err(PkiError::validation(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    Ok(())
}

/// Names double as directory and file names in the PKI store.
pub fn validate_name(field: &str, name: &str) -> PkiResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(PkiError::validation(field, "must be 1 to 64 characters"));
    }
    if name == "." || name == ".." || name == SELF_SIGNED_STORE {
        return Err(PkiError::validation(field, format!("'{}' is reserved", name)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(PkiError::validation(
            field,
            "may only contain characters in range a-Z0-9_-.",
        ));
    }
    Ok(())
}

pub fn validate_key_length(key_length: u32) -> PkiResult<()> {
    if KEY_LENGTHS.contains(&key_length) {
        Ok(())
    } else {
        Err(PkiError::validation(
            "key_length",
            format!("must be one of {:?}", KEY_LENGTHS),
        ))
    }
}

pub fn validate_valid_days(valid_days: u32) -> PkiResult<()> {
    if valid_days == 0 {
        return Err(PkiError::validation("valid_days", "must be at least 1"));
    }
    Ok(())
}

/// Shared surface of every node in the CA tree.
pub trait CertificateBase {
    fn kind(&self) -> EntityKind;
    fn id(&self) -> EntityId;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn subject(&self) -> &Subject;
    fn parent(&self) -> Option<EntityId>;
    fn is_active(&self) -> bool;
    fn serial(&self) -> Option<&str>;
    fn key_length(&self) -> u32;
    fn valid_days(&self) -> u32;
    fn revoked(&self) -> Option<DateTime<Utc>>;
    fn der_encoded(&self) -> bool;
    fn pkcs12_encoded(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateAuthority {
    pub id: EntityId,
    pub name: String,
    pub description: String,
    pub subject: Subject,
    pub parent: Option<EntityId>,
    pub active: bool,
    pub serial: Option<String>,
    /// Argon2id PHC string of the private-key passphrase.
    #[serde(skip_serializing)]
    pub passphrase: String,
    pub key_length: u32,
    pub valid_days: u32,
    pub created: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub revoked: Option<DateTime<Utc>>,
    pub subcas_allowed: bool,
    pub policy: Policy,
    pub crl_distribution: Option<String>,
    /// Name of the x509 extension profile used to sign this CA.
    pub extension: String,
    pub ca_chain: String,
    pub der_encoded: bool,
}

impl CertificateAuthority {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl CertificateBase for CertificateAuthority {
    fn kind(&self) -> EntityKind {
        EntityKind::Authority
    }
    fn id(&self) -> EntityId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn subject(&self) -> &Subject {
        &self.subject
    }
    fn parent(&self) -> Option<EntityId> {
        self.parent
    }
    fn is_active(&self) -> bool {
        self.active
    }
    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
    fn key_length(&self) -> u32 {
        self.key_length
    }
    fn valid_days(&self) -> u32 {
        self.valid_days
    }
    fn revoked(&self) -> Option<DateTime<Utc>> {
        self.revoked
    }
    fn der_encoded(&self) -> bool {
        self.der_encoded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    pub id: EntityId,
    pub name: String,
    pub description: String,
    pub subject: Subject,
    pub parent: Option<EntityId>,
    pub active: bool,
    pub serial: Option<String>,
    /// Leaf keys may be unencrypted.
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    pub key_length: u32,
    pub valid_days: u32,
    pub created: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub revoked: Option<DateTime<Utc>>,
    pub extension: String,
    pub subject_alt_names: SubjectAltNames,
    pub der_encoded: bool,
    pub pkcs12_encoded: bool,
    #[serde(skip_serializing)]
    pub pkcs12_passphrase: Option<String>,
    pub ca_chain: String,
}

impl CertificateBase for Certificate {
    fn kind(&self) -> EntityKind {
        EntityKind::Certificate
    }
    fn id(&self) -> EntityId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn subject(&self) -> &Subject {
        &self.subject
    }
    fn parent(&self) -> Option<EntityId> {
        self.parent
    }
    fn is_active(&self) -> bool {
        self.active
    }
    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
    fn key_length(&self) -> u32 {
        self.key_length
    }
    fn valid_days(&self) -> u32 {
        self.valid_days
    }
    fn revoked(&self) -> Option<DateTime<Utc>> {
        self.revoked
    }
    fn der_encoded(&self) -> bool {
        self.der_encoded
    }
    fn pkcs12_encoded(&self) -> bool {
        self.pkcs12_encoded
    }
}

/// Any node of the tree.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Entity {
    Authority(CertificateAuthority),
    Certificate(Certificate),
}

impl Entity {
    pub fn base(&self) -> &dyn CertificateBase {
        match self {
            Entity::Authority(ca) => ca,
            Entity::Certificate(cert) => cert,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.base().kind()
    }

    pub fn id(&self) -> EntityId {
        self.base().id()
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.base().parent()
    }

    pub fn is_active(&self) -> bool {
        self.base().is_active()
    }

    pub fn as_authority(&self) -> Option<&CertificateAuthority> {
        match self {
            Entity::Authority(ca) => Some(ca),
            Entity::Certificate(_) => None,
        }
    }

    pub fn as_certificate(&self) -> Option<&Certificate> {
        match self {
            Entity::Certificate(cert) => Some(cert),
            Entity::Authority(_) => None,
        }
    }
}

impl From<CertificateAuthority> for Entity {
    fn from(ca: CertificateAuthority) -> Self {
        Entity::Authority(ca)
    }
}

impl From<Certificate> for Entity {
    fn from(cert: Certificate) -> Self {
        Entity::Certificate(cert)
    }
}

/// Addresses an entity the way an operator names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Authority(String),
    Certificate {
        name: String,
        parent: Option<String>,
    },
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Authority(name) => write!(f, "CA '{}'", name),
            EntityRef::Certificate {
                name,
                parent: Some(parent),
            } => write!(f, "certificate '{}' (issued by '{}')", name, parent),
            EntityRef::Certificate { name, parent: None } => {
                write!(f, "self-signed certificate '{}'", name)
            }
        }
    }
}

/// Input for creating a CA.
#[derive(Debug, Clone)]
pub struct NewAuthority {
    pub name: String,
    pub description: String,
    pub subject: Subject,
    /// Name of the issuing CA; `None` creates a self-signed root.
    pub parent: Option<String>,
    pub key_length: u32,
    pub valid_days: u32,
    pub subcas_allowed: bool,
    pub policy: Policy,
    pub crl_distribution: Option<String>,
    pub extension: String,
    pub der_encoded: bool,
}

/// Input for creating a leaf certificate.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub name: String,
    pub description: String,
    pub subject: Subject,
    /// Name of the issuing CA; `None` creates a self-signed leaf.
    pub parent: Option<String>,
    pub key_length: u32,
    pub valid_days: u32,
    pub extension: String,
    /// Comma separated `DNS:`, `IP:` and `email:` entries.
    pub subject_alt_names: String,
    pub der_encoded: bool,
    pub pkcs12_encoded: bool,
}

/// The cosmetic fields an `update` may touch.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub description: Option<String>,
    pub der_encoded: Option<bool>,
    pub pkcs12_encoded: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeAction {
    Create,
    Update,
    Renew,
    Revoke,
    /// Deactivated because an ancestor was revoked.
    Broken,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Renew => "renew",
            ChangeAction::Revoke => "revoke",
            ChangeAction::Broken => "broken",
            ChangeAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ChangeAction::Create),
            "update" => Some(ChangeAction::Update),
            "renew" => Some(ChangeAction::Renew),
            "revoke" => Some(ChangeAction::Revoke),
            "broken" => Some(ChangeAction::Broken),
            "delete" => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

/// One completed mutation. Entries are append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ChangelogEntry {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub entity_name: String,
    pub action: ChangeAction,
    pub actor: String,
    pub action_time: DateTime<Utc>,
    pub changes: String,
}

/// Line-per-field diff of two serialized entity states.
pub fn diff_fields<T: Serialize>(before: Option<&T>, after: &T) -> PkiResult<String> {
    let after = serde_json::to_value(after)?;
    let before = match before {
        Some(value) => serde_json::to_value(value)?,
        None => serde_json::Value::Null,
    };
    let mut lines = Vec::new();
    if let serde_json::Value::Object(fields) = &after {
        for (key, new_value) in fields {
            let old_value = before.get(key).unwrap_or(&serde_json::Value::Null);
            if key == "id" || old_value == new_value {
                continue;
            }
            lines.push(format!("{}: {} -> {}", key, old_value, new_value));
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Subject {
        Subject {
            common_name: "Root CA".to_string(),
            country: "de".to_string(),
            state: "Bavaria".to_string(),
            locality: "Munich".to_string(),
            organization: "Bozo Clown Inc.".to_string(),
            organizational_unit: Some("IT".to_string()),
            email: Some("a@b.com".to_string()),
        }
    }

    #[test]
    fn test_subject_rendering() {
        let subject = subject().normalized();
        assert_eq!(
            subject.to_openssl(),
            "/CN=Root CA/C=DE/ST=Bavaria/localityName=Munich/O=Bozo Clown Inc./organizationalUnitName=IT/emailAddress=a@b.com"
        );
    }

    #[test]
    fn test_subject_escapes_slash() {
        let mut subject = subject();
        subject.organizational_unit = None;
        subject.email = None;
        subject.organization = "R/D".to_string();
        assert!(subject.to_openssl().ends_with("/O=R\\/D"));
    }

    #[test]
    fn test_subject_rejects_bad_country() {
        let mut subject = subject();
        subject.country = "DEU".to_string();
        assert!(matches!(
            subject.validate(),
            Err(PkiError::Validation { field, .. }) if field == "country"
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("name", "Root_CA-1.x").is_ok());
        assert!(validate_name("name", "Root CA").is_err());
        assert!(validate_name("name", "../etc").is_err());
        assert!(validate_name("name", "..").is_err());
        assert!(validate_name("name", SELF_SIGNED_STORE).is_err());
        assert!(validate_name("name", "").is_err());
    }

    #[test]
    fn test_diff_fields_lists_changes_only() {
        #[derive(Serialize)]
        struct Row {
            id: i64,
            active: bool,
            description: String,
        }
        let before = Row {
            id: 1,
            active: true,
            description: "a".to_string(),
        };
        let after = Row {
            id: 1,
            active: false,
            description: "a".to_string(),
        };
        assert_eq!(diff_fields(Some(&before), &after).unwrap(), "active: true -> false");
    }

    #[test]
    fn test_entity_dispatch() {
        let ca = CertificateAuthority {
            id: 3,
            name: "Root_CA".to_string(),
            description: String::new(),
            subject: subject(),
            parent: None,
            active: true,
            serial: Some("07".to_string()),
            passphrase: String::new(),
            key_length: 2048,
            valid_days: 1000,
            created: None,
            expiry_date: None,
            revoked: None,
            subcas_allowed: true,
            policy: Policy::Anything,
            crl_distribution: None,
            extension: "v3_ca".to_string(),
            ca_chain: "self-signed".to_string(),
            der_encoded: false,
        };
        let entity = Entity::from(ca);
        assert_eq!(entity.kind(), EntityKind::Authority);
        assert_eq!(entity.name(), "Root_CA");
        assert_eq!(entity.base().serial(), Some("07"));
        assert!(entity.as_certificate().is_none());
    }
}
