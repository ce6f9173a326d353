//! x509v3 extension profiles.
//!
//! Each profile renders four signer config sections: the bare profile plus
//! variants that add the CRL distribution point and/or the subjectAltName.
//! The values of both are read from the signer's environment at signing time.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PkiError, PkiResult};
use crate::models::validate_name;

pub const KEY_USAGES: [&str; 9] = [
    "digitalSignature",
    "nonRepudiation",
    "keyEncipherment",
    "dataEncipherment",
    "keyAgreement",
    "keyCertSign",
    "cRLSign",
    "encipherOnly",
    "decipherOnly",
];

pub const EXTENDED_KEY_USAGES: [&str; 10] = [
    "serverAuth",
    "clientAuth",
    "codeSigning",
    "emailProtection",
    "timeStamping",
    "OCSPSigning",
    "msCodeInd",
    "msCodeCom",
    "msCTLSign",
    "msEFS",
];

pub const SAN_ENV: &str = "S_A_N";
pub const CDP_ENV: &str = "C_D_P";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtensionClass {
    /// May sign sub-CAs.
    Authority,
    /// CA with pathlen:0; signs leaves only.
    EdgeAuthority,
    EndEntity,
}

impl ExtensionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionClass::Authority => "ca",
            ExtensionClass::EdgeAuthority => "edge_ca",
            ExtensionClass::EndEntity => "end_entity",
        }
    }

    pub fn parse(value: &str) -> PkiResult<Self> {
        match value {
            "ca" => Ok(ExtensionClass::Authority),
            "edge_ca" => Ok(ExtensionClass::EdgeAuthority),
            "end_entity" => Ok(ExtensionClass::EndEntity),
            other => Err(PkiError::validation(
                "class",
                format!("unknown extension class '{}'", other),
            )),
        }
    }

    pub fn is_authority(&self) -> bool {
        !matches!(self, ExtensionClass::EndEntity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct X509Extension {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub class: ExtensionClass,
    pub basic_constraints: String,
    pub basic_constraints_critical: bool,
    pub key_usage: Vec<String>,
    pub key_usage_critical: bool,
    pub extended_key_usage: Vec<String>,
    pub extended_key_usage_critical: bool,
    pub subject_key_identifier: String,
    pub authority_key_identifier: String,
    /// Whether issued certificates carry the issuer's CRL distribution URL.
    pub crl_distribution_point: bool,
    pub created: Option<DateTime<Utc>>,
}

/// One `[section]` of the signer config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSection {
    pub name: String,
    pub lines: Vec<String>,
}

impl X509Extension {
    fn profile(
        name: &str,
        description: &str,
        class: ExtensionClass,
        basic_constraints: &str,
        key_usage: &[&str],
        extended_key_usage: &[&str],
    ) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            description: description.to_string(),
            class,
            basic_constraints: basic_constraints.to_string(),
            basic_constraints_critical: true,
            key_usage: key_usage.iter().map(|s| s.to_string()).collect(),
            key_usage_critical: true,
            extended_key_usage: extended_key_usage.iter().map(|s| s.to_string()).collect(),
            extended_key_usage_critical: false,
            subject_key_identifier: "hash".to_string(),
            authority_key_identifier: "keyid:always,issuer".to_string(),
            crl_distribution_point: true,
            created: None,
        }
    }

    /// Profiles seeded into a fresh store.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::profile(
                "v3_ca",
                "Root or intermediate CA which may sign sub-CAs",
                ExtensionClass::Authority,
                "CA:true",
                &["digitalSignature", "cRLSign", "keyCertSign"],
                &[],
            ),
            Self::profile(
                "v3_edge_ca",
                "Edge CA which may only sign end-entity certificates",
                ExtensionClass::EdgeAuthority,
                "CA:true, pathlen:0",
                &["digitalSignature", "cRLSign", "keyCertSign"],
                &[],
            ),
            Self::profile(
                "v3_server_cert",
                "TLS server certificate",
                ExtensionClass::EndEntity,
                "CA:false",
                &["digitalSignature", "keyEncipherment"],
                &["serverAuth"],
            ),
            Self::profile(
                "v3_client_cert",
                "TLS client and S/MIME certificate",
                ExtensionClass::EndEntity,
                "CA:false",
                &["digitalSignature", "nonRepudiation", "keyEncipherment"],
                &["clientAuth", "emailProtection"],
            ),
        ]
    }

    pub fn validate(&self) -> PkiResult<()> {
        validate_name("name", &self.name)?;
        let constraints = self.basic_constraints.replace(' ', "").to_ascii_lowercase();
        let is_ca = constraints.split(',').any(|c| c == "ca:true");
        if is_ca != self.class.is_authority() {
            return Err(PkiError::validation(
                "basic_constraints",
                format!(
                    "'{}' does not match extension class '{}'",
                    self.basic_constraints,
                    self.class.as_str()
                ),
            ));
        }
        if self.class == ExtensionClass::EdgeAuthority && !constraints.contains("pathlen:0") {
            return Err(PkiError::validation(
                "basic_constraints",
                "an edge CA profile needs pathlen:0",
            ));
        }
        if let Some(unknown) = self
            .key_usage
            .iter()
            .find(|u| !KEY_USAGES.contains(&u.as_str()))
        {
            return Err(PkiError::validation(
                "key_usage",
                format!("unknown key usage '{}'", unknown),
            ));
        }
        if let Some(unknown) = self
            .extended_key_usage
            .iter()
            .find(|u| !EXTENDED_KEY_USAGES.contains(&u.as_str()))
        {
            return Err(PkiError::validation(
                "extended_key_usage",
                format!("unknown extended key usage '{}'", unknown),
            ));
        }
        let signs = self.key_usage.iter().any(|u| u == "keyCertSign");
        if self.class.is_authority() != signs {
            return Err(PkiError::validation(
                "key_usage",
                "keyCertSign must be set for CA profiles and only for them",
            ));
        }
        Ok(())
    }

    /// Config section name for the requested variant.
    pub fn section_name(&self, with_san: bool, with_cdp: bool) -> String {
        match (with_san, with_cdp) {
            (false, false) => self.name.clone(),
            (false, true) => format!("{}_cdp", self.name),
            (true, false) => format!("{}_san", self.name),
            (true, true) => format!("{}_san_cdp", self.name),
        }
    }

    fn base_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "basicConstraints = {}",
            critical(self.basic_constraints_critical, &self.basic_constraints)
        )];
        if !self.key_usage.is_empty() {
            lines.push(format!(
                "keyUsage = {}",
                critical(self.key_usage_critical, &self.key_usage.join(", "))
            ));
        }
        if !self.extended_key_usage.is_empty() {
            lines.push(format!(
                "extendedKeyUsage = {}",
                critical(
                    self.extended_key_usage_critical,
                    &self.extended_key_usage.join(", ")
                )
            ));
        }
        lines.push(format!("subjectKeyIdentifier = {}", self.subject_key_identifier));
        lines.push(format!(
            "authorityKeyIdentifier = {}",
            self.authority_key_identifier
        ));
        lines
    }

    pub fn config_sections(&self) -> Vec<ConfigSection> {
        [(false, false), (false, true), (true, false), (true, true)]
            .into_iter()
            .map(|(san, cdp)| {
                let mut lines = self.base_lines();
                if cdp {
                    lines.push(format!("crlDistributionPoints = $ENV::{}", CDP_ENV));
                }
                if san {
                    lines.push(format!("subjectAltName = $ENV::{}", SAN_ENV));
                }
                ConfigSection {
                    name: self.section_name(san, cdp),
                    lines,
                }
            })
            .collect()
    }
}

fn critical(flag: bool, value: &str) -> String {
    if flag {
        format!("critical, {}", value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        for profile in X509Extension::defaults() {
            profile.validate().unwrap();
        }
    }

    #[test]
    fn test_sections_for_profile() {
        let server = X509Extension::defaults()
            .into_iter()
            .find(|p| p.name == "v3_server_cert")
            .unwrap();
        let sections = server.config_sections();
        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "v3_server_cert",
                "v3_server_cert_cdp",
                "v3_server_cert_san",
                "v3_server_cert_san_cdp"
            ]
        );
        assert_eq!(sections[0].lines[0], "basicConstraints = critical, CA:false");
        assert!(sections[3]
            .lines
            .contains(&"subjectAltName = $ENV::S_A_N".to_string()));
        assert!(sections[3]
            .lines
            .contains(&"crlDistributionPoints = $ENV::C_D_P".to_string()));
        assert!(!sections[0].lines.iter().any(|l| l.contains("$ENV")));
    }

    #[test]
    fn test_end_entity_cannot_sign() {
        let mut profile = X509Extension::defaults()
            .into_iter()
            .find(|p| p.name == "v3_client_cert")
            .unwrap();
        profile.key_usage.push("keyCertSign".to_string());
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_edge_profile_requires_pathlen() {
        let mut profile = X509Extension::defaults()
            .into_iter()
            .find(|p| p.name == "v3_edge_ca")
            .unwrap();
        profile.basic_constraints = "CA:true".to_string();
        assert!(profile.validate().is_err());
    }
}
