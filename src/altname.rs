//! subjectAltName entries for leaf certificates.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

use crate::error::{PkiError, PkiResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    Dns(String),
    Ip(IpAddr),
    /// `email:copy` takes the address from the subject.
    Email(String),
}

impl AltName {
    pub fn parse(entry: &str) -> PkiResult<Self> {
        let (tag, value) = entry
            .split_once(':')
            .ok_or_else(|| invalid(entry, "expected TYPE:value"))?;
        let value = value.trim();
        match tag.trim().to_ascii_lowercase().as_str() {
            "dns" => {
                if is_dns_name(value) {
                    Ok(AltName::Dns(value.to_string()))
                } else {
                    Err(invalid(entry, "not a valid DNS name"))
                }
            }
            "ip" => value
                .parse::<IpAddr>()
                .map(AltName::Ip)
                .map_err(|_| invalid(entry, "not a valid IP address")),
            "email" => {
                if value == "copy" || is_email(value) {
                    Ok(AltName::Email(value.to_string()))
                } else {
                    Err(invalid(entry, "not a valid email address"))
                }
            }
            _ => Err(invalid(entry, "type must be DNS, IP or email")),
        }
    }
}

impl fmt::Display for AltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AltName::Dns(name) => write!(f, "DNS:{}", name),
            AltName::Ip(addr) => write!(f, "IP:{}", addr),
            AltName::Email(addr) => write!(f, "email:{}", addr),
        }
    }
}

fn invalid(entry: &str, message: &str) -> PkiError {
    PkiError::validation("subject_alt_names", format!("'{}': {}", entry, message))
}

fn is_dns_name(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').enumerate().all(|(i, label)| {
            // a leading wildcard label is allowed
            (i == 0 && label == "*")
                || (!label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
        })
}

pub(crate) fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
        && domain.contains('.')
        && is_dns_name(domain)
}

/// Ordered list of alt names, kept in the store in its signer form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltNames(Vec<AltName>);

impl SubjectAltNames {
    /// Parse a comma separated list; empty input yields an empty list.
    pub fn parse(value: &str) -> PkiResult<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(AltName::parse)
            .collect::<PkiResult<Vec<_>>>()
            .map(SubjectAltNames)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[AltName] {
        &self.0
    }

    /// Value handed to the signer's `subjectAltName` extension.
    pub fn to_openssl(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for SubjectAltNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

impl Serialize for SubjectAltNames {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_list() {
        let sans = SubjectAltNames::parse("DNS:www.example.com, IP:10.0.0.1,email:copy").unwrap();
        assert_eq!(sans.entries().len(), 3);
        assert_eq!(
            sans.to_openssl().as_deref(),
            Some("DNS:www.example.com,IP:10.0.0.1,email:copy")
        );
    }

    #[test]
    fn test_parse_ipv6_and_wildcard() {
        let sans = SubjectAltNames::parse("IP:::1,DNS:*.example.com").unwrap();
        assert_eq!(sans.entries()[0], AltName::Ip("::1".parse().unwrap()));
        assert_eq!(sans.entries()[1], AltName::Dns("*.example.com".to_string()));
    }

    #[test]
    fn test_empty_list() {
        let sans = SubjectAltNames::parse("  ").unwrap();
        assert!(sans.is_empty());
        assert_eq!(sans.to_openssl(), None);
    }

    #[test]
    fn test_rejects_bad_entries() {
        assert!(SubjectAltNames::parse("DNS:exa mple.com").is_err());
        assert!(SubjectAltNames::parse("IP:999.1.1.1").is_err());
        assert!(SubjectAltNames::parse("email:nobody").is_err());
        assert!(SubjectAltNames::parse("URI:http://x").is_err());
        assert!(SubjectAltNames::parse("www.example.com").is_err());
    }

    #[test]
    fn test_email_check() {
        assert!(is_email("a.b+c@mail.example.org"));
        assert!(!is_email("a@localhost"));
        assert!(!is_email("@example.com"));
    }
}
