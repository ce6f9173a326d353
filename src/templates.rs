//! Rendering of the shared signer configuration.

use askama::Template;

use crate::configs::AppConfig;
use crate::extensions::ConfigSection;
use crate::models::{CertificateAuthority, X509Extension};

pub struct AuthoritySection {
    pub name: String,
    pub policy: &'static str,
    pub default_days: u32,
}

#[derive(Template)]
#[template(path = "openssl.conf", escape = "none")]
pub struct OpensslConfTemplate {
    pub authorities: Vec<AuthoritySection>,
    pub sections: Vec<ConfigSection>,
    pub crl_days: u32,
    pub default_bits: u32,
}

impl OpensslConfTemplate {
    pub fn new(
        config: &AppConfig,
        authorities: &[CertificateAuthority],
        profiles: &[X509Extension],
    ) -> Self {
        Self {
            authorities: authorities
                .iter()
                .map(|ca| AuthoritySection {
                    name: ca.name.clone(),
                    policy: ca.policy.as_str(),
                    default_days: ca.valid_days,
                })
                .collect(),
            sections: profiles
                .iter()
                .flat_map(X509Extension::config_sections)
                .collect(),
            crl_days: config.crl_days,
            default_bits: config.default_key_length,
        }
    }
}
