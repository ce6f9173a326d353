//! Where an entity's artifacts live in the PKI store.
//!
//! ```text
//! <pki_dir>/
//!   openssl.conf
//!   <CA>/
//!     index.txt  serial  crlnumber
//!     <CA>-chain.cert.pem
//!     private/<CA>.key.pem
//!     certs/<CA>.{csr,cert}.pem  <CA>.cert.der
//!     certs/<leaf>.{key,csr,cert}.pem  <leaf>.cert.{der,p12}  <leaf>-chain.cert.pem
//!     certs/<SERIAL>.pem  certs/<hash>.0 -> <SERIAL>.pem
//!     crl/<CA>.crl.pem
//!   _SELF_SIGNED_CERTIFICATES/certs/...
//! ```

use std::path::{Path, PathBuf};

use crate::configs::AppConfig;
use crate::models::{Certificate, CertificateAuthority, Entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Key,
    Csr,
    Certificate,
    Der,
    Pkcs12,
    Chain,
    Crl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Directory owning the entity's files: its own CA dir, the issuer's, or
    /// the self-signed store.
    pub store_dir: PathBuf,
    pub key: PathBuf,
    pub csr: PathBuf,
    pub cert: PathBuf,
    pub der: PathBuf,
    pub pkcs12: PathBuf,
    pub chain: PathBuf,
    /// A CA's own revocation list.
    pub own_crl: Option<PathBuf>,
    /// The CRL that lists this entity once revoked; a root lists nothing.
    pub issuer_crl: Option<PathBuf>,
    /// Where the issuer's signer drops `<SERIAL>.pem` and the hash alias.
    pub issuer_certs: PathBuf,
}

impl ArtifactPaths {
    pub fn for_authority(
        config: &AppConfig,
        ca: &CertificateAuthority,
        parent: Option<&CertificateAuthority>,
    ) -> Self {
        let store_dir = config.ca_dir(&ca.name);
        let certs = store_dir.join("certs");
        let own_crl = crl_path(config, &ca.name);
        let (issuer_crl, issuer_certs) = match parent {
            Some(p) => (Some(crl_path(config, &p.name)), config.ca_dir(&p.name).join("certs")),
            None => (None, certs.clone()),
        };
        Self {
            key: store_dir.join("private").join(format!("{}.key.pem", ca.name)),
            csr: certs.join(format!("{}.csr.pem", ca.name)),
            cert: certs.join(format!("{}.cert.pem", ca.name)),
            der: certs.join(format!("{}.cert.der", ca.name)),
            pkcs12: certs.join(format!("{}.cert.p12", ca.name)),
            chain: store_dir.join(format!("{}-chain.cert.pem", ca.name)),
            own_crl: Some(own_crl),
            issuer_crl,
            issuer_certs,
            store_dir,
        }
    }

    pub fn for_certificate(
        config: &AppConfig,
        cert: &Certificate,
        parent: Option<&CertificateAuthority>,
    ) -> Self {
        let (store_dir, issuer_crl) = match parent {
            Some(p) => (config.ca_dir(&p.name), Some(crl_path(config, &p.name))),
            None => (config.self_signed_dir(), None),
        };
        let certs = store_dir.join("certs");
        Self {
            key: certs.join(format!("{}.key.pem", cert.name)),
            csr: certs.join(format!("{}.csr.pem", cert.name)),
            cert: certs.join(format!("{}.cert.pem", cert.name)),
            der: certs.join(format!("{}.cert.der", cert.name)),
            pkcs12: certs.join(format!("{}.cert.p12", cert.name)),
            chain: certs.join(format!("{}-chain.cert.pem", cert.name)),
            own_crl: None,
            issuer_crl,
            issuer_certs: certs,
            store_dir,
        }
    }

    pub fn for_entity(
        config: &AppConfig,
        entity: &Entity,
        parent: Option<&CertificateAuthority>,
    ) -> Self {
        match entity {
            Entity::Authority(ca) => Self::for_authority(config, ca, parent),
            Entity::Certificate(cert) => Self::for_certificate(config, cert, parent),
        }
    }

    /// The issued certificate of CA `name`.
    pub fn authority_certificate(config: &AppConfig, name: &str) -> PathBuf {
        config
            .ca_dir(name)
            .join("certs")
            .join(format!("{}.cert.pem", name))
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Path> {
        match kind {
            ArtifactKind::Key => Some(&self.key),
            ArtifactKind::Csr => Some(&self.csr),
            ArtifactKind::Certificate => Some(&self.cert),
            ArtifactKind::Der => Some(&self.der),
            ArtifactKind::Pkcs12 => Some(&self.pkcs12),
            ArtifactKind::Chain => Some(&self.chain),
            ArtifactKind::Crl => self.own_crl.as_deref(),
        }
    }
}

pub fn crl_path(config: &AppConfig, ca_name: &str) -> PathBuf {
    config
        .ca_dir(ca_name)
        .join("crl")
        .join(format!("{}.crl.pem", ca_name))
}
