//! Adapter around the `openssl` command line signer.
//!
//! One [`SignerAdapter`] is bound to one entity and knows where its artifacts
//! live. Every invocation runs with a cleared environment that only carries
//! `PKI_DIR`, the subjectAltName / CRL distribution values referenced by the
//! rendered config, and passphrases under short-lived random variable names.
//! Passphrases never appear on a command line.

use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, error, info};

use crate::chain::ChainLink;
use crate::configs::AppConfig;
use crate::error::{PkiError, PkiResult};
use crate::extensions::{X509Extension, CDP_ENV, SAN_ENV};
use crate::models::{Certificate, CertificateAuthority, Entity, EntityKind};
use crate::paths::{crl_path, ArtifactPaths};

/// Placeholder for `$ENV::S_A_N`; the config is parsed even when the chosen
/// section does not reference it.
const DEFAULT_SAN: &str = "email:copy";
const DEFAULT_CDP: &str = "URI:http://localhost/unused.crl";

/// Which profile variant to sign with, and the values it reads from the env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRequest {
    pub section: String,
    pub subject_alt_names: Option<String>,
    pub crl_distribution: Option<String>,
}

impl ExtensionRequest {
    /// Pick the section of `profile` that matches the available SAN and CDP.
    ///
    /// The CDP is only used when the profile asks for it and the issuer has a
    /// distribution URL.
    pub fn new(
        profile: &X509Extension,
        subject_alt_names: Option<String>,
        issuer_crl_distribution: Option<&str>,
    ) -> Self {
        let crl_distribution = issuer_crl_distribution
            .filter(|_| profile.crl_distribution_point)
            .filter(|url| !url.is_empty())
            .map(|url| format!("URI:{}", url));
        Self {
            section: profile.section_name(subject_alt_names.is_some(), crl_distribution.is_some()),
            subject_alt_names,
            crl_distribution,
        }
    }
}

/// One signer command under construction.
struct Invocation {
    verb: &'static str,
    args: Vec<OsString>,
    secrets: Vec<(String, SecretString)>,
    env: Vec<(&'static str, String)>,
}

impl Invocation {
    fn new(verb: &'static str) -> Self {
        Self {
            verb,
            args: vec![verb.into()],
            secrets: Vec::new(),
            env: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn path(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).arg(path.as_os_str())
    }

    /// Pass `passphrase` via `flag env:<random name>`.
    fn passphrase(mut self, flag: &str, passphrase: &SecretString) -> PkiResult<Self> {
        let name = random_env_name()?;
        self.args.push(flag.into());
        self.args.push(format!("env:{}", name).into());
        self.secrets
            .push((name, SecretString::new(passphrase.expose_secret().clone())));
        Ok(self)
    }

    fn extensions(mut self, request: &ExtensionRequest) -> Self {
        if let Some(san) = &request.subject_alt_names {
            self.env.push((SAN_ENV, san.clone()));
        }
        if let Some(cdp) = &request.crl_distribution {
            self.env.push((CDP_ENV, cdp.clone()));
        }
        self.arg("-extensions").arg(request.section.as_str())
    }
}

fn random_env_name() -> PkiResult<String> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = [0u8; 12];
    openssl::rand::rand_bytes(&mut bytes)?;
    let suffix: String = bytes
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect();
    Ok(format!("PKI_PASS_{}", suffix))
}

/// Strip colons and lower-case, so serials from different sources compare.
pub fn normalize_serial(serial: &str) -> String {
    serial.replace(':', "").trim().to_ascii_lowercase()
}

/// Colon-separated lower-case byte pairs, as stored in the metadata.
pub fn format_serial(raw: &str) -> String {
    let hex = normalize_serial(raw);
    let hex = if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex
    };
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Serials listed in the text dump of a CRL.
pub fn parse_crl_serials(crl_text: &str) -> Vec<String> {
    crl_text
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Serial Number:"))
        .map(normalize_serial)
        .collect()
}

/// Serials marked revoked (`R`) in a signer index file.
pub fn parse_index_revoked(index: &str) -> Vec<String> {
    index
        .lines()
        .filter(|line| line.starts_with('R'))
        .filter_map(|line| line.split('\t').nth(3))
        .map(normalize_serial)
        .collect()
}

/// Subject lines of a chain file, root first.
pub fn read_chain_subjects(path: &Path) -> PkiResult<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let mut in_pem = false;
    let mut subjects = Vec::new();
    for line in contents.lines() {
        if line.starts_with("-----BEGIN") {
            in_pem = true;
        } else if line.starts_with("-----END") {
            in_pem = false;
        } else if !in_pem && !line.trim().is_empty() {
            subjects.push(line.to_string());
        }
    }
    Ok(subjects)
}

fn remove_if_exists(path: &Path) -> PkiResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub struct SignerAdapter<'a> {
    config: &'a AppConfig,
    name: String,
    kind: EntityKind,
    subject: String,
    key_length: u32,
    valid_days: u32,
    issuer: Option<String>,
    paths: ArtifactPaths,
}

impl<'a> SignerAdapter<'a> {
    pub fn for_authority(
        config: &'a AppConfig,
        ca: &CertificateAuthority,
        parent: Option<&CertificateAuthority>,
    ) -> Self {
        Self {
            config,
            name: ca.name.clone(),
            kind: EntityKind::Authority,
            subject: ca.subject.to_openssl(),
            key_length: ca.key_length,
            valid_days: ca.valid_days,
            issuer: parent.map(|p| p.name.clone()),
            paths: ArtifactPaths::for_authority(config, ca, parent),
        }
    }

    pub fn for_certificate(
        config: &'a AppConfig,
        cert: &Certificate,
        parent: Option<&CertificateAuthority>,
    ) -> Self {
        Self {
            config,
            name: cert.name.clone(),
            kind: EntityKind::Certificate,
            subject: cert.subject.to_openssl(),
            key_length: cert.key_length,
            valid_days: cert.valid_days,
            issuer: parent.map(|p| p.name.clone()),
            paths: ArtifactPaths::for_certificate(config, cert, parent),
        }
    }

    pub fn for_entity(
        config: &'a AppConfig,
        entity: &Entity,
        parent: Option<&CertificateAuthority>,
    ) -> Self {
        match entity {
            Entity::Authority(ca) => Self::for_authority(config, ca, parent),
            Entity::Certificate(cert) => Self::for_certificate(config, cert, parent),
        }
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    fn issuer(&self) -> PkiResult<&str> {
        self.issuer.as_deref().ok_or_else(|| {
            PkiError::consistency(format!("'{}' has no issuing CA", self.name))
        })
    }

    fn exec(&self, invocation: Invocation) -> PkiResult<String> {
        let mut command = Command::new(&self.config.openssl_bin);
        command
            .args(&invocation.args)
            .env_clear()
            .env("PKI_DIR", self.config.pki_dir())
            .env(SAN_ENV, DEFAULT_SAN)
            .env(CDP_ENV, DEFAULT_CDP)
            .stdin(Stdio::null());
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }
        for (key, value) in &invocation.secrets {
            command.env(key, value.expose_secret());
        }

        debug!(entity = %self.name, verb = invocation.verb, "running signer");
        let output = command.output().map_err(|e| {
            error!(entity = %self.name, verb = invocation.verb, error = %e, "failed to start signer");
            PkiError::SignerExecution {
                command: invocation.verb.to_string(),
            }
        })?;
        if !output.status.success() {
            error!(
                entity = %self.name,
                verb = invocation.verb,
                status = %output.status,
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "signer command failed"
            );
            return Err(PkiError::SignerExecution {
                command: invocation.verb.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn conf_path(&self) -> std::path::PathBuf {
        self.config.openssl_conf_path()
    }

    fn ensure_store(&self) -> PkiResult<()> {
        if let Some(dir) = self.paths.key.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// New RSA key; encrypted with AES-256 when a passphrase is given.
    pub fn generate_key(&self, passphrase: Option<&SecretString>) -> PkiResult<()> {
        self.ensure_store()?;
        let mut invocation = Invocation::new("genrsa");
        if let Some(passphrase) = passphrase {
            invocation = invocation.arg("-aes256").passphrase("-passout", passphrase)?;
        }
        let invocation = invocation
            .path("-out", &self.paths.key)
            .arg(self.key_length.to_string());
        self.exec(invocation)?;
        fs::set_permissions(&self.paths.key, fs::Permissions::from_mode(0o600))?;
        info!(entity = %self.name, bits = self.key_length, "generated private key");
        Ok(())
    }

    pub fn generate_csr(&self, passphrase: Option<&SecretString>) -> PkiResult<()> {
        let mut invocation = Invocation::new("req")
            .path("-config", &self.conf_path())
            .arg("-new")
            .arg("-batch")
            .arg("-subj")
            .arg(self.subject.as_str())
            .path("-key", &self.paths.key)
            .path("-out", &self.paths.csr);
        if let Some(passphrase) = passphrase {
            invocation = invocation.passphrase("-passin", passphrase)?;
        }
        self.exec(invocation)?;
        debug!(entity = %self.name, "generated signing request");
        Ok(())
    }

    /// Self-sign with the entity's own key (roots and parentless leaves).
    ///
    /// `force_serial` applies the configured root serial; it is only used when
    /// a root is first created.
    pub fn generate_self_signed(
        &self,
        passphrase: Option<&SecretString>,
        extension: &ExtensionRequest,
        force_serial: bool,
    ) -> PkiResult<()> {
        self.ensure_store()?;
        let mut invocation = Invocation::new("req")
            .path("-config", &self.conf_path())
            .arg("-batch")
            .arg("-new")
            .arg("-x509")
            .arg("-subj")
            .arg(self.subject.as_str())
            .arg("-days")
            .arg(self.valid_days.to_string())
            .extensions(extension)
            .path("-key", &self.paths.key)
            .path("-out", &self.paths.cert);
        if let Some(passphrase) = passphrase {
            invocation = invocation.passphrase("-passin", passphrase)?;
        }
        if let Some(serial) = self.config.forced_root_serial().filter(|_| force_serial) {
            invocation = invocation.arg("-set_serial").arg(serial.to_string());
        }
        self.exec(invocation)?;
        info!(entity = %self.name, section = %extension.section, "self-signed certificate");
        Ok(())
    }

    /// Have the issuing CA sign the CSR, then link it by subject hash.
    pub fn sign_csr(
        &self,
        parent_passphrase: &SecretString,
        extension: &ExtensionRequest,
    ) -> PkiResult<()> {
        let issuer = self.issuer()?;
        let invocation = Invocation::new("ca")
            .path("-config", &self.conf_path())
            .arg("-name")
            .arg(issuer)
            .arg("-batch")
            .arg("-notext")
            .path("-in", &self.paths.csr)
            .path("-out", &self.paths.cert)
            .arg("-days")
            .arg(self.valid_days.to_string())
            .extensions(extension)
            .passphrase("-passin", parent_passphrase)?;
        self.exec(invocation)?;

        let serial_file = format!("{}.pem", normalize_serial(&self.serial()?).to_ascii_uppercase());
        let alias = self.paths.issuer_certs.join(format!("{}.0", self.fingerprint_hash()?));
        if alias.symlink_metadata().is_ok() {
            fs::remove_file(&alias)?;
        }
        symlink(&serial_file, &alias)?;
        info!(entity = %self.name, issuer, section = %extension.section, "certificate signed");
        Ok(())
    }

    /// Revoke at the issuer. `Ok(false)` when already revoked.
    pub fn revoke(&self, parent_passphrase: &SecretString) -> PkiResult<bool> {
        let issuer = self.issuer()?;
        if self.is_revoked()? {
            info!(entity = %self.name, issuer, "already revoked; skipping");
            return Ok(false);
        }
        let invocation = Invocation::new("ca")
            .path("-config", &self.conf_path())
            .arg("-name")
            .arg(issuer)
            .arg("-batch")
            .path("-revoke", &self.paths.cert)
            .passphrase("-passin", parent_passphrase)?;
        self.exec(invocation)?;
        info!(entity = %self.name, issuer, "certificate revoked");
        Ok(true)
    }

    /// Regenerate the CRL of CA `ca_name`, signed with `passphrase`.
    pub fn generate_crl(&self, ca_name: &str, passphrase: &SecretString) -> PkiResult<()> {
        let invocation = Invocation::new("ca")
            .path("-config", &self.conf_path())
            .arg("-name")
            .arg(ca_name)
            .arg("-gencrl")
            .path("-out", &crl_path(self.config, ca_name))
            .arg("-crldays")
            .arg(self.config.crl_days.to_string())
            .passphrase("-passin", passphrase)?;
        self.exec(invocation)?;
        debug!(ca = ca_name, "CRL regenerated");
        Ok(())
    }

    pub fn export_der(&self) -> PkiResult<()> {
        let invocation = Invocation::new("x509")
            .path("-in", &self.paths.cert)
            .path("-out", &self.paths.der)
            .arg("-outform")
            .arg("DER");
        self.exec(invocation)?;
        debug!(entity = %self.name, "DER export written");
        Ok(())
    }

    pub fn remove_der(&self) -> PkiResult<()> {
        remove_if_exists(&self.paths.der)?;
        Ok(())
    }

    /// Certificate-only PKCS#12 bundle protected by `export_passphrase`.
    pub fn export_pkcs12(&self, export_passphrase: &SecretString) -> PkiResult<()> {
        let invocation = Invocation::new("pkcs12")
            .arg("-export")
            .arg("-nokeys")
            .path("-in", &self.paths.cert)
            .path("-out", &self.paths.pkcs12)
            .passphrase("-passout", export_passphrase)?;
        self.exec(invocation)?;
        debug!(entity = %self.name, "PKCS#12 export written");
        Ok(())
    }

    pub fn remove_pkcs12(&self) -> PkiResult<()> {
        remove_if_exists(&self.paths.pkcs12)?;
        Ok(())
    }

    /// Write the root-first chain file: each link's subject line followed by
    /// its PEM certificate.
    pub fn rebuild_chain_file(&self, links: &[ChainLink]) -> PkiResult<()> {
        let mut contents = String::new();
        for link in links {
            let cert_path = match link.kind {
                EntityKind::Certificate => self.paths.cert.clone(),
                EntityKind::Authority => ArtifactPaths::authority_certificate(self.config, &link.name),
            };
            let cert = X509::from_pem(&fs::read(&cert_path)?)?;
            contents.push_str(&link.subject);
            contents.push('\n');
            contents.push_str(&String::from_utf8_lossy(&cert.to_pem()?));
        }
        let staging = self.paths.chain.with_extension("pem.tmp");
        fs::write(&staging, contents)?;
        fs::rename(&staging, &self.paths.chain)?;
        debug!(entity = %self.name, links = links.len(), "chain file rebuilt");
        Ok(())
    }

    /// Serial of the current certificate, colon separated.
    pub fn serial(&self) -> PkiResult<String> {
        let output = self.exec(
            Invocation::new("x509")
                .path("-in", &self.paths.cert)
                .arg("-noout")
                .arg("-serial"),
        )?;
        let raw = output
            .trim()
            .strip_prefix("serial=")
            .ok_or_else(|| PkiError::consistency(format!("unexpected serial output for '{}'", self.name)))?;
        Ok(format_serial(raw))
    }

    /// Subject hash used for the `<hash>.0` alias.
    pub fn fingerprint_hash(&self) -> PkiResult<String> {
        let output = self.exec(
            Invocation::new("x509")
                .arg("-hash")
                .arg("-noout")
                .path("-in", &self.paths.cert),
        )?;
        Ok(output.trim().to_string())
    }

    pub fn subject(&self) -> PkiResult<String> {
        let output = self.exec(
            Invocation::new("x509")
                .path("-in", &self.paths.cert)
                .arg("-noout")
                .arg("-subject"),
        )?;
        Ok(output.trim().to_string())
    }

    /// Human-readable dump of the current certificate.
    pub fn dump_text(&self) -> PkiResult<String> {
        self.exec(
            Invocation::new("x509")
                .path("-in", &self.paths.cert)
                .arg("-noout")
                .arg("-text"),
        )
    }

    /// Whether the issuer lists this certificate as revoked, in its CRL or in
    /// its index. Roots and parentless leaves are never revoked.
    pub fn is_revoked(&self) -> PkiResult<bool> {
        let Some(crl) = &self.paths.issuer_crl else {
            return Ok(false);
        };
        if !self.paths.cert.exists() {
            return Ok(false);
        }
        let serial = normalize_serial(&self.serial()?);

        if crl.exists() {
            let text = self.exec(
                Invocation::new("crl")
                    .path("-in", crl)
                    .arg("-text")
                    .arg("-noout"),
            )?;
            if parse_crl_serials(&text).contains(&serial) {
                return Ok(true);
            }
        }
        let index = self
            .paths
            .issuer_certs
            .parent()
            .map(|dir| dir.join("index.txt"));
        match index {
            Some(index) if index.exists() => {
                Ok(parse_index_revoked(&fs::read_to_string(index)?).contains(&serial))
            }
            _ => Ok(false),
        }
    }

    /// Remove every artifact of this entity, including the issuer's serial
    /// copy and subject-hash alias.
    pub fn purge_all_artifacts(&self) -> PkiResult<()> {
        if self.paths.cert.exists() && self.issuer.is_some() {
            let serial_file = self.paths.issuer_certs.join(format!(
                "{}.pem",
                normalize_serial(&self.serial()?).to_ascii_uppercase()
            ));
            let alias = self.paths.issuer_certs.join(format!("{}.0", self.fingerprint_hash()?));
            if fs::read_link(&alias).ok().as_deref() == serial_file.file_name().map(Path::new) {
                fs::remove_file(&alias)?;
            }
            remove_if_exists(&serial_file)?;
        }
        self.remove_der()?;
        self.remove_pkcs12()?;
        for path in [&self.paths.csr, &self.paths.key, &self.paths.cert] {
            remove_if_exists(path)?;
        }
        if self.kind == EntityKind::Certificate {
            remove_if_exists(&self.paths.chain)?;
        }
        info!(entity = %self.name, "artifacts purged");
        Ok(())
    }
}
