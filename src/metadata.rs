//! Reconciles the on-disk PKI store with the set of CAs in the database.
//!
//! Every CA owns a directory with the layout the signer expects (`private/`,
//! `certs/`, `crl/`, a serial file, a CRL number file and an empty index). The
//! shared signer configuration is re-rendered on every pass, so it always
//! describes exactly the current CAs and extension profiles.
//!
//! Reconciling is idempotent: missing pieces are created, existing ones are
//! left alone, and directories of CAs that no longer exist are removed if they
//! carry the `crlnumber` marker. A pass interrupted halfway is repaired by the
//! next one.

use askama::Template;
use std::collections::HashSet;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::configs::{AppConfig, SELF_SIGNED_STORE};
use crate::error::PkiResult;
use crate::models::{CertificateAuthority, X509Extension};
use crate::templates::OpensslConfTemplate;

const PRIVATE_DIR_MODE: u32 = 0o700;
const PUBLIC_DIR_MODE: u32 = 0o755;
const CA_MARKER: &str = "crlnumber";

pub struct MetadataStore<'a> {
    config: &'a AppConfig,
}

impl<'a> MetadataStore<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self { config }
    }

    /// Bring directories and the signer config in line with `authorities`.
    ///
    /// Directory failures abort before the config is rendered, so a config
    /// never references a CA whose store could not be prepared.
    pub fn reconcile(
        &self,
        authorities: &[CertificateAuthority],
        profiles: &[X509Extension],
    ) -> PkiResult<()> {
        if let Err(e) = self.reconcile_directories(authorities) {
            error!(error = %e, "directory reconcile failed; signer config left untouched");
            return Err(e);
        }
        self.render_signer_config(authorities, profiles)?;
        info!(
            authorities = authorities.len(),
            profiles = profiles.len(),
            "PKI store reconciled"
        );
        Ok(())
    }

    fn reconcile_directories(&self, authorities: &[CertificateAuthority]) -> PkiResult<()> {
        let base = self.config.pki_dir();
        create_dir(base, PRIVATE_DIR_MODE)?;

        let wanted: HashSet<&str> = authorities.iter().map(|ca| ca.name.as_str()).collect();

        for entry in fs::read_dir(base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == SELF_SIGNED_STORE || wanted.contains(name.as_str()) {
                continue;
            }
            let path = entry.path();
            if is_managed_ca_dir(&path) {
                info!(ca = %name, "removing store of deleted CA");
                fs::remove_dir_all(&path)?;
            } else {
                warn!(dir = %path.display(), "leaving unmanaged directory in PKI store");
            }
        }

        for ca in authorities {
            self.initialize_ca_dir(ca)?;
        }
        Ok(())
    }

    fn initialize_ca_dir(&self, ca: &CertificateAuthority) -> PkiResult<()> {
        let dir = self.config.ca_dir(&ca.name);
        create_dir(&dir, PRIVATE_DIR_MODE)?;
        create_dir(&dir.join("private"), PRIVATE_DIR_MODE)?;
        create_dir(&dir.join("certs"), PUBLIC_DIR_MODE)?;
        create_dir(&dir.join("crl"), PUBLIC_DIR_MODE)?;

        let forced = if ca.is_root() {
            self.config.forced_root_serial()
        } else {
            None
        };
        let initial_serial = forced.map(|s| s + 1).unwrap_or(1);
        write_if_missing(&dir.join("serial"), &format!("{}\n", serial_hex(initial_serial)))?;
        write_if_missing(&dir.join("index.txt"), "")?;
        // written last: its presence marks the directory as complete and managed
        write_if_missing(&dir.join(CA_MARKER), "01\n")?;
        debug!(ca = %ca.name, "CA store ready");
        Ok(())
    }

    fn render_signer_config(
        &self,
        authorities: &[CertificateAuthority],
        profiles: &[X509Extension],
    ) -> PkiResult<()> {
        let rendered = OpensslConfTemplate::new(self.config, authorities, profiles).render()?;
        let target = self.config.openssl_conf_path();
        let staging = target.with_extension("conf.tmp");
        fs::write(&staging, rendered)?;
        fs::rename(&staging, &target)?;
        debug!(path = %target.display(), "signer config rendered");
        Ok(())
    }
}

/// A directory is ours to delete only if it carries the CA marker file.
pub fn is_managed_ca_dir(path: &Path) -> bool {
    path.join(CA_MARKER).is_file()
}

/// Even-length upper-case hex, the format the signer's serial file uses.
pub fn serial_hex(value: u64) -> String {
    let hex = format!("{:X}", value);
    if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex
    }
}

fn create_dir(path: &Path, mode: u32) -> PkiResult<()> {
    if path.is_dir() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(mode).create(path)?;
    Ok(())
}

fn write_if_missing(path: &Path, contents: &str) -> PkiResult<()> {
    if !path.exists() {
        fs::write(path, contents)?;
    }
    Ok(())
}
