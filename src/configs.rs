use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the directory holding parentless (self-signed) leaf certificates.
pub const SELF_SIGNED_STORE: &str = "_SELF_SIGNED_CERTIFICATES";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Base directory of the PKI store. Every CA owns `<pki_dir>/<name>/`.
    #[serde(default = "default_pki_dir")]
    pub pki_dir: PathBuf,
    #[serde(default = "default_openssl_bin")]
    pub openssl_bin: PathBuf,
    /// Generated signer configuration. Defaults to `<pki_dir>/openssl.conf`.
    #[serde(default)]
    pub openssl_conf: Option<PathBuf>,
    /// Defaults to `<pki_dir>/pki.sqlite3`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Serial forced onto self-signed roots. `None` or 0 means a random serial.
    #[serde(default = "default_self_signed_serial")]
    pub self_signed_serial: Option<u64>,
    #[serde(default = "default_min_passphrase_length")]
    pub min_passphrase_length: usize,
    #[serde(default = "default_crl_days")]
    pub crl_days: u32,
    #[serde(default = "default_key_length")]
    pub default_key_length: u32,
    #[serde(default = "default_country")]
    pub default_country: String,
}

fn default_pki_dir() -> PathBuf {
    PathBuf::from("PKI")
}

fn default_openssl_bin() -> PathBuf {
    PathBuf::from("/usr/bin/openssl")
}

fn default_self_signed_serial() -> Option<u64> {
    Some(7)
}

fn default_min_passphrase_length() -> usize {
    8
}

fn default_crl_days() -> u32 {
    1
}

fn default_key_length() -> u32 {
    2048
}

fn default_country() -> String {
    "DE".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pki_dir: default_pki_dir(),
            openssl_bin: default_openssl_bin(),
            openssl_conf: None,
            database_path: None,
            self_signed_serial: default_self_signed_serial(),
            min_passphrase_length: default_min_passphrase_length(),
            crl_days: default_crl_days(),
            default_key_length: default_key_length(),
            default_country: default_country(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (pki.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("pki.toml")
    }

    /// Default configuration rooted at `pki_dir`.
    pub fn with_pki_dir(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
            ..Self::default()
        }
    }

    pub fn openssl_conf_path(&self) -> PathBuf {
        self.openssl_conf
            .clone()
            .unwrap_or_else(|| self.pki_dir.join("openssl.conf"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.pki_dir.join("pki.sqlite3"))
    }

    pub fn ca_dir(&self, ca_name: &str) -> PathBuf {
        self.pki_dir.join(ca_name)
    }

    pub fn self_signed_dir(&self) -> PathBuf {
        self.pki_dir.join(SELF_SIGNED_STORE)
    }

    /// The configured initial serial for self-signed roots, if any.
    pub fn forced_root_serial(&self) -> Option<u64> {
        self.self_signed_serial.filter(|s| *s > 0)
    }

    pub fn pki_dir(&self) -> &Path {
        &self.pki_dir
    }
}
