//! PKI Tree - Hierarchical Certificate Authority Lifecycle Engine
//!
//! Manages a tree of certificate authorities and the leaf certificates they
//! issue. Metadata lives in SQLite; keys, certificates, CRLs and chain files
//! live in a per-CA directory layout driven by the `openssl` command line
//! signer.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed)
//!   ├── Intermediate CA (signed by Root, may sign sub-CAs)
//!   │     ├── Edge CA (pathlen:0, signs leaves only)
//!   │     │     └── Server / client certificates
//!   │     └── Server / client certificates
//!   └── Server / client certificates
//!
//! Self-signed leaves live outside the tree in _SELF_SIGNED_CERTIFICATES/.
//! ```
//!
//! Every operation is a transition of the [`lifecycle::LifecycleEngine`]:
//!
//! - **create**: generate a key, self-sign or have the issuer sign, write CRL
//!   and chain file, optionally export DER / PKCS#12
//! - **update**: description and export flags only
//! - **renew**: revoke the current certificate at the issuer and re-issue
//! - **revoke**: revoke at the issuer; every descendant of a revoked CA is
//!   deactivated with it
//! - **delete**: revoke if still possible, purge all artifacts and metadata
//!
//! Validation, consistency and passphrase checks run before any side effect.
//! Signer effects and metadata writes share one database transaction, which
//! is rolled back when a step fails.
//!
//! # Quick Start
//!
//! ```no_run
//! use pki_tree::configs::AppConfig;
//! use pki_tree::lifecycle::{LifecycleEngine, Passphrases};
//! use pki_tree::models::{NewAuthority, Policy, Subject};
//! use secrecy::SecretString;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut engine = LifecycleEngine::open(AppConfig::with_pki_dir("PKI"))?;
//!     engine.reconcile("admin")?;
//!
//!     let root = engine.create_authority(
//!         NewAuthority {
//!             name: "Root_CA".to_string(),
//!             description: "Company root".to_string(),
//!             subject: Subject {
//!                 common_name: "Root CA".to_string(),
//!                 country: "DE".to_string(),
//!                 state: "Bavaria".to_string(),
//!                 locality: "Munich".to_string(),
//!                 organization: "Bozo Clown Inc.".to_string(),
//!                 organizational_unit: None,
//!                 email: None,
//!             },
//!             parent: None,
//!             key_length: 4096,
//!             valid_days: 3650,
//!             subcas_allowed: true,
//!             policy: Policy::Match,
//!             crl_distribution: Some("http://pki.example.com/root.crl".to_string()),
//!             extension: "v3_ca".to_string(),
//!             der_encoded: false,
//!         },
//!         &Passphrases::own(SecretString::new("root passphrase".to_string())),
//!         "admin",
//!     )?;
//!     println!("{} serial {:?}", root.name, root.serial);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`configs`]: TOML configuration and store paths
//! - [`error`]: the [`error::PkiError`] taxonomy
//! - [`models`]: CAs, certificates, subjects, changelog entries
//! - [`extensions`]: x509v3 extension profiles and their config sections
//! - [`altname`]: subjectAltName parsing
//! - [`passphrase`]: Argon2id hashing and the authorization gate
//! - [`store`]: SQLite persistence
//! - [`paths`]: artifact layout of the PKI store
//! - [`templates`]: the rendered signer configuration
//! - [`metadata`]: directory reconcile of the PKI store
//! - [`signer`]: adapter around the `openssl` binary
//! - [`chain`]: ancestor chain and descendant walks
//! - [`lifecycle`]: the transition engine
//! - [`bundle`]: artifact downloads and tar bundles
//!
//! # Security Considerations
//!
//! - Passphrases are held as [`secrecy::SecretString`] and only persisted as
//!   Argon2id hashes.
//! - The signer receives passphrases through randomly named environment
//!   variables of a cleared environment, never through its argument list.
//! - Private keys are written `0600`; CA `private/` directories are `0700`.
//! - Signer failures surface as an opaque [`error::PkiError::SignerExecution`];
//!   the signer's output is only logged.

pub mod altname;
pub mod bundle;
pub mod chain;
pub mod configs;
pub mod error;
pub mod extensions;
pub mod lifecycle;
pub mod metadata;
pub mod models;
pub mod passphrase;
pub mod paths;
pub mod signer;
pub mod store;
pub mod templates;

pub use error::{PkiError, PkiResult};
pub use lifecycle::{LifecycleEngine, Passphrases};
