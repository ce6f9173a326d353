//! Passphrase policy and the authorization gate.
//!
//! Passphrases never touch the store in clear text: only Argon2id PHC strings
//! are persisted, and verification happens before a transition has any side
//! effect.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::{PkiError, PkiResult};

/// Argon2id PHC string for `passphrase`.
pub fn hash_passphrase(passphrase: &SecretString) -> PkiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(passphrase.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PkiError::consistency(format!("passphrase hashing failed: {}", e)))
}

/// Check `passphrase` against the stored hash of `entity`'s key.
///
/// A missing passphrase, a mismatch and a malformed stored hash all surface as
/// an authorization error.
pub fn verify_passphrase(
    passphrase: Option<&SecretString>,
    stored_hash: &str,
    entity: &str,
) -> PkiResult<()> {
    let denied = || PkiError::Authorization {
        entity: entity.to_string(),
    };
    let passphrase = passphrase.ok_or_else(denied)?;
    let parsed = PasswordHash::new(stored_hash).map_err(|e| {
        warn!(entity, error = %e, "stored passphrase hash is malformed");
        denied()
    })?;
    Argon2::default()
        .verify_password(passphrase.expose_secret().as_bytes(), &parsed)
        .map_err(|_| denied())
}

/// Enforce the minimum length on a new passphrase.
///
/// `required = false` accepts a missing passphrase (unencrypted leaf keys).
pub fn check_policy(
    field: &str,
    passphrase: Option<&SecretString>,
    required: bool,
    min_length: usize,
) -> PkiResult<()> {
    match passphrase {
        None if required => Err(PkiError::validation(field, "a passphrase is required")),
        None => Ok(()),
        Some(p) if p.expose_secret().chars().count() < min_length => Err(PkiError::validation(
            field,
            format!("must be at least {} characters long", min_length),
        )),
        Some(_) => Ok(()),
    }
}
