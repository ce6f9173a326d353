//! Error taxonomy for lifecycle transitions.
//!
//! Validation, authorization and consistency failures are raised before any
//! side effect. Signer failures abort the running transition; their message is
//! opaque on purpose (the command verb only) and the full output goes to the log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("passphrase is wrong for {entity}")]
    Authorization { entity: String },

    #[error("signer command '{command}' failed")]
    SignerExecution { command: String },

    #[error("inconsistent state: {0}")]
    Consistency(String),

    #[error("{entity} '{name}' not found")]
    NotFound { entity: String, name: String },

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to render signer configuration: {0}")]
    Template(#[from] askama::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("openssl library error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl PkiError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PkiError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        PkiError::Consistency(message.into())
    }

    pub fn not_found(entity: impl Into<String>, name: impl Into<String>) -> Self {
        PkiError::NotFound {
            entity: entity.into(),
            name: name.into(),
        }
    }
}

pub type PkiResult<T> = Result<T, PkiError>;
