//! Error types for taxonomy resolution
//!
//! This module defines the error taxonomy for the taxolink library. The three
//! caller-facing classes (`NotFound`, `Auth`, `Remote`) are tagged variants so
//! bulk callers can pattern-match on the class instead of string-matching
//! messages: `NotFound` is a skip, `Remote` is a pause-and-continue, `Auth`
//! needs operator attention.

use thiserror::Error;

/// Why an authentication attempt failed.
///
/// `InvalidCredentials` means the stored client id/secret were rejected (or
/// are missing) and retrying cannot help; `Transient` covers network trouble
/// or a server-side failure during the token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidCredentials,
    Transient,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::InvalidCredentials => write!(f, "invalid credentials"),
            AuthFailure::Transient => write!(f, "transient failure"),
        }
    }
}

/// Main error type for taxonomy operations
#[derive(Error, Debug)]
pub enum TaxonomyError {
    /// Credential or token-exchange failure; `kind` distinguishes bad
    /// credentials from a transient exchange failure
    #[error("Authentication failed ({kind}): {message}")]
    Auth { kind: AuthFailure, message: String },

    /// The code has no mapping in the remote scheme (confirmed, possibly via
    /// the negative cache)
    #[error("No entry for code '{code}' in the classification scheme")]
    NotFound { code: String },

    /// Remote service failure after the retry policy gave up; `context` names
    /// the code or resource the call was about
    #[error("Remote service error for {context}: {message}")]
    Remote { context: String, message: String },

    /// Durable store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for taxonomy operations
pub type Result<T> = std::result::Result<T, TaxonomyError>;

impl TaxonomyError {
    /// Auth failure from rejected or missing credentials.
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        TaxonomyError::Auth {
            kind: AuthFailure::InvalidCredentials,
            message: message.into(),
        }
    }

    /// Auth failure from a transient token-exchange problem.
    pub fn auth_transient(message: impl Into<String>) -> Self {
        TaxonomyError::Auth {
            kind: AuthFailure::Transient,
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>) -> Self {
        TaxonomyError::NotFound { code: code.into() }
    }

    /// Remote failure; `context` names the code or resourceId involved.
    pub fn remote(context: impl Into<String>, message: impl Into<String>) -> Self {
        TaxonomyError::Remote {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TaxonomyError::NotFound { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TaxonomyError::Auth { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, TaxonomyError::Remote { .. })
    }
}
