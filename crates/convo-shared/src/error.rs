use thiserror::Error;

/// Failures verifying a magic link.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MagicError {
    #[error("Malformed magic link: {0}")]
    Malformed(String),

    #[error("Invalid magic link signature")]
    InvalidSignature,

    #[error("Magic link has expired")]
    Expired,
}

/// Failures decoding an external ID.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid external id: {0}")]
    Invalid(String),

    #[error("Expected a {expected} id, got {actual}")]
    WrongKind { expected: String, actual: String },
}
