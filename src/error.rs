//! Controller-level error types.
//!
//! Cloud-side errors live in [`crate::cloud`] and host-maintenance errors in
//! [`crate::host`]; everything the HTTP surface or the resolver can report
//! goes through `ControllerError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Application configuration failed validation at startup
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A config layer referenced a template that is not in templates_dir
    #[error("template \"{0}\" does not exist")]
    TemplateNotFound(String),

    /// Heartbeat or file request for a node that is not registered
    #[error("unknown node \"{0}\"")]
    UnknownNode(String),

    /// A node name or file path that could escape its directory
    #[error("invalid filename \"{0}\"")]
    InvalidFilename(String),

    #[error("key generation failed: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}
