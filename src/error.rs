//! Error types for the gateway

use std::io;

use thiserror::Error;

use crate::revocation::RevocationError;
use crate::token::TokenError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key material could not be loaded or generated
    #[error("Key error: {0}")]
    Key(String),

    /// Route table construction failed
    #[error("Policy error: {0}")]
    Policy(#[from] gateway_core::PolicyError),

    /// Token codec error
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Revocation store error
    #[error("Revocation store error: {0}")]
    Revocation(#[from] RevocationError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
