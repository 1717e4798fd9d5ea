//! JWE Gateway Library
//!
//! Front-door authorization for a fleet of backend services.
//!
//! # Features
//!
//! - **Confidential tokens**: claim sets encrypted as compact JWE
//!   (RSA-OAEP-512 key wrap, A256GCM content encryption)
//! - **Revocation**: blocklist checked on every request, in memory or Redis,
//!   failing closed when unreachable
//! - **Role tiers**: `/{version}/{admin|seller|member}/{service}/**` routes
//!   guarded by configured role sets
//! - **Token lifecycle**: issue, refresh and logout endpoints
//! - **Production Ready**: structured audit log, request ids, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod revocation;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
