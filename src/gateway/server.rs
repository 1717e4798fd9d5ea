//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use gateway_core::AccessPolicyTable;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::AuthPipeline;
use super::router::{AppState, RouterLimits, create_router};
use super::upstream::{HttpUpstream, Upstream};
use crate::config::{Config, RevocationBackend};
use crate::keys::KeyMaterial;
use crate::revocation::{Revocations, spawn_reaper};
use crate::token::TokenCodec;
use crate::{Error, Result};

/// Gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Build every component, failing fast on bad keys, routes or stores.
    ///
    /// Construction order: keys, codec, route table, revocation store,
    /// pipeline.
    pub async fn new(config: Config) -> Result<Self> {
        let upstream = Arc::new(HttpUpstream::from_config(&config.services)?);
        Self::with_upstream(config, upstream).await
    }

    /// Like [`Gateway::new`] with a caller-supplied upstream.
    pub async fn with_upstream(config: Config, upstream: Arc<dyn Upstream>) -> Result<Self> {
        let keys = Arc::new(KeyMaterial::from_config(&config.jwt)?);
        if keys.private_key().is_none() {
            return Err(Error::Key(
                "jwt.private_key is required to validate tokens".to_string(),
            ));
        }
        let codec = Arc::new(TokenCodec::new(keys, &config.jwt)?);

        let policy = Arc::new(AccessPolicyTable::build(
            &config.services.version,
            &config.services.suffix,
            &config.services.names,
            &config.authority,
        )?);
        for entry in policy.entries() {
            info!(
                pattern = %entry.pattern(),
                service = %entry.service_name(),
                roles = ?entry.required_roles(),
                "Route"
            );
        }

        let revocations = Revocations::connect(&config.revocation).await?;
        let pipeline = AuthPipeline::new(codec, revocations, policy);

        let admin_token = config.admin.resolve_bearer_token();
        let state = Arc::new(AppState {
            pipeline,
            upstream,
            admin_token,
        });

        Ok(Self { config, state })
    }

    /// Shared state, for embedding the router elsewhere.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Router with every layer applied.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        create_router(
            Arc::clone(&self.state),
            RouterLimits {
                request_timeout: self.config.server.request_timeout,
                max_body_size: self.config.server.max_body_size,
            },
        )
    }

    /// Run the gateway
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let reaper = if self.config.revocation.backend == RevocationBackend::Memory {
            Some(spawn_reaper(
                Arc::clone(self.state.pipeline.revocations().store()),
                self.config.revocation.reap_interval,
                shutdown_tx.subscribe(),
            ))
        } else {
            None
        };

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("JWE GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            services = self.config.services.names.len(),
            routes = self.state.pipeline.policy().len(),
            "Route table ready"
        );
        if self.state.admin_token.is_some() {
            info!("Token issuance enabled at POST /auth/token");
        } else {
            warn!("admin.bearer_token not set - POST /auth/token is disabled");
        }
        info!("============================================================");

        let shutdown_timeout = self.config.server.shutdown_timeout;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(reaper) = reaper {
            if tokio::time::timeout(shutdown_timeout, reaper).await.is_err() {
                warn!("Revocation reaper did not stop in time");
            }
        }
        info!("Gateway stopped");

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
