//! Forwarding authorized requests to backend services.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use gateway_core::PolicyEntry;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::rejection::ApiResponse;
use crate::config::ServicesConfig;
use crate::{Error, Result};

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Upstream failures, reported to the client as 502/504.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The route names a service with no configured address.
    #[error("no upstream configured for service {0}")]
    UnknownService(String),

    /// Connect, send or receive failed.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// No response within the upstream timeout.
    #[error("upstream timed out")]
    Timeout,
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        match self {
            Self::Timeout => {
                ApiResponse::error(StatusCode::GATEWAY_TIMEOUT, 50_400, "Upstream service timed out")
            }
            Self::UnknownService(_) | Self::Transport(_) => {
                ApiResponse::error(StatusCode::BAD_GATEWAY, 50_200, "Upstream service unavailable")
            }
        }
    }
}

/// Whatever sits behind the gateway.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Deliver an authorized request to the service owning `route`.
    async fn forward(&self, route: &PolicyEntry, request: Request<Body>) -> std::result::Result<Response, UpstreamError>;
}

/// Reverse proxy over HTTP to one base URL per service.
pub struct HttpUpstream {
    client: Client,
    bases: HashMap<String, Url>,
}

impl HttpUpstream {
    /// Resolve every configured service to its base URL.
    pub fn from_config(config: &ServicesConfig) -> Result<Self> {
        let mut bases = HashMap::with_capacity(config.names.len());
        for name in &config.names {
            let raw = config.upstream_for(name);
            let url = Url::parse(&raw)
                .map_err(|e| Error::Config(format!("Invalid upstream URL for {name}: {raw} ({e})")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "Upstream URL for {name} must be http or https: {raw}"
                )));
            }
            info!(service = %name, upstream = %url, "Registered upstream");
            bases.insert(name.trim().to_string(), url);
        }

        let client = Client::builder()
            .timeout(config.upstream_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client, bases })
    }

    /// Target URL for `path_and_query` on `base`.
    fn target(base: &Url, path_and_query: &str) -> String {
        format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query)
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, route: &PolicyEntry, request: Request<Body>) -> std::result::Result<Response, UpstreamError> {
        let base = self
            .bases
            .get(route.service_name())
            .ok_or_else(|| UpstreamError::UnknownService(route.service_name().to_string()))?;

        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
        let url = Self::target(base, &path_and_query);

        // The body limit layer has already bounded the size.
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        debug!(method = %parts.method, url = %url, "Forwarding request");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}
