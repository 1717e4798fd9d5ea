//! Gateway implementation

pub mod auth;
pub mod handlers;
pub mod rejection;
pub mod router;
pub mod server;
pub mod upstream;

pub use auth::{AuthPipeline, Authorized, USER_ROLE_HEADER};
pub use rejection::{ApiResponse, Rejection};
pub use router::{AppState, RouterLimits, create_router};
pub use server::Gateway;
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
