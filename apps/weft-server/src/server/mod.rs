pub(crate) mod auth;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod domain;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod presence;
pub(crate) mod realtime;
pub(crate) mod router;
#[cfg(test)]
mod tests;
pub(crate) mod types;

pub use self::core::{AppConfig, AppState, DEFAULT_MAX_GATEWAY_EVENT_BYTES};
pub use auth::issue_access_token;
pub use errors::{init_tracing, ServiceError};
pub use router::{build_router, build_router_with_state};
