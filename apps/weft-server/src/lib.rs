#![forbid(unsafe_code)]

mod server;

pub use server::{
    build_router, build_router_with_state, init_tracing, issue_access_token, AppConfig, AppState,
    ServiceError, DEFAULT_MAX_GATEWAY_EVENT_BYTES,
};
