#![forbid(unsafe_code)]

use std::net::SocketAddr;

use tokio::net::TcpListener;
use weft_server::{build_router, init_tracing, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let database_url = std::env::var("WEFT_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("WEFT_DATABASE_URL is required for runtime"))?;
    let app_config = AppConfig {
        token_key_b64: std::env::var("WEFT_TOKEN_KEY_B64").ok(),
        database_url: Some(database_url),
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("WEFT_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid WEFT_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "weft-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
