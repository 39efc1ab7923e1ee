//! redius-store server entry point.
//!
//! Usage: `redius-store [ADDR]`. Set `REDIUS_PASSWORD` to require `AUTH`.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use redius_store::{serve, Server, ServerConfig, DEFAULT_ADDR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let password = std::env::var("REDIUS_PASSWORD")
        .ok()
        .filter(|password| !password.is_empty());

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, auth = password.is_some(), "redius-store listening");

    let server = Arc::new(Server::new(ServerConfig { password }));
    serve(listener, server, tokio::signal::ctrl_c())
        .await
        .context("server terminated")?;
    Ok(())
}
