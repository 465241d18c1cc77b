// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! neorest: a bidirectional request/response + pub-sub messaging runtime
//! over a connection-oriented transport.

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod outcome;
pub mod path;
pub mod router;
pub mod secret;
pub mod server;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::NeorestConfig;
use crate::router::Router;

/// Run the neorest server until shutdown.
pub async fn run(config: NeorestConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let router = Router::new(Arc::new(config));

    tracing::info!(%addr, "neorest listening");
    let app = server::build_router(router);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
