// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The HTTP/axum harness exposing the router + connection engine over a
//! real socket: a WebSocket upgrade route, the HTTP long-poll routes, and
//! a health check. This module owns no protocol state — it is adapter
//! code translating axum extractors into `Router`/`Connection` calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::error::NeorestError;
use crate::message::Envelope;
use crate::router::Router;
use crate::transport::poll::ServerPollTransport;
use crate::transport::ws::ServerWsTransport;
use crate::transport::Transport;

/// How long `/poll/recv` waits for an outbound envelope before answering
/// `204 No Content`, matching "each successful response yields at most one
/// envelope" without blocking indefinitely.
const POLL_RECV_WAIT: Duration = Duration::from_millis(900);
const POLL_RECV_STEP: Duration = Duration::from_millis(20);

struct ServerState {
    router: Arc<Router>,
    /// Poll-transport sessions keyed by a server-issued session token —
    /// distinct from the connection secret, since a poll session exists
    /// only for the lifetime of the long-poll loop.
    poll_sessions: Mutex<HashMap<String, Arc<ServerPollTransport>>>,
}

pub fn build_router(router: Arc<Router>) -> axum::Router {
    let state = Arc::new(ServerState { router, poll_sessions: Mutex::new(HashMap::new()) });
    axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .route("/poll/connect", post(poll_connect))
        .route("/poll/disconnect", post(poll_disconnect))
        .route("/poll/send", post(poll_send))
        .route("/poll/recv", get(poll_recv))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

async fn healthz(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse { status: "ok", connections: state.router.connection_count().await })
}

#[derive(Debug, Deserialize, Default)]
struct WsQuery {
    connsecret: Option<String>,
}

/// `GET /ws` — upgrade to a duplex socket. `connsecret` resumes identity
/// per §6; falls through to `Router::add_socket` either way.
async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| async move {
        let transport = ServerWsTransport::spawn(socket);
        let conn = state.router.add_socket(transport as Arc<dyn Transport>, query.connsecret.as_deref()).await;
        if let Err(e) = conn.connect().await {
            tracing::warn!(err = %e, "failed to mark ws connection open");
        }
    })
}

#[derive(Debug, Deserialize, Default)]
struct PollConnectRequest {
    #[serde(default)]
    connsecret: Option<String>,
}

#[derive(Debug, Serialize)]
struct PollConnectResponse {
    session: String,
}

/// `POST /poll/connect` — opens the server-side mailbox standing in for
/// the poll client's absent persistent socket and hands back a session
/// token for subsequent `/poll/send`, `/poll/recv`, `/poll/disconnect`.
async fn poll_connect(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<PollConnectRequest>,
) -> impl IntoResponse {
    let mailbox = ServerPollTransport::new();
    let conn = state.router.add_socket(Arc::clone(&mailbox) as Arc<dyn Transport>, req.connsecret.as_deref()).await;
    if let Err(e) = conn.connect().await {
        return NeorestError::Internal.to_http_response(format!("failed to open poll transport: {e}")).into_response();
    }
    let session = crate::secret::generate();
    state.poll_sessions.lock().await.insert(session.clone(), mailbox);
    Json(PollConnectResponse { session }).into_response()
}

#[derive(Debug, Deserialize)]
struct PollSessionQuery {
    session: String,
}

/// `POST /poll/disconnect` — closes the mailbox; the connection engine's
/// server-side grace timer then handles `onClose` as usual.
async fn poll_disconnect(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<PollSessionQuery>,
) -> impl IntoResponse {
    match state.poll_sessions.lock().await.remove(&q.session) {
        Some(mailbox) => {
            mailbox.mark_closed();
            StatusCode::NO_CONTENT.into_response()
        }
        None => NeorestError::UnknownConnection.to_http_response("unknown poll session").into_response(),
    }
}

/// `POST /poll/send` — the poll variant's single-envelope send. A
/// malformed body is rejected by the `Json` extractor before this handler
/// runs, yielding 400 rather than a panic.
async fn poll_send(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<PollSessionQuery>,
    Json(envelope): Json<Envelope>,
) -> impl IntoResponse {
    let mailbox = state.poll_sessions.lock().await.get(&q.session).cloned();
    match mailbox {
        Some(mailbox) => {
            mailbox.deliver_inbound(envelope);
            StatusCode::NO_CONTENT.into_response()
        }
        None => NeorestError::UnknownConnection.to_http_response("unknown poll session").into_response(),
    }
}

/// `GET /poll/recv` — the poll variant's single-envelope receive. Waits up
/// to `POLL_RECV_WAIT` for an outbound envelope, then answers `204`.
async fn poll_recv(State(state): State<Arc<ServerState>>, Query(q): Query<PollSessionQuery>) -> impl IntoResponse {
    let mailbox = state.poll_sessions.lock().await.get(&q.session).cloned();
    let Some(mailbox) = mailbox else {
        return NeorestError::UnknownConnection.to_http_response("unknown poll session").into_response();
    };

    let waited = tokio::time::timeout(POLL_RECV_WAIT, async {
        loop {
            if let Some(envelope) = mailbox.take_outbound().await {
                return envelope;
            }
            tokio::time::sleep(POLL_RECV_STEP).await;
        }
    })
    .await;

    match waited {
        Ok(envelope) => Json(envelope).into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
