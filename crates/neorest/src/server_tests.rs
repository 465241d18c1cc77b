use std::sync::Arc;

use axum_test::TestServer;

use super::*;
use crate::config::NeorestConfig;
use crate::message::{Envelope, MessageBody, Verb};

fn test_server() -> TestServer {
    let router = Router::new(Arc::new(NeorestConfig::default()));
    TestServer::new(build_router(router)).expect("failed to create test server")
}

async fn poll_session(server: &TestServer) -> String {
    let resp = server.post("/poll/connect").json(&serde_json::json!({})).await;
    resp.assert_status_ok();
    resp.json::<serde_json::Value>()["session"].as_str().expect("session field").to_owned()
}

#[tokio::test]
async fn healthz_reports_zero_connections_when_idle() {
    let server = test_server();
    let resp = server.get("/healthz").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn poll_send_with_unknown_session_returns_404() {
    let server = test_server();
    let resp = server
        .post("/poll/send?session=does-not-exist")
        .json(&Envelope::forget(MessageBody::Ping {}))
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn poll_send_with_malformed_body_returns_400_not_panic() {
    let server = test_server();
    let session = poll_session(&server).await;

    let resp = server
        .post(&format!("/poll/send?session={session}"))
        .json(&serde_json::json!({"not": "an envelope"}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn poll_recv_with_no_outbound_envelope_returns_204() {
    let server = test_server();
    let session = poll_session(&server).await;

    let resp = server.get(&format!("/poll/recv?session={session}")).await;
    resp.assert_status(StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn poll_round_trip_ping_pong() {
    let server = test_server();
    let session = poll_session(&server).await;

    let ping = Envelope::new(3, MessageBody::Ping {});
    server.post(&format!("/poll/send?session={session}")).json(&ping).await.assert_status(StatusCode::NO_CONTENT);

    let resp = server.get(&format!("/poll/recv?session={session}")).await;
    resp.assert_status_ok();
    let envelope: Envelope = resp.json();
    assert_eq!(envelope.id, 3);
    match envelope.msg {
        MessageBody::Res { target, status, data } => {
            assert_eq!(target, 3);
            assert_eq!(status, 200);
            assert_eq!(data, serde_json::json!("pong"));
        }
        other => panic!("expected a res envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn poll_route_happy_path_through_registered_handler() {
    let router = Router::new(Arc::new(NeorestConfig::default()));
    router
        .on_get(
            "/x/:id",
            Arc::new(|ctx: crate::router::RequestContext| {
                Box::pin(async move {
                    let id = ctx.params.get("id").cloned().unwrap_or_default();
                    crate::router::HandlerResult { response: Some(serde_json::json!({"ok": id})), error: None }
                })
            }),
        )
        .await;
    let server = TestServer::new(build_router(router)).expect("failed to create test server");
    let session = poll_session(&server).await;

    let req = Envelope::new(
        1,
        MessageBody::Route { route: "/x/7".to_owned(), verb: Verb::Get, data: serde_json::json!({}), headers: None },
    );
    server.post(&format!("/poll/send?session={session}")).json(&req).await.assert_status(StatusCode::NO_CONTENT);

    let resp = server.get(&format!("/poll/recv?session={session}")).await;
    resp.assert_status_ok();
    let envelope: Envelope = resp.json();
    match envelope.msg {
        MessageBody::Res { target, status, data } => {
            assert_eq!(target, 1);
            assert_eq!(status, 200);
            assert_eq!(data, serde_json::json!({"ok": "7"}));
        }
        other => panic!("expected a res envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn poll_disconnect_of_unknown_session_returns_404() {
    let server = test_server();
    let resp = server.post("/poll/disconnect?session=nope").await;
    resp.assert_status(StatusCode::NOT_FOUND);
}
