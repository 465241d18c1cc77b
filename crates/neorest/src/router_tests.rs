use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use super::*;
use crate::connection::RouteResponse;
use crate::message::{Envelope, MessageBody};
use crate::transport::{Transport, TransportError, TransportEvent, TransportKind};

struct FakeTransport {
    connected: AtomicBool,
    events: StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: StdMutex<Vec<Envelope>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { connected: AtomicBool::new(false), events: StdMutex::new(None), sent: StdMutex::new(Vec::new()) })
    }

    fn push_event(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn sent_snapshot(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.connected.store(true, Ordering::Release);
            self.push_event(TransportEvent::Open);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Release);
            self.push_event(TransportEvent::Close);
        })
    }

    fn send(&self, envelope: &Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let envelope = envelope.clone();
        Box::pin(async move {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        rx
    }
}

async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

fn router() -> Arc<Router> {
    Router::new(Arc::new(NeorestConfig::default()))
}

#[tokio::test]
async fn happy_path_route_dispatch() {
    let router = router();
    router
        .on_post(
            "/x/:id",
            Arc::new(|ctx: RequestContext| {
                Box::pin(async move {
                    let id = ctx.params.get("id").cloned().unwrap_or_default();
                    HandlerResult { response: Some(serde_json::json!({"ok": id})), error: None }
                })
            }),
        )
        .await;

    let transport = FakeTransport::new();
    let conn = router.add_socket(transport.clone() as Arc<dyn Transport>, None).await;
    conn.connect().await.unwrap();
    settle().await;

    let got = Arc::new(StdMutex::new(None));
    let got_clone = Arc::clone(&got);
    let cb: crate::connection::ResponseCallback = Arc::new(move |resp: RouteResponse| {
        *got_clone.lock().unwrap() = Some(resp);
    });
    let id = conn.post(MessageBody::Route { route: "/x/7".to_owned(), verb: Verb::Post, data: serde_json::json!({}), headers: None }, Some(cb)).await;

    transport.push_event(TransportEvent::Message(Envelope::forget(MessageBody::Res {
        target: id,
        status: 200,
        data: serde_json::json!({"ok": "7"}),
    })));
    settle().await;

    let resp = got.lock().unwrap().take().expect("callback invoked");
    assert_eq!(resp.data, serde_json::json!({"ok": "7"}));
}

#[tokio::test]
async fn verb_mismatch_reports_exact_wording() {
    let router = router();
    router
        .on_get("/a", Arc::new(|_ctx| Box::pin(async move { HandlerResult::default() })))
        .await;

    let transport = FakeTransport::new();
    let conn = router.add_socket(transport.clone() as Arc<dyn Transport>, None).await;
    conn.connect().await.unwrap();
    settle().await;

    transport.push_event(TransportEvent::Message(Envelope::new(
        9,
        MessageBody::Route { route: "/a".to_owned(), verb: Verb::Post, data: Payload::Null, headers: None },
    )));
    settle().await;

    let res = transport
        .sent_snapshot()
        .into_iter()
        .find_map(|e| match e.msg {
            MessageBody::Res { target, status, data } if target == 9 => Some((status, data)),
            _ => None,
        })
        .expect("a res envelope targeting id 9 was sent");
    assert_eq!(res.0, 400);
    assert_eq!(res.1, serde_json::json!("Route \"/a\" does not support verb \"POST\""));
}

#[tokio::test]
async fn unmatched_route_reports_404_not_400() {
    let router = router();
    router
        .on_get("/a", Arc::new(|_ctx| Box::pin(async move { HandlerResult::default() })))
        .await;

    let transport = FakeTransport::new();
    let conn = router.add_socket(transport.clone() as Arc<dyn Transport>, None).await;
    conn.connect().await.unwrap();
    settle().await;

    transport.push_event(TransportEvent::Message(Envelope::new(
        11,
        MessageBody::Route { route: "/does-not-exist".to_owned(), verb: Verb::Get, data: Payload::Null, headers: None },
    )));
    settle().await;

    let res = transport
        .sent_snapshot()
        .into_iter()
        .find_map(|e| match e.msg {
            MessageBody::Res { target, status, data } if target == 11 => Some((status, data)),
            _ => None,
        })
        .expect("a res envelope targeting id 11 was sent");
    assert_eq!(res.0, 404);
    assert_eq!(res.1, serde_json::json!("Route \"/does-not-exist\" not found"));
}

#[tokio::test]
async fn first_registered_route_wins_on_overlap() {
    let router = router();
    router
        .on_get(
            "/x/known",
            Arc::new(|_ctx| Box::pin(async move { HandlerResult { response: Some(serde_json::json!("specific")), error: None } })),
        )
        .await;
    router
        .on_get(
            "/x/:id",
            Arc::new(|_ctx| Box::pin(async move { HandlerResult { response: Some(serde_json::json!("generic")), error: None } })),
        )
        .await;

    let transport = FakeTransport::new();
    let conn = router.add_socket(transport.clone() as Arc<dyn Transport>, None).await;
    conn.connect().await.unwrap();
    settle().await;

    transport.push_event(TransportEvent::Message(Envelope::new(
        12,
        MessageBody::Route { route: "/x/known".to_owned(), verb: Verb::Get, data: Payload::Null, headers: None },
    )));
    settle().await;

    let res = transport
        .sent_snapshot()
        .into_iter()
        .find_map(|e| match e.msg {
            MessageBody::Res { target, status, data } if target == 12 => Some((status, data)),
            _ => None,
        })
        .expect("a res envelope targeting id 12 was sent");
    assert_eq!(res.0, 200);
    assert_eq!(res.1, serde_json::json!("specific"), "the first-registered layer must win over the later, more general one");
}

#[tokio::test]
async fn broadcast_filters_by_positional_params() {
    let router = router();
    router
        .on_validate_broadcast("/t/:id", Arc::new(|_secret, _params| Box::pin(async move { true })))
        .await;

    let transport_a = FakeTransport::new();
    let conn_a = router.add_socket(transport_a.clone() as Arc<dyn Transport>, None).await;
    conn_a.connect().await.unwrap();
    settle().await;
    transport_a.push_event(TransportEvent::Message(Envelope::new(
        1,
        MessageBody::Set { key: "secret".to_owned(), value: Payload::String("secret-a".to_owned()) },
    )));
    settle().await;
    transport_a.push_event(TransportEvent::Message(Envelope::new(2, MessageBody::On { route: "/t/1".to_owned() })));
    settle().await;

    let transport_b = FakeTransport::new();
    let conn_b = router.add_socket(transport_b.clone() as Arc<dyn Transport>, None).await;
    conn_b.connect().await.unwrap();
    settle().await;
    transport_b.push_event(TransportEvent::Message(Envelope::new(
        1,
        MessageBody::Set { key: "secret".to_owned(), value: Payload::String("secret-b".to_owned()) },
    )));
    settle().await;
    transport_b.push_event(TransportEvent::Message(Envelope::new(2, MessageBody::On { route: "/t/2".to_owned() })));
    settle().await;

    router.broadcast_post("/t/1", serde_json::json!({"v": 1}), None).await;
    settle().await;

    let a_got_broadcast = transport_a.sent_snapshot().into_iter().any(|e| {
        matches!(&e.msg, MessageBody::Route { route, .. } if route == "/t/1")
    });
    let b_got_broadcast = transport_b.sent_snapshot().into_iter().any(|e| {
        matches!(&e.msg, MessageBody::Route { route, .. } if route == "/t/1")
    });
    assert!(a_got_broadcast, "subscriber to /t/1 must receive the broadcast");
    assert!(!b_got_broadcast, "subscriber to /t/2 must not receive a /t/1 broadcast");
}

#[tokio::test]
async fn disconnect_purges_listener_from_outbound_layer() {
    let router = router();
    router
        .on_validate_broadcast("/t/:id", Arc::new(|_secret, _params| Box::pin(async move { true })))
        .await;

    let transport = FakeTransport::new();
    let conn = router.add_socket(transport.clone() as Arc<dyn Transport>, None).await;
    conn.connect().await.unwrap();
    settle().await;
    transport.push_event(TransportEvent::Message(Envelope::new(
        1,
        MessageBody::Set { key: "secret".to_owned(), value: Payload::String("s1".to_owned()) },
    )));
    settle().await;
    transport.push_event(TransportEvent::Message(Envelope::new(2, MessageBody::On { route: "/t/1".to_owned() })));
    settle().await;

    assert_eq!(router.connection_count().await, 1);

    transport.push_event(TransportEvent::Close);
    settle().await;
    tokio::time::sleep(router.config.close_grace() + std::time::Duration::from_millis(20)).await;
    settle().await;

    assert_eq!(router.connection_count().await, 0);

    let listener_count = {
        let layers = router.outbound.lock().await;
        layers.first().map(|l| l.listeners.len()).unwrap_or(0)
    };
    assert_eq!(listener_count, 0, "Open Question 3 fix: listener must be purged on disconnect");
}

#[tokio::test]
async fn reconnect_secret_rebinds_existing_connection() {
    let router = router();
    let transport_1 = FakeTransport::new();
    let conn = router.add_socket(transport_1.clone() as Arc<dyn Transport>, None).await;
    conn.connect().await.unwrap();
    settle().await;
    transport_1.push_event(TransportEvent::Message(Envelope::new(
        1,
        MessageBody::Set { key: "secret".to_owned(), value: Payload::String("stable-secret".to_owned()) },
    )));
    settle().await;
    assert_eq!(router.connection_count().await, 1);

    let transport_2 = FakeTransport::new();
    let rebound = router.add_socket(transport_2.clone() as Arc<dyn Transport>, Some("stable-secret")).await;
    settle().await;

    assert!(Arc::ptr_eq(&conn, &rebound));
    assert_eq!(router.connection_count().await, 1);
}
