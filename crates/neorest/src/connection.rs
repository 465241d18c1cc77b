// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-connection protocol state machine: id allocation, retry,
//! dedup, ping/pong, reconnect buffer. This is the engine both the client
//! and server sides of the runtime run; `is_client` only changes a handful
//! of behaviors (secret generation/handshake, grace-close timing).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::message::{Envelope, MessageBody, MsgId, Payload, Verb, FORGET};
use crate::outcome::Tracked;
use crate::transport::{BoxFuture, Transport, TransportError, TransportEvent, TransportKind};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local log-correlation handle. Never transmitted on the wire and
/// never part of protocol identity — the connection secret is that.
pub type ConnectionId = u64;

/// Result of a completed route call, delivered to a registered callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteResponse {
    pub data: Payload,
    pub error: Option<String>,
}

/// What a route handler produced, translated by the router from its
/// `RequestContext` into this shape before handing it back to the engine.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// Handler didn't set a response — reply `{status:200, data:"OK"}`.
    Ok,
    /// Handler set `ctx.response` — reply `{status:200, data}`.
    Data(Payload),
    /// Handler set `ctx.error` — reply `{status:400, data:error}`.
    Error(String),
    /// No inbound layer matched the route at all — reply `{status:404, data:error}`.
    NotFound(String),
}

#[derive(Debug, Clone)]
struct CachedResponse {
    status: u16,
    data: Payload,
}

/// A callback invoked when a route's terminal response arrives. Plain `Fn`
/// rather than a one-shot channel because the rate limiter's advisory 429
/// notice and the eventual real response both invoke the same registered
/// callback (see `send_to_route`).
pub type ResponseCallback = Arc<dyn Fn(RouteResponse) + Send + Sync>;

/// `(id, route, verb, data, headers, sender)`. `sender` is the `Connection`
/// that originated the route message — spec.md §3's `RequestContext.sender`.
pub type OnRouteMessage = Arc<
    dyn Fn(
            MsgId,
            String,
            Verb,
            Payload,
            HashMap<String, String>,
            Arc<Connection>,
        ) -> BoxFuture<'static, Result<RouteOutcome, String>>
        + Send
        + Sync,
>;

/// Event hooks a `Connection` fires into its owner (typically a `Router`).
/// Plain values passed at construction time rather than a back-pointer to
/// the router, so the router and connection don't hold a reference cycle.
#[derive(Default, Clone)]
pub struct ConnectionHooks {
    pub on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_data_set: Option<Arc<dyn Fn(String, Payload) + Send + Sync>>,
    pub on_route_message: Option<OnRouteMessage>,
    pub on_subscribe_to_route: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_unsubscribe_from_route: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_client_connect: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct SentEntry {
    envelope: Envelope,
    sent_at: Instant,
    sent_amount: u32,
}

struct Inner {
    next_msg_id: MsgId,
    messages_to_ack: HashMap<MsgId, SentEntry>,
    received_messages: HashMap<MsgId, Tracked<CachedResponse>>,
    messages_to_send_after_reconnect: VecDeque<Envelope>,
    callbacks: HashMap<MsgId, ResponseCallback>,
    messages_sent_in_a_second: u32,
    header: HashMap<String, Payload>,
}

pub struct Connection {
    pub is_client: bool,
    id: ConnectionId,
    config: Arc<crate::config::NeorestConfig>,
    state: Mutex<Inner>,
    transport: Mutex<Arc<dyn Transport>>,
    hooks: ConnectionHooks,
    cancel: CancellationToken,
    closed: AtomicBool,
    closing_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        is_client: bool,
        config: Arc<crate::config::NeorestConfig>,
        transport: Arc<dyn Transport>,
        hooks: ConnectionHooks,
    ) -> Arc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let mut header = HashMap::new();
        if is_client {
            header.insert("secret".to_owned(), Payload::String(crate::secret::generate()));
        }

        let conn = Arc::new(Connection {
            is_client,
            id,
            config,
            state: Mutex::new(Inner {
                next_msg_id: 0,
                messages_to_ack: HashMap::new(),
                received_messages: HashMap::new(),
                messages_to_send_after_reconnect: VecDeque::new(),
                callbacks: HashMap::new(),
                messages_sent_in_a_second: 0,
                header,
            }),
            transport: Mutex::new(transport),
            hooks,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(true),
            closing_timer: Mutex::new(None),
        });

        conn.wire_current_transport();
        conn.spawn_retry_timer();
        conn.spawn_ping_loop();
        conn.spawn_rate_limit_reset();
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    // -- public contract ----------------------------------------------------

    /// Opens the transport and, once `Open` arrives, fires `onOpen`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.closed.store(false, Ordering::Release);
        let transport = self.transport.lock().await.clone();
        transport.connect().await
    }

    /// Cancels the grace timer and disconnects the transport. No further
    /// outbound envelopes are produced until `connect()`/`set_strategy()`.
    /// Invariant 6: every `callbacks` entry is removed on explicit close, not
    /// just on a terminal response; `messages_to_ack` is cleared alongside it
    /// since there is no longer anyone left to retry those sends for.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.closing_timer.lock().await.take() {
            handle.abort();
        }
        {
            let mut inner = self.state.lock().await;
            inner.callbacks.clear();
            inner.messages_to_ack.clear();
        }
        let transport = self.transport.lock().await.clone();
        transport.disconnect().await;
    }

    /// Allocates an id, sends-or-enqueues the envelope, and registers `cb`
    /// to be invoked once on the first terminal response.
    pub async fn post(&self, body: MessageBody, cb: Option<ResponseCallback>) -> MsgId {
        let id = self.allocate_id(&body).await;
        if let (Some(cb), true) = (cb, id != FORGET) {
            self.state.lock().await.callbacks.insert(id, cb);
        }
        let envelope = Envelope::new(id, body);
        self.dispatch_send(envelope).await;
        id
    }

    /// Same as `post` for a route body, subject to the advisory rate limit.
    pub async fn send_to_route(
        &self,
        route: String,
        verb: Verb,
        data: Payload,
        headers: Option<HashMap<String, String>>,
        cb: Option<ResponseCallback>,
    ) -> MsgId {
        let exceeded = {
            let mut inner = self.state.lock().await;
            inner.messages_sent_in_a_second += 1;
            inner.messages_sent_in_a_second > self.config.rate_limit
        };
        if exceeded {
            if let Some(ref cb) = cb {
                tracing::warn!(conn = self.id, %route, "rate limit exceeded (advisory, send proceeds)");
                cb(RouteResponse {
                    data: Payload::String(String::new()),
                    error: Some(format!(
                        "Rate limit of {} messages/s exceeded",
                        self.config.rate_limit
                    )),
                });
            }
        }
        self.post(MessageBody::Route { route, verb, data, headers }, cb).await
    }

    /// Constructs a route body and sends it send-and-forget (id = -1):
    /// dropped if disconnected, never retried.
    pub async fn send_to_route_and_forget(
        &self,
        route: String,
        verb: Verb,
        data: Payload,
        headers: Option<HashMap<String, String>>,
    ) {
        let envelope = Envelope::forget(MessageBody::Route { route, verb, data, headers });
        self.dispatch_send(envelope).await;
    }

    pub async fn get_secret(&self) -> String {
        self.get_header("secret")
            .await
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub async fn get_header(&self, key: &str) -> Option<Payload> {
        self.state.lock().await.header.get(key).cloned()
    }

    /// Closes the current transport, installs `new_transport`, reconnects,
    /// and drains the reconnect queue in FIFO order through normal send.
    pub async fn set_strategy(self: &Arc<Self>, new_transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        self.close().await;
        {
            let mut guard = self.transport.lock().await;
            *guard = Arc::clone(&new_transport);
        }
        self.wire_current_transport();
        self.connect().await
    }

    pub async fn get_strategy_type(&self) -> TransportKind {
        self.transport.lock().await.kind()
    }

    // -- id allocation & send path -------------------------------------------

    async fn allocate_id(&self, body: &MessageBody) -> MsgId {
        match body {
            // A `res` envelope is never itself made to expect a response.
            MessageBody::Res { .. } => FORGET,
            _ => {
                let mut inner = self.state.lock().await;
                let id = inner.next_msg_id;
                inner.next_msg_id += 1;
                id
            }
        }
    }

    async fn dispatch_send(&self, envelope: Envelope) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let transport = self.transport.lock().await.clone();
        if transport.is_connected() {
            self.send_now(&transport, envelope).await;
        } else if envelope.id != FORGET {
            self.state.lock().await.messages_to_send_after_reconnect.push_back(envelope);
        }
        // Send-and-forget envelopes while disconnected are simply dropped.
    }

    async fn send_now(&self, transport: &Arc<dyn Transport>, envelope: Envelope) {
        if envelope.needs_ack() {
            let mut inner = self.state.lock().await;
            let entry = inner.messages_to_ack.entry(envelope.id).or_insert_with(|| SentEntry {
                envelope: envelope.clone(),
                sent_at: Instant::now(),
                sent_amount: 0,
            });
            entry.sent_amount += 1;
            entry.sent_at = Instant::now();
            entry.envelope = envelope.clone();
        }
        if let Err(e) = transport.send(&envelope).await {
            tracing::debug!(conn = self.id, id = envelope.id, err = %e, "send failed");
        }
    }

    async fn flush_reconnect_queue(&self) {
        let queued: Vec<Envelope> = {
            let mut inner = self.state.lock().await;
            inner.messages_to_send_after_reconnect.drain(..).collect()
        };
        if queued.is_empty() {
            return;
        }
        let transport = self.transport.lock().await.clone();
        for envelope in queued {
            self.send_now(&transport, envelope).await;
        }
    }

    // -- retry timer ----------------------------------------------------------

    fn spawn_retry_timer(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config.retry_scan_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    _ = ticker.tick() => conn.retry_scan_once().await,
                }
            }
        });
    }

    async fn retry_scan_once(&self) {
        let transport = self.transport.lock().await.clone();
        if !transport.is_connected() {
            return;
        }
        let deadline = self.config.retry_deadline();
        let due: Vec<Envelope> = {
            let inner = self.state.lock().await;
            inner
                .messages_to_ack
                .values()
                .filter(|e| e.sent_at.elapsed() > deadline)
                .map(|e| e.envelope.clone())
                .collect()
        };
        for envelope in due {
            tracing::debug!(conn = self.id, id = envelope.id, "retrying unacknowledged envelope");
            self.send_now(&transport, envelope).await;
        }
    }

    // -- liveness (ping/pong) ---------------------------------------------------

    fn spawn_ping_loop(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if conn.cancel.is_cancelled() {
                    break;
                }
                let connected = conn.transport.lock().await.is_connected();
                if !connected {
                    tokio::select! {
                        _ = conn.cancel.cancelled() => break,
                        _ = tokio::time::sleep(conn.config.ping_backoff()) => {}
                    }
                    continue;
                }

                let pong_received = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&pong_received);
                let cb: ResponseCallback = Arc::new(move |resp: RouteResponse| {
                    if resp.error.is_none() {
                        flag.store(true, Ordering::Release);
                    }
                });
                conn.post(MessageBody::Ping {}, Some(cb)).await;

                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    _ = tokio::time::sleep(conn.config.ping_round()) => {}
                }

                if !pong_received.load(Ordering::Acquire) {
                    tracing::warn!(conn = conn.id, "pong not received within round, closing");
                    conn.close().await;
                }
            }
        });
    }

    fn spawn_rate_limit_reset(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config.rate_window());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        conn.state.lock().await.messages_sent_in_a_second = 0;
                    }
                }
            }
        });
    }

    // -- transport event wiring -------------------------------------------------

    fn wire_current_transport(self: &Arc<Self>) {
        let transport = {
            // Cloning the Arc<dyn Transport> without holding the lock across
            // the spawned task's lifetime.
            let guard = self.transport.try_lock();
            match guard {
                Ok(t) => t.clone(),
                Err(_) => return,
            }
        };
        let mut rx = transport.subscribe();
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    event = rx.recv() => {
                        match event {
                            Some(event) => conn.handle_transport_event(event).await,
                            None => break,
                        }
                    }
                }
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.handle_open().await,
            TransportEvent::Message(envelope) => self.handle_inbound(envelope).await,
            TransportEvent::Close => self.handle_transport_close().await,
        }
    }

    async fn handle_open(&self) {
        if let Some(handle) = self.closing_timer.lock().await.take() {
            handle.abort();
        }
        if let Some(ref cb) = self.hooks.on_open {
            cb();
        }
        if self.is_client {
            let secret = self.get_secret().await;
            self.post(MessageBody::Set { key: "secret".to_owned(), value: Payload::String(secret) }, None)
                .await;
            if let Some(ref cb) = self.hooks.on_client_connect {
                cb();
            }
        }
        self.flush_reconnect_queue().await;
    }

    async fn handle_transport_close(self: &Arc<Self>) {
        if self.is_client {
            self.fire_close().await;
            return;
        }
        let conn = Arc::clone(self);
        let grace = self.config.close_grace();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            conn.fire_close().await;
        });
        *self.closing_timer.lock().await = Some(handle);
    }

    async fn fire_close(&self) {
        if let Some(ref cb) = self.hooks.on_close {
            cb();
        }
    }

    // -- inbound dispatch ---------------------------------------------------

    async fn handle_inbound(self: &Arc<Self>, envelope: Envelope) {
        if let MessageBody::Res { target, status, data } = envelope.msg {
            self.handle_response(target, status, data).await;
            return;
        }

        let id = envelope.id;
        let needs_response = id != FORGET;

        if needs_response {
            let existing = { self.state.lock().await.received_messages.get(&id).cloned() };
            if let Some(outcome) = existing {
                if outcome.is_pending().await {
                    self.reply_forget(id, 202, Payload::String("Message is being processed".to_owned()))
                        .await;
                } else if let Some(cached) = outcome.peek().await {
                    self.reply_forget(id, cached.status, cached.data).await;
                }
                return;
            }
        }

        let outcome: Tracked<CachedResponse> = Tracked::pending();
        if needs_response {
            self.state.lock().await.received_messages.insert(id, outcome.clone());
        }

        let response = self.dispatch_body(id, envelope.msg).await;

        if needs_response {
            outcome.settle(response.clone()).await;
            self.reply_forget(id, response.status, response.data).await;
        }
        // Invariant 5: for id = -1, no state is retained past this point —
        // `received_messages` was never written for it.
    }

    async fn dispatch_body(self: &Arc<Self>, id: MsgId, body: MessageBody) -> CachedResponse {
        match body {
            MessageBody::Set { key, value } => {
                let should_write = {
                    let inner = self.state.lock().await;
                    // Invariant 7: once non-empty, `secret` never changes.
                    key != "secret"
                        || inner
                            .header
                            .get("secret")
                            .and_then(|v| v.as_str())
                            .map(str::is_empty)
                            .unwrap_or(true)
                };
                if should_write {
                    self.state.lock().await.header.insert(key.clone(), value.clone());
                }
                if let Some(ref cb) = self.hooks.on_data_set {
                    cb(key.clone(), value.clone());
                }
                CachedResponse { status: 200, data: serde_json::json!([key, value]) }
            }
            MessageBody::Ping {} => CachedResponse { status: 200, data: Payload::String("pong".to_owned()) },
            MessageBody::On { route } => {
                if let Some(ref cb) = self.hooks.on_subscribe_to_route {
                    cb(route);
                }
                CachedResponse { status: 200, data: Payload::String("OK".to_owned()) }
            }
            MessageBody::Off { route } => {
                if let Some(ref cb) = self.hooks.on_unsubscribe_from_route {
                    cb(route);
                }
                CachedResponse { status: 200, data: Payload::String("OK".to_owned()) }
            }
            MessageBody::Route { route, verb, data, headers } => {
                if let Err(e) = crate::path::validate_client_route(&route) {
                    return CachedResponse { status: 400, data: Payload::String(e) };
                }
                let headers = headers.unwrap_or_default();
                match &self.hooks.on_route_message {
                    Some(handler) => match handler(id, route, verb, data, headers, Arc::clone(self)).await {
                        Ok(RouteOutcome::Ok) => {
                            CachedResponse { status: 200, data: Payload::String("OK".to_owned()) }
                        }
                        Ok(RouteOutcome::Data(d)) => CachedResponse { status: 200, data: d },
                        Ok(RouteOutcome::Error(e)) => CachedResponse { status: 400, data: Payload::String(e) },
                        Ok(RouteOutcome::NotFound(e)) => {
                            CachedResponse { status: 404, data: Payload::String(e) }
                        }
                        Err(_) => CachedResponse {
                            status: 500,
                            data: Payload::String("Error handling message".to_owned()),
                        },
                    },
                    None => CachedResponse {
                        status: 500,
                        data: Payload::String("Error handling message".to_owned()),
                    },
                }
            }
            MessageBody::Res { .. } => unreachable!("res is routed before dispatch_body"),
        }
    }

    async fn handle_response(&self, target: MsgId, status: u16, data: Payload) {
        if status == 202 {
            // Peer acknowledged receipt but is still processing; leave
            // outbound bookkeeping untouched, do not fire the callback.
            return;
        }
        let response = if status == 200 {
            RouteResponse { data, error: None }
        } else {
            RouteResponse { data: Payload::String(String::new()), error: Some(data_as_string(&data)) }
        };
        let cb = {
            let mut inner = self.state.lock().await;
            inner.messages_to_ack.remove(&target);
            inner.callbacks.remove(&target)
        };
        if let Some(cb) = cb {
            cb(response);
        }
    }

    async fn reply_forget(&self, target: MsgId, status: u16, data: Payload) {
        let envelope = Envelope::forget(MessageBody::Res { target, status, data });
        self.dispatch_send(envelope).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn data_as_string(data: &Payload) -> String {
    match data {
        Payload::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
