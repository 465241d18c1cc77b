// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Duplex socket transport: a persistent full-duplex framed connection.
//! Two concrete shapes share the same `Transport` contract — a
//! tokio-tungstenite client dialing out, and a server-side wrapper around
//! an already-upgraded axum `WebSocket`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_util::sync::CancellationToken;

use crate::message::Envelope;
use crate::transport::{BoxFuture, ConnectedFlag, Transport, TransportError, TransportEvent, TransportKind};

/// Events emitted before anyone calls `subscribe()` would otherwise be lost
/// — the read loop is spawned the instant the socket is accepted/dialed, but
/// `Router::add_socket` only calls `subscribe()` after `Connection::new()`
/// returns. `Idle` buffers until the first subscriber shows up; from then on
/// every event goes straight to the channel.
enum EventHubState {
    Idle(VecDeque<TransportEvent>),
    Subscribed(mpsc::UnboundedSender<TransportEvent>),
}

type EventHub = StdMutex<EventHubState>;

fn emit(events: &EventHub, event: TransportEvent) {
    let mut guard = events.lock().unwrap_or_else(|e| e.into_inner());
    match &mut *guard {
        EventHubState::Idle(buffer) => buffer.push_back(event),
        EventHubState::Subscribed(tx) => {
            let _ = tx.send(event);
        }
    }
}

fn subscribe(events: &EventHub) -> mpsc::UnboundedReceiver<TransportEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut guard = events.lock().unwrap_or_else(|e| e.into_inner());
    if let EventHubState::Idle(buffer) = &mut *guard {
        for event in buffer.drain(..) {
            let _ = tx.send(event);
        }
    }
    *guard = EventHubState::Subscribed(tx);
    rx
}

/// Client-side duplex transport: dials an arbitrary `ws://`/`wss://` URL.
pub struct ClientWsTransport {
    url: String,
    connected: Arc<ConnectedFlag>,
    cancel: CancellationToken,
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<TungsteniteMessage>>>>,
    events: Arc<EventHub>,
}

impl ClientWsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connected: Arc::new(ConnectedFlag::new()),
            cancel: CancellationToken::new(),
            sink: Arc::new(Mutex::new(None)),
            events: Arc::new(StdMutex::new(EventHubState::Idle(VecDeque::new()))),
        }
    }
}

impl Transport for ClientWsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        let url = self.url.clone();
        let connected = Arc::clone(&self.connected);
        let sink = Arc::clone(&self.sink);
        let events = Arc::clone(&self.events);
        let cancel = self.cancel.clone();

        Box::pin(async move {
            let (stream, _resp) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            let (mut write, mut read) = stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<TungsteniteMessage>();
            *sink.lock().await = Some(out_tx);

            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    if write.send(msg).await.is_err() {
                        break;
                    }
                }
            });

            connected.set(true);
            emit(&events, TransportEvent::Open);

            let read_connected = Arc::clone(&connected);
            let read_events = Arc::clone(&events);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = read.next() => {
                            match frame {
                                Some(Ok(TungsteniteMessage::Text(text))) => {
                                    match Envelope::from_json(&text) {
                                        Ok(env) => emit(&read_events, TransportEvent::Message(env)),
                                        Err(e) => tracing::debug!(err = %e, "dropping malformed envelope"),
                                    }
                                }
                                Some(Ok(TungsteniteMessage::Close(_))) | None => break,
                                Some(Err(_)) => break,
                                _ => {}
                            }
                        }
                    }
                }
                read_connected.set(false);
                emit(&read_events, TransportEvent::Close);
            });

            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        let cancel = self.cancel.clone();
        let connected = Arc::clone(&self.connected);
        let sink = Arc::clone(&self.sink);
        let events = Arc::clone(&self.events);
        Box::pin(async move {
            cancel.cancel();
            connected.set(false);
            *sink.lock().await = None;
            emit(&events, TransportEvent::Close);
        })
    }

    fn send(&self, envelope: &Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let json = envelope.to_json();
        let sink = Arc::clone(&self.sink);
        Box::pin(async move {
            let json = json.map_err(|e| TransportError::Send(e.to_string()))?;
            let guard = sink.lock().await;
            let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
            tx.send(TungsteniteMessage::Text(json.into()))
                .map_err(|e| TransportError::Send(e.to_string()))
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        subscribe(&self.events)
    }
}

/// Server-side duplex transport wrapping an already-upgraded axum
/// `WebSocket`, handed to `Router::add_socket` from the `/ws` route.
pub struct ServerWsTransport {
    connected: Arc<ConnectedFlag>,
    cancel: CancellationToken,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<AxumMessage>>>>,
    events: Arc<EventHub>,
}

impl ServerWsTransport {
    /// Takes ownership of the upgraded socket and starts pumping it
    /// immediately; `connect()` on the server side is a formality that
    /// marks the transport ready and fires `Open`. The read loop below can
    /// start emitting frames before `Router::add_socket` gets around to
    /// calling `subscribe()` on this transport, so `events` buffers them
    /// (`EventHubState::Idle`) until a subscriber attaches instead of
    /// dropping them.
    pub fn spawn(socket: WebSocket) -> Arc<Self> {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<AxumMessage>();

        let this = Arc::new(Self {
            connected: Arc::new(ConnectedFlag::new()),
            cancel: CancellationToken::new(),
            outbound: Arc::new(Mutex::new(Some(out_tx))),
            events: Arc::new(StdMutex::new(EventHubState::Idle(VecDeque::new()))),
        });

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let cancel = this.cancel.clone();
        let connected = Arc::clone(&this.connected);
        let events = Arc::clone(&this.events);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = ws_rx.next() => {
                        match frame {
                            Some(Ok(AxumMessage::Text(text))) => {
                                match Envelope::from_json(&text) {
                                    Ok(env) => emit(&events, TransportEvent::Message(env)),
                                    Err(e) => tracing::debug!(err = %e, "dropping malformed envelope"),
                                }
                            }
                            Some(Ok(AxumMessage::Close(_))) | None => break,
                            Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                }
            }
            connected.set(false);
            emit(&events, TransportEvent::Close);
        });

        this
    }
}

impl Transport for ServerWsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.connected.set(true);
            emit(&self.events, TransportEvent::Open);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cancel.cancel();
            self.connected.set(false);
        })
    }

    fn send(&self, envelope: &Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let json = envelope.to_json();
        Box::pin(async move {
            let json = json.map_err(|e| TransportError::Send(e.to_string()))?;
            let guard = self.outbound.lock().await;
            let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
            tx.send(AxumMessage::Text(json.into())).map_err(|e| TransportError::Send(e.to_string()))
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        subscribe(&self.events)
    }
}
