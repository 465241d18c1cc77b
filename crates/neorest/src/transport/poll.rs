// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP long-poll transport. `connect` marks the transport connected
//! immediately and starts a fixed-interval poll loop that GETs the
//! endpoint; each successful response yields at most one envelope. `send`
//! POSTs a single envelope. A poll failure disconnects the transport.
//!
//! The server side has no persistent socket to poll, so it is modeled as
//! an in-memory mailbox: inbound envelopes arrive via `deliver_inbound`
//! (called from the `POST /poll/send` handler) and outbound envelopes sit
//! in a queue drained by `take_outbound` (called from `GET /poll/recv`).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::message::Envelope;
use crate::transport::{BoxFuture, ConnectedFlag, Transport, TransportError, TransportEvent, TransportKind};

type EventSender = StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>;

fn emit(events: &EventSender, event: TransportEvent) {
    if let Some(tx) = events.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
        let _ = tx.send(event);
    }
}

/// Client-side poll transport: GETs for inbound envelopes, POSTs outbound
/// ones, against the same URL.
pub struct ClientPollTransport {
    url: String,
    http: reqwest::Client,
    poll_interval: Duration,
    connected: Arc<ConnectedFlag>,
    cancel: CancellationToken,
    events: Arc<EventSender>,
}

impl ClientPollTransport {
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            poll_interval,
            connected: Arc::new(ConnectedFlag::new()),
            cancel: CancellationToken::new(),
            events: Arc::new(StdMutex::new(None)),
        }
    }
}

impl Transport for ClientPollTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        let url = self.url.clone();
        let http = self.http.clone();
        let interval = self.poll_interval;
        let connected = Arc::clone(&self.connected);
        let events = Arc::clone(&self.events);
        let cancel = self.cancel.clone();

        Box::pin(async move {
            connected.set(true);
            emit(&events, TransportEvent::Open);

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match http.get(&url).send().await {
                                Ok(resp) if resp.status() == reqwest::StatusCode::NO_CONTENT => {}
                                Ok(resp) if resp.status().is_success() => {
                                    match resp.json::<Envelope>().await {
                                        Ok(env) => emit(&events, TransportEvent::Message(env)),
                                        Err(e) => tracing::debug!(err = %e, "dropping malformed poll body"),
                                    }
                                }
                                _ => {
                                    connected.set(false);
                                    emit(&events, TransportEvent::Close);
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        let cancel = self.cancel.clone();
        let connected = Arc::clone(&self.connected);
        let events = Arc::clone(&self.events);
        Box::pin(async move {
            cancel.cancel();
            connected.set(false);
            emit(&events, TransportEvent::Close);
        })
    }

    fn send(&self, envelope: &Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let url = self.url.clone();
        let http = self.http.clone();
        let connected = self.connected.get();
        let envelope = envelope.clone();
        Box::pin(async move {
            if !connected {
                return Err(TransportError::NotConnected);
            }
            http.post(&url)
                .json(&envelope)
                .send()
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }
}

/// Server-side mailbox standing in for a poll client's absent persistent
/// socket.
pub struct ServerPollTransport {
    connected: Arc<ConnectedFlag>,
    outbound: Mutex<VecDeque<Envelope>>,
    events: Arc<EventSender>,
}

impl ServerPollTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: Arc::new(ConnectedFlag::new()),
            outbound: Mutex::new(VecDeque::new()),
            events: Arc::new(StdMutex::new(None)),
        })
    }

    /// Called by the `POST /poll/send` handler.
    pub fn deliver_inbound(&self, envelope: Envelope) {
        emit(&self.events, TransportEvent::Message(envelope));
    }

    /// Called by the `GET /poll/recv` handler; returns at most one envelope.
    pub async fn take_outbound(&self) -> Option<Envelope> {
        self.outbound.lock().await.pop_front()
    }

    /// Called by the server's close-grace timer when the client hasn't
    /// polled within the window.
    pub fn mark_closed(&self) {
        self.connected.set(false);
        emit(&self.events, TransportEvent::Close);
    }
}

impl Transport for ServerPollTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.connected.set(true);
            emit(&self.events, TransportEvent::Open);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.connected.set(false);
        })
    }

    fn send(&self, envelope: &Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let envelope = envelope.clone();
        Box::pin(async move {
            self.outbound.lock().await.push_back(envelope);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }
}
