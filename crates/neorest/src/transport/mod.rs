// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The transport abstraction: a minimal capability set (connect / send one
//! framed envelope / receive framed envelopes / open-close notifications /
//! liveness flag). Two implementations live alongside this module: a
//! persistent duplex socket (`ws.rs`) and an HTTP long-poll variant
//! (`poll.rs`).

pub mod poll;
pub mod ws;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::message::Envelope;

/// A boxed future, used to keep `Transport` object-safe (`dyn Transport`)
/// without pulling in an async-trait crate the rest of the workspace
/// doesn't otherwise need.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent duplex socket (WebSocket).
    Duplex,
    /// HTTP long-poll.
    Poll,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    NotConnected,
    Send(String),
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => f.write_str("transport is not connected"),
            TransportError::Send(e) => write!(f, "send failed: {e}"),
            TransportError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Events a transport pushes to whoever subscribed to it. The connection
/// engine holds exactly one subscription at a time per transport instance.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(Envelope),
    Close,
}

/// Minimal capability set every transport implementation exposes. Framing
/// is one JSON-encoded envelope per delivered unit; the transport never
/// interprets payloads.
pub trait Transport: Send + Sync {
    /// Opens the transport. Resolves once the handshake (if any) completes.
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Closes the transport. Idempotent.
    fn disconnect(&self) -> BoxFuture<'_, ()>;

    /// Sends a single framed envelope. Fails if not currently open; the
    /// caller treats that as transient (enqueue for reconnect).
    fn send(&self, envelope: &Envelope) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Current liveness flag.
    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;

    /// Subscribe to this transport's event stream. Only one subscriber is
    /// expected at a time — calling this again replaces the previous
    /// receiver's sender, matching the "single onMessage/onOpen/onClose
    /// registration" shape of the original capability set.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

/// Shared open/closed flag helper used by both transport implementations.
#[derive(Debug, Default)]
pub struct ConnectedFlag(AtomicBool);

impl ConnectedFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}
