// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A single-assignment handle over an in-flight result.
//!
//! Mirrors the pending-request bookkeeping in the upstream bridge: a
//! duplicate inbound delivery needs to tell "still being handled" from
//! "already answered, here's the cached answer" without re-awaiting the
//! original handler.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

#[derive(Debug)]
enum State<T> {
    Pending,
    Ready(T),
}

/// A handle whose pending/settled state is observable without awaiting,
/// and which can be awaited by callers that do need the value.
#[derive(Clone)]
pub struct Tracked<T> {
    state: Arc<Mutex<State<T>>>,
    notify: Arc<Notify>,
}

impl<T: Clone> Tracked<T> {
    pub fn pending() -> Self {
        Self { state: Arc::new(Mutex::new(State::Pending)), notify: Arc::new(Notify::new()) }
    }

    pub fn ready(value: T) -> Self {
        Self { state: Arc::new(Mutex::new(State::Ready(value))), notify: Arc::new(Notify::new()) }
    }

    /// `true` if no value has been written yet.
    pub async fn is_pending(&self) -> bool {
        matches!(*self.state.lock().await, State::Pending)
    }

    /// Returns the settled value without waiting, or `None` if still pending.
    pub async fn peek(&self) -> Option<T> {
        match &*self.state.lock().await {
            State::Pending => None,
            State::Ready(v) => Some(v.clone()),
        }
    }

    /// Writes the value exactly once. Subsequent calls are no-ops, matching
    /// the "ready is written once" rule — a settled outcome never changes.
    pub async fn settle(&self, value: T) {
        let mut guard = self.state.lock().await;
        if matches!(*guard, State::Pending) {
            *guard = State::Ready(value);
            self.notify.notify_waiters();
        }
    }

    /// Waits until settled, then returns a clone of the value.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(v) = self.peek().await {
                return v;
            }
            self.notify.notified().await;
            // Re-check after waking — settle() may have raced the wait.
            if let Some(v) = self.peek().await {
                return v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_pending_and_reports_peek_none() {
        let t: Tracked<u32> = Tracked::pending();
        assert!(t.is_pending().await);
        assert_eq!(t.peek().await, None);
    }

    #[tokio::test]
    async fn settle_is_observed_without_awaiting() {
        let t: Tracked<u32> = Tracked::pending();
        t.settle(42).await;
        assert!(!t.is_pending().await);
        assert_eq!(t.peek().await, Some(42));
    }

    #[tokio::test]
    async fn second_settle_is_ignored() {
        let t: Tracked<u32> = Tracked::pending();
        t.settle(1).await;
        t.settle(2).await;
        assert_eq!(t.peek().await, Some(1));
    }

    #[tokio::test]
    async fn wait_unblocks_on_settle() {
        let t: Tracked<u32> = Tracked::pending();
        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.wait().await })
        };
        tokio::task::yield_now().await;
        t.settle(7).await;
        let got = waiter.await.expect("join");
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn ready_constructor_is_immediately_settled() {
        let t = Tracked::ready("ok".to_string());
        assert!(!t.is_pending().await);
        assert_eq!(t.wait().await, "ok");
    }
}
