// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection directory, inbound route dispatch, and outbound subscription
//! fan-out. The router never holds a transport itself — it composes over
//! the connection engine, wiring its own callbacks into each `Connection`'s
//! hooks by value rather than storing a back-pointer (see `build_hooks`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::Mutex;

use crate::config::NeorestConfig;
use crate::connection::{Connection, ConnectionHooks, OnRouteMessage, RouteOutcome};
use crate::message::{MsgId, Payload, Verb};
use crate::path::CompiledRoute;
use crate::transport::{BoxFuture, Transport};

/// What an inbound route handler is given to work with.
pub struct RequestContext {
    pub params: HashMap<String, String>,
    pub data: Payload,
    pub headers: HashMap<String, String>,
    pub route: String,
    pub verb: Verb,
    /// The `Connection` that sent this route message (spec.md §3's
    /// `RequestContext.sender`).
    pub sender: Arc<Connection>,
}

/// What a handler produced: at most one of `response`/`error` is set.
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub response: Option<Payload>,
    pub error: Option<String>,
}

pub type RouteHandler = Arc<dyn Fn(RequestContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A per-recipient broadcast gate: `(secret, positional params) -> allowed`.
pub type BroadcastValidator = Arc<dyn Fn(String, Vec<String>) -> BoxFuture<'static, bool> + Send + Sync>;

struct InboundLayer {
    #[allow(dead_code)]
    id: u64,
    pattern: CompiledRoute,
    handlers: HashMap<Verb, RouteHandler>,
}

struct Listener {
    secret: String,
    connection: Arc<Connection>,
    params_at_subscribe: Vec<String>,
}

struct OutboundLayer {
    #[allow(dead_code)]
    id: u64,
    pattern: CompiledRoute,
    listeners: Vec<Listener>,
    validate: BroadcastValidator,
}

/// In-memory, read-only counters for observability. Never a wire concept.
#[derive(Default)]
pub struct RouterMetrics {
    connections_registered: AtomicU64,
    broadcasts_dispatched: AtomicU64,
    inbound_dispatched: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouterMetricsSnapshot {
    pub connections_registered: u64,
    pub broadcasts_dispatched: u64,
    pub inbound_dispatched: u64,
}

pub struct Router {
    config: Arc<NeorestConfig>,
    directory: Mutex<HashMap<String, Arc<Connection>>>,
    inbound: Mutex<Vec<InboundLayer>>,
    outbound: Mutex<Vec<OutboundLayer>>,
    next_layer_id: AtomicU64,
    metrics: RouterMetrics,
}

impl Router {
    pub fn new(config: Arc<NeorestConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            next_layer_id: AtomicU64::new(1),
            metrics: RouterMetrics::default(),
        })
    }

    fn alloc_layer_id(&self) -> u64 {
        self.next_layer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn metrics_snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            connections_registered: self.metrics.connections_registered.load(Ordering::Relaxed),
            broadcasts_dispatched: self.metrics.broadcasts_dispatched.load(Ordering::Relaxed),
            inbound_dispatched: self.metrics.inbound_dispatched.load(Ordering::Relaxed),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.directory.lock().await.len()
    }

    /// If `reconnect_secret` matches a directory entry, rebinds its
    /// transport (reconnect). Otherwise constructs a new server-side
    /// `Connection` whose `onDataSet` hook registers it in the directory
    /// on first receipt of a non-empty `secret`.
    pub async fn add_socket(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        reconnect_secret: Option<&str>,
    ) -> Arc<Connection> {
        if let Some(secret) = reconnect_secret {
            let existing = self.directory.lock().await.get(secret).cloned();
            if let Some(existing) = existing {
                let _ = existing.set_strategy(transport).await;
                return existing;
            }
        }

        let cell: Arc<StdMutex<Option<Weak<Connection>>>> = Arc::new(StdMutex::new(None));
        let hooks = self.build_hooks(Arc::clone(&cell));
        let conn = Connection::new(false, Arc::clone(&self.config), transport, hooks);
        *cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&conn));
        self.metrics.connections_registered.fetch_add(1, Ordering::Relaxed);
        conn
    }

    /// Builds the closures passed into a fresh `Connection`'s hooks. `cell`
    /// is filled with the connection's own handle immediately after
    /// construction (before `connect()` is ever called), so hooks that need
    /// to act on "the connection that fired this" can upgrade it without
    /// the `Connection` holding a reference back to the `Router`.
    fn build_hooks(self: &Arc<Self>, cell: Arc<StdMutex<Option<Weak<Connection>>>>) -> ConnectionHooks {
        let router = Arc::clone(self);

        let on_data_set = {
            let router = Arc::clone(&router);
            let cell = Arc::clone(&cell);
            Arc::new(move |key: String, value: Payload| {
                if key != "secret" {
                    return;
                }
                let Some(secret) = value.as_str().map(str::to_owned) else { return };
                if secret.is_empty() {
                    return;
                }
                let Some(conn) = cell.lock().unwrap_or_else(|e| e.into_inner()).clone().and_then(|w| w.upgrade())
                else {
                    return;
                };
                let router = Arc::clone(&router);
                tokio::spawn(async move { router.register_connection(secret, conn).await });
            })
        };

        let on_route_message: OnRouteMessage = {
            let router = Arc::clone(&router);
            Arc::new(move |id, route, verb, data, headers, sender| {
                let router = Arc::clone(&router);
                Box::pin(async move { router.dispatch_inbound(id, route, verb, data, headers, sender).await })
            })
        };

        let on_subscribe_to_route = {
            let router = Arc::clone(&router);
            let cell = Arc::clone(&cell);
            Arc::new(move |route: String| {
                let router = Arc::clone(&router);
                let cell = Arc::clone(&cell);
                tokio::spawn(async move {
                    let Some(conn) = cell.lock().unwrap_or_else(|e| e.into_inner()).clone().and_then(|w| w.upgrade())
                    else {
                        return;
                    };
                    let secret = conn.get_secret().await;
                    router.subscribe_connection_to_route(&route, &secret, &conn).await;
                });
            })
        };

        let on_unsubscribe_from_route = {
            let router = Arc::clone(&router);
            let cell = Arc::clone(&cell);
            Arc::new(move |route: String| {
                let router = Arc::clone(&router);
                let cell = Arc::clone(&cell);
                tokio::spawn(async move {
                    let Some(conn) = cell.lock().unwrap_or_else(|e| e.into_inner()).clone().and_then(|w| w.upgrade())
                    else {
                        return;
                    };
                    let secret = conn.get_secret().await;
                    router.unsubscribe_connection_from_route(&route, &secret).await;
                });
            })
        };

        let on_close = {
            let router = Arc::clone(&router);
            let cell = Arc::clone(&cell);
            Arc::new(move || {
                let router = Arc::clone(&router);
                let cell = Arc::clone(&cell);
                tokio::spawn(async move {
                    let Some(conn) = cell.lock().unwrap_or_else(|e| e.into_inner()).clone().and_then(|w| w.upgrade())
                    else {
                        return;
                    };
                    let secret = conn.get_secret().await;
                    router.remove_connection(&secret).await;
                });
            })
        };

        ConnectionHooks {
            on_open: None,
            on_data_set: Some(on_data_set),
            on_route_message: Some(on_route_message),
            on_subscribe_to_route: Some(on_subscribe_to_route),
            on_unsubscribe_from_route: Some(on_unsubscribe_from_route),
            on_close: Some(on_close),
            on_client_connect: None,
        }
    }

    async fn register_connection(&self, secret: String, conn: Arc<Connection>) {
        self.directory.lock().await.insert(secret, conn);
    }

    async fn remove_connection(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        self.directory.lock().await.remove(secret);
        // Open Question 3 fix: assign the filtered list back to the layer
        // instead of discarding `retain`'s result.
        let mut layers = self.outbound.lock().await;
        for layer in layers.iter_mut() {
            layer.listeners.retain(|l| l.secret != secret);
        }
    }

    /// Registers an inbound handler for `(pattern, verb)`. A second
    /// registration for the same pattern+verb overwrites the handler;
    /// different verbs on the same pattern coexist on one layer.
    pub async fn on_get(&self, pattern: &str, handler: RouteHandler) {
        self.register_verb(pattern, Verb::Get, handler).await;
    }

    pub async fn on_post(&self, pattern: &str, handler: RouteHandler) {
        self.register_verb(pattern, Verb::Post, handler).await;
    }

    pub async fn on_delete(&self, pattern: &str, handler: RouteHandler) {
        self.register_verb(pattern, Verb::Delete, handler).await;
    }

    async fn register_verb(&self, pattern: &str, verb: Verb, handler: RouteHandler) {
        let mut layers = self.inbound.lock().await;
        if let Some(layer) = layers.iter_mut().find(|l| l.pattern.pattern() == pattern) {
            layer.handlers.insert(verb, handler);
            return;
        }
        let id = self.alloc_layer_id();
        let mut handlers = HashMap::new();
        handlers.insert(verb, handler);
        layers.push(InboundLayer { id, pattern: CompiledRoute::compile(pattern), handlers });
    }

    /// Declares a broadcastable outbound route with a per-recipient gate.
    pub async fn on_validate_broadcast(&self, pattern: &str, validator: BroadcastValidator) {
        let id = self.alloc_layer_id();
        self.outbound.lock().await.push(OutboundLayer {
            id,
            pattern: CompiledRoute::compile(pattern),
            listeners: Vec::new(),
            validate: validator,
        });
    }

    /// Wired from a connection's `on` callback.
    async fn subscribe_connection_to_route(&self, path: &str, secret: &str, conn: &Arc<Connection>) {
        let mut layers = self.outbound.lock().await;
        for layer in layers.iter_mut() {
            let Some(params) = layer.pattern.positional_params(path) else { continue };
            layer.listeners.retain(|l| l.secret != secret);
            layer.listeners.push(Listener {
                secret: secret.to_owned(),
                connection: Arc::clone(conn),
                params_at_subscribe: params,
            });
        }
    }

    /// Wired from a connection's `off` callback.
    async fn unsubscribe_connection_from_route(&self, path: &str, secret: &str) {
        let mut layers = self.outbound.lock().await;
        for layer in layers.iter_mut() {
            if layer.pattern.positional_params(path).is_some() {
                layer.listeners.retain(|l| l.secret != secret);
            }
        }
    }

    /// On `onRouteMessage(id, route, verb, data, headers, sender)`: scan
    /// inbound layers in insertion order, first matcher wins, then dispatch
    /// to the verb's handler.
    async fn dispatch_inbound(
        &self,
        _id: MsgId,
        route: String,
        verb: Verb,
        data: Payload,
        headers: HashMap<String, String>,
        sender: Arc<Connection>,
    ) -> Result<RouteOutcome, String> {
        self.metrics.inbound_dispatched.fetch_add(1, Ordering::Relaxed);

        let found = {
            let layers = self.inbound.lock().await;
            layers
                .iter()
                .find_map(|l| l.pattern.match_path(&route).map(|params| (l.handlers.get(&verb).cloned(), params)))
        };

        let Some((handler, params)) = found else {
            return Ok(RouteOutcome::NotFound(format!("Route \"{route}\" not found")));
        };
        let Some(handler) = handler else {
            return Ok(RouteOutcome::Error(format!("Route \"{route}\" does not support verb \"{verb}\"")));
        };

        let ctx = RequestContext { params, data, headers, route, verb, sender };
        let result = handler(ctx).await;
        Ok(match result {
            HandlerResult { error: Some(e), .. } => RouteOutcome::Error(e),
            HandlerResult { response: Some(d), .. } => RouteOutcome::Data(d),
            HandlerResult { response: None, error: None } => RouteOutcome::Ok,
        })
    }

    async fn broadcast(&self, path: &str, verb: Verb, payload: Payload, except: Option<&Arc<Connection>>) {
        let candidates: Vec<(Arc<Connection>, Vec<String>, BroadcastValidator)> = {
            let layers = self.outbound.lock().await;
            let mut out = Vec::new();
            for layer in layers.iter() {
                let Some(captured) = layer.pattern.positional_params(path) else { continue };
                for listener in &layer.listeners {
                    if listener.params_at_subscribe != captured {
                        continue;
                    }
                    if let Some(except) = except {
                        if Arc::ptr_eq(&listener.connection, except) {
                            continue;
                        }
                    }
                    out.push((Arc::clone(&listener.connection), captured.clone(), Arc::clone(&layer.validate)));
                }
            }
            out
            // No de-duplication across layers: a path matching two layers
            // delivers to a matching listener twice, by design (spec §4.3).
        };

        for (conn, params, validate) in candidates {
            let secret = conn.get_secret().await;
            if validate(secret, params).await {
                self.metrics.broadcasts_dispatched.fetch_add(1, Ordering::Relaxed);
                conn.send_to_route(path.to_owned(), verb, payload.clone(), None, None).await;
            }
        }
    }

    pub async fn broadcast_post(&self, path: &str, payload: Payload, except: Option<&Arc<Connection>>) {
        self.broadcast(path, Verb::Post, payload, except).await;
    }

    pub async fn broadcast_deletion(&self, path: &str, payload: Payload, except: Option<&Arc<Connection>>) {
        self.broadcast(path, Verb::Delete, payload, except).await;
    }

    pub async fn broadcast_update(&self, path: &str, payload: Payload, except: Option<&Arc<Connection>>) {
        self.broadcast(path, Verb::Response, payload, except).await;
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
