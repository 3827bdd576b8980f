//! The per-socket connection descriptor.
//!
//! One [`WsConnection`] is created per accepted socket and shared by the reader, writer,
//! keepalive and token-expiry tasks. The connection state has a single writer (the
//! `connection_init` handler) and many readers; the operation registry is a transactional map
//! whose compound operations happen under one lock acquisition.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use derive_more::Display;
use gateway_graphql_ws::{ErrorStyle, GraphQLError, ServerMessage};
use http::HeaderMap;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use uuid::Uuid;

use crate::{auth::UserInfo, plan::QueryType, poller::LiveQueryId};

/// Identifier of one accepted WebSocket connection.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub struct WsId(pub Uuid);

impl WsId {
    /// Generates a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WsId {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-chosen identifier of one in-flight operation on one socket.
pub type OperationId = String;

/// The connection's protocol state. Transitions are monotonic: from [`ConnState::NotInitialised`]
/// to exactly one of [`ConnState::InitError`] or [`ConnState::Initialised`], where it stays.
#[derive(Clone, Debug)]
pub enum ConnState {
    /// No `connection_init` processed yet.
    NotInitialised {
        /// The headers retained at handshake.
        headers: HeaderMap,
        /// The peer address.
        ip: String,
    },
    /// `connection_init` was rejected by the authenticator. Subsequent `start`s fail.
    InitError {
        /// The rejection message.
        message: String,
    },
    /// `connection_init` succeeded.
    Initialised {
        /// The resolved session.
        user: UserInfo,
        /// When the session's token expires, if it does. The connection closes at this instant.
        expiry: Option<SystemTime>,
        /// Headers forwarded to upstream executors: handshake headers unioned with the
        /// `connection_init` payload headers.
        headers: HeaderMap,
        /// The peer address.
        ip: String,
    },
}

/// One active subscription in the operation registry.
#[derive(Clone, Debug)]
pub struct OperationEntry {
    /// The poller's handle for the registered live query.
    pub live_query_id: LiveQueryId,
    /// The operation name from the request body, if any.
    pub operation_name: Option<String>,
}

/// Broadcast used to tear a connection down: triggered by `connection_terminate`, token expiry,
/// server shutdown, or the socket going away. The first trigger's reason wins and ends up in
/// the close frame and logs.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<&'static str>>>,
}

impl CloseSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
        }
    }

    /// Fires the signal. Later calls are no-ops; the first reason sticks.
    pub fn trigger(&self, reason: &'static str) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The reason the signal fired with, if it has.
    pub fn reason(&self) -> Option<&'static str> {
        *self.tx.borrow()
    }

    /// Resolves with the close reason once the signal fires.
    pub async fn wait(&self) -> &'static str {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "connection dropped";
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How many outbound messages may be queued before producers (handlers, keepalive, live-query
/// pushes) start blocking on the writer.
const OUTBOUND_QUEUE_DEPTH: usize = 16;

/// One accepted WebSocket connection.
pub struct WsConnection {
    /// The connection's id, present in every log event it produces.
    pub id: WsId,
    /// How pre-execution errors are rendered, fixed at handshake from the URL path.
    pub error_style: ErrorStyle,
    /// Which API flavor the client connected on, fixed at handshake from the URL path.
    pub query_type: QueryType,
    /// Close broadcast shared by the connection's tasks.
    pub close: CloseSignal,
    state: watch::Sender<ConnState>,
    operations: Mutex<HashMap<OperationId, OperationEntry>>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl WsConnection {
    /// Creates a connection descriptor plus the receiving half of its outbound queue. The caller
    /// owns the receiver and drains it to the socket serially; dropping it closes the queue,
    /// after which sends drop silently.
    pub fn new(
        error_style: ErrorStyle,
        query_type: QueryType,
        headers: HeaderMap,
        ip: String,
    ) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (state, _) = watch::channel(ConnState::NotInitialised { headers, ip });
        (
            Arc::new(Self {
                id: WsId::new(),
                error_style,
                query_type,
                close: CloseSignal::new(),
                state,
                operations: Mutex::new(HashMap::new()),
                outbound,
            }),
            rx,
        )
    }

    /// Returns a snapshot of the connection state.
    pub fn state(&self) -> ConnState {
        self.state.borrow().clone()
    }

    /// Returns a watcher over the connection state, for tasks that block on a transition.
    pub fn state_watch(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// Transitions the connection state. Only the `connection_init` handler writes.
    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.send_replace(state);
    }

    /// Enqueues a message for the writer. Sends after the queue closed are dropped silently;
    /// the socket is gone and so is the client.
    pub async fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message).await;
    }

    /// Returns a clone of the outbound queue's sending half, for callbacks that outlive the
    /// handler (live-query pushes).
    pub fn sender(&self) -> mpsc::Sender<ServerMessage> {
        self.outbound.clone()
    }

    /// Enqueues an `error` message rendered for this connection's error style.
    pub async fn send_error(&self, operation_id: &str, error: &GraphQLError) {
        self.send(ServerMessage::Error {
            id: operation_id.to_owned(),
            payload: self.error_style.render(error),
        })
        .await;
    }

    /// Enqueues a `complete` message.
    pub async fn send_complete(&self, operation_id: &str) {
        self.send(ServerMessage::Complete {
            id: operation_id.to_owned(),
        })
        .await;
    }

    /// Locks the operation registry. Compound operations (check-then-insert on `start`,
    /// lookup-then-delete on `stop` and close) hold the guard for their whole extent.
    pub(crate) async fn operations(&self) -> MutexGuard<'_, HashMap<OperationId, OperationEntry>> {
        self.operations.lock().await
    }

    /// The number of active subscriptions.
    pub async fn operation_count(&self) -> usize {
        self.operations.lock().await.len()
    }

    /// Whether `operation_id` currently has an active subscription.
    pub async fn has_operation(&self, operation_id: &str) -> bool {
        self.operations.lock().await.contains_key(operation_id)
    }

    /// Empties the registry, returning every entry. Used by the close path.
    pub(crate) async fn drain_operations(&self) -> Vec<(OperationId, OperationEntry)> {
        self.operations.lock().await.drain().collect()
    }
}
