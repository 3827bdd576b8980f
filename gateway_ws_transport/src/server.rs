//! Server lifecycle: the upgrade routes, the per-connection task bundle, and shutdown.
//!
//! [`create_server`] wires a [`ServerEnv`] into a [`WsServer`]. The env is the process-wide
//! singleton injected into every connection; the server owns the accept loop and a registry of
//! open connections so shutdown can close them all.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use gateway_graphql_ws::{ErrorStyle, ServerMessage};
use http::HeaderMap;
use serde_json::json;
use tokio::{net::TcpListener, sync::Mutex};

use crate::{
    auth::Authenticator,
    cache::QueryCache,
    connection::{CloseSignal, WsId},
    cors::{self, CorsPolicy},
    execute::Executors,
    handler::{self, AcceptParams, MessageOutcome},
    log,
    plan::{Planner, QueryAllowlist, QueryType, SchemaSnapshot, SqlGenCtx},
    poller::LiveQueryPoller,
};

/// Returns the latest schema-cache snapshot. The metadata subsystem swaps snapshots behind this
/// callable; the transport reads one per operation.
pub type SchemaReader = Arc<dyn Fn() -> Arc<SchemaSnapshot> + Send + Sync>;

/// Registry of open connections, used by shutdown.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<WsId, CloseSignal>>,
}

impl ConnectionRegistry {
    pub(crate) async fn register(&self, id: WsId, close: CloseSignal) {
        self.inner.lock().await.insert(id, close);
    }

    pub(crate) async fn deregister(&self, id: &WsId) {
        self.inner.lock().await.remove(id);
    }

    /// The number of currently open connections.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn close_all(&self, reason: &'static str) {
        for close in self.inner.lock().await.values() {
            close.trigger(reason);
        }
    }
}

/// The process-wide environment injected into every connection.
pub struct ServerEnv {
    /// Resolves user sessions at `connection_init`.
    pub authenticator: Arc<dyn Authenticator>,
    /// The query collection / allow-list store.
    pub allowlist: Arc<dyn QueryAllowlist>,
    /// Whether the allow-list is enforced.
    pub enable_allowlist: bool,
    /// Turns parsed requests into execution plans.
    pub planner: Arc<dyn Planner>,
    /// The backend capability table.
    pub executors: Executors,
    /// The query-result cache.
    pub cache: Arc<dyn QueryCache>,
    /// The live-query poller.
    pub poller: Arc<dyn LiveQueryPoller>,
    /// Accessor for the latest schema snapshot.
    pub schema_reader: SchemaReader,
    /// The origin policy applied at handshake.
    pub cors: CorsPolicy,
    /// Interval between `ka` frames.
    pub keep_alive_delay: Duration,
    /// SQL-generation knobs, threaded to the planner's collaborators.
    pub sql_gen: SqlGenCtx,
    /// Open connections; populate with [`ConnectionRegistry::default`].
    pub connections: ConnectionRegistry,
    /// Fires when the server shuts down; populate with [`CloseSignal::new`].
    pub shutdown: CloseSignal,
}

/// Builds the server for an environment. The per-connection handlers it drives are
/// [`handler::on_open`], [`handler::handle_raw_message`] and [`handler::on_close`].
pub fn create_server(env: ServerEnv) -> WsServer {
    WsServer { env: Arc::new(env) }
}

/// The WebSocket transport server.
pub struct WsServer {
    env: Arc<ServerEnv>,
}

impl WsServer {
    /// The server's environment.
    pub fn env(&self) -> &Arc<ServerEnv> {
        &self.env
    }

    /// The router serving the three upgrade paths. Every other path is a 404.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1alpha1/graphql", get(legacy_graphql))
            .route("/v1/graphql", get(compliant_graphql))
            .route("/v1beta1/relay", get(relay))
            .fallback(not_found)
            .with_state(self.env.clone())
    }

    /// Runs the accept loop until [`WsServer::shutdown`] fires, then drains handler tasks.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let shutdown = self.env.shutdown.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
        })
        .await
    }

    /// Stops the accept loop and closes every accepted connection.
    pub async fn shutdown(&self) {
        self.env.shutdown.trigger("Server is shutting down");
        self.env.connections.close_all("Server is shutting down").await;
    }
}

async fn legacy_graphql(
    State(env): State<Arc<ServerEnv>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(env, ErrorStyle::Legacy, QueryType::Graphql, addr, headers, ws)
}

async fn compliant_graphql(
    State(env): State<Arc<ServerEnv>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(env, ErrorStyle::Compliant, QueryType::Graphql, addr, headers, ws)
}

async fn relay(
    State(env): State<Arc<ServerEnv>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(env, ErrorStyle::Compliant, QueryType::Relay, addr, headers, ws)
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"code": "not-found", "error": "resource does not exist"})),
    )
        .into_response()
}

fn upgrade(
    env: Arc<ServerEnv>,
    error_style: ErrorStyle,
    query_type: QueryType,
    addr: SocketAddr,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match cors::enforce_cors(&env.cors, &headers) {
        Ok(retained) => ws.protocols(["graphql-ws"]).on_upgrade(move |socket| {
            serve_connection(env, socket, AcceptParams {
                error_style,
                query_type,
                headers: retained,
                ip: addr.to_string(),
            })
        }),
        Err(err) => {
            let reason = json!({"code": "access-denied", "error": err.to_string()});
            log::log_rejected(reason.clone());
            (StatusCode::BAD_REQUEST, Json(reason)).into_response()
        }
    }
}

/// Encodes one server message onto the socket. An encode failure is logged and swallowed; only
/// socket failures propagate.
async fn write_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_id: WsId,
    msg: ServerMessage,
) -> Result<(), axum::Error> {
    let text = match msg.encode() {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(
                target: "websocket",
                ws_id = %ws_id,
                %err,
                "failed to encode server message"
            );
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(text.into())).await
}

/// Runs one accepted socket to completion: reader, writer, keepalive and token-expiry tasks,
/// then the close path. The reader dispatches one message at a time, so handlers for one
/// connection are never re-entered concurrently.
async fn serve_connection(env: Arc<ServerEnv>, socket: WebSocket, params: AcceptParams) {
    let (conn, mut outbound) = handler::on_open(params);
    env.connections.register(conn.id, conn.close.clone()).await;

    let keepalive = handler::spawn_keepalive(conn.clone(), env.keep_alive_delay);
    let expiry = handler::spawn_token_expiry(conn.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: sole consumer of the outbound queue, giving one connection a total message order.
    // The select is biased towards the queue so that a close racing an enqueued message never
    // drops it: the close arm only runs once the queue is drained, and drains again itself
    // before the close frame goes out.
    let writer_close = conn.close.clone();
    let writer_ws_id = conn.id;
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                queued = outbound.recv() => {
                    let Some(msg) = queued else {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    };
                    if write_message(&mut ws_tx, writer_ws_id, msg).await.is_err() {
                        writer_close.trigger("connection closed by peer");
                        break;
                    }
                }
                reason = writer_close.wait() => {
                    while let Ok(msg) = outbound.try_recv() {
                        if write_message(&mut ws_tx, writer_ws_id, msg).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: drains the socket until the peer goes away or something triggers the close signal.
    loop {
        tokio::select! {
            _ = conn.close.wait() => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let MessageOutcome::Close(reason) =
                        handler::handle_raw_message(&env, &conn, text.as_bytes()).await
                    {
                        conn.close.trigger(reason);
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let MessageOutcome::Close(reason) =
                        handler::handle_raw_message(&env, &conn, &bytes).await
                    {
                        conn.close.trigger(reason);
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    conn.close.trigger("connection closed by peer");
                    break;
                }
                Some(Err(err)) => {
                    tracing::debug!(target: "websocket", ws_id = %conn.id, %err, "socket error");
                    conn.close.trigger("connection error");
                    break;
                }
            }
        }
    }

    conn.close.trigger("connection closed");
    let _ = tokio::join!(keepalive, expiry);

    handler::on_close(&env, &conn).await;
    env.connections.deregister(&conn.id).await;
    // The writer ends once every sender is gone; live-query removal in on_close released the
    // poller's clones.
    let _ = writer.await;
}
