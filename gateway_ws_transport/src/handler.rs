//! The state-gated message handlers and per-connection tasks.
//!
//! `handle_message` is invoked by the reader task for one frame at a time; it is never
//! re-entered concurrently for one connection, and every handler runs to completion. A broken
//! operation reports to the client and returns; only `connection_terminate` (and the token
//! expiry task) take the socket down.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::{future::BoxFuture, FutureExt};
use gateway_graphql_ws::{
    ClientMessage, ConnectionErrorPayload, ErrorStyle, GraphQLError, InitPayload, ServerMessage,
    StartPayload,
};
use http::{HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::{
    cache::QueryCacheKey,
    connection::{ConnState, OperationEntry, OperationId, WsConnection},
    execute::{self, OperationContext},
    log::{log_event, OpEventKind, OperationDetails, WsEvent},
    plan::{
        ActionId, ActionLogMap, ExecutionPlan, GraphQLRequest, MutationPlan, ParameterisedQueryHash,
        QueryPlan, QueryType, RequestId, SourceSubscription, SubscriptionPlan,
    },
    poller::{
        AsyncActionHandler, LiveQueryPoller, LiveQueryResponse, OnChange, SubscriberMetadata,
    },
    server::ServerEnv,
};

/// What the reader task should do after a handled frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageOutcome {
    /// Keep reading.
    Continue,
    /// Close the socket with the given reason.
    Close(&'static str),
}

/// Parameters collected at handshake time for one accepted socket.
#[derive(Clone, Debug)]
pub struct AcceptParams {
    /// Error rendering style, from the URL path.
    pub error_style: ErrorStyle,
    /// API flavor, from the URL path.
    pub query_type: QueryType,
    /// The retained (filtered) handshake headers.
    pub headers: http::HeaderMap,
    /// The peer address.
    pub ip: String,
}

/// Creates the connection descriptor for an accepted handshake, bumps the connections gauge and
/// logs the `accepted` event. The returned receiver is the writer task's end of the outbound
/// queue.
pub fn on_open(params: AcceptParams) -> (Arc<WsConnection>, mpsc::Receiver<ServerMessage>) {
    let (conn, rx) = WsConnection::new(
        params.error_style,
        params.query_type,
        params.headers,
        params.ip,
    );
    metrics::gauge!("websocket_connections").increment(1.0);
    log_event(&conn, &WsEvent::Accepted);
    (conn, rx)
}

/// Decodes one inbound frame and dispatches it. A frame that fails to decode produces a
/// `connection_error` and leaves the socket open.
pub async fn handle_raw_message(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    frame: &[u8],
) -> MessageOutcome {
    match ClientMessage::decode(frame) {
        Ok(msg) => handle_message(env, conn, msg).await,
        Err(err) => {
            let message = format!("parsing ClientMessage failed: {err}");
            log_event(conn, &WsEvent::ConnectionError {
                message: message.clone(),
            });
            conn.send(ServerMessage::ConnectionError {
                payload: ConnectionErrorPayload { message },
            })
            .await;
            MessageOutcome::Continue
        }
    }
}

/// Dispatches one decoded client message against the connection state.
pub async fn handle_message(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    msg: ClientMessage,
) -> MessageOutcome {
    match msg {
        ClientMessage::ConnectionInit { payload } => {
            handle_init(env, conn, payload).await;
            MessageOutcome::Continue
        }
        ClientMessage::Start { id, payload } => {
            handle_start(env, conn, id, payload).await;
            MessageOutcome::Continue
        }
        ClientMessage::Stop { id } => {
            handle_stop(env, conn, &id).await;
            MessageOutcome::Continue
        }
        ClientMessage::ConnectionTerminate => MessageOutcome::Close("ConnectionTerminate received"),
    }
}

async fn handle_init(env: &Arc<ServerEnv>, conn: &Arc<WsConnection>, payload: InitPayload) {
    let ConnState::NotInitialised { headers, ip } = conn.state() else {
        // Repeated connection_init on a settled connection is ignored.
        return;
    };

    // Authenticate with the union of handshake and payload headers; the payload wins.
    let mut merged = headers;
    for (name, value) in &payload.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                merged.insert(name, value);
            }
            _ => tracing::debug!(
                target: "websocket",
                ws_id = %conn.id,
                header = %name,
                "ignoring malformed connection_init header"
            ),
        }
    }

    match env.authenticator.resolve(&merged).await {
        Ok((user, expiry)) => {
            conn.set_state(ConnState::Initialised {
                user,
                expiry,
                headers: merged,
                ip,
            });
            conn.send(ServerMessage::ConnectionAck).await;
            conn.send(ServerMessage::ConnectionKeepAlive).await;
        }
        Err(err) => {
            let message = err.to_string();
            conn.set_state(ConnState::InitError {
                message: message.clone(),
            });
            log_event(conn, &WsEvent::ConnectionError {
                message: message.clone(),
            });
            conn.send(ServerMessage::ConnectionError {
                payload: ConnectionErrorPayload { message },
            })
            .await;
        }
    }
}

async fn handle_start(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    id: OperationId,
    payload: StartPayload,
) {
    // A client reusing a live id must not clobber the existing operation; it gets an error and
    // no `complete`, since the original operation is still running.
    if conn.has_operation(&id).await {
        let message = format!("an operation already exists with this id: {id}");
        log_op(conn, &id, None, None, OpEventKind::ProtoErr, Some(json!(message)));
        conn.send_error(&id, &GraphQLError::new(message)).await;
        return;
    }

    let (user, forwarded_headers) = match conn.state() {
        ConnState::InitError { message } => {
            let message = format!("cannot start as connection_init failed with: {message}");
            log_op(conn, &id, None, None, OpEventKind::ProtoErr, Some(json!(message)));
            conn.send_error(&id, &GraphQLError::new(message)).await;
            conn.send_complete(&id).await;
            return;
        }
        ConnState::NotInitialised { .. } => {
            let message = "start received before the connection is initialised";
            log_op(conn, &id, None, None, OpEventKind::ProtoErr, Some(json!(message)));
            conn.send_error(&id, &GraphQLError::new(message)).await;
            conn.send_complete(&id).await;
            return;
        }
        ConnState::Initialised { user, headers, .. } => (user, headers),
    };

    let request = GraphQLRequest::from(payload);
    let operation_name = request.operation_name.clone();
    let request_id = RequestId::new();

    if env.enable_allowlist
        && !env
            .allowlist
            .is_allowed(&user.role, operation_name.as_deref(), &request.query)
    {
        query_error(
            conn,
            &id,
            operation_name,
            Some(&request_id),
            GraphQLError::new("query is not allowed"),
        )
        .await;
        return;
    }

    let schema = (env.schema_reader)();
    let (query_hash, plan) = match env
        .planner
        .plan(&user, &schema, conn.query_type, env.sql_gen, &request)
        .await
    {
        Ok(planned) => planned,
        Err(err) => {
            query_error(conn, &id, operation_name, Some(&request_id), err.into()).await;
            return;
        }
    };

    log_op(
        conn,
        &id,
        operation_name.clone(),
        Some(&request_id),
        OpEventKind::Started,
        None,
    );

    match plan {
        ExecutionPlan::Query(plan) => {
            let ctx = OperationContext {
                request_id: &request_id,
                user: &user,
                forwarded_headers: &forwarded_headers,
                request: &request,
            };
            run_query(env, conn, &id, ctx, plan, operation_name).await;
        }
        ExecutionPlan::Mutation(plan) => {
            let ctx = OperationContext {
                request_id: &request_id,
                user: &user,
                forwarded_headers: &forwarded_headers,
                request: &request,
            };
            run_mutation(env, conn, &id, ctx, plan, operation_name).await;
        }
        ExecutionPlan::Subscription(plan) => {
            start_subscription(env, conn, id, request_id, query_hash, operation_name, plan).await;
        }
    }
}

async fn run_query(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    id: &str,
    ctx: OperationContext<'_>,
    plan: QueryPlan,
    operation_name: Option<String>,
) {
    let cache_key = plan
        .cache
        .map(|_| QueryCacheKey::new(ctx.user, ctx.request, &plan));

    if let Some(key) = &cache_key {
        if let Some(response) = env.cache.lookup(key).await {
            conn.send(ServerMessage::Data {
                id: id.to_owned(),
                payload: response,
            })
            .await;
            conn.send_complete(id).await;
            log_op(
                conn,
                id,
                operation_name,
                Some(ctx.request_id),
                OpEventKind::Completed,
                Some(json!({"cached": true})),
            );
            return;
        }
    }

    match execute::run_query_plan(&env.executors, ctx, &plan).await {
        Ok(outcome) => {
            conn.send(ServerMessage::Data {
                id: id.to_owned(),
                payload: outcome.response.clone(),
            })
            .await;
            if let (Some(key), Some(directive)) = (cache_key, plan.cache) {
                env.cache.store(key, outcome.response, directive.ttl).await;
            }
            conn.send_complete(id).await;
            log_op(
                conn,
                id,
                operation_name,
                Some(ctx.request_id),
                OpEventKind::Completed,
                Some(json!({"execution_time_ms": outcome.elapsed.as_millis() as u64})),
            );
        }
        Err(err) => {
            query_error(conn, id, operation_name, Some(ctx.request_id), err.into()).await;
        }
    }
}

async fn run_mutation(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    id: &str,
    ctx: OperationContext<'_>,
    plan: MutationPlan,
    operation_name: Option<String>,
) {
    match execute::run_mutation_plan(&env.executors, ctx, &plan).await {
        Ok(outcome) => {
            conn.send(ServerMessage::Data {
                id: id.to_owned(),
                payload: outcome.response,
            })
            .await;
            conn.send_complete(id).await;
            log_op(
                conn,
                id,
                operation_name,
                Some(ctx.request_id),
                OpEventKind::Completed,
                Some(json!({"execution_time_ms": outcome.elapsed.as_millis() as u64})),
            );
        }
        Err(err) => {
            query_error(conn, id, operation_name, Some(ctx.request_id), err.into()).await;
        }
    }
}

async fn start_subscription(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    id: OperationId,
    request_id: RequestId,
    query_hash: ParameterisedQueryHash,
    operation_name: Option<String>,
    plan: SubscriptionPlan,
) {
    let SubscriptionPlan {
        async_actions,
        source,
    } = plan;

    match source {
        None if async_actions.is_empty() => {
            // Nothing will ever produce data for this operation.
            conn.send_complete(&id).await;
            log_op(
                conn,
                &id,
                operation_name,
                Some(&request_id),
                OpEventKind::Completed,
                None,
            );
        }
        None => {
            start_async_action_subscription(env, conn, id, request_id, operation_name, async_actions)
                .await;
        }
        Some(source) => {
            start_source_subscription(
                env,
                conn,
                id,
                request_id,
                query_hash,
                operation_name,
                async_actions,
                source,
            )
            .await;
        }
    }
}

/// A subscription consisting entirely of async-action fields: no live query, results arrive
/// from the poller's async-action queue.
async fn start_async_action_subscription(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    id: OperationId,
    request_id: RequestId,
    operation_name: Option<String>,
    async_actions: IndexMap<String, ActionId>,
) {
    let action_ids: Vec<ActionId> = async_actions.values().copied().collect();
    let handler = AsyncActionHandler {
        on_result: marshal_action_results(
            conn.sender(),
            conn.error_style,
            id.clone(),
            Arc::new(async_actions),
        ),
        on_error: async_action_error(conn.sender(), conn.error_style, id.clone()),
    };

    if let Err(err) = env
        .poller
        .add_async_action_query(id.clone(), action_ids, handler)
        .await
    {
        query_error(
            conn,
            &id,
            operation_name,
            Some(&request_id),
            GraphQLError::new(err.to_string()),
        )
        .await;
    }
}

#[expect(clippy::too_many_arguments, reason = "one call site, mirrors the plan contents")]
async fn start_source_subscription(
    env: &Arc<ServerEnv>,
    conn: &Arc<WsConnection>,
    id: OperationId,
    request_id: RequestId,
    query_hash: ParameterisedQueryHash,
    operation_name: Option<String>,
    async_actions: IndexMap<String, ActionId>,
    source: SourceSubscription,
) {
    let action_ids: Vec<ActionId> = async_actions.values().copied().collect();

    // The backend plan depends on the current action log responses; fetch them up front.
    let log_map = if action_ids.is_empty() {
        ActionLogMap::new()
    } else {
        match env.poller.fetch_action_logs(&action_ids).await {
            Ok(map) => map,
            Err(err) => {
                query_error(
                    conn,
                    &id,
                    operation_name,
                    Some(&request_id),
                    GraphQLError::new(err.to_string()),
                )
                .await;
                return;
            }
        }
    };

    let lq_plan = match (source.build)(&log_map) {
        Ok(plan) => plan,
        Err(err) => {
            query_error(conn, &id, operation_name, Some(&request_id), err.into()).await;
            return;
        }
    };

    if action_ids.is_empty() {
        // The query-detail log is only emitted for pure database subscriptions.
        tracing::debug!(
            target: "websocket",
            ws_id = %conn.id,
            request_id = %request_id,
            generated_sql = %lq_plan.sql,
            "subscription query"
        );
    }

    let on_change = make_on_change(conn.sender(), id.clone());

    // Registering with the poller and recording the handle must not be separable: the registry
    // guard spans both, so close and stop observe either nothing or a removable entry.
    let mut ops = conn.operations().await;
    if ops.contains_key(&id) {
        drop(ops);
        let message = format!("an operation already exists with this id: {id}");
        log_op(conn, &id, None, None, OpEventKind::ProtoErr, Some(json!(message)));
        conn.send_error(&id, &GraphQLError::new(message)).await;
        return;
    }
    let subscriber = SubscriberMetadata {
        ws_id: conn.id,
        operation_id: id.clone(),
        operation_name: operation_name.clone(),
    };
    let live_query_id = match env
        .poller
        .add_live_query(
            subscriber,
            source.source.clone(),
            query_hash.clone(),
            operation_name.clone(),
            request_id.clone(),
            lq_plan,
            on_change.clone(),
        )
        .await
    {
        Ok(lq_id) => lq_id,
        Err(err) => {
            drop(ops);
            query_error(
                conn,
                &id,
                operation_name,
                Some(&request_id),
                GraphQLError::new(err.to_string()),
            )
            .await;
            return;
        }
    };
    ops.insert(
        id.clone(),
        OperationEntry {
            live_query_id,
            operation_name: operation_name.clone(),
        },
    );
    drop(ops);

    // When async actions participate, new action results tear the live query down and rebuild
    // it with the fresh log map, under the same operation id.
    if !action_ids.is_empty() {
        let handler = AsyncActionHandler {
            on_result: restart_on_action_results(
                env.poller.clone(),
                conn.clone(),
                id.clone(),
                request_id.clone(),
                query_hash,
                operation_name.clone(),
                source,
                on_change,
            ),
            on_error: async_action_error(conn.sender(), conn.error_style, id.clone()),
        };
        if let Err(err) = env
            .poller
            .add_async_action_query(id.clone(), action_ids, handler)
            .await
        {
            tracing::error!(
                target: "websocket",
                ws_id = %conn.id,
                operation_id = %id,
                %err,
                "failed to register async action restart handler"
            );
        }
    }
}

/// The poller-facing push callback: every push becomes a `data` frame, transient failures
/// included. `complete` is never emitted here; subscriptions end only on `stop`, terminate, or
/// close.
fn make_on_change(sender: mpsc::Sender<ServerMessage>, id: OperationId) -> OnChange {
    Arc::new(move |response: LiveQueryResponse| {
        let sender = sender.clone();
        let id = id.clone();
        async move {
            let payload = match response {
                LiveQueryResponse::Data(payload) => payload,
                LiveQueryResponse::TransientError(payload) => payload,
            };
            let _ = sender.send(ServerMessage::Data { id, payload }).await;
        }
        .boxed()
    })
}

/// Result callback for async-only subscriptions: marshals the action log map into one `data`
/// frame in plan field order.
fn marshal_action_results(
    sender: mpsc::Sender<ServerMessage>,
    error_style: ErrorStyle,
    id: OperationId,
    fields: Arc<IndexMap<String, ActionId>>,
) -> Arc<dyn Fn(ActionLogMap) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |log_map: ActionLogMap| {
        let sender = sender.clone();
        let id = id.clone();
        let fields = fields.clone();
        async move {
            let started = Instant::now();
            let mut data = Map::with_capacity(fields.len());
            let mut missing = None;
            for (field, action_id) in fields.iter() {
                match log_map.get(action_id) {
                    Some(response) => {
                        data.insert(field.clone(), response.clone());
                    }
                    None => {
                        missing = Some(*action_id);
                        break;
                    }
                }
            }
            let msg = match missing {
                None => ServerMessage::Data {
                    id: id.clone(),
                    payload: json!({"data": data}),
                },
                Some(action_id) => {
                    tracing::error!(
                        target: "websocket",
                        operation_id = %id,
                        action_id = %action_id,
                        "missing log response for async action"
                    );
                    ServerMessage::Error {
                        id: id.clone(),
                        payload: error_style.render(&GraphQLError::new(format!(
                            "unexpected: missing log response for async action {action_id}"
                        ))),
                    }
                }
            };
            let _ = sender.send(msg).await;
            tracing::debug!(
                target: "websocket",
                operation_id = %id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "async action results delivered"
            );
        }
        .boxed()
    })
}

/// Error callback for async-action registrations: reports to the client and logs.
fn async_action_error(
    sender: mpsc::Sender<ServerMessage>,
    error_style: ErrorStyle,
    id: OperationId,
) -> Arc<dyn Fn(GraphQLError) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |error: GraphQLError| {
        let sender = sender.clone();
        let id = id.clone();
        let payload = error_style.render(&error);
        async move {
            tracing::error!(
                target: "websocket",
                operation_id = %id,
                error = %error.message,
                "async action subscription failed"
            );
            let _ = sender.send(ServerMessage::Error { id, payload }).await;
        }
        .boxed()
    })
}

/// Result callback for source-backed subscriptions with async actions: rebuilds the backend
/// plan from the new log map and swaps the live query in place.
#[expect(clippy::too_many_arguments, reason = "one call site, mirrors the registration")]
fn restart_on_action_results(
    poller: Arc<dyn LiveQueryPoller>,
    conn: Arc<WsConnection>,
    id: OperationId,
    request_id: RequestId,
    query_hash: ParameterisedQueryHash,
    operation_name: Option<String>,
    source: SourceSubscription,
    on_change: OnChange,
) -> Arc<dyn Fn(ActionLogMap) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |log_map: ActionLogMap| {
        let poller = poller.clone();
        let conn = conn.clone();
        let id = id.clone();
        let request_id = request_id.clone();
        let query_hash = query_hash.clone();
        let operation_name = operation_name.clone();
        let source = source.clone();
        let on_change = on_change.clone();
        async move {
            let new_plan = match (source.build)(&log_map) {
                Ok(plan) => plan,
                Err(err) => {
                    let error = GraphQLError::from(err);
                    tracing::error!(
                        target: "websocket",
                        operation_id = %id,
                        error = %error.message,
                        "failed to rebuild live query after action results"
                    );
                    conn.send_error(&id, &error).await;
                    return;
                }
            };

            // Swap under the registry guard; stop and close observe either the old or the new
            // handle, never a gap.
            let mut ops = conn.operations().await;
            let Some(entry) = ops.get(&id).cloned() else {
                // Stopped in the meantime; nothing to restart.
                return;
            };
            if let Err(err) = poller.remove_live_query(&entry.live_query_id).await {
                tracing::error!(
                    target: "websocket",
                    operation_id = %id,
                    %err,
                    "failed to remove live query during restart"
                );
            }
            let subscriber = SubscriberMetadata {
                ws_id: conn.id,
                operation_id: id.clone(),
                operation_name: operation_name.clone(),
            };
            match poller
                .add_live_query(
                    subscriber,
                    source.source.clone(),
                    query_hash.clone(),
                    operation_name.clone(),
                    request_id.clone(),
                    new_plan,
                    on_change.clone(),
                )
                .await
            {
                Ok(live_query_id) => {
                    ops.insert(
                        id.clone(),
                        OperationEntry {
                            live_query_id,
                            operation_name: operation_name.clone(),
                        },
                    );
                }
                Err(err) => {
                    ops.remove(&id);
                    drop(ops);
                    let error = GraphQLError::new(err.to_string());
                    tracing::error!(
                        target: "websocket",
                        operation_id = %id,
                        error = %error.message,
                        "failed to re-register live query after action results"
                    );
                    conn.send_error(&id, &error).await;
                }
            }
        }
        .boxed()
    })
}

async fn handle_stop(env: &Arc<ServerEnv>, conn: &Arc<WsConnection>, id: &str) {
    let mut ops = conn.operations().await;
    match ops.remove(id) {
        Some(entry) => {
            log_op(
                conn,
                id,
                entry.operation_name.clone(),
                None,
                OpEventKind::Stopped,
                None,
            );
            if let Err(err) = env.poller.remove_live_query(&entry.live_query_id).await {
                tracing::error!(
                    target: "websocket",
                    ws_id = %conn.id,
                    operation_id = %id,
                    %err,
                    "failed to remove live query"
                );
            }
        }
        None => {
            // Expected for completed queries/mutations, misbehaving clients, or a race with
            // natural completion.
            tracing::debug!(
                target: "websocket",
                ws_id = %conn.id,
                operation_id = %id,
                "stop received for an operation that does not exist"
            );
        }
    }
}

/// The close path: logs the `closed` event (before removal, so the count reflects the registry
/// at close), removes every registered live query, and drops the connections gauge.
pub async fn on_close(env: &Arc<ServerEnv>, conn: &Arc<WsConnection>) {
    log_event(conn, &WsEvent::Closed {
        live_queries: conn.operation_count().await,
    });
    for (operation_id, entry) in conn.drain_operations().await {
        if let Err(err) = env.poller.remove_live_query(&entry.live_query_id).await {
            tracing::error!(
                target: "websocket",
                ws_id = %conn.id,
                operation_id = %operation_id,
                %err,
                "failed to remove live query at close"
            );
        }
    }
    metrics::gauge!("websocket_connections").decrement(1.0);
}

/// Periodically enqueues `ka` frames, regardless of connection state.
pub fn spawn_keepalive(conn: Arc<WsConnection>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = conn.close.wait() => break,
                () = tokio::time::sleep(delay) => {
                    conn.send(ServerMessage::ConnectionKeepAlive).await;
                }
            }
        }
    })
}

/// Blocks until the connection is initialised with a token expiry, then sleeps until that
/// instant and closes the connection. Stays blocked forever when the token never expires.
pub fn spawn_token_expiry(conn: Arc<WsConnection>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = conn.state_watch();
        let expiry = loop {
            let observed = match &*state.borrow_and_update() {
                ConnState::Initialised { expiry, .. } => Some(*expiry),
                _ => None,
            };
            if let Some(Some(expiry)) = observed {
                break expiry;
            }
            // Initialised without an expiry never transitions again; changed() then pends until
            // the connection goes away.
            tokio::select! {
                _ = conn.close.wait() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        };

        let delay = expiry
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = conn.close.wait() => {}
            () = tokio::time::sleep(delay) => {
                tracing::info!(
                    target: "websocket",
                    ws_id = %conn.id,
                    "closing connection: authentication token expired"
                );
                conn.close.trigger("Connection closed after token expiry");
            }
        }
    })
}

async fn query_error(
    conn: &Arc<WsConnection>,
    id: &str,
    operation_name: Option<String>,
    request_id: Option<&RequestId>,
    error: GraphQLError,
) {
    log_op(
        conn,
        id,
        operation_name,
        request_id,
        OpEventKind::QueryErr,
        Some(json!(error.message)),
    );
    conn.send_error(id, &error).await;
    conn.send_complete(id).await;
}

fn log_op(
    conn: &WsConnection,
    operation_id: &str,
    operation_name: Option<String>,
    request_id: Option<&RequestId>,
    kind: OpEventKind,
    detail: Option<Value>,
) {
    log_event(
        conn,
        &WsEvent::Operation(OperationDetails {
            operation_id: operation_id.to_owned(),
            operation_name,
            request_id: request_id.map(ToString::to_string),
            kind,
            detail,
        }),
    );
}
