//! End-to-end protocol tests: client messages in, server messages out, with recording mock
//! collaborators standing in for the authenticator, planner, executors and poller.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use gateway_graphql_ws::{ClientMessage, ErrorStyle, GraphQLError, ServerMessage, StartPayload};
use gateway_ws_transport::{
    auth::{AuthError, Authenticator, RoleName, SessionVariables, UserInfo},
    cache::InMemoryQueryCache,
    connection::{CloseSignal, WsConnection},
    cors::CorsPolicy,
    execute::{
        ActionExecutor, BackendExecutor, DbStepRequest, Executors, RemoteJoinsProcessor,
        RemoteResponse, RemoteSchemaClient, StepError, StepResponse,
    },
    handler::{self, AcceptParams, MessageOutcome},
    plan::{
        ActionId, ActionLogMap, ActionStep, BackendKind, CacheDirective, DbStep, ExecutionPlan,
        GraphQLRequest, LiveQueryPlan, MutationPlan, ParameterisedQueryHash, PlanError, PlanStep,
        Planner, QueryAllowlist, QueryPlan, QueryType, RemoteJoins, RequestId, SchemaSnapshot,
        SchemaVersion, SourceName, SourceSubscription, SqlGenCtx, SubscriptionPlan,
    },
    poller::{
        AsyncActionHandler, LiveQueryId, LiveQueryPoller, LiveQueryResponse, OnChange,
        PollerError, SubscriberMetadata,
    },
    server::{ConnectionRegistry, ServerEnv},
};
use http::HeaderMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct StaticAuth {
    calls: AtomicUsize,
    fail: bool,
}

impl StaticAuth {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn resolve(
        &self,
        _headers: &HeaderMap,
    ) -> Result<(UserInfo, Option<SystemTime>), AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AuthError::new("malformed authorization header"));
        }
        Ok((
            UserInfo {
                role: RoleName::new("user"),
                session: SessionVariables::default(),
            },
            None,
        ))
    }
}

struct AllowEverything;

impl QueryAllowlist for AllowEverything {
    fn is_allowed(&self, _role: &RoleName, _operation_name: Option<&str>, _query: &str) -> bool {
        true
    }
}

/// Plans by inspecting the query text: `subscription` documents become source-backed
/// subscriptions, `mutation` documents two coalescible database steps, everything else a single
/// cacheable database step producing `{"foo": "bar"}`.
struct TextPlanner;

#[async_trait]
impl Planner for TextPlanner {
    async fn plan(
        &self,
        _user: &UserInfo,
        _schema: &SchemaSnapshot,
        _query_type: QueryType,
        _sql_gen: SqlGenCtx,
        request: &GraphQLRequest,
    ) -> Result<(ParameterisedQueryHash, ExecutionPlan), PlanError> {
        let hash = ParameterisedQueryHash(format!("hash:{}", request.query));
        let plan = if request.query.trim_start().starts_with("subscription") {
            ExecutionPlan::Subscription(SubscriptionPlan {
                async_actions: Default::default(),
                source: Some(SourceSubscription {
                    source: SourceName("default".into()),
                    backend: BackendKind::Postgres,
                    build: Arc::new(|_log_map: &ActionLogMap| {
                        Ok(LiveQueryPlan {
                            sql: "SELECT json_build_object('items', '[]'::json)".into(),
                            variables: Default::default(),
                        })
                    }),
                }),
            })
        } else if request.query.trim_start().starts_with("mutation") {
            let step = |sql: &str| {
                PlanStep::Db(DbStep {
                    backend: BackendKind::Postgres,
                    source: SourceName("default".into()),
                    generated_sql: sql.into(),
                    remote_joins: None,
                })
            };
            ExecutionPlan::Mutation(MutationPlan {
                steps: [
                    ("insert_a".to_owned(), step("INSERT INTO a")),
                    ("insert_b".to_owned(), step("INSERT INTO b")),
                ]
                .into_iter()
                .collect(),
            })
        } else {
            ExecutionPlan::Query(QueryPlan {
                steps: [(
                    "foo".to_owned(),
                    PlanStep::Db(DbStep {
                        backend: BackendKind::Postgres,
                        source: SourceName("default".into()),
                        generated_sql: "SELECT 'bar'".into(),
                        remote_joins: None,
                    }),
                )]
                .into_iter()
                .collect(),
                cache: Some(CacheDirective::default()),
                referenced_session_vars: Default::default(),
            })
        };
        Ok((hash, plan))
    }
}

#[derive(Default)]
struct CountingBackend {
    queries: AtomicUsize,
    batches: AtomicUsize,
}

#[async_trait]
impl BackendExecutor for CountingBackend {
    async fn run_query(&self, _req: DbStepRequest) -> Result<StepResponse, StepError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(StepResponse {
            io_time: Duration::from_millis(1),
            body: json!("bar"),
        })
    }

    async fn run_mutation(&self, _req: DbStepRequest) -> Result<StepResponse, StepError> {
        Ok(StepResponse {
            io_time: Duration::from_millis(1),
            body: json!({"affected_rows": 1}),
        })
    }

    async fn run_mutation_batch(
        &self,
        reqs: Vec<DbStepRequest>,
    ) -> Result<Vec<StepResponse>, StepError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(reqs
            .iter()
            .map(|_| StepResponse {
                io_time: Duration::from_millis(1),
                body: json!({"affected_rows": 1}),
            })
            .collect())
    }
}

struct UnusedRemote;

#[async_trait]
impl RemoteSchemaClient for UnusedRemote {
    async fn execute(
        &self,
        _endpoint: &str,
        _headers: &HeaderMap,
        _request: &GraphQLRequest,
    ) -> Result<RemoteResponse, StepError> {
        Err(StepError::execution("no remote schemas configured"))
    }
}

struct UnusedActions;

#[async_trait]
impl ActionExecutor for UnusedActions {
    async fn run(
        &self,
        _request_id: &RequestId,
        _user: &UserInfo,
        _step: &ActionStep,
    ) -> Result<StepResponse, StepError> {
        Err(StepError::execution("no actions configured"))
    }
}

struct IdentityJoins;

#[async_trait]
impl RemoteJoinsProcessor for IdentityJoins {
    async fn join(
        &self,
        response: Value,
        _joins: &RemoteJoins,
        _headers: &HeaderMap,
        _user: &UserInfo,
    ) -> Result<Value, StepError> {
        Ok(response)
    }
}

struct Registration {
    id: LiveQueryId,
    query_hash: ParameterisedQueryHash,
    operation_name: Option<String>,
    on_change: OnChange,
}

/// Records every poller interaction and lets tests push frames through the stored callbacks.
#[derive(Default)]
struct RecordingPoller {
    added: Mutex<Vec<Registration>>,
    removed: Mutex<Vec<LiveQueryId>>,
}

impl RecordingPoller {
    fn added_ids(&self) -> Vec<LiveQueryId> {
        self.added.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    fn removed_ids(&self) -> Vec<LiveQueryId> {
        self.removed.lock().unwrap().clone()
    }

    fn last_hash(&self) -> Option<ParameterisedQueryHash> {
        self.added
            .lock()
            .unwrap()
            .last()
            .map(|r| r.query_hash.clone())
    }

    fn last_operation_name(&self) -> Option<Option<String>> {
        self.added
            .lock()
            .unwrap()
            .last()
            .map(|r| r.operation_name.clone())
    }

    async fn push(&self, id: &LiveQueryId, response: LiveQueryResponse) {
        let on_change = {
            let added = self.added.lock().unwrap();
            let registration = added
                .iter()
                .find(|r| &r.id == id)
                .expect("pushed to an unregistered live query");
            registration.on_change.clone()
        };
        on_change(response).await;
    }
}

#[async_trait]
impl LiveQueryPoller for RecordingPoller {
    async fn add_live_query(
        &self,
        _subscriber: SubscriberMetadata,
        _source: SourceName,
        query_hash: ParameterisedQueryHash,
        operation_name: Option<String>,
        _request_id: RequestId,
        _plan: LiveQueryPlan,
        on_change: OnChange,
    ) -> Result<LiveQueryId, PollerError> {
        let id = LiveQueryId::new();
        self.added.lock().unwrap().push(Registration {
            id: id.clone(),
            query_hash,
            operation_name,
            on_change,
        });
        Ok(id)
    }

    async fn remove_live_query(&self, id: &LiveQueryId) -> Result<(), PollerError> {
        self.removed.lock().unwrap().push(id.clone());
        self.added.lock().unwrap().retain(|r| &r.id != id);
        Ok(())
    }

    async fn add_async_action_query(
        &self,
        _operation_id: String,
        _action_ids: Vec<ActionId>,
        _handler: AsyncActionHandler,
    ) -> Result<(), PollerError> {
        Ok(())
    }

    async fn fetch_action_logs(
        &self,
        _action_ids: &[ActionId],
    ) -> Result<ActionLogMap, PollerError> {
        Ok(ActionLogMap::new())
    }
}

struct TestHarness {
    env: Arc<ServerEnv>,
    poller: Arc<RecordingPoller>,
    backend: Arc<CountingBackend>,
    auth: Arc<StaticAuth>,
}

fn harness_with_auth(auth: StaticAuth) -> TestHarness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let poller = Arc::new(RecordingPoller::default());
    let backend = Arc::new(CountingBackend::default());
    let auth = Arc::new(auth);
    let backend_exec: Arc<dyn BackendExecutor> = backend.clone();
    let env = Arc::new(ServerEnv {
        authenticator: auth.clone(),
        allowlist: Arc::new(AllowEverything),
        enable_allowlist: false,
        planner: Arc::new(TextPlanner),
        executors: Executors {
            backends: HashMap::from([(BackendKind::Postgres, backend_exec)]),
            remote_schemas: Arc::new(UnusedRemote),
            actions: Arc::new(UnusedActions),
            remote_joins: Arc::new(IdentityJoins),
        },
        cache: Arc::new(InMemoryQueryCache::new()),
        poller: poller.clone(),
        schema_reader: Arc::new(|| {
            Arc::new(SchemaSnapshot {
                version: SchemaVersion(1),
                schema: Value::Null,
            })
        }),
        cors: CorsPolicy::AllowAll,
        keep_alive_delay: Duration::from_secs(5),
        sql_gen: SqlGenCtx::default(),
        connections: ConnectionRegistry::default(),
        shutdown: CloseSignal::new(),
    });
    TestHarness {
        env,
        poller,
        backend,
        auth,
    }
}

fn harness() -> TestHarness {
    harness_with_auth(StaticAuth::ok())
}

fn open_connection(style: ErrorStyle) -> (Arc<WsConnection>, mpsc::Receiver<ServerMessage>) {
    handler::on_open(AcceptParams {
        error_style: style,
        query_type: QueryType::Graphql,
        headers: HeaderMap::new(),
        ip: "127.0.0.1:9999".into(),
    })
}

async fn send(
    harness: &TestHarness,
    conn: &Arc<WsConnection>,
    msg: ClientMessage,
) -> MessageOutcome {
    handler::handle_message(&harness.env, conn, msg).await
}

fn start(id: &str, query: &str) -> ClientMessage {
    ClientMessage::Start {
        id: id.into(),
        payload: StartPayload {
            query: query.into(),
            variables: Default::default(),
            operation_name: None,
        },
    }
}

async fn next_msg(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a server message")
        .expect("outbound queue closed")
}

fn assert_no_message(rx: &mut mpsc::Receiver<ServerMessage>) {
    assert!(
        rx.try_recv().is_err(),
        "expected the outbound queue to be empty"
    );
}

async fn init(harness: &TestHarness, conn: &Arc<WsConnection>, rx: &mut mpsc::Receiver<ServerMessage>) {
    send(harness, conn, ClientMessage::ConnectionInit {
        payload: Default::default(),
    })
    .await;
    assert_eq!(next_msg(rx).await, ServerMessage::ConnectionAck);
    assert_eq!(next_msg(rx).await, ServerMessage::ConnectionKeepAlive);
}

#[tokio::test]
async fn test_happy_path_query() -> anyhow::Result<()> {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, start("q1", "{ foo }")).await;

    assert_eq!(next_msg(&mut rx).await, ServerMessage::Data {
        id: "q1".into(),
        payload: json!({"data": {"foo": "bar"}}),
    });
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Complete { id: "q1".into() });

    // Queries are transient: nothing stays in the registry.
    assert_eq!(conn.operation_count().await, 0);
    assert!(harness.poller.added_ids().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_start_before_init() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Legacy);

    send(&harness, &conn, start("q1", "{ foo }")).await;

    assert_eq!(next_msg(&mut rx).await, ServerMessage::Error {
        id: "q1".into(),
        payload: json!({"message": "start received before the connection is initialised"}),
    });
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Complete { id: "q1".into() });
    assert_eq!(harness.auth.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_after_failed_init() {
    let harness = harness_with_auth(StaticAuth::failing());
    let (conn, mut rx) = open_connection(ErrorStyle::Legacy);

    send(&harness, &conn, ClientMessage::ConnectionInit {
        payload: Default::default(),
    })
    .await;
    let ServerMessage::ConnectionError { payload } = next_msg(&mut rx).await else {
        panic!("expected connection_error");
    };
    assert_eq!(payload.message, "malformed authorization header");

    send(&harness, &conn, start("q1", "{ foo }")).await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Error {
        id: "q1".into(),
        payload: json!({
            "message":
                "cannot start as connection_init failed with: malformed authorization header"
        }),
    });
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Complete { id: "q1".into() });
}

#[tokio::test]
async fn test_repeated_init_is_ignored() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, ClientMessage::ConnectionInit {
        payload: Default::default(),
    })
    .await;

    assert_no_message(&mut rx);
    assert_eq!(harness.auth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_operation_id() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Legacy);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, start("s1", "subscription { items }")).await;
    assert_eq!(harness.poller.added_ids().len(), 1);

    send(&harness, &conn, start("s1", "subscription { items }")).await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Error {
        id: "s1".into(),
        payload: json!({"message": "an operation already exists with this id: s1"}),
    });
    // No complete: the original operation is still live and keeps delivering.
    let lq = harness.poller.added_ids().pop().unwrap();
    harness
        .poller
        .push(&lq, LiveQueryResponse::Data(json!({"data": {"items": [1]}})))
        .await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Data {
        id: "s1".into(),
        payload: json!({"data": {"items": [1]}}),
    });
    assert_eq!(harness.poller.added_ids().len(), 1);
}

#[tokio::test]
async fn test_subscription_add_and_remove() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, start("s1", "subscription { items }")).await;

    let added = harness.poller.added_ids();
    assert_eq!(added.len(), 1);
    assert_eq!(
        harness.poller.last_hash(),
        Some(ParameterisedQueryHash("hash:subscription { items }".into())),
    );
    assert_eq!(harness.poller.last_operation_name(), Some(None));
    assert_eq!(conn.operation_count().await, 1);

    harness
        .poller
        .push(&added[0], LiveQueryResponse::Data(json!({"data": {"items": [1]}})))
        .await;
    harness
        .poller
        .push(&added[0], LiveQueryResponse::Data(json!({"data": {"items": [1, 2]}})))
        .await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Data {
        id: "s1".into(),
        payload: json!({"data": {"items": [1]}}),
    });
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Data {
        id: "s1".into(),
        payload: json!({"data": {"items": [1, 2]}}),
    });

    send(&harness, &conn, ClientMessage::Stop { id: "s1".into() }).await;
    assert_eq!(harness.poller.removed_ids(), added);
    assert_eq!(conn.operation_count().await, 0);
    // Stop is acknowledged with silence: no error, no complete, no further data.
    assert_no_message(&mut rx);
}

#[tokio::test]
async fn test_stop_unknown_operation_is_silent() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, ClientMessage::Stop { id: "nope".into() }).await;

    assert_no_message(&mut rx);
    assert!(harness.poller.removed_ids().is_empty());
}

#[tokio::test]
async fn test_transient_poll_failure_is_delivered_as_data() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, start("s1", "subscription { items }")).await;

    let lq = harness.poller.added_ids().pop().unwrap();
    harness
        .poller
        .push(
            &lq,
            LiveQueryResponse::TransientError(json!({"errors": [{"message": "poll failed"}]})),
        )
        .await;

    assert_eq!(next_msg(&mut rx).await, ServerMessage::Data {
        id: "s1".into(),
        payload: json!({"errors": [{"message": "poll failed"}]}),
    });
    // The subscription survives the failed poll.
    assert_eq!(conn.operation_count().await, 1);
}

#[tokio::test]
async fn test_close_removes_every_live_query() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    for id in ["s1", "s2", "s3"] {
        send(&harness, &conn, start(id, "subscription { items }")).await;
    }
    let mut added = harness.poller.added_ids();
    assert_eq!(added.len(), 3);
    assert_eq!(conn.operation_count().await, 3);

    handler::on_close(&harness.env, &conn).await;

    let mut removed = harness.poller.removed_ids();
    added.sort_by_key(|id| id.0);
    removed.sort_by_key(|id| id.0);
    assert_eq!(removed, added);
    assert_eq!(conn.operation_count().await, 0);
}

#[tokio::test]
async fn test_query_cache_round_trip() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;

    send(&harness, &conn, start("q1", "{ foo }")).await;
    let first = next_msg(&mut rx).await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Complete { id: "q1".into() });

    send(&harness, &conn, start("q2", "{ foo }")).await;
    let second = next_msg(&mut rx).await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Complete { id: "q2".into() });

    let (ServerMessage::Data { payload: p1, .. }, ServerMessage::Data { payload: p2, .. }) =
        (first, second)
    else {
        panic!("expected two data messages");
    };
    assert_eq!(p1, p2);
    // The second dispatch was served from the cache without touching the backend.
    assert_eq!(harness.backend.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutation_steps_coalesce_into_one_transaction() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    init(&harness, &conn, &mut rx).await;
    send(&harness, &conn, start("m1", "mutation { insert_a insert_b }")).await;

    assert_eq!(next_msg(&mut rx).await, ServerMessage::Data {
        id: "m1".into(),
        payload: json!({
            "data": {
                "insert_a": {"affected_rows": 1},
                "insert_b": {"affected_rows": 1},
            }
        }),
    });
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Complete { id: "m1".into() });
    assert_eq!(harness.backend.batches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_undecodable_frame_keeps_the_socket_open() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    let outcome = handler::handle_raw_message(&harness.env, &conn, b"not json").await;
    assert_eq!(outcome, MessageOutcome::Continue);

    let ServerMessage::ConnectionError { payload } = next_msg(&mut rx).await else {
        panic!("expected connection_error");
    };
    assert!(payload.message.starts_with("parsing ClientMessage failed"));

    // The connection is still usable afterwards.
    init(&harness, &conn, &mut rx).await;
}

#[tokio::test]
async fn test_terminate_closes() {
    let harness = harness();
    let (conn, _rx) = open_connection(ErrorStyle::Compliant);

    let outcome = send(&harness, &conn, ClientMessage::ConnectionTerminate).await;
    assert_eq!(outcome, MessageOutcome::Close("ConnectionTerminate received"));
}

#[tokio::test]
async fn test_compliant_error_style_on_the_wire() {
    let harness = harness();
    let (conn, mut rx) = open_connection(ErrorStyle::Compliant);

    send(&harness, &conn, start("q1", "{ foo }")).await;
    assert_eq!(next_msg(&mut rx).await, ServerMessage::Error {
        id: "q1".into(),
        payload: json!({
            "errors": [{"message": "start received before the connection is initialised"}]
        }),
    });
}

#[tokio::test]
async fn test_error_rendering_helper() {
    // Legacy emits the bare error object, compliant wraps it.
    let err = GraphQLError::new("boom");
    assert_eq!(ErrorStyle::Legacy.render(&err), json!({"message": "boom"}));
    assert_eq!(
        ErrorStyle::Compliant.render(&err),
        json!({"errors": [{"message": "boom"}]}),
    );
}
