//! The planner output model.
//!
//! Parsing and planning of GraphQL documents happen outside this crate; the transport hands a
//! [`GraphQLRequest`] to the [`Planner`] and receives an [`ExecutionPlan`] back. The plan shapes
//! here mirror what the dispatch engine in [`crate::execute`] knows how to run.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use derive_more::{Display, Error};
use gateway_graphql_ws::{GraphQLError, StartPayload};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::{RoleName, UserInfo};

/// Identifier assigned to every accepted operation, threaded to executors and log events.
#[derive(Clone, Debug, Display, Eq, Hash, PartialEq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generates a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// One GraphQL request as received from the client, prior to planning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GraphQLRequest {
    /// The document body.
    pub query: String,
    /// The variables supplied with the request.
    pub variables: Map<String, Value>,
    /// The operation to execute when the document contains several.
    pub operation_name: Option<String>,
}

impl From<StartPayload> for GraphQLRequest {
    fn from(payload: StartPayload) -> Self {
        Self {
            query: payload.query,
            variables: payload.variables,
            operation_name: payload.operation_name,
        }
    }
}

/// A stable digest of a parameterised plan, used by the poller to multiplex identical
/// subscriptions across clients.
#[derive(Clone, Debug, Display, Eq, Hash, PartialEq)]
pub struct ParameterisedQueryHash(pub String);

/// Name of a configured data source.
#[derive(Clone, Debug, Display, Eq, Hash, PartialEq)]
pub struct SourceName(pub String);

/// The backend family a database step targets. Picks the concrete executor out of the
/// capability table in [`crate::execute::Executors`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// PostgreSQL-family sources.
    Postgres,
    /// SQL Server sources.
    Mssql,
}

/// Identifier of one async action invocation.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub struct ActionId(pub Uuid);

/// The current log responses of a set of async actions, keyed by action id.
pub type ActionLogMap = HashMap<ActionId, Value>;

/// Which flavor of the GraphQL API the client connected on. Fixed per connection at handshake
/// from the URL path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryType {
    /// The plain GraphQL API.
    Graphql,
    /// The Relay API.
    Relay,
}

/// Knobs SQL generation honors, fixed per process and threaded into every plan.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqlGenCtx {
    /// Whether numeric column values are emitted as JSON strings to avoid precision loss.
    pub stringify_numeric_types: bool,
}

/// Monotonic schema-cache version, bumped by the metadata subsystem on reload.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub struct SchemaVersion(pub u64);

/// An opaque snapshot of the schema cache. The transport only threads it to the planner.
#[derive(Clone, Debug)]
pub struct SchemaSnapshot {
    /// The snapshot's version.
    pub version: SchemaVersion,
    /// The schema payload, interpreted solely by the planner.
    pub schema: Value,
}

/// An opaque remote-join tree attached to a step. Handed to the remote-joins processor together
/// with the step's response.
#[derive(Clone, Debug)]
pub struct RemoteJoins(pub Value);

/// A step executed against a local database source.
#[derive(Clone, Debug)]
pub struct DbStep {
    /// Which executor family runs this step.
    pub backend: BackendKind,
    /// The source the step targets.
    pub source: SourceName,
    /// The SQL generated by the planner.
    pub generated_sql: String,
    /// Remote joins to stitch into the step's response, if any.
    pub remote_joins: Option<RemoteJoins>,
}

/// A step forwarded to a remote GraphQL schema.
#[derive(Clone, Debug)]
pub struct RemoteSchemaStep {
    /// The remote endpoint.
    pub endpoint: String,
    /// The request to forward.
    pub request: GraphQLRequest,
    /// The field path to extract from the remote response (the result customiser).
    pub result_path: Vec<String>,
}

/// A step executed by the action runner.
#[derive(Clone, Debug)]
pub struct ActionStep {
    /// The configured action to invoke.
    pub action_name: String,
    /// The action's input payload.
    pub payload: Value,
    /// Remote joins to stitch into the action's response, if any.
    pub remote_joins: Option<RemoteJoins>,
}

/// One node of a query or mutation plan.
#[derive(Clone, Debug)]
pub enum PlanStep {
    /// Dispatch to a local database source.
    Db(DbStep),
    /// Forward to a remote schema.
    RemoteSchema(RemoteSchemaStep),
    /// Run an action.
    Action(ActionStep),
    /// Literal JSON embedded in the plan (e.g. introspection results).
    Raw(Value),
}

/// Caching instruction attached to a query plan.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheDirective {
    /// How long the stored response stays fresh. `None` leaves it to the cache's default.
    pub ttl: Option<Duration>,
}

/// An ordered mapping from GraphQL field name to the step producing that field.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// The steps, in response field order.
    pub steps: IndexMap<String, PlanStep>,
    /// Whether and how to cache the assembled response. `None` disables caching for this plan.
    pub cache: Option<CacheDirective>,
    /// The session variables the request actually references; only these participate in the
    /// cache key.
    pub referenced_session_vars: BTreeSet<String>,
}

/// Same shape as [`QueryPlan`]; mutations are never cached.
#[derive(Clone, Debug)]
pub struct MutationPlan {
    /// The steps, in response field order.
    pub steps: IndexMap<String, PlanStep>,
}

/// The backend plan for one registered live query, opaque to the transport.
#[derive(Clone, Debug)]
pub struct LiveQueryPlan {
    /// The multiplexed SQL the poller executes.
    pub sql: String,
    /// The plan's variables.
    pub variables: Map<String, Value>,
}

/// Builds the backend live-query plan for the current async-action log responses. The closure
/// captures the plan's immutable context; it is re-invoked when action results arrive and the
/// live query is rebuilt.
pub type LiveQueryBuilder =
    Arc<dyn Fn(&ActionLogMap) -> Result<LiveQueryPlan, PlanError> + Send + Sync>;

/// The source-backed part of a subscription plan.
#[derive(Clone, derive_more::Debug)]
pub struct SourceSubscription {
    /// The source the live query polls.
    pub source: SourceName,
    /// Which executor family the source belongs to.
    pub backend: BackendKind,
    /// Builder for the backend plan, parameterised by the current action log map.
    #[debug(skip)]
    pub build: LiveQueryBuilder,
}

/// A planned subscription: async-action fields, a source-backed live query, or both.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionPlan {
    /// Async-action response fields, keyed by field name.
    pub async_actions: IndexMap<String, ActionId>,
    /// The source-backed live query, absent for async-only subscriptions.
    pub source: Option<SourceSubscription>,
}

/// The three plan shapes the dispatch engine knows how to run.
#[derive(Clone, Debug)]
pub enum ExecutionPlan {
    /// A read, assembled from per-field steps and possibly cached.
    Query(QueryPlan),
    /// A write, possibly coalesced into one transaction.
    Mutation(MutationPlan),
    /// A live operation registered with the poller.
    Subscription(SubscriptionPlan),
}

/// Failure while parsing, validating, or planning a request. Reported to the client as a
/// pre-execution error.
#[derive(Clone, Debug, Display, Error)]
#[display("{message}")]
pub struct PlanError {
    /// What went wrong.
    #[error(not(source))]
    pub message: String,
}

impl PlanError {
    /// Constructs an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<PlanError> for GraphQLError {
    fn from(err: PlanError) -> Self {
        GraphQLError::new(err.message)
    }
}

/// Read-only view onto the query collection / allow-list store.
pub trait QueryAllowlist: Send + Sync {
    /// Whether `query` may be executed by `role`.
    fn is_allowed(&self, role: &RoleName, operation_name: Option<&str>, query: &str) -> bool;
}

/// Turns a parsed request into an ordered plan of typed steps.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Plans `request` for `user` against `schema`.
    async fn plan(
        &self,
        user: &UserInfo,
        schema: &SchemaSnapshot,
        query_type: QueryType,
        sql_gen: SqlGenCtx,
        request: &GraphQLRequest,
    ) -> Result<(ParameterisedQueryHash, ExecutionPlan), PlanError>;
}
