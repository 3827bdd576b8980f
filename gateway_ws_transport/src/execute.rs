//! The dispatch engine: runs query and mutation plans against the backend executors and
//! assembles the per-field responses into one GraphQL response object.
//!
//! Per-field steps run concurrently; the assembled object always follows the plan's field
//! order. Response headers produced by individual steps are discarded, the transport has no way
//! to convey them on a WebSocket.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use derive_more::{Display, Error};
use futures::future::try_join_all;
use gateway_graphql_ws::GraphQLError;
use http::HeaderMap;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{
    auth::UserInfo,
    plan::{
        ActionStep, BackendKind, GraphQLRequest, MutationPlan, PlanStep, QueryPlan, RemoteJoins,
        RequestId, SourceName,
    },
};

/// Failure while executing a plan step.
#[derive(Debug, Display, Error)]
pub enum StepError {
    /// The plan names a backend family with no registered executor.
    #[display("no executor registered for backend {_0:?}")]
    UnknownBackend(#[error(not(source))] BackendKind),
    /// The executor reported a failure.
    #[display("{message}")]
    Execution {
        /// What went wrong.
        #[error(not(source))]
        message: String,
    },
}

impl StepError {
    /// Constructs an execution failure with the given message.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

impl From<StepError> for GraphQLError {
    fn from(err: StepError) -> Self {
        GraphQLError::new(err.to_string())
    }
}

/// Everything a backend transport needs to run one database step.
#[derive(Clone, Debug)]
pub struct DbStepRequest {
    /// The id of the operation this step belongs to.
    pub request_id: RequestId,
    /// The response field the step produces.
    pub field: String,
    /// The session executing the step.
    pub user: UserInfo,
    /// The source the step targets.
    pub source: SourceName,
    /// The SQL generated by the planner.
    pub generated_sql: String,
    /// The original request, for logging and prepared-statement reuse.
    pub request: GraphQLRequest,
}

/// Result of one executed step.
#[derive(Clone, Debug)]
pub struct StepResponse {
    /// Time spent in backend I/O.
    pub io_time: Duration,
    /// The field's JSON value.
    pub body: Value,
}

/// A backend transport capable of running database steps.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Runs one read step.
    async fn run_query(&self, req: DbStepRequest) -> Result<StepResponse, StepError>;

    /// Runs one write step in its own transaction.
    async fn run_mutation(&self, req: DbStepRequest) -> Result<StepResponse, StepError>;

    /// Runs several write steps against one source in a single transaction, returning responses
    /// in request order.
    async fn run_mutation_batch(
        &self,
        reqs: Vec<DbStepRequest>,
    ) -> Result<Vec<StepResponse>, StepError>;
}

/// A response from a remote schema, headers included. The headers never reach the client; see
/// the module docs.
#[derive(Debug)]
pub struct RemoteResponse {
    /// Response headers, for diagnostics only.
    pub headers: HeaderMap,
    /// The remote's GraphQL response body.
    pub body: Value,
}

/// The outbound HTTP client used for remote-schema steps.
#[async_trait]
pub trait RemoteSchemaClient: Send + Sync {
    /// Forwards `request` to `endpoint` with the connection's forwarded headers.
    async fn execute(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        request: &GraphQLRequest,
    ) -> Result<RemoteResponse, StepError>;
}

/// The action runner.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Invokes the action named by `step` and returns its response field.
    async fn run(
        &self,
        request_id: &RequestId,
        user: &UserInfo,
        step: &ActionStep,
    ) -> Result<StepResponse, StepError>;
}

/// Stitches remote-schema data into a primary response.
#[async_trait]
pub trait RemoteJoinsProcessor: Send + Sync {
    /// Post-processes `response` according to the join tree.
    async fn join(
        &self,
        response: Value,
        joins: &RemoteJoins,
        headers: &HeaderMap,
        user: &UserInfo,
    ) -> Result<Value, StepError>;
}

/// The capability table the dispatcher picks concrete executors from.
#[derive(Clone)]
pub struct Executors {
    /// Database transports, keyed by backend family.
    pub backends: HashMap<BackendKind, Arc<dyn BackendExecutor>>,
    /// The remote-schema HTTP client.
    pub remote_schemas: Arc<dyn RemoteSchemaClient>,
    /// The action runner.
    pub actions: Arc<dyn ActionExecutor>,
    /// The remote-joins processor.
    pub remote_joins: Arc<dyn RemoteJoinsProcessor>,
}

impl Executors {
    fn backend(&self, kind: BackendKind) -> Result<&Arc<dyn BackendExecutor>, StepError> {
        self.backends.get(&kind).ok_or(StepError::UnknownBackend(kind))
    }
}

/// Immutable per-operation context threaded through step execution.
#[derive(Clone, Copy, Debug)]
pub struct OperationContext<'a> {
    /// The operation's request id.
    pub request_id: &'a RequestId,
    /// The session executing the operation.
    pub user: &'a UserInfo,
    /// Headers forwarded to upstream executors.
    pub forwarded_headers: &'a HeaderMap,
    /// The request being executed.
    pub request: &'a GraphQLRequest,
}

/// The assembled response of a completed plan.
#[derive(Debug)]
pub struct PlanOutcome {
    /// The full GraphQL response object.
    pub response: Value,
    /// Wall-clock execution time, for log events.
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum OperationKind {
    Query,
    Mutation,
}

/// Runs a query plan and assembles the response in plan field order.
pub async fn run_query_plan(
    execs: &Executors,
    ctx: OperationContext<'_>,
    plan: &QueryPlan,
) -> Result<PlanOutcome, StepError> {
    let started = Instant::now();
    let fields = run_steps(execs, ctx, &plan.steps, OperationKind::Query).await?;
    Ok(PlanOutcome {
        response: assemble(fields),
        elapsed: started.elapsed(),
    })
}

/// Runs a mutation plan. When every step is a database step targeting the same relational
/// source, the steps coalesce into a single transaction on that source.
pub async fn run_mutation_plan(
    execs: &Executors,
    ctx: OperationContext<'_>,
    plan: &MutationPlan,
) -> Result<PlanOutcome, StepError> {
    let started = Instant::now();

    let fields = if let Some((backend, db_steps)) = single_relational_source(&plan.steps) {
        let exec = execs.backend(backend)?;
        let reqs = db_steps
            .iter()
            .map(|(field, db)| db_step_request(&ctx, field, db))
            .collect::<Vec<_>>();
        let responses = exec.run_mutation_batch(reqs).await?;
        let mut fields = Vec::with_capacity(db_steps.len());
        for ((field, db), resp) in db_steps.into_iter().zip(responses) {
            let body = apply_remote_joins(execs, &ctx, resp.body, &db.remote_joins).await?;
            fields.push((field.to_owned(), body));
        }
        fields
    } else {
        run_steps(execs, ctx, &plan.steps, OperationKind::Mutation).await?
    };

    Ok(PlanOutcome {
        response: assemble(fields),
        elapsed: started.elapsed(),
    })
}

async fn run_steps(
    execs: &Executors,
    ctx: OperationContext<'_>,
    steps: &IndexMap<String, PlanStep>,
    kind: OperationKind,
) -> Result<Vec<(String, Value)>, StepError> {
    try_join_all(steps.iter().map(|(field, step)| async move {
        let value = run_step(execs, &ctx, field, step, kind).await?;
        Ok::<_, StepError>((field.clone(), value))
    }))
    .await
}

async fn run_step(
    execs: &Executors,
    ctx: &OperationContext<'_>,
    field: &str,
    step: &PlanStep,
    kind: OperationKind,
) -> Result<Value, StepError> {
    match step {
        PlanStep::Db(db) => {
            let exec = execs.backend(db.backend)?;
            let req = db_step_request(ctx, field, db);
            let resp = match kind {
                OperationKind::Query => exec.run_query(req).await?,
                OperationKind::Mutation => exec.run_mutation(req).await?,
            };
            tracing::debug!(
                target: "websocket",
                request_id = %ctx.request_id,
                field,
                io_time_ms = resp.io_time.as_millis() as u64,
                "database step finished"
            );
            apply_remote_joins(execs, ctx, resp.body, &db.remote_joins).await
        }
        PlanStep::RemoteSchema(remote) => {
            let resp = execs
                .remote_schemas
                .execute(&remote.endpoint, ctx.forwarded_headers, &remote.request)
                .await?;
            if !resp.headers.is_empty() {
                // Headers cannot be conveyed over this transport; keep them visible in logs.
                tracing::debug!(
                    target: "websocket",
                    request_id = %ctx.request_id,
                    field,
                    headers = ?resp.headers.keys().collect::<Vec<_>>(),
                    "discarding remote schema response headers"
                );
            }
            extract_result_path(resp.body, &remote.result_path)
        }
        PlanStep::Action(action) => {
            let resp = execs.actions.run(ctx.request_id, ctx.user, action).await?;
            apply_remote_joins(execs, ctx, resp.body, &action.remote_joins).await
        }
        PlanStep::Raw(value) => Ok(value.clone()),
    }
}

fn db_step_request(ctx: &OperationContext<'_>, field: &str, db: &crate::plan::DbStep) -> DbStepRequest {
    DbStepRequest {
        request_id: ctx.request_id.clone(),
        field: field.to_owned(),
        user: ctx.user.clone(),
        source: db.source.clone(),
        generated_sql: db.generated_sql.clone(),
        request: ctx.request.clone(),
    }
}

async fn apply_remote_joins(
    execs: &Executors,
    ctx: &OperationContext<'_>,
    body: Value,
    joins: &Option<RemoteJoins>,
) -> Result<Value, StepError> {
    match joins {
        Some(joins) => {
            execs
                .remote_joins
                .join(body, joins, ctx.forwarded_headers, ctx.user)
                .await
        }
        None => Ok(body),
    }
}

/// Extracts the requested field path out of a remote response, skipping the `data` envelope.
/// Remote errors take precedence over whatever partial data came back.
fn extract_result_path(body: Value, path: &[String]) -> Result<Value, StepError> {
    if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
        return Err(StepError::execution(errors.to_string()));
    }
    let mut value = body.get("data").cloned().unwrap_or(Value::Null);
    for segment in path {
        value = match value {
            Value::Object(mut obj) => obj.remove(segment).unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    Ok(value)
}

fn assemble(fields: Vec<(String, Value)>) -> Value {
    let mut data = Map::with_capacity(fields.len());
    for (field, value) in fields {
        data.insert(field, value);
    }
    serde_json::json!({ "data": data })
}

/// Matches a plan whose steps all target one relational source; such mutations coalesce into a
/// single transaction. Returns the steps in plan order.
fn single_relational_source(
    steps: &IndexMap<String, PlanStep>,
) -> Option<(BackendKind, Vec<(&str, &crate::plan::DbStep)>)> {
    let mut db_steps = Vec::with_capacity(steps.len());
    for (field, step) in steps {
        match step {
            PlanStep::Db(db) => db_steps.push((field.as_str(), db)),
            _ => return None,
        }
    }
    let (_, first) = db_steps.first()?;
    let (backend, source) = (first.backend, &first.source);
    db_steps
        .iter()
        .all(|(_, db)| db.backend == backend && db.source == *source)
        .then_some((backend, db_steps))
}
