//! Interface to the external live-query poller.
//!
//! The poller owns long-poll subscriptions and pushes results back through the callbacks
//! registered here. The transport's side of the contract: every registry entry it holds has a
//! matching registration in the poller, and removal happens on `stop` and on close.

use async_trait::async_trait;
use derive_more::{Display, Error};
use futures::future::BoxFuture;
use gateway_graphql_ws::GraphQLError;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    connection::WsId,
    plan::{ActionId, ActionLogMap, LiveQueryPlan, ParameterisedQueryHash, RequestId, SourceName},
};

/// Opaque handle for one registered live query.
#[derive(Clone, Debug, Display, Eq, Hash, PartialEq)]
pub struct LiveQueryId(pub Uuid);

impl LiveQueryId {
    /// Generates a fresh handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LiveQueryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies the subscriber behind a registration, for the poller's own bookkeeping and logs.
#[derive(Clone, Debug)]
pub struct SubscriberMetadata {
    /// The WebSocket connection the subscription lives on.
    pub ws_id: WsId,
    /// The client-chosen operation id.
    pub operation_id: String,
    /// The operation name from the request body, if any.
    pub operation_name: Option<String>,
}

/// One push from the poller for a registered live query.
#[derive(Clone, Debug)]
pub enum LiveQueryResponse {
    /// A successful poll result: a complete GraphQL response object.
    Data(Value),
    /// A per-poll failure. Delivered to the client inside a `data` frame; the subscription
    /// stays registered.
    TransientError(Value),
}

/// Callback invoked by the poller on every push. The returned future resolves once the payload
/// is enqueued on the socket, so a stalled client stalls its poller cohort and nothing else.
pub type OnChange = Arc<dyn Fn(LiveQueryResponse) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callbacks for an async-action registration.
pub struct AsyncActionHandler {
    /// Invoked when new action log responses arrive.
    pub on_result: Arc<dyn Fn(ActionLogMap) -> BoxFuture<'static, ()> + Send + Sync>,
    /// Invoked when fetching the action log failed terminally.
    pub on_error: Arc<dyn Fn(GraphQLError) -> BoxFuture<'static, ()> + Send + Sync>,
}

/// Failure reported by the poller.
#[derive(Debug, Display, Error)]
#[display("{message}")]
pub struct PollerError {
    /// What went wrong.
    #[error(not(source))]
    pub message: String,
}

impl PollerError {
    /// Constructs an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The external live-query poller.
#[async_trait]
pub trait LiveQueryPoller: Send + Sync {
    /// Registers a live query. The poller multiplexes identical `query_hash`es across
    /// subscribers and invokes `on_change` on every result push.
    #[expect(clippy::too_many_arguments, reason = "mirrors the poller's wire contract")]
    async fn add_live_query(
        &self,
        subscriber: SubscriberMetadata,
        source: SourceName,
        query_hash: ParameterisedQueryHash,
        operation_name: Option<String>,
        request_id: RequestId,
        plan: LiveQueryPlan,
        on_change: OnChange,
    ) -> Result<LiveQueryId, PollerError>;

    /// Drops a registration. After this returns, `on_change` is no longer invoked for `id`.
    async fn remove_live_query(&self, id: &LiveQueryId) -> Result<(), PollerError>;

    /// Registers interest in a set of async actions under `operation_id`. The handler's
    /// `on_result` fires whenever any of the actions produce new log responses.
    async fn add_async_action_query(
        &self,
        operation_id: String,
        action_ids: Vec<ActionId>,
        handler: AsyncActionHandler,
    ) -> Result<(), PollerError>;

    /// Fetches the current log responses for `action_ids` synchronously.
    async fn fetch_action_logs(&self, action_ids: &[ActionId]) -> Result<ActionLogMap, PollerError>;
}
