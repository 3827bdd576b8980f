//! GraphQL-over-WebSocket transport core for the data API gateway.
//!
//! This crate accepts long-lived client sockets speaking the legacy `graphql-ws` subprotocol
//! (see [`gateway_graphql_ws`]), authenticates them, parses and dispatches GraphQL operations,
//! multiplexes live subscriptions against the external live-query poller, and tears everything
//! down on disconnect.
//!
//! The collaborators the transport depends on (authenticator, planner, backend executors,
//! live-query poller, query cache) are traits; the process wires concrete implementations into a
//! [`ServerEnv`] and hands it to [`create_server`].

pub mod auth;
pub mod cache;
pub mod connection;
pub mod cors;
pub mod execute;
pub mod handler;
pub mod log;
pub mod plan;
pub mod poller;
pub mod server;

pub use self::{
    auth::{AuthError, Authenticator, RoleName, SessionVariables, UserInfo},
    connection::{ConnState, OperationEntry, OperationId, WsConnection, WsId},
    cors::CorsPolicy,
    plan::{ExecutionPlan, GraphQLRequest, Planner, QueryAllowlist, QueryType},
    poller::{LiveQueryId, LiveQueryPoller, LiveQueryResponse},
    server::{create_server, ServerEnv, WsServer},
};
