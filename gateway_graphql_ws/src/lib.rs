//! Wire types and codec for the [legacy `graphql-ws` GraphQL over WebSocket Protocol][old], as
//! formerly used by [Apollo] and the [`subscriptions-transport-ws` npm package].
//!
//! This crate only defines the frames exchanged on the socket and their JSON encoding. The
//! connection state machine, dispatch and subscription plumbing live in `gateway_ws_transport`.
//!
//! [Apollo]: https://www.apollographql.com
//! [`subscriptions-transport-ws` npm package]: https://npmjs.com/package/subscriptions-transport-ws
//! [old]: https://github.com/apollographql/subscriptions-transport-ws/blob/v0.11.0/PROTOCOL.md

mod client_message;
mod error;
mod server_message;

pub use self::{
    client_message::{ClientMessage, InitPayload, StartPayload},
    error::{ErrorStyle, GraphQLError},
    server_message::{ConnectionErrorPayload, ServerMessage},
};
