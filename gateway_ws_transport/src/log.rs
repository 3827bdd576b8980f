//! Structured log events for the WebSocket transport.
//!
//! Every event carries the connection's id and, once initialised, the session variables and
//! token expiry, so a single `websocket`-targeted subscriber reconstructs a connection's whole
//! life from its log lines.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};

use crate::connection::{ConnState, WsConnection};

/// What happened to one operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpEventKind {
    /// The operation was accepted and dispatched.
    Started,
    /// The client violated the protocol (duplicate id, start before init).
    ProtoErr,
    /// Parsing, allow-list, planning, or execution failed.
    QueryErr,
    /// A query or mutation finished and `complete` was sent.
    Completed,
    /// The client stopped a live operation.
    Stopped,
}

/// Details attached to an `operation` event.
#[derive(Clone, Debug, Serialize)]
pub struct OperationDetails {
    /// The client-chosen operation id.
    pub operation_id: String,
    /// The operation name from the request body, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// The server-assigned request id, absent for operations rejected before dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// What happened.
    #[serde(rename = "type")]
    pub kind: OpEventKind,
    /// Extra event payload (error text, execution time).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// One WebSocket transport event.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "detail")]
pub enum WsEvent {
    /// A handshake was accepted and the socket opened.
    Accepted,
    /// A handshake was rejected; no socket opened.
    Rejected {
        /// Machine-readable rejection reason.
        reason: Value,
    },
    /// `connection_init` failed or a frame could not be decoded.
    ConnectionError {
        /// The error sent to the client.
        message: String,
    },
    /// Something happened to an operation.
    Operation(OperationDetails),
    /// The socket closed. Logged before live queries are removed, so the count reflects the
    /// registry at close.
    Closed {
        /// Number of live queries registered at close.
        live_queries: usize,
    },
}

impl WsEvent {
    fn is_error(&self) -> bool {
        match self {
            Self::Rejected { .. } | Self::ConnectionError { .. } => true,
            Self::Operation(details) => {
                matches!(details.kind, OpEventKind::ProtoErr | OpEventKind::QueryErr)
            }
            Self::Accepted | Self::Closed { .. } => false,
        }
    }
}

/// Emits one event for `conn` on the `websocket` target.
pub fn log_event(conn: &WsConnection, event: &WsEvent) {
    let (user_vars, token_expiry) = match conn.state() {
        ConnState::Initialised { user, expiry, .. } => (
            serde_json::to_value(&user.session).ok(),
            expiry.map(unix_seconds),
        ),
        _ => (None, None),
    };
    let record = json!({
        "user_vars": user_vars,
        "connection": {
            "ws_id": conn.id.to_string(),
            "token_expiry": token_expiry,
        },
        "event": event,
    });
    if event.is_error() {
        tracing::error!(target: "websocket", %record);
    } else {
        tracing::info!(target: "websocket", %record);
    }
}

/// Emits a handshake rejection. There is no connection yet, hence no `ws_id`.
pub fn log_rejected(reason: Value) {
    let record = json!({ "event": WsEvent::Rejected { reason } });
    tracing::error!(target: "websocket", %record);
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
