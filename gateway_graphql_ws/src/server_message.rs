use serde::Serialize;
use serde_json::Value;

/// The payload for errors that are not associated with a GraphQL operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionErrorPayload {
    /// The error message.
    pub message: String,
}

/// ServerMessage defines the message types that servers can send.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// ConnectionError is used for errors that are not associated with a GraphQL operation. For
    /// example, this will be used when:
    ///
    ///   * The server is unable to parse a client's message.
    ///   * The client's initialization parameters are rejected.
    ConnectionError {
        /// The error that occurred.
        payload: ConnectionErrorPayload,
    },
    /// ConnectionAck is sent in response to a client's ConnectionInit message if the server
    /// accepted a connection.
    ConnectionAck,
    /// Data contains the result of a query, mutation, or subscription event.
    Data {
        /// The id of the operation that the data is for.
        id: String,

        /// The GraphQL response.
        payload: Value,
    },
    /// Error contains an error that occurs before execution, such as validation or planning
    /// errors. The payload shape depends on the connection's [`ErrorStyle`].
    ///
    /// [`ErrorStyle`]: crate::ErrorStyle
    Error {
        /// The id of the operation that triggered this error.
        id: String,

        /// The error(s), already rendered for the connection's error style.
        payload: Value,
    },
    /// Complete indicates that no more data will be sent for the given operation.
    Complete {
        /// The id of the operation that has completed.
        id: String,
    },
    /// ConnectionKeepAlive is sent periodically after accepting a connection.
    #[serde(rename = "ka")]
    ConnectionKeepAlive,
}

impl ServerMessage {
    /// Encodes the message into the text body of one WebSocket frame.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
