use serde::Serialize;
use serde_json::{Map, Value};

/// One GraphQL error as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,

    /// The path to the response field the error is associated with, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    /// Additional machine-readable information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    /// Creates an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Attaches a response path to the error.
    #[must_use]
    pub fn with_path(mut self, path: Vec<Value>) -> Self {
        self.path = Some(path);
        self
    }

    /// Attaches an extensions object to the error.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

/// How pre-execution errors are rendered in `error` message payloads.
///
/// The style is fixed per connection at handshake, from the URL path the client connected on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorStyle {
    /// The payload is the bare error object.
    Legacy,
    /// The payload is `{"errors": [...]}` per the GraphQL over HTTP spec.
    Compliant,
}

impl ErrorStyle {
    /// Renders one error into an `error` message payload.
    pub fn render(&self, error: &GraphQLError) -> Value {
        let obj = serde_json::to_value(error).unwrap_or_else(|_| {
            Value::String("failed to serialize error".into())
        });
        match self {
            Self::Legacy => obj,
            Self::Compliant => serde_json::json!({ "errors": [obj] }),
        }
    }
}
