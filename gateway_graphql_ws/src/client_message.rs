use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Clients routinely send `"variables": null` or `"payload": null` where the protocol means
/// "absent"; decode such `null`s as the field's [`Default`] instead of failing.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let decoded = Option::<T>::deserialize(deserializer)?;
    Ok(decoded.unwrap_or_default())
}

/// The payload for a client's "start" message. This triggers execution of a query, mutation, or
/// subscription.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    /// The document body.
    pub query: String,

    /// The optional variables.
    #[serde(default, deserialize_with = "null_as_default")]
    pub variables: Map<String, Value>,

    /// The optional operation name (required if the document contains multiple operations).
    pub operation_name: Option<String>,
}

/// The payload for a client's "connection_init" message.
///
/// Clients commonly carry credentials here; only the `headers` object is interpreted, everything
/// else is ignored.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InitPayload {
    /// Extra headers to authenticate with, unioned with the handshake headers. On duplicates these
    /// win.
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
}

/// ClientMessage defines the message types that clients can send.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// ConnectionInit is sent by the client upon connecting.
    ConnectionInit {
        /// Optional parameters sent from the client, often used for authentication.
        #[serde(default, deserialize_with = "null_as_default")]
        payload: InitPayload,
    },
    /// Start messages are used to execute a GraphQL operation.
    Start {
        /// The id of the operation. This can be anything, but must be unique. If there are other
        /// in-flight operations with the same id, the message will cause an error.
        id: String,

        /// The query, variables, and operation name.
        payload: StartPayload,
    },
    /// Stop messages are used to unsubscribe from a subscription.
    Stop {
        /// The id of the operation to stop.
        id: String,
    },
    /// ConnectionTerminate is used to terminate the connection.
    ConnectionTerminate,
}

impl ClientMessage {
    /// Decodes a message from the raw bytes of one WebSocket text frame.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deserialization() {
        assert_eq!(
            ClientMessage::ConnectionInit {
                payload: InitPayload {
                    headers: [("authorization".into(), "Bearer foo".into())].into(),
                },
            },
            serde_json::from_str(
                r#"{"type": "connection_init", "payload": {"headers": {"authorization": "Bearer foo"}}}"#
            )
            .unwrap(),
        );

        assert_eq!(
            ClientMessage::ConnectionInit {
                payload: InitPayload::default(),
            },
            serde_json::from_str(r#"{"type": "connection_init"}"#).unwrap(),
        );

        assert_eq!(
            ClientMessage::ConnectionInit {
                payload: InitPayload::default(),
            },
            serde_json::from_str(r#"{"type": "connection_init", "payload": null}"#).unwrap(),
        );

        assert_eq!(
            ClientMessage::Start {
                id: "foo".into(),
                payload: StartPayload {
                    query: "query MyQuery { __typename }".into(),
                    variables: serde_json::from_str(r#"{"foo": "bar"}"#).unwrap(),
                    operation_name: Some("MyQuery".into()),
                },
            },
            serde_json::from_str(
                r#"{"type": "start", "id": "foo", "payload": {
                "query": "query MyQuery { __typename }",
                "variables": {
                    "foo": "bar"
                },
                "operationName": "MyQuery"
            }}"#
            )
            .unwrap(),
        );

        assert_eq!(
            ClientMessage::Start {
                id: "foo".into(),
                payload: StartPayload {
                    query: "query MyQuery { __typename }".into(),
                    variables: Map::new(),
                    operation_name: None,
                },
            },
            serde_json::from_str(
                r#"{"type": "start", "id": "foo", "payload": {
                "query": "query MyQuery { __typename }"
            }}"#
            )
            .unwrap(),
        );

        assert_eq!(
            ClientMessage::Stop { id: "foo".into() },
            serde_json::from_str(r#"{"type": "stop", "id": "foo"}"#).unwrap(),
        );

        assert_eq!(
            ClientMessage::ConnectionTerminate,
            serde_json::from_str(r#"{"type": "connection_terminate"}"#).unwrap(),
        );
    }

    #[test]
    fn test_deserialization_of_null_variables() -> serde_json::Result<()> {
        let payload = r#"{"query":"query","variables":null}"#;
        let payload: StartPayload = serde_json::from_str(payload)?;

        let expected = StartPayload {
            query: "query".into(),
            variables: Map::new(),
            operation_name: None,
        };

        assert_eq!(expected, payload);

        Ok(())
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(ClientMessage::decode(br#"{"type": "subscribe", "id": "1"}"#).is_err());
        assert!(ClientMessage::decode(b"not json").is_err());
    }
}
