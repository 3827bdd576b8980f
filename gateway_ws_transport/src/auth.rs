//! Session resolution for incoming connections.
//!
//! The actual credential verification lives outside this crate; the transport only calls
//! [`Authenticator::resolve`] with the headers collected at handshake and `connection_init` time,
//! and stores the result in the connection state.

use std::{collections::BTreeMap, time::SystemTime};

use async_trait::async_trait;
use derive_more::{Display, Error};
use http::HeaderMap;
use serde::Serialize;

/// The role a session acts under, e.g. `admin` or `user`.
#[derive(Clone, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct RoleName(pub String);

impl RoleName {
    /// Constructs a role name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// The resolved session variables (lowercase key/value pairs) of one session.
///
/// Kept sorted so projections of them are stable cache-key material.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SessionVariables(pub BTreeMap<String, String>);

impl SessionVariables {
    /// Returns the subset of variables named in `keys`, in sorted order.
    pub fn project(&self, keys: impl IntoIterator<Item = impl AsRef<str>>) -> BTreeMap<String, String> {
        keys.into_iter()
            .filter_map(|k| {
                let k = k.as_ref();
                self.0.get(k).map(|v| (k.to_owned(), v.clone()))
            })
            .collect()
    }
}

/// A resolved user identity, attached to the connection after a successful `connection_init`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UserInfo {
    /// The active role.
    pub role: RoleName,
    /// The session variables available to executors and the planner.
    pub session: SessionVariables,
}

/// Rejection produced by the authenticator. The formatted message is sent to the client in a
/// `connection_error` payload.
#[derive(Debug, Display, Error)]
#[display("{message}")]
pub struct AuthError {
    /// Human-readable rejection reason.
    #[error(not(source))]
    pub message: String,
}

impl AuthError {
    /// Constructs a rejection with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Resolves a user session from request headers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves the union of handshake and `connection_init` headers into a user identity and an
    /// optional token expiry instant. The connection is closed when the expiry is reached.
    async fn resolve(&self, headers: &HeaderMap)
        -> Result<(UserInfo, Option<SystemTime>), AuthError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_session_projection() {
        let session = SessionVariables(
            [
                ("x-role".to_owned(), "user".to_owned()),
                ("x-user-id".to_owned(), "42".to_owned()),
            ]
            .into(),
        );

        let projected = session.project(["x-user-id", "x-missing"]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("x-user-id").map(String::as_str), Some("42"));
    }
}
