//! The query-result cache consulted before dispatching query plans.
//!
//! Keys combine the parsed request with the caller's role and the projection of the session
//! variables the request actually uses, so two sessions only share an entry when the response
//! could not differ between them.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    auth::{RoleName, UserInfo},
    plan::{GraphQLRequest, QueryPlan},
};

/// Cache key for one query response.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QueryCacheKey {
    /// The caller's role.
    pub role: RoleName,
    /// The session variables the plan references, projected out of the full session.
    pub session: BTreeMap<String, String>,
    /// The document body.
    pub query: String,
    /// The variables, in their serialized form.
    pub variables: String,
    /// The operation name, if any.
    pub operation_name: Option<String>,
}

impl QueryCacheKey {
    /// Builds the key for `request` as executed by `user` under `plan`.
    pub fn new(user: &UserInfo, request: &GraphQLRequest, plan: &QueryPlan) -> Self {
        Self {
            role: user.role.clone(),
            session: user.session.project(&plan.referenced_session_vars),
            query: request.query.clone(),
            variables: Value::Object(request.variables.clone()).to_string(),
            operation_name: request.operation_name.clone(),
        }
    }
}

/// Storage backend for cached query responses.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Returns the cached response for `key` if present and fresh.
    async fn lookup(&self, key: &QueryCacheKey) -> Option<Value>;

    /// Stores `response` under `key`. `ttl` comes from the plan's cache directive.
    async fn store(&self, key: QueryCacheKey, response: Value, ttl: Option<Duration>);
}

struct CacheEntry {
    response: Value,
    expires_at: Option<Instant>,
}

/// In-memory [`QueryCache`] with lazy TTL expiry.
#[derive(Default)]
pub struct InMemoryQueryCache {
    entries: Mutex<HashMap<QueryCacheKey, CacheEntry>>,
    default_ttl: Option<Duration>,
}

impl InMemoryQueryCache {
    /// Creates an empty cache whose entries never expire unless the plan says otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache with a default TTL for plans that do not carry one.
    pub fn with_default_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl: Some(ttl),
        }
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn lookup(&self, key: &QueryCacheKey) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at.is_none_or(|t| Instant::now() < t) => {
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn store(&self, key: QueryCacheKey, response: Value, ttl: Option<Duration>) {
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        self.entries.lock().await.insert(
            key,
            CacheEntry {
                response,
                expires_at,
            },
        );
    }
}
