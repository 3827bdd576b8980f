//! Origin enforcement and header filtering at handshake time.
//!
//! This runs before the WebSocket upgrade is accepted. A rejected origin never opens a socket;
//! an accepted handshake retains a filtered header set that later becomes part of the headers
//! forwarded to upstream executors.

use std::collections::HashSet;

use derive_more::{Display, Error};
use http::{header, HeaderMap};

/// A set of origins allowed to connect.
#[derive(Clone, Debug, Default)]
pub struct Domains {
    /// Origins matched exactly, scheme included (e.g. `https://app.example.com`).
    pub exact: HashSet<String>,
    /// Wildcard host suffixes (e.g. `example.com` matches any `*.example.com` origin).
    pub wildcards: Vec<String>,
}

impl Domains {
    fn matches(&self, origin: &str) -> bool {
        if self.exact.contains(origin) {
            return true;
        }
        let host = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest)
            .split(':')
            .next()
            .unwrap_or_default();
        if self.exact.contains(host) {
            return true;
        }
        self.wildcards
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
    }
}

/// The configured cross-origin policy for WebSocket handshakes.
#[derive(Clone, Debug)]
pub enum CorsPolicy {
    /// Accept any origin and pass headers through untouched.
    AllowAll,
    /// CORS checks are turned off. When `read_cookie` is false the `Cookie` header is stripped
    /// from the retained set, since an unchecked origin must not be able to replay it.
    Disabled {
        /// Whether cookies may be read on unchecked origins.
        read_cookie: bool,
    },
    /// Only the listed origins may connect.
    AllowedOrigins(Domains),
}

/// Handshake rejection. Maps to HTTP 400 before the socket opens.
#[derive(Debug, Display, Error, Eq, PartialEq)]
pub enum CorsError {
    /// The `Origin` header did not match the configured allow-list.
    #[display("origin not allowed: {origin}")]
    OriginNotAllowed {
        /// The offending origin.
        #[error(not(source))]
        origin: String,
    },
    /// The policy requires an `Origin` header and none was sent.
    #[display("missing Origin header")]
    MissingOrigin,
}

/// Applies the origin policy to a handshake and returns the header set to retain.
pub fn enforce_cors(policy: &CorsPolicy, headers: &HeaderMap) -> Result<HeaderMap, CorsError> {
    let mut retained = headers.clone();
    match policy {
        CorsPolicy::AllowAll => {}
        CorsPolicy::Disabled { read_cookie } => {
            if !read_cookie && retained.remove(header::COOKIE).is_some() {
                tracing::info!(
                    target: "websocket",
                    "not reading cookie on unauthorized domain (CORS is disabled)"
                );
            }
        }
        CorsPolicy::AllowedOrigins(domains) => {
            let origin = headers
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .ok_or(CorsError::MissingOrigin)?;
            if !domains.matches(origin) {
                return Err(CorsError::OriginNotAllowed {
                    origin: origin.to_owned(),
                });
            }
        }
    }
    strip_upgrade_headers(&mut retained);
    Ok(retained)
}

/// Removes hop-by-hop and upgrade-only headers from the retained set. These describe the
/// handshake itself and must not be forwarded upstream.
fn strip_upgrade_headers(headers: &mut HeaderMap) {
    for name in [
        header::SEC_WEBSOCKET_KEY,
        header::SEC_WEBSOCKET_VERSION,
        header::UPGRADE,
        header::CONNECTION,
    ] {
        headers.remove(name);
    }
}
