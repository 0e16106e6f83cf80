use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::usage_limit::Principal;

/// Account tier of an authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Guest,
    Regular,
    Pro,
    Admin,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Guest => "guest",
            UserType::Regular => "regular",
            UserType::Pro => "pro",
            UserType::Admin => "admin",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
}

/// Static bearer-token table, keyed by token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsConfig {
    #[serde(default)]
    pub tokens: HashMap<String, Session>,
}

/// Maps request headers to an authenticated session, if there is one.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<Session>;
}

/// Resolves `Authorization: Bearer <token>` against a fixed token table
#[derive(Debug, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, Session>,
}

impl StaticTokenResolver {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            tokens: config.tokens.clone(),
        }
    }
}

impl SessionResolver for StaticTokenResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<Session> {
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim())
            .and_then(|s| s.strip_prefix("Bearer "))?;
        self.tokens.get(token.trim()).cloned()
    }
}

/// Who a request comes from: the session if authenticated, plus the client address
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub session: Option<Session>,
    pub client_ip: Option<IpAddr>,
}

impl RequestIdentity {
    /// The principal usage is charged to. A session always wins over the client IP.
    pub fn principal(&self) -> Result<Principal, Error> {
        match (&self.session, self.client_ip) {
            (Some(session), _) => Ok(Principal::User(session.id.clone())),
            (None, Some(ip)) => Ok(Principal::Ip(ip)),
            (None, None) => Err(Error::new(ErrorDetails::Unidentifiable)),
        }
    }

    /// Tier used for quota decisions; unauthenticated requests are guests
    pub fn user_type(&self) -> UserType {
        self.session
            .as_ref()
            .map(|s| s.user_type)
            .unwrap_or(UserType::Guest)
    }
}

/// Where the client address of a request is read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientIpSource {
    /// The socket peer address only
    #[default]
    Peer,
    /// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
    /// Only sound behind a proxy that overwrites these headers.
    ForwardedHeaders,
}

impl ClientIpSource {
    pub fn new(trust_forwarded_headers: bool) -> Self {
        if trust_forwarded_headers {
            ClientIpSource::ForwardedHeaders
        } else {
            ClientIpSource::Peer
        }
    }
}

/// Extract the client address according to `source`
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    source: ClientIpSource,
) -> Option<IpAddr> {
    if source == ClientIpSource::Peer {
        return peer.map(|addr| addr.ip());
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok());
    if real_ip.is_some() {
        return real_ip;
    }

    peer.map(|addr| addr.ip())
}

pub fn request_client_ip(request: &Request, source: ClientIpSource) -> Option<IpAddr> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip(request.headers(), peer, source)
}

/// Middleware that resolves the session and client IP once and stores them
/// as a `RequestIdentity` request extension.
pub async fn attach_session(
    State((resolver, ip_source)): State<(Arc<dyn SessionResolver>, ClientIpSource)>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = RequestIdentity {
        session: resolver.resolve(request.headers()),
        client_ip: request_client_ip(&request, ip_source),
    };
    debug!(
        user_type = %identity.user_type(),
        authenticated = identity.session.is_some(),
        "Resolved request identity"
    );
    request.extensions_mut().insert(identity);
    next.run(request).await
}
