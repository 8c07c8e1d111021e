use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, Request},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Remote address of a request, when the server was started with connect
/// info. Inserted into the request extensions by the connection gate.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<SocketAddr>);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => addr.fmt(f),
            None => f.write_str("unknown"),
        }
    }
}

fn peer_addr(req: &Request) -> PeerAddr {
    PeerAddr(
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
    )
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Extract the `?auth=` value from the query string, percent-decoded.
fn extract_query_secret(req: &Request) -> Option<String> {
    Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove("auth"))
}

fn matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Bearer-token middleware for the REST API.
pub async fn require_auth(
    expected_token: Arc<str>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_bearer(&req) {
        Some(token) if matches(&token, &expected_token) => Ok(next.run(req).await),
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

/// Connection gate for the control socket.
///
/// The secret travels in the handshake as `?auth=<secret>` (a Bearer header
/// is accepted too, for clients that can set one). Rejection happens before
/// the upgrade, so no connection identity or session ever exists for a
/// rejected peer. Accepts and rejects are both logged with the peer address.
pub async fn require_connection_secret(
    expected: Arc<str>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = peer_addr(&req);
    let presented = extract_query_secret(&req).or_else(|| extract_bearer(&req));

    match presented {
        Some(secret) if matches(&secret, &expected) => {
            tracing::info!(%peer, "control connection admitted");
            req.extensions_mut().insert(peer);
            Ok(next.run(req).await)
        }
        Some(_) => {
            tracing::warn!(%peer, "control connection rejected: invalid secret");
            Err(ApiError::AuthInvalid)
        }
        None => {
            tracing::warn!(%peer, "control connection rejected: no secret");
            Err(ApiError::AuthRequired)
        }
    }
}
