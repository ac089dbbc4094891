//! WebSocket handshake and session task
//!
//! `GET /ws/{user_id}` upgrades to a WebSocket. A credential, when present,
//! is resolved through the identity verifier; failed verifications count
//! against the client's address in the failure rate limiter.

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::http::HeaderMap;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::constants::WS_PATH;
use crate::core::connection::{ChannelTransport, Transport, WebSocketInbound};
use crate::core::ip_extractor::client_key;
use crate::core::server::ServerState;
use crate::core::session::SessionIdentity;
use crate::error::PulseError;
use crate::handlers::{error_reply, with_state};

/// WebSocket route: `/ws/{user_id}`
pub fn ws_route(
    state: ServerState,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path(WS_PATH)
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(
            warp::query::<HashMap<String, String>>()
                .or(warp::any().map(HashMap::<String, String>::new))
                .unify(),
        )
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_state(state))
        .and_then(handle_upgrade)
}

/// Credential from the Authorization header, X-Auth-Token, or the `token` query parameter
pub fn extract_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(token) = header("authorization").and_then(|v| v.strip_prefix("Bearer ")) {
        debug!("Token extracted from Authorization header");
        return Some(token.trim().to_string());
    }
    if let Some(token) = header("x-auth-token") {
        debug!("Token extracted from X-Auth-Token header");
        return Some(token.to_string());
    }
    query
        .get("token")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

async fn handle_upgrade(
    user_id: String,
    ws: Ws,
    query: HashMap<String, String>,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    state: ServerState,
) -> Result<Box<dyn Reply>, Infallible> {
    let client = client_key(&headers, remote, state.config.trust_proxy_headers);

    if let Err(e) = state.rate_limiter.check(&client).await {
        warn!("Rejected handshake from blocked client {}", client);
        return Ok(error_reply(&e));
    }

    let identity = match resolve_identity(&state, &user_id, &client, &query, &headers).await {
        Ok(identity) => identity,
        Err(e) => return Ok(error_reply(&e)),
    };

    if !identity.authenticated {
        if let Some(live) = state.registry.session(&identity.session_key).await {
            if live.authenticated {
                warn!(
                    "Anonymous handshake from {} for {}, which has an authenticated session",
                    client, identity.session_key
                );
                return Ok(error_reply(&PulseError::DuplicateSession(identity.session_key)));
            }
        }
    }

    info!(
        "WebSocket upgrade for {} ({})",
        identity.session_key,
        if identity.authenticated { "authenticated" } else { "anonymous" }
    );
    Ok(Box::new(ws.on_upgrade(move |socket| handle_socket(socket, identity, state))))
}

async fn resolve_identity(
    state: &ServerState,
    user_id: &str,
    client: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<SessionIdentity, PulseError> {
    if user_id.trim().is_empty() {
        return Err(PulseError::ValidationError("user id must not be empty".to_string()));
    }

    let Some(token) = extract_token(headers, query) else {
        if state.config.allow_anonymous {
            return Ok(SessionIdentity::anonymous(user_id));
        }
        return Err(failed_attempt(state, client, "credential required").await);
    };

    match state.verifier.verify(&token).await {
        Ok(verified) if verified.user_id == user_id => {
            state.rate_limiter.record_success(client).await;
            Ok(SessionIdentity::authenticated(verified.user_id))
        }
        Ok(verified) => {
            warn!(
                "Token for {} presented on the path of {} from {}",
                verified.user_id, user_id, client
            );
            Err(failed_attempt(state, client, "token does not match user").await)
        }
        Err(e) => {
            debug!("Verification failed for {}: {}", client, e);
            Err(failed_attempt(state, client, "invalid credential").await)
        }
    }
}

/// Count a failed verification; the error says whether the client is now blocked
async fn failed_attempt(state: &ServerState, client: &str, reason: &str) -> PulseError {
    let verdict = state.rate_limiter.record_failure(client).await;
    match verdict.block_duration {
        Some(retry_after) if verdict.blocked => PulseError::RateLimitExceeded { retry_after },
        _ => PulseError::AuthError(reason.to_string()),
    }
}

/// Bridge the socket to the dispatcher: a writer task drains the outbound
/// channel while this task reads frames until the socket closes.
async fn handle_socket(ws: WebSocket, identity: SessionIdentity, state: ServerState) {
    let (mut ws_tx, ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let key = identity.session_key.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_tx.send(message).await {
                debug!("WebSocket write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(tx));
    let final_state = state
        .dispatcher
        .run_session(identity, transport, WebSocketInbound::new(ws_rx))
        .await;
    debug!("Session task for {} finished in state {:?}", key, final_state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::http::header::HeaderValue;

    #[test]
    fn test_token_sources_in_priority_order() {
        let mut query = HashMap::new();
        query.insert("token".to_string(), "from-query".to_string());

        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("from-query"));

        headers.insert("x-auth-token", HeaderValue::from_static("from-custom"));
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("from-custom"));

        headers.insert("authorization", HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("from-bearer"));

        assert_eq!(extract_token(&HeaderMap::new(), &HashMap::new()), None);
    }
}
