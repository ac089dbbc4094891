//! Request handlers for the WebSocket and HTTP endpoints

pub mod http;
pub mod websocket;

use serde_json::json;
use std::convert::Infallible;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::core::server::ServerState;
use crate::error::PulseError;

pub use http::http_routes;
pub use websocket::ws_route;

/// Every route the server exposes
pub fn routes(state: ServerState) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    ws_route(state.clone()).or(http_routes(state)).unify()
}

/// Include the shared state in a request
pub fn with_state(state: ServerState) -> impl Filter<Extract = (ServerState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Status code for a rejected handshake or request
pub fn status_for(err: &PulseError) -> StatusCode {
    match err {
        PulseError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        PulseError::AuthError(_) => StatusCode::UNAUTHORIZED,
        PulseError::Forbidden(_) => StatusCode::FORBIDDEN,
        PulseError::RoomNotFound(_) | PulseError::NotFound(_) | PulseError::SessionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        PulseError::ValidationError(_)
        | PulseError::MessageParseError(_)
        | PulseError::MessageTooLarge(_) => StatusCode::BAD_REQUEST,
        PulseError::Conflict { .. } | PulseError::DuplicateSession(_) => StatusCode::CONFLICT,
        PulseError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON error body with a matching status; blocked clients also get `Retry-After`
pub fn error_reply(err: &PulseError) -> Box<dyn Reply> {
    let body = warp::reply::json(&json!({
        "error": err.code(),
        "message": err.to_string(),
    }));
    let reply = warp::reply::with_status(body, status_for(err));

    match err {
        PulseError::RateLimitExceeded { retry_after } => Box::new(warp::reply::with_header(
            reply,
            "Retry-After",
            retry_after.as_secs().max(1).to_string(),
        )),
        _ => Box::new(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&PulseError::RateLimitExceeded {
                retry_after: Duration::from_secs(5)
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(&PulseError::RoomNotFound("r".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&PulseError::AuthError("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&PulseError::Forbidden("x".into())), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_rate_limited_reply_carries_retry_after() {
        let reply = error_reply(&PulseError::RateLimitExceeded {
            retry_after: Duration::from_secs(42),
        });
        let response = reply.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
    }
}
