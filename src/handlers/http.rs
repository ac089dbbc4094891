//! Thin JSON endpoints over the core operations
//!
//! Claims, joins and leaves go through the same dispatcher operations as the
//! WebSocket commands, so both surfaces share one code path.

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use warp::http::HeaderMap;
use warp::{Filter, Rejection, Reply};

use crate::core::collectible::ClaimReport;
use crate::core::position::PositionRecord;
use crate::core::server::ServerState;
use crate::error::{PulseError, Result};
use crate::handlers::websocket::extract_token;
use crate::handlers::{error_reply, with_state};

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub collectible_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MembershipRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct LocationEntry {
    user_id: String,
    #[serde(flatten)]
    position: PositionRecord,
}

/// All HTTP routes
pub fn http_routes(
    state: ServerState,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    health(state.clone())
        .or(locations(state.clone()))
        .unify()
        .or(claim(state.clone()))
        .unify()
        .or(active_collectibles(state.clone()))
        .unify()
        .or(user_collectibles(state.clone()))
        .unify()
        .or(join_event(state.clone()))
        .unify()
        .or(leave_event(state))
        .unify()
}

/// `GET /health`
fn health(state: ServerState) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .and(with_state(state))
        .and_then(|state: ServerState| async move {
            let stats = state.registry.stats().await;
            let storage_ok = state.storage.health_check().await.unwrap_or(false);
            let reply: Box<dyn Reply> = Box::new(warp::reply::json(&json!({
                "status": if storage_ok { "healthy" } else { "degraded" },
                "storage": storage_ok,
                "registry": stats,
                "timestamp": Utc::now(),
            })));
            Ok::<_, Infallible>(reply)
        })
}

/// `GET /api/locations`
fn locations(state: ServerState) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("api" / "locations")
        .and(warp::get())
        .and(with_state(state))
        .and_then(|state: ServerState| async move {
            let mut entries: Vec<LocationEntry> = state
                .registry
                .snapshot_positions()
                .await
                .into_iter()
                .map(|(user_id, position)| LocationEntry { user_id, position })
                .collect();
            entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));

            let reply: Box<dyn Reply> = Box::new(warp::reply::json(&json!({
                "count": entries.len(),
                "locations": entries,
            })));
            Ok::<_, Infallible>(reply)
        })
}

/// `POST /api/collectibles/claim`
fn claim(state: ServerState) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("api" / "collectibles" / "claim")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(
            |headers: HeaderMap, request: ClaimRequest, state: ServerState| async move {
                let reply = match claim_for(&state, &headers, request).await {
                    Ok(report) => Box::new(warp::reply::json(&report)) as Box<dyn Reply>,
                    Err(e) => error_reply(&e),
                };
                Ok::<_, Infallible>(reply)
            },
        )
}

async fn claim_for(state: &ServerState, headers: &HeaderMap, request: ClaimRequest) -> Result<ClaimReport> {
    let user_id = resolve_caller(state, headers, request.user_id).await?;
    let outcome = state
        .dispatcher
        .claim_and_announce(&user_id, &request.collectible_id)
        .await?;
    Ok(ClaimReport::from(&outcome))
}

/// `GET /api/collectibles/active/{room_id}`
fn active_collectibles(
    state: ServerState,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("api" / "collectibles" / "active" / String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(|room_id: String, state: ServerState| async move {
            let reply = match state.engine.active_for_room(&room_id).await {
                Ok(collectibles) => Box::new(warp::reply::json(&json!({
                    "room_id": room_id,
                    "count": collectibles.len(),
                    "collectibles": collectibles,
                }))) as Box<dyn Reply>,
                Err(e) => error_reply(&e),
            };
            Ok::<_, Infallible>(reply)
        })
}

/// `GET /api/users/{user_id}/collectibles`
fn user_collectibles(
    state: ServerState,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("api" / "users" / String / "collectibles")
        .and(warp::get())
        .and(with_state(state))
        .and_then(|user_id: String, state: ServerState| async move {
            let reply = match state.engine.user_inventory(&user_id).await {
                Ok(items) => Box::new(warp::reply::json(&json!({
                    "user_id": user_id,
                    "count": items.len(),
                    "collectibles": items,
                }))) as Box<dyn Reply>,
                Err(e) => error_reply(&e),
            };
            Ok::<_, Infallible>(reply)
        })
}

/// `POST /api/events/{room_id}/join`
fn join_event(state: ServerState) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("api" / "events" / String / "join")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(membership_body())
        .and(with_state(state))
        .and_then(
            |room_id: String, headers: HeaderMap, request: MembershipRequest, state: ServerState| async move {
                let result = async {
                    let user_id = resolve_caller(&state, &headers, request.user_id).await?;
                    let outcome = state.dispatcher.join_room(&user_id, &room_id).await?;
                    Ok::<_, PulseError>(json!({
                        "success": true,
                        "room_id": room_id,
                        "user_id": user_id,
                        "role": outcome.role,
                        "newly_joined": outcome.newly_joined,
                        "live": outcome.live,
                    }))
                }
                .await;
                Ok::<_, Infallible>(json_or_error(result))
            },
        )
}

/// `POST /api/events/{room_id}/leave`
fn leave_event(state: ServerState) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Rejection> + Clone {
    warp::path!("api" / "events" / String / "leave")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(membership_body())
        .and(with_state(state))
        .and_then(
            |room_id: String, headers: HeaderMap, request: MembershipRequest, state: ServerState| async move {
                let result = async {
                    let user_id = resolve_caller(&state, &headers, request.user_id).await?;
                    let left = state.dispatcher.leave_room(&user_id, &room_id).await?;
                    Ok::<_, PulseError>(json!({
                        "success": true,
                        "room_id": room_id,
                        "user_id": user_id,
                        "was_live_member": left,
                    }))
                }
                .await;
                Ok::<_, Infallible>(json_or_error(result))
            },
        )
}

/// JSON body, or an empty request when no body was sent
fn membership_body() -> impl Filter<Extract = (MembershipRequest,), Error = Infallible> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES)
        .and(warp::body::json())
        .or(warp::any().map(MembershipRequest::default))
        .unify()
}

fn json_or_error(result: Result<serde_json::Value>) -> Box<dyn Reply> {
    match result {
        Ok(body) => Box::new(warp::reply::json(&body)),
        Err(e) => error_reply(&e),
    }
}

/// The acting user: a verified token wins; otherwise the id in the body when
/// anonymous access is allowed
async fn resolve_caller(state: &ServerState, headers: &HeaderMap, claimed: Option<String>) -> Result<String> {
    let no_query = Default::default();
    if let Some(token) = extract_token(headers, &no_query) {
        let verified = state.verifier.verify(&token).await?;
        debug!("HTTP caller verified as {}", verified.user_id);
        return Ok(verified.user_id);
    }

    match claimed.filter(|id| !id.trim().is_empty()) {
        Some(user_id) if state.config.allow_anonymous => Ok(user_id),
        Some(_) => Err(PulseError::AuthError("credential required".to_string())),
        None => Err(PulseError::ValidationError("user_id is required".to_string())),
    }
}
