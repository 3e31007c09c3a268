use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::error::MembershipError;
use super::protocol::*;
use super::service::MembershipService;
use super::types::{Node, NodeId};

/// The membership endpoints, with the service attached as an extension.
pub fn router(service: Arc<MembershipService>) -> Router {
    Router::new()
        .route(ENDPOINT_PUSH_PULL, get(handle_push_pull))
        .route(ENDPOINT_LEAVE, put(handle_leave))
        .route(ENDPOINT_MEMBERS, get(handle_members))
        .route(ENDPOINT_MEMBERS_HISTORY, get(handle_members_history))
        .route(ENDPOINT_JOIN, get(handle_join))
        .route(ENDPOINT_DETECT, get(handle_detect))
        .route(
            ENDPOINT_GROUPS,
            put(handle_add_group).delete(handle_remove_group),
        )
        .route(ENDPOINT_ZONES, get(handle_zones))
        .route(ENDPOINT_ZONE, put(handle_change_zone))
        .route(ENDPOINT_GUESS, get(handle_guess))
        .route(ENDPOINT_NAME, get(handle_name))
        .route(ENDPOINT_UUID, get(handle_uuid))
        .route(ENDPOINT_EVENT, post(handle_stack_event))
        .route(ENDPOINT_EVENT_BY_TYPE, get(handle_get_event))
        .layer(Extension(service))
}

/// `Authorization: Bearer <token>` check for protected endpoints. Open when no token is set.
fn authorized(service: &MembershipService, headers: &HeaderMap) -> bool {
    let Some(token) = service.api_token() else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|given| given == token)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "missing or invalid api token".to_string(),
        }),
    )
        .into_response()
}

pub async fn handle_push_pull(
    Extension(service): Extension<Arc<MembershipService>>,
    Query(query): Query<PushPullQuery>,
) -> (StatusCode, Json<PushPullReply>) {
    let envelope: PushPullEnvelope = match serde_json::from_str(&query.msg) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!("Malformed push-pull message: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(PushPullReply::Refused(ErrorResponse {
                    error: format!("malformed push-pull message: {}", e),
                })),
            );
        }
    };

    if envelope.kind != PUSH_PULL_TYPE {
        return (
            StatusCode::BAD_REQUEST,
            Json(PushPullReply::Refused(ErrorResponse {
                error: format!("unexpected message type {}", envelope.kind),
            })),
        );
    }

    match service.answer_push_pull(envelope) {
        Ok(reply) => (StatusCode::OK, Json(PushPullReply::Accepted(reply))),
        Err(e @ MembershipError::UnauthorizedZone(_)) => (
            StatusCode::FORBIDDEN,
            Json(PushPullReply::Refused(ErrorResponse {
                error: e.to_string(),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(PushPullReply::Refused(ErrorResponse {
                error: e.to_string(),
            })),
        ),
    }
}

pub async fn handle_leave(
    Extension(service): Extension<Arc<MembershipService>>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Response {
    if !authorized(&service, &headers) {
        return unauthorized();
    }

    let Some(node) = service.registry().get(&NodeId::from(uuid.as_str())) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown node {}", uuid),
            }),
        )
            .into_response();
    };

    tracing::info!("Leave requested for node {} ({})", node.name, node.uuid);
    let success = service.set_leave(node, true);
    (StatusCode::OK, Json(SuccessResponse { success })).into_response()
}

pub async fn handle_members(
    Extension(service): Extension<Arc<MembershipService>>,
) -> Json<HashMap<NodeId, Node>> {
    Json((*service.registry().snapshot()).clone())
}

pub async fn handle_members_history(
    Extension(service): Extension<Arc<MembershipService>>,
) -> Response {
    match service.history().read() {
        Ok(batches) => (StatusCode::OK, Json(batches)).into_response(),
        Err(e) => {
            tracing::error!("Failed to read history: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

pub async fn handle_join(
    Extension(service): Extension<Arc<MembershipService>>,
    Path(hostport): Path<String>,
) -> (StatusCode, Json<JoinResponse>) {
    match service.push_pull(&hostport).await {
        Ok(nodes) => {
            tracing::info!("Joined {} ({} nodes)", hostport, nodes);
            (
                StatusCode::OK,
                Json(JoinResponse {
                    success: true,
                    nodes,
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::warn!("Join with {} failed: {}", hostport, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(JoinResponse {
                    success: false,
                    nodes: 0,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_detect(
    Extension(service): Extension<Arc<MembershipService>>,
    Query(query): Query<DetectQuery>,
) -> Response {
    let timeout = Duration::from_secs(query.timeout.unwrap_or(3));
    match service.detect(timeout).await {
        Ok(nodes) => (StatusCode::OK, Json(nodes)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn handle_add_group(
    Extension(service): Extension<Arc<MembershipService>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if !authorized(&service, &headers) {
        return unauthorized();
    }
    let success = service.add_group(&name);
    (StatusCode::OK, Json(SuccessResponse { success })).into_response()
}

pub async fn handle_remove_group(
    Extension(service): Extension<Arc<MembershipService>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if !authorized(&service, &headers) {
        return unauthorized();
    }
    let success = service.remove_group(&name);
    (StatusCode::OK, Json(SuccessResponse { success })).into_response()
}

pub async fn handle_zones(Extension(service): Extension<Arc<MembershipService>>) -> Response {
    Json(service.topology().get_zones()).into_response()
}

pub async fn handle_change_zone(
    Extension(service): Extension<Arc<MembershipService>>,
    headers: HeaderMap,
    Json(req): Json<ZoneChangeRequest>,
) -> Response {
    if !authorized(&service, &headers) {
        return unauthorized();
    }
    let success = service.change_zone(&req.zone);
    (StatusCode::OK, Json(SuccessResponse { success })).into_response()
}

pub async fn handle_guess(
    Extension(service): Extension<Arc<MembershipService>>,
    Path(name_or_uuid): Path<String>,
) -> Response {
    match service.guess(&name_or_uuid) {
        Some(node) => (StatusCode::OK, Json(node)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no node matches {}", name_or_uuid),
            }),
        )
            .into_response(),
    }
}

pub async fn handle_name(Extension(service): Extension<Arc<MembershipService>>) -> Json<String> {
    Json(service.myself().name)
}

pub async fn handle_uuid(Extension(service): Extension<Arc<MembershipService>>) -> Json<NodeId> {
    Json(service.uuid().clone())
}

pub async fn handle_stack_event(
    Extension(service): Extension<Arc<MembershipService>>,
    headers: HeaderMap,
    Json(req): Json<EventRequest>,
) -> Response {
    if !authorized(&service, &headers) {
        return unauthorized();
    }
    if req.event_type.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "event_type is required".to_string(),
            }),
        )
            .into_response();
    }
    let event = service.stack_event(json!({ "type": req.event_type }));
    (StatusCode::OK, Json(event)).into_response()
}

pub async fn handle_get_event(
    Extension(service): Extension<Arc<MembershipService>>,
    headers: HeaderMap,
    Path(event_type): Path<String>,
) -> Response {
    if !authorized(&service, &headers) {
        return unauthorized();
    }
    match service.events().find_by_type(&event_type) {
        Some(event) => (StatusCode::OK, Json(event)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no {} event", event_type),
            }),
        )
            .into_response(),
    }
}
