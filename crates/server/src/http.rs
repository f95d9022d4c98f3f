//! Tenant-facing HTTP surface: alert ingest, silences and status routes,
//! dispatched to the requesting tenant's engine, plus cluster status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use alertmux_common::alert::Alert;
use alertmux_engine::silence::Silence;
use alertmux_engine::Engine;

use crate::api::extract_user_id;
use crate::manager::Manager;

#[derive(Clone)]
pub struct TenantState {
    pub manager: Arc<Manager>,
}

/// Routes served under the external URL path prefix.
pub fn router(prefix: &str, state: TenantState) -> Router {
    let api = Router::new()
        .route("/api/v1/alerts", get(list_alerts).post(post_alerts))
        .route("/api/v1/silences", get(list_silences).post(create_silence))
        .route("/api/v1/silence/:id", axum::routing::delete(expire_silence))
        .route("/api/v1/status", get(tenant_status))
        .route("/multitenant/status", get(cluster_status))
        .with_state(state);
    if prefix.is_empty() || prefix == "/" {
        api
    } else {
        Router::new().nest(prefix.trim_end_matches('/'), api)
    }
}

type ApiError = (StatusCode, String);

async fn tenant_engine(
    state: &TenantState,
    headers: &HeaderMap,
) -> Result<Arc<Engine>, ApiError> {
    let user_id = extract_user_id(headers)?;
    state.manager.engine(&user_id).await.ok_or((
        StatusCode::NOT_FOUND,
        "no alertmanager for this user".to_string(),
    ))
}

async fn post_alerts(
    State(state): State<TenantState>,
    headers: HeaderMap,
    Json(alerts): Json<Vec<Alert>>,
) -> Result<StatusCode, ApiError> {
    let engine = tenant_engine(&state, &headers).await?;
    engine.post_alerts(alerts);
    Ok(StatusCode::OK)
}

async fn list_alerts(
    State(state): State<TenantState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let engine = tenant_engine(&state, &headers).await?;
    Ok(Json(engine.list_alerts()))
}

async fn create_silence(
    State(state): State<TenantState>,
    headers: HeaderMap,
    Json(silence): Json<Silence>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let engine = tenant_engine(&state, &headers).await?;
    let id = engine
        .create_silence(silence)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "silenceID": id })),
    ))
}

async fn list_silences(
    State(state): State<TenantState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Silence>>, ApiError> {
    let engine = tenant_engine(&state, &headers).await?;
    Ok(Json(engine.list_silences()))
}

async fn expire_silence(
    State(state): State<TenantState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let engine = tenant_engine(&state, &headers).await?;
    if engine.expire_silence(&id) {
        Ok(StatusCode::OK)
    } else {
        Err((StatusCode::NOT_FOUND, "silence not found".to_string()))
    }
}

async fn tenant_status(
    State(state): State<TenantState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine = tenant_engine(&state, &headers).await?;
    Ok(Json(engine.status()))
}

#[derive(Serialize)]
struct ClusterStatus {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    peers: Option<ClusterPeers>,
}

#[derive(Serialize)]
struct ClusterPeers {
    #[serde(rename = "self")]
    self_addr: String,
    members: Vec<String>,
}

async fn cluster_status(State(state): State<TenantState>) -> Json<ClusterStatus> {
    let status = match state.manager.peer() {
        None => ClusterStatus {
            status: "disabled",
            peers: None,
        },
        Some(peer) => ClusterStatus {
            status: "ready",
            peers: Some(ClusterPeers {
                self_addr: peer.self_address().to_string(),
                members: peer.members().to_vec(),
            }),
        },
    };
    Json(status)
}
