//! Admin API: CRUD over tenant configs, a thin router over the store. The
//! `X-AppsCode-UserID` header names the tenant on every request.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use alertmux_common::now_unix;
use alertmux_common::tenant::TenantConfig;

use crate::store::{ConfigStore, StoreError};

pub const USER_ID_HEADER: &str = "X-AppsCode-UserID";

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ConfigStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/config", get(get_config).post(set_config))
        .route("/api/v1/config/deactivate", delete(deactivate_config))
        .route("/api/v1/config/restore", post(restore_config))
        .with_state(state)
}

type ApiError = (StatusCode, String);

pub fn extract_user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "user id is not provided".to_string(),
        ))
}

fn store_error(user_id: &str, action: &str, e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound => (StatusCode::NOT_FOUND, "config not found".to_string()),
        other => {
            tracing::error!(user = %user_id, error = %other, "error {action} config");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

async fn get_config(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<TenantConfig>, ApiError> {
    let user_id = extract_user_id(&headers)?;
    let cfg = state
        .store
        .get_config(&user_id)
        .await
        .map_err(|e| store_error(&user_id, "getting", e))?;
    if cfg.is_zero() {
        return Err((StatusCode::NOT_FOUND, "config not found".to_string()));
    }
    Ok(Json(cfg))
}

async fn set_config(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(mut cfg): Json<TenantConfig>,
) -> Result<StatusCode, ApiError> {
    let user_id = extract_user_id(&headers)?;
    validate(&cfg).map_err(|reason| {
        tracing::warn!(user = %user_id, error = %reason, "invalid config submitted");
        (StatusCode::BAD_REQUEST, reason)
    })?;
    cfg.user_id = user_id.clone();
    cfg.updated_at = now_unix();
    state
        .store
        .set_config(&cfg)
        .await
        .map_err(|e| store_error(&user_id, "storing", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deactivate_config(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = extract_user_id(&headers)?;
    state
        .store
        .deactivate_config(&user_id)
        .await
        .map_err(|e| store_error(&user_id, "deactivating", e))?;
    tracing::info!(user = %user_id, "config deactivated");
    Ok(StatusCode::OK)
}

async fn restore_config(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = extract_user_id(&headers)?;
    state
        .store
        .restore_config(&user_id)
        .await
        .map_err(|e| store_error(&user_id, "restoring", e))?;
    tracing::info!(user = %user_id, "config restored");
    Ok(StatusCode::OK)
}

/// Reject configs that would be refused at apply time: the receiver config
/// must parse and every template file must compile.
fn validate(cfg: &TenantConfig) -> Result<(), String> {
    alertmux_engine::config::load(&cfg.config)
        .map_err(|e| format!("invalid receiver config: {e}"))?;
    let mut registry = handlebars::Handlebars::new();
    for (name, content) in &cfg.template_files {
        registry
            .register_template_string(name, content)
            .map_err(|e| format!("invalid template {name:?}: {e}"))?;
    }
    Ok(())
}
