//! AdminHandler - Status, dashboard stats and tunnel-user administration
//!
//! Everything here is served on hosts outside the tunnel domain. `/api/v1` is
//! guarded by a bearer token when one is configured.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use warren_common::{StatsSnapshot, TunnelUser};

use super::connect::handle_connect;
use crate::AppState;
use crate::error_handling::json_error;
use crate::users::UserError;

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        json_error(StatusCode::BAD_REQUEST, self.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretKeyResponse {
    pub secret_key: String,
}

/// Router for every non-tunnel host
pub fn admin_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/stats", get(stats))
        .route(
            "/tunnel-users",
            get(list_users).post(create_user).put(rotate_secret),
        )
        .route("/tunnel-users/{id}", delete(delete_user))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    Router::new()
        .route("/status", get(status))
        .route("/register", get(handle_connect))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn require_admin_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if token_matches(presented, expected) {
        next.run(request).await
    } else {
        warn!("Rejected admin request to {} without a valid token", request.uri().path());
        json_error(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

/// Compare in constant time so response timing does not reveal the token
fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
}

pub async fn status() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

pub async fn list_users(State(state): State<AppState>) -> Json<Vec<TunnelUser>> {
    Json(state.users.list())
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<UserRequest>,
) -> Result<Json<SecretKeyResponse>, UserError> {
    let user = state.users.create(body.email.trim())?;
    info!("Created tunnel user {} ({})", user.id, user.email);
    Ok(Json(SecretKeyResponse {
        secret_key: user.secret_key,
    }))
}

pub async fn rotate_secret(
    State(state): State<AppState>,
    Json(body): Json<UserRequest>,
) -> Result<Json<SecretKeyResponse>, UserError> {
    let user = state.users.rotate_secret(body.email.trim())?;
    info!("Rotated secret key of tunnel user {}", user.id);
    Ok(Json(SecretKeyResponse {
        secret_key: user.secret_key,
    }))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, UserError> {
    state.users.delete(id)?;
    info!("Deleted tunnel user {}", id);
    Ok(Json(json!({ "message": "ok" })))
}
