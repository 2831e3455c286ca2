use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::auth::Identity;
use crate::gateway::AppState;

fn error_body(code: &str) -> Json<Value> {
    Json(json!({ "ok": false, "error": code }))
}

/// Admin gate. Forbidden access answers 404, not 403, so the surface does
/// not reveal which endpoints exist.
async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Identity, StatusCode> {
    match state.gate.identity_from_headers(&state.db, headers).await {
        Some(identity) if identity.has_permission("admin") => Ok(identity),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /users/me
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    match state.gate.identity_from_headers(&state.db, &headers).await {
        Some(identity) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "user": identity })),
        ),
        None => (StatusCode::UNAUTHORIZED, error_body("invalidToken")),
    }
}

/// GET /users/:id — admin only.
pub async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    if let Err(status) = require_admin(&state, &headers).await {
        return (status, error_body("notFound"));
    }

    let user = match state.db.find_user_by_id(id).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::NOT_FOUND, error_body("notFound")),
        Err(e) => {
            warn!("User lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };

    let permissions = state.db.permissions_for(user.id).await.unwrap_or_default();

    // The sanitised projection only; hashes, salts, and IPs stay put.
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "user": {
                "userId": user.id,
                "username": user.username,
                "email": user.email,
                "permissions": permissions,
                "lastLogin": user.last_login,
                "createdAt": user.created_at,
            },
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub permissions: Vec<String>,
}

/// POST /users/:id/permissions — admin only, idempotent per permission.
pub async fn grant_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<GrantRequest>>,
) -> impl IntoResponse {
    if let Err(status) = require_admin(&state, &headers).await {
        return (status, error_body("notFound"));
    }
    let Some(Json(body)) = body else {
        return (StatusCode::BAD_REQUEST, error_body("missingPermissions"));
    };

    match state.db.find_user_by_id(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, error_body("notFound")),
        Err(e) => {
            warn!("User lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    }

    for permission in &body.permissions {
        if let Err(e) = state.db.grant_permission(id, permission).await {
            warn!("Grant failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    }

    let permissions = state.db.permissions_for(id).await.unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "permissions": permissions })),
    )
}

/// DELETE /users/:id/permissions/:permission — admin only.
pub async fn revoke_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, permission)): Path<(Uuid, String)>,
) -> impl IntoResponse {
    if let Err(status) = require_admin(&state, &headers).await {
        return (status, error_body("notFound"));
    }

    if let Err(e) = state.db.revoke_permission(id, &permission).await {
        warn!("Revoke failed: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internalError"),
        );
    }

    let permissions = state.db.permissions_for(id).await.unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "permissions": permissions })),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permaban: bool,
}

/// POST /users/:id/ban — admin only.
pub async fn ban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<BanRequest>>,
) -> impl IntoResponse {
    let admin = match require_admin(&state, &headers).await {
        Ok(admin) => admin,
        Err(status) => return (status, error_body("notFound")),
    };

    let body = body.map(|Json(b)| b).unwrap_or(BanRequest {
        reason: None,
        expires_at: None,
        permaban: false,
    });

    match state.db.find_user_by_id(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, error_body("notFound")),
        Err(e) => {
            warn!("User lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    }

    if let Err(e) = state
        .db
        .insert_ban(
            id,
            body.reason.as_deref(),
            Some(admin.user_id),
            body.expires_at,
            body.permaban,
        )
        .await
    {
        warn!("Ban insert failed: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internalError"),
        );
    }

    (StatusCode::OK, Json(json!({ "ok": true })))
}
