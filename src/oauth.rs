use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::warn;

use crate::config::OAuthProviderConfig;
use crate::db::UserRecord;
use crate::gateway::AppState;

const GOOGLE_DEVICE_URL: &str = "https://oauth2.googleapis.com/device/code";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

const DISCORD_AUTH_URL: &str = "https://discord.com/api/oauth2/authorize";
const DISCORD_TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
const DISCORD_USER_URL: &str = "https://discord.com/api/users/@me";

fn error_body(code: &str) -> Json<Value> {
    Json(json!({ "ok": false, "error": code }))
}

/// Device-flow poll statuses map onto HTTP statuses so clients can poll with
/// plain fetch loops.
fn poll_status(error: &str) -> StatusCode {
    match error {
        "authorization_pending" => StatusCode::PRECONDITION_REQUIRED,
        "slow_down" => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Finish any provider flow: map the remote profile onto a local user and
/// mint a session.
async fn complete_login(
    state: &AppState,
    addr: SocketAddr,
    user: UserRecord,
) -> Result<Json<Value>, StatusCode> {
    let ip = addr.ip().to_string();
    let token = state
        .gate
        .issue_token(&user.username, &ip)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state
        .db
        .record_login(user.id, &token, &ip)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let identity = state
        .gate
        .identity_for(&state.db, &user)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut body = serde_json::to_value(&identity).expect("identity serialises");
    let object = body.as_object_mut().expect("identity is an object");
    object.insert("email".to_string(), json!(user.email));
    object.insert("token".to_string(), json!(token));

    Ok(Json(json!({ "ok": true, "user": body })))
}

fn google_config(state: &AppState) -> Option<OAuthProviderConfig> {
    state.config.oauth.google.clone()
}

fn discord_config(state: &AppState) -> Option<OAuthProviderConfig> {
    state.config.oauth.discord.clone()
}

/// POST /oauth/google/device — start a device-code flow.
pub async fn google_device(State(state): State<AppState>) -> impl IntoResponse {
    let provider = match google_config(&state) {
        Some(provider) => provider,
        None => return (StatusCode::BAD_REQUEST, error_body("providerNotConfigured")),
    };

    let response = state
        .http
        .post(GOOGLE_DEVICE_URL)
        .form(&[
            ("client_id", provider.client_id.as_str()),
            ("scope", "openid email profile"),
        ])
        .send()
        .await;

    match response {
        Ok(response) => match response.json::<Value>().await {
            Ok(body) => (StatusCode::OK, Json(body)),
            Err(e) => {
                warn!("Google device response was not JSON: {e}");
                (StatusCode::BAD_GATEWAY, error_body("providerError"))
            }
        },
        Err(e) => {
            warn!("Google device request failed: {e}");
            (StatusCode::BAD_GATEWAY, error_body("providerError"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DevicePollRequest {
    pub device_code: String,
}

/// POST /oauth/google/device/poll — poll for completion of a device flow.
pub async fn google_device_poll(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<DevicePollRequest>>,
) -> impl IntoResponse {
    let provider = match google_config(&state) {
        Some(provider) => provider,
        None => {
            return (StatusCode::BAD_REQUEST, error_body("providerNotConfigured"))
                .into_response()
        }
    };
    let Some(Json(body)) = body else {
        return (StatusCode::BAD_REQUEST, error_body("invalid_device_code")).into_response();
    };

    let response = state
        .http
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
            ("device_code", body.device_code.as_str()),
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
        ])
        .send()
        .await;

    let tokens: Value = match response {
        Ok(response) => match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Google token response was not JSON: {e}");
                return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response();
            }
        },
        Err(e) => {
            warn!("Google token request failed: {e}");
            return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response();
        }
    };

    if let Some(error) = tokens.get("error").and_then(Value::as_str) {
        return (poll_status(error), error_body(error)).into_response();
    }

    let access_token = match tokens.get("access_token").and_then(Value::as_str) {
        Some(token) => token.to_string(),
        None => return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response(),
    };

    match google_profile_login(&state, addr, &access_token).await {
        Ok(body) => body.into_response(),
        Err(status) => (status, error_body("providerError")).into_response(),
    }
}

async fn google_profile_login(
    state: &AppState,
    addr: SocketAddr,
    access_token: &str,
) -> Result<Json<Value>, StatusCode> {
    let profile: Value = state
        .http
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?
        .json()
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?;

    let provider_id = profile
        .get("id")
        .and_then(Value::as_str)
        .ok_or(StatusCode::BAD_GATEWAY)?;
    let email = profile
        .get("email")
        .and_then(Value::as_str)
        .ok_or(StatusCode::BAD_GATEWAY)?;
    let name = profile
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("user");

    let user = state
        .db
        .user_for_oauth_identity("google", provider_id, name, email)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    complete_login(state, addr, user).await
}

/// GET /oauth/google/web — redirect the browser into the code flow.
pub async fn google_web(State(state): State<AppState>) -> impl IntoResponse {
    let provider = match google_config(&state) {
        Some(provider) => provider,
        None => {
            return (StatusCode::BAD_REQUEST, error_body("providerNotConfigured"))
                .into_response()
        }
    };

    let url = format!(
        "{GOOGLE_AUTH_URL}?client_id={}&redirect_uri={}&response_type=code&scope=openid%20email%20profile",
        provider.client_id, provider.redirect_uri
    );
    Redirect::temporary(&url).into_response()
}

/// GET /oauth/google/web/callback?code=...
pub async fn google_web_callback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let provider = match google_config(&state) {
        Some(provider) => provider,
        None => {
            return (StatusCode::BAD_REQUEST, error_body("providerNotConfigured"))
                .into_response()
        }
    };
    let code = match params.get("code") {
        Some(code) => code.clone(),
        None => return (StatusCode::BAD_REQUEST, error_body("missingCode")).into_response(),
    };

    let tokens: Value = match state
        .http
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
        ])
        .send()
        .await
    {
        Ok(response) => match response.json().await {
            Ok(body) => body,
            Err(_) => {
                return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response()
            }
        },
        Err(_) => return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response(),
    };

    let access_token = match tokens.get("access_token").and_then(Value::as_str) {
        Some(token) => token.to_string(),
        None => return (StatusCode::UNAUTHORIZED, error_body("invalidCode")).into_response(),
    };

    match google_profile_login(&state, addr, &access_token).await {
        Ok(body) => body.into_response(),
        Err(status) => (status, error_body("providerError")).into_response(),
    }
}

/// GET /oauth/discord/web
pub async fn discord_web(State(state): State<AppState>) -> impl IntoResponse {
    let provider = match discord_config(&state) {
        Some(provider) => provider,
        None => {
            return (StatusCode::BAD_REQUEST, error_body("providerNotConfigured"))
                .into_response()
        }
    };

    let url = format!(
        "{DISCORD_AUTH_URL}?client_id={}&redirect_uri={}&response_type=code&scope=identify%20email",
        provider.client_id, provider.redirect_uri
    );
    Redirect::temporary(&url).into_response()
}

/// GET /oauth/discord/web/callback?code=...
pub async fn discord_web_callback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let provider = match discord_config(&state) {
        Some(provider) => provider,
        None => {
            return (StatusCode::BAD_REQUEST, error_body("providerNotConfigured"))
                .into_response()
        }
    };
    let code = match params.get("code") {
        Some(code) => code.clone(),
        None => return (StatusCode::BAD_REQUEST, error_body("missingCode")).into_response(),
    };

    let tokens: Value = match state
        .http
        .post(DISCORD_TOKEN_URL)
        .form(&[
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
        ])
        .send()
        .await
    {
        Ok(response) => match response.json().await {
            Ok(body) => body,
            Err(_) => {
                return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response()
            }
        },
        Err(_) => return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response(),
    };

    let access_token = match tokens.get("access_token").and_then(Value::as_str) {
        Some(token) => token.to_string(),
        None => return (StatusCode::UNAUTHORIZED, error_body("invalidCode")).into_response(),
    };

    let profile: Value = match state
        .http
        .get(DISCORD_USER_URL)
        .bearer_auth(&access_token)
        .send()
        .await
    {
        Ok(response) => match response.json().await {
            Ok(body) => body,
            Err(_) => {
                return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response()
            }
        },
        Err(_) => return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response(),
    };

    let provider_id = match profile.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response(),
    };
    let email = match profile.get("email").and_then(Value::as_str) {
        Some(email) => email.to_string(),
        None => return (StatusCode::BAD_GATEWAY, error_body("providerError")).into_response(),
    };
    let name = profile
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or("user")
        .to_string();

    let user = match state
        .db
        .user_for_oauth_identity("discord", &provider_id, &name, &email)
        .await
    {
        Ok(user) => user,
        Err(e) => {
            warn!("Discord identity mapping failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            )
                .into_response();
        }
    };

    match complete_login(&state, addr, user).await {
        Ok(body) => body.into_response(),
        Err(status) => (status, error_body("internalError")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_status_mapping() {
        assert_eq!(
            poll_status("authorization_pending"),
            StatusCode::PRECONDITION_REQUIRED
        );
        assert_eq!(poll_status("slow_down"), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(poll_status("invalid_device_code"), StatusCode::BAD_REQUEST);
        assert_eq!(poll_status("expired_token"), StatusCode::BAD_REQUEST);
    }
}
