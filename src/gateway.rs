use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::auth::{self, AuthGate};
use crate::config::AtriumConfig;
use crate::correlator::RequestKind;
use crate::db::Db;
use crate::error::DispatchError;
use crate::hub::ConnectionHub;
use crate::oauth;
use crate::supervisor::ModuleHost;
use crate::users;

/// Shared state for every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AtriumConfig>,
    pub db: Arc<Db>,
    pub gate: Arc<AuthGate>,
    pub host: Arc<ModuleHost>,
    pub hub: Arc<ConnectionHub>,
    pub http: reqwest::Client,
}

/// Assemble the complete application router: the fixed auth/oauth/users/server
/// surfaces, the WebSocket upgrade, and a fallback that dispatches everything
/// else into the module plane.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/register", post(auth::register))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/verify", post(auth::verify))
        .route("/oauth/google/device", post(oauth::google_device))
        .route("/oauth/google/device/poll", post(oauth::google_device_poll))
        .route("/oauth/google/web", get(oauth::google_web))
        .route("/oauth/google/web/callback", get(oauth::google_web_callback))
        .route("/oauth/discord/web", get(oauth::discord_web))
        .route(
            "/oauth/discord/web/callback",
            get(oauth::discord_web_callback),
        )
        .route("/users/me", get(users::me))
        .route("/users/:id", get(users::get_user))
        .route("/users/:id/permissions", post(users::grant_permissions))
        .route(
            "/users/:id/permissions/:permission",
            delete(users::revoke_permission),
        )
        .route("/users/:id/ban", post(users::ban_user))
        .route("/server/info", get(server_info))
        .route("/server/modules", get(server_modules))
        .route("/ws", get(websocket_handler))
        .fallback(dispatch_module_route)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

fn cors_layer(config: &AtriumConfig) -> CorsLayer {
    if config.server.origin_whitelist.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .server
        .origin_whitelist
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}

/// GET /server/info
async fn server_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": "Atrium",
        "version": env!("CARGO_PKG_VERSION"),
        "modules": state.host.module_count(),
        "clients": state.hub.client_count(),
    }))
}

/// GET /server/modules
async fn server_modules(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "loaded": state.host.module_statuses(),
        "skipped": state.host.skipped_modules(),
    }))
}

/// Split a request path into `(module, module-relative path)`.
/// `/chat/history` -> `("chat", "/history")`;
/// `/@acme/beta/sync` -> `("@acme/beta", "/sync")`.
pub fn split_module_path(path: &str) -> Option<(String, String)> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;

    let module = if first.starts_with('@') {
        let second = segments.next()?;
        format!("{first}/{second}")
    } else {
        first.to_string()
    };

    let rest: Vec<&str> = segments.collect();
    let rest = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", rest.join("/"))
    };

    Some((module, rest))
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut object = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            object.insert(name.as_str().to_string(), json!(value));
        }
    }
    Value::Object(object)
}

fn query_to_json(query: Option<&str>) -> Value {
    let mut object = Map::new();
    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            object.insert(key.to_string(), json!(value));
        }
    }
    Value::Object(object)
}

/// The dynamic dispatch path: everything not claimed by a fixed route lands
/// here and is matched against module-registered routes.
async fn dispatch_module_route(
    State(state): State<AppState>,
    ConnectInfo(_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let method = request.method().as_str().to_string();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    let (module, rest) = match split_module_path(uri.path()) {
        Some(parts) => parts,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Not found" })),
            )
                .into_response()
        }
    };

    let route = match state.host.registry.lookup_route(&module, &method, &rest) {
        Some(route) => route,
        None => {
            // A discovered module whose instances are all gone answers 503;
            // a prefix nothing ever registered answers 404.
            if state.host.is_known_module(&module) && !state.host.has_live_instances(&module) {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "Module service unavailable", "module": module })),
                )
                    .into_response();
            }
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Not found" })),
            )
                .into_response();
        }
    };

    let is_multipart = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let body = match axum::body::to_bytes(request.into_body(), 32 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read request body: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Unreadable body" })),
            )
                .into_response();
        }
    };

    // Identity is attached when the bearer token checks out and otherwise
    // the request proceeds anonymously; routes that demand auth get a 401
    // before any module sees the request.
    let identity = state.gate.identity_from_headers(&state.db, &headers).await;
    if route.entry.requires_auth && identity.is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    let body_value: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };

    let mut payload = Map::new();
    payload.insert("query".to_string(), query_to_json(uri.query()));
    payload.insert(
        "params".to_string(),
        json!(route.params),
    );
    payload.insert("body".to_string(), body_value);
    payload.insert("headers".to_string(), headers_to_json(&headers));
    if let Some(identity) = &identity {
        payload.insert(
            "user".to_string(),
            serde_json::to_value(identity).expect("identity serialises"),
        );
    }

    // Sticky sessions: the authenticated user first, then an explicit
    // header, then round-robin.
    let shard_key = identity
        .as_ref()
        .map(|i| i.user_id.to_string())
        .or_else(|| {
            headers
                .get("x-shard-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        });

    let timeout = if is_multipart {
        Duration::from_secs(state.config.modules.upload_timeout_secs)
    } else {
        Duration::from_secs(state.config.modules.request_timeout_secs)
    };

    let reply = state
        .host
        .dispatch(
            &module,
            &route.entry.handler_id,
            Value::Object(payload),
            shard_key.as_deref(),
            RequestKind::Http,
            None,
            timeout,
        )
        .await;

    match reply {
        Ok(reply) => {
            let status = reply
                .status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            let content_type = reply
                .content_type
                .unwrap_or_else(|| "application/json".to_string());

            let body = if content_type.starts_with("application/json") {
                reply.payload.to_string()
            } else {
                match reply.payload {
                    Value::String(raw) => raw,
                    other => other.to_string(),
                }
            };

            Response::builder()
                .status(status)
                .header(axum::http::header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(DispatchError::Unavailable(module)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Module service unavailable", "module": module })),
        )
            .into_response(),
        Err(DispatchError::Timeout(module)) => {
            warn!("Request to module '{module}' timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": "Module request timed out", "module": module })),
            )
                .into_response()
        }
    }
}
