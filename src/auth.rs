use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Db, UserRecord};
use crate::gateway::AppState;

/// PBKDF2 parameters. Part of the stored-credential contract; changing them
/// invalidates every existing password hash.
const PBKDF2_ITERATIONS: u32 = 300_000;
const PBKDF2_OUTPUT_LEN: usize = 64;
const SALT_LEN: usize = 64;

/// Token lifetime: 12 hours.
const TOKEN_TTL_SECS: i64 = 12 * 60 * 60;

/// Sanitised user record attached to authenticated requests and injected
/// into WS payloads. Deliberately excludes the password hash, salt, and
/// last-seen IP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub permissions: Vec<String>,
}

impl Identity {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    username: String,
    ip: String,
    exp: i64,
}

/// Validates session tokens and password credentials, and mints new tokens.
pub struct AuthGate {
    secret: String,
    rng: ring::rand::SystemRandom,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            rng: ring::rand::SystemRandom::new(),
        }
    }

    /// Sign a session token for a user. HS256, 12 h expiry.
    pub fn issue_token(&self, username: &str, ip: &str) -> Result<String> {
        let claims = TokenClaims {
            username: username.to_string(),
            ip: ip.to_string(),
            exp: chrono::Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to sign token")
    }

    /// Cryptographically verify a token. Returns the embedded username on
    /// success; expired or tampered tokens return None.
    pub fn verify_token(&self, token: &str) -> Option<String> {
        decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()
        .map(|data| data.claims.username)
    }

    /// Verify a token and resolve it to the user it was issued to. The
    /// token must both verify and still be the user's current session token.
    pub async fn identity_from_token(&self, db: &Db, token: &str) -> Option<Identity> {
        self.verify_token(token)?;
        let user = db.find_user_by_token(token).await.ok()??;
        self.identity_for(db, &user).await.ok()
    }

    /// Extract and resolve a bearer token from request headers.
    pub async fn identity_from_headers(&self, db: &Db, headers: &HeaderMap) -> Option<Identity> {
        let token = bearer_token(headers)?;
        self.identity_from_token(db, &token).await
    }

    /// Build the sanitised envelope for a user row.
    pub async fn identity_for(&self, db: &Db, user: &UserRecord) -> Result<Identity> {
        let permissions = db.permissions_for(user.id).await?;
        Ok(Identity {
            user_id: user.id,
            username: user.username.clone(),
            permissions,
        })
    }

    /// 64 random bytes, base64-encoded.
    pub fn generate_salt(&self) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|_| anyhow::anyhow!("system RNG failure"))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(salt))
    }

    /// PBKDF2-HMAC-SHA512, 300 000 iterations, 64-byte output, hex-encoded.
    pub fn hash_password(&self, password: &str, salt_b64: &str) -> Result<String> {
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .context("stored salt is not valid base64")?;

        let mut out = [0u8; PBKDF2_OUTPUT_LEN];
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA512,
            NonZeroU32::new(PBKDF2_ITERATIONS).expect("iteration count is non-zero"),
            &salt,
            password.as_bytes(),
            &mut out,
        );
        Ok(hex::encode(out))
    }

    pub fn verify_password(&self, password: &str, salt_b64: &str, expected_hex: &str) -> bool {
        match self.hash_password(password, salt_b64) {
            Ok(computed) => {
                ring::constant_time::verify_slices_are_equal(
                    computed.as_bytes(),
                    expected_hex.as_bytes(),
                )
                .is_ok()
            }
            Err(_) => false,
        }
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

/// Username rule: `[A-Za-z0-9_]+`, length 3..=20.
pub fn valid_username(username: &str) -> bool {
    let len = username.chars().count();
    (3..=20).contains(&len)
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn valid_username_format(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Email rule: one `@`, no whitespace, a dot with content on both sides in
/// the domain part.
pub fn valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = match parts.next() {
        Some(domain) => domain,
        None => return false,
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

// ---------------------------------------------------------------------------
// /auth handlers
// ---------------------------------------------------------------------------

fn error_body(code: &str) -> Json<Value> {
    Json(json!({ "ok": false, "error": code }))
}

fn user_body(identity: &Identity, email: &str, token: Option<&str>) -> Value {
    let mut user = serde_json::to_value(identity).expect("identity serialises");
    let object = user.as_object_mut().expect("identity is an object");
    object.insert("email".to_string(), json!(email));
    if let Some(token) = token {
        object.insert("token".to_string(), json!(token));
    }
    user
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let username = body.get("username").and_then(Value::as_str);
    let password = body.get("password").and_then(Value::as_str);

    let (username, password) = match (username, password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u, p),
        _ => return (StatusCode::BAD_REQUEST, error_body("missingCredentials")),
    };

    let user = match state.db.find_user_by_username(username).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::UNAUTHORIZED, error_body("invalidCredentials")),
        Err(e) => {
            warn!("Login lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };

    if !state
        .gate
        .verify_password(password, &user.password_salt, &user.password_hash)
    {
        return (StatusCode::UNAUTHORIZED, error_body("invalidCredentials"));
    }

    match state.db.active_ban(user.id).await {
        Ok(Some(_)) => return (StatusCode::FORBIDDEN, error_body("banned")),
        Ok(None) => {}
        Err(e) => {
            warn!("Ban lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    }

    let ip = addr.ip().to_string();
    let token = match state.gate.issue_token(&user.username, &ip) {
        Ok(token) => token,
        Err(e) => {
            warn!("Token signing failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };

    if let Err(e) = state.db.record_login(user.id, &token, &ip).await {
        warn!("Failed to record login: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internalError"),
        );
    }

    let identity = match state.gate.identity_for(&state.db, &user).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Permission lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };

    info!("✅ User {} logged in from {}", user.username, ip);
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "user": user_body(&identity, &user.email, Some(&token)),
        })),
    )
}

/// POST /auth/register
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let field = |name: &str| {
        body.get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    };

    let username = match field("username") {
        Some(v) => v,
        None => return (StatusCode::BAD_REQUEST, error_body("usernameMissing")),
    };
    let password = match field("password") {
        Some(v) => v,
        None => return (StatusCode::BAD_REQUEST, error_body("passwordMissing")),
    };
    let repassword = match field("repassword") {
        Some(v) => v,
        None => return (StatusCode::BAD_REQUEST, error_body("repasswordMissing")),
    };
    let email = match field("email") {
        Some(v) => v,
        None => return (StatusCode::BAD_REQUEST, error_body("emailMissing")),
    };

    if !valid_email(email) {
        return (StatusCode::BAD_REQUEST, error_body("invalidEmail"));
    }
    if password != repassword {
        return (StatusCode::BAD_REQUEST, error_body("passwordsDontMatch"));
    }
    if !valid_username_format(username) {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalidUsernameFormat"),
        );
    }
    if !valid_username(username) {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalidUsernameLength"),
        );
    }

    match state.db.find_user_by_username(username).await {
        Ok(Some(_)) => return (StatusCode::BAD_REQUEST, error_body("usernameTaken")),
        Ok(None) => {}
        Err(e) => {
            warn!("Registration lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    }
    match state.db.find_user_by_email(email).await {
        Ok(Some(_)) => return (StatusCode::BAD_REQUEST, error_body("emailTaken")),
        Ok(None) => {}
        Err(e) => {
            warn!("Registration lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    }

    let salt = match state.gate.generate_salt() {
        Ok(salt) => salt,
        Err(e) => {
            warn!("Salt generation failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };
    let hash = match state.gate.hash_password(password, &salt) {
        Ok(hash) => hash,
        Err(e) => {
            warn!("Password hashing failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };

    let user = match state.db.insert_user(username, email, &hash, &salt).await {
        Ok(user) => user,
        Err(e) => {
            warn!("User insert failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internalError"),
            );
        }
    };

    let ip = addr.ip().to_string();
    let token = state.gate.issue_token(&user.username, &ip).ok();
    if let Some(token) = &token {
        let _ = state.db.record_login(user.id, token, &ip).await;
    }

    let identity = Identity {
        user_id: user.id,
        username: user.username.clone(),
        permissions: Vec::new(),
    };

    info!("👤 Registered new user {}", user.username);
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "user": user_body(&identity, &user.email, token.as_deref()),
        })),
    )
}

/// POST /auth/logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = bearer_token(&headers) {
        if let Err(e) = state.db.clear_token(&token).await {
            warn!("Logout failed: {e:#}");
        }
    }
    (StatusCode::OK, Json(json!({ "ok": true })))
}

/// POST /auth/verify — unlike the rest of the auth surface this endpoint
/// answers 401 on a bad token instead of continuing anonymously.
pub async fn verify(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let token = match bearer_token(&headers) {
        Some(token) => token,
        None => return (StatusCode::UNAUTHORIZED, error_body("invalidToken")),
    };

    match state.gate.identity_from_token(&state.db, &token).await {
        Some(identity) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "user": identity })),
        ),
        None => (StatusCode::UNAUTHORIZED, error_body("invalidToken")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_length_boundaries() {
        assert!(!valid_username("ab"));
        assert!(valid_username("abc"));
        assert!(valid_username("a2345678901234567890")); // 20 chars
        assert!(!valid_username("a23456789012345678901")); // 21 chars
        assert!(!valid_username("has space"));
        assert!(!valid_username("dash-ed"));
        assert!(valid_username("under_score_9"));
    }

    #[test]
    fn email_shapes() {
        assert!(valid_email("a@b.c"));
        assert!(valid_email("user.name@sub.domain.org"));
        assert!(!valid_email("no-at-sign"));
        assert!(!valid_email("two@@at.com"));
        assert!(!valid_email("spaces in@mail.com"));
        assert!(!valid_email("@missing.local"));
        assert!(!valid_email("user@nodot"));
        assert!(!valid_email("user@.leading"));
        assert!(!valid_email("user@trailing."));
    }

    #[test]
    fn password_hash_round_trip() {
        let gate = AuthGate::new("secret");
        let salt = gate.generate_salt().unwrap();

        // 64 bytes of salt, base64-encoded.
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&salt)
            .unwrap();
        assert_eq!(raw.len(), 64);

        let hash = gate.hash_password("hunter2", &salt).unwrap();
        // 64-byte derived key, hex-encoded.
        assert_eq!(hash.len(), 128);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        assert!(gate.verify_password("hunter2", &salt, &hash));
        assert!(!gate.verify_password("hunter3", &salt, &hash));
    }

    #[test]
    fn hashing_is_deterministic_per_salt() {
        let gate = AuthGate::new("secret");
        let salt = gate.generate_salt().unwrap();
        let a = gate.hash_password("pw", &salt).unwrap();
        let b = gate.hash_password("pw", &salt).unwrap();
        assert_eq!(a, b);

        let other_salt = gate.generate_salt().unwrap();
        assert_ne!(a, gate.hash_password("pw", &other_salt).unwrap());
    }

    #[test]
    fn pbkdf2_parameters_are_contractual() {
        assert_eq!(PBKDF2_ITERATIONS, 300_000);
        assert_eq!(PBKDF2_OUTPUT_LEN, 64);
        assert_eq!(SALT_LEN, 64);
    }

    #[test]
    fn token_round_trip() {
        let gate = AuthGate::new("secret");
        let token = gate.issue_token("alice", "10.0.0.1").unwrap();
        assert_eq!(gate.verify_token(&token).as_deref(), Some("alice"));

        // A different secret must reject the token.
        let other = AuthGate::new("other-secret");
        assert!(other.verify_token(&token).is_none());
        assert!(gate.verify_token("garbage").is_none());
    }

    #[test]
    fn identity_envelope_never_leaks_credentials() {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            username: "alice".to_string(),
            permissions: vec!["admin".to_string()],
        };

        let serialised = serde_json::to_string(&identity).unwrap();
        for forbidden in ["passwordHash", "passwordSalt", "lastIp"] {
            assert!(
                !serialised.contains(forbidden),
                "identity leaked {forbidden}"
            );
        }
        assert!(serialised.contains("userId"));
        assert!(serialised.contains("permissions"));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic abc".parse().unwrap(),
        );
        assert!(bearer_token(&headers).is_none());
    }
}
