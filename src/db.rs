use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row, TypeInfo};
use uuid::Uuid;

/// Schema bootstrap, applied at startup. Idempotent; failure is boot-fatal.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        passwordHash TEXT NOT NULL,
        passwordSalt TEXT NOT NULL,
        lastIp TEXT,
        lastToken TEXT,
        lastLogin TIMESTAMPTZ,
        createdAt TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS userPermissions (
        id UUID PRIMARY KEY,
        userId UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        permission TEXT NOT NULL,
        minrole TEXT,
        createdAt TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS oauthIdentities (
        id UUID PRIMARY KEY,
        userId UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        provider TEXT NOT NULL,
        providerId TEXT NOT NULL,
        UNIQUE (provider, providerId)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bans (
        id UUID PRIMARY KEY,
        userId UUID NOT NULL REFERENCES users(id),
        reason TEXT,
        bannedBy UUID,
        expiresAt TIMESTAMPTZ,
        permaban BOOLEAN NOT NULL DEFAULT false,
        bannedAt TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
];

/// Full user row. Internal only; never serialised. The identity envelope in
/// `auth` is the sanitised projection that actually leaves the process.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub password_salt: String,
    pub last_ip: Option<String>,
    pub last_token: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, username, email, passwordHash AS password_hash, \
     passwordSalt AS password_salt, lastIp AS last_ip, lastToken AS last_token, \
     lastLogin AS last_login, createdAt AS created_at";

/// Thin query interface over the relational store.
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    /// Apply the schema bootstrap.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Schema migration failed")?;
        }
        Ok(())
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up the user a session token was last issued to.
    pub async fn find_user_by_token(&self, token: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lastToken = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<UserRecord> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, username, email, passwordHash, passwordSalt) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(password_salt)
        .execute(&self.pool)
        .await?;

        self.find_user_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user vanished after insert"))
    }

    /// Record a successful login: rotate the session token, stamp the ip.
    pub async fn record_login(&self, user_id: Uuid, token: &str, ip: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET lastToken = $2, lastIp = $3, lastLogin = now() WHERE id = $1",
        )
        .bind(user_id)
        .bind(token)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Invalidate the stored session token.
    pub async fn clear_token(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE users SET lastToken = NULL WHERE lastToken = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn permissions_for(&self, user_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT permission FROM userPermissions WHERE userId = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("permission"))
            .collect())
    }

    /// Grant a permission. Idempotent: granting the same permission twice
    /// leaves exactly one row.
    pub async fn grant_permission(&self, user_id: Uuid, permission: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO userPermissions (id, userId, permission) \
             SELECT $1, $2, $3 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM userPermissions WHERE userId = $2 AND permission = $3 \
             )",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(permission)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_permission(&self, user_id: Uuid, permission: &str) -> Result<()> {
        sqlx::query("DELETE FROM userPermissions WHERE userId = $1 AND permission = $2")
            .bind(user_id)
            .bind(permission)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Is the user currently banned (permanent, or an unexpired timed ban)?
    pub async fn active_ban(&self, user_id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT reason FROM bans \
             WHERE userId = $1 AND (permaban OR expiresAt > now()) \
             ORDER BY bannedAt DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            r.get::<Option<String>, _>("reason")
                .unwrap_or_else(|| "banned".to_string())
        }))
    }

    pub async fn insert_ban(
        &self,
        user_id: Uuid,
        reason: Option<&str>,
        banned_by: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
        permaban: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO bans (id, userId, reason, bannedBy, expiresAt, permaban) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(reason)
        .bind(banned_by)
        .bind(expires_at)
        .bind(permaban)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Find the user behind an OAuth identity, creating both identity and
    /// user on first sight.
    pub async fn user_for_oauth_identity(
        &self,
        provider: &str,
        provider_id: &str,
        username_hint: &str,
        email: &str,
    ) -> Result<UserRecord> {
        let existing = sqlx::query(
            "SELECT userId FROM oauthIdentities WHERE provider = $1 AND providerId = $2",
        )
        .bind(provider)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let user_id: Uuid = row.get("userid");
            return self
                .find_user_by_id(user_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("oauth identity points at a missing user"));
        }

        // OAuth accounts carry no local password; store unusable credentials.
        let user = match self.find_user_by_email(email).await? {
            Some(user) => user,
            None => {
                let username = self.unique_username(username_hint).await?;
                self.insert_user(&username, email, "", "").await?
            }
        };

        sqlx::query(
            "INSERT INTO oauthIdentities (id, userId, provider, providerId) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (provider, providerId) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user.id)
        .bind(provider)
        .bind(provider_id)
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    async fn unique_username(&self, hint: &str) -> Result<String> {
        let base: String = hint
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .take(16)
            .collect();
        let base = if base.len() < 3 { "user".to_string() } else { base };

        if self.find_user_by_username(&base).await?.is_none() {
            return Ok(base);
        }
        for n in 1..1000 {
            let candidate = format!("{base}{n}");
            if self.find_user_by_username(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(anyhow::anyhow!("could not derive a unique username"))
    }

    /// Execute a module-proxied query: `{sql, params?}`. Rows come back as
    /// JSON objects keyed by column name.
    pub async fn run_module_query(&self, payload: &Value) -> Result<Value> {
        let sql = payload
            .get("sql")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("databaseQuery payload is missing 'sql'"))?;
        let params = payload
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut query = sqlx::query(sql);
        for param in &params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
                Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.clone()),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
        Ok(json!({ "rows": rows }))
    }
}

/// Best-effort decode of a row into JSON by column type name. Columns with
/// types this layer does not know about decode as null.
fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(idx)
                .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "UUID" => row
                .try_get::<Option<Uuid>, _>(idx)
                .map(|v| v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .map(|v| {
                    v.map(|t| Value::String(t.to_rfc3339()))
                        .unwrap_or(Value::Null)
                })
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(idx)
                .map(|v| v.unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };

        object.insert(column.name().to_string(), value);
    }

    Value::Object(object)
}
