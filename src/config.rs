use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Complete Atrium server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AtriumConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

impl AtriumConfig {
    /// Load configuration from a TOML file with environment variable
    /// overrides. A missing file is not an error; defaults plus environment
    /// are enough to boot.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            let config_str = std::fs::read_to_string(&path).with_context(|| {
                format!("Failed to read config file: {}", path.as_ref().display())
            })?;
            toml::from_str(&config_str).context("Failed to parse configuration file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PG_URL") {
            self.database.url = url;
        }

        if let Ok(secret) = std::env::var("SECRET_KEY") {
            self.server.secret_key = secret;
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(whitelist) = std::env::var("ORIGIN_WHITELIST") {
            self.server.origin_whitelist = whitelist
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(dir) = std::env::var("ATRIUM_MODULES_DIR") {
            self.modules.directory = PathBuf::from(dir);
        }

        if let Some(google) = OAuthProviderConfig::from_env("GOOGLE") {
            self.oauth.google = Some(google);
        }
        if let Some(discord) = OAuthProviderConfig::from_env("DISCORD") {
            self.oauth.discord = Some(discord);
        }
    }

    /// Validate the configuration. An unusable secret is boot-fatal.
    pub fn validate(&self) -> Result<()> {
        if self.server.secret_key.is_empty() {
            return Err(anyhow::anyhow!(
                "SECRET_KEY is not set; refusing to sign tokens with an empty secret"
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port must be non-zero"));
        }

        self.bind_address()
            .context("Invalid bind address derived from host/port")?;

        Ok(())
    }

    /// The socket address the HTTP listener binds to.
    pub fn bind_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(Into::into)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the listener to.
    pub host: String,

    /// HTTP/WebSocket port.
    pub port: u16,

    /// Shared secret for token signing. Must be provided via config file or
    /// the `SECRET_KEY` environment variable.
    #[serde(default)]
    pub secret_key: String,

    /// Allowed CORS origins. Empty means permissive.
    #[serde(default)]
    pub origin_whitelist: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            secret_key: String::new(),
            origin_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Postgres connection URL (`PG_URL`).
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Root directory scanned for module manifests.
    pub directory: PathBuf,

    /// Command used to launch module entry points.
    pub runtime: String,

    /// Per-request reply deadline in seconds.
    pub request_timeout_secs: u64,

    /// Reply deadline for multipart uploads in seconds.
    pub upload_timeout_secs: u64,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            directory: PathBuf::from(home).join(".atrium").join("modules"),
            runtime: "node".to_string(),
            request_timeout_secs: 5,
            upload_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthConfig {
    pub google: Option<OAuthProviderConfig>,
    pub discord: Option<OAuthProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl OAuthProviderConfig {
    /// Build a provider config from `<PREFIX>_CLIENT_ID/_CLIENT_SECRET/_REDIRECT`.
    /// Returns None unless all three are present.
    fn from_env(prefix: &str) -> Option<Self> {
        let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
        let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
        let redirect_uri = std::env::var(format!("{prefix}_REDIRECT")).ok()?;
        Some(Self {
            client_id,
            client_secret,
            redirect_uri,
        })
    }
}

/// Operator settings stored alongside the modules themselves
/// (`<modules>/settings.json`). Currently carries per-module instance counts.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModuleSettings {
    #[serde(default, rename = "loadBalancing")]
    pub load_balancing: HashMap<String, usize>,
}

impl ModuleSettings {
    /// Load settings from the modules root. A missing or malformed file is
    /// not fatal; it just means every module gets one instance.
    pub fn load(modules_dir: &Path) -> Self {
        let path = modules_dir.join("settings.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Configured instance count for a module, defaulting to 1.
    pub fn instance_count(&self, module: &str) -> usize {
        self.load_balancing.get(module).copied().unwrap_or(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_port() {
        let config = AtriumConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.modules.request_timeout_secs, 5);
        assert_eq!(config.modules.upload_timeout_secs, 30);
    }

    #[test]
    fn validate_rejects_empty_secret() {
        let config = AtriumConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_secret() {
        let mut config = AtriumConfig::default();
        config.server.secret_key = "s3cret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn instance_count_defaults_to_one() {
        let settings = ModuleSettings::default();
        assert_eq!(settings.instance_count("anything"), 1);
    }

    #[test]
    fn instance_count_reads_load_balancing_key() {
        let settings: ModuleSettings =
            serde_json::from_str(r#"{"loadBalancing": {"chat": 3, "zero": 0}}"#).unwrap();
        assert_eq!(settings.instance_count("chat"), 3);
        // A configured zero still spawns one instance.
        assert_eq!(settings.instance_count("zero"), 1);
    }
}
