use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::AuthGate;
use crate::config::{AtriumConfig, ModuleSettings};
use crate::db::Db;
use crate::gateway::{self, AppState};
use crate::hub::ConnectionHub;
use crate::manifest::ManifestRegistry;
use crate::supervisor::ModuleHost;

/// Main server instance that wires and coordinates all subsystems.
pub struct AtriumServer {
    config: Arc<AtriumConfig>,
    state: AppState,
}

impl AtriumServer {
    /// Initialise every subsystem in dependency order: store, auth gate,
    /// module host, connection hub. Failures here are boot-fatal.
    pub async fn new(config: AtriumConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        info!("🗄️  Connecting to Postgres");
        let db = Arc::new(
            Db::connect(&config.database.url)
                .await
                .context("Database connection failed")?,
        );
        db.migrate().await.context("Database migration failed")?;

        let gate = Arc::new(AuthGate::new(&config.server.secret_key));

        // The env slice handed to every instance in its init message.
        let init_config = json!({
            "port": config.server.port,
            "modulesDir": config.modules.directory,
        });

        let host = ModuleHost::new(&config.modules.runtime, init_config, Some(db.clone()));

        let hub = ConnectionHub::new(
            host.clone(),
            gate.clone(),
            Some(db.clone()),
            Duration::from_secs(config.modules.request_timeout_secs),
        );
        host.set_client_sink(hub.clone());

        let state = AppState {
            config: config.clone(),
            db,
            gate,
            host,
            hub,
            http: reqwest::Client::new(),
        };

        Ok(Self { config, state })
    }

    /// Discover, sort, and spawn modules, then serve until interrupted.
    pub async fn run(&self) -> Result<()> {
        self.load_modules().await?;

        let addr = self.config.bind_address()?;
        let app = gateway::build_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!("🌐 Atrium listening on {addr}");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

        self.shutdown().await;
        Ok(())
    }

    /// Scan the modules root and spawn instances in dependency order. A
    /// cycle or duplicate name aborts the boot with no modules loaded.
    async fn load_modules(&self) -> Result<()> {
        let root = &self.config.modules.directory;
        info!("🔌 Scanning modules in {}", root.display());

        let registry = ManifestRegistry::scan(root)?;
        let order = registry.resolve_order()?;

        if !order.skipped.is_empty() {
            warn!("Skipping modules with unresolved dependencies: {:?}", order.skipped);
        }
        self.state.host.record_discovered(&registry.names());
        self.state.host.record_skipped(&order.skipped);

        let settings = ModuleSettings::load(root);

        for name in &order.sorted {
            let manifest = registry
                .get(name)
                .expect("sorted names come from the registry")
                .clone();
            let count = settings.instance_count(name);
            self.state.host.load_module(manifest, count).await;
        }

        info!(
            "✅ Module plane up: {} module(s) loaded, {} skipped",
            self.state.host.module_count(),
            order.skipped.len()
        );
        Ok(())
    }

    /// Graceful teardown: tell clients goodbye, then reap the children.
    async fn shutdown(&self) {
        info!("🛑 Shutting down");
        self.state.hub.close_all("server shutting down").await;
        self.state.host.shutdown();
        // Give instance monitors a moment to reap their children.
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("👋 Shutdown complete");
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C handler: {e}");
    }
}
