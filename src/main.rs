use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atrium::config::AtriumConfig;
use atrium::manifest::ManifestRegistry;
use atrium::server::AtriumServer;

#[derive(Parser)]
#[command(name = "atrium")]
#[command(about = "Atrium - pluggable real-time application server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "atrium.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override the modules root directory
    #[arg(short, long)]
    modules_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate configuration
    CheckConfig {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Module management
    Modules {
        #[command(subcommand)]
        action: ModuleCommands,
    },
}

#[derive(Subcommand)]
enum ModuleCommands {
    /// List discovered modules in load order
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Failed to initialise logging: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        // Crash banner: boot-fatal conditions land here.
        error!("FATAL: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AtriumConfig::load(&cli.config).context("Failed to load configuration")?;
    if let Some(dir) = cli.modules_dir {
        config.modules.directory = dir;
    }

    match cli.command {
        Some(Commands::Start { port }) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            start_server(config).await
        }

        Some(Commands::CheckConfig { show }) => {
            config.validate()?;
            if show {
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                info!("✅ Configuration is valid");
            }
            Ok(())
        }

        Some(Commands::Modules { action }) => match action {
            ModuleCommands::List => list_modules(&config),
        },

        None => start_server(config).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();

    Ok(())
}

async fn start_server(config: AtriumConfig) -> Result<()> {
    info!("🚀 Atrium v{}", env!("CARGO_PKG_VERSION"));

    let server = AtriumServer::new(config)
        .await
        .context("Failed to initialise server")?;

    server.run().await
}

fn list_modules(config: &AtriumConfig) -> Result<()> {
    let registry = ManifestRegistry::scan(&config.modules.directory)?;
    if registry.is_empty() {
        println!("No modules found in {}", config.modules.directory.display());
        return Ok(());
    }

    let order = registry.resolve_order()?;

    println!("Load order:");
    for name in &order.sorted {
        let manifest = registry.get(name).expect("sorted names exist");
        let version = manifest.version.as_deref().unwrap_or("-");
        println!("  {name} {version}");
    }

    if !order.skipped.is_empty() {
        println!("Skipped (unresolved dependencies):");
        for name in &order.skipped {
            println!("  {name}");
        }
    }

    Ok(())
}
