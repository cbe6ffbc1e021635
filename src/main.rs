//! Herdlock - Group Leader Election CLI
//!
//! Thin command-line layer over the election library: join a service group's
//! leader election, or check whether this host is the current leader. The
//! coordination store is consumed through the `CoordinationStore` trait; this
//! binary wires up the in-process backend, and networked backends plug in by
//! implementing the same trait.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herdlock::config::Config;
use herdlock::election::Coordinator;
use herdlock::error::Result;
use herdlock::store::MemoryStore;

/// Herdlock - Group Leader Election
#[derive(Parser)]
#[command(name = "herdlock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "herdlock.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the pool of servers of a service group
    Join {
        /// Name of the service group, e.g. cron-ft2
        group: String,
    },

    /// Check if this server is the group leader
    Check {
        /// Name of the service group
        group: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "herdlock.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Join { group } => run_join(cli.config, group).await,
        Commands::Check { group } => run_check(cli.config, group).await,
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Load the configuration, falling back to defaults when no file exists
fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        let config = Config::from_file(path)?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    } else {
        tracing::warn!("Configuration file {:?} not found, using defaults", path);
        Ok(Config::default())
    }
}

async fn coordinator_for(config: &Config, group: String) -> Result<Coordinator> {
    let identity = config.resolve_identity()?;
    let store = MemoryStore::new();
    let session = store.connect().await?;
    Ok(Coordinator::new(
        Arc::new(session),
        group,
        identity,
        config.retry_policy(),
    ))
}

/// Join a group and participate in leader election until terminated
async fn run_join(config_path: PathBuf, group: String) -> Result<i32> {
    let config = load_config(&config_path)?;
    let coordinator = coordinator_for(&config, group).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_token.cancel();
        }
    });

    coordinator.join(shutdown).await?;
    Ok(0)
}

/// Check whether this host is the group leader.
///
/// With the in-process backend the query is scoped to this process: it
/// cannot observe a leader elected by a `join` running elsewhere. Cross
/// process checks need a networked `CoordinationStore` backend.
async fn run_check(config_path: PathBuf, group: String) -> Result<i32> {
    let config = load_config(&config_path)?;
    let coordinator = coordinator_for(&config, group).await?;

    if coordinator.is_leader().await? {
        println!("This server is the service leader");
        Ok(0)
    } else {
        println!("This server is NOT the service leader");
        Ok(1)
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> Result<i32> {
    let config_content = r#"# Herdlock Configuration

[store]
# Coordination store server addresses
servers = []
session_timeout_ms = 5000
connect_timeout_ms = 10000

[node]
# Identity published when this host becomes leader.
# Defaults to the machine hostname when unset.
# identity = "web-1.example.com"

[election]
retry_max_attempts = 3
retry_base_delay_ms = 250
retry_max_delay_ms = 2000

[logging]
level = "info"
format = "pretty"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nThen join a group with: herdlock join <group> --config {}", output.display());
    Ok(0)
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<i32> {
    match Config::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Servers:         {:?}", config.store.servers);
            println!("  Session timeout: {} ms", config.store.session_timeout_ms);
            println!(
                "  Identity:        {}",
                config
                    .node
                    .identity
                    .as_deref()
                    .unwrap_or("(machine hostname)")
            );
            println!("  Retry attempts:  {}", config.election.retry_max_attempts);
            Ok(0)
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
