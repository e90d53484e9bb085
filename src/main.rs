use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ruta::config::{Config, ConfigError};
use ruta::Ruta;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ruta")]
#[command(about = "A read/write-splitting proxy for MySQL replication topologies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Ruta Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/ruta.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_ruta(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_ruta(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ruta");
    info!(path = ?config_path, "Configuration loaded");

    let ruta = Ruta::from_config(config)
        .await
        .context("Failed to initialize ruta")?;
    ruta.run().await.context("Ruta stopped with error")?;

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the backends and credentials to match your environment and run:");
    println!("  ruta run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Admin address: {}", config.server.admin_addr);
            println!("  Max client connections: {}", config.server.max_client_connections);
            println!("  Pools: {}", config.pools.len());
            for pool in &config.pools {
                let members = config
                    .backends
                    .iter()
                    .filter(|b| b.pool_id == pool.id)
                    .map(|b| b.address.as_str())
                    .collect::<Vec<_>>();
                println!(
                    "    {} ({:?}, {}): {}",
                    pool.id,
                    pool.role,
                    pool.name,
                    members.join(", ")
                );
            }
            println!("  Rules: {}", config.rules.len());
            for rule in &config.rules {
                println!(
                    "    {}: {:?} '{}' -> pool {}{}",
                    rule.rule_id,
                    rule.match_kind,
                    rule.match_pattern,
                    rule.destination_pool,
                    if rule.active { "" } else { " (inactive)" }
                );
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("ruta v{}", env!("CARGO_PKG_VERSION"));
    println!("A read/write-splitting proxy for MySQL replication topologies");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Pattern-based query routing to writer and reader hostgroups");
    println!("  • Transaction-aware backend pinning");
    println!("  • Per-backend connection pooling");
    println!("  • Liveness, read_only and replication lag monitoring");
    println!("  • HTTP admin API for runtime topology changes");
}

/// `RUST_LOG` takes precedence over the configured level
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}
