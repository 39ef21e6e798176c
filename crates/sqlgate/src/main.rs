//! sqlgate - label-routed SQL operations over stdio
//!
//! # Usage
//!
//! ```bash
//! # Serve JSON-RPC on stdin/stdout (default)
//! sqlgate -c sqlgate.yaml
//!
//! # Expose a single target only
//! SQLGATE_LABEL=prod sqlgate -c sqlgate.yaml serve
//!
//! # Validate configuration
//! sqlgate -c sqlgate.yaml validate
//!
//! # Print configured targets
//! sqlgate -c sqlgate.yaml targets
//! ```
//!
//! Logs go to stderr; stdout carries the protocol.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sqlgate::{
    transport, ConfigLoader, Error, ExecutorSettings, PoolRegistry, QueryExecutor,
    RegistrySettings, ToolTable,
};
use sqlgate_rdbc::postgres::PgConnectionFactory;

#[derive(Parser)]
#[command(name = "sqlgate")]
#[command(version, about = "Label-routed SQL operations against configured PostgreSQL targets")]
struct Cli {
    /// Path to the connections file
    #[arg(short, long, env = "SQLGATE_CONFIG", default_value = "sqlgate.yaml")]
    config: PathBuf,

    /// Expose only this label; every other target is hidden
    #[arg(short, long, env = "SQLGATE_LABEL")]
    label: Option<String>,

    /// How long a loaded configuration is trusted before the file is probed again
    #[arg(long, env = "SQLGATE_CACHE_TTL_MS", default_value_t = 2000)]
    cache_ttl_ms: u64,

    /// Upper bound on establishing one connection
    #[arg(long, env = "SQLGATE_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Server-side statement timeout
    #[arg(long, env = "SQLGATE_STATEMENT_TIMEOUT_MS", default_value_t = 30_000)]
    statement_timeout_ms: u64,

    /// Upper bound on waiting for a pooled connection
    #[arg(long, env = "SQLGATE_ACQUIRE_TIMEOUT_MS", default_value_t = 5_000)]
    acquire_timeout_ms: u64,

    /// Upper bound on the row limit a query may request
    #[arg(long, env = "SQLGATE_MAX_ROWS", default_value_t = 1000)]
    max_rows: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-RPC on stdin/stdout (default)
    Serve,
    /// Load the configuration once and report problems
    Validate,
    /// Print the configured targets
    Targets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let loader = Arc::new(
        ConfigLoader::new(&cli.config)
            .with_label_filter(cli.label.clone())
            .with_ttl(Duration::from_millis(cli.cache_ttl_ms)),
    );
    let registry = Arc::new(PoolRegistry::new(
        Arc::clone(&loader),
        Arc::new(PgConnectionFactory),
        RegistrySettings {
            connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
            acquire_timeout: Duration::from_millis(cli.acquire_timeout_ms),
            ..Default::default()
        },
    ));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let executor = Arc::new(QueryExecutor::new(
                Arc::clone(&registry),
                ExecutorSettings {
                    statement_timeout: Duration::from_millis(cli.statement_timeout_ms),
                    max_rows: cli.max_rows.max(1),
                    ..Default::default()
                },
            ));
            serve(&loader, &registry, ToolTable::standard(executor)).await
        }
        Commands::Validate => validate(&loader).await,
        Commands::Targets => {
            let targets = registry.targets().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "targets": targets }))?
            );
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn serve(loader: &ConfigLoader, registry: &PoolRegistry, tools: ToolTable) -> Result<()> {
    info!(
        config = %loader.path().display(),
        label = loader.label_filter().unwrap_or("*"),
        tools = tools.len(),
        "starting sqlgate"
    );

    // a bad configuration degrades calls; it does not stop the server
    if let Err(e) = loader.current().await {
        warn!(error = %e, "configuration not usable yet");
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let outcome = tokio::select! {
        result = transport::serve(stdin, stdout, &tools) => {
            result.context("transport failed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            Ok(())
        }
    };

    registry.shutdown().await;
    info!("sqlgate stopped");
    outcome
}

async fn validate(loader: &ConfigLoader) -> Result<()> {
    match loader.reload().await {
        Ok(snapshot) => {
            println!("✓ Configuration valid!\n");
            println!("Targets ({}):", snapshot.len());
            for descriptor in snapshot.iter() {
                let summary = descriptor.summary();
                println!(
                    "  - {} {} [{}, ssl={}, pool_size={}]",
                    summary.label,
                    summary.endpoint,
                    if summary.read_only { "read-only" } else { "read-write" },
                    summary.ssl,
                    summary.pool_size,
                );
            }
            Ok(())
        }
        Err(Error::ConfigInvalid { diagnostics }) => {
            println!("✗ Configuration invalid:\n");
            for diagnostic in &diagnostics {
                println!("  - {diagnostic}");
            }
            bail!("{} problem(s) in {}", diagnostics.len(), loader.path().display())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load {}", loader.path().display())),
    }
}
