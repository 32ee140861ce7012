use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mcp_browser_core::config::{Config, LoggingConfig};
use mcp_browser_pool::BrowserManager;

#[derive(Parser)]
#[command(
    name = "mcp-browser",
    about = "Pooled browser instances with retrying context management",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the browser pool until interrupted
    Serve {
        /// Override the maximum number of browser instances
        #[arg(long)]
        max_instances: Option<usize>,

        /// Seconds between pool status reports
        #[arg(long, default_value_t = 60)]
        report_every: u64,
    },

    /// Show effective pool and retry settings
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let mut directives = vec![logging.level.clone().unwrap_or_else(|| "info".into())];
            directives.extend(logging.filters.iter().cloned());
            EnvFilter::new(directives.join(","))
        })
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let mut config = Config::load_with_env(&config_path)?;

    init_logging(&config.logging_config(), cli.verbose);

    match cli.command {
        Commands::Serve {
            max_instances,
            report_every,
        } => {
            if let Some(max) = max_instances {
                config.pool.get_or_insert_with(Default::default).max_instances = max;
            }
            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid configuration: {}", errors.join("; "));
            }

            let manager = BrowserManager::from_config(&config);
            manager.initialize().await;
            tracing::info!(
                max_instances = manager.pool().max_instances(),
                "Browser pool running; press Ctrl-C to stop"
            );

            let mut report = tokio::time::interval(Duration::from_secs(report_every.max(1)));
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    _ = report.tick() => {
                        let instances = manager.list_instances().await;
                        let in_use = instances.iter().filter(|i| i.in_use).count();
                        tracing::info!(total = instances.len(), in_use, "Pool status");
                    }
                }
            }

            tracing::info!("Shutting down");
            manager.shutdown().await;
        }
        Commands::Status => {
            let pool = config.pool_config();
            let retry = config.retry_config();
            println!("MCP Browser v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Max instances: {}", pool.max_instances);
            println!("Idle timeout: {}s", pool.idle_timeout_secs);
            println!("Reclaim interval: {}s", pool.reclaim_interval_secs);
            println!(
                "Retry: {} attempts, {}s initial, {}s cap, x{} backoff",
                retry.max_attempts,
                retry.initial_delay_secs,
                retry.max_delay_secs,
                retry.backoff_factor
            );
            let kinds: Vec<&str> = retry.retryable_kinds.iter().map(|k| k.name()).collect();
            println!("Retryable: {}", kinds.join(", "));
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
    }

    Ok(())
}
