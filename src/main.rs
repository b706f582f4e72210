// ============================================================================
// SECTION: CLI & MAIN ENTRY POINT
// ============================================================================
// Command-line front end of the predictor:
// - `run` starts the manager and reports realtime predictions periodically
// - `validate` checks a configuration file
// - `generate-config` prints or writes the default configuration
// - `version` prints build information
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use cerebro_predictor::config::EngineConfig;
use cerebro_predictor::logging::init_logging;
use cerebro_predictor::{PredictorManager, PREDICTOR_FULL_NAME, PREDICTOR_VERSION};

/// Cerebro predictor CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-predictor",
    author = "AIOps Team",
    version,
    about = "Workload forecasting core for the Cerebro autoscaling platform",
    long_about = "Learns periodic waveforms and decayed usage histograms from metric \
                  history and serves predicted values to autoscaling callers."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cerebro-predictor.toml", env = "CEREBRO_PREDICTOR_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "CEREBRO_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the predictor (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the default configuration
    GenerateConfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.validate().context("Configuration is invalid")?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }

    println!("  instance: {}", config.engine.instance_name);
    println!("  dsp sample interval: {}", humantime::format_duration(config.dsp_defaults()?.sample_interval));
    println!("  percentile sample interval: {}", humantime::format_duration(config.percentile_defaults()?.sample_interval));
    println!(
        "  checkpoints: {}",
        if config.checkpoint.enabled { config.checkpoint.backend.as_str() } else { "disabled" }
    );
    println!("  history sources: {}", config.providers.history.len());
    println!("  realtime sources: {}", config.providers.realtime.len());
    println!("  static queries: {}", config.queries.len());
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, &rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn handle_version() {
    println!("{PREDICTOR_FULL_NAME} v{PREDICTOR_VERSION}");
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
    println!("  algorithms: dsp, percentile");
    println!("  checkpoint backends: {}", cerebro_predictor::checkpoint::registered_backends().join(", "));
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "cerebro::init", error = %e, "SIGTERM handler unavailable");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!(target: "cerebro::init", "Received SIGTERM"),
            _ = signal::ctrl_c() => info!(target: "cerebro::init", "Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!(target: "cerebro::init", "Received Ctrl-C");
    }
}

async fn run(config: EngineConfig) -> AnyhowResult<()> {
    let manager = PredictorManager::new(&config).context("Failed to build predictor")?;
    manager.start().await;
    let registered = manager.register_static_queries(&config.queries).await?;
    info!(
        target: "cerebro::init",
        instance = %config.engine.instance_name,
        queries = registered,
        "Predictor running"
    );

    let mut report = tokio::time::interval(Duration::from_secs(config.engine.report_interval_secs.max(1)));
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = report.tick() => {
                for static_query in &config.queries {
                    let query = static_query.to_query();
                    match manager.predictor(static_query.algorithm).query_realtime_predicted_values(&query).await {
                        Ok(series) => {
                            for ts in series {
                                if let Some(sample) = ts.samples.last() {
                                    info!(
                                        target: "cerebro::manager",
                                        query = %query.unique_key(),
                                        labels = ?ts.labels,
                                        value = sample.value,
                                        "Realtime prediction"
                                    );
                                }
                            }
                        }
                        Err(e) => warn!(
                            target: "cerebro::manager",
                            query = %query.unique_key(),
                            error = %e,
                            "Realtime prediction unavailable"
                        ),
                    }
                }
            }
        }
    }

    manager.stop().await;
    info!(target: "cerebro::init", metrics = %manager.metrics().encode_text(), "Final self-metrics");
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::Run) | None => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        EngineConfig::default()
    } else {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!(target: "cerebro::init", path = %cli.config.display(), "Config file not found, using defaults");
    }
    info!(target: "cerebro::init", "{} v{}", PREDICTOR_FULL_NAME, PREDICTOR_VERSION);

    run(config).await
}
