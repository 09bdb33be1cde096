use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::{
    DateTime,
    Utc,
};
use clap::{
    Parser,
    Subcommand,
};
use tidemark_core::infrastructure::config::{
    ConfigLoader,
    ConfigValidator,
};
use tidemark_core::{
    logging,
    PipelineContext,
    TidemarkConfig,
    WatermarkStore,
};
use tokio_util::sync::CancellationToken;

/// Watermark-driven incremental extraction with tiered validation
#[derive(Parser, Debug)]
#[command(name = "tidemark", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract, validate and commit everything new for a source
    Run {
        #[arg(short, long)]
        source: String,

        /// Upper bound of the run (RFC 3339); defaults to now
        #[arg(long, value_parser = parse_timestamp)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Create the watermark of a source
    Init {
        #[arg(short, long)]
        source: String,

        /// Starting point (RFC 3339); defaults to the source's initial_watermark
        #[arg(long, value_parser = parse_timestamp)]
        from: Option<DateTime<Utc>>,
    },
    /// Show the current watermark of a source
    Status {
        #[arg(short, long)]
        source: String,
    },
    /// Show committed runs, quality trend and recent anomalies
    History {
        #[arg(short, long)]
        source: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Load and validate the configuration
    CheckConfig,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", value, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        logging::init_dev();
    } else {
        logging::init();
    }

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = ConfigLoader::discover_config_path(cli.config.as_deref());
    let config = ConfigLoader::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Commands::CheckConfig = cli.command {
        return Ok(check_config(&config_path, &config));
    }

    let validation = ConfigValidator::validate(&config);
    for warning in &validation.warnings {
        tracing::warn!(field = %warning.field, "{}", warning.message);
    }
    if !validation.is_ok() {
        for error in &validation.errors {
            eprintln!("{}: {}", error.field, error.message);
        }
        anyhow::bail!("Invalid configuration: {}", validation.summary());
    }

    let context = PipelineContext::new(config)
        .await
        .context("Failed to initialize pipeline")?;

    match cli.command {
        Commands::Run { source, as_of } => run(&context, &source, as_of).await,
        Commands::Init { source, from } => init(&context, &source, from).await,
        Commands::Status { source } => {
            let watermark = context
                .watermarks
                .get(&source)
                .await
                .with_context(|| format!("No watermark for {}", source))?;
            println!("{}", serde_json::to_string_pretty(&watermark)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { source, limit } => {
            let runs = context.watermarks.history(&source, limit).await?;
            let quality = context.metrics.quality_trend(&source, limit).await?;
            let anomalies = context.metrics.recent_anomalies(&source, limit).await?;
            let report = serde_json::json!({
                "source_id": source,
                "runs": runs,
                "quality_trend": quality,
                "anomalies": anomalies,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig => Ok(ExitCode::SUCCESS),
    }
}

async fn run(
    context: &PipelineContext, source: &str, as_of: Option<DateTime<Utc>>,
) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let summary = context
        .orchestrator
        .run_with_cancel(source, as_of, cancel)
        .await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(ExitCode::from(summary.exit_code() as u8))
}

async fn init(
    context: &PipelineContext, source: &str, from: Option<DateTime<Utc>>,
) -> anyhow::Result<ExitCode> {
    let configured = context
        .config
        .sources
        .get(source)
        .with_context(|| format!("Source {} is not configured", source))?;
    let start = from
        .or(configured.initial_watermark)
        .with_context(|| format!("No --from given and {} has no initial_watermark", source))?;

    let watermark = context.watermarks.initialize(source, start).await?;
    println!("{}", serde_json::to_string_pretty(&watermark)?);
    Ok(ExitCode::SUCCESS)
}

fn check_config(path: &std::path::Path, config: &TidemarkConfig) -> ExitCode {
    let validation = ConfigValidator::validate(config);

    println!("Config: {}", path.display());
    println!("{}", config.storage.summary());
    println!("Sources: {}", config.sources.len());
    for error in &validation.errors {
        println!("  error   {}: {}", error.field, error.message);
    }
    for warning in &validation.warnings {
        println!("  warning {}: {}", warning.field, warning.message);
    }
    println!("{}", validation.summary());

    if validation.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
