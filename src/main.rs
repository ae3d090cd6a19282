//! Assetrun - budget-safe AI asset generation.
//!
//! Generates a small sample for review, then the full asset set once the
//! sample is approved.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assetrun::content::{validate_requests, AssetSource, YamlAssetSource};
use assetrun::core::{
    BreakerRegistry, Config, EventLevel, FileApprovalGate, FsStorage, ManifestStore, RetryPolicy,
    SessionId, SessionManifest, StatusBroadcaster,
};
use assetrun::{GenerationPipeline, ProviderRegistry};

/// Budget-safe AI asset generation
#[derive(Parser)]
#[command(name = "assetrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./assetrun.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use mock providers instead of paid APIs
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample for review
    Sample {
        /// Asset catalog (overrides the configured path)
        #[arg(short, long)]
        assets: Option<PathBuf>,
    },

    /// Generate every asset after a sample was approved
    Produce {
        /// Approved sample session id
        #[arg(long)]
        after: SessionId,

        /// Asset catalog (overrides the configured path)
        #[arg(short, long)]
        assets: Option<PathBuf>,
    },

    /// Sample, wait for approval, then produce
    Run {
        /// Asset catalog (overrides the configured path)
        #[arg(short, long)]
        assets: Option<PathBuf>,
    },

    /// Approve a sample session
    Approve {
        /// Sample session id
        session: SessionId,
    },

    /// Show a session manifest, or list sessions
    Status {
        /// Session id (lists all sessions when omitted)
        session: Option<SessionId>,

        /// Print the raw manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check configuration and the asset catalog
    Validate {
        /// Asset catalog (overrides the configured path)
        #[arg(short, long)]
        assets: Option<PathBuf>,
    },

    /// Show configuration
    Config {
        /// Show config directory path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    // API keys may live in a local .env
    let _ = dotenvy::dotenv();

    match cli.command {
        Commands::Completions { shell } => {
            cmd_completions(shell);
            return Ok(());
        }
        Commands::Config { path } => return cmd_config(cli.config.as_deref(), path),
        _ => {}
    }

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Create tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::Sample { assets } => cmd_sample(&config, cli.dry_run, assets).await,
            Commands::Produce { after, assets } => cmd_produce(&config, cli.dry_run, &after, assets).await,
            Commands::Run { assets } => cmd_run(&config, cli.dry_run, assets).await,
            Commands::Approve { session } => cmd_approve(&config, &session).await,
            Commands::Status { session, json } => cmd_status(&config, session.as_ref(), json).await,
            Commands::Validate { assets } => cmd_validate(&config, assets),
            Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
        }
    })
}

/// Wire providers, storage and gates from configuration.
fn build_pipeline(config: &Config, dry_run: bool) -> Result<GenerationPipeline> {
    let registry = ProviderRegistry::from_descriptors(&config.providers, dry_run)
        .context("Failed to initialize providers")?;
    if dry_run {
        tracing::info!("Dry run: using mock providers");
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling, waiting for in-flight calls to settle...");
        handler_token.cancel();
    })?;

    let pipeline = GenerationPipeline::new(
        registry,
        Arc::new(FsStorage::new(&config.pipeline.output_dir)),
        ManifestStore::new(&config.pipeline.manifest_dir),
        Arc::new(FileApprovalGate::new(&config.pipeline.approval_dir)),
    )
    .with_settings(config.pipeline.settings.clone())
    .with_budgets(config.budget.sample, config.budget.production)
    .with_retry(RetryPolicy::new(config.retry.clone()))
    .with_breakers(BreakerRegistry::new(config.circuit.clone()))
    .with_broadcaster(StatusBroadcaster::new(config.broadcast.capacity))
    .with_cancel_token(cancel);

    Ok(pipeline)
}

fn asset_source(config: &Config, assets: Option<PathBuf>) -> YamlAssetSource {
    YamlAssetSource::new(assets.unwrap_or_else(|| config.pipeline.assets.clone()))
}

/// Print progress events until the pipeline is dropped.
fn spawn_progress(pipeline: &GenerationPipeline) -> tokio::task::JoinHandle<()> {
    let mut events = Box::pin(pipeline.broadcaster().subscribe());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let marker = match event.level {
                EventLevel::Info => " ",
                EventLevel::Warn => "!",
                EventLevel::Error => "x",
            };
            println!(
                "{marker} [{:>3.0}%] {:<18} {} (spent {})",
                event.progress * 100.0,
                event.phase.to_string(),
                event.message,
                event.counters.cost
            );
        }
    })
}

async fn finish_progress(pipeline: GenerationPipeline, progress: tokio::task::JoinHandle<()>) {
    drop(pipeline);
    let _ = progress.await;
}

/// Generate a sample.
async fn cmd_sample(config: &Config, dry_run: bool, assets: Option<PathBuf>) -> Result<()> {
    let source = asset_source(config, assets);
    let pipeline = build_pipeline(config, dry_run)?;
    let progress = spawn_progress(&pipeline);

    let manifest = pipeline.run_sample(&source).await;
    finish_progress(pipeline, progress).await;
    let manifest = manifest.context("Sample session failed")?;

    print_manifest(&manifest);
    if manifest.status == assetrun::PipelineState::AwaitingApproval {
        println!("\nReview the sample, then run:");
        println!("  assetrun approve {}", manifest.session_id);
        println!("  assetrun produce --after {}", manifest.session_id);
    }
    Ok(())
}

/// Produce the full asset set.
async fn cmd_produce(config: &Config, dry_run: bool, after: &SessionId, assets: Option<PathBuf>) -> Result<()> {
    let source = asset_source(config, assets);
    let pipeline = build_pipeline(config, dry_run)?;
    let progress = spawn_progress(&pipeline);

    let manifest = pipeline.run_production(after, &source).await;
    finish_progress(pipeline, progress).await;
    let manifest = manifest.context("Production session failed")?;

    print_manifest(&manifest);
    Ok(())
}

/// Sample, wait for approval, then produce.
async fn cmd_run(config: &Config, dry_run: bool, assets: Option<PathBuf>) -> Result<()> {
    let source = asset_source(config, assets);
    let pipeline = build_pipeline(config, dry_run)?;
    let progress = spawn_progress(&pipeline);

    let report = pipeline.run_two_phase(&source).await;
    finish_progress(pipeline, progress).await;
    let report = report.context("Two-phase run failed")?;

    print_manifest(&report.sample);
    if let Some(production) = &report.production {
        println!();
        print_manifest(production);
    }
    Ok(())
}

/// Grant approval for a sample session.
async fn cmd_approve(config: &Config, session: &SessionId) -> Result<()> {
    use assetrun::core::{ApprovalGate, SessionMode};

    let manifest = ManifestStore::new(&config.pipeline.manifest_dir)
        .load(session)
        .await
        .with_context(|| format!("Cannot approve unknown session {session}"))?;
    if manifest.mode != SessionMode::Sample {
        anyhow::bail!("Session {session} is a {} session, only samples can be approved", manifest.mode);
    }

    FileApprovalGate::new(&config.pipeline.approval_dir).approve(session).await?;
    println!("Approved sample session {session}");
    Ok(())
}

/// Show one session or list all of them.
async fn cmd_status(config: &Config, session: Option<&SessionId>, json: bool) -> Result<()> {
    let store = ManifestStore::new(&config.pipeline.manifest_dir);

    if let Some(session) = session {
        let manifest = store.load(session).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        } else {
            print_manifest(&manifest);
        }
        return Ok(());
    }

    let manifests = store.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(());
    }
    if manifests.is_empty() {
        println!("No sessions recorded in {}", store.dir().display());
        return Ok(());
    }
    for manifest in &manifests {
        println!(
            "{}  {:<10}  {:<18}  {:>3} committed  {}",
            manifest.session_id,
            manifest.mode.to_string(),
            manifest.status.to_string(),
            manifest.counters.committed,
            manifest.total_cost
        );
    }
    Ok(())
}

/// Check configuration and catalog without calling any provider.
fn cmd_validate(config: &Config, assets: Option<PathBuf>) -> Result<()> {
    let enabled = config.providers.iter().filter(|p| p.enabled).count();
    println!("Configuration OK ({enabled} enabled provider(s))");

    let source = asset_source(config, assets);
    let requests = source.discover()?;
    validate_requests(&requests)?;
    println!("Asset catalog OK: {} asset(s) in {}", requests.len(), source.path().display());
    Ok(())
}

/// Show configuration.
fn cmd_config(explicit: Option<&Path>, show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load(explicit)?;
    println!("{}", config.to_toml()?);
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "assetrun", &mut io::stdout());
}

fn print_manifest(manifest: &SessionManifest) {
    let counters = &manifest.counters;
    println!("Session {} ({})", manifest.session_id, manifest.mode);
    println!("  Status:    {}", manifest.status);
    if let Some(reason) = manifest.abort_reason {
        println!("  Reason:    {reason}");
    }
    if let Some(parent) = &manifest.parent_session {
        println!("  Sample:    {parent}");
    }
    println!("  Spent:     {} of {}", manifest.total_cost, manifest.ceiling);
    println!(
        "  Assets:    {} committed, {} failed, {} rejected, {} skipped, {} already satisfied",
        counters.committed,
        counters.failed,
        counters.rejected,
        counters.skipped,
        counters.already_satisfied
    );
    for outcome in &manifest.assets {
        let detail = outcome
            .image_path
            .clone()
            .or_else(|| outcome.errors.last().map(|e| e.message.clone()))
            .unwrap_or_default();
        println!("    {:<32} {:<18} {detail}", outcome.key, format!("{:?}", outcome.status));
    }
}
