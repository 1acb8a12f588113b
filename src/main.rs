//! trialrunner - trial submission with injection-scale estimation
//!
//! A CLI tool that runs the trials of a likelihood analysis on a local
//! worker pool or submits them as a batch-cluster job array, optionally
//! estimating the injection scale first.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Any failure (invalid arguments, settings, submission, estimation)

mod backend;
mod cli;
mod config;
mod engine;
mod error;
mod estimate;
mod models;
mod orchestrator;
mod report;
mod storage;

use anyhow::{Context, Result};
use backend::{BackendContext, BackendRegistry, SubmitOptions};
use cli::Args;
use config::{Settings, SETTINGS_FILE};
use engine::{CommandAggregator, CommandEngine};
use estimate::ScaleEstimator;
use models::JobId;
use orchestrator::Orchestrator;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("trialrunner v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\nError: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .trialrunner.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(SETTINGS_FILE);

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit it manually.",
            SETTINGS_FILE
        );
        std::process::exit(1);
    }

    let content = Settings::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", SETTINGS_FILE))?;

    println!("Created {} with default settings.", SETTINGS_FILE);
    println!("   Edit it to set the host, cluster tuning and engine programs.");
    Ok(())
}

/// Initialize logging based on verbosity settings. `RUST_LOG` wins when set.
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the requested action. Returns the exit code.
async fn run(args: Args) -> Result<i32> {
    let mut settings = load_settings(&args)?;
    settings.merge_with_args(&args);

    let layout = storage::ArtifactLayout::new(&settings.general.storage_root);
    debug!("Storage root: {}", layout.root().display());

    // Handle --clean: remove artifacts and exit
    if let Some(ref name) = args.clean {
        storage::remove_artifacts(&layout, name)
            .with_context(|| format!("Failed to clean up run {}", name))?;
        println!("Removed artifacts of {}", name);
        return Ok(0);
    }

    let registry = BackendRegistry::with_builtin();
    let resolved = match args.backend {
        Some(ref name) => registry.resolve_strict(name)?,
        None => registry.resolve(settings.general.host.as_deref()),
    };
    info!("Using the {} backend", resolved.name);
    if resolved.fell_back && args.cluster {
        eprintln!("Warning: no cluster backend for this host, --cluster will fail.");
    }

    let engine = Arc::new(CommandEngine::from_config(&settings.engine));
    let aggregator = Arc::new(CommandAggregator::from_config(&settings.engine));
    let estimator = ScaleEstimator::new(engine.clone(), aggregator)
        .with_max_iterations(settings.estimation.iteration_cap())
        .with_quick_trials(settings.estimation.quick_trials);
    let methods = settings.estimation.methods.clone();

    let ctx = BackendContext {
        engine,
        layout,
        settings,
        options: SubmitOptions {
            use_cluster: args.cluster,
            remove_old_results: args.remove_old_results,
        },
        show_progress: !args.quiet,
    };
    let backend = (resolved.factory)(ctx);

    // Handle --wait-for-cluster: block on queued jobs and exit
    if args.wait_for_cluster {
        let ids: Vec<JobId> = args.job_ids.iter().copied().map(JobId).collect();
        if ids.is_empty() {
            println!("Waiting for all queued cluster jobs...");
        } else {
            println!("Waiting for {} cluster job(s)...", ids.len());
        }
        backend.wait_for_cluster(&ids).await?;
        println!("All cluster jobs finished.");
        return Ok(0);
    }

    let analysis_path = args
        .analysis
        .as_deref()
        .context("An analysis configuration file is required")?;
    let analysis = storage::load_analysis_config(analysis_path).with_context(|| {
        format!(
            "Failed to load analysis configuration {}",
            analysis_path.display()
        )
    })?;
    info!("Loaded analysis {} from {}", analysis.name, analysis_path.display());

    // Handle --dry-run: describe and exit
    if args.dry_run {
        return handle_dry_run(backend.as_ref(), &analysis, &methods, args.discovery);
    }

    println!("{}\n", backend);
    if !methods.is_empty() {
        println!(
            "Estimating injection scale ({})...",
            methods
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut orchestrator = Orchestrator::new(backend, estimator, methods);
    let outcome = orchestrator
        .analyse(&analysis, args.discovery, args.wait)
        .await
        .with_context(|| format!("Failed to analyse {}", analysis.name))?;

    if let Some(ref path) = args.summary {
        if path.as_os_str() == "-" {
            println!("{}", report::generate_json_summary(&outcome)?);
        } else {
            report::write_json_summary(&outcome, path)?;
            info!("Summary written to {}", path.display());
        }
    }

    println!("\nRun summary:");
    for line in report::generate_text_summary(&outcome).lines() {
        println!("   {}", line);
    }
    println!("\nDone.");

    Ok(0)
}

/// Handle --dry-run: print what would be submitted, exit.
fn handle_dry_run(
    backend: &dyn backend::Backend,
    analysis: &models::AnalysisConfig,
    methods: &[models::EstimationMethod],
    want_discovery: bool,
) -> Result<i32> {
    println!("\nDry run: nothing will be executed.\n");
    println!("{}\n", backend);

    if methods.is_empty() {
        println!("   Scale: {} (no estimation)", analysis.scale);
    } else {
        println!(
            "   Scale: estimated with {} for {}, starting from {}",
            methods
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            if want_discovery { "discovery" } else { "sensitivity" },
            analysis.scale
        );
    }
    println!("   {}", backend.describe_plan(analysis));

    println!("\nDry run complete.");
    Ok(0)
}

/// Load settings from file or use defaults.
fn load_settings(args: &Args) -> Result<Settings> {
    // Try explicit settings path
    if let Some(ref path) = args.settings {
        info!("Loading settings from: {}", path.display());
        return Settings::load(path);
    }

    // Try default location
    match Settings::load_default() {
        Ok(Some(settings)) => {
            info!("Loaded default settings from {}", SETTINGS_FILE);
            Ok(settings)
        }
        Ok(None) => {
            debug!("No settings file found, using defaults");
            Ok(Settings::default())
        }
        Err(e) => {
            warn!("Failed to load settings: {:#}", e);
            Ok(Settings::default())
        }
    }
}
