use pinbox_cli::cli::commands::{
    BuildArgs, CliArgs, Commands, ConfigArgs, ContextArgs, PlanArgs, RunArgs,
};
use pinbox_cli::cli::output::{BuildSummary, OutputFormat, OutputFormatter};
use pinbox_cli::{init_logging, parse_level, NAME, VERSION};
use pinbox_core::config::{BuildOptions, PinboxConfig};
use pinbox_core::error::{BuildError, Stage};
use pinbox_core::progress::LoggingHandler;
use pinbox_core::startup::{StartupConfig, PORT_ENV};
use pinbox_deps::{normalize_name, ChainFetcher, UrlFetcher, WheelhouseFetcher};
use pinbox_image::{export_layout, LocalImageStore, MemoryImageSource};
use pinbox_pipeline::{
    plan, BuildContext, BuildRecipe, Launcher, PipelineOrchestrator, PipelineState, TokioSpawner,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

const CONFIG_ERROR_EXIT: i32 = 2;
const DEFAULT_OUTPUT_DIR: &str = "image";

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("{} v{} starting", NAME, VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Build(build_args) => handle_build(build_args, args.quiet).await,
        Commands::Plan(plan_args) => handle_plan(plan_args),
        Commands::Run(run_args) => handle_run(run_args).await,
        Commands::Config(config_args) => handle_config(config_args),
    };

    process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    let level = if let Some(level_str) = &args.log_level {
        parse_level(level_str).unwrap_or_else(|| {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        })
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        let level_str = env::var("PINBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        parse_level(&level_str).unwrap_or(Level::INFO)
    };

    init_logging(level, args.log_format);
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

/// Recipe, effective options and platform for a build context.
struct Inputs {
    context_dir: PathBuf,
    recipe: BuildRecipe,
    options: BuildOptions,
    platform: String,
}

fn load_inputs(args: &ContextArgs, config: &PinboxConfig) -> Result<Inputs> {
    let context_dir = match &args.context {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("Failed to get current directory")?,
    };
    if !context_dir.is_dir() {
        bail!("Build context is not a directory: {}", context_dir.display());
    }
    let context_dir = context_dir
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize {}", context_dir.display()))?;
    debug!("Build context: {}", context_dir.display());

    let recipe = match &args.recipe {
        Some(path) => BuildRecipe::load_file(path)?,
        None => BuildRecipe::load(&context_dir)?,
    };
    recipe.validate()?;

    let mut options = recipe.options.clone().with_env_overrides();
    if args.no_frozen {
        options.frozen = false;
    }
    for raw in &args.pin {
        let (name, version) = BuildOptions::parse_pin(raw)?;
        options.pinned_versions.insert(normalize_name(&name), version);
    }

    let platform = args
        .platform
        .clone()
        .unwrap_or_else(|| config.platform.clone());

    Ok(Inputs {
        context_dir,
        recipe,
        options,
        platform,
    })
}

fn report_build_error(err: &BuildError) -> i32 {
    error!(stage = %err.stage(), kind = err.kind(), "{}", err);
    eprintln!("stage={} error={}", err.stage(), err);
    err.exit_code()
}

async fn handle_build(args: &BuildArgs, quiet: bool) -> i32 {
    let mut config = PinboxConfig::default();
    if let Some(secs) = args.fetch_timeout {
        config.fetch_timeout_secs = secs;
    }
    if let Some(platform) = &args.context.platform {
        config.platform = platform.clone();
    }
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return CONFIG_ERROR_EXIT;
    }

    let mut inputs = match load_inputs(&args.context, &config) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("{:#}", e);
            return CONFIG_ERROR_EXIT;
        }
    };
    if args.retain_cache {
        inputs.options.retain_cache = true;
    }

    let Some(store) = args.image_store.clone().or(config.image_store.clone()) else {
        error!("No image store configured: pass --image-store or set PINBOX_IMAGE_STORE");
        return CONFIG_ERROR_EXIT;
    };

    let fetch_timeout = Duration::from_secs(config.fetch_timeout_secs);
    let mut fetcher = ChainFetcher::new();
    if let Some(wheelhouse) = args.wheelhouse.clone().or(config.wheelhouse.clone()) {
        debug!("Wheelhouse: {}", wheelhouse.display());
        fetcher = fetcher.with(Arc::new(WheelhouseFetcher::new(wheelhouse)));
    }
    fetcher = fetcher.with(Arc::new(UrlFetcher::new(
        inputs.context_dir.clone(),
        fetch_timeout,
    )));

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| inputs.context_dir.join(DEFAULT_OUTPUT_DIR));

    info!(
        context = %inputs.context_dir.display(),
        store = %store.display(),
        frozen = inputs.options.frozen,
        "Building image"
    );

    let context = BuildContext::new(
        inputs.context_dir,
        inputs.recipe,
        Arc::new(LocalImageStore::new(store)),
        Arc::new(fetcher),
    )
    .with_options(inputs.options)
    .with_platform(inputs.platform)
    .with_progress(Arc::new(LoggingHandler))
    .with_fetch_timeout(fetch_timeout);

    let orchestrator = PipelineOrchestrator::new();
    cancel_on_ctrl_c(orchestrator.cancellation_token());

    let target = args
        .target
        .map(Stage::from)
        .unwrap_or(Stage::ApplicationAssembly);
    let state = match orchestrator.run_to(&context, target).await {
        Ok(state) => state,
        Err(e) => return report_build_error(&e),
    };

    match export_state(&state, &output, &args.tag).await {
        Ok(summary) => {
            if !quiet {
                match OutputFormatter::new(OutputFormat::Human).format_summary(&summary) {
                    Ok(text) => print!("{}", text),
                    Err(e) => warn!("Failed to format summary: {}", e),
                }
            }
            0
        }
        Err(e) => {
            error!("Export failed: {:#}", e);
            1
        }
    }
}

async fn export_state(state: &PipelineState, output: &Path, tag: &str) -> Result<BuildSummary> {
    let image = state
        .image()
        .cloned()
        .context("Build produced no image")?;
    let packages = match state {
        PipelineState::DepsReady(deps) => deps.record.packages.clone(),
        PipelineState::Launchable(launchable) => launchable.installed().to_vec(),
        _ => Vec::new(),
    };

    let dest = output.to_path_buf();
    let tag_owned = tag.to_string();
    let exported = tokio::task::spawn_blocking(move || export_layout(&image, &dest, &tag_owned))
        .await
        .context("Export task failed")??;

    info!(
        output = %exported.path.display(),
        digest = %exported.manifest_digest,
        "Image exported"
    );

    Ok(BuildSummary {
        output: exported.path.display().to_string(),
        tag: exported.tag,
        state: state.name().to_string(),
        manifest_digest: exported.manifest_digest.to_string(),
        layers: exported
            .layer_digests
            .iter()
            .map(|d| d.to_string())
            .collect(),
        packages,
    })
}

fn handle_plan(args: &PlanArgs) -> i32 {
    let config = PinboxConfig::default();
    let inputs = match load_inputs(&args.context, &config) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("{:#}", e);
            return CONFIG_ERROR_EXIT;
        }
    };

    let context = BuildContext::new(
        inputs.context_dir,
        inputs.recipe,
        Arc::new(MemoryImageSource::new()),
        Arc::new(ChainFetcher::new()),
    )
    .with_options(inputs.options)
    .with_platform(inputs.platform);

    let build_plan = match plan(&context) {
        Ok(build_plan) => build_plan,
        Err(e) => return report_build_error(&e),
    };

    let formatter = OutputFormatter::new(args.format.into());
    match formatter.format_plan(&build_plan) {
        Ok(text) => {
            print!("{}", text);
            0
        }
        Err(e) => {
            error!("Failed to format plan: {}", e);
            1
        }
    }
}

async fn handle_run(args: &RunArgs) -> i32 {
    // Reject a malformed host PORT before unpacking.
    if let Err(e) = StartupConfig::from_env() {
        error!("Invalid startup configuration: {}", e);
        return CONFIG_ERROR_EXIT;
    }
    let port_override = env::var(PORT_ENV).ok();

    let scratch;
    let rootfs = match &args.rootfs {
        Some(dir) => dir.clone(),
        None => match tempfile::Builder::new().prefix("pinbox-rootfs-").tempdir() {
            Ok(dir) => {
                let path = dir.path().to_path_buf();
                scratch = dir;
                debug!("Unpacking into {}", scratch.path().display());
                path
            }
            Err(e) => {
                error!("Failed to create rootfs directory: {}", e);
                return 1;
            }
        },
    };

    info!(
        image = %args.image.display(),
        rootfs = %rootfs.display(),
        port_override = port_override.as_deref().unwrap_or("none"),
        "Launching image"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let launcher = Launcher::new(Arc::new(TokioSpawner));
    match launcher
        .run_layout(
            &args.image,
            args.tag.as_deref(),
            &rootfs,
            &|key: &str| env::var(key).ok(),
            cancel,
        )
        .await
    {
        Ok(code) => code,
        Err(e) => {
            error!("Launch failed: {}", e);
            1
        }
    }
}

fn handle_config(args: &ConfigArgs) -> i32 {
    let config = PinboxConfig::default();
    if let Err(e) = config.validate() {
        warn!("{}", e);
    }

    match OutputFormatter::new(args.format.into()).format_config(&config) {
        Ok(text) => {
            print!("{}", text);
            0
        }
        Err(e) => {
            error!("Failed to format configuration: {}", e);
            1
        }
    }
}
