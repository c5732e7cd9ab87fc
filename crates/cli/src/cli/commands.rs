use clap::{Parser, Subcommand, ValueEnum};
use pinbox_core::error::Stage;
use std::path::PathBuf;

/// Deterministic image builds for a single-process Python service
#[derive(Parser, Debug)]
#[command(
    name = "pinbox",
    about = "Deterministic image builds for a single-process Python service",
    version,
    author,
    long_about = "pinbox builds an OCI image from a pinned Python base image, a dependency \
                  manager binary copied from its own image, a pyproject.toml + uv.lock pair, \
                  and one entry-point file. Dependencies are installed exactly as locked; \
                  nothing is re-resolved."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "text",
        help = "Log output format"
    )]
    pub log_format: LogFormatArg,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Build an OCI image from a build context",
        long_about = "Runs the four build stages (base provisioning, tool injection, dependency \
                      resolution, application assembly) and writes an OCI image layout.\n\n\
                      Examples:\n  \
                      pinbox build --image-store ./images --wheelhouse ./wheels\n  \
                      pinbox build ./service --output ./out --tag service:1.4.0\n  \
                      pinbox build --pin fastapi==0.116.1 --no-frozen"
    )]
    Build(BuildArgs),

    #[command(
        about = "Show what a build would produce without fetching anything",
        long_about = "Verifies the lock file against the manifest and prints the resolved plan: \
                      base image, tool, locked packages, and launch configuration.\n\n\
                      Examples:\n  \
                      pinbox plan\n  \
                      pinbox plan --format dockerfile"
    )]
    Plan(PlanArgs),

    #[command(
        about = "Run the startup command of a built image",
        long_about = "Unpacks an OCI image layout into a root directory and runs its startup \
                      command there. PORT is read from the environment (default 8002). \
                      Ctrl-C stops the process; the exit code is the process's exit code."
    )]
    Run(RunArgs),

    #[command(about = "Show the effective configuration")]
    Config(ConfigArgs),
}

#[derive(Parser, Debug, Clone, Default)]
pub struct ContextArgs {
    #[arg(
        value_name = "CONTEXT",
        help = "Build context directory (defaults to current directory)"
    )]
    pub context: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Recipe file (defaults to <CONTEXT>/pinbox.toml)")]
    pub recipe: Option<PathBuf>,

    #[arg(
        long,
        value_name = "NAME=VERSION",
        help = "Require the lock file to pin NAME at exactly VERSION (repeatable)"
    )]
    pub pin: Vec<String>,

    #[arg(long, help = "Allow other locked wheels of the same version when the primary one is unavailable")]
    pub no_frozen: bool,

    #[arg(long, value_name = "ARCH", help = "Target platform (x86_64, aarch64)")]
    pub platform: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(long, value_name = "DIR", help = "Local image store holding base and tool images")]
    pub image_store: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory of wheel files consulted before any URL")]
    pub wheelhouse: Option<PathBuf>,

    #[arg(
        short = 'o',
        long,
        value_name = "DIR",
        help = "OCI layout output directory (defaults to <CONTEXT>/image)"
    )]
    pub output: Option<PathBuf>,

    #[arg(
        short = 't',
        long,
        value_name = "NAME:TAG",
        default_value = "pinbox-app:local",
        help = "Reference name recorded in the layout index"
    )]
    pub tag: String,

    #[arg(long, help = "Keep fetched wheels in the image")]
    pub retain_cache: bool,

    #[arg(long, value_name = "SECONDS", help = "Timeout for each image pull and artifact fetch")]
    pub fetch_timeout: Option<u64>,

    #[arg(
        long,
        value_enum,
        value_name = "STAGE",
        help = "Stop after this stage and export the partial image"
    )]
    pub target: Option<StageArg>,
}

#[derive(Parser, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(value_name = "IMAGE", help = "OCI image layout directory")]
    pub image: PathBuf,

    #[arg(long, value_name = "NAME:TAG", help = "Manifest to run when the layout holds several")]
    pub tag: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Unpack into this directory instead of a temporary one"
    )]
    pub rootfs: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
    Dockerfile,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
            OutputFormatArg::Dockerfile => super::output::OutputFormat::Dockerfile,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageArg {
    Base,
    Tool,
    Dependencies,
    Assemble,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Base => Stage::BaseProvisioning,
            StageArg::Tool => Stage::ToolInjection,
            StageArg::Dependencies => Stage::DependencyResolution,
            StageArg::Assemble => Stage::ApplicationAssembly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_args_verify() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_default_build_args() {
        let args = CliArgs::parse_from(["pinbox", "build"]);
        match args.command {
            Commands::Build(build) => {
                assert!(build.context.context.is_none());
                assert!(build.context.pin.is_empty());
                assert!(!build.context.no_frozen);
                assert!(!build.retain_cache);
                assert_eq!(build.tag, "pinbox-app:local");
                assert!(build.target.is_none());
            }
            _ => panic!("Expected Build command"),
        }
        assert_eq!(args.log_format, LogFormatArg::Text);
    }

    #[test]
    fn test_build_with_options() {
        let args = CliArgs::parse_from([
            "pinbox",
            "build",
            "/srv/app",
            "--image-store",
            "/images",
            "--wheelhouse",
            "/wheels",
            "--pin",
            "fastapi==0.116.1",
            "--pin",
            "uvicorn=0.35.0",
            "--no-frozen",
            "--retain-cache",
            "--fetch-timeout",
            "5",
            "--target",
            "dependencies",
        ]);

        match args.command {
            Commands::Build(build) => {
                assert_eq!(build.context.context, Some(PathBuf::from("/srv/app")));
                assert_eq!(build.image_store, Some(PathBuf::from("/images")));
                assert_eq!(build.context.pin.len(), 2);
                assert!(build.context.no_frozen);
                assert!(build.retain_cache);
                assert_eq!(build.fetch_timeout, Some(5));
                assert_eq!(
                    build.target.map(Stage::from),
                    Some(Stage::DependencyResolution)
                );
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_plan_format() {
        let args = CliArgs::parse_from(["pinbox", "plan", "--format", "dockerfile"]);
        match args.command {
            Commands::Plan(plan) => assert_eq!(plan.format, OutputFormatArg::Dockerfile),
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_run_args() {
        let args = CliArgs::parse_from(["pinbox", "run", "./image", "--rootfs", "/tmp/root"]);
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.image, PathBuf::from("./image"));
                assert_eq!(run.rootfs, Some(PathBuf::from("/tmp/root")));
                assert!(run.tag.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = CliArgs::parse_from(["pinbox", "-v", "--log-format", "json", "config"]);
        assert!(args.verbose);
        assert!(!args.quiet);
        assert_eq!(args.log_format, LogFormatArg::Json);

        let args = CliArgs::parse_from(["pinbox", "--log-level", "debug", "config"]);
        assert_eq!(args.log_level, Some("debug".to_string()));
    }
}
