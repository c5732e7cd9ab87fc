//! Local launch of a built image: unpack it into a rootfs directory, resolve
//! its command through the image `PATH`, and supervise the child process.

use async_trait::async_trait;
use pinbox_core::startup::{StartupConfig, StartupError, DEFAULT_PORT, PORT_ENV};
use pinbox_image::config::PATH_ENV;
use pinbox_image::{unpack_layout, ImageConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code reported when the child is killed on cancellation.
pub const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("image has no startup command")]
    MissingCommand,

    #[error("'{command}' not found on the image PATH ({searched})")]
    CommandNotFound { command: String, searched: String },

    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid startup configuration: {0}")]
    Startup(#[from] StartupError),

    #[error("failed to prepare image: {0:#}")]
    Image(#[from] anyhow::Error),
}

/// A fully resolved process to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// The only place a process may be started.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Run `spec` to completion and return its exit code. Cancelling kills
    /// the child.
    async fn run(&self, spec: &ProcessSpec, cancel: CancellationToken) -> Result<i32, LaunchError>;
}

/// Records every spec it is asked to run and returns a fixed exit code.
#[derive(Debug, Default)]
pub struct RecordingSpawner {
    specs: Mutex<Vec<ProcessSpec>>,
    exit_code: i32,
}

impl RecordingSpawner {
    pub fn new(exit_code: i32) -> Self {
        Self {
            specs: Mutex::new(Vec::new()),
            exit_code,
        }
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ProcessSpawner for RecordingSpawner {
    async fn run(&self, spec: &ProcessSpec, _cancel: CancellationToken) -> Result<i32, LaunchError> {
        if let Ok(mut specs) = self.specs.lock() {
            specs.push(spec.clone());
        }
        Ok(self.exit_code)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn run(&self, spec: &ProcessSpec, cancel: CancellationToken) -> Result<i32, LaunchError> {
        let spawn_error = |source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        };

        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(&spec.env)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        info!(
            program = %spec.program.display(),
            pid = child.id().unwrap_or_default(),
            "Process started"
        );

        tokio::select! {
            status = child.wait() => {
                let code = exit_code(status.map_err(spawn_error)?);
                info!(exit_code = code, "Process exited");
                Ok(code)
            }
            _ = cancel.cancelled() => {
                warn!("Cancelled, killing process");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill process");
                }
                Ok(CANCELLED_EXIT_CODE)
            }
        }
    }
}

fn in_rootfs(rootfs: &Path, image_path: &str) -> PathBuf {
    rootfs.join(image_path.trim_start_matches('/'))
}

/// Find `command` the way a shell would, but inside `rootfs`.
pub fn resolve_command(
    rootfs: &Path,
    command: &str,
    search_path: &[String],
) -> Result<PathBuf, LaunchError> {
    if command.contains('/') {
        let candidate = in_rootfs(rootfs, command);
        if candidate.is_file() {
            return Ok(candidate);
        }
    } else {
        for dir in search_path {
            let candidate = in_rootfs(rootfs, dir).join(command);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(LaunchError::CommandNotFound {
        command: command.to_string(),
        searched: search_path.join(":"),
    })
}

/// Host-side variable lookup consulted once at launch.
pub type HostEnv<'a> = &'a (dyn Fn(&str) -> Option<String> + Sync);

/// Startup values for `config`: the image's declared `PORT`, replaced only
/// when the host sets one.
pub fn startup_config(config: &ImageConfig, host: HostEnv<'_>) -> Result<StartupConfig, StartupError> {
    let declared = config
        .env_value(PORT_ENV)
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
        .unwrap_or(DEFAULT_PORT);
    StartupConfig::from_lookup_with_default(host, declared)
}

/// Turn an image config into a process rooted at `rootfs`. `PORT` is the
/// image's unless `host` overrides it; image paths in `PATH` and
/// `VIRTUAL_ENV` are mapped into the rootfs.
pub fn prepare(rootfs: &Path, config: &ImageConfig, host: HostEnv<'_>) -> Result<ProcessSpec, LaunchError> {
    let (command, args) = config.cmd.split_first().ok_or(LaunchError::MissingCommand)?;
    let search_path = config.search_path();
    let program = resolve_command(rootfs, command, &search_path)?;
    let startup = startup_config(config, host)?;

    let mut env = config.env_map();
    for (key, value) in startup.env_pairs() {
        env.insert(key, value);
    }

    let mut path: Vec<String> = search_path
        .iter()
        .map(|dir| in_rootfs(rootfs, dir).display().to_string())
        .collect();
    if let Ok(host_path) = std::env::var(PATH_ENV) {
        path.push(host_path);
    }
    env.insert(PATH_ENV.to_string(), path.join(":"));
    if let Some(venv) = env.get("VIRTUAL_ENV").cloned() {
        env.insert(
            "VIRTUAL_ENV".to_string(),
            in_rootfs(rootfs, &venv).display().to_string(),
        );
    }

    let cwd = match &config.working_dir {
        Some(dir) => in_rootfs(rootfs, dir),
        None => rootfs.to_path_buf(),
    };

    debug!(
        program = %program.display(),
        cwd = %cwd.display(),
        port = env.get(PORT_ENV).map(String::as_str).unwrap_or_default(),
        "Prepared launch"
    );

    Ok(ProcessSpec {
        program,
        args: args.to_vec(),
        cwd,
        env,
    })
}

pub struct Launcher {
    spawner: Arc<dyn ProcessSpawner>,
}

impl Launcher {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { spawner }
    }

    /// Run the startup command of an already unpacked image.
    pub async fn run(
        &self,
        rootfs: &Path,
        config: &ImageConfig,
        host: HostEnv<'_>,
        cancel: CancellationToken,
    ) -> Result<i32, LaunchError> {
        let spec = prepare(rootfs, config, host)?;
        self.spawner.run(&spec, cancel).await
    }

    /// Unpack an exported layout into `rootfs`, then run its startup command.
    pub async fn run_layout(
        &self,
        layout_dir: &Path,
        tag: Option<&str>,
        rootfs: &Path,
        host: HostEnv<'_>,
        cancel: CancellationToken,
    ) -> Result<i32, LaunchError> {
        let layout_dir = layout_dir.to_path_buf();
        let tag = tag.map(String::from);
        let target = rootfs.to_path_buf();
        let layout = tokio::task::spawn_blocking(move || {
            unpack_layout(&layout_dir, tag.as_deref(), &target)
        })
        .await
        .map_err(|e| LaunchError::Image(anyhow::anyhow!("unpack task failed: {}", e)))??;

        self.run(rootfs, &layout.config.config, host, cancel).await
    }
}
