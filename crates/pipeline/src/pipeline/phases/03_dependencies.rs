use crate::pipeline::context::BuildContext;
use crate::pipeline::phase_trait::BuildStage;
use crate::pipeline::state::{DepsReady, ToolReady};
use async_trait::async_trait;
use pinbox_core::error::{BuildError, Stage};
use pinbox_core::progress::ProgressEvent;
use pinbox_deps::error::{FetchError, LockError};
use pinbox_deps::{
    verify, verify_hash, Artifact, InstalledPackage, LockFile, Manifest, MarkerEnvironment,
    PythonVersion, ResolvedPackage, ResolvedSet, TargetEnvironment, VenvLayout, WheelInstaller,
};
use pinbox_image::layer::FILE_MODE;
use pinbox_image::{HistoryEntry, LayerBuilder};
use std::path::Path;
use tracing::{debug, info, warn};

/// Where fetched wheels are kept when `retain_cache` is set.
pub const CACHE_DIR: &str = "/root/.cache/pinbox/wheels";

/// Set by the official python images to the interpreter's full version.
const PYTHON_VERSION_ENV: &str = "PYTHON_VERSION";

const STAGE: Stage = Stage::DependencyResolution;

/// The manifest pair as read from the build context.
pub(crate) struct ManifestPair {
    pub manifest: Manifest,
    pub manifest_bytes: Vec<u8>,
    pub lock: LockFile,
    pub lock_bytes: Vec<u8>,
}

fn read_context_file(context: &BuildContext, name: &str) -> Result<Vec<u8>, BuildError> {
    let path = context.context_path(name);
    if !context.fs.is_file(&path) {
        return Err(BuildError::LockMismatch {
            stage: STAGE,
            package: name.to_string(),
            reason: format!("{} not found in build context", path.display()),
        });
    }
    context.fs.read(&path).map_err(|e| BuildError::Io {
        stage: STAGE,
        artifact: name.to_string(),
        source: std::io::Error::other(e.to_string()),
    })
}

fn utf8(name: &str, bytes: &[u8]) -> Result<String, BuildError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| BuildError::InvalidInput {
        stage: STAGE,
        artifact: name.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn read_manifest_pair(context: &BuildContext) -> Result<ManifestPair, BuildError> {
    let app = &context.recipe.app;
    let manifest_bytes = read_context_file(context, &app.manifest)?;
    let lock_bytes = read_context_file(context, &app.lock)?;

    let invalid = |e: pinbox_deps::error::ParseError| BuildError::InvalidInput {
        stage: STAGE,
        artifact: e.file,
        reason: e.reason,
    };
    let manifest =
        Manifest::parse_named(&utf8(&app.manifest, &manifest_bytes)?, &app.manifest).map_err(invalid)?;
    let lock = LockFile::parse_named(&utf8(&app.lock, &lock_bytes)?, &app.lock).map_err(invalid)?;

    Ok(ManifestPair {
        manifest,
        manifest_bytes,
        lock,
        lock_bytes,
    })
}

pub(crate) fn lock_mismatch(err: LockError) -> BuildError {
    match err {
        LockError::Parse(e) => BuildError::InvalidInput {
            stage: STAGE,
            artifact: e.file,
            reason: e.reason,
        },
        other => BuildError::LockMismatch {
            stage: STAGE,
            package: other.package().to_string(),
            reason: other.to_string(),
        },
    }
}

/// Interpreter version for the target: the base image tag first, then the
/// manifest's `requires-python`.
pub(crate) fn target_python(base_tag: &str, manifest: &Manifest) -> PythonVersion {
    PythonVersion::resolve(base_tag, manifest.requires_python.as_deref())
}

/// Check the manifest pair and return what to install. No fetch happens here.
/// `full_version` is the base image's `PYTHON_VERSION`, when known.
pub(crate) fn resolve(
    context: &BuildContext,
    pair: &ManifestPair,
    python: PythonVersion,
    full_version: Option<&str>,
) -> Result<ResolvedSet, BuildError> {
    let mut env = MarkerEnvironment::linux(python, &context.platform);
    if let Some(full) = full_version {
        env = env.with_full_version(full);
    }
    verify(
        &pair.manifest,
        &pair.lock,
        &context.options.pinned_versions,
        &env,
    )
    .map_err(lock_mismatch)
}

/// Artifacts to try for one package, best first. Frozen builds only ever get
/// the primary candidate.
pub(crate) fn candidates(
    target: &TargetEnvironment,
    package: &ResolvedPackage,
    frozen: bool,
) -> Result<Vec<Artifact>, BuildError> {
    let selected = target.select(&package.wheels, &package.version);
    if selected.is_empty() {
        let artifact = package
            .sdist
            .as_ref()
            .and_then(|s| s.file_name())
            .unwrap_or_else(|| "-".to_string());
        return Err(BuildError::FetchDenied {
            stage: STAGE,
            package: package.name.clone(),
            artifact,
            reason: format!(
                "no locked wheel of {} is compatible with {} {}",
                package.version,
                target.python.cpython_tag(),
                target.arch
            ),
        });
    }

    let limit = if frozen { 1 } else { selected.len() };
    Ok(selected
        .into_iter()
        .take(limit)
        .filter_map(|(locked, _)| Artifact::from_locked(&package.name, &package.version, locked))
        .collect())
}

async fn fetch_verified(context: &BuildContext, artifact: &Artifact) -> Result<Vec<u8>, FetchError> {
    let bytes = match tokio::time::timeout(context.fetch_timeout, context.fetcher.fetch(artifact)).await
    {
        Err(_) => {
            return Err(FetchError::Timeout {
                artifact: artifact.file_name.clone(),
                secs: context.fetch_timeout.as_secs(),
            })
        }
        Ok(result) => result?,
    };
    verify_hash(artifact, &bytes)?;
    Ok(bytes)
}

async fn fetch_package(
    context: &BuildContext,
    package: &ResolvedPackage,
    candidates: Vec<Artifact>,
) -> Result<(Artifact, Vec<u8>), BuildError> {
    let mut last_failure: Option<(String, FetchError)> = None;

    for artifact in candidates {
        match fetch_verified(context, &artifact).await {
            Ok(bytes) => {
                debug!(
                    package = %package.name,
                    artifact = %artifact.file_name,
                    bytes = bytes.len(),
                    "Artifact fetched"
                );
                return Ok((artifact, bytes));
            }
            Err(e) => {
                if !context.options.frozen {
                    warn!(
                        package = %package.name,
                        artifact = %artifact.file_name,
                        error = %e,
                        "Artifact unavailable, trying next locked wheel"
                    );
                }
                last_failure = Some((artifact.file_name.clone(), e));
            }
        }
    }

    let (artifact, reason) = match last_failure {
        Some((artifact, e)) => (artifact, e.to_string()),
        None => ("-".to_string(), "no fetchable artifact recorded".to_string()),
    };
    Err(BuildError::FetchDenied {
        stage: STAGE,
        package: package.name.clone(),
        artifact,
        reason,
    })
}

fn layer_error(artifact: &str, e: impl ToString) -> BuildError {
    BuildError::InvalidInput {
        stage: STAGE,
        artifact: artifact.to_string(),
        reason: e.to_string(),
    }
}

fn sync_command(frozen: bool, retain_cache: bool) -> String {
    let mut parts = vec!["uv", "sync"];
    if frozen {
        parts.push("--frozen");
    }
    if !retain_cache {
        parts.push("--no-cache");
    }
    parts.join(" ")
}

pub struct DependencyStage;

#[async_trait]
impl BuildStage for DependencyStage {
    type Input = ToolReady;
    type Output = DepsReady;

    fn stage(&self) -> Stage {
        STAGE
    }

    async fn execute(&self, context: &BuildContext, tool: ToolReady) -> Result<DepsReady, BuildError> {
        let pair = read_manifest_pair(context)?;
        let python = target_python(tool.base.reference.tag(), &pair.manifest);
        let full_version = tool.base.image.config().env_value(PYTHON_VERSION_ENV);
        let resolved = resolve(context, &pair, python, full_version)?;

        info!(
            project = %resolved.project,
            packages = resolved.len(),
            python = %python,
            frozen = context.options.frozen,
            "Lock file verified"
        );

        let target = TargetEnvironment::new(python, context.platform.clone());
        let mut fetched = Vec::with_capacity(resolved.len());
        for package in &resolved.packages {
            let candidates = candidates(&target, package, context.options.frozen)?;
            let (artifact, bytes) = fetch_package(context, package, candidates).await?;
            context.report(ProgressEvent::ArtifactFetched {
                package: package.name.clone(),
                artifact: artifact.file_name.clone(),
                bytes: bytes.len(),
            });
            fetched.push((package, artifact, bytes));
        }

        let app = &context.recipe.app;
        let mut builder = LayerBuilder::new();
        for (name, bytes) in [
            (&app.manifest, &pair.manifest_bytes),
            (&app.lock, &pair.lock_bytes),
        ] {
            let file_name = Path::new(name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(name.as_str());
            builder
                .add_file(&app.in_workdir(file_name), bytes.clone(), FILE_MODE)
                .map_err(|e| layer_error(name, e))?;
        }

        let installer = WheelInstaller::new(VenvLayout::in_workdir(&app.workdir, python));
        installer
            .create_venv(&mut builder)
            .map_err(|e| layer_error(installer.layout().root(), e))?;

        let mut installed: Vec<InstalledPackage> = Vec::with_capacity(fetched.len());
        for (package, artifact, bytes) in &fetched {
            let package_files = installer
                .install(&mut builder, &package.name, &package.version, bytes)
                .map_err(|e| layer_error(&artifact.file_name, e))?;
            context.report(ProgressEvent::PackageInstalled {
                name: package_files.name.clone(),
                version: package_files.version.clone(),
                files: package_files.files,
            });
            installed.push(package_files);

            if context.options.retain_cache {
                builder
                    .add_file(
                        &format!("{}/{}", CACHE_DIR, artifact.file_name),
                        bytes.clone(),
                        FILE_MODE,
                    )
                    .map_err(|e| layer_error(&artifact.file_name, e))?;
            }
        }

        let record = installer
            .write_record(&mut builder, &installed)
            .map_err(|e| layer_error(&installer.layout().record_path(), e))?;
        let layer = builder
            .finish()
            .map_err(|e| layer_error(installer.layout().root(), e))?;

        let mut image = tool.image.clone();
        image.push_layer(
            layer,
            HistoryEntry::layer(format!(
                "RUN {}",
                sync_command(context.options.frozen, context.options.retain_cache)
            ))
            .with_comment(format!("{} packages", installed.len())),
        );

        info!(
            installed = installed.len(),
            retain_cache = context.options.retain_cache,
            "Dependencies installed"
        );

        Ok(DepsReady {
            tool,
            image,
            python,
            resolved,
            record,
        })
    }
}
