//! Where base and tool images come from.

use crate::config::ImageConfig;
use crate::digest::Digest;
use crate::layer::{find_entry, Layer, LayerBuilder, LayerEntry, LayerError};
use crate::reference::ImageRef;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

pub const ROOTFS_DIR: &str = "rootfs";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{reference} is not available from {source_name}")]
    NotFound {
        reference: String,
        source_name: String,
    },

    #[error("{reference} is malformed: {reason}")]
    Invalid { reference: String, reason: String },

    #[error("failed to read {reference}: {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

/// An image fetched from a source, reduced to its layers and runtime config.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub reference: ImageRef,
    pub digest: Digest,
    pub layers: Vec<Layer>,
    pub config: ImageConfig,
}

#[derive(Serialize)]
struct ContentIdentity<'a> {
    config: &'a ImageConfig,
    diff_ids: Vec<String>,
}

impl PulledImage {
    /// The digest covers the config and every layer's diff id.
    pub fn new(reference: ImageRef, layers: Vec<Layer>, config: ImageConfig) -> Self {
        let identity = ContentIdentity {
            config: &config,
            diff_ids: layers.iter().map(|l| l.diff_id().to_string()).collect(),
        };
        let bytes = serde_json::to_vec(&identity).unwrap_or_default();
        Self {
            reference,
            digest: Digest::sha256(&bytes),
            layers,
            config,
        }
    }

    pub fn find(&self, path: &str) -> Option<&LayerEntry> {
        find_entry(&self.layers, path)
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &str;

    async fn pull(&self, reference: &ImageRef) -> Result<PulledImage, SourceError>;
}

/// Images stored as unpacked directories:
/// `<root>/<registry>/<repository>/<tag>/rootfs/` with an optional
/// `config.json` next to `rootfs/`.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_dir(&self, reference: &ImageRef) -> PathBuf {
        self.root.join(reference.store_path())
    }
}

#[async_trait]
impl ImageSource for LocalImageStore {
    fn name(&self) -> &str {
        "local image store"
    }

    async fn pull(&self, reference: &ImageRef) -> Result<PulledImage, SourceError> {
        let dir = self.image_dir(reference);
        let rootfs = dir.join(ROOTFS_DIR);
        if !rootfs.is_dir() {
            return Err(SourceError::NotFound {
                reference: reference.to_string(),
                source_name: format!("{} ({})", self.name(), self.root.display()),
            });
        }

        debug!("Loading {} from {}", reference, dir.display());
        let owned = reference.clone();
        tokio::task::spawn_blocking(move || load_image_dir(&owned, &dir))
            .await
            .map_err(|e| SourceError::Io {
                reference: reference.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
    }
}

fn load_image_dir(reference: &ImageRef, dir: &Path) -> Result<PulledImage, SourceError> {
    let io_err = |source: std::io::Error| SourceError::Io {
        reference: reference.to_string(),
        source,
    };
    let layer_err = |e: LayerError| SourceError::Invalid {
        reference: reference.to_string(),
        reason: e.to_string(),
    };

    let config_path = dir.join(CONFIG_FILE);
    let config = if config_path.is_file() {
        let raw = std::fs::read(&config_path).map_err(io_err)?;
        serde_json::from_slice(&raw).map_err(|e| SourceError::Invalid {
            reference: reference.to_string(),
            reason: format!("{}: {}", CONFIG_FILE, e),
        })?
    } else {
        ImageConfig::default()
    };

    let rootfs = dir.join(ROOTFS_DIR);
    let mut builder = LayerBuilder::new();
    for entry in WalkDir::new(&rootfs)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| io_err(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(&rootfs)
            .map_err(|e| SourceError::Invalid {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(io_err)?;
            builder
                .add_symlink(&relative, &target.to_string_lossy())
                .map_err(layer_err)?;
        } else if file_type.is_dir() {
            let mode = permissions(entry.path()).map_err(io_err)?;
            builder.add_dir(&relative, mode).map_err(layer_err)?;
        } else {
            let data = std::fs::read(entry.path()).map_err(io_err)?;
            let mode = permissions(entry.path()).map_err(io_err)?;
            builder.add_file(&relative, data, mode).map_err(layer_err)?;
        }
    }

    let layer = builder.finish().map_err(layer_err)?;
    Ok(PulledImage::new(reference.clone(), vec![layer], config))
}

#[cfg(unix)]
fn permissions(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permissions(path: &Path) -> std::io::Result<u32> {
    let meta = std::fs::metadata(path)?;
    Ok(if meta.is_dir() { 0o755 } else { 0o644 })
}

/// In-memory source for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryImageSource {
    images: RwLock<HashMap<String, (Vec<Layer>, ImageConfig)>>,
    delay: Option<Duration>,
    pulls: Mutex<Vec<String>>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every pull, to exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, reference: &ImageRef, layers: Vec<Layer>, config: ImageConfig) {
        if let Ok(mut images) = self.images.write() {
            images.insert(reference.tagged(), (layers, config));
        }
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.lock().map(|p| p.len()).unwrap_or_default()
    }

    /// References pulled so far, in order.
    pub fn pulled(&self) -> Vec<String> {
        self.pulls.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ImageSource for MemoryImageSource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn pull(&self, reference: &ImageRef) -> Result<PulledImage, SourceError> {
        if let Ok(mut pulls) = self.pulls.lock() {
            pulls.push(reference.tagged());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let found = self
            .images
            .read()
            .ok()
            .and_then(|images| images.get(&reference.tagged()).cloned());

        match found {
            Some((layers, config)) => Ok(PulledImage::new(reference.clone(), layers, config)),
            None => Err(SourceError::NotFound {
                reference: reference.to_string(),
                source_name: self.name().to_string(),
            }),
        }
    }
}
