//! OCI image layout export and unpacking.

use crate::config::OciImageConfig;
use crate::digest::Digest;
use crate::image::Image;
use crate::oci_index::{OciIndex, OciLayout, OciManifest, OCI_INDEX_FILE, OCI_LAYOUT_FILE};
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedImage {
    pub path: PathBuf,
    pub tag: String,
    pub manifest_digest: Digest,
    pub config_digest: Digest,
    pub layer_digests: Vec<Digest>,
}

/// Write `image` as an OCI image layout at `dest`.
///
/// The layout is staged next to `dest` and renamed into place, so readers
/// see either the previous layout or the complete new one.
pub fn export_layout(image: &Image, dest: &Path, tag: &str) -> Result<ExportedImage> {
    let blobs = image.blobs().context("Failed to serialize image")?;

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = dest
        .file_name()
        .with_context(|| format!("Invalid export path {}", dest.display()))?
        .to_string_lossy()
        .to_string();
    fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let lock_path = parent.join(format!(".{}.lock", name));
    let lock = fs::File::create(&lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
    lock.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", lock_path.display()))?;

    let staging = tempfile::Builder::new()
        .prefix(&format!(".{}.staging-", name))
        .tempdir_in(&parent)
        .context("Failed to create staging directory")?;
    let root = staging.path();

    fs::write(
        root.join(OCI_LAYOUT_FILE),
        serde_json::to_vec(&OciLayout::default())?,
    )?;
    write_blob(root, &blobs.config_digest, &blobs.config)?;
    for (digest, blob) in &blobs.layers {
        write_blob(root, digest, blob)?;
    }
    write_blob(root, &blobs.manifest_digest, &blobs.manifest)?;

    let mut index = OciIndex::new();
    index.add_or_update_manifest(
        blobs.manifest_digest.to_string(),
        blobs.manifest.len() as u64,
        tag,
    );
    index.write_to_file(&root.join(OCI_INDEX_FILE))?;

    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("Failed to replace {}", dest.display()))?;
    }
    fs::rename(root, dest)
        .with_context(|| format!("Failed to move layout into {}", dest.display()))?;
    drop(staging);

    FileExt::unlock(&lock).ok();
    let _ = fs::remove_file(&lock_path);

    info!(
        "Exported image {} ({}) to {}",
        tag,
        blobs.manifest_digest,
        dest.display()
    );

    Ok(ExportedImage {
        path: dest.to_path_buf(),
        tag: tag.to_string(),
        manifest_digest: blobs.manifest_digest,
        config_digest: blobs.config_digest,
        layer_digests: blobs.layers.into_iter().map(|(d, _)| d).collect(),
    })
}

fn write_blob(root: &Path, digest: &Digest, bytes: &[u8]) -> Result<()> {
    let path = digest.to_blob_path(root);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&path, bytes).with_context(|| format!("Failed to write blob {}", digest))?;
    debug!("Wrote blob {} ({} bytes)", digest, bytes.len());
    Ok(())
}

fn read_blob(root: &Path, digest: &str) -> Result<Vec<u8>> {
    let digest = Digest::parse(digest)?;
    let path = digest.to_blob_path(root);
    let bytes = fs::read(&path).with_context(|| format!("Missing blob {}", digest))?;
    if !digest.verify(&bytes) {
        bail!("Blob {} does not match its digest", digest);
    }
    Ok(bytes)
}

#[derive(Debug, Clone)]
pub struct LoadedLayout {
    pub manifest_digest: Digest,
    pub manifest: OciManifest,
    pub config: OciImageConfig,
}

/// Read and verify the manifest and config of a layout directory.
pub fn read_layout(dir: &Path, tag: Option<&str>) -> Result<LoadedLayout> {
    if !dir.join(OCI_LAYOUT_FILE).is_file() {
        bail!("{} is not an OCI image layout", dir.display());
    }
    let index = OciIndex::read_from_file(&dir.join(OCI_INDEX_FILE))?;
    let descriptor = index.find_manifest(tag).with_context(|| match tag {
        Some(tag) => format!("No manifest tagged '{}' in {}", tag, dir.display()),
        None => format!("Expected exactly one manifest in {}", dir.display()),
    })?;

    let manifest_bytes = read_blob(dir, &descriptor.digest)?;
    let manifest: OciManifest =
        serde_json::from_slice(&manifest_bytes).context("Failed to parse manifest")?;
    let config_bytes = read_blob(dir, &manifest.config.digest)?;
    let config: OciImageConfig =
        serde_json::from_slice(&config_bytes).context("Failed to parse image config")?;

    Ok(LoadedLayout {
        manifest_digest: Digest::parse(&descriptor.digest)?,
        manifest,
        config,
    })
}

/// Extract every layer of the layout into `rootfs`, bottom layer first.
pub fn unpack_layout(dir: &Path, tag: Option<&str>, rootfs: &Path) -> Result<LoadedLayout> {
    let layout = read_layout(dir, tag)?;
    fs::create_dir_all(rootfs)
        .with_context(|| format!("Failed to create {}", rootfs.display()))?;

    for layer in &layout.manifest.layers {
        let blob = read_blob(dir, &layer.digest)?;
        let mut archive = tar::Archive::new(GzDecoder::new(blob.as_slice()));
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive
            .unpack(rootfs)
            .with_context(|| format!("Failed to unpack layer {}", layer.digest))?;
        debug!("Unpacked layer {}", layer.digest);
    }

    info!(
        "Unpacked {} layers of {} into {}",
        layout.manifest.layers.len(),
        layout.manifest_digest,
        rootfs.display()
    );
    Ok(layout)
}
