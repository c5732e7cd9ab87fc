//! Immutable filesystem layers with deterministic tar serialization.

use crate::digest::Digest;
use flate2::{Compression, GzBuilder};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o644;
pub const EXEC_MODE: u32 = 0o755;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("invalid layer path '{0}'")]
    InvalidPath(String),

    #[error("'{path}' conflicts with an existing {existing} entry")]
    Conflict { path: String, existing: &'static str },

    #[error("failed to serialize layer: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEntry {
    File { data: Arc<[u8]>, mode: u32 },
    Dir { mode: u32 },
    Symlink { target: String },
}

impl LayerEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LayerEntry::File { .. } => "file",
            LayerEntry::Dir { .. } => "directory",
            LayerEntry::Symlink { .. } => "symlink",
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, LayerEntry::File { mode, .. } if mode & 0o111 != 0)
    }
}

/// Normalize an in-image path to its relative, slash-separated form.
///
/// `/app/./server.py` and `app/server.py` both become `app/server.py`.
/// Parent references and the root itself are rejected.
pub fn normalize_path(path: &str) -> Result<String, LayerError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(LayerError::InvalidPath(path.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(LayerError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

#[derive(Debug, Default)]
pub struct LayerBuilder {
    entries: BTreeMap<String, LayerEntry>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&mut self, path: &str, mode: u32) -> Result<&mut Self, LayerError> {
        let path = normalize_path(path)?;
        self.ensure_parents(&path)?;
        self.insert(path, LayerEntry::Dir { mode })?;
        Ok(self)
    }

    pub fn add_file(
        &mut self,
        path: &str,
        data: impl Into<Arc<[u8]>>,
        mode: u32,
    ) -> Result<&mut Self, LayerError> {
        let path = normalize_path(path)?;
        self.ensure_parents(&path)?;
        self.insert(
            path,
            LayerEntry::File {
                data: data.into(),
                mode,
            },
        )?;
        Ok(self)
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> Result<&mut Self, LayerError> {
        let path = normalize_path(path)?;
        self.ensure_parents(&path)?;
        self.insert(
            path,
            LayerEntry::Symlink {
                target: target.to_string(),
            },
        )?;
        Ok(self)
    }

    pub fn contains(&self, path: &str) -> bool {
        normalize_path(path)
            .map(|p| self.entries.contains_key(&p))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the entries and freeze them into a [`Layer`].
    pub fn finish(self) -> Result<Layer, LayerError> {
        let tar = write_tar(&self.entries)?;
        let diff_id = Digest::sha256(&tar);
        Ok(Layer {
            inner: Arc::new(LayerInner {
                entries: self.entries,
                tar,
                diff_id,
            }),
        })
    }

    fn ensure_parents(&mut self, path: &str) -> Result<(), LayerError> {
        let mut end = 0;
        while let Some(offset) = path[end..].find('/') {
            end += offset;
            let parent = &path[..end];
            match self.entries.get(parent) {
                None => {
                    self.entries
                        .insert(parent.to_string(), LayerEntry::Dir { mode: DIR_MODE });
                }
                Some(LayerEntry::Dir { .. }) => {}
                Some(other) => {
                    return Err(LayerError::Conflict {
                        path: parent.to_string(),
                        existing: other.kind(),
                    })
                }
            }
            end += 1;
        }
        Ok(())
    }

    fn insert(&mut self, path: String, entry: LayerEntry) -> Result<(), LayerError> {
        if let (Some(LayerEntry::Dir { .. }), LayerEntry::File { .. } | LayerEntry::Symlink { .. }) =
            (self.entries.get(&path), &entry)
        {
            return Err(LayerError::Conflict {
                path,
                existing: "directory",
            });
        }
        self.entries.insert(path, entry);
        Ok(())
    }
}

fn write_tar(entries: &BTreeMap<String, LayerEntry>) -> Result<Vec<u8>, std::io::Error> {
    let mut builder = tar::Builder::new(Vec::new());

    for (path, entry) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        match entry {
            LayerEntry::Dir { mode } => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                builder.append_data(&mut header, path, std::io::empty())?;
            }
            LayerEntry::File { data, mode } => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, &data[..])?;
            }
            LayerEntry::Symlink { target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, path, target)?;
            }
        }
    }

    builder.into_inner()
}

#[derive(Debug)]
struct LayerInner {
    entries: BTreeMap<String, LayerEntry>,
    tar: Vec<u8>,
    diff_id: Digest,
}

/// A frozen layer. Cloning shares the underlying content.
#[derive(Debug, Clone)]
pub struct Layer {
    inner: Arc<LayerInner>,
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.diff_id == other.inner.diff_id
    }
}

impl Eq for Layer {}

impl Layer {
    /// Digest of the uncompressed tar stream.
    pub fn diff_id(&self) -> &Digest {
        &self.inner.diff_id
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &LayerEntry)> {
        self.inner.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, path: &str) -> Option<&LayerEntry> {
        let path = normalize_path(path).ok()?;
        self.inner.entries.get(&path)
    }

    pub fn tar_bytes(&self) -> &[u8] {
        &self.inner.tar
    }

    pub fn file_count(&self) -> usize {
        self.inner
            .entries
            .values()
            .filter(|e| matches!(e, LayerEntry::File { .. }))
            .count()
    }

    /// Gzip the tar stream with a zeroed header so the blob digest is stable.
    pub fn compress(&self) -> Result<(Vec<u8>, Digest), LayerError> {
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .write(Vec::new(), Compression::default());
        encoder.write_all(&self.inner.tar)?;
        let blob = encoder.finish()?;
        let digest = Digest::sha256(&blob);
        Ok((blob, digest))
    }
}

/// Look a path up across a layer stack, topmost layer first.
pub fn find_entry<'a>(layers: &'a [Layer], path: &str) -> Option<&'a LayerEntry> {
    layers.iter().rev().find_map(|layer| layer.get(path))
}
