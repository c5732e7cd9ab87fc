use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";
pub const OCI_INDEX_FILE: &str = "index.json";
const OCI_SCHEMA_VERSION: i32 = 2;
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLayout {
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        Self {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciDescriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: None,
        }
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: i32,
    pub media_type: String,
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
}

impl OciManifest {
    pub fn new(config: OciDescriptor, layers: Vec<OciDescriptor>) -> Self {
        Self {
            schema_version: OCI_SCHEMA_VERSION,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<OciDescriptor>,
}

impl OciIndex {
    pub fn new() -> Self {
        Self {
            schema_version: OCI_SCHEMA_VERSION,
            media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
        }
    }

    pub fn read_from_file(index_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(index_path)
            .with_context(|| format!("Failed to read index file from {}", index_path.display()))?;

        let index: OciIndex = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse index file from {}", index_path.display()))?;

        debug!("Read index file with {} manifests", index.manifests.len());
        Ok(index)
    }

    pub fn write_to_file(&self, index_path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize index")?;

        fs::write(index_path, content)
            .with_context(|| format!("Failed to write index to {}", index_path.display()))?;

        debug!(
            "Wrote index with {} manifests to {}",
            self.manifests.len(),
            index_path.display()
        );
        Ok(())
    }

    pub fn add_or_update_manifest(&mut self, digest: String, size: u64, tag: &str) {
        self.manifests.retain(|m| m.ref_name() != Some(tag));

        let mut descriptor = OciDescriptor::new(OCI_MANIFEST_MEDIA_TYPE, digest, size);
        descriptor.annotations = Some(BTreeMap::from([(
            ANNOTATION_REF_NAME.to_string(),
            tag.to_string(),
        )]));
        self.manifests.push(descriptor);
        self.sort_manifests();

        debug!("Added manifest to index with tag '{}'", tag);
    }

    /// Manifest for `tag`, or the only manifest when no tag is given.
    pub fn find_manifest(&self, tag: Option<&str>) -> Option<&OciDescriptor> {
        match tag {
            Some(tag) => self.manifests.iter().find(|m| m.ref_name() == Some(tag)),
            None if self.manifests.len() == 1 => self.manifests.first(),
            None => None,
        }
    }

    pub fn sort_manifests(&mut self) {
        self.manifests.sort_by(|a, b| {
            a.ref_name()
                .cmp(&b.ref_name())
                .then(a.digest.cmp(&b.digest))
        });
    }
}

impl Default for OciIndex {
    fn default() -> Self {
        Self::new()
    }
}
