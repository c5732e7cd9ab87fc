use crate::config::{HistoryEntry, ImageConfig, OciImageConfig, RootFs};
use crate::digest::Digest;
use crate::layer::{find_entry, Layer, LayerEntry, LayerError};
use crate::oci_index::{
    OciDescriptor, OciManifest, OCI_CONFIG_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE,
};

/// Map a platform name to its OCI architecture.
pub fn oci_architecture(platform: &str) -> &str {
    match platform {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// An image under construction or complete: an ordered layer stack plus
/// runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    architecture: String,
    layers: Vec<Layer>,
    config: ImageConfig,
    history: Vec<HistoryEntry>,
}

impl Image {
    pub fn new(platform: &str) -> Self {
        Self {
            architecture: oci_architecture(platform).to_string(),
            layers: Vec::new(),
            config: ImageConfig::default(),
            history: Vec::new(),
        }
    }

    pub fn from_parts(platform: &str, layers: Vec<Layer>, config: ImageConfig) -> Self {
        Self {
            architecture: oci_architecture(platform).to_string(),
            layers,
            config,
            history: Vec::new(),
        }
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ImageConfig {
        &mut self.config
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn push_layer(&mut self, layer: Layer, history: HistoryEntry) {
        self.layers.push(layer);
        self.history.push(HistoryEntry {
            empty_layer: false,
            ..history
        });
    }

    pub fn push_history(&mut self, history: HistoryEntry) {
        self.history.push(history);
    }

    pub fn find(&self, path: &str) -> Option<&LayerEntry> {
        find_entry(&self.layers, path)
    }

    pub fn oci_config(&self) -> OciImageConfig {
        OciImageConfig {
            architecture: self.architecture.clone(),
            os: "linux".to_string(),
            config: self.config.clone(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: self.layers.iter().map(|l| l.diff_id().to_string()).collect(),
            },
            history: self.history.clone(),
        }
    }

    /// Serialize into content-addressed blobs.
    pub fn blobs(&self) -> Result<ImageBlobs, LayerError> {
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (blob, digest) = layer.compress()?;
            descriptors.push(OciDescriptor::new(
                OCI_LAYER_MEDIA_TYPE,
                digest.to_string(),
                blob.len() as u64,
            ));
            layers.push((digest, blob));
        }

        let config = serde_json::to_vec(&self.oci_config()).map_err(std::io::Error::from)?;
        let config_digest = Digest::sha256(&config);
        let manifest = OciManifest::new(
            OciDescriptor::new(
                OCI_CONFIG_MEDIA_TYPE,
                config_digest.to_string(),
                config.len() as u64,
            ),
            descriptors,
        );
        let manifest = serde_json::to_vec(&manifest).map_err(std::io::Error::from)?;
        let manifest_digest = Digest::sha256(&manifest);

        Ok(ImageBlobs {
            manifest,
            manifest_digest,
            config,
            config_digest,
            layers,
        })
    }

    /// Identity of the image: the digest of its manifest.
    pub fn digest(&self) -> Result<Digest, LayerError> {
        Ok(self.blobs()?.manifest_digest)
    }
}

#[derive(Debug, Clone)]
pub struct ImageBlobs {
    pub manifest: Vec<u8>,
    pub manifest_digest: Digest,
    pub config: Vec<u8>,
    pub config_digest: Digest,
    pub layers: Vec<(Digest, Vec<u8>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerBuilder, FILE_MODE};

    fn layer(path: &str, content: &[u8]) -> Layer {
        let mut builder = LayerBuilder::new();
        builder.add_file(path, content.to_vec(), FILE_MODE).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_digest_is_stable() {
        let mut first = Image::new("x86_64");
        first.push_layer(layer("a.txt", b"a"), HistoryEntry::layer("COPY a.txt"));
        first.config_mut().set_env("PORT", "8002");
        let second = first.clone();

        assert_eq!(first.digest().unwrap(), second.digest().unwrap());
        assert_eq!(first.architecture(), "amd64");
    }

    #[test]
    fn test_config_change_changes_digest() {
        let mut first = Image::new("x86_64");
        first.push_layer(layer("a.txt", b"a"), HistoryEntry::layer("COPY a.txt"));
        let mut second = first.clone();
        second.config_mut().set_env("PORT", "9000");

        assert_ne!(first.digest().unwrap(), second.digest().unwrap());
    }

    #[test]
    fn test_oci_config_lists_diff_ids_in_order() {
        let lower = layer("a.txt", b"a");
        let upper = layer("b.txt", b"b");
        let mut image = Image::new("aarch64");
        image.push_layer(lower.clone(), HistoryEntry::layer("base"));
        image.push_history(HistoryEntry::empty("ENV PORT=8002"));
        image.push_layer(upper.clone(), HistoryEntry::layer("app"));

        let config = image.oci_config();
        assert_eq!(config.architecture, "arm64");
        assert_eq!(
            config.rootfs.diff_ids,
            vec![lower.diff_id().to_string(), upper.diff_id().to_string()]
        );
        assert_eq!(config.history.len(), 3);
        assert!(config.history[1].empty_layer);
    }

    #[test]
    fn test_blobs_reference_each_other() {
        let mut image = Image::new("x86_64");
        image.push_layer(layer("a.txt", b"a"), HistoryEntry::layer("COPY a.txt"));
        let blobs = image.blobs().unwrap();

        let manifest: OciManifest = serde_json::from_slice(&blobs.manifest).unwrap();
        assert_eq!(manifest.config.digest, blobs.config_digest.to_string());
        assert_eq!(manifest.layers[0].digest, blobs.layers[0].0.to_string());
        assert!(blobs.manifest_digest.verify(&blobs.manifest));
    }
}
