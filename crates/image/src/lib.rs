//! Image model for pinbox: pinned references, immutable layers, image
//! sources, and OCI layout export.

pub mod config;
pub mod digest;
pub mod export;
pub mod image;
pub mod layer;
pub mod oci_index;
pub mod reference;
pub mod source;

pub use config::{HistoryEntry, ImageConfig, OciImageConfig};
pub use digest::Digest;
pub use export::{export_layout, read_layout, unpack_layout, ExportedImage, LoadedLayout};
pub use image::{oci_architecture, Image, ImageBlobs};
pub use layer::{Layer, LayerBuilder, LayerEntry, LayerError};
pub use reference::{ImageRef, ReferenceError};
pub use source::{ImageSource, LocalImageStore, MemoryImageSource, PulledImage, SourceError};
