pub mod config;
pub mod error;
pub mod fs;
pub mod output;
pub mod progress;
pub mod startup;

pub use config::{BuildOptions, ConfigError, PinboxConfig};
pub use error::{BuildError, Stage};
pub use fs::{FileSystem, MockFileSystem, RealFileSystem};
pub use output::schema::BuildPlan;
pub use progress::{LoggingHandler, ProgressEvent, ProgressHandler};
pub use startup::{StartupConfig, StartupError, DEFAULT_PORT};
