use crate::recipe::BuildRecipe;
use pinbox_core::config::BuildOptions;
use pinbox_core::fs::{FileSystem, RealFileSystem};
use pinbox_core::progress::{NoOpHandler, ProgressEvent, ProgressHandler};
use pinbox_deps::ArtifactFetcher;
use pinbox_image::ImageSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PLATFORM: &str = "x86_64";

/// Everything a stage may consult. Shared read-only across stages; all state
/// produced by a stage flows through its typed output instead.
pub struct BuildContext {
    pub context_dir: PathBuf,
    pub fs: Arc<dyn FileSystem>,
    pub recipe: BuildRecipe,
    pub options: BuildOptions,
    pub platform: String,
    pub image_source: Arc<dyn ImageSource>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub progress: Arc<dyn ProgressHandler>,
    pub fetch_timeout: Duration,
}

impl BuildContext {
    pub fn new(
        context_dir: impl Into<PathBuf>,
        recipe: BuildRecipe,
        image_source: Arc<dyn ImageSource>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let options = recipe.options.clone();
        Self {
            context_dir: context_dir.into(),
            fs: Arc::new(RealFileSystem),
            recipe,
            options,
            platform: DEFAULT_PLATFORM.to_string(),
            image_source,
            fetcher,
            progress: Arc::new(NoOpHandler),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_image_source(mut self, image_source: Arc<dyn ImageSource>) -> Self {
        self.image_source = image_source;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Resolve a recipe path against the build context directory.
    pub fn context_path(&self, relative: &str) -> PathBuf {
        self.context_dir.join(relative)
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    pub fn report(&self, event: ProgressEvent) {
        self.progress.on_progress(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinbox_deps::WheelhouseFetcher;
    use pinbox_image::MemoryImageSource;

    #[test]
    fn test_options_default_to_recipe() {
        let mut recipe = BuildRecipe::default();
        recipe.options.frozen = false;

        let ctx = BuildContext::new(
            "/ctx",
            recipe,
            Arc::new(MemoryImageSource::new()),
            Arc::new(WheelhouseFetcher::new("/wheels")),
        );

        assert!(!ctx.options.frozen);
        assert_eq!(ctx.platform, "x86_64");
        assert_eq!(ctx.fetch_timeout, Duration::from_secs(30));
        assert_eq!(ctx.context_path("uv.lock"), PathBuf::from("/ctx/uv.lock"));
    }

    #[test]
    fn test_builder_overrides() {
        let ctx = BuildContext::new(
            "/ctx",
            BuildRecipe::default(),
            Arc::new(MemoryImageSource::new()),
            Arc::new(WheelhouseFetcher::new("/wheels")),
        )
        .with_options(BuildOptions {
            retain_cache: true,
            ..BuildOptions::default()
        })
        .with_platform("aarch64")
        .with_fetch_timeout(Duration::from_millis(50));

        assert!(ctx.options.retain_cache);
        assert_eq!(ctx.platform, "aarch64");
        assert_eq!(ctx.fetch_timeout, Duration::from_millis(50));
    }
}
