use crate::pipeline::context::BuildContext;
use crate::pipeline::phase_trait::BuildStage;
use crate::pipeline::state::{BaseReady, ToolReady};
use async_trait::async_trait;
use pinbox_core::error::{BuildError, Stage};
use pinbox_image::{HistoryEntry, LayerBuilder, LayerEntry};
use tracing::{debug, info};

/// Copies one binary out of the tool image. Nothing in the tool image is run.
pub struct ToolStage;

#[async_trait]
impl BuildStage for ToolStage {
    type Input = BaseReady;
    type Output = ToolReady;

    fn stage(&self) -> Stage {
        Stage::ToolInjection
    }

    async fn execute(&self, context: &BuildContext, base: BaseReady) -> Result<ToolReady, BuildError> {
        let stage = self.stage();
        let spec = &context.recipe.tool;
        let unavailable = |reason: String| BuildError::ToolSourceUnavailable {
            stage,
            image: spec.image.clone(),
            path: spec.path.clone(),
            reason,
        };

        let reference = context.recipe.tool_ref().map_err(|e| unavailable(e.to_string()))?;

        debug!(image = %reference, path = %spec.path, "Pulling tool image");
        let pulled = match tokio::time::timeout(
            context.fetch_timeout,
            context.image_source.pull(&reference),
        )
        .await
        {
            Err(_) => {
                return Err(unavailable(format!(
                    "no response from {} within {}s",
                    context.image_source.name(),
                    context.fetch_timeout.as_secs_f32()
                )))
            }
            Ok(Err(e)) => return Err(unavailable(e.to_string())),
            Ok(Ok(pulled)) => pulled,
        };

        if let Some(pinned) = reference.digest() {
            if *pinned != pulled.digest {
                return Err(unavailable(format!(
                    "pinned {}, resolved {}",
                    pinned, pulled.digest
                )));
            }
        }

        let (data, mode) = match pulled.find(&spec.path) {
            Some(LayerEntry::File { data, mode }) => (data.clone(), *mode),
            Some(other) => {
                return Err(unavailable(format!(
                    "expected a regular file, found a {}",
                    other.kind()
                )))
            }
            None => return Err(unavailable("no such file in image".to_string())),
        };

        let mut builder = LayerBuilder::new();
        builder
            .add_file(&spec.dest, data, mode)
            .map_err(|e| unavailable(e.to_string()))?;
        let layer = builder.finish().map_err(|e| unavailable(e.to_string()))?;

        let mut image = base.image.clone();
        image.push_layer(
            layer,
            HistoryEntry::layer(format!(
                "COPY --from={} {} {}",
                reference.tagged(),
                spec.path,
                spec.dest
            )),
        );

        info!(
            tool = %reference,
            dest = %spec.dest,
            mode = format!("{:o}", mode),
            "Tool injected"
        );

        Ok(ToolReady {
            base,
            image,
            tool: reference,
            dest: spec.dest.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phases::BaseStage;
    use crate::testing::Fixture;
    use pinbox_image::{ImageConfig, ImageRef, LayerBuilder, MemoryImageSource};
    use std::sync::Arc;
    use std::time::Duration;

    async fn base_ready(fixture: &Fixture) -> BaseReady {
        BaseStage.execute(&fixture.context(), ()).await.unwrap()
    }

    #[tokio::test]
    async fn test_tool_copied_with_mode() {
        let fixture = Fixture::new("1.0");
        let base = base_ready(&fixture).await;
        let base_layers = base.image.layers().len();

        let tool = ToolStage.execute(&fixture.context(), base).await.unwrap();

        assert_eq!(tool.image.layers().len(), base_layers + 1);
        assert_eq!(tool.base.image.layers().len(), base_layers);
        match tool.image.find("/bin/uv") {
            Some(entry @ LayerEntry::File { mode, .. }) => {
                assert_eq!(*mode, 0o755);
                assert!(entry.is_executable());
            }
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(tool.dest, "/bin/uv");
        assert_eq!(tool.image.layers().last().unwrap().file_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_tool_path() {
        let fixture = Fixture::new("1.0");
        let base = base_ready(&fixture).await;
        let mut ctx = fixture.context();
        ctx.recipe.tool.path = "/usr/bin/uv".to_string();

        let err = ToolStage.execute(&ctx, base).await.unwrap_err();
        match err {
            BuildError::ToolSourceUnavailable { path, reason, .. } => {
                assert_eq!(path, "/usr/bin/uv");
                assert!(reason.contains("no such file"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_path_must_be_regular_file() {
        let fixture = Fixture::new("1.0");
        let mut builder = LayerBuilder::new();
        builder.add_symlink("/uv", "/usr/bin/uv").unwrap();
        fixture.source.insert(
            &ImageRef::parse("ghcr.io/astral-sh/uv:0.8.3").unwrap(),
            vec![builder.finish().unwrap()],
            ImageConfig::default(),
        );
        let base = base_ready(&fixture).await;

        let err = ToolStage.execute(&fixture.context(), base).await.unwrap_err();
        assert!(err.to_string().contains("symlink"), "{}", err);
    }

    #[tokio::test]
    async fn test_missing_tool_image() {
        let fixture = Fixture::new("1.0");
        let base = base_ready(&fixture).await;
        let mut ctx = fixture.context();
        ctx.recipe.tool.image = "ghcr.io/astral-sh/uv:9.9.9".to_string();

        let err = ToolStage.execute(&ctx, base).await.unwrap_err();
        assert!(matches!(err, BuildError::ToolSourceUnavailable { .. }));
        assert_eq!(err.exit_code(), 12);
    }

    #[tokio::test]
    async fn test_tool_stage_adds_only_the_copied_file() {
        let fixture = Fixture::new("1.0");
        let source = Arc::new(MemoryImageSource::new());
        fixture.populate(&source);
        let ctx = fixture.context().with_image_source(source.clone());

        let base = BaseStage.execute(&ctx, ()).await.unwrap();
        let base_image = base.image.clone();
        let tool = ToolStage.execute(&ctx, base).await.unwrap();

        assert_eq!(
            source.pulled(),
            vec![
                ImageRef::parse("python:3.12-slim").unwrap().tagged(),
                ImageRef::parse("ghcr.io/astral-sh/uv:0.8.3").unwrap().tagged(),
            ]
        );
        assert_eq!(tool.image.config(), base_image.config());
        assert_eq!(
            &tool.image.layers()[..base_image.layers().len()],
            base_image.layers()
        );

        let added: Vec<(&str, &LayerEntry)> = tool
            .image
            .layers()
            .last()
            .unwrap()
            .entries()
            .filter(|(_, entry)| !matches!(entry, LayerEntry::Dir { .. }))
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, "bin/uv");
        assert_eq!(tool.image.history().len(), base_image.history().len() + 1);
    }

    #[tokio::test]
    async fn test_slow_tool_source_times_out() {
        let fixture = Fixture::new("1.0");
        let base = base_ready(&fixture).await;

        let slow = MemoryImageSource::new().with_delay(Duration::from_secs(5));
        fixture.populate(&slow);
        let ctx = fixture
            .context()
            .with_image_source(Arc::new(slow))
            .with_fetch_timeout(Duration::from_millis(20));

        let err = ToolStage.execute(&ctx, base).await.unwrap_err();
        match err {
            BuildError::ToolSourceUnavailable { ref reason, .. } => {
                assert!(reason.contains("within"), "{}", reason)
            }
            other => panic!("unexpected error {}", other),
        }
    }
}
