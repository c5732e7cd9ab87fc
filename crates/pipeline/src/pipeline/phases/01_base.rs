use crate::pipeline::context::BuildContext;
use crate::pipeline::phase_trait::BuildStage;
use crate::pipeline::state::BaseReady;
use async_trait::async_trait;
use pinbox_core::error::{BuildError, Stage};
use pinbox_image::{HistoryEntry, Image};
use tracing::{debug, info};

pub struct BaseStage;

#[async_trait]
impl BuildStage for BaseStage {
    type Input = ();
    type Output = BaseReady;

    fn stage(&self) -> Stage {
        Stage::BaseProvisioning
    }

    async fn execute(&self, context: &BuildContext, _input: ()) -> Result<BaseReady, BuildError> {
        let stage = self.stage();
        let raw = &context.recipe.base.image;
        let reference = context
            .recipe
            .base_ref()
            .map_err(|e| BuildError::InvalidInput {
                stage,
                artifact: "base image reference".to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            image = %reference,
            source = context.image_source.name(),
            "Pulling base image"
        );

        let pulled = match tokio::time::timeout(
            context.fetch_timeout,
            context.image_source.pull(&reference),
        )
        .await
        {
            Err(_) => {
                return Err(BuildError::ImageNotFound {
                    stage,
                    reference: raw.clone(),
                    reason: format!(
                        "no response from {} within {}s",
                        context.image_source.name(),
                        context.fetch_timeout.as_secs_f32()
                    ),
                })
            }
            Ok(Err(e)) => {
                return Err(BuildError::ImageNotFound {
                    stage,
                    reference: raw.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(pulled)) => pulled,
        };

        if let Some(pinned) = reference.digest() {
            if *pinned != pulled.digest {
                return Err(BuildError::ImageDigestMismatch {
                    stage,
                    reference: raw.clone(),
                    expected: pinned.to_string(),
                    actual: pulled.digest.to_string(),
                });
            }
        }

        let mut image = Image::new(&context.platform);
        let total = pulled.layers.len();
        for (index, layer) in pulled.layers.iter().enumerate() {
            image.push_layer(
                layer.clone(),
                HistoryEntry::layer(format!("FROM {}", reference.tagged()))
                    .with_comment(format!("base layer {}/{}", index + 1, total)),
            );
        }
        *image.config_mut() = pulled.config.clone();

        info!(
            image = %reference,
            digest = %pulled.digest.short(),
            layers = total,
            "Base image provisioned"
        );

        Ok(BaseReady {
            image,
            reference,
            digest: pulled.digest,
        })
    }
}
