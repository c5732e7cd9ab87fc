use super::context::BuildContext;
use async_trait::async_trait;
use pinbox_core::error::{BuildError, Stage};

/// One build stage: consumes the previous stage's output, produces its own.
#[async_trait]
pub trait BuildStage: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn stage(&self) -> Stage;

    async fn execute(
        &self,
        context: &BuildContext,
        input: Self::Input,
    ) -> Result<Self::Output, BuildError>;
}
