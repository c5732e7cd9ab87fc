use crate::pipeline::context::BuildContext;
use crate::pipeline::phase_trait::BuildStage;
use crate::pipeline::state::{DepsReady, Launchable};
use crate::recipe::BuildRecipe;
use async_trait::async_trait;
use pinbox_core::config::BuildOptions;
use pinbox_core::error::{BuildError, Stage};
use pinbox_core::startup::PORT_ENV;
use pinbox_deps::{PythonVersion, VenvLayout};
use pinbox_image::config::PATH_ENV;
use pinbox_image::layer::FILE_MODE;
use pinbox_image::{HistoryEntry, ImageConfig, LayerBuilder};
use tracing::info;

const STAGE: Stage = Stage::ApplicationAssembly;

pub const LABEL_BASE_NAME: &str = "org.opencontainers.image.base.name";
pub const LABEL_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

/// `["uv", "run", "server.py"]` for the default recipe.
pub fn launch_command(recipe: &BuildRecipe) -> Vec<String> {
    vec![
        recipe.tool.command_name().to_string(),
        "run".to_string(),
        recipe.app.entrypoint_name().to_string(),
    ]
}

/// Environment the image declares for the launched process, in the order it
/// is written to the image config.
pub fn launch_env(
    recipe: &BuildRecipe,
    options: &BuildOptions,
    python: PythonVersion,
) -> Vec<(String, String)> {
    let venv = VenvLayout::in_workdir(&recipe.app.workdir, python);
    let mut env = vec![
        (PORT_ENV.to_string(), recipe.app.port.to_string()),
        ("VIRTUAL_ENV".to_string(), venv.root().to_string()),
    ];
    if options.frozen {
        env.push(("UV_FROZEN".to_string(), "1".to_string()));
    }
    env
}

fn apply_launch_config(
    config: &mut ImageConfig,
    recipe: &BuildRecipe,
    options: &BuildOptions,
    python: PythonVersion,
) {
    for (key, value) in launch_env(recipe, options, python) {
        config.set_env(&key, &value);
    }

    let tool_dir = recipe.tool.dest_dir();
    if !config.search_path().iter().any(|dir| dir == tool_dir) {
        let path = match config.env_value(PATH_ENV) {
            Some(current) if !current.is_empty() => format!("{}:{}", current, tool_dir),
            _ => tool_dir.to_string(),
        };
        config.set_env(PATH_ENV, &path);
    }
    config.prepend_path(&VenvLayout::in_workdir(&recipe.app.workdir, python).bin_dir());

    config.working_dir = Some(recipe.app.workdir.clone());
    config.expose_tcp(recipe.app.port);
    config.cmd = launch_command(recipe);
}

pub struct AssembleStage;

#[async_trait]
impl BuildStage for AssembleStage {
    type Input = DepsReady;
    type Output = Launchable;

    fn stage(&self) -> Stage {
        STAGE
    }

    async fn execute(&self, context: &BuildContext, deps: DepsReady) -> Result<Launchable, BuildError> {
        let recipe = &context.recipe;
        let source = context.context_path(&recipe.app.entrypoint);
        if !context.fs.is_file(&source) {
            return Err(BuildError::EntryPointMissing {
                stage: STAGE,
                path: source,
            });
        }

        let io_error = |e: anyhow::Error| BuildError::Io {
            stage: STAGE,
            artifact: recipe.app.entrypoint.clone(),
            source: std::io::Error::other(e.to_string()),
        };
        let data = context.fs.read(&source).map_err(io_error)?;
        let mode = context
            .fs
            .metadata(&source)
            .map(|m| m.mode & 0o777)
            .unwrap_or(FILE_MODE);

        let dest = recipe.app.in_workdir(recipe.app.entrypoint_name());
        let invalid = |e: pinbox_image::LayerError| BuildError::InvalidInput {
            stage: STAGE,
            artifact: dest.clone(),
            reason: e.to_string(),
        };
        let mut builder = LayerBuilder::new();
        builder.add_file(&dest, data, mode).map_err(invalid)?;
        let layer = builder.finish().map_err(invalid)?;

        let mut image = deps.image.clone();
        image.push_layer(
            layer,
            HistoryEntry::layer(format!("COPY {} ./", recipe.app.entrypoint_name())),
        );

        apply_launch_config(image.config_mut(), recipe, &context.options, deps.python);
        let base = &deps.tool.base;
        image
            .config_mut()
            .labels
            .insert(LABEL_BASE_NAME.to_string(), base.reference.tagged());
        image
            .config_mut()
            .labels
            .insert(LABEL_BASE_DIGEST.to_string(), base.digest.to_string());

        for (key, value) in launch_env(recipe, &context.options, deps.python) {
            image.push_history(HistoryEntry::empty(format!("ENV {}={}", key, value)));
        }
        image.push_history(HistoryEntry::empty(format!("EXPOSE {}", recipe.app.port)));
        let command = launch_command(recipe);
        image.push_history(HistoryEntry::empty(format!("CMD {:?}", command)));

        let digest = image.digest().map_err(|e| BuildError::Io {
            stage: STAGE,
            artifact: "image manifest".to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        info!(
            entrypoint = %dest,
            port = recipe.app.port,
            digest = %digest.short(),
            "Application assembled"
        );

        Ok(Launchable {
            deps,
            image,
            digest,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phases::{BaseStage, DependencyStage, ToolStage};
    use crate::testing::Fixture;

    async fn deps_ready(context: &BuildContext) -> DepsReady {
        let base = BaseStage.execute(context, ()).await.unwrap();
        let tool = ToolStage.execute(context, base).await.unwrap();
        DependencyStage.execute(context, tool).await.unwrap()
    }

    #[tokio::test]
    async fn test_launch_config() {
        let fixture = Fixture::new("1.0");
        let ctx = fixture.context();
        let launchable = AssembleStage
            .execute(&ctx, deps_ready(&ctx).await)
            .await
            .unwrap();

        let config = launchable.image.config();
        assert_eq!(config.env_value("PORT"), Some("8002"));
        assert_eq!(config.env_value("VIRTUAL_ENV"), Some("/app/.venv"));
        assert_eq!(config.env_value("UV_FROZEN"), Some("1"));
        assert_eq!(config.search_path()[0], "/app/.venv/bin");
        assert!(config.search_path().contains(&"/bin".to_string()));
        assert_eq!(config.working_dir.as_deref(), Some("/app"));
        assert!(config.exposed_ports.contains_key("8002/tcp"));
        assert_eq!(config.cmd, vec!["uv", "run", "server.py"]);
        assert_eq!(launchable.command, config.cmd);
        assert_eq!(
            config.labels.get(LABEL_BASE_NAME).map(String::as_str),
            Some("python:3.12-slim")
        );
        assert!(launchable.image.find("/app/server.py").is_some());
    }

    #[tokio::test]
    async fn test_history_matches_layers() {
        let fixture = Fixture::new("1.0");
        let ctx = fixture.context();
        let launchable = AssembleStage
            .execute(&ctx, deps_ready(&ctx).await)
            .await
            .unwrap();

        let layered = launchable
            .image
            .history()
            .iter()
            .filter(|h| !h.empty_layer)
            .count();
        assert_eq!(layered, launchable.image.layers().len());
        assert_eq!(launchable.image.layers().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let fixture = Fixture::new("1.0");
        std::fs::remove_file(fixture.context_dir().join("server.py")).unwrap();
        let ctx = fixture.context();

        let err = AssembleStage
            .execute(&ctx, deps_ready(&ctx).await)
            .await
            .unwrap_err();
        match err {
            BuildError::EntryPointMissing { stage, path } => {
                assert_eq!(stage, Stage::ApplicationAssembly);
                assert!(path.ends_with("server.py"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_unfrozen_env_has_no_uv_frozen() {
        let recipe = BuildRecipe::default();
        let options = BuildOptions {
            frozen: false,
            ..BuildOptions::default()
        };
        let env = launch_env(&recipe, &options, PythonVersion::new(3, 12));
        assert!(env.iter().all(|(k, _)| k != "UV_FROZEN"));
        assert_eq!(env[0], ("PORT".to_string(), "8002".to_string()));
    }

    #[test]
    fn test_custom_tool_dest_on_path() {
        let mut recipe = BuildRecipe::default();
        recipe.tool.dest = "/opt/tools/uv".to_string();
        let mut config = ImageConfig {
            env: vec!["PATH=/usr/local/bin:/usr/bin".to_string()],
            ..ImageConfig::default()
        };

        apply_launch_config(&mut config, &recipe, &BuildOptions::default(), PythonVersion::new(3, 12));

        assert_eq!(
            config.env_value("PATH"),
            Some("/app/.venv/bin:/usr/local/bin:/usr/bin:/opt/tools")
        );
    }
}
