//! The build recipe (`pinbox.toml`). Every field has a default, so a build
//! context without a recipe file builds the standard image.

use pinbox_core::config::BuildOptions;
use pinbox_core::DEFAULT_PORT;
use pinbox_image::{ImageRef, ReferenceError};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const RECIPE_FILE: &str = "pinbox.toml";

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseSpec {
    pub image: String,
}

impl Default for BaseSpec {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
        }
    }
}

/// The single binary copied from the tool image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolSpec {
    pub image: String,
    pub path: String,
    pub dest: String,
}

impl Default for ToolSpec {
    fn default() -> Self {
        Self {
            image: "ghcr.io/astral-sh/uv:0.8.3".to_string(),
            path: "/uv".to_string(),
            dest: "/bin/uv".to_string(),
        }
    }
}

impl ToolSpec {
    /// Name the startup command invokes the tool by.
    pub fn command_name(&self) -> &str {
        self.dest.rsplit('/').next().unwrap_or(&self.dest)
    }

    pub fn dest_dir(&self) -> &str {
        match self.dest.rsplit_once('/') {
            Some(("", _)) | None => "/",
            Some((dir, _)) => dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSpec {
    pub manifest: String,
    pub lock: String,
    pub entrypoint: String,
    pub workdir: String,
    pub port: u16,
}

impl Default for AppSpec {
    fn default() -> Self {
        Self {
            manifest: "pyproject.toml".to_string(),
            lock: "uv.lock".to_string(),
            entrypoint: "server.py".to_string(),
            workdir: "/app".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl AppSpec {
    /// File name of the entry point inside the working directory.
    pub fn entrypoint_name(&self) -> &str {
        self.entrypoint
            .rsplit('/')
            .next()
            .unwrap_or(&self.entrypoint)
    }

    /// `<workdir>/<name>` inside the image.
    pub fn in_workdir(&self, name: &str) -> String {
        format!("{}/{}", self.workdir.trim_end_matches('/'), name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildRecipe {
    pub base: BaseSpec,
    pub tool: ToolSpec,
    pub app: AppSpec,
    pub options: BuildOptions,
}

fn is_plain_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn is_absolute_image_path(path: &str) -> bool {
    path.starts_with('/')
        && path.len() > 1
        && !path.split('/').any(|part| part == "..")
}

impl BuildRecipe {
    /// Load `pinbox.toml` from the context directory, or the defaults when
    /// there is none.
    pub fn load(context_dir: &Path) -> Result<Self, RecipeError> {
        let path = context_dir.join(RECIPE_FILE);
        if !path.is_file() {
            debug!("No {} in {}, using defaults", RECIPE_FILE, context_dir.display());
            return Ok(Self::default());
        }
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self, RecipeError> {
        let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let recipe: Self = toml::from_str(&content).map_err(|e| RecipeError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!("Loaded recipe from {}", path.display());
        Ok(recipe)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RecipeError> {
        toml::from_str(content).map_err(|e| RecipeError::Parse {
            path: PathBuf::from(RECIPE_FILE),
            reason: e.to_string(),
        })
    }

    pub fn base_ref(&self) -> Result<ImageRef, ReferenceError> {
        ImageRef::parse(&self.base.image)
    }

    pub fn tool_ref(&self) -> Result<ImageRef, ReferenceError> {
        ImageRef::parse(&self.tool.image)
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        let invalid = |field: &str, reason: String| RecipeError::Invalid {
            field: field.to_string(),
            reason,
        };

        self.base_ref()
            .map_err(|e| invalid("base.image", e.to_string()))?;
        self.tool_ref()
            .map_err(|e| invalid("tool.image", e.to_string()))?;

        for (field, value) in [
            ("tool.path", &self.tool.path),
            ("tool.dest", &self.tool.dest),
            ("app.workdir", &self.app.workdir),
        ] {
            if !is_absolute_image_path(value) {
                return Err(invalid(
                    field,
                    format!("'{}' must be an absolute path inside the image", value),
                ));
            }
        }

        for (field, value) in [
            ("app.manifest", &self.app.manifest),
            ("app.lock", &self.app.lock),
            ("app.entrypoint", &self.app.entrypoint),
        ] {
            if !is_plain_relative(value) {
                return Err(invalid(
                    field,
                    format!("'{}' must be a path inside the build context", value),
                ));
            }
        }

        if self.app.port == 0 {
            return Err(invalid("app.port", "port must be between 1 and 65535".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let recipe = BuildRecipe::default();
        assert_eq!(recipe.base.image, "python:3.12-slim");
        assert_eq!(recipe.tool.image, "ghcr.io/astral-sh/uv:0.8.3");
        assert_eq!(recipe.tool.command_name(), "uv");
        assert_eq!(recipe.tool.dest_dir(), "/bin");
        assert_eq!(recipe.app.port, 8002);
        assert_eq!(recipe.app.in_workdir("server.py"), "/app/server.py");
        assert!(recipe.options.frozen);
        assert!(!recipe.options.retain_cache);
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_partial_recipe_keeps_defaults() {
        let recipe = BuildRecipe::from_toml_str(
            r#"
[app]
entrypoint = "src/main.py"

[options]
frozen = false

[options.pinned_versions]
fastapi = "0.116.1"
"#,
        )
        .unwrap();

        assert_eq!(recipe.app.entrypoint_name(), "main.py");
        assert_eq!(recipe.app.manifest, "pyproject.toml");
        assert!(!recipe.options.frozen);
        assert_eq!(recipe.options.pinned_versions["fastapi"], "0.116.1");
        assert_eq!(recipe.base, BaseSpec::default());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = BuildRecipe::from_toml_str("[app]\nentry = \"x.py\"\n").unwrap_err();
        assert!(matches!(err, RecipeError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_floating_tag() {
        let mut recipe = BuildRecipe::default();
        recipe.base.image = "python:latest".to_string();
        let err = recipe.validate().unwrap_err();
        assert!(err.to_string().contains("base.image"));
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        let mut recipe = BuildRecipe::default();
        recipe.app.entrypoint = "../server.py".to_string();
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default();
        recipe.tool.dest = "bin/uv".to_string();
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default();
        recipe.app.port = 0;
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_load_from_context() {
        let temp = TempDir::new().unwrap();
        assert_eq!(BuildRecipe::load(temp.path()).unwrap(), BuildRecipe::default());

        std::fs::write(
            temp.path().join(RECIPE_FILE),
            "[base]\nimage = \"python:3.11-slim\"\n",
        )
        .unwrap();
        let recipe = BuildRecipe::load(temp.path()).unwrap();
        assert_eq!(recipe.base.image, "python:3.11-slim");

        std::fs::write(temp.path().join(RECIPE_FILE), "[base\n").unwrap();
        assert!(matches!(
            BuildRecipe::load(temp.path()),
            Err(RecipeError::Parse { .. })
        ));
    }
}
