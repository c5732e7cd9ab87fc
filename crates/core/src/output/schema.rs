use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Resolved description of what a build will produce, before any artifact
/// is fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub base: BaseSection,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tool: ToolSection,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub dependencies: DependencySection,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub launch: LaunchSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BaseSection {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub image: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub python: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolSection {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub image: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub path: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub dest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DependencySection {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub manifest: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub lock: String,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub retain_cache: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub packages: Vec<PlannedPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PlannedPackage {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LaunchSection {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub workdir: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub entrypoint: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub env: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ports: Vec<u16>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub command: Vec<String>,
}

impl fmt::Display for BuildPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_yaml() {
            Ok(yaml) => write!(f, "{}", yaml),
            Err(e) => write!(f, "Error formatting BuildPlan: {}", e),
        }
    }
}

impl BuildPlan {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize BuildPlan to YAML")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize BuildPlan to JSON")
    }

    /// Render the plan as the equivalent declarative recipe.
    pub fn to_dockerfile(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!("FROM {}\n", self.base.image));
        out.push_str(&format!(
            "COPY --from={} {} {}\n",
            self.tool.image, self.tool.path, self.tool.dest
        ));
        out.push_str(&format!("WORKDIR {}\n", self.launch.workdir));
        out.push_str(&format!(
            "COPY {} {} ./\n",
            self.dependencies.manifest, self.dependencies.lock
        ));

        let mut sync = vec!["uv", "sync"];
        if self.dependencies.frozen {
            sync.push("--frozen");
        }
        if !self.dependencies.retain_cache {
            sync.push("--no-cache");
        }
        out.push_str(&format!("RUN {}\n", sync.join(" ")));

        out.push_str(&format!("COPY {} ./\n", self.launch.entrypoint));
        for (key, value) in &self.launch.env {
            out.push_str(&format!("ENV {}={}\n", key, value));
        }
        for port in &self.launch.ports {
            out.push_str(&format!("EXPOSE {}\n", port));
        }

        let quoted: Vec<String> = self
            .launch
            .command
            .iter()
            .map(|part| format!("\"{}\"", part.replace('"', "\\\"")))
            .collect();
        out.push_str(&format!("CMD [{}]\n", quoted.join(", ")));

        out
    }
}
