use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PATH_ENV: &str = "PATH";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Runtime configuration carried by an image (the `config` object of an OCI
/// image config). Also the shape of a base image's `config.json` in a local
/// image store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, EmptyObject>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            _ => None,
        })
    }

    /// Set `key`, replacing an existing value in place or appending.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        match self
            .env
            .iter_mut()
            .find(|pair| pair.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    pub fn prepend_path(&mut self, dir: &str) {
        let path = match self.env_value(PATH_ENV) {
            Some(current) if current.split(':').any(|p| p == dir) => return,
            Some(current) if !current.is_empty() => format!("{}:{}", dir, current),
            _ => dir.to_string(),
        };
        self.set_env(PATH_ENV, &path);
    }

    pub fn search_path(&self) -> Vec<String> {
        self.env_value(PATH_ENV)
            .map(|p| {
                p.split(':')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn expose_tcp(&mut self, port: u16) {
        self.exposed_ports
            .insert(format!("{}/tcp", port), EmptyObject::default());
    }

    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl HistoryEntry {
    pub fn layer(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            comment: None,
            empty_layer: false,
        }
    }

    pub fn empty(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            comment: None,
            empty_layer: true,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

/// OCI image configuration blob. Carries no timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: ImageConfig,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_env_replaces_in_place() {
        let mut config = ImageConfig {
            env: vec!["PATH=/usr/bin".into(), "LANG=C.UTF-8".into()],
            ..Default::default()
        };
        config.set_env("PATH", "/bin");
        config.set_env("PORT", "8002");

        assert_eq!(config.env, vec!["PATH=/bin", "LANG=C.UTF-8", "PORT=8002"]);
        assert_eq!(config.env_value("PORT"), Some("8002"));
        assert_eq!(config.env_value("MISSING"), None);
    }

    #[test]
    fn test_prepend_path() {
        let mut config = ImageConfig::default();
        config.prepend_path("/usr/bin");
        config.prepend_path("/app/.venv/bin");
        config.prepend_path("/usr/bin");

        assert_eq!(config.env_value("PATH"), Some("/app/.venv/bin:/usr/bin"));
        assert_eq!(config.search_path(), vec!["/app/.venv/bin", "/usr/bin"]);
    }

    #[test]
    fn test_serializes_with_oci_field_names() {
        let mut config = ImageConfig {
            cmd: vec!["uv".into(), "run".into(), "server.py".into()],
            working_dir: Some("/app".into()),
            ..Default::default()
        };
        config.expose_tcp(8002);
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["WorkingDir"], "/app");
        assert_eq!(json["Cmd"][2], "server.py");
        assert_eq!(json["ExposedPorts"]["8002/tcp"], serde_json::json!({}));
        assert!(json.get("Labels").is_none());
    }

    #[test]
    fn test_base_config_parses_partial_json() {
        let config: ImageConfig =
            serde_json::from_str(r#"{"Env": ["PATH=/usr/local/bin:/usr/bin"]}"#).unwrap();
        assert_eq!(config.search_path(), vec!["/usr/local/bin", "/usr/bin"]);
        assert!(config.working_dir.is_none());
    }
}
