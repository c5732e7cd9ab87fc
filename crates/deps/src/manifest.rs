//! The project manifest (`pyproject.toml`).

use crate::error::ParseError;
use crate::requirement::{normalize_name, Requirement};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const MANIFEST_FILE: &str = "pyproject.toml";

#[derive(Debug, Deserialize)]
struct PyProjectFile {
    project: Option<ProjectTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProjectTable {
    name: String,
    version: Option<String>,
    requires_python: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    optional_dependencies: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Normalized project name.
    pub name: String,
    pub version: Option<String>,
    pub requires_python: Option<String>,
    pub dependencies: Vec<Requirement>,
    pub optional_dependencies: BTreeMap<String, Vec<Requirement>>,
}

impl Manifest {
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        Self::parse_named(content, MANIFEST_FILE)
    }

    pub fn parse_named(content: &str, file: &str) -> Result<Self, ParseError> {
        let parsed: PyProjectFile =
            toml::from_str(content).map_err(|e| ParseError::new(file, e.to_string()))?;
        let project = parsed
            .project
            .ok_or_else(|| ParseError::new(file, "missing [project] table"))?;

        let parse_list = |items: &[String]| -> Result<Vec<Requirement>, ParseError> {
            items
                .iter()
                .map(|raw| Requirement::parse(raw).map_err(|e| ParseError::new(file, e.to_string())))
                .collect()
        };

        let dependencies = parse_list(&project.dependencies)?;
        let optional_dependencies = project
            .optional_dependencies
            .iter()
            .map(|(group, items)| Ok((normalize_name(group), parse_list(items)?)))
            .collect::<Result<BTreeMap<_, _>, ParseError>>()?;

        Ok(Self {
            name: normalize_name(&project.name),
            version: project.version,
            requires_python: project.requires_python,
            dependencies,
            optional_dependencies,
        })
    }
}
