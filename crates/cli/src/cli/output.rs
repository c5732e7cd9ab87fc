//! Rendering of plans, build results, and configuration for the terminal.

use anyhow::{Context, Result};
use pinbox_core::config::PinboxConfig;
use pinbox_core::output::schema::BuildPlan;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Human,
    /// Equivalent declarative recipe; only meaningful for plans
    Dockerfile,
}

/// Summary of a finished build, printed by `pinbox build`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub output: String,
    pub tag: String,
    pub state: String,
    pub manifest_digest: String,
    pub layers: Vec<String>,
    pub packages: Vec<String>,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format_plan(&self, plan: &BuildPlan) -> Result<String> {
        match self.format {
            OutputFormat::Json => plan.to_json(),
            OutputFormat::Yaml => plan.to_yaml(),
            OutputFormat::Dockerfile => Ok(plan.to_dockerfile()),
            OutputFormat::Human => Ok(self.format_plan_human(plan)),
        }
    }

    pub fn format_summary(&self, summary: &BuildSummary) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(summary)
                .context("Failed to serialize build summary to JSON"),
            OutputFormat::Yaml => {
                serde_yaml::to_string(summary).context("Failed to serialize build summary to YAML")
            }
            OutputFormat::Human | OutputFormat::Dockerfile => Ok(self.format_summary_human(summary)),
        }
    }

    pub fn format_config(&self, config: &PinboxConfig) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&config.to_display_map())
                .context("Failed to serialize config to JSON"),
            OutputFormat::Yaml => serde_yaml::to_string(&config.to_display_map())
                .context("Failed to serialize config to YAML"),
            OutputFormat::Human | OutputFormat::Dockerfile => Ok(config.to_string()),
        }
    }

    fn format_plan_human(&self, plan: &BuildPlan) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Base:    {} (python {})", plan.base.image, plan.base.python);
        let _ = writeln!(
            out,
            "Tool:    {}:{} -> {}",
            plan.tool.image, plan.tool.path, plan.tool.dest
        );
        let _ = writeln!(
            out,
            "Lock:    {} + {} (frozen: {}, retain cache: {})",
            plan.dependencies.manifest,
            plan.dependencies.lock,
            plan.dependencies.frozen,
            plan.dependencies.retain_cache
        );

        if plan.dependencies.packages.is_empty() {
            let _ = writeln!(out, "Packages: none");
        } else {
            let _ = writeln!(out, "Packages:");
            for package in &plan.dependencies.packages {
                let artifact = package.artifact.as_deref().unwrap_or("no compatible wheel");
                let _ = writeln!(out, "  {}=={}  [{}]", package.name, package.version, artifact);
            }
        }

        let _ = writeln!(out, "Workdir: {}", plan.launch.workdir);
        for (key, value) in &plan.launch.env {
            let _ = writeln!(out, "Env:     {}={}", key, value);
        }
        let ports: Vec<String> = plan.launch.ports.iter().map(|p| format!("{}/tcp", p)).collect();
        let _ = writeln!(out, "Expose:  {}", ports.join(", "));
        let _ = writeln!(out, "Command: {}", plan.launch.command.join(" "));
        out
    }

    fn format_summary_human(&self, summary: &BuildSummary) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Built {} ({})", summary.tag, summary.state);
        let _ = writeln!(out, "  Digest:   {}", summary.manifest_digest);
        let _ = writeln!(out, "  Layout:   {}", summary.output);
        let _ = writeln!(out, "  Layers:   {}", summary.layers.len());
        if !summary.packages.is_empty() {
            let _ = writeln!(out, "  Packages: {}", summary.packages.join(", "));
        }
        out
    }
}
