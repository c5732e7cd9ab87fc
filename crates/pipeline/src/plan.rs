//! Build plans: what a build would produce, computed from the recipe and the
//! manifest pair without pulling images or fetching artifacts.

use crate::pipeline::phases::assemble::{launch_command, launch_env};
use crate::pipeline::phases::dependencies::{read_manifest_pair, resolve, target_python};
use crate::pipeline::BuildContext;
use pinbox_core::error::{BuildError, Stage};
use pinbox_core::output::schema::{
    BaseSection, BuildPlan, DependencySection, LaunchSection, PlannedPackage, ToolSection,
};
use pinbox_deps::TargetEnvironment;
use tracing::debug;

pub const PLAN_VERSION: &str = "1.0";

pub fn plan(context: &BuildContext) -> Result<BuildPlan, BuildError> {
    let recipe = &context.recipe;
    let base = recipe.base_ref().map_err(|e| BuildError::InvalidInput {
        stage: Stage::BaseProvisioning,
        artifact: "base image reference".to_string(),
        reason: e.to_string(),
    })?;

    let pair = read_manifest_pair(context)?;
    let python = target_python(base.tag(), &pair.manifest);
    let resolved = resolve(context, &pair, python, None)?;
    let target = TargetEnvironment::new(python, context.platform.clone());

    let packages = resolved
        .packages
        .iter()
        .map(|package| PlannedPackage {
            name: package.name.clone(),
            version: package.version.clone(),
            artifact: target
                .select(&package.wheels, &package.version)
                .first()
                .and_then(|(locked, _)| locked.file_name()),
        })
        .collect::<Vec<_>>();

    debug!(packages = packages.len(), python = %python, "Planned build");

    Ok(BuildPlan {
        version: PLAN_VERSION.to_string(),
        base: BaseSection {
            image: recipe.base.image.clone(),
            python: python.to_string(),
        },
        tool: ToolSection {
            image: recipe.tool.image.clone(),
            path: recipe.tool.path.clone(),
            dest: recipe.tool.dest.clone(),
        },
        dependencies: DependencySection {
            manifest: recipe.app.manifest.clone(),
            lock: recipe.app.lock.clone(),
            frozen: context.options.frozen,
            retain_cache: context.options.retain_cache,
            packages,
        },
        launch: LaunchSection {
            workdir: recipe.app.workdir.clone(),
            entrypoint: recipe.app.entrypoint_name().to_string(),
            env: launch_env(recipe, &context.options, python)
                .into_iter()
                .collect(),
            ports: vec![recipe.app.port],
            command: launch_command(recipe),
        },
    })
}
