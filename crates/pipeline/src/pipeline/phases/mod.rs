// The four ordered build stages. Each commits exactly one layer (the base
// stage commits the base image's layers) on top of its input image.

#[path = "01_base.rs"]
pub mod base;
#[path = "02_tool.rs"]
pub mod tool;
#[path = "03_dependencies.rs"]
pub mod dependencies;
#[path = "04_assemble.rs"]
pub mod assemble;

pub use assemble::AssembleStage;
pub use base::BaseStage;
pub use dependencies::DependencyStage;
pub use tool::ToolStage;
