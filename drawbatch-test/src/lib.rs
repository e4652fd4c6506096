mod helpers;
mod runner;

pub use helpers::{ItemDesc, Scene, SceneBuilder, TestShaderService};
pub use runner::{TestRunner, TestRunnerBuilder};
