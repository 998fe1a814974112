// cellar-core/src/build/mod.rs
//! Everything between a staged source tree and a populated keg: flag
//! resolution, the sanitized environment, step expansion and execution.

pub mod env;
pub mod executor;
pub mod flags;
pub mod step;

pub use env::BuildEnvironment;
pub use executor::{BuildExecutor, BuildReport};
pub use flags::{resolve_flags, Placeholders};
pub use step::{ResolvedStep, StepDirs, StepRunner};
