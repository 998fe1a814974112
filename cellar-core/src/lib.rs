// cellar-core/src/lib.rs
//! Fetching, building, installing and verifying formulas.

pub mod build;
pub mod fetch;
pub mod install;
pub mod pipeline;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use install::{install_formula, keg_version, verify_installed, InstallContext, InstallLocks};
pub use pipeline::{start_worker_pool_manager, worker_job, JobOutcome, WorkerContext};
pub use verify::Verifier;
