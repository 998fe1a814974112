// cellar-common/src/lib.rs
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod pipeline;

pub use cache::Cache;
pub use config::Config;
pub use error::{CellarError, InstallStage, Result};
pub use model::Formula;
