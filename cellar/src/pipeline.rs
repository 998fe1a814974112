// cellar/src/pipeline.rs
pub mod planner;
pub mod runner;
