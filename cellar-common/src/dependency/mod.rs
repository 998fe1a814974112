// cellar-common/src/dependency/mod.rs
pub mod definition;
pub mod resolver;

pub use definition::{Dependency, DependencyExt, DependencyKind, DependencyTag, RequirementLevel};
pub use resolver::{
    DependencyResolver, ResolutionContext, ResolutionStatus, ResolvedDependency, ResolvedGraph,
};
