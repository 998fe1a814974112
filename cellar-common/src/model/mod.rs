// cellar-common/src/model/mod.rs
pub mod artifact;
pub mod flags;
pub mod formula;
pub mod options;
pub mod procedure;

pub use artifact::{InstallReceipt, InstalledArtifact, VerificationStatus};
pub use flags::{BuildFlagSet, DependencyPresence};
pub use formula::{Formula, SourceSpec};
pub use options::{BuildSelections, OptionSpec};
pub use procedure::{Assertion, FlagRule, InstallProcedure, StepSpec, TestProcedure};
