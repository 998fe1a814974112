// cellar-aio/src/lib.rs
//! IO operations for cellar: filesystem, git checkouts, checksums,
//! processes, archives and patches.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod git2;
pub mod patch;
pub mod process;

pub use checksum::{sha256_file_async, verify_checksum_async};
pub use extract::{extract_archive, extract_archive_async, source_root};
pub use git2::checkout_head_async;
pub use patch::apply_unified_diff;
pub use process::{run_command_async, CommandOutput, CommandSpec, Termination};
