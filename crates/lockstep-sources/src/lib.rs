use std::path::{Path, PathBuf};

use anyhow::Result;
use lockstep_core::{SourceIdentity, Specification};

mod discovery;
mod fs_ops;
mod git_ops;
mod path;
mod registry;
mod source_set;
mod vcs;
mod vcs_cache;

pub use fs_ops::{copy_dir_recursive, replace_with_backup, staging_path};
pub use path::PathSource;
pub use registry::RegistrySource;
pub use source_set::{order_candidates, SourcePriority, SourceSet, SourceSetOptions};
pub use vcs::VcsSource;
pub use vcs_cache::{normalize_uri, VcsCache};

/// Where a materialized package ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    /// Files were written into the requested target directory.
    Written,
    /// The package is used where it already lives; nothing was written.
    InPlace(PathBuf),
}

pub trait Source: Send + Sync {
    fn identity(&self) -> &SourceIdentity;

    /// Every specification this source offers for `name`, newest first.
    fn candidates(&self, name: &str) -> Result<Vec<Specification>>;

    fn materialize(&self, spec: &Specification, target: &Path) -> Result<Materialized>;
}

#[cfg(test)]
mod tests;
