use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use lockstep_core::{GroupSelection, SourceIdentity};
use lockstep_lockfile::LockEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Groups whose packages are left off the disk.
    pub without: BTreeSet<String>,
    pub platform: Option<String>,
}

impl InstallOptions {
    pub fn without<I, S>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let without = groups
            .into_iter()
            .map(Into::into)
            .map(|group: String| group.trim().to_string())
            .collect::<BTreeSet<_>>();
        if without.iter().any(String::is_empty) {
            return Err(anyhow!("group names must not be empty"));
        }
        Ok(Self {
            without,
            platform: None,
        })
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn groups(&self) -> GroupSelection {
        GroupSelection::without(self.without.iter().cloned())
    }

    pub fn platform(&self) -> String {
        self.platform
            .clone()
            .unwrap_or_else(lockstep_core::current_platform)
    }
}

/// A package that is usable on disk after an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub source: SourceIdentity,
    /// The package's own directory: the unit root plus its subdirectory.
    pub root: PathBuf,
    pub load_paths: Vec<String>,
    pub executables: Vec<String>,
    /// Nothing was written because the unit was already in place.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub source: String,
    pub revision: Option<String>,
    pub root: String,
    pub load_paths: Vec<String>,
    pub executables: Vec<String>,
    pub installed_at_unix: u64,
}

impl InstallReceipt {
    pub fn from_installed(package: &InstalledPackage, revision: Option<String>, now: u64) -> Self {
        Self {
            name: package.name.clone(),
            version: package.version.clone(),
            platform: package.platform.clone(),
            source: package.source.to_string(),
            revision,
            root: package.root.display().to_string(),
            load_paths: package.load_paths.clone(),
            executables: package.executables.clone(),
            installed_at_unix: now,
        }
    }

    /// Whether this receipt records exactly the locked entry.
    pub fn matches(&self, entry: &LockEntry) -> bool {
        self.name == entry.name
            && self.version == entry.version.to_string()
            && self.platform == entry.platform
            && self.source == entry.source.to_string()
            && self.revision == entry.revision
    }

    pub fn root_path(&self) -> &Path {
        Path::new(&self.root)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root_path().join("bin")
    }

    pub fn load_path_dirs(&self) -> Vec<PathBuf> {
        self.load_paths
            .iter()
            .map(|load_path| self.root_path().join(load_path))
            .collect()
    }
}
