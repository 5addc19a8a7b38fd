use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use lockstep_core::{Error, SourceIdentity, Specification};
use semver::Version;

use crate::discovery::{discover_specs, synthesize_specs};
use crate::{Materialized, Source};

/// A package tree used in place. Descriptors are re-read on every lookup so
/// edits under the path are seen without a cache to invalidate.
pub struct PathSource {
    identity: SourceIdentity,
    root: PathBuf,
    declared: BTreeMap<String, Option<Version>>,
}

impl PathSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            identity: SourceIdentity::path(root.clone()),
            root,
            declared: BTreeMap::new(),
        }
    }

    /// Names this tree provides when it carries no descriptor.
    pub fn declare(mut self, name: impl Into<String>, version: Option<Version>) -> Self {
        self.declared.insert(name.into(), version);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn specs(&self) -> Result<Vec<Specification>> {
        if !self.root.is_dir() {
            return Err(Error::source_unavailable(
                self.identity.remote(),
                "path does not exist",
            )
            .into());
        }
        let specs = discover_specs(&self.root, &self.identity)?;
        if specs.is_empty() {
            return synthesize_specs(&self.root, &self.identity, &self.declared);
        }
        Ok(specs)
    }
}

impl Source for PathSource {
    fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    fn candidates(&self, name: &str) -> Result<Vec<Specification>> {
        Ok(self
            .specs()?
            .into_iter()
            .filter(|spec| spec.name == name)
            .collect())
    }

    fn materialize(&self, spec: &Specification, _target: &Path) -> Result<Materialized> {
        let root = match &spec.subdir {
            Some(subdir) => self.root.join(subdir),
            None => self.root.clone(),
        };
        if !root.is_dir() {
            anyhow::bail!("path {} no longer exists", root.display());
        }
        Ok(Materialized::InPlace(self.root.clone()))
    }
}
