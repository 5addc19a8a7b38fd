use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use lockstep_core::{Error, SourceIdentity, Specification, VcsReference};
use semver::Version;
use tracing::debug;

use crate::discovery::{discover_specs, synthesize_specs};
use crate::vcs_cache::VcsCache;
use crate::{Materialized, Source};

pub struct VcsSource {
    identity: SourceIdentity,
    uri: String,
    reference: VcsReference,
    submodules: bool,
    cache: Arc<VcsCache>,
    locked_revision: Option<String>,
    declared: BTreeMap<String, Option<Version>>,
    snapshot: Mutex<Option<Arc<Snapshot>>>,
}

struct Snapshot {
    revision: String,
    specs: Vec<Specification>,
}

impl VcsSource {
    pub fn new(identity: SourceIdentity, cache: Arc<VcsCache>) -> Result<Self> {
        let SourceIdentity::Vcs {
            uri,
            reference,
            submodules,
        } = &identity
        else {
            return Err(anyhow!("'{identity}' is not a version-control source"));
        };
        Ok(Self {
            uri: uri.clone(),
            reference: reference.clone(),
            submodules: *submodules,
            identity,
            cache,
            locked_revision: None,
            declared: BTreeMap::new(),
            snapshot: Mutex::new(None),
        })
    }

    /// Reuse `revision` from a lock instead of asking the remote for the
    /// current tip. The remote is only contacted when the revision is not
    /// cached yet.
    pub fn with_locked_revision(mut self, revision: Option<String>) -> Self {
        self.locked_revision = revision;
        self
    }

    pub fn declare(mut self, name: impl Into<String>, version: Option<Version>) -> Self {
        self.declared.insert(name.into(), version);
        self
    }

    pub fn revision(&self) -> Result<String> {
        Ok(self.load()?.revision.clone())
    }

    fn resolve_revision(&self) -> Result<String> {
        if let Some(locked) = &self.locked_revision {
            if self.cache.has_revision(&self.uri, locked)? {
                debug!(uri = %self.uri, revision = %locked, "using locked revision from cache");
                return Ok(locked.clone());
            }
            self.cache.fetch_ref(&self.uri, &self.reference)?;
            if self.cache.has_revision(&self.uri, locked)? {
                return Ok(locked.clone());
            }
            return Err(Error::source_unavailable(
                &self.uri,
                format!("locked revision {locked} is no longer available"),
            )
            .into());
        }

        if !self.reference.is_floating() {
            if let Some(revision) = self.cache.resolve_local(&self.uri, &self.reference)? {
                return Ok(revision);
            }
        }
        self.cache.fetch_ref(&self.uri, &self.reference)
    }

    fn load(&self) -> Result<Arc<Snapshot>> {
        let mut state = self
            .snapshot
            .lock()
            .map_err(|_| anyhow!("vcs source state lock poisoned"))?;
        if let Some(snapshot) = state.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let revision = self.resolve_revision()?;
        let tree = self.cache.snapshot(&self.uri, &revision, self.submodules)?;
        let mut specs = discover_specs(&tree, &self.identity)?;
        if specs.is_empty() {
            specs = synthesize_specs(&tree, &self.identity, &self.declared)?;
        }
        let specs = specs
            .into_iter()
            .map(|spec| spec.with_revision(revision.clone()))
            .collect();

        let snapshot = Arc::new(Snapshot { revision, specs });
        *state = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

impl Source for VcsSource {
    fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    fn candidates(&self, name: &str) -> Result<Vec<Specification>> {
        Ok(self
            .load()?
            .specs
            .iter()
            .filter(|spec| spec.name == name)
            .cloned()
            .collect())
    }

    fn materialize(&self, spec: &Specification, target: &Path) -> Result<Materialized> {
        let revision = match &spec.revision {
            Some(revision) => revision.clone(),
            None => self.revision()?,
        };
        if !self.cache.has_revision(&self.uri, &revision)? {
            self.cache.fetch_ref(&self.uri, &self.reference)?;
        }
        self.cache
            .checkout(&self.uri, &revision, self.submodules, target)?;
        Ok(Materialized::Written)
    }
}
