use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use lockstep_core::{DependencyGraph, Requirement, SourceIdentity, Specification};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::entry::LockEntry;
use crate::{reader, writer};

pub const LOCKFILE_NAME: &str = "Lockstep.lock";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lockfile {
    /// Every source of the manifest, with the resolved revision for
    /// version-control sources.
    pub sources: BTreeMap<SourceIdentity, Option<String>>,
    pub entries: Vec<LockEntry>,
    pub platforms: BTreeSet<String>,
    pub dependencies: Vec<Requirement>,
    pub without: BTreeSet<String>,
}

impl Lockfile {
    pub fn from_graph(
        graph: &DependencyGraph,
        sources: &[SourceIdentity],
        platform: &str,
        without: &BTreeSet<String>,
    ) -> Self {
        let mut lock = Self {
            platforms: BTreeSet::from([platform.to_string()]),
            without: without.clone(),
            ..Self::default()
        };
        let pins = graph.roots().iter().filter_map(|root| root.source.as_ref());
        for source in sources.iter().chain(pins) {
            lock.sources.entry(source.clone()).or_default();
        }
        for spec in graph.iter() {
            let revision = lock.sources.entry(spec.source.clone()).or_default();
            if spec.revision.is_some() {
                *revision = spec.revision.clone();
            }
            lock.entries.push(LockEntry::from_spec(spec));
        }
        lock.dependencies = graph.roots().to_vec();
        lock.normalize();
        lock
    }

    pub(crate) fn normalize(&mut self) {
        self.entries.sort_by(|left, right| {
            left.source
                .cmp(&right.source)
                .then_with(|| left.name.cmp(&right.name))
                .then_with(|| left.platform.cmp(&right.platform))
        });
        for entry in &mut self.entries {
            entry
                .dependencies
                .sort_by(|left, right| left.name.cmp(&right.name));
        }
        self.dependencies
            .sort_by(|left, right| left.name.cmp(&right.name));
    }

    pub fn entry(&self, name: &str) -> Option<&LockEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn entries_from<'a>(
        &'a self,
        source: &'a SourceIdentity,
    ) -> impl Iterator<Item = &'a LockEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| &entry.source == source)
    }

    pub fn dependency(&self, name: &str) -> Option<&Requirement> {
        self.dependencies.iter().find(|req| req.name == name)
    }

    pub fn revision_for(&self, source: &SourceIdentity) -> Option<&str> {
        self.sources.get(source).and_then(|revision| revision.as_deref())
    }

    pub fn locked_revisions(&self) -> BTreeMap<SourceIdentity, String> {
        self.sources
            .iter()
            .filter_map(|(source, revision)| {
                revision.as_ref().map(|revision| (source.clone(), revision.clone()))
            })
            .collect()
    }

    pub fn contains_spec(&self, spec: &Specification) -> bool {
        self.entries.iter().any(|entry| entry.matches(spec))
    }

    /// The locked graph, with only what the lock records about each package.
    pub fn to_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new(self.dependencies.clone());
        for entry in &self.entries {
            graph.insert(entry.to_spec());
        }
        graph
    }

    pub fn write(&self) -> String {
        writer::write_lockfile(self)
    }

    pub fn read(text: &str) -> Result<Self> {
        reader::read_lockfile(text)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read lockfile: {}", path.display()))?;
        Self::read(&raw).with_context(|| format!("failed to load lockfile: {}", path.display()))
    }

    /// Writes the lock next to `path` and renames it into place, so readers
    /// never see a partially written file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;

        let content = self.write();
        if fs::read_to_string(path).ok().as_deref() == Some(content.as_str()) {
            debug!(path = %path.display(), "lockfile unchanged");
            return Ok(());
        }

        let mut staged = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed creating temporary lockfile in {}", parent.display()))?;
        staged
            .write_all(content.as_bytes())
            .context("failed writing temporary lockfile")?;
        staged
            .persist(path)
            .with_context(|| format!("failed writing lockfile: {}", path.display()))?;
        Ok(())
    }
}
