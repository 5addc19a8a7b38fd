use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use lockstep_core::{Manifest, SourceIdentity, SourceKind, Specification};
use tracing::debug;

use crate::path::PathSource;
use crate::registry::RegistrySource;
use crate::vcs::VcsSource;
use crate::vcs_cache::VcsCache;
use crate::Source;

/// Tie-break between candidates of equal version offered by different kinds
/// of source. Earlier kinds win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePriority {
    order: Vec<SourceKind>,
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self {
            order: vec![SourceKind::Path, SourceKind::Vcs, SourceKind::Registry],
        }
    }
}

impl SourcePriority {
    pub fn new(order: Vec<SourceKind>) -> Result<Self> {
        let distinct: BTreeSet<SourceKind> = order.iter().copied().collect();
        if distinct.len() != 3 || order.len() != 3 {
            return Err(anyhow!(
                "source priority must name each of path, vcs and registry exactly once"
            ));
        }
        Ok(Self { order })
    }

    /// Parses a comma separated list such as `path,vcs,registry`.
    pub fn parse(value: &str) -> Result<Self> {
        let order = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                SourceKind::parse(part).ok_or_else(|| anyhow!("unknown source kind '{part}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(order)
    }

    pub fn rank(&self, kind: SourceKind) -> usize {
        self.order
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(self.order.len())
    }

    pub fn kinds(&self) -> &[SourceKind] {
        &self.order
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceSetOptions {
    pub priority: SourcePriority,
    /// Revisions recorded for version-control sources by a previous lock.
    pub locked_revisions: BTreeMap<SourceIdentity, String>,
}

#[derive(Default)]
pub struct SourceSet {
    sources: BTreeMap<SourceIdentity, Arc<dyn Source>>,
    priority: SourcePriority,
}

impl SourceSet {
    pub fn new(priority: SourcePriority) -> Self {
        Self {
            sources: BTreeMap::new(),
            priority,
        }
    }

    /// Builds one source per identity named by the manifest. Trees pinned
    /// without a descriptor are told which names they provide.
    pub fn for_manifest(
        manifest: &Manifest,
        cache: Arc<VcsCache>,
        options: SourceSetOptions,
    ) -> Result<Self> {
        let mut set = Self::new(options.priority);
        for identity in manifest.sources() {
            let declared = manifest
                .requirements()
                .iter()
                .filter(|req| req.source.as_ref() == Some(identity))
                .map(|req| (req.name.clone(), req.exact_version()))
                .collect::<Vec<_>>();

            let source: Arc<dyn Source> = match identity {
                SourceIdentity::Registry { uri } => Arc::new(RegistrySource::new(uri)),
                SourceIdentity::Path { path } => Arc::new(
                    declared
                        .into_iter()
                        .fold(PathSource::new(path.clone()), |source, (name, version)| {
                            source.declare(name, version)
                        }),
                ),
                SourceIdentity::Vcs { .. } => {
                    let locked = options.locked_revisions.get(identity).cloned();
                    let source = VcsSource::new(identity.clone(), Arc::clone(&cache))?
                        .with_locked_revision(locked);
                    Arc::new(
                        declared
                            .into_iter()
                            .fold(source, |source, (name, version)| source.declare(name, version)),
                    )
                }
            };
            set.insert(source);
        }
        Ok(set)
    }

    pub fn insert(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.identity().clone(), source);
    }

    pub fn get(&self, identity: &SourceIdentity) -> Option<&Arc<dyn Source>> {
        self.sources.get(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &SourceIdentity> {
        self.sources.keys()
    }

    pub fn priority(&self) -> &SourcePriority {
        &self.priority
    }

    /// Candidates for `name`. A pinned source answers alone; otherwise every
    /// source is asked and the results are ordered newest first, then by
    /// source priority, then platform-specific before generic builds.
    pub fn candidates_for(
        &self,
        name: &str,
        pin: Option<&SourceIdentity>,
    ) -> Result<Vec<Specification>> {
        if let Some(pin) = pin {
            let source = self
                .sources
                .get(pin)
                .ok_or_else(|| anyhow!("source '{pin}' for '{name}' is not configured"))?;
            let mut specs = source.candidates(name)?;
            specs.sort_by(|left, right| {
                right
                    .version
                    .cmp(&left.version)
                    .then_with(|| left.is_generic().cmp(&right.is_generic()))
            });
            return Ok(specs);
        }

        let mut specs = Vec::new();
        for source in self.sources.values() {
            specs.extend(source.candidates(name)?);
        }
        order_candidates(&mut specs, &self.priority);
        debug!(package = name, count = specs.len(), "collected candidates");
        Ok(specs)
    }

    /// Looks up several independent names concurrently.
    pub fn prefetch(
        &self,
        requests: &[(String, Option<SourceIdentity>)],
    ) -> BTreeMap<String, Result<Vec<Specification>>> {
        thread::scope(|scope| {
            let handles = requests
                .iter()
                .map(|(name, pin)| {
                    (
                        name.clone(),
                        scope.spawn(move || self.candidates_for(name, pin.as_ref())),
                    )
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("candidate lookup for '{name}' panicked")));
                    (name, result)
                })
                .collect()
        })
    }
}

/// Newest first; at equal versions the higher priority source kind, then
/// platform-specific builds before generic ones.
pub fn order_candidates(specs: &mut [Specification], priority: &SourcePriority) {
    specs.sort_by(|left, right| {
        right
            .version
            .cmp(&left.version)
            .then_with(|| {
                priority
                    .rank(left.source.kind())
                    .cmp(&priority.rank(right.source.kind()))
            })
            .then_with(|| left.is_generic().cmp(&right.is_generic()))
            .then_with(|| left.source.cmp(&right.source))
            .then_with(|| left.platform.cmp(&right.platform))
    });
}
