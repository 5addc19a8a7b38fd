use std::collections::BTreeMap;

use anyhow::{Context, Result};
use lockstep_core::{DependencyGraph, Error, Manifest, Requirement, SourceIdentity};
use lockstep_lockfile::Lockfile;
use lockstep_sources::SourceSet;
use tracing::{debug, warn};

use crate::drift::detect_drift;
use crate::policy::lock_policies;
use crate::search::{CandidateCache, Outcome, Search};
use crate::types::{LockPolicy, ResolveOptions};

pub struct Resolver<'a> {
    sources: &'a SourceSet,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(sources: &'a SourceSet, options: ResolveOptions) -> Self {
        Self { sources, options }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Resolves every active requirement of `manifest`. With a prior lock,
    /// names outside the update scope and untouched by drift keep their
    /// locked versions.
    pub fn resolve(&self, manifest: &Manifest, lock: Option<&Lockfile>) -> Result<DependencyGraph> {
        let roots = manifest
            .requirements()
            .iter()
            .filter(|req| req.is_active(&self.options.groups, &self.options.platform))
            .collect::<Vec<_>>();
        let pins: BTreeMap<String, SourceIdentity> = manifest
            .requirements()
            .iter()
            .filter_map(|req| req.source.clone().map(|source| (req.name.clone(), source)))
            .collect();

        let mut cache = CandidateCache::new();
        let requests = roots
            .iter()
            .map(|req| (req.name.clone(), req.source.clone()))
            .collect::<Vec<_>>();
        for (name, result) in self.sources.prefetch(&requests) {
            let specs =
                result.with_context(|| format!("failed to load candidates for '{name}'"))?;
            cache.insert(name, specs);
        }

        let policies = match lock {
            Some(lock) => {
                let drift = detect_drift(manifest, lock, self.sources)?;
                lock_policies(manifest, lock, &drift, self.options.update.as_ref())?
            }
            None => {
                if self.options.update.is_some() {
                    debug!("no lock to update; resolving from scratch");
                }
                BTreeMap::new()
            }
        };

        let selected = match self.search(&roots, &pins, &policies, &mut cache)? {
            Outcome::Resolved(selected) => selected,
            Outcome::Failed(failure) => {
                let pinned = policies
                    .values()
                    .any(|policy| matches!(policy, LockPolicy::Pinned(_)));
                if !pinned {
                    return Err(Error::Resolution(failure).into());
                }
                warn!(
                    package = %failure.name,
                    reason = %failure.reason,
                    "locked versions cannot be kept; re-resolving with the lock as a preference"
                );
                let relaxed = policies
                    .into_iter()
                    .map(|(name, policy)| (name, policy.relaxed()))
                    .collect::<BTreeMap<_, _>>();
                match self.search(&roots, &pins, &relaxed, &mut cache)? {
                    Outcome::Resolved(selected) => selected,
                    Outcome::Failed(failure) => return Err(Error::Resolution(failure).into()),
                }
            }
        };

        let mut graph = DependencyGraph::new(manifest.requirements().to_vec());
        for spec in selected.into_values() {
            graph.insert(spec);
        }
        debug!(packages = graph.len(), "resolved");
        Ok(graph)
    }

    fn search(
        &self,
        roots: &[&Requirement],
        pins: &BTreeMap<String, SourceIdentity>,
        policies: &BTreeMap<String, LockPolicy>,
        cache: &mut CandidateCache,
    ) -> Result<Outcome> {
        let mut search = Search::new(self.sources, &self.options.platform, pins, policies, cache);
        for root in roots {
            search.require(&root.name, root.requirement.clone());
        }
        search.run()
    }
}
