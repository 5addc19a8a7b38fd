use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{anyhow, Result};
use lockstep_core::{Manifest, SourceIdentity};
use lockstep_lockfile::Lockfile;

use crate::drift::Drift;
use crate::types::{LockPolicy, UpdateScope};

/// Assigns a lock policy to every locked name.
///
/// Names in the update scope, drifted names and everything that depends on
/// a drifted name are unlocked. Dependencies of unlocked names keep their
/// locked version unless something forces them to move. Everything else stays
/// exactly as locked.
pub(crate) fn lock_policies(
    manifest: &Manifest,
    lock: &Lockfile,
    drift: &Drift,
    update: Option<&UpdateScope>,
) -> Result<BTreeMap<String, LockPolicy>> {
    let forward = forward_edges(lock);
    let reverse = reverse_edges(&forward);

    let mut unlocked: BTreeSet<String> = drift.names();
    unlocked = closure(&unlocked, &reverse);

    let mut scoped = BTreeSet::new();
    match update {
        None => {}
        Some(UpdateScope::All) => {
            scoped.extend(lock.entries.iter().map(|entry| entry.name.clone()));
        }
        Some(UpdateScope::Only { names, sources }) => {
            for name in names {
                if lock.entry(name).is_none() && manifest.requirement(name).is_none() {
                    return Err(anyhow!(
                        "package '{name}' is not part of the lock or the manifest"
                    ));
                }
                scoped.insert(name.clone());
            }
            for source_name in sources {
                let mut matched = false;
                for entry in &lock.entries {
                    if entry.source.name() == *source_name {
                        scoped.insert(entry.name.clone());
                        matched = true;
                    }
                }
                for requirement in manifest.requirements() {
                    if requirement
                        .source
                        .as_ref()
                        .is_some_and(|source| source.name() == *source_name)
                    {
                        scoped.insert(requirement.name.clone());
                        matched = true;
                    }
                }
                if !matched {
                    return Err(anyhow!("source '{source_name}' is not used by the manifest"));
                }
            }
        }
    }
    unlocked.extend(scoped.iter().cloned());

    let dependents = closure(&scoped, &reverse);
    let mut preferred = closure(&unlocked, &forward);
    preferred.extend(dependents);

    let mut policies = BTreeMap::new();
    for entry in &lock.entries {
        let policy = if unlocked.contains(&entry.name) {
            LockPolicy::Unlocked
        } else if preferred.contains(&entry.name) {
            LockPolicy::PreferLocked(entry.clone())
        } else {
            LockPolicy::Pinned(entry.clone())
        };
        policies.entry(entry.name.clone()).or_insert(policy);
    }
    Ok(policies)
}

fn forward_edges(lock: &Lockfile) -> BTreeMap<String, BTreeSet<String>> {
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for entry in &lock.entries {
        edges
            .entry(entry.name.clone())
            .or_default()
            .extend(entry.dependencies.iter().map(|dep| dep.name.clone()));
    }
    edges
}

fn reverse_edges(
    forward: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, dependencies) in forward {
        for dependency in dependencies {
            reverse
                .entry(dependency.clone())
                .or_default()
                .insert(name.clone());
        }
    }
    reverse
}

fn closure(
    start: &BTreeSet<String>,
    edges: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    let mut seen = start.clone();
    let mut queue: VecDeque<String> = start.iter().cloned().collect();
    while let Some(name) = queue.pop_front() {
        for next in edges.get(&name).into_iter().flatten() {
            if seen.insert(next.clone()) {
                queue.push_back(next.clone());
            }
        }
    }
    seen
}

/// Version-control sources whose locked revision must be ignored because
/// the update scope asks them to move.
pub fn refreshed_sources(
    manifest: &Manifest,
    lock: &Lockfile,
    update: Option<&UpdateScope>,
) -> BTreeSet<SourceIdentity> {
    let known = lock
        .sources
        .keys()
        .chain(manifest.sources())
        .filter(|source| source.is_vcs());

    match update {
        None => BTreeSet::new(),
        Some(UpdateScope::All) => known.cloned().collect(),
        Some(UpdateScope::Only { names, sources }) => {
            let mut refreshed: BTreeSet<SourceIdentity> = known
                .filter(|source| sources.contains(&source.name()))
                .cloned()
                .collect();
            for name in names {
                let locked = lock.entry(name).map(|entry| &entry.source);
                let declared = manifest
                    .requirement(name)
                    .and_then(|req| req.source.as_ref());
                refreshed.extend(
                    locked
                        .into_iter()
                        .chain(declared)
                        .filter(|source| source.is_vcs())
                        .cloned(),
                );
            }
            refreshed
        }
    }
}
