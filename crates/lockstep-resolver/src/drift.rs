use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;
use lockstep_core::{Manifest, SourceIdentity, SourceKind};
use lockstep_lockfile::Lockfile;
use lockstep_sources::SourceSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftReason {
    NewRequirement,
    SourceChanged {
        locked: Option<SourceIdentity>,
        declared: Option<SourceIdentity>,
    },
    ConstraintUnsatisfied,
    SourceRemoved(SourceIdentity),
    DescriptorChanged,
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewRequirement => write!(f, "added to the manifest"),
            Self::SourceChanged { locked, declared } => write!(
                f,
                "source changed from {} to {}",
                describe(locked.as_ref()),
                describe(declared.as_ref())
            ),
            Self::ConstraintUnsatisfied => {
                write!(f, "locked version no longer satisfies the manifest")
            }
            Self::SourceRemoved(source) => write!(f, "source {source} is no longer declared"),
            Self::DescriptorChanged => write!(f, "package descriptor changed"),
        }
    }
}

fn describe(source: Option<&SourceIdentity>) -> String {
    source
        .map(ToString::to_string)
        .unwrap_or_else(|| "the default sources".to_string())
}

/// Names whose lock entries no longer reflect the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drift {
    pub changes: BTreeMap<String, DriftReason>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.changes.keys().cloned().collect()
    }

    /// Sources whose locked revision can no longer be trusted.
    pub fn changed_sources(&self) -> BTreeSet<SourceIdentity> {
        self.changes
            .values()
            .filter_map(|reason| match reason {
                DriftReason::SourceChanged {
                    declared: Some(declared),
                    ..
                } => Some(declared.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn detect_drift(manifest: &Manifest, lock: &Lockfile, sources: &SourceSet) -> Result<Drift> {
    let mut drift = Drift::default();

    for requirement in manifest.requirements() {
        let Some(locked) = lock.dependency(&requirement.name) else {
            drift
                .changes
                .insert(requirement.name.clone(), DriftReason::NewRequirement);
            continue;
        };
        if locked.source != requirement.source {
            drift.changes.insert(
                requirement.name.clone(),
                DriftReason::SourceChanged {
                    locked: locked.source.clone(),
                    declared: requirement.source.clone(),
                },
            );
            continue;
        }
        if let Some(entry) = lock.entry(&requirement.name) {
            if !requirement.requirement.matches(&entry.version) {
                drift.changes.insert(
                    requirement.name.clone(),
                    DriftReason::ConstraintUnsatisfied,
                );
            }
        }
    }

    let declared: BTreeSet<&SourceIdentity> = manifest.sources().iter().collect();
    for entry in &lock.entries {
        if drift.changes.contains_key(&entry.name) {
            continue;
        }
        if !declared.contains(&entry.source) {
            drift.changes.insert(
                entry.name.clone(),
                DriftReason::SourceRemoved(entry.source.clone()),
            );
            continue;
        }
        if entry.source.kind() != SourceKind::Path {
            continue;
        }
        let Some(source) = sources.get(&entry.source) else {
            continue;
        };
        let current = source
            .candidates(&entry.name)?
            .into_iter()
            .find(|spec| entry.matches(spec));
        let unchanged = current.is_some_and(|spec| {
            let mut dependencies = spec.dependencies.clone();
            dependencies.sort_by(|left, right| left.name.cmp(&right.name));
            dependencies == entry.dependencies
        });
        if !unchanged {
            drift
                .changes
                .insert(entry.name.clone(), DriftReason::DescriptorChanged);
        }
    }

    for (name, reason) in &drift.changes {
        debug!(package = %name, %reason, "lock drift");
    }
    Ok(drift)
}
