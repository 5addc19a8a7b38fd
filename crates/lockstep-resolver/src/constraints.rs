use std::collections::{BTreeMap, BTreeSet};

use lockstep_core::{Dependency, Specification};
use semver::VersionReq;

/// Who imposed a constraint: the manifest, or the choice at a stack position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Root,
    Choice(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct Constraint {
    pub(crate) requirement: VersionReq,
    pub(crate) origin: Origin,
}

#[derive(Debug, Default)]
pub(crate) struct ConstraintSet {
    by_name: BTreeMap<String, Vec<Constraint>>,
}

impl ConstraintSet {
    pub(crate) fn push(&mut self, name: &str, requirement: VersionReq, origin: Origin) {
        self.by_name
            .entry(name.to_string())
            .or_default()
            .push(Constraint {
                requirement,
                origin,
            });
    }

    /// Removes the most recent constraint on `name`; constraints are undone in
    /// the reverse order they were added.
    pub(crate) fn pop(&mut self, name: &str) {
        if let Some(list) = self.by_name.get_mut(name) {
            list.pop();
            if list.is_empty() {
                self.by_name.remove(name);
            }
        }
    }

    pub(crate) fn on(&self, name: &str) -> &[Constraint] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &String> {
        self.by_name.keys()
    }

    /// Stack positions of the choices that constrain `name`.
    pub(crate) fn choice_origins(&self, name: &str) -> BTreeSet<usize> {
        self.on(name)
            .iter()
            .filter_map(|constraint| match constraint.origin {
                Origin::Choice(index) => Some(index),
                Origin::Root => None,
            })
            .collect()
    }
}

/// Why a candidate cannot be chosen, as the stack positions responsible.
#[derive(Debug, Default)]
pub(crate) struct Rejection {
    pub(crate) blockers: BTreeSet<usize>,
    pub(crate) conflicting: Vec<(Dependency, String)>,
}

/// Checks `candidate` against the constraints on its name and against the
/// versions already chosen for its dependencies. `chosen` maps a name to its
/// selected specification and stack position.
pub(crate) fn check_candidate(
    candidate: &Specification,
    constraints: &ConstraintSet,
    chosen: &BTreeMap<String, (Specification, usize)>,
) -> Option<Rejection> {
    let mut rejection = Rejection::default();
    let mut rejected = false;

    for constraint in constraints.on(&candidate.name) {
        if !constraint.requirement.matches(&candidate.version) {
            rejected = true;
            if let Origin::Choice(index) = constraint.origin {
                rejection.blockers.insert(index);
            }
        }
    }

    for dependency in &candidate.dependencies {
        let Some((selected, index)) = chosen.get(&dependency.name) else {
            continue;
        };
        if !dependency.matches(&selected.version) {
            rejected = true;
            rejection.blockers.insert(*index);
            rejection
                .conflicting
                .push((dependency.clone(), candidate.full_name()));
        }
    }

    rejected.then_some(rejection)
}
