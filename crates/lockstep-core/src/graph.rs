use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::requirement::{Dependency, GroupSelection, Requirement};
use crate::specification::Specification;

/// A resolved set of specifications, one per `(name, platform)`, together
/// with the root requirements it was resolved for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    roots: Vec<Requirement>,
    specs: BTreeMap<(String, String), Specification>,
}

impl DependencyGraph {
    pub fn new(roots: Vec<Requirement>) -> Self {
        Self {
            roots,
            specs: BTreeMap::new(),
        }
    }

    pub fn roots(&self) -> &[Requirement] {
        &self.roots
    }

    /// Inserts a specification, returning the one it replaced for the same
    /// `(name, platform)` key.
    pub fn insert(&mut self, spec: Specification) -> Option<Specification> {
        self.specs
            .insert((spec.name.clone(), spec.platform.clone()), spec)
    }

    pub fn get(&self, name: &str) -> Option<&Specification> {
        self.specs
            .range((name.to_string(), String::new())..)
            .take_while(|((spec_name, _), _)| spec_name == name)
            .map(|(_, spec)| spec)
            .next()
    }

    pub fn get_on(&self, name: &str, platform: &str) -> Option<&Specification> {
        self.specs.get(&(name.to_string(), platform.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Specification> {
        self.specs.values()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.specs.keys().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Names reachable from `start` through the dependency relation,
    /// including `start` itself when it is part of the graph.
    pub fn reachable_from<'a, I>(&self, start: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = start.into_iter().map(str::to_string).collect();
        while let Some(name) = queue.pop_front() {
            let Some(spec) = self.get(&name) else {
                continue;
            };
            if !seen.insert(name) {
                continue;
            }
            for dependency in &spec.dependencies {
                if !seen.contains(&dependency.name) {
                    queue.push_back(dependency.name.clone());
                }
            }
        }
        seen
    }

    /// The names needed by roots whose groups are selected for `platform`.
    pub fn select(&self, groups: &GroupSelection, platform: &str) -> BTreeSet<String> {
        let active = self
            .roots
            .iter()
            .filter(|root| root.is_active(groups, platform))
            .map(|root| root.name.as_str());
        self.reachable_from(active)
    }

    /// Dependencies of chosen specifications that no chosen specification
    /// satisfies. Empty for a graph closed under dependency.
    pub fn unsatisfied(&self) -> Vec<(String, Dependency)> {
        let mut missing = Vec::new();
        for spec in self.specs.values() {
            for dependency in &spec.dependencies {
                let satisfied = self
                    .get(&dependency.name)
                    .is_some_and(|chosen| dependency.matches(&chosen.version));
                if !satisfied {
                    missing.push((spec.full_name(), dependency.clone()));
                }
            }
        }
        missing
    }
}
