use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;
use lockstep_core::{Conflict, Dependency, ResolutionFailure, SourceIdentity, Specification};
use lockstep_sources::SourceSet;
use semver::VersionReq;
use tracing::debug;

use crate::constraints::{check_candidate, ConstraintSet, Origin};
use crate::types::LockPolicy;

/// Candidates already fetched from the sources, shared between passes.
pub(crate) type CandidateCache = BTreeMap<String, Vec<Specification>>;

struct Choice {
    name: String,
    spec: Specification,
    remaining: VecDeque<Specification>,
    /// Earlier stack positions whose choices ruled out candidates of this one.
    conflicts: BTreeSet<usize>,
    /// Names this choice added a constraint to, in order.
    added: Vec<String>,
}

pub(crate) enum Outcome {
    Resolved(BTreeMap<String, Specification>),
    Failed(ResolutionFailure),
}

pub(crate) struct Search<'a> {
    sources: &'a SourceSet,
    platform: &'a str,
    pins: &'a BTreeMap<String, SourceIdentity>,
    policies: &'a BTreeMap<String, LockPolicy>,
    cache: &'a mut CandidateCache,
    constraints: ConstraintSet,
    chosen: BTreeMap<String, (Specification, usize)>,
    stack: Vec<Choice>,
    failure: Option<ResolutionFailure>,
}

impl<'a> Search<'a> {
    pub(crate) fn new(
        sources: &'a SourceSet,
        platform: &'a str,
        pins: &'a BTreeMap<String, SourceIdentity>,
        policies: &'a BTreeMap<String, LockPolicy>,
        cache: &'a mut CandidateCache,
    ) -> Self {
        Self {
            sources,
            platform,
            pins,
            policies,
            cache,
            constraints: ConstraintSet::default(),
            chosen: BTreeMap::new(),
            stack: Vec::new(),
            failure: None,
        }
    }

    pub(crate) fn require(&mut self, name: &str, requirement: VersionReq) {
        self.constraints.push(name, requirement, Origin::Root);
    }

    pub(crate) fn run(mut self) -> Result<Outcome> {
        loop {
            let next = self
                .constraints
                .names()
                .find(|name| !self.chosen.contains_key(*name))
                .cloned();
            let Some(name) = next else {
                let selected = self
                    .chosen
                    .into_iter()
                    .map(|(name, (spec, _))| (name, spec))
                    .collect();
                return Ok(Outcome::Resolved(selected));
            };

            let (ordered, empty_reason) = self.ordered_candidates(&name)?;
            let mut remaining: VecDeque<Specification> = ordered.into();
            let mut conflicts = BTreeSet::new();
            let mut conflicting = Vec::new();
            let mut picked = None;
            while let Some(candidate) = remaining.pop_front() {
                match check_candidate(&candidate, &self.constraints, &self.chosen) {
                    None => {
                        picked = Some(candidate);
                        break;
                    }
                    Some(rejection) => {
                        conflicts.extend(rejection.blockers);
                        conflicting.extend(rejection.conflicting);
                    }
                }
            }

            if let Some(spec) = picked {
                self.push_choice(name, spec, remaining, conflicts);
                continue;
            }

            let reason = empty_reason.unwrap_or_else(|| {
                if conflicting.is_empty() {
                    "no version matches every constraint".to_string()
                } else {
                    "every matching version conflicts with an already chosen package".to_string()
                }
            });
            self.failure = Some(self.describe_failure(&name, reason, &conflicting));

            let mut responsible = conflicts;
            responsible.extend(self.constraints.choice_origins(&name));
            if !self.backjump(responsible)? {
                let failure = self.failure.take().unwrap_or_else(|| ResolutionFailure {
                    name,
                    reason: "no consistent set of versions exists".to_string(),
                    conflicts: Vec::new(),
                });
                return Ok(Outcome::Failed(failure));
            }
        }
    }

    /// Candidates for `name` in the order they should be tried, or the reason
    /// there are none before any constraint is considered.
    fn ordered_candidates(&mut self, name: &str) -> Result<(Vec<Specification>, Option<String>)> {
        let all = self.load(name)?;
        if all.is_empty() {
            return Ok((all, Some("not found in any source".to_string())));
        }

        let mut candidates = all
            .into_iter()
            .filter(|spec| spec.supports_platform(self.platform))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok((
                candidates,
                Some(format!("no version supports platform {}", self.platform)),
            ));
        }

        match self.policies.get(name) {
            Some(LockPolicy::Pinned(entry)) => {
                candidates.retain(|spec| entry.matches(spec));
                if candidates.is_empty() {
                    return Ok((
                        candidates,
                        Some(format!(
                            "locked version {} is no longer offered",
                            entry.full_name()
                        )),
                    ));
                }
            }
            Some(LockPolicy::PreferLocked(entry)) => {
                if let Some(position) = candidates.iter().position(|spec| entry.matches(spec)) {
                    let locked = candidates.remove(position);
                    candidates.insert(0, locked);
                }
            }
            Some(LockPolicy::Unlocked) | None => {}
        }
        Ok((candidates, None))
    }

    fn load(&mut self, name: &str) -> Result<Vec<Specification>> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(cached.clone());
        }
        let specs = self.sources.candidates_for(name, self.pins.get(name))?;
        debug!(package = name, count = specs.len(), "loaded candidates");
        self.cache.insert(name.to_string(), specs.clone());
        Ok(specs)
    }

    /// Warms the cache for the dependencies of a new choice. Lookup errors
    /// are left for the sequential load to report if the name is needed.
    fn prefetch(&mut self, spec: &Specification) {
        let requests = spec
            .dependencies
            .iter()
            .filter(|dependency| !self.cache.contains_key(&dependency.name))
            .map(|dependency| {
                (
                    dependency.name.clone(),
                    self.pins.get(&dependency.name).cloned(),
                )
            })
            .collect::<Vec<_>>();
        if requests.len() < 2 {
            return;
        }
        for (name, result) in self.sources.prefetch(&requests) {
            if let Ok(specs) = result {
                self.cache.insert(name, specs);
            }
        }
    }

    fn push_choice(
        &mut self,
        name: String,
        spec: Specification,
        remaining: VecDeque<Specification>,
        conflicts: BTreeSet<usize>,
    ) {
        let index = self.stack.len();
        debug!(depth = index, spec = %spec.full_name(), "choose");
        self.prefetch(&spec);

        let mut added = Vec::with_capacity(spec.dependencies.len());
        for dependency in &spec.dependencies {
            self.constraints.push(
                &dependency.name,
                dependency.requirement.clone(),
                Origin::Choice(index),
            );
            added.push(dependency.name.clone());
        }
        self.chosen.insert(name.clone(), (spec.clone(), index));
        self.stack.push(Choice {
            name,
            spec,
            remaining,
            conflicts,
            added,
        });
    }

    fn pop_choice(&mut self) -> Option<Choice> {
        let choice = self.stack.pop()?;
        for name in choice.added.iter().rev() {
            self.constraints.pop(name);
        }
        self.chosen.remove(&choice.name);
        Some(choice)
    }

    /// Rewinds to the most recent responsible choice and moves it to its next
    /// viable candidate. Returns false when no choice can be changed.
    fn backjump(&mut self, mut responsible: BTreeSet<usize>) -> Result<bool> {
        loop {
            let Some(target) = responsible.pop_last() else {
                return Ok(false);
            };
            while self.stack.len() > target + 1 {
                self.pop_choice();
            }
            let Some(mut choice) = self.pop_choice() else {
                return Ok(false);
            };
            debug!(depth = target, package = %choice.name, "backjump");
            choice.conflicts.extend(responsible);

            while let Some(candidate) = choice.remaining.pop_front() {
                match check_candidate(&candidate, &self.constraints, &self.chosen) {
                    None => {
                        self.push_choice(
                            choice.name,
                            candidate,
                            choice.remaining,
                            choice.conflicts,
                        );
                        return Ok(true);
                    }
                    Some(rejection) => choice.conflicts.extend(rejection.blockers),
                }
            }

            responsible = choice.conflicts;
            responsible.extend(self.constraints.choice_origins(&choice.name));
        }
    }

    fn describe_failure(
        &self,
        name: &str,
        reason: String,
        conflicting: &[(Dependency, String)],
    ) -> ResolutionFailure {
        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut push = |conflict: Conflict| {
            if !conflicts.contains(&conflict) {
                conflicts.push(conflict);
            }
        };

        for constraint in self.constraints.on(name) {
            push(Conflict {
                requirement: format!("{name} ({})", constraint.requirement),
                chain: self.chain(constraint.origin),
            });
        }
        for (dependency, dependent) in conflicting {
            let mut chain = self.chain_to(name);
            chain.push(dependent.clone());
            push(Conflict {
                requirement: dependency.to_string(),
                chain,
            });
            for constraint in self.constraints.on(&dependency.name) {
                push(Conflict {
                    requirement: format!("{} ({})", dependency.name, constraint.requirement),
                    chain: self.chain(constraint.origin),
                });
            }
        }

        ResolutionFailure {
            name: name.to_string(),
            reason,
            conflicts,
        }
    }

    /// The chain of choices that introduced a constraint, `root` first.
    fn chain(&self, origin: Origin) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = origin;
        while let Origin::Choice(index) = current {
            let Some(choice) = self.stack.get(index) else {
                break;
            };
            chain.push(choice.spec.full_name());
            // Origins always point further down the stack.
            current = match self.constraints.on(&choice.name).first() {
                Some(constraint) => match constraint.origin {
                    Origin::Choice(parent) if parent >= index => Origin::Root,
                    origin => origin,
                },
                None => Origin::Root,
            };
        }
        chain.push("root".to_string());
        chain.reverse();
        chain
    }

    fn chain_to(&self, name: &str) -> Vec<String> {
        let origin = self
            .constraints
            .on(name)
            .first()
            .map(|constraint| constraint.origin)
            .unwrap_or(Origin::Root);
        self.chain(origin)
    }
}
