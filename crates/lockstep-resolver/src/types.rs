use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use lockstep_core::{current_platform, GroupSelection};
use lockstep_lockfile::LockEntry;
use lockstep_sources::SourcePriority;

/// Names (or whole sources, by short name) an update is allowed to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateScope {
    All,
    Only {
        names: BTreeSet<String>,
        sources: BTreeSet<String>,
    },
}

impl UpdateScope {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only {
            names: names.into_iter().map(Into::into).collect(),
            sources: BTreeSet::new(),
        }
    }

    pub fn sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only {
            names: BTreeSet::new(),
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::All => false,
            Self::Only { names, sources } => names.is_empty() && sources.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub platform: String,
    pub groups: GroupSelection,
    pub source_priority: SourcePriority,
    pub update: Option<UpdateScope>,
}

impl ResolveOptions {
    pub fn new(platform: impl Into<String>) -> Result<Self> {
        let platform = platform.into();
        if platform.trim().is_empty() || platform.contains(char::is_whitespace) {
            return Err(anyhow!("invalid platform '{platform}'"));
        }
        Ok(Self {
            platform,
            groups: GroupSelection::All,
            source_priority: SourcePriority::default(),
            update: None,
        })
    }

    pub fn for_current_platform() -> Self {
        Self {
            platform: current_platform(),
            groups: GroupSelection::All,
            source_priority: SourcePriority::default(),
            update: None,
        }
    }

    pub fn with_groups(mut self, groups: GroupSelection) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_priority(mut self, priority: SourcePriority) -> Self {
        self.source_priority = priority;
        self
    }

    /// An empty scope means a plain resolution against the lock.
    pub fn with_update(mut self, update: Option<UpdateScope>) -> Self {
        self.update = update.filter(|scope| !scope.is_empty());
        self
    }
}

/// How much a locked entry constrains the candidates for its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockPolicy {
    /// Only the locked specification is acceptable.
    Pinned(LockEntry),
    /// The locked specification is tried first.
    PreferLocked(LockEntry),
    /// Newest first, as if there were no lock.
    Unlocked,
}

impl LockPolicy {
    pub(crate) fn relaxed(self) -> Self {
        match self {
            Self::Pinned(entry) => Self::PreferLocked(entry),
            other => other,
        }
    }
}
