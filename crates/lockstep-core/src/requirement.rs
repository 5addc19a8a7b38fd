use std::collections::BTreeSet;
use std::fmt;

use semver::{Op, Version, VersionReq};

use crate::platform::GENERIC_PLATFORM;
use crate::source::SourceIdentity;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub name: String,
    pub requirement: VersionReq,
}

impl Dependency {
    pub fn new(name: impl Into<String>, requirement: VersionReq) -> Self {
        Self {
            name: name.into(),
            requirement,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.requirement.matches(version)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.requirement)
    }
}

/// Which manifest groups an operation works with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupSelection {
    #[default]
    All,
    Only(BTreeSet<String>),
    Without(BTreeSet<String>),
}

impl GroupSelection {
    pub fn without<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups: BTreeSet<String> = groups.into_iter().map(Into::into).collect();
        if groups.is_empty() {
            Self::All
        } else {
            Self::Without(groups)
        }
    }

    pub fn only<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(groups.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, group: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(groups) => groups.contains(group),
            Self::Without(groups) => !groups.contains(group),
        }
    }

    pub fn includes_any(&self, groups: &BTreeSet<String>) -> bool {
        groups.iter().any(|group| self.includes(group))
    }

    pub fn excluded(&self) -> BTreeSet<String> {
        match self {
            Self::Without(groups) => groups.clone(),
            _ => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub requirement: VersionReq,
    pub source: Option<SourceIdentity>,
    pub groups: BTreeSet<String>,
    pub platforms: BTreeSet<String>,
}

impl Requirement {
    pub fn new(name: impl Into<String>, requirement: VersionReq) -> Self {
        Self {
            name: name.into(),
            requirement,
            source: None,
            groups: BTreeSet::from([DEFAULT_GROUP.to_string()]),
            platforms: BTreeSet::new(),
        }
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, VersionReq::STAR)
    }

    pub fn with_source(mut self, source: SourceIdentity) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        if self.groups.is_empty() {
            self.groups.insert(DEFAULT_GROUP.to_string());
        }
        self
    }

    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_to_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty()
            || platform == GENERIC_PLATFORM
            || self.platforms.contains(platform)
    }

    pub fn is_active(&self, groups: &GroupSelection, platform: &str) -> bool {
        groups.includes_any(&self.groups) && self.applies_to_platform(platform)
    }

    pub fn as_dependency(&self) -> Dependency {
        Dependency::new(self.name.clone(), self.requirement.clone())
    }

    /// The single version an `=x.y.z` constraint names, if it names one.
    pub fn exact_version(&self) -> Option<Version> {
        let [comparator] = self.requirement.comparators.as_slice() else {
            return None;
        };
        if comparator.op != Op::Exact {
            return None;
        }
        let mut version = Version::new(
            comparator.major,
            comparator.minor.unwrap_or(0),
            comparator.patch.unwrap_or(0),
        );
        version.pre = comparator.pre.clone();
        Some(version)
    }
}
