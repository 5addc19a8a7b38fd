use std::fmt;
use std::hash::{Hash, Hasher};

use semver::Version;

use crate::descriptor::PackageDescriptor;
use crate::platform::{platform_compatible, GENERIC_PLATFORM};
use crate::requirement::Dependency;
use crate::source::SourceIdentity;

/// One concrete package version as offered by a source.
///
/// Equality and hashing only consider name, version, platform and source
/// identity; revision, layout and executables are descriptive.
#[derive(Debug, Clone)]
pub struct Specification {
    pub name: String,
    pub version: Version,
    pub platform: String,
    pub source: SourceIdentity,
    pub revision: Option<String>,
    pub subdir: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub executables: Vec<String>,
    pub load_paths: Vec<String>,
}

impl Specification {
    pub fn new(name: impl Into<String>, version: Version, source: SourceIdentity) -> Self {
        Self {
            name: name.into(),
            version,
            platform: GENERIC_PLATFORM.to_string(),
            source,
            revision: None,
            subdir: None,
            dependencies: Vec::new(),
            executables: Vec::new(),
            load_paths: vec!["lib".to_string()],
        }
    }

    pub fn from_descriptor(descriptor: PackageDescriptor, source: SourceIdentity) -> Self {
        let mut dependencies = descriptor
            .dependencies
            .into_iter()
            .map(|(name, requirement)| Dependency::new(name, requirement))
            .collect::<Vec<_>>();
        dependencies.sort_by(|left, right| left.name.cmp(&right.name));

        Self {
            name: descriptor.name,
            version: descriptor.version,
            platform: descriptor.platform,
            source,
            revision: None,
            subdir: None,
            dependencies,
            executables: descriptor.executables.unwrap_or_default(),
            load_paths: descriptor.load_paths,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_subdir(mut self, subdir: Option<String>) -> Self {
        self.subdir = subdir.filter(|value| !value.is_empty());
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self.dependencies
            .sort_by(|left, right| left.name.cmp(&right.name));
        self
    }

    pub fn with_executables<I, S>(mut self, executables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executables = executables.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_generic(&self) -> bool {
        self.platform == GENERIC_PLATFORM
    }

    pub fn supports_platform(&self, platform: &str) -> bool {
        platform_compatible(&self.platform, platform)
    }

    pub fn satisfies(&self, dependency: &Dependency) -> bool {
        self.name == dependency.name && dependency.matches(&self.version)
    }

    pub fn full_name(&self) -> String {
        if self.is_generic() {
            format!("{} {}", self.name, self.version)
        } else {
            format!("{} {} ({})", self.name, self.version, self.platform)
        }
    }

    pub fn same_identity(&self, other: &Self) -> bool {
        self == other
    }
}

impl PartialEq for Specification {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.platform == other.platform
            && self.source == other.source
    }
}

impl Eq for Specification {}

impl Hash for Specification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
        self.platform.hash(state);
        self.source.hash(state);
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}
