use lockstep_core::{Dependency, SourceIdentity, Specification};
use semver::Version;

/// The part of a specification a lock needs to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub name: String,
    pub version: Version,
    pub platform: String,
    pub source: SourceIdentity,
    pub revision: Option<String>,
    pub dependencies: Vec<Dependency>,
}

impl LockEntry {
    pub fn from_spec(spec: &Specification) -> Self {
        let mut dependencies = spec.dependencies.clone();
        dependencies.sort_by(|left, right| left.name.cmp(&right.name));
        Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
            platform: spec.platform.clone(),
            source: spec.source.clone(),
            revision: spec.revision.clone(),
            dependencies,
        }
    }

    pub fn to_spec(&self) -> Specification {
        let mut spec = Specification::new(self.name.clone(), self.version.clone(), self.source.clone())
            .with_platform(self.platform.clone());
        spec.revision = self.revision.clone();
        spec.dependencies = self.dependencies.clone();
        spec
    }

    /// Same package, version, platform and source as `spec`.
    pub fn matches(&self, spec: &Specification) -> bool {
        self.name == spec.name
            && self.version == spec.version
            && self.platform == spec.platform
            && self.source == spec.source
    }

    pub fn full_name(&self) -> String {
        self.to_spec().full_name()
    }
}
