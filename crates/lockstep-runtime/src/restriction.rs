use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::ActivePackage;

/// In-process view of the activated set: lookups only ever see the locked
/// version of each package and only search its load paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRestriction {
    packages: BTreeMap<String, ActivePackage>,
    search_order: Vec<String>,
}

impl LoadRestriction {
    pub fn new(packages: Vec<ActivePackage>) -> Self {
        let search_order = packages
            .iter()
            .map(|package| package.name.clone())
            .collect();
        let packages = packages
            .into_iter()
            .map(|package| (package.name.clone(), package))
            .collect();
        Self {
            packages,
            search_order,
        }
    }

    pub fn package(&self, name: &str) -> Option<&ActivePackage> {
        self.packages.get(name)
    }

    pub fn is_visible(&self, name: &str, version: &str) -> bool {
        self.packages
            .get(name)
            .is_some_and(|package| package.version == version)
    }

    /// First file named `feature` under an active load path, in activation
    /// order. Absolute paths and paths leaving the load path find nothing.
    pub fn find_feature(&self, feature: &Path) -> Option<PathBuf> {
        let relative = feature
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !relative || feature.as_os_str().is_empty() {
            return None;
        }

        self.search_order
            .iter()
            .filter_map(|name| self.packages.get(name))
            .flat_map(|package| package.load_paths.iter())
            .map(|load_path| load_path.join(feature))
            .find(|candidate| candidate.is_file())
    }
}
