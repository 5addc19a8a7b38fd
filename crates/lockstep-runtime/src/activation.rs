use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use lockstep_installer::{active_specs, read_install_receipts, InstallLayout};
use lockstep_lockfile::{LockEntry, Lockfile};
use tracing::debug;

use crate::env::{
    flag_value, merge_flags, merge_path_list, remove_flag, retain_paths, LOAD_PATH_VAR,
    LOCKFILE_VAR, OPTS_VAR, PATH_VAR,
};
use crate::{ActivationOptions, LoadRestriction};

/// A locked package as it is installed, ready to be put on the search paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePackage {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub root: PathBuf,
    pub load_paths: Vec<PathBuf>,
    pub executables: Vec<String>,
}

impl ActivePackage {
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn full_name(&self) -> String {
        if self.platform == lockstep_core::GENERIC_PLATFORM {
            format!("{} {}", self.name, self.version)
        } else {
            format!("{} {} ({})", self.name, self.version, self.platform)
        }
    }
}

/// The locked package set of one project, restricted to the selected groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    packages: Vec<ActivePackage>,
    install_root: PathBuf,
    lockfile: Option<PathBuf>,
    without: BTreeSet<String>,
}

impl Activation {
    /// Builds the activation from the lock and the install receipts. Every
    /// active package must be installed exactly as locked.
    pub fn load(
        lock: &Lockfile,
        layout: &InstallLayout,
        options: &ActivationOptions,
    ) -> Result<Self> {
        let graph = lock.to_graph();
        let specs = active_specs(&graph, &options.groups, &options.platform())?;
        let receipts = read_install_receipts(layout)?
            .into_iter()
            .map(|receipt| (receipt.name.clone(), receipt))
            .collect::<BTreeMap<_, _>>();

        let mut packages = Vec::with_capacity(specs.len());
        for spec in &specs {
            let entry = LockEntry::from_spec(spec);
            let receipt = receipts
                .get(&spec.name)
                .filter(|receipt| receipt.matches(&entry) && receipt.root_path().is_dir())
                .ok_or_else(|| {
                    anyhow!(
                        "{} is not installed; run `lockstep install`",
                        spec.full_name()
                    )
                })?;
            packages.push(ActivePackage {
                name: receipt.name.clone(),
                version: receipt.version.clone(),
                platform: receipt.platform.clone(),
                root: receipt.root_path().to_path_buf(),
                load_paths: receipt.load_path_dirs(),
                executables: receipt.executables.clone(),
            });
        }
        debug!(
            packages = packages.len(),
            root = %layout.root().display(),
            "activation loaded"
        );

        Ok(Self {
            packages,
            install_root: layout.root().to_path_buf(),
            lockfile: None,
            without: options.groups.excluded(),
        })
    }

    /// Records where the lock was read from, so nested invocations find it.
    pub fn with_lockfile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lockfile = Some(path.into());
        self
    }

    pub fn packages(&self) -> &[ActivePackage] {
        &self.packages
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn lockfile(&self) -> Option<&Path> {
        self.lockfile.as_deref()
    }

    pub fn bin_dirs(&self) -> Vec<PathBuf> {
        self.packages
            .iter()
            .filter(|package| !package.executables.is_empty())
            .map(ActivePackage::bin_dir)
            .collect()
    }

    pub fn load_paths(&self) -> Vec<PathBuf> {
        self.packages
            .iter()
            .flat_map(|package| package.load_paths.iter().cloned())
            .collect()
    }

    /// The environment a process launched under this activation sees.
    /// Applying it to its own output changes nothing.
    ///
    /// An environment activated for another project is taken apart first:
    /// its load path is dropped and so are its package `bin` directories on
    /// `PATH`, so only this project's packages stay visible.
    pub fn environment(
        &self,
        inherited: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut environment = inherited.clone();
        let inherited_opts = inherited.get(OPTS_VAR).map(String::as_str);
        let inherited_path = inherited.get(PATH_VAR).map(String::as_str);
        let inherited_load_path = inherited.get(LOAD_PATH_VAR).map(String::as_str);

        let (base_path, base_load_path) = if self.is_foreign(inherited) {
            let outer_root = flag_value(inherited_opts, "install-root").map(PathBuf::from);
            let outer_bins = inherited_load_path
                .map(|value| {
                    std::env::split_paths(value)
                        .filter_map(|entry| entry.parent().map(|root| root.join("bin")))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            debug!(
                outer = ?outer_root,
                "replacing the activation of another project"
            );
            let path = retain_paths(inherited_path, |entry| {
                let under_outer_root = outer_root
                    .as_ref()
                    .is_some_and(|root| entry.starts_with(root));
                !under_outer_root && !outer_bins.iter().any(|bin| bin == entry)
            })?;
            (path, None)
        } else {
            (
                inherited_path.map(str::to_string),
                inherited_load_path.map(str::to_string),
            )
        };

        let path = merge_path_list(base_path.as_deref(), &self.bin_dirs())?;
        environment.insert(PATH_VAR.to_string(), path);

        let load_path = merge_path_list(base_load_path.as_deref(), &self.load_paths())?;
        environment.insert(LOAD_PATH_VAR.to_string(), load_path);

        let mut flags = Vec::new();
        if let Some(lockfile) = &self.lockfile {
            flags.push(("lockfile".to_string(), lockfile.display().to_string()));
        }
        flags.push((
            "install-root".to_string(),
            self.install_root.display().to_string(),
        ));
        if !self.without.is_empty() {
            flags.push((
                "without".to_string(),
                self.without.iter().cloned().collect::<Vec<_>>().join(","),
            ));
        }
        let mut opts = merge_flags(inherited_opts, &flags);
        if self.lockfile.is_none() {
            opts = remove_flag(&opts, "lockfile");
        }
        if self.without.is_empty() {
            opts = remove_flag(&opts, "without");
        }
        environment.insert(OPTS_VAR.to_string(), opts);

        match &self.lockfile {
            Some(lockfile) => {
                environment.insert(LOCKFILE_VAR.to_string(), lockfile.display().to_string());
            }
            None => {
                environment.remove(LOCKFILE_VAR);
            }
        }
        Ok(environment)
    }

    /// Whether `inherited` was activated for another project, recognised by a
    /// different install root or lockfile.
    fn is_foreign(&self, inherited: &BTreeMap<String, String>) -> bool {
        let opts = inherited.get(OPTS_VAR).map(String::as_str);
        let outer_root = flag_value(opts, "install-root").map(PathBuf::from);
        let outer_lock = flag_value(opts, "lockfile")
            .or_else(|| inherited.get(LOCKFILE_VAR).map(String::as_str))
            .map(PathBuf::from);

        let other_root = outer_root
            .as_ref()
            .is_some_and(|root| root != &self.install_root);
        let other_lock = match (&outer_lock, &self.lockfile) {
            (Some(outer), Some(ours)) => outer != ours,
            (Some(_), None) => true,
            _ => false,
        };
        other_root || other_lock
    }

    pub fn restriction(&self) -> LoadRestriction {
        LoadRestriction::new(self.packages.clone())
    }
}
