use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use lockstep_core::{
    DependencyGraph, Error, GroupSelection, SourceIdentity, Specification, GENERIC_PLATFORM,
};
use lockstep_lockfile::{LockEntry, Lockfile};
use lockstep_resolver::install_order;
use lockstep_sources::{replace_with_backup, Materialized, SourceSet};
use tracing::{debug, info};

use crate::receipts::{prune_receipts, read_install_receipts, write_install_receipt};
use crate::{InstallLayout, InstallOptions, InstallReceipt, InstalledPackage};

/// Marker written into every materialized unit, describing what it holds.
pub const UNIT_MARKER: &str = ".lockstep-unit";

pub struct Materializer<'a> {
    layout: &'a InstallLayout,
    sources: &'a SourceSet,
}

struct PlannedPackage {
    spec: Specification,
    unit_root: PathBuf,
    reused: bool,
}

impl<'a> Materializer<'a> {
    pub fn new(layout: &'a InstallLayout, sources: &'a SourceSet) -> Self {
        Self { layout, sources }
    }

    pub fn install(
        &self,
        graph: &DependencyGraph,
        options: &InstallOptions,
    ) -> Result<Vec<InstalledPackage>> {
        self.install_with(graph, options, |_| {})
    }

    /// Installs every package active under `options`. Units are staged first
    /// and only committed once all of them materialized; the first failure
    /// discards the staging area and leaves the installed set untouched.
    pub fn install_with<F>(
        &self,
        graph: &DependencyGraph,
        options: &InstallOptions,
        mut on_package: F,
    ) -> Result<Vec<InstalledPackage>>
    where
        F: FnMut(&InstalledPackage),
    {
        let platform = options.platform();
        let specs = active_specs(graph, &options.groups(), &platform)?;
        self.layout.ensure_base_dirs()?;

        let txid = format!("install-{}-{}", std::process::id(), unique_suffix());
        let staging = self.layout.transaction_staging_path(&txid);
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed creating staging dir: {}", staging.display()))?;

        let planned = self.stage_and_commit(&specs, &staging);
        let _ = fs::remove_dir_all(&staging);
        let planned = planned?;

        let now = current_unix_timestamp();
        let mut installed = Vec::with_capacity(planned.len());
        for package in planned {
            let root = match &package.spec.subdir {
                Some(subdir) => package.unit_root.join(subdir),
                None => package.unit_root.clone(),
            };
            let entry = InstalledPackage {
                name: package.spec.name.clone(),
                version: package.spec.version.to_string(),
                platform: package.spec.platform.clone(),
                source: package.spec.source.clone(),
                root,
                load_paths: package.spec.load_paths.clone(),
                executables: package.spec.executables.clone(),
                reused: package.reused,
            };
            write_install_receipt(
                self.layout,
                &InstallReceipt::from_installed(&entry, package.spec.revision.clone(), now),
            )?;
            on_package(&entry);
            installed.push(entry);
        }

        let keep = installed
            .iter()
            .map(|package| package.name.clone())
            .collect::<BTreeSet<_>>();
        for name in prune_receipts(self.layout, &keep)? {
            debug!(package = %name, "removed stale receipt");
        }
        info!(
            packages = installed.len(),
            root = %self.layout.root().display(),
            "install complete"
        );
        Ok(installed)
    }

    fn stage_and_commit(
        &self,
        specs: &[Specification],
        staging: &Path,
    ) -> Result<Vec<PlannedPackage>> {
        let mut units: BTreeMap<PathBuf, bool> = BTreeMap::new();
        let mut pending: Vec<(PathBuf, PathBuf, Specification)> = Vec::new();
        let mut planned = Vec::with_capacity(specs.len());

        for (index, locked) in specs.iter().enumerate() {
            let spec = self.hydrate(locked)?;
            let destination = self.layout.unit_dir(&spec);

            if let Some(destination) = &destination {
                if let Some(reused) = units.get(destination) {
                    planned.push(PlannedPackage {
                        spec,
                        unit_root: destination.clone(),
                        reused: *reused,
                    });
                    continue;
                }
                if unit_is_current(destination, &spec) {
                    debug!(
                        package = %spec.full_name(),
                        unit = %destination.display(),
                        "unit already in place"
                    );
                    units.insert(destination.clone(), true);
                    planned.push(PlannedPackage {
                        spec,
                        unit_root: destination.clone(),
                        reused: true,
                    });
                    continue;
                }
            }

            let source = self
                .sources
                .get(&spec.source)
                .ok_or_else(|| install_error(&spec, anyhow!("source is not configured")))?;
            let staged = staging.join(format!("unit-{index}"));
            let materialized = source
                .materialize(&spec, &staged)
                .map_err(|err| install_error(&spec, err))?;

            let unit_root = match (materialized, destination) {
                (Materialized::InPlace(root), _) => {
                    if !root.is_dir() {
                        return Err(install_error(
                            &spec,
                            anyhow!("{} does not exist", root.display()),
                        ));
                    }
                    root
                }
                (Materialized::Written, Some(destination)) => {
                    fs::write(staged.join(UNIT_MARKER), unit_marker(&spec))
                        .map_err(|err| install_error(&spec, err.into()))?;
                    units.insert(destination.clone(), false);
                    pending.push((staged, destination.clone(), spec.clone()));
                    destination
                }
                (Materialized::Written, None) => {
                    return Err(install_error(
                        &spec,
                        anyhow!("source wrote files for a package that is used in place"),
                    ));
                }
            };
            planned.push(PlannedPackage {
                spec,
                unit_root,
                reused: false,
            });
        }

        for (staged, destination, spec) in pending {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            replace_with_backup(&staged, &destination)
                .map_err(|err| install_error(&spec, err))?;
            info!(package = %spec.full_name(), unit = %destination.display(), "installed");
        }

        Ok(planned)
    }

    /// The source's own specification for a locked one, carrying the layout
    /// details a lock does not record.
    fn hydrate(&self, locked: &Specification) -> Result<Specification> {
        let source = self
            .sources
            .get(&locked.source)
            .ok_or_else(|| install_error(locked, anyhow!("source is not configured")))?;
        let candidates = source
            .candidates(&locked.name)
            .map_err(|err| install_error(locked, err))?;
        candidates
            .into_iter()
            .find(|candidate| {
                candidate == locked
                    && (locked.revision.is_none() || candidate.revision == locked.revision)
            })
            .ok_or_else(|| {
                install_error(
                    locked,
                    anyhow!("{} is no longer offered by the source", locked.full_name()),
                )
            })
    }
}

/// Specifications needed under `groups` on `platform`, dependencies first.
pub fn active_specs(
    graph: &DependencyGraph,
    groups: &GroupSelection,
    platform: &str,
) -> Result<Vec<Specification>> {
    let names = graph.select(groups, platform);
    let mut specs = Vec::with_capacity(names.len());
    for name in install_order(graph) {
        if !names.contains(&name) {
            continue;
        }
        let spec = graph
            .get_on(&name, platform)
            .or_else(|| graph.get_on(&name, GENERIC_PLATFORM))
            .ok_or_else(|| {
                anyhow!(
                    "'{name}' has no locked build for platform {platform}; run `lockstep lock` on this platform"
                )
            })?;
        specs.push(spec.clone());
    }
    Ok(specs)
}

/// Full names of active locked packages without a matching install.
pub fn missing_packages(
    layout: &InstallLayout,
    lock: &Lockfile,
    options: &InstallOptions,
) -> Result<Vec<String>> {
    let graph = lock.to_graph();
    let specs = active_specs(&graph, &options.groups(), &options.platform())?;
    let receipts = read_install_receipts(layout)?
        .into_iter()
        .map(|receipt| (receipt.name.clone(), receipt))
        .collect::<BTreeMap<_, _>>();

    let mut missing = Vec::new();
    for spec in specs {
        let entry = LockEntry::from_spec(&spec);
        let installed = receipts
            .get(&spec.name)
            .is_some_and(|receipt| receipt.matches(&entry) && receipt.root_path().is_dir());
        if !installed {
            missing.push(spec.full_name());
        }
    }
    Ok(missing)
}

fn unit_is_current(destination: &Path, spec: &Specification) -> bool {
    fs::read_to_string(destination.join(UNIT_MARKER))
        .is_ok_and(|marker| marker == unit_marker(spec))
}

fn unit_marker(spec: &Specification) -> String {
    let mut marker = format!("source={}\n", spec.source);
    match &spec.source {
        SourceIdentity::Vcs { submodules, .. } => {
            marker.push_str(&format!(
                "revision={}\nsubmodules={submodules}\n",
                spec.revision.as_deref().unwrap_or_default()
            ));
        }
        _ => marker.push_str(&format!("package={}\n", spec.full_name())),
    }
    marker
}

fn install_error(spec: &Specification, err: anyhow::Error) -> anyhow::Error {
    Error::Install {
        package: spec.full_name(),
        remote: spec.source.to_string(),
        cause: err,
    }
    .into()
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
