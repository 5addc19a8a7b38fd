use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use lockstep_core::{
    classify, is_retryable, DependencyGraph, Error, Manifest, SourceIdentity, MANIFEST_FILE,
};
use lockstep_installer::{
    active_specs, default_user_home, missing_packages, vcs_cache_dir, InstallLayout,
    InstallOptions, InstalledPackage, Materializer,
};
use lockstep_lockfile::{Lockfile, LOCKFILE_NAME};
use lockstep_resolver::{detect_drift, refreshed_sources, ResolveOptions, Resolver, UpdateScope};
use lockstep_runtime::{
    dispatch, Activation, ActivationOptions, LOAD_PATH_VAR, LOCKFILE_VAR, OPTS_VAR, PATH_VAR,
};
use lockstep_sources::{SourceSet, SourceSetOptions, VcsCache};
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::render::{render_status_line, OutputStyle, TerminalRenderer};

const MANIFEST_ENV_VAR: &str = "LOCKSTEP_MANIFEST";

/// One manifest with its lock, settings and install root.
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub lock_path: PathBuf,
    pub config: ProjectConfig,
    pub layout: InstallLayout,
    pub home: PathBuf,
}

impl Project {
    /// Finds the manifest from `--manifest`, `LOCKSTEP_MANIFEST` or the
    /// nearest `Lockstep.toml` above the current directory.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let manifest_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(MANIFEST_ENV_VAR).filter(|value| !value.is_empty()) {
                Some(path) => PathBuf::from(path),
                None => {
                    let cwd = std::env::current_dir()
                        .context("failed to determine the current directory")?;
                    find_manifest(&cwd).ok_or_else(|| {
                        anyhow!(
                            "could not locate {MANIFEST_FILE} in {} or any parent directory",
                            cwd.display()
                        )
                    })?
                }
            },
        };
        Self::open(&manifest_path, default_user_home()?)
    }

    pub fn open(manifest_path: &Path, home: PathBuf) -> Result<Self> {
        let manifest_path = if manifest_path.is_absolute() {
            manifest_path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed to determine the current directory")?
                .join(manifest_path)
        };
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("manifest path has no parent: {}", manifest_path.display()))?;
        let manifest = Manifest::load(&manifest_path)?;
        let config = ProjectConfig::load(&dir)?;
        debug!(manifest = %manifest_path.display(), "opened project");
        let layout = InstallLayout::new(config.install_root(&dir));

        Ok(Self {
            lock_path: dir.join(LOCKFILE_NAME),
            dir,
            manifest,
            config,
            layout,
            home,
        })
    }

    pub fn load_lock(&self) -> Result<Option<Lockfile>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }
        Lockfile::load(&self.lock_path).map(Some)
    }

    fn require_lock(&self) -> Result<Lockfile> {
        self.load_lock()?.ok_or_else(|| {
            anyhow!(
                "no lock at {}; run `lockstep install` first",
                self.lock_path.display()
            )
        })
    }

    /// Sources for the manifest. Version-control sources keep the revision a
    /// previous lock recorded unless they are listed in `refreshed`.
    pub fn source_set(
        &self,
        lock: Option<&Lockfile>,
        refreshed: &BTreeSet<SourceIdentity>,
    ) -> Result<SourceSet> {
        let mut locked_revisions = lock.map(Lockfile::locked_revisions).unwrap_or_default();
        locked_revisions.retain(|source, _| !refreshed.contains(source));
        let cache = Arc::new(VcsCache::new(vcs_cache_dir(&self.home)));
        SourceSet::for_manifest(
            &self.manifest,
            cache,
            SourceSetOptions {
                priority: self.config.priority()?,
                locked_revisions,
            },
        )
    }

    fn resolve_options(&self, update: Option<UpdateScope>) -> Result<ResolveOptions> {
        Ok(ResolveOptions::new(self.config.platform())?
            .with_priority(self.config.priority()?)
            .with_update(update))
    }

    fn install_options(&self) -> Result<InstallOptions> {
        Ok(InstallOptions::without(self.config.without.iter().cloned())?
            .with_platform(self.config.platform()))
    }

    fn activation_options(&self) -> Result<ActivationOptions> {
        Ok(ActivationOptions::without(self.config.without.iter().cloned())?
            .with_platform(self.config.platform()))
    }
}

pub fn find_manifest(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(MANIFEST_FILE))
        .find(|candidate| candidate.is_file())
}

pub fn run_install_command(
    project: &mut Project,
    without: Option<Vec<String>>,
    path: Option<PathBuf>,
) -> Result<()> {
    if without.is_some() || path.is_some() {
        if let Some(without) = without {
            project.config.without = without
                .into_iter()
                .map(|group| group.trim().to_string())
                .filter(|group| !group.is_empty())
                .collect();
        }
        if let Some(path) = path {
            project.config.install_root = Some(path);
        }
        let saved = project.config.save(&project.dir)?;
        debug!(config = %saved.display(), "saved project config");
        project.layout = InstallLayout::new(project.config.install_root(&project.dir));
    }

    let lock = project.load_lock()?;
    let sources = project.source_set(lock.as_ref(), &BTreeSet::new())?;
    let graph = match current_lock_graph(project, lock.as_ref(), &sources)? {
        Some(graph) => {
            info!(lock = %project.lock_path.display(), "lock is current; skipping resolution");
            graph
        }
        None => {
            let graph = resolve_with_retries(project, &sources, lock.as_ref(), None)?;
            write_lock(project, lock.as_ref(), &graph)?;
            graph
        }
    };

    install_graph(project, &sources, &graph)?;
    Ok(())
}

pub fn run_update_command(project: &Project, names: Vec<String>, sources: Vec<String>) -> Result<()> {
    let scope = update_scope(names, sources);
    let lock = project.load_lock()?;
    let refreshed = match &lock {
        Some(lock) => refreshed_sources(&project.manifest, lock, Some(&scope)),
        None => BTreeSet::new(),
    };
    let source_set = project.source_set(lock.as_ref(), &refreshed)?;
    let graph = resolve_with_retries(project, &source_set, lock.as_ref(), Some(scope))?;
    let written = write_lock(project, lock.as_ref(), &graph)?;

    let renderer = TerminalRenderer::current();
    let changes = format_lock_changes(lock.as_ref(), &written, renderer.style());
    if changes.is_empty() {
        renderer.print_status("step", "no locked versions changed");
    } else {
        renderer.print_lines(&changes);
    }

    install_graph(project, &source_set, &graph)?;
    Ok(())
}

pub fn run_lock_command(project: &Project) -> Result<()> {
    let lock = project.load_lock()?;
    let sources = project.source_set(lock.as_ref(), &BTreeSet::new())?;
    let graph = resolve_with_retries(project, &sources, lock.as_ref(), None)?;
    let written = write_lock(project, lock.as_ref(), &graph)?;
    TerminalRenderer::current().print_status(
        "ok",
        &format!(
            "locked {} packages in {}",
            written.entries.len(),
            project.lock_path.display()
        ),
    );
    Ok(())
}

/// Exit code 0 when the lock matches the manifest and every active package
/// is installed, 1 otherwise.
pub fn run_check_command(project: &Project) -> Result<i32> {
    let renderer = TerminalRenderer::current();
    let Some(lock) = project.load_lock()? else {
        renderer.print_status(
            "err",
            &format!("no lock at {}", project.lock_path.display()),
        );
        return Ok(1);
    };

    let sources = project.source_set(Some(&lock), &BTreeSet::new())?;
    let drift = detect_drift(&project.manifest, &lock, &sources)?;
    if !drift.is_empty() {
        for (name, reason) in &drift.changes {
            renderer.print_status("warn", &format!("{name}: {reason}"));
        }
        renderer.print_status("err", "the lock is out of date; run `lockstep install`");
        return Ok(1);
    }

    let missing = missing_packages(&project.layout, &lock, &project.install_options()?)?;
    if !missing.is_empty() {
        for package in &missing {
            renderer.print_status("warn", &format!("missing {package}"));
        }
        renderer.print_status(
            "err",
            "some locked packages are not installed; run `lockstep install`",
        );
        return Ok(1);
    }

    renderer.print_status("ok", "the project's dependencies are satisfied");
    Ok(0)
}

pub fn run_exec_command(project: &Project, command: &str, args: &[String]) -> Result<i32> {
    let activation = load_activation(project)?;
    let inherited = std::env::vars().collect::<BTreeMap<_, _>>();
    dispatch(&activation, command, args, &inherited)
}

pub fn run_env_command(project: &Project) -> Result<()> {
    let activation = load_activation(project)?;
    let inherited = std::env::vars().collect::<BTreeMap<_, _>>();
    let environment = activation.environment(&inherited)?;
    for line in format_env_lines(&environment, cfg!(windows)) {
        println!("{line}");
    }
    Ok(())
}

fn load_activation(project: &Project) -> Result<Activation> {
    let lock = project.require_lock()?;
    Ok(
        Activation::load(&lock, &project.layout, &project.activation_options()?)?
            .with_lockfile_path(&project.lock_path),
    )
}

/// The lock's graph when it can be installed as is: no drift, the same
/// root requirements and a build for this platform.
fn current_lock_graph(
    project: &Project,
    lock: Option<&Lockfile>,
    sources: &SourceSet,
) -> Result<Option<DependencyGraph>> {
    let Some(lock) = lock else {
        return Ok(None);
    };

    let platform = project.config.platform();
    if !lock.platforms.contains(&platform) {
        debug!(platform = %platform, "lock has no entries for this platform");
        return Ok(None);
    }

    let locked_roots = lock
        .dependencies
        .iter()
        .map(|req| req.name.as_str())
        .collect::<BTreeSet<_>>();
    let manifest_roots = project
        .manifest
        .requirements()
        .iter()
        .map(|req| req.name.as_str())
        .collect::<BTreeSet<_>>();
    if locked_roots != manifest_roots {
        debug!("manifest requirements differ from the lock");
        return Ok(None);
    }

    let drift = detect_drift(&project.manifest, lock, sources)?;
    if !drift.is_empty() {
        for (name, reason) in &drift.changes {
            info!(package = %name, reason = %reason, "lock drift");
        }
        return Ok(None);
    }

    let graph = lock.to_graph();
    if !graph.unsatisfied().is_empty() {
        return Ok(None);
    }
    Ok(Some(graph))
}

fn resolve_with_retries(
    project: &Project,
    sources: &SourceSet,
    lock: Option<&Lockfile>,
    update: Option<UpdateScope>,
) -> Result<DependencyGraph> {
    let resolver = Resolver::new(sources, project.resolve_options(update)?);
    with_fetch_retries(project.config.fetch_retries, "resolve", || {
        resolver.resolve(&project.manifest, lock)
    })
}

/// Runs `operation` again while it fails with a transient source error, up
/// to `retries` more times.
pub fn with_fetch_retries<T, F>(retries: u32, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0_u32;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retries && is_retryable(&err) => {
                attempt += 1;
                warn!(
                    attempt,
                    retries,
                    error = %format!("{err:#}"),
                    "{what} failed on an unavailable source; retrying"
                );
            }
            Err(err) => return Err(err),
        }
    }
}


/// Saves the lock for `graph` unless it is byte-identical to the one on disk.
fn write_lock(
    project: &Project,
    previous: Option<&Lockfile>,
    graph: &DependencyGraph,
) -> Result<Lockfile> {
    let lock = Lockfile::from_graph(
        graph,
        project.manifest.sources(),
        &project.config.platform(),
        &project.config.without,
    );
    if previous.is_some_and(|previous| previous.write() == lock.write()) {
        debug!(lock = %project.lock_path.display(), "lock unchanged");
        return Ok(lock);
    }
    lock.save(&project.lock_path)?;
    info!(lock = %project.lock_path.display(), entries = lock.entries.len(), "wrote lock");
    Ok(lock)
}

fn install_graph(
    project: &Project,
    sources: &SourceSet,
    graph: &DependencyGraph,
) -> Result<Vec<InstalledPackage>> {
    let options = project.install_options()?;
    let total = active_specs(graph, &options.groups(), &options.platform())?.len() as u64;
    let renderer = TerminalRenderer::current();
    renderer.print_section("install");

    let mut progress = renderer.start_progress("install", total);
    let mut done = 0_u64;
    let result = with_fetch_retries(project.config.fetch_retries, "install", || {
        done = 0;
        Materializer::new(&project.layout, sources).install_with(graph, &options, |_| {
            done += 1;
            progress.set(done);
        })
    });
    let installed = match result {
        Ok(installed) => {
            progress.finish_success();
            installed
        }
        Err(err) => {
            progress.finish_abandon();
            return Err(err);
        }
    };

    renderer.print_lines(&format_install_lines(
        &installed,
        &options.without,
        project.layout.root(),
        renderer.style(),
    ));
    Ok(installed)
}

fn update_scope(names: Vec<String>, sources: Vec<String>) -> UpdateScope {
    if names.is_empty() && sources.is_empty() {
        return UpdateScope::All;
    }
    UpdateScope::Only {
        names: names.into_iter().collect(),
        sources: sources.into_iter().collect(),
    }
}

pub fn format_install_lines(
    installed: &[InstalledPackage],
    without: &BTreeSet<String>,
    root: &Path,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = installed
        .iter()
        .map(|package| {
            let name = if package.platform == lockstep_core::GENERIC_PLATFORM {
                format!("{} {}", package.name, package.version)
            } else {
                format!("{} {} ({})", package.name, package.version, package.platform)
            };
            if package.reused {
                render_status_line(style, "step", &format!("using {name}"))
            } else {
                render_status_line(style, "ok", &format!("installed {name}"))
            }
        })
        .collect::<Vec<_>>();

    let fresh = installed.iter().filter(|package| !package.reused).count();
    lines.push(render_status_line(
        style,
        "ok",
        &format!(
            "{} packages ready in {} ({fresh} installed)",
            installed.len(),
            root.display()
        ),
    ));
    if !without.is_empty() {
        lines.push(render_status_line(
            style,
            "step",
            &format!(
                "groups left out: {}",
                without.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        ));
    }
    lines
}

/// One line per package whose locked version, platform or revision moved.
pub fn format_lock_changes(
    previous: Option<&Lockfile>,
    current: &Lockfile,
    style: OutputStyle,
) -> Vec<String> {
    let describe = |entry: &lockstep_lockfile::LockEntry| match &entry.revision {
        Some(revision) => format!(
            "{} ({})",
            entry.full_name(),
            revision.chars().take(12).collect::<String>()
        ),
        None => entry.full_name(),
    };

    let mut lines = Vec::new();
    for entry in &current.entries {
        let old = previous.and_then(|lock| lock.entry(&entry.name));
        match old {
            None => lines.push(render_status_line(
                style,
                "ok",
                &format!("added {}", describe(entry)),
            )),
            Some(old) if old != entry => lines.push(render_status_line(
                style,
                "ok",
                &format!("{} -> {}", describe(old), describe(entry)),
            )),
            Some(_) => {}
        }
    }
    if let Some(previous) = previous {
        for entry in &previous.entries {
            if current.entry(&entry.name).is_none() {
                lines.push(render_status_line(
                    style,
                    "warn",
                    &format!("removed {}", describe(entry)),
                ));
            }
        }
    }
    lines
}

/// Shell assignments for the variables activation controls.
pub fn format_env_lines(environment: &BTreeMap<String, String>, windows: bool) -> Vec<String> {
    [PATH_VAR, LOAD_PATH_VAR, OPTS_VAR, LOCKFILE_VAR]
        .into_iter()
        .filter_map(|name| environment.get(name).map(|value| (name, value)))
        .map(|(name, value)| {
            if windows {
                format!("set \"{name}={value}\"")
            } else {
                format!("export {name}=\"{}\"", value.replace('"', "\\\""))
            }
        })
        .collect()
}

pub fn error_exit_code(err: &anyhow::Error) -> i32 {
    classify(err).map(Error::exit_code).unwrap_or(1)
}
