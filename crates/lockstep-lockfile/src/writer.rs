use std::collections::BTreeSet;
use std::fmt::Write;

use lockstep_core::{Requirement, SourceIdentity, DEFAULT_GROUP};

use crate::entry::LockEntry;
use crate::model::Lockfile;

pub(crate) const REGISTRY_HEADER: &str = "REGISTRY";
pub(crate) const VCS_HEADER: &str = "VCS";
pub(crate) const PATH_HEADER: &str = "PATH";
pub(crate) const PLATFORMS_HEADER: &str = "PLATFORMS";
pub(crate) const DEPENDENCIES_HEADER: &str = "DEPENDENCIES";
pub(crate) const WITHOUT_HEADER: &str = "WITHOUT";

pub(crate) fn write_lockfile(lock: &Lockfile) -> String {
    let mut lock = lock.clone();
    lock.normalize();

    let mut out = String::new();
    for (source, revision) in &lock.sources {
        write_source(&mut out, source, revision.as_deref(), lock.entries_from(source));
        out.push('\n');
    }

    out.push_str(PLATFORMS_HEADER);
    out.push('\n');
    for platform in &lock.platforms {
        let _ = writeln!(out, "  {platform}");
    }
    out.push('\n');

    out.push_str(DEPENDENCIES_HEADER);
    out.push('\n');
    for requirement in &lock.dependencies {
        let _ = writeln!(out, "  {}", render_requirement(&lock, requirement));
    }
    out.push('\n');

    out.push_str(WITHOUT_HEADER);
    out.push('\n');
    for group in &lock.without {
        let _ = writeln!(out, "  {group}");
    }
    out
}

fn write_source<'a>(
    out: &mut String,
    source: &SourceIdentity,
    revision: Option<&str>,
    entries: impl Iterator<Item = &'a LockEntry>,
) {
    match source {
        SourceIdentity::Registry { uri } => {
            let _ = writeln!(out, "{REGISTRY_HEADER}\n  remote: {uri}");
        }
        SourceIdentity::Vcs {
            uri,
            reference,
            submodules,
        } => {
            let _ = writeln!(out, "{VCS_HEADER}\n  remote: {uri}\n  ref: {reference}");
            let _ = writeln!(out, "  submodules: {submodules}");
            if let Some(revision) = revision {
                let _ = writeln!(out, "  revision: {revision}");
            }
        }
        SourceIdentity::Path { path } => {
            let _ = writeln!(out, "{PATH_HEADER}\n  remote: {}", path.display());
        }
    }

    out.push_str("  specs:\n");
    for entry in entries {
        let _ = writeln!(out, "    {}", entry.full_name());
        for dependency in &entry.dependencies {
            let _ = writeln!(out, "      {dependency}");
        }
    }
}

/// `name (req)`, then `!` for a source pin, then non-default groups in
/// brackets and platforms in braces.
///
/// A pin whose package has no entry from the pinned source (not resolved on
/// any locked platform) names the source block by position: `!2` is the
/// second source section.
fn render_requirement(lock: &Lockfile, requirement: &Requirement) -> String {
    let mut line = format!("{} ({})", requirement.name, requirement.requirement);
    if let Some(source) = &requirement.source {
        line.push('!');
        let locked = lock
            .entry(&requirement.name)
            .is_some_and(|entry| &entry.source == source);
        if !locked {
            if let Some(position) = lock.sources.keys().position(|known| known == source) {
                let _ = write!(line, "{}", position + 1);
            }
        }
    }
    let default_groups = BTreeSet::from([DEFAULT_GROUP.to_string()]);
    if requirement.groups != default_groups {
        let groups = requirement.groups.iter().cloned().collect::<Vec<_>>();
        let _ = write!(line, " [{}]", groups.join(","));
    }
    if !requirement.platforms.is_empty() {
        let platforms = requirement.platforms.iter().cloned().collect::<Vec<_>>();
        let _ = write!(line, " {{{}}}", platforms.join(","));
    }
    line
}
