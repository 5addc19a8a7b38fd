use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lockstep_core::{PackageDescriptor, SourceIdentity, Specification, DESCRIPTOR_FILE};
use semver::Version;

use crate::fs_ops::list_executables;

/// Every package described below `root`: the root descriptor plus descriptors
/// in nested directories. Dot-directories are skipped.
pub(crate) fn discover_specs(
    root: &Path,
    identity: &SourceIdentity,
) -> Result<Vec<Specification>> {
    let mut specs = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        if descriptor_path.is_file() {
            specs.push(load_descriptor_spec(root, &dir, &descriptor_path, identity)?);
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed reading directory {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            children.push(entry.path());
        }
        children.sort();
        queue.extend(children);
    }

    specs.sort_by(|left, right| {
        left.name
            .cmp(&right.name)
            .then_with(|| right.version.cmp(&left.version))
    });
    Ok(specs)
}

fn load_descriptor_spec(
    root: &Path,
    package_dir: &Path,
    descriptor_path: &Path,
    identity: &SourceIdentity,
) -> Result<Specification> {
    let raw = fs::read_to_string(descriptor_path)
        .with_context(|| format!("failed reading descriptor {}", descriptor_path.display()))?;
    let descriptor = PackageDescriptor::from_toml_str(&raw)
        .with_context(|| format!("failed parsing descriptor {}", descriptor_path.display()))?;
    let discover_bin = descriptor.executables.is_none();

    let mut spec = Specification::from_descriptor(descriptor, identity.clone());
    if discover_bin {
        spec.executables = list_executables(&package_dir.join("bin"))?;
    }
    let subdir = package_dir
        .strip_prefix(root)
        .ok()
        .map(|relative| {
            relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        });
    Ok(spec.with_subdir(subdir))
}

/// Specifications for declared names of a tree that carries no descriptor.
pub(crate) fn synthesize_specs(
    root: &Path,
    identity: &SourceIdentity,
    declared: &BTreeMap<String, Option<Version>>,
) -> Result<Vec<Specification>> {
    let executables = list_executables(&root.join("bin"))?;
    Ok(declared
        .iter()
        .map(|(name, version)| {
            Specification::new(
                name.clone(),
                version.clone().unwrap_or_else(|| Version::new(0, 0, 0)),
                identity.clone(),
            )
            .with_executables(executables.clone())
        })
        .collect())
}
