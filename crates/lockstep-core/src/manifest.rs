use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use semver::VersionReq;
use serde::Deserialize;

use crate::error::{Error, ManifestError};
use crate::requirement::Requirement;
use crate::source::{SourceIdentity, SourceKind, VcsReference};

pub const MANIFEST_FILE: &str = "Lockstep.toml";

/// The validated list of root requirements plus every source they can be
/// satisfied from. Registries come first, in declaration order, followed by
/// the sources pinned by individual requirements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    requirements: Vec<Requirement>,
    sources: Vec<SourceIdentity>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default, rename = "package")]
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    platforms: Vec<String>,
    #[serde(default)]
    registry: Option<String>,
    #[serde(default)]
    git: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    rev: Option<String>,
    #[serde(default)]
    submodules: bool,
    #[serde(default)]
    path: Option<PathBuf>,
}

impl Manifest {
    pub fn new(
        requirements: Vec<Requirement>,
        registries: Vec<SourceIdentity>,
    ) -> Result<Self, ManifestError> {
        let mut merged: Vec<Requirement> = Vec::new();
        for requirement in requirements {
            let Some(existing) = merged
                .iter_mut()
                .find(|existing| existing.name == requirement.name)
            else {
                merged.push(requirement);
                continue;
            };

            if existing.source != requirement.source {
                return Err(ManifestError::DuplicateSource {
                    name: requirement.name.clone(),
                    first: describe_pin(existing.source.as_ref()),
                    second: describe_pin(requirement.source.as_ref()),
                });
            }
            if existing.requirement != requirement.requirement {
                return Err(ManifestError::Contradictory {
                    name: requirement.name.clone(),
                    first: existing.requirement.to_string(),
                    second: requirement.requirement.to_string(),
                });
            }

            existing.groups.extend(requirement.groups);
            // An empty platform set already means "every platform".
            if existing.platforms.is_empty() || requirement.platforms.is_empty() {
                existing.platforms.clear();
            } else {
                existing.platforms.extend(requirement.platforms);
            }
        }

        let mut sources: Vec<SourceIdentity> = Vec::new();
        for registry in registries {
            if registry.kind() != SourceKind::Registry {
                return Err(ManifestError::InvalidEntry {
                    name: registry.to_string(),
                    reason: "only registries can be declared as top-level sources".to_string(),
                });
            }
            if !sources.contains(&registry) {
                sources.push(registry);
            }
        }
        for pinned in merged.iter().filter_map(|req| req.source.as_ref()) {
            if !sources.contains(pinned) {
                sources.push(pinned.clone());
            }
        }

        Ok(Self {
            requirements: merged,
            sources,
        })
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        Self::from_toml_str_in(input, None)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = fs::canonicalize(&base).unwrap_or(base);
        Self::from_toml_str_in(&raw, Some(&base))
            .with_context(|| format!("failed to load manifest: {}", path.display()))
    }

    fn from_toml_str_in(input: &str, base: Option<&Path>) -> Result<Self> {
        let raw: RawManifest = toml::from_str(input).context("failed to parse manifest")?;

        let registries = raw
            .sources
            .iter()
            .map(|uri| SourceIdentity::registry(absolutize_uri(uri, base)))
            .collect::<Vec<_>>();

        let mut requirements = Vec::with_capacity(raw.packages.len());
        for package in raw.packages {
            requirements.push(package.into_requirement(base).map_err(Error::from)?);
        }

        Ok(Self::new(requirements, registries).map_err(Error::from)?)
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn requirement(&self, name: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|req| req.name == name)
    }

    pub fn sources(&self) -> &[SourceIdentity] {
        &self.sources
    }

    pub fn registries(&self) -> impl Iterator<Item = &SourceIdentity> {
        self.sources
            .iter()
            .filter(|source| source.kind() == SourceKind::Registry)
    }

    pub fn groups(&self) -> std::collections::BTreeSet<String> {
        self.requirements
            .iter()
            .flat_map(|req| req.groups.iter().cloned())
            .collect()
    }
}

impl RawPackage {
    fn into_requirement(self, base: Option<&Path>) -> Result<Requirement, ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidEntry {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("package name must not be empty"));
        }

        let requirement = match self.version.as_deref().map(str::trim) {
            None | Some("") | Some("*") => VersionReq::STAR,
            Some(raw) => VersionReq::parse(raw)
                .map_err(|err| invalid(&format!("invalid version constraint '{raw}': {err}")))?,
        };

        let pins = [
            self.registry.is_some(),
            self.git.is_some(),
            self.path.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if pins > 1 {
            return Err(invalid("only one of registry, git, or path may be given"));
        }

        let refs = [&self.branch, &self.tag, &self.rev]
            .into_iter()
            .filter(|value| value.is_some())
            .count();
        if refs > 1 {
            return Err(invalid("only one of branch, tag, or rev may be given"));
        }
        if self.git.is_none() && (refs > 0 || self.submodules) {
            return Err(invalid("branch, tag, rev and submodules require git"));
        }

        let source = if let Some(uri) = &self.registry {
            Some(SourceIdentity::registry(absolutize_uri(uri, base)))
        } else if let Some(uri) = &self.git {
            let reference = match (&self.branch, &self.tag, &self.rev) {
                (Some(branch), _, _) => VcsReference::Branch(branch.clone()),
                (_, Some(tag), _) => VcsReference::Tag(tag.clone()),
                (_, _, Some(rev)) => VcsReference::Revision(rev.clone()),
                _ => VcsReference::DefaultBranch,
            };
            Some(
                SourceIdentity::vcs(absolutize_uri(uri, base), reference)
                    .with_submodules(self.submodules),
            )
        } else {
            self.path.as_ref().map(|path| {
                let path = match base {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                SourceIdentity::path(normalize_path(&path))
            })
        };

        let mut result = Requirement::new(self.name.clone(), requirement)
            .with_groups(self.groups.clone())
            .with_platforms(self.platforms.clone());
        if let Some(source) = source {
            result = result.with_source(source);
        }
        Ok(result)
    }
}

fn describe_pin(source: Option<&SourceIdentity>) -> String {
    source
        .map(ToString::to_string)
        .unwrap_or_else(|| "the default sources".to_string())
}

/// Plain relative filesystem locations are made absolute against the
/// manifest directory; anything with a scheme is left alone.
fn absolutize_uri(uri: &str, base: Option<&Path>) -> String {
    let uri = uri.trim();
    if uri.contains("://") || uri.contains('@') {
        return uri.to_string();
    }
    match base {
        Some(base) if Path::new(uri).is_relative() => {
            normalize_path(&base.join(uri)).display().to_string()
        }
        _ => uri.to_string(),
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
