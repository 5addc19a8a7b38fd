use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceKind {
    Registry,
    Vcs,
    Path,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Vcs => "vcs",
            Self::Path => "path",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "registry" => Some(Self::Registry),
            "vcs" => Some(Self::Vcs),
            "path" => Some(Self::Path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VcsReference {
    DefaultBranch,
    Branch(String),
    Tag(String),
    Revision(String),
}

impl VcsReference {
    /// Branch-like references follow the remote tip when a source is updated.
    pub fn is_floating(&self) -> bool {
        matches!(self, Self::DefaultBranch | Self::Branch(_))
    }

    /// The expression handed to `git rev-parse` inside a mirror clone.
    pub fn rev_expression(&self) -> String {
        match self {
            Self::DefaultBranch => "HEAD".to_string(),
            Self::Branch(branch) => format!("refs/heads/{branch}"),
            Self::Tag(tag) => format!("refs/tags/{tag}"),
            Self::Revision(revision) => revision.clone(),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "default" {
            return Ok(Self::DefaultBranch);
        }
        let (kind, name) = value
            .split_once(' ')
            .ok_or_else(|| anyhow!("invalid vcs reference '{value}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("vcs reference '{value}' has an empty name"));
        }
        match kind {
            "branch" => Ok(Self::Branch(name.to_string())),
            "tag" => Ok(Self::Tag(name.to_string())),
            "revision" => Ok(Self::Revision(name.to_string())),
            _ => Err(anyhow!("unknown vcs reference kind '{kind}'")),
        }
    }
}

impl fmt::Display for VcsReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultBranch => write!(f, "default"),
            Self::Branch(branch) => write!(f, "branch {branch}"),
            Self::Tag(tag) => write!(f, "tag {tag}"),
            Self::Revision(revision) => write!(f, "revision {revision}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceIdentity {
    Registry {
        uri: String,
    },
    Vcs {
        uri: String,
        reference: VcsReference,
        submodules: bool,
    },
    Path {
        path: PathBuf,
    },
}

impl SourceIdentity {
    pub fn registry(uri: impl Into<String>) -> Self {
        Self::Registry { uri: uri.into() }
    }

    pub fn vcs(uri: impl Into<String>, reference: VcsReference) -> Self {
        Self::Vcs {
            uri: uri.into(),
            reference,
            submodules: false,
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn with_submodules(self, enabled: bool) -> Self {
        match self {
            Self::Vcs { uri, reference, .. } => Self::Vcs {
                uri,
                reference,
                submodules: enabled,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Registry { .. } => SourceKind::Registry,
            Self::Vcs { .. } => SourceKind::Vcs,
            Self::Path { .. } => SourceKind::Path,
        }
    }

    pub fn remote(&self) -> String {
        match self {
            Self::Registry { uri } | Self::Vcs { uri, .. } => uri.clone(),
            Self::Path { path } => path.display().to_string(),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Path { path } => Some(path),
            _ => None,
        }
    }

    /// Short human name: the last meaningful component of the location,
    /// without a `.git` suffix (`file:///src/foo/.git` -> `foo`).
    pub fn name(&self) -> String {
        let remote = self.remote();
        remote
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .map(|component| component.trim_end_matches(".git"))
            .find(|component| !component.is_empty() && *component != "file:")
            .unwrap_or(remote.as_str())
            .to_string()
    }

    pub fn is_vcs(&self) -> bool {
        matches!(self, Self::Vcs { .. })
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { uri } => write!(f, "{uri}"),
            Self::Vcs {
                uri, reference, ..
            } => match reference {
                VcsReference::DefaultBranch => write!(f, "{uri}"),
                reference => write!(f, "{uri} ({reference})"),
            },
            Self::Path { path } => write!(f, "{}", path.display()),
        }
    }
}
