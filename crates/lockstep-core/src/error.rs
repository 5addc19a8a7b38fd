use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("package '{name}' is declared with two different sources: {first} and {second}")]
    DuplicateSource {
        name: String,
        first: String,
        second: String,
    },

    #[error("package '{name}' is declared twice with contradictory constraints: {first} and {second}")]
    Contradictory {
        name: String,
        first: String,
        second: String,
    },

    #[error("invalid manifest entry for '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },
}

/// One requirement that took part in a failed resolution, with the chain of
/// specifications that introduced it (`root` first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub requirement: String,
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not resolve '{name}': {reason}{}", render_conflicts(.conflicts))]
pub struct ResolutionFailure {
    pub name: String,
    pub reason: String,
    pub conflicts: Vec<Conflict>,
}

impl ResolutionFailure {
    pub fn involves(&self, name: &str) -> bool {
        self.name == name
            || self.conflicts.iter().any(|conflict| {
                conflict
                    .chain
                    .iter()
                    .any(|link| link.split_whitespace().next() == Some(name))
            })
    }
}

fn render_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "\n  {} required by {}",
                conflict.requirement,
                conflict.chain.join(" -> ")
            )
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Resolution(#[from] ResolutionFailure),

    #[error("source unavailable: {remote}: {reason}")]
    SourceUnavailable { remote: String, reason: String },

    #[error("repository missing: no git metadata at {}", .path.display())]
    RepositoryMissing { path: PathBuf },

    #[error("corrupt lockfile at line {line}: {reason}")]
    CorruptLock { line: usize, reason: String },

    #[error("failed to install {package} from {remote}")]
    Install {
        package: String,
        remote: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("command not found: {command}\nInstall missing package executables with `lockstep install`")]
    CommandNotFound { command: String },

    #[error("not executable: {path}")]
    NotExecutable { path: String },
}

impl Error {
    pub fn source_unavailable(remote: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            remote: remote.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandNotFound { .. } => 127,
            Self::NotExecutable { .. } => 126,
            _ => 1,
        }
    }
}

/// Finds the typed lockstep error anywhere in an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

/// True when any typed error in the chain is transient, including the cause
/// of an install that failed on an unavailable source.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<Error>())
        .any(Error::is_transient)
}
