use anyhow::{Context, Result};
use lockstep_core::{SourceIdentity, Specification};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_INSTALL_DIR: &str = ".lockstep";

/// Where a project's packages live. Each project has its own root so two
/// projects never share installed files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(DEFAULT_INSTALL_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pkgs_dir(&self) -> PathBuf {
        self.root.join("pkgs")
    }

    pub fn vcs_dir(&self) -> PathBuf {
        self.root.join("vcs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn installed_state_dir(&self) -> PathBuf {
        self.state_dir().join("installed")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.tmp_state_dir().join(txid)
    }

    pub fn package_dir(&self, name: &str, version: &str) -> PathBuf {
        self.pkgs_dir().join(name).join(version)
    }

    pub fn receipt_path(&self, name: &str) -> PathBuf {
        self.installed_state_dir().join(format!("{name}.receipt"))
    }

    /// The directory a specification is materialized into, or `None` for
    /// packages used in place.
    pub fn unit_dir(&self, spec: &Specification) -> Option<PathBuf> {
        match &spec.source {
            SourceIdentity::Registry { .. } => {
                let version = if spec.is_generic() {
                    spec.version.to_string()
                } else {
                    format!("{}-{}", spec.version, spec.platform)
                };
                Some(self.package_dir(&spec.name, &version))
            }
            SourceIdentity::Vcs { submodules, .. } => {
                let revision = spec.revision.as_deref().unwrap_or("unresolved");
                let short = revision.chars().take(12).collect::<String>();
                let suffix = if *submodules { "+submodules" } else { "" };
                Some(
                    self.vcs_dir()
                        .join(format!("{}-{short}{suffix}", spec.source.name())),
                )
            }
            SourceIdentity::Path { .. } => None,
        }
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.pkgs_dir(),
            self.vcs_dir(),
            self.state_dir(),
            self.installed_state_dir(),
            self.tmp_state_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_user_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("LOCKSTEP_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user home")?;
        return Ok(PathBuf::from(app_data).join("Lockstep"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user home")?;
    Ok(PathBuf::from(home).join(".lockstep"))
}

/// Root of the version-control cache shared by every project of the user.
pub fn vcs_cache_dir(home: &Path) -> PathBuf {
    home.join("cache").join("vcs")
}
