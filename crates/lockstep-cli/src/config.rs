use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lockstep_installer::DEFAULT_INSTALL_DIR;
use lockstep_sources::SourcePriority;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";

/// Settings remembered per project in `.lockstep/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub without: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    /// Comma separated source kinds, earliest wins ties between equal versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_priority: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            install_root: None,
            without: BTreeSet::new(),
            platform: None,
            fetch_retries: default_fetch_retries(),
            source_priority: None,
        }
    }
}

fn default_fetch_retries() -> u32 {
    2
}

impl ProjectConfig {
    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(DEFAULT_INSTALL_DIR).join(CONFIG_FILE)
    }

    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed reading project config: {}", path.display()))?;
        let config = toml::from_str::<Self>(&content)
            .with_context(|| format!("failed parsing project config: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid project config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<PathBuf> {
        self.validate()?;
        let path = Self::path(project_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating project config dir: {}", parent.display())
            })?;
        }
        let content = toml::to_string(self)
            .with_context(|| format!("failed serializing project config: {}", path.display()))?;
        fs::write(&path, content)
            .with_context(|| format!("failed writing project config: {}", path.display()))?;
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.without.iter().any(|group| group.trim().is_empty()) {
            return Err(anyhow!("group names in 'without' must not be empty"));
        }
        if self
            .platform
            .as_deref()
            .is_some_and(|platform| platform.trim().is_empty())
        {
            return Err(anyhow!("platform must not be empty"));
        }
        self.priority()?;
        Ok(())
    }

    /// The install root, relative paths taken from the project directory.
    pub fn install_root(&self, project_dir: &Path) -> PathBuf {
        match &self.install_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_dir.join(root),
            None => project_dir.join(DEFAULT_INSTALL_DIR),
        }
    }

    pub fn priority(&self) -> Result<SourcePriority> {
        match &self.source_priority {
            Some(value) => SourcePriority::parse(value),
            None => Ok(SourcePriority::default()),
        }
    }

    pub fn platform(&self) -> String {
        self.platform
            .clone()
            .unwrap_or_else(lockstep_core::current_platform)
    }
}
