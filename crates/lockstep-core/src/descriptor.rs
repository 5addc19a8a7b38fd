use std::collections::BTreeMap;
use std::path::{Component, Path};

use anyhow::{anyhow, Context};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::platform::GENERIC_PLATFORM;

pub const DESCRIPTOR_FILE: &str = "package.toml";

/// The package description a source ships next to (or instead of) its files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: Version,
    #[serde(default = "generic_platform")]
    pub platform: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, VersionReq>,
    #[serde(default)]
    pub executables: Option<Vec<String>>,
    #[serde(default = "default_load_paths")]
    pub load_paths: Vec<String>,
}

impl PackageDescriptor {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let descriptor: Self =
            toml::from_str(input).context("failed to parse package descriptor")?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("package name must not be empty"));
        }
        if self.platform.trim().is_empty() {
            return Err(anyhow!("package '{}' has an empty platform", self.name));
        }
        if self.dependencies.contains_key(&self.name) {
            return Err(anyhow!("package '{}' depends on itself", self.name));
        }
        for load_path in &self.load_paths {
            validate_relative(load_path).with_context(|| {
                format!("invalid load path '{load_path}' for package '{}'", self.name)
            })?;
        }
        for executable in self.executables.iter().flatten() {
            if executable.contains(['/', '\\']) || executable.trim().is_empty() {
                return Err(anyhow!(
                    "invalid executable name '{executable}' for package '{}'",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

fn validate_relative(path: &str) -> anyhow::Result<()> {
    let relative = Path::new(path);
    if relative.as_os_str().is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    if relative.is_absolute() {
        return Err(anyhow!("path must be relative"));
    }
    if relative
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(anyhow!("path must not include '..'"));
    }
    Ok(())
}

fn generic_platform() -> String {
    GENERIC_PLATFORM.to_string()
}

fn default_load_paths() -> Vec<String> {
    vec!["lib".to_string()]
}
