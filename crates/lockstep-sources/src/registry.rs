use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use lockstep_core::{Error, PackageDescriptor, SourceIdentity, Specification};
use lockstep_security::require_valid_signature;
use tracing::debug;

use crate::fs_ops::{copy_dir_recursive, list_executables};
use crate::{Materialized, Source};

/// A signed package index on the local filesystem:
///
/// ```text
/// registry.pub
/// index/<name>/<version>[-<platform>].toml
/// index/<name>/<version>[-<platform>].toml.sig
/// packages/<name>-<version>[-<platform>]/
/// ```
pub struct RegistrySource {
    identity: SourceIdentity,
    root: Option<PathBuf>,
    loaded: Mutex<HashMap<String, Vec<Specification>>>,
}

impl RegistrySource {
    pub fn new(uri: &str) -> Self {
        Self {
            identity: SourceIdentity::registry(uri),
            root: registry_root(uri),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    fn root(&self) -> Result<&Path> {
        let root = self.root.as_deref().ok_or_else(|| {
            Error::source_unavailable(self.identity.remote(), "unsupported registry location")
        })?;
        if !root.is_dir() {
            return Err(Error::source_unavailable(
                self.identity.remote(),
                format!("registry root does not exist: {}", root.display()),
            )
            .into());
        }
        Ok(root)
    }

    pub fn payload_dir(&self, spec: &Specification) -> Result<PathBuf> {
        Ok(self.root()?.join("packages").join(unit_name(spec)))
    }

    fn load(&self, name: &str) -> Result<Vec<Specification>> {
        let root = self.root()?;
        let package_dir = root.join("index").join(name);
        if !package_dir.is_dir() {
            return Ok(Vec::new());
        }

        let key_path = root.join("registry.pub");
        let public_key = fs::read_to_string(&key_path).map_err(|err| {
            Error::source_unavailable(
                self.identity.remote(),
                format!("failed to read registry key {}: {err}", key_path.display()),
            )
        })?;

        let mut specs = Vec::new();
        for entry in fs::read_dir(&package_dir)
            .with_context(|| format!("failed to read package index: {}", package_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some("toml")
            {
                continue;
            }

            let bytes = fs::read(&path)
                .with_context(|| format!("failed reading index entry: {}", path.display()))?;
            let signature_path = path.with_extension("toml.sig");
            let signature = fs::read_to_string(&signature_path).with_context(|| {
                format!("failed reading signature: {}", signature_path.display())
            })?;
            require_valid_signature(
                &path.display().to_string(),
                &bytes,
                public_key.trim(),
                signature.trim(),
            )?;

            let content = String::from_utf8(bytes)
                .with_context(|| format!("index entry is not valid UTF-8: {}", path.display()))?;
            let descriptor = PackageDescriptor::from_toml_str(&content)
                .with_context(|| format!("failed parsing index entry: {}", path.display()))?;
            if descriptor.name != name {
                return Err(anyhow!(
                    "index entry {} describes '{}' instead of '{name}'",
                    path.display(),
                    descriptor.name
                ));
            }

            let discover_bin = descriptor.executables.is_none();
            let mut spec = Specification::from_descriptor(descriptor, self.identity.clone());
            if discover_bin {
                spec.executables =
                    list_executables(&root.join("packages").join(unit_name(&spec)).join("bin"))?;
            }
            specs.push(spec);
        }

        specs.sort_by(|left, right| {
            right
                .version
                .cmp(&left.version)
                .then_with(|| left.platform.cmp(&right.platform))
        });
        debug!(registry = %self.identity, package = name, count = specs.len(), "loaded registry index");
        Ok(specs)
    }
}

impl Source for RegistrySource {
    fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    fn candidates(&self, name: &str) -> Result<Vec<Specification>> {
        if let Some(specs) = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("registry cache lock poisoned"))?
            .get(name)
        {
            return Ok(specs.clone());
        }

        let specs = self.load(name)?;
        self.loaded
            .lock()
            .map_err(|_| anyhow!("registry cache lock poisoned"))?
            .insert(name.to_string(), specs.clone());
        Ok(specs)
    }

    fn materialize(&self, spec: &Specification, target: &Path) -> Result<Materialized> {
        let payload = self.payload_dir(spec)?;
        if !payload.is_dir() {
            return Err(anyhow!(
                "registry has no payload for {} at {}",
                spec.full_name(),
                payload.display()
            ));
        }
        copy_dir_recursive(&payload, target)?;
        Ok(Materialized::Written)
    }
}

fn unit_name(spec: &Specification) -> String {
    if spec.is_generic() {
        format!("{}-{}", spec.name, spec.version)
    } else {
        format!("{}-{}-{}", spec.name, spec.version, spec.platform)
    }
}

fn registry_root(uri: &str) -> Option<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if uri.contains("://") {
        return None;
    }
    Some(PathBuf::from(uri))
}
