use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use lockstep_core::{Error, VcsReference};
use lockstep_security::short_digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fs_ops::{copy_dir_recursive, current_unix_timestamp, replace_with_backup, staging_path};
use crate::git_ops::{
    git_rev_parse, run_git_checkout_snapshot, run_git_clone_mirror, run_git_fetch,
    run_git_set_remote,
};

/// Shared bare mirrors of version-control repositories, one per normalized
/// URI, reused by every project on the machine.
///
/// Clone and fetch hold an exclusive file lock on the entry; checkouts hold a
/// shared one. Locks are never taken while another lock on the same entry is
/// held by the caller.
#[derive(Debug, Clone)]
pub struct VcsCache {
    root: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntryMetadata {
    uri: String,
    #[serde(default)]
    refs: BTreeMap<String, String>,
    #[serde(default)]
    fetched_at_unix: u64,
}

struct EntryLock {
    file: File,
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl VcsCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_key(&self, uri: &str) -> String {
        let normalized = normalize_uri(uri);
        let base = normalized
            .trim_end_matches(".git")
            .trim_end_matches('/')
            .rsplit(['/', '\\', ':'])
            .find(|part| !part.is_empty())
            .unwrap_or("repo")
            .to_string();
        format!("{base}-{}", short_digest(&normalized, 16))
    }

    pub fn mirror_path(&self, uri: &str) -> PathBuf {
        self.root.join(self.entry_key(uri))
    }

    fn metadata_path(&self, uri: &str) -> PathBuf {
        self.root.join(format!("{}.json", self.entry_key(uri)))
    }

    fn lock_path(&self, uri: &str) -> PathBuf {
        self.root.join(format!("{}.lock", self.entry_key(uri)))
    }

    pub fn checkouts_root(&self, uri: &str) -> PathBuf {
        self.root.join("checkouts").join(self.entry_key(uri))
    }

    fn open_lock(&self, uri: &str) -> Result<File> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed creating vcs cache {}", self.root.display()))?;
        let path = self.lock_path(uri);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed opening cache lock {}", path.display()))
    }

    fn lock_exclusive(&self, uri: &str) -> Result<EntryLock> {
        let file = self.open_lock(uri)?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("failed locking cache entry for {uri}"))?;
        Ok(EntryLock { file })
    }

    fn lock_shared(&self, uri: &str) -> Result<EntryLock> {
        let file = self.open_lock(uri)?;
        FileExt::lock_shared(&file)
            .with_context(|| format!("failed locking cache entry for {uri}"))?;
        Ok(EntryLock { file })
    }

    pub fn ensure_cloned(&self, uri: &str) -> Result<PathBuf> {
        let _lock = self.lock_exclusive(uri)?;
        self.ensure_cloned_locked(uri)
    }

    fn ensure_cloned_locked(&self, uri: &str) -> Result<PathBuf> {
        let mirror = self.mirror_path(uri);
        if mirror.exists() {
            self.verify_entry(&mirror)?;
            return Ok(mirror);
        }

        check_local_remote(uri, false)?;
        let staged = staging_path(&mirror, "clone");
        info!(uri, "cloning repository");
        if let Err(err) = run_git_clone_mirror(&remote_argument(uri), &staged) {
            let _ = fs::remove_dir_all(&staged);
            return Err(err);
        }
        replace_with_backup(&staged, &mirror)?;
        self.write_metadata(uri, BTreeMap::new())?;
        Ok(mirror)
    }

    /// Fetches from the remote and resolves `reference` to a commit.
    ///
    /// The fetch runs on a staged copy of the mirror, so a failed fetch leaves
    /// the previous entry untouched.
    pub fn fetch_ref(&self, uri: &str, reference: &VcsReference) -> Result<String> {
        let _lock = self.lock_exclusive(uri)?;
        let mirror = self.mirror_path(uri);
        let freshly_cloned = !mirror.exists();
        self.ensure_cloned_locked(uri)?;

        if !freshly_cloned {
            check_local_remote(uri, true)?;
            let staged = staging_path(&mirror, "fetch");
            info!(uri, %reference, "fetching repository");
            let fetched = copy_dir_recursive(&mirror, &staged)
                .and_then(|_| run_git_set_remote(&staged, &remote_argument(uri)))
                .and_then(|_| run_git_fetch(&staged, uri));
            if let Err(err) = fetched {
                let _ = fs::remove_dir_all(&staged);
                return Err(err);
            }
            replace_with_backup(&staged, &mirror)?;
        }

        let revision = git_rev_parse(&mirror, &reference.rev_expression())?.ok_or_else(|| {
            Error::source_unavailable(uri, format!("{reference} does not exist in the repository"))
        })?;

        let mut metadata = self.read_metadata(uri);
        metadata.refs.insert(reference.to_string(), revision.clone());
        self.write_metadata(uri, metadata.refs)?;
        Ok(revision)
    }

    /// Resolves `reference` using only what is already cached.
    pub fn resolve_local(&self, uri: &str, reference: &VcsReference) -> Result<Option<String>> {
        let _lock = self.lock_shared(uri)?;
        let mirror = self.mirror_path(uri);
        if !mirror.exists() {
            return Ok(None);
        }
        self.verify_entry(&mirror)?;
        git_rev_parse(&mirror, &reference.rev_expression())
    }

    pub fn has_revision(&self, uri: &str, revision: &str) -> Result<bool> {
        Ok(self
            .resolve_local(uri, &VcsReference::Revision(revision.to_string()))?
            .is_some())
    }

    /// Checks `revision` out into `target`, replacing whatever was there.
    pub fn checkout(
        &self,
        uri: &str,
        revision: &str,
        submodules: bool,
        target: &Path,
    ) -> Result<PathBuf> {
        let _lock = self.lock_shared(uri)?;
        let mirror = self.mirror_path(uri);
        self.verify_entry(&mirror)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let staged = staging_path(target, "checkout");
        if let Err(err) = run_git_checkout_snapshot(&mirror, &staged, revision, submodules) {
            let _ = fs::remove_dir_all(&staged);
            return Err(err).with_context(|| format!("failed checking out {revision} of {uri}"));
        }
        replace_with_backup(&staged, target)?;
        debug!(uri, revision, submodules, target = %target.display(), "checked out revision");
        Ok(target.to_path_buf())
    }

    /// A read-only working tree of `revision` kept in the cache, created on
    /// first use.
    pub fn snapshot(&self, uri: &str, revision: &str, submodules: bool) -> Result<PathBuf> {
        let name = if submodules {
            format!("{revision}+submodules")
        } else {
            revision.to_string()
        };
        let target = self.checkouts_root(uri).join(name);
        if target.join(".git").exists() {
            debug!(uri, revision, "reusing cached snapshot");
            return Ok(target);
        }
        self.checkout(uri, revision, submodules, &target)
    }

    fn verify_entry(&self, mirror: &Path) -> Result<()> {
        if !mirror.join("HEAD").is_file() {
            return Err(Error::RepositoryMissing {
                path: mirror.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }

    fn read_metadata(&self, uri: &str) -> EntryMetadata {
        fs::read_to_string(self.metadata_path(uri))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn write_metadata(&self, uri: &str, refs: BTreeMap<String, String>) -> Result<()> {
        let path = self.metadata_path(uri);
        let metadata = EntryMetadata {
            uri: normalize_uri(uri),
            refs,
            fetched_at_unix: current_unix_timestamp(),
        };
        let content = serde_json::to_string_pretty(&metadata)
            .with_context(|| format!("failed serializing cache metadata {}", path.display()))?;
        fs::write(&path, content)
            .with_context(|| format!("failed writing cache metadata {}", path.display()))
    }

    /// The revision `reference` resolved to at the last fetch, if recorded.
    pub fn last_fetched(&self, uri: &str, reference: &VcsReference) -> Option<String> {
        self.read_metadata(uri).refs.remove(&reference.to_string())
    }
}

pub fn normalize_uri(uri: &str) -> String {
    let trimmed = uri.trim().trim_end_matches('/');
    match trimmed.strip_prefix("file://") {
        Some(path) => path.trim_end_matches('/').to_string(),
        None => trimmed.to_string(),
    }
}

fn local_remote_path(uri: &str) -> Option<PathBuf> {
    let normalized = normalize_uri(uri);
    if normalized.contains("://") || (normalized.contains('@') && normalized.contains(':')) {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn remote_argument(uri: &str) -> String {
    match local_remote_path(uri) {
        Some(path) => path.display().to_string(),
        None => uri.trim().to_string(),
    }
}

/// A local remote that lost its git metadata is reported by path instead of
/// surfacing as an empty repository. That covers a working tree without
/// `.git` and a `.../.git` remote that was deleted, either from a working
/// tree that is still there or after it was cached.
fn check_local_remote(uri: &str, cached: bool) -> Result<()> {
    let Some(path) = local_remote_path(uri) else {
        return Ok(());
    };
    if !path.exists() {
        let names_git_dir = path.file_name().is_some_and(|name| name == ".git");
        let tree_remains = path.parent().is_some_and(Path::is_dir);
        if names_git_dir && (tree_remains || cached) {
            return Err(Error::RepositoryMissing { path }.into());
        }
        return Err(Error::source_unavailable(uri, "repository path does not exist").into());
    }
    let is_bare = path.join("HEAD").is_file() && path.join("objects").is_dir();
    if !is_bare && !path.join(".git").exists() {
        return Err(Error::RepositoryMissing { path }.into());
    }
    Ok(())
}
