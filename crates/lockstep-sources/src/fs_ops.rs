use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Copies a directory tree. File permissions follow `fs::copy`, which keeps
/// the executable bit on Unix.
pub fn copy_dir_recursive(source_root: &Path, destination_root: &Path) -> Result<()> {
    if !source_root.is_dir() {
        anyhow::bail!(
            "source location is not a directory: {}",
            source_root.display()
        );
    }

    if destination_root.exists() {
        fs::remove_dir_all(destination_root).with_context(|| {
            format!(
                "failed clearing destination directory {}",
                destination_root.display()
            )
        })?;
    }
    fs::create_dir_all(destination_root).with_context(|| {
        format!(
            "failed creating destination directory {}",
            destination_root.display()
        )
    })?;

    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((source_root.to_path_buf(), destination_root.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("failed reading directory {}", from_dir.display()))?
        {
            let entry = entry?;
            let from_path = entry.path();
            let to_path = to_dir.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                fs::create_dir_all(&to_path)
                    .with_context(|| format!("failed creating directory {}", to_path.display()))?;
                queue.push_back((from_path, to_path));
            } else if file_type.is_file() {
                fs::copy(&from_path, &to_path).with_context(|| {
                    format!(
                        "failed copying file from {} to {}",
                        from_path.display(),
                        to_path.display()
                    )
                })?;
            }
        }
    }

    Ok(())
}

/// A sibling path of `target` that no other staging operation uses.
pub fn staging_path(target: &Path, label: &str) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let stem = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "entry".to_string());
    parent.join(format!(
        ".{stem}-{label}-{}-{}-{}",
        std::process::id(),
        unique_suffix(),
        STAGING_COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

/// Moves `staged` to `destination`, keeping the previous `destination` as a
/// backup until the move succeeded. On failure the previous entry is put back
/// and `staged` is removed.
pub fn replace_with_backup(staged: &Path, destination: &Path) -> Result<()> {
    let backup = staging_path(destination, "backup");
    let had_existing = destination.exists();

    if had_existing {
        if let Err(err) = fs::rename(destination, &backup) {
            let _ = fs::remove_dir_all(staged);
            return Err(err).with_context(|| {
                format!("failed backing up {}", destination.display())
            });
        }
    }

    if let Err(replace_err) = fs::rename(staged, destination) {
        let _ = fs::remove_dir_all(staged);
        if had_existing {
            if let Err(restore_err) = fs::rename(&backup, destination) {
                return Err(anyhow::anyhow!(
                    "failed replacing {}: {}; failed restoring backup {}: {}",
                    destination.display(),
                    replace_err,
                    backup.display(),
                    restore_err
                ));
            }
        }
        return Err(replace_err)
            .with_context(|| format!("failed replacing {}", destination.display()));
    }

    if had_existing {
        let _ = fs::remove_dir_all(&backup);
    }
    Ok(())
}

pub(crate) fn list_executables(bin_dir: &Path) -> Result<Vec<String>> {
    if !bin_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(bin_dir)
        .with_context(|| format!("failed reading bin directory {}", bin_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
