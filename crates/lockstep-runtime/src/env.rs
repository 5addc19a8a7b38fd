use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const PATH_VAR: &str = "PATH";
pub const LOAD_PATH_VAR: &str = "LOCKSTEP_LOAD_PATH";
pub const OPTS_VAR: &str = "LOCKSTEP_OPTS";
pub const LOCKFILE_VAR: &str = "LOCKSTEP_LOCKFILE";

/// Puts `additions` in front of the entries already in `existing`, keeping
/// each path once. Merging the result again with the same additions returns
/// it unchanged.
pub fn merge_path_list(existing: Option<&str>, additions: &[PathBuf]) -> Result<String> {
    let mut merged: Vec<PathBuf> = Vec::new();
    let current = existing
        .filter(|value| !value.is_empty())
        .map(|value| env::split_paths(value).collect::<Vec<_>>())
        .unwrap_or_default();

    for path in additions.iter().chain(current.iter()) {
        if path.as_os_str().is_empty() || merged.contains(path) {
            continue;
        }
        merged.push(path.clone());
    }

    let joined: OsString = env::join_paths(&merged)
        .context("activated paths cannot be joined into a search path")?;
    Ok(joined.to_string_lossy().into_owned())
}

/// Adds `--key=value` flags to a whitespace separated flag string. A flag
/// whose key is already present replaces that entry where it stands; any
/// other token is kept as is.
pub fn merge_flags(existing: Option<&str>, flags: &[(String, String)]) -> String {
    let mut tokens = existing
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();

    for (key, value) in flags {
        let flag = format!("--{key}={value}");
        let prefix = format!("--{key}=");
        match tokens.iter().position(|token| token.starts_with(&prefix)) {
            Some(position) => {
                tokens[position] = flag;
                tokens.retain({
                    let mut seen = false;
                    move |token| {
                        if !token.starts_with(&prefix) {
                            return true;
                        }
                        let keep = !seen;
                        seen = true;
                        keep
                    }
                });
            }
            None => tokens.push(flag),
        }
    }

    tokens.join(" ")
}

/// The value of the first `--key=value` flag, if any.
pub fn flag_value<'a>(existing: Option<&'a str>, key: &str) -> Option<&'a str> {
    let prefix = format!("--{key}=");
    existing?
        .split_whitespace()
        .find_map(|token| token.strip_prefix(prefix.as_str()))
}

/// Drops every `--key=...` flag, keeping the other tokens in order.
pub fn remove_flag(existing: &str, key: &str) -> String {
    let prefix = format!("--{key}=");
    existing
        .split_whitespace()
        .filter(|token| !token.starts_with(&prefix))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The entries of a search path for which `keep` holds, or `None` when the
/// variable is unset.
pub(crate) fn retain_paths(
    existing: Option<&str>,
    keep: impl Fn(&Path) -> bool,
) -> Result<Option<String>> {
    let Some(existing) = existing else {
        return Ok(None);
    };
    let kept = env::split_paths(existing)
        .filter(|path| keep(path.as_path()))
        .collect::<Vec<_>>();
    let joined: OsString =
        env::join_paths(&kept).context("search path entries cannot be joined")?;
    Ok(Some(joined.to_string_lossy().into_owned()))
}
