use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};
use lockstep_core::Error;
use tracing::debug;

use crate::env::PATH_VAR;
use crate::Activation;

/// Runs `command` under the activation and returns its exit code.
pub fn dispatch(
    activation: &Activation,
    command: &str,
    args: &[String],
    inherited: &BTreeMap<String, String>,
) -> Result<i32> {
    let environment = activation.environment(inherited)?;
    let program = find_command(activation, command, &environment)?;
    debug!(command, program = %program.display(), "dispatching");

    let status = Command::new(&program)
        .args(args)
        .env_clear()
        .envs(&environment)
        .status()
        .with_context(|| format!("failed to launch {}", program.display()))?;
    Ok(exit_code(status))
}

/// Locates the program for `command`: executables declared by an active
/// package come first, then a path given explicitly, then the activated
/// search path.
pub fn find_command(
    activation: &Activation,
    command: &str,
    environment: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let mut not_executable: Option<PathBuf> = None;
    let mut consider = |candidate: PathBuf| -> Option<PathBuf> {
        if !candidate.is_file() {
            return None;
        }
        if is_executable(&candidate) {
            return Some(candidate);
        }
        not_executable.get_or_insert(candidate);
        None
    };

    // A declared executable on disk is the answer, runnable or not.
    for package in activation.packages() {
        if !package.executables.iter().any(|name| name == command) {
            continue;
        }
        let declared = package.bin_dir().join(command);
        if !declared.is_file() {
            continue;
        }
        if !is_executable(&declared) {
            return Err(Error::NotExecutable {
                path: declared.display().to_string(),
            }
            .into());
        }
        return Ok(declared);
    }

    let explicit = Path::new(command);
    if explicit.components().count() > 1 || explicit.is_absolute() {
        if let Some(found) = consider(explicit.to_path_buf()) {
            return Ok(found);
        }
    } else if let Some(search_path) = environment.get(PATH_VAR) {
        for dir in env::split_paths(search_path) {
            if let Some(found) = consider(dir.join(command)) {
                return Ok(found);
            }
        }
    }

    match not_executable {
        Some(path) => Err(Error::NotExecutable {
            path: path.display().to_string(),
        }
        .into()),
        None => Err(Error::CommandNotFound {
            command: command.to_string(),
        }
        .into()),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|metadata| metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.is_file())
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
