use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result};
use lockstep_core::Error;

pub(crate) fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf")
        .arg("-c")
        .arg("advice.detachedHead=false");
    if cfg!(windows) {
        command.arg("-c").arg("core.longpaths=true");
    }
    command.env("GIT_TERMINAL_PROMPT", "0");
    command
}

fn run(mut command: Command, what: &str) -> Result<Output> {
    command
        .output()
        .with_context(|| format!("failed launching git {what}"))
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Clones `remote` as a bare mirror. Transport failures are reported as an
/// unavailable source so callers can retry them.
pub(crate) fn run_git_clone_mirror(remote: &str, destination: &Path) -> Result<()> {
    let mut command = base_git_command();
    command
        .arg("clone")
        .arg("--mirror")
        .arg("--quiet")
        .arg("--")
        .arg(remote)
        .arg(destination);
    let output = run(command, "clone")?;
    if !output.status.success() {
        return Err(Error::source_unavailable(
            remote,
            format!("git clone failed: {}", stderr_of(&output)),
        )
        .into());
    }
    Ok(())
}

pub(crate) fn run_git_fetch(mirror: &Path, remote: &str) -> Result<()> {
    let mut command = base_git_command();
    command
        .args([
            "fetch",
            "--quiet",
            "--prune",
            "--tags",
            "--force",
            "origin",
            "+refs/heads/*:refs/heads/*",
        ])
        .current_dir(mirror);
    let output = run(command, "fetch")?;
    if !output.status.success() {
        return Err(Error::source_unavailable(
            remote,
            format!("git fetch failed: {}", stderr_of(&output)),
        )
        .into());
    }
    Ok(())
}

pub(crate) fn run_git_set_remote(mirror: &Path, remote: &str) -> Result<()> {
    run_git_command(mirror, &["remote", "set-url", "origin", remote])
}

pub(crate) fn run_git_command(repo_root: &Path, args: &[&str]) -> Result<()> {
    let mut command = base_git_command();
    command.args(args).current_dir(repo_root);
    let output = run(command, &args.join(" "))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed in {}: {}",
            args.join(" "),
            repo_root.display(),
            stderr_of(&output)
        );
    }
    Ok(())
}

/// Resolves `expression` to a full commit id, or `None` when the repository
/// does not know it.
pub(crate) fn git_rev_parse(repo_root: &Path, expression: &str) -> Result<Option<String>> {
    let mut command = base_git_command();
    command
        .arg("rev-parse")
        .arg("--verify")
        .arg("--quiet")
        .arg(format!("{expression}^{{commit}}"))
        .current_dir(repo_root);
    let output = run(command, "rev-parse")?;
    if !output.status.success() {
        return Ok(None);
    }
    let revision = String::from_utf8(output.stdout)
        .context("git rev-parse produced non-UTF-8 output")?
        .trim()
        .to_string();
    if revision.len() < 40 || !revision.chars().all(|ch| ch.is_ascii_hexdigit()) {
        anyhow::bail!("git rev-parse returned an invalid revision: '{revision}'");
    }
    Ok(Some(revision))
}

pub(crate) fn run_git_checkout_snapshot(
    mirror: &Path,
    destination: &Path,
    revision: &str,
    submodules: bool,
) -> Result<()> {
    let mut clone = base_git_command();
    clone
        .arg("clone")
        .arg("--quiet")
        .arg("--shared")
        .arg("--no-checkout")
        .arg("--")
        .arg(mirror)
        .arg(destination);
    let output = run(clone, "clone --shared")?;
    if !output.status.success() {
        anyhow::bail!(
            "git clone of {} into {} failed: {}",
            mirror.display(),
            destination.display(),
            stderr_of(&output)
        );
    }

    run_git_command(destination, &["checkout", "--quiet", "--detach", revision])?;

    if submodules {
        run_git_command(
            destination,
            &[
                "-c",
                "protocol.file.allow=always",
                "submodule",
                "update",
                "--quiet",
                "--init",
                "--recursive",
            ],
        )?;
    }
    Ok(())
}
