use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::{InstallLayout, InstallReceipt};

pub fn write_install_receipt(layout: &InstallLayout, receipt: &InstallReceipt) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("name={}\n", receipt.name));
    payload.push_str(&format!("version={}\n", receipt.version));
    payload.push_str(&format!("platform={}\n", receipt.platform));
    payload.push_str(&format!("source={}\n", receipt.source));
    if let Some(revision) = &receipt.revision {
        payload.push_str(&format!("revision={}\n", revision));
    }
    payload.push_str(&format!("root={}\n", receipt.root));
    for load_path in &receipt.load_paths {
        payload.push_str(&format!("load_path={}\n", load_path));
    }
    for executable in &receipt.executables {
        payload.push_str(&format!("executable={}\n", executable));
    }
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        receipt.installed_at_unix
    ));

    let path = layout.receipt_path(&receipt.name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
    Ok(path)
}

pub fn read_install_receipts(layout: &InstallLayout) -> Result<Vec<InstallReceipt>> {
    let dir = layout.installed_state_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut receipts = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read install state directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
            continue;
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
        let receipt = parse_receipt(&raw)
            .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
        receipts.push(receipt);
    }

    receipts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(receipts)
}

/// Removes receipts of packages outside `keep`, returning their names.
pub fn prune_receipts(layout: &InstallLayout, keep: &BTreeSet<String>) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for receipt in read_install_receipts(layout)? {
        if keep.contains(&receipt.name) {
            continue;
        }
        let path = layout.receipt_path(&receipt.name);
        match fs::remove_file(&path) {
            Ok(()) => removed.push(receipt.name),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to remove install receipt: {}", path.display())
                });
            }
        }
    }
    Ok(removed)
}

pub(crate) fn parse_receipt(raw: &str) -> Result<InstallReceipt> {
    let mut name = None;
    let mut version = None;
    let mut platform = None;
    let mut source = None;
    let mut revision = None;
    let mut root = None;
    let mut load_paths = Vec::new();
    let mut executables = Vec::new();
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "name" => name = Some(v.to_string()),
            "version" => version = Some(v.to_string()),
            "platform" => platform = Some(v.to_string()),
            "source" => source = Some(v.to_string()),
            "revision" => revision = Some(v.to_string()),
            "root" => root = Some(v.to_string()),
            "load_path" => load_paths.push(v.to_string()),
            "executable" => executables.push(v.to_string()),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallReceipt {
        name: name.context("missing name")?,
        version: version.context("missing version")?,
        platform: platform.unwrap_or_else(|| lockstep_core::GENERIC_PLATFORM.to_string()),
        source: source.context("missing source")?,
        revision,
        root: root.context("missing root")?,
        load_paths,
        executables,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}
