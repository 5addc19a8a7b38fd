use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use lockstep_core::{Dependency, Error, Requirement, SourceIdentity, VcsReference};
use semver::{Version, VersionReq};

use crate::entry::LockEntry;
use crate::model::Lockfile;
use crate::writer::{
    DEPENDENCIES_HEADER, PATH_HEADER, PLATFORMS_HEADER, REGISTRY_HEADER, VCS_HEADER,
    WITHOUT_HEADER,
};

fn corrupt(line: usize, reason: impl Into<String>) -> anyhow::Error {
    Error::CorruptLock {
        line,
        reason: reason.into(),
    }
    .into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Sources,
    Platforms,
    Dependencies,
    Without,
}

#[derive(Default)]
struct SourceBlock {
    header_line: usize,
    kind: &'static str,
    remote: Option<String>,
    reference: Option<VcsReference>,
    submodules: Option<bool>,
    revision: Option<String>,
    in_specs: bool,
    specs: Vec<(usize, PendingEntry)>,
}

struct PendingEntry {
    name: String,
    version: Version,
    platform: String,
    dependencies: Vec<Dependency>,
}

struct PendingRequirement {
    line: usize,
    requirement: Requirement,
    pin: Option<Pin>,
}

#[derive(Clone, Copy)]
enum Pin {
    Entry,
    Block(usize),
}

pub(crate) fn read_lockfile(text: &str) -> Result<Lockfile> {
    let mut lock = Lockfile::default();
    let mut blocks: Vec<SourceBlock> = Vec::new();
    let mut pending_requirements: Vec<PendingRequirement> = Vec::new();
    let mut current: Option<Section> = None;
    let mut seen = BTreeSet::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        if raw_line.trim().is_empty() {
            continue;
        }
        if raw_line.contains('\t') {
            return Err(corrupt(line_no, "tabs are not allowed"));
        }
        let indent = raw_line.len() - raw_line.trim_start_matches(' ').len();
        let content = raw_line.trim();

        if indent == 0 {
            let section = match content {
                REGISTRY_HEADER | VCS_HEADER | PATH_HEADER => Section::Sources,
                PLATFORMS_HEADER => Section::Platforms,
                DEPENDENCIES_HEADER => Section::Dependencies,
                WITHOUT_HEADER => Section::Without,
                other => return Err(corrupt(line_no, format!("unknown section '{other}'"))),
            };
            if current.is_some_and(|previous| previous > section)
                || (section != Section::Sources && !seen.insert(section))
            {
                return Err(corrupt(line_no, format!("section '{content}' is out of order")));
            }
            if section == Section::Sources {
                blocks.push(SourceBlock {
                    header_line: line_no,
                    kind: match content {
                        REGISTRY_HEADER => REGISTRY_HEADER,
                        VCS_HEADER => VCS_HEADER,
                        _ => PATH_HEADER,
                    },
                    ..SourceBlock::default()
                });
            }
            current = Some(section);
            continue;
        }

        match current {
            None => return Err(corrupt(line_no, "content before the first section")),
            Some(Section::Sources) => {
                let block = blocks
                    .last_mut()
                    .ok_or_else(|| corrupt(line_no, "source content without a header"))?;
                read_source_line(block, indent, content, line_no)?;
            }
            Some(Section::Platforms) => {
                expect_indent(indent, 2, line_no)?;
                lock.platforms.insert(content.to_string());
            }
            Some(Section::Dependencies) => {
                expect_indent(indent, 2, line_no)?;
                pending_requirements.push(parse_requirement(content, line_no)?);
            }
            Some(Section::Without) => {
                expect_indent(indent, 2, line_no)?;
                lock.without.insert(content.to_string());
            }
        }
    }

    let mut block_sources = Vec::with_capacity(blocks.len());
    for block in blocks {
        let source = finish_block(&block)?;
        block_sources.push(source.clone());
        if lock.sources.contains_key(&source) {
            return Err(corrupt(block.header_line, format!("duplicate source '{source}'")));
        }
        lock.sources.insert(source.clone(), block.revision.clone());
        for (_, pending) in block.specs {
            lock.entries.push(LockEntry {
                name: pending.name,
                version: pending.version,
                platform: pending.platform,
                source: source.clone(),
                revision: block.revision.clone(),
                dependencies: pending.dependencies,
            });
        }
    }

    for pending in pending_requirements {
        let mut requirement = pending.requirement;
        let source = match pending.pin {
            None => None,
            Some(Pin::Entry) => lock.entry(&requirement.name).map(|entry| entry.source.clone()),
            Some(Pin::Block(position)) => position
                .checked_sub(1)
                .and_then(|index| block_sources.get(index))
                .cloned(),
        };
        if pending.pin.is_some() {
            let source = source.ok_or_else(|| {
                corrupt(
                    pending.line,
                    format!("pinned dependency '{}' has no locked source", requirement.name),
                )
            })?;
            requirement = requirement.with_source(source);
        }
        lock.dependencies.push(requirement);
    }

    lock.normalize();
    Ok(lock)
}

fn expect_indent(indent: usize, expected: usize, line_no: usize) -> Result<()> {
    if indent != expected {
        return Err(corrupt(
            line_no,
            format!("expected indentation of {expected} spaces, found {indent}"),
        ));
    }
    Ok(())
}

fn read_source_line(
    block: &mut SourceBlock,
    indent: usize,
    content: &str,
    line_no: usize,
) -> Result<()> {
    match indent {
        2 => {
            if block.in_specs {
                return Err(corrupt(line_no, "source attributes must precede specs"));
            }
            if content == "specs:" {
                block.in_specs = true;
                return Ok(());
            }
            let (key, value) = content
                .split_once(": ")
                .ok_or_else(|| corrupt(line_no, format!("expected 'key: value', found '{content}'")))?;
            let value = value.trim();
            let vcs_only = block.kind != VCS_HEADER;
            match key {
                "remote" if block.remote.is_none() => block.remote = Some(value.to_string()),
                "ref" if !vcs_only && block.reference.is_none() => {
                    block.reference = Some(
                        VcsReference::parse(value)
                            .map_err(|err| corrupt(line_no, err.to_string()))?,
                    );
                }
                "submodules" if !vcs_only && block.submodules.is_none() => {
                    block.submodules = Some(match value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(corrupt(line_no, format!("invalid submodules flag '{other}'")))
                        }
                    });
                }
                "revision" if !vcs_only && block.revision.is_none() => {
                    if value.is_empty() || !value.chars().all(|ch| ch.is_ascii_hexdigit()) {
                        return Err(corrupt(line_no, format!("invalid revision '{value}'")));
                    }
                    block.revision = Some(value.to_string());
                }
                other => {
                    return Err(corrupt(
                        line_no,
                        format!("unexpected attribute '{other}' in {} section", block.kind),
                    ))
                }
            }
            Ok(())
        }
        4 if block.in_specs => {
            let entry = parse_spec_line(content, line_no)?;
            block.specs.push((line_no, entry));
            Ok(())
        }
        6 if block.in_specs => {
            let (_, entry) = block
                .specs
                .last_mut()
                .ok_or_else(|| corrupt(line_no, "dependency without a spec"))?;
            let (name, requirement) = parse_name_and_requirement(content, line_no)?;
            if !content.ends_with(')') {
                return Err(corrupt(line_no, format!("invalid dependency line '{content}'")));
            }
            entry.dependencies.push(Dependency::new(name, requirement));
            Ok(())
        }
        other => Err(corrupt(line_no, format!("unexpected indentation of {other} spaces"))),
    }
}

fn parse_spec_line(content: &str, line_no: usize) -> Result<PendingEntry> {
    let mut parts = content.splitn(3, ' ');
    let name = parts.next().unwrap_or_default();
    let version_text = parts
        .next()
        .ok_or_else(|| corrupt(line_no, format!("spec '{content}' has no version")))?;
    let version = Version::parse(version_text)
        .map_err(|err| corrupt(line_no, format!("invalid version '{version_text}': {err}")))?;
    let platform = match parts.next() {
        None => lockstep_core::GENERIC_PLATFORM.to_string(),
        Some(rest) => rest
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .filter(|platform| !platform.is_empty() && !platform.contains(' '))
            .ok_or_else(|| corrupt(line_no, format!("invalid platform in '{content}'")))?
            .to_string(),
    };
    Ok(PendingEntry {
        name: name.to_string(),
        version,
        platform,
        dependencies: Vec::new(),
    })
}

fn parse_name_and_requirement(content: &str, line_no: usize) -> Result<(String, VersionReq)> {
    let (name, rest) = content
        .split_once(" (")
        .ok_or_else(|| corrupt(line_no, format!("expected 'name (requirement)', found '{content}'")))?;
    if name.is_empty() || name.contains(' ') {
        return Err(corrupt(line_no, format!("invalid package name '{name}'")));
    }
    let (requirement_text, _) = rest
        .split_once(')')
        .ok_or_else(|| corrupt(line_no, format!("unterminated requirement in '{content}'")))?;
    let requirement = VersionReq::parse(requirement_text).map_err(|err| {
        corrupt(line_no, format!("invalid requirement '{requirement_text}': {err}"))
    })?;
    Ok((name.to_string(), requirement))
}

fn parse_requirement(content: &str, line_no: usize) -> Result<PendingRequirement> {
    let (name, requirement) = parse_name_and_requirement(content, line_no)?;
    let mut rest = content
        .split_once(')')
        .map(|(_, rest)| rest)
        .unwrap_or_default();

    let mut pin = None;
    if let Some(after) = rest.strip_prefix('!') {
        let digits = after.len() - after.trim_start_matches(|ch: char| ch.is_ascii_digit()).len();
        pin = Some(if digits == 0 {
            Pin::Entry
        } else {
            let position = after[..digits]
                .parse::<usize>()
                .map_err(|err| corrupt(line_no, format!("invalid source position: {err}")))?;
            Pin::Block(position)
        });
        rest = &after[digits..];
    }

    let mut result = Requirement::new(name, requirement);
    if let Some(groups) = rest.strip_prefix(" [") {
        let (groups, remaining) = groups
            .split_once(']')
            .ok_or_else(|| corrupt(line_no, "unterminated group list"))?;
        result = result.with_groups(split_list(groups));
        rest = remaining;
    }
    if let Some(platforms) = rest.strip_prefix(" {") {
        let (platforms, remaining) = platforms
            .split_once('}')
            .ok_or_else(|| corrupt(line_no, "unterminated platform list"))?;
        result = result.with_platforms(split_list(platforms));
        rest = remaining;
    }
    if !rest.is_empty() {
        return Err(corrupt(line_no, format!("unexpected trailing text '{rest}'")));
    }

    Ok(PendingRequirement {
        line: line_no,
        requirement: result,
        pin,
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn finish_block(block: &SourceBlock) -> Result<SourceIdentity> {
    let remote = block
        .remote
        .clone()
        .ok_or_else(|| corrupt(block.header_line, format!("{} section has no remote", block.kind)))?;
    if !block.in_specs {
        return Err(corrupt(
            block.header_line,
            format!("{} section has no specs list", block.kind),
        ));
    }
    Ok(match block.kind {
        REGISTRY_HEADER => SourceIdentity::registry(remote),
        PATH_HEADER => SourceIdentity::path(PathBuf::from(remote)),
        _ => {
            let reference = block
                .reference
                .clone()
                .ok_or_else(|| corrupt(block.header_line, "VCS section has no ref"))?;
            let submodules = block.submodules.ok_or_else(|| {
                corrupt(block.header_line, "VCS section has no submodules flag")
            })?;
            SourceIdentity::vcs(remote, reference).with_submodules(submodules)
        }
    })
}
