use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lockstep_core::{
    classify, Dependency, DependencyGraph, Error, GroupSelection, Manifest, Requirement,
    SourceIdentity, Specification, VcsReference,
};
use lockstep_lockfile::Lockfile;
use lockstep_sources::{Materialized, Source, SourcePriority, SourceSet};
use semver::{Version, VersionReq};

use super::*;

const PLATFORM: &str = "x86_64-linux";

struct MemorySource {
    identity: SourceIdentity,
    specs: Vec<Specification>,
    offline: bool,
}

impl MemorySource {
    fn new(identity: SourceIdentity, specs: Vec<Specification>) -> Self {
        Self {
            identity,
            specs,
            offline: false,
        }
    }
}

impl Source for MemorySource {
    fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    fn candidates(&self, name: &str) -> Result<Vec<Specification>> {
        if self.offline {
            return Err(
                Error::source_unavailable(self.identity.remote(), "connection refused").into(),
            );
        }
        let mut specs = self
            .specs
            .iter()
            .filter(|spec| spec.name == name)
            .cloned()
            .collect::<Vec<_>>();
        specs.sort_by(|left, right| right.version.cmp(&left.version));
        Ok(specs)
    }

    fn materialize(&self, spec: &Specification, _target: &Path) -> Result<Materialized> {
        Err(anyhow!("{} cannot be materialized in memory", spec.full_name()))
    }
}

fn req(value: &str) -> VersionReq {
    VersionReq::parse(value).expect("requirement must parse")
}

fn registry() -> SourceIdentity {
    SourceIdentity::registry("file:///srv/registry")
}

fn spec(name: &str, version: &str, deps: &[(&str, &str)]) -> Specification {
    spec_from(registry(), name, version, deps)
}

fn spec_from(
    source: SourceIdentity,
    name: &str,
    version: &str,
    deps: &[(&str, &str)],
) -> Specification {
    deps.iter().fold(
        Specification::new(
            name,
            Version::parse(version).expect("version must parse"),
            source,
        ),
        |spec, (dep, requirement)| spec.with_dependency(Dependency::new(*dep, req(requirement))),
    )
}

fn source_set(sources: Vec<MemorySource>) -> SourceSet {
    let mut set = SourceSet::new(SourcePriority::default());
    for source in sources {
        set.insert(Arc::new(source));
    }
    set
}

fn registry_set(specs: Vec<Specification>) -> SourceSet {
    source_set(vec![MemorySource::new(registry(), specs)])
}

fn manifest(requirements: Vec<Requirement>) -> Manifest {
    Manifest::new(requirements, vec![registry()]).expect("manifest must be valid")
}

fn options() -> ResolveOptions {
    ResolveOptions::new(PLATFORM).expect("platform must be valid")
}

fn lock_of(manifest: &Manifest, specs: Vec<Specification>) -> Lockfile {
    let mut graph = DependencyGraph::new(manifest.requirements().to_vec());
    for spec in specs {
        graph.insert(spec);
    }
    Lockfile::from_graph(&graph, manifest.sources(), PLATFORM, &BTreeSet::new())
}

fn version_of(graph: &DependencyGraph, name: &str) -> String {
    graph
        .get(name)
        .map(|spec| spec.version.to_string())
        .unwrap_or_else(|| panic!("{name} must be resolved"))
}

fn rack_registry() -> Vec<Specification> {
    vec![
        spec("rack", "0.9.1", &[("mime", ">=0.1")]),
        spec("rack", "1.0.0", &[("mime", ">=0.2")]),
        spec("mime", "0.1.0", &[]),
        spec("mime", "0.2.0", &[]),
        spec("thin", "1.0.0", &[]),
        spec("thin", "1.1.0", &[]),
    ]
}

#[test]
fn fresh_resolution_picks_newest_versions() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::any("rack")]);

    let graph = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect("must resolve");

    assert_eq!(version_of(&graph, "rack"), "1.0.0");
    assert_eq!(version_of(&graph, "mime"), "0.2.0");
    assert!(graph.unsatisfied().is_empty());
}

#[test]
fn exact_constraint_selects_older_version() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::new("rack", req("=0.9.1"))]);

    let graph = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect("must resolve");

    assert_eq!(version_of(&graph, "rack"), "0.9.1");
}

#[test]
fn plain_resolution_keeps_locked_versions() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::any("rack")]);
    let lock = lock_of(
        &manifest,
        vec![
            spec("rack", "0.9.1", &[("mime", ">=0.1")]),
            spec("mime", "0.1.0", &[]),
        ],
    );

    let graph = Resolver::new(&sources, options())
        .resolve(&manifest, Some(&lock))
        .expect("must resolve");

    assert_eq!(version_of(&graph, "rack"), "0.9.1");
    assert_eq!(version_of(&graph, "mime"), "0.1.0");
}

#[test]
fn scoped_update_moves_only_the_named_package_and_what_it_forces() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::any("rack"), Requirement::any("thin")]);
    let lock = lock_of(
        &manifest,
        vec![
            spec("rack", "0.9.1", &[("mime", ">=0.1")]),
            spec("mime", "0.1.0", &[]),
            spec("thin", "1.0.0", &[]),
        ],
    );

    let graph = Resolver::new(
        &sources,
        options().with_update(Some(UpdateScope::names(["rack"]))),
    )
    .resolve(&manifest, Some(&lock))
    .expect("must resolve");

    assert_eq!(version_of(&graph, "rack"), "1.0.0");
    assert_eq!(version_of(&graph, "mime"), "0.2.0");
    assert_eq!(version_of(&graph, "thin"), "1.0.0");
}

#[test]
fn scoped_update_keeps_dependencies_that_still_fit() {
    let sources = registry_set(vec![
        spec("rack", "0.9.1", &[("mime", ">=0.1")]),
        spec("rack", "1.0.0", &[("mime", ">=0.1")]),
        spec("mime", "0.1.0", &[]),
        spec("mime", "0.2.0", &[]),
    ]);
    let manifest = manifest(vec![Requirement::any("rack")]);
    let lock = lock_of(
        &manifest,
        vec![
            spec("rack", "0.9.1", &[("mime", ">=0.1")]),
            spec("mime", "0.1.0", &[]),
        ],
    );

    let graph = Resolver::new(
        &sources,
        options().with_update(Some(UpdateScope::names(["rack"]))),
    )
    .resolve(&manifest, Some(&lock))
    .expect("must resolve");

    assert_eq!(version_of(&graph, "rack"), "1.0.0");
    assert_eq!(version_of(&graph, "mime"), "0.1.0");
}

#[test]
fn update_all_floats_every_name() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::any("rack"), Requirement::any("thin")]);
    let lock = lock_of(
        &manifest,
        vec![
            spec("rack", "0.9.1", &[("mime", ">=0.1")]),
            spec("mime", "0.1.0", &[]),
            spec("thin", "1.0.0", &[]),
        ],
    );

    let graph = Resolver::new(&sources, options().with_update(Some(UpdateScope::All)))
        .resolve(&manifest, Some(&lock))
        .expect("must resolve");

    assert_eq!(version_of(&graph, "rack"), "1.0.0");
    assert_eq!(version_of(&graph, "thin"), "1.1.0");
}

#[test]
fn update_of_unknown_package_is_rejected() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::any("rack")]);
    let lock = lock_of(
        &manifest,
        vec![spec("rack", "1.0.0", &[("mime", ">=0.2")]), spec("mime", "0.2.0", &[])],
    );

    let err = Resolver::new(
        &sources,
        options().with_update(Some(UpdateScope::names(["sinatra"]))),
    )
    .resolve(&manifest, Some(&lock))
    .expect_err("unknown name must fail");

    assert!(err.to_string().contains("'sinatra' is not part of the lock"));
}

#[test]
fn changed_branch_re_resolves_only_that_source() {
    let master = SourceIdentity::vcs("/src/foo", VcsReference::DefaultBranch);
    let omg = SourceIdentity::vcs("/src/foo", VcsReference::Branch("omg".into()));
    let old_manifest = Manifest::new(
        vec![
            Requirement::any("foo").with_source(master.clone()),
            Requirement::any("rack"),
        ],
        vec![registry()],
    )
    .expect("manifest must be valid");
    let lock = lock_of(
        &old_manifest,
        vec![
            spec_from(master, "foo", "1.0.0", &[]).with_revision("a".repeat(40)),
            spec("rack", "0.9.1", &[("mime", ">=0.1")]),
            spec("mime", "0.1.0", &[]),
        ],
    );

    let new_manifest = Manifest::new(
        vec![
            Requirement::any("foo").with_source(omg.clone()),
            Requirement::any("rack"),
        ],
        vec![registry()],
    )
    .expect("manifest must be valid");
    let sources = source_set(vec![
        MemorySource::new(registry(), rack_registry()),
        MemorySource::new(
            omg.clone(),
            vec![spec_from(omg.clone(), "foo", "2.0.0", &[]).with_revision("b".repeat(40))],
        ),
    ]);

    let drift = detect_drift(&new_manifest, &lock, &sources).expect("drift must compute");
    assert_eq!(drift.names(), BTreeSet::from(["foo".to_string()]));
    assert_eq!(drift.changed_sources(), BTreeSet::from([omg.clone()]));

    let graph = Resolver::new(&sources, options())
        .resolve(&new_manifest, Some(&lock))
        .expect("must resolve");

    let foo = graph.get("foo").expect("foo must be resolved");
    assert_eq!(foo.version.to_string(), "2.0.0");
    assert_eq!(foo.source, omg);
    assert_eq!(version_of(&graph, "rack"), "0.9.1");
    assert_eq!(version_of(&graph, "mime"), "0.1.0");
}

#[test]
fn drift_reports_new_and_unsatisfied_requirements() {
    let sources = registry_set(rack_registry());
    let old = manifest(vec![Requirement::any("rack")]);
    let lock = lock_of(
        &old,
        vec![
            spec("rack", "1.0.0", &[("mime", ">=0.2")]),
            spec("mime", "0.2.0", &[]),
        ],
    );
    let new = manifest(vec![
        Requirement::new("rack", req("=0.9.1")),
        Requirement::any("thin"),
    ]);

    let drift = detect_drift(&new, &lock, &sources).expect("drift must compute");

    assert_eq!(
        drift.changes.get("rack"),
        Some(&DriftReason::ConstraintUnsatisfied)
    );
    assert_eq!(drift.changes.get("thin"), Some(&DriftReason::NewRequirement));
    assert!(!drift.changes.contains_key("mime"));

    let graph = Resolver::new(&sources, options())
        .resolve(&new, Some(&lock))
        .expect("must resolve");
    assert_eq!(version_of(&graph, "rack"), "0.9.1");
    assert_eq!(version_of(&graph, "thin"), "1.1.0");
}

#[test]
fn conflicts_name_the_requirement_chain() {
    let sources = registry_set(vec![
        spec("rails", "3.0.0", &[("activesupport", "=3.0.0")]),
        spec("activesupport", "2.3.5", &[]),
        spec("activesupport", "3.0.0", &[]),
    ]);
    let manifest = manifest(vec![
        Requirement::any("rails"),
        Requirement::new("activesupport", req("=2.3.5")),
    ]);

    let err = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect_err("conflict must fail");

    let Some(Error::Resolution(failure)) = classify(&err) else {
        panic!("expected a resolution failure, got {err:#}");
    };
    let rendered = failure.to_string();
    assert!(rendered.contains("activesupport (=3.0.0) required by root -> rails 3.0.0"));
    assert!(rendered.contains("activesupport (=2.3.5) required by root"));
    assert!(failure.involves("rails"));
}

#[test]
fn missing_package_reports_not_found() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![Requirement::any("sinatra")]);

    let err = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect_err("missing package must fail");

    let Some(Error::Resolution(failure)) = classify(&err) else {
        panic!("expected a resolution failure, got {err:#}");
    };
    assert_eq!(failure.name, "sinatra");
    assert_eq!(failure.reason, "not found in any source");
}

#[test]
fn backjumps_past_choices_unrelated_to_the_conflict() {
    let sources = registry_set(vec![
        spec("app", "1.0.0", &[("lib", ">=1.0")]),
        spec("app", "2.0.0", &[("lib", ">=2.0")]),
        spec("lib", "1.0.0", &[]),
        spec("lib", "2.0.0", &[]),
        spec("zeta", "1.0.0", &[("lib", "=1.0.0")]),
    ]);
    let manifest = manifest(vec![Requirement::any("app"), Requirement::any("zeta")]);

    let graph = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect("must resolve");

    assert_eq!(version_of(&graph, "app"), "1.0.0");
    assert_eq!(version_of(&graph, "lib"), "1.0.0");
    assert_eq!(version_of(&graph, "zeta"), "1.0.0");
}

#[test]
fn locked_versions_are_relaxed_when_they_cannot_be_kept() {
    let sources = registry_set(vec![
        spec("rack", "0.9.1", &[("mime", ">=0.1")]),
        spec("mime", "0.1.0", &[]),
        spec("mime", "0.2.0", &[]),
        spec("thin", "1.0.0", &[("mime", ">=0.2")]),
    ]);
    let old = manifest(vec![Requirement::any("rack")]);
    let lock = lock_of(
        &old,
        vec![
            spec("rack", "0.9.1", &[("mime", ">=0.1")]),
            spec("mime", "0.1.0", &[]),
        ],
    );
    let new = manifest(vec![Requirement::any("rack"), Requirement::any("thin")]);

    let graph = Resolver::new(&sources, options())
        .resolve(&new, Some(&lock))
        .expect("relaxed pass must resolve");

    assert_eq!(version_of(&graph, "rack"), "0.9.1");
    assert_eq!(version_of(&graph, "mime"), "0.2.0");
    assert_eq!(version_of(&graph, "thin"), "1.0.0");
}

#[test]
fn dependency_cycles_resolve_and_order() {
    let sources = registry_set(vec![
        spec("chicken", "1.0.0", &[("egg", "*")]),
        spec("egg", "1.0.0", &[("chicken", "*")]),
        spec("farm", "1.0.0", &[]),
    ]);
    let manifest = manifest(vec![Requirement::any("chicken"), Requirement::any("farm")]);

    let graph = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect("cycle must resolve");

    assert_eq!(graph.len(), 3);
    assert_eq!(install_order(&graph), vec!["farm", "chicken", "egg"]);
}

#[test]
fn install_order_puts_dependencies_first() {
    let mut graph = DependencyGraph::new(vec![Requirement::any("app")]);
    graph.insert(spec("app", "1.0.0", &[("lib", "^1")]));
    graph.insert(spec("lib", "1.2.0", &[("zlib", "^2")]));
    graph.insert(spec("zlib", "2.1.0", &[]));

    assert_eq!(install_order(&graph), vec!["zlib", "lib", "app"]);
}

#[test]
fn platform_specific_builds_are_preferred_on_their_platform() {
    let sources = registry_set(vec![
        spec("nokogiri", "1.4.0", &[]),
        spec("nokogiri", "1.4.0", &[]).with_platform(PLATFORM),
        spec("nokogiri", "1.5.0", &[]).with_platform("aarch64-macos"),
    ]);
    let manifest = manifest(vec![Requirement::any("nokogiri")]);

    let linux = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect("must resolve");
    let linux_spec = linux.get("nokogiri").expect("nokogiri must resolve");
    assert_eq!(linux_spec.full_name(), "nokogiri 1.4.0 (x86_64-linux)");

    let windows = Resolver::new(
        &sources,
        ResolveOptions::new("x86_64-windows").expect("platform must be valid"),
    )
    .resolve(&manifest, None)
    .expect("must resolve");
    let windows_spec = windows.get("nokogiri").expect("nokogiri must resolve");
    assert_eq!(windows_spec.full_name(), "nokogiri 1.4.0");
}

#[test]
fn excluded_groups_and_foreign_platforms_are_not_resolved() {
    let sources = registry_set(rack_registry());
    let manifest = manifest(vec![
        Requirement::any("rack"),
        Requirement::any("thin").with_groups(["test"]),
        Requirement::any("sinatra").with_platforms(["aarch64-macos"]),
    ]);

    let graph = Resolver::new(
        &sources,
        options().with_groups(GroupSelection::without(["test"])),
    )
    .resolve(&manifest, None)
    .expect("inactive requirements must be skipped");

    assert!(graph.contains("rack"));
    assert!(!graph.contains("thin"));
    assert!(!graph.contains("sinatra"));
    assert_eq!(graph.roots().len(), 3);
}

#[test]
fn pinned_source_answers_alone() {
    let vendored = SourceIdentity::path("/work/vendor/rack");
    let sources = source_set(vec![
        MemorySource::new(registry(), rack_registry()),
        MemorySource::new(
            vendored.clone(),
            vec![spec_from(vendored.clone(), "rack", "0.5.0", &[])],
        ),
    ]);
    let manifest = manifest(vec![Requirement::any("rack").with_source(vendored.clone())]);

    let graph = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect("must resolve");

    let rack = graph.get("rack").expect("rack must resolve");
    assert_eq!(rack.version.to_string(), "0.5.0");
    assert_eq!(rack.source, vendored);
}

#[test]
fn unavailable_source_surfaces_as_transient_error() {
    let mut offline = MemorySource::new(registry(), rack_registry());
    offline.offline = true;
    let sources = source_set(vec![offline]);
    let manifest = manifest(vec![Requirement::any("rack")]);

    let err = Resolver::new(&sources, options())
        .resolve(&manifest, None)
        .expect_err("offline source must fail");

    assert!(classify(&err).is_some_and(Error::is_transient));
}

#[test]
fn refreshed_sources_follow_the_update_scope() {
    let foo = SourceIdentity::vcs("/src/foo", VcsReference::Branch("omg".into()));
    let bar = SourceIdentity::vcs("/src/bar.git", VcsReference::Tag("v1".into()));
    let manifest = Manifest::new(
        vec![
            Requirement::any("foo").with_source(foo.clone()),
            Requirement::any("bar").with_source(bar.clone()),
            Requirement::any("rack"),
        ],
        vec![registry()],
    )
    .expect("manifest must be valid");
    let lock = lock_of(
        &manifest,
        vec![
            spec_from(foo.clone(), "foo", "1.0.0", &[]),
            spec_from(bar.clone(), "bar", "1.0.0", &[]),
            spec("rack", "1.0.0", &[]),
        ],
    );

    assert!(refreshed_sources(&manifest, &lock, None).is_empty());
    assert_eq!(
        refreshed_sources(&manifest, &lock, Some(&UpdateScope::names(["foo", "rack"]))),
        BTreeSet::from([foo.clone()])
    );
    assert_eq!(
        refreshed_sources(&manifest, &lock, Some(&UpdateScope::sources(["bar"]))),
        BTreeSet::from([bar.clone()])
    );
    assert_eq!(
        refreshed_sources(&manifest, &lock, Some(&UpdateScope::All)),
        BTreeSet::from([foo, bar])
    );
}

#[test]
fn update_by_source_name_unlocks_its_packages() {
    let foo = SourceIdentity::vcs("/src/foo", VcsReference::Branch("omg".into()));
    let manifest = Manifest::new(
        vec![
            Requirement::any("foo").with_source(foo.clone()),
            Requirement::any("thin"),
        ],
        vec![registry()],
    )
    .expect("manifest must be valid");
    let lock = lock_of(
        &manifest,
        vec![
            spec_from(foo.clone(), "foo", "1.0.0", &[]),
            spec("thin", "1.0.0", &[]),
        ],
    );
    let sources = source_set(vec![
        MemorySource::new(registry(), rack_registry()),
        MemorySource::new(
            foo.clone(),
            vec![
                spec_from(foo.clone(), "foo", "1.0.0", &[]),
                spec_from(foo.clone(), "foo", "1.1.0", &[]),
            ],
        ),
    ]);

    let graph = Resolver::new(
        &sources,
        options().with_update(Some(UpdateScope::sources(["foo"]))),
    )
    .resolve(&manifest, Some(&lock))
    .expect("must resolve");
    assert_eq!(version_of(&graph, "foo"), "1.1.0");
    assert_eq!(version_of(&graph, "thin"), "1.0.0");

    let err = Resolver::new(
        &sources,
        options().with_update(Some(UpdateScope::sources(["nope"]))),
    )
    .resolve(&manifest, Some(&lock))
    .expect_err("unknown source must fail");
    assert!(err.to_string().contains("source 'nope' is not used"));
}

#[test]
fn resolve_options_reject_blank_platforms() {
    assert!(ResolveOptions::new("").is_err());
    assert!(ResolveOptions::new("x86 64").is_err());
    assert!(options()
        .with_update(Some(UpdateScope::names(Vec::<String>::new())))
        .update
        .is_none());
}
