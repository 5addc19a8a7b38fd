use super::*;
use ed25519_dalek::{Signer, SigningKey};
use lockstep_core::{classify, Error, Manifest, Requirement, VcsReference};
use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[test]
fn registry_candidates_are_verified_and_sorted_newest_first() {
    let root = test_sources_root();
    let registry = root.join("registry");
    write_signed_entry(&registry, "rack", "0.9.1", "");
    write_signed_entry(&registry, "rack", "1.0.0", "");

    let source = RegistrySource::new(&format!("file://{}", registry.display()));
    let specs = source.candidates("rack").expect("candidates must load");
    let versions: Vec<String> = specs.iter().map(|spec| spec.version.to_string()).collect();

    assert_eq!(versions, vec!["1.0.0", "0.9.1"]);
    assert!(source
        .candidates("missing")
        .expect("unknown package must not fail")
        .is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn registry_rejects_tampered_index_entry() {
    let root = test_sources_root();
    let registry = root.join("registry");
    write_signed_entry(&registry, "rack", "1.0.0", "");
    fs::write(
        registry.join("index").join("rack").join("1.0.0.toml"),
        "name = \"rack\"\nversion = \"9.9.9\"\n",
    )
    .expect("must tamper with entry");

    let err = RegistrySource::new(&registry.display().to_string())
        .candidates("rack")
        .expect_err("tampered entry must fail");
    assert!(format!("{err:#}").contains("signature verification failed"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn registry_missing_root_is_source_unavailable() {
    let root = test_sources_root();
    let err = RegistrySource::new(&root.join("nowhere").display().to_string())
        .candidates("rack")
        .expect_err("missing registry must fail");

    assert!(matches!(
        classify(&err),
        Some(Error::SourceUnavailable { .. })
    ));
    assert!(classify(&err).is_some_and(Error::is_transient));
}

#[test]
fn registry_materialize_copies_payload_and_discovers_executables() {
    let root = test_sources_root();
    let registry = root.join("registry");
    write_signed_entry(&registry, "rack", "1.0.0", "");
    let payload = registry.join("packages").join("rack-1.0.0");
    fs::create_dir_all(payload.join("bin")).expect("must create payload bin");
    fs::create_dir_all(payload.join("lib")).expect("must create payload lib");
    fs::write(payload.join("bin").join("rackup"), "#!/bin/sh\n").expect("must write bin");
    fs::write(payload.join("lib").join("rack.rb"), "RACK = '1.0.0'\n").expect("must write lib");

    let source = RegistrySource::new(&registry.display().to_string());
    let spec = source
        .candidates("rack")
        .expect("candidates must load")
        .remove(0);
    assert_eq!(spec.executables, vec!["rackup".to_string()]);

    let target = root.join("installed").join("rack-1.0.0");
    let placed = source
        .materialize(&spec, &target)
        .expect("materialize must succeed");

    assert_eq!(placed, Materialized::Written);
    assert!(target.join("lib").join("rack.rb").is_file());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn path_source_discovers_nested_descriptors() {
    let root = test_sources_root();
    let tree = root.join("rails");
    write_descriptor(&tree, "rails", "3.0.0", "activesupport = \"=3.0.0\"\n");
    write_descriptor(&tree.join("activesupport"), "activesupport", "3.0.0", "");
    write_descriptor(&tree.join(".hidden"), "hidden", "1.0.0", "");

    let source = PathSource::new(&tree);
    let rails = source.candidates("rails").expect("rails must load");
    let activesupport = source
        .candidates("activesupport")
        .expect("activesupport must load");

    assert_eq!(rails.len(), 1);
    assert_eq!(rails[0].subdir, None);
    assert_eq!(activesupport.len(), 1);
    assert_eq!(activesupport[0].subdir.as_deref(), Some("activesupport"));
    assert!(source
        .candidates("hidden")
        .expect("hidden lookup must succeed")
        .is_empty());
    assert_eq!(
        source
            .materialize(&rails[0], &root.join("unused"))
            .expect("path materialize must succeed"),
        Materialized::InPlace(tree.clone())
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn path_source_synthesizes_declared_packages_without_descriptor() {
    let root = test_sources_root();
    let tree = root.join("foo");
    fs::create_dir_all(tree.join("bin")).expect("must create bin");
    fs::write(tree.join("bin").join("foobar"), "#!/bin/sh\n").expect("must write bin");

    let source = PathSource::new(&tree).declare("foo", Some(Version::new(1, 0, 0)));
    let specs = source.candidates("foo").expect("foo must load");

    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].version, Version::new(1, 0, 0));
    assert_eq!(specs[0].executables, vec!["foobar".to_string()]);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_cache_fetch_picks_up_tags_created_after_clone() {
    let root = test_sources_root();
    let remote = init_git_repo(&root.join("remote"), "foo", "1.0.0");
    let cache = VcsCache::new(root.join("cache"));
    let uri = format!("file://{}", remote.display());

    cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect("initial fetch must succeed");
    assert_eq!(
        cache
            .resolve_local(&uri, &VcsReference::Tag("v2".into()))
            .expect("local resolve must succeed"),
        None
    );

    fs::write(remote.join("CHANGELOG"), "v2\n").expect("must write file");
    git_commit_all(&remote, "second");
    git_run(&remote, &["tag", "v2"]);

    let tagged = cache
        .fetch_ref(&uri, &VcsReference::Tag("v2".into()))
        .expect("new tag must be fetched");
    assert_eq!(tagged, git_head(&remote));
    assert!(cache.has_revision(&uri, &tagged).expect("lookup must succeed"));
    assert_eq!(
        cache.last_fetched(&uri, &VcsReference::Tag("v2".into())),
        Some(tagged)
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_cache_failed_fetch_keeps_previous_entry() {
    let root = test_sources_root();
    let remote = init_git_repo(&root.join("remote"), "foo", "1.0.0");
    let cache = VcsCache::new(root.join("cache"));
    let uri = remote.display().to_string();

    let first = cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect("initial fetch must succeed");
    fs::remove_dir_all(&remote).expect("must remove remote");

    let err = cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect_err("fetch from a vanished remote must fail");
    assert!(matches!(classify(&err), Some(Error::SourceUnavailable { .. })));
    assert!(cache.has_revision(&uri, &first).expect("entry must survive"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_cache_reports_remote_without_git_metadata_by_path() {
    let root = test_sources_root();
    let remote = init_git_repo(&root.join("remote"), "foo", "1.0.0");
    let cache = VcsCache::new(root.join("cache"));
    let uri = remote.display().to_string();
    cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect("initial fetch must succeed");

    fs::remove_dir_all(remote.join(".git")).expect("must remove git metadata");
    let err = cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect_err("fetch must fail");

    match classify(&err) {
        Some(Error::RepositoryMissing { path }) => assert_eq!(path, &remote),
        other => panic!("expected repository missing, got {other:?}"),
    }
    assert!(err.to_string().contains(&remote.display().to_string()));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_cache_reports_deleted_git_dir_remote_by_path() {
    let root = test_sources_root();
    let remote = init_git_repo(&root.join("remote"), "foo", "1.0.0");
    let cache = VcsCache::new(root.join("cache"));
    let git_dir = remote.join(".git");
    let uri = format!("file://{}", git_dir.display());
    let first = cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect("initial fetch must succeed");

    fs::remove_dir_all(&git_dir).expect("must remove git metadata");
    let err = cache
        .fetch_ref(&uri, &VcsReference::DefaultBranch)
        .expect_err("fetch must fail");

    match classify(&err) {
        Some(Error::RepositoryMissing { path }) => assert_eq!(path, &git_dir),
        other => panic!("expected repository missing, got {other:?}"),
    }
    assert!(!classify(&err).is_some_and(Error::is_transient));
    assert!(cache.has_revision(&uri, &first).expect("entry must survive"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_cache_entry_key_ignores_file_scheme_and_trailing_slash() {
    let cache = VcsCache::new("/tmp/lockstep-cache");

    let plain = cache.entry_key("/src/foo");
    assert_eq!(plain, cache.entry_key("file:///src/foo/"));
    assert!(plain.starts_with("foo-"));
    assert_ne!(plain, cache.entry_key("/src/bar"));
}

#[test]
fn vcs_source_with_locked_revision_does_not_follow_branch() {
    let root = test_sources_root();
    let remote = init_git_repo(&root.join("remote"), "foo", "1.0.0");
    git_run(&remote, &["checkout", "-q", "-b", "omg"]);
    fs::write(remote.join("omg.txt"), "omg\n").expect("must write file");
    git_commit_all(&remote, "on omg");
    let locked = git_head(&remote);

    let cache = Arc::new(VcsCache::new(root.join("cache")));
    let identity = SourceIdentity::vcs(
        remote.display().to_string(),
        VcsReference::Branch("omg".into()),
    );
    let floating = VcsSource::new(identity.clone(), Arc::clone(&cache))
        .expect("vcs source must build");
    assert_eq!(floating.revision().expect("revision must resolve"), locked);

    fs::write(remote.join("omg.txt"), "omg 2\n").expect("must write file");
    git_commit_all(&remote, "advance omg");
    let advanced = git_head(&remote);

    let pinned = VcsSource::new(identity.clone(), Arc::clone(&cache))
        .expect("vcs source must build")
        .with_locked_revision(Some(locked.clone()));
    let refreshed = VcsSource::new(identity, Arc::clone(&cache)).expect("vcs source must build");

    assert_eq!(pinned.revision().expect("locked revision"), locked);
    assert_eq!(refreshed.revision().expect("floating revision"), advanced);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_source_finds_packages_in_repository_subdirectories() {
    let root = test_sources_root();
    let remote = root.join("rails");
    write_descriptor(&remote, "rails", "3.0.0", "activesupport = \"=3.0.0\"\n");
    write_descriptor(&remote.join("activesupport"), "activesupport", "3.0.0", "");
    git_init(&remote);
    git_commit_all(&remote, "initial");

    let cache = Arc::new(VcsCache::new(root.join("cache")));
    let source = VcsSource::new(
        SourceIdentity::vcs(remote.display().to_string(), VcsReference::DefaultBranch),
        cache,
    )
    .expect("vcs source must build");

    let activesupport = source
        .candidates("activesupport")
        .expect("activesupport must load");
    assert_eq!(activesupport.len(), 1);
    assert_eq!(activesupport[0].subdir.as_deref(), Some("activesupport"));
    assert_eq!(activesupport[0].revision, Some(git_head(&remote)));

    let target = root.join("checkout");
    source
        .materialize(&activesupport[0], &target)
        .expect("materialize must succeed");
    assert!(target.join("activesupport").join("package.toml").is_file());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn vcs_source_without_descriptor_exposes_declared_package() {
    let root = test_sources_root();
    let remote = root.join("foo");
    fs::create_dir_all(remote.join("bin")).expect("must create bin");
    fs::write(remote.join("bin").join("foobar"), "#!/bin/sh\necho 1.0\n").expect("must write bin");
    git_init(&remote);
    git_commit_all(&remote, "initial");

    let source = VcsSource::new(
        SourceIdentity::vcs(remote.display().to_string(), VcsReference::DefaultBranch),
        Arc::new(VcsCache::new(root.join("cache"))),
    )
    .expect("vcs source must build")
    .declare("foo", Some(Version::new(1, 0, 0)));

    let specs = source.candidates("foo").expect("foo must load");
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].executables, vec!["foobar".to_string()]);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn source_set_prefers_higher_priority_kind_at_equal_version() {
    let root = test_sources_root();
    let registry = root.join("registry");
    write_signed_entry(&registry, "rack", "1.0.0", "");
    let vendored = root.join("vendor-rack");
    write_descriptor(&vendored, "rack", "1.0.0", "");

    let mut set = SourceSet::new(SourcePriority::default());
    set.insert(Arc::new(RegistrySource::new(&registry.display().to_string())));
    set.insert(Arc::new(PathSource::new(&vendored)));

    let default_order = set.candidates_for("rack", None).expect("candidates");
    assert_eq!(default_order[0].source, SourceIdentity::path(&vendored));

    let mut registry_first = SourceSet::new(
        SourcePriority::parse("registry,vcs,path").expect("priority must parse"),
    );
    registry_first.insert(Arc::new(RegistrySource::new(&registry.display().to_string())));
    registry_first.insert(Arc::new(PathSource::new(&vendored)));
    let reordered = registry_first.candidates_for("rack", None).expect("candidates");
    assert_eq!(reordered[0].source.kind(), lockstep_core::SourceKind::Registry);

    let pinned = set
        .candidates_for("rack", Some(&SourceIdentity::path(&vendored)))
        .expect("pinned candidates");
    assert_eq!(pinned.len(), 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn source_set_orders_platform_specific_before_generic() {
    let root = test_sources_root();
    let registry = root.join("registry");
    write_signed_entry(&registry, "nokogiri", "1.4.0", "");
    write_signed_entry(&registry, "nokogiri", "1.4.0", "x86_64-linux");

    let mut set = SourceSet::default();
    set.insert(Arc::new(RegistrySource::new(&registry.display().to_string())));
    let specs = set.candidates_for("nokogiri", None).expect("candidates");

    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].platform, "x86_64-linux");
    assert!(specs[1].is_generic());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn source_set_for_manifest_builds_every_source_and_prefetches() {
    let root = test_sources_root();
    let registry = root.join("registry");
    write_signed_entry(&registry, "rack", "1.0.0", "");
    let vendored = root.join("foo");
    fs::create_dir_all(&vendored).expect("must create path source");

    let manifest = Manifest::new(
        vec![
            Requirement::any("rack"),
            Requirement::new("foo", semver::VersionReq::parse("=2.0.0").expect("req"))
                .with_source(SourceIdentity::path(&vendored)),
        ],
        vec![SourceIdentity::registry(registry.display().to_string())],
    )
    .expect("manifest must build");
    let set = SourceSet::for_manifest(
        &manifest,
        Arc::new(VcsCache::new(root.join("cache"))),
        SourceSetOptions::default(),
    )
    .expect("source set must build");

    let fetched = set.prefetch(&[
        ("rack".to_string(), None),
        ("foo".to_string(), Some(SourceIdentity::path(&vendored))),
    ]);
    let foo = fetched["foo"].as_ref().expect("foo must resolve");
    assert_eq!(foo[0].version, Version::new(2, 0, 0));
    assert_eq!(fetched["rack"].as_ref().expect("rack must resolve").len(), 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn source_priority_rejects_incomplete_order() {
    assert!(SourcePriority::parse("path,vcs").is_err());
    assert!(SourcePriority::parse("path,path,registry").is_err());
    assert!(SourcePriority::parse("path,svn,registry").is_err());
}

fn write_descriptor(dir: &Path, name: &str, version: &str, dependencies: &str) {
    fs::create_dir_all(dir).expect("must create package directory");
    let mut content = format!("name = \"{name}\"\nversion = \"{version}\"\n");
    if !dependencies.is_empty() {
        content.push_str("\n[dependencies]\n");
        content.push_str(dependencies);
    }
    fs::write(dir.join("package.toml"), content).expect("must write descriptor");
}

fn write_signed_entry(registry: &Path, name: &str, version: &str, platform: &str) {
    let key = signing_key();
    let package_dir = registry.join("index").join(name);
    fs::create_dir_all(&package_dir).expect("must create index directory");
    fs::write(
        registry.join("registry.pub"),
        hex::encode(key.verifying_key().to_bytes()),
    )
    .expect("must write registry key");

    let (file_stem, platform_line) = if platform.is_empty() {
        (version.to_string(), String::new())
    } else {
        (
            format!("{version}-{platform}"),
            format!("platform = \"{platform}\"\n"),
        )
    };
    let content = format!("name = \"{name}\"\nversion = \"{version}\"\n{platform_line}");
    let entry = package_dir.join(format!("{file_stem}.toml"));
    fs::write(&entry, &content).expect("must write index entry");
    let signature = key.sign(content.as_bytes());
    fs::write(
        package_dir.join(format!("{file_stem}.toml.sig")),
        hex::encode(signature.to_bytes()),
    )
    .expect("must write signature");
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[11_u8; 32])
}

fn init_git_repo(dir: &Path, name: &str, version: &str) -> PathBuf {
    write_descriptor(dir, name, version, "");
    git_init(dir);
    git_commit_all(dir, "initial");
    dir.to_path_buf()
}

fn git_init(dir: &Path) {
    fs::create_dir_all(dir).expect("must create repository directory");
    git_run(dir, &["init", "-q", "-b", "master"]);
}

fn git_head(repo_root: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_root)
        .output()
        .expect("git rev-parse must execute");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn git_commit_all(repo_root: &Path, message: &str) {
    git_run(repo_root, &["add", "."]);
    git_run(
        repo_root,
        &[
            "-c",
            "user.name=Lockstep Tests",
            "-c",
            "user.email=lockstep-tests@example.com",
            "commit",
            "-q",
            "-m",
            message,
        ],
    );
}

fn git_run(repo_root: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .expect("git command must execute");
    assert!(
        output.status.success(),
        "git command failed: git {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

static TEST_SOURCES_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_sources_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_SOURCES_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "lockstep-sources-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}
