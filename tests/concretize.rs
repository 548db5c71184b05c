//! End-to-end concretization scenarios against an in-memory repository.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_test::traced_test;

use concretize::{
    concretize_text, ConcreteSpec, ConcretizeError, ConcretizeOptions, DepType, DepTypeSet,
    DuplicatePolicy, ExternalEntry, InMemoryRepository, InstalledSpecs, PackageRecipe,
    Preferences, Spec, SpecDocument, VariantValue,
};

/// A repository with one virtual, two providers and a small library stack.
fn standard_repo() -> InMemoryRepository {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .version("2.0")
            .variant_bool("shared", true)
            .depends_on("zlib@1.2:")
            .depends_on("mpi")
            .build(),
    );
    repo.add(PackageRecipe::builder("zlib").version("1.2.13").version("1.3").build());
    repo.add(
        PackageRecipe::builder("mpich")
            .version("4.1")
            .provides("mpi@3")
            .depends_on("zlib")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("openmpi")
            .version("4.1.5")
            .provides("mpi@3")
            .build(),
    );
    repo
}

fn solve(repo: &InMemoryRepository, text: &str) -> Result<ConcreteSpec, ConcretizeError> {
    concretize_text(
        text,
        repo,
        &Preferences::default(),
        None,
        &ConcretizeOptions::default(),
    )
}

fn solve_with(
    repo: &InMemoryRepository,
    text: &str,
    prefs: &Preferences,
) -> Result<ConcreteSpec, ConcretizeError> {
    concretize_text(text, repo, prefs, None, &ConcretizeOptions::default())
}

#[test]
fn everything_gets_pinned() {
    let concrete = solve(&standard_repo(), "app").unwrap();
    let root = concrete.root_node();
    assert_eq!(root.name, "app");
    assert_eq!(root.version.to_string(), "2.0");
    assert_eq!(root.variants.get("shared"), Some(&VariantValue::Bool(true)));
    assert_eq!(root.compiler.to_string(), "gcc@12.3.0");
    assert_eq!(root.arch.to_string(), "test-debian6-x86_64");
    for node in concrete.nodes() {
        assert!(node.as_spec().is_concrete(), "`{}` is not concrete", node.name);
    }
}

#[test]
fn canonical_rendering() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .variant_bool("shared", true)
            .depends_on("zlib@1.3")
            .build(),
    );
    repo.add(PackageRecipe::builder("zlib").version("1.3").build());

    let concrete = solve(&repo, "app").unwrap();
    insta::assert_snapshot!(
        concrete.to_string(),
        @"app@1.0%gcc@12.3.0+shared arch=test-debian6-x86_64 ^zlib@1.3%gcc@12.3.0 arch=test-debian6-x86_64"
    );
}

#[traced_test]
#[test]
fn provider_follows_preferences() {
    let repo = standard_repo();

    // Repository registration order breaks ties by default.
    let concrete = solve(&repo, "app").unwrap();
    assert!(concrete.find("mpich").is_some());
    assert!(concrete.find("openmpi").is_none());

    let mut prefs = Preferences::default();
    prefs.prefer_providers("mpi", &["openmpi"]);
    let concrete = solve_with(&repo, "app", &prefs).unwrap();
    assert!(concrete.find("openmpi").is_some());
    assert!(concrete.find("mpich").is_none());

    assert!(logs_contain("binding virtual"));
}

#[test]
fn virtual_interface_versions_select_the_provider() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("new-style")
            .version("1.0")
            .depends_on("mpi@3:")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("old-style")
            .version("1.0")
            .depends_on("mpi@:2")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("oldmpi")
            .version("1.9")
            .provides("mpi@2")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("mpich")
            .version("4.1")
            .provides("mpi@3")
            .build(),
    );

    let concrete = solve(&repo, "new-style").unwrap();
    assert!(concrete.find("mpich").is_some());

    let concrete = solve(&repo, "old-style").unwrap();
    assert!(concrete.find("oldmpi").is_some());
    assert!(concrete.find("mpich").is_none());
}

#[test]
fn virtual_root_resolves_to_a_provider() {
    let concrete = solve(&standard_repo(), "mpi").unwrap();
    assert_eq!(concrete.root_node().name, "mpich");
}

#[test]
fn no_satisfiable_provider_is_its_own_error() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("mpi@9:")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("mpich")
            .version("4.1")
            .provides("mpi@3")
            .build(),
    );
    let err = solve(&repo, "app").unwrap_err();
    assert!(matches!(err, ConcretizeError::NoProvider { .. }), "{err}");
    assert!(err.to_string().contains("mpi"), "{err}");
}

#[test]
fn version_ranges_narrow_across_requirers() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("lib@1.0:1.2")
            .depends_on("mid")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("mid")
            .version("1.0")
            .depends_on("lib@1.1:2.0")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("lib")
            .version("1.0")
            .version("1.1")
            .version("1.2")
            .version("2.0")
            .build(),
    );

    let concrete = solve(&repo, "app").unwrap();
    // Newest version in the narrowed window [1.1, 1.2].
    assert_eq!(concrete.find("lib").unwrap().version.to_string(), "1.2");
}

#[test]
fn disjoint_requirements_report_both_requirers() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("lib@1.0:1.2")
            .depends_on("mid")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("mid")
            .version("1.0")
            .depends_on("lib@2.4:")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("lib")
            .version("1.2")
            .version("2.4")
            .build(),
    );

    let err = solve(&repo, "app").unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, ConcretizeError::Unsatisfiable(_)), "{message}");
    assert!(message.contains("app"), "{message}");
    assert!(message.contains("mid"), "{message}");
    assert!(message.contains("lib@"), "{message}");
}

#[test]
fn conditional_dependencies_follow_variants() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("pkg")
            .version("1.0")
            .variant_bool("feature", false)
            .depends_on_when("helper", Some("+feature"))
            .build(),
    );
    repo.add(PackageRecipe::builder("helper").version("1.0").build());

    let defaulted = solve(&repo, "pkg").unwrap();
    assert!(defaulted.find("helper").is_none());

    let without = solve(&repo, "pkg~feature").unwrap();
    assert!(without.find("helper").is_none());

    let with = solve(&repo, "pkg+feature").unwrap();
    assert!(with.find("helper").is_some());
}

#[test]
fn declared_conflicts_are_honored() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("pkg")
            .version("1.0")
            .variant_bool("a", false)
            .variant_bool("b", false)
            .conflicts("+a", Some("+b"))
            .build(),
    );

    // Each variant alone is fine.
    assert!(solve(&repo, "pkg+a").is_ok());
    assert!(solve(&repo, "pkg+b").is_ok());

    let err = solve(&repo, "pkg+a+b").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("+a"), "{message}");
    assert!(message.contains("+b"), "{message}");
}

#[test]
fn dependency_constraints_set_variants() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("lib lang=c")
            .depends_on("other")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("other")
            .version("1.0")
            .depends_on("lib lang=cxx")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("lib")
            .version("1.0")
            .variant_multi("lang", &["c"], &["c", "cxx", "fortran"])
            .build(),
    );

    let concrete = solve(&repo, "app").unwrap();
    // Multi-valued requirements from both requirers union.
    assert_eq!(
        concrete.find("lib").unwrap().variants.get("lang"),
        Some(&VariantValue::multi(["c", "cxx"]))
    );
}

#[test]
fn late_variant_union_attaches_conditional_dependencies() {
    // `app` reaches lib first with the default lang={c}; `mid` then widens
    // it to lang={c,cxx}, which activates lib's guarded dependency. The
    // already-expanded lib node must pick up the new edge.
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("lib")
            .depends_on("mid")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("mid")
            .version("1.0")
            .depends_on("lib lang=cxx")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("lib")
            .version("1.0")
            .variant_multi("lang", &["c"], &["c", "cxx"])
            .depends_on_when("cxx-runtime", Some("lang=cxx"))
            .build(),
    );
    repo.add(PackageRecipe::builder("cxx-runtime").version("1.0").build());

    let concrete = solve(&repo, "app").unwrap();
    assert_eq!(
        concrete.find("lib").unwrap().variants.get("lang"),
        Some(&VariantValue::multi(["c", "cxx"]))
    );
    assert!(concrete.find("cxx-runtime").is_some());
}

#[test]
fn root_dependency_constraints_bind_transitively() {
    let concrete = solve(&standard_repo(), "app ^zlib@1.2.13").unwrap();
    assert_eq!(concrete.find("zlib").unwrap().version.to_string(), "1.2.13");
    // Both app and mpich link against the single zlib node.
    let zlibs = concrete.nodes().iter().filter(|n| n.name == "zlib").count();
    assert_eq!(zlibs, 1);
}

#[test]
fn compiler_is_inherited_down_link_edges() {
    let repo = standard_repo();
    let concrete = solve(&repo, "app%clang").unwrap();
    for node in concrete.nodes() {
        assert_eq!(node.compiler.name, "clang", "`{}` mixes compilers", node.name);
    }
}

#[test]
fn requested_target_propagates() {
    let repo = standard_repo();
    let concrete = solve(&repo, "app target=x86_64_v3").unwrap();
    for node in concrete.nodes() {
        assert_eq!(node.arch.target, "x86_64_v3", "`{}` lost the target", node.name);
    }
}

#[test]
fn externals_are_leaves() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("cmake")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("cmake")
            .version("3.27")
            .depends_on("openssl")
            .build(),
    );
    repo.add(PackageRecipe::builder("openssl").version("3.1").build());

    let mut prefs = Preferences::default();
    prefs.externals.push(ExternalEntry {
        spec: Spec::parse("cmake@3.26").unwrap(),
        path: Some("/usr".to_string()),
        module: None,
    });

    let concrete = solve_with(&repo, "app", &prefs).unwrap();
    let cmake = concrete.find("cmake").unwrap();
    assert_eq!(cmake.version.to_string(), "3.26");
    assert_eq!(
        cmake.external.as_ref().and_then(|e| e.path.as_deref()),
        Some("/usr")
    );
    // The external's own dependencies are not solved.
    assert!(cmake.edges.is_empty());
    assert!(concrete.find("openssl").is_none());
}

#[test]
fn installed_specs_are_reused() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("lib")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("lib")
            .version("1.0")
            .version("1.1")
            .build(),
    );

    let mut installed = InstalledSpecs::new();
    installed.add(solve(&repo, "lib@1.0").unwrap());

    let prefs = Preferences::default();
    let options = ConcretizeOptions::default();
    let reused = concretize_text("app", &repo, &prefs, Some(&installed), &options).unwrap();
    assert_eq!(reused.find("lib").unwrap().version.to_string(), "1.0");

    // Without the database the newest version wins.
    let fresh = concretize_text("app", &repo, &prefs, None, &options).unwrap();
    assert_eq!(fresh.find("lib").unwrap().version.to_string(), "1.1");
}

#[test]
fn duplicate_names_need_the_escape_valve() {
    let mut repo = InMemoryRepository::new();
    let build_only = DepTypeSet::new(&[DepType::Build]);
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on_full("buildtool@1", None, build_only)
            .depends_on("lib")
            .build(),
    );
    repo.add(
        PackageRecipe::builder("lib")
            .version("1.0")
            .depends_on_full("buildtool@2", None, build_only)
            .build(),
    );
    repo.add(
        PackageRecipe::builder("buildtool")
            .version("1")
            .version("2")
            .build(),
    );

    let err = solve(&repo, "app").unwrap_err();
    assert!(matches!(err, ConcretizeError::Unsatisfiable(_)), "{err}");

    let options = ConcretizeOptions {
        duplicate_policy: DuplicatePolicy::AllowBuildDuplicates,
        ..ConcretizeOptions::default()
    };
    let concrete =
        concretize_text("app", &repo, &Preferences::default(), None, &options).unwrap();
    let tools: Vec<String> = concrete
        .nodes()
        .iter()
        .filter(|n| n.name == "buildtool")
        .map(|n| n.version.to_string())
        .collect();
    assert_eq!(tools.len(), 2);
    assert!(tools.contains(&"1".to_string()) && tools.contains(&"2".to_string()));
}

#[test]
fn runs_are_deterministic() {
    let a = solve(&standard_repo(), "app+shared ^zlib@1.2:").unwrap();
    let b = solve(&standard_repo(), "app+shared ^zlib@1.2:").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.dag_hash(), b.dag_hash());

    let doc_a = serde_json::to_string(&SpecDocument::from_concrete(&a)).unwrap();
    let doc_b = serde_json::to_string(&SpecDocument::from_concrete(&b)).unwrap();
    assert_eq!(doc_a, doc_b);
}

#[test]
fn documents_round_trip_through_json() {
    let concrete = solve(&standard_repo(), "app").unwrap();
    let doc = SpecDocument::from_concrete(&concrete);
    doc.verify().unwrap();

    let json = serde_json::to_string_pretty(&doc).unwrap();
    let parsed: SpecDocument = serde_json::from_str(&json).unwrap();
    let rebuilt = parsed.to_concrete().unwrap();
    assert_eq!(rebuilt, concrete);
}

#[test]
fn hash_changes_ripple_upward_only() {
    let repo = standard_repo();
    let a = solve(&repo, "app").unwrap();
    let b = solve(&repo, "app ^zlib@1.2.13").unwrap();

    // zlib changed, so everything above it changed with it.
    assert_ne!(
        a.find("zlib").unwrap().hash,
        b.find("zlib").unwrap().hash
    );
    assert_ne!(a.dag_hash(), b.dag_hash());
    assert_ne!(
        a.find("mpich").unwrap().hash,
        b.find("mpich").unwrap().hash
    );
}

#[test]
fn unknown_packages_report_their_chain() {
    let mut repo = InMemoryRepository::new();
    repo.add(
        PackageRecipe::builder("app")
            .version("1.0")
            .depends_on("no-such-thing")
            .build(),
    );
    let err = solve(&repo, "app").unwrap_err();
    assert!(matches!(err, ConcretizeError::UnknownPackage { .. }), "{err}");
    assert!(err.to_string().contains("app"), "{err}");
    assert!(err.to_string().contains("no-such-thing"), "{err}");
}

#[test]
fn cancellation_interrupts_the_search() {
    let flag = Arc::new(AtomicBool::new(true));
    flag.store(true, Ordering::Relaxed);
    let options = ConcretizeOptions {
        cancel: Some(flag),
        ..ConcretizeOptions::default()
    };
    let err = concretize_text(
        "app",
        &standard_repo(),
        &Preferences::default(),
        None,
        &options,
    )
    .unwrap_err();
    assert!(matches!(err, ConcretizeError::Timeout { .. }), "{err}");
}

#[test]
fn requests_outside_declared_versions_fail() {
    let err = solve(&standard_repo(), "app@9.9").unwrap_err();
    assert!(matches!(err, ConcretizeError::Unsatisfiable(_)), "{err}");
    assert!(err.to_string().contains("app"), "{err}");
}
