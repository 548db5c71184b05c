//! `concretize` turns an abstract package request into a fully determined,
//! reproducible dependency DAG.
//!
//! An abstract [`Spec`] like `app@1.2: +shared ^mpi` pins only what the
//! requester cares about. Concretization fills in everything else:
//! versions, variant values, compiler, architecture, providers for virtual
//! dependencies and the complete transitive dependency graph, honoring
//! every constraint declared by the packages involved and breaking ties
//! with site [`Preferences`]. The result is an immutable [`ConcreteSpec`]
//! whose nodes carry content-addressed `dag_hash` identities.
//!
//! The pipeline has four stages, all deterministic:
//!
//! 1. [`FactBase::build`] collects the ground facts: the closure of
//!    packages reachable from the request, with their declared versions,
//!    variants, dependency conditions, conflicts and virtual provisions.
//! 2. The solver searches for an assignment, one attribute decision at a
//!    time, backtracking on conflicts and ranking complete solutions by
//!    the preference policy.
//! 3. [`validate`] checks every structural invariant of the winning
//!    assignment.
//! 4. The materializer freezes it into a [`ConcreteSpec`] with bottom-up
//!    hashes, serializable as a self-verifying [`SpecDocument`].
//!
//! Package recipes reach the engine through the [`PackageRepository`]
//! trait as plain declarative data; see [`PackageRecipe::builder`] for the
//! directive-style construction used in tests and embeddings.
//!
//! ```
//! use concretize::{concretize, ConcretizeOptions, PackageRecipe, Preferences,
//!                  InMemoryRepository, Spec};
//!
//! let mut repo = InMemoryRepository::new();
//! repo.add(
//!     PackageRecipe::builder("app")
//!         .version("1.0")
//!         .variant_bool("shared", true)
//!         .depends_on("zlib@1.2:")
//!         .build(),
//! );
//! repo.add(PackageRecipe::builder("zlib").version("1.3").build());
//!
//! let root = Spec::parse("app+shared").unwrap();
//! let concrete = concretize(
//!     &root,
//!     &repo,
//!     &Preferences::default(),
//!     None,
//!     &ConcretizeOptions::default(),
//! )
//! .unwrap();
//! assert_eq!(concrete.root_node().name, "app");
//! assert!(concrete.root_node().as_spec().satisfies(&root));
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub(crate) mod internal;

mod error;
mod facts;
mod materialize;
mod policy;
mod recipe;
mod solver;
mod spec;
mod validate;
mod version;

pub use error::{ConcretizeError, ParseError, UnsatisfiableSpecError};
pub use facts::{FactBase, PackageFacts};
pub use materialize::{ConcreteCompiler, ConcreteEdge, ConcreteNode, ConcreteSpec, DagHash};
pub use policy::{
    CompilerEntry, ExternalEntry, Platform, Preferences, COMPILER_MISMATCH_PENALTY,
    DUPLICATE_PENALTY, REUSE_DISCOUNT, TARGET_MISMATCH_PENALTY,
};
pub use recipe::{
    ConflictDecl, DepType, DepTypeSet, DependencyDecl, InMemoryRepository, PackageRecipe,
    ProvideDecl, RecipeBuilder, VariantDecl,
};
pub use solver::{ResolvedEdge, ResolvedGraph, ResolvedNode};
pub use spec::document::{
    CompilerDocument, DependencyDocument, DocumentError, ExternalDocument, NodeDocument,
    SpecDocument,
};
pub use spec::{Arch, ArchTriple, CompilerSpec, ExternalInfo, Spec, VariantDomain, VariantValue};
pub use validate::{validate, Violation};
pub use version::{Version, VersionList, VersionRange};

/// Source of package recipes. Implementations must be deterministic for
/// the duration of a concretization run: the same name always yields the
/// same recipe, and provider lists keep their order.
pub trait PackageRepository {
    fn get_recipe(&self, name: &str) -> Option<&PackageRecipe>;

    /// Names of the packages providing `virtual_name`, in the repository's
    /// preference order. Empty when the name is not a virtual.
    fn providers_of(&self, virtual_name: &str) -> Vec<&str>;
}

/// Read access to previously concretized installations. When given to
/// [`concretize`] (and [`Preferences::reuse`] is on), the solver prefers
/// versions that match an installed node over building new ones.
pub trait InstalledDatabase {
    /// The specs of installed concrete nodes satisfying `constraint`.
    fn find_installed(&self, constraint: &Spec) -> Vec<Spec>;
}

/// An [`InstalledDatabase`] over a plain list of concrete specs.
#[derive(Default)]
pub struct InstalledSpecs {
    specs: Vec<ConcreteSpec>,
}

impl InstalledSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: ConcreteSpec) {
        self.specs.push(spec);
    }
}

impl InstalledDatabase for InstalledSpecs {
    fn find_installed(&self, constraint: &Spec) -> Vec<Spec> {
        self.specs
            .iter()
            .flat_map(|s| s.nodes())
            .map(ConcreteNode::as_spec)
            .filter(|spec| spec.satisfies(constraint))
            .collect()
    }
}

/// How to treat two nodes of the same package name in one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// One node per package name in the whole graph.
    #[default]
    Forbid,
    /// Admit an extra node for a name when it is reached only through
    /// build-only edges and the single-node constraints cannot be met.
    /// Every duplicate carries a heavy rank penalty.
    AllowBuildDuplicates,
}

/// Knobs bounding and shaping a single [`concretize`] run.
#[derive(Debug, Clone)]
pub struct ConcretizeOptions {
    /// Upper bound on decisions the search may explore. When the budget
    /// runs out the best solution found so far is returned, or
    /// [`ConcretizeError::Timeout`] when there is none.
    pub max_decisions: u64,
    pub duplicate_policy: DuplicatePolicy,
    /// Set from another thread to interrupt the search at its next
    /// checkpoint; treated like budget exhaustion.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for ConcretizeOptions {
    fn default() -> Self {
        ConcretizeOptions {
            max_decisions: 100_000,
            duplicate_policy: DuplicatePolicy::default(),
            cancel: None,
        }
    }
}

/// Concretizes `root` against the recipes in `repo`.
///
/// The run is deterministic: the same repository state, preferences,
/// installed database and options always produce the same
/// [`ConcreteSpec`], with the same hashes.
pub fn concretize(
    root: &Spec,
    repo: &dyn PackageRepository,
    prefs: &Preferences,
    installed: Option<&dyn InstalledDatabase>,
    options: &ConcretizeOptions,
) -> Result<ConcreteSpec, ConcretizeError> {
    tracing::debug!(root = %root, "concretizing");
    let facts = FactBase::build(root, repo)?;
    let graph = solver::Solver::new(&facts, prefs, installed, options).solve()?;

    // The solver only accepts assignments that validate; a violation here
    // is a bug, not a user error.
    let violations = validate(&graph, &facts, prefs, options);
    if !violations.is_empty() {
        let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
        panic!(
            "internal error: the solver accepted an invalid assignment: {}",
            details.join("; ")
        );
    }
    Ok(materialize::materialize(&graph))
}

/// Parses `text` as an abstract spec and concretizes it.
pub fn concretize_text(
    text: &str,
    repo: &dyn PackageRepository,
    prefs: &Preferences,
    installed: Option<&dyn InstalledDatabase>,
    options: &ConcretizeOptions,
) -> Result<ConcreteSpec, ConcretizeError> {
    let root = Spec::parse(text)?;
    concretize(&root, repo, prefs, installed, options)
}
