//! The declarative surface of a package: versions, variants, dependency
//! edges, conflicts and virtual provisions.
//!
//! Whatever authoring mechanism a real repository uses (class hierarchies,
//! executable hooks), a recipe loader must reduce it to this plain data
//! form before concretization; the solver never calls into recipe code.

use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;

use crate::spec::{Spec, VariantDomain, VariantValue};
use crate::version::Version;
use crate::PackageRepository;

/// The relationship category of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepType {
    Build,
    Link,
    Run,
    Test,
}

impl DepType {
    pub const ALL: [DepType; 4] = [DepType::Build, DepType::Link, DepType::Run, DepType::Test];

    pub fn name(self) -> &'static str {
        match self {
            DepType::Build => "build",
            DepType::Link => "link",
            DepType::Run => "run",
            DepType::Test => "test",
        }
    }

    fn bit(self) -> u8 {
        match self {
            DepType::Build => 1,
            DepType::Link => 2,
            DepType::Run => 4,
            DepType::Test => 8,
        }
    }
}

/// A set of [`DepType`]s tagged onto a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepTypeSet(u8);

impl DepTypeSet {
    pub const EMPTY: DepTypeSet = DepTypeSet(0);

    pub fn new(types: &[DepType]) -> Self {
        DepTypeSet(types.iter().fold(0, |acc, t| acc | t.bit()))
    }

    /// The default relationship of a plain `depends_on`: needed to build
    /// against and to link with.
    pub fn build_link() -> Self {
        Self::new(&[DepType::Build, DepType::Link])
    }

    pub fn contains(self, t: DepType) -> bool {
        self.0 & t.bit() != 0
    }

    pub fn union(self, other: DepTypeSet) -> DepTypeSet {
        DepTypeSet(self.0 | other.0)
    }

    /// True when the edge carries no ABI-relevant relationship, i.e. it is
    /// disjoint from link and run. Such edges are the only ones eligible
    /// for the duplicate-name escape valve.
    pub fn is_build_only(self) -> bool {
        !self.contains(DepType::Link) && !self.contains(DepType::Run)
    }

    pub fn iter(self) -> impl Iterator<Item = DepType> {
        DepType::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    pub fn names(self) -> Vec<&'static str> {
        self.iter().map(DepType::name).collect()
    }

    /// Parses `"build,link"` style lists; unknown names are authoring
    /// errors and panic.
    pub fn from_names(names: &str) -> Self {
        let types: Vec<DepType> = names
            .split(',')
            .map(|n| match n.trim() {
                "build" => DepType::Build,
                "link" => DepType::Link,
                "run" => DepType::Run,
                "test" => DepType::Test,
                other => panic!("unknown deptype `{other}`"),
            })
            .collect();
        Self::new(&types)
    }
}

impl Default for DepTypeSet {
    fn default() -> Self {
        Self::build_link()
    }
}

impl Display for DepTypeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for t in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", t.name())?;
            first = false;
        }
        Ok(())
    }
}

/// A declared dependency edge: constraint on the target, an optional
/// condition over the *depending* package's own spec, and the edge's
/// relationship categories.
#[derive(Debug, Clone)]
pub struct DependencyDecl {
    pub spec: Spec,
    pub when: Option<Spec>,
    pub deptypes: DepTypeSet,
}

/// A declared conflict: `matches` and `when` must never both hold on the
/// same node.
#[derive(Debug, Clone)]
pub struct ConflictDecl {
    pub matches: Spec,
    pub when: Option<Spec>,
    pub message: Option<String>,
}

/// A declared virtual provision: this package satisfies `virtual_spec`
/// whenever `when` holds.
#[derive(Debug, Clone)]
pub struct ProvideDecl {
    pub virtual_spec: Spec,
    pub when: Option<Spec>,
}

/// A declared variant: its legal value domain, default, and an optional
/// guard restricting it to the spec range it is meaningful for.
#[derive(Debug, Clone)]
pub struct VariantDecl {
    pub name: String,
    pub domain: VariantDomain,
    pub default: VariantValue,
    pub when: Option<Spec>,
}

/// The full declarative surface of one package.
#[derive(Debug, Clone, Default)]
pub struct PackageRecipe {
    pub name: String,
    pub versions: Vec<Version>,
    pub variants: Vec<VariantDecl>,
    pub dependencies: Vec<DependencyDecl>,
    pub conflicts: Vec<ConflictDecl>,
    pub provides: Vec<ProvideDecl>,
}

impl PackageRecipe {
    pub fn builder(name: impl Into<String>) -> RecipeBuilder {
        RecipeBuilder {
            recipe: PackageRecipe {
                name: name.into(),
                ..PackageRecipe::default()
            },
        }
    }

    pub fn variant(&self, name: &str) -> Option<&VariantDecl> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Directive-style construction of a [`PackageRecipe`].
///
/// Mirrors the authoring directives of the source ecosystem
/// (`version`, `variant`, `depends_on`, `conflicts`, `provides`). Spec
/// texts are parsed eagerly; malformed directive text is an authoring
/// error and panics.
pub struct RecipeBuilder {
    recipe: PackageRecipe,
}

impl RecipeBuilder {
    fn parse(text: &str) -> Spec {
        match Spec::parse(text) {
            Ok(spec) => spec,
            Err(e) => panic!("malformed directive spec: {e}"),
        }
    }

    fn parse_when(when: Option<&str>) -> Option<Spec> {
        when.map(Self::parse)
    }

    pub fn version(mut self, v: &str) -> Self {
        match Version::parse(v) {
            Ok(v) => self.recipe.versions.push(v),
            Err(e) => panic!("malformed version directive: {e}"),
        }
        self
    }

    pub fn variant_bool(mut self, name: &str, default: bool) -> Self {
        self.recipe.variants.push(VariantDecl {
            name: name.to_string(),
            domain: VariantDomain::Bool,
            default: VariantValue::Bool(default),
            when: None,
        });
        self
    }

    pub fn variant_enum(mut self, name: &str, default: &str, values: &[&str]) -> Self {
        self.recipe.variants.push(VariantDecl {
            name: name.to_string(),
            domain: VariantDomain::Enum(values.iter().map(|v| v.to_string()).collect()),
            default: VariantValue::Single(default.to_string()),
            when: None,
        });
        self
    }

    pub fn variant_multi(mut self, name: &str, default: &[&str], values: &[&str]) -> Self {
        self.recipe.variants.push(VariantDecl {
            name: name.to_string(),
            domain: VariantDomain::Multi(values.iter().map(|v| v.to_string()).collect()),
            default: VariantValue::multi(default.iter().copied()),
            when: None,
        });
        self
    }

    /// Restricts the most recently declared variant to specs matching
    /// `when` (e.g. a variant only meaningful from some version on).
    pub fn variant_when(mut self, when: &str) -> Self {
        let decl = self
            .recipe
            .variants
            .last_mut()
            .unwrap_or_else(|| panic!("variant_when without a preceding variant"));
        decl.when = Some(Self::parse(when));
        self
    }

    pub fn depends_on(self, spec: &str) -> Self {
        self.depends_on_when(spec, None)
    }

    pub fn depends_on_when(self, spec: &str, when: Option<&str>) -> Self {
        self.depends_on_full(spec, when, DepTypeSet::build_link())
    }

    pub fn depends_on_full(mut self, spec: &str, when: Option<&str>, deptypes: DepTypeSet) -> Self {
        let spec = Self::parse(spec);
        if spec.name.is_none() {
            panic!("depends_on requires a named spec");
        }
        self.recipe.dependencies.push(DependencyDecl {
            spec,
            when: Self::parse_when(when),
            deptypes,
        });
        self
    }

    pub fn conflicts(self, matches: &str, when: Option<&str>) -> Self {
        self.conflicts_msg(matches, when, None)
    }

    pub fn conflicts_msg(mut self, matches: &str, when: Option<&str>, message: Option<&str>) -> Self {
        self.recipe.conflicts.push(ConflictDecl {
            matches: Self::parse(matches),
            when: Self::parse_when(when),
            message: message.map(|m| m.to_string()),
        });
        self
    }

    pub fn provides(self, virtual_spec: &str) -> Self {
        self.provides_when(virtual_spec, None)
    }

    pub fn provides_when(mut self, virtual_spec: &str, when: Option<&str>) -> Self {
        let spec = Self::parse(virtual_spec);
        if spec.name.is_none() {
            panic!("provides requires a named virtual spec");
        }
        self.recipe.provides.push(ProvideDecl {
            virtual_spec: spec,
            when: Self::parse_when(when),
        });
        self
    }

    pub fn build(self) -> PackageRecipe {
        self.recipe
    }
}

/// A [`PackageRepository`] backed by an in-memory table, used by tests and
/// by embedders that load recipes up front. Provider order for a virtual
/// follows recipe registration order, which keeps repeated runs
/// deterministic.
#[derive(Default)]
pub struct InMemoryRepository {
    recipes: IndexMap<String, PackageRecipe>,
    virtuals: IndexMap<String, Vec<String>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, recipe: PackageRecipe) {
        for provide in &recipe.provides {
            let virtual_name = provide
                .virtual_spec
                .name
                .clone()
                .unwrap_or_else(|| unreachable!("provides specs are validated at build time"));
            let providers = self.virtuals.entry(virtual_name).or_default();
            if !providers.contains(&recipe.name) {
                providers.push(recipe.name.clone());
            }
        }
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.virtuals.contains_key(name)
    }
}

impl PackageRepository for InMemoryRepository {
    fn get_recipe(&self, name: &str) -> Option<&PackageRecipe> {
        self.recipes.get(name)
    }

    fn providers_of(&self, virtual_name: &str) -> Vec<&str> {
        self.virtuals
            .get(virtual_name)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deptype_sets() {
        let set = DepTypeSet::from_names("build,link");
        assert!(set.contains(DepType::Build));
        assert!(!set.contains(DepType::Run));
        assert!(!set.is_build_only());
        assert!(DepTypeSet::new(&[DepType::Build]).is_build_only());
        assert_eq!(set.to_string(), "build,link");
    }

    #[test]
    fn builder_and_virtual_registration() {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("mpich")
                .version("4.1")
                .provides("mpi@3")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("openmpi")
                .version("4.1.5")
                .provides("mpi@3")
                .build(),
        );

        assert!(repo.is_virtual("mpi"));
        assert_eq!(repo.providers_of("mpi"), vec!["mpich", "openmpi"]);
        assert!(repo.get_recipe("mpich").is_some());
        assert!(repo.get_recipe("mpi").is_none());
    }
}
