//! The constraint fact base: the transitive closure of packages possibly
//! relevant to one abstract root spec, with every package's declared
//! versions, variant domains, dependency conditions, conflicts and virtual
//! provisions collected as ground data for the solver.
//!
//! The same repository state and root spec always produce the same fact
//! base, in the same iteration order: the closure is a breadth-first walk
//! that expands declarations in recipe order and stores everything in
//! insertion-ordered maps.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::error::ConcretizeError;
use crate::recipe::{PackageRecipe, VariantDecl};
use crate::spec::Spec;
use crate::version::Version;
use crate::PackageRepository;

/// Ground facts about a single package.
#[derive(Debug, Clone)]
pub struct PackageFacts {
    pub recipe: PackageRecipe,
    /// Declared versions, newest first. Candidate enumeration walks this
    /// order before preferences reorder it.
    pub sorted_versions: Vec<Version>,
}

impl PackageFacts {
    fn new(recipe: &PackageRecipe) -> Self {
        let mut sorted_versions = recipe.versions.clone();
        sorted_versions.sort();
        sorted_versions.reverse();
        Self {
            recipe: recipe.clone(),
            sorted_versions,
        }
    }

    /// The variant declarations applicable to a node with the given
    /// (partial) spec: guarded declarations only count when their `when`
    /// predicate is met.
    pub fn active_variants<'a>(&'a self, node: &Spec) -> impl Iterator<Item = &'a VariantDecl> {
        let node = node.clone();
        self.recipe
            .variants
            .iter()
            .filter(move |decl| decl.when.as_ref().map_or(true, |when| node.satisfies(when)))
    }
}

/// The fact base for one concretization run. Read-only once built.
#[derive(Debug, Clone)]
pub struct FactBase {
    root: Spec,
    packages: IndexMap<String, PackageFacts>,
    /// virtual name -> provider package names, in repository preference
    /// order, restricted to providers that exist in the repository.
    providers: IndexMap<String, Vec<String>>,
    /// How each package was first reached from the root, for diagnostics.
    reached_via: IndexMap<String, Vec<String>>,
}

impl FactBase {
    /// Computes the closure of packages reachable from `root` through any
    /// possible dependency edge, including every provider of any virtual
    /// edge encountered.
    pub fn build(root: &Spec, repo: &dyn PackageRepository) -> Result<FactBase, ConcretizeError> {
        let root_name = root.name.clone().ok_or_else(|| {
            ConcretizeError::Parse(crate::error::ParseError::new(
                root.to_string(),
                "the root spec must name a package",
                0,
            ))
        })?;

        let mut facts = FactBase {
            root: root.clone(),
            packages: IndexMap::new(),
            providers: IndexMap::new(),
            reached_via: IndexMap::new(),
        };

        let mut queue: VecDeque<(String, Vec<String>)> = VecDeque::new();
        queue.push_back((root_name, Vec::new()));
        // Constraints attached to the root request also name packages that
        // must exist.
        for dep in &root.dependencies {
            if let Some(name) = &dep.name {
                queue.push_back((name.clone(), vec![facts.root.name_or_anon().to_string()]));
            }
        }

        while let Some((name, chain)) = queue.pop_front() {
            if facts.packages.contains_key(&name) || facts.providers.contains_key(&name) {
                continue;
            }
            if let Some(recipe) = repo.get_recipe(&name) {
                tracing::debug!(package = %name, "adding package facts");
                facts.packages.insert(name.clone(), PackageFacts::new(recipe));
                facts.reached_via.insert(name.clone(), chain.clone());

                let mut child_chain = chain.clone();
                child_chain.push(name.clone());
                for dep in &recipe.dependencies {
                    let target = dep
                        .spec
                        .name
                        .as_deref()
                        .unwrap_or_else(|| unreachable!("dependency specs are named"));
                    queue.push_back((target.to_string(), child_chain.clone()));
                    // `^` constraints inside the dependency spec name
                    // packages too.
                    for nested in &dep.spec.dependencies {
                        if let Some(nested_name) = &nested.name {
                            queue.push_back((nested_name.clone(), child_chain.clone()));
                        }
                    }
                }
            } else {
                let provider_names = repo.providers_of(&name);
                if provider_names.is_empty() {
                    return Err(ConcretizeError::UnknownPackage {
                        name,
                        required_by: chain,
                    });
                }
                tracing::debug!(virtual_name = %name, providers = provider_names.len(), "adding virtual facts");
                let providers: Vec<String> =
                    provider_names.iter().map(|p| p.to_string()).collect();
                for provider in &providers {
                    queue.push_back((provider.clone(), chain.clone()));
                }
                facts.providers.insert(name.clone(), providers);
                facts.reached_via.insert(name, chain);
            }
        }

        Ok(facts)
    }

    pub fn root(&self) -> &Spec {
        &self.root
    }

    pub fn package(&self, name: &str) -> Option<&PackageFacts> {
        self.packages.get(name)
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn providers_of(&self, virtual_name: &str) -> &[String] {
        self.providers
            .get(virtual_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn packages(&self) -> impl Iterator<Item = (&str, &PackageFacts)> {
        self.packages.iter().map(|(n, f)| (n.as_str(), f))
    }

    /// The chain of package names through which `name` was first reached.
    pub fn chain_to(&self, name: &str) -> Vec<String> {
        let mut chain = self.reached_via.get(name).cloned().unwrap_or_default();
        chain.push(name.to_string());
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{InMemoryRepository, PackageRecipe};

    fn repo() -> InMemoryRepository {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("2.0")
                .depends_on("lib")
                .depends_on("mpi")
                .build(),
        );
        repo.add(PackageRecipe::builder("lib").version("1.1").build());
        repo.add(
            PackageRecipe::builder("mpich")
                .version("4.1")
                .provides("mpi")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("openmpi")
                .version("4.1.5")
                .provides("mpi")
                .build(),
        );
        repo
    }

    #[test]
    fn closure_includes_all_providers() {
        let root = Spec::parse("app").unwrap();
        let facts = FactBase::build(&root, &repo()).unwrap();
        assert!(facts.package("app").is_some());
        assert!(facts.package("lib").is_some());
        assert!(facts.package("mpich").is_some());
        assert!(facts.package("openmpi").is_some());
        assert!(facts.is_virtual("mpi"));
        assert_eq!(facts.providers_of("mpi"), ["mpich", "openmpi"]);
    }

    #[test]
    fn unknown_package_reports_chain() {
        let mut repo = repo();
        repo.add(
            PackageRecipe::builder("broken")
                .version("1.0")
                .depends_on("no-such-package")
                .build(),
        );
        let root = Spec::parse("broken").unwrap();
        let err = FactBase::build(&root, &repo).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no-such-package"), "{message}");
        assert!(message.contains("broken"), "{message}");
    }

    #[test]
    fn deterministic_iteration_order() {
        let root = Spec::parse("app").unwrap();
        let a: Vec<String> = FactBase::build(&root, &repo())
            .unwrap()
            .packages()
            .map(|(n, _)| n.to_string())
            .collect();
        let b: Vec<String> = FactBase::build(&root, &repo())
            .unwrap()
            .packages()
            .map(|(n, _)| n.to_string())
            .collect();
        assert_eq!(a, b);
    }
}
