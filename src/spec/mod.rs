//! The spec model: a node in a dependency DAG, either a partially
//! constrained request (abstract) or a fully determined package (concrete).
//!
//! Two operations tie the whole engine together: [`Spec::satisfies`], the
//! structural "meets every constraint of" check, and [`Spec::constrain`],
//! which computes the most specific spec satisfying two sets of constraints
//! or fails when their intersection is empty. `when=` predicates on
//! dependencies, conflicts and provisions are themselves specs without a
//! name, evaluated against the declaring node with `satisfies`.

mod arch;
mod parse;
mod variant;

pub mod document;

use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;

pub use arch::{Arch, ArchTriple};
pub use variant::{VariantDomain, VariantValue};

use crate::error::{ParseError, UnsatisfiableSpecError};
use crate::version::VersionList;

/// A compiler request: name plus version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerSpec {
    pub name: String,
    pub versions: VersionList,
}

impl CompilerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: VersionList::any(),
        }
    }

    pub fn satisfies(&self, other: &CompilerSpec) -> bool {
        self.name == other.name && self.versions.satisfies(&other.versions)
    }
}

impl Display for CompilerSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        Ok(())
    }
}

/// Marks a spec as pre-existing outside the package manager. External nodes
/// are leaves: they still satisfy version/variant constraints but are never
/// built and contribute no sub-solving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalInfo {
    pub path: Option<String>,
    pub module: Option<String>,
}

/// A package request and the constraints attached to it.
///
/// `name` is `None` for anonymous constraint specs such as `when=`
/// predicates (`+feature`, `@2:`), which constrain whatever node they are
/// evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spec {
    pub name: Option<String>,
    pub versions: VersionList,
    pub variants: IndexMap<String, VariantValue>,
    pub compiler: Option<CompilerSpec>,
    pub arch: Arch,
    /// Constraints on dependencies, from `^dep` syntax. These constrain the
    /// node with the matching name anywhere below this spec.
    pub dependencies: Vec<Spec>,
    pub external: Option<ExternalInfo>,
}

impl Spec {
    /// A spec constraining nothing but the package name.
    pub fn named(name: impl Into<String>) -> Self {
        Spec {
            name: Some(name.into()),
            ..Spec::default()
        }
    }

    /// Parses the abstract-spec grammar, e.g.
    /// `app@1.2:%gcc@12+shared lang=c,cxx arch=linux-ubuntu22-x86_64 ^zlib@1.3:`.
    /// Anonymous constraint specs (no leading name) are accepted.
    pub fn parse(text: &str) -> Result<Spec, ParseError> {
        parse::parse_spec(text)
    }

    /// The name, or a placeholder for anonymous specs (display/diagnostics).
    pub fn name_or_anon(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Structural satisfaction: does `self` meet every constraint `other`
    /// expresses? Reflexive, and consistent with [`Self::constrain`]:
    /// `a.satisfies(b)` implies `a.constrain(b)` succeeds.
    pub fn satisfies(&self, other: &Spec) -> bool {
        if let Some(other_name) = &other.name {
            if self.name.as_ref() != Some(other_name) {
                return false;
            }
        }
        if !self.versions.satisfies(&other.versions) {
            return false;
        }
        for (name, constraint) in &other.variants {
            match self.variants.get(name) {
                Some(value) if value.satisfies(constraint) => {}
                _ => return false,
            }
        }
        if let Some(other_compiler) = &other.compiler {
            match &self.compiler {
                Some(compiler) if compiler.satisfies(other_compiler) => {}
                _ => return false,
            }
        }
        if !self.arch.satisfies(&other.arch) {
            return false;
        }
        other.dependencies.iter().all(|want| {
            self.dependencies
                .iter()
                .any(|have| have.name == want.name && have.satisfies(want))
        })
    }

    /// The most specific spec satisfying both `self` and `other`, or an
    /// error naming the conflicting attribute when the intersection is
    /// empty.
    pub fn constrain(&self, other: &Spec) -> Result<Spec, UnsatisfiableSpecError> {
        let name = match (&self.name, &other.name) {
            (Some(a), Some(b)) if a != b => {
                return Err(UnsatisfiableSpecError::new(format!(
                    "cannot constrain `{a}` by a spec named `{b}`"
                )));
            }
            (Some(a), _) => Some(a.clone()),
            (None, b) => b.clone(),
        };
        let subject = name.as_deref().unwrap_or("<anonymous>");

        let versions = self.versions.intersect(&other.versions);
        if versions.is_empty() {
            return Err(UnsatisfiableSpecError::new(format!(
                "`{subject}` requires version @{} which is incompatible with @{}",
                self.versions, other.versions
            )));
        }

        let mut variants = self.variants.clone();
        for (vname, value) in &other.variants {
            match variants.get(vname) {
                None => {
                    variants.insert(vname.clone(), value.clone());
                }
                Some(existing) => match existing.constrain(value) {
                    Some(merged) => {
                        variants.insert(vname.clone(), merged);
                    }
                    None => {
                        return Err(UnsatisfiableSpecError::new(format!(
                            "`{subject}` requires both {} and {}",
                            existing.display_with_name(vname),
                            value.display_with_name(vname)
                        )));
                    }
                },
            }
        }

        let compiler = match (&self.compiler, &other.compiler) {
            (Some(a), Some(b)) => {
                if a.name != b.name {
                    return Err(UnsatisfiableSpecError::new(format!(
                        "`{subject}` requires both {a} and {b}"
                    )));
                }
                let versions = a.versions.intersect(&b.versions);
                if versions.is_empty() {
                    return Err(UnsatisfiableSpecError::new(format!(
                        "`{subject}` requires both {a} and {b}"
                    )));
                }
                Some(CompilerSpec {
                    name: a.name.clone(),
                    versions,
                })
            }
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        };

        let arch = self.arch.constrain(&other.arch).ok_or_else(|| {
            UnsatisfiableSpecError::new(format!(
                "`{subject}` requires both {} and {}",
                self.arch, other.arch
            ))
        })?;

        let external = match (&self.external, &other.external) {
            (Some(a), Some(b)) if a != b => {
                return Err(UnsatisfiableSpecError::new(format!(
                    "`{subject}` is marked external in two different ways"
                )));
            }
            (Some(a), _) => Some(a.clone()),
            (None, b) => b.clone(),
        };

        let mut dependencies = self.dependencies.clone();
        for want in &other.dependencies {
            match dependencies
                .iter_mut()
                .find(|have| have.name == want.name)
            {
                Some(have) => *have = have.constrain(want)?,
                None => dependencies.push(want.clone()),
            }
        }

        Ok(Spec {
            name,
            versions,
            variants,
            compiler,
            arch,
            dependencies,
            external,
        })
    }

    /// Whether every attribute is pinned down (dependencies aside; full DAG
    /// concreteness is the materializer's business).
    pub fn is_concrete(&self) -> bool {
        self.name.is_some()
            && self.versions.as_single().is_some()
            && self
                .compiler
                .as_ref()
                .is_some_and(|c| c.versions.as_single().is_some())
            && self.arch.is_concrete()
    }
}

impl Display for Spec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name}")?;
        }
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        if let Some(compiler) = &self.compiler {
            write!(f, "{compiler}")?;
        }
        // Canonical form: variants in name order, booleans run together,
        // key-values space separated.
        let mut names: Vec<&String> = self.variants.keys().collect();
        names.sort();
        for vname in &names {
            if let VariantValue::Bool(_) = self.variants[*vname] {
                write!(f, "{}", self.variants[*vname].display_with_name(vname))?;
            }
        }
        for vname in &names {
            match &self.variants[*vname] {
                VariantValue::Bool(_) => {}
                value => write!(f, " {}", value.display_with_name(vname))?,
            }
        }
        if !self.arch.is_unconstrained() {
            write!(f, " {}", self.arch)?;
        }
        for dep in &self.dependencies {
            write!(f, " ^{dep}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(text: &str) -> Spec {
        Spec::parse(text).unwrap()
    }

    #[test]
    fn satisfies_is_reflexive() {
        for text in [
            "zlib",
            "zlib@1.2.13",
            "app@2:%gcc@12+shared lang=c,cxx",
            "app ^zlib@1.2:",
        ] {
            let s = spec(text);
            assert!(s.satisfies(&s), "{text} should satisfy itself");
        }
    }

    #[test]
    fn version_subset_satisfaction() {
        assert!(spec("lib@1.1").satisfies(&spec("lib@1.0:1.2")));
        assert!(!spec("lib@1.3").satisfies(&spec("lib@1.0:1.2")));
        assert!(!spec("lib").satisfies(&spec("lib@1.0:1.2")));
    }

    #[test]
    fn anonymous_predicates() {
        let node = spec("pkg@2.1+feature");
        assert!(node.satisfies(&spec("+feature")));
        assert!(node.satisfies(&spec("@2:")));
        assert!(!node.satisfies(&spec("~feature")));
    }

    #[test]
    fn constrain_merges_and_detects_conflicts() {
        let merged = spec("lib@1.0:1.2").constrain(&spec("lib@1.1:2.0")).unwrap();
        assert_eq!(merged.versions, crate::version::VersionList::parse("1.1:1.2").unwrap());

        let err = spec("lib@:1.0").constrain(&spec("lib@2:")).unwrap_err();
        assert!(err.to_string().contains("incompatible"));

        let err = spec("pkg+a").constrain(&spec("pkg~a")).unwrap_err();
        assert!(err.to_string().contains("+a"));
        assert!(err.to_string().contains("~a"));
    }

    #[test]
    fn constrain_consistent_with_satisfies() {
        let a = spec("pkg@1.0:2.0+x");
        let b = spec("pkg@1.5:3.0");
        let merged = a.constrain(&b).unwrap();
        assert!(merged.satisfies(&a));
        assert!(merged.satisfies(&b));
    }

    #[test]
    fn dependency_constraints_merge_by_name() {
        let a = spec("app ^lib@1.0:");
        let b = spec("app ^lib@:2.0 ^zlib");
        let merged = a.constrain(&b).unwrap();
        assert_eq!(merged.dependencies.len(), 2);
        assert!(merged.dependencies[0].satisfies(&spec("lib@1.0:2.0")));
    }

    #[test]
    fn canonical_display() {
        let s = spec("app@1.2 %gcc@12 +shared ~static lang=c,cxx arch=linux-ubuntu22-x86_64 ^zlib@1.3:");
        insta::assert_snapshot!(
            s.to_string(),
            @"app@1.2%gcc@12+shared~static lang=c,cxx arch=linux-ubuntu22-x86_64 ^zlib@1.3:"
        );
    }
}
