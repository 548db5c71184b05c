//! Preference and default policy: deterministic tie-break ordering among
//! otherwise equally valid solutions.
//!
//! Ranks are additive weights in the solver's objective function. They are
//! monotonic by construction: a preference can reorder feasible choices but
//! never adds or removes one, because the solver enumerates every feasible
//! candidate regardless of rank.

use indexmap::IndexMap;

use crate::facts::{FactBase, PackageFacts};
use crate::recipe::VariantDecl;
use crate::spec::{CompilerSpec, Spec, VariantValue};
use crate::version::{Version, VersionList};

/// Structural penalty for every duplicated-name node admitted through the
/// escape valve; keeps graphs minimal.
pub const DUPLICATE_PENALTY: u64 = 1_000;

/// Penalty for assigning a compiler other than the one explicitly
/// requested somewhere on the node's constraints.
pub const COMPILER_MISMATCH_PENALTY: u64 = 500;

/// Penalty for a target other than the requested/platform default.
pub const TARGET_MISMATCH_PENALTY: u64 = 100;

/// Discount (subtracted) when a node can be reused from the installed
/// database.
pub const REUSE_DISCOUNT: u64 = 50;

/// A compiler known to the site, with the targets it can generate code
/// for (`None` = all platform targets).
#[derive(Debug, Clone)]
pub struct CompilerEntry {
    pub spec: CompilerSpec,
    pub supported_targets: Option<Vec<String>>,
}

impl CompilerEntry {
    pub fn new(name: &str, version: &str) -> Self {
        let version = match Version::parse(version) {
            Ok(v) => v,
            Err(e) => panic!("malformed compiler version: {e}"),
        };
        Self {
            spec: CompilerSpec {
                name: name.to_string(),
                versions: VersionList::single(version),
            },
            supported_targets: None,
        }
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.supported_targets = Some(targets.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn supports_target(&self, target: &str) -> bool {
        self.supported_targets
            .as_ref()
            .map_or(true, |ts| ts.iter().any(|t| t == target))
    }
}

/// The host platform: its operating system and the microarchitecture
/// targets it can run, ordered generic to specific.
#[derive(Debug, Clone)]
pub struct Platform {
    pub name: String,
    pub os: String,
    pub targets: Vec<String>,
    pub default_target: String,
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            name: "test".to_string(),
            os: "debian6".to_string(),
            targets: vec!["x86_64".to_string(), "x86_64_v3".to_string()],
            default_target: "x86_64".to_string(),
        }
    }
}

impl Platform {
    /// Position in the generic-to-specific order; unknown targets are not
    /// usable on this platform.
    pub fn target_index(&self, target: &str) -> Option<usize> {
        self.targets.iter().position(|t| t == target)
    }
}

/// A pre-existing installation the solver may select instead of building.
#[derive(Debug, Clone)]
pub struct ExternalEntry {
    /// What the external is: must pin at least name and version.
    pub spec: Spec,
    pub path: Option<String>,
    pub module: Option<String>,
}

/// Site preference data, immutable for the duration of a concretization
/// run. The four rank functions feed the solver's objective; everything
/// else describes what exists on the site (compilers, platform, externals).
#[derive(Debug, Clone)]
pub struct Preferences {
    /// Per-package preferred versions, most preferred first.
    pub versions: IndexMap<String, Vec<Version>>,
    /// Per-package preferred variant values.
    pub variants: IndexMap<String, IndexMap<String, VariantValue>>,
    /// Per-virtual preferred provider order.
    pub providers: IndexMap<String, Vec<String>>,
    /// Compiler name order, most preferred first.
    pub compiler_order: Vec<String>,
    pub compilers: Vec<CompilerEntry>,
    pub platform: Platform,
    pub externals: Vec<ExternalEntry>,
    /// Prefer reusing installed specs when an installed database is given.
    pub reuse: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            versions: IndexMap::new(),
            variants: IndexMap::new(),
            providers: IndexMap::new(),
            compiler_order: vec!["gcc".to_string(), "clang".to_string()],
            compilers: vec![
                CompilerEntry::new("gcc", "12.3.0"),
                CompilerEntry::new("clang", "15.0.0"),
            ],
            platform: Platform::default(),
            externals: Vec::new(),
            reuse: true,
        }
    }
}

impl Preferences {
    pub fn prefer_version(&mut self, package: &str, version: &str) {
        let version = match Version::parse(version) {
            Ok(v) => v,
            Err(e) => panic!("malformed preferred version: {e}"),
        };
        self.versions
            .entry(package.to_string())
            .or_default()
            .push(version);
    }

    pub fn prefer_variant(&mut self, package: &str, variant: &str, value: VariantValue) {
        self.variants
            .entry(package.to_string())
            .or_default()
            .insert(variant.to_string(), value);
    }

    pub fn prefer_providers(&mut self, virtual_name: &str, providers: &[&str]) {
        self.providers.insert(
            virtual_name.to_string(),
            providers.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Lower is more preferred. Versions on the preference list rank by
    /// list position; unlisted but declared versions rank after all listed
    /// ones, newest first.
    pub fn version_rank(&self, package: &str, version: &Version, facts: &PackageFacts) -> u64 {
        let listed = self.versions.get(package);
        if let Some(pos) = listed.and_then(|vs| vs.iter().position(|v| v == version)) {
            return pos as u64;
        }
        let base = listed.map_or(0, Vec::len) as u64;
        let pos = facts
            .sorted_versions
            .iter()
            .position(|v| v == version)
            .unwrap_or(facts.sorted_versions.len());
        base + pos as u64
    }

    /// 0 when `value` is the preferred (or declared-default) value, 1
    /// otherwise.
    pub fn variant_rank(&self, package: &str, decl: &VariantDecl, value: &VariantValue) -> u64 {
        let preferred = self
            .variants
            .get(package)
            .and_then(|m| m.get(&decl.name))
            .unwrap_or(&decl.default);
        u64::from(value != preferred)
    }

    /// Rank of a provider for a virtual: preference-list position first,
    /// then repository order.
    pub fn provider_rank(&self, virtual_name: &str, provider: &str, facts: &FactBase) -> u64 {
        let listed = self.providers.get(virtual_name);
        if let Some(pos) = listed.and_then(|ps| ps.iter().position(|p| p == provider)) {
            return pos as u64;
        }
        let base = listed.map_or(0, Vec::len) as u64;
        let pos = facts
            .providers_of(virtual_name)
            .iter()
            .position(|p| p == provider)
            .unwrap_or(usize::MAX >> 1);
        base + pos as u64
    }

    /// Rank of a compiler by site order, then by newest version.
    pub fn compiler_rank(&self, compiler: &CompilerSpec) -> u64 {
        let name_rank = self
            .compiler_order
            .iter()
            .position(|n| *n == compiler.name)
            .unwrap_or(self.compiler_order.len()) as u64;
        let version_rank = self
            .ordered_compilers()
            .iter()
            .position(|c| c.spec.name == compiler.name && c.spec.versions == compiler.versions)
            .unwrap_or(self.compilers.len()) as u64;
        name_rank * 100 + version_rank
    }

    /// Declared versions of `package` in preference order: the preference
    /// list first (restricted to versions that exist), then the remaining
    /// declared versions newest first.
    pub fn ordered_versions(&self, package: &str, facts: &PackageFacts) -> Vec<Version> {
        let mut out: Vec<Version> = Vec::with_capacity(facts.sorted_versions.len());
        if let Some(listed) = self.versions.get(package) {
            for v in listed {
                if facts.sorted_versions.contains(v) && !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        for v in &facts.sorted_versions {
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
        out
    }

    /// Providers of `virtual_name` in preference order.
    pub fn ordered_providers(&self, virtual_name: &str, facts: &FactBase) -> Vec<String> {
        let known = facts.providers_of(virtual_name);
        let mut out: Vec<String> = Vec::with_capacity(known.len());
        if let Some(listed) = self.providers.get(virtual_name) {
            for p in listed {
                if known.contains(p) && !out.contains(p) {
                    out.push(p.clone());
                }
            }
        }
        for p in known {
            if !out.contains(p) {
                out.push(p.clone());
            }
        }
        out
    }

    /// Site compilers in preference order (site order, then newest first
    /// within a name).
    pub fn ordered_compilers(&self) -> Vec<&CompilerEntry> {
        let mut out: Vec<&CompilerEntry> = self.compilers.iter().collect();
        out.sort_by(|a, b| {
            let a_name = self
                .compiler_order
                .iter()
                .position(|n| *n == a.spec.name)
                .unwrap_or(self.compiler_order.len());
            let b_name = self
                .compiler_order
                .iter()
                .position(|n| *n == b.spec.name)
                .unwrap_or(self.compiler_order.len());
            a_name
                .cmp(&b_name)
                .then_with(|| b.spec.versions.as_single().cmp(&a.spec.versions.as_single()))
        });
        out
    }

    /// The value to try first for a variant on `package`.
    pub fn preferred_variant_value(&self, package: &str, decl: &VariantDecl) -> VariantValue {
        self.variants
            .get(package)
            .and_then(|m| m.get(&decl.name))
            .cloned()
            .unwrap_or_else(|| decl.default.clone())
    }

    /// Externals whose spec names `package`.
    pub fn externals_for(&self, package: &str) -> Vec<&ExternalEntry> {
        self.externals
            .iter()
            .filter(|e| e.spec.name.as_deref() == Some(package))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::PackageRecipe;
    use crate::spec::Spec;

    fn facts_for(recipe: PackageRecipe) -> FactBase {
        let mut repo = crate::recipe::InMemoryRepository::new();
        let root = Spec::named(recipe.name.clone());
        repo.add(recipe);
        FactBase::build(&root, &repo).unwrap()
    }

    #[test]
    fn version_preference_reorders_but_keeps_all() {
        let facts = facts_for(
            PackageRecipe::builder("lib")
                .version("1.0")
                .version("1.1")
                .version("2.0")
                .build(),
        );
        let mut prefs = Preferences::default();
        prefs.prefer_version("lib", "1.1");

        let pkg = facts.package("lib").unwrap();
        let ordered = prefs.ordered_versions("lib", pkg);
        let texts: Vec<String> = ordered.iter().map(|v| v.to_string()).collect();
        assert_eq!(texts, ["1.1", "2.0", "1.0"]);

        let v11 = Version::parse("1.1").unwrap();
        let v20 = Version::parse("2.0").unwrap();
        assert!(prefs.version_rank("lib", &v11, pkg) < prefs.version_rank("lib", &v20, pkg));
    }

    #[test]
    fn provider_order_follows_preferences() {
        let mut repo = crate::recipe::InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("1.0")
                .depends_on("mpi")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("openmpi")
                .version("4.1")
                .provides("mpi")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("mpich")
                .version("4.1")
                .provides("mpi")
                .build(),
        );
        let facts = FactBase::build(&Spec::named("app"), &repo).unwrap();

        let mut prefs = Preferences::default();
        prefs.prefer_providers("mpi", &["mpich"]);
        assert_eq!(prefs.ordered_providers("mpi", &facts), ["mpich", "openmpi"]);
        assert!(
            prefs.provider_rank("mpi", "mpich", &facts)
                < prefs.provider_rank("mpi", "openmpi", &facts)
        );
    }

    #[test]
    fn compiler_order() {
        let prefs = Preferences::default();
        let ordered = prefs.ordered_compilers();
        assert_eq!(ordered[0].spec.name, "gcc");
        assert!(prefs.compiler_rank(&ordered[0].spec) < prefs.compiler_rank(&ordered[1].spec));
    }
}
