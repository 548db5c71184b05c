//! Turns a validated assignment into the final immutable [`ConcreteSpec`],
//! computing content-addressed identities bottom up.
//!
//! A node's `dag_hash` covers its own pinned attributes and the `(name,
//! hash)` pairs of its dependencies, sorted, so it is independent of
//! construction order and changes exactly when the node or anything below
//! it changes. Materialization runs after validation; an assignment that
//! cannot be materialized is a programming error and panics.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use crate::recipe::DepTypeSet;
use crate::solver::ResolvedGraph;
use crate::spec::{ArchTriple, CompilerSpec, ExternalInfo, Spec};
use crate::version::{Version, VersionList};

/// The content-addressed identity of a concrete node, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DagHash(String);

impl DagHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The abbreviated form used in human-facing output.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Display for DagHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully pinned compiler assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteCompiler {
    pub name: String,
    pub version: Version,
}

impl Display for ConcreteCompiler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteEdge {
    /// Index into [`ConcreteSpec::nodes`]; always less than the index of
    /// the node holding the edge (leaves come first).
    pub child: usize,
    pub deptypes: DepTypeSet,
    pub virtual_name: Option<String>,
}

/// One fully determined package in a concrete DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteNode {
    pub name: String,
    pub version: Version,
    pub variants: BTreeMap<String, crate::spec::VariantValue>,
    pub compiler: ConcreteCompiler,
    pub arch: ArchTriple,
    pub external: Option<ExternalInfo>,
    pub edges: Vec<ConcreteEdge>,
    pub hash: DagHash,
}

impl ConcreteNode {
    /// The node's attributes as a (concrete) [`Spec`], for matching against
    /// constraints.
    pub fn as_spec(&self) -> Spec {
        Spec {
            name: Some(self.name.clone()),
            versions: VersionList::single(self.version.clone()),
            variants: self
                .variants
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            compiler: Some(CompilerSpec {
                name: self.compiler.name.clone(),
                versions: VersionList::single(self.compiler.version.clone()),
            }),
            arch: self.arch.as_arch(),
            dependencies: Vec::new(),
            external: self.external.clone(),
        }
    }
}

/// The result of concretization: an immutable DAG of concrete nodes in
/// leaves-first order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteSpec {
    nodes: Vec<ConcreteNode>,
    root: usize,
}

impl ConcreteSpec {
    pub fn nodes(&self) -> &[ConcreteNode] {
        &self.nodes
    }

    pub fn root_node(&self) -> &ConcreteNode {
        &self.nodes[self.root]
    }

    pub fn root_index(&self) -> usize {
        self.root
    }

    /// The identity of the whole DAG: the root node's hash, which covers
    /// everything below it.
    pub fn dag_hash(&self) -> &DagHash {
        &self.root_node().hash
    }

    pub fn find(&self, name: &str) -> Option<&ConcreteNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub(crate) fn from_parts(nodes: Vec<ConcreteNode>, root: usize) -> Self {
        ConcreteSpec { nodes, root }
    }
}

impl Display for ConcreteSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_node().as_spec())?;
        for (index, node) in self.nodes.iter().enumerate() {
            if index != self.root {
                write!(f, " ^{}", node.as_spec())?;
            }
        }
        Ok(())
    }
}

/// Computes a node's identity from its pinned attributes and the already
/// computed hashes of its children.
pub(crate) fn node_hash(
    name: &str,
    version: &Version,
    variants: &BTreeMap<String, crate::spec::VariantValue>,
    compiler: &ConcreteCompiler,
    arch: &ArchTriple,
    external: Option<&ExternalInfo>,
    children: &[(String, DagHash, DepTypeSet)],
) -> DagHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("{name}@{version}\n").as_bytes());
    for (vname, value) in variants {
        hasher.update(format!("{}\n", value.display_with_name(vname)).as_bytes());
    }
    hasher.update(format!("%{compiler}\n").as_bytes());
    hasher.update(format!("arch={arch}\n").as_bytes());
    if let Some(external) = external {
        hasher.update(
            format!(
                "external path={} module={}\n",
                external.path.as_deref().unwrap_or("-"),
                external.module.as_deref().unwrap_or("-")
            )
            .as_bytes(),
        );
    }
    let mut sorted: Vec<_> = children.iter().collect();
    sorted.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    for (child_name, child_hash, deptypes) in sorted {
        hasher.update(format!("^{child_name}={child_hash}:{deptypes}\n").as_bytes());
    }
    DagHash(hasher.finalize().to_hex().to_string())
}

/// Builds the [`ConcreteSpec`] for a validated assignment. Panics when the
/// graph is not fully concrete; validation guarantees it is.
pub(crate) fn materialize(graph: &ResolvedGraph) -> ConcreteSpec {
    // Leaves-first order: iterative depth-first postorder from the root.
    let mut order: Vec<usize> = Vec::with_capacity(graph.nodes.len());
    let mut visited = vec![false; graph.nodes.len()];
    let mut stack: Vec<(usize, bool)> = vec![(graph.root, false)];
    while let Some((index, children_done)) = stack.pop() {
        if children_done {
            order.push(index);
            continue;
        }
        if visited[index] {
            continue;
        }
        visited[index] = true;
        stack.push((index, true));
        for edge in &graph.nodes[index].edges {
            if !visited[edge.child] {
                stack.push((edge.child, false));
            }
        }
    }
    assert_eq!(
        order.len(),
        graph.nodes.len(),
        "materializer invariant: every node is reachable from the root"
    );

    let mut position = vec![usize::MAX; graph.nodes.len()];
    let mut nodes: Vec<ConcreteNode> = Vec::with_capacity(order.len());
    for index in order {
        let resolved = &graph.nodes[index];
        let spec = &resolved.spec;
        let name = match &spec.name {
            Some(name) => name.clone(),
            None => panic!("materializer invariant: nodes are named"),
        };
        let version = match spec.versions.as_single() {
            Some(version) => version.clone(),
            None => panic!("materializer invariant: `{name}` has no pinned version"),
        };
        let compiler = match &spec.compiler {
            Some(c) => match c.versions.as_single() {
                Some(version) => ConcreteCompiler {
                    name: c.name.clone(),
                    version: version.clone(),
                },
                None => panic!("materializer invariant: `{name}` has no pinned compiler version"),
            },
            None => panic!("materializer invariant: `{name}` has no compiler"),
        };
        let arch = match (&spec.arch.platform, &spec.arch.os, &spec.arch.target) {
            (Some(platform), Some(os), Some(target)) => ArchTriple {
                platform: platform.clone(),
                os: os.clone(),
                target: target.clone(),
            },
            _ => panic!("materializer invariant: `{name}` has no concrete arch"),
        };
        let variants: BTreeMap<_, _> = spec
            .variants
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut edges: Vec<ConcreteEdge> = resolved
            .edges
            .iter()
            .map(|e| ConcreteEdge {
                child: position[e.child],
                deptypes: e.deptypes,
                virtual_name: e.virtual_name.clone(),
            })
            .collect();
        edges.sort_by(|a, b| nodes[a.child].name.cmp(&nodes[b.child].name));

        let children: Vec<(String, DagHash, DepTypeSet)> = edges
            .iter()
            .map(|e| {
                let child = &nodes[e.child];
                (child.name.clone(), child.hash.clone(), e.deptypes)
            })
            .collect();
        let hash = node_hash(
            &name, &version, &variants, &compiler, &arch,
            resolved.external.as_ref(), &children,
        );

        position[index] = nodes.len();
        nodes.push(ConcreteNode {
            name,
            version,
            variants,
            compiler,
            arch,
            external: resolved.external.clone(),
            edges,
            hash,
        });
    }

    ConcreteSpec {
        root: position[graph.root],
        nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::FactBase;
    use crate::policy::Preferences;
    use crate::recipe::{InMemoryRepository, PackageRecipe};
    use crate::solver::Solver;
    use crate::ConcretizeOptions;

    fn concrete(repo: &InMemoryRepository, root: &str) -> ConcreteSpec {
        let facts = FactBase::build(&Spec::parse(root).unwrap(), repo).unwrap();
        let prefs = Preferences::default();
        let options = ConcretizeOptions::default();
        let graph = Solver::new(&facts, &prefs, None, &options)
            .solve()
            .unwrap();
        materialize(&graph)
    }

    fn diamond_repo() -> InMemoryRepository {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("1.0")
                .depends_on("left")
                .depends_on("right")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("left")
                .version("1.0")
                .depends_on("base")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("right")
                .version("1.0")
                .depends_on("base")
                .build(),
        );
        repo.add(PackageRecipe::builder("base").version("3.1").build());
        repo
    }

    #[test]
    fn leaves_come_first() {
        let concrete = concrete(&diamond_repo(), "app");
        assert_eq!(concrete.nodes().len(), 4);
        for (index, node) in concrete.nodes().iter().enumerate() {
            for edge in &node.edges {
                assert!(edge.child < index, "edge of `{}` points forward", node.name);
            }
        }
        assert_eq!(concrete.root_node().name, "app");
        // The shared leaf appears exactly once.
        let bases = concrete.nodes().iter().filter(|n| n.name == "base").count();
        assert_eq!(bases, 1);
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = concrete(&diamond_repo(), "app");
        let b = concrete(&diamond_repo(), "app");
        assert_eq!(a.dag_hash(), b.dag_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn hash_ripples_to_ancestors_only() {
        let a = concrete(&diamond_repo(), "app");

        let mut repo = diamond_repo();
        repo.add(
            PackageRecipe::builder("right")
                .version("1.1")
                .depends_on("base")
                .build(),
        );
        let b = concrete(&repo, "app");

        let node = |c: &ConcreteSpec, n: &str| c.find(n).unwrap().hash.clone();
        assert_eq!(node(&a, "base"), node(&b, "base"));
        assert_eq!(node(&a, "left"), node(&b, "left"));
        assert_ne!(node(&a, "right"), node(&b, "right"));
        assert_ne!(a.dag_hash(), b.dag_hash());
    }
}
