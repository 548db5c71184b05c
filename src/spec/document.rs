//! A serialized mirror of a [`ConcreteSpec`], the interchange format for
//! lockfiles and installation records.
//!
//! The document is self-verifying: node hashes are stored alongside the
//! attributes they cover, and [`SpecDocument::to_concrete`] recomputes
//! every hash while rebuilding the DAG, rejecting documents whose contents
//! have drifted from their identities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::materialize::{
    node_hash, ConcreteCompiler, ConcreteEdge, ConcreteNode, ConcreteSpec, DagHash,
};
use crate::recipe::{DepType, DepTypeSet};
use crate::spec::{ArchTriple, ExternalInfo, VariantValue};
use crate::version::Version;

/// A malformed or corrupted spec document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("dependency `{name}/{hash}` of `{package}` does not precede it in the document")]
    MissingDependency {
        package: String,
        name: String,
        hash: String,
    },

    #[error("stored hash of `{package}` is `{stored}` but its contents hash to `{computed}`")]
    HashMismatch {
        package: String,
        stored: String,
        computed: String,
    },

    #[error("unknown dependency type `{deptype}` on `{package}`")]
    UnknownDepType { package: String, deptype: String },

    #[error("root index {root} is out of bounds")]
    BadRoot { root: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerDocument {
    pub name: String,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDocument {
    pub name: String,
    /// The dependency's `dag_hash`; together with `name` it identifies the
    /// child node within the document.
    pub hash: String,
    pub deptypes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: CompilerDocument,
    pub arch: ArchTriple,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyDocument>,
    pub hash: String,
}

/// The document form of a whole concrete DAG, nodes in leaves-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDocument {
    pub root: usize,
    pub nodes: Vec<NodeDocument>,
}

impl SpecDocument {
    pub fn from_concrete(concrete: &ConcreteSpec) -> Self {
        let nodes = concrete
            .nodes()
            .iter()
            .map(|node| NodeDocument {
                name: node.name.clone(),
                version: node.version.clone(),
                variants: node.variants.clone(),
                compiler: CompilerDocument {
                    name: node.compiler.name.clone(),
                    version: node.compiler.version.clone(),
                },
                arch: node.arch.clone(),
                external: node.external.as_ref().map(|e| ExternalDocument {
                    path: e.path.clone(),
                    module: e.module.clone(),
                }),
                dependencies: node
                    .edges
                    .iter()
                    .map(|edge| {
                        let child = &concrete.nodes()[edge.child];
                        DependencyDocument {
                            name: child.name.clone(),
                            hash: child.hash.to_string(),
                            deptypes: edge
                                .deptypes
                                .names()
                                .iter()
                                .map(|n| n.to_string())
                                .collect(),
                            virtual_of: edge.virtual_name.clone(),
                        }
                    })
                    .collect(),
                hash: node.hash.to_string(),
            })
            .collect();
        SpecDocument {
            root: concrete.root_index(),
            nodes,
        }
    }

    /// Rebuilds the [`ConcreteSpec`], recomputing and checking every hash.
    pub fn to_concrete(&self) -> Result<ConcreteSpec, DocumentError> {
        if self.root >= self.nodes.len() {
            return Err(DocumentError::BadRoot { root: self.root });
        }
        let mut by_identity: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        let mut nodes: Vec<ConcreteNode> = Vec::with_capacity(self.nodes.len());

        for doc in &self.nodes {
            let mut edges = Vec::with_capacity(doc.dependencies.len());
            for dep in &doc.dependencies {
                let child = *by_identity
                    .get(&(dep.name.as_str(), dep.hash.as_str()))
                    .ok_or_else(|| DocumentError::MissingDependency {
                        package: doc.name.clone(),
                        name: dep.name.clone(),
                        hash: dep.hash.clone(),
                    })?;
                let mut types = Vec::with_capacity(dep.deptypes.len());
                for t in &dep.deptypes {
                    types.push(match t.as_str() {
                        "build" => DepType::Build,
                        "link" => DepType::Link,
                        "run" => DepType::Run,
                        "test" => DepType::Test,
                        other => {
                            return Err(DocumentError::UnknownDepType {
                                package: doc.name.clone(),
                                deptype: other.to_string(),
                            });
                        }
                    });
                }
                edges.push(ConcreteEdge {
                    child,
                    deptypes: DepTypeSet::new(&types),
                    virtual_name: dep.virtual_of.clone(),
                });
            }

            let compiler = ConcreteCompiler {
                name: doc.compiler.name.clone(),
                version: doc.compiler.version.clone(),
            };
            let external = doc.external.as_ref().map(|e| ExternalInfo {
                path: e.path.clone(),
                module: e.module.clone(),
            });
            let children: Vec<(String, DagHash, DepTypeSet)> = edges
                .iter()
                .map(|e| {
                    let child = &nodes[e.child];
                    (child.name.clone(), child.hash.clone(), e.deptypes)
                })
                .collect();
            let computed = node_hash(
                &doc.name,
                &doc.version,
                &doc.variants,
                &compiler,
                &doc.arch,
                external.as_ref(),
                &children,
            );
            if computed.as_str() != doc.hash {
                return Err(DocumentError::HashMismatch {
                    package: doc.name.clone(),
                    stored: doc.hash.clone(),
                    computed: computed.to_string(),
                });
            }

            by_identity.insert((doc.name.as_str(), doc.hash.as_str()), nodes.len());
            nodes.push(ConcreteNode {
                name: doc.name.clone(),
                version: doc.version.clone(),
                variants: doc.variants.clone(),
                compiler,
                arch: doc.arch.clone(),
                external,
                edges,
                hash: computed,
            });
        }

        Ok(ConcreteSpec::from_parts(nodes, self.root))
    }

    /// Checks the document's integrity without keeping the result.
    pub fn verify(&self) -> Result<(), DocumentError> {
        self.to_concrete().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::FactBase;
    use crate::policy::Preferences;
    use crate::recipe::{InMemoryRepository, PackageRecipe};
    use crate::solver::Solver;
    use crate::spec::Spec;
    use crate::ConcretizeOptions;

    fn concrete() -> ConcreteSpec {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("1.0")
                .variant_bool("shared", true)
                .depends_on("zlib@1.2:")
                .build(),
        );
        repo.add(PackageRecipe::builder("zlib").version("1.3").build());
        let facts = FactBase::build(&Spec::parse("app").unwrap(), &repo).unwrap();
        let prefs = Preferences::default();
        let options = ConcretizeOptions::default();
        let graph = Solver::new(&facts, &prefs, None, &options)
            .solve()
            .unwrap();
        crate::materialize::materialize(&graph)
    }

    #[test]
    fn json_round_trip() {
        let original = concrete();
        let doc = SpecDocument::from_concrete(&original);
        let json = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: SpecDocument = serde_json::from_str(&json).unwrap();
        let rebuilt = parsed.to_concrete().unwrap();
        assert_eq!(rebuilt, original);
        assert_eq!(rebuilt.dag_hash(), original.dag_hash());
    }

    #[test]
    fn tampered_attribute_is_rejected() {
        let mut doc = SpecDocument::from_concrete(&concrete());
        doc.nodes[0].version = Version::parse("9.9").unwrap();
        let err = doc.verify().unwrap_err();
        assert!(matches!(err, DocumentError::HashMismatch { .. }));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let mut doc = SpecDocument::from_concrete(&concrete());
        let root = doc.root;
        doc.nodes[root].dependencies[0].hash = "0".repeat(64);
        let err = doc.verify().unwrap_err();
        assert!(matches!(err, DocumentError::MissingDependency { .. }));
    }
}
