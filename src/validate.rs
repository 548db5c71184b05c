//! Structural consistency checks over a resolved graph.
//!
//! [`validate`] is pure: it inspects an assignment and reports every
//! violated invariant, mutating nothing. The solver runs it before
//! accepting a completed assignment, and [`crate::concretize`] runs it
//! again as the final acceptance gate, where any violation is a
//! programming error.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;
use thiserror::Error;

use crate::facts::FactBase;
use crate::policy::Preferences;
use crate::recipe::DepType;
use crate::solver::{ResolvedGraph, ResolvedNode};
use crate::spec::Spec;
use crate::{ConcretizeOptions, DuplicatePolicy};

/// One violated invariant of a resolved graph.
#[derive(Debug, Clone, Error)]
pub enum Violation {
    #[error("package `{name}` appears {count} times in the graph")]
    DuplicateName { name: String, count: usize },

    #[error("dependency cycle through {}", names.join(" -> "))]
    Cycle { names: Vec<String> },

    #[error("virtual `{name}` was never resolved to a provider")]
    VirtualNode { name: String },

    #[error("`{name}` is not concrete: {detail}")]
    NotConcrete { name: String, detail: String },

    #[error("`{child}` does not satisfy `{constraint}` required by `{parent}`")]
    UnsatisfiedEdge {
        parent: String,
        child: String,
        constraint: String,
    },

    #[error("`{package}` has no edge for its declared dependency `{dependency}`")]
    MissingDependency { package: String, dependency: String },

    #[error("`{provider}` does not provide `{virtual_name}` as required by `{parent}`")]
    NotAProvider {
        parent: String,
        virtual_name: String,
        provider: String,
    },

    #[error("`{package}` leaves declared variant `{variant}` unset")]
    MissingVariant { package: String, variant: String },

    #[error("`{package}` sets variant `{variant}` outside its declared domain")]
    InvalidVariant { package: String, variant: String },

    #[error("`{package}` violates declared conflict: {conflict}")]
    ConflictTriggered { package: String, conflict: String },

    #[error("link edge `{parent}` -> `{child}` mixes compilers")]
    CompilerMismatch { parent: String, child: String },

    #[error("`{package}` uses compiler `{compiler}` which is not configured")]
    UnknownCompiler { package: String, compiler: String },

    #[error("`{package}` targets `{target}` which the platform cannot run")]
    UnknownTarget { package: String, target: String },

    #[error("`{package}` targets `{target}` which compiler `{compiler}` cannot generate")]
    UnsupportedTarget {
        package: String,
        target: String,
        compiler: String,
    },

    #[error("the resolved root does not satisfy the request `{constraint}`")]
    UnsatisfiedRoot { constraint: String },
}

/// Checks every structural invariant of `graph` and returns all
/// violations found. An empty result means the assignment is a valid
/// concretization of the fact base's root request.
pub fn validate(
    graph: &ResolvedGraph,
    facts: &FactBase,
    prefs: &Preferences,
    options: &ConcretizeOptions,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    check_uniqueness(graph, options, &mut violations);
    check_acyclic(graph, &mut violations);
    for node in &graph.nodes {
        check_node(node, facts, prefs, &mut violations);
    }
    check_edges(graph, facts, &mut violations);
    check_root(graph, facts, &mut violations);
    violations
}

fn name_of(node: &ResolvedNode) -> &str {
    node.spec.name_or_anon()
}

fn check_uniqueness(
    graph: &ResolvedGraph,
    options: &ConcretizeOptions,
    violations: &mut Vec<Violation>,
) {
    let mut seen: indexmap::IndexMap<&str, Vec<usize>> = indexmap::IndexMap::new();
    for (index, node) in graph.nodes.iter().enumerate() {
        seen.entry(name_of(node)).or_default().push(index);
    }
    for (name, indices) in seen {
        if indices.len() <= 1 {
            continue;
        }
        if options.duplicate_policy == DuplicatePolicy::AllowBuildDuplicates {
            // At most one of the same-name nodes may be reachable through
            // an ABI-relevant (link or run) edge.
            let abi_visible = indices
                .iter()
                .filter(|&&index| {
                    graph.nodes.iter().any(|n| {
                        n.edges.iter().any(|e| {
                            e.child == index
                                && (e.deptypes.contains(DepType::Link)
                                    || e.deptypes.contains(DepType::Run))
                        })
                    })
                })
                .count();
            if abi_visible <= 1 {
                continue;
            }
        }
        violations.push(Violation::DuplicateName {
            name: name.to_string(),
            count: indices.len(),
        });
    }
}

fn check_acyclic(graph: &ResolvedGraph, violations: &mut Vec<Violation>) {
    let mut dag: DiGraph<usize, ()> = DiGraph::new();
    let ids: Vec<_> = (0..graph.nodes.len()).map(|i| dag.add_node(i)).collect();
    for (index, node) in graph.nodes.iter().enumerate() {
        for edge in &node.edges {
            dag.add_edge(ids[index], ids[edge.child], ());
        }
    }
    if toposort(&dag, None).is_ok() {
        return;
    }
    for component in tarjan_scc(&dag) {
        if component.len() > 1 {
            violations.push(Violation::Cycle {
                names: component
                    .iter()
                    .map(|id| name_of(&graph.nodes[dag[*id]]).to_string())
                    .collect(),
            });
        }
    }
}

fn check_node(
    node: &ResolvedNode,
    facts: &FactBase,
    prefs: &Preferences,
    violations: &mut Vec<Violation>,
) {
    let name = name_of(node).to_string();
    if facts.is_virtual(&name) {
        violations.push(Violation::VirtualNode { name });
        return;
    }
    if !node.spec.is_concrete() {
        violations.push(Violation::NotConcrete {
            name,
            detail: format!("`{}` leaves attributes open", node.spec),
        });
        return;
    }

    // Compiler and target must be usable on this site.
    let compiler = match &node.spec.compiler {
        Some(compiler) => compiler.clone(),
        None => unreachable!("is_concrete implies a pinned compiler"),
    };
    let entry = prefs
        .compilers
        .iter()
        .find(|e| e.spec.name == compiler.name && e.spec.versions == compiler.versions);
    if entry.is_none() && node.external.is_none() {
        violations.push(Violation::UnknownCompiler {
            package: name.clone(),
            compiler: compiler.to_string(),
        });
    }
    if let Some(target) = &node.spec.arch.target {
        if prefs.platform.target_index(target).is_none() {
            violations.push(Violation::UnknownTarget {
                package: name.clone(),
                target: target.clone(),
            });
        } else if let Some(entry) = entry {
            if !entry.supports_target(target) {
                violations.push(Violation::UnsupportedTarget {
                    package: name.clone(),
                    target: target.clone(),
                    compiler: compiler.to_string(),
                });
            }
        }
    }

    if node.external.is_some() {
        // Externals are taken as found; their recipes do not govern them.
        return;
    }
    let Some(pkg) = facts.package(&name) else {
        return;
    };

    for decl in pkg.active_variants(&node.spec) {
        match node.spec.variants.get(&decl.name) {
            None => violations.push(Violation::MissingVariant {
                package: name.clone(),
                variant: decl.name.clone(),
            }),
            Some(value) if !decl.domain.contains(value) => {
                violations.push(Violation::InvalidVariant {
                    package: name.clone(),
                    variant: decl.name.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for conflict in &pkg.recipe.conflicts {
        let when_holds = conflict
            .when
            .as_ref()
            .map_or(true, |when| node.spec.satisfies(when));
        if when_holds && node.spec.satisfies(&conflict.matches) {
            violations.push(Violation::ConflictTriggered {
                package: name.clone(),
                conflict: conflict.matches.to_string(),
            });
        }
    }
}

fn check_edges(graph: &ResolvedGraph, facts: &FactBase, violations: &mut Vec<Violation>) {
    for parent in &graph.nodes {
        let parent_name = name_of(parent).to_string();
        let Some(pkg) = facts.package(&parent_name) else {
            continue;
        };
        for edge in &parent.edges {
            let child = &graph.nodes[edge.child];
            let child_name = name_of(child).to_string();

            match &edge.virtual_name {
                Some(virtual_name) => {
                    // The bound provider must actually provide the virtual,
                    // at an interface version overlapping every matching
                    // requirement.
                    let Some(provider) = facts.package(&child_name) else {
                        continue;
                    };
                    for decl in &pkg.recipe.dependencies {
                        if decl.spec.name.as_deref() != Some(virtual_name.as_str()) {
                            continue;
                        }
                        if !decl
                            .when
                            .as_ref()
                            .map_or(true, |when| parent.spec.satisfies(when))
                        {
                            continue;
                        }
                        let provides = provider.recipe.provides.iter().any(|p| {
                            p.virtual_spec.name.as_deref() == Some(virtual_name.as_str())
                                && !p
                                    .virtual_spec
                                    .versions
                                    .intersect(&decl.spec.versions)
                                    .is_empty()
                                && p.when
                                    .as_ref()
                                    .map_or(true, |when| child.spec.satisfies(when))
                        });
                        if !provides {
                            violations.push(Violation::NotAProvider {
                                parent: parent_name.clone(),
                                virtual_name: virtual_name.clone(),
                                provider: child_name.clone(),
                            });
                        }
                    }
                }
                None => {
                    for decl in &pkg.recipe.dependencies {
                        if decl.spec.name.as_deref() != Some(child_name.as_str()) {
                            continue;
                        }
                        if !decl
                            .when
                            .as_ref()
                            .map_or(true, |when| parent.spec.satisfies(when))
                        {
                            continue;
                        }
                        let mut constraint = decl.spec.clone();
                        constraint.dependencies.clear();
                        if !child.spec.satisfies(&constraint) {
                            violations.push(Violation::UnsatisfiedEdge {
                                parent: parent_name.clone(),
                                child: child_name.clone(),
                                constraint: constraint.to_string(),
                            });
                        }
                    }
                }
            }

            // ABI rule: linked nodes share one compiler. Externals are
            // exempt; their compiler is nominal.
            if edge.deptypes.contains(DepType::Link)
                && parent.external.is_none()
                && child.external.is_none()
                && parent.spec.compiler != child.spec.compiler
            {
                violations.push(Violation::CompilerMismatch {
                    parent: parent_name.clone(),
                    child: child_name.clone(),
                });
            }
        }

        // Every declared dependency whose guard holds under the node's
        // final attributes must have an edge. Externals are leaves and
        // carry none.
        if parent.external.is_none() {
            for decl in &pkg.recipe.dependencies {
                if !decl
                    .when
                    .as_ref()
                    .map_or(true, |when| parent.spec.satisfies(when))
                {
                    continue;
                }
                let Some(dep_name) = decl.spec.name.as_deref() else {
                    continue;
                };
                let present = if facts.is_virtual(dep_name) {
                    parent
                        .edges
                        .iter()
                        .any(|e| e.virtual_name.as_deref() == Some(dep_name))
                } else {
                    parent
                        .edges
                        .iter()
                        .any(|e| name_of(&graph.nodes[e.child]) == dep_name)
                };
                if !present {
                    violations.push(Violation::MissingDependency {
                        package: parent_name.clone(),
                        dependency: decl.spec.to_string(),
                    });
                }
            }
        }
    }
}

fn check_root(graph: &ResolvedGraph, facts: &FactBase, violations: &mut Vec<Violation>) {
    let root = &graph.nodes[graph.root];
    let mut request = facts.root().clone();
    let nested = std::mem::take(&mut request.dependencies);

    // A virtual root is satisfied by any bound provider; the provider
    // check on the edge covers it.
    let root_is_virtual = request
        .name
        .as_deref()
        .is_some_and(|name| facts.is_virtual(name));
    if !root_is_virtual && !root.spec.satisfies(&request) {
        violations.push(Violation::UnsatisfiedRoot {
            constraint: request.to_string(),
        });
    }

    // `^dep` constraints of the request bind the node of that name
    // anywhere in the graph.
    for mut constraint in nested {
        constraint.dependencies.clear();
        let satisfied = graph.nodes.iter().any(|node| {
            node.spec.name == constraint.name && node.spec.satisfies(&constraint)
        });
        if !satisfied {
            violations.push(Violation::UnsatisfiedRoot {
                constraint: constraint.to_string(),
            });
        }
    }
}
