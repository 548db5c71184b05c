//! The resolver core: a weighted backtracking search over one attribute
//! decision at a time.
//!
//! The search works through an agenda of tasks. Per node the agenda fixes
//! the version (or an external), then each variant, then the compiler,
//! then the target, and finally expands the node's dependency edges, which
//! queues tasks for new nodes. Provider choices for virtual edges are their
//! own decisions. Every decision opens a [`decision::Frame`] with all
//! feasible alternatives in preference-rank order; a conflict backtracks to
//! the most recent frame with an untried alternative.
//!
//! Completed assignments are scored by the accumulated rank cost and the
//! search continues, pruning branches that already cost more than the best
//! solution found (branch and bound). The overall effort is bounded by
//! [`ConcretizeOptions::max_decisions`].

mod decision;

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::error::{ConcretizeError, UnsatisfiableSpecError};
use crate::facts::FactBase;
use crate::internal::arena::{Arena, ArenaId};
use crate::internal::id::NodeId;
use crate::policy::{Preferences, COMPILER_MISMATCH_PENALTY, DUPLICATE_PENALTY, REUSE_DISCOUNT, TARGET_MISMATCH_PENALTY};
use crate::recipe::DepTypeSet;
use crate::spec::{Arch, CompilerSpec, ExternalInfo, Spec, VariantDomain, VariantValue};
use crate::version::{Version, VersionList};
use crate::{ConcretizeOptions, DuplicatePolicy, InstalledDatabase};

use decision::{DecisionTracker, Frame};

/// One unit of pending work on the agenda.
#[derive(Debug, Clone)]
enum Task {
    Version(NodeId),
    /// Decides the next undecided variant of the node; re-queued until
    /// none remain.
    Variants(NodeId),
    Compiler(NodeId),
    Arch(NodeId),
    Expand(NodeId),
    /// Chooses a provider for a virtual dependency edge. `parent` is `None`
    /// only when the root request itself names a virtual.
    BindVirtual {
        parent: Option<NodeId>,
        constraint: Spec,
        deptypes: DepTypeSet,
    },
}

/// One candidate answer to a [`Task`], with its rank cost.
#[derive(Debug, Clone)]
enum Alternative {
    /// Nothing to decide (e.g. all variants already set).
    Noop,
    Version {
        version: Version,
        /// Site external chosen instead of building: the external's full
        /// spec and its provenance.
        external: Option<(Spec, ExternalInfo)>,
        cost: u64,
    },
    Variant {
        name: String,
        value: VariantValue,
        cost: u64,
    },
    Compiler {
        compiler: CompilerSpec,
        cost: u64,
    },
    Target {
        target: String,
        cost: u64,
    },
    Provider {
        provider: String,
        cost: u64,
    },
    Expand,
}

impl Alternative {
    fn cost(&self) -> u64 {
        match self {
            Alternative::Noop | Alternative::Expand => 0,
            Alternative::Version { cost, .. }
            | Alternative::Variant { cost, .. }
            | Alternative::Compiler { cost, .. }
            | Alternative::Target { cost, .. }
            | Alternative::Provider { cost, .. } => *cost,
        }
    }
}

#[derive(Debug, Clone)]
struct EdgeState {
    child: NodeId,
    deptypes: DepTypeSet,
    virtual_name: Option<String>,
}

#[derive(Debug, Clone)]
struct NodeState {
    spec: Spec,
    external: Option<ExternalInfo>,
    version_decided: bool,
    decided_variants: Vec<String>,
    variants_done: bool,
    compiler_decided: bool,
    arch_decided: bool,
    expanded: bool,
    /// Which requirer imposed which version constraint, for conflict
    /// messages.
    version_sources: Vec<(String, VersionList)>,
    parents: Vec<NodeId>,
    edges: Vec<EdgeState>,
}

impl NodeState {
    fn new(name: String) -> Self {
        NodeState {
            spec: Spec::named(name),
            external: None,
            version_decided: false,
            decided_variants: Vec::new(),
            variants_done: false,
            compiler_decided: false,
            arch_decided: false,
            expanded: false,
            version_sources: Vec::new(),
            parents: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn name(&self) -> &str {
        self.spec.name_or_anon()
    }
}

/// The full mutable search state. Cloned into decision frames, so it must
/// stay cheap to copy relative to the search work it saves.
#[derive(Clone)]
pub(crate) struct SolveState {
    nodes: Arena<NodeId, NodeState>,
    by_name: IndexMap<String, Vec<NodeId>>,
    agenda: VecDeque<Task>,
    /// `^name` constraints that apply to the node with that name anywhere
    /// in the graph, with the requirer that introduced each.
    floating: Vec<(String, Spec)>,
    root_node: Option<NodeId>,
    cost: u64,
}

impl SolveState {
    fn new() -> Self {
        SolveState {
            nodes: Arena::new(),
            by_name: IndexMap::new(),
            agenda: VecDeque::new(),
            floating: Vec::new(),
            root_node: None,
            cost: 0,
        }
    }

    /// The dependency chain from the root down to `node`, by first parent.
    fn chain(&self, node: NodeId) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            // Cycles in the recipe graph are caught by validation; the
            // chain just has to terminate.
            if chain.len() > self.nodes.len() {
                break;
            }
            chain.push(self.nodes[n].name().to_string());
            cursor = self.nodes[n].parents.first().copied();
        }
        chain.reverse();
        chain
    }

    fn to_graph(&self) -> ResolvedGraph {
        let root = match self.root_node {
            Some(id) => id.to_usize(),
            None => unreachable!("a completed assignment always has a root node"),
        };
        let nodes = self
            .nodes
            .iter()
            .map(|(_, ns)| {
                let mut spec = ns.spec.clone();
                spec.dependencies.clear();
                spec.external = ns.external.clone();
                ResolvedNode {
                    spec,
                    external: ns.external.clone(),
                    edges: ns
                        .edges
                        .iter()
                        .map(|e| ResolvedEdge {
                            child: e.child.to_usize(),
                            deptypes: e.deptypes,
                            virtual_name: e.virtual_name.clone(),
                        })
                        .collect(),
                }
            })
            .collect();
        ResolvedGraph { nodes, root }
    }
}

/// A fully decided assignment: every node pinned, every edge explicit.
/// Input to validation and materialization.
#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    pub nodes: Vec<ResolvedNode>,
    pub root: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub spec: Spec,
    pub external: Option<ExternalInfo>,
    pub edges: Vec<ResolvedEdge>,
}

#[derive(Debug, Clone)]
pub struct ResolvedEdge {
    pub child: usize,
    pub deptypes: DepTypeSet,
    pub virtual_name: Option<String>,
}

pub(crate) struct Solver<'a> {
    facts: &'a FactBase,
    prefs: &'a Preferences,
    installed: Option<&'a dyn InstalledDatabase>,
    options: &'a ConcretizeOptions,
    tracker: DecisionTracker,
    /// The first hard conflict seen anywhere in the search; reported when
    /// the whole space turns out infeasible.
    first_failure: Option<ConcretizeError>,
}

impl<'a> Solver<'a> {
    pub fn new(
        facts: &'a FactBase,
        prefs: &'a Preferences,
        installed: Option<&'a dyn InstalledDatabase>,
        options: &'a ConcretizeOptions,
    ) -> Self {
        Solver {
            facts,
            prefs,
            installed,
            options,
            tracker: DecisionTracker::new(),
            first_failure: None,
        }
    }

    pub fn solve(&mut self) -> Result<ResolvedGraph, ConcretizeError> {
        let mut state = self.initial_state()?;
        let mut best: Option<(u64, ResolvedGraph)> = None;

        loop {
            if self.out_of_budget() {
                tracing::debug!(
                    decisions = self.tracker.decisions,
                    found = best.is_some(),
                    "search budget exhausted"
                );
                return match best {
                    Some((_, graph)) => Ok(graph),
                    None => Err(ConcretizeError::Timeout {
                        decisions: self.tracker.decisions,
                    }),
                };
            }

            let mut pending = match state.agenda.pop_front() {
                Some(task) => {
                    if best.as_ref().is_some_and(|(cost, _)| state.cost >= *cost) {
                        // Already at least as expensive as the best known
                        // solution; abandon this branch.
                        self.tracker.backtrack()
                    } else {
                        match self.enumerate(&state, &task) {
                            Ok(alternatives) => Some(self.tracker.push(Frame {
                                snapshot: state,
                                task,
                                alternatives,
                                next: 0,
                            })),
                            Err(err) => {
                                self.record_failure(err);
                                self.tracker.backtrack()
                            }
                        }
                    }
                }
                None => {
                    let graph = state.to_graph();
                    let violations =
                        crate::validate::validate(&graph, self.facts, self.prefs, self.options);
                    if let Some(violation) = violations.first() {
                        self.record_failure(
                            UnsatisfiableSpecError::new(violation.to_string()).into(),
                        );
                    } else if best.as_ref().map_or(true, |(cost, _)| state.cost < *cost) {
                        tracing::debug!(
                            cost = state.cost,
                            nodes = graph.nodes.len(),
                            depth = self.tracker.depth(),
                            "found solution candidate"
                        );
                        best = Some((state.cost, graph));
                    }
                    self.tracker.backtrack()
                }
            };

            state = loop {
                match pending {
                    None => return self.finish(best),
                    Some((mut restored, task, alternative)) => {
                        match self.apply(&mut restored, &task, &alternative) {
                            Ok(()) => {
                                restored.cost += alternative.cost();
                                break restored;
                            }
                            Err(err) => {
                                self.record_failure(err);
                                pending = self.tracker.backtrack();
                            }
                        }
                    }
                }
            };
        }
    }

    fn out_of_budget(&self) -> bool {
        if self.tracker.decisions >= self.options.max_decisions {
            return true;
        }
        self.options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
    }

    fn finish(&mut self, best: Option<(u64, ResolvedGraph)>) -> Result<ResolvedGraph, ConcretizeError> {
        match best {
            Some((cost, graph)) => {
                tracing::debug!(cost, decisions = self.tracker.decisions, "search complete");
                Ok(graph)
            }
            None => Err(self.first_failure.take().unwrap_or_else(|| {
                UnsatisfiableSpecError::new("the constraints admit no solution").into()
            })),
        }
    }

    fn record_failure(&mut self, err: ConcretizeError) {
        tracing::trace!(%err, depth = self.tracker.depth(), "dead end");
        if self.first_failure.is_none() {
            self.first_failure = Some(err);
        }
    }

    fn initial_state(&self) -> Result<SolveState, ConcretizeError> {
        let mut state = SolveState::new();
        let root = self.facts.root().clone();
        let root_name = match &root.name {
            Some(name) => name.clone(),
            None => unreachable!("the fact base rejects anonymous roots"),
        };
        if self.facts.is_virtual(&root_name) {
            state.agenda.push_back(Task::BindVirtual {
                parent: None,
                constraint: root,
                deptypes: DepTypeSet::build_link(),
            });
        } else {
            let id = self.attach(&mut state, None, &root, DepTypeSet::build_link(), None)?;
            state.root_node = Some(id);
        }
        Ok(state)
    }

    // ---- candidate enumeration -------------------------------------------

    fn enumerate(
        &self,
        state: &SolveState,
        task: &Task,
    ) -> Result<Vec<Alternative>, ConcretizeError> {
        match task {
            Task::Version(node) => self.enumerate_versions(state, *node),
            Task::Variants(node) => self.enumerate_variants(state, *node),
            Task::Compiler(node) => self.enumerate_compilers(state, *node),
            Task::Arch(node) => self.enumerate_targets(state, *node),
            Task::Expand(_) => Ok(vec![Alternative::Expand]),
            Task::BindVirtual {
                parent, constraint, ..
            } => self.enumerate_providers(state, *parent, constraint),
        }
    }

    fn enumerate_versions(
        &self,
        state: &SolveState,
        node: NodeId,
    ) -> Result<Vec<Alternative>, ConcretizeError> {
        let ns = &state.nodes[node];
        let name = ns.name();
        let pkg = match self.facts.package(name) {
            Some(pkg) => pkg,
            None => unreachable!("every node has fact-base backing"),
        };

        // (class, rank): externals beat installed reuse beats fresh builds.
        let mut ranked: Vec<(u8, u64, Alternative)> = Vec::new();

        for entry in self.prefs.externals_for(name) {
            let version = match entry.spec.versions.as_single() {
                Some(v) => v.clone(),
                None => panic!("external entry for `{name}` must pin a single version"),
            };
            if !ns.spec.versions.contains(&version) {
                continue;
            }
            ranked.push((
                0,
                0,
                Alternative::Version {
                    version,
                    external: Some((
                        entry.spec.clone(),
                        ExternalInfo {
                            path: entry.path.clone(),
                            module: entry.module.clone(),
                        },
                    )),
                    cost: 0,
                },
            ));
        }

        let installed: Vec<Spec> = match (self.prefs.reuse, self.installed) {
            (true, Some(db)) => {
                let mut probe = ns.spec.clone();
                probe.dependencies.clear();
                db.find_installed(&probe)
            }
            _ => Vec::new(),
        };

        for version in self.prefs.ordered_versions(name, pkg) {
            if !ns.spec.versions.contains(&version) {
                continue;
            }
            let rank = self.prefs.version_rank(name, &version, pkg);
            let reused = installed
                .iter()
                .any(|s| s.versions.as_single() == Some(&version));
            let (class, cost) = if reused {
                (1, rank.saturating_sub(REUSE_DISCOUNT))
            } else {
                (2, rank)
            };
            ranked.push((
                class,
                rank,
                Alternative::Version {
                    version,
                    external: None,
                    cost,
                },
            ));
        }

        if ranked.is_empty() {
            return Err(UnsatisfiableSpecError::with_chain(
                format!(
                    "no declared version of `{name}` satisfies @{}",
                    ns.spec.versions
                ),
                state.chain(node),
            )
            .into());
        }
        ranked.sort_by_key(|(class, rank, _)| (*class, *rank));
        Ok(ranked.into_iter().map(|(_, _, alt)| alt).collect())
    }

    fn enumerate_variants(
        &self,
        state: &SolveState,
        node: NodeId,
    ) -> Result<Vec<Alternative>, ConcretizeError> {
        let ns = &state.nodes[node];
        let name = ns.name().to_string();
        let pkg = match self.facts.package(&name) {
            Some(pkg) => pkg,
            None => unreachable!("every node has fact-base backing"),
        };
        let active: Vec<_> = pkg.active_variants(&ns.spec).collect();

        // Requested variants must exist for this node's configuration.
        for vname in ns.spec.variants.keys() {
            if !active.iter().any(|d| &d.name == vname) {
                return Err(UnsatisfiableSpecError::with_chain(
                    format!("package `{name}` has no variant `{vname}` for {}", ns.spec),
                    state.chain(node),
                )
                .into());
            }
        }

        for decl in active {
            if ns.decided_variants.iter().any(|d| d == &decl.name) {
                continue;
            }
            return match ns.spec.variants.get(&decl.name) {
                Some(value) => {
                    if !decl.domain.contains(value) {
                        return Err(UnsatisfiableSpecError::with_chain(
                            format!(
                                "invalid value `{}` for variant `{}` of `{name}`",
                                value.display_with_name(&decl.name),
                                decl.name
                            ),
                            state.chain(node),
                        )
                        .into());
                    }
                    Ok(vec![Alternative::Variant {
                        name: decl.name.clone(),
                        value: value.clone(),
                        cost: self.prefs.variant_rank(&name, decl, value),
                    }])
                }
                None => {
                    let preferred = self.prefs.preferred_variant_value(&name, decl);
                    if !decl.domain.contains(&preferred) {
                        panic!(
                            "default or preferred value for variant `{}` of `{name}` is outside its domain",
                            decl.name
                        );
                    }
                    let mut alternatives = vec![Alternative::Variant {
                        name: decl.name.clone(),
                        value: preferred.clone(),
                        cost: 0,
                    }];
                    // Only small domains are worth branching over.
                    match &decl.domain {
                        VariantDomain::Bool => {
                            if let VariantValue::Bool(b) = preferred {
                                alternatives.push(Alternative::Variant {
                                    name: decl.name.clone(),
                                    value: VariantValue::Bool(!b),
                                    cost: 1,
                                });
                            }
                        }
                        VariantDomain::Enum(values) => {
                            for v in values {
                                let value = VariantValue::Single(v.clone());
                                if value != preferred {
                                    alternatives.push(Alternative::Variant {
                                        name: decl.name.clone(),
                                        value,
                                        cost: 1,
                                    });
                                }
                            }
                        }
                        VariantDomain::Multi(_) | VariantDomain::AnyString => {}
                    }
                    Ok(alternatives)
                }
            };
        }

        Ok(vec![Alternative::Noop])
    }

    fn enumerate_compilers(
        &self,
        state: &SolveState,
        node: NodeId,
    ) -> Result<Vec<Alternative>, ConcretizeError> {
        let ns = &state.nodes[node];
        let constraint = ns.spec.compiler.clone();
        let inherited: Option<CompilerSpec> = ns.parents.iter().find_map(|p| {
            let parent = &state.nodes[*p];
            if parent.compiler_decided {
                parent.spec.compiler.clone()
            } else {
                None
            }
        });
        let root_compiler = self.facts.root().compiler.as_ref();

        let mut alternatives = Vec::new();
        for entry in self.prefs.ordered_compilers() {
            if let Some(c) = &constraint {
                if entry.spec.name != c.name || !entry.spec.versions.satisfies(&c.versions) {
                    continue;
                }
            }
            let mut cost = self.prefs.compiler_rank(&entry.spec);
            if let Some(requested) = root_compiler {
                if entry.spec.name != requested.name
                    || !entry.spec.versions.satisfies(&requested.versions)
                {
                    cost += COMPILER_MISMATCH_PENALTY;
                }
            }
            alternatives.push(Alternative::Compiler {
                compiler: entry.spec.clone(),
                cost,
            });
        }
        if alternatives.is_empty() {
            let wanted = constraint
                .map(|c| c.to_string())
                .unwrap_or_else(|| "any compiler".to_string());
            return Err(UnsatisfiableSpecError::with_chain(
                format!("no available compiler satisfies {wanted} for `{}`", ns.name()),
                state.chain(node),
            )
            .into());
        }

        alternatives.sort_by_key(Alternative::cost);
        // ABI consistency pulls toward the parent's compiler.
        if let Some(inherited) = inherited {
            if let Some(pos) = alternatives.iter().position(
                |a| matches!(a, Alternative::Compiler { compiler, .. } if *compiler == inherited),
            ) {
                let preferred = alternatives.remove(pos);
                alternatives.insert(0, preferred);
            }
        }
        Ok(alternatives)
    }

    fn enumerate_targets(
        &self,
        state: &SolveState,
        node: NodeId,
    ) -> Result<Vec<Alternative>, ConcretizeError> {
        let ns = &state.nodes[node];
        let name = ns.name();
        let platform = &self.prefs.platform;

        if let Some(p) = &ns.spec.arch.platform {
            if *p != platform.name {
                return Err(UnsatisfiableSpecError::with_chain(
                    format!(
                        "`{name}` requires platform `{p}` but the host platform is `{}`",
                        platform.name
                    ),
                    state.chain(node),
                )
                .into());
            }
        }
        if let Some(os) = &ns.spec.arch.os {
            if *os != platform.os {
                return Err(UnsatisfiableSpecError::with_chain(
                    format!(
                        "`{name}` requires os `{os}` but the host os is `{}`",
                        platform.os
                    ),
                    state.chain(node),
                )
                .into());
            }
        }

        // Ceiling on specificity: an explicitly requested root target, else
        // the platform default. A target pinned on the node itself overrides.
        let limit = self
            .facts
            .root()
            .arch
            .target
            .clone()
            .unwrap_or_else(|| platform.default_target.clone());
        let limit_index = platform.target_index(&limit).ok_or_else(|| {
            ConcretizeError::from(UnsatisfiableSpecError::with_chain(
                format!(
                    "target `{limit}` is not available on platform `{}`",
                    platform.name
                ),
                state.chain(node),
            ))
        })?;

        let candidates: Vec<String> = match &ns.spec.arch.target {
            Some(t) => {
                if platform.target_index(t).is_none() {
                    return Err(UnsatisfiableSpecError::with_chain(
                        format!(
                            "target `{t}` is not available on platform `{}`",
                            platform.name
                        ),
                        state.chain(node),
                    )
                    .into());
                }
                vec![t.clone()]
            }
            None => {
                let mut ordered: Vec<String> = Vec::new();
                let parent_target = ns.parents.iter().find_map(|p| {
                    let parent = &state.nodes[*p];
                    if parent.arch_decided {
                        parent.spec.arch.target.clone()
                    } else {
                        None
                    }
                });
                if let Some(t) = parent_target {
                    if platform.target_index(&t).is_some_and(|i| i <= limit_index) {
                        ordered.push(t);
                    }
                }
                if !ordered.contains(&limit) {
                    ordered.push(limit.clone());
                }
                for (i, t) in platform.targets.iter().enumerate() {
                    if i <= limit_index && !ordered.contains(t) {
                        ordered.push(t.clone());
                    }
                }
                ordered
            }
        };

        let compiler_entry = ns.spec.compiler.as_ref().and_then(|c| {
            self.prefs
                .compilers
                .iter()
                .find(|e| e.spec.name == c.name && e.spec.versions == c.versions)
        });
        let alternatives: Vec<Alternative> = candidates
            .into_iter()
            .filter(|t| compiler_entry.map_or(true, |e| e.supports_target(t)))
            .map(|target| {
                let cost = if target == limit {
                    0
                } else {
                    TARGET_MISMATCH_PENALTY
                };
                Alternative::Target { target, cost }
            })
            .collect();
        if alternatives.is_empty() {
            let compiler = ns
                .spec
                .compiler
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default();
            return Err(UnsatisfiableSpecError::with_chain(
                format!("no allowed target of `{name}` is supported by {compiler}"),
                state.chain(node),
            )
            .into());
        }
        Ok(alternatives)
    }

    fn enumerate_providers(
        &self,
        state: &SolveState,
        parent: Option<NodeId>,
        constraint: &Spec,
    ) -> Result<Vec<Alternative>, ConcretizeError> {
        let virtual_name = constraint.name_or_anon();
        let mut alternatives = Vec::new();
        for provider in self.prefs.ordered_providers(virtual_name, self.facts) {
            let Some(pkg) = self.facts.package(&provider) else {
                continue;
            };
            let provides = pkg.recipe.provides.iter().any(|p| {
                p.virtual_spec.name.as_deref() == Some(virtual_name)
                    && !p
                        .virtual_spec
                        .versions
                        .intersect(&constraint.versions)
                        .is_empty()
            });
            if provides {
                let cost = self.prefs.provider_rank(virtual_name, &provider, self.facts);
                alternatives.push(Alternative::Provider { provider, cost });
            }
        }
        if alternatives.is_empty() {
            return Err(ConcretizeError::NoProvider {
                virtual_name: virtual_name.to_string(),
                required_by: parent.map(|p| state.chain(p)).unwrap_or_default(),
            });
        }
        alternatives.sort_by_key(Alternative::cost);
        Ok(alternatives)
    }

    // ---- decision application --------------------------------------------

    fn apply(
        &self,
        state: &mut SolveState,
        task: &Task,
        alternative: &Alternative,
    ) -> Result<(), ConcretizeError> {
        match (task, alternative) {
            (Task::Version(node), Alternative::Version { version, external, .. }) => {
                self.apply_version(state, *node, version, external.as_ref())
            }
            (Task::Variants(node), Alternative::Variant { name, value, .. }) => {
                let ns = &mut state.nodes[*node];
                tracing::trace!(package = %ns.name(), variant = %value.display_with_name(name), "variant decided");
                ns.spec.variants.insert(name.clone(), value.clone());
                ns.decided_variants.push(name.clone());
                state.agenda.push_front(Task::Variants(*node));
                Ok(())
            }
            (Task::Variants(node), Alternative::Noop) => {
                state.nodes[*node].variants_done = true;
                Ok(())
            }
            (Task::Compiler(node), Alternative::Compiler { compiler, .. }) => {
                let ns = &mut state.nodes[*node];
                tracing::trace!(package = %ns.name(), %compiler, "compiler decided");
                ns.spec.compiler = Some(compiler.clone());
                ns.compiler_decided = true;
                Ok(())
            }
            (Task::Arch(node), Alternative::Target { target, .. }) => {
                let ns = &mut state.nodes[*node];
                tracing::trace!(package = %ns.name(), %target, "target decided");
                ns.spec.arch = Arch {
                    platform: Some(self.prefs.platform.name.clone()),
                    os: Some(self.prefs.platform.os.clone()),
                    target: Some(target.clone()),
                };
                ns.arch_decided = true;
                Ok(())
            }
            (Task::Expand(node), Alternative::Expand) => self.apply_expand(state, *node),
            (
                Task::BindVirtual {
                    parent,
                    constraint,
                    deptypes,
                },
                Alternative::Provider { provider, .. },
            ) => self.apply_provider(state, *parent, constraint, *deptypes, provider),
            _ => unreachable!("alternative does not answer its task"),
        }
    }

    fn apply_version(
        &self,
        state: &mut SolveState,
        node: NodeId,
        version: &Version,
        external: Option<&(Spec, ExternalInfo)>,
    ) -> Result<(), ConcretizeError> {
        if !state.nodes[node].spec.versions.contains(version) {
            return Err(UnsatisfiableSpecError::with_chain(
                format!(
                    "version {version} of `{}` no longer satisfies @{}",
                    state.nodes[node].name(),
                    state.nodes[node].spec.versions
                ),
                state.chain(node),
            )
            .into());
        }
        if let Some((ext_spec, info)) = external {
            let merged = match state.nodes[node].spec.constrain(ext_spec) {
                Ok(merged) => merged,
                Err(err) => return Err(self.conflict_error(state, node, ext_spec, "an external entry", err)),
            };
            let ns = &mut state.nodes[node];
            ns.spec = merged;
            ns.external = Some(info.clone());
        }
        let ns = &mut state.nodes[node];
        ns.spec.versions = VersionList::single(version.clone());
        ns.version_decided = true;
        tracing::trace!(package = %ns.name(), %version, external = ns.external.is_some(), "version decided");
        Ok(())
    }

    fn apply_expand(&self, state: &mut SolveState, node: NodeId) -> Result<(), ConcretizeError> {
        if state.nodes[node].external.is_some() {
            // Externals are leaves; nothing below them is solved.
            state.nodes[node].expanded = true;
            return Ok(());
        }
        let spec = state.nodes[node].spec.clone();
        let name = spec.name_or_anon().to_string();
        let recipe = match self.facts.package(&name) {
            Some(pkg) => pkg.recipe.clone(),
            None => unreachable!("every node has fact-base backing"),
        };

        for conflict in &recipe.conflicts {
            let when_holds = conflict
                .when
                .as_ref()
                .map_or(true, |when| spec.satisfies(when));
            if when_holds && spec.satisfies(&conflict.matches) {
                let mut message = format!("`{name}` conflicts with `{}`", conflict.matches);
                if let Some(when) = &conflict.when {
                    message.push_str(&format!(" when `{when}`"));
                }
                if let Some(extra) = &conflict.message {
                    message.push_str(": ");
                    message.push_str(extra);
                }
                return Err(
                    UnsatisfiableSpecError::with_chain(message, state.chain(node)).into(),
                );
            }
        }

        for dep in &recipe.dependencies {
            if !dep.when.as_ref().map_or(true, |when| spec.satisfies(when)) {
                continue;
            }
            let target = match dep.spec.name.as_deref() {
                Some(target) => target,
                None => unreachable!("dependency specs are named"),
            };
            if self.facts.is_virtual(target) {
                state.agenda.push_back(Task::BindVirtual {
                    parent: Some(node),
                    constraint: dep.spec.clone(),
                    deptypes: dep.deptypes,
                });
            } else {
                self.attach(state, Some(node), &dep.spec, dep.deptypes, None)?;
            }
        }
        state.nodes[node].expanded = true;
        Ok(())
    }

    fn apply_provider(
        &self,
        state: &mut SolveState,
        parent: Option<NodeId>,
        constraint: &Spec,
        deptypes: DepTypeSet,
        provider: &str,
    ) -> Result<(), ConcretizeError> {
        let virtual_name = constraint.name_or_anon().to_string();
        let pkg = match self.facts.package(provider) {
            Some(pkg) => pkg,
            None => unreachable!("providers come from the fact base"),
        };
        // The provider must be in a configuration under which it actually
        // provides the virtual.
        let when = pkg
            .recipe
            .provides
            .iter()
            .find(|p| {
                p.virtual_spec.name.as_deref() == Some(virtual_name.as_str())
                    && !p
                        .virtual_spec
                        .versions
                        .intersect(&constraint.versions)
                        .is_empty()
            })
            .and_then(|p| p.when.clone());

        let mut provider_spec = Spec::named(provider);
        if let Some(when) = when {
            provider_spec = provider_spec
                .constrain(&when)
                .map_err(|err| UnsatisfiableSpecError::with_chain(err.message, Vec::new()))?;
        }
        tracing::debug!(virtual_name = %virtual_name, provider, "binding virtual");
        let child = self.attach(state, parent, &provider_spec, deptypes, Some(virtual_name))?;
        if parent.is_none() && state.root_node.is_none() {
            state.root_node = Some(child);
        }
        Ok(())
    }

    // ---- graph construction ----------------------------------------------

    /// Merges `constraint` into the existing node of its name, or creates a
    /// new node, and records the dependency edge from `parent`.
    fn attach(
        &self,
        state: &mut SolveState,
        parent: Option<NodeId>,
        constraint: &Spec,
        deptypes: DepTypeSet,
        virtual_name: Option<String>,
    ) -> Result<NodeId, ConcretizeError> {
        let name = match &constraint.name {
            Some(name) => name.clone(),
            None => unreachable!("attached constraints are named"),
        };
        let origin = parent
            .map(|p| state.nodes[p].name().to_string())
            .unwrap_or_else(|| "the request".to_string());

        // `^dep` constraints inside the edge apply to the node of that name
        // anywhere in the graph, not only to direct children.
        let mut flat = constraint.clone();
        let nested = std::mem::take(&mut flat.dependencies);
        for spec in nested {
            self.add_floating(state, &origin, spec)?;
        }

        let existing = state.by_name.get(&name).cloned().unwrap_or_default();
        let mut first_err = None;
        for id in &existing {
            match self.constrain_node(state, *id, &flat, &origin) {
                Ok(()) => {
                    link(state, parent, *id, deptypes, virtual_name);
                    return Ok(*id);
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            let duplicate_ok = self.options.duplicate_policy
                == DuplicatePolicy::AllowBuildDuplicates
                && deptypes.is_build_only();
            if !duplicate_ok {
                return Err(err);
            }
            tracing::debug!(package = %name, "admitting build-only duplicate node");
        }

        let id = state.nodes.alloc(NodeState::new(name.clone()));
        state.by_name.entry(name.clone()).or_default().push(id);
        state.agenda.push_back(Task::Version(id));
        state.agenda.push_back(Task::Variants(id));
        state.agenda.push_back(Task::Compiler(id));
        state.agenda.push_back(Task::Arch(id));
        state.agenda.push_back(Task::Expand(id));
        link(state, parent, id, deptypes, virtual_name);

        self.constrain_node(state, id, &flat, &origin)?;
        for (forigin, fspec) in state.floating.clone() {
            if fspec.name.as_deref() == Some(name.as_str()) {
                self.constrain_node(state, id, &fspec, &forigin)?;
            }
        }
        if !existing.is_empty() {
            state.cost += DUPLICATE_PENALTY;
        }
        Ok(id)
    }

    fn add_floating(
        &self,
        state: &mut SolveState,
        origin: &str,
        spec: Spec,
    ) -> Result<(), ConcretizeError> {
        let Some(name) = spec.name.clone() else {
            unreachable!("`^` constraints are named");
        };
        // Applies retroactively to nodes that already exist.
        for id in state.by_name.get(&name).cloned().unwrap_or_default() {
            self.constrain_node(state, id, &spec, origin)?;
        }
        state.floating.push((name, spec));
        Ok(())
    }

    fn constrain_node(
        &self,
        state: &mut SolveState,
        node: NodeId,
        constraint: &Spec,
        origin: &str,
    ) -> Result<(), ConcretizeError> {
        let constraint = self.coerce_variants(state.nodes[node].name(), constraint);
        let constraint = &constraint;
        let merged = match state.nodes[node].spec.constrain(constraint) {
            Ok(merged) => merged,
            Err(err) => return Err(self.conflict_error(state, node, constraint, origin, err)),
        };
        let ns = &mut state.nodes[node];
        let changed = merged != ns.spec;
        ns.spec = merged;
        if !constraint.versions.is_any() {
            ns.version_sources
                .push((origin.to_string(), constraint.versions.clone()));
        }
        // A constraint that lands after the node was processed can flip
        // `when=` guards on its variants and dependencies, so the guarded
        // tasks run again. Re-expansion is idempotent: edges that already
        // exist are merged, not duplicated.
        if changed {
            if ns.variants_done {
                ns.variants_done = false;
                state.agenda.push_back(Task::Variants(node));
            }
            if ns.expanded {
                tracing::trace!(package = %state.nodes[node].name(), %origin, "re-expanding after late constraint");
                state.nodes[node].expanded = false;
                state.agenda.push_back(Task::Expand(node));
            }
        }
        Ok(())
    }

    /// Rewrites bare `name=value` settings into one-element sets when the
    /// package declares the variant as multi-valued, so that constraints
    /// from different requirers accumulate instead of clashing.
    fn coerce_variants(&self, package: &str, constraint: &Spec) -> Spec {
        let mut out = constraint.clone();
        if let Some(facts) = self.facts.package(package) {
            for (vname, value) in out.variants.iter_mut() {
                if let VariantValue::Single(v) = value {
                    let multi = facts
                        .recipe
                        .variant(vname)
                        .is_some_and(|decl| matches!(decl.domain, VariantDomain::Multi(_)));
                    if multi {
                        *value = VariantValue::multi([v.clone()]);
                    }
                }
            }
        }
        out
    }

    /// Builds the pairwise-conflict diagnostic: when two version
    /// requirements are disjoint, name both requirers.
    fn conflict_error(
        &self,
        state: &SolveState,
        node: NodeId,
        constraint: &Spec,
        origin: &str,
        err: UnsatisfiableSpecError,
    ) -> ConcretizeError {
        let ns = &state.nodes[node];
        let name = ns.name();
        if !constraint.versions.is_any()
            && ns.spec.versions.intersect(&constraint.versions).is_empty()
        {
            let prior = ns
                .version_sources
                .iter()
                .find(|(_, vs)| vs.intersect(&constraint.versions).is_empty());
            if let Some((prior_origin, prior_versions)) = prior {
                return UnsatisfiableSpecError::with_chain(
                    format!(
                        "{} requires {name}@{} but {} requires {name}@{}",
                        requirer(origin),
                        constraint.versions,
                        requirer(prior_origin),
                        prior_versions
                    ),
                    state.chain(node),
                )
                .into();
            }
        }
        UnsatisfiableSpecError::with_chain(err.message, state.chain(node)).into()
    }
}

fn requirer(origin: &str) -> String {
    if origin.starts_with("the ") || origin.starts_with("an ") {
        origin.to_string()
    } else {
        format!("package {origin}")
    }
}

fn link(
    state: &mut SolveState,
    parent: Option<NodeId>,
    child: NodeId,
    deptypes: DepTypeSet,
    virtual_name: Option<String>,
) {
    let Some(parent) = parent else { return };
    let edges = &mut state.nodes[parent].edges;
    match edges.iter_mut().find(|e| e.child == child) {
        Some(edge) => {
            edge.deptypes = edge.deptypes.union(deptypes);
            if edge.virtual_name.is_none() {
                edge.virtual_name = virtual_name;
            }
        }
        None => edges.push(EdgeState {
            child,
            deptypes,
            virtual_name,
        }),
    }
    if !state.nodes[child].parents.contains(&parent) {
        state.nodes[child].parents.push(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{InMemoryRepository, PackageRecipe};

    fn solve(repo: &InMemoryRepository, root: &str) -> Result<ResolvedGraph, ConcretizeError> {
        let facts = FactBase::build(&Spec::parse(root).unwrap(), repo).unwrap();
        let prefs = Preferences::default();
        let options = ConcretizeOptions::default();
        Solver::new(&facts, &prefs, None, &options).solve()
    }

    #[test]
    fn solves_a_chain() {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("2.0")
                .depends_on("lib@1.0:")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("lib")
                .version("1.0")
                .version("1.1")
                .build(),
        );

        let graph = solve(&repo, "app").unwrap();
        assert_eq!(graph.nodes.len(), 2);
        let root = &graph.nodes[graph.root];
        assert_eq!(root.spec.name.as_deref(), Some("app"));
        assert_eq!(root.edges.len(), 1);
        let lib = &graph.nodes[root.edges[0].child];
        // Newest satisfying version wins.
        assert_eq!(lib.spec.versions.as_single().unwrap().to_string(), "1.1");
        assert!(lib.spec.is_concrete());
    }

    #[test]
    fn backtracks_over_versions() {
        // lib@1.1 pulls in a package that conflicts with the root request,
        // so the solver must fall back to lib@1.0.
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("1.0")
                .depends_on("lib")
                .depends_on("helper@1.0")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("lib")
                .version("1.0")
                .version("1.1")
                .depends_on_when("helper@2.0", Some("@1.1"))
                .build(),
        );
        repo.add(
            PackageRecipe::builder("helper")
                .version("1.0")
                .version("2.0")
                .build(),
        );

        let graph = solve(&repo, "app").unwrap();
        let lib = graph
            .nodes
            .iter()
            .find(|n| n.spec.name.as_deref() == Some("lib"))
            .unwrap();
        assert_eq!(lib.spec.versions.as_single().unwrap().to_string(), "1.0");
    }

    #[test]
    fn disjoint_requirements_name_both_sides() {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("1.0")
                .depends_on("lib@:1.0")
                .depends_on("other")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("other")
                .version("1.0")
                .depends_on("lib@2:")
                .build(),
        );
        repo.add(
            PackageRecipe::builder("lib")
                .version("1.0")
                .version("2.0")
                .build(),
        );

        let err = solve(&repo, "app").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("app") && message.contains("other"), "{message}");
        assert!(message.contains("lib@"), "{message}");
    }

    #[test]
    fn budget_exhaustion_times_out() {
        let mut repo = InMemoryRepository::new();
        repo.add(
            PackageRecipe::builder("app")
                .version("1.0")
                .depends_on("lib")
                .build(),
        );
        repo.add(PackageRecipe::builder("lib").version("1.0").build());

        let facts = FactBase::build(&Spec::parse("app").unwrap(), &repo).unwrap();
        let prefs = Preferences::default();
        let options = ConcretizeOptions {
            max_decisions: 1,
            ..ConcretizeOptions::default()
        };
        let err = Solver::new(&facts, &prefs, None, &options).solve().unwrap_err();
        assert!(matches!(err, ConcretizeError::Timeout { .. }));
    }
}
