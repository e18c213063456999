//! Dependency graph construction.
//!
//! Requested targets are closed breadth-first over rule references in
//! `srcs` and over `deps`. Once the closure is complete a single colored
//! depth-first pass rejects cycles, and the graph is frozen.

use crate::error::GraphError;
use crate::loader::RuleLoader;
use crate::rule::Rule;
use crate::rules::RuleTypeRegistry;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Position of a rule in breadth-first discovery order.
pub type NodeId = usize;

/// Closed, acyclic set of rules. Edges point from a dependency to its
/// dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<Arc<Rule>, ()>,
    index: HashMap<String, NodeId>,
    targets: Vec<NodeId>,
}

/// Graph shape sent once when a build report is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPayload {
    pub nodes: Vec<GraphNodePayload>,
    /// `[dependency, dependent]` identity pairs
    pub edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNodePayload {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub srcs: Vec<String>,
    pub deps: Vec<String>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn rule(&self, id: NodeId) -> &Arc<Rule> {
        &self.graph[NodeIndex::new(id)]
    }

    /// Rules in discovery order; the position is the rule's `NodeId`.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.graph.node_weights()
    }

    pub fn id_of(&self, identity: &str) -> Option<NodeId> {
        self.index.get(identity).copied()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains_key(identity)
    }

    /// Requested target rules, in request order.
    pub fn targets(&self) -> &[NodeId] {
        &self.targets
    }

    pub fn is_target(&self, id: NodeId) -> bool {
        self.targets.contains(&id)
    }

    /// Direct dependencies of `id`, ascending.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, ascending.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: NodeId, direction: Direction) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(NodeIndex::new(id), direction)
            .map(|n| n.index())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// `(dependency, dependent)` pairs, sorted.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        let mut edges: Vec<(NodeId, NodeId)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (a.index(), b.index()))
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Every rule after all of its dependencies. Ties follow discovery order.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut visited = vec![false; self.len()];
        let mut order = Vec::with_capacity(self.len());
        for id in 0..self.len() {
            if !visited[id] {
                self.dfs_topo(id, &mut visited, &mut order);
            }
        }
        order
    }

    fn dfs_topo(&self, node: NodeId, visited: &mut Vec<bool>, order: &mut Vec<NodeId>) {
        visited[node] = true;
        for dep in self.dependencies(node) {
            if !visited[dep] {
                self.dfs_topo(dep, visited, order);
            }
        }
        order.push(node);
    }

    /// Whether the rule `rule` depends on `dependency`, directly or
    /// transitively.
    pub fn has_dependency(&self, rule: &str, dependency: &str) -> bool {
        let (Some(start), Some(goal)) = (self.id_of(rule), self.id_of(dependency)) else {
            return false;
        };
        let mut seen = HashSet::new();
        let mut stack = self.dependencies(start);
        while let Some(id) = stack.pop() {
            if id == goal {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.dependencies(id));
            }
        }
        false
    }

    pub fn to_payload(&self) -> GraphPayload {
        let nodes = self
            .rules()
            .map(|rule| GraphNodePayload {
                name: rule.identity(),
                path: rule.module_path.clone(),
                rule_type: rule.rule_type.clone(),
                srcs: rule.srcs.clone(),
                deps: rule.deps.clone(),
            })
            .collect();
        let edges = self
            .edges()
            .into_iter()
            .map(|(a, b)| (self.rule(a).identity(), self.rule(b).identity()))
            .collect();
        GraphPayload { nodes, edges }
    }
}

/// Builds a [`DependencyGraph`] from target references.
pub struct GraphBuilder<'a> {
    loader: &'a dyn RuleLoader,
    registry: Option<&'a RuleTypeRegistry>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(loader: &'a dyn RuleLoader) -> Self {
        Self {
            loader,
            registry: None,
        }
    }

    /// Also reject rules whose type is not registered.
    pub fn with_registry(mut self, registry: &'a RuleTypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(
        &self,
        targets: &[String],
        requesting_module: Option<&str>,
    ) -> Result<DependencyGraph, GraphError> {
        let mut graph: DiGraph<Arc<Rule>, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeId> = HashMap::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut target_ids = Vec::new();

        for reference in targets {
            let rule = self.loader.resolve(reference, requesting_module)?;
            let id = self.intern(&mut graph, &mut index, &mut queue, rule)?;
            if !target_ids.contains(&id) {
                target_ids.push(id);
            }
        }

        let mut edges: Vec<(NodeId, NodeId)> = Vec::new();
        let mut seen_edges = HashSet::new();
        while let Some(id) = queue.pop_front() {
            let rule = graph[NodeIndex::new(id)].clone();
            for reference in rule.rule_references() {
                let dep = self.loader.resolve(reference, Some(&rule.module_path))?;
                let dep_id = self.intern(&mut graph, &mut index, &mut queue, dep)?;
                if seen_edges.insert((dep_id, id)) {
                    edges.push((dep_id, id));
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
        }

        let built = DependencyGraph {
            graph,
            index,
            targets: target_ids,
        };
        if let Some(cycle) = find_cycle(&built) {
            return Err(GraphError::CyclicDependency { cycle });
        }
        tracing::debug!(
            rules = built.len(),
            edges = built.graph.edge_count(),
            "Dependency graph built"
        );
        Ok(built)
    }

    fn intern(
        &self,
        graph: &mut DiGraph<Arc<Rule>, ()>,
        index: &mut HashMap<String, NodeId>,
        queue: &mut VecDeque<NodeId>,
        rule: Arc<Rule>,
    ) -> Result<NodeId, GraphError> {
        let identity = rule.identity();
        if let Some(&id) = index.get(&identity) {
            return Ok(id);
        }
        if let Some(registry) = self.registry {
            if !registry.contains(&rule.rule_type) {
                return Err(GraphError::UnknownRuleType {
                    rule: identity,
                    rule_type: rule.rule_type.clone(),
                });
            }
        }
        let id = graph.add_node(rule).index();
        index.insert(identity, id);
        queue.push_back(id);
        Ok(id)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// White/gray/black depth-first search along "depends on" edges. Returns
/// the first cycle found as identities, first one repeated at the end.
fn find_cycle(graph: &DependencyGraph) -> Option<Vec<String>> {
    let mut color = vec![Color::White; graph.len()];
    for start in 0..graph.len() {
        if color[start] != Color::White {
            continue;
        }
        // (node, its dependencies, next dependency to visit)
        let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> =
            vec![(start, graph.dependencies(start), 0)];
        color[start] = Color::Gray;

        while let Some((node, deps, next)) = stack.last_mut() {
            if *next == deps.len() {
                color[*node] = Color::Black;
                stack.pop();
                continue;
            }
            let dep = deps[*next];
            *next += 1;
            match color[dep] {
                Color::White => {
                    color[dep] = Color::Gray;
                    let dep_deps = graph.dependencies(dep);
                    stack.push((dep, dep_deps, 0));
                }
                Color::Gray => {
                    let from = stack.iter().position(|(n, _, _)| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..]
                        .iter()
                        .map(|(n, _, _)| graph.rule(*n).identity())
                        .collect();
                    cycle.push(graph.rule(dep).identity());
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }
    }
    None
}
