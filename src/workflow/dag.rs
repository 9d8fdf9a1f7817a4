//! Workflow Dependency Graph
//!
//! Nodes are rule indices into [`Workflow::rules`]; an edge `a -> b` means
//! rule `b` consumes something rule `a` produces (see [`Rule::follows`]).
//! Edges are never declared, they are inferred by comparing every ordered
//! pair of rules, which is fine for hand-written workflows.
//!
//! All node sets are ordered so traversal follows definition order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write;
use std::path::Path;

use log::debug;

use super::model::{Rule, RuleStatus, Workflow};
use crate::error::{Result, RuleflowError};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Directed acyclic graph over rule indices.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: BTreeSet<usize>,
    successors: BTreeMap<usize, BTreeSet<usize>>,
    predecessors: BTreeMap<usize, BTreeSet<usize>>,
}

impl Dag {
    /// Graph with the given nodes and no edges.
    pub fn with_nodes(nodes: impl IntoIterator<Item = usize>) -> Self {
        let mut dag = Self::default();
        for node in nodes {
            dag.add_node(node);
        }
        dag
    }

    /// Builds the graph of `rules` and rejects it if it contains a cycle.
    pub fn build(rules: &[Rule]) -> Result<Self> {
        Self::build_in(rules, None)
    }

    /// Builds the graph with relative rule paths resolved under `base`.
    pub fn build_in(rules: &[Rule], base: Option<&Path>) -> Result<Self> {
        let mut dag = Self::with_nodes(0..rules.len());

        for (from, producer) in rules.iter().enumerate() {
            for (to, consumer) in rules.iter().enumerate() {
                if from != to && consumer.follows_in(producer, base) {
                    dag.add_edge(from, to);
                }
            }
        }
        debug!(
            "Built DAG: {} nodes, {} edges",
            dag.node_count(),
            dag.edge_count()
        );

        if let Some(cycle) = dag.find_cycle() {
            let names = cycle
                .into_iter()
                .map(|i| rules.get(i).map_or_else(|| i.to_string(), |r| r.name.clone()))
                .collect();
            return Err(RuleflowError::CyclicWorkflow(names));
        }
        Ok(dag)
    }

    pub fn add_node(&mut self, node: usize) {
        self.nodes.insert(node);
        self.successors.entry(node).or_default();
        self.predecessors.entry(node).or_default();
    }

    /// Adds `from -> to`, creating both nodes if needed.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.add_node(from);
        self.add_node(to);
        self.successors.entry(from).or_default().insert(to);
        self.predecessors.entry(to).or_default().insert(from);
    }

    pub fn contains(&self, node: usize) -> bool {
        self.nodes.contains(&node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes.iter().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.successors
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct successors of `node`, or the roots (no predecessors) when `None`.
    pub fn successors(&self, node: Option<usize>) -> Vec<usize> {
        match node {
            None => self
                .nodes
                .iter()
                .copied()
                .filter(|n| self.predecessors.get(n).map_or(true, BTreeSet::is_empty))
                .collect(),
            Some(n) => self
                .successors
                .get(&n)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    pub fn predecessors(&self, node: usize) -> Vec<usize> {
        self.predecessors
            .get(&node)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `node` and everything reachable from it.
    pub fn get_all_successors(&self, node: usize) -> BTreeSet<usize> {
        self.closure(node, &self.successors)
    }

    /// `node` and everything it transitively depends on.
    pub fn get_all_predecessors(&self, node: usize) -> BTreeSet<usize> {
        self.closure(node, &self.predecessors)
    }

    fn closure(&self, node: usize, adjacency: &BTreeMap<usize, BTreeSet<usize>>) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        if !self.contains(node) {
            return seen;
        }

        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = adjacency.get(&current) {
                queue.extend(next.iter().copied().filter(|n| !seen.contains(n)));
            }
        }
        seen
    }

    /// Restriction of the graph to `keep`; edges leaving the set are dropped.
    pub fn subgraph(&self, keep: &BTreeSet<usize>) -> Dag {
        let mut sub = Dag::with_nodes(self.nodes.intersection(keep).copied());
        for (from, to) in self.edges() {
            if keep.contains(&from) && keep.contains(&to) {
                sub.add_edge(from, to);
            }
        }
        sub
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Depth-first search for a back edge. Returns the cycle as a closed
    /// path, e.g. `[a, b, a]`.
    pub fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks: BTreeMap<usize, Mark> = BTreeMap::new();
        let mut path: Vec<usize> = Vec::new();

        for &start in &self.nodes {
            if marks.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut BTreeMap<usize, Mark>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks.insert(node, Mark::InProgress);
        path.push(node);

        for next in self.successors(Some(node)) {
            match marks.get(&next) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|&n| n == next)?;
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                None => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    /// Kahn ordering, ties broken by rule index.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: BTreeMap<usize, usize> = self
            .nodes
            .iter()
            .map(|&n| (n, self.predecessors.get(&n).map_or(0, BTreeSet::len)))
            .collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for next in self.successors(Some(node)) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }
        order
    }

    /// Graphviz rendering, nodes coloured by rule status.
    pub fn to_dot(&self, workflow: &Workflow) -> String {
        let mut out = String::from("digraph workflow {\n    rankdir=LR;\n    node [shape=box, style=\"rounded,filled\"];\n");

        for node in self.nodes() {
            let Some(rule) = workflow.rules.get(node) else {
                continue;
            };
            let color = match rule.status {
                RuleStatus::Executed => "palegreen",
                RuleStatus::AlreadyExecuted | RuleStatus::Dry => "lightblue",
                RuleStatus::Error => "salmon",
                RuleStatus::NotPlanned => "lightgrey",
                RuleStatus::NotExecuted => "white",
            };
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\\n({})\", fillcolor={}];",
                escape(&rule.name),
                escape(&rule.name),
                escape(&rule.tool),
                color
            );
        }

        for (from, to) in self.edges() {
            if let (Some(a), Some(b)) = (workflow.rules.get(from), workflow.rules.get(to)) {
                let _ = writeln!(out, "    \"{}\" -> \"{}\";", escape(&a.name), escape(&b.name));
            }
        }

        out.push_str("}\n");
        out
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Same nodes, and each edge set contains the other.
impl PartialEq for Dag {
    fn eq(&self, other: &Self) -> bool {
        self.node_count() == other.node_count()
            && self.nodes == other.nodes
            && self.edges().all(|(a, b)| other.successors(Some(a)).contains(&b))
            && other.edges().all(|(a, b)| self.successors(Some(a)).contains(&b))
    }
}

impl Eq for Dag {}
