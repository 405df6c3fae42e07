//! Dependency graph and analysis engine
//!
//! Stores the task DAG as adjacency maps keyed by task id (reverse edges
//! derived on mutation) and provides the analyses the scheduler and
//! planners build on: validation, Tarjan strongly-connected components,
//! Kahn topological ordering, critical-path (CPM) computation and
//! parallel-group discovery.
//!
//! Only *hard* edges gate readiness and participate in ordering, CPM and
//! grouping. Soft and hint edges exist for analysis: they show up in
//! cycle detection and validation warnings, nothing else.
//!
//! The structure itself is synchronous and lock-free; the scheduler owns
//! it behind its state lock. Analyses never mutate the graph.

use crate::types::{FabricError, FabricResult, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

/// How strongly an edge constrains execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStrength {
    /// Gates readiness; the graph must stay acyclic across hard edges
    Hard,
    /// Advises ordering but never blocks execution
    Soft,
    /// Informational only
    Hint,
}

impl EdgeStrength {
    /// Cost of removing an edge of this strength to break a cycle.
    pub fn breaking_cost(self) -> u32 {
        match self {
            EdgeStrength::Hard => 10,
            EdgeStrength::Soft => 5,
            EdgeStrength::Hint => 1,
        }
    }
}

/// A directed dependency edge: `from` must complete before `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Prerequisite node
    pub from: TaskId,
    /// Dependent node
    pub to: TaskId,
    /// Constraint strength
    pub strength: EdgeStrength,
}

/// Candidate edge removal that would break a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakingPoint {
    /// Edge source
    pub from: TaskId,
    /// Edge target
    pub to: TaskId,
    /// Strength of the edge
    pub strength: EdgeStrength,
    /// Removal cost (hard 10, soft 5, hint 1)
    pub cost: u32,
}

/// One strongly-connected component of size >= 2
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleInfo {
    /// Nodes participating in the cycle
    pub nodes: Vec<TaskId>,
    /// Edges internal to the component
    pub edges: Vec<DependencyEdge>,
    /// Candidate removals, cheapest first
    pub breaking_points: Vec<BreakingPoint>,
}

/// A single validation finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphIssue {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Nodes involved
    pub nodes: Vec<TaskId>,
}

/// Outcome of a full graph validation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphValidationReport {
    /// Structural errors that make the graph unschedulable
    pub errors: Vec<GraphIssue>,
    /// Findings worth surfacing but not fatal
    pub warnings: Vec<GraphIssue>,
    /// Detected cycles (any strength)
    pub cycles: Vec<CycleInfo>,
}

impl GraphValidationReport {
    /// Whether the graph is schedulable.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-node schedule computed by the critical-path pass
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeSchedule {
    /// Earliest start (ms from project start)
    pub early_start_ms: u64,
    /// Earliest finish
    pub early_finish_ms: u64,
    /// Latest start without delaying the project
    pub late_start_ms: u64,
    /// Latest finish
    pub late_finish_ms: u64,
    /// `late_start - early_start`; zero on the critical path
    pub slack_ms: u64,
}

/// Full output of the critical-path analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalPathAnalysis {
    /// Per-node schedule
    pub schedule: HashMap<TaskId, NodeSchedule>,
    /// Project duration = max early finish
    pub project_duration_ms: u64,
    /// Zero-slack nodes in topological order
    pub critical_nodes: Vec<TaskId>,
    /// Critical nodes whose effort exceeds 1.5x the mean effort
    pub bottlenecks: Vec<TaskId>,
}

/// Fan-in above this many hard predecessors draws a validation warning.
const FAN_IN_WARNING: usize = 10;
/// Hard chains longer than this many nodes draw a validation warning.
const CHAIN_WARNING: usize = 20;

/// The task dependency DAG
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Node set with effort estimates (ms) for CPM
    efforts: HashMap<TaskId, u64>,
    /// Outgoing edges: from -> (to -> strength)
    successors: HashMap<TaskId, HashMap<TaskId, EdgeStrength>>,
    /// Incoming edges, derived on every mutation
    predecessors: HashMap<TaskId, HashMap<TaskId, EdgeStrength>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.efforts.len()
    }

    /// Whether the graph knows `id`.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.efforts.contains_key(id)
    }

    /// All node ids.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskId> {
        self.efforts.keys()
    }

    /// All edges, for snapshots and reports.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut out = Vec::new();
        for (from, targets) in &self.successors {
            for (to, strength) in targets {
                out.push(DependencyEdge {
                    from: *from,
                    to: *to,
                    strength: *strength,
                });
            }
        }
        out
    }

    /// Add a node with its effort estimate. Re-adding updates the effort.
    pub fn add_node(&mut self, id: TaskId, effort_ms: u64) {
        self.efforts.insert(id, effort_ms);
        self.successors.entry(id).or_default();
        self.predecessors.entry(id).or_default();
    }

    /// Update a node's effort estimate.
    pub fn set_effort(&mut self, id: &TaskId, effort_ms: u64) -> FabricResult<()> {
        match self.efforts.get_mut(id) {
            Some(e) => {
                *e = effort_ms;
                Ok(())
            }
            None => Err(FabricError::NotFound(format!("graph node {id}"))),
        }
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &TaskId) {
        self.efforts.remove(id);
        if let Some(targets) = self.successors.remove(id) {
            for to in targets.keys() {
                if let Some(preds) = self.predecessors.get_mut(to) {
                    preds.remove(id);
                }
            }
        }
        if let Some(sources) = self.predecessors.remove(id) {
            for from in sources.keys() {
                if let Some(succs) = self.successors.get_mut(from) {
                    succs.remove(id);
                }
            }
        }
    }

    /// Declare that `task` depends on `depends_on`.
    ///
    /// Rejects unknown endpoints, self-dependencies and duplicates. A
    /// hard edge that would close a hard cycle is rejected atomically
    /// before any mutation, with the offending cycle in the error.
    pub fn add_dependency(
        &mut self,
        task: TaskId,
        depends_on: TaskId,
        strength: EdgeStrength,
    ) -> FabricResult<()> {
        if task == depends_on {
            return Err(FabricError::Validation(format!(
                "task {task} cannot depend on itself"
            )));
        }
        if !self.contains(&task) {
            return Err(FabricError::NotFound(format!("graph node {task}")));
        }
        if !self.contains(&depends_on) {
            return Err(FabricError::NotFound(format!("graph node {depends_on}")));
        }
        if self
            .successors
            .get(&depends_on)
            .is_some_and(|t| t.contains_key(&task))
        {
            return Err(FabricError::Conflict(format!(
                "dependency {depends_on} -> {task} already exists"
            )));
        }
        if strength == EdgeStrength::Hard {
            if let Some(mut path) = self.hard_path(task, depends_on) {
                path.push(task);
                return Err(FabricError::Precondition {
                    message: format!(
                        "adding hard dependency {task} -> {depends_on} would create a cycle"
                    ),
                    cycle: path,
                });
            }
        } else if self.hard_path(task, depends_on).is_some() {
            // Advisory edges may close cycles; worth a log line, nothing more.
            warn!(%task, %depends_on, ?strength, "advisory dependency closes a cycle");
        }
        self.successors
            .entry(depends_on)
            .or_default()
            .insert(task, strength);
        self.predecessors
            .entry(task)
            .or_default()
            .insert(depends_on, strength);
        Ok(())
    }

    /// Remove the dependency of `task` on `depends_on`.
    pub fn remove_dependency(&mut self, task: &TaskId, depends_on: &TaskId) -> FabricResult<()> {
        let removed = self
            .successors
            .get_mut(depends_on)
            .is_some_and(|t| t.remove(task).is_some());
        if !removed {
            return Err(FabricError::NotFound(format!(
                "dependency {depends_on} -> {task}"
            )));
        }
        if let Some(preds) = self.predecessors.get_mut(task) {
            preds.remove(depends_on);
        }
        Ok(())
    }

    /// Hard prerequisites of `id`.
    pub fn hard_dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.predecessors
            .get(id)
            .map(|preds| {
                preds
                    .iter()
                    .filter(|(_, s)| **s == EdgeStrength::Hard)
                    .map(|(p, _)| *p)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of `id` over hard edges.
    pub fn direct_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.successors
            .get(id)
            .map(|succs| {
                succs
                    .iter()
                    .filter(|(_, s)| **s == EdgeStrength::Hard)
                    .map(|(t, _)| *t)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All transitive dependents of `id` over hard edges.
    pub fn transitive_dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.direct_dependents(id).into();
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(self.direct_dependents(&node));
            }
        }
        seen
    }

    /// Whether every hard prerequisite of `id` is in `completed`.
    pub fn hard_deps_satisfied(&self, id: &TaskId, completed: &HashSet<TaskId>) -> bool {
        self.hard_dependencies_of(id)
            .iter()
            .all(|d| completed.contains(d))
    }

    /// Find a path `from -> ... -> to` over hard edges, if one exists.
    fn hard_path(&self, from: TaskId, to: TaskId) -> Option<Vec<TaskId>> {
        let mut parents: HashMap<TaskId, TaskId> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(parent) = parents.get(&cursor) {
                    path.push(*parent);
                    cursor = *parent;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(succs) = self.successors.get(&node) {
                for (next, strength) in succs {
                    if *strength == EdgeStrength::Hard && seen.insert(*next) {
                        parents.insert(*next, node);
                        queue.push_back(*next);
                    }
                }
            }
        }
        None
    }

    /// Run the full validation pass: hard cycles are errors; orphans,
    /// excessive fan-in, very long chains and advisory cycles warn.
    pub fn validate(&self) -> GraphValidationReport {
        let mut report = GraphValidationReport::default();

        let cycles = self.detect_cycles();
        for cycle in &cycles {
            // A cycle that survives on hard edges alone is unschedulable;
            // one held together by advisory edges only warns.
            let hard = self.hard_only_cycle(cycle);
            let issue = GraphIssue {
                code: if hard { "hard_cycle" } else { "advisory_cycle" }.to_string(),
                message: format!("cycle over {} nodes", cycle.nodes.len()),
                nodes: cycle.nodes.clone(),
            };
            if hard {
                report.errors.push(issue);
            } else {
                report.warnings.push(issue);
            }
        }
        report.cycles = cycles;

        for id in self.efforts.keys() {
            let in_deg = self.predecessors.get(id).map_or(0, HashMap::len);
            let out_deg = self.successors.get(id).map_or(0, HashMap::len);
            if in_deg == 0 && out_deg == 0 && self.efforts.len() > 1 {
                report.warnings.push(GraphIssue {
                    code: "orphan_node".to_string(),
                    message: format!("node {id} has no edges"),
                    nodes: vec![*id],
                });
            }
            let hard_in = self.hard_dependencies_of(id).len();
            if hard_in > FAN_IN_WARNING {
                report.warnings.push(GraphIssue {
                    code: "excessive_fan_in".to_string(),
                    message: format!("node {id} has {hard_in} hard prerequisites"),
                    nodes: vec![*id],
                });
            }
        }

        if let Some(depth) = self.longest_hard_chain() {
            if depth > CHAIN_WARNING {
                report.warnings.push(GraphIssue {
                    code: "long_chain".to_string(),
                    message: format!("longest hard chain spans {depth} nodes"),
                    nodes: Vec::new(),
                });
            }
        }

        report
    }

    /// Whether a cycle survives after removing soft/hint edges.
    fn hard_only_cycle(&self, cycle: &CycleInfo) -> bool {
        // Restrict the component to its hard edges and look for any cycle
        // via Kahn: if some node never reaches in-degree zero, one exists.
        let nodes: HashSet<&TaskId> = cycle.nodes.iter().collect();
        let mut in_deg: HashMap<TaskId, usize> =
            cycle.nodes.iter().map(|n| (*n, 0)).collect();
        for edge in &cycle.edges {
            if edge.strength == EdgeStrength::Hard && nodes.contains(&edge.to) {
                *in_deg.entry(edge.to).or_insert(0) += 1;
            }
        }
        let mut queue: VecDeque<TaskId> = in_deg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for edge in &cycle.edges {
                if edge.from == node && edge.strength == EdgeStrength::Hard {
                    if let Some(d) = in_deg.get_mut(&edge.to) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(edge.to);
                        }
                    }
                }
            }
        }
        visited < cycle.nodes.len()
    }

    /// Tarjan strongly-connected components over all edges, O(V+E).
    ///
    /// Returns one [`CycleInfo`] per component of size >= 2, with the
    /// component's internal edges and breaking points ranked cheapest
    /// first.
    pub fn detect_cycles(&self) -> Vec<CycleInfo> {
        let mut state = TarjanState {
            graph: self,
            index: 0,
            indices: HashMap::new(),
            lowlinks: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            components: Vec::new(),
        };
        let mut ids: Vec<TaskId> = self.efforts.keys().copied().collect();
        ids.sort();
        for id in ids {
            if !state.indices.contains_key(&id) {
                state.strongconnect(id);
            }
        }

        state
            .components
            .into_iter()
            .filter(|c| c.len() >= 2)
            .map(|mut nodes| {
                nodes.sort();
                let node_set: HashSet<TaskId> = nodes.iter().copied().collect();
                let mut edges = Vec::new();
                for from in &nodes {
                    if let Some(succs) = self.successors.get(from) {
                        for (to, strength) in succs {
                            if node_set.contains(to) {
                                edges.push(DependencyEdge {
                                    from: *from,
                                    to: *to,
                                    strength: *strength,
                                });
                            }
                        }
                    }
                }
                let mut breaking_points: Vec<BreakingPoint> = edges
                    .iter()
                    .map(|e| BreakingPoint {
                        from: e.from,
                        to: e.to,
                        strength: e.strength,
                        cost: e.strength.breaking_cost(),
                    })
                    .collect();
                breaking_points.sort_by_key(|b| (b.cost, b.from, b.to));
                CycleInfo {
                    nodes,
                    edges,
                    breaking_points,
                }
            })
            .collect()
    }

    /// Kahn's algorithm over hard edges, O(V+E).
    ///
    /// Fails with a Precondition error naming a cycle if one exists.
    pub fn topological_sort(&self) -> FabricResult<Vec<TaskId>> {
        let mut in_deg: HashMap<TaskId, usize> = self
            .efforts
            .keys()
            .map(|id| (*id, self.hard_dependencies_of(id).len()))
            .collect();
        let mut ready: Vec<TaskId> = in_deg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        // Deterministic output: break ties by id.
        ready.sort();
        let mut queue: VecDeque<TaskId> = ready.into();
        let mut order = Vec::with_capacity(self.efforts.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            let mut unlocked = Vec::new();
            for next in self.direct_dependents(&node) {
                if let Some(d) = in_deg.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        unlocked.push(next);
                    }
                }
            }
            unlocked.sort();
            queue.extend(unlocked);
        }

        if order.len() < self.efforts.len() {
            let cycle = self
                .detect_cycles()
                .into_iter()
                .find(|c| self.hard_only_cycle(c))
                .map(|c| c.nodes)
                .unwrap_or_default();
            return Err(FabricError::Precondition {
                message: "hard dependency cycle prevents topological ordering".to_string(),
                cycle,
            });
        }
        Ok(order)
    }

    /// Critical-path (CPM) analysis over hard edges.
    ///
    /// Forward pass: `ES(n) = max EF(pred)`, `EF(n) = ES(n) + effort(n)`.
    /// Backward pass: `LF(n) = min LS(succ)` (project finish for sinks),
    /// `LS(n) = LF(n) - effort(n)`. Critical nodes have zero slack;
    /// bottlenecks are critical nodes with effort above 1.5x the mean.
    pub fn critical_path(&self) -> FabricResult<CriticalPathAnalysis> {
        let order = self.topological_sort()?;

        let mut early: HashMap<TaskId, (u64, u64)> = HashMap::new();
        for id in &order {
            let es = self
                .hard_dependencies_of(id)
                .iter()
                .map(|p| early.get(p).map(|(_, ef)| *ef).unwrap_or(0))
                .max()
                .unwrap_or(0);
            let effort = *self.efforts.get(id).unwrap_or(&0);
            early.insert(*id, (es, es + effort));
        }
        let project_duration_ms = early.values().map(|(_, ef)| *ef).max().unwrap_or(0);

        let mut late: HashMap<TaskId, (u64, u64)> = HashMap::new();
        for id in order.iter().rev() {
            let dependents = self.direct_dependents(id);
            let lf = if dependents.is_empty() {
                project_duration_ms
            } else {
                dependents
                    .iter()
                    .map(|s| late.get(s).map(|(ls, _)| *ls).unwrap_or(project_duration_ms))
                    .min()
                    .unwrap_or(project_duration_ms)
            };
            let effort = *self.efforts.get(id).unwrap_or(&0);
            late.insert(*id, (lf.saturating_sub(effort), lf));
        }

        let mut schedule = HashMap::with_capacity(order.len());
        let mut critical_nodes = Vec::new();
        for id in &order {
            let (es, ef) = early[id];
            let (ls, lf) = late[id];
            let slack = ls.saturating_sub(es);
            schedule.insert(
                *id,
                NodeSchedule {
                    early_start_ms: es,
                    early_finish_ms: ef,
                    late_start_ms: ls,
                    late_finish_ms: lf,
                    slack_ms: slack,
                },
            );
            if slack == 0 {
                critical_nodes.push(*id);
            }
        }

        let mean_effort = if self.efforts.is_empty() {
            0.0
        } else {
            self.efforts.values().sum::<u64>() as f64 / self.efforts.len() as f64
        };
        let bottlenecks = critical_nodes
            .iter()
            .filter(|id| *self.efforts.get(id).unwrap_or(&0) as f64 > 1.5 * mean_effort)
            .copied()
            .collect();

        Ok(CriticalPathAnalysis {
            schedule,
            project_duration_ms,
            critical_nodes,
            bottlenecks,
        })
    }

    /// Partition nodes into BFS levels over hard edges:
    /// `level(n) = 1 + max(level(predecessors))`. Nodes in the same group
    /// are safe to run concurrently.
    pub fn parallel_groups(&self) -> FabricResult<Vec<Vec<TaskId>>> {
        let order = self.topological_sort()?;
        let mut level: HashMap<TaskId, usize> = HashMap::new();
        let mut groups: Vec<Vec<TaskId>> = Vec::new();
        for id in &order {
            let lvl = self
                .hard_dependencies_of(id)
                .iter()
                .map(|p| level.get(p).copied().unwrap_or(0))
                .max()
                .map(|m| m + 1)
                .unwrap_or(1);
            level.insert(*id, lvl);
            while groups.len() < lvl {
                groups.push(Vec::new());
            }
            groups[lvl - 1].push(*id);
        }
        for group in &mut groups {
            group.sort();
        }
        Ok(groups)
    }

    /// Length in nodes of the longest hard chain, if the graph is acyclic.
    fn longest_hard_chain(&self) -> Option<usize> {
        self.parallel_groups().ok().map(|g| g.len())
    }
}

/// Working state for the Tarjan SCC traversal
struct TarjanState<'a> {
    graph: &'a DependencyGraph,
    index: usize,
    indices: HashMap<TaskId, usize>,
    lowlinks: HashMap<TaskId, usize>,
    on_stack: HashSet<TaskId>,
    stack: Vec<TaskId>,
    components: Vec<Vec<TaskId>>,
}

impl TarjanState<'_> {
    fn strongconnect(&mut self, v: TaskId) {
        self.indices.insert(v, self.index);
        self.lowlinks.insert(v, self.index);
        self.index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let successors: Vec<TaskId> = self
            .graph
            .successors
            .get(&v)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        for w in successors {
            if !self.indices.contains_key(&w) {
                self.strongconnect(w);
                let low = self.lowlinks[&v].min(self.lowlinks[&w]);
                self.lowlinks.insert(v, low);
            } else if self.on_stack.contains(&w) {
                let low = self.lowlinks[&v].min(self.indices[&w]);
                self.lowlinks.insert(v, low);
            }
        }

        if self.lowlinks[&v] == self.indices[&v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack.remove(&w);
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids(n: usize) -> Vec<TaskId> {
        let mut v: Vec<TaskId> = (0..n).map(|_| Uuid::new_v4()).collect();
        v.sort();
        v
    }

    #[test]
    fn rejects_hard_cycle_atomically() {
        let mut graph = DependencyGraph::new();
        let n = ids(2);
        graph.add_node(n[0], 10);
        graph.add_node(n[1], 10);
        // B depends on A.
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        // A depends on B would close the loop.
        let err = graph
            .add_dependency(n[0], n[1], EdgeStrength::Hard)
            .unwrap_err();
        match err {
            FabricError::Precondition { cycle, .. } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&n[0]) && cycle.contains(&n[1]));
            }
            other => panic!("expected precondition error, got {other:?}"),
        }
        // No state change.
        assert_eq!(graph.edges().len(), 1);
        assert!(graph.topological_sort().is_ok());
    }

    #[test]
    fn advisory_cycles_are_allowed_but_detected() {
        let mut graph = DependencyGraph::new();
        let n = ids(2);
        graph.add_node(n[0], 1);
        graph.add_node(n[1], 1);
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[0], n[1], EdgeStrength::Soft).unwrap();

        let cycles = graph.detect_cycles();
        assert_eq!(cycles.len(), 1);
        // Cheapest breaking point is the soft edge.
        assert_eq!(cycles[0].breaking_points[0].cost, 5);

        let report = graph.validate();
        assert!(report.is_valid());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.code == "advisory_cycle"));
        // Hard-only ordering still works.
        assert!(graph.topological_sort().is_ok());
    }

    #[test]
    fn topological_sort_is_a_linear_extension() {
        let mut graph = DependencyGraph::new();
        let n = ids(4);
        for id in &n {
            graph.add_node(*id, 1);
        }
        // Diamond: n1 and n2 depend on n0; n3 depends on both.
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[2], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[3], n[1], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[3], n[2], EdgeStrength::Hard).unwrap();

        let order = graph.topological_sort().unwrap();
        let pos: HashMap<TaskId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for edge in graph.edges() {
            assert!(pos[&edge.from] < pos[&edge.to]);
        }
    }

    #[test]
    fn critical_path_linear_chain() {
        let mut graph = DependencyGraph::new();
        let n = ids(3);
        for id in &n {
            graph.add_node(*id, 10);
        }
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[2], n[1], EdgeStrength::Hard).unwrap();

        let analysis = graph.critical_path().unwrap();
        assert_eq!(analysis.project_duration_ms, 30);
        assert_eq!(analysis.critical_nodes.len(), 3);
        for id in &n {
            let sched = analysis.schedule[id];
            assert_eq!(sched.early_start_ms, sched.late_start_ms);
        }
    }

    #[test]
    fn critical_path_diamond_skews_to_long_branch() {
        let mut graph = DependencyGraph::new();
        let n = ids(4);
        let efforts = [5u64, 10, 20, 5];
        for (id, effort) in n.iter().zip(efforts) {
            graph.add_node(*id, effort);
        }
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[2], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[3], n[1], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[3], n[2], EdgeStrength::Hard).unwrap();

        let analysis = graph.critical_path().unwrap();
        assert_eq!(analysis.project_duration_ms, 30);
        // The 10ms branch has slack; the 20ms branch is critical.
        assert!(analysis.critical_nodes.contains(&n[2]));
        assert!(!analysis.critical_nodes.contains(&n[1]));
        assert!(analysis.schedule[&n[1]].slack_ms > 0);
        // 20 > 1.5 * mean(10) -> bottleneck.
        assert!(analysis.bottlenecks.contains(&n[2]));
    }

    #[test]
    fn parallel_groups_are_bfs_levels() {
        let mut graph = DependencyGraph::new();
        let n = ids(4);
        for id in &n {
            graph.add_node(*id, 1);
        }
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[2], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[3], n[1], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[3], n[2], EdgeStrength::Hard).unwrap();

        let groups = graph.parallel_groups().unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![n[0]]);
        let mut mid = groups[1].clone();
        mid.sort();
        let mut expected = vec![n[1], n[2]];
        expected.sort();
        assert_eq!(mid, expected);
        assert_eq!(groups[2], vec![n[3]]);
    }

    #[test]
    fn transitive_dependents_follow_hard_edges_only() {
        let mut graph = DependencyGraph::new();
        let n = ids(3);
        for id in &n {
            graph.add_node(*id, 1);
        }
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[2], n[1], EdgeStrength::Soft).unwrap();

        let deps = graph.transitive_dependents(&n[0]);
        assert!(deps.contains(&n[1]));
        assert!(!deps.contains(&n[2]));
    }

    #[test]
    fn remove_node_drops_edges_both_ways() {
        let mut graph = DependencyGraph::new();
        let n = ids(3);
        for id in &n {
            graph.add_node(*id, 1);
        }
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        graph.add_dependency(n[2], n[1], EdgeStrength::Hard).unwrap();
        graph.remove_node(&n[1]);
        assert!(graph.edges().is_empty());
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn validate_warns_on_orphans() {
        let mut graph = DependencyGraph::new();
        let n = ids(3);
        for id in &n {
            graph.add_node(*id, 1);
        }
        graph.add_dependency(n[1], n[0], EdgeStrength::Hard).unwrap();
        let report = graph.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.code == "orphan_node"));
    }
}
