//! Task graph construction and validation.
//!
//! `TaskGraph::build` ingests a task-graph document and produces a
//! validated DAG with derived levels and an exclusive file-ownership
//! index. Validation failures (duplicate ids, cycles, ownership
//! conflicts) are fatal and never auto-resolved.

use crate::error::{Error, Result};
use crate::graph::task::{FileSet, Task, TaskId, TaskStatus, Verification};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// One task entry in the task-graph document.
///
/// `level` is accepted for compatibility with hand-edited documents but
/// treated as cosmetic metadata; the graph-derived level is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub level: Option<usize>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: FileSet,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub verification: Verification,
}

/// The task-graph document consumed by `TaskGraph::build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub tasks: Vec<TaskSpec>,
}

impl GraphSpec {
    /// Parse a graph document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// DFS colors for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The validated task dependency graph.
///
/// Uses petgraph's `DiGraph` as the adjacency store (edges point from a
/// dependency to its dependent) alongside the task map and the derived
/// per-level and ownership indices. Built once per feature run;
/// structure is read-only after validation, task status is mutated by
/// the orchestrator through `get_mut`.
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    node_index: HashMap<TaskId, NodeIndex>,
    tasks: BTreeMap<TaskId, Task>,
    /// Task ids grouped by derived level, each group sorted by id.
    levels: Vec<Vec<TaskId>>,
    /// (level, path) -> owning task for every create/modify claim.
    owners: HashMap<(usize, String), TaskId>,
}

impl TaskGraph {
    /// Build and validate a task graph from a document.
    ///
    /// Validation order: id syntax, duplicate ids, unknown dependencies,
    /// cycles, then per-level file ownership. The first violation is
    /// returned; all are fatal.
    pub fn build(spec: GraphSpec) -> Result<Self> {
        // Parse and de-duplicate ids.
        let mut ids: Vec<TaskId> = Vec::with_capacity(spec.tasks.len());
        let mut seen: HashSet<TaskId> = HashSet::new();
        for entry in &spec.tasks {
            let id = TaskId::parse(&entry.id)?;
            if !seen.insert(id.clone()) {
                return Err(Error::DuplicateTaskId(entry.id.clone()));
            }
            ids.push(id);
        }

        // Resolve dependency sets, rejecting unknown ids and per-task
        // create/modify overlap.
        let mut deps: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        for (entry, id) in spec.tasks.iter().zip(&ids) {
            let overlap = entry.files.internal_overlap();
            if let Some(path) = overlap.first() {
                return Err(Error::Validation(format!(
                    "task {} lists '{}' in both create and modify",
                    id, path
                )));
            }
            let mut set = BTreeSet::new();
            for dep in &entry.dependencies {
                let dep_id = TaskId::parse(dep)?;
                if !seen.contains(&dep_id) {
                    return Err(Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        id, dep_id
                    )));
                }
                set.insert(dep_id);
            }
            deps.insert(id.clone(), set);
        }

        detect_cycle(&deps)?;
        let levels_by_task = derive_levels(&deps);

        // Assemble tasks with derived levels; the document's level hint
        // is ignored.
        let mut tasks: BTreeMap<TaskId, Task> = BTreeMap::new();
        for (entry, id) in spec.tasks.into_iter().zip(ids.iter()) {
            let level = levels_by_task[id];
            tasks.insert(
                id.clone(),
                Task {
                    id: id.clone(),
                    title: entry.title,
                    level,
                    dependencies: deps[id].clone(),
                    files: entry.files,
                    acceptance_criteria: entry.acceptance_criteria,
                    verification: entry.verification,
                    status: TaskStatus::Pending,
                    worker_id: None,
                    started_at: None,
                    completed_at: None,
                    attempts: 0,
                },
            );
        }

        // Per-level exclusive ownership of create/modify paths.
        let mut owners: HashMap<(usize, String), TaskId> = HashMap::new();
        for task in tasks.values() {
            for path in task.files.exclusive() {
                let key = (task.level, path.clone());
                if let Some(first) = owners.get(&key) {
                    return Err(Error::OwnershipConflict {
                        path: path.clone(),
                        first: first.to_string(),
                        second: task.id.to_string(),
                    });
                }
                owners.insert(key, task.id.clone());
            }
        }

        // Level index.
        let level_count = tasks.values().map(|t| t.level + 1).max().unwrap_or(0);
        let mut levels: Vec<Vec<TaskId>> = vec![Vec::new(); level_count];
        for task in tasks.values() {
            levels[task.level].push(task.id.clone());
        }

        // Adjacency store: dependency -> dependent.
        let mut graph = DiGraph::new();
        let mut node_index = HashMap::new();
        for id in tasks.keys() {
            let index = graph.add_node(id.clone());
            node_index.insert(id.clone(), index);
        }
        for (id, dep_set) in &deps {
            for dep in dep_set {
                graph.add_edge(node_index[dep], node_index[id], ());
            }
        }

        Ok(Self {
            graph,
            node_index,
            tasks,
            levels,
            owners,
        })
    }

    /// Get a reference to a task by its ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the graph contains no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of barrier-separated levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// All tasks at the given level, in id order.
    pub fn level_tasks(&self, level: usize) -> Vec<&Task> {
        self.levels
            .get(level)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Tasks whose dependencies are all in the completed set and that
    /// are not themselves completed.
    pub fn ready_tasks(&self, completed: &BTreeSet<TaskId>) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| !completed.contains(&task.id))
            .filter(|task| task.dependencies.iter().all(|dep| completed.contains(dep)))
            .collect()
    }

    /// All tasks, in id order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Tasks the given task depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.tasks
            .get(id)
            .map(|t| t.dependencies.iter().filter_map(|d| self.tasks.get(d)).collect())
            .unwrap_or_default()
    }

    /// Tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        if let Some(&index) = self.node_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .filter_map(|n| self.tasks.get(&self.graph[n]))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// The task owning `path` at `level`, if any claims it exclusively.
    pub fn owner_of(&self, level: usize, path: &str) -> Option<&TaskId> {
        self.owners.get(&(level, path.to_string()))
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("levels", &self.level_count())
            .finish()
    }
}

/// Three-coloring DFS cycle detection.
///
/// White = unvisited, gray = on the current DFS path, black = finished.
/// A dependency edge into a gray node is a back-edge; the cycle is the
/// gray path from that node to the top of the stack, reported in order
/// with the entry node repeated at the end.
fn detect_cycle(deps: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> Result<()> {
    let mut colors: HashMap<&TaskId, Color> =
        deps.keys().map(|id| (id, Color::White)).collect();

    for start in deps.keys() {
        if colors[start] != Color::White {
            continue;
        }
        // Iterative DFS so deep graphs cannot overflow the stack. Each
        // frame holds the node and an iterator over its dependencies.
        let mut stack: Vec<(&TaskId, std::collections::btree_set::Iter<TaskId>)> =
            vec![(start, deps[start].iter())];
        colors.insert(start, Color::Gray);

        while let Some((node, iter)) = stack.last_mut() {
            match iter.next() {
                Some(dep) => match colors[dep] {
                    Color::White => {
                        colors.insert(dep, Color::Gray);
                        stack.push((dep, deps[dep].iter()));
                    }
                    Color::Gray => {
                        // Back-edge: extract the cycle from the gray path.
                        let mut cycle: Vec<String> = stack
                            .iter()
                            .map(|(id, _)| id.to_string())
                            .skip_while(|id| id != &dep.to_string())
                            .collect();
                        cycle.push(dep.to_string());
                        return Err(Error::CircularDependency { cycle });
                    }
                    Color::Black => {}
                },
                None => {
                    colors.insert(*node, Color::Black);
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

/// Longest-path level derivation over an acyclic dependency map:
/// `level = 1 + max(level of dependencies)`, 0 for source tasks.
fn derive_levels(deps: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> BTreeMap<TaskId, usize> {
    fn level_of(
        id: &TaskId,
        deps: &BTreeMap<TaskId, BTreeSet<TaskId>>,
        memo: &mut BTreeMap<TaskId, usize>,
    ) -> usize {
        if let Some(&level) = memo.get(id) {
            return level;
        }
        let level = deps[id]
            .iter()
            .map(|dep| level_of(dep, deps, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(id.clone(), level);
        level
    }

    let mut memo = BTreeMap::new();
    for id in deps.keys() {
        level_of(id, deps, &mut memo);
    }
    memo
}
