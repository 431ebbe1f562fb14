//! Dependency graph over the tasks of one feature.
//!
//! Nodes are addressed by sequence number. A dependency may only point at a
//! lower sequence number of the same feature, so any graph that passes
//! [`TaskGraph::build`] is acyclic.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::errors::OrchestrationError;
use crate::store::models::TaskSpec;

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    /// sequence -> sequences it depends on
    dependencies: BTreeMap<i64, Vec<i64>>,
    /// sequence -> sequences that depend on it
    dependents: BTreeMap<i64, Vec<i64>>,
}

impl TaskGraph {
    /// Validate and build the graph for one feature's task list.
    ///
    /// Rejects duplicate sequence numbers, references to sequence numbers
    /// outside the feature, and forward or self references.
    pub fn build(feature_id: &str, specs: &[TaskSpec]) -> Result<Self, OrchestrationError> {
        let invalid = |message: String| OrchestrationError::InvalidGraph {
            feature_id: feature_id.to_string(),
            message,
        };

        if specs.is_empty() {
            return Err(invalid("feature has no tasks".to_string()));
        }

        let mut graph = TaskGraph::default();
        for spec in specs {
            if graph.dependencies.contains_key(&spec.sequence_number) {
                return Err(invalid(format!(
                    "duplicate sequence number {}",
                    spec.sequence_number
                )));
            }
            graph.dependencies.insert(spec.sequence_number, Vec::new());
            graph.dependents.insert(spec.sequence_number, Vec::new());
        }

        for spec in specs {
            let mut seen = HashSet::new();
            for &dep in &spec.depends_on {
                if !graph.dependencies.contains_key(&dep) {
                    return Err(invalid(format!(
                        "task {} depends on unknown sequence number {}",
                        spec.sequence_number, dep
                    )));
                }
                if dep >= spec.sequence_number {
                    return Err(invalid(format!(
                        "task {} has a forward or cyclic reference to {}",
                        spec.sequence_number, dep
                    )));
                }
                if !seen.insert(dep) {
                    continue;
                }
                if let Some(deps) = graph.dependencies.get_mut(&spec.sequence_number) {
                    deps.push(dep);
                }
                if let Some(children) = graph.dependents.get_mut(&dep) {
                    children.push(spec.sequence_number);
                }
            }
        }

        Ok(graph)
    }

    /// Rebuild from stored `(sequence, depends_on)` pairs without validation.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (i64, Vec<i64>)>,
    {
        let mut graph = TaskGraph::default();
        let edges: Vec<(i64, Vec<i64>)> = edges.into_iter().collect();
        for (seq, _) in &edges {
            graph.dependencies.entry(*seq).or_default();
            graph.dependents.entry(*seq).or_default();
        }
        for (seq, deps) in edges {
            for dep in &deps {
                graph.dependents.entry(*dep).or_default().push(seq);
            }
            graph.dependencies.insert(seq, deps);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependencies(&self, seq: i64) -> &[i64] {
        self.dependencies.get(&seq).map_or(&[], |v| v.as_slice())
    }

    pub fn dependents(&self, seq: i64) -> &[i64] {
        self.dependents.get(&seq).map_or(&[], |v| v.as_slice())
    }

    /// Strict AND-join: every dependency must be in `completed`.
    pub fn dependencies_satisfied(&self, seq: i64, completed: &HashSet<i64>) -> bool {
        self.dependencies(seq).iter().all(|d| completed.contains(d))
    }

    /// Every task reachable through dependent edges from `seq`, excluding
    /// `seq` itself, in breadth-first order.
    pub fn transitive_dependents(&self, seq: i64) -> Vec<i64> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<i64> = self.dependents(seq).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                order.push(next);
                queue.extend(self.dependents(next).iter().copied());
            }
        }
        order
    }
}
