//! Batched topological scheduling.
//!
//! [`plan`] turns a validated [`DependencyGraph`] into an
//! [`InitializationPlan`]: layers of components that can start concurrently,
//! every layer depending only on earlier ones.

use crate::error::{DiError, DiResult};
use crate::graph::DependencyGraph;
use crate::key::Key;

/// Ordered batches of component keys.
///
/// Inside a batch no component depends on another; batch *i* depends only on
/// batches before it. Flattening gives a topological order, and
/// [`reversed`](Self::reversed) gives the matching shutdown order.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{plan, DependencyGraph, Dependencies, Factory, Key, Registry, ServiceDescriptor};
///
/// let registry = Registry::new();
/// registry.register(ServiceDescriptor::singleton("a", Factory::instance(()))).unwrap();
/// registry.register(ServiceDescriptor::singleton("b", Factory::instance(()))
///     .with_dependencies(Dependencies::on(["a"]))).unwrap();
/// registry.register(ServiceDescriptor::singleton("c", Factory::instance(()))
///     .with_dependencies(Dependencies::on(["a", "b"]))).unwrap();
///
/// let (graph, errors) = DependencyGraph::build(&registry.snapshot());
/// assert!(errors.is_empty());
/// let plan = plan(&graph).unwrap();
/// assert_eq!(plan.batches(), &[
///     vec![Key::named("a")],
///     vec![Key::named("b")],
///     vec![Key::named("c")],
/// ]);
/// assert_eq!(plan.reversed().reversed(), plan);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitializationPlan {
    batches: Vec<Vec<Key>>,
    generation: u64,
}

impl InitializationPlan {
    pub fn batches(&self) -> &[Vec<Key>] {
        &self.batches
    }

    /// All keys, batch by batch.
    pub fn flatten(&self) -> Vec<Key> {
        self.batches.iter().flatten().cloned().collect()
    }

    /// The shutdown plan: batches in reverse order, each batch reversed, so
    /// the flattened result is exactly the reversed flattened plan.
    pub fn reversed(&self) -> InitializationPlan {
        InitializationPlan {
            batches: self
                .batches
                .iter()
                .rev()
                .map(|batch| batch.iter().rev().cloned().collect())
                .collect(),
            generation: self.generation,
        }
    }

    pub fn batch_index_of(&self, key: &Key) -> Option<usize> {
        self.batches.iter().position(|batch| batch.contains(key))
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn component_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Registry generation of the graph the plan was computed from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Computes the initialization plan with a layered Kahn's algorithm.
///
/// Nodes without dependencies form batch 0; removing batch *k* exposes the
/// nodes of batch *k + 1*. Inside a batch, higher priority comes first, then
/// earlier registration. The result is a pure function of the graph.
///
/// Fails with [`DiError::CircularDependency`] when the graph has a cycle.
pub fn plan(graph: &DependencyGraph) -> DiResult<InitializationPlan> {
    let nodes = graph.nodes();
    let mut pending: Vec<usize> = (0..nodes.len()).map(|n| graph.edges_from(n).len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for node in 0..nodes.len() {
        for edge in graph.edges_from(node) {
            dependents[edge.target].push(node);
        }
    }

    let mut current: Vec<usize> = (0..nodes.len()).filter(|&n| pending[n] == 0).collect();
    let mut batches = Vec::new();
    let mut scheduled = 0;

    while !current.is_empty() {
        current.sort_by(|&a, &b| {
            nodes[b]
                .priority
                .cmp(&nodes[a].priority)
                .then(nodes[a].sequence.cmp(&nodes[b].sequence))
        });
        scheduled += current.len();

        let mut next = Vec::new();
        for &node in &current {
            for &dependent in &dependents[node] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        batches.push(current.iter().map(|&n| nodes[n].key.clone()).collect());
        current = next;
    }

    if scheduled < nodes.len() {
        let cycle = graph.find_cycle().unwrap_or_else(|| {
            nodes
                .iter()
                .enumerate()
                .filter(|(n, _)| pending[*n] > 0)
                .map(|(_, node)| node.key.clone())
                .collect()
        });
        return Err(DiError::CircularDependency { cycle });
    }

    tracing::debug!(batches = batches.len(), components = scheduled, "initialization plan computed");
    Ok(InitializationPlan {
        batches,
        generation: graph.generation(),
    })
}
