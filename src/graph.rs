//! Dependency graph construction and validation.
//!
//! Building a graph is pure: it reads a [`RegistrySnapshot`] and never runs a
//! factory. Validation reports every missing required dependency and the
//! first dependency cycle found.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::DiError;
use crate::key::Key;
use crate::lifetime::Lifetime;
use crate::registration::{Registry, RegistrySnapshot};

/// Problem found while building a [`DependencyGraph`]. Both kinds are fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `service` requires `dependency`, which is not registered
    MissingRequiredDependency { service: Key, dependency: Key },
    /// Cycle in detection order; the first key is repeated at the end
    CircularDependency { cycle: Vec<Key> },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRequiredDependency { service, dependency } => {
                write!(f, "{} requires missing {}", service, dependency)
            }
            ValidationError::CircularDependency { cycle } => {
                let path: Vec<_> = cycle.iter().map(Key::display_name).collect();
                write!(f, "cycle {}", path.join(" -> "))
            }
        }
    }
}

impl From<ValidationError> for DiError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::MissingRequiredDependency { service, dependency } => {
                DiError::MissingRequiredDependency { service, dependency }
            }
            ValidationError::CircularDependency { cycle } => DiError::CircularDependency { cycle },
        }
    }
}

/// A registered descriptor as seen by the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub key: Key,
    pub lifetime: Lifetime,
    pub priority: i32,
    pub critical: bool,
    /// Registration order
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub(crate) target: usize,
    pub(crate) required: bool,
}

/// Directed graph of dependency edges (dependent → dependency).
///
/// Nodes keep registration order. Only keys that were registered when the
/// graph was built appear as edge targets: unsatisfiable optional edges are
/// dropped and duplicate edges collapse into one.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{DependencyGraph, Dependencies, Factory, Key, Registry, ServiceDescriptor, ValidationError};
///
/// let registry = Registry::new();
/// registry.register(ServiceDescriptor::singleton("a", Factory::instance(()))
///     .with_dependencies(Dependencies::on(["b"]))).unwrap();
/// registry.register(ServiceDescriptor::singleton("b", Factory::instance(()))
///     .with_dependencies(Dependencies::on(["a"]))).unwrap();
///
/// let (_graph, errors) = DependencyGraph::build(&registry.snapshot());
/// assert_eq!(errors, vec![ValidationError::CircularDependency {
///     cycle: vec![Key::named("a"), Key::named("b"), Key::named("a")],
/// }]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: AHashMap<Key, usize>,
    edges: Vec<Vec<Edge>>,
    reverse: Vec<Vec<usize>>,
    generation: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Builds and validates the graph for a registry snapshot.
    pub fn build(snapshot: &RegistrySnapshot) -> (DependencyGraph, Vec<ValidationError>) {
        let mut graph = DependencyGraph {
            generation: snapshot.generation(),
            ..Default::default()
        };
        for descriptor in snapshot.iter() {
            graph.index.insert(descriptor.key.clone(), graph.nodes.len());
            graph.nodes.push(GraphNode {
                key: descriptor.key.clone(),
                lifetime: descriptor.lifetime,
                priority: descriptor.priority,
                critical: descriptor.critical,
                sequence: descriptor.sequence(),
            });
        }
        graph.edges = vec![Vec::new(); graph.nodes.len()];
        graph.reverse = vec![Vec::new(); graph.nodes.len()];

        let mut errors = Vec::new();
        for (from, descriptor) in snapshot.iter().enumerate() {
            for (dependency, required) in descriptor.dependencies.iter() {
                match graph.index.get(dependency) {
                    Some(&target) => graph.add_edge(from, target, required),
                    None if required => errors.push(ValidationError::MissingRequiredDependency {
                        service: descriptor.key.clone(),
                        dependency: dependency.clone(),
                    }),
                    None => {
                        tracing::debug!(
                            service = %descriptor.key,
                            dependency = %dependency,
                            "optional dependency not registered, edge dropped"
                        );
                    }
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            errors.push(ValidationError::CircularDependency { cycle });
        }
        (graph, errors)
    }

    fn add_edge(&mut self, from: usize, target: usize, required: bool) {
        if let Some(existing) = self.edges[from].iter_mut().find(|e| e.target == target) {
            existing.required |= required;
            return;
        }
        self.edges[from].push(Edge { target, required });
        self.reverse[target].push(from);
    }

    /// First cycle reachable by a depth-first walk from the nodes in
    /// registration order, reported by walking the in-progress stack back to
    /// the repeated node.
    pub fn find_cycle(&self) -> Option<Vec<Key>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path: Vec<usize> = Vec::new();
        // (node, index of next edge to explore)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::InProgress;
            path.push(root);
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if let Some(edge) = self.edges[node].get(next) {
                    frame.1 += 1;
                    match marks[edge.target] {
                        Mark::Unvisited => {
                            marks[edge.target] = Mark::InProgress;
                            path.push(edge.target);
                            stack.push((edge.target, 0));
                        }
                        Mark::InProgress => {
                            let start = path.iter().position(|&n| n == edge.target).unwrap_or(0);
                            let mut cycle: Vec<Key> =
                                path[start..].iter().map(|&n| self.nodes[n].key.clone()).collect();
                            cycle.push(self.nodes[edge.target].key.clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, key: &Key) -> Option<&GraphNode> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }

    /// Registry generation this graph was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Direct dependencies of `key` (required and satisfied optional).
    pub fn dependencies_of(&self, key: &Key) -> Vec<&Key> {
        self.index
            .get(key)
            .map(|&i| self.edges[i].iter().map(|e| &self.nodes[e.target].key).collect())
            .unwrap_or_default()
    }

    /// Direct required dependencies of `key`.
    pub fn required_dependencies_of(&self, key: &Key) -> Vec<&Key> {
        self.index
            .get(key)
            .map(|&i| {
                self.edges[i]
                    .iter()
                    .filter(|e| e.required)
                    .map(|e| &self.nodes[e.target].key)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of `key`.
    pub fn dependents_of(&self, key: &Key) -> Vec<&Key> {
        self.index
            .get(key)
            .map(|&i| self.reverse[i].iter().map(|&n| &self.nodes[n].key).collect())
            .unwrap_or_default()
    }

    /// Every node that depends on `key` directly or transitively, breadth
    /// first. `key` itself is not included.
    pub fn transitive_dependents(&self, key: &Key) -> Vec<Key> {
        let Some(&start) = self.index.get(key) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        seen[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(node) = queue.pop_front() {
            for &dependent in &self.reverse[node] {
                if !seen[dependent] {
                    seen[dependent] = true;
                    out.push(self.nodes[dependent].key.clone());
                    queue.push_back(dependent);
                }
            }
        }
        out
    }

    pub(crate) fn index_of(&self, key: &Key) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub(crate) fn edges_from(&self, node: usize) -> &[Edge] {
        &self.edges[node]
    }
}

pub(crate) type BuiltGraph = (Arc<DependencyGraph>, Arc<Vec<ValidationError>>);

/// Last built graph, reused while the registry generation is unchanged.
#[derive(Default)]
pub(crate) struct GraphMemo {
    cached: Mutex<Option<BuiltGraph>>,
}

impl GraphMemo {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, registry: &Registry) -> BuiltGraph {
        let snapshot = registry.snapshot();
        let mut cached = self.cached.lock();
        if let Some((graph, errors)) = cached.as_ref() {
            if graph.generation() == snapshot.generation() {
                return (graph.clone(), errors.clone());
            }
        }
        let (graph, errors) = DependencyGraph::build(&snapshot);
        let built = (Arc::new(graph), Arc::new(errors));
        *cached = Some(built.clone());
        built
    }

    pub(crate) fn clear(&self) {
        *self.cached.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{Dependencies, Factory, ServiceDescriptor};
    use crate::registration::Registry;

    fn registry(specs: &[(&str, &[&str], &[&str])]) -> Registry {
        let registry = Registry::new();
        for (name, required, optional) in specs {
            let mut deps = Dependencies::new();
            for r in *required {
                deps = deps.require(*r);
            }
            for o in *optional {
                deps = deps.optional(*o);
            }
            registry
                .register(ServiceDescriptor::singleton(*name, Factory::instance(())).with_dependencies(deps))
                .unwrap();
        }
        registry
    }

    #[test]
    fn missing_required_dependency_is_reported() {
        let registry = registry(&[("a", &["ghost"], &[])]);
        let (_, errors) = DependencyGraph::build(&registry.snapshot());
        assert_eq!(
            errors,
            vec![ValidationError::MissingRequiredDependency {
                service: Key::named("a"),
                dependency: Key::named("ghost"),
            }]
        );
    }

    #[test]
    fn missing_optional_dependency_is_dropped() {
        let registry = registry(&[("a", &[], &["ghost"])]);
        let (graph, errors) = DependencyGraph::build(&registry.snapshot());
        assert!(errors.is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let registry = registry(&[("a", &[], &[]), ("b", &["a", "a"], &["a"])]);
        let (graph, errors) = DependencyGraph::build(&registry.snapshot());
        assert!(errors.is_empty());
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.required_dependencies_of(&Key::named("b")), vec![&Key::named("a")]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = registry(&[("a", &["a"], &[])]);
        let (_, errors) = DependencyGraph::build(&registry.snapshot());
        assert_eq!(
            errors,
            vec![ValidationError::CircularDependency {
                cycle: vec![Key::named("a"), Key::named("a")],
            }]
        );
    }

    #[test]
    fn cycle_reported_from_repeated_node_only() {
        // root -> x -> y -> z -> x
        let registry = registry(&[
            ("root", &["x"], &[]),
            ("x", &["y"], &[]),
            ("y", &["z"], &[]),
            ("z", &["x"], &[]),
        ]);
        let (_, errors) = DependencyGraph::build(&registry.snapshot());
        let expected: Vec<Key> = ["x", "y", "z", "x"].into_iter().map(Key::named).collect();
        assert_eq!(errors, vec![ValidationError::CircularDependency { cycle: expected }]);
    }

    #[test]
    fn optional_edges_participate_in_cycles() {
        let registry = registry(&[("a", &[], &["b"]), ("b", &["a"], &[])]);
        let (_, errors) = DependencyGraph::build(&registry.snapshot());
        assert!(matches!(errors.as_slice(), [ValidationError::CircularDependency { .. }]));
    }

    #[test]
    fn transitive_dependents_walks_reverse_edges() {
        let registry = registry(&[
            ("a", &[], &[]),
            ("b", &["a"], &[]),
            ("c", &["b"], &[]),
            ("d", &[], &[]),
        ]);
        let (graph, _) = DependencyGraph::build(&registry.snapshot());
        assert_eq!(
            graph.transitive_dependents(&Key::named("a")),
            vec![Key::named("b"), Key::named("c")]
        );
        assert!(graph.transitive_dependents(&Key::named("d")).is_empty());
    }
}
