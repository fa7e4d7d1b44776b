// Copyright 2018 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

// make the entry module public for testing purposes. We use it to construct mock
// graph entries in the engine tests.
pub mod entry;
mod node;

pub use crate::entry::{Entry, Generation};
pub use crate::node::{EntryId, Node, NodeTracer, NodeVisualizer};

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use log::info;
use parking_lot::Mutex;
use petgraph::graph::DiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use petgraph::Direction;

type PGraph<N> = DiGraph<Entry<N>, (), u32>;

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

impl InvalidationResult {
    pub fn total(&self) -> usize {
        self.cleared + self.dirtied
    }
}

///
/// The state of a declared dependency, as observed by its dependent.
///
#[derive(Clone, Debug)]
pub enum DepState<N: Node> {
    Completed(N::State),
    Incomplete,
    Cyclic,
}

type Nodes<N> = HashMap<N, EntryId>;

struct InnerGraph<N: Node> {
    nodes: Nodes<N>,
    pg: PGraph<N>,
}

impl<N: Node> InnerGraph<N> {
    fn entry_id(&self, node: &N) -> Option<&EntryId> {
        self.nodes.get(node)
    }

    fn entry_for_id(&self, id: EntryId) -> &Entry<N> {
        self.pg
            .node_weight(id)
            .unwrap_or_else(|| panic!("Invalid EntryId: {id:?}"))
    }

    fn entry_for_id_mut(&mut self, id: EntryId) -> &mut Entry<N> {
        self.pg
            .node_weight_mut(id)
            .unwrap_or_else(|| panic!("Invalid EntryId: {id:?}"))
    }

    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }

        // New entry.
        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    ///
    /// The dependencies of the given Entry, in the order they were declared.
    ///
    /// NB: petgraph iterates a node's edges most-recently-added first, so this reverses.
    ///
    fn dependencies_of(&self, id: EntryId) -> Vec<EntryId> {
        let mut deps: Vec<_> = self
            .pg
            .edges_directed(id, Direction::Outgoing)
            .map(|e| e.target())
            .collect();
        deps.reverse();
        deps
    }

    fn dependents_of(&self, id: EntryId) -> Vec<EntryId> {
        self.pg
            .edges_directed(id, Direction::Incoming)
            .map(|e| e.source())
            .collect()
    }

    fn is_complete(&self, id: EntryId) -> bool {
        self.entry_for_id(id).is_complete()
    }

    ///
    /// A Node is 'ready' (to have a step attempted) when it is not complete, but all of its
    /// declared dependencies are complete.
    ///
    fn is_ready(&self, id: EntryId) -> bool {
        !self.is_complete(id)
            && self
                .dependencies_of(id)
                .iter()
                .all(|&dep| self.is_complete(dep))
    }

    ///
    /// Detect whether adding an edge from src to dst would create a cycle.
    ///
    fn detect_cycle(&self, src: EntryId, dst: EntryId) -> bool {
        // If dst has no incomplete dependencies (a very common case), don't even allocate the
        // structures to begin the walk.
        if self
            .dependencies_of(dst)
            .iter()
            .all(|&dep| self.is_complete(dep))
        {
            return false;
        }

        // Search for an existing path from dst to src among incomplete entries: completed
        // entries cannot have new dependencies added, so they cannot close a cycle.
        let mut roots = VecDeque::new();
        roots.push_back(dst);
        self.walk(roots, Direction::Outgoing, |&id| self.is_complete(id))
            .any(|id| id == src)
    }

    ///
    /// In the context of the given src Entry, declare the given dst Nodes as its dependencies,
    /// in order. Re-declaration of an existing edge is idempotent; edges that would close a
    /// cycle are recorded as cyclic instead and observed via `dep_states`.
    ///
    /// Returns the EntryIds of declared dependencies that are not yet complete.
    ///
    fn add_dependencies(&mut self, src: EntryId, dsts: Vec<N>) -> Vec<EntryId> {
        assert!(
            !self.is_complete(src),
            "Node {:?} is already completed, and may not have new dependencies added: {:?}",
            self.entry_for_id(src).node(),
            dsts,
        );

        let mut incomplete = Vec::new();
        for dst_node in dsts {
            let dst = self.ensure_entry(dst_node);
            if self.pg.find_edge(src, dst).is_some() {
                // Declared and valid.
            } else if self.entry_for_id(src).cyclic_dependencies().contains(&dst) {
                // Declared but cyclic.
                continue;
            } else if self.detect_cycle(src, dst) {
                // Undeclared but cyclic.
                self.entry_for_id_mut(src).add_cyclic_dependency(dst);
                continue;
            } else {
                // Undeclared and valid.
                self.pg.add_edge(src, dst, ());
            }
            if !self.is_complete(dst) && !incomplete.contains(&dst) {
                incomplete.push(dst);
            }
        }
        incomplete
    }

    ///
    /// The declared dependencies of the given Entry with their current states, in declaration
    /// order, with cyclic declarations appended last.
    ///
    fn dep_states(&self, id: EntryId) -> Vec<(N, DepState<N>)> {
        let mut states: Vec<_> = self
            .dependencies_of(id)
            .into_iter()
            .map(|dep| {
                let entry = self.entry_for_id(dep);
                let state = match entry.state() {
                    Some(s) => DepState::Completed(s.clone()),
                    None => DepState::Incomplete,
                };
                (entry.node().clone(), state)
            })
            .collect();
        for &dep in self.entry_for_id(id).cyclic_dependencies() {
            states.push((self.entry_for_id(dep).node().clone(), DepState::Cyclic));
        }
        states
    }

    ///
    /// Begins a Walk from the given roots.
    ///
    /// The Walk will iterate over all nodes that descend from the roots in the direction of
    /// traversal but won't necessarily be in topological order.
    ///
    fn walk<F: Fn(&EntryId) -> bool>(
        &self,
        roots: VecDeque<EntryId>,
        direction: Direction,
        stop_walking_predicate: F,
    ) -> Walk<'_, N, F> {
        Walk {
            graph: self,
            direction,
            deque: roots,
            walked: self.pg.visit_map(),
            stop_walking_predicate,
        }
    }

    ///
    /// Clears the values of all "invalidation root" Nodes and dirties their transitive
    /// dependents.
    ///
    /// An "invalidation root" is a Node in the graph which can be invalidated for a reason
    /// other than having had its dependencies changed.
    ///
    fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &mut self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        // Collect all entries that will be cleared.
        let root_ids: HashSet<EntryId> = self
            .nodes
            .iter()
            .filter_map(|(node, &entry_id)| if predicate(node) { Some(entry_id) } else { None })
            .collect();

        // And their transitive dependents, which will be dirtied.
        let transitive_ids: Vec<EntryId> = self
            .walk(root_ids.iter().cloned().collect(), Direction::Incoming, |_| {
                false
            })
            .filter(|id| !root_ids.contains(id))
            .collect();

        let invalidation_result = InvalidationResult {
            cleared: root_ids.len(),
            dirtied: transitive_ids.len(),
        };

        // If there were no roots, then nothing will be invalidated. Return early to avoid
        // scanning all edges in `retain_edges`.
        if root_ids.is_empty() {
            return invalidation_result;
        }

        // Both cleared and dirtied entries lose their cached state and their outbound edges:
        // re-evaluation re-declares the dependencies it still needs.
        let mut all_ids = root_ids;
        for id in &transitive_ids {
            if log_dirtied {
                info!("Dirtying {}", self.entry_for_id(*id).node().format());
            }
            all_ids.insert(*id);
        }
        for &id in &all_ids {
            self.entry_for_id_mut(id).clear();
        }
        self.pg.retain_edges(|pg, edge| {
            if let Some((src, _)) = pg.edge_endpoints(edge) {
                !all_ids.contains(&src)
            } else {
                true
            }
        });

        invalidation_result
    }

    fn visualize<V: NodeVisualizer<N>>(
        &self,
        mut visualizer: V,
        roots: &[N],
        path: &Path,
    ) -> io::Result<()> {
        let file = File::create(path)?;
        let mut f = BufWriter::new(file);

        f.write_all(b"digraph plans {\n")?;
        f.write_fmt(format_args!(
            "  node[colorscheme={}];\n",
            visualizer.color_scheme()
        ))?;
        f.write_all(b"  concentrate=true;\n")?;
        f.write_all(b"  rankdir=LR;\n")?;

        let root_ids: VecDeque<EntryId> = roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .cloned()
            .collect();

        let included: Vec<EntryId> = self
            .walk(root_ids, Direction::Outgoing, |_| false)
            .collect();
        for id in included {
            let entry = self.entry_for_id(id);
            let node_str = entry.format();

            // Write the node header.
            f.write_fmt(format_args!(
                "  \"{}\" [style=filled, fillcolor={}];\n",
                node_str,
                visualizer.color(entry.node(), entry.state())
            ))?;

            // Write an entry per edge.
            for dep_id in self.dependencies_of(id) {
                let dep_str = self.entry_for_id(dep_id).format();
                f.write_fmt(format_args!("    \"{node_str}\" -> \"{dep_str}\"\n"))?;
            }
            for &dep_id in entry.cyclic_dependencies() {
                let dep_str = self.entry_for_id(dep_id).format();
                f.write_fmt(format_args!(
                    "    \"{node_str}\" -> \"{dep_str}\" [style=dashed]\n"
                ))?;
            }
        }

        f.write_all(b"}\n")?;
        Ok(())
    }

    fn trace<T: NodeTracer<N>>(&self, roots: &[N], path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        let mut f = BufWriter::new(file);

        let is_bottom = |id: EntryId| -> bool { T::is_bottom(self.entry_for_id(id).state()) };

        let is_one_level_above_bottom =
            |id: EntryId| -> bool { self.dependencies_of(id).into_iter().all(is_bottom) };

        let mut deque: VecDeque<(EntryId, usize)> = roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .map(|&id| (id, 0))
            .collect();
        let mut walked = self.pg.visit_map();
        while let Some((id, level)) = deque.pop_front() {
            if !walked.visit(id) || is_bottom(id) {
                continue;
            }

            let entry = self.entry_for_id(id);
            let indent = "  ".repeat(level);
            let output = format!("{}Computing {}", indent, entry.node().format());
            if is_one_level_above_bottom(id) {
                writeln!(
                    &mut f,
                    "{}\n{}  {}",
                    output,
                    indent,
                    T::state_str(&indent, entry.state())
                )?;
            } else {
                writeln!(&mut f, "{output}")?;
            }

            for dep_id in self.dependencies_of(id) {
                deque.push_back((dep_id, level + 1));
            }
            for &dep_id in entry.cyclic_dependencies() {
                writeln!(
                    &mut f,
                    "{}cycle for {:?}",
                    "  ".repeat(level + 1),
                    self.entry_for_id(dep_id).node()
                )?;
            }
        }

        f.write_all(b"\n")?;
        Ok(())
    }
}

///
/// A DAG (enforced on mutation) of Entries.
///
/// Entries are inserted lazily at first request, and are never removed: invalidation demotes
/// an Entry to dirty (clearing its state, bumping its Generation) while preserving its identity.
///
pub struct Graph<N: Node> {
    inner: Mutex<InnerGraph<N>>,
}

impl<N: Node> Graph<N> {
    pub fn new() -> Graph<N> {
        Graph {
            inner: Mutex::new(InnerGraph {
                nodes: HashMap::default(),
                pg: DiGraph::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len()
    }

    ///
    /// Idempotently creates an Entry for the given Node.
    ///
    pub fn ensure_entry(&self, node: N) -> EntryId {
        let mut inner = self.inner.lock();
        inner.ensure_entry(node)
    }

    pub fn node(&self, id: EntryId) -> N {
        let inner = self.inner.lock();
        inner.entry_for_id(id).node().clone()
    }

    pub fn generation(&self, id: EntryId) -> Generation {
        let inner = self.inner.lock();
        inner.entry_for_id(id).generation()
    }

    pub fn is_complete(&self, id: EntryId) -> bool {
        let inner = self.inner.lock();
        inner.is_complete(id)
    }

    ///
    /// Returns the memoized state of the given Node, if it is terminal.
    ///
    pub fn peek(&self, node: &N) -> Option<N::State> {
        let inner = self.inner.lock();
        inner
            .entry_id(node)
            .and_then(|&id| inner.entry_for_id(id).state().cloned())
    }

    ///
    /// If the given Entry is incomplete but all of its declared dependencies are terminal,
    /// returns everything needed to attempt a step for it: its Node, its current Generation,
    /// and the states of its dependencies in declaration order.
    ///
    pub fn step_data(&self, id: EntryId) -> Option<(N, Generation, Vec<(N, DepState<N>)>)> {
        let inner = self.inner.lock();
        if !inner.is_ready(id) {
            return None;
        }
        let entry = inner.entry_for_id(id);
        Some((
            entry.node().clone(),
            entry.generation(),
            inner.dep_states(id),
        ))
    }

    pub fn add_dependencies(&self, src: EntryId, dsts: Vec<N>) -> Vec<EntryId> {
        let mut inner = self.inner.lock();
        inner.add_dependencies(src, dsts)
    }

    pub fn dependents_of(&self, id: EntryId) -> Vec<EntryId> {
        let inner = self.inner.lock();
        inner.dependents_of(id)
    }

    ///
    /// Transitions the given Entry to the given terminal state.
    ///
    /// If the Entry's Generation has moved since `generation` was observed, the state is the
    /// result of an evaluation that raced an invalidation: it is discarded, and false is
    /// returned. Completing an Entry that is already terminal is an invariant violation.
    ///
    pub fn complete(&self, id: EntryId, generation: Generation, state: N::State) -> bool {
        let mut inner = self.inner.lock();
        if inner.entry_for_id(id).generation() != generation {
            return false;
        }
        inner.entry_for_id_mut(id).complete(state);
        true
    }

    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let mut inner = self.inner.lock();
        inner.invalidate_from_roots(log_dirtied, predicate)
    }

    pub fn visualize<V: NodeVisualizer<N>>(
        &self,
        visualizer: V,
        roots: &[N],
        path: &Path,
    ) -> io::Result<()> {
        let inner = self.inner.lock();
        inner.visualize(visualizer, roots, path)
    }

    pub fn trace<T: NodeTracer<N>>(&self, roots: &[N], path: &Path) -> io::Result<()> {
        let inner = self.inner.lock();
        inner.trace::<T>(roots, path)
    }
}

///
/// Represents the state of a particular walk through a Graph. Implements Iterator and has the
/// same lifetime as the Graph itself.
///
struct Walk<'a, N: Node, F>
where
    F: Fn(&EntryId) -> bool,
{
    graph: &'a InnerGraph<N>,
    direction: Direction,
    deque: VecDeque<EntryId>,
    walked: FixedBitSet,
    stop_walking_predicate: F,
}

impl<'a, N: Node + 'a, F: Fn(&EntryId) -> bool> Iterator for Walk<'a, N, F> {
    type Item = EntryId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.deque.pop_front() {
            // Visit this node and its neighbors if it has not yet been visited and the walk
            // is not stopping at it (which dirties selectively, respecting node boundaries).
            if !self.walked.visit(id) || (self.stop_walking_predicate)(&id) {
                continue;
            }

            self.deque
                .extend(self.graph.pg.neighbors_directed(id, self.direction));
            return Some(id);
        }

        None
    }
}

#[cfg(test)]
mod tests;
