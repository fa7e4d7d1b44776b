// Copyright 2018 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::node::{EntryId, Node};

///
/// A token associated with a Node that is incremented whenever its output value has (or might
/// have) changed. An evaluation that was started at one Generation must discard its result if the
/// Entry's Generation has moved by the time the result is delivered: the Node was dirtied while
/// the work was in flight.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(u32);

impl Generation {
    pub fn initial() -> Generation {
        Generation(0)
    }

    pub(crate) fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

///
/// An Entry in the Graph: a Node plus its memoized terminal state and invalidation bookkeeping.
///
/// Dependency edges live in the Graph's petgraph storage; cyclic dependency declarations are
/// recorded here per Entry, because they are deliberately _not_ added as edges (the Graph is a
/// DAG, enforced on mutation).
///
#[derive(Debug)]
pub struct Entry<N: Node> {
    node: N,
    generation: Generation,
    state: Option<N::State>,
    // Deps that would be illegal to actually provide, since they would be cyclic.
    cyclic_dependencies: Vec<EntryId>,
}

impl<N: Node> Entry<N> {
    pub(crate) fn new(node: N) -> Entry<N> {
        Entry {
            node,
            generation: Generation::initial(),
            state: None,
            cyclic_dependencies: Vec::new(),
        }
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> Option<&N::State> {
        self.state.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_some()
    }

    pub(crate) fn complete(&mut self, state: N::State) {
        assert!(
            self.state.is_none(),
            "Node {:?} is already completed, and may not complete again.",
            self.node,
        );
        self.state = Some(state);
    }

    ///
    /// Drops the Entry's memoized state and bumps its Generation, preserving its identity. Any
    /// in-flight evaluation started under the previous Generation will be discarded on delivery.
    ///
    pub(crate) fn clear(&mut self) {
        self.state = None;
        self.generation = self.generation.next();
        self.cyclic_dependencies.clear();
    }

    pub(crate) fn cyclic_dependencies(&self) -> &[EntryId] {
        &self.cyclic_dependencies
    }

    pub(crate) fn add_cyclic_dependency(&mut self, dep: EntryId) {
        if !self.cyclic_dependencies.contains(&dep) {
            self.cyclic_dependencies.push(dep);
        }
    }

    pub(crate) fn format(&self) -> String {
        let state = match self.state {
            Some(ref s) => format!("{s:?}"),
            None => "<not yet run>".to_string(),
        };
        format!("{} == {}", self.node.format(), state).replace('\"', "\\\"")
    }
}
