// Copyright 2018 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Debug;
use std::hash::Hash;

use petgraph::graph;

// 2^32 Nodes ought to be more than enough for anyone!
pub type EntryId = graph::NodeIndex<u32>;

///
/// Defines a memoizable unit of work within a Graph.
///
/// A Node is identified by its value: two requests for equal Nodes resolve to the same Entry.
/// The State associated type is the terminal result of evaluating the Node; non-terminal
/// bookkeeping (readiness, in-flight work) lives with the evaluator, not the Graph.
///
pub trait Node: Clone + Debug + Eq + Hash + Send + 'static {
    type State: Clone + Debug + Send + 'static;

    // TODO: Use a `Display` bound instead.
    fn format(&self) -> String;
}

///
/// A trait used to visualize Nodes in DOT/GraphViz format.
///
pub trait NodeVisualizer<N: Node> {
    ///
    /// Returns a GraphViz color scheme name for this visualizer.
    ///
    fn color_scheme(&self) -> &str;

    ///
    /// Returns a GraphViz color name/id within Self::color_scheme for the given Node/state.
    ///
    fn color(&mut self, node: &N, state: Option<&N::State>) -> String;
}

///
/// A trait used to visualize Nodes for the purposes of CLI-output tracing.
///
pub trait NodeTracer<N: Node> {
    ///
    /// Returns true if the given Node state represents the "bottom" of a trace.
    ///
    fn is_bottom(state: Option<&N::State>) -> bool;

    ///
    /// Renders the given state for a trace. The trace will already be indented by `indent`, but
    /// an implementer creating a multi-line output would need to indent them as well.
    ///
    fn state_str(indent: &str, state: Option<&N::State>) -> String;
}
