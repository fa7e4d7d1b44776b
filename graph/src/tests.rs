// Copyright 2018 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{DepState, Graph, InvalidationResult, Node};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct TNode(usize);

impl Node for TNode {
    type State = String;

    fn format(&self) -> String {
        format!("TNode({})", self.0)
    }
}

fn empty_graph() -> Graph<TNode> {
    let _ = env_logger::try_init();
    Graph::new()
}

fn complete(graph: &Graph<TNode>, id: crate::EntryId, state: &str) -> bool {
    let generation = graph.generation(id);
    graph.complete(id, generation, state.to_string())
}

#[test]
fn creation_is_idempotent() {
    let graph = empty_graph();
    let id0 = graph.ensure_entry(TNode(0));
    let id1 = graph.ensure_entry(TNode(0));
    assert_eq!(id0, id1);
    assert_eq!(graph.len(), 1);

    let id2 = graph.ensure_entry(TNode(1));
    assert_ne!(id0, id2);
    assert_eq!(graph.len(), 2);
}

#[test]
fn complete_then_peek() {
    let graph = empty_graph();
    let id = graph.ensure_entry(TNode(0));
    assert_eq!(graph.peek(&TNode(0)), None);

    assert!(complete(&graph, id, "zero"));
    assert_eq!(graph.peek(&TNode(0)), Some("zero".to_string()));
    assert!(graph.is_complete(id));
}

#[test]
#[should_panic(expected = "already completed")]
fn complete_twice_panics() {
    let graph = empty_graph();
    let id = graph.ensure_entry(TNode(0));
    assert!(complete(&graph, id, "zero"));
    complete(&graph, id, "zero again");
}

#[test]
fn stale_generation_is_discarded() {
    let graph = empty_graph();
    let id = graph.ensure_entry(TNode(0));
    let generation = graph.generation(id);

    // An invalidation bumps the generation before the (simulated) in-flight work lands.
    graph.invalidate_from_roots(false, |n| n == &TNode(0));

    assert!(!graph.complete(id, generation, "stale".to_string()));
    assert_eq!(graph.peek(&TNode(0)), None);
}

#[test]
fn dependencies_preserve_declaration_order() {
    let graph = empty_graph();
    let id = graph.ensure_entry(TNode(0));
    graph.add_dependencies(id, vec![TNode(1), TNode(2), TNode(3)]);
    // Re-declaration is idempotent.
    graph.add_dependencies(id, vec![TNode(2), TNode(1)]);

    for n in 1..4 {
        let dep_id = graph.ensure_entry(TNode(n));
        assert!(complete(&graph, dep_id, &format!("{n}")));
    }

    let (_, _, deps) = graph.step_data(id).expect("Node should have been ready.");
    let nodes: Vec<TNode> = deps.into_iter().map(|(n, _)| n).collect();
    assert_eq!(nodes, vec![TNode(1), TNode(2), TNode(3)]);
}

#[test]
fn not_ready_until_dependencies_complete() {
    let graph = empty_graph();
    let id = graph.ensure_entry(TNode(0));
    let incomplete = graph.add_dependencies(id, vec![TNode(1)]);
    assert_eq!(incomplete.len(), 1);
    assert!(graph.step_data(id).is_none());

    assert!(complete(&graph, incomplete[0], "one"));
    assert!(graph.step_data(id).is_some());
}

#[test]
fn cyclic_dependencies_are_detected() {
    let graph = empty_graph();
    let id0 = graph.ensure_entry(TNode(0));
    let id1 = graph.ensure_entry(TNode(1));

    let incomplete = graph.add_dependencies(id0, vec![TNode(1)]);
    assert_eq!(incomplete, vec![id1]);

    // The reverse edge would close a cycle: it is not added, and observed as Cyclic.
    let incomplete = graph.add_dependencies(id1, vec![TNode(0)]);
    assert!(incomplete.is_empty());

    let (_, _, deps) = graph.step_data(id1).expect("No (real) deps: ready.");
    assert_eq!(deps.len(), 1);
    assert!(matches!(deps[0], (TNode(0), DepState::Cyclic)));
}

#[test]
fn invalidation_dirties_transitive_dependents() {
    let graph = empty_graph();
    // A chain 0 -> 1 -> 2, completed bottom-up.
    let id0 = graph.ensure_entry(TNode(0));
    graph.add_dependencies(id0, vec![TNode(1)]);
    let id1 = graph.ensure_entry(TNode(1));
    graph.add_dependencies(id1, vec![TNode(2)]);
    let id2 = graph.ensure_entry(TNode(2));
    for (id, state) in [(id2, "two"), (id1, "one"), (id0, "zero")] {
        assert!(complete(&graph, id, state));
    }

    assert_eq!(
        graph.invalidate_from_roots(false, |n| n == &TNode(2)),
        InvalidationResult {
            cleared: 1,
            dirtied: 2
        }
    );

    // Identity is preserved, but all three states are gone.
    assert_eq!(graph.len(), 3);
    for n in 0..3 {
        assert_eq!(graph.peek(&TNode(n)), None);
    }
}

#[test]
fn invalidation_removes_outbound_edges() {
    let graph = empty_graph();
    let id0 = graph.ensure_entry(TNode(0));
    graph.add_dependencies(id0, vec![TNode(1)]);
    let id1 = graph.ensure_entry(TNode(1));
    assert!(complete(&graph, id1, "one"));

    graph.invalidate_from_roots(false, |n| n == &TNode(1));

    // The dependent was dirtied and its edges dropped: it will re-declare what it needs.
    let (_, _, deps) = graph.step_data(id0).expect("Dirtied node should be ready.");
    assert!(deps.is_empty());
}

#[test]
fn invalidation_of_missing_subject_is_a_noop() {
    let graph = empty_graph();
    graph.ensure_entry(TNode(0));
    assert_eq!(
        graph.invalidate_from_roots(false, |n| n == &TNode(42)),
        InvalidationResult {
            cleared: 0,
            dirtied: 0
        }
    );
}

#[test]
fn dependents_are_walkable() {
    let graph = empty_graph();
    let id0 = graph.ensure_entry(TNode(0));
    graph.add_dependencies(id0, vec![TNode(1)]);
    let id1 = graph.ensure_entry(TNode(1));
    assert_eq!(graph.dependents_of(id1), vec![id0]);
}
