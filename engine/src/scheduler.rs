// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use graph::{DepState, EntryId, Generation, NodeTracer, NodeVisualizer};

use crate::context::{Context, Core};
use crate::core::{Key, Noop, TypeConstraint, Value, Variants, FNV};
use crate::fs::glob_to_regex;
use crate::nodes::{Complete, NodeKey, State, StepContext};
use crate::selectors::Selector;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutionStat {
    pub runnable_count: u64,
    pub scheduling_iterations: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionError {
    ///
    /// A second run was attempted on a scheduler whose previous run had not completed.
    ///
    ConcurrentRun,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::ConcurrentRun => {
                write!(f, "Multiple concurrent executions are not supported.")
            }
        }
    }
}

///
/// The result for one root of an execution: `state` is None if the run has not (yet) produced
/// a terminal state for it.
///
#[derive(Clone, Debug)]
pub struct RootResult {
    pub subject: Key,
    pub product: TypeConstraint,
    pub state: Option<Complete>,
}

impl RootResult {
    ///
    /// 0 = not-yet-run, 1 = Return, 2 = Throw, 3 = Noop.
    ///
    pub fn state_tag(&self) -> u8 {
        match self.state {
            None => 0,
            Some(Complete::Return(_)) => 1,
            Some(Complete::Throw(..)) => 2,
            Some(Complete::Noop(_)) => 3,
        }
    }

    pub fn state_value(&self) -> Option<&Value> {
        match self.state {
            Some(Complete::Return(ref v)) => Some(v),
            Some(Complete::Throw(ref v, _)) => Some(v),
            _ => None,
        }
    }
}

///
/// The single-writer evaluator: advances the product graph from a set of root Nodes until
/// every root is terminal.
///
/// One invocation of `execute` is one "run", and a run is the unit of atomicity: there is no
/// cancellation primitive. Task execution is parallel (intrinsics on the internal worker pool,
/// host rule functions through the host boundary), reconciled through a single-consumer
/// completion channel.
///
pub struct Scheduler {
    core: Arc<Core>,
    // Initial set of roots for the execution, in the order they were declared.
    roots: Vec<NodeKey>,
    running: AtomicBool,
}

impl Scheduler {
    ///
    /// Creates a Scheduler with an initially empty set of roots.
    ///
    pub fn new(core: Core) -> Scheduler {
        Scheduler {
            core: Arc::new(core),
            roots: Vec::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn reset(&mut self) {
        self.roots.clear();
    }

    pub fn add_root_select(
        &mut self,
        subject: Key,
        product: TypeConstraint,
    ) -> Result<(), String> {
        if !self.core.root_subject_types.contains(subject.type_id()) {
            return Err(format!(
                "{:?} is not a registered root subject type.",
                subject.type_id()
            ));
        }
        self.add_root(NodeKey::create(
            Selector::select(product),
            subject,
            Variants::default(),
        ));
        Ok(())
    }

    pub(crate) fn add_root(&mut self, node: NodeKey) {
        self.roots.push(node);
    }

    pub fn root_states(&self) -> Vec<RootResult> {
        self.roots
            .iter()
            .map(|root| RootResult {
                subject: *root.subject(),
                product: *root.product(),
                state: self.core.graph.peek(root),
            })
            .collect()
    }

    pub fn graph_len(&self) -> usize {
        self.core.graph.len()
    }

    pub fn visualize(&self, path: &Path) -> io::Result<()> {
        self.core
            .graph
            .visualize(GraphVisualizer::new(), &self.roots, path)
    }

    pub fn trace(&self, path: &Path) -> io::Result<()> {
        self.core.graph.trace::<GraphTracer>(&self.roots, path)
    }

    pub fn visualize_rule_graph(&self, path: &Path) -> io::Result<()> {
        self.core.rule_graph.visualize(path)
    }

    pub fn pre_fork(&self) {
        self.core.pre_fork();
    }

    ///
    /// Invalidates every Node whose subject covers one of the given changed paths, along with
    /// all transitive dependents, and returns the number of Nodes touched.
    ///
    /// Invalidation never fails: an unmatchable entry simply invalidates nothing.
    ///
    pub fn invalidate(&self, paths: &[PathBuf]) -> usize {
        // The watcher does not deliver directory change events, so a changed path must also
        // invalidate its parent directory's listing.
        let mut changed: HashSet<PathBuf> = paths.iter().cloned().collect();
        changed.extend(
            paths
                .iter()
                .filter_map(|p| p.parent().map(Path::to_path_buf)),
        );

        let context = Context::new(self.core.clone());
        let types = &self.core.types;
        let tasks = &self.core.tasks;
        let result = self.core.graph.invalidate_from_roots(true, |node| {
            let subject = node.subject();
            let type_id = subject.type_id();
            let path_like = [&types.path, &types.dir, &types.file, &types.link]
                .iter()
                .any(|constraint| context.satisfied_by(constraint, type_id));
            if path_like {
                // A path subject is invalidated when it is equal to, or a parent of, a
                // changed path.
                let subject_path = context.lift_path(&context.val_for(subject));
                changed
                    .iter()
                    .any(|p| p == &subject_path || p.starts_with(&subject_path))
            } else if context.satisfied_by(&types.path_globs, type_id) {
                // A glob subject is invalidated when any changed path could match one of its
                // includes.
                let includes = context
                    .core
                    .externs
                    .project_multi_strs(&context.val_for(subject), &tasks.field_include);
                includes.iter().any(|glob| match glob_to_regex(glob) {
                    Ok(regex) => changed.iter().any(|p| regex.is_match(&p.to_string_lossy())),
                    // An unparseable glob invalidates conservatively.
                    Err(_) => true,
                })
            } else {
                false
            }
        });

        debug!("invalidated {} nodes for: {:?}", result.total(), changed);
        result.total()
    }

    ///
    /// Starting from the existing roots, executes the graph to completion.
    ///
    pub fn execute(&self) -> Result<ExecutionStat, ExecutionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::ConcurrentRun);
        }
        let stat = self.execute_inner();
        self.running.store(false, Ordering::SeqCst);
        Ok(stat)
    }

    fn execute_inner(&self) -> ExecutionStat {
        let context = Context::new(self.core.clone());

        // Results of non-cacheable runnables do not survive into a new run.
        self.core
            .graph
            .invalidate_from_roots(false, |node| !node.cacheable());

        let (sender, receiver) = crossbeam_channel::unbounded();

        // Seed the ready queue with the roots.
        let mut candidates: VecDeque<EntryId> = self
            .roots
            .iter()
            .map(|root| self.core.graph.ensure_entry(root.clone()))
            .collect();
        let mut outstanding: HashSet<EntryId, FNV> = HashSet::default();
        let mut runnable_count = 0;
        let mut scheduling_iterations = 0;

        loop {
            scheduling_iterations += 1;

            // Advance every candidate that is ready for a step.
            while let Some(id) = candidates.pop_front() {
                if outstanding.contains(&id) {
                    // Already running.
                    continue;
                }
                match self.attempt_step(&context, id) {
                    None => continue,
                    Some((generation, State::Complete(state))) => {
                        if self.core.graph.complete(id, generation, state) {
                            candidates.extend(self.core.graph.dependents_of(id));
                        } else {
                            // Dirtied while stepping: reattempt.
                            candidates.push_back(id);
                        }
                    }
                    Some((generation, State::Runnable(runnable))) => {
                        outstanding.insert(id);
                        let context = context.clone();
                        let sender = sender.clone();
                        self.core.pool().spawn(move || {
                            let state = runnable.run(&context);
                            let _ = sender.send((id, generation, state));
                        });
                    }
                    Some((_, State::Waiting(deps))) => {
                        let incomplete = self.core.graph.add_dependencies(id, deps);
                        if incomplete.is_empty() {
                            // All newly declared deps are already completed: still a candidate.
                            candidates.push_back(id);
                        } else {
                            // Mark incomplete deps as candidates for steps.
                            candidates.extend(incomplete);
                        }
                    }
                }
            }

            if outstanding.is_empty() {
                break;
            }

            // Block for at least one completion, then drain whatever else has arrived.
            let first = receiver
                .recv()
                .expect("The worker pool disconnected mid-run.");
            let mut completions = vec![first];
            completions.extend(receiver.try_iter());
            for (id, generation, state) in completions {
                runnable_count += 1;
                outstanding.remove(&id);
                if self.core.graph.complete(id, generation, state) {
                    candidates.extend(self.core.graph.dependents_of(id));
                } else {
                    // The Node was dirtied while its work was in flight: reattempt.
                    candidates.push_back(id);
                }
            }
        }

        let stat = ExecutionStat {
            runnable_count,
            scheduling_iterations,
        };
        debug!(
            "ran {} scheduling iterations and {} runnables. there are {} total nodes.",
            stat.scheduling_iterations,
            stat.runnable_count,
            self.core.graph.len(),
        );
        stat
    }

    ///
    /// Attempt to run a step with the currently available dependencies of the given Node.
    ///
    /// If the Node is already complete, or its currently declared dependencies are not yet
    /// available, returns None. Otherwise runs a step and returns the resulting State along
    /// with the Generation the step observed.
    ///
    fn attempt_step(&self, context: &Context, id: EntryId) -> Option<(Generation, State)> {
        let (node, generation, dep_states) = self.core.graph.step_data(id)?;

        let mut deps: HashMap<NodeKey, Complete, FNV> = HashMap::default();
        for (dep_node, dep_state) in dep_states {
            let complete = match dep_state {
                DepState::Completed(state) => state,
                DepState::Cyclic => Complete::Noop(Noop::Cycle),
                // Unreachable when the Node is ready, but harmless.
                DepState::Incomplete => continue,
            };
            deps.insert(dep_node, complete);
        }

        let step_context = StepContext::new(context, &deps);
        Some((generation, node.step(&step_context)))
    }
}

///
/// Renders Nodes for the product graph's dot output, colored by product for Return states.
///
struct GraphVisualizer {
    viz_colors: HashMap<TypeConstraint, String>,
}

impl GraphVisualizer {
    fn new() -> GraphVisualizer {
        GraphVisualizer {
            viz_colors: HashMap::new(),
        }
    }
}

impl NodeVisualizer<NodeKey> for GraphVisualizer {
    fn color_scheme(&self) -> &str {
        "set312"
    }

    fn color(&mut self, node: &NodeKey, state: Option<&Complete>) -> String {
        match state {
            None | Some(&Complete::Noop(_)) => "white".to_string(),
            Some(&Complete::Throw(..)) => "tomato".to_string(),
            Some(&Complete::Return(_)) => {
                let viz_colors_len = self.viz_colors.len();
                self.viz_colors
                    .entry(*node.product())
                    .or_insert_with(|| format!("{}", viz_colors_len % 12 + 1))
                    .clone()
            }
        }
    }
}

///
/// Renders Node states for traces walked from a Throw back to a root.
///
struct GraphTracer;

impl NodeTracer<NodeKey> for GraphTracer {
    fn is_bottom(state: Option<&Complete>) -> bool {
        match state {
            Some(&Complete::Noop(_)) | Some(&Complete::Return(_)) => true,
            Some(&Complete::Throw(..)) | None => false,
        }
    }

    fn state_str(indent: &str, state: Option<&Complete>) -> String {
        match state {
            None => String::new(),
            Some(Complete::Return(v)) => format!("Return({v:?})"),
            Some(Complete::Throw(_, traceback)) => format!(
                "Throw({})",
                traceback.replace('\n', &format!("\n{indent}  "))
            ),
            Some(Complete::Noop(noop)) => format!("Noop({noop:?})"),
        }
    }
}
