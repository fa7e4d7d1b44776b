// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::ops::Deref;

use hashing::Fingerprint;

use crate::context::Context;
use crate::core::{Function, Key, Noop, TypeConstraint, Value, Variants, FNV};
use crate::fs::{Dir, Link, PathGlobs};
use crate::selectors::{self, Selector};
use crate::tasks::{self, IntrinsicKind};

///
/// The terminal state of a Node.
///
#[derive(Clone, Debug)]
pub enum Complete {
    Return(Value),
    Throw(Value, String),
    Noop(Noop),
}

///
/// The result of running one step for a Node: either new dependencies to request, a task to
/// dispatch to a runner, or a terminal state.
///
#[derive(Debug)]
pub enum State {
    Waiting(Vec<NodeKey>),
    Runnable(Runnable),
    Complete(Complete),
}

///
/// A unit of work ready to execute on the worker pool: either a host rule function dispatched
/// across the host boundary, or an intrinsic implemented against the filesystem.
///
#[derive(Clone, Debug)]
pub enum Runnable {
    Extern {
        func: Function,
        args: Vec<Value>,
        cacheable: bool,
    },
    Snapshot {
        path_globs: PathGlobs,
    },
    DirectoryListing {
        dir: Dir,
    },
    ReadLink {
        link: Link,
    },
    FileContents {
        fingerprint: Fingerprint,
    },
}

impl Runnable {
    pub fn run(self, context: &Context) -> Complete {
        match self {
            Runnable::Extern {
                func,
                args,
                cacheable,
            } => match context.invoke_runnable(&func, &args, cacheable) {
                Ok(value) => Complete::Return(value),
                Err(failure) => failure,
            },
            Runnable::Snapshot { path_globs } => {
                let res = context
                    .core
                    .vfs
                    .expand(&path_globs)
                    .and_then(|path_stats| {
                        context.core.snapshots.create(&context.core.vfs, path_stats)
                    });
                match res {
                    Ok(snapshot) => Complete::Return(context.store_snapshot(&snapshot)),
                    Err(e) => context.throw(&format!("Snapshot failed: {e}")),
                }
            }
            Runnable::DirectoryListing { dir } => match context.core.vfs.scandir(&dir) {
                Ok(stats) => Complete::Return(context.store_directory_listing(&stats)),
                Err(e) => context.throw(&format!("Failed to scan {dir:?}: {e}")),
            },
            Runnable::ReadLink { link } => match context.core.vfs.read_link(&link) {
                Ok(path) => Complete::Return(context.store_read_link(&path)),
                Err(e) => context.throw(&format!("Failed to read link {link:?}: {e}")),
            },
            Runnable::FileContents { fingerprint } => {
                match context.core.snapshots.contents_for(fingerprint) {
                    Ok(contents) => Complete::Return(context.store_files_content(&contents)),
                    Err(e) => context.throw(&e),
                }
            }
        }
    }
}

///
/// The portion of the graph visible to a Node while it runs a step: the states of the
/// dependencies it has declared so far (cyclic declarations appear as `Noop(Cycle)`), plus the
/// shared Context.
///
/// Steps are pure with respect to the graph: a step declares the dependencies it wants by
/// returning `Waiting`, and the scheduler applies them.
///
pub struct StepContext<'a> {
    context: &'a Context,
    deps: &'a HashMap<NodeKey, Complete, FNV>,
}

impl<'a> StepContext<'a> {
    pub fn new(context: &'a Context, deps: &'a HashMap<NodeKey, Complete, FNV>) -> StepContext<'a> {
        StepContext { context, deps }
    }

    fn get(&self, node: &NodeKey) -> Option<&Complete> {
        self.deps.get(node)
    }
}

impl Deref for StepContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.context
    }
}

///
/// A Node that selects a product for a subject.
///
/// A Select can be satisfied by multiple sources, but fails if multiple sources produce a
/// value. The 'variants' field represents variant configuration that is propagated to
/// dependencies. When a task needs to consume a product as configured by the variants map, it
/// can pass variant_key, which matches a 'variant' value to restrict the names of values
/// selected by a SelectNode.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Select {
    pub subject: Key,
    pub variants: Variants,
    pub selector: selectors::Select,
}

impl Select {
    fn product(&self) -> &TypeConstraint {
        &self.selector.product
    }

    fn select_literal_single(
        &self,
        context: &StepContext,
        candidate: &Value,
        variant_value: &Option<String>,
    ) -> bool {
        if !context.satisfied_by(&self.selector.product, candidate.type_id()) {
            return false;
        }
        match variant_value {
            Some(vv) if context.field_name(candidate) != *vv =>
            // There is a variant value, and it doesn't match.
            {
                false
            }
            _ => true,
        }
    }

    ///
    /// Looks for has-a or is-a relationships between the given value and the requested product.
    ///
    /// Returns the resulting product value, or None if no match was made.
    ///
    fn select_literal(
        &self,
        context: &StepContext,
        candidate: Value,
        variant_value: &Option<String>,
    ) -> Option<Value> {
        // Check whether the subject is-a instance of the product.
        if self.select_literal_single(context, &candidate, variant_value) {
            return Some(candidate);
        }

        // Else, check whether it has-a instance of the product.
        if context.has_products(&candidate) {
            for child in context.field_products(&candidate) {
                if self.select_literal_single(context, &child, variant_value) {
                    return Some(child);
                }
            }
        }
        None
    }

    fn step(&self, context: &StepContext) -> State {
        // If there is a variant_key, see whether it has been configured; if not, no match.
        let variant_value: Option<String> = match self.selector.variant_key {
            Some(ref variant_key) => match self.variants.find(variant_key) {
                Some(v) => Some(v.to_string()),
                None => return State::Complete(Complete::Noop(Noop::NoVariant)),
            },
            None => None,
        };

        // If the Subject "is a" or "has a" Product, then we're done.
        if let Some(literal_value) =
            self.select_literal(context, context.val_for(&self.subject), &variant_value)
        {
            return State::Complete(Complete::Return(literal_value));
        }

        // A singleton is the only provider for its product type.
        if let Some(value) = context.gen_singleton(self.product()) {
            return State::Complete(Complete::Return(value));
        }

        // Else, attempt to use the configured tasks to compute the value.
        let candidates = context.gen_nodes(&self.subject, self.product(), &self.variants);
        if candidates.is_empty() {
            return State::Complete(Complete::Noop(Noop::NoTask));
        }

        let mut matches = Vec::new();
        let mut waiting = false;
        for candidate in &candidates {
            match context.get(candidate) {
                None => waiting = true,
                Some(Complete::Return(value)) => {
                    if let Some(v) = self.select_literal(context, value.clone(), &variant_value) {
                        matches.push(v);
                    }
                }
                Some(Complete::Noop(_)) =>
                // The candidate did not apply: try the next one.
                {
                    continue;
                }
                Some(Complete::Throw(value, traceback)) => {
                    return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
                }
            }
        }

        if waiting {
            return State::Waiting(candidates);
        }

        if matches.len() > 1 {
            // TODO: Multiple successful tasks are not currently supported. We should allow for
            // this by adding support for "mergeable" products.
            return State::Complete(
                context.throw("Conflicting values produced for subject and type."),
            );
        }

        match matches.pop() {
            Some(matched) =>
            // Exactly one value was available.
            {
                State::Complete(Complete::Return(matched))
            }
            None => State::Complete(Complete::Noop(Noop::NoTask)),
        }
    }
}

///
/// A Node that selects the given Product for each of the items in `field` on `dep_product`.
///
/// Begins by selecting the `dep_product` for the subject, and then selects a product for each
/// member of a collection named `field` on the dep_product.
///
/// The value produced by this Node guarantees that the order of the provided values matches
/// the order of declaration in the list `field` of the `dep_product`.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectDependencies {
    pub subject: Key,
    pub variants: Variants,
    pub selector: selectors::SelectDependencies,
}

impl SelectDependencies {
    fn step(&self, context: &StepContext) -> State {
        // Select the product holding the dependency list.
        let dep_product_node = NodeKey::create(
            Selector::select(self.selector.dep_product),
            self.subject,
            self.variants.clone(),
        );
        let dep_product = match context.get(&dep_product_node) {
            None => return State::Waiting(vec![dep_product_node]),
            Some(Complete::Noop(_)) => {
                return State::Complete(Complete::Noop(Noop::NoSource(
                    "No source of input product.",
                )))
            }
            Some(Complete::Throw(value, traceback)) => {
                return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
            }
            Some(Complete::Return(value)) => value.clone(),
        };

        // The product and its dependency list are available: project them.
        let dep_subjects = context.project_multi(&dep_product, &self.selector.field);
        let mut dep_nodes = Vec::new();
        for dep_subject in &dep_subjects {
            if !self.selector.field_types.contains(dep_subject.type_id()) {
                return State::Complete(context.throw(&format!(
                    "Unexpected type for member of field {:?}: {:?}",
                    self.selector.field,
                    dep_subject.type_id()
                )));
            }
            dep_nodes.push(NodeKey::create(
                Selector::select(self.selector.product),
                context.key_for(dep_subject),
                self.variants.clone(),
            ));
        }

        let mut dep_values = Vec::new();
        let mut waiting = false;
        for dep_node in &dep_nodes {
            match context.get(dep_node) {
                None => waiting = true,
                Some(Complete::Return(value)) => dep_values.push(value.clone()),
                Some(Complete::Noop(_)) => {
                    return State::Complete(Complete::Noop(Noop::NoSource(
                        "No source of required dependency.",
                    )))
                }
                Some(Complete::Throw(value, traceback)) => {
                    return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
                }
            }
        }

        if waiting {
            let mut all = vec![dep_product_node];
            all.extend(dep_nodes);
            return State::Waiting(all);
        }

        // Finally, store the resulting values.
        State::Complete(Complete::Return(
            context.store_list(dep_values.iter().collect(), false),
        ))
    }
}

///
/// Like SelectDependencies, but recursively followed: the `field` of each produced product is
/// projected in turn, and the result is the closure in topological order (each member's
/// expansion precedes the member itself, and the de-duplicating merge keeps first occurrences).
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectTransitive {
    pub subject: Key,
    pub variants: Variants,
    pub selector: selectors::SelectTransitive,
}

impl SelectTransitive {
    fn dep_node(&self, context: &StepContext, dep_subject: &Value) -> NodeKey {
        // After the root has been expanded, a traversal continues with dep_product == product.
        let mut selector = self.selector.clone();
        selector.dep_product = selector.product;
        NodeKey::SelectTransitive(SelectTransitive {
            subject: context.key_for(dep_subject),
            variants: self.variants.clone(),
            selector,
        })
    }

    fn step(&self, context: &StepContext) -> State {
        // Select the product holding the dependency list.
        let dep_product_node = NodeKey::create(
            Selector::select(self.selector.dep_product),
            self.subject,
            self.variants.clone(),
        );
        let dep_product = match context.get(&dep_product_node) {
            None => return State::Waiting(vec![dep_product_node]),
            Some(Complete::Noop(_)) => {
                return State::Complete(Complete::Noop(Noop::NoSource(
                    "No source of input product.",
                )))
            }
            Some(Complete::Throw(value, traceback)) => {
                return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
            }
            Some(Complete::Return(value)) => value.clone(),
        };

        let dep_subjects = context.project_multi(&dep_product, &self.selector.field);
        let mut dep_nodes = Vec::new();
        for dep_subject in &dep_subjects {
            if !self.selector.field_types.contains(dep_subject.type_id()) {
                return State::Complete(context.throw(&format!(
                    "Unexpected type for member of field {:?}: {:?}",
                    self.selector.field,
                    dep_subject.type_id()
                )));
            }
            dep_nodes.push(self.dep_node(context, dep_subject));
        }

        let mut expanded = Vec::new();
        let mut waiting = false;
        for dep_node in &dep_nodes {
            match context.get(dep_node) {
                None => waiting = true,
                Some(Complete::Return(value)) => expanded.push(value.clone()),
                Some(Complete::Noop(_)) => {
                    return State::Complete(Complete::Noop(Noop::NoSource(
                        "No source of required dependency.",
                    )))
                }
                Some(Complete::Throw(value, traceback)) => {
                    return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
                }
            }
        }

        if waiting {
            let mut all = vec![dep_product_node];
            all.extend(dep_nodes);
            return State::Waiting(all);
        }

        // Each member's expansion is already topologically ordered: concatenate them, and if
        // the dep_product is itself an inner member of the traversal, append it after the
        // members it depends on.
        let mut to_merge = expanded;
        if context.satisfied_by(&self.selector.product, dep_product.type_id()) {
            to_merge.push(context.store_list(vec![&dep_product], false));
        }
        State::Complete(Complete::Return(
            context.store_list(to_merge.iter().collect(), true),
        ))
    }
}

///
/// A Node that selects the given Product for a subject projected out of a field of a product
/// of the original subject.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectProjection {
    pub subject: Key,
    pub variants: Variants,
    pub selector: selectors::SelectProjection,
}

impl SelectProjection {
    fn step(&self, context: &StepContext) -> State {
        // Request the product we need to compute the subject.
        let input_node = NodeKey::create(
            Selector::select(self.selector.input_product),
            self.subject,
            self.variants.clone(),
        );
        let input_product = match context.get(&input_node) {
            None => return State::Waiting(vec![input_node]),
            Some(Complete::Noop(_)) => {
                return State::Complete(Complete::Noop(Noop::NoSource(
                    "No source of input product.",
                )))
            }
            Some(Complete::Throw(value, traceback)) => {
                return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
            }
            Some(Complete::Return(value)) => value.clone(),
        };

        // And then project the relevant field as the new subject.
        let projected_subject = context.project(
            &input_product,
            &self.selector.field,
            &self.selector.projected_subject,
        );
        let output_node = NodeKey::create(
            Selector::select(self.selector.product),
            context.key_for(&projected_subject),
            self.variants.clone(),
        );
        match context.get(&output_node) {
            None => State::Waiting(vec![input_node, output_node]),
            Some(Complete::Return(value)) => State::Complete(Complete::Return(value.clone())),
            Some(Complete::Noop(_)) => State::Complete(Complete::Noop(Noop::NoSource(
                "No source of projected product.",
            ))),
            Some(Complete::Throw(value, traceback)) => {
                State::Complete(Complete::Throw(value.clone(), traceback.clone()))
            }
        }
    }
}

///
/// A Node that runs a registered task rule: resolves every selector in the rule's clause, then
/// becomes Runnable with the resolved values as arguments, in clause order.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Task {
    pub subject: Key,
    pub variants: Variants,
    pub selector: tasks::Task,
}

impl Task {
    fn step(&self, context: &StepContext) -> State {
        let dep_nodes: Vec<NodeKey> = self
            .selector
            .clause
            .iter()
            .map(|selector| NodeKey::create(selector.clone(), self.subject, self.variants.clone()))
            .collect();

        let mut dep_values = Vec::new();
        let mut waiting = false;
        for dep_node in &dep_nodes {
            match context.get(dep_node) {
                None => waiting = true,
                Some(Complete::Return(value)) => dep_values.push(value.clone()),
                Some(Complete::Noop(_)) => {
                    return State::Complete(Complete::Noop(Noop::NoSource(
                        "Missing at least one input.",
                    )))
                }
                Some(Complete::Throw(value, traceback)) => {
                    return State::Complete(Complete::Throw(value.clone(), traceback.clone()))
                }
            }
        }

        if waiting {
            return State::Waiting(dep_nodes);
        }

        State::Runnable(Runnable::Extern {
            func: self.selector.func,
            args: dep_values,
            cacheable: self.selector.cacheable,
        })
    }
}

///
/// An intrinsic Node that snapshots the paths matched by the PathGlobs product of its subject.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Snapshot {
    pub subject: Key,
    pub variants: Variants,
    pub product: TypeConstraint,
}

impl Snapshot {
    fn step(&self, context: &StepContext) -> State {
        // Compute and parse PathGlobs for the subject.
        let globs_node = NodeKey::create(
            Selector::select(context.type_path_globs()),
            self.subject,
            self.variants.clone(),
        );
        match context.get(&globs_node) {
            None => State::Waiting(vec![globs_node]),
            Some(Complete::Noop(_)) => {
                State::Complete(Complete::Noop(Noop::NoSource("No source of PathGlobs.")))
            }
            Some(Complete::Throw(value, traceback)) => {
                State::Complete(Complete::Throw(value.clone(), traceback.clone()))
            }
            Some(Complete::Return(value)) => match context.lift_path_globs(value) {
                Ok(path_globs) => State::Runnable(Runnable::Snapshot { path_globs }),
                Err(e) => {
                    State::Complete(context.throw(&format!("Failed to parse PathGlobs: {e}")))
                }
            },
        }
    }
}

///
/// An intrinsic Node that lists the directory named by its subject.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DirectoryListing {
    pub subject: Key,
    pub variants: Variants,
    pub product: TypeConstraint,
}

impl DirectoryListing {
    fn step(&self, context: &StepContext) -> State {
        match context.lift_dir(&context.val_for(&self.subject)) {
            Ok(dir) => State::Runnable(Runnable::DirectoryListing { dir }),
            Err(e) => State::Complete(context.throw(&e)),
        }
    }
}

///
/// An intrinsic Node that resolves the link named by its subject.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReadLink {
    pub subject: Key,
    pub variants: Variants,
    pub product: TypeConstraint,
}

impl ReadLink {
    fn step(&self, context: &StepContext) -> State {
        match context.lift_link(&context.val_for(&self.subject)) {
            Ok(link) => State::Runnable(Runnable::ReadLink { link }),
            Err(e) => State::Complete(context.throw(&e)),
        }
    }
}

///
/// An intrinsic Node that reads the archived file contents of the Snapshot which is its
/// subject.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FileContents {
    pub subject: Key,
    pub variants: Variants,
    pub product: TypeConstraint,
}

impl FileContents {
    fn step(&self, context: &StepContext) -> State {
        match context.lift_fingerprint(&context.val_for(&self.subject)) {
            Ok(fingerprint) => State::Runnable(Runnable::FileContents { fingerprint }),
            Err(e) => State::Complete(context.throw(&e)),
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum NodeKey {
    Select(Select),
    SelectDependencies(SelectDependencies),
    SelectTransitive(SelectTransitive),
    SelectProjection(SelectProjection),
    Task(Task),
    Snapshot(Snapshot),
    DirectoryListing(DirectoryListing),
    ReadLink(ReadLink),
    FileContents(FileContents),
}

impl NodeKey {
    pub fn create(selector: Selector, subject: Key, variants: Variants) -> NodeKey {
        match selector {
            Selector::Select(s) => NodeKey::Select(Select {
                subject,
                variants,
                selector: s,
            }),
            Selector::SelectDependencies(s) => NodeKey::SelectDependencies(SelectDependencies {
                subject,
                variants,
                selector: s,
            }),
            Selector::SelectTransitive(s) => NodeKey::SelectTransitive(SelectTransitive {
                subject,
                variants,
                selector: s,
            }),
            Selector::SelectProjection(s) => NodeKey::SelectProjection(SelectProjection {
                subject,
                variants,
                selector: s,
            }),
        }
    }

    pub fn from_intrinsic(
        intrinsic: &tasks::Intrinsic,
        subject: Key,
        variants: Variants,
    ) -> NodeKey {
        match intrinsic.kind {
            IntrinsicKind::Snapshot => NodeKey::Snapshot(Snapshot {
                subject,
                variants,
                product: intrinsic.product,
            }),
            IntrinsicKind::FileContents => NodeKey::FileContents(FileContents {
                subject,
                variants,
                product: intrinsic.product,
            }),
            IntrinsicKind::DirectoryListing => NodeKey::DirectoryListing(DirectoryListing {
                subject,
                variants,
                product: intrinsic.product,
            }),
            IntrinsicKind::ReadLink => NodeKey::ReadLink(ReadLink {
                subject,
                variants,
                product: intrinsic.product,
            }),
        }
    }

    pub fn subject(&self) -> &Key {
        match self {
            NodeKey::Select(n) => &n.subject,
            NodeKey::SelectDependencies(n) => &n.subject,
            NodeKey::SelectTransitive(n) => &n.subject,
            NodeKey::SelectProjection(n) => &n.subject,
            NodeKey::Task(n) => &n.subject,
            NodeKey::Snapshot(n) => &n.subject,
            NodeKey::DirectoryListing(n) => &n.subject,
            NodeKey::ReadLink(n) => &n.subject,
            NodeKey::FileContents(n) => &n.subject,
        }
    }

    pub fn product(&self) -> &TypeConstraint {
        match self {
            NodeKey::Select(n) => &n.selector.product,
            NodeKey::SelectDependencies(n) => &n.selector.product,
            NodeKey::SelectTransitive(n) => &n.selector.product,
            NodeKey::SelectProjection(n) => &n.selector.product,
            NodeKey::Task(n) => &n.selector.product,
            NodeKey::Snapshot(n) => &n.product,
            NodeKey::DirectoryListing(n) => &n.product,
            NodeKey::ReadLink(n) => &n.product,
            NodeKey::FileContents(n) => &n.product,
        }
    }

    ///
    /// A non-cacheable Node is re-executed on every run rather than being memoized across
    /// runs. Intrinsics are cacheable: their results are retired by path invalidation instead.
    ///
    pub fn cacheable(&self) -> bool {
        match self {
            NodeKey::Task(t) => t.selector.cacheable,
            _ => true,
        }
    }

    pub fn step(&self, context: &StepContext) -> State {
        match self {
            NodeKey::Select(n) => n.step(context),
            NodeKey::SelectDependencies(n) => n.step(context),
            NodeKey::SelectTransitive(n) => n.step(context),
            NodeKey::SelectProjection(n) => n.step(context),
            NodeKey::Task(n) => n.step(context),
            NodeKey::Snapshot(n) => n.step(context),
            NodeKey::DirectoryListing(n) => n.step(context),
            NodeKey::ReadLink(n) => n.step(context),
            NodeKey::FileContents(n) => n.step(context),
        }
    }
}

impl ::graph::Node for NodeKey {
    type State = Complete;

    fn format(&self) -> String {
        let (kind, subject) = match self {
            NodeKey::Select(n) => ("Select".to_string(), &n.subject),
            NodeKey::SelectDependencies(n) => ("Dependencies".to_string(), &n.subject),
            NodeKey::SelectTransitive(n) => ("Transitive".to_string(), &n.subject),
            NodeKey::SelectProjection(n) => ("Projection".to_string(), &n.subject),
            NodeKey::Task(n) => (format!("Task({})", n.selector.func.0.id()), &n.subject),
            NodeKey::Snapshot(n) => ("Snapshot".to_string(), &n.subject),
            NodeKey::DirectoryListing(n) => ("DirectoryListing".to_string(), &n.subject),
            NodeKey::ReadLink(n) => ("ReadLink".to_string(), &n.subject),
            NodeKey::FileContents(n) => ("FileContents".to_string(), &n.subject),
        };
        format!(
            "{}(subject={}, product={})",
            kind,
            subject.id(),
            self.product().0.id()
        )
    }
}
