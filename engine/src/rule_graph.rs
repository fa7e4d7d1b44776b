// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{hash_map, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::hash::Hash;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::core::{Key, TypeConstraint, TypeId, ANY_TYPE};
use crate::externs::Externs;
use crate::interning::Interns;
use crate::selectors::Selector;
use crate::tasks::{Intrinsic, Task, Tasks};

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
enum Entry {
    SubjectIsProduct {
        subject_type: TypeId,
    },

    Root(RootEntry),

    InnerEntry(InnerEntry),

    Singleton {
        value: Key,
        product: TypeConstraint,
    },

    Intrinsic(Intrinsic),

    Unreachable {
        // NB: unreachable is an error type, it might be better to name it error, but currently
        //     unreachable is the only error entry type.
        rule: Task,
        reason: Diagnostic,
    },
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
struct RootEntry {
    subject_type: TypeId,
    clause: Vec<Selector>,
}

impl From<RootEntry> for Entry {
    fn from(entry: RootEntry) -> Entry {
        Entry::Root(entry)
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
struct InnerEntry {
    subject_type: TypeId,
    rule: Task,
}

impl From<InnerEntry> for Entry {
    fn from(entry: InnerEntry) -> Entry {
        Entry::InnerEntry(entry)
    }
}

impl Entry {
    fn new_unreachable(rule: &Task) -> Entry {
        Entry::Unreachable {
            rule: rule.clone(),
            reason: Diagnostic {
                subject_type: ANY_TYPE,
                reason: "".to_string(),
            },
        }
    }

    fn can_have_dependencies(&self) -> bool {
        match self {
            Entry::SubjectIsProduct { .. } => false,
            Entry::Singleton { .. } => false,
            Entry::Intrinsic(_) => false,
            Entry::InnerEntry(_) => true,
            Entry::Root(_) => true,
            Entry::Unreachable { .. } => false,
        }
    }

    fn can_be_dependency(&self) -> bool {
        match self {
            Entry::SubjectIsProduct { .. } => true,
            Entry::Singleton { .. } => true,
            Entry::Intrinsic(_) => true,
            Entry::InnerEntry(_) => true,
            Entry::Root(_) => false,
            Entry::Unreachable { .. } => false,
        }
    }

    fn subject_type(&self) -> TypeId {
        match self {
            Entry::InnerEntry(ref inner) => inner.subject_type,
            Entry::Root(ref root) => root.subject_type,
            Entry::SubjectIsProduct { subject_type } => *subject_type,
            Entry::Intrinsic(ref intrinsic) => intrinsic.subject_type,
            _ => panic!("The entry type {self:?} has no subject type."),
        }
    }
}

type Entries = Vec<Entry>;
type RootRuleDependencyEdges = HashMap<RootEntry, RuleEdges>;
type RuleDependencyEdges = HashMap<InnerEntry, RuleEdges>;
type RuleDiagnostics = Vec<Diagnostic>;
type UnfulfillableRuleMap = HashMap<Entry, RuleDiagnostics>;

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct Diagnostic {
    subject_type: TypeId,
    reason: String,
}

///
/// Given the task index and the root subject types, produces a rule graph that allows
/// dependency nodes to be found statically rather than dynamically: it proves, before any
/// execution, that every (root subject type, product) pair has at least one satisfiable rule
/// chain.
///
pub struct GraphMaker<'t> {
    tasks: &'t Tasks,
    externs: &'t Externs,
    interns: &'t Interns,
    root_subject_types: Vec<TypeId>,
}

impl<'t> GraphMaker<'t> {
    pub fn new(
        tasks: &'t Tasks,
        externs: &'t Externs,
        interns: &'t Interns,
        root_subject_types: Vec<TypeId>,
    ) -> GraphMaker<'t> {
        GraphMaker {
            tasks,
            externs,
            interns,
            root_subject_types,
        }
    }

    fn satisfied_by(&self, constraint: &TypeConstraint, subject_type: TypeId) -> bool {
        self.externs
            .satisfied_by_type(self.interns, constraint, &subject_type)
    }

    pub fn full_graph(&self) -> RuleGraph {
        let mut full_root_rule_dependency_edges: RootRuleDependencyEdges = HashMap::new();
        let mut full_dependency_edges: RuleDependencyEdges = HashMap::new();
        let mut full_unfulfillable_rules: UnfulfillableRuleMap = HashMap::new();

        let product_types = self.tasks.all_product_types();
        for beginning_root in self.gen_root_entries(&product_types) {
            let constructed_graph = self.construct_graph(
                beginning_root,
                full_root_rule_dependency_edges,
                full_dependency_edges,
                full_unfulfillable_rules,
            );

            full_root_rule_dependency_edges = constructed_graph.root_dependencies;
            full_dependency_edges = constructed_graph.rule_dependency_edges;
            full_unfulfillable_rules = constructed_graph.unfulfillable_rules;
        }

        // Any task rule that landed in neither the graph nor the unfulfillable map was never
        // reachable from a root.
        let rules_in_graph: HashSet<_> = full_dependency_edges
            .keys()
            .map(|entry| entry.rule.clone())
            .collect();
        let unfulfillable_discovered: HashSet<_> = full_unfulfillable_rules
            .keys()
            .filter_map(|entry| match entry {
                Entry::InnerEntry(ref inner) => Some(inner.rule.clone()),
                Entry::Unreachable { ref rule, .. } => Some(rule.clone()),
                _ => None,
            })
            .collect();
        for rule in self.tasks.all_tasks() {
            if rules_in_graph.contains(rule) || unfulfillable_discovered.contains(rule) {
                continue;
            }
            full_unfulfillable_rules
                .entry(Entry::new_unreachable(rule))
                .or_default()
                .push(Diagnostic {
                    subject_type: ANY_TYPE,
                    reason: "Unreachable".to_string(),
                });
        }

        let unfinished_graph = RuleGraph {
            root_dependencies: full_root_rule_dependency_edges,
            rule_dependency_edges: full_dependency_edges,
            unfulfillable_rules: full_unfulfillable_rules,
        };

        GraphMaker::remove_unfulfillable_rules_and_dependents(unfinished_graph)
    }

    fn construct_graph(
        &self,
        beginning_rule: RootEntry,
        mut root_rule_dependency_edges: RootRuleDependencyEdges,
        mut rule_dependency_edges: RuleDependencyEdges,
        mut unfulfillable_rules: UnfulfillableRuleMap,
    ) -> RuleGraph {
        let mut rules_to_traverse: VecDeque<Entry> = VecDeque::new();
        rules_to_traverse.push_back(Entry::from(beginning_rule));
        while let Some(entry) = rules_to_traverse.pop_front() {
            if entry.can_be_dependency() && !entry.can_have_dependencies() {
                continue;
            }
            if !entry.can_have_dependencies() {
                panic!("Cannot determine dependencies of entry: {entry:?}");
            }
            if unfulfillable_rules.contains_key(&entry) {
                continue;
            }
            if let Entry::InnerEntry(ref inner_entry) = entry {
                if rule_dependency_edges.contains_key(inner_entry) {
                    continue;
                }
            }

            let clause = match entry {
                Entry::InnerEntry(InnerEntry {
                    rule: Task { ref clause, .. },
                    ..
                })
                | Entry::Root(RootEntry { ref clause, .. }) => clause.clone(),
                _ => panic!("Entry without a clause was not filtered out: {entry:?}"),
            };

            let mut was_unfulfillable = false;
            for selector in &clause {
                match selector {
                    Selector::Select(select) => {
                        // TODO: handle the Addresses / Variants case.
                        let rules_or_literals_for_selector =
                            self.rhs_for_select(entry.subject_type(), select.product);
                        if rules_or_literals_for_selector.is_empty() {
                            GraphMaker::mark_unfulfillable(
                                &mut unfulfillable_rules,
                                &entry,
                                entry.subject_type(),
                                format!("no matches for {select:?}"),
                            );
                            was_unfulfillable = true;
                            continue;
                        }
                        GraphMaker::add_rules_to_graph(
                            &mut rules_to_traverse,
                            &mut rule_dependency_edges,
                            &mut unfulfillable_rules,
                            &mut root_rule_dependency_edges,
                            &entry,
                            vec![selector.clone()],
                            rules_or_literals_for_selector,
                        );
                    }
                    Selector::SelectDependencies(select) => {
                        was_unfulfillable |= self.add_dep_product_edges(
                            &mut rules_to_traverse,
                            &mut rule_dependency_edges,
                            &mut unfulfillable_rules,
                            &mut root_rule_dependency_edges,
                            &entry,
                            selector,
                            select.dep_product,
                            select.product,
                            &select.field_types,
                        );
                    }
                    Selector::SelectTransitive(select) => {
                        was_unfulfillable |= self.add_dep_product_edges(
                            &mut rules_to_traverse,
                            &mut rule_dependency_edges,
                            &mut unfulfillable_rules,
                            &mut root_rule_dependency_edges,
                            &entry,
                            selector,
                            select.dep_product,
                            select.product,
                            &select.field_types,
                        );
                    }
                    Selector::SelectProjection(select) => {
                        let initial_rules_or_literals =
                            self.rhs_for_select(entry.subject_type(), select.input_product);
                        if initial_rules_or_literals.is_empty() {
                            GraphMaker::mark_unfulfillable(
                                &mut unfulfillable_rules,
                                &entry,
                                entry.subject_type(),
                                format!(
                                    "no matches for {:?} when resolving {selector:?}",
                                    select.input_product
                                ),
                            );
                            was_unfulfillable = true;
                            continue;
                        }

                        let projected_rules_or_literals =
                            self.rhs_for_select(select.projected_subject, select.product);
                        if projected_rules_or_literals.is_empty() {
                            GraphMaker::mark_unfulfillable(
                                &mut unfulfillable_rules,
                                &entry,
                                select.projected_subject,
                                format!(
                                    "no matches for {:?} when resolving {selector:?}",
                                    select.product
                                ),
                            );
                            was_unfulfillable = true;
                            continue;
                        }
                        GraphMaker::add_rules_to_graph(
                            &mut rules_to_traverse,
                            &mut rule_dependency_edges,
                            &mut unfulfillable_rules,
                            &mut root_rule_dependency_edges,
                            &entry,
                            vec![selector.clone(), Selector::select(select.input_product)],
                            initial_rules_or_literals,
                        );
                        GraphMaker::add_rules_to_graph(
                            &mut rules_to_traverse,
                            &mut rule_dependency_edges,
                            &mut unfulfillable_rules,
                            &mut root_rule_dependency_edges,
                            &entry,
                            vec![selector.clone(), Selector::select(select.product)],
                            projected_rules_or_literals,
                        );
                    }
                }
            }
            if !was_unfulfillable {
                // NB: In this case there were no selectors.
                GraphMaker::add_rules_to_graph(
                    &mut rules_to_traverse,
                    &mut rule_dependency_edges,
                    &mut unfulfillable_rules,
                    &mut root_rule_dependency_edges,
                    &entry,
                    vec![],
                    vec![],
                );
            }
        }
        RuleGraph {
            root_dependencies: root_rule_dependency_edges,
            rule_dependency_edges,
            unfulfillable_rules,
        }
    }

    ///
    /// The shared shape of SelectDependencies and SelectTransitive: the dep product must be
    /// providable for the current subject type, and the product must be providable for every
    /// declared field type. Returns true if the selector was unfulfillable.
    ///
    #[allow(clippy::too_many_arguments)]
    fn add_dep_product_edges(
        &self,
        rules_to_traverse: &mut VecDeque<Entry>,
        rule_dependency_edges: &mut RuleDependencyEdges,
        unfulfillable_rules: &mut UnfulfillableRuleMap,
        root_rule_dependency_edges: &mut RootRuleDependencyEdges,
        entry: &Entry,
        selector: &Selector,
        dep_product: TypeConstraint,
        product: TypeConstraint,
        field_types: &[TypeId],
    ) -> bool {
        let initial_rules_or_literals = self.rhs_for_select(entry.subject_type(), dep_product);
        if initial_rules_or_literals.is_empty() {
            GraphMaker::mark_unfulfillable(
                unfulfillable_rules,
                entry,
                entry.subject_type(),
                format!("no matches for {dep_product:?} when resolving {selector:?}"),
            );
            return true;
        }

        let mut rules_for_dependencies = Vec::new();
        for &field_type in field_types {
            rules_for_dependencies.extend(self.rhs_for_select(field_type, product));
        }
        if rules_for_dependencies.is_empty() {
            for &field_type in field_types {
                GraphMaker::mark_unfulfillable(
                    unfulfillable_rules,
                    entry,
                    field_type,
                    format!("no matches for {product:?} when resolving {selector:?}"),
                );
            }
            return true;
        }

        GraphMaker::add_rules_to_graph(
            rules_to_traverse,
            rule_dependency_edges,
            unfulfillable_rules,
            root_rule_dependency_edges,
            entry,
            vec![selector.clone(), Selector::select(dep_product)],
            initial_rules_or_literals,
        );
        GraphMaker::add_rules_to_graph(
            rules_to_traverse,
            rule_dependency_edges,
            unfulfillable_rules,
            root_rule_dependency_edges,
            entry,
            vec![selector.clone(), Selector::select(product)],
            rules_for_dependencies,
        );
        false
    }

    ///
    /// Everything that can provide the given product for the given subject type, in
    /// tie-breaking order: a matching subject is always picked first, then a singleton, then
    /// an intrinsic, and finally the registered task rules.
    ///
    fn rhs_for_select(&self, subject_type: TypeId, product: TypeConstraint) -> Entries {
        if self.satisfied_by(&product, subject_type) {
            return vec![Entry::SubjectIsProduct { subject_type }];
        }
        if let Some(&value) = self.tasks.gen_singleton(&product) {
            return vec![Entry::Singleton { value, product }];
        }
        if let Some(intrinsic) = self.tasks.gen_intrinsic(&subject_type, &product) {
            return vec![Entry::Intrinsic(*intrinsic)];
        }
        self.tasks
            .gen_tasks(&product)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|task| {
                        Entry::InnerEntry(InnerEntry {
                            subject_type,
                            rule: task.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn gen_root_entries(&self, product_types: &[TypeConstraint]) -> Vec<RootEntry> {
        let mut result: Vec<RootEntry> = Vec::new();
        for &subject_type in &self.root_subject_types {
            for &product_type in product_types {
                if self.rhs_for_select(subject_type, product_type).is_empty() {
                    continue;
                }
                result.push(RootEntry {
                    subject_type,
                    clause: vec![Selector::select(product_type)],
                });
            }
        }
        result
    }

    fn mark_unfulfillable(
        unfulfillable_rules: &mut UnfulfillableRuleMap,
        entry: &Entry,
        subject_type: TypeId,
        reason: String,
    ) {
        unfulfillable_rules
            .entry(entry.clone())
            .or_default()
            .push(Diagnostic {
                subject_type,
                reason,
            });
    }

    fn add_rules_to_graph(
        rules_to_traverse: &mut VecDeque<Entry>,
        rule_dependency_edges: &mut RuleDependencyEdges,
        unfulfillable_rules: &mut UnfulfillableRuleMap,
        root_rule_dependency_edges: &mut RootRuleDependencyEdges,
        entry: &Entry,
        selector_path: Vec<Selector>,
        dep_rules: Entries,
    ) {
        {
            let unseen_dep_rules = dep_rules
                .iter()
                .filter(|g| !unfulfillable_rules.contains_key(g))
                .filter(|g| match g {
                    Entry::InnerEntry(ref r) => !rule_dependency_edges.contains_key(r),
                    Entry::Root(ref r) => !root_rule_dependency_edges.contains_key(r),
                    _ => true,
                })
                .cloned();
            rules_to_traverse.extend(unseen_dep_rules);
        }
        match entry {
            Entry::Root(ref root_entry) => {
                let edges = root_rule_dependency_edges
                    .entry(root_entry.clone())
                    .or_insert_with(RuleEdges::new);
                edges.add_edges_via(selector_path, &dep_rules);
            }
            Entry::InnerEntry(ref inner_entry) => {
                let edges = rule_dependency_edges
                    .entry(inner_entry.clone())
                    .or_insert_with(RuleEdges::new);
                if edges.has_edges_for(&selector_path) {
                    // This is an error that should only happen if there's a bug in the
                    // algorithm, but it might make sense to expose it in a more friendly way.
                    panic!("Rule {entry:?} already has dependencies set for selector {selector_path:?}");
                }
                edges.add_edges_via(selector_path, &dep_rules);
            }
            _ => {
                // these should have already been filtered out before this was called.
                panic!("Expected this entry type to have already been filtered out: {entry:?}");
            }
        }
    }

    ///
    /// Removes all unfulfillable rules transitively from the roots and the dependency edges.
    ///
    /// Takes the current root rule set and dependency table and removes all rules that are not
    /// transitively fulfillable.
    ///
    fn remove_unfulfillable_rules_and_dependents(mut rule_graph: RuleGraph) -> RuleGraph {
        let mut removal_traversal: VecDeque<_> =
            rule_graph.unfulfillable_rules.keys().cloned().collect();
        while let Some(unfulfillable_entry) = removal_traversal.pop_front() {
            GraphMaker::update_edges_based_on_unfulfillable_entry(
                &mut rule_graph.rule_dependency_edges,
                &mut rule_graph.unfulfillable_rules,
                &mut removal_traversal,
                &unfulfillable_entry,
            );
            GraphMaker::update_edges_based_on_unfulfillable_entry(
                &mut rule_graph.root_dependencies,
                &mut rule_graph.unfulfillable_rules,
                &mut removal_traversal,
                &unfulfillable_entry,
            );
        }

        // Blow up if anything remains dangling; all referenced dependencies should have
        // entries in the graph.
        for (root_rule, deps) in &rule_graph.root_dependencies {
            for d in &deps.dependencies {
                match d {
                    Entry::InnerEntry(ref inner) => {
                        if !rule_graph.rule_dependency_edges.contains_key(inner) {
                            panic!(
                                "All referenced dependencies should have entries in the graph, \
                                 but {root_rule:?} had {d:?}, which is missing!"
                            );
                        }
                    }
                    Entry::Root(_) => panic!("Root entries cannot be depended on."),
                    _ => {
                        // ok
                    }
                }
            }
        }
        rule_graph
    }

    fn update_edges_based_on_unfulfillable_entry<K>(
        edge_container: &mut HashMap<K, RuleEdges>,
        new_unfulfillable_rules: &mut UnfulfillableRuleMap,
        removal_traversal: &mut VecDeque<Entry>,
        unfulfillable_entry: &Entry,
    ) where
        Entry: From<K>,
        K: Eq + Hash + Clone,
    {
        let keys: Vec<_> = edge_container
            .keys()
            .filter(|&c| !new_unfulfillable_rules.contains_key(&Entry::from(c.clone())))
            .cloned()
            .collect();
        for current_entry in keys {
            if let hash_map::Entry::Occupied(mut o) = edge_container.entry(current_entry) {
                if o.get().makes_unfulfillable(unfulfillable_entry) {
                    let key_entry = Entry::from(o.key().clone());

                    let entry_subject = key_entry.subject_type();
                    new_unfulfillable_rules
                        .entry(key_entry.clone())
                        .or_default()
                        .push(Diagnostic {
                            subject_type: entry_subject,
                            reason: format!("depends on unfulfillable {unfulfillable_entry:?}"),
                        });

                    removal_traversal.push_back(key_entry);

                    o.remove();
                } else {
                    let deps_without_rule = o.get().without_rule(unfulfillable_entry);
                    o.insert(deps_without_rule);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct RuleGraph {
    root_dependencies: RootRuleDependencyEdges,
    rule_dependency_edges: RuleDependencyEdges,
    unfulfillable_rules: UnfulfillableRuleMap,
}

impl RuleGraph {
    pub fn validate(&self) -> Result<(), String> {
        if self.has_errors() {
            Err(self.build_error_msg())
        } else {
            Ok(())
        }
    }

    fn has_errors(&self) -> bool {
        let used_rules: HashSet<_> = self
            .rule_dependency_edges
            .keys()
            .map(|entry| &entry.rule)
            .collect();
        self.unfulfillable_rules
            .iter()
            .any(|(entry, diagnostics)| match entry {
                Entry::InnerEntry(ref inner) => {
                    !used_rules.contains(&inner.rule) && !diagnostics.is_empty()
                }
                _ => false,
            })
    }

    fn build_error_msg(&self) -> String {
        // TODO: the rule display is really unfriendly right now.
        let mut collated_errors: HashMap<Task, HashMap<String, HashSet<TypeId>>> = HashMap::new();

        let used_rules: HashSet<_> = self
            .rule_dependency_edges
            .keys()
            .map(|entry| &entry.rule)
            .collect();
        for (rule_entry, diagnostics) in &self.unfulfillable_rules {
            match rule_entry {
                Entry::InnerEntry(ref inner) => {
                    if used_rules.contains(&inner.rule) {
                        continue;
                    }
                    for d in diagnostics {
                        collated_errors
                            .entry(inner.rule.clone())
                            .or_default()
                            .entry(d.reason.clone())
                            .or_default()
                            .insert(d.subject_type);
                    }
                }
                _ => {
                    // We're only checking rule usage, not entry usage generally, so we ignore
                    // entries that do not have rules.
                }
            }
        }
        let mut msgs: Vec<String> = collated_errors
            .into_iter()
            .map(|(rule, subject_types_by_reasons)| format_msgs(&rule, &subject_types_by_reasons))
            .collect();
        msgs.sort();

        format!("Rules with errors {}:\n  {}", msgs.len(), msgs.join("\n  "))
    }

    ///
    /// Writes the rule graph in graphviz "dot" form.
    ///
    pub fn visualize(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        let mut f = BufWriter::new(file);

        f.write_all(b"digraph rules {\n")?;
        f.write_all(b"  rankdir=LR;\n")?;

        for (root, edges) in &self.root_dependencies {
            let root_str = format!(
                "Root(subject={:?}, clause={:?})",
                root.subject_type, root.clause
            )
            .replace('\"', "\\\"");
            for dep in &edges.dependencies {
                f.write_fmt(format_args!(
                    "  \"{}\" -> \"{}\"\n",
                    root_str,
                    entry_str(dep)
                ))?;
            }
        }
        for (inner, edges) in &self.rule_dependency_edges {
            let inner_str = entry_str(&Entry::InnerEntry(inner.clone()));
            for dep in &edges.dependencies {
                f.write_fmt(format_args!(
                    "  \"{}\" -> \"{}\"\n",
                    inner_str,
                    entry_str(dep)
                ))?;
            }
        }

        f.write_all(b"}\n")?;
        Ok(())
    }
}

fn entry_str(entry: &Entry) -> String {
    let s = match entry {
        Entry::SubjectIsProduct { subject_type } => format!("SubjectIsProduct({subject_type:?})"),
        Entry::Singleton { value, product } => format!("Singleton({value:?}, {product:?})"),
        Entry::Intrinsic(intrinsic) => format!("Intrinsic({intrinsic:?})"),
        Entry::InnerEntry(inner) => {
            format!("Rule(subject={:?}, {:?})", inner.subject_type, inner.rule)
        }
        Entry::Root(root) => format!("Root({:?}, {:?})", root.subject_type, root.clause),
        Entry::Unreachable { rule, .. } => format!("Unreachable({rule:?})"),
    };
    s.replace('\"', "\\\"")
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RuleEdges {
    dependencies: Entries,
    selector_to_dependencies: HashMap<Vec<Selector>, Entries>,
}

impl RuleEdges {
    fn new() -> RuleEdges {
        RuleEdges {
            dependencies: vec![],
            selector_to_dependencies: HashMap::new(),
        }
    }

    fn add_edges_via(&mut self, selector_path: Vec<Selector>, new_dependencies: &Entries) {
        if selector_path.is_empty() && !new_dependencies.is_empty() {
            panic!("Cannot specify an empty selector path with non-empty dependencies!");
        }
        let deps_for_selector = self
            .selector_to_dependencies
            .entry(selector_path)
            .or_default();
        for d in new_dependencies {
            deps_for_selector.push(d.clone());
            self.dependencies.push(d.clone());
        }
    }

    fn has_edges_for(&self, selector_path: &[Selector]) -> bool {
        self.selector_to_dependencies.contains_key(selector_path)
    }

    ///
    /// Returns true if removing dep_to_eliminate makes this set of edges unfulfillable.
    ///
    fn makes_unfulfillable(&self, dep_to_eliminate: &Entry) -> bool {
        if self.dependencies.len() == 1 && &self.dependencies[0] == dep_to_eliminate {
            true
        } else {
            self.selector_to_dependencies
                .values()
                .any(|deps| deps.len() == 1 && &deps[0] == dep_to_eliminate)
        }
    }

    fn without_rule(&self, dep: &Entry) -> RuleEdges {
        let new_deps: Entries = self
            .dependencies
            .iter()
            .filter(|&d| d != dep)
            .cloned()
            .collect();
        if new_deps.len() == self.dependencies.len() {
            return self.clone();
        }
        let mut new_selector_deps: HashMap<Vec<Selector>, Entries> = HashMap::new();
        for (selector, deps) in &self.selector_to_dependencies {
            new_selector_deps.insert(
                selector.clone(),
                deps.iter().filter(|&d| d != dep).cloned().collect(),
            );
        }
        RuleEdges {
            dependencies: new_deps,
            selector_to_dependencies: new_selector_deps,
        }
    }
}

fn format_msgs(rule: &Task, subject_types_by_reasons: &HashMap<String, HashSet<TypeId>>) -> String {
    let mut errors: Vec<_> = subject_types_by_reasons
        .iter()
        .map(|(reason, subject_types)| {
            let mut types: Vec<String> =
                subject_types.iter().map(|t| format!("{t:?}")).collect();
            types.sort();
            format!("{} with subject types: {}", reason, types.join(", "))
        })
        .collect();
    errors.sort();
    format!("{rule:?}: {}", errors.join("\n    "))
}
