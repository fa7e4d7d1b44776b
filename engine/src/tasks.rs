// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use crate::core::{Function, Key, TypeConstraint, TypeId, FNV};
use crate::selectors::{
    Select, SelectDependencies, SelectProjection, SelectTransitive, Selector,
};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Task {
    pub product: TypeConstraint,
    pub clause: Vec<Selector>,
    pub func: Function,
    pub cacheable: bool,
}

///
/// Rules implemented inside the engine (file I/O, snapshotting, content reads). They are
/// selected by the (subject type, product) pair rather than by product alone.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IntrinsicKind {
    Snapshot,
    FileContents,
    DirectoryListing,
    ReadLink,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Intrinsic {
    pub kind: IntrinsicKind,
    pub subject_type: TypeId,
    pub product: TypeConstraint,
}

///
/// Registry of the rules able to produce each product type, along with the field names the
/// engine projects with.
///
/// Lookup respects the tie-breaking order for multiple providers: a singleton is the only
/// provider for its product; an intrinsic beats user rules for its (subject type, product).
///
pub struct Tasks {
    // product -> the fixed value which is the only provider for that product.
    singletons: HashMap<TypeConstraint, Key, FNV>,
    // (subject type, product) -> engine-implemented rule.
    intrinsics: HashMap<(TypeId, TypeConstraint), Intrinsic, FNV>,
    // product -> list of tasks implementing it.
    tasks: HashMap<TypeConstraint, Vec<Task>, FNV>,
    // Field names used for host projections.
    pub field_name: String,
    pub field_products: String,
    pub field_include: String,
    pub field_exclude: String,
    pub field_path: String,
    pub field_fingerprint: String,
    // Used during the construction of the tasks map.
    preparing: Option<Task>,
}

///
/// Defines a stateful lifecycle for defining tasks. Call in order:
///   1. task_begin() - once per task
///   2. add_select*() - zero or more times per task to add input clauses
///   3. task_end() - once per task
///
/// Also has one-shot methods for registering a singleton (`singleton_add`) and an intrinsic
/// (`intrinsic_add`), which have no selector clauses.
///
impl Tasks {
    pub fn new() -> Tasks {
        Tasks {
            singletons: Default::default(),
            intrinsics: Default::default(),
            tasks: Default::default(),
            field_name: "name".to_string(),
            field_products: "products".to_string(),
            field_include: "include".to_string(),
            field_exclude: "exclude".to_string(),
            field_path: "path".to_string(),
            field_fingerprint: "fingerprint".to_string(),
            preparing: None,
        }
    }

    pub fn all_product_types(&self) -> Vec<TypeConstraint> {
        let mut product_types: Vec<TypeConstraint> = self
            .singletons
            .keys()
            .chain(self.tasks.keys())
            .cloned()
            .chain(self.intrinsics.values().map(|i| i.product))
            .collect();
        // NB: sorted by id so that dedup will consolidate runs of duplicates.
        product_types.sort_by_key(|tc| tc.0.id());
        product_types.dedup();
        product_types
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        self.tasks.values().flatten().collect()
    }

    pub fn gen_singleton(&self, product: &TypeConstraint) -> Option<&Key> {
        self.singletons.get(product)
    }

    pub fn gen_intrinsic(
        &self,
        subject_type: &TypeId,
        product: &TypeConstraint,
    ) -> Option<&Intrinsic> {
        self.intrinsics.get(&(*subject_type, *product))
    }

    pub fn gen_tasks(&self, product: &TypeConstraint) -> Option<&Vec<Task>> {
        self.tasks.get(product)
    }

    ///
    /// A singleton installed for a product type is the only provider for that type.
    ///
    pub fn singleton_add(&mut self, value: Key, product: TypeConstraint) {
        if let Some(existing) = self.singletons.insert(product, value) {
            panic!("More than one singleton rule was installed for the product {product:?}: {existing:?} vs {value:?}");
        }
    }

    pub fn intrinsic_add(&mut self, kind: IntrinsicKind, subject_type: TypeId, product: TypeConstraint) {
        self.intrinsics.entry((subject_type, product)).or_insert(Intrinsic {
            kind,
            subject_type,
            product,
        });
    }

    ///
    /// The following methods define the Task registration lifecycle.
    ///
    pub fn task_begin(&mut self, func: Function, product: TypeConstraint, cacheable: bool) {
        assert!(
            self.preparing.is_none(),
            "Must `task_end()` the previous task creation before beginning a new one!"
        );

        self.preparing = Some(Task {
            cacheable,
            product,
            clause: Vec::new(),
            func,
        });
    }

    pub fn add_select(&mut self, product: TypeConstraint, variant_key: Option<String>) {
        self.clause(Selector::Select(Select {
            product,
            variant_key,
        }));
    }

    pub fn add_select_dependencies(
        &mut self,
        product: TypeConstraint,
        dep_product: TypeConstraint,
        field: String,
        field_types: Vec<TypeId>,
    ) {
        self.clause(Selector::SelectDependencies(SelectDependencies {
            product,
            dep_product,
            field,
            field_types,
        }));
    }

    pub fn add_select_transitive(
        &mut self,
        product: TypeConstraint,
        dep_product: TypeConstraint,
        field: String,
        field_types: Vec<TypeId>,
    ) {
        self.clause(Selector::SelectTransitive(SelectTransitive {
            product,
            dep_product,
            field,
            field_types,
        }));
    }

    pub fn add_select_projection(
        &mut self,
        product: TypeConstraint,
        projected_subject: TypeId,
        field: String,
        input_product: TypeConstraint,
    ) {
        self.clause(Selector::SelectProjection(SelectProjection {
            product,
            projected_subject,
            field,
            input_product,
        }));
    }

    fn clause(&mut self, selector: Selector) {
        self.preparing
            .as_mut()
            .expect("Must `task_begin()` a task creation before adding clauses!")
            .clause
            .push(selector);
    }

    pub fn task_end(&mut self) {
        // Move the task from `preparing` to the Tasks map.
        let mut task = self
            .preparing
            .take()
            .expect("Must `task_begin()` a task creation before ending it!");
        task.clause.shrink_to_fit();
        let tasks = self.tasks.entry(task.product).or_default();
        assert!(
            !tasks.contains(&task),
            "{task:?} was double-registered for {:?}",
            task.product,
        );
        tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::{IntrinsicKind, Tasks};
    use crate::core::{Function, Key, TypeConstraint, TypeId};

    fn constraint(id: u64) -> TypeConstraint {
        TypeConstraint(Key::new(id, TypeId(100 + id)))
    }

    fn function(id: u64) -> Function {
        Function(Key::new(id, TypeId(200)))
    }

    #[test]
    fn singleton_wins_over_intrinsic_and_task() {
        let mut tasks = Tasks::new();
        let product = constraint(1);
        let subject_type = TypeId(7);

        tasks.task_begin(function(10), product, true);
        tasks.add_select(constraint(2), None);
        tasks.task_end();
        tasks.intrinsic_add(IntrinsicKind::Snapshot, subject_type, product);
        tasks.singleton_add(Key::new(42, TypeId(3)), product);

        // All three providers are registered; lookup precedence is up to the caller, which
        // consults them in singleton, intrinsic, task order.
        assert!(tasks.gen_singleton(&product).is_some());
        assert!(tasks.gen_intrinsic(&subject_type, &product).is_some());
        assert_eq!(tasks.gen_tasks(&product).map(|t| t.len()), Some(1));
    }

    #[test]
    #[should_panic(expected = "double-registered")]
    fn double_registration_panics() {
        let mut tasks = Tasks::new();
        let product = constraint(1);
        for _ in 0..2 {
            tasks.task_begin(function(10), product, true);
            tasks.add_select(constraint(2), None);
            tasks.task_end();
        }
    }

    #[test]
    fn product_types_are_deduped() {
        let mut tasks = Tasks::new();
        let product = constraint(1);
        tasks.task_begin(function(10), product, true);
        tasks.task_end();
        tasks.task_begin(function(11), product, true);
        tasks.task_end();
        assert_eq!(tasks.all_product_types(), vec![product]);
    }
}
