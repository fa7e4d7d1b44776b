// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::core::{TypeConstraint, TypeId};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Select {
    pub product: TypeConstraint,
    pub variant_key: Option<String>,
}

impl Select {
    pub fn without_variant(product: TypeConstraint) -> Select {
        Select {
            product,
            variant_key: None,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectDependencies {
    pub product: TypeConstraint,
    pub dep_product: TypeConstraint,
    pub field: String,
    pub field_types: Vec<TypeId>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectTransitive {
    pub product: TypeConstraint,
    pub dep_product: TypeConstraint,
    pub field: String,
    pub field_types: Vec<TypeId>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectProjection {
    pub product: TypeConstraint,
    pub projected_subject: TypeId,
    pub field: String,
    pub input_product: TypeConstraint,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Selector {
    Select(Select),
    SelectDependencies(SelectDependencies),
    SelectTransitive(SelectTransitive),
    SelectProjection(SelectProjection),
}

impl Selector {
    ///
    /// The simplest selector: requests the given product for the current subject.
    ///
    pub fn select(product: TypeConstraint) -> Selector {
        Selector::Select(Select::without_variant(product))
    }

    ///
    /// The product type that this selector evaluates to.
    ///
    pub fn product(&self) -> &TypeConstraint {
        match self {
            Selector::Select(ref s) => &s.product,
            Selector::SelectDependencies(ref s) => &s.product,
            Selector::SelectTransitive(ref s) => &s.product,
            Selector::SelectProjection(ref s) => &s.product,
        }
    }
}
