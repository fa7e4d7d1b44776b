// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::core::{Function, TypeConstraint, TypeId};

///
/// The registry of host types that the engine must be aware of, supplied at scheduler
/// construction.
///
pub struct Types {
    // Constraints the engine selects and filters with.
    pub has_products: TypeConstraint,
    pub path_globs: TypeConstraint,
    pub snapshot: TypeConstraint,
    pub files_content: TypeConstraint,
    pub directory_listing: TypeConstraint,
    pub read_link: TypeConstraint,
    pub dir: TypeConstraint,
    pub file: TypeConstraint,
    pub link: TypeConstraint,
    pub path: TypeConstraint,
    // Concrete types used to key intrinsic rules and to lift projected strings.
    pub path_globs_type: TypeId,
    pub snapshot_type: TypeId,
    pub dir_type: TypeId,
    pub link_type: TypeId,
    pub string_type: TypeId,
    // Constructors for the values the intrinsics produce.
    pub construct_snapshot: Function,
    pub construct_path_stat: Function,
    pub construct_dir: Function,
    pub construct_file: Function,
    pub construct_link: Function,
    pub construct_directory_listing: Function,
    pub construct_read_link: Function,
    pub construct_file_content: Function,
    pub construct_files_content: Function,
}
