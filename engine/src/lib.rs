// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

mod context;
mod core;
mod externs;
mod fs;
mod interning;
mod nodes;
mod pool;
mod rule_graph;
mod scheduler;
mod selectors;
mod tasks;
#[cfg(test)]
mod testutil;
mod types;

pub use crate::context::{Context, Core};
pub use crate::core::{Function, Id, Key, Noop, TypeConstraint, TypeId, Value, Variants};
pub use crate::externs::{Externs, Host, Ident};
pub use crate::fs::{
    glob_to_regex, Dir, File, FileContent, Link, PathGlob, PathGlobs, PathStat, PosixFS, Snapshot,
    Snapshots, Stat,
};
pub use crate::interning::Interns;
pub use crate::nodes::{Complete, NodeKey, Runnable, State};
pub use crate::rule_graph::RuleGraph;
pub use crate::scheduler::{ExecutionError, ExecutionStat, RootResult, Scheduler};
pub use crate::selectors::{
    Select, SelectDependencies, SelectProjection, SelectTransitive, Selector,
};
pub use crate::tasks::{Intrinsic, IntrinsicKind, Task, Tasks};
pub use crate::types::Types;
