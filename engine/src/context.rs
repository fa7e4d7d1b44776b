// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use graph::Graph;
use hashing::Fingerprint;

use crate::core::{Function, Key, TypeConstraint, TypeId, Value, Variants};
use crate::externs::Externs;
use crate::fs::{
    Dir, File, FileContent, Link, PathGlobs, PathStat, PosixFS, Snapshot, Snapshots, Stat,
};
use crate::interning::Interns;
use crate::nodes::{self, Complete, NodeKey};
use crate::pool::CpuPool;
use crate::rule_graph::{GraphMaker, RuleGraph};
use crate::tasks::{IntrinsicKind, Tasks};
use crate::types::Types;

///
/// The core state of a scheduler instance: the product graph, the rule index and its validated
/// rule graph, the interning store, and the filesystem handles.
///
pub struct Core {
    pub graph: Graph<NodeKey>,
    pub tasks: Tasks,
    pub rule_graph: RuleGraph,
    pub types: Types,
    pub externs: Externs,
    pub interns: Mutex<Interns>,
    pub root_subject_types: Vec<TypeId>,
    pub vfs: PosixFS,
    pub snapshots: Snapshots,
    pool: CpuPool,
}

impl Core {
    pub fn new(
        mut tasks: Tasks,
        types: Types,
        externs: Externs,
        interns: Interns,
        root_subject_types: Vec<TypeId>,
        build_root: PathBuf,
        work_dir: PathBuf,
        ignore_patterns: Vec<String>,
    ) -> Result<Core, String> {
        // Every scheduler carries the engine's own rules for the filesystem products.
        tasks.intrinsic_add(IntrinsicKind::Snapshot, types.path_globs_type, types.snapshot);
        tasks.intrinsic_add(
            IntrinsicKind::FileContents,
            types.snapshot_type,
            types.files_content,
        );
        tasks.intrinsic_add(
            IntrinsicKind::DirectoryListing,
            types.dir_type,
            types.directory_listing,
        );
        tasks.intrinsic_add(IntrinsicKind::ReadLink, types.link_type, types.read_link);

        // Construct the static rule graph, and fail fast if the ruleset cannot satisfy its
        // declared roots.
        let rule_graph =
            GraphMaker::new(&tasks, &externs, &interns, root_subject_types.clone()).full_graph();
        rule_graph.validate()?;

        let vfs = PosixFS::new(build_root, ignore_patterns)?;
        let snapshots = Snapshots::new(work_dir.join("snapshots"))?;

        Ok(Core {
            graph: Graph::new(),
            tasks,
            rule_graph,
            types,
            externs,
            interns: Mutex::new(interns),
            root_subject_types,
            vfs,
            snapshots,
            pool: CpuPool::new("engine-"),
        })
    }

    pub fn pool(&self) -> &CpuPool {
        &self.pool
    }

    ///
    /// Drains the worker pool so that a controlling process can safely fork. The pool is
    /// lazily re-created by the next dispatched task.
    ///
    pub fn pre_fork(&self) {
        self.pool.reset();
    }
}

///
/// A handle to the Core shared by all Nodes and runnables, providing the helpers that resolve
/// Keys, call through the host boundary, and build the values the intrinsics produce.
///
#[derive(Clone)]
pub struct Context {
    pub core: Arc<Core>,
}

impl Context {
    pub fn new(core: Arc<Core>) -> Context {
        Context { core }
    }

    pub fn key_for(&self, val: &Value) -> Key {
        self.core.interns.lock().insert(&self.core.externs, val.clone())
    }

    pub fn val_for(&self, key: &Key) -> Value {
        self.core.interns.lock().get(key).clone()
    }

    ///
    /// Calls back to the host for a satisfied_by check against an interned constraint.
    ///
    pub fn satisfied_by(&self, constraint: &TypeConstraint, type_id: &TypeId) -> bool {
        let interns = self.core.interns.lock();
        self.core.externs.satisfied_by_type(&interns, constraint, type_id)
    }

    ///
    /// Calls back to the host to project a field.
    ///
    pub fn project(&self, item: &Value, field: &str, type_id: &TypeId) -> Value {
        self.core.externs.project(item, field, type_id)
    }

    ///
    /// Calls back to the host to project a field representing a collection.
    ///
    pub fn project_multi(&self, item: &Value, field: &str) -> Vec<Value> {
        self.core.externs.project_multi(item, field)
    }

    pub fn project_str(&self, item: &Value, field: &str) -> String {
        let value = self.project(item, field, &self.core.types.string_type);
        self.core.externs.val_to_str(&value)
    }

    pub fn store_list(&self, items: Vec<&Value>, merge: bool) -> Value {
        self.core.externs.store_list(items, merge)
    }

    pub fn store_bytes(&self, item: &[u8]) -> Value {
        self.core.externs.store_bytes(item)
    }

    pub fn create_exception(&self, msg: &str) -> Value {
        self.core.externs.create_exception(msg)
    }

    pub fn val_to_str(&self, item: &Value) -> String {
        self.core.externs.val_to_str(item)
    }

    pub fn invoke_runnable(
        &self,
        func: &Function,
        args: &[Value],
        cacheable: bool,
    ) -> Result<Value, Complete> {
        let func_val = self.val_for(&func.0);
        self.core
            .externs
            .invoke_runnable(&func_val, args, cacheable)
            .map_err(|exc| {
                let msg = self.core.externs.val_to_str(&exc);
                Complete::Throw(exc, format!("Exception: {msg}"))
            })
    }

    ///
    /// NB: Panics on failure. Only recommended for use with built-in functions, such as those
    /// configured in types::Types.
    ///
    pub fn invoke_unsafe(&self, func: &Function, args: &[Value]) -> Value {
        self.invoke_runnable(func, args, false)
            .unwrap_or_else(|e| panic!("Core function {func:?} failed: {e:?}"))
    }

    ///
    /// Creates a Throw state with the given exception message.
    ///
    pub fn throw(&self, msg: &str) -> Complete {
        Complete::Throw(self.create_exception(msg), format!("Exception: {msg}"))
    }

    ///
    /// The fixed value bound for the given product type, if any. A singleton is the only
    /// provider for its product.
    ///
    pub fn gen_singleton(&self, product: &TypeConstraint) -> Option<Value> {
        self.core
            .tasks
            .gen_singleton(product)
            .map(|key| self.val_for(key))
    }

    ///
    /// Create Nodes for each Task that might be able to compute the given product for the
    /// given subject and variants. An intrinsic beats user rules for its (subject type,
    /// product) pair.
    ///
    pub fn gen_nodes(
        &self,
        subject: &Key,
        product: &TypeConstraint,
        variants: &Variants,
    ) -> Vec<NodeKey> {
        if let Some(intrinsic) = self.core.tasks.gen_intrinsic(subject.type_id(), product) {
            return vec![NodeKey::from_intrinsic(intrinsic, *subject, variants.clone())];
        }
        self.core
            .tasks
            .gen_tasks(product)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|task| {
                        NodeKey::Task(nodes::Task {
                            subject: *subject,
                            variants: variants.clone(),
                            selector: task.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_products(&self, item: &Value) -> bool {
        self.satisfied_by(&self.core.types.has_products, item.type_id())
    }

    ///
    /// Returns the `name` field of the given item, for variant matching.
    ///
    pub fn field_name(&self, item: &Value) -> String {
        self.project_str(item, &self.core.tasks.field_name)
    }

    pub fn field_products(&self, item: &Value) -> Vec<Value> {
        self.project_multi(item, &self.core.tasks.field_products)
    }

    pub fn type_path_globs(&self) -> TypeConstraint {
        self.core.types.path_globs
    }

    pub fn lift_path_globs(&self, item: &Value) -> Result<PathGlobs, String> {
        let include = self
            .core
            .externs
            .project_multi_strs(item, &self.core.tasks.field_include);
        let exclude = self
            .core
            .externs
            .project_multi_strs(item, &self.core.tasks.field_exclude);
        PathGlobs::create(&include, &exclude).map_err(|e| {
            format!("Failed to parse PathGlobs for include({include:?}), exclude({exclude:?}): {e}")
        })
    }

    pub fn lift_path(&self, item: &Value) -> PathBuf {
        PathBuf::from(self.project_str(item, &self.core.tasks.field_path))
    }

    pub fn lift_dir(&self, item: &Value) -> Result<Dir, String> {
        let path = self.lift_path(item);
        if path.is_absolute() {
            Err(format!("Directory paths must be relative to the build root: {path:?}"))
        } else {
            Ok(Dir(path))
        }
    }

    pub fn lift_link(&self, item: &Value) -> Result<Link, String> {
        let path = self.lift_path(item);
        if path.is_absolute() {
            Err(format!("Link paths must be relative to the build root: {path:?}"))
        } else {
            Ok(Link(path))
        }
    }

    pub fn lift_fingerprint(&self, item: &Value) -> Result<Fingerprint, String> {
        Fingerprint::from_hex_string(&self.project_str(item, &self.core.tasks.field_fingerprint))
            .map_err(|e| format!("Failed to lift fingerprint: {e}"))
    }

    pub fn store_path(&self, item: &Path) -> Value {
        self.store_bytes(item.as_os_str().as_bytes())
    }

    fn store_dir(&self, item: &Dir) -> Value {
        let args = [self.store_path(item.0.as_path())];
        self.invoke_unsafe(&self.core.types.construct_dir, &args)
    }

    fn store_file(&self, item: &File) -> Value {
        let args = [self.store_path(item.0.as_path())];
        self.invoke_unsafe(&self.core.types.construct_file, &args)
    }

    fn store_link(&self, item: &Link) -> Value {
        let args = [self.store_path(item.0.as_path())];
        self.invoke_unsafe(&self.core.types.construct_link, &args)
    }

    fn store_stat(&self, item: &Stat) -> Value {
        match item {
            Stat::Dir(d) => self.store_dir(d),
            Stat::File(f) => self.store_file(f),
            Stat::Link(l) => self.store_link(l),
        }
    }

    pub fn store_path_stat(&self, item: &PathStat) -> Value {
        let args = match item {
            PathStat::Dir { path, stat } => [self.store_path(path), self.store_dir(stat)],
            PathStat::File { path, stat } => [self.store_path(path), self.store_file(stat)],
        };
        self.invoke_unsafe(&self.core.types.construct_path_stat, &args)
    }

    pub fn store_snapshot(&self, item: &Snapshot) -> Value {
        let path_stats: Vec<_> = item
            .path_stats
            .iter()
            .map(|ps| self.store_path_stat(ps))
            .collect();
        let args = [
            self.store_bytes(item.fingerprint.to_hex().as_bytes()),
            self.store_list(path_stats.iter().collect(), false),
        ];
        self.invoke_unsafe(&self.core.types.construct_snapshot, &args)
    }

    pub fn store_directory_listing(&self, stats: &[Stat]) -> Value {
        let stat_values: Vec<_> = stats.iter().map(|stat| self.store_stat(stat)).collect();
        let args = [self.store_list(stat_values.iter().collect(), false)];
        self.invoke_unsafe(&self.core.types.construct_directory_listing, &args)
    }

    pub fn store_read_link(&self, path: &Path) -> Value {
        let args = [self.store_path(path)];
        self.invoke_unsafe(&self.core.types.construct_read_link, &args)
    }

    pub fn store_files_content(&self, contents: &[FileContent]) -> Value {
        let content_values: Vec<_> = contents
            .iter()
            .map(|file_content| {
                let args = [
                    self.store_path(&file_content.path),
                    self.store_bytes(&file_content.content),
                ];
                self.invoke_unsafe(&self.core.types.construct_file_content, &args)
            })
            .collect();
        let args = [self.store_list(content_values.iter().collect(), false)];
        self.invoke_unsafe(&self.core.types.construct_files_content, &args)
    }
}
