// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::context::Core;
use crate::core::{Function, Key, TypeConstraint, TypeId, Value};
use crate::externs::{Externs, Host, Ident};
use crate::interning::Interns;
use crate::scheduler::Scheduler;
use crate::selectors::Selector;
use crate::tasks::Tasks;
use crate::types::Types;

///
/// The dynamic object model used by engine tests: a tiny stand-in for a real host runtime.
///
#[derive(Clone, Debug)]
pub enum Obj {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Struct {
        type_name: String,
        fields: Vec<(String, Value)>,
    },
    Constraint {
        name: String,
        satisfied: Vec<TypeId>,
    },
    Func {
        name: String,
    },
    Exception {
        msg: String,
    },
}

type RuleFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

pub struct TestHost {
    // Type names to ids, plus the id generator.
    types: Mutex<(HashMap<String, TypeId>, u64)>,
    funcs: Mutex<HashMap<String, RuleFn>>,
    invocations: Mutex<Vec<String>>,
}

impl TestHost {
    pub fn new() -> Arc<TestHost> {
        Arc::new(TestHost {
            types: Mutex::new((HashMap::new(), 0)),
            funcs: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn type_id(&self, name: &str) -> TypeId {
        let mut table = self.types.lock();
        if let Some(&id) = table.0.get(name) {
            return id;
        }
        table.1 += 1;
        let id = TypeId(table.1);
        table.0.insert(name.to_string(), id);
        id
    }

    fn obj(&self, obj: Obj) -> Value {
        let type_name = match &obj {
            Obj::Int(_) => "int",
            Obj::Str(_) => "str",
            Obj::Bytes(_) => "bytes",
            Obj::List(_) => "list",
            Obj::Struct { type_name, .. } => type_name.as_str(),
            Obj::Constraint { .. } => "constraint",
            Obj::Func { .. } => "function",
            Obj::Exception { .. } => "Exception",
        };
        let type_id = self.type_id(type_name);
        Value::new(Arc::new(obj), type_id)
    }

    pub fn int_val(&self, i: i64) -> Value {
        self.obj(Obj::Int(i))
    }

    pub fn str_val(&self, s: &str) -> Value {
        self.obj(Obj::Str(s.to_string()))
    }

    pub fn list_val(&self, items: Vec<Value>) -> Value {
        self.obj(Obj::List(items))
    }

    pub fn struct_val(&self, type_name: &str, fields: Vec<(&str, Value)>) -> Value {
        self.obj(Obj::Struct {
            type_name: type_name.to_string(),
            fields: fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        })
    }

    pub fn constraint_val(&self, name: &str, satisfied: &[TypeId]) -> Value {
        self.obj(Obj::Constraint {
            name: name.to_string(),
            satisfied: satisfied.to_vec(),
        })
    }

    pub fn func_val(
        &self,
        name: &str,
        f: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Value {
        self.funcs.lock().insert(name.to_string(), Arc::new(f));
        self.obj(Obj::Func {
            name: name.to_string(),
        })
    }

    pub fn invocation_count(&self, name: &str) -> usize {
        self.invocations.lock().iter().filter(|n| *n == name).count()
    }

    fn as_obj(val: &Value) -> &Obj {
        val.as_any()
            .downcast_ref::<Obj>()
            .expect("Value was not created by this TestHost.")
    }

    fn hash_obj(obj: &Obj, state: &mut DefaultHasher) {
        match obj {
            Obj::Int(i) => {
                0u8.hash(state);
                i.hash(state);
            }
            Obj::Str(s) => {
                1u8.hash(state);
                s.hash(state);
            }
            Obj::Bytes(b) => {
                2u8.hash(state);
                b.hash(state);
            }
            Obj::List(items) => {
                3u8.hash(state);
                for item in items {
                    TestHost::hash_obj(TestHost::as_obj(item), state);
                }
            }
            Obj::Struct { type_name, fields } => {
                4u8.hash(state);
                type_name.hash(state);
                for (name, value) in fields {
                    name.hash(state);
                    TestHost::hash_obj(TestHost::as_obj(value), state);
                }
            }
            Obj::Constraint { name, satisfied } => {
                5u8.hash(state);
                name.hash(state);
                satisfied.hash(state);
            }
            Obj::Func { name } => {
                6u8.hash(state);
                name.hash(state);
            }
            Obj::Exception { msg } => {
                7u8.hash(state);
                msg.hash(state);
            }
        }
    }

    fn eq_obj(a: &Obj, b: &Obj) -> bool {
        match (a, b) {
            (Obj::Int(x), Obj::Int(y)) => x == y,
            (Obj::Str(x), Obj::Str(y)) => x == y,
            (Obj::Bytes(x), Obj::Bytes(y)) => x == y,
            (Obj::List(x), Obj::List(y)) => {
                x.len() == y.len()
                    && x.iter().zip(y.iter()).all(|(xv, yv)| {
                        TestHost::eq_obj(TestHost::as_obj(xv), TestHost::as_obj(yv))
                    })
            }
            (
                Obj::Struct {
                    type_name: xt,
                    fields: xf,
                },
                Obj::Struct {
                    type_name: yt,
                    fields: yf,
                },
            ) => {
                xt == yt
                    && xf.len() == yf.len()
                    && xf.iter().zip(yf.iter()).all(|((xn, xv), (yn, yv))| {
                        xn == yn && TestHost::eq_obj(TestHost::as_obj(xv), TestHost::as_obj(yv))
                    })
            }
            (
                Obj::Constraint {
                    name: xn,
                    satisfied: xs,
                },
                Obj::Constraint {
                    name: yn,
                    satisfied: ys,
                },
            ) => xn == yn && xs == ys,
            (Obj::Func { name: x }, Obj::Func { name: y }) => x == y,
            (Obj::Exception { msg: x }, Obj::Exception { msg: y }) => x == y,
            _ => false,
        }
    }

    fn render(val: &Value) -> String {
        match TestHost::as_obj(val) {
            Obj::Int(i) => format!("{i}"),
            Obj::Str(s) => s.clone(),
            Obj::Bytes(b) => String::from_utf8_lossy(b).to_string(),
            Obj::List(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(TestHost::render)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Obj::Struct { type_name, fields } => format!(
                "{type_name}({})",
                fields
                    .iter()
                    .map(|(name, value)| format!("{name}={}", TestHost::render(value)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Obj::Constraint { name, .. } => format!("=({name})"),
            Obj::Func { name } => name.clone(),
            Obj::Exception { msg } => format!("Exception({msg})"),
        }
    }
}

impl Host for TestHost {
    fn identify(&self, val: &Value) -> Ident {
        let mut hasher = DefaultHasher::new();
        TestHost::hash_obj(TestHost::as_obj(val), &mut hasher);
        Ident {
            hash: hasher.finish(),
            type_id: *val.type_id(),
        }
    }

    fn equals(&self, val1: &Value, val2: &Value) -> bool {
        TestHost::eq_obj(TestHost::as_obj(val1), TestHost::as_obj(val2))
    }

    fn satisfied_by(&self, constraint: &Value, type_id: &TypeId) -> bool {
        match TestHost::as_obj(constraint) {
            Obj::Constraint { satisfied, .. } => satisfied.contains(type_id),
            other => panic!("Not a constraint value: {other:?}"),
        }
    }

    fn store_list(&self, values: Vec<&Value>, merge: bool) -> Value {
        let items: Vec<Value> = if merge {
            let mut out: Vec<Value> = Vec::new();
            for outer in values {
                let inner = match TestHost::as_obj(outer) {
                    Obj::List(items) => items.clone(),
                    other => panic!("Cannot merge a non-list value: {other:?}"),
                };
                for item in inner {
                    if !out.iter().any(|existing| self.equals(existing, &item)) {
                        out.push(item);
                    }
                }
            }
            out
        } else {
            values.into_iter().cloned().collect()
        };
        self.obj(Obj::List(items))
    }

    fn store_bytes(&self, bytes: &[u8]) -> Value {
        self.obj(Obj::Bytes(bytes.to_vec()))
    }

    fn project(&self, value: &Value, field: &str, _type_id: &TypeId) -> Value {
        match TestHost::as_obj(value) {
            Obj::Struct { fields, .. } => fields
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| panic!("No such field {field:?} on {value:?}")),
            other => panic!("Cannot project a field of a non-struct value: {other:?}"),
        }
    }

    fn project_multi(&self, value: &Value, field: &str) -> Vec<Value> {
        let projected = self.project(value, field, &crate::core::ANY_TYPE);
        match TestHost::as_obj(&projected) {
            Obj::List(items) => items.clone(),
            other => panic!("Field {field:?} was not list-valued: {other:?}"),
        }
    }

    fn create_exception(&self, msg: &str) -> Value {
        self.obj(Obj::Exception {
            msg: msg.to_string(),
        })
    }

    fn invoke_runnable(
        &self,
        func: &Value,
        args: &[Value],
        _cacheable: bool,
    ) -> Result<Value, Value> {
        let name = match TestHost::as_obj(func) {
            Obj::Func { name } => name.clone(),
            other => panic!("Not a function value: {other:?}"),
        };
        self.invocations.lock().push(name.clone());
        let f = self
            .funcs
            .lock()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| panic!("No such function: {name:?}"));
        f(args).map_err(|msg| self.create_exception(&msg))
    }

    fn val_to_str(&self, val: &Value) -> String {
        TestHost::render(val)
    }
}

///
/// Wires a TestHost into everything a Scheduler needs. Tests intern their constraints and
/// functions and register rules through this builder, then call `scheduler()`.
///
pub struct TestEnv {
    pub host: Arc<TestHost>,
    pub externs: Externs,
    pub interns: Interns,
    pub tasks: Tasks,
    pub root_subject_types: Vec<TypeId>,
    build_root: TempDir,
    work_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let _ = env_logger::try_init();
        let host = TestHost::new();
        let externs = Externs::new(host.clone());
        TestEnv {
            host,
            externs,
            interns: Interns::new(),
            tasks: Tasks::new(),
            root_subject_types: Vec::new(),
            build_root: TempDir::new().expect("Failed to create a build root."),
            work_dir: TempDir::new().expect("Failed to create a work dir."),
        }
    }

    pub fn build_root_path(&self) -> &Path {
        self.build_root.path()
    }

    pub fn key_for(&mut self, val: &Value) -> Key {
        self.interns.insert(&self.externs, val.clone())
    }

    pub fn constraint(&mut self, name: &str, satisfied: &[TypeId]) -> TypeConstraint {
        let val = self.host.constraint_val(name, satisfied);
        TypeConstraint(self.key_for(&val))
    }

    pub fn function(
        &mut self,
        name: &str,
        f: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Function {
        let val = self.host.func_val(name, f);
        Function(self.key_for(&val))
    }

    pub fn root_type(&mut self, type_id: TypeId) {
        self.root_subject_types.push(type_id);
    }

    ///
    /// Registers a task rule for the given product with the given clause.
    ///
    pub fn task(
        &mut self,
        func: Function,
        product: TypeConstraint,
        clause: Vec<Selector>,
        cacheable: bool,
    ) {
        self.tasks.task_begin(func, product, cacheable);
        for selector in clause {
            match selector {
                Selector::Select(s) => self.tasks.add_select(s.product, s.variant_key),
                Selector::SelectDependencies(s) => self.tasks.add_select_dependencies(
                    s.product,
                    s.dep_product,
                    s.field,
                    s.field_types,
                ),
                Selector::SelectTransitive(s) => self.tasks.add_select_transitive(
                    s.product,
                    s.dep_product,
                    s.field,
                    s.field_types,
                ),
                Selector::SelectProjection(s) => self.tasks.add_select_projection(
                    s.product,
                    s.projected_subject,
                    s.field,
                    s.input_product,
                ),
            }
        }
        self.tasks.task_end();
    }

    ///
    /// The standard type registry: filesystem constructors produce plain structs whose field
    /// names line up with the projections the engine performs.
    ///
    fn default_types(&mut self) -> Types {
        let host = self.host.clone();

        let path_globs_type = host.type_id("PathGlobs");
        let snapshot_type = host.type_id("Snapshot");
        let dir_type = host.type_id("Dir");
        let file_type = host.type_id("File");
        let link_type = host.type_id("Link");
        let path_type = host.type_id("Path");
        let string_type = host.type_id("str");

        let construct_dir = {
            let host = host.clone();
            self.function("Dir", move |args| {
                Ok(host.struct_val("Dir", vec![("path", args[0].clone())]))
            })
        };
        let construct_file = {
            let host = host.clone();
            self.function("File", move |args| {
                Ok(host.struct_val("File", vec![("path", args[0].clone())]))
            })
        };
        let construct_link = {
            let host = host.clone();
            self.function("Link", move |args| {
                Ok(host.struct_val("Link", vec![("path", args[0].clone())]))
            })
        };
        let construct_path_stat = {
            let host = host.clone();
            self.function("PathStat", move |args| {
                Ok(host.struct_val(
                    "PathStat",
                    vec![("path", args[0].clone()), ("stat", args[1].clone())],
                ))
            })
        };
        let construct_snapshot = {
            let host = host.clone();
            self.function("Snapshot", move |args| {
                Ok(host.struct_val(
                    "Snapshot",
                    vec![
                        ("fingerprint", args[0].clone()),
                        ("path_stats", args[1].clone()),
                    ],
                ))
            })
        };
        let construct_directory_listing = {
            let host = host.clone();
            self.function("DirectoryListing", move |args| {
                Ok(host.struct_val("DirectoryListing", vec![("dependencies", args[0].clone())]))
            })
        };
        let construct_read_link = {
            let host = host.clone();
            self.function("ReadLink", move |args| {
                Ok(host.struct_val("ReadLink", vec![("path", args[0].clone())]))
            })
        };
        let construct_file_content = {
            let host = host.clone();
            self.function("FileContent", move |args| {
                Ok(host.struct_val(
                    "FileContent",
                    vec![("path", args[0].clone()), ("content", args[1].clone())],
                ))
            })
        };
        let construct_files_content = {
            let host = host.clone();
            self.function("FilesContent", move |args| {
                Ok(host.struct_val("FilesContent", vec![("dependencies", args[0].clone())]))
            })
        };

        let files_content_type = host.type_id("FilesContent");
        let directory_listing_type = host.type_id("DirectoryListing");
        let read_link_type = host.type_id("ReadLink");

        Types {
            has_products: self.constraint("HasProducts", &[]),
            path_globs: self.constraint("=PathGlobs", &[path_globs_type]),
            snapshot: self.constraint("=Snapshot", &[snapshot_type]),
            files_content: self.constraint("=FilesContent", &[files_content_type]),
            directory_listing: self.constraint("=DirectoryListing", &[directory_listing_type]),
            read_link: self.constraint("=ReadLink", &[read_link_type]),
            dir: self.constraint("=Dir", &[dir_type]),
            file: self.constraint("=File", &[file_type]),
            link: self.constraint("=Link", &[link_type]),
            path: self.constraint("=Path", &[path_type]),
            path_globs_type,
            snapshot_type,
            dir_type,
            link_type,
            string_type,
            construct_snapshot,
            construct_path_stat,
            construct_dir,
            construct_file,
            construct_link,
            construct_directory_listing,
            construct_read_link,
            construct_file_content,
            construct_files_content,
        }
    }

    pub fn try_scheduler(mut self) -> Result<TestScheduler, String> {
        let types = self.default_types();
        let TestEnv {
            host,
            externs,
            interns,
            tasks,
            root_subject_types,
            build_root,
            work_dir,
        } = self;
        let core = Core::new(
            tasks,
            types,
            externs,
            interns,
            root_subject_types,
            build_root.path().to_owned(),
            work_dir.path().to_owned(),
            vec![],
        )?;
        Ok(TestScheduler {
            scheduler: Scheduler::new(core),
            host,
            _build_root: build_root,
            _work_dir: work_dir,
        })
    }

    pub fn scheduler(self) -> TestScheduler {
        self.try_scheduler()
            .unwrap_or_else(|e| panic!("Ruleset was not valid: {e}"))
    }
}

///
/// A Scheduler plus the temp dirs backing it, so that the build root outlives the run.
///
pub struct TestScheduler {
    pub scheduler: Scheduler,
    pub host: Arc<TestHost>,
    _build_root: TempDir,
    _work_dir: TempDir,
}

impl TestScheduler {
    pub fn build_root(&self) -> &Path {
        self._build_root.path()
    }
}
