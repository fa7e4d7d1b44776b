// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use crate::core::{TypeId, Value};
use crate::interning::Interns;

// The result of an `identify` call, including the hash of a Value and its TypeId.
pub struct Ident {
    pub hash: u64,
    pub type_id: TypeId,
}

///
/// The callbacks that the host of the engine must supply.
///
/// Values are opaque to the engine: everything that needs to look inside one (equality and
/// hashing for interning, field projection, constraint membership, rule function dispatch)
/// goes back through this boundary. Implementations must be threadsafe: the scheduler invokes
/// them both from its own thread and from worker threads.
///
pub trait Host: Send + Sync {
    ///
    /// Returns the hash of a Value (under the host's equality) along with its TypeId.
    ///
    fn identify(&self, val: &Value) -> Ident;

    fn equals(&self, val1: &Value, val2: &Value) -> bool;

    ///
    /// Tests whether the given type satisfies the given constraint value.
    ///
    fn satisfied_by(&self, constraint: &Value, type_id: &TypeId) -> bool;

    ///
    /// Builds a Value representing a list of the given Values. If merge is true, the given
    /// Values each represent a list, and the result is their concatenation, de-duped while
    /// preserving the position of first occurrence.
    ///
    fn store_list(&self, values: Vec<&Value>, merge: bool) -> Value;

    fn store_bytes(&self, bytes: &[u8]) -> Value;

    ///
    /// Projects the named field of the given Value, as an instance of the given type.
    ///
    fn project(&self, value: &Value, field: &str, type_id: &TypeId) -> Value;

    ///
    /// Projects the named list-valued field of the given Value.
    ///
    fn project_multi(&self, value: &Value, field: &str) -> Vec<Value>;

    fn create_exception(&self, msg: &str) -> Value;

    ///
    /// Invokes the given rule function with the given arguments. An Err value carries the
    /// exception raised by the function.
    ///
    fn invoke_runnable(&self, func: &Value, args: &[Value], cacheable: bool)
        -> Result<Value, Value>;

    fn val_to_str(&self, val: &Value) -> String;
}

///
/// A threadsafe handle to the Host, with a few conveniences layered on top.
///
#[derive(Clone)]
pub struct Externs {
    host: Arc<dyn Host>,
}

impl Externs {
    pub fn new(host: Arc<dyn Host>) -> Externs {
        Externs { host }
    }

    pub fn identify(&self, val: &Value) -> Ident {
        self.host.identify(val)
    }

    pub fn equals(&self, val1: &Value, val2: &Value) -> bool {
        self.host.equals(val1, val2)
    }

    pub fn satisfied_by(&self, constraint: &Value, type_id: &TypeId) -> bool {
        self.host.satisfied_by(constraint, type_id)
    }

    ///
    /// Tests constraint membership for an interned constraint.
    ///
    pub fn satisfied_by_type(
        &self,
        interns: &Interns,
        constraint: &crate::core::TypeConstraint,
        type_id: &TypeId,
    ) -> bool {
        self.host.satisfied_by(interns.get(&constraint.0), type_id)
    }

    pub fn store_list(&self, values: Vec<&Value>, merge: bool) -> Value {
        self.host.store_list(values, merge)
    }

    pub fn store_bytes(&self, bytes: &[u8]) -> Value {
        self.host.store_bytes(bytes)
    }

    pub fn project(&self, value: &Value, field: &str, type_id: &TypeId) -> Value {
        self.host.project(value, field, type_id)
    }

    pub fn project_multi(&self, value: &Value, field: &str) -> Vec<Value> {
        self.host.project_multi(value, field)
    }

    pub fn project_multi_strs(&self, item: &Value, field: &str) -> Vec<String> {
        self.host
            .project_multi(item, field)
            .iter()
            .map(|v| self.host.val_to_str(v))
            .collect()
    }

    pub fn create_exception(&self, msg: &str) -> Value {
        self.host.create_exception(msg)
    }

    pub fn invoke_runnable(
        &self,
        func: &Value,
        args: &[Value],
        cacheable: bool,
    ) -> Result<Value, Value> {
        self.host.invoke_runnable(func, args, cacheable)
    }

    pub fn val_to_str(&self, val: &Value) -> String {
        self.host.val_to_str(val)
    }
}
