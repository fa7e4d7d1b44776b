// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::sync::Arc;
use std::{fmt, hash};

use fnv::FnvHasher;

pub type FNV = hash::BuildHasherDefault<FnvHasher>;

///
/// Variants represent a string->string map. For hashability purposes, they're stored
/// as sorted string tuples.
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Variants(pub Vec<(String, String)>);

impl Variants {
    pub fn new(mut entries: Vec<(String, String)>) -> Variants {
        entries.sort();
        Variants(entries)
    }

    pub fn find(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub type Id = u64;

// The type of a host object (which itself has a type, but which is not represented
// by a Key, because that would result in an infinitely recursive structure).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct TypeId(pub Id);

// The 0th type id is reserved as an anonymous id.
pub const ANY_TYPE: TypeId = TypeId(0);

// A type constraint, which a TypeId may or may-not satisfy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TypeConstraint(pub Key);

// An identifier for a hosted rule function.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Function(pub Key);

///
/// Wraps a type id for use as a key in HashMaps and sets.
///
#[derive(Clone, Copy, Debug)]
pub struct Key {
    id: Id,
    type_id: TypeId,
}

impl Eq for Key {}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.id == other.id
    }
}

impl hash::Hash for Key {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Key {
    pub fn new(id: Id, type_id: TypeId) -> Key {
        Key { id, type_id }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn type_id(&self) -> &TypeId {
        &self.type_id
    }
}

///
/// An opaque handle to a host object, tagged with the host's type for it.
///
/// The engine never introspects a Value's contents: it compares TypeIds, and otherwise hands
/// Values back to the host (to project fields, test constraints, or invoke rule functions).
/// Values are cheap to clone; host objects are shared rather than copied.
///
#[derive(Clone)]
pub struct Value {
    handle: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
}

impl Value {
    pub fn new(handle: Arc<dyn Any + Send + Sync>, type_id: TypeId) -> Value {
        Value { handle, type_id }
    }

    pub fn type_id(&self) -> &TypeId {
        &self.type_id
    }

    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        &*self.handle
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value(type={:?})", self.type_id.0)
    }
}

// NB: enum members are listed in ascending priority order based on how likely they are
// to be useful to users.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Noop {
    NoTask,
    NoVariant,
    Cycle,
    NoSource(&'static str),
}

impl fmt::Debug for Noop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Noop::Cycle => "Dep graph contained a cycle.",
            Noop::NoTask => "No task was available to compute the value.",
            Noop::NoVariant => "A matching variant key was not configured in variants.",
            Noop::NoSource(msg) => msg,
        })
    }
}
