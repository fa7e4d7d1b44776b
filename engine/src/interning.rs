// Copyright 2018 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use crate::core::{Id, Key, Value, FNV};
use crate::externs::Externs;

///
/// The interning store: canonicalizes host values to Keys under host-provided equality.
///
/// Values are bucketed by the host's hash for them; collisions within a bucket are resolved
/// with the host's `equals`. Id assignment is monotonic, and Ids are never recycled within the
/// lifetime of the store. The store holds a strong reference to every interned Value, so a Key
/// can always be resolved for as long as its scheduler is alive.
///
/// The store is scoped to a scheduler instance (its Core wraps it in a Mutex): a new scheduler
/// starts with an empty store.
///
#[derive(Default)]
pub struct Interns {
    forward: HashMap<u64, Vec<(Value, Key)>, FNV>,
    reverse: HashMap<Id, Value, FNV>,
    id_generator: Id,
}

impl Interns {
    pub fn new() -> Interns {
        Default::default()
    }

    pub fn insert(&mut self, externs: &Externs, v: Value) -> Key {
        let ident = externs.identify(&v);
        let bucket = self.forward.entry(ident.hash).or_default();
        for (existing, key) in bucket.iter() {
            if externs.equals(existing, &v) {
                return *key;
            }
        }

        // Value is new/unique.
        self.id_generator += 1;
        let id = self.id_generator;
        let key = Key::new(id, ident.type_id);
        bucket.push((v.clone(), key));
        self.reverse.insert(id, v);
        key
    }

    pub fn get(&self, k: &Key) -> &Value {
        self.reverse
            .get(&k.id())
            .unwrap_or_else(|| panic!("Previously memoized object disappeared for {k:?}"))
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Interns;
    use crate::externs::Externs;
    use crate::testutil::TestHost;

    #[test]
    fn equal_values_share_a_key() {
        let host = TestHost::new();
        let externs = Externs::new(host.clone());
        let mut interns = Interns::new();

        let k1 = interns.insert(&externs, host.str_val("meep"));
        let k2 = interns.insert(&externs, host.str_val("meep"));
        assert_eq!(k1, k2);
        assert_eq!(interns.len(), 1);
    }

    #[test]
    fn unequal_values_get_distinct_monotonic_ids() {
        let host = TestHost::new();
        let externs = Externs::new(host.clone());
        let mut interns = Interns::new();

        let k1 = interns.insert(&externs, host.int_val(1));
        let k2 = interns.insert(&externs, host.int_val(2));
        assert_ne!(k1, k2);
        assert!(k1.id() < k2.id());
    }

    #[test]
    fn keys_carry_the_host_type() {
        let host = TestHost::new();
        let externs = Externs::new(host.clone());
        let mut interns = Interns::new();

        let int_key = interns.insert(&externs, host.int_val(1));
        let str_key = interns.insert(&externs, host.str_val("1"));
        assert_ne!(int_key.type_id(), str_key.type_id());
    }

    #[test]
    fn reverse_lookup_returns_the_original() {
        let host = TestHost::new();
        let externs = Externs::new(Arc::clone(&host) as Arc<dyn crate::externs::Host>);
        let mut interns = Interns::new();

        let val = host.str_val("meep");
        let key = interns.insert(&externs, val.clone());
        assert!(externs.equals(interns.get(&key), &val));
    }
}
