// File: src/table.rs
//
// Open-addressed hash table with linear probing and tombstones. Backs
// globals, class method tables, instance field tables, and the string
// intern pool — every place spec.md calls for an interned-`Str`-keyed
// map.
//
// Keys are always interned string handles, so equality is plain `ObjRef`
// equality and never needs heap access. Callers supply the key's hash
// (cached on its `StrObj`, fetched via `Heap::hash_of`) rather than the
// table looking it up itself — `ClassObj::methods`/`InstanceObj::fields`
// live *inside* heap-allocated objects, so a method that took `&Heap`
// here couldn't be called while the VM holds the `&mut Object` borrow
// that `Heap::get_mut` hands back for that same table's owner.

use crate::gc::{Heap, ObjRef};
use crate::object::Object;
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(ObjRef, u64, Value),
}

/// A hash table keyed by interned string handles.
#[derive(Clone)]
pub struct Table {
    entries: Vec<Slot>,
    /// Live entries plus tombstones — both count against the load factor,
    /// matching the reference design so tombstone buildup still triggers
    /// a resize even while `len()` looks small.
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(..)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_slot(key, hash)?;
        match &self.entries[index] {
            Slot::Occupied(_, _, value) => Some(*value),
            _ => None,
        }
    }

    /// Inserts or overwrites `key`. Returns `true` if this created a new
    /// key (used by `SET_GLOBAL`'s "assignment to undefined global" check).
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        if self.count + 1 > (self.entries.len() as f64 * MAX_LOAD_FACTOR) as usize {
            self.grow();
        }
        let index = self.find_slot_for_insert(key, hash);
        let is_new_key = !matches!(self.entries[index], Slot::Occupied(..));
        if is_new_key && matches!(self.entries[index], Slot::Empty) {
            self.count += 1;
        }
        self.entries[index] = Slot::Occupied(key, hash, value);
        is_new_key
    }

    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        match self.find_slot(key, hash) {
            Some(index) => {
                self.entries[index] = Slot::Tombstone;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(key, _, value) => Some((*key, *value)),
            _ => None,
        })
    }

    /// Content-based lookup used only by the intern pool: scans for a
    /// slot whose key's contents match `chars`/`hash`, terminating only
    /// at a true empty slot (tombstones do not end the probe). Only ever
    /// called on `Heap`'s own intern-pool table, never on a table nested
    /// inside a heap object, so taking `&Heap` here is safe.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u64) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied(key, entry_hash, _) => {
                    if *entry_hash == hash {
                        if let Object::Str(s) = heap.get(*key) {
                            if s.value.as_ref() == chars {
                                return Some(*key);
                            }
                        }
                    }
                }
                Slot::Tombstone => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Removes entries whose key is no longer alive. Called during GC
    /// sweep, before dead string objects are actually freed.
    pub fn remove_unmarked_keys(&mut self, heap: &Heap) {
        for slot in &mut self.entries {
            if let Slot::Occupied(key, ..) = slot {
                if !heap.is_marked(*key) {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    fn find_slot(&self, key: ObjRef, hash: u64) -> Option<usize> {
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        let start = index;
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied(k, ..) if *k == key => return Some(index),
                _ => {}
            }
            index = (index + 1) % capacity;
            if index == start {
                return None;
            }
        }
    }

    /// Linear probe for insertion: returns the first slot matching `key`,
    /// or else the first tombstone/empty slot seen along the probe
    /// (tombstone preferred, so repeated insert/delete doesn't grow the
    /// probe chain unboundedly).
    fn find_slot_for_insert(&self, key: ObjRef, hash: u64) -> usize {
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        let mut first_tombstone = None;
        loop {
            match &self.entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, ..) if *k == key => return index,
                Slot::Occupied(..) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old_entries = std::mem::replace(&mut self.entries, vec![Slot::Empty; new_capacity]);
        self.count = 0;
        for slot in old_entries {
            if let Slot::Occupied(key, hash, value) = slot {
                let index = self.find_slot_for_insert(key, hash);
                self.entries[index] = Slot::Occupied(key, hash, value);
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;
    use crate::object::fnv1a_hash;

    #[test]
    fn set_get_delete_round_trip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("answer");
        let hash = fnv1a_hash(b"answer");
        table.set(key, hash, Value::Number(42.0));
        assert!(matches!(table.get(key, hash), Some(Value::Number(n)) if n == 42.0));
        assert!(table.delete(key, hash));
        assert!(table.get(key, hash).is_none());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let name = format!("key{i}");
            let key = heap.intern(&name);
            table.set(key, fnv1a_hash(name.as_bytes()), Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let name = format!("key{i}");
            let key = heap.intern(&name);
            let got = table.get(key, fnv1a_hash(name.as_bytes()));
            assert!(matches!(got, Some(Value::Number(n)) if n == i as f64));
        }
    }

    #[test]
    fn find_string_probes_through_tombstones() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let a = heap.intern("a");
        let b = heap.intern("b");
        let hash_a = fnv1a_hash(b"a");
        let hash_b = fnv1a_hash(b"b");
        table.set(a, hash_a, Value::Nil);
        table.set(b, hash_b, Value::Nil);
        table.delete(a, hash_a);
        assert_eq!(table.find_string(&heap, "b", hash_b), Some(b));
    }
}
