// File: src/gc.rs
//
// The object heap and its tricolor mark-sweep collector. Objects are
// stored in a generational-index arena rather than behind intrusive raw
// pointers — the alternative spec.md's design notes explicitly license —
// so the object graph (closures capturing frames, classes referencing
// methods, instances referencing classes) stays expressible in safe
// Rust with the `Heap` as the graph's single owning authority.

use crate::object::{fnv1a_hash, Object};
use crate::table::Table;
use crate::value::Value;

const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

/// A handle to a heap-resident object. Stable across GC sweeps that
/// don't collect it; reused (with an incremented generation) only after
/// the slot it named has been freed, so a stale handle into a recycled
/// slot is detectable rather than silently aliasing a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

enum Slot {
    Occupied { generation: u32, marked: bool, object: Object },
    Free { next_free: Option<u32>, generation: u32 },
}

/// Owns every Lox object ever allocated during one VM's lifetime, the
/// string intern pool, and the GC's allocation bookkeeping.
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    strings: Table,
    nursery_depth: u32,
    nursery: Vec<ObjRef>,
    pub stress_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free_head: None,
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            strings: Table::new(),
            nursery_depth: 0,
            nursery: Vec::new(),
            stress_gc: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Whether the heap has grown enough (or `stress_gc` is set) to
    /// warrant a collection before the next allocation.
    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    pub fn grow_threshold(&mut self) {
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    /// Pins every object allocated from now until the matching
    /// `close_nursery` as a GC root. Nestable; only the outermost
    /// open/close pair actually opens/clears the pinned set. This is the
    /// one multi-allocation-site discipline this implementation applies
    /// uniformly (see SPEC_FULL.md) — both for VM op handlers that
    /// allocate more than one object and for the compiler's in-progress
    /// function chain.
    pub fn open_nursery(&mut self) {
        self.nursery_depth += 1;
    }

    pub fn close_nursery(&mut self) {
        self.nursery_depth = self.nursery_depth.saturating_sub(1);
        if self.nursery_depth == 0 {
            self.nursery.clear();
        }
    }

    pub fn nursery_roots(&self) -> &[ObjRef] {
        &self.nursery
    }

    fn approx_size(object: &Object) -> usize {
        match object {
            Object::Str(s) => s.value.len() + 32,
            Object::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16 + 64,
            Object::NativeFunction(_) => 48,
            Object::Closure(c) => c.upvalues.len() * 8 + 32,
            Object::Upvalue(_) => 32,
            Object::Class(_) => 64,
            Object::Instance(_) => 48,
            Object::BoundMethod(_) => 24,
            Object::List(l) => l.items.len() * 16 + 32,
            Object::StringBuf(s) => s.contents.len() + 32,
        }
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.bytes_allocated += Self::approx_size(&object);
        let handle = match self.free_head {
            Some(index) => {
                let generation = match &self.slots[index as usize] {
                    Slot::Free { next_free, generation } => {
                        self.free_head = *next_free;
                        *generation
                    }
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                self.slots[index as usize] = Slot::Occupied { generation, marked: false, object };
                ObjRef { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, marked: false, object });
                ObjRef { index, generation: 0 }
            }
        };
        if self.nursery_depth > 0 {
            self.nursery.push(handle);
        }
        handle
    }

    pub fn get(&self, handle: ObjRef) -> &Object {
        match &self.slots[handle.index as usize] {
            Slot::Occupied { generation, object, .. } if *generation == handle.generation => object,
            _ => panic!("dangling ObjRef dereferenced"),
        }
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Object {
        match &mut self.slots[handle.index as usize] {
            Slot::Occupied { generation, object, .. } if *generation == handle.generation => object,
            _ => panic!("dangling ObjRef dereferenced"),
        }
    }

    pub fn is_marked(&self, handle: ObjRef) -> bool {
        match &self.slots[handle.index as usize] {
            Slot::Occupied { generation, marked, .. } if *generation == handle.generation => *marked,
            _ => false,
        }
    }

    /// Marks `handle` alive if it wasn't already. Returns `true` the
    /// first time an object is marked in a cycle, so callers can push it
    /// onto the gray worklist exactly once.
    pub fn mark(&mut self, handle: ObjRef) -> bool {
        match &mut self.slots[handle.index as usize] {
            Slot::Occupied { generation, marked, .. } if *generation == handle.generation => {
                if *marked {
                    false
                } else {
                    *marked = true;
                    true
                }
            }
            _ => false,
        }
    }

    pub fn mark_value(&mut self, value: Value) -> Option<ObjRef> {
        if let Value::Object(handle) = value {
            if self.mark(handle) {
                return Some(handle);
            }
        }
        None
    }

    /// The cached FNV-1a hash of an interned string handle. Callers use
    /// this to operate on a `Table` nested inside a heap object (class
    /// methods, instance fields) without needing `&Heap` in the table
    /// API itself — see the comment at the top of table.rs.
    pub fn hash_of(&self, handle: ObjRef) -> u64 {
        match self.get(handle) {
            Object::Str(s) => s.hash,
            other => panic!("expected string object, found {}", other.kind_name()),
        }
    }

    /// Sweeps the intern pool of entries whose key died, then frees
    /// every unmarked object, clearing the mark bit on survivors.
    pub fn sweep(&mut self) {
        let mut strings = std::mem::take(&mut self.strings);
        strings.remove_unmarked_keys(self);
        self.strings = strings;

        for index in 0..self.slots.len() {
            let index_u32 = index as u32;
            let action = match &self.slots[index] {
                Slot::Occupied { marked: false, object, generation } => {
                    Some((Self::approx_size(object), generation.wrapping_add(1)))
                }
                Slot::Occupied { marked: true, .. } => None,
                Slot::Free { .. } => continue,
            };
            match action {
                Some((freed_size, next_generation)) => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_size);
                    self.slots[index] =
                        Slot::Free { next_free: self.free_head, generation: next_generation };
                    self.free_head = Some(index_u32);
                }
                None => {
                    if let Slot::Occupied { marked, .. } = &mut self.slots[index] {
                        *marked = false;
                    }
                }
            }
        }
    }

    /// Interns `chars`: returns the existing `Str` object if one with
    /// identical content is already live, otherwise allocates a new one
    /// and registers it in the intern pool.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = fnv1a_hash(chars.as_bytes());
        if let Some(existing) = self.strings.find_string(self, chars, hash) {
            return existing;
        }
        let handle = self.alloc(Object::Str(crate::object::StrObj {
            value: chars.into(),
            hash,
        }));
        let mut strings = std::mem::take(&mut self.strings);
        strings.set(handle, hash, Value::Nil);
        self.strings = strings;
        handle
    }

    pub fn as_str(&self, handle: ObjRef) -> &str {
        match self.get(handle) {
            Object::Str(s) => &s.value,
            other => panic!("expected string object, found {}", other.kind_name()),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_pointer_equality_for_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        let c = heap.intern("different");
        assert_ne!(a, c);
    }

    #[test]
    fn unmarked_objects_are_freed_and_marked_ones_survive() {
        let mut heap = Heap::new();
        let survivor = heap.intern("keep");
        let doomed = heap.intern("drop");
        heap.mark(survivor);
        heap.sweep();
        assert!(heap.is_marked(survivor) == false); // cleared after sweep
        // Re-deref the survivor: must still be valid.
        assert_eq!(heap.as_str(survivor), "keep");
        let _ = doomed;
    }

    #[test]
    #[should_panic(expected = "dangling ObjRef")]
    fn freed_slot_is_not_silently_reused_under_a_stale_handle() {
        let mut heap = Heap::new();
        let doomed = heap.intern("temp");
        heap.sweep(); // nothing marked: doomed is freed
        let _new_handle = heap.intern("temp2"); // may or may not reuse the slot
        heap.as_str(doomed); // stale handle must not resolve silently
    }

    #[test]
    fn nursery_keeps_fresh_allocations_reachable_as_roots() {
        let mut heap = Heap::new();
        heap.open_nursery();
        let a = heap.intern("a");
        let b = heap.intern("b");
        heap.close_nursery();
        for root in [a, b] {
            heap.mark(root);
        }
        heap.sweep();
        assert_eq!(heap.as_str(a), "a");
        assert_eq!(heap.as_str(b), "b");
    }
}
