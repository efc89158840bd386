//! heap.rs — the single allocation choke-point (§4.5) and the object arena
//! it owns.
//!
//! The spec describes heap objects as an intrusive linked list (`next`
//! pointers) threaded through a `Box`/raw-pointer graph — the natural shape
//! in C, and also how the teacher's `vitte-vm::Gc<T> = Rc<RefCell<T>>` models
//! it. Reference counting, though, cannot reclaim the cyclic structures the
//! spec calls out explicitly (`Closure -> Upvalue -> closed Value ->
//! Closure`), so this crate replaces both with an **arena**: a `Vec<Slot>`
//! addressed by the small `Copy` handle [`ObjRef`], plus a free list for
//! reuse after a sweep. The arena *is* the VM's object list; walking
//! `heap.objects` in [`crate::gc`] is the sweep phase's "walk `vm.objects`".
//!
//! `bytes_allocated`/`next_gc_threshold` bookkeeping lives here because every
//! allocation must pass through [`Heap::alloc`] — mirroring the spec's single
//! `pyro_realloc`-style choke point.

use crate::object::HeapObject;

/// A `Copy` handle into the heap arena. Two `ObjRef`s compare equal iff they
/// address the same slot (the spec's "pointer equality" for interned
/// strings and cached method lookups falls out of this for free).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> u32 {
        self.0
    }
}

enum Slot {
    Occupied(HeapObject),
    Free { next_free: Option<u32> },
}

/// Raised when [`Heap::alloc`] cannot satisfy a request. Per §4.5/§7, every
/// constructor that calls into the heap must check for this and turn it
/// into a runtime panic; the heap itself never panics.
#[derive(Debug, thiserror::Error)]
#[error("out of memory")]
pub struct HeapError;

/// The VM's object arena and allocation accountant.
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    /// Bytes currently attributed to live objects, per the spec's
    /// `bytes_allocated` counter. Each [`HeapObject`] reports its own
    /// logical size via [`crate::object::ObjPayload::heap_size`].
    pub bytes_allocated: usize,
    /// GC fires when `bytes_allocated` crosses this threshold.
    pub next_gc_threshold: usize,
    /// Growth factor applied to `next_gc_threshold` after a collection.
    pub gc_growth_factor: usize,
    /// `vm.gc_disallows` in the spec: a nesting counter that, while
    /// positive, makes the collector a no-op (used while constructing an
    /// object whose fields aren't all rooted yet).
    pub gc_disallows: u32,
    /// Set once an allocation has failed; disables further GC re-entry per
    /// §4.6 ("the panic flag disables re-entry into the collector").
    pub allocation_failed: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            bytes_allocated: 0,
            next_gc_threshold: 1024 * 1024,
            gc_growth_factor: 2,
            gc_disallows: 0,
            allocation_failed: false,
        }
    }

    /// True when `bytes_allocated` has crossed `next_gc_threshold` and the
    /// collector is allowed to run (§4.5 step 2).
    pub fn should_collect(&self) -> bool {
        self.gc_disallows == 0 && !self.allocation_failed && self.bytes_allocated > self.next_gc_threshold
    }

    /// The single allocation choke point (§4.5). Reuses a freed slot when
    /// available; otherwise grows the arena. Returns [`HeapError`] only when
    /// the arena itself cannot grow (in practice: never, on a hosted target
    /// with virtual memory) — callers must still treat it as fallible
    /// because the spec requires every constructor to check.
    pub fn alloc(&mut self, object: HeapObject) -> Result<ObjRef, HeapError> {
        self.bytes_allocated += object.payload.heap_size();

        if let Some(free) = self.free_head {
            let Slot::Free { next_free } = self.slots[free as usize] else {
                unreachable!("free list pointed at an occupied slot");
            };
            self.free_head = next_free;
            self.slots[free as usize] = Slot::Occupied(object);
            return Ok(ObjRef(free));
        }

        let idx = self.slots.len() as u32;
        self.slots.push(Slot::Occupied(object));
        Ok(ObjRef(idx))
    }

    pub fn get(&self, r: ObjRef) -> &HeapObject {
        match &self.slots[r.0 as usize] {
            Slot::Occupied(obj) => obj,
            Slot::Free { .. } => panic!("dangling ObjRef #{}", r.0),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        match &mut self.slots[r.0 as usize] {
            Slot::Occupied(obj) => obj,
            Slot::Free { .. } => panic!("dangling ObjRef #{}", r.0),
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.get(r).marked
    }

    pub fn set_marked(&mut self, r: ObjRef, marked: bool) {
        self.get_mut(r).marked = marked;
    }

    /// Iterates over every live object reference, in arena order. This is
    /// the sweep phase's "walk `vm.objects`".
    pub fn iter_live(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied(_) => Some(ObjRef(i as u32)),
            Slot::Free { .. } => None,
        })
    }

    /// Frees every unmarked object, returning the freed objects (paired with
    /// their now-dangling `ObjRef`) so the caller ([`crate::gc::Gc::collect`])
    /// can run per-kind destructors and clear weak references before they're
    /// gone.
    pub fn sweep_unmarked(&mut self) -> Vec<(ObjRef, HeapObject)> {
        let mut freed = Vec::new();
        for i in 0..self.slots.len() {
            let should_free = matches!(&self.slots[i], Slot::Occupied(o) if !o.marked);
            if should_free {
                let old = std::mem::replace(&mut self.slots[i], Slot::Free { next_free: self.free_head });
                if let Slot::Occupied(obj) = old {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.payload.heap_size());
                    freed.push((ObjRef(i as u32), obj));
                }
                self.free_head = Some(i as u32);
            }
        }
        freed
    }

    /// Clears every live object's mark bit; used both before the mark phase
    /// and to roll back a partially-marked heap if the grey stack itself
    /// fails to grow mid-trace (§4.6).
    pub fn clear_marks(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Occupied(obj) = slot {
                obj.marked = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjPayload};

    #[test]
    fn alloc_reuses_freed_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapObject::new(ObjPayload::test_dummy())).unwrap();
        let b = heap.alloc(HeapObject::new(ObjPayload::test_dummy())).unwrap();
        assert_ne!(a, b);
        heap.set_marked(b, true); // keep b, drop a
        heap.sweep_unmarked();
        let c = heap.alloc(HeapObject::new(ObjPayload::test_dummy())).unwrap();
        assert_eq!(c.index(), a.index(), "freed slot should be recycled");
    }
}
