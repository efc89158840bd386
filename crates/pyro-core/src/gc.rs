//! gc.rs — mark-and-sweep over the grey worklist (§4.6).
//!
//! The collector itself holds no heap-shaped state beyond the reusable grey
//! stack; everything else it needs — the object arena, the root set — is
//! borrowed for the duration of [`Gc::collect`]. Roots come from the VM via
//! the [`Roots`] trait, which keeps this crate ignorant of frames, the
//! value stack, or the with-stack (`pyro-vm`'s concerns).

use std::collections::HashSet;

use crate::heap::{Heap, HeapError, ObjRef};
use crate::object::{IterSource, ObjPayload, UpvalueState};
use crate::strings::StringPool;
use crate::value::Value;

/// Implemented by whatever owns the value stack, call frames, and other
/// GC roots (`pyro-vm::Vm`). `trace_roots` must call `push` once for every
/// `ObjRef` directly reachable from outside the heap.
pub trait Roots {
    fn trace_roots(&self, push: &mut dyn FnMut(ObjRef));
}

/// Summary of one collection cycle, useful for `tracing`/CLI `--gc-stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectStats {
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

/// The collector. Reuses its grey-worklist buffer across cycles so steady
/// -state collection doesn't need to reallocate it every time.
pub struct Gc {
    grey: Vec<ObjRef>,
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Gc {
    pub fn new() -> Self {
        Self { grey: Vec::new() }
    }

    /// Runs one full mark-and-sweep cycle (§4.6 steps 1-4). A no-op caller
    /// check (`vm.gc_disallows > 0` / panic flag) belongs to `pyro-vm`,
    /// which should simply not call this while either is set (§3's
    /// invariant).
    ///
    /// Returns [`HeapError`] only if the grey stack itself cannot grow while
    /// tracing; per §4.6, marking is then aborted, every mark bit this cycle
    /// set is rolled back, and the caller must turn this into an
    /// out-of-memory panic (the panic flag it sets disables re-entry here).
    pub fn collect(&mut self, heap: &mut Heap, roots: &dyn Roots, strings: &mut StringPool) -> Result<CollectStats, HeapError> {
        heap.clear_marks();
        self.grey.clear();

        if let Err(e) = self.mark_and_trace(heap, roots) {
            heap.clear_marks();
            return Err(e);
        }

        let freed = heap.sweep_unmarked();
        let stats = CollectStats {
            objects_freed: freed.len(),
            bytes_freed: freed.iter().map(|(_, o)| o.payload.heap_size()).sum(),
        };

        let freed_refs: HashSet<ObjRef> = freed.iter().map(|(r, _)| *r).collect();
        for (_, mut obj) in freed {
            if let ObjPayload::Str(s) = &obj.payload {
                strings.forget(&s.bytes);
            }
            // The free-callback, not `Drop`, is the spec's hook (§4.6 step
            // 3) for `ResourcePointer` — run synchronously during sweep.
            if let ObjPayload::ResourcePointer(rp) = &mut obj.payload {
                if let Some(cb) = rp.free_callback.as_mut() {
                    cb();
                }
            }
        }

        clear_weak_refs(heap, &freed_refs);

        #[cfg(feature = "tracing")]
        tracing::debug!(freed = stats.objects_freed, bytes = stats.bytes_freed, "gc cycle complete");

        heap.next_gc_threshold = heap.bytes_allocated.saturating_mul(heap.gc_growth_factor).max(heap.next_gc_threshold);
        Ok(stats)
    }

    fn mark_and_trace(&mut self, heap: &mut Heap, roots: &dyn Roots) -> Result<(), HeapError> {
        let grey = &mut self.grey;
        roots.trace_roots(&mut |r| {
            if !heap.is_marked(r) {
                heap.set_marked(r, true);
                grey.push(r);
            }
        });

        while let Some(r) = self.grey.pop() {
            if self.grey.try_reserve(1).is_err() {
                return Err(HeapError);
            }
            let mut children = Vec::new();
            let obj = heap.get(r);
            if let Some(class) = obj.class {
                children.push(class);
            }
            trace_children(&obj.payload, &mut |c| children.push(c));
            for c in children {
                if !heap.is_marked(c) {
                    heap.set_marked(c, true);
                    self.grey.push(c);
                }
            }
        }
        Ok(())
    }
}

/// Walks every `ObjRef`/`Value::Obj` a payload directly embeds, per the kind
/// table in §3. Method-table keys are themselves interned `Str` refs and
/// must be traced alongside their values, or the name could be collected
/// out from under a live method map.
fn trace_children(payload: &ObjPayload, push: &mut dyn FnMut(ObjRef)) {
    let mut push_value = |v: &Value| {
        if let Value::Obj(r) = v {
            push(*r);
        }
    };

    match payload {
        ObjPayload::Str(_) | ObjPayload::Buf(_) | ObjPayload::NativeFn(_) | ObjPayload::File(_) | ObjPayload::ResourcePointer(_) => {}

        ObjPayload::Map(m) => {
            for entry in &m.entry_array {
                if matches!(entry.key, Value::Tombstone) {
                    continue;
                }
                push_value(&entry.key);
                if !m.is_weakref {
                    push_value(&entry.value);
                }
            }
        }
        ObjPayload::Vec(v) => v.values.iter().for_each(|val| push_value(val)),
        ObjPayload::Tup(t) => t.values.iter().for_each(|val| push_value(val)),
        ObjPayload::Fn(f) => {
            f.constants.iter().for_each(|val| push_value(val));
            push(f.source_id);
        }
        ObjPayload::Closure(c) => {
            push(c.function);
            push(c.module);
            c.upvalues.iter().for_each(|u| push(*u));
            if let Some(defaults) = &c.default_values {
                defaults.iter().for_each(|val| push_value(val));
            }
        }
        ObjPayload::Upvalue(u) => {
            if let UpvalueState::Closed { value } = &u.state {
                push_value(value);
            }
        }
        ObjPayload::Class(c) => {
            if let Some(sup) = c.superclass {
                push(sup);
            }
            for (name, v) in &c.all_instance_methods {
                push(*name);
                push_value(v);
            }
            for (name, v) in &c.pub_instance_methods {
                push(*name);
                push_value(v);
            }
            for name in c.all_field_indexes.keys() {
                push(*name);
            }
            for name in c.pub_field_indexes.keys() {
                push(*name);
            }
            c.default_field_values.iter().for_each(|val| push_value(val));
            for (name, v) in &c.static_members {
                push(*name);
                push_value(v);
            }
            if let Some(init) = &c.init_method {
                push_value(init);
            }
            if let Some((name, v)) = &c.last_lookup {
                push(*name);
                push_value(v);
            }
        }
        ObjPayload::Instance(i) => i.fields.iter().for_each(|val| push_value(val)),
        ObjPayload::BoundMethod(b) => {
            push_value(&b.receiver);
            push_value(&b.method);
        }
        ObjPayload::Module(m) => {
            m.members.iter().for_each(|val| push_value(val));
            for name in m.all_member_indexes.keys() {
                push(*name);
            }
            for name in m.pub_member_indexes.keys() {
                push(*name);
            }
            for (name, sub) in &m.submodules {
                push(*name);
                push(*sub);
            }
        }
        ObjPayload::Iter(it) => {
            push(it.source);
            match &it.kind {
                IterSource::Enumerate { inner, .. } => push(*inner),
                IterSource::FuncMap { inner, callback } | IterSource::FuncFilter { inner, callback } => {
                    push(*inner);
                    push_value(callback);
                }
                _ => {}
            }
        }
        ObjPayload::Queue(q) => {
            if let Some(h) = q.head {
                push(h);
            }
            if let Some(t) = q.tail {
                push(t);
            }
        }
        ObjPayload::QueueNode(n) => {
            push_value(&n.value);
            if let Some(next) = n.next {
                push(next);
            }
        }
        ObjPayload::Err(e) => {
            push_value(&e.message);
            push(e.details);
        }
        #[cfg(test)]
        ObjPayload::TestDummy => {}
    }
}

/// Post-sweep pass: any live `MapAsWeakref` entry whose value pointed at an
/// object the sweep just freed is tombstoned in place, per §3's
/// `MapAsWeakref` semantics (SPEC_FULL.md §3).
fn clear_weak_refs(heap: &mut Heap, freed: &HashSet<ObjRef>) {
    if freed.is_empty() {
        return;
    }
    let live: Vec<ObjRef> = heap.iter_live().collect();
    for r in live {
        let is_weak_map = matches!(&heap.get(r).payload, ObjPayload::Map(m) if m.is_weakref);
        if !is_weak_map {
            continue;
        }
        let obj = heap.get_mut(r);
        if let ObjPayload::Map(m) = &mut obj.payload {
            let mut cleared = false;
            for entry in &mut m.entry_array {
                if let Value::Obj(vr) = entry.value {
                    if freed.contains(&vr) {
                        entry.value = Value::Tombstone;
                        cleared = true;
                    }
                }
            }
            if cleared {
                m.version += 1;
            }
        }
    }
}
