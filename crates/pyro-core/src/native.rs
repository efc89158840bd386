//! native.rs — the capability surface a native function sees.
//!
//! `pyro-core` defines object shapes but not the VM (that's `pyro-vm`, which
//! depends on `pyro-core`, not the other way around). A native method still
//! needs to read the heap, raise a panic, or call back into Pyro code
//! (`$iter`-style callbacks per §6/§9), so this trait is the seam: `pyro-vm`
//! implements it for its `Vm`, and [`crate::object::NativeFnPtr`] is generic
//! over `dyn NativeContext` instead of a concrete VM type.

use crate::heap::{Heap, ObjRef};
use crate::object::{ObjKind, ObjPayload};
use crate::value::Value;

/// What a native function (`$fn`/native method) can do to its caller.
pub trait NativeContext {
    fn heap(&self) -> &Heap;
    fn heap_mut(&mut self) -> &mut Heap;

    /// Interns a string, returning its `ObjRef`.
    fn intern(&mut self, s: &str) -> ObjRef;

    /// Raises a runtime panic with the given message. Mirrors `pyro_panic`:
    /// sets the panic flag, does not unwind via Rust's own panic mechanism.
    fn panic(&mut self, message: String);

    /// Calls a Pyro-level callable (closure, bound method, or another
    /// native fn) with the given arguments and returns its result, per the
    /// bounded inner-dispatch protocol in §9 ("coroutine-style reentry").
    fn call_value(&mut self, callee: Value, args: &[Value]) -> Value;

    /// Allocates a `Vec`/`VecAsStack` with the correct builtin class
    /// attached. Native methods can't reach `Vm`'s private `builtin_classes`
    /// table directly, so this mirrors `Vm::alloc_vec` through the trait
    /// seam. Returns `Value::Null` on OOM (a panic has already been raised).
    fn alloc_vec(&mut self, values: Vec<Value>, is_stack: bool) -> Value;

    /// Allocates a `Tup`, analogous to [`NativeContext::alloc_vec`].
    fn alloc_tup(&mut self, values: Vec<Value>) -> Value;

    /// Allocates a `Map`/`MapAsSet`, analogous to [`NativeContext::alloc_vec`].
    fn alloc_map(&mut self, entries: Vec<(Value, Value)>, is_set: bool) -> Value;

    /// Escape hatch for the object kinds the three convenience allocators
    /// above don't cover (`Iter`, `Queue`, `File`, `Err`, ...): allocates
    /// `payload` wearing `class`'s method table.
    fn alloc_with_class(&mut self, payload: ObjPayload, class: ObjRef) -> Value;

    /// Like [`NativeContext::alloc_with_class`] but with no class attached
    /// (`QueueNode`, and anything else with no user-visible method table).
    fn alloc_plain(&mut self, payload: ObjPayload) -> Value;

    /// Drives a built-in `Iter` object (§4.10) one step, returning either
    /// the next value or an exhausted-iterator `Err`, exactly as
    /// `GET_NEXT_FROM_ITERATOR` would. Used by `Iter`'s own draining
    /// methods (`to_vec`, `count`, `sum`, `join`, `reduce`, ...).
    fn iterator_next(&mut self, iter_ref: ObjRef) -> Value;

    /// The empty-shell class created at VM startup for `kind` (§4.10),
    /// mirroring `Vm::builtin_class` through the trait seam so native
    /// methods can attach the right class to objects they construct
    /// themselves (`$range`'s `Iter`, a method returning a fresh `Vec`, ...).
    fn builtin_class(&self, kind: ObjKind) -> ObjRef;

    /// Looks up a public instance method named `name` on `receiver`'s class
    /// (walking the superclass chain), mirroring the VM's own
    /// `CALL_PUB_METHOD` dispatch. Used by native constructors that accept
    /// "anything iterable" (`$vec(arg)`, `$set(arg)`) to test for a
    /// `$iter()` method before calling it via
    /// [`NativeContext::call_value`]. Returns `Value::Null` if `receiver`
    /// has no class or the method isn't found.
    fn get_method(&self, receiver: Value, name: &str) -> Value;
}
