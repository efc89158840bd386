//! frame.rs — one entry in the VM's call stack (§4.8 "Layout").
//!
//! Mirrors the original `CallFrame` (`inc/vm.h`): `closure` + `ip` + `fp`,
//! plus `with_stack_count_on_entry` so `RETURN` knows how many pending
//! `with`-blocks it must unwind if control falls off the end of a function
//! whose body never got to the compiler-emitted `END_WITH`s (§4.8
//! "With-block protocol").

use pyro_core::heap::ObjRef;

/// `ip` is a byte offset into the active closure's `FnObj.code`; `fp` is the
/// value-stack index of slot zero for this call (the callee/receiver slot
/// §4.8's call convention always reserves).
pub struct CallFrame {
    pub closure: ObjRef,
    pub ip: usize,
    pub fp: usize,
    pub with_stack_count_on_entry: usize,
}

impl CallFrame {
    pub fn new(closure: ObjRef, fp: usize, with_stack_count_on_entry: usize) -> Self {
        Self { closure, ip: 0, fp, with_stack_count_on_entry }
    }
}
