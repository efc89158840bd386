//! pyro-vm — the stack-based bytecode interpreter (§4.8).
//!
//! [`vm::Vm`] owns the value stack, call frames, open upvalues, and
//! `with`-stack described in §4.8's **Layout**, and its dispatch loop
//! (`vm::Vm::step`) handles every [`pyro_core::bytecode::Op`] the compiler
//! emits. It implements [`pyro_core::gc::Roots`] so [`pyro_core::gc::Gc`] can
//! trace it without knowing about frames or the value stack, and
//! [`pyro_core::native::NativeContext`] so native functions registered by
//! `pyro-stdlib` can read the heap, panic, and call back into Pyro code.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod error;
pub mod frame;
pub mod imports;
pub mod operators;
pub mod vm;

pub use error::{VmError, VmResult};
pub use frame::CallFrame;
pub use vm::Vm;
