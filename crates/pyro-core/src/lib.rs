//! pyro-core — value/object model, bytecode format, heap allocator and GC for Pyro.
//!
//! This crate has no knowledge of lexing, parsing, or opcode dispatch. It owns
//! the things every other crate in the workspace shares:
//!
//! - [`value`] : the tagged [`value::Value`] union.
//! - [`object`] : the heap object kinds (`Str`, `Map`, `Vec`, `Fn`, `Class`, …).
//! - [`heap`]  : the single allocation choke-point ([`heap::Heap`]) and the
//!   object arena addressed by [`heap::ObjRef`].
//! - [`strings`] : the process-wide string-interning pool.
//! - [`gc`] : the mark-and-sweep collector that runs over the heap's roots.
//! - [`bytecode`] : `Chunk`/`Op`/`ConstPool`, the format the compiler emits
//!   into and the VM executes.
//!
//! ## Features
//! - `serde` *(default)*: `Chunk` (de)serializes via `bincode`, mirroring the
//!   on-disk format sketched by `CHUNK_MAGIC`/`CHUNK_VERSION`.
//! - `tracing`: emits `tracing` spans/events from GC cycles and allocation
//!   failures.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod bytecode;
pub mod disasm;
pub mod gc;
pub mod heap;
pub mod native;
pub mod object;
pub mod strings;
pub mod value;

pub use bytecode::{Chunk, ConstPool, ConstValue, LineTable, Op};
pub use gc::{Gc, Roots};
pub use heap::{Heap, HeapError, ObjRef};
pub use object::{HeapObject, ObjKind, ObjPayload};
pub use strings::StringPool;
pub use value::Value;

/// Crate version, exposed for tooling that wants to print a banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors that can surface from the core value/object layer itself (as
/// opposed to compiler/VM-level panics, which live in their own crates).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The allocator could not satisfy a request; `vm.memory_allocation_failed`
    /// in the spec's terms.
    #[error("out of memory")]
    OutOfMemory,

    /// A chunk failed to (de)serialize.
    #[cfg(feature = "serde")]
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    /// Generic invariant violation surfaced as a string.
    #[error("{0}")]
    Msg(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Re-exports convenient for downstream crates (`pyro_core::prelude::*`).
pub mod prelude {
    pub use crate::bytecode::{Chunk, ConstPool, ConstValue, LineTable, Op};
    pub use crate::gc::{Gc, Roots};
    pub use crate::heap::{Heap, HeapError, ObjRef};
    pub use crate::object::{HeapObject, ObjKind, ObjPayload};
    pub use crate::strings::StringPool;
    pub use crate::value::Value;
    pub use crate::{Error, Result};
}
