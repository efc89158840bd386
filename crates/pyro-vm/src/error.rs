//! error.rs — errors the VM can raise before a Pyro-level panic is even
//! possible (§7 "Runtime panic" covers the rest, as an in-band `Err` value
//! or a printed message — it never reaches Rust's `Result` machinery).
//!
//! Everything a running Pyro program can observe (type errors, division by
//! zero, assertion failures) goes through [`vm::Vm::panic`], not this type.
//! `VmError` is reserved for conditions the embedding host needs to see even
//! when no Pyro frame is active to catch them: a malformed entry point, a
//! corrupt bytecode stream, or the host-level exit code at the end of a run.

use pyro_core::bytecode::DecodeError;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The bytecode stream ran out mid-instruction. Only reachable from
    /// hand-assembled or corrupt bytecode; the compiler never emits this.
    #[error("corrupt bytecode: {0}")]
    Decode(#[from] DecodeError),

    /// `run`/`call_value` was asked to call something that isn't callable
    /// and the call site had no Pyro frame active to catch the panic (e.g.
    /// the CLI's entry point closure itself).
    #[error("{0}")]
    Uncaught(String),

    /// The heap allocator could not satisfy a request and the failure
    /// occurred with no active frame to turn it into a Pyro-level panic.
    #[error("out of memory")]
    OutOfMemory,
}
