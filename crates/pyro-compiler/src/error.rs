//! error.rs — syntax errors raised by the lexer and compiler.
//!
//! Per the core's error-handling design, a syntax error has no recovery:
//! the first one raised aborts compilation of the unit. There is
//! deliberately no diagnostics-accumulator / resynchronization machinery
//! here (unlike the teacher's MVP `Diagnostics` struct) because
//! single-pass bytecode emission has nothing sensible to do with a second
//! error once the first has already corrupted the in-progress chunk.

#[derive(Debug, Clone, thiserror::Error)]
#[error("{source_name}:{line}: {message}")]
pub struct CompileError {
    pub source_name: String,
    pub line: u32,
    pub message: String,
}

pub type CompileResult<T> = Result<T, CompileError>;
