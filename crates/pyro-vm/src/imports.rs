//! imports.rs — module resolution against `import_roots` (§4.9).
//!
//! A dotted path `a::b::c` is tried, in order, as:
//!   1. `<root>/a/b/c.pyro`
//!   2. `<root>/a/b/c/self.pyro`
//! against every configured import root, first match wins. The matched
//! source is compiled with a fresh [`pyro_compiler::Compiler`] sharing the
//! VM's heap/string pool, then run exactly once as a synthetic top-level
//! function whose globals — via the same `ModuleObj` a script's own
//! top-level scope writes to (§4.9) — become the module's members.
//!
//! Native (dynamic-library) modules, which the original resolves as a third
//! fallback, are out of scope for this port (SPEC_FULL.md §9): an embedding
//! host can still install one proactively by calling
//! [`crate::vm::Vm::register_native_module`] before running any script that
//! imports it, and the cache lookup below finds it without ever touching
//! the filesystem.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("module '{0}' not found in any import root")]
    NotFound(String),
    #[error("error reading '{path}': {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("error compiling module '{module}': {message}")]
    Compile { module: String, message: String },
}

/// Candidate source-file paths for a dotted module path, under one import
/// root, in resolution order.
pub fn candidate_paths(root: &std::path::Path, segments: &[String]) -> Vec<PathBuf> {
    let mut direct = root.to_path_buf();
    for s in segments {
        direct.push(s);
    }
    let mut as_file = direct.clone();
    as_file.set_extension("pyro");
    let self_file = direct.join("self.pyro");
    vec![as_file, self_file]
}

/// Finds and reads the first matching module source across every import
/// root, returning its text and the path it was read from.
pub fn resolve_source(roots: &[PathBuf], segments: &[String]) -> Result<(String, PathBuf), ImportError> {
    for root in roots {
        for candidate in candidate_paths(root, segments) {
            if candidate.is_file() {
                let text = std::fs::read_to_string(&candidate)
                    .map_err(|source| ImportError::Io { path: candidate.clone(), source })?;
                return Ok((text, candidate));
            }
        }
    }
    Err(ImportError::NotFound(segments.join("::")))
}
