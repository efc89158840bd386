//! util.rs — argument-checking helpers shared by every native method table.
//!
//! Every native fn returns `Result<Value, String>` (§6); an `Err` becomes a
//! Pyro-level panic at the call site (`Vm::call_native`). These helpers
//! centralise the "wrong argument type/count" message shape so the tables in
//! `vec.rs`/`str.rs`/etc. read as a list of behaviours, not a list of type
//! checks.

use pyro_core::heap::ObjRef;
use pyro_core::native::NativeContext;
use pyro_core::object::ObjPayload;
use pyro_core::value::Value;

pub fn arg(args: &[Value], i: usize) -> Result<Value, String> {
    args.get(i).copied().ok_or_else(|| format!("expected at least {} argument(s)", i + 1))
}

pub fn as_i64(v: Value) -> Result<i64, String> {
    match v {
        Value::I64(n) => Ok(n),
        Value::F64(f) => Ok(f as i64),
        other => Err(format!("expected an integer, found {other}")),
    }
}

pub fn as_str<'a>(ctx: &'a dyn NativeContext, v: Value) -> Result<&'a str, String> {
    let r = v.as_obj().ok_or_else(|| format!("expected a string, found {v}"))?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Str(s) => Ok(&s.bytes),
        _ => Err(format!("expected a string, found {v}")),
    }
}

pub fn obj_ref(v: Value, what: &str) -> Result<ObjRef, String> {
    v.as_obj().ok_or_else(|| format!("expected a {what}, found {v}"))
}

/// Resolves a (possibly negative, §4.3) index against a collection length.
pub fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}
