//! err.rs — methods on `Err` (§4.10). `try`'s own `Err` values are built
//! directly by `vm.rs`'s `TRY` handling; `$err(message, ...)` (the
//! user-facing constructor, `globals::err`) is a native global function, not
//! an opcode. This module covers the instance accessors
//! (`original_source/src/std/core/std_core_err.c`).

use pyro_core::native::NativeContext;
use pyro_core::object::ObjPayload;
use pyro_core::value::Value;

use crate::util::{arg, obj_ref};

pub fn message(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let r = obj_ref(receiver, "err")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Err(e) => Ok(e.message),
        _ => Err(format!("expected an err, found {receiver}")),
    }
}

pub fn details(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let r = obj_ref(receiver, "err")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Err(e) => Ok(Value::Obj(e.details)),
        _ => Err(format!("expected an err, found {receiver}")),
    }
}

/// `$get_index` proxies indexing (`err[key]`) onto the error's details map.
pub fn get_index(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    let details_val = details(ctx, receiver, &[])?;
    crate::map::get(ctx, details_val, &[key])
}

/// `$set_index` proxies assignment (`err[key] = v`) onto the details map.
pub fn set_index(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    let value = arg(args, 1)?;
    let details_val = details(ctx, receiver, &[])?;
    crate::map::set(ctx, details_val, &[key, value])
}
