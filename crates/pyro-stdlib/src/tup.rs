//! tup.rs — methods on the fixed-size, immutable `Tup` (§4.10).

use pyro_core::native::NativeContext;
use pyro_core::object::ObjPayload;
use pyro_core::value::Value;

use crate::util::{arg, as_i64, obj_ref, resolve_index};

fn values<'a>(ctx: &'a dyn NativeContext, receiver: Value) -> Result<&'a [Value], String> {
    let r = obj_ref(receiver, "tup")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Tup(t) => Ok(&t.values),
        _ => Err(format!("expected a tup, found {receiver}")),
    }
}

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::I64(values(ctx, receiver)?.len() as i64))
}

pub fn get(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let i = as_i64(arg(args, 0)?)?;
    let vs = values(ctx, receiver)?;
    match resolve_index(i, vs.len()) {
        Some(idx) => Ok(vs[idx]),
        None => Err(format!("index {i} out of bounds")),
    }
}

pub fn contains(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = arg(args, 0)?;
    Ok(Value::Bool(values(ctx, receiver)?.iter().any(|v| *v == needle)))
}

pub fn to_vec(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let vs = values(ctx, receiver)?.to_vec();
    Ok(ctx.alloc_vec(vs, false))
}
