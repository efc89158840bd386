//! buf.rs — methods on `Buf`, the growable byte array (§4.10).

use pyro_core::native::NativeContext;
use pyro_core::object::{BufObj, ObjPayload};
use pyro_core::value::Value;

use crate::util::{arg, as_i64, obj_ref, resolve_index};

fn with_buf<T>(ctx: &dyn NativeContext, receiver: Value, f: impl FnOnce(&BufObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "buf")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Buf(b) => Ok(f(b)),
        _ => Err(format!("expected a buf, found {receiver}")),
    }
}

fn with_buf_mut<T>(ctx: &mut dyn NativeContext, receiver: Value, f: impl FnOnce(&mut BufObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "buf")?;
    match &mut ctx.heap_mut().get_mut(r).payload {
        ObjPayload::Buf(b) => Ok(f(b)),
        _ => Err(format!("expected a buf, found {receiver}")),
    }
}

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_buf(ctx, receiver, |b| Value::I64(b.bytes.len() as i64))
}

pub fn is_empty(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_buf(ctx, receiver, |b| Value::Bool(b.bytes.is_empty()))
}

pub fn get_byte(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let i = as_i64(arg(args, 0)?)?;
    with_buf(ctx, receiver, |b| (b.bytes.clone(), resolve_index(i, b.bytes.len())))
        .and_then(|(bytes, idx)| idx.map(|idx| Value::I64(bytes[idx] as i64)).ok_or_else(|| format!("index {i} out of bounds")))
}

pub fn write_byte(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let byte = as_i64(arg(args, 0)?)? as u8;
    with_buf_mut(ctx, receiver, |b| b.bytes.push(byte))?;
    Ok(Value::Null)
}

pub fn to_str(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let bytes = with_buf(ctx, receiver, |b| b.bytes.clone())?;
    let s = String::from_utf8(bytes).map_err(|_| "buf contents are not valid UTF-8".to_string())?;
    Ok(Value::Obj(ctx.intern(&s)))
}

pub fn clear(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_buf_mut(ctx, receiver, |b| b.bytes.clear())?;
    Ok(Value::Null)
}
