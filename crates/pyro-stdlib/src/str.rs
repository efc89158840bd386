//! str.rs — methods on `Str` (§4.10).
//!
//! `original_source/src/std/core/std_core_str.c` wasn't present in the
//! retrieved pack (see DESIGN.md), so these names are modelled on the
//! conventions `std_core_vec.c`/`std_core_iter.c` establish (`count`,
//! `is_empty`, `contains`, `index_of`, `slice`, `join`) rather than quoted
//! from the original literally. `$iter()`/`$next()` over bytes/chars/lines
//! are the VM's own fast path (`IterSource::Str{Bytes,Chars,Lines}`), not
//! defined here.

use pyro_core::native::NativeContext;
use pyro_core::value::Value;

use crate::util::{arg, as_str};

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::I64(as_str(ctx, receiver)?.chars().count() as i64))
}

pub fn byte_count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::I64(as_str(ctx, receiver)?.len() as i64))
}

pub fn is_empty(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(as_str(ctx, receiver)?.is_empty()))
}

pub fn contains(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = as_str(ctx, arg(args, 0)?)?.to_string();
    Ok(Value::Bool(as_str(ctx, receiver)?.contains(&needle)))
}

pub fn starts_with(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = as_str(ctx, arg(args, 0)?)?.to_string();
    Ok(Value::Bool(as_str(ctx, receiver)?.starts_with(&needle)))
}

pub fn ends_with(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = as_str(ctx, arg(args, 0)?)?.to_string();
    Ok(Value::Bool(as_str(ctx, receiver)?.ends_with(&needle)))
}

pub fn index_of(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = as_str(ctx, arg(args, 0)?)?.to_string();
    match as_str(ctx, receiver)?.find(&needle) {
        Some(byte_idx) => Ok(Value::I64(as_str(ctx, receiver)?[..byte_idx].chars().count() as i64)),
        None => Ok(Value::Null),
    }
}

pub fn to_upper(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let upper = as_str(ctx, receiver)?.to_uppercase();
    Ok(Value::Obj(ctx.intern(&upper)))
}

pub fn to_lower(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let lower = as_str(ctx, receiver)?.to_lowercase();
    Ok(Value::Obj(ctx.intern(&lower)))
}

pub fn strip(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let trimmed = as_str(ctx, receiver)?.trim().to_string();
    Ok(Value::Obj(ctx.intern(&trimmed)))
}

pub fn strip_prefix(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let prefix = as_str(ctx, arg(args, 0)?)?.to_string();
    let s = as_str(ctx, receiver)?;
    let stripped = s.strip_prefix(&prefix).unwrap_or(s).to_string();
    Ok(Value::Obj(ctx.intern(&stripped)))
}

pub fn strip_suffix(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let suffix = as_str(ctx, arg(args, 0)?)?.to_string();
    let s = as_str(ctx, receiver)?;
    let stripped = s.strip_suffix(&suffix).unwrap_or(s).to_string();
    Ok(Value::Obj(ctx.intern(&stripped)))
}

pub fn split(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let sep = as_str(ctx, arg(args, 0)?)?.to_string();
    let s = as_str(ctx, receiver)?.to_string();
    let parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::Obj(ctx.intern(&c.to_string()))).collect()
    } else {
        s.split(&sep as &str).map(|p| Value::Obj(ctx.intern(p))).collect()
    };
    Ok(ctx.alloc_vec(parts, false))
}

pub fn slice(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let start = crate::util::as_i64(arg(args, 0)?)?;
    let chars: Vec<char> = as_str(ctx, receiver)?.chars().collect();
    let len = chars.len();
    let start_idx = if start < 0 { (len as i64 + start).max(0) as usize } else { start as usize }.min(len);
    let count = match args.get(1) {
        Some(v) => crate::util::as_i64(*v)? as usize,
        None => len - start_idx,
    };
    let end_idx = (start_idx + count).min(len);
    let slice: String = chars[start_idx..end_idx].iter().collect();
    Ok(Value::Obj(ctx.intern(&slice)))
}

pub fn repeat(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let n = crate::util::as_i64(arg(args, 0)?)?.max(0) as usize;
    let repeated = as_str(ctx, receiver)?.repeat(n);
    Ok(Value::Obj(ctx.intern(&repeated)))
}

pub fn to_i64(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    as_str(ctx, receiver)?.trim().parse::<i64>().map(Value::I64).map_err(|_| "cannot parse string as an integer".to_string())
}

pub fn to_f64(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    as_str(ctx, receiver)?.trim().parse::<f64>().map(Value::F64).map_err(|_| "cannot parse string as a float".to_string())
}
