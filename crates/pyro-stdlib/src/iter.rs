//! iter.rs — methods on `Iter`, the built-in iterator wrapper (§4.10).
//!
//! Names taken from `original_source/src/std/core/std_core_iter.c`.
//! `$iter()`/`$next()` bytecode-level dispatch is the VM's own fast path
//! (`vm.rs`'s `advance_iterator`); these methods drain an iterator through
//! [`pyro_core::native::NativeContext::iterator_next`], the same function
//! `GET_NEXT_FROM_ITERATOR` calls, so draining here behaves identically to
//! driving the same iterator from bytecode.

use pyro_core::native::NativeContext;
use pyro_core::object::{IterObj, IterSource, ObjKind, ObjPayload};
use pyro_core::value::Value;

use crate::util::{arg, obj_ref};

fn is_exhausted(ctx: &dyn NativeContext, v: Value) -> bool {
    v.as_obj().is_some_and(|r| ctx.heap().get(r).kind == ObjKind::Err)
}

fn drain(ctx: &mut dyn NativeContext, receiver: Value) -> Result<Vec<Value>, String> {
    let r = obj_ref(receiver, "iter")?;
    let mut out = Vec::new();
    loop {
        let v = ctx.iterator_next(r);
        if is_exhausted(ctx, v) {
            break;
        }
        out.push(v);
    }
    Ok(out)
}

pub fn to_vec(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let values = drain(ctx, receiver)?;
    Ok(ctx.alloc_vec(values, false))
}

pub fn to_set(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let values = drain(ctx, receiver)?;
    Ok(ctx.alloc_map(values.into_iter().map(|v| (v, Value::Bool(true))).collect(), true))
}

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::I64(drain(ctx, receiver)?.len() as i64))
}

pub fn sum(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let values = drain(ctx, receiver)?;
    let mut total_i = 0i64;
    let mut total_f = 0f64;
    let mut is_float = false;
    for v in values {
        match v {
            Value::I64(n) if !is_float => total_i += n,
            Value::I64(n) => total_f += n as f64,
            Value::F64(f) => {
                if !is_float {
                    total_f = total_i as f64;
                    is_float = true;
                }
                total_f += f;
            }
            other => return Err(format!("sum() requires numeric elements, found {other}")),
        }
    }
    Ok(if is_float { Value::F64(total_f) } else { Value::I64(total_i) })
}

pub fn reduce(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 0)?;
    let values = drain(ctx, receiver)?;
    let mut iter = values.into_iter();
    let Some(mut acc) = iter.next() else { return Ok(Value::Null) };
    for v in iter {
        acc = ctx.call_value(callback, &[acc, v]);
    }
    Ok(acc)
}

pub fn join(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let sep = match args.first() {
        Some(v) => crate::util::as_str(ctx, *v)?.to_string(),
        None => String::new(),
    };
    let values = drain(ctx, receiver)?;
    let joined = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(&sep);
    Ok(Value::Obj(ctx.intern(&joined)))
}

/// Wraps `receiver` in a new `Iter` applying `callback` lazily, matching the
/// `FuncMap` `IterSource` variant `vm.rs`'s `advance_iterator` already knows
/// how to drive (kept lazy rather than eagerly draining into a vec).
fn iter_class(ctx: &dyn NativeContext, inner: pyro_core::heap::ObjRef) -> Result<pyro_core::heap::ObjRef, String> {
    ctx.heap().get(inner).class.ok_or_else(|| "iter has no class attached".to_string())
}

pub fn map(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 0)?;
    let inner = obj_ref(receiver, "iter")?;
    let class = iter_class(ctx, inner)?;
    Ok(ctx.alloc_with_class(ObjPayload::Iter(IterObj { source: inner, kind: IterSource::FuncMap { inner, callback }, exhausted: false }), class))
}

pub fn filter(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 0)?;
    let inner = obj_ref(receiver, "iter")?;
    let class = iter_class(ctx, inner)?;
    Ok(ctx.alloc_with_class(ObjPayload::Iter(IterObj { source: inner, kind: IterSource::FuncFilter { inner, callback }, exhausted: false }), class))
}

pub fn enumerate(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let inner = obj_ref(receiver, "iter")?;
    let class = iter_class(ctx, inner)?;
    Ok(ctx.alloc_with_class(ObjPayload::Iter(IterObj { source: inner, kind: IterSource::Enumerate { inner, index: 0 }, exhausted: false }), class))
}

pub fn skip_first(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let n = crate::util::as_i64(arg(args, 0)?)?.max(0);
    let r = obj_ref(receiver, "iter")?;
    for _ in 0..n {
        let v = ctx.iterator_next(r);
        if is_exhausted(ctx, v) {
            break;
        }
    }
    Ok(receiver)
}

pub fn skip_last(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let n = crate::util::as_i64(arg(args, 0)?)?.max(0) as usize;
    let mut values = drain(ctx, receiver)?;
    values.truncate(values.len().saturating_sub(n));
    Ok(ctx.alloc_vec(values, false))
}

pub fn next(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let r = obj_ref(receiver, "iter")?;
    Ok(ctx.iterator_next(r))
}
