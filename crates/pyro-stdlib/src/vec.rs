//! vec.rs — methods on `Vec` and its `VecAsStack` presentation (§4.10).
//!
//! Method names are taken from `original_source/src/std/core/std_core_vec.c`
//! rather than invented; see DESIGN.md. `$iter()`/`$next()` themselves are
//! not defined here — the VM's own fast path (`vm.rs`'s `IterSource::Vec`)
//! handles bytecode-level iteration over a `Vec` directly, the same way the
//! original host does.

use pyro_core::native::NativeContext;
use pyro_core::object::{ObjPayload, VecObj};
use pyro_core::value::Value;

use crate::util::{arg, as_i64, obj_ref, resolve_index};

fn values<'a>(ctx: &'a dyn NativeContext, receiver: Value) -> Result<&'a Vec<Value>, String> {
    let r = obj_ref(receiver, "vec")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Vec(v) => Ok(&v.values),
        _ => Err(format!("expected a vec, found {receiver}")),
    }
}

fn with_vec_mut<T>(ctx: &mut dyn NativeContext, receiver: Value, f: impl FnOnce(&mut VecObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "vec")?;
    match &mut ctx.heap_mut().get_mut(r).payload {
        ObjPayload::Vec(v) => Ok(f(v)),
        _ => Err(format!("expected a vec, found {receiver}")),
    }
}

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::I64(values(ctx, receiver)?.len() as i64))
}

pub fn is_empty(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(values(ctx, receiver)?.is_empty()))
}

pub fn append(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let v = arg(args, 0)?;
    with_vec_mut(ctx, receiver, |vec| {
        vec.values.push(v);
        vec.version += 1;
    })?;
    Ok(Value::Null)
}

/// `push`, the `VecAsStack` name for the same operation as `append`.
pub fn push(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    append(ctx, receiver, args)
}

pub fn pop(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_vec_mut(ctx, receiver, |vec| {
        vec.version += 1;
        vec.values.pop()
    })
    .map(|v| v.unwrap_or(Value::Null))
}

pub fn get(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let i = as_i64(arg(args, 0)?)?;
    let vs = values(ctx, receiver)?;
    match resolve_index(i, vs.len()) {
        Some(idx) => Ok(vs[idx]),
        None => Err(format!("index {i} out of bounds")),
    }
}

pub fn set(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let i = as_i64(arg(args, 0)?)?;
    let v = arg(args, 1)?;
    with_vec_mut(ctx, receiver, |vec| match resolve_index(i, vec.values.len()) {
        Some(idx) => {
            vec.values[idx] = v;
            vec.version += 1;
            Ok(())
        }
        None => Err(format!("index {i} out of bounds")),
    })?
    .map(|()| Value::Null)
}

pub fn first(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(values(ctx, receiver)?.first().copied().unwrap_or(Value::Null))
}

pub fn last(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(values(ctx, receiver)?.last().copied().unwrap_or(Value::Null))
}

pub fn remove_first(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_vec_mut(ctx, receiver, |vec| {
        if vec.values.is_empty() {
            Value::Null
        } else {
            vec.version += 1;
            vec.values.remove(0)
        }
    })
}

pub fn remove_last(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    pop(ctx, receiver, _args)
}

pub fn remove_at(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let i = as_i64(arg(args, 0)?)?;
    with_vec_mut(ctx, receiver, |vec| match resolve_index(i, vec.values.len()) {
        Some(idx) => {
            vec.version += 1;
            Ok(vec.values.remove(idx))
        }
        None => Err(format!("index {i} out of bounds")),
    })?
}

pub fn insert_at(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let i = as_i64(arg(args, 0)?)?;
    let v = arg(args, 1)?;
    with_vec_mut(ctx, receiver, |vec| {
        let len = vec.values.len();
        let idx = if i < 0 { len as i64 + i } else { i };
        if idx < 0 || idx as usize > len {
            return Err(format!("index {i} out of bounds"));
        }
        vec.values.insert(idx as usize, v);
        vec.version += 1;
        Ok(())
    })?
    .map(|()| Value::Null)
}

pub fn reverse(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_vec_mut(ctx, receiver, |vec| {
        vec.values.reverse();
        vec.version += 1;
    })?;
    Ok(receiver)
}

pub fn contains(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = arg(args, 0)?;
    Ok(Value::Bool(values(ctx, receiver)?.iter().any(|v| *v == needle)))
}

pub fn index_of(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let needle = arg(args, 0)?;
    match values(ctx, receiver)?.iter().position(|v| *v == needle) {
        Some(i) => Ok(Value::I64(i as i64)),
        None => Ok(Value::Null),
    }
}

pub fn copy(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let vs = values(ctx, receiver)?.clone();
    Ok(ctx.alloc_vec(vs, false))
}

pub fn slice(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let start = as_i64(arg(args, 0)?)?;
    let vs = values(ctx, receiver)?;
    let len = vs.len();
    let start_idx = if start < 0 { (len as i64 + start).max(0) as usize } else { start as usize }.min(len);
    let count = match args.get(1) {
        Some(v) => as_i64(*v)? as usize,
        None => len - start_idx,
    };
    let end_idx = (start_idx + count).min(len);
    let slice = vs[start_idx..end_idx].to_vec();
    Ok(ctx.alloc_vec(slice, false))
}

pub fn join(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let sep = match args.first() {
        Some(v) => crate::util::as_str(ctx, *v)?.to_string(),
        None => String::new(),
    };
    let vs = values(ctx, receiver)?.clone();
    let joined = vs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(&sep);
    Ok(Value::Obj(ctx.intern(&joined)))
}

pub fn map(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 0)?;
    let vs = values(ctx, receiver)?.clone();
    let mapped = vs.into_iter().map(|v| ctx.call_value(callback, &[v])).collect::<Vec<_>>();
    Ok(ctx.alloc_vec(mapped, false))
}

pub fn filter(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 0)?;
    let vs = values(ctx, receiver)?.clone();
    let mut out = Vec::new();
    for v in vs {
        if !ctx.call_value(callback, &[v]).is_falsey() {
            out.push(v);
        }
    }
    Ok(ctx.alloc_vec(out, false))
}

/// Sorts in place by `spec.md` §4.7's numeric ordering; elements that
/// aren't mutually comparable keep their relative order (stable sort, no
/// panic) since a general three-way comparator for arbitrary objects is out
/// of scope here.
pub fn sort(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_vec_mut(ctx, receiver, |vec| {
        vec.values.sort_by(|a, b| a.numeric_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        vec.version += 1;
    })?;
    Ok(receiver)
}

pub fn is_sorted(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let vs = values(ctx, receiver)?;
    Ok(Value::Bool(vs.windows(2).all(|w| matches!(w[0].numeric_cmp(&w[1]), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal) | None))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyro_vm::Vm;

    fn vec3() -> (Vm, Value) {
        let mut vm = Vm::new();
        let v = vm.alloc_vec(vec![Value::I64(1), Value::I64(2), Value::I64(3)], false).unwrap();
        (vm, v)
    }

    #[test]
    fn count_and_get() {
        let (mut vm, v) = vec3();
        assert_eq!(count(&mut vm, v, &[]), Ok(Value::I64(3)));
        assert_eq!(get(&mut vm, v, &[Value::I64(0)]), Ok(Value::I64(1)));
        assert_eq!(get(&mut vm, v, &[Value::I64(-1)]), Ok(Value::I64(3)));
        assert!(get(&mut vm, v, &[Value::I64(99)]).is_err());
    }

    #[test]
    fn push_and_pop_on_stack() {
        let mut vm = Vm::new();
        let v = vm.alloc_vec(Vec::new(), true).unwrap();
        push(&mut vm, v, &[Value::I64(10)]).unwrap();
        push(&mut vm, v, &[Value::I64(20)]).unwrap();
        assert_eq!(count(&mut vm, v, &[]), Ok(Value::I64(2)));
        assert_eq!(pop(&mut vm, v, &[]), Ok(Value::I64(20)));
        assert_eq!(pop(&mut vm, v, &[]), Ok(Value::I64(10)));
        assert_eq!(pop(&mut vm, v, &[]), Ok(Value::Null));
    }

    #[test]
    fn slice_clamps_to_bounds() {
        let (mut vm, v) = vec3();
        let sliced = slice(&mut vm, v, &[Value::I64(1)]).unwrap();
        assert_eq!(values(&vm, sliced).unwrap(), &[Value::I64(2), Value::I64(3)]);
        let sliced = slice(&mut vm, v, &[Value::I64(-2), Value::I64(100)]).unwrap();
        assert_eq!(values(&vm, sliced).unwrap(), &[Value::I64(2), Value::I64(3)]);
    }

    #[test]
    fn contains_and_index_of() {
        let (mut vm, v) = vec3();
        assert_eq!(contains(&mut vm, v, &[Value::I64(2)]), Ok(Value::Bool(true)));
        assert_eq!(index_of(&mut vm, v, &[Value::I64(2)]), Ok(Value::I64(1)));
        assert_eq!(index_of(&mut vm, v, &[Value::I64(9)]), Ok(Value::Null));
    }

    #[test]
    fn insert_at_and_remove_at() {
        let (mut vm, v) = vec3();
        insert_at(&mut vm, v, &[Value::I64(1), Value::I64(99)]).unwrap();
        assert_eq!(values(&vm, v).unwrap(), &[Value::I64(1), Value::I64(99), Value::I64(2), Value::I64(3)]);
        let removed = remove_at(&mut vm, v, &[Value::I64(1)]).unwrap();
        assert_eq!(removed, Value::I64(99));
        assert_eq!(values(&vm, v).unwrap(), &[Value::I64(1), Value::I64(2), Value::I64(3)]);
    }

    #[test]
    fn is_sorted_reports_correctly() {
        let (mut vm, v) = vec3();
        assert_eq!(is_sorted(&mut vm, v, &[]), Ok(Value::Bool(true)));
        reverse(&mut vm, v, &[]).unwrap();
        assert_eq!(is_sorted(&mut vm, v, &[]), Ok(Value::Bool(false)));
        sort(&mut vm, v, &[]).unwrap();
        assert_eq!(is_sorted(&mut vm, v, &[]), Ok(Value::Bool(true)));
    }
}
