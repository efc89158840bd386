//! globals.rs — superglobal free functions (§6/§9), grounded on the `$`
//! family `original_source/src/std/core/std_core.c` registers directly onto
//! the global namespace rather than a class (`$print`, `$type`, `$range`,
//! `$is_*`, ...).

use std::io::Write;

use pyro_core::native::NativeContext;
use pyro_core::object::{ObjKind, ObjPayload};
use pyro_core::value::Value;

use crate::util::arg;

pub fn print(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    for (i, v) in args.iter().enumerate() {
        if i > 0 {
            print!(" ");
        }
        print!("{v}");
    }
    let _ = ctx;
    std::io::stdout().flush().map_err(|e| e.to_string())?;
    Ok(Value::Null)
}

pub fn println(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    print(ctx, receiver, args)?;
    println!();
    Ok(Value::Null)
}

pub fn eprint(_ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    for (i, v) in args.iter().enumerate() {
        if i > 0 {
            eprint!(" ");
        }
        eprint!("{v}");
    }
    Ok(Value::Null)
}

pub fn eprintln(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    eprint(ctx, receiver, args)?;
    eprintln!();
    Ok(Value::Null)
}

pub fn type_of(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    let v = arg(args, 0)?;
    let name = match v {
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tombstone => "tombstone",
        Value::I64(_) => "i64",
        Value::F64(_) => "f64",
        Value::Rune(_) => "char",
        Value::Obj(r) => match ctx.heap().get(r).kind {
            ObjKind::Str => "str",
            ObjKind::Map | ObjKind::MapAsSet | ObjKind::MapAsWeakref => "map",
            ObjKind::Vec | ObjKind::VecAsStack => "vec",
            ObjKind::Tup => "tup",
            ObjKind::Buf => "buf",
            ObjKind::Fn | ObjKind::Closure | ObjKind::NativeFn | ObjKind::BoundMethod => "fn",
            ObjKind::Class => "class",
            ObjKind::Instance => "instance",
            ObjKind::Module => "module",
            ObjKind::Iter => "iter",
            ObjKind::Queue => "queue",
            ObjKind::File => "file",
            ObjKind::Err => "err",
            _ => "object",
        },
    };
    Ok(Value::Obj(ctx.intern(name)))
}

pub fn is_callable(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    let v = arg(args, 0)?;
    let callable = match v {
        Value::Obj(r) => matches!(ctx.heap().get(r).kind, ObjKind::Fn | ObjKind::Closure | ObjKind::NativeFn | ObjKind::BoundMethod | ObjKind::Class),
        _ => false,
    };
    Ok(Value::Bool(callable))
}

pub fn is_err(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    let v = arg(args, 0)?;
    Ok(Value::Bool(v.as_obj().is_some_and(|r| ctx.heap().get(r).kind == ObjKind::Err)))
}

pub fn panic(_ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    let message = args.first().map(|v| v.to_string()).unwrap_or_default();
    Err(message)
}

pub fn hash(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    use std::hash::{Hash, Hasher};
    let v = arg(args, 0)?;
    let mut hasher = ahash::AHasher::default();
    match v {
        Value::I64(n) => n.hash(&mut hasher),
        Value::F64(f) => f.to_bits().hash(&mut hasher),
        Value::Bool(b) => b.hash(&mut hasher),
        Value::Rune(c) => c.hash(&mut hasher),
        Value::Null | Value::Tombstone => 0u8.hash(&mut hasher),
        Value::Obj(r) => match &ctx.heap().get(r).payload {
            ObjPayload::Str(s) => s.hash.hash(&mut hasher),
            _ => r.index().hash(&mut hasher),
        },
    }
    Ok(Value::I64(hasher.finish() as i64))
}

/// `$range(start, stop[, step])`: allocates a lazy `Iter` with
/// `IterSource::Range`, matching `for i in $range(1, 11)` from `spec.md`'s
/// worked example.
pub fn range(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    let (start, stop) = match args.len() {
        1 => (0, crate::util::as_i64(arg(args, 0)?)?),
        _ => (crate::util::as_i64(arg(args, 0)?)?, crate::util::as_i64(arg(args, 1)?)?),
    };
    let step = match args.get(2) {
        Some(v) => crate::util::as_i64(*v)?,
        None => 1,
    };
    if step == 0 {
        return Err("$range() step must not be zero".to_string());
    }
    let class = ctx.builtin_class(ObjKind::Iter);
    // `Range` never reads `source`; any live ref is a safe placeholder.
    Ok(ctx.alloc_with_class(
        ObjPayload::Iter(pyro_core::object::IterObj { source: class, kind: pyro_core::object::IterSource::Range { current: start, stop, step }, exhausted: false }),
        class,
    ))
}

pub fn clock(_ctx: &mut dyn NativeContext, _receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map_err(|e| e.to_string())?;
    Ok(Value::F64(now.as_secs_f64()))
}

/// Drains `iterable`'s `$iter()`/`$next()` protocol into a plain `Vec<Value>`,
/// shared by `$vec(arg)`/`$set(arg)`'s one-argument forms
/// (`original_source/src/std/core/std_core_vec.c`'s `fn_vec`,
/// `src/builtins/map.c`'s `fn_set`).
fn drain_iterable(ctx: &mut dyn NativeContext, iterable: Value, who: &str) -> Result<Vec<Value>, String> {
    let method = ctx.get_method(iterable, "$iter");
    if matches!(method, Value::Null) {
        return Err(format!("{who}(): invalid argument [arg], argument is not iterable"));
    }
    let bound = ctx.alloc_plain(ObjPayload::BoundMethod(pyro_core::object::BoundMethodObj { receiver: iterable, method }));
    let iterator = ctx.call_value(bound, &[]);
    let iter_ref = crate::util::obj_ref(iterator, "iter")?;
    let mut values = Vec::new();
    loop {
        let next = ctx.iterator_next(iter_ref);
        if next.as_obj().is_some_and(|r| ctx.heap().get(r).kind == ObjKind::Err) {
            break;
        }
        values.push(next);
    }
    Ok(values)
}

/// `$vec()` / `$vec(iterable)`: grounded on `fn_vec` — an empty `Vec`, or
/// one built by draining any `$iter()`-capable argument.
pub fn vec(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        None => Ok(ctx.alloc_vec(Vec::new(), false)),
        Some(&v) => Ok(ctx.alloc_vec(drain_iterable(ctx, v, "$vec")?, false)),
    }
}

/// `$stack()`: grounded on `fn_stack` — an always-empty `VecAsStack`.
pub fn stack(ctx: &mut dyn NativeContext, _receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(ctx.alloc_vec(Vec::new(), true))
}

/// `$map()`: grounded on `fn_map` — an always-empty `Map`.
pub fn map(ctx: &mut dyn NativeContext, _receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(ctx.alloc_map(Vec::new(), false))
}

/// `$set()` / `$set(iterable)`: grounded on `fn_set` — an empty `MapAsSet`,
/// or one built by draining any `$iter()`-capable argument (membership
/// values are ignored, per §3's `MapAsSet` semantics).
pub fn set(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        None => Ok(ctx.alloc_map(Vec::new(), true)),
        Some(&v) => {
            let values = drain_iterable(ctx, v, "$set")?;
            let entries = values.into_iter().map(|k| (k, Value::Bool(true))).collect();
            Ok(ctx.alloc_map(entries, true))
        }
    }
}

/// `$err(message[, key, value, ...])`: grounded on `std_core_err.c`'s
/// `fn_err` — builds a first-class `Err` value with `message` and an
/// optional flat list of key/value pairs merged into its `details` map.
pub fn err(ctx: &mut dyn NativeContext, _receiver: Value, args: &[Value]) -> Result<Value, String> {
    if args.is_empty() {
        return Err("$err(): expected 1 or more arguments, found 0".to_string());
    }
    let message = args[0];
    let mut entries = Vec::new();
    let mut rest = &args[1..];
    while rest.len() >= 2 {
        entries.push((rest[0], rest[1]));
        rest = &rest[2..];
    }
    let details = ctx.alloc_map(entries, false);
    let details_ref = crate::util::obj_ref(details, "map")?;
    let class = ctx.builtin_class(ObjKind::Err);
    Ok(ctx.alloc_with_class(ObjPayload::Err(pyro_core::object::ErrObj { message, details: details_ref }), class))
}
