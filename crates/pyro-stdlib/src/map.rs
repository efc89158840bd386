//! map.rs — methods on `Map` and its `MapAsSet` presentation (§4.10).
//!
//! `original_source/src/std/core/std_core_map.c` wasn't present in the
//! retrieved pack (see DESIGN.md); these names follow the same convention
//! `std_core_vec.c` uses (`count`, `is_empty`, `contains`, `copy`). Entry
//! lookup is a linear scan over `entry_array`, matching `vm.rs`'s own
//! `get_index`/`set_index` handling of `[]` on a map rather than probing
//! `index_array` — `index_array` is maintained for that future fast path but
//! not read here, consistent with the rest of the VM today.

use pyro_core::native::NativeContext;
use pyro_core::object::{MapEntry, MapObj, ObjKind, ObjPayload};
use pyro_core::value::Value;

use crate::util::{arg, obj_ref};

fn with_map<T>(ctx: &dyn NativeContext, receiver: Value, f: impl FnOnce(&MapObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "map")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Map(m) => Ok(f(m)),
        _ => Err(format!("expected a map, found {receiver}")),
    }
}

fn with_map_mut<T>(ctx: &mut dyn NativeContext, receiver: Value, f: impl FnOnce(&mut MapObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "map")?;
    match &mut ctx.heap_mut().get_mut(r).payload {
        ObjPayload::Map(m) => Ok(f(m)),
        _ => Err(format!("expected a map, found {receiver}")),
    }
}

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_map(ctx, receiver, |m| Value::I64(m.live_entry_count as i64))
}

pub fn is_empty(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_map(ctx, receiver, |m| Value::Bool(m.live_entry_count == 0))
}

pub fn contains(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    with_map(ctx, receiver, |m| Value::Bool(m.entry_array.iter().any(|e| !matches!(e.key, Value::Tombstone) && e.key == key)))
}

pub fn get(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    with_map(ctx, receiver, |m| m.entry_array.iter().find(|e| !matches!(e.key, Value::Tombstone) && e.key == key).map(|e| e.value))
        .map(|v| v.unwrap_or(Value::Null))
}

pub fn set(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    let value = arg(args, 1)?;
    with_map_mut(ctx, receiver, |m| {
        match m.entry_array.iter_mut().find(|e| !matches!(e.key, Value::Tombstone) && e.key == key) {
            Some(e) => e.value = value,
            None => {
                m.entry_array.push(MapEntry { key, value });
                m.live_entry_count += 1;
            }
        }
        m.version += 1;
    })?;
    Ok(Value::Null)
}

pub fn remove(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    with_map_mut(ctx, receiver, |m| {
        match m.entry_array.iter_mut().find(|e| !matches!(e.key, Value::Tombstone) && e.key == key) {
            Some(e) => {
                e.key = Value::Tombstone;
                m.live_entry_count -= 1;
                m.version += 1;
                true
            }
            None => false,
        }
    })
    .map(Value::Bool)
}

pub fn clear(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_map_mut(ctx, receiver, |m| {
        m.entry_array.clear();
        m.live_entry_count = 0;
        m.version += 1;
    })?;
    Ok(Value::Null)
}

pub fn keys(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let ks = with_map(ctx, receiver, |m| m.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).map(|e| e.key).collect::<Vec<_>>())?;
    Ok(ctx.alloc_vec(ks, false))
}

pub fn values(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let vs = with_map(ctx, receiver, |m| m.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).map(|e| e.value).collect::<Vec<_>>())?;
    Ok(ctx.alloc_vec(vs, false))
}

/// `MapAsSet`-only: inserts `args[0]` with no associated value (stored as
/// `Bool(true)`, matching [`crate::globals::set`]/`vm.rs`'s `MakeSet`
/// convention), grounded on `src/builtins/map.c`'s `set_add`.
pub fn add(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = arg(args, 0)?;
    set(ctx, receiver, &[key, Value::Bool(true)])
}

pub fn copy(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let r = obj_ref(receiver, "map")?;
    let is_set = ctx.heap().get(r).kind == ObjKind::MapAsSet;
    let entries = with_map(ctx, receiver, |m| m.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).map(|e| (e.key, e.value)).collect::<Vec<_>>())?;
    Ok(ctx.alloc_map(entries, is_set))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyro_vm::Vm;

    fn map_with(entries: Vec<(Value, Value)>) -> (Vm, Value) {
        let mut vm = Vm::new();
        let m = vm.alloc_map(entries, false).unwrap();
        (vm, m)
    }

    #[test]
    fn set_then_get_overwrites_existing_key() {
        let (mut vm, m) = map_with(vec![]);
        set(&mut vm, m, &[Value::I64(1), Value::I64(10)]).unwrap();
        assert_eq!(get(&mut vm, m, &[Value::I64(1)]), Ok(Value::I64(10)));
        set(&mut vm, m, &[Value::I64(1), Value::I64(20)]).unwrap();
        assert_eq!(get(&mut vm, m, &[Value::I64(1)]), Ok(Value::I64(20)));
        assert_eq!(count(&mut vm, m, &[]), Ok(Value::I64(1)));
    }

    #[test]
    fn get_missing_key_is_null() {
        let (mut vm, m) = map_with(vec![]);
        assert_eq!(get(&mut vm, m, &[Value::I64(42)]), Ok(Value::Null));
    }

    #[test]
    fn remove_then_contains_is_false_but_slot_is_reusable() {
        let (mut vm, m) = map_with(vec![(Value::I64(1), Value::I64(10))]);
        assert_eq!(remove(&mut vm, m, &[Value::I64(1)]), Ok(Value::Bool(true)));
        assert_eq!(contains(&mut vm, m, &[Value::I64(1)]), Ok(Value::Bool(false)));
        assert_eq!(count(&mut vm, m, &[]), Ok(Value::I64(0)));
        set(&mut vm, m, &[Value::I64(2), Value::I64(20)]).unwrap();
        assert_eq!(count(&mut vm, m, &[]), Ok(Value::I64(1)));
    }

    #[test]
    fn clear_empties_the_map() {
        let (mut vm, m) = map_with(vec![(Value::I64(1), Value::I64(10)), (Value::I64(2), Value::I64(20))]);
        clear(&mut vm, m, &[]).unwrap();
        assert_eq!(count(&mut vm, m, &[]), Ok(Value::I64(0)));
        assert_eq!(is_empty(&mut vm, m, &[]), Ok(Value::Bool(true)));
    }
}
