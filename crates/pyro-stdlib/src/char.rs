//! char.rs — methods on the `char` pseudo-class (§4.10), attached via
//! `Vm::char_class()` since runes aren't heap objects.
//!
//! Names taken from `original_source/src/std/core/std_core_char.c`.

use pyro_core::native::NativeContext;
use pyro_core::value::Value;

fn rune(receiver: Value) -> Result<char, String> {
    match receiver {
        Value::Rune(c) => char::from_u32(c).ok_or_else(|| format!("invalid char U+{c:X}")),
        other => Err(format!("expected a char, found {other}")),
    }
}

pub fn is_ascii(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(rune(receiver)?.is_ascii()))
}

pub fn is_ascii_ws(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(matches!(rune(receiver)?, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c')))
}

pub fn is_unicode_ws(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(rune(receiver)?.is_whitespace()))
}

pub fn is_ascii_decimal(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(rune(receiver)?.is_ascii_digit()))
}

pub fn is_ascii_octal(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(matches!(rune(receiver)?, '0'..='7')))
}

pub fn is_ascii_hex(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(rune(receiver)?.is_ascii_hexdigit()))
}

pub fn to_ascii_upper(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Rune(rune(receiver)?.to_ascii_uppercase() as u32))
}

pub fn to_ascii_lower(_ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Rune(rune(receiver)?.to_ascii_lowercase() as u32))
}

pub fn to_str(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let c = rune(receiver)?;
    Ok(Value::Obj(ctx.intern(&c.to_string())))
}
