//! operators.rs — the numeric fast path for binary/unary operators (§4.7).
//!
//! Grounded on `original_source/src/core/operators.c`: every operator tries a
//! typed fast path first (numeric-numeric, same-kind object-object) before
//! falling back to `$op_binary_*`/`$rop_binary_*` method dispatch, which
//! needs heap/class access and so lives on [`crate::vm::Vm`] itself rather
//! than here.

use pyro_core::bytecode::Op;
use pyro_core::value::Value;

/// Tries the numeric-only fast path for a binary operator. `None` means
/// "not both operands numeric" or "not a binary operator this module
/// handles" — the caller falls through to object fast paths, then the
/// `$op_binary_*`/`$rop_binary_*` method lookup. `Some(Err(_))` is a panic
/// message for a numeric operation that IS defined for these operand types
/// but fails at this specific value (overflow, division by zero) — per §8's
/// "overflow must panic, not wrap" invariant and `original_source/src/core/
/// operators.c`'s `pyro_ckd_add`/`division by zero` checks, neither of
/// these should fall through to `$op_binary_*` dispatch or be silently
/// wrapped.
pub fn fast_numeric(op: Op, a: Value, b: Value) -> Option<Result<Value, String>> {
    match op {
        Op::BinaryPlus => checked_arith(a, b, "+", i64::checked_add, |x, y| x + y),
        Op::BinaryMinus => checked_arith(a, b, "-", i64::checked_sub, |x, y| x - y),
        Op::BinaryStar => checked_arith(a, b, "*", i64::checked_mul, |x, y| x * y),
        Op::I64Add => match (a, b) {
            (Value::I64(x), Value::I64(y)) => Some(x.checked_add(y).map(Value::I64).ok_or_else(|| overflow_msg("+", x, y))),
            _ => None,
        },
        Op::BinarySlash => numeric_div(a, b),
        Op::BinarySlashSlash => numeric_floor_div(a, b),
        Op::BinaryPercent => numeric_mod(a, b),
        Op::BinaryStarStar => numeric_pow(a, b),
        Op::BinaryAmp => int_only(a, b, |x, y| x & y).map(Ok),
        Op::BinaryBar => int_only(a, b, |x, y| x | y).map(Ok),
        Op::BinaryCaret => int_only(a, b, |x, y| x ^ y).map(Ok),
        Op::BinaryLessLess => int_only(a, b, |x, y| x.wrapping_shl(y as u32)).map(Ok),
        Op::BinaryGreaterGreater => int_only(a, b, |x, y| x.wrapping_shr(y as u32)).map(Ok),
        Op::BinaryLess => numeric_cmp(a, b, |o| o.is_lt()).map(Ok),
        Op::BinaryLessEqual => numeric_cmp(a, b, |o| o.is_le()).map(Ok),
        Op::BinaryGreater => numeric_cmp(a, b, |o| o.is_gt()).map(Ok),
        Op::BinaryGreaterEqual => numeric_cmp(a, b, |o| o.is_ge()).map(Ok),
        _ => None,
    }
}

fn overflow_msg(symbol: &str, x: i64, y: i64) -> String {
    format!("signed integer overflow: {x} {symbol} {y}")
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::I64(_) | Value::F64(_) | Value::Rune(_))
}

fn as_f64(v: Value) -> f64 {
    match v {
        Value::I64(i) => i as f64,
        Value::F64(f) => f,
        Value::Rune(c) => c as f64,
        _ => unreachable!("as_f64 called on a non-numeric Value"),
    }
}

fn as_i64(v: Value) -> Option<i64> {
    match v {
        Value::I64(i) => Some(i),
        Value::Rune(c) => Some(c as i64),
        _ => None,
    }
}

/// `+`/`-`/`*`: same-kind-int uses `int_op`'s checked variant (panics on
/// overflow rather than wrapping, per §8); any other numeric combination
/// promotes to `f64` (`float_op`, which cannot overflow in the same sense).
fn checked_arith(a: Value, b: Value, symbol: &str, int_op: fn(i64, i64) -> Option<i64>, float_op: fn(f64, f64) -> f64) -> Option<Result<Value, String>> {
    if !is_numeric(&a) || !is_numeric(&b) {
        return None;
    }
    match (a, b) {
        (Value::I64(x), Value::I64(y)) => Some(int_op(x, y).map(Value::I64).ok_or_else(|| overflow_msg(symbol, x, y))),
        (Value::Rune(x), Value::Rune(y)) => Some(int_op(x as i64, y as i64).map(Value::I64).ok_or_else(|| overflow_msg(symbol, x as i64, y as i64))),
        _ => Some(Ok(Value::F64(float_op(as_f64(a), as_f64(b))))),
    }
}

/// `/` always produces a float result, matching `pyro_op_binary_slash`
/// (true division, never integer division) and panics on a zero divisor
/// of either operand type, not just the integer case.
fn numeric_div(a: Value, b: Value) -> Option<Result<Value, String>> {
    if !is_numeric(&a) || !is_numeric(&b) {
        return None;
    }
    let y = as_f64(b);
    if y == 0.0 {
        return Some(Err("division by zero".to_string()));
    }
    Some(Ok(Value::F64(as_f64(a) / y)))
}

/// `//`: truncating division, matching `pyro_op_binary_slash_slash` (plain
/// C `/` on two `i64`s, not floor division) — panics on a zero divisor and
/// on the one case integer truncating division can overflow,
/// `i64::MIN // -1`.
fn numeric_floor_div(a: Value, b: Value) -> Option<Result<Value, String>> {
    if !is_numeric(&a) || !is_numeric(&b) {
        return None;
    }
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        if y == 0 {
            return Some(Err("division by zero".to_string()));
        }
        return Some(x.checked_div(y).map(Value::I64).ok_or_else(|| format!("signed integer overflow: {x} // {y}")));
    }
    let y = as_f64(b);
    if y == 0.0 {
        return Some(Err("division by zero".to_string()));
    }
    Some(Ok(Value::F64((as_f64(a) / y).trunc())))
}

/// `%`: truncating remainder, matching `pyro_op_binary_percent` (C's `%`/
/// `fmod`, not Euclidean remainder) — panics on a zero divisor.
fn numeric_mod(a: Value, b: Value) -> Option<Result<Value, String>> {
    if !is_numeric(&a) || !is_numeric(&b) {
        return None;
    }
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        if y == 0 {
            return Some(Err("division by zero".to_string()));
        }
        return Some(Ok(Value::I64(x.wrapping_rem(y))));
    }
    let y = as_f64(b);
    if y == 0.0 {
        return Some(Err("division by zero".to_string()));
    }
    Some(Ok(Value::F64(as_f64(a) % y)))
}

/// `**`: always promotes to `f64` via `pow`, matching
/// `pyro_op_binary_star_star` — Pyro has no integer-power fast path.
fn numeric_pow(a: Value, b: Value) -> Option<Result<Value, String>> {
    if !is_numeric(&a) || !is_numeric(&b) {
        return None;
    }
    Some(Ok(Value::F64(as_f64(a).powf(as_f64(b)))))
}

fn int_only(a: Value, b: Value, f: fn(i64, i64) -> i64) -> Option<Value> {
    let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) else { return None };
    Some(Value::I64(f(x, y)))
}

fn numeric_cmp(a: Value, b: Value, accept: fn(std::cmp::Ordering) -> bool) -> Option<Value> {
    if !is_numeric(&a) || !is_numeric(&b) {
        return None;
    }
    if let (Value::F64(x), Value::F64(y)) = (a, b) {
        if x.is_nan() || y.is_nan() {
            return Some(Value::Bool(false));
        }
    }
    a.numeric_cmp(&b).map(|o| Value::Bool(accept(o)))
}

/// Method-name pair an operator falls back to: `($op_binary_*, $rop_binary_*)`.
/// `None` for operators with no overload hook (none, currently — every binary
/// comparison/arithmetic op is overloadable per §4.7).
pub fn overload_names(op: Op) -> Option<(&'static str, &'static str)> {
    Some(match op {
        Op::BinaryPlus => ("$op_binary_plus", "$rop_binary_plus"),
        Op::BinaryMinus => ("$op_binary_minus", "$rop_binary_minus"),
        Op::BinaryStar => ("$op_binary_star", "$rop_binary_star"),
        Op::BinarySlash => ("$op_binary_slash", "$rop_binary_slash"),
        Op::BinarySlashSlash => ("$op_binary_slash_slash", "$rop_binary_slash_slash"),
        Op::BinaryPercent => ("$op_binary_percent", "$rop_binary_percent"),
        Op::BinaryStarStar => ("$op_binary_star_star", "$rop_binary_star_star"),
        Op::BinaryAmp => ("$op_binary_amp", "$rop_binary_amp"),
        Op::BinaryBar => ("$op_binary_bar", "$rop_binary_bar"),
        Op::BinaryCaret => ("$op_binary_caret", "$rop_binary_caret"),
        Op::BinaryLessLess => ("$op_binary_less_less", "$rop_binary_less_less"),
        Op::BinaryGreaterGreater => ("$op_binary_greater_greater", "$rop_binary_greater_greater"),
        Op::BinaryLess => ("$op_binary_less", "$rop_binary_less"),
        Op::BinaryLessEqual => ("$op_binary_less_equals", "$rop_binary_less_equals"),
        Op::BinaryGreater => ("$op_binary_greater", "$rop_binary_greater"),
        Op::BinaryGreaterEqual => ("$op_binary_greater_equals", "$rop_binary_greater_equals"),
        Op::BinaryEqualEqual => ("$op_binary_equals_equals", "$rop_binary_equals_equals"),
        _ => return None,
    })
}
