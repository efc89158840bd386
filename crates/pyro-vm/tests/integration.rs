//! tests/integration.rs — end-to-end scenarios: source text through
//! `pyro-compiler` and `pyro-stdlib`'s native tables, driven by a real `Vm`.
//!
//! Mirrors the worked examples in `spec.md` §8, but substitutes `return`
//! for `echo` so each scenario can assert on `Vm::run_script`'s return
//! value directly rather than capturing stdout.

use pyro_compiler::Compiler;
use pyro_core::value::Value;
use pyro_vm::Vm;

fn run(source: &str) -> Value {
    let mut vm = Vm::new();
    pyro_stdlib::install(&mut vm);
    let fn_obj = Compiler::compile(source, "<test>", &mut vm.heap, &mut vm.strings).expect("compile error");
    vm.run_script(fn_obj).expect("uncaught panic")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("return 2 + 3 * 4;"), Value::I64(14));
}

#[test]
fn range_loop_accumulates() {
    let source = indoc::indoc! {"
        var total = 0;
        for i in $range(1, 11) { total += i; }
        return total;
    "};
    assert_eq!(run(source), Value::I64(55));
}

#[test]
fn class_method_mutates_instance_state() {
    let source = indoc::indoc! {"
        class Counter {
            var n = 0;
            pub def tick() { self.n += 1; return self.n; }
        }
        var c = Counter();
        var a = c:tick();
        var b = c:tick();
        var d = c:tick();
        return a == 1 && b == 2 && d == 3;
    "};
    assert_eq!(run(source), Value::Bool(true));
}

#[test]
fn closures_capture_upvalues() {
    let source = indoc::indoc! {"
        def make_adder(x) { return def(y) { return x + y; }; }
        var add5 = make_adder(5);
        return add5(10);
    "};
    assert_eq!(run(source), Value::I64(15));
}

#[test]
fn try_expression_captures_panic_as_err_value() {
    let source = indoc::indoc! {"
        var r = try (1 / 0);
        return $is_err(r);
    "};
    assert_eq!(run(source), Value::Bool(true));
}

#[test]
fn set_constructor_and_add_deduplicate() {
    let source = indoc::indoc! {"
        var s = $set();
        s:add(1); s:add(2); s:add(1);
        return s:count();
    "};
    assert_eq!(run(source), Value::I64(2));
}

#[test]
fn integer_overflow_panics_instead_of_wrapping() {
    let mut vm = Vm::new();
    pyro_stdlib::install(&mut vm);
    let source = "return 9223372036854775807 + 1;";
    let fn_obj = Compiler::compile(source, "<test>", &mut vm.heap, &mut vm.strings).expect("compile error");
    assert!(vm.run_script(fn_obj).is_err());
}

#[test]
fn vec_constructor_drains_any_iterable() {
    let source = indoc::indoc! {"
        var r = $range(0, 3);
        var v = $vec(r);
        return v:count();
    "};
    assert_eq!(run(source), Value::I64(3));
}
