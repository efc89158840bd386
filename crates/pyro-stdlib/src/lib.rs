//! pyro-stdlib — native method tables for Pyro's built-in classes (§4.10).
//!
//! Every built-in class (`Vec`, `Map`, `Str`, ...) is created as an empty
//! shell by `pyro_vm::Vm::new()`; [`install`] is the one call a host
//! (`pyro-cli`, or an embedder) makes to populate them with real methods,
//! mirroring how the original host's `pyro_init_vm` calls one
//! `std_core_*_init` per built-in before handing the VM back to the caller.
//!
//! Method names are grounded on `original_source/src/std/core/*.c` where
//! that file was retrieved (`std_core_vec.c`, `std_core_char.c`,
//! `std_core_err.c`, `std_core_file.c`, `std_core_iter.c`); `std_core_str.c`
//! and `std_core_map.c` were absent from the pack, so `str`/`map`'s method
//! names follow the conventions the other files establish instead — see
//! DESIGN.md.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod buf;
mod char;
mod err;
mod file;
mod globals;
mod iter;
mod map;
mod queue;
mod str;
mod tup;
mod util;
mod vec;

use pyro_core::object::ObjKind;
use pyro_vm::Vm;

/// Populates every built-in class's method table and registers the
/// superglobal free functions. Call once, right after `Vm::new()`, before
/// running any Pyro source.
pub fn install(vm: &mut Vm) {
    install_vec(vm);
    install_map(vm);
    install_str(vm);
    install_tup(vm);
    install_buf(vm);
    install_iter(vm);
    install_queue(vm);
    install_file(vm);
    install_err(vm);
    install_char(vm);
    install_globals(vm);
}

fn install_vec(vm: &mut Vm) {
    for class in [vm.builtin_class(ObjKind::Vec), vm.builtin_class(ObjKind::VecAsStack)] {
        vm.define_pub_method(class, "count", vec::count, Some(0));
        vm.define_pub_method(class, "is_empty", vec::is_empty, Some(0));
        vm.define_pub_method(class, "get", vec::get, Some(1));
        vm.define_pub_method(class, "set", vec::set, Some(2));
        vm.define_pub_method(class, "first", vec::first, Some(0));
        vm.define_pub_method(class, "last", vec::last, Some(0));
        vm.define_pub_method(class, "reverse", vec::reverse, Some(0));
        vm.define_pub_method(class, "contains", vec::contains, Some(1));
        vm.define_pub_method(class, "$contains", vec::contains, Some(1));
        vm.define_pub_method(class, "index_of", vec::index_of, Some(1));
        vm.define_pub_method(class, "copy", vec::copy, Some(0));
        vm.define_pub_method(class, "slice", vec::slice, None);
        vm.define_pub_method(class, "join", vec::join, None);
        vm.define_pub_method(class, "map", vec::map, Some(1));
        vm.define_pub_method(class, "filter", vec::filter, Some(1));
        vm.define_pub_method(class, "sort", vec::sort, Some(0));
        vm.define_pub_method(class, "is_sorted", vec::is_sorted, Some(0));
        vm.define_pub_method(class, "remove_first", vec::remove_first, Some(0));
        vm.define_pub_method(class, "remove_last", vec::remove_last, Some(0));
        vm.define_pub_method(class, "remove_at", vec::remove_at, Some(1));
        vm.define_pub_method(class, "insert_at", vec::insert_at, Some(2));
    }
    let vec_class = vm.builtin_class(ObjKind::Vec);
    vm.define_pub_method(vec_class, "append", vec::append, Some(1));
    let stack_class = vm.builtin_class(ObjKind::VecAsStack);
    vm.define_pub_method(stack_class, "push", vec::push, Some(1));
    vm.define_pub_method(stack_class, "pop", vec::pop, Some(0));
}

fn install_map(vm: &mut Vm) {
    for class in [vm.builtin_class(ObjKind::Map), vm.builtin_class(ObjKind::MapAsSet), vm.builtin_class(ObjKind::MapAsWeakref)] {
        vm.define_pub_method(class, "count", map::count, Some(0));
        vm.define_pub_method(class, "is_empty", map::is_empty, Some(0));
        vm.define_pub_method(class, "contains", map::contains, Some(1));
        vm.define_pub_method(class, "$contains", map::contains, Some(1));
        vm.define_pub_method(class, "get", map::get, Some(1));
        vm.define_pub_method(class, "set", map::set, Some(2));
        vm.define_pub_method(class, "remove", map::remove, Some(1));
        vm.define_pub_method(class, "clear", map::clear, Some(0));
        vm.define_pub_method(class, "keys", map::keys, Some(0));
        vm.define_pub_method(class, "values", map::values, Some(0));
        vm.define_pub_method(class, "copy", map::copy, Some(0));
    }
    let set_class = vm.builtin_class(ObjKind::MapAsSet);
    vm.define_pub_method(set_class, "add", map::add, Some(1));
}

fn install_str(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::Str);
    vm.define_pub_method(class, "count", str::count, Some(0));
    vm.define_pub_method(class, "byte_count", str::byte_count, Some(0));
    vm.define_pub_method(class, "is_empty", str::is_empty, Some(0));
    vm.define_pub_method(class, "contains", str::contains, Some(1));
    vm.define_pub_method(class, "$contains", str::contains, Some(1));
    vm.define_pub_method(class, "starts_with", str::starts_with, Some(1));
    vm.define_pub_method(class, "ends_with", str::ends_with, Some(1));
    vm.define_pub_method(class, "index_of", str::index_of, Some(1));
    vm.define_pub_method(class, "to_upper", str::to_upper, Some(0));
    vm.define_pub_method(class, "to_lower", str::to_lower, Some(0));
    vm.define_pub_method(class, "strip", str::strip, Some(0));
    vm.define_pub_method(class, "strip_prefix", str::strip_prefix, Some(1));
    vm.define_pub_method(class, "strip_suffix", str::strip_suffix, Some(1));
    vm.define_pub_method(class, "split", str::split, Some(1));
    vm.define_pub_method(class, "slice", str::slice, None);
    vm.define_pub_method(class, "repeat", str::repeat, Some(1));
    vm.define_pub_method(class, "to_i64", str::to_i64, Some(0));
    vm.define_pub_method(class, "to_f64", str::to_f64, Some(0));
}

fn install_tup(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::Tup);
    vm.define_pub_method(class, "count", tup::count, Some(0));
    vm.define_pub_method(class, "get", tup::get, Some(1));
    vm.define_pub_method(class, "contains", tup::contains, Some(1));
    vm.define_pub_method(class, "$contains", tup::contains, Some(1));
    vm.define_pub_method(class, "to_vec", tup::to_vec, Some(0));
}

fn install_buf(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::Buf);
    vm.define_pub_method(class, "count", buf::count, Some(0));
    vm.define_pub_method(class, "is_empty", buf::is_empty, Some(0));
    vm.define_pub_method(class, "get_byte", buf::get_byte, Some(1));
    vm.define_pub_method(class, "write_byte", buf::write_byte, Some(1));
    vm.define_pub_method(class, "to_str", buf::to_str, Some(0));
    vm.define_pub_method(class, "clear", buf::clear, Some(0));
}

fn install_iter(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::Iter);
    vm.define_pub_method(class, "to_vec", iter::to_vec, Some(0));
    vm.define_pub_method(class, "to_set", iter::to_set, Some(0));
    vm.define_pub_method(class, "count", iter::count, Some(0));
    vm.define_pub_method(class, "sum", iter::sum, Some(0));
    vm.define_pub_method(class, "reduce", iter::reduce, Some(1));
    vm.define_pub_method(class, "join", iter::join, None);
    vm.define_pub_method(class, "map", iter::map, Some(1));
    vm.define_pub_method(class, "filter", iter::filter, Some(1));
    vm.define_pub_method(class, "enumerate", iter::enumerate, Some(0));
    vm.define_pub_method(class, "skip_first", iter::skip_first, Some(1));
    vm.define_pub_method(class, "skip_last", iter::skip_last, Some(1));
    vm.define_pub_method(class, "next", iter::next, Some(0));
}

fn install_queue(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::Queue);
    vm.define_pub_method(class, "count", queue::count, Some(0));
    vm.define_pub_method(class, "is_empty", queue::is_empty, Some(0));
    vm.define_pub_method(class, "push", queue::push, Some(1));
    vm.define_pub_method(class, "pop", queue::pop, Some(0));
}

fn install_file(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::File);
    vm.define_pub_method(class, "close", file::close, Some(0));
    vm.define_pub_method(class, "flush", file::flush, Some(0));
    vm.define_pub_method(class, "read", file::read, Some(0));
    vm.define_pub_method(class, "read_string", file::read_string, Some(0));
    vm.define_pub_method(class, "read_line", file::read_line, Some(0));
    vm.define_pub_method(class, "read_byte", file::read_byte, Some(0));
    vm.define_pub_method(class, "read_bytes", file::read_bytes, Some(1));
    vm.define_pub_method(class, "write", file::write, Some(1));
    vm.define_pub_method(class, "write_byte", file::write_byte, Some(1));
    vm.define_pub_method(class, "lines", file::lines, Some(0));
}

fn install_err(vm: &mut Vm) {
    let class = vm.builtin_class(ObjKind::Err);
    vm.define_pub_method(class, "message", err::message, Some(0));
    vm.define_pub_method(class, "details", err::details, Some(0));
    vm.define_pub_method(class, "$get_index", err::get_index, Some(1));
    vm.define_pub_method(class, "$set_index", err::set_index, Some(2));
}

fn install_char(vm: &mut Vm) {
    let class = vm.char_class();
    vm.define_pub_method(class, "is_ascii", char::is_ascii, Some(0));
    vm.define_pub_method(class, "is_ascii_ws", char::is_ascii_ws, Some(0));
    vm.define_pub_method(class, "is_unicode_ws", char::is_unicode_ws, Some(0));
    vm.define_pub_method(class, "is_ascii_decimal", char::is_ascii_decimal, Some(0));
    vm.define_pub_method(class, "is_ascii_octal", char::is_ascii_octal, Some(0));
    vm.define_pub_method(class, "is_ascii_hex", char::is_ascii_hex, Some(0));
    vm.define_pub_method(class, "to_ascii_upper", char::to_ascii_upper, Some(0));
    vm.define_pub_method(class, "to_ascii_lower", char::to_ascii_lower, Some(0));
    vm.define_pub_method(class, "to_str", char::to_str, Some(0));
}

fn install_globals(vm: &mut Vm) {
    vm.define_superglobal_fn("$print", globals::print, None);
    vm.define_superglobal_fn("$println", globals::println, None);
    vm.define_superglobal_fn("$eprint", globals::eprint, None);
    vm.define_superglobal_fn("$eprintln", globals::eprintln, None);
    vm.define_superglobal_fn("$type", globals::type_of, Some(1));
    vm.define_superglobal_fn("$is_callable", globals::is_callable, Some(1));
    vm.define_superglobal_fn("$is_err", globals::is_err, Some(1));
    vm.define_superglobal_fn("$panic", globals::panic, None);
    vm.define_superglobal_fn("$hash", globals::hash, Some(1));
    vm.define_superglobal_fn("$range", globals::range, None);
    vm.define_superglobal_fn("$clock", globals::clock, Some(0));
    vm.define_superglobal_fn("$vec", globals::vec, None);
    vm.define_superglobal_fn("$stack", globals::stack, Some(0));
    vm.define_superglobal_fn("$map", globals::map, Some(0));
    vm.define_superglobal_fn("$set", globals::set, None);
    vm.define_superglobal_fn("$err", globals::err, None);
}
