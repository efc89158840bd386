//! vm.rs — the stack machine itself (§4.8).
//!
//! [`Vm`] owns the heap, the value stack, the call-frame stack, the chain of
//! open upvalues, and the `with`-stack, and its [`Vm::step`] dispatch loop
//! executes every [`Op`] the compiler emits. Grounded throughout on the
//! original `inc/vm.h`'s `PyroVM`/`CallFrame` shapes — translated field by
//! field in the doc comments below — cross-checked against
//! `pyro_compiler::compiler`'s actual emission contract, which is the
//! ground truth for what bytecode this loop receives.
//!
//! GC roots (the value stack, frames, `with`-stack, caches of canned
//! `ObjRef`s) live in [`VmRoots`], a sibling field to `heap`/`strings`/`gc`
//! rather than on `Vm` directly — `Gc::collect` needs `&mut Heap` and
//! `&dyn Roots` at the same time, and a single `impl Roots for Vm` would
//! make every field borrow through `&self`, conflicting with `&mut
//! self.heap`. Splitting the root set out is the standard shape for a
//! self-referential arena-GC'd interpreter in safe Rust.

use std::path::PathBuf;

use ahash::AHashMap;

use pyro_core::bytecode::{decode_one, Op};
use pyro_core::gc::{Gc, Roots};
use pyro_core::heap::{Heap, ObjRef};
use pyro_core::native::NativeContext;
use pyro_core::object::{
    BoundMethodObj, ClassObj, ClosureObj, ErrObj, FileHandle, FileObj, HeapObject, InstanceObj, IterObj,
    IterSource, MapEntry, MapObj, ModuleObj, ObjKind, ObjPayload, TupObj, UpvalueDesc, UpvalueObj,
    UpvalueState, VecObj,
};
use pyro_core::strings::StringPool;
use pyro_core::value::Value;

use crate::error::{VmError, VmResult};
use crate::frame::CallFrame;
use crate::imports::{self, ImportError};
use crate::operators;

/// Hard ceiling on the value stack, matching §4.8's "bounded, preallocated"
/// framing — a runaway recursive function panics rather than exhausting the
/// host process's memory.
const STACK_MAX: usize = 1 << 20;
/// Hard ceiling on call-frame nesting.
const FRAMES_MAX: usize = 4096;

/// Every protocol/operator method name the VM looks up by name at runtime,
/// interned once at startup so each lookup is a cheap `ObjRef` hash rather
/// than a fresh `intern()` call.
const PROTOCOL_NAMES: &[&str] = &[
    "$iter", "$next", "$end_with", "$init", "$call", "$get", "$set", "$contains", "$fmt", "$str",
    "$op_binary_plus", "$op_binary_minus", "$op_binary_star", "$op_binary_slash", "$op_binary_slash_slash",
    "$op_binary_percent", "$op_binary_star_star", "$op_binary_amp", "$op_binary_bar", "$op_binary_caret",
    "$op_binary_less_less", "$op_binary_greater_greater", "$op_binary_less", "$op_binary_less_equals",
    "$op_binary_greater", "$op_binary_greater_equals", "$op_binary_equals_equals",
    "$rop_binary_plus", "$rop_binary_minus", "$rop_binary_star", "$rop_binary_slash", "$rop_binary_slash_slash",
    "$rop_binary_percent", "$rop_binary_star_star", "$rop_binary_amp", "$rop_binary_bar", "$rop_binary_caret",
    "$rop_binary_less_less", "$rop_binary_greater_greater",
    "$op_unary_minus", "$op_unary_plus",
    "source", "line",
];

/// The GC root set, split out from `Vm` so `Gc::collect` can borrow it
/// disjointly from `heap`/`strings`/`gc` (see the module doc comment).
/// Mirrors `inc/vm.h`'s `stack`/`stack_top`, `frames`/`frame_count`,
/// `open_upvalues`, `with_stack`/`with_stack_count`, `superglobals`,
/// `modules`, canned objects (`empty_string`, the protocol-name cache), and
/// `stdout_file`/`stderr_file`/`stdin_file`.
struct VmRoots {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, ordered by descending `stack_index` (clox's convention:
    /// the head is always the upvalue closest to the stack top), so closing
    /// everything at or above a given index is a prefix scan.
    open_upvalues: Vec<ObjRef>,
    with_stack: Vec<Value>,
    superglobals: AHashMap<ObjRef, Value>,
    module_cache: AHashMap<String, Value>,
    builtin_classes: AHashMap<ObjKind, ObjRef>,
    char_class: ObjRef,
    empty_string: ObjRef,
    names: AHashMap<&'static str, ObjRef>,
    stdin: ObjRef,
    stdout: ObjRef,
    stderr: ObjRef,
    panic_source: Option<ObjRef>,
}

impl Roots for VmRoots {
    fn trace_roots(&self, push: &mut dyn FnMut(ObjRef)) {
        for v in &self.stack {
            if let Value::Obj(r) = v {
                push(*r);
            }
        }
        for v in &self.with_stack {
            if let Value::Obj(r) = v {
                push(*r);
            }
        }
        for f in &self.frames {
            push(f.closure);
        }
        for u in &self.open_upvalues {
            push(*u);
        }
        for v in self.superglobals.values() {
            if let Value::Obj(r) = v {
                push(*r);
            }
        }
        for v in self.module_cache.values() {
            if let Value::Obj(r) = v {
                push(*r);
            }
        }
        for r in self.builtin_classes.values() {
            push(*r);
        }
        push(self.char_class);
        push(self.empty_string);
        for r in self.names.values() {
            push(*r);
        }
        push(self.stdin);
        push(self.stdout);
        push(self.stderr);
        if let Some(r) = self.panic_source {
            push(r);
        }
    }
}

/// The builtin classes every `ObjKind` with user-visible methods gets at
/// startup (§4.10's "Built-in classes"). `pyro-stdlib` populates their
/// method tables; `pyro-vm` just owns the empty shells so method dispatch
/// has somewhere to look.
const BUILTIN_CLASS_KINDS: &[ObjKind] = &[
    ObjKind::Str,
    ObjKind::Map,
    ObjKind::MapAsSet,
    ObjKind::MapAsWeakref,
    ObjKind::Vec,
    ObjKind::VecAsStack,
    ObjKind::Tup,
    ObjKind::Buf,
    ObjKind::Iter,
    ObjKind::Queue,
    ObjKind::File,
    ObjKind::Err,
    ObjKind::Module,
];

pub struct Vm {
    pub heap: Heap,
    pub strings: StringPool,
    gc: Gc,
    roots: VmRoots,

    pub import_roots: Vec<PathBuf>,
    pub args: Vec<String>,

    panic_flag: bool,
    panic_count: u64,
    panic_buffer: String,
    panic_line: u32,
    try_depth: u32,
    exit_flag: bool,
    exit_code: i32,
    /// True while running under a REPL host; changes `PopEchoInRepl`'s
    /// behaviour from a plain `Pop` to an auto-print.
    pub repl_mode: bool,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut strings = StringPool::new();

        let mut builtin_classes = AHashMap::new();
        for kind in BUILTIN_CLASS_KINDS {
            let class = ClassObj::new(format!("{kind:?}"));
            let r = heap.alloc(HeapObject::new(ObjPayload::Class(class))).expect("out of memory during VM initialisation");
            builtin_classes.insert(*kind, r);
        }
        let char_class = {
            let class = ClassObj::new("char".to_string());
            heap.alloc(HeapObject::new(ObjPayload::Class(class))).expect("out of memory during VM initialisation")
        };
        let empty_string = strings.intern(&mut heap, "").expect("out of memory during VM initialisation");

        let mut names = AHashMap::new();
        for n in PROTOCOL_NAMES {
            let r = strings.intern(&mut heap, n).expect("out of memory during VM initialisation");
            names.insert(*n, r);
        }

        let stdin = heap
            .alloc(HeapObject::new(ObjPayload::File(FileObj { path: None, handle: FileHandle::Stdin, cursor: 0 })))
            .expect("out of memory during VM initialisation");
        let stdout = heap
            .alloc(HeapObject::new(ObjPayload::File(FileObj { path: None, handle: FileHandle::Stdout, cursor: 0 })))
            .expect("out of memory during VM initialisation");
        let stderr = heap
            .alloc(HeapObject::new(ObjPayload::File(FileObj { path: None, handle: FileHandle::Stderr, cursor: 0 })))
            .expect("out of memory during VM initialisation");

        Self {
            heap,
            strings,
            gc: Gc::new(),
            roots: VmRoots {
                stack: Vec::with_capacity(1024),
                frames: Vec::with_capacity(64),
                open_upvalues: Vec::new(),
                with_stack: Vec::new(),
                superglobals: AHashMap::new(),
                module_cache: AHashMap::new(),
                builtin_classes,
                char_class,
                empty_string,
                names,
                stdin,
                stdout,
                stderr,
                panic_source: None,
            },
            import_roots: Vec::new(),
            args: Vec::new(),
            panic_flag: false,
            panic_count: 0,
            panic_buffer: String::new(),
            panic_line: 0,
            try_depth: 0,
            exit_flag: false,
            exit_code: 0,
            repl_mode: false,
        }
    }

    pub fn panicked(&self) -> bool {
        self.panic_flag
    }

    pub fn panic_message(&self) -> &str {
        &self.panic_buffer
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    // -- host-registration API (§6) ---------------------------------------

    pub fn set_stdin(&mut self, path: std::path::PathBuf) {
        self.roots.stdin = self.alloc_file_handle(path);
    }

    pub fn set_stdout(&mut self, path: std::path::PathBuf) {
        self.roots.stdout = self.alloc_file_handle(path);
    }

    pub fn set_stderr(&mut self, path: std::path::PathBuf) {
        self.roots.stderr = self.alloc_file_handle(path);
    }

    fn alloc_file_handle(&mut self, path: std::path::PathBuf) -> ObjRef {
        let current = self.roots.stdin;
        let obj = HeapObject::new(ObjPayload::File(FileObj { path: Some(path.display().to_string()), handle: FileHandle::Path(path), cursor: 0 }));
        self.heap.alloc(obj).unwrap_or(current)
    }

    pub fn append_import_root(&mut self, root: PathBuf) {
        self.import_roots.push(root);
    }

    pub fn append_arg(&mut self, arg: String) {
        self.args.push(arg);
    }

    pub fn set_max_memory(&mut self, bytes: usize) {
        self.heap.next_gc_threshold = bytes;
    }

    pub fn define_superglobal(&mut self, name: &str, value: Value) {
        let key = self.intern(name);
        self.roots.superglobals.insert(key, value);
    }

    pub fn define_superglobal_fn(&mut self, name: &str, func: pyro_core::object::NativeFnPtr, arity: Option<u8>) {
        let value = self.alloc_native_fn(name, func, arity);
        self.define_superglobal(name, value);
    }

    fn alloc_native_fn(&mut self, name: &str, func: pyro_core::object::NativeFnPtr, arity: Option<u8>) -> Value {
        let obj = HeapObject::new(ObjPayload::NativeFn(pyro_core::object::NativeFnObj { name: name.to_string(), arity, func }));
        self.alloc(obj).map(Value::Obj).unwrap_or(Value::Null)
    }

    /// Registers (or fetches, if already registered) a native module at
    /// `dotted_path`, cached exactly the way a source-file import would be,
    /// so `import a::b::c;` resolves to host-provided members without ever
    /// touching the filesystem (§6, §4.9).
    pub fn register_native_module(&mut self, dotted_path: &[&str]) -> ObjRef {
        let cache_key = dotted_path.join("::");
        if let Some(v) = self.roots.module_cache.get(&cache_key) {
            return v.as_obj().expect("cached module must be an object");
        }
        let module_ref = self.alloc(HeapObject::new(ObjPayload::Module(ModuleObj::new()))).expect("out of memory registering a native module");
        self.roots.module_cache.insert(cache_key, Value::Obj(module_ref));
        module_ref
    }

    pub fn define_pub_member(&mut self, module: ObjRef, name: &str, value: Value) {
        self.define_member(module, name, value, true);
    }

    pub fn define_pri_member(&mut self, module: ObjRef, name: &str, value: Value) {
        self.define_member(module, name, value, false);
    }

    fn define_member(&mut self, module: ObjRef, name: &str, value: Value, is_pub: bool) {
        let key = self.intern(name);
        let m = self.module_obj_mut(module);
        if let Some(&i) = m.all_member_indexes.get(&key) {
            m.members[i] = value;
            if is_pub {
                m.pub_member_indexes.insert(key, i);
            }
            return;
        }
        let i = m.members.len();
        m.members.push(value);
        m.all_member_indexes.insert(key, i);
        if is_pub {
            m.pub_member_indexes.insert(key, i);
        }
    }

    pub fn define_pub_member_fn(&mut self, module: ObjRef, name: &str, func: pyro_core::object::NativeFnPtr, arity: Option<u8>) {
        let value = self.alloc_native_fn(name, func, arity);
        self.define_pub_member(module, name, value);
    }

    pub fn define_pri_member_fn(&mut self, module: ObjRef, name: &str, func: pyro_core::object::NativeFnPtr, arity: Option<u8>) {
        let value = self.alloc_native_fn(name, func, arity);
        self.define_pri_member(module, name, value);
    }

    /// Accessor for the empty-shell built-in class created at startup for
    /// `kind` (§4.10) — `pyro-stdlib` attaches real method tables to these.
    pub fn builtin_class(&self, kind: ObjKind) -> ObjRef {
        self.roots.builtin_classes[&kind]
    }

    /// The `char` pseudo-class: runes have no `ObjKind` of their own (they
    /// aren't heap objects), so it isn't reachable through `builtin_class`.
    pub fn char_class(&self) -> ObjRef {
        self.roots.char_class
    }

    pub fn define_pub_method(&mut self, class: ObjRef, name: &str, func: pyro_core::object::NativeFnPtr, arity: Option<u8>) {
        let value = self.alloc_native_fn(name, func, arity);
        self.define_class_method(class, name, value, true);
    }

    pub fn define_pri_method(&mut self, class: ObjRef, name: &str, func: pyro_core::object::NativeFnPtr, arity: Option<u8>) {
        let value = self.alloc_native_fn(name, func, arity);
        self.define_class_method(class, name, value, false);
    }

    fn define_class_method(&mut self, class: ObjRef, name: &str, value: Value, is_pub: bool) {
        let key = self.intern(name);
        let is_init = name == "$init";
        match &mut self.heap.get_mut(class).payload {
            ObjPayload::Class(c) => {
                c.all_instance_methods.insert(key, value);
                if is_pub {
                    c.pub_instance_methods.insert(key, value);
                }
                if is_init {
                    c.init_method = Some(value);
                }
            }
            _ => panic!("define_pub_method/define_pri_method target must be a class"),
        }
    }

    pub fn define_pub_field(&mut self, class: ObjRef, name: &str, default_value: Value) {
        self.define_class_field(class, name, default_value, true);
    }

    pub fn define_pri_field(&mut self, class: ObjRef, name: &str, default_value: Value) {
        self.define_class_field(class, name, default_value, false);
    }

    fn define_class_field(&mut self, class: ObjRef, name: &str, default_value: Value, is_pub: bool) {
        let key = self.intern(name);
        match &mut self.heap.get_mut(class).payload {
            ObjPayload::Class(c) => {
                let idx = c.default_field_values.len();
                c.default_field_values.push(default_value);
                c.all_field_indexes.insert(key, idx);
                if is_pub {
                    c.pub_field_indexes.insert(key, idx);
                }
            }
            _ => panic!("define_pub_field/define_pri_field target must be a class"),
        }
    }

    // -- GC -----------------------------------------------------------------

    fn with_gc_disabled<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.heap.gc_disallows += 1;
        let result = f(self);
        self.heap.gc_disallows -= 1;
        result
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        match self.gc.collect(&mut self.heap, &self.roots, &mut self.strings) {
            Ok(_stats) => {}
            Err(_) => {
                self.heap.allocation_failed = true;
                self.panic("out of memory".to_string());
            }
        }
    }

    /// The single allocation entry point every opcode handler uses. Returns
    /// `None` (after raising a panic) on failure — callers must tolerate a
    /// `None` and bail out of the current instruction, per §4.5.
    fn alloc(&mut self, obj: HeapObject) -> Option<ObjRef> {
        self.maybe_collect();
        match self.heap.alloc(obj) {
            Ok(r) => Some(r),
            Err(_) => {
                self.panic("out of memory".to_string());
                None
            }
        }
    }

    fn intern_str(&mut self, s: &str) -> Option<ObjRef> {
        match self.strings.intern(&mut self.heap, s) {
            Ok(r) => Some(r),
            Err(_) => {
                self.panic("out of memory".to_string());
                None
            }
        }
    }

    // -- stack primitives -----------------------------------------------------

    fn push(&mut self, v: Value) {
        if self.roots.stack.len() >= STACK_MAX {
            self.panic("stack overflow".to_string());
            return;
        }
        self.roots.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.roots.stack.pop().expect("stack underflow: miscompiled bytecode")
    }

    fn peek(&self, distance: usize) -> Value {
        let len = self.roots.stack.len();
        self.roots.stack[len - 1 - distance]
    }

    fn name(&self, key: &'static str) -> ObjRef {
        self.roots.names[key]
    }

    fn const_name(&self, idx: u16) -> ObjRef {
        let v = self.current_fn_obj().constants[idx as usize];
        v.as_obj().expect("constant-pool name index must resolve to an interned string")
    }

    fn current_closure_ref(&self) -> ObjRef {
        self.roots.frames.last().expect("no active frame").closure
    }

    fn current_closure(&self) -> &ClosureObj {
        match &self.heap.get(self.current_closure_ref()).payload {
            ObjPayload::Closure(c) => c,
            _ => unreachable!("active frame's closure slot holds a non-Closure object"),
        }
    }

    fn current_fn_obj(&self) -> &pyro_core::object::FnObj {
        let fn_ref = self.current_closure().function;
        match &self.heap.get(fn_ref).payload {
            ObjPayload::Fn(f) => f,
            _ => unreachable!("closure's function slot holds a non-Fn object"),
        }
    }

    fn current_module(&self) -> ObjRef {
        self.current_closure().module
    }

    fn current_line(&self) -> u32 {
        let frame = self.roots.frames.last().expect("no active frame");
        self.current_fn_obj().lines.line_for(frame.ip)
    }

    // -- the dispatch loop ----------------------------------------------------

    /// Runs until the frame stack depth returns to `target` (normal return)
    /// or a *new* panic is raised during this call (tracked via the
    /// `panic_count` delta rather than `halt_flag`, so a forced nested call —
    /// `$end_with` during unwind, a `try`-wrapped closure — still executes
    /// even while an *outer* panic is already pending).
    fn run_until_frame_count(&mut self, target: usize) -> VmResult<()> {
        let panics_before = self.panic_count;
        while self.roots.frames.len() > target {
            if self.panic_count > panics_before || self.exit_flag {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> VmResult<()> {
        let frame_idx = self.roots.frames.len() - 1;
        let ip = self.roots.frames[frame_idx].ip;
        let (op, next_ip) = decode_one(&self.current_fn_obj().code, ip)?;
        self.roots.frames[frame_idx].ip = next_ip;
        let line = self.current_fn_obj().lines.line_for(ip);
        self.dispatch(op, line);
        Ok(())
    }

    fn jump_target(&self, next_ip: usize, forward_offset: u16) -> usize {
        next_ip + forward_offset as usize
    }

    fn jump_back_target(&self, next_ip: usize, backward_offset: u16) -> usize {
        next_ip - backward_offset as usize
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, op: Op, line: u32) {
        let frame_idx = self.roots.frames.len() - 1;
        let next_ip = self.roots.frames[frame_idx].ip;

        match op {
            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let v = self.peek(0);
                self.push(v);
            }
            Op::Dup2 => {
                let b = self.peek(0);
                let a = self.peek(1);
                self.push(a);
                self.push(b);
            }
            Op::PopEchoInRepl => {
                let v = self.pop();
                if self.repl_mode && !v.is_null() {
                    let s = self.stringify_value(v);
                    println!("{s}");
                }
            }

            Op::LoadNull => self.push(Value::Null),
            Op::LoadTrue => self.push(Value::Bool(true)),
            Op::LoadFalse => self.push(Value::Bool(false)),
            Op::LoadI64Small(n) => self.push(Value::I64(n as i64)),
            Op::LoadConstant(idx) => {
                let v = self.current_fn_obj().constants[idx as usize];
                self.push(v);
            }
            Op::LoadConstantSmall(idx) => {
                let v = self.current_fn_obj().constants[idx as usize];
                self.push(v);
            }

            Op::GetLocal(i) => {
                let fp = self.roots.frames[frame_idx].fp;
                let v = self.roots.stack[fp + i as usize];
                self.push(v);
            }
            Op::SetLocal(i) => {
                let fp = self.roots.frames[frame_idx].fp;
                let v = self.peek(0);
                self.roots.stack[fp + i as usize] = v;
            }
            Op::GetUpvalue(i) => {
                let up_ref = self.current_closure().upvalues[i as usize];
                let v = self.read_upvalue(up_ref);
                self.push(v);
            }
            Op::SetUpvalue(i) => {
                let up_ref = self.current_closure().upvalues[i as usize];
                let v = self.peek(0);
                self.write_upvalue(up_ref, v);
            }
            Op::CloseUpvalue => {
                let idx = self.roots.stack.len() - 1;
                self.close_upvalues_from(idx);
                self.pop();
            }
            Op::GetGlobal(idx) => self.get_global(idx),
            Op::SetGlobal(idx) => self.set_global(idx),
            Op::DefinePubGlobal(idx) => self.define_global(idx, true),
            Op::DefinePriGlobal(idx) => self.define_global(idx, false),

            Op::BinaryPlus
            | Op::BinaryMinus
            | Op::BinaryStar
            | Op::BinarySlash
            | Op::BinarySlashSlash
            | Op::BinaryPercent
            | Op::BinaryStarStar
            | Op::BinaryAmp
            | Op::BinaryBar
            | Op::BinaryCaret
            | Op::BinaryLessLess
            | Op::BinaryGreaterGreater
            | Op::I64Add
            | Op::BinaryLess
            | Op::BinaryLessEqual
            | Op::BinaryGreater
            | Op::BinaryGreaterEqual
            | Op::BinaryEqualEqual
            | Op::BinaryBangEqual
            | Op::BinaryIn => self.binary_op(op),

            Op::UnaryMinus | Op::UnaryPlus | Op::UnaryBang | Op::UnaryTilde => self.unary_op(op),

            Op::Jump(off) => self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off),
            Op::JumpBack(off) => self.roots.frames[frame_idx].ip = self.jump_back_target(next_ip, off),
            Op::JumpIfTrue(off) => {
                if !self.peek(0).is_falsey() {
                    self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off);
                }
            }
            Op::JumpIfFalse(off) => {
                if self.peek(0).is_falsey() {
                    self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off);
                }
            }
            Op::JumpIfErr(off) => {
                if self.is_err_value(self.peek(0)) {
                    self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off);
                }
            }
            Op::JumpIfNotErr(off) => {
                if !self.is_err_value(self.peek(0)) {
                    self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off);
                }
            }
            Op::JumpIfNotNull(off) => {
                if !self.peek(0).is_null() {
                    self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off);
                }
            }
            Op::PopJumpIfFalse(off) => {
                let v = self.pop();
                if v.is_falsey() {
                    self.roots.frames[frame_idx].ip = self.jump_target(next_ip, off);
                }
            }
            Op::Break => unreachable!("BREAK must be rewritten to JUMP by the compiler before the VM ever sees it"),

            Op::CallValue(argc) => {
                let callee = self.peek(argc as usize);
                self.invoke(callee, argc);
            }
            Op::CallValueWithUnpack(argc) => {
                let argc = self.spread_last_arg(argc);
                let callee = self.peek(argc as usize);
                self.invoke(callee, argc);
            }
            Op::CallMethod(name_idx, argc) => self.dispatch_method_call(name_idx, argc, true, false),
            Op::CallMethodWithUnpack(name_idx, argc) => {
                let argc = self.spread_last_arg(argc);
                self.dispatch_method_call(name_idx, argc, true, false);
            }
            Op::CallPubMethod(name_idx, argc) => self.dispatch_method_call(name_idx, argc, false, false),
            Op::CallPubMethodWithUnpack(name_idx, argc) => {
                let argc = self.spread_last_arg(argc);
                self.dispatch_method_call(name_idx, argc, false, false);
            }
            Op::CallSuperMethod(name_idx, argc) => self.dispatch_method_call(name_idx, argc, true, true),
            Op::CallSuperMethodWithUnpack(name_idx, argc) => {
                let argc = self.spread_last_arg(argc);
                self.dispatch_method_call(name_idx, argc, true, true);
            }
            Op::Return => self.do_return(1, line),
            Op::ReturnTuple(n) => self.do_return(n as usize, line),

            Op::MakeClass(name_idx) => self.make_class(name_idx),
            Op::Inherit => self.inherit(),
            Op::DefinePubMethod(name_idx) => self.define_method(name_idx, true, false),
            Op::DefinePriMethod(name_idx) => self.define_method(name_idx, false, false),
            Op::DefineStaticMethod(name_idx) => self.define_method(name_idx, false, true),
            Op::DefinePubField(name_idx) => self.define_field(name_idx, true, false),
            Op::DefinePriField(name_idx) => self.define_field(name_idx, false, false),
            Op::DefineStaticField(name_idx) => self.define_field(name_idx, false, true),
            Op::GetField(name_idx) => self.get_field(name_idx, false, false),
            Op::GetPubField(name_idx) => self.get_field(name_idx, true, false),
            Op::GetMethod(name_idx) => self.get_field(name_idx, false, true),
            Op::GetPubMethod(name_idx) => self.get_field(name_idx, true, true),
            Op::GetSuperMethod(name_idx) => self.get_super_method(name_idx),
            Op::SetField(name_idx) => self.set_field(name_idx, false),
            Op::SetPubField(name_idx) => self.set_field(name_idx, true),

            Op::ImportModule(n) => self.import_module(n),
            Op::ImportNamedMembers(n_seg, n_names) => self.import_named_members(n_seg, n_names),
            Op::ImportAllMembers(n) => self.import_all_members(n),
            Op::GetMember(name_idx) => self.get_member(name_idx),

            Op::MakeMap(n) => self.make_map(n, false),
            Op::MakeSet(n) => self.make_set(n),
            Op::MakeVec(n) => self.make_vec(n, false),
            Op::MakeTup(n) => self.make_tup(n),
            Op::MakeEnum(name_idx, n) => self.make_enum(name_idx, n),
            Op::MakeClosure(fn_idx) => self.make_closure(fn_idx, 0),
            Op::MakeClosureWithDefArgs(fn_idx, n_defaults) => self.make_closure(fn_idx, n_defaults),
            Op::ConcatStrings(n) => self.concat_strings(n),
            Op::Stringify => {
                let v = self.pop();
                let s = self.stringify_value(v);
                if let Some(r) = self.intern_str(&s) {
                    self.push(Value::Obj(r));
                }
            }
            Op::Format => self.format_value(),

            Op::GetIterator => self.get_iterator(),
            Op::GetNextFromIterator => self.get_next_from_iterator(),

            Op::StartWith => {
                let v = self.peek(0);
                self.roots.with_stack.push(v);
            }
            Op::EndWith => {
                if let Some(v) = self.roots.with_stack.pop() {
                    self.call_end_with(v);
                }
            }

            Op::Echo(n) => self.echo(n),
            Op::Assert => self.assert(line),
            Op::Try => self.try_op(),
            Op::Unpack(n) => self.unpack(n),
            Op::GetIndex => self.get_index(),
            Op::SetIndex => self.set_index(),
        }
    }

    // -- panics -----------------------------------------------------------

    pub fn panic(&mut self, message: String) {
        self.panic_count += 1;
        if self.panic_flag {
            return; // absorbed: only the first panic in a sequence is kept
        }
        self.panic_flag = true;
        if self.try_depth == 0 {
            self.exit_code = 1;
            eprintln!("panic: {message}");
        }
        self.panic_buffer = message;
        if let Some(frame) = self.roots.frames.last() {
            self.panic_line = self.current_fn_obj().lines.line_for(frame.ip);
            self.panic_source = Some(self.current_fn_obj().source_id);
        }
    }

    // -- globals --------------------------------------------------------------

    fn module_obj_mut(&mut self, module_ref: ObjRef) -> &mut ModuleObj {
        match &mut self.heap.get_mut(module_ref).payload {
            ObjPayload::Module(m) => m,
            _ => unreachable!("closure's module slot holds a non-Module object"),
        }
    }

    fn get_global(&mut self, idx: u16) {
        let name = self.const_name(idx);
        let module_ref = self.current_module();
        let module = match &self.heap.get(module_ref).payload {
            ObjPayload::Module(m) => m,
            _ => unreachable!(),
        };
        if let Some(&i) = module.all_member_indexes.get(&name) {
            let v = module.members[i];
            self.push(v);
            return;
        }
        if let Some(v) = self.roots.superglobals.get(&name).copied() {
            self.push(v);
            return;
        }
        self.panic(format!("undefined variable '{}'", self.str_contents(name)));
    }

    fn set_global(&mut self, idx: u16) {
        let name = self.const_name(idx);
        let v = self.peek(0);
        let module_ref = self.current_module();
        let module = self.module_obj_mut(module_ref);
        if let Some(&i) = module.all_member_indexes.get(&name) {
            module.members[i] = v;
            return;
        }
        self.panic(format!("undefined variable '{}'", self.str_contents(name)));
    }

    fn define_global(&mut self, idx: u16, is_pub: bool) {
        let name = self.const_name(idx);
        let v = self.pop();
        let module_ref = self.current_module();
        let module = self.module_obj_mut(module_ref);
        if let Some(&i) = module.all_member_indexes.get(&name) {
            module.members[i] = v;
            if is_pub {
                module.pub_member_indexes.insert(name, i);
            }
            return;
        }
        let i = module.members.len();
        module.members.push(v);
        module.all_member_indexes.insert(name, i);
        if is_pub {
            module.pub_member_indexes.insert(name, i);
        }
    }

    fn str_contents(&self, r: ObjRef) -> String {
        match &self.heap.get(r).payload {
            ObjPayload::Str(s) => s.bytes.to_string(),
            _ => format!("<obj #{}>", r.index()),
        }
    }

    // -- upvalues -------------------------------------------------------------

    fn read_upvalue(&self, up_ref: ObjRef) -> Value {
        match &self.heap.get(up_ref).payload {
            ObjPayload::Upvalue(u) => match u.state {
                UpvalueState::Open { stack_index } => self.roots.stack[stack_index],
                UpvalueState::Closed { value } => value,
            },
            _ => unreachable!("upvalue slot holds a non-Upvalue object"),
        }
    }

    fn write_upvalue(&mut self, up_ref: ObjRef, v: Value) {
        let stack_index = match &self.heap.get(up_ref).payload {
            ObjPayload::Upvalue(u) => match u.state {
                UpvalueState::Open { stack_index } => Some(stack_index),
                UpvalueState::Closed { .. } => None,
            },
            _ => unreachable!(),
        };
        match stack_index {
            Some(i) => self.roots.stack[i] = v,
            None => {
                if let ObjPayload::Upvalue(u) = &mut self.heap.get_mut(up_ref).payload {
                    u.state = UpvalueState::Closed { value: v };
                }
            }
        }
    }

    /// Finds an already-open upvalue at `stack_index`, or creates one.
    /// `open_upvalues` is kept sorted by descending `stack_index`.
    fn capture_upvalue(&mut self, stack_index: usize) -> Option<ObjRef> {
        for &r in &self.roots.open_upvalues {
            if let ObjPayload::Upvalue(u) = &self.heap.get(r).payload {
                if let UpvalueState::Open { stack_index: si } = u.state {
                    if si == stack_index {
                        return Some(r);
                    }
                    if si < stack_index {
                        break;
                    }
                }
            }
        }
        let r = self.alloc(HeapObject::new(ObjPayload::Upvalue(UpvalueObj { state: UpvalueState::Open { stack_index } })))?;
        let pos = self.roots.open_upvalues.iter().position(|&o| {
            matches!(&self.heap.get(o).payload, ObjPayload::Upvalue(u) if matches!(u.state, UpvalueState::Open{stack_index: si} if si < stack_index))
        });
        match pos {
            Some(i) => self.roots.open_upvalues.insert(i, r),
            None => self.roots.open_upvalues.push(r),
        }
        Some(r)
    }

    fn close_upvalues_from(&mut self, from_index: usize) {
        while let Some(&r) = self.roots.open_upvalues.first() {
            let stack_index = match &self.heap.get(r).payload {
                ObjPayload::Upvalue(u) => match u.state {
                    UpvalueState::Open { stack_index } => stack_index,
                    UpvalueState::Closed { .. } => break,
                },
                _ => unreachable!(),
            };
            if stack_index < from_index {
                break;
            }
            let value = self.roots.stack[stack_index];
            if let ObjPayload::Upvalue(u) = &mut self.heap.get_mut(r).payload {
                u.state = UpvalueState::Closed { value };
            }
            self.roots.open_upvalues.remove(0);
        }
    }

    // -- operators --------------------------------------------------------

    fn values_equal(&mut self, a: Value, b: Value) -> bool {
        if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
            if ra == rb {
                return true;
            }
            let (ka, kb) = (self.heap.get(ra).kind, self.heap.get(rb).kind);
            if ka == ObjKind::Str && kb == ObjKind::Str {
                return self.str_contents(ra) == self.str_contents(rb);
            }
            if (ka == ObjKind::Tup && kb == ObjKind::Tup) {
                let (va, vb) = match (&self.heap.get(ra).payload, &self.heap.get(rb).payload) {
                    (ObjPayload::Tup(x), ObjPayload::Tup(y)) => (x.values.clone(), y.values.clone()),
                    _ => unreachable!(),
                };
                if va.len() != vb.len() {
                    return false;
                }
                return va.iter().zip(vb.iter()).all(|(x, y)| self.values_equal(*x, *y));
            }
            if ka == ObjKind::MapAsSet && kb == ObjKind::MapAsSet {
                let (keys_a, keys_b) = match (&self.heap.get(ra).payload, &self.heap.get(rb).payload) {
                    (ObjPayload::Map(x), ObjPayload::Map(y)) => (
                        x.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).map(|e| e.key).collect::<Vec<_>>(),
                        y.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).map(|e| e.key).collect::<Vec<_>>(),
                    ),
                    _ => unreachable!(),
                };
                if keys_a.len() != keys_b.len() {
                    return false;
                }
                return keys_a.iter().all(|x| keys_b.iter().any(|y| self.values_equal(*x, *y)));
            }
            if (ka == ObjKind::Map || ka == ObjKind::MapAsWeakref) && ka == kb {
                let (entries_a, entries_b) = match (&self.heap.get(ra).payload, &self.heap.get(rb).payload) {
                    (ObjPayload::Map(x), ObjPayload::Map(y)) => (
                        x.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).cloned().collect::<Vec<_>>(),
                        y.entry_array.iter().filter(|e| !matches!(e.key, Value::Tombstone)).cloned().collect::<Vec<_>>(),
                    ),
                    _ => unreachable!(),
                };
                if entries_a.len() != entries_b.len() {
                    return false;
                }
                return entries_a.iter().all(|ea| entries_b.iter().any(|eb| self.values_equal(ea.key, eb.key) && self.values_equal(ea.value, eb.value)));
            }
            return false;
        }
        a == b
    }

    fn is_err_value(&self, v: Value) -> bool {
        matches!(v.as_obj(), Some(r) if self.heap.get(r).kind == ObjKind::Err)
    }

    fn class_of(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) => self.heap.get(r).class.or_else(|| self.roots.builtin_classes.get(&self.heap.get(r).kind).copied()),
            Value::Rune(_) => Some(self.roots.char_class),
            _ => None,
        }
    }

    fn lookup_method_name(&self, class_ref: ObjRef, name: ObjRef, pub_only: bool) -> Option<Value> {
        let mut current = Some(class_ref);
        while let Some(c) = current {
            let class = match &self.heap.get(c).payload {
                ObjPayload::Class(cl) => cl,
                _ => unreachable!(),
            };
            let table = if pub_only { &class.pub_instance_methods } else { &class.all_instance_methods };
            if let Some(v) = table.get(&name) {
                return Some(*v);
            }
            current = class.superclass;
        }
        None
    }

    /// Ordering for the relational operators (§4.7) on operand kinds that
    /// have no numeric fast path: lexicographic on `Str` (byte content) and
    /// `Tup` (element-wise, shorter-is-less on a tied common prefix),
    /// grounded on `compare_strings`/`compare_tuples` in `original_source/
    /// src/core/operators.c`. `None` means the kind pair isn't ordered here
    /// and the caller falls back to `$op_binary_*` overload dispatch.
    fn compare_values(&mut self, a: Value, b: Value) -> Option<std::cmp::Ordering> {
        let (Value::Obj(ra), Value::Obj(rb)) = (a, b) else { return None };
        let (ka, kb) = (self.heap.get(ra).kind, self.heap.get(rb).kind);
        if ka == ObjKind::Str && kb == ObjKind::Str {
            return Some(self.str_contents(ra).cmp(&self.str_contents(rb)));
        }
        if ka == ObjKind::Tup && kb == ObjKind::Tup {
            let (va, vb) = match (&self.heap.get(ra).payload, &self.heap.get(rb).payload) {
                (ObjPayload::Tup(x), ObjPayload::Tup(y)) => (x.values.clone(), y.values.clone()),
                _ => unreachable!(),
            };
            for (x, y) in va.iter().zip(vb.iter()) {
                match self.compare_values(*x, *y).or_else(|| x.numeric_cmp(y)) {
                    Some(std::cmp::Ordering::Equal) => continue,
                    other => return other,
                }
            }
            return Some(va.len().cmp(&vb.len()));
        }
        None
    }

    fn try_operator_method(&mut self, method_name: &'static str, receiver: Value, other: Value) -> bool {
        let Some(class) = self.class_of(receiver) else { return false };
        let name = self.name(method_name);
        let Some(method) = self.lookup_method_name(class, name, true) else { return false };
        let bound = self.with_gc_disabled(|vm| {
            vm.push(receiver);
            vm.push(other);
            let b = vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver, method })));
            vm.pop();
            vm.pop();
            b
        });
        let Some(bound) = bound else { return false };
        let result = self.call(Value::Obj(bound), &[other]);
        self.push(result);
        true
    }

    fn binary_op(&mut self, op: Op) {
        let b = self.pop();
        let a = self.pop();

        match operators::fast_numeric(op, a, b) {
            Some(Ok(v)) => {
                self.push(v);
                return;
            }
            Some(Err(message)) => {
                self.panic(message);
                self.push(Value::Null);
                return;
            }
            None => {}
        }

        match op {
            Op::BinaryPlus => {
                if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                    if self.heap.get(ra).kind == ObjKind::Str && self.heap.get(rb).kind == ObjKind::Str {
                        let combined = format!("{}{}", self.str_contents(ra), self.str_contents(rb));
                        if let Some(r) = self.intern_str(&combined) {
                            self.push(Value::Obj(r));
                        }
                        return;
                    }
                    if self.heap.get(ra).kind == ObjKind::Vec && self.heap.get(rb).kind == ObjKind::Vec {
                        let (mut va, vb) = match (&self.heap.get(ra).payload, &self.heap.get(rb).payload) {
                            (ObjPayload::Vec(x), ObjPayload::Vec(y)) => (x.values.clone(), y.values.clone()),
                            _ => unreachable!(),
                        };
                        va.extend(vb);
                        if let Some(v) = self.alloc_vec(va, false) {
                            self.push(v);
                        }
                        return;
                    }
                }
            }
            Op::BinaryEqualEqual => {
                let eq = self.values_equal(a, b);
                self.push(Value::Bool(eq));
                return;
            }
            Op::BinaryBangEqual => {
                let eq = self.values_equal(a, b);
                self.push(Value::Bool(!eq));
                return;
            }
            Op::BinaryIn => {
                let r = self.contains(b, a);
                self.push(Value::Bool(r));
                return;
            }
            Op::BinaryLess | Op::BinaryLessEqual | Op::BinaryGreater | Op::BinaryGreaterEqual => {
                if let Some(ord) = self.compare_values(a, b) {
                    let result = match op {
                        Op::BinaryLess => ord.is_lt(),
                        Op::BinaryLessEqual => ord.is_le(),
                        Op::BinaryGreater => ord.is_gt(),
                        Op::BinaryGreaterEqual => ord.is_ge(),
                        _ => unreachable!(),
                    };
                    self.push(Value::Bool(result));
                    return;
                }
            }
            _ => {}
        }

        if let Some((fwd, rev)) = operators::overload_names(op) {
            if self.try_operator_method(fwd, a, b) {
                return;
            }
            if self.try_operator_method(rev, b, a) {
                return;
            }
        }

        self.panic("unsupported operand types for binary operator".to_string());
        self.push(Value::Null);
    }

    fn contains(&mut self, container: Value, needle: Value) -> bool {
        match container.as_obj().map(|r| (r, self.heap.get(r).kind)) {
            Some((r, ObjKind::Vec | ObjKind::VecAsStack)) => {
                let values = match &self.heap.get(r).payload {
                    ObjPayload::Vec(v) => v.values.clone(),
                    _ => unreachable!(),
                };
                values.iter().any(|v| self.values_equal(*v, needle))
            }
            Some((r, ObjKind::Tup)) => {
                let values = match &self.heap.get(r).payload {
                    ObjPayload::Tup(t) => t.values.clone(),
                    _ => unreachable!(),
                };
                values.iter().any(|v| self.values_equal(*v, needle))
            }
            Some((r, ObjKind::Map | ObjKind::MapAsSet | ObjKind::MapAsWeakref)) => {
                let entries = match &self.heap.get(r).payload {
                    ObjPayload::Map(m) => m.entry_array.clone(),
                    _ => unreachable!(),
                };
                entries.iter().any(|e| !matches!(e.key, Value::Tombstone) && self.values_equal(e.key, needle))
            }
            Some((r, ObjKind::Str)) => {
                let hay = self.str_contents(r);
                match needle {
                    Value::Obj(nr) if self.heap.get(nr).kind == ObjKind::Str => hay.contains(&self.str_contents(nr)),
                    Value::Rune(c) => char::from_u32(c).map(|ch| hay.contains(ch)).unwrap_or(false),
                    _ => false,
                }
            }
            Some((r, _)) => {
                let class = self.class_of(Value::Obj(r));
                let name = self.name("$contains");
                match class.and_then(|c| self.lookup_method_name(c, name, true)) {
                    Some(method) => {
                        let bound = self.with_gc_disabled(|vm| {
                            vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: container, method })))
                        });
                        match bound {
                            Some(b) => !self.call(Value::Obj(b), &[needle]).is_falsey(),
                            None => false,
                        }
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    fn unary_op(&mut self, op: Op) {
        let a = self.pop();
        let result = match op {
            Op::UnaryBang => Some(Value::Bool(a.is_falsey())),
            Op::UnaryMinus => match a {
                Value::I64(x) => Some(Value::I64(x.wrapping_neg())),
                Value::F64(x) => Some(Value::F64(-x)),
                _ => None,
            },
            Op::UnaryPlus => match a {
                Value::I64(_) | Value::F64(_) => Some(a),
                _ => None,
            },
            Op::UnaryTilde => match a {
                Value::I64(x) => Some(Value::I64(!x)),
                _ => None,
            },
            _ => unreachable!(),
        };
        if let Some(v) = result {
            self.push(v);
            return;
        }
        let overload = match op {
            Op::UnaryMinus => Some("$op_unary_minus"),
            Op::UnaryPlus => Some("$op_unary_plus"),
            _ => None,
        };
        if let Some(name) = overload {
            if self.try_operator_method(name, a, Value::Null) {
                return;
            }
        }
        self.panic("unsupported operand type for unary operator".to_string());
        self.push(Value::Null);
    }

    // -- calls ------------------------------------------------------------

    fn spread_last_arg(&mut self, argc: u8) -> u8 {
        let spread = self.pop();
        let values: Vec<Value> = match spread.as_obj().map(|r| (r, self.heap.get(r).kind)) {
            Some((r, ObjKind::Vec | ObjKind::VecAsStack)) => match &self.heap.get(r).payload {
                ObjPayload::Vec(v) => v.values.clone(),
                _ => unreachable!(),
            },
            Some((r, ObjKind::Tup)) => match &self.heap.get(r).payload {
                ObjPayload::Tup(t) => t.values.to_vec(),
                _ => unreachable!(),
            },
            _ => {
                self.panic("spread argument must be a vec or tup".to_string());
                Vec::new()
            }
        };
        let extra = values.len();
        for v in values {
            self.push(v);
        }
        (argc as usize - 1 + extra).min(u8::MAX as usize) as u8
    }

    fn dispatch_method_call(&mut self, name_idx: u16, argc: u8, privileged: bool, use_super: bool) {
        let name = self.const_name(name_idx);
        let receiver = self.peek(argc as usize);
        let class = if use_super {
            self.class_of(receiver).and_then(|c| match &self.heap.get(c).payload {
                ObjPayload::Class(cl) => cl.superclass,
                _ => None,
            })
        } else {
            self.class_of(receiver)
        };
        let Some(class) = class else {
            self.panic("value has no methods".to_string());
            return;
        };
        let pub_only = !privileged;
        match self.lookup_method_name(class, name, pub_only) {
            Some(method) => self.invoke(method, argc),
            None => self.panic(format!("unknown method '{}'", self.str_contents(name))),
        }
    }

    /// Dispatches a resolved callable against the stack's current `[subject,
    /// args...]` layout, where `subject` — already sitting at `fp` — is
    /// either the callee itself (`CALL_VALUE`) or the receiver
    /// (`CALL_METHOD`/`CALL_PUB_METHOD`/`CALL_SUPER_METHOD`), per §4.8's call
    /// convention.
    fn invoke(&mut self, callable: Value, argc: u8) {
        match callable {
            Value::Obj(r) => match self.heap.get(r).kind {
                ObjKind::Closure => self.call_closure(r, argc),
                ObjKind::NativeFn => self.call_native(r, argc),
                ObjKind::Class => self.call_class_constructor(r, argc),
                ObjKind::BoundMethod => {
                    let (receiver, method) = match &self.heap.get(r).payload {
                        ObjPayload::BoundMethod(b) => (b.receiver, b.method),
                        _ => unreachable!(),
                    };
                    let fp = self.roots.stack.len() - 1 - argc as usize;
                    self.roots.stack[fp] = receiver;
                    self.invoke(method, argc);
                }
                ObjKind::Instance => {
                    let class = self.heap.get(r).class;
                    let name = self.name("$call");
                    match class.and_then(|c| self.lookup_method_name(c, name, true)) {
                        Some(method) => self.invoke(method, argc),
                        None => self.panic("value is not callable".to_string()),
                    }
                }
                _ => self.panic("value is not callable".to_string()),
            },
            _ => self.panic("value is not callable".to_string()),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) {
        let (fn_ref, defaults) = match &self.heap.get(closure_ref).payload {
            ObjPayload::Closure(c) => (c.function, c.default_values.clone()),
            _ => unreachable!(),
        };
        let (arity, is_variadic) = match &self.heap.get(fn_ref).payload {
            ObjPayload::Fn(f) => (f.arity as usize, f.is_variadic),
            _ => unreachable!(),
        };
        let argc = argc as usize;
        let n_defaults = defaults.as_ref().map(Vec::len).unwrap_or(0);
        let required = arity.saturating_sub(n_defaults);
        if argc < required {
            self.panic(format!("expected at least {required} argument(s), got {argc}"));
            return;
        }
        if !is_variadic && argc > arity {
            self.panic(format!("expected at most {arity} argument(s), got {argc}"));
            return;
        }
        let fp = self.roots.stack.len() - argc - 1;
        if argc < arity {
            if let Some(defaults) = &defaults {
                let missing = arity - argc;
                let start = defaults.len() - missing;
                for v in &defaults[start..] {
                    self.push(*v);
                }
            }
        }
        if is_variadic {
            let present = self.roots.stack.len() - (fp + 1);
            let variadic_count = present.saturating_sub(arity);
            let mut rest = Vec::with_capacity(variadic_count);
            for _ in 0..variadic_count {
                rest.push(self.pop());
            }
            rest.reverse();
            match self.alloc_tup(rest) {
                Some(v) => self.push(v),
                None => return,
            }
        }
        if self.roots.frames.len() >= FRAMES_MAX {
            self.panic("call stack overflow".to_string());
            return;
        }
        self.roots.frames.push(CallFrame::new(closure_ref, fp, self.roots.with_stack.len()));
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: u8) {
        let func = match &self.heap.get(native_ref).payload {
            ObjPayload::NativeFn(n) => n.func,
            _ => unreachable!(),
        };
        let argc = argc as usize;
        let fp = self.roots.stack.len() - argc - 1;
        // `stack[fp]` is the call's subject slot (§4.8's call convention):
        // the receiver for a method call, or the callee itself for a bare
        // `CALL_VALUE` — exactly what the original host's `argv[-1]` names.
        let receiver = self.roots.stack[fp];
        let args: Vec<Value> = self.roots.stack[fp + 1..].to_vec();
        self.roots.stack.truncate(fp);
        match func(self, receiver, &args) {
            Ok(v) => self.push(v),
            Err(message) => {
                self.panic(message);
                self.push(Value::Null);
            }
        }
    }

    fn call_class_constructor(&mut self, class_ref: ObjRef, argc: u8) {
        let (default_fields, init_method) = match &self.heap.get(class_ref).payload {
            ObjPayload::Class(c) => (c.default_field_values.clone(), c.init_method),
            _ => unreachable!(),
        };
        let instance_ref = match self.alloc(HeapObject::with_class(ObjPayload::Instance(InstanceObj { fields: default_fields }), class_ref)) {
            Some(r) => r,
            None => return,
        };
        let fp = self.roots.stack.len() - argc as usize - 1;
        self.roots.stack[fp] = Value::Obj(instance_ref);
        match init_method {
            Some(init) => {
                // `$init` runs like any other method: receiver already at
                // `fp`, args already above it.
                self.invoke(init, argc);
                // its return value (conventionally null) is discarded in
                // favour of the instance itself, which a `Return` just
                // pushed in its place.
                let _ = self.pop();
                self.push(Value::Obj(instance_ref));
            }
            None => {
                if argc != 0 {
                    self.panic("expected 0 arguments (class has no $init method)".to_string());
                    return;
                }
                self.roots.stack.truncate(fp);
                self.push(Value::Obj(instance_ref));
            }
        }
    }

    /// Invokes `callee` with `args`, driving the dispatch loop until the
    /// frame count returns to its pre-call depth, and returns the single
    /// result it leaves behind. Used by `try`, `$end_with`, and
    /// [`NativeContext::call_value`].
    fn call(&mut self, callee: Value, args: &[Value]) -> Value {
        let depth = self.roots.frames.len();
        self.push(callee);
        for a in args {
            self.push(*a);
        }
        self.invoke(callee, args.len() as u8);
        if self.roots.frames.len() > depth {
            let _ = self.run_until_frame_count(depth);
        }
        if self.panic_flag {
            // The caller decides whether to absorb or propagate the panic;
            // still pop whatever sentinel value the aborted call left behind
            // so the invariant "every call leaves exactly one value" holds.
            return if self.roots.stack.is_empty() { Value::Null } else { self.pop() };
        }
        self.pop()
    }

    fn do_return(&mut self, n: usize, _line: u32) {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop());
        }
        values.reverse();
        let result = if n == 1 {
            values[0]
        } else {
            match self.alloc_tup(values) {
                Some(v) => v,
                None => return,
            }
        };

        let frame = self.roots.frames.pop().expect("RETURN with no active frame");
        while self.roots.with_stack.len() > frame.with_stack_count_on_entry {
            let v = self.roots.with_stack.pop().unwrap();
            self.call_end_with(v);
        }
        self.close_upvalues_from(frame.fp);
        self.roots.stack.truncate(frame.fp);
        self.push(result);
    }

    fn call_end_with(&mut self, v: Value) {
        let Some(class) = self.class_of(v) else { return };
        let name = self.name("$end_with");
        let Some(method) = self.lookup_method_name(class, name, true) else { return };
        let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: v, method }))));
        if let Some(b) = bound {
            let _ = self.call(Value::Obj(b), &[]);
        }
    }

    // -- classes ------------------------------------------------------------

    fn make_class(&mut self, name_idx: u16) {
        let name = self.str_contents(self.const_name(name_idx));
        if let Some(r) = self.alloc(HeapObject::new(ObjPayload::Class(ClassObj::new(name)))) {
            self.push(Value::Obj(r));
        }
    }

    fn inherit(&mut self) {
        let superclass = self.pop();
        let subclass = self.peek(0);
        let (Value::Obj(sup), Value::Obj(sub)) = (superclass, subclass) else {
            self.panic("superclass must be a class".to_string());
            return;
        };
        if self.heap.get(sup).kind != ObjKind::Class {
            self.panic("superclass must be a class".to_string());
            return;
        }
        let (sup_all_fields, sup_pub_fields, sup_defaults) = match &self.heap.get(sup).payload {
            ObjPayload::Class(c) => (c.all_field_indexes.clone(), c.pub_field_indexes.clone(), c.default_field_values.clone()),
            _ => unreachable!(),
        };
        if let ObjPayload::Class(subclass) = &mut self.heap.get_mut(sub).payload {
            subclass.superclass = Some(sup);
            subclass.all_field_indexes = sup_all_fields;
            subclass.pub_field_indexes = sup_pub_fields;
            subclass.default_field_values = sup_defaults;
        }
    }

    fn define_method(&mut self, name_idx: u16, is_pub: bool, is_static: bool) {
        let name = self.const_name(name_idx);
        let method = self.pop();
        let class_ref = match self.peek(0).as_obj() {
            Some(r) => r,
            None => return,
        };
        let is_init = self.str_contents(name) == "$init";
        if let ObjPayload::Class(class) = &mut self.heap.get_mut(class_ref).payload {
            if is_static {
                class.static_members.insert(name, method);
            } else {
                class.all_instance_methods.insert(name, method);
                if is_pub {
                    class.pub_instance_methods.insert(name, method);
                }
                if is_init {
                    class.init_method = Some(method);
                }
            }
        }
    }

    fn define_field(&mut self, name_idx: u16, is_pub: bool, is_static: bool) {
        let name = self.const_name(name_idx);
        let value = self.pop();
        let class_ref = match self.peek(0).as_obj() {
            Some(r) => r,
            None => return,
        };
        if let ObjPayload::Class(class) = &mut self.heap.get_mut(class_ref).payload {
            if is_static {
                class.static_members.insert(name, value);
            } else {
                let idx = class.default_field_values.len();
                class.default_field_values.push(value);
                class.all_field_indexes.insert(name, idx);
                if is_pub {
                    class.pub_field_indexes.insert(name, idx);
                }
            }
        }
    }

    fn get_field(&mut self, name_idx: u16, pub_only: bool, _method_only: bool) {
        let name = self.const_name(name_idx);
        let recv = self.pop();
        let Some(r) = recv.as_obj() else {
            self.panic("only instances have fields".to_string());
            return;
        };
        if self.heap.get(r).kind == ObjKind::Class {
            // static member access on the class value itself.
            let member = match &self.heap.get(r).payload {
                ObjPayload::Class(c) => c.static_members.get(&name).copied(),
                _ => None,
            };
            match member {
                Some(v) => self.push(v),
                None => self.panic(format!("undefined static member '{}'", self.str_contents(name))),
            }
            return;
        }
        if self.heap.get(r).kind != ObjKind::Instance {
            self.panic("only instances have fields".to_string());
            return;
        }
        let class_ref = self.heap.get(r).class;
        let field_index = class_ref.and_then(|c| match &self.heap.get(c).payload {
            ObjPayload::Class(cl) => {
                let table = if pub_only { &cl.pub_field_indexes } else { &cl.all_field_indexes };
                table.get(&name).copied()
            }
            _ => None,
        });
        if let Some(i) = field_index {
            let v = match &self.heap.get(r).payload {
                ObjPayload::Instance(inst) => inst.fields[i],
                _ => unreachable!(),
            };
            self.push(v);
            return;
        }
        let method = class_ref.and_then(|c| self.lookup_method_name(c, name, pub_only));
        match method {
            Some(m) => {
                let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: recv, method: m }))));
                if let Some(b) = bound {
                    self.push(Value::Obj(b));
                }
            }
            None => self.panic(format!("undefined property '{}'", self.str_contents(name))),
        }
    }

    fn get_super_method(&mut self, name_idx: u16) {
        let name = self.const_name(name_idx);
        let recv = self.pop();
        let class = self
            .class_of(recv)
            .and_then(|c| match &self.heap.get(c).payload {
                ObjPayload::Class(cl) => cl.superclass,
                _ => None,
            });
        let method = class.and_then(|c| self.lookup_method_name(c, name, false));
        match method {
            Some(m) => {
                let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: recv, method: m }))));
                if let Some(b) = bound {
                    self.push(Value::Obj(b));
                }
            }
            None => self.panic(format!("undefined super method '{}'", self.str_contents(name))),
        }
    }

    fn set_field(&mut self, name_idx: u16, pub_only: bool) {
        let name = self.const_name(name_idx);
        let value = self.pop();
        let recv = self.pop();
        let Some(r) = recv.as_obj() else {
            self.panic("only instances have fields".to_string());
            self.push(value);
            return;
        };
        let class_ref = self.heap.get(r).class;
        let field_index = class_ref.and_then(|c| match &self.heap.get(c).payload {
            ObjPayload::Class(cl) => {
                let table = if pub_only { &cl.pub_field_indexes } else { &cl.all_field_indexes };
                table.get(&name).copied()
            }
            _ => None,
        });
        match field_index {
            Some(i) => {
                if let ObjPayload::Instance(inst) = &mut self.heap.get_mut(r).payload {
                    inst.fields[i] = value;
                }
            }
            None => self.panic(format!("undefined property '{}'", self.str_contents(name))),
        }
        self.push(value);
    }

    // -- imports ----------------------------------------------------------

    fn pop_segments(&mut self, n: u8) -> Vec<String> {
        let mut refs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            refs.push(self.pop());
        }
        refs.reverse();
        refs.into_iter().map(|v| self.str_contents(v.as_obj().expect("import segment must be a string"))).collect()
    }

    fn resolve_module(&mut self, segments: &[String]) -> Option<Value> {
        let cache_key = segments.join("::");
        if let Some(v) = self.roots.module_cache.get(&cache_key) {
            return Some(*v);
        }
        let (source, path) = match imports::resolve_source(&self.import_roots, segments) {
            Ok(ok) => ok,
            Err(e) => {
                self.panic(format!("{e}"));
                return None;
            }
        };
        let source_name = path.display().to_string();
        let fn_obj = match pyro_compiler::Compiler::compile(&source, &source_name, &mut self.heap, &mut self.strings) {
            Ok(f) => f,
            Err(e) => {
                self.panic(format!("{}", ImportError::Compile { module: cache_key, message: e.to_string() }));
                return None;
            }
        };
        let module_ref = self.alloc(HeapObject::new(ObjPayload::Module(ModuleObj::new())))?;
        let fn_ref = self.alloc(HeapObject::new(ObjPayload::Fn(fn_obj)))?;
        let closure_ref = self.alloc(HeapObject::new(ObjPayload::Closure(ClosureObj {
            function: fn_ref,
            module: module_ref,
            upvalues: Vec::new(),
            default_values: None,
        })))?;
        let result = self.call(Value::Obj(closure_ref), &[]);
        let _ = result;
        let module_value = Value::Obj(module_ref);
        self.roots.module_cache.insert(cache_key, module_value);
        Some(module_value)
    }

    fn import_module(&mut self, n: u8) {
        let segments = self.pop_segments(n);
        if let Some(v) = self.resolve_module(&segments) {
            self.push(v);
        }
    }

    fn import_named_members(&mut self, n_seg: u8, n_names: u8) {
        let names: Vec<ObjRef> = (0..n_names)
            .map(|_| self.pop().as_obj().expect("import member name must be a string"))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let segments = self.pop_segments(n_seg);
        let Some(module_value) = self.resolve_module(&segments) else { return };
        let module_ref = module_value.as_obj().expect("resolved module must be an object");
        for name in names {
            let v = match &self.heap.get(module_ref).payload {
                ObjPayload::Module(m) => m.pub_member_indexes.get(&name).map(|&i| m.members[i]),
                _ => None,
            };
            match v {
                Some(v) => self.push(v),
                None => {
                    self.panic(format!("undefined public member '{}'", self.str_contents(name)));
                    self.push(Value::Null);
                }
            }
        }
    }

    fn import_all_members(&mut self, n: u8) {
        let segments = self.pop_segments(n);
        let Some(module_value) = self.resolve_module(&segments) else { return };
        let module_ref = module_value.as_obj().expect("resolved module must be an object");
        let (pub_indexes, members) = match &self.heap.get(module_ref).payload {
            ObjPayload::Module(m) => (m.pub_member_indexes.clone(), m.members.clone()),
            _ => return,
        };
        let dest_module = self.current_module();
        for (name, i) in pub_indexes {
            let value = members[i];
            let dest = self.module_obj_mut(dest_module);
            if let Some(&existing) = dest.all_member_indexes.get(&name) {
                dest.members[existing] = value;
                dest.pub_member_indexes.insert(name, existing);
            } else {
                let idx = dest.members.len();
                dest.members.push(value);
                dest.all_member_indexes.insert(name, idx);
                dest.pub_member_indexes.insert(name, idx);
            }
        }
    }

    fn get_member(&mut self, name_idx: u16) {
        let name = self.const_name(name_idx);
        let container = self.pop();
        let Some(r) = container.as_obj() else {
            self.panic("value has no members".to_string());
            return;
        };
        match &self.heap.get(r).payload {
            ObjPayload::Module(m) => match m.pub_member_indexes.get(&name) {
                Some(&i) => {
                    let v = m.members[i];
                    self.push(v);
                }
                None => self.panic(format!("undefined public member '{}'", self.str_contents(name))),
            },
            _ => self.panic("only modules expose '::' members".to_string()),
        }
    }

    // -- data construction --------------------------------------------------

    pub fn alloc_vec(&mut self, values: Vec<Value>, is_stack: bool) -> Option<Value> {
        let class = self.roots.builtin_classes[&if is_stack { ObjKind::VecAsStack } else { ObjKind::Vec }];
        let r = self.alloc(HeapObject::with_class(ObjPayload::Vec(VecObj { values, version: 0, is_stack }), class))?;
        Some(Value::Obj(r))
    }

    pub fn alloc_tup(&mut self, values: Vec<Value>) -> Option<Value> {
        let class = self.roots.builtin_classes[&ObjKind::Tup];
        let r = self.alloc(HeapObject::with_class(ObjPayload::Tup(TupObj { values: values.into_boxed_slice() }), class))?;
        Some(Value::Obj(r))
    }

    pub fn alloc_map(&mut self, entries: Vec<(Value, Value)>, is_set: bool) -> Option<Value> {
        let class = self.roots.builtin_classes[&if is_set { ObjKind::MapAsSet } else { ObjKind::Map }];
        let mut map = MapObj::new();
        map.is_weakref = false;
        for (i, (k, v)) in entries.into_iter().enumerate() {
            map.entry_array.push(MapEntry { key: k, value: v });
            map.live_entry_count += 1;
            let _ = i;
        }
        let r = self.alloc(HeapObject::with_class(ObjPayload::Map(map), class))?;
        Some(Value::Obj(r))
    }

    fn make_map(&mut self, n: u16, is_set: bool) {
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let value = self.pop();
            let key = self.pop();
            entries.push((key, value));
        }
        entries.reverse();
        if let Some(v) = self.alloc_map(entries, is_set) {
            self.push(v);
        }
    }

    fn make_set(&mut self, n: u16) {
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let key = self.pop();
            entries.push((key, Value::Bool(true)));
        }
        entries.reverse();
        if let Some(v) = self.alloc_map(entries, true) {
            self.push(v);
        }
    }

    fn make_vec(&mut self, n: u16, is_stack: bool) {
        let mut values = Vec::with_capacity(n as usize);
        for _ in 0..n {
            values.push(self.pop());
        }
        values.reverse();
        if let Some(v) = self.alloc_vec(values, is_stack) {
            self.push(v);
        }
    }

    fn make_tup(&mut self, n: u16) {
        let mut values = Vec::with_capacity(n as usize);
        for _ in 0..n {
            values.push(self.pop());
        }
        values.reverse();
        if let Some(v) = self.alloc_tup(values) {
            self.push(v);
        }
    }

    fn make_enum(&mut self, name_idx: u16, n: u16) {
        let enum_name = self.str_contents(self.const_name(name_idx));
        let mut variant_names = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let v = self.pop();
            variant_names.push(v.as_obj().expect("enum variant name must be a string"));
        }
        variant_names.reverse();

        let module_ref = match self.alloc(HeapObject::new(ObjPayload::Module(ModuleObj::new()))) {
            Some(r) => r,
            None => return,
        };
        for (ordinal, name) in variant_names.into_iter().enumerate() {
            let instance = match self.alloc(HeapObject::new(ObjPayload::Instance(InstanceObj { fields: vec![Value::I64(ordinal as i64)] }))) {
                Some(r) => r,
                None => return,
            };
            let module = self.module_obj_mut(module_ref);
            let idx = module.members.len();
            module.members.push(Value::Obj(instance));
            module.all_member_indexes.insert(name, idx);
            module.pub_member_indexes.insert(name, idx);
        }
        let _ = enum_name;
        self.push(Value::Obj(module_ref));
    }

    fn make_closure(&mut self, fn_idx: u16, n_defaults: u8) {
        let fn_value = self.current_fn_obj().constants[fn_idx as usize];
        let fn_ref = fn_value.as_obj().expect("MAKE_CLOSURE operand must reference a constant Fn");
        let upvalue_descs: Vec<UpvalueDesc> = match &self.heap.get(fn_ref).payload {
            ObjPayload::Fn(f) => f.upvalue_descs.clone(),
            _ => unreachable!(),
        };

        let mut defaults = Vec::with_capacity(n_defaults as usize);
        for _ in 0..n_defaults {
            defaults.push(self.pop());
        }
        defaults.reverse();

        let fp = self.roots.frames.last().map(|f| f.fp).unwrap_or(0);
        let mut upvalues = Vec::with_capacity(upvalue_descs.len());
        for desc in &upvalue_descs {
            let up = if desc.is_local {
                self.capture_upvalue(fp + desc.index as usize)
            } else {
                Some(self.current_closure().upvalues[desc.index as usize])
            };
            match up {
                Some(u) => upvalues.push(u),
                None => return,
            }
        }
        let module = self.current_module();
        let closure = ClosureObj { function: fn_ref, module, upvalues, default_values: if n_defaults > 0 { Some(defaults) } else { None } };
        if let Some(r) = self.alloc(HeapObject::new(ObjPayload::Closure(closure))) {
            self.push(Value::Obj(r));
        }
    }

    fn concat_strings(&mut self, n: u8) {
        let mut parts = Vec::with_capacity(n as usize);
        for _ in 0..n {
            parts.push(self.pop());
        }
        parts.reverse();
        let mut out = String::new();
        for p in parts {
            let r = p.as_obj().expect("CONCAT_STRINGS operand must be a string");
            out.push_str(&self.str_contents(r));
        }
        if let Some(r) = self.intern_str(&out) {
            self.push(Value::Obj(r));
        }
    }

    fn format_value(&mut self) {
        let spec = self.pop();
        let value = self.pop();
        let spec_str = spec.as_obj().map(|r| self.str_contents(r)).unwrap_or_default();
        let rendered = match value {
            Value::F64(x) if spec_str.starts_with('.') => {
                let precision: usize = spec_str[1..].parse().unwrap_or(6);
                format!("{x:.precision$}")
            }
            other => self.stringify_value(other),
        };
        if let Some(r) = self.intern_str(&rendered) {
            self.push(Value::Obj(r));
        }
    }

    fn stringify_value(&mut self, v: Value) -> String {
        match v {
            Value::Bool(_) | Value::Null | Value::I64(_) | Value::F64(_) | Value::Rune(_) | Value::Tombstone => v.to_string(),
            Value::Obj(r) => {
                if self.heap.get(r).kind == ObjKind::Str {
                    return self.str_contents(r);
                }
                let class = self.class_of(v);
                let name = self.name("$str");
                if let Some(method) = class.and_then(|c| self.lookup_method_name(c, name, true)) {
                    let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: v, method }))));
                    if let Some(b) = bound {
                        let result = self.call(Value::Obj(b), &[]);
                        if let Some(sr) = result.as_obj() {
                            if self.heap.get(sr).kind == ObjKind::Str {
                                return self.str_contents(sr);
                            }
                        }
                    }
                }
                self.default_repr(r)
            }
        }
    }

    fn default_repr(&self, r: ObjRef) -> String {
        match &self.heap.get(r).payload {
            ObjPayload::Vec(v) => {
                let parts: Vec<String> = v.values.iter().map(|x| self.quick_repr(*x)).collect();
                format!("[{}]", parts.join(", "))
            }
            ObjPayload::Tup(t) => {
                let parts: Vec<String> = t.values.iter().map(|x| self.quick_repr(*x)).collect();
                format!("({})", parts.join(", "))
            }
            ObjPayload::Map(m) => {
                let parts: Vec<String> = m
                    .entry_array
                    .iter()
                    .filter(|e| !matches!(e.key, Value::Tombstone))
                    .map(|e| format!("{}: {}", self.quick_repr(e.key), self.quick_repr(e.value)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            ObjPayload::Closure(_) | ObjPayload::Fn(_) | ObjPayload::NativeFn(_) => "<fn>".to_string(),
            ObjPayload::Class(c) => format!("<class {}>", c.name),
            ObjPayload::Instance(_) => "<instance>".to_string(),
            ObjPayload::Err(e) => format!("<err: {}>", self.quick_repr(e.message)),
            ObjPayload::Module(_) => "<module>".to_string(),
            _ => format!("<obj #{}>", r.index()),
        }
    }

    fn quick_repr(&self, v: Value) -> String {
        match v {
            Value::Obj(r) if self.heap.get(r).kind == ObjKind::Str => format!("'{}'", self.str_contents(r)),
            Value::Obj(r) => self.default_repr(r),
            other => other.to_string(),
        }
    }

    // -- iteration ----------------------------------------------------------

    fn get_iterator(&mut self) {
        let source = self.pop();
        let Some(r) = source.as_obj() else {
            self.panic("value is not iterable".to_string());
            return;
        };
        let kind = self.heap.get(r).kind;
        let iter_kind = match kind {
            ObjKind::Iter => None, // already an iterator; pass through below
            ObjKind::Vec | ObjKind::VecAsStack => Some(IterSource::Vec { cursor: 0 }),
            ObjKind::Tup => Some(IterSource::Tup { cursor: 0 }),
            ObjKind::Str => Some(IterSource::StrChars { cursor: 0 }),
            ObjKind::Map | ObjKind::MapAsSet => {
                let version = match &self.heap.get(r).payload {
                    ObjPayload::Map(m) => m.version,
                    _ => 0,
                };
                Some(IterSource::MapEntries { cursor: 0, version_at_iter: version })
            }
            ObjKind::Queue => Some(IterSource::Queue { next: match &self.heap.get(r).payload { ObjPayload::Queue(q) => q.head, _ => None } }),
            _ => {
                let class = self.class_of(source);
                let name = self.name("$iter");
                match class.and_then(|c| self.lookup_method_name(c, name, true)) {
                    Some(method) => {
                        let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: source, method }))));
                        let result = bound.map(|b| self.call(Value::Obj(b), &[]));
                        match result {
                            Some(v) => {
                                self.push(v);
                                return;
                            }
                            None => return,
                        }
                    }
                    None => {
                        self.panic("value is not iterable".to_string());
                        return;
                    }
                }
            }
        };
        match iter_kind {
            None => self.push(source),
            Some(kind) => {
                let class = self.roots.builtin_classes[&ObjKind::Iter];
                if let Some(ir) = self.alloc(HeapObject::with_class(ObjPayload::Iter(IterObj { source: r, kind, exhausted: false }), class)) {
                    self.push(Value::Obj(ir));
                }
            }
        }
    }

    fn build_exhausted(&mut self) -> Value {
        let details = self.alloc_map(Vec::new(), false);
        let message = self.intern_str("iterator exhausted");
        match (message, details) {
            (Some(m), Some(Value::Obj(d))) => {
                let class = self.roots.builtin_classes[&ObjKind::Err];
                match self.alloc(HeapObject::with_class(ObjPayload::Err(ErrObj { message: Value::Obj(m), details: d }), class)) {
                    Some(r) => Value::Obj(r),
                    None => Value::Null,
                }
            }
            _ => Value::Null,
        }
    }

    /// Drives `iter_ref` one step, for `pyro-stdlib`'s `Iter` methods
    /// (`to_vec`, `count`, `sum`, `join`, `reduce`, ...) that need to drain a
    /// built-in iterator without going through the bytecode dispatch loop.
    /// Mirrors `get_next_from_iterator`'s body, returning instead of
    /// pushing.
    pub fn iterator_next(&mut self, iter_ref: ObjRef) -> Value {
        let exhausted = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => it.exhausted,
            _ => return Value::Null,
        };
        if exhausted {
            return self.build_exhausted();
        }
        self.advance_iterator(iter_ref)
    }

    fn get_next_from_iterator(&mut self) {
        let v = self.pop();
        let Some(r) = v.as_obj() else {
            self.panic("value is not an iterator".to_string());
            return;
        };
        if self.heap.get(r).kind != ObjKind::Iter {
            self.panic("value is not an iterator".to_string());
            return;
        }
        let exhausted = match &self.heap.get(r).payload {
            ObjPayload::Iter(it) => it.exhausted,
            _ => unreachable!(),
        };
        if exhausted {
            let e = self.build_exhausted();
            self.push(e);
            return;
        }
        let result = self.advance_iterator(r);
        self.push(result);
    }

    fn advance_iterator(&mut self, iter_ref: ObjRef) -> Value {
        let kind = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => iter_source_tag(&it.kind),
            _ => unreachable!(),
        };
        match kind {
            IterSourceTag::Vec => self.advance_vec_like(iter_ref, false),
            IterSourceTag::Tup => self.advance_tup(iter_ref),
            IterSourceTag::StrChars => self.advance_str_chars(iter_ref),
            IterSourceTag::MapEntries => self.advance_map(iter_ref),
            IterSourceTag::Queue => self.advance_queue(iter_ref),
            IterSourceTag::Range => self.advance_range(iter_ref),
            IterSourceTag::Other => {
                self.mark_exhausted(iter_ref);
                self.build_exhausted()
            }
        }
    }

    fn mark_exhausted(&mut self, iter_ref: ObjRef) {
        if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
            it.exhausted = true;
        }
    }

    fn advance_vec_like(&mut self, iter_ref: ObjRef, _is_stack: bool) -> Value {
        let (src, cursor) = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => (it.source, match it.kind { IterSource::Vec { cursor } => cursor, _ => unreachable!() }),
            _ => unreachable!(),
        };
        let values_len = match &self.heap.get(src).payload {
            ObjPayload::Vec(v) => v.values.len(),
            _ => 0,
        };
        if cursor >= values_len {
            self.mark_exhausted(iter_ref);
            return self.build_exhausted();
        }
        let v = match &self.heap.get(src).payload {
            ObjPayload::Vec(v) => v.values[cursor],
            _ => unreachable!(),
        };
        if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
            it.kind = IterSource::Vec { cursor: cursor + 1 };
        }
        v
    }

    fn advance_tup(&mut self, iter_ref: ObjRef) -> Value {
        let (src, cursor) = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => (it.source, match it.kind { IterSource::Tup { cursor } => cursor, _ => unreachable!() }),
            _ => unreachable!(),
        };
        let len = match &self.heap.get(src).payload {
            ObjPayload::Tup(t) => t.values.len(),
            _ => 0,
        };
        if cursor >= len {
            self.mark_exhausted(iter_ref);
            return self.build_exhausted();
        }
        let v = match &self.heap.get(src).payload {
            ObjPayload::Tup(t) => t.values[cursor],
            _ => unreachable!(),
        };
        if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
            it.kind = IterSource::Tup { cursor: cursor + 1 };
        }
        v
    }

    fn advance_str_chars(&mut self, iter_ref: ObjRef) -> Value {
        let (src, cursor) = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => (it.source, match it.kind { IterSource::StrChars { cursor } => cursor, _ => unreachable!() }),
            _ => unreachable!(),
        };
        let text = self.str_contents(src);
        let ch = text.chars().nth(cursor);
        match ch {
            Some(c) => {
                if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
                    it.kind = IterSource::StrChars { cursor: cursor + 1 };
                }
                Value::Rune(c as u32)
            }
            None => {
                self.mark_exhausted(iter_ref);
                self.build_exhausted()
            }
        }
    }

    fn advance_map(&mut self, iter_ref: ObjRef) -> Value {
        let (src, cursor, version_at_iter) = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => (
                it.source,
                match it.kind { IterSource::MapEntries { cursor, .. } => cursor, _ => unreachable!() },
                match it.kind { IterSource::MapEntries { version_at_iter, .. } => version_at_iter, _ => unreachable!() },
            ),
            _ => unreachable!(),
        };
        let (entries, live_version) = match &self.heap.get(src).payload {
            ObjPayload::Map(m) => (m.entry_array.clone(), m.version),
            _ => (Vec::new(), version_at_iter),
        };
        if live_version != version_at_iter {
            self.panic("map modified during iteration".to_string());
            return Value::Null;
        }
        let mut idx = cursor;
        while idx < entries.len() && matches!(entries[idx].key, Value::Tombstone) {
            idx += 1;
        }
        if idx >= entries.len() {
            self.mark_exhausted(iter_ref);
            return self.build_exhausted();
        }
        let entry = entries[idx];
        if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
            if let IterSource::MapEntries { version_at_iter, .. } = it.kind {
                it.kind = IterSource::MapEntries { cursor: idx + 1, version_at_iter };
            }
        }
        match self.alloc_tup(vec![entry.key, entry.value]) {
            Some(v) => v,
            None => Value::Null,
        }
    }

    fn advance_queue(&mut self, iter_ref: ObjRef) -> Value {
        let next = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => match it.kind {
                IterSource::Queue { next } => next,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        match next {
            None => {
                self.mark_exhausted(iter_ref);
                self.build_exhausted()
            }
            Some(node_ref) => {
                let (value, next_node) = match &self.heap.get(node_ref).payload {
                    ObjPayload::QueueNode(n) => (n.value, n.next),
                    _ => unreachable!(),
                };
                if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
                    it.kind = IterSource::Queue { next: next_node };
                }
                value
            }
        }
    }

    fn advance_range(&mut self, iter_ref: ObjRef) -> Value {
        let (current, stop, step) = match &self.heap.get(iter_ref).payload {
            ObjPayload::Iter(it) => match it.kind {
                IterSource::Range { current, stop, step } => (current, stop, step),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        let done = if step >= 0 { current >= stop } else { current <= stop };
        if done {
            self.mark_exhausted(iter_ref);
            return self.build_exhausted();
        }
        if let ObjPayload::Iter(it) = &mut self.heap.get_mut(iter_ref).payload {
            it.kind = IterSource::Range { current: current + step, stop, step };
        }
        Value::I64(current)
    }

    // -- try/echo/assert/unpack/indexing -------------------------------------

    fn echo(&mut self, n: u8) {
        let mut values = Vec::with_capacity(n as usize);
        for _ in 0..n {
            values.push(self.pop());
        }
        values.reverse();
        let rendered: Vec<String> = values.into_iter().map(|v| self.stringify_value(v)).collect();
        println!("{}", rendered.join(" "));
    }

    fn assert(&mut self, line: u32) {
        let v = self.pop();
        if v.is_falsey() {
            self.panic(format!("assertion failed at line {line}"));
        }
    }

    fn try_op(&mut self) {
        let closure_val = self.pop();
        let stack_len_before = self.roots.stack.len();
        let frames_before = self.roots.frames.len();
        let with_before = self.roots.with_stack.len();
        self.try_depth += 1;
        let panics_before = self.panic_count;

        self.push(closure_val);
        self.invoke(closure_val, 0);
        while self.roots.frames.len() > frames_before {
            if self.panic_count > panics_before || self.exit_flag {
                break;
            }
            if self.step().is_err() {
                break;
            }
        }
        self.try_depth -= 1;

        if self.panic_flag {
            while self.roots.with_stack.len() > with_before {
                let v = self.roots.with_stack.pop().unwrap();
                self.call_end_with(v);
            }
            self.roots.frames.truncate(frames_before);
            self.roots.stack.truncate(stack_len_before);
            self.panic_flag = false;
            let err = self.build_err_from_panic_buffer();
            self.push(err);
        }
    }

    fn build_err_from_panic_buffer(&mut self) -> Value {
        let message = std::mem::take(&mut self.panic_buffer);
        let message_ref = self.intern_str(&message);
        let source_key = self.name("source");
        let line_key = self.name("line");
        let source_val = self.panic_source().map(Value::Obj).unwrap_or(Value::Null);
        let line_val = Value::I64(self.panic_line as i64);
        let details = self.alloc_map(vec![(Value::Obj(source_key), source_val), (Value::Obj(line_key), line_val)], false);
        match (message_ref, details) {
            (Some(m), Some(Value::Obj(d))) => {
                let class = self.roots.builtin_classes[&ObjKind::Err];
                match self.alloc(HeapObject::with_class(ObjPayload::Err(ErrObj { message: Value::Obj(m), details: d }), class)) {
                    Some(r) => Value::Obj(r),
                    None => Value::Null,
                }
            }
            _ => Value::Null,
        }
    }

    fn panic_source(&self) -> Option<ObjRef> {
        self.roots.panic_source
    }

    fn unpack(&mut self, n: u8) {
        let v = self.pop();
        let Some(r) = v.as_obj() else {
            self.panic("cannot destructure a non-tuple value".to_string());
            return;
        };
        let values = match &self.heap.get(r).payload {
            ObjPayload::Tup(t) => t.values.to_vec(),
            _ => {
                self.panic("cannot destructure a non-tuple value".to_string());
                return;
            }
        };
        if values.len() != n as usize {
            self.panic(format!("expected {n} values to unpack, got {}", values.len()));
            return;
        }
        for v in values {
            self.push(v);
        }
    }

    fn get_index(&mut self) {
        let index = self.pop();
        let container = self.pop();
        let Some(r) = container.as_obj() else {
            self.panic("value does not support indexing".to_string());
            return;
        };
        match self.heap.get(r).kind {
            ObjKind::Vec | ObjKind::VecAsStack => {
                let Value::I64(i) = index else {
                    self.panic("vec index must be an integer".to_string());
                    return;
                };
                let values = match &self.heap.get(r).payload {
                    ObjPayload::Vec(v) => &v.values,
                    _ => unreachable!(),
                };
                match resolve_index(i, values.len()) {
                    Some(idx) => self.push(values[idx]),
                    None => self.panic(format!("index {i} out of bounds")),
                }
            }
            ObjKind::Tup => {
                let Value::I64(i) = index else {
                    self.panic("tup index must be an integer".to_string());
                    return;
                };
                let values = match &self.heap.get(r).payload {
                    ObjPayload::Tup(t) => &t.values,
                    _ => unreachable!(),
                };
                match resolve_index(i, values.len()) {
                    Some(idx) => self.push(values[idx]),
                    None => self.panic(format!("index {i} out of bounds")),
                }
            }
            ObjKind::Str => {
                let Value::I64(i) = index else {
                    self.panic("string index must be an integer".to_string());
                    return;
                };
                let text = self.str_contents(r);
                let chars: Vec<char> = text.chars().collect();
                match resolve_index(i, chars.len()) {
                    Some(idx) => self.push(Value::Rune(chars[idx] as u32)),
                    None => self.panic(format!("index {i} out of bounds")),
                }
            }
            ObjKind::Map | ObjKind::MapAsSet | ObjKind::MapAsWeakref => {
                let entries = match &self.heap.get(r).payload {
                    ObjPayload::Map(m) => m.entry_array.clone(),
                    _ => Vec::new(),
                };
                let found = entries.iter().find(|e| !matches!(e.key, Value::Tombstone) && self.values_equal(e.key, index));
                match found {
                    Some(e) => self.push(e.value),
                    None => self.panic("key not found".to_string()),
                }
            }
            _ => {
                let class = self.class_of(container);
                let name = self.name("$get");
                match class.and_then(|c| self.lookup_method_name(c, name, true)) {
                    Some(method) => {
                        let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: container, method }))));
                        match bound {
                            Some(b) => {
                                let result = self.call(Value::Obj(b), &[index]);
                                self.push(result);
                            }
                            None => {}
                        }
                    }
                    None => self.panic("value does not support indexing".to_string()),
                }
            }
        }
    }

    fn set_index(&mut self) {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();
        let Some(r) = container.as_obj() else {
            self.panic("value does not support indexed assignment".to_string());
            self.push(value);
            return;
        };
        match self.heap.get(r).kind {
            ObjKind::Vec | ObjKind::VecAsStack => {
                let Value::I64(i) = index else {
                    self.panic("vec index must be an integer".to_string());
                    self.push(value);
                    return;
                };
                let len = match &self.heap.get(r).payload {
                    ObjPayload::Vec(v) => v.values.len(),
                    _ => 0,
                };
                match resolve_index(i, len) {
                    Some(idx) => {
                        if let ObjPayload::Vec(v) = &mut self.heap.get_mut(r).payload {
                            v.values[idx] = value;
                            v.version += 1;
                        }
                    }
                    None => self.panic(format!("index {i} out of bounds")),
                }
            }
            ObjKind::Map | ObjKind::MapAsSet => {
                if let ObjPayload::Map(m) = &mut self.heap.get_mut(r).payload {
                    if let Some(e) = m.entry_array.iter_mut().find(|e| !matches!(e.key, Value::Tombstone) && e.key == index) {
                        e.value = value;
                    } else {
                        m.entry_array.push(MapEntry { key: index, value });
                        m.live_entry_count += 1;
                    }
                    m.version += 1;
                }
            }
            _ => {
                let class = self.class_of(container);
                let name = self.name("$set");
                match class.and_then(|c| self.lookup_method_name(c, name, true)) {
                    Some(method) => {
                        let bound = self.with_gc_disabled(|vm| vm.alloc(HeapObject::new(ObjPayload::BoundMethod(BoundMethodObj { receiver: container, method }))));
                        if let Some(b) = bound {
                            let _ = self.call(Value::Obj(b), &[index, value]);
                        }
                    }
                    None => self.panic("value does not support indexed assignment".to_string()),
                }
            }
        }
        self.push(value);
    }

    // -- entry points ---------------------------------------------------------

    /// Runs a freshly compiled top-level `FnObj` as the program's main
    /// module, to completion.
    pub fn run_script(&mut self, fn_obj: pyro_core::object::FnObj) -> VmResult<Value> {
        let module_ref = self.alloc(HeapObject::new(ObjPayload::Module(ModuleObj::new()))).ok_or(VmError::OutOfMemory)?;
        let fn_ref = self.alloc(HeapObject::new(ObjPayload::Fn(fn_obj))).ok_or(VmError::OutOfMemory)?;
        let closure_ref = self
            .alloc(HeapObject::new(ObjPayload::Closure(ClosureObj { function: fn_ref, module: module_ref, upvalues: Vec::new(), default_values: None })))
            .ok_or(VmError::OutOfMemory)?;
        let result = self.call(Value::Obj(closure_ref), &[]);
        if self.panic_flag && self.try_depth == 0 {
            return Err(VmError::Uncaught(self.panic_buffer.clone()));
        }
        Ok(result)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a (possibly negative, per §4.3's indexing convention) index
/// against a collection length. `None` means out of bounds.
fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

impl Roots for Vm {
    fn trace_roots(&self, push: &mut dyn FnMut(ObjRef)) {
        self.roots.trace_roots(push);
    }
}

impl NativeContext for Vm {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.intern_str(s).unwrap_or(self.roots.empty_string)
    }

    fn panic(&mut self, message: String) {
        Vm::panic(self, message);
    }

    fn call_value(&mut self, callee: Value, args: &[Value]) -> Value {
        self.call(callee, args)
    }

    fn alloc_vec(&mut self, values: Vec<Value>, is_stack: bool) -> Value {
        Vm::alloc_vec(self, values, is_stack).unwrap_or(Value::Null)
    }

    fn alloc_tup(&mut self, values: Vec<Value>) -> Value {
        Vm::alloc_tup(self, values).unwrap_or(Value::Null)
    }

    fn alloc_map(&mut self, entries: Vec<(Value, Value)>, is_set: bool) -> Value {
        Vm::alloc_map(self, entries, is_set).unwrap_or(Value::Null)
    }

    fn alloc_with_class(&mut self, payload: ObjPayload, class: ObjRef) -> Value {
        self.alloc(HeapObject::with_class(payload, class)).map(Value::Obj).unwrap_or(Value::Null)
    }

    fn alloc_plain(&mut self, payload: ObjPayload) -> Value {
        self.alloc(HeapObject::new(payload)).map(Value::Obj).unwrap_or(Value::Null)
    }

    fn iterator_next(&mut self, iter_ref: ObjRef) -> Value {
        Vm::iterator_next(self, iter_ref)
    }

    fn builtin_class(&self, kind: ObjKind) -> ObjRef {
        Vm::builtin_class(self, kind)
    }

    fn get_method(&self, receiver: Value, name: &str) -> Value {
        let Some(class) = self.class_of(receiver) else { return Value::Null };
        let Some(&name_ref) = self.roots.names.get(name) else { return Value::Null };
        self.lookup_method_name(class, name_ref, true).unwrap_or(Value::Null)
    }
}

enum IterSourceTag {
    Vec,
    Tup,
    StrChars,
    MapEntries,
    Queue,
    Range,
    Other,
}

/// `IterObj` lives in `pyro-core`; Rust's orphan rules forbid an inherent
/// impl on a foreign type here, so this is a free function instead.
fn iter_source_tag(kind: &IterSource) -> IterSourceTag {
    match kind {
        IterSource::Vec { .. } => IterSourceTag::Vec,
        IterSource::Tup { .. } => IterSourceTag::Tup,
        IterSource::StrChars { .. } => IterSourceTag::StrChars,
        IterSource::MapEntries { .. } => IterSourceTag::MapEntries,
        IterSource::Queue { .. } => IterSourceTag::Queue,
        IterSource::Range { .. } => IterSourceTag::Range,
        _ => IterSourceTag::Other,
    }
}
