//! object.rs — heap object kinds (§3).
//!
//! Every heap object is a [`HeapObject`]: the common header (`class`, `kind`,
//! `marked`) plus a per-kind [`ObjPayload`]. The spec's intrusive `next`
//! pointer is implicit — [`crate::heap::Heap`] is itself the object list.

use ahash::AHashMap;

use crate::heap::ObjRef;
use crate::value::Value;

/// Discriminant mirroring the spec's object-kind table (§3). Kept alongside
/// `ObjPayload` (rather than inferred from it) so hot dispatch code — method
/// lookup, the disassembler, `$type`-style reflection — can match on a plain
/// byte instead of the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    Str,
    Map,
    MapAsSet,
    MapAsWeakref,
    Vec,
    VecAsStack,
    Tup,
    Buf,
    Fn,
    Closure,
    NativeFn,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    Module,
    Iter,
    Queue,
    File,
    Err,
    ResourcePointer,
    #[cfg(test)]
    TestDummy,
}

/// The common object header plus its kind-specific payload.
pub struct HeapObject {
    /// `None` for kinds with no associated class (e.g. a bare `Fn` before
    /// it's wrapped in a `Closure`); `Some` for everything built-in-class
    /// backed.
    pub class: Option<ObjRef>,
    pub kind: ObjKind,
    pub marked: bool,
    pub payload: ObjPayload,
}

impl HeapObject {
    pub fn new(payload: ObjPayload) -> Self {
        Self { class: None, kind: payload.kind(), marked: false, payload }
    }

    pub fn with_class(payload: ObjPayload, class: ObjRef) -> Self {
        Self { class: Some(class), kind: payload.kind(), marked: false, payload }
    }
}

/// An immutable, interned byte string.
pub struct StrObj {
    pub bytes: Box<str>,
    pub hash: u64,
}

/// A single entry in a [`MapObj`]'s append-only entry array. `Value::Tombstone`
/// in `key` marks a deleted slot (skipped on iteration, kept so later probes
/// don't stop short).
#[derive(Clone, Copy)]
pub struct MapEntry {
    pub key: Value,
    pub value: Value,
}

/// Two-array linear-probed hash map (§4.3/§4.4). `entry_array` preserves
/// insertion order; `index_array` holds signed indices into it (negative =
/// empty/tombstone) and is what gets linearly probed by key hash.
pub struct MapObj {
    pub entry_array: Vec<MapEntry>,
    pub live_entry_count: usize,
    pub index_array: Vec<i64>,
    pub max_load_threshold: usize,
    /// Bumped on every mutating operation; lets an in-flight iterator detect
    /// structural modification (resolves the spec's Open Question in favour
    /// of Vec's existing `version` mechanism — see SPEC_FULL.md §9).
    pub version: u64,
    /// True for the `MapAsSet` / `MapAsWeakref` presentations, where values
    /// are ignored (`MapAsSet`) or held weakly (`MapAsWeakref`, cleared to
    /// `Tombstone` at sweep time instead of keeping the referent alive).
    pub is_weakref: bool,
}

pub const MAX_HASHMAP_LOAD: f64 = 0.6;

impl MapObj {
    pub fn new() -> Self {
        Self {
            entry_array: Vec::new(),
            live_entry_count: 0,
            index_array: vec![-1; 8],
            max_load_threshold: (8f64 * MAX_HASHMAP_LOAD) as usize,
            version: 0,
            is_weakref: false,
        }
    }
}

impl Default for MapObj {
    fn default() -> Self {
        Self::new()
    }
}

/// Contiguous, growable `Value` array backing both `Vec` and the
/// stack-restricted `VecAsStack` presentation.
pub struct VecObj {
    pub values: Vec<Value>,
    /// Bumped on every push/pop/insert/remove/clear; iterators snapshot this
    /// at `$iter()` time and detect mutation at `$next()`.
    pub version: u64,
    pub is_stack: bool,
}

impl VecObj {
    pub fn new() -> Self {
        Self { values: Vec::new(), version: 0, is_stack: false }
    }
}

impl Default for VecObj {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-count, immutable-after-construction `Value` array.
pub struct TupObj {
    pub values: Box<[Value]>,
}

/// Growable byte array (`buf` literal / `$buf()` built-in).
pub struct BufObj {
    pub bytes: Vec<u8>,
}

/// Run-length-encoded `bytes-per-line` line table (§4.2's line-number
/// table). `bpl[i]` is how many bytecode bytes were emitted while the
/// compiler's current line was `first_line + i`.
#[derive(Default, Clone)]
pub struct LineTable {
    pub first_line: u32,
    pub bytes_per_line: Vec<u32>,
}

impl LineTable {
    pub fn record(&mut self, line: u32) {
        if self.bytes_per_line.is_empty() {
            self.first_line = line;
        }
        let slot = (line - self.first_line) as usize;
        if slot >= self.bytes_per_line.len() {
            self.bytes_per_line.resize(slot + 1, 0);
        }
        self.bytes_per_line[slot] += 1;
    }

    /// Computes the source line for a given bytecode offset by linear
    /// accumulation, per §4.2.
    pub fn line_for(&self, ip: usize) -> u32 {
        let mut remaining = ip as i64;
        for (i, &count) in self.bytes_per_line.iter().enumerate() {
            remaining -= count as i64;
            if remaining < 0 {
                return self.first_line + i as u32;
            }
        }
        self.first_line + self.bytes_per_line.len().saturating_sub(1) as u32
    }
}

/// Compiled-function payload: bytecode, constants, and debug metadata.
/// Never called directly — always wrapped in a [`ClosureObj`], even for
/// top-level/module bodies (which close over zero upvalues).
pub struct FnObj {
    pub name: String,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub arity: u8,
    pub is_variadic: bool,
    pub upvalue_count: u8,
    /// One entry per upvalue this function's closures capture, in capture
    /// order (`upvalue_descs.len() == upvalue_count as usize`). `MakeClosure`
    /// reads this straight off the nested `FnObj` it just loaded from the
    /// constant pool to know, for each upvalue, whether to grab a local off
    /// the *enclosing* frame or an upvalue already captured by the
    /// *enclosing* closure.
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub source_id: ObjRef,
    pub lines: LineTable,
}

/// Describes one upvalue a [`ClosureObj`] captures, as recorded by the
/// compiler: either a local slot in the immediately enclosing function
/// (`is_local = true`) or an upvalue already captured by that enclosing
/// closure (`is_local = false`, `index` is an index into *its* upvalue
/// array).
#[derive(Clone, Copy)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

pub struct ClosureObj {
    pub function: ObjRef,
    pub module: ObjRef,
    pub upvalues: Vec<ObjRef>,
    /// Sidecar default-argument values, parsed in the *enclosing* compiler
    /// context per §4.2 ("Default argument values must be literal").
    pub default_values: Option<Vec<Value>>,
}

/// `receiver` is `Value::Null` for a bare function and the bound `self` for
/// a method, mirroring the original C host's `argv[-1]` convention (§6)
/// without requiring native code to reach one slot below `args`.
pub type NativeFnPtr = fn(&mut dyn crate::native::NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String>;

pub struct NativeFnObj {
    pub name: String,
    /// `-1` encoded as `i16::MIN`'s sibling convention isn't needed in Rust —
    /// we use `Option<u8>`, `None` meaning variadic.
    pub arity: Option<u8>,
    pub func: NativeFnPtr,
}

/// Either points at a live stack slot (`Open`) or owns a closed-over value
/// (`Closed`). All `Open` upvalues are threaded on the VM's
/// descending-stack-depth list; see `pyro-vm::vm::Vm::open_upvalues`.
pub enum UpvalueState {
    Open { stack_index: usize },
    Closed { value: Value },
}

pub struct UpvalueObj {
    pub state: UpvalueState,
}

/// A class's method/field tables. `all_*` always dominates `pub_*`
/// (pointer-identical values for shared names) per the invariant in §3.
pub struct ClassObj {
    pub name: String,
    pub superclass: Option<ObjRef>,
    pub all_instance_methods: AHashMap<ObjRef, Value>,
    pub pub_instance_methods: AHashMap<ObjRef, Value>,
    pub all_field_indexes: AHashMap<ObjRef, usize>,
    pub pub_field_indexes: AHashMap<ObjRef, usize>,
    pub default_field_values: Vec<Value>,
    pub static_members: AHashMap<ObjRef, Value>,
    pub init_method: Option<Value>,
    /// Last `(name, value)` lookup, as a cheap inline cache.
    pub last_lookup: Option<(ObjRef, Value)>,
}

impl ClassObj {
    pub fn new(name: String) -> Self {
        Self {
            name,
            superclass: None,
            all_instance_methods: AHashMap::new(),
            pub_instance_methods: AHashMap::new(),
            all_field_indexes: AHashMap::new(),
            pub_field_indexes: AHashMap::new(),
            default_field_values: Vec::new(),
            static_members: AHashMap::new(),
            init_method: None,
            last_lookup: None,
        }
    }
}

pub struct InstanceObj {
    pub fields: Vec<Value>,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: Value,
}

pub struct ModuleObj {
    pub members: Vec<Value>,
    pub all_member_indexes: AHashMap<ObjRef, usize>,
    pub pub_member_indexes: AHashMap<ObjRef, usize>,
    pub submodules: AHashMap<ObjRef, ObjRef>,
}

impl ModuleObj {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            all_member_indexes: AHashMap::new(),
            pub_member_indexes: AHashMap::new(),
            submodules: AHashMap::new(),
        }
    }
}

impl Default for ModuleObj {
    fn default() -> Self {
        Self::new()
    }
}

/// Discriminates the many things `$iter()`/`GET_NEXT_FROM_ITERATOR` can walk.
pub enum IterSource {
    StrBytes { cursor: usize },
    StrChars { cursor: usize },
    StrLines { cursor: usize },
    Vec { cursor: usize },
    Tup { cursor: usize },
    MapKeys { cursor: usize, version_at_iter: u64 },
    MapValues { cursor: usize, version_at_iter: u64 },
    MapEntries { cursor: usize, version_at_iter: u64 },
    Queue { next: Option<ObjRef> },
    Range { current: i64, stop: i64, step: i64 },
    FileLines,
    /// Wraps an arbitrary object implementing `$iter`/`$next` natively so
    /// generic host iterators compose with the bytecode-level protocol.
    Generic,
    Enumerate { inner: ObjRef, index: i64 },
    FuncMap { inner: ObjRef, callback: Value },
    FuncFilter { inner: ObjRef, callback: Value },
}

pub struct IterObj {
    pub source: ObjRef,
    pub kind: IterSource,
    pub exhausted: bool,
}

pub struct QueueNode {
    pub value: Value,
    pub next: Option<ObjRef>,
}

pub struct QueueObj {
    pub head: Option<ObjRef>,
    pub tail: Option<ObjRef>,
    pub count: usize,
}

impl QueueObj {
    pub fn new() -> Self {
        Self { head: None, tail: None, count: 0 }
    }
}

impl Default for QueueObj {
    fn default() -> Self {
        Self::new()
    }
}

/// A host stream handle. The payload itself never performs I/O — that's a
/// `pyro-stdlib` concern wired through native methods; this is just storage.
pub struct FileObj {
    pub path: Option<String>,
    pub handle: FileHandle,
    /// Byte offset of the next read, maintained by `pyro-stdlib`'s file
    /// methods since `FileHandle::Path` carries no open file descriptor of
    /// its own (each operation opens the path fresh).
    pub cursor: u64,
}

pub enum FileHandle {
    Stdin,
    Stdout,
    Stderr,
    Path(std::path::PathBuf),
    Closed,
}

pub struct ErrObj {
    pub message: Value,
    pub details: ObjRef, // a Map
}

/// An opaque native resource with a free-callback invoked by the GC sweep,
/// not by `drop` — matching §4.6 step 3 ("ResourcePointer invokes its
/// free-callback").
pub struct ResourcePointerObj {
    pub free_callback: Option<Box<dyn FnMut() + Send>>,
    pub tag: &'static str,
}

pub enum ObjPayload {
    Str(StrObj),
    Map(MapObj),
    Vec(VecObj),
    Tup(TupObj),
    Buf(BufObj),
    Fn(FnObj),
    Closure(ClosureObj),
    NativeFn(NativeFnObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Module(ModuleObj),
    Iter(IterObj),
    Queue(QueueObj),
    QueueNode(QueueNode),
    File(FileObj),
    Err(ErrObj),
    ResourcePointer(ResourcePointerObj),
    #[cfg(test)]
    TestDummy,
}

impl ObjPayload {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjPayload::Str(_) => ObjKind::Str,
            ObjPayload::Map(m) => if m.is_weakref { ObjKind::MapAsWeakref } else { ObjKind::Map },
            ObjPayload::Vec(v) => if v.is_stack { ObjKind::VecAsStack } else { ObjKind::Vec },
            ObjPayload::Tup(_) => ObjKind::Tup,
            ObjPayload::Buf(_) => ObjKind::Buf,
            ObjPayload::Fn(_) => ObjKind::Fn,
            ObjPayload::Closure(_) => ObjKind::Closure,
            ObjPayload::NativeFn(_) => ObjKind::NativeFn,
            ObjPayload::Upvalue(_) => ObjKind::Upvalue,
            ObjPayload::Class(_) => ObjKind::Class,
            ObjPayload::Instance(_) => ObjKind::Instance,
            ObjPayload::BoundMethod(_) => ObjKind::BoundMethod,
            ObjPayload::Module(_) => ObjKind::Module,
            ObjPayload::Iter(_) => ObjKind::Iter,
            ObjPayload::Queue(_) | ObjPayload::QueueNode(_) => ObjKind::Queue,
            ObjPayload::File(_) => ObjKind::File,
            ObjPayload::Err(_) => ObjKind::Err,
            ObjPayload::ResourcePointer(_) => ObjKind::ResourcePointer,
            #[cfg(test)]
            ObjPayload::TestDummy => ObjKind::TestDummy,
        }
    }

    /// Approximate logical size in bytes, used to drive `bytes_allocated`.
    /// Doesn't need to be exact (the spec never mandates a unit), only
    /// monotonic with actual memory use so the GC threshold means something.
    pub fn heap_size(&self) -> usize {
        match self {
            ObjPayload::Str(s) => std::mem::size_of::<StrObj>() + s.bytes.len(),
            ObjPayload::Map(m) => {
                std::mem::size_of::<MapObj>()
                    + m.entry_array.capacity() * std::mem::size_of::<MapEntry>()
                    + m.index_array.capacity() * std::mem::size_of::<i64>()
            }
            ObjPayload::Vec(v) => std::mem::size_of::<VecObj>() + v.values.capacity() * std::mem::size_of::<Value>(),
            ObjPayload::Tup(t) => std::mem::size_of::<TupObj>() + t.values.len() * std::mem::size_of::<Value>(),
            ObjPayload::Buf(b) => std::mem::size_of::<BufObj>() + b.bytes.capacity(),
            ObjPayload::Fn(f) => std::mem::size_of::<FnObj>() + f.code.len() + f.constants.len() * std::mem::size_of::<Value>(),
            ObjPayload::Closure(c) => std::mem::size_of::<ClosureObj>() + c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            ObjPayload::NativeFn(_) => std::mem::size_of::<NativeFnObj>(),
            ObjPayload::Upvalue(_) => std::mem::size_of::<UpvalueObj>(),
            ObjPayload::Class(c) => std::mem::size_of::<ClassObj>() + c.default_field_values.len() * std::mem::size_of::<Value>(),
            ObjPayload::Instance(i) => std::mem::size_of::<InstanceObj>() + i.fields.len() * std::mem::size_of::<Value>(),
            ObjPayload::BoundMethod(_) => std::mem::size_of::<BoundMethodObj>(),
            ObjPayload::Module(m) => std::mem::size_of::<ModuleObj>() + m.members.len() * std::mem::size_of::<Value>(),
            ObjPayload::Iter(_) => std::mem::size_of::<IterObj>(),
            ObjPayload::Queue(_) => std::mem::size_of::<QueueObj>(),
            ObjPayload::QueueNode(_) => std::mem::size_of::<QueueNode>(),
            ObjPayload::File(_) => std::mem::size_of::<FileObj>(),
            ObjPayload::Err(_) => std::mem::size_of::<ErrObj>(),
            ObjPayload::ResourcePointer(_) => std::mem::size_of::<ResourcePointerObj>(),
            #[cfg(test)]
            ObjPayload::TestDummy => 0,
        }
    }

    #[cfg(test)]
    pub fn test_dummy() -> Self {
        ObjPayload::TestDummy
    }
}
