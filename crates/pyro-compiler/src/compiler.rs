//! compiler.rs — single-pass recursive-descent compiler (§4.2).
//!
//! There is no AST: every production emits bytecode directly into the
//! current [`FuncState`]'s `Writer` as it is recognised, the same shape as
//! the teacher's `vitte-compiler::Codegen::emit`, generalized from a
//! four-keyword MVP grammar to the full expression/statement grammar. Each
//! nested `def`/method pushes a new `FuncState`; closing it produces a
//! [`FnObj`] that becomes a constant in its *enclosing* function, exactly
//! mirroring how the compiler shares the live heap with the running VM
//! (constants — including every interned name — are allocated as they are
//! parsed, not staged in a separate compile-time table).

use pyro_core::bytecode::{Op, Writer, MAX_JUMP};
use pyro_core::heap::{Heap, ObjRef};
use pyro_core::object::{FnObj, HeapObject, LineTable, ObjPayload, UpvalueDesc};
use pyro_core::strings::StringPool;
use pyro_core::value::Value;

use crate::error::{CompileError, CompileResult};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
    is_constant: bool,
}

#[derive(Clone, Copy)]
struct Upvalue {
    index: u8,
    is_local: bool,
    is_constant: bool,
}

/// Converts the compiler's resolve-time [`Upvalue`] table (which also tracks
/// `is_constant` for the captured-constant-assignment check) into the
/// `FnObj`'s persisted [`UpvalueDesc`]s, which is all `MAKE_CLOSURE` needs at
/// runtime: whether to grab a local off the *enclosing* frame or an upvalue
/// already captured by the *enclosing* closure.
fn to_upvalue_descs(upvalues: &[Upvalue]) -> Vec<UpvalueDesc> {
    upvalues.iter().map(|u| UpvalueDesc { index: u.index, is_local: u.is_local }).collect()
}

struct LoopCtx {
    start_ip: usize,
    with_depth_at_start: u32,
    /// Scope depth *before* the loop's own scope (and, for `for`, its hidden
    /// iterator local) was pushed. `break` must pop every local declared
    /// deeper than this before jumping, since it skips the normal
    /// `end_scope` unwind emitted at the loop statement's lexical end.
    scope_depth_at_start: i32,
    /// Target depth for `continue`: same as `scope_depth_at_start` for
    /// `while`/`loop`, but one deeper for `for` so the hidden iterator local
    /// (which `continue`'s jump-back still needs) survives the discard.
    continue_scope_depth: i32,
    break_patches: Vec<usize>,
}

/// Per-function compilation state. `locals[0]` is always reserved: the
/// receiver for a method (`self`), or simply unnamed/unreachable for a
/// plain function — mirroring the common clox convention of slot 0 always
/// being occupied before user locals begin.
struct FuncState {
    name: String,
    code: Vec<u8>,
    lines: LineTable,
    constants: Vec<Value>,
    arity: u8,
    is_variadic: bool,
    is_method: bool,
    scope_depth: i32,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    loops: Vec<LoopCtx>,
    with_depth: u32,
}

impl FuncState {
    fn new(name: impl Into<String>, is_method: bool) -> Self {
        let reserved = Local {
            name: if is_method { "self".to_string() } else { String::new() },
            depth: 0,
            is_captured: false,
            is_constant: true,
        };
        Self {
            name: name.into(),
            code: Vec::new(),
            lines: LineTable::default(),
            constants: Vec::new(),
            arity: 0,
            is_variadic: false,
            is_method,
            scope_depth: 0,
            locals: vec![reserved],
            upvalues: Vec::new(),
            loops: Vec::new(),
            with_depth: 0,
        }
    }
}

pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    prev: Token,
    cur: Token,
    source_name: String,
    source_id: ObjRef,
    heap: &'src mut Heap,
    strings: &'src mut StringPool,
    funcs: Vec<FuncState>,
}

const DUMMY: TokenKind = TokenKind::Eof;

impl<'src> Compiler<'src> {
    pub fn compile(source: &'src str, source_name: &str, heap: &'src mut Heap, strings: &'src mut StringPool) -> CompileResult<FnObj> {
        let source_id = strings
            .intern(heap, source_name)
            .map_err(|_| CompileError { source_name: source_name.into(), line: 0, message: "out of memory interning source name".into() })?;
        let mut lexer = Lexer::new(source, source_name);
        let first = lexer.next_token()?;
        let mut c = Compiler {
            lexer,
            prev: Token { kind: DUMMY, line: first.line },
            cur: first,
            source_name: source_name.into(),
            source_id,
            heap,
            strings,
            funcs: vec![FuncState::new("<script>", false)],
        };
        while !c.check(&TokenKind::Eof) {
            c.declaration()?;
        }
        let line = c.cur.line;
        c.emit(Op::LoadNull, line);
        c.emit(Op::Return, line);
        let state = c.funcs.pop().unwrap();
        Ok(FnObj {
            name: state.name,
            code: state.code,
            constants: state.constants,
            arity: state.arity,
            is_variadic: state.is_variadic,
            upvalue_count: state.upvalues.len() as u8,
            upvalue_descs: to_upvalue_descs(&state.upvalues),
            source_id: c.source_id,
            lines: state.lines,
        })
    }

    // -- token stream helpers ------------------------------------------------

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError { source_name: self.source_name.clone(), line: self.cur.line, message: message.into() }
    }

    fn advance(&mut self) -> CompileResult<()> {
        let next = self.lexer.next_token()?;
        self.prev = std::mem::replace(&mut self.cur, next);
        Ok(())
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.cur.kind) == std::mem::discriminant(kind)
    }

    fn matches(&mut self, kind: TokenKind) -> CompileResult<bool> {
        if self.check(&kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> CompileResult<()> {
        if self.check(&kind) {
            self.advance()
        } else {
            Err(self.err(message))
        }
    }

    fn expect_ident(&mut self, message: &str) -> CompileResult<String> {
        match &self.cur.kind {
            TokenKind::Ident(s) => {
                let s = s.clone();
                self.advance()?;
                Ok(s)
            }
            _ => Err(self.err(message)),
        }
    }

    // -- current function state ----------------------------------------------

    fn cur_fn(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn writer(&mut self) -> Writer<'_> {
        let f = self.funcs.last_mut().unwrap();
        Writer::new(&mut f.code, &mut f.lines)
    }

    fn emit(&mut self, op: Op, line: u32) -> usize {
        self.writer().emit(op, line)
    }

    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit(op, line) + 1
    }

    fn patch_jump(&mut self, operand_at: usize) -> CompileResult<()> {
        self.writer().patch_jump_operand(operand_at).map_err(|e| self.err(e))
    }

    fn emit_jump_back(&mut self, loop_start: usize, line: u32) -> CompileResult<()> {
        let after = self.cur_fn().code.len() + 3;
        let distance = after - loop_start;
        if distance as u32 > MAX_JUMP {
            return Err(self.err("loop body too large to jump back over"));
        }
        self.emit(Op::JumpBack(distance as u16), line);
        Ok(())
    }

    fn intern(&mut self, s: &str) -> CompileResult<ObjRef> {
        self.strings.intern(self.heap, s).map_err(|_| self.err("out of memory interning string"))
    }

    /// Interns `s` and adds it as a constant in the *current* function,
    /// deduping against an existing `Value::Obj` entry for the same
    /// `ObjRef` (string interning already gives pointer equality, so this
    /// dedup is just a linear scan for a matching handle).
    fn const_str(&mut self, s: &str) -> CompileResult<u16> {
        let r = self.intern(s)?;
        let v = Value::Obj(r);
        let f = self.cur_fn();
        if let Some(i) = f.constants.iter().position(|existing| *existing == v) {
            return Ok(i as u16);
        }
        f.constants.push(v);
        Ok((f.constants.len() - 1) as u16)
    }

    fn const_value(&mut self, v: Value) -> u16 {
        let f = self.cur_fn();
        if let Some(i) = f.constants.iter().position(|existing| *existing == v) {
            return i as u16;
        }
        f.constants.push(v);
        (f.constants.len() - 1) as u16
    }

    fn load_constant(&mut self, idx: u16, line: u32) {
        if idx <= 9 {
            self.emit(Op::LoadConstantSmall(idx as u8), line);
        } else {
            self.emit(Op::LoadConstant(idx), line);
        }
    }

    // -- scopes / locals / upvalues ------------------------------------------

    fn begin_scope(&mut self) {
        self.cur_fn().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        self.cur_fn().scope_depth -= 1;
        let depth = self.cur_fn().scope_depth;
        while let Some(local) = self.cur_fn().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.cur_fn().locals.last().unwrap().is_captured {
                self.emit(Op::CloseUpvalue, line);
            } else {
                self.emit(Op::Pop, line);
            }
            self.cur_fn().locals.pop();
        }
    }

    fn add_local(&mut self, name: &str, is_constant: bool) -> CompileResult<u8> {
        let f = self.cur_fn();
        if f.locals.len() >= 256 {
            return Err(self.err("too many local variables in one function"));
        }
        let depth = f.scope_depth;
        f.locals.push(Local { name: name.to_string(), depth, is_captured: false, is_constant });
        Ok((f.locals.len() - 1) as u8)
    }

    fn resolve_local(&self, func_idx: usize, name: &str) -> Option<(u8, bool)> {
        let f = &self.funcs[func_idx];
        for (i, local) in f.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i as u8, local.is_constant));
            }
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool, is_constant: bool) -> CompileResult<u8> {
        let f = &mut self.funcs[func_idx];
        for (i, up) in f.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if f.upvalues.len() >= 256 {
            return Err(self.err("too many captured variables in one function"));
        }
        f.upvalues.push(Upvalue { index, is_local, is_constant });
        Ok((f.upvalues.len() - 1) as u8)
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> CompileResult<Option<(u8, bool)>> {
        if func_idx == 0 {
            return Ok(None);
        }
        let parent = func_idx - 1;
        if let Some((slot, is_const)) = self.resolve_local(parent, name) {
            self.funcs[parent].locals[slot as usize].is_captured = true;
            let up = self.add_upvalue(func_idx, slot, true, is_const)?;
            return Ok(Some((up, is_const)));
        }
        if let Some((slot, is_const)) = self.resolve_upvalue(parent, name)? {
            let up = self.add_upvalue(func_idx, slot, false, is_const)?;
            return Ok(Some((up, is_const)));
        }
        Ok(None)
    }

    /// Binds whatever value currently sits on top of the stack to `name`:
    /// a local slot if inside a scope, otherwise a global.
    fn define_variable(&mut self, name: &str, is_pub: bool, is_constant: bool, line: u32) -> CompileResult<()> {
        if self.cur_fn().scope_depth > 0 {
            self.add_local(name, is_constant)?;
            Ok(())
        } else {
            let idx = self.const_str(name)?;
            self.emit(if is_pub { Op::DefinePubGlobal(idx) } else { Op::DefinePriGlobal(idx) }, line);
            Ok(())
        }
    }

    // -- top-level dispatch ---------------------------------------------------

    fn declaration(&mut self) -> CompileResult<()> {
        let mut is_pub = false;
        let mut is_pri = false;
        if self.matches(TokenKind::Pub)? {
            is_pub = true;
        } else if self.matches(TokenKind::Pri)? {
            is_pri = true;
        }
        let _ = is_pri;
        if self.check(&TokenKind::Var) {
            self.advance()?;
            self.var_decl(is_pub, false)
        } else if self.check(&TokenKind::Let) {
            self.advance()?;
            self.var_decl(is_pub, true)
        } else if self.check(&TokenKind::Def) {
            self.advance()?;
            self.def_decl(is_pub)
        } else if self.check(&TokenKind::Class) {
            self.advance()?;
            self.class_decl(is_pub)
        } else if self.check(&TokenKind::Enum) {
            self.advance()?;
            self.enum_decl(is_pub)
        } else if self.check(&TokenKind::Typedef) {
            self.advance()?;
            self.typedef_decl()
        } else if is_pub {
            Err(self.err("expected a declaration after 'pub'"))
        } else {
            self.statement()
        }
    }

    fn var_decl(&mut self, is_pub: bool, is_const: bool) -> CompileResult<()> {
        let name = self.expect_ident("expected variable name")?;
        let line = self.prev.line;
        if self.matches(TokenKind::Eq)? {
            self.expression()?;
        } else {
            self.emit(Op::LoadNull, line);
        }
        self.expect(TokenKind::Semicolon, "expected ';' after variable declaration")?;
        self.define_variable(&name, is_pub, is_const, line)
    }

    fn typedef_decl(&mut self) -> CompileResult<()> {
        self.expect_ident("expected a type name after 'typedef'")?;
        if self.matches(TokenKind::Eq)? {
            while !self.check(&TokenKind::Semicolon) && !self.check(&TokenKind::Eof) {
                self.advance()?;
            }
        }
        self.expect(TokenKind::Semicolon, "expected ';' after typedef")
    }

    fn enum_decl(&mut self, is_pub: bool) -> CompileResult<()> {
        let name = self.expect_ident("expected enum name")?;
        self.expect(TokenKind::LBrace, "expected '{' to start enum body")?;
        let mut variants = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                variants.push(self.expect_ident("expected variant name")?);
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' to close enum body")?;
        let line = self.prev.line;
        for v in &variants {
            let idx = self.const_str(v)?;
            self.load_constant(idx, line);
        }
        let name_idx = self.const_str(&name)?;
        self.emit(Op::MakeEnum(name_idx, variants.len() as u16), line);
        self.define_variable(&name, is_pub, true, line)
    }

    // -- function / closure compilation ---------------------------------------

    /// Parses `(params) { body }` as a brand-new [`FuncState`], returning the
    /// finished [`FnObj`] plus the literal default-argument values (compiled
    /// in *this*, the enclosing, context, per §4.2).
    fn function_body(&mut self, name: &str, is_method: bool) -> CompileResult<(FnObj, Vec<Value>)> {
        self.funcs.push(FuncState::new(name, is_method));
        self.expect(TokenKind::LParen, "expected '(' after function name")?;
        let mut defaults = Vec::new();
        let mut seen_default = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.check(&TokenKind::Star) {
                    // `...rest` variadic marker spelled as a single trailing '*'.
                    self.advance()?;
                    let pname = self.expect_ident("expected parameter name after '*'")?;
                    self.add_local(&pname, false)?;
                    self.cur_fn().is_variadic = true;
                    break;
                }
                let pname = self.expect_ident("expected parameter name")?;
                self.add_local(&pname, false)?;
                self.cur_fn().arity += 1;
                if self.matches(TokenKind::Eq)? {
                    seen_default = true;
                    let v = self.literal_value("default argument values must be literals")?;
                    defaults.push(v);
                } else if seen_default {
                    return Err(self.err("non-default parameter follows a default parameter"));
                }
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after parameter list")?;
        self.expect(TokenKind::LBrace, "expected '{' to start function body")?;
        self.begin_scope();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        let line = self.cur.line;
        self.expect(TokenKind::RBrace, "expected '}' to close function body")?;
        self.emit(Op::LoadNull, line);
        self.emit(Op::Return, line);

        let state = self.funcs.pop().unwrap();
        let f = FnObj {
            name: state.name,
            code: state.code,
            constants: state.constants,
            arity: state.arity,
            is_variadic: state.is_variadic,
            upvalue_count: state.upvalues.len() as u8,
            upvalue_descs: to_upvalue_descs(&state.upvalues),
            source_id: self.source_id,
            lines: state.lines,
        };
        Ok((f, defaults))
    }

    /// Compiles a literal-only expression to a [`Value`] without emitting any
    /// bytecode, for default-argument positions.
    fn literal_value(&mut self, message: &str) -> CompileResult<Value> {
        let v = match &self.cur.kind {
            TokenKind::Int(n) => Value::I64(*n),
            TokenKind::Float(n) => Value::F64(*n),
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            TokenKind::Null => Value::Null,
            TokenKind::Rune(c) => Value::Rune(*c as u32),
            TokenKind::RawString(s) | TokenKind::String(s) => {
                let r = self.intern(s)?;
                Value::Obj(r)
            }
            _ => return Err(self.err(message)),
        };
        self.advance()?;
        Ok(v)
    }

    fn def_decl(&mut self, is_pub: bool) -> CompileResult<()> {
        let name = self.expect_ident("expected function name")?;
        let line = self.prev.line;
        let (f, defaults) = self.function_body(&name, false)?;
        let fn_idx = self.const_value(Value::Obj(self.alloc_fn(f)?));
        if defaults.is_empty() {
            self.load_constant(fn_idx, line);
            self.emit(Op::MakeClosure(fn_idx), line);
        } else {
            for d in &defaults {
                let idx = self.const_value(d.clone());
                self.load_constant(idx, line);
            }
            self.emit(Op::MakeClosureWithDefArgs(fn_idx, defaults.len() as u8), line);
        }
        self.define_variable(&name, is_pub, true, line)
    }

    fn alloc_fn(&mut self, f: FnObj) -> CompileResult<ObjRef> {
        self.heap.alloc(HeapObject::new(ObjPayload::Fn(f))).map_err(|_| self.err("out of memory allocating function"))
    }

    // -- class compilation ------------------------------------------------------

    fn class_decl(&mut self, is_pub: bool) -> CompileResult<()> {
        let name = self.expect_ident("expected class name")?;
        let line = self.prev.line;
        let name_idx = self.const_str(&name)?;
        self.emit(Op::MakeClass(name_idx), line);

        if self.matches(TokenKind::Extends)? {
            let super_name = self.expect_ident("expected a superclass name after 'extends'")?;
            self.variable(&super_name, false)?;
            self.emit(Op::Inherit, line);
        }

        self.expect(TokenKind::LBrace, "expected '{' to start class body")?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.class_member()?;
        }
        let close_line = self.cur.line;
        self.expect(TokenKind::RBrace, "expected '}' to close class body")?;
        self.define_variable(&name, is_pub, true, close_line)
    }

    fn class_member(&mut self) -> CompileResult<()> {
        let mut is_pub = false;
        if self.matches(TokenKind::Pub)? {
            is_pub = true;
        } else {
            let _ = self.matches(TokenKind::Pri)?;
        }
        let is_static = self.matches(TokenKind::Static)?;

        if self.matches(TokenKind::Def)? {
            let name = self.expect_ident("expected method name")?;
            let line = self.prev.line;
            let (f, defaults) = self.function_body(&name, !is_static)?;
            let fn_ref = self.alloc_fn(f)?;
            let fn_idx = self.const_value(Value::Obj(fn_ref));
            if defaults.is_empty() {
                self.load_constant(fn_idx, line);
                self.emit(Op::MakeClosure(fn_idx), line);
            } else {
                for d in &defaults {
                    let idx = self.const_value(d.clone());
                    self.load_constant(idx, line);
                }
                self.emit(Op::MakeClosureWithDefArgs(fn_idx, defaults.len() as u8), line);
            }
            let name_idx = self.const_str(&name)?;
            self.emit(
                if is_static {
                    Op::DefineStaticMethod(name_idx)
                } else if is_pub {
                    Op::DefinePubMethod(name_idx)
                } else {
                    Op::DefinePriMethod(name_idx)
                },
                line,
            );
            Ok(())
        } else if self.matches(TokenKind::Var)? || self.matches(TokenKind::Let)? {
            let name = self.expect_ident("expected field name")?;
            let line = self.prev.line;
            if self.matches(TokenKind::Eq)? {
                self.expression()?;
            } else {
                self.emit(Op::LoadNull, line);
            }
            self.expect(TokenKind::Semicolon, "expected ';' after field declaration")?;
            let name_idx = self.const_str(&name)?;
            self.emit(
                if is_static {
                    Op::DefineStaticField(name_idx)
                } else if is_pub {
                    Op::DefinePubField(name_idx)
                } else {
                    Op::DefinePriField(name_idx)
                },
                line,
            );
            Ok(())
        } else {
            Err(self.err("expected a method ('def') or field ('var'/'let') in class body"))
        }
    }

    // -- statements ------------------------------------------------------------

    fn statement(&mut self) -> CompileResult<()> {
        if self.check(&TokenKind::LBrace) {
            self.advance()?;
            self.begin_scope();
            self.block()?;
            let line = self.prev.line;
            self.end_scope(line);
            Ok(())
        } else if self.matches(TokenKind::If)? {
            self.if_statement()
        } else if self.matches(TokenKind::While)? {
            self.while_statement()
        } else if self.matches(TokenKind::Loop)? {
            self.loop_statement()
        } else if self.matches(TokenKind::For)? {
            self.for_statement()
        } else if self.matches(TokenKind::Return)? {
            self.return_statement()
        } else if self.matches(TokenKind::Break)? {
            self.break_statement()
        } else if self.matches(TokenKind::Continue)? {
            self.continue_statement()
        } else if self.matches(TokenKind::Echo)? {
            self.echo_statement()
        } else if self.matches(TokenKind::Assert)? {
            self.assert_statement()
        } else if self.matches(TokenKind::Import)? {
            self.import_statement()
        } else if self.matches(TokenKind::With)? {
            self.with_statement()
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> CompileResult<()> {
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        self.expect(TokenKind::RBrace, "expected '}' to close block")
    }

    fn expression_statement(&mut self) -> CompileResult<()> {
        self.expression()?;
        let line = self.prev.line;
        self.expect(TokenKind::Semicolon, "expected ';' after expression")?;
        self.emit(Op::Pop, line);
        Ok(())
    }

    fn if_statement(&mut self) -> CompileResult<()> {
        self.expect(TokenKind::LParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.expect(TokenKind::RParen, "expected ')' after condition")?;
        let line = self.prev.line;
        let else_jump = self.emit_jump(Op::PopJumpIfFalse(0), line);
        self.statement()?;
        if self.matches(TokenKind::Else)? {
            let end_line = self.prev.line;
            let end_jump = self.emit_jump(Op::Jump(0), end_line);
            self.patch_jump(else_jump)?;
            self.statement()?;
            self.patch_jump(end_jump)?;
        } else {
            self.patch_jump(else_jump)?;
        }
        Ok(())
    }

    fn while_statement(&mut self) -> CompileResult<()> {
        let loop_start = self.cur_fn().code.len();
        let with_depth = self.cur_fn().with_depth;
        let scope_depth = self.cur_fn().scope_depth;
        self.cur_fn().loops.push(LoopCtx {
            start_ip: loop_start,
            with_depth_at_start: with_depth,
            scope_depth_at_start: scope_depth,
            continue_scope_depth: scope_depth,
            break_patches: Vec::new(),
        });
        self.expect(TokenKind::LParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.expect(TokenKind::RParen, "expected ')' after condition")?;
        let line = self.prev.line;
        let exit_jump = self.emit_jump(Op::PopJumpIfFalse(0), line);
        self.statement()?;
        self.emit_jump_back(loop_start, self.prev.line)?;
        self.patch_jump(exit_jump)?;
        self.close_loop()
    }

    fn loop_statement(&mut self) -> CompileResult<()> {
        let loop_start = self.cur_fn().code.len();
        let with_depth = self.cur_fn().with_depth;
        let scope_depth = self.cur_fn().scope_depth;
        self.cur_fn().loops.push(LoopCtx {
            start_ip: loop_start,
            with_depth_at_start: with_depth,
            scope_depth_at_start: scope_depth,
            continue_scope_depth: scope_depth,
            break_patches: Vec::new(),
        });
        self.statement()?;
        self.emit_jump_back(loop_start, self.prev.line)?;
        self.close_loop()
    }

    fn for_statement(&mut self) -> CompileResult<()> {
        let item_name = self.expect_ident("expected loop variable name")?;
        self.expect(TokenKind::In, "expected 'in' after loop variable")?;
        self.expression()?;
        let line = self.prev.line;
        self.emit(Op::GetIterator, line);
        let scope_depth_before_iter = self.cur_fn().scope_depth;
        self.begin_scope();
        let iter_slot = self.add_local("$iter", false)?;

        let loop_start = self.cur_fn().code.len();
        let with_depth = self.cur_fn().with_depth;
        self.cur_fn().loops.push(LoopCtx {
            start_ip: loop_start,
            with_depth_at_start: with_depth,
            scope_depth_at_start: scope_depth_before_iter,
            continue_scope_depth: scope_depth_before_iter + 1,
            break_patches: Vec::new(),
        });
        self.emit(Op::GetLocal(iter_slot), line);
        self.emit(Op::GetNextFromIterator, line);
        // `JumpIfErr` peeks rather than pops: on the "keep looping" path the
        // `$next()` result stays on the stack and becomes the loop variable's
        // slot directly; on exhaustion it's still there for the trailing
        // `Pop` below to discard.
        let exit_jump = self.emit_jump(Op::JumpIfErr(0), line);

        self.begin_scope();
        self.add_local(&item_name, false)?;
        self.statement()?;
        self.end_scope(self.prev.line);

        self.emit_jump_back(loop_start, self.prev.line)?;
        self.patch_jump(exit_jump)?;
        self.emit(Op::Pop, self.prev.line);
        self.close_loop()?;
        self.end_scope(self.prev.line);
        Ok(())
    }

    /// Emits a `Pop`/`CloseUpvalue` for every local declared deeper than
    /// `target_depth`, without removing them from the compiler's `locals`
    /// table (unlike [`Self::end_scope`]): `break`/`continue` jump past the
    /// statement's lexical end, so the locals are still in scope for any
    /// code textually following the jump within the same block.
    fn discard_locals(&mut self, target_depth: i32, line: u32) {
        let count = self.cur_fn().locals.iter().rev().take_while(|l| l.depth > target_depth).count();
        for i in 0..count {
            let idx = self.cur_fn().locals.len() - 1 - i;
            if self.cur_fn().locals[idx].is_captured {
                self.emit(Op::CloseUpvalue, line);
            } else {
                self.emit(Op::Pop, line);
            }
        }
    }

    fn close_loop(&mut self) -> CompileResult<()> {
        let loop_ctx = self.cur_fn().loops.pop().unwrap();
        for pc in loop_ctx.break_patches {
            self.writer().rewrite_break_to_jump(pc);
            self.patch_jump(pc + 1)?;
        }
        Ok(())
    }

    fn break_statement(&mut self) -> CompileResult<()> {
        let line = self.prev.line;
        if self.cur_fn().loops.is_empty() {
            return Err(self.err("'break' outside of a loop"));
        }
        let idx = self.cur_fn().loops.len() - 1;
        let with_depth_at_start = self.cur_fn().loops[idx].with_depth_at_start;
        let scope_depth_at_start = self.cur_fn().loops[idx].scope_depth_at_start;
        self.discard_locals(scope_depth_at_start, line);
        self.emit_pending_end_withs(with_depth_at_start, line);
        let pc = self.emit(Op::Break, line);
        self.cur_fn().loops[idx].break_patches.push(pc);
        self.expect(TokenKind::Semicolon, "expected ';' after 'break'")
    }

    fn continue_statement(&mut self) -> CompileResult<()> {
        let line = self.prev.line;
        if self.cur_fn().loops.is_empty() {
            return Err(self.err("'continue' outside of a loop"));
        }
        let idx = self.cur_fn().loops.len() - 1;
        let loop_start = self.cur_fn().loops[idx].start_ip;
        let with_depth_at_start = self.cur_fn().loops[idx].with_depth_at_start;
        // `continue` re-enters the loop header, which for a `for`-loop sits
        // just *inside* the hidden iterator scope — so unlike `break`, it
        // must not discard the iterator local itself, only anything the
        // loop body declared on top of it.
        let continue_scope_depth = self.cur_fn().loops[idx].continue_scope_depth;
        self.discard_locals(continue_scope_depth, line);
        self.emit_pending_end_withs(with_depth_at_start, line);
        self.emit_jump_back(loop_start, line)?;
        self.expect(TokenKind::Semicolon, "expected ';' after 'continue'")
    }

    fn emit_pending_end_withs(&mut self, target_depth: u32, line: u32) {
        let current = self.cur_fn().with_depth;
        for _ in target_depth..current {
            self.emit(Op::EndWith, line);
        }
    }

    fn return_statement(&mut self) -> CompileResult<()> {
        let line = self.prev.line;
        self.emit_pending_end_withs(0, line);
        if self.matches(TokenKind::Semicolon)? {
            self.emit(Op::LoadNull, line);
            self.emit(Op::Return, line);
            return Ok(());
        }
        self.expression()?;
        let mut n = 1u8;
        while self.matches(TokenKind::Comma)? {
            self.expression()?;
            n += 1;
        }
        self.expect(TokenKind::Semicolon, "expected ';' after return value")?;
        if n == 1 {
            self.emit(Op::Return, line);
        } else {
            self.emit(Op::ReturnTuple(n), line);
        }
        Ok(())
    }

    fn echo_statement(&mut self) -> CompileResult<()> {
        self.expression()?;
        let mut n = 1u8;
        while self.matches(TokenKind::Comma)? {
            self.expression()?;
            n += 1;
        }
        let line = self.prev.line;
        self.expect(TokenKind::Semicolon, "expected ';' after 'echo' arguments")?;
        self.emit(Op::Echo(n), line);
        Ok(())
    }

    fn assert_statement(&mut self) -> CompileResult<()> {
        self.expression()?;
        let line = self.prev.line;
        self.expect(TokenKind::Semicolon, "expected ';' after 'assert' expression")?;
        self.emit(Op::Assert, line);
        Ok(())
    }

    fn with_statement(&mut self) -> CompileResult<()> {
        self.expression()?;
        self.expect(TokenKind::As, "expected 'as' after 'with' expression")?;
        let name = self.expect_ident("expected a name after 'as'")?;
        let line = self.prev.line;
        self.emit(Op::StartWith, line);
        self.begin_scope();
        self.add_local(&name, false)?;
        self.cur_fn().with_depth += 1;
        self.statement()?;
        self.cur_fn().with_depth -= 1;
        self.emit(Op::EndWith, self.prev.line);
        self.end_scope(self.prev.line);
        Ok(())
    }

    fn import_statement(&mut self) -> CompileResult<()> {
        let mut segments = vec![self.expect_ident("expected a module name after 'import'")?];
        loop {
            if !self.matches(TokenKind::ColonColon)? {
                break;
            }
            if self.matches(TokenKind::Star)? {
                let line = self.prev.line;
                for s in &segments {
                    let idx = self.const_str(s)?;
                    self.load_constant(idx, line);
                }
                self.emit(Op::ImportAllMembers(segments.len() as u8), line);
                self.expect(TokenKind::Semicolon, "expected ';' after import")?;
                return Ok(());
            }
            if self.matches(TokenKind::LBrace)? {
                let mut names = Vec::new();
                loop {
                    names.push(self.expect_ident("expected an imported member name")?);
                    if !self.matches(TokenKind::Comma)? {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "expected '}' to close import list")?;
                let mut aliases = names.clone();
                if self.matches(TokenKind::As)? {
                    aliases.clear();
                    loop {
                        aliases.push(self.expect_ident("expected an alias name")?);
                        if !self.matches(TokenKind::Comma)? {
                            break;
                        }
                    }
                    if aliases.len() != names.len() {
                        return Err(self.err("'as' alias list must match the imported member list"));
                    }
                }
                let line = self.prev.line;
                for s in &segments {
                    let idx = self.const_str(s)?;
                    self.load_constant(idx, line);
                }
                for n in &names {
                    let idx = self.const_str(n)?;
                    self.load_constant(idx, line);
                }
                self.emit(Op::ImportNamedMembers(segments.len() as u8, names.len() as u8), line);
                for alias in aliases.iter().rev() {
                    self.define_variable(alias, false, false, line)?;
                }
                self.expect(TokenKind::Semicolon, "expected ';' after import")?;
                return Ok(());
            }
            segments.push(self.expect_ident("expected a module path segment")?);
        }
        let line = self.prev.line;
        for s in &segments {
            let idx = self.const_str(s)?;
            self.load_constant(idx, line);
        }
        self.emit(Op::ImportModule(segments.len() as u8), line);
        let bind_name = if self.matches(TokenKind::As)? { self.expect_ident("expected a name after 'as'")? } else { segments.last().unwrap().clone() };
        self.expect(TokenKind::Semicolon, "expected ';' after import")?;
        self.define_variable(&bind_name, false, false, line)
    }

    // -- expressions -------------------------------------------------------

    fn expression(&mut self) -> CompileResult<()> {
        self.assignment()
    }

    fn assignment(&mut self) -> CompileResult<()> {
        self.ternary(true)
    }

    fn ternary(&mut self, can_assign: bool) -> CompileResult<()> {
        self.logical(can_assign)?;
        if self.matches(TokenKind::Question)? {
            let line = self.prev.line;
            let else_jump = self.emit_jump(Op::PopJumpIfFalse(0), line);
            self.expression()?;
            let end_jump = self.emit_jump(Op::Jump(0), self.prev.line);
            self.patch_jump(else_jump)?;
            self.expect(TokenKind::Colon, "expected ':' in ternary expression")?;
            self.ternary(false)?;
            self.patch_jump(end_jump)?;
        }
        Ok(())
    }

    fn logical(&mut self, can_assign: bool) -> CompileResult<()> {
        self.equality(can_assign)?;
        loop {
            let op = match self.cur.kind {
                TokenKind::AmpAmp => Op::JumpIfFalse(0),
                TokenKind::PipePipe => Op::JumpIfTrue(0),
                TokenKind::QuestionQuestion => Op::JumpIfNotNull(0),
                TokenKind::BangBang => Op::JumpIfTrue(0),
                _ => break,
            };
            self.advance()?;
            let line = self.prev.line;
            let jump = self.emit_jump(op, line);
            self.emit(Op::Pop, line);
            self.equality(false)?;
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn equality(&mut self, can_assign: bool) -> CompileResult<()> {
        self.relational(can_assign)?;
        loop {
            let op = match self.cur.kind {
                TokenKind::EqEq => Op::BinaryEqualEqual,
                TokenKind::BangEq => Op::BinaryBangEqual,
                _ => break,
            };
            self.advance()?;
            let line = self.prev.line;
            self.relational(false)?;
            self.emit(op, line);
        }
        Ok(())
    }

    fn relational(&mut self, can_assign: bool) -> CompileResult<()> {
        self.additive(can_assign)?;
        loop {
            let op = match self.cur.kind {
                TokenKind::Lt => Op::BinaryLess,
                TokenKind::Le => Op::BinaryLessEqual,
                TokenKind::Gt => Op::BinaryGreater,
                TokenKind::Ge => Op::BinaryGreaterEqual,
                TokenKind::In => Op::BinaryIn,
                _ => break,
            };
            self.advance()?;
            let line = self.prev.line;
            self.additive(false)?;
            self.emit(op, line);
        }
        Ok(())
    }

    fn additive(&mut self, can_assign: bool) -> CompileResult<()> {
        self.multiplicative(can_assign)?;
        loop {
            let op = match self.cur.kind {
                TokenKind::Plus => Op::BinaryPlus,
                TokenKind::Minus => Op::BinaryMinus,
                _ => break,
            };
            self.advance()?;
            let line = self.prev.line;
            self.multiplicative(false)?;
            self.emit(op, line);
        }
        Ok(())
    }

    fn multiplicative(&mut self, can_assign: bool) -> CompileResult<()> {
        self.bitwise(can_assign)?;
        loop {
            let op = match self.cur.kind {
                TokenKind::Star => Op::BinaryStar,
                TokenKind::Slash => Op::BinarySlash,
                TokenKind::SlashSlash => Op::BinarySlashSlash,
                TokenKind::Percent => Op::BinaryPercent,
                _ => break,
            };
            self.advance()?;
            let line = self.prev.line;
            self.bitwise(false)?;
            self.emit(op, line);
        }
        Ok(())
    }

    fn bitwise(&mut self, can_assign: bool) -> CompileResult<()> {
        self.unary(can_assign)?;
        loop {
            let op = match self.cur.kind {
                TokenKind::Amp => Op::BinaryAmp,
                TokenKind::Pipe => Op::BinaryBar,
                TokenKind::Caret => Op::BinaryCaret,
                TokenKind::LessLess => Op::BinaryLessLess,
                TokenKind::GreaterGreater => Op::BinaryGreaterGreater,
                _ => break,
            };
            self.advance()?;
            let line = self.prev.line;
            self.unary(false)?;
            self.emit(op, line);
        }
        Ok(())
    }

    fn unary(&mut self, can_assign: bool) -> CompileResult<()> {
        let op = match self.cur.kind {
            TokenKind::Minus => Some(Op::UnaryMinus),
            TokenKind::Plus => Some(Op::UnaryPlus),
            TokenKind::Bang => Some(Op::UnaryBang),
            TokenKind::Tilde => Some(Op::UnaryTilde),
            _ => None,
        };
        if let Some(op) = op {
            self.advance()?;
            let line = self.prev.line;
            self.unary(false)?;
            self.emit(op, line);
            return Ok(());
        }
        if self.matches(TokenKind::Try)? {
            return self.try_expression();
        }
        self.power(can_assign)
    }

    /// `try EXPR` wraps `EXPR` in a synthetic zero-argument closure and
    /// emits `TRY`, which calls it and converts a propagating panic into an
    /// `Err` value instead of unwinding further (§4.7).
    fn try_expression(&mut self) -> CompileResult<()> {
        let line = self.prev.line;
        self.funcs.push(FuncState::new("<try>", false));
        self.unary(false)?;
        self.emit(Op::Return, line);
        let state = self.funcs.pop().unwrap();
        let f = FnObj {
            name: state.name,
            code: state.code,
            constants: state.constants,
            arity: 0,
            is_variadic: false,
            upvalue_count: state.upvalues.len() as u8,
            upvalue_descs: to_upvalue_descs(&state.upvalues),
            source_id: self.source_id,
            lines: state.lines,
        };
        let r = self.alloc_fn(f)?;
        let idx = self.const_value(Value::Obj(r));
        self.load_constant(idx, line);
        self.emit(Op::MakeClosure(idx), line);
        self.emit(Op::Try, line);
        Ok(())
    }

    fn power(&mut self, can_assign: bool) -> CompileResult<()> {
        self.postfix(can_assign)?;
        if self.matches(TokenKind::StarStar)? {
            let line = self.prev.line;
            self.power(false)?; // right-associative
            self.emit(Op::BinaryStarStar, line);
        }
        Ok(())
    }

    fn postfix(&mut self, can_assign: bool) -> CompileResult<()> {
        let base_is_self_or_super = self.primary(can_assign)?;
        let mut receiver_is_privileged = base_is_self_or_super.is_some();
        let mut is_super = base_is_self_or_super == Some(true);
        loop {
            match self.cur.kind {
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.expect_ident("expected a property name after '.'")?;
                    let line = self.prev.line;
                    let name_idx = self.const_str(&name)?;
                    if self.check(&TokenKind::LParen) {
                        self.advance()?;
                        let argc = self.arg_list()?;
                        self.emit_method_call(name_idx, argc, receiver_is_privileged, is_super, line);
                    } else if can_assign && self.matches(TokenKind::Eq)? {
                        self.expression()?;
                        self.emit(if receiver_is_privileged { Op::SetField(name_idx) } else { Op::SetPubField(name_idx) }, line);
                        return Ok(());
                    } else if can_assign && self.compound_assign_op().is_some() {
                        let bin_op = self.compound_assign_op().unwrap();
                        self.advance()?;
                        self.emit(Op::Dup, line);
                        self.emit(if receiver_is_privileged { Op::GetField(name_idx) } else { Op::GetPubField(name_idx) }, line);
                        self.expression()?;
                        self.emit(bin_op, line);
                        self.emit(if receiver_is_privileged { Op::SetField(name_idx) } else { Op::SetPubField(name_idx) }, line);
                        return Ok(());
                    } else {
                        self.emit(if receiver_is_privileged { Op::GetField(name_idx) } else { Op::GetPubField(name_idx) }, line);
                    }
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let name = self.expect_ident("expected a method name after ':'")?;
                    self.expect(TokenKind::LParen, "expected '(' after method name")?;
                    let line = self.prev.line;
                    let name_idx = self.const_str(&name)?;
                    let (argc, unpack) = self.arg_list_with_unpack()?;
                    self.emit_method_call(name_idx, argc, unpack, receiver_is_privileged, is_super, line);
                }
                TokenKind::ColonColon => {
                    self.advance()?;
                    let name = self.expect_ident("expected a member name after '::'")?;
                    let line = self.prev.line;
                    let name_idx = self.const_str(&name)?;
                    self.emit(Op::GetMember(name_idx), line);
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    self.expression()?;
                    self.expect(TokenKind::RBracket, "expected ']' after index expression")?;
                    let line = self.prev.line;
                    if can_assign && self.matches(TokenKind::Eq)? {
                        self.expression()?;
                        self.emit(Op::SetIndex, line);
                        return Ok(());
                    } else if can_assign && self.compound_assign_op().is_some() {
                        let bin_op = self.compound_assign_op().unwrap();
                        self.advance()?;
                        self.emit(Op::Dup2, line);
                        self.emit(Op::GetIndex, line);
                        self.expression()?;
                        self.emit(bin_op, line);
                        self.emit(Op::SetIndex, line);
                        return Ok(());
                    } else {
                        self.emit(Op::GetIndex, line);
                    }
                }
                TokenKind::LParen => {
                    self.advance()?;
                    let (argc, unpack) = self.arg_list_with_unpack()?;
                    let line = self.prev.line;
                    if unpack {
                        self.emit(Op::CallValueWithUnpack(argc), line);
                    } else {
                        self.emit(Op::CallValue(argc), line);
                    }
                }
                _ => break,
            }
            receiver_is_privileged = false;
            is_super = false;
        }
        Ok(())
    }

    fn emit_method_call(&mut self, name_idx: u16, argc: u8, unpack: bool, privileged: bool, is_super: bool, line: u32) {
        let op = match (is_super, privileged, unpack) {
            (true, _, true) => Op::CallSuperMethodWithUnpack(name_idx, argc),
            (true, _, false) => Op::CallSuperMethod(name_idx, argc),
            (false, true, true) => Op::CallMethodWithUnpack(name_idx, argc),
            (false, true, false) => Op::CallMethod(name_idx, argc),
            (false, false, true) => Op::CallPubMethodWithUnpack(name_idx, argc),
            (false, false, false) => Op::CallPubMethod(name_idx, argc),
        };
        self.emit(op, line);
    }

    fn compound_assign_op(&self) -> Option<Op> {
        match self.cur.kind {
            TokenKind::PlusEq => Some(Op::BinaryPlus),
            TokenKind::MinusEq => Some(Op::BinaryMinus),
            _ => None,
        }
    }

    fn arg_list(&mut self) -> CompileResult<u8> {
        let (n, _) = self.arg_list_with_unpack()?;
        Ok(n)
    }

    /// Parses a parenthesised call-argument list, allowing the final
    /// argument to be prefixed with `*` to unpack a tuple/vec in place.
    fn arg_list_with_unpack(&mut self) -> CompileResult<(u8, bool)> {
        let mut n = 0u8;
        let mut unpack = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if unpack {
                    return Err(self.err("unpacked argument must be last argument"));
                }
                if self.matches(TokenKind::Star)? {
                    unpack = true;
                }
                self.expression()?;
                if n == 255 {
                    return Err(self.err("too many arguments (max: 255)"));
                }
                n += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after argument list")?;
        Ok((n, unpack))
    }

    /// Parses one primary expression. Returns `Some(true)` if it was a bare
    /// `super`, `Some(false)` if it was a bare `self`, `None` otherwise —
    /// used by [`Self::postfix`] to decide private-vs-public method/field
    /// access for the very first link of a postfix chain.
    fn primary(&mut self, can_assign: bool) -> CompileResult<Option<bool>> {
        match self.cur.kind.clone() {
            TokenKind::Int(n) => {
                self.advance()?;
                let line = self.prev.line;
                if (0..=9).contains(&n) {
                    self.emit(Op::LoadI64Small(n as u8), line);
                } else {
                    let idx = self.const_value(Value::I64(n));
                    self.load_constant(idx, line);
                }
            }
            TokenKind::Float(n) => {
                self.advance()?;
                let line = self.prev.line;
                let idx = self.const_value(Value::F64(n));
                self.load_constant(idx, line);
            }
            TokenKind::Rune(c) => {
                self.advance()?;
                let line = self.prev.line;
                let idx = self.const_value(Value::Rune(c as u32));
                self.load_constant(idx, line);
            }
            TokenKind::True => {
                self.advance()?;
                self.emit(Op::LoadTrue, self.prev.line);
            }
            TokenKind::False => {
                self.advance()?;
                self.emit(Op::LoadFalse, self.prev.line);
            }
            TokenKind::Null => {
                self.advance()?;
                self.emit(Op::LoadNull, self.prev.line);
            }
            TokenKind::RawString(s) => {
                self.advance()?;
                let line = self.prev.line;
                let r = self.intern(&s)?;
                let idx = self.const_value(Value::Obj(r));
                self.load_constant(idx, line);
            }
            TokenKind::String(s) => {
                self.advance()?;
                let line = self.prev.line;
                let r = self.intern(&s)?;
                let idx = self.const_value(Value::Obj(r));
                self.load_constant(idx, line);
            }
            TokenKind::StringFragment(_) => {
                self.string_interpolation()?;
            }
            TokenKind::SelfKw => {
                self.advance()?;
                self.emit(Op::GetLocal(0), self.prev.line);
                return Ok(Some(false));
            }
            TokenKind::Super => {
                self.advance()?;
                self.emit(Op::GetLocal(0), self.prev.line);
                return Ok(Some(true));
            }
            TokenKind::Ident(name) => {
                self.advance()?;
                self.variable(&name, can_assign)?;
            }
            TokenKind::LParen => {
                self.advance()?;
                self.expression()?;
                if self.matches(TokenKind::Comma)? {
                    let mut n = 1u8;
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            self.expression()?;
                            n += 1;
                            if !self.matches(TokenKind::Comma)? {
                                break;
                            }
                        }
                    }
                    let line = self.cur.line;
                    self.expect(TokenKind::RParen, "expected ')' after tuple elements")?;
                    self.emit(Op::MakeTup(n as u16), line);
                } else {
                    self.expect(TokenKind::RParen, "expected ')' after expression")?;
                }
            }
            TokenKind::LBracket => {
                self.advance()?;
                let mut n = 0u16;
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        self.expression()?;
                        n += 1;
                        if !self.matches(TokenKind::Comma)? {
                            break;
                        }
                    }
                }
                let line = self.cur.line;
                self.expect(TokenKind::RBracket, "expected ']' after vec elements")?;
                self.emit(Op::MakeVec(n), line);
            }
            TokenKind::LBrace => {
                self.advance()?;
                let mut n = 0u16;
                let mut is_map = true;
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        self.expression()?;
                        if n == 0 {
                            if self.matches(TokenKind::Colon)? {
                                self.expression()?;
                            } else {
                                is_map = false;
                            }
                        } else if is_map {
                            self.expect(TokenKind::Colon, "expected ':' between map key and value")?;
                            self.expression()?;
                        }
                        n += 1;
                        if !self.matches(TokenKind::Comma)? {
                            break;
                        }
                    }
                }
                let line = self.cur.line;
                if is_map {
                    self.expect(TokenKind::RBrace, "expected '}' after map entries")?;
                    self.emit(Op::MakeMap(n), line);
                } else {
                    self.expect(TokenKind::RBrace, "expected '}' after set elements")?;
                    self.emit(Op::MakeSet(n), line);
                }
            }
            other => return Err(self.err(format!("unexpected token in expression: {other}"))),
        }
        Ok(None)
    }

    /// Compiles an interpolated string's fragments, embedded expressions,
    /// and optional format specifiers, then concatenates them with
    /// `CONCAT_STRINGS`.
    fn string_interpolation(&mut self) -> CompileResult<()> {
        let mut count = 0u8;
        loop {
            match self.cur.kind.clone() {
                TokenKind::StringFragment(s) => {
                    self.advance()?;
                    let line = self.prev.line;
                    let r = self.intern(&s)?;
                    let idx = self.const_value(Value::Obj(r));
                    self.load_constant(idx, line);
                    count += 1;
                }
                TokenKind::StringFragmentFinal(s) => {
                    self.advance()?;
                    let line = self.prev.line;
                    let r = self.intern(&s)?;
                    let idx = self.const_value(Value::Obj(r));
                    self.load_constant(idx, line);
                    count += 1;
                    break;
                }
                _ => return Err(self.err("malformed interpolated string")),
            }
            self.expression()?;
            self.emit(Op::Stringify, self.prev.line);
            count += 1;
            if let TokenKind::FormatSpecifier(spec) = self.cur.kind.clone() {
                self.advance()?;
                let line = self.prev.line;
                let r = self.intern(&spec)?;
                let idx = self.const_value(Value::Obj(r));
                self.load_constant(idx, line);
                self.emit(Op::Format, line);
            }
        }
        self.emit(Op::ConcatStrings(count), self.prev.line);
        Ok(())
    }

    fn variable(&mut self, name: &str, can_assign: bool) -> CompileResult<()> {
        let func_idx = self.funcs.len() - 1;
        if let Some((slot, is_const)) = self.resolve_local(func_idx, name) {
            self.finish_variable_access(can_assign, is_const, |c, line| Op::GetLocal(slot), |c, line| Op::SetLocal(slot), name)
        } else if let Some((slot, is_const)) = self.resolve_upvalue(func_idx, name)? {
            self.finish_variable_access(can_assign, is_const, |_, _| Op::GetUpvalue(slot), |_, _| Op::SetUpvalue(slot), name)
        } else {
            let idx = self.const_str(name)?;
            self.finish_variable_access(can_assign, false, move |_, _| Op::GetGlobal(idx), move |_, _| Op::SetGlobal(idx), name)
        }
    }

    fn finish_variable_access(
        &mut self,
        can_assign: bool,
        is_const: bool,
        get_op: impl Fn(&Self, u32) -> Op,
        set_op: impl Fn(&Self, u32) -> Op,
        name: &str,
    ) -> CompileResult<()> {
        if can_assign && self.check(&TokenKind::Eq) {
            self.advance()?;
            if is_const {
                return Err(self.err(format!("cannot assign to constant '{name}'")));
            }
            self.expression()?;
            let line = self.prev.line;
            let op = set_op(self, line);
            self.emit(op, line);
        } else if can_assign && self.compound_assign_op().is_some() {
            let bin_op = self.compound_assign_op().unwrap();
            self.advance()?;
            if is_const {
                return Err(self.err(format!("cannot assign to constant '{name}'")));
            }
            let line = self.prev.line;
            let get = get_op(self, line);
            self.emit(get, line);
            self.expression()?;
            self.emit(bin_op, line);
            let op = set_op(self, line);
            self.emit(op, line);
        } else {
            let line = self.cur.line;
            let op = get_op(self, line);
            self.emit(op, line);
        }
        Ok(())
    }
}
