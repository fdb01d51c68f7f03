// One-pass compiler: a Pratt-style recursive-descent front end that
// emits bytecode directly into a `Chunk` as it parses, without ever
// materializing a tree. Scopes, locals, and upvalues are tracked on a
// stack of `FunctionScope` records; classes get a parallel stack of
// `ClassScope` records that accumulate `this.*`/`super.*` references
// for the member-ref cache emitted at the end of the class body.

use crate::chunk::OpCode;
use crate::error::CompileError;
use crate::object::LFunction;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    start: usize,
    scope_depth: i32,
    handler_depth: usize,
    break_jumps: Vec<usize>,
}

/// One `this.X` / `super.X` reference accumulated while compiling a
/// class body. `kind` matches the VM's `RESOLVE_MEMBERS` tag: 1 for a
/// method reached through `this`, 2 for one reached through `super`.
struct MemberSite {
    kind: u8,
    name: String,
}

struct ClassScope {
    has_superclass: bool,
    member_sites: Vec<MemberSite>,
}

struct FunctionScope {
    function: LFunction,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    is_varargs: bool,
    loops: Vec<LoopCtx>,
    /// Number of `PUSH_EXCEPTION_HANDLER`s currently active on this
    /// function's frame at compile time -- lets `break`/`continue` emit
    /// the right number of `POP_EXCEPTION_HANDLER`s when jumping out
    /// from inside a `try` body.
    handler_count: usize,
}

impl FunctionScope {
    fn new(kind: FunctionKind) -> Self {
        let mut locals = Vec::new();
        // Slot 0 is always reserved: the receiver for methods, the
        // callee-reused slot for plain functions (never read there,
        // but still occupies the frame's base slot).
        let name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this".to_string()
        } else {
            String::new()
        };
        locals.push(Local { name, depth: 0, is_captured: false });
        FunctionScope {
            function: LFunction::new(),
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            is_varargs: false,
            loops: Vec::new(),
            handler_count: 0,
        }
    }
}

pub struct Compiler<'a> {
    vm: &'a mut Vm,
    scanner: Scanner<'a>,
    previous: Token,
    current: Token,
    errors: Vec<CompileError>,
    panic_mode: bool,
    functions: Vec<FunctionScope>,
    classes: Vec<ClassScope>,
    /// Objects interned/allocated mid-compile that aren't yet reachable
    /// from any finished chunk's constant pool -- a still-open
    /// `FunctionScope` is plain Rust-stack state the collector can't
    /// trace. Rooted on `vm` via `protect` until `compile` returns.
    protected: Vec<ObjRef>,
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

pub fn compile(vm: &mut Vm, source: &str, module_name: &str) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(vm, source);
    compiler.functions.push(FunctionScope::new(FunctionKind::Script));
    let module_name_ref = vm_intern(compiler.vm, module_name);
    compiler.protect(Value::Obj(module_name_ref));
    compiler.functions.last_mut().unwrap().function.name = Some(module_name_ref);

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of file.");

    if !compiler.errors.is_empty() {
        for r in compiler.protected.drain(..) {
            compiler.vm.unprotect(r);
        }
        return Err(compiler.errors);
    }

    let scope = compiler.functions.pop().unwrap();
    let mut function = scope.function;
    function.chunk.write_op(OpCode::Nil, compiler.previous.line);
    function.chunk.write_op(OpCode::Return, compiler.previous.line);
    let top = compiler.vm.alloc_function(function);
    for r in compiler.protected.drain(..) {
        compiler.vm.unprotect(r);
    }
    Ok(top)
}

fn vm_intern(vm: &mut Vm, s: &str) -> ObjRef {
    vm.intern_string(s.as_bytes()).as_obj().unwrap()
}

impl<'a> Compiler<'a> {
    fn new(vm: &'a mut Vm, source: &'a str) -> Self {
        Compiler {
            vm,
            scanner: Scanner::new(source),
            previous: Token { kind: TokenKind::Eof, lexeme: String::new(), line: 0 },
            current: Token { kind: TokenKind::Eof, lexeme: String::new(), line: 0 },
            errors: Vec::new(),
            panic_mode: false,
            functions: Vec::new(),
            classes: Vec::new(),
            protected: Vec::new(),
        }
    }

    /// Roots a just-allocated heap value against GC until `compile`
    /// returns, then passes it through unchanged. Every site that
    /// allocates a string or function before it's stored into a
    /// finished chunk's constant pool wraps its call in this.
    fn protect(&mut self, v: Value) -> Value {
        if let Some(r) = v.as_obj() {
            self.vm.protect(r);
            self.protected.push(r);
        }
        v
    }

    // -- token stream ---------------------------------------------------

    fn advance(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at(line, message);
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at(line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError::new(line, message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class | TokenKind::Fun | TokenKind::Var | TokenKind::For
                | TokenKind::If | TokenKind::While | TokenKind::Print | TokenKind::Return
                | TokenKind::Try | TokenKind::Throw | TokenKind::Import => return,
                _ => self.advance(),
            }
        }
    }

    // -- emit helpers -----------------------------------------------------

    fn current_fn(&mut self) -> &mut FunctionScope {
        self.functions.last_mut().unwrap()
    }

    fn chunk_len(&self) -> usize {
        self.functions.last().unwrap().function.chunk.len()
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_fn().function.chunk.write_op(op, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_fn().function.chunk.write_u8(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.current_fn().function.chunk.write_u16(value, line);
    }

    fn emit_op_u16(&mut self, op: OpCode, value: u16) {
        self.emit_op(op);
        self.emit_u16(value);
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.current_fn().function.chunk.add_constant(value);
        self.emit_op_u16(OpCode::Const16, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let v = self.vm.intern_string(name.as_bytes());
        let v = self.protect(v);
        self.current_fn().function.chunk.add_constant(v)
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let target = self.chunk_len();
        let jump = target - (offset + 2);
        if jump > u16::MAX as usize {
            self.error("Jump target too far to encode.");
        }
        self.current_fn().function.chunk.patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let after = self.chunk_len() + 2;
        let offset = after - loop_start;
        if offset > u16::MAX as usize {
            self.error("Loop body too large to encode.");
        }
        self.emit_u16(offset as u16);
    }

    // -- scope handling ---------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = self.current_fn();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        let mut popped = 0u8;
        let mut any_captured = false;
        while let Some(local) = scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                any_captured = true;
            }
            scope.locals.pop();
            popped += 1;
        }
        if popped == 0 {
            return;
        }
        if any_captured {
            // Closing upvalues one at a time preserves the stack-slot
            // watermark each CLOSE_UPVALUE expects.
            for _ in 0..popped {
                self.emit_op(OpCode::CloseUpvalue);
            }
        } else if popped == 1 {
            self.emit_op(OpCode::Pop);
        } else {
            self.emit_op(OpCode::PopN);
            self.emit_u8(popped);
        }
    }

    fn declare_local(&mut self, name: &str) {
        let scope = self.current_fn();
        if scope.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in one function.");
            return;
        }
        let depth = scope.scope_depth;
        for local in scope.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("A variable with this name already exists in this scope.");
                return;
            }
        }
        scope.locals.push(Local { name: name.to_string(), depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        let scope = self.current_fn();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&self, fn_index: usize, name: &str) -> Option<u8> {
        let scope = &self.functions[fn_index];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, fn_index: usize, name: &str) -> Option<u8> {
        if fn_index == 0 {
            return None;
        }
        let enclosing = fn_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(fn_index, local_slot, true));
        }
        if let Some(up_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_index, up_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, fn_index: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.functions[fn_index];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many captured variables in one function.");
            return 0;
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        scope.function.upvalue_count = scope.upvalues.len() as u8;
        (scope.upvalues.len() - 1) as u8
    }

    // -- variables --------------------------------------------------------

    fn parse_variable(&mut self, message: &str) -> Option<u16> {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.clone();
        if self.current_fn().scope_depth > 0 {
            self.declare_local(&name);
            return None;
        }
        Some(self.identifier_constant(&name))
    }

    fn define_variable(&mut self, global: Option<u16>) {
        match global {
            Some(idx) => self.emit_op_u16(OpCode::DefineGlobal, idx),
            None => self.mark_initialized(),
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let fn_index = self.functions.len() - 1;
        let (get_op, set_op, slot) = if let Some(slot) = self.resolve_local(fn_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot as u16)
        } else if let Some(slot) = self.resolve_upvalue(fn_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot as u16)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            match set_op {
                OpCode::SetLocal => {
                    self.emit_op(OpCode::SetLocal);
                    self.emit_u8(slot as u8);
                    self.emit_u8(0);
                }
                OpCode::SetUpvalue => {
                    self.emit_op(OpCode::SetUpvalue);
                    self.emit_u8(slot as u8);
                }
                _ => self.emit_op_u16(set_op, slot),
            }
        } else {
            match get_op {
                OpCode::GetLocal => {
                    self.emit_op(OpCode::GetLocal);
                    self.emit_u8(slot as u8);
                    self.emit_u8(0);
                }
                OpCode::GetUpvalue => {
                    self.emit_op(OpCode::GetUpvalue);
                    self.emit_u8(slot as u8);
                }
                _ => self.emit_op_u16(get_op, slot),
            }
        }
    }

    // -- declarations -------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        if self.match_token(TokenKind::LeftParen) {
            self.var_destructure();
            return;
        }
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    /// `var (a, b, c) = expr;` -- unpacks a tuple into n fresh bindings.
    /// `UNPACK n` pushes its n results in order, so binding them as
    /// locals is just n ordinary declarations over the values already
    /// sitting on the stack. Globals pop top-down, so those bind in the
    /// reverse order to land on the matching name.
    fn var_destructure(&mut self) {
        let mut names = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "Expect variable name.");
                names.push(self.previous.lexeme.clone());
                if names.len() == 256 {
                    self.error("Too many targets in a destructuring pattern.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after destructuring pattern.");
        self.consume(TokenKind::Equal, "Expect '=' after destructuring pattern.");
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after destructuring declaration.");

        self.emit_op(OpCode::Unpack);
        self.emit_u8(names.len() as u8);

        if self.current_fn().scope_depth > 0 {
            for name in &names {
                self.declare_local(name);
                self.mark_initialized();
            }
        } else {
            let idxs: Vec<u16> = names.iter().map(|n| self.identifier_constant(n)).collect();
            for idx in idxs.into_iter().rev() {
                self.emit_op_u16(OpCode::DefineGlobal, idx);
            }
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a function body into its own `FunctionScope`, leaving a
    /// `Closure` instruction (with trailing upvalue descriptors) in the
    /// enclosing chunk.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme.clone();
        self.functions.push(FunctionScope::new(kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: u8 = 0;
        let mut defaults: Vec<Value> = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.match_token(TokenKind::DotDotDot) {
                    self.current_fn().is_varargs = true;
                    break;
                }
                arity += 1;
                if arity == 255 {
                    self.error("Can't have more than 254 parameters.");
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let pname = self.previous.lexeme.clone();
                self.declare_local(&pname);
                self.mark_initialized();
                if self.match_token(TokenKind::Equal) {
                    defaults.push(self.default_value_literal());
                } else if !defaults.is_empty() {
                    self.error("Parameter without a default can't follow one that has a default.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let scope = self.functions.last_mut().unwrap();
        scope.function.arity = arity;
        scope.function.max_args = if scope.is_varargs { 255 } else { arity };
        scope.function.default_args = defaults;
        let last_line = self.previous.line;
        if kind == FunctionKind::Initializer {
            scope.function.chunk.write_op(OpCode::GetLocal, last_line);
            scope.function.chunk.write_u8(0, last_line);
            scope.function.chunk.write_u8(0, last_line);
        } else {
            scope.function.chunk.write_op(OpCode::Nil, last_line);
        }
        scope.function.chunk.write_op(OpCode::Return, last_line);

        let scope = self.functions.pop().unwrap();
        let upvalues = scope.upvalues.clone();
        let mut function = scope.function;
        function.name = Some(vm_intern(self.vm, &name));
        let fn_ref = self.vm.alloc_function(function);
        let fn_value = self.protect(Value::Obj(fn_ref));
        let idx = self.current_fn().function.chunk.add_constant(fn_value);
        self.emit_op_u16(OpCode::Closure, idx);
        for up in upvalues {
            self.emit_u8(if up.is_local { 1 } else { 0 });
            self.emit_u8(up.index);
        }
    }

    /// Parses the default-value expression after a parameter's `=`.
    /// Kept to literals: the value is loaded straight from the constant
    /// pool when `adjustArgs` finds a call short, so there's no bytecode
    /// to evaluate it against a runtime environment.
    fn default_value_literal(&mut self) -> Value {
        if self.match_token(TokenKind::Minus) {
            self.consume(TokenKind::Number, "Expect a number after '-' in a default argument.");
            let n: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
            return Value::Number(-n);
        }
        if self.match_token(TokenKind::Number) {
            let n: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
            return Value::Number(n);
        }
        if self.match_token(TokenKind::String) {
            let raw = self.previous.lexeme.clone();
            let s = unescape_string(&raw);
            let v = self.vm.intern_string(s.as_bytes());
            return self.protect(v);
        }
        if self.match_token(TokenKind::True) {
            return Value::Bool(true);
        }
        if self.match_token(TokenKind::False) {
            return Value::Bool(false);
        }
        if self.match_token(TokenKind::Nil) {
            return Value::Nil;
        }
        self.error("Default argument must be a literal.");
        Value::Nil
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_idx = self.identifier_constant(&class_name);
        self.declare_local_or_global(&class_name);

        self.emit_op_u16(OpCode::Class, name_idx);
        let class_global = if self.current_fn().scope_depth == 0 { Some(name_idx) } else { None };
        if class_global.is_none() {
            self.mark_initialized();
        }

        let mut has_superclass = false;
        if self.match_token(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.clone();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }

        self.classes.push(ClassScope { has_superclass, member_sites: Vec::new() });

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.class_member(&class_name);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");

        let class_scope = self.classes.pop().unwrap();
        let n = class_scope.member_sites.len();
        self.emit_op_u16(OpCode::ResolveMembers, n as u16);
        for site in class_scope.member_sites {
            self.emit_u8(site.kind);
            let idx = self.identifier_constant(&site.name);
            self.emit_u16(idx);
        }

        if let Some(idx) = class_global {
            self.emit_op_u16(OpCode::DefineGlobal, idx);
        } else {
            // The class value sits on the operand stack as a local;
            // nothing further to emit here.
        }
    }

    fn declare_local_or_global(&mut self, name: &str) {
        if self.current_fn().scope_depth > 0 {
            self.declare_local(name);
        }
    }

    fn class_member(&mut self, class_name: &str) {
        let is_static = self.match_token(TokenKind::Static);
        if is_static && self.match_token(TokenKind::Var) {
            self.consume(TokenKind::Identifier, "Expect static member name.");
            let name = self.previous.lexeme.clone();
            self.consume(TokenKind::Equal, "Expect '=' after static field name.");
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after static field initializer.");
            let idx = self.identifier_constant(&name);
            self.emit_op_u16(OpCode::Static, idx);
            return;
        }
        if !is_static && self.match_token(TokenKind::Var) {
            self.consume(TokenKind::Identifier, "Expect field name.");
            let name = self.previous.lexeme.clone();
            self.consume(TokenKind::Semicolon, "Expect ';' after field declaration.");
            let idx = self.identifier_constant(&name);
            self.emit_op_u16(OpCode::Field, idx);
            return;
        }
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let idx = self.identifier_constant(&name);
        if is_static {
            self.function(FunctionKind::Function);
            self.emit_op_u16(OpCode::Static, idx);
        } else {
            let kind = if name == class_name { FunctionKind::Initializer } else { FunctionKind::Method };
            self.function(kind);
            self.emit_op_u16(OpCode::Method, idx);
        }
    }

    // -- statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_token(TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(TokenKind::Import) {
            self.import_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        // `print` is sugar for a call to the native global `print`.
        let idx = self.identifier_constant("print");
        self.emit_op_u16(OpCode::GetGlobal, idx);
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Call);
        self.emit_u8(1);
        self.emit_op(OpCode::Pop);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let handler_depth = self.current_fn().handler_count;
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            handler_depth,
            break_jumps: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let loop_ctx = self.current_fn().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let handler_depth = self.current_fn().handler_count;
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            handler_depth,
            break_jumps: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        let loop_ctx = self.current_fn().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    /// `foreach (item in iterable) body` or `foreach (k, v in iterable) body`.
    /// Lowers to the two-closure protocol `FOREACH_INIT` exposes: a
    /// `hasNext` and a `next` callable pulled off an instance (or its
    /// `iterator()` result), or a built-in array/tuple/map's own native
    /// iteration. The two-variable form unpacks each `next()` result as
    /// a tuple, which is how a map's iterator yields `(key, value)`.
    fn foreach_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'foreach'.");
        self.consume(TokenKind::Identifier, "Expect loop variable name.");
        let first_name = self.previous.lexeme.clone();
        let mut names = vec![first_name];
        if self.match_token(TokenKind::Comma) {
            self.consume(TokenKind::Identifier, "Expect second loop variable name.");
            names.push(self.previous.lexeme.clone());
        }
        self.consume(TokenKind::Identifier, "Expect 'in'.");
        if self.previous.lexeme != "in" {
            self.error("Expect 'in' after loop variable.");
        }
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after iterable.");

        self.emit_op(OpCode::ForeachInit);
        // Stack: ..., hasNext, next
        self.declare_local("@hasNext");
        self.mark_initialized();
        self.declare_local("@next");
        self.mark_initialized();

        let loop_start = self.chunk_len();
        self.named_variable("@hasNext", false);
        self.emit_op(OpCode::Call);
        self.emit_u8(0);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.begin_scope();
        self.named_variable("@next", false);
        self.emit_op(OpCode::Call);
        self.emit_u8(0);
        if names.len() == 1 {
            self.declare_local(&names[0]);
            self.mark_initialized();
        } else {
            self.emit_op(OpCode::Unpack);
            self.emit_u8(names.len() as u8);
            for name in &names {
                self.declare_local(name);
                self.mark_initialized();
            }
        }

        let handler_depth = self.current_fn().handler_count;
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            handler_depth,
            break_jumps: Vec::new(),
        });

        self.statement();
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let loop_ctx = self.current_fn().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        self.pop_locals_to_loop_scope();
        let jump = self.emit_jump(OpCode::Jump);
        self.current_fn().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        self.pop_locals_to_loop_scope();
        let start = self.current_fn().loops.last().unwrap().start;
        self.emit_loop(start);
    }

    /// Pops locals (and closes upvalues / exception handlers) declared
    /// since the innermost loop was entered, without touching the loop's
    /// own scope bookkeeping — used by `break`/`continue` for a
    /// non-local exit out of nested blocks.
    fn pop_locals_to_loop_scope(&mut self) {
        let (loop_depth, handler_depth) = {
            let loop_ctx = self.current_fn().loops.last().unwrap();
            (loop_ctx.scope_depth, loop_ctx.handler_depth)
        };
        let scope = self.current_fn();
        let mut count = 0u8;
        let mut any_captured = false;
        for local in scope.locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            if local.is_captured {
                any_captured = true;
            }
            count += 1;
        }
        if any_captured {
            for _ in 0..count {
                self.emit_op(OpCode::CloseUpvalue);
            }
        } else if count == 1 {
            self.emit_op(OpCode::Pop);
        } else if count > 1 {
            self.emit_op(OpCode::PopN);
            self.emit_u8(count);
        }
        let open_handlers = self.current_fn().handler_count.saturating_sub(handler_depth);
        for _ in 0..open_handlers {
            self.emit_op(OpCode::PopExceptionHandler);
        }
    }

    fn return_statement(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return_nil();
        } else {
            if self.functions.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn emit_return_nil(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_u8(0);
            self.emit_u8(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after thrown value.");
        self.emit_op(OpCode::Throw);
    }

    /// `try { ... } catch (ClassName name) { ... } [catch (name) {...}] [finally { ... }]`.
    ///
    /// `PUSH_EXCEPTION_HANDLER` must run *before* the protected body, so
    /// the handler installs have to precede it in the instruction
    /// stream even though `catch` is written after the body in source.
    /// Since nothing here needs a tree, a one-token-at-a-time lookahead
    /// pass over the untouched token stream (skipping brace-balanced
    /// blocks without emitting anything) recovers the catch headers
    /// first; the scanner is then rewound and the body/catches/finally
    /// are compiled for real in the right order.
    fn try_statement(&mut self) {
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        let body_mark = self.save_position();
        self.skip_balanced_block();

        let mut headers: Vec<(Option<String>, String)> = Vec::new();
        while self.match_token(TokenKind::Catch) {
            self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
            self.consume(TokenKind::Identifier, "Expect exception type or name.");
            let first = self.previous.lexeme.clone();
            let (class_name, binding_name) = if self.check(TokenKind::Identifier) {
                self.advance();
                (Some(first), self.previous.lexeme.clone())
            } else {
                (None, first)
            };
            self.consume(TokenKind::RightParen, "Expect ')' after catch clause.");
            self.consume(TokenKind::LeftBrace, "Expect '{' after catch clause.");
            self.skip_balanced_block();
            headers.push((class_name, binding_name));
        }
        if headers.is_empty() {
            self.error("Expect at least one 'catch' clause after 'try'.");
        }
        if self.match_token(TokenKind::Finally) {
            self.consume(TokenKind::LeftBrace, "Expect '{' after 'finally'.");
            self.skip_balanced_block();
        }

        // Real pass, in runtime order: handler installs, body, catch
        // bodies, finally.
        self.restore_position(body_mark);

        let stack_depth = self.current_fn().locals.len() as u16;
        let mut handler_offset_patches = Vec::new();
        for (class_name, _) in &headers {
            match class_name {
                Some(name) => self.named_variable(name, false),
                None => self.emit_op(OpCode::Nil),
            }
            self.emit_op(OpCode::PushExceptionHandler);
            self.emit_u16(stack_depth);
            let patch_at = self.chunk_len();
            self.emit_u16(0xffff);
            handler_offset_patches.push(patch_at);
        }

        self.current_fn().handler_count += headers.len();
        self.begin_scope();
        self.block();
        self.end_scope();
        self.current_fn().handler_count -= headers.len();
        for _ in &headers {
            self.emit_op(OpCode::PopExceptionHandler);
        }
        let skip_catches = self.emit_jump(OpCode::Jump);

        let mut end_jumps = Vec::new();
        for (i, (_, binding_name)) in headers.iter().enumerate() {
            let handler_ip = self.chunk_len();
            let op_offset = handler_offset_patches[i];
            let patch_target = handler_ip - (op_offset + 2);
            self.current_fn().function.chunk.patch_u16(op_offset, patch_target as u16);

            self.consume(TokenKind::Catch, "Expect 'catch'.");
            self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
            self.consume(TokenKind::Identifier, "Expect exception type or name.");
            if self.check(TokenKind::Identifier) {
                self.advance();
            }
            self.consume(TokenKind::RightParen, "Expect ')' after catch clause.");
            self.consume(TokenKind::LeftBrace, "Expect '{' after catch clause.");

            self.begin_scope();
            self.declare_local(binding_name);
            self.mark_initialized();
            self.block();
            self.end_scope();
            end_jumps.push(self.emit_jump(OpCode::Jump));
        }
        self.patch_jump(skip_catches);
        for j in end_jumps {
            self.patch_jump(j);
        }

        if self.match_token(TokenKind::Finally) {
            self.consume(TokenKind::LeftBrace, "Expect '{' after 'finally'.");
            self.begin_scope();
            self.block();
            self.end_scope();
        }
    }

    /// Snapshot/restore of everything the token stream holds live:
    /// scanner cursor plus the one-token lookahead buffer.
    fn save_position(&self) -> (crate::scanner::ScannerMark, Token, Token) {
        (self.scanner.mark(), self.previous.clone(), self.current.clone())
    }

    fn restore_position(&mut self, mark: (crate::scanner::ScannerMark, Token, Token)) {
        self.scanner.reset_to(mark.0);
        self.previous = mark.1;
        self.current = mark.2;
        self.panic_mode = false;
    }

    /// Consumes tokens up to and including the `}` matching the `{`
    /// already consumed, without emitting any bytecode.
    fn skip_balanced_block(&mut self) {
        let mut depth = 1;
        while depth > 0 {
            if self.check(TokenKind::Eof) {
                self.error("Unterminated block.");
                return;
            }
            self.advance();
            match self.previous.kind {
                TokenKind::LeftBrace => depth += 1,
                TokenKind::RightBrace => depth -= 1,
                _ => {}
            }
        }
    }

    fn import_statement(&mut self) {
        self.consume(TokenKind::String, "Expect module name string.");
        let literal = self.previous.lexeme.clone();
        let name = unescape_string(&literal);
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
        let v = self.vm.intern_string(name.as_bytes());
        let v = self.protect(v);
        let idx = self.current_fn().function.chunk.add_constant(v);
        self.emit_op_u16(OpCode::Import, idx);
    }

    // -- expressions ------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::This => self.this_expr(can_assign),
            TokenKind::Super => self.super_expr(can_assign),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::LeftBracket => self.array_or_map_literal(),
            TokenKind::LeftBrace => self.brace_map_literal(),
            TokenKind::Fun => self.anonymous_function(),
            TokenKind::DotDotDot => self.vararg_expr(can_assign),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus => self.binary(OpCode::Add, Precedence::Term),
            TokenKind::Minus => self.binary(OpCode::Subtract, Precedence::Term),
            TokenKind::Star => self.binary(OpCode::Multiply, Precedence::Factor),
            TokenKind::Slash => self.binary(OpCode::Divide, Precedence::Factor),
            TokenKind::Percent => self.binary(OpCode::Modulo, Precedence::Factor),
            TokenKind::EqualEqual => self.binary(OpCode::Equal, Precedence::Equality),
            TokenKind::BangEqual => {
                self.binary(OpCode::Equal, Precedence::Equality);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.binary(OpCode::Greater, Precedence::Comparison),
            TokenKind::GreaterEqual => {
                self.binary(OpCode::Less, Precedence::Comparison);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.binary(OpCode::Less, Precedence::Comparison),
            TokenKind::LessEqual => {
                self.binary(OpCode::Greater, Precedence::Comparison);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Is => self.binary(OpCode::InstanceOf, Precedence::Comparison),
            TokenKind::And | TokenKind::AmpAmp => self.and_expr(),
            TokenKind::Or | TokenKind::PipePipe => self.or_expr(),
            TokenKind::Question => self.ternary(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::Dot => self.dot_expr(can_assign),
            TokenKind::LeftBracket => self.index_expr(can_assign),
            _ => {}
        }
    }

    /// `(expr)` is plain grouping; `(expr, ...)` -- a comma anywhere
    /// before the closing paren, including a lone trailing one -- builds
    /// a tuple instead.
    fn grouping(&mut self) {
        self.expression();
        if self.match_token(TokenKind::Comma) {
            let mut count: u16 = 1;
            while !self.check(TokenKind::RightParen) {
                self.expression();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RightParen, "Expect ')' after tuple literal.");
            self.emit_op_u16(OpCode::TupleBuild, count);
            return;
        }
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, op: OpCode, precedence: Precedence) {
        self.parse_precedence(precedence.next());
        self.emit_op(op);
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Colon, "Expect ':' in ternary expression.");
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme.clone();
        let s = unescape_string(&raw);
        let v = self.vm.intern_string(s.as_bytes());
        let v = self.protect(v);
        self.emit_constant(v);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    /// A bare `this` reads the receiver local directly. `this.name` /
    /// `this.name(args)` immediately following are handled right here
    /// (not through the generic `dot_expr`) so they go through the
    /// member-ref cache — any *later* `.` in the chain (`this.a.b`)
    /// lands back on the generic path once the receiver on the stack
    /// is no longer literally `this`.
    fn this_expr(&mut self, can_assign: bool) {
        if !self.in_method() {
            self.error("Can't use 'this' outside of a method.");
        }
        if !self.match_token(TokenKind::Dot) {
            self.named_variable("this", false);
            return;
        }
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        if self.match_token(TokenKind::LeftParen) {
            // No receiver needed on the stack for the cached path —
            // MEMBER_INVOKE reads `this` straight out of the frame.
            let argc = self.argument_list();
            let ref_idx = self.register_member_site(1, &name);
            self.emit_op_u16(OpCode::MemberInvoke, ref_idx);
            self.emit_u8(argc);
        } else {
            // Ambiguous without a call: `this.x` could be a field or a
            // method, and the single pass can't tell yet, so this
            // falls back to the generic name-keyed lookup instead of
            // the cache. `this` is already on the stack as the
            // receiver for GET_PROPERTY/SET_PROPERTY.
            self.named_variable("this", false);
            let idx = self.identifier_constant(&name);
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op_u16(OpCode::SetProperty, idx);
            } else {
                self.emit_op_u16(OpCode::GetProperty, idx);
            }
        }
    }

    fn in_method(&self) -> bool {
        matches!(
            self.functions.last().map(|f| f.kind),
            Some(FunctionKind::Method) | Some(FunctionKind::Initializer)
        )
    }

    /// `super.name` / `super.name(args)`. Always resolved through the
    /// member-ref cache (kind 2): in this object model `super` access
    /// only ever denotes a method one level up the inheritance chain.
    fn super_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass member name.");
        let name = self.previous.lexeme.clone();

        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            let ref_idx = self.register_member_site(2, &name);
            self.emit_op_u16(OpCode::SuperInvoke, ref_idx);
            self.emit_u8(argc);
        } else {
            let ref_idx = self.register_member_site(2, &name);
            self.emit_op_u16(OpCode::GetSuper, ref_idx);
        }
    }

    fn register_member_site(&mut self, kind: u8, name: &str) -> u16 {
        let class = self.classes.last_mut().unwrap();
        class.member_sites.push(MemberSite { kind, name: name.to_string() });
        (class.member_sites.len() - 1) as u16
    }

    /// `{}` and `{k: v, ...}` -- an alternative map-literal spelling
    /// alongside `[:]`/`[k: v, ...]`. Only reachable from expression
    /// position (`statement()` claims a leading `{` for a block first),
    /// so there's no ambiguity with bare-block statements.
    fn brace_map_literal(&mut self) {
        if self.check(TokenKind::RightBrace) {
            self.advance();
            self.emit_op_u16(OpCode::MapBuild, 0);
            return;
        }
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' between map key and value.");
        self.expression();
        let mut pairs: u16 = 1;
        while self.match_token(TokenKind::Comma) {
            if self.check(TokenKind::RightBrace) {
                break;
            }
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' between map key and value.");
            self.expression();
            pairs += 1;
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after map literal.");
        self.emit_op_u16(OpCode::MapBuild, pairs);
    }

    fn array_or_map_literal(&mut self) {
        if self.check(TokenKind::RightBracket) {
            self.advance();
            self.emit_op_u16(OpCode::ArrayBuild, 0);
            return;
        }
        if self.check(TokenKind::Colon) {
            // `[:]` -- empty map.
            self.advance();
            self.consume(TokenKind::RightBracket, "Expect ']' after empty map.");
            self.emit_op_u16(OpCode::MapBuild, 0);
            return;
        }

        self.expression();
        if self.match_token(TokenKind::Colon) {
            self.expression();
            let mut pairs: u16 = 1;
            while self.match_token(TokenKind::Comma) {
                if self.check(TokenKind::RightBracket) {
                    break;
                }
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' between map key and value.");
                self.expression();
                pairs += 1;
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after map literal.");
            self.emit_op_u16(OpCode::MapBuild, pairs);
        } else {
            let mut count: u16 = 1;
            while self.match_token(TokenKind::Comma) {
                if self.check(TokenKind::RightBracket) {
                    break;
                }
                self.expression();
                count += 1;
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after array literal.");
            self.emit_op_u16(OpCode::ArrayBuild, count);
        }
    }

    fn anonymous_function(&mut self) {
        self.function(FunctionKind::Function);
    }

    /// Bare `...` reads the variadic count; `...[N]` (N a literal,
    /// non-negative integer) reads or writes one packed argument. The
    /// index must be known at compile time because `GET_VARARG` and
    /// `SET_VARARG` encode it as a single operand byte.
    fn vararg_expr(&mut self, can_assign: bool) {
        if !self.match_token(TokenKind::LeftBracket) {
            self.emit_op(OpCode::NumVarargs);
            return;
        }
        self.consume(TokenKind::Number, "Expect a literal index after '...['.");
        let idx: u8 = self.previous.lexeme.parse().unwrap_or(0);
        self.consume(TokenKind::RightBracket, "Expect ']' after vararg index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetVararg);
            self.emit_u8(idx);
        } else {
            self.emit_op(OpCode::GetVararg);
            self.emit_u8(idx);
        }
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_u8(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    /// `.name` / `.name(args)` on an arbitrary receiver expression
    /// already sitting on the stack. `this.x` and `super.x` are handled
    /// separately, inline in `this_expr`/`super_expr`, since only an
    /// immediate `this`/`super` receiver is eligible for the member-ref
    /// cache.
    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();

        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            let idx = self.identifier_constant(&name);
            self.emit_op_u16(OpCode::Invoke, idx);
            self.emit_u8(argc);
        } else if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            let idx = self.identifier_constant(&name);
            self.emit_op_u16(OpCode::SetProperty, idx);
        } else {
            let idx = self.identifier_constant(&name);
            self.emit_op_u16(OpCode::GetProperty, idx);
        }
    }

    fn index_expr(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::IndexStore);
        } else {
            self.emit_op(OpCode::Index);
        }
    }
}

/// Binding power for infix operators; `Precedence::None` for anything
/// that never appears in infix position.
fn infix_precedence(kind: TokenKind) -> Precedence {
    use Precedence::*;
    use TokenKind::*;
    match kind {
        LeftParen | Dot | LeftBracket => Call,
        Star | Slash | Percent => Factor,
        Plus | Minus => Term,
        Greater | GreaterEqual | Less | LessEqual | Is => Comparison,
        EqualEqual | BangEqual => Equality,
        TokenKind::And | AmpAmp => Precedence::And,
        TokenKind::Or | PipePipe => Precedence::Or,
        Question => Ternary,
        _ => None,
    }
}

/// Resolves the handful of backslash escapes the scanner doesn't strip
/// (it only recognizes `\"` enough to find the closing quote) and
/// drops the surrounding quote bytes.
fn unescape_string(lexeme: &str) -> String {
    let inner = &lexeme[1..lexeme.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
