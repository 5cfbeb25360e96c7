/// Single-pass compiler: tokens in, bytecode out, no AST.
///
/// A Pratt expression parser drives emission straight into the current
/// function's code buffer, with a parallel line buffer (one entry per byte).
/// Scope depths: -2 is the module body, -1 module-level declarations, >= 0
/// block-nested locals. Functions are not lexical closures — an inner
/// function cannot see an outer function's locals; state travels through
/// arguments and module globals.
///
/// Imports are processed in source order while compiling, so every imported
/// module is fully compiled (and its body run) before compilation continues;
/// a cycle therefore surfaces here as "module already importing".

use crate::bytecode::Op;
use crate::core::object::{Chunk, Func, FuncKind, ObjKind, PkClass, PkStr};
use crate::core::value::{Ref, Value};
use crate::errors::CompileError;
use crate::lexer::{LexError, Lexer, StrSegment, Token, TokenKind};
use crate::module_loader;
use crate::vm::PKVM;

pub const DEPTH_SCRIPT: i32 = -2;
pub const DEPTH_GLOBAL: i32 = -1;

const MAX_ARGS: usize = 255;
const MAX_LOCALS: usize = 256;
const MAX_GLOBALS: usize = 256;
const MAX_FUNCTIONS: usize = 256;
const MAX_CLASSES: usize = 256;
const MAX_LITERALS: usize = 65536;
const MAX_NAMES: usize = 65536;
const MAX_INTERP_DEPTH: u32 = 8;

// ---------------------------------------------------------------------------
// Precedence ladder
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None = 0,
    Assignment, // =, +=, ...
    Or,         // or
    And,        // and
    Equality,   // == !=
    Membership, // in is
    Comparison, // < > <= >=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Shift,      // << >>
    Range,      // ..
    Term,       // + -
    Factor,     // * / %
    Unary,      // - not ~
    ChainCall,  // ->
    Call,       // () [] .
    Primary,
}

impl Prec {
    /// The next-tighter level, used to make binary operators
    /// left-associative.
    fn stronger(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Membership,
            Prec::Membership => Prec::Comparison,
            Prec::Comparison => Prec::BitOr,
            Prec::BitOr => Prec::BitXor,
            Prec::BitXor => Prec::BitAnd,
            Prec::BitAnd => Prec::Shift,
            Prec::Shift => Prec::Range,
            Prec::Range => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::ChainCall,
            Prec::ChainCall => Prec::Call,
            Prec::Call | Prec::Primary => Prec::Primary,
        }
    }
}

fn infix_prec(kind: &TokenKind) -> Prec {
    use TokenKind::*;
    match kind {
        Or => Prec::Or,
        And => Prec::And,
        EqEq | NotEq => Prec::Equality,
        In => Prec::Membership,
        Lt | Gt | LtEq | GtEq => Prec::Comparison,
        Pipe => Prec::BitOr,
        Caret => Prec::BitXor,
        Amp => Prec::BitAnd,
        Lshift | Rshift => Prec::Shift,
        DotDot => Prec::Range,
        Plus | Minus => Prec::Term,
        Star | Slash | Percent => Prec::Factor,
        Arrow => Prec::ChainCall,
        LParen | LBracket | Dot => Prec::Call,
        _ => Prec::None,
    }
}

// ---------------------------------------------------------------------------
// Compiler state
// ---------------------------------------------------------------------------

/// A function's code under construction. Chunks become heap `Func` objects
/// only at finalize, after forward references are patched.
struct Proto {
    name: String,
    arity: i32,
    code: Vec<u8>,
    lines: Vec<u32>,
    max_stack: i32,
    docstring: Option<String>,
    /// Offset and opcode of the last and second-to-last emitted
    /// instructions, for the tail-call rewrite.
    last_op: Option<(usize, Op)>,
    prev_op: Option<(usize, Op)>,
}

impl Proto {
    fn new(name: String) -> Self {
        Proto {
            name,
            arity: 0,
            code: Vec::new(),
            lines: Vec::new(),
            max_stack: 0,
            docstring: None,
            last_op: None,
            prev_op: None,
        }
    }
}

struct Local {
    name: String,
    depth: i32,
}

struct LoopCtx {
    /// Jump-back target (the condition for `while`, the ITER for `for`).
    start: usize,
    break_jumps: Vec<usize>,
    /// Locals alive when the loop was entered; `break`/`continue` pop past
    /// this point.
    locals_len: usize,
}

struct FuncScope {
    proto: usize,
    locals: Vec<Local>,
    scope_depth: i32,
    /// Linear operand-stack tracker; feeds `Proto::max_stack`.
    stack: i32,
    loops: Vec<LoopCtx>,
}

/// A call to a not-yet-defined name, fixed up after the module compiles.
struct ForwardName {
    proto: usize,
    /// Offset of the PUSH_FN operand byte.
    operand_offset: usize,
    name: String,
    line: u32,
}

pub struct Compiler<'vm> {
    vm: &'vm mut PKVM,
    module: Ref,
    path: String,
    tokens: Vec<Token>,
    pos: usize,
    protos: Vec<Proto>,
    scopes: Vec<FuncScope>,
    /// `def`-declared names this pass, with their final function indices.
    fn_symbols: Vec<(String, usize)>,
    forwards: Vec<ForwardName>,
    /// Class object and the proto index of its synthesised constructor.
    pending_ctors: Vec<(Ref, usize)>,
    /// module.functions length before this pass; proto i (i >= 1) lands at
    /// final index `func_base + i - 1`.
    func_base: usize,
    interp_depth: u32,
    repl: bool,
    debug: bool,
    /// Per-statement flags driving REPL echo and local declaration.
    assigned_in_stmt: bool,
    declared_local_in_stmt: bool,
}

/// Compile `source` into `module` (which must be pinned by the caller). On
/// success the module's `body` holds a fresh function of the top-level code.
pub fn compile(vm: &mut PKVM, module: Ref, source: &str) -> Result<(), CompileError> {
    let path = vm.heap.module(module).path.clone();
    let repl = vm.config.repl_mode;
    let debug = vm.config.debug;

    let mut lexer = Lexer::new(source);
    let tokens = match lexer.tokenize() {
        Ok(t) => t,
        Err(e) => {
            if repl && matches!(e, LexError::UnterminatedString { .. }) {
                return Err(CompileError::UnexpectedEof { path, line: e.line() });
            }
            return Err(CompileError::Syntax {
                path,
                line: e.line(),
                message: e.to_string(),
            });
        }
    };
    for (line, warning) in &lexer.warnings {
        (vm.config.error_fn)(crate::errors::ErrorKind::Compile, &path, *line, warning);
    }

    let func_base = vm.heap.module(module).functions.len();
    let mut compiler = Compiler {
        vm,
        module,
        path,
        tokens,
        pos: 0,
        protos: vec![Proto::new("(module)".to_string())],
        scopes: vec![FuncScope {
            proto: 0,
            locals: Vec::new(),
            scope_depth: DEPTH_SCRIPT,
            stack: 0,
            loops: Vec::new(),
        }],
        fn_symbols: Vec::new(),
        forwards: Vec::new(),
        pending_ctors: Vec::new(),
        func_base,
        interp_depth: 0,
        repl,
        debug,
        assigned_in_stmt: false,
        declared_local_in_stmt: false,
    };
    compiler.run()
}

impl<'vm> Compiler<'vm> {
    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn current(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(kind)
    }

    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), CompileError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else if self.check(&TokenKind::Eof) {
            self.err_eof()
        } else {
            self.err(format!("expected {}", what))
        }
    }

    fn eat_ident(&mut self, what: &str) -> Result<String, CompileError> {
        match self.current().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            TokenKind::Eof => self.err_eof(),
            _ => self.err(format!("expected {}", what)),
        }
    }

    fn skip_lines(&mut self) {
        while self.check(&TokenKind::Line) {
            self.advance();
        }
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, CompileError> {
        Err(self.error_at(self.line(), message))
    }

    fn error_at(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            path: self.path.clone(),
            line,
            message: message.into(),
        }
    }

    fn err_eof<T>(&self) -> Result<T, CompileError> {
        if self.repl && self.interp_depth == 0 {
            Err(CompileError::UnexpectedEof {
                path: self.path.clone(),
                line: self.line(),
            })
        } else {
            self.err("unexpected end of input")
        }
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    fn scope(&mut self) -> &mut FuncScope {
        self.scopes.last_mut().expect("no function scope")
    }

    fn proto(&mut self) -> &mut Proto {
        let idx = self.scopes.last().expect("no function scope").proto;
        &mut self.protos[idx]
    }

    fn track(&mut self, effect: i32) {
        let scope = self.scopes.last_mut().expect("no function scope");
        scope.stack += effect;
        let idx = scope.proto;
        let stack = scope.stack;
        let proto = &mut self.protos[idx];
        if stack > proto.max_stack {
            proto.max_stack = stack;
        }
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        let proto = self.proto();
        proto.code.push(byte);
        proto.lines.push(line);
    }

    fn emit_op(&mut self, op: Op) -> usize {
        let offset = {
            let proto = self.proto();
            let offset = proto.code.len();
            proto.prev_op = proto.last_op;
            proto.last_op = Some((offset, op));
            offset
        };
        self.emit_byte(op as u8);
        self.track(op.stack_effect());
        offset
    }

    fn emit_op_u8(&mut self, op: Op, operand: u8) -> usize {
        let offset = self.emit_op(op);
        self.emit_byte(operand);
        offset
    }

    fn emit_op_u16(&mut self, op: Op, operand: u16) -> usize {
        let offset = self.emit_op(op);
        let [hi, lo] = operand.to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
        offset
    }

    /// Emit a forward jump with a placeholder offset; returns the operand
    /// offset for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let line = self.line();
        let proto = self.proto();
        let operand_offset = proto.code.len();
        proto.code.extend_from_slice(&[0xff, 0xff]);
        proto.lines.extend_from_slice(&[line, line]);
        operand_offset
    }

    fn patch_jump(&mut self, operand_offset: usize) -> Result<(), CompileError> {
        let line = self.line();
        let proto = self.proto();
        let target = proto.code.len();
        let distance = target - (operand_offset + 2);
        if distance > u16::MAX as usize {
            return Err(self.error_at(line, "jump distance exceeds limit"));
        }
        let [hi, lo] = (distance as u16).to_be_bytes();
        let proto = self.proto();
        proto.code[operand_offset] = hi;
        proto.code[operand_offset + 1] = lo;
        Ok(())
    }

    /// Backward jump to `start`.
    fn emit_loop(&mut self, start: usize) -> Result<(), CompileError> {
        let here = self.proto().code.len();
        // The executor's ip sits just past the 3-byte instruction.
        let distance = here + 3 - start;
        if distance > u16::MAX as usize {
            return self.err("loop body exceeds jump limit");
        }
        self.emit_op_u16(Op::Loop, distance as u16);
        Ok(())
    }

    /// Pop-count adjusted store/load of small local indices.
    fn emit_push_local(&mut self, index: usize) {
        if index <= 8 {
            self.emit_op(Op::from_byte(Op::PushLocal0 as u8 + index as u8));
        } else {
            self.emit_op_u8(Op::PushLocalN, index as u8);
        }
    }

    fn emit_store_local(&mut self, index: usize) {
        if index <= 8 {
            self.emit_op(Op::from_byte(Op::StoreLocal0 as u8 + index as u8));
        } else {
            self.emit_op_u8(Op::StoreLocalN, index as u8);
        }
    }

    // -----------------------------------------------------------------------
    // Literal and name pools
    // -----------------------------------------------------------------------

    fn add_literal(&mut self, value: Value) -> Result<u16, CompileError> {
        let module = self.module;
        let literals = &self.vm.heap.module(module).literals;
        for (i, &existing) in literals.iter().enumerate() {
            if existing.is_num() && value.is_num() {
                if existing.as_num().to_bits() == value.as_num().to_bits() {
                    return Ok(i as u16);
                }
            } else if existing == value {
                return Ok(i as u16);
            }
        }
        let count = literals.len();
        if count >= MAX_LITERALS {
            return self.err("too many literals in one module");
        }
        self.vm.heap.module_mut(module).literals.push(value);
        Ok(count as u16)
    }

    fn add_literal_str(&mut self, s: &str) -> Result<u16, CompileError> {
        let module = self.module;
        {
            let heap = &self.vm.heap;
            let literals = &heap.module(module).literals;
            for (i, &existing) in literals.iter().enumerate() {
                if existing.is_object() {
                    if let ObjKind::Str(pk) = &heap.get(existing.as_object()).kind {
                        if pk.data == s {
                            return Ok(i as u16);
                        }
                    }
                }
            }
            if literals.len() >= MAX_LITERALS {
                return self.err("too many literals in one module");
            }
        }
        let r = self.vm.allocate(ObjKind::Str(PkStr::new(s.to_string())));
        let module = self.vm.heap.module_mut(self.module);
        module.literals.push(Value::object(r));
        Ok((module.literals.len() - 1) as u16)
    }

    fn intern_name(&mut self, name: &str) -> Result<u16, CompileError> {
        let module = self.vm.heap.module_mut(self.module);
        let idx = module.intern_name(name);
        if idx >= MAX_NAMES {
            return self.err("too many names in one module");
        }
        Ok(idx as u16)
    }

    // -----------------------------------------------------------------------
    // Scopes and locals
    // -----------------------------------------------------------------------

    fn enter_block(&mut self) -> i32 {
        let scope = self.scope();
        let saved = scope.scope_depth;
        scope.scope_depth = if saved < 0 { 0 } else { saved + 1 };
        saved
    }

    fn exit_block(&mut self, saved: i32) {
        let mut pops = 0;
        {
            let scope = self.scope();
            let depth = scope.scope_depth;
            while scope.locals.last().map_or(false, |l| l.depth >= depth) {
                scope.locals.pop();
                pops += 1;
            }
        }
        for _ in 0..pops {
            self.emit_op(Op::Pop);
        }
        self.scope().scope_depth = saved;
    }

    fn declare_local(&mut self, name: &str) -> Result<usize, CompileError> {
        let depth = self.scope().scope_depth;
        debug_assert!(depth >= 0);
        if self.scope().locals.len() >= MAX_LOCALS {
            return self.err("too many local variables");
        }
        self.scope().locals.push(Local { name: name.to_string(), depth });
        Ok(self.scope().locals.len() - 1)
    }

    fn resolve_local(&self, name: &str) -> Option<usize> {
        let scope = self.scopes.last()?;
        scope
            .locals
            .iter()
            .rposition(|l| l.name == name)
    }

    fn resolve_function(&self, name: &str) -> Option<usize> {
        if let Some(&(_, idx)) = self.fn_symbols.iter().rev().find(|(n, _)| n == name) {
            return Some(idx);
        }
        let module = self.vm.heap.module(self.module);
        for (i, &f) in module.functions.iter().enumerate().rev() {
            if self.vm.heap.func(f).name == name {
                return Some(i);
            }
        }
        None
    }

    fn resolve_class(&self, name: &str) -> Option<usize> {
        let module = self.vm.heap.module(self.module);
        for (i, &c) in module.classes.iter().enumerate().rev() {
            if self.vm.heap.class(c).name == name {
                return Some(i);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Top level
    // -----------------------------------------------------------------------

    fn run(&mut self) -> Result<(), CompileError> {
        self.skip_lines();

        // Optional leading `module foo`.
        if self.check(&TokenKind::Module) {
            self.advance();
            let name = self.eat_ident("a module name")?;
            let module = self.vm.heap.module_mut(self.module);
            if module.name.is_some() {
                return self.err("module name already declared");
            }
            module.name = Some(name);
            self.end_of_statement()?;
        }

        loop {
            self.skip_lines();
            if self.check(&TokenKind::Eof) {
                break;
            }
            match self.current() {
                TokenKind::Def => self.def_declaration()?,
                TokenKind::Class => self.class_declaration()?,
                TokenKind::Import => self.import_statement()?,
                TokenKind::From => self.from_import_statement()?,
                TokenKind::Module => {
                    return self.err("module declaration must be the first statement")
                }
                TokenKind::Native => {
                    return self.err("native functions are registered by the host")
                }
                _ => self.statement()?,
            }
        }

        self.finish()
    }

    fn end_of_statement(&mut self) -> Result<(), CompileError> {
        if self.check(&TokenKind::Line) || self.check(&TokenKind::Eof) {
            self.skip_lines();
            Ok(())
        } else if self.check(&TokenKind::End)
            || self.check(&TokenKind::Else)
            || self.check(&TokenKind::Elsif)
        {
            Ok(())
        } else {
            self.err("expected end of statement")
        }
    }

    fn finish(&mut self) -> Result<(), CompileError> {
        // Implicit tail call at the end of the module body would hide the
        // body frame from stacktraces for no gain; functions only.
        self.emit_op(Op::PushNull);
        self.emit_op(Op::Return);
        self.emit_op(Op::End);

        // Resolve forward-referenced names against the final function table.
        for fwd in std::mem::take(&mut self.forwards) {
            let idx = match self.resolve_function(&fwd.name) {
                Some(i) => i,
                None => {
                    return Err(self.error_at(
                        fwd.line,
                        format!("name '{}' is not defined", fwd.name),
                    ))
                }
            };
            if idx >= MAX_FUNCTIONS {
                return Err(self.error_at(fwd.line, "too many functions in one module"));
            }
            self.protos[fwd.proto].code[fwd.operand_offset] = idx as u8;
        }

        // Materialise heap functions: protos[1..] in order, then the body.
        let module = self.module;
        let protos: Vec<Proto> = self.protos.drain(..).collect();
        let mut iter = protos.into_iter();
        let body_proto = iter.next().expect("body proto");
        for proto in iter {
            let func = self.make_func(proto);
            self.vm.heap.module_mut(module).functions.push(func);
        }
        for (class, proto_idx) in std::mem::take(&mut self.pending_ctors) {
            let func = self.vm.heap.module(module).functions[self.func_base + proto_idx - 1];
            self.vm.heap.class_mut(class).ctor = Some(func);
        }
        let body = self.make_func(body_proto);
        self.vm.heap.module_mut(module).body = Some(body);
        Ok(())
    }

    fn make_func(&mut self, proto: Proto) -> Ref {
        let chunk = std::rc::Rc::new(Chunk { code: proto.code, lines: proto.lines });
        self.vm.allocate(ObjKind::Func(Func {
            name: proto.name,
            owner: Some(self.module),
            arity: proto.arity,
            docstring: proto.docstring,
            kind: FuncKind::Bytecode {
                chunk,
                stack_size: proto.max_stack.max(0) as u32 + 1,
            },
        }))
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    fn def_declaration(&mut self) -> Result<(), CompileError> {
        if self.scopes.len() > 1 || self.scope().scope_depth != DEPTH_SCRIPT {
            return self.err("functions can only be defined at module top level");
        }
        self.advance(); // def
        let name = self.eat_ident("a function name")?;
        let fn_index = self.func_base + self.protos.len() - 1;
        if fn_index >= MAX_FUNCTIONS {
            return self.err("too many functions in one module");
        }
        // Registered before the body compiles, so recursion resolves
        // directly.
        self.fn_symbols.push((name.clone(), fn_index));
        self.compile_function(name, true)?;
        Ok(())
    }

    /// Shared by `def` declarations and `func` literals. Returns the final
    /// function index.
    fn compile_function(&mut self, name: String, is_def: bool) -> Result<usize, CompileError> {
        let proto_idx = self.protos.len();
        let fn_index = self.func_base + proto_idx - 1;
        if fn_index >= MAX_FUNCTIONS {
            return self.err("too many functions in one module");
        }
        self.protos.push(Proto::new(name));
        self.scopes.push(FuncScope {
            proto: proto_idx,
            locals: Vec::new(),
            scope_depth: 0,
            stack: 0,
            loops: Vec::new(),
        });

        self.expect(&TokenKind::LParen, "'(' after function name")?;
        let mut arity = 0i32;
        if !self.check(&TokenKind::RParen) {
            loop {
                let param = self.eat_ident("a parameter name")?;
                if self.scope().locals.iter().any(|l| l.name == param) {
                    return self.err(format!("duplicate parameter '{}'", param));
                }
                self.declare_local(&param)?;
                arity += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')' after parameters")?;
        self.proto().arity = arity;

        self.skip_lines();
        // A leading string literal is the function's docstring.
        if let TokenKind::Str(doc) = self.current().clone() {
            let after = &self.tokens[self.pos + 1].kind;
            if matches!(after, TokenKind::Line | TokenKind::End) {
                self.advance();
                self.proto().docstring = Some(doc);
                self.skip_lines();
            }
        }

        self.statement_block(&[TokenKind::End])?;
        self.expect(&TokenKind::End, "'end' after function body")?;

        // Rewrite `CALL; POP` at the body end into a tail call.
        if !self.debug {
            let (last, prev) = {
                let proto = self.proto();
                (proto.last_op, proto.prev_op)
            };
            if let (Some((_, Op::Pop)), Some((offset, Op::Call))) = (last, prev) {
                self.proto().code[offset] = Op::TailCall as u8;
            }
        }
        self.emit_op(Op::PushNull);
        self.emit_op(Op::Return);
        self.emit_op(Op::End);

        self.scopes.pop();
        if is_def {
            // Keep the declaration invisible to the surrounding expression
            // stream; nothing is emitted into the enclosing proto.
        } else {
            self.emit_op_u8(Op::PushFn, fn_index as u8);
        }
        Ok(fn_index)
    }

    fn class_declaration(&mut self) -> Result<(), CompileError> {
        if self.scopes.len() > 1 || self.scope().scope_depth != DEPTH_SCRIPT {
            return self.err("classes can only be defined at module top level");
        }
        self.advance(); // class
        let name = self.eat_ident("a class name")?;

        let class_idx = self.vm.heap.module(self.module).classes.len();
        if class_idx >= MAX_CLASSES {
            return self.err("too many classes in one module");
        }
        let class = self
            .vm
            .allocate(ObjKind::Class(PkClass::new(name.clone(), Some(self.module))));
        self.vm.heap.module_mut(self.module).classes.push(class);

        // Synthesise the constructor: a fresh instance, one INST_APPEND per
        // field initialiser, then return the instance.
        let proto_idx = self.protos.len();
        if self.func_base + proto_idx - 1 >= MAX_FUNCTIONS {
            return self.err("too many functions in one module");
        }
        self.protos.push(Proto::new(name));
        self.scopes.push(FuncScope {
            proto: proto_idx,
            locals: Vec::new(),
            scope_depth: 0,
            stack: 0,
            loops: Vec::new(),
        });
        self.emit_op_u8(Op::PushInstance, class_idx as u8);

        self.skip_lines();
        while !self.check(&TokenKind::End) {
            if self.check(&TokenKind::Eof) {
                return self.err_eof();
            }
            let field = self.eat_ident("a field name")?;
            if self.vm.heap.class(class).field_index(&field).is_some() {
                return self.err(format!("duplicate field '{}'", field));
            }
            self.expect(&TokenKind::Assign, "'=' after field name")?;
            self.expression()?;
            self.emit_op(Op::InstAppend);
            self.vm.heap.class_mut(class).field_names.push(field);
            if !self.check(&TokenKind::End) {
                self.end_of_statement()?;
            }
        }
        self.expect(&TokenKind::End, "'end' after class body")?;
        self.emit_op(Op::Return);
        self.emit_op(Op::End);
        self.scopes.pop();
        self.pending_ctors.push((class, proto_idx));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Imports (resolved while compiling; see module header)
    // -----------------------------------------------------------------------

    fn import_statement(&mut self) -> Result<(), CompileError> {
        if self.scopes.len() > 1 || self.scope().scope_depth != DEPTH_SCRIPT {
            return self.err("imports are only allowed at module top level");
        }
        self.advance(); // import
        loop {
            let line = self.line();
            let name = self.eat_ident("a module name")?;
            let imported = self.import_now(&name, line)?;
            let bind = if self.match_tok(&TokenKind::As) {
                self.eat_ident("an import alias")?
            } else {
                self.vm.heap.module(imported).import_name()
            };
            let name_idx = self.intern_name(&name)?;
            let global = self.add_global_checked(&bind)?;
            self.emit_op_u16(Op::Import, name_idx);
            self.emit_op_u8(Op::StoreGlobal, global as u8);
            self.emit_op(Op::Pop);
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.end_of_statement()
    }

    fn from_import_statement(&mut self) -> Result<(), CompileError> {
        if self.scopes.len() > 1 || self.scope().scope_depth != DEPTH_SCRIPT {
            return self.err("imports are only allowed at module top level");
        }
        self.advance(); // from
        let line = self.line();
        let name = self.eat_ident("a module name")?;
        let imported = self.import_now(&name, line)?;
        self.expect(&TokenKind::Import, "'import' after module name")?;
        let name_idx = self.intern_name(&name)?;
        self.emit_op_u16(Op::Import, name_idx);

        if self.match_tok(&TokenKind::Star) {
            // Splice every public name: `$`-prefixed names stay private.
            let names = module_loader::public_names(self.vm, imported);
            for attr in names {
                let attr_idx = self.intern_name(&attr)?;
                let global = self.add_global_checked(&attr)?;
                self.emit_op_u16(Op::GetAttribKeep, attr_idx);
                self.emit_op_u8(Op::StoreGlobal, global as u8);
                self.emit_op(Op::Pop);
            }
        } else {
            loop {
                let attr = self.eat_ident("a name to import")?;
                let bind = if self.match_tok(&TokenKind::As) {
                    self.eat_ident("an import alias")?
                } else {
                    attr.clone()
                };
                let attr_idx = self.intern_name(&attr)?;
                let global = self.add_global_checked(&bind)?;
                self.emit_op_u16(Op::GetAttribKeep, attr_idx);
                self.emit_op_u8(Op::StoreGlobal, global as u8);
                self.emit_op(Op::Pop);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.emit_op(Op::Pop);
        self.end_of_statement()
    }

    fn import_now(&mut self, name: &str, line: u32) -> Result<Ref, CompileError> {
        let from = self.path.clone();
        module_loader::import_module(self.vm, &from, name)
            .map_err(|msg| self.error_at(line, msg))
    }

    fn add_global_checked(&mut self, name: &str) -> Result<usize, CompileError> {
        let module = self.vm.heap.module_mut(self.module);
        let idx = module.add_global(name);
        if idx >= MAX_GLOBALS {
            return self.err("too many module globals");
        }
        Ok(idx)
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn statement_block(&mut self, terminators: &[TokenKind]) -> Result<(), CompileError> {
        loop {
            self.skip_lines();
            if terminators.iter().any(|t| self.check(t)) {
                return Ok(());
            }
            if self.check(&TokenKind::Eof) {
                return self.err_eof();
            }
            self.statement()?;
        }
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.current() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Def | TokenKind::Class | TokenKind::Import | TokenKind::From => {
                self.err("declarations are only allowed at module top level")
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        self.assigned_in_stmt = false;
        self.declared_local_in_stmt = false;
        self.expression()?;
        if self.declared_local_in_stmt {
            // The value on the stack *is* the new local's slot.
        } else if self.repl
            && self.scopes.len() == 1
            && self.scope().scope_depth == DEPTH_SCRIPT
            && !self.assigned_in_stmt
        {
            self.emit_op(Op::ReplPrint);
        } else {
            self.emit_op(Op::Pop);
        }
        self.end_of_statement()
    }

    fn consume_block_opener(&mut self) {
        // `then` / `do` are optional when a newline follows the condition.
        if self.check(&TokenKind::Then) || self.check(&TokenKind::Do) {
            self.advance();
        }
        self.skip_lines();
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.advance(); // if
        let mut end_jumps = Vec::new();
        loop {
            self.expression()?;
            self.consume_block_opener();
            let next_branch = self.emit_jump(Op::JumpIfNot);

            let saved = self.enter_block();
            self.statement_block(&[TokenKind::End, TokenKind::Else, TokenKind::Elsif])?;
            self.exit_block(saved);

            match self.current().clone() {
                TokenKind::Elsif => {
                    end_jumps.push(self.emit_jump(Op::Jump));
                    self.patch_jump(next_branch)?;
                    self.advance();
                }
                TokenKind::Else => {
                    end_jumps.push(self.emit_jump(Op::Jump));
                    self.patch_jump(next_branch)?;
                    self.advance();
                    self.skip_lines();
                    let saved = self.enter_block();
                    self.statement_block(&[TokenKind::End])?;
                    self.exit_block(saved);
                    break;
                }
                _ => {
                    self.patch_jump(next_branch)?;
                    break;
                }
            }
        }
        self.expect(&TokenKind::End, "'end' after if statement")?;
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.advance(); // while
        let start = {
            let idx = self.scopes.last().unwrap().proto;
            self.protos[idx].code.len()
        };
        let locals_len = self.scope().locals.len();
        self.expression()?;
        self.consume_block_opener();
        let exit = self.emit_jump(Op::JumpIfNot);

        self.scope().loops.push(LoopCtx { start, break_jumps: Vec::new(), locals_len });
        let saved = self.enter_block();
        self.statement_block(&[TokenKind::End])?;
        self.exit_block(saved);
        self.expect(&TokenKind::End, "'end' after while body")?;

        self.emit_loop(start)?;
        self.patch_jump(exit)?;
        let ctx = self.scope().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.advance(); // for
        let var = self.eat_ident("a loop variable")?;
        self.expect(&TokenKind::In, "'in' after loop variable")?;

        let saved = self.enter_block();
        // Hidden iteration triple: sequence, iterator, the loop variable.
        self.expression()?;
        let base = self.declare_local("@Sequence")?;
        self.emit_op(Op::PushNull);
        self.declare_local("@iterator")?;
        self.emit_op(Op::PushNull);
        self.declare_local(&var)?;
        self.consume_block_opener();

        if base > u16::MAX as usize {
            return self.err("too many local variables");
        }
        self.emit_op_u16(Op::IterTest, base as u16);

        let iter_offset = {
            let idx = self.scopes.last().unwrap().proto;
            self.protos[idx].code.len()
        };
        // ITER base, exit — the exit operand patches once the body ends.
        self.emit_op(Op::Iter);
        {
            let line = self.line();
            let [hi, lo] = (base as u16).to_be_bytes();
            let proto = self.proto();
            proto.code.extend_from_slice(&[hi, lo, 0xff, 0xff]);
            proto.lines.extend_from_slice(&[line; 4]);
        }
        let exit_operand = iter_offset + 3;

        let locals_len = self.scope().locals.len();
        self.scope().loops.push(LoopCtx {
            start: iter_offset,
            break_jumps: Vec::new(),
            locals_len,
        });

        let body_saved = self.enter_block();
        self.statement_block(&[TokenKind::End])?;
        self.exit_block(body_saved);
        self.expect(&TokenKind::End, "'end' after for body")?;

        self.emit_loop(iter_offset)?;
        // Patch the ITER exit to land here (relative to the 5-byte
        // instruction's end).
        {
            let target = self.proto().code.len();
            let distance = target - (iter_offset + 5);
            if distance > u16::MAX as usize {
                return self.err("loop body exceeds jump limit");
            }
            let [hi, lo] = (distance as u16).to_be_bytes();
            let proto = self.proto();
            proto.code[exit_operand] = hi;
            proto.code[exit_operand + 1] = lo;
        }
        let ctx = self.scope().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_jump(jump)?;
        }
        self.exit_block(saved);
        Ok(())
    }

    fn break_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        let (locals_len, has_loop) = match self.scope().loops.last() {
            Some(ctx) => (ctx.locals_len, true),
            None => (0, false),
        };
        if !has_loop {
            return self.err("'break' outside a loop");
        }
        let pops = self.scope().locals.len() - locals_len;
        for _ in 0..pops {
            self.emit_op(Op::Pop);
        }
        // The locals stay alive on the fall-through path.
        self.track(pops as i32);
        let jump = self.emit_jump(Op::Jump);
        self.scope().loops.last_mut().unwrap().break_jumps.push(jump);
        self.end_of_statement()
    }

    fn continue_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        let (start, locals_len, has_loop) = match self.scope().loops.last() {
            Some(ctx) => (ctx.start, ctx.locals_len, true),
            None => (0, 0, false),
        };
        if !has_loop {
            return self.err("'continue' outside a loop");
        }
        let pops = self.scope().locals.len() - locals_len;
        for _ in 0..pops {
            self.emit_op(Op::Pop);
        }
        self.track(pops as i32);
        self.emit_loop(start)?;
        self.end_of_statement()
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        if self.scopes.len() == 1 {
            return self.err("'return' outside a function");
        }
        if self.check(&TokenKind::Line)
            || self.check(&TokenKind::Eof)
            || self.check(&TokenKind::End)
        {
            self.emit_op(Op::PushNull);
        } else {
            self.expression()?;
            // A direct call in return position becomes a tail call.
            if let Some((offset, Op::Call)) = self.proto().last_op {
                self.proto().code[offset] = Op::TailCall as u8;
            }
        }
        self.emit_op(Op::Return);
        self.end_of_statement()
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Prec::Assignment)
    }

    fn parse_precedence(&mut self, prec: Prec) -> Result<(), CompileError> {
        let can_assign = prec <= Prec::Assignment;
        let token = self.advance();
        self.prefix(token, can_assign)?;
        while infix_prec(self.current()) >= prec && infix_prec(self.current()) != Prec::None {
            let token = self.advance();
            self.infix(token, can_assign)?;
        }
        if can_assign && self.is_assign_op() {
            return self.err("invalid assignment target");
        }
        Ok(())
    }

    fn is_assign_op(&self) -> bool {
        use TokenKind::*;
        matches!(
            self.current(),
            Assign | PlusEq | MinusEq | StarEq | SlashEq | PercentEq | AmpEq | PipeEq
                | CaretEq | LshiftEq | RshiftEq
        )
    }

    /// The binary opcode a compound-assignment operator applies.
    fn compound_op(kind: &TokenKind) -> Option<Op> {
        use TokenKind::*;
        Some(match kind {
            PlusEq => Op::Add,
            MinusEq => Op::Sub,
            StarEq => Op::Mul,
            SlashEq => Op::Div,
            PercentEq => Op::Mod,
            AmpEq => Op::BitAnd,
            PipeEq => Op::BitOr,
            CaretEq => Op::BitXor,
            LshiftEq => Op::BitLshift,
            RshiftEq => Op::BitRshift,
            _ => return None,
        })
    }

    fn prefix(&mut self, token: TokenKind, can_assign: bool) -> Result<(), CompileError> {
        match token {
            TokenKind::Number(n) => self.emit_number(n),
            TokenKind::Str(s) => {
                let idx = self.add_literal_str(&s)?;
                self.emit_op_u16(Op::Constant, idx);
                Ok(())
            }
            TokenKind::InterpStr(segments) => self.interpolated_string(segments),
            TokenKind::Ident(name) => self.variable(&name, can_assign),
            TokenKind::True => {
                self.emit_op(Op::PushTrue);
                Ok(())
            }
            TokenKind::False => {
                self.emit_op(Op::PushFalse);
                Ok(())
            }
            TokenKind::Null => {
                self.emit_op(Op::PushNull);
                Ok(())
            }
            TokenKind::LParen => {
                self.skip_lines();
                self.expression()?;
                self.skip_lines();
                self.expect(&TokenKind::RParen, "')' after expression")
            }
            TokenKind::LBracket => self.list_literal(),
            TokenKind::LBrace => self.map_literal(),
            TokenKind::Minus => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(Op::Negative);
                Ok(())
            }
            TokenKind::Not | TokenKind::Bang => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(Op::Not);
                Ok(())
            }
            TokenKind::Tilde => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(Op::BitNot);
                Ok(())
            }
            TokenKind::Func => {
                let name = format!("fn@{}", self.line());
                self.compile_function(name, false)?;
                Ok(())
            }
            TokenKind::Eof => self.err_eof(),
            other => self.err(format!("unexpected token {:?}", other)),
        }
    }

    fn emit_number(&mut self, n: f64) -> Result<(), CompileError> {
        if n.to_bits() == 0f64.to_bits() {
            self.emit_op(Op::PushZero);
        } else if n.to_bits() == 1f64.to_bits() {
            self.emit_op(Op::PushOne);
        } else {
            let idx = self.add_literal(Value::num(n))?;
            self.emit_op_u16(Op::Constant, idx);
        }
        Ok(())
    }

    fn interpolated_string(&mut self, segments: Vec<StrSegment>) -> Result<(), CompileError> {
        if segments.is_empty() {
            let idx = self.add_literal_str("")?;
            self.emit_op_u16(Op::Constant, idx);
            return Ok(());
        }
        if self.interp_depth >= MAX_INTERP_DEPTH {
            return self.err("string interpolation nested too deeply");
        }
        let str_builtin = self
            .vm
            .find_builtin("str")
            .expect("builtin 'str' must exist");
        let mut first = true;
        for segment in segments {
            match segment {
                StrSegment::Literal(text) => {
                    let idx = self.add_literal_str(&text)?;
                    self.emit_op_u16(Op::Constant, idx);
                }
                StrSegment::Expr(text, line) => {
                    // Stringify through the `str` builtin so concatenation
                    // below always joins strings.
                    self.emit_op_u8(Op::PushBuiltinFn, str_builtin as u8);
                    self.compile_embedded_expression(&text, line)?;
                    self.emit_op_u8(Op::Call, 1);
                    self.track(-1);
                }
            }
            if first {
                first = false;
            } else {
                self.emit_op(Op::Add);
            }
        }
        Ok(())
    }

    /// Compile an expression captured as raw text (an interpolation
    /// segment) by swapping in a private token stream.
    fn compile_embedded_expression(&mut self, text: &str, line: u32) -> Result<(), CompileError> {
        let mut lexer = Lexer::new_at_line(text, line);
        let tokens = lexer.tokenize().map_err(|e| {
            self.error_at(e.line(), format!("in interpolated expression: {}", e))
        })?;
        let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
        let saved_pos = std::mem::replace(&mut self.pos, 0);
        self.interp_depth += 1;

        let result = (|| {
            self.expression()?;
            self.skip_lines();
            if !self.check(&TokenKind::Eof) {
                return self.err("unexpected token in interpolated expression");
            }
            Ok(())
        })();

        self.interp_depth -= 1;
        self.tokens = saved_tokens;
        self.pos = saved_pos;
        result
    }

    fn list_literal(&mut self) -> Result<(), CompileError> {
        let operand_offset = self.emit_u16_placeholder(Op::PushList);
        let mut count = 0u16;
        self.skip_lines();
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression()?;
                self.emit_op(Op::ListAppend);
                count = count.saturating_add(1);
                self.skip_lines();
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
                self.skip_lines();
            }
        }
        self.expect(&TokenKind::RBracket, "']' after list elements")?;
        let [hi, lo] = count.to_be_bytes();
        let proto = self.proto();
        proto.code[operand_offset] = hi;
        proto.code[operand_offset + 1] = lo;
        Ok(())
    }

    /// Emit `op` with a u16 placeholder operand; returns the operand offset.
    fn emit_u16_placeholder(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let line = self.line();
        let proto = self.proto();
        let offset = proto.code.len();
        proto.code.extend_from_slice(&[0, 0]);
        proto.lines.extend_from_slice(&[line, line]);
        offset
    }

    fn map_literal(&mut self) -> Result<(), CompileError> {
        self.emit_op(Op::PushMap);
        self.skip_lines();
        if !self.check(&TokenKind::RBrace) {
            loop {
                self.expression()?;
                self.expect(&TokenKind::Colon, "':' after map key")?;
                self.skip_lines();
                self.expression()?;
                self.emit_op(Op::MapInsert);
                self.skip_lines();
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
                self.skip_lines();
            }
        }
        self.expect(&TokenKind::RBrace, "'}' after map entries")?;
        Ok(())
    }

    fn variable(&mut self, name: &str, can_assign: bool) -> Result<(), CompileError> {
        // Locals of the current function only; outer-function locals are
        // invisible by design.
        if let Some(index) = self.resolve_local(name) {
            if can_assign && self.is_assign_op() {
                let op_token = self.advance();
                self.assigned_in_stmt = true;
                if let Some(binary) = Self::compound_op(&op_token) {
                    self.emit_push_local(index);
                    self.parse_precedence(Prec::Assignment)?;
                    self.emit_op(binary);
                } else {
                    self.parse_precedence(Prec::Assignment)?;
                }
                self.emit_store_local(index);
            } else {
                self.emit_push_local(index);
            }
            return Ok(());
        }

        let global = self.vm.heap.module(self.module).global_index(name);
        if let Some(index) = global {
            if can_assign && self.is_assign_op() {
                let op_token = self.advance();
                self.assigned_in_stmt = true;
                if let Some(binary) = Self::compound_op(&op_token) {
                    self.emit_op_u8(Op::PushGlobal, index as u8);
                    self.parse_precedence(Prec::Assignment)?;
                    self.emit_op(binary);
                } else {
                    self.parse_precedence(Prec::Assignment)?;
                }
                self.emit_op_u8(Op::StoreGlobal, index as u8);
            } else {
                self.emit_op_u8(Op::PushGlobal, index as u8);
            }
            return Ok(());
        }

        if can_assign && self.check(&TokenKind::Assign) {
            // First assignment declares the variable: a local inside any
            // block, a module global at the top level.
            self.advance();
            self.assigned_in_stmt = true;
            if self.scope().scope_depth < 0 {
                let index = self.add_global_checked(name)?;
                self.parse_precedence(Prec::Assignment)?;
                self.emit_op_u8(Op::StoreGlobal, index as u8);
            } else {
                if self.declared_local_in_stmt {
                    return self.err("cannot declare two variables in one statement");
                }
                self.parse_precedence(Prec::Assignment)?;
                self.declare_local(name)?;
                self.declared_local_in_stmt = true;
            }
            return Ok(());
        }

        if let Some(index) = self.resolve_class(name) {
            self.emit_op_u8(Op::PushClass, index as u8);
            return Ok(());
        }
        if let Some(index) = self.resolve_function(name) {
            self.emit_op_u8(Op::PushFn, index as u8);
            return Ok(());
        }
        if let Some(index) = self.vm.find_builtin(name) {
            self.emit_op_u8(Op::PushBuiltinFn, index as u8);
            return Ok(());
        }

        // Inside a function body an unknown name may be a function defined
        // later in the module; record it for the post-compile fixup.
        if self.scopes.len() > 1 {
            let line = self.line();
            let proto = self.scopes.last().unwrap().proto;
            self.emit_op(Op::PushFn);
            let operand_offset = self.protos[proto].code.len();
            self.emit_byte(0);
            self.forwards.push(ForwardName {
                proto,
                operand_offset,
                name: name.to_string(),
                line,
            });
            return Ok(());
        }

        self.err(format!("name '{}' is not defined", name))
    }

    fn infix(&mut self, token: TokenKind, can_assign: bool) -> Result<(), CompileError> {
        use TokenKind::*;
        match token {
            And => return self.logical_and(),
            Or => return self.logical_or(),
            Arrow => return self.chain_call(),
            LParen => return self.call(),
            LBracket => return self.subscript(can_assign),
            Dot => return self.attribute(can_assign),
            _ => {}
        }

        let (op, prec) = match token {
            EqEq => (Op::Eq, Prec::Equality),
            NotEq => (Op::NotEq, Prec::Equality),
            In => (Op::In, Prec::Membership),
            Lt => (Op::Lt, Prec::Comparison),
            Gt => (Op::Gt, Prec::Comparison),
            LtEq => (Op::LtEq, Prec::Comparison),
            GtEq => (Op::GtEq, Prec::Comparison),
            Pipe => (Op::BitOr, Prec::BitOr),
            Caret => (Op::BitXor, Prec::BitXor),
            Amp => (Op::BitAnd, Prec::BitAnd),
            Lshift => (Op::BitLshift, Prec::Shift),
            Rshift => (Op::BitRshift, Prec::Shift),
            DotDot => (Op::MakeRange, Prec::Range),
            Plus => (Op::Add, Prec::Term),
            Minus => (Op::Sub, Prec::Term),
            Star => (Op::Mul, Prec::Factor),
            Slash => (Op::Div, Prec::Factor),
            Percent => (Op::Mod, Prec::Factor),
            other => return self.err(format!("unexpected operator {:?}", other)),
        };
        self.parse_precedence(prec.stronger())?;
        self.emit_op(op);
        Ok(())
    }

    /// `and`/`or` compile to paired conditional jumps that leave a bare
    /// `true`/`false` on the stack, never an operand value.
    fn logical_and(&mut self) -> Result<(), CompileError> {
        let short1 = self.emit_jump(Op::JumpIfNot);
        self.parse_precedence(Prec::And.stronger())?;
        let short2 = self.emit_jump(Op::JumpIfNot);
        self.emit_op(Op::PushTrue);
        self.track(-1); // only one of the two pushes materialises
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(short1)?;
        self.patch_jump(short2)?;
        self.emit_op(Op::PushFalse);
        self.patch_jump(done)?;
        Ok(())
    }

    fn logical_or(&mut self) -> Result<(), CompileError> {
        let short1 = self.emit_jump(Op::JumpIf);
        self.parse_precedence(Prec::Or.stronger())?;
        let short2 = self.emit_jump(Op::JumpIf);
        self.emit_op(Op::PushFalse);
        self.track(-1);
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(short1)?;
        self.patch_jump(short2)?;
        self.emit_op(Op::PushTrue);
        self.patch_jump(done)?;
        Ok(())
    }

    /// `expr -> fn {a, b}`: the piped value becomes the first argument.
    fn chain_call(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Prec::ChainCall.stronger())?;
        self.emit_op(Op::Swap);
        let mut argc: usize = 1;
        if self.match_tok(&TokenKind::LBrace) {
            self.skip_lines();
            if !self.check(&TokenKind::RBrace) {
                loop {
                    self.expression()?;
                    argc += 1;
                    self.skip_lines();
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_lines();
                }
            }
            self.expect(&TokenKind::RBrace, "'}' after chain-call arguments")?;
        }
        if argc > MAX_ARGS {
            return self.err("too many arguments");
        }
        self.emit_op_u8(Op::Call, argc as u8);
        self.track(-(argc as i32));
        Ok(())
    }

    fn call(&mut self) -> Result<(), CompileError> {
        let argc = self.argument_list(&TokenKind::RParen, "')' after arguments")?;
        self.emit_op_u8(Op::Call, argc as u8);
        self.track(-(argc as i32));
        Ok(())
    }

    fn argument_list(
        &mut self,
        closing: &TokenKind,
        what: &str,
    ) -> Result<usize, CompileError> {
        let mut argc = 0usize;
        self.skip_lines();
        if !self.check(closing) {
            loop {
                self.expression()?;
                argc += 1;
                self.skip_lines();
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
                self.skip_lines();
            }
        }
        self.expect(closing, what)?;
        if argc > MAX_ARGS {
            return self.err("too many arguments");
        }
        Ok(argc)
    }

    fn subscript(&mut self, can_assign: bool) -> Result<(), CompileError> {
        self.skip_lines();
        self.expression()?;
        self.skip_lines();
        self.expect(&TokenKind::RBracket, "']' after subscript")?;
        if can_assign && self.is_assign_op() {
            let op_token = self.advance();
            self.assigned_in_stmt = true;
            if let Some(binary) = Self::compound_op(&op_token) {
                self.emit_op(Op::GetSubscriptKeep);
                self.parse_precedence(Prec::Assignment)?;
                self.emit_op(binary);
            } else {
                self.parse_precedence(Prec::Assignment)?;
            }
            self.emit_op(Op::SetSubscript);
        } else {
            self.emit_op(Op::GetSubscript);
        }
        Ok(())
    }

    fn attribute(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let name = self.eat_ident("an attribute name")?;
        let name_idx = self.intern_name(&name)?;

        // `obj.name(args)` fuses into METHOD_CALL so the receiver lands in
        // the callee slot as `self`.
        if self.check(&TokenKind::LParen) {
            self.advance();
            let argc = self.argument_list(&TokenKind::RParen, "')' after arguments")?;
            self.emit_op(Op::MethodCall);
            let line = self.line();
            let [nh, nl] = name_idx.to_be_bytes();
            let [ah, al] = (argc as u16).to_be_bytes();
            let proto = self.proto();
            proto.code.extend_from_slice(&[nh, nl, ah, al]);
            proto.lines.extend_from_slice(&[line; 4]);
            self.track(-(argc as i32));
            return Ok(());
        }

        if can_assign && self.is_assign_op() {
            let op_token = self.advance();
            self.assigned_in_stmt = true;
            if let Some(binary) = Self::compound_op(&op_token) {
                self.emit_op_u16(Op::GetAttribKeep, name_idx);
                self.parse_precedence(Prec::Assignment)?;
                self.emit_op(binary);
            } else {
                self.parse_precedence(Prec::Assignment)?;
            }
            self.emit_op_u16(Op::SetAttrib, name_idx);
        } else {
            self.emit_op_u16(Op::GetAttrib, name_idx);
        }
        Ok(())
    }
}
