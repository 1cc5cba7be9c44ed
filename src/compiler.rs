// File: src/compiler.rs
//
// Single-pass Pratt-parser compiler for the Lox language: tokens come
// off the scanner on demand and are turned directly into bytecode with
// no intermediate AST. A `Compiler` owns one stack of `FunctionFrame`s,
// one per nested `fun`/method body currently being compiled; the whole
// top-level compile is wrapped in one nursery (see gc.rs) so every
// function/string object allocated while any frame in that chain is
// still open stays a GC root until the outermost frame finishes.

use crate::bytecode::{Chunk, OpCode};
use crate::errors::{CompileError, TokenContext};
use crate::gc::{Heap, ObjRef};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::{FunctionObj, Object, UpvalueSource};
use crate::value::Value;

const UINT8_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
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
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

struct Local<'src> {
    name: &'src str,
    /// -1 marks "declared but not yet initialized" — reading it is an
    /// error (`var a = a;`), matching clox.
    depth: i32,
    is_captured: bool,
}

struct FunctionFrame<'src> {
    function: FunctionObj,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSource>,
    scope_depth: i32,
}

impl<'src> FunctionFrame<'src> {
    fn new(kind: FunctionKind) -> Self {
        // Slot 0 is reserved. Methods and initializers use it for the
        // receiver (`this`); plain functions and the top-level script
        // leave it unnamed so every other local index lines up the same
        // way regardless of kind.
        let reserved_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        FunctionFrame {
            function: FunctionObj::new(),
            kind,
            locals: vec![Local { name: reserved_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCompilerState {
    has_superclass: bool,
}

/// Compiles one script into a top-level `FunctionObj` (wrapped by the VM
/// into a closure with no upvalues before execution starts).
pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    classes: Vec<ClassCompilerState>,
    frames: Vec<FunctionFrame<'src>>,
}

pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    heap.open_nursery();
    let result = {
        let mut compiler = Compiler::new(source, heap);
        compiler.run()
    };
    heap.close_nursery();
    result
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Compiler {
            scanner: Scanner::new(source),
            heap,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            classes: Vec::new(),
            frames: vec![FunctionFrame::new(FunctionKind::Script)],
        }
    }

    fn run(&mut self) -> Result<ObjRef, Vec<CompileError>> {
        self.advance();
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        let function_ref = self.end_compiler();
        if self.had_error {
            Err(std::mem::take(&mut self.errors))
        } else {
            Ok(function_ref)
        }
    }

    // --- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if !self.current.is_error() {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
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

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = if token.kind == TokenKind::Eof {
            TokenContext::Eof
        } else {
            TokenContext::Lexeme(token.lexeme.to_string())
        };
        self.errors.push(CompileError { line: token.line, at, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- frame / chunk plumbing -------------------------------------------------

    fn current_frame(&mut self) -> &mut FunctionFrame<'src> {
        self.frames.last_mut().expect("frame stack must not be empty")
    }

    fn current_frame_ref(&self) -> &FunctionFrame<'src> {
        self.frames.last().expect("frame stack must not be empty")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_frame().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.previous.line;
        self.current_chunk().write_u16_placeholder(line)
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current_chunk().patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.previous.line;
        self.current_chunk().write_byte(((offset >> 8) & 0xff) as u8, line);
        self.current_chunk().write_byte((offset & 0xff) as u8, line);
    }

    fn emit_return(&mut self) {
        if matches!(self.current_frame_ref().kind, FunctionKind::Initializer) {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        match self.current_chunk().add_constant(value) {
            Ok(index) => self.emit_op_byte(OpCode::LoadConstant, index),
            Err(message) => self.error(message),
        }
    }

    /// Finishes the top-level script frame (the only caller; nested
    /// functions are finished inline by `function()`).
    fn end_compiler(&mut self) -> ObjRef {
        self.emit_return();
        let frame = self.frames.pop().expect("script frame must be present");
        let mut function = frame.function;
        function.upvalue_count = frame.upvalues.len();
        self.heap.alloc(Object::Function(function))
    }

    // --- declarations -------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompilerState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if name_token.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(name_token, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().expect("pushed above").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(name_lexeme);
        let kind =
            if name_lexeme == "__init__" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a `fun`/method body into its own frame, then emits the
    /// enclosing `OP_CLOSURE` plus one (is_local, index) pair per
    /// upvalue the finished frame captured.
    fn function(&mut self, kind: FunctionKind) {
        let name_handle = self.heap.intern(self.previous.lexeme);
        self.heap.open_nursery();
        self.frames.push(FunctionFrame::new(kind));
        self.current_frame().function.name = Some(name_handle);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_frame_ref().function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let new_arity = self.current_frame_ref().function.arity.saturating_add(1);
                self.current_frame().function.arity = new_arity;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.capture_docstring();
        self.block();

        self.emit_return();
        let frame = self.frames.pop().expect("just-pushed function frame");
        let mut function = frame.function;
        function.upvalue_count = frame.upvalues.len();
        let function_ref = self.heap.alloc(Object::Function(function));
        self.heap.close_nursery();

        let constant = match self.current_chunk().add_constant(Value::Object(function_ref)) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                0
            }
        };
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in &frame.upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    /// If the function body opens with a bare string-literal statement,
    /// records it as the function's docstring instead of compiling it as
    /// an expression statement (it would otherwise just push and pop a
    /// value no one observes).
    fn capture_docstring(&mut self) {
        if !self.check(TokenKind::String) {
            return;
        }
        let mut lookahead = self.scanner;
        let next = lookahead.scan_token();
        if next.kind != TokenKind::Semicolon {
            return;
        }
        self.advance(); // the string
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len().saturating_sub(1)];
        let handle = self.heap.intern(text);
        self.current_frame().function.docstring = Some(handle);
        self.advance(); // the semicolon
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_frame_ref().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        match self.current_chunk().add_constant(Value::Object(handle)) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                0
            }
        }
    }

    fn declare_variable(&mut self) {
        if self.current_frame_ref().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = self.current_frame_ref().scope_depth;
        let mut duplicate = false;
        for local in self.current_frame_ref().locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_frame_ref().locals.len() >= UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_frame().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.current_frame_ref().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame_ref().scope_depth;
        if let Some(local) = self.current_frame().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_frame_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    // --- statements -------------------------------------------------

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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

    fn begin_scope(&mut self) {
        self.current_frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_frame().scope_depth -= 1;
        let scope_depth = self.current_frame_ref().scope_depth;
        loop {
            let should_pop = match self.current_frame_ref().locals.last() {
                Some(local) => local.depth > scope_depth,
                None => false,
            };
            if !should_pop {
                break;
            }
            let captured =
                self.current_frame_ref().locals.last().expect("checked above").is_captured;
            self.emit_op(if captured { OpCode::CloseUpvalue } else { OpCode::Pop });
            self.current_frame().locals.pop();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
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

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if matches!(self.current_frame_ref().kind, FunctionKind::Script) {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if matches!(self.current_frame_ref().kind, FunctionKind::Initializer) {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // --- expressions -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= Self::precedence_of(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn precedence_of(kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Or => Precedence::Or,
            And => Precedence::And,
            EqualEqual | BangEqual => Precedence::Equality,
            Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
            Plus | Minus => Precedence::Term,
            Star | Slash => Precedence::Factor,
            LeftParen | Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(can_assign),
            TokenKind::Minus | TokenKind::Bang => self.unary(can_assign),
            TokenKind::Number => self.number(can_assign),
            TokenKind::String => self.string(can_assign),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(can_assign),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(can_assign),
            TokenKind::Super => self.super_expr(can_assign),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(can_assign),
            TokenKind::And => self.and_expr(can_assign),
            TokenKind::Or => self.or_expr(can_assign),
            TokenKind::LeftParen => self.call(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            _ => return false,
        }
        true
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() only dispatched for - and !"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Self::precedence_of(op_kind).next());
        match op_kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary() only dispatched for binary operators"),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let handle = self.heap.intern(text);
        self.emit_constant(Value::Object(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only dispatched for true/false/nil"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked non-empty").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.identifier_constant(self.previous.lexeme);
        let line = self.previous.line;

        let this_token = Token { kind: TokenKind::This, lexeme: "this", line };
        let super_token = Token { kind: TokenKind::Super, lexeme: "super", line };
        self.named_variable(this_token, false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op_byte(OpCode::SuperInvoke, method_name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_op_byte(OpCode::GetSuper, method_name);
        }
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame_index = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(local_index) =
            self.resolve_local(frame_index, name.lexeme)
        {
            (OpCode::GetLocal, OpCode::SetLocal, local_index)
        } else if let Some(upvalue_index) = self.resolve_upvalue(frame_index, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue_index)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        let locals = &self.frames[frame_index].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        let enclosing_index = frame_index - 1;
        if let Some(local_index) = self.resolve_local(enclosing_index, name) {
            self.frames[enclosing_index].locals[local_index as usize].is_captured = true;
            return Some(self.add_upvalue(frame_index, local_index, true));
        }
        if let Some(upvalue_index) = self.resolve_upvalue(enclosing_index, name) {
            return Some(self.add_upvalue(frame_index, upvalue_index, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.frames[frame_index].upvalues;
        for (i, existing) in upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame_index].upvalues.push(UpvalueSource { is_local, index });
        (self.frames[frame_index].upvalues.len() - 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        match compile(source, &mut heap) {
            Ok(function_ref) => (function_ref, heap),
            Err(errors) => panic!("unexpected compile errors: {errors:?}"),
        }
    }

    fn opcodes_of(heap: &Heap, function_ref: ObjRef) -> Vec<OpCode> {
        let function = match heap.get(function_ref) {
            Object::Function(f) => f,
            _ => panic!("expected function object"),
        };
        let mut ops = Vec::new();
        let mut i = 0;
        while i < function.chunk.code.len() {
            let op = OpCode::from_byte(function.chunk.code[i]).expect("valid opcode");
            ops.push(op);
            i += 1 + operand_len(heap, op, &function.chunk, i);
        }
        ops
    }

    fn operand_len(heap: &Heap, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
        use OpCode::*;
        match op {
            LoadConstant | GetLocal | SetLocal | GetUpvalue | SetUpvalue | GetGlobal
            | SetGlobal | DefineGlobal | GetProperty | SetProperty | GetSuper | Call | Class
            | Method => 1,
            Invoke | SuperInvoke => 2,
            Jump | JumpIfFalse | Loop => 2,
            Closure => {
                let constant_index = chunk.code[offset + 1] as usize;
                let upvalue_count = match &chunk.constants[constant_index] {
                    Value::Object(handle) => match heap.get(*handle) {
                        Object::Function(f) => f.upvalue_count,
                        _ => 0,
                    },
                    _ => 0,
                };
                1 + upvalue_count * 2
            }
            _ => 0,
        }
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let (function_ref, heap) = compile_ok("1 + 2 * 3;");
        let ops = opcodes_of(&heap, function_ref);
        assert_eq!(
            ops,
            vec![
                OpCode::LoadConstant,
                OpCode::LoadConstant,
                OpCode::LoadConstant,
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn accumulates_multiple_syntax_errors_via_panic_mode_recovery() {
        let mut heap = Heap::new();
        let errors = compile("var ; var ;", &mut heap).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn block_local_reads_use_get_local_not_get_global() {
        let (function_ref, heap) = compile_ok("{ var a = 1; print a; }");
        let ops = opcodes_of(&heap, function_ref);
        assert!(ops.contains(&OpCode::GetLocal));
        assert!(!ops.contains(&OpCode::GetGlobal));
    }

    #[test]
    fn closure_captures_enclosing_local_as_one_upvalue() {
        let (function_ref, heap) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; } outer;",
        );
        let outer = match heap.get(function_ref) {
            Object::Function(f) => f,
            _ => panic!(),
        };
        // Find the Closure op's constant index for `outer`, then read
        // `inner`'s own upvalue_count off the nested FunctionObj.
        let constant = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Object(handle) => match heap.get(*handle) {
                    Object::Function(f) if f.name.is_some() => Some(*handle),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer's constant pool holds the inner FunctionObj");
        let inner = match heap.get(constant) {
            Object::Function(f) => f,
            _ => panic!(),
        };
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn docstring_is_captured_without_emitting_bytecode() {
        let (function_ref, heap) = compile_ok("fun f() { \"does a thing\"; return 1; }");
        let outer_ops = opcodes_of(&heap, function_ref);
        assert!(outer_ops.contains(&OpCode::Closure));
        let inner_handle = match heap.get(function_ref) {
            Object::Function(f) => f
                .chunk
                .constants
                .iter()
                .find_map(|c| match c {
                    Value::Object(h) => match heap.get(*h) {
                        Object::Function(_) => Some(*h),
                        _ => None,
                    },
                    _ => None,
                })
                .unwrap(),
            _ => panic!(),
        };
        let inner = match heap.get(inner_handle) {
            Object::Function(f) => f,
            _ => panic!(),
        };
        assert!(inner.docstring.is_some());
        assert_eq!(heap.as_str(inner.docstring.unwrap()), "does a thing");
    }

    #[test]
    fn returning_a_value_from_an_initializer_is_a_compile_error() {
        let mut heap = Heap::new();
        let errors = compile(
            "class Box { __init__(v) { this.v = v; return v; } }",
            &mut heap,
        )
        .unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("initializer")));
    }

    #[test]
    fn bare_return_in_an_initializer_reads_back_this_not_nil() {
        let (function_ref, heap) = compile_ok("class Box { __init__(v) { this.v = v; return; } }");
        let constant = match heap.get(function_ref) {
            Object::Function(f) => f
                .chunk
                .constants
                .iter()
                .find_map(|c| match c {
                    Value::Object(handle) => match heap.get(*handle) {
                        Object::Function(inner) if inner.name.is_some() => Some(*handle),
                        _ => None,
                    },
                    _ => None,
                })
                .expect("class body holds the __init__ FunctionObj"),
            _ => panic!(),
        };
        let ops = opcodes_of(&heap, constant);
        assert_eq!(ops.last(), Some(&OpCode::Return));
        assert!(ops.contains(&OpCode::GetLocal));
    }
}
