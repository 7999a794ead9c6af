//! The single-pass Pratt compiler (spec §4.3): parses and emits bytecode in
//! one traversal, no intermediate AST.

use loxi_core::{CompileError, Heap, ObjData, ObjRef, OpCode, SelfOp, Value};

use crate::precedence::Precedence;
use crate::rules::get_rule;
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

const MAX_LOCALS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    Lambda,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

/// One function currently being compiled. The compiler holds a stack of
/// these, parent first; the currently-parsed function is always the last.
struct FuncCtx<'src> {
    kind: FunctionKind,
    name: Option<String>,
    arity: u8,
    chunk: loxi_core::Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: i32,
}

impl<'src> FuncCtx<'src> {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot 0 is a synthetic receiver local: named "this" for methods and
        // initializers (so ordinary identifier resolution finds it), unused
        // and unreachable-by-name otherwise.
        let slot0 = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        FuncCtx {
            kind,
            name,
            arity: 0,
            chunk: loxi_core::Chunk::new(),
            locals: vec![Local {
                name: slot0,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    contexts: Vec<FuncCtx<'src>>,
    classes: Vec<ClassCtx>,
}

/// Compiles `source` into a top-level script function (spec §4.3's "Output").
/// On any parse error, returns every accumulated diagnostic instead.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let eof = Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: 0,
    };
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        heap,
        previous: eof,
        current: eof,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        contexts: vec![FuncCtx::new(FunctionKind::Script, None)],
        classes: Vec::new(),
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    let (function, _upvalues) = compiler.end_compiler();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    // ---------------------------------------------------------------- core

    fn current_ctx(&mut self) -> &mut FuncCtx<'src> {
        self.contexts.last_mut().expect("compiler context stack is never empty")
    }

    fn chunk(&mut self) -> &mut loxi_core::Chunk {
        &mut self.current_ctx().chunk
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
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

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token.lexeme.to_string())
        };
        self.errors.push(CompileError {
            line: token.line,
            lexeme,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fn
                | TokenKind::Let
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

    // --------------------------------------------------------------- emit

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_op_byte(&mut self, op: OpCode, b: u8) {
        self.emit_byte(op as u8);
        self.emit_byte(b);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.chunk().write_u16_placeholder(self.previous.line);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let target = self.chunk().len();
        if self.chunk().patch_jump(offset, target).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_return(&mut self) {
        if self.current_ctx().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        self.heap.protect(value);
        let result = self.chunk().add_constant(value);
        self.heap.unprotect();
        match result {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.heap.intern_string(name);
        self.make_constant(Value::Obj(obj))
    }

    /// Pops the current function context, allocating its `FunctionObj`.
    /// Returns the function plus its upvalue descriptors so the caller (in
    /// the *enclosing* context) can emit them after `OP_CLOSURE`.
    fn end_compiler(&mut self) -> (ObjRef, Vec<(bool, u8)>) {
        self.emit_return();
        let ctx = self.contexts.pop().expect("popping a pushed context");
        let name = ctx.name.map(|n| self.heap.intern_string(&n));
        if let Some(name) = name {
            self.heap.protect(Value::Obj(name));
        }
        let function = loxi_core::FunctionObj {
            name,
            arity: ctx.arity,
            upvalue_count: ctx.upvalues.len() as u8,
            chunk: ctx.chunk,
        };
        let obj = self.heap.alloc(ObjData::Function(function), 0);
        if name.is_some() {
            self.heap.unprotect();
        }
        let descriptors = ctx
            .upvalues
            .into_iter()
            .map(|u| (u.is_local, u.index))
            .collect();
        (obj, descriptors)
    }

    // -------------------------------------------------------------- scope

    fn begin_scope(&mut self) {
        self.current_ctx().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let ctx = self.current_ctx();
            ctx.scope_depth -= 1;
            ctx.scope_depth
        };
        loop {
            let should_pop = match self.current_ctx().locals.last() {
                Some(local) => local.depth > depth,
                None => false,
            };
            if !should_pop {
                break;
            }
            let local = self.current_ctx().locals.pop().unwrap();
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    // ------------------------------------------------------- declarations

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.matches(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);
        self.declare_variable();
        if self.current_ctx().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn declare_variable(&mut self) {
        if self.current_ctx().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.current_ctx().scope_depth;
        let mut duplicate = false;
        for local in self.current_ctx().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
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
        if self.current_ctx().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_ctx().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let ctx = self.current_ctx();
        if ctx.scope_depth == 0 {
            return;
        }
        let depth = ctx.scope_depth;
        if let Some(local) = ctx.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_ctx().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn let_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme.to_string();
        self.function_body(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name_tok = self.previous;
        let class_name = class_name_tok.lexeme.to_string();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCtx {
            has_superclass: false,
        });

        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            if self.previous.lexeme == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.variable(false);

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable_by_name(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable_by_name(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(&class_name);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let class_ctx = self.classes.pop().unwrap();
        if class_ctx.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self, class_name: &str) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&method_name);
        let kind = if method_name == class_name {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function_body(kind, method_name);
        self.emit_op_byte(OpCode::Method, constant);
    }

    /// Shared by `fn` declarations, methods, and lambdas: pushes a new
    /// function context, compiles `(params) { body }`, then pops it and
    /// emits `OP_CLOSURE` plus its upvalue descriptors in the *enclosing*
    /// context. Parameters become locals at depth 1 via a single
    /// `begin_scope` with no matching `end_scope` — the whole context,
    /// locals included, is discarded when popped.
    fn function_body(&mut self, kind: FunctionKind, name: String) {
        self.contexts.push(FuncCtx::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let ctx_arity = self.current_ctx().arity;
                if ctx_arity == u8::MAX {
                    self.error("Can't have more than 255 parameters.");
                }
                self.current_ctx().arity += 1;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block_contents();

        let (function, upvalues) = self.end_compiler();

        let idx = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, idx);
        for (is_local, index) in upvalues {
            self.emit_bytes(is_local as u8, index);
        }
    }

    // ---------------------------------------------------------- statements

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block_contents();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block_contents(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
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
        let loop_start = self.chunk().len();
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
            // no initializer
        } else if self.matches(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
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
        if self.current_ctx().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_ctx().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // --------------------------------------------------------- expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule::<'src, 'heap>(self.previous.kind).prefix;
        let prefix = match prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule::<'src, 'heap>(self.current.kind).precedence {
            self.advance();
            let infix = get_rule::<'src, 'heap>(self.previous.kind).infix;
            if let Some(infix) = infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap.intern_string(text);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() called for a non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary() called for a non-unary operator"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = get_rule::<'src, 'heap>(operator);
        // `**` is right-associative: recurse at the same precedence rather
        // than the next one up (spec §4.3/§9).
        let next_precedence = if operator == TokenKind::StarStar {
            rule.precedence
        } else {
            rule.precedence.next()
        };
        self.parse_precedence(next_precedence);

        match operator {
            TokenKind::BangEqual => self.emit_bytes(OpCode::Equal as u8, OpCode::Not as u8),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_bytes(OpCode::Less as u8, OpCode::Not as u8),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_bytes(OpCode::Greater as u8, OpCode::Not as u8),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::SlashSlash => self.emit_op(OpCode::IntDivide),
            TokenKind::StarStar => self.emit_op(OpCode::Pow),
            _ => unreachable!("binary() called for a non-binary operator"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
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
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, constant);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, constant);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable_inner("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);

        self.variable_inner("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.variable_inner("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, constant);
            self.emit_byte(arg_count);
        } else {
            self.variable_inner("super", false);
            self.emit_op_byte(OpCode::GetSuper, constant);
        }
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function_body(FunctionKind::Lambda, "lambda".to_string());
    }

    // ----------------------------------------------------------- variables

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        self.variable_inner(name, can_assign);
    }

    /// `named_variable` is generic over `'src`-borrowed names (the common
    /// path) and owned `String`s built up for synthetic lookups (`this`,
    /// `super`, and recursive self-references in class bodies).
    fn variable_inner(&mut self, name: &str, can_assign: bool) {
        let ctx_idx = self.contexts.len() - 1;
        let local_slot = resolve_local(&self.contexts[ctx_idx], name);

        let (get_op, set_op, self_base, arg) = if let Some(slot) = local_slot {
            if self.contexts[ctx_idx].locals[slot as usize].depth == -1 {
                self.error("Can't read local variable in its own initializer.");
            }
            (
                OpCode::GetLocal,
                OpCode::SetLocal,
                SelfOpBase::Local,
                slot,
            )
        } else if let Some(slot) = resolve_upvalue(&mut self.contexts, ctx_idx, name) {
            (
                OpCode::GetUpvalue,
                OpCode::SetUpvalue,
                SelfOpBase::Upvalue,
                slot,
            )
        } else {
            let arg = self.identifier_constant(name);
            (
                OpCode::GetGlobal,
                OpCode::SetGlobal,
                SelfOpBase::Global,
                arg,
            )
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.matches_compound() {
            let op = self.previous_compound_op();
            self.expression();
            self.emit_op_byte(self_opcode(self_base, op), arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn named_variable_by_name(&mut self, name: &str, can_assign: bool) {
        self.variable_inner(name, can_assign);
    }

    fn matches_compound(&mut self) -> bool {
        for kind in [
            TokenKind::PlusEqual,
            TokenKind::MinusEqual,
            TokenKind::StarEqual,
            TokenKind::SlashEqual,
            TokenKind::StarStarEqual,
            TokenKind::SlashSlashEqual,
        ] {
            if self.matches(kind) {
                return true;
            }
        }
        false
    }

    fn previous_compound_op(&self) -> SelfOp {
        match self.previous.kind {
            TokenKind::PlusEqual => SelfOp::Add,
            TokenKind::MinusEqual => SelfOp::Sub,
            TokenKind::StarEqual => SelfOp::Mul,
            TokenKind::SlashEqual => SelfOp::Div,
            TokenKind::StarStarEqual => SelfOp::Pow,
            TokenKind::SlashSlashEqual => SelfOp::IntDiv,
            _ => unreachable!("matches_compound() guards this"),
        }
    }

}

#[derive(Clone, Copy)]
enum SelfOpBase {
    Local,
    Global,
    Upvalue,
}

fn self_opcode(base: SelfOpBase, op: SelfOp) -> OpCode {
    use OpCode::*;
    match (base, op) {
        (SelfOpBase::Local, SelfOp::Add) => AddSelfLocal,
        (SelfOpBase::Local, SelfOp::Sub) => SubSelfLocal,
        (SelfOpBase::Local, SelfOp::Mul) => MulSelfLocal,
        (SelfOpBase::Local, SelfOp::Div) => DivSelfLocal,
        (SelfOpBase::Local, SelfOp::Pow) => PowSelfLocal,
        (SelfOpBase::Local, SelfOp::IntDiv) => IntDivSelfLocal,
        (SelfOpBase::Global, SelfOp::Add) => AddSelfGlobal,
        (SelfOpBase::Global, SelfOp::Sub) => SubSelfGlobal,
        (SelfOpBase::Global, SelfOp::Mul) => MulSelfGlobal,
        (SelfOpBase::Global, SelfOp::Div) => DivSelfGlobal,
        (SelfOpBase::Global, SelfOp::Pow) => PowSelfGlobal,
        (SelfOpBase::Global, SelfOp::IntDiv) => IntDivSelfGlobal,
        (SelfOpBase::Upvalue, SelfOp::Add) => AddSelfUpvalue,
        (SelfOpBase::Upvalue, SelfOp::Sub) => SubSelfUpvalue,
        (SelfOpBase::Upvalue, SelfOp::Mul) => MulSelfUpvalue,
        (SelfOpBase::Upvalue, SelfOp::Div) => DivSelfUpvalue,
        (SelfOpBase::Upvalue, SelfOp::Pow) => PowSelfUpvalue,
        (SelfOpBase::Upvalue, SelfOp::IntDiv) => IntDivSelfUpvalue,
    }
}

/// Scans `ctx`'s locals top-down for `name`. Returns the slot index.
fn resolve_local(ctx: &FuncCtx<'_>, name: &str) -> Option<u8> {
    for (i, local) in ctx.locals.iter().enumerate().rev() {
        if local.name == name {
            return Some(i as u8);
        }
    }
    None
}

/// Recursively resolves `name` as an upvalue of `contexts[idx]`, registering
/// a chain of upvalue descriptors through every intervening context (spec
/// §4.3 "Scope resolution" step 2). Indexes rather than borrows the stack so
/// the recursive call doesn't fight the borrow checker.
fn resolve_upvalue(contexts: &mut [FuncCtx<'_>], idx: usize, name: &str) -> Option<u8> {
    if idx == 0 {
        return None;
    }
    let parent = idx - 1;
    if let Some(local) = resolve_local(&contexts[parent], name) {
        contexts[parent].locals[local as usize].is_captured = true;
        return Some(add_upvalue(contexts, idx, local, true));
    }
    if let Some(upvalue) = resolve_upvalue(contexts, parent, name) {
        return Some(add_upvalue(contexts, idx, upvalue, false));
    }
    None
}

fn add_upvalue(contexts: &mut [FuncCtx<'_>], idx: usize, index: u8, is_local: bool) -> u8 {
    let ctx = &mut contexts[idx];
    for (i, existing) in ctx.upvalues.iter().enumerate() {
        if existing.index == index && existing.is_local == is_local {
            return i as u8;
        }
    }
    ctx.upvalues.push(UpvalueSlot { index, is_local });
    (ctx.upvalues.len() - 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use loxi_core::Heap;

    fn compiles(source: &str) -> Result<ObjRef, Vec<CompileError>> {
        let mut heap = Heap::new();
        compile(source, &mut heap)
    }

    #[test]
    fn compiles_a_trivial_expression_statement() {
        let mut heap = Heap::new();
        let result = compile("1 + 2;", &mut heap);
        assert!(result.is_ok());
    }

    #[test]
    fn reports_invalid_assignment_target() {
        let mut heap = Heap::new();
        let result = compile("1 + 2 = 3;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn reports_return_outside_function() {
        let mut heap = Heap::new();
        let result = compile("return 1;", &mut heap);
        let errs = result.unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("top-level")));
    }

    #[test]
    fn reports_shadowed_local_redeclaration() {
        let mut heap = Heap::new();
        let result = compile("{ let a = 1; let a = 2; }", &mut heap);
        let errs = result.unwrap_err();
        assert!(errs
            .iter()
            .any(|e| e.message.contains("Already a variable")));
    }

    #[test]
    fn compiles_closures_and_classes() {
        assert!(compiles(
            "fn make() { let x = 1; fn inner() { return x; } return inner; }"
        )
        .is_ok());
        assert!(compiles("class A { init() { this.x = 1; } } let a = A();").is_ok());
        assert!(compiles(
            "class A { greet() { return 1; } }\nclass B : A { greet() { return super.greet(); } }"
        )
        .is_ok());
    }

    #[test]
    fn compiles_compound_assignment_forms() {
        assert!(compiles("let a = 1; a += 2; a **= 3;").is_ok());
        assert!(compiles("let a = 1; fn f() { a += 1; }").is_ok());
    }

    #[test]
    fn recovers_after_a_parse_error_and_keeps_scanning() {
        let mut heap = Heap::new();
        let result = compile("let ; let b = 1;", &mut heap);
        assert!(result.is_err());
    }
}
