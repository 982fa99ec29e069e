//! Recursive-descent parser
//!
//! Builds an [`ast::Program`](crate::ast::Program) from the token stream.
//! Directive comments are attached while parsing: the directives written
//! directly above a struct, field, function or statement belong to it, and
//! a directive trailing on the same line as the end of a statement belongs
//! to that statement.

use crate::ast::*;
use crate::error::{CheckError, Result};
use crate::lexer::Token;


const STACK_RED_ZONE: usize = 64 * 1024;
const STACK_GROW_SIZE: usize = 2 * 1024 * 1024;

/// Parse tokens into AST
pub fn parse(_filename: &str, source: &str, tokens: Vec<(Token, Span)>) -> Result<Program> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        lines: LineIndex::new(source),
        eof: Span::new(source.len(), source.len()),
        no_struct_lit: false,
    };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    lines: LineIndex,
    eof: Span,
    /// Set while parsing `if`/`while` conditions, where `x {` opens the body
    no_struct_lit: bool,
}

impl Parser {
    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(self.eof)
    }

    fn prev_span(&self) -> Span {
        match self.pos.checked_sub(1) {
            Some(i) => self.tokens[i].1,
            None => Span::new(0, 0),
        }
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn bump(&mut self) -> Option<(Token, Span)> {
        let next = self.tokens.get(self.pos).cloned();
        if next.is_some() {
            self.pos += 1;
        }
        next
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&self, expected: &str) -> CheckError {
        match self.peek() {
            Some(tok) => CheckError::parser(format!("expected {expected}, found {tok}"), self.peek_span()),
            None => CheckError::parser(format!("expected {expected}, found end of file"), self.eof),
        }
    }

    fn expect(&mut self, token: &Token) -> Result<Span> {
        if self.at(token) {
            let span = self.peek_span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.error_here(&token.to_string()))
        }
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let node = Spanned::new(name.clone(), self.peek_span());
                self.pos += 1;
                Ok(node)
            }
            _ => Err(self.error_here("identifier")),
        }
    }

    /// Consume consecutive directive comments
    fn directives(&mut self) -> Vec<Spanned<Directive>> {
        let mut out = Vec::new();
        while let Some(Token::Directive(text)) = self.peek() {
            out.push(Spanned::new(Directive { text: text.clone() }, self.peek_span()));
            self.pos += 1;
        }
        out
    }

    /// Consume directives that sit on the same line as the end of `span`
    fn trailing_directives(&mut self, span: Span, into: &mut Vec<Spanned<Directive>>) {
        let end_line = self.lines.line(span.end.saturating_sub(1));
        while let Some(Token::Directive(text)) = self.peek() {
            let dir_span = self.peek_span();
            if self.lines.line(dir_span.start) != end_line {
                break;
            }
            into.push(Spanned::new(Directive { text: text.clone() }, dir_span));
            self.pos += 1;
        }
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Program> {
        let mut items = Vec::new();
        loop {
            let directives = self.directives();
            match self.peek() {
                // Directives after the last item annotate nothing
                None => break,
                Some(Token::Struct) => items.push(Item::StructDef(self.parse_struct(directives)?)),
                Some(Token::Fn) => items.push(Item::FnDef(self.parse_fn(directives)?)),
                Some(_) => return Err(self.error_here("`struct` or `fn`")),
            }
        }
        Ok(Program { items })
    }

    fn parse_struct(&mut self, directives: Vec<Spanned<Directive>>) -> Result<StructDef> {
        let start = self.expect(&Token::Struct)?;
        let name = self.expect_ident()?;
        let type_params = self.parse_type_params()?;
        self.expect(&Token::LBrace)?;

        let mut fields = Vec::new();
        loop {
            let field_directives = self.directives();
            if self.at(&Token::RBrace) {
                break;
            }
            let field_name = self.expect_ident()?;
            self.expect(&Token::Colon)?;
            let ty = self.parse_type()?;
            fields.push(StructField {
                directives: field_directives,
                name: field_name,
                ty,
            });
            if !self.eat(&Token::Comma) {
                // Allow a trailing directive-only line before `}`
                self.directives();
                break;
            }
        }
        let end = self.expect(&Token::RBrace)?;

        Ok(StructDef {
            directives,
            name,
            type_params,
            fields,
            span: start.merge(end),
        })
    }

    fn parse_type_params(&mut self) -> Result<Vec<Spanned<String>>> {
        let mut params = Vec::new();
        if self.eat(&Token::LBracket) {
            loop {
                params.push(self.expect_ident()?);
                // Go-style constraint: `[T any]`
                if let Some(Token::Ident(_)) = self.peek() {
                    self.pos += 1;
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RBracket)?;
        }
        Ok(params)
    }

    fn parse_type(&mut self) -> Result<Spanned<Type>> {
        if self.at(&Token::Star) {
            let start = self.expect(&Token::Star)?;
            let inner = self.parse_type()?;
            let span = start.merge(inner.span);
            return Ok(Spanned::new(Type::Ptr(Box::new(inner.node)), span));
        }

        let first = self.expect_ident()?;
        let mut name = first.node;
        let mut span = first.span;
        while self.eat(&Token::Dot) {
            let part = self.expect_ident()?;
            name.push('.');
            name.push_str(&part.node);
            span = span.merge(part.span);
        }

        let mut args = Vec::new();
        if self.eat(&Token::LBracket) {
            loop {
                args.push(self.parse_type()?.node);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            span = span.merge(self.expect(&Token::RBracket)?);
        }

        Ok(Spanned::new(Type::Named { name, args }, span))
    }

    fn parse_param(&mut self) -> Result<Param> {
        let name = self.expect_ident()?;
        self.expect(&Token::Colon)?;
        let ty = self.parse_type()?;
        Ok(Param { name, ty })
    }

    fn parse_fn(&mut self, directives: Vec<Spanned<Directive>>) -> Result<FnDef> {
        let start = self.expect(&Token::Fn)?;

        let receiver = if self.eat(&Token::LParen) {
            let recv = self.parse_param()?;
            self.expect(&Token::RParen)?;
            Some(recv)
        } else {
            None
        };

        let name = self.expect_ident()?;
        let type_params = self.parse_type_params()?;

        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.at(&Token::RParen) {
            loop {
                params.push(self.parse_param()?);
                if !self.eat(&Token::Comma) || self.at(&Token::RParen) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        let ret_ty = if self.eat(&Token::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.parse_block()?;
        let span = start.merge(body.span);

        Ok(FnDef {
            directives,
            receiver,
            name,
            type_params,
            params,
            ret_ty,
            body,
            span,
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Block> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.parse_block_inner())
    }

    fn parse_block_inner(&mut self) -> Result<Block> {
        let start = self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        loop {
            let directives = self.directives();
            if self.at(&Token::RBrace) || self.peek().is_none() {
                break;
            }
            stmts.push(self.parse_stmt(directives)?);
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Block {
            stmts,
            span: start.merge(end),
        })
    }

    fn parse_stmt(&mut self, directives: Vec<Spanned<Directive>>) -> Result<Stmt> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.parse_stmt_inner(directives))
    }

    fn parse_stmt_inner(&mut self, mut directives: Vec<Spanned<Directive>>) -> Result<Stmt> {
        let start = self.peek_span();
        let kind = match self.peek() {
            Some(Token::Let) => {
                self.bump();
                let name = self.expect_ident()?;
                let ty = if self.eat(&Token::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                self.expect(&Token::Eq)?;
                let value = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                StmtKind::Let { name, ty, value }
            }
            Some(Token::If) => self.parse_if()?,
            Some(Token::While) => {
                self.bump();
                let cond = self.parse_cond()?;
                let body = self.parse_block()?;
                StmtKind::While { cond, body }
            }
            Some(Token::Loop) => {
                self.bump();
                let body = self.parse_block()?;
                StmtKind::Loop { body }
            }
            Some(Token::Break) => {
                self.bump();
                self.expect(&Token::Semi)?;
                StmtKind::Break
            }
            Some(Token::Continue) => {
                self.bump();
                self.expect(&Token::Semi)?;
                StmtKind::Continue
            }
            Some(Token::Return) => {
                self.bump();
                let value = if self.at(&Token::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semi)?;
                StmtKind::Return(value)
            }
            Some(Token::Defer) => {
                self.bump();
                let call = self.parse_expr()?;
                if !matches!(call.node, Expr::Call { .. }) {
                    return Err(CheckError::parser("defer requires a function call", call.span));
                }
                self.expect(&Token::Semi)?;
                StmtKind::Defer(call)
            }
            Some(_) => {
                let expr = self.parse_expr()?;
                if self.eat(&Token::Eq) {
                    if expr.node.as_path().is_none() {
                        return Err(CheckError::parser("invalid assignment target", expr.span));
                    }
                    let value = self.parse_expr()?;
                    self.expect(&Token::Semi)?;
                    StmtKind::Assign { target: expr, value }
                } else {
                    self.expect(&Token::Semi)?;
                    StmtKind::Expr(expr)
                }
            }
            None => return Err(self.error_here("statement")),
        };

        let span = start.merge(self.prev_span());
        self.trailing_directives(span, &mut directives);
        Ok(Stmt { directives, kind, span })
    }

    fn parse_if(&mut self) -> Result<StmtKind> {
        self.expect(&Token::If)?;
        let cond = self.parse_cond()?;
        let then_block = self.parse_block()?;
        let else_block = if self.eat(&Token::Else) {
            if self.at(&Token::If) {
                // `else if` desugars to an else block holding one `if`
                let start = self.peek_span();
                let kind = self.parse_if()?;
                let span = start.merge(self.prev_span());
                Some(Block {
                    stmts: vec![Stmt {
                        directives: Vec::new(),
                        kind,
                        span,
                    }],
                    span,
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(StmtKind::If {
            cond,
            then_block,
            else_block,
        })
    }

    fn parse_cond(&mut self) -> Result<Spanned<Expr>> {
        let saved = std::mem::replace(&mut self.no_struct_lit, true);
        let cond = self.parse_expr();
        self.no_struct_lit = saved;
        cond
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Spanned<Expr>> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.parse_binary(1))
    }

    fn binop(&self) -> Option<(BinOp, u8)> {
        let op = match self.peek()? {
            Token::PipePipe => (BinOp::Or, 1),
            Token::AmpAmp => (BinOp::And, 2),
            Token::EqEq => (BinOp::Eq, 3),
            Token::NotEq => (BinOp::Ne, 3),
            Token::Lt => (BinOp::Lt, 3),
            Token::Gt => (BinOp::Gt, 3),
            Token::LtEq => (BinOp::Le, 3),
            Token::GtEq => (BinOp::Ge, 3),
            Token::Plus => (BinOp::Add, 4),
            Token::Minus => (BinOp::Sub, 4),
            Token::Star => (BinOp::Mul, 5),
            Token::Slash => (BinOp::Div, 5),
            Token::Percent => (BinOp::Mod, 5),
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Spanned<Expr>> {
        let mut left = self.parse_unary()?;
        while let Some((op, prec)) = self.binop() {
            if prec < min_prec {
                break;
            }
            self.bump();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span.merge(right.span);
            left = Spanned::new(
                Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Spanned<Expr>> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Ampersand) => {
                self.bump();
                let inner = self.parse_unary()?;
                let span = start.merge(inner.span);
                Ok(Spanned::new(Expr::AddrOf(Box::new(inner)), span))
            }
            Some(Token::Bang) | Some(Token::Minus) => {
                let op = if self.at(&Token::Bang) { UnOp::Not } else { UnOp::Neg };
                self.bump();
                let inner = self.parse_unary()?;
                let span = start.merge(inner.span);
                Ok(Spanned::new(
                    Expr::Unary {
                        op,
                        expr: Box::new(inner),
                    },
                    span,
                ))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Spanned<Expr>> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let field = self.expect_ident()?;
                let span = expr.span.merge(field.span);
                expr = Spanned::new(
                    Expr::Field {
                        expr: Box::new(expr),
                        field,
                    },
                    span,
                );
            } else if self.at(&Token::LParen) {
                let args = self.parse_args()?;
                let span = expr.span.merge(self.prev_span());
                expr = Spanned::new(
                    Expr::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Spanned<Expr>>> {
        self.expect(&Token::LParen)?;
        // Arguments are never conditions, even inside one
        let saved = std::mem::replace(&mut self.no_struct_lit, false);
        let args = self.parse_arg_list();
        self.no_struct_lit = saved;
        let args = args?;
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_arg_list(&mut self) -> Result<Vec<Spanned<Expr>>> {
        let mut args = Vec::new();
        if !self.at(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) || self.at(&Token::RParen) {
                    break;
                }
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Spanned<Expr>> {
        let Some((token, span)) = self.bump() else {
            return Err(self.error_here("expression"));
        };
        let expr = match token {
            Token::IntLit(n) => Expr::IntLit(n),
            Token::StringLit(s) => Expr::StringLit(s),
            Token::True => Expr::BoolLit(true),
            Token::False => Expr::BoolLit(false),
            Token::Nil => Expr::Nil,
            Token::LParen => {
                let inner = self.parse_expr()?;
                let end = self.expect(&Token::RParen)?;
                return Ok(Spanned::new(inner.node, span.merge(end)));
            }
            Token::Ident(name) if self.at(&Token::LBrace) && !self.no_struct_lit => {
                return self.parse_struct_lit(name, span);
            }
            Token::Ident(name) => Expr::Var(name),
            _ => {
                self.pos -= 1;
                return Err(self.error_here("expression"));
            }
        };
        Ok(Spanned::new(expr, span))
    }

    fn parse_struct_lit(&mut self, name: String, start: Span) -> Result<Spanned<Expr>> {
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.at(&Token::RBrace) {
            let field = self.expect_ident()?;
            self.expect(&Token::Colon)?;
            let value = self.parse_expr()?;
            fields.push((field, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Spanned::new(Expr::StructLit { name, fields }, start.merge(end)))
    }
}
