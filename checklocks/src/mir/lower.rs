//! AST to MIR lowering
//!
//! This module handles:
//! - Flattening nested expressions into access and call instructions
//! - Converting structured control flow into basic blocks
//! - Recognizing atomic operations (`atomic.StoreInt32(&p.f, v)`)
//! - Placing statement-level force directives and replaying `defer`red
//!   calls before every return
//! - Giving every `let` that shadows an earlier name a fresh MIR name
//!   (`pr#1`), so later stages can keep one flat binding table

use std::collections::{HashMap, HashSet};

use crate::ast::{Block, Expr, FnDef, Span, Spanned, Stmt, StmtKind};
use crate::config::Config;
use crate::contract::{DirectiveKind, FnKey, parse_directive};
use crate::diagnostics::Diagnostic;

use super::{AccessKind, BasicBlock, BindInit, BlockId, Callee, MirFunction, MirInst, SHADOW_MARK, Terminator};

const STACK_RED_ZONE: usize = 64 * 1024;
const STACK_GROW_SIZE: usize = 1024 * 1024;

/// Targets of `break` and `continue` inside the innermost loop
struct LoopTargets {
    header: BlockId,
    exit: BlockId,
}

struct LoweringContext<'a> {
    config: &'a Config,
    blocks: Vec<BasicBlock>,
    current: BlockId,
    /// Lexical scopes, innermost last: source name to MIR name
    scopes: Vec<HashMap<String, String>>,
    /// Every MIR name handed out so far
    taken: HashSet<String>,
    loops: Vec<LoopTargets>,
    /// Calls registered by top-level `defer`, in registration order
    deferred: Vec<MirInst>,
    /// Block nesting depth; 0 is the function body
    depth: usize,
    diagnostics: Vec<Diagnostic>,
}

/// Lower one function body. Statement-level configuration errors (bad force
/// directives, nested `defer`, stray `break`) are returned alongside.
pub fn lower_function(def: &FnDef, config: &Config) -> (MirFunction, Vec<Diagnostic>) {
    let mut ctx = LoweringContext {
        config,
        blocks: Vec::new(),
        current: BlockId(0),
        scopes: vec![HashMap::new()],
        taken: HashSet::new(),
        loops: Vec::new(),
        deferred: Vec::new(),
        depth: 0,
        diagnostics: Vec::new(),
    };
    ctx.current = ctx.new_block();

    let receiver = def
        .receiver
        .as_ref()
        .map(|r| (ctx.declare(&r.name.node), r.ty.node.clone()));
    let params: Vec<(String, _)> = def
        .params
        .iter()
        .map(|p| (ctx.declare(&p.name.node), p.ty.node.clone()))
        .collect();

    ctx.lower_stmts(&def.body.stmts);

    // Falling off the end returns at the closing brace
    let close = Span::new(def.body.span.end.saturating_sub(1), def.body.span.end);
    ctx.emit_deferred();
    ctx.terminate(Terminator::Return { span: close });

    let func = MirFunction {
        key: FnKey::of(def),
        receiver,
        params,
        blocks: ctx.blocks,
        span: def.span,
    };
    (func, ctx.diagnostics)
}

impl LoweringContext<'_> {
    // ========================================================================
    // Block management
    // ========================================================================

    fn new_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock {
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        BlockId(self.blocks.len() - 1)
    }

    fn push(&mut self, inst: MirInst) {
        self.blocks[self.current.0].instructions.push(inst);
    }

    fn terminate(&mut self, terminator: Terminator) {
        self.blocks[self.current.0].terminator = terminator;
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Code after `return`/`break`/`continue` lands in a block with no
    /// predecessors
    fn start_dead_block(&mut self) {
        let dead = self.new_block();
        self.switch_to(dead);
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::configuration(span, message.into()));
    }

    // ========================================================================
    // Names
    // ========================================================================

    /// Bind `name` in the innermost scope, renaming it when the MIR name is
    /// already taken anywhere in the function
    fn declare(&mut self, name: &str) -> String {
        let mut mir_name = name.to_string();
        let mut n = 0;
        while self.taken.contains(&mir_name) {
            n += 1;
            mir_name = format!("{name}{SHADOW_MARK}{n}");
        }
        self.taken.insert(mir_name.clone());
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), mir_name.clone());
        }
        mir_name
    }

    /// MIR name of a source name in scope
    fn lookup(&self, name: &str) -> Option<&str> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name)).map(String::as_str)
    }

    /// Place path of `expr`, its base renamed to the binding in scope.
    /// Unbound bases (package names) are kept as written.
    fn place(&self, expr: &Expr) -> Option<Vec<String>> {
        let mut path = expr.as_path()?;
        if let Some(base) = path.first_mut()
            && let Some(name) = self.lookup(base)
        {
            *base = name.to_string();
        }
        Some(path)
    }

    fn emit_deferred(&mut self) {
        let replay: Vec<MirInst> = self.deferred.iter().rev().cloned().collect();
        for inst in replay {
            self.push(inst);
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn lower_block(&mut self, block: &Block) {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.depth += 1;
            self.scopes.push(HashMap::new());
            self.lower_stmts(&block.stmts);
            self.scopes.pop();
            self.depth -= 1;
        })
    }

    fn lower_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.lower_stmt(stmt);
        }
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        self.lower_stmt_directives(stmt);

        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                self.lower_expr(value);
                // The initializer sees the bindings from before this `let`
                let init = match &value.node {
                    Expr::AddrOf(inner) => self.place(&inner.node).map_or(BindInit::Opaque, BindInit::Ref),
                    Expr::StructLit { name, .. } => BindInit::Struct(name.clone()),
                    Expr::Call { callee, .. } => self.call_target(callee).map_or(BindInit::Opaque, BindInit::Call),
                    other => self.place(other).map_or(BindInit::Opaque, BindInit::Place),
                };
                let name = self.declare(&name.node);
                self.push(MirInst::Bind {
                    name,
                    ty: ty.as_ref().map(|t| t.node.clone()),
                    init,
                });
            }

            StmtKind::Assign { target, value } => {
                self.lower_expr(value);
                if let Some(place) = self.place(&target.node)
                    && place.first().is_some_and(|base| base != "_")
                {
                    self.push(MirInst::Access {
                        place,
                        kind: AccessKind::Write,
                        atomic: false,
                        span: target.span,
                    });
                }
            }

            StmtKind::Expr(expr) => self.lower_expr(expr),

            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.lower_expr(cond);
                let then_bb = self.new_block();
                let join_bb = self.new_block();
                let else_bb = if else_block.is_some() { self.new_block() } else { join_bb };
                self.terminate(Terminator::Branch {
                    then_block: then_bb,
                    else_block: else_bb,
                });

                self.switch_to(then_bb);
                self.lower_block(then_block);
                self.terminate(Terminator::Goto(join_bb));

                if let Some(else_block) = else_block {
                    self.switch_to(else_bb);
                    self.lower_block(else_block);
                    self.terminate(Terminator::Goto(join_bb));
                }

                self.switch_to(join_bb);
            }

            StmtKind::While { cond, body } => {
                let header = self.new_block();
                let body_bb = self.new_block();
                let exit = self.new_block();
                self.terminate(Terminator::Goto(header));

                self.switch_to(header);
                self.lower_expr(cond);
                self.terminate(Terminator::Branch {
                    then_block: body_bb,
                    else_block: exit,
                });

                self.switch_to(body_bb);
                self.loops.push(LoopTargets { header, exit });
                self.lower_block(body);
                self.loops.pop();
                self.terminate(Terminator::Goto(header));

                self.switch_to(exit);
            }

            StmtKind::Loop { body } => {
                let header = self.new_block();
                let exit = self.new_block();
                self.terminate(Terminator::Goto(header));

                self.switch_to(header);
                self.loops.push(LoopTargets { header, exit });
                self.lower_block(body);
                self.loops.pop();
                self.terminate(Terminator::Goto(header));

                // Reachable only through `break`
                self.switch_to(exit);
            }

            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                match self.loops.last() {
                    Some(targets) => {
                        let target = if is_break { targets.exit } else { targets.header };
                        self.terminate(Terminator::Goto(target));
                    }
                    None => {
                        let word = if is_break { "break" } else { "continue" };
                        self.error(stmt.span, format!("`{word}` outside of a loop"));
                        self.terminate(Terminator::Unreachable);
                    }
                }
                self.start_dead_block();
            }

            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.lower_expr(value);
                }
                self.emit_deferred();
                self.terminate(Terminator::Return { span: stmt.span });
                self.start_dead_block();
            }

            StmtKind::Defer(call) => {
                if self.depth > 0 {
                    self.error(stmt.span, "`defer` is only supported at function top level");
                    return;
                }
                if let Expr::Call { callee, args } = &call.node
                    && let Some(inst) = self.lower_call(callee, args, call.span)
                {
                    self.deferred.push(inst);
                }
            }
        }
    }

    /// Force directives take effect before the statement they annotate.
    /// Expectation markers are left to the reporter.
    fn lower_stmt_directives(&mut self, stmt: &Stmt) {
        for directive in &stmt.directives {
            match parse_directive(&directive.node.text) {
                None | Some(Ok(DirectiveKind::Fail(_))) => {}
                Some(Ok(DirectiveKind::Force(lock))) => {
                    let base = lock
                        .trim()
                        .split('.')
                        .next()
                        .and_then(|base| self.lookup(base).filter(|name| *name != base))
                        .map(str::to_string);
                    self.push(MirInst::Force {
                        lock,
                        base,
                        span: directive.span,
                    });
                }
                Some(Ok(other)) => {
                    self.error(directive.span, format!("`{}` cannot annotate a statement", other.name()));
                }
                Some(Err(message)) => self.error(directive.span, message),
            }
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn lower_expr(&mut self, expr: &Spanned<Expr>) {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.lower_expr_inner(expr))
    }

    fn lower_expr_inner(&mut self, expr: &Spanned<Expr>) {
        match &expr.node {
            Expr::IntLit(_) | Expr::StringLit(_) | Expr::BoolLit(_) | Expr::Nil | Expr::Var(_) => {}

            Expr::Field { expr: base, .. } => match self.place(&expr.node) {
                Some(place) => self.push(MirInst::Access {
                    place,
                    kind: AccessKind::Read,
                    atomic: false,
                    span: expr.span,
                }),
                None => self.lower_expr(base),
            },

            Expr::Call { callee, args } => {
                if let Some(inst) = self.lower_call(callee, args, expr.span) {
                    self.push(inst);
                }
            }

            Expr::AddrOf(inner) => self.lower_expr(inner),

            Expr::Binary { left, right, .. } => {
                self.lower_expr(left);
                self.lower_expr(right);
            }

            Expr::Unary { expr: inner, .. } => self.lower_expr(inner),

            Expr::StructLit { fields, .. } => {
                for (_, value) in fields {
                    self.lower_expr(value);
                }
            }
        }
    }

    /// Lower the argument and receiver evaluation of a call, returning the
    /// instruction for the call itself. The caller decides whether it runs
    /// now or is deferred.
    fn lower_call(&mut self, callee: &Spanned<Expr>, args: &[Spanned<Expr>], span: Span) -> Option<MirInst> {
        if let Some(access) = self.lower_atomic_call(callee, args, span) {
            return Some(access);
        }

        for arg in args {
            self.lower_expr(arg);
        }
        let arg_places: Vec<Option<Vec<String>>> = args
            .iter()
            .map(|arg| match &arg.node {
                Expr::AddrOf(inner) => self.place(&inner.node),
                other => self.place(other),
            })
            .collect();

        let Some(target) = self.call_target(callee) else {
            match &callee.node {
                Expr::Field { expr: receiver, .. } => self.lower_expr(receiver),
                _ => self.lower_expr(callee),
            }
            return None;
        };
        if let (Callee::Method { receiver, .. }, Expr::Field { expr: receiver_expr, .. }) = (&target, &callee.node)
            && receiver.len() > 1
        {
            self.push(MirInst::Access {
                place: receiver.clone(),
                kind: AccessKind::Read,
                atomic: false,
                span: receiver_expr.span,
            });
        }
        Some(MirInst::Call {
            callee: target,
            args: arg_places,
            span,
        })
    }

    /// What a call expression calls: a named function, or a method on a place
    fn call_target(&self, callee: &Spanned<Expr>) -> Option<Callee> {
        match &callee.node {
            Expr::Var(name) => Some(Callee::Function(name.clone())),
            Expr::Field { expr: receiver, field } => Some(Callee::Method {
                receiver: self.place(&receiver.node)?,
                name: field.node.clone(),
            }),
            _ => None,
        }
    }

    /// `atomic.<Op>(&place, ..)` where `atomic` is the configured package
    /// and not shadowed by a local
    fn lower_atomic_call(&mut self, callee: &Spanned<Expr>, args: &[Spanned<Expr>], span: Span) -> Option<MirInst> {
        let Expr::Field { expr: package, field: op } = &callee.node else {
            return None;
        };
        let Expr::Var(package) = &package.node else {
            return None;
        };
        if self.lookup(package).is_some() {
            return None;
        }
        let kind = self.config.atomic_op(package, &op.node)?;
        let (first, rest) = args.split_first()?;
        let Expr::AddrOf(target) = &first.node else {
            return None;
        };
        let place = self.place(&target.node)?;

        for arg in rest {
            self.lower_expr(arg);
        }
        Some(MirInst::Access {
            place,
            kind,
            atomic: true,
            span,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RuleKind;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn lower(source: &str) -> (MirFunction, Vec<Diagnostic>) {
        let program = parse("test.ck", source, tokenize(source).unwrap()).unwrap();
        let def = program.functions().next().unwrap();
        lower_function(def, &Config::default())
    }

    fn insts(func: &MirFunction, block: usize) -> &[MirInst] {
        &func.blocks[block].instructions
    }

    fn accesses(func: &MirFunction) -> Vec<(String, AccessKind, bool)> {
        func.blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter_map(|inst| match inst {
                MirInst::Access { place, kind, atomic, .. } => Some((place.join("."), *kind, *atomic)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_straight_line() {
        let (func, diags) = lower("fn (pr: *R) f(v: int) { pr.mu.Lock(); pr.value = v; pr.mu.Unlock(); }");
        assert!(diags.is_empty());
        assert_eq!(func.blocks.len(), 1);
        let body = insts(&func, 0);
        assert_eq!(body.len(), 5);
        assert!(matches!(
            &body[1],
            MirInst::Call { callee: Callee::Method { receiver, name }, .. } if receiver.join(".") == "pr.mu" && name == "Lock"
        ));
        assert!(matches!(&body[2], MirInst::Access { kind: AccessKind::Write, .. }));
        assert!(matches!(func.blocks[0].terminator, Terminator::Return { .. }));
    }

    #[test]
    fn test_atomic_call_is_atomic_access() {
        let (func, _) = lower(
            "fn (pr: *R) f() -> int32 {
                atomic.StoreInt32(&pr.mixedValue, 1);
                return atomic.LoadInt32(&pr.atomicValue);
            }",
        );
        assert_eq!(
            accesses(&func),
            vec![
                ("pr.mixedValue".to_string(), AccessKind::Write, true),
                ("pr.atomicValue".to_string(), AccessKind::Read, true),
            ]
        );
    }

    #[test]
    fn test_shadowed_atomic_package_is_plain_call() {
        let (func, _) = lower("fn f(atomic: *Counter, pr: *R) { atomic.StoreInt32(&pr.value, 1); }");
        assert!(
            accesses(&func)
                .iter()
                .all(|(_, _, atomic)| !atomic)
        );
    }

    #[test]
    fn test_if_else_shape() {
        let (func, _) = lower("fn f(c: bool, pr: *R) { if c { pr.a = 1; } else { pr.b = 2; } pr.c = 3; }");
        let Terminator::Branch { then_block, else_block } = func.blocks[0].terminator else {
            panic!("Expected Branch");
        };
        let Terminator::Goto(join) = func.blocks[then_block.0].terminator else {
            panic!("Expected Goto");
        };
        assert_eq!(func.blocks[else_block.0].terminator, Terminator::Goto(join));
        assert!(matches!(func.blocks[join.0].terminator, Terminator::Return { .. }));
    }

    #[test]
    fn test_while_loops_back_to_header() {
        let (func, _) = lower("fn f(c: bool) { while c { c = false; } }");
        let Terminator::Goto(header) = func.blocks[0].terminator else {
            panic!("Expected Goto");
        };
        let Terminator::Branch { then_block, .. } = func.blocks[header.0].terminator else {
            panic!("Expected Branch");
        };
        assert_eq!(func.blocks[then_block.0].terminator, Terminator::Goto(header));
    }

    #[test]
    fn test_code_after_return_is_unreachable() {
        let (func, _) = lower("fn (pr: *R) f() { return; pr.value = 1; }");
        let reachable = func.reachable();
        let dead = func
            .blocks
            .iter()
            .position(|b| b.instructions.iter().any(|i| matches!(i, MirInst::Access { .. })))
            .unwrap();
        assert!(!reachable[dead]);
    }

    #[test]
    fn test_defer_replayed_before_each_return() {
        let (func, diags) = lower(
            "fn (pr: *R) f(c: bool) {
                pr.mu.Lock();
                defer pr.mu.Unlock();
                if c { return; }
                pr.value = 1;
            }",
        );
        assert!(diags.is_empty());
        let returns: Vec<&BasicBlock> = func
            .blocks
            .iter()
            .enumerate()
            .filter(|(i, b)| func.reachable()[*i] && matches!(b.terminator, Terminator::Return { .. }))
            .map(|(_, b)| b)
            .collect();
        assert_eq!(returns.len(), 2);
        for block in returns {
            assert!(matches!(
                block.instructions.last(),
                Some(MirInst::Call { callee: Callee::Method { name, .. }, .. }) if name == "Unlock"
            ));
        }
    }

    #[test]
    fn test_nested_defer_is_configuration_error() {
        let (_, diags) = lower("fn (pr: *R) f(c: bool) { if c { defer pr.mu.Unlock(); } }");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].rule, RuleKind::ConfigurationError);
    }

    #[test]
    fn test_break_outside_loop() {
        let (_, diags) = lower("fn f() { break; }");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("outside of a loop"));
    }

    #[test]
    fn test_force_precedes_statement() {
        let (func, _) = lower("fn (pr: *R) f() { _ = pr.value; // +checklocksforce: pr.mu\n }");
        let body = insts(&func, 0);
        assert!(matches!(&body[0], MirInst::Force { lock, .. } if lock == "pr.mu"));
        assert!(matches!(&body[1], MirInst::Access { kind: AccessKind::Read, .. }));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_misplaced_statement_directive() {
        let (_, diags) = lower("fn f() {\n // +checkatomic\n let x = 1;\n }");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("cannot annotate a statement"));
    }

    #[test]
    fn test_let_binding_kinds() {
        let (func, _) = lower(
            "fn (pr: *R) f() { let a = pr.inner; let b = &pr.mu; let c = R { value: 1 }; let d = 1; let e = NewR(); let g = pr.peer(); }",
        );
        let inits: Vec<&BindInit> = insts(&func, 0)
            .iter()
            .filter_map(|i| match i {
                MirInst::Bind { init, .. } => Some(init),
                _ => None,
            })
            .collect();
        assert!(matches!(inits[0], BindInit::Place(_)));
        assert!(matches!(inits[1], BindInit::Ref(_)));
        assert!(matches!(inits[2], BindInit::Struct(name) if name == "R"));
        assert_eq!(inits[3], &BindInit::Opaque);
        assert_eq!(inits[4], &BindInit::Call(Callee::Function("NewR".into())));
        assert!(matches!(inits[5], BindInit::Call(Callee::Method { name, .. }) if name == "peer"));
    }

    fn binds(func: &MirFunction) -> Vec<String> {
        func.blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter_map(|inst| match inst {
                MirInst::Bind { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_shadowing_let_is_renamed_for_its_block() {
        let (func, _) = lower("fn (pr: *R) f(c: bool) { if c { let pr = pr.next; pr.value = 1; } pr.value = 2; }");
        assert_eq!(binds(&func), vec!["pr#1"]);
        let inner = func
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .find_map(|inst| match inst {
                MirInst::Bind { init: BindInit::Place(path), .. } => Some(path.join(".")),
                _ => None,
            });
        // The initializer still reads the outer binding
        assert_eq!(inner.as_deref(), Some("pr.next"));
        let writes: Vec<String> = accesses(&func)
            .into_iter()
            .filter(|(_, kind, _)| *kind == AccessKind::Write)
            .map(|(place, _, _)| place)
            .collect();
        assert_eq!(writes, vec!["pr#1.value", "pr.value"]);
    }

    #[test]
    fn test_sibling_blocks_get_distinct_names() {
        let (func, _) = lower("fn f(c: bool) { if c { let x = 1; } else { let x = 2; } let x = 3; }");
        let mut names = binds(&func);
        names.sort();
        assert_eq!(names, vec!["x", "x#1", "x#2"]);
    }

    #[test]
    fn test_force_carries_renamed_base() {
        let (func, _) = lower("fn (pr: *R) f(o: *R) { if true { let pr = o;\n // +checklocksforce:pr.mu\n pr.value = 1; } }");
        let force = func
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .find(|inst| matches!(inst, MirInst::Force { .. }));
        assert!(matches!(force, Some(MirInst::Force { lock, base: Some(base), .. }) if lock == "pr.mu" && base == "pr#1"));
    }

    #[test]
    fn test_deeply_nested_blocks_lower() {
        let depth = 1000;
        let source = format!("fn f(c: bool) {{ {} {} }}", "if c { ".repeat(depth), "}".repeat(depth));
        let (func, diags) = lower(&source);
        assert!(diags.is_empty());
        assert!(func.blocks.len() > depth);
    }
}
