// File: src/optimizer.rs
//
// AST optimizer for uGO.
// Two complementary strategies run until a fixpoint (bounded by the cycle
// cap): literal constant folding for unary/binary/ternary forms, and
// sandboxed evaluation of constant sub-expressions built from safe
// builtin calls. The sandbox compiles `return <expr>` and only runs the
// fragment when every opcode is on the allow-list and every constant is a
// primitive.

use crate::ast::{Expr, File, Stmt};
use crate::builtins::BuiltinFunction;
use crate::bytecode::OpCode;
use crate::errors::{CompileError, SourceLocation};
use crate::token::Token;
use crate::value::{binary_op, unary_op, Value};
use crate::vm::Vm;
use ahash::AHashSet;

/// Diagnostics accumulated before the optimizer bails out.
const MAX_ERRORS: usize = 5;

/// Statistics about the rewrites performed, reported by trace output.
#[derive(Debug, Default, Clone)]
pub struct OptimizerStats {
    pub constants_folded: usize,
    pub expressions_evaluated: usize,
    pub cycles: usize,
}

pub struct Optimizer {
    max_cycles: usize,
    trace: bool,
    pub stats: OptimizerStats,
    errors: Vec<CompileError>,
    /// Builtin names shadowed by user definitions anywhere in the file;
    /// the sandbox must not resolve them.
    shadowed: AHashSet<String>,
    /// Lines whose evaluation already failed; skipped on later passes.
    no_eval_lines: AHashSet<u32>,
    changed: bool,
}

impl Optimizer {
    pub fn new(max_cycles: usize, trace: bool) -> Self {
        Self {
            max_cycles,
            trace,
            stats: OptimizerStats::default(),
            errors: Vec::new(),
            shadowed: AHashSet::new(),
            no_eval_lines: AHashSet::new(),
            changed: false,
        }
    }

    /// Rewrites the file in place. Sandbox evaluation errors become an
    /// aggregated OptimizerError whose Display shows the first.
    pub fn optimize_file(&mut self, file: &mut File) -> Result<(), CompileError> {
        self.collect_shadowed_stmts(&file.stmts);
        for cycle in 0..self.max_cycles {
            self.changed = false;
            self.stats.cycles = cycle + 1;
            for stmt in &mut file.stmts {
                self.optimize_stmt(stmt);
            }
            if !self.changed || self.errors.len() >= MAX_ERRORS {
                break;
            }
        }
        if self.trace {
            eprintln!(
                "=== optimizer === cycles={} folded={} evaluated={} errors={}",
                self.stats.cycles,
                self.stats.constants_folded,
                self.stats.expressions_evaluated,
                self.errors.len()
            );
        }
        if self.errors.is_empty() {
            return Ok(());
        }
        let mut first = self.errors.remove(0);
        first.others = std::mem::take(&mut self.errors);
        Err(first)
    }

    // Shadow tracking: any user definition reusing a builtin name
    // disables that builtin in the sandbox, preserving user semantics.
    fn note_shadow(&mut self, name: &str) {
        if BuiltinFunction::lookup(name).is_some() {
            self.shadowed.insert(name.to_string());
        }
    }

    fn collect_shadowed_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.collect_shadowed_stmt(stmt);
        }
    }

    fn collect_shadowed_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Decl { specs, .. } => {
                for spec in specs {
                    self.note_shadow(&spec.name);
                    if let Some(value) = &spec.value {
                        self.collect_shadowed_expr(value);
                    }
                }
            }
            Stmt::Assign { lhs, rhs, token, .. } => {
                if *token == Token::Define {
                    for target in lhs {
                        if let Expr::Ident { name, .. } = target {
                            self.note_shadow(name);
                        }
                    }
                }
                for expr in rhs {
                    self.collect_shadowed_expr(expr);
                }
            }
            Stmt::ForIn { key, value, iterable, body, .. } => {
                self.note_shadow(key);
                self.note_shadow(value);
                self.collect_shadowed_expr(iterable);
                self.collect_shadowed_stmts(&body.stmts);
            }
            Stmt::If { cond, body, else_stmt, .. } => {
                self.collect_shadowed_expr(cond);
                self.collect_shadowed_stmts(&body.stmts);
                if let Some(else_stmt) = else_stmt {
                    self.collect_shadowed_stmt(else_stmt);
                }
            }
            Stmt::For { init, cond, post, body, .. } => {
                if let Some(init) = init {
                    self.collect_shadowed_stmt(init);
                }
                if let Some(cond) = cond {
                    self.collect_shadowed_expr(cond);
                }
                if let Some(post) = post {
                    self.collect_shadowed_stmt(post);
                }
                self.collect_shadowed_stmts(&body.stmts);
            }
            Stmt::Try { body, catch, finally, .. } => {
                self.collect_shadowed_stmts(&body.stmts);
                if let Some(clause) = catch {
                    if let Some(ident) = &clause.ident {
                        self.note_shadow(ident);
                    }
                    self.collect_shadowed_stmts(&clause.body.stmts);
                }
                if let Some(finally) = finally {
                    self.collect_shadowed_stmts(&finally.stmts);
                }
            }
            Stmt::Block(block) => self.collect_shadowed_stmts(&block.stmts),
            Stmt::Expr { expr } => self.collect_shadowed_expr(expr),
            Stmt::Return { results, .. } => {
                for expr in results {
                    self.collect_shadowed_expr(expr);
                }
            }
            Stmt::Throw { expr, .. } | Stmt::IncDec { expr, .. } => {
                self.collect_shadowed_expr(expr)
            }
            Stmt::Branch { .. } | Stmt::Empty { .. } => {}
        }
    }

    fn collect_shadowed_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::FuncLit { params, body, .. } => {
                for name in &params.names {
                    self.note_shadow(name);
                }
                self.collect_shadowed_stmts(&body.stmts);
            }
            Expr::Binary { left, right, .. } => {
                self.collect_shadowed_expr(left);
                self.collect_shadowed_expr(right);
            }
            Expr::Unary { expr, .. } | Expr::Paren { expr, .. } => {
                self.collect_shadowed_expr(expr)
            }
            Expr::Call { func, args, .. } => {
                self.collect_shadowed_expr(func);
                for arg in args {
                    self.collect_shadowed_expr(arg);
                }
            }
            Expr::Array { elements, .. } => {
                for element in elements {
                    self.collect_shadowed_expr(element);
                }
            }
            Expr::Map { entries, .. } => {
                for entry in entries {
                    self.collect_shadowed_expr(&entry.value);
                }
            }
            Expr::Cond { cond, true_expr, false_expr, .. } => {
                self.collect_shadowed_expr(cond);
                self.collect_shadowed_expr(true_expr);
                self.collect_shadowed_expr(false_expr);
            }
            Expr::Index { expr, index, .. } => {
                self.collect_shadowed_expr(expr);
                self.collect_shadowed_expr(index);
            }
            Expr::Selector { expr, .. } => self.collect_shadowed_expr(expr),
            Expr::Slice { expr, low, high, .. } => {
                self.collect_shadowed_expr(expr);
                if let Some(low) = low {
                    self.collect_shadowed_expr(low);
                }
                if let Some(high) = high {
                    self.collect_shadowed_expr(high);
                }
            }
            _ => {}
        }
    }

    // === Rewriting ===

    fn optimize_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Expr { expr } => self.optimize_expr(expr),
            Stmt::IncDec { expr, .. } | Stmt::Throw { expr, .. } => self.optimize_expr(expr),
            Stmt::Decl { specs, .. } => {
                for spec in specs {
                    if let Some(value) = &mut spec.value {
                        self.optimize_expr(value);
                    }
                }
            }
            Stmt::Assign { rhs, .. } => {
                for expr in rhs {
                    self.optimize_expr(expr);
                }
            }
            Stmt::If { cond, body, else_stmt, .. } => {
                self.optimize_expr(cond);
                for stmt in &mut body.stmts {
                    self.optimize_stmt(stmt);
                }
                if let Some(else_stmt) = else_stmt {
                    self.optimize_stmt(else_stmt);
                }
            }
            Stmt::Try { body, catch, finally, .. } => {
                for stmt in &mut body.stmts {
                    self.optimize_stmt(stmt);
                }
                if let Some(clause) = catch {
                    for stmt in &mut clause.body.stmts {
                        self.optimize_stmt(stmt);
                    }
                }
                if let Some(finally) = finally {
                    for stmt in &mut finally.stmts {
                        self.optimize_stmt(stmt);
                    }
                }
            }
            Stmt::For { init, cond, post, body, .. } => {
                if let Some(init) = init {
                    self.optimize_stmt(init);
                }
                if let Some(cond) = cond {
                    self.optimize_expr(cond);
                }
                if let Some(post) = post {
                    self.optimize_stmt(post);
                }
                for stmt in &mut body.stmts {
                    self.optimize_stmt(stmt);
                }
            }
            Stmt::ForIn { iterable, body, .. } => {
                self.optimize_expr(iterable);
                for stmt in &mut body.stmts {
                    self.optimize_stmt(stmt);
                }
            }
            Stmt::Block(block) => {
                for stmt in &mut block.stmts {
                    self.optimize_stmt(stmt);
                }
            }
            Stmt::Return { results, .. } => {
                for expr in results {
                    self.optimize_expr(expr);
                }
            }
            Stmt::Branch { .. } | Stmt::Empty { .. } => {}
        }
    }

    fn optimize_expr(&mut self, expr: &mut Expr) {
        // Children first; folds see already-reduced operands.
        match expr {
            Expr::Paren { expr: inner, .. } => self.optimize_expr(inner),
            Expr::Binary { left, right, .. } => {
                self.optimize_expr(left);
                self.optimize_expr(right);
            }
            Expr::Unary { expr: inner, .. } => self.optimize_expr(inner),
            Expr::Array { elements, .. } => {
                for element in elements {
                    self.optimize_expr(element);
                }
            }
            Expr::Map { entries, .. } => {
                for entry in entries {
                    self.optimize_expr(&mut entry.value);
                }
            }
            Expr::Index { expr: inner, index, .. } => {
                self.optimize_expr(inner);
                self.optimize_expr(index);
            }
            Expr::Selector { expr: inner, .. } => self.optimize_expr(inner),
            Expr::Slice { expr: inner, low, high, .. } => {
                self.optimize_expr(inner);
                if let Some(low) = low {
                    self.optimize_expr(low);
                }
                if let Some(high) = high {
                    self.optimize_expr(high);
                }
            }
            Expr::Call { func, args, .. } => {
                self.optimize_expr(func);
                for arg in args {
                    self.optimize_expr(arg);
                }
            }
            Expr::Cond { cond, true_expr, false_expr, .. } => {
                self.optimize_expr(cond);
                self.optimize_expr(true_expr);
                self.optimize_expr(false_expr);
            }
            Expr::FuncLit { body, .. } => {
                for stmt in &mut body.stmts {
                    self.optimize_stmt(stmt);
                }
            }
            _ => {}
        }

        if let Some(folded) = self.fold(expr) {
            *expr = folded;
            self.stats.constants_folded += 1;
            self.changed = true;
            return;
        }

        if self.is_eval_candidate(expr) {
            let location = expr.location();
            if self.no_eval_lines.contains(&location.line) {
                return;
            }
            match self.eval(expr) {
                Ok(Some(value)) => {
                    if let Some(lit) = value_to_literal(&value, location) {
                        *expr = lit;
                        self.stats.expressions_evaluated += 1;
                        self.changed = true;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.no_eval_lines.insert(location.line);
                    self.errors
                        .push(CompileError::optimizer(err.message, location));
                }
            }
        }
    }

    /// Pure literal folding; division by zero and other would-be runtime
    /// errors skip the fold and stay for the VM to raise.
    fn fold(&mut self, expr: &Expr) -> Option<Expr> {
        match expr {
            Expr::Paren { expr: inner, .. } if inner.is_literal() => Some((**inner).clone()),
            Expr::Unary { token, expr: inner, location } => {
                let value = literal_value(inner)?;
                let out = unary_op(*token, &value).ok()?;
                value_to_literal(&out, *location)
            }
            Expr::Binary { token, left, right, location } => match token {
                Token::LAnd => {
                    let value = literal_value(left)?;
                    if value.is_falsy() {
                        Some((**left).clone())
                    } else {
                        Some((**right).clone())
                    }
                }
                Token::LOr => {
                    let value = literal_value(left)?;
                    if value.is_falsy() {
                        Some((**right).clone())
                    } else {
                        Some((**left).clone())
                    }
                }
                Token::Equal | Token::NotEqual => {
                    let (a, b) = (literal_value(left)?, literal_value(right)?);
                    let eq = a.equal(&b);
                    Some(Expr::BoolLit {
                        value: if *token == Token::Equal { eq } else { !eq },
                        location: *location,
                    })
                }
                _ => {
                    let (a, b) = (literal_value(left)?, literal_value(right)?);
                    let out = binary_op(*token, &a, &b).ok()?;
                    value_to_literal(&out, *location)
                }
            },
            Expr::Cond { cond, true_expr, false_expr, .. } => {
                let value = literal_value(cond)?;
                if value.is_falsy() {
                    Some((**false_expr).clone())
                } else {
                    Some((**true_expr).clone())
                }
            }
            _ => None,
        }
    }

    // === Sandbox evaluation ===

    /// Candidates are constant expressions containing at least one call to
    /// an unshadowed safe builtin. Plain literal arithmetic belongs to
    /// `fold` and never enters the sandbox.
    fn is_eval_candidate(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Binary { .. } | Expr::Unary { .. } | Expr::Call { .. })
            && self.is_const_expr(expr)
            && contains_call(expr)
    }

    fn is_const_expr(&self, expr: &Expr) -> bool {
        match expr {
            _ if expr.is_literal() => true,
            Expr::Paren { expr, .. } => self.is_const_expr(expr),
            Expr::Unary { expr, .. } => self.is_const_expr(expr),
            Expr::Binary { left, right, .. } => {
                self.is_const_expr(left) && self.is_const_expr(right)
            }
            Expr::Call { func, args, expand, .. } => {
                if *expand {
                    return false;
                }
                let Expr::Ident { name, .. } = func.as_ref() else {
                    return false;
                };
                if self.shadowed.contains(name) {
                    return false;
                }
                let Some(builtin) = BuiltinFunction::lookup(name) else {
                    return false;
                };
                builtin.safe_for_optimizer() && args.iter().all(|a| self.is_const_expr(a))
            }
            _ => false,
        }
    }

    /// Compiles `return <expr>` and runs it in a sandbox VM, but only if
    /// every opcode is allow-listed and every constant is a primitive.
    fn eval(&mut self, expr: &Expr) -> Result<Option<Value>, crate::errors::RuntimeError> {
        let location = expr.location();
        let fragment = File {
            stmts: vec![Stmt::Return { results: vec![expr.clone()], location }],
        };
        let mut table = crate::symbol_table::SymbolTable::new();
        table.disable_builtin(self.shadowed.iter().cloned());
        let compiler = crate::compiler::Compiler::new(
            "(optimizer)",
            crate::compiler::CompilerOptions {
                no_optimize: true,
                symbol_table: Some(table),
                ..Default::default()
            },
        );
        let (bytecode, _) = match compiler.compile_file(fragment) {
            Ok(out) => out,
            // A fragment that does not compile simply is not evaluated.
            Err(_) => return Ok(None),
        };
        if !sandbox_allows(&bytecode) {
            return Ok(None);
        }
        let mut vm = Vm::new(std::sync::Arc::new(bytecode));
        vm.run(Value::empty_map(), &[]).map(Some)
    }
}

// Opcode allow-list for sandbox fragments.
fn sandbox_allows(bytecode: &crate::bytecode::Bytecode) -> bool {
    for constant in &bytecode.constants {
        if constant.const_key().is_none() {
            return false;
        }
    }
    let insts = &bytecode.main.instructions;
    let mut pos = 0;
    while pos < insts.len() {
        let Some(op) = OpCode::from_u8(insts[pos]) else {
            return false;
        };
        match op {
            OpCode::Constant
            | OpCode::Null
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::BinaryOp
            | OpCode::Unary
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Jump
            | OpCode::JumpFalsy
            | OpCode::AndJump
            | OpCode::OrJump
            | OpCode::GetBuiltin
            | OpCode::Call
            | OpCode::Return => {}
            _ => return false,
        }
        let (_, next) = crate::bytecode::read_operands(op, insts, pos);
        pos = next;
    }
    true
}

fn contains_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } => true,
        Expr::Paren { expr, .. } | Expr::Unary { expr, .. } => contains_call(expr),
        Expr::Binary { left, right, .. } => contains_call(left) || contains_call(right),
        _ => false,
    }
}

fn literal_value(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::IntLit { value, .. } => Some(Value::Int(*value)),
        Expr::UintLit { value, .. } => Some(Value::Uint(*value)),
        Expr::FloatLit { value, .. } => Some(Value::Float(*value)),
        Expr::BoolLit { value, .. } => Some(Value::Bool(*value)),
        Expr::CharLit { value, .. } => Some(Value::Char(*value)),
        Expr::StringLit { value, .. } => Some(Value::string(value.as_str())),
        Expr::UndefinedLit { .. } => Some(Value::Undefined),
        Expr::Paren { expr, .. } => literal_value(expr),
        _ => None,
    }
}

fn value_to_literal(value: &Value, location: SourceLocation) -> Option<Expr> {
    match value {
        Value::Int(v) => Some(Expr::IntLit { value: *v, location }),
        Value::Uint(v) => Some(Expr::UintLit { value: *v, location }),
        Value::Float(v) => Some(Expr::FloatLit { value: *v, location }),
        Value::Bool(v) => Some(Expr::BoolLit { value: *v, location }),
        Value::Char(v) => Some(Expr::CharLit { value: *v, location }),
        Value::String(v) => Some(Expr::StringLit { value: v.to_string(), location }),
        Value::Undefined => Some(Expr::UndefinedLit { location }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn optimize(source: &str) -> File {
        let mut file = parse_source(source).unwrap();
        Optimizer::new(100, false).optimize_file(&mut file).unwrap();
        file
    }

    fn rhs_of(file: &File, index: usize) -> &Expr {
        let Stmt::Assign { rhs, .. } = &file.stmts[index] else {
            panic!("expected assignment");
        };
        &rhs[0]
    }

    #[test]
    fn test_fold_arithmetic() {
        let file = optimize("x := 2 + 3 * 4");
        assert!(matches!(rhs_of(&file, 0), Expr::IntLit { value: 14, .. }));
    }

    #[test]
    fn test_fold_string_concat() {
        let file = optimize(r#"x := "n=" + 42"#);
        let Expr::StringLit { value, .. } = rhs_of(&file, 0) else { panic!() };
        assert_eq!(value, "n=42");
    }

    #[test]
    fn test_fold_short_circuit() {
        let file = optimize("x := false && wouldBlowUp; y := 1 || wouldBlowUp");
        assert!(matches!(rhs_of(&file, 0), Expr::BoolLit { value: false, .. }));
        assert!(matches!(rhs_of(&file, 1), Expr::IntLit { value: 1, .. }));
    }

    #[test]
    fn test_literal_condition_reduced() {
        let file = optimize("if 1 < 2 { x := 1 }");
        let Stmt::If { cond, .. } = &file.stmts[0] else { panic!() };
        assert!(matches!(cond, Expr::BoolLit { value: true, .. }));
    }

    #[test]
    fn test_division_by_zero_left_for_runtime() {
        let mut file = parse_source("x := 1 / 0").unwrap();
        Optimizer::new(100, false).optimize_file(&mut file).unwrap();
        assert!(matches!(rhs_of(&file, 0), Expr::Binary { .. }));
    }

    #[test]
    fn test_sandbox_evaluates_safe_builtins() {
        let file = optimize(r#"x := int("12") + 3"#);
        assert!(matches!(rhs_of(&file, 0), Expr::IntLit { value: 15, .. }));
    }

    #[test]
    fn test_sandbox_eval_error_is_diagnostic() {
        let mut file = parse_source(r#"x := int("nope")"#).unwrap();
        let err = Optimizer::new(100, false).optimize_file(&mut file).unwrap_err();
        assert_eq!(err.kind, crate::errors::CompileErrorKind::Optimizer);
    }

    #[test]
    fn test_shadowed_builtin_not_evaluated() {
        let file = optimize("int := func(x) { return 99 }; y := int(\"12\")");
        // `int` is user-defined here; the call must survive untouched.
        assert!(matches!(rhs_of(&file, 1), Expr::Call { .. }));
    }

    #[test]
    fn test_idempotent() {
        let mut file = parse_source("x := 2 + 3 * 4; y := \"a\" + 1; z := -5").unwrap();
        Optimizer::new(100, false).optimize_file(&mut file).unwrap();
        let first = format!("{:?}", file);
        Optimizer::new(100, false).optimize_file(&mut file).unwrap();
        let second = format!("{:?}", file);
        assert_eq!(first, second);
    }

    #[test]
    fn test_ternary_folded() {
        let file = optimize("x := 1 < 2 ? 10 : 20");
        assert!(matches!(rhs_of(&file, 0), Expr::IntLit { value: 10, .. }));
    }
}
