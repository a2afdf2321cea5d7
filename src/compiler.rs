// File: src/compiler.rs
//
// Bytecode compiler for uGO.
// Single-pass AST traversal emitting instructions with jump patching.
// Constants are deduplicated (primitives by content, compiled functions
// by hash + structural identity); imports are resolved recursively with
// one module store entry per module program-wide.

use crate::ast::{Block, DeclKind, DeclSpec, Expr, File, Stmt};
use crate::builtins::BuiltinFunction;
use crate::bytecode::{encode, read_operands, Bytecode, CompiledFunction, OpCode, SourceMap};
use crate::errors::{CompileError, SourceLocation};
use crate::module::{Importable, ModuleKind, ModuleMap, ModuleStore};
use crate::optimizer::Optimizer;
use crate::parser::parse_source;
use crate::symbol_table::{Symbol, SymbolScope, SymbolTable};
use crate::token::Token;
use crate::value::{ConstKey, Value};
use ahash::AHashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Synthetic local holding the RHS array during destructuring; the colon
/// keeps it out of the user namespace.
const ARRAY_LOCAL: &str = ":array";
/// Synthetic local holding the iterator of a for-in loop.
const ITER_LOCAL: &str = ":it";

/// Options for `compile`.
#[derive(Debug, Default)]
pub struct CompilerOptions {
    pub module_map: Option<ModuleMap>,
    /// Filesystem fallback directory for `import("name")`.
    pub module_path: Option<PathBuf>,
    /// Seed constants, used by Eval to share the pool across fragments.
    pub constants: Option<Vec<Value>>,
    /// Seed symbol table, used by Eval to keep locals across fragments.
    pub symbol_table: Option<SymbolTable>,
    /// Parameter names for the main function (Eval's captured locals).
    pub main_params: Vec<String>,
    pub trace_parser: bool,
    pub trace_compiler: bool,
    pub trace_optimizer: bool,
    pub no_optimize: bool,
    /// Optimizer pass cap; 0 means the default of 100.
    pub optimizer_limit: usize,
}

/// Compiles uGO source into bytecode.
pub fn compile(source: &[u8], options: CompilerOptions) -> Result<Bytecode, CompileError> {
    compile_named(source, "(main)", options)
}

/// Compiles uGO source under an explicit file name for diagnostics.
pub fn compile_named(
    source: &[u8],
    file_name: &str,
    options: CompilerOptions,
) -> Result<Bytecode, CompileError> {
    let (bytecode, _) = compile_with_table(source, file_name, options)?;
    Ok(bytecode)
}

/// Like `compile_named` but also hands back the main symbol table so the
/// caller (Eval) can carry locals into the next fragment.
pub fn compile_with_table(
    source: &[u8],
    file_name: &str,
    options: CompilerOptions,
) -> Result<(Bytecode, SymbolTable), CompileError> {
    let text = std::str::from_utf8(source)
        .map_err(|_| CompileError::parse("source is not valid UTF-8", SourceLocation::unknown()))?;
    let mut file = parse_source(text)?;
    if options.trace_parser {
        eprintln!("=== AST {} ===\n{:#?}", file_name, file);
    }
    let mut compiler = Compiler::new(file_name, options);
    if !compiler.no_optimize {
        compiler.optimize(&mut file)?;
    }
    compiler.compile_file(file)
}

/// Per-function emission state; the compiler keeps a stack of these, one
/// per function literal being compiled.
#[derive(Default)]
struct FuncContext {
    instructions: Vec<u8>,
    source_map: SourceMap,
    loops: Vec<LoopContext>,
    /// Number of error handlers enclosing the instruction being emitted.
    try_depth: usize,
    variadic: bool,
    last_op: Option<OpCode>,
}

struct LoopContext {
    /// Offset continue jumps re-enter at (condition or post label).
    continue_jumps: Vec<usize>,
    break_jumps: Vec<usize>,
    /// Handler depth at loop entry; branches deeper than this run
    /// finalizers first.
    try_depth: usize,
}

pub struct Compiler {
    file_name: String,
    constants: Vec<Value>,
    const_cache: AHashMap<ConstKey, usize>,
    /// hash32 -> constant-pool indices of compiled functions.
    func_cache: AHashMap<u32, Vec<usize>>,
    module_map: ModuleMap,
    module_store: ModuleStore,
    /// Modules currently being compiled, for cyclic import detection.
    compiling: Vec<String>,
    symbol_table: SymbolTable,
    funcs: Vec<FuncContext>,
    /// Current `iota` value inside a const declaration group.
    iota: Option<i64>,
    main_params: Vec<String>,
    trace_compiler: bool,
    trace_optimizer: bool,
    no_optimize: bool,
    optimizer_limit: usize,
}

impl Compiler {
    pub fn new(file_name: &str, options: CompilerOptions) -> Self {
        let mut module_map = options.module_map.unwrap_or_default();
        if let Some(path) = options.module_path {
            module_map = module_map.with_module_path(path);
        }
        let constants = options.constants.unwrap_or_default();
        let mut const_cache = AHashMap::new();
        let mut func_cache: AHashMap<u32, Vec<usize>> = AHashMap::new();
        for (index, value) in constants.iter().enumerate() {
            if let Some(key) = value.const_key() {
                const_cache.insert(key, index);
            } else if let Value::Function(func) = value {
                func_cache.entry(func.hash32()).or_default().push(index);
            }
        }
        Self {
            file_name: file_name.to_string(),
            constants,
            const_cache,
            func_cache,
            module_map,
            module_store: ModuleStore::default(),
            compiling: Vec::new(),
            symbol_table: options.symbol_table.unwrap_or_default(),
            funcs: vec![FuncContext::default()],
            iota: None,
            main_params: options.main_params,
            trace_compiler: options.trace_compiler,
            trace_optimizer: options.trace_optimizer,
            no_optimize: options.no_optimize,
            optimizer_limit: if options.optimizer_limit == 0 {
                100
            } else {
                options.optimizer_limit
            },
        }
    }

    fn optimize(&mut self, file: &mut File) -> Result<(), CompileError> {
        let mut optimizer = Optimizer::new(self.optimizer_limit, self.trace_optimizer);
        optimizer.optimize_file(file)
    }

    pub fn compile_file(mut self, file: File) -> Result<(Bytecode, SymbolTable), CompileError> {
        if !self.main_params.is_empty() {
            let params = std::mem::take(&mut self.main_params);
            self.symbol_table
                .set_params(&params)
                .map_err(|msg| CompileError::compile(msg, SourceLocation::unknown()))?;
        }
        for stmt in &file.stmts {
            self.compile_stmt(stmt)?;
        }
        self.finish_function(SourceLocation::unknown())?;

        let ctx = self.funcs.pop().expect("main function context");
        let num_params = self.symbol_table.num_params() as usize;
        let num_locals = (self.symbol_table.max_symbols() as usize).max(num_params);
        let main = CompiledFunction::new(
            num_params,
            num_locals,
            ctx.variadic,
            ctx.instructions,
            ctx.source_map,
        );
        if self.trace_compiler {
            eprintln!(
                "=== bytecode {} ===\n{}",
                self.file_name,
                crate::bytecode::disassemble(&main.instructions)
            );
        }
        let bytecode = Bytecode {
            file_name: self.file_name,
            constants: self.constants,
            main: Arc::new(main),
            num_modules: self.module_store.count(),
        };
        Ok((bytecode, self.symbol_table))
    }

    // === Emission helpers ===

    fn cur(&mut self) -> &mut FuncContext {
        self.funcs.last_mut().expect("function context")
    }

    fn offset(&mut self) -> usize {
        self.cur().instructions.len()
    }

    fn emit(
        &mut self,
        op: OpCode,
        operands: &[i64],
        location: SourceLocation,
    ) -> Result<usize, CompileError> {
        let ctx = self.funcs.last_mut().expect("function context");
        let offset = ctx.instructions.len();
        encode(&mut ctx.instructions, op, operands)
            .map_err(|msg| CompileError::compile(msg, location))?;
        ctx.source_map.insert(offset, location);
        ctx.last_op = Some(op);
        Ok(offset)
    }

    /// Rewrites the operands of a previously emitted instruction; used to
    /// patch forward jumps once their target is known.
    fn change_operand(&mut self, offset: usize, operands: &[i64]) {
        let ctx = self.funcs.last_mut().expect("function context");
        let op = OpCode::from_u8(ctx.instructions[offset]).expect("patch target opcode");
        let mut patched = Vec::with_capacity(9);
        encode(&mut patched, op, operands).expect("patch operand fits");
        ctx.instructions[offset..offset + patched.len()].copy_from_slice(&patched);
    }

    fn patch_jump(&mut self, offset: usize) {
        let target = self.offset() as i64;
        self.change_operand(offset, &[target]);
    }

    fn add_constant(&mut self, value: Value) -> usize {
        if let Some(key) = value.const_key() {
            if let Some(&index) = self.const_cache.get(&key) {
                return index;
            }
            let index = self.constants.len();
            self.const_cache.insert(key, index);
            self.constants.push(value);
            return index;
        }
        if let Value::Function(func) = &value {
            let hash = func.hash32();
            if let Some(indices) = self.func_cache.get(&hash) {
                for &index in indices {
                    if let Value::Function(existing) = &self.constants[index] {
                        if existing.identical(func) && existing.equal_source_map(func) {
                            return index;
                        }
                    }
                }
            }
            let index = self.constants.len();
            self.func_cache.entry(hash).or_default().push(index);
            self.constants.push(value);
            return index;
        }
        let index = self.constants.len();
        self.constants.push(value);
        index
    }

    fn emit_constant(&mut self, value: Value, location: SourceLocation) -> Result<(), CompileError> {
        let index = self.add_constant(value) as i64;
        self.emit(OpCode::Constant, &[index], location)?;
        Ok(())
    }

    /// Ensures the function ends in a Return: emitted when the last opcode
    /// is not Return, or when a patched jump targets past the end.
    fn finish_function(&mut self, location: SourceLocation) -> Result<(), CompileError> {
        let ctx = self.funcs.last_mut().expect("function context");
        let end = ctx.instructions.len();
        let mut needs_return = ctx.last_op != Some(OpCode::Return);
        if !needs_return {
            let mut pos = 0;
            while pos < end {
                let op = match OpCode::from_u8(ctx.instructions[pos]) {
                    Some(op) => op,
                    None => break,
                };
                let (operands, next) = read_operands(op, &ctx.instructions, pos);
                let jumps_to_end = match op {
                    OpCode::Jump | OpCode::JumpFalsy | OpCode::AndJump | OpCode::OrJump => {
                        operands[0] as usize >= end
                    }
                    OpCode::SetupTry => {
                        operands[0] as usize >= end || operands[1] as usize >= end
                    }
                    _ => false,
                };
                if jumps_to_end {
                    needs_return = true;
                    break;
                }
                pos = next;
            }
        }
        if needs_return {
            self.emit(OpCode::Return, &[0], location)?;
        }
        Ok(())
    }

    // === Scopes ===

    fn enter_block(&mut self) {
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.enter_block();
    }

    fn leave_block(&mut self) {
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.leave().expect("block scope has a parent");
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.enter_block();
        let result = self.compile_stmts(&block.stmts);
        self.leave_block();
        result
    }

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    // === Statements ===

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr { expr } => {
                self.compile_expr(expr)?;
                self.emit(OpCode::Pop, &[], expr.location())?;
                Ok(())
            }
            Stmt::IncDec { expr, token, location } => {
                let op = if *token == Token::Inc {
                    Token::AddAssign
                } else {
                    Token::SubAssign
                };
                let one = Expr::IntLit { value: 1, location: *location };
                self.compile_assign(
                    std::slice::from_ref(expr),
                    std::slice::from_ref(&one),
                    op,
                    *location,
                )
            }
            Stmt::Decl { kind, specs, location } => self.compile_decl(*kind, specs, *location),
            Stmt::Assign { lhs, rhs, token, location } => {
                self.compile_assign(lhs, rhs, *token, *location)
            }
            Stmt::If { cond, body, else_stmt, location } => {
                self.compile_if(cond, body, else_stmt.as_deref(), *location)
            }
            Stmt::Try { body, catch, finally, location } => {
                self.compile_try(body, catch.as_ref(), finally.as_ref(), *location)
            }
            Stmt::Throw { expr, location } => {
                self.compile_expr(expr)?;
                self.emit(OpCode::Throw, &[1], *location)?;
                Ok(())
            }
            Stmt::For { init, cond, post, body, location } => {
                self.compile_for(init.as_deref(), cond.as_ref(), post.as_deref(), body, *location)
            }
            Stmt::ForIn { key, value, iterable, body, location } => {
                self.compile_for_in(key, value, iterable, body, *location)
            }
            Stmt::Branch { token, location } => self.compile_branch(*token, *location),
            Stmt::Block(block) => self.compile_block(block),
            Stmt::Return { results, location } => self.compile_return(results, *location),
            Stmt::Empty { .. } => Ok(()),
        }
    }

    fn compile_decl(
        &mut self,
        kind: DeclKind,
        specs: &[DeclSpec],
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        match kind {
            DeclKind::Param => {
                if self.symbol_table.in_block() {
                    return Err(CompileError::compile(
                        "param declarations are only allowed in the function's top scope",
                        location,
                    ));
                }
                let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
                self.symbol_table
                    .set_params(&names)
                    .map_err(|msg| CompileError::compile(msg, location))?;
                self.cur().variadic = specs.last().map(|s| s.variadic).unwrap_or(false);
                Ok(())
            }
            DeclKind::Global => {
                if !self.symbol_table.is_root() {
                    return Err(CompileError::compile(
                        "global declarations are only allowed at script top-level",
                        location,
                    ));
                }
                for spec in specs {
                    self.symbol_table
                        .define_global(&spec.name)
                        .map_err(|msg| CompileError::compile(msg, spec.location))?;
                }
                Ok(())
            }
            DeclKind::Var => {
                for spec in specs {
                    if let Some(value) = &spec.value {
                        self.compile_expr(value)?;
                    }
                    let (symbol, _) = self
                        .symbol_table
                        .define_local(&spec.name)
                        .map_err(|msg| CompileError::compile(msg, spec.location))?;
                    // Missing initializers get no store: fresh local slots
                    // already read as Undefined.
                    if spec.value.is_some() {
                        self.emit(OpCode::DefineLocal, &[symbol.index as i64], spec.location)?;
                    }
                }
                Ok(())
            }
            DeclKind::Const => {
                let mut prev_value: Option<&Expr> = None;
                for (index, spec) in specs.iter().enumerate() {
                    self.iota = Some(index as i64);
                    let value = match (&spec.value, prev_value) {
                        (Some(value), _) => {
                            prev_value = Some(value);
                            value
                        }
                        // A const group entry with no RHS repeats the
                        // previous one (with the new iota).
                        (None, Some(value)) => value,
                        (None, None) => {
                            self.iota = None;
                            return Err(CompileError::compile(
                                format!("missing initializer for const '{}'", spec.name),
                                spec.location,
                            ));
                        }
                    };
                    let result = self.compile_expr(value);
                    self.iota = None;
                    result?;
                    let (symbol, _) = self
                        .symbol_table
                        .define_local(&spec.name)
                        .map_err(|msg| CompileError::compile(msg, spec.location))?;
                    self.emit(OpCode::DefineLocal, &[symbol.index as i64], spec.location)?;
                    self.symbol_table.mark_constant(&spec.name);
                }
                self.iota = None;
                Ok(())
            }
        }
    }

    fn compile_assign(
        &mut self,
        lhs: &[Expr],
        rhs: &[Expr],
        token: Token,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        if rhs.len() > 1 {
            return Err(CompileError::compile(
                "multiple expressions on the right side are not supported",
                rhs[1].location(),
            ));
        }
        if lhs.len() > 1 {
            return self.compile_destructuring(lhs, &rhs[0], token, location);
        }
        let target = &lhs[0];

        if let Some(base) = token.assign_base() {
            // Compound assignment: load, operate, store.
            self.compile_expr(target)?;
            self.compile_expr(&rhs[0])?;
            self.emit(OpCode::BinaryOp, &[base.id() as i64], location)?;
            return self.compile_store(target, location);
        }

        match token {
            Token::Define => {
                let Expr::Ident { name, location: target_location } = target else {
                    return Err(CompileError::compile(
                        "operator ':=' requires a plain identifier on the left side",
                        target.location(),
                    ));
                };
                // A function literal may reference its own name, so the
                // symbol is defined before its body compiles and the store
                // writes through any capture cell created meanwhile.
                if matches!(&rhs[0], Expr::FuncLit { .. }) {
                    let (symbol, existed) = self
                        .symbol_table
                        .define_local(name)
                        .map_err(|msg| CompileError::compile(msg, *target_location))?;
                    if existed && symbol.constant {
                        return Err(CompileError::compile(
                            format!("assignment to constant variable '{}'", name),
                            *target_location,
                        ));
                    }
                    self.compile_expr(&rhs[0])?;
                    match symbol.scope {
                        SymbolScope::Global => {
                            let index = self.add_constant(Value::string(name.as_str())) as i64;
                            self.emit(OpCode::SetGlobal, &[index], *target_location)?;
                        }
                        _ => {
                            self.emit(OpCode::SetLocal, &[symbol.index as i64], *target_location)?;
                        }
                    }
                    return Ok(());
                }
                self.compile_expr(&rhs[0])?;
                self.define_ident(name, *target_location)
            }
            Token::Assign => {
                self.compile_expr(&rhs[0])?;
                self.compile_store(target, location)
            }
            _ => Err(CompileError::compile(
                format!("invalid assignment operator '{}'", token.symbol()),
                location,
            )),
        }
    }

    /// `x, y := expr` (or `=`): evaluate through the makeArray builtin,
    /// stash in the synthetic `:array` local, then index out each target.
    fn compile_destructuring(
        &mut self,
        lhs: &[Expr],
        rhs: &Expr,
        token: Token,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        if token != Token::Define && token != Token::Assign {
            return Err(CompileError::compile(
                "compound assignment cannot destructure",
                location,
            ));
        }
        self.emit(
            OpCode::GetBuiltin,
            &[BuiltinFunction::MakeArray.id() as i64],
            location,
        )?;
        self.emit_constant(Value::Int(lhs.len() as i64), location)?;
        self.compile_expr(rhs)?;
        self.emit(OpCode::Call, &[2, 0], location)?;

        let (array_sym, _) = self
            .symbol_table
            .define_local(ARRAY_LOCAL)
            .map_err(|msg| CompileError::compile(msg, location))?;
        self.emit(OpCode::DefineLocal, &[array_sym.index as i64], location)?;

        for (index, target) in lhs.iter().enumerate() {
            let target_location = target.location();
            self.emit(OpCode::GetLocal, &[array_sym.index as i64], target_location)?;
            self.emit_constant(Value::Int(index as i64), target_location)?;
            self.emit(OpCode::GetIndex, &[1], target_location)?;
            if token == Token::Define {
                let Expr::Ident { name, location: ident_location } = target else {
                    return Err(CompileError::compile(
                        "operator ':=' requires plain identifiers on the left side",
                        target_location,
                    ));
                };
                self.define_ident(name, *ident_location)?;
            } else {
                self.compile_store(target, target_location)?;
            }
        }
        Ok(())
    }

    /// `name := <value on stack>`.
    fn define_ident(&mut self, name: &str, location: SourceLocation) -> Result<(), CompileError> {
        let (symbol, existed) = self
            .symbol_table
            .define_local(name)
            .map_err(|msg| CompileError::compile(msg, location))?;
        if existed && symbol.constant {
            return Err(CompileError::compile(
                format!("assignment to constant variable '{}'", name),
                location,
            ));
        }
        match symbol.scope {
            SymbolScope::Global => {
                let index = self.add_constant(Value::string(name)) as i64;
                self.emit(OpCode::SetGlobal, &[index], location)?;
                self.symbol_table.mark_assigned(name);
            }
            SymbolScope::Free => {
                self.emit(OpCode::SetFree, &[symbol.index as i64], location)?;
            }
            _ if existed => {
                self.emit(OpCode::SetLocal, &[symbol.index as i64], location)?;
            }
            _ => {
                self.emit(OpCode::DefineLocal, &[symbol.index as i64], location)?;
            }
        }
        Ok(())
    }

    /// Stores the value at TOS into an assignment target.
    fn compile_store(&mut self, target: &Expr, location: SourceLocation) -> Result<(), CompileError> {
        match target {
            Expr::Ident { name, location: ident_location } => {
                let symbol = self.symbol_table.resolve(name).ok_or_else(|| {
                    CompileError::compile(
                        format!("unresolved reference '{}'", name),
                        *ident_location,
                    )
                })?;
                if symbol.constant {
                    return Err(CompileError::compile(
                        format!("assignment to constant variable '{}'", name),
                        *ident_location,
                    ));
                }
                match symbol.scope {
                    SymbolScope::Local => {
                        self.emit(OpCode::SetLocal, &[symbol.index as i64], location)?;
                    }
                    SymbolScope::Free => {
                        self.emit(OpCode::SetFree, &[symbol.index as i64], location)?;
                    }
                    SymbolScope::Global => {
                        let index = self.add_constant(Value::string(name.as_str())) as i64;
                        self.emit(OpCode::SetGlobal, &[index], location)?;
                    }
                    SymbolScope::Builtin => {
                        return Err(CompileError::compile(
                            format!("cannot assign to builtin '{}'", name),
                            *ident_location,
                        ));
                    }
                }
                Ok(())
            }
            Expr::Selector { .. } | Expr::Index { .. } => {
                // value is already on the stack; follow with the target
                // object, the final selector, then SetIndex.
                let (base, mut keys) = flatten_selectors(target);
                let last = keys.pop().expect("selector chain has a key");
                self.compile_expr(base)?;
                if !keys.is_empty() {
                    for key in &keys {
                        self.compile_index_key(key)?;
                    }
                    self.emit(OpCode::GetIndex, &[keys.len() as i64], location)?;
                }
                self.compile_index_key(&last)?;
                self.emit(OpCode::SetIndex, &[], location)?;
                Ok(())
            }
            other => Err(CompileError::compile(
                "invalid assignment target",
                other.location(),
            )),
        }
    }

    fn compile_index_key(&mut self, key: &IndexKey) -> Result<(), CompileError> {
        match key {
            IndexKey::Name(name, location) => {
                self.emit_constant(Value::string(name.as_str()), *location)
            }
            IndexKey::Expr(expr) => self.compile_expr(expr),
        }
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        body: &Block,
        else_stmt: Option<&Stmt>,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        // Literal conditions (possibly produced by the optimizer) compile
        // only the live arm; the dead arm is skipped entirely.
        if let Expr::BoolLit { value, .. } = cond {
            if *value {
                return self.compile_block(body);
            }
            return match else_stmt {
                Some(stmt) => self.compile_stmt(stmt),
                None => Ok(()),
            };
        }

        self.compile_expr(cond)?;
        let falsy_jump = self.emit(OpCode::JumpFalsy, &[0], location)?;
        self.compile_block(body)?;
        match else_stmt {
            Some(stmt) => {
                let end_jump = self.emit(OpCode::Jump, &[0], location)?;
                self.patch_jump(falsy_jump);
                self.compile_stmt(stmt)?;
                self.patch_jump(end_jump);
            }
            None => {
                self.patch_jump(falsy_jump);
            }
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &Block,
        catch: Option<&crate::ast::CatchClause>,
        finally: Option<&Block>,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        self.enter_block();
        self.cur().try_depth += 1;

        let setup = self.emit(OpCode::SetupTry, &[0, 0], location)?;

        // Seed the catch identifier as Undefined so it exists on every
        // path through the statement.
        let catch_symbol = match catch.and_then(|c| c.ident.as_deref()) {
            Some(name) => {
                self.emit(OpCode::Null, &[], location)?;
                let (symbol, existed) = self
                    .symbol_table
                    .define_local(name)
                    .map_err(|msg| CompileError::compile(msg, location))?;
                let op = if existed { OpCode::SetLocal } else { OpCode::DefineLocal };
                self.emit(op, &[symbol.index as i64], location)?;
                Some(symbol)
            }
            None => None,
        };

        self.compile_block(body)?;

        let body_end_jump = if catch.is_some() {
            Some(self.emit(OpCode::Jump, &[0], location)?)
        } else {
            None
        };

        let catch_offset = self.offset();
        if let Some(clause) = catch {
            self.emit(OpCode::SetupCatch, &[], clause.location)?;
            match &catch_symbol {
                Some(symbol) => {
                    self.emit(OpCode::SetLocal, &[symbol.index as i64], clause.location)?;
                }
                None => {
                    self.emit(OpCode::Pop, &[], clause.location)?;
                }
            }
            self.compile_block(&clause.body)?;
        }

        let finally_offset = self.offset();
        if let Some(jump) = body_end_jump {
            self.patch_jump(jump);
        }
        self.emit(OpCode::SetupFinally, &[], location)?;
        if let Some(block) = finally {
            self.compile_block(block)?;
        }
        // Implicit re-throw: re-raises an unhandled error, or restores a
        // routed return/break, or just pops the handler.
        self.emit(OpCode::Throw, &[0], location)?;

        let catch_operand = if catch.is_some() { catch_offset } else { finally_offset };
        self.change_operand(setup, &[catch_operand as i64, finally_offset as i64]);

        self.cur().try_depth -= 1;
        self.leave_block();
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Stmt>,
        body: &Block,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        self.enter_block();
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        let cond_label = self.offset();
        let exit_jump = match cond {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit(OpCode::JumpFalsy, &[0], location)?)
            }
            None => None,
        };

        let try_depth = self.cur().try_depth;
        self.cur().loops.push(LoopContext {
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
            try_depth,
        });

        self.compile_block(body)?;

        let post_label = self.offset();
        if let Some(post) = post {
            self.compile_stmt(post)?;
        }
        self.emit(OpCode::Jump, &[cond_label as i64], location)?;

        let end = self.offset() as i64;
        if let Some(jump) = exit_jump {
            self.change_operand(jump, &[end]);
        }
        let finished = self.cur().loops.pop().expect("loop context");
        for jump in finished.break_jumps {
            self.change_operand(jump, &[end]);
        }
        for jump in finished.continue_jumps {
            self.change_operand(jump, &[post_label as i64]);
        }
        self.leave_block();
        Ok(())
    }

    /// Lowers `for k, v in x { … }` to an explicit iterator loop over the
    /// reserved `:it` local.
    fn compile_for_in(
        &mut self,
        key: &str,
        value: &str,
        iterable: &Expr,
        body: &Block,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        self.enter_block();
        self.compile_expr(iterable)?;
        self.emit(OpCode::IterInit, &[], location)?;
        let (iter_sym, _) = self
            .symbol_table
            .define_local(ITER_LOCAL)
            .map_err(|msg| CompileError::compile(msg, location))?;
        self.emit(OpCode::DefineLocal, &[iter_sym.index as i64], location)?;

        let key_sym = if key != "_" {
            let (symbol, _) = self
                .symbol_table
                .define_local(key)
                .map_err(|msg| CompileError::compile(msg, location))?;
            Some(symbol)
        } else {
            None
        };
        let value_sym = if value != "_" {
            let (symbol, _) = self
                .symbol_table
                .define_local(value)
                .map_err(|msg| CompileError::compile(msg, location))?;
            Some(symbol)
        } else {
            None
        };

        let loop_label = self.offset();
        self.emit(OpCode::GetLocal, &[iter_sym.index as i64], location)?;
        self.emit(OpCode::IterNext, &[], location)?;
        let exit_jump = self.emit(OpCode::JumpFalsy, &[0], location)?;
        if let Some(symbol) = &key_sym {
            self.emit(OpCode::GetLocal, &[iter_sym.index as i64], location)?;
            self.emit(OpCode::IterKey, &[], location)?;
            self.emit(OpCode::SetLocal, &[symbol.index as i64], location)?;
        }
        if let Some(symbol) = &value_sym {
            self.emit(OpCode::GetLocal, &[iter_sym.index as i64], location)?;
            self.emit(OpCode::IterValue, &[], location)?;
            self.emit(OpCode::SetLocal, &[symbol.index as i64], location)?;
        }

        let try_depth = self.cur().try_depth;
        self.cur().loops.push(LoopContext {
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
            try_depth,
        });

        self.compile_block(body)?;
        self.emit(OpCode::Jump, &[loop_label as i64], location)?;

        let end = self.offset() as i64;
        self.change_operand(exit_jump, &[end]);
        let finished = self.cur().loops.pop().expect("loop context");
        for jump in finished.break_jumps {
            self.change_operand(jump, &[end]);
        }
        for jump in finished.continue_jumps {
            self.change_operand(jump, &[loop_label as i64]);
        }
        self.leave_block();
        Ok(())
    }

    fn compile_branch(&mut self, token: Token, location: SourceLocation) -> Result<(), CompileError> {
        let ctx = self.funcs.last_mut().expect("function context");
        let Some(loop_ctx) = ctx.loops.last() else {
            return Err(CompileError::compile(
                format!("'{}' outside of a loop", token.symbol()),
                location,
            ));
        };
        let loop_try_depth = loop_ctx.try_depth;
        let cur_try_depth = ctx.try_depth;
        if cur_try_depth > loop_try_depth {
            // Branching out of try blocks runs their finally blocks first.
            self.emit(OpCode::Finalizer, &[loop_try_depth as i64], location)?;
        }
        let jump = self.emit(OpCode::Jump, &[0], location)?;
        let ctx = self.funcs.last_mut().expect("function context");
        let loop_ctx = ctx.loops.last_mut().expect("loop context");
        if token == Token::Break {
            loop_ctx.break_jumps.push(jump);
        } else {
            loop_ctx.continue_jumps.push(jump);
        }
        Ok(())
    }

    fn compile_return(
        &mut self,
        results: &[Expr],
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        let num_results: i64 = match results {
            [] => 0,
            [single] => {
                self.compile_expr(single)?;
                1
            }
            many => {
                // Multi-value return compiles to an array literal; the
                // receiver destructures it.
                for expr in many {
                    self.compile_expr(expr)?;
                }
                self.emit(OpCode::Array, &[many.len() as i64], location)?;
                1
            }
        };
        if self.cur().try_depth > 0 {
            self.emit(OpCode::Finalizer, &[0], location)?;
        }
        self.emit(OpCode::Return, &[num_results], location)?;
        Ok(())
    }

    // === Expressions ===

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::IntLit { value, location } => {
                self.emit_constant(Value::Int(*value), *location)
            }
            Expr::UintLit { value, location } => {
                self.emit_constant(Value::Uint(*value), *location)
            }
            Expr::FloatLit { value, location } => {
                self.emit_constant(Value::Float(*value), *location)
            }
            Expr::CharLit { value, location } => {
                self.emit_constant(Value::Char(*value), *location)
            }
            Expr::StringLit { value, location } => {
                self.emit_constant(Value::string(value.as_str()), *location)
            }
            Expr::BoolLit { value, location } => {
                let op = if *value { OpCode::True } else { OpCode::False };
                self.emit(op, &[], *location)?;
                Ok(())
            }
            Expr::UndefinedLit { location } => {
                self.emit(OpCode::Null, &[], *location)?;
                Ok(())
            }
            Expr::Ident { name, location } => self.compile_ident(name, *location),
            Expr::Array { elements, location } => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(OpCode::Array, &[elements.len() as i64], *location)?;
                Ok(())
            }
            Expr::Map { entries, location } => {
                for entry in entries {
                    self.emit_constant(Value::string(entry.key.as_str()), entry.location)?;
                    self.compile_expr(&entry.value)?;
                }
                self.emit(OpCode::Map, &[entries.len() as i64], *location)?;
                Ok(())
            }
            Expr::Paren { expr, .. } => self.compile_expr(expr),
            Expr::Binary { token, left, right, location } => {
                self.compile_binary(*token, left, right, *location)
            }
            Expr::Unary { token, expr, location } => {
                self.compile_expr(expr)?;
                self.emit(OpCode::Unary, &[token.id() as i64], *location)?;
                Ok(())
            }
            Expr::Selector { expr, sel, location } => {
                self.compile_expr(expr)?;
                self.emit_constant(Value::string(sel.as_str()), *location)?;
                self.emit(OpCode::GetIndex, &[1], *location)?;
                Ok(())
            }
            Expr::Index { expr, index, location } => {
                self.compile_expr(expr)?;
                self.compile_expr(index)?;
                self.emit(OpCode::GetIndex, &[1], *location)?;
                Ok(())
            }
            Expr::Slice { expr, low, high, location } => {
                self.compile_expr(expr)?;
                match low {
                    Some(low) => self.compile_expr(low)?,
                    None => {
                        self.emit(OpCode::Null, &[], *location)?;
                    }
                }
                match high {
                    Some(high) => self.compile_expr(high)?,
                    None => {
                        self.emit(OpCode::Null, &[], *location)?;
                    }
                }
                self.emit(OpCode::SliceIndex, &[], *location)?;
                Ok(())
            }
            Expr::FuncLit { params, body, location } => {
                self.compile_func_lit(&params.names, params.variadic, body, *location)
            }
            Expr::Call { func, args, expand, location } => {
                self.compile_call(func, args, *expand, *location)
            }
            Expr::Import { module, location } => self.compile_import(module, *location),
            Expr::Cond { cond, true_expr, false_expr, location } => {
                if let Expr::BoolLit { value, .. } = cond.as_ref() {
                    // Same dead-arm elision as `if` statements.
                    return if *value {
                        self.compile_expr(true_expr)
                    } else {
                        self.compile_expr(false_expr)
                    };
                }
                self.compile_expr(cond)?;
                let falsy_jump = self.emit(OpCode::JumpFalsy, &[0], *location)?;
                self.compile_expr(true_expr)?;
                let end_jump = self.emit(OpCode::Jump, &[0], *location)?;
                self.patch_jump(falsy_jump);
                self.compile_expr(false_expr)?;
                self.patch_jump(end_jump);
                Ok(())
            }
        }
    }

    fn compile_ident(&mut self, name: &str, location: SourceLocation) -> Result<(), CompileError> {
        // `iota` resolves to the spec index inside a const group unless a
        // user symbol shadows it.
        if name == "iota" {
            if let Some(iota) = self.iota {
                if self.symbol_table.resolve("iota").is_none() {
                    return self.emit_constant(Value::Int(iota), location);
                }
            }
        }
        let symbol = self.symbol_table.resolve(name).ok_or_else(|| {
            CompileError::compile(format!("unresolved reference '{}'", name), location)
        })?;
        match symbol.scope {
            SymbolScope::Local => {
                self.emit(OpCode::GetLocal, &[symbol.index as i64], location)?;
            }
            SymbolScope::Free => {
                self.emit(OpCode::GetFree, &[symbol.index as i64], location)?;
            }
            SymbolScope::Global => {
                let index = self.add_constant(Value::string(name)) as i64;
                self.emit(OpCode::GetGlobal, &[index], location)?;
            }
            SymbolScope::Builtin => {
                self.emit(OpCode::GetBuiltin, &[symbol.index as i64], location)?;
            }
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        token: Token,
        left: &Expr,
        right: &Expr,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        match token {
            // Short-circuit operators leave the deciding value on the
            // stack when they jump.
            Token::LAnd => {
                self.compile_expr(left)?;
                let jump = self.emit(OpCode::AndJump, &[0], location)?;
                self.compile_expr(right)?;
                self.patch_jump(jump);
                Ok(())
            }
            Token::LOr => {
                self.compile_expr(left)?;
                let jump = self.emit(OpCode::OrJump, &[0], location)?;
                self.compile_expr(right)?;
                self.patch_jump(jump);
                Ok(())
            }
            Token::Equal => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(OpCode::Equal, &[], location)?;
                Ok(())
            }
            Token::NotEqual => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(OpCode::NotEqual, &[], location)?;
                Ok(())
            }
            _ => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(OpCode::BinaryOp, &[token.id() as i64], location)?;
                Ok(())
            }
        }
    }

    fn compile_func_lit(
        &mut self,
        params: &[String],
        variadic: bool,
        body: &Block,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.enter_function();
        self.funcs.push(FuncContext { variadic, ..Default::default() });

        let result = (|| -> Result<(), CompileError> {
            self.symbol_table
                .set_params(params)
                .map_err(|msg| CompileError::compile(msg, location))?;
            self.compile_stmts(&body.stmts)?;
            self.finish_function(location)
        })();

        let ctx = self.funcs.pop().expect("function context");
        let num_params = self.symbol_table.num_params() as usize;
        let num_locals = (self.symbol_table.max_symbols() as usize).max(num_params);
        let free_symbols: Vec<Symbol> = self.symbol_table.free_symbols().to_vec();
        let variadic = ctx.variadic;
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.leave().expect("function scope has a parent");
        result?;

        let func = CompiledFunction::new(
            num_params,
            num_locals,
            variadic,
            ctx.instructions,
            ctx.source_map,
        );
        let index = self.add_constant(Value::Function(Arc::new(func))) as i64;

        if free_symbols.is_empty() {
            self.emit(OpCode::Constant, &[index], location)?;
            return Ok(());
        }
        // Capture each free variable as a cell in the enclosing frame.
        let num_free = free_symbols.len() as i64;
        for symbol in &free_symbols {
            let op = match symbol.scope {
                SymbolScope::Local => OpCode::GetLocalPtr,
                SymbolScope::Free => OpCode::GetFreePtr,
                _ => {
                    return Err(CompileError::compile(
                        format!("cannot capture '{}'", symbol.name),
                        location,
                    ))
                }
            };
            self.emit(op, &[symbol.index as i64], location)?;
        }
        self.emit(OpCode::Closure, &[index, num_free], location)?;
        Ok(())
    }

    fn compile_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        expand: bool,
        location: SourceLocation,
    ) -> Result<(), CompileError> {
        let expand = expand as i64;
        // Method-style calls dispatch by name so host objects can
        // intercept them.
        if let Expr::Selector { expr: receiver, sel, location: sel_location } = func {
            self.compile_expr(receiver)?;
            for arg in args {
                self.compile_expr(arg)?;
            }
            self.emit_constant(Value::string(sel.as_str()), *sel_location)?;
            self.emit(OpCode::CallName, &[args.len() as i64, expand], location)?;
            return Ok(());
        }
        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.emit(OpCode::Call, &[args.len() as i64, expand], location)?;
        Ok(())
    }

    fn compile_import(&mut self, name: &str, location: SourceLocation) -> Result<(), CompileError> {
        let item = match self.module_store.get(name) {
            Some(item) => item.clone(),
            None => self.register_module(name, location)?,
        };
        self.emit(
            OpCode::LoadModule,
            &[item.constant_index as i64, item.module_index as i64],
            location,
        )?;
        let cached_jump = self.emit(OpCode::JumpFalsy, &[0], location)?;
        if item.kind == ModuleKind::Source {
            self.emit(OpCode::Call, &[0, 0], location)?;
        }
        self.emit(OpCode::StoreModule, &[item.module_index as i64], location)?;
        self.patch_jump(cached_jump);
        Ok(())
    }

    fn register_module(
        &mut self,
        name: &str,
        location: SourceLocation,
    ) -> Result<crate::module::ModuleStoreItem, CompileError> {
        let importable = self.module_map.get(name).ok_or_else(|| {
            CompileError::compile(format!("module '{}' not found", name), location)
        })?;
        match importable {
            Importable::Value(value) => {
                let index = self.add_constant(value);
                Ok(self.module_store.insert(name, ModuleKind::Object, index))
            }
            Importable::Source(bytes) => {
                if self.compiling.iter().any(|m| m == name) {
                    return Err(CompileError::compile(
                        format!("cyclic import of module '{}'", name),
                        location,
                    ));
                }
                let text = std::str::from_utf8(&bytes).map_err(|_| {
                    CompileError::compile(
                        format!("module '{}' is not valid UTF-8", name),
                        location,
                    )
                })?;
                let mut file = parse_source(text)?;
                if !self.no_optimize {
                    self.optimize(&mut file)?;
                }
                self.compiling.push(name.to_string());
                let result = self.compile_module_function(&file);
                self.compiling.pop();
                let func = result?;
                let index = self.add_constant(Value::Function(Arc::new(func)));
                Ok(self.module_store.insert(name, ModuleKind::Source, index))
            }
        }
    }

    /// Compiles a module source as a zero-parameter function with its own
    /// root scope; its return value becomes the module value.
    fn compile_module_function(&mut self, file: &File) -> Result<CompiledFunction, CompileError> {
        let saved_table = std::mem::replace(&mut self.symbol_table, SymbolTable::new());
        self.funcs.push(FuncContext::default());

        let result = (|| -> Result<(), CompileError> {
            self.compile_stmts(&file.stmts)?;
            self.finish_function(SourceLocation::unknown())
        })();

        let ctx = self.funcs.pop().expect("module function context");
        let num_params = self.symbol_table.num_params() as usize;
        let num_locals = (self.symbol_table.max_symbols() as usize).max(num_params);
        self.symbol_table = saved_table;
        result?;

        Ok(CompiledFunction::new(
            num_params,
            num_locals,
            false,
            ctx.instructions,
            ctx.source_map,
        ))
    }
}

/// A selector-chain element: a static field name or a computed index.
enum IndexKey<'a> {
    Name(&'a String, SourceLocation),
    Expr(&'a Expr),
}

/// Flattens `a.b[i].c` into the base expression plus its key chain,
/// outermost last.
fn flatten_selectors(expr: &Expr) -> (&Expr, Vec<IndexKey>) {
    let mut keys = Vec::new();
    let mut cur = expr;
    loop {
        match cur {
            Expr::Selector { expr, sel, location } => {
                keys.push(IndexKey::Name(sel, *location));
                cur = expr;
            }
            Expr::Index { expr, index, .. } => {
                keys.push(IndexKey::Expr(index));
                cur = expr;
            }
            _ => break,
        }
    }
    keys.reverse();
    (cur, keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Bytecode {
        compile(source.as_bytes(), CompilerOptions::default()).expect("compile failed")
    }

    fn compile_err(source: &str) -> CompileError {
        compile(source.as_bytes(), CompilerOptions::default()).expect_err("expected error")
    }

    #[test]
    fn test_constant_dedup() {
        let bytecode = compile_ok("a := 42; b := 42; c := \"x\"; d := \"x\"");
        let ints = bytecode
            .constants
            .iter()
            .filter(|v| matches!(v, Value::Int(42)))
            .count();
        let strs = bytecode
            .constants
            .iter()
            .filter(|v| matches!(v, Value::String(s) if &**s == "x"))
            .count();
        assert_eq!(ints, 1);
        assert_eq!(strs, 1);
    }

    #[test]
    fn test_identical_function_constants_dedup_across_fragments() {
        // Recompiling the same fragment against a seeded pool (the Eval
        // flow) must not grow the pool with an identical function.
        let source = "f := func(a) { return a }";
        let bytecode = compile_ok(source);
        let pool_size = bytecode.constants.len();
        let reseeded = compile(
            source.as_bytes(),
            CompilerOptions { constants: Some(bytecode.constants), ..Default::default() },
        )
        .unwrap();
        assert_eq!(reseeded.constants.len(), pool_size);
    }

    #[test]
    fn test_terminator_appended() {
        let bytecode = compile_ok("a := 1");
        let insts = &bytecode.main.instructions;
        assert_eq!(insts[insts.len() - 2], OpCode::Return as u8);
        assert_eq!(insts[insts.len() - 1], 0);
    }

    #[test]
    fn test_assignment_to_const_fails() {
        let err = compile_err("const a = 1; a = 2");
        assert!(err.message.contains("constant"));
        let err = compile_err("const a = 1; a := 2");
        assert!(err.message.contains("constant"));
        let err = compile_err("const a = 1; a += 2");
        assert!(err.message.contains("constant"));
    }

    #[test]
    fn test_dead_arm_not_compiled() {
        // The dead arm would not resolve; literal conditions skip it.
        assert!(compile(
            "if false { missing_name() }".as_bytes(),
            CompilerOptions::default()
        )
        .is_ok());
    }

    #[test]
    fn test_unresolved_reference() {
        let err = compile_err("a := b");
        assert!(err.message.contains("unresolved reference 'b'"));
    }

    #[test]
    fn test_param_rules() {
        let err = compile_err("if true { param x }");
        assert!(err.message.contains("param"));
        let err = compile_err("f := func(a) { if a { param x } }");
        assert!(err.message.contains("param"));
        assert!(compile("param (a, ...rest)".as_bytes(), CompilerOptions::default()).is_ok());
    }

    #[test]
    fn test_global_rules() {
        let err = compile_err("f := func() { global x }");
        assert!(err.message.contains("global"));
        let err = compile_err("global x; global x");
        assert!(err.message.contains("redeclared"));
    }

    #[test]
    fn test_branch_outside_loop() {
        let err = compile_err("break");
        assert!(err.message.contains("outside of a loop"));
    }

    #[test]
    fn test_multi_expression_rhs_rejected() {
        let err = compile_err("x, y := 1, 2");
        assert!(err.message.contains("right side"));
    }

    #[test]
    fn test_define_with_selector_rejected() {
        let err = compile_err("m := {}; m.x := 1");
        assert!(err.kind == crate::errors::CompileErrorKind::Parse
            || err.message.contains(":="));
    }

    #[test]
    fn test_module_not_found() {
        let err = compile_err(r#"x := import("missing")"#);
        assert!(err.message.contains("module 'missing' not found"));
    }

    #[test]
    fn test_cyclic_import_detected() {
        let mut modules = ModuleMap::new();
        modules.add_source("a", r#"x := import("b"); return x"#);
        modules.add_source("b", r#"x := import("a"); return x"#);
        let err = compile(
            r#"x := import("a")"#.as_bytes(),
            CompilerOptions { module_map: Some(modules), ..Default::default() },
        )
        .expect_err("expected cyclic import error");
        assert!(err.message.contains("cyclic import"));
    }

    #[test]
    fn test_module_store_is_shared() {
        let mut modules = ModuleMap::new();
        modules.add_source("m", "return 1");
        let bytecode = compile(
            r#"a := import("m"); b := import("m")"#.as_bytes(),
            CompilerOptions { module_map: Some(modules), ..Default::default() },
        )
        .unwrap();
        assert_eq!(bytecode.num_modules, 1);
    }

    #[test]
    fn test_closure_emission() {
        let bytecode = compile_ok("n := 1; f := func() { return n }");
        let text = crate::bytecode::disassemble(&bytecode.main.instructions);
        assert!(text.contains("GetLocalPtr 0"), "got:\n{}", text);
        assert!(text.contains("Closure"), "got:\n{}", text);
    }

    #[test]
    fn test_short_circuit_uses_and_or_jumps() {
        // no_optimize keeps the literals from folding away.
        let bytecode = compile(
            "x := 1 && 2 || 3".as_bytes(),
            CompilerOptions { no_optimize: true, ..Default::default() },
        )
        .unwrap();
        let text = crate::bytecode::disassemble(&bytecode.main.instructions);
        assert!(text.contains("AndJump"));
        assert!(text.contains("OrJump"));
    }

    #[test]
    fn test_method_call_uses_call_name() {
        let bytecode = compile_ok("m := {}; m.f(1, 2)");
        let text = crate::bytecode::disassemble(&bytecode.main.instructions);
        assert!(text.contains("CallName 2 0"));
    }

    #[test]
    fn test_try_layout() {
        let bytecode = compile_ok("try { } catch err { } finally { }");
        let text = crate::bytecode::disassemble(&bytecode.main.instructions);
        assert!(text.contains("SetupTry"));
        assert!(text.contains("SetupCatch"));
        assert!(text.contains("SetupFinally"));
        assert!(text.contains("Throw 0"));
    }

    #[test]
    fn test_return_inside_try_emits_finalizer() {
        let bytecode = compile_ok("f := func() { try { return 1 } finally { } }");
        let Value::Function(func) = &bytecode.constants[1] else {
            // Constant order: Int(1) first, then the function.
            panic!("expected function constant, got {:?}", bytecode.constants);
        };
        let text = crate::bytecode::disassemble(&func.instructions);
        assert!(text.contains("Finalizer 0"), "got:\n{}", text);
    }
}
