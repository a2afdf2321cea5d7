// File: src/invoker.rs
//
// Re-entrant invocation of script callables from host code.
// An Invoker binds a callee to a pool of child VMs that share the
// parent's constants, globals, module cache, and abort flag. The Eval
// helper layers REPL-style fragment execution on top: each fragment
// compiles into a function whose parameters are the locals captured from
// the previous fragment.

use crate::bytecode::{Bytecode, CompiledFunction, OpCode};
use crate::compiler::{compile_with_table, CompilerOptions};
use crate::errors::{CompileError, RuntimeError};
use crate::module::ModuleMap;
use crate::value::Value;
use crate::vm::Vm;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A handle for calling one script value repeatedly from host code.
///
/// Compiled callees need a VM; the pool hands out child instances and
/// wipes their execution state on release. `acquire`/`release` pin one
/// child for a burst of calls; without them every `invoke` borrows and
/// returns a pooled child.
pub struct Invoker {
    callee: Value,
    /// Prototype child carrying the shared state new pool members need.
    proto: Vm,
    pool: Mutex<Vec<Vm>>,
    acquired: Option<Vm>,
}

impl Invoker {
    pub fn new(vm: &Vm, callee: Value) -> Self {
        Self {
            callee,
            proto: vm.child(),
            pool: Mutex::new(Vec::new()),
            acquired: None,
        }
    }

    fn take_vm(&mut self) -> Vm {
        self.pool.lock().unwrap().pop().unwrap_or_else(|| self.proto.child())
    }

    /// Pins a child VM for subsequent invokes.
    pub fn acquire(&mut self) {
        if self.acquired.is_none() {
            self.acquired = Some(self.take_vm());
        }
    }

    /// Returns the pinned child (if any) to the pool.
    pub fn release(&mut self) {
        if let Some(mut vm) = self.acquired.take() {
            vm.reset();
            self.pool.lock().unwrap().push(vm);
        }
    }

    pub fn invoke(&mut self, args: &[Value]) -> Result<Value, RuntimeError> {
        match self.callee.clone() {
            Value::Function(func) => {
                if let Some(vm) = self.acquired.as_mut() {
                    return vm.run_compiled_function(func, Value::Undefined, args);
                }
                let mut vm = self.take_vm();
                let result = vm.run_compiled_function(func, Value::Undefined, args);
                vm.reset();
                self.pool.lock().unwrap().push(vm);
                result
            }
            // Non-compiled callables dispatch directly, no VM needed.
            Value::Builtin(builtin) => builtin.call(args),
            Value::Native(native) => (native.func)(args),
            other => Err(RuntimeError::not_callable(other.type_name())),
        }
    }
}

impl Drop for Invoker {
    fn drop(&mut self) {
        self.release();
    }
}

/// Compile-or-run failure from `Eval::eval`.
#[derive(Debug)]
pub enum EvalError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvalError::Compile(err) => err.fmt(f),
            EvalError::Runtime(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<CompileError> for EvalError {
    fn from(err: CompileError) -> Self {
        EvalError::Compile(err)
    }
}

impl From<RuntimeError> for EvalError {
    fn from(err: RuntimeError) -> Self {
        EvalError::Runtime(err)
    }
}

/// REPL-style incremental evaluation preserving locals between fragments.
///
/// Each fragment compiles into a main function whose parameters are the
/// locals captured so far; after the run the (possibly extended) local
/// set is captured again. A fragment ending in an expression statement
/// has its trailing `Pop; Return 0` patched to `NoOp; Return 1` so the
/// expression's value becomes the fragment's result.
pub struct Eval {
    module_map: ModuleMap,
    globals: Value,
    constants: Vec<Value>,
    local_names: Vec<String>,
    locals: Vec<Value>,
    no_optimize: bool,
}

impl Eval {
    pub fn new(module_map: ModuleMap, globals: Value) -> Self {
        Self {
            module_map,
            globals,
            constants: Vec::new(),
            local_names: Vec::new(),
            locals: Vec::new(),
            no_optimize: false,
        }
    }

    pub fn set_no_optimize(&mut self, no_optimize: bool) {
        self.no_optimize = no_optimize;
    }

    pub fn globals(&self) -> Value {
        self.globals.clone()
    }

    pub fn eval(&mut self, source: &str) -> Result<Value, EvalError> {
        let options = CompilerOptions {
            module_map: Some(self.module_map.clone()),
            constants: Some(self.constants.clone()),
            main_params: self.local_names.clone(),
            no_optimize: self.no_optimize,
            ..Default::default()
        };
        let (bytecode, table) = compile_with_table(source.as_bytes(), "(eval)", options)?;
        let bytecode = patch_last_expression(bytecode);

        let mut vm = Vm::new(Arc::new(bytecode));
        let result = vm.run(self.globals.clone(), &self.locals)?;

        // Capture the fragment's locals for the next round, pairing each
        // surviving name with the value in its slot.
        let mut slots = Vec::new();
        vm.get_locals(&mut slots);
        let names = table.local_names_by_index();
        self.local_names = names.iter().map(|(name, _)| name.clone()).collect();
        self.locals = names
            .iter()
            .map(|(_, index)| slots.get(*index as usize).cloned().unwrap_or(Value::Undefined))
            .collect();
        self.constants = vm.bytecode().constants.clone();
        Ok(result)
    }
}

/// Rewrites a trailing `Pop; Return 0` into `NoOp; Return 1` so the last
/// expression statement becomes the fragment's return value.
fn patch_last_expression(bytecode: Bytecode) -> Bytecode {
    let insts = &bytecode.main.instructions;
    let n = insts.len();
    // Walk instruction boundaries; a trailing operand byte may alias the
    // Pop opcode, so raw byte inspection is not enough.
    let mut pos = 0;
    let mut tail_is_pop_return = false;
    while pos < n {
        let Some(op) = OpCode::from_u8(insts[pos]) else {
            return bytecode;
        };
        let (operands, next) = crate::bytecode::read_operands(op, insts, pos);
        if op == OpCode::Pop && pos == n - 3 {
            tail_is_pop_return = next == n - 2
                && insts[n - 2] == OpCode::Return as u8
                && operands.is_empty()
                && insts[n - 1] == 0;
        }
        pos = next;
    }
    if !tail_is_pop_return {
        return bytecode;
    }
    let mut patched = insts.to_vec();
    patched[n - 3] = OpCode::NoOp as u8;
    patched[n - 1] = 1;
    let main = CompiledFunction::new(
        bytecode.main.num_params,
        bytecode.main.num_locals,
        bytecode.main.variadic,
        patched,
        (*bytecode.main.source_map).clone(),
    );
    Bytecode {
        file_name: bytecode.file_name,
        constants: bytecode.constants,
        main: Arc::new(main),
        num_modules: bytecode.num_modules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompilerOptions};

    fn vm_for(source: &str) -> Vm {
        let bytecode = compile(source.as_bytes(), CompilerOptions::default()).unwrap();
        Vm::new(Arc::new(bytecode))
    }

    #[test]
    fn test_invoker_calls_compiled_function() {
        let mut vm = vm_for("return func(a, b) { return a * b }");
        let callee = vm.run(Value::empty_map(), &[]).unwrap();
        assert!(matches!(callee, Value::Function(_)));

        let mut invoker = Invoker::new(&vm, callee);
        let result = invoker.invoke(&[Value::Int(6), Value::Int(7)]).unwrap();
        assert_eq!(result, Value::Int(42));
        // Pooled child is reusable.
        let result = invoker.invoke(&[Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(result, Value::Int(6));
    }

    #[test]
    fn test_invoker_acquire_release() {
        let mut vm = vm_for("return func(n) { return n + 1 }");
        let callee = vm.run(Value::empty_map(), &[]).unwrap();
        let mut invoker = Invoker::new(&vm, callee);
        invoker.acquire();
        for i in 0..5 {
            let result = invoker.invoke(&[Value::Int(i)]).unwrap();
            assert_eq!(result, Value::Int(i + 1));
        }
        invoker.release();
    }

    #[test]
    fn test_invoker_shares_globals() {
        let mut vm = vm_for("global n; return func() { n = n + 1; return n }");
        let globals = Value::empty_map();
        globals.index_set(&Value::string("n"), Value::Int(0)).unwrap();
        let callee = vm.run(globals, &[]).unwrap();
        let mut invoker = Invoker::new(&vm, callee);
        assert_eq!(invoker.invoke(&[]).unwrap(), Value::Int(1));
        assert_eq!(invoker.invoke(&[]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_invoker_direct_builtin() {
        let vm = vm_for("return 0");
        let mut invoker =
            Invoker::new(&vm, Value::Builtin(crate::builtins::BuiltinFunction::Len));
        let result = invoker
            .invoke(&[Value::array(vec![Value::Int(1), Value::Int(2)])])
            .unwrap();
        assert_eq!(result, Value::Int(2));
    }

    #[test]
    fn test_eval_preserves_locals() {
        let mut eval = Eval::new(ModuleMap::new(), Value::empty_map());
        eval.eval("x := 40").unwrap();
        eval.eval("y := 2").unwrap();
        let result = eval.eval("x + y").unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn test_eval_returns_last_expression() {
        let mut eval = Eval::new(ModuleMap::new(), Value::empty_map());
        assert_eq!(eval.eval("1 + 2").unwrap(), Value::Int(3));
        // A fragment ending in a declaration has no expression value.
        assert_eq!(eval.eval("z := 9").unwrap(), Value::Undefined);
        assert_eq!(eval.eval("z").unwrap(), Value::Int(9));
    }

    #[test]
    fn test_eval_mutates_earlier_locals() {
        let mut eval = Eval::new(ModuleMap::new(), Value::empty_map());
        eval.eval("n := 1").unwrap();
        eval.eval("n = n + 10").unwrap();
        assert_eq!(eval.eval("n").unwrap(), Value::Int(11));
    }
}
