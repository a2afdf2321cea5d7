// File: src/vm.rs
//
// Stack-based virtual machine executing uGO bytecode.
// A fixed operand stack and a fixed frame array; per-frame error handler
// stacks drive try/catch/finally, including return-through-finally; a
// cooperative atomic abort flag is observed between instructions; direct
// self-recursion in tail position reuses the current frame.

use crate::builtins::BuiltinFunction;
use crate::bytecode::{Bytecode, CompiledFunction, OpCode};
use crate::errors::{ErrorKind, RuntimeError};
use crate::token::Token;
use crate::value::{binary_op, new_cell, unary_op, Value, ValueIterator};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Operand stack capacity.
pub const STACK_SIZE: usize = 2048;
/// Call depth capacity.
pub const MAX_FRAMES: usize = 1024;

/// Per-VM lazily populated module values, shared with pooled child VMs.
pub type ModuleCache = Arc<Mutex<Vec<Option<Value>>>>;

/// One installed try handler. Offsets are disarmed (zeroed) as execution
/// enters the corresponding block.
#[derive(Debug, Clone)]
struct ErrorHandler {
    /// Stack pointer snapshot taken at SetupTry.
    sp: usize,
    catch: usize,
    finally: usize,
}

/// A pending break/continue/return routed through finally blocks.
#[derive(Debug, Clone, Copy)]
struct PendingBranch {
    /// Handler-stack floor: handlers above it run their finally first.
    floor: usize,
    ip: usize,
    sp: usize,
}

struct Frame {
    func: Arc<CompiledFunction>,
    /// Next instruction offset.
    ip: usize,
    /// Offset of the instruction currently executing, for traces.
    cur_ip: usize,
    /// Locals live at stack[bp..bp+num_locals].
    bp: usize,
    handlers: Vec<ErrorHandler>,
    /// Error travelling towards this frame's catch/finally. Dropped with
    /// the frame, which is how a return inside finally suppresses it.
    pending_error: Option<RuntimeError>,
    /// Branch travelling through this frame's finally blocks.
    pending_branch: Option<PendingBranch>,
}

impl Frame {
    fn new(func: Arc<CompiledFunction>, bp: usize) -> Self {
        Self {
            func,
            ip: 0,
            cur_ip: 0,
            bp,
            handlers: Vec::new(),
            pending_error: None,
            pending_branch: None,
        }
    }
}

enum Flow {
    Continue,
    /// The main frame returned.
    Finished(Value),
}

pub struct Vm {
    bytecode: Arc<Bytecode>,
    stack: Vec<Value>,
    sp: usize,
    frames: Vec<Frame>,
    globals: Value,
    module_cache: ModuleCache,
    abort: Arc<AtomicBool>,
    recover_panics: bool,
    /// Main-frame locals preserved across `run` for GetLocals/Eval.
    last_locals: Vec<Value>,
}

impl Vm {
    pub fn new(bytecode: Arc<Bytecode>) -> Self {
        let num_modules = bytecode.num_modules;
        Self {
            bytecode,
            stack: vec![Value::Undefined; STACK_SIZE],
            sp: 0,
            frames: Vec::with_capacity(64),
            globals: Value::empty_map(),
            module_cache: Arc::new(Mutex::new(vec![None; num_modules])),
            abort: Arc::new(AtomicBool::new(false)),
            recover_panics: false,
            last_locals: Vec::new(),
        }
    }

    /// A child VM sharing constants, module cache, globals, and the abort
    /// flag; used by the invoker pool.
    pub(crate) fn child(&self) -> Vm {
        Vm {
            bytecode: self.bytecode.clone(),
            stack: vec![Value::Undefined; STACK_SIZE],
            sp: 0,
            frames: Vec::with_capacity(64),
            globals: self.globals.clone(),
            module_cache: self.module_cache.clone(),
            abort: self.abort.clone(),
            recover_panics: self.recover_panics,
            last_locals: Vec::new(),
        }
    }

    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }

    /// Replaces the program. Execution state and the module cache reset.
    pub fn set_bytecode(&mut self, bytecode: Arc<Bytecode>) {
        *self.module_cache.lock().unwrap() = vec![None; bytecode.num_modules];
        self.bytecode = bytecode;
        self.clear();
    }

    /// Resets execution state: stack, frames, pending error/branch, the
    /// abort flag, and the module cache.
    pub fn clear(&mut self) {
        for slot in &mut self.stack[..self.sp] {
            *slot = Value::Undefined;
        }
        self.sp = 0;
        self.frames.clear();
        self.last_locals.clear();
        self.abort.store(false, Ordering::Relaxed);
        let mut cache = self.module_cache.lock().unwrap();
        for slot in cache.iter_mut() {
            *slot = None;
        }
    }

    /// Pool-release reset: wipes execution state but leaves the shared
    /// module cache, globals, and abort flag untouched.
    pub(crate) fn reset(&mut self) {
        for slot in &mut self.stack[..self.sp] {
            *slot = Value::Undefined;
        }
        self.sp = 0;
        self.frames.clear();
        self.last_locals.clear();
    }

    /// Converts host-runtime panics inside the loop into runtime errors
    /// that unwind to the nearest try.
    pub fn set_recover(&mut self, recover: bool) {
        self.recover_panics = recover;
    }

    /// Requests cooperative termination; observable from any thread.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// The shared abort flag, for watcher threads that must not hold the
    /// VM itself (e.g. deadline timers).
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn get_globals(&self) -> Value {
        self.globals.clone()
    }

    /// Main-frame locals captured when the last run returned; the Eval
    /// helper feeds them back in as parameters.
    pub fn get_locals(&self, buf: &mut Vec<Value>) {
        buf.clear();
        buf.extend(self.last_locals.iter().cloned());
    }

    /// Runs the main function with the given globals object and arguments.
    pub fn run(&mut self, globals: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let main = self.bytecode.main.clone();
        self.run_compiled_function(main, globals, args)
    }

    /// Runs an arbitrary compiled function against this VM's bytecode.
    pub fn run_compiled_function(
        &mut self,
        func: Arc<CompiledFunction>,
        globals: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.frames.clear();
        for slot in &mut self.stack[..self.sp] {
            *slot = Value::Undefined;
        }
        self.sp = 0;
        if !matches!(globals, Value::Undefined) {
            self.globals = globals;
        }

        let num_locals = func.num_locals;
        let args = marshal_top_level_args(&func, args);
        for (i, slot) in self.stack[..num_locals].iter_mut().enumerate() {
            *slot = args.get(i).cloned().unwrap_or(Value::Undefined);
        }
        self.sp = num_locals;
        self.frames.push(Frame::new(func, 0));
        self.execute()
    }

    // === Dispatch loop ===

    fn execute(&mut self) -> Result<Value, RuntimeError> {
        loop {
            if self.abort.load(Ordering::Relaxed) {
                return Err(self.unwind_fatal(RuntimeError::aborted()));
            }
            let result = if self.recover_panics {
                catch_unwind(AssertUnwindSafe(|| self.step())).unwrap_or_else(|payload| {
                    Err(RuntimeError::new(
                        ErrorKind::Error,
                        format!("runtime panic: {}", panic_message(&payload)),
                    ))
                })
            } else {
                self.step()
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished(value)) => return Ok(value),
                Err(err) => {
                    if let Some(fatal) = self.raise(err) {
                        return Err(fatal);
                    }
                }
            }
        }
    }

    fn step(&mut self) -> Result<Flow, RuntimeError> {
        let (op, a, b) = {
            let frame = self.frames.last_mut().expect("active frame");
            let insts = frame.func.instructions.clone();
            if frame.ip >= insts.len() {
                // Defensive: the compiler's terminator makes this
                // unreachable for well-formed bytecode.
                return self.do_return(Value::Undefined);
            }
            frame.cur_ip = frame.ip;
            let op = OpCode::from_u8(insts[frame.ip]).ok_or_else(|| {
                RuntimeError::type_error(format!("illegal opcode {:#04x}", insts[frame.ip]))
            })?;
            let widths = op.operand_widths();
            let mut pos = frame.ip + 1;
            let mut operands = [0usize; 2];
            for (slot, &width) in operands.iter_mut().zip(widths) {
                let mut v = 0usize;
                for i in 0..width {
                    v = (v << 8) | insts[pos + i] as usize;
                }
                *slot = v;
                pos += width;
            }
            frame.ip = pos;
            (op, operands[0], operands[1])
        };

        match op {
            OpCode::Constant => {
                let value = self.bytecode.constants[a].clone();
                self.push(value)?;
            }
            OpCode::Null => self.push(Value::Undefined)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::GetLocal => {
                let bp = self.frames.last().expect("frame").bp;
                let value = match &self.stack[bp + a] {
                    Value::Ptr(cell) => cell.lock().unwrap().clone(),
                    other => other.clone(),
                };
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let value = self.pop();
                let bp = self.frames.last().expect("frame").bp;
                match &self.stack[bp + a] {
                    Value::Ptr(cell) => *cell.lock().unwrap() = value,
                    _ => self.stack[bp + a] = value,
                }
            }
            OpCode::DefineLocal => {
                let value = self.pop();
                let bp = self.frames.last().expect("frame").bp;
                self.stack[bp + a] = value;
            }
            OpCode::GetFree => {
                let cell = self.frames.last().expect("frame").func.free[a].clone();
                let value = cell.lock().unwrap().clone();
                self.push(value)?;
            }
            OpCode::SetFree => {
                let value = self.pop();
                let cell = self.frames.last().expect("frame").func.free[a].clone();
                *cell.lock().unwrap() = value;
            }
            OpCode::GetLocalPtr => {
                let bp = self.frames.last().expect("frame").bp;
                let cell = match &self.stack[bp + a] {
                    Value::Ptr(cell) => cell.clone(),
                    other => {
                        let cell = new_cell(other.clone());
                        self.stack[bp + a] = Value::Ptr(cell.clone());
                        cell
                    }
                };
                self.push(Value::Ptr(cell))?;
            }
            OpCode::GetFreePtr => {
                let cell = self.frames.last().expect("frame").func.free[a].clone();
                self.push(Value::Ptr(cell))?;
            }
            OpCode::GetGlobal => {
                let key = self.bytecode.constants[a].clone();
                let value = self.globals.index_get(&key)?;
                self.push(value)?;
            }
            OpCode::SetGlobal => {
                let value = self.pop();
                let key = self.bytecode.constants[a].clone();
                self.globals.index_set(&key, value)?;
            }
            OpCode::GetBuiltin => {
                let builtin = BuiltinFunction::from_id(a as u8).ok_or_else(|| {
                    RuntimeError::type_error(format!("unknown builtin id {}", a))
                })?;
                self.push(builtin.value())?;
            }
            OpCode::BinaryOp => {
                let token = Token::from_id(a as u8).ok_or_else(|| {
                    RuntimeError::type_error(format!("unknown operator id {}", a))
                })?;
                let right = self.pop();
                let left = self.pop();
                let result = binary_op(token, &left, &right).map_err(|err| {
                    if err.kind == ErrorKind::InvalidOperator {
                        RuntimeError::invalid_operator(
                            token.symbol(),
                            left.type_name(),
                            right.type_name(),
                        )
                    } else {
                        err
                    }
                })?;
                self.push(result)?;
            }
            OpCode::Unary => {
                let token = Token::from_id(a as u8).ok_or_else(|| {
                    RuntimeError::type_error(format!("unknown operator id {}", a))
                })?;
                let operand = self.pop();
                let result = unary_op(token, &operand)?;
                self.push(result)?;
            }
            OpCode::Equal => {
                let right = self.pop();
                let left = self.pop();
                self.push(Value::Bool(left.equal(&right)))?;
            }
            OpCode::NotEqual => {
                let right = self.pop();
                let left = self.pop();
                self.push(Value::Bool(!left.equal(&right)))?;
            }
            OpCode::Jump => {
                self.frames.last_mut().expect("frame").ip = a;
            }
            OpCode::JumpFalsy => {
                let value = self.pop();
                if value.is_falsy() {
                    self.frames.last_mut().expect("frame").ip = a;
                }
            }
            OpCode::AndJump => {
                if self.stack[self.sp - 1].is_falsy() {
                    // Short-circuit keeps the deciding value as the result.
                    self.frames.last_mut().expect("frame").ip = a;
                } else {
                    self.pop();
                }
            }
            OpCode::OrJump => {
                if self.stack[self.sp - 1].is_falsy() {
                    self.pop();
                } else {
                    self.frames.last_mut().expect("frame").ip = a;
                }
            }
            OpCode::Array => {
                let mut elements = Vec::with_capacity(a);
                for slot in &mut self.stack[self.sp - a..self.sp] {
                    elements.push(std::mem::replace(slot, Value::Undefined));
                }
                self.sp -= a;
                self.push(Value::array(elements))?;
            }
            OpCode::Map => {
                let mut map = ahash::AHashMap::with_capacity(a);
                let base = self.sp - 2 * a;
                for i in 0..a {
                    let key =
                        std::mem::replace(&mut self.stack[base + 2 * i], Value::Undefined);
                    let value =
                        std::mem::replace(&mut self.stack[base + 2 * i + 1], Value::Undefined);
                    map.insert(key.to_string(), value);
                }
                self.sp = base;
                self.push(Value::map(map))?;
            }
            OpCode::GetIndex => {
                let base_slot = self.sp - a - 1;
                let mut value =
                    std::mem::replace(&mut self.stack[base_slot], Value::Undefined);
                for i in 0..a {
                    let key = std::mem::replace(
                        &mut self.stack[base_slot + 1 + i],
                        Value::Undefined,
                    );
                    value = value.index_get(&key)?;
                }
                self.sp = base_slot;
                self.push(value)?;
            }
            OpCode::SetIndex => {
                let index = self.pop();
                let target = self.pop();
                let value = self.pop();
                target.index_set(&index, value)?;
            }
            OpCode::SliceIndex => {
                let high = self.pop();
                let low = self.pop();
                let base = self.pop();
                let result = slice_value(&base, &low, &high)?;
                self.push(result)?;
            }
            OpCode::Call => self.do_call(a, b == 1, None)?,
            OpCode::CallName => {
                let name = self.pop().to_string();
                self.do_call(a, b == 1, Some(name))?;
            }
            OpCode::Return => {
                let value = if a == 1 { self.pop() } else { Value::Undefined };
                return self.do_return(value);
            }
            OpCode::Closure => {
                let template = match &self.bytecode.constants[a] {
                    Value::Function(func) => func.clone(),
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "closure constant is '{}'",
                            other.type_name()
                        )))
                    }
                };
                let mut free = Vec::with_capacity(b);
                let base = self.sp - b;
                for slot in &mut self.stack[base..self.sp] {
                    match std::mem::replace(slot, Value::Undefined) {
                        Value::Ptr(cell) => free.push(cell),
                        other => {
                            return Err(RuntimeError::type_error(format!(
                                "closure capture is '{}'",
                                other.type_name()
                            )))
                        }
                    }
                }
                self.sp = base;
                let instance = template.with_free(free);
                self.push(Value::Function(Arc::new(instance)))?;
            }
            OpCode::IterInit => {
                let value = self.pop();
                let iterator = value
                    .iterate()
                    .ok_or_else(|| RuntimeError::not_iterable(value.type_name()))?;
                self.push(Value::Iterator(Arc::new(Mutex::new(iterator))))?;
            }
            OpCode::IterNext => {
                let value = self.pop();
                let has_next = with_iterator(&value, ValueIterator::next)?;
                self.push(Value::Bool(has_next))?;
            }
            OpCode::IterKey => {
                let value = self.pop();
                let key = with_iterator(&value, |it| it.key())?;
                self.push(key)?;
            }
            OpCode::IterValue => {
                let value = self.pop();
                let current = with_iterator(&value, |it| it.value())?;
                self.push(current)?;
            }
            OpCode::LoadModule => {
                let cached = self.module_cache.lock().unwrap()[b].clone();
                match cached {
                    Some(value) => {
                        self.push(value)?;
                        self.push(Value::Bool(false))?;
                    }
                    None => {
                        let constant = self.bytecode.constants[a].clone();
                        self.push(constant)?;
                        self.push(Value::Bool(true))?;
                    }
                }
            }
            OpCode::StoreModule => {
                let value = self.stack[self.sp - 1].clone();
                // Copier values are stored isolated so later imports do
                // not observe mutations of the first import's value.
                let stored = if value.is_copier() { value.deep_copy() } else { value };
                self.module_cache.lock().unwrap()[a] = Some(stored);
            }
            OpCode::SetupTry => {
                let sp = self.sp;
                let frame = self.frames.last_mut().expect("frame");
                frame.handlers.push(ErrorHandler { sp, catch: a, finally: b });
            }
            OpCode::SetupCatch => {
                let frame = self.frames.last_mut().expect("frame");
                let error_value = frame
                    .pending_error
                    .take()
                    .map(|err| Value::from_runtime_error(&err))
                    .unwrap_or(Value::Undefined);
                if let Some(handler) = frame.handlers.last_mut() {
                    handler.catch = 0;
                }
                self.push(error_value)?;
            }
            OpCode::SetupFinally => {
                let frame = self.frames.last_mut().expect("frame");
                if let Some(handler) = frame.handlers.last_mut() {
                    handler.catch = 0;
                    handler.finally = 0;
                }
            }
            OpCode::Throw => {
                if a == 1 {
                    let value = self.pop();
                    return Err(value.to_runtime_error());
                }
                // Implicit re-throw at the end of a finally block.
                let frame = self.frames.last_mut().expect("frame");
                frame.handlers.pop();
                if let Some(err) = frame.pending_error.take() {
                    return Err(err);
                }
                if let Some(branch) = frame.pending_branch.take() {
                    self.run_finalizers(branch);
                }
            }
            OpCode::Finalizer => {
                let ip = self.frames.last().expect("frame").ip;
                let branch = PendingBranch { floor: a, ip, sp: self.sp };
                self.run_finalizers(branch);
            }
            OpCode::NoOp => {}
        }
        Ok(Flow::Continue)
    }

    // === Stack primitives ===

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::stack_overflow("operand stack exhausted"));
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.sp -= 1;
        std::mem::replace(&mut self.stack[self.sp], Value::Undefined)
    }

    /// Shrinks the stack, clearing vacated slots so no references linger.
    fn set_sp(&mut self, new_sp: usize) {
        if new_sp < self.sp {
            for slot in &mut self.stack[new_sp..self.sp] {
                *slot = Value::Undefined;
            }
        }
        self.sp = new_sp;
    }

    // === Calls ===

    fn do_call(
        &mut self,
        num_args: usize,
        expand: bool,
        name: Option<String>,
    ) -> Result<(), RuntimeError> {
        let callee_slot = self.sp - num_args - 1;

        if let Some(name) = &name {
            // CallName: the callee slot holds the receiver. A NameCaller
            // dispatches directly; anything else resolves the member and
            // falls through to a plain call.
            let receiver = self.stack[callee_slot].clone();
            if let Value::NameCaller(host) = receiver {
                let mut args = Vec::with_capacity(num_args);
                for slot in &mut self.stack[callee_slot + 1..self.sp] {
                    args.push(std::mem::replace(slot, Value::Undefined));
                }
                self.set_sp(callee_slot);
                let args = expand_args(args, expand)?;
                let result = host.call_name(name, &args)?;
                return self.push(result);
            }
            let member = receiver.index_get(&Value::string(name.as_str()))?;
            self.stack[callee_slot] = member;
        }

        let callee = self.stack[callee_slot].clone();
        match callee {
            Value::Function(func) => {
                // Tail-call optimization: a self-call immediately followed
                // by Return (or Pop;Return) reuses the current frame.
                let tail = {
                    let frame = self.frames.last().expect("frame");
                    Arc::ptr_eq(&func, &frame.func) && is_tail_position(frame)
                };
                let mut args = Vec::with_capacity(num_args);
                for slot in &mut self.stack[callee_slot + 1..self.sp] {
                    args.push(std::mem::replace(slot, Value::Undefined));
                }
                self.set_sp(callee_slot);
                let args = expand_args(args, expand)?;
                let locals = marshal_args(&func, args)?;

                if tail {
                    let bp = self.frames.last().expect("frame").bp;
                    for (i, slot) in self.stack[bp..bp + func.num_locals].iter_mut().enumerate()
                    {
                        *slot = locals.get(i).cloned().unwrap_or(Value::Undefined);
                    }
                    self.set_sp(bp + func.num_locals);
                    let frame = self.frames.last_mut().expect("frame");
                    frame.ip = 0;
                    frame.handlers.clear();
                    frame.pending_error = None;
                    frame.pending_branch = None;
                    return Ok(());
                }

                if self.frames.len() >= MAX_FRAMES {
                    return Err(RuntimeError::stack_overflow("call frames exhausted"));
                }
                let bp = self.sp;
                if bp + func.num_locals > STACK_SIZE {
                    return Err(RuntimeError::stack_overflow("operand stack exhausted"));
                }
                for (i, slot) in self.stack[bp..bp + func.num_locals].iter_mut().enumerate() {
                    *slot = locals.get(i).cloned().unwrap_or(Value::Undefined);
                }
                self.sp = bp + func.num_locals;
                self.frames.push(Frame::new(func, bp));
                Ok(())
            }
            Value::Builtin(builtin) => {
                let mut args = Vec::with_capacity(num_args);
                for slot in &mut self.stack[callee_slot + 1..self.sp] {
                    args.push(std::mem::replace(slot, Value::Undefined));
                }
                self.set_sp(callee_slot);
                let args = expand_args(args, expand)?;
                let result = builtin.call(&args)?;
                self.push(result)
            }
            Value::Native(native) => {
                let mut args = Vec::with_capacity(num_args);
                for slot in &mut self.stack[callee_slot + 1..self.sp] {
                    args.push(std::mem::replace(slot, Value::Undefined));
                }
                self.set_sp(callee_slot);
                let args = expand_args(args, expand)?;
                let result = (native.func)(&args)?;
                self.push(result)
            }
            other => Err(RuntimeError::not_callable(other.type_name())),
        }
    }

    fn do_return(&mut self, value: Value) -> Result<Flow, RuntimeError> {
        // Popping the frame drops its pending error/branch, which is how
        // a return inside finally suppresses a propagating error.
        let frame = self.frames.pop().expect("frame");
        if self.frames.is_empty() {
            // Preserve main locals for GetLocals before clearing.
            let num_locals = frame.func.num_locals;
            self.last_locals = self.stack[frame.bp..frame.bp + num_locals].to_vec();
            self.set_sp(frame.bp);
            return Ok(Flow::Finished(value));
        }
        self.set_sp(frame.bp);
        self.push(value)?;
        Ok(Flow::Continue)
    }

    // === Error and finalizer routing ===

    /// Runs finally blocks of handlers above the branch floor, then
    /// resumes the branch target.
    fn run_finalizers(&mut self, branch: PendingBranch) {
        loop {
            let frame = self.frames.last_mut().expect("frame");
            if frame.handlers.len() <= branch.floor {
                break;
            }
            let handler = frame.handlers.last_mut().expect("handler");
            if handler.finally != 0 {
                let target = handler.finally;
                handler.catch = 0;
                frame.ip = target;
                frame.pending_branch = Some(branch);
                return;
            }
            frame.handlers.pop();
        }
        let frame = self.frames.last_mut().expect("frame");
        frame.ip = branch.ip;
        self.set_sp(branch.sp);
    }

    /// Routes a raised error to the nearest armed handler, unwinding
    /// frames and collecting the trace. Returns the error when unhandled.
    fn raise(&mut self, err: RuntimeError) -> Option<RuntimeError> {
        if err.kind == ErrorKind::VMAborted {
            return Some(self.unwind_fatal(err));
        }
        let mut err = err;
        loop {
            enum Action {
                Handle { target: usize, sp: usize },
                Unwind,
            }
            if self.frames.is_empty() {
                return Some(err);
            }
            let action = {
                let frame = self.frames.last_mut().expect("frame");
                loop {
                    let armed = match frame.handlers.last() {
                        Some(handler) if handler.catch != 0 => {
                            Some((handler.catch, handler.sp))
                        }
                        Some(handler) if handler.finally != 0 => {
                            Some((handler.finally, handler.sp))
                        }
                        Some(_) => None,
                        None => break Action::Unwind,
                    };
                    match armed {
                        Some((target, sp)) => break Action::Handle { target, sp },
                        None => {
                            frame.handlers.pop();
                        }
                    }
                }
            };
            match action {
                Action::Handle { target, sp } => {
                    self.set_sp(sp);
                    let frame = self.frames.last_mut().expect("frame");
                    // The error supersedes any branch mid-flight through
                    // this frame's finally blocks.
                    frame.pending_branch = None;
                    frame.pending_error = Some(err);
                    frame.ip = target;
                    return None;
                }
                Action::Unwind => {
                    let frame = self.frames.pop().expect("frame");
                    err.push_trace(frame.func.position(frame.cur_ip));
                    self.set_sp(frame.bp);
                    if self.frames.is_empty() {
                        return Some(err);
                    }
                }
            }
        }
    }

    /// Unconditional unwind used for aborts: no handler may intercept.
    fn unwind_fatal(&mut self, mut err: RuntimeError) -> RuntimeError {
        while let Some(frame) = self.frames.pop() {
            err.push_trace(frame.func.position(frame.cur_ip));
        }
        // Leave the stack intact for inspection until clear() runs.
        err
    }
}

/// True when the instruction at the frame's ip makes the just-issued call
/// a tail call: Return, or Pop followed by Return.
fn is_tail_position(frame: &Frame) -> bool {
    let insts = &frame.func.instructions;
    let ip = frame.ip;
    if ip >= insts.len() {
        return false;
    }
    if insts[ip] == OpCode::Return as u8 {
        return true;
    }
    insts[ip] == OpCode::Pop as u8
        && ip + 1 < insts.len()
        && insts[ip + 1] == OpCode::Return as u8
}

fn with_iterator<T>(
    value: &Value,
    f: impl FnOnce(&mut ValueIterator) -> T,
) -> Result<T, RuntimeError> {
    match value {
        Value::Iterator(iterator) => Ok(f(&mut iterator.lock().unwrap())),
        other => Err(RuntimeError::type_error(format!(
            "expected an iterator, got '{}'",
            other.type_name()
        ))),
    }
}

/// Applies `...` expansion: the last argument must be an array whose
/// elements are spliced into the argument list.
fn expand_args(mut args: Vec<Value>, expand: bool) -> Result<Vec<Value>, RuntimeError> {
    if !expand {
        return Ok(args);
    }
    let last = args
        .pop()
        .ok_or_else(|| RuntimeError::type_error("missing expansion argument"))?;
    match last {
        Value::Array(arr) => {
            args.extend(arr.lock().unwrap().iter().cloned());
            Ok(args)
        }
        other => Err(RuntimeError::type_error(format!(
            "expansion argument must be an array, got '{}'",
            other.type_name()
        ))),
    }
}

/// Binds arguments to a callee's parameters, collecting variadic surplus
/// into a fresh array.
fn marshal_args(func: &CompiledFunction, mut args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
    let num_params = func.num_params;
    if func.variadic {
        if args.len() < num_params - 1 {
            return Err(RuntimeError::wrong_num_arguments(
                format!(">={}", num_params - 1),
                args.len(),
            ));
        }
        let rest: Vec<Value> = args.split_off(num_params - 1);
        args.push(Value::array(rest));
        Ok(args)
    } else {
        if args.len() != num_params {
            return Err(RuntimeError::wrong_num_arguments(num_params, args.len()));
        }
        Ok(args)
    }
}

/// Host-facing argument binding for `run`: lenient padding/collection so
/// embedders can under- or over-supply script args.
fn marshal_top_level_args(func: &CompiledFunction, args: &[Value]) -> Vec<Value> {
    let num_params = func.num_params;
    if func.variadic && num_params > 0 {
        let mut out: Vec<Value> = args.iter().take(num_params - 1).cloned().collect();
        while out.len() < num_params - 1 {
            out.push(Value::Undefined);
        }
        let rest: Vec<Value> = args.iter().skip(num_params - 1).cloned().collect();
        out.push(Value::array(rest));
        out
    } else {
        let mut out: Vec<Value> = args.iter().take(num_params).cloned().collect();
        while out.len() < num_params {
            out.push(Value::Undefined);
        }
        out
    }
}

/// SliceIndex: Undefined endpoints mean 0 and len.
fn slice_value(base: &Value, low: &Value, high: &Value) -> Result<Value, RuntimeError> {
    let len = base
        .length()
        .ok_or_else(|| RuntimeError::not_indexable(base.type_name()))?;
    let low_idx = match low {
        Value::Undefined => 0,
        other => other
            .as_index()
            .ok_or_else(|| RuntimeError::invalid_index("slice bound must be an integer"))?,
    };
    let high_idx = match high {
        Value::Undefined => len as i64,
        other => other
            .as_index()
            .ok_or_else(|| RuntimeError::invalid_index("slice bound must be an integer"))?,
    };
    if low_idx < 0 || high_idx > len as i64 || low_idx > high_idx {
        return Err(RuntimeError::index_out_of_bounds(high_idx, len));
    }
    let (lo, hi) = (low_idx as usize, high_idx as usize);
    match base {
        Value::String(s) => s
            .get(lo..hi)
            .map(Value::string)
            .ok_or_else(|| RuntimeError::invalid_index("slice is not a char boundary")),
        Value::Array(arr) => Ok(Value::array(arr.lock().unwrap()[lo..hi].to_vec())),
        Value::Bytes(bytes) => Ok(Value::bytes(bytes.lock().unwrap()[lo..hi].to_vec())),
        other => Err(RuntimeError::not_indexable(other.type_name())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompilerOptions};

    fn run(source: &str) -> Value {
        let bytecode = compile(source.as_bytes(), CompilerOptions::default()).expect("compile");
        let mut vm = Vm::new(Arc::new(bytecode));
        vm.run(Value::empty_map(), &[]).expect("run")
    }

    fn run_err(source: &str) -> RuntimeError {
        let bytecode = compile(source.as_bytes(), CompilerOptions::default()).expect("compile");
        let mut vm = Vm::new(Arc::new(bytecode));
        vm.run(Value::empty_map(), &[]).expect_err("expected error")
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("return 2 + 3 * 4"), Value::Int(14));
        assert_eq!(run("return (2 + 3) * 4"), Value::Int(20));
        assert_eq!(run("return 7 % 3"), Value::Int(1));
    }

    #[test]
    fn test_locals_and_globals() {
        assert_eq!(run("a := 1; a = a + 41; return a"), Value::Int(42));
        assert_eq!(run("global g; g = 5; return g + 1"), Value::Int(6));
    }

    #[test]
    fn test_short_circuit_keeps_value() {
        assert_eq!(run("return 0 && missing"), Value::Int(0));
        assert_eq!(run("return 7 || missing"), Value::Int(7));
        assert_eq!(run("return 1 && 2"), Value::Int(2));
    }

    #[test]
    fn test_calls_and_closures() {
        assert_eq!(
            run("add := func(a, b) { return a + b }; return add(40, 2)"),
            Value::Int(42)
        );
        let source = r#"
            counter := func() {
                n := 0
                return func() { n = n + 1; return n }
            }
            c := counter()
            c(); c()
            return c()
        "#;
        assert_eq!(run(source), Value::Int(3));
    }

    #[test]
    fn test_upvalue_shared_cell() {
        let source = r#"
            n := 1
            bump := func() { n = n + 1 }
            bump()
            bump()
            return n
        "#;
        assert_eq!(run(source), Value::Int(3));
    }

    #[test]
    fn test_variadic_and_expand() {
        assert_eq!(
            run("f := func(a, ...rest) { return len(rest) }; return f(1)"),
            Value::Int(0)
        );
        assert_eq!(
            run("f := func(a, ...rest) { return len(rest) }; return f(1, 2, 3)"),
            Value::Int(2)
        );
        assert_eq!(
            run("f := func(a, b, c) { return a + b + c }; xs := [2, 3]; return f(1, xs...)"),
            Value::Int(6)
        );
    }

    #[test]
    fn test_wrong_num_arguments() {
        let err = run_err("f := func(a) { return a }; return f()");
        assert_eq!(err.kind, ErrorKind::WrongNumArguments);
    }

    #[test]
    fn test_tail_recursion_does_not_grow_frames() {
        let source = r#"
            loop := func(n) {
                if n == 0 { return "done" }
                return loop(n - 1)
            }
            return loop(20000)
        "#;
        assert_eq!(run(source), Value::string("done"));
    }

    #[test]
    fn test_deep_non_tail_recursion_overflows() {
        let source = r#"
            f := func(n) {
                if n == 0 { return 0 }
                return 1 + f(n - 1)
            }
            return f(20000)
        "#;
        let err = run_err(source);
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn test_try_catch_finally_order() {
        let source = r#"
            log := []
            try {
                log = append(log, "try")
                throw "boom"
            } catch err {
                log = append(log, err.Message)
            } finally {
                log = append(log, "finally")
            }
            return log
        "#;
        assert_eq!(
            run(source),
            Value::array(vec![
                Value::string("try"),
                Value::string("boom"),
                Value::string("finally"),
            ])
        );
    }

    #[test]
    fn test_finally_runs_on_return() {
        let source = r#"
            global trace
            trace = []
            f := func() {
                try {
                    return "value"
                } finally {
                    trace = append(trace, "finally")
                }
            }
            result := f()
            return [result, len(trace)]
        "#;
        assert_eq!(
            run(source),
            Value::array(vec![Value::string("value"), Value::Int(1)])
        );
    }

    #[test]
    fn test_return_in_finally_suppresses_error() {
        let source = r#"
            f := func() {
                try {
                    throw "boom"
                } finally {
                    return "suppressed"
                }
            }
            return f()
        "#;
        assert_eq!(run(source), Value::string("suppressed"));
    }

    #[test]
    fn test_break_through_try_runs_finally() {
        let source = r#"
            global trace
            trace = []
            for i := 0; i < 3; i++ {
                try {
                    if i == 1 { break }
                } finally {
                    trace = append(trace, i)
                }
            }
            return trace
        "#;
        assert_eq!(run(source), Value::array(vec![Value::Int(0), Value::Int(1)]));
    }

    #[test]
    fn test_uncaught_error_has_trace() {
        let err = run_err("f := func() { return 1 / 0 }\nreturn f()");
        assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
        assert!(!err.trace.is_empty());
    }

    #[test]
    fn test_iteration() {
        assert_eq!(
            run("sum := 0; for _, v in [1, 2, 3] { sum += v }; return sum"),
            Value::Int(6)
        );
        assert_eq!(
            run("keys := 0; m := {a: 1, b: 2}; for k, _ in m { keys++ }; return keys"),
            Value::Int(2)
        );
        let err = run_err("for v in 42 { }");
        assert_eq!(err.kind, ErrorKind::NotIterable);
    }

    #[test]
    fn test_slices() {
        assert_eq!(
            run("a := [1, 2, 3, 4]; return a[1:3]"),
            Value::array(vec![Value::Int(2), Value::Int(3)])
        );
        assert_eq!(run(r#"s := "hello"; return s[1:3]"#), Value::string("el"));
        assert_eq!(
            run("a := [1, 2]; return a[:]"),
            Value::array(vec![Value::Int(1), Value::Int(2)])
        );
        let err = run_err("a := [1]; return a[0:5]");
        assert_eq!(err.kind, ErrorKind::IndexOutOfBounds);
    }

    #[test]
    fn test_modules_initialized_once() {
        let mut modules = crate::module::ModuleMap::new();
        modules.add_source(
            "counter",
            r#"
                global count
                count = count + 1
                return {n: count}
            "#,
        );
        let source = r#"
            global count
            count = 0
            a := import("counter")
            b := import("counter")
            return [count, a.n, b.n]
        "#;
        let bytecode = compile(
            source.as_bytes(),
            CompilerOptions { module_map: Some(modules), ..Default::default() },
        )
        .unwrap();
        let mut vm = Vm::new(Arc::new(bytecode));
        let result = vm.run(Value::empty_map(), &[]).unwrap();
        assert_eq!(
            result,
            Value::array(vec![Value::Int(1), Value::Int(1), Value::Int(1)])
        );
    }

    #[test]
    fn test_abort() {
        let bytecode = compile("for { }".as_bytes(), CompilerOptions::default()).unwrap();
        let mut vm = Vm::new(Arc::new(bytecode));
        let abort = vm.abort_handle();
        let watcher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            abort.store(true, Ordering::Relaxed);
        });
        let err = vm.run(Value::empty_map(), &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VMAborted);
        watcher.join().unwrap();
    }

    #[test]
    fn test_globals_are_shared_with_host() {
        let bytecode =
            compile("global x; x = x + 1; return x".as_bytes(), CompilerOptions::default())
                .unwrap();
        let mut vm = Vm::new(Arc::new(bytecode));
        let globals = Value::empty_map();
        globals.index_set(&Value::string("x"), Value::Int(41)).unwrap();
        let result = vm.run(globals.clone(), &[]).unwrap();
        assert_eq!(result, Value::Int(42));
        assert_eq!(globals.index_get(&Value::string("x")).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_run_args_bind_params() {
        let bytecode = compile(
            "param (a, b); return a + b".as_bytes(),
            CompilerOptions::default(),
        )
        .unwrap();
        let mut vm = Vm::new(Arc::new(bytecode));
        let result = vm.run(Value::empty_map(), &[Value::Int(40), Value::Int(2)]).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn test_stack_cleared_after_return() {
        let bytecode = compile("return 1".as_bytes(), CompilerOptions::default()).unwrap();
        let mut vm = Vm::new(Arc::new(bytecode));
        vm.run(Value::empty_map(), &[]).unwrap();
        assert_eq!(vm.sp, 0);
        assert!(vm.stack.iter().all(|v| matches!(v, Value::Undefined)));
    }
}
