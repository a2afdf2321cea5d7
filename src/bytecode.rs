// File: src/bytecode.rs
//
// Bytecode instruction definitions and containers for the uGO VM.
// Opcodes are one byte; operands are big-endian with per-opcode widths.
// The width table below is the single source of truth for both the
// encoder and the decoder.

use crate::errors::SourceLocation;
use crate::value::{Value, ValueCell};
use nohash_hasher::BuildNoHashHasher;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Instruction-offset -> source position map recorded at compile time.
pub type SourceMap = HashMap<usize, SourceLocation, BuildNoHashHasher<usize>>;

/// Bytecode operation codes for the stack-based uGO VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // === Constants and literals ===
    /// Push constants[operand]. Operand: u16 constant index.
    Constant,
    /// Push Undefined.
    Null,
    /// Push Bool(true).
    True,
    /// Push Bool(false).
    False,

    // === Stack ===
    /// Pop and discard the top of stack.
    Pop,

    // === Variables ===
    /// Push stack[bp+k], auto-dereferencing an upvalue cell. Operand: u8 slot.
    GetLocal,
    /// Store TOS into stack[bp+k], writing through an upvalue cell. Operand: u8 slot.
    SetLocal,
    /// Define stack[bp+k] from TOS, overwriting any cell. Operand: u8 slot.
    DefineLocal,
    /// Push free_vars[k] contents. Operand: u8 free index.
    GetFree,
    /// Store TOS into free_vars[k] cell. Operand: u8 free index.
    SetFree,
    /// Convert stack[bp+k] into an upvalue cell in place and push the cell.
    /// Operand: u8 slot.
    GetLocalPtr,
    /// Push the free_vars[k] cell itself. Operand: u8 free index.
    GetFreePtr,
    /// Push globals[constants[operand]]. Operand: u16 constant index.
    GetGlobal,
    /// Store TOS into globals[constants[operand]]. Operand: u16 constant index.
    SetGlobal,
    /// Push the builtin with the given id. Operand: u8 builtin id.
    GetBuiltin,

    // === Operators ===
    /// Pop two, apply the binary operator for the token id, push the result.
    /// Operand: u8 token id.
    BinaryOp,
    /// Pop one, apply the unary operator for the token id, push the result.
    /// Operand: u8 token id.
    Unary,
    /// Pop two, push Bool equality.
    Equal,
    /// Pop two, push Bool inequality.
    NotEqual,

    // === Control flow ===
    /// Unconditional jump. Operand: u32 absolute instruction offset.
    Jump,
    /// Pop; jump when the popped value is falsy. Operand: u32 offset.
    JumpFalsy,
    /// Short-circuit &&: jump without popping when TOS is falsy, else pop
    /// and fall through. Operand: u32 offset.
    AndJump,
    /// Short-circuit ||: jump without popping when TOS is truthy, else pop
    /// and fall through. Operand: u32 offset.
    OrJump,

    // === Functions ===
    /// Call the value under the arguments. Operands: u8 num-args,
    /// u8 expand flag (1 when the last argument is `...` spread).
    Call,
    /// Method-style call: resolves the name against the receiver via the
    /// NameCaller capability, falling back to index_get + call.
    /// Operands: u8 num-args, u8 expand flag. The name sits above the args.
    CallName,
    /// Return from the current function. Operand: u8 result count (0 or 1).
    Return,
    /// Instantiate a closure: pop n cells, bind them to the function
    /// constant. Operands: u16 function constant index, u8 num-free.
    Closure,

    // === Collections and indexing ===
    /// Build an array from the top n values. Operand: u16 element count.
    Array,
    /// Build a map from the top 2n values (key, value pairs). Operand: u16
    /// pair count.
    Map,
    /// Pop n selectors and chain index_get through them. Operand: u8 count.
    GetIndex,
    /// Pop index, target, value; target[index] = value.
    SetIndex,
    /// Pop high, low, base; push base[low:high]. Undefined endpoints mean
    /// 0 / len.
    SliceIndex,

    // === Iteration ===
    /// Pop an iterable, push an iterator over it.
    IterInit,
    /// Advance the iterator at TOS, push Bool (has current).
    IterNext,
    /// Push the current key of the iterator at TOS.
    IterKey,
    /// Push the current value of the iterator at TOS.
    IterValue,

    // === Modules ===
    /// If module-cache[m] is empty push constants[c] then True, else push
    /// the cached value then False. Operands: u16 constant index, u16
    /// module index.
    LoadModule,
    /// Store TOS into module-cache[m] (deep-copied for copier values),
    /// leaving TOS in place. Operand: u16 module index.
    StoreModule,

    // === Exceptions ===
    /// Push an error handler. Operands: u32 catch offset, u32 finally
    /// offset.
    SetupTry,
    /// Enter a catch block: consume the pending error (pushing it, or
    /// Undefined) and disarm the handler's catch offset.
    SetupCatch,
    /// Enter a finally block: disarm both handler offsets.
    SetupFinally,
    /// Operand 1: pop TOS and raise it as a user error. Operand 0: the
    /// implicit re-throw terminating a finally block.
    Throw,
    /// Route control through enclosing finally blocks down to the given
    /// handler-stack floor. Operand: u8 floor.
    Finalizer,

    /// No operation.
    NoOp,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        const TABLE: &[OpCode] = &[
            OpCode::Constant,
            OpCode::Null,
            OpCode::True,
            OpCode::False,
            OpCode::Pop,
            OpCode::GetLocal,
            OpCode::SetLocal,
            OpCode::DefineLocal,
            OpCode::GetFree,
            OpCode::SetFree,
            OpCode::GetLocalPtr,
            OpCode::GetFreePtr,
            OpCode::GetGlobal,
            OpCode::SetGlobal,
            OpCode::GetBuiltin,
            OpCode::BinaryOp,
            OpCode::Unary,
            OpCode::Equal,
            OpCode::NotEqual,
            OpCode::Jump,
            OpCode::JumpFalsy,
            OpCode::AndJump,
            OpCode::OrJump,
            OpCode::Call,
            OpCode::CallName,
            OpCode::Return,
            OpCode::Closure,
            OpCode::Array,
            OpCode::Map,
            OpCode::GetIndex,
            OpCode::SetIndex,
            OpCode::SliceIndex,
            OpCode::IterInit,
            OpCode::IterNext,
            OpCode::IterKey,
            OpCode::IterValue,
            OpCode::LoadModule,
            OpCode::StoreModule,
            OpCode::SetupTry,
            OpCode::SetupCatch,
            OpCode::SetupFinally,
            OpCode::Throw,
            OpCode::Finalizer,
            OpCode::NoOp,
        ];
        TABLE.get(byte as usize).copied()
    }

    /// Byte widths of the opcode's operands; the single source of truth
    /// shared by `encode` and `read_operands`.
    pub fn operand_widths(self) -> &'static [usize] {
        match self {
            OpCode::Jump | OpCode::JumpFalsy | OpCode::AndJump | OpCode::OrJump => &[4],
            OpCode::SetupTry => &[4, 4],
            OpCode::Constant
            | OpCode::Array
            | OpCode::Map
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::StoreModule => &[2],
            OpCode::LoadModule => &[2, 2],
            OpCode::Closure => &[2, 1],
            OpCode::Call | OpCode::CallName => &[1, 1],
            OpCode::GetBuiltin
            | OpCode::Return
            | OpCode::BinaryOp
            | OpCode::Unary
            | OpCode::GetIndex
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::DefineLocal
            | OpCode::GetFree
            | OpCode::SetFree
            | OpCode::GetLocalPtr
            | OpCode::GetFreePtr
            | OpCode::Throw
            | OpCode::Finalizer => &[1],
            _ => &[],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "Constant",
            OpCode::Null => "Null",
            OpCode::True => "True",
            OpCode::False => "False",
            OpCode::Pop => "Pop",
            OpCode::GetLocal => "GetLocal",
            OpCode::SetLocal => "SetLocal",
            OpCode::DefineLocal => "DefineLocal",
            OpCode::GetFree => "GetFree",
            OpCode::SetFree => "SetFree",
            OpCode::GetLocalPtr => "GetLocalPtr",
            OpCode::GetFreePtr => "GetFreePtr",
            OpCode::GetGlobal => "GetGlobal",
            OpCode::SetGlobal => "SetGlobal",
            OpCode::GetBuiltin => "GetBuiltin",
            OpCode::BinaryOp => "BinaryOp",
            OpCode::Unary => "Unary",
            OpCode::Equal => "Equal",
            OpCode::NotEqual => "NotEqual",
            OpCode::Jump => "Jump",
            OpCode::JumpFalsy => "JumpFalsy",
            OpCode::AndJump => "AndJump",
            OpCode::OrJump => "OrJump",
            OpCode::Call => "Call",
            OpCode::CallName => "CallName",
            OpCode::Return => "Return",
            OpCode::Closure => "Closure",
            OpCode::Array => "Array",
            OpCode::Map => "Map",
            OpCode::GetIndex => "GetIndex",
            OpCode::SetIndex => "SetIndex",
            OpCode::SliceIndex => "SliceIndex",
            OpCode::IterInit => "IterInit",
            OpCode::IterNext => "IterNext",
            OpCode::IterKey => "IterKey",
            OpCode::IterValue => "IterValue",
            OpCode::LoadModule => "LoadModule",
            OpCode::StoreModule => "StoreModule",
            OpCode::SetupTry => "SetupTry",
            OpCode::SetupCatch => "SetupCatch",
            OpCode::SetupFinally => "SetupFinally",
            OpCode::Throw => "Throw",
            OpCode::Finalizer => "Finalizer",
            OpCode::NoOp => "NoOp",
        }
    }
}

/// Appends an encoded instruction to `buf`. Fails when an operand is
/// negative or does not fit its width.
pub fn encode(buf: &mut Vec<u8>, op: OpCode, operands: &[i64]) -> Result<(), String> {
    let widths = op.operand_widths();
    if widths.len() != operands.len() {
        return Err(format!(
            "opcode {} wants {} operand(s), got {}",
            op.name(),
            widths.len(),
            operands.len()
        ));
    }
    buf.push(op as u8);
    for (&operand, &width) in operands.iter().zip(widths) {
        let max: i64 = match width {
            1 => u8::MAX as i64,
            2 => u16::MAX as i64,
            4 => u32::MAX as i64,
            _ => unreachable!("operand width {}", width),
        };
        if operand < 0 || operand > max {
            return Err(format!(
                "opcode {} operand {} out of range for {} byte(s)",
                op.name(),
                operand,
                width
            ));
        }
        let bytes = (operand as u32).to_be_bytes();
        buf.extend_from_slice(&bytes[4 - width..]);
    }
    Ok(())
}

/// Decodes the operands of the instruction starting at `offset` (which
/// must point at the opcode byte). Returns the operands and the offset of
/// the next instruction.
pub fn read_operands(op: OpCode, insts: &[u8], offset: usize) -> (Vec<i64>, usize) {
    let mut pos = offset + 1;
    let mut out = Vec::with_capacity(2);
    for &width in op.operand_widths() {
        let mut v: u32 = 0;
        for i in 0..width {
            v = (v << 8) | insts[pos + i] as u32;
        }
        out.push(v as i64);
        pos += width;
    }
    (out, pos)
}

/// Human-readable listing of an instruction stream, for tracing and tests.
pub fn disassemble(insts: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < insts.len() {
        match OpCode::from_u8(insts[pos]) {
            Some(op) => {
                let (operands, next) = read_operands(op, insts, pos);
                let _ = write!(out, "{:04} {}", pos, op.name());
                for operand in operands {
                    let _ = write!(out, " {}", operand);
                }
                out.push('\n');
                pos = next;
            }
            None => {
                let _ = writeln!(out, "{:04} ILLEGAL {:#04x}", pos, insts[pos]);
                pos += 1;
            }
        }
    }
    out
}

/// A closure template: the compiled body plus captured upvalue cells.
///
/// Equal by identity, `identical` by structural byte equality; hashed with
/// 32-bit FNV-1a over a small header plus the instruction bytes.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub num_params: usize,
    /// Local slot count, always >= num_params.
    pub num_locals: usize,
    pub variadic: bool,
    pub instructions: Arc<[u8]>,
    pub source_map: Arc<SourceMap>,
    /// Captured upvalue cells; empty on the constant-pool template.
    pub free: Vec<ValueCell>,
}

impl CompiledFunction {
    pub fn new(
        num_params: usize,
        num_locals: usize,
        variadic: bool,
        instructions: Vec<u8>,
        source_map: SourceMap,
    ) -> Self {
        Self {
            num_params,
            num_locals,
            variadic,
            instructions: instructions.into(),
            source_map: Arc::new(source_map),
            free: Vec::new(),
        }
    }

    /// Structural identity: same instruction bytes, shape, and free count.
    pub fn identical(&self, other: &CompiledFunction) -> bool {
        self.num_params == other.num_params
            && self.num_locals == other.num_locals
            && self.variadic == other.variadic
            && self.free.len() == other.free.len()
            && self.instructions == other.instructions
    }

    pub fn equal_source_map(&self, other: &CompiledFunction) -> bool {
        self.source_map.len() == other.source_map.len()
            && self
                .source_map
                .iter()
                .all(|(k, v)| other.source_map.get(k) == Some(v))
    }

    /// 32-bit FNV-1a over the shape header and instruction bytes.
    pub fn hash32(&self) -> u32 {
        const OFFSET: u32 = 0x811c_9dc5;
        const PRIME: u32 = 0x0100_0193;
        let mut h = OFFSET;
        let header = [
            self.num_params as u8,
            self.num_locals as u8,
            self.variadic as u8,
            self.free.len() as u8,
        ];
        for byte in header.iter().chain(self.instructions.iter()) {
            h ^= *byte as u32;
            h = h.wrapping_mul(PRIME);
        }
        h
    }

    /// A closure instance: same body, new upvalue cells.
    pub fn with_free(&self, free: Vec<ValueCell>) -> CompiledFunction {
        CompiledFunction {
            num_params: self.num_params,
            num_locals: self.num_locals,
            variadic: self.variadic,
            instructions: self.instructions.clone(),
            source_map: self.source_map.clone(),
            free,
        }
    }

    /// Source position of the instruction at `ip`, if recorded.
    pub fn position(&self, ip: usize) -> SourceLocation {
        self.source_map.get(&ip).copied().unwrap_or_else(SourceLocation::unknown)
    }
}

/// The unit of execution: a constant pool, the main function, and the
/// number of module slots the VM must provision.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub file_name: String,
    pub constants: Vec<Value>,
    pub main: Arc<CompiledFunction>,
    pub num_modules: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legal_operands(op: OpCode) -> Vec<i64> {
        op.operand_widths()
            .iter()
            .map(|&w| match w {
                1 => 0xab,
                2 => 0xabcd,
                4 => 0x00ab_cdef,
                _ => unreachable!(),
            })
            .collect()
    }

    fn all_opcodes() -> Vec<OpCode> {
        (0..=u8::MAX).filter_map(OpCode::from_u8).collect()
    }

    #[test]
    fn test_encode_decode_symmetry() {
        for op in all_opcodes() {
            let operands = legal_operands(op);
            let mut buf = Vec::new();
            encode(&mut buf, op, &operands).unwrap();
            assert_eq!(buf[0], op as u8);
            let (decoded, next) = read_operands(op, &buf, 0);
            assert_eq!(decoded, operands, "operands differ for {}", op.name());
            assert_eq!(next, buf.len(), "width mismatch for {}", op.name());
        }
    }

    #[test]
    fn test_encode_rejects_oversized_operand() {
        let mut buf = Vec::new();
        assert!(encode(&mut buf, OpCode::Constant, &[u16::MAX as i64 + 1]).is_err());
        assert!(encode(&mut buf, OpCode::GetLocal, &[256]).is_err());
        assert!(encode(&mut buf, OpCode::Jump, &[-1]).is_err());
        assert!(encode(&mut buf, OpCode::Pop, &[1]).is_err());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = Vec::new();
        encode(&mut buf, OpCode::Constant, &[0x0102]).unwrap();
        assert_eq!(buf, vec![OpCode::Constant as u8, 0x01, 0x02]);
        buf.clear();
        encode(&mut buf, OpCode::Jump, &[0x0102_0304]).unwrap();
        assert_eq!(buf, vec![OpCode::Jump as u8, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_function_identity_and_hash() {
        let mut insts = Vec::new();
        encode(&mut insts, OpCode::Null, &[]).unwrap();
        encode(&mut insts, OpCode::Return, &[1]).unwrap();
        let a = CompiledFunction::new(0, 0, false, insts.clone(), SourceMap::default());
        let b = CompiledFunction::new(0, 0, false, insts.clone(), SourceMap::default());
        assert!(a.identical(&b));
        assert_eq!(a.hash32(), b.hash32());
        let c = CompiledFunction::new(1, 1, false, insts, SourceMap::default());
        assert!(!a.identical(&c));
        assert_ne!(a.hash32(), c.hash32());
    }

    #[test]
    fn test_disassemble_lists_operands() {
        let mut insts = Vec::new();
        encode(&mut insts, OpCode::Constant, &[7]).unwrap();
        encode(&mut insts, OpCode::Call, &[2, 0]).unwrap();
        let text = disassemble(&insts);
        assert!(text.contains("Constant 7"));
        assert!(text.contains("Call 2 0"));
    }
}
