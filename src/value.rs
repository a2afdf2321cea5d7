// File: src/value.rs
//
// Runtime value types for the uGO virtual machine.
// Value is the sum of every runtime kind; each variant declares the
// capabilities it supports (indexing, iteration, calling, copying) and the
// binary/unary operator rules live here as free functions so the VM and
// the optimizer share one implementation.

use crate::bytecode::CompiledFunction;
use crate::builtins::BuiltinFunction;
use crate::errors::{ErrorKind, RuntimeError};
use crate::token::Token;
use ahash::AHashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// The heap cell backing a captured local (an upvalue). The defining frame
/// slot and every closure that captures the local share one cell.
pub type ValueCell = Arc<Mutex<Value>>;

pub fn new_cell(value: Value) -> ValueCell {
    Arc::new(Mutex::new(value))
}

/// A runtime error value: what a `catch` clause binds and what the `error`
/// builtin constructs.
#[derive(Debug)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub cause: Option<Value>,
}

/// Host-provided native callable.
pub struct NativeFunction {
    pub name: String,
    pub func: Box<dyn Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Dynamic method dispatch hook for host objects: `CallName` consults this
/// before falling back to `index_get(name)` plus a plain call.
pub trait NameCaller: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn call_name(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError>;
}

impl fmt::Debug for dyn NameCaller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NameCaller({})", self.type_name())
    }
}

/// The runtime value sum.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Char(char),
    String(Arc<str>),
    Bytes(Arc<Mutex<Vec<u8>>>),
    Array(Arc<Mutex<Vec<Value>>>),
    Map(Arc<Mutex<AHashMap<String, Value>>>),
    /// A Map guarded for concurrent host access.
    SyncMap(Arc<RwLock<AHashMap<String, Value>>>),
    Error(Arc<ErrorValue>),
    Function(Arc<CompiledFunction>),
    Builtin(BuiltinFunction),
    Native(Arc<NativeFunction>),
    NameCaller(Arc<dyn NameCaller>),
    /// Upvalue indirection cell; never observable from scripts.
    Ptr(ValueCell),
    Iterator(Arc<Mutex<ValueIterator>>),
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(elements)))
    }

    pub fn map(entries: AHashMap<String, Value>) -> Value {
        Value::Map(Arc::new(Mutex::new(entries)))
    }

    pub fn empty_map() -> Value {
        Value::Map(Arc::new(Mutex::new(AHashMap::new())))
    }

    pub fn bytes(data: Vec<u8>) -> Value {
        Value::Bytes(Arc::new(Mutex::new(data)))
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Value {
        Value::Error(Arc::new(ErrorValue {
            name: name.into(),
            message: message.into(),
            cause: None,
        }))
    }

    /// Converts an unwinding VM error into the value a `catch` binds.
    pub fn from_runtime_error(err: &RuntimeError) -> Value {
        Value::Error(Arc::new(ErrorValue {
            name: err.kind.name().to_string(),
            message: err.message.clone(),
            cause: err.cause.as_deref().map(Value::from_runtime_error),
        }))
    }

    /// Converts a thrown value back into a VM error. Error values keep
    /// their kind through the round trip; anything else becomes a generic
    /// `error` whose message is the value's string form.
    pub fn to_runtime_error(&self) -> RuntimeError {
        match self {
            Value::Error(err) => {
                let kind = ErrorKind::from_name(&err.name).unwrap_or(ErrorKind::Error);
                let mut out = RuntimeError::new(kind, err.message.clone());
                if let Some(cause) = &err.cause {
                    out.cause = Some(Box::new(cause.to_runtime_error()));
                }
                out
            }
            other => RuntimeError::new(ErrorKind::Error, other.to_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::SyncMap(_) => "syncMap",
            Value::Error(_) => "error",
            Value::Function(_) => "compiledFunction",
            Value::Builtin(_) => "builtinFunction",
            Value::Native(_) => "function",
            Value::NameCaller(nc) => nc.type_name(),
            Value::Ptr(_) => "objectPtr",
            Value::Iterator(_) => "iterator",
        }
    }

    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Undefined => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::Uint(n) => *n == 0,
            Value::Float(f) => f.is_nan(),
            Value::Char(c) => *c == '\0',
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.lock().unwrap().is_empty(),
            Value::Array(a) => a.lock().unwrap().is_empty(),
            Value::Map(m) => m.lock().unwrap().is_empty(),
            Value::SyncMap(m) => m.read().unwrap().is_empty(),
            Value::Error(_) => true,
            Value::Function(_)
            | Value::Builtin(_)
            | Value::Native(_)
            | Value::NameCaller(_)
            | Value::Iterator(_) => false,
            Value::Ptr(cell) => cell.lock().unwrap().is_falsy(),
        }
    }

    /// Structural equality with numeric cross-kind comparison.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => {
                Arc::ptr_eq(a, b) || *a.lock().unwrap() == *b.lock().unwrap()
            }
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.lock().unwrap(), b.lock().unwrap());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.lock().unwrap(), b.lock().unwrap());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map_or(false, |w| v.equal(w)))
            }
            (Value::SyncMap(a), Value::SyncMap(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            _ => match (self.as_float(), other.as_float()) {
                // Numeric kinds (and bool) compare by value across kinds.
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Numeric view used for cross-kind comparison; None for non-numerics.
    fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Uint(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Char(c) => Some(*c as u32 as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    /// Integer view accepted wherever an index is expected.
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Uint(n) => i64::try_from(*n).ok(),
            Value::Char(c) => Some(*c as u32 as i64),
            _ => None,
        }
    }

    pub fn length(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.len()),
            Value::Bytes(b) => Some(b.lock().unwrap().len()),
            Value::Array(a) => Some(a.lock().unwrap().len()),
            Value::Map(m) => Some(m.lock().unwrap().len()),
            Value::SyncMap(m) => Some(m.read().unwrap().len()),
            _ => None,
        }
    }

    pub fn index_get(&self, key: &Value) -> Result<Value, RuntimeError> {
        match self {
            Value::Array(arr) => {
                let arr = arr.lock().unwrap();
                let idx = key
                    .as_index()
                    .ok_or_else(|| RuntimeError::invalid_index(format!(
                        "array index must be an integer, got '{}'",
                        key.type_name()
                    )))?;
                if idx < 0 || idx as usize >= arr.len() {
                    return Err(RuntimeError::index_out_of_bounds(idx, arr.len()));
                }
                Ok(arr[idx as usize].clone())
            }
            Value::Map(map) => Ok(map
                .lock()
                .unwrap()
                .get(&key.to_string())
                .cloned()
                .unwrap_or(Value::Undefined)),
            Value::SyncMap(map) => Ok(map
                .read()
                .unwrap()
                .get(&key.to_string())
                .cloned()
                .unwrap_or(Value::Undefined)),
            Value::String(s) => {
                let idx = key
                    .as_index()
                    .ok_or_else(|| RuntimeError::invalid_index(format!(
                        "string index must be an integer, got '{}'",
                        key.type_name()
                    )))?;
                if idx < 0 || idx as usize >= s.len() {
                    return Err(RuntimeError::index_out_of_bounds(idx, s.len()));
                }
                Ok(Value::Int(s.as_bytes()[idx as usize] as i64))
            }
            Value::Bytes(bytes) => {
                let bytes = bytes.lock().unwrap();
                let idx = key
                    .as_index()
                    .ok_or_else(|| RuntimeError::invalid_index(format!(
                        "bytes index must be an integer, got '{}'",
                        key.type_name()
                    )))?;
                if idx < 0 || idx as usize >= bytes.len() {
                    return Err(RuntimeError::index_out_of_bounds(idx, bytes.len()));
                }
                Ok(Value::Int(bytes[idx as usize] as i64))
            }
            Value::Error(err) => Ok(match key.to_string().as_str() {
                "Name" => Value::string(err.name.as_str()),
                "Message" => Value::string(err.message.as_str()),
                "Cause" => err.cause.clone().unwrap_or(Value::Undefined),
                _ => Value::Undefined,
            }),
            Value::Ptr(cell) => cell.lock().unwrap().index_get(key),
            other => Err(RuntimeError::not_indexable(other.type_name())),
        }
    }

    pub fn index_set(&self, key: &Value, value: Value) -> Result<(), RuntimeError> {
        match self {
            Value::Array(arr) => {
                let mut arr = arr.lock().unwrap();
                let idx = key
                    .as_index()
                    .ok_or_else(|| RuntimeError::invalid_index(format!(
                        "array index must be an integer, got '{}'",
                        key.type_name()
                    )))?;
                if idx < 0 || idx as usize >= arr.len() {
                    return Err(RuntimeError::index_out_of_bounds(idx, arr.len()));
                }
                arr[idx as usize] = value;
                Ok(())
            }
            Value::Map(map) => {
                map.lock().unwrap().insert(key.to_string(), value);
                Ok(())
            }
            Value::SyncMap(map) => {
                map.write().unwrap().insert(key.to_string(), value);
                Ok(())
            }
            Value::Bytes(bytes) => {
                let mut bytes = bytes.lock().unwrap();
                let idx = key
                    .as_index()
                    .ok_or_else(|| RuntimeError::invalid_index(format!(
                        "bytes index must be an integer, got '{}'",
                        key.type_name()
                    )))?;
                if idx < 0 || idx as usize >= bytes.len() {
                    return Err(RuntimeError::index_out_of_bounds(idx, bytes.len()));
                }
                let byte = value.as_index().filter(|b| (0..=255).contains(b)).ok_or_else(
                    || RuntimeError::type_error("bytes element must be an integer in 0..=255"),
                )?;
                bytes[idx as usize] = byte as u8;
                Ok(())
            }
            Value::Ptr(cell) => cell.lock().unwrap().index_set(key, value),
            other => Err(RuntimeError::not_index_assignable(other.type_name())),
        }
    }

    pub fn can_call(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Builtin(_) | Value::Native(_)
        )
    }

    pub fn can_iterate(&self) -> bool {
        matches!(
            self,
            Value::Array(_)
                | Value::Map(_)
                | Value::SyncMap(_)
                | Value::String(_)
                | Value::Bytes(_)
        )
    }

    pub fn iterate(&self) -> Option<ValueIterator> {
        match self {
            Value::Array(arr) => Some(ValueIterator::Array { arr: arr.clone(), pos: -1 }),
            Value::Map(map) => {
                let keys: Vec<String> = map.lock().unwrap().keys().cloned().collect();
                Some(ValueIterator::Map { map: map.clone(), keys, pos: -1 })
            }
            Value::SyncMap(map) => {
                let keys: Vec<String> = map.read().unwrap().keys().cloned().collect();
                Some(ValueIterator::SyncMap { map: map.clone(), keys, pos: -1 })
            }
            Value::String(s) => {
                let chars: Vec<(usize, char)> = s.char_indices().collect();
                Some(ValueIterator::Str { chars, pos: -1 })
            }
            Value::Bytes(bytes) => Some(ValueIterator::Bytes { bytes: bytes.clone(), pos: -1 }),
            _ => None,
        }
    }

    /// True for container kinds that deep-copy on module store.
    pub fn is_copier(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Map(_) | Value::SyncMap(_) | Value::Bytes(_)
        )
    }

    /// Deep copy for containers; shared/immutable kinds return themselves.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(arr) => {
                let copied: Vec<Value> =
                    arr.lock().unwrap().iter().map(Value::deep_copy).collect();
                Value::array(copied)
            }
            Value::Map(map) => {
                let copied: AHashMap<String, Value> = map
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::map(copied)
            }
            Value::SyncMap(map) => {
                let copied: AHashMap<String, Value> = map
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::SyncMap(Arc::new(RwLock::new(copied)))
            }
            Value::Bytes(bytes) => Value::bytes(bytes.lock().unwrap().clone()),
            other => other.clone(),
        }
    }

    /// Quoted form used inside container display.
    fn repr(&self) -> String {
        match self {
            Value::String(s) => format!("{:?}", s),
            Value::Char(c) => format!("{:?}", c),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Uint(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Char(c) => write!(f, "{}", c),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => {
                write!(f, "{}", String::from_utf8_lossy(&b.lock().unwrap()))
            }
            Value::Array(arr) => {
                let arr = arr.lock().unwrap();
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v.repr())?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                let map = map.lock().unwrap();
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v.repr())?;
                }
                write!(f, "}}")
            }
            Value::SyncMap(map) => {
                let map = map.read().unwrap();
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v.repr())?;
                }
                write!(f, "}}")
            }
            Value::Error(err) => write!(f, "{}: {}", err.name, err.message),
            Value::Function(_) => write!(f, "<compiledFunction>"),
            Value::Builtin(b) => write!(f, "<builtinFunction:{}>", b.name()),
            Value::Native(n) => write!(f, "<function:{}>", n.name),
            Value::NameCaller(nc) => write!(f, "<{}>", nc.type_name()),
            Value::Ptr(_) => write!(f, "<objectPtr>"),
            Value::Iterator(_) => write!(f, "<iterator>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.equal(other)
    }
}

/// Hashable identity of a primitive constant, used to deduplicate the
/// constant pool by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Undefined,
    Bool(bool),
    Int(i64),
    Uint(u64),
    /// IEEE bit pattern; folds -0.0 and 0.0 apart, which is fine for dedup.
    Float(u64),
    Char(char),
    Str(Arc<str>),
}

impl Value {
    pub fn const_key(&self) -> Option<ConstKey> {
        match self {
            Value::Undefined => Some(ConstKey::Undefined),
            Value::Bool(b) => Some(ConstKey::Bool(*b)),
            Value::Int(n) => Some(ConstKey::Int(*n)),
            Value::Uint(n) => Some(ConstKey::Uint(*n)),
            Value::Float(x) => Some(ConstKey::Float(x.to_bits())),
            Value::Char(c) => Some(ConstKey::Char(*c)),
            Value::String(s) => Some(ConstKey::Str(s.clone())),
            _ => None,
        }
    }
}

/// Cursor over an iterable value. `next` advances; `key`/`value` read the
/// current pair without consuming it.
#[derive(Debug)]
pub enum ValueIterator {
    Array { arr: Arc<Mutex<Vec<Value>>>, pos: i64 },
    Map { map: Arc<Mutex<AHashMap<String, Value>>>, keys: Vec<String>, pos: i64 },
    SyncMap { map: Arc<RwLock<AHashMap<String, Value>>>, keys: Vec<String>, pos: i64 },
    Str { chars: Vec<(usize, char)>, pos: i64 },
    Bytes { bytes: Arc<Mutex<Vec<u8>>>, pos: i64 },
}

impl ValueIterator {
    pub fn next(&mut self) -> bool {
        match self {
            ValueIterator::Array { arr, pos } => {
                *pos += 1;
                (*pos as usize) < arr.lock().unwrap().len()
            }
            ValueIterator::Map { keys, pos, .. } | ValueIterator::SyncMap { keys, pos, .. } => {
                *pos += 1;
                (*pos as usize) < keys.len()
            }
            ValueIterator::Str { chars, pos } => {
                *pos += 1;
                (*pos as usize) < chars.len()
            }
            ValueIterator::Bytes { bytes, pos } => {
                *pos += 1;
                (*pos as usize) < bytes.lock().unwrap().len()
            }
        }
    }

    pub fn key(&self) -> Value {
        match self {
            ValueIterator::Array { pos, .. } | ValueIterator::Bytes { pos, .. } => {
                Value::Int(*pos)
            }
            ValueIterator::Map { keys, pos, .. } | ValueIterator::SyncMap { keys, pos, .. } => {
                keys.get(*pos as usize)
                    .map(|k| Value::string(k.as_str()))
                    .unwrap_or(Value::Undefined)
            }
            ValueIterator::Str { chars, pos } => chars
                .get(*pos as usize)
                .map(|(i, _)| Value::Int(*i as i64))
                .unwrap_or(Value::Undefined),
        }
    }

    pub fn value(&self) -> Value {
        match self {
            ValueIterator::Array { arr, pos } => arr
                .lock()
                .unwrap()
                .get(*pos as usize)
                .cloned()
                .unwrap_or(Value::Undefined),
            ValueIterator::Map { map, keys, pos } => keys
                .get(*pos as usize)
                .and_then(|k| map.lock().unwrap().get(k).cloned())
                .unwrap_or(Value::Undefined),
            ValueIterator::SyncMap { map, keys, pos } => keys
                .get(*pos as usize)
                .and_then(|k| map.read().unwrap().get(k).cloned())
                .unwrap_or(Value::Undefined),
            ValueIterator::Str { chars, pos } => chars
                .get(*pos as usize)
                .map(|(_, c)| Value::Char(*c))
                .unwrap_or(Value::Undefined),
            ValueIterator::Bytes { bytes, pos } => bytes
                .lock()
                .unwrap()
                .get(*pos as usize)
                .map(|b| Value::Int(*b as i64))
                .unwrap_or(Value::Undefined),
        }
    }
}

// Numeric promotion order for mixed-kind arithmetic: Float beats Uint
// beats Int; Bool and Char coerce to Int first.
#[derive(PartialEq, PartialOrd)]
enum NumKind {
    Int,
    Uint,
    Float,
}

fn num_kind(v: &Value) -> Option<NumKind> {
    match v {
        Value::Int(_) | Value::Bool(_) | Value::Char(_) => Some(NumKind::Int),
        Value::Uint(_) => Some(NumKind::Uint),
        Value::Float(_) => Some(NumKind::Float),
        _ => None,
    }
}

fn to_i64(v: &Value) -> i64 {
    match v {
        Value::Int(n) => *n,
        Value::Uint(n) => *n as i64,
        Value::Float(f) => *f as i64,
        Value::Char(c) => *c as u32 as i64,
        Value::Bool(b) => *b as i64,
        _ => 0,
    }
}

fn to_u64(v: &Value) -> u64 {
    match v {
        Value::Int(n) => *n as u64,
        Value::Uint(n) => *n,
        Value::Float(f) => *f as u64,
        Value::Char(c) => *c as u32 as u64,
        Value::Bool(b) => *b as u64,
        _ => 0,
    }
}

fn int_binary_op(tok: Token, a: i64, b: i64) -> Result<Value, RuntimeError> {
    let out = match tok {
        Token::Add => a.wrapping_add(b),
        Token::Sub => a.wrapping_sub(b),
        Token::Mul => a.wrapping_mul(b),
        Token::Quo => {
            if b == 0 {
                return Err(RuntimeError::zero_division());
            }
            a.wrapping_div(b)
        }
        Token::Rem => {
            if b == 0 {
                return Err(RuntimeError::zero_division());
            }
            a.wrapping_rem(b)
        }
        Token::And => a & b,
        Token::Or => a | b,
        Token::Xor => a ^ b,
        Token::AndNot => a & !b,
        Token::Shl => a.wrapping_shl(b as u32),
        Token::Shr => a.wrapping_shr(b as u32),
        Token::Less => return Ok(Value::Bool(a < b)),
        Token::Greater => return Ok(Value::Bool(a > b)),
        Token::LessEq => return Ok(Value::Bool(a <= b)),
        Token::GreaterEq => return Ok(Value::Bool(a >= b)),
        _ => return Err(RuntimeError::invalid_operator(tok.symbol(), "int", "int")),
    };
    Ok(Value::Int(out))
}

fn uint_binary_op(tok: Token, a: u64, b: u64) -> Result<Value, RuntimeError> {
    let out = match tok {
        Token::Add => a.wrapping_add(b),
        Token::Sub => a.wrapping_sub(b),
        Token::Mul => a.wrapping_mul(b),
        Token::Quo => {
            if b == 0 {
                return Err(RuntimeError::zero_division());
            }
            a / b
        }
        Token::Rem => {
            if b == 0 {
                return Err(RuntimeError::zero_division());
            }
            a % b
        }
        Token::And => a & b,
        Token::Or => a | b,
        Token::Xor => a ^ b,
        Token::AndNot => a & !b,
        Token::Shl => a.wrapping_shl(b as u32),
        Token::Shr => a.wrapping_shr(b as u32),
        Token::Less => return Ok(Value::Bool(a < b)),
        Token::Greater => return Ok(Value::Bool(a > b)),
        Token::LessEq => return Ok(Value::Bool(a <= b)),
        Token::GreaterEq => return Ok(Value::Bool(a >= b)),
        _ => return Err(RuntimeError::invalid_operator(tok.symbol(), "uint", "uint")),
    };
    Ok(Value::Uint(out))
}

fn float_binary_op(tok: Token, a: f64, b: f64) -> Result<Value, RuntimeError> {
    let out = match tok {
        Token::Add => a + b,
        Token::Sub => a - b,
        Token::Mul => a * b,
        // IEEE semantics: float division by zero yields an infinity.
        Token::Quo => a / b,
        Token::Rem => a % b,
        Token::Less => return Ok(Value::Bool(a < b)),
        Token::Greater => return Ok(Value::Bool(a > b)),
        Token::LessEq => return Ok(Value::Bool(a <= b)),
        Token::GreaterEq => return Ok(Value::Bool(a >= b)),
        _ => return Err(RuntimeError::invalid_operator(tok.symbol(), "float", "float")),
    };
    Ok(Value::Float(out))
}

fn char_result(tok: Token, value: Value) -> Result<Value, RuntimeError> {
    // Char +/- Int stays a Char when the result is a valid scalar.
    if matches!(tok, Token::Add | Token::Sub) {
        if let Value::Int(n) = value {
            if let Ok(code) = u32::try_from(n) {
                if let Some(c) = char::from_u32(code) {
                    return Ok(Value::Char(c));
                }
            }
            return Err(RuntimeError::type_error(format!(
                "char arithmetic produced an invalid scalar value {}",
                n
            )));
        }
    }
    Ok(value)
}

/// The `BinaryOp` opcode implementation shared by the VM and optimizer.
pub fn binary_op(tok: Token, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match tok {
        Token::Equal => return Ok(Value::Bool(left.equal(right))),
        Token::NotEqual => return Ok(Value::Bool(!left.equal(right))),
        _ => {}
    }

    match (left, right) {
        // `String + X` stringifies X; ordered comparison is lexicographic.
        (Value::String(a), _) => match tok {
            Token::Add => {
                let mut out = String::with_capacity(a.len());
                out.push_str(a);
                out.push_str(&right.to_string());
                Ok(Value::string(out))
            }
            Token::Less | Token::Greater | Token::LessEq | Token::GreaterEq => match right {
                Value::String(b) => Ok(Value::Bool(match tok {
                    Token::Less => a < b,
                    Token::Greater => a > b,
                    Token::LessEq => a <= b,
                    _ => a >= b,
                })),
                _ => Err(RuntimeError::invalid_operator(
                    tok.symbol(),
                    left.type_name(),
                    right.type_name(),
                )),
            },
            _ => Err(RuntimeError::invalid_operator(
                tok.symbol(),
                left.type_name(),
                right.type_name(),
            )),
        },
        (Value::Bytes(a), _) if tok == Token::Add => {
            let mut out = a.lock().unwrap().clone();
            match right {
                Value::Bytes(b) => out.extend_from_slice(&b.lock().unwrap()),
                Value::String(s) => out.extend_from_slice(s.as_bytes()),
                _ => {
                    return Err(RuntimeError::invalid_operator(
                        tok.symbol(),
                        left.type_name(),
                        right.type_name(),
                    ))
                }
            }
            Ok(Value::bytes(out))
        }
        (Value::Array(a), Value::Array(b)) if tok == Token::Add => {
            let mut out = a.lock().unwrap().clone();
            out.extend(b.lock().unwrap().iter().cloned());
            Ok(Value::array(out))
        }
        (Value::Char(_), _) | (_, Value::Char(_))
            if num_kind(left).is_some() && num_kind(right).is_some() =>
        {
            // Chars do integer arithmetic; +/- with an Int yields a Char
            // again, Char - Char yields the Int distance.
            let keep_char = matches!(left, Value::Char(_))
                && !matches!((tok, right), (Token::Sub, Value::Char(_)));
            let result = numeric_binary_op(tok, left, right)?;
            if keep_char {
                char_result(tok, result)
            } else {
                Ok(result)
            }
        }
        _ if num_kind(left).is_some() && num_kind(right).is_some() => {
            numeric_binary_op(tok, left, right)
        }
        _ => Err(RuntimeError::invalid_operator(
            tok.symbol(),
            left.type_name(),
            right.type_name(),
        )),
    }
}

fn numeric_binary_op(tok: Token, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let lk = num_kind(left).unwrap_or(NumKind::Int);
    let rk = num_kind(right).unwrap_or(NumKind::Int);
    if lk == NumKind::Float || rk == NumKind::Float {
        // Bitwise and shift operators are not defined for floats.
        if matches!(
            tok,
            Token::And | Token::Or | Token::Xor | Token::AndNot | Token::Shl | Token::Shr
        ) {
            return Err(RuntimeError::invalid_operator(
                tok.symbol(),
                left.type_name(),
                right.type_name(),
            ));
        }
        let (a, b) = (left.as_float().unwrap_or(0.0), right.as_float().unwrap_or(0.0));
        float_binary_op(tok, a, b)
    } else if lk == NumKind::Uint || rk == NumKind::Uint {
        uint_binary_op(tok, to_u64(left), to_u64(right))
    } else {
        int_binary_op(tok, to_i64(left), to_i64(right))
    }
}

/// The `Unary` opcode implementation: `!`, `-`, `+`, and bitwise `^`.
pub fn unary_op(tok: Token, operand: &Value) -> Result<Value, RuntimeError> {
    match tok {
        Token::Not => Ok(Value::Bool(operand.is_falsy())),
        Token::Sub => match operand {
            Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            Value::Uint(n) => Ok(Value::Uint(n.wrapping_neg())),
            Value::Float(x) => Ok(Value::Float(-x)),
            Value::Char(c) => Ok(Value::Int(-(*c as u32 as i64))),
            Value::Bool(b) => Ok(Value::Int(-(*b as i64))),
            other => Err(RuntimeError::type_error(format!(
                "operator '-' not defined for '{}'",
                other.type_name()
            ))),
        },
        Token::Add => match operand {
            Value::Int(_) | Value::Uint(_) | Value::Float(_) | Value::Char(_) => {
                Ok(operand.clone())
            }
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            other => Err(RuntimeError::type_error(format!(
                "operator '+' not defined for '{}'",
                other.type_name()
            ))),
        },
        Token::Xor => match operand {
            Value::Int(n) => Ok(Value::Int(!n)),
            Value::Uint(n) => Ok(Value::Uint(!n)),
            Value::Bool(b) => Ok(Value::Int(!(*b as i64))),
            other => Err(RuntimeError::type_error(format!(
                "operator '^' not defined for '{}'",
                other.type_name()
            ))),
        },
        _ => Err(RuntimeError::type_error(format!(
            "invalid unary operator '{}'",
            tok.symbol()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falsiness() {
        assert!(Value::Undefined.is_falsy());
        assert!(Value::Int(0).is_falsy());
        assert!(!Value::Int(-1).is_falsy());
        assert!(Value::Float(f64::NAN).is_falsy());
        // Only NaN is falsy for floats; zero is truthy.
        assert!(!Value::Float(0.0).is_falsy());
        assert!(Value::string("").is_falsy());
        assert!(Value::error("error", "boom").is_falsy());
        assert!(!Value::array(vec![Value::Int(1)]).is_falsy());
    }

    #[test]
    fn test_numeric_promotion() {
        let v = binary_op(Token::Add, &Value::Int(1), &Value::Float(2.5)).unwrap();
        assert_eq!(v, Value::Float(3.5));
        let v = binary_op(Token::Add, &Value::Int(-1), &Value::Uint(2)).unwrap();
        assert_eq!(v, Value::Uint(1));
        let v = binary_op(Token::Add, &Value::Bool(true), &Value::Int(2)).unwrap();
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn test_zero_division() {
        let err = binary_op(Token::Quo, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
        let err = binary_op(Token::Rem, &Value::Uint(1), &Value::Uint(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
        // Float division by zero is IEEE infinity, not an error.
        let v = binary_op(Token::Quo, &Value::Float(1.0), &Value::Float(0.0)).unwrap();
        assert_eq!(v, Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_string_concat_stringifies_rhs() {
        let v = binary_op(Token::Add, &Value::string("n="), &Value::Int(42)).unwrap();
        assert_eq!(v, Value::string("n=42"));
    }

    #[test]
    fn test_char_arithmetic() {
        let v = binary_op(Token::Add, &Value::Char('a'), &Value::Int(1)).unwrap();
        assert_eq!(v, Value::Char('b'));
        let v = binary_op(Token::Sub, &Value::Char('b'), &Value::Char('a')).unwrap();
        assert_eq!(v, Value::Int(1));
    }

    #[test]
    fn test_cross_kind_equality() {
        assert!(Value::Int(1).equal(&Value::Uint(1)));
        assert!(Value::Int(1).equal(&Value::Float(1.0)));
        assert!(Value::Bool(true).equal(&Value::Int(1)));
        assert!(!Value::string("1").equal(&Value::Int(1)));
    }

    #[test]
    fn test_array_index_bounds() {
        let arr = Value::array(vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(arr.index_get(&Value::Int(1)).unwrap(), Value::Int(20));
        let err = arr.index_get(&Value::Int(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfBounds);
        let err = arr.index_get(&Value::Int(-1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfBounds);
    }

    #[test]
    fn test_map_missing_key_is_undefined() {
        let map = Value::empty_map();
        assert_eq!(map.index_get(&Value::string("nope")).unwrap(), Value::Undefined);
        map.index_set(&Value::Int(1), Value::Int(9)).unwrap();
        // Map keys stringify.
        assert_eq!(map.index_get(&Value::string("1")).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_iterator_protocol() {
        let arr = Value::array(vec![Value::Int(5), Value::Int(6)]);
        let mut it = arr.iterate().unwrap();
        assert!(it.next());
        assert_eq!(it.key(), Value::Int(0));
        assert_eq!(it.value(), Value::Int(5));
        assert!(it.next());
        assert_eq!(it.value(), Value::Int(6));
        assert!(!it.next());
    }

    #[test]
    fn test_deep_copy_isolates_containers() {
        let inner = Value::array(vec![Value::Int(1)]);
        let outer = Value::array(vec![inner.clone()]);
        let copied = outer.deep_copy();
        inner.index_set(&Value::Int(0), Value::Int(99)).unwrap();
        let copied_inner = copied.index_get(&Value::Int(0)).unwrap();
        assert_eq!(copied_inner.index_get(&Value::Int(0)).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_runtime_error_round_trip() {
        let err = RuntimeError::zero_division();
        let value = Value::from_runtime_error(&err);
        let back = value.to_runtime_error();
        assert_eq!(back.kind, ErrorKind::ZeroDivisionError);
    }

    #[test]
    fn test_unary_ops() {
        assert_eq!(unary_op(Token::Not, &Value::Int(0)).unwrap(), Value::Bool(true));
        assert_eq!(unary_op(Token::Sub, &Value::Int(3)).unwrap(), Value::Int(-3));
        assert_eq!(unary_op(Token::Xor, &Value::Int(0)).unwrap(), Value::Int(-1));
        assert_eq!(unary_op(Token::Add, &Value::Bool(true)).unwrap(), Value::Int(1));
    }
}
