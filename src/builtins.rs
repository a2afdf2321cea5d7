// File: src/builtins.rs
//
// Builtin function table for the uGO VM.
// Builtins travel through bytecode as the 1-byte operand of GetBuiltin;
// the symbol table resolves their names unless a scope disables or
// shadows them. A few ids are error *values* rather than functions, so
// scripts can write isError(err, ZeroDivisionError).

use crate::errors::{ErrorKind, RuntimeError};
use crate::value::Value;
use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::fmt::Write as _;

/// Builtin ids. The discriminant is the GetBuiltin operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltinFunction {
    /// Destructuring helper emitted by the compiler; the leading colon
    /// keeps it out of the user namespace.
    MakeArray,
    Append,
    Len,
    Copy,
    Error,
    Int,
    Uint,
    Float,
    Char,
    String,
    Bytes,
    Bool,
    IsError,
    IsInt,
    IsUint,
    IsFloat,
    IsChar,
    IsBool,
    IsString,
    IsBytes,
    IsArray,
    IsMap,
    IsSyncMap,
    IsUndefined,
    IsFunction,
    IsCallable,
    IsIterable,
    TypeName,
    Sprintf,
    Print,
    Println,
    // Error values, not callables.
    TypeErrorValue,
    ZeroDivisionErrorValue,
    IndexOutOfBoundsErrorValue,
    NotIterableErrorValue,
    WrongNumArgumentsErrorValue,
    InvalidOperatorErrorValue,
    NotCallableErrorValue,
}

const NAMES: &[(&str, BuiltinFunction)] = &[
    (":makeArray", BuiltinFunction::MakeArray),
    ("append", BuiltinFunction::Append),
    ("len", BuiltinFunction::Len),
    ("copy", BuiltinFunction::Copy),
    ("error", BuiltinFunction::Error),
    ("int", BuiltinFunction::Int),
    ("uint", BuiltinFunction::Uint),
    ("float", BuiltinFunction::Float),
    ("char", BuiltinFunction::Char),
    ("string", BuiltinFunction::String),
    ("bytes", BuiltinFunction::Bytes),
    ("bool", BuiltinFunction::Bool),
    ("isError", BuiltinFunction::IsError),
    ("isInt", BuiltinFunction::IsInt),
    ("isUint", BuiltinFunction::IsUint),
    ("isFloat", BuiltinFunction::IsFloat),
    ("isChar", BuiltinFunction::IsChar),
    ("isBool", BuiltinFunction::IsBool),
    ("isString", BuiltinFunction::IsString),
    ("isBytes", BuiltinFunction::IsBytes),
    ("isArray", BuiltinFunction::IsArray),
    ("isMap", BuiltinFunction::IsMap),
    ("isSyncMap", BuiltinFunction::IsSyncMap),
    ("isUndefined", BuiltinFunction::IsUndefined),
    ("isFunction", BuiltinFunction::IsFunction),
    ("isCallable", BuiltinFunction::IsCallable),
    ("isIterable", BuiltinFunction::IsIterable),
    ("typeName", BuiltinFunction::TypeName),
    ("sprintf", BuiltinFunction::Sprintf),
    ("print", BuiltinFunction::Print),
    ("println", BuiltinFunction::Println),
    ("TypeError", BuiltinFunction::TypeErrorValue),
    ("ZeroDivisionError", BuiltinFunction::ZeroDivisionErrorValue),
    ("IndexOutOfBoundsError", BuiltinFunction::IndexOutOfBoundsErrorValue),
    ("NotIterableError", BuiltinFunction::NotIterableErrorValue),
    ("WrongNumArgumentsError", BuiltinFunction::WrongNumArgumentsErrorValue),
    ("InvalidOperatorError", BuiltinFunction::InvalidOperatorErrorValue),
    ("NotCallableError", BuiltinFunction::NotCallableErrorValue),
];

static BY_NAME: Lazy<AHashMap<&'static str, BuiltinFunction>> =
    Lazy::new(|| NAMES.iter().copied().collect());

impl BuiltinFunction {
    pub fn lookup(name: &str) -> Option<BuiltinFunction> {
        BY_NAME.get(name).copied()
    }

    pub fn from_id(id: u8) -> Option<BuiltinFunction> {
        NAMES
            .iter()
            .map(|&(_, b)| b)
            .find(|b| *b as u8 == id)
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|&&(_, b)| b == self)
            .map(|&(n, _)| n)
            .unwrap_or("?")
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// The kind behind an error-value id, None for callables.
    fn error_kind(self) -> Option<ErrorKind> {
        match self {
            BuiltinFunction::TypeErrorValue => Some(ErrorKind::TypeError),
            BuiltinFunction::ZeroDivisionErrorValue => Some(ErrorKind::ZeroDivisionError),
            BuiltinFunction::IndexOutOfBoundsErrorValue => Some(ErrorKind::IndexOutOfBounds),
            BuiltinFunction::NotIterableErrorValue => Some(ErrorKind::NotIterable),
            BuiltinFunction::WrongNumArgumentsErrorValue => Some(ErrorKind::WrongNumArguments),
            BuiltinFunction::InvalidOperatorErrorValue => Some(ErrorKind::InvalidOperator),
            BuiltinFunction::NotCallableErrorValue => Some(ErrorKind::NotCallable),
            _ => None,
        }
    }

    /// The value GetBuiltin pushes: the callable itself, or the error
    /// value for error ids.
    pub fn value(self) -> Value {
        match self.error_kind() {
            Some(kind) => Value::error(kind.name(), ""),
            None => Value::Builtin(self),
        }
    }

    /// Whitelist for the optimizer's sandbox evaluation: conversions and
    /// pure predicates only; nothing that allocates containers or does IO.
    pub fn safe_for_optimizer(self) -> bool {
        matches!(
            self,
            BuiltinFunction::Len
                | BuiltinFunction::Int
                | BuiltinFunction::Uint
                | BuiltinFunction::Float
                | BuiltinFunction::Char
                | BuiltinFunction::String
                | BuiltinFunction::Bool
                | BuiltinFunction::IsError
                | BuiltinFunction::IsInt
                | BuiltinFunction::IsUint
                | BuiltinFunction::IsFloat
                | BuiltinFunction::IsChar
                | BuiltinFunction::IsBool
                | BuiltinFunction::IsString
                | BuiltinFunction::IsBytes
                | BuiltinFunction::IsArray
                | BuiltinFunction::IsMap
                | BuiltinFunction::IsSyncMap
                | BuiltinFunction::IsUndefined
                | BuiltinFunction::IsFunction
                | BuiltinFunction::IsCallable
                | BuiltinFunction::IsIterable
                | BuiltinFunction::TypeName
                | BuiltinFunction::Sprintf
        )
    }

    pub fn call(self, args: &[Value]) -> Result<Value, RuntimeError> {
        match self {
            BuiltinFunction::MakeArray => make_array(args),
            BuiltinFunction::Append => append(args),
            BuiltinFunction::Len => {
                want_exact(self, args, 1)?;
                args[0]
                    .length()
                    .map(|n| Value::Int(n as i64))
                    .ok_or_else(|| {
                        RuntimeError::argument_type_error(1, "lengthable", args[0].type_name())
                    })
            }
            BuiltinFunction::Copy => {
                want_exact(self, args, 1)?;
                Ok(args[0].deep_copy())
            }
            BuiltinFunction::Error => {
                want_exact(self, args, 1)?;
                Ok(Value::error("error", args[0].to_string()))
            }
            BuiltinFunction::Int => {
                want_exact(self, args, 1)?;
                convert_int(&args[0])
            }
            BuiltinFunction::Uint => {
                want_exact(self, args, 1)?;
                convert_uint(&args[0])
            }
            BuiltinFunction::Float => {
                want_exact(self, args, 1)?;
                convert_float(&args[0])
            }
            BuiltinFunction::Char => {
                want_exact(self, args, 1)?;
                convert_char(&args[0])
            }
            BuiltinFunction::String => {
                want_exact(self, args, 1)?;
                Ok(Value::string(args[0].to_string()))
            }
            BuiltinFunction::Bytes => {
                want_exact(self, args, 1)?;
                convert_bytes(&args[0])
            }
            BuiltinFunction::Bool => {
                want_exact(self, args, 1)?;
                Ok(Value::Bool(!args[0].is_falsy()))
            }
            BuiltinFunction::IsError => is_error(args),
            BuiltinFunction::IsInt => predicate(self, args, |v| matches!(v, Value::Int(_))),
            BuiltinFunction::IsUint => predicate(self, args, |v| matches!(v, Value::Uint(_))),
            BuiltinFunction::IsFloat => predicate(self, args, |v| matches!(v, Value::Float(_))),
            BuiltinFunction::IsChar => predicate(self, args, |v| matches!(v, Value::Char(_))),
            BuiltinFunction::IsBool => predicate(self, args, |v| matches!(v, Value::Bool(_))),
            BuiltinFunction::IsString => predicate(self, args, |v| matches!(v, Value::String(_))),
            BuiltinFunction::IsBytes => predicate(self, args, |v| matches!(v, Value::Bytes(_))),
            BuiltinFunction::IsArray => predicate(self, args, |v| matches!(v, Value::Array(_))),
            BuiltinFunction::IsMap => predicate(self, args, |v| matches!(v, Value::Map(_))),
            BuiltinFunction::IsSyncMap => {
                predicate(self, args, |v| matches!(v, Value::SyncMap(_)))
            }
            BuiltinFunction::IsUndefined => {
                predicate(self, args, |v| matches!(v, Value::Undefined))
            }
            BuiltinFunction::IsFunction => predicate(self, args, |v| {
                matches!(v, Value::Function(_) | Value::Builtin(_) | Value::Native(_))
            }),
            BuiltinFunction::IsCallable => predicate(self, args, Value::can_call),
            BuiltinFunction::IsIterable => predicate(self, args, Value::can_iterate),
            BuiltinFunction::TypeName => {
                want_exact(self, args, 1)?;
                Ok(Value::string(args[0].type_name()))
            }
            BuiltinFunction::Sprintf => sprintf(args),
            BuiltinFunction::Print => {
                print!("{}", join_display(args));
                Ok(Value::Undefined)
            }
            BuiltinFunction::Println => {
                println!("{}", join_display(args));
                Ok(Value::Undefined)
            }
            _ => Err(RuntimeError::not_callable("error")),
        }
    }
}

fn want_exact(b: BuiltinFunction, args: &[Value], n: usize) -> Result<(), RuntimeError> {
    if args.len() != n {
        return Err(RuntimeError::wrong_num_arguments(
            format!("{} for {}", n, b.name()),
            args.len(),
        ));
    }
    Ok(())
}

fn predicate(
    b: BuiltinFunction,
    args: &[Value],
    test: impl Fn(&Value) -> bool,
) -> Result<Value, RuntimeError> {
    want_exact(b, args, 1)?;
    Ok(Value::Bool(test(&args[0])))
}

// makeArray(n, value): fixed-width destructuring view of `value`.
fn make_array(args: &[Value]) -> Result<Value, RuntimeError> {
    want_exact(BuiltinFunction::MakeArray, args, 2)?;
    let n = args[0].as_index().unwrap_or(0).max(0) as usize;
    let mut out = Vec::with_capacity(n);
    match &args[1] {
        Value::Array(arr) => {
            let arr = arr.lock().unwrap();
            out.extend(arr.iter().take(n).cloned());
        }
        other => {
            if n > 0 {
                out.push(other.clone());
            }
        }
    }
    while out.len() < n {
        out.push(Value::Undefined);
    }
    Ok(Value::array(out))
}

fn append(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(RuntimeError::wrong_num_arguments(">=1 for append", 0));
    }
    match &args[0] {
        Value::Array(arr) => {
            let mut out = arr.lock().unwrap().clone();
            out.extend(args[1..].iter().cloned());
            Ok(Value::array(out))
        }
        Value::Bytes(bytes) => {
            let mut out = bytes.lock().unwrap().clone();
            for (i, arg) in args[1..].iter().enumerate() {
                let byte = arg.as_index().filter(|b| (0..=255).contains(b)).ok_or_else(
                    || RuntimeError::argument_type_error(i + 2, "byte", arg.type_name()),
                )?;
                out.push(byte as u8);
            }
            Ok(Value::bytes(out))
        }
        Value::Undefined => Ok(Value::array(args[1..].to_vec())),
        other => Err(RuntimeError::argument_type_error(
            1,
            "array|bytes|undefined",
            other.type_name(),
        )),
    }
}

// isError(err) / isError(err, target): the two-argument form matches the
// target's name against the error's name-cause chain.
fn is_error(args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [value] => Ok(Value::Bool(matches!(value, Value::Error(_)))),
        [value, target] => {
            let target = match target {
                Value::Error(e) => e,
                other => {
                    return Err(RuntimeError::argument_type_error(
                        2,
                        "error",
                        other.type_name(),
                    ))
                }
            };
            let Value::Error(mut err) = value.clone() else {
                return Ok(Value::Bool(false));
            };
            loop {
                if err.name == target.name {
                    return Ok(Value::Bool(true));
                }
                let next = match &err.cause {
                    Some(Value::Error(cause)) => cause.clone(),
                    _ => return Ok(Value::Bool(false)),
                };
                err = next;
            }
        }
        _ => Err(RuntimeError::wrong_num_arguments("1..2 for isError", args.len())),
    }
}

fn convert_int(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Uint(n) => Ok(Value::Int(*n as i64)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Char(c) => Ok(Value::Int(*c as u32 as i64)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| RuntimeError::type_error(format!("cannot convert {:?} to int", s))),
        other => Err(RuntimeError::argument_type_error(1, "numeric|string", other.type_name())),
    }
}

fn convert_uint(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Uint(*n as u64)),
        Value::Uint(n) => Ok(Value::Uint(*n)),
        Value::Float(f) => Ok(Value::Uint(*f as u64)),
        Value::Char(c) => Ok(Value::Uint(*c as u32 as u64)),
        Value::Bool(b) => Ok(Value::Uint(*b as u64)),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map(Value::Uint)
            .map_err(|_| RuntimeError::type_error(format!("cannot convert {:?} to uint", s))),
        other => Err(RuntimeError::argument_type_error(1, "numeric|string", other.type_name())),
    }
}

fn convert_float(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Float(*n as f64)),
        Value::Uint(n) => Ok(Value::Float(*n as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Char(c) => Ok(Value::Float(*c as u32 as f64)),
        Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| RuntimeError::type_error(format!("cannot convert {:?} to float", s))),
        other => Err(RuntimeError::argument_type_error(1, "numeric|string", other.type_name())),
    }
}

fn convert_char(v: &Value) -> Result<Value, RuntimeError> {
    let fail = || RuntimeError::type_error("cannot convert value to char");
    match v {
        Value::Char(c) => Ok(Value::Char(*c)),
        Value::Int(n) => u32::try_from(*n)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(fail),
        Value::Uint(n) => u32::try_from(*n)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(fail),
        Value::String(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Char(c)),
                _ => Err(fail()),
            }
        }
        other => Err(RuntimeError::argument_type_error(
            1,
            "int|uint|char|string",
            other.type_name(),
        )),
    }
}

fn convert_bytes(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Bytes(b) => Ok(Value::bytes(b.lock().unwrap().clone())),
        Value::String(s) => Ok(Value::bytes(s.as_bytes().to_vec())),
        Value::Array(arr) => {
            let arr = arr.lock().unwrap();
            let mut out = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                let byte = item.as_index().filter(|b| (0..=255).contains(b)).ok_or_else(
                    || RuntimeError::argument_type_error(i + 1, "byte", item.type_name()),
                )?;
                out.push(byte as u8);
            }
            Ok(Value::bytes(out))
        }
        other => Err(RuntimeError::argument_type_error(
            1,
            "bytes|string|array",
            other.type_name(),
        )),
    }
}

fn join_display(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}", arg);
    }
    out
}

// Minimal printf-style formatter: %v %s %d %f %t %q %%.
fn sprintf(args: &[Value]) -> Result<Value, RuntimeError> {
    let format = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(RuntimeError::argument_type_error(1, "string", other.type_name()))
        }
        None => return Err(RuntimeError::wrong_num_arguments(">=1 for sprintf", 0)),
    };
    let mut out = String::with_capacity(format.len());
    let mut rest = args[1..].iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb) => {
                let arg = rest.next().cloned().unwrap_or(Value::Undefined);
                match verb {
                    'v' | 's' => {
                        let _ = write!(out, "{}", arg);
                    }
                    'd' => match arg.as_index() {
                        Some(n) => {
                            let _ = write!(out, "{}", n);
                        }
                        None => {
                            let _ = write!(out, "%!d({})", arg);
                        }
                    },
                    'f' => match arg {
                        Value::Float(f) => {
                            let _ = write!(out, "{:.6}", f);
                        }
                        Value::Int(n) => {
                            let _ = write!(out, "{:.6}", n as f64);
                        }
                        Value::Uint(n) => {
                            let _ = write!(out, "{:.6}", n as f64);
                        }
                        other => {
                            let _ = write!(out, "%!f({})", other);
                        }
                    },
                    't' => {
                        let _ = write!(out, "{}", !arg.is_falsy());
                    }
                    'q' => {
                        let _ = write!(out, "{:?}", arg.to_string());
                    }
                    other => {
                        out.push('%');
                        out.push(other);
                    }
                }
            }
            None => out.push('%'),
        }
    }
    Ok(Value::string(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_round_trip() {
        for &(name, b) in NAMES {
            assert_eq!(BuiltinFunction::lookup(name), Some(b));
            assert_eq!(b.name(), name);
            assert_eq!(BuiltinFunction::from_id(b.id()), Some(b));
        }
        assert_eq!(BuiltinFunction::lookup("nope"), None);
    }

    #[test]
    fn test_make_array_pads_and_truncates() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let out = make_array(&[Value::Int(2), arr]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(1), Value::Int(2)]));

        let out = make_array(&[Value::Int(2), Value::Int(9)]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(9), Value::Undefined]));
    }

    #[test]
    fn test_is_error_matches_name_chain() {
        let zero = BuiltinFunction::ZeroDivisionErrorValue.value();
        let err = Value::error("ZeroDivisionError", "1/0");
        assert_eq!(is_error(&[err.clone()]).unwrap(), Value::Bool(true));
        assert_eq!(is_error(&[err, zero.clone()]).unwrap(), Value::Bool(true));
        let other = Value::error("TypeError", "bad");
        assert_eq!(is_error(&[other, zero]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            BuiltinFunction::Int.call(&[Value::string("42")]).unwrap(),
            Value::Int(42)
        );
        assert!(BuiltinFunction::Int.call(&[Value::string("x")]).is_err());
        assert_eq!(
            BuiltinFunction::Char.call(&[Value::Int(97)]).unwrap(),
            Value::Char('a')
        );
        assert_eq!(
            BuiltinFunction::String.call(&[Value::Int(7)]).unwrap(),
            Value::string("7")
        );
        assert_eq!(
            BuiltinFunction::Bool.call(&[Value::Int(0)]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_sprintf_verbs() {
        let out = sprintf(&[
            Value::string("%v %d %t %q 100%%"),
            Value::string("a"),
            Value::Int(3),
            Value::Int(1),
            Value::string("b"),
        ])
        .unwrap();
        assert_eq!(out, Value::string("a 3 true \"b\" 100%"));
    }

    #[test]
    fn test_error_values_not_callable() {
        assert!(BuiltinFunction::ZeroDivisionErrorValue.call(&[]).is_err());
        let v = BuiltinFunction::ZeroDivisionErrorValue.value();
        assert_eq!(v.type_name(), "error");
    }
}
