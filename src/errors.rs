// File: src/errors.rs
//
// Error types for the uGO compiler and virtual machine.
// Compile-time diagnostics carry a source location; runtime errors carry a
// kind, an optional cause chain, and the stack trace collected while
// unwinding frames.

use colored::Colorize;
use std::fmt;

/// A position in a source file. Line and column are 1-based; `0:0` means
/// the position is unknown (e.g. synthesized instructions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0 }
    }

    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Which stage produced a compile-time diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Parse,
    Compile,
    Optimizer,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileErrorKind::Parse => write!(f, "Parse Error"),
            CompileErrorKind::Compile => write!(f, "Compile Error"),
            CompileErrorKind::Optimizer => write!(f, "Optimizer Error"),
        }
    }
}

/// A compile-time diagnostic: parse, compile, or optimizer stage.
///
/// The optimizer may accumulate several of these before bailing out; the
/// aggregate's `Display` shows the first, matching the embedding contract.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub location: SourceLocation,
    /// Extra diagnostics gathered in the same pass (optimizer only).
    pub others: Vec<CompileError>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        Self { kind, message: message.into(), location, others: Vec::new() }
    }

    pub fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(CompileErrorKind::Parse, message, location)
    }

    pub fn compile(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(CompileErrorKind::Compile, message, location)
    }

    pub fn optimizer(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(CompileErrorKind::Optimizer, message, location)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = format!("{}", self.kind);
        write!(f, "{}: {}", kind.red().bold(), self.message.bold())?;
        if self.location.is_known() {
            write!(f, "\n{}", format!("  --> {}", self.location).bright_blue())?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Runtime error kinds raised by the VM and builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic user-thrown error (`throw "boom"`).
    Error,
    TypeError,
    InvalidOperator,
    NotIndexable,
    NotIndexAssignable,
    IndexOutOfBounds,
    InvalidIndex,
    NotIterable,
    NotCallable,
    WrongNumArguments,
    ArgumentTypeError,
    ZeroDivisionError,
    StackOverflow,
    VMAborted,
    ModuleNotFound,
}

impl ErrorKind {
    /// The name exposed to scripts as the error value's `Name` field and
    /// matched by the `isError` builtin.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::InvalidOperator => "InvalidOperatorError",
            ErrorKind::NotIndexable => "NotIndexableError",
            ErrorKind::NotIndexAssignable => "NotIndexAssignableError",
            ErrorKind::IndexOutOfBounds => "IndexOutOfBoundsError",
            ErrorKind::InvalidIndex => "InvalidIndexError",
            ErrorKind::NotIterable => "NotIterableError",
            ErrorKind::NotCallable => "NotCallableError",
            ErrorKind::WrongNumArguments => "WrongNumArgumentsError",
            ErrorKind::ArgumentTypeError => "ArgumentTypeError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::StackOverflow => "StackOverflowError",
            ErrorKind::VMAborted => "VMAbortedError",
            ErrorKind::ModuleNotFound => "ModuleNotFoundError",
        }
    }

    /// Reverse of `name`; lets a re-thrown error value keep its kind.
    pub fn from_name(name: &str) -> Option<ErrorKind> {
        const ALL: &[ErrorKind] = &[
            ErrorKind::Error,
            ErrorKind::TypeError,
            ErrorKind::InvalidOperator,
            ErrorKind::NotIndexable,
            ErrorKind::NotIndexAssignable,
            ErrorKind::IndexOutOfBounds,
            ErrorKind::InvalidIndex,
            ErrorKind::NotIterable,
            ErrorKind::NotCallable,
            ErrorKind::WrongNumArguments,
            ErrorKind::ArgumentTypeError,
            ErrorKind::ZeroDivisionError,
            ErrorKind::StackOverflow,
            ErrorKind::VMAborted,
            ErrorKind::ModuleNotFound,
        ];
        ALL.iter().copied().find(|k| k.name() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime error with its unwind trace.
///
/// The VM appends one trace entry per frame boundary crossed while the
/// error propagates without being caught.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<RuntimeError>>,
    pub trace: Vec<SourceLocation>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None, trace: Vec::new() }
    }

    pub fn with_cause(mut self, cause: RuntimeError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn invalid_operator(op: &str, left: &str, right: &str) -> Self {
        Self::new(
            ErrorKind::InvalidOperator,
            format!("operator '{}' not defined for '{}' and '{}'", op, left, right),
        )
    }

    pub fn not_indexable(type_name: &str) -> Self {
        Self::new(ErrorKind::NotIndexable, format!("'{}' is not indexable", type_name))
    }

    pub fn not_index_assignable(type_name: &str) -> Self {
        Self::new(
            ErrorKind::NotIndexAssignable,
            format!("'{}' is not index-assignable", type_name),
        )
    }

    pub fn index_out_of_bounds(index: i64, len: usize) -> Self {
        Self::new(
            ErrorKind::IndexOutOfBounds,
            format!("index {} out of bounds for length {}", index, len),
        )
    }

    pub fn invalid_index(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidIndex, detail)
    }

    pub fn not_iterable(type_name: &str) -> Self {
        Self::new(ErrorKind::NotIterable, format!("'{}' is not iterable", type_name))
    }

    pub fn not_callable(type_name: &str) -> Self {
        Self::new(ErrorKind::NotCallable, format!("'{}' is not callable", type_name))
    }

    pub fn wrong_num_arguments(want: impl fmt::Display, got: usize) -> Self {
        Self::new(
            ErrorKind::WrongNumArguments,
            format!("want={} got={}", want, got),
        )
    }

    pub fn argument_type_error(pos: usize, want: &str, got: &str) -> Self {
        Self::new(
            ErrorKind::ArgumentTypeError,
            format!("argument {}: want '{}', got '{}'", pos, want, got),
        )
    }

    pub fn zero_division() -> Self {
        Self::new(ErrorKind::ZeroDivisionError, "integer division or modulo by zero")
    }

    pub fn stack_overflow(detail: &str) -> Self {
        Self::new(ErrorKind::StackOverflow, detail)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::VMAborted, "VM aborted")
    }

    /// Pushes a trace entry recorded while unwinding a frame.
    pub fn push_trace(&mut self, location: SourceLocation) {
        self.trace.push(location);
    }

    /// Walks the cause chain looking for the given kind name.
    pub fn has_kind_name(&self, name: &str) -> bool {
        if self.kind.name() == name {
            return true;
        }
        match &self.cause {
            Some(cause) => cause.has_kind_name(name),
            None => false,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = format!("{}", self.kind);
        if self.message.is_empty() {
            write!(f, "{}", kind.red().bold())?;
        } else {
            write!(f, "{}: {}", kind.red().bold(), self.message.bold())?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "\n  caused by: {}: {}", cause.kind, cause.message)?;
        }
        for loc in &self.trace {
            if loc.is_known() {
                write!(f, "\n{}", format!("  at {}", loc).bright_blue())?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ErrorKind::ZeroDivisionError.name(), "ZeroDivisionError");
        assert_eq!(ErrorKind::Error.name(), "error");
    }

    #[test]
    fn test_cause_chain_lookup() {
        let inner = RuntimeError::zero_division();
        let outer = RuntimeError::new(ErrorKind::Error, "wrapped").with_cause(inner);
        assert!(outer.has_kind_name("ZeroDivisionError"));
        assert!(outer.has_kind_name("error"));
        assert!(!outer.has_kind_name("TypeError"));
    }

    #[test]
    fn test_trace_accumulates_in_unwind_order() {
        let mut err = RuntimeError::type_error("bad");
        err.push_trace(SourceLocation::new(3, 1));
        err.push_trace(SourceLocation::new(9, 5));
        assert_eq!(err.trace.len(), 2);
        assert_eq!(err.trace[0], SourceLocation::new(3, 1));
    }
}
