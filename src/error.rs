// Error types for every stage of compiling and running a program.
//
// A few flat, hand-written enums with manual `Display` rather than
// reaching for a derive-macro crate.

use std::fmt;

use crate::value::Value;

/// A single compile-time diagnostic. The compiler collects these rather
/// than bailing at the first one, so a run can report more than one
/// syntax error.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError { line, message: message.into() }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

/// The runtime error kinds an opcode can raise before a `RuntimeException`
/// object has been synthesized. Kept separate from the user-visible
/// exception object so the VM can pattern-match on *kind* internally
/// (e.g. to decide whether a double fault occurred) without parsing
/// strings back out of a thrown value.
#[derive(Clone, Debug)]
pub enum RuntimeError {
    TypeError(String),
    UndefinedVariable(String),
    UndefinedProperty(String),
    ArityMismatch { expected: u8, got: u8 },
    IndexOutOfRange(i64),
    ConcurrentModification,
    StackOverflow,
    NotIterable,
    NotCallable,
    NonClassSuperclass,
    FieldShadowsSuper(String),
    BytecodeDataExecuted,
    DivideByZero,
    ClassHierarchyOverflow,
    Custom(String),
    /// A user `throw` of an actual object, carried through unwinding
    /// as-is so `catch` clauses can match against its real class
    /// instead of a synthesized stand-in.
    Raised(Value),
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RuntimeError::TypeError(a), RuntimeError::TypeError(b)) => a == b,
            (RuntimeError::UndefinedVariable(a), RuntimeError::UndefinedVariable(b)) => a == b,
            (RuntimeError::UndefinedProperty(a), RuntimeError::UndefinedProperty(b)) => a == b,
            (
                RuntimeError::ArityMismatch { expected: e1, got: g1 },
                RuntimeError::ArityMismatch { expected: e2, got: g2 },
            ) => e1 == e2 && g1 == g2,
            (RuntimeError::IndexOutOfRange(a), RuntimeError::IndexOutOfRange(b)) => a == b,
            (RuntimeError::ConcurrentModification, RuntimeError::ConcurrentModification) => true,
            (RuntimeError::StackOverflow, RuntimeError::StackOverflow) => true,
            (RuntimeError::NotIterable, RuntimeError::NotIterable) => true,
            (RuntimeError::NotCallable, RuntimeError::NotCallable) => true,
            (RuntimeError::NonClassSuperclass, RuntimeError::NonClassSuperclass) => true,
            (RuntimeError::FieldShadowsSuper(a), RuntimeError::FieldShadowsSuper(b)) => a == b,
            (RuntimeError::BytecodeDataExecuted, RuntimeError::BytecodeDataExecuted) => true,
            (RuntimeError::DivideByZero, RuntimeError::DivideByZero) => true,
            (RuntimeError::ClassHierarchyOverflow, RuntimeError::ClassHierarchyOverflow) => true,
            (RuntimeError::Custom(a), RuntimeError::Custom(b)) => a == b,
            (RuntimeError::Raised(a), RuntimeError::Raised(b)) => a.raw_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuntimeError::TypeError(m) => write!(f, "{}", m),
            RuntimeError::UndefinedVariable(n) => write!(f, "Undefined variable '{}'.", n),
            RuntimeError::UndefinedProperty(n) => write!(f, "Undefined property '{}'.", n),
            RuntimeError::ArityMismatch { expected, got } => {
                write!(f, "Expected {} arguments but got {}.", expected, got)
            }
            RuntimeError::IndexOutOfRange(i) => write!(f, "Index {} out of range.", i),
            RuntimeError::ConcurrentModification => {
                write!(f, "Map modified during iteration")
            }
            RuntimeError::StackOverflow => write!(f, "Stack overflow."),
            RuntimeError::NotIterable => write!(f, "Value is not iterable."),
            RuntimeError::NotCallable => write!(f, "Can only call functions and classes."),
            RuntimeError::NonClassSuperclass => write!(f, "Superclass must be a class."),
            RuntimeError::FieldShadowsSuper(n) => {
                write!(f, "Field '{}' shadows a member defined by a superclass.", n)
            }
            RuntimeError::BytecodeDataExecuted => {
                write!(f, "Attempted to execute embedded handler-table data.")
            }
            RuntimeError::DivideByZero => write!(f, "Division by zero."),
            RuntimeError::ClassHierarchyOverflow => {
                write!(f, "Class hierarchy is too deep: classId would overflow.")
            }
            RuntimeError::Custom(m) => write!(f, "{}", m),
            RuntimeError::Raised(_) => write!(f, "exception"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Top-level outcome of `Context::interpret`, exposed to embedders.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    /// A user-level exception, or a synthesized `RuntimeException`,
    /// escaped the outermost frame unhandled. Carries the formatted
    /// class name, message, and stack trace.
    Runtime { class_name: String, message: String, stack_trace: String },
    /// An exception was raised while the VM was already unwinding
    /// another exception. Fatal: the host must not continue running
    /// this `Context`.
    DoubleFault { first: String, second: String },
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterpretError::Compile(errs) => {
                for e in errs {
                    writeln!(f, "{}", e)?;
                }
                Ok(())
            }
            InterpretError::Runtime { class_name, message, stack_trace } => {
                writeln!(f, "Uncaught {}: {}", class_name, message)?;
                write!(f, "{}", stack_trace)
            }
            InterpretError::DoubleFault { first, second } => {
                write!(f, "double fault: {} while handling: {}", second, first)
            }
        }
    }
}

impl std::error::Error for InterpretError {}

pub type RResult<T> = Result<T, RuntimeError>;
