use crate::bytecode::Opcode;
use crate::lang::value::{Kind, Symbol, Value};
use thiserror::Error;

/// Contract violation between the bytecode producer and the VM.
///
/// A fault means the code being executed is corrupt; it is never the user's
/// program misbehaving. Faults unwind like any other error but are not meant
/// to be recovered from.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("unknown opcode {byte:#04x} at pc={pc}")]
    UnknownOpcode { byte: u8, pc: usize },
    #[error("executed invalid instruction at pc={pc}")]
    InvalidInstruction { pc: usize },
    #[error("instruction stream truncated at pc={pc}")]
    Truncated { pc: usize },
    #[error("pc={pc} is not an instruction boundary")]
    Misaligned { pc: usize },
    #[error("jump from pc={pc} lands outside the code (target {target})")]
    JumpOutOfRange { pc: usize, target: i64 },
    #[error("constant pool index {index} out of range (pool has {len} entries)")]
    ConstantOutOfRange { index: u32, len: usize },
    #[error("source pool index {index} out of range (pool has {len} entries)")]
    SourceOutOfRange { index: u32, len: usize },
    #[error("child offset {offset} out of range (code has {len} children)")]
    ChildOutOfRange { offset: u32, len: usize },
    #[error("code index {0} out of range")]
    CodeOutOfRange(u32),
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("integer stack underflow")]
    IntStackUnderflow,
    #[error("{stack} stack imbalance: expected depth {expected}, found {found}")]
    StackImbalance {
        stack: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("cannot reserve {requested} slots on the {stack} stack")]
    StackReserve {
        stack: &'static str,
        requested: usize,
    },
    #[error("{op}: expected {expected}, found {found}")]
    TypeShape {
        op: Opcode,
        expected: &'static str,
        found: Kind,
    },
    #[error("stack argument {index} out of range ({num_args} passed)")]
    ArgOutOfRange { index: i64, num_args: usize },
    #[error("'{0}' is no longer bound to a primitive")]
    NotPrimitive(Symbol),
    #[error("unknown primitive #{0}")]
    UnknownPrimitive(u16),
}

/// Errors surfaced to the program being run.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("object '{0}' not found")]
    UnboundVariable(Symbol),
    #[error("could not find function \"{0}\"")]
    UnboundFunction(Symbol),
    #[error("argument \"{0}\" is missing, with no default")]
    MissingArgument(Symbol),
    #[error("argument {0} is empty")]
    EmptyArgument(usize),
    #[error("{0}")]
    InvalidCondition(&'static str),
    #[error("attempt to apply non-function ({0})")]
    NotCallable(Kind),
    #[error("unused argument ({0})")]
    UnusedArgument(String),
    #[error("{found} arguments passed to '{name}' which requires {expected}")]
    Arity {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("..{0} used in an incorrect context, no ... to look in")]
    NoDots(usize),
    #[error("the ... list contains fewer than {0} elements")]
    DotsIndex(usize),
    #[error(
        "promise already under evaluation: recursive default argument reference or earlier problems?"
    )]
    RecursiveForce,
    #[error("closure body is not compiled")]
    NotCompiled,
    #[error("compilation failed: {0}")]
    Compile(String),
    #[error("{0}")]
    Primitive(String),
    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    CallDepth(usize),
    #[error("execution step limit exceeded ({0})")]
    StepLimit(usize),
    #[error("corrupt bytecode: {0}")]
    Fault(#[from] Fault),
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    /// Syntax of the call or expression that raised the error.
    pub call: Option<Value>,
    /// Outermost frame first.
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.kind)?;

        if let Some(call) = &self.call {
            write!(f, "\n  in: {}", call)?;
        }

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn new(kind: ErrorKind) -> Self {
        RuntimeError {
            kind,
            call: None,
            call_stack: Vec::new(),
        }
    }

    /// Primitive failure with a free-form message.
    pub fn primitive(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Primitive(msg.into()))
    }

    /// Attach the call syntax unless one is already recorded.
    pub fn with_call(mut self, call: Value) -> Self {
        if self.call.is_none() && !matches!(call, Value::Null) {
            self.call = Some(call);
        }
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.kind, ErrorKind::Fault(_))
    }
}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}

impl From<Fault> for RuntimeError {
    fn from(fault: Fault) -> Self {
        RuntimeError::new(ErrorKind::Fault(fault))
    }
}

/// Shorthand for an error result tagged with the offending syntax.
pub fn error_at<T>(kind: ErrorKind, call: Option<Value>) -> Result<T, RuntimeError> {
    let err = RuntimeError::new(kind);
    Err(match call {
        Some(call) => err.with_call(call),
        None => err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_call_and_stack() {
        let err = RuntimeError::new(ErrorKind::UnboundVariable(Symbol::new("x")))
            .with_call(Value::symbol("x"))
            .with_context("f(x)")
            .with_context("x");
        let text = err.to_string();
        assert!(text.starts_with("runtime error: object 'x' not found"));
        assert!(text.contains("\n  in: x"));
        assert!(text.contains("0: x"));
        assert!(text.contains("1: f(x)"));
    }

    #[test]
    fn test_with_call_keeps_innermost() {
        let err = RuntimeError::new(ErrorKind::RecursiveForce)
            .with_call(Value::symbol("inner"))
            .with_call(Value::symbol("outer"));
        assert_eq!(err.call, Some(Value::symbol("inner")));

        let err = RuntimeError::new(ErrorKind::RecursiveForce)
            .with_call(Value::Null)
            .with_call(Value::symbol("outer"));
        assert_eq!(err.call, Some(Value::symbol("outer")));
    }

    #[test]
    fn test_fault_wraps_into_error_kind() {
        let err: RuntimeError = Fault::StackUnderflow.into();
        assert!(err.is_fault());
        assert_eq!(
            err.to_string(),
            "runtime error: corrupt bytecode: operand stack underflow"
        );
    }

    #[test]
    fn test_condition_messages() {
        let err = RuntimeError::new(ErrorKind::InvalidCondition("argument is of length zero"));
        assert_eq!(err.to_string(), "runtime error: argument is of length zero");
    }
}
