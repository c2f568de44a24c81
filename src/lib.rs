//! # thunkvm
//!
//! Execution core of a bytecode virtual machine for a dynamically typed,
//! lexically scoped, lazily evaluated language. Call arguments are not
//! evaluated at call time; they travel as promises and are forced on first
//! use.
//!
//! - [`bytecode`] holds the compiled units (`Code`, `Function`, `Pool`), the
//!   opcode table, an assembler, a verifier and a disassembler.
//! - [`lang`] is the value model: values, environments and promises.
//! - [`runtime`] is the interpreter: the dispatch loop, the call protocol,
//!   promise forcing and the host interface.

pub mod bytecode;
pub mod demo;
pub mod lang;
pub mod runtime;

pub use bytecode::{Code, Function, Opcode};
pub use lang::{env::Env, value::Value};
pub use runtime::{
    host::{Host, StdHost},
    runtime_error::{ErrorKind, Fault, RuntimeError},
    vm_bc::{Vm, VmConfig},
};
