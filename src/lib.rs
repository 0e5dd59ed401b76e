#![allow(clippy::return_self_not_must_use)]

pub mod address;
pub mod ast;
pub mod builtins;
pub mod env;
pub mod error;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod require;
pub mod value;

pub use error::{Diagnostic, ErrorKind, RexxResult};
pub use interp::{CaptureSink, Interpreter, OutputSink, RunOutcome};
pub use value::Value;
