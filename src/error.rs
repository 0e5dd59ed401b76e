//! Diagnostics for the relay-rexx runtime.
//!
//! REXX is permissive about *data* (unset symbols, loose typing) and strict
//! about *structure* (unbalanced blocks, unknown labels, blocked directives).
//! Everything strict surfaces through [`Diagnostic`], decorated with the
//! source line and the active call-stack chain before it reaches the caller.

use std::fmt;

/// Error taxonomy. The kind decides how CLI wrappers map to exit codes;
/// inside the runtime it mostly matters for tests and for distinguishing
/// handler-reported failures from truly exceptional conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed literal or HEREDOC (unterminated string, missing delimiter).
    Lex,
    /// Structural parse failure (unbalanced blocks, bad directive syntax).
    Parse,
    /// Type mismatch in arithmetic, unresolvable explicit function call.
    Eval,
    /// ADDRESS handler failure, network failure, auth failure.
    Dispatch,
    /// Blocked by NO-INTERPRET, or nested parse/eval failure in INTERPRET.
    Interpret,
    /// SIGNAL to an unknown label.
    Signal,
    /// CALL or INTERPRET recursion exceeded the guard depth.
    StackOverflow,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Lex => "lex error",
            Self::Parse => "parse error",
            Self::Eval => "evaluation error",
            Self::Dispatch => "dispatch error",
            Self::Interpret => "interpret error",
            Self::Signal => "signal error",
            Self::StackOverflow => "stack overflow",
        }
    }
}

/// One frame of the call-stack chain attached to a surfaced error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Subroutine label, uppercased.
    pub label: String,
    /// Line of the CALL that created the frame.
    pub line: usize,
}

/// A runtime or parse error with location and call-chain context.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based source line, when known.
    pub line: Option<usize>,
    /// Innermost frame first.
    pub call_stack: Vec<FrameInfo>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            call_stack: Vec::new(),
        }
    }

    /// Attach a source line unless one is already recorded; the first
    /// (innermost) location wins.
    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }

    /// Record an unwound call frame while the error propagates outward.
    pub fn in_frame(mut self, label: &str, line: usize) -> Self {
        self.call_stack.push(FrameInfo {
            label: label.to_string(),
            line,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        if let Some(line) = self.line {
            write!(f, "\n  at line {line}")?;
        }
        for frame in &self.call_stack {
            write!(f, "\n  in {} (called at line {})", frame.label, frame.line)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

pub type RexxResult<T> = Result<T, Diagnostic>;
