//! Runtime values — string-first, with structured extras.
//!
//! Classic REXX treats every value as a character string; this dialect keeps
//! that duality for scalars (numbers are strings that parse, comparisons
//! yield "1"/"0") and adds JSON-shaped arrays and maps. Arrays and maps are
//! shared by reference within one environment; only the COPY built-in makes
//! a deep copy.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};

use crate::ast::Expr;
use crate::error::{Diagnostic, ErrorKind, RexxResult};

/// Significant digits for numeric formatting, matching REXX's traditional
/// NUMERIC DIGITS default.
pub const NUMERIC_DIGITS: u32 = 9;

/// An anonymous single-parameter function value produced by `param => expr`.
/// No persistent closure: the body is evaluated against whatever environment
/// is ambient at application time.
#[derive(Debug)]
pub struct LambdaValue {
    pub param: String,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Num(BigDecimal),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<BTreeMap<String, Value>>>),
    Lambda(Rc<LambdaValue>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn number(n: impl Into<BigDecimal>) -> Self {
        Self::Num(n.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(Rc::new(RefCell::new(entries)))
    }

    /// REXX boolean: "1" for true, "0" for false.
    pub fn bool(b: bool) -> Self {
        Self::Str(if b { "1" } else { "0" }.to_string())
    }

    pub fn empty() -> Self {
        Self::Str(String::new())
    }

    /// Interpret this value as a REXX number: leading/trailing whitespace
    /// trimmed, decimal notation only (no implicit hexadecimal).
    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Self::Num(d) => Some(d.clone()),
            Self::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.starts_with("0x") || trimmed.starts_with("0X") {
                    return None;
                }
                BigDecimal::from_str(trimmed).ok()
            }
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        self.as_decimal().is_some()
    }

    /// Coerce to a number or fail with a typed error — arithmetic never
    /// produces a silent NaN.
    pub fn require_number(&self, context: &str) -> RexxResult<BigDecimal> {
        self.as_decimal().ok_or_else(|| {
            Diagnostic::new(
                ErrorKind::Eval,
                format!("{context}: '{self}' is not a number"),
            )
        })
    }

    /// Permissive logical coercion: "1"/"true" and nonzero numbers are true;
    /// "0"/"false"/"" and zero are false. Anything else is a structural
    /// error, not a silent guess.
    pub fn as_logical(&self) -> RexxResult<bool> {
        match self {
            Self::Num(d) => Ok(!d.is_zero()),
            Self::Str(s) => match s.trim() {
                "1" => Ok(true),
                "0" | "" => Ok(false),
                other if other.eq_ignore_ascii_case("true") => Ok(true),
                other if other.eq_ignore_ascii_case("false") => Ok(false),
                other => Err(Diagnostic::new(
                    ErrorKind::Eval,
                    format!("'{other}' is not a logical value"),
                )),
            },
            _ => Err(Diagnostic::new(
                ErrorKind::Eval,
                "arrays and maps are not logical values",
            )),
        }
    }

    /// Format a decimal the REXX way: round to NUMERIC_DIGITS significant
    /// behavior, strip trailing zeros after the decimal point.
    pub fn from_decimal(d: &BigDecimal) -> Self {
        Self::Str(format_decimal(d))
    }

    /// Deep copy. Scalars are value-like already; lists and maps get fresh
    /// backing storage all the way down. This is the COPY operation — plain
    /// assignment shares the reference.
    pub fn deep_copy(&self) -> Value {
        match self {
            Self::Str(_) | Self::Num(_) | Self::Lambda(_) => self.clone(),
            Self::List(items) => {
                let copied = items.borrow().iter().map(Value::deep_copy).collect();
                Value::list(copied)
            }
            Self::Map(entries) => {
                let copied = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::map(copied)
            }
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::empty(),
            serde_json::Value::Bool(b) => Value::bool(*b),
            serde_json::Value::Number(n) => BigDecimal::from_str(&n.to_string())
                .map(Value::Num)
                .unwrap_or_else(|_| Value::string(n.to_string())),
            serde_json::Value::String(s) => Value::string(s.clone()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Num(d) => serde_json::Number::from_str(&format_decimal(d))
                .map(serde_json::Value::Number)
                .unwrap_or_else(|_| serde_json::Value::String(format_decimal(d))),
            Self::List(items) => {
                serde_json::Value::Array(items.borrow().iter().map(Value::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Lambda(_) => serde_json::Value::String("<lambda>".to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Num(d) => write!(f, "{}", format_decimal(d)),
            Self::List(_) | Self::Map(_) => {
                write!(f, "{}", serde_json::to_string(&self.to_json()).unwrap_or_default())
            }
            Self::Lambda(l) => write!(f, "<lambda {}>", l.param),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(BigDecimal::from(n))
    }
}

/// Format a `BigDecimal` to a REXX-style string: trailing zeros after the
/// decimal point stripped, no spurious exponent for ordinary magnitudes.
pub fn format_decimal(d: &BigDecimal) -> String {
    let rounded = d.round(i64::from(NUMERIC_DIGITS));
    let s = rounded.normalized().to_plain_string();
    if s.contains('.') {
        let s = s.trim_end_matches('0');
        let s = s.trim_end_matches('.');
        if s.is_empty() || s == "-" {
            "0".to_string()
        } else {
            s.to_string()
        }
    } else {
        s
    }
}
