//! Variable environment — one flat, dynamically scoped pool.
//!
//! Subroutines read and write the caller's variables by default: `CALL` does
//! not create a fresh scope. The only constructor of a genuinely separate
//! environment is `INTERPRET ... WITH ISOLATED`, which allocates a new map,
//! optionally copies named entries in, and copies named entries out.
//!
//! Lookup returns `Option` — the REXX rule that an unset symbol evaluates to
//! its own uppercased name is applied at the evaluation site, so the
//! "permissive for data" policy lives in exactly one place.

use std::collections::HashMap;

use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable (case-insensitive). `None` means unset — not an
    /// error; callers decide what an unset name means.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(&name.to_uppercase()).cloned()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_uppercase(), value);
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.vars.contains_key(&name.to_uppercase())
    }

    pub fn remove(&mut self, name: &str) {
        self.vars.remove(&name.to_uppercase());
    }

    /// Build an isolated environment seeded with the named entries. Names
    /// not present are silently skipped — "available or not", same policy
    /// as unset-symbol evaluation. Values keep ordinary reference-sharing
    /// semantics; only the environment map itself is new.
    pub fn import_from(source: &Environment, names: &[String]) -> Environment {
        let mut env = Environment::new();
        for name in names {
            if let Some(val) = source.get(name) {
                env.set(name, val);
            }
        }
        env
    }

    /// Copy the named entries from `self` into `target`. Names never
    /// produced are silently skipped.
    pub fn export_into(&self, target: &mut Environment, names: &[String]) {
        for name in names {
            if let Some(val) = self.get(name) {
                target.set(name, val);
            }
        }
    }
}
