//! REQUIRE — library loading.
//!
//! `REQUIRE "name"` asks the interpreter's [`Loader`] for a bundle of
//! functions and ADDRESS targets to merge into the running program. The
//! trait is the integration seam: embedding applications decide where
//! libraries come from. [`RegistryLoader`] is the in-process implementation,
//! a registry of library definitions with dependency recursion; fetching
//! from anywhere remote is out of scope for the runtime itself.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::address::AddressTarget;
use crate::error::{Diagnostic, ErrorKind, RexxResult};
use crate::value::Value;

/// A host-provided function callable from scripts.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> RexxResult<Value>>;

/// What one `REQUIRE` delivers. Function names and target names are
/// uppercased on merge, matching symbol resolution everywhere else.
#[derive(Default)]
pub struct LibraryExports {
    pub functions: HashMap<String, NativeFn>,
    pub address_targets: Vec<(String, Box<dyn AddressTarget>)>,
}

impl LibraryExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(
        mut self,
        name: &str,
        f: impl Fn(&[Value]) -> RexxResult<Value> + 'static,
    ) -> Self {
        self.functions.insert(name.to_uppercase(), Rc::new(f));
        self
    }

    pub fn with_target(mut self, name: &str, target: Box<dyn AddressTarget>) -> Self {
        self.address_targets.push((name.to_uppercase(), target));
        self
    }

    fn merge(&mut self, other: LibraryExports) {
        self.functions.extend(other.functions);
        self.address_targets.extend(other.address_targets);
    }
}

// Hand-written: the export values are trait objects and closures.
impl std::fmt::Debug for LibraryExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut functions: Vec<&String> = self.functions.keys().collect();
        functions.sort();
        f.debug_struct("LibraryExports")
            .field("functions", &functions)
            .field(
                "address_targets",
                &self
                    .address_targets
                    .iter()
                    .map(|(name, _)| name)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub trait Loader {
    /// Resolve `name` to its exports, dependencies included. Unknown names
    /// are a fatal diagnostic — REQUIRE is strict about structure.
    fn load(&mut self, name: &str) -> RexxResult<LibraryExports>;
}

/// A loader that refuses everything. The interpreter's default until the
/// host installs a real one.
#[derive(Default)]
pub struct NoLoader;

impl Loader for NoLoader {
    fn load(&mut self, name: &str) -> RexxResult<LibraryExports> {
        Err(Diagnostic::new(
            ErrorKind::Eval,
            format!("REQUIRE '{name}': no library loader is installed"),
        ))
    }
}

type BuildFn = Box<dyn Fn() -> LibraryExports>;

struct LibraryDef {
    dependencies: Vec<String>,
    build: BuildFn,
}

/// In-process library registry. Libraries declare dependencies by name;
/// `load` resolves them depth-first, each library built once per call
/// chain, and a cycle is reported naming the library that closed it.
#[derive(Default)]
pub struct RegistryLoader {
    libraries: HashMap<String, LibraryDef>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        dependencies: &[&str],
        build: impl Fn() -> LibraryExports + 'static,
    ) {
        self.libraries.insert(
            name.to_uppercase(),
            LibraryDef {
                dependencies: dependencies.iter().map(|d| d.to_uppercase()).collect(),
                build: Box::new(build),
            },
        );
    }

    fn load_into(
        &self,
        name: &str,
        chain: &mut Vec<String>,
        out: &mut LibraryExports,
    ) -> RexxResult<()> {
        let upper = name.to_uppercase();
        if chain.contains(&upper) {
            return Err(Diagnostic::new(
                ErrorKind::Eval,
                format!(
                    "REQUIRE '{}': circular dependency through '{}' ({})",
                    chain.first().map_or(upper.as_str(), String::as_str),
                    upper,
                    chain.join(" -> "),
                ),
            ));
        }

        let def = self.libraries.get(&upper).ok_or_else(|| {
            Diagnostic::new(ErrorKind::Eval, format!("REQUIRE '{upper}': library not found"))
        })?;

        chain.push(upper.clone());
        for dep in &def.dependencies {
            self.load_into(dep, chain, out)?;
        }
        chain.pop();

        debug!(library = %upper, "loading library exports");
        out.merge((def.build)());
        Ok(())
    }
}

impl Loader for RegistryLoader {
    fn load(&mut self, name: &str) -> RexxResult<LibraryExports> {
        let mut exports = LibraryExports::new();
        let mut chain = Vec::new();
        self.load_into(name, &mut chain, &mut exports)?;
        Ok(exports)
    }
}
