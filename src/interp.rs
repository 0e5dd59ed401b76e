//! The interpreter — statement execution and expression evaluation.
//!
//! Control flow travels as an [`ExecSignal`] returned from each statement:
//! `Normal` continues, `Leave`/`Iterate` are intercepted by the nearest
//! loop, `Return` pops the current routine, `Signal` unwinds to the
//! top-level label scan, and `Exit` terminates the whole run no matter how
//! deep it started. EXIT or SIGNAL raised inside an expression-position
//! function call is parked in a pending slot and picked up at the next
//! statement boundary.
//!
//! There is one variable environment: `CALL` shares the caller's variables
//! (dynamic scoping). The only thing snapshotted per call frame is the
//! current ADDRESS target, plus the positional argument list for PARSE ARG.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use bigdecimal::{BigDecimal, One, RoundingMode, ToPrimitive, Zero};
use tracing::debug;

use crate::address::{
    interpolate, AddressRegistry, AddressTarget, DispatchPayload, HttpTarget,
};
use crate::ast::{
    BinOp, DoKind, DoLoop, Expr, InterpretMode, Program, Stmt, StmtKind, UnaryOp,
};
use crate::builtins::call_builtin;
use crate::env::Environment;
use crate::error::{Diagnostic, ErrorKind, RexxResult};
use crate::parser::parse_source;
use crate::require::{Loader, NativeFn, NoLoader};
use crate::value::{LambdaValue, Value};

/// Guard for CALL and INTERPRET recursion alike.
const MAX_DEPTH: usize = 100;

/// Largest exponent `**` accepts.
const MAX_EXPONENT: i64 = 9999;

/// What a finished run reports to the embedding caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
}

/// Control-flow outcome of one statement.
#[derive(Debug, Clone)]
pub enum ExecSignal {
    Normal,
    Leave,
    Iterate,
    Return(Option<Value>),
    Exit(i32),
    Signal(String),
}

/// Where SAY lines go. The CLI prints; tests capture.
pub trait OutputSink {
    fn output(&mut self, text: &str);
}

pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn output(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Shared-buffer sink for test assertions.
#[derive(Default, Clone)]
pub struct CaptureSink {
    lines: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl OutputSink for CaptureSink {
    fn output(&mut self, text: &str) {
        self.lines.borrow_mut().push(text.to_string());
    }
}

/// Per-run execution context: the statement list and its top-level labels.
struct Ctx<'p> {
    program: &'p Program,
    labels: &'p HashMap<String, usize>,
}

fn collect_labels(program: &Program) -> HashMap<String, usize> {
    let mut labels = HashMap::new();
    for (idx, stmt) in program.statements.iter().enumerate() {
        if let StmtKind::Label(name) = &stmt.kind {
            // first definition wins
            labels.entry(name.clone()).or_insert(idx);
        }
    }
    labels
}

pub struct Interpreter {
    env: Environment,
    registry: AddressRegistry,
    functions: HashMap<String, NativeFn>,
    loader: Box<dyn Loader>,
    loaded: HashSet<String>,
    sink: Box<dyn OutputSink>,
    result_queue: VecDeque<Value>,
    /// Positional arguments per call frame; the bottom entry is the
    /// program-level argument list.
    arg_stack: Vec<Vec<Value>>,
    current_target: Option<String>,
    no_interpret: bool,
    call_depth: usize,
    interpret_depth: usize,
    pending_exit: Option<i32>,
    pending_signal: Option<String>,
    signal_line: Option<usize>,
    /// Line of the statement currently executing; call frames created in
    /// expression position record it as their call site.
    current_line: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
            registry: AddressRegistry::new(),
            functions: HashMap::new(),
            loader: Box::new(NoLoader),
            loaded: HashSet::new(),
            sink: Box::new(StdoutSink),
            result_queue: VecDeque::new(),
            arg_stack: vec![Vec::new()],
            current_target: None,
            no_interpret: false,
            call_depth: 0,
            interpret_depth: 0,
            pending_exit: None,
            pending_signal: None,
            signal_line: None,
            current_line: 0,
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sink = sink;
    }

    pub fn set_loader(&mut self, loader: Box<dyn Loader>) {
        self.loader = loader;
    }

    /// Program-level arguments, bound by PARSE ARG at top level.
    pub fn set_args(&mut self, args: Vec<Value>) {
        self.arg_stack[0] = args;
    }

    pub fn register_target(&mut self, name: &str, target: Box<dyn AddressTarget>) {
        self.registry.register(name, target);
    }

    pub fn register_function(
        &mut self,
        name: &str,
        f: impl Fn(&[Value]) -> RexxResult<Value> + 'static,
    ) {
        self.functions
            .insert(name.to_uppercase(), std::rc::Rc::new(f));
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn run_source(&mut self, source: &str) -> RexxResult<RunOutcome> {
        let program = parse_source(source)?;
        self.run(&program)
    }

    pub fn run(&mut self, program: &Program) -> RexxResult<RunOutcome> {
        match self.run_program(program)? {
            ExecSignal::Exit(code) => Ok(RunOutcome { exit_code: code }),
            ExecSignal::Signal(label) => {
                let mut err = Diagnostic::new(
                    ErrorKind::Signal,
                    format!("SIGNAL to unknown label '{label}'"),
                );
                if let Some(line) = self.signal_line {
                    err = err.at_line(line);
                }
                Err(err)
            }
            _ => Ok(RunOutcome { exit_code: 0 }),
        }
    }

    /// Execute a program with the SIGNAL restart loop: a `Signal` that names
    /// a label in this program restarts execution at that label; one that
    /// does not resolve here is handed back to the caller.
    fn run_program(&mut self, program: &Program) -> RexxResult<ExecSignal> {
        let labels = collect_labels(program);
        let ctx = Ctx {
            program,
            labels: &labels,
        };
        let mut start = 0;
        loop {
            match self.exec_from(&ctx, start)? {
                ExecSignal::Signal(label) => match labels.get(&label) {
                    Some(&idx) => start = idx,
                    None => return Ok(ExecSignal::Signal(label)),
                },
                other => return Ok(other),
            }
        }
    }

    fn exec_from(&mut self, ctx: &Ctx, start: usize) -> RexxResult<ExecSignal> {
        let mut i = start;
        while i < ctx.program.statements.len() {
            let stmt = &ctx.program.statements[i];
            let signal = self.exec_stmt(ctx, stmt)?;
            if let Some(pending) = self.take_pending() {
                return Ok(pending);
            }
            if !matches!(signal, ExecSignal::Normal) {
                return Ok(signal);
            }
            i += 1;
        }
        Ok(ExecSignal::Normal)
    }

    fn exec_body(&mut self, ctx: &Ctx, body: &[Stmt]) -> RexxResult<ExecSignal> {
        for stmt in body {
            let signal = self.exec_stmt(ctx, stmt)?;
            if let Some(pending) = self.take_pending() {
                return Ok(pending);
            }
            if !matches!(signal, ExecSignal::Normal) {
                return Ok(signal);
            }
        }
        Ok(ExecSignal::Normal)
    }

    /// EXIT/SIGNAL raised inside an expression-position call surfaces here,
    /// at the next statement boundary.
    fn take_pending(&mut self) -> Option<ExecSignal> {
        if let Some(code) = self.pending_exit.take() {
            return Some(ExecSignal::Exit(code));
        }
        if let Some(label) = self.pending_signal.take() {
            return Some(ExecSignal::Signal(label));
        }
        None
    }

    fn exec_stmt(&mut self, ctx: &Ctx, stmt: &Stmt) -> RexxResult<ExecSignal> {
        self.current_line = stmt.line;
        self.exec_stmt_inner(ctx, stmt)
            .map_err(|e| e.at_line(stmt.line))
    }

    #[allow(clippy::too_many_lines)]
    fn exec_stmt_inner(&mut self, ctx: &Ctx, stmt: &Stmt) -> RexxResult<ExecSignal> {
        match &stmt.kind {
            StmtKind::Label(_) | StmtKind::Nop => Ok(ExecSignal::Normal),

            StmtKind::Assign { name, expr } => {
                let value = self.eval_expr(ctx, expr)?;
                self.env.set(name, value);
                Ok(ExecSignal::Normal)
            }

            StmtKind::Say(expr) => {
                let value = self.eval_expr(ctx, expr)?;
                self.sink.output(&value.to_string());
                Ok(ExecSignal::Normal)
            }

            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.eval_expr(ctx, cond)?.as_logical()? {
                    self.exec_body(ctx, then_body)
                } else if let Some(body) = else_body {
                    self.exec_body(ctx, body)
                } else {
                    Ok(ExecSignal::Normal)
                }
            }

            StmtKind::Do(do_loop) => self.exec_do(ctx, do_loop),

            StmtKind::Select { whens, otherwise } => {
                for (cond, body) in whens {
                    if self.eval_expr(ctx, cond)?.as_logical()? {
                        return self.exec_body(ctx, body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_body(ctx, body);
                }
                Ok(ExecSignal::Normal)
            }

            StmtKind::Call { name, args } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(ctx, arg)?);
                }
                let returned = if ctx.labels.contains_key(name) {
                    self.call_routine(ctx, name, arg_values, stmt.line)?
                } else {
                    Some(self.call_function(name, &arg_values)?)
                };
                match returned {
                    Some(value) => {
                        self.env.set("RESULT", value.clone());
                        self.result_queue.push_back(value);
                    }
                    None => self.env.remove("RESULT"),
                }
                Ok(ExecSignal::Normal)
            }

            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(e) => Some(self.eval_expr(ctx, e)?),
                    None => None,
                };
                Ok(ExecSignal::Return(value))
            }

            StmtKind::Exit { code, unless } => {
                let exit_code = match code {
                    Some(e) => to_exit_code(&self.eval_expr(ctx, e)?),
                    None => 0,
                };
                if let Some(guard) = unless {
                    if self.eval_expr(ctx, &guard.cond)?.as_logical()? {
                        return Ok(ExecSignal::Normal);
                    }
                    if let Some(message) = &guard.message {
                        let text = self.eval_expr(ctx, message)?;
                        self.sink.output(&text.to_string());
                    }
                }
                Ok(ExecSignal::Exit(exit_code))
            }

            StmtKind::Signal(label) => {
                self.signal_line = Some(stmt.line);
                Ok(ExecSignal::Signal(label.clone()))
            }

            StmtKind::Leave => Ok(ExecSignal::Leave),
            StmtKind::Iterate => Ok(ExecSignal::Iterate),

            StmtKind::ParseArg(names) => {
                let args = self.arg_stack.last().cloned().unwrap_or_default();
                for (i, name) in names.iter().enumerate() {
                    let value = args.get(i).cloned().unwrap_or_else(Value::empty);
                    self.env.set(name, value);
                }
                Ok(ExecSignal::Normal)
            }

            StmtKind::Pull(name) => {
                let value = self.result_queue.pop_front().unwrap_or_else(Value::empty);
                self.env.set(name, value);
                Ok(ExecSignal::Normal)
            }

            StmtKind::AddressSet(target) => {
                self.current_target = if target.is_empty() {
                    None
                } else {
                    Some(target.clone())
                };
                Ok(ExecSignal::Normal)
            }

            StmtKind::AddressCommand { target, payload } => {
                let text = self.eval_expr(ctx, payload)?.to_string();
                self.dispatch(target, &DispatchPayload::Command(text), stmt.line)?;
                Ok(ExecSignal::Normal)
            }

            StmtKind::AddressHeredoc { target, body, json } => {
                let interpolated = interpolate(body, &self.env);
                let payload = if *json {
                    let parsed: serde_json::Value = serde_json::from_str(&interpolated)
                        .map_err(|e| {
                            Diagnostic::new(
                                ErrorKind::Dispatch,
                                format!("JSON HEREDOC for target '{target}' is not valid JSON: {e}"),
                            )
                        })?;
                    DispatchPayload::Json(Value::from_json(&parsed))
                } else {
                    DispatchPayload::Block(interpolated)
                };
                self.dispatch(target, &payload, stmt.line)?;
                Ok(ExecSignal::Normal)
            }

            StmtKind::AddressMatching { target, .. } => {
                // The pattern itself was compiled and armed at parse time;
                // at run time this just makes the target current.
                self.current_target = Some(target.clone());
                Ok(ExecSignal::Normal)
            }

            StmtKind::AddressLine(payload) => {
                let Some(target) = self.current_target.clone() else {
                    return Err(Diagnostic::new(
                        ErrorKind::Dispatch,
                        "matched line has no current ADDRESS target",
                    ));
                };
                self.dispatch(&target, &DispatchPayload::Command(payload.clone()), stmt.line)?;
                Ok(ExecSignal::Normal)
            }

            StmtKind::AddressRemote { url, auth, name } => {
                let url = self.eval_expr(ctx, url)?.to_string();
                let auth = match auth {
                    Some(e) => Some(self.eval_expr(ctx, e)?.to_string()),
                    None => None,
                };
                debug!(target = %name, %url, "registering remote ADDRESS target");
                self.registry
                    .register(name, Box::new(HttpTarget::new(url, auth)));
                Ok(ExecSignal::Normal)
            }

            StmtKind::Interpret { code, mode } => {
                let source = self.eval_expr(ctx, code)?.to_string();
                self.exec_interpret(&source, mode, stmt.line)
            }

            StmtKind::NoInterpret => {
                self.no_interpret = true;
                Ok(ExecSignal::Normal)
            }

            StmtKind::Require(expr) => {
                let name = self.eval_expr(ctx, expr)?.to_string();
                self.exec_require(&name)
            }

            StmtKind::Expression(expr) => {
                let value = self.eval_expr(ctx, expr)?;
                // A bare string expression is a command for the current
                // target, when one is active.
                if let (Some(target), Value::Str(text)) = (self.current_target.clone(), &value) {
                    self.dispatch(&target, &DispatchPayload::Command(text.clone()), stmt.line)?;
                }
                Ok(ExecSignal::Normal)
            }
        }
    }

    fn exec_do(&mut self, ctx: &Ctx, do_loop: &DoLoop) -> RexxResult<ExecSignal> {
        match &do_loop.kind {
            // Plain grouping; LEAVE/ITERATE pass through to an outer loop.
            DoKind::Simple => self.exec_body(ctx, &do_loop.body),

            DoKind::Counted { var, start, to, by } => {
                // Bounds evaluate once, before the first iteration.
                let mut current = self.eval_expr(ctx, start)?.require_number("DO start")?;
                let to = self.eval_expr(ctx, to)?.require_number("DO TO")?;
                let by = match by {
                    Some(e) => self.eval_expr(ctx, e)?.require_number("DO BY")?,
                    None => BigDecimal::one(),
                };
                let ascending = by >= BigDecimal::zero();
                loop {
                    if (ascending && current > to) || (!ascending && current < to) {
                        break;
                    }
                    self.env.set(var, Value::from_decimal(&current));
                    match self.exec_body(ctx, &do_loop.body)? {
                        ExecSignal::Leave => break,
                        ExecSignal::Iterate | ExecSignal::Normal => {}
                        other => return Ok(other),
                    }
                    current += &by;
                }
                Ok(ExecSignal::Normal)
            }

            DoKind::While(cond) => {
                while self.eval_expr(ctx, cond)?.as_logical()? {
                    match self.exec_body(ctx, &do_loop.body)? {
                        ExecSignal::Leave => break,
                        ExecSignal::Iterate | ExecSignal::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(ExecSignal::Normal)
            }

            DoKind::Until(cond) => {
                loop {
                    match self.exec_body(ctx, &do_loop.body)? {
                        ExecSignal::Leave => break,
                        ExecSignal::Iterate | ExecSignal::Normal => {}
                        other => return Ok(other),
                    }
                    if self.eval_expr(ctx, cond)?.as_logical()? {
                        break;
                    }
                }
                Ok(ExecSignal::Normal)
            }

            DoKind::Over { var, collection } => {
                // Snapshot at entry: mutating the collection mid-loop does
                // not change the iteration count.
                let elements = self.over_snapshot(ctx, collection)?;
                for element in elements {
                    self.env.set(var, element);
                    match self.exec_body(ctx, &do_loop.body)? {
                        ExecSignal::Leave => break,
                        ExecSignal::Iterate | ExecSignal::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(ExecSignal::Normal)
            }
        }
    }

    fn over_snapshot(&mut self, ctx: &Ctx, collection: &Expr) -> RexxResult<Vec<Value>> {
        let value = self.eval_expr(ctx, collection)?;
        Ok(match value {
            Value::List(items) => items.borrow().clone(),
            Value::Map(entries) => entries.borrow().keys().cloned().map(Value::string).collect(),
            other => other
                .to_string()
                .split_whitespace()
                .map(Value::string)
                .collect(),
        })
    }

    /// Execute a labeled routine. The one environment is shared; what gets
    /// saved per frame is the ADDRESS target and the argument list.
    fn call_routine(
        &mut self,
        ctx: &Ctx,
        name: &str,
        args: Vec<Value>,
        line: usize,
    ) -> RexxResult<Option<Value>> {
        let Some(&idx) = ctx.labels.get(name) else {
            return Err(Diagnostic::new(
                ErrorKind::Eval,
                format!("CALL: no label named '{name}'"),
            ));
        };
        if self.call_depth >= MAX_DEPTH {
            return Err(Diagnostic::new(
                ErrorKind::StackOverflow,
                format!("call depth exceeded {MAX_DEPTH} in '{name}'"),
            ));
        }

        self.call_depth += 1;
        self.arg_stack.push(args);
        let saved_target = self.current_target.clone();

        let result = self.exec_from(ctx, idx);

        self.current_target = saved_target;
        self.arg_stack.pop();
        self.call_depth -= 1;

        match result {
            Ok(ExecSignal::Return(value)) => Ok(value),
            Ok(ExecSignal::Exit(code)) => {
                self.pending_exit = Some(code);
                Ok(None)
            }
            Ok(ExecSignal::Signal(label)) => {
                self.pending_signal = Some(label);
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) => Err(e.in_frame(name, line)),
        }
    }

    fn dispatch(
        &mut self,
        target: &str,
        payload: &DispatchPayload,
        line: usize,
    ) -> RexxResult<()> {
        debug!(target, "dispatching ADDRESS payload");
        let outcome = match self.registry.get_mut(target) {
            Some(handler) => handler.handle(payload).map_err(|e| e.at_line(line))?,
            None => {
                return Err(Diagnostic::new(
                    ErrorKind::Dispatch,
                    format!("no ADDRESS target named '{}' is registered", target.to_uppercase()),
                )
                .at_line(line));
            }
        };
        self.env.set("RC", Value::from(outcome.rc));
        self.env.set("RESULT", outcome.result);
        self.env
            .set("ERRORTEXT", Value::string(outcome.error.unwrap_or_default()));
        Ok(())
    }

    fn exec_interpret(
        &mut self,
        source: &str,
        mode: &InterpretMode,
        line: usize,
    ) -> RexxResult<ExecSignal> {
        if self.no_interpret {
            return Err(Diagnostic::new(
                ErrorKind::Interpret,
                "INTERPRET is disabled: NO-INTERPRET is in effect",
            ));
        }
        if self.interpret_depth >= MAX_DEPTH {
            return Err(Diagnostic::new(
                ErrorKind::StackOverflow,
                format!("INTERPRET nesting exceeded {MAX_DEPTH}"),
            ));
        }
        debug!(mode = ?mode, "entering INTERPRET");
        let program = parse_source(source).map_err(|e| {
            Diagnostic::new(
                ErrorKind::Interpret,
                format!("INTERPRET: {}", e.message),
            )
        })?;

        self.interpret_depth += 1;
        let result = match mode {
            // Same environment, same ADDRESS context, full visibility both
            // ways. Labels resolve locally first; an unresolved SIGNAL is
            // handed to the enclosing program.
            InterpretMode::Classic => self.run_program(&program),

            InterpretMode::Isolated { imports, exports } => {
                let inner = Environment::import_from(&self.env, imports);
                let outer = std::mem::replace(&mut self.env, inner);
                let saved_target = self.current_target.take();

                let result = self.run_program(&program);

                let inner = std::mem::replace(&mut self.env, outer);
                self.current_target = saved_target;
                if result.is_ok() {
                    inner.export_into(&mut self.env, exports);
                }
                match result {
                    Ok(ExecSignal::Signal(label)) => Err(Diagnostic::new(
                        ErrorKind::Signal,
                        format!("SIGNAL to unknown label '{label}' inside isolated INTERPRET"),
                    )
                    .at_line(line)),
                    other => other,
                }
            }
        };
        self.interpret_depth -= 1;
        result
    }

    fn exec_require(&mut self, name: &str) -> RexxResult<ExecSignal> {
        let upper = name.to_uppercase();
        if self.loaded.contains(&upper) {
            return Ok(ExecSignal::Normal);
        }
        debug!(library = %upper, "REQUIRE");
        let exports = self.loader.load(&upper)?;
        self.functions.extend(exports.functions);
        for (target_name, target) in exports.address_targets {
            self.registry.register(&target_name, target);
        }
        self.loaded.insert(upper);
        Ok(ExecSignal::Normal)
    }

    // ── expression evaluation ───────────────────────────────────────

    fn eval_expr(&mut self, ctx: &Ctx, expr: &Expr) -> RexxResult<Value> {
        match expr {
            Expr::StringLit(s) => Ok(Value::string(s.clone())),

            Expr::HeredocLit { body, json } => {
                if *json {
                    let parsed: serde_json::Value = serde_json::from_str(body).map_err(|e| {
                        Diagnostic::new(
                            ErrorKind::Eval,
                            format!("JSON HEREDOC is not valid JSON: {e}"),
                        )
                    })?;
                    Ok(Value::from_json(&parsed))
                } else {
                    Ok(Value::string(body.clone()))
                }
            }

            Expr::Number(text) => Ok(BigDecimal::from_str(text)
                .map(Value::Num)
                .unwrap_or_else(|_| Value::string(text.clone()))),

            // An unset symbol evaluates to its own (already uppercased)
            // name. Missing data is never an error.
            Expr::Symbol(name) => Ok(self
                .env
                .get(name)
                .unwrap_or_else(|| Value::string(name.clone()))),

            Expr::Lambda { param, body } => Ok(Value::Lambda(std::rc::Rc::new(LambdaValue {
                param: param.clone(),
                body: (**body).clone(),
            }))),

            Expr::LambdaCall { lambda, args } => {
                let callee = self.eval_expr(ctx, lambda)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(ctx, arg)?);
                }
                match callee {
                    Value::Lambda(l) => self.apply_lambda(ctx, &l, &arg_values),
                    other => Err(Diagnostic::new(
                        ErrorKind::Eval,
                        format!("'{other}' is not callable"),
                    )),
                }
            }

            Expr::FunctionCall { name, args } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(ctx, arg)?);
                }
                // Resolution order: lambda-valued variable, internal label,
                // built-in, library function.
                if let Some(Value::Lambda(l)) = self.env.get(name) {
                    return self.apply_lambda(ctx, &l, &arg_values);
                }
                if ctx.labels.contains_key(name) {
                    let value = self.call_routine(ctx, name, arg_values, self.current_line)?;
                    return Ok(value.unwrap_or_else(Value::empty));
                }
                self.call_function(name, &arg_values)
            }

            Expr::BinOp { left, op, right } => {
                let l = self.eval_expr(ctx, left)?;
                let r = self.eval_expr(ctx, right)?;
                self.eval_binop(&l, *op, &r)
            }

            Expr::UnaryOp { op, operand } => {
                let v = self.eval_expr(ctx, operand)?;
                match op {
                    UnaryOp::Plus => Ok(Value::from_decimal(&v.require_number("unary '+'")?)),
                    UnaryOp::Minus => Ok(Value::from_decimal(&(-v.require_number("unary '-'")?))),
                    UnaryOp::Not => Ok(Value::bool(!v.as_logical()?)),
                }
            }

            Expr::Paren(inner) => self.eval_expr(ctx, inner),
        }
    }

    /// Built-in, then library function. Explicit call syntax on an unknown
    /// name is an error — unlike a bare symbol, which is just data.
    fn call_function(&mut self, name: &str, args: &[Value]) -> RexxResult<Value> {
        if let Some(result) = call_builtin(name, args) {
            return result;
        }
        if let Some(f) = self.functions.get(name).cloned() {
            return f(args);
        }
        Err(Diagnostic::new(
            ErrorKind::Eval,
            format!("function '{name}' not found"),
        ))
    }

    /// Apply a lambda: bind the parameter over the ambient environment for
    /// the duration of the body, then restore. No persistent closure.
    fn apply_lambda(
        &mut self,
        ctx: &Ctx,
        lambda: &LambdaValue,
        args: &[Value],
    ) -> RexxResult<Value> {
        let arg = args.first().cloned().unwrap_or_else(Value::empty);
        let saved = self.env.get(&lambda.param);
        self.env.set(&lambda.param, arg);
        let result = self.eval_expr(ctx, &lambda.body);
        match saved {
            Some(previous) => self.env.set(&lambda.param, previous),
            None => self.env.remove(&lambda.param),
        }
        result
    }

    fn eval_binop(&mut self, l: &Value, op: BinOp, r: &Value) -> RexxResult<Value> {
        match op {
            BinOp::Add => arith(l, r, "+", |a, b| Ok(a + b)),
            BinOp::Sub => arith(l, r, "-", |a, b| Ok(a - b)),
            BinOp::Mul => arith(l, r, "*", |a, b| Ok(a * b)),
            BinOp::Div => arith(l, r, "/", |a, b| {
                if b.is_zero() {
                    Err(Diagnostic::new(ErrorKind::Eval, "division by zero"))
                } else {
                    Ok(a / b)
                }
            }),
            BinOp::IntDiv => arith(l, r, "%", |a, b| {
                if b.is_zero() {
                    Err(Diagnostic::new(ErrorKind::Eval, "division by zero"))
                } else {
                    Ok((a / b).with_scale_round(0, RoundingMode::Down))
                }
            }),
            BinOp::Remainder => arith(l, r, "//", |a, b| {
                if b.is_zero() {
                    Err(Diagnostic::new(ErrorKind::Eval, "division by zero"))
                } else {
                    let quotient = (a / b).with_scale_round(0, RoundingMode::Down);
                    Ok(a - quotient * b)
                }
            }),
            BinOp::Power => {
                let base = l.require_number("operator '**'")?;
                let exp = r.require_number("operator '**'")?;
                Ok(Value::from_decimal(&power(&base, &exp)?))
            }

            BinOp::Concat => Ok(Value::string(format!("{l}{r}"))),
            BinOp::ConcatBlank => Ok(Value::string(format!("{l} {r}"))),

            BinOp::Eq => Ok(Value::bool(compare(l, r)? == std::cmp::Ordering::Equal)),
            BinOp::NotEq => Ok(Value::bool(compare(l, r)? != std::cmp::Ordering::Equal)),
            BinOp::Gt => Ok(Value::bool(compare(l, r)? == std::cmp::Ordering::Greater)),
            BinOp::Lt => Ok(Value::bool(compare(l, r)? == std::cmp::Ordering::Less)),
            BinOp::GtEq => Ok(Value::bool(compare(l, r)? != std::cmp::Ordering::Less)),
            BinOp::LtEq => Ok(Value::bool(compare(l, r)? != std::cmp::Ordering::Greater)),
            // Strict equality: exact character identity, no trimming, no
            // numeric coercion.
            BinOp::StrictEq => Ok(Value::bool(l.to_string() == r.to_string())),

            BinOp::And => Ok(Value::bool(l.as_logical()? && r.as_logical()?)),
            BinOp::Or => Ok(Value::bool(l.as_logical()? || r.as_logical()?)),
        }
    }
}

fn arith(
    l: &Value,
    r: &Value,
    op: &str,
    f: impl Fn(&BigDecimal, &BigDecimal) -> RexxResult<BigDecimal>,
) -> RexxResult<Value> {
    let a = l.require_number(&format!("operator '{op}'"))?;
    let b = r.require_number(&format!("operator '{op}'"))?;
    Ok(Value::from_decimal(&f(&a, &b)?))
}

/// Comparison: numeric iff both sides are numeric, otherwise a
/// case-respecting string comparison on trimmed text.
fn compare(l: &Value, r: &Value) -> RexxResult<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (l.as_decimal(), r.as_decimal()) {
        return Ok(a.cmp(&b));
    }
    Ok(l.to_string().trim().cmp(r.to_string().trim()))
}

fn power(base: &BigDecimal, exp: &BigDecimal) -> RexxResult<BigDecimal> {
    let Some(n) = exp.to_i64().filter(|_| exp.is_integer()) else {
        return Err(Diagnostic::new(
            ErrorKind::Eval,
            format!("operator '**': exponent must be a whole number, got '{exp}'"),
        ));
    };
    if n.abs() > MAX_EXPONENT {
        return Err(Diagnostic::new(
            ErrorKind::Eval,
            format!("operator '**': exponent {n} out of range"),
        ));
    }
    let mut result = BigDecimal::one();
    for _ in 0..n.unsigned_abs() {
        result = result * base;
    }
    if n < 0 {
        if result.is_zero() {
            return Err(Diagnostic::new(ErrorKind::Eval, "division by zero"));
        }
        result = BigDecimal::one() / result;
    }
    Ok(result)
}

/// EXIT code conversion: truncate toward zero; anything non-numeric is 0.
fn to_exit_code(value: &Value) -> i32 {
    value
        .as_decimal()
        .and_then(|d| d.with_scale_round(0, RoundingMode::Down).to_i32())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> (Vec<String>, i32) {
        let sink = CaptureSink::new();
        let mut interp = Interpreter::new();
        interp.set_sink(Box::new(sink.clone()));
        let outcome = interp.run_source(src).unwrap();
        (sink.lines(), outcome.exit_code)
    }

    fn run_err(src: &str) -> Diagnostic {
        let mut interp = Interpreter::new();
        interp.set_sink(Box::new(CaptureSink::new()));
        interp.run_source(src).unwrap_err()
    }

    #[test]
    fn expression_position_frames_record_the_call_line() {
        let err = run_err("SAY 'start'\nSAY BOOM()\nEXIT 0\nBOOM:\nSAY 1 / 0\nRETURN 0");
        assert_eq!(err.call_stack.len(), 1);
        assert_eq!(err.call_stack[0].label, "BOOM");
        assert_eq!(err.call_stack[0].line, 2);
    }

    #[test]
    fn say_hello() {
        let (lines, code) = run("SAY 'Hello, World!'");
        assert_eq!(lines, vec!["Hello, World!"]);
        assert_eq!(code, 0);
    }

    #[test]
    fn unset_symbol_is_its_own_name() {
        let (lines, _) = run("SAY greeting");
        assert_eq!(lines, vec!["GREETING"]);
    }

    #[test]
    fn concat_evaluates_subexpressions() {
        let (lines, _) = run("a = 10\nb = 3\nSAY \"text \" || (a + b)");
        assert_eq!(lines, vec!["text 13"]);
    }

    #[test]
    fn blank_concatenation() {
        let (lines, _) = run("SAY 'answer:' 42");
        assert_eq!(lines, vec!["answer: 42"]);
    }

    #[test]
    fn arithmetic_type_error_is_fatal() {
        let err = run_err("SAY 'pear' + 1");
        assert_eq!(err.kind, ErrorKind::Eval);
        assert!(err.message.contains("PEAR") || err.message.contains("pear"));
    }

    #[test]
    fn division_by_zero() {
        let err = run_err("SAY 1 / 0");
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn comparison_numeric_when_both_numeric() {
        let (lines, _) = run("SAY '10' = 10\nSAY '007' = 7\nSAY 'abc' = 'ABC'");
        assert_eq!(lines, vec!["1", "1", "0"]);
    }

    #[test]
    fn strict_comparison_is_exact() {
        let (lines, _) = run("SAY '007' == 7\nSAY '7' == 7");
        assert_eq!(lines, vec!["0", "1"]);
    }

    #[test]
    fn counted_loop_bounds_fixed_at_entry() {
        let (lines, _) = run("n = 3\nDO i = 1 TO n\n  n = 100\n  SAY i\nEND");
        assert_eq!(lines, vec!["1", "2", "3"]);
    }

    #[test]
    fn leave_and_iterate() {
        let (lines, _) = run(
            "DO i = 1 TO 5\n  IF i = 2 THEN ITERATE\n  IF i = 4 THEN LEAVE\n  SAY i\nEND",
        );
        assert_eq!(lines, vec!["1", "3"]);
    }

    #[test]
    fn exit_code_truncates_toward_zero() {
        let (_, code) = run("EXIT 3.9");
        assert_eq!(code, 3);
        let (_, code) = run("EXIT -3.9");
        assert_eq!(code, -3);
    }

    #[test]
    fn exit_non_numeric_code_is_zero() {
        let (_, code) = run("EXIT 'banana'");
        assert_eq!(code, 0);
    }

    #[test]
    fn signal_jumps_to_label() {
        let (lines, _) = run("SIGNAL skip\nSAY 'never'\nskip:\nSAY 'after'");
        assert_eq!(lines, vec!["after"]);
    }

    #[test]
    fn signal_unknown_label_is_fatal() {
        let err = run_err("SIGNAL nowhere");
        assert_eq!(err.kind, ErrorKind::Signal);
        assert!(err.message.contains("NOWHERE"));
    }

    #[test]
    fn select_runs_first_true_when() {
        let (lines, _) = run(
            "x = 2\nSELECT\nWHEN x = 1 THEN SAY 'one'\nWHEN x = 2 THEN SAY 'two'\nOTHERWISE\nSAY 'other'\nEND",
        );
        assert_eq!(lines, vec!["two"]);
    }

    #[test]
    fn unbounded_recursion_is_stack_overflow() {
        let err = run_err("CALL again\nEXIT 0\nagain:\nCALL again\nRETURN");
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn pipe_chain_runs_left_to_right() {
        let (lines, _) = run("SAY '  widget  ' |> STRIP() |> UPPER() |> LENGTH()");
        assert_eq!(lines, vec!["6"]);
    }

    #[test]
    fn pipe_placeholder() {
        let (lines, _) = run("SAY 2 |> SUBSTR('abcdef', _, 3)");
        assert_eq!(lines, vec!["bcd"]);
    }

    #[test]
    fn lambda_stage_and_variable() {
        let (lines, _) = run("double = x => x * 2\nSAY DOUBLE(21)\nSAY 5 |> (n => n + 1)");
        assert_eq!(lines, vec!["42", "6"]);
    }

    #[test]
    fn lambda_parameter_restored_after_application() {
        let (lines, _) = run("x = 'kept'\nSAY 3 |> (x => x * 10)\nSAY x");
        assert_eq!(lines, vec!["30", "kept"]);
    }

    #[test]
    fn unknown_explicit_call_is_an_error() {
        let err = run_err("SAY NOT_A_FUNCTION(1)");
        assert_eq!(err.kind, ErrorKind::Eval);
        assert!(err.message.contains("NOT_A_FUNCTION"));
    }

    #[test]
    fn heredoc_expression_is_verbatim() {
        let (lines, _) = run("x = <<BLOCK\nSAY 'not executed'\nBLOCK\nSAY LENGTH(x)");
        assert_eq!(lines, vec!["18"]);
    }
}
