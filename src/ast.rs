//! Abstract syntax tree.
//!
//! A program is an ordered list of statements — a flat list with nested
//! blocks. Statements are produced once by the parser and only traversed
//! afterwards; every node carries its 1-based source line for diagnostics.

/// A complete program.
#[derive(Debug, Clone)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

/// A single statement with its source line.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `name:` — a jump/call target.
    Label(String),

    /// `name = expr`
    Assign { name: String, expr: Expr },

    /// `SAY expr`
    Say(Expr),

    /// `IF cond THEN ... [ELSE ...] ENDIF` (or single-statement THEN form)
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },

    /// `DO ... END` in all its forms.
    Do(Box<DoLoop>),

    /// `SELECT; WHEN expr THEN ...; OTHERWISE ...; END`
    Select {
        whens: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },

    /// `CALL label [arg, ...]`
    Call { name: String, args: Vec<Expr> },

    /// `RETURN [expr]` — pops one frame; the value goes onto the result queue.
    Return(Option<Expr>),

    /// `EXIT [expr] [UNLESS cond [, message]]` — terminates the whole run.
    Exit {
        code: Option<Expr>,
        unless: Option<ExitUnless>,
    },

    /// `SIGNAL label` — unconditional jump, unwinding call frames.
    Signal(String),

    /// `LEAVE` / `ITERATE` — loop control.
    Leave,
    Iterate,

    /// `NOP`
    Nop,

    /// `PARSE ARG a, b, c` — bind the current frame's positional arguments.
    ParseArg(Vec<String>),

    /// `PULL name` — pop the result queue into a variable.
    Pull(String),

    /// `ADDRESS name` — switch the current target (empty name resets).
    AddressSet(String),

    /// `ADDRESS name expr` — one-shot routed command line.
    AddressCommand { target: String, payload: Expr },

    /// `ADDRESS name <<DELIM ... DELIM` — block payload, delivered verbatim.
    AddressHeredoc {
        target: String,
        body: String,
        json: bool,
    },

    /// `ADDRESS name MATCHING("pattern")` — switch target and arm the
    /// line-matching pattern (one capture group).
    AddressMatching { target: String, pattern: String },

    /// A raw source line captured by an active MATCHING pattern. The payload
    /// is capture group 1, pre-interpolation.
    AddressLine(String),

    /// `ADDRESS "url" [AUTH token] AS name` — register an HTTP-backed target.
    AddressRemote {
        url: Expr,
        auth: Option<Expr>,
        name: String,
    },

    /// `INTERPRET expr [WITH ISOLATED [(imports)] [EXPORT(exports)]]`
    Interpret { code: Expr, mode: InterpretMode },

    /// `NO-INTERPRET` / `NO_INTERPRET` — permanently disable INTERPRET.
    NoInterpret,

    /// `REQUIRE expr` — load a library through the resolver.
    Require(Expr),

    /// Bare expression. A string value is routed to the current ADDRESS
    /// target when one is active; otherwise the result is discarded.
    Expression(Expr),
}

/// The optional guard clause on EXIT: exit fires only when the condition is
/// false, optionally printing a message first.
#[derive(Debug, Clone)]
pub struct ExitUnless {
    pub cond: Expr,
    pub message: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct DoLoop {
    pub kind: DoKind,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum DoKind {
    /// `DO; ... END` — plain grouping.
    Simple,
    /// `DO var = start TO end [BY step]`
    Counted {
        var: String,
        start: Expr,
        to: Expr,
        by: Option<Expr>,
    },
    /// `DO WHILE cond`
    While(Expr),
    /// `DO UNTIL cond`
    Until(Expr),
    /// `DO var OVER collection`
    Over { var: String, collection: Expr },
}

/// Scope policy for INTERPRET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpretMode {
    /// Same environment as the caller, full bidirectional visibility.
    Classic,
    /// Fresh environment, pre-seeded from `imports`, with `exports` copied
    /// back afterwards. Plain `WITH ISOLATED` is both lists empty.
    Isolated {
        imports: Vec<String>,
        exports: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub enum Expr {
    StringLit(String),
    /// HEREDOC in expression position. `json` forces structured parsing.
    HeredocLit { body: String, json: bool },
    /// Number literal, stored as written.
    Number(String),
    Symbol(String),
    /// `name(args)` — explicit call syntax. Pipe stages desugar to this.
    FunctionCall { name: String, args: Vec<Expr> },
    /// `param => expr` — an anonymous single-parameter function value.
    Lambda { param: String, body: Box<Expr> },
    /// Application of a lambda-valued expression (a lambda pipe stage).
    LambdaCall { lambda: Box<Expr>, args: Vec<Expr> },
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    Paren(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Remainder,
    Power,
    Concat,      // || or abuttal
    ConcatBlank, // implicit blank concatenation

    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    StrictEq,

    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}
