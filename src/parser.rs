//! Recursive descent parser — tokens to a statement list.
//!
//! The dialect has no reserved words; keywords like SAY, IF, DO are symbols
//! recognised by position at the start of a statement. The grammar is
//! line-oriented: newlines terminate statements, blocks must balance, and an
//! unmatched opener is reported at its opening line, not at EOF.
//!
//! One wrinkle has parse-time precedence over everything else: after
//! `ADDRESS target MATCHING("pattern")`, any raw source line matching the
//! pattern becomes a routed `AddressLine` statement — regardless of whether
//! it would otherwise parse as an assignment or a call — until the next
//! ADDRESS statement.

use regex::Regex;

use crate::ast::{
    BinOp, DoKind, DoLoop, ExitUnless, Expr, InterpretMode, Program, Stmt, StmtKind, UnaryOp,
};
use crate::error::{Diagnostic, ErrorKind, RexxResult};
use crate::lexer::{Lexer, Token, TokenKind};

/// Lex and parse in one step. This is the entry used by the CLI, by
/// INTERPRET re-entry, and by most tests.
pub fn parse_source(source: &str) -> RexxResult<Program> {
    let mut lexer = Lexer::new(source);
    let tokens = lexer.tokenize()?;
    let lines = lexer.into_lines();
    Parser::new(tokens, lines).parse()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Raw source lines for MATCHING-mode routing.
    lines: Vec<String>,
    /// Active MATCHING pattern, armed by `ADDRESS t MATCHING(..)` and
    /// replaced or cleared by the next ADDRESS statement.
    matching: Option<Regex>,
    /// Keywords that terminate expression parsing in the current context
    /// (THEN, TO, BY, ...). Without these, blank concatenation would
    /// swallow them as operands.
    stop_words: Vec<&'static str>,
    /// While set, implicit concatenation does not absorb a string literal.
    /// Used for the EXIT ... UNLESS condition, where a following string is
    /// the message clause and must be reached by a comma.
    suppress_string_concat: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, lines: Vec<String>) -> Self {
        Self {
            tokens,
            pos: 0,
            lines,
            matching: None,
            stop_words: Vec::new(),
            suppress_string_concat: false,
        }
    }

    pub fn parse(&mut self) -> RexxResult<Program> {
        let statements = self.parse_block_until(&[], None)?;
        Ok(Program { statements })
    }

    // ── token helpers ───────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        let idx = self.pos + n;
        if idx < self.tokens.len() {
            &self.tokens[idx].kind
        } else {
            &TokenKind::Eof
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !self.at_end() {
            self.pos += 1;
        }
        tok
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn is_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Semicolon | TokenKind::Eol | TokenKind::Eof
        )
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Semicolon | TokenKind::Eol) {
            self.advance();
        }
    }

    /// Current token is a Symbol equal (case-insensitive) to `keyword`.
    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Symbol(s) if s.eq_ignore_ascii_case(keyword))
    }

    fn take_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str, context: &str) -> RexxResult<()> {
        if self.take_keyword(keyword) {
            Ok(())
        } else {
            Err(Diagnostic::new(
                ErrorKind::Parse,
                format!("{context}: expected {keyword}, found {:?}", self.peek_kind()),
            )
            .at_line(self.line()))
        }
    }

    fn expect_symbol(&mut self, context: &str) -> RexxResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Symbol(name) => {
                self.advance();
                Ok(name.to_uppercase())
            }
            other => Err(Diagnostic::new(
                ErrorKind::Parse,
                format!("{context}: expected a name, found {other:?}"),
            )
            .at_line(self.line())),
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> RexxResult<()> {
        if self.peek_kind() == kind {
            self.advance();
            Ok(())
        } else {
            Err(Diagnostic::new(
                ErrorKind::Parse,
                format!("{context}: expected {kind:?}, found {:?}", self.peek_kind()),
            )
            .at_line(self.line()))
        }
    }

    // ── statement-list parsing ──────────────────────────────────────

    /// Parse statements until one of `closers` appears at statement
    /// position (the closer is not consumed), or EOF. `opener` is the
    /// construct and line to blame when EOF arrives with closers pending.
    fn parse_block_until(
        &mut self,
        closers: &[&str],
        opener: Option<(&str, usize)>,
    ) -> RexxResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        loop {
            self.skip_terminators();
            if self.at_end() {
                if let Some((construct, line)) = opener {
                    return Err(Diagnostic::new(
                        ErrorKind::Parse,
                        format!("{construct} block opened here is never closed"),
                    )
                    .at_line(line));
                }
                return Ok(statements);
            }
            if closers.iter().any(|c| self.at_keyword(c)) {
                return Ok(statements);
            }

            // MATCHING routing: the raw line wins over normal grammar,
            // except for ADDRESS statements, which end the mode.
            if self.matching.is_some() && !self.at_keyword("ADDRESS") {
                if let Some(stmt) = self.try_route_matched_line() {
                    statements.push(stmt);
                    continue;
                }
            }

            statements.push(self.parse_statement()?);
        }
    }

    /// If the current raw source line matches the active pattern, consume
    /// the whole line and produce an `AddressLine` with capture group 1.
    fn try_route_matched_line(&mut self) -> Option<Stmt> {
        let regex = self.matching.as_ref()?;
        let line_no = self.line();
        let raw = self.lines.get(line_no.saturating_sub(1))?;
        let captures = regex.captures(raw)?;
        let payload = captures.get(1).map_or("", |m| m.as_str()).to_string();

        // Consume every token on this line, including its Eol.
        while !self.at_end() {
            if matches!(self.peek_kind(), TokenKind::Eol) {
                self.advance();
                break;
            }
            if self.peek().line != line_no {
                break;
            }
            self.advance();
        }

        Some(Stmt {
            kind: StmtKind::AddressLine(payload),
            line: line_no,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn parse_statement(&mut self) -> RexxResult<Stmt> {
        let line = self.line();

        if let TokenKind::Symbol(name) = self.peek_kind().clone() {
            // Label: symbol followed by a colon
            if matches!(self.peek_at(1), TokenKind::Colon) {
                self.advance();
                self.advance();
                return Ok(Stmt {
                    kind: StmtKind::Label(name.to_uppercase()),
                    line,
                });
            }

            // Assignment: symbol followed by a single '='
            if matches!(self.peek_at(1), TokenKind::Assign) {
                self.advance();
                self.advance();
                let expr = self.parse_expression()?;
                return Ok(Stmt {
                    kind: StmtKind::Assign {
                        name: name.to_uppercase(),
                        expr,
                    },
                    line,
                });
            }

            let upper = name.to_uppercase();
            match upper.as_str() {
                "SAY" => {
                    self.advance();
                    let expr = if self.is_terminator() {
                        Expr::StringLit(String::new())
                    } else {
                        self.parse_expression()?
                    };
                    return Ok(Stmt {
                        kind: StmtKind::Say(expr),
                        line,
                    });
                }
                "IF" => return self.parse_if(line),
                "DO" => return self.parse_do(line),
                "SELECT" => return self.parse_select(line),
                "CALL" => return self.parse_call(line),
                "RETURN" => {
                    self.advance();
                    let expr = if self.is_terminator() {
                        None
                    } else {
                        Some(self.parse_expression()?)
                    };
                    return Ok(Stmt {
                        kind: StmtKind::Return(expr),
                        line,
                    });
                }
                "EXIT" => return self.parse_exit(line),
                "SIGNAL" => {
                    self.advance();
                    let label = self.expect_symbol("SIGNAL")?;
                    return Ok(Stmt {
                        kind: StmtKind::Signal(label),
                        line,
                    });
                }
                "LEAVE" => {
                    self.advance();
                    return Ok(Stmt {
                        kind: StmtKind::Leave,
                        line,
                    });
                }
                "ITERATE" => {
                    self.advance();
                    return Ok(Stmt {
                        kind: StmtKind::Iterate,
                        line,
                    });
                }
                "NOP" => {
                    self.advance();
                    return Ok(Stmt {
                        kind: StmtKind::Nop,
                        line,
                    });
                }
                "PARSE" => return self.parse_parse_arg(line),
                "PULL" => {
                    self.advance();
                    let name = self.expect_symbol("PULL")?;
                    return Ok(Stmt {
                        kind: StmtKind::Pull(name),
                        line,
                    });
                }
                "ADDRESS" => return self.parse_address(line),
                "INTERPRET" => return self.parse_interpret(line),
                "REQUIRE" => {
                    self.advance();
                    let expr = self.parse_expression()?;
                    return Ok(Stmt {
                        kind: StmtKind::Require(expr),
                        line,
                    });
                }
                "NO_INTERPRET" => {
                    self.advance();
                    return Ok(Stmt {
                        kind: StmtKind::NoInterpret,
                        line,
                    });
                }
                "NO" if matches!(self.peek_at(1), TokenKind::Minus)
                    && matches!(self.peek_at(2), TokenKind::Symbol(s) if s.eq_ignore_ascii_case("INTERPRET")) =>
                {
                    self.advance();
                    self.advance();
                    self.advance();
                    return Ok(Stmt {
                        kind: StmtKind::NoInterpret,
                        line,
                    });
                }
                _ => {}
            }
        }

        if let TokenKind::Unknown(ch) = self.peek_kind() {
            return Err(Diagnostic::new(
                ErrorKind::Parse,
                format!("invalid character '{ch}' in program"),
            )
            .at_line(line));
        }
        if matches!(self.peek_kind(), TokenKind::Unterminated(_)) {
            return Err(
                Diagnostic::new(ErrorKind::Lex, "unterminated string literal").at_line(line)
            );
        }

        // Default: a bare expression statement
        let expr = self.parse_expression()?;
        Ok(Stmt {
            kind: StmtKind::Expression(expr),
            line,
        })
    }

    /// THEN/WHEN body: a single statement on the same line, or a block when
    /// the line ends right after the keyword.
    fn parse_branch_body(
        &mut self,
        closers: &[&str],
        opener: (&str, usize),
    ) -> RexxResult<(Vec<Stmt>, bool)> {
        if self.is_terminator() {
            let body = self.parse_block_until(closers, Some(opener))?;
            Ok((body, true))
        } else {
            let stmt = self.parse_statement()?;
            Ok((vec![stmt], false))
        }
    }

    fn parse_if(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // IF
        let cond = self.parse_expression_until(&["THEN"])?;
        self.expect_keyword("THEN", "IF")?;

        let (then_body, then_block) = self.parse_branch_body(&["ELSE", "ENDIF"], ("IF", line))?;

        let mut else_body = None;
        let mut need_endif = then_block;

        // An ELSE may follow on the same line or the next.
        let saved = self.pos;
        self.skip_terminators();
        if self.take_keyword("ELSE") {
            let (body, else_block) = self.parse_branch_body(&["ENDIF"], ("IF", line))?;
            else_body = Some(body);
            need_endif = else_block;
        } else if !then_block {
            self.pos = saved;
        }

        if need_endif {
            self.skip_terminators();
            if !self.take_keyword("ENDIF") {
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    "IF block opened here is missing its ENDIF",
                )
                .at_line(line));
            }
        } else {
            // Tolerate a symmetric ENDIF after the single-statement form.
            let saved = self.pos;
            self.skip_terminators();
            if !self.take_keyword("ENDIF") {
                self.pos = saved;
            }
        }

        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            line,
        })
    }

    fn parse_do(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // DO

        let kind = if self.is_terminator() {
            DoKind::Simple
        } else if self.take_keyword("WHILE") {
            DoKind::While(self.parse_expression()?)
        } else if self.take_keyword("UNTIL") {
            DoKind::Until(self.parse_expression()?)
        } else if let TokenKind::Symbol(var) = self.peek_kind().clone() {
            if matches!(self.peek_at(1), TokenKind::Assign) {
                self.advance();
                self.advance();
                let start = self.parse_expression_until(&["TO", "BY"])?;
                self.expect_keyword("TO", "DO: counted loop requires 'TO end'")?;
                let to = self.parse_expression_until(&["BY"])?;
                let by = if self.take_keyword("BY") {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                DoKind::Counted {
                    var: var.to_uppercase(),
                    start,
                    to,
                    by,
                }
            } else if matches!(self.peek_at(1), TokenKind::Symbol(s) if s.eq_ignore_ascii_case("OVER"))
            {
                self.advance(); // var
                self.advance(); // OVER
                let collection = self.parse_expression()?;
                DoKind::Over {
                    var: var.to_uppercase(),
                    collection,
                }
            } else {
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    "invalid DO syntax: expected DO, DO WHILE/UNTIL cond, \
                     DO var = start TO end [BY step], or DO var OVER collection",
                )
                .at_line(line));
            }
        } else {
            return Err(
                Diagnostic::new(ErrorKind::Parse, "invalid DO syntax").at_line(line)
            );
        };

        let body = self.parse_block_until(&["END"], Some(("DO", line)))?;
        self.expect_keyword("END", "DO")?;

        Ok(Stmt {
            kind: StmtKind::Do(Box::new(DoLoop { kind, body })),
            line,
        })
    }

    fn parse_select(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // SELECT
        let mut whens = Vec::new();
        let mut otherwise = None;

        loop {
            self.skip_terminators();
            if self.at_end() {
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    "SELECT block opened here is never closed",
                )
                .at_line(line));
            }
            if self.take_keyword("WHEN") {
                let cond = self.parse_expression_until(&["THEN"])?;
                self.expect_keyword("THEN", "WHEN")?;
                let (body, _) =
                    self.parse_branch_body(&["WHEN", "OTHERWISE", "END"], ("SELECT", line))?;
                whens.push((cond, body));
            } else if self.take_keyword("OTHERWISE") {
                let body = self.parse_block_until(&["END"], Some(("SELECT", line)))?;
                otherwise = Some(body);
            } else if self.take_keyword("END") {
                break;
            } else {
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    format!(
                        "SELECT: expected WHEN, OTHERWISE, or END, found {:?}",
                        self.peek_kind()
                    ),
                )
                .at_line(self.line()));
            }
        }

        if whens.is_empty() {
            return Err(
                Diagnostic::new(ErrorKind::Parse, "SELECT requires at least one WHEN")
                    .at_line(line),
            );
        }

        Ok(Stmt {
            kind: StmtKind::Select { whens, otherwise },
            line,
        })
    }

    fn parse_call(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // CALL
        let name = self.expect_symbol("CALL")?;
        let mut args = Vec::new();
        if !self.is_terminator() {
            args.push(self.parse_expression()?);
            while matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                args.push(self.parse_expression()?);
            }
        }
        Ok(Stmt {
            kind: StmtKind::Call { name, args },
            line,
        })
    }

    fn parse_exit(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // EXIT
        let code = if self.is_terminator() || self.at_keyword("UNLESS") {
            None
        } else {
            Some(self.parse_expression_until(&["UNLESS"])?)
        };

        let unless = if self.take_keyword("UNLESS") {
            self.suppress_string_concat = true;
            let cond = self.parse_expression();
            self.suppress_string_concat = false;
            let cond = cond?;
            let message = if matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                Some(self.parse_expression()?)
            } else if matches!(self.peek_kind(), TokenKind::StringLit(_) | TokenKind::Dot) {
                // `EXIT 1 UNLESS cond. 'msg'` — the period gets absorbed
                // into the preceding symbol (stem-variable dot syntax), so
                // the message shows up here with no separator.
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    "EXIT ... UNLESS: the message clause must be separated by a comma, \
                     not a period (a trailing period reads as stem-variable dot syntax)",
                )
                .at_line(line));
            } else {
                None
            };
            Some(ExitUnless { cond, message })
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::Exit { code, unless },
            line,
        })
    }

    fn parse_parse_arg(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // PARSE
        self.expect_keyword("ARG", "PARSE: only the ARG source is supported")?;
        let mut names = Vec::new();
        while let TokenKind::Symbol(name) = self.peek_kind().clone() {
            self.advance();
            names.push(name.to_uppercase());
            if matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
            }
        }
        Ok(Stmt {
            kind: StmtKind::ParseArg(names),
            line,
        })
    }

    fn parse_address(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // ADDRESS
        // Any ADDRESS statement ends an active MATCHING mode.
        self.matching = None;

        // ADDRESS alone resets to the default (no target).
        if self.is_terminator() {
            return Ok(Stmt {
                kind: StmtKind::AddressSet(String::new()),
                line,
            });
        }

        // ADDRESS "url" [AUTH token] AS name — remote registration.
        if let TokenKind::StringLit(url) = self.peek_kind().clone() {
            self.advance();
            let auth = if self.take_keyword("AUTH") {
                Some(self.parse_expression_until(&["AS"])?)
            } else {
                None
            };
            if !self.take_keyword("AS") {
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    "ADDRESS \"url\" requires 'AS name' to name the remote target",
                )
                .at_line(line));
            }
            let name = self.expect_symbol("ADDRESS ... AS")?;
            return Ok(Stmt {
                kind: StmtKind::AddressRemote {
                    url: Expr::StringLit(url),
                    auth,
                    name,
                },
                line,
            });
        }

        let target = self.expect_symbol("ADDRESS")?;

        if self.is_terminator() {
            return Ok(Stmt {
                kind: StmtKind::AddressSet(target),
                line,
            });
        }

        if self.at_keyword("MATCHING") {
            self.advance();
            self.expect(&TokenKind::LeftParen, "ADDRESS ... MATCHING")?;
            let pattern = match self.peek_kind().clone() {
                TokenKind::StringLit(p) => {
                    self.advance();
                    p
                }
                other => {
                    return Err(Diagnostic::new(
                        ErrorKind::Parse,
                        format!("MATCHING expects a quoted pattern, found {other:?}"),
                    )
                    .at_line(line));
                }
            };
            self.expect(&TokenKind::RightParen, "ADDRESS ... MATCHING")?;

            let regex = Regex::new(&pattern).map_err(|e| {
                Diagnostic::new(
                    ErrorKind::Parse,
                    format!("MATCHING pattern does not compile: {e}"),
                )
                .at_line(line)
            })?;
            if regex.captures_len() < 2 {
                return Err(Diagnostic::new(
                    ErrorKind::Parse,
                    "MATCHING pattern needs one capture group for the payload",
                )
                .at_line(line));
            }
            self.matching = Some(regex);

            return Ok(Stmt {
                kind: StmtKind::AddressMatching { target, pattern },
                line,
            });
        }

        if let TokenKind::Heredoc { body, json } = self.peek_kind().clone() {
            self.advance();
            return Ok(Stmt {
                kind: StmtKind::AddressHeredoc { target, body, json },
                line,
            });
        }

        let payload = self.parse_expression()?;
        Ok(Stmt {
            kind: StmtKind::AddressCommand { target, payload },
            line,
        })
    }

    fn parse_interpret(&mut self, line: usize) -> RexxResult<Stmt> {
        self.advance(); // INTERPRET
        let code = self.parse_expression_until(&["WITH"])?;

        let mode = if self.take_keyword("WITH") {
            self.expect_keyword("ISOLATED", "INTERPRET ... WITH")?;
            let imports = if matches!(self.peek_kind(), TokenKind::LeftParen) {
                self.parse_name_list("INTERPRET import list")?
            } else {
                Vec::new()
            };
            let exports = if self.take_keyword("EXPORT") {
                self.parse_name_list("INTERPRET export list")?
            } else {
                Vec::new()
            };
            InterpretMode::Isolated { imports, exports }
        } else {
            InterpretMode::Classic
        };

        Ok(Stmt {
            kind: StmtKind::Interpret { code, mode },
            line,
        })
    }

    /// `( name name ... )` or `( name, name, ... )`
    fn parse_name_list(&mut self, context: &str) -> RexxResult<Vec<String>> {
        self.expect(&TokenKind::LeftParen, context)?;
        let mut names = Vec::new();
        loop {
            match self.peek_kind().clone() {
                TokenKind::Symbol(name) => {
                    self.advance();
                    names.push(name.to_uppercase());
                    if matches!(self.peek_kind(), TokenKind::Comma) {
                        self.advance();
                    }
                }
                TokenKind::RightParen => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(Diagnostic::new(
                        ErrorKind::Parse,
                        format!("{context}: expected a name or ')', found {other:?}"),
                    )
                    .at_line(self.line()));
                }
            }
        }
        Ok(names)
    }

    // ── expression parsing (precedence climbing) ────────────────────
    //
    // Lowest to highest:
    //   0. pipe        (|>)
    //   1. OR          (|)
    //   2. AND         (&)
    //   3. comparison  (= \= <> > < >= <= ==)
    //   4. concat      (||, abuttal, blank)
    //   5. add / sub
    //   6. mul / div / % / //
    //   7. power       (**, right associative)
    //   8. unary       (+ - \)
    //   9. primary

    fn parse_expression(&mut self) -> RexxResult<Expr> {
        // Lambda: `param => expr`. The body is a full expression.
        if let TokenKind::Symbol(param) = self.peek_kind().clone() {
            if matches!(self.peek_at(1), TokenKind::FatArrow) {
                self.advance();
                self.advance();
                let body = self.parse_expression()?;
                return Ok(Expr::Lambda {
                    param: param.to_uppercase(),
                    body: Box::new(body),
                });
            }
        }
        self.parse_pipe()
    }

    fn parse_expression_until(&mut self, stops: &'static [&'static str]) -> RexxResult<Expr> {
        let depth = self.stop_words.len();
        self.stop_words.extend_from_slice(stops);
        let result = self.parse_expression();
        self.stop_words.truncate(depth);
        result
    }

    fn is_stop_word(&self, sym: &str) -> bool {
        self.stop_words.iter().any(|s| sym.eq_ignore_ascii_case(s))
    }

    fn parse_pipe(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_or()?;
        while matches!(self.peek_kind(), TokenKind::Pipe) {
            self.advance();
            left = self.parse_pipe_stage(left)?;
        }
        Ok(left)
    }

    /// One pipe stage. Desugars at parse time: the piped value becomes the
    /// first positional argument, unless a `_` placeholder appears among
    /// the arguments, in which case it substitutes for every `_`.
    fn parse_pipe_stage(&mut self, piped: Expr) -> RexxResult<Expr> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::Symbol(name) => {
                // Lambda stage: `|> x => x + 1`
                if matches!(self.peek_at(1), TokenKind::FatArrow) {
                    self.advance();
                    self.advance();
                    let body = self.parse_expression()?;
                    return Ok(Expr::LambdaCall {
                        lambda: Box::new(Expr::Lambda {
                            param: name.to_uppercase(),
                            body: Box::new(body),
                        }),
                        args: vec![piped],
                    });
                }
                self.advance();
                // `|> FN(args)` — paren must abut the name
                if matches!(self.peek_kind(), TokenKind::LeftParen) && !self.peek().space_before {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek_kind(), TokenKind::RightParen) {
                        args.push(self.parse_expression()?);
                        while matches!(self.peek_kind(), TokenKind::Comma) {
                            self.advance();
                            args.push(self.parse_expression()?);
                        }
                    }
                    self.expect(&TokenKind::RightParen, "pipe stage arguments")?;

                    let has_placeholder = args.iter().any(expr_contains_placeholder);
                    let args = if has_placeholder {
                        args.into_iter()
                            .map(|a| substitute_placeholder(a, &piped))
                            .collect()
                    } else {
                        let mut with_piped = Vec::with_capacity(args.len() + 1);
                        with_piped.push(piped);
                        with_piped.extend(args);
                        with_piped
                    };
                    Ok(Expr::FunctionCall {
                        name: name.to_uppercase(),
                        args,
                    })
                } else {
                    // `|> FN` — bare function name
                    Ok(Expr::FunctionCall {
                        name: name.to_uppercase(),
                        args: vec![piped],
                    })
                }
            }
            // `|> (x => ...)` — parenthesized lambda stage
            TokenKind::LeftParen => {
                self.advance();
                let stage = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "pipe stage")?;
                Ok(Expr::LambdaCall {
                    lambda: Box::new(stage),
                    args: vec![piped],
                })
            }
            other => Err(Diagnostic::new(
                ErrorKind::Parse,
                format!("'|>' must be followed by a function or lambda, found {other:?}"),
            )
            .at_line(line)),
        }
    }

    fn parse_or(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek_kind(), TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BinOp {
                left: Box::new(left),
                op: BinOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_comparison()?;
        while matches!(self.peek_kind(), TokenKind::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::BinOp {
                left: Box::new(left),
                op: BinOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek_kind() {
                // '=' at expression level is comparison, not assignment
                TokenKind::Assign => BinOp::Eq,
                TokenKind::NotEqual => BinOp::NotEq,
                TokenKind::Greater => BinOp::Gt,
                TokenKind::Less => BinOp::Lt,
                TokenKind::GreaterEq => BinOp::GtEq,
                TokenKind::LessEq => BinOp::LtEq,
                TokenKind::StrictEq => BinOp::StrictEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = Expr::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_addition()?;
        loop {
            if matches!(self.peek_kind(), TokenKind::Concat) {
                self.advance();
                let right = self.parse_addition()?;
                left = Expr::BinOp {
                    left: Box::new(left),
                    op: BinOp::Concat,
                    right: Box::new(right),
                };
                continue;
            }

            // Implicit concatenation: next token can start a term and is not
            // an operator or a context keyword (THEN, TO, ...).
            if self.can_start_term() {
                if let TokenKind::Symbol(s) = self.peek_kind() {
                    if self.is_stop_word(s) {
                        break;
                    }
                }
                if self.suppress_string_concat
                    && matches!(self.peek_kind(), TokenKind::StringLit(_))
                {
                    break;
                }
                let op = if self.peek().space_before {
                    BinOp::ConcatBlank
                } else {
                    BinOp::Concat
                };
                let right = self.parse_addition()?;
                left = Expr::BinOp {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                };
                continue;
            }

            break;
        }
        Ok(left)
    }

    /// True if the current token could start a primary term. Unary plus,
    /// minus, and NOT are excluded here: at concat position they read as
    /// binary operators, handled by the caller levels.
    fn can_start_term(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::StringLit(_)
                | TokenKind::Number(_)
                | TokenKind::Symbol(_)
                | TokenKind::LeftParen
        )
    }

    fn parse_addition(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_multiplication()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplication()?;
            left = Expr::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplication(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::IntDiv => BinOp::IntDiv,
                TokenKind::Remainder => BinOp::Remainder,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = Expr::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> RexxResult<Expr> {
        let base = self.parse_unary()?;
        if matches!(self.peek_kind(), TokenKind::Power) {
            self.advance();
            let exp = self.parse_power()?; // right associative
            Ok(Expr::BinOp {
                left: Box::new(base),
                op: BinOp::Power,
                right: Box::new(exp),
            })
        } else {
            Ok(base)
        }
    }

    fn parse_unary(&mut self) -> RexxResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Minus => Some(UnaryOp::Minus),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            Ok(Expr::UnaryOp {
                op,
                operand: Box::new(operand),
            })
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> RexxResult<Expr> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Expr::StringLit(s))
            }
            TokenKind::Heredoc { body, json } => {
                self.advance();
                Ok(Expr::HeredocLit { body, json })
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Symbol(name) => {
                self.advance();
                // Function call: symbol abutting '('
                if matches!(self.peek_kind(), TokenKind::LeftParen) && !self.peek().space_before {
                    return self.parse_function_call(&name);
                }
                Ok(Expr::Symbol(name.to_uppercase()))
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "expression")
                    .map_err(|_| {
                        Diagnostic::new(ErrorKind::Parse, "unmatched '(' in expression")
                            .at_line(line)
                    })?;
                Ok(Expr::Paren(Box::new(expr)))
            }
            TokenKind::Unterminated(_) => Err(
                Diagnostic::new(ErrorKind::Lex, "unterminated string literal").at_line(line)
            ),
            other => Err(Diagnostic::new(
                ErrorKind::Parse,
                format!("unexpected token {other:?} in expression"),
            )
            .at_line(line)),
        }
    }

    fn parse_function_call(&mut self, name: &str) -> RexxResult<Expr> {
        let line = self.line();
        self.advance(); // (
        let mut args = Vec::new();
        if !matches!(self.peek_kind(), TokenKind::RightParen) {
            args.push(self.parse_expression()?);
            while matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                args.push(self.parse_expression()?);
            }
        }
        self.expect(&TokenKind::RightParen, "function arguments")
            .map_err(|_| {
                Diagnostic::new(
                    ErrorKind::Parse,
                    format!("unmatched '(' in call to {name}"),
                )
                .at_line(line)
            })?;
        Ok(Expr::FunctionCall {
            name: name.to_uppercase(),
            args,
        })
    }
}

/// Does this expression contain the `_` pipe placeholder?
fn expr_contains_placeholder(expr: &Expr) -> bool {
    match expr {
        Expr::Symbol(name) => name == "_",
        Expr::BinOp { left, right, .. } => {
            expr_contains_placeholder(left) || expr_contains_placeholder(right)
        }
        Expr::UnaryOp { operand, .. } => expr_contains_placeholder(operand),
        Expr::Paren(inner) => expr_contains_placeholder(inner),
        Expr::FunctionCall { args, .. } => args.iter().any(expr_contains_placeholder),
        Expr::LambdaCall { lambda, args } => {
            expr_contains_placeholder(lambda) || args.iter().any(expr_contains_placeholder)
        }
        // A lambda body has its own parameter space; `_` inside it is not
        // the pipe placeholder.
        Expr::Lambda { .. } => false,
        _ => false,
    }
}

/// Replace every `_` placeholder with the piped expression.
fn substitute_placeholder(expr: Expr, piped: &Expr) -> Expr {
    match expr {
        Expr::Symbol(ref name) if name == "_" => piped.clone(),
        Expr::BinOp { left, op, right } => Expr::BinOp {
            left: Box::new(substitute_placeholder(*left, piped)),
            op,
            right: Box::new(substitute_placeholder(*right, piped)),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp {
            op,
            operand: Box::new(substitute_placeholder(*operand, piped)),
        },
        Expr::Paren(inner) => Expr::Paren(Box::new(substitute_placeholder(*inner, piped))),
        Expr::FunctionCall { name, args } => Expr::FunctionCall {
            name,
            args: args
                .into_iter()
                .map(|a| substitute_placeholder(a, piped))
                .collect(),
        },
        Expr::LambdaCall { lambda, args } => Expr::LambdaCall {
            lambda: Box::new(substitute_placeholder(*lambda, piped)),
            args: args
                .into_iter()
                .map(|a| substitute_placeholder(a, piped))
                .collect(),
        },
        other => other,
    }
}
