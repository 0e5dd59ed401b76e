//! Lexer — source text to a token stream.
//!
//! Tokenization stays permissive: the dialect has no reserved words, so the
//! lexer emits generic symbols and lets the parser decide meaning. Unknown
//! characters do not fail here either — a line routed by an ADDRESS MATCHING
//! pattern may contain arbitrary text, so stray characters become `Unknown`
//! tokens and the parser rejects them only where a statement is expected.
//! A quote that never closes before end of line becomes an `Unterminated`
//! token under the same rule. The lexer fails for exactly one thing: a
//! HEREDOC whose closing delimiter never appears.

use crate::error::{Diagnostic, ErrorKind, RexxResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    StringLit(String),
    /// HEREDOC body, delimiter lines stripped, internal structure verbatim.
    /// `json` is set when the delimiter contains "JSON" (case-insensitive),
    /// marking the content for mandatory structured parsing downstream.
    Heredoc { body: String, json: bool },
    Number(String),
    Symbol(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    IntDiv,    // %
    Remainder, // //
    Power,     // **
    Concat,    // ||
    Pipe,      // |>
    FatArrow,  // =>
    Assign,    // = (parser disambiguates assignment vs comparison)

    // Comparison
    NotEqual,  // \= or <>
    Greater,
    Less,
    GreaterEq,
    LessEq,
    StrictEq, // ==

    // Logical
    And, // &
    Or,  // |
    Not, // \

    // Delimiters
    LeftParen,
    RightParen,
    Comma,
    Semicolon,
    Colon,
    Dot,

    /// A character the lexer has no token for. Data on routed lines; an
    /// error anywhere a statement is parsed.
    Unknown(char),

    /// A quoted string whose closing quote never arrived before end of
    /// line. Same rule as `Unknown`: data on routed lines, an error where
    /// the parser expects an expression.
    Unterminated(String),

    Eol,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// 1-based source line.
    pub line: usize,
    /// Whether whitespace or a comment preceded this token. The parser uses
    /// it to tell function calls (`name(`) from concatenation (`name (`),
    /// and abuttal from blank concatenation.
    pub space_before: bool,
}

impl Token {
    pub fn new(kind: TokenKind, line: usize) -> Self {
        Self {
            kind,
            line,
            space_before: false,
        }
    }
}

/// `tokenize(source)` plus the raw source lines, which the parser needs for
/// ADDRESS MATCHING line routing.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    lines: Vec<String>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            lines: source.lines().map(String::from).collect(),
        }
    }

    /// The raw source split into lines (1-based indexing via `line - 1`).
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn source_lines(&self) -> &[String] {
        &self.lines
    }

    pub fn tokenize(&mut self) -> RexxResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let pos_before = self.pos;
            self.skip_whitespace_and_comments()?;
            let had_space = self.pos > pos_before;

            if self.at_end() {
                let mut tok = Token::new(TokenKind::Eof, self.line);
                tok.space_before = had_space;
                tokens.push(tok);
                break;
            }

            let mut token = self.next_token()?;
            token.space_before = had_space;
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.source.get(self.pos + n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) -> RexxResult<()> {
        // Shebang line at start of file
        if self.pos == 0 && self.peek() == Some('#') && self.peek_ahead(1) == Some('!') {
            while let Some(ch) = self.peek() {
                if ch == '\n' {
                    break;
                }
                self.advance();
            }
        }

        loop {
            // Whitespace but not newlines — newlines terminate statements
            while let Some(ch) = self.peek() {
                if ch == ' ' || ch == '\t' || ch == '\r' {
                    self.advance();
                } else {
                    break;
                }
            }

            // Block comments /* ... */ nest
            if self.peek() == Some('/') && self.peek_ahead(1) == Some('*') {
                let open_line = self.line;
                self.advance();
                self.advance();
                let mut depth = 1u32;
                while depth > 0 {
                    if self.at_end() {
                        return Err(Diagnostic::new(ErrorKind::Lex, "unmatched /* in source")
                            .at_line(open_line));
                    }
                    if self.peek() == Some('/') && self.peek_ahead(1) == Some('*') {
                        self.advance();
                        self.advance();
                        depth += 1;
                    } else if self.peek() == Some('*') && self.peek_ahead(1) == Some('/') {
                        self.advance();
                        self.advance();
                        depth -= 1;
                    } else {
                        self.advance();
                    }
                }
                continue;
            }

            // Line comments --
            if self.peek() == Some('-') && self.peek_ahead(1) == Some('-') {
                while let Some(ch) = self.peek() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            break;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn next_token(&mut self) -> RexxResult<Token> {
        let line = self.line;
        let ch = match self.peek() {
            Some(c) => c,
            None => return Ok(Token::new(TokenKind::Eof, line)),
        };

        match ch {
            '\'' | '"' => self.lex_string(ch),
            '0'..='9' => Ok(self.lex_number()),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.lex_symbol()),
            '.' => {
                if self
                    .peek_ahead(1)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    Ok(self.lex_symbol())
                } else {
                    self.advance();
                    Ok(Token::new(TokenKind::Dot, line))
                }
            }
            '+' => {
                self.advance();
                Ok(Token::new(TokenKind::Plus, line))
            }
            '-' => {
                self.advance();
                Ok(Token::new(TokenKind::Minus, line))
            }
            '*' => {
                self.advance();
                if self.peek() == Some('*') {
                    self.advance();
                    Ok(Token::new(TokenKind::Power, line))
                } else {
                    Ok(Token::new(TokenKind::Star, line))
                }
            }
            '/' => {
                self.advance();
                if self.peek() == Some('/') {
                    self.advance();
                    Ok(Token::new(TokenKind::Remainder, line))
                } else {
                    Ok(Token::new(TokenKind::Slash, line))
                }
            }
            '%' => {
                self.advance();
                Ok(Token::new(TokenKind::IntDiv, line))
            }
            '|' => {
                self.advance();
                if self.peek() == Some('|') {
                    self.advance();
                    Ok(Token::new(TokenKind::Concat, line))
                } else if self.peek() == Some('>') {
                    self.advance();
                    Ok(Token::new(TokenKind::Pipe, line))
                } else {
                    Ok(Token::new(TokenKind::Or, line))
                }
            }
            '&' => {
                self.advance();
                Ok(Token::new(TokenKind::And, line))
            }
            '\\' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::NotEqual, line))
                } else {
                    Ok(Token::new(TokenKind::Not, line))
                }
            }
            '=' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::StrictEq, line))
                } else if self.peek() == Some('>') {
                    self.advance();
                    Ok(Token::new(TokenKind::FatArrow, line))
                } else {
                    Ok(Token::new(TokenKind::Assign, line))
                }
            }
            '>' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::GreaterEq, line))
                } else {
                    Ok(Token::new(TokenKind::Greater, line))
                }
            }
            '<' => {
                self.advance();
                // HEREDOC only when the delimiter abuts the opener; a bare
                // `<<` stays two ordinary tokens so a routed line can hold it
                if self.peek() == Some('<')
                    && self
                        .peek_ahead(1)
                        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    self.advance();
                    self.lex_heredoc(line)
                } else if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::LessEq, line))
                } else if self.peek() == Some('>') {
                    self.advance();
                    Ok(Token::new(TokenKind::NotEqual, line))
                } else {
                    Ok(Token::new(TokenKind::Less, line))
                }
            }
            '(' => {
                self.advance();
                Ok(Token::new(TokenKind::LeftParen, line))
            }
            ')' => {
                self.advance();
                Ok(Token::new(TokenKind::RightParen, line))
            }
            ',' => {
                self.advance();
                Ok(Token::new(TokenKind::Comma, line))
            }
            ';' => {
                self.advance();
                Ok(Token::new(TokenKind::Semicolon, line))
            }
            ':' => {
                self.advance();
                Ok(Token::new(TokenKind::Colon, line))
            }
            '\n' => {
                self.advance();
                Ok(Token::new(TokenKind::Eol, line))
            }
            other => {
                self.advance();
                Ok(Token::new(TokenKind::Unknown(other), line))
            }
        }
    }

    fn lex_string(&mut self, quote: char) -> RexxResult<Token> {
        let line = self.line;
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            if self.at_end() || self.peek() == Some('\n') {
                // Deferred: the parser raises the error unless the line is
                // routed by an active MATCHING pattern
                return Ok(Token::new(TokenKind::Unterminated(value), line));
            }
            let ch = self.advance().unwrap();
            if ch == quote {
                break;
            }
            if ch == '\\' {
                self.lex_escape(&mut value);
            } else {
                value.push(ch);
            }
        }

        Ok(Token::new(TokenKind::StringLit(value), line))
    }

    /// Backslash escapes inside quoted strings. An escape with non-hex
    /// digits in a `\u` form is left verbatim — observed leniency, kept
    /// rather than fixed.
    fn lex_escape(&mut self, out: &mut String) {
        let Some(ch) = self.peek() else {
            // Trailing backslash at end of input; the string loop reports it
            out.push('\\');
            return;
        };
        match ch {
            'n' => {
                self.advance();
                out.push('\n');
            }
            't' => {
                self.advance();
                out.push('\t');
            }
            'r' => {
                self.advance();
                out.push('\r');
            }
            'b' => {
                self.advance();
                out.push('\u{0008}');
            }
            'f' => {
                self.advance();
                out.push('\u{000C}');
            }
            'v' => {
                self.advance();
                out.push('\u{000B}');
            }
            '\\' => {
                self.advance();
                out.push('\\');
            }
            '"' => {
                self.advance();
                out.push('"');
            }
            '\'' => {
                self.advance();
                out.push('\'');
            }
            '0' => {
                self.advance();
                out.push('\0');
            }
            'u' => {
                // 4-digit BMP form, or the extended 8-digit form for code
                // points beyond the BMP. Non-hex digits leave the escape
                // verbatim.
                if let Some(decoded) = self.try_unicode_escape(8) {
                    out.push(decoded);
                } else if let Some(decoded) = self.try_unicode_escape(4) {
                    out.push(decoded);
                } else {
                    out.push('\\');
                    // leave 'u' and whatever follows as ordinary characters
                }
            }
            '\n' => {
                // Backslash at end of line stays put; the string loop sees
                // the newline and emits the deferred token
                out.push('\\');
            }
            other => {
                // Unrecognized escape: keep the backslash and character.
                self.advance();
                out.push('\\');
                out.push(other);
            }
        }
    }

    /// Attempt to read `u` + `digits` hex digits as one code point.
    /// Consumes nothing on failure.
    fn try_unicode_escape(&mut self, digits: usize) -> Option<char> {
        // self.peek() is 'u' here
        let mut hex = String::with_capacity(digits);
        for i in 0..digits {
            let c = self.peek_ahead(1 + i)?;
            if !c.is_ascii_hexdigit() {
                return None;
            }
            hex.push(c);
        }
        let code = u32::from_str_radix(&hex, 16).ok()?;
        let decoded = char::from_u32(code)?;
        for _ in 0..=digits {
            self.advance(); // 'u' plus the digits
        }
        Some(decoded)
    }

    fn lex_number(&mut self) -> Token {
        let line = self.line;
        let mut num = String::new();

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() || ch == '.' {
                num.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek().is_some_and(|c| c == 'e' || c == 'E') {
            // exponent only when digits follow; otherwise it is abuttal
            let sign_extra = usize::from(matches!(self.peek_ahead(1), Some('+') | Some('-')));
            if self
                .peek_ahead(1 + sign_extra)
                .is_some_and(|c| c.is_ascii_digit())
            {
                num.push(self.advance().unwrap());
                if self.peek().is_some_and(|c| c == '+' || c == '-') {
                    num.push(self.advance().unwrap());
                }
                while let Some(ch) = self.peek() {
                    if ch.is_ascii_digit() {
                        num.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        Token::new(TokenKind::Number(num), line)
    }

    fn lex_symbol(&mut self) -> Token {
        let line = self.line;
        let mut name = String::new();

        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        Token::new(TokenKind::Symbol(name), line)
    }

    /// `<<DELIM` already consumed through `<<`. Captures everything between
    /// the opener line and the line exactly matching the delimiter text.
    /// Content is data, never syntax: leading whitespace and blank lines are
    /// preserved byte-for-byte.
    fn lex_heredoc(&mut self, open_line: usize) -> RexxResult<Token> {
        let mut delim = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                delim.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        // Consume the rest of the opener line
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                self.advance();
                break;
            }
            self.advance();
        }

        let mut body_lines: Vec<String> = Vec::new();
        loop {
            if self.at_end() {
                return Err(Diagnostic::new(
                    ErrorKind::Lex,
                    format!("unterminated HEREDOC: closing delimiter '{delim}' not found"),
                )
                .at_line(open_line));
            }
            let mut line_text = String::new();
            while let Some(ch) = self.peek() {
                if ch == '\n' {
                    break;
                }
                line_text.push(ch);
                self.advance();
            }
            if line_text.trim_end_matches('\r') == delim {
                // Leave the delimiter line's newline for the main loop, so
                // the statement ends with an Eol like any other
                break;
            }
            body_lines.push(line_text);
            self.advance();
        }

        let json = delim.to_ascii_uppercase().contains("JSON");
        Ok(Token::new(
            TokenKind::Heredoc {
                body: body_lines.join("\n"),
                json,
            },
            open_line,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        Lexer::new(src).tokenize().unwrap()
    }

    #[test]
    fn simple_say() {
        let tokens = lex("SAY \"Hello, World!\"");
        assert!(matches!(&tokens[0].kind, TokenKind::Symbol(s) if s == "SAY"));
        assert!(matches!(&tokens[1].kind, TokenKind::StringLit(s) if s == "Hello, World!"));
        assert!(matches!(&tokens[2].kind, TokenKind::Eof));
    }

    #[test]
    fn pipe_and_arrow_operators() {
        let tokens = lex("x |> UPPER(_) => y || z ** 2");
        assert!(matches!(&tokens[1].kind, TokenKind::Pipe));
        assert!(matches!(&tokens[6].kind, TokenKind::FatArrow));
        assert!(matches!(&tokens[8].kind, TokenKind::Concat));
        assert!(matches!(&tokens[10].kind, TokenKind::Power));
    }

    #[test]
    fn escape_sequences() {
        let tokens = lex(r#""a\tb\nc\\d\"e""#);
        assert!(matches!(&tokens[0].kind, TokenKind::StringLit(s) if s == "a\tb\nc\\d\"e"));
    }

    #[test]
    fn unicode_escape_bmp() {
        let tokens = lex(r#""caf\u00e9""#);
        assert!(matches!(&tokens[0].kind, TokenKind::StringLit(s) if s == "caf\u{e9}"));
    }

    #[test]
    fn unicode_escape_extended() {
        let tokens = lex(r#""\u0001F600""#);
        assert!(matches!(&tokens[0].kind, TokenKind::StringLit(s) if s == "\u{1F600}"));
    }

    #[test]
    fn invalid_unicode_escape_left_verbatim() {
        let tokens = lex(r#""\uGGGG""#);
        assert!(matches!(&tokens[0].kind, TokenKind::StringLit(s) if s == "\\uGGGG"));
    }

    #[test]
    fn unterminated_string_becomes_a_deferred_token() {
        let tokens = lex("SAY \"oops");
        assert!(matches!(&tokens[1].kind, TokenKind::Unterminated(s) if s == "oops"));
    }

    #[test]
    fn double_less_without_a_delimiter_is_two_tokens() {
        let tokens = lex("cost << budget");
        assert!(matches!(tokens[1].kind, TokenKind::Less));
        assert!(matches!(tokens[2].kind, TokenKind::Less));
    }

    #[test]
    fn heredoc_captures_body_verbatim() {
        let src = "x = <<BLOCK\n  first line\n\n  third line\nBLOCK\nSAY x";
        let tokens = lex(src);
        match &tokens[2].kind {
            TokenKind::Heredoc { body, json } => {
                assert_eq!(body, "  first line\n\n  third line");
                assert!(!json);
            }
            other => panic!("expected heredoc, got {other:?}"),
        }
    }

    #[test]
    fn heredoc_statement_ends_with_an_eol() {
        let tokens = lex("x = <<BLOCK\nline one\nBLOCK\nSAY LENGTH(x)");
        let at = tokens
            .iter()
            .position(|t| matches!(t.kind, TokenKind::Heredoc { .. }))
            .unwrap();
        assert!(matches!(tokens[at + 1].kind, TokenKind::Eol));
        assert!(matches!(&tokens[at + 2].kind, TokenKind::Symbol(s) if s == "SAY"));
    }

    #[test]
    fn heredoc_json_delimiter_flag() {
        let src = "x = <<MyJsonDoc\n{\"a\": 1}\nMyJsonDoc";
        let tokens = lex(src);
        assert!(matches!(&tokens[2].kind, TokenKind::Heredoc { json: true, .. }));
    }

    #[test]
    fn unterminated_heredoc_fails_at_opener() {
        let err = Lexer::new("x = <<BLOCK\nno closer here").tokenize().unwrap_err();
        assert_eq!(err.line, Some(1));
        assert!(err.message.contains("BLOCK"));
    }

    #[test]
    fn unknown_characters_do_not_fail() {
        let tokens = lex("{x} ?");
        assert!(matches!(tokens[0].kind, TokenKind::Unknown('{')));
    }

    #[test]
    fn nested_comments() {
        let tokens = lex("/* outer /* inner */ still */ SAY 'hi'");
        assert!(matches!(&tokens[0].kind, TokenKind::Symbol(s) if s == "SAY"));
    }

    #[test]
    fn shebang_skipped() {
        let tokens = lex("#!/usr/bin/env relay-rexx\nSAY 'hello'");
        assert!(matches!(&tokens[0].kind, TokenKind::Eol));
        assert!(matches!(&tokens[1].kind, TokenKind::Symbol(s) if s == "SAY"));
    }
}
