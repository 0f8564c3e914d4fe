//! Text front-end: parses EBNF / Lark-style grammar strings into [`Grammar`].
//!
//! Supports:
//! - Rule definitions with `::=` (EBNF) or `:` (Lark style)
//! - String literals with UTF-8 and escape sequences
//! - Character classes with Unicode ranges and negation
//! - Inline regex terminals `/.../` (compiled via [`crate::regex`])
//! - Rule references, sequences, choices (`|`), grouping with parentheses
//! - Quantifiers: `*`, `+`, `?`, `{n}`, `{n,m}`, `{n,}`
//! - Comments: `#` to end of line

use anyhow::{Result, bail};

use super::builder::GrammarBuilder;
use super::{ExprId, Grammar};

// ─── UTF-8 / escape helpers ──────────────────────────────────────────

fn hex_char_to_u32(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'a'..=b'f' => Some((c - b'a' + 10) as u32),
        b'A'..=b'F' => Some((c - b'A' + 10) as u32),
        _ => None,
    }
}

/// Parse an escape sequence starting at `\`. Returns (codepoint, bytes consumed).
fn parse_escape(data: &[u8], extra_escapes: &[u8]) -> Result<(u32, usize)> {
    if data.len() < 2 || data[0] != b'\\' {
        bail!("expected escape sequence");
    }
    if extra_escapes.contains(&data[1]) {
        return Ok((data[1] as u32, 2));
    }
    match data[1] {
        b'\'' => Ok((b'\'' as u32, 2)),
        b'"' => Ok((b'"' as u32, 2)),
        b'\\' => Ok((b'\\' as u32, 2)),
        b'a' => Ok((0x07, 2)),
        b'b' => Ok((0x08, 2)),
        b'f' => Ok((0x0C, 2)),
        b'n' => Ok((0x0A, 2)),
        b'r' => Ok((0x0D, 2)),
        b't' => Ok((0x09, 2)),
        b'v' => Ok((0x0B, 2)),
        b'0' => Ok((0x00, 2)),
        b'e' => Ok((0x1B, 2)),
        b'x' => {
            let mut cp = 0u32;
            let mut len = 0;
            while 2 + len < data.len() {
                if let Some(d) = hex_char_to_u32(data[2 + len]) {
                    cp = cp * 16 + d;
                    len += 1;
                } else {
                    break;
                }
            }
            if len == 0 {
                bail!("invalid \\x escape: no hex digits");
            }
            Ok((cp, 2 + len))
        }
        b'u' => {
            if data.len() < 6 {
                bail!("invalid \\u escape: need 4 hex digits");
            }
            let mut cp = 0u32;
            for i in 0..4 {
                let d = hex_char_to_u32(data[2 + i])
                    .ok_or_else(|| anyhow::anyhow!("invalid hex digit in \\u escape"))?;
                cp = cp * 16 + d;
            }
            Ok((cp, 6))
        }
        b'U' => {
            if data.len() < 10 {
                bail!("invalid \\U escape: need 8 hex digits");
            }
            let mut cp = 0u32;
            for i in 0..8 {
                let d = hex_char_to_u32(data[2 + i])
                    .ok_or_else(|| anyhow::anyhow!("invalid hex digit in \\U escape"))?;
                cp = cp * 16 + d;
            }
            Ok((cp, 10))
        }
        _ => bail!("invalid escape sequence: \\{}", data[1] as char),
    }
}

/// Parse the next UTF-8 char or escape. Returns (codepoint, bytes consumed).
fn parse_next_utf8_or_escaped(data: &[u8], extra_escapes: &[u8]) -> Result<(u32, usize)> {
    if data.is_empty() {
        bail!("unexpected end of input");
    }
    if data[0] == b'\\' {
        return parse_escape(data, extra_escapes);
    }
    let s = std::str::from_utf8(data).unwrap_or("");
    match s.chars().next() {
        Some(c) => Ok((c as u32, c.len_utf8())),
        None => bail!("invalid UTF-8 sequence"),
    }
}

// ─── Tokens ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenType {
    RuleName,
    Identifier,
    StringLiteral,
    RegexLiteral,
    LBracket,
    RBracket,
    Caret,
    ClassChar(u32),
    Dash,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Pipe,
    Star,
    Plus,
    Question,
    IntegerLiteral(i64),
    Comma,
    EndOfFile,
}

#[derive(Debug, Clone)]
struct Token {
    ty: TokenType,
    /// Decoded string for StringLiteral/RegexLiteral, name for identifiers.
    value: String,
    line: usize,
    col: usize,
}

// ─── Lexer ───────────────────────────────────────────────────────────

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<u8> {
        self.input.get(self.pos + delta).copied()
    }

    fn advance(&mut self) {
        if let Some(b) = self.peek() {
            if b == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn advance_n(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.advance(),
                Some(b'#') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn err(&self, msg: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "grammar syntax error at line {}, column {}: {}",
            self.line,
            self.col,
            msg
        )
    }

    fn is_name_char(c: u8, is_first: bool) -> bool {
        c == b'_' || c == b'.' || c.is_ascii_alphabetic() || (!is_first && c.is_ascii_digit())
    }

    fn lex_identifier(&mut self) -> String {
        let start = self.pos;
        let mut first = true;
        while let Some(c) = self.peek() {
            if Self::is_name_char(c, first) {
                self.advance();
                first = false;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).to_string()
    }

    fn lex_string(&mut self) -> Result<Token> {
        let (line, col) = (self.line, self.col);
        self.advance(); // opening "

        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.err("unterminated string literal"));
                }
                Some(b'"') => break,
                _ => {
                    let remaining = &self.input[self.pos..];
                    let (cp, len) = parse_next_utf8_or_escaped(remaining, &[])
                        .map_err(|e| self.err(&e.to_string()))?;
                    self.advance_n(len);
                    match char::from_u32(cp) {
                        Some(c) => value.push(c),
                        None => return Err(self.err(&format!("invalid codepoint U+{:04X}", cp))),
                    }
                }
            }
        }
        self.advance(); // closing "

        Ok(Token {
            ty: TokenType::StringLiteral,
            value,
            line,
            col,
        })
    }

    /// Lex a `/.../` regex terminal. Only `\/` is unescaped here; everything
    /// else is handed to the regex converter verbatim.
    fn lex_regex(&mut self) -> Result<Token> {
        let (line, col) = (self.line, self.col);
        self.advance(); // opening /

        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.err("unterminated regex literal"));
                }
                Some(b'/') => break,
                Some(b'\\') => {
                    if self.peek_at(1) == Some(b'/') {
                        bytes.push(b'/');
                        self.advance_n(2);
                    } else {
                        bytes.push(b'\\');
                        self.advance();
                        if let Some(b) = self.peek() {
                            bytes.push(b);
                            self.advance();
                        }
                    }
                }
                Some(b) => {
                    bytes.push(b);
                    self.advance();
                }
            }
        }
        self.advance(); // closing /

        let value = String::from_utf8(bytes).map_err(|_| self.err("regex literal is not UTF-8"))?;
        Ok(Token {
            ty: TokenType::RegexLiteral,
            value,
            line,
            col,
        })
    }

    fn lex_char_class(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        tokens.push(Token {
            ty: TokenType::LBracket,
            value: String::new(),
            line: self.line,
            col: self.col,
        });
        self.advance(); // [

        if self.peek() == Some(b'^') {
            tokens.push(Token {
                ty: TokenType::Caret,
                value: String::new(),
                line: self.line,
                col: self.col,
            });
            self.advance();
        }

        // Metacharacters that may be backslash-escaped inside a class.
        const CLASS_ESCAPES: &[u8] = b"^$\\.*+?()[]{}|/-";

        while self.peek().is_some() && self.peek() != Some(b']') {
            let (line, col) = (self.line, self.col);
            match self.peek().unwrap() {
                b'\r' | b'\n' => {
                    return Err(self.err("character class must not contain a newline"));
                }
                b'-' => {
                    tokens.push(Token {
                        ty: TokenType::Dash,
                        value: String::new(),
                        line,
                        col,
                    });
                    self.advance();
                }
                _ => {
                    let remaining = &self.input[self.pos..];
                    let (cp, len) = parse_next_utf8_or_escaped(remaining, CLASS_ESCAPES)
                        .map_err(|e| self.err(&e.to_string()))?;
                    self.advance_n(len);
                    tokens.push(Token {
                        ty: TokenType::ClassChar(cp),
                        value: String::new(),
                        line,
                        col,
                    });
                }
            }
        }

        if self.peek().is_none() {
            return Err(self.err("unterminated character class"));
        }
        tokens.push(Token {
            ty: TokenType::RBracket,
            value: String::new(),
            line: self.line,
            col: self.col,
        });
        self.advance(); // ]

        Ok(tokens)
    }

    fn lex_integer(&mut self) -> Result<Token> {
        let (line, col) = (self.line, self.col);
        let mut num: i64 = 0;
        let mut has_digit = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                has_digit = true;
                num = num * 10 + (c - b'0') as i64;
                self.advance();
                if num > 1_000_000_000 {
                    return Err(self.err("integer too large"));
                }
            } else {
                break;
            }
        }
        if !has_digit {
            return Err(self.err("expected integer"));
        }
        Ok(Token {
            ty: TokenType::IntegerLiteral(num),
            value: String::new(),
            line,
            col,
        })
    }

    fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments();
            let (line, col) = (self.line, self.col);

            let simple = |ty| Token {
                ty,
                value: String::new(),
                line,
                col,
            };

            match self.peek() {
                None => {
                    tokens.push(simple(TokenType::EndOfFile));
                    break;
                }
                Some(b'(') => {
                    self.advance();
                    tokens.push(simple(TokenType::LParen));
                }
                Some(b')') => {
                    self.advance();
                    tokens.push(simple(TokenType::RParen));
                }
                Some(b'{') => {
                    self.advance();
                    tokens.push(simple(TokenType::LBrace));
                }
                Some(b'}') => {
                    self.advance();
                    tokens.push(simple(TokenType::RBrace));
                }
                Some(b'|') => {
                    self.advance();
                    tokens.push(simple(TokenType::Pipe));
                }
                Some(b',') => {
                    self.advance();
                    tokens.push(simple(TokenType::Comma));
                }
                Some(b'*') => {
                    self.advance();
                    tokens.push(simple(TokenType::Star));
                }
                Some(b'+') => {
                    self.advance();
                    tokens.push(simple(TokenType::Plus));
                }
                Some(b'?') => {
                    self.advance();
                    tokens.push(simple(TokenType::Question));
                }
                Some(b':') => {
                    // "::=" (EBNF) or ":" (Lark) both assign.
                    if self.peek_at(1) == Some(b':') && self.peek_at(2) == Some(b'=') {
                        self.advance_n(3);
                    } else {
                        self.advance();
                    }
                    tokens.push(simple(TokenType::Assign));
                }
                Some(b'"') => tokens.push(self.lex_string()?),
                Some(b'/') => tokens.push(self.lex_regex()?),
                Some(b'[') => tokens.extend(self.lex_char_class()?),
                Some(c) if Self::is_name_char(c, true) => {
                    let name = self.lex_identifier();
                    tokens.push(Token {
                        ty: TokenType::Identifier,
                        value: name,
                        line,
                        col,
                    });
                }
                Some(c) if c.is_ascii_digit() => tokens.push(self.lex_integer()?),
                Some(c) => {
                    return Err(self.err(&format!("unexpected character: '{}'", c as char)));
                }
            }
        }

        mark_rule_names(&mut tokens)?;
        Ok(tokens)
    }
}

/// Identifiers at the start of a line that are followed by an assignment
/// introduce rule definitions; everything else stays a reference.
fn mark_rule_names(tokens: &mut [Token]) -> Result<()> {
    for i in 0..tokens.len() {
        if tokens[i].ty == TokenType::Assign {
            if i == 0 || tokens[i - 1].ty != TokenType::Identifier {
                bail!(
                    "grammar syntax error at line {}, column {}: rule definition must start with a name",
                    tokens[i].line,
                    tokens[i].col
                );
            }
            if i >= 2 && tokens[i - 2].line == tokens[i - 1].line {
                bail!(
                    "grammar syntax error at line {}, column {}: rule name must be at the beginning of the line",
                    tokens[i - 1].line,
                    tokens[i - 1].col
                );
            }
            tokens[i - 1].ty = TokenType::RuleName;
        }
    }
    Ok(())
}

// ─── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    builder: GrammarBuilder,
    cur_rule_name: String,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            builder: GrammarBuilder::new(),
            cur_rule_name: String::new(),
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn consume(&mut self) {
        self.pos += 1;
    }

    fn expect(&mut self, expected: &TokenType, msg: &str) -> Result<()> {
        if std::mem::discriminant(&self.peek().ty) != std::mem::discriminant(expected) {
            return Err(self.parse_error(msg));
        }
        self.consume();
        Ok(())
    }

    fn parse_error(&self, msg: &str) -> anyhow::Error {
        let tok = self.peek();
        anyhow::anyhow!(
            "grammar parse error at line {}, column {}: {}",
            tok.line,
            tok.col,
            msg
        )
    }

    /// First pass: register every defined rule name so references resolve in
    /// any order, and reject duplicates.
    fn init_rule_names(&mut self) -> Result<()> {
        for tok in &self.tokens {
            if tok.ty == TokenType::RuleName {
                if self.builder.find_rule(&tok.value).is_some() {
                    bail!(
                        "grammar parse error at line {}, column {}: rule \"{}\" defined multiple times",
                        tok.line,
                        tok.col,
                        tok.value
                    );
                }
                self.builder.add_rule(&tok.value);
            }
        }
        Ok(())
    }

    fn parse_char_class(&mut self) -> Result<ExprId> {
        self.expect(&TokenType::LBracket, "expected [")?;

        let mut negated = false;
        if self.peek().ty == TokenType::Caret {
            negated = true;
            self.consume();
        }

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        while self.peek().ty != TokenType::RBracket && self.peek().ty != TokenType::EndOfFile {
            let cp = match &self.peek().ty {
                TokenType::ClassChar(cp) => *cp,
                TokenType::Dash => b'-' as u32,
                _ => return Err(self.parse_error("unexpected token in character class")),
            };
            self.consume();

            let range_follows = self.peek().ty == TokenType::Dash
                && matches!(
                    self.tokens.get(self.pos + 1).map(|t| &t.ty),
                    Some(TokenType::ClassChar(_)) | Some(TokenType::Dash)
                );
            if range_follows {
                self.consume(); // dash
                let cp2 = match &self.peek().ty {
                    TokenType::ClassChar(cp) => *cp,
                    TokenType::Dash => b'-' as u32,
                    _ => unreachable!("guarded by range_follows"),
                };
                self.consume();
                if cp > cp2 {
                    return Err(self.parse_error("character class range lower bound > upper bound"));
                }
                ranges.push((cp, cp2));
            } else {
                ranges.push((cp, cp));
            }
        }

        self.expect(&TokenType::RBracket, "expected ]")?;
        Ok(self.builder.add_char_class(negated, ranges))
    }

    fn parse_string(&mut self) -> Result<ExprId> {
        let value = self.peek().value.clone();
        self.consume();
        if value.is_empty() {
            Ok(self.builder.add_empty_string())
        } else {
            Ok(self.builder.add_byte_string(value.as_bytes()))
        }
    }

    fn parse_regex_terminal(&mut self) -> Result<ExprId> {
        let pattern = self.peek().value.clone();
        let (line, col) = (self.peek().line, self.peek().col);
        self.consume();
        crate::regex::compile_regex_into(&mut self.builder, &pattern, &self.cur_rule_name)
            .map_err(|e| {
                anyhow::anyhow!("grammar parse error at line {}, column {}: {}", line, col, e)
            })
    }

    fn parse_rule_ref(&mut self) -> Result<ExprId> {
        let name = self.peek().value.clone();
        self.consume();
        match self.builder.find_rule(&name) {
            Some(rule_id) => Ok(self.builder.add_rule_ref(rule_id)),
            None => Err(self.parse_error(&format!("rule \"{}\" is not defined", name))),
        }
    }

    fn parse_element(&mut self) -> Result<ExprId> {
        match &self.peek().ty {
            TokenType::LParen => {
                self.consume();
                if self.peek().ty == TokenType::RParen {
                    self.consume();
                    return Ok(self.builder.add_empty_string());
                }
                let expr = self.parse_choices()?;
                self.expect(&TokenType::RParen, "expected )")?;
                Ok(expr)
            }
            TokenType::LBracket => self.parse_char_class(),
            TokenType::StringLiteral => self.parse_string(),
            TokenType::RegexLiteral => self.parse_regex_terminal(),
            TokenType::Identifier => self.parse_rule_ref(),
            other => Err(self.parse_error(&format!("expected element, got {:?}", other))),
        }
    }

    fn parse_integer(&mut self) -> Result<i64> {
        match self.peek().ty {
            TokenType::IntegerLiteral(n) => {
                self.consume();
                Ok(n)
            }
            _ => Err(self.parse_error("expected integer")),
        }
    }

    fn parse_repetition_range(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect(&TokenType::LBrace, "expected {")?;
        let lower = self.parse_integer()?;

        if self.peek().ty == TokenType::Comma {
            self.consume();
            if self.peek().ty == TokenType::RBrace {
                self.consume();
                return Ok((lower as u32, None));
            }
            let upper = self.parse_integer()?;
            if upper < lower {
                return Err(self.parse_error("repetition lower bound is larger than upper bound"));
            }
            self.expect(&TokenType::RBrace, "expected }")?;
            Ok((lower as u32, Some(upper as u32)))
        } else if self.peek().ty == TokenType::RBrace {
            self.consume();
            Ok((lower as u32, Some(lower as u32)))
        } else {
            Err(self.parse_error("expected ',' or '}' in repetition range"))
        }
    }

    fn apply_repeat(&mut self, expr: ExprId, min: u32, max: Option<u32>) -> ExprId {
        // `[..]*` stays a leaf; everything else becomes Repeat over a rule.
        if min == 0 && max.is_none() {
            if let Some((negated, ranges)) = self.builder.as_char_class(expr) {
                return self.builder.add_char_class_star(negated, ranges);
            }
        }
        let hint = self.cur_rule_name.clone();
        let rule = self.builder.wrap_in_rule(expr, &hint);
        self.builder.add_repeat(rule, min, max)
    }

    fn parse_element_with_quantifier(&mut self) -> Result<ExprId> {
        let expr = self.parse_element()?;
        match self.peek().ty {
            TokenType::Star => {
                self.consume();
                Ok(self.apply_repeat(expr, 0, None))
            }
            TokenType::Plus => {
                self.consume();
                Ok(self.apply_repeat(expr, 1, None))
            }
            TokenType::Question => {
                self.consume();
                Ok(self.apply_repeat(expr, 0, Some(1)))
            }
            TokenType::LBrace => {
                let (min, max) = self.parse_repetition_range()?;
                Ok(self.apply_repeat(expr, min, max))
            }
            _ => Ok(expr),
        }
    }

    fn parse_sequence(&mut self) -> Result<ExprId> {
        let mut elements = Vec::new();
        loop {
            elements.push(self.parse_element_with_quantifier()?);
            match self.peek().ty {
                TokenType::Pipe
                | TokenType::RParen
                | TokenType::RuleName
                | TokenType::EndOfFile => break,
                _ => {}
            }
        }
        Ok(self.builder.add_sequence(elements))
    }

    fn parse_choices(&mut self) -> Result<ExprId> {
        let mut choices = vec![self.parse_sequence()?];
        while self.peek().ty == TokenType::Pipe {
            self.consume();
            choices.push(self.parse_sequence()?);
        }
        Ok(self.builder.add_choices(choices))
    }

    fn parse_rule(&mut self) -> Result<()> {
        if self.peek().ty != TokenType::RuleName {
            return Err(self.parse_error("expected rule name"));
        }
        let name = self.peek().value.clone();
        self.cur_rule_name = name.clone();
        self.consume();
        self.expect(&TokenType::Assign, "expected '::=' or ':'")?;

        let body = self.parse_choices()?;
        let rule_id = self
            .builder
            .find_rule(&name)
            .expect("registered in init_rule_names");
        self.builder.set_rule_body(rule_id, body);
        Ok(())
    }

    fn parse(mut self, root_rule_name: Option<&str>) -> Result<Grammar> {
        self.init_rule_names()?;

        let root = match root_rule_name {
            Some(name) => {
                if self.builder.find_rule(name).is_none() {
                    bail!("grammar parse error: root rule \"{}\" not found", name);
                }
                name.to_string()
            }
            // Lark style: the first defined rule is the root.
            None => match self.builder.rules.first() {
                Some(rule) => rule.name.clone(),
                None => bail!("grammar parse error: no rules defined"),
            },
        };

        while self.peek().ty != TokenType::EndOfFile {
            self.parse_rule()?;
        }

        self.builder.build(&root)
    }
}

// ─── Public API ──────────────────────────────────────────────────────

impl Grammar {
    /// Parse an EBNF grammar string with an explicit root rule.
    ///
    /// # Example
    /// ```
    /// use tokenmask::Grammar;
    ///
    /// let grammar = Grammar::from_ebnf(r#"root ::= "hello" | "world""#, "root").unwrap();
    /// assert_eq!(grammar.num_rules(), 1);
    /// ```
    pub fn from_ebnf(source: &str, root_rule_name: &str) -> Result<Grammar> {
        let tokens = Lexer::new(source).tokenize()?;
        Parser::new(tokens).parse(Some(root_rule_name))
    }

    /// Parse a Lark-style grammar string; the first defined rule is the root.
    ///
    /// # Example
    /// ```
    /// use tokenmask::Grammar;
    ///
    /// let grammar = Grammar::from_text("start: /[a-z]+/ \"!\"").unwrap();
    /// assert_eq!(grammar.root().name, "start");
    /// ```
    pub fn from_text(source: &str) -> Result<Grammar> {
        let tokens = Lexer::new(source).tokenize()?;
        Parser::new(tokens).parse(None)
    }
}
