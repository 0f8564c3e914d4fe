//! Regex-to-grammar converter.
//!
//! Compiles a regular expression (JS-flavored semantics) directly into
//! grammar expressions. Used standalone via [`regex_to_grammar`] and by the
//! text front-end for inline `/.../` terminals.
//!
//! # Supported
//! - Literals, character classes `[a-z]`, negated `[^...]`
//! - Quantifiers: `*`, `+`, `?`, `{n}`, `{n,}`, `{n,m}` (non-greedy suffix ignored)
//! - Groups: `(...)`, `(?:...)`, `(?<name>...)`
//! - Alternation: `|`
//! - Escapes: `\d`, `\w`, `\s`, `\D`, `\W`, `\S`, `\uXXXX`, `\u{XXXXX}`, `\xHH`
//! - Any char: `.` (any Unicode scalar)
//! - Anchors `^`, `$`: ignored (the grammar is anchored by construction)
//!
//! # Unsupported (construction errors)
//! - Lookahead/lookbehind, backreferences, `\p{...}`, word boundaries

use anyhow::{Result, bail};

use crate::grammar::builder::GrammarBuilder;
use crate::grammar::{ExprId, Grammar};

/// Compile a regex pattern into a grammar with a single `root` rule.
///
/// # Example
/// ```
/// use tokenmask::regex::regex_to_grammar;
///
/// let grammar = regex_to_grammar("[a-z]+@[a-z]+").unwrap();
/// assert_eq!(grammar.root().name, "root");
/// ```
pub fn regex_to_grammar(pattern: &str) -> Result<Grammar> {
    let mut b = GrammarBuilder::new();
    let root = b.add_rule("root");
    let body = compile_regex_into(&mut b, pattern, "root")?;
    b.set_rule_body(root, body);
    b.build("root")
}

/// Compile a regex pattern into an expression inside an existing builder.
/// Auxiliary rules needed for quantifiers are named after `hint`.
pub(crate) fn compile_regex_into(
    b: &mut GrammarBuilder,
    pattern: &str,
    hint: &str,
) -> Result<ExprId> {
    let mut p = RegexParser {
        chars: pattern.chars().collect(),
        pos: 0,
        hint: hint.to_string(),
    };
    let expr = p.parse_alternation(b)?;
    if !p.at_end() {
        bail!(
            "unexpected character '{}' at position {} in regex",
            p.chars[p.pos],
            p.pos
        );
    }
    Ok(expr)
}

struct RegexParser {
    chars: Vec<char>,
    pos: usize,
    hint: String,
}

/// A parsed atom before quantification.
enum Atom {
    /// A single literal character (merged into byte-string runs).
    Literal(char),
    Expr(ExprId),
    /// Ignored anchors.
    Skip,
}

impl RegexParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_alternation(&mut self, b: &mut GrammarBuilder) -> Result<ExprId> {
        let mut alts = vec![self.parse_sequence(b)?];
        while self.eat('|') {
            alts.push(self.parse_sequence(b)?);
        }
        if alts.len() == 1 {
            Ok(alts.remove(0))
        } else {
            Ok(b.add_choices(alts))
        }
    }

    fn parse_sequence(&mut self, b: &mut GrammarBuilder) -> Result<ExprId> {
        let mut elems: Vec<ExprId> = Vec::new();
        // Literal characters accumulate here and flush as one byte string.
        let mut run = String::new();

        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            let atom = self.parse_atom(b)?;
            let quant = self.parse_quantifier()?;

            match (atom, quant) {
                (Atom::Skip, _) => {}
                (Atom::Literal(c), None) => run.push(c),
                (Atom::Literal(c), Some((min, max))) => {
                    // The quantifier binds only the last character.
                    flush_run(b, &mut run, &mut elems);
                    let mut buf = [0u8; 4];
                    let lit = b.add_byte_string(c.encode_utf8(&mut buf).as_bytes());
                    elems.push(self.apply_quantifier(b, lit, min, max));
                }
                (Atom::Expr(e), None) => {
                    flush_run(b, &mut run, &mut elems);
                    elems.push(e);
                }
                (Atom::Expr(e), Some((min, max))) => {
                    flush_run(b, &mut run, &mut elems);
                    elems.push(self.apply_quantifier(b, e, min, max));
                }
            }
        }
        flush_run(b, &mut run, &mut elems);

        match elems.len() {
            0 => Ok(b.add_empty_string()),
            1 => Ok(elems.remove(0)),
            _ => Ok(b.add_sequence(elems)),
        }
    }

    fn apply_quantifier(
        &self,
        b: &mut GrammarBuilder,
        expr: ExprId,
        min: u32,
        max: Option<u32>,
    ) -> ExprId {
        if min == 0 && max.is_none() {
            if let Some((negated, ranges)) = b.as_char_class(expr) {
                return b.add_char_class_star(negated, ranges);
            }
        }
        let rule = b.wrap_in_rule(expr, &self.hint);
        b.add_repeat(rule, min, max)
    }

    /// Quantifier following an atom, if any. Skips a non-greedy `?` suffix
    /// and rejects stacked quantifiers.
    fn parse_quantifier(&mut self) -> Result<Option<(u32, Option<u32>)>> {
        let quant = match self.peek() {
            Some('*') => {
                self.advance();
                Some((0, None))
            }
            Some('+') => {
                self.advance();
                Some((1, None))
            }
            Some('?') => {
                self.advance();
                Some((0, Some(1)))
            }
            Some('{') => Some(self.parse_repetition()?),
            _ => None,
        };
        if quant.is_some() {
            self.eat('?'); // non-greedy marker changes nothing for masking
            if matches!(self.peek(), Some('*') | Some('+') | Some('{')) {
                bail!("stacked quantifiers are not supported at position {}", self.pos);
            }
        }
        Ok(quant)
    }

    fn parse_repetition(&mut self) -> Result<(u32, Option<u32>)> {
        self.advance(); // {
        let min = self.parse_int()?;
        match self.peek() {
            Some('}') => {
                self.advance();
                Ok((min, Some(min)))
            }
            Some(',') => {
                self.advance();
                if self.eat('}') {
                    return Ok((min, None));
                }
                let max = self.parse_int()?;
                if max < min {
                    bail!("repetition lower bound {} exceeds upper bound {}", min, max);
                }
                if !self.eat('}') {
                    bail!("expected '}}' in repetition at position {}", self.pos);
                }
                Ok((min, Some(max)))
            }
            _ => bail!("expected ',' or '}}' in repetition at position {}", self.pos),
        }
    }

    fn parse_int(&mut self) -> Result<u32> {
        let mut n: u32 = 0;
        let mut any = false;
        while let Some(c) = self.peek() {
            match c.to_digit(10) {
                Some(d) => {
                    n = n.saturating_mul(10).saturating_add(d);
                    self.advance();
                    any = true;
                }
                None => break,
            }
        }
        if !any {
            bail!("expected integer in repetition at position {}", self.pos);
        }
        Ok(n)
    }

    fn parse_atom(&mut self, b: &mut GrammarBuilder) -> Result<Atom> {
        match self.peek() {
            None => Ok(Atom::Skip),
            Some('(') => self.parse_group(b),
            Some('[') => Ok(Atom::Expr(self.parse_char_class(b)?)),
            Some('.') => {
                self.advance();
                Ok(Atom::Expr(b.add_char_class(false, vec![(0, 0x10FFFF)])))
            }
            Some('\\') => self.parse_escape(b),
            Some('^') | Some('$') => {
                self.advance();
                Ok(Atom::Skip)
            }
            Some(c) if is_metachar(c) => {
                bail!("unexpected metacharacter '{}' at position {}", c, self.pos);
            }
            Some(c) => {
                self.advance();
                Ok(Atom::Literal(c))
            }
        }
    }

    fn parse_group(&mut self, b: &mut GrammarBuilder) -> Result<Atom> {
        self.advance(); // (

        if self.eat('?') {
            match self.peek() {
                Some(':') => {
                    self.advance();
                }
                Some('=') | Some('!') => bail!("lookahead assertions are not supported"),
                Some('<') => {
                    self.advance();
                    match self.peek() {
                        Some('=') | Some('!') => {
                            bail!("lookbehind assertions are not supported")
                        }
                        _ => {
                            // Named capture group: skip the name.
                            while self.peek() != Some('>') {
                                if self.at_end() {
                                    bail!("unterminated named group");
                                }
                                self.advance();
                            }
                            self.advance();
                        }
                    }
                }
                _ => bail!("unsupported group modifier at position {}", self.pos),
            }
        }

        let inner = self.parse_alternation(b)?;
        if !self.eat(')') {
            bail!("unmatched '(' at position {}", self.pos);
        }
        Ok(Atom::Expr(inner))
    }

    fn parse_char_class(&mut self, b: &mut GrammarBuilder) -> Result<ExprId> {
        self.advance(); // [
        let negated = self.eat('^');
        let mut ranges: Vec<(u32, u32)> = Vec::new();

        // Leading ] is a literal.
        if self.peek() == Some(']') {
            self.advance();
            ranges.push((']' as u32, ']' as u32));
        }

        while self.peek() != Some(']') {
            let Some(c) = self.peek() else {
                bail!("unterminated character class");
            };
            let lo = if c == '\\' {
                match self.parse_class_escape()? {
                    ClassEscape::Char(cp) => cp,
                    ClassEscape::Ranges(rs) => {
                        ranges.extend(rs);
                        continue;
                    }
                }
            } else {
                self.advance();
                c as u32
            };

            // Range a-b (but a trailing '-' is a literal).
            if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                self.advance(); // -
                let Some(c2) = self.peek() else {
                    bail!("unterminated character class");
                };
                let hi = if c2 == '\\' {
                    match self.parse_class_escape()? {
                        ClassEscape::Char(cp) => cp,
                        ClassEscape::Ranges(_) => {
                            bail!("class shorthand cannot end a range at position {}", self.pos)
                        }
                    }
                } else {
                    self.advance();
                    c2 as u32
                };
                if lo > hi {
                    bail!("character class range out of order at position {}", self.pos);
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        self.advance(); // ]

        Ok(b.add_char_class(negated, ranges))
    }

    fn parse_class_escape(&mut self) -> Result<ClassEscape> {
        self.advance(); // backslash
        let Some(c) = self.advance() else {
            bail!("truncated escape");
        };
        let esc = match c {
            'd' => ClassEscape::Ranges(DIGIT_RANGES.to_vec()),
            'D' => ClassEscape::Ranges(complement(DIGIT_RANGES)),
            'w' => ClassEscape::Ranges(WORD_RANGES.to_vec()),
            'W' => ClassEscape::Ranges(complement(WORD_RANGES)),
            's' => ClassEscape::Ranges(SPACE_RANGES.to_vec()),
            'S' => ClassEscape::Ranges(complement(SPACE_RANGES)),
            'n' => ClassEscape::Char(0x0A),
            'r' => ClassEscape::Char(0x0D),
            't' => ClassEscape::Char(0x09),
            'f' => ClassEscape::Char(0x0C),
            'v' => ClassEscape::Char(0x0B),
            '0' => ClassEscape::Char(0x00),
            'u' => ClassEscape::Char(self.parse_unicode_escape()?),
            'x' => ClassEscape::Char(self.parse_hex_escape()?),
            c => ClassEscape::Char(c as u32),
        };
        Ok(esc)
    }

    fn parse_escape(&mut self, b: &mut GrammarBuilder) -> Result<Atom> {
        self.advance(); // backslash
        let Some(c) = self.advance() else {
            bail!("truncated escape");
        };
        let expr = match c {
            'd' => b.add_char_class(false, DIGIT_RANGES.to_vec()),
            'D' => b.add_char_class(true, DIGIT_RANGES.to_vec()),
            'w' => b.add_char_class(false, WORD_RANGES.to_vec()),
            'W' => b.add_char_class(true, WORD_RANGES.to_vec()),
            's' => b.add_char_class(false, SPACE_RANGES.to_vec()),
            'S' => b.add_char_class(true, SPACE_RANGES.to_vec()),
            'b' | 'B' => bail!("word boundaries (\\b, \\B) are not supported"),
            'p' | 'P' => bail!("unicode property escapes (\\p, \\P) are not supported"),
            'k' => bail!("backreferences are not supported"),
            '1'..='9' => bail!("backreferences are not supported"),
            'n' => return Ok(Atom::Literal('\n')),
            'r' => return Ok(Atom::Literal('\r')),
            't' => return Ok(Atom::Literal('\t')),
            'f' => return Ok(Atom::Literal('\u{0C}')),
            'v' => return Ok(Atom::Literal('\u{0B}')),
            '0' => return Ok(Atom::Literal('\0')),
            'u' => {
                let cp = self.parse_unicode_escape()?;
                let Some(ch) = char::from_u32(cp) else {
                    bail!("invalid codepoint U+{:04X} in escape", cp);
                };
                return Ok(Atom::Literal(ch));
            }
            'x' => {
                let cp = self.parse_hex_escape()?;
                let Some(ch) = char::from_u32(cp) else {
                    bail!("invalid codepoint U+{:04X} in escape", cp);
                };
                return Ok(Atom::Literal(ch));
            }
            // Escaped metachar or ordinary character.
            c => return Ok(Atom::Literal(c)),
        };
        Ok(Atom::Expr(expr))
    }

    /// `\uXXXX` or `\u{XXXXX}` (the leading `\u` is already consumed).
    fn parse_unicode_escape(&mut self) -> Result<u32> {
        if self.eat('{') {
            let mut hex = String::new();
            while self.peek() != Some('}') {
                match self.advance() {
                    Some(c) => hex.push(c),
                    None => bail!("unterminated unicode escape"),
                }
            }
            self.advance(); // }
            u32::from_str_radix(&hex, 16)
                .map_err(|_| anyhow::anyhow!("invalid unicode escape: \\u{{{}}}", hex))
        } else {
            let hex = self.read_hex(4)?;
            u32::from_str_radix(&hex, 16)
                .map_err(|_| anyhow::anyhow!("invalid unicode escape: \\u{}", hex))
        }
    }

    /// `\xHH` (the leading `\x` is already consumed).
    fn parse_hex_escape(&mut self) -> Result<u32> {
        let hex = self.read_hex(2)?;
        u32::from_str_radix(&hex, 16)
            .map_err(|_| anyhow::anyhow!("invalid hex escape: \\x{}", hex))
    }

    fn read_hex(&mut self, count: usize) -> Result<String> {
        let mut s = String::new();
        for _ in 0..count {
            match self.advance() {
                Some(c) if c.is_ascii_hexdigit() => s.push(c),
                _ => bail!("expected hex digit in escape"),
            }
        }
        Ok(s)
    }
}

enum ClassEscape {
    Char(u32),
    Ranges(Vec<(u32, u32)>),
}

const DIGIT_RANGES: &[(u32, u32)] = &[(0x30, 0x39)];
const WORD_RANGES: &[(u32, u32)] = &[(0x30, 0x39), (0x41, 0x5A), (0x5F, 0x5F), (0x61, 0x7A)];
const SPACE_RANGES: &[(u32, u32)] = &[(0x09, 0x0D), (0x20, 0x20)];

/// Complement of sorted, disjoint ranges over the Unicode scalar space.
/// (Surrogates are excluded later, at NFA construction.)
fn complement(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut prev = 0u32;
    for &(lo, hi) in ranges {
        if lo > prev {
            out.push((prev, lo - 1));
        }
        prev = hi + 1;
    }
    if prev <= 0x10FFFF {
        out.push((prev, 0x10FFFF));
    }
    out
}

fn is_metachar(c: char) -> bool {
    matches!(c, '*' | '+' | '?' | '{' | '}' | '|' | ')')
}

fn flush_run(b: &mut GrammarBuilder, run: &mut String, elems: &mut Vec<ExprId>) {
    if !run.is_empty() {
        let e = b.add_byte_string(run.as_bytes());
        elems.push(e);
        run.clear();
    }
}
