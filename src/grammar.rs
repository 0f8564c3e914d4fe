//! Grammar IR: rules and an expression arena, plus the [`GrammarSpec`]
//! source bundle consumed by matcher construction.

pub mod builder;
pub mod ebnf;
pub(crate) mod normalize;

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::json_schema::JsonSchemaOptions;
use builder::GrammarBuilder;

/// Index into the grammar's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub u32);

/// Index into the grammar's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

/// A grammar rule: a named production with a body expression.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub body: ExprId,
}

/// A grammar expression node.
///
/// Expressions live in a flat arena (`Grammar::exprs`) and reference each
/// other by [`ExprId`], which keeps traversal cache-friendly and free of
/// lifetime entanglement.
#[derive(Debug, Clone)]
pub enum Expr {
    /// The empty string `""`.
    EmptyString,

    /// A literal byte string (UTF-8 encoded for text sources).
    ByteString(Vec<u8>),

    /// A character class over Unicode scalar ranges, e.g. `[a-z0-9]`.
    /// When `negated` is true, matches any scalar NOT in the ranges.
    CharClass {
        negated: bool,
        /// Inclusive `(lo, hi)` codepoint ranges.
        ranges: Vec<(u32, u32)>,
    },

    /// Kleene star of a character class, e.g. `[a-z]*`.
    /// Kept as a leaf so matching avoids rule recursion for the common case.
    CharClassStar {
        negated: bool,
        ranges: Vec<(u32, u32)>,
    },

    /// A reference to another rule.
    RuleRef(RuleId),

    /// Ordered concatenation.
    Sequence(Vec<ExprId>),

    /// Alternation.
    Choices(Vec<ExprId>),

    /// Bounded repetition of a rule; `max = None` means unbounded.
    Repeat {
        rule: RuleId,
        min: u32,
        max: Option<u32>,
    },
}

/// An immutable context-free grammar.
///
/// Built via [`GrammarBuilder`], [`Grammar::from_ebnf`], or one of the
/// front-ends in [`crate::regex`] / [`crate::json_schema`].
#[derive(Debug, Clone)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root_rule: RuleId,
}

impl Grammar {
    pub fn root_rule(&self) -> RuleId {
        self.root_rule
    }

    pub fn get_rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    pub fn get_expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn root(&self) -> &Rule {
        self.get_rule(self.root_rule)
    }

    /// Merge several grammars into one whose root accepts any of them.
    ///
    /// Rule ids of each part are re-offset into a shared arena; part rules
    /// keep their names prefixed with `g{i}_` to stay unique.
    pub fn merge_alternatives(parts: Vec<Grammar>) -> Result<Grammar> {
        if parts.is_empty() {
            bail!("cannot merge an empty grammar list");
        }
        if parts.len() == 1 {
            return Ok(parts.into_iter().next().expect("len checked"));
        }

        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");
        let mut part_roots = Vec::new();

        for (i, part) in parts.iter().enumerate() {
            let rule_base = b.num_rules() as u32;
            for rule in part.rules() {
                b.add_rule(&format!("g{}_{}", i, rule.name));
            }
            // Copy the expression arena, remapping rule references.
            let mut expr_map = Vec::with_capacity(part.exprs.len());
            for expr in &part.exprs {
                let remapped = match expr {
                    Expr::RuleRef(r) => Expr::RuleRef(RuleId(r.0 + rule_base)),
                    Expr::Repeat { rule, min, max } => Expr::Repeat {
                        rule: RuleId(rule.0 + rule_base),
                        min: *min,
                        max: *max,
                    },
                    Expr::Sequence(es) => {
                        Expr::Sequence(es.iter().map(|e| expr_map[e.0 as usize]).collect())
                    }
                    Expr::Choices(es) => {
                        Expr::Choices(es.iter().map(|e| expr_map[e.0 as usize]).collect())
                    }
                    other => other.clone(),
                };
                expr_map.push(b.add_expr(remapped));
            }
            for (j, rule) in part.rules().iter().enumerate() {
                b.set_rule_body(RuleId(rule_base + j as u32), expr_map[rule.body.0 as usize]);
            }
            part_roots.push(b.add_rule_ref(RuleId(rule_base + part.root_rule.0)));
        }

        let body = b.add_choices(part_roots);
        b.set_rule_body(root, body);
        b.build("root")
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} ::= ", rule.name)?;
            self.fmt_expr(f, rule.body)?;
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        match self.get_expr(id) {
            Expr::EmptyString => write!(f, "\"\""),
            Expr::ByteString(bytes) => {
                write!(f, "\"")?;
                for &b in bytes {
                    match b {
                        b'\\' => write!(f, "\\\\")?,
                        b'"' => write!(f, "\\\"")?,
                        b'\n' => write!(f, "\\n")?,
                        b'\r' => write!(f, "\\r")?,
                        b'\t' => write!(f, "\\t")?,
                        0x20..=0x7e => write!(f, "{}", b as char)?,
                        _ => write!(f, "\\x{:02x}", b)?,
                    }
                }
                write!(f, "\"")
            }
            Expr::CharClass { negated, ranges } => {
                self.fmt_char_class(f, *negated, ranges)?;
                Ok(())
            }
            Expr::CharClassStar { negated, ranges } => {
                self.fmt_char_class(f, *negated, ranges)?;
                write!(f, "*")
            }
            Expr::RuleRef(rule_id) => write!(f, "{}", self.rules[rule_id.0 as usize].name),
            Expr::Sequence(exprs) => {
                write!(f, "(")?;
                for (i, &eid) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.fmt_expr(f, eid)?;
                }
                write!(f, ")")
            }
            Expr::Choices(exprs) => {
                write!(f, "(")?;
                for (i, &eid) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    self.fmt_expr(f, eid)?;
                }
                write!(f, ")")
            }
            Expr::Repeat { rule, min, max } => {
                let name = &self.rules[rule.0 as usize].name;
                match max {
                    Some(max) => write!(f, "{}{{{},{}}}", name, min, max),
                    None => write!(f, "{}{{{},}}", name, min),
                }
            }
        }
    }

    fn fmt_char_class(
        &self,
        f: &mut fmt::Formatter<'_>,
        negated: bool,
        ranges: &[(u32, u32)],
    ) -> fmt::Result {
        write!(f, "[")?;
        if negated {
            write!(f, "^")?;
        }
        for &(lo, hi) in ranges {
            Self::fmt_class_char(f, lo)?;
            if lo != hi {
                write!(f, "-")?;
                Self::fmt_class_char(f, hi)?;
            }
        }
        write!(f, "]")
    }

    fn fmt_class_char(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
        match cp {
            0x5c => write!(f, "\\\\"),
            0x5d => write!(f, "\\]"),
            0x5e => write!(f, "\\^"),
            0x2d => write!(f, "\\-"),
            0x09 => write!(f, "\\t"),
            0x0a => write!(f, "\\n"),
            0x0d => write!(f, "\\r"),
            0x20..=0x7e => write!(f, "{}", char::from_u32(cp).unwrap_or('?')),
            cp if cp <= 0xffff => write!(f, "\\u{:04x}", cp),
            cp => write!(f, "\\U{:08x}", cp),
        }
    }
}

// ---------------------------------------------------------------------------
// Grammar sources
// ---------------------------------------------------------------------------

/// One grammar source inside a [`GrammarSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarSource {
    /// A regular expression (JS-flavored, see [`crate::regex`]).
    Regex(String),
    /// A Lark-style / EBNF grammar text (see [`Grammar::from_text`]).
    Lark(String),
    /// A JSON Schema document with conversion options.
    JsonSchema {
        schema: serde_json::Value,
        #[serde(default)]
        options: JsonSchemaOptions,
    },
}

/// A bundle of grammar sources, the construction input for
/// [`crate::Matcher::new`].
///
/// A bundle with several sources compiles each and accepts any of them
/// (root-level alternation). Structurally invalid sources fail compilation
/// eagerly; nothing is ever partially constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarSpec {
    pub grammars: Vec<GrammarSource>,
}

impl GrammarSpec {
    pub fn from_regex(pattern: impl Into<String>) -> Self {
        Self {
            grammars: vec![GrammarSource::Regex(pattern.into())],
        }
    }

    pub fn from_lark(text: impl Into<String>) -> Self {
        Self {
            grammars: vec![GrammarSource::Lark(text.into())],
        }
    }

    pub fn from_json_schema(schema: serde_json::Value, options: JsonSchemaOptions) -> Self {
        Self {
            grammars: vec![GrammarSource::JsonSchema { schema, options }],
        }
    }

    /// Parse a serialized spec (`{"grammars": [...]}`).
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compile every source and merge the results.
    pub fn compile(&self) -> Result<Grammar> {
        if self.grammars.is_empty() {
            bail!("grammar spec contains no grammars");
        }
        let parts = self
            .grammars
            .iter()
            .map(|src| match src {
                GrammarSource::Regex(pattern) => crate::regex::regex_to_grammar(pattern),
                GrammarSource::Lark(text) => Grammar::from_text(text),
                GrammarSource::JsonSchema { schema, options } => {
                    crate::json_schema::json_schema_to_grammar(schema, options)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Grammar::merge_alternatives(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_two_grammars() {
        let a = Grammar::from_ebnf(r#"root ::= "yes""#, "root").unwrap();
        let b = Grammar::from_ebnf(r#"root ::= [0-9]+"#, "root").unwrap();
        let merged = Grammar::merge_alternatives(vec![a, b]).unwrap();
        assert_eq!(merged.root().name, "root");
        // Both part roots are reachable as alternatives.
        let s = merged.to_string();
        assert!(s.contains("g0_root"));
        assert!(s.contains("g1_root"));
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = GrammarSpec::from_regex("[a-z]+");
        let text = serde_json::to_string(&spec).unwrap();
        let parsed = GrammarSpec::from_json(&text).unwrap();
        assert!(parsed.compile().is_ok());
    }

    #[test]
    fn test_empty_spec_fails() {
        let spec = GrammarSpec { grammars: vec![] };
        assert!(spec.compile().is_err());
    }
}
