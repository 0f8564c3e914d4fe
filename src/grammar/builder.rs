//! Programmatic grammar construction.

use anyhow::{Result, bail};

use super::{Expr, ExprId, Grammar, Rule, RuleId};

/// Incremental builder for [`Grammar`].
///
/// # Example
/// ```
/// use tokenmask::grammar::builder::GrammarBuilder;
///
/// let mut b = GrammarBuilder::new();
/// let root = b.add_rule("root");
/// let hello = b.add_byte_string(b"hello");
/// b.set_rule_body(root, hello);
/// let grammar = b.build("root").unwrap();
/// assert_eq!(grammar.num_rules(), 1);
/// ```
pub struct GrammarBuilder {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            exprs: Vec::new(),
        }
    }

    /// Add a rule with no body yet; the body must be set before `build`.
    pub fn add_rule(&mut self, name: &str) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            name: name.to_string(),
            body: ExprId(u32::MAX), // sentinel, must be filled
        });
        id
    }

    pub fn set_rule_body(&mut self, rule: RuleId, body: ExprId) {
        self.rules[rule.0 as usize].body = body;
    }

    pub fn add_expr(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub fn add_empty_string(&mut self) -> ExprId {
        self.add_expr(Expr::EmptyString)
    }

    pub fn add_byte_string(&mut self, bytes: &[u8]) -> ExprId {
        self.add_expr(Expr::ByteString(bytes.to_vec()))
    }

    pub fn add_char_class(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharClass { negated, ranges })
    }

    pub fn add_char_class_star(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharClassStar { negated, ranges })
    }

    pub fn add_rule_ref(&mut self, rule: RuleId) -> ExprId {
        self.add_expr(Expr::RuleRef(rule))
    }

    pub fn add_sequence(&mut self, exprs: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Sequence(exprs))
    }

    pub fn add_choices(&mut self, exprs: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Choices(exprs))
    }

    pub fn add_repeat(&mut self, rule: RuleId, min: u32, max: Option<u32>) -> ExprId {
        self.add_expr(Expr::Repeat { rule, min, max })
    }

    /// Turn an expression into a rule reference, creating an auxiliary rule
    /// unless the expression already is one. Used by quantifier desugaring.
    pub fn wrap_in_rule(&mut self, expr: ExprId, name_hint: &str) -> RuleId {
        if let Expr::RuleRef(rid) = self.exprs[expr.0 as usize] {
            return rid;
        }
        let name = format!("{}_{}", name_hint, self.rules.len());
        let aux = self.add_rule(&name);
        self.set_rule_body(aux, expr);
        aux
    }

    /// Whether an expression is a plain (non-star) character class.
    /// Quantifier desugaring turns `[..]*` into the dedicated star leaf.
    pub fn as_char_class(&self, expr: ExprId) -> Option<(bool, Vec<(u32, u32)>)> {
        match &self.exprs[expr.0 as usize] {
            Expr::CharClass { negated, ranges } => Some((*negated, ranges.clone())),
            _ => None,
        }
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(|i| RuleId(i as u32))
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Finalize the grammar, resolving the root rule by name.
    pub fn build(self, root_rule_name: &str) -> Result<Grammar> {
        let root_rule = match self.rules.iter().position(|r| r.name == root_rule_name) {
            Some(i) => RuleId(i as u32),
            None => bail!("root rule '{}' not found", root_rule_name),
        };
        for rule in &self.rules {
            if rule.body == ExprId(u32::MAX) {
                bail!("rule '{}' has no body", rule.name);
            }
        }
        Ok(Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule,
        })
    }
}

impl Default for GrammarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_grammar() {
        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");
        let hello = b.add_byte_string(b"hello");
        b.set_rule_body(root, hello);

        let grammar = b.build("root").unwrap();
        assert_eq!(grammar.num_rules(), 1);
        assert_eq!(grammar.root_rule(), RuleId(0));
        match grammar.get_expr(grammar.root().body) {
            Expr::ByteString(bytes) => assert_eq!(bytes, b"hello"),
            other => panic!("expected ByteString, got {:?}", other),
        }
    }

    #[test]
    fn test_wrap_in_rule_reuses_refs() {
        let mut b = GrammarBuilder::new();
        let digit = b.add_rule("digit");
        let cc = b.add_char_class(false, vec![(0x30, 0x39)]);
        b.set_rule_body(digit, cc);

        let dref = b.add_rule_ref(digit);
        assert_eq!(b.wrap_in_rule(dref, "aux"), digit);

        let lit = b.add_byte_string(b"x");
        let aux = b.wrap_in_rule(lit, "aux");
        assert_ne!(aux, digit);
    }

    #[test]
    fn test_build_missing_root() {
        let mut b = GrammarBuilder::new();
        let main = b.add_rule("main");
        let e = b.add_empty_string();
        b.set_rule_body(main, e);
        assert!(b.build("root").is_err());
    }

    #[test]
    fn test_build_missing_body() {
        let mut b = GrammarBuilder::new();
        b.add_rule("root");
        assert!(b.build("root").is_err());
    }

    #[test]
    fn test_display_grammar() {
        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");
        let digit = b.add_rule("digit");

        let digit_class = b.add_char_class(false, vec![(0x30, 0x39)]);
        b.set_rule_body(digit, digit_class);

        let a = b.add_byte_string(b"a");
        let digit_ref = b.add_rule_ref(digit);
        let seq = b.add_sequence(vec![a, digit_ref]);
        let empty = b.add_empty_string();
        let choices = b.add_choices(vec![seq, empty]);
        b.set_rule_body(root, choices);

        let grammar = b.build("root").unwrap();
        assert_eq!(
            grammar.to_string(),
            "root ::= ((\"a\" digit) | \"\")\ndigit ::= [0-9]"
        );
    }
}
