//! JSON Schema to grammar conversion.
//!
//! Converts a schema document into an EBNF text and parses that into a
//! [`Grammar`]. Supported keywords: `type` (including type lists), `enum`,
//! `const`, `anyOf`/`oneOf`, objects (`properties`, `required`,
//! `additionalProperties`), arrays (`items`), strings, integers, numbers,
//! booleans, null. Required keys without a property schema admit any value.
//!
//! `whitespace_flexible` (default true) allows `[ \t\n\r]*` between
//! structural tokens; the document itself is never preceded by whitespace.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::grammar::Grammar;

/// Conversion options for JSON-Schema-derived grammars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace between structural tokens.
    #[serde(default = "default_true")]
    pub whitespace_flexible: bool,
}

fn default_true() -> bool {
    true
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            whitespace_flexible: true,
        }
    }
}

/// Convert a JSON Schema document into a grammar rooted at the document.
pub fn json_schema_to_grammar(schema: &Value, options: &JsonSchemaOptions) -> Result<Grammar> {
    let ebnf = json_schema_to_ebnf(schema, options)?;
    Grammar::from_ebnf(&ebnf, "root")
}

/// Convert a JSON Schema document into EBNF text.
pub fn json_schema_to_ebnf(schema: &Value, options: &JsonSchemaOptions) -> Result<String> {
    let mut conv = SchemaConverter::new(options.clone());
    let root = conv.visit(schema, "root")?;
    Ok(conv.finish(&root))
}

struct SchemaConverter {
    options: JsonSchemaOptions,
    rules: Vec<(String, String)>,
    counter: usize,
    need_value: bool,
    need_string: bool,
    need_number: bool,
    need_integer: bool,
}

impl SchemaConverter {
    fn new(options: JsonSchemaOptions) -> Self {
        Self {
            options,
            rules: Vec::new(),
            counter: 0,
            need_value: false,
            need_string: false,
            need_number: false,
            need_integer: false,
        }
    }

    fn fresh_name(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }

    fn add_rule(&mut self, name: String, body: String) -> String {
        self.rules.push((name.clone(), body));
        name
    }

    /// Reference to the inter-token whitespace rule.
    fn ws(&self) -> &'static str {
        "ws"
    }

    fn any_value(&mut self) -> String {
        self.need_value = true;
        self.need_string = true;
        self.need_number = true;
        "json_value".to_string()
    }

    fn string_value(&mut self) -> String {
        self.need_string = true;
        "json_string".to_string()
    }

    fn visit(&mut self, schema: &Value, hint: &str) -> Result<String> {
        match schema {
            Value::Bool(true) => Ok(self.any_value()),
            Value::Bool(false) => bail!("schema 'false' accepts nothing"),
            Value::Object(obj) => {
                if let Some(en) = obj.get("enum") {
                    return self.visit_enum(en);
                }
                if let Some(c) = obj.get("const") {
                    return Ok(json_value_to_ebnf_literal(c));
                }
                if let Some(any_of) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
                    return self.visit_any_of(any_of, hint);
                }
                match obj.get("type") {
                    Some(Value::String(ty)) => self.visit_typed(schema, ty, hint),
                    Some(Value::Array(types)) => {
                        let mut alts = Vec::new();
                        for ty in types {
                            let Value::String(ty) = ty else {
                                bail!("'type' list entries must be strings");
                            };
                            alts.push(self.visit_typed(schema, ty, hint)?);
                        }
                        if alts.is_empty() {
                            bail!("'type' list must not be empty");
                        }
                        Ok(format!("({})", alts.join(" | ")))
                    }
                    Some(other) => bail!("'type' must be a string or list, got {}", other),
                    None => {
                        // Untyped but with object keywords: treat as object.
                        if obj.contains_key("properties") || obj.contains_key("required") {
                            self.visit_object(schema, hint)
                        } else {
                            Ok(self.any_value())
                        }
                    }
                }
            }
            other => bail!("schema must be an object or boolean, got {}", other),
        }
    }

    fn visit_typed(&mut self, schema: &Value, ty: &str, hint: &str) -> Result<String> {
        match ty {
            "object" => self.visit_object(schema, hint),
            "array" => self.visit_array(schema, hint),
            "string" => Ok(self.string_value()),
            "integer" => {
                self.need_integer = true;
                Ok("json_integer".to_string())
            }
            "number" => {
                self.need_number = true;
                self.need_integer = true;
                Ok("json_number".to_string())
            }
            "boolean" => Ok("(\"true\" | \"false\")".to_string()),
            "null" => Ok("\"null\"".to_string()),
            other => bail!("unsupported schema type '{}'", other),
        }
    }

    fn visit_enum(&mut self, enum_val: &Value) -> Result<String> {
        let Value::Array(values) = enum_val else {
            bail!("'enum' must be an array");
        };
        if values.is_empty() {
            bail!("'enum' must not be empty");
        }
        let alts: Vec<String> = values.iter().map(json_value_to_ebnf_literal).collect();
        Ok(format!("({})", alts.join(" | ")))
    }

    fn visit_any_of(&mut self, any_of: &Value, hint: &str) -> Result<String> {
        let Value::Array(schemas) = any_of else {
            bail!("'anyOf' must be an array");
        };
        if schemas.is_empty() {
            bail!("'anyOf' must not be empty");
        }
        let mut alts = Vec::new();
        for (i, s) in schemas.iter().enumerate() {
            let sub_hint = format!("{}_alt{}", hint, i);
            alts.push(self.visit(s, &sub_hint)?);
        }
        Ok(format!("({})", alts.join(" | ")))
    }

    fn visit_object(&mut self, schema: &Value, hint: &str) -> Result<String> {
        let obj = schema.as_object().expect("checked by visit");
        let ws = self.ws();

        let required: Vec<String> = match obj.get("required") {
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|k| match k {
                    Value::String(s) => Ok(s.clone()),
                    other => bail!("'required' entries must be strings, got {}", other),
                })
                .collect::<Result<_>>()?,
            Some(other) => bail!("'required' must be an array, got {}", other),
            None => Vec::new(),
        };

        let empty = serde_json::Map::new();
        let properties = match obj.get("properties") {
            Some(Value::Object(props)) => props,
            Some(other) => bail!("'properties' must be an object, got {}", other),
            None => &empty,
        };

        // Required pairs appear first, in a fixed order.
        let mut required_pairs = Vec::new();
        for key in &required {
            let value_expr = match properties.get(key) {
                Some(prop) => {
                    let sub_hint = format!("{}_{}", hint, sanitize_rule_name(key));
                    self.visit(prop, &sub_hint)?
                }
                None => self.any_value(),
            };
            required_pairs.push(format!(
                "\"\\\"{}\\\"\" {} \":\" {} {}",
                escape_for_ebnf(key),
                ws,
                ws,
                value_expr
            ));
        }

        // Everything that may follow: optional declared properties and, when
        // additionalProperties is not false, arbitrary members.
        let mut extra_alts = Vec::new();
        for (key, prop) in properties {
            if required.contains(key) {
                continue;
            }
            let sub_hint = format!("{}_{}", hint, sanitize_rule_name(key));
            let value_expr = self.visit(prop, &sub_hint)?;
            extra_alts.push(format!(
                "\"\\\"{}\\\"\" {} \":\" {} {}",
                escape_for_ebnf(key),
                ws,
                ws,
                value_expr
            ));
        }
        let additional_allowed = !matches!(obj.get("additionalProperties"), Some(Value::Bool(false)));
        if additional_allowed {
            let value_expr = match obj.get("additionalProperties") {
                Some(ap) if ap.is_object() => {
                    let sub_hint = format!("{}_extra", hint);
                    self.visit(ap, &sub_hint)?
                }
                _ => self.any_value(),
            };
            let string_rule = self.string_value();
            extra_alts.push(format!("{} {} \":\" {} {}", string_rule, ws, ws, value_expr));
        }

        let name = self.fresh_name(&format!("{}_obj", hint));
        let body = match (required_pairs.is_empty(), extra_alts.is_empty()) {
            (true, true) => format!("\"{{\" {} \"}}\"", ws),
            (true, false) => {
                let extra = format!("({})", extra_alts.join(" | "));
                format!(
                    "\"{{\" {ws} ({extra} ({ws} \",\" {ws} {extra})*)? {ws} \"}}\"",
                    ws = ws,
                    extra = extra
                )
            }
            (false, _) => {
                let req = required_pairs.join(&format!(" {ws} \",\" {ws} ", ws = ws));
                let tail = if extra_alts.is_empty() {
                    String::new()
                } else {
                    let extra = format!("({})", extra_alts.join(" | "));
                    format!(" ({ws} \",\" {ws} {extra})*", ws = ws, extra = extra)
                };
                format!("\"{{\" {ws} {req}{tail} {ws} \"}}\"", ws = ws, req = req, tail = tail)
            }
        };
        Ok(self.add_rule(name, body))
    }

    fn visit_array(&mut self, schema: &Value, hint: &str) -> Result<String> {
        let obj = schema.as_object().expect("checked by visit");
        let ws = self.ws();

        let item_expr = match obj.get("items") {
            Some(items) => {
                let sub_hint = format!("{}_item", hint);
                self.visit(items, &sub_hint)?
            }
            None => self.any_value(),
        };

        let name = self.fresh_name(&format!("{}_arr", hint));
        let body = format!(
            "\"[\" {ws} ({item} ({ws} \",\" {ws} {item})*)? {ws} \"]\"",
            ws = ws,
            item = item_expr
        );
        Ok(self.add_rule(name, body))
    }

    /// Assemble the final EBNF text: root rule first, then schema-specific
    /// rules, then the shared JSON base rules that were actually used.
    fn finish(&self, root_expr: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("root ::= {}\n", root_expr));
        for (name, body) in &self.rules {
            out.push_str(&format!("{} ::= {}\n", name, body));
        }

        if self.options.whitespace_flexible {
            out.push_str("ws ::= [ \\t\\n\\r]*\n");
        } else {
            out.push_str("ws ::= \"\"\n");
        }

        if self.need_value {
            out.push_str(concat!(
                "json_value ::= json_object | json_array | json_string | json_number ",
                "| \"true\" | \"false\" | \"null\"\n",
                "json_object ::= \"{\" ws (json_member (ws \",\" ws json_member)*)? ws \"}\"\n",
                "json_member ::= json_string ws \":\" ws json_value\n",
                "json_array ::= \"[\" ws (json_value (ws \",\" ws json_value)*)? ws \"]\"\n",
            ));
        }
        if self.need_string || self.need_value {
            out.push_str(concat!(
                "json_string ::= \"\\\"\" json_char* \"\\\"\"\n",
                "json_char ::= [^\\x00-\\x1f\"\\\\] | \"\\\\\" json_escape\n",
                "json_escape ::= [\"\\\\/bfnrt] | \"u\" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]\n",
            ));
        }
        if self.need_number || self.need_value {
            out.push_str(concat!(
                "json_number ::= json_integer json_fraction? json_exponent?\n",
                "json_fraction ::= \".\" [0-9]+\n",
                "json_exponent ::= [eE] [+\\-]? [0-9]+\n",
            ));
        }
        if self.need_integer || self.need_number || self.need_value {
            out.push_str("json_integer ::= \"-\"? (\"0\" | [1-9] [0-9]*)\n");
        }
        out
    }
}

/// Serialize a JSON value and wrap it as an EBNF string literal.
fn json_value_to_ebnf_literal(val: &Value) -> String {
    let serialized = serde_json::to_string(val).unwrap_or_default();
    format!("\"{}\"", escape_for_ebnf(&serialized))
}

/// Escape text for inclusion in an EBNF double-quoted string.
fn escape_for_ebnf(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Make a schema key usable inside a rule name.
fn sanitize_rule_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grammar_accepts(schema: &Value, options: &JsonSchemaOptions, input: &str) -> bool {
        let grammar = json_schema_to_grammar(schema, options).unwrap();
        let vocab: Vec<String> = vec!["a".into()];
        let t = crate::tokenizer::Tokenizer::from_vocab(&vocab).unwrap();
        let c = crate::compiled::CompiledGrammar::new(&grammar, &t).unwrap();
        let mut e = crate::automaton::Engine::new(&c);
        e.advance_bytes(&c, input.as_bytes()) && e.is_accepting(&c)
    }

    #[test]
    fn test_plain_object_strict_whitespace() {
        let schema = json!({"type": "object"});
        let opts = JsonSchemaOptions {
            whitespace_flexible: false,
        };
        assert!(grammar_accepts(&schema, &opts, "{}"));
        assert!(grammar_accepts(&schema, &opts, r#"{"foo":1}"#));
        assert!(!grammar_accepts(&schema, &opts, "{ }"));
        assert!(!grammar_accepts(&schema, &opts, " {}"));
        assert!(!grammar_accepts(&schema, &opts, "{"));
    }

    #[test]
    fn test_required_property() {
        let schema = json!({
            "type": "object",
            "properties": {"foo": {"type": "integer"}},
            "required": ["foo"]
        });
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, r#"{"foo":1}"#));
        assert!(grammar_accepts(&schema, &opts, r#"{"foo":1,"bar":2}"#));
        assert!(grammar_accepts(&schema, &opts, r#"{ "foo" : 1 }"#));
        assert!(!grammar_accepts(&schema, &opts, "{}"));
        assert!(!grammar_accepts(&schema, &opts, r#" {"foo":1}"#));
        assert!(!grammar_accepts(&schema, &opts, r#"{"bar":1}"#));
    }

    #[test]
    fn test_required_without_property_schema() {
        let schema = json!({"type": "object", "required": ["foo"]});
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, r#"{"foo":1}"#));
        assert!(grammar_accepts(&schema, &opts, r#"{"foo":"x"}"#));
        assert!(grammar_accepts(&schema, &opts, r#"{"foo":[1,2]}"#));
        assert!(!grammar_accepts(&schema, &opts, "{}"));
    }

    #[test]
    fn test_additional_properties_false() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "required": ["a"],
            "additionalProperties": false
        });
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, r#"{"a":1}"#));
        assert!(!grammar_accepts(&schema, &opts, r#"{"a":1,"b":2}"#));
    }

    #[test]
    fn test_string_and_escapes() {
        let schema = json!({"type": "string"});
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, r#""hello""#));
        assert!(grammar_accepts(&schema, &opts, r#""a\nb""#));
        assert!(grammar_accepts(&schema, &opts, r#""é""#));
        assert!(!grammar_accepts(&schema, &opts, r#""unterminated"#));
        assert!(!grammar_accepts(&schema, &opts, "hello"));
    }

    #[test]
    fn test_numbers() {
        let schema = json!({"type": "number"});
        let opts = JsonSchemaOptions::default();
        for ok in ["0", "-1", "42", "3.25", "1e9", "-2.5E-3"] {
            assert!(grammar_accepts(&schema, &opts, ok), "should accept {}", ok);
        }
        for bad in ["01", "+1", ".5", "1.", "--2"] {
            assert!(!grammar_accepts(&schema, &opts, bad), "should reject {}", bad);
        }
    }

    #[test]
    fn test_integer_rejects_fraction() {
        let schema = json!({"type": "integer"});
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, "7"));
        assert!(!grammar_accepts(&schema, &opts, "7.5"));
    }

    #[test]
    fn test_enum_and_const() {
        let schema = json!({"enum": ["red", "green", 3]});
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, r#""red""#));
        assert!(grammar_accepts(&schema, &opts, "3"));
        assert!(!grammar_accepts(&schema, &opts, r#""blue""#));

        let schema = json!({"const": {"a": 1}});
        assert!(grammar_accepts(&schema, &opts, r#"{"a":1}"#));
        assert!(!grammar_accepts(&schema, &opts, r#"{"a":2}"#));
    }

    #[test]
    fn test_array_of_integers() {
        let schema = json!({"type": "array", "items": {"type": "integer"}});
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, "[]"));
        assert!(grammar_accepts(&schema, &opts, "[1,2,3]"));
        assert!(grammar_accepts(&schema, &opts, "[ 1 , 2 ]"));
        assert!(!grammar_accepts(&schema, &opts, r#"[1,"x"]"#));
    }

    #[test]
    fn test_any_of() {
        let schema = json!({"anyOf": [{"type": "integer"}, {"type": "string"}]});
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, "5"));
        assert!(grammar_accepts(&schema, &opts, r#""five""#));
        assert!(!grammar_accepts(&schema, &opts, "[]"));
    }

    #[test]
    fn test_nested_object() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["name"]
        });
        let opts = JsonSchemaOptions::default();
        assert!(grammar_accepts(&schema, &opts, r#"{"name":"x"}"#));
        assert!(grammar_accepts(&schema, &opts, r#"{"name":"x","tags":["a","b"]}"#));
        assert!(!grammar_accepts(&schema, &opts, r#"{"tags":[]}"#));
    }

    #[test]
    fn test_invalid_schema_errors() {
        let opts = JsonSchemaOptions::default();
        assert!(json_schema_to_grammar(&json!("string"), &opts).is_err());
        assert!(json_schema_to_grammar(&json!({"type": "frob"}), &opts).is_err());
        assert!(json_schema_to_grammar(&json!({"enum": []}), &opts).is_err());
        assert!(json_schema_to_grammar(&json!(false), &opts).is_err());
    }
}
