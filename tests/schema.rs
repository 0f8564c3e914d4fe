//! JSON-Schema-derived grammars driven through the matcher, token by token.

use std::sync::Arc;

use serde_json::json;
use tokenmask::{GrammarSpec, JsonSchemaOptions, Matcher, Tokenizer};

fn tokenizer() -> Arc<Tokenizer> {
    Arc::new(Tokenizer::byte_level())
}

fn schema_matcher(schema: serde_json::Value, options: JsonSchemaOptions) -> Matcher {
    Matcher::new(
        tokenizer(),
        &GrammarSpec::from_json_schema(schema, options),
        0,
    )
    .unwrap()
}

fn check_one(mut m: Matcher, s: &str, passing: bool) {
    let (final_reject, s) = match s.strip_prefix("FINAL_REJECT:") {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let tokens = m.tokenizer().tokenize_str(s);
    for (i, &t) in tokens.iter().enumerate() {
        let rest = &tokens[i..];
        let valid = m.validate_tokens(rest);
        if passing || final_reject {
            assert_eq!(valid, rest.len(), "validate at step {} of {:?}", i, s);
        } else {
            assert!(valid < rest.len(), "validate at step {} of {:?}", i, s);
        }
        let bias = m.compute_logit_bias();
        if bias[t as usize] == 0 {
            assert!(!(passing || final_reject), "token masked early in {:?}", s);
            return;
        }
        assert!(m.consume_token(t));
    }
    if final_reject {
        assert!(!m.is_accepting(), "expected final rejection of {:?}", s);
        return;
    }
    assert!(passing, "expected {:?} to fail before the end", s);
    assert!(m.is_accepting());
}

fn check_schema(
    schema: serde_json::Value,
    options: JsonSchemaOptions,
    passing: &[&str],
    failing: &[&str],
) {
    for s in passing {
        check_one(schema_matcher(schema.clone(), options.clone()), s, true);
    }
    for s in failing {
        check_one(schema_matcher(schema.clone(), options.clone()), s, false);
    }
}

#[test]
fn test_plain_object_strict_whitespace() {
    check_schema(
        json!({"type": "object"}),
        JsonSchemaOptions {
            whitespace_flexible: false,
        },
        &["{}", r#"{"foo":1}"#],
        &["FINAL_REJECT:{", " {}", "{ }"],
    );
}

#[test]
fn test_required_integer_property() {
    check_schema(
        json!({
            "type": "object",
            "properties": {"foo": {"type": "integer"}},
            "required": ["foo"]
        }),
        JsonSchemaOptions::default(),
        &[r#"{"foo":1}"#, r#"{"foo":1,"bar":2}"#, r#"{ "foo" : 1 }"#],
        &["{}", "FINAL_REJECT:{", r#" {"foo":1}"#, r#"{"bar":1}"#],
    );
}

#[test]
fn test_required_key_without_schema_accepts_any_value() {
    let schema = json!({"type": "object", "required": ["foo"]});
    check_schema(
        schema,
        JsonSchemaOptions::default(),
        &[r#"{"foo":1}"#, r#"{ "foo" : 1 }"#, r#"{"foo":{"x":[]}}"#],
        &["{}", r#" {"foo":1}"#],
    );
}

#[test]
fn test_string_array_roundtrip() {
    check_schema(
        json!({"type": "array", "items": {"type": "string"}}),
        JsonSchemaOptions::default(),
        &["[]", r#"["a"]"#, r#"[ "a" , "b" ]"#],
        &[r#"[1]"#, "FINAL_REJECT:[\"a\"", r#"["a",]"#],
    );
}

#[test]
fn test_first_mask_of_object_schema() {
    // At the start of any object schema only "{" can begin the document.
    let mut m = schema_matcher(json!({"type": "object"}), JsonSchemaOptions::default());
    let bias = m.compute_logit_bias();
    assert_eq!(bias[b'{' as usize], 200);
    assert_eq!(bias[b' ' as usize], 0); // no leading whitespace
    assert_eq!(bias[b'}' as usize], 0);
    assert_eq!(bias[b'"' as usize], 0);
}

#[test]
fn test_schema_driven_decode_loop() {
    // Greedy decode: always pick the first admitted token; the grammar
    // forces valid JSON for the schema.
    let mut m = schema_matcher(
        json!({
            "type": "object",
            "properties": {"ok": {"type": "boolean"}},
            "required": ["ok"],
            "additionalProperties": false
        }),
        JsonSchemaOptions {
            whitespace_flexible: false,
        },
    );

    let mut out = Vec::new();
    let eos = m.tokenizer().eos_token();
    for _ in 0..64 {
        // Fast-forward forced stretches without sampling.
        let ff = m.compute_ff_tokens();
        if !ff.is_empty() {
            for &t in &ff {
                out.push(t);
                assert!(m.consume_token(t));
            }
            continue;
        }
        let bias = m.compute_logit_bias();
        let Some(t) = bias.iter().position(|&b| b == 200) else {
            break;
        };
        let t = t as u32;
        if t == eos {
            break;
        }
        out.push(t);
        assert!(m.consume_token(t));
        if m.is_stopped() {
            break;
        }
    }

    let text = m.tokenizer().decode_str(&out);
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(parsed.get("ok").is_some_and(|v| v.is_boolean()));
}

#[test]
fn test_malformed_schema_fails_construction() {
    let err = Matcher::new(
        tokenizer(),
        &GrammarSpec::from_json_schema(json!({"type": "gadget"}), JsonSchemaOptions::default()),
        0,
    )
    .unwrap_err();
    assert!(err.to_string().contains("gadget"), "got: {}", err);
}
