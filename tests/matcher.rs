//! Matcher behavior over a byte-level tokenizer: masks, stopping conditions,
//! rollback, fast-forward, and the error-message contract.

use std::sync::Arc;

use tokenmask::{GrammarSpec, Matcher, StopReason, TokenId, Tokenizer};

fn tokenizer() -> Arc<Tokenizer> {
    Arc::new(Tokenizer::byte_level())
}

fn matcher(grm: &str) -> Matcher {
    Matcher::new(tokenizer(), &GrammarSpec::from_lark(grm), 1).unwrap()
}

fn regex_matcher(pattern: &str) -> Matcher {
    Matcher::new(tokenizer(), &GrammarSpec::from_regex(pattern), 1).unwrap()
}

/// Walk a string through a fresh matcher token by token, checking the mask
/// and validation agree at every step. `FINAL_REJECT:` prefixes mark inputs
/// whose every token is accepted but whose end state must not accept.
fn check_one_grammar(grm: &str, s: &str, passing: bool) {
    let mut m = matcher(grm);
    let (final_reject, s) = match s.strip_prefix("FINAL_REJECT:") {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let tokens = m.tokenizer().tokenize_str(s);
    for (i, &t) in tokens.iter().enumerate() {
        let rest = &tokens[i..];
        let valid = m.validate_tokens(rest);
        if passing || final_reject {
            assert_eq!(valid, rest.len(), "validate_tokens at step {} of {:?}", i, s);
        } else {
            assert!(valid < rest.len(), "validate_tokens at step {} of {:?}", i, s);
        }
        let bias = m.compute_logit_bias();
        if bias[t as usize] == 0 {
            assert!(
                !(passing || final_reject),
                "token {} unexpectedly masked in {:?}",
                t,
                s
            );
            return;
        }
        assert_eq!(bias[t as usize], 200);
        assert!(m.consume_token(t));
    }
    if final_reject {
        assert!(!m.is_accepting(), "expected final rejection of {:?}", s);
        return;
    }
    assert!(passing, "expected {:?} to fail before the end", s);
    assert!(m.is_accepting());
    assert!(!m.is_error());
}

fn check_grammar(grm: &str, passing: &[&str], failing: &[&str]) {
    for s in passing {
        check_one_grammar(grm, s, true);
    }
    for s in failing {
        check_one_grammar(grm, s, false);
    }
}

/// Consume tokens one at a time, asserting mask membership and running
/// status before each commit.
fn consume_tokens(m: &mut Matcher, tokens: &[TokenId]) {
    assert_eq!(m.stop_reason(), StopReason::NotStopped);
    assert!(!m.is_stopped());
    assert!(!m.is_accepting());
    for &t in tokens {
        let bias = m.compute_logit_bias();
        assert_eq!(bias[t as usize], 200, "token should be in mask");
        let bits = m.compute_bitmask();
        assert!(
            bits[t as usize / 8] & (1 << (t % 8)) != 0,
            "token should be in bitmask"
        );
        assert_eq!(m.stop_reason(), StopReason::NotStopped);
        assert!(!m.is_stopped());
        assert!(!m.is_accepting());
        assert!(m.consume_token(t));
    }
    assert!(!m.is_error());
}

#[test]
fn test_regex_grammar() {
    let g = GrammarSpec::from_regex(r"\d+");
    let mut m = Matcher::new(tokenizer(), &g, 0).unwrap();
    assert!(m.consume_tokens(&m.tokenizer().tokenize_str("123")));
    assert!(m.is_accepting());

    check_grammar(r"start: /\d+/", &["123", "456"], &["abc", "1a2"]);
}

#[test]
fn test_lark_multibyte_characters() {
    // Multi-byte characters count as single grammar positions; a token mask
    // must never split an emoji into an invalid partial sequence.
    check_grammar(
        r#"start: /.../ "abc" /.../"#,
        &["abcabcabc", "aaaabcccc", "🔵🟠✅abc❌🟠🔵"],
        &[
            "aaabcccc",
            "aaaaabcccc",
            "FINAL_REJECT:aaaabccc",
            "aaaabccccc",
            "🔵🟠✅❌abc❌✅🟠🔵",
            "🔵🟠abc🟠🔵",
        ],
    );
}

#[test]
fn test_lark_syntax_error_names_rule() {
    let err = Matcher::new(
        tokenizer(),
        &GrammarSpec::from_lark("start: /.../ no_such_rule"),
        0,
    )
    .unwrap_err();
    assert!(err.to_string().contains("no_such_rule"), "got: {}", err);
}

#[test]
fn test_stopping_conditions() {
    let mut m = matcher("start: /[aA][bB][cC]/");
    let toks = m.tokenizer().tokenize_str("abc");
    consume_tokens(&mut m, &toks);
    assert!(m.is_accepting());
    assert!(m.is_stopped());
    assert_eq!(m.stop_reason(), StopReason::NoExtension);
    assert_eq!(m.stop_reason().to_string(), "NoExtension");
}

#[test]
fn test_rollback() {
    let mut m = matcher("start: /[aA] [bB] [cC] [dD] [eE]/");
    let m2 = m.deep_copy();
    let t = m.tokenizer().tokenize_str("a b c d e");
    assert_eq!(t.len(), 9);

    consume_tokens(&mut m, &t[0..3]);
    assert!(!m.is_stopped() && !m.is_accepting());
    assert!(m.rollback(2));
    let m3 = m.deep_copy();
    consume_tokens(&mut m, &t[1..]);
    assert!(m.is_stopped() && m.is_accepting());
    assert!(!m.is_error());

    assert!(m.rollback(1));
    assert!(!m.is_accepting() && !m.is_stopped());
    assert_eq!(m.stop_reason(), StopReason::NotStopped);
    consume_tokens(&mut m, &t[t.len() - 1..]);
    assert!(m.is_stopped() && m.is_accepting());
    assert!(!m.is_error());

    // An accepting matcher admits eos; consuming it is not an error.
    let bias = m.compute_logit_bias();
    let eos = m.tokenizer().eos_token();
    assert_eq!(bias[eos as usize], 200);
    assert!(m.consume_token(eos));
    assert!(!m.is_error());

    // The pristine copy replays the whole sequence identically.
    let mut m2 = m2;
    consume_tokens(&mut m2, &t);
    assert!(m2.is_stopped() && m2.is_accepting() && !m2.is_error());

    // The mid-rollback copy finishes from its own point.
    let mut m3 = m3;
    assert!(m3.consume_tokens(&t[1..]));
    assert!(m3.is_stopped() && m3.is_accepting() && !m3.is_error());
}

#[test]
fn test_rollback_recommit_is_deterministic() {
    let mut reference = matcher("start: /[a-z]{2,8}!/");
    let mut m = matcher("start: /[a-z]{2,8}!/");
    let t = reference.tokenizer().tokenize_str("hello");
    assert!(reference.consume_tokens(&t));
    assert!(m.consume_tokens(&t));

    // Roll back and recommit the tail; every observable must match a
    // matcher that never rolled back.
    assert!(m.rollback(3));
    assert!(m.consume_tokens(&t[2..]));
    assert_eq!(m.compute_bitmask(), reference.compute_bitmask());
    assert_eq!(m.is_accepting(), reference.is_accepting());
    assert_eq!(m.is_stopped(), reference.is_stopped());
    assert_eq!(m.history_len(), reference.history_len());

    // Rolling back to the same depth twice lands in the same state.
    let mut a = m.deep_copy();
    let mut b = m.deep_copy();
    assert!(a.rollback(2));
    assert!(b.rollback(1));
    assert!(b.rollback(1));
    assert_eq!(a.compute_bitmask(), b.compute_bitmask());
    assert_eq!(a.history_len(), b.history_len());
}

fn check_ff(m: &mut Matcher, expected: &str) {
    assert_eq!(m.compute_ff_bytes(), expected.as_bytes(), "ff bytes mismatch");
    assert_eq!(
        m.compute_ff_tokens(),
        m.tokenizer().tokenize_str(expected),
        "ff tokens mismatch"
    );
}

#[test]
fn test_fast_forward() {
    let mut m = matcher("start: /(foo[12]23|bar)/");
    let toks = m.tokenizer().tokenize_str("foo123");
    assert_eq!(toks.len(), 6);

    check_ff(&mut m, "");
    consume_tokens(&mut m, &toks[0..1]);
    check_ff(&mut m, "oo");
    consume_tokens(&mut m, &toks[1..2]);
    check_ff(&mut m, "o");
    consume_tokens(&mut m, &toks[2..3]);
    check_ff(&mut m, "");
    consume_tokens(&mut m, &toks[3..4]);
    check_ff(&mut m, "23");
    consume_tokens(&mut m, &toks[4..]);
    assert!(m.is_accepting());
    assert!(m.is_stopped());
    assert_eq!(m.stop_reason(), StopReason::NoExtension);
    assert!(m.compute_ff_bytes().is_empty());
    assert!(m.compute_ff_tokens().is_empty());
    assert!(!m.is_error());
}

#[test]
fn test_try_consume_tokens() {
    let mut m = matcher("start: /(foo[12]23|bar)/");
    let tokens = m.tokenizer().tokenize_str("foo723");
    assert_eq!(tokens.len(), 6);
    assert_eq!(m.try_consume_tokens(&tokens), 3);
    assert!(!m.is_error());
    let rest = m.tokenizer().tokenize_str("123");
    consume_tokens(&mut m, &rest);
    assert!(m.is_stopped() && m.is_accepting() && !m.is_error());
}

#[test]
fn test_consume_token_error() {
    let m0 = matcher("start: /(foo[12]23|bar)/");
    let mut m = m0.deep_copy();
    let mut m2 = m0.deep_copy();
    let mut m3 = m0.deep_copy();
    let mut m4 = m0.deep_copy();
    let tokens = m0.tokenizer().tokenize_str("foo723");
    let vocab_size = m0.vocab_size() as TokenId;

    consume_tokens(&mut m, &tokens[0..3]);
    let bias = m.compute_logit_bias();
    assert_eq!(bias[tokens[3] as usize], 0);
    assert!(!m.consume_token(tokens[3]));
    assert!(m.is_error());
    assert!(m.get_error().unwrap().contains("doesn't satisfy the grammar"));
    // The token was not in the mask: a caller-side logic error.
    assert_eq!(m.stop_reason(), StopReason::InternalError);

    consume_tokens(&mut m2, &tokens[0..3]);
    assert!(!m2.consume_token(vocab_size + 100));
    assert!(m2.is_error());
    assert!(m2.get_error().unwrap().contains("out of range"));

    let mut batch = tokens[0..3].to_vec();
    batch.push(vocab_size + 100);
    assert!(!m3.consume_tokens(&batch));
    assert!(m3.is_error());
    assert!(m3.get_error().unwrap().contains("out of range"));

    // validate_tokens flags out-of-range ids on both channels.
    let n = m4.validate_tokens(&batch);
    assert_eq!(n, 0);
    assert!(m4.is_error());
    assert!(m4.get_error().unwrap().contains("out of range"));
}

#[test]
fn test_bitmask_validate_agreement() {
    let mut m = matcher("start: /(foo[12]23|bar)/");
    let steps = m.tokenizer().tokenize_str("foo1");
    for step in 0..=steps.len() {
        let words = m.compute_mask_words();
        for t in 0..m.vocab_size() as TokenId {
            let in_mask = words[t as usize / 32] & (1 << (t % 32)) != 0;
            let valid = m.validate_tokens(&[t]) == 1;
            assert_eq!(in_mask, valid, "token {} at step {}", t, step);
        }
        if step < steps.len() {
            assert!(m.consume_token(steps[step]));
        }
    }
}

#[test]
fn test_deep_copy_is_independent() {
    let mut m = matcher("start: /[ab]{4}/");
    let t = m.tokenizer().tokenize_str("ab");
    assert!(m.consume_tokens(&t));

    let mut copy = m.deep_copy();
    let before_mask = m.compute_bitmask();
    let before_len = m.history_len();

    assert!(copy.consume_tokens(&t));
    assert!(copy.is_stopped());
    assert_eq!(m.compute_bitmask(), before_mask);
    assert_eq!(m.history_len(), before_len);
    assert!(!m.is_stopped());

    // And mutating the original does not touch the copy.
    assert!(m.rollback(1));
    assert_eq!(copy.history_len(), 4);
    assert!(copy.is_stopped());
}

#[test]
fn test_grammar_bundle_accepts_any_alternative() {
    let spec = GrammarSpec {
        grammars: vec![
            tokenmask::GrammarSource::Regex("[0-9]+".to_string()),
            tokenmask::GrammarSource::Lark("start: \"yes\" | \"no\"".to_string()),
        ],
    };
    let mut m = Matcher::new(tokenizer(), &spec, 0).unwrap();
    assert!(m.consume_tokens(&m.tokenizer().tokenize_str("42")));
    assert!(m.is_accepting());

    let mut m2 = Matcher::new(tokenizer(), &spec, 0).unwrap();
    assert!(m2.consume_tokens(&m2.tokenizer().tokenize_str("yes")));
    assert!(m2.is_accepting());

    let mut m3 = Matcher::new(tokenizer(), &spec, 0).unwrap();
    assert_eq!(m3.try_consume_tokens(&m3.tokenizer().tokenize_str("maybe")), 0);
}

#[test]
fn test_slices_do_not_change_tokenization() {
    let t = tokenizer();
    let gen_slices = Tokenizer::general_slices();
    assert!(!gen_slices.is_empty());
    let json_slices = Tokenizer::json_slices();
    assert!(!json_slices.is_empty());
    let t2 = t.with_slices(json_slices);
    assert_eq!(t.tokenize_str("Hello, world!"), t2.tokenize_str("Hello, world!"));
}
