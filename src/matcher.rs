//! Runtime matcher: per-sequence grammar enforcement.
//!
//! A [`Matcher`] wraps one grammar automaton instance with token-level state:
//! committed-token history (for rollback), stop status, and a sticky error
//! channel. It derives per-step token masks, commits sampled tokens, and
//! exposes fast-forward (forced) byte/token runs.
//!
//! Errors are recoverable but sticky: a rejected or out-of-range token parks
//! the matcher in an error state that only [`Matcher::rollback`] (to a
//! reachable depth) or [`Matcher::reset`] clears. The engine itself is never
//! corrupted by a rejected token — failed advances undo themselves — which is
//! what makes revival possible.

use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::TokenId;
use crate::automaton::Engine;
use crate::bitmask::{self, TokenBitmask};
use crate::compiled::CompiledGrammar;
use crate::grammar::GrammarSpec;
use crate::tokenizer::Tokenizer;

/// Why a matcher can accept no further tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Still running.
    NotStopped,
    /// No byte can ever be accepted again; the grammar is exhausted.
    NoExtension,
    /// The end-of-sequence token was accepted.
    EndOfSequence,
    /// The matcher hit an error (a token the caller should have masked out,
    /// or an invalid operation).
    InternalError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::NotStopped => "NotStopped",
            StopReason::NoExtension => "NoExtension",
            StopReason::EndOfSequence => "EndOfSequence",
            StopReason::InternalError => "InternalError",
        };
        f.write_str(s)
    }
}

/// Marker value for allowed tokens in [`Matcher::compute_logit_bias`].
const ALLOWED_BIAS: u8 = 200;

/// One committed history entry. `token` is `None` for spliced strings
/// ([`Matcher::accept_string`]); `byte_len` is 0 for the eos token.
#[derive(Debug, Clone, Copy)]
struct Committed {
    token: Option<TokenId>,
    byte_len: usize,
}

/// Outcome of attempting to commit one token.
enum Commit {
    Accepted,
    Rejected,
    OutOfRange,
}

/// Stateful per-sequence grammar enforcer.
#[derive(Clone)]
pub struct Matcher {
    compiled: Arc<CompiledGrammar>,
    tokenizer: Arc<Tokenizer>,
    engine: Engine,
    history: Vec<Committed>,
    stop: StopReason,
    error: Option<String>,
    /// Accepting flag frozen at the moment the error was recorded.
    accepting_at_error: bool,
    log_level: u32,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("stop", &self.stop)
            .field("error", &self.error)
            .field("accepting_at_error", &self.accepting_at_error)
            .field("history_len", &self.history.len())
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl Matcher {
    /// Compile `spec` against `tokenizer` and build a fresh matcher.
    ///
    /// `log_level` gates construction and commit diagnostics:
    /// 0 = silent, 1 = warnings, 2+ = debug traces.
    pub fn new(tokenizer: Arc<Tokenizer>, spec: &GrammarSpec, log_level: u32) -> Result<Matcher> {
        let grammar = spec.compile()?;
        let compiled = Arc::new(CompiledGrammar::new(&grammar, &tokenizer)?);
        Self::with_compiled(compiled, tokenizer, log_level)
    }

    /// Build a matcher from a pre-compiled grammar (compile once, share
    /// across a batch of matchers).
    pub fn with_compiled(
        compiled: Arc<CompiledGrammar>,
        tokenizer: Arc<Tokenizer>,
        log_level: u32,
    ) -> Result<Matcher> {
        if compiled.vocab_size != tokenizer.vocab_size() {
            bail!(
                "compiled grammar was built for vocab size {}, tokenizer has {}",
                compiled.vocab_size,
                tokenizer.vocab_size()
            );
        }
        if log_level >= 2 {
            tracing::debug!(vocab = tokenizer.vocab_size(), "matcher created");
        }
        let engine = Engine::new(&compiled);
        Ok(Matcher {
            compiled,
            tokenizer,
            engine,
            history: Vec::new(),
            stop: StopReason::NotStopped,
            error: None,
            accepting_at_error: false,
            log_level,
        })
    }

    // ── Status ──────────────────────────────────────────────────────

    pub fn stop_reason(&self) -> StopReason {
        if self.error.is_some() {
            StopReason::InternalError
        } else {
            self.stop
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason() != StopReason::NotStopped
    }

    /// Whether the grammar is satisfiable at the current position (i.e. the
    /// eos token would be accepted). Independent of `is_stopped`: a matcher
    /// can be accepting and still extensible. Frozen while in error state.
    pub fn is_accepting(&self) -> bool {
        if self.error.is_some() {
            self.accepting_at_error
        } else {
            self.engine.is_accepting(&self.compiled)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn get_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of tokens committed since creation or the last reset.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// The committed token ids, in order. Entries spliced in via
    /// [`Matcher::accept_string`] have no token id and are skipped.
    pub fn committed_tokens(&self) -> Vec<TokenId> {
        self.history.iter().filter_map(|c| c.token).collect()
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    pub fn compiled(&self) -> &Arc<CompiledGrammar> {
        &self.compiled
    }

    fn record_error(&mut self, msg: String) {
        if self.error.is_none() {
            self.accepting_at_error = self.engine.is_accepting(&self.compiled);
            if self.log_level >= 1 {
                tracing::warn!(error = %msg, "matcher entered error state");
            }
            self.error = Some(msg);
        }
    }

    // ── Committing tokens ───────────────────────────────────────────

    fn commit_token(&mut self, token: TokenId) -> Commit {
        if token as usize >= self.tokenizer.vocab_size() {
            return Commit::OutOfRange;
        }
        if self.stop == StopReason::EndOfSequence {
            return Commit::Rejected;
        }
        if token == self.tokenizer.eos_token() {
            if self.engine.is_accepting(&self.compiled) {
                self.history.push(Committed {
                    token: Some(token),
                    byte_len: 0,
                });
                self.stop = StopReason::EndOfSequence;
                return Commit::Accepted;
            }
            return Commit::Rejected;
        }
        if self.tokenizer.is_special_token(token) {
            return Commit::Rejected;
        }
        let Some(bytes) = self.tokenizer.decode_token(token) else {
            return Commit::Rejected;
        };
        if bytes.is_empty() {
            return Commit::Rejected;
        }
        let byte_len = bytes.len();
        if !self.engine.advance_bytes(&self.compiled, bytes) {
            return Commit::Rejected;
        }
        self.history.push(Committed {
            token: Some(token),
            byte_len,
        });
        self.check_stop();
        Commit::Accepted
    }

    /// Stop with `NoExtension` once no byte can ever be accepted again.
    fn check_stop(&mut self) {
        if !self.engine.has_live_points(&self.compiled) {
            self.stop = StopReason::NoExtension;
        }
    }

    /// Commit one sampled token. Returns false and enters the error state if
    /// the token is out of range or not accepted by the grammar.
    pub fn consume_token(&mut self, token: TokenId) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.commit_token(token) {
            Commit::Accepted => true,
            Commit::OutOfRange => {
                let msg = format!(
                    "token {} out of range (vocab size {})",
                    token,
                    self.tokenizer.vocab_size()
                );
                self.record_error(msg);
                false
            }
            Commit::Rejected => {
                self.record_error(format!("token {} doesn't satisfy the grammar", token));
                false
            }
        }
    }

    /// Commit tokens in order; stops at the first failure with the same
    /// error semantics as [`Matcher::consume_token`].
    pub fn consume_tokens(&mut self, tokens: &[TokenId]) -> bool {
        for &t in tokens {
            if !self.consume_token(t) {
                return false;
            }
        }
        true
    }

    /// Commit as many leading tokens as the grammar accepts and return the
    /// count. A grammar rejection is not an error: the matcher stays running
    /// with exactly the accepted prefix applied. Out-of-range ids still
    /// error.
    pub fn try_consume_tokens(&mut self, tokens: &[TokenId]) -> usize {
        if self.error.is_some() {
            return 0;
        }
        for (i, &t) in tokens.iter().enumerate() {
            match self.commit_token(t) {
                Commit::Accepted => {}
                Commit::Rejected => return i,
                Commit::OutOfRange => {
                    let msg = format!(
                        "token {} out of range (vocab size {})",
                        t,
                        self.tokenizer.vocab_size()
                    );
                    self.record_error(msg);
                    return i;
                }
            }
        }
        tokens.len()
    }

    /// Pure query: how many leading tokens would be accepted in sequence,
    /// committing nothing. An accepted eos terminates the count. An
    /// out-of-range id returns 0 *and* sets the sticky error flag — both
    /// channels are part of the contract.
    pub fn validate_tokens(&mut self, tokens: &[TokenId]) -> usize {
        if self.error.is_some() {
            return 0;
        }
        let saved_stop = self.stop;
        let eos = self.tokenizer.eos_token();

        let mut count = 0usize;
        let mut committed = 0usize;
        let mut out_of_range: Option<TokenId> = None;

        for &t in tokens {
            match self.commit_token(t) {
                Commit::Accepted => {
                    count += 1;
                    committed += 1;
                    if t == eos {
                        break;
                    }
                }
                Commit::Rejected => break,
                Commit::OutOfRange => {
                    out_of_range = Some(t);
                    break;
                }
            }
        }

        // Undo everything this query committed.
        for _ in 0..committed {
            let rec = self.history.pop().expect("committed entries were pushed");
            if rec.byte_len > 0 {
                self.engine.rollback_unit(rec.byte_len);
            }
        }
        self.stop = saved_stop;

        if let Some(t) = out_of_range {
            let msg = format!(
                "token {} out of range (vocab size {})",
                t,
                self.tokenizer.vocab_size()
            );
            self.record_error(msg);
            return 0;
        }
        count
    }

    /// Splice a literal string into the parse (one history entry).
    /// Returns false without entering the error state if the grammar rejects
    /// it.
    pub fn accept_string(&mut self, s: &str) -> bool {
        if self.error.is_some() || self.stop != StopReason::NotStopped {
            return false;
        }
        if s.is_empty() {
            return true;
        }
        if !self.engine.advance_bytes(&self.compiled, s.as_bytes()) {
            return false;
        }
        self.history.push(Committed {
            token: None,
            byte_len: s.len(),
        });
        self.check_stop();
        true
    }

    // ── Rollback / copy / reset ─────────────────────────────────────

    /// Undo the last `num_tokens` committed entries. Valid iff
    /// `num_tokens <= history_len()`; restores the automaton to exactly the
    /// historical state and clears error and stop status.
    pub fn rollback(&mut self, num_tokens: usize) -> bool {
        if num_tokens > self.history.len() {
            let msg = format!(
                "cannot roll back {} tokens, history has {}",
                num_tokens,
                self.history.len()
            );
            self.record_error(msg);
            return false;
        }
        for _ in 0..num_tokens {
            let rec = self.history.pop().expect("bounded by history length");
            if rec.byte_len > 0 {
                self.engine.rollback_unit(rec.byte_len);
            }
        }
        self.stop = StopReason::NotStopped;
        self.error = None;
        self.accepting_at_error = false;
        true
    }

    /// An independent copy: same history, status, and automaton state, with
    /// no shared mutable storage. (The compiled grammar and tokenizer are
    /// immutable and stay shared.)
    pub fn deep_copy(&self) -> Matcher {
        self.clone()
    }

    /// Back to the freshly-constructed state.
    pub fn reset(&mut self) {
        self.engine.reset(&self.compiled);
        self.history.clear();
        self.stop = StopReason::NotStopped;
        self.error = None;
        self.accepting_at_error = false;
    }

    // ── Masks ───────────────────────────────────────────────────────

    pub(crate) fn words_per_row(&self) -> usize {
        bitmask::mask_words(self.tokenizer.vocab_size())
    }

    /// Fill one mask row with the acceptable-token set. A stopped or errored
    /// matcher admits only the eos token.
    pub(crate) fn fill_mask_into(&mut self, row: &mut [u32]) {
        bitmask::clear_mask(row);
        let eos = self.tokenizer.eos_token() as usize;
        if self.error.is_some() || self.stop != StopReason::NotStopped {
            bitmask::set_bit(row, eos);
            return;
        }
        self.engine.fill_mask(&self.compiled, &self.tokenizer, row);
        if self.engine.is_accepting(&self.compiled) {
            bitmask::set_bit(row, eos);
        }
    }

    /// The acceptable-token set as mask words.
    pub fn compute_mask_words(&mut self) -> Vec<u32> {
        let mut words = vec![0u32; self.words_per_row()];
        self.fill_mask_into(&mut words);
        words
    }

    /// Packed bitmask bytes: bit `t` is byte `t/8`, bit position `t%8`.
    pub fn compute_bitmask(&mut self) -> Vec<u8> {
        bitmask::to_le_bytes(&self.compute_mask_words())
    }

    /// Dense per-token bias vector: allowed tokens get the marker value 200,
    /// everything else 0.
    pub fn compute_logit_bias(&mut self) -> Vec<u8> {
        let words = self.compute_mask_words();
        let mut bias = vec![0u8; self.tokenizer.vocab_size()];
        for (i, b) in bias.iter_mut().enumerate() {
            if bitmask::get_bit(&words, i) {
                *b = ALLOWED_BIAS;
            }
        }
        bias
    }

    /// Checked mask write: fill row `row` of `buf`.
    pub fn fill_next_token_bitmask(&mut self, buf: &mut TokenBitmask, row: usize) -> Result<()> {
        if buf.words_per_row() != self.words_per_row() {
            bail!(
                "Invalid buffer size: {} words per row, matcher needs {}",
                buf.words_per_row(),
                self.words_per_row()
            );
        }
        let row = buf.row_mut(row)?;
        self.fill_mask_into(row);
        Ok(())
    }

    /// Raw mask write for externally managed memory.
    ///
    /// Validates that `dst` is non-null, aligned for `u32`, and that
    /// `dst_bytes` is exactly one row (`words_per_row * 4`) before writing.
    ///
    /// # Safety
    /// `dst` must point to `dst_bytes` of writable memory not aliased by any
    /// live Rust reference for the duration of the call.
    pub unsafe fn unsafe_compute_mask_ptr(&mut self, dst: *mut u32, dst_bytes: usize) -> Result<()> {
        validate_mask_ptr(dst, dst_bytes, self.words_per_row())?;
        let row = unsafe { std::slice::from_raw_parts_mut(dst, dst_bytes / 4) };
        self.fill_mask_into(row);
        Ok(())
    }

    // ── Fast-forward ────────────────────────────────────────────────

    /// The longest byte run the grammar forces before the next branching
    /// point. Empty when more than one next byte is possible, when the
    /// grammar is accepting, or when the matcher is stopped/errored.
    pub fn compute_ff_bytes(&mut self) -> Vec<u8> {
        if self.error.is_some() || self.stop != StopReason::NotStopped {
            return Vec::new();
        }
        self.engine.forced_bytes(&self.compiled)
    }

    /// The forced byte run as tokens, tokenized with this matcher's
    /// tokenizer; equals `tokenize(compute_ff_bytes())` exactly.
    pub fn compute_ff_tokens(&mut self) -> Vec<TokenId> {
        let bytes = self.compute_ff_bytes();
        if bytes.is_empty() {
            return Vec::new();
        }
        self.tokenizer.tokenize_bytes(&bytes).unwrap_or_default()
    }
}

/// Validate a raw one-row mask destination before any write.
pub(crate) fn validate_mask_ptr(ptr: *mut u32, len_bytes: usize, words_per_row: usize) -> Result<()> {
    if ptr.is_null() {
        bail!("Null pointer");
    }
    if (ptr as usize) % std::mem::align_of::<u32>() != 0 {
        bail!("Pointer not aligned");
    }
    if len_bytes != words_per_row * 4 {
        bail!(
            "Invalid buffer size: expected {} bytes, got {}",
            words_per_row * 4,
            len_bytes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_matcher(lark: &str) -> Matcher {
        let tokenizer = Arc::new(Tokenizer::byte_level());
        Matcher::new(tokenizer, &GrammarSpec::from_lark(lark), 0).unwrap()
    }

    fn tok(m: &Matcher, s: &str) -> Vec<TokenId> {
        m.tokenizer().tokenize_str(s)
    }

    #[test]
    fn test_consume_and_accept() {
        let mut m = byte_matcher("start: \"ab\"");
        let t = tok(&m, "ab");
        assert!(m.consume_tokens(&t));
        assert!(m.is_accepting());
        assert_eq!(m.history_len(), 2);
        assert_eq!(m.stop_reason(), StopReason::NoExtension);
    }

    #[test]
    fn test_grammar_violation_is_internal_error() {
        let mut m = byte_matcher("start: \"ab\"");
        let t = tok(&m, "x");
        assert!(!m.consume_token(t[0]));
        assert!(m.is_error());
        assert!(m.get_error().unwrap().contains("doesn't satisfy the grammar"));
        assert_eq!(m.stop_reason(), StopReason::InternalError);
        assert!(m.is_stopped());
    }

    #[test]
    fn test_out_of_range_error() {
        let mut m = byte_matcher("start: \"ab\"");
        let bad = m.vocab_size() as TokenId + 100;
        assert!(!m.consume_token(bad));
        assert!(m.is_error());
        assert!(m.get_error().unwrap().contains("out of range"));
    }

    #[test]
    fn test_error_is_sticky_until_rollback() {
        let mut m = byte_matcher("start: \"ab\"");
        let a = tok(&m, "a")[0];
        assert!(m.consume_token(a));
        let x = tok(&m, "x")[0];
        assert!(!m.consume_token(x));
        assert!(m.is_error());
        // Further consumes fail without changing the error.
        let b = tok(&m, "b")[0];
        assert!(!m.consume_token(b));
        // Rollback to depth 0 of the error-free prefix revives the matcher.
        assert!(m.rollback(0));
        assert!(!m.is_error());
        assert!(m.consume_token(b));
        assert!(m.is_accepting());
    }

    #[test]
    fn test_accepting_frozen_during_error() {
        let mut m = byte_matcher("start: \"a\"");
        assert!(m.consume_token(tok(&m, "a")[0]));
        assert!(m.is_accepting());
        let bad = m.vocab_size() as TokenId;
        assert!(!m.consume_token(bad));
        // Was accepting before the error; stays reported as accepting.
        assert!(m.is_accepting());
    }

    #[test]
    fn test_eos_when_accepting() {
        let mut m = byte_matcher("start: \"a\" \"b\"?");
        let eos = m.tokenizer().eos_token();
        assert!(!m.consume_token(eos)); // not accepting yet
        assert!(m.rollback(0)); // clear the violation error
        assert!(m.consume_token(tok(&m, "a")[0]));
        assert!(m.is_accepting());
        assert!(m.consume_token(eos));
        assert_eq!(m.stop_reason(), StopReason::EndOfSequence);
        assert!(!m.is_error());
    }

    #[test]
    fn test_try_consume_partial_prefix() {
        let mut m = byte_matcher("start: \"abc\"");
        let t = tok(&m, "abx");
        assert_eq!(m.try_consume_tokens(&t), 2);
        assert!(!m.is_error());
        assert_eq!(m.history_len(), 2);
        assert_eq!(m.committed_tokens(), &t[..2]);
        assert!(m.consume_token(tok(&m, "c")[0]));
        assert!(m.is_accepting());
    }

    #[test]
    fn test_validate_is_pure() {
        let mut m = byte_matcher("start: \"abc\"");
        let t = tok(&m, "abc");
        assert_eq!(m.validate_tokens(&t), 3);
        assert_eq!(m.history_len(), 0);
        assert!(!m.is_error());
        // Still consumable afterwards.
        assert!(m.consume_tokens(&t));
        assert!(m.is_accepting());
    }

    #[test]
    fn test_validate_out_of_range_dual_channel() {
        let mut m = byte_matcher("start: \"abc\"");
        let mut t = tok(&m, "ab");
        t.push(m.vocab_size() as TokenId + 7);
        assert_eq!(m.validate_tokens(&t), 0);
        assert!(m.is_error());
        assert!(m.get_error().unwrap().contains("out of range"));
    }

    #[test]
    fn test_rollback_beyond_history_errors() {
        let mut m = byte_matcher("start: \"ab\"");
        assert!(m.consume_token(tok(&m, "a")[0]));
        assert!(!m.rollback(5));
        assert!(m.is_error());
    }

    #[test]
    fn test_deep_copy_independence() {
        let mut m = byte_matcher("start: \"abc\"");
        assert!(m.consume_token(tok(&m, "a")[0]));
        let mut copy = m.deep_copy();
        assert!(copy.consume_token(tok(&m, "b")[0]));
        assert_eq!(m.history_len(), 1);
        assert_eq!(copy.history_len(), 2);
        assert_eq!(m.compute_mask_words(), {
            let mut fresh = byte_matcher("start: \"abc\"");
            fresh.consume_token(tok(&m, "a")[0]);
            fresh.compute_mask_words()
        });
    }

    #[test]
    fn test_bitmask_matches_logit_bias() {
        let mut m = byte_matcher("start: /[ab]/");
        let bias = m.compute_logit_bias();
        let bits = m.compute_bitmask();
        for t in 0..m.vocab_size() {
            let in_bits = bits[t / 8] & (1 << (t % 8)) != 0;
            assert_eq!(bias[t] == ALLOWED_BIAS, in_bits, "token {}", t);
        }
        let a = tok(&m, "a")[0] as usize;
        let x = tok(&m, "x")[0] as usize;
        assert_eq!(bias[a], ALLOWED_BIAS);
        assert_eq!(bias[x], 0);
    }

    #[test]
    fn test_stopped_matcher_masks_eos_only() {
        let mut m = byte_matcher("start: \"a\"");
        assert!(m.consume_token(tok(&m, "a")[0]));
        assert_eq!(m.stop_reason(), StopReason::NoExtension);
        let words = m.compute_mask_words();
        let eos = m.tokenizer().eos_token() as usize;
        for t in 0..m.vocab_size() {
            assert_eq!(bitmask::get_bit(&words, t), t == eos);
        }
    }

    #[test]
    fn test_accept_string_counts_one_entry() {
        let mut m = byte_matcher("start: \"hello\" \"!\"");
        assert!(m.accept_string("hello"));
        assert_eq!(m.history_len(), 1);
        assert!(!m.accept_string("?"));
        assert!(!m.is_error());
        assert!(m.accept_string("!"));
        assert!(m.is_accepting());
        assert!(m.rollback(2));
        assert_eq!(m.history_len(), 0);
        assert!(m.accept_string("hello!"));
        assert!(m.is_accepting());
    }

    #[test]
    fn test_unsafe_mask_ptr_validation() {
        let mut m = byte_matcher("start: \"a\"");
        let words = m.words_per_row();
        let mut buf = vec![0u32; words];
        let r = unsafe { m.unsafe_compute_mask_ptr(std::ptr::null_mut(), words * 4) };
        assert!(r.unwrap_err().to_string().contains("Null pointer"));
        let r = unsafe { m.unsafe_compute_mask_ptr((buf.as_mut_ptr() as usize + 2) as *mut u32, words * 4) };
        assert!(r.unwrap_err().to_string().contains("Pointer not aligned"));
        let r = unsafe { m.unsafe_compute_mask_ptr(buf.as_mut_ptr(), words * 4 + 1) };
        assert!(r.unwrap_err().to_string().contains("Invalid buffer size"));
        let r = unsafe { m.unsafe_compute_mask_ptr(buf.as_mut_ptr(), words * 4) };
        assert!(r.is_ok());
        let a = tok(&m, "a")[0] as usize;
        assert!(bitmask::get_bit(&buf, a));
    }

    #[test]
    fn test_reset() {
        let mut m = byte_matcher("start: \"ab\"");
        assert!(m.consume_tokens(&tok(&m, "ab")));
        assert!(m.is_stopped());
        m.reset();
        assert!(!m.is_stopped());
        assert_eq!(m.history_len(), 0);
        assert!(m.consume_tokens(&tok(&m, "ab")));
        assert!(m.is_accepting());
    }
}
