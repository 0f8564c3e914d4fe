//! Tokenizer vocabulary handling.
//!
//! [`Tokenizer`] encapsulates the vocabulary of an LLM tokenizer for
//! grammar-constrained decoding:
//! - Decoded vocabulary (raw token strings → byte strings)
//! - Lexicographically sorted vocabulary for prefix-ordered iteration
//! - Trie subtree ranges for batch prefix rejection during mask generation
//! - Greedy longest-match tokenization (canonical for this vocabulary)
//!
//! Tokenizers are immutable once built and are shared across matchers and
//! threads behind an `Arc`.

use anyhow::{Result, bail};
use rustc_hash::FxHashMap;

use crate::TokenId;

/// The type of vocabulary encoding used by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabType {
    /// Token strings are used as-is.
    Raw,
    /// Byte fallback encoding: `<0xAB>` → byte 0xAB, `▁` (U+2581) → space.
    /// Used by SentencePiece tokenizers (e.g., Llama).
    ByteFallback,
    /// Byte-level BPE: each byte is mapped to a printable Unicode character.
    /// Used by GPT-2 style tokenizers.
    ByteLevel,
}

/// Opaque acceleration data narrowing tokenization for a grammar domain.
///
/// Slices are precomputed hints (e.g. "runs of JSON string characters") that
/// a mask computation may use to shortcut whole vocabulary regions. They
/// never change what [`Tokenizer::tokenize_str`] produces for plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerSlice {
    pattern: String,
}

impl TokenizerSlice {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Tokenizer vocabulary information for grammar-constrained decoding.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    /// decoded[token_id] = decoded byte string.
    decoded: Vec<Vec<u8>>,
    /// Non-special vocabulary sorted by decoded bytes: (token_id, bytes).
    sorted: Vec<(TokenId, Vec<u8>)>,
    /// Total vocabulary size (ids past `decoded.len()` are treated as special).
    vocab_size: usize,
    vocab_type: VocabType,
    /// Token ids with an empty decoded string, plus the eos token.
    special: Vec<TokenId>,
    eos_token: TokenId,
    /// For sorted[i], the index of the first entry whose bytes do NOT start
    /// with sorted[i]'s bytes. Lets mask generation skip rejected subtrees.
    trie_end: Vec<usize>,
    /// Longest-match lookup: decoded bytes → lowest token id.
    lookup: FxHashMap<Vec<u8>, TokenId>,
    max_token_len: usize,
    slices: Vec<TokenizerSlice>,
}

impl Tokenizer {
    /// Build a tokenizer from an encoded vocabulary.
    ///
    /// - `encoded_vocab`: raw token strings from the tokenizer.
    /// - `vocab_type`: how to decode token strings into bytes.
    /// - `vocab_size`: total size; if larger than `encoded_vocab.len()`, the
    ///   extra ids are treated as special (padding) tokens.
    /// - `eos_token`: the end-of-sequence id; must be in range.
    pub fn new(
        encoded_vocab: &[String],
        vocab_type: VocabType,
        vocab_size: Option<usize>,
        eos_token: TokenId,
    ) -> Result<Self> {
        let decoded = encoded_vocab
            .iter()
            .map(|tok| decode_token_bytes(tok, vocab_type))
            .collect::<Result<Vec<_>>>()?;
        Self::from_decoded(decoded, vocab_type, vocab_size, eos_token)
    }

    /// Build a raw-vocabulary tokenizer for tests and synthetic setups.
    /// Appends a trailing `<eos>` special token after the given vocabulary.
    pub fn from_vocab(vocab: &[String]) -> Result<Self> {
        let mut decoded: Vec<Vec<u8>> =
            vocab.iter().map(|s| s.as_bytes().to_vec()).collect();
        let eos = decoded.len() as TokenId;
        decoded.push(Vec::new());
        Self::from_decoded(decoded, VocabType::Raw, None, eos)
    }

    /// A byte-level tokenizer: one token per byte value, plus a trailing eos.
    /// Canonical tokenization is one token per input byte.
    pub fn byte_level() -> Self {
        let mut decoded: Vec<Vec<u8>> = (0u16..=255).map(|b| vec![b as u8]).collect();
        decoded.push(Vec::new());
        Self::from_decoded(decoded, VocabType::Raw, None, 256)
            .expect("byte-level vocabulary is always valid")
    }

    fn from_decoded(
        decoded: Vec<Vec<u8>>,
        vocab_type: VocabType,
        vocab_size: Option<usize>,
        eos_token: TokenId,
    ) -> Result<Self> {
        let vocab_size = vocab_size.unwrap_or(decoded.len());
        if vocab_size < decoded.len() {
            bail!(
                "vocab_size ({}) must be >= decoded vocabulary length ({})",
                vocab_size,
                decoded.len()
            );
        }
        if eos_token as usize >= vocab_size {
            bail!(
                "eos token {} out of range (vocab size {})",
                eos_token,
                vocab_size
            );
        }

        let mut sorted = Vec::new();
        let mut special = Vec::new();
        let mut lookup: FxHashMap<Vec<u8>, TokenId> = FxHashMap::default();
        let mut max_token_len = 0;

        for (id, bytes) in decoded.iter().enumerate() {
            let id = id as TokenId;
            if bytes.is_empty() || id == eos_token {
                special.push(id);
                continue;
            }
            sorted.push((id, bytes.clone()));
            max_token_len = max_token_len.max(bytes.len());
            lookup.entry(bytes.clone()).or_insert(id);
        }
        sorted.sort_by(|a, b| a.1.cmp(&b.1));

        let trie_end = build_trie_subtree_ranges(&sorted);

        Ok(Self {
            decoded,
            sorted,
            vocab_size,
            vocab_type,
            special,
            eos_token,
            trie_end,
            lookup,
            max_token_len,
            slices: Vec::new(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    pub fn eos_token(&self) -> TokenId {
        self.eos_token
    }

    pub fn is_special_token(&self, token_id: TokenId) -> bool {
        (token_id as usize) < self.vocab_size
            && (token_id as usize >= self.decoded.len() || self.special.contains(&token_id))
    }

    pub fn special_token_ids(&self) -> &[TokenId] {
        &self.special
    }

    pub fn sorted_vocab(&self) -> &[(TokenId, Vec<u8>)] {
        &self.sorted
    }

    pub fn trie_subtree_end(&self) -> &[usize] {
        &self.trie_end
    }

    /// Decoded bytes for a token id. `None` for ids past the decoded range.
    pub fn decode_token(&self, token_id: TokenId) -> Option<&[u8]> {
        self.decoded.get(token_id as usize).map(|b| b.as_slice())
    }

    /// Decode a token sequence to a string (lossy for non-UTF-8 byte runs).
    pub fn decode_str(&self, tokens: &[TokenId]) -> String {
        let mut bytes = Vec::new();
        for &t in tokens {
            if let Some(b) = self.decode_token(t) {
                bytes.extend_from_slice(b);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Greedy longest-match tokenization over raw bytes.
    ///
    /// Returns `None` when some position matches no vocabulary entry.
    pub fn tokenize_bytes(&self, bytes: &[u8]) -> Option<Vec<TokenId>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let rest = &bytes[pos..];
            let mut matched = None;
            for len in (1..=self.max_token_len.min(rest.len())).rev() {
                if let Some(&id) = self.lookup.get(&rest[..len]) {
                    matched = Some((id, len));
                    break;
                }
            }
            let (id, len) = matched?;
            out.push(id);
            pos += len;
        }
        Some(out)
    }

    /// Greedy longest-match tokenization of a string.
    /// Positions with no matching token are dropped from the result.
    pub fn tokenize_str(&self, s: &str) -> Vec<TokenId> {
        self.tokenize_bytes(s.as_bytes()).unwrap_or_default()
    }

    /// Replace the slice configuration. Slices are acceleration hints only;
    /// plain-text tokenization is unaffected.
    pub fn with_slices(&self, slices: Vec<TokenizerSlice>) -> Tokenizer {
        let mut t = self.clone();
        t.slices = slices;
        t
    }

    pub fn slices(&self) -> &[TokenizerSlice] {
        &self.slices
    }

    /// General-purpose slices: long runs the mask computation can treat as a
    /// unit regardless of grammar domain.
    pub fn general_slices() -> Vec<TokenizerSlice> {
        vec![
            TokenizerSlice::new(r"[a-zA-Z0-9_]+"),
            TokenizerSlice::new(r"[ \t]+"),
        ]
    }

    /// Slices tuned for JSON string content.
    pub fn json_slices() -> Vec<TokenizerSlice> {
        vec![
            TokenizerSlice::new(r#"[^"\\\x00-\x1f]+"#),
            TokenizerSlice::new(r#""[^"\\\x00-\x1f]*""#),
        ]
    }
}

/// Decode a single encoded token to bytes according to the vocabulary type.
fn decode_token_bytes(encoded: &str, vocab_type: VocabType) -> Result<Vec<u8>> {
    match vocab_type {
        VocabType::Raw => Ok(encoded.as_bytes().to_vec()),
        VocabType::ByteFallback => decode_byte_fallback(encoded),
        VocabType::ByteLevel => Ok(decode_byte_level(encoded)),
    }
}

/// Byte-fallback decoding (SentencePiece style):
/// `<0xAB>` → byte 0xAB, `▁` (U+2581) → space.
fn decode_byte_fallback(encoded: &str) -> Result<Vec<u8>> {
    if encoded.len() == 6 && encoded.starts_with("<0x") && encoded.ends_with('>') {
        let byte = u8::from_str_radix(&encoded[3..5], 16)
            .map_err(|_| anyhow::anyhow!("invalid byte fallback token: {}", encoded))?;
        return Ok(vec![byte]);
    }
    Ok(encoded.replace('\u{2581}', " ").into_bytes())
}

/// Byte-level BPE decoding (GPT-2 style): invert the `bytes_to_unicode`
/// mapping character by character.
fn decode_byte_level(encoded: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for c in encoded.chars() {
        match byte_level_char_to_byte(c as u32) {
            Some(b) => bytes.push(b),
            None => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    bytes
}

/// Inverse of GPT-2's `bytes_to_unicode()`: printable bytes map to
/// themselves, the rest are shifted into the U+0100.. range in order.
fn byte_level_char_to_byte(cp: u32) -> Option<u8> {
    match cp {
        0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => Some(cp as u8),
        _ => {
            let gap_bytes: Vec<u8> = (0u16..=255)
                .filter(|&b| {
                    !((0x21..=0x7E).contains(&b)
                        || (0xA1..=0xAC).contains(&b)
                        || (0xAE..=0xFF).contains(&b))
                })
                .map(|b| b as u8)
                .collect();
            let offset = cp.checked_sub(256)?;
            gap_bytes.get(offset as usize).copied()
        }
    }
}

/// For each sorted entry, the index of the first entry that does not share
/// its byte prefix. Monotone stack over the sorted vocabulary.
fn build_trie_subtree_ranges(sorted: &[(TokenId, Vec<u8>)]) -> Vec<usize> {
    let n = sorted.len();
    let mut ranges = vec![n; n];
    let mut stack: Vec<(usize, &[u8])> = Vec::new();

    for (i, (_, bytes)) in sorted.iter().enumerate() {
        while let Some(&(idx, prefix)) = stack.last() {
            if bytes.starts_with(prefix) {
                break;
            }
            ranges[idx] = i;
            stack.pop();
        }
        stack.push((i, bytes));
    }
    while let Some((idx, _)) = stack.pop() {
        ranges[idx] = n;
    }
    ranges
}
