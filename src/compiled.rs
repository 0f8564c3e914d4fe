//! Pre-compiled grammar: per-rule DFAs plus adaptive token masks.
//!
//! [`CompiledGrammar`] does all vocabulary-dependent precomputation once per
//! (grammar, tokenizer) pair: for every `(rule, dfa_state)` it classifies the
//! whole vocabulary into *accepted* (the token's bytes stay inside the rule's
//! DFA), *rejected*, and *uncertain* (the token crosses a rule boundary or
//! passes an accepting state, so only the runtime engine can decide).
//! Mask computation then ORs precomputed words and trie-walks only the
//! uncertain remainder. Compiled grammars are shared across matchers via
//! `Arc` and are immutable apart from an internal bitmask memo.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use lru::LruCache;
use rustc_hash::FxHasher;

use crate::bitmask;
use crate::fsm::{CompactFsm, Edge, RuleFsm, StateId, build_rule_fsms};
use crate::grammar::Grammar;
use crate::grammar::normalize::normalize_grammar;
use crate::tokenizer::Tokenizer;

/// Capacity of the runtime bitmask memo (distinct engine states).
const MASK_CACHE_CAPACITY: usize = 512;

/// Packed per-state flags (1 byte) for fast branching during advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateFlags(u8);

impl StateFlags {
    const BYTE_EDGES: u8 = 1;
    const CALLS: u8 = 2;
    const ACCEPTING: u8 = 4;

    #[inline(always)]
    pub(crate) fn has_byte_edges(self) -> bool {
        self.0 & Self::BYTE_EDGES != 0
    }
    #[inline(always)]
    pub(crate) fn has_calls(self) -> bool {
        self.0 & Self::CALLS != 0
    }
    #[inline(always)]
    pub(crate) fn is_accepting(self) -> bool {
        self.0 & Self::ACCEPTING != 0
    }
}

/// Pre-computed action for a `(rule, dfa_state)` pair; avoids edge iteration
/// in the engine's hot loop.
#[derive(Debug, Clone)]
pub(crate) struct StateAction {
    pub(crate) flags: StateFlags,
    /// Pre-extracted call edges: (callee rule id, parent state after return).
    pub(crate) calls: Vec<(u16, u16)>,
}

/// Pre-computed token mask for a `(rule, dfa_state)` pair.
pub(crate) struct StateTokenMask {
    /// Tokens definitely accepted from this state (bytes consumed via byte
    /// edges only, no rule boundary crossed).
    pub(crate) accepted: Vec<u32>,
    /// Tokens that need a runtime engine probe.
    pub(crate) uncertain: Vec<u32>,
}

enum TokenClass {
    Accepted,
    Rejected,
    Uncertain,
}

/// A grammar compiled against a tokenizer vocabulary.
pub struct CompiledGrammar {
    pub(crate) grammar: Arc<Grammar>,
    /// Per-rule DFAs, indexed by rule id.
    pub(crate) rule_dfas: Vec<RuleFsm<CompactFsm>>,
    /// Flat state actions, indexed via `action_offsets[rule] + dfa_state`.
    pub(crate) actions: Vec<StateAction>,
    pub(crate) action_offsets: Vec<u32>,
    /// True when the root rule's DFA has no call edges anywhere; the matcher
    /// can then run on a bare DFA cursor instead of the pushdown engine.
    pub(crate) is_single_dfa: bool,
    /// Token masks keyed by `(rule, dfa_state)`.
    pub(crate) token_masks: HashMap<(u32, u32), StateTokenMask>,
    /// Runtime memo: engine state hash → resolved mask words.
    mask_cache: Mutex<LruCache<u64, Vec<u32>>>,
    pub(crate) vocab_size: usize,
}

impl CompiledGrammar {
    /// Compile `grammar` against `tokenizer`:
    /// normalize → per-rule NFA → DFA → state actions → token masks.
    pub fn new(grammar: &Grammar, tokenizer: &Tokenizer) -> Result<Self> {
        let normalized = Arc::new(normalize_grammar(grammar));

        let rule_dfas: Vec<_> = build_rule_fsms(&normalized)
            .iter()
            .map(|nfa| nfa.determinize().compact())
            .collect();

        if rule_dfas.len() > u16::MAX as usize {
            bail!("grammar has too many rules ({})", rule_dfas.len());
        }
        for (i, dfa) in rule_dfas.iter().enumerate() {
            if dfa.fsm.num_states() > u16::MAX as usize {
                bail!(
                    "rule '{}' compiles to too many DFA states ({})",
                    normalized.rules()[i].name,
                    dfa.fsm.num_states()
                );
            }
        }

        let (actions, action_offsets) = compute_state_actions(&rule_dfas);
        let token_masks =
            precompute_token_masks(&rule_dfas, tokenizer, &actions, &action_offsets);

        let is_single_dfa = {
            let root = normalized.root_rule().0 as usize;
            let start = action_offsets[root] as usize;
            let end = action_offsets
                .get(root + 1)
                .copied()
                .unwrap_or(actions.len() as u32) as usize;
            actions[start..end].iter().all(|a| !a.flags.has_calls())
        };

        tracing::debug!(
            rules = rule_dfas.len(),
            single_dfa = is_single_dfa,
            vocab = tokenizer.vocab_size(),
            "compiled grammar"
        );

        Ok(CompiledGrammar {
            grammar: normalized,
            rule_dfas,
            actions,
            action_offsets,
            is_single_dfa,
            token_masks,
            mask_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MASK_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            vocab_size: tokenizer.vocab_size(),
        })
    }

    #[inline(always)]
    pub(crate) fn action(&self, rule: u16, dfa_state: u16) -> &StateAction {
        &self.actions[self.action_offsets[rule as usize] as usize + dfa_state as usize]
    }

    /// Copy a memoized mask into `out`. Returns true on hit.
    pub(crate) fn cached_mask(&self, key: u64, out: &mut [u32]) -> bool {
        let mut cache = self.mask_cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(&key) {
            Some(words) if words.len() == out.len() => {
                out.copy_from_slice(words);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn store_mask(&self, key: u64, words: &[u32]) {
        let mut cache = self.mask_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, words.to_vec());
    }
}

/// Pre-compute state actions for all `(rule, dfa_state)` pairs.
fn compute_state_actions(rule_dfas: &[RuleFsm<CompactFsm>]) -> (Vec<StateAction>, Vec<u32>) {
    let mut actions = Vec::new();
    let mut offsets = Vec::with_capacity(rule_dfas.len());

    for dfa in rule_dfas {
        offsets.push(actions.len() as u32);
        for si in 0..dfa.fsm.num_states() {
            let state = StateId(si as u32);
            let edges = dfa.fsm.edges(state);
            let has_bytes = edges.iter().any(|e| matches!(e, Edge::Byte { .. }));
            let has_calls = edges.iter().any(|e| matches!(e, Edge::Call { .. }));
            let accepting = dfa.accepting.get(si).copied().unwrap_or(false);

            let mut flags = 0u8;
            if has_bytes {
                flags |= StateFlags::BYTE_EDGES;
            }
            if has_calls {
                flags |= StateFlags::CALLS;
            }
            if accepting {
                flags |= StateFlags::ACCEPTING;
            }

            let calls = edges
                .iter()
                .filter_map(|e| match e {
                    Edge::Call { rule, to } => Some((rule.0 as u16, to.0 as u16)),
                    _ => None,
                })
                .collect();

            actions.push(StateAction {
                flags: StateFlags(flags),
                calls,
            });
        }
    }
    (actions, offsets)
}

/// Classify one token's bytes against a rule DFA.
///
/// Keeps consuming past accepting states as long as the DFA can continue
/// (self-looping classes like `[^"\\]*`); only on a dead end does a
/// previously seen accepting state or a call edge make the token uncertain.
fn classify_token(
    dfa: &RuleFsm<CompactFsm>,
    start_state: StateId,
    token_bytes: &[u8],
    actions_offset: usize,
    actions: &[StateAction],
) -> TokenClass {
    let mut cur = start_state;
    let mut saw_accept = dfa.accepting.get(cur.0 as usize).copied().unwrap_or(false);

    for &byte in token_bytes {
        match dfa.fsm.next_state(cur, byte) {
            Some(next) => {
                cur = next;
                if dfa.accepting.get(cur.0 as usize).copied().unwrap_or(false) {
                    saw_accept = true;
                }
            }
            None => {
                if saw_accept {
                    // The rule could have ended earlier; the remainder is the
                    // parent's business.
                    return TokenClass::Uncertain;
                }
                if actions[actions_offset + cur.0 as usize].flags.has_calls() {
                    return TokenClass::Uncertain;
                }
                return TokenClass::Rejected;
            }
        }
    }
    TokenClass::Accepted
}

/// Structural hash of a DFA; identical hashes produce identical token masks,
/// so repeated sub-grammars (JSON string rules etc.) are classified once.
fn hash_dfa(dfa: &RuleFsm<CompactFsm>) -> u64 {
    let mut hasher = FxHasher::default();
    dfa.start.0.hash(&mut hasher);
    dfa.accepting.hash(&mut hasher);
    dfa.fsm.byte_table().hash(&mut hasher);
    for si in 0..dfa.fsm.num_states() {
        for edge in dfa.fsm.edges(StateId(si as u32)) {
            if let Edge::Call { rule, to } = edge {
                rule.0.hash(&mut hasher);
                to.0.hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

/// Classify the whole vocabulary for every `(rule, dfa_state)` pair.
fn precompute_token_masks(
    rule_dfas: &[RuleFsm<CompactFsm>],
    tokenizer: &Tokenizer,
    actions: &[StateAction],
    action_offsets: &[u32],
) -> HashMap<(u32, u32), StateTokenMask> {
    let mut masks = HashMap::new();
    let words = bitmask::mask_words(tokenizer.vocab_size());
    let sorted = tokenizer.sorted_vocab();
    let trie_end = tokenizer.trie_subtree_end();

    // DFA hash → per-state masks, so structurally equal DFAs classify once.
    let mut dfa_cache: HashMap<u64, usize> = HashMap::new();
    let mut computed: Vec<Vec<StateTokenMask>> = Vec::new();

    for (rule_idx, dfa) in rule_dfas.iter().enumerate() {
        let dfa_hash = hash_dfa(dfa);
        if let Some(&cached_idx) = dfa_cache.get(&dfa_hash) {
            for (state_idx, mask) in computed[cached_idx].iter().enumerate() {
                masks.insert(
                    (rule_idx as u32, state_idx as u32),
                    StateTokenMask {
                        accepted: mask.accepted.clone(),
                        uncertain: mask.uncertain.clone(),
                    },
                );
            }
            continue;
        }

        let offset = action_offsets[rule_idx] as usize;
        let mut rule_masks = Vec::with_capacity(dfa.fsm.num_states());

        for state_idx in 0..dfa.fsm.num_states() {
            let state = StateId(state_idx as u32);
            let flags = actions[offset + state_idx].flags;
            let only_calls = !flags.has_byte_edges() && flags.has_calls();

            let mut accepted = vec![0u32; words];
            let mut uncertain = Vec::new();

            let mut i = 0;
            while i < sorted.len() {
                let (token_id, ref bytes) = sorted[i];
                if bytes.is_empty() {
                    i += 1;
                    continue;
                }
                if only_calls {
                    uncertain.push(token_id);
                    i += 1;
                    continue;
                }

                match classify_token(dfa, state, bytes, offset, actions) {
                    TokenClass::Accepted => {
                        bitmask::set_bit(&mut accepted, token_id as usize);
                        i += 1;
                    }
                    TokenClass::Rejected => {
                        // If even the first byte is dead, the whole sorted
                        // subtree sharing this prefix is dead too.
                        if dfa.fsm.next_state(state, bytes[0]).is_none() && !flags.has_calls() {
                            i = trie_end[i];
                        } else {
                            i += 1;
                        }
                    }
                    TokenClass::Uncertain => {
                        uncertain.push(token_id);
                        i += 1;
                    }
                }
            }

            rule_masks.push(StateTokenMask {
                accepted,
                uncertain,
            });
        }

        for (state_idx, mask) in rule_masks.iter().enumerate() {
            masks.insert(
                (rule_idx as u32, state_idx as u32),
                StateTokenMask {
                    accepted: mask.accepted.clone(),
                    uncertain: mask.uncertain.clone(),
                },
            );
        }
        dfa_cache.insert(dfa_hash, computed.len());
        computed.push(rule_masks);
    }

    masks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(ebnf: &str, vocab: &[&str]) -> CompiledGrammar {
        let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
        let vocab: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
        let tokenizer = Tokenizer::from_vocab(&vocab).unwrap();
        CompiledGrammar::new(&grammar, &tokenizer).unwrap()
    }

    #[test]
    fn test_single_dfa_detection() {
        let c = compile(r#"root ::= "ab" | "cd""#, &["ab", "cd"]);
        assert!(c.is_single_dfa);

        let c = compile(r#"root ::= "[" root "]" | "x""#, &["[", "]", "x"]);
        assert!(!c.is_single_dfa);
    }

    #[test]
    fn test_accepted_mask_at_start_state() {
        let c = compile(r#"root ::= "ab" | "cd""#, &["ab", "cd", "ef", "a"]);
        let root = c.grammar.root_rule().0;
        let start = c.rule_dfas[root as usize].start.0;
        let mask = &c.token_masks[&(root, start)];
        assert!(bitmask::get_bit(&mask.accepted, 0)); // "ab"
        assert!(bitmask::get_bit(&mask.accepted, 1)); // "cd"
        assert!(!bitmask::get_bit(&mask.accepted, 2)); // "ef"
        // "a" is a strict prefix that stays inside the rule — accepted.
        assert!(bitmask::get_bit(&mask.accepted, 3));
    }

    #[test]
    fn test_uncertain_when_crossing_accept() {
        // After "a", the rule may end; "ab" from there is uncertain territory.
        let c = compile(r#"root ::= "a" | "ab""#, &["a", "ab", "b"]);
        let root = c.grammar.root_rule().0;
        let start = c.rule_dfas[root as usize].start.0;
        let mask = &c.token_masks[&(root, start)];
        assert!(bitmask::get_bit(&mask.accepted, 0));
        assert!(bitmask::get_bit(&mask.accepted, 1));
        assert!(!bitmask::get_bit(&mask.accepted, 2));
    }

    #[test]
    fn test_mask_cache_roundtrip() {
        let c = compile(r#"root ::= "ab""#, &["ab"]);
        let words = bitmask::mask_words(c.vocab_size);
        let mut out = vec![0u32; words];
        assert!(!c.cached_mask(42, &mut out));
        let stored = vec![0b1010u32; words];
        c.store_mask(42, &stored);
        assert!(c.cached_mask(42, &mut out));
        assert_eq!(out, stored);
    }

    #[test]
    fn test_too_many_rules_rejected() {
        // Generate a grammar with a single rule; the guard is exercised via
        // the error path only when limits are exceeded, so just sanity-check
        // that normal grammars pass.
        let c = compile(r#"root ::= [a-z]"#, &["a"]);
        assert_eq!(c.rule_dfas.len(), c.grammar.num_rules());
    }
}
