//! Finite-state machinery behind the grammar automaton.
//!
//! Grammars compile into one byte-level automaton per rule: a mutable [`Nfa`]
//! is built from the rule body (character classes expand into UTF-8
//! byte-sequence paths, so multi-byte scalars are indivisible), determinized
//! by subset construction, and frozen into a [`CompactFsm`] with a 256-entry
//! byte transition table per state for O(1) stepping.
//!
//! Edge kinds:
//! - `Byte { lo, hi }`: transition on a byte in `[lo, hi]`
//! - `Eps`: free transition (NFA only)
//! - `Call`: reference to another grammar rule; taken when that rule completes

use std::collections::{BTreeSet, HashMap, VecDeque};

use rustc_hash::FxHashSet;

use crate::grammar::{Expr, ExprId, Grammar, RuleId};

/// A state index in an FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StateId(pub u32);

/// No byte transition; sentinel in the byte table.
pub(crate) const NO_TRANSITION: u16 = u16::MAX;

/// An edge in the FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Edge {
    /// Transition on a byte in `[lo, hi]` (inclusive).
    Byte { lo: u8, hi: u8, to: StateId },
    /// Free (epsilon) transition.
    Eps(StateId),
    /// Reference to another rule; when it completes, continue at `to`.
    Call { rule: RuleId, to: StateId },
}

// ---------------------------------------------------------------------------
// Mutable FSM (adjacency list)
// ---------------------------------------------------------------------------

/// Mutable FSM used during construction; adjacency-list representation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Nfa {
    edges: Vec<Vec<Edge>>,
}

impl Nfa {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_state(&mut self) -> StateId {
        let id = StateId(self.edges.len() as u32);
        self.edges.push(Vec::new());
        id
    }

    pub(crate) fn num_states(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn add_byte_edge(&mut self, from: StateId, lo: u8, hi: u8, to: StateId) {
        self.edges[from.0 as usize].push(Edge::Byte { lo, hi, to });
    }

    pub(crate) fn add_eps(&mut self, from: StateId, to: StateId) {
        self.edges[from.0 as usize].push(Edge::Eps(to));
    }

    pub(crate) fn add_call(&mut self, from: StateId, rule: RuleId, to: StateId) {
        self.edges[from.0 as usize].push(Edge::Call { rule, to });
    }

    pub(crate) fn edges(&self, state: StateId) -> &[Edge] {
        &self.edges[state.0 as usize]
    }

    /// Epsilon closure of a state set (BFS).
    pub(crate) fn epsilon_closure(&self, states: &BTreeSet<StateId>) -> BTreeSet<StateId> {
        let mut closure = states.clone();
        let mut queue: VecDeque<StateId> = states.iter().copied().collect();
        while let Some(s) = queue.pop_front() {
            for edge in &self.edges[s.0 as usize] {
                if let Edge::Eps(to) = edge {
                    if closure.insert(*to) {
                        queue.push_back(*to);
                    }
                }
            }
        }
        closure
    }

    /// Freeze into the compact representation with per-state byte tables.
    pub(crate) fn compact(&self) -> CompactFsm {
        let mut all_edges = Vec::new();
        let mut offsets = Vec::with_capacity(self.edges.len() + 1);

        for state_edges in &self.edges {
            offsets.push(all_edges.len() as u32);
            let mut sorted = state_edges.clone();
            // Byte edges first, ordered by lo, for readable dumps.
            sorted.sort_by(|a, b| match (a, b) {
                (Edge::Byte { lo: a_lo, .. }, Edge::Byte { lo: b_lo, .. }) => a_lo.cmp(b_lo),
                (Edge::Byte { .. }, _) => std::cmp::Ordering::Less,
                (_, Edge::Byte { .. }) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            });
            all_edges.extend(sorted);
        }
        offsets.push(all_edges.len() as u32);

        let num_states = self.edges.len();
        let mut byte_table = vec![NO_TRANSITION; num_states * 256];
        for s in 0..num_states {
            let start = offsets[s] as usize;
            let end = offsets[s + 1] as usize;
            for edge in &all_edges[start..end] {
                if let Edge::Byte { lo, hi, to } = edge {
                    for b in *lo..=*hi {
                        byte_table[s * 256 + b as usize] = to.0 as u16;
                    }
                }
            }
        }

        CompactFsm {
            edges: all_edges,
            offsets,
            byte_table,
        }
    }
}

// ---------------------------------------------------------------------------
// Compact FSM
// ---------------------------------------------------------------------------

/// Immutable FSM: edges in a flat array indexed by state offsets, plus a
/// 256-entry byte transition table per state.
#[derive(Debug, Clone)]
pub(crate) struct CompactFsm {
    edges: Vec<Edge>,
    offsets: Vec<u32>,
    byte_table: Vec<u16>,
}

impl CompactFsm {
    pub(crate) fn num_states(&self) -> usize {
        self.offsets.len() - 1
    }

    pub(crate) fn edges(&self, state: StateId) -> &[Edge] {
        let s = state.0 as usize;
        &self.edges[self.offsets[s] as usize..self.offsets[s + 1] as usize]
    }

    #[inline(always)]
    pub(crate) fn byte_table(&self) -> &[u16] {
        &self.byte_table
    }

    /// Next state on `byte`, or `None` (DFA: O(1) table lookup).
    #[inline(always)]
    pub(crate) fn next_state(&self, from: StateId, byte: u8) -> Option<StateId> {
        let to = self.byte_table[from.0 as usize * 256 + byte as usize];
        if to != NO_TRANSITION {
            Some(StateId(to as u32))
        } else {
            None
        }
    }

    /// Whether any byte can advance from `state`.
    pub(crate) fn has_byte_edges(&self, state: StateId) -> bool {
        let row = &self.byte_table[state.0 as usize * 256..state.0 as usize * 256 + 256];
        row.iter().any(|&t| t != NO_TRANSITION)
    }
}

// ---------------------------------------------------------------------------
// Rule automaton
// ---------------------------------------------------------------------------

/// An FSM with a start state and accepting-state flags.
#[derive(Debug, Clone)]
pub(crate) struct RuleFsm<F> {
    pub(crate) fsm: F,
    pub(crate) start: StateId,
    /// `accepting[i]` is true if state `i` accepts.
    pub(crate) accepting: Vec<bool>,
}

impl RuleFsm<Nfa> {
    pub(crate) fn is_accepting_state(&self, state: StateId) -> bool {
        self.accepting.get(state.0 as usize).copied().unwrap_or(false)
    }

    /// NFA simulation over a byte string.
    #[cfg(test)]
    pub(crate) fn accepts(&self, input: &[u8]) -> bool {
        let mut current: BTreeSet<StateId> = BTreeSet::new();
        current.insert(self.start);
        let mut current = self.fsm.epsilon_closure(&current);

        for &byte in input {
            let mut next = BTreeSet::new();
            for &state in &current {
                for edge in self.fsm.edges(state) {
                    if let Edge::Byte { lo, hi, to } = edge {
                        if byte >= *lo && byte <= *hi {
                            next.insert(*to);
                        }
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            current = self.fsm.epsilon_closure(&next);
        }
        current.iter().any(|s| self.is_accepting_state(*s))
    }

    /// Subset construction: NFA → DFA (byte edges become deterministic;
    /// `Call` edges survive as non-byte edges on the DFA states).
    pub(crate) fn determinize(&self) -> RuleFsm<Nfa> {
        let mut dfa = Nfa::new();
        let mut dfa_accepting = Vec::new();
        let mut state_map: HashMap<BTreeSet<StateId>, StateId> = HashMap::new();
        let mut worklist: VecDeque<BTreeSet<StateId>> = VecDeque::new();

        let get_or_create = |set: BTreeSet<StateId>,
                             accepting: &Vec<bool>,
                             dfa: &mut Nfa,
                             dfa_accepting: &mut Vec<bool>,
                             state_map: &mut HashMap<BTreeSet<StateId>, StateId>,
                             worklist: &mut VecDeque<BTreeSet<StateId>>|
         -> StateId {
            if let Some(&existing) = state_map.get(&set) {
                existing
            } else {
                let id = dfa.add_state();
                dfa_accepting
                    .push(set.iter().any(|s| accepting.get(s.0 as usize).copied().unwrap_or(false)));
                state_map.insert(set.clone(), id);
                worklist.push_back(set);
                id
            }
        };

        let start_set = {
            let mut s = BTreeSet::new();
            s.insert(self.start);
            self.fsm.epsilon_closure(&s)
        };
        let dfa_start = dfa.add_state();
        dfa_accepting.push(start_set.iter().any(|s| self.is_accepting_state(*s)));
        state_map.insert(start_set.clone(), dfa_start);
        worklist.push_back(start_set);

        while let Some(nfa_states) = worklist.pop_front() {
            let dfa_state = state_map[&nfa_states];

            for (lo, hi, targets) in self.collect_intervals(&nfa_states) {
                let target_set = self.fsm.epsilon_closure(&targets);
                if target_set.is_empty() {
                    continue;
                }
                let dfa_target = get_or_create(
                    target_set,
                    &self.accepting,
                    &mut dfa,
                    &mut dfa_accepting,
                    &mut state_map,
                    &mut worklist,
                );
                dfa.add_byte_edge(dfa_state, lo, hi, dfa_target);
            }

            for &nfa_state in &nfa_states {
                for edge in self.fsm.edges(nfa_state) {
                    let Edge::Call { rule, to } = edge else {
                        continue;
                    };
                    let target_set = {
                        let mut s = BTreeSet::new();
                        s.insert(*to);
                        self.fsm.epsilon_closure(&s)
                    };
                    if target_set.is_empty() {
                        continue;
                    }
                    let dfa_target = get_or_create(
                        target_set,
                        &self.accepting,
                        &mut dfa,
                        &mut dfa_accepting,
                        &mut state_map,
                        &mut worklist,
                    );
                    dfa.add_call(dfa_state, *rule, dfa_target);
                }
            }
        }

        RuleFsm {
            fsm: dfa,
            start: dfa_start,
            accepting: dfa_accepting,
        }
    }

    /// Split overlapping byte edges of a state set into non-overlapping
    /// intervals, each with the union of reachable targets.
    fn collect_intervals(&self, nfa_states: &BTreeSet<StateId>) -> Vec<(u8, u8, BTreeSet<StateId>)> {
        let mut ranges: Vec<(u8, u8, StateId)> = Vec::new();
        for &state in nfa_states {
            for edge in self.fsm.edges(state) {
                if let Edge::Byte { lo, hi, to } = edge {
                    ranges.push((*lo, *hi, *to));
                }
            }
        }
        if ranges.is_empty() {
            return Vec::new();
        }

        let mut points: BTreeSet<u16> = BTreeSet::new();
        for &(lo, hi, _) in &ranges {
            points.insert(lo as u16);
            if (hi as u16) < 255 {
                points.insert(hi as u16 + 1);
            }
        }
        let points: Vec<u16> = points.into_iter().collect();

        let mut result = Vec::new();
        for (i, &start) in points.iter().enumerate() {
            let end = if i + 1 < points.len() {
                points[i + 1] - 1
            } else {
                255
            };
            let mut targets = BTreeSet::new();
            for &(lo, hi, to) in &ranges {
                if (lo as u16) <= start && end <= (hi as u16) {
                    targets.insert(to);
                }
            }
            if !targets.is_empty() {
                result.push((start as u8, end as u8, targets));
            }
        }

        // Merge adjacent intervals with identical target sets.
        let mut merged: Vec<(u8, u8, BTreeSet<StateId>)> = Vec::new();
        for (lo, hi, targets) in result {
            if let Some(last) = merged.last_mut() {
                if last.2 == targets && last.1.checked_add(1) == Some(lo) {
                    last.1 = hi;
                    continue;
                }
            }
            merged.push((lo, hi, targets));
        }
        merged
    }

    pub(crate) fn compact(&self) -> RuleFsm<CompactFsm> {
        RuleFsm {
            fsm: self.fsm.compact(),
            start: self.start,
            accepting: self.accepting.clone(),
        }
    }
}

impl RuleFsm<CompactFsm> {
    #[cfg(test)]
    pub(crate) fn accepts(&self, input: &[u8]) -> bool {
        let mut state = self.start;
        for &byte in input {
            match self.fsm.next_state(state, byte) {
                Some(next) => state = next,
                None => return false,
            }
        }
        self.accepting.get(state.0 as usize).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// UTF-8 byte-level construction for character classes
// ---------------------------------------------------------------------------

/// Wire byte-level paths from `start` to `end` matching exactly the scalars
/// of the (possibly negated) character class.
fn build_char_class(nfa: &mut Nfa, negated: bool, ranges: &[(u32, u32)], start: StateId, end: StateId) {
    let effective = if negated {
        complement_codepoint_ranges(ranges)
    } else {
        ranges.to_vec()
    };
    for &(lo, hi) in &effective {
        add_codepoint_range(nfa, lo, hi, start, end);
    }
}

/// Complement of codepoint ranges over the Unicode scalar space
/// (surrogates U+D800..=U+DFFF excluded).
fn complement_codepoint_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|&(lo, _)| lo);
    let mut merged: Vec<(u32, u32)> = Vec::new();
    for (lo, hi) in sorted {
        if let Some(last) = merged.last_mut() {
            if lo <= last.1.saturating_add(1) {
                last.1 = last.1.max(hi);
                continue;
            }
        }
        merged.push((lo, hi));
    }

    let mut complement = Vec::new();
    let mut prev_end: u32 = 0;
    for &(lo, hi) in &merged {
        if lo > prev_end {
            complement.push((prev_end, lo - 1));
        }
        prev_end = hi.saturating_add(1);
    }
    if prev_end <= 0x10FFFF {
        complement.push((prev_end, 0x10FFFF));
    }

    let mut result = Vec::new();
    for &(lo, hi) in &complement {
        if hi < 0xD800 || lo > 0xDFFF {
            result.push((lo, hi));
        } else {
            if lo < 0xD800 {
                result.push((lo, 0xD7FF));
            }
            if hi > 0xDFFF {
                result.push((0xE000, hi));
            }
        }
    }
    result
}

/// Add byte paths for the codepoint range `[lo, hi]`, split by UTF-8 length.
fn add_codepoint_range(nfa: &mut Nfa, lo: u32, hi: u32, start: StateId, end: StateId) {
    // 1-byte (ASCII)
    let a_lo = lo;
    let a_hi = hi.min(0x7F);
    if a_lo <= a_hi {
        nfa.add_byte_edge(start, a_lo as u8, a_hi as u8, end);
    }
    // Same-length segments, skipping the surrogate gap.
    for (seg_lo, seg_hi) in [(0x80, 0x7FF), (0x800, 0xD7FF), (0xE000, 0xFFFF), (0x10000, 0x10FFFF)]
    {
        let s_lo = lo.max(seg_lo);
        let s_hi = hi.min(seg_hi);
        if s_lo <= s_hi {
            let lo_bytes = encode_utf8(s_lo);
            let hi_bytes = encode_utf8(s_hi);
            debug_assert_eq!(lo_bytes.len(), hi_bytes.len());
            add_utf8_byte_range(nfa, &lo_bytes, &hi_bytes, 0, start, end);
        }
    }
}

fn encode_utf8(cp: u32) -> Vec<u8> {
    let c = char::from_u32(cp).expect("surrogate ranges are excluded by construction");
    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf).as_bytes().to_vec()
}

/// Recursive byte-position split for same-length UTF-8 sequences.
fn add_utf8_byte_range(
    nfa: &mut Nfa,
    lo: &[u8],
    hi: &[u8],
    depth: usize,
    start: StateId,
    end: StateId,
) {
    if depth == lo.len() - 1 {
        nfa.add_byte_edge(start, lo[depth], hi[depth], end);
        return;
    }

    if lo[depth] == hi[depth] {
        let mid = nfa.add_state();
        nfa.add_byte_edge(start, lo[depth], lo[depth], mid);
        add_utf8_byte_range(nfa, lo, hi, depth + 1, mid, end);
        return;
    }

    // lo[depth] with suffixes lo[depth+1..] ..= 0xBF...
    {
        let s = nfa.add_state();
        nfa.add_byte_edge(start, lo[depth], lo[depth], s);
        let mut hi_full = lo.to_vec();
        for b in hi_full.iter_mut().skip(depth + 1) {
            *b = 0xBF;
        }
        add_utf8_byte_range(nfa, lo, &hi_full, depth + 1, s, end);
    }
    // Intermediate lead bytes with full continuation range.
    if lo[depth] + 1 <= hi[depth].saturating_sub(1) {
        let s = nfa.add_state();
        nfa.add_byte_edge(start, lo[depth] + 1, hi[depth] - 1, s);
        let mut lo_min = lo.to_vec();
        let mut hi_max = hi.to_vec();
        for i in depth + 1..lo.len() {
            lo_min[i] = 0x80;
            hi_max[i] = 0xBF;
        }
        add_utf8_byte_range(nfa, &lo_min, &hi_max, depth + 1, s, end);
    }
    // hi[depth] with suffixes 0x80... ..= hi[depth+1..]
    {
        let s = nfa.add_state();
        nfa.add_byte_edge(start, hi[depth], hi[depth], s);
        let mut lo_min = hi.to_vec();
        for b in lo_min.iter_mut().skip(depth + 1) {
            *b = 0x80;
        }
        add_utf8_byte_range(nfa, &lo_min, hi, depth + 1, s, end);
    }
}

// ---------------------------------------------------------------------------
// Grammar → per-rule NFAs (with leaf-rule inlining)
// ---------------------------------------------------------------------------

/// Whether an expression tree is byte-level only (directly or via rules
/// already known to be inlineable).
fn is_inlineable(grammar: &Grammar, expr_id: ExprId, known: &FxHashSet<RuleId>) -> bool {
    match grammar.get_expr(expr_id) {
        Expr::EmptyString
        | Expr::ByteString(_)
        | Expr::CharClass { .. }
        | Expr::CharClassStar { .. } => true,
        Expr::RuleRef(rid) => known.contains(rid),
        Expr::Repeat { rule, .. } => known.contains(rule),
        Expr::Sequence(es) | Expr::Choices(es) => {
            es.iter().all(|e| is_inlineable(grammar, *e, known))
        }
    }
}

/// Fixed point of the inlineable-rule set. Recursive and mutually recursive
/// rules never qualify.
fn find_inlineable_rules(grammar: &Grammar) -> FxHashSet<RuleId> {
    let mut inlineable = FxHashSet::default();
    loop {
        let mut changed = false;
        for (i, rule) in grammar.rules().iter().enumerate() {
            let rid = RuleId(i as u32);
            if !inlineable.contains(&rid) && is_inlineable(grammar, rule.body, &inlineable) {
                inlineable.insert(rid);
                changed = true;
            }
        }
        if !changed {
            return inlineable;
        }
    }
}

/// Build the NFA for an expression, inlining referenced leaf rules so rule
/// boundaries only remain where runtime bookkeeping is actually needed.
fn build_expr(
    grammar: &Grammar,
    nfa: &mut Nfa,
    expr_id: ExprId,
    start: StateId,
    end: StateId,
    inlineable: &FxHashSet<RuleId>,
) {
    match grammar.get_expr(expr_id) {
        Expr::EmptyString => nfa.add_eps(start, end),

        Expr::ByteString(bytes) => {
            if bytes.is_empty() {
                nfa.add_eps(start, end);
                return;
            }
            let mut prev = start;
            for (i, &byte) in bytes.iter().enumerate() {
                let next = if i + 1 == bytes.len() { end } else { nfa.add_state() };
                nfa.add_byte_edge(prev, byte, byte, next);
                prev = next;
            }
        }

        Expr::CharClass { negated, ranges } => {
            build_char_class(nfa, *negated, ranges, start, end);
        }

        Expr::CharClassStar { negated, ranges } => {
            nfa.add_eps(start, end);
            let effective = if *negated {
                complement_codepoint_ranges(ranges)
            } else {
                ranges.clone()
            };
            for &(lo, hi) in &effective {
                add_codepoint_range(nfa, lo, hi, start, start);
            }
        }

        Expr::RuleRef(rule_id) => {
            if inlineable.contains(rule_id) {
                let body = grammar.get_rule(*rule_id).body;
                build_expr(grammar, nfa, body, start, end, inlineable);
            } else {
                nfa.add_call(start, *rule_id, end);
            }
        }

        Expr::Sequence(exprs) => {
            if exprs.is_empty() {
                nfa.add_eps(start, end);
                return;
            }
            let mut prev = start;
            for (i, &eid) in exprs.iter().enumerate() {
                let next = if i + 1 == exprs.len() { end } else { nfa.add_state() };
                build_expr(grammar, nfa, eid, prev, next, inlineable);
                prev = next;
            }
        }

        Expr::Choices(exprs) => {
            for &eid in exprs {
                build_expr(grammar, nfa, eid, start, end, inlineable);
            }
        }

        Expr::Repeat { rule, min, max } => {
            build_repeat(grammar, nfa, *rule, *min, *max, start, end, inlineable);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_repeat(
    grammar: &Grammar,
    nfa: &mut Nfa,
    rule: RuleId,
    min: u32,
    max: Option<u32>,
    start: StateId,
    end: StateId,
    inlineable: &FxHashSet<RuleId>,
) {
    let inline_body = inlineable.contains(&rule).then(|| grammar.get_rule(rule).body);

    // One unit of the repeated rule between two states.
    let mut unit = |nfa: &mut Nfa, from: StateId, to: StateId| match inline_body {
        Some(body) => build_expr(grammar, nfa, body, from, to, inlineable),
        None => nfa.add_call(from, rule, to),
    };

    let mut prev = start;
    for i in 0..min {
        let next = if max == Some(min) && i + 1 == min {
            end
        } else {
            nfa.add_state()
        };
        unit(nfa, prev, next);
        prev = next;
    }

    match max {
        Some(max) => {
            for i in min..max {
                if prev != end {
                    nfa.add_eps(prev, end);
                }
                let next = if i + 1 == max { end } else { nfa.add_state() };
                unit(nfa, prev, next);
                prev = next;
            }
        }
        None => {
            nfa.add_eps(prev, end);
            unit(nfa, prev, prev);
        }
    }
}

/// Build one NFA per grammar rule (indexed by rule id).
pub(crate) fn build_rule_fsms(grammar: &Grammar) -> Vec<RuleFsm<Nfa>> {
    let inlineable = find_inlineable_rules(grammar);
    let mut result = Vec::with_capacity(grammar.num_rules());

    for rule in grammar.rules() {
        let mut nfa = Nfa::new();
        let start = nfa.add_state();
        let end = nfa.add_state();
        build_expr(grammar, &mut nfa, rule.body, start, end, &inlineable);

        let mut accepting = vec![false; nfa.num_states()];
        accepting[end.0 as usize] = true;

        result.push(RuleFsm {
            fsm: nfa,
            start,
            accepting,
        });
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::builder::GrammarBuilder;

    fn single_rule_fsm(build: impl FnOnce(&mut GrammarBuilder) -> ExprId) -> RuleFsm<Nfa> {
        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");
        let body = build(&mut b);
        b.set_rule_body(root, body);
        let grammar = b.build("root").unwrap();
        build_rule_fsms(&grammar).remove(0)
    }

    #[test]
    fn test_epsilon_closure() {
        let mut nfa = Nfa::new();
        let s0 = nfa.add_state();
        let s1 = nfa.add_state();
        let s2 = nfa.add_state();
        let s3 = nfa.add_state();
        nfa.add_eps(s0, s1);
        nfa.add_eps(s1, s2);
        nfa.add_byte_edge(s2, b'x', b'x', s3);

        let mut start = BTreeSet::new();
        start.insert(s0);
        let closure = nfa.epsilon_closure(&start);
        assert!(closure.contains(&s0) && closure.contains(&s1) && closure.contains(&s2));
        assert!(!closure.contains(&s3));
    }

    #[test]
    fn test_byte_string_fsm() {
        let fsm = single_rule_fsm(|b| b.add_byte_string(b"hello"));
        assert!(fsm.accepts(b"hello"));
        assert!(!fsm.accepts(b"hell"));
        assert!(!fsm.accepts(b"helloo"));
    }

    #[test]
    fn test_choices_fsm() {
        let fsm = single_rule_fsm(|b| {
            let cat = b.add_byte_string(b"cat");
            let dog = b.add_byte_string(b"dog");
            b.add_choices(vec![cat, dog])
        });
        assert!(fsm.accepts(b"cat"));
        assert!(fsm.accepts(b"dog"));
        assert!(!fsm.accepts(b"cow"));
    }

    #[test]
    fn test_char_class_star_fsm() {
        let fsm = single_rule_fsm(|b| b.add_char_class_star(false, vec![(0x61, 0x7a)]));
        assert!(fsm.accepts(b""));
        assert!(fsm.accepts(b"abc"));
        assert!(!fsm.accepts(b"aB"));
    }

    #[test]
    fn test_negated_char_class_excludes_surrogates() {
        let fsm = single_rule_fsm(|b| b.add_char_class(true, vec![(0x61, 0x7a)]));
        assert!(!fsm.accepts(b"a"));
        assert!(fsm.accepts(b"A"));
        assert!(fsm.accepts(b"0"));
        assert!(fsm.accepts("é".as_bytes()));
        assert!(fsm.accepts("😀".as_bytes()));
        assert!(!fsm.accepts(b""));
    }

    #[test]
    fn test_determinize_overlapping_ranges() {
        let mut nfa = Nfa::new();
        let start = nfa.add_state();
        let end = nfa.add_state();
        nfa.add_byte_edge(start, b'a', b'c', end);
        nfa.add_byte_edge(start, b'b', b'd', end);

        let dfa = RuleFsm {
            fsm: nfa,
            start,
            accepting: vec![false, true],
        }
        .determinize();
        assert!(dfa.accepts(b"a"));
        assert!(dfa.accepts(b"d"));
        assert!(!dfa.accepts(b"e"));
        assert!(!dfa.accepts(b""));
    }

    #[test]
    fn test_determinize_ambiguous_prefix() {
        // "a" | "ab"
        let fsm = single_rule_fsm(|b| {
            let a = b.add_byte_string(b"a");
            let ab = b.add_byte_string(b"ab");
            b.add_choices(vec![a, ab])
        });
        let dfa = fsm.determinize();
        assert!(dfa.accepts(b"a"));
        assert!(dfa.accepts(b"ab"));
        assert!(!dfa.accepts(b"b"));
        assert!(!dfa.accepts(b"abc"));
    }

    #[test]
    fn test_compact_byte_table() {
        let mut nfa = Nfa::new();
        let s0 = nfa.add_state();
        let s1 = nfa.add_state();
        let s2 = nfa.add_state();
        nfa.add_byte_edge(s0, b'a', b'z', s1);
        nfa.add_byte_edge(s1, b'0', b'9', s2);

        let compact = nfa.compact();
        assert_eq!(compact.num_states(), 3);
        assert_eq!(compact.next_state(s0, b'f'), Some(s1));
        assert_eq!(compact.next_state(s0, b'5'), None);
        assert_eq!(compact.next_state(s1, b'5'), Some(s2));
        assert!(compact.has_byte_edges(s0));
        assert!(!compact.has_byte_edges(s2));
    }

    #[test]
    fn test_compact_dfa_accepts() {
        let fsm = single_rule_fsm(|b| {
            let cc = b.add_char_class(false, vec![(0x61, 0x7a)]);
            let digit = b.add_char_class(false, vec![(0x30, 0x39)]);
            b.add_sequence(vec![cc, digit])
        });
        let compact = fsm.determinize().compact();
        assert!(compact.accepts(b"a5"));
        assert!(!compact.accepts(b"a"));
        assert!(!compact.accepts(b"5a"));
    }

    #[test]
    fn test_unicode_2byte_range() {
        // [à-ÿ]
        let fsm = single_rule_fsm(|b| b.add_char_class(false, vec![(0xE0, 0xFF)]));
        assert!(fsm.accepts("\u{00e0}".as_bytes()));
        assert!(fsm.accepts("\u{00ff}".as_bytes()));
        assert!(!fsm.accepts(b"a"));
    }

    #[test]
    fn test_unicode_4byte_range() {
        // Emoji block U+1F600..U+1F64F
        let fsm = single_rule_fsm(|b| b.add_char_class(false, vec![(0x1F600, 0x1F64F)]));
        assert!(fsm.accepts("😀".as_bytes()));
        assert!(fsm.accepts("🙏".as_bytes()));
        assert!(!fsm.accepts("🚀".as_bytes())); // U+1F680, outside
        assert!(!fsm.accepts(b"a"));
    }

    #[test]
    fn test_mixed_byte_length_range() {
        // U+0041..U+00FF spans 1-byte and 2-byte encodings
        let fsm = single_rule_fsm(|b| b.add_char_class(false, vec![(0x41, 0xFF)]));
        assert!(fsm.accepts(b"A"));
        assert!(fsm.accepts(b"z"));
        assert!(fsm.accepts("\u{00e0}".as_bytes()));
        assert!(!fsm.accepts(b"@"));
    }

    #[test]
    fn test_repeat_bounds() {
        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");
        let unit = b.add_rule("unit");
        let a = b.add_byte_string(b"a");
        b.set_rule_body(unit, a);
        let rep = b.add_repeat(unit, 2, Some(3));
        b.set_rule_body(root, rep);
        let grammar = b.build("root").unwrap();

        let fsm = build_rule_fsms(&grammar).remove(0);
        assert!(!fsm.accepts(b"a"));
        assert!(fsm.accepts(b"aa"));
        assert!(fsm.accepts(b"aaa"));
        assert!(!fsm.accepts(b"aaaa"));
    }

    #[test]
    fn test_recursive_rule_keeps_call_edge() {
        // value ::= "[" value "]" | "x" — recursion cannot be inlined.
        let g = Grammar::from_ebnf(r#"root ::= "[" root "]" | "x""#, "root").unwrap();
        let fsms = build_rule_fsms(&g);
        let has_call = (0..fsms[0].fsm.num_states()).any(|s| {
            fsms[0]
                .fsm
                .edges(StateId(s as u32))
                .iter()
                .any(|e| matches!(e, Edge::Call { .. }))
        });
        assert!(has_call);
    }
}
