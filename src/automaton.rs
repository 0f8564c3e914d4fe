//! Incremental grammar automaton.
//!
//! Two engines implement byte-level advance over a [`CompiledGrammar`]:
//!
//! - [`DfaCursor`]: when the whole grammar compiled into one DFA (no call
//!   edges), stepping is a raw byte-table lookup.
//! - [`PushdownAutomaton`]: per-rule DFAs driven as a pushdown automaton.
//!   Intra-rule transitions are DFA steps; predict/complete cycles run only
//!   at rule boundaries (call edges and accepting states).
//!
//! The pushdown engine is versioned: every accepted byte appends one level to
//! flat arenas (live parse points + pending call returns). Rollback truncates
//! levels; nothing is undone in place, so rolling back `k` bytes restores the
//! exact historical state.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashSet, FxHasher};

use crate::bitmask;
use crate::compiled::CompiledGrammar;
use crate::fsm::{Edge, StateId};
use crate::grammar::RuleId;
use crate::tokenizer::Tokenizer;

/// Origin marker for root-level parse points (no caller to return to).
const NO_ORIGIN: u32 = u32::MAX;

/// One live configuration of the pushdown engine: a position in a rule's DFA
/// plus the level at which the rule was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ParsePoint {
    /// Rule being parsed.
    rule: u16,
    /// Position within the rule's DFA.
    state: u16,
    /// Level where this rule was entered (`NO_ORIGIN` for the root).
    origin: u32,
}

impl Hash for ParsePoint {
    #[inline(always)]
    fn hash<H: Hasher>(&self, h: &mut H) {
        // Exactly 8 bytes (repr(C): u16+u16+u32) — hash as one u64.
        let bits =
            (self.rule as u64) | ((self.state as u64) << 16) | ((self.origin as u64) << 32);
        bits.hash(h);
    }
}

/// A pending return: when `0` completes, the parent resumes at `1`.
type CallReturn = (u16, ParsePoint);

/// Scratch arenas for the shared-prefix trie walk in mask computation.
#[derive(Debug, Clone, Default)]
struct WalkScratch {
    points: Vec<ParsePoint>,
    point_offsets: Vec<usize>,
    calls: Vec<CallReturn>,
    call_offsets: Vec<usize>,
    prefix: Vec<u8>,
    queue: Vec<ParsePoint>,
    visited: FxHashSet<ParsePoint>,
    live: Vec<ParsePoint>,
    returns: Vec<CallReturn>,
}

// ---------------------------------------------------------------------------
// Pushdown engine
// ---------------------------------------------------------------------------

/// DFA-driven pushdown automaton over the compiled rule set.
#[derive(Debug, Clone)]
pub(crate) struct PushdownAutomaton {
    /// Flat arena of live parse points across all levels.
    point_arena: Vec<ParsePoint>,
    /// Start offset of each level in `point_arena`.
    point_offsets: Vec<usize>,
    /// Flat arena of pending call returns across all levels.
    call_arena: Vec<CallReturn>,
    call_offsets: Vec<usize>,
    /// Whether the grammar is satisfiable (accepting) at each level.
    completed: Vec<bool>,
    // Reusable scratch buffers for advance/probe.
    buf_queue: Vec<ParsePoint>,
    buf_visited: FxHashSet<ParsePoint>,
    buf_live: Vec<ParsePoint>,
    buf_returns: Vec<CallReturn>,
    walk: WalkScratch,
}

impl PushdownAutomaton {
    pub(crate) fn new(compiled: &CompiledGrammar) -> Self {
        let mut engine = Self {
            point_arena: Vec::with_capacity(128),
            point_offsets: Vec::with_capacity(32),
            call_arena: Vec::with_capacity(64),
            call_offsets: Vec::with_capacity(32),
            completed: Vec::with_capacity(32),
            buf_queue: Vec::new(),
            buf_visited: FxHashSet::default(),
            buf_live: Vec::new(),
            buf_returns: Vec::new(),
            walk: WalkScratch::default(),
        };
        engine.init(compiled);
        engine
    }

    /// Expand the root rule into level 0.
    fn init(&mut self, compiled: &CompiledGrammar) {
        self.point_arena.clear();
        self.point_offsets.clear();
        self.call_arena.clear();
        self.call_offsets.clear();
        self.completed.clear();

        let mut queue = std::mem::take(&mut self.buf_queue);
        let mut visited = std::mem::take(&mut self.buf_visited);
        let mut live = std::mem::take(&mut self.buf_live);
        let mut returns = std::mem::take(&mut self.buf_returns);
        queue.clear();
        visited.clear();
        live.clear();
        returns.clear();
        let mut accepting = false;

        self.expand_rule(compiled, compiled.grammar.root_rule(), NO_ORIGIN, &mut queue, &mut visited);
        self.process_queue(
            compiled, &mut queue, &mut visited, &mut live, &mut returns, &mut accepting, &[],
        );

        self.point_offsets.push(self.point_arena.len());
        self.point_arena.extend_from_slice(&live);
        self.call_offsets.push(self.call_arena.len());
        self.call_arena.extend_from_slice(&returns);
        self.completed.push(accepting);

        queue.clear();
        visited.clear();
        live.clear();
        returns.clear();
        self.buf_queue = queue;
        self.buf_visited = visited;
        self.buf_live = live;
        self.buf_returns = returns;
    }

    /// Advance by one byte. Returns true if any parse point survived; on
    /// false the engine is unchanged.
    pub(crate) fn advance(&mut self, compiled: &CompiledGrammar, byte: u8) -> bool {
        let point_start = match self.point_offsets.last() {
            Some(&start) => start,
            None => return false,
        };
        let point_end = self.point_arena.len();

        let mut queue = std::mem::take(&mut self.buf_queue);
        let mut visited = std::mem::take(&mut self.buf_visited);
        let mut live = std::mem::take(&mut self.buf_live);
        let mut returns = std::mem::take(&mut self.buf_returns);
        queue.clear();
        visited.clear();
        live.clear();
        returns.clear();

        self.scan(
            compiled,
            point_start..point_end,
            byte,
            &mut queue,
            &mut visited,
            &mut live,
        );

        let survived = !(queue.is_empty() && live.is_empty());
        let mut accepting = false;

        if survived {
            if !queue.is_empty() {
                self.process_queue(
                    compiled, &mut queue, &mut visited, &mut live, &mut returns, &mut accepting,
                    &[],
                );
            }
            self.point_offsets.push(self.point_arena.len());
            self.point_arena.extend_from_slice(&live);
            self.call_offsets.push(self.call_arena.len());
            self.call_arena.extend_from_slice(&returns);
            self.completed.push(accepting);
        }

        queue.clear();
        visited.clear();
        live.clear();
        returns.clear();
        self.buf_queue = queue;
        self.buf_visited = visited;
        self.buf_live = live;
        self.buf_returns = returns;

        survived
    }

    /// Advance through all bytes; rolls back partial progress on failure.
    pub(crate) fn advance_bytes(&mut self, compiled: &CompiledGrammar, bytes: &[u8]) -> bool {
        let start = self.position();
        for &byte in bytes {
            if !self.advance(compiled, byte) {
                self.pop_levels(self.position() - start);
                return false;
            }
        }
        true
    }

    /// Scan phase: step each live point by `byte` through its rule DFA.
    /// Successors that can only scan go straight to `live`; the rest queue
    /// for predict/complete processing.
    fn scan(
        &self,
        compiled: &CompiledGrammar,
        range: std::ops::Range<usize>,
        byte: u8,
        queue: &mut Vec<ParsePoint>,
        visited: &mut FxHashSet<ParsePoint>,
        live: &mut Vec<ParsePoint>,
    ) {
        for &point in &self.point_arena[range] {
            let dfa = &compiled.rule_dfas[point.rule as usize];
            let Some(next_state) = dfa.fsm.next_state(StateId(point.state as u32), byte) else {
                continue;
            };
            let next = ParsePoint {
                rule: point.rule,
                state: next_state.0 as u16,
                origin: point.origin,
            };
            let flags = compiled.action(next.rule, next.state).flags;
            if !visited.insert(next) {
                continue;
            }
            if flags.has_byte_edges() && !flags.has_calls() && !flags.is_accepting() {
                live.push(next);
            } else {
                queue.push(next);
            }
        }
    }

    /// Predict/complete until fixed point.
    ///
    /// Rules that complete at the level under construction are tracked so a
    /// nullable rule that is re-predicted (and deduplicated) still advances
    /// its newly registered parent.
    #[allow(clippy::too_many_arguments)]
    fn process_queue(
        &self,
        compiled: &CompiledGrammar,
        queue: &mut Vec<ParsePoint>,
        visited: &mut FxHashSet<ParsePoint>,
        live: &mut Vec<ParsePoint>,
        returns: &mut Vec<CallReturn>,
        accepting: &mut bool,
        extra_returns: &[CallReturn],
    ) {
        let current_level = self.point_offsets.len() as u32;
        let mut completed_here = [0u16; 16];
        let mut completed_count = 0usize;

        let mut idx = 0;
        while idx < queue.len() {
            let point = queue[idx];
            idx += 1;

            let action = compiled.action(point.rule, point.state);

            // Predict: expand call edges.
            for &(callee, resume_state) in &action.calls {
                let parent_after = ParsePoint {
                    rule: point.rule,
                    state: resume_state,
                    origin: point.origin,
                };
                returns.push((callee, parent_after));

                if !self.expand_rule(compiled, RuleId(callee as u32), current_level, queue, visited)
                    && completed_here[..completed_count].contains(&callee)
                {
                    // The callee was already expanded at this level and has
                    // already completed (nullable): advance the parent now.
                    if visited.insert(parent_after) {
                        queue.push(parent_after);
                    }
                }
            }

            // Complete: an accepting point resumes its parents.
            if action.flags.is_accepting() {
                if point.origin == current_level
                    && !completed_here[..completed_count].contains(&point.rule)
                    && completed_count < completed_here.len()
                {
                    completed_here[completed_count] = point.rule;
                    completed_count += 1;
                }
                self.complete(&point, queue, visited, returns, accepting, extra_returns);
            }

            if action.flags.has_byte_edges() {
                live.push(point);
            }
        }
    }

    /// A rule finished: resume every parent that was waiting for it at the
    /// rule's origin level.
    fn complete(
        &self,
        point: &ParsePoint,
        queue: &mut Vec<ParsePoint>,
        visited: &mut FxHashSet<ParsePoint>,
        returns: &mut Vec<CallReturn>,
        accepting: &mut bool,
        extra_returns: &[CallReturn],
    ) {
        if point.origin == NO_ORIGIN {
            *accepting = true;
            return;
        }

        let origin = point.origin as usize;

        // Returns recorded in committed history.
        if origin < self.call_offsets.len() {
            let start = self.call_offsets[origin];
            let end = self
                .call_offsets
                .get(origin + 1)
                .copied()
                .unwrap_or(self.call_arena.len());
            for i in start..end {
                let (awaited, parent_after) = self.call_arena[i];
                if awaited == point.rule && visited.insert(parent_after) {
                    queue.push(parent_after);
                }
            }
        }

        // Returns recorded while building the current level.
        if origin == self.point_offsets.len() {
            for i in 0..returns.len() {
                let (awaited, parent_after) = returns[i];
                if awaited == point.rule && visited.insert(parent_after) {
                    queue.push(parent_after);
                }
            }
            for &(awaited, parent_after) in extra_returns {
                if awaited == point.rule && visited.insert(parent_after) {
                    queue.push(parent_after);
                }
            }
        }
    }

    /// Queue a rule's DFA start state. Returns false if deduplicated.
    fn expand_rule(
        &self,
        compiled: &CompiledGrammar,
        rule: RuleId,
        origin: u32,
        queue: &mut Vec<ParsePoint>,
        visited: &mut FxHashSet<ParsePoint>,
    ) -> bool {
        let dfa = &compiled.rule_dfas[rule.0 as usize];
        let point = ParsePoint {
            rule: rule.0 as u16,
            state: dfa.start.0 as u16,
            origin,
        };
        if visited.insert(point) {
            queue.push(point);
            true
        } else {
            false
        }
    }

    /// Step live points by one byte without committing to the arenas; used by
    /// the mask trie walk. Results land in `live`/`returns`.
    #[allow(clippy::too_many_arguments)]
    fn probe_advance(
        &self,
        compiled: &CompiledGrammar,
        points: &[ParsePoint],
        extra_returns: &[CallReturn],
        byte: u8,
        queue: &mut Vec<ParsePoint>,
        visited: &mut FxHashSet<ParsePoint>,
        live: &mut Vec<ParsePoint>,
        returns: &mut Vec<CallReturn>,
    ) -> bool {
        queue.clear();
        visited.clear();
        live.clear();
        returns.clear();

        for &point in points {
            let dfa = &compiled.rule_dfas[point.rule as usize];
            let Some(next_state) = dfa.fsm.next_state(StateId(point.state as u32), byte) else {
                continue;
            };
            let next = ParsePoint {
                rule: point.rule,
                state: next_state.0 as u16,
                origin: point.origin,
            };
            let flags = compiled.action(next.rule, next.state).flags;
            if !visited.insert(next) {
                continue;
            }
            if flags.has_byte_edges() && !flags.has_calls() && !flags.is_accepting() {
                live.push(next);
            } else {
                queue.push(next);
            }
        }

        if queue.is_empty() && live.is_empty() {
            return false;
        }
        if !queue.is_empty() {
            let mut accepting = false;
            self.process_queue(
                compiled, queue, visited, live, returns, &mut accepting, extra_returns,
            );
        }
        true
    }

    /// Whether the grammar is satisfiable at the current position.
    pub(crate) fn is_accepting(&self) -> bool {
        self.completed.last().copied().unwrap_or(false)
    }

    /// Whether any byte could still be accepted.
    pub(crate) fn has_live_points(&self) -> bool {
        !self.live_points().is_empty()
    }

    fn live_points(&self) -> &[ParsePoint] {
        match self.point_offsets.last() {
            Some(&start) => &self.point_arena[start..],
            None => &[],
        }
    }

    fn live_returns(&self) -> &[CallReturn] {
        match self.call_offsets.last() {
            Some(&start) => &self.call_arena[start..],
            None => &[],
        }
    }

    /// Bytes consumed so far.
    pub(crate) fn position(&self) -> usize {
        self.point_offsets.len().saturating_sub(1)
    }

    /// Truncate the last `count` levels (level 0 is never popped).
    pub(crate) fn pop_levels(&mut self, count: usize) {
        for _ in 0..count {
            if self.point_offsets.len() > 1 {
                let start = self.point_offsets.pop().expect("len checked");
                self.point_arena.truncate(start);
                let call_start = self.call_offsets.pop().expect("parallel to point_offsets");
                self.call_arena.truncate(call_start);
                self.completed.pop();
            }
        }
    }

    pub(crate) fn reset(&mut self, compiled: &CompiledGrammar) {
        self.init(compiled);
    }

    /// Hash of the current live configuration, for mask memoization.
    pub(crate) fn state_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for point in self.live_points() {
            point.hash(&mut hasher);
        }
        for &(awaited, ref parent) in self.live_returns() {
            awaited.hash(&mut hasher);
            parent.hash(&mut hasher);
        }
        self.is_accepting().hash(&mut hasher);
        hasher.finish()
    }

    /// The longest byte run the grammar forces from the current state: every
    /// live point must agree on a single next byte, with no rule boundary or
    /// acceptance choice in between. The engine is restored afterwards.
    pub(crate) fn forced_bytes(&mut self, compiled: &CompiledGrammar) -> Vec<u8> {
        let start_pos = self.position();
        let mut out = Vec::new();

        loop {
            if self.is_accepting() {
                break;
            }
            let points = self.live_points();
            if points.is_empty() {
                break;
            }

            let mut next_byte: Option<u8> = None;
            let mut conflict = false;
            for point in points {
                let flags = compiled.action(point.rule, point.state).flags;
                if flags.has_calls() || flags.is_accepting() {
                    conflict = true;
                    break;
                }
                let dfa = &compiled.rule_dfas[point.rule as usize];
                let edges = dfa.fsm.edges(StateId(point.state as u32));
                match (next_byte, deterministic_byte(edges)) {
                    (_, None) => {
                        conflict = true;
                        break;
                    }
                    (None, some) => next_byte = some,
                    (Some(a), Some(b)) if a == b => {}
                    _ => {
                        conflict = true;
                        break;
                    }
                }
            }

            let Some(byte) = next_byte else { break };
            if conflict || !self.advance(compiled, byte) {
                break;
            }
            out.push(byte);
        }

        let advanced = self.position() - start_pos;
        self.pop_levels(advanced);
        out
    }

    /// Fill `mask` with the acceptable-token set for the current state.
    ///
    /// Strategy: memo lookup, then OR the precomputed accepted masks of the
    /// live `(rule, state)` pairs, then trie-walk the vocabulary for the
    /// remaining uncertain tokens.
    pub(crate) fn fill_mask(
        &mut self,
        compiled: &CompiledGrammar,
        tokenizer: &Tokenizer,
        mask: &mut [u32],
    ) {
        let hash = self.state_hash();
        if compiled.cached_mask(hash, mask) {
            return;
        }

        let mut seen: FxHashSet<(u16, u16)> = FxHashSet::default();
        let mut need_walk = false;
        for point in self.live_points() {
            if !seen.insert((point.rule, point.state)) {
                continue;
            }
            if let Some(tm) = compiled
                .token_masks
                .get(&(point.rule as u32, point.state as u32))
            {
                for (j, &word) in tm.accepted.iter().enumerate() {
                    if j < mask.len() {
                        mask[j] |= word;
                    }
                }
                if !tm.uncertain.is_empty() {
                    need_walk = true;
                }
            }
        }

        if need_walk {
            self.walk_uncertain(compiled, tokenizer, mask);
        }
        compiled.store_mask(hash, mask);
    }

    /// Probe every still-unset vocabulary token, reusing work across tokens
    /// that share byte prefixes (the sorted vocabulary is a flattened trie).
    fn walk_uncertain(
        &mut self,
        compiled: &CompiledGrammar,
        tokenizer: &Tokenizer,
        mask: &mut [u32],
    ) {
        let sorted = tokenizer.sorted_vocab();
        let trie_end = tokenizer.trie_subtree_end();

        let mut w = std::mem::take(&mut self.walk);
        w.points.clear();
        w.point_offsets.clear();
        w.calls.clear();
        w.call_offsets.clear();
        w.prefix.clear();

        // Walk level 0 = the current engine state.
        w.point_offsets.push(0);
        w.points.extend_from_slice(self.live_points());
        w.call_offsets.push(0);
        w.calls.extend_from_slice(self.live_returns());

        let mut i = 0;
        while i < sorted.len() {
            let (token_id, ref bytes) = sorted[i];
            if bytes.is_empty() || bitmask::get_bit(mask, token_id as usize) {
                i += 1;
                continue;
            }

            // Rewind the walk stack to the shared prefix.
            let common = longest_common_prefix(bytes, &w.prefix);
            if common < w.prefix.len() {
                let depth = common + 1; // keep levels 0..=common
                if depth < w.point_offsets.len() {
                    let p_end = w.point_offsets[depth];
                    w.points.truncate(p_end);
                    w.point_offsets.truncate(depth);
                    let c_end = w.call_offsets[depth];
                    w.calls.truncate(c_end);
                    w.call_offsets.truncate(depth);
                }
                w.prefix.truncate(common);
            }

            // Advance through the remaining bytes of this token.
            let mut dead = false;
            for &byte in &bytes[common..] {
                let p_start = *w.point_offsets.last().expect("walk has level 0");
                let c_start = *w.call_offsets.last().expect("walk has level 0");
                // Split borrows: probe reads the old levels, appends to bufs.
                let (points, calls) = (&w.points[p_start..], &w.calls[c_start..]);
                let ok = self.probe_advance(
                    compiled,
                    points,
                    calls,
                    byte,
                    &mut w.queue,
                    &mut w.visited,
                    &mut w.live,
                    &mut w.returns,
                );
                if ok {
                    w.point_offsets.push(w.points.len());
                    w.points.extend_from_slice(&w.live);
                    w.call_offsets.push(w.calls.len());
                    w.calls.extend_from_slice(&w.returns);
                    w.prefix.push(byte);
                } else {
                    // Dead at the first byte: the whole subtree sharing this
                    // prefix dies with it.
                    if w.prefix.is_empty() {
                        i = trie_end[i];
                    } else {
                        i += 1;
                    }
                    dead = true;
                    break;
                }
            }

            if !dead {
                bitmask::set_bit(mask, token_id as usize);
                i += 1;
            }
        }

        self.walk = w;
    }
}

// ---------------------------------------------------------------------------
// Single-DFA fast path
// ---------------------------------------------------------------------------

/// Cursor over a single root DFA; active when the compiled grammar has no
/// call edges. Stepping is a bare byte-table lookup.
#[derive(Debug, Clone)]
pub(crate) struct DfaCursor {
    rule: usize,
    state: u16,
    /// Previous state per committed advance unit, for rollback.
    trail: Vec<u16>,
}

impl DfaCursor {
    pub(crate) fn new(compiled: &CompiledGrammar) -> Self {
        let rule = compiled.grammar.root_rule().0 as usize;
        Self {
            rule,
            state: compiled.rule_dfas[rule].start.0 as u16,
            trail: Vec::new(),
        }
    }

    /// Advance through `bytes` as one unit. On failure the cursor is
    /// unchanged.
    pub(crate) fn advance_bytes(&mut self, compiled: &CompiledGrammar, bytes: &[u8]) -> bool {
        let bt = compiled.rule_dfas[self.rule].fsm.byte_table();
        let mut state = self.state as usize;
        for &byte in bytes {
            let next = bt[state * 256 + byte as usize];
            if next == crate::fsm::NO_TRANSITION {
                return false;
            }
            state = next as usize;
        }
        self.trail.push(self.state);
        self.state = state as u16;
        true
    }

    /// Undo the last `units` committed advance units.
    pub(crate) fn rollback(&mut self, units: usize) {
        for _ in 0..units.min(self.trail.len()) {
            self.state = self.trail.pop().expect("bounded by trail length");
        }
    }

    pub(crate) fn is_accepting(&self, compiled: &CompiledGrammar) -> bool {
        compiled.rule_dfas[self.rule].accepting[self.state as usize]
    }

    pub(crate) fn has_live_points(&self, compiled: &CompiledGrammar) -> bool {
        compiled.rule_dfas[self.rule]
            .fsm
            .has_byte_edges(StateId(self.state as u32))
    }

    pub(crate) fn state_hash(&self) -> u64 {
        ((self.rule as u64) << 16) | self.state as u64
    }

    pub(crate) fn reset(&mut self, compiled: &CompiledGrammar) {
        self.state = compiled.rule_dfas[self.rule].start.0 as u16;
        self.trail.clear();
    }

    /// Deterministic byte run from the current state (pure walk).
    pub(crate) fn forced_bytes(&self, compiled: &CompiledGrammar) -> Vec<u8> {
        let dfa = &compiled.rule_dfas[self.rule];
        let bt = dfa.fsm.byte_table();
        let mut out = Vec::new();
        let mut state = self.state as usize;
        loop {
            if dfa.accepting[state] {
                break;
            }
            let Some(byte) = deterministic_byte(dfa.fsm.edges(StateId(state as u32))) else {
                break;
            };
            let next = bt[state * 256 + byte as usize];
            if next == crate::fsm::NO_TRANSITION {
                break;
            }
            out.push(byte);
            state = next as usize;
        }
        out
    }

    /// Fill `mask` for the current DFA state: precomputed words plus a
    /// byte-table trie walk for uncertain tokens.
    pub(crate) fn fill_mask(
        &self,
        compiled: &CompiledGrammar,
        tokenizer: &Tokenizer,
        mask: &mut [u32],
    ) {
        let hash = self.state_hash();
        if compiled.cached_mask(hash, mask) {
            return;
        }

        let key = (self.rule as u32, self.state as u32);
        let mut need_walk = false;
        if let Some(tm) = compiled.token_masks.get(&key) {
            for (j, &word) in tm.accepted.iter().enumerate() {
                if j < mask.len() {
                    mask[j] |= word;
                }
            }
            need_walk = !tm.uncertain.is_empty();
        }

        if need_walk {
            self.walk_uncertain(compiled, tokenizer, mask);
        }
        compiled.store_mask(hash, mask);
    }

    fn walk_uncertain(&self, compiled: &CompiledGrammar, tokenizer: &Tokenizer, mask: &mut [u32]) {
        let sorted = tokenizer.sorted_vocab();
        let trie_end = tokenizer.trie_subtree_end();
        let bt = compiled.rule_dfas[self.rule].fsm.byte_table();

        let mut stack: Vec<u16> = vec![self.state];
        let mut prefix: Vec<u8> = Vec::new();

        let mut i = 0;
        while i < sorted.len() {
            let (token_id, ref bytes) = sorted[i];
            if bytes.is_empty() || bitmask::get_bit(mask, token_id as usize) {
                i += 1;
                continue;
            }

            let common = longest_common_prefix(bytes, &prefix);
            if common < prefix.len() {
                stack.truncate(common + 1);
                prefix.truncate(common);
            }

            let mut dead = false;
            for &byte in &bytes[common..] {
                let state = *stack.last().expect("stack holds the start state") as usize;
                let next = bt[state * 256 + byte as usize];
                if next == crate::fsm::NO_TRANSITION {
                    if prefix.is_empty() {
                        i = trie_end[i];
                    } else {
                        i += 1;
                    }
                    dead = true;
                    break;
                }
                stack.push(next);
                prefix.push(byte);
            }

            if !dead {
                bitmask::set_bit(mask, token_id as usize);
                i += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The matcher-facing engine: single-DFA cursor when possible, pushdown
/// automaton otherwise.
#[derive(Debug, Clone)]
pub(crate) enum Engine {
    Dfa(DfaCursor),
    Pushdown(Box<PushdownAutomaton>),
}

impl Engine {
    pub(crate) fn new(compiled: &CompiledGrammar) -> Self {
        if compiled.is_single_dfa {
            Engine::Dfa(DfaCursor::new(compiled))
        } else {
            Engine::Pushdown(Box::new(PushdownAutomaton::new(compiled)))
        }
    }

    /// Advance through `bytes` as one committed unit (all-or-nothing).
    pub(crate) fn advance_bytes(&mut self, compiled: &CompiledGrammar, bytes: &[u8]) -> bool {
        match self {
            Engine::Dfa(cursor) => cursor.advance_bytes(compiled, bytes),
            Engine::Pushdown(engine) => engine.advance_bytes(compiled, bytes),
        }
    }

    /// Undo one committed unit of `byte_len` bytes.
    pub(crate) fn rollback_unit(&mut self, byte_len: usize) {
        match self {
            Engine::Dfa(cursor) => cursor.rollback(1),
            Engine::Pushdown(engine) => engine.pop_levels(byte_len),
        }
    }

    pub(crate) fn is_accepting(&self, compiled: &CompiledGrammar) -> bool {
        match self {
            Engine::Dfa(cursor) => cursor.is_accepting(compiled),
            Engine::Pushdown(engine) => engine.is_accepting(),
        }
    }

    /// Whether any byte could still be accepted (false = no extension).
    pub(crate) fn has_live_points(&self, compiled: &CompiledGrammar) -> bool {
        match self {
            Engine::Dfa(cursor) => cursor.has_live_points(compiled),
            Engine::Pushdown(engine) => engine.has_live_points(),
        }
    }

    pub(crate) fn forced_bytes(&mut self, compiled: &CompiledGrammar) -> Vec<u8> {
        match self {
            Engine::Dfa(cursor) => cursor.forced_bytes(compiled),
            Engine::Pushdown(engine) => engine.forced_bytes(compiled),
        }
    }

    pub(crate) fn fill_mask(
        &mut self,
        compiled: &CompiledGrammar,
        tokenizer: &Tokenizer,
        mask: &mut [u32],
    ) {
        match self {
            Engine::Dfa(cursor) => cursor.fill_mask(compiled, tokenizer, mask),
            Engine::Pushdown(engine) => engine.fill_mask(compiled, tokenizer, mask),
        }
    }

    pub(crate) fn reset(&mut self, compiled: &CompiledGrammar) {
        match self {
            Engine::Dfa(cursor) => cursor.reset(compiled),
            Engine::Pushdown(engine) => engine.reset(compiled),
        }
    }
}

/// The single byte all byte edges of a state agree on, if any.
fn deterministic_byte(edges: &[Edge]) -> Option<u8> {
    let mut result = None;
    for edge in edges {
        if let Edge::Byte { lo, hi, .. } = edge {
            if lo != hi {
                return None;
            }
            match result {
                None => result = Some(*lo),
                Some(b) if b == *lo => {}
                _ => return None,
            }
        }
    }
    result
}

fn longest_common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
