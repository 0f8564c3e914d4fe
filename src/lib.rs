//! Grammar-constrained token masking for LLM decoding.
//!
//! This crate restricts the next-token choices of a language model to the
//! tokens consistent with a formal grammar (regex, Lark-style CFG, or JSON
//! Schema). Given a grammar and a tokenizer vocabulary, every decoding step
//! produces a bitmask over the vocabulary marking legal continuations, and a
//! per-sequence [`Matcher`] keeps parsing state as tokens are committed.
//!
//! # Usage
//!
//! The typical flow is:
//!
//! 1. **Build a tokenizer** from your LLM's vocabulary
//! 2. **Describe the grammar** as a [`GrammarSpec`] (regex / Lark / JSON Schema)
//! 3. **Create a matcher** (compiles the grammar into per-rule DFAs + token masks)
//! 4. **Loop**: compute mask → filter logits → sample → `consume_token`
//!
//! ```rust
//! use std::sync::Arc;
//! use tokenmask::{GrammarSpec, Matcher, Tokenizer};
//!
//! let tokenizer = Arc::new(Tokenizer::byte_level());
//! let spec = GrammarSpec::from_regex("(yes|no)");
//! let mut matcher = Matcher::new(tokenizer.clone(), &spec, 0).unwrap();
//!
//! let bias = matcher.compute_logit_bias();
//! let y = tokenizer.tokenize_str("y")[0];
//! let x = tokenizer.tokenize_str("x")[0];
//! assert_eq!(bias[y as usize], 200); // "y" can start "yes"
//! assert_eq!(bias[x as usize], 0);   // "x" can start nothing
//!
//! assert!(matcher.consume_token(y));
//! ```
//!
//! # Batch decoding
//!
//! For N concurrent sequences, hold N matchers and let an [`Executor`] fill
//! one [`TokenBitmask`] row per matcher in parallel:
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tokenmask::{Executor, GrammarSpec, Matcher, TokenBitmask, Tokenizer};
//!
//! let tokenizer = Arc::new(Tokenizer::byte_level());
//! let spec = GrammarSpec::from_regex("[0-9]+");
//! let m0 = Mutex::new(Matcher::new(tokenizer.clone(), &spec, 0).unwrap());
//! let m1 = Mutex::new(Matcher::new(tokenizer.clone(), &spec, 0).unwrap());
//!
//! let executor = Executor::new(None).unwrap();
//! let mut mask = TokenBitmask::allocate(2, tokenizer.vocab_size());
//! executor
//!     .fill_next_token_bitmask_par(&[(&m0, 0), (&m1, 1)], &mut mask)
//!     .unwrap();
//! ```
//!
//! # Modules
//!
//! - [`grammar`] -- Grammar IR, builder, EBNF/Lark front-end, [`GrammarSpec`]
//! - [`regex`] -- Regex to grammar conversion
//! - [`json_schema`] -- JSON Schema to grammar conversion
//! - [`tokenizer`] -- Tokenizer vocabulary handling
//! - [`compiled`] -- Pre-compiled grammar (DFAs + token masks)
//! - [`matcher`] -- Runtime matcher (consume tokens, masks, rollback, fast-forward)
//! - [`executor`] -- Parallel mask fan-out over many matchers
//! - [`bitmask`] -- Token bitmask utilities and the row-major mask buffer

pub mod bitmask;
pub mod compiled;
pub mod executor;
pub(crate) mod fsm;
pub mod grammar;
pub mod json_schema;
pub mod matcher;
pub mod regex;
pub mod tokenizer;

mod automaton;

pub use bitmask::TokenBitmask;
pub use compiled::CompiledGrammar;
pub use executor::Executor;
pub use grammar::{Grammar, GrammarSource, GrammarSpec};
pub use json_schema::JsonSchemaOptions;
pub use matcher::{Matcher, StopReason};
pub use tokenizer::{Tokenizer, TokenizerSlice, VocabType};

/// Token id within a tokenizer vocabulary.
pub type TokenId = u32;
