//! # rendez-engine
//!
//! The "narrow waist" between the chat loop and a language model. Defines the
//! [`InferenceEngine`] trait that evaluates tokens into a positional context
//! and exposes next-token logits. Implementations can swap CPU/GPU/FFI
//! backends without changing chat code.
//!
//! ## Design Notes
//!
//! ### Positional Context
//! The engine holds one context (a KV cache in real backends). `eval` writes
//! tokens starting at `n_past`; everything at or beyond `n_past` is replaced.
//! `truncate` discards positions without evaluating anything.
//!
//! ### Reference Backends
//! [`HashEngine`] produces deterministic pseudo-random logits for demos and
//! smoke tests. [`ScriptedEngine`] emits a fixed token script and can inject
//! evaluation failures, which makes chat-loop behavior testable.

mod backends;

pub use backends::{HashEngine, ScriptedEngine};
pub use rendez_vocab::TokenId;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Evaluation failed at position {position}: {reason}")]
    Eval { position: usize, reason: String },
    #[error("Context overflow: {needed} positions exceed limit {limit}")]
    ContextOverflow { needed: usize, limit: usize },
    #[error("Position gap: eval at {n_past} but context holds {held}")]
    PositionGap { n_past: usize, held: usize },
}

/// The core engine trait. The chat loop depends on this behavior only.
pub trait InferenceEngine: Send {
    /// Maximum number of positions the context can hold.
    fn context_limit(&self) -> usize;

    /// Length of the logits vector.
    fn vocab_size(&self) -> usize;

    /// Set worker counts for single-token and batch evaluation.
    fn set_threads(&mut self, thread_count: usize, batch_thread_count: usize);

    /// Discard every position at or beyond `n_past`.
    fn truncate(&mut self, n_past: usize);

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()`.
    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()>;

    /// Logits for the token following the last evaluated position.
    fn logits(&self) -> &[f32];
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn context_limit(&self) -> usize {
        (**self).context_limit()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn set_threads(&mut self, thread_count: usize, batch_thread_count: usize) {
        (**self).set_threads(thread_count, batch_thread_count)
    }

    fn truncate(&mut self, n_past: usize) {
        (**self).truncate(n_past)
    }

    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()> {
        (**self).eval(tokens, n_past)
    }

    fn logits(&self) -> &[f32] {
        (**self).logits()
    }
}
