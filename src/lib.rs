//! rendezllama: turn-based chat with a local language model.
//!
//! This crate re-exports the workspace crates:
//! - [`vocab`]: tokenizer interface, reference piece tokenizer, alias substitution
//! - [`sampling`]: adjustment chains and token picking
//! - [`engine`]: the inference engine interface and reference backends
//! - [`chat`]: trajectory, turn guide, options, and the session loop

pub use rendez_chat as chat;
pub use rendez_engine as engine;
pub use rendez_sampling as sampling;
pub use rendez_vocab as vocab;

pub use rendez_chat::{ChatError, ChatOptions, Session};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
