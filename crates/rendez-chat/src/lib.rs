//! # rendez-chat
//!
//! Turn-based chat on top of an [`InferenceEngine`](rendez_engine::InferenceEngine).
//!
//! ## Layout
//!
//! - [`trajectory`]: the token sequence with per-token role tags and the
//!   cursors for what has been evaluated, displayed, and rolled out.
//! - [`guide`]: turn structure (message prefixes, suffixes, yielding).
//! - [`session`]: the generate/read-input loop and `/command` handling.
//! - [`options`]: static and runtime-adjustable settings.
//!
//! ### Rolling context
//! Tokens before the priming boundary are never evicted. When the trajectory
//! outgrows `context_token_limit`, the oldest rolling text is written to the
//! transcript (if any) and dropped, cutting at a turn or line boundary.

pub mod command;
pub mod display;
pub mod error;
pub mod guide;
pub mod inference;
pub mod options;
pub mod session;
pub mod trajectory;

pub use command::{parse_command, Command};
pub use display::ChatDisplay;
pub use error::{ChatError, ConfigError, Result};
pub use guide::ChatGuide;
pub use inference::Inference;
pub use options::{ChatOptions, ChatPrefix, DynamicOptions, RoleOpt, Substitution};
pub use session::{LoopState, Session, TurnCounters};
pub use trajectory::{RoleId, Trajectory};
