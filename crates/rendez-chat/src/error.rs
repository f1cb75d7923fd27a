use std::path::PathBuf;

use rendez_engine::EngineError;
use rendez_sampling::SamplingError;
use rendez_vocab::VocabError;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Problems found while loading or validating chat options. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Please provide a --{0} name")]
    MissingName(&'static str),
    #[error("Unknown special token: {0}")]
    UnknownSpecialToken(String),
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot create {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid options in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Priming prompt needs {needed} tokens but context_token_limit is {limit}")]
    PrimingTooLong { needed: usize, limit: usize },
    #[error("Invalid option: {0}")]
    Invalid(String),
}

/// Top-level error type for a chat session.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Vocabulary error: {0}")]
    Vocab(#[from] VocabError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChatError::Config(ConfigError::MissingName(_)) => 64,
            ChatError::Config(ConfigError::UnknownSpecialToken(_))
            | ChatError::Vocab(VocabError::UnknownSpecialToken(_)) => 65,
            _ => 1,
        }
    }
}
