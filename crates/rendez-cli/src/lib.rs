//! # rendez-cli
//!
//! Wires the chat pieces together for the `rendezllama` binary:
//! options file → flag overrides → vocabulary → engine → session.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use rendez_chat::options::apply_substitution;
use rendez_chat::{ChatError, ChatOptions, Session};
use rendez_engine::HashEngine;
use rendez_vocab::{PieceTokenizer, Vocabulary};
use tracing::info;

/// Context size of the reference engine when no limit is configured.
pub const DEFAULT_MODEL_TOKEN_LIMIT: usize = 2048;

/// Flags for the `chat` subcommand. Each one overrides the options file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ChatArgs {
    /// JSON options file.
    #[arg(long = "x_setting", alias = "setting")]
    pub x_setting: Option<PathBuf>,

    /// Name of the user's character.
    #[arg(long)]
    pub protagonist: Option<String>,

    /// Name of the model's character.
    #[arg(long)]
    pub confidant: Option<String>,

    /// JSON piece table for the tokenizer.
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// File with the fixed priming prompt.
    #[arg(long = "x_priming")]
    pub x_priming: Option<PathBuf>,

    /// File with the initial rolling conversation.
    #[arg(long = "x_rolling")]
    pub x_rolling: Option<PathBuf>,

    /// File with a hidden prompt shown before each answer.
    #[arg(long = "x_answer")]
    pub x_answer: Option<PathBuf>,

    /// Transcript of text rolled out of the context.
    #[arg(long = "o_rolling")]
    pub o_rolling: Option<PathBuf>,

    /// Character that starts a command line.
    #[arg(long = "command_prefix_char")]
    pub command_prefix_char: Option<char>,

    #[arg(long = "thread_count")]
    pub thread_count: Option<usize>,

    /// Tokens evaluated per engine call.
    #[arg(long = "batch_count")]
    pub batch_count: Option<usize>,

    #[arg(long = "model_token_limit")]
    pub model_token_limit: Option<usize>,

    #[arg(long = "context_token_limit")]
    pub context_token_limit: Option<usize>,

    /// Read raw lines and print only generated text.
    #[arg(long = "coprocess_mode_on")]
    pub coprocess_mode_on: bool,

    /// Sampling seed.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ChatArgs {
    fn apply(&self, opt: &mut ChatOptions) {
        if let Some(name) = &self.protagonist {
            opt.protagonist = name.clone();
        }
        if let Some(name) = &self.confidant {
            opt.confidant = name.clone();
        }
        for (flag, slot) in [
            (&self.tokenizer, &mut opt.tokenizer),
            (&self.x_priming, &mut opt.x_priming),
            (&self.x_rolling, &mut opt.x_rolling),
            (&self.x_answer, &mut opt.x_answer),
            (&self.o_rolling, &mut opt.o_rolling),
        ] {
            if flag.is_some() {
                slot.clone_from(flag);
            }
        }
        if let Some(c) = self.command_prefix_char {
            opt.command_prefix_char = c;
        }
        if let Some(n) = self.thread_count {
            opt.thread_count = n;
        }
        if let Some(n) = self.batch_count {
            opt.batch_count = n;
        }
        if let Some(n) = self.model_token_limit {
            opt.model_token_limit = n;
        }
        if let Some(n) = self.context_token_limit {
            opt.context_token_limit = n;
        }
        if self.coprocess_mode_on {
            opt.coprocess_mode_on = true;
        }
        if self.seed.is_some() {
            opt.sampling.seed = self.seed;
        }
    }
}

/// Load the options file (if any), apply flags, and initialize.
pub fn load_options(args: &ChatArgs) -> Result<ChatOptions, ChatError> {
    let mut opt = match &args.x_setting {
        Some(path) => ChatOptions::from_file(path)?,
        None => ChatOptions::default(),
    };
    args.apply(&mut opt);
    opt.initialize()?;
    Ok(opt)
}

/// Build the vocabulary named by the options and register its aliases.
pub fn load_vocabulary(opt: &ChatOptions) -> Result<Vocabulary, ChatError> {
    let tokenizer = match &opt.tokenizer {
        Some(path) => PieceTokenizer::from_file(path)?,
        None => PieceTokenizer::new(),
    };
    let mut vocab = Vocabulary::new(tokenizer);
    apply_substitution(&mut vocab, &opt.substitution)?;
    Ok(vocab)
}

/// Run a chat session over the reference engine until `input` runs out.
pub fn run_chat<R: BufRead>(
    args: &ChatArgs,
    input: &mut R,
    out: Box<dyn Write + Send>,
    eout: Box<dyn Write + Send>,
) -> Result<(), ChatError> {
    let opt = load_options(args)?;
    let vocab = load_vocabulary(&opt)?;

    let limit = match opt.model_token_limit {
        0 => DEFAULT_MODEL_TOKEN_LIMIT,
        n => n,
    };
    // The reference tokenizer grows as it meets new text, so leave headroom.
    // Sampling only ever picks IDs the vocabulary knows.
    let vocab_size = vocab.cardinality().max(256);
    let engine = HashEngine::new(vocab_size, limit, opt.sampling.seed.unwrap_or(0));

    let mut session = Session::new(opt, vocab, Box::new(engine), out, eout)?;
    info!(session = %session.id(), "chat ready");
    session.run(input)
}
