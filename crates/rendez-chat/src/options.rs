//! Chat options loaded from JSON, overridable from the command line and `/set`.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use rendez_sampling::SamplingConfig;
use rendez_vocab::Vocabulary;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// A configured role: either a bare prefix or a prefix/suffix pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatPrefix {
    Plain(String),
    Full {
        prefix: String,
        #[serde(default)]
        suffix: String,
    },
}

impl ChatPrefix {
    fn parts(&self) -> (&str, &str) {
        match self {
            ChatPrefix::Plain(prefix) => (prefix, ""),
            ChatPrefix::Full { prefix, suffix } => (prefix, suffix),
        }
    }
}

impl From<&str> for ChatPrefix {
    fn from(prefix: &str) -> Self {
        ChatPrefix::Plain(prefix.to_string())
    }
}

/// Resolved prefix and suffix of one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleOpt {
    pub prefix: String,
    pub suffix: String,
}

/// A special token reachable by alias. The first resolvable candidate wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialToken {
    pub alias: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Substitution {
    /// Replaced by the protagonist name in prompts and prefixes.
    pub protagonist_alias: String,
    /// Replaced by the confidant name in prompts and prefixes.
    pub confidant_alias: String,
    pub bos_token_alias: String,
    pub eos_token_alias: String,
    pub special_tokens: Vec<SpecialToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    pub protagonist: String,
    pub confidant: String,
    pub substitution: Substitution,
    pub chat_prefixes: Vec<ChatPrefix>,
    #[serde(skip_deserializing)]
    pub roles: Vec<RoleOpt>,

    /// JSON piece table for the reference tokenizer.
    pub tokenizer: Option<PathBuf>,
    pub x_priming: Option<PathBuf>,
    pub x_rolling: Option<PathBuf>,
    pub x_answer: Option<PathBuf>,
    /// Transcript of everything rolled out of the context.
    pub o_rolling: Option<PathBuf>,

    pub priming_prompt: String,
    pub rolling_prompt: String,
    pub answer_prompt: String,

    pub command_prefix_char: char,
    pub thread_count: usize,
    /// Threads for batch evaluation. 0 means available parallelism.
    pub batch_thread_count: usize,
    pub batch_count: usize,
    pub sentence_limit: usize,
    pub sentence_token_limit: usize,
    /// Defaults to the engine's context limit.
    pub model_token_limit: usize,
    /// Defaults to `model_token_limit`.
    pub context_token_limit: usize,
    pub coprocess_mode_on: bool,
    pub sentence_terminals: BTreeSet<String>,
    #[serde(skip)]
    pub multiline_confidant_on: bool,

    pub sampling: SamplingConfig,
}

fn default_sentence_terminals() -> BTreeSet<String> {
    ["!", ".", "?", "…"].iter().map(|s| s.to_string()).collect()
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            protagonist: String::new(),
            confidant: String::new(),
            substitution: Substitution::default(),
            chat_prefixes: Vec::new(),
            roles: Vec::new(),
            tokenizer: None,
            x_priming: None,
            x_rolling: None,
            x_answer: None,
            o_rolling: None,
            priming_prompt: String::new(),
            rolling_prompt: String::new(),
            answer_prompt: String::new(),
            command_prefix_char: '/',
            thread_count: 1,
            batch_thread_count: 0,
            batch_count: 512,
            sentence_limit: 0,
            sentence_token_limit: 0,
            model_token_limit: 0,
            context_token_limit: 0,
            coprocess_mode_on: false,
            sentence_terminals: default_sentence_terminals(),
            multiline_confidant_on: false,
            sampling: SamplingConfig::default(),
        }
    }
}

impl ChatOptions {
    /// Parse a JSON options file. Relative paths inside it resolve against
    /// the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut opt: ChatOptions =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        opt.resolve_paths(base);
        debug!(path = %path.display(), "loaded chat options");
        Ok(opt)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for slot in [
            &mut self.tokenizer,
            &mut self.x_priming,
            &mut self.x_rolling,
            &mut self.x_answer,
            &mut self.o_rolling,
        ] {
            if let Some(p) = slot.as_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
    }

    /// Read prompt files, validate names, substitute aliases, resolve roles.
    pub fn initialize(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = self.x_priming.clone() {
            self.priming_prompt.push_str(&read_prompt(&path)?);
        }
        if let Some(path) = self.x_rolling.clone() {
            let text = read_prompt(&path)?;
            self.parse_rolling_prompt(&text);
        }
        if let Some(path) = self.x_answer.clone() {
            self.answer_prompt.push_str(&read_prompt(&path)?);
            if !self.answer_prompt.ends_with('\n') {
                self.answer_prompt.push('\n');
            }
        }

        if self.chat_prefixes.len() < 2 && !self.coprocess_mode_on {
            if self.protagonist.is_empty() {
                return Err(ConfigError::MissingName("protagonist"));
            }
            if self.confidant.is_empty() {
                return Err(ConfigError::MissingName("confidant"));
            }
        }
        if self.batch_count == 0 {
            return Err(ConfigError::Invalid("batch_count must be positive".to_string()));
        }

        let Substitution {
            protagonist_alias,
            confidant_alias,
            ..
        } = self.substitution.clone();
        for prompt in [
            &mut self.priming_prompt,
            &mut self.rolling_prompt,
            &mut self.answer_prompt,
        ] {
            if !protagonist_alias.is_empty() {
                *prompt = prompt.replace(&protagonist_alias, &self.protagonist);
            }
            if !confidant_alias.is_empty() {
                *prompt = prompt.replace(&confidant_alias, &self.confidant);
            }
        }
        self.reinitialize_roles();
        self.multiline_confidant_on = self.sentence_terminals.contains("\n");
        Ok(())
    }

    /// Append rolling prompt lines and infer names from `Name: text` lines.
    ///
    /// The last speaker becomes the protagonist and the one before that the
    /// confidant, unless names were already given.
    pub fn parse_rolling_prompt(&mut self, text: &str) {
        let mut names: [String; 2] = Default::default();
        for line in text.lines() {
            self.rolling_prompt.push_str(line);
            self.rolling_prompt.push('\n');
            if let Some((name, _)) = line.split_once(':') {
                let name = name.trim_start_matches(' ');
                if name != names[1] {
                    names[0] = std::mem::take(&mut names[1]);
                    names[1] = name.to_string();
                }
            }
        }
        let [confidant, protagonist] = names;
        if self.protagonist.is_empty() {
            self.protagonist = protagonist;
        }
        if self.confidant.is_empty() {
            self.confidant = confidant;
        }
    }

    /// Rebuild `roles` from `chat_prefixes` and the current names.
    pub fn reinitialize_roles(&mut self) {
        let given: Vec<(String, String)> = if self.chat_prefixes.len() < 2 {
            vec![
                (format!("{}: ", self.protagonist), String::new()),
                (format!("{}:", self.confidant), String::new()),
            ]
        } else {
            self.chat_prefixes
                .iter()
                .map(|c| {
                    let (prefix, suffix) = c.parts();
                    (self.substitute_names(prefix), suffix.to_string())
                })
                .collect()
        };
        self.roles = given
            .into_iter()
            .map(|(prefix, suffix)| RoleOpt {
                prefix: if self.coprocess_mode_on { String::new() } else { prefix },
                suffix: if suffix.is_empty() { "\n".to_string() } else { suffix },
            })
            .collect();
    }

    fn substitute_names(&self, text: &str) -> String {
        let mut text = text.to_string();
        if !self.substitution.protagonist_alias.is_empty() {
            text = text.replace(&self.substitution.protagonist_alias, &self.protagonist);
        }
        if !self.substitution.confidant_alias.is_empty() {
            text = text.replace(&self.substitution.confidant_alias, &self.confidant);
        }
        text
    }

    /// Replace sentence terminals and refresh what depends on them.
    pub fn set_sentence_terminals<I, S>(&mut self, terminals: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sentence_terminals = terminals.into_iter().map(Into::into).collect();
        self.multiline_confidant_on = self.sentence_terminals.contains("\n");
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// Sentence terminals, role suffixes, and a newline.
    pub fn antiprompts(&self) -> BTreeSet<String> {
        let mut set = self.sentence_terminals.clone();
        set.insert("\n".to_string());
        for role in &self.roles {
            if !role.suffix.is_empty() {
                set.insert(role.suffix.clone());
            }
        }
        set
    }

    /// Fill in token limits left at zero.
    pub fn resolve_token_limits(&mut self, engine_limit: usize) {
        if self.model_token_limit == 0 || self.model_token_limit > engine_limit {
            self.model_token_limit = engine_limit;
        }
        if self.context_token_limit == 0 || self.context_token_limit > self.model_token_limit {
            self.context_token_limit = self.model_token_limit;
        }
    }

    pub fn print_options(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "Characters: protagonist={}, confidant={}",
            self.protagonist, self.confidant
        )?;
        writeln!(out, "Chat lines start with...")?;
        for role in &self.roles {
            writeln!(out, "{}", role.prefix)?;
        }
        writeln!(out)?;
        writeln!(
            out,
            "Generate: batch_count={}, thread_count={}, sentence_token_limit={}, sentence_limit={}",
            self.batch_count, self.thread_count, self.sentence_token_limit, self.sentence_limit
        )?;
        out.flush()
    }
}

fn read_prompt(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// The antiprompt that `text` ends with, if any.
pub fn antiprompt_suffix<'a>(text: &str, antiprompts: &'a BTreeSet<String>) -> Option<&'a str> {
    antiprompts
        .iter()
        .find(|a| !a.is_empty() && text.ends_with(a.as_str()))
        .map(String::as_str)
}

/// Register configured token aliases with the vocabulary.
pub fn apply_substitution(vocab: &mut Vocabulary, substitution: &Substitution) -> Result<(), ConfigError> {
    if !substitution.bos_token_alias.is_empty() {
        let bos = vocab.bos_token_id();
        vocab.assign_substitution(&substitution.bos_token_alias, bos);
    }
    if !substitution.eos_token_alias.is_empty() {
        let eos = vocab.eos_token_id();
        vocab.assign_substitution(&substitution.eos_token_alias, eos);
    }
    for special in &substitution.special_tokens {
        let token_id = special
            .candidates
            .iter()
            .find_map(|name| vocab.tokenize_special(name).ok())
            .ok_or_else(|| ConfigError::UnknownSpecialToken(special.alias.clone()))?;
        vocab.assign_substitution(&special.alias, token_id);
    }
    Ok(())
}

/// Options that may change while a session runs, applied by `/set`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicOptions {
    pub protagonist: Option<String>,
    pub confidant: Option<String>,
    pub sentence_limit: Option<usize>,
    pub sentence_token_limit: Option<usize>,
    pub sentence_terminals: Option<BTreeSet<String>>,
    pub thread_count: Option<usize>,
    pub batch_thread_count: Option<usize>,
    pub batch_count: Option<usize>,
    pub sampling: Option<SamplingConfig>,
}

impl DynamicOptions {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Apply to `opt`. Returns whether the sampler must be rebuilt.
    pub fn apply(self, opt: &mut ChatOptions) -> bool {
        let mut names_changed = false;
        if let Some(name) = self.protagonist {
            opt.protagonist = name;
            names_changed = true;
        }
        if let Some(name) = self.confidant {
            opt.confidant = name;
            names_changed = true;
        }
        if names_changed {
            opt.reinitialize_roles();
        }
        if let Some(n) = self.sentence_limit {
            opt.sentence_limit = n;
        }
        if let Some(n) = self.sentence_token_limit {
            opt.sentence_token_limit = n;
        }
        if let Some(terminals) = self.sentence_terminals {
            opt.set_sentence_terminals(terminals);
        }
        if let Some(n) = self.thread_count {
            opt.thread_count = n;
        }
        if let Some(n) = self.batch_thread_count {
            opt.batch_thread_count = n;
        }
        if let Some(n) = self.batch_count.filter(|&n| n > 0) {
            opt.batch_count = n;
        }
        match self.sampling {
            Some(sampling) => {
                opt.sampling = sampling;
                true
            }
            None => false,
        }
    }
}
