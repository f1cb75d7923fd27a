//! The chat loop: generate until a stopping condition, then read input.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};

use rendez_engine::InferenceEngine;
use rendez_vocab::{TokenId, Vocabulary};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::command::{parse_command, Command};
use crate::display::ChatDisplay;
use crate::error::{ChatError, ConfigError, Result};
use crate::guide::ChatGuide;
use crate::inference::Inference;
use crate::options::{antiprompt_suffix, ChatOptions, DynamicOptions};
use crate::trajectory::Trajectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Generating,
    AwaitingInput,
}

/// Progress since the last turn boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnCounters {
    pub line_byte_count: usize,
    pub sentence_count: usize,
    pub sentence_token_count: usize,
}

enum CommandFlow {
    KeepReading,
    Generate,
}

pub struct Session {
    id: Uuid,
    opt: ChatOptions,
    vocab: Vocabulary,
    traj: Trajectory,
    inference: Inference,
    display: ChatDisplay,
    eout: Box<dyn Write + Send>,
    antiprompts: BTreeSet<String>,
    state: LoopState,
    counters: TurnCounters,
    line_byte_limit: usize,
    preventing_newline: bool,
    forced_continuation: bool,
    matched_antiprompt: String,
}

impl Session {
    /// Build the starting trajectory: bootstrap token, priming prompt,
    /// rolling prompt, then an open turn for the confidant.
    ///
    /// `opt` must already be initialized. Conversation text goes to `out`;
    /// command output and notices go to `eout`.
    pub fn new(
        mut opt: ChatOptions,
        vocab: Vocabulary,
        engine: Box<dyn InferenceEngine>,
        out: Box<dyn Write + Send>,
        eout: Box<dyn Write + Send>,
    ) -> Result<Self> {
        opt.resolve_token_limits(engine.context_limit());

        let bos = vocab.bos_token_id();
        let mut traj = Trajectory::new(bos);
        let mut priming = vocab.tokenize(&opt.priming_prompt);
        if priming.first() == Some(&bos) {
            priming.remove(0);
        }
        traj.insert_all_at(1, &priming);
        traj.mark_priming_end();

        let needed = traj.priming_token_count() + 2;
        if needed > opt.context_token_limit {
            return Err(ConfigError::PrimingTooLong {
                needed,
                limit: opt.context_token_limit,
            }
            .into());
        }

        if let Some(path) = &opt.o_rolling {
            let file = File::create(path).map_err(|source| ConfigError::Unwritable {
                path: path.clone(),
                source,
            })?;
            traj.set_transcript(Box::new(BufWriter::new(file)));
        }

        if !opt.rolling_prompt.is_empty() {
            traj.tokenize_append(&opt.rolling_prompt, &vocab);
            traj.set_role(Some(0));
        }
        ChatGuide::new(&vocab, &mut traj, &opt).yield_turn_to(1);

        let mut display = ChatDisplay::new(out);
        if !opt.answer_prompt.is_empty() {
            display.set_answer_prompt(vocab.tokenize(&opt.answer_prompt));
        }

        let state = if opt.coprocess_mode_on {
            LoopState::AwaitingInput
        } else {
            LoopState::Generating
        };

        Ok(Self {
            id: Uuid::new_v4(),
            antiprompts: opt.antiprompts(),
            inference: Inference::new(engine, &opt),
            opt,
            vocab,
            traj,
            display,
            eout,
            state,
            counters: TurnCounters::default(),
            line_byte_limit: 0,
            preventing_newline: false,
            forced_continuation: false,
            matched_antiprompt: String::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn counters(&self) -> TurnCounters {
        self.counters
    }

    pub fn options(&self) -> &ChatOptions {
        &self.opt
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.traj
    }

    pub fn preventing_newline(&self) -> bool {
        self.preventing_newline
    }

    /// Text after the priming prompt.
    pub fn rolling_text(&self) -> String {
        self.traj.rolling_text(&self.vocab)
    }

    fn guide(&mut self) -> ChatGuide<'_> {
        ChatGuide::new(&self.vocab, &mut self.traj, &self.opt)
    }

    /// Run until input runs out, then flush the rolling text to the transcript.
    pub fn run<R: BufRead>(&mut self, input: &mut R) -> Result<()> {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();
        info!(
            priming = self.traj.priming_token_count(),
            context_limit = self.opt.context_token_limit,
            "session started"
        );
        loop {
            match self.state {
                LoopState::Generating => {
                    self.step()?;
                }
                LoopState::AwaitingInput => {
                    if !self.read_input(input)? {
                        break;
                    }
                    self.state = LoopState::Generating;
                }
            }
        }
        self.finish();
        info!("session ended");
        Ok(())
    }

    /// Evaluate pending tokens, retrying once from an empty context.
    fn commit(&mut self) -> Result<()> {
        let first = self.inference.commit_to_context(
            &mut self.traj,
            &mut self.display,
            &self.vocab,
            &self.opt,
        );
        match first {
            Err(ChatError::Engine(e)) => {
                warn!(error = %e, "retrying evaluation from scratch");
                self.inference.commit_to_context(
                    &mut self.traj,
                    &mut self.display,
                    &self.vocab,
                    &self.opt,
                )
            }
            other => other,
        }
    }

    /// Generate one token and decide whether to keep going.
    pub fn step(&mut self) -> Result<LoopState> {
        if self.opt.coprocess_mode_on {
            let len = self.traj.token_count();
            self.traj.set_display_token_count(len);
        }
        self.display
            .maybe_insert_answer_prompt(&mut self.traj, &self.vocab)?;
        self.commit()?;

        let prev = self.traj.token();
        let token = self.inference.sample_to_trajectory(
            &mut self.traj,
            &self.vocab,
            self.preventing_newline,
        )?;
        self.preventing_newline = false;
        self.display.show_all_new(&mut self.traj, &self.vocab)?;

        let text = self.display_string(prev, token);
        self.counters.line_byte_count += text.len();
        self.matched_antiprompt = antiprompt_suffix(&text, &self.antiprompts)
            .unwrap_or_default()
            .to_string();

        let inputting = self.observe_generated()?;
        self.display
            .maybe_remove_answer_prompt(&mut self.traj, inputting);
        if inputting {
            self.enter_awaiting_input();
        } else {
            self.state = LoopState::Generating;
        }
        Ok(self.state)
    }

    fn display_string(&self, prev: TokenId, token: TokenId) -> String {
        let mut text = String::new();
        self.vocab.detokenize_after(&mut text, Some(prev), token);
        text
    }

    /// Apply the stopping rules to the token just generated.
    fn observe_generated(&mut self) -> Result<bool> {
        if self.line_byte_limit > 0 && self.counters.line_byte_count >= self.line_byte_limit {
            self.guide().end_turn();
            if self.matched_antiprompt != "\n" {
                self.display.show_all_new(&mut self.traj, &self.vocab)?;
            }
            return Ok(true);
        }

        if self.guide().maybe_yield_turn() {
            self.matched_antiprompt = "\n".to_string();
            self.display.show_all_new(&mut self.traj, &self.vocab)?;
            self.counters.sentence_count = 0;
            self.counters.sentence_token_count = 0;
            let inputting = self.traj.role() == Some(0) && !self.forced_continuation;
            self.forced_continuation = false;
            return Ok(inputting);
        }

        if !self.matched_antiprompt.is_empty() {
            if self.counters.sentence_count + 1 == self.opt.sentence_limit {
                return Ok(true);
            }
            self.counters.sentence_count += 1;
            self.counters.sentence_token_count = 0;
            return Ok(false);
        }

        if self.counters.sentence_token_count + 1 == self.opt.sentence_token_limit {
            return Ok(true);
        }
        self.counters.sentence_token_count += 1;
        Ok(false)
    }

    fn enter_awaiting_input(&mut self) {
        self.state = LoopState::AwaitingInput;
        self.counters = TurnCounters::default();
        self.line_byte_limit = 0;
        self.forced_continuation = false;
    }

    /// Read lines until generation should resume. Returns false at end of input.
    pub fn read_input<R: BufRead>(&mut self, input: &mut R) -> Result<bool> {
        let mut buffer = String::new();
        loop {
            let mut raw = String::new();
            if input.read_line(&mut raw)? == 0 {
                return Ok(false);
            }
            let line = raw.strip_suffix('\n').unwrap_or(&raw);
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if let Some(command) = line.strip_prefix(self.opt.command_prefix_char) {
                if !buffer.is_empty() {
                    warn!("pending input cleared; cannot mix with commands");
                    buffer.clear();
                }
                match self.run_command(parse_command(command), &mut buffer)? {
                    CommandFlow::KeepReading => continue,
                    CommandFlow::Generate => break,
                }
            }

            if let Some(head) = line.strip_suffix('\\') {
                buffer.push_str(head);
                buffer.push('\n');
                continue;
            }
            if line.starts_with(' ') && buffer.is_empty() && self.matched_antiprompt == "\n" {
                let mut guide = self.guide();
                guide.maybe_erase_trailing_message_prefix();
                guide.maybe_erase_trailing_message_suffix();
                self.matched_antiprompt.clear();
            }
            buffer.push_str(line);
            break;
        }

        if !buffer.is_empty() {
            self.submit_text(&buffer);
        }
        Ok(true)
    }

    /// Interpret free text typed by the user.
    pub fn submit_text(&mut self, text: &str) {
        self.preventing_newline = false;
        if let Some(rest) = text.strip_prefix("\\n") {
            let last_role = self.opt.role_count().saturating_sub(1);
            let mut guide = self.guide();
            guide.end_turn();
            guide.begin_turn(last_role);
            let trimmed = rest.trim_end_matches(' ');
            self.preventing_newline = trimmed.len() != rest.len();
            self.traj.tokenize_append(trimmed, &self.vocab);
        } else if let Some(rest) = text.strip_prefix('\n') {
            self.guide().yield_turn_with(rest);
        } else if text.starts_with(' ') {
            let trimmed = text.trim_end_matches(' ');
            self.preventing_newline = trimmed.len() != text.len();
            self.traj.tokenize_append(trimmed, &self.vocab);
        } else {
            self.guide().yield_turn_to(0);
            self.traj.tokenize_append(text, &self.vocab);
            self.guide().yield_turn();
            let len = self.traj.token_count();
            let beg = self.traj.rfind_message_prefix_begin_at(len - 1);
            self.traj.set_display_token_count(beg);
            self.preventing_newline = true;
        }
    }

    fn notice(&mut self, text: &str) -> Result<()> {
        self.eout.write_all(text.as_bytes())?;
        self.eout.write_all(b"\n")?;
        self.eout.flush()?;
        Ok(())
    }

    fn run_command(&mut self, command: Command, buffer: &mut String) -> Result<CommandFlow> {
        debug!(?command, "command");
        match command {
            Command::Opt => {
                self.opt.print_options(&mut *self.eout)?;
            }
            Command::Set(json) => match DynamicOptions::parse(&json) {
                Ok(dynamic) => {
                    if dynamic.apply(&mut self.opt) {
                        self.inference.request_reinitialize();
                    }
                    self.antiprompts = self.opt.antiprompts();
                }
                Err(e) => {
                    warn!(error = %e, "ignoring /set with invalid options");
                    self.notice(&format!("Ignoring /set: {e}"))?;
                }
            },
            Command::Forget(count) => {
                self.forget_lines(count);
                self.commit()?;
            }
            Command::Head(count) => {
                let text = self.rolling_text();
                let head: Vec<&str> = text.lines().take(count).collect();
                self.notice(&head.join("\n"))?;
            }
            Command::Tail(count) => {
                let text = self.rolling_text();
                let lines: Vec<&str> = text.lines().collect();
                let tail = &lines[lines.len().saturating_sub(count)..];
                self.notice(&tail.join("\n"))?;
            }
            Command::Back(count) => {
                let p = self.traj.priming_token_count();
                let beg = self.traj.token_count().saturating_sub(count).max(p);
                self.traj.erase_all_at(beg);
                let text = self.vocab.detokenize(self.traj.token());
                self.matched_antiprompt = antiprompt_suffix(&text, &self.antiprompts)
                    .unwrap_or_default()
                    .to_string();
            }
            Command::Regen => {
                self.guide().maybe_erase_trailing_message_prefix();
                let len = self.traj.token_count();
                let end = self
                    .traj
                    .rfind_last_message_prefix_end_at(len)
                    .max(self.traj.priming_token_count());
                self.traj.erase_all_at(end);
                self.preventing_newline = true;
                self.matched_antiprompt.clear();
                return Ok(CommandFlow::Generate);
            }
            Command::Delete(count) => {
                self.delete_turns(count);
                self.matched_antiprompt = "\n".to_string();
            }
            Command::Puts(text) => {
                self.traj.tokenize_append(&format!("{text}\n"), &self.vocab);
                self.matched_antiprompt = "\n".to_string();
                let len = self.traj.token_count();
                self.traj.set_display_token_count(len);
                self.commit()?;
            }
            Command::Gets { byte_limit, text } => {
                self.preventing_newline = true;
                self.matched_antiprompt.clear();
                self.line_byte_limit = byte_limit;
                self.traj.tokenize_append(&text, &self.vocab);
                self.forced_continuation = true;
                let len = self.traj.token_count();
                self.traj.set_display_token_count(len);
                return Ok(CommandFlow::Generate);
            }
            Command::Yield(text) => {
                buffer.clear();
                buffer.push('\n');
                buffer.push_str(&text);
                return Ok(CommandFlow::Generate);
            }
            Command::Invalid(message) => {
                warn!(%message, "ignoring command");
                self.notice(&message)?;
            }
            Command::Unknown(line) => {
                warn!(%line, "unknown command");
                self.notice(&format!("Unknown command: {line}"))?;
            }
        }
        Ok(CommandFlow::KeepReading)
    }

    /// Roll out rolling text through the `count`-th newline.
    fn forget_lines(&mut self, count: usize) {
        let mut remaining = count;
        let p = self.traj.priming_token_count();
        for i in p..self.traj.token_count() {
            if self.vocab.last_char_of(self.traj.token_at(i)) == Some('\n') {
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    self.traj.rollforget(i + 1, &self.vocab);
                    return;
                }
            }
        }
    }

    /// Erase the last `count` turns, prefixes included.
    fn delete_turns(&mut self, count: usize) {
        self.guide().maybe_erase_trailing_message_prefix();
        let p = self.traj.priming_token_count();
        for _ in 0..count {
            let len = self.traj.token_count();
            if len <= p {
                break;
            }
            let beg = self.traj.rfind_message_prefix_begin_at(len - 1);
            if beg < p {
                self.traj.erase_all_at(p);
                break;
            }
            self.traj.erase_all_at(beg);
        }
    }

    /// Flush the remaining rolling text to the transcript.
    pub fn finish(&mut self) {
        let len = self.traj.token_count();
        self.traj.rollforget(len, &self.vocab);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("counters", &self.counters)
            .field("traj", &self.traj)
            .finish_non_exhaustive()
    }
}
