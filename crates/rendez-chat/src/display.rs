//! Incremental output of trajectory text, plus the hidden answer prompt.

use std::io::Write;

use rendez_vocab::{TokenId, Vocabulary};

use crate::trajectory::Trajectory;

pub struct ChatDisplay {
    out: Box<dyn Write + Send>,
    answer_prompt_tokens: Vec<TokenId>,
    answer_prompt_offset: Option<usize>,
}

impl ChatDisplay {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            answer_prompt_tokens: Vec::new(),
            answer_prompt_offset: None,
        }
    }

    pub fn set_answer_prompt(&mut self, tokens: Vec<TokenId>) {
        self.answer_prompt_tokens = tokens;
    }

    /// Print tokens from the display cursor up to `end` and advance the cursor.
    pub fn show_new(&mut self, end: usize, traj: &mut Trajectory, vocab: &Vocabulary) -> std::io::Result<()> {
        let end = end.min(traj.token_count());
        let beg = traj.display_token_count();
        if beg >= end {
            return Ok(());
        }
        let mut text = String::new();
        for i in beg..end {
            let prev = i.checked_sub(1).map(|j| traj.token_at(j));
            vocab.detokenize_after(&mut text, prev, traj.token_at(i));
        }
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        traj.set_display_token_count(end);
        Ok(())
    }

    pub fn show_all_new(&mut self, traj: &mut Trajectory, vocab: &Vocabulary) -> std::io::Result<()> {
        self.show_new(traj.token_count(), traj, vocab)
    }

    /// Slip the answer prompt in before a freshly opened non-protagonist prefix.
    pub fn maybe_insert_answer_prompt(&mut self, traj: &mut Trajectory, vocab: &Vocabulary) -> std::io::Result<()> {
        if self.answer_prompt_tokens.is_empty() || self.answer_prompt_offset.is_some() {
            return Ok(());
        }
        let len = traj.token_count();
        if len <= traj.priming_token_count() {
            return Ok(());
        }
        match traj.role_at(len - 1) {
            Some(role) if role != 0 => {}
            _ => return Ok(()),
        }
        let beg = traj.rfind_message_prefix_begin_at(len - 1);
        self.show_new(beg, traj, vocab)?;
        let caught_up = traj.display_token_count() == beg;
        traj.insert_all_at(beg, &self.answer_prompt_tokens);
        if caught_up {
            traj.set_display_token_count(beg + self.answer_prompt_tokens.len());
        }
        self.answer_prompt_offset = Some(beg);
        Ok(())
    }

    /// Take the answer prompt back out once control returns to the user.
    pub fn maybe_remove_answer_prompt(&mut self, traj: &mut Trajectory, inputting: bool) {
        if !inputting {
            return;
        }
        let Some(offset) = self.answer_prompt_offset.take() else {
            return;
        };
        let n = self.answer_prompt_tokens.len();
        let tokens = traj.tokens();
        let at = if tokens.get(offset..offset + n) == Some(self.answer_prompt_tokens.as_slice()) {
            Some(offset)
        } else {
            // Rolled forward since insertion.
            tokens[traj.priming_token_count()..]
                .windows(n)
                .rposition(|w| w == self.answer_prompt_tokens.as_slice())
                .map(|i| i + traj.priming_token_count())
        };
        if let Some(beg) = at {
            traj.erase_range(beg, beg + n);
        }
    }
}
