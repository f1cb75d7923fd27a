//! Token trajectory: the ordered token ledger of a chat session.
//!
//! Holds every token of the conversation plus three cursors:
//! - the priming boundary, fixed at startup; tokens before it never change
//! - the context cursor, how many leading tokens the engine has evaluated
//! - the display cursor, how many leading tokens have been shown
//!
//! Each token also carries an optional role tag. A contiguous run of equal
//! tags marks the prefix that opened that role's turn.

use std::io::Write;

use rendez_vocab::{TokenId, Vocabulary};
use tracing::{debug, warn};

/// Index of a chat role. Role 0 is the user-facing protagonist.
pub type RoleId = usize;

pub struct Trajectory {
    token_ids: Vec<TokenId>,
    role_tags: Vec<Option<RoleId>>,
    role: Option<RoleId>,
    priming_token_count: usize,
    context_token_count: usize,
    display_token_count: usize,
    erased_since_eval: bool,
    transcript_out: Option<Box<dyn Write + Send>>,
}

impl Trajectory {
    /// Start a trajectory holding only the bootstrap token.
    pub fn new(first: TokenId) -> Self {
        Self {
            token_ids: vec![first],
            role_tags: vec![None],
            role: None,
            priming_token_count: 1,
            context_token_count: 0,
            display_token_count: 0,
            erased_since_eval: false,
            transcript_out: None,
        }
    }

    /// Send every rolled-off span to `out`.
    pub fn set_transcript(&mut self, out: Box<dyn Write + Send>) {
        self.transcript_out = Some(out);
    }

    pub fn token_count(&self) -> usize {
        self.token_ids.len()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.token_ids
    }

    /// Last token.
    pub fn token(&self) -> TokenId {
        self.token_ids[self.token_ids.len() - 1]
    }

    pub fn token_at(&self, i: usize) -> TokenId {
        self.token_ids[i]
    }

    pub fn role_at(&self, i: usize) -> Option<RoleId> {
        self.role_tags[i]
    }

    /// Role of the most recent prefix run.
    pub fn role(&self) -> Option<RoleId> {
        self.role
    }

    pub fn set_role(&mut self, role: Option<RoleId>) {
        self.role = role;
    }

    pub fn priming_token_count(&self) -> usize {
        self.priming_token_count
    }

    /// Fix the priming boundary at the current end.
    pub fn mark_priming_end(&mut self) {
        self.priming_token_count = self.token_count();
    }

    pub fn context_token_count(&self) -> usize {
        self.context_token_count
    }

    pub fn display_token_count(&self) -> usize {
        self.display_token_count
    }

    pub fn set_display_token_count(&mut self, n: usize) {
        self.display_token_count = n.min(self.token_count());
    }

    /// Whether tokens were erased since the engine last caught up.
    pub fn erased_since_eval(&self) -> bool {
        self.erased_since_eval
    }

    pub(crate) fn set_context_token_count(&mut self, n: usize) {
        self.context_token_count = n.min(self.token_count());
    }

    pub(crate) fn mark_evaluated(&mut self) {
        self.erased_since_eval = false;
    }

    /// Detokenized text of `[beg, end)`.
    pub fn text_in(&self, beg: usize, end: usize, vocab: &Vocabulary) -> String {
        vocab.detokenize_all(&self.token_ids[beg..end])
    }

    /// Detokenized text after the priming boundary.
    pub fn rolling_text(&self, vocab: &Vocabulary) -> String {
        self.text_in(self.priming_token_count, self.token_count(), vocab)
    }

    pub fn push(&mut self, token_id: TokenId) {
        self.token_ids.push(token_id);
        self.role_tags.push(None);
    }

    /// Splice untagged tokens in at `i`.
    ///
    /// Landing before the context cursor rewinds it to `i` and counts as an
    /// edit of evaluated history, like an erase.
    pub fn insert_all_at(&mut self, i: usize, tokens: &[TokenId]) {
        assert!(i > 0, "cannot insert before the bootstrap token");
        assert!(i <= self.token_count());
        let n = tokens.len();
        self.token_ids.splice(i..i, tokens.iter().copied());
        self.role_tags.splice(i..i, std::iter::repeat(None).take(n));
        if i < self.display_token_count {
            self.display_token_count += n;
        }
        if i < self.context_token_count {
            self.context_token_count = i;
            self.erased_since_eval = true;
        }
    }

    pub fn erase_range(&mut self, beg: usize, end: usize) {
        assert!(beg <= end && end <= self.token_count());
        debug_assert!(beg > 0 || end < self.token_count());
        self.erased_since_eval = true;
        self.token_ids.drain(beg..end);
        self.role_tags.drain(beg..end);

        if self.context_token_count > beg {
            self.context_token_count = beg;
        }
        if self.context_token_count >= self.token_count() {
            self.context_token_count = self.token_count().saturating_sub(1);
        }
        if beg < self.display_token_count {
            if end < self.display_token_count {
                self.display_token_count -= end - beg;
            } else {
                self.display_token_count = beg;
            }
        }
        self.role = self.last_message_prefix_role_at(self.token_count());
    }

    pub fn erase_all_at(&mut self, beg: usize) {
        self.erase_range(beg, self.token_count());
    }

    /// Tag `[beg, end)` as a prefix run of `role`.
    pub fn assign_range_role(&mut self, role: RoleId, beg: usize, end: usize) {
        for tag in &mut self.role_tags[beg..end] {
            *tag = Some(role);
        }
        if end == self.token_count() && beg < end {
            self.role = Some(role);
        }
    }

    /// First index at or after `i` holding `id`, or `token_count()`.
    pub fn find_token_at(&self, i: usize, id: TokenId) -> usize {
        let len = self.token_count();
        if i >= len {
            return len;
        }
        self.token_ids[i..]
            .iter()
            .position(|&t| t == id)
            .map_or(len, |off| i + off)
    }

    /// Last index at or before `i` holding `id`, or `token_count()`.
    pub fn rfind_token_at(&self, i: usize, id: TokenId) -> usize {
        let len = self.token_count();
        let start = i.min(len - 1);
        self.token_ids[..=start]
            .iter()
            .rposition(|&t| t == id)
            .unwrap_or(len)
    }

    /// Last tagged index at or before `i` in the rolling part, or `priming - 1`.
    pub fn rfind_message_prefix_at(&self, i: usize) -> usize {
        let p = self.priming_token_count;
        if self.token_count() == 0 {
            return p - 1;
        }
        let mut i = i.min(self.token_count() - 1);
        while i >= p {
            if self.role_tags[i].is_some() {
                return i;
            }
            i -= 1;
        }
        p - 1
    }

    /// Start of the prefix run that ends at or before `i`, or `priming - 1`.
    pub fn rfind_message_prefix_begin_at(&self, i: usize) -> usize {
        let p = self.priming_token_count;
        let mut i = self.rfind_message_prefix_at(i);
        while i > p {
            if self.role_tags[i - 1] != self.role_tags[i] {
                return i;
            }
            i -= 1;
        }
        if i == p && self.role_tags[p].is_some() {
            return p;
        }
        p - 1
    }

    /// One past the end of the last prefix run that ends before `i`.
    ///
    /// A run that `i` falls inside is skipped. Returns `priming` when no run
    /// qualifies.
    pub fn rfind_last_message_prefix_end_at(&self, i: usize) -> usize {
        let p = self.priming_token_count;
        if self.token_count() <= p {
            return p;
        }
        let e = self.rfind_message_prefix_at(i.min(self.token_count() - 1));
        let mut i = i;
        if e < i {
            i = e;
        } else {
            i = self.rfind_message_prefix_begin_at(i);
            if i >= p {
                i = self.rfind_message_prefix_at(i - 1);
            }
        }
        i + 1
    }

    /// Role of the last complete prefix run before `i`.
    pub fn last_message_prefix_role_at(&self, i: usize) -> Option<RoleId> {
        let end = self.rfind_last_message_prefix_end_at(i);
        if end <= self.priming_token_count {
            return None;
        }
        self.role_tags[end - 1]
    }

    /// Tokenize `text` and append it.
    ///
    /// A trailing token that ends in a space is popped and retokenized along
    /// with `text`, so the space joins the next word.
    pub fn tokenize_append(&mut self, text: &str, vocab: &Vocabulary) {
        let mut carry = String::new();
        if self.priming_token_count < self.token_count()
            && vocab.last_char_of(self.token()) == Some(' ')
        {
            vocab.detokenize_to(&mut carry, self.token());
            self.erase_all_at(self.token_count() - 1);
        }
        carry.push_str(text);
        if carry.is_empty() {
            return;
        }
        let tokens = vocab.tokenize(&carry);
        self.insert_all_at(self.token_count(), &tokens);
    }

    /// Append `text` as a prefix run of `role` and make it the current role.
    pub fn tokenize_append_message_prefix(&mut self, role: RoleId, text: &str, vocab: &Vocabulary) {
        let tokens = vocab.tokenize(text);
        let beg = self.token_count();
        self.insert_all_at(beg, &tokens);
        let end = self.token_count();
        self.assign_range_role(role, beg, end);
        self.role = Some(role);
    }

    /// Canonicalize the end of the current turn, then append `suffix`.
    ///
    /// An empty suffix means a newline. The display cursor follows the
    /// append if it had already reached the trimmed end.
    pub fn tokenize_append_message_suffix(&mut self, suffix: &str, vocab: &Vocabulary) {
        let suffix = if suffix.is_empty() { "\n" } else { suffix };
        let old_display = self.display_token_count;
        self.trim_message_suffix(suffix, vocab);
        let display_move_on = old_display >= self.token_count();
        self.tokenize_append(suffix, vocab);
        if display_move_on {
            self.display_token_count = self.token_count();
        }
    }

    /// Whether the rolling text ends with `suffix`, which must be non-empty.
    pub fn endswith_nonempty(&self, suffix: &str, vocab: &Vocabulary) -> bool {
        assert!(!suffix.is_empty());
        let mut carry = String::new();
        let mut i = self.token_count();
        while i > self.priming_token_count && carry.len() < suffix.len() {
            i -= 1;
            let piece = vocab.detokenize(self.token_ids[i]);
            carry.insert_str(0, &piece);
        }
        carry.ends_with(suffix)
    }

    /// Strip trailing whitespace, end-of-stream markers, and copies of
    /// `suffix` from the end of the rolling part.
    ///
    /// Text that straddles a removed marker is retokenized so the result is
    /// one canonical tokenization.
    pub fn trim_message_suffix(&mut self, suffix: &str, vocab: &Vocabulary) {
        let suffix = if suffix.chars().any(|c| c != ' ' && c != '\n') {
            suffix.trim_end_matches([' ', '\n'])
        } else {
            suffix
        };
        let eos = vocab.eos_token_id();
        let newline = vocab.newline_token_id();
        let alias = vocab.eos_token_alias().to_string();
        let p = self.priming_token_count;

        let mut pending = String::new();
        loop {
            if self.token_count() <= p {
                break;
            }
            let mut idx;
            if pending.is_empty() {
                let last = self.token();
                if last == newline || last == eos {
                    self.erase_all_at(self.token_count() - 1);
                    continue;
                }
                idx = self.token_count() - 1;
                vocab.detokenize_to(&mut pending, last);
            } else {
                idx = self.token_count();
            }

            let keep = pending.trim_end_matches([' ', '\n']).len();
            if keep == 0 {
                pending.clear();
                self.erase_all_at(idx);
                continue;
            }
            let mut carry = String::new();
            if keep == pending.len() && idx < self.token_count() {
                idx += 1;
            } else {
                carry.push_str(&pending[..keep]);
                self.erase_all_at(idx);
            }
            pending.clear();

            let carry_rindex = carry.len();
            let sufficient = suffix.len().max(alias.len());
            while idx > p && carry.len() < sufficient {
                idx -= 1;
                let piece = vocab.detokenize(self.token_ids[idx]);
                carry.insert_str(0, &piece);
            }

            if !alias.is_empty() && carry.ends_with(alias.as_str()) {
                self.erase_all_at(idx);
                pending.push_str(&carry[..carry.len() - alias.len()]);
                continue;
            }
            if !suffix.is_empty() && carry.ends_with(suffix) {
                self.erase_all_at(idx);
                pending.push_str(&carry[..carry.len() - suffix.len()]);
                continue;
            }
            pending.push_str(&carry[carry.len() - carry_rindex..]);
            break;
        }
        self.tokenize_append(&pending, vocab);
    }

    /// Write `[priming, end)` to the transcript, then erase it.
    pub fn rollforget(&mut self, end: usize, vocab: &Vocabulary) {
        let beg = self.priming_token_count;
        let end = end.clamp(beg, self.token_count());
        if let Some(out) = self.transcript_out.as_mut() {
            let text = vocab.detokenize_all(&self.token_ids[beg..end]);
            if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
                warn!(error = %e, "failed to write rolled-off text to transcript");
            }
        }
        debug!(evicted = end - beg, "rollforget");
        self.erase_range(beg, end);
    }

    /// Evict the oldest rolling tokens once the trajectory reaches `token_limit`.
    ///
    /// Cuts at the start of a protagonist prefix near the midpoint of the
    /// rolling budget, else just after a newline, else at the midpoint itself.
    pub fn maybe_rollforget_within_limit(&mut self, token_limit: usize, vocab: &Vocabulary) {
        let len = self.token_count();
        if len < token_limit {
            return;
        }
        let p = self.priming_token_count;
        debug_assert!(
            token_limit >= p + 2,
            "context_token_limit must leave room after the priming prompt"
        );
        let ideal = len - token_limit.saturating_sub(p) / 2;
        let min_end = (len + p).saturating_sub(token_limit);

        let mut end = self.rfind_message_prefix_begin_at(ideal);
        while end > p {
            if self.role_tags[end] == Some(0) {
                break;
            }
            end = self.rfind_message_prefix_begin_at(end - 1);
        }
        if end <= p || end < min_end {
            let newline = self.find_token_at(ideal.saturating_sub(1), vocab.newline_token_id());
            end = if newline < len { newline + 1 } else { ideal };
        }
        self.rollforget(end, vocab);
    }
}

impl std::fmt::Debug for Trajectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trajectory")
            .field("token_count", &self.token_count())
            .field("role", &self.role)
            .field("priming_token_count", &self.priming_token_count)
            .field("context_token_count", &self.context_token_count)
            .field("display_token_count", &self.display_token_count)
            .field("erased_since_eval", &self.erased_since_eval)
            .finish_non_exhaustive()
    }
}
