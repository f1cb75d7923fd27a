//! Turn-taking over a trajectory.

use rendez_vocab::Vocabulary;

use crate::options::ChatOptions;
use crate::trajectory::{RoleId, Trajectory};

/// Opens, closes, and detects the end of role turns.
///
/// Holds no state of its own: the current turn is whatever the trajectory's
/// trailing prefix run and cached role say it is.
pub struct ChatGuide<'a> {
    vocab: &'a Vocabulary,
    traj: &'a mut Trajectory,
    opt: &'a ChatOptions,
}

impl<'a> ChatGuide<'a> {
    pub fn new(vocab: &'a Vocabulary, traj: &'a mut Trajectory, opt: &'a ChatOptions) -> Self {
        Self { vocab, traj, opt }
    }

    fn next_role(&self) -> RoleId {
        match self.traj.role() {
            Some(role) => (role + 1) % self.opt.role_count().max(1),
            None => 0,
        }
    }

    fn suffix_of(&self, role: RoleId) -> &'a str {
        let opt: &'a ChatOptions = self.opt;
        opt.roles.get(role).map_or("\n", |r| r.suffix.as_str())
    }

    pub fn begin_turn(&mut self, role: RoleId) {
        let opt: &'a ChatOptions = self.opt;
        let prefix = opt.roles.get(role).map_or("", |r| r.prefix.as_str());
        self.traj
            .tokenize_append_message_prefix(role, prefix, self.vocab);
    }

    pub fn end_turn(&mut self) {
        let Some(role) = self.traj.role() else {
            return;
        };
        let suffix = self.suffix_of(role);
        self.traj.tokenize_append_message_suffix(suffix, self.vocab);
    }

    /// End the current turn and open the next role's.
    pub fn yield_turn(&mut self) {
        let next = self.next_role();
        self.maybe_erase_trailing_message_prefix();
        self.end_turn();
        self.begin_turn(next);
    }

    pub fn yield_turn_to(&mut self, role: RoleId) {
        self.maybe_erase_trailing_message_prefix();
        self.end_turn();
        self.begin_turn(role);
    }

    /// End the current turn and open the next one with `literal` as its text.
    ///
    /// A leading copy of the next role's prefix is tagged as that prefix.
    pub fn yield_turn_with(&mut self, literal: &str) {
        if literal.is_empty() {
            self.yield_turn();
            return;
        }
        let next = self.next_role();
        self.maybe_erase_trailing_message_prefix();
        self.end_turn();

        let opt: &'a ChatOptions = self.opt;
        let prefix = opt.roles.get(next).map_or("", |r| r.prefix.as_str());
        match literal.strip_prefix(prefix) {
            Some(rest) if !prefix.is_empty() => {
                self.traj
                    .tokenize_append_message_prefix(next, prefix, self.vocab);
                self.traj.tokenize_append(rest, self.vocab);
            }
            _ => {
                self.traj
                    .tokenize_append_message_prefix(next, literal, self.vocab);
            }
        }
    }

    /// Yield if the trailing text finishes the current turn.
    pub fn maybe_yield_turn(&mut self) -> bool {
        if !self.turn_ended() {
            return false;
        }
        self.yield_turn();
        true
    }

    fn turn_ended(&self) -> bool {
        let Some(role) = self.traj.role() else {
            return false;
        };
        let len = self.traj.token_count();
        if len <= self.traj.priming_token_count() || self.traj.role_at(len - 1).is_some() {
            return false;
        }
        if self.traj.token() == self.vocab.eos_token_id() {
            return true;
        }
        let alias = self.vocab.eos_token_alias();
        if !alias.is_empty() && self.traj.endswith_nonempty(alias, self.vocab) {
            return true;
        }
        let suffix = self.suffix_of(role);
        if self.opt.multiline_confidant_on && role != 0 && suffix.chars().all(|c| c == '\n') {
            return false;
        }
        self.traj.endswith_nonempty(suffix, self.vocab)
    }

    /// Erase a trailing prefix that has no content after it.
    pub fn maybe_erase_trailing_message_prefix(&mut self) -> bool {
        let len = self.traj.token_count();
        if len > self.traj.priming_token_count() && self.traj.role_at(len - 1).is_some() {
            let beg = self.traj.rfind_message_prefix_begin_at(len - 1);
            self.traj.erase_all_at(beg);
        }
        true
    }

    /// Strip the current turn's trailing suffix so the turn can continue.
    pub fn maybe_erase_trailing_message_suffix(&mut self) -> bool {
        let len = self.traj.token_count();
        if len <= self.traj.priming_token_count() || self.traj.role_at(len - 1).is_some() {
            return true;
        }
        if let Some(role) = self.traj.role() {
            let suffix = self.suffix_of(role);
            self.traj.trim_message_suffix(suffix, self.vocab);
        }
        true
    }
}
