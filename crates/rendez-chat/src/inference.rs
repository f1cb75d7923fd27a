//! Adapter between the trajectory and an inference engine.

use std::time::{SystemTime, UNIX_EPOCH};

use rendez_engine::InferenceEngine;
use rendez_sampling::Sampler;
use rendez_vocab::{TokenId, Vocabulary};
use tracing::{debug, warn};

use crate::display::ChatDisplay;
use crate::error::Result;
use crate::options::ChatOptions;
use crate::trajectory::Trajectory;

pub struct Inference {
    engine: Box<dyn InferenceEngine>,
    sampler: Sampler,
    /// Trajectory tokens already fed to the sampler's penalty history.
    accepted_token_count: usize,
    sampler_stale: bool,
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() & 0x7fff_ffff)
        .unwrap_or(0)
}

/// The configured seed, else the clock.
fn sampling_seed(opt: &ChatOptions) -> u64 {
    opt.sampling.seed.unwrap_or_else(clock_seed)
}

impl Inference {
    pub fn new(engine: Box<dyn InferenceEngine>, opt: &ChatOptions) -> Self {
        Self {
            engine,
            sampler: Sampler::new(opt.sampling.clone(), sampling_seed(opt)),
            accepted_token_count: 0,
            sampler_stale: false,
        }
    }

    /// Rebuild the sampler at the next commit, e.g. after its options changed.
    pub fn request_reinitialize(&mut self) {
        self.sampler_stale = true;
    }

    fn reinitialize(&mut self, opt: &ChatOptions) {
        self.sampler = Sampler::new(opt.sampling.clone(), sampling_seed(opt));
        self.accepted_token_count = 0;
        self.sampler_stale = false;
    }

    /// Evaluate every trajectory token the engine has not seen yet.
    ///
    /// On engine failure the context cursor resets to zero so the next call
    /// re-evaluates everything.
    pub fn commit_to_context(
        &mut self,
        traj: &mut Trajectory,
        display: &mut ChatDisplay,
        vocab: &Vocabulary,
        opt: &ChatOptions,
    ) -> Result<()> {
        if traj.context_token_count() < traj.token_count() {
            traj.maybe_rollforget_within_limit(opt.context_token_limit, vocab);
        }
        // Erasure invalidates the penalty history.
        if traj.erased_since_eval() || self.sampler_stale {
            self.reinitialize(opt);
        }

        if traj.context_token_count() < traj.token_count() {
            let batch_thread_count = match opt.batch_thread_count {
                0 => std::thread::available_parallelism().map_or(opt.thread_count, |n| n.get()),
                n => n,
            };
            self.engine.set_threads(opt.thread_count, batch_thread_count);
            self.engine.truncate(traj.context_token_count());

            let batch_count = opt.batch_count.max(1);
            while traj.context_token_count() < traj.token_count() {
                let beg = traj.context_token_count();
                let n = batch_count.min(traj.token_count() - beg);
                display.show_new(beg + n, traj, vocab)?;
                let batch: Vec<TokenId> = traj.tokens()[beg..beg + n].to_vec();
                if let Err(e) = self.engine.eval(&batch, beg) {
                    warn!(error = %e, position = beg, "evaluation failed");
                    traj.set_context_token_count(0);
                    return Err(e.into());
                }
                traj.set_context_token_count(beg + n);
            }
            traj.mark_evaluated();
            debug!(context = traj.context_token_count(), "committed to context");
        }

        while self.accepted_token_count < traj.token_count() {
            let token = traj.token_at(self.accepted_token_count);
            self.sampler.accept(token_index(token));
            self.accepted_token_count += 1;
        }
        Ok(())
    }

    /// Sample the next token and push it onto the trajectory.
    pub fn sample_to_trajectory(
        &mut self,
        traj: &mut Trajectory,
        vocab: &Vocabulary,
        preventing_newline: bool,
    ) -> Result<TokenId> {
        let candidates = candidate_logits(self.engine.logits(), vocab, preventing_newline);
        let picked = self.sampler.sample(&candidates, &[])?;
        let token = picked as TokenId;
        traj.push(token);
        self.sampler.accept(picked);
        self.accepted_token_count += 1;
        Ok(token)
    }
}

fn token_index(token: TokenId) -> usize {
    usize::try_from(token).unwrap_or(usize::MAX)
}

/// One logit per vocabulary entry. While a turn must not end, newline and
/// end-of-sequence are pulled down to zero.
fn candidate_logits(logits: &[f32], vocab: &Vocabulary, preventing_newline: bool) -> Vec<f32> {
    let mut candidates = logits[..logits.len().min(vocab.cardinality())].to_vec();
    if preventing_newline {
        for token in [vocab.eos_token_id(), vocab.newline_token_id()] {
            if let Some(logit) = candidates.get_mut(token_index(token)) {
                *logit = logit.min(0.0);
            }
        }
    }
    candidates
}
