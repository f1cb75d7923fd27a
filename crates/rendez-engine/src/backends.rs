//! Reference backends.

use crate::{EngineError, InferenceEngine, Result, TokenId};

/// Positions held by a reference backend, standing in for a KV cache.
#[derive(Debug, Clone, Default)]
struct Positions {
    tokens: Vec<TokenId>,
    limit: usize,
}

impl Positions {
    fn write(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()> {
        if n_past > self.tokens.len() {
            return Err(EngineError::PositionGap {
                n_past,
                held: self.tokens.len(),
            });
        }
        let needed = n_past + tokens.len();
        if needed > self.limit {
            return Err(EngineError::ContextOverflow {
                needed,
                limit: self.limit,
            });
        }
        self.tokens.truncate(n_past);
        self.tokens.extend_from_slice(tokens);
        Ok(())
    }
}

/// Deterministic stand-in model: logits are a sine hash of the recent context.
#[derive(Debug, Clone)]
pub struct HashEngine {
    positions: Positions,
    vocab_size: usize,
    salt: u64,
    logits: Vec<f32>,
    thread_count: usize,
}

impl HashEngine {
    /// Number of trailing positions that influence the next logits.
    const WINDOW: usize = 8;

    pub fn new(vocab_size: usize, context_limit: usize, salt: u64) -> Self {
        Self {
            positions: Positions {
                tokens: Vec::new(),
                limit: context_limit,
            },
            vocab_size,
            salt,
            logits: vec![0.0; vocab_size],
            thread_count: 1,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn forward(&mut self) {
        let held = &self.positions.tokens;
        let recent = &held[held.len().saturating_sub(Self::WINDOW)..];
        let salt = (self.salt % 997) as f32;
        for (i, logit) in self.logits.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (pos, &tid) in recent.iter().enumerate() {
                acc += ((tid as f32 + 1.0) * (i as f32 + 1.0) + pos as f32 + salt).sin();
            }
            *logit = acc;
        }
    }
}

impl InferenceEngine for HashEngine {
    fn context_limit(&self) -> usize {
        self.positions.limit
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn set_threads(&mut self, thread_count: usize, _batch_thread_count: usize) {
        self.thread_count = thread_count.max(1);
    }

    fn truncate(&mut self, n_past: usize) {
        self.positions.tokens.truncate(n_past);
    }

    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()> {
        self.positions.write(tokens, n_past)?;
        self.forward();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }
}

/// Backend that steers sampling through a fixed token script.
///
/// After each eval the logits peak at the next script token. The script
/// advances once that token is evaluated at the position right after the
/// context that produced the peak, which is what happens when the chat loop
/// samples it and feeds it back. When the script runs out the logits peak at
/// `end_token`.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    positions: Positions,
    vocab_size: usize,
    script: Vec<TokenId>,
    next: usize,
    /// Position where the peaked token is expected.
    anchor: usize,
    end_token: TokenId,
    failures_left: usize,
    eval_count: usize,
    logits: Vec<f32>,
}

impl ScriptedEngine {
    const PEAK: f32 = 30.0;

    pub fn new(vocab_size: usize, context_limit: usize, script: Vec<TokenId>, end_token: TokenId) -> Self {
        let mut engine = Self {
            positions: Positions {
                tokens: Vec::new(),
                limit: context_limit,
            },
            vocab_size,
            script,
            next: 0,
            anchor: 0,
            end_token,
            failures_left: 0,
            eval_count: 0,
            logits: vec![0.0; vocab_size],
        };
        engine.peak();
        engine
    }

    /// Make the next `count` eval calls fail.
    pub fn fail_next_evals(&mut self, count: usize) {
        self.failures_left = count;
    }

    /// Number of script tokens fed back so far.
    pub fn consumed(&self) -> usize {
        self.next
    }

    /// Number of eval calls, failed ones included.
    pub fn eval_count(&self) -> usize {
        self.eval_count
    }

    /// Tokens currently held in the context.
    pub fn held(&self) -> &[TokenId] {
        &self.positions.tokens
    }

    fn peak(&mut self) {
        let target = self.script.get(self.next).copied().unwrap_or(self.end_token);
        self.logits.iter_mut().for_each(|l| *l = 0.0);
        if let Some(logit) = usize::try_from(target)
            .ok()
            .and_then(|idx| self.logits.get_mut(idx))
        {
            *logit = Self::PEAK;
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn context_limit(&self) -> usize {
        self.positions.limit
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn set_threads(&mut self, _thread_count: usize, _batch_thread_count: usize) {}

    fn truncate(&mut self, n_past: usize) {
        self.positions.tokens.truncate(n_past);
    }

    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()> {
        self.eval_count += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(EngineError::Eval {
                position: n_past,
                reason: "injected failure".to_string(),
            });
        }
        self.positions.write(tokens, n_past)?;
        let held = &self.positions.tokens;
        if held.len() > self.anchor {
            if held.get(self.anchor) == self.script.get(self.next) {
                self.next += 1;
            }
            self.anchor = held.len();
        }
        self.peak();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_engine_is_deterministic() {
        let mut a = HashEngine::new(16, 64, 3);
        let mut b = HashEngine::new(16, 64, 3);
        a.eval(&[1, 2, 3], 0).unwrap();
        b.eval(&[1, 2, 3], 0).unwrap();
        assert_eq!(a.logits(), b.logits());
        assert_eq!(a.logits().len(), 16);
    }

    #[test]
    fn hash_engine_logits_follow_context() {
        let mut engine = HashEngine::new(16, 64, 0);
        engine.eval(&[1, 2, 3], 0).unwrap();
        let first = engine.logits().to_vec();
        engine.eval(&[4], 3).unwrap();
        assert_ne!(engine.logits(), first.as_slice());
        engine.eval(&[3], 2).unwrap();
        assert_eq!(engine.logits(), first.as_slice());
    }

    #[test]
    fn eval_rejects_position_gap() {
        let mut engine = HashEngine::new(4, 64, 0);
        assert!(matches!(
            engine.eval(&[1], 2),
            Err(EngineError::PositionGap { n_past: 2, held: 0 })
        ));
    }

    #[test]
    fn eval_rejects_overflow() {
        let mut engine = HashEngine::new(4, 2, 0);
        assert!(matches!(
            engine.eval(&[1, 2, 3], 0),
            Err(EngineError::ContextOverflow { needed: 3, limit: 2 })
        ));
    }

    #[test]
    fn scripted_engine_advances_on_feedback() {
        let mut engine = ScriptedEngine::new(8, 64, vec![5, 6], 1);
        engine.eval(&[0, 2], 0).unwrap();
        assert_eq!(engine.logits()[5], ScriptedEngine::PEAK);
        engine.eval(&[5], 2).unwrap();
        assert_eq!(engine.consumed(), 1);
        assert_eq!(engine.logits()[6], ScriptedEngine::PEAK);
        engine.eval(&[6], 3).unwrap();
        assert_eq!(engine.logits()[1], ScriptedEngine::PEAK);
    }

    #[test]
    fn scripted_engine_injects_failures() {
        let mut engine = ScriptedEngine::new(8, 64, vec![], 1);
        engine.fail_next_evals(1);
        assert!(matches!(engine.eval(&[0], 0), Err(EngineError::Eval { .. })));
        assert!(engine.eval(&[0], 0).is_ok());
        assert_eq!(engine.eval_count(), 2);
    }
}
