//! # rendez-sampling
//!
//! Configurable sampling chain for rendezllama.
//!
//! A sampler runs in three stages:
//! - Penalties over the recently accepted tokens (repeat, frequency, presence)
//! - An ordered list of adjustments (top-k, typical-p, top-p, min-p, temperature)
//! - A pick strategy (plain probability or Mirostat v1/v2)
//!
//! Randomness comes from a seeded xorshift generator, so a fixed seed
//! reproduces the same choices.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Temperature must be >= 0")]
    InvalidTemperature,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// One step of the adjustment chain, applied in configured order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustVia {
    /// Keep the K most likely tokens.
    TopK(usize),
    /// Locally typical sampling: keep tokens whose surprise is closest to the entropy.
    TypicalP(f32),
    /// Nucleus: keep the smallest set whose cumulative probability reaches P.
    TopP(f32),
    /// Drop tokens less likely than P times the most likely one.
    MinP(f32),
    /// Divide logits by T. Zero means greedy.
    Temperature(f32),
}

/// How the final token is drawn from the adjusted distribution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickVia {
    #[default]
    Probability,
    Mirostat {
        #[serde(default = "default_mirostat_version")]
        version: u8,
        #[serde(default = "default_mirostat_tau")]
        tau: f32,
        #[serde(default = "default_mirostat_eta")]
        eta: f32,
    },
}

fn default_mirostat_version() -> u8 {
    2
}
fn default_mirostat_tau() -> f32 {
    5.0
}
fn default_mirostat_eta() -> f32 {
    0.1
}

impl PickVia {
    pub fn mirostat() -> Self {
        PickVia::Mirostat {
            version: default_mirostat_version(),
            tau: default_mirostat_tau(),
            eta: default_mirostat_eta(),
        }
    }
}

/// Penalties computed over the last `window` accepted tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Penalties {
    #[serde(default = "default_penalty_window")]
    pub window: usize,
    /// Repeat penalty (1.0 = none). Values > 1.0 discourage repetition.
    #[serde(default = "default_repeat_penalty")]
    pub repeat: f32,
    #[serde(default)]
    pub frequency: f32,
    #[serde(default)]
    pub presence: f32,
}

fn default_penalty_window() -> usize {
    20
}
fn default_repeat_penalty() -> f32 {
    1.17
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            window: default_penalty_window(),
            repeat: default_repeat_penalty(),
            frequency: 0.0,
            presence: 0.0,
        }
    }
}

impl Penalties {
    pub fn none() -> Self {
        Self {
            window: 0,
            repeat: 1.0,
            frequency: 0.0,
            presence: 0.0,
        }
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_adjust_thru")]
    pub adjust_thru: Vec<AdjustVia>,
    #[serde(default)]
    pub pick_via: PickVia,
    #[serde(default)]
    pub penalties: Penalties,
    /// Fixed seed. Without one, every sampler build seeds from the clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_adjust_thru() -> Vec<AdjustVia> {
    vec![AdjustVia::MinP(0.1), AdjustVia::Temperature(0.8)]
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            adjust_thru: default_adjust_thru(),
            pick_via: PickVia::default(),
            penalties: Penalties::default(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling with no penalties.
    pub fn greedy() -> Self {
        Self {
            adjust_thru: vec![AdjustVia::Temperature(0.0)],
            pick_via: PickVia::Probability,
            penalties: Penalties::none(),
            seed: None,
        }
    }
}

/// Stateful sampler built from a `SamplingConfig`.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: SeededRng,
    history: VecDeque<usize>,
    mirostat_mu: f32,
}

impl Sampler {
    pub fn new(config: SamplingConfig, seed: u64) -> Self {
        let mirostat_mu = match config.pick_via {
            PickVia::Mirostat { tau, .. } => 2.0 * tau,
            PickVia::Probability => 0.0,
        };
        Self {
            config,
            rng: SeededRng::new(seed),
            history: VecDeque::new(),
            mirostat_mu,
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Current Mirostat target surprise bound.
    pub fn mirostat_mu(&self) -> f32 {
        self.mirostat_mu
    }

    /// Record a token as part of the generated history.
    pub fn accept(&mut self, token: usize) {
        let window = self.config.penalties.window;
        if window == 0 {
            return;
        }
        self.history.push_back(token);
        while self.history.len() > window {
            self.history.pop_front();
        }
    }

    /// Sample a token index from logits. `forbidden` tokens are never chosen.
    pub fn sample(&mut self, logits: &[f32], forbidden: &[usize]) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let mut work_logits = logits.to_vec();
        for &token_id in forbidden {
            if token_id < work_logits.len() {
                work_logits[token_id] = f32::NEG_INFINITY;
            }
        }

        self.apply_penalties(&mut work_logits);

        let mut greedy = false;
        for adjust in &self.config.adjust_thru {
            match *adjust {
                AdjustVia::Temperature(t) if t < 0.0 => {
                    return Err(SamplingError::InvalidTemperature)
                }
                AdjustVia::Temperature(t) if t == 0.0 => greedy = true,
                AdjustVia::Temperature(t) => {
                    if (t - 1.0).abs() > 1e-6 {
                        for logit in &mut work_logits {
                            *logit /= t;
                        }
                    }
                }
                AdjustVia::TopK(k) => Self::apply_top_k(&mut work_logits, k),
                AdjustVia::TopP(p) => {
                    let probs = Self::apply_top_p(&Self::softmax(&work_logits), p);
                    Self::mask_zero_probs(&mut work_logits, &probs);
                }
                AdjustVia::MinP(p) => Self::apply_min_p(&mut work_logits, p),
                AdjustVia::TypicalP(p) => Self::apply_typical_p(&mut work_logits, p),
            }
        }

        if work_logits.iter().all(|l| *l == f32::NEG_INFINITY) {
            return Err(SamplingError::NoValidTokens);
        }
        if greedy {
            return Ok(Self::argmax(&work_logits));
        }

        match self.config.pick_via {
            PickVia::Probability => {
                let probs = Self::softmax(&work_logits);
                self.sample_from_distribution(&probs)
            }
            PickVia::Mirostat { version, tau, eta } => {
                self.pick_mirostat(&work_logits, version, tau, eta)
            }
        }
    }

    /// Apply repeat, frequency, and presence penalties over the history window.
    fn apply_penalties(&self, logits: &mut [f32]) {
        if self.history.is_empty() {
            return;
        }
        let Penalties {
            repeat,
            frequency,
            presence,
            ..
        } = self.config.penalties;

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for &token_id in &self.history {
            *counts.entry(token_id).or_default() += 1;
        }

        for (&token_id, &count) in &counts {
            let Some(logit) = logits.get_mut(token_id) else {
                continue;
            };
            if (repeat - 1.0).abs() > 1e-6 {
                // Positive logits shrink, negative logits grow more negative.
                if *logit > 0.0 {
                    *logit /= repeat;
                } else {
                    *logit *= repeat;
                }
            }
            *logit -= count as f32 * frequency + presence;
        }
    }

    fn apply_top_k(logits: &mut [f32], k: usize) {
        if k == 0 || k >= logits.len() {
            return;
        }

        let mut indexed: Vec<(usize, f32)> =
            logits.iter().enumerate().map(|(i, &l)| (i, l)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let threshold = indexed[k - 1].1;
        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
        let mut indexed: Vec<(usize, f32)> =
            probs.iter().enumerate().map(|(i, &pr)| (i, pr)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cumsum = 0.0;
        let mut cutoff_idx = 0;
        for (idx, (_, prob)) in indexed.iter().enumerate() {
            cumsum += prob;
            cutoff_idx = idx;
            if cumsum >= p {
                break;
            }
        }

        let cutoff_prob = indexed[cutoff_idx].1;
        let mut result = vec![0.0; probs.len()];
        for (i, &pr) in probs.iter().enumerate() {
            if pr >= cutoff_prob {
                result[i] = pr;
            }
        }

        // Renormalize
        let sum: f32 = result.iter().sum();
        if sum > 0.0 {
            for p in &mut result {
                *p /= sum;
            }
        }

        result
    }

    fn apply_min_p(logits: &mut [f32], p: f32) {
        let probs = Self::softmax(logits);
        let max_prob = probs.iter().cloned().fold(0.0, f32::max);
        let floor = p * max_prob;
        for (logit, &prob) in logits.iter_mut().zip(&probs) {
            if prob < floor {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_typical_p(logits: &mut [f32], p: f32) {
        if p >= 1.0 {
            return;
        }
        let probs = Self::softmax(logits);
        let entropy: f32 = probs
            .iter()
            .filter(|&&pr| pr > 0.0)
            .map(|&pr| -pr * pr.ln())
            .sum();

        let mut indexed: Vec<(usize, f32)> = probs
            .iter()
            .enumerate()
            .filter(|(_, &pr)| pr > 0.0)
            .map(|(i, &pr)| (i, (-pr.ln() - entropy).abs()))
            .collect();
        indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut keep = vec![false; logits.len()];
        let mut cumsum = 0.0;
        for &(i, _) in &indexed {
            keep[i] = true;
            cumsum += probs[i];
            if cumsum >= p {
                break;
            }
        }
        for (logit, kept) in logits.iter_mut().zip(keep) {
            if !kept {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn mask_zero_probs(logits: &mut [f32], probs: &[f32]) {
        for (logit, &prob) in logits.iter_mut().zip(probs) {
            if prob <= 0.0 {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    /// Mirostat: truncate to a target surprise, then steer `mu` toward `tau`.
    fn pick_mirostat(
        &mut self,
        logits: &[f32],
        version: u8,
        tau: f32,
        eta: f32,
    ) -> SamplingResult<usize> {
        let probs = Self::softmax(logits);
        let mut sorted: Vec<(usize, f32)> = probs
            .iter()
            .enumerate()
            .filter(|(_, &pr)| pr > 0.0)
            .map(|(i, &pr)| (i, pr))
            .collect();
        sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if sorted.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }

        let keep = if version == 1 {
            Self::mirostat_v1_k(&sorted, self.mirostat_mu)
        } else {
            sorted
                .iter()
                .take_while(|(_, pr)| -pr.log2() <= self.mirostat_mu)
                .count()
                .max(1)
        };
        sorted.truncate(keep);

        let sum: f32 = sorted.iter().map(|(_, pr)| pr).sum();
        let mut truncated = vec![0.0; probs.len()];
        for &(i, pr) in &sorted {
            truncated[i] = pr / sum;
        }

        let picked = self.sample_from_distribution(&truncated)?;
        let observed = -truncated[picked].log2();
        self.mirostat_mu -= eta * (observed - tau);
        Ok(picked)
    }

    /// Estimate the Zipf exponent from the head of the distribution and derive top-k.
    fn mirostat_v1_k(sorted: &[(usize, f32)], mu: f32) -> usize {
        const M: usize = 100;
        let n = sorted.len();
        let head = n.min(M);

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..head.saturating_sub(1) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (sorted[i].1 / sorted[i + 1].1).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        if sum_ti_sq <= 0.0 {
            return 1;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;
        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(mu)) / (1.0 - (n as f32).powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
        if k.is_finite() && k >= 1.0 {
            (k.round() as usize).clamp(1, n)
        } else if k.is_finite() {
            1
        } else {
            n
        }
    }

    fn softmax(logits: &[f32]) -> Vec<f32> {
        let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let sum: f32 = exps.iter().sum();

        if sum > 0.0 {
            exps.iter().map(|&e| e / sum).collect()
        } else {
            vec![1.0 / logits.len() as f32; logits.len()]
        }
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn sample_from_distribution(&mut self, probs: &[f32]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;

        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Fallback to last token with nonzero probability
        for (i, &prob) in probs.iter().enumerate().rev() {
            if prob > 0.0 {
                return Ok(i);
            }
        }

        Err(SamplingError::NoValidTokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(adjust_thru: Vec<AdjustVia>) -> SamplingConfig {
        SamplingConfig {
            adjust_thru,
            pick_via: PickVia::Probability,
            penalties: Penalties::none(),
            seed: None,
        }
    }

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert!((v1 - v2).abs() < 1e-6);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn greedy_sampling() {
        let logits = vec![1.0, 10.0, 2.0, 0.5];
        let mut sampler = Sampler::new(SamplingConfig::greedy(), 7);
        assert_eq!(sampler.sample(&logits, &[]).unwrap(), 1);
    }

    #[test]
    fn softmax_uniform() {
        let probs = Sampler::softmax(&[1.0, 1.0, 1.0]);
        assert_eq!(probs.len(), 3);
        assert!((probs[0] - 1.0 / 3.0).abs() < 1e-5);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn top_k_filtering() {
        let mut logits = vec![1.0, 10.0, 2.0, 0.5, 3.0];
        Sampler::apply_top_k(&mut logits, 2);
        assert!(logits[1].is_finite());
        assert!(logits[4].is_finite());
        assert!(!logits[0].is_finite());
    }

    #[test]
    fn top_p_filtering() {
        let probs = vec![0.5, 0.3, 0.15, 0.05];
        let filtered = Sampler::apply_top_p(&probs, 0.8);
        assert!(filtered[0] > 0.0);
        assert!(filtered[1] > 0.0);
        assert_eq!(filtered[2], 0.0);
        assert_eq!(filtered[3], 0.0);
    }

    #[test]
    fn min_p_drops_unlikely_tokens() {
        let mut logits = vec![5.0, 4.9, 0.0, -3.0];
        Sampler::apply_min_p(&mut logits, 0.5);
        assert!(logits[0].is_finite());
        assert!(logits[1].is_finite());
        assert!(!logits[2].is_finite());
        assert!(!logits[3].is_finite());
    }

    #[test]
    fn typical_p_keeps_at_least_one() {
        let mut logits = vec![3.0, 1.0, 0.0];
        Sampler::apply_typical_p(&mut logits, 0.0);
        assert_eq!(logits.iter().filter(|l| l.is_finite()).count(), 1);
    }

    #[test]
    fn forbidden_tokens_never_sampled() {
        let logits = vec![10.0, 9.0, 1.0];
        let mut sampler = Sampler::new(plain(vec![AdjustVia::Temperature(0.0)]), 1);
        assert_eq!(sampler.sample(&logits, &[0]).unwrap(), 1);
        assert_eq!(
            sampler.sample(&logits, &[0, 1, 2]),
            Err(SamplingError::NoValidTokens)
        );
    }

    #[test]
    fn repeat_penalty_applies_to_history() {
        let config = SamplingConfig {
            penalties: Penalties {
                window: 4,
                repeat: 100.0,
                frequency: 0.0,
                presence: 0.0,
            },
            ..SamplingConfig::greedy()
        };
        let mut sampler = Sampler::new(config, 1);
        let logits = vec![2.0, 1.0];
        assert_eq!(sampler.sample(&logits, &[]).unwrap(), 0);
        sampler.accept(0);
        assert_eq!(sampler.sample(&logits, &[]).unwrap(), 1);
    }

    #[test]
    fn history_window_is_bounded() {
        let config = SamplingConfig {
            penalties: Penalties {
                window: 2,
                ..Penalties::default()
            },
            ..SamplingConfig::default()
        };
        let mut sampler = Sampler::new(config, 1);
        for t in 0..5 {
            sampler.accept(t);
        }
        assert_eq!(sampler.history.len(), 2);
        assert_eq!(sampler.history.front(), Some(&3));
    }

    #[test]
    fn mirostat_moves_mu() {
        let config = SamplingConfig {
            pick_via: PickVia::mirostat(),
            ..plain(vec![])
        };
        let mut sampler = Sampler::new(config, 3);
        assert!((sampler.mirostat_mu() - 10.0).abs() < 1e-6);
        let logits = vec![3.0, 2.0, 1.0, 0.0];
        let token = sampler.sample(&logits, &[]).unwrap();
        assert!(token < logits.len());
        assert!((sampler.mirostat_mu() - 10.0).abs() > 1e-6);
    }

    #[test]
    fn mirostat_v1_picks_valid_token() {
        let config = SamplingConfig {
            pick_via: PickVia::Mirostat {
                version: 1,
                tau: 3.0,
                eta: 0.1,
            },
            ..plain(vec![])
        };
        let mut sampler = Sampler::new(config, 9);
        let logits: Vec<f32> = (0..50).map(|i| -(i as f32) * 0.3).collect();
        for _ in 0..20 {
            assert!(sampler.sample(&logits, &[]).unwrap() < logits.len());
        }
    }

    #[test]
    fn negative_temperature_errors() {
        let mut sampler = Sampler::new(plain(vec![AdjustVia::Temperature(-1.0)]), 1);
        assert_eq!(
            sampler.sample(&[1.0, 2.0], &[]),
            Err(SamplingError::InvalidTemperature)
        );
    }

    #[test]
    fn empty_logits() {
        let mut sampler = Sampler::new(SamplingConfig::default(), 1);
        assert_eq!(sampler.sample(&[], &[]), Err(SamplingError::InvalidLogits));
    }
}
