//! Engine contract tests
//!
//! Validates: reference backends honor the positional-context contract
//! when driven through `Box<dyn InferenceEngine>`, and sampling over their
//! logits behaves the way the chat loop expects.

use rendez_engine::{EngineError, HashEngine, InferenceEngine, ScriptedEngine};
use rendez_sampling::{Sampler, SamplingConfig};

// ===== Section A: Positional context =====

#[test]
fn boxed_engine_evaluates_in_batches() {
    let mut engine: Box<dyn InferenceEngine> = Box::new(HashEngine::new(32, 128, 7));
    let prompt: Vec<i32> = (0..20).collect();
    for (i, chunk) in prompt.chunks(6).enumerate() {
        engine.eval(chunk, i * 6).expect("eval");
    }
    let batched = engine.logits().to_vec();

    let mut whole = HashEngine::new(32, 128, 7);
    whole.eval(&prompt, 0).expect("eval");
    assert_eq!(whole.logits(), batched.as_slice());
}

#[test]
fn truncate_then_eval_replaces_tail() {
    let mut engine = ScriptedEngine::new(8, 16, vec![], 1);
    engine.eval(&[0, 2, 3, 4], 0).expect("eval");
    engine.truncate(2);
    assert_eq!(engine.held(), &[0, 2]);
    engine.eval(&[5], 2).expect("eval");
    assert_eq!(engine.held(), &[0, 2, 5]);
}

#[test]
fn eval_past_held_positions_is_a_gap() {
    let mut engine = HashEngine::new(8, 16, 0);
    engine.eval(&[1, 2], 0).expect("eval");
    engine.truncate(1);
    assert!(matches!(
        engine.eval(&[3], 2),
        Err(EngineError::PositionGap { n_past: 2, held: 1 })
    ));
}

// ===== Section B: Sampling over engine logits =====

#[test]
fn scripted_engine_drives_sampler() {
    let script = vec![3, 4, 5];
    let mut engine = ScriptedEngine::new(8, 64, script.clone(), 1);
    let mut sampler = Sampler::new(SamplingConfig::default(), 11);

    engine.eval(&[0], 0).expect("eval");
    let mut produced = Vec::new();
    for pos in 1..=4 {
        let token = sampler.sample(engine.logits(), &[]).expect("sample") as i32;
        sampler.accept(token as usize);
        produced.push(token);
        engine.eval(&[token], pos).expect("eval");
    }
    assert_eq!(produced, vec![3, 4, 5, 1]);
    assert_eq!(engine.consumed(), 3);
}

#[test]
fn hash_engine_threads_are_at_least_one() {
    let mut engine = HashEngine::new(8, 16, 0);
    engine.set_threads(0, 0);
    assert_eq!(engine.thread_count(), 1);
    engine.set_threads(4, 8);
    assert_eq!(engine.thread_count(), 4);
}
