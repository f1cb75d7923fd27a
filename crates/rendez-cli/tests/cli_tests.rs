//! CLI wiring tests.
//!
//! Validates:
//! - Flags override values from the options file
//! - Fatal configuration errors carry their exit status
//! - A full session over the reference engine runs to end of input and
//!   leaves a transcript

use std::fs;
use std::io::Cursor;

use clap::Parser;
use rendez_cli::{load_options, load_vocabulary, run_chat, ChatArgs};

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    chat: ChatArgs,
}

fn parse(args: &[&str]) -> ChatArgs {
    TestCli::parse_from(std::iter::once("rendezllama").chain(args.iter().copied())).chat
}

// ===== Section A: Options =====

#[test]
fn flags_override_options_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let setting = dir.path().join("chat.json");
    fs::write(
        &setting,
        r#"{"protagonist": "Ann", "confidant": "Bob", "thread_count": 2, "batch_count": 64}"#,
    )
    .unwrap();

    let args = parse(&[
        "--x_setting",
        setting.to_str().unwrap(),
        "--confidant",
        "Cy",
        "--batch_count",
        "8",
        "--seed",
        "5",
    ]);
    let opt = load_options(&args).expect("options");
    assert_eq!(opt.protagonist, "Ann");
    assert_eq!(opt.confidant, "Cy");
    assert_eq!(opt.thread_count, 2);
    assert_eq!(opt.batch_count, 8);
    assert_eq!(opt.sampling.seed, Some(5));
    assert_eq!(opt.roles[1].prefix, "Cy:");
}

#[test]
fn missing_confidant_is_exit_64() {
    let args = parse(&["--protagonist", "Ann"]);
    let err = load_options(&args).unwrap_err();
    assert_eq!(err.exit_code(), 64);
}

#[test]
fn unknown_special_token_is_exit_65() {
    let dir = tempfile::tempdir().expect("tempdir");
    let setting = dir.path().join("chat.json");
    fs::write(
        &setting,
        r#"{"protagonist": "A", "confidant": "B",
            "substitution": {"special_tokens": [{"alias": "<E>", "candidates": ["<|eot|>"]}]}}"#,
    )
    .unwrap();
    let args = parse(&["--x_setting", setting.to_str().unwrap()]);
    let opt = load_options(&args).expect("options");
    let err = load_vocabulary(&opt).unwrap_err();
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn tokenizer_table_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let table = dir.path().join("pieces.json");
    fs::write(&table, r#"{"specials": ["<|eot|>"], "pieces": [" hello", "\n"]}"#).unwrap();
    let args = parse(&[
        "--protagonist",
        "A",
        "--confidant",
        "B",
        "--tokenizer",
        table.to_str().unwrap(),
    ]);
    let opt = load_options(&args).expect("options");
    let vocab = load_vocabulary(&opt).expect("vocabulary");
    assert_eq!(vocab.tokenize(" hello").len(), 1);
    assert!(vocab.tokenize_special("<|eot|>").is_ok());
}

// ===== Section B: Full session =====

#[test]
fn coprocess_session_runs_to_end_of_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transcript = dir.path().join("transcript.txt");
    let args = parse(&[
        "--coprocess_mode_on",
        "--o_rolling",
        transcript.to_str().unwrap(),
        "--model_token_limit",
        "64",
        "--seed",
        "3",
    ]);
    let mut input = Cursor::new(b"/puts Hello there.\n/opt\n".to_vec());
    run_chat(
        &args,
        &mut input,
        Box::new(std::io::sink()),
        Box::new(std::io::sink()),
    )
    .expect("run");

    let text = fs::read_to_string(&transcript).expect("transcript");
    assert!(text.starts_with("Hello there.\n"), "{text:?}");
}
