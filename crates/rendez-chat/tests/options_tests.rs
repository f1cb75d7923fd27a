//! Chat option loading tests.
//!
//! Validates: JSON option files with prompt files beside them, name
//! inference from the rolling prompt, role prefixes and suffixes, alias
//! substitution, runtime `/set` options, and the exit status of fatal
//! configuration errors.

use std::fs;

use rendez_chat::{ChatError, ChatOptions, ConfigError, DynamicOptions};
use rendez_chat::options::apply_substitution;
use rendez_vocab::{PieceTable, PieceTokenizer, Vocabulary};

// ===== Section A: Files =====

#[test]
fn loads_prompts_relative_to_option_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("priming.txt"), "A friendly chat.\n").unwrap();
    fs::write(dir.path().join("rolling.txt"), "Ann: Hello\nBob: Hi there\n").unwrap();
    fs::write(dir.path().join("answer.txt"), "(keep it short)").unwrap();
    let path = dir.path().join("chat.json");
    fs::write(
        &path,
        r#"{
            "x_priming": "priming.txt",
            "x_rolling": "rolling.txt",
            "x_answer": "answer.txt",
            "o_rolling": "out/transcript.txt",
            "sentence_limit": 3
        }"#,
    )
    .unwrap();

    let mut opt = ChatOptions::from_file(&path).expect("load");
    assert_eq!(opt.o_rolling.as_deref(), Some(dir.path().join("out/transcript.txt").as_path()));
    opt.initialize().expect("initialize");

    assert_eq!(opt.priming_prompt, "A friendly chat.\n");
    assert_eq!(opt.rolling_prompt, "Ann: Hello\nBob: Hi there\n");
    assert_eq!(opt.answer_prompt, "(keep it short)\n");
    assert_eq!(opt.protagonist, "Bob");
    assert_eq!(opt.confidant, "Ann");
    assert_eq!(opt.roles[0].prefix, "Bob: ");
    assert_eq!(opt.roles[1].prefix, "Ann:");
    assert_eq!(opt.sentence_limit, 3);
}

#[test]
fn unreadable_and_malformed_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing.json");
    assert!(matches!(
        ChatOptions::from_file(&missing),
        Err(ConfigError::Unreadable { .. })
    ));

    let bad = dir.path().join("bad.json");
    fs::write(&bad, "{ not json").unwrap();
    assert!(matches!(
        ChatOptions::from_file(&bad),
        Err(ConfigError::Parse { .. })
    ));

    let mut opt = ChatOptions {
        protagonist: "A".into(),
        confidant: "B".into(),
        x_priming: Some(dir.path().join("nope.txt")),
        ..ChatOptions::default()
    };
    assert!(matches!(opt.initialize(), Err(ConfigError::Unreadable { .. })));
}

// ===== Section B: Roles and names =====

#[test]
fn missing_names_exit_64() {
    let err = ChatOptions::default().initialize().unwrap_err();
    assert!(matches!(err, ConfigError::MissingName("protagonist")));
    assert_eq!(ChatError::from(err).exit_code(), 64);

    let mut opt = ChatOptions {
        protagonist: "A".into(),
        ..ChatOptions::default()
    };
    assert!(matches!(
        opt.initialize(),
        Err(ConfigError::MissingName("confidant"))
    ));
}

#[test]
fn chat_prefixes_with_suffixes_and_aliases() {
    let mut opt: ChatOptions = serde_json::from_str(
        r#"{
            "protagonist": "User",
            "confidant": "Bot",
            "substitution": {"protagonist_alias": "{{user}}", "confidant_alias": "{{char}}"},
            "chat_prefixes": ["{{user}}: ", {"prefix": "{{char}}:", "suffix": "\n\n"}],
            "rolling_prompt": "{{user}}: hi {{char}}\n"
        }"#,
    )
    .expect("parse");
    opt.initialize().expect("initialize");
    assert_eq!(opt.role_count(), 2);
    assert_eq!(opt.roles[0].prefix, "User: ");
    assert_eq!(opt.roles[0].suffix, "\n");
    assert_eq!(opt.roles[1].prefix, "Bot:");
    assert_eq!(opt.roles[1].suffix, "\n\n");
    assert_eq!(opt.rolling_prompt, "User: hi Bot\n");
    assert!(opt.antiprompts().contains("\n\n"));
}

#[test]
fn newline_terminal_enables_multiline_confidant() {
    let mut opt = ChatOptions {
        protagonist: "A".into(),
        confidant: "B".into(),
        ..ChatOptions::default()
    };
    opt.set_sentence_terminals(["\n"]);
    opt.initialize().expect("initialize");
    assert!(opt.multiline_confidant_on);
}

#[test]
fn token_limits_follow_engine() {
    let mut opt = ChatOptions::default();
    opt.resolve_token_limits(2048);
    assert_eq!(opt.model_token_limit, 2048);
    assert_eq!(opt.context_token_limit, 2048);

    let mut opt = ChatOptions {
        context_token_limit: 512,
        ..ChatOptions::default()
    };
    opt.resolve_token_limits(2048);
    assert_eq!(opt.context_token_limit, 512);
}

// ===== Section C: Substitution =====

#[test]
fn special_token_aliases() {
    let table = PieceTable {
        specials: vec!["<|im_end|>".into()],
        ..PieceTable::default()
    };
    let mut vocab = Vocabulary::new(PieceTokenizer::from_table(table));
    let opt: ChatOptions = serde_json::from_str(
        r#"{"substitution": {
            "eos_token_alias": "</s>",
            "special_tokens": [{"alias": "<END>", "candidates": ["<|eot_id|>", "<|im_end|>"]}]
        }}"#,
    )
    .expect("parse");
    apply_substitution(&mut vocab, &opt.substitution).expect("substitute");
    assert_eq!(vocab.eos_token_alias(), "</s>");
    let tokens = vocab.tokenize("hi<END>");
    assert_eq!(tokens.last().copied(), vocab.tokenize_special("<|im_end|>").ok());

    let missing: ChatOptions = serde_json::from_str(
        r#"{"substitution": {"special_tokens": [{"alias": "<X>", "candidates": ["<nope>"]}]}}"#,
    )
    .expect("parse");
    let err = apply_substitution(&mut vocab, &missing.substitution).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownSpecialToken(_)));
    assert_eq!(ChatError::from(err).exit_code(), 65);
}

// ===== Section D: Runtime options =====

#[test]
fn dynamic_options_apply() {
    let mut opt = ChatOptions {
        protagonist: "A".into(),
        confidant: "B".into(),
        ..ChatOptions::default()
    };
    opt.initialize().expect("initialize");

    let names = DynamicOptions::parse(r#"{"confidant": "Cy", "sentence_token_limit": 9}"#).unwrap();
    assert!(!names.apply(&mut opt));
    assert_eq!(opt.roles[1].prefix, "Cy:");
    assert_eq!(opt.sentence_token_limit, 9);

    let sampling = DynamicOptions::parse(r#"{"sampling": {"adjust_thru": [{"temperature": 0.0}]}}"#).unwrap();
    assert!(sampling.apply(&mut opt));

    assert!(DynamicOptions::parse(r#"{"no_such_option": 1}"#).is_err());
}
