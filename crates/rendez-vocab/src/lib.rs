//! # rendez-vocab
//!
//! Token vocabulary for rendezllama.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - A reference piece tokenizer (greedy longest match) for tests and demos
//! - `Vocabulary`, which layers alias substitution and in-context
//!   detokenization over any backend

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;

mod vocabulary;

pub use vocabulary::Vocabulary;

/// Identifier of one token in the model vocabulary.
pub type TokenId = i32;

/// Error type for vocabulary operations.
#[derive(Debug, thiserror::Error)]
pub enum VocabError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Unknown special token: {0}")]
    UnknownSpecialToken(String),
    #[error("Invalid piece table: {0}")]
    InvalidPieces(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type VocabResult<T> = std::result::Result<T, VocabError>;

/// Core tokenizer trait. Implementations can be swapped without changing chat code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs. Special tokens are never produced.
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Append the text of a single token to `out`.
    fn decode_token(&self, token: TokenId, out: &mut String) -> VocabResult<()>;

    /// Like `decode_token`, but aware of the token that precedes it.
    ///
    /// Backends whose pieces carry a word-leading space drop it right after
    /// the beginning-of-stream token.
    fn decode_token_after(
        &self,
        prev: Option<TokenId>,
        token: TokenId,
        out: &mut String,
    ) -> VocabResult<()> {
        let _ = prev;
        self.decode_token(token, out)
    }

    /// Look up a special token by its literal name (e.g. `<|im_end|>`).
    fn special_token(&self, name: &str) -> Option<TokenId>;

    fn bos_token_id(&self) -> TokenId;
    fn eos_token_id(&self) -> TokenId;
    fn newline_token_id(&self) -> TokenId;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// On-disk description of a piece table.
#[derive(Debug, Clone, Deserialize)]
pub struct PieceTable {
    #[serde(default = "default_bos")]
    pub bos: String,
    #[serde(default = "default_eos")]
    pub eos: String,
    #[serde(default)]
    pub specials: Vec<String>,
    #[serde(default)]
    pub pieces: Vec<String>,
}

fn default_bos() -> String {
    "<s>".to_string()
}

fn default_eos() -> String {
    "</s>".to_string()
}

impl Default for PieceTable {
    fn default() -> Self {
        Self {
            bos: default_bos(),
            eos: default_eos(),
            specials: Vec::new(),
            pieces: vec!["\n".to_string(), " ".to_string()],
        }
    }
}

/// Reference piece tokenizer.
///
/// - Greedy longest match against the piece table
/// - Characters with no piece get a fresh ID on first sight
/// - Special tokens (including BOS and EOS) decode to nothing
/// - Deterministic
pub struct PieceTokenizer {
    state: RwLock<PieceState>,
    special_ids: HashMap<String, TokenId>,
    bos: TokenId,
    eos: TokenId,
    newline: TokenId,
}

#[derive(Debug, Default)]
struct PieceState {
    pieces: Vec<String>,
    special: Vec<bool>,
    lookup: HashMap<String, TokenId>,
    max_piece_len: usize,
}

impl PieceState {
    fn push(&mut self, text: &str, special: bool) -> TokenId {
        let id = self.pieces.len() as TokenId;
        self.pieces.push(text.to_string());
        self.special.push(special);
        if !special {
            self.lookup.insert(text.to_string(), id);
            self.max_piece_len = self.max_piece_len.max(text.len());
        }
        id
    }
}

impl PieceTokenizer {
    pub fn new() -> Self {
        Self::from_table(PieceTable::default())
    }

    /// Build a tokenizer whose plain pieces are `pieces`, with default BOS/EOS.
    pub fn with_pieces<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_table(PieceTable {
            pieces: pieces.into_iter().map(Into::into).collect(),
            ..PieceTable::default()
        })
    }

    pub fn from_table(table: PieceTable) -> Self {
        let mut state = PieceState::default();
        let mut special_ids = HashMap::new();
        let bos = state.push(&table.bos, true);
        special_ids.insert(table.bos.clone(), bos);
        let eos = state.push(&table.eos, true);
        special_ids.insert(table.eos.clone(), eos);
        for name in &table.specials {
            if !special_ids.contains_key(name) {
                let id = state.push(name, true);
                special_ids.insert(name.clone(), id);
            }
        }
        for piece in &table.pieces {
            if !piece.is_empty() && !state.lookup.contains_key(piece) {
                state.push(piece, false);
            }
        }
        let newline = match state.lookup.get("\n") {
            Some(&id) => id,
            None => state.push("\n", false),
        };

        Self {
            state: RwLock::new(state),
            special_ids,
            bos,
            eos,
            newline,
        }
    }

    /// Load a JSON piece table from disk.
    pub fn from_file(path: impl AsRef<Path>) -> VocabResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let table: PieceTable = serde_json::from_str(&text)?;
        if table.bos == table.eos {
            return Err(VocabError::InvalidPieces(
                "bos and eos must differ".to_string(),
            ));
        }
        Ok(Self::from_table(table))
    }
}

impl Default for PieceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for PieceTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let mut matched = None;
            let mut end = rest.len().min(state.max_piece_len);
            while end > 0 {
                if rest.is_char_boundary(end) {
                    if let Some(&id) = state.lookup.get(&rest[..end]) {
                        matched = Some((id, end));
                        break;
                    }
                }
                end -= 1;
            }
            let (id, len) = match matched {
                Some(m) => m,
                None => {
                    let len = rest.chars().next().map_or(1, char::len_utf8);
                    (state.push(&rest[..len], false), len)
                }
            };
            ids.push(id);
            rest = &rest[len..];
        }
        ids
    }

    fn decode_token(&self, token: TokenId, out: &mut String) -> VocabResult<()> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let idx = usize::try_from(token).map_err(|_| VocabError::InvalidToken(token))?;
        match (state.pieces.get(idx), state.special.get(idx)) {
            (Some(_), Some(true)) => Ok(()),
            (Some(piece), _) => {
                out.push_str(piece);
                Ok(())
            }
            _ => Err(VocabError::InvalidToken(token)),
        }
    }

    fn decode_token_after(
        &self,
        prev: Option<TokenId>,
        token: TokenId,
        out: &mut String,
    ) -> VocabResult<()> {
        if prev != Some(self.bos) {
            return self.decode_token(token, out);
        }
        let mut piece = String::new();
        self.decode_token(token, &mut piece)?;
        out.push_str(piece.strip_prefix(' ').unwrap_or(&piece));
        Ok(())
    }

    fn special_token(&self, name: &str) -> Option<TokenId> {
        self.special_ids.get(name).copied()
    }

    fn bos_token_id(&self) -> TokenId {
        self.bos
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos
    }

    fn newline_token_id(&self) -> TokenId {
        self.newline
    }

    fn vocab_size(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pieces
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefers_longest_piece() {
        let tok = PieceTokenizer::with_pieces(["he", "hello", "l", "o"]);
        let ids = tok.encode("hello");
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn encode_empty_string() {
        let tok = PieceTokenizer::new();
        assert!(tok.encode("").is_empty());
    }

    #[test]
    fn unseen_chars_grow_vocab() {
        let tok = PieceTokenizer::new();
        let before = tok.vocab_size();
        let ids = tok.encode("héé");
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[1], ids[2]);
        assert_eq!(tok.vocab_size(), before + 2);
    }

    #[test]
    fn decode_roundtrip() {
        let tok = PieceTokenizer::with_pieces([" world", "hello"]);
        let mut out = String::new();
        for id in tok.encode("hello world!\n") {
            tok.decode_token(id, &mut out).unwrap();
        }
        assert_eq!(out, "hello world!\n");
    }

    #[test]
    fn specials_decode_to_nothing() {
        let tok = PieceTokenizer::from_table(PieceTable {
            specials: vec!["<|im_end|>".to_string()],
            ..PieceTable::default()
        });
        let im_end = tok.special_token("<|im_end|>").unwrap();
        let mut out = String::new();
        tok.decode_token(tok.bos_token_id(), &mut out).unwrap();
        tok.decode_token(tok.eos_token_id(), &mut out).unwrap();
        tok.decode_token(im_end, &mut out).unwrap();
        assert_eq!(out, "");
        assert_eq!(tok.encode("<").len(), 1);
    }

    #[test]
    fn decode_invalid_token_errors() {
        let tok = PieceTokenizer::new();
        let mut out = String::new();
        assert!(matches!(
            tok.decode_token(999, &mut out),
            Err(VocabError::InvalidToken(999))
        ));
        assert!(matches!(
            tok.decode_token(-1, &mut out),
            Err(VocabError::InvalidToken(-1))
        ));
    }

    #[test]
    fn leading_space_dropped_after_bos() {
        let tok = PieceTokenizer::with_pieces([" Hi"]);
        let hi = tok.encode(" Hi")[0];
        let mut out = String::new();
        tok.decode_token_after(Some(tok.bos_token_id()), hi, &mut out)
            .unwrap();
        assert_eq!(out, "Hi");
        out.clear();
        tok.decode_token_after(Some(tok.newline_token_id()), hi, &mut out)
            .unwrap();
        assert_eq!(out, " Hi");
    }

    #[test]
    fn newline_piece_always_present() {
        let tok = PieceTokenizer::with_pieces(["a"]);
        assert_eq!(tok.encode("\n"), vec![tok.newline_token_id()]);
    }
}
