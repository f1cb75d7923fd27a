//! Vocabulary wrapper with alias substitution.

use tracing::warn;

use crate::{TokenId, Tokenizer, VocabError, VocabResult};

/// A tokenizer plus the text aliases assigned to special tokens.
///
/// An alias is literal text that both tokenizes to its special token and is
/// rendered in its place. Without an alias, special tokens render as nothing.
pub struct Vocabulary {
    tokenizer: Box<dyn Tokenizer>,
    substitutions: Vec<(String, TokenId)>,
    eos_token_alias: String,
}

impl Vocabulary {
    pub fn new(tokenizer: impl Tokenizer + 'static) -> Self {
        Self::from_boxed(Box::new(tokenizer))
    }

    pub fn from_boxed(tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            substitutions: Vec::new(),
            eos_token_alias: String::new(),
        }
    }

    pub fn bos_token_id(&self) -> TokenId {
        self.tokenizer.bos_token_id()
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.tokenizer.eos_token_id()
    }

    pub fn newline_token_id(&self) -> TokenId {
        self.tokenizer.newline_token_id()
    }

    /// Number of distinct token IDs currently known.
    pub fn cardinality(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    /// Alias text for the end-of-stream token, or empty when none is assigned.
    pub fn eos_token_alias(&self) -> &str {
        &self.eos_token_alias
    }

    /// Look up a special token by name.
    pub fn tokenize_special(&self, name: &str) -> VocabResult<TokenId> {
        self.tokenizer
            .special_token(name)
            .ok_or_else(|| VocabError::UnknownSpecialToken(name.to_string()))
    }

    /// Make `alias` stand for `token_id` in both directions.
    pub fn assign_substitution(&mut self, alias: &str, token_id: TokenId) {
        if alias.is_empty() {
            return;
        }
        if token_id == self.eos_token_id() {
            self.eos_token_alias = alias.to_string();
        }
        self.substitutions.retain(|(a, id)| a != alias && *id != token_id);
        self.substitutions.push((alias.to_string(), token_id));
    }

    pub fn tokenize(&self, text: &str) -> Vec<TokenId> {
        let mut out = Vec::new();
        self.tokenize_to(&mut out, text);
        out
    }

    /// Tokenize `text`, turning every alias occurrence into its special token.
    pub fn tokenize_to(&self, out: &mut Vec<TokenId>, text: &str) {
        let mut rest = text;
        while let Some((pos, alias_len, id)) = self.next_alias(rest) {
            out.extend(self.tokenizer.encode(&rest[..pos]));
            out.push(id);
            rest = &rest[pos + alias_len..];
        }
        out.extend(self.tokenizer.encode(rest));
    }

    /// Earliest alias occurrence in `text`; longer aliases win ties.
    fn next_alias(&self, text: &str) -> Option<(usize, usize, TokenId)> {
        let mut best: Option<(usize, usize, TokenId)> = None;
        for (alias, id) in &self.substitutions {
            if let Some(pos) = text.find(alias.as_str()) {
                let better = match best {
                    None => true,
                    Some((bpos, blen, _)) => pos < bpos || (pos == bpos && alias.len() > blen),
                };
                if better {
                    best = Some((pos, alias.len(), *id));
                }
            }
        }
        best
    }

    fn alias_of(&self, token_id: TokenId) -> Option<&str> {
        self.substitutions
            .iter()
            .find(|(_, id)| *id == token_id)
            .map(|(alias, _)| alias.as_str())
    }

    /// Append the text of `token_id`. Unknown IDs render as nothing and are
    /// logged.
    pub fn detokenize_to(&self, out: &mut String, token_id: TokenId) {
        if let Some(alias) = self.alias_of(token_id) {
            out.push_str(alias);
            return;
        }
        if let Err(e) = self.tokenizer.decode_token(token_id, out) {
            warn!(token = token_id, error = %e, "cannot detokenize");
        }
    }

    pub fn detokenize(&self, token_id: TokenId) -> String {
        let mut out = String::new();
        self.detokenize_to(&mut out, token_id);
        out
    }

    /// Append the text of `token_id` as it reads after `prev`.
    pub fn detokenize_after(&self, out: &mut String, prev: Option<TokenId>, token_id: TokenId) {
        if let Some(alias) = self.alias_of(token_id) {
            out.push_str(alias);
            return;
        }
        if let Err(e) = self.tokenizer.decode_token_after(prev, token_id, out) {
            warn!(token = token_id, error = %e, "cannot detokenize");
        }
    }

    pub fn detokenize_all(&self, tokens: &[TokenId]) -> String {
        let mut out = String::new();
        for &token in tokens {
            self.detokenize_to(&mut out, token);
        }
        out
    }

    /// Last character of the token's text, if it has any.
    pub fn last_char_of(&self, token_id: TokenId) -> Option<char> {
        self.detokenize(token_id).chars().next_back()
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("cardinality", &self.cardinality())
            .field("substitutions", &self.substitutions)
            .finish_non_exhaustive()
    }
}
