//! Token estimation for budget pre-flight checks and content capping
//!
//! Local models do not expose their tokenizer, so cl100k_base is used as an
//! approximation; it is close enough for budgeting.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Characters per token when the BPE tables are unavailable
const FALLBACK_CHARS_PER_TOKEN: usize = 4;

static CL100K: Lazy<Mutex<Option<CoreBPE>>> = Lazy::new(|| Mutex::new(cl100k_base().ok()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenizerKind {
    Cl100kBase,
    /// Character-count heuristic
    Fallback,
}

/// Counts and truncates text in model tokens
#[derive(Debug, Clone, Copy)]
pub struct Tokenizer {
    kind: TokenizerKind,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::with_kind(TokenizerKind::Cl100kBase)
    }
}

impl Tokenizer {
    pub fn with_kind(kind: TokenizerKind) -> Self {
        Self { kind }
    }

    pub fn count(&self, text: &str) -> usize {
        if self.kind == TokenizerKind::Cl100kBase {
            if let Some(ref bpe) = *CL100K.lock() {
                return bpe.encode_with_special_tokens(text).len();
            }
        }
        text.len().div_ceil(FALLBACK_CHARS_PER_TOKEN)
    }

    /// Cut `text` down to at most `max_tokens` tokens
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.kind == TokenizerKind::Cl100kBase {
            if let Some(ref bpe) = *CL100K.lock() {
                let tokens = bpe.encode_with_special_tokens(text);
                if tokens.len() <= max_tokens {
                    return text.to_string();
                }
                if let Ok(decoded) = bpe.decode(tokens[..max_tokens].to_vec()) {
                    return decoded;
                }
            }
        }
        text.chars()
            .take(max_tokens * FALLBACK_CHARS_PER_TOKEN)
            .collect()
    }
}

/// Token count with the default tokenizer
pub fn count_tokens(text: &str) -> u64 {
    Tokenizer::default().count(text) as u64
}
