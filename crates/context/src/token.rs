//! Token counting.
//!
//! Models map to a BPE encoding family. Encoders are loaded on first use
//! and shared afterwards; when an encoder cannot be loaded, or the model
//! maps to no known family, counting falls back to a byte heuristic
//! (`ceil(bytes / 4)`). Counting never fails.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use promptgate_core::Message;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Framing tokens added per message (role name, delimiters).
pub const MESSAGE_OVERHEAD: usize = 4;

/// Tokens that prime the model's reply after the last message.
pub const REPLY_PRIMING: usize = 3;

/// Bytes per token assumed by the heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingFamily {
    Cl100k,
    O200k,
    Heuristic,
}

impl EncodingFamily {
    /// Encoding family for a model reference. Accepts bare model ids and
    /// `provider/model` references.
    pub fn for_model(model: &str) -> Self {
        let id = model
            .rsplit_once('/')
            .map_or(model, |(_, id)| id)
            .to_ascii_lowercase();

        const O200K: [&str; 7] = ["gpt-4o", "chatgpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4"];
        const CL100K: [&str; 5] = ["gpt-4", "gpt-3.5", "gpt-35", "claude", "text-embedding"];

        // o200k first: "gpt-4o" also starts with "gpt-4".
        if O200K.iter().any(|p| id.starts_with(p)) {
            Self::O200k
        } else if CL100K.iter().any(|p| id.starts_with(p)) {
            Self::Cl100k
        } else {
            Self::Heuristic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cl100k => "cl100k_base",
            Self::O200k => "o200k_base",
            Self::Heuristic => "heuristic",
        }
    }
}

impl std::fmt::Display for EncodingFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristic token estimate: one token per four bytes, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Token counter with encoders memoized per family.
///
/// A failed load is memoized too, so a missing encoder costs one warning,
/// not one per call.
#[derive(Default)]
pub struct TokenCounter {
    encoders: RwLock<HashMap<EncodingFamily, Option<Arc<CoreBPE>>>>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded: Vec<EncodingFamily> = self
            .encoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("TokenCounter")
            .field("loaded", &loaded)
            .finish()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cost of `text` under the encoding `model` maps to.
    pub fn count(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder(EncodingFamily::for_model(model)) {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => estimate_tokens(text),
        }
    }

    /// Content cost plus the per-message overhead.
    pub fn count_message(&self, message: &Message, model: &str) -> usize {
        self.count(&message.content, model) + MESSAGE_OVERHEAD
    }

    /// Cost of a message, honouring a precomputed cost when present.
    pub fn message_cost(&self, message: &Message, model: &str) -> usize {
        message
            .tokens
            .unwrap_or_else(|| self.count_message(message, model))
    }

    /// Cost of a whole request: every message plus reply priming.
    pub fn count_sequence(&self, messages: &[Message], model: &str) -> usize {
        messages
            .iter()
            .map(|m| self.message_cost(m, model))
            .sum::<usize>()
            + REPLY_PRIMING
    }

    fn encoder(&self, family: EncodingFamily) -> Option<Arc<CoreBPE>> {
        if family == EncodingFamily::Heuristic {
            return None;
        }

        if let Some(cached) = self
            .encoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&family)
        {
            return cached.clone();
        }

        let mut encoders = self.encoders.write().unwrap_or_else(PoisonError::into_inner);
        encoders
            .entry(family)
            .or_insert_with(|| Self::load(family))
            .clone()
    }

    fn load(family: EncodingFamily) -> Option<Arc<CoreBPE>> {
        let loaded = match family {
            EncodingFamily::Cl100k => tiktoken_rs::cl100k_base(),
            EncodingFamily::O200k => tiktoken_rs::o200k_base(),
            EncodingFamily::Heuristic => return None,
        };
        match loaded {
            Ok(bpe) => {
                debug!(encoding = %family, "Loaded BPE encoder");
                Some(Arc::new(bpe))
            }
            Err(e) => {
                warn!(encoding = %family, error = %e, "Encoder unavailable, using heuristic");
                None
            }
        }
    }
}
