//! Token counting and budgeted context assembly.
//!
//! | Piece | Responsibility |
//! |-------|----------------|
//! | [`TokenCounter`] | (text, model) to a token cost, encoders memoized per family |
//! | [`ContextAssembler`] | history + system prompt to a bounded message window |

pub mod assembler;
pub mod token;

pub use assembler::{ContextAssembler, ContextBudget, ConversationContext};
pub use token::{EncodingFamily, TokenCounter, estimate_tokens};
