//! `promptgate tokens`: count tokens for a model.

use promptgate_context::{EncodingFamily, TokenCounter};
use promptgate_context::token::MESSAGE_OVERHEAD;

pub fn run(model: &str, text: &str) {
    let counter = TokenCounter::new();
    let count = counter.count(text, model);

    println!("🔢 {count} tokens");
    println!("   Encoding: {}", EncodingFamily::for_model(model));
    println!("   As message: {} tokens", count + MESSAGE_OVERHEAD);
}
