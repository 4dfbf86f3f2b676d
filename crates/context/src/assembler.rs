//! Budgeted context assembly.
//!
//! Produces the message window sent with a request: exactly one system
//! message followed by the newest history messages that fit in
//! `max_tokens - reserve_tokens`, in chronological order.
//!
//! History is cut as a suffix: messages are taken newest first and the
//! walk stops at the first message that would overflow, so the dropped
//! messages are always the oldest ones.

use std::sync::Arc;

use promptgate_core::{Message, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::token::{MESSAGE_OVERHEAD, TokenCounter};

/// Total window and the share held back for the model's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub reserve_tokens: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            reserve_tokens: 1000,
        }
    }
}

impl ContextBudget {
    pub fn new(max_tokens: usize, reserve_tokens: usize) -> Self {
        Self {
            max_tokens,
            reserve_tokens,
        }
    }

    /// Tokens available for the prompt itself.
    pub fn available(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserve_tokens)
    }
}

/// Assembled message window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    /// System message first, then history oldest to newest.
    pub messages: Vec<Message>,
    pub total_tokens: usize,
    /// History messages left out.
    pub dropped: usize,
    /// The system prompt alone exceeded the available budget.
    pub budget_too_small: bool,
}

impl ConversationContext {
    pub fn system(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn history(&self) -> &[Message] {
        self.messages.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    counter: Arc<TokenCounter>,
    budget: ContextBudget,
}

impl ContextAssembler {
    pub fn new(counter: Arc<TokenCounter>, budget: ContextBudget) -> Self {
        Self { counter, budget }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Assemble with the configured budget.
    pub fn build(&self, history: &[Message], system_prompt: &str, model: &str) -> ConversationContext {
        self.build_with(history, system_prompt, model, self.budget)
    }

    pub fn build_with(
        &self,
        history: &[Message],
        system_prompt: &str,
        model: &str,
        budget: ContextBudget,
    ) -> ConversationContext {
        let available = budget.available();
        let system_tokens = self.counter.count(system_prompt, model) + MESSAGE_OVERHEAD;
        let system = Message::system(system_prompt).with_tokens(system_tokens);

        let candidates = history.iter().filter(|m| m.role != Role::System).count();

        if system_tokens > available {
            warn!(
                system_tokens,
                available,
                model,
                "System prompt exceeds context budget, sending it alone"
            );
            return ConversationContext {
                messages: vec![system],
                total_tokens: system_tokens,
                dropped: candidates,
                budget_too_small: true,
            };
        }

        let mut total = system_tokens;
        let mut selected = Vec::new();

        for msg in history.iter().rev().filter(|m| m.role != Role::System) {
            let cost = self.counter.message_cost(msg, model);
            if !Self::fits(total, cost, available) {
                break;
            }
            total += cost;
            selected.push(msg.clone().with_tokens(cost));
        }

        selected.reverse();
        let dropped = candidates - selected.len();

        let mut messages = Vec::with_capacity(selected.len() + 1);
        messages.push(system);
        messages.extend(selected);

        debug!(
            model,
            total_tokens = total,
            available,
            included = messages.len() - 1,
            dropped,
            "Assembled context"
        );

        ConversationContext {
            messages,
            total_tokens: total,
            dropped,
            budget_too_small: false,
        }
    }

    /// Whether a message of `candidate` tokens fits on top of `current`
    /// within the configured budget.
    pub fn will_fit(&self, current: usize, candidate: usize) -> bool {
        Self::fits(current, candidate, self.budget.available())
    }

    fn fits(current: usize, candidate: usize, available: usize) -> bool {
        current.saturating_add(candidate) <= available
    }
}
