//! Bounded conversation history.
//!
//! Keeps the most recent exchanges (10 by default) and renders the last few
//! (5 by default) as a `Previous conversation:` block for the draft prompt.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
    pub at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    max_exchanges: usize,
    prompt_exchanges: usize,
    exchanges: VecDeque<Exchange>,
}

impl ConversationHistory {
    pub fn new(max_exchanges: usize, prompt_exchanges: usize) -> Self {
        Self {
            max_exchanges: max_exchanges.max(1),
            prompt_exchanges,
            exchanges: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Append an exchange, evicting the oldest beyond the limit.
    pub fn push(&mut self, exchange: Exchange) {
        self.exchanges.push_back(exchange);
        while self.exchanges.len() > self.max_exchanges {
            self.exchanges.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    /// The prompt block for the most recent exchanges, or `None` when empty.
    pub fn render(&self) -> Option<String> {
        if self.exchanges.is_empty() || self.prompt_exchanges == 0 {
            return None;
        }
        let skip = self.exchanges.len().saturating_sub(self.prompt_exchanges);
        let body = self
            .exchanges
            .iter()
            .skip(skip)
            .map(|e| format!("User: {}\nAI: {}", e.user, e.assistant))
            .collect::<Vec<_>>()
            .join("\n\n");
        Some(format!("Previous conversation:\n{body}"))
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(10, 5)
    }
}
