//! Token accounting (C1): counts tokens, truncates conversation history and
//! retrieved passages to fit a budget, and assembles a final prompt under a
//! hard ceiling.

use std::collections::HashMap;

use tracing::warn;

/// Counts tokens in a string. The core treats tokenizer acquisition as an
/// external concern; callers inject a concrete counter bound to whatever
/// tokenizer the configured model endpoints expect.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// A conservative counter usable without a real tokenizer: splits on
/// whitespace and scales by an average characters-per-token ratio. Good
/// enough for tests and as a fallback; production deployments should inject
/// a counter backed by the endpoint's actual tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct WhitespaceTokenCounter {
    chars_per_token: f64,
}

impl WhitespaceTokenCounter {
    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }
}

impl Default for WhitespaceTokenCounter {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl TokenCounter for WhitespaceTokenCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        ((text.chars().count() as f64) / self.chars_per_token).ceil() as usize
    }
}

/// A single turn: stable id plus content, used for both history and
/// passage truncation so the dropped-from-the-tail/front logic stays
/// identical for both cases.
#[derive(Debug, Clone)]
pub struct PassageForPrompt {
    pub id: String,
    pub document: String,
}

/// The truncatable and fixed inputs to one `build_prompt` call.
#[derive(Debug, Clone, Default)]
pub struct PromptSlots {
    /// Fixed, non-truncatable named values (user query, category, search
    /// query, ...). Measured and deducted from the budget before anything
    /// truncatable is considered.
    pub fixed: HashMap<String, String>,
    /// Conversation turns, oldest first. Truncated from the front.
    pub history: Option<Vec<(String, String)>>,
    /// Candidate passages, assumed sorted most-relevant-first. Truncated
    /// from the tail.
    pub passages: Option<Vec<PassageForPrompt>>,
}

impl PromptSlots {
    pub fn with_fixed(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed.insert(key.into(), value.into());
        self
    }

    pub fn with_history(mut self, history: Vec<(String, String)>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_passages(mut self, passages: Vec<PassageForPrompt>) -> Self {
        self.passages = Some(passages);
        self
    }
}

/// Assembles prompts under a per-call token ceiling, splitting the budget
/// between fixed content, history, and retrieved passages.
pub struct TokenAccountant {
    counter: Box<dyn TokenCounter>,
    reservation_tokens: usize,
    history_fraction: f64,
}

impl TokenAccountant {
    pub fn new(counter: Box<dyn TokenCounter>, reservation_tokens: usize, history_fraction: f64) -> Self {
        Self { counter, reservation_tokens, history_fraction }
    }

    pub fn count(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    fn format_history(history: &[(String, String)]) -> String {
        history
            .iter()
            .map(|(u, a)| format!("User: {u}\nAI: {a}"))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    /// Truncate `history` from the front (oldest turns dropped first) until
    /// the formatted string fits `max_tokens`.
    fn truncate_history(&self, history: &[(String, String)], max_tokens: usize) -> String {
        if history.is_empty() {
            return "No conversation history yet.".to_string();
        }

        for start in 0..history.len() {
            let remaining = &history[start..];
            let formatted = Self::format_history(remaining);
            if self.count(&formatted) <= max_tokens {
                return formatted;
            }
        }

        "History is too long to be included.".to_string()
    }

    fn format_passages(passages: &[PassageForPrompt]) -> String {
        passages
            .iter()
            .map(|p| format!("Passage ID: {}\nContent: {}", p.id, p.document))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Truncate `passages` from the tail (least-relevant dropped first)
    /// until the formatted string fits `max_tokens`.
    fn truncate_passages(&self, passages: &[PassageForPrompt], max_tokens: usize) -> String {
        if passages.is_empty() {
            return String::new();
        }

        for end in (1..=passages.len()).rev() {
            let current = &passages[..end];
            let formatted = Self::format_passages(current);
            if self.count(&formatted) <= max_tokens {
                return formatted;
            }
        }

        String::new()
    }

    /// Replace every `{key}` occurrence in `template` with its value.
    fn render(template: &str, values: &HashMap<String, String>) -> String {
        let mut rendered = template.to_string();
        for (key, value) in values {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }

    /// Hard-truncate `text` to at most `ceiling` tokens by repeatedly
    /// dropping trailing characters, as a safety net for miscalculation.
    fn hard_truncate(&self, text: &str, ceiling: usize) -> String {
        let mut candidate = text.to_string();
        while self.count(&candidate) > ceiling && !candidate.is_empty() {
            let new_len = candidate.chars().count().saturating_sub(candidate.chars().count() / 10 + 1);
            candidate = candidate.chars().take(new_len).collect();
        }
        candidate
    }

    /// Assemble `template` filling `{history_str}` / `{passages_context}`
    /// plus any fixed slots, never exceeding `ceiling` tokens.
    pub fn build_prompt(&self, template: &str, ceiling: usize, slots: PromptSlots) -> String {
        let available_content_tokens = ceiling.saturating_sub(self.reservation_tokens);

        let mut tokens_used = 0usize;
        let mut values = slots.fixed.clone();
        for value in values.values() {
            tokens_used += self.count(value);
        }

        let mut remaining_tokens = available_content_tokens.saturating_sub(tokens_used);
        if tokens_used > available_content_tokens {
            warn!("fixed prompt components alone exceed the token budget; truncatable slots will be empty");
            remaining_tokens = 0;
        }

        if let Some(history) = &slots.history {
            let history_budget = ((remaining_tokens as f64) * self.history_fraction).floor() as usize;
            let history_str = self.truncate_history(history, history_budget);
            tokens_used += self.count(&history_str);
            values.insert("history_str".to_string(), history_str);
        }

        let passage_budget = available_content_tokens.saturating_sub(tokens_used);
        if let Some(passages) = &slots.passages {
            let passages_str = self.truncate_passages(passages, passage_budget);
            values.insert("passages_context".to_string(), passages_str);
        }

        let mut final_prompt = Self::render(template, &values);

        if self.count(&final_prompt) > ceiling {
            warn!("prompt exceeded budget after assembly; hard-truncating");
            final_prompt = self.hard_truncate(&final_prompt, ceiling);
        }

        final_prompt
    }
}
