//! In-memory conversation history.

use golem_services::ChatMessage;
use std::collections::VecDeque;

/// Bounded user/assistant turn history for chat context.
///
/// Owned solely by the dialogue thread; a user turn only enters the
/// history once the assistant answered it.
pub struct ConversationMemory {
    max_turns: usize,
    system_prompt: Option<String>,
    pairs: VecDeque<(String, String)>,
    pending_user: Option<String>,
}

impl ConversationMemory {
    /// History bounded to `max_turns` exchanges (0 = unbounded).
    #[must_use]
    pub fn new(max_turns: usize, system_prompt: &str) -> Self {
        let trimmed = system_prompt.trim();
        Self {
            max_turns,
            system_prompt: (!trimmed.is_empty()).then(|| trimmed.to_string()),
            pairs: VecDeque::new(),
            pending_user: None,
        }
    }

    /// Drop all stored turns.
    pub fn reset(&mut self) {
        self.pairs.clear();
        self.pending_user = None;
    }

    /// Stage the current user utterance.
    pub fn add_user(&mut self, text: impl Into<String>) {
        self.pending_user = Some(text.into());
    }

    /// Commit the assistant reply, completing the staged exchange.
    pub fn add_assistant(&mut self, text: impl Into<String>) {
        let user = self.pending_user.take().unwrap_or_default();
        self.pairs.push_back((user, text.into()));
        while self.max_turns > 0 && self.pairs.len() > self.max_turns {
            self.pairs.pop_front();
        }
    }

    /// Number of completed exchanges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no exchange has completed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Build the chat context ending in the current user message.
    #[must_use]
    pub fn build_messages(&self, current_user: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.pairs.len() * 2 + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        for (user, assistant) in &self.pairs {
            if !user.is_empty() {
                messages.push(ChatMessage::user(user.clone()));
            }
            if !assistant.is_empty() {
                messages.push(ChatMessage::assistant(assistant.clone()));
            }
        }
        messages.push(ChatMessage::user(current_user));
        messages
    }
}
