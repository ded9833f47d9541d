//! Bounded chat history.

use crate::providers::ChatMessage;

/// A system prompt plus a sliding window of user/assistant turns.
///
/// The system message is always kept at the front. Once the window exceeds
/// `max_history` messages the oldest turns are dropped.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    has_system: bool,
    max_history: usize,
}

impl Conversation {
    pub fn new(system_prompt: Option<&str>, max_history: usize) -> Self {
        let system = system_prompt
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .map(ChatMessage::system);
        Self {
            has_system: system.is_some(),
            messages: system.into_iter().collect(),
            max_history: max_history.max(1),
        }
    }

    /// All messages in send order, system prompt first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Messages after the system prompt.
    pub fn history(&self) -> &[ChatMessage] {
        &self.messages[self.history_start()..]
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.has_system
            .then(|| self.messages.first().map(|m| m.content.as_str()))
            .flatten()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        let start = self.history_start();
        let overflow = (self.messages.len() - start).saturating_sub(self.max_history);
        if overflow > 0 {
            self.messages.drain(start..start + overflow);
        }
    }

    /// A copy with `text` appended as a user turn; `self` is untouched.
    pub fn with_user_turn(&self, text: &str) -> Self {
        let mut pending = self.clone();
        pending.push(ChatMessage::user(text));
        pending
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }

    fn history_start(&self) -> usize {
        usize::from(self.has_system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_leads_messages() {
        let mut conv = Conversation::new(Some("be brief"), 10);
        conv.push(ChatMessage::user("hi"));
        assert_eq!(conv.messages()[0], ChatMessage::system("be brief"));
        assert_eq!(conv.history(), &[ChatMessage::user("hi")]);
        assert_eq!(conv.system_prompt(), Some("be brief"));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn blank_system_prompt_is_omitted() {
        let mut conv = Conversation::new(Some("   "), 10);
        conv.push(ChatMessage::user("hi"));
        assert_eq!(conv.messages().len(), 1);
        assert!(conv.system_prompt().is_none());
    }

    #[test]
    fn history_is_bounded_and_keeps_system() {
        let mut conv = Conversation::new(Some("sys"), 4);
        for i in 0..10 {
            conv.push(ChatMessage::user(format!("u{i}")));
            conv.push(ChatMessage::assistant(format!("a{i}")));
            assert!(conv.len() <= 4);
        }
        assert_eq!(conv.messages()[0].role, "system");
        let contents: Vec<&str> = conv.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["u8", "a8", "u9", "a9"]);
    }

    #[test]
    fn bound_applies_without_system_prompt() {
        let mut conv = Conversation::new(None, 2);
        conv.push(ChatMessage::user("one"));
        conv.push(ChatMessage::user("two"));
        conv.push(ChatMessage::user("three"));
        let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn user_turn_copy_leaves_full_history_intact() {
        let mut conv = Conversation::new(Some("sys"), 2);
        conv.push(ChatMessage::user("u0"));
        conv.push(ChatMessage::assistant("a0"));

        let pending = conv.with_user_turn("next");
        let contents: Vec<&str> = pending.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a0", "next"]);
        assert_eq!(pending.system_prompt(), Some("sys"));

        let contents: Vec<&str> = conv.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["u0", "a0"]);
    }
}
