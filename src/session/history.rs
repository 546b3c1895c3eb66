//! Conversation history kept on a chat session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::llm::ChatMessage;

/// Role of a turn's author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered turns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    turns: VecDeque<ChatTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push_back(turn);
    }

    /// Appends one user/assistant exchange.
    pub fn record_exchange(&mut self, question: &str, answer: &str) {
        self.push(ChatTurn::new(TurnRole::User, question));
        self.push(ChatTurn::new(TurnRole::Assistant, answer));
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &ChatTurn> {
        self.turns.iter()
    }

    /// The `count` most recent turns in chronological order.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &ChatTurn> {
        self.turns.iter().skip(self.turns.len().saturating_sub(count))
    }

    /// Recent turns as model messages.
    pub fn recent_messages(&self, count: usize) -> Vec<ChatMessage> {
        self.recent(count)
            .map(|t| ChatMessage {
                role: t.role.as_str().to_string(),
                content: t.content.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_keeps_chronological_order() {
        let mut history = ConversationHistory::new();
        for i in 0..10 {
            history.record_exchange(&format!("Question {}", i), &format!("Answer {}", i));
        }
        assert_eq!(history.len(), 20);

        let recent: Vec<_> = history.recent(3).map(|t| t.content.clone()).collect();
        assert_eq!(recent, vec!["Answer 8", "Question 9", "Answer 9"]);

        let messages = history.recent_messages(15);
        assert_eq!(messages.len(), 15);
        assert_eq!(messages.last().unwrap().role, "assistant");
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let mut history = ConversationHistory::new();
        history.record_exchange("hi", "hello");
        let value = serde_json::to_value(&history).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["role"], "user");

        let back: ConversationHistory =
            serde_json::from_value(serde_json::json!([{"role": "assistant", "content": "x"}])).unwrap();
        assert_eq!(back.len(), 1);
    }
}
