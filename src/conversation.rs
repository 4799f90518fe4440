//! # Conversation History
//!
//! Bounded window of role-tagged turns owned by one session. The window
//! keeps at most a configured number of turns (20 by default); when it
//! overflows, the oldest turns are dropped first so the completion stage
//! always sees the most recent context in original order.

use serde::Serialize;
use std::collections::VecDeque;

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of the conversation, in the shape the completion API expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Ordered, bounded sequence of conversation turns.
///
/// Mutated only by the owning session: a user turn is appended right after a
/// non-empty transcript, the assistant turn right after the completion stage
/// resolves (success or fallback), and the whole window is cleared by an
/// explicit `clear_history` command.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ChatTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    /// Create an empty history with the given window size.
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// Append a turn, dropping the oldest entries if the window overflows.
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push_back(ChatTurn {
            role,
            content: content.into(),
        });

        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// Drop all context (reply to `clear_history`).
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Snapshot of the current window, oldest first.
    pub fn turns(&self) -> Vec<ChatTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_kept_in_insertion_order() {
        let mut history = ConversationHistory::new(20);
        history.push(Role::User, "hi");
        history.push(Role::Assistant, "hello!");
        history.push(Role::User, "how are you?");

        let turns = history.turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "hi");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[2].content, "how are you?");
    }

    #[test]
    fn test_window_drops_oldest_first() {
        let mut history = ConversationHistory::new(4);
        for i in 0..6 {
            history.push(Role::User, format!("turn {}", i));
        }

        let turns = history.turns();
        assert_eq!(turns.len(), 4);
        // Turns 0 and 1 were dropped; the rest keep their relative order.
        assert_eq!(turns[0].content, "turn 2");
        assert_eq!(turns[3].content, "turn 5");
    }

    #[test]
    fn test_length_after_n_turns() {
        // After N full turns the window holds min(2N, 20) entries.
        let mut history = ConversationHistory::new(20);
        for n in 1..=15 {
            history.push(Role::User, "question");
            history.push(Role::Assistant, "answer");
            assert_eq!(history.len(), (2 * n).min(20));
        }
    }

    #[test]
    fn test_clear_empties_window() {
        let mut history = ConversationHistory::new(20);
        history.push(Role::User, "context");
        history.push(Role::Assistant, "reply");
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let turn = ChatTurn {
            role: Role::Assistant,
            content: "ok".to_string(),
        };
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "ok");
    }
}
