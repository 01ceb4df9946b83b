//! Append-only conversation history for one run.
//!
//! The single system turn is created with the conversation and always stays
//! first. Every later turn is appended, never edited. Context limits are
//! handled by [`Conversation::window`], which selects turns for a request
//! without removing anything from the history.

use serde::Serialize;
use thiserror::Error;

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Output injected by the loop (command results, refusals).
    ToolResult,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool-result",
        }
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    /// Ordinal position, assigned on append.
    pub index: usize,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation already has a system turn")]
    DuplicateSystemTurn,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Start a conversation seeded with its system turn.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn {
                index: 0,
                role: Role::System,
                content: system_prompt.into(),
            }],
        }
    }

    /// Append a turn and return its index. A second system turn is rejected.
    pub fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
    ) -> Result<usize, ConversationError> {
        if role == Role::System {
            return Err(ConversationError::DuplicateSystemTurn);
        }
        let index = self.turns.len();
        self.turns.push(Turn {
            index,
            role,
            content: content.into(),
        });
        Ok(index)
    }

    /// Full ordered history.
    pub fn snapshot(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// System turn plus the most recent turns whose content fits in `limit_chars`.
    ///
    /// The newest non-system turn is always included, even when it alone exceeds
    /// the budget, so the backend never answers a conversation missing its latest input.
    pub fn window(&self, limit_chars: usize) -> Vec<&Turn> {
        let (system, rest) = match self.turns.split_first() {
            Some(split) => split,
            None => return Vec::new(),
        };

        let mut used = 0usize;
        let mut start = rest.len();
        for (pos, turn) in rest.iter().enumerate().rev() {
            let len = turn.content.chars().count();
            if start != rest.len() && used + len > limit_chars {
                break;
            }
            used += len;
            start = pos;
        }

        let mut window = Vec::with_capacity(rest.len() - start + 1);
        window.push(system);
        window.extend(rest[start..].iter());
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation_with(contents: &[(Role, &str)]) -> Conversation {
        let mut conversation = Conversation::new("system prompt");
        for (role, content) in contents {
            conversation.append(*role, *content).expect("append");
        }
        conversation
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut conversation = Conversation::new("sys");
        assert_eq!(conversation.append(Role::User, "hi").expect("append"), 1);
        assert_eq!(
            conversation.append(Role::Assistant, "{}").expect("append"),
            2
        );
        let indices: Vec<usize> = conversation.snapshot().iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn append_rejects_second_system_turn() {
        let mut conversation = Conversation::new("sys");
        let err = conversation.append(Role::System, "again").unwrap_err();
        assert_eq!(err, ConversationError::DuplicateSystemTurn);
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn window_keeps_everything_within_budget() {
        let conversation = conversation_with(&[(Role::User, "aaaa"), (Role::Assistant, "bbbb")]);
        let window = conversation.window(100);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].role, Role::System);
    }

    #[test]
    fn window_drops_oldest_turns_first() {
        let conversation = conversation_with(&[
            (Role::User, "0123456789"),
            (Role::Assistant, "0123456789"),
            (Role::ToolResult, "01234"),
        ]);
        let window = conversation.window(15);
        let indices: Vec<usize> = window.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
    }

    #[test]
    fn window_always_includes_latest_turn() {
        let conversation = conversation_with(&[(Role::User, "short"), (Role::ToolResult, "x".repeat(50).as_str())]);
        let window = conversation.window(10);
        let indices: Vec<usize> = window.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn window_of_fresh_conversation_is_system_only() {
        let conversation = Conversation::new("sys");
        let window = conversation.window(0);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::System);
    }

    #[test]
    fn window_never_mutates_history() {
        let conversation = conversation_with(&[(Role::User, "0123456789"), (Role::User, "0123456789")]);
        let _ = conversation.window(5);
        assert_eq!(conversation.len(), 3);
    }
}
