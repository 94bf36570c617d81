//! Session-scoped conversation history.

use crate::chunker::estimate_tokens;
use crate::types::Turn;
use std::sync::{Arc, RwLock};

/// Conversation shared between a knowledge base and its answer streams.
pub type SharedConversation = Arc<RwLock<ConversationState>>;

/// Ordered, append-only record of completed turns.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Most recent turns whose combined estimated size fits `token_budget`,
    /// oldest first. Older turns are dropped before newer ones; a turn that
    /// does not fit ends the window even if an older, smaller one would.
    pub fn history(&self, token_budget: usize) -> Vec<Turn> {
        let mut used = 0;
        let mut window: Vec<Turn> = self
            .turns
            .iter()
            .rev()
            .take_while(|turn| {
                used += estimate_tokens(&turn.query) + estimate_tokens(&turn.answer);
                used <= token_budget
            })
            .cloned()
            .collect();

        window.reverse();
        window
    }

    /// All turns, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
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

    fn turn(query: &str, answer: &str) -> Turn {
        Turn::new(query, answer)
    }

    #[test]
    fn test_history_keeps_order() {
        let mut state = ConversationState::new();
        state.append(turn("first question", "first answer"));
        state.append(turn("second question", "second answer"));

        let history = state.history(1000);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].query, "first question");
        assert_eq!(history[1].query, "second question");
    }

    #[test]
    fn test_history_drops_oldest_first() {
        let mut state = ConversationState::new();
        // Four tokens per turn
        state.append(turn("one two", "three four"));
        state.append(turn("five six", "seven eight"));
        state.append(turn("nine ten", "eleven twelve"));

        let history = state.history(8);
        let queries: Vec<_> = history.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["five six", "nine ten"]);

        assert!(state.history(3).is_empty());
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_newest_turn_too_large_yields_empty_window() {
        let mut state = ConversationState::new();
        state.append(turn("small", "tiny"));
        state.append(turn(&"word ".repeat(50), "answer"));

        assert!(state.history(10).is_empty());
    }

    #[test]
    fn test_clear() {
        let mut state = ConversationState::new();
        state.append(turn("q", "a"));
        state.clear();

        assert!(state.is_empty());
        assert!(state.history(100).is_empty());
    }
}
