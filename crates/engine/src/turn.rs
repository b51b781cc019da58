use std::fmt;

use parley_transport::SourceDocument;
use uuid::Uuid;

/// Stable identifier for one turn, minted when the turn is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub Uuid);

impl TurnId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub question: String,
    pub answer: String,
    pub error: Option<String>,
    pub is_pending: bool,
    pub sources: Vec<SourceDocument>,
}

impl ConversationTurn {
    /// Creates a turn waiting for its answer.
    pub fn pending(question: impl Into<String>) -> Self {
        Self {
            id: TurnId::new_v7(),
            question: question.into(),
            answer: String::new(),
            error: None,
            is_pending: true,
            sources: Vec::new(),
        }
    }

    /// Creates an already resolved turn, as restored from history.
    pub fn resolved(
        question: impl Into<String>,
        answer: impl Into<String>,
        sources: Vec<SourceDocument>,
    ) -> Self {
        Self {
            id: TurnId::new_v7(),
            question: question.into(),
            answer: answer.into(),
            error: None,
            is_pending: false,
            sources,
        }
    }
}

/// Turns of the active conversation in chronological order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conversation {
    /// Server-side chat id sent with follow-up questions, once known.
    pub conversation_id: Option<String>,
    pub turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn turn(&self, turn_id: TurnId) -> Option<&ConversationTurn> {
        self.turns.iter().find(|turn| turn.id == turn_id)
    }

    pub fn pending_turn(&self) -> Option<&ConversationTurn> {
        self.turns.iter().find(|turn| turn.is_pending)
    }

    pub fn pending_count(&self) -> usize {
        self.turns.iter().filter(|turn| turn.is_pending).count()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_ids_are_unique_and_creation_ordered() {
        let first = ConversationTurn::pending("one");
        let second = ConversationTurn::resolved("two", "answer", Vec::new());

        assert_ne!(first.id, second.id);
        assert!(first.id < second.id);
        assert_eq!(first.id.to_string(), first.id.0.to_string());
    }

    #[test]
    fn conversation_lookups_follow_pending_flag() {
        let pending = ConversationTurn::pending("now");
        let resolved = ConversationTurn::resolved("before", "done", Vec::new());
        let conversation = Conversation {
            conversation_id: None,
            turns: vec![resolved.clone(), pending.clone()],
        };

        assert_eq!(conversation.pending_turn(), Some(&pending));
        assert_eq!(conversation.pending_count(), 1);
        assert_eq!(conversation.turn(resolved.id), Some(&resolved));
        assert_eq!(conversation.len(), 2);
    }
}
