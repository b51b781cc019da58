use std::sync::Arc;

use snafu::Snafu;
use tokio::sync::watch;

use crate::turn::{Conversation, ConversationTurn, TurnId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("turn {turn_id} is still pending on `{stage}`"))]
    PendingTurnExists { stage: &'static str, turn_id: TurnId },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered turns of the active conversation.
///
/// Clones share the same conversation. Every mutation is applied and
/// published to subscribers inside one `watch` send, so readers never observe
/// a half-applied update.
#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<watch::Sender<Conversation>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Conversation::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Appends a pending turn for `question`.
    pub fn append_user_turn(&self, question: impl Into<String>) -> StoreResult<TurnId> {
        let turn = ConversationTurn::pending(question);
        let turn_id = turn.id;
        let mut blocking = None;

        self.state.send_if_modified(|conversation| {
            if let Some(pending) = conversation.pending_turn() {
                blocking = Some(pending.id);
                return false;
            }
            conversation.turns.push(turn);
            true
        });

        if let Some(pending_id) = blocking {
            return PendingTurnExistsSnafu {
                stage: "append-user-turn",
                turn_id: pending_id,
            }
            .fail();
        }

        tracing::debug!(turn_id = %turn_id, "appended pending turn");
        Ok(turn_id)
    }

    /// Replaces the pending turn `turn_id` with `updated`.
    ///
    /// Returns `false` and leaves the conversation untouched when `turn_id` is
    /// no longer the pending turn.
    pub fn apply_accumulator_update(&self, turn_id: TurnId, updated: ConversationTurn) -> bool {
        self.fold_pending(turn_id, |_| updated)
    }

    /// Runs `fold` on the pending turn `turn_id` and stores its result.
    pub fn fold_pending<F>(&self, turn_id: TurnId, fold: F) -> bool
    where
        F: FnOnce(ConversationTurn) -> ConversationTurn,
    {
        let applied = self.state.send_if_modified(|conversation| {
            let Some(slot) = conversation
                .turns
                .iter_mut()
                .find(|turn| turn.id == turn_id && turn.is_pending)
            else {
                return false;
            };

            let mut updated = fold(slot.clone());
            updated.id = turn_id;
            *slot = updated;
            true
        });

        if !applied {
            tracing::debug!(turn_id = %turn_id, "dropped update for turn that is not pending");
        }
        applied
    }

    /// Clears all turns and forgets the server-side conversation id.
    pub fn reset_conversation(&self) {
        self.state.send_modify(|conversation| {
            *conversation = Conversation::default();
        });
        tracing::debug!("conversation reset");
    }

    /// Replaces the conversation with restored turns. Restored turns are never
    /// pending.
    pub fn replace_with_history(
        &self,
        conversation_id: Option<String>,
        turns: Vec<ConversationTurn>,
    ) {
        let turns = turns
            .into_iter()
            .map(|mut turn| {
                turn.is_pending = false;
                turn
            })
            .collect::<Vec<_>>();
        let turn_count = turns.len();

        self.state.send_modify(|conversation| {
            *conversation = Conversation {
                conversation_id,
                turns,
            };
        });
        tracing::debug!(turn_count, "conversation replaced from history");
    }

    pub fn set_conversation_id(&self, conversation_id: Option<String>) {
        self.state.send_if_modified(|conversation| {
            if conversation.conversation_id == conversation_id {
                return false;
            }
            conversation.conversation_id = conversation_id;
            true
        });
    }

    pub fn snapshot(&self) -> Conversation {
        self.state.borrow().clone()
    }

    pub fn turn(&self, turn_id: TurnId) -> Option<ConversationTurn> {
        self.state.borrow().turn(turn_id).cloned()
    }

    pub fn pending_turn(&self) -> Option<ConversationTurn> {
        self.state.borrow().pending_turn().cloned()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.state.borrow().conversation_id.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Conversation> {
        self.state.subscribe()
    }
}
