#![deny(unsafe_code)]

/// Pure folding of stream events into a turn.
pub mod accumulator;
/// Single-flight request lifecycle for one conversation.
pub mod coordinator;
pub mod notify;
/// Mapping persisted chats back into the conversation.
pub mod reconciler;
/// Settings persistence.
pub mod settings;
pub mod store;
pub mod turn;

pub use accumulator::{accumulate, cancel, dedupe_sources};
pub use coordinator::{
    CoordinatorError, CoordinatorResult, DEFAULT_CANCELED_MESSAGE, RequestCoordinator,
    RequestPhase,
};
pub use notify::{ChannelNotifier, Notification, NotificationSink, Severity, TracingNotifier};
pub use reconciler::{HistoryError, HistoryReconciler, HistoryResult, reconcile};
pub use settings::{EngineSettings, SettingsError, SettingsStore};
pub use store::{ConversationStore, StoreError, StoreResult};
pub use turn::{Conversation, ConversationTurn, TurnId};
