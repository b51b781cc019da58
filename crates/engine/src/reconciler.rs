use std::sync::Arc;

use parley_transport::{HistoryRecord, HistoryService, TransportError};
use snafu::{ResultExt, Snafu};

use crate::accumulator::dedupe_sources;
use crate::notify::{NotificationSink, Severity};
use crate::store::ConversationStore;
use crate::turn::ConversationTurn;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HistoryError {
    #[snafu(display("failed to load chat '{chat_id}' on `{stage}`: {source}"))]
    FetchHistory {
        stage: &'static str,
        chat_id: String,
        source: TransportError,
    },
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Maps persisted records to resolved turns with fresh ids.
///
/// Sources come from the record's reranked documents and are deduplicated
/// within each turn only.
pub fn reconcile(records: Vec<HistoryRecord>) -> Vec<ConversationTurn> {
    records
        .into_iter()
        .map(|record| {
            let sources = record
                .metadata
                .and_then(|metadata| metadata.reranked_docs)
                .map(dedupe_sources)
                .unwrap_or_default();
            ConversationTurn::resolved(record.question, record.answer, sources)
        })
        .collect()
}

/// Reopens persisted chats into the conversation store.
pub struct HistoryReconciler {
    service: Arc<dyn HistoryService>,
    store: ConversationStore,
    notifier: Arc<dyn NotificationSink>,
}

impl HistoryReconciler {
    pub fn new(
        service: Arc<dyn HistoryService>,
        store: ConversationStore,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            service,
            store,
            notifier,
        }
    }

    /// Replaces the store with chat `chat_id` and returns the number of
    /// restored turns. On failure the store is left as it was and the user is
    /// notified.
    pub async fn open(&self, chat_id: &str) -> HistoryResult<usize> {
        let history = self
            .service
            .chat_by_id(chat_id)
            .await
            .context(FetchHistorySnafu {
                stage: "open-chat-history",
                chat_id,
            })
            .inspect_err(|error| {
                tracing::warn!(chat_id = %chat_id, error = %error, "history fetch failed");
                self.notifier.notify(Severity::Error, &error.to_string());
            })?;

        let turns = reconcile(history.history);
        let turn_count = turns.len();
        self.store
            .replace_with_history(Some(chat_id.trim().to_string()), turns);

        tracing::info!(chat_id = %chat_id, turn_count, "reopened chat from history");
        Ok(turn_count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;
    use parley_transport::{BoxFuture, ChatHistory, SourceDocument, TransportResult};

    use super::*;
    use crate::notify::{ChannelNotifier, Notification};

    struct FakeHistory {
        result: Mutex<Option<TransportResult<ChatHistory>>>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeHistory {
        fn returning(result: TransportResult<ChatHistory>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    impl HistoryService for FakeHistory {
        fn chat_by_id<'a>(
            &'a self,
            chat_id: &'a str,
        ) -> BoxFuture<'a, TransportResult<ChatHistory>> {
            self.requested.lock().push(chat_id.to_string());
            let result = self
                .result
                .lock()
                .take()
                .unwrap_or_else(|| Ok(ChatHistory::default()));
            Box::pin(async move { result })
        }
    }

    fn records() -> Vec<HistoryRecord> {
        vec![
            HistoryRecord::new("What is RAG?", "Retrieval, then generation.").with_reranked_docs(
                vec![
                    SourceDocument::file("kb", "rag.md").with_citation_id(1u64),
                    SourceDocument::file("kb", "rag-copy.md").with_citation_id(1u64),
                    SourceDocument::link("https://kb.example.com/rerank").with_citation_id(2u64),
                ],
            ),
            HistoryRecord::new("Does it cite?", "Yes.").with_reranked_docs(vec![
                SourceDocument::file("kb", "rag.md").with_citation_id(1u64),
            ]),
            HistoryRecord::new("Thanks", "You're welcome."),
        ]
    }

    #[test]
    fn reconcile_produces_resolved_turns_with_fresh_ids() {
        let turns = reconcile(records());

        assert_eq!(turns.len(), 3);
        assert!(turns.iter().all(|turn| !turn.is_pending && turn.error.is_none()));
        assert_eq!(turns[0].question, "What is RAG?");
        assert_eq!(turns[0].answer, "Retrieval, then generation.");
        assert_eq!(turns[2].question, "Thanks");

        let ids = turns.iter().map(|turn| turn.id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 3);
        assert!(reconcile(records()).iter().all(|turn| !ids.contains(&turn.id)));
    }

    #[test]
    fn reconcile_dedupes_sources_per_turn() {
        let turns = reconcile(records());

        assert_eq!(turns[0].sources.len(), 2);
        assert_eq!(turns[0].sources[0], SourceDocument::file("kb", "rag.md").with_citation_id(1u64));
        assert_eq!(turns[1].sources.len(), 1);
        assert!(turns[2].sources.is_empty());
    }

    #[test]
    fn reconcile_empty_history_is_empty() {
        assert!(reconcile(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn open_replaces_store_with_history() {
        let store = ConversationStore::new();
        store.append_user_turn("current").unwrap();
        let service = FakeHistory::returning(Ok(ChatHistory { history: records() }));
        let (notifier, mut notifications) = ChannelNotifier::new();
        let reconciler = HistoryReconciler::new(service.clone(), store.clone(), Arc::new(notifier));

        let restored = reconciler.open("chat-42").await.unwrap();

        assert_eq!(restored, 3);
        assert_eq!(service.requested.lock().as_slice(), ["chat-42".to_string()]);
        let conversation = store.snapshot();
        assert_eq!(conversation.conversation_id.as_deref(), Some("chat-42"));
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation.pending_count(), 0);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_fetch_notifies_once_and_keeps_store() {
        let store = ConversationStore::new();
        store.set_conversation_id(Some("chat-1".to_string()));
        store.append_user_turn("keep me").unwrap();
        let before = store.snapshot();

        let service = FakeHistory::returning(Err(TransportError::HttpStatus {
            stage: "history-http-status",
            status: 404,
            message: "no such chat".to_string(),
        }));
        let (notifier, mut notifications) = ChannelNotifier::new();
        let reconciler = HistoryReconciler::new(service, store.clone(), Arc::new(notifier));

        let error = reconciler.open("missing").await.unwrap_err();

        assert!(matches!(error, HistoryError::FetchHistory { ref chat_id, .. } if chat_id == "missing"));
        assert_eq!(store.snapshot(), before);
        let Notification { severity, text } = notifications.try_recv().unwrap();
        assert_eq!(severity, Severity::Error);
        assert!(text.contains("no such chat"), "{text}");
        assert!(notifications.try_recv().is_err());
    }
}
