use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::BoxFuture;
use super::auth::AuthProvider;
use super::client::{build_client, ensure_success};
use super::error::{
    AuthSnafu, DecodeHistorySnafu, EmptyChatIdSnafu, InvalidChatIdSnafu, MissingEndpointSnafu,
    SendRequestSnafu, TransportResult,
};
use super::event::SourceDocument;

// Characters that would end or split a path segment.
const CHAT_ID_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Persisted chat as returned by the history service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub metadata: Option<HistoryMetadata>,
}

impl HistoryRecord {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            metadata: None,
        }
    }

    pub fn with_reranked_docs(mut self, docs: Vec<SourceDocument>) -> Self {
        self.metadata
            .get_or_insert_with(HistoryMetadata::default)
            .reranked_docs = Some(docs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMetadata {
    #[serde(default)]
    pub reranked_docs: Option<Vec<SourceDocument>>,
    /// Fields the engine does not interpret, kept for round-tripping.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub trait HistoryService: Send + Sync {
    fn chat_by_id<'a>(&'a self, chat_id: &'a str) -> BoxFuture<'a, TransportResult<ChatHistory>>;
}

/// Reads chats with `GET {base_url}/{chat_id}`, the id encoded as one path
/// segment.
pub struct HttpHistoryService {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpHistoryService {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Option<Duration>,
        auth: Arc<dyn AuthProvider>,
    ) -> TransportResult<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        ensure!(
            !base_url.is_empty(),
            MissingEndpointSnafu {
                stage: "history-service-new",
                endpoint_kind: "history",
            }
        );

        Ok(Self {
            client: build_client(request_timeout, None)?,
            base_url,
            auth,
        })
    }

    fn chat_url(&self, chat_id: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            utf8_percent_encode(chat_id, CHAT_ID_SEGMENT)
        )
    }

    async fn fetch(&self, chat_id: &str) -> TransportResult<ChatHistory> {
        let chat_id = chat_id.trim();
        ensure!(
            !chat_id.is_empty(),
            EmptyChatIdSnafu {
                stage: "fetch-chat-history",
            }
        );
        // Dot segments are resolved by URL parsing even when encoded.
        ensure!(
            !matches!(chat_id, "." | ".."),
            InvalidChatIdSnafu {
                stage: "fetch-chat-history",
                chat_id,
            }
        );

        self.auth.refresh_token().await.context(AuthSnafu {
            stage: "refresh-history-token",
        })?;

        let mut builder = self.client.get(self.chat_url(chat_id));
        if let Some(token) = self.auth.token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context(SendRequestSnafu {
            stage: "send-history-request",
        })?;
        let response = ensure_success(response, "history-http-status").await?;

        let history = response
            .json::<ChatHistory>()
            .await
            .context(DecodeHistorySnafu {
                stage: "decode-history-response",
            })?;

        tracing::debug!(
            chat_id = %chat_id,
            record_count = history.history.len(),
            "fetched chat history"
        );
        Ok(history)
    }
}

impl HistoryService for HttpHistoryService {
    fn chat_by_id<'a>(&'a self, chat_id: &'a str) -> BoxFuture<'a, TransportResult<ChatHistory>> {
        Box::pin(self.fetch(chat_id))
    }
}
