use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::auth::AuthProvider;
use super::decode::StreamFraming;
use super::error::{
    AuthSnafu, BuildClientSnafu, MissingEndpointSnafu, SendRequestSnafu, TransportError,
    TransportResult,
};
use super::event::StreamEvent;
use super::reader::{EventSender, StreamHandle, pump_body};

/// Payload posted to the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            conversation_id: None,
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }
}

/// Opens token streams for chat requests.
///
/// Opening never fails directly: every failure, including ones before the
/// response starts, is delivered as a terminal `Error` event.
pub trait ChatTransport: Send + Sync {
    fn open_stream(&self, request: ChatRequest) -> StreamHandle;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTransportConfig {
    pub endpoint: String,
    pub framing: StreamFraming,
    pub request_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

impl ChatTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            framing: StreamFraming::default(),
            request_timeout: None,
            read_timeout: None,
        }
    }

    pub fn with_framing(mut self, framing: StreamFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

pub struct HttpChatTransport {
    client: reqwest::Client,
    config: ChatTransportConfig,
    auth: Arc<dyn AuthProvider>,
}

impl HttpChatTransport {
    pub fn new(config: ChatTransportConfig, auth: Arc<dyn AuthProvider>) -> TransportResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "chat-transport-new",
                endpoint_kind: "chat",
            }
        );

        let client = build_client(config.request_timeout, config.read_timeout)?;
        Ok(Self {
            client,
            config,
            auth,
        })
    }

    pub fn config(&self) -> &ChatTransportConfig {
        &self.config
    }

    async fn run_request(
        client: reqwest::Client,
        config: ChatTransportConfig,
        auth: Arc<dyn AuthProvider>,
        request: ChatRequest,
        events: EventSender,
    ) {
        let response = match Self::send(&client, &config, auth.as_ref(), &request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    endpoint = %config.endpoint,
                    error = %error,
                    "chat request failed before streaming began"
                );
                let _ = events.send(StreamEvent::Error(error.to_string()));
                return;
            }
        };

        tracing::debug!(endpoint = %config.endpoint, "chat stream opened");
        pump_body(response.bytes_stream(), config.framing, &events).await;
    }

    async fn send(
        client: &reqwest::Client,
        config: &ChatTransportConfig,
        auth: &dyn AuthProvider,
        request: &ChatRequest,
    ) -> TransportResult<reqwest::Response> {
        auth.refresh_token().await.context(AuthSnafu {
            stage: "refresh-chat-token",
        })?;

        let mut builder = client.post(&config.endpoint).json(request);
        if let Some(token) = auth.token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context(SendRequestSnafu {
            stage: "send-chat-request",
        })?;
        ensure_success(response, "chat-http-status").await
    }
}

impl ChatTransport for HttpChatTransport {
    fn open_stream(&self, request: ChatRequest) -> StreamHandle {
        let client = self.client.clone();
        let config = self.config.clone();
        let auth = Arc::clone(&self.auth);

        StreamHandle::new(move |events| Self::run_request(client, config, auth, request, events))
    }
}

pub(crate) fn build_client(
    request_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
) -> TransportResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = read_timeout {
        builder = builder.read_timeout(timeout);
    }
    builder.build().context(BuildClientSnafu {
        stage: "build-http-client",
    })
}

/// Passes a 2xx response through; otherwise reads the error body into a
/// user-facing message.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    stage: &'static str,
) -> TransportResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(TransportError::HttpStatus {
        stage,
        status: status.as_u16(),
        message: error_message_from_body(status, &body),
    })
}

fn error_message_from_body(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidate = value
            .get("error")
            .and_then(|error| error.as_str().or_else(|| error.get("message")?.as_str()))
            .or_else(|| value.get("message").and_then(|message| message.as_str()))
            .or_else(|| value.get("detail").and_then(|detail| detail.as_str()));

        if let Some(message) = candidate
            && !message.trim().is_empty()
        {
            return message.trim().to_string();
        }
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }

    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    }
}
