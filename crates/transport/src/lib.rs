//! HTTP side of the conversation engine: wire types, the token stream reader,
//! the chat transport and the history service client.

use std::future::Future;
use std::pin::Pin;

pub mod auth;
pub mod client;
pub mod decode;
pub mod error;
pub mod event;
pub mod history;
pub mod reader;

pub use auth::{AuthError, AuthProvider, AuthResult, StaticToken};
pub use client::{ChatRequest, ChatTransport, ChatTransportConfig, HttpChatTransport};
pub use decode::{EventDecoder, StreamFraming, Utf8Decoder};
pub use error::{TransportError, TransportResult};
pub use event::{CitationId, SourceDocument, SourceLocation, StreamEvent};
pub use history::{ChatHistory, HistoryMetadata, HistoryRecord, HistoryService, HttpHistoryService};
pub use reader::{
    CancelHandle, EventSender, StreamHandle, StreamWorker, TokenEventStream, make_event_stream,
    pump_body, until_cancelled,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
