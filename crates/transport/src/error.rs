use snafu::Snafu;

use super::auth::AuthError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("{endpoint_kind} endpoint is not configured"))]
    MissingEndpoint {
        stage: &'static str,
        endpoint_kind: &'static str,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("authentication failed on `{stage}`: {source}"))]
    Auth {
        stage: &'static str,
        source: AuthError,
    },
    #[snafu(display("request could not be sent on `{stage}`: {source}"))]
    SendRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("{message} (status {status})"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("failed to decode chat history on `{stage}`: {source}"))]
    DecodeHistory {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat id must not be empty"))]
    EmptyChatId { stage: &'static str },
    #[snafu(display("chat id '{chat_id}' is not a valid path segment"))]
    InvalidChatId {
        stage: &'static str,
        chat_id: String,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
