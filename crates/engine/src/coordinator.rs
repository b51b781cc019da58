use std::sync::Arc;

use parking_lot::Mutex;
use parley_transport::{CancelHandle, ChatRequest, ChatTransport, StreamEvent, TokenEventStream};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::watch;

use crate::accumulator::{accumulate, cancel};
use crate::store::{ConversationStore, StoreError};
use crate::turn::TurnId;

pub const DEFAULT_CANCELED_MESSAGE: &str = "Request aborted";
const UNTERMINATED_STREAM_MESSAGE: &str = "stream ended before a terminal event";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Streaming,
    Canceling,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinatorError {
    #[snafu(display("a request is already in flight ({phase:?}) on `{stage}`"))]
    Busy {
        stage: &'static str,
        phase: RequestPhase,
    },
    #[snafu(display("question is empty on `{stage}`"))]
    EmptyQuestion { stage: &'static str },
    #[snafu(display("failed to record question on `{stage}`: {source}"))]
    RecordQuestion {
        stage: &'static str,
        source: StoreError,
    },
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

struct ActiveRequest {
    request_id: u64,
    turn_id: TurnId,
    cancel: CancelHandle,
}

#[derive(Default)]
struct Bookkeeping {
    next_request_id: u64,
    active: Option<ActiveRequest>,
}

struct CoordinatorInner {
    transport: Arc<dyn ChatTransport>,
    store: ConversationStore,
    canceled_message: String,
    // Written only while `bookkeeping` is locked.
    phase: watch::Sender<RequestPhase>,
    bookkeeping: Mutex<Bookkeeping>,
}

/// Runs at most one streaming request at a time against one conversation.
///
/// Clones drive the same conversation.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RequestCoordinator {
    pub fn new(transport: Arc<dyn ChatTransport>, store: ConversationStore) -> Self {
        Self::with_canceled_message(transport, store, DEFAULT_CANCELED_MESSAGE)
    }

    pub fn with_canceled_message(
        transport: Arc<dyn ChatTransport>,
        store: ConversationStore,
        canceled_message: impl Into<String>,
    ) -> Self {
        let (phase, _) = watch::channel(RequestPhase::Idle);
        Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                store,
                canceled_message: canceled_message.into(),
                phase,
                bookkeeping: Mutex::new(Bookkeeping::default()),
            }),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.inner.store
    }

    pub fn phase(&self) -> RequestPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RequestPhase> {
        self.inner.phase.subscribe()
    }

    /// Id of the turn currently being streamed, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.inner
            .bookkeeping
            .lock()
            .active
            .as_ref()
            .map(|request| request.turn_id)
    }

    /// Appends a pending turn for `question` and starts streaming its answer.
    ///
    /// Must be called from within a tokio runtime. Rejected unless the
    /// coordinator is idle; submissions are never queued.
    pub fn submit_prompt(&self, question: impl Into<String>) -> CoordinatorResult<TurnId> {
        let question = question.into();
        ensure!(
            !question.trim().is_empty(),
            EmptyQuestionSnafu {
                stage: "submit-prompt",
            }
        );

        let mut bookkeeping = self.inner.bookkeeping.lock();
        let phase = *self.inner.phase.borrow();
        ensure!(
            phase == RequestPhase::Idle,
            BusySnafu {
                stage: "submit-prompt",
                phase,
            }
        );

        let turn_id = self
            .inner
            .store
            .append_user_turn(question.clone())
            .context(RecordQuestionSnafu {
                stage: "append-user-turn",
            })?;

        let request =
            ChatRequest::new(question).with_conversation_id(self.inner.store.conversation_id());
        let handle = self.inner.transport.open_stream(request);
        let cancel_handle = handle.stream.cancel_handle();

        bookkeeping.next_request_id += 1;
        let request_id = bookkeeping.next_request_id;
        bookkeeping.active = Some(ActiveRequest {
            request_id,
            turn_id,
            cancel: cancel_handle.clone(),
        });
        self.inner.phase.send_replace(RequestPhase::Streaming);
        drop(bookkeeping);

        tracing::debug!(turn_id = %turn_id, request_id, "request started");
        tokio::spawn(handle.worker);
        tokio::spawn(drive_request(
            self.inner.clone(),
            request_id,
            turn_id,
            handle.stream,
            cancel_handle,
        ));

        Ok(turn_id)
    }

    /// Cancels the streaming request and waits until its turn is resolved.
    ///
    /// Returns `false` without doing anything unless a request is streaming,
    /// so repeated calls behave like a single one.
    pub async fn abort_request(&self) -> bool {
        let cancel_handle = {
            let bookkeeping = self.inner.bookkeeping.lock();
            if *self.inner.phase.borrow() != RequestPhase::Streaming {
                return false;
            }
            let Some(active) = bookkeeping.active.as_ref() else {
                return false;
            };
            self.inner.phase.send_replace(RequestPhase::Canceling);
            tracing::debug!(turn_id = %active.turn_id, "aborting request");
            active.cancel.clone()
        };

        cancel_handle.cancel();
        self.wait_idle().await;
        true
    }

    pub async fn wait_idle(&self) {
        let mut phase = self.inner.phase.subscribe();
        let _ = phase.wait_for(|current| *current == RequestPhase::Idle).await;
    }

    /// Aborts any streaming request and clears the conversation.
    pub async fn start_new_chat(&self) {
        self.abort_request().await;
        self.wait_idle().await;
        self.inner.store.reset_conversation();
    }
}

/// Folds events into the turn until the stream ends, then resolves the turn
/// and returns the coordinator to idle.
async fn drive_request(
    inner: Arc<CoordinatorInner>,
    request_id: u64,
    turn_id: TurnId,
    mut stream: TokenEventStream,
    cancel_handle: CancelHandle,
) {
    let mut terminated = false;
    while let Some(event) = stream.recv().await {
        if cancel_handle.is_cancelled() {
            tracing::debug!(turn_id = %turn_id, "discarding event after cancel");
            continue;
        }

        let is_terminal = event.is_terminal();
        if let StreamEvent::Error(message) = &event {
            tracing::warn!(turn_id = %turn_id, error = %message, "request failed");
        }
        inner
            .store
            .fold_pending(turn_id, |turn| accumulate(turn, event));
        if is_terminal {
            terminated = true;
            break;
        }
    }

    if cancel_handle.is_cancelled() && !terminated {
        inner
            .store
            .fold_pending(turn_id, |turn| cancel(turn, &inner.canceled_message));
        tracing::debug!(turn_id = %turn_id, "request canceled");
    } else if !terminated {
        inner.store.fold_pending(turn_id, |turn| {
            accumulate(
                turn,
                StreamEvent::Error(UNTERMINATED_STREAM_MESSAGE.to_string()),
            )
        });
        tracing::warn!(turn_id = %turn_id, "stream ended before a terminal event");
    }
    drop(stream);

    let mut bookkeeping = inner.bookkeeping.lock();
    if bookkeeping
        .active
        .as_ref()
        .is_some_and(|active| active.request_id == request_id)
    {
        bookkeeping.active = None;
        inner.phase.send_replace(RequestPhase::Idle);
    }
    tracing::debug!(turn_id = %turn_id, request_id, "request finished");
}
