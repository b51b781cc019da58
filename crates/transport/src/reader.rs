use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::{Notify, mpsc};

use super::decode::{EventDecoder, StreamFraming};
use super::event::StreamEvent;

pub type EventSender = mpsc::UnboundedSender<StreamEvent>;
pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

/// Clonable handle that stops a stream worker at its next suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        if self.state.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        // notify_one stores a permit when the worker is not waiting yet.
        self.state.notify.notify_one();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.state.notify.notified().await;
    }
}

/// Lazy, finite, non-restartable sequence of events for one request.
///
/// The sequence ends when the worker finishes: after a terminal event, after
/// a cancellation acknowledgment, or when the worker is dropped.
pub struct TokenEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancelHandle,
}

impl TokenEventStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Stream for TokenEventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for TokenEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Event stream paired with the future that produces it. The caller decides
/// where the worker runs.
pub struct StreamHandle {
    pub stream: TokenEventStream,
    pub worker: StreamWorker,
}

impl StreamHandle {
    /// Builds a handle whose worker is cancelled through the stream's handle.
    pub fn new<F, Fut>(produce: F) -> Self
    where
        F: FnOnce(EventSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (event_tx, stream, cancel) = make_event_stream();
        let work = produce(event_tx);
        Self {
            stream,
            worker: Box::pin(until_cancelled(cancel, work)),
        }
    }
}

pub fn make_event_stream() -> (EventSender, TokenEventStream, CancelHandle) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancelHandle::new();
    (
        event_tx,
        TokenEventStream {
            events: event_rx,
            cancel: cancel.clone(),
        },
        cancel,
    )
}

/// Runs `work` until it completes or cancellation is requested. Dropping the
/// unfinished future releases whatever transport it holds.
pub async fn until_cancelled<F>(cancel: CancelHandle, work: F)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!("token stream cancelled");
        }
        _ = work => {}
    }
}

/// Reads a chunked body to completion, forwarding decoded events until the
/// first terminal one.
pub async fn pump_body<S, B, E>(body: S, framing: StreamFraming, events: &EventSender)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = EventDecoder::new(framing);

    while let Some(next) = body.next().await {
        match next {
            Ok(bytes) => {
                if !forward(events, decoder.push(bytes.as_ref())) || decoder.is_terminated() {
                    return;
                }
            }
            Err(source) => {
                tracing::warn!(error = %source, "response body failed mid-stream");
                let _ = events.send(StreamEvent::Error(format!(
                    "failed to read response body: {source}"
                )));
                return;
            }
        }
    }

    forward(events, decoder.finish());
}

fn forward(events: &EventSender, batch: Vec<StreamEvent>) -> bool {
    batch.into_iter().all(|event| events.send(event).is_ok())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;

    use super::*;

    fn body(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<&'static [u8], String>> {
        stream::iter(parts.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn body_chunks_become_events_in_order() {
        let handle = StreamHandle::new(|events| async move {
            let parts = vec![b"Hi".as_slice(), b" there".as_slice()];
            pump_body(body(parts), StreamFraming::PlainText, &events).await;
        });
        tokio::spawn(handle.worker);

        let events = handle.stream.collect::<Vec<_>>().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("Hi".to_string()),
                StreamEvent::Chunk(" there".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn body_error_is_terminal() {
        let parts: Vec<Result<&'static [u8], String>> =
            vec![Ok(b"Partial".as_slice()), Err("connection reset".to_string())];
        let handle = StreamHandle::new(|events| async move {
            pump_body(stream::iter(parts), StreamFraming::PlainText, &events).await;
        });
        tokio::spawn(handle.worker);

        let events = handle.stream.collect::<Vec<_>>().await;
        assert_eq!(events[0], StreamEvent::Chunk("Partial".to_string()));
        assert!(
            matches!(&events[1], StreamEvent::Error(message) if message.contains("connection reset"))
        );
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn cancel_ends_the_sequence_without_another_event() {
        let handle = StreamHandle::new(|events| async move {
            let _ = events.send(StreamEvent::Chunk("first".to_string()));
            // Simulates a server that never sends another byte.
            futures::future::pending::<()>().await;
        });
        let mut stream = handle.stream;
        let worker = tokio::spawn(handle.worker);

        assert_eq!(stream.recv().await, Some(StreamEvent::Chunk("first".to_string())));
        assert!(stream.cancel());
        assert!(!stream.cancel());

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stops after cancel")
            .expect("worker does not panic");
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_before_the_worker_starts_still_applies() {
        let handle = StreamHandle::new(|events| async move {
            let _ = events.send(StreamEvent::Chunk("never".to_string()));
        });
        let cancel = handle.stream.cancel_handle();
        assert!(cancel.cancel());

        handle.worker.await;

        let mut stream = handle.stream;
        assert_eq!(stream.recv().await, None);
    }
}
