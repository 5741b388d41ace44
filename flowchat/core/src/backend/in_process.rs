//! In-Process Transports
//!
//! Transports that never touch the network. Used for tests, demos and
//! offline use.
//!
//! - [`ScriptedTransport`] replays a fixed script of chunks for every turn.
//! - [`ChannelTransport`] hands the caller a sender for every opened stream,
//!   so bytes can be delivered at exactly the moment a test wants.
//!
//! # Usage
//!
//! ```ignore
//! let transport = Arc::new(ChannelTransport::new());
//! let handle = StreamingSession::start(request, transport.clone(), reconciler, token, options);
//!
//! let stream = transport.accept().await.unwrap();
//! stream.send_event(&ProtocolEvent::message("Hi"));
//! stream.send_event(&ProtocolEvent::Done);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::traits::{ByteStream, TransportError, TurnRequest, TurnTransport};
use crate::protocol::ProtocolEvent;

#[derive(Clone, Debug)]
enum Step {
    Chunk(Bytes),
    Delay(Duration),
    ReadError(String),
    HoldOpen,
}

/// Replays the same scripted stream for every opened turn
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: Vec<Step>,
    open_delay: Option<Duration>,
    open_error: Option<String>,
    opened: AtomicUsize,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedTransport {
    /// Create an empty script (the stream ends immediately)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose `open` always fails with a network error
    pub fn refusing(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Append a raw chunk
    #[must_use]
    pub fn chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.steps.push(Step::Chunk(chunk.into()));
        self
    }

    /// Append one event as a complete wire record
    #[must_use]
    pub fn event(self, event: &ProtocolEvent) -> Self {
        self.chunk(event.to_record())
    }

    /// Wait before the next step
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.steps.push(Step::Delay(delay));
        self
    }

    /// Fail the read at this point
    #[must_use]
    pub fn read_error(mut self, message: impl Into<String>) -> Self {
        self.steps.push(Step::ReadError(message.into()));
        self
    }

    /// Keep the stream open without data after the script ends
    #[must_use]
    pub fn hold_open(mut self) -> Self {
        self.steps.push(Step::HoldOpen);
        self
    }

    /// Wait this long before the open resolves
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Number of streams opened so far
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in order
    #[must_use]
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TurnTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, request: &TurnRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.open_error {
            return Err(TransportError::Network(message.clone()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let steps: VecDeque<Step> = self.steps.iter().cloned().collect();
        let stream = futures::stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    Step::Chunk(bytes) => return Some((Ok(bytes), steps)),
                    Step::Delay(delay) => tokio::time::sleep(delay).await,
                    Step::ReadError(message) => {
                        return Some((Err(TransportError::Network(message)), steps))
                    }
                    Step::HoldOpen => std::future::pending::<()>().await,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Test-side end of one opened stream
#[derive(Debug)]
pub struct OpenedStream {
    /// Request that opened the stream
    pub request: TurnRequest,
    sender: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl OpenedStream {
    /// Deliver raw bytes; `false` once the session dropped the stream
    pub fn send_bytes(&self, bytes: impl Into<Bytes>) -> bool {
        self.sender.send(Ok(bytes.into())).is_ok()
    }

    /// Deliver one event as a complete wire record
    pub fn send_event(&self, event: &ProtocolEvent) -> bool {
        self.send_bytes(event.to_record())
    }

    /// Fail the session's next read
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.sender
            .send(Err(TransportError::Network(message.into())))
            .is_ok()
    }

    /// Whether the session has dropped its end
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// End the stream
    pub fn close(self) {}
}

/// Hands every opened stream to the caller
#[derive(Debug)]
pub struct ChannelTransport {
    opened_tx: mpsc::UnboundedSender<OpenedStream>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OpenedStream>>,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    /// Create a transport with no opened streams
    #[must_use]
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            opened_tx,
            opened_rx: tokio::sync::Mutex::new(opened_rx),
        }
    }

    /// Wait for the next stream a session opens
    pub async fn accept(&self) -> Option<OpenedStream> {
        self.opened_rx.lock().await.recv().await
    }
}

#[async_trait]
impl TurnTransport for ChannelTransport {
    fn name(&self) -> &str {
        "channel"
    }

    async fn open(&self, request: &TurnRequest) -> Result<ByteStream, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.opened_tx
            .send(OpenedStream {
                request: request.clone(),
                sender,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}
