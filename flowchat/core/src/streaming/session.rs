//! Streaming Session
//!
//! One task per turn: opens the transport, decodes records, throttles text
//! deltas and routes every event to the [`Reconciler`].
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► optimistic user message (synchronous)
//!    │
//!    └─► spawn ──► open ──► read loop ──► terminal event ──► freeze
//!                               │
//!                 select! { chunk | flush deadline | idle deadline }
//! ```
//!
//! Cancellation retires the session's liveness token and aborts the task.
//! Dropping the task drops the transport stream, which closes the
//! connection. A mutation racing the cancellation is rejected by the store.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use super::state::StreamingState;
use super::throttle::{Flush, StreamField, UpdateThrottler, DEFAULT_THROTTLE_INTERVAL};
use crate::backend::{ByteStream, TurnRequest, TurnTransport};
use crate::conversation::{ConversationKey, FinalResponse, LivenessToken, MessageId, Reconciler};
use crate::protocol::{FrameDecoder, ProtocolEvent, WorkflowArtifact};

/// Default time without any chunk before a session gives up
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Error text used when the stream ends without a terminal record
pub const CLOSED_EARLY: &str = "connection closed before the response completed";

/// Per-session tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Minimum time between observable updates of one text field
    pub throttle_interval: Duration,
    /// Give up after this long without data (`None` waits forever)
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// How a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A terminal success event was processed
    Completed,
    /// The turn failed (in-band error, transport failure, timeout)
    Failed(String),
    /// Superseded or stopped
    Cancelled,
}

/// Control handle of a running session
#[derive(Debug)]
pub struct SessionHandle {
    request_id: MessageId,
    token: LivenessToken,
    reconciler: Reconciler,
    task: JoinHandle<SessionOutcome>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    /// Correlation id of the turn
    #[must_use]
    pub fn request_id(&self) -> &MessageId {
        &self.request_id
    }

    /// Conversation the session writes to
    #[must_use]
    pub fn key(&self) -> &ConversationKey {
        self.token.key()
    }

    /// Liveness token of the session
    #[must_use]
    pub fn token(&self) -> &LivenessToken {
        &self.token
    }

    /// Stop the session
    ///
    /// No further mutation from it is observable once this returns.
    pub fn cancel(&self) {
        if self.reconciler.retire(&self.token) {
            tracing::debug!(
                conversation = %self.token.key(),
                request_id = %self.request_id,
                "Session cancelled"
            );
        }
        self.task.abort();
    }

    /// Whether the task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end without giving up control of it
    ///
    /// An aborted session reports [`SessionOutcome::Cancelled`].
    pub async fn wait(&self) -> SessionOutcome {
        wait_outcome(self.outcome.clone()).await
    }

    pub(crate) fn outcome_receiver(&self) -> watch::Receiver<Option<SessionOutcome>> {
        self.outcome.clone()
    }

    /// Wait for the session to end, consuming the handle
    pub async fn join(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => SessionOutcome::Cancelled,
            Err(e) => {
                tracing::error!(request_id = %self.request_id, error = %e, "Session task failed");
                SessionOutcome::Failed(format!("session task failed: {e}"))
            }
        }
    }
}

/// State of one streaming turn, owned by its task
pub struct StreamingSession {
    request: TurnRequest,
    transport: Arc<dyn TurnTransport>,
    reconciler: Reconciler,
    token: LivenessToken,
    options: SessionOptions,
    decoder: FrameDecoder,
    throttler: UpdateThrottler,
    /// Every message delta received, for folding into `Done`
    message_text: String,
    workflow: Option<WorkflowArtifact>,
}

impl StreamingSession {
    /// Start a turn
    ///
    /// The optimistic user message is in place when this returns. Must be
    /// called inside a tokio runtime.
    pub fn start(
        request: TurnRequest,
        transport: Arc<dyn TurnTransport>,
        reconciler: Reconciler,
        token: LivenessToken,
        options: SessionOptions,
    ) -> SessionHandle {
        reconciler.on_session_start(&token, &request);

        let request_id = request.request_id.clone();
        let span = tracing::debug_span!(
            "session",
            conversation = %token.key(),
            request_id = %request_id,
            transport = transport.name(),
        );
        let session = Self {
            request,
            transport,
            reconciler: reconciler.clone(),
            token: token.clone(),
            options,
            decoder: FrameDecoder::new(),
            throttler: UpdateThrottler::new(options.throttle_interval, Instant::now()),
            message_text: String::new(),
            workflow: None,
        };
        let (outcome_tx, outcome) = watch::channel(None);
        let task = tokio::spawn(
            async move {
                let outcome = session.run().await;
                outcome_tx.send_replace(Some(outcome.clone()));
                outcome
            }
            .instrument(span),
        );

        SessionHandle {
            request_id,
            token,
            reconciler,
            task,
            outcome,
        }
    }

    async fn run(mut self) -> SessionOutcome {
        // The idle budget also bounds a backend that never answers
        let open_deadline = self.options.idle_timeout.map(|t| Instant::now() + t);
        let opened = tokio::select! {
            result = self.transport.open(&self.request) => Some(result),
            () = wait_until(open_deadline) => None,
        };
        let Some(opened) = opened else {
            tracing::warn!("No response while opening stream");
            return self.idle_expired();
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open stream");
                return self.fail(e.to_string());
            }
        };
        tracing::debug!("Stream opened");
        self.consume(stream).await
    }

    async fn consume(&mut self, mut stream: ByteStream) -> SessionOutcome {
        let idle_timeout = self.options.idle_timeout;
        let mut idle_deadline = idle_timeout.map(|t| Instant::now() + t);

        loop {
            let flush_deadline = self.throttler.next_deadline();

            tokio::select! {
                chunk = stream.next() => {
                    if !self.reconciler.is_live(&self.token) {
                        tracing::debug!("Session superseded, dropping stream");
                        return SessionOutcome::Cancelled;
                    }
                    match chunk {
                        Some(Ok(bytes)) => {
                            idle_deadline = idle_timeout.map(|t| Instant::now() + t);
                            self.decoder.push(&bytes);
                            while let Some(event) = self.decoder.next_event() {
                                if let Some(outcome) = self.dispatch(event) {
                                    return outcome;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Stream read failed");
                            return self.fail(e.to_string());
                        }
                        None => {
                            if let Some(outcome) = self.decoder.finish().and_then(|event| self.dispatch(event)) {
                                return outcome;
                            }
                            tracing::warn!(dropped = self.decoder.dropped(), "Stream ended without a terminal record");
                            return self.fail(CLOSED_EARLY.to_string());
                        }
                    }
                }
                () = wait_until(flush_deadline) => {
                    for flush in self.throttler.flush_due(Instant::now()) {
                        self.publish(&flush);
                    }
                }
                () = wait_until(idle_deadline) => {
                    tracing::warn!("Stream idle timeout");
                    return self.idle_expired();
                }
            }
        }
    }

    /// Route one event; returns the outcome once a terminal event is handled
    fn dispatch(&mut self, event: ProtocolEvent) -> Option<SessionOutcome> {
        let now = Instant::now();
        tracing::trace!(event = event.kind(), "Dispatching event");

        match event {
            ProtocolEvent::Thinking { content } => {
                if let Some(flush) = self.throttler.push(StreamField::Thinking, &content, now) {
                    self.publish(&flush);
                }
                None
            }
            ProtocolEvent::MessageDelta { content } => {
                self.message_text.push_str(&content);
                if let Some(flush) = self.throttler.push(StreamField::Message, &content, now) {
                    self.publish(&flush);
                }
                None
            }
            ProtocolEvent::ThinkingComplete => {
                if let Some(flush) = self.throttler.flush_field(StreamField::Thinking, now) {
                    self.publish(&flush);
                }
                self.update(|state| state.thinking_complete = true);
                None
            }
            ProtocolEvent::Progress { label } => {
                self.update(|state| state.progress_label = Some(label));
                None
            }
            ProtocolEvent::ToolStarted { name } => {
                self.update(|state| state.tools_started.push(name));
                None
            }
            ProtocolEvent::WorkflowProduced { workflow_data } => {
                self.workflow = Some(workflow_data.clone());
                self.reconciler
                    .on_workflow_produced(&self.token, workflow_data);
                None
            }
            ProtocolEvent::FinalResponse {
                message,
                workflow_data,
                tokens_used,
            } => {
                let response = FinalResponse {
                    message,
                    workflow_data: workflow_data.or_else(|| self.workflow.clone()),
                    tokens_used,
                };
                Some(self.complete(response, now))
            }
            ProtocolEvent::Done => {
                // No final_response: the streamed text is the answer
                let response = FinalResponse {
                    message: std::mem::take(&mut self.message_text),
                    workflow_data: self.workflow.take(),
                    tokens_used: None,
                };
                Some(self.complete(response, now))
            }
            ProtocolEvent::Error { message } => Some(self.fail(message)),
        }
    }

    fn complete(&mut self, response: FinalResponse, now: Instant) -> SessionOutcome {
        self.flush_all(now);
        if let Some(tokens) = response.tokens_used {
            tracing::debug!(tokens_used = tokens, "Turn usage");
        }
        self.reconciler
            .on_final_response(&self.token, &self.request, response);
        self.reconciler.freeze_streaming(&self.token);
        tracing::debug!("Turn completed");
        SessionOutcome::Completed
    }

    fn fail(&mut self, message: String) -> SessionOutcome {
        self.flush_all(Instant::now());
        self.reconciler.on_error(&self.token, &self.request, &message);
        self.reconciler.freeze_streaming(&self.token);
        tracing::debug!(error = %message, "Turn failed");
        SessionOutcome::Failed(message)
    }

    fn idle_expired(&mut self) -> SessionOutcome {
        let secs = self.options.idle_timeout.map_or(0, |t| t.as_secs());
        self.fail(format!("no data received for {secs}s"))
    }

    fn flush_all(&mut self, now: Instant) {
        for flush in self.throttler.flush_all(now) {
            self.publish(&flush);
        }
    }

    fn publish(&self, flush: &Flush) {
        self.update(|state| state.apply_flush(flush));
    }

    fn update(&self, f: impl FnOnce(&mut StreamingState)) {
        self.reconciler.update_streaming(&self.token, f);
    }
}

pub(crate) async fn wait_outcome(
    mut outcome: watch::Receiver<Option<SessionOutcome>>,
) -> SessionOutcome {
    match outcome.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(SessionOutcome::Cancelled),
        // Sender dropped without a value: the task was aborted
        Err(_) => SessionOutcome::Cancelled,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
