//! Update Throttler
//!
//! Coalesces high-frequency text deltas into at most one observable update
//! per field per interval. Each field keeps its own pending buffer, the time
//! of its last flush, and at most one scheduled deadline.
//!
//! The throttler owns no timer. The session asks for [`UpdateThrottler::next_deadline`]
//! and sleeps until it, then calls [`UpdateThrottler::flush_due`].

use std::time::Duration;

use tokio::time::Instant;

/// Default interval between flushes of the same field
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(50);

/// Streamed text field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamField {
    /// Reasoning text
    Thinking,
    /// Assistant-visible text
    Message,
}

impl StreamField {
    /// All fields, in flush order
    pub const ALL: [StreamField; 2] = [StreamField::Thinking, StreamField::Message];
}

/// Text released by the throttler for one field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flush {
    /// Field the text belongs to
    pub field: StreamField,
    /// Concatenated deltas since the previous flush
    pub text: String,
}

#[derive(Debug)]
struct FieldBuffer {
    pending: String,
    last_flush: Instant,
    deadline: Option<Instant>,
}

impl FieldBuffer {
    fn new(now: Instant) -> Self {
        Self {
            pending: String::new(),
            last_flush: now,
            deadline: None,
        }
    }

    fn take(&mut self, field: StreamField, now: Instant) -> Option<Flush> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        self.last_flush = now;
        Some(Flush {
            field,
            text: std::mem::take(&mut self.pending),
        })
    }
}

/// Per-session delta throttler
#[derive(Debug)]
pub struct UpdateThrottler {
    interval: Duration,
    thinking: FieldBuffer,
    message: FieldBuffer,
    flushes: u64,
}

impl UpdateThrottler {
    /// Create a throttler whose fields were last flushed at `now`
    #[must_use]
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            thinking: FieldBuffer::new(now),
            message: FieldBuffer::new(now),
            flushes: 0,
        }
    }

    /// Configured interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of flushes released so far
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Text buffered for a field but not yet flushed
    #[must_use]
    pub fn pending(&self, field: StreamField) -> &str {
        &self.buffer(field).pending
    }

    fn buffer(&self, field: StreamField) -> &FieldBuffer {
        match field {
            StreamField::Thinking => &self.thinking,
            StreamField::Message => &self.message,
        }
    }

    fn buffer_mut(&mut self, field: StreamField) -> &mut FieldBuffer {
        match field {
            StreamField::Thinking => &mut self.thinking,
            StreamField::Message => &mut self.message,
        }
    }

    /// Buffer a delta
    ///
    /// Returns a flush when the field has been quiet for a full interval;
    /// otherwise schedules the field's single deadline and holds the text.
    pub fn push(&mut self, field: StreamField, delta: &str, now: Instant) -> Option<Flush> {
        if delta.is_empty() {
            return None;
        }
        let interval = self.interval;
        let buffer = self.buffer_mut(field);
        buffer.pending.push_str(delta);

        if let Some(deadline) = buffer.deadline {
            if now < deadline {
                return None;
            }
        } else if now.saturating_duration_since(buffer.last_flush) < interval {
            buffer.deadline = Some(buffer.last_flush + interval);
            return None;
        }

        let flush = buffer.take(field, now);
        self.count(flush)
    }

    /// Earliest scheduled deadline across all fields
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.thinking.deadline, self.message.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Flush every field whose deadline has passed
    pub fn flush_due(&mut self, now: Instant) -> Vec<Flush> {
        let mut flushes = Vec::new();
        for field in StreamField::ALL {
            let due = self
                .buffer(field)
                .deadline
                .is_some_and(|deadline| deadline <= now);
            if due {
                flushes.extend(self.flush_field(field, now));
            }
        }
        flushes
    }

    /// Flush one field unconditionally, cancelling its deadline
    pub fn flush_field(&mut self, field: StreamField, now: Instant) -> Option<Flush> {
        let flush = self.buffer_mut(field).take(field, now);
        self.count(flush)
    }

    /// Flush all fields unconditionally
    pub fn flush_all(&mut self, now: Instant) -> Vec<Flush> {
        StreamField::ALL
            .into_iter()
            .filter_map(|field| self.flush_field(field, now))
            .collect()
    }

    fn count(&mut self, flush: Option<Flush>) -> Option<Flush> {
        if flush.is_some() {
            self.flushes += 1;
        }
        flush
    }
}
