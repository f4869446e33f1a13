use std::collections::VecDeque;

use parking_lot::Mutex;
use proto::Envelope;
use tokio::sync::Notify;

/// What a session does when its outbound queue is full.
///
/// Clients lose the oldest queued envelope; adapters that cannot keep up
/// are disconnected so they reconnect cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    FatalClose,
}

/// One item for the session's send task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Body(Envelope),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    /// Fatal-close policy fired: a close frame replaced the queue.
    Overflowed,
    /// Queue already closed; the envelope was discarded.
    Closed,
}

/// Bounded FIFO between the router and one session's send task.
///
/// The close frame is part of the stream: a graceful close is appended
/// behind the envelopes already queued so they drain first, a fatal close
/// replaces them.
pub struct SendQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

struct Inner {
    items: VecDeque<Outbound>,
    closed: bool,
    dropped: u64,
}

impl SendQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            if inner.items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.dropped += 1;
                        inner.items.push_back(Outbound::Body(envelope));
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::FatalClose => {
                        inner.closed = true;
                        inner.items.clear();
                        inner.items.push_back(Outbound::Close {
                            code: proto::error::close::GOING_AWAY,
                            reason: "send_queue_overflow".to_string(),
                        });
                        PushOutcome::Overflowed
                    }
                }
            } else {
                inner.items.push_back(Outbound::Body(envelope));
                PushOutcome::Queued
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// Heartbeat pings don't count against the envelope budget.
    pub fn push_ping(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.items.push_back(Outbound::Ping);
        }

        self.notify.notify_one();
    }

    /// Enqueue the close frame. `immediate` discards pending envelopes;
    /// otherwise they drain before the frame goes out. Idempotent.
    pub fn close(&self, code: u16, reason: &str, immediate: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            inner.closed = true;
            let frame = Outbound::Close {
                code,
                reason: reason.to_string(),
            };

            if immediate {
                inner.items.clear();
                inner.items.push_front(frame);
            } else {
                inner.items.push_back(frame);
            }
        }

        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
