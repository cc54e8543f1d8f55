//! Completion queue.
//!
//! A [`CompletionQueue`] is the only place results come out of the engine.
//! Every accepted submission (a call batch, a `request_call`, a server
//! shutdown) reserves a completion slot on its queue at admission time and
//! later fills it with exactly one [`Event`] carrying the submission's
//! [`Tag`]. Consumers drain events with [`poll`](CompletionQueue::poll) from
//! any number of threads; each event goes to exactly one poller.
//!
//! Once [`shutdown`](CompletionQueue::shutdown) is called no new slots can be
//! reserved. Slots already reserved still complete normally, and only when
//! all of them have been delivered do pollers see
//! [`CompletionType::QueueShutdown`].

use crate::call::{Call, CallDetails};
use crate::error::CallError;
use crate::op::OperationResult;
use crate::{Metadata, Tag, Timespec};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{trace, warn};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Events
// =============================================================================

/// Kind of a delivered [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionType {
    /// The queue is shut down and fully drained.
    QueueShutdown,
    /// A submitted batch, call request or shutdown finished.
    OperationComplete,
    /// The poll deadline elapsed with nothing to deliver.
    Timeout,
}

/// An incoming call handed to the server by `request_call`.
#[derive(Debug)]
pub(crate) struct RequestedCall {
    pub(crate) call: Option<Call>,
    pub(crate) metadata: Metadata,
    pub(crate) details: CallDetails,
    pub(crate) payload: Option<Bytes>,
}

/// Result of a [`CompletionQueue::poll`].
#[derive(Debug)]
pub struct Event {
    kind: CompletionType,
    tag: Option<Tag>,
    success: bool,
    batch_operations: Vec<OperationResult>,
    request: Option<RequestedCall>,
}

impl Event {
    fn without_tag(kind: CompletionType) -> Self {
        Self {
            kind,
            tag: None,
            success: false,
            batch_operations: Vec::new(),
            request: None,
        }
    }

    /// Kind of this event.
    pub fn completion_type(&self) -> CompletionType {
        self.kind
    }

    /// Tag supplied at submission. `None` for timeout and shutdown events.
    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    /// Whether the submission succeeded.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Per-operation results of a batch, in submission order.
    pub fn batch_operations(&self) -> &[OperationResult] {
        &self.batch_operations
    }

    /// Request metadata of a call delivered by `request_call`.
    pub fn request_metadata(&self) -> Option<&Metadata> {
        self.request.as_ref().map(|r| &r.metadata)
    }

    /// Method, host and deadline of a call delivered by `request_call`.
    pub fn request_call_details(&self) -> Option<&CallDetails> {
        self.request.as_ref().map(|r| &r.details)
    }

    /// First request message, for registered methods that read it up front.
    pub fn request_payload(&self) -> Option<&Bytes> {
        self.request.as_ref().and_then(|r| r.payload.as_ref())
    }

    /// Take ownership of the call delivered by `request_call`.
    pub fn take_call(&mut self) -> Option<Call> {
        self.request.as_mut().and_then(|r| r.call.take())
    }
}

// =============================================================================
// Queue
// =============================================================================

struct QueueState {
    events: VecDeque<Event>,
    outstanding: Slab<Tag>,
    shutdown: bool,
    closed: bool,
}

pub(crate) struct QueueInner {
    id: u64,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl QueueInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Reserve the completion slot for `tag`.
    pub(crate) fn begin(self: &Arc<Self>, tag: &Tag) -> Result<Completion, CallError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(CallError::CompletionQueueShutdown);
        }
        let key = state.outstanding.insert(tag.clone());
        Ok(Completion {
            queue: Arc::downgrade(self),
            key: Some(key),
        })
    }

    fn post(&self, key: usize, mut event: Event) {
        let mut state = self.state.lock();
        let Some(tag) = state.outstanding.try_remove(key) else {
            return;
        };
        if state.closed {
            // the queue handle is gone; drop the event outside the lock
            drop(state);
            trace!(queue = self.id, ?tag, "completion discarded");
            return;
        }
        trace!(queue = self.id, ?tag, success = event.success, "completion posted");
        event.tag = Some(tag);
        state.events.push_back(event);
        drop(state);
        self.ready.notify_all();
    }
}

/// The engine's event sink.
///
/// The queue owns its event buffer; calls and servers only hold weak
/// references to it. Dropping a queue before its shutdown event has been
/// observed discards any completions still in flight.
pub struct CompletionQueue {
    inner: Arc<QueueInner>,
}

impl CompletionQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    outstanding: Slab::new(),
                    shutdown: false,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<QueueInner> {
        &self.inner
    }

    /// Wait for the next event until `deadline`.
    ///
    /// Returns a [`CompletionType::Timeout`] event if the deadline passes
    /// first, and a [`CompletionType::QueueShutdown`] event once the queue is
    /// shut down and drained.
    pub fn poll(&self, deadline: impl Into<Timespec>) -> Event {
        let until = deadline.into().to_instant();
        let mut state = self.inner.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                trace!(queue = self.inner.id, tag = ?event.tag, "event delivered");
                return event;
            }
            if state.shutdown && state.outstanding.is_empty() {
                return Event::without_tag(CompletionType::QueueShutdown);
            }
            match until {
                None => self.inner.ready.wait(&mut state),
                Some(at) => {
                    if Instant::now() >= at {
                        return Event::without_tag(CompletionType::Timeout);
                    }
                    self.inner.ready.wait_until(&mut state, at);
                }
            }
        }
    }

    /// Wait for the next event with no deadline.
    pub fn next(&self) -> Event {
        self.poll(Timespec::inf_future())
    }

    /// Wait for the event of one specific tag.
    ///
    /// Events for other tags stay queued for other pollers. Returns a
    /// shutdown event if the queue is shut down and `tag` has nothing left
    /// to deliver.
    pub fn pluck(&self, tag: &Tag, deadline: impl Into<Timespec>) -> Event {
        let until = deadline.into().to_instant();
        let mut state = self.inner.state.lock();
        loop {
            if let Some(pos) = state.events.iter().position(|e| e.tag.as_ref() == Some(tag)) {
                if let Some(event) = state.events.remove(pos) {
                    return event;
                }
            }
            if state.shutdown && !state.outstanding.iter().any(|(_, t)| t == tag) {
                return Event::without_tag(CompletionType::QueueShutdown);
            }
            match until {
                None => self.inner.ready.wait(&mut state),
                Some(at) => {
                    if Instant::now() >= at {
                        return Event::without_tag(CompletionType::Timeout);
                    }
                    self.inner.ready.wait_until(&mut state, at);
                }
            }
        }
    }

    /// Stop admitting new work. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            trace!(
                queue = self.inner.id,
                outstanding = state.outstanding.len(),
                "queue shutdown"
            );
        }
        drop(state);
        self.inner.ready.notify_all();
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionQueue")
            .field("id", &self.inner.id)
            .field("pending", &state.events.len())
            .field("outstanding", &state.outstanding.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.closed = true;
        if !state.outstanding.is_empty() || !state.events.is_empty() {
            warn!(
                queue = self.inner.id,
                outstanding = state.outstanding.len(),
                undelivered = state.events.len(),
                "completion queue dropped before draining"
            );
        }
        let events = std::mem::take(&mut state.events);
        drop(state);
        drop(events);
    }
}

// =============================================================================
// Completion slot
// =============================================================================

/// A reserved slot on a queue. Filling it posts the event.
///
/// A slot that is dropped without being filled posts a failed event, so
/// every admitted tag still comes out of the queue exactly once.
pub(crate) struct Completion {
    queue: Weak<QueueInner>,
    key: Option<usize>,
}

impl Completion {
    pub(crate) fn complete(mut self, success: bool, batch_operations: Vec<OperationResult>) {
        self.post(success, batch_operations, None);
    }

    pub(crate) fn complete_request(mut self, request: RequestedCall) {
        self.post(true, Vec::new(), Some(request));
    }

    fn post(
        &mut self,
        success: bool,
        batch_operations: Vec<OperationResult>,
        request: Option<RequestedCall>,
    ) {
        let Some(key) = self.key.take() else {
            return;
        };
        let event = Event {
            kind: CompletionType::OperationComplete,
            tag: None,
            success,
            batch_operations,
            request,
        };
        match self.queue.upgrade() {
            Some(queue) => queue.post(key, event),
            None => warn!("completion dropped: queue no longer exists"),
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.post(false, Vec::new(), None);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Timespec {
        Timespec::after(Duration::from_millis(20))
    }

    #[test]
    fn test_poll_timeout() {
        let cq = CompletionQueue::new();
        let event = cq.poll(soon());
        assert_eq!(event.completion_type(), CompletionType::Timeout);
        assert!(event.tag().is_none());

        let event = cq.poll(Timespec::inf_past());
        assert_eq!(event.completion_type(), CompletionType::Timeout);
    }

    #[test]
    fn test_completion_delivers_tag() {
        let cq = CompletionQueue::new();
        let tag = Tag::new();
        let completion = cq.inner().begin(&tag).unwrap();
        completion.complete(true, Vec::new());

        let event = cq.poll(soon());
        assert_eq!(event.completion_type(), CompletionType::OperationComplete);
        assert_eq!(event.tag(), Some(&tag));
        assert!(event.success());
        assert!(event.batch_operations().is_empty());
        assert!(event.request_metadata().is_none());
    }

    #[test]
    fn test_dropped_slot_posts_failure() {
        let cq = CompletionQueue::new();
        let tag = Tag::new();
        drop(cq.inner().begin(&tag).unwrap());

        let event = cq.poll(soon());
        assert_eq!(event.tag(), Some(&tag));
        assert!(!event.success());
    }

    #[test]
    fn test_shutdown_drains_before_terminal_event() {
        let cq = CompletionQueue::new();
        let tag = Tag::new();
        let completion = cq.inner().begin(&tag).unwrap();
        cq.shutdown();
        assert!(cq.is_shutdown());

        // still waiting on the outstanding slot
        assert_eq!(cq.poll(soon()).completion_type(), CompletionType::Timeout);

        completion.complete(true, Vec::new());
        let event = cq.poll(soon());
        assert_eq!(event.tag(), Some(&tag));
        assert_eq!(cq.poll(soon()).completion_type(), CompletionType::QueueShutdown);
        assert_eq!(cq.poll(soon()).completion_type(), CompletionType::QueueShutdown);
    }

    #[test]
    fn test_begin_after_shutdown() {
        let cq = CompletionQueue::new();
        cq.shutdown();
        cq.shutdown();
        assert_eq!(
            cq.inner().begin(&Tag::new()).unwrap_err(),
            CallError::CompletionQueueShutdown
        );
        assert_eq!(cq.next().completion_type(), CompletionType::QueueShutdown);
    }

    #[test]
    fn test_pluck_leaves_other_events() {
        let cq = CompletionQueue::new();
        let first = Tag::new();
        let second = Tag::new();
        cq.inner().begin(&first).unwrap().complete(true, Vec::new());
        cq.inner().begin(&second).unwrap().complete(true, Vec::new());

        let event = cq.pluck(&second, soon());
        assert_eq!(event.tag(), Some(&second));
        let event = cq.poll(soon());
        assert_eq!(event.tag(), Some(&first));

        let missing = Tag::new();
        assert_eq!(cq.pluck(&missing, soon()).completion_type(), CompletionType::Timeout);
    }

    #[test]
    fn test_wakes_blocked_poller() {
        let cq = Arc::new(CompletionQueue::new());
        let tag = Tag::new();
        let completion = cq.inner().begin(&tag).unwrap();

        let poller = {
            let cq = cq.clone();
            std::thread::spawn(move || cq.next())
        };
        std::thread::sleep(Duration::from_millis(20));
        completion.complete(true, Vec::new());

        let event = poller.join().unwrap();
        assert_eq!(event.tag(), Some(&tag));
    }

    #[test]
    fn test_concurrent_pollers_see_each_event_once() {
        use std::collections::HashSet;

        let cq = Arc::new(CompletionQueue::new());
        let tags: Vec<Tag> = (0..200).map(Tag::with_payload).collect();
        let slots: Vec<_> = tags.iter().map(|t| cq.inner().begin(t).unwrap()).collect();

        let pollers: Vec<_> = (0..4)
            .map(|_| {
                let cq = cq.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        let event = cq.next();
                        match event.completion_type() {
                            CompletionType::OperationComplete => {
                                seen.push(*event.tag().unwrap().payload::<i32>().unwrap())
                            }
                            _ => return seen,
                        }
                    }
                })
            })
            .collect();

        for slot in slots {
            slot.complete(true, Vec::new());
        }
        cq.shutdown();

        let mut all = Vec::new();
        for poller in pollers {
            all.extend(poller.join().unwrap());
        }
        assert_eq!(all.len(), 200);
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len(), 200);
    }
}
