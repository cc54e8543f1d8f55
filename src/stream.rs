//! Shared per-call state between the client and server ends of a call.
//!
//! A [`Stream`] is the in-process stand-in for a transport stream: the
//! client's [`Call`](crate::Call) and the server's `Call` for the same RPC
//! both point at one `Stream`. Each end owns an [`Endpoint`] holding the
//! batches it has submitted. Sends are applied when a batch is admitted;
//! receives wait in their batch until the data they need is present, and a
//! batch completes once its last receive is satisfied.
//!
//! State changes happen under the stream lock, but their consequences
//! (posting completions, connecting to a server, notifying the server of a
//! finished call) are collected into [`Effects`] and run after the lock is
//! released.

use crate::error::CallError;
use crate::op::{OpKind, OpSet, Operation, OperationResult, OperationType};
use crate::queue::{Completion, QueueInner};
use crate::status::Status;
use crate::transport::{self, Address};
use crate::{Metadata, StatusCode, Tag, Timespec};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the call a handle drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Server-side observer of accepted calls.
pub(crate) trait CallTracker: Send + Sync {
    /// A delivered call has its final status and no server batch pending.
    fn call_finished(&self, stream_id: u64);

    /// The first request message (or the end of requests) has arrived for a
    /// call waiting on its initial payload.
    fn payload_ready(&self, stream: &Arc<Stream>);
}

/// Outcome of waiting for a call's first request message.
#[derive(Debug)]
pub(crate) enum InitialPayload {
    Ready(Option<Bytes>),
    Pending,
}

struct PendingBatch {
    completion: Completion,
    kinds: OpSet,
    results: Vec<Option<OperationResult>>,
    waiting: Vec<(usize, OperationType)>,
    success: bool,
}

#[derive(Default)]
struct Endpoint {
    invoked: OpSet,
    pending: OpSet,
    batches: Vec<PendingBatch>,
    terminated: bool,
}

struct StreamState {
    client: Endpoint,
    server: Endpoint,

    // client -> server
    request_metadata: Option<Metadata>,
    requests: VecDeque<Bytes>,
    half_closed: bool,

    // server -> client
    response_metadata: Option<Metadata>,
    responses: VecDeque<Bytes>,
    status: Option<Status>,

    cancelled: bool,
    dispatched: bool,
    awaiting_payload: bool,
    delivered: bool,
    finish_reported: bool,
    tracker: Option<Weak<dyn CallTracker>>,
    client_receive_limit: Option<usize>,
    server_receive_limit: Option<usize>,
}

/// Deferred consequences of a state change.
#[must_use]
#[derive(Default)]
pub(crate) struct Effects {
    completions: Vec<(Completion, bool, Vec<OperationResult>)>,
    dispatch: bool,
    payload_ready: Option<Arc<dyn CallTracker>>,
    finished: Option<Arc<dyn CallTracker>>,
}

impl Effects {
    /// Run the effects. Must be called with no stream lock held.
    pub(crate) fn run(self, stream: &Arc<Stream>) {
        for (completion, success, results) in self.completions {
            completion.complete(success, results);
        }
        if self.dispatch {
            transport::connect(stream.clone());
        }
        if let Some(tracker) = self.payload_ready {
            tracker.payload_ready(stream);
        }
        if let Some(tracker) = self.finished {
            tracker.call_finished(stream.id);
        }
    }
}

pub(crate) struct Stream {
    id: u64,
    method: String,
    host: String,
    deadline: Timespec,
    target: Address,
    state: Mutex<StreamState>,
}

impl Stream {
    pub(crate) fn new(
        method: String,
        host: String,
        deadline: Timespec,
        target: Address,
        client_receive_limit: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            method,
            host,
            deadline,
            target,
            state: Mutex::new(StreamState {
                client: Endpoint::default(),
                server: Endpoint::default(),
                request_metadata: None,
                requests: VecDeque::new(),
                half_closed: false,
                response_metadata: None,
                responses: VecDeque::new(),
                status: None,
                cancelled: false,
                dispatched: false,
                awaiting_payload: false,
                delivered: false,
                finish_reported: false,
                tracker: None,
                client_receive_limit,
                server_receive_limit: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn deadline(&self) -> Timespec {
        self.deadline
    }

    pub(crate) fn target(&self) -> &Address {
        &self.target
    }

    /// Validate and admit a batch for one end of the call.
    ///
    /// Stateless checks have already been done by the caller. On success the
    /// completion slot is reserved on `queue`, sends are applied and the
    /// batch waits for its receives.
    pub(crate) fn start_batch(
        self: &Arc<Self>,
        side: Side,
        ops: Vec<Operation>,
        queue: &Arc<QueueInner>,
        tag: &Tag,
    ) -> Result<(), CallError> {
        let mut state = self.state.lock();
        let endpoint = state.endpoint(side);
        for op in &ops {
            let kind = op.operation_type();
            if endpoint.invoked.contains(kind) || endpoint.pending.contains(kind) {
                return Err(CallError::AlreadyInvoked);
            }
            if endpoint.terminated && kind != OperationType::ReceiveCloseOnServer {
                return Err(CallError::AlreadyFinished);
            }
        }

        let completion = queue.begin(tag)?;
        trace!(
            stream = self.id,
            ?side,
            ops = ops.len(),
            queue = queue.id(),
            "batch admitted"
        );
        state.apply(side, ops, completion);
        let effects = state.progress();
        drop(state);
        effects.run(self);
        Ok(())
    }

    /// Terminate the call with `status` unless it already has one.
    pub(crate) fn cancel(self: &Arc<Self>, status: Status) -> bool {
        let mut state = self.state.lock();
        let code = status.code;
        if !state.cancel(status) {
            return false;
        }
        debug!(stream = self.id, %code, "call cancelled");
        let effects = state.progress();
        drop(state);
        effects.run(self);
        true
    }

    /// Hook the server into this call. Runs no effects.
    pub(crate) fn attach(&self, tracker: Weak<dyn CallTracker>, receive_limit: Option<usize>) {
        let mut state = self.state.lock();
        state.tracker = Some(tracker);
        state.server_receive_limit = receive_limit;
    }

    /// Take the first request message for a call delivered with its payload.
    ///
    /// Returns [`InitialPayload::Pending`] and arms a `payload_ready`
    /// notification when nothing has arrived yet. An oversized message is
    /// discarded and the call cancelled; the returned effects must be run
    /// once the caller has released its own locks.
    pub(crate) fn take_initial_payload(&self) -> (InitialPayload, Effects) {
        let mut state = self.state.lock();
        if let Some(message) = state.requests.pop_front() {
            if let Some(status) = over_limit(&message, state.server_receive_limit) {
                state.cancel(status);
                return (InitialPayload::Ready(None), state.progress());
            }
            return (InitialPayload::Ready(Some(message)), Effects::default());
        }
        if state.half_closed || state.status.is_some() {
            return (InitialPayload::Ready(None), Effects::default());
        }
        state.awaiting_payload = true;
        (InitialPayload::Pending, Effects::default())
    }

    /// Mark the call as handed to the server application.
    ///
    /// Returns false if the call has already finished, in which case no
    /// `call_finished` notification will follow.
    pub(crate) fn begin_tracking(&self) -> bool {
        let mut state = self.state.lock();
        state.delivered = true;
        if state.status.is_some() && state.server.batches.is_empty() {
            state.finish_reported = true;
            return false;
        }
        true
    }

    pub(crate) fn request_metadata(&self) -> Metadata {
        self.state
            .lock()
            .request_metadata
            .clone()
            .unwrap_or_default()
    }

    pub(crate) fn pending_batches(&self, side: Side) -> usize {
        self.state.lock().endpoint(side).batches.len()
    }

    /// Whether this end can no longer make progress on its own.
    pub(crate) fn is_finished(&self, side: Side) -> bool {
        let state = self.state.lock();
        match side {
            Side::Client => state.client.terminated,
            Side::Server => state.status.is_some(),
        }
    }
}

impl StreamState {
    fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn apply(&mut self, side: Side, ops: Vec<Operation>, completion: Completion) {
        let mut batch = PendingBatch {
            completion,
            kinds: OpSet::default(),
            results: Vec::with_capacity(ops.len()),
            waiting: Vec::new(),
            success: true,
        };

        let mut sends = Vec::new();
        for op in ops {
            let kind = op.operation_type();
            batch.kinds.insert(kind);
            let endpoint = self.endpoint_mut(side);
            if kind.repeatable() {
                endpoint.pending.insert(kind);
            } else {
                endpoint.invoked.insert(kind);
            }

            let slot = batch.results.len();
            batch.results.push(None);
            match op.kind {
                OpKind::ReceiveInitialMetadata
                | OpKind::ReceiveMessage
                | OpKind::ReceiveStatusOnClient
                | OpKind::ReceiveCloseOnServer => batch.waiting.push((slot, kind)),
                send => sends.push((slot, kind, send)),
            }
        }

        // metadata, then message, then close or status, whatever the batch order
        sends.sort_by_key(|(_, _, send)| send_rank(send));
        for (slot, kind, send) in sends {
            let applied = match send {
                OpKind::SendInitialMetadata(metadata) => self.send_metadata(side, metadata),
                OpKind::SendMessage(message) => self.send_message(side, message),
                OpKind::SendCloseFromClient => self.close_from_client(),
                OpKind::SendStatusFromServer(status) => self.send_status(status),
                _ => true,
            };
            batch.success &= applied;
            batch.results[slot] = Some(OperationResult::sent(kind));
        }

        self.endpoint_mut(side).batches.push(batch);
    }

    fn send_metadata(&mut self, side: Side, metadata: Metadata) -> bool {
        if self.status.is_some() {
            return false;
        }
        match side {
            Side::Client => self.request_metadata = Some(metadata),
            Side::Server => self.response_metadata = Some(metadata),
        }
        true
    }

    fn send_message(&mut self, side: Side, message: Bytes) -> bool {
        if self.status.is_some() {
            return false;
        }
        match side {
            Side::Client => self.requests.push_back(message),
            Side::Server => self.responses.push_back(message),
        }
        true
    }

    fn close_from_client(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        self.half_closed = true;
        true
    }

    fn send_status(&mut self, status: Status) -> bool {
        self.server.terminated = true;
        if self.status.is_some() {
            return false;
        }
        self.status = Some(status);
        true
    }

    fn cancel(&mut self, status: Status) -> bool {
        if self.status.is_some() {
            return false;
        }
        self.status = Some(status);
        self.cancelled = true;
        self.requests.clear();
        self.responses.clear();
        true
    }

    /// Try to satisfy one waiting receive.
    fn receive(&mut self, side: Side, kind: OperationType) -> Option<OperationResult> {
        match (side, kind) {
            (Side::Client, OperationType::ReceiveInitialMetadata) => {
                match (&self.response_metadata, &self.status) {
                    (Some(metadata), _) => Some(OperationResult::initial_metadata(metadata.clone())),
                    (None, Some(_)) => Some(OperationResult::initial_metadata(Metadata::new())),
                    (None, None) => None,
                }
            }
            (Side::Client, OperationType::ReceiveMessage) => {
                if let Some(message) = self.responses.pop_front() {
                    return Some(self.accept_message(message, self.client_receive_limit));
                }
                self.status.as_ref().map(|_| OperationResult::message(None))
            }
            (Side::Client, OperationType::ReceiveStatusOnClient) => {
                let status = self.status.clone()?;
                self.client.terminated = true;
                Some(OperationResult::status(status))
            }
            (Side::Server, OperationType::ReceiveMessage) => {
                if let Some(message) = self.requests.pop_front() {
                    return Some(self.accept_message(message, self.server_receive_limit));
                }
                if self.half_closed || self.status.is_some() {
                    return Some(OperationResult::message(None));
                }
                None
            }
            (Side::Server, OperationType::ReceiveCloseOnServer) => {
                if self.cancelled {
                    Some(OperationResult::close(true))
                } else if self.status.is_some() {
                    Some(OperationResult::close(false))
                } else {
                    None
                }
            }
            // side checks reject every other pairing before admission
            _ => None,
        }
    }

    fn accept_message(&mut self, message: Bytes, limit: Option<usize>) -> OperationResult {
        match over_limit(&message, limit) {
            Some(status) => {
                self.cancel(status);
                OperationResult::message(None)
            }
            None => OperationResult::message(Some(message)),
        }
    }

    /// Complete every batch whose receives can now be satisfied.
    fn progress(&mut self) -> Effects {
        let mut effects = Effects::default();
        loop {
            let client = self.advance(Side::Client, &mut effects);
            let server = self.advance(Side::Server, &mut effects);
            if !client && !server {
                break;
            }
        }

        if !self.dispatched && self.request_metadata.is_some() && self.status.is_none() {
            self.dispatched = true;
            effects.dispatch = true;
        }

        if self.awaiting_payload
            && (!self.requests.is_empty() || self.half_closed || self.status.is_some())
        {
            self.awaiting_payload = false;
            effects.payload_ready = self.tracker.as_ref().and_then(Weak::upgrade);
        }

        if self.delivered
            && !self.finish_reported
            && self.status.is_some()
            && self.server.batches.is_empty()
        {
            self.finish_reported = true;
            effects.finished = self.tracker.as_ref().and_then(Weak::upgrade);
        }

        effects
    }

    fn advance(&mut self, side: Side, effects: &mut Effects) -> bool {
        let mut batches = std::mem::take(&mut self.endpoint_mut(side).batches);
        let mut changed = false;

        let mut i = 0;
        while i < batches.len() {
            let batch = &mut batches[i];
            let mut j = 0;
            while j < batch.waiting.len() {
                let (slot, kind) = batch.waiting[j];
                match self.receive(side, kind) {
                    Some(result) => {
                        batch.results[slot] = Some(result);
                        batch.waiting.remove(j);
                        changed = true;
                    }
                    None => j += 1,
                }
            }

            if batch.waiting.is_empty() {
                let batch = batches.remove(i);
                let endpoint = self.endpoint_mut(side);
                for kind in [OperationType::SendMessage, OperationType::ReceiveMessage] {
                    if batch.kinds.contains(kind) {
                        endpoint.pending.remove(kind);
                    }
                }
                let results = batch.results.into_iter().flatten().collect();
                effects
                    .completions
                    .push((batch.completion, batch.success, results));
                changed = true;
            } else {
                i += 1;
            }
        }

        self.endpoint_mut(side).batches = batches;
        changed
    }
}

fn send_rank(send: &OpKind) -> u8 {
    match send {
        OpKind::SendInitialMetadata(_) => 0,
        OpKind::SendMessage(_) => 1,
        _ => 2,
    }
}

fn over_limit(message: &Bytes, limit: Option<usize>) -> Option<Status> {
    let limit = limit?;
    if message.len() <= limit {
        return None;
    }
    Some(Status::local(
        StatusCode::ResourceExhausted,
        format!(
            "Received message larger than max ({} vs. {})",
            message.len(),
            limit
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompletionQueue, CompletionType};
    use std::time::Duration;

    fn stream() -> Arc<Stream> {
        let target = "localhost:1".parse().unwrap();
        Stream::new(
            "/svc/method".to_string(),
            "host".to_string(),
            Timespec::inf_future(),
            target,
            Some(16),
        )
    }

    fn soon() -> Timespec {
        Timespec::after(Duration::from_millis(50))
    }

    #[test]
    fn test_server_batch_completes_against_client_data() {
        let cq = CompletionQueue::new();
        let s = stream();
        {
            let mut state = s.state.lock();
            state.request_metadata = Some(Metadata::new());
            state.requests.push_back(Bytes::from_static(b"ping"));
            state.half_closed = true;
            state.dispatched = true;
        }

        let tag = Tag::new();
        s.start_batch(
            Side::Server,
            vec![
                Operation::receive_message(),
                Operation::send_status_from_server(Metadata::new(), StatusCode::Ok, "done"),
                Operation::receive_close_on_server(),
            ],
            cq.inner(),
            &tag,
        )
        .unwrap();

        let event = cq.poll(soon());
        assert_eq!(event.tag(), Some(&tag));
        assert!(event.success());
        let results = event.batch_operations();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].received_message().map(|b| &b[..]), Some(&b"ping"[..]));
        assert_eq!(results[1].operation_type(), OperationType::SendStatusFromServer);
        assert_eq!(results[2].received_cancelled(), Some(false));
    }

    #[test]
    fn test_server_sends_apply_in_fixed_order() {
        let mut metadata = Metadata::new();
        metadata.insert("k", "v");
        let reply = |status_first: bool| {
            let mut ops = vec![
                Operation::send_initial_metadata(metadata.clone()),
                Operation::send_message(Bytes::from_static(b"resp")),
            ];
            let status = Operation::send_status_from_server(Metadata::new(), StatusCode::Ok, "");
            if status_first {
                ops.insert(0, status);
            } else {
                ops.push(status);
            }
            ops
        };

        for status_first in [false, true] {
            let cq = CompletionQueue::new();
            let s = stream();
            s.state.lock().dispatched = true;
            let client = Tag::new();
            s.start_batch(
                Side::Client,
                vec![
                    Operation::receive_initial_metadata(),
                    Operation::receive_message(),
                    Operation::receive_status_on_client(),
                ],
                cq.inner(),
                &client,
            )
            .unwrap();
            let server = Tag::new();
            s.start_batch(Side::Server, reply(status_first), cq.inner(), &server)
                .unwrap();

            let event = cq.pluck(&server, soon());
            assert!(event.success());
            let kinds: Vec<_> = event
                .batch_operations()
                .iter()
                .map(|r| r.operation_type())
                .collect();
            assert_eq!(kinds[0] == OperationType::SendStatusFromServer, status_first);

            let event = cq.pluck(&client, soon());
            assert!(event.success());
            let results = event.batch_operations();
            assert_eq!(results[0].received_metadata().map(|m| m.len()), Some(1));
            assert_eq!(results[1].received_message().map(|b| &b[..]), Some(&b"resp"[..]));
            assert_eq!(results[2].received_status_code(), Some(StatusCode::Ok));
        }
    }

    #[test]
    fn test_cancel_resolves_pending_receives() {
        let cq = CompletionQueue::new();
        let s = stream();
        {
            // skip transport dispatch
            s.state.lock().dispatched = true;
        }
        let tag = Tag::new();
        s.start_batch(
            Side::Client,
            vec![
                Operation::receive_initial_metadata(),
                Operation::receive_message(),
                Operation::receive_status_on_client(),
            ],
            cq.inner(),
            &tag,
        )
        .unwrap();
        assert_eq!(cq.poll(soon()).completion_type(), CompletionType::Timeout);

        assert!(s.cancel(Status::local(StatusCode::Cancelled, "Cancelled")));
        assert!(!s.cancel(Status::local(StatusCode::Internal, "again")));

        let event = cq.poll(soon());
        let results = event.batch_operations();
        assert!(results[0].received_metadata().unwrap().is_empty());
        assert!(results[1].received_message().is_none());
        assert_eq!(results[2].received_status_code(), Some(StatusCode::Cancelled));
        assert!(s.is_finished(Side::Client));
    }

    #[test]
    fn test_pending_message_kind_rejected() {
        let cq = CompletionQueue::new();
        let s = stream();
        s.start_batch(
            Side::Server,
            vec![Operation::receive_message()],
            cq.inner(),
            &Tag::new(),
        )
        .unwrap();
        let err = s
            .start_batch(
                Side::Server,
                vec![Operation::receive_message()],
                cq.inner(),
                &Tag::new(),
            )
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyInvoked);
        assert_eq!(s.pending_batches(Side::Server), 1);
    }

    #[test]
    fn test_oversized_message_cancels() {
        let cq = CompletionQueue::new();
        let s = stream();
        {
            let mut state = s.state.lock();
            state.dispatched = true;
            state.responses.push_back(Bytes::from(vec![0u8; 17]));
        }
        s.start_batch(
            Side::Client,
            vec![
                Operation::receive_message(),
                Operation::receive_status_on_client(),
            ],
            cq.inner(),
            &Tag::new(),
        )
        .unwrap();

        let event = cq.poll(soon());
        let results = event.batch_operations();
        assert!(results[0].received_message().is_none());
        assert_eq!(
            results[1].received_status_code(),
            Some(StatusCode::ResourceExhausted)
        );
    }

    #[test]
    fn test_initial_payload() {
        let s = stream();
        let (payload, _) = s.take_initial_payload();
        assert!(matches!(payload, InitialPayload::Pending));

        s.state.lock().requests.push_back(Bytes::from_static(b"first"));
        let (payload, _) = s.take_initial_payload();
        match payload {
            InitialPayload::Ready(Some(bytes)) => assert_eq!(&bytes[..], b"first"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_begin_tracking_after_finish() {
        let s = stream();
        assert!(s.begin_tracking());

        let s = stream();
        s.state.lock().status = Some(Status::local(StatusCode::Cancelled, ""));
        assert!(!s.begin_tracking());
    }
}
