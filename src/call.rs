//! RPC calls.

use crate::error::CallError;
use crate::op::{MAX_BATCH_SIZE, OpKind, OpSet, Operation, Operations};
use crate::queue::QueueInner;
use crate::status::Status;
use crate::stream::{Side, Stream};
use crate::{StatusCode, Tag, Timespec};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Method, host and deadline of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDetails {
    method: String,
    host: String,
    deadline: Timespec,
}

impl CallDetails {
    pub(crate) fn of(stream: &Stream) -> Self {
        Self {
            method: stream.method().to_string(),
            host: stream.host().to_string(),
            deadline: stream.deadline(),
        }
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Host (authority) the call was addressed to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Call deadline.
    pub fn deadline(&self) -> Timespec {
        self.deadline
    }
}

/// One RPC exchange, seen from the client or from the server.
///
/// A call accepts batches of [`Operation`]s with
/// [`start_batch`](Self::start_batch). Each admitted batch produces exactly
/// one event on the call's completion queue once all of its operations have
/// finished. Rejected batches return a [`CallError`] and change nothing.
///
/// Dropping a call that has not finished cancels it. Batches still in flight
/// then complete with whatever the cancellation leaves them.
pub struct Call {
    stream: Arc<Stream>,
    side: Side,
    queue: Weak<QueueInner>,
    send_limit: Option<usize>,
}

impl Call {
    pub(crate) fn new(
        stream: Arc<Stream>,
        side: Side,
        queue: &Arc<QueueInner>,
        send_limit: Option<usize>,
    ) -> Self {
        Self {
            stream,
            side,
            queue: Arc::downgrade(queue),
            send_limit,
        }
    }

    /// Submit a batch of operations.
    ///
    /// The batch is admitted as a whole or not at all. On success exactly
    /// one [`Event`](crate::Event) carrying `tag` will appear on the call's
    /// completion queue.
    pub fn start_batch(
        &self,
        operations: impl Into<Operations>,
        tag: Tag,
    ) -> Result<(), CallError> {
        let ops: Vec<Operation> = operations.into().into_iter().collect();
        if ops.len() > MAX_BATCH_SIZE {
            return Err(CallError::BatchTooBig);
        }

        let mut seen = OpSet::default();
        for op in &ops {
            if !seen.insert(op.operation_type()) {
                return Err(CallError::TooManyOperations);
            }
        }
        for op in &ops {
            self.check(op)?;
        }

        let queue = self
            .queue
            .upgrade()
            .ok_or(CallError::CompletionQueueShutdown)?;
        if ops.is_empty() {
            queue.begin(&tag)?.complete(true, Vec::new());
            return Ok(());
        }
        self.stream.start_batch(self.side, ops, &queue, &tag)
    }

    fn check(&self, op: &Operation) -> Result<(), CallError> {
        let kind = op.operation_type();
        match self.side {
            Side::Server if kind.client_only() => return Err(CallError::NotOnServer),
            Side::Client if kind.server_only() => return Err(CallError::NotOnClient),
            _ => {}
        }
        if !op.flags_valid() {
            return Err(CallError::InvalidFlags);
        }
        match &op.kind {
            OpKind::SendInitialMetadata(metadata) if !metadata.is_valid() => {
                Err(CallError::InvalidMetadata)
            }
            OpKind::SendStatusFromServer(status) if !status.trailing_metadata.is_valid() => {
                Err(CallError::InvalidMetadata)
            }
            OpKind::SendMessage(message)
                if self.send_limit.is_some_and(|limit| message.len() > limit) =>
            {
                Err(CallError::InvalidMessage)
            }
            _ => Ok(()),
        }
    }

    /// Cancel the call with status `CANCELLED`.
    pub fn cancel(&self) -> Result<(), CallError> {
        self.cancel_with_status(StatusCode::Cancelled, "Cancelled")
    }

    /// Cancel the call with a specific status.
    ///
    /// Pending receives on both ends resolve; the client observes `code` and
    /// `details` as the call's status and the server observes
    /// `cancelled = true`. A call that already has a status keeps it and
    /// this returns [`CallError::AlreadyFinished`].
    pub fn cancel_with_status(
        &self,
        code: StatusCode,
        details: impl Into<String>,
    ) -> Result<(), CallError> {
        if self.stream.cancel(Status::local(code, details)) {
            Ok(())
        } else {
            Err(CallError::AlreadyFinished)
        }
    }

    /// Address of the other end of the call.
    pub fn peer(&self) -> String {
        match self.side {
            Side::Client => self.stream.target().to_string(),
            Side::Server => format!("inproc:{}", self.stream.id()),
        }
    }

    /// Method name.
    pub fn method(&self) -> &str {
        self.stream.method()
    }

    /// Host the call was addressed to.
    pub fn host(&self) -> &str {
        self.stream.host()
    }

    /// Call deadline.
    pub fn deadline(&self) -> Timespec {
        self.stream.deadline()
    }

    /// Method, host and deadline.
    pub fn details(&self) -> CallDetails {
        CallDetails::of(&self.stream)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.stream.id())
            .field("side", &self.side)
            .field("method", &self.stream.method())
            .finish_non_exhaustive()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.stream.is_finished(self.side) {
            return;
        }
        let pending = self.stream.pending_batches(self.side);
        if pending > 0 {
            warn!(
                call = self.stream.id(),
                side = ?self.side,
                pending,
                "call dropped with batches in flight"
            );
        }
        self.stream
            .cancel(Status::local(StatusCode::Cancelled, "Call dropped"));
    }
}
