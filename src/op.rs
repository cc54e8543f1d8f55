//! Operations and their results.
//!
//! An [`Operation`] describes one I/O intent against a call. It is built by
//! one of the constructor functions and consumed by
//! [`Call::start_batch`](crate::Call::start_batch); its inputs cannot be read
//! back. What an operation produced is only reachable through the
//! [`OperationResult`]s carried by the batch's completion [`Event`].
//!
//! [`Event`]: crate::Event

use crate::status::Status;
use crate::{Metadata, StatusCode};
use bytes::Bytes;
use std::fmt;

/// Maximum number of operations in one batch.
pub const MAX_BATCH_SIZE: usize = 8;

/// Kind of an operation, reported on each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    SendInitialMetadata = 0,
    SendMessage = 1,
    SendCloseFromClient = 2,
    SendStatusFromServer = 3,
    ReceiveInitialMetadata = 4,
    ReceiveMessage = 5,
    ReceiveStatusOnClient = 6,
    ReceiveCloseOnServer = 7,
}

impl OperationType {
    /// Get the numeric value of this kind.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Only valid on a client call.
    pub(crate) fn client_only(self) -> bool {
        matches!(
            self,
            OperationType::SendCloseFromClient
                | OperationType::ReceiveInitialMetadata
                | OperationType::ReceiveStatusOnClient
        )
    }

    /// Only valid on a server call.
    pub(crate) fn server_only(self) -> bool {
        matches!(
            self,
            OperationType::SendStatusFromServer | OperationType::ReceiveCloseOnServer
        )
    }

    /// May be invoked again once the previous one completes.
    pub(crate) fn repeatable(self) -> bool {
        matches!(
            self,
            OperationType::SendMessage | OperationType::ReceiveMessage
        )
    }
}

/// Set of operation kinds, one bit per [`OperationType`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OpSet(u8);

impl OpSet {
    pub(crate) fn contains(self, kind: OperationType) -> bool {
        self.0 & (1 << kind.as_u8()) != 0
    }

    pub(crate) fn insert(&mut self, kind: OperationType) -> bool {
        let had = self.contains(kind);
        self.0 |= 1 << kind.as_u8();
        !had
    }

    pub(crate) fn remove(&mut self, kind: OperationType) {
        self.0 &= !(1 << kind.as_u8());
    }
}

bitflags::bitflags! {
    /// Per-operation write flags. Only valid on send-message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        /// The write may be buffered and coalesced with later writes.
        const BUFFER_HINT = 1 << 0;
        /// Do not compress this message.
        const NO_COMPRESS = 1 << 1;
    }
}

pub(crate) enum OpKind {
    SendInitialMetadata(Metadata),
    SendMessage(Bytes),
    SendCloseFromClient,
    SendStatusFromServer(Status),
    ReceiveInitialMetadata,
    ReceiveMessage,
    ReceiveStatusOnClient,
    ReceiveCloseOnServer,
}

/// A single write-only I/O intent.
pub struct Operation {
    pub(crate) kind: OpKind,
    pub(crate) flags: WriteFlags,
}

impl Operation {
    fn new(kind: OpKind) -> Self {
        Self {
            kind,
            flags: WriteFlags::empty(),
        }
    }

    /// Send the initial metadata for this side of the call.
    pub fn send_initial_metadata(metadata: Metadata) -> Self {
        Self::new(OpKind::SendInitialMetadata(metadata))
    }

    /// Send one message.
    pub fn send_message(message: impl Into<Bytes>) -> Self {
        Self::new(OpKind::SendMessage(message.into()))
    }

    /// Half-close the client side of the call.
    pub fn send_close_from_client() -> Self {
        Self::new(OpKind::SendCloseFromClient)
    }

    /// Send the terminal status from the server.
    pub fn send_status_from_server(
        trailing_metadata: Metadata,
        code: StatusCode,
        details: impl Into<String>,
    ) -> Self {
        Self::new(OpKind::SendStatusFromServer(Status::new(
            code,
            details,
            trailing_metadata,
        )))
    }

    /// Receive the server's initial metadata.
    pub fn receive_initial_metadata() -> Self {
        Self::new(OpKind::ReceiveInitialMetadata)
    }

    /// Receive one message, or nothing if the peer has finished sending.
    pub fn receive_message() -> Self {
        Self::new(OpKind::ReceiveMessage)
    }

    /// Receive the call's terminal status on the client.
    pub fn receive_status_on_client() -> Self {
        Self::new(OpKind::ReceiveStatusOnClient)
    }

    /// Wait for the call to close on the server, reporting cancellation.
    pub fn receive_close_on_server() -> Self {
        Self::new(OpKind::ReceiveCloseOnServer)
    }

    /// Attach write flags.
    pub fn with_flags(mut self, flags: WriteFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn operation_type(&self) -> OperationType {
        match self.kind {
            OpKind::SendInitialMetadata(_) => OperationType::SendInitialMetadata,
            OpKind::SendMessage(_) => OperationType::SendMessage,
            OpKind::SendCloseFromClient => OperationType::SendCloseFromClient,
            OpKind::SendStatusFromServer(_) => OperationType::SendStatusFromServer,
            OpKind::ReceiveInitialMetadata => OperationType::ReceiveInitialMetadata,
            OpKind::ReceiveMessage => OperationType::ReceiveMessage,
            OpKind::ReceiveStatusOnClient => OperationType::ReceiveStatusOnClient,
            OpKind::ReceiveCloseOnServer => OperationType::ReceiveCloseOnServer,
        }
    }

    /// Flags are known bits and only set where they apply.
    pub(crate) fn flags_valid(&self) -> bool {
        if self.flags.is_empty() {
            return true;
        }
        matches!(self.kind, OpKind::SendMessage(_)) && WriteFlags::all().contains(self.flags)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("type", &self.operation_type())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// An ordered batch of operations.
#[derive(Debug, Default)]
pub struct Operations {
    ops: Vec<Operation>,
}

impl Operations {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl From<Vec<Operation>> for Operations {
    fn from(ops: Vec<Operation>) -> Self {
        Self { ops }
    }
}

impl From<Operation> for Operations {
    fn from(op: Operation) -> Self {
        Self { ops: vec![op] }
    }
}

impl<const N: usize> From<[Operation; N]> for Operations {
    fn from(ops: [Operation; N]) -> Self {
        Self { ops: ops.into() }
    }
}

impl FromIterator<Operation> for Operations {
    fn from_iter<T: IntoIterator<Item = Operation>>(iter: T) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Operations {
    type Item = Operation;
    type IntoIter = std::vec::IntoIter<Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Outcome of one operation in a completed batch.
#[derive(Debug, Clone)]
pub struct OperationResult {
    kind: OperationType,
    metadata: Option<Metadata>,
    message: Option<Bytes>,
    status: Option<(StatusCode, String)>,
    cancelled: Option<bool>,
}

impl OperationResult {
    pub(crate) fn sent(kind: OperationType) -> Self {
        Self {
            kind,
            metadata: None,
            message: None,
            status: None,
            cancelled: None,
        }
    }

    pub(crate) fn initial_metadata(metadata: Metadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::sent(OperationType::ReceiveInitialMetadata)
        }
    }

    pub(crate) fn message(message: Option<Bytes>) -> Self {
        Self {
            message,
            ..Self::sent(OperationType::ReceiveMessage)
        }
    }

    pub(crate) fn status(status: Status) -> Self {
        Self {
            metadata: Some(status.trailing_metadata),
            status: Some((status.code, status.details)),
            ..Self::sent(OperationType::ReceiveStatusOnClient)
        }
    }

    pub(crate) fn close(cancelled: bool) -> Self {
        Self {
            cancelled: Some(cancelled),
            ..Self::sent(OperationType::ReceiveCloseOnServer)
        }
    }

    /// Kind of the operation this result belongs to.
    pub fn operation_type(&self) -> OperationType {
        self.kind
    }

    /// Initial metadata for receive-initial-metadata, trailing metadata for
    /// receive-status-on-client.
    pub fn received_metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Message bytes for receive-message. `None` once the peer has finished
    /// sending or the call has ended.
    pub fn received_message(&self) -> Option<&Bytes> {
        self.message.as_ref()
    }

    /// Status code for receive-status-on-client.
    pub fn received_status_code(&self) -> Option<StatusCode> {
        self.status.as_ref().map(|(code, _)| *code)
    }

    /// Status details for receive-status-on-client.
    pub fn received_status_details(&self) -> Option<&str> {
        self.status.as_ref().map(|(_, details)| details.as_str())
    }

    /// Cancellation flag for receive-close-on-server.
    pub fn received_cancelled(&self) -> Option<bool> {
        self.cancelled
    }
}
