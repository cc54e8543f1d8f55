//! Error types.

use std::io;

/// Synchronous rejection of a batch, call request or shutdown request.
///
/// A rejected submission changes no state and produces no completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CallError {
    /// A client-only operation was started on a server call.
    #[error("operation is only valid on the client")]
    NotOnServer,
    /// A server-only operation was started on a client call.
    #[error("operation is only valid on the server")]
    NotOnClient,
    /// The operation kind was already invoked on this call, or is still pending.
    #[error("operation already invoked")]
    AlreadyInvoked,
    /// The call has already finished.
    #[error("call already finished")]
    AlreadyFinished,
    /// The batch contains the same operation kind more than once.
    #[error("too many operations of the same kind in batch")]
    TooManyOperations,
    /// Flags are unknown or not valid for the operation.
    #[error("invalid flags")]
    InvalidFlags,
    /// Metadata contains a malformed key or value.
    #[error("invalid metadata")]
    InvalidMetadata,
    /// The message cannot be sent.
    #[error("invalid message")]
    InvalidMessage,
    /// The completion queue is not registered with the server.
    #[error("completion queue is not registered with the server")]
    NotServerCompletionQueue,
    /// The batch holds more operations than the engine accepts at once.
    #[error("batch too big")]
    BatchTooBig,
    /// The payload request does not match the registered method.
    #[error("payload type mismatch")]
    PayloadTypeMismatch,
    /// The completion queue has been shut down.
    #[error("completion queue is shut down")]
    CompletionQueueShutdown,
}

impl CallError {
    /// Stable numeric code for this error. Zero is reserved for success.
    pub fn as_i32(self) -> i32 {
        match self {
            CallError::NotOnServer => 2,
            CallError::NotOnClient => 3,
            CallError::AlreadyInvoked => 5,
            CallError::AlreadyFinished => 7,
            CallError::TooManyOperations => 8,
            CallError::InvalidFlags => 9,
            CallError::InvalidMetadata => 10,
            CallError::InvalidMessage => 11,
            CallError::NotServerCompletionQueue => 12,
            CallError::BatchTooBig => 13,
            CallError::PayloadTypeMismatch => 14,
            CallError::CompletionQueueShutdown => 15,
        }
    }
}

/// Setup and lifecycle errors for channels, servers and configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An address string could not be parsed.
    #[error("invalid address '{0}': expected host:port or [ipv6]:port")]
    InvalidAddress(String),
    /// Binding a port failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    /// The server has already been started.
    #[error("server already started")]
    AlreadyStarted,
    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The method is already registered with the server.
    #[error("method '{method}' already registered for host '{host}'")]
    MethodAlreadyRegistered { method: String, host: String },
    /// Reading a configuration file failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Parsing a configuration file failed.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}
