//! rpc-core - a completion-queue driven RPC call engine.
//!
//! Calls are driven by submitting batches of operations and collecting the
//! results as events on a [`CompletionQueue`]. Nothing here is async: the
//! application owns its threads and blocks in [`CompletionQueue::poll`],
//! [`CompletionQueue::next`] or [`CompletionQueue::pluck`].
//!
//! # Architecture
//!
//! - A [`Channel`] creates client [`Call`]s toward a target address.
//! - A [`Server`] binds ports, accepts calls and hands them out through
//!   one-shot requests ([`Server::request_call`]).
//! - Both ends of a call share one in-process stream. Batches started with
//!   [`Call::start_batch`] complete once every operation in them has been
//!   satisfied by the peer, or the call terminates.
//! - Every accepted submission yields exactly one event carrying its
//!   [`Tag`].
//!
//! # Example
//!
//! ```ignore
//! use rpc_core::*;
//!
//! let cq = CompletionQueue::new();
//! let server = Server::new(ChannelArgs::empty());
//! server.register_completion_queue(&cq)?;
//! let port = server.add_port("[::]:0")?;
//! server.start()?;
//!
//! let channel = Channel::new(&format!("localhost:{port}"), ChannelArgs::empty())?;
//! let call = channel.create_call(&cq, "/svc/Method", "", Timespec::after(timeout));
//! call.start_batch(
//!     [
//!         Operation::send_initial_metadata(Metadata::new()),
//!         Operation::send_close_from_client(),
//!     ],
//!     Tag::new(),
//! )?;
//! ```

mod args;
mod call;
mod channel;
mod error;
mod metadata;
mod op;
mod queue;
mod server;
mod status;
mod stream;
mod tag;
mod timer;
mod timespec;
mod transport;

pub mod config;
pub mod logging;

pub use args::{
    ArgValue, ChannelArg, ChannelArgs, DEFAULT_AUTHORITY, DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH,
    MAX_RECEIVE_MESSAGE_LENGTH, MAX_SEND_MESSAGE_LENGTH,
};
pub use call::{Call, CallDetails};
pub use channel::Channel;
pub use error::{CallError, Error};
pub use metadata::{Metadata, Metadatum};
pub use op::{MAX_BATCH_SIZE, Operation, OperationResult, OperationType, Operations, WriteFlags};
pub use queue::{CompletionQueue, CompletionType, Event};
pub use server::{PayloadHandling, RegisteredMethod, Server};
pub use status::StatusCode;
pub use tag::Tag;
pub use timespec::Timespec;
pub use transport::Address;
