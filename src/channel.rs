//! Client channels.

use crate::args::ChannelArgs;
use crate::call::Call;
use crate::error::Error;
use crate::stream::{Side, Stream};
use crate::transport::Address;
use crate::{CompletionQueue, Timespec, timer};
use tracing::debug;

/// Client-side connection to a target address.
///
/// A channel is a factory for [`Call`]s and keeps no per-call state. It
/// outlives any call it creates or may be dropped before them.
#[derive(Debug, Clone)]
pub struct Channel {
    target: Address,
    args: ChannelArgs,
}

impl Channel {
    /// Create a channel to `target` (`host:port` or `[ipv6]:port`).
    ///
    /// No connection is made until a call sends its initial metadata.
    pub fn new(target: &str, args: ChannelArgs) -> Result<Self, Error> {
        let target = target.parse::<Address>()?;
        debug!(%target, args = args.len(), "channel created");
        Ok(Self { target, args })
    }

    /// Target address.
    pub fn target(&self) -> &Address {
        &self.target
    }

    /// Channel arguments.
    pub fn args(&self) -> &ChannelArgs {
        &self.args
    }

    /// Create a call bound to `queue`.
    ///
    /// An empty `host` is replaced by the channel's default authority, or by
    /// the target address when none is configured. Once `deadline` passes
    /// the call ends with `DEADLINE_EXCEEDED`.
    pub fn create_call(
        &self,
        queue: &CompletionQueue,
        method: impl Into<String>,
        host: impl Into<String>,
        deadline: impl Into<Timespec>,
    ) -> Call {
        let mut host = host.into();
        if host.is_empty() {
            host = match self.args.default_authority() {
                Some(authority) => authority.to_string(),
                None => self.target.to_string(),
            };
        }

        let stream = Stream::new(
            method.into(),
            host,
            deadline.into(),
            self.target.clone(),
            self.args.max_receive_message_length(),
        );
        timer::schedule(&stream);
        Call::new(
            stream,
            Side::Client,
            queue.inner(),
            self.args.max_send_message_length(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{ChannelArg, DEFAULT_AUTHORITY};

    #[test]
    fn test_channel_up_down() {
        let channel = Channel::new("[::]:0", ChannelArgs::empty()).unwrap();
        assert_eq!(channel.target().port(), 0);
        drop(channel);
    }

    #[test]
    fn test_invalid_target() {
        assert!(matches!(
            Channel::new("no-port", ChannelArgs::empty()),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_default_authority() {
        let cq = CompletionQueue::new();
        let channel = Channel::new("localhost:1", ChannelArgs::empty()).unwrap();
        let call = channel.create_call(&cq, "m", "", Timespec::inf_future());
        assert_eq!(call.host(), "localhost:1");

        let args = ChannelArgs::new(vec![ChannelArg::string(DEFAULT_AUTHORITY, "override")]);
        let channel = Channel::new("localhost:1", args).unwrap();
        let call = channel.create_call(&cq, "m", "", Timespec::inf_future());
        assert_eq!(call.host(), "override");
        let call = channel.create_call(&cq, "m", "explicit", Timespec::inf_future());
        assert_eq!(call.host(), "explicit");
    }
}
