//! Channel and server arguments.
//!
//! [`ChannelArgs`] is the immutable configuration bag handed to a
//! [`Channel`](crate::Channel) or [`Server`](crate::Server). It is cheap to
//! clone and safe to share read-only between owners. Args can be built in
//! code or deserialized from a TOML table:
//!
//! ```toml
//! "grpc.max_receive_message_length" = 1048576
//! "grpc.default_authority" = "example.com"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maximum size of a message this endpoint will send. Negative means unlimited.
pub const MAX_SEND_MESSAGE_LENGTH: &str = "grpc.max_send_message_length";

/// Maximum size of a message this endpoint will accept. Negative means unlimited.
pub const MAX_RECEIVE_MESSAGE_LENGTH: &str = "grpc.max_receive_message_length";

/// Host used by `create_call` when the caller passes an empty host.
pub const DEFAULT_AUTHORITY: &str = "grpc.default_authority";

/// Default receive limit (4MB).
pub const DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Value of a single channel argument.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Integer argument.
    Integer(i64),
    /// String argument.
    String(String),
}

/// A single key/value argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelArg {
    key: String,
    value: ArgValue,
}

impl ChannelArg {
    /// Create an integer argument.
    pub fn integer(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: ArgValue::Integer(value),
        }
    }

    /// Create a string argument.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: ArgValue::String(value.into()),
        }
    }
}

/// Immutable mapping from argument keys to values.
///
/// When the same key is supplied more than once the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, ArgValue>")]
pub struct ChannelArgs {
    args: Arc<BTreeMap<String, ArgValue>>,
}

impl ChannelArgs {
    /// Build args from a list of arguments.
    pub fn new(args: impl IntoIterator<Item = ChannelArg>) -> Self {
        let map = args
            .into_iter()
            .map(|arg| (arg.key, arg.value))
            .collect::<BTreeMap<_, _>>();
        Self { args: Arc::new(map) }
    }

    /// Empty args.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up an argument.
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.args.get(key)
    }

    /// Look up an integer argument.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.args.get(key)? {
            ArgValue::Integer(value) => Some(*value),
            ArgValue::String(_) => None,
        }
    }

    /// Look up a string argument.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.args.get(key)? {
            ArgValue::String(value) => Some(value),
            ArgValue::Integer(_) => None,
        }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Check if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Iterate over arguments in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Send limit, `None` when unlimited.
    pub fn max_send_message_length(&self) -> Option<usize> {
        limit(self.get_int(MAX_SEND_MESSAGE_LENGTH), None)
    }

    /// Receive limit, `None` when unlimited.
    pub fn max_receive_message_length(&self) -> Option<usize> {
        limit(
            self.get_int(MAX_RECEIVE_MESSAGE_LENGTH),
            Some(DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH),
        )
    }

    /// Default authority, if configured.
    pub fn default_authority(&self) -> Option<&str> {
        self.get_str(DEFAULT_AUTHORITY)
    }
}

fn limit(value: Option<i64>, default: Option<usize>) -> Option<usize> {
    match value {
        None => default,
        Some(v) if v < 0 => None,
        Some(v) => Some(usize::try_from(v).unwrap_or(usize::MAX)),
    }
}

impl From<BTreeMap<String, ArgValue>> for ChannelArgs {
    fn from(map: BTreeMap<String, ArgValue>) -> Self {
        Self { args: Arc::new(map) }
    }
}

impl FromIterator<ChannelArg> for ChannelArgs {
    fn from_iter<T: IntoIterator<Item = ChannelArg>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_defaults() {
        let args = ChannelArgs::new(vec![]);
        assert!(args.is_empty());
        assert_eq!(args.max_send_message_length(), None);
        assert_eq!(
            args.max_receive_message_length(),
            Some(DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH)
        );
        assert!(args.default_authority().is_none());
    }

    #[test]
    fn test_typed_lookup() {
        let args = ChannelArgs::new(vec![
            ChannelArg::integer(MAX_SEND_MESSAGE_LENGTH, 128),
            ChannelArg::string(DEFAULT_AUTHORITY, "example.com"),
        ]);
        assert_eq!(args.len(), 2);
        assert_eq!(args.get_int(MAX_SEND_MESSAGE_LENGTH), Some(128));
        assert_eq!(args.get_str(MAX_SEND_MESSAGE_LENGTH), None);
        assert_eq!(args.get_str(DEFAULT_AUTHORITY), Some("example.com"));
        assert_eq!(args.max_send_message_length(), Some(128));
        assert_eq!(args.default_authority(), Some("example.com"));
    }

    #[test]
    fn test_negative_means_unlimited() {
        let args = ChannelArgs::new(vec![ChannelArg::integer(MAX_RECEIVE_MESSAGE_LENGTH, -1)]);
        assert_eq!(args.max_receive_message_length(), None);
    }

    #[test]
    fn test_last_value_wins() {
        let args = ChannelArgs::new(vec![
            ChannelArg::integer("a", 1),
            ChannelArg::integer("a", 2),
        ]);
        assert_eq!(args.get_int("a"), Some(2));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_shared_clone() {
        let args = ChannelArgs::new(vec![ChannelArg::integer("a", 1)]);
        let shared = args.clone();
        assert_eq!(args, shared);
        assert!(Arc::ptr_eq(&args.args, &shared.args));
    }

    #[test]
    fn test_deserialize_toml() {
        let args: ChannelArgs = toml::from_str(
            r#"
            "grpc.max_receive_message_length" = 1024
            "grpc.default_authority" = "hostess"
            "#,
        )
        .unwrap();
        assert_eq!(args.max_receive_message_length(), Some(1024));
        assert_eq!(args.default_authority(), Some("hostess"));
        assert_eq!(args.iter().count(), 2);
    }
}
