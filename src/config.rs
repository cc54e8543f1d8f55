//! Configuration for the `rpc-echo` binary.
//!
//! Loaded from a TOML file. Every section is optional:
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "compact"
//!
//! [server]
//! address = "[::]:0"
//! pollers = 2
//!
//! [server.args]
//! "grpc.max_receive_message_length" = 1048576
//!
//! [client]
//! requests = 1000
//! concurrency = 8
//! payload_size = "1KB"
//! deadline_ms = 5000
//! ```

use crate::args::ChannelArgs;
use crate::error::Error;
use crate::transport::Address;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Echo server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Echo client configuration.
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        self.server
            .address
            .parse::<Address>()
            .map_err(|e| Error::Config(format!("server.address: {}", e)))?;
        if let Some(target) = &self.client.target {
            target
                .parse::<Address>()
                .map_err(|e| Error::Config(format!("client.target: {}", e)))?;
        }

        if self.server.pollers == 0 {
            return Err(Error::Config("server.pollers must be at least 1".to_string()));
        }
        if self.client.requests == 0 {
            return Err(Error::Config("client.requests must be at least 1".to_string()));
        }
        if self.client.concurrency == 0 {
            return Err(Error::Config(
                "client.concurrency must be at least 1".to_string(),
            ));
        }
        if self.client.deadline_ms == 0 {
            return Err(Error::Config("client.deadline_ms must be positive".to_string()));
        }

        if let Some(limit) = self.client.args.max_send_message_length() {
            if self.client.payload_size > limit {
                return Err(Error::Config(format!(
                    "client.payload_size ({}) exceeds the client send limit ({})",
                    self.client.payload_size, limit
                )));
            }
        }
        if let Some(limit) = self.server.args.max_receive_message_length() {
            if self.client.payload_size > limit {
                return Err(Error::Config(format!(
                    "client.payload_size ({}) exceeds the server receive limit ({})",
                    self.client.payload_size, limit
                )));
            }
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
    /// Single-line, human-readable output.
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "rpc_core=debug".
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target.
    #[serde(default)]
    pub target: bool,

    /// Include thread names.
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: false,
        }
    }
}

/// Echo server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_address")]
    pub address: String,

    /// Threads polling the server completion queue.
    #[serde(default = "default_pollers")]
    pub pollers: usize,

    /// Server channel arguments.
    #[serde(default)]
    pub args: ChannelArgs,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            pollers: default_pollers(),
            args: ChannelArgs::default(),
        }
    }
}

/// Echo client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Target address. Defaults to the bound server port on localhost.
    #[serde(default)]
    pub target: Option<String>,

    /// Method name sent on each call.
    #[serde(default = "default_method")]
    pub method: String,

    /// Total number of calls.
    #[serde(default = "default_requests")]
    pub requests: usize,

    /// Calls in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Request payload size (e.g. "64B", "1KB").
    #[serde(default = "default_payload_size", deserialize_with = "deserialize_size")]
    pub payload_size: usize,

    /// Per-call deadline in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Client channel arguments.
    #[serde(default)]
    pub args: ChannelArgs,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: None,
            method: default_method(),
            requests: default_requests(),
            concurrency: default_concurrency(),
            payload_size: default_payload_size(),
            deadline_ms: default_deadline_ms(),
            args: ChannelArgs::default(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_address() -> String {
    "[::]:0".to_string()
}

fn default_pollers() -> usize {
    1
}

fn default_method() -> String {
    "/echo.Echo/Unary".to_string()
}

fn default_requests() -> usize {
    100
}

fn default_concurrency() -> usize {
    4
}

fn default_payload_size() -> usize {
    64
}

fn default_deadline_ms() -> u64 {
    5000
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64B", "4KB" or "1MB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64B").unwrap(), 64);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("4MB").unwrap(), 4 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("3GB").is_err());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.server.address, "[::]:0");
        assert_eq!(config.client.requests, 100);
        assert!(config.client.target.is_none());
        assert!(config.server.args.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            level = "debug"
            format = "json"
            timestamps = false

            [server]
            address = "127.0.0.1:0"
            pollers = 2

            [server.args]
            "grpc.max_receive_message_length" = 2048

            [client]
            requests = 10
            concurrency = 2
            payload_size = "1KB"
            deadline_ms = 250
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
        assert_eq!(config.server.pollers, 2);
        assert_eq!(config.server.args.max_receive_message_length(), Some(2048));
        assert_eq!(config.client.payload_size, 1024);
        assert_eq!(config.client.deadline_ms, 250);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Config>("[server]\nbogus = 1\n").is_err());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.client.concurrency = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.server.address = "nowhere".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config: Config = toml::from_str(
            r#"
            [server.args]
            "grpc.max_receive_message_length" = 16

            [client]
            payload_size = 64
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nrequests = 7").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.client.requests, 7);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[client\nrequests = ").unwrap();
        assert!(matches!(Config::load(bad.path()), Err(Error::Parse(_))));

        assert!(matches!(
            Config::load(Path::new("/nonexistent/rpc-echo.toml")),
            Err(Error::Io(_))
        ));
    }
}
