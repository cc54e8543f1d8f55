//! In-process transport.
//!
//! Servers reserve real OS ports when they bind, so ephemeral ports and port
//! conflicts behave as they would on the network, but call traffic never
//! touches a socket. A started server publishes itself in a process-wide
//! registry keyed by port and bound host. A client call connects to the entry
//! on its target port whose host serves the target host: a wildcard binding
//! serves every host, and any loopback name reaches a loopback binding.

use crate::StatusCode;
use crate::error::Error;
use crate::status::Status;
use crate::stream::Stream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, TcpListener};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Receiver of client calls for a bound port.
pub(crate) trait Acceptor: Send + Sync {
    fn accept(&self, stream: Arc<Stream>);
}

struct Endpoint {
    host: String,
    acceptor: Weak<dyn Acceptor>,
}

static ENDPOINTS: Mutex<BTreeMap<u16, Vec<Endpoint>>> = Mutex::new(BTreeMap::new());

/// A `host:port` or `[ipv6]:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Host part, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number. Zero requests an ephemeral port when binding.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The same host on another port.
    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    fn is_wildcard(&self) -> bool {
        is_wildcard(&self.host)
    }
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "::" | "0.0.0.0")
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Whether a server bound to `bound` receives calls aimed at `target`.
fn serves(bound: &str, target: &str) -> bool {
    is_wildcard(bound)
        || bound.eq_ignore_ascii_case(target)
        || (is_loopback(bound) && is_loopback(target))
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidAddress(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Reserve an OS port for `address`.
///
/// The IPv6 wildcard falls back to the IPv4 wildcard when IPv6 is not
/// available on the host.
pub(crate) fn bind(address: &Address) -> Result<TcpListener, Error> {
    let result = TcpListener::bind((address.host.as_str(), address.port));
    let result = match result {
        Err(e) if address.host == "::" && ipv6_unavailable(&e) => {
            debug!(%address, error = %e, "IPv6 unavailable, binding IPv4 wildcard");
            TcpListener::bind(("0.0.0.0", address.port))
        }
        other => other,
    };
    let listener = result.map_err(|source| Error::Bind {
        address: address.to_string(),
        source,
    })?;
    if address.is_wildcard() {
        debug!(%address, "bound wildcard address");
    }
    Ok(listener)
}

fn ipv6_unavailable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported | io::ErrorKind::InvalidInput
    ) || e.raw_os_error() == Some(97)
}

/// Publish `acceptor` for the bound `address`.
///
/// A live entry for the same host and port is replaced; dead ones are
/// dropped along the way.
pub(crate) fn register(address: &Address, acceptor: Weak<dyn Acceptor>) {
    let mut endpoints = ENDPOINTS.lock();
    let entries = endpoints.entry(address.port).or_default();
    entries.retain(|e| e.acceptor.strong_count() > 0 && e.host != address.host);
    entries.push(Endpoint {
        host: address.host.clone(),
        acceptor,
    });
}

/// Withdraw `address` if it still belongs to `acceptor`.
pub(crate) fn unregister(address: &Address, acceptor: &Weak<dyn Acceptor>) {
    let mut endpoints = ENDPOINTS.lock();
    if let Some(entries) = endpoints.get_mut(&address.port) {
        entries.retain(|e| !(e.host == address.host && e.acceptor.ptr_eq(acceptor)));
        if entries.is_empty() {
            endpoints.remove(&address.port);
        }
    }
}

fn lookup(target: &Address) -> Option<Arc<dyn Acceptor>> {
    let endpoints = ENDPOINTS.lock();
    let entries = endpoints.get(&target.port)?;
    entries
        .iter()
        .filter(|e| serves(&e.host, &target.host))
        .find_map(|e| e.acceptor.upgrade())
}

/// Hand a client call to the server bound to its target address.
pub(crate) fn connect(stream: Arc<Stream>) {
    let target = stream.target();
    let port = target.port();
    match lookup(target) {
        Some(acceptor) => {
            debug!(stream = stream.id(), port, method = stream.method(), "connected");
            acceptor.accept(stream);
        }
        None => {
            debug!(stream = stream.id(), %target, "no server listening");
            stream.cancel(Status::local(
                StatusCode::Unavailable,
                "failed to connect to all addresses",
            ));
        }
    }
}
