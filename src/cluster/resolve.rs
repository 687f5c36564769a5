//! Contact point resolution.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use itertools::Itertools;
use tokio::net::lookup_host;

/// Default port tried when a contact point hostname carries none.
const DEFAULT_PORT: u16 = 9042;

/// A cluster node known on session startup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, resolved on connect.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

impl From<SocketAddr> for KnownNode {
    fn from(address: SocketAddr) -> Self {
        KnownNode::Address(address)
    }
}

/// Resolves a contact point hostname to a single address, preferring
/// IPv4 over IPv6 results.
pub(crate) async fn resolve_hostname(
    hostname: &str,
    timeout: Option<Duration>,
) -> io::Result<SocketAddr> {
    let lookup = async {
        // `lookup_host` wants "hostname:port" and rejects a bare
        // hostname before any DNS traffic, so retrying with the default
        // port appended is cheap.
        match lookup_host(hostname).await {
            Ok(addrs) => Ok(addrs.collect::<Vec<_>>()),
            Err(error) => match lookup_host((hostname, DEFAULT_PORT)).await {
                Ok(addrs) => Ok(addrs.collect()),
                Err(_) => Err(error),
            },
        }
    };
    let addrs = match timeout {
        Some(bound) => tokio::time::timeout(bound, lookup).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("DNS lookup of {hostname} timed out after {bound:?}"),
            )
        })??,
        None => lookup.await?,
    };

    addrs
        .into_iter()
        .find_or_last(|address| address.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("DNS returned no addresses for {hostname}"),
            )
        })
}
