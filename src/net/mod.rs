//! Task-friendly sockets: a blocking-style API over non-blocking
//! descriptors, suspending the calling task on would-block instead of the
//! OS thread.

mod server;
mod socket;

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

pub use server::NetServer;
pub use socket::NetSock;

pub(crate) fn socket_family(addr: &SocketAddr) -> nix::sys::socket::AddressFamily {
    match addr {
        SocketAddr::V4(_) => nix::sys::socket::AddressFamily::Inet,
        SocketAddr::V6(_) => nix::sys::socket::AddressFamily::Inet6,
    }
}

/// Resolve `host:port` to socket addresses with the system resolver.
///
/// Resolution is synchronous and blocks the calling OS thread, not just the
/// task; run dialers on a dedicated task with
/// [`DIAL_STACK_SIZE`](crate::task::DIAL_STACK_SIZE).
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Hostname {
            host: host.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Hostname {
            host: host.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ),
        });
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_literal_address() {
        let addrs = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn bad_hostname_is_a_hostname_error() {
        let err = resolve("definitely-not-a-real-host.invalid.", 80).unwrap_err();
        assert!(matches!(err, Error::Hostname { .. }));
    }
}
