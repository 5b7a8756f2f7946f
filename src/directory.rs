//! Name resolution for the control plane.
//!
//! Maps a peer hostname to the socket address of its Nexus; thread-level
//! demultiplexing happens inside the receiving Nexus, keyed on the app
//! thread id carried in each envelope.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// This machine's hostname, falling back to loopback naming if the OS
/// will not say.
pub fn get_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Resolve `hostname` to the peer Nexus's UDP address.
pub fn lookup(hostname: &str, udp_port: u16) -> Result<SocketAddr> {
    let mut addrs = (hostname, udp_port)
        .to_socket_addrs()
        .map_err(|_| Error::RoutingResolutionFailure)?;
    addrs
        .find(|a| a.is_ipv4())
        .ok_or(Error::RoutingResolutionFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_localhost() {
        let addr = lookup("localhost", 31850).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 31850);
    }

    #[test]
    fn test_lookup_bogus_host_fails() {
        assert!(lookup("no-such-host.invalid", 1).is_err());
    }

    #[test]
    fn test_get_hostname_nonempty() {
        assert!(!get_hostname().is_empty());
    }
}
