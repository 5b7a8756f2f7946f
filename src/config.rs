//! Configuration types for the RPC runtime.

use std::cell::Cell;

/// Highest fabric port index accepted by `create_session`.
pub const MAX_PHY_PORTS: u8 = 8;

/// Per-runtime configuration.
///
/// Controls session flow control, fragmentation limits and the
/// retransmission schedule.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Fabric device port this runtime binds to.
    /// Default: 0
    pub phy_port: u8,
    /// NUMA node allocations should come from.
    /// Default: 0
    pub numa_node: usize,
    /// Credits per session: the number of concurrently outstanding requests.
    /// Default: 8
    pub session_credits: usize,
    /// Budget of concurrent multi-packet request reassemblies from peers.
    /// Default: 32
    pub unexp_pkt_window: usize,
    /// Largest message payload accepted by `alloc_msg_buffer`.
    /// Default: 32768
    pub max_msg_size: usize,
    /// Transport MTU in bytes (header plus payload per packet).
    /// Default: 1024
    pub mtu: usize,
    /// Maximum number of sessions this runtime can hold.
    /// Default: 256
    pub max_sessions: usize,
    /// Datapath retransmission timeout in microseconds.
    /// Default: 5000 (5 ms)
    pub rto_us: u64,
    /// Datapath retransmission attempts before the session errors out.
    /// Default: 10
    pub max_retries: u32,
    /// Initial session-management retransmission interval in microseconds;
    /// doubles per attempt.
    /// Default: 2000
    pub sm_base_rto_us: u64,
    /// Ceiling for the session-management backoff.
    /// Default: 500000 (500 ms)
    pub sm_rto_cap_us: u64,
    /// Session-management attempts before the session errors out.
    /// Default: 20
    pub sm_max_attempts: u32,
    /// A stalled multi-packet reassembly is discarded after this long
    /// without progress, in microseconds.
    /// Default: 50000 (50 ms)
    pub reasm_timeout_us: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            phy_port: 0,
            numa_node: 0,
            session_credits: 8,
            unexp_pkt_window: 32,
            max_msg_size: 32768,
            mtu: 1024,
            max_sessions: 256,
            rto_us: 5000,
            max_retries: 10,
            sm_base_rto_us: 2000,
            sm_rto_cap_us: 500_000,
            sm_max_attempts: 20,
            reasm_timeout_us: 50_000,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phy_port(mut self, phy_port: u8) -> Self {
        self.phy_port = phy_port;
        self
    }

    pub fn with_numa_node(mut self, numa_node: usize) -> Self {
        self.numa_node = numa_node;
        self
    }

    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    pub fn with_unexp_pkt_window(mut self, unexp_pkt_window: usize) -> Self {
        self.unexp_pkt_window = unexp_pkt_window;
        self
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_rto_us(mut self, rto_us: u64) -> Self {
        self.rto_us = rto_us;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Fault switches for exercising error paths from tests.
///
/// Owned by the runtime and injected at construction; all switches default
/// to off and nothing in release code paths sets them.
#[derive(Debug, Default)]
pub struct FaultInjection {
    /// Make the client fail to resolve the server's routing info while
    /// processing a connect response.
    fail_resolve_rinfo_client: Cell<bool>,
}

impl FaultInjection {
    pub fn set_fail_resolve_rinfo_client(&self, fail: bool) {
        self.fail_resolve_rinfo_client.set(fail);
    }

    #[inline]
    pub(crate) fn fail_resolve_rinfo_client(&self) -> bool {
        self.fail_resolve_rinfo_client.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_phy_port(2)
            .with_session_credits(16)
            .with_max_msg_size(4096)
            .with_rto_us(10_000)
            .with_max_retries(5);

        assert_eq!(config.phy_port, 2);
        assert_eq!(config.session_credits, 16);
        assert_eq!(config.max_msg_size, 4096);
        assert_eq!(config.rto_us, 10_000);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_fault_injection_defaults_off() {
        let fi = FaultInjection::default();
        assert!(!fi.fail_resolve_rinfo_client());
        fi.set_fail_resolve_rinfo_client(true);
        assert!(fi.fail_resolve_rinfo_client());
    }
}
