//! Datapath transport abstraction and the loopback UDP transport.
//!
//! The runtime is generic over a small transport capability set so the hot
//! path stays monomorphized: burst transmit, burst receive with zero-copy
//! packet references, the per-packet payload capacity, and opaque routing
//! info that travels inside session-management envelopes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use nix::sys::socket::{setsockopt, sockopt};

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;

/// Size of the opaque routing-info blob carried in SM envelopes.
pub const ROUTING_INFO_SIZE: usize = 16;

/// Transport-defined routing information, zero-padded to a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingInfo {
    bytes: [u8; ROUTING_INFO_SIZE],
}

impl RoutingInfo {
    pub fn from_bytes(bytes: [u8; ROUTING_INFO_SIZE]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ROUTING_INFO_SIZE] {
        &self.bytes
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8; ROUTING_INFO_SIZE] {
        &mut self.bytes
    }
}

/// One packet handed to `tx_burst`: a resolved route, the packet header
/// bytes and the payload slice (possibly empty for control packets).
pub struct TxPacket<'a, R> {
    pub route: R,
    pub hdr: &'a [u8],
    pub payload: &'a [u8],
}

/// The transport capability set consumed by the runtime.
///
/// All methods are called from the owning runtime thread only.
pub trait Transport: Sized {
    /// A resolved, sendable address.
    type Route: Copy + std::fmt::Debug;

    /// Open a transport instance for one runtime.
    fn open(config: &RpcConfig) -> Result<Self>;

    /// Payload bytes per packet (MTU minus the packet header).
    fn max_data_per_pkt(&self) -> usize;

    /// Write this endpoint's routing info into `out`.
    fn fill_routing_info(&self, out: &mut RoutingInfo);

    /// Resolve a peer's routing info into a sendable route.
    fn resolve_routing_info(&self, ri: &RoutingInfo) -> Result<Self::Route>;

    /// Best-effort burst send. Returns the number of packets accepted;
    /// the rest should be retried later. Packets may still be dropped by
    /// the fabric after acceptance.
    fn tx_burst(&mut self, batch: &[TxPacket<'_, Self::Route>]) -> Result<usize>;

    /// Pull a burst of packets into the receive ring. Returns how many are
    /// readable via `rx_pkt`; the references stay valid until the next
    /// `rx_burst` call.
    fn rx_burst(&mut self) -> Result<usize>;

    /// Packet `idx` of the last burst.
    fn rx_pkt(&self, idx: usize) -> &[u8];
}

/// Receive-ring depth of the UDP transport.
const UDP_RX_RING_SIZE: usize = 1024;

/// Datagram transport over a loopback/LAN UDP socket.
///
/// Stands in for a fabric driver: connectionless, lossy, unordered as far
/// as the runtime is concerned. Routing info carries `ip | udp port | mtu`.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddrV4,
    mtu: usize,
    rx_ring: Vec<Box<[u8]>>,
    rx_len: Vec<usize>,
    rx_count: usize,
    scratch: Vec<u8>,
}

impl UdpTransport {
    fn ipv4_of(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(a) => SocketAddrV4::new(Ipv4Addr::LOCALHOST, a.port()),
        }
    }

    /// Local datapath address (distinct from the Nexus SM port).
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }
}

impl Transport for UdpTransport {
    type Route = SocketAddrV4;

    fn open(config: &RpcConfig) -> Result<Self> {
        if config.mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidArgument("mtu must exceed the packet header"));
        }

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.set_nonblocking(true)?;
        // Best effort; bursts larger than the kernel default are recovered
        // by retransmission anyway.
        let _ = setsockopt(&socket, sockopt::RcvBuf, &(1 << 20));

        let local = Self::ipv4_of(socket.local_addr()?);
        Ok(Self {
            socket,
            local,
            mtu: config.mtu,
            rx_ring: (0..UDP_RX_RING_SIZE)
                .map(|_| vec![0u8; config.mtu].into_boxed_slice())
                .collect(),
            rx_len: vec![0; UDP_RX_RING_SIZE],
            rx_count: 0,
            scratch: Vec::with_capacity(config.mtu),
        })
    }

    fn max_data_per_pkt(&self) -> usize {
        self.mtu - PKT_HDR_SIZE
    }

    fn fill_routing_info(&self, out: &mut RoutingInfo) {
        let bytes = out.as_bytes_mut();
        bytes.fill(0);
        bytes[0..4].copy_from_slice(&self.local.ip().octets());
        bytes[4..6].copy_from_slice(&self.local.port().to_be_bytes());
        bytes[6..8].copy_from_slice(&(self.mtu as u16).to_be_bytes());
    }

    fn resolve_routing_info(&self, ri: &RoutingInfo) -> Result<SocketAddrV4> {
        let b = ri.as_bytes();
        let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let port = u16::from_be_bytes([b[4], b[5]]);
        if ip.is_unspecified() || port == 0 {
            return Err(Error::RoutingResolutionFailure);
        }
        Ok(SocketAddrV4::new(ip, port))
    }

    fn tx_burst(&mut self, batch: &[TxPacket<'_, SocketAddrV4>]) -> Result<usize> {
        let mut sent = 0;
        for pkt in batch {
            self.scratch.clear();
            self.scratch.extend_from_slice(pkt.hdr);
            self.scratch.extend_from_slice(pkt.payload);

            match self.socket.send_to(&self.scratch, pkt.route) {
                Ok(_) => sent += 1,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // A peer that went away surfaces as ICMP-driven errors on
                // loopback; the datagram is simply lost.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => sent += 1,
                Err(e) => return Err(Error::TransportFatal(e)),
            }
        }
        Ok(sent)
    }

    fn rx_burst(&mut self) -> Result<usize> {
        self.rx_count = 0;
        while self.rx_count < self.rx_ring.len() {
            match self.socket.recv_from(&mut self.rx_ring[self.rx_count]) {
                Ok((len, _src)) => {
                    self.rx_len[self.rx_count] = len;
                    self.rx_count += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(Error::TransportFatal(e)),
            }
        }
        Ok(self.rx_count)
    }

    fn rx_pkt(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.rx_count);
        &self.rx_ring[idx][..self.rx_len[idx]]
    }
}
