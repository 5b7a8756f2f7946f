//! Session-management wire protocol.
//!
//! The control plane rides UDP datagrams on the Nexus's well-known port,
//! out of band from the datapath. Each datagram is a fixed 96-byte
//! envelope in network byte order:
//!
//! ```text
//! Offset  Size  Field
//! 0       2     magic
//! 2       1     protocol version
//! 3       1     packet type (connect / connect-response / ...)
//! 4       1     error type
//! 5       3     reserved
//! 8       32    client endpoint
//! 40      32    server endpoint
//! 72      2     client session number
//! 74      2     server session number
//! 76      16    routing info (transport blob, zero-padded)
//! 92      4     reserved
//! ```
//!
//! Endpoints are 32 bytes: `hostname[24] | udp_port u16 | phy_port u8 |
//! app_tid u8 | reserved[4]`.

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_MAGIC;
use crate::transport::{RoutingInfo, ROUTING_INFO_SIZE};

/// Size of a session-management datagram.
pub const SM_PKT_SIZE: usize = 96;

/// Protocol version carried in every envelope.
pub const SM_PROTOCOL_VERSION: u8 = 1;

/// Longest hostname storable in an endpoint, excluding the NUL padding.
pub const MAX_HOSTNAME_LEN: usize = 23;

const ENDPOINT_SIZE: usize = 32;

/// Session-management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectRequest = 0,
    ConnectResponse = 1,
    DisconnectRequest = 2,
    DisconnectResponse = 3,
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmPktType::ConnectRequest),
            1 => Ok(SmPktType::ConnectResponse),
            2 => Ok(SmPktType::DisconnectRequest),
            3 => Ok(SmPktType::DisconnectResponse),
            _ => Err(Error::ProtocolViolation("invalid SM packet type")),
        }
    }
}

/// Event delivered to the application's session-management callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    Connected,
    ConnectFailed,
    Disconnected,
}

/// Error code carried in SM envelopes and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrType {
    NoError = 0,
    /// The connect named a fabric port the server does not own.
    InvalidRemotePort = 1,
    /// Routing info could not be resolved (either side).
    RoutingResolutionFailure = 2,
    /// The server has no free session slots.
    NoSessionSlots = 3,
    /// Callback-only: the local transport failed fatally. Never on the wire.
    TransportFatal = 4,
}

impl TryFrom<u8> for SmErrType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmErrType::NoError),
            1 => Ok(SmErrType::InvalidRemotePort),
            2 => Ok(SmErrType::RoutingResolutionFailure),
            3 => Ok(SmErrType::NoSessionSlots),
            _ => Err(Error::ProtocolViolation("invalid SM error type")),
        }
    }
}

/// One side of a session: who it is and where its control plane lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmEndpoint {
    hostname: [u8; MAX_HOSTNAME_LEN + 1],
    pub udp_port: u16,
    pub phy_port: u8,
    pub app_tid: u8,
}

impl SmEndpoint {
    /// Build an endpoint; `hostname` is truncated to `MAX_HOSTNAME_LEN`.
    pub fn new(hostname: &str, udp_port: u16, phy_port: u8, app_tid: u8) -> Self {
        let mut name = [0u8; MAX_HOSTNAME_LEN + 1];
        let bytes = hostname.as_bytes();
        let n = bytes.len().min(MAX_HOSTNAME_LEN);
        name[..n].copy_from_slice(&bytes[..n]);
        Self {
            hostname: name,
            udp_port,
            phy_port,
            app_tid,
        }
    }

    /// The NUL-trimmed hostname.
    pub fn hostname(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.hostname.len());
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }

    fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), ENDPOINT_SIZE);
        out[..24].copy_from_slice(&self.hostname);
        out[24..26].copy_from_slice(&self.udp_port.to_be_bytes());
        out[26] = self.phy_port;
        out[27] = self.app_tid;
        out[28..32].fill(0);
    }

    fn decode(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), ENDPOINT_SIZE);
        let mut hostname = [0u8; MAX_HOSTNAME_LEN + 1];
        hostname.copy_from_slice(&bytes[..24]);
        Self {
            hostname,
            udp_port: u16::from_be_bytes([bytes[24], bytes[25]]),
            phy_port: bytes[26],
            app_tid: bytes[27],
        }
    }
}

/// A decoded session-management envelope.
#[derive(Debug, Clone, Copy)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err_type: SmErrType,
    pub client: SmEndpoint,
    pub server: SmEndpoint,
    pub client_session_num: u16,
    pub server_session_num: u16,
    pub routing_info: RoutingInfo,
}

impl SmPkt {
    /// True for the two request types (sent client -> server).
    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(
            self.pkt_type,
            SmPktType::ConnectRequest | SmPktType::DisconnectRequest
        )
    }

    /// The app thread id this envelope should be delivered to.
    #[inline]
    pub fn dest_app_tid(&self) -> u8 {
        if self.is_request() {
            self.server.app_tid
        } else {
            self.client.app_tid
        }
    }

    /// Build the matching response envelope, keeping both endpoints and the
    /// client session number.
    pub fn response(
        &self,
        err_type: SmErrType,
        server_session_num: u16,
        routing_info: RoutingInfo,
    ) -> SmPkt {
        let pkt_type = match self.pkt_type {
            SmPktType::ConnectRequest => SmPktType::ConnectResponse,
            SmPktType::DisconnectRequest => SmPktType::DisconnectResponse,
            other => other,
        };
        SmPkt {
            pkt_type,
            err_type,
            client: self.client,
            server: self.server,
            client_session_num: self.client_session_num,
            server_session_num,
            routing_info,
        }
    }

    /// Serialize to the 96-byte wire envelope.
    pub fn encode(&self) -> [u8; SM_PKT_SIZE] {
        let mut out = [0u8; SM_PKT_SIZE];
        out[0..2].copy_from_slice(&PKT_HDR_MAGIC.to_be_bytes());
        out[2] = SM_PROTOCOL_VERSION;
        out[3] = self.pkt_type as u8;
        out[4] = self.err_type as u8;
        self.client.encode(&mut out[8..40]);
        self.server.encode(&mut out[40..72]);
        out[72..74].copy_from_slice(&self.client_session_num.to_be_bytes());
        out[74..76].copy_from_slice(&self.server_session_num.to_be_bytes());
        out[76..76 + ROUTING_INFO_SIZE].copy_from_slice(self.routing_info.as_bytes());
        out
    }

    /// Decode and validate a wire envelope.
    pub fn decode(bytes: &[u8]) -> Result<SmPkt> {
        if bytes.len() < SM_PKT_SIZE {
            return Err(Error::ProtocolViolation("short SM packet"));
        }
        if u16::from_be_bytes([bytes[0], bytes[1]]) != PKT_HDR_MAGIC {
            return Err(Error::ProtocolViolation("bad SM magic"));
        }
        if bytes[2] != SM_PROTOCOL_VERSION {
            return Err(Error::ProtocolViolation("SM protocol version mismatch"));
        }
        let pkt_type = SmPktType::try_from(bytes[3])?;
        let err_type = SmErrType::try_from(bytes[4])?;
        let mut ri = [0u8; ROUTING_INFO_SIZE];
        ri.copy_from_slice(&bytes[76..76 + ROUTING_INFO_SIZE]);
        Ok(SmPkt {
            pkt_type,
            err_type,
            client: SmEndpoint::decode(&bytes[8..40]),
            server: SmEndpoint::decode(&bytes[40..72]),
            client_session_num: u16::from_be_bytes([bytes[72], bytes[73]]),
            server_session_num: u16::from_be_bytes([bytes[74], bytes[75]]),
            routing_info: RoutingInfo::from_bytes(ri),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pkt() -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::ConnectRequest,
            err_type: SmErrType::NoError,
            client: SmEndpoint::new("clienthost", 31850, 0, 100),
            server: SmEndpoint::new("serverhost", 31850, 0, 200),
            client_session_num: 3,
            server_session_num: 0,
            routing_info: RoutingInfo::from_bytes([7u8; ROUTING_INFO_SIZE]),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let pkt = sample_pkt();
        let wire = pkt.encode();
        assert_eq!(wire.len(), SM_PKT_SIZE);

        let back = SmPkt::decode(&wire).unwrap();
        assert_eq!(back.pkt_type, pkt.pkt_type);
        assert_eq!(back.err_type, pkt.err_type);
        assert_eq!(back.client, pkt.client);
        assert_eq!(back.server, pkt.server);
        assert_eq!(back.client_session_num, 3);
        assert_eq!(back.routing_info, pkt.routing_info);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let pkt = sample_pkt();
        let mut wire = pkt.encode();

        wire[0] ^= 0xFF;
        assert!(SmPkt::decode(&wire).is_err());

        let mut wire = pkt.encode();
        wire[2] = SM_PROTOCOL_VERSION + 1;
        assert!(SmPkt::decode(&wire).is_err());

        assert!(SmPkt::decode(&wire[..40]).is_err());
    }

    #[test]
    fn test_dest_app_tid_by_direction() {
        let pkt = sample_pkt();
        assert!(pkt.is_request());
        assert_eq!(pkt.dest_app_tid(), 200);

        let resp = pkt.response(SmErrType::NoError, 9, pkt.routing_info);
        assert_eq!(resp.pkt_type, SmPktType::ConnectResponse);
        assert!(!resp.is_request());
        assert_eq!(resp.dest_app_tid(), 100);
        assert_eq!(resp.server_session_num, 9);
    }

    #[test]
    fn test_hostname_truncation() {
        let long = "a-very-long-hostname-that-exceeds-the-field";
        let ep = SmEndpoint::new(long, 1, 0, 0);
        assert_eq!(ep.hostname().len(), MAX_HOSTNAME_LEN);
        assert!(long.starts_with(ep.hostname()));
    }
}
