//! Packet header and packet types for the datapath.
//!
//! Every datapath packet starts with a fixed 24-byte header carrying the
//! metadata needed for request/response correlation, fragmentation and
//! credit management.

use crate::error::{Error, Result};

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 24;

/// Magic number stamped into every header written by the runtime.
pub const PKT_HDR_MAGIC: u16 = 0x11EC;

/// Bytes reserved at the front of the header for a transport-specific
/// prefix (e.g. a UDP checksum stub for raw Ethernet).
pub const HEADROOM_BYTES: usize = 2;

/// Maximum message size representable in the 24-bit `msg_size` field.
pub const MAX_WIRE_MSG_SIZE: usize = (1 << 24) - 1;

/// Packet type (3 bits on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request packet (any fragment of a request message).
    Req = 0,
    /// Request-for-response: asks the peer to (re)send one response packet.
    /// Header-only; `pkt_num` names the wanted response fragment.
    ReqForResp = 1,
    /// Response packet (any fragment of a response message).
    Resp = 2,
    /// Explicit credit return for an abandoned request. Header-only.
    ExplCreditReturn = 3,
    /// Session-management envelope carried on the datapath.
    SessionMgmt = 4,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PktType::Req),
            1 => Ok(PktType::ReqForResp),
            2 => Ok(PktType::Resp),
            3 => Ok(PktType::ExplCreditReturn),
            4 => Ok(PktType::SessionMgmt),
            _ => Err(Error::ProtocolViolation("invalid packet type")),
        }
    }
}

/// Packet header (24 bytes, little-endian).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       2     headroom (transport prefix, zeroed)
/// 2       2     magic
/// 4       1     pkt_type (3 bits used)
/// 5       1     req_type
/// 6       3     msg_size (24-bit)
/// 9       1     reserved
/// 10      2     dest_session_num
/// 12      2     pkt_num
/// 14      2     reserved
/// 16      8     req_num (low bits encode the session slot)
/// ```
///
/// All multi-byte fields are stored as little-endian byte arrays, so the
/// in-memory representation is exactly the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PktHdr {
    headroom: [u8; HEADROOM_BYTES],
    magic: [u8; 2],
    pkt_type: u8,
    req_type: u8,
    msg_size: [u8; 3],
    reserved0: u8,
    dest_session_num: [u8; 2],
    pkt_num: [u8; 2],
    reserved1: [u8; 2],
    req_num: [u8; 8],
}

impl PktHdr {
    /// Create a new packet header with a valid magic.
    pub fn new(
        pkt_type: PktType,
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= MAX_WIRE_MSG_SIZE);

        let mut hdr = Self {
            headroom: [0; HEADROOM_BYTES],
            magic: PKT_HDR_MAGIC.to_le_bytes(),
            pkt_type: pkt_type as u8,
            req_type,
            msg_size: [0; 3],
            reserved0: 0,
            dest_session_num: dest_session_num.to_le_bytes(),
            pkt_num: pkt_num.to_le_bytes(),
            reserved1: [0; 2],
            req_num: req_num.to_le_bytes(),
        };
        hdr.set_msg_size(msg_size);
        hdr
    }

    #[inline]
    pub fn magic(&self) -> u16 {
        u16::from_le_bytes(self.magic)
    }

    #[inline]
    pub fn check_magic(&self) -> bool {
        self.magic() == PKT_HDR_MAGIC
    }

    #[inline]
    pub fn pkt_type(&self) -> Result<PktType> {
        PktType::try_from(self.pkt_type & 0x07)
    }

    #[inline]
    pub fn set_pkt_type(&mut self, pkt_type: PktType) {
        self.pkt_type = pkt_type as u8;
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    #[inline]
    pub fn set_req_type(&mut self, req_type: u8) {
        self.req_type = req_type;
    }

    #[inline]
    pub fn msg_size(&self) -> usize {
        (self.msg_size[0] as usize)
            | ((self.msg_size[1] as usize) << 8)
            | ((self.msg_size[2] as usize) << 16)
    }

    #[inline]
    pub fn set_msg_size(&mut self, size: usize) {
        debug_assert!(size <= MAX_WIRE_MSG_SIZE);
        self.msg_size[0] = (size & 0xFF) as u8;
        self.msg_size[1] = ((size >> 8) & 0xFF) as u8;
        self.msg_size[2] = ((size >> 16) & 0xFF) as u8;
    }

    #[inline]
    pub fn dest_session_num(&self) -> u16 {
        u16::from_le_bytes(self.dest_session_num)
    }

    #[inline]
    pub fn set_dest_session_num(&mut self, num: u16) {
        self.dest_session_num = num.to_le_bytes();
    }

    #[inline]
    pub fn pkt_num(&self) -> u16 {
        u16::from_le_bytes(self.pkt_num)
    }

    #[inline]
    pub fn set_pkt_num(&mut self, num: u16) {
        self.pkt_num = num.to_le_bytes();
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        u64::from_le_bytes(self.req_num)
    }

    #[inline]
    pub fn set_req_num(&mut self, num: u64) {
        self.req_num = num.to_le_bytes();
    }

    #[inline]
    pub fn is_req(&self) -> bool {
        self.pkt_type & 0x07 == PktType::Req as u8
    }

    #[inline]
    pub fn is_resp(&self) -> bool {
        self.pkt_type & 0x07 == PktType::Resp as u8
    }

    #[inline]
    pub fn is_expl_cr(&self) -> bool {
        self.pkt_type & 0x07 == PktType::ExplCreditReturn as u8
    }

    /// Validate the magic; bad-magic packets are rejected by the dispatcher.
    pub fn validate(&self) -> Result<()> {
        if !self.check_magic() {
            return Err(Error::ProtocolViolation("bad packet header magic"));
        }
        Ok(())
    }

    /// Serialize the header into `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for `PKT_HDR_SIZE` bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, PKT_HDR_SIZE);
        }
    }

    /// Deserialize a header from `src`.
    ///
    /// # Safety
    /// `src` must be valid for `PKT_HDR_SIZE` bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        unsafe {
            let mut hdr = std::mem::MaybeUninit::<Self>::uninit();
            std::ptr::copy_nonoverlapping(src, hdr.as_mut_ptr() as *mut u8, PKT_HDR_SIZE);
            hdr.assume_init()
        }
    }

    /// Create a validated header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PKT_HDR_SIZE {
            return Err(Error::ProtocolViolation("short packet"));
        }
        let hdr = unsafe { Self::read_from(bytes.as_ptr()) };
        hdr.validate()?;
        Ok(hdr)
    }

    /// View the header as its wire bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; PKT_HDR_SIZE] {
        unsafe { &*(self as *const Self as *const [u8; PKT_HDR_SIZE]) }
    }

    /// Number of packets needed for a message of `msg_size` bytes when each
    /// packet carries at most `data_per_pkt` payload bytes. Zero-byte
    /// messages still need one packet.
    pub fn calc_num_pkts(msg_size: usize, data_per_pkt: usize) -> usize {
        if msg_size == 0 {
            1
        } else {
            msg_size.div_ceil(data_per_pkt)
        }
    }

    /// Payload bytes carried by packet `pkt_num` of a `msg_size`-byte message.
    #[inline]
    pub fn pkt_payload_len(msg_size: usize, data_per_pkt: usize, pkt_num: usize) -> usize {
        let off = pkt_num * data_per_pkt;
        msg_size.saturating_sub(off).min(data_per_pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkt_hdr_size() {
        assert_eq!(std::mem::size_of::<PktHdr>(), PKT_HDR_SIZE);
    }

    #[test]
    fn test_pkt_hdr_roundtrip() {
        let hdr = PktHdr::new(PktType::Req, 42, 0x123456, 0x1234, 0x3FFF, 0x0FFF_FFFF_FFFF);

        assert_eq!(hdr.pkt_type().unwrap(), PktType::Req);
        assert_eq!(hdr.req_type(), 42);
        assert_eq!(hdr.msg_size(), 0x123456);
        assert_eq!(hdr.dest_session_num(), 0x1234);
        assert_eq!(hdr.pkt_num(), 0x3FFF);
        assert_eq!(hdr.req_num(), 0x0FFF_FFFF_FFFF);
        assert!(hdr.check_magic());
    }

    #[test]
    fn test_pkt_hdr_serialize() {
        let hdr = PktHdr::new(PktType::Resp, 1, 100, 5, 10, 12345);
        let mut buf = [0u8; PKT_HDR_SIZE];

        unsafe {
            hdr.write_to(buf.as_mut_ptr());
            let hdr2 = PktHdr::read_from(buf.as_ptr());
            assert_eq!(hdr, hdr2);
        }

        let hdr3 = PktHdr::from_bytes(&buf).unwrap();
        assert_eq!(hdr, hdr3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = [0u8; PKT_HDR_SIZE];
        let hdr = PktHdr::new(PktType::Req, 0, 0, 0, 0, 0);
        unsafe { hdr.write_to(buf.as_mut_ptr()) };
        buf[2] ^= 0xFF;
        assert!(PktHdr::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_pkt_types() {
        for pkt_type in [
            PktType::Req,
            PktType::ReqForResp,
            PktType::Resp,
            PktType::ExplCreditReturn,
            PktType::SessionMgmt,
        ] {
            let hdr = PktHdr::new(pkt_type, 0, 0, 0, 0, 0);
            assert_eq!(hdr.pkt_type().unwrap(), pkt_type);
        }
        assert!(PktType::try_from(7u8).is_err());
    }

    #[test]
    fn test_calc_num_pkts() {
        let data_per_pkt = 1000;

        assert_eq!(PktHdr::calc_num_pkts(0, data_per_pkt), 1);
        assert_eq!(PktHdr::calc_num_pkts(1, data_per_pkt), 1);
        assert_eq!(PktHdr::calc_num_pkts(data_per_pkt, data_per_pkt), 1);
        assert_eq!(PktHdr::calc_num_pkts(data_per_pkt + 1, data_per_pkt), 2);
        assert_eq!(PktHdr::calc_num_pkts(data_per_pkt * 2, data_per_pkt), 2);
        assert_eq!(PktHdr::calc_num_pkts(data_per_pkt * 2 + 1, data_per_pkt), 3);
    }

    #[test]
    fn test_pkt_payload_len() {
        assert_eq!(PktHdr::pkt_payload_len(2500, 1000, 0), 1000);
        assert_eq!(PktHdr::pkt_payload_len(2500, 1000, 1), 1000);
        assert_eq!(PktHdr::pkt_payload_len(2500, 1000, 2), 500);
        assert_eq!(PktHdr::pkt_payload_len(2500, 1000, 3), 0);
    }
}
