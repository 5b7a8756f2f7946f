//! Message buffers and the size-classed buffer pool.
//!
//! A `MsgBuffer` is one contiguous region laid out as
//!
//! ```text
//! [hdr_0 | payload (rounded up to 8 bytes) | hdr_1 | hdr_2 | ... | hdr_{N-1}]
//! ```
//!
//! `buf` points at the first payload byte, one header past the allocation
//! base. Prepending header 0 lets the transmit path send the zeroth packet
//! as a single contiguous range; the trailing headers give multi-packet
//! messages stable per-packet metadata while keeping the payload contiguous
//! for the application. Trailing-header offsets are computed from
//! `max_data_size`, never `data_size`, so they stay put under `resize`.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::packet::{PktHdr, PktType, PKT_HDR_SIZE};

/// Alignment for pool allocations (cache line).
pub const MSG_BUFFER_ALIGN: usize = 64;

/// Smallest size class: 64 bytes.
const MIN_CLASS_SHIFT: u32 = 6;

/// Number of power-of-two size classes (64 B .. 16 MiB).
const NUM_CLASSES: usize = 19;

/// Round `n` up to the payload word size.
#[inline]
pub(crate) fn round_up_word(n: usize) -> usize {
    (n + 7) & !7
}

/// Backing bytes needed for a MsgBuffer holding `max_data_size` payload
/// bytes split over `max_num_pkts` packets.
#[inline]
pub(crate) fn backing_size(max_data_size: usize, max_num_pkts: usize) -> usize {
    PKT_HDR_SIZE + round_up_word(max_data_size) + (max_num_pkts - 1) * PKT_HDR_SIZE
}

/// A raw pool allocation: base address plus the pool's internal size class.
///
/// The address is stored as `usize` so the pool's free lists stay `Send`.
#[derive(Debug, Clone, Copy)]
pub struct RawBuf {
    addr: usize,
    class_size: usize,
}

impl RawBuf {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }
}

/// Size-classed buffer pool shared by every runtime in the process.
///
/// Allocations are rounded up to the next power-of-two class and recycled
/// through per-class free lists. The outstanding-allocation count is the
/// hook for leak checking: once a runtime has no active sessions, the only
/// outstanding buffers are the ones the application still holds.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    outstanding: AtomicUsize,
}

struct PoolInner {
    free: [Vec<usize>; NUM_CLASSES],
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: std::array::from_fn(|_| Vec::new()),
            }),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn class_of(size: usize) -> Result<(usize, usize)> {
        let class_size = size.next_power_of_two().max(1 << MIN_CLASS_SHIFT);
        let idx = (class_size.trailing_zeros() - MIN_CLASS_SHIFT) as usize;
        if idx >= NUM_CLASSES {
            return Err(Error::OutOfMemory);
        }
        Ok((idx, class_size))
    }

    /// Allocate at least `size` bytes; the returned buffer's `class_size`
    /// is the pool's internal power-of-two class.
    pub fn alloc(&self, size: usize) -> Result<RawBuf> {
        let (idx, class_size) = Self::class_of(size)?;

        let addr = {
            let mut inner = self.inner.lock().unwrap();
            inner.free[idx].pop()
        };

        let addr = match addr {
            Some(addr) => addr,
            None => {
                let layout = Layout::from_size_align(class_size, MSG_BUFFER_ALIGN)
                    .map_err(|_| Error::OutOfMemory)?;
                let ptr = unsafe { alloc(layout) };
                if ptr.is_null() {
                    return Err(Error::OutOfMemory);
                }
                ptr as usize
            }
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(RawBuf { addr, class_size })
    }

    /// Return a buffer to its size class.
    pub fn free(&self, raw: RawBuf) {
        let idx = (raw.class_size.trailing_zeros() - MIN_CLASS_SHIFT) as usize;
        debug_assert!(idx < NUM_CLASSES);
        let mut inner = self.inner.lock().unwrap();
        inner.free[idx].push(raw.addr);
        drop(inner);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of allocations currently out of the pool.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for (idx, list) in inner.free.iter().enumerate() {
            let class_size = 1usize << (idx as u32 + MIN_CLASS_SHIFT);
            let layout = Layout::from_size_align(class_size, MSG_BUFFER_ALIGN).unwrap();
            for &addr in list {
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }
}

/// What a MsgBuffer's memory belongs to.
#[derive(Debug)]
enum Backing {
    /// No memory at all: default-constructed or buried.
    Invalid,
    /// A pool allocation owned through this MsgBuffer.
    Owned(RawBuf),
    /// A view over a received packet. Never freed by the runtime; only
    /// valid until the transport recycles its receive ring.
    Borrowed,
}

/// A message buffer with packet headers at the beginning and end.
///
/// MsgBuffers are plain views: dropping one never frees memory. Owned
/// buffers are released explicitly through `Rpc::free_msg_buffer`, which
/// buries the view and returns the backing allocation to the pool. A buried
/// buffer has a null payload pointer and no backing.
#[derive(Debug)]
pub struct MsgBuffer {
    /// Pointer to the first payload byte; null when invalid or buried.
    buf: *mut u8,
    backing: Backing,
    max_data_size: usize,
    data_size: usize,
    max_num_pkts: usize,
    num_pkts: usize,
}

// MsgBuffers cross threads only on the background-handler path, which hands
// each buffer to exactly one worker at a time.
unsafe impl Send for MsgBuffer {}

impl Default for MsgBuffer {
    fn default() -> Self {
        Self::invalid()
    }
}

impl MsgBuffer {
    /// An invalid MsgBuffer (null payload pointer).
    pub fn invalid() -> Self {
        Self {
            buf: std::ptr::null_mut(),
            backing: Backing::Invalid,
            max_data_size: 0,
            data_size: 0,
            max_num_pkts: 0,
            num_pkts: 0,
        }
    }

    /// Construct a dynamic MsgBuffer over a pool allocation. Header 0 is
    /// stamped with the magic; tail headers are populated at transmit time.
    pub(crate) fn owned(raw: RawBuf, max_data_size: usize, max_num_pkts: usize) -> Self {
        debug_assert!(max_num_pkts >= 1);
        debug_assert!(raw.class_size() >= backing_size(max_data_size, max_num_pkts));

        let hdr = PktHdr::new(PktType::Req, 0, 0, 0, 0, 0);
        unsafe { hdr.write_to(raw.as_ptr()) };

        Self {
            buf: unsafe { raw.as_ptr().add(PKT_HDR_SIZE) },
            backing: Backing::Owned(raw),
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
        }
    }

    /// Construct a single-packet "fake" MsgBuffer over a received packet.
    /// `pkthdr` must point at the packet's (already validated) header.
    ///
    /// # Safety
    /// The packet memory must stay valid for the lifetime of the view; the
    /// receive path guarantees this until the next `rx_burst`.
    pub(crate) unsafe fn fake(pkthdr: *mut u8, data_size: usize) -> Self {
        Self {
            buf: unsafe { pkthdr.add(PKT_HDR_SIZE) },
            backing: Backing::Borrowed,
            max_data_size: data_size,
            data_size,
            max_num_pkts: 1,
            num_pkts: 1,
        }
    }

    /// Basic validity check every usable MsgBuffer must satisfy.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.buf.is_null() && self.pkthdr(0).check_magic()
    }

    /// True iff this MsgBuffer owns a pool allocation.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.backing, Backing::Owned(_))
    }

    /// True iff this MsgBuffer borrows a received packet.
    #[inline]
    pub fn is_fake(&self) -> bool {
        matches!(self.backing, Backing::Borrowed)
    }

    #[inline]
    pub fn is_valid_dynamic(&self) -> bool {
        self.is_valid() && self.is_dynamic()
    }

    /// True iff this MsgBuffer has been freed back to the pool.
    #[inline]
    pub fn is_buried(&self) -> bool {
        self.buf.is_null() && matches!(self.backing, Backing::Invalid)
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    #[inline]
    pub fn max_num_pkts(&self) -> usize {
        self.max_num_pkts
    }

    /// Pointer to header `n`. Header 0 sits just before the payload; header
    /// `n >= 1` sits after the word-rounded maximum payload.
    #[inline]
    pub(crate) fn pkthdr_ptr(&self, n: usize) -> *mut u8 {
        debug_assert!(!self.buf.is_null());
        debug_assert!(n < self.max_num_pkts.max(1));
        if n == 0 {
            unsafe { self.buf.sub(PKT_HDR_SIZE) }
        } else {
            unsafe {
                self.buf
                    .add(round_up_word(self.max_data_size) + (n - 1) * PKT_HDR_SIZE)
            }
        }
    }

    /// Header `n`, immutable. Headers are 8-byte aligned within the backing
    /// allocation, so forming references is fine.
    #[inline]
    pub fn pkthdr(&self, n: usize) -> &PktHdr {
        unsafe { &*(self.pkthdr_ptr(n) as *const PktHdr) }
    }

    /// Header `n`, mutable.
    #[inline]
    pub(crate) fn pkthdr_mut(&mut self, n: usize) -> &mut PktHdr {
        unsafe { &mut *(self.pkthdr_ptr(n) as *mut PktHdr) }
    }

    /// Pointer to the payload byte at `offset`.
    #[inline]
    pub(crate) fn payload_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.max_data_size);
        unsafe { self.buf.add(offset) }
    }

    /// The payload as a byte slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        debug_assert!(!self.buf.is_null());
        unsafe { std::slice::from_raw_parts(self.buf, self.data_size) }
    }

    /// The payload as a mutable byte slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.buf.is_null());
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.data_size) }
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        self.pkthdr(0).req_num()
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.pkthdr(0).req_type()
    }

    /// Identity check: equal `(req_type, req_num)` on header 0.
    pub fn matches(&self, other: &MsgBuffer) -> bool {
        self.req_type() == other.req_type() && self.req_num() == other.req_num()
    }

    /// Shrink the buffer view; both values must stay within the caps fixed
    /// at allocation time. Never reallocates.
    pub(crate) fn resize(&mut self, new_data_size: usize, new_num_pkts: usize) {
        debug_assert!(new_data_size <= self.max_data_size);
        debug_assert!(new_num_pkts <= self.max_num_pkts);
        self.data_size = new_data_size;
        self.num_pkts = new_num_pkts;
    }

    /// Internal copy of the view. The backing allocation is still freed at
    /// most once; the runtime keeps exactly one releasing owner per buffer.
    pub(crate) fn clone_view(&self) -> MsgBuffer {
        MsgBuffer {
            buf: self.buf,
            backing: match self.backing {
                Backing::Invalid => Backing::Invalid,
                Backing::Owned(raw) => Backing::Owned(raw),
                Backing::Borrowed => Backing::Borrowed,
            },
            max_data_size: self.max_data_size,
            data_size: self.data_size,
            max_num_pkts: self.max_num_pkts,
            num_pkts: self.num_pkts,
        }
    }

    /// Invalidate the view, handing back the owned allocation if any.
    /// Freeing a borrowed (fake) buffer is a no-op.
    pub(crate) fn bury(&mut self) -> Option<RawBuf> {
        self.buf = std::ptr::null_mut();
        self.data_size = 0;
        self.num_pkts = 0;
        match std::mem::replace(&mut self.backing, Backing::Invalid) {
            Backing::Owned(raw) => Some(raw),
            _ => None,
        }
    }
}

/// Allocate a dynamic MsgBuffer able to hold `max_data_size` payload bytes
/// fragmented at `data_per_pkt` bytes per packet.
pub(crate) fn alloc_msg_buffer(
    pool: &BufferPool,
    max_data_size: usize,
    data_per_pkt: usize,
) -> Result<MsgBuffer> {
    let max_num_pkts = PktHdr::calc_num_pkts(max_data_size, data_per_pkt);
    let raw = pool.alloc(backing_size(max_data_size, max_num_pkts))?;
    Ok(MsgBuffer::owned(raw, max_data_size, max_num_pkts))
}

/// Free a MsgBuffer allocated from `pool`. No-op on fakes.
pub(crate) fn free_msg_buffer(pool: &BufferPool, msgbuf: &mut MsgBuffer) {
    if let Some(raw) = msgbuf.bury() {
        pool.free(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_class_rounding() {
        let pool = BufferPool::new();
        let raw = pool.alloc(100).unwrap();
        assert_eq!(raw.class_size(), 128);
        assert_eq!(pool.outstanding(), 1);
        pool.free(raw);
        assert_eq!(pool.outstanding(), 0);

        // The freed block is recycled for the next same-class alloc.
        let raw2 = pool.alloc(128).unwrap();
        assert_eq!(raw2.addr, raw.addr);
        pool.free(raw2);
    }

    #[test]
    fn test_pool_min_class() {
        let pool = BufferPool::new();
        let raw = pool.alloc(1).unwrap();
        assert_eq!(raw.class_size(), 64);
        pool.free(raw);
    }

    #[test]
    fn test_pool_rejects_huge() {
        let pool = BufferPool::new();
        assert!(pool.alloc(1 << 30).is_err());
    }

    #[test]
    fn test_msg_buffer_layout() {
        let pool = BufferPool::new();
        let mut mb = alloc_msg_buffer(&pool, 2500, 1000).unwrap();

        assert!(mb.is_valid_dynamic());
        assert_eq!(mb.max_num_pkts(), 3);
        assert_eq!(mb.data_size(), 2500);

        // Header 0 sits one header before the payload.
        assert_eq!(
            mb.pkthdr_ptr(0) as usize + PKT_HDR_SIZE,
            mb.payload_ptr(0) as usize
        );
        // Tail headers follow the word-rounded maximum payload.
        assert_eq!(
            mb.pkthdr_ptr(1) as usize,
            mb.payload_ptr(0) as usize + round_up_word(2500)
        );
        assert_eq!(
            mb.pkthdr_ptr(2) as usize,
            mb.pkthdr_ptr(1) as usize + PKT_HDR_SIZE
        );

        free_msg_buffer(&pool, &mut mb);
        assert!(mb.is_buried());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_tail_headers_stable_under_resize() {
        let pool = BufferPool::new();
        let mut mb = alloc_msg_buffer(&pool, 5000, 1000).unwrap();

        let hdr1_before = mb.pkthdr_ptr(1) as usize;
        mb.resize(1200, 2);
        assert_eq!(mb.data_size(), 1200);
        assert_eq!(mb.num_pkts(), 2);
        assert_eq!(mb.pkthdr_ptr(1) as usize, hdr1_before);

        free_msg_buffer(&pool, &mut mb);
    }

    #[test]
    fn test_matches() {
        let pool = BufferPool::new();
        let mut a = alloc_msg_buffer(&pool, 64, 1000).unwrap();
        let mut b = alloc_msg_buffer(&pool, 64, 1000).unwrap();

        a.pkthdr_mut(0).set_req_type(3);
        a.pkthdr_mut(0).set_req_num(77);
        b.pkthdr_mut(0).set_req_type(3);
        b.pkthdr_mut(0).set_req_num(77);
        assert!(a.matches(&b));

        b.pkthdr_mut(0).set_req_num(78);
        assert!(!a.matches(&b));

        free_msg_buffer(&pool, &mut a);
        free_msg_buffer(&pool, &mut b);
    }

    #[test]
    fn test_fake_buffer_free_is_noop() {
        let mut pkt = vec![0u8; PKT_HDR_SIZE + 32];
        let hdr = PktHdr::new(PktType::Req, 1, 32, 0, 0, 9);
        unsafe { hdr.write_to(pkt.as_mut_ptr()) };

        let pool = BufferPool::new();
        let mut fake = unsafe { MsgBuffer::fake(pkt.as_mut_ptr(), 32) };
        assert!(fake.is_valid());
        assert!(fake.is_fake());
        assert!(!fake.is_dynamic());
        assert_eq!(fake.req_num(), 9);

        free_msg_buffer(&pool, &mut fake);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_data_write_read() {
        let pool = BufferPool::new();
        let mut mb = alloc_msg_buffer(&pool, 100, 1000).unwrap();
        for (i, b) in mb.data_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        assert_eq!(mb.data()[99], (99 % 251) as u8);
        free_msg_buffer(&pool, &mut mb);
    }
}
