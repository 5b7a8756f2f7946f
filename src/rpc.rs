//! The per-thread RPC runtime.
//!
//! One `Rpc` owns a transport instance, a session table, the receive-side
//! dispatcher state and a timing wheel, and drives all of them from a
//! single-threaded cooperative event loop. All public methods take `&self`;
//! interior mutability keeps the runtime re-enterable from callbacks
//! without handing out aliased `&mut`.
//!
//! Cross-thread traffic is limited to the Nexus SM inbox, the shared
//! buffer pool and the background-handler queues; everything else is
//! mutated only on the owning thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use omango::queue::spsc::{BReceiver, BSender};
use tracing::{debug, trace, warn};

use crate::buffer::{self, backing_size, BufferPool, MsgBuffer};
use crate::config::{FaultInjection, RpcConfig, MAX_PHY_PORTS};
use crate::directory;
use crate::dispatcher::{DispatchStats, Dispatcher, PktBitmap, ReasmEntry};
use crate::error::{Error, Result};
use crate::nexus::{BgComplete, BgWork, Nexus, Ops, SmHandlerFn, SmWorkItem};
use crate::packet::{PktHdr, PktType, MAX_WIRE_MSG_SIZE, PKT_HDR_SIZE};
use crate::session::{Session, SessionState, SessionTable, SmPending};
use crate::sm::{SmEndpoint, SmErrType, SmEventType, SmPkt, SmPktType, MAX_HOSTNAME_LEN};
use crate::timing::{backoff_us, EventClock, TimerEntry, TimerKind, TimingWheel};
use crate::transport::{RoutingInfo, Transport, TxPacket};

/// Packets handed to the transport per `tx_burst` call.
const TX_BATCH_SIZE: usize = 32;

/// View of a received request, passed to request handlers. Carries the
/// buffer-pool capability so handlers can allocate a dynamic response from
/// any thread.
pub struct ReqHandle<'a> {
    msgbuf: &'a MsgBuffer,
    pool: &'a BufferPool,
    data_per_pkt: usize,
    max_msg_size: usize,
    session_num: u16,
    req_num: u64,
    req_type: u8,
}

impl<'a> ReqHandle<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        msgbuf: &'a MsgBuffer,
        pool: &'a BufferPool,
        data_per_pkt: usize,
        max_msg_size: usize,
        session_num: u16,
        req_num: u64,
        req_type: u8,
    ) -> Self {
        Self {
            msgbuf,
            pool,
            data_per_pkt,
            max_msg_size,
            session_num,
            req_num,
            req_type,
        }
    }

    /// The request message buffer.
    #[inline]
    pub fn msgbuf(&self) -> &MsgBuffer {
        self.msgbuf
    }

    /// The request payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.msgbuf.data()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.msgbuf.data_size()
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        self.req_num
    }

    #[inline]
    pub fn session_num(&self) -> u16 {
        self.session_num
    }

    /// Allocate a dynamic MsgBuffer for `dyn_resp_msgbuf`.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> Result<MsgBuffer> {
        if max_data_size > self.max_msg_size {
            return Err(Error::InvalidArgument("message exceeds max_msg_size"));
        }
        buffer::alloc_msg_buffer(self.pool, max_data_size, self.data_per_pkt)
    }
}

/// Out-parameter filled by a request handler.
///
/// Small responses go through the slot's pre-allocated single-packet
/// buffer (`prealloc_used = true`); larger ones through a dynamic buffer
/// allocated via the request handle.
pub struct AppResponse {
    pub prealloc_used: bool,
    pub pre_resp_msgbuf: MsgBuffer,
    pub dyn_resp_msgbuf: MsgBuffer,
}

impl AppResponse {
    pub(crate) fn with_prealloc(pre_resp_msgbuf: MsgBuffer) -> Self {
        Self {
            prealloc_used: false,
            pre_resp_msgbuf,
            dyn_resp_msgbuf: MsgBuffer::invalid(),
        }
    }

    /// Background handlers have no slot buffer; they must allocate.
    pub(crate) fn for_background() -> Self {
        Self {
            prealloc_used: false,
            pre_resp_msgbuf: MsgBuffer::invalid(),
            dyn_resp_msgbuf: MsgBuffer::invalid(),
        }
    }

    /// Shrink the pre-allocated response to `data_size` payload bytes.
    pub fn resize_pre_resp(&mut self, data_size: usize) -> Result<()> {
        if !self.pre_resp_msgbuf.is_valid() || data_size > self.pre_resp_msgbuf.max_data_size() {
            return Err(Error::InvalidArgument("pre-allocated response too small"));
        }
        self.pre_resp_msgbuf.resize(data_size, 1);
        Ok(())
    }
}

/// Header source for one queued packet.
enum TxHdr {
    /// Header lives inside a MsgBuffer that outlives the queue entry.
    Ptr(*const u8),
    /// Header-only control packet, stored inline.
    Inline([u8; PKT_HDR_SIZE]),
}

/// One packet waiting for `tx_burst`.
struct TxWork<R> {
    route: R,
    hdr: TxHdr,
    payload: *const u8,
    payload_len: usize,
}

/// A callback deferred to event-loop step 6.
struct PendingCb {
    session_num: u16,
    event: SmEventType,
    err: SmErrType,
    /// Remove the session before invoking the callback.
    bury: bool,
    /// Whether the application callback fires at all; silent teardowns
    /// only reclaim state.
    notify: bool,
}

/// Per-thread RPC runtime bound to one transport endpoint.
pub struct Rpc<T: Transport, C: Send + 'static> {
    app_tid: u8,
    config: RpcConfig,
    context: Arc<Mutex<C>>,
    sm_handler: SmHandlerFn<C>,
    ops: Box<[Option<Ops<C>>; 256]>,

    transport: RefCell<T>,
    sessions: RefCell<SessionTable<T::Route>>,
    dispatcher: RefCell<Dispatcher>,
    wheel: RefCell<TimingWheel>,
    clock: EventClock,
    tx_queue: RefCell<VecDeque<TxWork<T::Route>>>,
    pending_cbs: RefCell<VecDeque<PendingCb>>,
    expired_scratch: RefCell<Vec<TimerEntry>>,

    pool: Arc<BufferPool>,
    fault: FaultInjection,
    transport_fatal: Cell<bool>,

    // Nexus plumbing.
    sm_rx: RefCell<BReceiver<SmWorkItem>>,
    sm_socket: std::net::UdpSocket,
    nexus_hooks: Arc<Mutex<std::collections::HashMap<u8, BSender<SmWorkItem>>>>,
    sm_udp_port: u16,
    pkt_drop_prob: f64,
    bg_tx: Option<mpsc::Sender<BgWork<C>>>,
    bg_done_tx: mpsc::Sender<BgComplete>,
    bg_done_rx: mpsc::Receiver<BgComplete>,

    self_endpoint: SmEndpoint,
    data_per_pkt: usize,
}

impl<T: Transport, C: Send + 'static> Rpc<T, C> {
    /// Create a runtime registered with `nexus` under `app_tid`.
    ///
    /// `context` is handed (behind its mutex) to every handler and
    /// callback; `sm_handler` receives session lifecycle events.
    pub fn new(
        nexus: &Nexus<C>,
        context: Arc<Mutex<C>>,
        app_tid: u8,
        sm_handler: SmHandlerFn<C>,
        config: RpcConfig,
    ) -> Result<Self> {
        if config.session_credits == 0 {
            return Err(Error::InvalidArgument("session_credits must be positive"));
        }
        if config.phy_port >= MAX_PHY_PORTS {
            return Err(Error::InvalidArgument("phy_port out of range"));
        }
        if config.max_msg_size == 0 || config.max_msg_size > MAX_WIRE_MSG_SIZE {
            return Err(Error::InvalidArgument("max_msg_size out of range"));
        }

        let transport = T::open(&config)?;
        let data_per_pkt = transport.max_data_per_pkt();
        let hook = nexus.register_rpc(app_tid)?;

        let self_endpoint = SmEndpoint::new(
            &directory::get_hostname(),
            hook.udp_port,
            config.phy_port,
            app_tid,
        );

        let mut wheel = TimingWheel::default_for_rpc();
        wheel.init(0);

        Ok(Self {
            app_tid,
            context,
            sm_handler,
            ops: hook.ops,
            transport: RefCell::new(transport),
            sessions: RefCell::new(SessionTable::new(config.max_sessions)),
            dispatcher: RefCell::new(Dispatcher::new(config.unexp_pkt_window)),
            wheel: RefCell::new(wheel),
            clock: EventClock::new(),
            tx_queue: RefCell::new(VecDeque::new()),
            pending_cbs: RefCell::new(VecDeque::new()),
            expired_scratch: RefCell::new(Vec::new()),
            pool: hook.pool,
            fault: FaultInjection::default(),
            transport_fatal: Cell::new(false),
            sm_rx: RefCell::new(hook.sm_rx),
            sm_socket: hook.socket,
            nexus_hooks: hook.hooks,
            sm_udp_port: hook.udp_port,
            pkt_drop_prob: hook.pkt_drop_prob,
            bg_tx: hook.bg_tx,
            bg_done_tx: hook.bg_done_tx,
            bg_done_rx: hook.bg_done_rx,
            self_endpoint,
            data_per_pkt,
            config,
        })
    }

    /// App-level thread id distinguishing co-located runtimes.
    pub fn app_tid(&self) -> u8 {
        self.app_tid
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Payload bytes per packet on this transport.
    pub fn max_data_per_pkt(&self) -> usize {
        self.data_per_pkt
    }

    /// Fault switches for tests.
    pub fn fault_injection(&self) -> &FaultInjection {
        &self.fault
    }

    /// Silent-drop counters.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.borrow().stats
    }

    /// Human-readable form of a datapath error code.
    pub fn err_str(err: &Error) -> String {
        err.to_string()
    }

    #[inline]
    fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    // =========================================================================
    // MsgBuffer management
    // =========================================================================

    /// Allocate a dynamic MsgBuffer able to hold `max_data_size` bytes.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> Result<MsgBuffer> {
        if max_data_size > self.config.max_msg_size {
            return Err(Error::InvalidArgument("message exceeds max_msg_size"));
        }
        buffer::alloc_msg_buffer(&self.pool, max_data_size, self.data_per_pkt)
    }

    /// Free a dynamic MsgBuffer back to the pool. No-op on fake buffers.
    pub fn free_msg_buffer(&self, msgbuf: &mut MsgBuffer) -> Result<()> {
        if msgbuf.is_fake() {
            return Ok(());
        }
        if !msgbuf.is_valid_dynamic() {
            return Err(Error::InvalidArgument("not a valid dynamic MsgBuffer"));
        }
        self.purge_tx_for(msgbuf);
        buffer::free_msg_buffer(&self.pool, msgbuf);
        Ok(())
    }

    /// Shrink a MsgBuffer to `new_data_size` payload bytes without
    /// reallocating. Illegal on a buffer with an enqueued request.
    pub fn resize_msg_buffer(&self, msgbuf: &mut MsgBuffer, new_data_size: usize) -> Result<()> {
        if !msgbuf.is_valid_dynamic() {
            return Err(Error::InvalidArgument("not a valid dynamic MsgBuffer"));
        }
        if new_data_size > msgbuf.max_data_size() {
            return Err(Error::InvalidArgument("resize beyond allocation"));
        }
        let num_pkts = PktHdr::calc_num_pkts(new_data_size, self.data_per_pkt);
        if num_pkts > msgbuf.max_num_pkts() {
            return Err(Error::InvalidArgument("resize beyond packet cap"));
        }
        msgbuf.resize(new_data_size, num_pkts);
        Ok(())
    }

    // =========================================================================
    // Session management: client API
    // =========================================================================

    /// Open a session to the runtime `(peer_hostname, peer_app_tid)` on
    /// fabric port `peer_phy_port`. Returns the local session number;
    /// connection failures are reported asynchronously through the
    /// session-management callback.
    pub fn create_session(
        &self,
        peer_hostname: &str,
        peer_app_tid: u8,
        peer_phy_port: u8,
    ) -> Result<i32> {
        if peer_hostname.is_empty() || peer_hostname.len() > MAX_HOSTNAME_LEN {
            return Err(Error::InvalidArgument("bad peer hostname"));
        }
        if peer_phy_port >= MAX_PHY_PORTS {
            return Err(Error::InvalidArgument("peer phy_port out of range"));
        }
        if self.transport_fatal.get() {
            return Err(Error::InvalidArgument("transport has failed"));
        }

        let session_num = {
            let mut sessions = self.sessions.borrow_mut();
            let session_num = sessions
                .alloc_session_num()
                .ok_or(Error::InvalidArgument("too many sessions"))?;

            let peer_endpoint = SmEndpoint::new(
                peer_hostname,
                self.sm_udp_port,
                peer_phy_port,
                peer_app_tid,
            );
            let mut session = Session::new_client(
                session_num,
                self.self_endpoint,
                peer_endpoint,
                self.config.session_credits,
            );
            session.state = SessionState::ConnectInProgress;

            match directory::lookup(peer_hostname, self.sm_udp_port) {
                Ok(addr) => {
                    session.peer_sm_addr = Some(addr);
                    sessions.insert(session);
                }
                Err(_) => {
                    // Deferred failure: no peer was reached, so there is
                    // nothing to free remotely.
                    sessions.insert(session);
                    self.pending_cbs.borrow_mut().push_back(PendingCb {
                        session_num,
                        event: SmEventType::ConnectFailed,
                        err: SmErrType::RoutingResolutionFailure,
                        bury: true,
                        notify: true,
                    });
                    return Ok(session_num as i32);
                }
            }
            session_num
        };

        self.sm_send_request(session_num, SmPktType::ConnectRequest);
        self.arm_sm_retx(session_num, SmPktType::ConnectRequest);
        debug!("session {session_num}: connect sent to {peer_hostname}/{peer_app_tid}");
        Ok(session_num as i32)
    }

    /// Start a graceful disconnect. Legal only once the session is
    /// connected (or errored); rejected while a connect is in flight.
    pub fn destroy_session(&self, session_num: i32) -> Result<()> {
        let session_num = u16::try_from(session_num)
            .map_err(|_| Error::InvalidArgument("bad session number"))?;

        {
            let mut sessions = self.sessions.borrow_mut();
            let session = sessions
                .get_mut(session_num)
                .ok_or(Error::InvalidArgument("no such session"))?;
            if !session.is_client {
                return Err(Error::InvalidArgument("not a client session"));
            }
            match session.state {
                SessionState::Connected | SessionState::Errored => {
                    session.state = SessionState::DisconnectInProgress;
                }
                _ => return Err(Error::InvalidArgument("session not connected")),
            }
        }

        self.sm_send_request(session_num, SmPktType::DisconnectRequest);
        self.arm_sm_retx(session_num, SmPktType::DisconnectRequest);
        debug!("session {session_num}: disconnect sent");
        Ok(())
    }

    /// Sessions that have not reached `Disconnected`.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions.borrow().num_active()
    }

    // =========================================================================
    // Datapath: enqueue
    // =========================================================================

    /// Enqueue a request on a connected session. Consumes one credit; the
    /// buffer must stay valid and unmodified until the response handler
    /// runs for it.
    pub fn enqueue_request(
        &self,
        session_num: i32,
        req_type: u8,
        req_msgbuf: &mut MsgBuffer,
    ) -> Result<()> {
        let session_num = u16::try_from(session_num)
            .map_err(|_| Error::InvalidArgument("bad session number"))?;
        if self.ops[req_type as usize].is_none() {
            return Err(Error::InvalidArgument("unregistered request type"));
        }
        if !req_msgbuf.is_valid_dynamic() {
            return Err(Error::InvalidArgument("not a valid dynamic MsgBuffer"));
        }
        if req_msgbuf.data_size() == 0 || req_msgbuf.data_size() > self.config.max_msg_size {
            return Err(Error::InvalidArgument("bad request size"));
        }

        let mut sessions = self.sessions.borrow_mut();
        let session = sessions
            .get_mut(session_num)
            .ok_or(Error::InvalidArgument("no such session"))?;
        if !session.is_client || !session.is_connected() {
            return Err(Error::InvalidArgument("session not connected"));
        }
        if !session.has_credits() {
            return Err(Error::NoCredits);
        }

        session.consume_credit();
        let (slot_idx, req_num) = session
            .start_request(req_type)
            .expect("credit held but no free slot");
        let route = session.route.expect("connected session has a route");
        let dest = session.remote_session_num;

        Self::stamp_msg_headers(
            req_msgbuf,
            PktType::Req,
            req_type,
            dest,
            req_num,
            self.data_per_pkt,
        );
        session.req_slots[slot_idx].tx_msgbuf = req_msgbuf.clone_view();
        drop(sessions);

        self.queue_msg_pkts(route, req_msgbuf, 0..req_msgbuf.num_pkts());
        self.wheel.borrow_mut().insert(TimerEntry {
            kind: TimerKind::RequestRto {
                session_num,
                slot_idx,
                req_num,
            },
            expires_at: self.now_us() + self.config.rto_us,
        });
        trace!("session {session_num}: request {req_num} enqueued ({} pkts)", req_msgbuf.num_pkts());
        Ok(())
    }

    /// Enqueue a response for a request received on `session_num`.
    /// Normally invoked by the runtime itself right after the request
    /// handler returns; exposed for handlers that stage responses
    /// elsewhere. The buffer becomes runtime-owned.
    pub fn enqueue_response(
        &self,
        session_num: i32,
        req_num: u64,
        req_type: u8,
        resp_msgbuf: &mut MsgBuffer,
    ) -> Result<()> {
        let session_num = u16::try_from(session_num)
            .map_err(|_| Error::InvalidArgument("bad session number"))?;
        if !resp_msgbuf.is_valid_dynamic() {
            return Err(Error::InvalidArgument("not a valid dynamic MsgBuffer"));
        }
        let owned = resp_msgbuf.clone_view();
        // The caller's view is buried; the retained copy is freed on slot
        // reuse or session teardown.
        resp_msgbuf.bury();
        self.enqueue_response_owned(session_num, req_num, req_type, owned, false)
    }

    fn enqueue_response_owned(
        &self,
        session_num: u16,
        req_num: u64,
        req_type: u8,
        mut resp_msgbuf: MsgBuffer,
        is_prealloc: bool,
    ) -> Result<()> {
        let mut sessions = self.sessions.borrow_mut();
        let session = match sessions.get_mut(session_num) {
            Some(s) if s.is_connected() && !s.is_client => s,
            _ => {
                // Session died while the handler ran; reclaim and move on.
                drop(sessions);
                if !is_prealloc {
                    buffer::free_msg_buffer(&self.pool, &mut resp_msgbuf);
                }
                return Err(Error::InvalidArgument("session not connected"));
            }
        };

        let dest = session.remote_session_num;
        let route = session.route.expect("connected session has a route");
        Self::stamp_msg_headers(
            &mut resp_msgbuf,
            PktType::Resp,
            req_type,
            dest,
            req_num,
            self.data_per_pkt,
        );

        let slot_idx = session.slot_of(req_num);
        let slot = &mut session.resp_slots[slot_idx];
        slot.in_progress = false;
        slot.done_req_num = Some(req_num);

        // Retire the previously retained response.
        let mut old = std::mem::replace(&mut slot.resp_msgbuf, MsgBuffer::invalid());
        let old_was_prealloc = slot.resp_is_prealloc;
        slot.resp_is_prealloc = is_prealloc;
        slot.resp_msgbuf = resp_msgbuf.clone_view();
        let num_pkts = resp_msgbuf.num_pkts();
        drop(sessions);

        if old.is_valid_dynamic() && !old_was_prealloc {
            self.purge_tx_for(&old);
            buffer::free_msg_buffer(&self.pool, &mut old);
        }

        self.queue_msg_pkts(route, &resp_msgbuf, 0..num_pkts);
        trace!("session {session_num}: response {req_num} enqueued ({num_pkts} pkts)");
        Ok(())
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run one pass: drain a receive burst, pump the control plane, fire
    /// due timers, flush transmissions and deliver pending callbacks.
    pub fn run_event_loop_one(&self) {
        self.pump_rx();
        self.pump_sm();
        self.pump_timers();
        self.pump_tx();
        self.pump_callbacks();

        #[cfg(debug_assertions)]
        self.check_invariants();
    }

    /// Repeat `run_event_loop_one` until `timeout_ms` elapses. Returns
    /// promptly at the deadline even if work remains queued.
    pub fn run_event_loop_timeout(&self, timeout_ms: u64) {
        let deadline = self.now_us() + timeout_ms * 1000;
        loop {
            self.run_event_loop_one();
            if self.now_us() >= deadline {
                return;
            }
            std::thread::sleep(std::time::Duration::from_micros(50));
        }
    }

    fn pump_rx(&self) {
        if self.transport_fatal.get() {
            return;
        }
        let n = match self.transport.borrow_mut().rx_burst() {
            Ok(n) => n,
            Err(e) => {
                self.latch_transport_fatal(e);
                return;
            }
        };
        for i in 0..n {
            // Raw parts so the transport borrow is not held across
            // dispatch; the ring slot stays valid until the next burst.
            let (ptr, len) = {
                let transport = self.transport.borrow();
                let pkt = transport.rx_pkt(i);
                (pkt.as_ptr(), pkt.len())
            };
            self.process_rx_pkt(ptr, len);
        }
    }

    fn pump_sm(&self) {
        loop {
            let item = match self.sm_rx.borrow_mut().try_recv() {
                Ok(item) => item,
                Err(_) => break,
            };
            self.handle_sm_pkt(item.pkt, Some(item.src));
        }
    }

    fn pump_timers(&self) {
        // Reuse the scratch buffer, but do not hold its borrow while the
        // timer handlers run.
        let mut expired = std::mem::take(&mut *self.expired_scratch.borrow_mut());
        expired.clear();
        self.wheel
            .borrow_mut()
            .advance_into(self.now_us(), &mut expired);

        for entry in &expired {
            match entry.kind {
                TimerKind::RequestRto {
                    session_num,
                    slot_idx,
                    req_num,
                } => self.on_request_rto(session_num, slot_idx, req_num),
                TimerKind::SmRetx {
                    session_num,
                    attempt,
                } => self.on_sm_retx(session_num, attempt),
                TimerKind::ReasmExpire {
                    session_num,
                    req_num,
                } => self.on_reasm_expire(session_num, req_num),
            }
        }

        *self.expired_scratch.borrow_mut() = expired;
    }

    fn pump_tx(&self) {
        if self.transport_fatal.get() {
            self.tx_queue.borrow_mut().clear();
            return;
        }
        loop {
            let works: Vec<TxWork<T::Route>> = {
                let mut queue = self.tx_queue.borrow_mut();
                let n = queue.len().min(TX_BATCH_SIZE);
                if n == 0 {
                    return;
                }
                queue.drain(..n).collect()
            };

            let batch: Vec<TxPacket<'_, T::Route>> = works
                .iter()
                .map(|w| TxPacket {
                    route: w.route,
                    hdr: match &w.hdr {
                        TxHdr::Ptr(p) => unsafe {
                            std::slice::from_raw_parts(*p, PKT_HDR_SIZE)
                        },
                        TxHdr::Inline(bytes) => &bytes[..],
                    },
                    payload: if w.payload_len == 0 {
                        &[]
                    } else {
                        unsafe { std::slice::from_raw_parts(w.payload, w.payload_len) }
                    },
                })
                .collect();

            let sent = match self.transport.borrow_mut().tx_burst(&batch) {
                Ok(sent) => sent,
                Err(e) => {
                    drop(batch);
                    self.latch_transport_fatal(e);
                    return;
                }
            };
            drop(batch);

            if sent < works.len() {
                // Transport backpressure: requeue the tail in order.
                let mut queue = self.tx_queue.borrow_mut();
                for w in works.into_iter().skip(sent).rev() {
                    queue.push_front(w);
                }
                return;
            }
        }
    }

    fn pump_callbacks(&self) {
        loop {
            let cb = match self.pending_cbs.borrow_mut().pop_front() {
                Some(cb) => cb,
                None => break,
            };
            if cb.bury {
                if let Some(mut session) = self.sessions.borrow_mut().remove(cb.session_num) {
                    session.state = SessionState::Disconnected;
                    self.reclaim_session_buffers(&mut session);
                }
            }
            if cb.notify {
                self.invoke_sm_handler(cb.session_num, cb.event, cb.err);
            }
        }

        // Finished background handlers.
        while let Ok(done) = self.bg_done_rx.try_recv() {
            self.complete_bg_work(done);
        }
    }

    // =========================================================================
    // Receive classification
    // =========================================================================

    fn process_rx_pkt(&self, ptr: *const u8, len: usize) {
        if len < PKT_HDR_SIZE {
            self.dispatcher.borrow_mut().stats.bad_pkts += 1;
            return;
        }
        let hdr = unsafe { PktHdr::read_from(ptr) };
        if !hdr.check_magic() {
            self.dispatcher.borrow_mut().stats.bad_pkts += 1;
            return;
        }
        let pkt_type = match hdr.pkt_type() {
            Ok(t) => t,
            Err(_) => {
                self.dispatcher.borrow_mut().stats.bad_pkts += 1;
                return;
            }
        };

        if pkt_type == PktType::SessionMgmt {
            // SM envelope carried on the datapath; replies are routed
            // through the directory since the fabric source is opaque.
            let payload = unsafe {
                std::slice::from_raw_parts(ptr.add(PKT_HDR_SIZE), len - PKT_HDR_SIZE)
            };
            match SmPkt::decode(payload) {
                Ok(pkt) => self.handle_sm_pkt(pkt, None),
                Err(_) => self.dispatcher.borrow_mut().stats.bad_pkts += 1,
            }
            return;
        }

        let session_num = hdr.dest_session_num();
        let payload_len = len - PKT_HDR_SIZE;
        let payload = unsafe { ptr.add(PKT_HDR_SIZE) };

        // Session gate: drop traffic for missing or non-connected
        // sessions, returning the credit for requests so the peer's
        // window does not wedge on a dead session.
        {
            let sessions = self.sessions.borrow();
            let session = sessions.get(session_num);
            let connected = session.map(|s| s.is_connected()).unwrap_or(false);
            if !connected {
                self.dispatcher.borrow_mut().stats.no_session_drops += 1;
                if hdr.is_req() {
                    if let Some(s) = session {
                        if let Some(route) = s.route {
                            let cr = PktHdr::new(
                                PktType::ExplCreditReturn,
                                hdr.req_type(),
                                0,
                                s.remote_session_num,
                                0,
                                hdr.req_num(),
                            );
                            drop(sessions);
                            self.queue_ctrl_pkt(route, cr);
                        }
                    }
                }
                return;
            }
        }

        match pkt_type {
            PktType::Req => self.handle_req_pkt(session_num, &hdr, ptr, payload, payload_len),
            PktType::Resp => self.handle_resp_pkt(session_num, &hdr, ptr, payload, payload_len),
            PktType::ExplCreditReturn => self.handle_credit_return(session_num, &hdr),
            PktType::ReqForResp => self.handle_req_for_resp(session_num, &hdr),
            PktType::SessionMgmt => unreachable!(),
        }
    }

    fn handle_req_pkt(
        &self,
        session_num: u16,
        hdr: &PktHdr,
        pkt_ptr: *const u8,
        payload: *const u8,
        payload_len: usize,
    ) {
        let req_num = hdr.req_num();
        let msg_size = hdr.msg_size();
        let expected_pkts = PktHdr::calc_num_pkts(msg_size, self.data_per_pkt);
        let key = (session_num, req_num);

        enum Action<R> {
            Drop,
            Replay { route: R },
            Continue,
            NewSingle,
            NewMulti,
        }

        let action = {
            let mut sessions = self.sessions.borrow_mut();
            let session = match sessions.get_mut(session_num) {
                Some(s) if !s.is_client => s,
                _ => {
                    self.dispatcher.borrow_mut().stats.bad_pkts += 1;
                    return;
                }
            };
            let route = session.route.expect("connected session has a route");
            let slot_idx = session.slot_of(req_num);
            let slot = &mut session.resp_slots[slot_idx];

            if slot.done_req_num == Some(req_num) {
                // Retransmitted request we already answered: replay.
                Action::Replay { route }
            } else if slot.done_req_num.is_some_and(|d| req_num < d) {
                self.dispatcher.borrow_mut().stats.stale_resp_drops += 1;
                Action::Drop
            } else if slot.in_progress && slot.cur_req_num == req_num {
                if expected_pkts > 1 {
                    Action::Continue
                } else {
                    // Duplicate of a single-packet request mid-handler.
                    self.dispatcher.borrow_mut().stats.dup_pkt_drops += 1;
                    Action::Drop
                }
            } else if slot.in_progress {
                // The slot is busy with a different in-flight request;
                // drop silently and let the peer retransmit.
                self.dispatcher.borrow_mut().stats.slot_busy_drops += 1;
                Action::Drop
            } else if expected_pkts == 1 {
                slot.in_progress = true;
                slot.cur_req_num = req_num;
                Action::NewSingle
            } else if !self.dispatcher.borrow().window_has_room() {
                self.dispatcher.borrow_mut().stats.unexp_window_drops += 1;
                Action::Drop
            } else {
                slot.in_progress = true;
                slot.cur_req_num = req_num;
                Action::NewMulti
            }
        };

        let is_new = matches!(action, Action::NewMulti);
        match action {
            Action::Drop => {}
            Action::Replay { route } => {
                self.dispatcher.borrow_mut().stats.resp_replays += 1;
                self.replay_response(session_num, req_num, route);
            }
            Action::NewSingle => {
                if payload_len != msg_size {
                    self.dispatcher.borrow_mut().stats.bad_pkts += 1;
                    self.clear_resp_slot_progress(session_num, req_num);
                    return;
                }
                let fake = unsafe { MsgBuffer::fake(pkt_ptr as *mut u8, msg_size) };
                self.dispatch_request(session_num, req_num, hdr.req_type(), fake);
            }
            Action::NewMulti | Action::Continue => {
                if is_new {
                    let mut msgbuf =
                        match buffer::alloc_msg_buffer(&self.pool, msg_size, self.data_per_pkt) {
                            Ok(m) => m,
                            Err(_) => {
                                warn!("request reassembly alloc failed; dropping");
                                self.clear_resp_slot_progress(session_num, req_num);
                                return;
                            }
                        };
                    {
                        let h = msgbuf.pkthdr_mut(0);
                        h.set_req_type(hdr.req_type());
                        h.set_req_num(req_num);
                        h.set_msg_size(msg_size);
                    }
                    self.dispatcher.borrow_mut().reasm_insert(
                        key,
                        ReasmEntry {
                            msgbuf,
                            bitmap: PktBitmap::new(expected_pkts),
                            expected_pkts,
                            last_progress_us: self.now_us(),
                        },
                    );
                    self.wheel.borrow_mut().insert(TimerEntry {
                        kind: TimerKind::ReasmExpire {
                            session_num,
                            req_num,
                        },
                        expires_at: self.now_us() + self.config.reasm_timeout_us,
                    });
                }
                self.offer_reasm_pkt(key, hdr, payload, payload_len);
            }
        }
    }

    /// Feed one packet into an in-progress request reassembly; dispatch on
    /// completion.
    fn offer_reasm_pkt(&self, key: (u16, u64), hdr: &PktHdr, payload: *const u8, payload_len: usize) {
        let pkt_num = hdr.pkt_num() as usize;
        let msg_size = hdr.msg_size();
        let now = self.now_us();

        let completed = {
            let mut dispatcher = self.dispatcher.borrow_mut();
            let entry = match dispatcher.reasm_get_mut(key) {
                Some(e) => e,
                None => return,
            };
            if pkt_num >= entry.expected_pkts
                || payload_len != PktHdr::pkt_payload_len(msg_size, self.data_per_pkt, pkt_num)
            {
                dispatcher.stats.bad_pkts += 1;
                return;
            }
            if !entry.bitmap.set(pkt_num) {
                dispatcher.stats.dup_pkt_drops += 1;
                return;
            }
            entry.last_progress_us = now;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload,
                    entry.msgbuf.payload_ptr(pkt_num * self.data_per_pkt),
                    payload_len,
                );
            }
            if entry.is_complete() {
                dispatcher.reasm_remove(key)
            } else {
                None
            }
        };

        if let Some(entry) = completed {
            let (session_num, req_num) = key;
            self.dispatch_request(session_num, req_num, hdr.req_type(), entry.msgbuf);
        }
    }

    /// Run (or offload) the request handler for a fully received request.
    fn dispatch_request(&self, session_num: u16, req_num: u64, req_type: u8, req_msgbuf: MsgBuffer) {
        let ops = match self.ops[req_type as usize] {
            Some(ops) => ops,
            None => {
                debug!("no handler for req_type {req_type}; dropping request");
                let mut msgbuf = req_msgbuf;
                if msgbuf.is_dynamic() {
                    buffer::free_msg_buffer(&self.pool, &mut msgbuf);
                }
                self.clear_resp_slot_progress(session_num, req_num);
                return;
            }
        };

        if ops.run_in_background {
            if let Some(bg_tx) = &self.bg_tx {
                // Background handlers need an owned buffer; fakes point
                // into the receive ring and must be copied out.
                let mut owned = req_msgbuf;
                if owned.is_fake() {
                    match buffer::alloc_msg_buffer(&self.pool, owned.data_size(), self.data_per_pkt)
                    {
                        Ok(mut copy) => {
                            copy.data_mut().copy_from_slice(owned.data());
                            {
                                let h = copy.pkthdr_mut(0);
                                h.set_req_type(req_type);
                                h.set_req_num(req_num);
                                h.set_msg_size(owned.data_size());
                            }
                            owned = copy;
                        }
                        Err(_) => {
                            warn!("background copy alloc failed; dropping request");
                            self.clear_resp_slot_progress(session_num, req_num);
                            return;
                        }
                    }
                }
                let work = BgWork {
                    ops,
                    context: Arc::clone(&self.context),
                    pool: Arc::clone(&self.pool),
                    data_per_pkt: self.data_per_pkt,
                    max_msg_size: self.config.max_msg_size,
                    session_num,
                    req_num,
                    req_type,
                    req_msgbuf: owned,
                    done_tx: self.bg_done_tx.clone(),
                };
                if bg_tx.send(work).is_ok() {
                    return;
                }
                warn!("background pool unavailable; request dropped");
                self.clear_resp_slot_progress(session_num, req_num);
                return;
            }
            // Fall through to inline execution when the Nexus has no
            // background threads.
        }

        // Inline execution on the event-loop thread.
        let pre_resp = self.take_pre_resp(session_num, req_num);
        let mut resp = AppResponse::with_prealloc(pre_resp);
        {
            let handle = ReqHandle::new(
                &req_msgbuf,
                &self.pool,
                self.data_per_pkt,
                self.config.max_msg_size,
                session_num,
                req_num,
                req_type,
            );
            let mut ctx = self.context.lock().unwrap();
            (ops.req_handler)(&handle, &mut resp, &mut ctx);
        }

        let mut req_msgbuf = req_msgbuf;
        if req_msgbuf.is_dynamic() {
            buffer::free_msg_buffer(&self.pool, &mut req_msgbuf);
        }
        self.finish_response(session_num, req_num, req_type, resp);
    }

    /// Detach the slot's pre-allocated response buffer (allocating it on
    /// first use) for the duration of a handler invocation.
    fn take_pre_resp(&self, session_num: u16, req_num: u64) -> MsgBuffer {
        let mut sessions = self.sessions.borrow_mut();
        let Some(session) = sessions.get_mut(session_num) else {
            return MsgBuffer::invalid();
        };
        let slot_idx = session.slot_of(req_num);
        let slot = &mut session.resp_slots[slot_idx];
        if !slot.pre_resp_msgbuf.is_valid() {
            drop(sessions);
            let pre = buffer::alloc_msg_buffer(&self.pool, self.data_per_pkt, self.data_per_pkt)
                .unwrap_or_else(|_| MsgBuffer::invalid());
            let mut sessions = self.sessions.borrow_mut();
            if let Some(session) = sessions.get_mut(session_num) {
                let slot_idx = session.slot_of(req_num);
                let slot = &mut session.resp_slots[slot_idx];
                slot.pre_resp_msgbuf = pre.clone_view();
            }
            return pre;
        }
        let mut pre = slot.pre_resp_msgbuf.clone_view();
        pre.resize(pre.max_data_size(), 1);
        pre
    }

    /// Turn a filled `AppResponse` into an outgoing response.
    fn finish_response(&self, session_num: u16, req_num: u64, req_type: u8, resp: AppResponse) {
        let AppResponse {
            prealloc_used,
            pre_resp_msgbuf,
            mut dyn_resp_msgbuf,
        } = resp;

        if prealloc_used {
            if dyn_resp_msgbuf.is_valid_dynamic() {
                buffer::free_msg_buffer(&self.pool, &mut dyn_resp_msgbuf);
            }
            if !pre_resp_msgbuf.is_valid() {
                warn!("prealloc_used with no pre-allocated buffer; dropping response");
                self.clear_resp_slot_progress(session_num, req_num);
                return;
            }
            let _ = self.enqueue_response_owned(session_num, req_num, req_type, pre_resp_msgbuf, true);
        } else if dyn_resp_msgbuf.is_valid_dynamic() {
            let _ =
                self.enqueue_response_owned(session_num, req_num, req_type, dyn_resp_msgbuf, false);
        } else {
            // Handler produced nothing; release the slot so a retransmit
            // can try again.
            debug!("request handler produced no response");
            self.clear_resp_slot_progress(session_num, req_num);
        }
    }

    fn clear_resp_slot_progress(&self, session_num: u16, req_num: u64) {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(session) = sessions.get_mut(session_num) {
            if !session.resp_slots.is_empty() {
                let slot_idx = session.slot_of(req_num);
                let slot = &mut session.resp_slots[slot_idx];
                if slot.in_progress && slot.cur_req_num == req_num {
                    slot.in_progress = false;
                }
            }
        }
    }

    /// Re-send the retained response for a duplicate request.
    fn replay_response(&self, session_num: u16, req_num: u64, route: T::Route) {
        let sessions = self.sessions.borrow();
        let Some(session) = sessions.get(session_num) else {
            return;
        };
        let slot = &session.resp_slots[session.slot_of(req_num)];
        if slot.resp_msgbuf.is_valid() {
            let resp = slot.resp_msgbuf.clone_view();
            drop(sessions);
            self.queue_msg_pkts(route, &resp, 0..resp.num_pkts());
        }
    }

    fn handle_resp_pkt(
        &self,
        session_num: u16,
        hdr: &PktHdr,
        pkt_ptr: *const u8,
        payload: *const u8,
        payload_len: usize,
    ) {
        let req_num = hdr.req_num();
        let msg_size = hdr.msg_size();
        let pkt_num = hdr.pkt_num() as usize;
        let expected_pkts = PktHdr::calc_num_pkts(msg_size, self.data_per_pkt);

        let mut sessions = self.sessions.borrow_mut();
        let session = match sessions.get_mut(session_num) {
            Some(s) if s.is_client => s,
            _ => {
                self.dispatcher.borrow_mut().stats.bad_pkts += 1;
                return;
            }
        };
        let Some(slot_idx) = session.find_req_slot(req_num) else {
            // Stale retransmit for a slot that moved on.
            self.dispatcher.borrow_mut().stats.stale_resp_drops += 1;
            return;
        };
        if pkt_num >= expected_pkts
            || payload_len != PktHdr::pkt_payload_len(msg_size, self.data_per_pkt, pkt_num)
        {
            self.dispatcher.borrow_mut().stats.bad_pkts += 1;
            return;
        }

        if expected_pkts == 1 {
            // Single-packet response: deliver straight off the receive
            // ring through the slot's fake response view.
            let req_view = {
                let slot = &mut session.req_slots[slot_idx];
                std::mem::replace(&mut slot.tx_msgbuf, MsgBuffer::invalid())
            };
            session.return_credit();
            session.req_slots[slot_idx].reset();
            let req_type = hdr.req_type();
            drop(sessions);

            let resp_view = unsafe { MsgBuffer::fake(pkt_ptr as *mut u8, msg_size) };
            self.deliver_response(req_type, &req_view, &resp_view);
            return;
        }

        // Multi-packet response: accumulate into the slot's buffer.
        {
            let slot = &mut session.req_slots[slot_idx];
            if slot.expected_resp_pkts == 0 {
                let mut msgbuf =
                    match buffer::alloc_msg_buffer(&self.pool, msg_size, self.data_per_pkt) {
                        Ok(m) => m,
                        Err(_) => {
                            warn!("response reassembly alloc failed; dropping packet");
                            return;
                        }
                    };
                {
                    let h = msgbuf.pkthdr_mut(0);
                    h.set_req_type(hdr.req_type());
                    h.set_req_num(req_num);
                    h.set_msg_size(msg_size);
                }
                slot.resp_msgbuf = msgbuf;
                slot.resp_bitmap = PktBitmap::new(expected_pkts);
                slot.expected_resp_pkts = expected_pkts;
            }
            if !slot.resp_bitmap.set(pkt_num) {
                drop(sessions);
                self.dispatcher.borrow_mut().stats.dup_pkt_drops += 1;
                return;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload,
                    slot.resp_msgbuf.payload_ptr(pkt_num * self.data_per_pkt),
                    payload_len,
                );
            }
            if slot.resp_bitmap.count() < slot.expected_resp_pkts {
                return;
            }
        }

        // Complete: free the slot and the credit before delivering.
        let (req_view, mut resp_msgbuf) = {
            let slot = &mut session.req_slots[slot_idx];
            let req_view = std::mem::replace(&mut slot.tx_msgbuf, MsgBuffer::invalid());
            let resp = std::mem::replace(&mut slot.resp_msgbuf, MsgBuffer::invalid());
            (req_view, resp)
        };
        session.return_credit();
        session.req_slots[slot_idx].reset();
        let req_type = hdr.req_type();
        drop(sessions);

        self.deliver_response(req_type, &req_view, &resp_msgbuf);
        buffer::free_msg_buffer(&self.pool, &mut resp_msgbuf);
    }

    /// Invoke the response continuation for `req_type`.
    fn deliver_response(&self, req_type: u8, req_msgbuf: &MsgBuffer, resp_msgbuf: &MsgBuffer) {
        if let Some(ops) = self.ops[req_type as usize] {
            let mut ctx = self.context.lock().unwrap();
            (ops.resp_handler)(req_msgbuf, resp_msgbuf, &mut ctx);
        }
    }

    /// Explicit credit return: the peer will never answer this request.
    fn handle_credit_return(&self, session_num: u16, hdr: &PktHdr) {
        let mut sessions = self.sessions.borrow_mut();
        let Some(session) = sessions.get_mut(session_num) else {
            return;
        };
        if !session.is_client {
            return;
        }
        if let Some(slot_idx) = session.find_req_slot(hdr.req_num()) {
            let mut resp = {
                let slot = &mut session.req_slots[slot_idx];
                std::mem::replace(&mut slot.resp_msgbuf, MsgBuffer::invalid())
            };
            session.return_credit();
            session.req_slots[slot_idx].reset();
            drop(sessions);
            if resp.is_valid_dynamic() {
                buffer::free_msg_buffer(&self.pool, &mut resp);
            }
            debug!("session {session_num}: request {} abandoned via credit return", hdr.req_num());
        }
    }

    /// The client wants one response packet re-sent.
    fn handle_req_for_resp(&self, session_num: u16, hdr: &PktHdr) {
        let sessions = self.sessions.borrow();
        let Some(session) = sessions.get(session_num) else {
            return;
        };
        if session.is_client || session.resp_slots.is_empty() {
            return;
        }
        let slot = &session.resp_slots[session.slot_of(hdr.req_num())];
        if slot.done_req_num != Some(hdr.req_num()) || !slot.resp_msgbuf.is_valid() {
            return;
        }
        let pkt_num = hdr.pkt_num() as usize;
        if pkt_num >= slot.resp_msgbuf.num_pkts() {
            return;
        }
        let resp = slot.resp_msgbuf.clone_view();
        let route = session.route.expect("connected session has a route");
        drop(sessions);
        self.queue_msg_pkts(route, &resp, pkt_num..pkt_num + 1);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn on_request_rto(&self, session_num: u16, slot_idx: usize, req_num: u64) {
        let action = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(session) = sessions.get_mut(session_num) else {
                return;
            };
            if !session.is_client || session.state != SessionState::Connected {
                return;
            }
            let slot = match session.req_slots.get_mut(slot_idx) {
                Some(s) if s.occupied && s.req_num == req_num => s,
                _ => return, // Completed or reused; stale timer.
            };
            slot.retries += 1;
            if slot.retries > self.config.max_retries {
                None
            } else {
                let route = session.route.expect("connected session has a route");
                let slot = &session.req_slots[slot_idx];
                if slot.expected_resp_pkts == 0 || slot.resp_bitmap.count() == 0 {
                    // Nothing came back: re-send the whole request.
                    Some((route, slot.tx_msgbuf.clone_view(), None))
                } else {
                    // Partial response: ask for the missing packets.
                    let missing = slot.resp_bitmap.missing(slot.expected_resp_pkts);
                    Some((route, slot.tx_msgbuf.clone_view(), Some(missing)))
                }
            }
        };

        match action {
            None => {
                warn!("session {session_num}: request {req_num} exhausted retries");
                self.error_teardown(session_num);
            }
            Some((route, req_view, missing)) => {
                match missing {
                    None => {
                        self.queue_msg_pkts(route, &req_view, 0..req_view.num_pkts());
                    }
                    Some(missing) => {
                        let sessions = self.sessions.borrow();
                        let Some(session) = sessions.get(session_num) else {
                            return;
                        };
                        let dest = session.remote_session_num;
                        drop(sessions);
                        for pkt_num in missing {
                            let rfr = PktHdr::new(
                                PktType::ReqForResp,
                                req_view.req_type(),
                                0,
                                dest,
                                pkt_num as u16,
                                req_num,
                            );
                            self.queue_ctrl_pkt(route, rfr);
                        }
                    }
                }
                self.wheel.borrow_mut().insert(TimerEntry {
                    kind: TimerKind::RequestRto {
                        session_num,
                        slot_idx,
                        req_num,
                    },
                    expires_at: self.now_us() + self.config.rto_us,
                });
            }
        }
    }

    fn on_sm_retx(&self, session_num: u16, attempt: u32) {
        let resend = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(session) = sessions.get_mut(session_num) else {
                return;
            };
            match session.sm_pending {
                Some(pending) if pending.attempt == attempt => {
                    if attempt + 1 >= self.config.sm_max_attempts {
                        None
                    } else {
                        session.sm_pending = Some(SmPending {
                            kind: pending.kind,
                            attempt: attempt + 1,
                        });
                        Some(pending.kind)
                    }
                }
                _ => return, // Answered or superseded; stale timer.
            }
        };

        match resend {
            None => {
                warn!("session {session_num}: SM exchange exhausted retries");
                self.error_teardown(session_num);
            }
            Some(kind) => {
                self.sm_send_request(session_num, kind);
                let next_attempt = attempt + 1;
                self.wheel.borrow_mut().insert(TimerEntry {
                    kind: TimerKind::SmRetx {
                        session_num,
                        attempt: next_attempt,
                    },
                    expires_at: self.now_us()
                        + backoff_us(
                            self.config.sm_base_rto_us,
                            next_attempt,
                            self.config.sm_rto_cap_us,
                        ),
                });
            }
        }
    }

    fn on_reasm_expire(&self, session_num: u16, req_num: u64) {
        let now = self.now_us();
        let key = (session_num, req_num);
        let expired = {
            let mut dispatcher = self.dispatcher.borrow_mut();
            match dispatcher.reasm_get_mut(key) {
                None => return,
                Some(entry) => {
                    if now.saturating_sub(entry.last_progress_us) >= self.config.reasm_timeout_us {
                        dispatcher.stats.reasm_timeouts += 1;
                        dispatcher.reasm_remove(key)
                    } else {
                        None
                    }
                }
            }
        };

        match expired {
            Some(entry) => {
                let mut msgbuf = entry.msgbuf;
                buffer::free_msg_buffer(&self.pool, &mut msgbuf);
                self.clear_resp_slot_progress(session_num, req_num);
                debug!("session {session_num}: reassembly of request {req_num} timed out");
            }
            None => {
                let last_progress = self
                    .dispatcher
                    .borrow_mut()
                    .reasm_get_mut(key)
                    .map(|e| e.last_progress_us)
                    .unwrap_or(now);
                self.wheel.borrow_mut().insert(TimerEntry {
                    kind: TimerKind::ReasmExpire {
                        session_num,
                        req_num,
                    },
                    expires_at: last_progress + self.config.reasm_timeout_us,
                });
            }
        }
    }

    // =========================================================================
    // Session management protocol
    // =========================================================================

    fn handle_sm_pkt(&self, pkt: SmPkt, src: Option<SocketAddr>) {
        match pkt.pkt_type {
            SmPktType::ConnectRequest => self.server_handle_connect(pkt, src),
            SmPktType::ConnectResponse => self.client_handle_connect_response(pkt),
            SmPktType::DisconnectRequest => self.server_handle_disconnect(pkt, src),
            SmPktType::DisconnectResponse => self.client_handle_disconnect_response(pkt),
        }
    }

    fn sm_reply_addr(&self, pkt: &SmPkt, src: Option<SocketAddr>) -> Option<SocketAddr> {
        src.or_else(|| directory::lookup(pkt.client.hostname(), pkt.client.udp_port).ok())
    }

    fn server_handle_connect(&self, pkt: SmPkt, src: Option<SocketAddr>) {
        let Some(reply_addr) = self.sm_reply_addr(&pkt, src) else {
            return;
        };

        // Idempotence: a retransmitted connect for a session we already
        // admitted is answered with the prior response.
        {
            let sessions = self.sessions.borrow();
            let existing = sessions.iter().find(|s| {
                !s.is_client
                    && s.peer_endpoint == pkt.client
                    && s.remote_session_num == pkt.client_session_num
            });
            if let Some(session) = existing {
                let mut ri = RoutingInfo::default();
                self.transport.borrow().fill_routing_info(&mut ri);
                let resp = pkt.response(SmErrType::NoError, session.local_session_num, ri);
                drop(sessions);
                self.sm_send(&resp, reply_addr);
                return;
            }
        }

        if pkt.server.phy_port != self.config.phy_port {
            let resp = pkt.response(SmErrType::InvalidRemotePort, 0, RoutingInfo::default());
            self.sm_send(&resp, reply_addr);
            return;
        }

        let route = match self.transport.borrow().resolve_routing_info(&pkt.routing_info) {
            Ok(route) => route,
            Err(_) => {
                let resp =
                    pkt.response(SmErrType::RoutingResolutionFailure, 0, RoutingInfo::default());
                self.sm_send(&resp, reply_addr);
                return;
            }
        };

        let mut sessions = self.sessions.borrow_mut();
        let Some(session_num) = sessions.alloc_session_num() else {
            drop(sessions);
            let resp = pkt.response(SmErrType::NoSessionSlots, 0, RoutingInfo::default());
            self.sm_send(&resp, reply_addr);
            return;
        };

        let mut session = Session::new_server(
            session_num,
            pkt.client_session_num,
            self.self_endpoint,
            pkt.client,
            self.config.session_credits,
        );
        session.remote_routing_info = pkt.routing_info;
        session.route = Some(route);
        session.peer_sm_addr = Some(reply_addr);
        sessions.insert(session);
        drop(sessions);

        let mut ri = RoutingInfo::default();
        self.transport.borrow().fill_routing_info(&mut ri);
        let resp = pkt.response(SmErrType::NoError, session_num, ri);
        self.sm_send(&resp, reply_addr);
        debug!(
            "session {session_num}: accepted connect from {}/{}",
            pkt.client.hostname(),
            pkt.client.app_tid
        );
    }

    fn client_handle_connect_response(&self, pkt: SmPkt) {
        let session_num = pkt.client_session_num;
        {
            let mut sessions = self.sessions.borrow_mut();
            let session = match sessions.get_mut(session_num) {
                Some(s) if s.is_client && s.state == SessionState::ConnectInProgress => s,
                _ => return, // Duplicate or late response.
            };
            session.sm_pending = None;

            if pkt.err_type != SmErrType::NoError {
                // Remote rejection: nothing was created server-side, so
                // the session is buried before the callback fires.
                let mut session = sessions.remove(session_num).unwrap();
                session.state = SessionState::Disconnected;
                self.reclaim_session_buffers(&mut session);
                drop(sessions);
                self.invoke_sm_handler(session_num, SmEventType::ConnectFailed, pkt.err_type);
                return;
            }

            let resolved = if self.fault.fail_resolve_rinfo_client() {
                Err(Error::RoutingResolutionFailure)
            } else {
                self.transport.borrow().resolve_routing_info(&pkt.routing_info)
            };

            match resolved {
                Ok(route) => {
                    session.remote_session_num = pkt.server_session_num;
                    session.remote_routing_info = pkt.routing_info;
                    session.route = Some(route);
                    session.state = SessionState::Connected;
                    drop(sessions);
                    self.invoke_sm_handler(session_num, SmEventType::Connected, SmErrType::NoError);
                }
                Err(_) => {
                    // Local resolution failure: the server did create
                    // state, so tear it down over the control plane and
                    // report the failed connect now.
                    session.remote_session_num = pkt.server_session_num;
                    session.state = SessionState::DisconnectInProgress;
                    session.disconnect_silent = true;
                    drop(sessions);
                    self.sm_send_request(session_num, SmPktType::DisconnectRequest);
                    self.arm_sm_retx(session_num, SmPktType::DisconnectRequest);
                    self.invoke_sm_handler(
                        session_num,
                        SmEventType::ConnectFailed,
                        SmErrType::RoutingResolutionFailure,
                    );
                }
            }
        }
    }

    fn server_handle_disconnect(&self, pkt: SmPkt, src: Option<SocketAddr>) {
        let Some(reply_addr) = self.sm_reply_addr(&pkt, src) else {
            return;
        };

        {
            let mut sessions = self.sessions.borrow_mut();
            let found = sessions
                .get(pkt.server_session_num)
                .map(|s| !s.is_client && s.peer_endpoint == pkt.client)
                .unwrap_or(false);
            if found {
                let mut session = sessions.remove(pkt.server_session_num).unwrap();
                session.state = SessionState::Disconnected;
                drop(sessions);
                self.reclaim_session_buffers(&mut session);
                debug!("session {}: disconnected by peer", pkt.server_session_num);
            }
        }

        // Idempotent: unknown sessions still get a synthesized response.
        let resp = pkt.response(SmErrType::NoError, pkt.server_session_num, RoutingInfo::default());
        self.sm_send(&resp, reply_addr);
    }

    fn client_handle_disconnect_response(&self, pkt: SmPkt) {
        let session_num = pkt.client_session_num;
        let silent = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.get_mut(session_num) {
                Some(s) if s.is_client && s.state == SessionState::DisconnectInProgress => {
                    s.sm_pending = None;
                    let mut session = sessions.remove(session_num).unwrap();
                    session.state = SessionState::Disconnected;
                    let silent = session.disconnect_silent;
                    self.reclaim_session_buffers(&mut session);
                    silent
                }
                _ => return,
            }
        };

        if !silent {
            self.invoke_sm_handler(session_num, SmEventType::Disconnected, SmErrType::NoError);
        }
    }

    /// Build and send the pending SM request for a session.
    fn sm_send_request(&self, session_num: u16, kind: SmPktType) {
        let (pkt, addr) = {
            let sessions = self.sessions.borrow();
            let Some(session) = sessions.get(session_num) else {
                return;
            };
            let Some(addr) = session.peer_sm_addr else {
                return;
            };
            let mut ri = RoutingInfo::default();
            self.transport.borrow().fill_routing_info(&mut ri);
            (
                SmPkt {
                    pkt_type: kind,
                    err_type: SmErrType::NoError,
                    client: session.self_endpoint,
                    server: session.peer_endpoint,
                    client_session_num: session.local_session_num,
                    server_session_num: session.remote_session_num,
                    routing_info: ri,
                },
                addr,
            )
        };
        self.sm_send(&pkt, addr);
    }

    /// Arm the retransmission timer for a just-sent SM request.
    fn arm_sm_retx(&self, session_num: u16, kind: SmPktType) {
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(session) = sessions.get_mut(session_num) else {
                return;
            };
            session.sm_pending = Some(SmPending { kind, attempt: 0 });
        }
        self.wheel.borrow_mut().insert(TimerEntry {
            kind: TimerKind::SmRetx {
                session_num,
                attempt: 0,
            },
            expires_at: self.now_us()
                + backoff_us(self.config.sm_base_rto_us, 0, self.config.sm_rto_cap_us),
        });
    }

    /// Transmit one SM envelope, honoring the test-only drop probability.
    fn sm_send(&self, pkt: &SmPkt, dst: SocketAddr) {
        if self.pkt_drop_prob > 0.0 && rand::random::<f64>() < self.pkt_drop_prob {
            debug!("dropping SM {:?} to {dst} (test fault)", pkt.pkt_type);
            return;
        }
        if let Err(e) = self.sm_socket.send_to(&pkt.encode(), dst) {
            debug!("SM send to {dst} failed: {e}");
        }
    }

    // =========================================================================
    // Error latching and teardown
    // =========================================================================

    fn latch_transport_fatal(&self, err: Error) {
        if self.transport_fatal.replace(true) {
            return;
        }
        warn!("transport failed fatally: {err}");
        self.tx_queue.borrow_mut().clear();
        let nums = self.sessions.borrow().session_nums();
        for session_num in nums {
            self.error_teardown(session_num);
        }
    }

    /// Latch a session into `Errored` and tear it down locally, emitting
    /// the appropriate callback. Servers and silent teardowns get no
    /// callback; clients see `ConnectFailed` if the connect never
    /// completed and `Disconnected` otherwise.
    fn error_teardown(&self, session_num: u16) {
        let (event, notify) = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(session) = sessions.get_mut(session_num) else {
                return;
            };
            session.state = SessionState::Errored;
            if !session.is_client || session.disconnect_silent {
                (SmEventType::Disconnected, false)
            } else if session.route.is_none() {
                (SmEventType::ConnectFailed, true)
            } else {
                (SmEventType::Disconnected, true)
            }
        };

        self.pending_cbs.borrow_mut().push_back(PendingCb {
            session_num,
            event,
            err: SmErrType::TransportFatal,
            bury: true,
            notify,
        });
    }

    /// Return every runtime-owned buffer attached to a session to the pool.
    fn reclaim_session_buffers(&self, session: &mut Session<T::Route>) {
        for slot in &mut session.req_slots {
            // The request buffer belongs to the application; only the
            // response accumulator is ours.
            slot.tx_msgbuf = MsgBuffer::invalid();
            let mut resp = std::mem::replace(&mut slot.resp_msgbuf, MsgBuffer::invalid());
            if resp.is_valid_dynamic() {
                self.purge_tx_for(&resp);
                buffer::free_msg_buffer(&self.pool, &mut resp);
            }
            slot.occupied = false;
        }
        for slot in &mut session.resp_slots {
            let was_prealloc = slot.resp_is_prealloc;
            let mut resp = std::mem::replace(&mut slot.resp_msgbuf, MsgBuffer::invalid());
            if resp.is_valid_dynamic() && !was_prealloc {
                self.purge_tx_for(&resp);
                buffer::free_msg_buffer(&self.pool, &mut resp);
            }
            let mut pre = std::mem::replace(&mut slot.pre_resp_msgbuf, MsgBuffer::invalid());
            if pre.is_valid_dynamic() {
                self.purge_tx_for(&pre);
                buffer::free_msg_buffer(&self.pool, &mut pre);
            }
        }

        // Abandon reassemblies addressed to this session.
        let entries = self
            .dispatcher
            .borrow_mut()
            .reasm_remove_session(session.local_session_num);
        for entry in entries {
            let mut msgbuf = entry.msgbuf;
            buffer::free_msg_buffer(&self.pool, &mut msgbuf);
        }
    }

    // =========================================================================
    // Background completions
    // =========================================================================

    fn complete_bg_work(&self, done: BgComplete) {
        let BgComplete {
            session_num,
            req_num,
            req_type,
            mut req_msgbuf,
            resp,
        } = done;
        buffer::free_msg_buffer(&self.pool, &mut req_msgbuf);
        self.finish_response(session_num, req_num, req_type, resp);
    }

    // =========================================================================
    // Transmit queue helpers
    // =========================================================================

    fn stamp_msg_headers(
        msgbuf: &mut MsgBuffer,
        pkt_type: PktType,
        req_type: u8,
        dest_session_num: u16,
        req_num: u64,
        data_per_pkt: usize,
    ) {
        let msg_size = msgbuf.data_size();
        let num_pkts = PktHdr::calc_num_pkts(msg_size, data_per_pkt);
        for i in 0..num_pkts {
            let hdr = PktHdr::new(
                pkt_type,
                req_type,
                msg_size,
                dest_session_num,
                i as u16,
                req_num,
            );
            unsafe { hdr.write_to(msgbuf.pkthdr_ptr(i)) };
        }
        msgbuf.resize(msg_size, num_pkts);
    }

    /// Queue packets `range` of a stamped message for transmission.
    fn queue_msg_pkts(&self, route: T::Route, msgbuf: &MsgBuffer, range: std::ops::Range<usize>) {
        let mut queue = self.tx_queue.borrow_mut();
        for i in range {
            let payload_len =
                PktHdr::pkt_payload_len(msgbuf.data_size(), self.data_per_pkt, i);
            queue.push_back(TxWork {
                route,
                hdr: TxHdr::Ptr(msgbuf.pkthdr_ptr(i)),
                payload: msgbuf.payload_ptr(i * self.data_per_pkt),
                payload_len,
            });
        }
    }

    /// Queue a header-only control packet.
    fn queue_ctrl_pkt(&self, route: T::Route, hdr: PktHdr) {
        self.tx_queue.borrow_mut().push_back(TxWork {
            route,
            hdr: TxHdr::Inline(*hdr.as_bytes()),
            payload: std::ptr::null(),
            payload_len: 0,
        });
    }

    /// Drop queued packets whose headers live inside `msgbuf`'s backing
    /// region; called before that region is freed or reused.
    fn purge_tx_for(&self, msgbuf: &MsgBuffer) {
        if !msgbuf.is_valid() {
            return;
        }
        let base = msgbuf.pkthdr_ptr(0) as usize;
        let end = base + backing_size(msgbuf.max_data_size(), msgbuf.max_num_pkts());
        self.tx_queue.borrow_mut().retain(|w| match w.hdr {
            TxHdr::Ptr(p) => {
                let p = p as usize;
                !(p >= base && p < end)
            }
            TxHdr::Inline(_) => true,
        });
    }

    fn invoke_sm_handler(&self, session_num: u16, event: SmEventType, err: SmErrType) {
        let mut ctx = self.context.lock().unwrap();
        (self.sm_handler)(session_num as i32, event, err, &mut ctx);
    }

    // =========================================================================
    // Debug invariants
    // =========================================================================

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let sessions = self.sessions.borrow();
        for session in sessions.iter() {
            if session.is_client && session.state == SessionState::Connected {
                debug_assert_eq!(
                    session.credits + session.outstanding_requests(),
                    session.session_credits(),
                    "credit accounting broke on session {}",
                    session.local_session_num
                );
            }
        }
        drop(sessions);
        self.dispatcher.borrow().check_invariants();
    }
}

impl<T: Transport, C: Send + 'static> Drop for Rpc<T, C> {
    fn drop(&mut self) {
        // Hand every runtime-owned buffer back to the shared pool, then
        // detach from the Nexus.
        let nums = self.sessions.borrow().session_nums();
        for session_num in nums {
            if let Some(mut session) = self.sessions.borrow_mut().remove(session_num) {
                self.reclaim_session_buffers(&mut session);
            }
        }
        self.nexus_hooks.lock().unwrap().remove(&self.app_tid);
    }
}
