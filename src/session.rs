//! Sessions, request/response slots and the session table.
//!
//! A session is a logical channel to one peer runtime. The client side
//! tracks outstanding requests in `credits` slots; the server side keeps a
//! matching set of response slots so duplicate requests can be answered by
//! replaying the retained response.

use std::net::SocketAddr;

use crate::buffer::MsgBuffer;
use crate::dispatcher::PktBitmap;
use crate::sm::{SmEndpoint, SmPktType};
use crate::transport::RoutingInfo;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, nothing sent yet.
    Init,
    /// Connect sent, waiting for the connect response.
    ConnectInProgress,
    /// Ready for requests.
    Connected,
    /// Disconnect sent, waiting for the disconnect response.
    DisconnectInProgress,
    /// Fully torn down; the session slot is about to be reclaimed.
    Disconnected,
    /// A fatal error was latched; teardown is underway.
    Errored,
}

/// Client-side record of one outstanding request.
#[derive(Debug, Default)]
pub(crate) struct ReqSlot {
    pub occupied: bool,
    pub req_num: u64,
    pub req_type: u8,
    /// View of the application's request buffer; valid until completion.
    pub tx_msgbuf: MsgBuffer,
    /// Response accumulator for multi-packet responses (runtime-owned).
    pub resp_msgbuf: MsgBuffer,
    pub resp_bitmap: PktBitmap,
    pub expected_resp_pkts: usize,
    pub retries: u32,
}

impl ReqSlot {
    pub fn reset(&mut self) {
        debug_assert!(self.resp_msgbuf.is_buried() || !self.resp_msgbuf.is_dynamic());
        *self = ReqSlot::default();
    }
}

/// Server-side record of the request currently (or last) handled in one
/// slot position.
#[derive(Debug, Default)]
pub(crate) struct RespSlot {
    /// A request is being reassembled or its handler is running.
    pub in_progress: bool,
    pub cur_req_num: u64,
    /// Last fully answered request; its response is retained in
    /// `resp_msgbuf` for duplicate-request replay.
    pub done_req_num: Option<u64>,
    pub resp_msgbuf: MsgBuffer,
    pub resp_is_prealloc: bool,
    /// Pre-allocated single-packet response buffer for handlers that
    /// answer without a dynamic allocation.
    pub pre_resp_msgbuf: MsgBuffer,
}

/// A pending session-management exchange awaiting its response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SmPending {
    pub kind: SmPktType,
    pub attempt: u32,
}

/// Per-peer logical channel.
pub(crate) struct Session<R> {
    pub state: SessionState,
    pub is_client: bool,
    pub local_session_num: u16,
    pub remote_session_num: u16,
    /// This runtime's identity as stamped into SM envelopes.
    pub self_endpoint: SmEndpoint,
    /// The peer's identity (for clients: the server we asked for).
    pub peer_endpoint: SmEndpoint,
    /// Control-plane address of the peer's Nexus.
    pub peer_sm_addr: Option<SocketAddr>,
    pub remote_routing_info: RoutingInfo,
    /// Resolved datapath route; present once connected.
    pub route: Option<R>,
    /// Remaining request credits; starts at `session_credits`.
    pub credits: usize,
    session_credits: usize,
    next_seq: u64,
    pub req_slots: Vec<ReqSlot>,
    pub resp_slots: Vec<RespSlot>,
    pub sm_pending: Option<SmPending>,
    /// Tear down without a `Disconnected` callback (connect never
    /// completed from the application's point of view).
    pub disconnect_silent: bool,
}

impl<R> Session<R> {
    /// Client-side session; starts in `Init` and is promoted by the
    /// connect flow.
    pub fn new_client(
        local_session_num: u16,
        self_endpoint: SmEndpoint,
        peer_endpoint: SmEndpoint,
        session_credits: usize,
    ) -> Self {
        Self {
            state: SessionState::Init,
            is_client: true,
            local_session_num,
            remote_session_num: 0,
            self_endpoint,
            peer_endpoint,
            peer_sm_addr: None,
            remote_routing_info: RoutingInfo::default(),
            route: None,
            credits: session_credits,
            session_credits,
            next_seq: 0,
            req_slots: (0..session_credits).map(|_| ReqSlot::default()).collect(),
            resp_slots: Vec::new(),
            sm_pending: None,
            disconnect_silent: false,
        }
    }

    /// Server-side session; born `Connected` by a successful connect.
    pub fn new_server(
        local_session_num: u16,
        remote_session_num: u16,
        self_endpoint: SmEndpoint,
        peer_endpoint: SmEndpoint,
        session_credits: usize,
    ) -> Self {
        Self {
            state: SessionState::Connected,
            is_client: false,
            local_session_num,
            remote_session_num,
            self_endpoint,
            peer_endpoint,
            peer_sm_addr: None,
            remote_routing_info: RoutingInfo::default(),
            route: None,
            credits: session_credits,
            session_credits,
            next_seq: 0,
            req_slots: Vec::new(),
            resp_slots: (0..session_credits).map(|_| RespSlot::default()).collect(),
            sm_pending: None,
            disconnect_silent: false,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn session_credits(&self) -> usize {
        self.session_credits
    }

    #[inline]
    pub fn has_credits(&self) -> bool {
        self.credits > 0
    }

    pub fn consume_credit(&mut self) {
        debug_assert!(self.credits > 0);
        self.credits -= 1;
    }

    pub fn return_credit(&mut self) {
        debug_assert!(self.credits < self.session_credits);
        self.credits += 1;
    }

    /// Slot position a request number maps to, on both sides of the wire.
    #[inline]
    pub fn slot_of(&self, req_num: u64) -> usize {
        (req_num % self.session_credits as u64) as usize
    }

    /// Claim a free request slot and mint its request number. The request
    /// number grows per session and its low bits encode the slot, so the
    /// peer can find the matching slot without a lookup table.
    pub fn start_request(&mut self, req_type: u8) -> Option<(usize, u64)> {
        let idx = self.req_slots.iter().position(|s| !s.occupied)?;
        let req_num = self.next_seq * self.session_credits as u64 + idx as u64;
        self.next_seq += 1;

        let slot = &mut self.req_slots[idx];
        slot.occupied = true;
        slot.req_num = req_num;
        slot.req_type = req_type;
        slot.retries = 0;
        slot.expected_resp_pkts = 0;
        Some((idx, req_num))
    }

    /// Find the slot currently owning `req_num`, if any.
    pub fn find_req_slot(&self, req_num: u64) -> Option<usize> {
        let idx = self.slot_of(req_num);
        let slot = self.req_slots.get(idx)?;
        (slot.occupied && slot.req_num == req_num).then_some(idx)
    }

    /// Number of requests currently holding a credit.
    pub fn outstanding_requests(&self) -> usize {
        self.req_slots.iter().filter(|s| s.occupied).count()
    }
}

/// Table of sessions indexed by `local_session_num`.
pub(crate) struct SessionTable<R> {
    sessions: Vec<Option<Session<R>>>,
    next_session_num: usize,
}

impl<R> SessionTable<R> {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: (0..max_sessions).map(|_| None).collect(),
            next_session_num: 0,
        }
    }

    /// Reserve a session number, scanning round-robin from the last
    /// allocation so numbers are not reused immediately.
    pub fn alloc_session_num(&mut self) -> Option<u16> {
        let start = self.next_session_num;
        for i in 0..self.sessions.len() {
            let idx = (start + i) % self.sessions.len();
            if self.sessions[idx].is_none() {
                self.next_session_num = (idx + 1) % self.sessions.len();
                return Some(idx as u16);
            }
        }
        None
    }

    pub fn insert(&mut self, session: Session<R>) {
        let idx = session.local_session_num as usize;
        debug_assert!(self.sessions[idx].is_none());
        self.sessions[idx] = Some(session);
    }

    pub fn get(&self, session_num: u16) -> Option<&Session<R>> {
        self.sessions.get(session_num as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, session_num: u16) -> Option<&mut Session<R>> {
        self.sessions.get_mut(session_num as usize)?.as_mut()
    }

    pub fn remove(&mut self, session_num: u16) -> Option<Session<R>> {
        self.sessions.get_mut(session_num as usize)?.take()
    }

    /// Sessions that have not reached `Disconnected`.
    pub fn num_active(&self) -> usize {
        self.sessions
            .iter()
            .flatten()
            .filter(|s| s.state != SessionState::Disconnected)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session<R>> {
        self.sessions.iter().flatten()
    }

    /// All live session numbers; used when latching a runtime-wide error.
    pub fn session_nums(&self) -> Vec<u16> {
        self.iter().map(|s| s.local_session_num).collect()
    }
}
