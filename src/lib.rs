//! # udrpc - user-space datagram RPC
//!
//! A per-thread RPC runtime for low-latency lossy transports. Applications
//! register typed request handlers, open sessions to remote runtimes, and
//! enqueue request/response messages whose payloads may span many packets;
//! the runtime fragments, transmits, reassembles, retransmits and
//! dispatches them from a single-threaded cooperative event loop.
//!
//! ## Features
//!
//! - **Credit-based sessions**: each session allows a fixed number of
//!   outstanding requests; credits return on completion or through
//!   explicit credit-return packets
//! - **Multi-packet messages**: contiguous payloads with one prepended and
//!   N-1 embedded packet headers, reassembled via per-message bitmaps
//! - **Out-of-band session management**: a three-way connect/disconnect
//!   protocol on a well-known UDP port, retransmitted with exponential
//!   backoff and deduplicated server-side
//! - **Background handlers**: request types marked offloadable run on the
//!   Nexus worker pool and complete through a per-runtime queue
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::{Arc, Mutex};
//! use udrpc::{Nexus, Ops, Rpc, RpcConfig, UdpTransport};
//!
//! // One Nexus per process; handlers are registered before any runtime.
//! let nexus: Nexus<MyContext> = Nexus::new(31850, 0, 0.0)?;
//! nexus.register_ops(3, Ops::new(my_req_handler, my_resp_handler))?;
//!
//! // One runtime per thread.
//! let ctx = Arc::new(Mutex::new(MyContext::default()));
//! let rpc: Rpc<UdpTransport, MyContext> =
//!     Rpc::new(&nexus, ctx, /* app_tid */ 100, my_sm_handler, RpcConfig::default())?;
//!
//! // Connect, send, and drive the event loop.
//! let session = rpc.create_session("server-host", 200, 0)?;
//! let mut req = rpc.alloc_msg_buffer(1024)?;
//! req.data_mut().fill(b'x');
//! rpc.enqueue_request(session, 3, &mut req)?;
//! loop {
//!     rpc.run_event_loop_one();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: datapath packet header (`PktHdr`)
//! - [`buffer`]: message buffers and the shared size-classed pool
//! - [`sm`]: session-management wire protocol
//! - [`session`]: session state and slot bookkeeping
//! - [`dispatcher`]: receive classification, reassembly, drop counters
//! - [`timing`]: timing wheel and the event-loop clock
//! - [`transport`]: transport trait and the loopback UDP transport
//! - [`nexus`]: process-wide registry, SM socket and background pool
//! - [`rpc`]: the per-thread runtime (`Rpc`)

pub mod buffer;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;

// Re-export main types
pub use buffer::{BufferPool, MsgBuffer};
pub use config::{FaultInjection, RpcConfig, MAX_PHY_PORTS};
pub use dispatcher::DispatchStats;
pub use error::{Error, Result};
pub use nexus::{Nexus, Ops, ReqHandlerFn, RespHandlerFn, SmHandlerFn};
pub use packet::{PktHdr, PktType, PKT_HDR_MAGIC, PKT_HDR_SIZE};
pub use rpc::{AppResponse, ReqHandle, Rpc};
pub use session::SessionState;
pub use sm::{SmErrType, SmEventType, MAX_HOSTNAME_LEN};
pub use transport::{RoutingInfo, Transport, TxPacket, UdpTransport};
