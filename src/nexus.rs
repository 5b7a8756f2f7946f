//! The Nexus: process-wide home of the handler registry, the
//! session-management socket and the background handler pool.
//!
//! Every runtime thread registers with one Nexus. The Nexus receiver
//! thread reads session-management datagrams off the well-known UDP port
//! and routes each one into the destination runtime's bounded inbox; that
//! inbox is the only place a runtime reads state produced on another
//! thread. Offloadable request handlers run on the Nexus's worker threads
//! and report back through per-runtime completion queues.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use omango::queue::spsc::{bounded, BReceiver, BSender};
use tracing::{debug, warn};

use crate::buffer::{BufferPool, MsgBuffer};
use crate::error::{Error, Result};
use crate::rpc::{AppResponse, ReqHandle};
use crate::sm::{SmErrType, SmEventType, SmPkt};

/// Depth of each runtime's session-management inbox.
const SM_INBOX_DEPTH: u32 = 256;

/// How long the receiver thread blocks in `recv_from` before rechecking
/// the shutdown flag.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Request handler: runs on the server, fills in the response.
pub type ReqHandlerFn<C> = fn(&ReqHandle<'_>, &mut AppResponse, &mut C);

/// Response continuation: runs on the client with the request and the
/// reassembled response.
pub type RespHandlerFn<C> = fn(req: &MsgBuffer, resp: &MsgBuffer, &mut C);

/// Session-management callback: `(session_num, event, error, context)`.
pub type SmHandlerFn<C> = fn(i32, SmEventType, SmErrType, &mut C);

/// Handlers registered for one request type.
///
/// Plain function pointers: the registry is shared by every runtime in the
/// process and read-only once the first runtime starts.
pub struct Ops<C> {
    pub req_handler: ReqHandlerFn<C>,
    pub resp_handler: RespHandlerFn<C>,
    /// Run the request handler on the background pool instead of inline.
    pub run_in_background: bool,
}

impl<C> Clone for Ops<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Ops<C> {}

impl<C> Ops<C> {
    /// Handlers that run inline on the event-loop thread.
    pub fn new(req_handler: ReqHandlerFn<C>, resp_handler: RespHandlerFn<C>) -> Self {
        Self {
            req_handler,
            resp_handler,
            run_in_background: false,
        }
    }

    /// Handlers whose request side is offloaded to the background pool.
    pub fn background(req_handler: ReqHandlerFn<C>, resp_handler: RespHandlerFn<C>) -> Self {
        Self {
            req_handler,
            resp_handler,
            run_in_background: true,
        }
    }
}

/// One inbound session-management datagram, with its sender.
pub(crate) struct SmWorkItem {
    pub pkt: SmPkt,
    pub src: std::net::SocketAddr,
}

/// A request handed to the background pool.
pub(crate) struct BgWork<C> {
    pub ops: Ops<C>,
    pub context: Arc<Mutex<C>>,
    pub pool: Arc<BufferPool>,
    pub data_per_pkt: usize,
    pub max_msg_size: usize,
    pub session_num: u16,
    pub req_num: u64,
    pub req_type: u8,
    /// Owned dynamic request buffer; returned with the completion so the
    /// runtime can free it.
    pub req_msgbuf: MsgBuffer,
    pub done_tx: mpsc::Sender<BgComplete>,
}

/// A finished background handler invocation.
pub(crate) struct BgComplete {
    pub session_num: u16,
    pub req_num: u64,
    pub req_type: u8,
    pub req_msgbuf: MsgBuffer,
    pub resp: AppResponse,
}

fn run_bg_work<C: Send>(work: BgWork<C>) {
    let BgWork {
        ops,
        context,
        pool,
        data_per_pkt,
        max_msg_size,
        session_num,
        req_num,
        req_type,
        req_msgbuf,
        done_tx,
    } = work;

    let mut resp = AppResponse::for_background();
    {
        let handle = ReqHandle::new(
            &req_msgbuf,
            &pool,
            data_per_pkt,
            max_msg_size,
            session_num,
            req_num,
            req_type,
        );
        let mut ctx = context.lock().unwrap();
        (ops.req_handler)(&handle, &mut resp, &mut ctx);
    }

    let _ = done_tx.send(BgComplete {
        session_num,
        req_num,
        req_type,
        req_msgbuf,
        resp,
    });
}

struct OpsRegistry<C> {
    table: [Option<Ops<C>>; 256],
    frozen: bool,
}

/// Everything a runtime takes from its Nexus at construction.
pub(crate) struct RpcHook<C: Send + 'static> {
    pub app_tid: u8,
    pub sm_rx: BReceiver<SmWorkItem>,
    pub bg_tx: Option<mpsc::Sender<BgWork<C>>>,
    pub bg_done_tx: mpsc::Sender<BgComplete>,
    pub bg_done_rx: mpsc::Receiver<BgComplete>,
    pub ops: Box<[Option<Ops<C>>; 256]>,
    pub socket: UdpSocket,
    pub hooks: Arc<Mutex<HashMap<u8, BSender<SmWorkItem>>>>,
    pub pool: Arc<BufferPool>,
    pub udp_port: u16,
    pub pkt_drop_prob: f64,
}

/// Process-wide singleton shared by all runtime threads.
pub struct Nexus<C: Send + 'static> {
    udp_port: u16,
    pkt_drop_prob: f64,
    socket: UdpSocket,
    ops: Mutex<OpsRegistry<C>>,
    hooks: Arc<Mutex<HashMap<u8, BSender<SmWorkItem>>>>,
    pool: Arc<BufferPool>,
    shutdown: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    bg_tx: Option<mpsc::Sender<BgWork<C>>>,
    bg_threads: Vec<JoinHandle<()>>,
}

impl<C: Send + 'static> Nexus<C> {
    /// Bind the session-management socket on `udp_port`, start the
    /// receiver thread and `num_bg_threads` handler workers.
    /// `pkt_drop_prob` drops that fraction of outbound SM datagrams to
    /// exercise retransmission; keep it 0.0 outside tests.
    pub fn new(udp_port: u16, num_bg_threads: usize, pkt_drop_prob: f64) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", udp_port))?;

        let hooks: Arc<Mutex<HashMap<u8, BSender<SmWorkItem>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let rx_socket = socket.try_clone()?;
        rx_socket.set_read_timeout(Some(RX_POLL_INTERVAL))?;
        let rx_hooks = Arc::clone(&hooks);
        let rx_shutdown = Arc::clone(&shutdown);
        let rx_thread = std::thread::spawn(move || {
            Self::rx_thread_main(rx_socket, rx_hooks, rx_shutdown);
        });

        let mut bg_threads = Vec::new();
        let bg_tx = if num_bg_threads > 0 {
            let (tx, rx) = mpsc::channel::<BgWork<C>>();
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..num_bg_threads {
                let rx = Arc::clone(&rx);
                bg_threads.push(std::thread::spawn(move || loop {
                    let work = rx.lock().unwrap().recv();
                    match work {
                        Ok(work) => run_bg_work(work),
                        Err(_) => break,
                    }
                }));
            }
            Some(tx)
        } else {
            None
        };

        Ok(Self {
            udp_port,
            pkt_drop_prob,
            socket,
            ops: Mutex::new(OpsRegistry {
                table: [None; 256],
                frozen: false,
            }),
            hooks,
            pool: Arc::new(BufferPool::new()),
            shutdown,
            rx_thread: Some(rx_thread),
            bg_tx,
            bg_threads,
        })
    }

    fn rx_thread_main(
        socket: UdpSocket,
        hooks: Arc<Mutex<HashMap<u8, BSender<SmWorkItem>>>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut buf = [0u8; 512];
        while !shutdown.load(Ordering::Acquire) {
            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(x) => x,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    warn!("SM receiver error: {e}");
                    continue;
                }
            };

            let pkt = match SmPkt::decode(&buf[..len]) {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!("dropping malformed SM datagram from {src}: {e}");
                    continue;
                }
            };

            let tid = pkt.dest_app_tid();
            let mut hooks = hooks.lock().unwrap();
            match hooks.get_mut(&tid) {
                Some(inbox) => {
                    if inbox.try_send(SmWorkItem { pkt, src }).is_err() {
                        debug!("SM inbox full for app_tid {tid}; dropping");
                    }
                }
                None => debug!("no runtime registered for app_tid {tid}; dropping SM datagram"),
            }
        }
    }

    /// Register handlers for a request type. Only legal before the first
    /// runtime is constructed.
    pub fn register_ops(&self, req_type: u8, ops: Ops<C>) -> Result<()> {
        let mut registry = self.ops.lock().unwrap();
        if registry.frozen {
            return Err(Error::InvalidArgument(
                "handler registry is frozen once a runtime exists",
            ));
        }
        registry.table[req_type as usize] = Some(ops);
        Ok(())
    }

    /// The well-known session-management port.
    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// Attach a runtime: freeze the registry, snapshot it, and open the
    /// runtime's SM inbox and background-completion queue.
    pub(crate) fn register_rpc(&self, app_tid: u8) -> Result<RpcHook<C>> {
        let ops = {
            let mut registry = self.ops.lock().unwrap();
            registry.frozen = true;
            Box::new(registry.table)
        };

        let (sm_tx, sm_rx) = bounded::<SmWorkItem>(SM_INBOX_DEPTH);
        {
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.contains_key(&app_tid) {
                return Err(Error::InvalidArgument(
                    "app_tid already registered with this Nexus",
                ));
            }
            hooks.insert(app_tid, sm_tx);
        }

        let (bg_done_tx, bg_done_rx) = mpsc::channel();
        Ok(RpcHook {
            app_tid,
            sm_rx,
            bg_tx: self.bg_tx.clone(),
            bg_done_tx,
            bg_done_rx,
            ops,
            socket: self.socket.try_clone()?,
            hooks: Arc::clone(&self.hooks),
            pool: Arc::clone(&self.pool),
            udp_port: self.udp_port,
            pkt_drop_prob: self.pkt_drop_prob,
        })
    }
}

impl<C: Send + 'static> Drop for Nexus<C> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        self.bg_tx = None;
        for handle in self.bg_threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{AppResponse, ReqHandle};

    struct Ctx;

    fn rh(_req: &ReqHandle<'_>, _resp: &mut AppResponse, _ctx: &mut Ctx) {}
    fn ch(_req: &MsgBuffer, _resp: &MsgBuffer, _ctx: &mut Ctx) {}

    #[test]
    fn test_registry_freezes_on_first_runtime() {
        let nexus: Nexus<Ctx> = Nexus::new(0, 0, 0.0).unwrap();
        nexus.register_ops(3, Ops::new(rh, ch)).unwrap();

        let hook = nexus.register_rpc(7).unwrap();
        assert!(hook.ops[3].is_some());
        assert!(hook.ops[4].is_none());

        // Frozen now.
        assert!(nexus.register_ops(4, Ops::new(rh, ch)).is_err());

        // Duplicate thread ids are rejected.
        assert!(nexus.register_rpc(7).is_err());
        // Deregistration frees the id.
        hook.hooks.lock().unwrap().remove(&7);
        assert!(nexus.register_rpc(7).is_ok());
    }
}
