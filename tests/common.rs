//! Common test utilities for the RPC integration tests.
//!
//! Each test runs one server thread and one client thread sharing a Nexus,
//! on a test-unique UDP port so the binaries can run in parallel.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use udrpc::nexus::SmHandlerFn;
use udrpc::{Nexus, Rpc, RpcConfig, SmErrType, SmEventType, UdpTransport};

pub const CLIENT_APP_TID: u8 = 100;
pub const SERVER_APP_TID: u8 = 200;
pub const PHY_PORT: u8 = 0;
pub const NUMA_NODE: usize = 0;
pub const EVENT_LOOP_MS: u64 = 200;
pub const MAX_EVENT_LOOP_MS: u64 = 10_000;
/// Hermetic peer name; always resolves without touching DNS.
pub const LOCAL_HOSTNAME: &str = "localhost";

/// Hard cap on the server loop so a panicking client cannot wedge a test.
const SERVER_LIFETIME: Duration = Duration::from_secs(30);

pub type TestRpc = Rpc<UdpTransport, AppContext>;

/// Per-thread application context shared with callbacks.
#[derive(Default)]
pub struct AppContext {
    pub is_client: bool,
    /// Session-management callbacks observed since the last `arm`.
    pub num_sm_events: usize,
    /// Completed RPC responses (client only).
    pub num_rpc_resps: usize,
    pub exp_event: Option<SmEventType>,
    pub exp_err: Option<SmErrType>,
    pub exp_session_num: Option<i32>,
}

impl AppContext {
    pub fn client() -> Self {
        Self {
            is_client: true,
            ..Self::default()
        }
    }

    /// Fill in the values expected in the next session-management callback.
    pub fn arm(&mut self, event: SmEventType, err: SmErrType, session_num: i32) {
        self.num_sm_events = 0;
        self.exp_event = Some(event);
        self.exp_err = Some(err);
        self.exp_session_num = Some(session_num);
    }
}

/// Session-management handler checking the expectations armed in the
/// context.
pub fn checking_sm_handler(
    session_num: i32,
    event: SmEventType,
    err: SmErrType,
    ctx: &mut AppContext,
) {
    ctx.num_sm_events += 1;
    if let Some(exp) = ctx.exp_event {
        assert_eq!(event, exp);
    }
    if let Some(exp) = ctx.exp_err {
        assert_eq!(err, exp);
    }
    if let Some(exp) = ctx.exp_session_num {
        assert_eq!(session_num, exp);
    }
}

/// Session-management handler that only counts successful events.
pub fn counting_sm_handler(
    _session_num: i32,
    event: SmEventType,
    err: SmErrType,
    ctx: &mut AppContext,
) {
    assert!(ctx.is_client);
    assert_eq!(err, SmErrType::NoError);
    assert!(matches!(
        event,
        SmEventType::Connected | SmEventType::Disconnected
    ));
    ctx.num_sm_events += 1;
}

#[derive(Default)]
pub struct TestFlags {
    /// Client starts after the server is ready.
    pub server_ready: AtomicBool,
    /// Server ends after the client is done.
    pub client_done: AtomicBool,
}

fn server_thread(nexus: &Nexus<AppContext>, sm_handler: SmHandlerFn<AppContext>, flags: &TestFlags) {
    let ctx = Arc::new(Mutex::new(AppContext::default()));
    let rpc: TestRpc = Rpc::new(
        nexus,
        ctx,
        SERVER_APP_TID,
        sm_handler,
        RpcConfig::default().with_numa_node(NUMA_NODE),
    )
    .expect("server rpc");
    flags.server_ready.store(true, Ordering::Release);

    let start = Instant::now();
    while !flags.client_done.load(Ordering::Acquire) && start.elapsed() < SERVER_LIFETIME {
        rpc.run_event_loop_timeout(EVENT_LOOP_MS);
    }

    // The client is done after disconnecting.
    assert_eq!(rpc.num_active_sessions(), 0);
}

/// Launch a server thread and a client thread against a fresh Nexus.
pub fn launch_server_client<R, F>(
    udp_port: u16,
    num_bg_threads: usize,
    sm_handler: SmHandlerFn<AppContext>,
    register: R,
    client_fn: F,
) where
    R: FnOnce(&Nexus<AppContext>),
    F: FnOnce(&Nexus<AppContext>, &TestFlags) + Send,
{
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let nexus: Nexus<AppContext> = Nexus::new(udp_port, num_bg_threads, 0.0).expect("nexus");
    register(&nexus);
    let flags = TestFlags::default();

    std::thread::scope(|s| {
        let server = s.spawn(|| server_thread(&nexus, sm_handler, &flags));

        while !flags.server_ready.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let client = s.spawn(|| client_fn(&nexus, &flags));

        server.join().expect("server thread");
        client.join().expect("client thread");
    });
}

/// Run the client event loop until `want` session-management events have
/// arrived since the last `arm`, or the global timeout elapses.
pub fn wait_for_sm_events(rpc: &TestRpc, ctx: &Arc<Mutex<AppContext>>, want: usize) {
    let start = Instant::now();
    while ctx.lock().unwrap().num_sm_events != want {
        rpc.run_event_loop_timeout(EVENT_LOOP_MS);
        if start.elapsed().as_millis() as u64 > MAX_EVENT_LOOP_MS {
            break;
        }
    }
}

/// Run the client event loop until `want` RPC responses have completed,
/// or the global timeout elapses.
pub fn wait_for_rpc_resps(rpc: &TestRpc, ctx: &Arc<Mutex<AppContext>>, want: usize) {
    let start = Instant::now();
    while ctx.lock().unwrap().num_rpc_resps != want {
        rpc.run_event_loop_timeout(EVENT_LOOP_MS);
        if start.elapsed().as_millis() as u64 > MAX_EVENT_LOOP_MS {
            break;
        }
    }
}
