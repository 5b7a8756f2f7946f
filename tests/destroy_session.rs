//! Session connect/disconnect lifecycle tests.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use udrpc::{Rpc, RpcConfig, SmErrType, SmEventType};

fn client_rpc(nexus: &udrpc::Nexus<AppContext>) -> (TestRpc, Arc<Mutex<AppContext>>) {
    let ctx = Arc::new(Mutex::new(AppContext::client()));
    let rpc = Rpc::new(
        nexus,
        Arc::clone(&ctx),
        CLIENT_APP_TID,
        checking_sm_handler,
        RpcConfig::default().with_numa_node(NUMA_NODE),
    )
    .expect("client rpc");
    (rpc, ctx)
}

/// Simple successful disconnection of one session, and other simple tests.
#[test]
fn simple_disconnect() {
    launch_server_client(31851, 0, checking_sm_handler, |_| {}, |nexus, flags| {
        let (rpc, ctx) = client_rpc(nexus);

        let session_num = rpc
            .create_session(LOCAL_HOSTNAME, SERVER_APP_TID, PHY_PORT)
            .expect("create_session");
        assert!(session_num >= 0);
        // Early disconnect must be rejected while the connect is in flight.
        assert!(rpc.destroy_session(session_num).is_err());

        // Connect the session.
        ctx.lock()
            .unwrap()
            .arm(SmEventType::Connected, SmErrType::NoError, session_num);
        wait_for_sm_events(&rpc, &ctx, 1);
        assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

        // Disconnect the session.
        ctx.lock()
            .unwrap()
            .arm(SmEventType::Disconnected, SmErrType::NoError, session_num);
        rpc.destroy_session(session_num).expect("destroy_session");
        wait_for_sm_events(&rpc, &ctx, 1);
        assert_eq!(ctx.lock().unwrap().num_sm_events, 1);
        assert_eq!(rpc.num_active_sessions(), 0);

        // A second disconnect of the same session must fail.
        assert!(rpc.destroy_session(session_num).is_err());

        // So must a disconnect of an invalid session number.
        assert!(rpc.destroy_session(-1).is_err());

        flags.client_done.store(true, std::sync::atomic::Ordering::Release);
    });
}

/// Repeat: create a session to the server and disconnect it.
#[test]
fn disconnect_multi() {
    launch_server_client(31852, 0, checking_sm_handler, |_| {}, |nexus, flags| {
        let (rpc, ctx) = client_rpc(nexus);

        for _ in 0..3 {
            let session_num = rpc
                .create_session(LOCAL_HOSTNAME, SERVER_APP_TID, PHY_PORT)
                .expect("create_session");
            assert!(session_num >= 0);

            ctx.lock()
                .unwrap()
                .arm(SmEventType::Connected, SmErrType::NoError, session_num);
            wait_for_sm_events(&rpc, &ctx, 1);
            assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

            ctx.lock()
                .unwrap()
                .arm(SmEventType::Disconnected, SmErrType::NoError, session_num);
            rpc.destroy_session(session_num).expect("destroy_session");
            wait_for_sm_events(&rpc, &ctx, 1);
            assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

            assert_eq!(rpc.num_active_sessions(), 0);
        }

        flags.client_done.store(true, std::sync::atomic::Ordering::Release);
    });
}

/// Disconnect a session that encountered a remote error. The server holds
/// no resources for it, so it is buried as soon as the callback fires.
#[test]
fn disconnect_remote_error() {
    launch_server_client(31853, 0, checking_sm_handler, |_| {}, |nexus, flags| {
        let (rpc, ctx) = client_rpc(nexus);

        // The server does not own this fabric port.
        let session_num = rpc
            .create_session(LOCAL_HOSTNAME, SERVER_APP_TID, PHY_PORT + 1)
            .expect("create_session");
        assert!(session_num >= 0);

        ctx.lock().unwrap().arm(
            SmEventType::ConnectFailed,
            SmErrType::InvalidRemotePort,
            session_num,
        );
        wait_for_sm_events(&rpc, &ctx, 1);
        assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

        assert_eq!(rpc.num_active_sessions(), 0);

        flags.client_done.store(true, std::sync::atomic::Ordering::Release);
    });
}

/// The client fails to resolve the server's routing info while processing
/// the connect response. The failed-connect callback fires immediately;
/// freeing the server-side resources then completes without any further
/// callback.
#[test]
fn disconnect_local_error() {
    launch_server_client(31854, 0, checking_sm_handler, |_| {}, |nexus, flags| {
        let (rpc, ctx) = client_rpc(nexus);
        rpc.fault_injection().set_fail_resolve_rinfo_client(true);

        let session_num = rpc
            .create_session(LOCAL_HOSTNAME, SERVER_APP_TID, PHY_PORT)
            .expect("create_session");
        ctx.lock().unwrap().arm(
            SmEventType::ConnectFailed,
            SmErrType::RoutingResolutionFailure,
            session_num,
        );
        wait_for_sm_events(&rpc, &ctx, 1);
        assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

        // The callback-less teardown of the server-side session needs a
        // few more event-loop turns.
        rpc.run_event_loop_timeout(EVENT_LOOP_MS);
        assert_eq!(rpc.num_active_sessions(), 0);
        assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

        flags.client_done.store(true, std::sync::atomic::Ordering::Release);
    });
}
