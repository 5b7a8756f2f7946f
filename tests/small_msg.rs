//! Single-packet request/response tests.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::*;
use udrpc::{AppResponse, MsgBuffer, Nexus, Ops, ReqHandle, Rpc, RpcConfig};

const REQ_TYPE: u8 = 5;

fn echo_req_handler(req: &ReqHandle<'_>, resp: &mut AppResponse, ctx: &mut AppContext) {
    assert!(!ctx.is_client);
    resp.prealloc_used = false;
    resp.dyn_resp_msgbuf = req.alloc_msg_buffer(req.data_size()).expect("response alloc");
    resp.dyn_resp_msgbuf.data_mut().copy_from_slice(req.data());
}

fn echo_resp_handler(req: &MsgBuffer, resp: &MsgBuffer, ctx: &mut AppContext) {
    assert!(ctx.is_client);
    assert_eq!(req.data(), resp.data());
    ctx.num_rpc_resps += 1;
}

/// A request and response that each fit in one packet take the fake-buffer
/// fast path on both sides.
#[test]
fn one_small_rpc() {
    launch_server_client(
        31871,
        0,
        counting_sm_handler,
        |nexus: &Nexus<AppContext>| {
            nexus
                .register_ops(REQ_TYPE, Ops::new(echo_req_handler, echo_resp_handler))
                .expect("register_ops")
        },
        |nexus, flags| {
            let ctx = Arc::new(Mutex::new(AppContext::client()));
            let rpc: TestRpc = Rpc::new(
                nexus,
                Arc::clone(&ctx),
                CLIENT_APP_TID,
                counting_sm_handler,
                RpcConfig::default(),
            )
            .expect("client rpc");

            let session_num = rpc
                .create_session(LOCAL_HOSTNAME, SERVER_APP_TID, PHY_PORT)
                .expect("create_session");
            wait_for_sm_events(&rpc, &ctx, 1);
            assert_eq!(ctx.lock().unwrap().num_sm_events, 1);

            let mut req = rpc.alloc_msg_buffer(32).expect("request alloc");
            for (i, b) in req.data_mut().iter_mut().enumerate() {
                *b = i as u8;
            }
            rpc.enqueue_request(session_num, REQ_TYPE, &mut req)
                .expect("enqueue_request");
            wait_for_rpc_resps(&rpc, &ctx, 1);
            assert_eq!(ctx.lock().unwrap().num_rpc_resps, 1);

            rpc.free_msg_buffer(&mut req).expect("free_msg_buffer");
            rpc.destroy_session(session_num).expect("destroy_session");
            rpc.run_event_loop_timeout(EVENT_LOOP_MS);

            flags.client_done.store(true, Ordering::Release);
        },
    );
}
