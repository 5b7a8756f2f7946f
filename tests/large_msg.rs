//! Multi-packet request/response tests.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use rand::Rng;

use common::*;
use udrpc::{AppResponse, MsgBuffer, Nexus, Ops, ReqHandle, Rpc, RpcConfig};

const REQ_TYPE: u8 = 3;

/// Copies the request payload into a dynamically allocated response.
fn echo_req_handler(req: &ReqHandle<'_>, resp: &mut AppResponse, ctx: &mut AppContext) {
    assert!(!ctx.is_client);
    let req_size = req.data_size();

    resp.prealloc_used = false;
    resp.dyn_resp_msgbuf = req.alloc_msg_buffer(req_size).expect("response alloc");
    resp.dyn_resp_msgbuf.data_mut().copy_from_slice(req.data());
}

/// Checks that the response equals the request byte for byte.
fn echo_resp_handler(req: &MsgBuffer, resp: &MsgBuffer, ctx: &mut AppContext) {
    assert!(ctx.is_client);
    assert_eq!(req.data_size(), resp.data_size());
    assert_eq!(req.data(), resp.data());
    ctx.num_rpc_resps += 1;
}

fn client_rpc(nexus: &Nexus<AppContext>) -> (TestRpc, Arc<Mutex<AppContext>>) {
    let ctx = Arc::new(Mutex::new(AppContext::client()));
    let rpc = Rpc::new(
        nexus,
        Arc::clone(&ctx),
        CLIENT_APP_TID,
        counting_sm_handler,
        RpcConfig::default().with_numa_node(NUMA_NODE),
    )
    .expect("client rpc");
    (rpc, ctx)
}

fn connect_session(rpc: &TestRpc, ctx: &Arc<Mutex<AppContext>>) -> i32 {
    let session_num = rpc
        .create_session(LOCAL_HOSTNAME, SERVER_APP_TID, PHY_PORT)
        .expect("create_session");
    wait_for_sm_events(rpc, ctx, 1);
    assert_eq!(ctx.lock().unwrap().num_sm_events, 1);
    session_num
}

/// Send one request spanning at least two packets and check the echoed
/// response.
fn one_large_rpc(udp_port: u16, num_bg_threads: usize) {
    let ops = if num_bg_threads > 0 {
        Ops::background(echo_req_handler, echo_resp_handler)
    } else {
        Ops::new(echo_req_handler, echo_resp_handler)
    };

    launch_server_client(
        udp_port,
        num_bg_threads,
        counting_sm_handler,
        |nexus| nexus.register_ops(REQ_TYPE, ops).expect("register_ops"),
        |nexus, flags| {
            let (rpc, ctx) = client_rpc(nexus);
            let session_num = connect_session(&rpc, &ctx);

            let req_size = rpc.max_data_per_pkt() + 1;
            let mut req = rpc.alloc_msg_buffer(req_size).expect("request alloc");
            req.data_mut().fill(b'a');
            req.data_mut()[req_size - 1] = 0;

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

#[test]
fn one_large_rpc_foreground() {
    one_large_rpc(31861, 0);
}

#[test]
fn one_large_rpc_background() {
    one_large_rpc(31862, 1);
}

/// Saturate one session's credits with randomly sized multi-packet
/// requests, twice, proving credit return and MsgBuffer reuse via resize.
#[test]
fn multi_large_rpc_one_session() {
    launch_server_client(
        31863,
        0,
        counting_sm_handler,
        |nexus| {
            nexus
                .register_ops(REQ_TYPE, Ops::new(echo_req_handler, echo_resp_handler))
                .expect("register_ops")
        },
        |nexus, flags| {
            let (rpc, ctx) = client_rpc(nexus);
            let session_num = connect_session(&rpc, &ctx);

            let credits = rpc.config().session_credits;
            let max_msg_size = rpc.config().max_msg_size;
            let min_msg_size = rpc.max_data_per_pkt() + 1;

            // Pre-create the MsgBuffers to exercise reuse and resizing.
            let mut req_msgbufs: Vec<MsgBuffer> = (0..credits)
                .map(|_| rpc.alloc_msg_buffer(max_msg_size).expect("request alloc"))
                .collect();

            let mut rng = rand::thread_rng();
            for _iter in 0..2 {
                ctx.lock().unwrap().num_rpc_resps = 0;

                // Enqueue as many requests as one session allows.
                for (i, req) in req_msgbufs.iter_mut().enumerate() {
                    let req_len = rng.gen_range(min_msg_size..=max_msg_size);
                    rpc.resize_msg_buffer(req, req_len).expect("resize");

                    for (j, b) in req.data_mut().iter_mut().enumerate() {
                        *b = b'a' + ((i + j) % 26) as u8;
                    }
                    req.data_mut()[req_len - 1] = 0;

                    rpc.enqueue_request(session_num, REQ_TYPE, req)
                        .expect("enqueue_request");
                }

                // One more request must fail: the credits are gone.
                let err = rpc
                    .enqueue_request(session_num, REQ_TYPE, &mut req_msgbufs[0])
                    .unwrap_err();
                assert!(matches!(err, udrpc::Error::NoCredits));

                wait_for_rpc_resps(&rpc, &ctx, credits);
                assert_eq!(ctx.lock().unwrap().num_rpc_resps, credits);
            }

            for req in &mut req_msgbufs {
                rpc.free_msg_buffer(req).expect("free_msg_buffer");
            }

            rpc.destroy_session(session_num).expect("destroy_session");
            rpc.run_event_loop_timeout(EVENT_LOOP_MS);

            flags.client_done.store(true, Ordering::Release);
        },
    );
}
