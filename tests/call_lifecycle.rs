//! Call completion ordering and abort behavior across the network path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use basalt_rpc::{RpcScheduler, RpcServer, ServerConfig};
use bytes::Bytes;
use common::{HoldingScheduler, TestClient, init_tracing, wait_until};

async fn start_holding_server() -> (RpcServer, Arc<HoldingScheduler>) {
    init_tracing();
    let scheduler = HoldingScheduler::new();
    let server = RpcServer::bind(
        "127.0.0.1:0".parse().expect("addr"),
        ServerConfig::default().worker_threads(1),
        Arc::clone(&scheduler) as Arc<dyn RpcScheduler>,
        None,
    )
    .expect("bind");
    server.start();
    (server, scheduler)
}

#[tokio::test]
async fn responses_may_complete_out_of_arrival_order() {
    let (server, scheduler) = start_holding_server().await;
    let mut client = TestClient::connect(server.local_addr()).await;
    client.handshake().await;

    client.send_request(7, 1, b"first").await;
    client.send_request(8, 1, b"second").await;
    wait_until(|| {
        scheduler
            .held
            .try_lock()
            .map(|held| held.len() == 2)
            .unwrap_or(false)
    })
    .await;
    let open_before = server.num_open_connections();

    // Answer in reverse arrival order.
    scheduler.release(8, b"eight").await;
    let (response, payload) = client.read_response().await;
    assert_eq!(response.call_id, 8);
    assert_eq!(payload, b"eight");

    scheduler.release(7, b"seven").await;
    let (response, payload) = client.read_response().await;
    assert_eq!(response.call_id, 7);
    assert_eq!(payload, b"seven");

    // Completion order does not affect the connection count.
    assert_eq!(server.num_open_connections(), open_before);

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn responding_after_connection_abort_fails_cleanly() {
    let (server, scheduler) = start_holding_server().await;
    let mut client = TestClient::connect(server.local_addr()).await;
    client.handshake().await;

    client.send_request(9, 1, b"doomed").await;
    wait_until(|| {
        scheduler
            .held
            .try_lock()
            .map(|held| held.len() == 1)
            .unwrap_or(false)
    })
    .await;

    drop(client);
    wait_until(|| server.num_open_connections() == 0).await;

    let responder = scheduler
        .held
        .lock()
        .await
        .pop()
        .expect("held responder");
    let call_done_probe = {
        let flag = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let probe = Arc::clone(&flag);
        responder.call().on_completion(Box::new(move || {
            probe.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        flag
    };
    let err = responder
        .respond(Ok(Bytes::from_static(b"too late")))
        .await
        .expect_err("connection is gone");
    assert!(matches!(
        err,
        basalt_rpc::CallError::ConnectionClosed { call_id: 9 }
    ));
    // The abort path still completed the call exactly once.
    assert_eq!(
        call_done_probe.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    server.stop().await;
}

#[tokio::test]
async fn server_stop_completes_in_flight_calls() {
    let (server, scheduler) = start_holding_server().await;
    let mut client = TestClient::connect(server.local_addr()).await;
    client.handshake().await;
    client.send_request(4, 1, b"pending").await;
    wait_until(|| {
        scheduler
            .held
            .try_lock()
            .map(|held| held.len() == 1)
            .unwrap_or(false)
    })
    .await;

    // Stop must not deadlock against the un-answered call.
    tokio::time::timeout(Duration::from_secs(2), server.stop())
        .await
        .expect("stop completes");
    client.expect_eof().await;

    // The parked responder now points at a dead connection.
    let responder = scheduler
        .held
        .lock()
        .await
        .pop()
        .expect("held responder");
    let err = responder
        .respond(Ok(Bytes::from_static(b"after stop")))
        .await
        .expect_err("connection closed by stop");
    assert!(matches!(
        err,
        basalt_rpc::CallError::ConnectionClosed { call_id: 4 }
    ));
}
