//! Shared helpers for integration tests: a minimal RPC client speaking the
//! wire protocol over TCP, plus scheduler doubles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use basalt_rpc::{
    CallResponder, ConnectionHeader, DispatchRejection, RequestHeader, ResponseHeader,
    RpcScheduler, RpcServer, SchedulerError, ServerConfig, wire,
};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Client side of one test connection.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self { stream }
    }

    pub async fn send_preamble(&mut self, auth_code: u8) {
        self.stream.write_all(b"HBas").await.expect("write magic");
        self.stream
            .write_all(&[0, auth_code])
            .await
            .expect("write version and auth code");
    }

    pub async fn send_frame(&mut self, payload: &[u8]) {
        let len = u32::try_from(payload.len()).expect("frame fits u32");
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .expect("write prefix");
        self.stream.write_all(payload).await.expect("write payload");
    }

    pub async fn send_connection_header(&mut self) {
        let header = ConnectionHeader {
            service: "StoreService".to_string(),
            user: Some("tester".to_string()),
            cell_codec: None,
        };
        let bytes = wire::encode_message(&header).expect("encode connection header");
        self.send_frame(&bytes).await;
    }

    pub async fn send_request(&mut self, call_id: i32, method_id: u32, payload: &[u8]) {
        let header = RequestHeader {
            call_id,
            method_id,
            timeout_ms: 0,
            cell_block_len: 0,
        };
        let mut body = wire::encode_message(&header).expect("encode request header");
        body.extend_from_slice(payload);
        self.send_frame(&body).await;
    }

    pub async fn read_frame(&mut self) -> Vec<u8> {
        let mut prefix = [0u8; 4];
        self.stream
            .read_exact(&mut prefix)
            .await
            .expect("read prefix");
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .expect("read payload");
        payload
    }

    pub async fn read_response(&mut self) -> (ResponseHeader, Vec<u8>) {
        let payload = self.read_frame().await;
        let (header, consumed) =
            wire::decode_message::<ResponseHeader>(&payload).expect("decode response header");
        (header, payload[consumed..].to_vec())
    }

    /// Complete the simple-auth handshake and consume the header ack.
    pub async fn handshake(&mut self) {
        self.send_preamble(80).await;
        self.send_connection_header().await;
        let (ack, _) = self.read_response().await;
        assert_eq!(ack.call_id, -34, "expected connection header ack");
    }

    pub async fn expect_eof(&mut self) {
        let mut byte = [0u8; 1];
        assert_eq!(
            self.stream.read(&mut byte).await.expect("read eof"),
            0,
            "expected connection to be closed"
        );
    }
}

/// Scheduler answering every call with its own payload.
pub struct EchoScheduler {
    pub dispatched: AtomicUsize,
}

impl EchoScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatched: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RpcScheduler for EchoScheduler {
    async fn dispatch(&self, call: CallResponder) -> Result<(), DispatchRejection> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        if call.call().header().map(|header| header.method_id) == Some(404) {
            return Err(DispatchRejection {
                error: SchedulerError::UnknownMethod { method_id: 404 },
                call,
            });
        }
        let payload = call.call().payload().clone();
        tokio::spawn(async move {
            let _ = call.respond(Ok(payload)).await;
        });
        Ok(())
    }
}

/// Scheduler that parks responders until the test releases them.
#[derive(Default)]
pub struct HoldingScheduler {
    pub held: Mutex<Vec<CallResponder>>,
}

impl HoldingScheduler {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Answer the held call with the given id, if present.
    pub async fn release(&self, call_id: i32, payload: &'static [u8]) {
        let mut held = self.held.lock().await;
        let index = held
            .iter()
            .position(|responder| responder.call().id() == call_id)
            .expect("held call");
        let responder = held.swap_remove(index);
        drop(held);
        responder
            .respond(Ok(Bytes::from_static(payload)))
            .await
            .expect("respond");
    }
}

#[async_trait]
impl RpcScheduler for HoldingScheduler {
    async fn dispatch(&self, call: CallResponder) -> Result<(), DispatchRejection> {
        self.held.lock().await.push(call);
        Ok(())
    }
}

/// Route crate logs to the test harness once per binary.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Bind and start a server with the echo scheduler.
pub async fn start_echo_server(config: ServerConfig) -> (RpcServer, Arc<EchoScheduler>) {
    init_tracing();
    let scheduler = EchoScheduler::new();
    let server = RpcServer::bind(
        "127.0.0.1:0".parse().expect("addr"),
        config,
        Arc::clone(&scheduler) as Arc<dyn RpcScheduler>,
        None,
    )
    .expect("bind");
    server.start();
    (server, scheduler)
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F>(mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
