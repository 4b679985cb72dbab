//! RPC server lifecycle: bind, accept, shut down.
//!
//! `RpcServer` owns the listening socket and a fixed pool of accept loops.
//! Accepted sockets become connection tasks tracked by a
//! [`TaskTracker`]; shutdown cancels every connection, waits for them to
//! drain, and releases the listener before the shutdown latch fires.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::NegotiatorProvider;
use crate::call::{CallResponder, ServerCall};
use crate::config::ServerConfig;
use crate::connection::registry::ConnectionRegistry;
use crate::connection::{self, ConnectionShared};
use crate::dispatch::RpcScheduler;
use crate::error::CallError;
use crate::wire::{self, RequestHeader};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

struct ServerInner {
    conn_shared: Arc<ConnectionShared>,
    scheduler: Arc<dyn RpcScheduler>,
    registry: Arc<ConnectionRegistry>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    worker_threads: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    stopping: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// TCP front-end for the RPC layer.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Bind a listener and prepare the server. No connections are accepted
    /// until [`start`](Self::start) is called.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if binding fails.
    pub fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        scheduler: Arc<dyn RpcScheduler>,
        negotiators: Option<Arc<dyn NegotiatorProvider>>,
    ) -> io::Result<Self> {
        let std_listener = StdTcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        info!(
            "rpc server bound: addr={local_addr}, workers={}, native_transport={}",
            config.worker_threads,
            config.native_transport_active(),
        );
        let worker_threads = config.worker_threads;
        let conn_shared = Arc::new(ConnectionShared {
            config,
            scheduler: Arc::clone(&scheduler),
            negotiators,
        });
        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServerInner {
                conn_shared,
                scheduler,
                registry: Arc::new(ConnectionRegistry::default()),
                listener: Mutex::new(Some(Arc::new(listener))),
                local_addr,
                worker_threads,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                closed_tx,
            }),
        })
    }

    /// Start accepting connections. A second call is a no-op.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) || inner.stopping.load(Ordering::SeqCst) {
            return;
        }
        let listener = {
            let slot = inner.listener.lock().unwrap_or_else(|e| e.into_inner());
            slot.as_ref().map(Arc::clone)
        };
        let Some(listener) = listener else { return };
        for _ in 0..inner.worker_threads {
            inner.tracker.spawn(accept_loop(
                Arc::clone(inner),
                Arc::clone(&listener),
            ));
        }
    }

    /// Stop the server: cancel every open connection, wait for all tasks to
    /// finish, then release the listening socket.
    ///
    /// Stopping an already-stopped (or stopping) server is a no-op.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping rpc server: addr={}", inner.local_addr);
        inner.shutdown.cancel();
        inner.registry.close_all();
        inner.tracker.close();
        inner.tracker.wait().await;
        {
            let mut slot = inner.listener.lock().unwrap_or_else(|e| e.into_inner());
            slot.take();
        }
        let _ = inner.closed_tx.send(true);
    }

    /// Block until the server has fully stopped.
    pub async fn join(&self) {
        let mut closed = self.inner.closed_tx.subscribe();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.inner.local_addr }

    /// Number of open client connections. The listening socket is not
    /// counted.
    #[must_use]
    pub fn num_open_connections(&self) -> usize { self.inner.registry.len() }

    /// Invoke a method in process, bypassing the network path.
    ///
    /// The call flows through the same lifecycle and scheduler boundary as
    /// a network call, on a synthetic `-1` id.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] if the scheduler rejects the call, the call
    /// is dropped unanswered, or the scheduler reports an error outcome.
    pub async fn call(
        &self,
        method_id: u32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, CallError> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let header = RequestHeader {
            call_id: -1,
            method_id,
            timeout_ms,
            cell_block_len: 0,
        };
        let call = ServerCall::new(-1, Some(header), payload, None, timeout);
        let (responder, response) = CallResponder::local(call);
        if let Err(rejection) = self.inner.scheduler.dispatch(responder).await {
            return Err(CallError::Remote(rejection.error.to_string()));
        }
        let call = response
            .await
            .map_err(|_| CallError::ConnectionClosed { call_id: -1 })?;
        let frame = call
            .response()
            .cloned()
            .ok_or(CallError::ConnectionClosed { call_id: -1 })?;
        call.complete();
        let (header, payload) = wire::decode_response_frame(&frame)?;
        match header.error {
            Some(message) => Err(CallError::Remote(message)),
            None => Ok(payload),
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: Arc<TcpListener>) {
    let mut delay = ACCEPT_BACKOFF_INITIAL;
    loop {
        tokio::select! {
            biased;

            () = inner.shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    delay = ACCEPT_BACKOFF_INITIAL;
                    configure_stream(&stream, &inner.conn_shared.config, peer);
                    spawn_connection(&inner, stream, peer);
                }
                Err(error) => {
                    warn!("accept failed: {error}");
                    sleep(delay).await;
                    delay = (delay * 2).min(ACCEPT_BACKOFF_MAX);
                }
            },
        }
    }
}

fn spawn_connection(inner: &Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let token = inner.shutdown.child_token();
    let guard = inner.registry.register(Some(peer), token.clone());
    let shared = Arc::clone(&inner.conn_shared);
    debug!("connection accepted: peer={peer}, open={}", inner.registry.len());
    let registry = Arc::clone(&inner.registry);
    inner.tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(connection::run(stream, Some(peer), shared, token))
            .catch_unwind();
        if let Err(panic) = fut.await {
            let message = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string panic>");
            error!("connection task panicked: peer={peer}, panic={message}");
        }
        drop(guard);
        debug!("connection removed: peer={peer}, open={}", registry.len());
    });
}

fn configure_stream(stream: &TcpStream, config: &ServerConfig, peer: SocketAddr) {
    if config.tcp_nodelay
        && let Err(error) = stream.set_nodelay(true)
    {
        warn!("failed to set TCP_NODELAY: peer={peer}, error={error}");
    }
    if config.tcp_keepalive
        && let Err(error) = socket2::SockRef::from(stream).set_keepalive(true)
    {
        warn!("failed to set SO_KEEPALIVE: peer={peer}, error={error}");
    }
}
