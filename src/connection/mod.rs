//! Per-connection protocol state machine.
//!
//! Each accepted socket gets one [`Connection`] driving a strict phase
//! sequence: preamble, optional auth negotiation, connection header, then
//! steady-state call decoding. The read half is owned by the connection
//! task; a paired writer task owns the write half and is fed through a
//! response queue, so responses never block frame decoding.
//!
//! The handler-pipeline of the wire protocol is expressed as a phase tag and
//! a single dispatch point rather than replaceable stream handlers.

pub(crate) mod registry;
pub(crate) mod writer;

use std::mem;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{
    self, NEGOTIATION_FAILURE, NEGOTIATION_SUCCESS, NegotiationStep, Negotiator,
    NegotiatorProvider,
};
use crate::call::{CallResponder, ServerCall};
use crate::config::ServerConfig;
use crate::dispatch::RpcScheduler;
use crate::error::FatalConnectionError;
use crate::frame::{self, FrameDecoder, LENGTH_PREFIX_LEN};
use crate::metrics;
use crate::preamble::{PREAMBLE_LEN, Preamble};
use crate::wire::{
    self, AUTHORIZATION_FAILED_CALL_ID, AuthMethod, CONNECTION_HEADER_ACK_CALL_ID,
    ConnectionHeader, NEGOTIATION_CALL_ID, RequestHeader,
};

const RESPONSE_QUEUE_DEPTH: usize = 64;
const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Handshake phase of a connection. Transitions are strictly forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    AwaitingPreamble,
    AwaitingNegotiation,
    AwaitingConnectionHeader,
    SteadyState,
    Closed,
}

/// Collaborators shared by every connection of a server.
pub(crate) struct ConnectionShared {
    pub(crate) config: ServerConfig,
    pub(crate) scheduler: Arc<dyn RpcScheduler>,
    pub(crate) negotiators: Option<Arc<dyn NegotiatorProvider>>,
}

/// State for one accepted socket.
pub(crate) struct Connection {
    shared: Arc<ConnectionShared>,
    peer: Option<SocketAddr>,
    phase: Phase,
    decoder: FrameDecoder,
    auth_method: Option<AuthMethod>,
    preamble_read: bool,
    connection_header_read: bool,
    uses_negotiation: bool,
    skip_initial_negotiation: bool,
    authenticated_via_fallback: bool,
    negotiator: Option<Box<dyn Negotiator>>,
    header: Option<ConnectionHeader>,
    // Sentinel calls reserved for protocol-level responses. Sending one
    // replaces it so later replies on the same channel stay single-use.
    negotiation_call: ServerCall,
    header_ack_call: ServerCall,
    auth_failed_call: ServerCall,
    responses: mpsc::Sender<ServerCall>,
}

/// Drive one connection until the peer disconnects, the server shuts down,
/// or a fatal protocol violation occurs.
///
/// The stream is split; the write half moves into a writer task that drains
/// and flushes any queued responses before the socket is shut down, so
/// "close after flush" holds on every exit path.
pub(crate) async fn run<S>(
    stream: S,
    peer: Option<SocketAddr>,
    shared: Arc<ConnectionShared>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (responses, queue) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    let done = CancellationToken::new();
    let writer_task = tokio::spawn(writer::run_writer(write_half, queue, done.clone()));

    let mut connection = Connection::new(shared, peer, responses);
    connection.read_loop(read_half, shutdown).await;
    drop(connection);
    done.cancel();

    // Wait for the writer to flush whatever was already queued. Responders
    // still held by the scheduler see a closed queue from now on.
    if let Err(error) = writer_task.await {
        warn!(?peer, %error, "connection writer task failed");
    }
    debug!(?peer, "connection closed");
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        peer: Option<SocketAddr>,
        responses: mpsc::Sender<ServerCall>,
    ) -> Self {
        let decoder = FrameDecoder::new(shared.config.max_request_size);
        Self {
            shared,
            peer,
            phase: Phase::AwaitingPreamble,
            decoder,
            auth_method: None,
            preamble_read: false,
            connection_header_read: false,
            uses_negotiation: false,
            skip_initial_negotiation: false,
            authenticated_via_fallback: false,
            negotiator: None,
            header: None,
            negotiation_call: ServerCall::protocol(NEGOTIATION_CALL_ID),
            header_ack_call: ServerCall::protocol(CONNECTION_HEADER_ACK_CALL_ID),
            auth_failed_call: ServerCall::protocol(AUTHORIZATION_FAILED_CALL_ID),
            responses,
        }
    }

    async fn read_loop<R>(&mut self, mut reader: R, shutdown: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!(peer = ?self.peer, "client disconnected");
                        break;
                    }
                    Ok(_) => {
                        if self.on_bytes(&mut buf).await.is_break() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(peer = ?self.peer, %error, "read failed");
                        metrics::inc_errors();
                        break;
                    }
                },
            }
        }
        self.phase = Phase::Closed;
    }

    /// Consume as much of the buffered input as the current phase allows.
    async fn on_bytes(&mut self, buf: &mut BytesMut) -> ControlFlow<()> {
        loop {
            if self.phase == Phase::AwaitingPreamble {
                // The preamble is the only unframed input.
                if buf.len() < PREAMBLE_LEN {
                    return ControlFlow::Continue(());
                }
                let mut bytes = [0u8; PREAMBLE_LEN];
                bytes.copy_from_slice(&buf.split_to(PREAMBLE_LEN));
                metrics::add_received_bytes(PREAMBLE_LEN as u64);
                self.handle_preamble(&bytes).await?;
                continue;
            }
            match self.decoder.decode(buf) {
                Ok(Some(payload)) => {
                    metrics::add_received_bytes((payload.len() + LENGTH_PREFIX_LEN) as u64);
                    self.process_frame(payload.freeze()).await?;
                }
                Ok(None) => return ControlFlow::Continue(()),
                Err(error) => {
                    metrics::inc_errors();
                    self.fatal(FatalConnectionError::CorruptFrame(error)).await;
                    return ControlFlow::Break(());
                }
            }
        }
    }

    async fn handle_preamble(&mut self, bytes: &[u8; PREAMBLE_LEN]) -> ControlFlow<()> {
        let preamble = match Preamble::parse(bytes) {
            Ok(preamble) => preamble,
            Err(error) => {
                warn!(peer = ?self.peer, %error, "bad connection preamble");
                metrics::inc_errors();
                self.fatal(error).await;
                return ControlFlow::Break(());
            }
        };
        let mut method = preamble.auth_method;
        let security_enabled = self.shared.config.security_enabled;

        if security_enabled && method == AuthMethod::Simple {
            if self.shared.config.allow_fallback_to_simple_auth {
                metrics::inc_auth_fallbacks();
                self.authenticated_via_fallback = true;
            } else {
                warn!(peer = ?self.peer, "rejecting unauthenticated client");
                let call = mem::replace(
                    &mut self.auth_failed_call,
                    ServerCall::protocol(AUTHORIZATION_FAILED_CALL_ID),
                );
                let message = FatalConnectionError::AuthenticationRequired.to_string();
                self.send_protocol_response(call, Err(message)).await;
                return ControlFlow::Break(());
            }
        }

        if !security_enabled && method.requires_negotiation() {
            // The client already sent its first negotiation message; it is
            // read and discarded when it arrives. Both sides use simple
            // auth from here on.
            debug!(peer = ?self.peer, %method, "instructing client to switch to simple auth");
            self.send_negotiation_reply(auth::switch_to_simple_payload().freeze())
                .await;
            method = AuthMethod::Simple;
            self.skip_initial_negotiation = true;
        }

        self.auth_method = Some(method);
        self.preamble_read = true;

        if method.requires_negotiation() {
            let provider = self.shared.negotiators.clone();
            let negotiator = provider
                .ok_or(auth::AuthError::Unsupported { method })
                .and_then(|provider| provider.create(method));
            match negotiator {
                Ok(negotiator) => {
                    self.uses_negotiation = true;
                    self.negotiator = Some(negotiator);
                    self.phase = Phase::AwaitingNegotiation;
                }
                Err(error) => {
                    warn!(peer = ?self.peer, %error, "cannot negotiate requested auth method");
                    metrics::inc_errors();
                    let reply =
                        auth::encode_reply(NEGOTIATION_FAILURE, error.to_string().as_bytes());
                    self.send_negotiation_reply(reply.freeze()).await;
                    return ControlFlow::Break(());
                }
            }
        } else {
            self.phase = Phase::AwaitingConnectionHeader;
        }
        ControlFlow::Continue(())
    }

    async fn process_frame(&mut self, payload: Bytes) -> ControlFlow<()> {
        if self.skip_initial_negotiation {
            // Absorb the one negotiation message the client sent before it
            // observed the downgrade notice. Whatever the frame holds, it
            // is consumed here and only here.
            self.skip_initial_negotiation = false;
            debug!(peer = ?self.peer, "discarding stray negotiation message after downgrade");
            return ControlFlow::Continue(());
        }
        match self.phase {
            Phase::AwaitingNegotiation => self.process_negotiation(&payload).await,
            Phase::AwaitingConnectionHeader => self.process_connection_header(&payload).await,
            Phase::SteadyState => self.process_call(payload).await,
            Phase::AwaitingPreamble | Phase::Closed => ControlFlow::Break(()),
        }
    }

    async fn process_negotiation(&mut self, payload: &[u8]) -> ControlFlow<()> {
        debug_assert!(self.preamble_read);
        let Some(negotiator) = self.negotiator.as_mut() else {
            return ControlFlow::Break(());
        };
        match negotiator.evaluate(payload) {
            Ok(NegotiationStep::Challenge(challenge)) => {
                let reply = auth::encode_reply(NEGOTIATION_SUCCESS, &challenge);
                self.send_negotiation_reply(reply.freeze()).await;
                ControlFlow::Continue(())
            }
            Ok(NegotiationStep::Complete { principal }) => {
                debug!(peer = ?self.peer, %principal, "auth negotiation complete");
                let reply = auth::encode_reply(NEGOTIATION_SUCCESS, &[]);
                self.send_negotiation_reply(reply.freeze()).await;
                self.negotiator = None;
                self.phase = Phase::AwaitingConnectionHeader;
                ControlFlow::Continue(())
            }
            Err(error) => {
                warn!(peer = ?self.peer, %error, "auth negotiation failed");
                metrics::inc_errors();
                let reply = auth::encode_reply(NEGOTIATION_FAILURE, error.to_string().as_bytes());
                self.send_negotiation_reply(reply.freeze()).await;
                ControlFlow::Break(())
            }
        }
    }

    async fn process_connection_header(&mut self, payload: &[u8]) -> ControlFlow<()> {
        debug_assert!(self.preamble_read);
        match wire::decode_message::<ConnectionHeader>(payload) {
            Ok((header, _)) => {
                debug!(
                    peer = ?self.peer,
                    service = %header.service,
                    auth_method = ?self.auth_method,
                    fallback = self.authenticated_via_fallback,
                    negotiated = self.uses_negotiation,
                    "connection header read",
                );
                self.header = Some(header);
                self.connection_header_read = true;
                let ack = mem::replace(
                    &mut self.header_ack_call,
                    ServerCall::protocol(CONNECTION_HEADER_ACK_CALL_ID),
                );
                self.send_protocol_response(ack, Ok(Bytes::new())).await;
                self.phase = Phase::SteadyState;
                ControlFlow::Continue(())
            }
            Err(error) => {
                self.fatal(FatalConnectionError::MalformedConnectionHeader(error))
                    .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn process_call(&mut self, payload: Bytes) -> ControlFlow<()> {
        debug_assert!(self.connection_header_read);
        let (header, consumed) = match wire::decode_message::<RequestHeader>(&payload) {
            Ok(decoded) => decoded,
            Err(error) => {
                // A malformed request body does not close the connection.
                warn!(peer = ?self.peer, %error, "malformed request header");
                metrics::inc_errors();
                let reply = ServerCall::protocol(AUTHORIZATION_FAILED_CALL_ID);
                self.send_protocol_response(
                    reply,
                    Err(format!("malformed request header: {error}")),
                )
                .await;
                return ControlFlow::Continue(());
            }
        };
        let body = payload.slice(consumed..);
        let cell_block_len = header.cell_block_len as usize;
        if cell_block_len > body.len() {
            warn!(peer = ?self.peer, call_id = header.call_id, "cell block exceeds request body");
            metrics::inc_errors();
            let reply = ServerCall::protocol(header.call_id);
            self.send_protocol_response(
                reply,
                Err("cell block length exceeds request body".to_string()),
            )
            .await;
            return ControlFlow::Continue(());
        }
        let split_at = body.len() - cell_block_len;
        let cell_block = (cell_block_len > 0).then(|| body.slice(split_at..));
        let call = ServerCall::new(
            header.call_id,
            Some(header),
            body.slice(..split_at),
            cell_block,
            Duration::from_millis(u64::from(header.timeout_ms)),
        );
        let responder = CallResponder::for_connection(call, self.responses.clone());
        if let Err(rejection) = self.shared.scheduler.dispatch(responder).await {
            debug!(
                peer = ?self.peer,
                call_id = header.call_id,
                service = self.header.as_ref().map(|h| h.service.as_str()),
                error = %rejection.error,
                "call rejected at dispatch",
            );
            let message = rejection.error.to_string();
            if let Err(error) = rejection.call.respond(Err(message)).await {
                debug!(peer = ?self.peer, %error, "failed to answer rejected call");
            }
        }
        ControlFlow::Continue(())
    }

    /// Best-effort fatal reply on a synthetic call, sent before the caller
    /// tears the connection down.
    async fn fatal(&mut self, error: FatalConnectionError) {
        let call = ServerCall::protocol(-1);
        self.send_protocol_response(call, Err(error.to_string()))
            .await;
        self.phase = Phase::Closed;
    }

    /// Queue a header-framed protocol response on a sentinel call.
    async fn send_protocol_response(&mut self, call: ServerCall, outcome: Result<Bytes, String>) {
        match wire::encode_response_frame(call.id(), &outcome) {
            Ok(response) => {
                if call.set_response(response).is_ok() {
                    // A failed send drops the call, which completes it.
                    let _ = self.responses.send(call).await;
                }
            }
            Err(error) => {
                warn!(peer = ?self.peer, %error, "failed to encode protocol response");
            }
        }
    }

    /// Queue a raw negotiation reply frame (no response header).
    async fn send_negotiation_reply(&mut self, payload: Bytes) {
        let call = mem::replace(
            &mut self.negotiation_call,
            ServerCall::protocol(NEGOTIATION_CALL_ID),
        );
        let mut framed = BytesMut::new();
        match frame::encode_frame(&payload, &mut framed) {
            Ok(()) => {
                if call.set_response(framed.freeze()).is_ok() {
                    let _ = self.responses.send(call).await;
                }
            }
            Err(error) => {
                warn!(peer = ?self.peer, %error, "failed to frame negotiation reply");
            }
        }
    }
}
