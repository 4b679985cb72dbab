//! Call lifecycle: one request/response pair from arrival to completion.
//!
//! A [`ServerCall`] carries the decoded request, its eventual serialized
//! response, a cleanup action for pooled input buffers, and a completion
//! hook. The response is set exactly once and the completion hook fires
//! exactly once, whichever of the normal, error, or abort paths reaches it
//! first, from whatever thread gets there first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::CallError;
use crate::wire::{self, RequestHeader};

/// Cleanup action releasing any pooled buffers referenced by a call. Runs at
/// most once.
pub type CallCleanup = Box<dyn FnOnce() + Send + 'static>;

/// Hook invoked when a call reaches its terminal state. Fires exactly once.
pub type CompletionHook = Box<dyn FnOnce() + Send + 'static>;

/// One RPC request and its response, protocol sentinels included.
///
/// Dropping an incomplete call completes it, so calls abandoned by a
/// connection abort still run their cleanup and completion hook.
pub struct ServerCall {
    id: i32,
    header: Option<RequestHeader>,
    payload: Bytes,
    cell_block: Option<Bytes>,
    received_at: Instant,
    timeout: Duration,
    response: OnceLock<Bytes>,
    done: AtomicBool,
    cleanup: Mutex<Option<CallCleanup>>,
    on_done: Mutex<Option<CompletionHook>>,
}

impl ServerCall {
    /// Create a call for a decoded request.
    #[must_use]
    pub fn new(
        id: i32,
        header: Option<RequestHeader>,
        payload: Bytes,
        cell_block: Option<Bytes>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            header,
            payload,
            cell_block,
            received_at: Instant::now(),
            timeout,
            response: OnceLock::new(),
            done: AtomicBool::new(false),
            cleanup: Mutex::new(None),
            on_done: Mutex::new(None),
        }
    }

    /// Create an empty call reserved for a protocol-level response.
    #[must_use]
    pub fn protocol(id: i32) -> Self {
        Self::new(id, None, Bytes::new(), None, Duration::ZERO)
    }

    /// Correlation id. Negative ids are protocol-internal.
    #[must_use]
    pub fn id(&self) -> i32 { self.id }

    /// Decoded request header, absent on protocol sentinels.
    #[must_use]
    pub fn header(&self) -> Option<&RequestHeader> { self.header.as_ref() }

    /// Request payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Side-channel data block, if the request carried one.
    #[must_use]
    pub fn cell_block(&self) -> Option<&Bytes> { self.cell_block.as_ref() }

    /// Instant the request arrived.
    #[must_use]
    pub fn received_at(&self) -> Instant { self.received_at }

    /// Timeout budget carried for the scheduler. Never enforced here.
    #[must_use]
    pub fn timeout(&self) -> Duration { self.timeout }

    /// Install the cleanup action for this call's input buffers.
    pub fn set_cleanup(&self, cleanup: CallCleanup) {
        if let Ok(mut slot) = self.cleanup.lock() {
            *slot = Some(cleanup);
        }
    }

    /// Install the completion hook.
    pub fn on_completion(&self, hook: CompletionHook) {
        if let Ok(mut slot) = self.on_done.lock() {
            *slot = Some(hook);
        }
    }

    /// Assign the serialized response. Response buffers are immutable once
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ResponseAlreadySet`] on a second assignment.
    pub fn set_response(&self, response: Bytes) -> Result<(), CallError> {
        self.response
            .set(response)
            .map_err(|_| CallError::ResponseAlreadySet { call_id: self.id })
    }

    /// The serialized response, once assigned.
    #[must_use]
    pub fn response(&self) -> Option<&Bytes> { self.response.get() }

    /// Transition to `Done`: run cleanup, then the completion hook.
    ///
    /// Safe to invoke from any thread and any number of times; only the
    /// first invocation has an effect.
    pub fn complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.cleanup.lock()
            && let Some(cleanup) = slot.take()
        {
            cleanup();
        }
        if let Ok(mut slot) = self.on_done.lock()
            && let Some(hook) = slot.take()
        {
            hook();
        }
    }

    /// Whether the call has reached its terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool { self.done.load(Ordering::Acquire) }
}

impl Drop for ServerCall {
    fn drop(&mut self) { self.complete(); }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

pub(crate) enum ResponseSink {
    /// Queue feeding the owning connection's response writer.
    Queue(mpsc::Sender<ServerCall>),
    /// One-shot delivery for in-process callers.
    Local(oneshot::Sender<ServerCall>),
}

/// Single-use handle the scheduler uses to finish a call.
///
/// Responding serializes the outcome into the call's response buffer and
/// hands the call to the response writer (or an in-process receiver). The
/// handle is consumed either way, so a call can only be answered once.
pub struct CallResponder {
    call: ServerCall,
    sink: ResponseSink,
}

impl CallResponder {
    pub(crate) fn for_connection(call: ServerCall, queue: mpsc::Sender<ServerCall>) -> Self {
        Self {
            call,
            sink: ResponseSink::Queue(queue),
        }
    }

    /// Create a responder delivering the finished call to a oneshot
    /// receiver, bypassing the network path.
    #[must_use]
    pub fn local(call: ServerCall) -> (Self, oneshot::Receiver<ServerCall>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                call,
                sink: ResponseSink::Local(tx),
            },
            rx,
        )
    }

    /// The call awaiting this response.
    #[must_use]
    pub fn call(&self) -> &ServerCall { &self.call }

    /// Serialize `outcome` as this call's response and queue it for writing.
    ///
    /// The call completes even when queueing fails, so cleanup is never
    /// skipped on a dead connection.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ConnectionClosed`] if the owning connection shut
    /// down first, or a wire error if the outcome cannot be serialized.
    pub async fn respond(self, outcome: Result<Bytes, String>) -> Result<(), CallError> {
        let frame = wire::encode_response_frame(self.call.id(), &outcome)?;
        self.call.set_response(frame)?;
        match self.sink {
            ResponseSink::Queue(queue) => queue.send(self.call).await.map_err(|err| {
                let call = err.0;
                let call_id = call.id();
                call.complete();
                CallError::ConnectionClosed { call_id }
            }),
            ResponseSink::Local(tx) => tx.send(self.call).map_err(|call| {
                let call_id = call.id();
                call.complete();
                CallError::ConnectionClosed { call_id }
            }),
        }
    }
}

impl std::fmt::Debug for CallResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallResponder")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}
