//! Scheduler boundary for decoded calls.
//!
//! The connection layer only enqueues: once a call is handed to the
//! [`RpcScheduler`] the I/O task has no further involvement until the
//! scheduler answers through the call's [`CallResponder`].

use async_trait::async_trait;
use thiserror::Error;

use crate::call::CallResponder;

/// Reasons a scheduler may refuse a call at the dispatch boundary.
///
/// Rejections are per-call: the connection answers with an error response
/// and stays open.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No method is registered under the requested id.
    #[error("unknown method {method_id}")]
    UnknownMethod {
        /// Method id from the request header.
        method_id: u32,
    },
    /// The scheduler refused the call, for example because its queue is
    /// full.
    #[error("call rejected: {0}")]
    Rejected(String),
}

/// A dispatch refusal, returning the responder so the caller can answer the
/// client.
#[derive(Debug)]
pub struct DispatchRejection {
    /// The unanswered call.
    pub call: CallResponder,
    /// Why the scheduler refused it.
    pub error: SchedulerError,
}

/// Executes business logic for decoded calls.
///
/// `dispatch` must only enqueue; it is awaited on the connection's I/O task
/// and must not block on business-logic completion. The response is produced
/// later, on any thread, through the responder.
#[async_trait]
pub trait RpcScheduler: Send + Sync + 'static {
    /// Accept a decoded call for execution.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchRejection`] carrying the responder back when the
    /// call cannot be accepted; the caller turns it into an error response.
    async fn dispatch(&self, call: CallResponder) -> Result<(), DispatchRejection>;
}
