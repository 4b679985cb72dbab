//! Authentication negotiation sub-protocol.
//!
//! While a connection requires negotiation, every inbound frame is a
//! negotiation message rather than an RPC call. The cryptographic mechanism
//! itself lives behind the [`Negotiator`] trait; this module owns the reply
//! framing and the forced-downgrade notice.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::wire::{AuthMethod, SWITCH_TO_SIMPLE_AUTH};

/// Status byte opening every negotiation reply: success or continuation.
pub const NEGOTIATION_SUCCESS: u8 = 0;
/// Status byte opening a terminal negotiation failure reply.
pub const NEGOTIATION_FAILURE: u8 = 1;

/// Terminal failure of the negotiation sub-protocol.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The mechanism rejected the client's token.
    #[error("{0}")]
    Failed(String),
    /// The client selected a method this server has no mechanism for.
    #[error("no negotiator available for auth method {method}")]
    Unsupported {
        /// The method the client asked for.
        method: AuthMethod,
    },
}

/// Outcome of evaluating one client negotiation message.
#[derive(Debug, PartialEq, Eq)]
pub enum NegotiationStep {
    /// Send this challenge back and wait for the client's next message.
    Challenge(Vec<u8>),
    /// Negotiation succeeded; subsequent frames are ordinary RPC traffic.
    Complete {
        /// Authenticated principal established by the exchange.
        principal: String,
    },
}

/// Server side of one connection's challenge/response exchange.
///
/// Implementations wrap the actual mechanism (SASL, token verification);
/// this layer feeds them raw message payloads and frames their answers.
pub trait Negotiator: Send {
    /// Evaluate one client message and produce the next step.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] on terminal failure; the connection closes
    /// after flushing the failure reply.
    fn evaluate(&mut self, token: &[u8]) -> Result<NegotiationStep, AuthError>;
}

/// Creates a [`Negotiator`] for each connection that requires one.
pub trait NegotiatorProvider: Send + Sync + 'static {
    /// Create a negotiator for the given method.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unsupported`] if the method has no mechanism.
    fn create(&self, method: AuthMethod) -> Result<Box<dyn Negotiator>, AuthError>;
}

/// Encode a negotiation reply payload: one status byte then the token.
#[must_use]
pub fn encode_reply(status: u8, token: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + token.len());
    buf.put_u8(status);
    buf.put_slice(token);
    buf
}

/// Payload of the one-shot "switch to simple auth" instruction sent when a
/// client offers a secure method to a server without security.
#[must_use]
pub fn switch_to_simple_payload() -> BytesMut {
    encode_reply(NEGOTIATION_SUCCESS, &SWITCH_TO_SIMPLE_AUTH.to_be_bytes())
}
