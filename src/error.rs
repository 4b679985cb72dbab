//! Connection- and call-level error types.

use thiserror::Error;

use crate::frame::FrameError;
use crate::wire::WireError;

/// Unrecoverable handshake or framing failures.
///
/// Each variant is reported to the client as a best-effort error frame and
/// then the connection is closed; none are retried.
#[derive(Debug, Error)]
pub enum FatalConnectionError {
    /// The first four bytes did not match the expected magic.
    #[error("expected magic {expected:?} but received {got:?}")]
    BadMagic {
        /// Magic this server accepts.
        expected: [u8; 4],
        /// Bytes the client actually sent.
        got: [u8; 4],
    },
    /// The preamble named a protocol version this server does not speak.
    #[error("unsupported protocol version {got}, server speaks version {supported}")]
    WrongVersion {
        /// Version byte from the preamble.
        got: u8,
        /// The single supported version.
        supported: u8,
    },
    /// The preamble's auth-method byte is not a recognized code.
    #[error("unrecognized auth method code {got}")]
    BadAuthCode {
        /// Code byte from the preamble.
        got: u8,
    },
    /// The server requires authentication and fallback to simple auth is
    /// disallowed.
    #[error("authentication is required")]
    AuthenticationRequired,
    /// The connection header could not be decoded.
    #[error("malformed connection header: {0}")]
    MalformedConnectionHeader(WireError),
    /// Framing-level corruption; the stream position can no longer be
    /// trusted.
    #[error(transparent)]
    CorruptFrame(#[from] FrameError),
}

/// Errors from completing a call or awaiting its response.
#[derive(Debug, Error)]
pub enum CallError {
    /// A response was already assigned to this call.
    #[error("response already set for call {call_id}")]
    ResponseAlreadySet {
        /// Id of the offending call.
        call_id: i32,
    },
    /// The owning connection closed before the response could be queued.
    #[error("connection closed before response for call {call_id} was written")]
    ConnectionClosed {
        /// Id of the orphaned call.
        call_id: i32,
    },
    /// The remote end of an in-process call reported an error.
    #[error("call failed: {0}")]
    Remote(String),
    /// A wire message could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}
