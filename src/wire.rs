//! Wire constants and serialized message types.
//!
//! Headers are encoded with bincode's big-endian fixed-int profile so every
//! integer on the wire has a stable width and byte order. The constants in
//! this module pin the handshake byte values clients are expected to send.

use bincode::config::Configuration;
use bincode::error::{DecodeError, EncodeError};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::{self, LENGTH_PREFIX_LEN};

/// Magic bytes opening every connection.
pub const RPC_MAGIC: [u8; 4] = *b"HBas";

/// The single protocol version this server speaks.
pub const CURRENT_VERSION: u8 = 0;

/// Call id used for negotiation-exchange replies.
pub const NEGOTIATION_CALL_ID: i32 = -33;

/// Call id used for the connection-header acknowledgement.
pub const CONNECTION_HEADER_ACK_CALL_ID: i32 = -34;

/// Call id used for authorization-rejected replies and fatal handshake
/// errors delivered just before closing.
pub const AUTHORIZATION_FAILED_CALL_ID: i32 = -1;

/// Payload of the forced-downgrade notice: the client must restart the
/// handshake using simple authentication.
pub const SWITCH_TO_SIMPLE_AUTH: i32 = -88;

/// Authentication method selected by the preamble's final byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; the client asserts its identity.
    Simple,
    /// Negotiated secure authentication via the challenge/response
    /// sub-protocol.
    Secure,
    /// Token-based authentication, also negotiated.
    Token,
}

impl AuthMethod {
    /// Decode an auth-method byte from the preamble.
    ///
    /// The codes occupy the 80 range; there is no zero code, so a `0` byte
    /// is an unrecognized method and fails the preamble.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            80 => Some(Self::Simple),
            81 => Some(Self::Secure),
            82 => Some(Self::Token),
            _ => None,
        }
    }

    /// Wire code for this method.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Simple => 80,
            Self::Secure => 81,
            Self::Token => 82,
        }
    }

    /// Whether this method requires the negotiation sub-protocol.
    #[must_use]
    pub fn requires_negotiation(self) -> bool { !matches!(self, Self::Simple) }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Simple => "SIMPLE",
            Self::Secure => "SECURE",
            Self::Token => "TOKEN",
        };
        f.write_str(name)
    }
}

/// Header sent once per connection, after the handshake completes.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ConnectionHeader {
    /// Service the client intends to call.
    pub service: String,
    /// Identity asserted by the client under simple auth.
    pub user: Option<String>,
    /// Codec name for side-channel cell blocks, if the client sends any.
    pub cell_codec: Option<String>,
}

/// Header opening every steady-state request frame.
///
/// The frame body is `RequestHeader`, then the request payload, then
/// `cell_block_len` bytes of side-channel data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RequestHeader {
    /// Correlation token chosen by the client. Negative ids are reserved
    /// for protocol-internal calls.
    pub call_id: i32,
    /// Target method identifier, resolved by the scheduler.
    pub method_id: u32,
    /// Timeout budget in milliseconds. Carried to the scheduler, never
    /// enforced here.
    pub timeout_ms: u32,
    /// Length of the trailing side-channel block.
    pub cell_block_len: u32,
}

/// Header opening every response frame.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ResponseHeader {
    /// Correlation token echoed from the request.
    pub call_id: i32,
    /// Error message when the call failed; `None` on success.
    pub error: Option<String>,
}

/// Errors from serializing or deserializing wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// A message failed to encode.
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    /// A message failed to decode.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    /// A frame carried fewer bytes than its headers demand.
    #[error("message truncated: {0}")]
    Truncated(&'static str),
    /// The payload was too large to frame.
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
}

/// Bincode profile shared by every header on the wire.
#[must_use]
pub fn wire_config() -> Configuration<
    bincode::config::BigEndian,
    bincode::config::Fixint,
> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Encode a header value with the wire profile.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if bincode rejects the value.
pub fn encode_message<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(bincode::encode_to_vec(value, wire_config())?)
}

/// Decode a header value with the wire profile, returning the value and the
/// number of bytes consumed.
///
/// # Errors
///
/// Returns [`WireError::Decode`] if the bytes do not form a valid `T`.
pub fn decode_message<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<(T, usize), WireError> {
    Ok(bincode::decode_from_slice(bytes, wire_config())?)
}

/// Build a complete, length-prefixed response frame for `call_id`.
///
/// A successful outcome carries the response payload; a failed one carries
/// the error message in the header and an empty payload.
///
/// # Errors
///
/// Returns a [`WireError`] if the header fails to encode or the result does
/// not fit a frame.
pub fn encode_response_frame(
    call_id: i32,
    outcome: &Result<Bytes, String>,
) -> Result<Bytes, WireError> {
    let header = ResponseHeader {
        call_id,
        error: outcome.as_ref().err().cloned(),
    };
    let header_bytes = encode_message(&header)?;
    let payload = outcome.as_ref().map(Bytes::clone).unwrap_or_default();
    let mut body = BytesMut::with_capacity(header_bytes.len() + payload.len());
    body.put_slice(&header_bytes);
    body.put_slice(&payload);
    let mut framed = BytesMut::new();
    frame::encode_frame(&body, &mut framed)?;
    Ok(framed.freeze())
}

/// Decode a length-prefixed response frame into its header and payload.
///
/// # Errors
///
/// Returns a [`WireError`] if the frame is shorter than its prefix claims or
/// the header fails to decode.
pub fn decode_response_frame(frame: &[u8]) -> Result<(ResponseHeader, Bytes), WireError> {
    if frame.len() < LENGTH_PREFIX_LEN {
        return Err(WireError::Truncated("missing length prefix"));
    }
    let declared =
        u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[LENGTH_PREFIX_LEN..];
    if body.len() != declared {
        return Err(WireError::Truncated("frame body shorter than prefix"));
    }
    let (header, consumed) = decode_message::<ResponseHeader>(body)?;
    Ok((header, Bytes::copy_from_slice(&body[consumed..])))
}
