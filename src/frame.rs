//! Length-prefixed frame decoding and encoding.
//!
//! Every post-preamble message on the wire is a frame: a 4-byte big-endian
//! length followed by exactly that many payload bytes. The decoder buffers
//! partial input and only ever yields complete payloads, so downstream
//! decoders never see a truncated message.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Size of the length prefix preceding each frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors produced while framing or deframing the byte stream.
///
/// Framing errors are fatal to the connection: once the stream position is
/// untrustworthy there is no way to resynchronise.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The advertised payload length exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge {
        /// Length declared by the prefix.
        len: usize,
        /// Configured maximum request size.
        max: usize,
    },
    /// A payload too large to describe with a 4-byte prefix was encoded.
    #[error("frame payload of {len} bytes does not fit a u32 length prefix")]
    PrefixOverflow {
        /// Length of the offending payload.
        len: usize,
    },
}

/// Incremental decoder for length-prefixed frames.
///
/// The decoder holds no buffered state of its own; callers feed it the
/// connection's read buffer and it splits complete payloads off the front.
/// An advertised length greater than `max_frame_len` is rejected before any
/// payload bytes are reserved or copied.
#[derive(Clone, Copy, Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing the provided maximum payload length.
    #[must_use]
    pub const fn new(max_frame_len: usize) -> Self { Self { max_frame_len } }

    /// Maximum payload length accepted by this decoder.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize { self.max_frame_len }

    /// Attempt to split the next complete frame payload off the front of `src`.
    ///
    /// Returns `Ok(None)` until a full prefix and payload are buffered.
    /// Feeding the stream one byte at a time yields the same frames as
    /// feeding it whole.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] if the advertised length exceeds the
    /// maximum. No allocation occurs for over-limit lengths.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len)))
    }
}

/// Append `payload` to `dst` as a single length-prefixed frame.
///
/// # Errors
///
/// Returns [`FrameError::PrefixOverflow`] if the payload length does not fit
/// in the 4-byte prefix.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PrefixOverflow {
        len: payload.len(),
    })?;
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}
