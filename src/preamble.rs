//! Fixed six-byte connection preamble.
//!
//! The preamble is the only unframed traffic a client ever sends: four magic
//! bytes, a version byte, and an auth-method code. It is parsed exactly once
//! per connection, before any length-prefixed frames are read.

use crate::error::FatalConnectionError;
use crate::wire::{AuthMethod, CURRENT_VERSION, RPC_MAGIC};

/// Number of bytes in the preamble.
pub const PREAMBLE_LEN: usize = 6;

/// Decoded connection preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble {
    /// Protocol version requested by the client.
    pub version: u8,
    /// Authentication method selected by the client.
    pub auth_method: AuthMethod,
}

impl Preamble {
    /// Parse the six preamble bytes.
    ///
    /// Validation order matches the wire contract: magic first, then
    /// version, then the auth-method code.
    ///
    /// # Errors
    ///
    /// Returns a [`FatalConnectionError`] describing the first mismatch;
    /// all preamble failures are fatal to the connection.
    pub fn parse(bytes: &[u8; PREAMBLE_LEN]) -> Result<Self, FatalConnectionError> {
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != RPC_MAGIC {
            return Err(FatalConnectionError::BadMagic {
                expected: RPC_MAGIC,
                got: magic,
            });
        }
        let version = bytes[4];
        if version != CURRENT_VERSION {
            return Err(FatalConnectionError::WrongVersion {
                got: version,
                supported: CURRENT_VERSION,
            });
        }
        let auth_method = AuthMethod::from_code(bytes[5])
            .ok_or(FatalConnectionError::BadAuthCode { got: bytes[5] })?;
        Ok(Self {
            version,
            auth_method,
        })
    }
}
