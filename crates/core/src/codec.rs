//! Wire encoding for updates
//!
//! Format (version 1):
//! - magic: "PFU1" (4 bytes)
//! - version: u8
//! - body: bincode-encoded `PathsUpdate` (sequence number, image number,
//!   full-image flag, per-object add/delete lists, optional dump)

use crate::error::CodecError;
use crate::update::PathsUpdate;

const UPDATE_MAGIC: [u8; 4] = *b"PFU1";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;

/// Encode an update for transport
pub fn encode_update(update: &PathsUpdate) -> Result<Vec<u8>, CodecError> {
    encode_framed(UPDATE_MAGIC, update)
}

/// Decode an update received from transport
pub fn decode_update(bytes: &[u8]) -> Result<PathsUpdate, CodecError> {
    decode_framed(UPDATE_MAGIC, "update", bytes)
}

/// Serialize `value` behind a magic + version header
pub fn encode_framed<T: serde::Serialize>(
    magic: [u8; 4],
    value: &T,
) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&magic);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Check the header written by [`encode_framed`] and decode the body
pub fn decode_framed<T: serde::de::DeserializeOwned>(
    magic: [u8; 4],
    what: &'static str,
    bytes: &[u8],
) -> Result<T, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(what));
    }
    let mut found = [0u8; 4];
    found.copy_from_slice(&bytes[..4]);
    if found != magic {
        return Err(CodecError::BadMagic {
            expected: magic,
            found,
        });
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[4]));
    }
    Ok(bincode::deserialize(&bytes[HEADER_LEN..])?)
}
