//! Node payload codecs.
//!
//! Counters are stored as decimal `u64` text. Decoding is strict: anything
//! that is not exactly an unsigned decimal integer is reported as
//! [`CoordinationError::Corrupt`] instead of being coerced.

use crate::error::{CoordinationError, CoordinationResult};
use crate::paths;

/// Encode a counter value.
pub fn encode_counter(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode a counter value read from `path`.
pub fn decode_counter(path: &str, data: &[u8]) -> CoordinationResult<u64> {
    let text = std::str::from_utf8(data).map_err(|e| corrupt(path, format!("not utf-8: {e}")))?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt(
            path,
            format!("'{}' is not an unsigned integer", text.escape_debug()),
        ));
    }
    text.parse::<u64>()
        .map_err(|e| corrupt(path, format!("'{text}' out of range: {e}")))
}

/// Encode the owner host stored in a channel node.
pub fn encode_host(host: &str) -> Vec<u8> {
    host.as_bytes().to_vec()
}

/// Decode the owner host stored in a channel node read from `path`.
pub fn decode_host(path: &str, data: &[u8]) -> CoordinationResult<String> {
    let host = std::str::from_utf8(data).map_err(|e| corrupt(path, format!("not utf-8: {e}")))?;
    paths::validate_name(host)
        .map_err(|e| corrupt(path, format!("invalid owner host: {e}")))?;
    Ok(host.to_owned())
}

fn corrupt(path: &str, reason: String) -> CoordinationError {
    CoordinationError::Corrupt {
        path: path.to_owned(),
        reason,
    }
}
