//! Publish-side payload sanity checks.
//!
//! This is the only place the transport looks inside a payload. Everything
//! it accepts is printable ASCII text plus tab, CR and LF.

use crate::error::TransportError;

/// Reject payloads that are too large or not printable text.
pub fn validate_payload(payload: &[u8], max_bytes: usize) -> Result<(), TransportError> {
    if payload.len() > max_bytes {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            max: max_bytes,
        });
    }

    if let Some(offset) = payload.iter().position(|&b| !is_printable(b)) {
        return Err(TransportError::PayloadNotPrintable { offset });
    }

    Ok(())
}

fn is_printable(b: u8) -> bool {
    matches!(b, b' '..=b'~' | b'\t' | b'\n' | b'\r')
}
