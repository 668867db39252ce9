//! Payload decoding policy.
//!
//! The data format is fixed when the session authenticates and applies to
//! every payload-bearing uplink frame of that session.

use crate::session::DataFormat;

/// Renders a PUBLISH payload for the business layer.
///
/// JSON sessions get the bytes as UTF-8 text (invalid sequences become
/// U+FFFD). Binary sessions get a lowercase hex string, left for a
/// downstream script decoder.
#[must_use]
pub fn decode(format: DataFormat, payload: &[u8]) -> String {
    match format {
        DataFormat::Json => String::from_utf8_lossy(payload).into_owned(),
        DataFormat::Binary => hex::encode(payload),
    }
}
