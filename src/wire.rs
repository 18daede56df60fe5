//! JSON wire encoding for events and batches.
//!
//! Encoding goes through `serde_json`, so strings are escaped per RFC 8259 (quote, backslash,
//! newline, carriage return, tab and other control characters) and numbers/booleans are native.
//! Payloads are `serde_json::Value`s: an empty array stays `[]` and an empty object stays `{}`.

use crate::error::DeliveryError;
use crate::event::{Batch, Event};

/// Content type sent with every request.
pub const CONTENT_TYPE: &str = "application/json";

/// Response bodies quoted in errors are cut to this many characters.
pub const MAX_ERROR_BODY_CHARS: usize = 200;

pub fn encode_event(event: &Event) -> Result<String, DeliveryError> {
    Ok(serde_json::to_string(event)?)
}

pub fn encode_batch(batch: &Batch) -> Result<String, DeliveryError> {
    Ok(serde_json::to_string(batch)?)
}

pub fn decode_event(body: &str) -> Result<Event, DeliveryError> {
    Ok(serde_json::from_str(body)?)
}

pub fn decode_batch(body: &str) -> Result<Batch, DeliveryError> {
    Ok(serde_json::from_str(body)?)
}

/// First [`MAX_ERROR_BODY_CHARS`] characters of `body`, cut on a char boundary.
pub fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
