//! MessagePack codec for token plaintexts.
//!
//! Payloads are encoded as maps with string keys (`to_vec_named`), the same
//! layout `msgpack.packb({"topics": [...]})` produces on the publisher side.
//! Decoding is strict: the map must match the expected payload kind exactly
//! and must be followed by nothing.

use serde::de::DeserializeOwned;
use std::io::Cursor;
use thiserror::Error;

use crate::payload::{Payload, PayloadKind, SubmitPayload, SubscribePayload};

/// Maximum plaintext size (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Payload exceeds maximum size.
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    TooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error, including truncated input and shape mismatches.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Bytes left over after a complete payload.
    #[error("Trailing data: {0} bytes after payload")]
    TrailingData(usize),
}

/// Encode a payload to MessagePack.
///
/// # Errors
///
/// Returns an error if the payload is too large or encoding fails.
pub fn encode(payload: &Payload) -> Result<Vec<u8>, PayloadError> {
    let bytes = rmp_serde::to_vec_named(payload)?;

    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(PayloadError::TooLarge(bytes.len()));
    }

    Ok(bytes)
}

/// Decode a payload of the expected kind.
///
/// # Errors
///
/// Returns an error if the data is too large, truncated, has trailing bytes,
/// or does not have the shape of `kind`.
pub fn decode(data: &[u8], kind: PayloadKind) -> Result<Payload, PayloadError> {
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(PayloadError::TooLarge(data.len()));
    }

    match kind {
        PayloadKind::Subscribe => decode_exact::<SubscribePayload>(data).map(Payload::Subscribe),
        PayloadKind::Submit => decode_exact::<SubmitPayload>(data).map(Payload::Submit),
    }
}

fn decode_exact<T: DeserializeOwned>(data: &[u8]) -> Result<T, PayloadError> {
    let mut cursor = Cursor::new(data);
    let value = rmp_serde::from_read(&mut cursor)?;

    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed < data.len() {
        return Err(PayloadError::TrailingData(data.len() - consumed));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Event;

    /// `msgpack.packb({"events": [{"topic": "todo", "event": "todo-update", "data": ""}]})`
    const PYTHON_SUBMIT: &[u8] =
        b"\x81\xa6events\x91\x83\xa5topic\xa4todo\xa5event\xabtodo-update\xa4data\xa0";

    /// `msgpack.packb({"topics": ["todo"]})`
    const PYTHON_SUBSCRIBE: &[u8] = b"\x81\xa6topics\x91\xa4todo";

    #[test]
    fn test_encode_decode_roundtrip() {
        let payloads = vec![
            Payload::subscribe(["todo", "other"]),
            Payload::submit([
                Event::new("todo", "todo-update", ""),
                Event::new("other", "ping", "line one\nline two"),
            ]),
        ];

        for payload in payloads {
            let encoded = encode(&payload).unwrap();
            let decoded = decode(&encoded, payload.kind()).unwrap();
            assert_eq!(payload, decoded);
        }
    }

    #[test]
    fn test_decode_publisher_maps() {
        let submit = decode(PYTHON_SUBMIT, PayloadKind::Submit).unwrap();
        assert_eq!(
            submit,
            Payload::submit([Event::new("todo", "todo-update", "")])
        );

        let subscribe = decode(PYTHON_SUBSCRIBE, PayloadKind::Subscribe).unwrap();
        assert_eq!(subscribe, Payload::subscribe(["todo"]));
    }

    #[test]
    fn test_encode_matches_publisher_layout() {
        let encoded = encode(&Payload::subscribe(["todo"])).unwrap();
        assert_eq!(encoded, PYTHON_SUBSCRIBE);
    }

    #[test]
    fn test_decode_wrong_kind() {
        assert!(matches!(
            decode(PYTHON_SUBMIT, PayloadKind::Subscribe),
            Err(PayloadError::Decode(_))
        ));
        assert!(matches!(
            decode(PYTHON_SUBSCRIBE, PayloadKind::Submit),
            Err(PayloadError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let truncated = &PYTHON_SUBMIT[..PYTHON_SUBMIT.len() - 3];
        match decode(truncated, PayloadKind::Submit) {
            Err(PayloadError::Decode(_)) => {}
            other => panic!("Expected Decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_trailing_data() {
        let mut data = PYTHON_SUBSCRIBE.to_vec();
        data.push(0xc0);
        match decode(&data, PayloadKind::Subscribe) {
            Err(PayloadError::TrailingData(1)) => {}
            other => panic!("Expected TrailingData error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_map() {
        assert!(decode(b"\x80", PayloadKind::Subscribe).is_err());
        assert!(decode(b"\x80", PayloadKind::Submit).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let payload = Payload::submit([Event::new("t", "e", "x".repeat(MAX_PAYLOAD_SIZE))]);
        match encode(&payload) {
            Err(PayloadError::TooLarge(_)) => {}
            other => panic!("Expected TooLarge error, got {:?}", other),
        }
    }
}
