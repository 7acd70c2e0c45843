//! # herald-protocol
//!
//! Wire formats for the Herald SSE broadcast gateway.
//!
//! Publishers and subscribers never talk to Herald in the clear. Every request
//! carries a [Branca](https://branca.io) token: an XChaCha20-Poly1305 sealed,
//! base62-encoded blob whose plaintext is a MessagePack map.
//!
//! ## Payloads
//!
//! - `Subscribe` - `{"topics": [..]}`, accepted by `GET /events`
//! - `Submit` - `{"events": [{"topic", "event", "data"}, ..]}`, accepted by `POST /submit`
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{Payload, PayloadKind, SecretKey, TokenCodec};
//!
//! let key = SecretKey::from_bytes(&[7u8; 32]).unwrap();
//! let codec = TokenCodec::new(key, 3600);
//!
//! let token = codec.encode(&Payload::subscribe(["todo"])).unwrap();
//! let payload = codec.decode(&token, PayloadKind::Subscribe).unwrap();
//! assert_eq!(payload, Payload::subscribe(["todo"]));
//! ```

pub mod codec;
pub mod payload;
pub mod token;

pub use codec::PayloadError;
pub use payload::{Event, Payload, PayloadKind, SubmitPayload, SubscribePayload};
pub use token::{SecretKey, TokenCodec, TokenError, DEFAULT_TOKEN_TTL_SECS, KEY_LENGTH};
