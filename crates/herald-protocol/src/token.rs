//! Branca token codec.
//!
//! A token is `base62(0xBA | timestamp | nonce | ciphertext | tag)`, sealed
//! with XChaCha20-Poly1305 under a 32-byte key shared by publishers, the
//! gateway and the token issuer. The header (including the issue timestamp)
//! is authenticated, so the timestamp doubles as the expiry clock.

use branca::errors::Error as BrancaError;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::codec;
use crate::payload::{Payload, PayloadKind, SubmitPayload, SubscribePayload};

/// Secret key length in bytes.
pub const KEY_LENGTH: usize = 32;

/// Default token lifetime (24 hours).
pub const DEFAULT_TOKEN_TTL_SECS: u32 = 86_400;

/// Token errors.
///
/// `Invalid` deliberately carries no detail: a caller presenting a forged or
/// corrupted token learns nothing about which check failed.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Bad encoding, version, tag, or payload shape.
    #[error("invalid token")]
    Invalid,

    /// Authentic but older than the configured lifetime.
    #[error("expired token")]
    Expired,

    /// Key material has the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Encoding a token failed.
    #[error("failed to encode token: {0}")]
    Encode(String),
}

/// A 32-byte symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LENGTH]);

impl SecretKey {
    /// Create a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly [`KEY_LENGTH`] bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            TokenError::InvalidKey(format!(
                "expected {KEY_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Create a key from its hex encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not hex or does not decode to
    /// [`KEY_LENGTH`] bytes.
    pub fn from_hex(encoded: &str) -> Result<Self, TokenError> {
        let bytes = hex::decode(encoded.trim()).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Get the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Encodes and decodes tokens under one key and lifetime.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    key: SecretKey,
    ttl_secs: u32,
}

impl TokenCodec {
    /// Create a new codec.
    ///
    /// A `ttl_secs` of zero is raised to one second; tokens always expire.
    #[must_use]
    pub fn new(key: SecretKey, ttl_secs: u32) -> Self {
        Self {
            key,
            ttl_secs: ttl_secs.max(1),
        }
    }

    /// Token lifetime in seconds.
    #[must_use]
    pub fn ttl_secs(&self) -> u32 {
        self.ttl_secs
    }

    /// Encode a payload stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or sealed.
    pub fn encode(&self, payload: &Payload) -> Result<String, TokenError> {
        self.encode_at(payload, unix_now())
    }

    /// Encode a payload with an explicit issue timestamp (seconds since the epoch).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or sealed.
    pub fn encode_at(&self, payload: &Payload, timestamp: u32) -> Result<String, TokenError> {
        let plaintext = codec::encode(payload).map_err(|e| TokenError::Encode(e.to_string()))?;
        branca::encode(&plaintext, self.key.as_bytes(), timestamp)
            .map_err(|e| TokenError::Encode(format!("{e:?}")))
    }

    /// Decode a token that must carry a payload of `expected` kind.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Expired`] for an authentic token past its
    /// lifetime and [`TokenError::Invalid`] for everything else.
    pub fn decode(&self, token: &str, expected: PayloadKind) -> Result<Payload, TokenError> {
        let plaintext =
            branca::decode(token.trim(), self.key.as_bytes(), self.ttl_secs).map_err(|e| match e {
                BrancaError::ExpiredToken => TokenError::Expired,
                _ => TokenError::Invalid,
            })?;

        codec::decode(&plaintext, expected).map_err(|_| TokenError::Invalid)
    }

    /// Decode a subscription token.
    ///
    /// # Errors
    ///
    /// See [`TokenCodec::decode`].
    pub fn decode_subscribe(&self, token: &str) -> Result<SubscribePayload, TokenError> {
        match self.decode(token, PayloadKind::Subscribe)? {
            Payload::Subscribe(payload) => Ok(payload),
            Payload::Submit(_) => Err(TokenError::Invalid),
        }
    }

    /// Decode a submission token.
    ///
    /// # Errors
    ///
    /// See [`TokenCodec::decode`].
    pub fn decode_submit(&self, token: &str) -> Result<SubmitPayload, TokenError> {
        match self.decode(token, PayloadKind::Submit)? {
            Payload::Submit(payload) => Ok(payload),
            Payload::Subscribe(_) => Err(TokenError::Invalid),
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or_default()
}
