//! String / long serialization at adapter boundaries.
//!
//! Records are typed ([`Payload`]) inside the engine; codecs only apply where
//! bytes cross into or out of a transport. `Long` uses the 8-byte big-endian
//! layout common to broker clients.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Payload;

/// Serialization format for keys or values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
  /// UTF-8 text.
  #[default]
  String,
  /// Unsigned 64-bit integer, big-endian.
  Long,
}

/// Errors raised while encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
  /// Bytes are not valid UTF-8.
  #[error("invalid utf-8: {0}")]
  InvalidUtf8(String),
  /// A long must be exactly 8 bytes.
  #[error("expected 8 bytes for a long, got {0}")]
  InvalidLength(usize),
  /// A string key could not be parsed as a long.
  #[error("cannot encode key '{0}' as a long")]
  InvalidLongKey(String),
  /// The payload type does not match the codec.
  #[error("{codec} codec cannot encode a {payload} payload")]
  Mismatch {
    /// Codec that was asked to encode.
    codec: Codec,
    /// Kind of the payload.
    payload: &'static str,
  },
}

impl fmt::Display for Codec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Codec::String => write!(f, "string"),
      Codec::Long => write!(f, "long"),
    }
  }
}

impl Codec {
  /// Encodes a value payload.
  pub fn encode(self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
    match (self, payload) {
      (Codec::String, Payload::Text(s)) => Ok(s.as_bytes().to_vec()),
      (Codec::Long, Payload::Count(n)) => Ok(n.to_be_bytes().to_vec()),
      (codec, payload) => Err(CodecError::Mismatch {
        codec,
        payload: payload.kind(),
      }),
    }
  }

  /// Decodes a value payload.
  pub fn decode(self, bytes: &[u8]) -> Result<Payload, CodecError> {
    match self {
      Codec::String => String::from_utf8(bytes.to_vec())
        .map(Payload::Text)
        .map_err(|e| CodecError::InvalidUtf8(e.to_string())),
      Codec::Long => {
        let raw: [u8; 8] = bytes
          .try_into()
          .map_err(|_| CodecError::InvalidLength(bytes.len()))?;
        Ok(Payload::Count(u64::from_be_bytes(raw)))
      }
    }
  }

  /// Encodes a record key. Keys are strings inside the engine; a `Long` key
  /// codec requires the key to parse as an unsigned integer.
  pub fn encode_key(self, key: &str) -> Result<Vec<u8>, CodecError> {
    match self {
      Codec::String => Ok(key.as_bytes().to_vec()),
      Codec::Long => key
        .parse::<u64>()
        .map(|n| n.to_be_bytes().to_vec())
        .map_err(|_| CodecError::InvalidLongKey(key.to_string())),
    }
  }

  /// Decodes a record key into its string form.
  pub fn decode_key(self, bytes: &[u8]) -> Result<String, CodecError> {
    match self.decode(bytes)? {
      Payload::Text(s) => Ok(s),
      Payload::Count(n) => Ok(n.to_string()),
    }
  }

  /// Whether this codec can carry payloads of the given kind.
  pub fn accepts(self, payload_kind: &str) -> bool {
    matches!(
      (self, payload_kind),
      (Codec::String, "text") | (Codec::Long, "count")
    )
  }
}
