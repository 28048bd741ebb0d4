//! Documents and the value codec
//!
//! Every typed accessor goes through [`encode`] / [`decode`]. A stored value
//! that no longer decodes (schema changed, type removed) becomes
//! [`Decoded::UnknownSchema`] instead of an error.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Stored payload plus optional metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Metadata bytes (small, typically used for sorting/grouping)
    pub metadata: Option<Vec<u8>>,
}

impl Document {
    /// Document without metadata
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload, metadata: None }
    }

    /// Document with metadata
    pub fn with_metadata(payload: Vec<u8>, metadata: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: Some(metadata),
        }
    }

    /// Decode the payload
    pub fn decode<T: DeserializeOwned>(&self) -> Decoded<T> {
        decode(&self.payload)
    }

    /// Decode the metadata, `None` when there is none
    pub fn decode_metadata<T: DeserializeOwned>(&self) -> Option<Decoded<T>> {
        self.metadata.as_deref().map(decode)
    }
}

/// Result of decoding one stored value
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// Value decoded
    Value(T),
    /// Stored bytes do not match the requested type
    UnknownSchema {
        /// Decoder message
        reason: String,
    },
}

impl<T> Decoded<T> {
    /// The value, discarding the unknown case
    pub fn ok(self) -> Option<T> {
        match self {
            Decoded::Value(v) => Some(v),
            Decoded::UnknownSchema { .. } => None,
        }
    }

    /// Whether decoding failed
    pub fn is_unknown(&self) -> bool {
        matches!(self, Decoded::UnknownSchema { .. })
    }

    /// Map the decoded value
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Decoded<U> {
        match self {
            Decoded::Value(v) => Decoded::Value(f(v)),
            Decoded::UnknownSchema { reason } => Decoded::UnknownSchema { reason },
        }
    }
}

/// Encode a value for storage
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Decoded<T> {
    match serde_json::from_slice(bytes) {
        Ok(v) => Decoded::Value(v),
        Err(e) => Decoded::UnknownSchema { reason: e.to_string() },
    }
}

/// Dates are stored as fractional seconds since the Unix epoch
pub fn date_to_epoch(date: &DateTime<Utc>) -> f64 {
    date.timestamp_millis() as f64 / 1000.0
}

/// Inverse of [`date_to_epoch`], millisecond precision
pub fn epoch_to_date(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
}
