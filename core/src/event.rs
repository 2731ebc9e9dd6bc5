//! Raw feed events
//!
//! An [`Event`] is one decoded object from the upstream push feed (or from a
//! capture file in replay mode). The pipeline treats the payload as opaque
//! JSON: the only structure it relies on is the top-level `"user"` object
//! that marks a genuine post, and the optional `"retweeted_status"` object
//! carrying an embedded repost.
//!
//! When an event was parsed from a captured line, the original bytes are
//! kept alongside the decoded value so file sinks can write them back
//! untouched (`Bytes` makes that a refcount bump, not a copy).

use crate::error::{Result, StreamError};
use bytes::Bytes;
use serde_json::Value;

/// One decoded object from the upstream feed
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    value: Value,
    /// Original serialized form, when the event came from a capture file
    raw: Option<Bytes>,
}

impl Event {
    /// Wrap an already-decoded feed object
    pub fn from_value(value: Value) -> Self {
        Self { value, raw: None }
    }

    /// Parse a serialized record, keeping the raw bytes for pass-through sinks
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| StreamError::Malformed(e.to_string()))?;
        Ok(Self {
            value,
            raw: Some(Bytes::copy_from_slice(raw.trim_end().as_bytes())),
        })
    }

    /// Whether this object is a genuine post
    ///
    /// The feed interleaves posts with control messages (disconnect notices,
    /// limit notices). Posts are the only objects carrying a top-level
    /// `"user"` object.
    pub fn is_post(&self) -> bool {
        self.value.get("user").is_some_and(Value::is_object)
    }

    /// The embedded reposted event, if this post carries one
    ///
    /// The returned event has no raw form of its own; sinks serialize it
    /// from the decoded value.
    pub fn embedded(&self) -> Option<Event> {
        self.value
            .get("retweeted_status")
            .filter(|v| v.is_object())
            .map(|v| Event::from_value(v.clone()))
    }

    /// The post's numeric identifier, when present
    pub fn event_id(&self) -> Option<i64> {
        self.value.get("id").and_then(Value::as_i64)
    }

    /// The post's creation timestamp in the feed's own string form
    pub fn created_at(&self) -> Option<&str> {
        self.value.get("created_at").and_then(Value::as_str)
    }

    /// The decoded payload
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// One serialized line for file sinks: the captured raw bytes when the
    /// event came from a file, otherwise a compact re-serialization
    pub fn raw_line(&self) -> Result<Bytes> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => serde_json::to_vec(&self.value)
                .map(Bytes::from)
                .map_err(|e| StreamError::Malformed(e.to_string())),
        }
    }
}

impl From<Value> for Event {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}
