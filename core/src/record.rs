//! Normalized event rows
//!
//! [`EventRecord`] is the flattened representation a persistence store
//! accepts: selected fields from the post plus a handful of fields pulled up
//! from its author object. Normalization is deliberately lossy; the full
//! payload is only preserved by pass-through file sinks.
//!
//! Records are appended as they arrive, even if the same post was seen
//! before; the pipeline does not enforce uniqueness of event ids.

use crate::error::{Result, StreamError};
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Timestamp format used by the feed, e.g. `Wed Aug 27 13:08:45 +0000 2008`
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// A normalized row ready for bulk insertion into a store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Feed-assigned post identifier
    pub event_id: i64,
    /// Post body
    pub text: String,
    /// Whether the feed truncated the body
    pub truncated: bool,
    /// Detected language, when the feed provides one
    pub lang: Option<String>,

    /// Author identifier
    pub author_id: i64,
    /// Author handle
    pub author_screen_name: String,
    /// Author display name
    pub author_name: String,
    /// Whether the author account is verified
    pub author_verified: bool,

    /// Post creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Author's UTC offset in seconds
    pub author_utc_offset: Option<i32>,
    /// Author's self-reported time zone
    pub author_time_zone: Option<String>,

    /// Feed filter level: none, low or medium
    pub filter_level: Option<String>,

    /// Point latitude, when the post is geotagged
    pub latitude: Option<f64>,
    /// Point longitude, when the post is geotagged
    pub longitude: Option<f64>,
    /// Whether the author enabled geotagging
    pub author_geo_enabled: bool,
    /// Author's free-form location string
    pub author_location: Option<String>,

    /// Favorite count at capture time
    pub favorite_count: Option<u32>,
    /// Repost count at capture time
    pub repost_count: Option<u32>,
    /// Author's follower count at capture time
    pub author_followers_count: Option<u32>,
    /// Author's friend count at capture time
    pub author_friends_count: Option<u32>,

    /// Post this one replies to, when any
    pub in_reply_to_id: Option<i64>,
    /// Embedded repost's identifier, when this post is a repost
    pub reposted_id: Option<i64>,
}

impl EventRecord {
    /// Normalize a raw event into a record
    ///
    /// Fails with [`StreamError::Malformed`] when a required field (post id,
    /// text, author identity, creation time) is missing or mistyped. All
    /// other fields degrade to `None`/`false`.
    pub fn from_event(event: &Event) -> Result<Self> {
        let raw = event.value();
        let author = raw
            .get("user")
            .filter(|v| v.is_object())
            .ok_or_else(|| missing("user"))?;

        // The "coordinates" entry is a GeoJSON-style point:
        // {"coordinates": [-75.14, 40.05], "type": "Point"} - longitude first.
        let point = raw
            .get("coordinates")
            .filter(|v| !v.is_null())
            .and_then(|c| c.get("coordinates"))
            .and_then(Value::as_array);
        let longitude = point.and_then(|p| p.first()).and_then(Value::as_f64);
        let latitude = point.and_then(|p| p.get(1)).and_then(Value::as_f64);

        Ok(Self {
            event_id: require_i64(raw, "id")?,
            text: require_str(raw, "text")?.to_string(),
            truncated: raw.get("truncated").and_then(Value::as_bool).unwrap_or(false),
            lang: opt_string(raw, "lang"),

            author_id: require_i64(author, "id")?,
            author_screen_name: require_str(author, "screen_name")?.to_string(),
            author_name: require_str(author, "name")?.to_string(),
            author_verified: author
                .get("verified")
                .and_then(Value::as_bool)
                .unwrap_or(false),

            created_at: parse_created_at(require_str(raw, "created_at")?)?,
            author_utc_offset: author
                .get("utc_offset")
                .and_then(Value::as_i64)
                .map(|v| v as i32),
            author_time_zone: opt_string(author, "time_zone"),

            filter_level: opt_string(raw, "filter_level"),

            latitude,
            longitude,
            author_geo_enabled: author
                .get("geo_enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            author_location: opt_string(author, "location"),

            favorite_count: opt_u32(raw, "favorite_count"),
            repost_count: opt_u32(raw, "retweet_count"),
            author_followers_count: opt_u32(author, "followers_count"),
            author_friends_count: opt_u32(author, "friends_count"),

            in_reply_to_id: raw.get("in_reply_to_status_id").and_then(Value::as_i64),
            reposted_id: raw
                .get("retweeted_status")
                .and_then(|r| r.get("id"))
                .and_then(Value::as_i64),
        })
    }
}

/// Parse the feed's creation timestamp into UTC
pub fn parse_created_at(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(s, CREATED_AT_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StreamError::Malformed(format!("bad created_at {s:?}: {e}")))
}

fn missing(field: &str) -> StreamError {
    StreamError::Malformed(format!("missing field {field:?}"))
}

fn require_i64(obj: &Value, field: &str) -> Result<i64> {
    obj.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| missing(field))
}

fn require_str<'a>(obj: &'a Value, field: &str) -> Result<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(field))
}

fn opt_string(obj: &Value, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn opt_u32(obj: &Value, field: &str) -> Option<u32> {
    obj.get(field)
        .and_then(Value::as_u64)
        .map(|v| v.min(u32::MAX as u64) as u32)
}
