//! Core domain types for geotrail
//!
//! | Term | Definition |
//! |------|------------|
//! | **Position** | One successful fix from a provider |
//! | **LocationRecord** | A timestamped position attributed to a user id |
//! | **Pending** | A record still in the local queue (no `locationid`) |
//! | **Committed** | A record the remote store acknowledged (has `locationid`) |
//!
//! Field names on the wire follow the remote table (`userid`, `locationid`).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ============================================
// Identity
// ============================================

/// Stable opaque device/user identifier (a UUID v4 string when generated here).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================
// Position
// ============================================

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Decimal degrees
    pub latitude: f64,
    /// Decimal degrees
    pub longitude: f64,
    /// Meters above sea level; many devices don't report it
    #[serde(default)]
    pub elevation: Option<f64>,
}

// ============================================
// LocationRecord
// ============================================

/// The single entity flowing through the pipeline.
///
/// Geo fields are optional on the wire because the remote table allows
/// nulls, but the pipeline never persists a record without a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Assigned by the remote store on successful insert
    #[serde(
        rename = "locationid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub location_id: Option<i64>,

    #[serde(rename = "userid")]
    pub user_id: UserId,

    /// Capture instant; ordering key
    #[serde(with = "canonical_timestamp")]
    pub timestamp: DateTime<Utc>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<f64>,
}

impl LocationRecord {
    /// Build a pending record from a successful fix
    pub fn from_position(user_id: UserId, timestamp: DateTime<Utc>, position: Position) -> Self {
        Self {
            location_id: None,
            user_id,
            timestamp,
            latitude: Some(position.latitude),
            longitude: Some(position.longitude),
            elevation: position.elevation,
        }
    }

    /// Whether the remote store has acknowledged this record
    pub fn is_committed(&self) -> bool {
        self.location_id.is_some()
    }

    /// Whether the record carries a usable position
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Format a timestamp in the canonical form used on the wire and in the queue.
///
/// Fixed-width RFC 3339 UTC with millisecond precision, so the text sorts
/// in time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`format_timestamp`] (or any RFC 3339 form)
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

pub(crate) mod canonical_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_format_matches_remote_columns() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        let record = LocationRecord::from_position(
            UserId::new("8f14e45f-ceea-4e7a-9b1d-6b2f1c2e3d4a"),
            ts,
            Position {
                latitude: 14.5995,
                longitude: 120.9842,
                elevation: None,
            },
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["userid"], "8f14e45f-ceea-4e7a-9b1d-6b2f1c2e3d4a");
        assert_eq!(json["timestamp"], "2025-03-01T12:30:00.000Z");
        assert_eq!(json["latitude"], 14.5995);
        assert!(json["elevation"].is_null());
        assert!(json.get("locationid").is_none());
    }

    #[test]
    fn test_committed_row_from_remote() {
        let raw = r#"{
            "locationid": 42,
            "userid": "abc",
            "timestamp": "2025-03-01T12:30:00.123+00:00",
            "latitude": 1.5,
            "longitude": 2.5,
            "elevation": 10.0
        }"#;
        let record: LocationRecord = serde_json::from_str(raw).unwrap();
        assert!(record.is_committed());
        assert_eq!(record.location_id, Some(42));
        assert_eq!(format_timestamp(&record.timestamp), "2025-03-01T12:30:00.123Z");
    }

    #[test]
    fn test_canonical_timestamp_sorts_lexically() {
        let early = Utc.with_ymd_and_hms(2025, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        assert!(format_timestamp(&early) < format_timestamp(&late));
    }

    #[test]
    fn test_generated_user_id_is_uuid_v4() {
        let id = UserId::generate();
        let parsed = uuid::Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }
}
