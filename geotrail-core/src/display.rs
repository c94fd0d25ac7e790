//! Row formatting for the history table

use chrono::{DateTime, Local, Utc};

use crate::types::{LocationRecord, UserId};

/// Placeholder for a value the device could not provide
pub const UNAVAILABLE: &str = "N/A";

/// Placeholder id for rows the remote has not committed yet
pub const PENDING_ID: &str = "-";

/// Column headers, in [`DisplayRow::cells`] order
pub const HEADERS: [&str; 6] = [
    "Location ID",
    "User ID",
    "Timestamp",
    "Longitude",
    "Latitude",
    "Elevation",
];

/// One rendered table row; every cell is already formatted text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRow {
    pub location_id: String,
    pub user_id: String,
    pub timestamp: String,
    pub longitude: String,
    pub latitude: String,
    pub elevation: String,
}

impl DisplayRow {
    /// Format a record (pending or committed)
    pub fn from_record(record: &LocationRecord) -> Self {
        Self {
            location_id: record
                .location_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| PENDING_ID.to_string()),
            user_id: record.user_id.to_string(),
            timestamp: local_timestamp(&record.timestamp),
            longitude: format_degrees(record.longitude),
            latitude: format_degrees(record.latitude),
            elevation: format_elevation(record.elevation),
        }
    }

    /// Row for a capture cycle that produced no position
    pub fn unavailable(user_id: &UserId, at: DateTime<Utc>) -> Self {
        Self {
            location_id: PENDING_ID.to_string(),
            user_id: user_id.to_string(),
            timestamp: local_timestamp(&at),
            longitude: UNAVAILABLE.to_string(),
            latitude: UNAVAILABLE.to_string(),
            elevation: UNAVAILABLE.to_string(),
        }
    }

    pub fn cells(&self) -> [&str; 6] {
        [
            &self.location_id,
            &self.user_id,
            &self.timestamp,
            &self.longitude,
            &self.latitude,
            &self.elevation,
        ]
    }

    /// True for rows rendered from a failed sample
    pub fn is_unavailable(&self) -> bool {
        self.latitude == UNAVAILABLE && self.longitude == UNAVAILABLE
    }
}

fn format_degrees(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.4}", v),
        None => UNAVAILABLE.to_string(),
    }
}

fn format_elevation(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2} m", v),
        None => UNAVAILABLE.to_string(),
    }
}

fn local_timestamp(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Position;
    use chrono::TimeZone;

    #[test]
    fn test_record_row_formatting() {
        let mut record = LocationRecord::from_position(
            UserId::new("u-1"),
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            Position {
                latitude: 15.373612,
                longitude: 119.948512,
                elevation: Some(3.456),
            },
        );

        let row = DisplayRow::from_record(&record);
        assert_eq!(row.location_id, "-");
        assert_eq!(row.latitude, "15.3736");
        assert_eq!(row.longitude, "119.9485");
        assert_eq!(row.elevation, "3.46 m");
        assert!(!row.is_unavailable());

        record.location_id = Some(42);
        record.elevation = None;
        let row = DisplayRow::from_record(&record);
        assert_eq!(row.location_id, "42");
        assert_eq!(row.elevation, "N/A");
    }

    #[test]
    fn test_unavailable_row() {
        let row = DisplayRow::unavailable(&UserId::new("u-1"), Utc::now());
        assert!(row.is_unavailable());
        assert_eq!(row.elevation, UNAVAILABLE);
        assert_eq!(row.cells()[1], "u-1");
    }
}
