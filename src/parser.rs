//! Protobuf decoding for GTFS Realtime payloads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prost::Message;

use crate::gtfs_rt::FeedMessage;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    FeedMessage::decode(bytes).context("decoding GTFS-RT FeedMessage")
}

/// Producer timestamp from the feed header, if set and non-zero.
pub fn header_time(feed: &FeedMessage) -> Option<DateTime<Utc>> {
    feed.header
        .timestamp
        .filter(|ts| *ts > 0)
        .and_then(|ts| i64::try_from(ts).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

/// Seconds from the feed header timestamp to `now`; negative when the
/// producer clock runs ahead.
pub fn feed_age_sec(feed: &FeedMessage, now: DateTime<Utc>) -> Option<i64> {
    header_time(feed).map(|produced| (now - produced).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{FeedEntity, FeedHeader, TripDescriptor, TripUpdate};

    fn header(timestamp: Option<u64>) -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp,
            incrementality: None,
            feed_version: None,
        }
    }

    #[test]
    fn test_parse_empty_bytes_returns_default_feed() {
        // prost does not enforce proto2 `required`
        let feed = parse_feed(&[]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "");
        assert!(feed.entity.is_empty());
        assert_eq!(header_time(&feed), None);
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(parse_feed(&invalid_bytes).is_err());
    }

    #[test]
    fn test_parse_trip_update_feed() {
        let feed = FeedMessage {
            header: header(Some(1_709_305_200)),
            entity: vec![FeedEntity {
                id: "tu-1".to_string(),
                is_deleted: None,
                trip_update: Some(TripUpdate {
                    trip: TripDescriptor {
                        trip_id: Some("T1".to_string()),
                        route_id: Some("15".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                vehicle: None,
            }],
        };

        let parsed = parse_feed(&feed.encode_to_vec()).unwrap();

        assert_eq!(parsed.entity.len(), 1);
        let trip = &parsed.entity[0].trip_update.as_ref().unwrap().trip;
        assert_eq!(trip.trip_id.as_deref(), Some("T1"));
        assert_eq!(
            header_time(&parsed),
            DateTime::from_timestamp(1_709_305_200, 0)
        );
    }

    #[test]
    fn test_feed_age() {
        let feed = FeedMessage {
            header: header(Some(1_709_305_200)),
            entity: vec![],
        };
        let now = DateTime::from_timestamp(1_709_305_290, 0).unwrap();
        assert_eq!(feed_age_sec(&feed, now), Some(90));

        let unstamped = FeedMessage {
            header: header(None),
            entity: vec![],
        };
        assert_eq!(feed_age_sec(&unstamped, now), None);
    }

    #[test]
    fn test_header_time_zero_is_absent() {
        let feed = FeedMessage {
            header: header(Some(0)),
            entity: vec![],
        };
        assert_eq!(header_time(&feed), None);
    }
}
