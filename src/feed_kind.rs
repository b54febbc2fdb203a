// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use gtfs_realtime::FeedMessage;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// The three realtime feed kinds a complete poll cycle needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedKind {
    VehiclePositions,
    TripUpdates,
    Alerts,
}

impl FeedKind {
    pub const ALL: [FeedKind; 3] = [
        FeedKind::VehiclePositions,
        FeedKind::TripUpdates,
        FeedKind::Alerts,
    ];

    /// Stable string used as the `rt_feed_cursors` primary key.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::VehiclePositions => "vehicle_positions",
            FeedKind::TripUpdates => "trip_updates",
            FeedKind::Alerts => "alerts",
        }
    }
}

impl FromStr for FeedKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vehicle_positions" => Ok(FeedKind::VehiclePositions),
            "trip_updates" => Ok(FeedKind::TripUpdates),
            "alerts" => Ok(FeedKind::Alerts),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unable to classify feed type for {url}")]
pub struct ClassifyError {
    pub url: String,
}

/// One fetched-and-decoded feed, ready for the coordinator.
#[derive(Debug, Clone)]
pub struct FeedEnvelope {
    pub url: String,
    pub kind: FeedKind,
    pub message: FeedMessage,
    /// Header freshness marker; None when the feed left it unset (0).
    pub header_timestamp: Option<u64>,
}

/// Assign a feed kind from the decoded payload, falling back to URL
/// substrings when the message carries no entities at all (an empty but
/// healthy feed still needs a kind for cursor bookkeeping).
pub fn classify_feed(url: &str, message: &FeedMessage) -> Result<FeedKind, ClassifyError> {
    if message.entity.iter().any(|e| e.vehicle.is_some()) {
        return Ok(FeedKind::VehiclePositions);
    }
    if message.entity.iter().any(|e| e.trip_update.is_some()) {
        return Ok(FeedKind::TripUpdates);
    }
    if message.entity.iter().any(|e| e.alert.is_some()) {
        return Ok(FeedKind::Alerts);
    }

    let url_lower = url.to_lowercase();
    if url_lower.contains("vehicle") {
        return Ok(FeedKind::VehiclePositions);
    }
    if url_lower.contains("trip") {
        return Ok(FeedKind::TripUpdates);
    }
    if url_lower.contains("alert") {
        return Ok(FeedKind::Alerts);
    }
    Err(ClassifyError {
        url: url.to_string(),
    })
}

/// Collapse fetched envelopes into at most one per kind, keeping the envelope
/// with the larger header timestamp when an operator configures duplicate
/// endpoints for the same kind.
pub fn index_envelopes(envelopes: Vec<FeedEnvelope>) -> HashMap<FeedKind, FeedEnvelope> {
    let mut indexed: HashMap<FeedKind, FeedEnvelope> = HashMap::new();
    for envelope in envelopes {
        match indexed.get(&envelope.kind) {
            Some(existing) => {
                log::warn!(
                    "Duplicate {} feed encountered; keeping the most recent header timestamp.",
                    envelope.kind
                );
                if envelope.header_timestamp.unwrap_or(0) > existing.header_timestamp.unwrap_or(0) {
                    indexed.insert(envelope.kind, envelope);
                }
            }
            None => {
                indexed.insert(envelope.kind, envelope);
            }
        }
    }
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtfs_realtime::{FeedEntity, FeedHeader, FeedMessage};

    fn message_with_entities(entities: Vec<FeedEntity>) -> FeedMessage {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: None,
                timestamp: Some(1700000000),
                feed_version: None,
            },
            entity: entities,
        }
    }

    fn vehicle_entity(id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(gtfs_realtime::VehiclePosition::default()),
            ..Default::default()
        }
    }

    fn trip_update_entity(id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            trip_update: Some(gtfs_realtime::TripUpdate::default()),
            ..Default::default()
        }
    }

    fn alert_entity(id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            alert: Some(gtfs_realtime::Alert::default()),
            ..Default::default()
        }
    }

    #[test]
    fn classifies_by_payload() {
        let msg = message_with_entities(vec![vehicle_entity("1")]);
        assert_eq!(
            classify_feed("https://example.com/feed.pb", &msg).unwrap(),
            FeedKind::VehiclePositions
        );

        let msg = message_with_entities(vec![trip_update_entity("1")]);
        assert_eq!(
            classify_feed("https://example.com/feed.pb", &msg).unwrap(),
            FeedKind::TripUpdates
        );

        let msg = message_with_entities(vec![alert_entity("1")]);
        assert_eq!(
            classify_feed("https://example.com/feed.pb", &msg).unwrap(),
            FeedKind::Alerts
        );
    }

    #[test]
    fn vehicle_payload_wins_over_later_kinds() {
        // Mixed feed: any vehicle payload anywhere classifies the whole feed.
        let msg = message_with_entities(vec![
            trip_update_entity("1"),
            alert_entity("2"),
            vehicle_entity("3"),
        ]);
        assert_eq!(
            classify_feed("https://example.com/mixed.pb", &msg).unwrap(),
            FeedKind::VehiclePositions
        );
    }

    #[test]
    fn empty_feed_falls_back_to_url() {
        let msg = message_with_entities(vec![]);
        assert_eq!(
            classify_feed("https://example.com/VehiclePositions.pb", &msg).unwrap(),
            FeedKind::VehiclePositions
        );
        assert_eq!(
            classify_feed("https://example.com/tripupdates", &msg).unwrap(),
            FeedKind::TripUpdates
        );
        assert_eq!(
            classify_feed("https://example.com/service-alerts", &msg).unwrap(),
            FeedKind::Alerts
        );
        assert!(classify_feed("https://example.com/feed.pb", &msg).is_err());
    }

    #[test]
    fn duplicate_kinds_keep_newest_header() {
        let mut older = FeedEnvelope {
            url: "https://a".to_string(),
            kind: FeedKind::Alerts,
            message: message_with_entities(vec![]),
            header_timestamp: Some(100),
        };
        let newer = FeedEnvelope {
            url: "https://b".to_string(),
            kind: FeedKind::Alerts,
            message: message_with_entities(vec![]),
            header_timestamp: Some(200),
        };
        let indexed = index_envelopes(vec![older.clone(), newer]);
        assert_eq!(indexed[&FeedKind::Alerts].url, "https://b");

        // Reverse order: the newer one still wins.
        older.header_timestamp = Some(300);
        let newer = indexed.into_values().next().unwrap();
        let indexed = index_envelopes(vec![newer, older]);
        assert_eq!(indexed[&FeedKind::Alerts].header_timestamp, Some(300));
    }

    #[test]
    fn feed_kind_round_trips_through_str() {
        for kind in FeedKind::ALL {
            assert_eq!(kind.as_str().parse::<FeedKind>(), Ok(kind));
        }
        assert!("bogus".parse::<FeedKind>().is_err());
    }
}
