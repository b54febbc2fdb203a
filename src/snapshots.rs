// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::epoch_to_datetime;
use crate::feed_kind::{FeedEnvelope, FeedKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_postgres::GenericClient;
use uuid::Uuid;

/// A feed header is stale only when both sides are known and the new header
/// has not moved past the stored one. Feeds that never set a header are
/// always treated as fresh.
pub fn header_is_stale(header: Option<u64>, stored: Option<i64>) -> bool {
    match (header, stored) {
        (Some(header), Some(stored)) => (header as i64) <= stored,
        _ => false,
    }
}

/// True when no fetched feed advanced past its cursor, i.e. the steady-state
/// no-op outcome.
pub fn all_headers_stale(
    envelopes: &HashMap<FeedKind, FeedEnvelope>,
    cursors: &HashMap<FeedKind, i64>,
) -> bool {
    envelopes
        .values()
        .all(|envelope| header_is_stale(envelope.header_timestamp, cursors.get(&envelope.kind).copied()))
}

pub async fn load_feed_cursors(
    db: &impl GenericClient,
) -> Result<HashMap<FeedKind, i64>, tokio_postgres::Error> {
    let rows = db
        .query(
            "SELECT feed_type, last_header_timestamp FROM rt_feed_cursors",
            &[],
        )
        .await?;
    let mut cursors = HashMap::new();
    for row in rows {
        let feed_type: String = row.get(0);
        let header: Option<i64> = row.get(1);
        if let (Ok(kind), Some(header)) = (feed_type.parse::<FeedKind>(), header) {
            cursors.insert(kind, header);
        }
    }
    Ok(cursors)
}

pub async fn update_feed_cursor(
    db: &impl GenericClient,
    kind: FeedKind,
    header_timestamp: Option<u64>,
    snapshot_id: Uuid,
) -> Result<(), tokio_postgres::Error> {
    let Some(header_timestamp) = header_timestamp else {
        return Ok(());
    };
    db.execute(
        "INSERT INTO rt_feed_cursors (feed_type, last_header_timestamp, last_snapshot_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (feed_type)
         DO UPDATE SET
             last_header_timestamp = EXCLUDED.last_header_timestamp,
             last_snapshot_id = EXCLUDED.last_snapshot_id",
        &[&kind.as_str(), &(header_timestamp as i64), &snapshot_id],
    )
    .await?;
    Ok(())
}

fn header_datetime(
    envelopes: &HashMap<FeedKind, FeedEnvelope>,
    kind: FeedKind,
) -> Option<DateTime<Utc>> {
    envelopes
        .get(&kind)
        .and_then(|envelope| envelope.header_timestamp)
        .and_then(|ts| epoch_to_datetime(ts as i64))
}

/// Insert the cycle's snapshot row and return its fresh id. All child rows
/// written later in the same transaction reference this id.
pub async fn insert_snapshot(
    db: &impl GenericClient,
    polled_at: DateTime<Utc>,
    envelopes: &HashMap<FeedKind, FeedEnvelope>,
) -> Result<Uuid, tokio_postgres::Error> {
    let snapshot_id = Uuid::new_v4();
    db.execute(
        "INSERT INTO rt_snapshots (
            snapshot_id,
            polled_at_utc,
            vehicle_feed_timestamp_utc,
            trip_feed_timestamp_utc,
            alert_feed_timestamp_utc
        ) VALUES ($1, $2, $3, $4, $5)",
        &[
            &snapshot_id,
            &polled_at,
            &header_datetime(envelopes, FeedKind::VehiclePositions),
            &header_datetime(envelopes, FeedKind::TripUpdates),
            &header_datetime(envelopes, FeedKind::Alerts),
        ],
    )
    .await?;
    Ok(snapshot_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtfs_realtime::{FeedHeader, FeedMessage};

    fn envelope(kind: FeedKind, header_timestamp: Option<u64>) -> FeedEnvelope {
        FeedEnvelope {
            url: format!("https://example.com/{}", kind),
            kind,
            message: FeedMessage {
                header: FeedHeader {
                    gtfs_realtime_version: "2.0".to_string(),
                    incrementality: None,
                    timestamp: header_timestamp,
                    feed_version: None,
                },
                entity: vec![],
            },
            header_timestamp,
        }
    }

    #[test]
    fn staleness_requires_both_sides() {
        assert!(header_is_stale(Some(100), Some(100)));
        assert!(header_is_stale(Some(99), Some(100)));
        assert!(!header_is_stale(Some(101), Some(100)));
        assert!(!header_is_stale(None, Some(100)));
        assert!(!header_is_stale(Some(100), None));
        assert!(!header_is_stale(None, None));
    }

    #[test]
    fn one_fresh_feed_unblocks_the_cycle() {
        // Headers (100, 50, 75) against cursors (100, 40, 75): trip updates
        // moved, so the set is not stale.
        let envelopes: HashMap<FeedKind, FeedEnvelope> = [
            (
                FeedKind::VehiclePositions,
                envelope(FeedKind::VehiclePositions, Some(100)),
            ),
            (FeedKind::TripUpdates, envelope(FeedKind::TripUpdates, Some(50))),
            (FeedKind::Alerts, envelope(FeedKind::Alerts, Some(75))),
        ]
        .into_iter()
        .collect();

        let cursors: HashMap<FeedKind, i64> = [
            (FeedKind::VehiclePositions, 100),
            (FeedKind::TripUpdates, 40),
            (FeedKind::Alerts, 75),
        ]
        .into_iter()
        .collect();

        assert!(!all_headers_stale(&envelopes, &cursors));

        let cursors: HashMap<FeedKind, i64> = [
            (FeedKind::VehiclePositions, 100),
            (FeedKind::TripUpdates, 50),
            (FeedKind::Alerts, 75),
        ]
        .into_iter()
        .collect();
        assert!(all_headers_stale(&envelopes, &cursors));
    }

    #[test]
    fn unseen_feed_kind_is_never_stale() {
        let envelopes: HashMap<FeedKind, FeedEnvelope> = [(
            FeedKind::Alerts,
            envelope(FeedKind::Alerts, Some(75)),
        )]
        .into_iter()
        .collect();
        let cursors = HashMap::new();
        assert!(!all_headers_stale(&envelopes, &cursors));
    }
}
