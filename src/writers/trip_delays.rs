// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::dimensions::{DimResolver, ReferenceSource};
use crate::epoch_to_datetime;
use chrono::{DateTime, Utc};
use gtfs_realtime::FeedMessage;
use std::collections::HashMap;
use tokio_postgres::GenericClient;
use uuid::Uuid;

/// One `rt_trip_delays` row: realtime timing for a (trip, stop) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct TripDelayRow {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: Option<i32>,
    pub scheduled_arrival_seconds: Option<i32>,
    pub scheduled_departure_seconds: Option<i32>,
    pub predicted_arrival_utc: Option<DateTime<Utc>>,
    pub predicted_departure_utc: Option<DateTime<Utc>>,
    pub arrival_delay_seconds: Option<i32>,
    pub departure_delay_seconds: Option<i32>,
    pub schedule_relationship: Option<String>,
}

/// The slice of a delay row the vehicle-position writer joins in for rail
/// vehicles later in the same cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TripDelaySnapshot {
    pub arrival_delay_seconds: Option<i32>,
    pub departure_delay_seconds: Option<i32>,
    pub schedule_relationship: Option<String>,
    pub predicted_arrival_utc: Option<DateTime<Utc>>,
    pub predicted_departure_utc: Option<DateTime<Utc>>,
}

pub type DelayLookup = HashMap<(String, String), TripDelaySnapshot>;

fn stop_schedule_relationship_name(value: i32) -> Option<String> {
    gtfs_realtime::trip_update::stop_time_update::ScheduleRelationship::try_from(value)
        .ok()
        .map(|v| v.as_str_name().to_string())
}

fn trip_schedule_relationship_name(value: i32) -> Option<String> {
    gtfs_realtime::trip_descriptor::ScheduleRelationship::try_from(value)
        .ok()
        .map(|v| v.as_str_name().to_string())
}

/// Turn a trip-updates feed into delay rows plus the in-memory lookup table.
/// Later stop-time updates for the same (trip, stop) overwrite earlier ones
/// within the cycle.
pub async fn extract_trip_delay_rows<S: ReferenceSource>(
    message: &FeedMessage,
    resolver: &mut DimResolver<'_, S>,
) -> Result<(Vec<TripDelayRow>, DelayLookup), Box<dyn std::error::Error + Sync + Send>> {
    let mut rows_by_key: HashMap<(String, String), TripDelayRow> = HashMap::new();
    let mut delay_lookup: DelayLookup = HashMap::new();

    for entity in &message.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        let trip = &trip_update.trip;
        let Some(trip_id) = trip.trip_id.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        if !resolver.ensure_trip(Some(trip_id)).await? {
            continue;
        }

        for stop_update in &trip_update.stop_time_update {
            let Some(stop_id) = stop_update.stop_id.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            if !resolver.ensure_stop(Some(stop_id)).await? {
                continue;
            }

            let context = resolver.stop_context(trip_id, stop_id).await?;
            let (stop_sequence, scheduled_arrival, scheduled_departure) = match &context {
                Some((_, entry)) => (
                    Some(entry.stop_sequence),
                    entry.arrival_seconds,
                    entry.departure_seconds,
                ),
                None => (None, None, None),
            };

            let predicted_arrival = stop_update
                .arrival
                .as_ref()
                .and_then(|event| event.time)
                .and_then(epoch_to_datetime);
            let predicted_departure = stop_update
                .departure
                .as_ref()
                .and_then(|event| event.time)
                .and_then(epoch_to_datetime);
            let arrival_delay = stop_update.arrival.as_ref().and_then(|event| event.delay);
            let departure_delay = stop_update.departure.as_ref().and_then(|event| event.delay);
            let schedule_relationship = stop_update
                .schedule_relationship
                .and_then(stop_schedule_relationship_name)
                .or_else(|| {
                    trip.schedule_relationship
                        .and_then(trip_schedule_relationship_name)
                });

            let key = (trip_id.to_string(), stop_id.to_string());
            rows_by_key.insert(
                key.clone(),
                TripDelayRow {
                    trip_id: trip_id.to_string(),
                    stop_id: stop_id.to_string(),
                    stop_sequence,
                    scheduled_arrival_seconds: scheduled_arrival,
                    scheduled_departure_seconds: scheduled_departure,
                    predicted_arrival_utc: predicted_arrival,
                    predicted_departure_utc: predicted_departure,
                    arrival_delay_seconds: arrival_delay,
                    departure_delay_seconds: departure_delay,
                    schedule_relationship: schedule_relationship.clone(),
                },
            );
            delay_lookup.insert(
                key,
                TripDelaySnapshot {
                    arrival_delay_seconds: arrival_delay,
                    departure_delay_seconds: departure_delay,
                    schedule_relationship,
                    predicted_arrival_utc: predicted_arrival,
                    predicted_departure_utc: predicted_departure,
                },
            );
        }
    }

    Ok((rows_by_key.into_values().collect(), delay_lookup))
}

pub async fn store_trip_delays(
    db: &impl GenericClient,
    snapshot_id: Uuid,
    rows: &[TripDelayRow],
) -> Result<usize, tokio_postgres::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let statement = db
        .prepare(
            "INSERT INTO rt_trip_delays (
                snapshot_id,
                trip_id,
                stop_id,
                stop_sequence,
                scheduled_arrival_seconds,
                scheduled_departure_seconds,
                predicted_arrival_utc,
                predicted_departure_utc,
                arrival_delay_seconds,
                departure_delay_seconds,
                schedule_relationship
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .await?;
    for row in rows {
        db.execute(
            &statement,
            &[
                &snapshot_id,
                &row.trip_id,
                &row.stop_id,
                &row.stop_sequence,
                &row.scheduled_arrival_seconds,
                &row.scheduled_departure_seconds,
                &row.predicted_arrival_utc,
                &row.predicted_departure_utc,
                &row.arrival_delay_seconds,
                &row.departure_delay_seconds,
                &row.schedule_relationship,
            ],
        )
        .await?;
    }
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::test_support::MemorySource;
    use crate::dimensions::StopTimeEntry;
    use gtfs_realtime::trip_update::{StopTimeEvent, StopTimeUpdate};
    use gtfs_realtime::{FeedEntity, FeedHeader, TripDescriptor, TripUpdate};

    fn stop_event(time: Option<i64>, delay: Option<i32>) -> StopTimeEvent {
        StopTimeEvent {
            time,
            delay,
            ..Default::default()
        }
    }

    fn trip_update_entity(id: &str, trip_id: &str, updates: Vec<StopTimeUpdate>) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    ..Default::default()
                },
                stop_time_update: updates,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn message(entities: Vec<FeedEntity>) -> FeedMessage {
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

    fn source_with_trip() -> MemorySource {
        let mut source = MemorySource::default();
        source.trips.insert("T1".to_string());
        source.stops.insert("51003".to_string());
        source.stops.insert("51100".to_string());
        source.stop_times.insert(
            "T1".to_string(),
            vec![
                StopTimeEntry {
                    stop_sequence: 9,
                    stop_id: "51003".to_string(),
                    arrival_seconds: Some(22800),
                    departure_seconds: Some(22860),
                },
                StopTimeEntry {
                    stop_sequence: 10,
                    stop_id: "51100".to_string(),
                    arrival_seconds: Some(23400),
                    departure_seconds: None,
                },
            ],
        );
        source
    }

    #[tokio::test]
    async fn builds_rows_with_scheduled_context() {
        let mut resolver = DimResolver::new(source_with_trip(), None);
        let msg = message(vec![trip_update_entity(
            "e1",
            "T1",
            vec![StopTimeUpdate {
                stop_id: Some("51003".to_string()),
                arrival: Some(stop_event(Some(1700000300), Some(120))),
                departure: Some(stop_event(Some(1700000360), Some(180))),
                ..Default::default()
            }],
        )]);

        let (rows, lookup) = extract_trip_delay_rows(&msg, &mut resolver).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.trip_id, "T1");
        assert_eq!(row.stop_id, "51003");
        assert_eq!(row.stop_sequence, Some(9));
        assert_eq!(row.scheduled_arrival_seconds, Some(22800));
        assert_eq!(row.arrival_delay_seconds, Some(120));
        assert_eq!(row.departure_delay_seconds, Some(180));
        assert_eq!(
            row.predicted_arrival_utc.map(|dt| dt.timestamp()),
            Some(1700000300)
        );

        let snapshot = &lookup[&("T1".to_string(), "51003".to_string())];
        assert_eq!(snapshot.arrival_delay_seconds, Some(120));
        assert_eq!(snapshot.departure_delay_seconds, Some(180));
    }

    #[tokio::test]
    async fn later_update_for_same_key_wins() {
        let mut resolver = DimResolver::new(source_with_trip(), None);
        let msg = message(vec![
            trip_update_entity(
                "e1",
                "T1",
                vec![StopTimeUpdate {
                    stop_id: Some("51003".to_string()),
                    arrival: Some(stop_event(None, Some(60))),
                    ..Default::default()
                }],
            ),
            trip_update_entity(
                "e2",
                "T1",
                vec![StopTimeUpdate {
                    stop_id: Some("51003".to_string()),
                    arrival: Some(stop_event(None, Some(240))),
                    ..Default::default()
                }],
            ),
        ]);

        let (rows, lookup) = extract_trip_delay_rows(&msg, &mut resolver).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].arrival_delay_seconds, Some(240));
        assert_eq!(
            lookup[&("T1".to_string(), "51003".to_string())].arrival_delay_seconds,
            Some(240)
        );
    }

    #[tokio::test]
    async fn unknown_trip_and_stop_are_skipped() {
        let mut resolver = DimResolver::new(source_with_trip(), None);
        let msg = message(vec![
            trip_update_entity(
                "e1",
                "GHOST",
                vec![StopTimeUpdate {
                    stop_id: Some("51003".to_string()),
                    arrival: Some(stop_event(None, Some(60))),
                    ..Default::default()
                }],
            ),
            trip_update_entity(
                "e2",
                "T1",
                vec![StopTimeUpdate {
                    stop_id: Some("99999".to_string()),
                    arrival: Some(stop_event(None, Some(60))),
                    ..Default::default()
                }],
            ),
        ]);

        let (rows, lookup) = extract_trip_delay_rows(&msg, &mut resolver).await.unwrap();
        assert!(rows.is_empty());
        assert!(lookup.is_empty());
        assert!(resolver.missing.trips.contains("GHOST"));
        assert!(resolver.missing.stops.contains("99999"));
    }

    #[tokio::test]
    async fn trip_level_schedule_relationship_is_the_fallback() {
        let mut resolver = DimResolver::new(source_with_trip(), None);
        let mut entity = trip_update_entity(
            "e1",
            "T1",
            vec![StopTimeUpdate {
                stop_id: Some("51003".to_string()),
                ..Default::default()
            }],
        );
        if let Some(trip_update) = entity.trip_update.as_mut() {
            trip_update.trip.schedule_relationship =
                Some(gtfs_realtime::trip_descriptor::ScheduleRelationship::Canceled as i32);
        }
        let msg = message(vec![entity]);

        let (rows, _) = extract_trip_delay_rows(&msg, &mut resolver).await.unwrap();
        assert_eq!(rows[0].schedule_relationship.as_deref(), Some("CANCELED"));
    }
}
