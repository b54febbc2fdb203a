// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::dimensions::{DimResolver, ReferenceSource};
use crate::epoch_to_datetime;
use chrono::{DateTime, Utc};
use gtfs_realtime::FeedMessage;
use std::collections::{BTreeSet, HashMap};
use tokio_postgres::GenericClient;
use uuid::Uuid;

/// One parent alert row per (alert id, language translation).
#[derive(Clone, Debug, PartialEq)]
pub struct AlertRow {
    pub alert_id: String,
    pub language: String,
    pub message: Option<String>,
    pub effect: Option<String>,
    pub cause: Option<String>,
    pub active_start_utc: Option<DateTime<Utc>>,
    pub active_end_utc: Option<DateTime<Utc>>,
}

/// Everything the alerts feed contributes to one snapshot. Child sets are
/// BTreeSets so repeated informed entities collapse before they ever reach
/// the database.
#[derive(Debug, Default)]
pub struct AlertBatch {
    pub rows: Vec<AlertRow>,
    pub routes: BTreeSet<(String, String)>,
    pub stops: BTreeSet<(String, String)>,
    pub trips: BTreeSet<(String, String)>,
    pub periods: Vec<(String, i32, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
    pub distinct_alerts: usize,
}

fn cause_name(value: i32) -> Option<String> {
    gtfs_realtime::alert::Cause::try_from(value)
        .ok()
        .map(|v| v.as_str_name().to_string())
}

fn effect_name(value: i32) -> Option<String> {
    gtfs_realtime::alert::Effect::try_from(value)
        .ok()
        .map(|v| v.as_str_name().to_string())
}

/// Flatten the alerts feed. The aggregate active window is the earliest
/// period start (header time when no period carries one) to the latest
/// period end (open-ended when absent).
pub async fn extract_alert_batch<S: ReferenceSource>(
    message: &FeedMessage,
    header_timestamp: Option<u64>,
    resolver: &mut DimResolver<'_, S>,
) -> Result<AlertBatch, Box<dyn std::error::Error + Sync + Send>> {
    let header_dt = header_timestamp.and_then(|ts| epoch_to_datetime(ts as i64));
    let mut rows_by_key: HashMap<(String, String), AlertRow> = HashMap::new();
    let mut batch = AlertBatch::default();

    for entity in &message.entity {
        let Some(alert) = &entity.alert else {
            continue;
        };
        if entity.id.is_empty() {
            continue;
        }
        let alert_id = entity.id.clone();

        let period_starts: Vec<Option<DateTime<Utc>>> = alert
            .active_period
            .iter()
            .map(|period| period.start.and_then(|ts| epoch_to_datetime(ts as i64)))
            .collect();
        let period_ends: Vec<Option<DateTime<Utc>>> = alert
            .active_period
            .iter()
            .map(|period| period.end.and_then(|ts| epoch_to_datetime(ts as i64)))
            .collect();
        let aggregate_start = period_starts.iter().flatten().min().copied().or(header_dt);
        let aggregate_end = period_ends.iter().flatten().max().copied();

        for (period_index, (start, end)) in
            period_starts.iter().zip(period_ends.iter()).enumerate()
        {
            batch
                .periods
                .push((alert_id.clone(), period_index as i32, *start, *end));
        }

        let cause = alert.cause.and_then(cause_name);
        let effect = alert.effect.and_then(effect_name);

        let translations: Vec<(String, Option<String>)> = match &alert.description_text {
            Some(text) if !text.translation.is_empty() => text
                .translation
                .iter()
                .map(|translation| {
                    let language = translation
                        .language
                        .clone()
                        .filter(|l| !l.is_empty())
                        .unwrap_or_else(|| "und".to_string());
                    (language, Some(translation.text.clone()))
                })
                .collect(),
            _ => vec![("und".to_string(), None)],
        };

        for (language, text) in translations {
            rows_by_key.insert(
                (alert_id.clone(), language.clone()),
                AlertRow {
                    alert_id: alert_id.clone(),
                    language,
                    message: text,
                    effect: effect.clone(),
                    cause: cause.clone(),
                    active_start_utc: aggregate_start,
                    active_end_utc: aggregate_end,
                },
            );
        }

        for informed in &alert.informed_entity {
            if resolver.ensure_route(informed.route_id.as_deref()).await? {
                if let Some(route_id) = &informed.route_id {
                    batch.routes.insert((alert_id.clone(), route_id.clone()));
                }
            }
            if resolver.ensure_stop(informed.stop_id.as_deref()).await? {
                if let Some(stop_id) = &informed.stop_id {
                    batch.stops.insert((alert_id.clone(), stop_id.clone()));
                }
            }
            let trip_id = informed.trip.as_ref().and_then(|trip| trip.trip_id.as_deref());
            if resolver.ensure_trip(trip_id).await? {
                if let Some(trip_id) = trip_id {
                    batch
                        .trips
                        .insert((alert_id.clone(), trip_id.to_string()));
                }
            }
        }
    }

    batch.distinct_alerts = rows_by_key
        .keys()
        .map(|(alert_id, _)| alert_id.clone())
        .collect::<BTreeSet<_>>()
        .len();
    batch.rows = rows_by_key.into_values().collect();
    Ok(batch)
}

/// Write the batch. Child inserts are `ON CONFLICT DO NOTHING`: alerts repeat
/// the same affected entities poll after poll and that is not an error.
pub async fn store_alerts(
    db: &impl GenericClient,
    snapshot_id: Uuid,
    created_at: Option<DateTime<Utc>>,
    batch: &AlertBatch,
) -> Result<usize, tokio_postgres::Error> {
    if batch.rows.is_empty() {
        return Ok(0);
    }

    let insert_alert = db
        .prepare(
            "INSERT INTO rt_alerts (
                snapshot_id, alert_id, language, message, effect, cause,
                active_start_utc, active_end_utc, created_at_utc
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .await?;
    for row in &batch.rows {
        db.execute(
            &insert_alert,
            &[
                &snapshot_id,
                &row.alert_id,
                &row.language,
                &row.message,
                &row.effect,
                &row.cause,
                &row.active_start_utc,
                &row.active_end_utc,
                &created_at,
            ],
        )
        .await?;
    }

    let insert_route = db
        .prepare(
            "INSERT INTO rt_alert_routes (snapshot_id, alert_id, route_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .await?;
    for (alert_id, route_id) in &batch.routes {
        db.execute(&insert_route, &[&snapshot_id, alert_id, route_id])
            .await?;
    }

    let insert_stop = db
        .prepare(
            "INSERT INTO rt_alert_stops (snapshot_id, alert_id, stop_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .await?;
    for (alert_id, stop_id) in &batch.stops {
        db.execute(&insert_stop, &[&snapshot_id, alert_id, stop_id])
            .await?;
    }

    let insert_trip = db
        .prepare(
            "INSERT INTO rt_alert_trips (snapshot_id, alert_id, trip_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .await?;
    for (alert_id, trip_id) in &batch.trips {
        db.execute(&insert_trip, &[&snapshot_id, alert_id, trip_id])
            .await?;
    }

    let insert_period = db
        .prepare(
            "INSERT INTO rt_alert_active_periods (
                snapshot_id, alert_id, period_index, active_start_utc, active_end_utc
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING",
        )
        .await?;
    for (alert_id, period_index, start, end) in &batch.periods {
        db.execute(
            &insert_period,
            &[&snapshot_id, alert_id, period_index, start, end],
        )
        .await?;
    }

    Ok(batch.distinct_alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::test_support::MemorySource;
    use gtfs_realtime::translated_string::Translation;
    use gtfs_realtime::{
        Alert, EntitySelector, FeedEntity, FeedHeader, TimeRange, TranslatedString, TripDescriptor,
    };

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

    fn alert_entity(id: &str, alert: Alert) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            alert: Some(alert),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn translations_produce_one_row_per_language() {
        let source = MemorySource::default();
        let mut resolver = DimResolver::new(source, None);
        let msg = message(vec![alert_entity(
            "a1",
            Alert {
                description_text: Some(TranslatedString {
                    translation: vec![
                        Translation {
                            text: "Retards a la R4".to_string(),
                            language: Some("ca".to_string()),
                        },
                        Translation {
                            text: "Delays on R4".to_string(),
                            language: Some("en".to_string()),
                        },
                    ],
                }),
                ..Default::default()
            },
        )]);

        let batch = extract_alert_batch(&msg, Some(1700000000), &mut resolver)
            .await
            .unwrap();
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.distinct_alerts, 1);
        let mut languages: Vec<&str> = batch.rows.iter().map(|r| r.language.as_str()).collect();
        languages.sort();
        assert_eq!(languages, vec!["ca", "en"]);
    }

    #[tokio::test]
    async fn missing_translations_default_to_und() {
        let source = MemorySource::default();
        let mut resolver = DimResolver::new(source, None);
        let msg = message(vec![alert_entity("a1", Alert::default())]);

        let batch = extract_alert_batch(&msg, Some(1700000000), &mut resolver)
            .await
            .unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].language, "und");
        assert_eq!(batch.rows[0].message, None);
        // No explicit period: the window starts at the feed header time.
        assert_eq!(
            batch.rows[0].active_start_utc.map(|dt| dt.timestamp()),
            Some(1700000000)
        );
        assert_eq!(batch.rows[0].active_end_utc, None);
    }

    #[tokio::test]
    async fn aggregate_window_spans_all_periods() {
        let source = MemorySource::default();
        let mut resolver = DimResolver::new(source, None);
        let msg = message(vec![alert_entity(
            "a1",
            Alert {
                active_period: vec![
                    TimeRange {
                        start: Some(1700000500),
                        end: Some(1700000900),
                    },
                    TimeRange {
                        start: Some(1700000100),
                        end: None,
                    },
                    TimeRange {
                        start: None,
                        end: Some(1700001200),
                    },
                ],
                ..Default::default()
            },
        )]);

        let batch = extract_alert_batch(&msg, Some(1700000000), &mut resolver)
            .await
            .unwrap();
        let row = &batch.rows[0];
        assert_eq!(
            row.active_start_utc.map(|dt| dt.timestamp()),
            Some(1700000100)
        );
        assert_eq!(row.active_end_utc.map(|dt| dt.timestamp()), Some(1700001200));
        assert_eq!(batch.periods.len(), 3);
        assert_eq!(batch.periods[1].1, 1);
    }

    #[tokio::test]
    async fn repeated_informed_entities_collapse() {
        let mut source = MemorySource::default();
        source.routes.insert("R4".to_string());
        source.stops.insert("51003".to_string());
        source.trips.insert("T1".to_string());
        let mut resolver = DimResolver::new(source, None);

        let informed = vec![
            EntitySelector {
                route_id: Some("R4".to_string()),
                stop_id: Some("51003".to_string()),
                ..Default::default()
            },
            EntitySelector {
                route_id: Some("R4".to_string()),
                trip: Some(TripDescriptor {
                    trip_id: Some("T1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            // Unknown entities are dropped, not errors.
            EntitySelector {
                route_id: Some("GHOST".to_string()),
                ..Default::default()
            },
        ];
        let msg = message(vec![alert_entity(
            "a1",
            Alert {
                informed_entity: informed,
                ..Default::default()
            },
        )]);

        let batch = extract_alert_batch(&msg, Some(1700000000), &mut resolver)
            .await
            .unwrap();
        assert_eq!(batch.routes.len(), 1);
        assert_eq!(batch.stops.len(), 1);
        assert_eq!(batch.trips.len(), 1);
        assert!(resolver.missing.routes.contains("GHOST"));
    }

    #[tokio::test]
    async fn cause_and_effect_are_stored_as_names() {
        let source = MemorySource::default();
        let mut resolver = DimResolver::new(source, None);
        let msg = message(vec![alert_entity(
            "a1",
            Alert {
                cause: Some(gtfs_realtime::alert::Cause::Maintenance as i32),
                effect: Some(gtfs_realtime::alert::Effect::SignificantDelays as i32),
                ..Default::default()
            },
        )]);

        let batch = extract_alert_batch(&msg, None, &mut resolver).await.unwrap();
        assert_eq!(batch.rows[0].cause.as_deref(), Some("MAINTENANCE"));
        assert_eq!(
            batch.rows[0].effect.as_deref(),
            Some("SIGNIFICANT_DELAYS")
        );
    }
}
