// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::db_schema::{
    RODALIES_CURRENT_TABLE, RODALIES_HISTORY_TABLE, RODALIES_POSITIONS_TABLE,
    VEHICLE_POSITIONS_TABLE,
};
use crate::dimensions::{DimResolver, ReferenceSource};
use crate::writers::trip_delays::{DelayLookup, TripDelaySnapshot};
use crate::{epoch_to_datetime, vehicle_key};
use chrono::{DateTime, Utc};
use gtfs_realtime::FeedMessage;
use std::collections::HashMap;
use tokio_postgres::GenericClient;
use uuid::Uuid;

/// One vehicle entity flattened into relational shape. Reference linkage is
/// nulled rather than dropped when the static dataset does not know the id.
#[derive(Clone, Debug, PartialEq)]
pub struct VehiclePositionRecord {
    pub entity_id: String,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub current_stop_id: Option<String>,
    pub previous_stop_id: Option<String>,
    pub next_stop_id: Option<String>,
    pub next_stop_sequence: Option<i32>,
    pub status: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub vehicle_timestamp_utc: Option<DateTime<Utc>>,
}

fn stop_status_name(value: i32) -> Option<String> {
    gtfs_realtime::vehicle_position::VehicleStopStatus::try_from(value)
        .ok()
        .map(|v| v.as_str_name().to_string())
}

/// Whether a vehicle belongs to the rail subset, selected by label prefix.
/// Rodalies labels line codes like "R4"; the prefix stays configurable since
/// the feed does not carry a route-type field here.
pub fn is_rail_label(label: Option<&str>, prefix: &str) -> bool {
    match label {
        Some(label) => label
            .trim()
            .to_uppercase()
            .starts_with(&prefix.to_uppercase()),
        None => false,
    }
}

/// Flatten the vehicle-positions feed. Duplicate entity ids within one feed
/// collapse to the last occurrence.
pub async fn extract_vehicle_position_rows<S: ReferenceSource>(
    message: &FeedMessage,
    resolver: &mut DimResolver<'_, S>,
) -> Result<Vec<VehiclePositionRecord>, Box<dyn std::error::Error + Sync + Send>> {
    let mut records_by_entity: HashMap<String, VehiclePositionRecord> = HashMap::new();

    for entity in &message.entity {
        let Some(vehicle) = &entity.vehicle else {
            continue;
        };
        if entity.id.is_empty() {
            continue;
        }

        let descriptor = vehicle.vehicle.as_ref();
        let raw_trip_id = vehicle
            .trip
            .as_ref()
            .and_then(|trip| trip.trip_id.as_deref())
            .filter(|v| !v.is_empty());

        let trip_valid = resolver.ensure_trip(raw_trip_id).await?;
        let trip_id = if trip_valid { raw_trip_id } else { None };
        let mut route_id = if trip_valid {
            resolver.route_for_trip(raw_trip_id).await?
        } else {
            None
        };
        if let Some(candidate) = route_id.as_deref() {
            if !resolver.ensure_route(Some(candidate)).await? {
                route_id = None;
            }
        }

        let mut current_stop_id = vehicle.stop_id.as_deref().filter(|v| !v.is_empty());
        if !resolver.ensure_stop(current_stop_id).await? {
            current_stop_id = None;
        }

        let mut previous_stop_id = None;
        let mut next_stop_id = None;
        let mut next_stop_sequence = None;
        if let (Some(stop_id), Some(trip)) = (current_stop_id, raw_trip_id) {
            if let Some((index, _entry)) = resolver.stop_context(trip, stop_id).await? {
                if let Some(prev_entry) = resolver.adjacent_stop(trip, index, false).await? {
                    if resolver.ensure_stop(Some(prev_entry.stop_id.as_str())).await? {
                        previous_stop_id = Some(prev_entry.stop_id);
                    }
                }
                if let Some(next_entry) = resolver.adjacent_stop(trip, index, true).await? {
                    if resolver.ensure_stop(Some(next_entry.stop_id.as_str())).await? {
                        next_stop_sequence = Some(next_entry.stop_sequence);
                        next_stop_id = Some(next_entry.stop_id);
                    }
                }
            }
        }

        records_by_entity.insert(
            entity.id.clone(),
            VehiclePositionRecord {
                entity_id: entity.id.clone(),
                vehicle_id: descriptor.and_then(|d| d.id.clone()),
                vehicle_label: descriptor.and_then(|d| d.label.clone()),
                trip_id: trip_id.map(str::to_string),
                route_id,
                current_stop_id: current_stop_id.map(str::to_string),
                previous_stop_id,
                next_stop_id,
                next_stop_sequence,
                status: vehicle.current_status.and_then(stop_status_name),
                latitude: vehicle.position.as_ref().map(|p| p.latitude as f64),
                longitude: vehicle.position.as_ref().map(|p| p.longitude as f64),
                vehicle_timestamp_utc: vehicle
                    .timestamp
                    .and_then(|ts| epoch_to_datetime(ts as i64)),
            },
        );
    }

    Ok(records_by_entity.into_values().collect())
}

fn delay_for<'a>(
    record: &VehiclePositionRecord,
    delay_lookup: &'a DelayLookup,
) -> Option<&'a TripDelaySnapshot> {
    let trip_id = record.trip_id.as_deref()?;
    let stop_id = record.current_stop_id.as_deref()?;
    delay_lookup.get(&(trip_id.to_string(), stop_id.to_string()))
}

/// Persist extracted vehicle records: every record goes to the generic
/// positions table; rail records additionally go to the rail positions table
/// (enriched with this cycle's delay lookup), the append-only history table
/// and the per-vehicle current table, and rows older than the retention
/// window are pruned. All inside the caller's transaction.
#[allow(clippy::too_many_arguments)]
pub async fn store_vehicle_positions(
    db: &impl GenericClient,
    snapshot_id: Uuid,
    polled_at: DateTime<Utc>,
    records: &[VehiclePositionRecord],
    rail_label_prefix: &str,
    delay_lookup: &DelayLookup,
    trip_update_timestamp: Option<DateTime<Utc>>,
    history_retention: chrono::Duration,
) -> Result<usize, tokio_postgres::Error> {
    if records.is_empty() {
        return Ok(0);
    }

    let insert_position = db
        .prepare(&format!(
            "INSERT INTO {VEHICLE_POSITIONS_TABLE} (
                snapshot_id, entity_id, vehicle_id, vehicle_label, trip_id, route_id,
                current_stop_id, previous_stop_id, next_stop_id, next_stop_sequence,
                status, latitude, longitude
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (snapshot_id, entity_id) DO NOTHING"
        ))
        .await?;
    for record in records {
        db.execute(
            &insert_position,
            &[
                &snapshot_id,
                &record.entity_id,
                &record.vehicle_id,
                &record.vehicle_label,
                &record.trip_id,
                &record.route_id,
                &record.current_stop_id,
                &record.previous_stop_id,
                &record.next_stop_id,
                &record.next_stop_sequence,
                &record.status,
                &record.latitude,
                &record.longitude,
            ],
        )
        .await?;
    }

    let rail_records: Vec<&VehiclePositionRecord> = records
        .iter()
        .filter(|record| is_rail_label(record.vehicle_label.as_deref(), rail_label_prefix))
        .collect();

    if !rail_records.is_empty() {
        let insert_rail = db
            .prepare(&format!(
                "INSERT INTO {RODALIES_POSITIONS_TABLE} (
                    snapshot_id, entity_id, vehicle_id, vehicle_label, trip_id, route_id,
                    current_stop_id, previous_stop_id, next_stop_id, next_stop_sequence,
                    status, latitude, longitude,
                    arrival_delay_seconds, departure_delay_seconds, schedule_relationship,
                    predicted_arrival_utc, predicted_departure_utc, trip_update_timestamp_utc
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                          $16, $17, $18, $19)
                ON CONFLICT (snapshot_id, entity_id) DO NOTHING"
            ))
            .await?;
        let insert_history = db
            .prepare(&format!(
                "INSERT INTO {RODALIES_HISTORY_TABLE} (
                    vehicle_key, snapshot_id, vehicle_id, entity_id, vehicle_label, trip_id,
                    route_id, current_stop_id, previous_stop_id, next_stop_id,
                    next_stop_sequence, status, latitude, longitude, vehicle_timestamp_utc,
                    polled_at_utc, arrival_delay_seconds, departure_delay_seconds,
                    schedule_relationship, predicted_arrival_utc, predicted_departure_utc,
                    trip_update_timestamp_utc
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                          $16, $17, $18, $19, $20, $21, $22)
                ON CONFLICT (vehicle_key, snapshot_id) DO NOTHING"
            ))
            .await?;
        let upsert_current = db
            .prepare(&format!(
                "INSERT INTO {RODALIES_CURRENT_TABLE} (
                    vehicle_key, snapshot_id, vehicle_id, entity_id, vehicle_label, trip_id,
                    route_id, current_stop_id, previous_stop_id, next_stop_id,
                    next_stop_sequence, status, latitude, longitude, vehicle_timestamp_utc,
                    polled_at_utc, arrival_delay_seconds, departure_delay_seconds,
                    schedule_relationship, predicted_arrival_utc, predicted_departure_utc,
                    trip_update_timestamp_utc, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                          $16, $17, $18, $19, $20, $21, $22, $23)
                ON CONFLICT (vehicle_key) DO UPDATE SET
                    snapshot_id = EXCLUDED.snapshot_id,
                    vehicle_id = EXCLUDED.vehicle_id,
                    entity_id = EXCLUDED.entity_id,
                    vehicle_label = EXCLUDED.vehicle_label,
                    trip_id = EXCLUDED.trip_id,
                    route_id = EXCLUDED.route_id,
                    current_stop_id = EXCLUDED.current_stop_id,
                    previous_stop_id = EXCLUDED.previous_stop_id,
                    next_stop_id = EXCLUDED.next_stop_id,
                    next_stop_sequence = EXCLUDED.next_stop_sequence,
                    status = EXCLUDED.status,
                    latitude = EXCLUDED.latitude,
                    longitude = EXCLUDED.longitude,
                    vehicle_timestamp_utc = EXCLUDED.vehicle_timestamp_utc,
                    polled_at_utc = EXCLUDED.polled_at_utc,
                    arrival_delay_seconds = EXCLUDED.arrival_delay_seconds,
                    departure_delay_seconds = EXCLUDED.departure_delay_seconds,
                    schedule_relationship = EXCLUDED.schedule_relationship,
                    predicted_arrival_utc = EXCLUDED.predicted_arrival_utc,
                    predicted_departure_utc = EXCLUDED.predicted_departure_utc,
                    trip_update_timestamp_utc = EXCLUDED.trip_update_timestamp_utc,
                    updated_at = EXCLUDED.updated_at"
            ))
            .await?;

        let updated_at = Utc::now();
        for record in &rail_records {
            let key = vehicle_key(record.vehicle_id.as_deref(), &record.entity_id);
            let delay = delay_for(record, delay_lookup);
            let arrival_delay = delay.and_then(|d| d.arrival_delay_seconds);
            let departure_delay = delay.and_then(|d| d.departure_delay_seconds);
            let schedule_relationship = delay.and_then(|d| d.schedule_relationship.clone());
            let predicted_arrival = delay.and_then(|d| d.predicted_arrival_utc);
            let predicted_departure = delay.and_then(|d| d.predicted_departure_utc);

            db.execute(
                &insert_rail,
                &[
                    &snapshot_id,
                    &record.entity_id,
                    &record.vehicle_id,
                    &record.vehicle_label,
                    &record.trip_id,
                    &record.route_id,
                    &record.current_stop_id,
                    &record.previous_stop_id,
                    &record.next_stop_id,
                    &record.next_stop_sequence,
                    &record.status,
                    &record.latitude,
                    &record.longitude,
                    &arrival_delay,
                    &departure_delay,
                    &schedule_relationship,
                    &predicted_arrival,
                    &predicted_departure,
                    &trip_update_timestamp,
                ],
            )
            .await?;

            db.execute(
                &insert_history,
                &[
                    &key,
                    &snapshot_id,
                    &record.vehicle_id,
                    &record.entity_id,
                    &record.vehicle_label,
                    &record.trip_id,
                    &record.route_id,
                    &record.current_stop_id,
                    &record.previous_stop_id,
                    &record.next_stop_id,
                    &record.next_stop_sequence,
                    &record.status,
                    &record.latitude,
                    &record.longitude,
                    &record.vehicle_timestamp_utc,
                    &polled_at,
                    &arrival_delay,
                    &departure_delay,
                    &schedule_relationship,
                    &predicted_arrival,
                    &predicted_departure,
                    &trip_update_timestamp,
                ],
            )
            .await?;

            db.execute(
                &upsert_current,
                &[
                    &key,
                    &snapshot_id,
                    &record.vehicle_id,
                    &record.entity_id,
                    &record.vehicle_label,
                    &record.trip_id,
                    &record.route_id,
                    &record.current_stop_id,
                    &record.previous_stop_id,
                    &record.next_stop_id,
                    &record.next_stop_sequence,
                    &record.status,
                    &record.latitude,
                    &record.longitude,
                    &record.vehicle_timestamp_utc,
                    &polled_at,
                    &arrival_delay,
                    &departure_delay,
                    &schedule_relationship,
                    &predicted_arrival,
                    &predicted_departure,
                    &trip_update_timestamp,
                    &updated_at,
                ],
            )
            .await?;
        }
    }

    let cutoff = polled_at - history_retention;
    let prune_history = format!("DELETE FROM {RODALIES_HISTORY_TABLE} WHERE polled_at_utc < $1");
    db.execute(prune_history.as_str(), &[&cutoff]).await?;
    let prune_current = format!("DELETE FROM {RODALIES_CURRENT_TABLE} WHERE polled_at_utc < $1");
    db.execute(prune_current.as_str(), &[&cutoff]).await?;

    Ok(records.len())
}
