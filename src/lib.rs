// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::arc_with_non_send_sync,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::bytes_nth,
    clippy::deprecated_clippy_cfg_attr,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::cmp_null,
    clippy::op_ref
)]

pub mod cycle;
pub mod daily_report;
pub mod db;
pub mod db_schema;
pub mod dimensions;
pub mod failure;
pub mod feed_kind;
pub mod fetch;
pub mod maintenance;
pub mod notify;
pub mod snapshots;
pub mod writers;

use chrono::{DateTime, NaiveTime, Utc};

/// Convert a GTFS-RT epoch-seconds value into a UTC timestamp.
/// Zero and negative values are treated as "absent", which is how the feeds
/// encode unset protobuf timestamp fields.
pub fn epoch_to_datetime(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    DateTime::from_timestamp(value, 0)
}

/// Parse an HH:MM or HH:MM:SS time-of-day string.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(format!("Invalid time format: {:?}", value));
    }
    let hour: u32 = parts[0]
        .parse()
        .map_err(|_| format!("Invalid time components in {:?}", value))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| format!("Invalid time components in {:?}", value))?;
    let second: u32 = if parts.len() == 3 {
        parts[2]
            .parse()
            .map_err(|_| format!("Invalid time components in {:?}", value))?
    } else {
        0
    };
    NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| format!("Time out of range: {:?}", value))
}

/// Parse a GTFS HH:MM:SS clock value into seconds since midnight.
/// GTFS allows hours past 24 for trips that run over midnight, so this is not
/// a NaiveTime.
pub fn time_to_seconds(value: &str) -> Option<i32> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 {
        return None;
    }
    let hours: i32 = parts[0].parse().ok()?;
    let minutes: i32 = parts[1].parse().ok()?;
    let seconds: i32 = if parts.len() > 2 {
        parts[2].parse().ok()?
    } else {
        0
    };
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Stable per-vehicle key: the vehicle descriptor id when present, otherwise
/// the feed entity id prefixed so the two namespaces cannot collide.
pub fn vehicle_key(vehicle_id: Option<&str>, entity_id: &str) -> String {
    match vehicle_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("entity:{}", entity_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_is_absent() {
        assert!(epoch_to_datetime(0).is_none());
        assert!(epoch_to_datetime(-5).is_none());
        assert_eq!(
            epoch_to_datetime(1678886400).map(|dt| dt.timestamp()),
            Some(1678886400)
        );
    }

    #[test]
    fn parse_time_of_day_accepts_both_forms() {
        assert_eq!(
            parse_time_of_day("10:00"),
            Ok(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
        );
        assert_eq!(
            parse_time_of_day("02:15:30"),
            Ok(NaiveTime::from_hms_opt(2, 15, 30).unwrap())
        );
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("10").is_err());
        assert!(parse_time_of_day("aa:bb").is_err());
    }

    #[test]
    fn time_to_seconds_handles_over_24h() {
        assert_eq!(time_to_seconds("06:30:00"), Some(23400));
        assert_eq!(time_to_seconds("25:01:02"), Some(90062));
        assert_eq!(time_to_seconds("12:05"), Some(43500));
        assert_eq!(time_to_seconds(""), None);
        assert_eq!(time_to_seconds("12"), None);
    }

    #[test]
    fn vehicle_key_falls_back_to_entity_id() {
        assert_eq!(vehicle_key(Some("R4-0042"), "e1"), "R4-0042");
        assert_eq!(vehicle_key(Some(""), "e1"), "entity:e1");
        assert_eq!(vehicle_key(None, "e1"), "entity:e1");
    }
}
