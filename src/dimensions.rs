// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::time_to_seconds;
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tokio_postgres::GenericClient;

/// One scheduled stop of a trip, from `dim_stop_times` or the CSV fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopTimeEntry {
    pub stop_sequence: i32,
    pub stop_id: String,
    pub arrival_seconds: Option<i32>,
    pub departure_seconds: Option<i32>,
}

/// Read-only view of the static GTFS dimension tables. The production
/// implementation queries Postgres through whatever client currently holds
/// the cycle transaction; tests substitute an in-memory map.
pub trait ReferenceSource {
    async fn trip_exists(
        &self,
        trip_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>>;

    /// Outer None: the trip is not in `dim_trips` at all. Inner None: the
    /// trip row exists but has no route.
    async fn route_for_trip(
        &self,
        trip_id: &str,
    ) -> Result<Option<Option<String>>, Box<dyn std::error::Error + Sync + Send>>;

    async fn route_exists(
        &self,
        route_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>>;

    async fn stop_exists(
        &self,
        stop_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>>;

    /// Scheduled stops for a trip ordered by stop_sequence; empty when the
    /// sequence table has no rows for it.
    async fn trip_stop_times(
        &self,
        trip_id: &str,
    ) -> Result<Vec<StopTimeEntry>, Box<dyn std::error::Error + Sync + Send>>;
}

pub struct PgReferenceSource<'a, C: GenericClient> {
    db: &'a C,
}

impl<'a, C: GenericClient> PgReferenceSource<'a, C> {
    pub fn new(db: &'a C) -> Self {
        PgReferenceSource { db }
    }
}

impl<'a, C: GenericClient> ReferenceSource for PgReferenceSource<'a, C> {
    async fn trip_exists(
        &self,
        trip_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>> {
        let row = self
            .db
            .query_opt("SELECT 1 FROM dim_trips WHERE trip_id = $1", &[&trip_id])
            .await?;
        Ok(row.is_some())
    }

    async fn route_for_trip(
        &self,
        trip_id: &str,
    ) -> Result<Option<Option<String>>, Box<dyn std::error::Error + Sync + Send>> {
        let row = self
            .db
            .query_opt(
                "SELECT route_id FROM dim_trips WHERE trip_id = $1",
                &[&trip_id],
            )
            .await?;
        Ok(row.map(|row| row.get::<_, Option<String>>(0)))
    }

    async fn route_exists(
        &self,
        route_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>> {
        let row = self
            .db
            .query_opt("SELECT 1 FROM dim_routes WHERE route_id = $1", &[&route_id])
            .await?;
        Ok(row.is_some())
    }

    async fn stop_exists(
        &self,
        stop_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>> {
        let row = self
            .db
            .query_opt("SELECT 1 FROM dim_stops WHERE stop_id = $1", &[&stop_id])
            .await?;
        Ok(row.is_some())
    }

    async fn trip_stop_times(
        &self,
        trip_id: &str,
    ) -> Result<Vec<StopTimeEntry>, Box<dyn std::error::Error + Sync + Send>> {
        let rows = self
            .db
            .query(
                "SELECT stop_sequence, stop_id, arrival_seconds, departure_seconds
                 FROM dim_stop_times
                 WHERE trip_id = $1
                 ORDER BY stop_sequence",
                &[&trip_id],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| StopTimeEntry {
                stop_sequence: row.get(0),
                stop_id: row.get(1),
                arrival_seconds: row.get(2),
                departure_seconds: row.get(3),
            })
            .collect())
    }
}

/// Keys the static dataset turned out not to know about, collected per
/// category so a degraded dataset produces one log line instead of thousands.
#[derive(Debug, Default)]
pub struct MissingDimensions {
    pub trips: BTreeSet<String>,
    pub routes: BTreeSet<String>,
    pub stops: BTreeSet<String>,
}

const MISSING_SAMPLE_CAP: usize = 10;

pub(crate) fn format_missing(label: &str, keys: &BTreeSet<String>) -> String {
    let sample = keys.iter().take(MISSING_SAMPLE_CAP).join(", ");
    let more = if keys.len() > MISSING_SAMPLE_CAP {
        format!(" (+{} more)", keys.len() - MISSING_SAMPLE_CAP)
    } else {
        String::new()
    };
    format!(
        "Static GTFS mismatch: missing {} entries such as {}{}",
        label, sample, more
    )
}

impl MissingDimensions {
    pub fn is_empty(&self) -> bool {
        self.trips.is_empty() && self.routes.is_empty() && self.stops.is_empty()
    }

    /// One warn line per non-empty category, then reset.
    pub fn log_report(&mut self) {
        for (label, keys) in [
            ("trip", &mut self.trips),
            ("route", &mut self.routes),
            ("stop", &mut self.stops),
        ] {
            if keys.is_empty() {
                continue;
            }
            log::warn!("{}", format_missing(label, keys));
            keys.clear();
        }
    }
}

/// Trip-keyed stop-time profiles read from a CSV export, used when
/// `dim_stop_times` has no rows for a trip. The file is parsed once on first
/// use and the index lives for the process lifetime.
pub struct StopTimesCsvFallback {
    path: PathBuf,
    profiles: Option<HashMap<String, Vec<StopTimeEntry>>>,
}

impl StopTimesCsvFallback {
    pub fn new(path: PathBuf) -> Self {
        StopTimesCsvFallback {
            path,
            profiles: None,
        }
    }

    pub fn profile(&mut self, trip_id: &str) -> &[StopTimeEntry] {
        if self.profiles.is_none() {
            let profiles = match std::fs::read_to_string(&self.path) {
                Ok(text) => parse_stop_times_csv(&text),
                Err(e) => {
                    log::warn!(
                        "stop_times CSV fallback {} unreadable: {}",
                        self.path.display(),
                        e
                    );
                    HashMap::new()
                }
            };
            log::debug!(
                "Loaded stop_times CSV fallback with {} trip profiles",
                profiles.len()
            );
            self.profiles = Some(profiles);
        }
        self.profiles
            .as_ref()
            .and_then(|profiles| profiles.get(trip_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[cfg(test)]
    pub(crate) fn set_profiles_for_test(
        &mut self,
        profiles: HashMap<String, Vec<StopTimeEntry>>,
    ) {
        self.profiles = Some(profiles);
    }
}

/// Parse stop_times rows. Rows missing a trip id, stop id, or numeric stop
/// sequence are skipped rather than failing the whole file.
pub fn parse_stop_times_csv(text: &str) -> HashMap<String, Vec<StopTimeEntry>> {
    #[derive(serde::Deserialize)]
    struct RawStopTime {
        #[serde(default)]
        trip_id: Option<String>,
        #[serde(default)]
        stop_sequence: Option<String>,
        #[serde(default)]
        stop_id: Option<String>,
        #[serde(default)]
        arrival_time: Option<String>,
        #[serde(default)]
        departure_time: Option<String>,
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut profiles: HashMap<String, Vec<StopTimeEntry>> = HashMap::new();
    for record in reader.deserialize::<RawStopTime>() {
        let Ok(record) = record else { continue };
        let Some(trip_id) = record.trip_id.filter(|v| !v.is_empty()) else {
            continue;
        };
        let Some(stop_id) = record.stop_id.filter(|v| !v.is_empty()) else {
            continue;
        };
        let Some(stop_sequence) = record
            .stop_sequence
            .as_deref()
            .and_then(|v| v.parse::<i32>().ok())
        else {
            continue;
        };
        profiles.entry(trip_id).or_default().push(StopTimeEntry {
            stop_sequence,
            stop_id,
            arrival_seconds: record.arrival_time.as_deref().and_then(time_to_seconds),
            departure_seconds: record.departure_time.as_deref().and_then(time_to_seconds),
        });
    }

    for profile in profiles.values_mut() {
        profile.sort_by_key(|entry| entry.stop_sequence);
    }
    profiles
}

/// Per-cycle dimension cache. Every lookup goes to the reference source at
/// most once per resolver lifetime; negative results are cached too and
/// recorded in the missing-key report.
pub struct DimResolver<'a, S> {
    source: S,
    fallback: Option<&'a mut StopTimesCsvFallback>,
    trip_exists: HashMap<String, bool>,
    trip_routes: HashMap<String, Option<String>>,
    trip_profiles: HashMap<String, Vec<StopTimeEntry>>,
    route_exists: HashMap<String, bool>,
    stop_exists: HashMap<String, bool>,
    pub missing: MissingDimensions,
}

impl<'a, S: ReferenceSource> DimResolver<'a, S> {
    pub fn new(source: S, fallback: Option<&'a mut StopTimesCsvFallback>) -> Self {
        DimResolver {
            source,
            fallback,
            trip_exists: HashMap::new(),
            trip_routes: HashMap::new(),
            trip_profiles: HashMap::new(),
            route_exists: HashMap::new(),
            stop_exists: HashMap::new(),
            missing: MissingDimensions::default(),
        }
    }

    pub async fn ensure_trip(
        &mut self,
        trip_id: Option<&str>,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>> {
        let Some(trip_id) = trip_id.filter(|v| !v.is_empty()) else {
            return Ok(false);
        };
        if let Some(hit) = self.trip_exists.get(trip_id) {
            return Ok(*hit);
        }
        let exists = self.source.trip_exists(trip_id).await?;
        if !exists {
            self.missing.trips.insert(trip_id.to_string());
        }
        self.trip_exists.insert(trip_id.to_string(), exists);
        Ok(exists)
    }

    pub async fn route_for_trip(
        &mut self,
        trip_id: Option<&str>,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Sync + Send>> {
        let Some(trip_id) = trip_id.filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        if let Some(hit) = self.trip_routes.get(trip_id) {
            return Ok(hit.clone());
        }
        let route_id = match self.source.route_for_trip(trip_id).await? {
            None => {
                self.missing.trips.insert(trip_id.to_string());
                None
            }
            Some(None) => {
                self.missing
                    .routes
                    .insert(format!("(from trip {})", trip_id));
                None
            }
            Some(Some(route_id)) => Some(route_id),
        };
        self.trip_routes
            .insert(trip_id.to_string(), route_id.clone());
        Ok(route_id)
    }

    pub async fn ensure_route(
        &mut self,
        route_id: Option<&str>,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>> {
        let Some(route_id) = route_id.filter(|v| !v.is_empty()) else {
            return Ok(false);
        };
        if let Some(hit) = self.route_exists.get(route_id) {
            return Ok(*hit);
        }
        let exists = self.source.route_exists(route_id).await?;
        if !exists {
            self.missing.routes.insert(route_id.to_string());
        }
        self.route_exists.insert(route_id.to_string(), exists);
        Ok(exists)
    }

    pub async fn ensure_stop(
        &mut self,
        stop_id: Option<&str>,
    ) -> Result<bool, Box<dyn std::error::Error + Sync + Send>> {
        let Some(stop_id) = stop_id.filter(|v| !v.is_empty()) else {
            return Ok(false);
        };
        if let Some(hit) = self.stop_exists.get(stop_id) {
            return Ok(*hit);
        }
        let exists = self.source.stop_exists(stop_id).await?;
        if !exists {
            self.missing.stops.insert(stop_id.to_string());
        }
        self.stop_exists.insert(stop_id.to_string(), exists);
        Ok(exists)
    }

    async fn load_profile(
        &mut self,
        trip_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Sync + Send>> {
        if self.trip_profiles.get(trip_id).is_some() {
            return Ok(());
        }
        let rows = self.source.trip_stop_times(trip_id).await?;
        let profile = if !rows.is_empty() {
            rows
        } else if let Some(fallback) = self.fallback.as_mut() {
            let profile = fallback.profile(trip_id).to_vec();
            if profile.is_empty() {
                self.missing.trips.insert(trip_id.to_string());
            }
            profile
        } else {
            self.missing.trips.insert(trip_id.to_string());
            Vec::new()
        };
        self.trip_profiles.insert(trip_id.to_string(), profile);
        Ok(())
    }

    /// Locate a stop inside a trip's scheduled sequence. A trip with no
    /// resolvable profile yields None without recording the stop; a stop
    /// missing from a known profile is recorded.
    pub async fn stop_context(
        &mut self,
        trip_id: &str,
        stop_id: &str,
    ) -> Result<Option<(usize, StopTimeEntry)>, Box<dyn std::error::Error + Sync + Send>> {
        if trip_id.is_empty() || stop_id.is_empty() {
            return Ok(None);
        }
        self.load_profile(trip_id).await?;
        let hit = match self.trip_profiles.get(trip_id) {
            None => None,
            Some(profile) if profile.is_empty() => return Ok(None),
            Some(profile) => profile
                .iter()
                .enumerate()
                .find(|(_, entry)| entry.stop_id == stop_id)
                .map(|(index, entry)| (index, entry.clone())),
        };
        match hit {
            Some(found) => Ok(Some(found)),
            None => {
                self.missing.stops.insert(stop_id.to_string());
                Ok(None)
            }
        }
    }

    /// The profile entry adjacent to `index`, forward or backward.
    pub async fn adjacent_stop(
        &mut self,
        trip_id: &str,
        index: usize,
        forward: bool,
    ) -> Result<Option<StopTimeEntry>, Box<dyn std::error::Error + Sync + Send>> {
        if trip_id.is_empty() {
            return Ok(None);
        }
        self.load_profile(trip_id).await?;
        let Some(profile) = self.trip_profiles.get(trip_id) else {
            return Ok(None);
        };
        let neighbor = if forward {
            index.checked_add(1)
        } else {
            index.checked_sub(1)
        };
        Ok(neighbor.and_then(|i| profile.get(i)).cloned())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MemorySource;
    use super::*;

    const FALLBACK_CSV: &str = "\
trip_id,stop_sequence,stop_id,arrival_time,departure_time
T1,8,43000,06:10:00,06:11:00
T1,10,51100,06:30:00,06:31:00
T1,9,51003,06:20:00,06:21:00
T2,1,10000,25:01:00,
broken,,51003,06:00:00,06:00:00
,5,51003,06:00:00,06:00:00
";

    fn fallback() -> StopTimesCsvFallback {
        let mut fallback = StopTimesCsvFallback::new(PathBuf::from("/nonexistent/stop_times.csv"));
        fallback.set_profiles_for_test(parse_stop_times_csv(FALLBACK_CSV));
        fallback
    }

    #[test]
    fn csv_parsing_sorts_and_skips_bad_rows() {
        let profiles = parse_stop_times_csv(FALLBACK_CSV);
        assert_eq!(profiles.len(), 2);

        let t1 = &profiles["T1"];
        assert_eq!(
            t1.iter().map(|e| e.stop_id.as_str()).collect::<Vec<_>>(),
            vec!["43000", "51003", "51100"]
        );
        assert_eq!(t1[0].arrival_seconds, Some(6 * 3600 + 10 * 60));

        // Over-midnight clock values survive as plain seconds.
        assert_eq!(profiles["T2"][0].arrival_seconds, Some(25 * 3600 + 60));
        assert_eq!(profiles["T2"][0].departure_seconds, None);
    }

    #[test]
    fn unreadable_csv_is_empty_not_fatal() {
        let mut fallback = StopTimesCsvFallback::new(PathBuf::from("/nonexistent/stop_times.csv"));
        assert!(fallback.profile("T1").is_empty());
    }

    #[tokio::test]
    async fn fallback_sequence_gives_adjacent_stops() {
        // Trip known only to the CSV: previous/next stop come from the
        // fallback profile, adjacent-by-one-in-sequence.
        let source = MemorySource::default();
        let mut fallback = fallback();
        let mut resolver = DimResolver::new(source, Some(&mut fallback));

        let (index, entry) = resolver
            .stop_context("T1", "51003")
            .await
            .unwrap()
            .expect("stop should be in the fallback profile");
        assert_eq!(index, 1);
        assert_eq!(entry.stop_sequence, 9);

        let previous = resolver
            .adjacent_stop("T1", index, false)
            .await
            .unwrap()
            .expect("previous stop");
        assert_eq!(previous.stop_id, "43000");

        let next = resolver
            .adjacent_stop("T1", index, true)
            .await
            .unwrap()
            .expect("next stop");
        assert_eq!(next.stop_id, "51100");
        assert_eq!(next.stop_sequence, 10);

        // First entry has no previous, last has no next.
        assert!(resolver.adjacent_stop("T1", 0, false).await.unwrap().is_none());
        assert!(resolver.adjacent_stop("T1", 2, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_trip_recorded_once_and_queried_once() {
        let source = MemorySource::default();
        let mut resolver = DimResolver::new(source, None);

        for _ in 0..4 {
            assert!(!resolver.ensure_trip(Some("GHOST")).await.unwrap());
        }
        assert_eq!(resolver.missing.trips.len(), 1);
        assert!(resolver.missing.trips.contains("GHOST"));
        // Negative result was cached after the first source query.
        assert_eq!(resolver.source.query_count.get(), 1);
    }

    #[tokio::test]
    async fn trip_without_profile_anywhere_is_recorded_missing() {
        let source = MemorySource::default();
        let mut fallback = fallback();
        let mut resolver = DimResolver::new(source, Some(&mut fallback));

        assert!(resolver.stop_context("T9", "51003").await.unwrap().is_none());
        assert!(resolver.stop_context("T9", "51100").await.unwrap().is_none());
        assert_eq!(resolver.missing.trips.len(), 1);
        // No profile at all: the stop is not blamed.
        assert!(resolver.missing.stops.is_empty());
    }

    #[tokio::test]
    async fn stop_absent_from_known_profile_is_recorded() {
        let mut source = MemorySource::default();
        source.stop_times.insert(
            "T1".to_string(),
            vec![StopTimeEntry {
                stop_sequence: 1,
                stop_id: "10000".to_string(),
                arrival_seconds: None,
                departure_seconds: None,
            }],
        );
        let mut resolver = DimResolver::new(source, None);

        assert!(resolver.stop_context("T1", "99999").await.unwrap().is_none());
        assert!(resolver.missing.stops.contains("99999"));
    }

    #[tokio::test]
    async fn null_route_on_known_trip_is_flagged_against_routes() {
        let mut source = MemorySource::default();
        source.trips.insert("T1".to_string());
        source.trip_routes.insert("T1".to_string(), None);
        let mut resolver = DimResolver::new(source, None);

        assert_eq!(resolver.route_for_trip(Some("T1")).await.unwrap(), None);
        assert!(resolver.missing.routes.contains("(from trip T1)"));
        assert!(resolver.missing.trips.is_empty());
    }

    #[test]
    fn missing_report_caps_sample() {
        let mut missing = MissingDimensions::default();
        for i in 0..15 {
            missing.trips.insert(format!("T{:02}", i));
        }
        let line = format_missing("trip", &missing.trips);
        assert!(line.contains("T00"));
        assert!(line.contains("T09"));
        assert!(!line.contains("T10,"));
        assert!(line.ends_with("(+5 more)"));

        missing.log_report();
        assert!(missing.is_empty());
    }
}
