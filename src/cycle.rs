// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::dimensions::{DimResolver, PgReferenceSource, StopTimesCsvFallback};
use crate::epoch_to_datetime;
use crate::failure::{FailureHistory, FailureTracker};
use crate::feed_kind::{FeedKind, index_envelopes};
use crate::fetch::fetch_feed;
use crate::notify::{WebhookConfig, send_failure_notification};
use crate::snapshots::{all_headers_stale, insert_snapshot, load_feed_cursors, update_feed_cursor};
use crate::writers::alerts::{extract_alert_batch, store_alerts};
use crate::writers::trip_delays::{extract_trip_delay_rows, store_trip_delays};
use crate::writers::vehicle_positions::{extract_vehicle_position_rows, store_vehicle_positions};
use chrono::Utc;
use chrono_tz::Tz;
use itertools::Itertools;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Everything one poll cycle needs to know, resolved once at startup.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub feeds: Vec<String>,
    pub http_timeout: Duration,
    pub dry_run: bool,
    pub history_retention: chrono::Duration,
    pub rail_label_prefix: String,
    pub failure_threshold: u32,
    pub timezone: Tz,
}

/// What one cycle did. Stale and Incomplete are expected outcomes, not
/// errors; write-phase failures surface as `Err` and roll the cycle back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Stored {
        snapshot_id: Uuid,
        vehicles: usize,
        delays: usize,
        alerts: usize,
    },
    Stale,
    Incomplete,
    DryRun,
}

/// One full ingestion cycle: fetch every configured feed, require all three
/// kinds, skip when nothing moved past the cursors, then write the snapshot
/// and its children in a single transaction. Any error after the transaction
/// opens rolls the whole cycle back.
pub async fn run_cycle(
    http: &reqwest::Client,
    db: &mut tokio_postgres::Client,
    config: &CycleConfig,
    failures: &mut FailureTracker,
    history: &mut FailureHistory,
    alert_webhook: &WebhookConfig,
    stop_times_fallback: Option<&mut StopTimesCsvFallback>,
) -> Result<CycleOutcome, Box<dyn std::error::Error + Sync + Send>> {
    let mut envelopes = Vec::new();
    for url in &config.feeds {
        match fetch_feed(http, url, config.http_timeout).await {
            Ok(envelope) => {
                failures.record_success(url);
                envelopes.push(envelope);
            }
            Err(e) => {
                log::warn!("Failed to process feed {}: {}", url, e);
                let count = failures.record_failure(url);
                let now_local = Utc::now().with_timezone(&config.timezone);
                let time_str = now_local.format("%H:%M").to_string();
                history.record(now_local.date_naive(), url, time_str.clone());
                log::warn!(
                    "Recorded polling failure for {} at {} {} (consecutive={})",
                    url,
                    time_str,
                    config.timezone.name(),
                    count
                );
                if failures.should_alert(url, config.failure_threshold) {
                    send_failure_notification(
                        http,
                        alert_webhook,
                        url,
                        count,
                        config.failure_threshold,
                        &e.to_string(),
                    )
                    .await;
                }
            }
        }
    }

    let fetched_kinds: HashSet<FeedKind> = envelopes.iter().map(|e| e.kind).collect();
    if fetched_kinds.len() != FeedKind::ALL.len() {
        let fetched = fetched_kinds
            .iter()
            .sorted()
            .map(|kind| kind.as_str())
            .join(", ");
        log::warn!(
            "Skipping snapshot because not all feeds were fetched successfully ({}).",
            if fetched.is_empty() {
                "none"
            } else {
                fetched.as_str()
            }
        );
        return Ok(CycleOutcome::Incomplete);
    }

    let indexed = index_envelopes(envelopes);
    let cursors = load_feed_cursors(&*db).await?;
    if all_headers_stale(&indexed, &cursors) {
        log::info!("All feed headers unchanged; skipping snapshot write.");
        return Ok(CycleOutcome::Stale);
    }

    if config.dry_run {
        for (kind, envelope) in &indexed {
            log::info!(
                "Dry run: {} feed contains {} entities (header={:?})",
                kind,
                envelope.message.entity.len(),
                envelope.header_timestamp
            );
        }
        return Ok(CycleOutcome::DryRun);
    }

    let trip_envelope = indexed
        .get(&FeedKind::TripUpdates)
        .ok_or("trip updates feed missing after validation")?;
    let alert_envelope = indexed
        .get(&FeedKind::Alerts)
        .ok_or("alerts feed missing after validation")?;
    let vehicle_envelope = indexed
        .get(&FeedKind::VehiclePositions)
        .ok_or("vehicle positions feed missing after validation")?;

    let polled_at = Utc::now();
    let tx = db.transaction().await?;
    let mut resolver = DimResolver::new(PgReferenceSource::new(&tx), stop_times_fallback);

    let snapshot_id = insert_snapshot(&tx, polled_at, &indexed).await?;

    let (delay_rows, delay_lookup) =
        extract_trip_delay_rows(&trip_envelope.message, &mut resolver).await?;
    let delay_count = store_trip_delays(&tx, snapshot_id, &delay_rows).await?;

    let alert_created_at = alert_envelope
        .header_timestamp
        .and_then(|ts| epoch_to_datetime(ts as i64));
    let alert_batch = extract_alert_batch(
        &alert_envelope.message,
        alert_envelope.header_timestamp,
        &mut resolver,
    )
    .await?;
    let alert_count = store_alerts(&tx, snapshot_id, alert_created_at, &alert_batch).await?;

    let trip_feed_timestamp = trip_envelope
        .header_timestamp
        .and_then(|ts| epoch_to_datetime(ts as i64));
    let vehicle_records =
        extract_vehicle_position_rows(&vehicle_envelope.message, &mut resolver).await?;
    let vehicle_count = store_vehicle_positions(
        &tx,
        snapshot_id,
        polled_at,
        &vehicle_records,
        &config.rail_label_prefix,
        &delay_lookup,
        trip_feed_timestamp,
        config.history_retention,
    )
    .await?;

    for (kind, envelope) in &indexed {
        update_feed_cursor(&tx, *kind, envelope.header_timestamp, snapshot_id).await?;
    }

    resolver.missing.log_report();
    drop(resolver);
    tx.commit().await?;

    log::info!(
        "Stored snapshot {} at {} (vehicles={}, delays={}, alerts={})",
        snapshot_id,
        polled_at.to_rfc3339(),
        vehicle_count,
        delay_count,
        alert_count
    );

    Ok(CycleOutcome::Stored {
        snapshot_id,
        vehicles: vehicle_count,
        delays: delay_count,
        alerts: alert_count,
    })
}

/// Seconds until the next aligned poll instant. Every poller configured with
/// the same (interval, offset) samples at the same wall-clock instants
/// regardless of when its process started.
pub fn seconds_until_next_alignment(now_epoch: f64, interval: f64, offset: f64) -> f64 {
    if interval <= 0.0 {
        return 0.0;
    }
    let remainder = (now_epoch - offset).rem_euclid(interval);
    let wait = (interval - remainder) % interval;
    if wait < 1e-3 { 0.0 } else { wait }
}

/// Cooperative shutdown flag. Signal handlers set it; the poll loop observes
/// it between cycles and before each maintenance gate, so an in-flight cycle
/// always completes or rolls back before the process exits.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow_and_update() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow_and_update() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
