// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::db_schema::RODALIES_POSITIONS_TABLE;
use crate::failure::FailureHistory;
use crate::notify::{WebhookConfig, post_webhook};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};

/// Earliest local time-of-day at which the previous day's report may go out,
/// leaving a small buffer past midnight for the last cycle of the day.
fn report_window_opens() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 5, 0).expect("static time")
}

#[derive(Debug)]
pub struct ReportState {
    pub last_sent_date: Option<NaiveDate>,
}

impl ReportState {
    /// Seed with today so a freshly started poller never reports a day it
    /// did not observe.
    pub fn starting_today(tz: Tz) -> Self {
        ReportState {
            last_sent_date: Some(Utc::now().with_timezone(&tz).date_naive()),
        }
    }
}

/// The once-per-day gate: past the window opening and not yet sent today.
pub fn report_due(now_local: DateTime<Tz>, last_sent: Option<NaiveDate>) -> bool {
    if last_sent == Some(now_local.date_naive()) {
        return false;
    }
    now_local.time() >= report_window_opens()
}

/// UTC bounds of one local calendar day.
fn local_day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let day_start = |d: NaiveDate| {
        let naive = d.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    };
    let next = date.checked_add_days(Days::new(1)).unwrap_or(date);
    (day_start(date), day_start(next))
}

/// Build the previous-day summary text. The bool is true when the day had
/// any data or recorded failures.
pub async fn summarize_day(
    db: &tokio_postgres::Client,
    report_date: NaiveDate,
    tz: Tz,
    failure_times: Option<&BTreeMap<String, BTreeSet<String>>>,
) -> Result<(String, bool), tokio_postgres::Error> {
    let (start_utc, end_utc) = local_day_bounds(report_date, tz);

    let row = db
        .query_one(
            "SELECT COUNT(*), MIN(polled_at_utc), MAX(polled_at_utc)
             FROM rt_snapshots
             WHERE polled_at_utc >= $1 AND polled_at_utc < $2",
            &[&start_utc, &end_utc],
        )
        .await?;
    let snapshot_count: i64 = row.get(0);
    let first_poll: Option<DateTime<Utc>> = row.get(1);
    let last_poll: Option<DateTime<Utc>> = row.get(2);

    let vehicle_rows_total: i64 = db
        .query_one(
            "SELECT COUNT(*)
             FROM rt_vehicle_positions vp
             JOIN rt_snapshots rs USING (snapshot_id)
             WHERE rs.polled_at_utc >= $1 AND rs.polled_at_utc < $2",
            &[&start_utc, &end_utc],
        )
        .await?
        .get(0);

    let rodalies_query = format!(
        "SELECT COUNT(*)
         FROM {RODALIES_POSITIONS_TABLE} vp
         JOIN rt_snapshots rs USING (snapshot_id)
         WHERE rs.polled_at_utc >= $1 AND rs.polled_at_utc < $2"
    );
    let rodalies_rows_total: i64 = db
        .query_one(rodalies_query.as_str(), &[&start_utc, &end_utc])
        .await?
        .get(0);

    let trip_updates_total: i64 = db
        .query_one(
            "SELECT COUNT(*)
             FROM rt_trip_delays td
             JOIN rt_snapshots rs USING (snapshot_id)
             WHERE rs.polled_at_utc >= $1 AND rs.polled_at_utc < $2",
            &[&start_utc, &end_utc],
        )
        .await?
        .get(0);

    let distinct_alerts: i64 = db
        .query_one(
            "SELECT COUNT(DISTINCT alert_id)
             FROM rt_alerts ra
             JOIN rt_snapshots rs USING (snapshot_id)
             WHERE rs.polled_at_utc >= $1 AND rs.polled_at_utc < $2",
            &[&start_utc, &end_utc],
        )
        .await?
        .get(0);

    let mut lines = vec![
        format!(
            "**GTFS-RT Daily Report  {} ({})**",
            report_date.format("%Y-%m-%d"),
            tz.name()
        ),
        String::new(),
    ];

    if snapshot_count > 0 {
        lines.push(format!(
            "Snapshots captured: {} (first {}, last {}).",
            snapshot_count,
            first_poll.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| "n/a".to_string()),
            last_poll.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| "n/a".to_string()),
        ));
        lines.push(format!(
            "Vehicle position rows (all services): {}.",
            vehicle_rows_total
        ));
        lines.push(format!("Rodalies vehicle rows: {}.", rodalies_rows_total));
        lines.push(format!(
            "Trip updates stored: {}, distinct alerts stored: {}.",
            trip_updates_total, distinct_alerts
        ));
    } else {
        lines.push(format!(
            "No GTFS-RT snapshots were captured on {} ({}).",
            report_date.format("%Y-%m-%d"),
            tz.name()
        ));
    }

    let mut failure_section_added = false;
    if let Some(failure_times) = failure_times {
        if !failure_times.is_empty() {
            lines.push(String::new());
            lines.push(format!("Polling failures ({}):", tz.name()));
            for (feed_url, times) in failure_times {
                if !times.is_empty() {
                    lines.push(format!("- `{}` at {}", feed_url, times.iter().join(", ")));
                }
            }
            failure_section_added = true;
        }
    }
    if !failure_section_added {
        lines.push(String::new());
        lines.push("Polling failures: none recorded.".to_string());
    }

    let mut has_data = snapshot_count > 0
        || vehicle_rows_total > 0
        || trip_updates_total > 0
        || distinct_alerts > 0;
    if !has_data {
        has_data = failure_times.map(|f| !f.is_empty()).unwrap_or(false);
    }

    Ok((lines.join("\n"), has_data))
}

/// Compute and send the previous day's report at most once per local day.
pub async fn maybe_send_daily_report(
    db: &tokio_postgres::Client,
    http: &reqwest::Client,
    state: &mut ReportState,
    history: &mut FailureHistory,
    webhook: &WebhookConfig,
    tz: Tz,
) -> Result<(), tokio_postgres::Error> {
    let now_local = Utc::now().with_timezone(&tz);
    let current_date = now_local.date_naive();

    if !report_due(now_local, state.last_sent_date) {
        return Ok(());
    }

    if !webhook.is_configured() {
        state.last_sent_date = Some(current_date);
        log::debug!("Daily report webhook not configured; skipping report dispatch.");
        return Ok(());
    }

    let Some(report_date) = current_date.checked_sub_days(Days::new(1)) else {
        state.last_sent_date = Some(current_date);
        return Ok(());
    };

    let (report_text, _) = summarize_day(db, report_date, tz, history.day(report_date)).await?;
    let caption = format!("daily report for {}", report_date.format("%Y-%m-%d"));

    if post_webhook(http, webhook, &report_text, &caption).await {
        state.last_sent_date = Some(current_date);
        history.remove_day(report_date);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Madrid;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        Madrid
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn report_waits_for_the_window_and_fires_once_per_day() {
        let yesterday = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        // Too early past midnight.
        assert!(!report_due(local(2024, 3, 4, 0, 2), Some(yesterday)));
        // Window open, not yet sent today.
        assert!(report_due(local(2024, 3, 4, 0, 6), Some(yesterday)));
        assert!(report_due(local(2024, 3, 4, 14, 0), None));
        // Already sent today.
        assert!(!report_due(local(2024, 3, 4, 14, 0), Some(today)));
    }

    #[test]
    fn day_bounds_cover_exactly_one_local_day() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 10).unwrap();
        let (start, end) = local_day_bounds(date, Madrid);
        // Madrid is UTC+2 in July.
        assert_eq!(start.to_rfc3339(), "2024-07-09T22:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-07-10T22:00:00+00:00");
        assert_eq!((end - start).num_hours(), 24);
    }
}
