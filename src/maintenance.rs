// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use chrono::{DateTime, Days, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use std::path::Path;

/// Time-of-day/interval gate shared by the static-refresh and archive tasks.
/// A task runs when the local clock has passed its threshold, neither a
/// success nor an attempt has been recorded today, and the minimum interval
/// since the last success has elapsed.
#[derive(Debug, Clone)]
pub struct MaintenanceGate {
    pub threshold: NaiveTime,
    pub interval_days: u32,
    pub last_attempt: Option<NaiveDate>,
    pub last_success: Option<NaiveDate>,
}

impl MaintenanceGate {
    pub fn new(threshold: NaiveTime, interval_days: u32) -> Self {
        MaintenanceGate {
            threshold,
            interval_days,
            last_attempt: None,
            last_success: None,
        }
    }

    pub fn should_run(&self, now_local: DateTime<Tz>) -> bool {
        if now_local.time() < self.threshold {
            return false;
        }
        let today = now_local.date_naive();
        if self.last_attempt == Some(today) || self.last_success == Some(today) {
            return false;
        }
        if let Some(last_success) = self.last_success {
            if let Some(next_due) =
                last_success.checked_add_days(Days::new(self.interval_days as u64))
            {
                if today < next_due {
                    return false;
                }
            }
        }
        true
    }

    pub fn record_attempt(&mut self, date: NaiveDate) {
        self.last_attempt = Some(date);
    }

    pub fn record_success(&mut self, date: NaiveDate) {
        self.last_success = Some(date);
    }
}

/// One external maintenance executable invocation. The subprocess owns the
/// database exclusively while it runs and reports success or failure purely
/// via its exit status.
#[derive(Debug, Clone)]
pub struct ExternalTask {
    pub label: &'static str,
    pub program: String,
    pub args: Vec<String>,
}

pub fn refresh_command(
    program: &str,
    database_url: &str,
    zip_path: Option<&Path>,
    zip_url: Option<&str>,
) -> ExternalTask {
    let mut args = Vec::new();
    if let Some(zip_path) = zip_path {
        args.push("--zip-path".to_string());
        args.push(zip_path.display().to_string());
    }
    if let Some(zip_url) = zip_url {
        args.push("--zip-url".to_string());
        args.push(zip_url.to_string());
    }
    args.push("--database-url".to_string());
    args.push(database_url.to_string());
    ExternalTask {
        label: "static GTFS refresh",
        program: program.to_string(),
        args,
    }
}

pub fn archive_command(
    program: &str,
    database_url: &str,
    retention_days: f64,
    force: bool,
) -> ExternalTask {
    let mut args = vec![
        "--database-url".to_string(),
        database_url.to_string(),
        "--retention-days".to_string(),
        format!("{}", retention_days),
    ];
    if force {
        args.push("--force".to_string());
    }
    ExternalTask {
        label: "snapshot archive",
        program: program.to_string(),
        args,
    }
}

/// Run the task to completion. The caller must have released the database
/// handle beforehand; archival and dimension reloads are exclusive with
/// ingestion.
pub async fn run_external_task(task: &ExternalTask) -> bool {
    log::info!("Starting {} using {}", task.label, task.program);
    match tokio::process::Command::new(&task.program)
        .args(&task.args)
        .status()
        .await
    {
        Ok(status) if status.success() => {
            log::info!("{} completed successfully.", task.label);
            true
        }
        Ok(status) => {
            log::error!("{} exited with status {}", task.label, status);
            false
        }
        Err(e) => {
            log::error!("Failed to launch {} ({}): {}", task.label, task.program, e);
            false
        }
    }
}

/// Seed the archive gate from the archive history so gating survives
/// restarts.
pub async fn fetch_latest_archive_date(
    db: &tokio_postgres::Client,
) -> Result<Option<NaiveDate>, tokio_postgres::Error> {
    let row = db
        .query_one("SELECT MAX(archive_date) FROM rt_snapshot_archives", &[])
        .await?;
    Ok(row.get(0))
}
