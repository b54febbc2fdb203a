// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use clap::Parser;
use rodalies::cycle::{
    CancelToken, CycleConfig, CycleOutcome, run_cycle, seconds_until_next_alignment,
};
use rodalies::daily_report::{ReportState, maybe_send_daily_report};
use rodalies::db::Db;
use rodalies::db_schema::ensure_schema;
use rodalies::dimensions::StopTimesCsvFallback;
use rodalies::failure::{FailureHistory, FailureTracker, load_failure_threshold};
use rodalies::maintenance::{
    MaintenanceGate, archive_command, fetch_latest_archive_date, refresh_command,
    run_external_task,
};
use rodalies::notify::{WebhookConfig, post_webhook};
use rodalies::parse_time_of_day;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Download GTFS-RT protobuf feeds and load them into PostgreSQL.")]
struct Args {
    /// GTFS-RT protobuf feed URL. Provide once per endpoint.
    #[arg(long = "feed")]
    feeds: Vec<String>,

    /// Seconds to wait for each feed response.
    #[arg(long, default_value_t = 15.0)]
    http_timeout: f64,

    /// PostgreSQL connection string. Defaults to DATABASE_URL env var.
    #[arg(long)]
    database_url: Option<String>,

    /// Optional CSV path with stop_times rows used to derive previous/next
    /// stops when the database lacks static trip timing data.
    #[arg(long)]
    stop_times_csv: Option<String>,

    /// Seconds between polling iterations. If omitted, run once and exit.
    #[arg(long)]
    interval: Option<f64>,

    /// Execute a single polling iteration even if --interval is provided.
    #[arg(long)]
    once: bool,

    /// Fetch feeds and log stats without writing to PostgreSQL.
    #[arg(long)]
    dry_run: bool,

    /// Hours of rail vehicle history to retain before pruning stale records.
    #[arg(long)]
    vehicle_history_hours: Option<f64>,

    /// Enable aligned polling cadence (seconds between aligned polls).
    #[arg(long)]
    align_interval: Option<f64>,

    /// Seconds offset applied to the aligned cadence.
    #[arg(long)]
    align_offset: Option<f64>,

    /// Operating timezone for maintenance gates and daily reports.
    #[arg(long)]
    timezone: Option<String>,

    /// Vehicle-label prefix selecting the rail subset.
    #[arg(long)]
    rail_label_prefix: Option<String>,

    /// Automatically refresh static GTFS dimensions once per day before
    /// polling, after --static-refresh-time local time.
    #[arg(long)]
    auto_refresh_static: bool,

    /// Time-of-day in HH:MM or HH:MM:SS when the static refresh should occur.
    #[arg(long)]
    static_refresh_time: Option<String>,

    /// Optional path to the GTFS static zip passed to the refresh tool.
    #[arg(long)]
    static_zip_path: Option<String>,

    /// Optional download URL passed through to the refresh tool.
    #[arg(long)]
    static_zip_url: Option<String>,

    /// Executable that reloads the dim_* tables.
    #[arg(long)]
    static_refresh_bin: Option<String>,

    /// Automatically archive historical snapshot rows once per day after
    /// --archive-time local time.
    #[arg(long)]
    auto_archive_snapshots: bool,

    /// Time-of-day in HH:MM or HH:MM:SS when the snapshot archive should run.
    #[arg(long)]
    archive_time: Option<String>,

    /// Retention window in days for raw snapshot rows before archiving.
    #[arg(long)]
    archive_retention_days: Option<f64>,

    /// Minimum number of days between automatic archive runs.
    #[arg(long)]
    archive_interval_days: Option<u32>,

    /// Recreate archive blobs even if an entry already exists for the day.
    #[arg(long)]
    archive_force: bool,

    /// Executable that archives and deletes old snapshot rows.
    #[arg(long)]
    archive_bin: Option<String>,
}

#[derive(Debug)]
struct Config {
    cycle: CycleConfig,
    database_url: String,
    stop_times_csv: Option<PathBuf>,
    interval: Option<f64>,
    once: bool,
    align: Option<(f64, f64)>,
    auto_refresh_static: bool,
    static_refresh_time: NaiveTime,
    static_zip_path: Option<PathBuf>,
    static_zip_url: Option<String>,
    static_refresh_bin: String,
    initial_static_refresh: bool,
    auto_archive_snapshots: bool,
    archive_time: NaiveTime,
    archive_retention_days: f64,
    archive_interval_days: u32,
    archive_force: bool,
    archive_bin: String,
    initial_archive_snapshots: bool,
    alert_webhook: WebhookConfig,
    report_webhook: WebhookConfig,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_f64(name: &str) -> Result<Option<f64>, String> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("Invalid {} value: {:?}. Provide a numeric value.", name, raw)),
    }
}

fn env_u32(name: &str) -> Result<Option<u32>, String> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("Invalid {} value: {:?}. Provide a numeric value.", name, raw)),
    }
}

fn env_bool(name: &str) -> bool {
    match env_var(name) {
        Some(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => false,
    }
}

/// Merge env-provided and CLI-provided feed URLs, deduplicated in order.
fn resolve_feeds(cli_feeds: &[String]) -> Vec<String> {
    let mut feeds: Vec<String> = Vec::new();
    if let Some(env_value) = env_var("GTFS_RT_FEEDS") {
        feeds.extend(
            env_value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
    }
    feeds.extend(
        cli_feeds
            .iter()
            .map(|feed| feed.trim().to_string())
            .filter(|feed| !feed.is_empty()),
    );

    let mut seen = std::collections::HashSet::new();
    feeds.retain(|feed| seen.insert(feed.clone()));
    feeds
}

fn resolve_config(args: Args) -> Result<Config, Box<dyn std::error::Error + Sync + Send>> {
    let feeds = resolve_feeds(&args.feeds);
    if feeds.is_empty() {
        return Err(
            "No feeds provided. Use --feed multiple times or set GTFS_RT_FEEDS env var.".into(),
        );
    }

    let database_url = args
        .database_url
        .or_else(|| env_var("DATABASE_URL"))
        .ok_or("Database URL not provided. Use --database-url or set DATABASE_URL env var.")?;

    if args.http_timeout <= 0.0 {
        return Err("HTTP timeout must be greater than zero.".into());
    }

    let interval = match args.interval {
        Some(interval) => Some(interval),
        None => env_f64("POLL_INTERVAL")?,
    };
    if let Some(interval) = interval {
        if interval <= 0.0 {
            return Err("Polling interval must be greater than zero.".into());
        }
    }

    let align_interval = match args.align_interval {
        Some(value) => Some(value),
        None => env_f64("POLL_ALIGN_INTERVAL")?,
    };
    let align_offset = match args.align_offset {
        Some(value) => Some(value),
        None => env_f64("POLL_ALIGN_OFFSET")?,
    };
    let align = match align_interval {
        Some(align_interval) => {
            if align_interval <= 0.0 {
                return Err("POLL_ALIGN_INTERVAL must be greater than zero.".into());
            }
            let offset = align_offset.unwrap_or(0.0).rem_euclid(align_interval);
            log::info!(
                "Poll alignment enabled (interval={}s, offset={}s)",
                align_interval,
                offset
            );
            Some((align_interval, offset))
        }
        None => {
            if align_offset.is_some() {
                log::warn!(
                    "POLL_ALIGN_OFFSET provided without POLL_ALIGN_INTERVAL; ignoring offset value."
                );
            }
            None
        }
    };

    let timezone: Tz = args
        .timezone
        .or_else(|| env_var("POLLER_TZ"))
        .unwrap_or_else(|| "Europe/Madrid".to_string())
        .parse()
        .map_err(|e| format!("Invalid timezone: {}", e))?;

    let rail_label_prefix = args
        .rail_label_prefix
        .or_else(|| env_var("RAIL_LABEL_PREFIX"))
        .unwrap_or_else(|| "R".to_string());

    let vehicle_history_hours = match args.vehicle_history_hours {
        Some(value) => value,
        None => env_f64("VEHICLE_HISTORY_HOURS")?.unwrap_or(24.0),
    };
    if vehicle_history_hours <= 0.0 {
        return Err("Vehicle history hours must be greater than zero.".into());
    }
    let history_retention = chrono::Duration::seconds((vehicle_history_hours * 3600.0) as i64);

    let auto_refresh_static = args.auto_refresh_static || env_bool("AUTO_REFRESH_STATIC");
    let static_refresh_time_str = args
        .static_refresh_time
        .or_else(|| env_var("STATIC_REFRESH_TIME"))
        .unwrap_or_else(|| "10:00".to_string());
    let static_refresh_time = parse_time_of_day(&static_refresh_time_str)
        .map_err(|e| format!("Invalid static refresh time: {}", e))?;
    let static_zip_path = args
        .static_zip_path
        .or_else(|| env_var("STATIC_REFRESH_ZIP_PATH"))
        .map(PathBuf::from);
    let static_zip_url = args.static_zip_url.or_else(|| env_var("STATIC_REFRESH_ZIP_URL"));
    let static_refresh_bin = args
        .static_refresh_bin
        .or_else(|| env_var("STATIC_REFRESH_BIN"))
        .unwrap_or_else(|| "refresh_static_gtfs".to_string());
    let initial_static_refresh = match env_var("INITIAL_STATIC_REFRESH") {
        Some(_) => env_bool("INITIAL_STATIC_REFRESH"),
        None => auto_refresh_static,
    };

    let auto_archive_snapshots = args.auto_archive_snapshots || env_bool("AUTO_ARCHIVE_SNAPSHOTS");
    let archive_time_str = args
        .archive_time
        .or_else(|| env_var("ARCHIVE_TIME"))
        .unwrap_or_else(|| "02:00".to_string());
    let archive_time = parse_time_of_day(&archive_time_str)
        .map_err(|e| format!("Invalid snapshot archive time: {}", e))?;
    let archive_retention_days = match args.archive_retention_days {
        Some(value) => value,
        None => env_f64("ARCHIVE_RETENTION_DAYS")?.unwrap_or(7.0),
    };
    if archive_retention_days <= 0.0 {
        return Err("Archive retention days must be greater than zero.".into());
    }
    let archive_interval_days = match args.archive_interval_days {
        Some(value) => value,
        None => env_u32("ARCHIVE_INTERVAL_DAYS")?.unwrap_or(1),
    };
    if archive_interval_days == 0 {
        return Err("Archive interval days must be greater than zero.".into());
    }
    let archive_force = args.archive_force || env_bool("ARCHIVE_FORCE");
    let archive_bin = args
        .archive_bin
        .or_else(|| env_var("ARCHIVE_BIN"))
        .unwrap_or_else(|| "archive_db_snapshots".to_string());
    let initial_archive_snapshots = match env_var("INITIAL_ARCHIVE_SNAPSHOTS") {
        Some(_) => env_bool("INITIAL_ARCHIVE_SNAPSHOTS"),
        None => auto_archive_snapshots,
    };

    let stop_times_csv = args
        .stop_times_csv
        .or_else(|| env_var("STOP_TIMES_CSV_PATH"))
        .map(PathBuf::from)
        .and_then(|candidate| {
            if candidate.exists() {
                log::info!("Using stop_times CSV fallback at {}", candidate.display());
                Some(candidate)
            } else {
                log::warn!(
                    "stop_times CSV fallback {} does not exist; ignoring fallback option.",
                    candidate.display()
                );
                None
            }
        });

    let alert_webhook = WebhookConfig {
        url: env_var("DISCORD_WEBHOOK_URL"),
        username: env_var("DISCORD_USERNAME"),
        avatar_url: env_var("DISCORD_AVATAR_URL"),
    };
    let report_webhook = WebhookConfig {
        url: env_var("DISCORD_REPORT_WEBHOOK_URL"),
        username: env_var("DISCORD_REPORT_USERNAME"),
        avatar_url: env_var("DISCORD_REPORT_AVATAR_URL"),
    };

    Ok(Config {
        cycle: CycleConfig {
            feeds,
            http_timeout: Duration::from_secs_f64(args.http_timeout),
            dry_run: args.dry_run,
            history_retention,
            rail_label_prefix,
            failure_threshold: load_failure_threshold(),
            timezone,
        },
        database_url,
        stop_times_csv,
        interval,
        once: args.once,
        align,
        auto_refresh_static,
        static_refresh_time,
        static_zip_path,
        static_zip_url,
        static_refresh_bin,
        initial_static_refresh,
        auto_archive_snapshots,
        archive_time,
        archive_retention_days,
        archive_interval_days,
        archive_force,
        archive_bin,
        initial_archive_snapshots,
        alert_webhook,
        report_webhook,
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT; shutting down poller."),
                _ = sigterm.recv() => log::info!("Received SIGTERM; shutting down poller."),
            }
        }
        Err(e) => {
            log::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Received SIGINT; shutting down poller.");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("Received Ctrl-C; shutting down poller.");
}

/// Sleep, but wake immediately on cancellation. Returns true when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &CancelToken) -> bool {
    let mut cancel = cancel.clone();
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Sync + Send>> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = resolve_config(args)?;

    let http = reqwest::Client::new();
    let mut db = Db::connect(&config.database_url).await?;
    ensure_schema(db.client()).await?;

    let mut refresh_gate = MaintenanceGate::new(config.static_refresh_time, 1);
    let mut archive_gate = MaintenanceGate::new(config.archive_time, config.archive_interval_days);
    if config.auto_archive_snapshots && !config.cycle.dry_run {
        archive_gate.last_success = fetch_latest_archive_date(db.client()).await?;
    }

    if config.initial_static_refresh && !config.cycle.dry_run {
        log::info!("Performing startup static GTFS refresh.");
        let task = refresh_command(
            &config.static_refresh_bin,
            &config.database_url,
            config.static_zip_path.as_deref(),
            config.static_zip_url.as_deref(),
        );
        db.close().await;
        if !run_external_task(&task).await {
            return Err("Initial static GTFS refresh failed; aborting poller startup.".into());
        }
        db = Db::connect(&config.database_url).await?;
        ensure_schema(db.client()).await?;
        let now_local = Utc::now().with_timezone(&config.cycle.timezone);
        if now_local.time() >= config.static_refresh_time {
            refresh_gate.record_success(now_local.date_naive());
        }
    }

    if config.auto_archive_snapshots && !config.cycle.dry_run && config.initial_archive_snapshots {
        log::info!("Performing startup snapshot archive run.");
        let task = archive_command(
            &config.archive_bin,
            &config.database_url,
            config.archive_retention_days,
            config.archive_force,
        );
        db.close().await;
        let archive_ok = run_external_task(&task).await;
        db = Db::connect(&config.database_url).await?;
        ensure_schema(db.client()).await?;
        let now_local = Utc::now().with_timezone(&config.cycle.timezone);
        archive_gate.record_attempt(now_local.date_naive());
        if archive_ok && now_local.time() >= config.archive_time {
            archive_gate.record_success(now_local.date_naive());
        }
        if !archive_ok {
            log::error!("Startup snapshot archive failed; continuing with polling loop.");
        }
    }

    let mut failures = FailureTracker::default();
    let mut history = FailureHistory::default();
    let mut report_state = ReportState::starting_today(config.cycle.timezone);
    let mut stop_times_fallback = config
        .stop_times_csv
        .clone()
        .map(StopTimesCsvFallback::new);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
        });
    }

    let interval_value = config.interval.map(|interval| interval.max(1.0));
    if let Some((align_interval, align_offset)) = config.align {
        log::info!(
            "Entering aligned polling loop (interval={}s, offset={}s)",
            align_interval,
            align_offset
        );
    } else if let Some(interval) = interval_value {
        log::info!("Entering polling loop (interval={}s)", interval);
    }

    let mut startup_notified = false;
    let mut first_cycle = true;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Some((align_interval, align_offset)) = config.align {
            let now_epoch = Utc::now().timestamp_millis() as f64 / 1000.0;
            let wait = seconds_until_next_alignment(now_epoch, align_interval, align_offset);
            if wait > 0.0 {
                log::debug!("Sleeping {:.2}s to align next poll window.", wait);
                if sleep_or_cancel(Duration::from_secs_f64(wait), &cancel).await {
                    break;
                }
            }
        } else if !first_cycle {
            match interval_value {
                None => break,
                Some(interval) => {
                    log::debug!("Sleeping {:.2}s before next poll.", interval);
                    if sleep_or_cancel(Duration::from_secs_f64(interval), &cancel).await {
                        break;
                    }
                }
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        if config.auto_refresh_static && !config.cycle.dry_run {
            let now_local = Utc::now().with_timezone(&config.cycle.timezone);
            if refresh_gate.should_run(now_local) {
                log::info!(
                    "Triggering scheduled static GTFS refresh for {}",
                    now_local.date_naive()
                );
                refresh_gate.record_attempt(now_local.date_naive());
                let task = refresh_command(
                    &config.static_refresh_bin,
                    &config.database_url,
                    config.static_zip_path.as_deref(),
                    config.static_zip_url.as_deref(),
                );
                db.close().await;
                if !run_external_task(&task).await {
                    return Err("Static GTFS refresh failed; poller stopping.".into());
                }
                db = Db::connect(&config.database_url).await?;
                ensure_schema(db.client()).await?;
                refresh_gate.record_success(now_local.date_naive());
                // Fresh dimensions invalidate the failure picture too.
                failures.clear();
                history.clear();
                continue;
            }
        }

        if config.auto_archive_snapshots && !config.cycle.dry_run {
            let now_local = Utc::now().with_timezone(&config.cycle.timezone);
            if archive_gate.should_run(now_local) {
                log::info!(
                    "Triggering scheduled snapshot archive for {}",
                    now_local.date_naive()
                );
                archive_gate.record_attempt(now_local.date_naive());
                let task = archive_command(
                    &config.archive_bin,
                    &config.database_url,
                    config.archive_retention_days,
                    config.archive_force,
                );
                db.close().await;
                let archive_ok = run_external_task(&task).await;
                db = Db::connect(&config.database_url).await?;
                ensure_schema(db.client()).await?;
                if archive_ok {
                    archive_gate.record_success(now_local.date_naive());
                } else {
                    log::error!(
                        "Snapshot archive failed for {}; polling will continue without compression.",
                        now_local.date_naive()
                    );
                }
                continue;
            }
        }

        match run_cycle(
            &http,
            db.client_mut(),
            &config.cycle,
            &mut failures,
            &mut history,
            &config.alert_webhook,
            stop_times_fallback.as_mut(),
        )
        .await
        {
            Ok(outcome) => {
                let success = matches!(
                    outcome,
                    CycleOutcome::Stored { .. } | CycleOutcome::DryRun
                );
                if !startup_notified
                    && !config.cycle.dry_run
                    && config.alert_webhook.is_configured()
                    && success
                {
                    let message = if first_cycle {
                        ":white_check_mark: GTFS poller connected\nInitial polling completed successfully."
                    } else {
                        ":white_check_mark: GTFS poller connected\nPolling loop is now storing snapshots."
                    };
                    if post_webhook(&http, &config.alert_webhook, message, "startup connectivity")
                        .await
                    {
                        startup_notified = true;
                    }
                }
            }
            Err(e) => {
                log::error!("Polling cycle failed; will retry on the next schedule: {}", e);
            }
        }

        if let Err(e) = maybe_send_daily_report(
            db.client(),
            &http,
            &mut report_state,
            &mut history,
            &config.report_webhook,
            config.cycle.timezone,
        )
        .await
        {
            log::error!("Failed to compute daily report: {}", e);
        }

        first_cycle = false;

        if config.once || config.cycle.dry_run {
            break;
        }
        if config.align.is_none() && interval_value.is_none() {
            break;
        }
    }

    if !config.cycle.dry_run && config.alert_webhook.is_configured() {
        let _ = post_webhook(
            &http,
            &config.alert_webhook,
            ":stop_sign: GTFS poller halted\nIngestion loop exited.",
            "shutdown",
        )
        .await;
    }
    db.close().await;
    Ok(())
}
