// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
pub struct FeedFailureState {
    pub count: u32,
    pub alert_sent: bool,
}

/// Consecutive fetch failures per feed URL, with a one-shot alert flag so a
/// long outage produces exactly one notification per streak.
#[derive(Debug, Default)]
pub struct FailureTracker {
    states: HashMap<String, FeedFailureState>,
}

impl FailureTracker {
    /// Record one failure and return the new consecutive count.
    pub fn record_failure(&mut self, url: &str) -> u32 {
        let state = self.states.entry(url.to_string()).or_default();
        state.count += 1;
        state.count
    }

    /// A success ends the streak and re-arms the alert.
    pub fn record_success(&mut self, url: &str) {
        if let Some(state) = self.states.get_mut(url) {
            state.count = 0;
            state.alert_sent = false;
        }
    }

    /// True exactly once per streak, when the count reaches the threshold.
    /// A zero threshold disables alerting.
    pub fn should_alert(&mut self, url: &str, threshold: u32) -> bool {
        if threshold == 0 {
            return false;
        }
        let state = self.states.entry(url.to_string()).or_default();
        if state.count >= threshold && !state.alert_sent {
            state.alert_sent = true;
            return true;
        }
        false
    }

    pub fn count(&self, url: &str) -> u32 {
        self.states.get(url).map(|state| state.count).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

/// Failure timestamps by local calendar day, feeding the daily report.
/// Times are "HH:MM" strings in the operating timezone; a set per feed keeps
/// repeated failures within the same minute from inflating the report.
#[derive(Debug, Default)]
pub struct FailureHistory {
    days: HashMap<NaiveDate, BTreeMap<String, BTreeSet<String>>>,
}

impl FailureHistory {
    pub fn record(&mut self, date: NaiveDate, url: &str, time_hhmm: String) {
        self.days
            .entry(date)
            .or_default()
            .entry(url.to_string())
            .or_default()
            .insert(time_hhmm);
    }

    pub fn day(&self, date: NaiveDate) -> Option<&BTreeMap<String, BTreeSet<String>>> {
        self.days.get(&date)
    }

    pub fn remove_day(&mut self, date: NaiveDate) {
        self.days.remove(&date);
    }

    pub fn clear(&mut self) {
        self.days.clear();
    }
}

/// Alert threshold from the environment, defaulting to 5 consecutive
/// failures. Negative values clamp to 0 (alerts disabled); unparseable
/// values fall back to the default.
pub fn load_failure_threshold() -> u32 {
    match std::env::var("FAILURE_ALERT_THRESHOLD") {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(value) => value.max(0) as u32,
            Err(_) => 5,
        },
        Err(_) => 5,
    }
}
