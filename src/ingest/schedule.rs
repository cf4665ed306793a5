//! Cadence bookkeeping owned by the coordinating loop.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

/// Cycle count at which the timetable wrap window restarts, unless configured.
pub const DEFAULT_TIMETABLE_EVERY: u32 = 3600;

/// When the expensive timetable archive is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimetablePolicy {
    /// On the first cycle of every window of `n` cycles (0, n, 2n, ...).
    EveryCycles(u32),
    /// Once per UTC calendar day per mode; retried every cycle until it succeeds.
    Daily,
}

impl Default for TimetablePolicy {
    fn default() -> Self {
        TimetablePolicy::EveryCycles(DEFAULT_TIMETABLE_EVERY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_tick_at: DateTime<Utc>,
    /// Position inside the timetable wrap window.
    pub cycle_count: u32,
    /// Cycles started since launch; never wraps.
    pub cycles_run: u64,
    timetables_published: HashMap<String, NaiveDate>,
}

impl ScheduleState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            next_tick_at: now,
            cycle_count: 0,
            cycles_run: 0,
            timetables_published: HashMap::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_tick_at
    }

    /// Time left until the next tick, zero when already due.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.next_tick_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn timetable_due(&self, policy: TimetablePolicy, mode_key: &str, now: DateTime<Utc>) -> bool {
        match policy {
            TimetablePolicy::EveryCycles(_) => self.cycle_count == 0,
            TimetablePolicy::Daily => {
                self.timetables_published.get(mode_key) != Some(&now.date_naive())
            }
        }
    }

    pub fn record_timetable(&mut self, mode_key: &str, at: DateTime<Utc>) {
        self.timetables_published
            .insert(mode_key.to_string(), at.date_naive());
    }

    /// Idle -> Waiting: schedule relative to the start of the cycle just run.
    pub fn advance(&mut self, loop_start: DateTime<Utc>, interval: Duration, policy: TimetablePolicy) {
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        self.next_tick_at = loop_start
            .checked_add_signed(interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.cycle_count = match policy {
            TimetablePolicy::EveryCycles(wrap) => (self.cycle_count + 1) % wrap.max(1),
            TimetablePolicy::Daily => self.cycle_count.wrapping_add(1),
        };
        self.cycles_run += 1;
    }
}
