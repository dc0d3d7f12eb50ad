use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A session record older than this is considered stale for display purposes.
/// The stored record itself is kept.
pub const STALE_AFTER_SECONDS: i64 = 30;

/// Raw interaction counts for one page. Two instances exist at runtime: the
/// cumulative copy inside [PageSession] and the outbox copy that is zeroed
/// after every flush to the aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InteractionCounters {
    pub clicks: u32,
    pub keystrokes: u32,
    pub mouse_movements: u32,
    pub scrolls: u32,
}

impl InteractionCounters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, other: &InteractionCounters) {
        self.clicks += other.clicks;
        self.keystrokes += other.keystrokes;
        self.mouse_movements += other.mouse_movements;
        self.scrolls += other.scrolls;
    }

    /// Returns the current counts and resets them to zero.
    pub fn take(&mut self) -> InteractionCounters {
        std::mem::take(self)
    }
}

/// A closed typing burst that passed the minimum-keystroke threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSample {
    pub wpm: u32,
    pub duration_seconds: f64,
    pub key_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// The record of interaction counters for one page load. Identity is the
/// (domain, pageLoadTime) pair; saving twice with the same identity
/// overwrites the previous entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSession {
    pub url: String,
    pub domain: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub page_load_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub counters: InteractionCounters,
    pub typing_samples: Vec<TypingSample>,
    pub session_duration_ms: i64,
    pub time_of_day: DateTime<Utc>,
}

impl PageSession {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_updated).num_seconds() > STALE_AFTER_SECONDS
    }

    /// Counters as a consumer should display them: zero once the record has
    /// gone stale, actual values otherwise.
    pub fn display_counters(&self, now: DateTime<Utc>) -> InteractionCounters {
        if self.is_stale(now) {
            InteractionCounters::default()
        } else {
            self.counters
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Distraction,
    Productive,
}

/// A user-configured time limit associated with a site. The partition key is
/// derived from the stored URL, not stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainBudget {
    pub url: String,
    pub limit_seconds: u64,
}

impl DomainBudget {
    pub fn domain(&self) -> String {
        crate::utils::domain::extract_domain(&self.url)
    }
}

/// Daily rollup, reset once per calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyStats {
    pub active_time_seconds: u64,
    pub distraction_time_seconds: u64,
    pub productive_time_seconds: u64,
}

/// Process-wide session snapshot, overwritten in place rather than logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_time_seconds: i64,
    pub tab_switch_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Counters flushed from the collector to the aggregator every export tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterBatch {
    pub url: String,
    pub domain: String,
    pub counters: InteractionCounters,
    /// Mean of the last inter-keystroke gaps, in milliseconds.
    pub avg_typing_interval_ms: f64,
    pub timestamp: DateTime<Utc>,
}
