use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::storage::entities::TypingSample;

/// A typing burst closes after this much keyboard silence.
pub const IDLE_TIMEOUT_MS: i64 = 2000;

/// Bursts with this many keystrokes or fewer are discarded on close.
pub const MIN_SESSION_KEYS: u32 = 5;

/// Size of the rolling window of inter-keystroke gaps reported with counter
/// flushes.
const GAP_WINDOW: usize = 10;

struct OpenSession {
    started: DateTime<Utc>,
    last_key: DateTime<Utc>,
    key_count: u32,
}

/// Tracks typing bursts and the rolling inter-keystroke gap window. Only
/// keys the collector accepted count here; the caller decides which keys
/// qualify.
pub struct TypingTracker {
    session: Option<OpenSession>,
    gaps_ms: VecDeque<f64>,
    last_key_at: Option<DateTime<Utc>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self {
            session: None,
            gaps_ms: VecDeque::with_capacity(GAP_WINDOW),
            last_key_at: None,
        }
    }

    pub fn record_key(&mut self, now: DateTime<Utc>) {
        if let Some(previous) = self.last_key_at {
            let gap = (now - previous).num_milliseconds() as f64;
            if self.gaps_ms.len() == GAP_WINDOW {
                self.gaps_ms.pop_front();
            }
            self.gaps_ms.push_back(gap);
        }
        self.last_key_at = Some(now);

        match self.session.as_mut() {
            Some(session) => {
                session.key_count += 1;
                session.last_key = now;
            }
            None => {
                self.session = Some(OpenSession {
                    started: now,
                    last_key: now,
                    key_count: 1,
                });
            }
        }
    }

    /// Wall-clock moment the open burst will time out, if one is open.
    pub fn idle_deadline(&self) -> Option<DateTime<Utc>> {
        self.session
            .as_ref()
            .map(|s| s.last_key + Duration::milliseconds(IDLE_TIMEOUT_MS))
    }

    /// Closes the open burst. Produces a sample only when the burst had more
    /// than [MIN_SESSION_KEYS] keystrokes; the burst state is cleared either
    /// way.
    pub fn close(&mut self) -> Option<TypingSample> {
        let session = self.session.take()?;
        if session.key_count <= MIN_SESSION_KEYS {
            return None;
        }

        let duration_seconds = (session.last_key - session.started).num_milliseconds() as f64 / 1000.0;
        let wpm = if duration_seconds > 0.0 {
            let words = session.key_count as f64 / 5.0;
            (words / (duration_seconds / 60.0)).round() as u32
        } else {
            0
        };

        Some(TypingSample {
            wpm,
            duration_seconds,
            key_count: session.key_count,
            timestamp: session.last_key,
        })
    }

    /// Mean of the rolling gap window in milliseconds, zero when no gaps
    /// have been observed yet.
    pub fn average_gap_ms(&self) -> f64 {
        if self.gaps_ms.is_empty() {
            return 0.0;
        }
        self.gaps_ms.iter().sum::<f64>() / self.gaps_ms.len() as f64
    }
}
