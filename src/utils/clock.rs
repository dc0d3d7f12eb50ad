use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of time for the whole application. Every timer and timestamp goes
/// through this trait so tests can run against warped tokio time instead of
/// real wall clocks.
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    fn time(&self) -> DateTime<Utc>;

    fn instant(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, instant: Instant);
}

pub struct DefaultClock;

#[async_trait]
impl Clock for DefaultClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, instant: Instant) {
        tokio::time::sleep_until(instant).await;
    }
}

/// Maps a wall-clock deadline onto the tokio instant space of `clock`.
/// Deadlines in the past resolve to "now".
pub fn instant_at(clock: &dyn Clock, deadline: DateTime<Utc>) -> Instant {
    let delta = (deadline - clock.time()).to_std().unwrap_or(Duration::ZERO);
    clock.instant() + delta
}

#[cfg(test)]
pub mod test_support {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::time::Instant;

    use super::Clock;

    /// Clock whose wall time is advanced by hand. Instants pass through to
    /// tokio, so paused-runtime tests keep working.
    #[derive(Clone)]
    pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        pub fn at(ms: i64) -> Self {
            Self(Arc::new(Mutex::new(Utc.timestamp_millis_opt(ms).unwrap())))
        }

        pub fn advance_ms(&self, ms: i64) {
            let mut guard = self.0.lock().unwrap();
            *guard += chrono::Duration::milliseconds(ms);
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn time(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        async fn sleep_until(&self, instant: Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }
}
