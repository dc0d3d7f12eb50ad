use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

/// The canonical date string stored under `lastResetDate`. Daily reset fires
/// whenever the current local date no longer matches it.
pub fn local_date_string<Tz: TimeZone>(now: DateTime<Tz>) -> String {
    now.date_naive().format("%Y-%m-%d").to_string()
}

/// Returns the next local midnight after `now`, used to schedule the daily
/// stats reset. Timezones where midnight does not exist on a DST boundary
/// fall back to the same wall-clock time next day.
pub fn next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Tz> {
    let tomorrow = now + Duration::days(1);
    tomorrow
        .clone()
        .with_time(NaiveTime::MIN)
        .earliest()
        .unwrap_or(tomorrow)
}

/// Hour-of-day bucket reported to the backend with tab activity.
pub fn hour_of_day(now: DateTime<Utc>) -> u32 {
    use chrono::Timelike;
    now.hour()
}
