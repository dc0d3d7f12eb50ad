use chrono::Utc;

use crate::engine::storage::{entities::DomainBudget, store::StoreData};

pub fn format_seconds(total: u64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Renders today's rollup plus the most-used domains to stdout.
pub fn print_stats(data: &StoreData) {
    println!("Today");
    println!("  active      {}", format_seconds(data.today_stats.active_time_seconds));
    println!(
        "  distracting {}",
        format_seconds(data.today_stats.distraction_time_seconds)
    );
    println!(
        "  productive  {}",
        format_seconds(data.today_stats.productive_time_seconds)
    );
    println!("  reward points {}", data.reward_points);

    if let Some(snapshot) = &data.session_data {
        println!(
            "  session {} with {} tab switches",
            format_seconds(snapshot.session_time_seconds.max(0) as u64),
            snapshot.tab_switch_count
        );
    }

    let mut by_time: Vec<_> = data.url_time_spent.iter().collect();
    by_time.sort_by(|a, b| b.1.cmp(a.1));
    if !by_time.is_empty() {
        println!("Top domains");
        for (domain, seconds) in by_time.into_iter().take(10) {
            let visits = data.visit_frequency.get(domain).copied().unwrap_or(0);
            println!(
                "  {domain:<30} {:>10}  ({visits} visits)",
                format_seconds(*seconds)
            );
        }
    }

    let now = Utc::now();
    let fresh_pages = data
        .behavior_data
        .values()
        .flatten()
        .filter(|session| !session.is_stale(now))
        .count();
    if fresh_pages > 0 {
        println!("{fresh_pages} page session(s) updated in the last 30s");
    }
}

pub fn print_budgets(label: &str, budgets: &[DomainBudget]) {
    if budgets.is_empty() {
        println!("{label}: none");
        return;
    }
    println!("{label}:");
    for budget in budgets {
        println!(
            "  {:<30} limit {}",
            budget.domain(),
            format_seconds(budget.limit_seconds)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::format_seconds;

    #[test]
    fn formats_compact_durations() {
        assert_eq!(format_seconds(59), "59s");
        assert_eq!(format_seconds(61), "1m 1s");
        assert_eq!(format_seconds(3723), "1h 2m 3s");
    }
}
