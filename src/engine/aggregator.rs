use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::{
    clock::{instant_at, Clock},
    domain::extract_domain,
    time::{hour_of_day, local_date_string, next_midnight},
};

use super::{
    budget::{
        decide_presentation, excess_seconds, find_budget, classify, EnforcementAction,
        Presentation,
    },
    storage::{
        entities::{BudgetKind, CounterBatch, DailyStats, InteractionCounters, SessionSnapshot},
        store::BehaviorStore,
    },
    telemetry::{Answer, Backend, TabActivity, UsageReport, DEFAULT_QUESTION},
};

/// Sessions shorter than this are dropped as noise.
pub const MIN_SESSION_SECONDS: u64 = 5;

/// Cadence at which the active session is closed and reopened so time keeps
/// accruing while a tab stays focused.
pub const ROLLOVER_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the process-wide session snapshot refresh.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the full behavior-map upload to the backend.
pub const UPLOAD_INTERVAL: Duration = Duration::from_secs(3600);

/// Tab-level events consumed by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    TabSwitched,
    NavigationCompleted { url: String, title: String },
    FocusLost,
    Counters(CounterBatch),
    QuestionAnswered { answer: Answer, domain: String },
}

/// Receives enforcement decisions. Rendering them is out of scope; the
/// shipped implementation only logs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, action: EnforcementAction);
}

pub struct LogPresenter;

#[async_trait]
impl Presenter for LogPresenter {
    async fn present(&self, action: EnforcementAction) {
        match &action {
            EnforcementAction::Floating { domain, question } => {
                info!("Limit exceeded on {domain}, floating notification: {question}")
            }
            EnforcementAction::Blocking { domain, question } => {
                info!("Limit exceeded on {domain}, blocking overlay: {question}")
            }
        }
    }
}

struct ActiveTab {
    url: String,
    domain: String,
    started: DateTime<Utc>,
}

/// Owns the durable per-domain history, the daily rollup and budget
/// enforcement decisions.
pub struct SessionAggregator<S: BehaviorStore, B: Backend, P: Presenter> {
    receiver: mpsc::Receiver<AggregatorEvent>,
    store: S,
    backend: B,
    presenter: P,
    shutdown: CancellationToken,
    clock: Box<dyn Clock>,
    /// Fixed at startup; snapshots measure against this.
    session_start: DateTime<Utc>,
    tab_switch_count: u64,
    active: Option<ActiveTab>,
    /// Counters flushed from the collector, attached to the next usage
    /// report.
    pending_interactions: InteractionCounters,
}

impl<S: BehaviorStore, B: Backend, P: Presenter> SessionAggregator<S, B, P> {
    pub fn new(
        receiver: mpsc::Receiver<AggregatorEvent>,
        store: S,
        backend: B,
        presenter: P,
        shutdown: CancellationToken,
        clock: Box<dyn Clock>,
    ) -> Self {
        let session_start = clock.time();
        Self {
            receiver,
            store,
            backend,
            presenter,
            shutdown,
            clock,
            session_start,
            tab_switch_count: 0,
            active: None,
            pending_interactions: InteractionCounters::default(),
        }
    }

    /// Executes the aggregator event loop.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.reset_daily_if_needed().await {
            warn!("Daily reset at startup failed: {e:?}");
        }

        let mut rollover_at = self.clock.instant() + ROLLOVER_INTERVAL;
        let mut snapshot_at = self.clock.instant() + SNAPSHOT_INTERVAL;
        let mut upload_at = self.clock.instant() + UPLOAD_INTERVAL;
        let mut daily_at = self.next_daily_deadline();

        loop {
            tokio::select! {
                event = self.receiver.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = self.shutdown.cancelled() => break,
                _ = self.clock.sleep_until(rollover_at) => {
                    self.rollover_active().await;
                    rollover_at += ROLLOVER_INTERVAL;
                }
                _ = self.clock.sleep_until(snapshot_at) => {
                    self.write_snapshot().await;
                    snapshot_at += SNAPSHOT_INTERVAL;
                }
                _ = self.clock.sleep_until(upload_at) => {
                    self.upload_behavior().await;
                    upload_at += UPLOAD_INTERVAL;
                }
                _ = self.clock.sleep_until(daily_at) => {
                    if let Err(e) = self.reset_daily_if_needed().await {
                        warn!("Scheduled daily reset failed: {e:?}");
                    }
                    daily_at = self.next_daily_deadline();
                }
            }
        }

        // Close out whatever was active when the engine stops.
        self.close_active().await;
        Ok(())
    }

    fn next_daily_deadline(&self) -> tokio::time::Instant {
        let local_now = self.clock.time().with_timezone(&Local);
        let midnight = next_midnight(local_now).with_timezone(&Utc);
        instant_at(self.clock.as_ref(), midnight)
    }

    async fn handle_event(&mut self, event: AggregatorEvent) {
        debug!("Aggregator event {:?}", event);
        match event {
            AggregatorEvent::TabSwitched => {
                self.tab_switch_count += 1;
                self.write_snapshot().await;
                self.close_active().await;
            }
            AggregatorEvent::NavigationCompleted { url, title } => {
                self.close_active().await;
                self.open_tab(url, title).await;
            }
            AggregatorEvent::FocusLost => self.close_active().await,
            AggregatorEvent::Counters(batch) => {
                self.pending_interactions.merge(&batch.counters);
            }
            AggregatorEvent::QuestionAnswered { answer, domain } => {
                self.record_answer(answer, domain).await;
            }
        }
    }

    /// Starts tracking a freshly navigated tab: visit count, tab-activity
    /// telemetry, then a level-triggered budget check.
    async fn open_tab(&mut self, url: String, title: String) {
        let now = self.clock.time();
        let domain = extract_domain(&url);

        self.record_visit(domain.clone()).await;

        let activity = TabActivity {
            url: url.clone(),
            title,
            timestamp: now,
            time_of_day: hour_of_day(now),
        };
        if let Err(e) = self.backend.tab_activity(activity).await {
            debug!("Dropping tab activity report: {e}");
        }

        self.active = Some(ActiveTab {
            url,
            domain: domain.clone(),
            started: now,
        });

        self.evaluate_budget(&domain).await;
    }

    async fn record_visit(&mut self, domain: String) {
        let outcome = self
            .store
            .update(Box::new(move |data| {
                *data.visit_frequency.entry(domain).or_default() += 1;
            }))
            .await;
        if let Err(e) = outcome {
            warn!("Abandoning visit count update: {e:?}");
        }
    }

    async fn close_active(&mut self) {
        let Some(tab) = self.active.take() else {
            self.pending_interactions = InteractionCounters::default();
            return;
        };
        let now = self.clock.time();
        let duration = (now - tab.started).num_seconds().max(0) as u64;
        self.close_session(tab.url, tab.domain, duration).await;
    }

    /// Closes the active session without dropping the tab, so long stays on
    /// one page keep accruing in 30 second slices.
    async fn rollover_active(&mut self) {
        let paused = match self.store.load().await {
            Ok(data) => data.tracking_paused,
            Err(e) => {
                warn!("Skipping rollover, store unavailable: {e:?}");
                return;
            }
        };
        if paused {
            return;
        }
        let now = self.clock.time();
        let Some(tab) = self.active.as_mut() else {
            return;
        };
        let duration = (now - tab.started).num_seconds().max(0) as u64;
        tab.started = now;
        let (url, domain) = (tab.url.clone(), tab.domain.clone());
        self.close_session(url, domain, duration).await;
    }

    /// Rolls a finished session into the daily stats and per-domain time
    /// map. Sessions under [MIN_SESSION_SECONDS] are dropped entirely.
    async fn close_session(&mut self, url: String, domain: String, duration_seconds: u64) {
        // Pending counters belong to the session being closed. Taking them
        // before the noise check keeps a discarded stay from leaking its
        // counters into the next domain's report.
        let interactions = self.pending_interactions.take();
        if duration_seconds < MIN_SESSION_SECONDS {
            return;
        }
        let now = self.clock.time();
        let update_domain = domain.clone();

        let outcome = self
            .store
            .update(Box::new(move |data| {
                data.today_stats.active_time_seconds += duration_seconds;
                match classify(
                    &update_domain,
                    &data.distraction_urls,
                    &data.productive_urls,
                ) {
                    Some(BudgetKind::Distraction) => {
                        data.today_stats.distraction_time_seconds += duration_seconds
                    }
                    Some(BudgetKind::Productive) => {
                        data.today_stats.productive_time_seconds += duration_seconds
                    }
                    None => {}
                }
                *data.url_time_spent.entry(update_domain).or_default() += duration_seconds;
            }))
            .await;

        let data = match outcome {
            Ok(data) => data,
            Err(e) => {
                warn!("Abandoning session close for {domain}: {e:?}");
                return;
            }
        };

        let kind = classify(&domain, &data.distraction_urls, &data.productive_urls);
        let report = UsageReport {
            url,
            domain,
            duration: duration_seconds,
            interactions,
            timestamp: now,
            is_distraction: kind == Some(BudgetKind::Distraction),
            is_productive: kind == Some(BudgetKind::Productive),
        };
        if let Err(e) = self.backend.usage_data(report).await {
            debug!("Dropping usage report: {e}");
        }
    }

    /// Level-triggered limit check, run after every navigation. Repeated
    /// visits past the limit re-trigger the presentation each time.
    async fn evaluate_budget(&mut self, domain: &str) {
        let data = match self.store.load().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping budget check for {domain}: {e:?}");
                return;
            }
        };
        let Some(budget) = find_budget(domain, &data.distraction_urls) else {
            return;
        };
        let time_spent = data.url_time_spent.get(domain).copied().unwrap_or(0);
        let Some(excess) = excess_seconds(time_spent, budget.limit_seconds) else {
            return;
        };

        let question = match self.backend.get_question(domain.to_owned(), excess).await {
            Ok(question) => question,
            Err(e) => {
                warn!("Question fetch failed, using fallback: {e}");
                DEFAULT_QUESTION.to_owned()
            }
        };

        let action = match decide_presentation(excess, data.strict_mode, data.notifications_enabled)
        {
            Some(Presentation::Blocking) => EnforcementAction::Blocking {
                domain: domain.to_owned(),
                question,
            },
            Some(Presentation::Floating) => EnforcementAction::Floating {
                domain: domain.to_owned(),
                question,
            },
            None => return,
        };
        self.presenter.present(action).await;
    }

    /// Zeroes the daily rollup on the first call of each calendar day.
    async fn reset_daily_if_needed(&mut self) -> Result<()> {
        let today = local_date_string(self.clock.time().with_timezone(&Local));
        self.store
            .update(Box::new(move |data| {
                if data.last_reset_date.as_deref() != Some(today.as_str()) {
                    data.today_stats = DailyStats::default();
                    data.url_time_spent.clear();
                    data.last_reset_date = Some(today);
                }
            }))
            .await?;
        Ok(())
    }

    /// Overwrites the single process-wide snapshot record.
    async fn write_snapshot(&mut self) {
        let now = self.clock.time();
        let snapshot = SessionSnapshot {
            session_time_seconds: (now - self.session_start).num_seconds(),
            tab_switch_count: self.tab_switch_count,
            timestamp: now,
        };
        let outcome = self
            .store
            .update(Box::new(move |data| data.session_data = Some(snapshot)))
            .await;
        if let Err(e) = outcome {
            warn!("Abandoning session snapshot: {e:?}");
        }
    }

    /// Ships the whole per-domain behavior map to the backend.
    async fn upload_behavior(&mut self) {
        let data = match self.store.load().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping behavior upload, store unavailable: {e:?}");
                return;
            }
        };
        if data.behavior_data.is_empty() {
            return;
        }
        let now = self.clock.time();
        if let Err(e) = self.backend.upload_behavior(data.behavior_data, now).await {
            debug!("Dropping behavior upload: {e}");
        }
    }

    async fn record_answer(&mut self, answer: Answer, domain: String) {
        let now = self.clock.time();
        let outcome = match self.backend.question_answer(answer, domain, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Dropping challenge answer: {e}");
                return;
            }
        };
        let result = self
            .store
            .update(Box::new(move |data| {
                if let Some(points) = outcome.reward_points {
                    data.reward_points += points;
                }
                if let Some(limits) = outcome.updated_limits {
                    data.distraction_urls = limits;
                }
            }))
            .await;
        if let Err(e) = result {
            warn!("Abandoning answer outcome: {e:?}");
        }
    }
}
