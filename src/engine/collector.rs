use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::utils::{
    clock::{instant_at, Clock},
    domain::extract_domain,
};

use super::{
    aggregator::AggregatorEvent,
    events::PageEvent,
    storage::{
        entities::{CounterBatch, InteractionCounters, PageSession, TypingSample},
        store::{upsert_session, BehaviorStore},
    },
    typing::TypingTracker,
};

/// Unconditional page-session save cadence. Keeps lastUpdated fresh even
/// without new events.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Counter flush cadence towards the aggregator.
pub const EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Accepted mousemove and scroll events are rate limited to one per this
/// many milliseconds of wall-clock time.
pub const POINTER_THROTTLE_MS: i64 = 100;

/// In-memory state for the page currently loaded in the active tab.
struct PageContext {
    url: String,
    domain: String,
    page_load_time: DateTime<Utc>,
    time_of_day: DateTime<Utc>,
    counters: InteractionCounters,
    typing_samples: Vec<TypingSample>,
}

impl PageContext {
    fn new(url: String, now: DateTime<Utc>) -> Self {
        Self {
            domain: extract_domain(&url),
            url,
            page_load_time: now,
            time_of_day: now,
            counters: InteractionCounters::default(),
            typing_samples: Vec::new(),
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> PageSession {
        PageSession {
            url: self.url.clone(),
            domain: self.domain.clone(),
            page_load_time: self.page_load_time,
            last_updated: now,
            counters: self.counters,
            typing_samples: self.typing_samples.clone(),
            session_duration_ms: (now - self.page_load_time).num_milliseconds(),
            time_of_day: self.time_of_day,
        }
    }
}

/// Turns raw page events into counters, typing samples and persisted page
/// sessions, and flushes counter batches to the aggregator.
pub struct EventCollector<S: BehaviorStore> {
    events: mpsc::Receiver<PageEvent>,
    aggregator: mpsc::Sender<AggregatorEvent>,
    store: S,
    shutdown: CancellationToken,
    clock: Box<dyn Clock>,
    page: Option<PageContext>,
    /// Counters reset after every flush to the aggregator, unlike the
    /// cumulative copy inside the page context.
    outbox: InteractionCounters,
    typing: TypingTracker,
    last_mouse_move: Option<DateTime<Utc>>,
    last_scroll: Option<DateTime<Utc>>,
    dead: bool,
}

impl<S: BehaviorStore> EventCollector<S> {
    pub fn new(
        events: mpsc::Receiver<PageEvent>,
        aggregator: mpsc::Sender<AggregatorEvent>,
        store: S,
        shutdown: CancellationToken,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            events,
            aggregator,
            store,
            shutdown,
            clock,
            page: None,
            outbox: InteractionCounters::default(),
            typing: TypingTracker::new(),
            last_mouse_move: None,
            last_scroll: None,
            dead: false,
        }
    }

    /// Executes the collector event loop.
    pub async fn run(mut self) -> Result<()> {
        let mut save_at = self.clock.instant() + SAVE_INTERVAL;
        let mut export_at = self.clock.instant() + EXPORT_INTERVAL;

        loop {
            if self.dead {
                return Ok(());
            }
            let typing_deadline = self.typing.idle_deadline();

            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = self.shutdown.cancelled() => break,
                _ = self.clock.sleep_until(save_at) => {
                    self.save_page().await;
                    save_at += SAVE_INTERVAL;
                }
                _ = self.clock.sleep_until(export_at) => {
                    self.export_counters().await;
                    export_at += EXPORT_INTERVAL;
                }
                _ = idle_expiry(self.clock.as_ref(), typing_deadline) => {
                    self.close_typing_burst().await;
                }
            }
        }

        // Best-effort final save, the in-process equivalent of beforeunload.
        self.save_page().await;
        Ok(())
    }

    async fn handle_event(&mut self, event: PageEvent) {
        let now = self.clock.time();
        debug!("Collector event {:?}", event);
        match event {
            PageEvent::Loaded { url } => self.switch_page(url, now).await,
            PageEvent::Click => {
                self.bump(|c| c.clicks += 1);
                self.save_page().await;
            }
            PageEvent::Scroll => {
                if accepts_after(self.last_scroll, now) {
                    self.last_scroll = Some(now);
                    self.bump(|c| c.scrolls += 1);
                    self.save_page().await;
                }
            }
            PageEvent::MouseMove => {
                if accepts_after(self.last_mouse_move, now) {
                    self.last_mouse_move = Some(now);
                    self.bump(|c| c.mouse_movements += 1);
                    self.save_page().await;
                }
            }
            PageEvent::KeyDown { key } => {
                if counts_as_keystroke(&key) {
                    self.typing.record_key(now);
                    self.bump(|c| c.keystrokes += 1);
                    self.save_page().await;
                }
            }
            PageEvent::VisibilityChanged { hidden } => {
                if hidden {
                    self.save_page().await;
                } else if let Some(page) = self.page.as_mut() {
                    page.time_of_day = now;
                }
            }
            PageEvent::BeforeUnload => self.save_page().await,
        }
    }

    /// Closes out the previous page and opens a fresh session for the new
    /// page load.
    async fn switch_page(&mut self, url: String, now: DateTime<Utc>) {
        if self.page.is_some() {
            self.close_typing_burst().await;
            self.save_page().await;
            self.export_counters().await;
        }
        self.typing = TypingTracker::new();
        self.last_mouse_move = None;
        self.last_scroll = None;
        self.page = Some(PageContext::new(url, now));
        self.save_page().await;
    }

    fn bump(&mut self, apply: impl Fn(&mut InteractionCounters)) {
        if let Some(page) = self.page.as_mut() {
            apply(&mut page.counters);
        }
        apply(&mut self.outbox);
    }

    async fn close_typing_burst(&mut self) {
        let Some(sample) = self.typing.close() else {
            return;
        };
        if let Some(page) = self.page.as_mut() {
            page.typing_samples.push(sample);
        }
        self.save_page().await;
    }

    /// Overwrites the persisted session for the current page load. Storage
    /// failures are swallowed and tear the collector down instead of
    /// propagating.
    async fn save_page(&mut self) {
        let Some(page) = &self.page else {
            return;
        };
        let now = self.clock.time();
        let session = page.snapshot(now);
        let domain = session.domain.clone();

        let outcome = self
            .store
            .update(Box::new(move |data| {
                upsert_session(data.behavior_data.entry(domain).or_default(), session);
            }))
            .await;

        if let Err(e) = outcome {
            self.mark_dead(&format!("store write failed: {e:?}"));
        }
    }

    /// Flushes non-empty counters plus the average typing interval to the
    /// aggregator and resets them.
    async fn export_counters(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let Some(page) = &self.page else {
            self.outbox = InteractionCounters::default();
            return;
        };
        let batch = CounterBatch {
            url: page.url.clone(),
            domain: page.domain.clone(),
            counters: self.outbox.take(),
            avg_typing_interval_ms: self.typing.average_gap_ms(),
            timestamp: self.clock.time(),
        };
        if self
            .aggregator
            .send(AggregatorEvent::Counters(batch))
            .await
            .is_err()
        {
            self.mark_dead("aggregator channel closed");
        }
    }

    /// One-shot idempotent teardown after the hosting context went away.
    fn mark_dead(&mut self, reason: &str) {
        if self.dead {
            return;
        }
        self.dead = true;
        if self.shutdown.is_cancelled() {
            debug!("Collector stopping during shutdown: {reason}");
        } else {
            warn!("Collector lost its host, stopping: {reason}");
        }
    }
}

/// Wall-clock throttle shared by mousemove and scroll acceptance.
fn accepts_after(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    previous.map_or(true, |last| {
        (now - last).num_milliseconds() > POINTER_THROTTLE_MS
    })
}

/// Only printable single characters, Backspace and Delete count as
/// keystrokes.
fn counts_as_keystroke(key: &str) -> bool {
    key.chars().count() == 1 || key == "Backspace" || key == "Delete"
}

async fn idle_expiry(clock: &dyn Clock, deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => clock.sleep_until(instant_at(clock, deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::engine::aggregator::AggregatorEvent;
    use crate::engine::events::PageEvent;
    use crate::engine::storage::store::{BehaviorStore, JsonStore, StoreData, UpdateFn};
    use crate::utils::clock::test_support::ManualClock;

    use super::{counts_as_keystroke, EventCollector};

    struct FailingStore;

    #[async_trait]
    impl BehaviorStore for FailingStore {
        async fn load(&self) -> Result<StoreData> {
            Err(anyhow!("context invalidated"))
        }

        async fn update(&self, _apply: UpdateFn) -> Result<StoreData> {
            Err(anyhow!("context invalidated"))
        }

        async fn clear(&self) -> Result<()> {
            Err(anyhow!("context invalidated"))
        }
    }

    fn collector_with<S: BehaviorStore>(
        store: S,
        clock: ManualClock,
    ) -> (
        EventCollector<S>,
        mpsc::Sender<PageEvent>,
        mpsc::Receiver<AggregatorEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (agg_tx, agg_rx) = mpsc::channel(16);
        let collector = EventCollector::new(
            event_rx,
            agg_tx,
            store,
            CancellationToken::new(),
            Box::new(clock),
        );
        (collector, event_tx, agg_rx)
    }

    #[test]
    fn keystroke_filter_accepts_printable_backspace_delete() {
        assert!(counts_as_keystroke("a"));
        assert!(counts_as_keystroke("ß"));
        assert!(counts_as_keystroke("Backspace"));
        assert!(counts_as_keystroke("Delete"));
        assert!(!counts_as_keystroke("Shift"));
        assert!(!counts_as_keystroke("ArrowLeft"));
    }

    #[tokio::test]
    async fn mousemove_is_throttled_to_one_per_window() -> Result<()> {
        let dir = tempdir()?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) =
            collector_with(JsonStore::new(dir.path().to_owned())?, clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;

        collector.handle_event(PageEvent::MouseMove).await;
        clock.advance_ms(50);
        collector.handle_event(PageEvent::MouseMove).await;
        clock.advance_ms(60);
        collector.handle_event(PageEvent::MouseMove).await;

        let page = collector.page.as_ref().unwrap();
        assert_eq!(page.counters.mouse_movements, 2);
        assert_eq!(collector.outbox.mouse_movements, 2);
        Ok(())
    }

    #[tokio::test]
    async fn scroll_is_suppressed_within_the_throttle_window() -> Result<()> {
        let dir = tempdir()?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) =
            collector_with(JsonStore::new(dir.path().to_owned())?, clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;

        for _ in 0..3 {
            collector.handle_event(PageEvent::Scroll).await;
            clock.advance_ms(30);
        }
        assert_eq!(collector.page.as_ref().unwrap().counters.scrolls, 1);

        clock.advance_ms(200);
        collector.handle_event(PageEvent::Scroll).await;
        assert_eq!(collector.page.as_ref().unwrap().counters.scrolls, 2);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_saves_keep_one_entry_per_page_load() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) = collector_with(store.clone(), clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com/feed".into(),
            })
            .await;
        collector.handle_event(PageEvent::Click).await;
        clock.advance_ms(5000);
        collector.handle_event(PageEvent::Click).await;

        let data = store.load().await?;
        let sessions = data.behavior_data.get("x.com").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].counters.clicks, 2);
        assert_eq!(sessions[0].session_duration_ms, 5000);
        Ok(())
    }

    #[tokio::test]
    async fn page_switch_saves_old_page_and_opens_new_entry() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, mut agg_rx) = collector_with(store.clone(), clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com/a".into(),
            })
            .await;
        collector.handle_event(PageEvent::Click).await;
        clock.advance_ms(1000);
        collector
            .handle_event(PageEvent::Loaded {
                url: "https://other.org/b".into(),
            })
            .await;

        let data = store.load().await?;
        assert_eq!(data.behavior_data.get("x.com").unwrap().len(), 1);
        assert_eq!(data.behavior_data.get("other.org").unwrap().len(), 1);

        // The pending counters were flushed before the switch, attributed
        // to the old page.
        let batch = agg_rx.try_recv().expect("flush on page switch");
        match batch {
            AggregatorEvent::Counters(batch) => {
                assert_eq!(batch.domain, "x.com");
                assert_eq!(batch.counters.clicks, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(collector.outbox.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn modifier_keys_do_not_count() -> Result<()> {
        let dir = tempdir()?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) =
            collector_with(JsonStore::new(dir.path().to_owned())?, clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;
        collector
            .handle_event(PageEvent::KeyDown { key: "Shift".into() })
            .await;
        collector
            .handle_event(PageEvent::KeyDown { key: "a".into() })
            .await;

        assert_eq!(collector.page.as_ref().unwrap().counters.keystrokes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_outbox_exports_nothing() -> Result<()> {
        let dir = tempdir()?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, mut agg_rx) =
            collector_with(JsonStore::new(dir.path().to_owned())?, clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;
        collector.export_counters().await;
        assert!(agg_rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn typing_burst_closes_into_a_sample() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) = collector_with(store.clone(), clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;
        for _ in 0..7 {
            collector
                .handle_event(PageEvent::KeyDown { key: "a".into() })
                .await;
            clock.advance_ms(150);
        }
        collector.close_typing_burst().await;

        let data = store.load().await?;
        let session = &data.behavior_data.get("x.com").unwrap()[0];
        assert_eq!(session.typing_samples.len(), 1);
        assert_eq!(session.typing_samples[0].key_count, 7);
        Ok(())
    }

    #[tokio::test]
    async fn short_typing_burst_leaves_no_sample() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) = collector_with(store.clone(), clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;
        for _ in 0..4 {
            collector
                .handle_event(PageEvent::KeyDown { key: "a".into() })
                .await;
            clock.advance_ms(150);
        }
        collector.close_typing_burst().await;

        let data = store.load().await?;
        assert!(data.behavior_data.get("x.com").unwrap()[0]
            .typing_samples
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn store_failure_tears_down_once_and_stays_quiet() {
        let clock = ManualClock::at(0);
        let (mut collector, _tx, _rx) = collector_with(FailingStore, clock.clone());

        collector
            .handle_event(PageEvent::Loaded {
                url: "https://x.com".into(),
            })
            .await;
        assert!(collector.dead);

        // Further events must not panic or resurrect the collector.
        collector.handle_event(PageEvent::Click).await;
        assert!(collector.dead);
    }
}
