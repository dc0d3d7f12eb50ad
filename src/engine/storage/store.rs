use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::warn;

use super::entities::{DailyStats, DomainBudget, PageSession, SessionSnapshot};

/// The full persisted key/value state. Field names serialize to the exact
/// keys the export format exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreData {
    pub session_data: Option<SessionSnapshot>,
    pub visit_frequency: BTreeMap<String, u64>,
    pub behavior_data: BTreeMap<String, Vec<PageSession>>,
    pub today_stats: DailyStats,
    pub url_time_spent: BTreeMap<String, u64>,
    pub distraction_urls: Vec<DomainBudget>,
    pub productive_urls: Vec<DomainBudget>,
    pub reward_points: i64,
    pub tracking_paused: bool,
    pub focus_mode: bool,
    pub notifications_enabled: bool,
    pub strict_mode: bool,
    pub last_reset_date: Option<String>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            session_data: None,
            visit_frequency: BTreeMap::new(),
            behavior_data: BTreeMap::new(),
            today_stats: DailyStats::default(),
            url_time_spent: BTreeMap::new(),
            distraction_urls: Vec::new(),
            productive_urls: Vec::new(),
            reward_points: 0,
            tracking_paused: false,
            focus_mode: false,
            // Notifications are opt-out.
            notifications_enabled: true,
            strict_mode: false,
            last_reset_date: None,
        }
    }
}

impl StoreData {
    /// Drops everything the trackers captured while keeping user
    /// configuration (budget lists and behavior flags).
    pub fn clear_captured(&mut self) {
        self.session_data = None;
        self.visit_frequency.clear();
        self.behavior_data.clear();
        self.today_stats = DailyStats::default();
        self.url_time_spent.clear();
        self.reward_points = 0;
        self.last_reset_date = None;
    }
}

/// Replaces the session with the same page-load time, or appends. Saving a
/// page twice never produces two entries for one page load.
pub fn upsert_session(sessions: &mut Vec<PageSession>, session: PageSession) {
    match sessions
        .iter_mut()
        .find(|existing| existing.page_load_time == session.page_load_time)
    {
        Some(existing) => *existing = session,
        None => sessions.push(session),
    }
}

/// The on-disk shape of an exported data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    #[serde(flatten)]
    pub data: StoreData,
    pub export_time: DateTime<Utc>,
}

pub type UpdateFn = Box<dyn FnOnce(&mut StoreData) + Send>;

/// Interface for abstracting the persisted behavior store. Writes are
/// read-modify-write under an exclusive lock; the last successful write
/// wins, there is no retry or rollback.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BehaviorStore: Send + Sync {
    async fn load(&self) -> Result<StoreData>;

    async fn update(&self, apply: UpdateFn) -> Result<StoreData>;

    async fn clear(&self) -> Result<()>;
}

/// The main realization of [BehaviorStore]: one JSON document on disk.
#[derive(Clone)]
pub struct JsonStore {
    path: PathBuf,
    /// Serializes writers inside this process. The flock below blocks its
    /// whole thread, so two futures on one runtime thread must never race
    /// for it; clones share the mutex.
    writers: Arc<Mutex<()>>,
}

impl JsonStore {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("store.json"),
            writers: Arc::new(Mutex::new(())),
        })
    }

    fn parse(&self, contents: &str) -> StoreData {
        if contents.trim().is_empty() {
            return StoreData::default();
        }
        match serde_json::from_str(contents) {
            Ok(data) => data,
            Err(e) => {
                // Might happen after a shutdown cut a write short. Start
                // over rather than refuse to run.
                warn!("Store file {:?} is corrupted, using defaults: {e}", self.path);
                StoreData::default()
            }
        }
    }

    pub async fn export(&self, now: DateTime<Utc>) -> Result<ExportDocument> {
        Ok(ExportDocument {
            data: self.load().await?,
            export_time: now,
        })
    }

    /// Replaces the whole store with the contents of an exported document.
    pub async fn import(&self, document: ExportDocument) -> Result<()> {
        self.update(Box::new(move |data| *data = document.data))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BehaviorStore for JsonStore {
    async fn load(&self) -> Result<StoreData> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreData::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(self.parse(&contents))
    }

    async fn update(&self, apply: UpdateFn) -> Result<StoreData> {
        let _writers = self.writers.lock().await;
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;

        // Semi-safe acquire-release for the store file.
        file.lock_exclusive()?;
        let result = Self::update_with_file(self, &mut file, apply).await;
        file.unlock_async().await?;
        result
    }

    async fn clear(&self) -> Result<()> {
        self.update(Box::new(StoreData::clear_captured)).await?;
        Ok(())
    }
}

impl JsonStore {
    async fn update_with_file(
        &self,
        file: &mut File,
        apply: UpdateFn,
    ) -> Result<StoreData> {
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        let mut data = self.parse(&contents);

        apply(&mut data);

        let serialized = serde_json::to_vec(&data)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(&serialized).await?;
        file.flush().await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::engine::storage::entities::{InteractionCounters, PageSession};

    use super::{upsert_session, BehaviorStore, ExportDocument, JsonStore, StoreData};

    fn page_session(page_load_ms: i64, clicks: u32) -> PageSession {
        let load = Utc.timestamp_millis_opt(page_load_ms).unwrap();
        PageSession {
            url: "https://x.com/feed".into(),
            domain: "x.com".into(),
            page_load_time: load,
            last_updated: load + Duration::seconds(clicks as i64),
            counters: InteractionCounters {
                clicks,
                ..Default::default()
            },
            typing_samples: vec![],
            session_duration_ms: 1000,
            time_of_day: load,
        }
    }

    #[test]
    fn upsert_replaces_entry_with_same_page_load_time() {
        let mut sessions = vec![page_session(1000, 1), page_session(2000, 1)];

        upsert_session(&mut sessions, page_session(1000, 7));

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].counters.clicks, 7);
        assert!(sessions[0].last_updated > sessions[1].last_updated);
    }

    #[test]
    fn upsert_appends_new_page_loads() {
        let mut sessions = vec![page_session(1000, 1)];
        upsert_session(&mut sessions, page_session(3000, 2));
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn missing_store_file_loads_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        assert_eq!(store.load().await?, StoreData::default());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_store_file_degrades_to_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        tokio::fs::write(dir.path().join("store.json"), b"{not json").await?;
        assert_eq!(store.load().await?, StoreData::default());
        Ok(())
    }

    #[tokio::test]
    async fn updates_are_read_back() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;

        store
            .update(Box::new(|data| {
                *data.visit_frequency.entry("x.com".into()).or_default() += 1;
                data.today_stats.active_time_seconds = 42;
            }))
            .await?;
        store
            .update(Box::new(|data| {
                *data.visit_frequency.entry("x.com".into()).or_default() += 1;
            }))
            .await?;

        let data = store.load().await?;
        assert_eq!(data.visit_frequency.get("x.com"), Some(&2));
        assert_eq!(data.today_stats.active_time_seconds, 42);
        Ok(())
    }

    #[tokio::test]
    async fn joined_writers_on_one_task_do_not_deadlock() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;

        // Two futures on the same task interleave mid-update, the way the
        // collector and aggregator share one store inside the engine join.
        let first = async {
            for _ in 0..10 {
                store
                    .update(Box::new(|data| {
                        *data.visit_frequency.entry("a".into()).or_default() += 1;
                    }))
                    .await?;
            }
            anyhow::Ok(())
        };
        let second = async {
            for _ in 0..10 {
                store
                    .update(Box::new(|data| {
                        *data.visit_frequency.entry("b".into()).or_default() += 1;
                    }))
                    .await?;
            }
            anyhow::Ok(())
        };

        let (first, second) = tokio::join!(first, second);
        first?;
        second?;

        let data = store.load().await?;
        assert_eq!(data.visit_frequency.get("a"), Some(&10));
        assert_eq!(data.visit_frequency.get("b"), Some(&10));
        Ok(())
    }

    #[tokio::test]
    async fn shorter_rewrite_does_not_leave_trailing_garbage() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;

        store
            .update(Box::new(|data| {
                data.behavior_data
                    .entry("x.com".into())
                    .or_default()
                    .push(page_session(1000, 3));
            }))
            .await?;
        store
            .update(Box::new(|data| {
                data.behavior_data.clear();
            }))
            .await?;

        assert_eq!(store.load().await?.behavior_data.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn export_import_round_trips_every_key() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();

        store
            .update(Box::new(|data| {
                data.visit_frequency.insert("x.com".into(), 4);
                data.behavior_data
                    .entry("x.com".into())
                    .or_default()
                    .push(page_session(1000, 2));
                data.today_stats.distraction_time_seconds = 90;
                data.url_time_spent.insert("x.com".into(), 90);
                data.distraction_urls.push(super::DomainBudget {
                    url: "http://x.com".into(),
                    limit_seconds: 60,
                });
                data.reward_points = 12;
                data.strict_mode = true;
                data.last_reset_date = Some("2024-03-15".into());
            }))
            .await?;

        let document = store.export(now).await?;
        let serialized = serde_json::to_string_pretty(&document)?;
        let parsed: ExportDocument = serde_json::from_str(&serialized)?;

        let other = JsonStore::new(dir.path().join("restored"))?;
        other.import(parsed).await?;

        assert_eq!(other.load().await?, store.load().await?);
        Ok(())
    }

    #[tokio::test]
    async fn clear_keeps_configuration() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = JsonStore::new(dir.path().to_owned())?;

        store
            .update(Box::new(|data| {
                data.visit_frequency.insert("x.com".into(), 4);
                data.reward_points = 3;
                data.strict_mode = true;
                data.distraction_urls.push(super::DomainBudget {
                    url: "http://x.com".into(),
                    limit_seconds: 60,
                });
            }))
            .await?;
        store.clear().await?;

        let data = store.load().await?;
        assert!(data.visit_frequency.is_empty());
        assert_eq!(data.reward_points, 0);
        assert!(data.strict_mode);
        assert_eq!(data.distraction_urls.len(), 1);
        Ok(())
    }
}
