//! In-process fakes for the media server and the metadata provider

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use refresher::config::EngineConfig;
use refresher::db::Database;
use refresher::media::{
    ExternalRef, Item, ItemKind, ItemRef, Library, MediaServer, MediaServerError, MetadataFields,
};
use refresher::services::logging::{LogSinks, MemorySinkWriter};
use refresher::services::provider::{MetadataProvider, ProviderError, ResolutionCandidate};
use refresher::services::{Reconciler, Resolver};

/// Last-modified time of every fake item, well outside the lookback window
pub fn upstream_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn complete_metadata() -> MetadataFields {
    MetadataFields {
        poster: Some("/library/metadata/1/thumb/1".to_string()),
        summary: Some("A story.".to_string()),
        rating: Some(7.1),
    }
}

/// An item with a provider id and complete metadata
pub fn healthy_item(id: usize, library_id: &str) -> Item {
    Item {
        id: id.to_string(),
        library_id: library_id.to_string(),
        kind: ItemKind::Movie,
        title: format!("Movie {id}"),
        year: Some(2000),
        guids: vec![format!("tmdb://{}", 1000 + id)],
        metadata: complete_metadata(),
        updated_at: Some(upstream_time()),
    }
}

/// An item without any identifier and with no summary
pub fn unmatched_item(id: &str, title: &str, year: i32) -> Item {
    Item {
        id: id.to_string(),
        library_id: "1".to_string(),
        kind: ItemKind::Movie,
        title: title.to_string(),
        year: Some(year),
        guids: Vec::new(),
        metadata: MetadataFields {
            summary: None,
            ..complete_metadata()
        },
        updated_at: Some(upstream_time()),
    }
}

pub fn movies() -> Library {
    Library {
        id: "1".to_string(),
        title: "Movies".to_string(),
        kind: ItemKind::Movie,
    }
}

#[derive(Default)]
pub struct FakeServer {
    pub libraries: Mutex<Vec<Library>>,
    /// Items per library in server order
    pub order: Mutex<HashMap<String, Vec<String>>>,
    pub items: Mutex<HashMap<String, Item>>,
    /// Items whose metadata a refresh completes
    pub fixable: Mutex<HashSet<String>>,
    /// Listed, but deleted before their payload is fetched
    pub vanished: Mutex<HashSet<String>>,
    pub fetch_batches: Mutex<Vec<usize>>,
    pub fetch_delay: Mutex<Duration>,
    /// The server goes away after this many fetches
    pub down_after_fetches: Mutex<Option<usize>>,
    pub down: AtomicBool,
    pub online_checks: AtomicU32,
    /// Number of `is_scanning` calls that report a running scan
    pub busy_polls: AtomicU32,
    pub scanning_checks: AtomicU32,
    pub refreshes: AtomicUsize,
    pub injected: Mutex<Vec<(String, ExternalRef)>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_library(&self, library: Library, items: Vec<Item>) {
        let ids = items.iter().map(|i| i.id.clone()).collect();
        self.order.lock().insert(library.id.clone(), ids);
        let mut all = self.items.lock();
        for item in items {
            all.insert(item.id.clone(), item);
        }
        self.libraries.lock().push(library);
    }

    pub fn put(&self, item: Item) {
        self.items.lock().insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Item {
        self.items.lock()[id].clone()
    }

    pub fn make_fixable(&self, id: &str) {
        self.fixable.lock().insert(id.to_string());
    }

    pub fn batches(&self) -> Vec<usize> {
        self.fetch_batches.lock().clone()
    }

    fn check_up(&self) -> Result<(), MediaServerError> {
        if self.down.load(Ordering::SeqCst) {
            Err(MediaServerError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaServer for FakeServer {
    async fn list_libraries(&self) -> Result<Vec<Library>, MediaServerError> {
        self.check_up()?;
        Ok(self.libraries.lock().clone())
    }

    async fn list_items(
        &self,
        library_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemRef>, MediaServerError> {
        self.check_up()?;
        let order = self.order.lock();
        let items = self.items.lock();
        Ok(order
            .get(library_id)
            .map(|ids| ids.iter().map(|id| items[id].item_ref()).collect())
            .unwrap_or_default())
    }

    async fn fetch_items(&self, ids: &[String]) -> Result<Vec<Item>, MediaServerError> {
        self.check_up()?;
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut batches = self.fetch_batches.lock();
            batches.push(ids.len());
            if let Some(limit) = *self.down_after_fetches.lock() {
                if batches.len() >= limit {
                    // This batch is served, everything after fails
                    self.down.store(true, Ordering::SeqCst);
                }
            }
        }

        let items = self.items.lock();
        let vanished = self.vanished.lock();
        Ok(ids
            .iter()
            .filter(|id| !vanished.contains(*id))
            .filter_map(|id| items.get(id).cloned())
            .collect())
    }

    async fn is_online(&self) -> bool {
        self.online_checks.fetch_add(1, Ordering::SeqCst);
        !self.down.load(Ordering::SeqCst)
    }

    async fn is_scanning(&self) -> Result<bool, MediaServerError> {
        self.check_up()?;
        self.scanning_checks.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .busy_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(busy)
    }

    async fn request_refresh(&self, item_id: &str) -> Result<(), MediaServerError> {
        self.check_up()?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fixable.lock().contains(item_id) {
            if let Some(item) = self.items.lock().get_mut(item_id) {
                item.metadata = complete_metadata();
            }
        }
        Ok(())
    }

    async fn inject_identifier(
        &self,
        item_id: &str,
        external: &ExternalRef,
    ) -> Result<(), MediaServerError> {
        self.check_up()?;
        let mut items = self.items.lock();
        let item = items
            .get_mut(item_id)
            .ok_or_else(|| MediaServerError::Rejected(format!("unknown item {item_id}")))?;
        item.guids.push(external.to_guid());
        self.injected
            .lock()
            .push((item_id.to_string(), external.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProvider {
    /// Search results per query title
    pub results: Mutex<HashMap<String, Vec<ResolutionCandidate>>>,
    /// Answers to `find_by_external`, keyed by reference (`imdb://tt…`)
    pub translations: Mutex<HashMap<String, ResolutionCandidate>>,
    pub unavailable: AtomicBool,
    pub searches: AtomicUsize,
    pub external_lookups: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, query: &str, candidates: Vec<ResolutionCandidate>) {
        self.results.lock().insert(query.to_string(), candidates);
    }

    pub fn translate(&self, reference: &str, candidate: ResolutionCandidate) {
        self.translations
            .lock()
            .insert(reference.to_string(), candidate);
    }
}

pub fn candidate(tmdb_id: i64, title: &str, year: i32, order: usize) -> ResolutionCandidate {
    ResolutionCandidate {
        external: ExternalRef::tmdb(tmdb_id),
        title: title.to_string(),
        year: Some(year),
        kind: ItemKind::Movie,
        relevance: 1.0 / (order as f64 + 1.0),
        popularity: Some(10.0),
        order,
    }
}

#[async_trait]
impl MetadataProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(
        &self,
        title: &str,
        _year: Option<i32>,
        _kind: ItemKind,
    ) -> Result<Vec<ResolutionCandidate>, ProviderError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("timed out".into()));
        }
        Ok(self.results.lock().get(title).cloned().unwrap_or_default())
    }

    async fn find_by_external(
        &self,
        reference: &ExternalRef,
        _kind: ItemKind,
    ) -> Result<Option<ResolutionCandidate>, ProviderError> {
        self.external_lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("timed out".into()));
        }
        Ok(self.translations.lock().get(&reference.to_string()).cloned())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub db: Database,
    pub server: Arc<FakeServer>,
    pub provider: Arc<FakeProvider>,
    pub writer: Arc<MemorySinkWriter>,
    pub sinks: Arc<LogSinks>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(&test_config()).await
    }

    pub async fn with_config(config: &EngineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("state.db"), config.pool_size)
            .await
            .unwrap();
        let server = FakeServer::new();
        let provider = FakeProvider::new();
        let writer = Arc::new(MemorySinkWriter::new());
        let sinks = Arc::new(LogSinks::new(writer.clone(), 64));

        let resolver = Arc::new(Resolver::new(
            provider.clone(),
            sinks.clone(),
            config.resolver_threshold,
        ));
        let reconciler = Arc::new(
            Reconciler::new(
                server.clone(),
                resolver,
                db.clone(),
                config.escalation_policy(),
                sinks.clone(),
            )
            .with_refresh_settle(config.refresh_settle),
        );

        Self {
            dir,
            db,
            server,
            provider,
            writer,
            sinks,
            reconciler,
        }
    }
}

/// Engine settings with every wait shortened for tests
pub fn test_config() -> EngineConfig {
    EngineConfig {
        item_quota: 10_000,
        boot_grace: Duration::from_millis(5),
        busy_poll_interval: Duration::from_millis(5),
        refresh_settle: Duration::ZERO,
        sample_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}
