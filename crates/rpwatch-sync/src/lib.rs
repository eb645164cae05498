//! Pipeline orchestration: fetch -> parse -> extract -> dedupe -> persist.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rpwatch_core::TrialRecord;
use rpwatch_extract::{extract_record, parse_studies, study_ids};
use rpwatch_storage::{
    DbConfig, FetchError, RegistryClient, RegistryConfig, ResponseCache, StoreError, TrialStore,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rpwatch-sync";

/// Upstream supplier of the raw full-studies response body.
#[async_trait]
pub trait StudySource: Send + Sync {
    async fn fetch_raw(&self) -> Result<String, FetchError>;
}

#[async_trait]
impl StudySource for RegistryClient {
    async fn fetch_raw(&self) -> Result<String, FetchError> {
        self.fetch_full_studies().await
    }
}

/// Persistence collaborator for extracted trial records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ensure_table(&self) -> Result<(), StoreError>;
    async fn stored_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn insert(&self, record: &TrialRecord) -> Result<(), StoreError>;
}

#[async_trait]
impl RecordStore for TrialStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        TrialStore::ensure_table(self).await
    }

    async fn stored_ids(&self) -> Result<Vec<String>, StoreError> {
        TrialStore::stored_ids(self).await
    }

    async fn insert(&self, record: &TrialRecord) -> Result<(), StoreError> {
        TrialStore::insert(self, record).await
    }
}

/// Identifiers already persisted, for exact-membership deduplication.
///
/// A candidate already present is dropped silently, so re-running the
/// pipeline against an unchanged upstream fetch inserts nothing.
#[derive(Debug, Default)]
pub struct StoredIds(HashSet<String>);

impl StoredIds {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids.into_iter().collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db: DbConfig,
    pub cache_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
            cache_path: std::env::var("RPWATCH_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./clinical_trials.json")),
            user_agent: std::env::var("RPWATCH_USER_AGENT")
                .unwrap_or_else(|_| "rpwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("RPWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_fresh: bool,
    pub studies: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub failed: usize,
}

/// One-shot orchestrator over the fetch, extraction, and persistence
/// collaborators. Fully sequential: one record at a time, every await
/// serialized.
pub struct Pipeline {
    source: Box<dyn StudySource>,
    store: Box<dyn RecordStore>,
    cache: ResponseCache,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let registry = RegistryClient::new(RegistryConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..RegistryConfig::default()
        })?;
        Ok(Self::with_parts(
            Box::new(registry),
            Box::new(TrialStore::from_config(&config.db)),
            ResponseCache::new(&config.cache_path),
        ))
    }

    pub fn with_parts(
        source: Box<dyn StudySource>,
        store: Box<dyn RecordStore>,
        cache: ResponseCache,
    ) -> Self {
        Self {
            source,
            store,
            cache,
        }
    }

    /// Fetch the registry window and rewrite the cache, without touching the
    /// database. Returns the cached body length in bytes.
    pub async fn fetch_once(&self) -> Result<usize> {
        let body = self
            .source
            .fetch_raw()
            .await
            .context("fetching registry window")?;
        self.cache
            .store(&body)
            .await
            .context("caching registry response")?;
        Ok(body.len())
    }

    /// Run the full pipeline once.
    ///
    /// A fetch failure degrades to the last cached response; only a missing
    /// cache at that point aborts the run. A failed extraction or insert for
    /// one identifier is logged and counted, never blocking the rest.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let (raw, fetched_fresh) = match self.source.fetch_raw().await {
            Ok(body) => {
                self.cache
                    .store(&body)
                    .await
                    .context("caching registry response")?;
                (body, true)
            }
            Err(err) => {
                warn!(error = %err, "registry fetch failed, reusing cached response");
                let body = self
                    .cache
                    .load()
                    .await
                    .context("registry fetch failed and no cached response is available")?;
                (body, false)
            }
        };

        let studies = parse_studies(&raw).context("parsing registry response")?;
        let ids = study_ids(&studies);

        self.store
            .ensure_table()
            .await
            .context("ensuring trials table")?;
        let stored = StoredIds::new(
            self.store
                .stored_ids()
                .await
                .context("listing stored trial ids")?,
        );

        let mut inserted = 0usize;
        let mut skipped_existing = 0usize;
        let mut failed = 0usize;

        for id in &ids {
            if stored.contains(id) {
                skipped_existing += 1;
                continue;
            }

            let Some(record) = extract_record(&studies, id) else {
                warn!(%id, "identifier not found among fetched studies");
                failed += 1;
                continue;
            };

            match self.store.insert(&record).await {
                Ok(()) => {
                    info!(%id, "stored new trial");
                    inserted += 1;
                }
                Err(err) => {
                    error!(%id, error = %err, "failed to store trial");
                    failed += 1;
                }
            }
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_fresh,
            studies: studies.len(),
            inserted,
            skipped_existing,
            failed,
        })
    }
}

/// Convenience entry point for the CLI: config from env, live registry and
/// Postgres collaborators.
pub async fn run_pipeline_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env();
    Pipeline::new(&config)?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct FixtureSource {
        body: Option<String>,
    }

    #[async_trait]
    impl StudySource for FixtureSource {
        async fn fetch_raw(&self) -> Result<String, FetchError> {
            match &self.body {
                Some(body) => Ok(body.clone()),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: "https://registry.invalid/full_studies".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<TrialRecord>>,
        fail_inserts_for: Option<String>,
    }

    impl MemoryStore {
        fn record_ids(&self) -> Vec<String> {
            self.records
                .lock()
                .expect("records lock")
                .iter()
                .map(|r| r.id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RecordStore for Arc<MemoryStore> {
        async fn ensure_table(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn stored_ids(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.record_ids())
        }

        async fn insert(&self, record: &TrialRecord) -> Result<(), StoreError> {
            if self.fail_inserts_for.as_deref() == Some(record.id.as_str()) {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
            self.records
                .lock()
                .expect("records lock")
                .push(record.clone());
            Ok(())
        }
    }

    fn study(id: &str) -> serde_json::Value {
        json!({
            "ProtocolSection": {
                "IdentificationModule": {
                    "NCTId": id,
                    "OfficialTitle": format!("Study {id}"),
                    "Organization": { "OrgFullName": "Example Medical Center" }
                },
                "StatusModule": {
                    "StartDateStruct": { "StartDate": "March 2020" }
                },
                "DescriptionModule": { "BriefSummary": "Brief  summary." },
                "ContactsLocationsModule": {
                    "CentralContactList": {
                        "CentralContact": [ { "CentralContactName": "Jane Doe" } ]
                    }
                }
            }
        })
    }

    fn fixture_body(ids: &[&str]) -> String {
        json!({
            "FullStudiesResponse": {
                "FullStudies": ids
                    .iter()
                    .map(|id| json!({ "Study": study(id) }))
                    .collect::<Vec<_>>()
            }
        })
        .to_string()
    }

    fn pipeline(
        body: Option<String>,
        store: Arc<MemoryStore>,
        cache_path: PathBuf,
    ) -> Pipeline {
        Pipeline::with_parts(
            Box::new(FixtureSource { body }),
            Box::new(store),
            ResponseCache::new(cache_path),
        )
    }

    #[tokio::test]
    async fn second_run_against_unchanged_upstream_inserts_nothing() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache.json");
        let store = Arc::new(MemoryStore::default());
        let body = fixture_body(&["NCT00000001", "NCT00000002"]);

        let pipeline = pipeline(Some(body), store.clone(), cache_path);

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.inserted, 2);
        assert_eq!(first.skipped_existing, 0);

        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(store.record_ids().len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_the_cached_response() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache.json");
        ResponseCache::new(&cache_path)
            .store(&fixture_body(&["NCT00000003"]))
            .await
            .expect("seed cache");

        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline(None, store.clone(), cache_path);

        let summary = pipeline.run_once().await.expect("run");
        assert!(!summary.fetched_fresh);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.record_ids(), vec!["NCT00000003".to_string()]);
    }

    #[tokio::test]
    async fn fetch_failure_without_a_cache_aborts_the_run() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline(None, store, dir.path().join("absent.json"));

        let err = pipeline.run_once().await.unwrap_err();
        assert!(err.to_string().contains("no cached response"));
    }

    #[tokio::test]
    async fn one_failing_insert_does_not_block_the_remaining_records() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore {
            records: Mutex::new(Vec::new()),
            fail_inserts_for: Some("NCT00000001".to_string()),
        });
        let body = fixture_body(&["NCT00000001", "NCT00000002"]);
        let pipeline = pipeline(Some(body), store.clone(), dir.path().join("cache.json"));

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.record_ids(), vec!["NCT00000002".to_string()]);
    }

    #[tokio::test]
    async fn successful_fetch_rewrites_the_cache() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache.json");
        let body = fixture_body(&["NCT00000004"]);
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline(Some(body.clone()), store, cache_path.clone());

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.fetched_fresh);
        let cached = ResponseCache::new(cache_path).load().await.expect("cache");
        assert_eq!(cached, body);
    }

    #[test]
    fn stored_ids_is_exact_membership() {
        let stored = StoredIds::new(vec!["NCT1".to_string(), "NCT2".to_string()]);
        assert!(stored.contains("NCT1"));
        assert!(!stored.contains("nct1"));
        assert!(!stored.contains("NCT3"));
        assert_eq!(stored.len(), 2);
    }
}
