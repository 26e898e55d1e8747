//! Forum search service: query parsing, two-pass merge, projection and caching
//! over the SQLite store and the tantivy indexes.

pub mod cache;
pub mod config;
pub mod merger;
pub mod projector;
pub mod query;
pub mod read_state;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use forum_model::{Reply, Thread, ThreadId, User, UserId, ValidationError};
use forum_store::orchestrator::{
    create_reply_orchestrated, create_thread_orchestrated, delete_thread_orchestrated, update_thread_orchestrated,
    DeleteReport, OrchestratorError,
};
use forum_store::sqlite_repo::SqliteRepo;
use forum_store::tantivy_index::TantivyForumIndex;
use forum_store::{ForumPrimaryStore, ForumStoreRead, IndexError, ReadStateStore, SearchHit, StoreError};
use parking_lot::Mutex;
use tracing::{debug, info};

pub use cache::{cache_key, MemoryCache, SearchCache};
pub use config::ServiceConfig;
pub use merger::{MergerOptions, ResultMerger};
pub use projector::{DocumentProjector, ReplyDoc, ThreadDoc};
pub use query::{ProjectionOptions, SearchParams, SearchQuery};
pub use read_state::{ReadStateCalculator, ReadStatus};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("repo error: {0}")]
    Repo(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Backend(m) => ServiceError::Repo(m),
            StoreError::NotFound(m) => ServiceError::NotFound(m),
            StoreError::Validation(v) => ServiceError::Validation(v),
        }
    }
}

impl From<IndexError> for ServiceError {
    fn from(e: IndexError) -> Self { ServiceError::Index(e.to_string()) }
}

impl From<OrchestratorError> for ServiceError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Store(s) => s.into(),
            OrchestratorError::Index(m) => ServiceError::Index(m),
            OrchestratorError::Validation(v) => ServiceError::Validation(v),
        }
    }
}

pub struct ForumService {
    cfg: ServiceConfig,
    repo: Mutex<SqliteRepo>,
    index: TantivyForumIndex,
    cache: Option<Arc<dyn SearchCache>>,
}

impl ForumService {
    /// Open the store at `cfg.db_path` and the indexes under `cfg.index_dir` (RAM when unset).
    pub fn new(cfg: ServiceConfig) -> Result<Self, ServiceError> {
        if let Some(parent) = cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ServiceError::Io(format!("{}: {e}", parent.display())))?;
        }
        let repo = SqliteRepo::open_with_timeout(&cfg.db_path, Duration::from_millis(cfg.store_busy_timeout_ms))
            .map_err(|e| ServiceError::Repo(e.to_string()))?;
        let index = match &cfg.index_dir {
            Some(dir) => TantivyForumIndex::open_or_create_dir(dir, &cfg.index_names)?,
            None => TantivyForumIndex::new_ram()?,
        };
        info!(db = %cfg.db_path.display(), on_disk_index = cfg.index_dir.is_some(), "forum service opened");
        Ok(Self::with_repo(cfg, repo, index))
    }

    /// Compose from an already opened store and index.
    pub fn with_repo(cfg: ServiceConfig, repo: SqliteRepo, index: TantivyForumIndex) -> Self {
        let cache: Option<Arc<dyn SearchCache>> =
            if cfg.cache_enabled { Some(Arc::new(MemoryCache::new())) } else { None };
        let index = index.with_writer_heap(cfg.index_writer_heap_bytes);
        Self { cfg, repo: Mutex::new(repo), index, cache }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SearchCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ServiceConfig { &self.cfg }

    pub fn create_thread(&self, thread: Thread) -> Result<Thread, ServiceError> {
        let mut repo = self.repo.lock();
        Ok(create_thread_orchestrated(&mut *repo, thread, Utc::now(), &[&self.index])?)
    }

    pub fn update_thread(&self, thread: Thread) -> Result<Thread, ServiceError> {
        let mut repo = self.repo.lock();
        Ok(update_thread_orchestrated(&mut *repo, thread, Utc::now(), &[&self.index])?)
    }

    pub fn create_reply(&self, reply: Reply) -> Result<Reply, ServiceError> {
        let mut repo = self.repo.lock();
        Ok(create_reply_orchestrated(&mut *repo, reply, &[&self.index])?)
    }

    pub fn delete_thread(&self, id: &ThreadId) -> Result<DeleteReport, ServiceError> {
        let mut repo = self.repo.lock();
        Ok(delete_thread_orchestrated(&mut *repo, id, &[&self.index])?)
    }

    pub fn upsert_user(&self, user: &User) -> Result<(), ServiceError> {
        Ok(self.repo.lock().upsert_user(user)?)
    }

    /// Record that `user_id` has read `thread_id` now.
    pub fn mark_as_read(&self, user_id: &UserId, thread_id: &ThreadId) -> Result<(), ServiceError> {
        let repo = self.repo.lock();
        let thread = repo.get_thread(thread_id)?.ok_or_else(|| ServiceError::NotFound(format!("thread {thread_id}")))?;
        repo.mark_as_read(user_id, &thread.course_id, thread_id, Utc::now())?;
        Ok(())
    }

    /// Search threads and project one page of results for the (optional) viewer.
    pub fn search_threads(&self, params: &SearchParams) -> Result<Vec<ThreadDoc>, ServiceError> {
        let query = SearchQuery::from_params(params, self.cfg.default_per_page)?;
        let projection = ProjectionOptions::from_params(params);
        let hits = self.search_hits(&query)?;
        let repo = self.repo.lock();
        DocumentProjector::new(&*repo).project_hits(&hits, &projection)
    }

    pub fn get_thread(&self, id: &ThreadId, opts: &ProjectionOptions) -> Result<ThreadDoc, ServiceError> {
        let repo = self.repo.lock();
        let thread = repo.get_thread(id)?.ok_or_else(|| ServiceError::NotFound(format!("thread {id}")))?;
        DocumentProjector::new(&*repo).project_thread(&thread, opts)
    }

    fn merger_options(&self) -> MergerOptions {
        MergerOptions {
            max_deep_search_comment_count: self.cfg.max_deep_search_comment_count,
            highlight_tag: Some(self.cfg.highlight_tag.clone()).filter(|t| !t.is_empty()),
        }
    }

    /// The merged hit page, through the cache when one is configured.
    fn search_hits(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, ServiceError> {
        let options = self.merger_options();
        let Some(cache) = &self.cache else {
            return self.merge(query, options);
        };
        let key = cache_key(query, &options)?;
        if let Some(bytes) = cache.get(&key) {
            debug!(key = %key, "search cache hit");
            return serde_json::from_slice(&bytes).map_err(|e| ServiceError::Cache(e.to_string()));
        }
        debug!(key = %key, "search cache miss");
        let hits = self.merge(query, options)?;
        let bytes = serde_json::to_vec(&hits).map_err(|e| ServiceError::Cache(e.to_string()))?;
        cache.set(&key, bytes, Duration::from_secs(self.cfg.cache_ttl_secs));
        Ok(hits)
    }

    fn merge(&self, query: &SearchQuery, options: MergerOptions) -> Result<Vec<SearchHit>, ServiceError> {
        let repo = self.repo.lock();
        ResultMerger::new(&self.index, &*repo, options).search(query)
    }
}
