pub mod orchestrator;
pub mod sqlite_repo;
pub mod tantivy_index;

use chrono::{DateTime, Utc};
use forum_model::{ReadState, Reply, ReplyId, Thread, ThreadId, User, UserId, ValidationError};
use serde::{Deserialize, Serialize};

/// Write side of the primary store (DB-agnostic).
pub trait ForumPrimaryStore {
    /// Insert a thread that already passed `Thread::pre_create`.
    fn insert_thread(&mut self, thread: &Thread) -> Result<(), StoreError>;
    /// Replace an existing thread; `NotFound` when absent.
    fn update_thread(&mut self, thread: &Thread) -> Result<(), StoreError>;
    /// Insert a reply and bump the owning thread's reply count and activity.
    fn insert_reply(&mut self, reply: &Reply) -> Result<(), StoreError>;
    /// Delete a thread and its replies. Returns the deleted reply ids.
    fn delete_thread(&mut self, id: &ThreadId) -> Result<Vec<ReplyId>, StoreError>;
    fn upsert_user(&mut self, user: &User) -> Result<(), StoreError>;
}

/// Id Resolver: maps reply ids to the ids of their owning threads.
pub trait ReplyThreadResolver {
    /// Unknown reply ids are skipped; the result may contain duplicates.
    fn thread_ids_for_replies(&self, ids: &[ReplyId]) -> Result<Vec<ThreadId>, StoreError>;
}

/// Narrowing applied when counting a thread's replies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyCountFilter<'a> {
    pub exclude_author: Option<&'a UserId>,
    /// Inclusive lower bound on `updated_at`.
    pub updated_since: Option<DateTime<Utc>>,
}

/// Read side of the primary store used by projection and read-state computation.
pub trait ForumStoreRead: ReplyThreadResolver {
    fn get_thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError>;
    /// Missing ids are skipped; order follows `ids`.
    fn get_threads_by_ids(&self, ids: &[ThreadId]) -> Result<Vec<Thread>, StoreError>;
    fn count_replies(&self, thread_id: &ThreadId, filter: &ReplyCountFilter<'_>) -> Result<u64, StoreError>;
    fn has_endorsed_reply(&self, thread_id: &ThreadId) -> Result<bool, StoreError>;
    /// Replies without a parent, oldest first.
    fn root_replies(&self, thread_id: &ThreadId) -> Result<Vec<Reply>, StoreError>;
    fn child_replies(&self, parent_id: &ReplyId) -> Result<Vec<Reply>, StoreError>;
    fn username(&self, user_id: &UserId) -> Result<Option<String>, StoreError>;
}

/// Per (user, course) read-state records.
pub trait ReadStateStore {
    /// Return the read state, creating an empty one when absent.
    ///
    /// Must be atomic: concurrent first calls for the same pair leave one record.
    fn find_or_create_read_state(&self, user_id: &UserId, course_id: &str) -> Result<ReadState, StoreError>;
    fn mark_as_read(&self, user_id: &UserId, course_id: &str, thread_id: &ThreadId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Everything projection needs from the store.
pub trait ForumStore: ForumStoreRead + ReadStateStore {}

impl<T: ForumStoreRead + ReadStateStore> ForumStore for T {}

// ------------------------------
// Index gateway: filters, options, hits
// ------------------------------

/// Structural filter on the thread index. All filters are ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Exact term on the tag list.
    TagEq(String),
    CommentableEq(String),
    CommentableIn(Vec<String>),
    CourseEq(String),
    /// Matches threads without a group or with exactly this group.
    GroupVisible(i64),
    /// Membership on the thread id alias field.
    ThreadIdIn(Vec<ThreadId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    CreatedAt,
    UpdatedAt,
    LastActivityAt,
    CommentCount,
    VotesPoint,
}

impl SortKey {
    /// Accepts both the short API names and the field names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "date" | "created_at" => Some(Self::CreatedAt),
            "updated_at" => Some(Self::UpdatedAt),
            "activity" | "last_activity_at" => Some(Self::LastActivityAt),
            "comments" | "comment_count" => Some(Self::CommentCount),
            "votes" | "votes_point" => Some(Self::VotesPoint),
            _ => None,
        }
    }

    /// Name of the i64 fast field in the thread index.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::LastActivityAt => "last_activity_at",
            Self::CommentCount => "comment_count",
            Self::VotesPoint => "votes_point",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub key: SortKey,
    pub order: SortOrder,
}

/// 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
    pub page: usize,
    pub per_page: usize,
}

impl Page {
    /// Floors both values at 1.
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page: page.max(1), per_page: per_page.max(1) }
    }

    pub fn offset(&self) -> usize { self.per_page.saturating_mul(self.page - 1) }
}

/// How the free-text clause takes part in a thread query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextOccur {
    /// Hits must match the text.
    #[default]
    Must,
    /// Text only ranks and highlights; filters alone decide membership.
    Should,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadSearchOptions {
    pub sort: Option<Sort>,
    /// `None` returns every match.
    pub page: Option<Page>,
    pub text_occur: TextOccur,
    /// Marker wrapped around highlighted terms, e.g. `highlight` -> `<highlight>..</highlight>`.
    pub highlight_tag: Option<String>,
}

/// One ranked hit from either index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    /// Absent when ordered by a sort key instead of relevance.
    pub score: Option<f32>,
    /// Stored title when nothing was highlighted.
    pub highlighted_title: String,
    /// Stored body when nothing was highlighted.
    pub highlighted_body: String,
}

/// Index Gateway over the thread and reply indexes.
pub trait ThreadSearcher {
    fn name(&self) -> &'static str;
    fn search_threads(
        &self,
        filters: &[FilterOp],
        text: Option<&str>,
        opts: &ThreadSearchOptions,
    ) -> Result<Vec<SearchHit>, IndexError>;
    /// Every matching thread id; no sort, paging or highlighting.
    fn collect_thread_ids(&self, filters: &[FilterOp], text: Option<&str>) -> Result<Vec<ThreadId>, IndexError>;
    fn search_replies(&self, text: &str, course_id: Option<&str>, max_count: usize) -> Result<Vec<SearchHit>, IndexError>;
}

/// Index maintenance hooks used by the orchestrator.
pub trait IndexMaintainer {
    fn upsert_threads(&self, threads: &[Thread]) -> Result<(), IndexError>;
    fn upsert_replies(&self, replies: &[Reply]) -> Result<(), IndexError>;
    fn delete_threads(&self, ids: &[ThreadId]) -> Result<(), IndexError>;
    fn delete_replies(&self, ids: &[ReplyId]) -> Result<(), IndexError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self { StoreError::Backend(e.to_string()) }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index backend error: {0}")]
    Backend(String),
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(e: tantivy::TantivyError) -> Self { IndexError::Backend(e.to_string()) }
}
