use chrono::{DateTime, Utc};
use forum_model::{Reply, Thread, ValidationError};
use tracing::info;

use crate::{ForumPrimaryStore, ForumStoreRead, IndexMaintainer, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index error: {0}")]
    Index(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleteReport {
    pub replies_deleted: usize,
    pub index_delete_attempts: usize,
}

/// Create orchestrator: run the create hook, insert into the DB, then index.
///
/// Nothing is written when validation fails. Returns the stored thread.
pub fn create_thread_orchestrated<S: ForumPrimaryStore>(
    repo: &mut S,
    mut thread: Thread,
    now: DateTime<Utc>,
    indexes: &[&dyn IndexMaintainer],
) -> Result<Thread, OrchestratorError> {
    thread.pre_create(now)?;
    repo.insert_thread(&thread)?;
    for ix in indexes {
        ix.upsert_threads(std::slice::from_ref(&thread)).map_err(|e| OrchestratorError::Index(format!("{e}")))?;
    }
    info!(thread = %thread.id, course = %thread.course_id, "thread created");
    Ok(thread)
}

/// Update orchestrator: load the previous version, run the update hook, replace, reindex.
pub fn update_thread_orchestrated<S: ForumPrimaryStore + ForumStoreRead>(
    repo: &mut S,
    mut thread: Thread,
    now: DateTime<Utc>,
    indexes: &[&dyn IndexMaintainer],
) -> Result<Thread, OrchestratorError> {
    let previous = repo
        .get_thread(&thread.id)?
        .ok_or_else(|| StoreError::NotFound(format!("thread {}", thread.id)))?;
    // the reply counter is owned by reply inserts
    thread.reply_count = previous.reply_count;
    thread.pre_update(&previous, now)?;
    repo.update_thread(&thread)?;
    for ix in indexes {
        ix.upsert_threads(std::slice::from_ref(&thread)).map_err(|e| OrchestratorError::Index(format!("{e}")))?;
    }
    info!(thread = %thread.id, "thread updated");
    Ok(thread)
}

/// Reply orchestrator: insert the reply, then index it and the thread whose count and activity moved.
pub fn create_reply_orchestrated<S: ForumPrimaryStore + ForumStoreRead>(
    repo: &mut S,
    reply: Reply,
    indexes: &[&dyn IndexMaintainer],
) -> Result<Reply, OrchestratorError> {
    reply.validate()?;
    repo.insert_reply(&reply)?;
    let thread = repo.get_thread(&reply.thread_id)?;
    for ix in indexes {
        ix.upsert_replies(std::slice::from_ref(&reply)).map_err(|e| OrchestratorError::Index(format!("{e}")))?;
        if let Some(t) = &thread {
            ix.upsert_threads(std::slice::from_ref(t)).map_err(|e| OrchestratorError::Index(format!("{e}")))?;
        }
    }
    info!(reply = %reply.id, thread = %reply.thread_id, "reply created");
    Ok(reply)
}

/// Delete orchestrator: remove the thread and its replies from the DB, then from every index.
pub fn delete_thread_orchestrated<S: ForumPrimaryStore>(
    repo: &mut S,
    id: &forum_model::ThreadId,
    indexes: &[&dyn IndexMaintainer],
) -> Result<DeleteReport, OrchestratorError> {
    let reply_ids = repo.delete_thread(id)?;
    let mut report = DeleteReport { replies_deleted: reply_ids.len(), ..Default::default() };
    for ix in indexes {
        ix.delete_threads(std::slice::from_ref(id)).map_err(|e| OrchestratorError::Index(format!("{e}")))?;
        ix.delete_replies(&reply_ids).map_err(|e| OrchestratorError::Index(format!("{e}")))?;
        report.index_delete_attempts += 1 + reply_ids.len();
    }
    info!(thread = %id, replies = report.replies_deleted, "thread deleted");
    Ok(report)
}
