use forum_model::{ReadState, Thread, UserId};
use forum_store::{ForumStore, ReplyCountFilter, StoreError};
use serde::Serialize;

/// Unread count and read flag of one thread for one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadStatus {
    pub unread_count: u64,
    pub read: bool,
}

pub struct ReadStateCalculator<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ForumStore + ?Sized> ReadStateCalculator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Find-or-create the viewer's read state for the thread's course, then compute.
    pub fn compute(&self, thread: &Thread, viewer: Option<&UserId>) -> Result<ReadStatus, StoreError> {
        match viewer {
            None => self.compute_with(thread, None),
            Some(v) => {
                let state = self.store.find_or_create_read_state(v, &thread.course_id)?;
                self.compute_with(thread, Some((v, &state)))
            }
        }
    }

    /// Compute against an already loaded read state. Replies by the viewer never count.
    pub fn compute_with(&self, thread: &Thread, viewer: Option<(&UserId, &ReadState)>) -> Result<ReadStatus, StoreError> {
        let Some((viewer, state)) = viewer else {
            return Ok(ReadStatus { unread_count: thread.reply_count, read: false });
        };
        let last_read = state.last_read(&thread.id);
        let filter = ReplyCountFilter { exclude_author: Some(viewer), updated_since: last_read };
        let unread = self.store.count_replies(&thread.id, &filter)?;
        let read = last_read.map_or(false, |lr| lr >= thread.updated_at);
        Ok(ReadStatus { unread_count: unread.min(thread.reply_count), read })
    }
}
