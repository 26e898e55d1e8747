//! Shared forum models used across crates

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Stable identifier of a thread (also its id in the thread index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

/// Stable identifier of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyId(pub String);

/// External (caller-visible) user id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Tallied votes as maintained by the voting subsystem (read-only here).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSummary {
    pub count: i64,
    pub up_count: i64,
    pub down_count: i64,
    pub point: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} can't be blank")]
    MissingField(&'static str),
    #[error("tag {0:?} can consist of words, numbers, dashes and spaces only and cannot start with dash")]
    InvalidTag(String),
    #[error("tags must be unique (duplicate {0:?})")]
    DuplicateTag(String),
}

/// A top-level discussion topic within a course/commentable scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub title: String,
    pub body: String,
    pub course_id: String,
    pub commentable_id: String,
    /// Ordered, case-sensitive.
    pub tags: Vec<String>,
    /// `None` means visible to every group.
    pub group_id: Option<i64>,
    pub author_id: Option<UserId>,
    pub anonymous: bool,
    pub anonymous_to_peers: bool,
    pub closed: bool,
    pub pinned: bool,
    pub at_position_list: Vec<i64>,
    pub abuse_flaggers: Vec<UserId>,
    pub reply_count: u64,
    pub votes: VoteSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Thread {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        course_id: impl Into<String>,
        commentable_id: impl Into<String>,
        author_id: Option<UserId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ThreadId(id.into()),
            title: title.into(),
            body: body.into(),
            course_id: course_id.into(),
            commentable_id: commentable_id.into(),
            tags: Vec::new(),
            group_id: None,
            author_id,
            anonymous: false,
            anonymous_to_peers: false,
            closed: false,
            pinned: false,
            at_position_list: Vec::new(),
            abuse_flaggers: Vec::new(),
            reply_count: 0,
            votes: VoteSummary::default(),
            created_at: now,
            updated_at: now,
            last_activity_at: None,
        }
    }

    /// Replace the tag list from a comma-separated string (e.g. `"a, b c"`).
    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = parse_tags(tags);
        self
    }

    pub fn with_group(mut self, group_id: Option<i64>) -> Self {
        self.group_id = group_id;
        self
    }

    /// Check required fields and the tag list.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("title", &self.title)?;
        require("body", &self.body)?;
        require("course_id", &self.course_id)?;
        require("commentable_id", &self.commentable_id)?;
        match &self.author_id {
            Some(a) if !a.0.trim().is_empty() => {}
            _ => return Err(ValidationError::MissingField("author")),
        }
        validate_tags(&self.tags)
    }

    /// Lifecycle hook run before the first insert.
    pub fn pre_create(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.validate()?;
        self.created_at = now;
        self.updated_at = now;
        if self.last_activity_at.is_none() {
            self.last_activity_at = Some(now);
        }
        Ok(())
    }

    /// Lifecycle hook run before an update replaces `previous`.
    ///
    /// Activity is bumped unless the update only toggles `closed` or sets the
    /// activity time explicitly.
    pub fn pre_update(&mut self, previous: &Thread, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.validate()?;
        self.created_at = previous.created_at;
        self.updated_at = now;
        let closed_changed = self.closed != previous.closed;
        let activity_changed = self.last_activity_at != previous.last_activity_at;
        if !closed_changed && !activity_changed {
            self.last_activity_at = Some(now);
        }
        Ok(())
    }
}

/// A response attached to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: ReplyId,
    pub thread_id: ThreadId,
    /// `None` for top-level replies.
    pub parent_id: Option<ReplyId>,
    pub author_id: UserId,
    pub title: String,
    pub body: String,
    pub course_id: String,
    pub anonymous: bool,
    pub anonymous_to_peers: bool,
    pub endorsed: bool,
    pub abuse_flaggers: Vec<UserId>,
    pub votes: VoteSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reply {
    pub fn new(
        id: impl Into<String>,
        thread_id: ThreadId,
        author_id: UserId,
        body: impl Into<String>,
        course_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReplyId(id.into()),
            thread_id,
            parent_id: None,
            author_id,
            title: String::new(),
            body: body.into(),
            course_id: course_id.into(),
            anonymous: false,
            anonymous_to_peers: false,
            endorsed: false,
            abuse_flaggers: Vec::new(),
            votes: VoteSummary::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require("body", &self.body)?;
        require("course_id", &self.course_id)?;
        require("thread_id", &self.thread_id.0)?;
        require("author", &self.author_id.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub external_id: UserId,
    pub username: String,
}

/// Per-viewer, per-course record of last-read timestamps keyed by thread.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadState {
    pub user_id: UserId,
    pub course_id: String,
    pub last_read_times: BTreeMap<ThreadId, DateTime<Utc>>,
}

impl ReadState {
    pub fn new(user_id: UserId, course_id: impl Into<String>) -> Self {
        Self { user_id, course_id: course_id.into(), last_read_times: BTreeMap::new() }
    }

    pub fn last_read(&self, thread_id: &ThreadId) -> Option<DateTime<Utc>> {
        self.last_read_times.get(thread_id).copied()
    }
}

// word: head char, optional (middle chars then end chars), optional trailing '+'
static RE_TAG: Lazy<Regex> = Lazy::new(|| {
    let word = r"[a-z0-9](?:(?:[a-z0-9\-#.]*[a-z0-9#]+)?\+*)?";
    Regex::new(&format!("^{word}(?: {word})*$")).expect("tag grammar compiles")
});

pub fn tag_name_valid(tag: &str) -> bool {
    RE_TAG.is_match(tag)
}

/// Split a comma-separated tag string, trimming blanks and dropping empties.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(tags.len());
    for tag in tags {
        if !tag_name_valid(tag) {
            return Err(ValidationError::InvalidTag(tag.clone()));
        }
        if !seen.insert(tag.as_str()) {
            return Err(ValidationError::DuplicateTag(tag.clone()));
        }
    }
    Ok(())
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() { Err(ValidationError::MissingField(field)) } else { Ok(()) }
}
