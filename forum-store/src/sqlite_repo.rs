use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use forum_model::{ReadState, Reply, ReplyId, Thread, ThreadId, User, UserId, VoteSummary};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    ForumPrimaryStore, ForumStoreRead, ReadStateStore, ReplyCountFilter, ReplyThreadResolver, StoreError,
};

/// Upper bound on bound parameters per `IN (...)` statement.
const MAX_IN_PARAMS: usize = 500;

const THREAD_COLUMNS: &str = "thread_id, title, body, course_id, commentable_id, author_id, anonymous, \
    anonymous_to_peers, closed, pinned, group_id, tags_json, at_position_list_json, abuse_flaggers_json, \
    comment_count, votes_count, votes_up, votes_down, votes_point, created_at, updated_at, last_activity_at";

const REPLY_COLUMNS: &str = "reply_id, thread_id, parent_id, author_id, title, body, course_id, anonymous, \
    anonymous_to_peers, endorsed, abuse_flaggers_json, votes_count, votes_up, votes_down, votes_point, \
    created_at, updated_at";

/// SQLite-backed primary store for threads, replies, users and read states.
pub struct SqliteRepo {
    conn: Connection,
}

impl SqliteRepo {
    /// Open an in-memory repository and initialize schema.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self { conn };
        repo.init()?;
        Ok(repo)
    }

    /// Open a file-backed repository at `path` and initialize schema if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let repo = Self { conn };
        repo.init()?;
        Ok(repo)
    }

    /// Like [`SqliteRepo::open`], waiting at most `busy_timeout` on a locked database.
    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let repo = Self { conn };
        repo.init()?;
        Ok(repo)
    }

    fn init(&self) -> rusqlite::Result<()> {
        // Pragmas for durability and concurrency
        self.conn.pragma_update(None, "journal_mode", &"WAL")?;
        self.conn.pragma_update(None, "synchronous", &"FULL")?;
        self.conn.pragma_update(None, "foreign_keys", &"ON")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                external_id TEXT PRIMARY KEY,
                username TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                course_id TEXT NOT NULL,
                commentable_id TEXT NOT NULL,
                author_id TEXT,
                anonymous INTEGER NOT NULL,
                anonymous_to_peers INTEGER NOT NULL,
                closed INTEGER NOT NULL,
                pinned INTEGER NOT NULL,
                group_id INTEGER,
                tags_json TEXT NOT NULL,
                at_position_list_json TEXT NOT NULL,
                abuse_flaggers_json TEXT NOT NULL,
                comment_count INTEGER NOT NULL,
                votes_count INTEGER NOT NULL,
                votes_up INTEGER NOT NULL,
                votes_down INTEGER NOT NULL,
                votes_point INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_activity_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_threads_author_course ON threads(author_id, course_id);

            CREATE TABLE IF NOT EXISTS replies (
                reply_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(thread_id) ON DELETE CASCADE,
                parent_id TEXT,
                author_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                course_id TEXT NOT NULL,
                anonymous INTEGER NOT NULL,
                anonymous_to_peers INTEGER NOT NULL,
                endorsed INTEGER NOT NULL,
                abuse_flaggers_json TEXT NOT NULL,
                votes_count INTEGER NOT NULL,
                votes_up INTEGER NOT NULL,
                votes_down INTEGER NOT NULL,
                votes_point INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_replies_thread ON replies(thread_id, updated_at);
            CREATE INDEX IF NOT EXISTS idx_replies_parent ON replies(parent_id);

            -- One row per (user, course); the unique key makes find-or-create atomic
            CREATE TABLE IF NOT EXISTS read_states (
                user_id TEXT NOT NULL,
                course_id TEXT NOT NULL,
                last_read_times_json TEXT NOT NULL,
                UNIQUE(user_id, course_id)
            );
            "#,
        )?;
        Ok(())
    }

    /// Number of read-state rows for a (user, course) pair.
    pub fn read_state_count(&self, user_id: &UserId, course_id: &str) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM read_states WHERE user_id = ?1 AND course_id = ?2",
            params![user_id.0, course_id],
            |r| r.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Return (threads_count, replies_count) for debugging.
    pub fn counts(&self) -> Result<(i64, i64), StoreError> {
        let threads: i64 = self.conn.query_row("SELECT count(*) FROM threads", [], |r| r.get(0))?;
        let replies: i64 = self.conn.query_row("SELECT count(*) FROM replies", [], |r| r.get(0))?;
        Ok((threads, replies))
    }

    pub fn get_reply(&self, id: &ReplyId) -> Result<Option<Reply>, StoreError> {
        let sql = format!("SELECT {REPLY_COLUMNS} FROM replies WHERE reply_id = ?1");
        let reply = self.conn.query_row(&sql, [id.0.as_str()], row_to_reply).optional()?;
        Ok(reply)
    }

    fn query_replies(&self, sql: &str, key: &str) -> Result<Vec<Reply>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([key], row_to_reply)?;
        let mut out = Vec::new();
        for r in rows { out.push(r?); }
        Ok(out)
    }

    fn read_state_row(&self, conn: &Connection, user_id: &UserId, course_id: &str) -> Result<ReadState, StoreError> {
        // every read state has an owning user row; the username stays empty until a profile upsert
        let new_user = conn.execute(
            "INSERT INTO users (external_id, username) VALUES (?1, '') ON CONFLICT(external_id) DO NOTHING",
            params![user_id.0],
        )?;
        if new_user == 1 {
            debug!(user = %user_id, "created placeholder user for read state");
        }
        let created = conn.execute(
            "INSERT INTO read_states (user_id, course_id, last_read_times_json) VALUES (?1, ?2, '{}') \
             ON CONFLICT(user_id, course_id) DO NOTHING",
            params![user_id.0, course_id],
        )?;
        if created == 1 {
            debug!(user = %user_id, course = course_id, "created read state");
        }
        // The insert either created the row or lost to an existing one; read back either way.
        let json: String = conn.query_row(
            "SELECT last_read_times_json FROM read_states WHERE user_id = ?1 AND course_id = ?2",
            params![user_id.0, course_id],
            |r| r.get(0),
        )?;
        let raw: BTreeMap<String, String> = serde_json::from_str(&json)
            .map_err(|e| StoreError::Backend(format!("read state {user_id}/{course_id}: {e}")))?;
        let mut last_read_times = BTreeMap::new();
        for (tid, ts) in raw {
            match DateTime::parse_from_rfc3339(&ts) {
                Ok(dt) => {
                    last_read_times.insert(ThreadId(tid), dt.with_timezone(&Utc));
                }
                Err(e) => warn!(user = %user_id, thread = %tid, error = %e, "skipping unreadable last-read time"),
            }
        }
        Ok(ReadState { user_id: user_id.clone(), course_id: course_id.to_string(), last_read_times })
    }
}

impl ForumPrimaryStore for SqliteRepo {
    fn insert_thread(&mut self, thread: &Thread) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO threads ({THREAD_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        );
        self.conn.execute(
            &sql,
            params![
                thread.id.0,
                thread.title,
                thread.body,
                thread.course_id,
                thread.commentable_id,
                thread.author_id.as_ref().map(|u| u.0.as_str()),
                thread.anonymous,
                thread.anonymous_to_peers,
                thread.closed,
                thread.pinned,
                thread.group_id,
                to_json(&thread.tags)?,
                to_json(&thread.at_position_list)?,
                to_json(&thread.abuse_flaggers)?,
                i64::try_from(thread.reply_count).unwrap_or(i64::MAX),
                thread.votes.count,
                thread.votes.up_count,
                thread.votes.down_count,
                thread.votes.point,
                ts_to_sql(&thread.created_at),
                ts_to_sql(&thread.updated_at),
                thread.last_activity_at.as_ref().map(ts_to_sql),
            ],
        )?;
        Ok(())
    }

    fn update_thread(&mut self, thread: &Thread) -> Result<(), StoreError> {
        let n = self.conn.execute(
            r#"
            UPDATE threads SET
                title = ?2, body = ?3, course_id = ?4, commentable_id = ?5, author_id = ?6,
                anonymous = ?7, anonymous_to_peers = ?8, closed = ?9, pinned = ?10, group_id = ?11,
                tags_json = ?12, at_position_list_json = ?13, abuse_flaggers_json = ?14,
                votes_count = ?15, votes_up = ?16, votes_down = ?17, votes_point = ?18,
                updated_at = ?19, last_activity_at = ?20
            WHERE thread_id = ?1
            "#,
            params![
                thread.id.0,
                thread.title,
                thread.body,
                thread.course_id,
                thread.commentable_id,
                thread.author_id.as_ref().map(|u| u.0.as_str()),
                thread.anonymous,
                thread.anonymous_to_peers,
                thread.closed,
                thread.pinned,
                thread.group_id,
                to_json(&thread.tags)?,
                to_json(&thread.at_position_list)?,
                to_json(&thread.abuse_flaggers)?,
                thread.votes.count,
                thread.votes.up_count,
                thread.votes.down_count,
                thread.votes.point,
                ts_to_sql(&thread.updated_at),
                thread.last_activity_at.as_ref().map(ts_to_sql),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("thread {}", thread.id)));
        }
        Ok(())
    }

    fn insert_reply(&mut self, reply: &Reply) -> Result<(), StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let bumped = tx.execute(
            "UPDATE threads SET comment_count = comment_count + 1, last_activity_at = ?2 WHERE thread_id = ?1",
            params![reply.thread_id.0, ts_to_sql(&reply.created_at)],
        )?;
        if bumped == 0 {
            return Err(StoreError::NotFound(format!("thread {}", reply.thread_id)));
        }
        let sql = format!(
            "INSERT INTO replies ({REPLY_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        );
        tx.execute(
            &sql,
            params![
                reply.id.0,
                reply.thread_id.0,
                reply.parent_id.as_ref().map(|p| p.0.as_str()),
                reply.author_id.0,
                reply.title,
                reply.body,
                reply.course_id,
                reply.anonymous,
                reply.anonymous_to_peers,
                reply.endorsed,
                to_json(&reply.abuse_flaggers)?,
                reply.votes.count,
                reply.votes.up_count,
                reply.votes.down_count,
                reply.votes.point,
                ts_to_sql(&reply.created_at),
                ts_to_sql(&reply.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_thread(&mut self, id: &ThreadId) -> Result<Vec<ReplyId>, StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reply_ids = {
            let mut stmt = tx.prepare("SELECT reply_id FROM replies WHERE thread_id = ?1")?;
            let rows = stmt.query_map([id.0.as_str()], |r| Ok(ReplyId(r.get(0)?)))?;
            let mut out = Vec::new();
            for r in rows { out.push(r?); }
            out
        };
        // replies go with the thread via ON DELETE CASCADE
        let n = tx.execute("DELETE FROM threads WHERE thread_id = ?1", [id.0.as_str()])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("thread {id}")));
        }
        tx.commit()?;
        Ok(reply_ids)
    }

    fn upsert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO users (external_id, username) VALUES (?1, ?2) \
             ON CONFLICT(external_id) DO UPDATE SET username = excluded.username",
            params![user.external_id.0, user.username],
        )?;
        Ok(())
    }
}

impl ReplyThreadResolver for SqliteRepo {
    fn thread_ids_for_replies(&self, ids: &[ReplyId]) -> Result<Vec<ThreadId>, StoreError> {
        let mut owners: HashMap<String, String> = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT reply_id, thread_id FROM replies WHERE reply_id IN {}",
                placeholders(batch.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let keys: Vec<&str> = batch.iter().map(|r| r.0.as_str()).collect();
            let rows = stmt.query_map(rusqlite::params_from_iter(keys.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for r in rows {
                let (rid, tid) = r?;
                owners.insert(rid, tid);
            }
        }
        // Preserve requested order
        Ok(ids.iter().filter_map(|r| owners.get(&r.0).cloned().map(ThreadId)).collect())
    }
}

impl ForumStoreRead for SqliteRepo {
    fn get_thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = ?1");
        let thread = self.conn.query_row(&sql, [id.0.as_str()], row_to_thread).optional()?;
        Ok(thread)
    }

    fn get_threads_by_ids(&self, ids: &[ThreadId]) -> Result<Vec<Thread>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut map: HashMap<String, Thread> = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id IN {}",
                placeholders(batch.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let keys: Vec<&str> = batch.iter().map(|t| t.0.as_str()).collect();
            let rows = stmt.query_map(rusqlite::params_from_iter(keys.iter()), row_to_thread)?;
            for r in rows {
                let thread = r?;
                map.insert(thread.id.0.clone(), thread);
            }
        }
        // Preserve requested order
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = map.remove(&id.0) { out.push(t); }
        }
        Ok(out)
    }

    fn count_replies(&self, thread_id: &ThreadId, filter: &ReplyCountFilter<'_>) -> Result<u64, StoreError> {
        let mut sql = String::from("SELECT count(*) FROM replies WHERE thread_id = ?");
        let mut params: Vec<rusqlite::types::Value> = vec![thread_id.0.clone().into()];
        if let Some(author) = filter.exclude_author {
            sql.push_str(" AND author_id <> ?");
            params.push(author.0.clone().into());
        }
        if let Some(since) = filter.updated_since {
            sql.push_str(" AND updated_at >= ?");
            params.push(ts_to_sql(&since).into());
        }
        let n: i64 = self.conn.query_row(&sql, rusqlite::params_from_iter(params.into_iter()), |r| r.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn has_endorsed_reply(&self, thread_id: &ThreadId) -> Result<bool, StoreError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM replies WHERE thread_id = ?1 AND endorsed = 1)",
            [thread_id.0.as_str()],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    fn root_replies(&self, thread_id: &ThreadId) -> Result<Vec<Reply>, StoreError> {
        let sql = format!(
            "SELECT {REPLY_COLUMNS} FROM replies WHERE thread_id = ?1 AND parent_id IS NULL ORDER BY created_at, reply_id"
        );
        self.query_replies(&sql, &thread_id.0)
    }

    fn child_replies(&self, parent_id: &ReplyId) -> Result<Vec<Reply>, StoreError> {
        let sql = format!("SELECT {REPLY_COLUMNS} FROM replies WHERE parent_id = ?1 ORDER BY created_at, reply_id");
        self.query_replies(&sql, &parent_id.0)
    }

    fn username(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        let name = self
            .conn
            .query_row("SELECT username FROM users WHERE external_id = ?1", [user_id.0.as_str()], |r| r.get(0))
            .optional()?;
        Ok(name)
    }
}

impl ReadStateStore for SqliteRepo {
    fn find_or_create_read_state(&self, user_id: &UserId, course_id: &str) -> Result<ReadState, StoreError> {
        self.read_state_row(&self.conn, user_id, course_id)
    }

    fn mark_as_read(&self, user_id: &UserId, course_id: &str, thread_id: &ThreadId, at: DateTime<Utc>) -> Result<(), StoreError> {
        // Immediate: the read-modify-write below holds the write lock throughout
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let mut state = self.read_state_row(&tx, user_id, course_id)?;
        state.last_read_times.insert(thread_id.clone(), at);
        let raw: BTreeMap<&str, String> = state
            .last_read_times
            .iter()
            .map(|(tid, ts)| (tid.0.as_str(), ts_to_sql(ts)))
            .collect();
        tx.execute(
            "UPDATE read_states SET last_read_times_json = ?3 WHERE user_id = ?1 AND course_id = ?2",
            params![user_id.0, course_id, to_json(&raw)?],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Uniform UTC text form so that SQL string comparison orders timestamps.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2 + 2);
    s.push('(');
    for i in 0..n {
        if i > 0 { s.push(','); }
        s.push('?');
    }
    s.push(')');
    s
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let author_id: Option<String> = row.get(5)?;
    let comment_count: i64 = row.get(14)?;
    let created_at: String = row.get(19)?;
    let updated_at: String = row.get(20)?;
    let last_activity_at: Option<String> = row.get(21)?;
    Ok(Thread {
        id: ThreadId(row.get(0)?),
        title: row.get(1)?,
        body: row.get(2)?,
        course_id: row.get(3)?,
        commentable_id: row.get(4)?,
        author_id: author_id.map(UserId),
        anonymous: row.get(6)?,
        anonymous_to_peers: row.get(7)?,
        closed: row.get(8)?,
        pinned: row.get(9)?,
        group_id: row.get(10)?,
        tags: json_column(row, 11)?,
        at_position_list: json_column(row, 12)?,
        abuse_flaggers: json_column(row, 13)?,
        reply_count: u64::try_from(comment_count).unwrap_or(0),
        votes: VoteSummary {
            count: row.get(15)?,
            up_count: row.get(16)?,
            down_count: row.get(17)?,
            point: row.get(18)?,
        },
        created_at: ts_from_sql(19, &created_at)?,
        updated_at: ts_from_sql(20, &updated_at)?,
        last_activity_at: last_activity_at.as_deref().map(|s| ts_from_sql(21, s)).transpose()?,
    })
}

fn row_to_reply(row: &Row<'_>) -> rusqlite::Result<Reply> {
    let parent_id: Option<String> = row.get(2)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    Ok(Reply {
        id: ReplyId(row.get(0)?),
        thread_id: ThreadId(row.get(1)?),
        parent_id: parent_id.map(ReplyId),
        author_id: UserId(row.get(3)?),
        title: row.get(4)?,
        body: row.get(5)?,
        course_id: row.get(6)?,
        anonymous: row.get(7)?,
        anonymous_to_peers: row.get(8)?,
        endorsed: row.get(9)?,
        abuse_flaggers: json_column(row, 10)?,
        votes: VoteSummary {
            count: row.get(11)?,
            up_count: row.get(12)?,
            down_count: row.get(13)?,
            point: row.get(14)?,
        },
        created_at: ts_from_sql(15, &created_at)?,
        updated_at: ts_from_sql(16, &updated_at)?,
    })
}
