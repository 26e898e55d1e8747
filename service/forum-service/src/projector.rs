use std::collections::HashMap;

use chrono::{DateTime, Utc};
use forum_model::{ReadState, Reply, Thread, ThreadId, UserId, VoteSummary};
use forum_store::{ForumStore, SearchHit};
use serde::Serialize;

use crate::query::ProjectionOptions;
use crate::read_state::ReadStateCalculator;
use crate::ServiceError;

/// Output representation of a thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadDoc {
    pub id: String,
    pub title: String,
    pub body: String,
    pub course_id: String,
    pub anonymous: bool,
    pub anonymous_to_peers: bool,
    pub commentable_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub at_position_list: Vec<i64>,
    pub closed: bool,
    pub pinned: bool,
    pub user_id: Option<UserId>,
    /// Empty for anonymous threads and missing authors.
    pub username: String,
    pub votes: VoteSummary,
    pub abuse_flaggers: Vec<UserId>,
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub doc_type: &'static str,
    pub group_id: Option<i64>,
    pub endorsed: bool,
    pub comments_count: u64,
    pub unread_comments_count: u64,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlighted_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlighted_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ReplyDoc>>,
}

/// Output representation of a reply, nested under its parent in recursive mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyDoc {
    pub id: String,
    pub thread_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub body: String,
    pub course_id: String,
    pub anonymous: bool,
    pub anonymous_to_peers: bool,
    pub endorsed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: UserId,
    pub username: String,
    pub votes: VoteSummary,
    pub abuse_flaggers: Vec<UserId>,
    #[serde(rename = "type")]
    pub doc_type: &'static str,
    pub children: Vec<ReplyDoc>,
}

pub struct DocumentProjector<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ForumStore + ?Sized> DocumentProjector<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Project search hits in hit order. A hit whose thread is gone is `NotFound`.
    pub fn project_hits(&self, hits: &[SearchHit], opts: &ProjectionOptions) -> Result<Vec<ThreadDoc>, ServiceError> {
        let ids: Vec<ThreadId> = hits.iter().map(|h| ThreadId(h.id.clone())).collect();
        let mut threads: HashMap<ThreadId, Thread> =
            self.store.get_threads_by_ids(&ids)?.into_iter().map(|t| (t.id.clone(), t)).collect();
        let mut states: HashMap<String, ReadState> = HashMap::new();
        let mut docs = Vec::with_capacity(hits.len());
        for (hit, id) in hits.iter().zip(ids) {
            let thread = threads.remove(&id).ok_or_else(|| ServiceError::NotFound(format!("thread {id}")))?;
            let mut doc = self.project_with_states(&thread, opts, &mut states)?;
            doc.highlighted_title = Some(hit.highlighted_title.clone());
            doc.highlighted_body = Some(hit.highlighted_body.clone());
            docs.push(doc);
        }
        Ok(docs)
    }

    pub fn project_thread(&self, thread: &Thread, opts: &ProjectionOptions) -> Result<ThreadDoc, ServiceError> {
        self.project_with_states(thread, opts, &mut HashMap::new())
    }

    /// `states` memoises the viewer's read state per course within one request.
    fn project_with_states(
        &self,
        thread: &Thread,
        opts: &ProjectionOptions,
        states: &mut HashMap<String, ReadState>,
    ) -> Result<ThreadDoc, ServiceError> {
        let calculator = ReadStateCalculator::new(self.store);
        let status = match &opts.user_id {
            None => calculator.compute_with(thread, None)?,
            Some(viewer) => {
                if !states.contains_key(&thread.course_id) {
                    let state = self.store.find_or_create_read_state(viewer, &thread.course_id)?;
                    states.insert(thread.course_id.clone(), state);
                }
                calculator.compute_with(thread, Some(viewer).zip(states.get(&thread.course_id)))?
            }
        };
        let username = match &thread.author_id {
            Some(author) if !thread.anonymous => self.store.username(author)?.unwrap_or_default(),
            _ => String::new(),
        };
        let children = if opts.recursive {
            let roots = self.store.root_replies(&thread.id)?;
            let mut out = Vec::with_capacity(roots.len());
            for r in &roots {
                out.push(self.project_reply(r)?);
            }
            Some(out)
        } else {
            None
        };
        Ok(ThreadDoc {
            id: thread.id.0.clone(),
            title: thread.title.clone(),
            body: thread.body.clone(),
            course_id: thread.course_id.clone(),
            anonymous: thread.anonymous,
            anonymous_to_peers: thread.anonymous_to_peers,
            commentable_id: thread.commentable_id.clone(),
            created_at: thread.created_at,
            updated_at: thread.updated_at,
            at_position_list: thread.at_position_list.clone(),
            closed: thread.closed,
            pinned: thread.pinned,
            user_id: thread.author_id.clone(),
            username,
            votes: thread.votes,
            abuse_flaggers: thread.abuse_flaggers.clone(),
            tags: thread.tags.clone(),
            doc_type: "thread",
            group_id: thread.group_id,
            endorsed: self.store.has_endorsed_reply(&thread.id)?,
            comments_count: thread.reply_count,
            unread_comments_count: status.unread_count,
            read: status.read,
            highlighted_title: None,
            highlighted_body: None,
            children,
        })
    }

    fn project_reply(&self, reply: &Reply) -> Result<ReplyDoc, ServiceError> {
        let mut children = Vec::new();
        for child in &self.store.child_replies(&reply.id)? {
            children.push(self.project_reply(child)?);
        }
        let username = if reply.anonymous { String::new() } else { self.store.username(&reply.author_id)?.unwrap_or_default() };
        Ok(ReplyDoc {
            id: reply.id.0.clone(),
            thread_id: reply.thread_id.0.clone(),
            parent_id: reply.parent_id.as_ref().map(|p| p.0.clone()),
            title: reply.title.clone(),
            body: reply.body.clone(),
            course_id: reply.course_id.clone(),
            anonymous: reply.anonymous,
            anonymous_to_peers: reply.anonymous_to_peers,
            endorsed: reply.endorsed,
            created_at: reply.created_at,
            updated_at: reply.updated_at,
            user_id: reply.author_id.clone(),
            username,
            votes: reply.votes,
            abuse_flaggers: reply.abuse_flaggers.clone(),
            doc_type: "comment",
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forum_model::{ReplyId, User};
    use forum_store::sqlite_repo::SqliteRepo;
    use forum_store::ForumPrimaryStore;

    fn repo_with_thread() -> (SqliteRepo, Thread) {
        let mut repo = SqliteRepo::open_in_memory().expect("db");
        repo.upsert_user(&User { external_id: UserId("alice".into()), username: "Alice".into() }).expect("user");
        let mut t = Thread::new("t1", "Title", "Body", "course-1", "c1", Some(UserId("alice".into()))).with_tags("a, b");
        t.pre_create(Utc::now()).expect("valid");
        repo.insert_thread(&t).expect("insert");
        (repo, t)
    }

    fn hit(id: &str) -> SearchHit {
        SearchHit { id: id.into(), score: None, highlighted_title: "T".into(), highlighted_body: "B".into() }
    }

    #[test]
    fn thread_doc_fields() {
        let (repo, t) = repo_with_thread();
        let doc = DocumentProjector::new(&repo).project_thread(&t, &ProjectionOptions::default()).expect("project");
        assert_eq!(doc.username, "Alice");
        assert_eq!(doc.doc_type, "thread");
        assert_eq!(doc.tags, vec!["a".to_string(), "b".to_string()]);
        assert!(!doc.endorsed);
        assert!(doc.children.is_none());
        let json = serde_json::to_value(&doc).expect("json");
        assert_eq!(json["type"], "thread");
        assert!(json.get("highlighted_title").is_none());
    }

    #[test]
    fn anonymous_thread_hides_username() {
        let (repo, mut t) = repo_with_thread();
        t.anonymous = true;
        let doc = DocumentProjector::new(&repo).project_thread(&t, &ProjectionOptions::default()).expect("project");
        assert_eq!(doc.username, "");
        assert_eq!(doc.user_id, Some(UserId("alice".into())));
    }

    #[test]
    fn recursive_projection_nests_children() {
        let (mut repo, t) = repo_with_thread();
        let mut root = Reply::new("r1", t.id.clone(), UserId("bob".into()), "root", "course-1");
        root.endorsed = true;
        repo.insert_reply(&root).expect("root");
        let mut child = Reply::new("r2", t.id.clone(), UserId("carol".into()), "child", "course-1");
        child.parent_id = Some(ReplyId("r1".into()));
        repo.insert_reply(&child).expect("child");

        let opts = ProjectionOptions { recursive: true, user_id: None };
        let doc = DocumentProjector::new(&repo).project_thread(&t, &opts).expect("project");
        let children = doc.children.expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].doc_type, "comment");
        assert_eq!(children[0].children[0].id, "r2");
        assert!(doc.endorsed);
    }

    #[test]
    fn hits_keep_order_and_highlights() {
        let (mut repo, _) = repo_with_thread();
        let mut t2 = Thread::new("t2", "Other", "Body", "course-1", "c1", Some(UserId("alice".into())));
        t2.pre_create(Utc::now()).expect("valid");
        repo.insert_thread(&t2).expect("insert");
        let docs = DocumentProjector::new(&repo)
            .project_hits(&[hit("t2"), hit("t1")], &ProjectionOptions::default())
            .expect("project");
        assert_eq!(docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["t2", "t1"]);
        assert_eq!(docs[0].highlighted_title.as_deref(), Some("T"));
    }

    #[test]
    fn missing_thread_is_not_found() {
        let (repo, _) = repo_with_thread();
        let err = DocumentProjector::new(&repo)
            .project_hits(&[hit("gone")], &ProjectionOptions::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn viewer_read_state_is_created_once_per_course() {
        let (repo, t) = repo_with_thread();
        let viewer = UserId("viewer".into());
        let opts = ProjectionOptions { recursive: false, user_id: Some(viewer.clone()) };
        let docs = DocumentProjector::new(&repo).project_hits(&[hit("t1")], &opts).expect("project");
        assert_eq!(docs[0].unread_comments_count, 0);
        assert!(!docs[0].read);
        assert_eq!(repo.read_state_count(&viewer, &t.course_id).expect("count"), 1);
    }
}
