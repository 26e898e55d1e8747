//! Two-pass thread search over the thread and reply indexes.
//!
//! The index cannot OR a text match on replies with a term filter on threads, so
//! text searches first collect candidate thread ids from both indexes and then run
//! one bounded pass over the thread index restricted to those ids.

use std::collections::BTreeSet;

use forum_model::{ReplyId, ThreadId};
use forum_store::{FilterOp, ReplyThreadResolver, SearchHit, TextOccur, ThreadSearchOptions, ThreadSearcher};
use serde::Serialize;
use tracing::debug;

use crate::query::SearchQuery;
use crate::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergerOptions {
    pub max_deep_search_comment_count: usize,
    pub highlight_tag: Option<String>,
}

pub struct ResultMerger<'a> {
    searcher: &'a dyn ThreadSearcher,
    resolver: &'a dyn ReplyThreadResolver,
    opts: MergerOptions,
}

impl<'a> ResultMerger<'a> {
    pub fn new(searcher: &'a dyn ThreadSearcher, resolver: &'a dyn ReplyThreadResolver, opts: MergerOptions) -> Self {
        Self { searcher, resolver, opts }
    }

    /// Run the search and return one ordered page of thread hits.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, ServiceError> {
        let filters = query.thread_filters();
        let Some(text) = query.text.as_deref() else {
            // no text: the first pass is the answer
            let opts = ThreadSearchOptions { sort: query.sort, page: Some(query.page), ..Default::default() };
            let hits = self.searcher.search_threads(&filters, None, &opts)?;
            debug!(index = self.searcher.name(), hits = hits.len(), "structural thread search");
            return Ok(hits);
        };

        let direct = self.searcher.collect_thread_ids(&filters, Some(text))?;
        let reply_hits =
            self.searcher
                .search_replies(text, query.course_id.as_deref(), self.opts.max_deep_search_comment_count)?;
        let reply_ids: Vec<ReplyId> = reply_hits.into_iter().map(|h| ReplyId(h.id)).collect();
        let via_replies = self.resolver.thread_ids_for_replies(&reply_ids)?;
        debug!(direct = direct.len(), replies = reply_ids.len(), via_replies = via_replies.len(), "first pass");

        let ids: BTreeSet<ThreadId> = direct.into_iter().chain(via_replies).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // tags were checked on direct hits only; reply hits need not carry them
        let mut bounded = vec![FilterOp::ThreadIdIn(ids.into_iter().collect())];
        bounded.extend(query.bounding_filters());
        let opts = ThreadSearchOptions {
            sort: query.sort,
            page: Some(query.page),
            text_occur: TextOccur::Should,
            highlight_tag: self.opts.highlight_tag.clone(),
        };
        let hits = self.searcher.search_threads(&bounded, Some(text), &opts)?;
        debug!(hits = hits.len(), page = query.page.page, "second pass");
        Ok(hits)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::query::SearchParams;
    use forum_store::{IndexError, StoreError};
    use std::cell::RefCell;
    use std::collections::HashMap;

    pub(crate) struct FakeThread {
        pub id: &'static str,
        pub text: &'static str,
        pub tags: Vec<&'static str>,
        pub course: &'static str,
        pub group: Option<i64>,
    }

    /// Substring matching; hits come back in insertion order.
    #[derive(Default)]
    pub(crate) struct FakeIndex {
        pub threads: Vec<FakeThread>,
        pub replies: Vec<(&'static str, &'static str, &'static str)>,
        pub calls: RefCell<Vec<String>>,
    }

    impl FakeIndex {
        fn matches(t: &FakeThread, op: &FilterOp) -> bool {
            match op {
                FilterOp::TagEq(tag) => t.tags.contains(&tag.as_str()),
                FilterOp::CommentableEq(_) | FilterOp::CommentableIn(_) => true,
                FilterOp::CourseEq(c) => t.course == c,
                FilterOp::GroupVisible(g) => t.group.map_or(true, |tg| tg == *g),
                FilterOp::ThreadIdIn(ids) => ids.iter().any(|i| i.0 == t.id),
            }
        }

        fn filtered<'s>(&'s self, filters: &'s [FilterOp]) -> impl Iterator<Item = &'s FakeThread> + 's {
            self.threads.iter().filter(move |t| filters.iter().all(|f| Self::matches(t, f)))
        }
    }

    impl ThreadSearcher for FakeIndex {
        fn name(&self) -> &'static str { "fake" }

        fn search_threads(
            &self,
            filters: &[FilterOp],
            text: Option<&str>,
            opts: &ThreadSearchOptions,
        ) -> Result<Vec<SearchHit>, IndexError> {
            self.calls.borrow_mut().push(format!("threads page={:?} occur={:?}", opts.page.map(|p| p.page), opts.text_occur));
            let mut hits: Vec<(bool, &FakeThread)> = self
                .filtered(filters)
                .map(|t| (text.map_or(true, |q| t.text.contains(q)), t))
                .filter(|(m, _)| *m || opts.text_occur == TextOccur::Should)
                .collect();
            // matches rank ahead of non-matches
            hits.sort_by_key(|(m, _)| !*m);
            let (skip, take) = opts.page.map_or((0, usize::MAX), |p| (p.offset(), p.per_page));
            Ok(hits
                .into_iter()
                .skip(skip)
                .take(take)
                .map(|(_, t)| SearchHit {
                    id: t.id.to_string(),
                    score: Some(1.0),
                    highlighted_title: t.text.to_string(),
                    highlighted_body: String::new(),
                })
                .collect())
        }

        fn collect_thread_ids(&self, filters: &[FilterOp], text: Option<&str>) -> Result<Vec<ThreadId>, IndexError> {
            self.calls.borrow_mut().push("collect".into());
            Ok(self
                .filtered(filters)
                .filter(|t| text.map_or(true, |q| t.text.contains(q)))
                .map(|t| ThreadId(t.id.to_string()))
                .collect())
        }

        fn search_replies(&self, text: &str, course_id: Option<&str>, max_count: usize) -> Result<Vec<SearchHit>, IndexError> {
            self.calls.borrow_mut().push(format!("replies max={max_count}"));
            Ok(self
                .replies
                .iter()
                .filter(|(_, _, body)| body.contains(text))
                .filter(|(rid, _, _)| course_id.map_or(true, |c| self.reply_course(rid) == c))
                .take(max_count)
                .map(|(rid, _, body)| SearchHit {
                    id: rid.to_string(),
                    score: Some(1.0),
                    highlighted_title: String::new(),
                    highlighted_body: body.to_string(),
                })
                .collect())
        }
    }

    impl FakeIndex {
        fn reply_course(&self, reply_id: &str) -> &'static str {
            self.replies
                .iter()
                .find(|(rid, _, _)| *rid == reply_id)
                .and_then(|(_, tid, _)| self.threads.iter().find(|t| t.id == *tid))
                .map_or("", |t| t.course)
        }
    }

    impl ReplyThreadResolver for FakeIndex {
        fn thread_ids_for_replies(&self, ids: &[ReplyId]) -> Result<Vec<ThreadId>, StoreError> {
            let owners: HashMap<&str, &str> = self.replies.iter().map(|(r, t, _)| (*r, *t)).collect();
            Ok(ids.iter().filter_map(|r| owners.get(r.0.as_str())).map(|t| ThreadId(t.to_string())).collect())
        }
    }

    pub(crate) fn fake_thread(id: &'static str, text: &'static str) -> FakeThread {
        FakeThread { id, text, tags: Vec::new(), course: "course-1", group: None }
    }

    fn opts(max: usize) -> MergerOptions {
        MergerOptions { max_deep_search_comment_count: max, highlight_tag: Some("highlight".into()) }
    }

    fn query(p: SearchParams) -> SearchQuery {
        SearchQuery::from_params(&p, 20).expect("query")
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn direct_and_reply_matches_appear_once() {
        let index = FakeIndex {
            threads: vec![fake_thread("T1", "quantum basics"), fake_thread("T2", "homework help")],
            replies: vec![("r1", "T2", "try quantum tunnelling"), ("r2", "T1", "quantum again")],
            ..Default::default()
        };
        let merger = ResultMerger::new(&index, &index, opts(100));
        let hits = merger.search(&query(SearchParams { text: Some("quantum".into()), ..Default::default() })).expect("search");
        assert_eq!(ids(&hits), vec!["T1", "T2"]);
    }

    #[test]
    fn pagination_is_deferred_to_the_bounded_pass() {
        let index = FakeIndex {
            threads: vec![fake_thread("T1", "quantum"), fake_thread("T2", "other")],
            ..Default::default()
        };
        let merger = ResultMerger::new(&index, &index, opts(7));
        merger
            .search(&query(SearchParams { text: Some("quantum".into()), page: Some(2), ..Default::default() }))
            .expect("search");
        assert_eq!(
            *index.calls.borrow(),
            vec!["collect".to_string(), "replies max=7".to_string(), "threads page=Some(2) occur=Should".to_string()]
        );
    }

    #[test]
    fn structural_search_is_a_single_paged_pass() {
        let index = FakeIndex { threads: vec![fake_thread("T1", "a")], ..Default::default() };
        let merger = ResultMerger::new(&index, &index, opts(7));
        let hits = merger.search(&query(SearchParams::default())).expect("search");
        assert_eq!(ids(&hits), vec!["T1"]);
        assert_eq!(*index.calls.borrow(), vec!["threads page=Some(1) occur=Must".to_string()]);
    }

    #[test]
    fn no_candidates_means_empty_result() {
        let index = FakeIndex { threads: vec![fake_thread("T1", "a")], ..Default::default() };
        let merger = ResultMerger::new(&index, &index, opts(7));
        let hits = merger.search(&query(SearchParams { text: Some("zzz".into()), ..Default::default() })).expect("search");
        assert!(hits.is_empty());
        assert_eq!(index.calls.borrow().len(), 2);
    }

    #[test]
    fn group_filter_applies_to_threads_reached_through_replies() {
        let mut hidden = fake_thread("T2", "unrelated");
        hidden.group = Some(9);
        let index = FakeIndex {
            threads: vec![fake_thread("T1", "quantum"), hidden],
            replies: vec![("r1", "T2", "quantum reply")],
            ..Default::default()
        };
        let merger = ResultMerger::new(&index, &index, opts(100));
        let p = SearchParams { text: Some("quantum".into()), group_id: Some(1), ..Default::default() };
        assert_eq!(ids(&merger.search(&query(p)).expect("search")), vec!["T1"]);
    }

    #[test]
    fn tag_filter_does_not_drop_threads_reached_through_replies() {
        let mut tagged = fake_thread("T1", "quantum basics");
        tagged.tags = vec!["a"];
        let index = FakeIndex {
            threads: vec![tagged, fake_thread("T2", "homework help"), fake_thread("T3", "quantum untagged")],
            replies: vec![("r1", "T2", "quantum tunnelling")],
            ..Default::default()
        };
        let merger = ResultMerger::new(&index, &index, opts(100));
        let p = SearchParams { text: Some("quantum".into()), tags: Some("a".into()), ..Default::default() };
        assert_eq!(ids(&merger.search(&query(p)).expect("search")), vec!["T1", "T2"]);
    }

    #[test]
    fn second_page_of_twelve_holds_ranks_six_to_ten() {
        let names = ["t01", "t02", "t03", "t04", "t05", "t06", "t07", "t08", "t09", "t10", "t11", "t12"];
        let index = FakeIndex { threads: names.iter().map(|n| fake_thread(n, "physics")).collect(), ..Default::default() };
        let merger = ResultMerger::new(&index, &index, opts(100));
        let p = SearchParams { text: Some("physics".into()), page: Some(2), per_page: Some(5), ..Default::default() };
        assert_eq!(ids(&merger.search(&query(p)).expect("search")), vec!["t06", "t07", "t08", "t09", "t10"]);
    }

    #[test]
    fn reply_cap_is_passed_through() {
        let index = FakeIndex {
            threads: vec![fake_thread("T1", "x"), fake_thread("T2", "y")],
            replies: vec![("r1", "T1", "quantum"), ("r2", "T2", "quantum")],
            ..Default::default()
        };
        let merger = ResultMerger::new(&index, &index, opts(1));
        let p = SearchParams { text: Some("quantum".into()), ..Default::default() };
        assert_eq!(ids(&merger.search(&query(p)).expect("search")), vec!["T1"]);
    }
}
