use forum_model::{Reply, Thread, ThreadId, UserId};
use forum_store::tantivy_index::{IndexNames, TantivyForumIndex};
use forum_store::{
    FilterOp, IndexMaintainer, Page, Sort, SortKey, SortOrder, TextOccur, ThreadSearchOptions, ThreadSearcher,
};

fn thread(id: &str, title: &str, body: &str) -> Thread {
    Thread::new(id, title, body, "course-1", "c1", Some(UserId("alice".into())))
}

fn ids(hits: &[forum_store::SearchHit]) -> Vec<&str> {
    hits.iter().map(|h| h.id.as_str()).collect()
}

fn fixture() -> TantivyForumIndex {
    let index = TantivyForumIndex::new_ram().expect("ram index");
    let mut threads = vec![
        thread("t1", "Apple pie recipe", "bake it slowly"),
        thread("t2", "Banana bread", "ripe fruit works best"),
        thread("t3", "Apple varieties", "crisp and sweet"),
        thread("t4", "Grading policy", "late work is accepted"),
    ];
    for (i, t) in threads.iter_mut().enumerate() {
        t.reply_count = i as u64 * 3;
    }
    threads[1].group_id = Some(1);
    threads[2].group_id = Some(2);
    threads[3].tags = vec!["admin".into()];
    index.upsert_threads(&threads).expect("index threads");
    index
}

#[test]
fn text_search_highlights_stemmed_matches() {
    let index = TantivyForumIndex::new_ram().expect("ram index");
    index
        .upsert_threads(&[thread("t1", "Borrowing rules", "the borrow checker rejects aliasing")])
        .expect("index");
    let opts = ThreadSearchOptions { highlight_tag: Some("highlight".into()), ..Default::default() };
    let hits = index.search_threads(&[], Some("borrowing"), &opts).expect("search");
    assert_eq!(ids(&hits), vec!["t1"]);
    assert_eq!(hits[0].highlighted_title, "<highlight>Borrowing</highlight> rules");
    assert_eq!(hits[0].highlighted_body, "the <highlight>borrow</highlight> checker rejects aliasing");
    assert!(hits[0].score.is_some());
}

#[test]
fn group_visibility_includes_ungrouped_threads() {
    let index = fixture();
    let mut visible = index.collect_thread_ids(&[FilterOp::GroupVisible(1)], None).expect("collect");
    visible.sort();
    assert_eq!(visible, vec![ThreadId("t1".into()), ThreadId("t2".into()), ThreadId("t4".into())]);
}

#[test]
fn tag_and_commentable_filters() {
    let index = fixture();
    let tagged = index.collect_thread_ids(&[FilterOp::TagEq("admin".into())], None).expect("collect");
    assert_eq!(tagged, vec![ThreadId("t4".into())]);
    let none = index
        .collect_thread_ids(&[FilterOp::CommentableIn(vec!["other".into()])], None)
        .expect("collect");
    assert!(none.is_empty());
}

#[test]
fn sorted_pages_follow_fast_field_order() {
    let index = fixture();
    let sort = Sort { key: SortKey::CommentCount, order: SortOrder::Desc };
    let first = ThreadSearchOptions { sort: Some(sort), page: Some(Page::new(1, 3)), ..Default::default() };
    let second = ThreadSearchOptions { page: Some(Page::new(2, 3)), ..first.clone() };
    let p1 = index.search_threads(&[], None, &first).expect("page 1");
    let p2 = index.search_threads(&[], None, &second).expect("page 2");
    assert_eq!(ids(&p1), vec!["t4", "t3", "t2"]);
    assert_eq!(ids(&p2), vec!["t1"]);
    assert!(p1.iter().all(|h| h.score.is_none()));
}

#[test]
fn pages_past_the_end_are_empty() {
    let index = fixture();
    let sort = Sort { key: SortKey::CreatedAt, order: SortOrder::Asc };
    for sort in [None, Some(sort)] {
        let huge = ThreadSearchOptions { sort, page: Some(Page::new(usize::MAX / 4, 20)), ..Default::default() };
        assert!(index.search_threads(&[], None, &huge).expect("huge page").is_empty());
        let next = ThreadSearchOptions { sort, page: Some(Page::new(2, 4)), ..Default::default() };
        assert!(index.search_threads(&[], Some("apple"), &next).expect("page 2").is_empty());
    }
}

#[test]
fn highlights_ignore_filter_terms_and_group_ids() {
    let index = fixture();
    let filters = [FilterOp::GroupVisible(2), FilterOp::CourseEq("course-1".into())];
    let opts = ThreadSearchOptions { highlight_tag: Some("em".into()), ..Default::default() };
    let mut hits = index.search_threads(&filters, Some("apple"), &opts).expect("search");
    hits.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(ids(&hits), vec!["t1", "t3"]);
    assert_eq!(hits[1].highlighted_title, "<em>Apple</em> varieties");
    assert_eq!(hits[1].highlighted_body, "crisp and sweet");
}

#[test]
fn id_set_with_optional_text_ranks_matches_first() {
    let index = fixture();
    let filters = [FilterOp::ThreadIdIn(vec![ThreadId("t2".into()), ThreadId("t1".into())])];
    let opts = ThreadSearchOptions { text_occur: TextOccur::Should, ..Default::default() };
    let hits = index.search_threads(&filters, Some("apple"), &opts).expect("search");
    assert_eq!(ids(&hits), vec!["t1", "t2"]);

    let must = index.collect_thread_ids(&[], Some("apple")).expect("collect");
    assert_eq!(must, vec![ThreadId("t1".into()), ThreadId("t3".into())]);
}

#[test]
fn reply_search_respects_cap_and_course() {
    let index = TantivyForumIndex::new_ram().expect("ram index");
    let replies: Vec<Reply> = (0..5)
        .map(|i| {
            let course = if i == 4 { "course-2" } else { "course-1" };
            Reply::new(format!("r{i}"), ThreadId(format!("t{i}")), UserId("bob".into()), "quantum homework", course)
        })
        .collect();
    index.upsert_replies(&replies).expect("index replies");
    assert_eq!(index.search_replies("quantum", Some("course-1"), 10).expect("search").len(), 4);
    assert_eq!(index.search_replies("quantum", None, 2).expect("search").len(), 2);
    assert!(index.search_replies("quantum", None, 0).expect("search").is_empty());
}

#[test]
fn upsert_replaces_and_delete_removes() {
    let index = fixture();
    index.upsert_threads(&[thread("t1", "Cherry tart", "new body")]).expect("reindex");
    assert_eq!(index.thread_count(), 4);
    assert!(index.collect_thread_ids(&[], Some("cherry")).expect("collect").contains(&ThreadId("t1".into())));
    index.delete_threads(&[ThreadId("t1".into())]).expect("delete");
    assert_eq!(index.thread_count(), 3);
}

#[test]
fn on_disk_index_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let names = IndexNames::default();
    {
        let index = TantivyForumIndex::open_or_create_dir(dir.path(), &names).expect("create");
        index.upsert_threads(&[thread("t1", "Persisted", "body")]).expect("index");
    }
    assert!(dir.path().join("comment_threads").join("meta.json").exists());
    let reopened = TantivyForumIndex::open_or_create_dir(dir.path(), &names).expect("reopen");
    assert_eq!(reopened.thread_count(), 1);
}
