//! Tantivy-backed Index Gateway with one index for threads and one for replies.

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::Path;

use forum_model::{Reply, ReplyId, Thread, ThreadId};
use serde::{Deserialize, Serialize};
use tantivy::collector::{DocSetCollector, TopDocs};
use tantivy::query::{AllQuery, BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, TermQuery, TermSetQuery};
use tantivy::schema::Value as _;
use tantivy::schema::{
    Field, IndexRecordOption, NumericOptions, Schema, TextFieldIndexing, TextOptions, STORED, STRING, TEXT,
};
use tantivy::tokenizer::{TextAnalyzer, TokenStream};
use tantivy::{DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, Score, TantivyDocument, Term};
use tracing::{debug, info};

use crate::{
    FilterOp, IndexError, IndexMaintainer, SearchHit, SortOrder, TextOccur, ThreadSearchOptions, ThreadSearcher,
};

/// Title matches weigh this much more than body matches.
const TITLE_BOOST: Score = 5.0;
/// English stemming analyser registered by tantivy.
const TEXT_TOKENIZER: &str = "en_stem";
/// `group_scope` value of threads visible to every group.
const GROUP_SCOPE_ALL: &str = "*";
const DEFAULT_WRITER_HEAP: usize = 50_000_000;

/// Directory names of the two indexes under the index root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexNames {
    pub threads: String,
    pub replies: String,
}

impl Default for IndexNames {
    fn default() -> Self {
        Self { threads: "comment_threads".into(), replies: "comments".into() }
    }
}

#[derive(Debug, Clone, Copy)]
struct ThreadFields {
    id: Field,
    /// Exact alias of `id` used for id-set filtering.
    thread_id: Field,
    title: Field,
    body: Field,
    tags_in_text: Field,
    tags_array: Field,
    course_id: Field,
    commentable_id: Field,
    author_id: Field,
    group_id: Field,
    /// Group id, or `GROUP_SCOPE_ALL` when the thread has none.
    group_scope: Field,
    created_at: Field,
    updated_at: Field,
    last_activity_at: Field,
    comment_count: Field,
    votes_point: Field,
}

impl ThreadFields {
    fn schema() -> Schema {
        let mut b = Schema::builder();
        b.add_text_field("id", STRING | STORED);
        b.add_text_field("thread_id", STRING);
        b.add_text_field("title", text_options());
        b.add_text_field("body", text_options());
        b.add_text_field("tags_in_text", TEXT);
        b.add_text_field("tags_array", STRING | STORED);
        b.add_text_field("course_id", STRING);
        b.add_text_field("commentable_id", STRING);
        b.add_text_field("author_id", STRING);
        b.add_text_field("group_id", STRING);
        b.add_text_field("group_scope", STRING);
        for name in ["created_at", "updated_at", "last_activity_at", "comment_count", "votes_point"] {
            b.add_i64_field(name, i64_options());
        }
        b.build()
    }

    fn resolve(schema: &Schema) -> tantivy::Result<Self> {
        Ok(Self {
            id: schema.get_field("id")?,
            thread_id: schema.get_field("thread_id")?,
            title: schema.get_field("title")?,
            body: schema.get_field("body")?,
            tags_in_text: schema.get_field("tags_in_text")?,
            tags_array: schema.get_field("tags_array")?,
            course_id: schema.get_field("course_id")?,
            commentable_id: schema.get_field("commentable_id")?,
            author_id: schema.get_field("author_id")?,
            group_id: schema.get_field("group_id")?,
            group_scope: schema.get_field("group_scope")?,
            created_at: schema.get_field("created_at")?,
            updated_at: schema.get_field("updated_at")?,
            last_activity_at: schema.get_field("last_activity_at")?,
            comment_count: schema.get_field("comment_count")?,
            votes_point: schema.get_field("votes_point")?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ReplyFields {
    id: Field,
    title: Field,
    body: Field,
    course_id: Field,
}

impl ReplyFields {
    fn schema() -> Schema {
        let mut b = Schema::builder();
        b.add_text_field("id", STRING | STORED);
        b.add_text_field("title", text_options());
        b.add_text_field("body", text_options());
        b.add_text_field("course_id", STRING);
        b.build()
    }

    fn resolve(schema: &Schema) -> tantivy::Result<Self> {
        Ok(Self {
            id: schema.get_field("id")?,
            title: schema.get_field("title")?,
            body: schema.get_field("body")?,
            course_id: schema.get_field("course_id")?,
        })
    }
}

fn text_options() -> TextOptions {
    let indexing = TextFieldIndexing::default()
        .set_tokenizer(TEXT_TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    TextOptions::default().set_indexing_options(indexing).set_stored()
}

fn i64_options() -> NumericOptions {
    NumericOptions::default().set_fast().set_indexed().set_stored()
}

pub struct TantivyForumIndex {
    threads: Index,
    thread_reader: IndexReader,
    tf: ThreadFields,
    replies: Index,
    reply_reader: IndexReader,
    rf: ReplyFields,
    writer_heap_bytes: usize,
}

impl TantivyForumIndex {
    pub fn new_ram() -> Result<Self, IndexError> {
        let threads = Index::create_in_ram(ThreadFields::schema());
        let replies = Index::create_in_ram(ReplyFields::schema());
        Self::from_indexes(threads, replies)
    }

    /// Open `<root>/<names.threads>` and `<root>/<names.replies>`, creating them when absent.
    pub fn open_or_create_dir(root: &Path, names: &IndexNames) -> Result<Self, IndexError> {
        let threads = open_or_create(&root.join(&names.threads), ThreadFields::schema())?;
        let replies = open_or_create(&root.join(&names.replies), ReplyFields::schema())?;
        Self::from_indexes(threads, replies)
    }

    fn from_indexes(threads: Index, replies: Index) -> Result<Self, IndexError> {
        let tf = ThreadFields::resolve(&threads.schema())?;
        let rf = ReplyFields::resolve(&replies.schema())?;
        let thread_reader: IndexReader = threads.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        let reply_reader: IndexReader = replies.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        Ok(Self { threads, thread_reader, tf, replies, reply_reader, rf, writer_heap_bytes: DEFAULT_WRITER_HEAP })
    }

    pub fn with_writer_heap(mut self, bytes: usize) -> Self {
        self.writer_heap_bytes = bytes;
        self
    }

    pub fn thread_count(&self) -> u64 { self.thread_reader.searcher().num_docs() }

    pub fn reply_count(&self) -> u64 { self.reply_reader.searcher().num_docs() }

    fn writer(&self, index: &Index) -> Result<IndexWriter, IndexError> {
        Ok(index.writer_with_num_threads(1, self.writer_heap_bytes)?)
    }

    fn thread_doc(&self, t: &Thread) -> TantivyDocument {
        let f = &self.tf;
        let mut doc = TantivyDocument::default();
        doc.add_text(f.id, &t.id.0);
        doc.add_text(f.thread_id, &t.id.0);
        doc.add_text(f.title, &t.title);
        doc.add_text(f.body, &t.body);
        for tag in &t.tags {
            doc.add_text(f.tags_in_text, tag);
            doc.add_text(f.tags_array, tag);
        }
        doc.add_text(f.course_id, &t.course_id);
        doc.add_text(f.commentable_id, &t.commentable_id);
        if let Some(author) = &t.author_id {
            doc.add_text(f.author_id, &author.0);
        }
        match t.group_id {
            Some(g) => {
                let g = g.to_string();
                doc.add_text(f.group_id, &g);
                doc.add_text(f.group_scope, &g);
            }
            None => doc.add_text(f.group_scope, GROUP_SCOPE_ALL),
        }
        doc.add_i64(f.created_at, t.created_at.timestamp_micros());
        doc.add_i64(f.updated_at, t.updated_at.timestamp_micros());
        doc.add_i64(f.last_activity_at, t.last_activity_at.unwrap_or(t.updated_at).timestamp_micros());
        doc.add_i64(f.comment_count, i64::try_from(t.reply_count).unwrap_or(i64::MAX));
        doc.add_i64(f.votes_point, t.votes.point);
        doc
    }

    fn reply_doc(&self, r: &Reply) -> TantivyDocument {
        let f = &self.rf;
        let mut doc = TantivyDocument::default();
        doc.add_text(f.id, &r.id.0);
        doc.add_text(f.title, &r.title);
        doc.add_text(f.body, &r.body);
        doc.add_text(f.course_id, &r.course_id);
        doc
    }

    fn parse_text(&self, index: &Index, title: Field, body: Field, text: &str) -> Box<dyn Query> {
        let mut parser = QueryParser::for_index(index, vec![title, body]);
        parser.set_field_boost(title, TITLE_BOOST);
        let (query, errors) = parser.parse_query_lenient(text);
        if !errors.is_empty() {
            debug!(dropped = errors.len(), "lenient parse skipped parts of the text query");
        }
        query
    }

    fn filter_query(&self, op: &FilterOp) -> Box<dyn Query> {
        let f = &self.tf;
        match op {
            FilterOp::TagEq(tag) => term_query(f.tags_array, tag),
            FilterOp::CommentableEq(c) => term_query(f.commentable_id, c),
            FilterOp::CommentableIn(cs) => term_set(f.commentable_id, cs.iter().map(String::as_str)),
            FilterOp::CourseEq(c) => term_query(f.course_id, c),
            FilterOp::GroupVisible(g) => {
                let g = g.to_string();
                term_set(f.group_scope, [GROUP_SCOPE_ALL, g.as_str()])
            }
            FilterOp::ThreadIdIn(ids) => term_set(f.thread_id, ids.iter().map(|t| t.0.as_str())),
        }
    }

    /// Filters are constant-score so that only the text clause drives relevance.
    fn thread_query(&self, filters: &[FilterOp], text: Option<&dyn Query>, occur: TextOccur) -> Box<dyn Query> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::with_capacity(filters.len() + 2);
        let mut has_must = false;
        if let Some(q) = text {
            match occur {
                TextOccur::Must => {
                    clauses.push((Occur::Must, q.box_clone()));
                    has_must = true;
                }
                TextOccur::Should => clauses.push((Occur::Should, q.box_clone())),
            }
        }
        for op in filters {
            clauses.push((Occur::Must, Box::new(ConstScoreQuery::new(self.filter_query(op), 0.0))));
            has_must = true;
        }
        if !has_must {
            clauses.push((Occur::Must, Box::new(AllQuery)));
        }
        Box::new(BooleanQuery::new(clauses))
    }

    fn delete_ids<'a>(
        &self,
        index: &Index,
        reader: &IndexReader,
        field: Field,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<(), IndexError> {
        let mut writer = self.writer(index)?;
        for id in ids {
            writer.delete_term(Term::from_field_text(field, id));
        }
        writer.commit()?;
        reader.reload()?;
        Ok(())
    }
}

fn open_or_create(dir: &Path, schema: Schema) -> Result<Index, IndexError> {
    if dir.join("meta.json").exists() {
        Ok(Index::open_in_dir(dir)?)
    } else {
        std::fs::create_dir_all(dir).map_err(|e| IndexError::Backend(format!("{}: {e}", dir.display())))?;
        Ok(Index::create_in_dir(dir, schema)?)
    }
}

fn term_query(field: Field, value: &str) -> Box<dyn Query> {
    Box::new(TermQuery::new(Term::from_field_text(field, value), IndexRecordOption::Basic))
}

fn term_set<'a>(field: Field, values: impl IntoIterator<Item = &'a str>) -> Box<dyn Query> {
    Box::new(TermSetQuery::new(values.into_iter().map(|v| Term::from_field_text(field, v))))
}

fn stored_str(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

/// Marks the stored text of a field wherever an analysed token equals a query term.
///
/// Covers the whole field value (no fragmenting), so unmatched text is kept verbatim.
struct Highlighter {
    fields: Vec<(TextAnalyzer, BTreeSet<String>)>,
    tag: String,
}

impl Highlighter {
    fn new(index: &Index, query: &dyn Query, fields: &[Field], tag: &str) -> tantivy::Result<Self> {
        let mut slots = Vec::with_capacity(fields.len());
        for &field in fields {
            let mut terms = BTreeSet::new();
            query.query_terms(&mut |term: &Term, _positions| {
                if term.field() == field {
                    if let Some(text) = term.value().as_str() {
                        terms.insert(text.to_string());
                    }
                }
            });
            slots.push((index.tokenizer_for_field(field)?, terms));
        }
        Ok(Self { fields: slots, tag: tag.to_string() })
    }

    /// `None` when nothing in `text` matched.
    fn highlight(&mut self, slot: usize, text: &str) -> Option<String> {
        let (analyzer, terms) = self.fields.get_mut(slot)?;
        if terms.is_empty() {
            return None;
        }
        let mut ranges = Vec::new();
        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            let token = stream.token();
            if terms.contains(&token.text) {
                ranges.push(token.offset_from..token.offset_to);
            }
        }
        if ranges.is_empty() { None } else { Some(wrap_ranges(text, &ranges, &self.tag)) }
    }
}

/// Wrap each byte range of `text` in `<tag>`..`</tag>`. Ranges must be ascending;
/// overlapping ones are skipped.
pub fn wrap_ranges(text: &str, ranges: &[Range<usize>], tag: &str) -> String {
    let mut out = String::with_capacity(text.len() + ranges.len() * (tag.len() * 2 + 5));
    let mut cursor = 0;
    for r in ranges {
        if r.start < cursor || r.end > text.len() || r.start >= r.end {
            continue;
        }
        out.push_str(&text[cursor..r.start]);
        out.push('<');
        out.push_str(tag);
        out.push('>');
        out.push_str(&text[r.start..r.end]);
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
        cursor = r.end;
    }
    out.push_str(&text[cursor..]);
    out
}

impl ThreadSearcher for TantivyForumIndex {
    fn name(&self) -> &'static str { "tantivy" }

    fn search_threads(
        &self,
        filters: &[FilterOp],
        text: Option<&str>,
        opts: &ThreadSearchOptions,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let text_query = text
            .filter(|t| !t.trim().is_empty())
            .map(|t| self.parse_text(&self.threads, self.tf.title, self.tf.body, t));
        let query = self.thread_query(filters, text_query.as_deref(), opts.text_occur);
        let searcher = self.thread_reader.searcher();
        let num_docs = usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX);

        let (limit, offset) = match opts.page {
            Some(p) => (p.per_page, p.offset()),
            None => (num_docs, 0),
        };
        if offset >= num_docs && offset > 0 {
            debug!(offset, num_docs, "page starts past the last document");
            return Ok(Vec::new());
        }
        let limit = limit.min(num_docs).max(1);

        let ranked: Vec<(Option<Score>, DocAddress)> = match opts.sort {
            Some(sort) => {
                let order = match sort.order {
                    SortOrder::Asc => Order::Asc,
                    SortOrder::Desc => Order::Desc,
                };
                let collector = TopDocs::with_limit(limit)
                    .and_offset(offset)
                    .order_by_fast_field::<i64>(sort.key.field_name(), order);
                searcher.search(&*query, &collector)?.into_iter().map(|(_, addr)| (None, addr)).collect()
            }
            None => searcher
                .search(&*query, &TopDocs::with_limit(limit).and_offset(offset))?
                .into_iter()
                .map(|(score, addr)| (Some(score), addr))
                .collect(),
        };

        let mut highlighter = match (text_query.as_deref(), opts.highlight_tag.as_deref()) {
            (Some(q), Some(tag)) => {
                Some(Highlighter::new(&self.threads, q, &[self.tf.title, self.tf.body], tag)?)
            }
            _ => None,
        };

        let mut hits = Vec::with_capacity(ranked.len());
        for (score, addr) in ranked {
            let doc: TantivyDocument = searcher.doc(addr)?;
            let title = stored_str(&doc, self.tf.title);
            let body = stored_str(&doc, self.tf.body);
            let (highlighted_title, highlighted_body) = match highlighter.as_mut() {
                Some(h) => (
                    h.highlight(0, &title).unwrap_or(title),
                    h.highlight(1, &body).unwrap_or(body),
                ),
                None => (title, body),
            };
            hits.push(SearchHit { id: stored_str(&doc, self.tf.id), score, highlighted_title, highlighted_body });
        }
        debug!(filters = filters.len(), text = text.is_some(), hits = hits.len(), "thread index search");
        Ok(hits)
    }

    fn collect_thread_ids(&self, filters: &[FilterOp], text: Option<&str>) -> Result<Vec<ThreadId>, IndexError> {
        let text_query = text
            .filter(|t| !t.trim().is_empty())
            .map(|t| self.parse_text(&self.threads, self.tf.title, self.tf.body, t));
        let query = self.thread_query(filters, text_query.as_deref(), TextOccur::Must);
        let searcher = self.thread_reader.searcher();
        let addrs = searcher.search(&*query, &DocSetCollector)?;
        let mut ids = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let doc: TantivyDocument = searcher.doc(addr)?;
            ids.push(ThreadId(stored_str(&doc, self.tf.id)));
        }
        ids.sort();
        Ok(ids)
    }

    fn search_replies(&self, text: &str, course_id: Option<&str>, max_count: usize) -> Result<Vec<SearchHit>, IndexError> {
        if text.trim().is_empty() || max_count == 0 {
            return Ok(Vec::new());
        }
        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Must, self.parse_text(&self.replies, self.rf.title, self.rf.body, text))];
        if let Some(course) = course_id {
            clauses.push((Occur::Must, Box::new(ConstScoreQuery::new(term_query(self.rf.course_id, course), 0.0))));
        }
        let query = BooleanQuery::new(clauses);
        let searcher = self.reply_reader.searcher();
        let top = searcher.search(&query, &TopDocs::with_limit(max_count))?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, addr) in top {
            let doc: TantivyDocument = searcher.doc(addr)?;
            hits.push(SearchHit {
                id: stored_str(&doc, self.rf.id),
                score: Some(score),
                highlighted_title: stored_str(&doc, self.rf.title),
                highlighted_body: stored_str(&doc, self.rf.body),
            });
        }
        debug!(hits = hits.len(), cap = max_count, "reply index search");
        Ok(hits)
    }
}

impl IndexMaintainer for TantivyForumIndex {
    fn upsert_threads(&self, threads: &[Thread]) -> Result<(), IndexError> {
        if threads.is_empty() { return Ok(()); }
        let mut writer = self.writer(&self.threads)?;
        for t in threads {
            writer.delete_term(Term::from_field_text(self.tf.id, &t.id.0));
            writer.add_document(self.thread_doc(t))?;
        }
        writer.commit()?;
        self.thread_reader.reload()?;
        info!(count = threads.len(), "indexed threads");
        Ok(())
    }

    fn upsert_replies(&self, replies: &[Reply]) -> Result<(), IndexError> {
        if replies.is_empty() { return Ok(()); }
        let mut writer = self.writer(&self.replies)?;
        for r in replies {
            writer.delete_term(Term::from_field_text(self.rf.id, &r.id.0));
            writer.add_document(self.reply_doc(r))?;
        }
        writer.commit()?;
        self.reply_reader.reload()?;
        info!(count = replies.len(), "indexed replies");
        Ok(())
    }

    fn delete_threads(&self, ids: &[ThreadId]) -> Result<(), IndexError> {
        if ids.is_empty() { return Ok(()); }
        self.delete_ids(&self.threads, &self.thread_reader, self.tf.id, ids.iter().map(|t| t.0.as_str()))
    }

    fn delete_replies(&self, ids: &[ReplyId]) -> Result<(), IndexError> {
        if ids.is_empty() { return Ok(()); }
        self.delete_ids(&self.replies, &self.reply_reader, self.rf.id, ids.iter().map(|r| r.0.as_str()))
    }
}
