use forum_model::{parse_tags, UserId};
use forum_store::{FilterOp, Page, Sort, SortKey, SortOrder};
use serde::{Deserialize, Serialize};

use crate::ServiceError;

/// Raw search input as received from the caller. Lists are comma-separated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub text: Option<String>,
    pub tags: Option<String>,
    pub commentable_id: Option<String>,
    pub commentable_ids: Option<String>,
    pub course_id: Option<String>,
    pub group_id: Option<i64>,
    pub sort_key: Option<String>,
    pub sort_order: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub user_id: Option<String>,
    pub recursive: bool,
}

/// Normalised search query. Viewer and projection flags live in `ProjectionOptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    /// Conjunctive: a thread must carry every tag.
    pub tags: Vec<String>,
    pub course_id: Option<String>,
    pub commentable_id: Option<String>,
    pub commentable_ids: Vec<String>,
    pub group_id: Option<i64>,
    pub sort: Option<Sort>,
    pub page: Page,
}

impl SearchQuery {
    pub fn from_params(params: &SearchParams, default_per_page: usize) -> Result<Self, ServiceError> {
        let text = params.text.as_deref().map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
        let sort = match (non_empty(&params.sort_key), non_empty(&params.sort_order)) {
            (Some(k), Some(o)) => {
                let key = SortKey::parse(k).ok_or_else(|| ServiceError::InvalidQuery(format!("unknown sort key {k:?}")))?;
                let order =
                    SortOrder::parse(o).ok_or_else(|| ServiceError::InvalidQuery(format!("unknown sort order {o:?}")))?;
                Some(Sort { key, order })
            }
            _ => None,
        };
        Ok(Self {
            text,
            tags: params.tags.as_deref().map(parse_tags).unwrap_or_default(),
            course_id: non_empty(&params.course_id).map(str::to_string),
            commentable_id: non_empty(&params.commentable_id).map(str::to_string),
            commentable_ids: params.commentable_ids.as_deref().map(split_list).unwrap_or_default(),
            group_id: params.group_id,
            sort,
            page: Page::new(params.page.unwrap_or(1), params.per_page.unwrap_or(default_per_page)),
        })
    }

    /// Scoping filters shared by both passes: commentable, course, group.
    pub fn bounding_filters(&self) -> Vec<FilterOp> {
        let mut out = Vec::new();
        if let Some(c) = &self.commentable_id {
            out.push(FilterOp::CommentableEq(c.clone()));
        } else if !self.commentable_ids.is_empty() {
            out.push(FilterOp::CommentableIn(self.commentable_ids.clone()));
        }
        if let Some(c) = &self.course_id {
            out.push(FilterOp::CourseEq(c.clone()));
        }
        if let Some(g) = self.group_id {
            out.push(FilterOp::GroupVisible(g));
        }
        out
    }

    /// Tag filters followed by the bounding filters.
    pub fn thread_filters(&self) -> Vec<FilterOp> {
        let mut out: Vec<FilterOp> = self.tags.iter().cloned().map(FilterOp::TagEq).collect();
        out.extend(self.bounding_filters());
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionOptions {
    /// Attach replies as nested `children`.
    pub recursive: bool,
    pub user_id: Option<UserId>,
}

impl ProjectionOptions {
    pub fn from_params(params: &SearchParams) -> Self {
        Self { recursive: params.recursive, user_id: non_empty(&params.user_id).map(|u| UserId(u.to_string())) }
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}
