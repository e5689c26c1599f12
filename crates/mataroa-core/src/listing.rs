//! Filtering, search and pagination of post lists.

use std::fmt;
use std::str::FromStr;

use crate::post::Post;

/// Posts shown per page.
pub const PAGE_SIZE: usize = 5;

/// Default number of body characters shown per post.
pub const DEFAULT_PREVIEW_LENGTH: usize = 280;

/// Preview lengths a user may pick.
pub const ALLOWED_PREVIEW_LENGTHS: [usize; 3] = [140, 280, 500];

/// Which posts to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ListFilter {
    #[default]
    All,
    Published,
    Drafts,
}

impl ListFilter {
    /// Stable name used in commands and callback data.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Published => "published",
            Self::Drafts => "drafts",
        }
    }

    /// Whether `post` passes this filter.
    pub fn accepts(&self, post: &Post) -> bool {
        match self {
            Self::All => true,
            Self::Published => !post.is_draft(),
            Self::Drafts => post.is_draft(),
        }
    }
}

impl fmt::Display for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "published" | "pub" => Ok(Self::Published),
            "drafts" | "draft" => Ok(Self::Drafts),
            other => Err(format!("unknown filter: {}", other)),
        }
    }
}

/// A list request: filter, optional search text and 1-based page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: ListFilter,
    pub search: Option<String>,
    pub page: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: ListFilter::All,
            search: None,
            page: 1,
        }
    }
}

impl ListQuery {
    /// All posts matching `filter`, first page.
    pub fn filtered(filter: ListFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Posts whose title or body contains `text` (case-insensitive).
    pub fn search(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            search: (!text.trim().is_empty()).then(|| text.trim().to_string()),
            ..Default::default()
        }
    }

    fn matches(&self, post: &Post) -> bool {
        if !self.filter.accepts(post) {
            return false;
        }
        match &self.search {
            Some(needle) => {
                let needle = needle.to_lowercase();
                post.title.to_lowercase().contains(&needle)
                    || post.body_text().to_lowercase().contains(&needle)
            }
            None => true,
        }
    }
}

/// One page of a filtered post list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPage<'a> {
    /// Posts on this page.
    pub posts: Vec<&'a Post>,
    /// Page actually shown, clamped to `1..=total_pages`.
    pub page: usize,
    /// Number of pages, at least 1.
    pub total_pages: usize,
    /// Number of posts matching the query.
    pub total: usize,
}

impl PostPage<'_> {
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Apply `query` to `posts` and cut out the requested page.
pub fn paginate<'a>(posts: &'a [Post], query: &ListQuery) -> PostPage<'a> {
    let matching: Vec<&Post> = posts.iter().filter(|p| query.matches(p)).collect();
    let total = matching.len();
    let total_pages = total.div_ceil(PAGE_SIZE).max(1);
    let page = query.page.clamp(1, total_pages);
    let start = (page - 1) * PAGE_SIZE;

    PostPage {
        posts: matching.into_iter().skip(start).take(PAGE_SIZE).collect(),
        page,
        total_pages,
        total,
    }
}

/// Return `length` if it is an allowed preview length, else the default.
pub fn effective_preview_length(length: usize) -> usize {
    if ALLOWED_PREVIEW_LENGTHS.contains(&length) {
        length
    } else {
        DEFAULT_PREVIEW_LENGTH
    }
}
