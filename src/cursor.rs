//! Cursor-based pagination.
//!
//! A page is fetched with `limit + 1` rows. When the extra row comes back it is
//! trimmed off and its identity becomes the next cursor; the cursor predicates
//! are inclusive, so that row opens the following page.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{Comment, Id, PostSummary, Reply, UserSummary};
use crate::repo::{RepoError, RepoResult};

pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    /// Newest first (identity descending).
    #[default]
    Latest,
    /// Oldest first (identity ascending).
    Oldest,
    /// Most liked first, newest first among equals.
    Top,
}

impl Sort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sort::Latest => "latest",
            Sort::Oldest => "oldest",
            Sort::Top => "top",
        }
    }

    /// Emission order of two rows given as `(likes, id)`.
    pub fn compare(&self, a: (i64, Id), b: (i64, Id)) -> Ordering {
        match self {
            Sort::Latest => b.1.cmp(&a.1),
            Sort::Oldest => a.1.cmp(&b.1),
            Sort::Top => b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)),
        }
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sort {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Sort::Latest),
            "oldest" => Ok(Sort::Oldest),
            "top" => Ok(Sort::Top),
            _ => Err(RepoError::InvalidCursor),
        }
    }
}

/// Decoded pagination cursor: the identity of the first row of the next page,
/// bound to the sort it was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub sort: Sort,
    pub id: Id,
}

impl Cursor {
    pub fn new(sort: Sort, id: Id) -> Self {
        Self { sort, id }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.sort, self.id))
    }

    /// Parse a token, rejecting tokens minted for a different sort.
    pub fn decode(token: &str, expected: Sort) -> RepoResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| RepoError::InvalidCursor)?;
        let text = String::from_utf8(raw).map_err(|_| RepoError::InvalidCursor)?;
        let (sort, id) = text.split_once(':').ok_or(RepoError::InvalidCursor)?;
        let sort: Sort = sort.parse()?;
        let id: Id = id.parse().map_err(|_| RepoError::InvalidCursor)?;
        if sort != expected {
            return Err(RepoError::InvalidCursor);
        }
        Ok(Self { sort, id })
    }

    /// Whether the bound depends on the cursor row's current like count.
    pub fn needs_live_likes(&self) -> bool {
        self.sort == Sort::Top
    }

    /// Build the range predicate for the next page.
    ///
    /// `live_likes` is the cursor row's like count as stored right now. Under
    /// `Top` the row must still exist, otherwise the page cannot be anchored.
    pub fn bound(&self, live_likes: Option<i64>) -> RepoResult<Bound> {
        match self.sort {
            Sort::Latest => Ok(Bound::AtMost(self.id)),
            Sort::Oldest => Ok(Bound::AtLeast(self.id)),
            Sort::Top => live_likes
                .map(|likes| Bound::Ranked { likes, id: self.id })
                .ok_or(RepoError::InvalidCursor),
        }
    }
}

/// Range predicate restricting a listing to rows at or after the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// `id <= id`
    AtMost(Id),
    /// `id >= id`
    AtLeast(Id),
    /// `likes < likes OR (likes = likes AND id <= id)`
    Ranked { likes: i64, id: Id },
}

impl Bound {
    pub fn admits(&self, likes: i64, id: Id) -> bool {
        match *self {
            Bound::AtMost(max) => id <= max,
            Bound::AtLeast(min) => id >= min,
            Bound::Ranked { likes: l, id: max } => likes < l || (likes == l && id <= max),
        }
    }
}

/// Sort keys of a listable row.
pub trait Ranked {
    fn rank_id(&self) -> Id;
    fn rank_likes(&self) -> i64;

    fn rank_key(&self) -> (i64, Id) {
        (self.rank_likes(), self.rank_id())
    }
}

impl Ranked for PostSummary {
    fn rank_id(&self) -> Id { self.id }
    fn rank_likes(&self) -> i64 { self.likes }
}

impl Ranked for Comment {
    fn rank_id(&self) -> Id { self.id }
    fn rank_likes(&self) -> i64 { self.likes }
}

impl Ranked for Reply {
    fn rank_id(&self) -> Id { self.id }
    fn rank_likes(&self) -> i64 { self.likes }
}

impl Ranked for UserSummary {
    fn rank_id(&self) -> Id { self.id }
    fn rank_likes(&self) -> i64 { 0 }
}

/// What a caller asks for: sort, optional cursor token and page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub sort: Sort,
    pub cursor: Option<String>,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(sort: Sort, limit: usize) -> Self {
        Self { sort, cursor: None, limit: limit.clamp(1, MAX_PAGE_SIZE) }
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Same request under another sort. The cursor is kept and must match it.
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn decode_cursor(&self) -> RepoResult<Option<Cursor>> {
        self.cursor
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(|c| Cursor::decode(c, self.sort))
            .transpose()
    }

    /// Rows to request from storage.
    pub fn fetch_limit(&self) -> usize {
        self.limit + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[aliases(
    PostPage = Page<PostSummary>,
    CommentPage = Page<Comment>,
    ReplyPage = Page<Reply>,
    UserPage = Page<UserSummary>
)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Turn an already sorted over-fetch of at most `limit + 1` rows into a page.
pub fn paginate<T: Ranked>(mut rows: Vec<T>, limit: usize, sort: Sort) -> Page<T> {
    rows.truncate(limit + 1);
    let next_cursor = if rows.len() == limit + 1 {
        rows.pop().map(|extra| Cursor::new(sort, extra.rank_id()).encode())
    } else {
        None
    };
    Page { items: rows, next_cursor }
}
