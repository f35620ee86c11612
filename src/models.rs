use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::slug::slugify;
use crate::validation::normalize_tags;

/// Creation-ordered identity shared by every collection.
pub type Id = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    /// Moderators and admins may remove content they did not write.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The authenticated party performing a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Id,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Id, role: Role) -> Self {
        Self { user_id, role }
    }

    /// Author of the entity, or holder of an elevated role.
    pub fn may_moderate(&self, author_id: Id) -> bool {
        self.user_id == author_id || self.role.is_elevated()
    }

    pub fn may_edit_profile(&self, target: &User) -> bool {
        self.user_id == target.id || self.role == Role::Admin
    }

    /// Account removal: the owner, or an elevated role at least as high as
    /// the target's.
    pub fn may_remove_account(&self, target: &User) -> bool {
        self.user_id == target.id || (self.role.is_elevated() && self.role >= target.role)
    }
}

// ───────────────────────────── posts ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Image { value: String },
    CodeSnippet { value: String, language: String },
    CodeOutput { value: String },
    Text { value: String },
}

impl ContentBlock {
    pub fn value(&self) -> &str {
        match self {
            ContentBlock::Image { value }
            | ContentBlock::CodeSnippet { value, .. }
            | ContentBlock::CodeOutput { value }
            | ContentBlock::Text { value } => value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub enum HeaderLevel {
    H2,
    H3,
}

/// Table-of-contents entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Header {
    pub id: String,
    #[serde(rename = "type")]
    pub level: HeaderLevel,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: Id,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub cover: String,
    pub headers: Vec<Header>,
    pub content: Vec<ContentBlock>,
    pub author_id: Id,
    pub tags: Vec<String>,
    pub likes: i64,
    /// Live comments plus live replies under this post.
    pub comments: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Apply the fields present in `upd`. A new title re-derives the slug.
    pub fn apply_update(&mut self, upd: UpdatePost) {
        if let Some(title) = upd.title {
            self.slug = slugify(&title);
            self.title = title.trim().to_string();
        }
        if let Some(d) = upd.description { self.description = d; }
        if let Some(h) = upd.headers { self.headers = h; }
        if let Some(c) = upd.cover { self.cover = c; }
        if let Some(c) = upd.content { self.content = c; }
        if let Some(t) = upd.tags { self.tags = normalize_tags(t); }
        self.updated_at = Utc::now();
    }
}

/// Listing projection of a post.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct PostSummary {
    pub id: Id,
    pub title: String,
    pub slug: String,
    pub cover: String,
    pub tags: Vec<String>,
    pub likes: i64,
    pub comments: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&Post> for PostSummary {
    fn from(p: &Post) -> Self {
        Self {
            id: p.id,
            title: p.title.clone(),
            slug: p.slug.clone(),
            cover: p.cover.clone(),
            tags: p.tags.clone(),
            likes: p.likes,
            comments: p.comments,
            created_at: p.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    pub title: String,
    pub description: String,
    pub headers: Vec<Header>,
    pub cover: String,
    pub content: Vec<ContentBlock>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub description: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub cover: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub tags: Option<Vec<String>>,
}

impl UpdatePost {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.headers.is_none()
            && self.cover.is_none()
            && self.content.is_none()
            && self.tags.is_none()
    }
}

// ──────────────────────── comments & replies ────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub author_id: Id,
    pub body: String,
    pub likes: i64,
    /// Live replies under this comment.
    pub replies: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Reply {
    pub id: Id,
    pub post_id: Id,
    pub comment_id: Id,
    /// Display hint only; not a reference.
    pub reply_to_username: Option<String>,
    pub author_id: Id,
    pub body: String,
    pub likes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewComment {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewReply {
    #[serde(default)]
    pub reply_to_username: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateBody {
    pub body: String,
}

// ─────────────────────────── reactions ───────────────────────────

/// What a like points at. Every target is scoped to its post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LikeTarget {
    Post { post_id: Id },
    Comment { post_id: Id, comment_id: Id },
    Reply { post_id: Id, comment_id: Id, reply_id: Id },
}

impl LikeTarget {
    pub fn post_id(&self) -> Id {
        match *self {
            LikeTarget::Post { post_id }
            | LikeTarget::Comment { post_id, .. }
            | LikeTarget::Reply { post_id, .. } => post_id,
        }
    }

    /// Comment column of the ledger entry; `None` for post and reply likes.
    pub fn comment_key(&self) -> Option<Id> {
        match *self {
            LikeTarget::Comment { comment_id, .. } => Some(comment_id),
            _ => None,
        }
    }

    /// Reply column of the ledger entry.
    pub fn reply_key(&self) -> Option<Id> {
        match *self {
            LikeTarget::Reply { reply_id, .. } => Some(reply_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LikeTarget::Post { .. } => "post",
            LikeTarget::Comment { .. } => "comment",
            LikeTarget::Reply { .. } => "reply",
        }
    }
}

/// One user's like on one target. At most one exists per (user, post, comment, reply).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Like {
    pub id: Id,
    pub user_id: Id,
    pub post_id: Id,
    pub comment_id: Option<Id>,
    pub reply_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Like {
    pub fn matches(&self, user_id: Id, target: &LikeTarget) -> bool {
        self.user_id == user_id
            && self.post_id == target.post_id()
            && self.comment_id == target.comment_key()
            && self.reply_id == target.reply_key()
    }
}

/// Outcome of a like/unlike. `changed` is false when the call was a no-op.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReactionStatus {
    pub liked: bool,
    pub changed: bool,
}

// ───────────────────────────── users ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub profile_image: Option<String>,
    pub bio: Option<String>,
    pub role: Role,
    pub reset_password_token: Option<String>,
    pub reset_password_expires: Option<DateTime<Utc>>,
    pub refresh_tokens: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            full_name: self.full_name.clone(),
            username: self.username.clone(),
            profile_image: self.profile_image.clone(),
            bio: self.bio.clone(),
            role: self.role,
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            full_name: self.full_name.clone(),
            username: self.username.clone(),
            profile_image: self.profile_image.clone(),
        }
    }

    /// Apply the fields present in `upd`; values are expected to be validated.
    pub fn apply_update(&mut self, upd: UpdateUser) {
        if let Some(n) = upd.full_name { self.full_name = n.trim().to_string(); }
        if let Some(u) = upd.username { self.username = u.trim().to_string(); }
        if let Some(b) = upd.bio { self.bio = Some(b.trim().to_string()); }
        if let Some(i) = upd.profile_image { self.profile_image = Some(i.trim().to_string()); }
        self.updated_at = Utc::now();
    }
}

/// Public view of a user; never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    pub id: Id,
    pub full_name: String,
    pub username: String,
    pub profile_image: Option<String>,
    pub bio: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Directory listing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema, sqlx::FromRow)]
pub struct UserSummary {
    pub id: Id,
    pub full_name: String,
    pub username: String,
    pub profile_image: Option<String>,
}

/// Profile edit; credentials are owned by the account service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateUser {
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub profile_image: Option<String>,
}

impl UpdateUser {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.username.is_none() && self.bio.is_none() && self.profile_image.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChangeRole {
    pub role: Role,
}

/// Result of a role change. `changed` is false when the user already held the role.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RoleChange {
    pub user: UserProfile,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}
