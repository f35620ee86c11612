use async_trait::async_trait;

use crate::cursor::{Page, PageRequest, Sort};
use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("forbidden")] Forbidden,
    #[error("invalid cursor")] InvalidCursor,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Listing filters for posts on top of the page request.
#[derive(Debug, Clone)]
pub struct PostQuery {
    pub page: PageRequest,
    /// Case-insensitive literal substring of title or description.
    pub search: Option<String>,
    /// Match posts carrying any of these tags.
    pub tags: Vec<String>,
}

impl PostQuery {
    pub fn new(page: PageRequest) -> Self {
        Self { page, search: None, tags: Vec::new() }
    }
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn list_posts(&self, query: PostQuery) -> RepoResult<Page<PostSummary>>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn get_post_by_slug(&self, slug: &str) -> RepoResult<Post>;
    async fn create_post(&self, author_id: Id, new: NewPost) -> RepoResult<Post>;
    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post>;
    /// Removes the post with every comment, reply and like under it. Requires an elevated role.
    async fn delete_post(&self, id: Id, actor: &Actor) -> RepoResult<()>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn list_comments(&self, post_id: Id, page: PageRequest) -> RepoResult<Page<Comment>>;
    async fn get_comment(&self, post_id: Id, comment_id: Id) -> RepoResult<Comment>;
    /// Inserts the comment and bumps `post.comments` in one transaction.
    async fn create_comment(&self, post_id: Id, author_id: Id, body: String) -> RepoResult<Comment>;
    /// Author-only body edit.
    async fn update_comment(&self, post_id: Id, comment_id: Id, actor: &Actor, body: String) -> RepoResult<Comment>;
    /// Removes the comment, its replies and all likes on either, and lowers
    /// `post.comments` by one plus the number of replies removed.
    async fn delete_comment(&self, post_id: Id, comment_id: Id, actor: &Actor) -> RepoResult<()>;
}

#[async_trait]
pub trait ReplyRepo: Send + Sync {
    async fn list_replies(&self, post_id: Id, comment_id: Id, page: PageRequest) -> RepoResult<Page<Reply>>;
    async fn get_reply(&self, post_id: Id, comment_id: Id, reply_id: Id) -> RepoResult<Reply>;
    /// Inserts the reply and bumps both `comment.replies` and `post.comments`.
    async fn create_reply(&self, post_id: Id, comment_id: Id, author_id: Id, new: NewReply) -> RepoResult<Reply>;
    async fn update_reply(&self, post_id: Id, comment_id: Id, reply_id: Id, actor: &Actor, body: String) -> RepoResult<Reply>;
    async fn delete_reply(&self, post_id: Id, comment_id: Id, reply_id: Id, actor: &Actor) -> RepoResult<()>;
}

#[async_trait]
pub trait LikeRepo: Send + Sync {
    /// Records the like and increments the target's counter; a repeat is a no-op.
    async fn like(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus>;
    /// Drops the like and decrements the target's counter; a repeat is a no-op.
    async fn unlike(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus>;
    async fn like_status(&self, user_id: Id, target: LikeTarget) -> RepoResult<bool>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn find_user_by_username(&self, username: &str) -> RepoResult<User>;
    /// Users holding `role`, newest or oldest first. `Sort::Top` lists like `Latest`.
    async fn list_users(&self, role: Role, page: PageRequest) -> RepoResult<Page<UserSummary>>;
    /// Profile edit by the owner or an admin. A taken username is `Conflict`.
    async fn update_user(&self, username: &str, actor: &Actor, upd: UpdateUser) -> RepoResult<User>;
    async fn change_role(&self, username: &str, role: Role) -> RepoResult<RoleChange>;
    /// Removes the account and every like it cast, lowering the liked
    /// counters. Authored posts, comments and replies stay. Succeeds when the
    /// user is already gone.
    async fn delete_user(&self, username: &str, actor: &Actor) -> RepoResult<()>;
}

/// User listings have no like ranking.
pub(crate) fn user_page(page: PageRequest) -> PageRequest {
    match page.sort {
        Sort::Top => page.with_sort(Sort::Latest),
        _ => page,
    }
}

pub trait Repo: PostRepo + CommentRepo + ReplyRepo + LikeRepo + UserRepo {}

impl<T> Repo for T where T: PostRepo + CommentRepo + ReplyRepo + LikeRepo + UserRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem;

#[cfg(feature = "postgres-store")]
pub mod pg;
