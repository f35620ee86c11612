use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, Pool, Postgres, QueryBuilder};
use tracing::{debug, error, info, warn};

use super::*;
use crate::cursor::{paginate, Bound, Page, PageRequest, Sort};
use crate::slug::slugify;
use crate::telemetry;
use crate::validation::normalize_tags;

const POST_COLUMNS: &str =
    "id, title, slug, description, cover, headers, content, author_id, tags, likes, comments, created_at, updated_at";
const SUMMARY_COLUMNS: &str = "id, title, slug, cover, tags, likes, comments, created_at";
const COMMENT_COLUMNS: &str = "id, post_id, author_id, body, likes, replies, created_at, updated_at";
const REPLY_COLUMNS: &str =
    "id, post_id, comment_id, reply_to_username, author_id, body, likes, created_at, updated_at";
const USER_COLUMNS: &str = "id, full_name, username, email, password_hash, profile_image, bio, role, \
     reset_password_token, reset_password_expires, refresh_tokens, created_at, updated_at";

#[derive(Clone)]
pub struct PgRepo {
    pool: Pool<Postgres>,
}

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Apply pending migrations from `migrations/`.
    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepoError::Internal(e.to_string()))?;
        info!("database migrations applied");
        Ok(())
    }

    /// Current like count of the cursor row, looked up inside the listed scope.
    async fn live_likes(&self, sql: &str, ids: &[Id]) -> RepoResult<Option<i64>> {
        let mut q = sqlx::query_scalar::<_, i64>(sql);
        for id in ids {
            q = q.bind(*id);
        }
        q.fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn resolve_bound(&self, page: &PageRequest, likes_sql: &str, scope: &[Id]) -> RepoResult<Option<Bound>> {
        let Some(cursor) = page.decode_cursor()? else { return Ok(None) };
        let likes = if cursor.needs_live_likes() {
            let mut ids = vec![cursor.id];
            ids.extend_from_slice(scope);
            self.live_likes(likes_sql, &ids).await?
        } else {
            None
        };
        cursor.bound(likes).map(Some)
    }
}

fn db_err(e: sqlx::Error) -> RepoError {
    match &e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(d) if d.code().as_deref() == Some("23505") => {
            debug!(error = %e, "unique violation");
            RepoError::Conflict
        }
        // a referenced row is gone, e.g. a token whose user was deleted
        sqlx::Error::Database(d) if d.code().as_deref() == Some("23503") => {
            debug!(error = %e, "foreign key violation");
            RepoError::NotFound
        }
        _ => {
            error!(error = %e, "database error");
            RepoError::Internal(e.to_string())
        }
    }
}

/// Runs a write and counts it as aborted when it fails. The sqlx transaction
/// inside rolls back on drop.
async fn tracked<T>(op: &'static str, fut: impl Future<Output = RepoResult<T>>) -> RepoResult<T> {
    let res = fut.await;
    match &res {
        Ok(_) => telemetry::record_thread_mutation(op),
        Err(e) => {
            warn!(op, error = %e, "transaction rolled back");
            telemetry::record_aborted(op);
        }
    }
    res
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn push_bound(qb: &mut QueryBuilder<'_, Postgres>, bound: Option<Bound>) {
    match bound {
        None => {}
        Some(Bound::AtMost(id)) => {
            qb.push(" AND id <= ").push_bind(id);
        }
        Some(Bound::AtLeast(id)) => {
            qb.push(" AND id >= ").push_bind(id);
        }
        Some(Bound::Ranked { likes, id }) => {
            qb.push(" AND (likes < ")
                .push_bind(likes)
                .push(" OR (likes = ")
                .push_bind(likes)
                .push(" AND id <= ")
                .push_bind(id)
                .push("))");
        }
    }
}

fn push_order_limit(qb: &mut QueryBuilder<'_, Postgres>, page: &PageRequest) {
    qb.push(match page.sort {
        Sort::Latest => " ORDER BY id DESC",
        Sort::Oldest => " ORDER BY id ASC",
        Sort::Top => " ORDER BY likes DESC, id DESC",
    });
    qb.push(" LIMIT ").push_bind(page.fetch_limit() as i64);
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Id,
    title: String,
    slug: String,
    description: String,
    cover: String,
    headers: Json<Vec<Header>>,
    content: Json<Vec<ContentBlock>>,
    author_id: Id,
    tags: Vec<String>,
    likes: i64,
    comments: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PostRow> for Post {
    fn from(r: PostRow) -> Self {
        Post {
            id: r.id,
            title: r.title,
            slug: r.slug,
            description: r.description,
            cover: r.cover,
            headers: r.headers.0,
            content: r.content.0,
            author_id: r.author_id,
            tags: r.tags,
            likes: r.likes,
            comments: r.comments,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Id,
    full_name: String,
    username: String,
    email: String,
    password_hash: String,
    profile_image: Option<String>,
    bio: Option<String>,
    role: String,
    reset_password_token: Option<String>,
    reset_password_expires: Option<DateTime<Utc>>,
    refresh_tokens: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = RepoError;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: r.id,
            full_name: r.full_name,
            username: r.username,
            email: r.email,
            password_hash: r.password_hash,
            profile_image: r.profile_image,
            bio: r.bio,
            role: r.role.parse().map_err(RepoError::Internal)?,
            reset_password_token: r.reset_password_token,
            reset_password_expires: r.reset_password_expires,
            refresh_tokens: r.refresh_tokens,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn target_lookup(target: &LikeTarget) -> (&'static str, Vec<Id>) {
    match *target {
        LikeTarget::Post { post_id } => ("SELECT id FROM posts WHERE id = $1", vec![post_id]),
        LikeTarget::Comment { post_id, comment_id } => (
            "SELECT id FROM comments WHERE id = $1 AND post_id = $2",
            vec![comment_id, post_id],
        ),
        LikeTarget::Reply { post_id, comment_id, reply_id } => (
            "SELECT id FROM replies WHERE id = $1 AND post_id = $2 AND comment_id = $3",
            vec![reply_id, post_id, comment_id],
        ),
    }
}

async fn target_exists<'e, E: PgExecutor<'e>>(exec: E, target: &LikeTarget) -> RepoResult<bool> {
    let (sql, ids) = target_lookup(target);
    let mut q = sqlx::query_scalar::<_, Id>(sql);
    for id in ids {
        q = q.bind(id);
    }
    Ok(q.fetch_optional(exec).await.map_err(db_err)?.is_some())
}

async fn adjust_likes(conn: &mut PgConnection, target: &LikeTarget, delta: i64) -> RepoResult<()> {
    let (sql, id) = match *target {
        LikeTarget::Post { post_id } => ("UPDATE posts SET likes = likes + $2 WHERE id = $1", post_id),
        LikeTarget::Comment { comment_id, .. } => {
            ("UPDATE comments SET likes = likes + $2 WHERE id = $1", comment_id)
        }
        LikeTarget::Reply { reply_id, .. } => ("UPDATE replies SET likes = likes + $2 WHERE id = $1", reply_id),
    };
    sqlx::query(sql).bind(id).bind(delta).execute(&mut *conn).await.map_err(db_err)?;
    Ok(())
}

async fn row_locked(conn: &mut PgConnection, sql: &str, ids: &[Id]) -> RepoResult<bool> {
    let mut q = sqlx::query_scalar::<_, Id>(sql);
    for id in ids {
        q = q.bind(*id);
    }
    Ok(q.fetch_optional(&mut *conn).await.map_err(db_err)?.is_some())
}

/// Locks for a like or unlike, in the global order users, posts, comments,
/// replies. Ancestors of the target are held `FOR KEY SHARE`, which only
/// conflicts with the `FOR UPDATE` a delete takes; the target row is held
/// `FOR NO KEY UPDATE` for its counter.
async fn lock_like_path(conn: &mut PgConnection, user_id: Id, target: &LikeTarget) -> RepoResult<()> {
    if !row_locked(conn, "SELECT id FROM users WHERE id = $1 FOR KEY SHARE", &[user_id]).await? {
        return Err(RepoError::NotFound);
    }
    let found = match *target {
        LikeTarget::Post { post_id } => {
            row_locked(conn, "SELECT id FROM posts WHERE id = $1 FOR NO KEY UPDATE", &[post_id]).await?
        }
        LikeTarget::Comment { post_id, comment_id } => {
            row_locked(conn, "SELECT id FROM posts WHERE id = $1 FOR KEY SHARE", &[post_id]).await?
                && row_locked(
                    conn,
                    "SELECT id FROM comments WHERE id = $1 AND post_id = $2 FOR NO KEY UPDATE",
                    &[comment_id, post_id],
                )
                .await?
        }
        LikeTarget::Reply { post_id, comment_id, reply_id } => {
            row_locked(conn, "SELECT id FROM posts WHERE id = $1 FOR KEY SHARE", &[post_id]).await?
                && row_locked(
                    conn,
                    "SELECT id FROM comments WHERE id = $1 AND post_id = $2 FOR KEY SHARE",
                    &[comment_id, post_id],
                )
                .await?
                && row_locked(
                    conn,
                    "SELECT id FROM replies WHERE id = $1 AND post_id = $2 AND comment_id = $3 FOR NO KEY UPDATE",
                    &[reply_id, post_id, comment_id],
                )
                .await?
        }
    };
    if found { Ok(()) } else { Err(RepoError::NotFound) }
}

/// Deletes take the post `FOR UPDATE` first, then comment, then reply, so any
/// like under the same post waits at the post row.
async fn lock_post(conn: &mut PgConnection, post_id: Id) -> RepoResult<bool> {
    let row = sqlx::query_scalar::<_, Id>("SELECT id FROM posts WHERE id = $1 FOR UPDATE")
        .bind(post_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(row.is_some())
}

async fn lock_user(conn: &mut PgConnection, username: &str) -> RepoResult<Option<User>> {
    sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1) FOR UPDATE"
    ))
    .bind(username.trim())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(User::try_from)
    .transpose()
}

async fn lock_comment_author(conn: &mut PgConnection, post_id: Id, comment_id: Id) -> RepoResult<Option<Id>> {
    sqlx::query_scalar::<_, Id>("SELECT author_id FROM comments WHERE id = $1 AND post_id = $2 FOR UPDATE")
        .bind(comment_id)
        .bind(post_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)
}

async fn lock_reply_author(
    conn: &mut PgConnection,
    post_id: Id,
    comment_id: Id,
    reply_id: Id,
) -> RepoResult<Option<Id>> {
    sqlx::query_scalar::<_, Id>(
        "SELECT author_id FROM replies WHERE id = $1 AND post_id = $2 AND comment_id = $3 FOR UPDATE",
    )
    .bind(reply_id)
    .bind(post_id)
    .bind(comment_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)
}

impl PgRepo {
    async fn tx_update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
        let mut post = Post::from(row);
        post.apply_update(upd);
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "UPDATE posts SET title = $2, slug = $3, description = $4, cover = $5, headers = $6, \
             content = $7, tags = $8, updated_at = $9 WHERE id = $1 RETURNING {POST_COLUMNS}"
        ))
        .bind(id)
        .bind(&post.title)
        .bind(&post.slug)
        .bind(&post.description)
        .bind(&post.cover)
        .bind(Json(&post.headers))
        .bind(Json(&post.content))
        .bind(&post.tags)
        .bind(post.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(row.into())
    }

    async fn tx_delete_post(&self, id: Id) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !lock_post(&mut tx, id).await? {
            return Ok(());
        }
        let likes = sqlx::query("DELETE FROM likes WHERE post_id = $1")
            .bind(id).execute(&mut *tx).await.map_err(db_err)?.rows_affected();
        let replies = sqlx::query("DELETE FROM replies WHERE post_id = $1")
            .bind(id).execute(&mut *tx).await.map_err(db_err)?.rows_affected();
        let comments = sqlx::query("DELETE FROM comments WHERE post_id = $1")
            .bind(id).execute(&mut *tx).await.map_err(db_err)?.rows_affected();
        sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(id).execute(&mut *tx).await.map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        info!(post_id = id, comments, replies, likes, "post deleted with cascade");
        Ok(())
    }

    async fn tx_create_comment(&self, post_id: Id, author_id: Id, body: String) -> RepoResult<Comment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let bumped = sqlx::query("UPDATE posts SET comments = comments + 1 WHERE id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        if bumped == 0 {
            return Err(RepoError::NotFound);
        }
        let comment = sqlx::query_as::<_, Comment>(&format!(
            "INSERT INTO comments (post_id, author_id, body) VALUES ($1, $2, $3) RETURNING {COMMENT_COLUMNS}"
        ))
        .bind(post_id)
        .bind(author_id)
        .bind(&body)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(comment)
    }

    async fn tx_update_comment(&self, post_id: Id, comment_id: Id, actor: &Actor, body: String) -> RepoResult<Comment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let author = lock_comment_author(&mut tx, post_id, comment_id)
            .await?
            .ok_or(RepoError::NotFound)?;
        if author != actor.user_id {
            return Err(RepoError::Forbidden);
        }
        let comment = sqlx::query_as::<_, Comment>(&format!(
            "UPDATE comments SET body = $2, updated_at = now() WHERE id = $1 RETURNING {COMMENT_COLUMNS}"
        ))
        .bind(comment_id)
        .bind(&body)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(comment)
    }

    async fn tx_delete_comment(&self, post_id: Id, comment_id: Id, actor: &Actor) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !lock_post(&mut tx, post_id).await? {
            return Ok(());
        }
        let Some(author) = lock_comment_author(&mut tx, post_id, comment_id).await? else {
            return Ok(());
        };
        if !actor.may_moderate(author) {
            return Err(RepoError::Forbidden);
        }
        let reply_ids: Vec<Id> = sqlx::query_scalar("SELECT id FROM replies WHERE comment_id = $1 FOR UPDATE")
            .bind(comment_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM likes WHERE comment_id = $1 OR reply_id = ANY($2)")
            .bind(comment_id)
            .bind(&reply_ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM replies WHERE comment_id = $1")
            .bind(comment_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(comment_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let removed = 1 + reply_ids.len() as i64;
        sqlx::query("UPDATE posts SET comments = comments - $2 WHERE id = $1")
            .bind(post_id)
            .bind(removed)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        debug!(post_id, comment_id, replies = reply_ids.len(), "comment deleted");
        Ok(())
    }

    async fn tx_create_reply(&self, post_id: Id, comment_id: Id, author_id: Id, new: NewReply) -> RepoResult<Reply> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let bumped = sqlx::query("UPDATE posts SET comments = comments + 1 WHERE id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        if bumped == 0 {
            return Err(RepoError::NotFound);
        }
        let bumped = sqlx::query("UPDATE comments SET replies = replies + 1 WHERE id = $1 AND post_id = $2")
            .bind(comment_id)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        if bumped == 0 {
            return Err(RepoError::NotFound);
        }
        let reply = sqlx::query_as::<_, Reply>(&format!(
            "INSERT INTO replies (post_id, comment_id, reply_to_username, author_id, body) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {REPLY_COLUMNS}"
        ))
        .bind(post_id)
        .bind(comment_id)
        .bind(&new.reply_to_username)
        .bind(author_id)
        .bind(&new.body)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(reply)
    }

    async fn tx_update_reply(
        &self,
        post_id: Id,
        comment_id: Id,
        reply_id: Id,
        actor: &Actor,
        body: String,
    ) -> RepoResult<Reply> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let author = lock_reply_author(&mut tx, post_id, comment_id, reply_id)
            .await?
            .ok_or(RepoError::NotFound)?;
        if author != actor.user_id {
            return Err(RepoError::Forbidden);
        }
        let reply = sqlx::query_as::<_, Reply>(&format!(
            "UPDATE replies SET body = $2, updated_at = now() WHERE id = $1 RETURNING {REPLY_COLUMNS}"
        ))
        .bind(reply_id)
        .bind(&body)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(reply)
    }

    async fn tx_delete_reply(&self, post_id: Id, comment_id: Id, reply_id: Id, actor: &Actor) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !lock_post(&mut tx, post_id).await? {
            return Ok(());
        }
        if lock_comment_author(&mut tx, post_id, comment_id).await?.is_none() {
            return Ok(());
        }
        let Some(author) = lock_reply_author(&mut tx, post_id, comment_id, reply_id).await? else {
            return Ok(());
        };
        if !actor.may_moderate(author) {
            return Err(RepoError::Forbidden);
        }
        sqlx::query("DELETE FROM likes WHERE reply_id = $1")
            .bind(reply_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM replies WHERE id = $1")
            .bind(reply_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE comments SET replies = replies - 1 WHERE id = $1")
            .bind(comment_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE posts SET comments = comments - 1 WHERE id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn tx_update_user(&self, username: &str, actor: &Actor, upd: UpdateUser) -> RepoResult<User> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut user = lock_user(&mut tx, username).await?.ok_or(RepoError::NotFound)?;
        if !actor.may_edit_profile(&user) {
            return Err(RepoError::Forbidden);
        }
        if upd.is_empty() {
            return Ok(user);
        }
        user.apply_update(upd);
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET full_name = $2, username = $3, bio = $4, profile_image = $5, updated_at = $6 \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user.id)
        .bind(&user.full_name)
        .bind(&user.username)
        .bind(&user.bio)
        .bind(&user.profile_image)
        .bind(user.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        row.try_into()
    }

    async fn tx_change_role(&self, username: &str, role: Role) -> RepoResult<RoleChange> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let user = lock_user(&mut tx, username).await?.ok_or(RepoError::NotFound)?;
        if user.role == role {
            return Ok(RoleChange { user: user.profile(), changed: false });
        }
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET role = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user.id)
        .bind(role.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        let user = User::try_from(row)?;
        info!(user_id = user.id, role = %role, "role changed");
        Ok(RoleChange { user: user.profile(), changed: true })
    }

    /// Locks the user first, which keeps out new likes by that user, then
    /// every post the user reacted under in id order. Counters of the liked
    /// rows drop by one per like before the ledger rows go.
    async fn tx_delete_user(&self, username: &str, actor: &Actor) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let Some(user) = lock_user(&mut tx, username).await? else {
            return Ok(());
        };
        if !actor.may_remove_account(&user) {
            return Err(RepoError::Forbidden);
        }
        sqlx::query(
            "SELECT id FROM posts WHERE id IN (SELECT post_id FROM likes WHERE user_id = $1) \
             ORDER BY id FOR UPDATE",
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE posts p SET likes = p.likes - 1 FROM likes l \
             WHERE l.user_id = $1 AND l.post_id = p.id AND l.comment_id IS NULL AND l.reply_id IS NULL",
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE comments c SET likes = c.likes - 1 FROM likes l WHERE l.user_id = $1 AND l.comment_id = c.id")
            .bind(user.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE replies r SET likes = r.likes - 1 FROM likes l WHERE l.user_id = $1 AND l.reply_id = r.id")
            .bind(user.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let likes = sqlx::query("DELETE FROM likes WHERE user_id = $1")
            .bind(user.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        info!(user_id = user.id, likes, "user deleted");
        Ok(())
    }

    async fn tx_like(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_like_path(&mut tx, user_id, &target).await?;
        let inserted = sqlx::query_scalar::<_, Id>(
            "INSERT INTO likes (user_id, post_id, comment_id, reply_id) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, post_id, (COALESCE(comment_id, 0)), (COALESCE(reply_id, 0))) DO NOTHING \
             RETURNING id",
        )
        .bind(user_id)
        .bind(target.post_id())
        .bind(target.comment_key())
        .bind(target.reply_key())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if inserted.is_none() {
            return Ok(ReactionStatus { liked: true, changed: false });
        }
        adjust_likes(&mut tx, &target, 1).await?;
        tx.commit().await.map_err(db_err)?;
        telemetry::record_reaction("like", target.kind());
        Ok(ReactionStatus { liked: true, changed: true })
    }

    async fn tx_unlike(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_like_path(&mut tx, user_id, &target).await?;
        let removed = sqlx::query_scalar::<_, Id>(
            "DELETE FROM likes WHERE user_id = $1 AND post_id = $2 \
             AND comment_id IS NOT DISTINCT FROM $3::BIGINT AND reply_id IS NOT DISTINCT FROM $4::BIGINT \
             RETURNING id",
        )
        .bind(user_id)
        .bind(target.post_id())
        .bind(target.comment_key())
        .bind(target.reply_key())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if removed.is_none() {
            return Ok(ReactionStatus { liked: false, changed: false });
        }
        adjust_likes(&mut tx, &target, -1).await?;
        tx.commit().await.map_err(db_err)?;
        telemetry::record_reaction("unlike", target.kind());
        Ok(ReactionStatus { liked: false, changed: true })
    }
}

#[async_trait]
impl PostRepo for PgRepo {
    async fn list_posts(&self, query: PostQuery) -> RepoResult<Page<PostSummary>> {
        let page = &query.page;
        let bound = self
            .resolve_bound(page, "SELECT likes FROM posts WHERE id = $1", &[])
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {SUMMARY_COLUMNS} FROM posts WHERE TRUE"));
        if let Some(needle) = query.search.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            let pattern = format!("%{}%", escape_like(needle));
            qb.push(" AND (title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        let tags = normalize_tags(query.tags.clone());
        if !tags.is_empty() {
            qb.push(" AND tags && ").push_bind(tags);
        }
        push_bound(&mut qb, bound);
        push_order_limit(&mut qb, page);

        let rows = qb
            .build_query_as::<PostSummary>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(paginate(rows, page.limit, page.sort))
    }

    async fn get_post(&self, id: Id) -> RepoResult<Post> {
        let row = sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get_post_by_slug(&self, slug: &str) -> RepoResult<Post> {
        let row = sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM posts WHERE slug = $1"))
            .bind(slug)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn create_post(&self, author_id: Id, new: NewPost) -> RepoResult<Post> {
        let fut = async {
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "INSERT INTO posts (title, slug, description, cover, headers, content, author_id, tags) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {POST_COLUMNS}"
            ))
            .bind(new.title.trim())
            .bind(slugify(&new.title))
            .bind(&new.description)
            .bind(&new.cover)
            .bind(Json(&new.headers))
            .bind(Json(&new.content))
            .bind(author_id)
            .bind(normalize_tags(new.tags.clone()))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(Post::from(row))
        };
        tracked("create_post", fut).await
    }

    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
        if upd.is_empty() {
            return self.get_post(id).await;
        }
        tracked("update_post", self.tx_update_post(id, upd)).await
    }

    async fn delete_post(&self, id: Id, actor: &Actor) -> RepoResult<()> {
        if !actor.role.is_elevated() {
            return Err(RepoError::Forbidden);
        }
        tracked("delete_post", self.tx_delete_post(id)).await
    }
}

#[async_trait]
impl CommentRepo for PgRepo {
    async fn list_comments(&self, post_id: Id, page: PageRequest) -> RepoResult<Page<Comment>> {
        if !target_exists(&self.pool, &LikeTarget::Post { post_id }).await? {
            return Err(RepoError::NotFound);
        }
        let bound = self
            .resolve_bound(&page, "SELECT likes FROM comments WHERE id = $1 AND post_id = $2", &[post_id])
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE post_id = "));
        qb.push_bind(post_id);
        push_bound(&mut qb, bound);
        push_order_limit(&mut qb, &page);

        let rows = qb
            .build_query_as::<Comment>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(paginate(rows, page.limit, page.sort))
    }

    async fn get_comment(&self, post_id: Id, comment_id: Id) -> RepoResult<Comment> {
        sqlx::query_as::<_, Comment>(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments WHERE id = $1 AND post_id = $2"
        ))
        .bind(comment_id)
        .bind(post_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn create_comment(&self, post_id: Id, author_id: Id, body: String) -> RepoResult<Comment> {
        tracked("create_comment", self.tx_create_comment(post_id, author_id, body)).await
    }

    async fn update_comment(&self, post_id: Id, comment_id: Id, actor: &Actor, body: String) -> RepoResult<Comment> {
        tracked("update_comment", self.tx_update_comment(post_id, comment_id, actor, body)).await
    }

    async fn delete_comment(&self, post_id: Id, comment_id: Id, actor: &Actor) -> RepoResult<()> {
        tracked("delete_comment", self.tx_delete_comment(post_id, comment_id, actor)).await
    }
}

#[async_trait]
impl ReplyRepo for PgRepo {
    async fn list_replies(&self, post_id: Id, comment_id: Id, page: PageRequest) -> RepoResult<Page<Reply>> {
        let parent = LikeTarget::Comment { post_id, comment_id };
        if !target_exists(&self.pool, &parent).await? {
            return Err(RepoError::NotFound);
        }
        let bound = self
            .resolve_bound(
                &page,
                "SELECT likes FROM replies WHERE id = $1 AND post_id = $2 AND comment_id = $3",
                &[post_id, comment_id],
            )
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {REPLY_COLUMNS} FROM replies WHERE comment_id = "));
        qb.push_bind(comment_id);
        push_bound(&mut qb, bound);
        push_order_limit(&mut qb, &page);

        let rows = qb
            .build_query_as::<Reply>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(paginate(rows, page.limit, page.sort))
    }

    async fn get_reply(&self, post_id: Id, comment_id: Id, reply_id: Id) -> RepoResult<Reply> {
        sqlx::query_as::<_, Reply>(&format!(
            "SELECT {REPLY_COLUMNS} FROM replies WHERE id = $1 AND post_id = $2 AND comment_id = $3"
        ))
        .bind(reply_id)
        .bind(post_id)
        .bind(comment_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn create_reply(&self, post_id: Id, comment_id: Id, author_id: Id, new: NewReply) -> RepoResult<Reply> {
        tracked("create_reply", self.tx_create_reply(post_id, comment_id, author_id, new)).await
    }

    async fn update_reply(
        &self,
        post_id: Id,
        comment_id: Id,
        reply_id: Id,
        actor: &Actor,
        body: String,
    ) -> RepoResult<Reply> {
        tracked("update_reply", self.tx_update_reply(post_id, comment_id, reply_id, actor, body)).await
    }

    async fn delete_reply(&self, post_id: Id, comment_id: Id, reply_id: Id, actor: &Actor) -> RepoResult<()> {
        tracked("delete_reply", self.tx_delete_reply(post_id, comment_id, reply_id, actor)).await
    }
}

#[async_trait]
impl LikeRepo for PgRepo {
    async fn like(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus> {
        let res = self.tx_like(user_id, target).await;
        if res.is_err() {
            telemetry::record_aborted("like");
        }
        res
    }

    async fn unlike(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus> {
        let res = self.tx_unlike(user_id, target).await;
        if res.is_err() {
            telemetry::record_aborted("unlike");
        }
        res
    }

    async fn like_status(&self, user_id: Id, target: LikeTarget) -> RepoResult<bool> {
        if !target_exists(&self.pool, &target).await? {
            return Err(RepoError::NotFound);
        }
        let found = sqlx::query_scalar::<_, Id>(
            "SELECT id FROM likes WHERE user_id = $1 AND post_id = $2 \
             AND comment_id IS NOT DISTINCT FROM $3::BIGINT AND reply_id IS NOT DISTINCT FROM $4::BIGINT",
        )
        .bind(user_id)
        .bind(target.post_id())
        .bind(target.comment_key())
        .bind(target.reply_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl UserRepo for PgRepo {
    async fn create_user(&self, new: NewUser) -> RepoResult<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (full_name, username, email, password_hash, role) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        ))
        .bind(&new.full_name)
        .bind(new.username.trim())
        .bind(new.email.trim().to_lowercase())
        .bind(&new.password_hash)
        .bind(new.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into()
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        row.try_into()
    }

    async fn find_user_by_username(&self, username: &str) -> RepoResult<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1)"
        ))
        .bind(username.trim())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into()
    }

    async fn list_users(&self, role: Role, page: PageRequest) -> RepoResult<Page<UserSummary>> {
        let page = user_page(page);
        let bound = page.decode_cursor()?.map(|c| c.bound(None)).transpose()?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, full_name, username, profile_image FROM users WHERE role = ",
        );
        qb.push_bind(role.as_str());
        push_bound(&mut qb, bound);
        push_order_limit(&mut qb, &page);

        let rows = qb
            .build_query_as::<UserSummary>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(paginate(rows, page.limit, page.sort))
    }

    async fn update_user(&self, username: &str, actor: &Actor, upd: UpdateUser) -> RepoResult<User> {
        tracked("update_user", self.tx_update_user(username, actor, upd)).await
    }

    async fn change_role(&self, username: &str, role: Role) -> RepoResult<RoleChange> {
        tracked("change_role", self.tx_change_role(username, role)).await
    }

    async fn delete_user(&self, username: &str, actor: &Actor) -> RepoResult<()> {
        tracked("delete_user", self.tx_delete_user(username, actor)).await
    }
}
