use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::*;
use crate::cursor::{paginate, Bound, Page, PageRequest, Ranked};
use crate::slug::slugify;
use crate::telemetry;
use crate::validation::normalize_tags;

const SNAPSHOT_FILE: &str = "state.json";

#[derive(Default, Clone, Serialize, Deserialize)]
struct State {
    posts: BTreeMap<Id, Post>,
    comments: BTreeMap<Id, Comment>,
    replies: BTreeMap<Id, Reply>,
    likes: BTreeMap<Id, Like>,
    users: BTreeMap<Id, User>,
    next_id: Id,
}

impl State {
    fn slug_taken(&self, slug: &str, except: Option<Id>) -> bool {
        self.posts.values().any(|p| p.slug == slug && Some(p.id) != except)
    }

    fn comment_in(&self, post_id: Id, comment_id: Id) -> Option<&Comment> {
        self.comments.get(&comment_id).filter(|c| c.post_id == post_id)
    }

    fn reply_in(&self, post_id: Id, comment_id: Id, reply_id: Id) -> Option<&Reply> {
        self.replies
            .get(&reply_id)
            .filter(|r| r.post_id == post_id && r.comment_id == comment_id)
    }

    fn target_exists(&self, target: &LikeTarget) -> bool {
        match *target {
            LikeTarget::Post { post_id } => self.posts.contains_key(&post_id),
            LikeTarget::Comment { post_id, comment_id } => self.comment_in(post_id, comment_id).is_some(),
            LikeTarget::Reply { post_id, comment_id, reply_id } => {
                self.reply_in(post_id, comment_id, reply_id).is_some()
            }
        }
    }

    fn find_like(&self, user_id: Id, target: &LikeTarget) -> Option<Id> {
        self.likes.values().find(|l| l.matches(user_id, target)).map(|l| l.id)
    }

    fn user_named(&self, username: &str) -> Option<&User> {
        let username = username.trim();
        self.users.values().find(|u| u.username.eq_ignore_ascii_case(username))
    }
}

/// A collection inside [`State`].
trait Stored: Clone + 'static {
    fn table(s: &State) -> &BTreeMap<Id, Self>;
    fn table_mut(s: &mut State) -> &mut BTreeMap<Id, Self>;
}

macro_rules! stored {
    ($($ty:ty => $field:ident),* $(,)?) => {$(
        impl Stored for $ty {
            fn table(s: &State) -> &BTreeMap<Id, Self> { &s.$field }
            fn table_mut(s: &mut State) -> &mut BTreeMap<Id, Self> { &mut s.$field }
        }
    )*};
}

stored!(Post => posts, Comment => comments, Reply => replies, Like => likes, User => users);

type Undo = Box<dyn FnOnce(&mut State)>;

/// Scoped write transaction.
///
/// Mutations apply to the live state under the write lock and record how to
/// reverse themselves. Dropping the guard without `commit` or `close` replays
/// the undo log backwards, so an early `?` return leaves the state as it was.
/// Reads go through `Deref`; writes only through the recording methods.
struct Tx<'a> {
    op: &'static str,
    live: RwLockWriteGuard<'a, State>,
    undo: Vec<Undo>,
    done: bool,
}

impl<'a> Tx<'a> {
    fn begin(op: &'static str, live: RwLockWriteGuard<'a, State>) -> Self {
        Self { op, live, undo: Vec::new(), done: false }
    }

    fn changed(&self) -> bool {
        !self.undo.is_empty()
    }

    fn commit(mut self) {
        self.done = true;
        debug!(op = self.op, changes = self.undo.len(), "transaction committed");
    }

    /// End a transaction that turned out to be a no-op.
    fn close(mut self) {
        self.done = true;
    }

    fn next_id(&mut self) -> Id {
        let prev = self.live.next_id;
        self.undo.push(Box::new(move |s| s.next_id = prev));
        self.live.next_id += 1;
        self.live.next_id
    }

    fn insert<T: Stored>(&mut self, id: Id, row: T) {
        let prev = T::table_mut(&mut *self.live).insert(id, row);
        self.undo.push(Box::new(move |s| {
            match prev {
                Some(p) => T::table_mut(s).insert(id, p),
                None => T::table_mut(s).remove(&id),
            };
        }));
    }

    fn remove<T: Stored>(&mut self, id: Id) -> Option<T> {
        let row = T::table_mut(&mut *self.live).remove(&id)?;
        let saved = row.clone();
        self.undo.push(Box::new(move |s| {
            T::table_mut(s).insert(id, saved);
        }));
        Some(row)
    }

    fn remove_where<T: Stored>(&mut self, pred: impl Fn(&T) -> bool) -> usize {
        let ids: Vec<Id> = T::table(&*self.live)
            .iter()
            .filter(|(_, row)| pred(row))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.remove::<T>(*id);
        }
        ids.len()
    }

    fn get_mut<T: Stored>(&mut self, id: Id) -> Option<&mut T> {
        let prev = T::table(&*self.live).get(&id)?.clone();
        self.undo.push(Box::new(move |s| {
            T::table_mut(s).insert(id, prev);
        }));
        T::table_mut(&mut *self.live).get_mut(&id)
    }

    /// Counter of the row a ledger entry points at, given its key columns.
    fn likes_mut(&mut self, post_id: Id, comment_id: Option<Id>, reply_id: Option<Id>) -> RepoResult<&mut i64> {
        let likes = match (comment_id, reply_id) {
            (_, Some(reply_id)) => self.get_mut::<Reply>(reply_id).map(|r| &mut r.likes),
            (Some(comment_id), None) => self.get_mut::<Comment>(comment_id).map(|c| &mut c.likes),
            (None, None) => self.get_mut::<Post>(post_id).map(|p| &mut p.likes),
        };
        likes.ok_or(RepoError::NotFound)
    }

    fn target_likes_mut(&mut self, target: &LikeTarget) -> RepoResult<&mut i64> {
        self.likes_mut(target.post_id(), target.comment_key(), target.reply_key())
    }
}

impl Deref for Tx<'_> {
    type Target = State;
    fn deref(&self) -> &State {
        &self.live
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for undo in self.undo.drain(..).rev() {
            undo(&mut *self.live);
        }
        warn!(op = self.op, "transaction rolled back");
        telemetry::record_aborted(self.op);
    }
}

/// Serialized state waiting to be written, tagged with its commit order.
struct Pending {
    generation: u64,
    bytes: Vec<u8>,
}

/// `<dir>/state.json`, replaced atomically through a temp file.
struct Snapshot {
    path: PathBuf,
    /// Bumped under the state write lock, so it follows commit order.
    generation: AtomicU64,
    /// Generation currently on disk.
    written: Mutex<u64>,
}

impl Snapshot {
    fn new(path: PathBuf) -> Self {
        Self { path, generation: AtomicU64::new(0), written: Mutex::new(0) }
    }

    fn stage(&self, state: &State) -> RepoResult<Pending> {
        let bytes = serde_json::to_vec(state).map_err(|e| RepoError::Internal(format!("snapshot: {e}")))?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Pending { generation, bytes })
    }

    /// Blocking. Returns false when a newer generation is already on disk.
    fn write(&self, pending: Pending) -> io::Result<bool> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "snapshot lock poisoned"))?;
        if pending.generation <= *written {
            return Ok(false);
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&pending.bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        *written = pending.generation;
        Ok(true)
    }
}

/// In-process store. Optionally mirrors every commit to a JSON snapshot.
#[derive(Clone, Default)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    snapshot: Option<Arc<Snapshot>>,
}

impl InMemRepo {
    /// Ephemeral store; nothing touches disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by `<dir>/state.json`, loaded now and rewritten after
    /// every commit. A missing file starts empty; an unreadable one is an error.
    pub fn with_snapshot_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = dir.as_ref().join(SNAPSHOT_FILE);
        let state = Self::load_state_from(&path)?;
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            snapshot: Some(Arc::new(Snapshot::new(path))),
        })
    }

    fn load_state_from(path: &Path) -> anyhow::Result<State> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no snapshot, starting empty");
                return Ok(State::default());
            }
            Err(e) => return Err(e).with_context(|| format!("cannot read snapshot {}", path.display())),
        };
        let state: State = serde_json::from_slice(&bytes)
            .with_context(|| format!("snapshot {} is corrupt", path.display()))?;
        info!(path = %path.display(), posts = state.posts.len(), users = state.users.len(), "loaded snapshot");
        Ok(state)
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn begin(&self, op: &'static str) -> RepoResult<Tx<'_>> {
        let live = self
            .state
            .write()
            .map_err(|_| RepoError::Internal("state lock poisoned".into()))?;
        Ok(Tx::begin(op, live))
    }

    /// Commits `tx`. With snapshots on, the state is serialized before the
    /// write lock goes away; a serialization failure rolls the transaction back.
    fn commit(&self, tx: Tx<'_>) -> RepoResult<Option<Pending>> {
        if !tx.changed() {
            tx.close();
            return Ok(None);
        }
        let pending = match &self.snapshot {
            Some(snapshot) => Some(snapshot.stage(&tx)?),
            None => None,
        };
        tx.commit();
        Ok(pending)
    }

    /// Runs `f` in a transaction, commits when it returns `Ok` and then
    /// writes the snapshot off the async executor.
    async fn write<T>(&self, op: &'static str, f: impl FnOnce(&mut Tx<'_>) -> RepoResult<T>) -> RepoResult<T> {
        let (value, pending) = self.apply(op, f)?;
        self.flush(pending).await;
        Ok(value)
    }

    fn apply<T>(&self, op: &'static str, f: impl FnOnce(&mut Tx<'_>) -> RepoResult<T>) -> RepoResult<(T, Option<Pending>)> {
        let mut tx = self.begin(op)?;
        let value = f(&mut tx)?;
        let pending = self.commit(tx)?;
        Ok((value, pending))
    }

    async fn flush(&self, pending: Option<Pending>) {
        let (Some(snapshot), Some(pending)) = (self.snapshot.clone(), pending) else { return };
        let generation = pending.generation;
        let path = snapshot.path.clone();
        match tokio::task::spawn_blocking(move || snapshot.write(pending)).await {
            Ok(Ok(true)) => debug!(generation, "snapshot written"),
            Ok(Ok(false)) => debug!(generation, "newer snapshot already on disk"),
            Ok(Err(e)) => error!(path = %path.display(), generation, error = %e, "failed to write snapshot"),
            Err(e) => error!(generation, error = %e, "snapshot task failed"),
        }
    }
}

/// Resolve the request's cursor to a range predicate. `live_likes` looks up the
/// current like count of a row in the listed scope.
fn resolve_bound(page: &PageRequest, live_likes: impl Fn(Id) -> Option<i64>) -> RepoResult<Option<Bound>> {
    match page.decode_cursor()? {
        None => Ok(None),
        Some(cursor) => {
            let likes = if cursor.needs_live_likes() { live_likes(cursor.id) } else { None };
            cursor.bound(likes).map(Some)
        }
    }
}

fn select_page<T, I>(rows: I, bound: Option<Bound>, page: &PageRequest) -> Page<T>
where
    T: Ranked,
    I: IntoIterator<Item = T>,
{
    let mut hits: Vec<T> = rows
        .into_iter()
        .filter(|r| bound.map_or(true, |b| b.admits(r.rank_likes(), r.rank_id())))
        .collect();
    hits.sort_by(|a, b| page.sort.compare(a.rank_key(), b.rank_key()));
    hits.truncate(page.fetch_limit());
    paginate(hits, page.limit, page.sort)
}

fn post_matches(post: &Post, needle: Option<&str>, tags: &[String]) -> bool {
    let text_ok = needle.map_or(true, |n| {
        post.title.to_lowercase().contains(n) || post.description.to_lowercase().contains(n)
    });
    let tags_ok = tags.is_empty() || post.tags.iter().any(|t| tags.contains(t));
    text_ok && tags_ok
}

#[async_trait]
impl PostRepo for InMemRepo {
    async fn list_posts(&self, query: PostQuery) -> RepoResult<Page<PostSummary>> {
        let s = self.read()?;
        let bound = resolve_bound(&query.page, |id| s.posts.get(&id).map(|p| p.likes))?;
        let needle = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_lowercase);
        let tags = normalize_tags(query.tags);
        let rows = s
            .posts
            .values()
            .filter(|p| post_matches(p, needle.as_deref(), &tags))
            .map(PostSummary::from);
        Ok(select_page(rows, bound, &query.page))
    }

    async fn get_post(&self, id: Id) -> RepoResult<Post> {
        let s = self.read()?;
        s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn get_post_by_slug(&self, slug: &str) -> RepoResult<Post> {
        let s = self.read()?;
        s.posts.values().find(|p| p.slug == slug).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_post(&self, author_id: Id, new: NewPost) -> RepoResult<Post> {
        let post = self
            .write("create_post", |tx| {
                let slug = slugify(&new.title);
                if tx.slug_taken(&slug, None) {
                    return Err(RepoError::Conflict);
                }
                let now = Utc::now();
                let id = tx.next_id();
                let post = Post {
                    id,
                    title: new.title.trim().to_string(),
                    slug,
                    description: new.description,
                    cover: new.cover,
                    headers: new.headers,
                    content: new.content,
                    author_id,
                    tags: normalize_tags(new.tags),
                    likes: 0,
                    comments: 0,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert(id, post.clone());
                Ok(post)
            })
            .await?;
        telemetry::record_thread_mutation("create_post");
        Ok(post)
    }

    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
        if upd.is_empty() {
            return self.get_post(id).await;
        }
        let post = self
            .write("update_post", |tx| {
                // uniqueness check before taking the mutable borrow
                if let Some(slug) = upd.title.as_deref().map(slugify) {
                    if tx.slug_taken(&slug, Some(id)) {
                        return Err(RepoError::Conflict);
                    }
                }
                let post = tx.get_mut::<Post>(id).ok_or(RepoError::NotFound)?;
                post.apply_update(upd);
                Ok(post.clone())
            })
            .await?;
        telemetry::record_thread_mutation("update_post");
        Ok(post)
    }

    async fn delete_post(&self, id: Id, actor: &Actor) -> RepoResult<()> {
        if !actor.role.is_elevated() {
            return Err(RepoError::Forbidden);
        }
        let removed = self
            .write("delete_post", |tx| {
                if tx.remove::<Post>(id).is_none() {
                    return Ok(false);
                }
                let comments = tx.remove_where::<Comment>(|c| c.post_id == id);
                let replies = tx.remove_where::<Reply>(|r| r.post_id == id);
                let likes = tx.remove_where::<Like>(|l| l.post_id == id);
                info!(post_id = id, comments, replies, likes, "post deleted with cascade");
                Ok(true)
            })
            .await?;
        if removed {
            telemetry::record_thread_mutation("delete_post");
        }
        Ok(())
    }
}

#[async_trait]
impl CommentRepo for InMemRepo {
    async fn list_comments(&self, post_id: Id, page: PageRequest) -> RepoResult<Page<Comment>> {
        let s = self.read()?;
        if !s.posts.contains_key(&post_id) {
            return Err(RepoError::NotFound);
        }
        let bound = resolve_bound(&page, |id| s.comment_in(post_id, id).map(|c| c.likes))?;
        let rows = s.comments.values().filter(|c| c.post_id == post_id).cloned();
        Ok(select_page(rows, bound, &page))
    }

    async fn get_comment(&self, post_id: Id, comment_id: Id) -> RepoResult<Comment> {
        let s = self.read()?;
        s.comment_in(post_id, comment_id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_comment(&self, post_id: Id, author_id: Id, body: String) -> RepoResult<Comment> {
        let comment = self
            .write("create_comment", |tx| {
                tx.get_mut::<Post>(post_id).ok_or(RepoError::NotFound)?.comments += 1;
                let now = Utc::now();
                let id = tx.next_id();
                let comment = Comment {
                    id,
                    post_id,
                    author_id,
                    body,
                    likes: 0,
                    replies: 0,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert(id, comment.clone());
                Ok(comment)
            })
            .await?;
        telemetry::record_thread_mutation("create_comment");
        Ok(comment)
    }

    async fn update_comment(&self, post_id: Id, comment_id: Id, actor: &Actor, body: String) -> RepoResult<Comment> {
        let comment = self
            .write("update_comment", |tx| {
                let author = tx.comment_in(post_id, comment_id).ok_or(RepoError::NotFound)?.author_id;
                if author != actor.user_id {
                    return Err(RepoError::Forbidden);
                }
                let comment = tx.get_mut::<Comment>(comment_id).ok_or(RepoError::NotFound)?;
                comment.body = body;
                comment.updated_at = Utc::now();
                Ok(comment.clone())
            })
            .await?;
        telemetry::record_thread_mutation("update_comment");
        Ok(comment)
    }

    async fn delete_comment(&self, post_id: Id, comment_id: Id, actor: &Actor) -> RepoResult<()> {
        let removed = self
            .write("delete_comment", |tx| {
                let Some(comment) = tx.comment_in(post_id, comment_id) else {
                    return Ok(false);
                };
                if !actor.may_moderate(comment.author_id) {
                    return Err(RepoError::Forbidden);
                }

                let reply_ids: HashSet<Id> = tx
                    .replies
                    .values()
                    .filter(|r| r.comment_id == comment_id)
                    .map(|r| r.id)
                    .collect();
                tx.remove_where::<Reply>(|r| reply_ids.contains(&r.id));
                tx.remove_where::<Like>(|l| {
                    l.comment_id == Some(comment_id) || l.reply_id.is_some_and(|r| reply_ids.contains(&r))
                });
                tx.remove::<Comment>(comment_id);
                let removed = 1 + reply_ids.len() as i64;
                tx.get_mut::<Post>(post_id).ok_or(RepoError::NotFound)?.comments -= removed;

                debug!(post_id, comment_id, replies = reply_ids.len(), "comment deleted with cascade");
                Ok(true)
            })
            .await?;
        if removed {
            telemetry::record_thread_mutation("delete_comment");
        }
        Ok(())
    }
}

#[async_trait]
impl ReplyRepo for InMemRepo {
    async fn list_replies(&self, post_id: Id, comment_id: Id, page: PageRequest) -> RepoResult<Page<Reply>> {
        let s = self.read()?;
        if s.comment_in(post_id, comment_id).is_none() {
            return Err(RepoError::NotFound);
        }
        let bound = resolve_bound(&page, |id| s.reply_in(post_id, comment_id, id).map(|r| r.likes))?;
        let rows = s
            .replies
            .values()
            .filter(|r| r.post_id == post_id && r.comment_id == comment_id)
            .cloned();
        Ok(select_page(rows, bound, &page))
    }

    async fn get_reply(&self, post_id: Id, comment_id: Id, reply_id: Id) -> RepoResult<Reply> {
        let s = self.read()?;
        s.reply_in(post_id, comment_id, reply_id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_reply(&self, post_id: Id, comment_id: Id, author_id: Id, new: NewReply) -> RepoResult<Reply> {
        let reply = self
            .write("create_reply", |tx| {
                if !tx.posts.contains_key(&post_id) || tx.comment_in(post_id, comment_id).is_none() {
                    return Err(RepoError::NotFound);
                }
                let now = Utc::now();
                let id = tx.next_id();
                let reply = Reply {
                    id,
                    post_id,
                    comment_id,
                    reply_to_username: new.reply_to_username,
                    author_id,
                    body: new.body,
                    likes: 0,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert(id, reply.clone());
                tx.get_mut::<Comment>(comment_id).ok_or(RepoError::NotFound)?.replies += 1;
                tx.get_mut::<Post>(post_id).ok_or(RepoError::NotFound)?.comments += 1;
                Ok(reply)
            })
            .await?;
        telemetry::record_thread_mutation("create_reply");
        Ok(reply)
    }

    async fn update_reply(
        &self,
        post_id: Id,
        comment_id: Id,
        reply_id: Id,
        actor: &Actor,
        body: String,
    ) -> RepoResult<Reply> {
        let reply = self
            .write("update_reply", |tx| {
                let author = tx
                    .reply_in(post_id, comment_id, reply_id)
                    .ok_or(RepoError::NotFound)?
                    .author_id;
                if author != actor.user_id {
                    return Err(RepoError::Forbidden);
                }
                let reply = tx.get_mut::<Reply>(reply_id).ok_or(RepoError::NotFound)?;
                reply.body = body;
                reply.updated_at = Utc::now();
                Ok(reply.clone())
            })
            .await?;
        telemetry::record_thread_mutation("update_reply");
        Ok(reply)
    }

    async fn delete_reply(&self, post_id: Id, comment_id: Id, reply_id: Id, actor: &Actor) -> RepoResult<()> {
        let removed = self
            .write("delete_reply", |tx| {
                let Some(reply) = tx.reply_in(post_id, comment_id, reply_id) else {
                    return Ok(false);
                };
                if !actor.may_moderate(reply.author_id) {
                    return Err(RepoError::Forbidden);
                }
                tx.remove::<Reply>(reply_id);
                tx.remove_where::<Like>(|l| l.reply_id == Some(reply_id));
                tx.get_mut::<Comment>(comment_id).ok_or(RepoError::NotFound)?.replies -= 1;
                tx.get_mut::<Post>(post_id).ok_or(RepoError::NotFound)?.comments -= 1;
                Ok(true)
            })
            .await?;
        if removed {
            telemetry::record_thread_mutation("delete_reply");
        }
        Ok(())
    }
}

#[async_trait]
impl LikeRepo for InMemRepo {
    async fn like(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus> {
        let status = self
            .write("like", |tx| {
                if !tx.target_exists(&target) {
                    return Err(RepoError::NotFound);
                }
                if tx.find_like(user_id, &target).is_some() {
                    return Ok(ReactionStatus { liked: true, changed: false });
                }
                let now = Utc::now();
                let id = tx.next_id();
                tx.insert(
                    id,
                    Like {
                        id,
                        user_id,
                        post_id: target.post_id(),
                        comment_id: target.comment_key(),
                        reply_id: target.reply_key(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                *tx.target_likes_mut(&target)? += 1;
                Ok(ReactionStatus { liked: true, changed: true })
            })
            .await?;
        if status.changed {
            telemetry::record_reaction("like", target.kind());
        }
        Ok(status)
    }

    async fn unlike(&self, user_id: Id, target: LikeTarget) -> RepoResult<ReactionStatus> {
        let status = self
            .write("unlike", |tx| {
                if !tx.target_exists(&target) {
                    return Err(RepoError::NotFound);
                }
                let Some(like_id) = tx.find_like(user_id, &target) else {
                    return Ok(ReactionStatus { liked: false, changed: false });
                };
                tx.remove::<Like>(like_id);
                *tx.target_likes_mut(&target)? -= 1;
                Ok(ReactionStatus { liked: false, changed: true })
            })
            .await?;
        if status.changed {
            telemetry::record_reaction("unlike", target.kind());
        }
        Ok(status)
    }

    async fn like_status(&self, user_id: Id, target: LikeTarget) -> RepoResult<bool> {
        let s = self.read()?;
        if !s.target_exists(&target) {
            return Err(RepoError::NotFound);
        }
        Ok(s.find_like(user_id, &target).is_some())
    }
}

#[async_trait]
impl UserRepo for InMemRepo {
    async fn create_user(&self, new: NewUser) -> RepoResult<User> {
        self.write("create_user", |tx| {
            let taken = tx.users.values().any(|u| {
                u.username.eq_ignore_ascii_case(&new.username) || u.email.eq_ignore_ascii_case(&new.email)
            });
            if taken {
                return Err(RepoError::Conflict);
            }
            let now = Utc::now();
            let id = tx.next_id();
            let user = User {
                id,
                full_name: new.full_name,
                username: new.username,
                email: new.email,
                password_hash: new.password_hash,
                profile_image: None,
                bio: None,
                role: new.role,
                reset_password_token: None,
                reset_password_expires: None,
                refresh_tokens: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            tx.insert(id, user.clone());
            Ok(user)
        })
        .await
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        let s = self.read()?;
        s.users.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_user_by_username(&self, username: &str) -> RepoResult<User> {
        let s = self.read()?;
        s.user_named(username).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_users(&self, role: Role, page: PageRequest) -> RepoResult<Page<UserSummary>> {
        let page = user_page(page);
        let s = self.read()?;
        let bound = resolve_bound(&page, |_| None)?;
        let rows = s.users.values().filter(|u| u.role == role).map(User::summary);
        Ok(select_page(rows, bound, &page))
    }

    async fn update_user(&self, username: &str, actor: &Actor, upd: UpdateUser) -> RepoResult<User> {
        self.write("update_user", |tx| {
            let user = tx.user_named(username).ok_or(RepoError::NotFound)?;
            if !actor.may_edit_profile(user) {
                return Err(RepoError::Forbidden);
            }
            let id = user.id;
            if upd.is_empty() {
                return Ok(user.clone());
            }
            if let Some(wanted) = upd.username.as_deref() {
                if tx.user_named(wanted).is_some_and(|other| other.id != id) {
                    return Err(RepoError::Conflict);
                }
            }
            let user = tx.get_mut::<User>(id).ok_or(RepoError::NotFound)?;
            user.apply_update(upd);
            Ok(user.clone())
        })
        .await
    }

    async fn change_role(&self, username: &str, role: Role) -> RepoResult<RoleChange> {
        let change = self
            .write("change_role", |tx| {
                let user = tx.user_named(username).ok_or(RepoError::NotFound)?;
                if user.role == role {
                    return Ok(RoleChange { user: user.profile(), changed: false });
                }
                let id = user.id;
                let user = tx.get_mut::<User>(id).ok_or(RepoError::NotFound)?;
                user.role = role;
                user.updated_at = Utc::now();
                Ok(RoleChange { user: user.profile(), changed: true })
            })
            .await?;
        if change.changed {
            info!(user_id = change.user.id, role = %role, "role changed");
        }
        Ok(change)
    }

    async fn delete_user(&self, username: &str, actor: &Actor) -> RepoResult<()> {
        self.write("delete_user", |tx| {
            let Some(user) = tx.user_named(username) else {
                return Ok(());
            };
            if !actor.may_remove_account(user) {
                return Err(RepoError::Forbidden);
            }
            let user_id = user.id;
            let cast: Vec<Like> = tx.likes.values().filter(|l| l.user_id == user_id).cloned().collect();
            for like in &cast {
                tx.remove::<Like>(like.id);
                // a like whose target is already gone has no counter to lower
                if let Ok(likes) = tx.likes_mut(like.post_id, like.comment_id, like.reply_id) {
                    *likes -= 1;
                }
            }
            tx.remove::<User>(user_id);
            info!(user_id, likes = cast.len(), "user deleted");
            Ok(())
        })
        .await
    }
}
