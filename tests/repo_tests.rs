#![cfg(feature = "inmem-store")]

use quill::cursor::{PageRequest, Sort};
use quill::models::*;
use quill::repo::inmem::InMemRepo;
use quill::repo::{PostQuery, RepoError};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use quill::repo::{CommentRepo, LikeRepo, PostRepo, ReplyRepo, UserRepo};

const AUTHOR: Id = 1_000;
const OTHER: Id = 1_001;

fn moderator() -> Actor {
    Actor::new(1_002, Role::Moderator)
}

fn author() -> Actor {
    Actor::new(AUTHOR, Role::User)
}

fn new_post(title: &str) -> NewPost {
    NewPost {
        title: title.into(),
        description: "A post about things".into(),
        headers: vec![Header { id: "intro".into(), level: HeaderLevel::H2, value: "Intro".into() }],
        cover: "https://img.example/cover.png".into(),
        content: vec![ContentBlock::Text { value: "Body text".into() }],
        tags: vec!["Rust".into(), " web ".into(), "rust".into()],
    }
}

fn reply(body: &str) -> NewReply {
    NewReply { reply_to_username: None, body: body.into() }
}

async fn counters(r: &InMemRepo, post_id: Id) -> i64 {
    r.get_post(post_id).await.unwrap().comments
}

#[tokio::test]
async fn post_crud_slug_and_conflict() {
    let r = InMemRepo::new();

    let p = r.create_post(AUTHOR, new_post("Hello, World!")).await.unwrap();
    assert_eq!(p.slug, "hello-world");
    assert_eq!(p.tags, vec!["rust", "web"]);
    assert_eq!((p.likes, p.comments), (0, 0));

    // same slug → conflict
    let err = r.create_post(AUTHOR, new_post("hello world")).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict));

    // retitle re-derives the slug
    let upd = UpdatePost { title: Some("Fresh Title".into()), ..Default::default() };
    let p2 = r.update_post(p.id, upd).await.unwrap();
    assert_eq!(p2.slug, "fresh-title");
    assert_eq!(r.get_post_by_slug("fresh-title").await.unwrap().id, p.id);
    assert!(matches!(r.get_post_by_slug("hello-world").await, Err(RepoError::NotFound)));

    // empty update is a no-op
    let same = r.update_post(p.id, UpdatePost::default()).await.unwrap();
    assert_eq!(same.title, "Fresh Title");

    // retitling onto another post's slug is rejected
    let q = r.create_post(AUTHOR, new_post("Second")).await.unwrap();
    let upd = UpdatePost { title: Some("fresh title".into()), ..Default::default() };
    assert!(matches!(r.update_post(q.id, upd).await, Err(RepoError::Conflict)));
    assert_eq!(r.get_post(q.id).await.unwrap().slug, "second");

    let upd = UpdatePost { description: Some("x".into()), ..Default::default() };
    assert!(matches!(r.update_post(9_999, upd).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn comment_and_reply_counters_track_live_rows() {
    let r = InMemRepo::new();
    let p = r.create_post(AUTHOR, new_post("Counters")).await.unwrap();

    let c1 = r.create_comment(p.id, AUTHOR, "first".into()).await.unwrap();
    let c2 = r.create_comment(p.id, OTHER, "second".into()).await.unwrap();
    assert_eq!(counters(&r, p.id).await, 2);

    let mut replies = Vec::new();
    for i in 0..3 {
        replies.push(r.create_reply(p.id, c1.id, OTHER, reply(&format!("r{i}"))).await.unwrap());
    }
    assert_eq!(counters(&r, p.id).await, 5);
    assert_eq!(r.get_comment(p.id, c1.id).await.unwrap().replies, 3);

    r.delete_reply(p.id, c1.id, replies[0].id, &moderator()).await.unwrap();
    assert_eq!(counters(&r, p.id).await, 4);
    assert_eq!(r.get_comment(p.id, c1.id).await.unwrap().replies, 2);

    // comment with two live replies: 1 + 2 removed
    r.delete_comment(p.id, c1.id, &author()).await.unwrap();
    assert_eq!(counters(&r, p.id).await, 1);
    assert!(matches!(r.get_reply(p.id, c1.id, replies[1].id).await, Err(RepoError::NotFound)));
    assert!(matches!(
        r.list_replies(p.id, c1.id, PageRequest::new(Sort::Oldest, 20)).await,
        Err(RepoError::NotFound)
    ));

    // repeat delete is idempotent and leaves counters alone
    r.delete_comment(p.id, c1.id, &author()).await.unwrap();
    r.delete_reply(p.id, c1.id, replies[0].id, &author()).await.unwrap();
    assert_eq!(counters(&r, p.id).await, 1);

    let left = r.list_comments(p.id, PageRequest::new(Sort::Latest, 20)).await.unwrap();
    assert_eq!(left.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![c2.id]);
}

#[tokio::test]
async fn failed_operations_leave_counters_unchanged() {
    let r = InMemRepo::new();
    let p = r.create_post(AUTHOR, new_post("Guarded")).await.unwrap();
    let c = r.create_comment(p.id, AUTHOR, "mine".into()).await.unwrap();
    let rp = r.create_reply(p.id, c.id, AUTHOR, reply("also mine")).await.unwrap();

    let stranger = Actor::new(OTHER, Role::User);
    assert!(matches!(r.delete_comment(p.id, c.id, &stranger).await, Err(RepoError::Forbidden)));
    assert!(matches!(r.delete_reply(p.id, c.id, rp.id, &stranger).await, Err(RepoError::Forbidden)));
    assert!(matches!(r.create_comment(9_999, AUTHOR, "x".into()).await, Err(RepoError::NotFound)));
    assert!(matches!(r.create_reply(p.id, 9_999, AUTHOR, reply("x")).await, Err(RepoError::NotFound)));

    assert_eq!(counters(&r, p.id).await, 2);
    assert_eq!(r.get_comment(p.id, c.id).await.unwrap().replies, 1);
}

#[tokio::test]
async fn children_are_scoped_to_their_post() {
    let r = InMemRepo::new();
    let a = r.create_post(AUTHOR, new_post("Post A")).await.unwrap();
    let b = r.create_post(AUTHOR, new_post("Post B")).await.unwrap();
    let c = r.create_comment(a.id, AUTHOR, "on a".into()).await.unwrap();

    assert!(matches!(r.get_comment(b.id, c.id).await, Err(RepoError::NotFound)));
    assert!(matches!(r.create_reply(b.id, c.id, OTHER, reply("wrong post")).await, Err(RepoError::NotFound)));
    assert!(matches!(
        r.like(OTHER, LikeTarget::Comment { post_id: b.id, comment_id: c.id }).await,
        Err(RepoError::NotFound)
    ));
    assert_eq!(counters(&r, b.id).await, 0);
}

#[tokio::test]
async fn body_edits_are_author_only() {
    let r = InMemRepo::new();
    let p = r.create_post(AUTHOR, new_post("Edits")).await.unwrap();
    let c = r.create_comment(p.id, AUTHOR, "draft".into()).await.unwrap();
    let rp = r.create_reply(p.id, c.id, AUTHOR, reply("draft")).await.unwrap();

    // even moderators cannot rewrite someone else's words
    assert!(matches!(
        r.update_comment(p.id, c.id, &moderator(), "hijack".into()).await,
        Err(RepoError::Forbidden)
    ));
    assert!(matches!(
        r.update_reply(p.id, c.id, rp.id, &moderator(), "hijack".into()).await,
        Err(RepoError::Forbidden)
    ));

    let c2 = r.update_comment(p.id, c.id, &author(), "final".into()).await.unwrap();
    assert_eq!(c2.body, "final");
    let r2 = r.update_reply(p.id, c.id, rp.id, &author(), "final".into()).await.unwrap();
    assert_eq!(r2.body, "final");
    assert!(r2.updated_at >= rp.updated_at);
    assert_eq!(counters(&r, p.id).await, 2);
}

#[tokio::test]
async fn delete_post_cascades_and_requires_elevated_role() {
    let r = InMemRepo::new();
    let p = r.create_post(AUTHOR, new_post("Doomed")).await.unwrap();
    let keep = r.create_post(AUTHOR, new_post("Survivor")).await.unwrap();
    let c = r.create_comment(p.id, OTHER, "c".into()).await.unwrap();
    let rp = r.create_reply(p.id, c.id, OTHER, reply("r")).await.unwrap();
    r.like(OTHER, LikeTarget::Post { post_id: p.id }).await.unwrap();
    r.like(OTHER, LikeTarget::Post { post_id: keep.id }).await.unwrap();

    // the author is not enough
    assert!(matches!(r.delete_post(p.id, &author()).await, Err(RepoError::Forbidden)));
    assert_eq!(r.get_post(p.id).await.unwrap().comments, 2);

    r.delete_post(p.id, &moderator()).await.unwrap();
    assert!(matches!(r.get_post(p.id).await, Err(RepoError::NotFound)));
    assert!(matches!(r.get_reply(p.id, c.id, rp.id).await, Err(RepoError::NotFound)));
    assert!(matches!(
        r.like_status(OTHER, LikeTarget::Post { post_id: p.id }).await,
        Err(RepoError::NotFound)
    ));
    assert!(matches!(r.create_comment(p.id, OTHER, "late".into()).await, Err(RepoError::NotFound)));

    // unrelated post untouched; second delete is a no-op
    assert!(r.like_status(OTHER, LikeTarget::Post { post_id: keep.id }).await.unwrap());
    r.delete_post(p.id, &moderator()).await.unwrap();
}

#[tokio::test]
async fn post_listing_filters_combine() {
    let r = InMemRepo::new();
    let mut rust = new_post("Async Rust in practice");
    rust.tags = vec!["rust".into(), "async".into()];
    let mut go = new_post("Go channels");
    go.tags = vec!["go".into()];
    go.description = "Concurrency beyond Rust".into();
    let mut cooking = new_post("Sourdough");
    cooking.tags = vec!["food".into()];
    let rust = r.create_post(AUTHOR, rust).await.unwrap();
    let go = r.create_post(AUTHOR, go).await.unwrap();
    r.create_post(AUTHOR, cooking).await.unwrap();

    let mut q = PostQuery::new(PageRequest::new(Sort::Latest, 9));
    q.search = Some("RUST".into());
    let ids: Vec<Id> = r.list_posts(q.clone()).await.unwrap().items.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![go.id, rust.id]);

    q.tags = vec!["async".into(), "food".into()];
    let ids: Vec<Id> = r.list_posts(q).await.unwrap().items.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![rust.id]);

    // search is literal, not a pattern
    let mut q = PostQuery::new(PageRequest::new(Sort::Latest, 9));
    q.search = Some(".*".into());
    assert!(r.list_posts(q).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn user_directory_is_case_insensitive() {
    let r = InMemRepo::new();
    let u = r
        .create_user(NewUser {
            full_name: "Ada Lovelace".into(),
            username: "Ada".into(),
            email: "ada@example.com".into(),
            password_hash: "$argon2id$stub".into(),
            role: Role::User,
        })
        .await
        .unwrap();
    assert_eq!(r.find_user_by_username("ADA").await.unwrap().id, u.id);
    assert_eq!(r.get_user(u.id).await.unwrap().username, "Ada");

    let dup = NewUser {
        full_name: "Other".into(),
        username: "ada".into(),
        email: "other@example.com".into(),
        password_hash: "x".into(),
        role: Role::User,
    };
    assert!(matches!(r.create_user(dup).await, Err(RepoError::Conflict)));
    assert!(matches!(r.find_user_by_username("grace").await, Err(RepoError::NotFound)));

    let profile = serde_json::to_value(u.profile()).unwrap();
    assert!(profile.get("password_hash").is_none());
    assert_eq!(profile["role"], "user");
}

#[tokio::test]
async fn snapshot_reload_keeps_threads_and_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (post_id, comment_id) = {
        let r = InMemRepo::with_snapshot_dir(dir.path()).unwrap();
        let p = r.create_post(AUTHOR, new_post("Persisted")).await.unwrap();
        let c = r.create_comment(p.id, AUTHOR, "kept".into()).await.unwrap();
        r.like(OTHER, LikeTarget::Comment { post_id: p.id, comment_id: c.id }).await.unwrap();
        (p.id, c.id)
    };

    let r = InMemRepo::with_snapshot_dir(dir.path()).unwrap();
    let c = r.get_comment(post_id, comment_id).await.unwrap();
    assert_eq!(c.likes, 1);
    assert!(r
        .like_status(OTHER, LikeTarget::Comment { post_id, comment_id })
        .await
        .unwrap());
    // identities keep increasing after reload
    let c2 = r.create_comment(post_id, AUTHOR, "new".into()).await.unwrap();
    assert!(c2.id > comment_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_leave_a_loadable_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let r = std::sync::Arc::new(InMemRepo::with_snapshot_dir(dir.path()).unwrap());
    let p = r.create_post(AUTHOR, new_post("Busy thread")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..64 {
        let r = r.clone();
        tasks.push(tokio::spawn(async move { r.create_comment(p.id, AUTHOR, format!("c{i}")).await }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    // the file on disk is whole and holds the last commit
    let reloaded = InMemRepo::with_snapshot_dir(dir.path()).unwrap();
    assert_eq!(counters(&reloaded, p.id).await, 64);
    let page = reloaded.list_comments(p.id, PageRequest::new(Sort::Oldest, 100)).await.unwrap();
    assert_eq!(page.items.len(), 64);
    assert!(!dir.path().join("state.json.tmp").exists());
}

#[tokio::test]
async fn corrupt_snapshot_refuses_to_load() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("state.json"), b"{\"posts\": {").unwrap();
    assert!(InMemRepo::with_snapshot_dir(dir.path()).is_err());

    // no file at all is a fresh store
    let empty = tempfile::tempdir().unwrap();
    let r = InMemRepo::with_snapshot_dir(empty.path()).unwrap();
    assert!(matches!(r.get_post(1).await, Err(RepoError::NotFound)));
}

async fn member(r: &InMemRepo, username: &str, role: Role) -> User {
    r.create_user(NewUser {
        full_name: format!("{username} Example"),
        username: username.into(),
        email: format!("{username}@example.com"),
        password_hash: "hash".into(),
        role,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn user_listing_pages_by_role() {
    let r = InMemRepo::new();
    let mut users = Vec::new();
    for i in 0..5 {
        users.push(member(&r, &format!("user{i}"), Role::User).await.id);
    }
    member(&r, "mod", Role::Moderator).await;

    let first = r.list_users(Role::User, PageRequest::new(Sort::Latest, 3)).await.unwrap();
    let ids: Vec<Id> = first.items.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![users[4], users[3], users[2]]);
    let next = PageRequest::new(Sort::Latest, 3).with_cursor(first.next_cursor);
    let second = r.list_users(Role::User, next).await.unwrap();
    let ids: Vec<Id> = second.items.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![users[1], users[0]]);
    assert!(second.next_cursor.is_none());

    let mods = r.list_users(Role::Moderator, PageRequest::new(Sort::Oldest, 10)).await.unwrap();
    assert_eq!(mods.items.len(), 1);
    assert_eq!(mods.items[0].username, "mod");

    // a cursor is bound to its sort
    let oldest = r.list_users(Role::User, PageRequest::new(Sort::Oldest, 2)).await.unwrap();
    let mixed = PageRequest::new(Sort::Latest, 2).with_cursor(oldest.next_cursor);
    assert!(matches!(r.list_users(Role::User, mixed).await, Err(RepoError::InvalidCursor)));
}

#[tokio::test]
async fn profile_edits_are_owner_or_admin() {
    let r = InMemRepo::new();
    let ada = member(&r, "ada", Role::User).await;
    let grace = member(&r, "grace", Role::Moderator).await;
    let root = member(&r, "root", Role::Admin).await;

    let upd = UpdateUser { bio: Some("  engines  ".into()), ..Default::default() };
    let edited = r.update_user("ADA", &Actor::new(ada.id, Role::User), upd).await.unwrap();
    assert_eq!(edited.bio.as_deref(), Some("engines"));

    let upd = UpdateUser { full_name: Some("Someone".into()), ..Default::default() };
    let err = r.update_user("ada", &Actor::new(grace.id, grace.role), upd.clone()).await.unwrap_err();
    assert!(matches!(err, RepoError::Forbidden));
    let edited = r.update_user("ada", &Actor::new(root.id, root.role), upd).await.unwrap();
    assert_eq!(edited.full_name, "Someone");

    let taken = UpdateUser { username: Some("Grace".into()), ..Default::default() };
    let err = r.update_user("ada", &Actor::new(ada.id, Role::User), taken).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict));
    assert_eq!(r.get_user(ada.id).await.unwrap().username, "ada");

    let rename = UpdateUser { username: Some("countess".into()), ..Default::default() };
    r.update_user("ada", &Actor::new(ada.id, Role::User), rename).await.unwrap();
    assert_eq!(r.find_user_by_username("countess").await.unwrap().id, ada.id);

    let same = r.update_user("countess", &Actor::new(ada.id, Role::User), UpdateUser::default()).await.unwrap();
    assert_eq!(same.full_name, "Someone");
    let missing = r.update_user("nobody", &Actor::new(root.id, root.role), UpdateUser::default()).await;
    assert!(matches!(missing, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn role_change_reports_no_ops() {
    let r = InMemRepo::new();
    let ada = member(&r, "ada", Role::User).await;

    let change = r.change_role("ada", Role::Moderator).await.unwrap();
    assert!(change.changed);
    assert_eq!(change.user.role, Role::Moderator);
    assert_eq!(r.get_user(ada.id).await.unwrap().role, Role::Moderator);

    let again = r.change_role("ada", Role::Moderator).await.unwrap();
    assert!(!again.changed);
    assert!(matches!(r.change_role("nobody", Role::Admin).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn deleting_a_user_withdraws_likes_and_keeps_content() {
    let r = InMemRepo::new();
    let ada = member(&r, "ada", Role::User).await;
    let bob = member(&r, "bob", Role::User).await;
    let modr = member(&r, "modr", Role::Moderator).await;
    let root = member(&r, "root", Role::Admin).await;

    let p = r.create_post(root.id, new_post("Liked post")).await.unwrap();
    let c = r.create_comment(p.id, ada.id, "by ada".into()).await.unwrap();
    let rp = r.create_reply(p.id, c.id, bob.id, reply("by bob")).await.unwrap();
    let reply_target = LikeTarget::Reply { post_id: p.id, comment_id: c.id, reply_id: rp.id };
    for who in [ada.id, bob.id] {
        r.like(who, LikeTarget::Post { post_id: p.id }).await.unwrap();
        r.like(who, reply_target).await.unwrap();
    }
    r.like(ada.id, LikeTarget::Comment { post_id: p.id, comment_id: c.id }).await.unwrap();

    // plain users cannot remove others; moderators cannot remove admins
    let err = r.delete_user("ada", &Actor::new(bob.id, Role::User)).await.unwrap_err();
    assert!(matches!(err, RepoError::Forbidden));
    let err = r.delete_user("root", &Actor::new(modr.id, Role::Moderator)).await.unwrap_err();
    assert!(matches!(err, RepoError::Forbidden));

    r.delete_user("ada", &Actor::new(modr.id, Role::Moderator)).await.unwrap();
    assert!(matches!(r.get_user(ada.id).await, Err(RepoError::NotFound)));
    assert_eq!(r.get_post(p.id).await.unwrap().likes, 1);
    assert_eq!(r.get_comment(p.id, c.id).await.unwrap().likes, 0);
    assert_eq!(r.get_reply(p.id, c.id, rp.id).await.unwrap().likes, 1);
    assert!(!r.like_status(ada.id, reply_target).await.unwrap());
    // authored content stays and the thread counter is untouched
    assert_eq!(r.get_comment(p.id, c.id).await.unwrap().author_id, ada.id);
    assert_eq!(counters(&r, p.id).await, 2);

    // self-removal, and removing a gone user, both succeed
    r.delete_user("bob", &Actor::new(bob.id, Role::User)).await.unwrap();
    r.delete_user("bob", &Actor::new(root.id, Role::Admin)).await.unwrap();
    assert_eq!(r.get_post(p.id).await.unwrap().likes, 0);
}
