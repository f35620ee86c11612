#![cfg(feature = "inmem-store")]

use quill::models::*;
use quill::repo::inmem::InMemRepo;
use quill::repo::{CommentRepo, LikeRepo, PostRepo, ReplyRepo, RepoError};

struct Fixture {
    repo: InMemRepo,
    post: LikeTarget,
    comment: LikeTarget,
    reply: LikeTarget,
}

async fn fixture() -> Fixture {
    let repo = InMemRepo::new();
    let p = repo
        .create_post(
            1,
            NewPost {
                title: "Likeable".into(),
                description: "d".into(),
                headers: vec![Header { id: "a".into(), level: HeaderLevel::H2, value: "A".into() }],
                cover: "c.png".into(),
                content: vec![ContentBlock::Text { value: "t".into() }],
                tags: vec!["x".into()],
            },
        )
        .await
        .unwrap();
    let c = repo.create_comment(p.id, 2, "comment".into()).await.unwrap();
    let r = repo
        .create_reply(p.id, c.id, 3, NewReply { reply_to_username: None, body: "reply".into() })
        .await
        .unwrap();
    Fixture {
        post: LikeTarget::Post { post_id: p.id },
        comment: LikeTarget::Comment { post_id: p.id, comment_id: c.id },
        reply: LikeTarget::Reply { post_id: p.id, comment_id: c.id, reply_id: r.id },
        repo,
    }
}

async fn likes_of(f: &Fixture, target: LikeTarget) -> i64 {
    match target {
        LikeTarget::Post { post_id } => f.repo.get_post(post_id).await.unwrap().likes,
        LikeTarget::Comment { post_id, comment_id } => f.repo.get_comment(post_id, comment_id).await.unwrap().likes,
        LikeTarget::Reply { post_id, comment_id, reply_id } => {
            f.repo.get_reply(post_id, comment_id, reply_id).await.unwrap().likes
        }
    }
}

#[tokio::test]
async fn like_and_unlike_are_idempotent() {
    let f = fixture().await;
    for target in [f.post, f.comment, f.reply] {
        let first = f.repo.like(7, target).await.unwrap();
        assert_eq!(first, ReactionStatus { liked: true, changed: true });
        let again = f.repo.like(7, target).await.unwrap();
        assert_eq!(again, ReactionStatus { liked: true, changed: false });
        assert_eq!(likes_of(&f, target).await, 1);
        assert!(f.repo.like_status(7, target).await.unwrap());

        let gone = f.repo.unlike(7, target).await.unwrap();
        assert_eq!(gone, ReactionStatus { liked: false, changed: true });
        let again = f.repo.unlike(7, target).await.unwrap();
        assert_eq!(again, ReactionStatus { liked: false, changed: false });
        assert_eq!(likes_of(&f, target).await, 0);
        assert!(!f.repo.like_status(7, target).await.unwrap());
    }
}

#[tokio::test]
async fn targets_keep_separate_ledgers() {
    let f = fixture().await;
    f.repo.like(7, f.post).await.unwrap();
    f.repo.like(7, f.comment).await.unwrap();
    f.repo.like(8, f.comment).await.unwrap();
    f.repo.like(7, f.reply).await.unwrap();

    assert_eq!(likes_of(&f, f.post).await, 1);
    assert_eq!(likes_of(&f, f.comment).await, 2);
    assert_eq!(likes_of(&f, f.reply).await, 1);

    f.repo.unlike(7, f.comment).await.unwrap();
    assert_eq!(likes_of(&f, f.comment).await, 1);
    assert!(f.repo.like_status(7, f.post).await.unwrap());
    assert!(f.repo.like_status(7, f.reply).await.unwrap());
    assert!(!f.repo.like_status(7, f.comment).await.unwrap());
    assert!(f.repo.like_status(8, f.comment).await.unwrap());
}

#[tokio::test]
async fn missing_targets_are_not_found() {
    let f = fixture().await;
    let LikeTarget::Reply { post_id, comment_id, reply_id } = f.reply else { unreachable!() };
    let bad = [
        LikeTarget::Post { post_id: 9_999 },
        LikeTarget::Comment { post_id, comment_id: 9_999 },
        LikeTarget::Reply { post_id, comment_id, reply_id: 9_999 },
        // right reply, wrong parent comment
        LikeTarget::Reply { post_id, comment_id: reply_id, reply_id },
    ];
    for target in bad {
        assert!(matches!(f.repo.like(7, target).await, Err(RepoError::NotFound)));
        assert!(matches!(f.repo.unlike(7, target).await, Err(RepoError::NotFound)));
        assert!(matches!(f.repo.like_status(7, target).await, Err(RepoError::NotFound)));
    }
}

#[tokio::test]
async fn cascade_scenario_clears_counters_and_ledger() {
    let f = fixture().await;
    let LikeTarget::Reply { post_id, comment_id, .. } = f.reply else { unreachable!() };
    f.repo.like(7, f.reply).await.unwrap();
    f.repo.like(8, f.comment).await.unwrap();
    assert_eq!(f.repo.get_post(post_id).await.unwrap().comments, 2);

    f.repo.delete_comment(post_id, comment_id, &Actor::new(2, Role::User)).await.unwrap();
    assert_eq!(f.repo.get_post(post_id).await.unwrap().comments, 0);
    assert!(matches!(f.repo.like_status(7, f.reply).await, Err(RepoError::NotFound)));
    assert!(matches!(f.repo.like_status(8, f.comment).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn cascade_removes_ledger_entries_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let repo = InMemRepo::with_snapshot_dir(dir.path()).unwrap();
    let p = repo
        .create_post(
            1,
            NewPost {
                title: "Snapshot cascade".into(),
                description: "d".into(),
                headers: vec![Header { id: "a".into(), level: HeaderLevel::H2, value: "A".into() }],
                cover: "c.png".into(),
                content: vec![ContentBlock::Text { value: "t".into() }],
                tags: vec!["x".into()],
            },
        )
        .await
        .unwrap();
    let c = repo.create_comment(p.id, 2, "c".into()).await.unwrap();
    let r = repo
        .create_reply(p.id, c.id, 3, NewReply { reply_to_username: None, body: "r".into() })
        .await
        .unwrap();
    repo.like(7, LikeTarget::Reply { post_id: p.id, comment_id: c.id, reply_id: r.id }).await.unwrap();
    repo.like(7, LikeTarget::Post { post_id: p.id }).await.unwrap();

    repo.delete_comment(p.id, c.id, &Actor::new(50, Role::Admin)).await.unwrap();

    let raw = std::fs::read(dir.path().join("state.json")).unwrap();
    let state: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert!(state["replies"].as_object().unwrap().is_empty());
    assert!(state["comments"].as_object().unwrap().is_empty());
    let likes = state["likes"].as_object().unwrap();
    assert_eq!(likes.len(), 1, "only the post like survives");
    assert_eq!(state["posts"][p.id.to_string()]["comments"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_likes_count_each_user_once() {
    let f = fixture().await;
    let mut handles = Vec::new();
    for i in 0..40 {
        let repo = f.repo.clone();
        let target = f.comment;
        // every user fires twice
        handles.push(tokio::spawn(async move { repo.like(100 + i % 20, target).await }));
    }
    let mut changed = 0;
    for h in handles {
        if h.await.unwrap().unwrap().changed {
            changed += 1;
        }
    }
    assert_eq!(changed, 20);
    assert_eq!(likes_of(&f, f.comment).await, 20);
}
