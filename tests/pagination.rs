#![cfg(feature = "inmem-store")]

use quill::cursor::{Cursor, PageRequest, Sort};
use quill::models::*;
use quill::repo::inmem::InMemRepo;
use quill::repo::{CommentRepo, LikeRepo, PostQuery, PostRepo, ReplyRepo, RepoError};

fn new_post(title: &str) -> NewPost {
    NewPost {
        title: title.into(),
        description: "paging".into(),
        headers: vec![Header { id: "h".into(), level: HeaderLevel::H3, value: "H".into() }],
        cover: "cover.png".into(),
        content: vec![ContentBlock::Text { value: "text".into() }],
        tags: vec!["paging".into()],
    }
}

async fn seed_posts(r: &InMemRepo, n: usize) -> Vec<Id> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push(r.create_post(1, new_post(&format!("Post number {i}"))).await.unwrap().id);
    }
    ids
}

async fn like_n(r: &InMemRepo, target: LikeTarget, n: i64) {
    for user in 0..n {
        r.like(10_000 + user, target).await.unwrap();
    }
}

#[tokio::test]
async fn three_posts_two_per_page() {
    let r = InMemRepo::new();
    let ids = seed_posts(&r, 3).await;

    let first = r.list_posts(PostQuery::new(PageRequest::new(Sort::Latest, 2))).await.unwrap();
    assert_eq!(first.items.iter().map(|p| p.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);
    let token = first.next_cursor.expect("more pages");
    assert_eq!(Cursor::decode(&token, Sort::Latest).unwrap().id, ids[0]);

    let page = PageRequest::new(Sort::Latest, 2).with_cursor(Some(token));
    let second = r.list_posts(PostQuery::new(page)).await.unwrap();
    assert_eq!(second.items.iter().map(|p| p.id).collect::<Vec<_>>(), vec![ids[0]]);
    assert!(second.next_cursor.is_none());
}

#[tokio::test]
async fn latest_pages_cover_everything_once() {
    let r = InMemRepo::new();
    let mut ids = seed_posts(&r, 25).await;
    ids.reverse();

    let mut seen = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = PageRequest::new(Sort::Latest, 9).with_cursor(cursor.take());
        let got = r.list_posts(PostQuery::new(page)).await.unwrap();
        pages += 1;
        seen.extend(got.items.iter().map(|p| p.id));
        match got.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn exact_multiple_ends_without_cursor() {
    let r = InMemRepo::new();
    seed_posts(&r, 4).await;
    let first = r.list_posts(PostQuery::new(PageRequest::new(Sort::Oldest, 2))).await.unwrap();
    let page = PageRequest::new(Sort::Oldest, 2).with_cursor(first.next_cursor);
    let second = r.list_posts(PostQuery::new(page)).await.unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(second.next_cursor.is_none());
    assert!(first.items[0].id < second.items[1].id);
}

#[tokio::test]
async fn top_order_resolves_cursor_against_live_likes() {
    let r = InMemRepo::new();
    let p = r.create_post(1, new_post("Ranked")).await.unwrap();
    let mut cs = Vec::new();
    for likes in [8, 6, 4, 2, 0] {
        let c = r.create_comment(p.id, 1, format!("{likes} likes")).await.unwrap();
        like_n(&r, LikeTarget::Comment { post_id: p.id, comment_id: c.id }, likes).await;
        cs.push(c.id);
    }

    let first = r.list_comments(p.id, PageRequest::new(Sort::Top, 2)).await.unwrap();
    assert_eq!(first.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![cs[0], cs[1]]);
    let token = first.next_cursor.unwrap();

    // the anchor gains a like between fetches but stays in place relative to its neighbours
    r.like(99, LikeTarget::Comment { post_id: p.id, comment_id: cs[2] }).await.unwrap();

    let second = r
        .list_comments(p.id, PageRequest::new(Sort::Top, 2).with_cursor(Some(token)))
        .await
        .unwrap();
    assert_eq!(second.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![cs[2], cs[3]]);
    assert_eq!(second.items[0].likes, 5);

    let third = r
        .list_comments(p.id, PageRequest::new(Sort::Top, 2).with_cursor(second.next_cursor))
        .await
        .unwrap();
    assert_eq!(third.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![cs[4]]);
    assert!(third.next_cursor.is_none());
}

#[tokio::test]
async fn top_ties_fall_back_to_newest_first() {
    let r = InMemRepo::new();
    let ids = seed_posts(&r, 3).await;
    like_n(&r, LikeTarget::Post { post_id: ids[0] }, 2).await;
    like_n(&r, LikeTarget::Post { post_id: ids[2] }, 2).await;

    let page = r.list_posts(PostQuery::new(PageRequest::new(Sort::Top, 9))).await.unwrap();
    assert_eq!(page.items.iter().map(|p| p.id).collect::<Vec<_>>(), vec![ids[2], ids[0], ids[1]]);
}

#[tokio::test]
async fn deleted_top_anchor_is_invalid_cursor() {
    let r = InMemRepo::new();
    let p = r.create_post(1, new_post("Anchor")).await.unwrap();
    for i in 0..3 {
        r.create_comment(p.id, 1, format!("c{i}")).await.unwrap();
    }
    let first = r.list_comments(p.id, PageRequest::new(Sort::Top, 2)).await.unwrap();
    let token = first.next_cursor.unwrap();
    let anchor = Cursor::decode(&token, Sort::Top).unwrap().id;

    r.delete_comment(p.id, anchor, &Actor::new(1, Role::User)).await.unwrap();
    let err = r
        .list_comments(p.id, PageRequest::new(Sort::Top, 2).with_cursor(Some(token.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidCursor));

    // a token minted for another sort is rejected outright
    let err = r
        .list_comments(p.id, PageRequest::new(Sort::Latest, 2).with_cursor(Some(token)))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidCursor));
}

#[tokio::test]
async fn replies_page_oldest_first() {
    let r = InMemRepo::new();
    let p = r.create_post(1, new_post("Replies")).await.unwrap();
    let c = r.create_comment(p.id, 1, "root".into()).await.unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        let reply = NewReply { reply_to_username: Some("root_author".into()), body: format!("r{i}") };
        ids.push(r.create_reply(p.id, c.id, 2, reply).await.unwrap().id);
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = PageRequest::new(Sort::Oldest, 2).with_cursor(cursor.take());
        let got = r.list_replies(p.id, c.id, page).await.unwrap();
        seen.extend(got.items.iter().map(|x| x.id));
        match got.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, ids);
}
