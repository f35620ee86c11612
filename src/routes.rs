use std::sync::Arc;

use actix_web::{web, HttpResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::{Auth, Role};
use crate::cursor::{CommentPage, PageRequest, PostPage, ReplyPage, Sort, UserPage};
use crate::error::{ApiError, ApiErrorBody};
use crate::models::*;
use crate::repo::{PostQuery, Repo};
use crate::require_role;
use crate::validation::{
    parse_tag_filter, validate_body, validate_limit, validate_new_post, validate_update_post, validate_update_user,
    validate_user_sort,
};

pub const POSTS_DEFAULT_LIMIT: usize = 9;
pub const COMMENTS_DEFAULT_LIMIT: usize = 20;
pub const REPLIES_DEFAULT_LIMIT: usize = 20;
pub const USERS_DEFAULT_LIMIT: usize = 10;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()))
        .app_data(web::QueryConfig::default().error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()))
        .app_data(web::PathConfig::default().error_handler(|_, _| ApiError::NotFound.into()));

    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{post}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/posts/{post}/likes")
                    .route(web::post().to(like_post))
                    .route(web::delete().to(unlike_post)),
            )
            .service(web::resource("/posts/{post}/likes/status").route(web::get().to(post_like_status)))
            .service(
                web::resource("/posts/{post}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(create_comment)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}")
                    .route(web::patch().to(update_comment))
                    .route(web::delete().to(delete_comment)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}/likes")
                    .route(web::post().to(like_comment))
                    .route(web::delete().to(unlike_comment)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}/likes/status")
                    .route(web::get().to(comment_like_status)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}/replies")
                    .route(web::get().to(list_replies))
                    .route(web::post().to(create_reply)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}/replies/{reply}")
                    .route(web::patch().to(update_reply))
                    .route(web::delete().to(delete_reply)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}/replies/{reply}/likes")
                    .route(web::post().to(like_reply))
                    .route(web::delete().to(unlike_reply)),
            )
            .service(
                web::resource("/posts/{post}/comments/{comment}/replies/{reply}/likes/status")
                    .route(web::get().to(reply_like_status)),
            )
            .service(web::resource("/users").route(web::get().to(list_users)))
            .service(
                web::resource("/users/{username}")
                    .route(web::get().to(get_user_profile))
                    .route(web::patch().to(update_user))
                    .route(web::delete().to(delete_user)),
            )
            .service(web::resource("/users/{username}/roles").route(web::post().to(change_user_role))),
    );
    cfg.route("/metrics", web::get().to(render_metrics));
    cfg.default_service(web::to(not_found));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    /// Present when the Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo, metrics: None }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PostListQuery {
    /// `latest` (default), `oldest` or `top`.
    pub sort: Option<Sort>,
    /// Opaque token from a previous page's `next_cursor`.
    pub cursor: Option<String>,
    /// Page size, default 9, at most 100.
    pub limit: Option<usize>,
    /// Case-insensitive substring of title or description.
    pub search: Option<String>,
    /// Comma-separated tags; matches posts with any of them.
    pub tags: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    pub sort: Option<Sort>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserListQuery {
    /// Only users holding this role.
    pub role: Role,
    /// `latest` (default) or `oldest`.
    pub sort: Option<Sort>,
    pub cursor: Option<String>,
    /// Page size, default 10, at most 100.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LikeStatus {
    pub liked: bool,
}

fn page_request(
    sort: Option<Sort>,
    cursor: Option<String>,
    limit: Option<usize>,
    default_sort: Sort,
    default_limit: usize,
) -> Result<PageRequest, ApiError> {
    let limit = validate_limit(limit, default_limit)?;
    Ok(PageRequest::new(sort.unwrap_or(default_sort), limit).with_cursor(cursor))
}

async fn not_found() -> Result<HttpResponse, ApiError> {
    Err(ApiError::NotFound)
}

// ---------------- posts ----------------

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(PostListQuery),
    responses(
        (status = 200, description = "One page of posts", body = PostPage),
        (status = 400, description = "Invalid cursor, limit or filter", body = ApiErrorBody)
    ),
    tag = "posts"
)]
pub async fn list_posts(data: web::Data<AppState>, query: web::Query<PostListQuery>) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let page = page_request(q.sort, q.cursor, q.limit, Sort::Latest, POSTS_DEFAULT_LIMIT)?;
    let tags = match q.tags.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(raw) => parse_tag_filter(raw)?,
        None => Vec::new(),
    };
    let query = PostQuery { page, search: q.search, tags };
    Ok(HttpResponse::Ok().json(data.repo.list_posts(query).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = Post),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 403, description = "Moderators and admins only"),
        (status = 409, description = "Slug already taken")
    ),
    security(("bearer" = [])),
    tag = "posts"
)]
pub async fn create_post(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Moderator | Role::Admin);
    let new = payload.into_inner();
    validate_new_post(&new)?;
    let post = data.repo.create_post(auth.user_id(), new).await?;
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{post}",
    params(("post" = String, Path, description = "Post slug")),
    responses(
        (status = 200, description = "Post", body = Post),
        (status = 404, description = "Post not found")
    ),
    tag = "posts"
)]
pub async fn get_post(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post_by_slug(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{post}",
    params(("post" = Id, Path, description = "Post id")),
    request_body = UpdatePost,
    responses(
        (status = 200, description = "Post updated", body = Post),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 403, description = "Moderators and admins only"),
        (status = 404, description = "Post not found"),
        (status = 409, description = "Slug already taken")
    ),
    security(("bearer" = [])),
    tag = "posts"
)]
pub async fn update_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Moderator | Role::Admin);
    let upd = payload.into_inner();
    validate_update_post(&upd)?;
    let post = data.repo.update_post(path.into_inner(), upd).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{post}",
    params(("post" = Id, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post and everything under it removed"),
        (status = 403, description = "Moderators and admins only")
    ),
    security(("bearer" = [])),
    tag = "posts"
)]
pub async fn delete_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_post(path.into_inner(), &auth.actor()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- reactions ----------------

async fn react(data: &AppState, auth: &Auth, target: LikeTarget, like: bool) -> Result<HttpResponse, ApiError> {
    let status = if like {
        data.repo.like(auth.user_id(), target).await?
    } else {
        data.repo.unlike(auth.user_id(), target).await?
    };
    Ok(HttpResponse::Ok().json(status))
}

async fn like_status(data: &AppState, auth: &Auth, target: LikeTarget) -> Result<HttpResponse, ApiError> {
    let liked = data.repo.like_status(auth.user_id(), target).await?;
    Ok(HttpResponse::Ok().json(LikeStatus { liked }))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{post}/likes",
    params(("post" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Liked; `changed` is false when it already was", body = ReactionStatus),
        (status = 404, description = "Post not found")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn like_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    react(&data, &auth, LikeTarget::Post { post_id: path.into_inner() }, true).await
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{post}/likes",
    params(("post" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Unliked; `changed` is false when there was no like", body = ReactionStatus),
        (status = 404, description = "Post not found")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn unlike_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    react(&data, &auth, LikeTarget::Post { post_id: path.into_inner() }, false).await
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{post}/likes/status",
    params(("post" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Whether the caller likes the post", body = LikeStatus),
        (status = 404, description = "Post not found")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn post_like_status(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    like_status(&data, &auth, LikeTarget::Post { post_id: path.into_inner() }).await
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{post}/comments/{comment}/likes",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Liked", body = ReactionStatus),
        (status = 404, description = "Comment not found under this post")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn like_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, Id)>) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    react(&data, &auth, LikeTarget::Comment { post_id, comment_id }, true).await
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{post}/comments/{comment}/likes",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Unliked", body = ReactionStatus),
        (status = 404, description = "Comment not found under this post")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn unlike_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, Id)>) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    react(&data, &auth, LikeTarget::Comment { post_id, comment_id }, false).await
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{post}/comments/{comment}/likes/status",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Whether the caller likes the comment", body = LikeStatus),
        (status = 404, description = "Comment not found under this post")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn comment_like_status(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    like_status(&data, &auth, LikeTarget::Comment { post_id, comment_id }).await
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{post}/comments/{comment}/replies/{reply}/likes",
    params(
        ("post" = Id, Path, description = "Post id"),
        ("comment" = Id, Path, description = "Comment id"),
        ("reply" = Id, Path, description = "Reply id")
    ),
    responses(
        (status = 200, description = "Liked", body = ReactionStatus),
        (status = 404, description = "Reply not found under this comment")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn like_reply(auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, Id, Id)>) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id, reply_id) = path.into_inner();
    react(&data, &auth, LikeTarget::Reply { post_id, comment_id, reply_id }, true).await
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{post}/comments/{comment}/replies/{reply}/likes",
    params(
        ("post" = Id, Path, description = "Post id"),
        ("comment" = Id, Path, description = "Comment id"),
        ("reply" = Id, Path, description = "Reply id")
    ),
    responses(
        (status = 200, description = "Unliked", body = ReactionStatus),
        (status = 404, description = "Reply not found under this comment")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn unlike_reply(auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, Id, Id)>) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id, reply_id) = path.into_inner();
    react(&data, &auth, LikeTarget::Reply { post_id, comment_id, reply_id }, false).await
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{post}/comments/{comment}/replies/{reply}/likes/status",
    params(
        ("post" = Id, Path, description = "Post id"),
        ("comment" = Id, Path, description = "Comment id"),
        ("reply" = Id, Path, description = "Reply id")
    ),
    responses(
        (status = 200, description = "Whether the caller likes the reply", body = LikeStatus),
        (status = 404, description = "Reply not found under this comment")
    ),
    security(("bearer" = [])),
    tag = "likes"
)]
pub async fn reply_like_status(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id, reply_id) = path.into_inner();
    like_status(&data, &auth, LikeTarget::Reply { post_id, comment_id, reply_id }).await
}

// ---------------- comments ----------------

#[utoipa::path(
    get,
    path = "/api/v1/posts/{post}/comments",
    params(("post" = Id, Path, description = "Post id"), ListQuery),
    responses(
        (status = 200, description = "One page of comments, most liked first by default", body = CommentPage),
        (status = 400, description = "Invalid cursor or limit", body = ApiErrorBody),
        (status = 404, description = "Post not found")
    ),
    tag = "comments"
)]
pub async fn list_comments(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let page = page_request(q.sort, q.cursor, q.limit, Sort::Top, COMMENTS_DEFAULT_LIMIT)?;
    Ok(HttpResponse::Ok().json(data.repo.list_comments(path.into_inner(), page).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{post}/comments",
    params(("post" = Id, Path, description = "Post id")),
    request_body = NewComment,
    responses(
        (status = 201, description = "Comment created", body = Comment),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 404, description = "Post not found")
    ),
    security(("bearer" = [])),
    tag = "comments"
)]
pub async fn create_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewComment>,
) -> Result<HttpResponse, ApiError> {
    let body = validate_body(&payload.body)?;
    let comment = data.repo.create_comment(path.into_inner(), auth.user_id(), body).await?;
    Ok(HttpResponse::Created().json(comment))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{post}/comments/{comment}",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id")),
    request_body = UpdateBody,
    responses(
        (status = 200, description = "Comment updated", body = Comment),
        (status = 403, description = "Only the author may edit"),
        (status = 404, description = "Comment not found under this post")
    ),
    security(("bearer" = [])),
    tag = "comments"
)]
pub async fn update_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    payload: web::Json<UpdateBody>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    let body = validate_body(&payload.body)?;
    let comment = data.repo.update_comment(post_id, comment_id, &auth.actor(), body).await?;
    Ok(HttpResponse::Ok().json(comment))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{post}/comments/{comment}",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id")),
    responses(
        (status = 204, description = "Comment, its replies and their likes removed"),
        (status = 403, description = "Neither the author nor a moderator")
    ),
    security(("bearer" = [])),
    tag = "comments"
)]
pub async fn delete_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, Id)>) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    data.repo.delete_comment(post_id, comment_id, &auth.actor()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- replies ----------------

#[utoipa::path(
    get,
    path = "/api/v1/posts/{post}/comments/{comment}/replies",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id"), ListQuery),
    responses(
        (status = 200, description = "One page of replies, oldest first by default", body = ReplyPage),
        (status = 400, description = "Invalid cursor or limit", body = ApiErrorBody),
        (status = 404, description = "Comment not found under this post")
    ),
    tag = "replies"
)]
pub async fn list_replies(
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    let q = query.into_inner();
    let page = page_request(q.sort, q.cursor, q.limit, Sort::Oldest, REPLIES_DEFAULT_LIMIT)?;
    Ok(HttpResponse::Ok().json(data.repo.list_replies(post_id, comment_id, page).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{post}/comments/{comment}/replies",
    params(("post" = Id, Path, description = "Post id"), ("comment" = Id, Path, description = "Comment id")),
    request_body = NewReply,
    responses(
        (status = 201, description = "Reply created", body = Reply),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 404, description = "Comment not found under this post")
    ),
    security(("bearer" = [])),
    tag = "replies"
)]
pub async fn create_reply(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    payload: web::Json<NewReply>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id) = path.into_inner();
    let payload = payload.into_inner();
    let new = NewReply {
        reply_to_username: payload
            .reply_to_username
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty()),
        body: validate_body(&payload.body)?,
    };
    let reply = data.repo.create_reply(post_id, comment_id, auth.user_id(), new).await?;
    Ok(HttpResponse::Created().json(reply))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{post}/comments/{comment}/replies/{reply}",
    params(
        ("post" = Id, Path, description = "Post id"),
        ("comment" = Id, Path, description = "Comment id"),
        ("reply" = Id, Path, description = "Reply id")
    ),
    request_body = UpdateBody,
    responses(
        (status = 200, description = "Reply updated", body = Reply),
        (status = 403, description = "Only the author may edit"),
        (status = 404, description = "Reply not found under this comment")
    ),
    security(("bearer" = [])),
    tag = "replies"
)]
pub async fn update_reply(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id, Id)>,
    payload: web::Json<UpdateBody>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id, reply_id) = path.into_inner();
    let body = validate_body(&payload.body)?;
    let reply = data.repo.update_reply(post_id, comment_id, reply_id, &auth.actor(), body).await?;
    Ok(HttpResponse::Ok().json(reply))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{post}/comments/{comment}/replies/{reply}",
    params(
        ("post" = Id, Path, description = "Post id"),
        ("comment" = Id, Path, description = "Comment id"),
        ("reply" = Id, Path, description = "Reply id")
    ),
    responses(
        (status = 204, description = "Reply and its likes removed"),
        (status = 403, description = "Neither the author nor a moderator")
    ),
    security(("bearer" = [])),
    tag = "replies"
)]
pub async fn delete_reply(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, comment_id, reply_id) = path.into_inner();
    data.repo.delete_reply(post_id, comment_id, reply_id, &auth.actor()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- users ----------------

#[utoipa::path(
    get,
    path = "/api/v1/users/{username}",
    params(("username" = String, Path, description = "Username, case-insensitive")),
    responses(
        (status = 200, description = "Public profile", body = UserProfile),
        (status = 404, description = "No such user")
    ),
    tag = "users"
)]
pub async fn get_user_profile(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.find_user_by_username(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user.profile()))
}

#[utoipa::path(
    get,
    path = "/api/v1/users",
    params(UserListQuery),
    responses(
        (status = 200, description = "One page of users with the role", body = UserPage),
        (status = 400, description = "Missing role, invalid sort, cursor or limit", body = ApiErrorBody),
        (status = 403, description = "Moderators and admins only")
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn list_users(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<UserListQuery>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Moderator | Role::Admin);
    let q = query.into_inner();
    let sort = validate_user_sort(q.sort.unwrap_or_default())?;
    let page = page_request(Some(sort), q.cursor, q.limit, Sort::Latest, USERS_DEFAULT_LIMIT)?;
    Ok(HttpResponse::Ok().json(data.repo.list_users(q.role, page).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/users/{username}",
    params(("username" = String, Path, description = "Username, case-insensitive")),
    request_body = UpdateUser,
    responses(
        (status = 200, description = "Profile updated", body = UserProfile),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 403, description = "Only the owner or an admin may edit"),
        (status = 404, description = "No such user"),
        (status = 409, description = "Username already taken")
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn update_user(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateUser>,
) -> Result<HttpResponse, ApiError> {
    let upd = payload.into_inner();
    validate_update_user(&upd)?;
    let user = data.repo.update_user(&path.into_inner(), &auth.actor(), upd).await?;
    Ok(HttpResponse::Ok().json(user.profile()))
}

#[utoipa::path(
    delete,
    path = "/api/v1/users/{username}",
    params(("username" = String, Path, description = "Username, case-insensitive")),
    responses(
        (status = 204, description = "Account and its likes removed"),
        (status = 403, description = "Neither the owner nor a moderator or admin of at least the user's role")
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn delete_user(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    data.repo.delete_user(&path.into_inner(), &auth.actor()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/users/{username}/roles",
    params(("username" = String, Path, description = "Username, case-insensitive")),
    request_body = ChangeRole,
    responses(
        (status = 200, description = "Role set; `changed` is false when it already held", body = RoleChange),
        (status = 400, description = "Unknown role", body = ApiErrorBody),
        (status = 403, description = "Admins only"),
        (status = 404, description = "No such user")
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn change_user_role(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ChangeRole>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let change = data.repo.change_role(&path.into_inner(), payload.role).await?;
    Ok(HttpResponse::Ok().json(change))
}

pub async fn render_metrics(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let handle = data.metrics.as_ref().ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render()))
}
