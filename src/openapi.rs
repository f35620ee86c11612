use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::cursor::{CommentPage, PostPage, ReplyPage, Sort, UserPage};
use crate::error::ApiErrorBody;
use crate::models::{
    ChangeRole, Comment, ContentBlock, Header, HeaderLevel, NewComment, NewPost, NewReply, Post, PostSummary,
    ReactionStatus, Reply, Role, RoleChange, UpdateBody, UpdatePost, UpdateUser, UserProfile, UserSummary,
};
use crate::routes::LikeStatus;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_posts,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::like_post,
        crate::routes::unlike_post,
        crate::routes::post_like_status,
        crate::routes::list_comments,
        crate::routes::create_comment,
        crate::routes::update_comment,
        crate::routes::delete_comment,
        crate::routes::like_comment,
        crate::routes::unlike_comment,
        crate::routes::comment_like_status,
        crate::routes::list_replies,
        crate::routes::create_reply,
        crate::routes::update_reply,
        crate::routes::delete_reply,
        crate::routes::like_reply,
        crate::routes::unlike_reply,
        crate::routes::reply_like_status,
        crate::routes::list_users,
        crate::routes::get_user_profile,
        crate::routes::update_user,
        crate::routes::delete_user,
        crate::routes::change_user_role,
    ),
    components(schemas(
        Post, PostSummary, NewPost, UpdatePost, ContentBlock, Header, HeaderLevel,
        Comment, NewComment, Reply, NewReply, UpdateBody,
        ReactionStatus, LikeStatus, UserProfile, UserSummary, UpdateUser, ChangeRole, RoleChange, Role, Sort,
        PostPage, CommentPage, ReplyPage, UserPage, ApiErrorBody
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "posts", description = "Post operations"),
        (name = "comments", description = "Comment operations"),
        (name = "replies", description = "Reply operations"),
        (name = "likes", description = "Like ledger"),
        (name = "users", description = "Profiles and account management"),
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).bearer_format("JWT").build()),
            );
        }
    }
}
