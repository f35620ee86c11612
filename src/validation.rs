//! Request validation performed before any store call.

use crate::cursor::Sort;
use crate::models::{ContentBlock, Header, NewPost, UpdatePost, UpdateUser};
use crate::slug::slugify;

pub const MAX_BODY_LEN: usize = 5000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

fn require_text(field: &'static str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

fn validate_title(title: &str) -> ValidationResult<()> {
    require_text("title", title)?;
    if slugify(title).is_empty() {
        return Err(ValidationError::new("title", "must contain at least one letter or digit"));
    }
    Ok(())
}

fn validate_headers(headers: &[Header]) -> ValidationResult<()> {
    if headers.is_empty() {
        return Err(ValidationError::new("headers", "must not be an empty array"));
    }
    for h in headers {
        if h.id.trim().is_empty() {
            return Err(ValidationError::new("headers", "header id must be a non-empty string"));
        }
        if h.value.trim().is_empty() {
            return Err(ValidationError::new("headers", "header value must be a non-empty string"));
        }
    }
    Ok(())
}

fn validate_content(content: &[ContentBlock]) -> ValidationResult<()> {
    if content.is_empty() {
        return Err(ValidationError::new("content", "must not be an empty array"));
    }
    for block in content {
        if block.value().trim().is_empty() {
            return Err(ValidationError::new("content", "block value must be a non-empty string"));
        }
        if let ContentBlock::CodeSnippet { language, .. } = block {
            if language.trim().is_empty() {
                return Err(ValidationError::new("content", "code block requires a language"));
            }
        }
    }
    Ok(())
}

fn validate_tag_list(tags: &[String]) -> ValidationResult<()> {
    if normalize_tags(tags.to_vec()).is_empty() {
        return Err(ValidationError::new("tags", "must not be an empty array"));
    }
    Ok(())
}

pub fn validate_new_post(p: &NewPost) -> ValidationResult<()> {
    validate_title(&p.title)?;
    require_text("description", &p.description)?;
    validate_headers(&p.headers)?;
    require_text("cover", &p.cover)?;
    validate_content(&p.content)?;
    validate_tag_list(&p.tags)
}

/// Same rules as creation, applied only to the fields present.
pub fn validate_update_post(p: &UpdatePost) -> ValidationResult<()> {
    if let Some(t) = &p.title { validate_title(t)?; }
    if let Some(d) = &p.description { require_text("description", d)?; }
    if let Some(h) = &p.headers { validate_headers(h)?; }
    if let Some(c) = &p.cover { require_text("cover", c)?; }
    if let Some(c) = &p.content { validate_content(c)?; }
    if let Some(t) = &p.tags { validate_tag_list(t)?; }
    Ok(())
}

/// Comment/reply body: trimmed, non-empty, bounded.
pub fn validate_body(body: &str) -> ValidationResult<String> {
    let body = body.trim();
    require_text("body", body)?;
    if body.chars().count() > MAX_BODY_LEN {
        return Err(ValidationError::new("body", format!("must be at most {MAX_BODY_LEN} characters")));
    }
    Ok(body.to_string())
}

fn validate_username(username: &str) -> ValidationResult<()> {
    require_text("username", username)?;
    let ok = username
        .trim()
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        return Err(ValidationError::new("username", "may only contain letters, digits, '_', '-' and '.'"));
    }
    Ok(())
}

fn validate_image_url(url: &str) -> ValidationResult<()> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or_default();
    if rest.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("profile_image", "should be an http(s) URL"));
    }
    Ok(())
}

/// Profile edit; only the fields present are checked.
pub fn validate_update_user(u: &UpdateUser) -> ValidationResult<()> {
    if let Some(n) = &u.full_name { require_text("full_name", n)?; }
    if let Some(n) = &u.username { validate_username(n)?; }
    if let Some(b) = &u.bio {
        if b.trim().chars().count() > MAX_BODY_LEN {
            return Err(ValidationError::new("bio", format!("must be at most {MAX_BODY_LEN} characters")));
        }
    }
    if let Some(i) = &u.profile_image { validate_image_url(i)?; }
    Ok(())
}

/// The user directory orders by creation only.
pub fn validate_user_sort(sort: Sort) -> ValidationResult<Sort> {
    match sort {
        Sort::Top => Err(ValidationError::new("sort", "should be either 'latest' or 'oldest'")),
        other => Ok(other),
    }
}

/// Page size from the query string; absent means `default`.
pub fn validate_limit(limit: Option<usize>, default: usize) -> ValidationResult<usize> {
    match limit {
        None => Ok(default),
        Some(0) => Err(ValidationError::new("limit", "should be a positive integer")),
        Some(n) => Ok(n),
    }
}

/// Comma-separated tag filter, e.g. `rust,async`.
pub fn parse_tag_filter(raw: &str) -> ValidationResult<Vec<String>> {
    if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == ',') {
        return Err(ValidationError::new("tags", "should be a comma-separated list of words"));
    }
    Ok(normalize_tags(raw.split(',').map(str::to_string).collect()))
}

/// Trim, lower-case and de-duplicate tags, keeping first-seen order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
