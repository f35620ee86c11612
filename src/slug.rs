/// Derive a URL slug from a post title.
///
/// Lower-cases and trims the title, collapses every run of characters that are
/// not ASCII letters or digits into a single `-`, and strips dashes from both
/// ends. Returns an empty string for titles without any alphanumerics.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}
