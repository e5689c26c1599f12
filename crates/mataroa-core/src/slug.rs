//! Slug helpers.

use std::sync::OnceLock;

use regex::Regex;

/// Slugs the service accepts in request paths.
fn slug_re() -> &'static Regex {
    static SLUG_RE: OnceLock<Regex> = OnceLock::new();
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9-]{1,128}$").expect("valid slug regex"))
}

fn disallowed_re() -> &'static Regex {
    static DISALLOWED_RE: OnceLock<Regex> = OnceLock::new();
    DISALLOWED_RE.get_or_init(|| Regex::new(r"[^a-z0-9\s-]").expect("valid regex"))
}

fn separators_re() -> &'static Regex {
    static SEPARATORS_RE: OnceLock<Regex> = OnceLock::new();
    SEPARATORS_RE.get_or_init(|| Regex::new(r"[\s_-]+").expect("valid regex"))
}

/// Check whether `slug` is a well-formed post identifier.
pub fn is_valid_slug(slug: &str) -> bool {
    slug_re().is_match(slug)
}

/// Derive a slug from a title the way the service does.
///
/// Lowercases, drops anything outside `[a-z0-9]`, whitespace and dashes,
/// then collapses separators into single dashes.
pub fn slugify(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let cleaned = disallowed_re().replace_all(&lowered, "");
    let dashed = separators_re().replace_all(&cleaned, "-");
    dashed.trim_matches('-').to_string()
}

/// Shorten `text` to at most `max_chars` characters, ending with an ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let kept: String = text.chars().take(max_chars - 1).collect();
    format!("{}…", kept)
}
