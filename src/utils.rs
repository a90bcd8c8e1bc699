//! Log redaction and small string helpers.
//!
//! Patterns are compiled lazily through `lazy-regex`, which validates them at
//! compile time.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use std::borrow::Cow;

/// `Authorization: Bearer <token>` values
static RE_BEARER: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+");

/// JWT-shaped strings (billing tokens)
static RE_JWT: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+");

/// `*_SECRET=...`, `*_TOKEN=...`, `*_KEY=...`, `*_PASSWORD=...` assignments
static RE_SECRET_ASSIGNMENT: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r#"\b([A-Z][A-Z0-9_]*(?:SECRET|TOKEN|KEY|PASSWORD))=[^\s&"']+"#);

/// Mask credentials before text reaches a log sink.
///
/// Borrows the input unchanged when nothing matched.
#[must_use]
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    if !RE_BEARER.is_match(input) && !RE_JWT.is_match(input) && !RE_SECRET_ASSIGNMENT.is_match(input)
    {
        return Cow::Borrowed(input);
    }
    let output = RE_BEARER.replace_all(input, "${1}[REDACTED]");
    let output = RE_JWT.replace_all(&output, "[JWT]").into_owned();
    let output = RE_SECRET_ASSIGNMENT
        .replace_all(&output, "${1}=[MASKED]")
        .into_owned();
    Cow::Owned(output)
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// This is UTF-8 safe and will not panic on multi-byte characters.
///
/// # Examples
///
/// ```
/// use sandbox_hub::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}
