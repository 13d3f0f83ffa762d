//! Small string helpers shared by logging and report formatting.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on character boundaries, so multi-byte UTF-8 input (emoji, CJK)
/// never splits a code point.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Human-readable form of a transport identity: `916356545412@c.us` → `+916356545412`.
pub fn display_identity(identity: &str) -> String {
    let bare = identity
        .split_once('@')
        .map_or(identity, |(user, _)| user)
        .trim_start_matches('+');
    format!("+{bare}")
}
