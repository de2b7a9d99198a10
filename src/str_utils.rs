use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Log-friendly excerpt of a frame: the first `max_chars` characters, with an
/// ellipsis when something was cut.
pub fn snippet(s: &str, max_chars: usize) -> Cow<'_, str> {
    let prefix = prefix_chars(s, max_chars);
    if prefix.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", prefix))
    }
}

/// First eight characters of an identifier, for compact log fields.
pub fn short_id(id: &str) -> &str {
    prefix_chars(id, 8)
}
