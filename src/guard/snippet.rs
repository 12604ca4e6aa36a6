//! Byte- and char-safe text windows for snippets and previews.

/// Cut `text` to at most `max_bytes`, backing off to a char boundary.
/// Returns the kept prefix and whether anything was dropped.
///
/// ```
/// use smart_file_search::guard::snippet::cap_bytes;
///
/// assert_eq!(cap_bytes("héllo", 2), ("h", true));
/// assert_eq!(cap_bytes("plan", 10), ("plan", false));
/// ```
pub fn cap_bytes(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

/// A window of about `max_bytes` around the first occurrence of any term
/// (ASCII case-insensitive). Falls back to the start of the text.
pub fn window_around(text: &str, terms: &[String], max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.trim().to_string();
    }

    let haystack = text.to_ascii_lowercase();
    let hit = terms
        .iter()
        .filter(|t| !t.is_empty())
        .filter_map(|t| haystack.find(&t.to_ascii_lowercase()))
        .min();

    let Some(pos) = hit else {
        return cap_bytes(text, max_bytes).0.trim_end().to_string();
    };

    let lead = max_bytes / 3;
    let mut start = pos.saturating_sub(lead);
    if start + max_bytes > text.len() {
        start = text.len().saturating_sub(max_bytes);
    }
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    // Begin on a word if one starts close by.
    if start > 0 {
        if let Some(ws) = text[start..pos].find(char::is_whitespace) {
            start += ws;
        }
    }

    let (window, _) = cap_bytes(&text[start..], max_bytes);
    window.trim().to_string()
}

/// `before` chars before and `after` chars after the middle of `text`.
pub fn centered_window(text: &str, before: usize, after: usize) -> (&str, bool) {
    let total = text.chars().count();
    if total <= before + after {
        return (text, false);
    }
    let mid = total / 2;
    let start_char = mid.saturating_sub(before);
    let end_char = (mid + after).min(total);

    let byte_at = |n: usize| {
        text.char_indices()
            .nth(n)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    };
    (&text[byte_at(start_char)..byte_at(end_char)], true)
}
