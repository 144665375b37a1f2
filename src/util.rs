//! Shared utility functions used across the codebase.

/// Parse a flag value. Recognises `1`, `true`, `yes`, `y`, `on`
/// (case-insensitive) as `true`; everything else maps to `false`.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}


/// Largest char boundary in `s` that is `<= max_bytes`.
pub fn safe_truncate_index(s: &str, max_bytes: usize) -> usize {
    if s.len() <= max_bytes {
        return s.len();
    }
    let mut idx = max_bytes;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Shorten a line for log output, appending `...` when cut.
pub fn excerpt(line: &str, max_bytes: usize) -> String {
    if line.len() > max_bytes {
        let end = safe_truncate_index(line, max_bytes);
        format!("{}...", &line[..end])
    } else {
        line.to_string()
    }
}
