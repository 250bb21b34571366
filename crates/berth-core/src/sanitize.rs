//! Log-injection defense.
//!
//! Every user-supplied string that reaches a log line goes through
//! [`sanitize_for_log`] first: newlines, carriage returns and tabs are
//! escaped, other control characters are dropped, and the result is
//! truncated to a bounded length.

/// Default truncation limit for sanitized log fields.
pub const DEFAULT_MAX_LEN: usize = 100;

/// Sanitize `input` for inclusion in a log line, truncating to
/// [`DEFAULT_MAX_LEN`] characters.
pub fn sanitize_for_log(input: &str) -> String {
    sanitize_for_log_n(input, DEFAULT_MAX_LEN)
}

/// Sanitize `input` for inclusion in a log line, truncating to `max_len`
/// characters.  Truncation is marked with a trailing ellipsis.
pub fn sanitize_for_log_n(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    let mut count = 0usize;
    for c in input.chars() {
        if count >= max_len {
            out.push('…');
            break;
        }
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => continue,
            c => out.push(c),
        }
        count += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_tabs() {
        assert_eq!(sanitize_for_log("a\nb\rc\td"), "a\\nb\\rc\\td");
    }

    #[test]
    fn drops_other_control_characters() {
        assert_eq!(sanitize_for_log("a\x00b\x1bc"), "abc");
    }

    #[test]
    fn truncates_long_input() {
        let long = "x".repeat(500);
        let out = sanitize_for_log(&long);
        assert!(out.chars().count() <= DEFAULT_MAX_LEN + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn passes_ordinary_text_through() {
        assert_eq!(sanitize_for_log("ai/smollm2:latest"), "ai/smollm2:latest");
    }
}
