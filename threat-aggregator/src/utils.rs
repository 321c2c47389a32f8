/// HTML cleanup for feed bodies
pub mod html {
    use regex::Regex;
    use std::sync::LazyLock;

    static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));
    static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

    /// Remove tags with a generic matcher (not a parser), decode entities,
    /// collapse whitespace runs and trim.
    pub fn clean_html(html: &str) -> String {
        let without_tags = TAG.replace_all(html, "");
        let decoded = html_escape::decode_html_entities(&without_tags);
        collapse_whitespace(&decoded)
    }

    pub fn collapse_whitespace(text: &str) -> String {
        WHITESPACE.replace_all(text, " ").trim().to_string()
    }
}

/// Character-safe text slicing
pub mod text {
    /// The first `max_chars` characters of `text`.
    pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
        match text.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => &text[..byte_idx],
            None => text,
        }
    }

    /// Character offset of a byte index that lies on a char boundary.
    pub fn char_offset(text: &str, byte_idx: usize) -> usize {
        text[..byte_idx].chars().count()
    }

    /// Up to `radius` characters either side of the byte range `start..end`,
    /// clamped to the text and trimmed.
    pub fn context_window(text: &str, start: usize, end: usize, radius: usize) -> String {
        let window_start = text[..start]
            .char_indices()
            .rev()
            .take(radius)
            .last()
            .map(|(idx, _)| idx)
            .unwrap_or(start);
        let window_end = text[end..]
            .char_indices()
            .nth(radius)
            .map(|(idx, _)| end + idx)
            .unwrap_or(text.len());
        text[window_start..window_end].trim().to_string()
    }
}

/// Date handling for feed timestamps
pub mod time {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

    /// Parse the date forms feeds actually carry: RFC 3339, RFC 2822, and a
    /// few naive forms read as UTC.
    pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc());
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    /// IMF-fixdate, as used by `If-Modified-Since`.
    pub fn http_date(dt: DateTime<Utc>) -> String {
        dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }
}
