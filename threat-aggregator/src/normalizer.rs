//! Raw syndication entry -> canonical `FeedEntry`.

use crate::types::{FeedEntry, RawEntry};
use crate::utils::html::clean_html;
use crate::utils::time::parse_feed_date;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Build a `FeedEntry` from whatever fields the raw entry carries.
///
/// Never fails: a field that cannot be read falls back to its default.
/// `published_at` is `None` when neither date parses; the current time is
/// never substituted.
pub fn normalize(raw: &RawEntry, source_id: &str) -> FeedEntry {
    FeedEntry {
        title: text_field(raw.title.as_deref()),
        body: resolve_body(raw),
        url: text_field(raw.link.as_deref()),
        author: text_field(raw.author.as_deref()),
        published_at: resolve_published(raw),
        source_id: source_id.to_string(),
    }
}

fn text_field(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

fn resolve_published(raw: &RawEntry) -> Option<DateTime<Utc>> {
    let published = raw.published.as_deref().and_then(parse_feed_date);
    if published.is_none() {
        if let Some(unparsed) = raw.published.as_deref() {
            debug!("Unparseable published date {:?}, trying updated", unparsed);
        }
    }
    published.or_else(|| raw.updated.as_deref().and_then(parse_feed_date))
}

fn resolve_body(raw: &RawEntry) -> String {
    let rich: Vec<&str> = raw
        .content
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect();

    let markup = if !rich.is_empty() {
        rich.join(" ")
    } else if let Some(summary) = non_blank(raw.summary.as_deref()) {
        summary.to_string()
    } else if let Some(description) = non_blank(raw.description.as_deref()) {
        description.to_string()
    } else {
        return String::new();
    };

    clean_html(&markup)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
