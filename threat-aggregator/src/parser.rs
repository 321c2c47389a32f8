use crate::types::{AggregatorError, ParsedFeed, RawEntry, Result};
use feed_rs::parser;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

const DEFAULT_MAX_ENTRIES: usize = 200;

static ENTRY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:item|entry)\b[^>]*>(.*?)</(?:item|entry)\s*>").expect("valid entry block pattern")
});
static ATOM_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<link\b[^>]*\bhref\s*=\s*["']([^"']+)["']"#).expect("valid atom link pattern")
});
static CDATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*<!\[CDATA\[(.*?)\]\]>\s*$").expect("valid cdata pattern")
});

pub struct FeedParser {
    max_entries: usize,
}

impl FeedParser {
    pub fn new() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Parse an RSS/Atom document into raw entries.
    ///
    /// A document feed-rs rejects still yields whatever `<item>`/`<entry>`
    /// blocks can be read out of it; only content with no recognisable
    /// entries is an error.
    pub fn parse_feed(&self, content: &str) -> Result<ParsedFeed> {
        debug!("Parsing feed content ({} bytes)", content.len());

        match parser::parse(content.as_bytes()) {
            Ok(feed) => {
                let title = feed.title.map(|t| t.content);
                let description = feed.description.map(|d| d.content);

                let entries = self.deduplicate(feed.entries.into_iter().map(Self::to_raw_entry));

                info!("Parsed feed with {} entries", entries.len());

                Ok(ParsedFeed {
                    title,
                    description,
                    entries,
                    salvaged: false,
                })
            }
            Err(e) => {
                warn!("Feed parser rejected document, salvaging entries: {}", e);
                let entries = self.deduplicate(salvage_entries(content).into_iter());

                if entries.is_empty() {
                    return Err(AggregatorError::Parse(format!("Failed to parse feed: {}", e)));
                }

                info!("Salvaged {} entries from malformed feed", entries.len());

                Ok(ParsedFeed {
                    title: None,
                    description: None,
                    entries,
                    salvaged: true,
                })
            }
        }
    }

    fn to_raw_entry(entry: feed_rs::model::Entry) -> RawEntry {
        let content = entry.content.and_then(|c| c.body).into_iter().collect();

        RawEntry {
            title: entry.title.map(|t| t.content),
            link: entry.links.first().map(|l| l.href.clone()),
            author: entry.authors.first().map(|a| a.name.clone()),
            published: entry.published.map(|dt| dt.to_rfc3339()),
            updated: entry.updated.map(|dt| dt.to_rfc3339()),
            content,
            summary: entry.summary.map(|s| s.content),
            description: None,
        }
    }

    /// Drop link-less entries and repeats of a link within one document.
    fn deduplicate(&self, entries: impl Iterator<Item = RawEntry>) -> Vec<RawEntry> {
        let mut seen_urls = HashSet::new();
        let mut unique_entries = Vec::new();

        for entry in entries {
            let Some(url) = entry.link.clone().filter(|l| !l.trim().is_empty()) else {
                debug!("Skipping entry without link: {:?}", entry.title);
                continue;
            };

            if !seen_urls.insert(url) {
                debug!("Skipping duplicate entry: {:?}", entry.link);
                continue;
            }

            unique_entries.push(entry);
            if unique_entries.len() >= self.max_entries {
                break;
            }
        }

        unique_entries
    }
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort entry recovery from markup a strict parser refused.
fn salvage_entries(content: &str) -> Vec<RawEntry> {
    ENTRY_BLOCK
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|block| {
            let block = block.as_str();
            let link = element_text(block, "link")
                .filter(|l| !l.is_empty())
                .or_else(|| ATOM_LINK.captures(block).map(|c| decode_xml_text(&c[1])))
                .or_else(|| element_text(block, "guid").filter(|g| g.starts_with("http")));

            RawEntry {
                title: element_text(block, "title"),
                link,
                author: element_text(block, "author").or_else(|| element_text(block, "dc:creator")),
                published: element_text(block, "pubDate").or_else(|| element_text(block, "published")),
                updated: element_text(block, "updated").or_else(|| element_text(block, "dc:date")),
                content: element_text(block, "content:encoded")
                    .or_else(|| element_text(block, "content"))
                    .into_iter()
                    .collect(),
                summary: element_text(block, "summary"),
                description: element_text(block, "description"),
            }
        })
        .collect()
}

/// Text of the first `<tag>…</tag>` in `block`, CDATA unwrapped or
/// XML-decoded. Markup inside is kept for the normalizer.
fn element_text(block: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?is)<{0}\b[^>]*>(.*?)</{0}\s*>", regex::escape(tag));
    let element = Regex::new(&pattern).ok()?;
    let inner = element.captures(block)?.get(1)?.as_str();

    let text = match CDATA.captures(inner) {
        Some(cdata) => cdata[1].trim().to_string(),
        None => decode_xml_text(inner),
    };

    Some(text)
}

fn decode_xml_text(text: &str) -> String {
    html_escape::decode_html_entities(text.trim()).into_owned()
}
