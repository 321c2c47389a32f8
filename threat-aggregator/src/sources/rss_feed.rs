use crate::types::{FeedSource, FetchConfig, RawEntry};
use crate::{FeedParser, Fetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// RSS/Atom source over HTTP.
///
/// Fetch failures, `304 Not Modified` and unreadable documents all come back
/// as an empty entry list.
pub struct RssFeedSource {
    fetcher: Fetcher,
    parser: FeedParser,
}

impl RssFeedSource {
    pub fn new(fetch_config: FetchConfig) -> Self {
        Self {
            fetcher: Fetcher::new(fetch_config),
            parser: FeedParser::new(),
        }
    }

    pub fn with_parser(mut self, parser: FeedParser) -> Self {
        self.parser = parser;
        self
    }
}

impl Default for RssFeedSource {
    fn default() -> Self {
        Self::new(FetchConfig::default())
    }
}

#[async_trait]
impl FeedSource for RssFeedSource {
    async fn fetch(&self, url: &str, last_seen: Option<DateTime<Utc>>) -> Vec<RawEntry> {
        info!("Pulling RSS feed: {}", url);

        let fetch_result = match self.fetcher.fetch_feed(url, last_seen).await {
            Ok(result) => result,
            Err(e) => {
                error!("Cannot fetch RSS feed {}: {}", url, e);
                return Vec::new();
            }
        };

        if !fetch_result.success {
            let error_msg = fetch_result.error.unwrap_or_else(|| "Fetch failed".to_string());
            warn!("Failed to fetch RSS feed {}: {}", url, error_msg);
            return Vec::new();
        }

        let content = match fetch_result.content {
            Some(content) => content,
            None => {
                info!("RSS feed unchanged since last fetch: {}", url);
                return Vec::new();
            }
        };

        match self.parser.parse_feed(&content) {
            Ok(parsed_feed) => {
                info!(
                    "Pulled {} entries from RSS feed {} ({})",
                    parsed_feed.entries.len(),
                    url,
                    parsed_feed.title.as_deref().unwrap_or("untitled")
                );
                parsed_feed.entries
            }
            Err(e) => {
                error!("Unreadable RSS feed {}: {}", url, e);
                Vec::new()
            }
        }
    }
}
