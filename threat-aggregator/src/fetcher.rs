use crate::types::{AggregatorError, FetchConfig, FetchResult, Result};
use crate::utils::time::http_date;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml";

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Self {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            config,
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch a feed document, retrying transient failures with exponential
    /// backoff. Failures are reported in the `FetchResult`, not as `Err`;
    /// only a malformed URL is an error.
    pub async fn fetch_feed(&self, url: &str, last_seen: Option<DateTime<Utc>>) -> Result<FetchResult> {
        let start_time = Instant::now();
        let fetch_time = Utc::now();

        debug!("Fetching feed: {}", url);

        self.apply_rate_limit(url).await?;

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        };

        let mut last_error = None;
        let mut last_status = None;

        for attempt in 0..=self.config.max_retries {
            match self.send_conditional(url, last_seen).await {
                Ok(response) => {
                    let response_time = start_time.elapsed().as_millis() as u64;
                    let status = response.status();
                    last_status = Some(status.as_u16());

                    if status == reqwest::StatusCode::NOT_MODIFIED {
                        debug!("Feed not modified: {}", url);
                        return Ok(FetchResult {
                            url: url.to_string(),
                            success: true,
                            not_modified: true,
                            error: None,
                            fetch_time,
                            response_time_ms: response_time,
                            http_status: Some(status.as_u16()),
                            content: None,
                        });
                    }

                    if !status.is_success() {
                        last_error = Some(AggregatorError::General(format!(
                            "HTTP {}: {}",
                            status,
                            status.canonical_reason().unwrap_or("Unknown")
                        )));

                        // Client errors will not improve on retry
                        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
                            break;
                        }

                        if attempt < self.config.max_retries {
                            if let Some(delay) = backoff.next_backoff() {
                                warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                        }
                        break;
                    }

                    if let Some(content_length) = response.content_length() {
                        let size_mb = content_length as usize / (1024 * 1024);
                        if size_mb > self.config.max_feed_size_mb {
                            let e = AggregatorError::FeedTooLarge { size_mb };
                            return Ok(self.failed(url, fetch_time, start_time, Some(status.as_u16()), e.to_string()));
                        }
                    }

                    match response.text().await {
                        Ok(content) => {
                            info!("Successfully fetched feed: {} ({} bytes)", url, content.len());
                            return Ok(FetchResult {
                                url: url.to_string(),
                                success: true,
                                not_modified: false,
                                error: None,
                                fetch_time,
                                response_time_ms: response_time,
                                http_status: Some(status.as_u16()),
                                content: Some(content),
                            });
                        }
                        Err(e) => {
                            last_error = Some(AggregatorError::Http(e));
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(e);

                    if attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            }
        }

        let error_msg = last_error.map(|e| e.to_string()).unwrap_or_else(|| "Unknown error".to_string());
        error!("Failed to fetch feed {}: {}", url, error_msg);

        Ok(self.failed(url, fetch_time, start_time, last_status, error_msg))
    }

    fn failed(
        &self,
        url: &str,
        fetch_time: DateTime<Utc>,
        start_time: Instant,
        http_status: Option<u16>,
        error: String,
    ) -> FetchResult {
        FetchResult {
            url: url.to_string(),
            success: false,
            not_modified: false,
            error: Some(error),
            fetch_time,
            response_time_ms: start_time.elapsed().as_millis() as u64,
            http_status,
            content: None,
        }
    }

    async fn send_conditional(&self, url: &str, last_seen: Option<DateTime<Utc>>) -> Result<Response> {
        let mut request = self.client.get(url).header("Accept", FEED_ACCEPT);

        if let Some(last_seen) = last_seen {
            request = request.header("If-Modified-Since", http_date(last_seen));
        }

        let response = request.send().await?;
        Ok(response)
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url.host_str().unwrap_or("").to_string();

        let min_interval = Duration::from_millis(self.config.min_host_interval_ms);

        let mut rate_limiter = self.rate_limiter.write().await;

        if let Some(last_request) = rate_limiter.get(&host) {
            let elapsed = last_request.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!("Rate limiting {}: waiting {:?}", host, wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        rate_limiter.insert(host, Instant::now());

        Ok(())
    }
}
