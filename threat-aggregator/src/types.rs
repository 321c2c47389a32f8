use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
// Shared data model and collaborator contracts live in the interfaces crate
pub use interfaces::defs::{FeedEntry, RawEntry, IocType, IocCandidate, IocSet, ThreatRecord, SinkStats};
pub use interfaces::defs::{AnalysisResult, ThreatType, Severity, IocCategory, IocClassification, FALLBACK_MODEL};
pub use interfaces::defs::{FeedSource, InferenceBackend, InferenceRequest, PersistenceSink, PacingClock};

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub success: bool,
    pub not_modified: bool,
    pub error: Option<String>,
    pub fetch_time: DateTime<Utc>,
    pub response_time_ms: u64,
    pub http_status: Option<u16>,
    pub content: Option<String>, // RSS/Atom document
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_feed_size_mb: usize,
    pub max_redirects: usize,
    /// Minimum spacing between two requests to the same host.
    pub min_host_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "AI-ThreatIntel-Aggregator/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 2,
            retry_delay_seconds: 2,
            max_feed_size_mb: 10,
            max_redirects: 5,
            min_host_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "tinyllama".to_string(),
            timeout_seconds: 60,
            probe_timeout_seconds: 5,
            top_p: 0.9,
            max_tokens: 1000,
        }
    }
}

/// A feed the monitor polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
}

impl SourceSpec {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sources: Vec<SourceSpec>,
    /// Pause after each source.
    pub source_interval_seconds: u64,
    /// Pause after a full pass over all sources.
    pub cycle_interval_seconds: u64,
}

impl MonitorConfig {
    pub fn default_sources() -> Vec<SourceSpec> {
        vec![
            SourceSpec::new("Krebs on Security", "https://krebsonsecurity.com/feed/"),
            SourceSpec::new("SANS ISC", "https://isc.sans.edu/rssfeed.xml"),
            SourceSpec::new("Schneier on Security", "https://www.schneier.com/feed/"),
        ]
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sources: Self::default_sources(),
            source_interval_seconds: 5,
            cycle_interval_seconds: 10,
        }
    }
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub entries: Vec<RawEntry>,
    /// Entries were recovered by the markup salvage pass, not a full parse.
    pub salvaged: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    
    #[error("Feed parse error: {0}")]
    Parse(String),
    
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    
    #[error("Inference backend unavailable: {0}")]
    BackendUnavailable(String),
    
    #[error("Feed size exceeds limit: {size_mb}MB")]
    FeedTooLarge { size_mb: usize },
    
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    
    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
