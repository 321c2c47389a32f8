pub mod types;
pub mod utils;
pub mod ioc;
pub mod normalizer;
pub mod parser;
pub mod fetcher;
pub mod sources;
pub mod llm_adapter;
pub mod analyzer;
pub mod threat_store;
pub mod monitor;

pub use types::*;
pub use ioc::{extract_iocs, is_valid_ioc, score_confidence, IocExtractor};
pub use normalizer::normalize;
pub use parser::FeedParser;
pub use fetcher::Fetcher;
pub use sources::RssFeedSource;
pub use llm_adapter::{MockInferenceBackend, OllamaBackend};
pub use analyzer::{extract_json_envelope, fallback_analysis, ThreatAnalyzer};
pub use threat_store::{MemorySink, PostgresSink};
pub use monitor::{CycleReport, MonitorState, ThreatMonitor, TokioClock};
