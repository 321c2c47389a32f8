use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `model_used` value stamped on every analysis produced without the inference backend.
pub const FALLBACK_MODEL: &str = "fallback_analysis";

/// A syndication entry as it comes off the wire, before normalization.
///
/// Every field is optional; dates are kept as the raw text the feed carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
    pub updated: Option<String>,
    /// Rich content bodies in document order.
    pub content: Vec<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
}

/// Canonical, immutable form of a feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub title: String,
    pub body: String,
    pub url: String,
    pub author: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IocType {
    Ip,
    Domain,
    Url,
    HashMd5,
    HashSha1,
    HashSha256,
    Email,
    Cve,
    Bitcoin,
}

impl IocType {
    pub const ALL: [IocType; 9] = [
        IocType::Ip,
        IocType::Domain,
        IocType::Url,
        IocType::HashMd5,
        IocType::HashSha1,
        IocType::HashSha256,
        IocType::Email,
        IocType::Cve,
        IocType::Bitcoin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IocType::Ip => "ip",
            IocType::Domain => "domain",
            IocType::Url => "url",
            IocType::HashMd5 => "hash_md5",
            IocType::HashSha1 => "hash_sha1",
            IocType::HashSha256 => "hash_sha256",
            IocType::Email => "email",
            IocType::Cve => "cve",
            IocType::Bitcoin => "bitcoin",
        }
    }
}

impl fmt::Display for IocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IocType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        IocType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown IOC type: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IocCandidate {
    #[serde(rename = "type")]
    pub ioc_type: IocType,
    pub value: String,
    /// Up to 50 characters either side of the match.
    pub context: String,
    /// Character offset of the match in the scanned text.
    pub position: usize,
    pub confidence: f64,
}

/// IOC candidates of one entry, keyed by type.
///
/// All nine types are always present, possibly with an empty list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<IocType, Vec<IocCandidate>>", into = "BTreeMap<IocType, Vec<IocCandidate>>")]
pub struct IocSet {
    by_type: BTreeMap<IocType, Vec<IocCandidate>>,
}

impl IocSet {
    pub fn new() -> Self {
        Self {
            by_type: IocType::ALL.into_iter().map(|t| (t, Vec::new())).collect(),
        }
    }

    pub fn get(&self, ioc_type: IocType) -> &[IocCandidate] {
        self.by_type.get(&ioc_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Adds a candidate unless one with the same value is already recorded
    /// under its type. Returns whether it was added.
    pub fn insert_unique(&mut self, candidate: IocCandidate) -> bool {
        let list = self.by_type.entry(candidate.ioc_type).or_default();
        if list.iter().any(|existing| existing.value == candidate.value) {
            return false;
        }
        list.push(candidate);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (IocType, &[IocCandidate])> {
        self.by_type.iter().map(|(t, list)| (*t, list.as_slice()))
    }

    pub fn candidates(&self) -> impl Iterator<Item = &IocCandidate> {
        self.by_type.values().flatten()
    }

    pub fn values(&self, ioc_type: IocType) -> Vec<&str> {
        self.get(ioc_type).iter().map(|c| c.value.as_str()).collect()
    }

    pub fn total(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Default for IocSet {
    fn default() -> Self {
        Self::new()
    }
}

impl From<BTreeMap<IocType, Vec<IocCandidate>>> for IocSet {
    fn from(map: BTreeMap<IocType, Vec<IocCandidate>>) -> Self {
        let mut set = IocSet::new();
        for (ioc_type, list) in map {
            set.by_type.insert(ioc_type, list);
        }
        set
    }
}

impl From<IocSet> for BTreeMap<IocType, Vec<IocCandidate>> {
    fn from(set: IocSet) -> Self {
        set.by_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Malware,
    Phishing,
    Vulnerability,
    Ransomware,
    DataBreach,
    Other,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::Malware => "malware",
            ThreatType::Phishing => "phishing",
            ThreatType::Vulnerability => "vulnerability",
            ThreatType::Ransomware => "ransomware",
            ThreatType::DataBreach => "data_breach",
            ThreatType::Other => "other",
        }
    }

    /// Lenient mapping for labels written by a free-text model; anything
    /// unrecognised becomes `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "malware" => ThreatType::Malware,
            "phishing" => ThreatType::Phishing,
            "vulnerability" => ThreatType::Vulnerability,
            "ransomware" => ThreatType::Ransomware,
            "data_breach" | "breach" => ThreatType::DataBreach,
            _ => ThreatType::Other,
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Analysis of one entry, from the inference backend or the keyword fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub key_points: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub threat_actors: Vec<String>,
    #[serde(default)]
    pub affected_systems: Vec<String>,
    pub confidence_score: f64,
    pub model_used: String,
    /// Seconds.
    pub processing_time: f64,
}

impl AnalysisResult {
    pub fn is_fallback(&self) -> bool {
        self.model_used == FALLBACK_MODEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IocCategory {
    Malware,
    Phishing,
    C2,
    Scanning,
    Legitimate,
    Unknown,
}

impl IocCategory {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "malware" => IocCategory::Malware,
            "phishing" => IocCategory::Phishing,
            "c2" | "c&c" => IocCategory::C2,
            "scanning" => IocCategory::Scanning,
            "legitimate" => IocCategory::Legitimate,
            _ => IocCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IocClassification {
    pub is_malicious: bool,
    pub confidence: f64,
    pub threat_category: IocCategory,
    pub risk_level: Severity,
    pub notes: String,
}

/// Everything the pipeline derived from one entry, handed to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub entry: FeedEntry,
    pub iocs: IocSet,
    pub analysis: AnalysisResult,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkStats {
    pub total_threats: u64,
    pub ai_analyzed: u64,
    pub fallback_analyzed: u64,
    pub total_iocs: u64,
    /// Records ingested during the last hour.
    pub recent_threats: u64,
}

impl SinkStats {
    /// Share of records analyzed by the inference backend, in percent.
    pub fn analysis_coverage(&self) -> f64 {
        if self.total_threats == 0 {
            return 0.0;
        }
        self.ai_analyzed as f64 / self.total_threats as f64 * 100.0
    }
}

/// A prompt plus the decoding hint sent with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    /// Lower is more deterministic.
    pub temperature: f32,
}

// Contracts the pipeline consumes. Implementations own their transport,
// timeouts and locking; the pipeline only sequences calls.

/// Given a source URL and the time of the last successful fetch, returns the
/// raw entries. Unreachable or unchanged sources yield an empty list.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str, last_seen: Option<DateTime<Utc>>) -> Vec<RawEntry>;
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn model_name(&self) -> String;

    /// Lightweight probe. Only an optimization hint for callers.
    async fn is_available(&self) -> bool;

    /// One request, returning the backend's free text. Timeouts, transport
    /// failures and non-2xx replies are errors.
    async fn generate(&self, request: &InferenceRequest) -> Result<String>;
}

/// Downstream store. Must be idempotent on the entry URL.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn contains_url(&self, url: &str) -> Result<bool>;

    /// Returns `true` when the record was newly stored, `false` when the URL
    /// was already present.
    async fn store(&self, record: &ThreatRecord) -> Result<bool>;

    async fn stats(&self) -> Result<SinkStats>;
}

#[async_trait]
pub trait PacingClock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}
