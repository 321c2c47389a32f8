use crate::types::{IocCandidate, IocSet, IocType};
use crate::utils::text::{char_offset, context_window};
use regex::{Regex, RegexBuilder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;
use tracing::debug;

const CONTEXT_RADIUS: usize = 50;

const BASE_CONFIDENCE: f64 = 0.5;
const KEYWORD_WEIGHT: f64 = 0.1;
const MAX_KEYWORD_BONUS: f64 = 0.3;
const INFRASTRUCTURE_PENALTY: f64 = 0.2;
const MIN_CONFIDENCE: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 1.0;

const THREAT_KEYWORDS: [&str; 13] = [
    "malware", "malicious", "threat", "attack", "compromise", "exploit",
    "phishing", "scam", "fraud", "suspicious", "blacklist", "c2", "c&c",
];

/// Substrings of big cloud/CDN names; mentions of these are usually
/// infrastructure, not adversary hosts.
const INFRASTRUCTURE_MARKERS: [&str; 4] = ["google", "microsoft", "amazon", "cloudflare"];

const BENIGN_HOSTS: [&str; 4] = ["example.com", "test.com", "localhost", "www.w3.org"];

/// Surface forms per type, applied in order. The third field selects
/// case-insensitive matching.
const PATTERNS: &[(IocType, &str, bool)] = &[
    (IocType::Ip, r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b", true),
    (IocType::Ip, r"\b(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}\b", true),
    (
        IocType::Domain,
        r"\b[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?)*\.[a-z]{2,}\b",
        true,
    ),
    (IocType::Url, r#"https?://[^\s<>"{}|\\^`\[\]]+"#, true),
    (IocType::Url, r#"ftp://[^\s<>"{}|\\^`\[\]]+"#, true),
    (IocType::Url, r#"hxxps?://[^\s<>"{}|\\^`\[\]]+"#, true),
    (IocType::HashMd5, r"\b[a-f0-9]{32}\b", true),
    (IocType::HashSha1, r"\b[a-f0-9]{40}\b", true),
    (IocType::HashSha256, r"\b[a-f0-9]{64}\b", true),
    (IocType::Email, r"\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b", true),
    (IocType::Cve, r"CVE-[0-9]{4}-[0-9]{4,7}", true),
    // The one case-sensitive pattern: base58 excludes 0, O, I and l, and
    // folding case would readmit them (and let hex hashes through).
    (IocType::Bitcoin, r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b", false),
    (IocType::Bitcoin, r"\bbc1[a-z0-9]{39,59}\b", true),
];

static DEFAULT_EXTRACTOR: LazyLock<IocExtractor> = LazyLock::new(IocExtractor::new);

struct IocPattern {
    ioc_type: IocType,
    regex: Regex,
}

/// Multi-pattern IOC detector with per-type validation and confidence scoring.
///
/// Stateless once built; `extract` is a pure function of its input.
pub struct IocExtractor {
    patterns: Vec<IocPattern>,
}

impl IocExtractor {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .map(|(ioc_type, pattern, case_insensitive)| IocPattern {
                ioc_type: *ioc_type,
                regex: RegexBuilder::new(pattern)
                    .case_insensitive(*case_insensitive)
                    .build()
                    .expect("IOC patterns are valid"),
            })
            .collect();

        Self { patterns }
    }

    /// Scan `text` for indicators. The result always carries all nine types.
    pub fn extract(&self, text: &str) -> IocSet {
        let mut iocs = IocSet::new();

        for pattern in &self.patterns {
            for found in pattern.regex.find_iter(text) {
                let value = found.as_str();

                if !is_valid_ioc(value, pattern.ioc_type) {
                    continue;
                }

                let context = context_window(text, found.start(), found.end(), CONTEXT_RADIUS);
                let confidence = score_confidence(value, pattern.ioc_type, &context);

                let added = iocs.insert_unique(IocCandidate {
                    ioc_type: pattern.ioc_type,
                    value: value.to_string(),
                    context,
                    position: char_offset(text, found.start()),
                    confidence,
                });

                if !added {
                    debug!("Skipping duplicate {} IOC: {}", pattern.ioc_type, value);
                }
            }
        }

        debug!("Extracted {} IOCs from {} characters", iocs.total(), text.chars().count());
        iocs
    }
}

impl Default for IocExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract with a lazily built, process-wide extractor.
pub fn extract_iocs(text: &str) -> IocSet {
    DEFAULT_EXTRACTOR.extract(text)
}

/// Type-specific acceptance check for a raw pattern match.
pub fn is_valid_ioc(value: &str, ioc_type: IocType) -> bool {
    match ioc_type {
        IocType::Ip => value
            .parse::<IpAddr>()
            .map(|ip| is_external_ip(&ip))
            .unwrap_or(false),
        IocType::Domain => {
            let labels = value.split('.').filter(|label| !label.is_empty()).count();
            labels >= 2 && !BENIGN_HOSTS.iter().any(|host| host.eq_ignore_ascii_case(value))
        }
        IocType::HashMd5 => is_hex_of_len(value, 32),
        IocType::HashSha1 => is_hex_of_len(value, 40),
        IocType::HashSha256 => is_hex_of_len(value, 64),
        IocType::Email => match value.split_once('@') {
            Some((_, domain)) => domain.contains('.'),
            None => false,
        },
        // A hex-only string here is a hash that happens to fit the base58 shape.
        IocType::Bitcoin => !value.chars().all(|c| c.is_ascii_hexdigit()),
        IocType::Url | IocType::Cve => true,
    }
}

/// Confidence in [0.1, 1.0] from context keywords, type reliability and
/// well-known infrastructure names.
pub fn score_confidence(value: &str, ioc_type: IocType, context: &str) -> f64 {
    let mut confidence = BASE_CONFIDENCE;

    let context_lower = context.to_lowercase();
    let keyword_matches = THREAT_KEYWORDS
        .iter()
        .filter(|keyword| context_lower.contains(*keyword))
        .count();
    confidence += (keyword_matches as f64 * KEYWORD_WEIGHT).min(MAX_KEYWORD_BONUS);

    confidence += match ioc_type {
        IocType::HashSha256 => 0.1,
        IocType::Cve => 0.2,
        _ => 0.0,
    };

    if matches!(ioc_type, IocType::Domain | IocType::Ip) {
        let value_lower = value.to_lowercase();
        if INFRASTRUCTURE_MARKERS.iter().any(|marker| value_lower.contains(marker)) {
            confidence -= INFRASTRUCTURE_PENALTY;
        }
    }

    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_external_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_external_v4(v4),
        IpAddr::V6(v6) => is_external_v6(v6),
    }
}

fn is_external_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation())
}

fn is_external_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
