//! AI analysis of feed entries with a deterministic keyword fallback.
//!
//! The backend is a free-text generator, so its reply is read in two steps:
//! locate the JSON object (first `{` to last `}`), then parse it. Every
//! failure along the way (no backend, transport error, no braces, bad JSON,
//! out-of-range values) ends in the fallback, which produces a result with
//! the same shape.

use crate::types::{
    AnalysisResult, InferenceBackend, InferenceRequest, IocCategory, IocClassification, IocType, Severity,
    ThreatType, FALLBACK_MODEL,
};
use crate::utils::text::truncate_chars;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Characters of body text included in an analysis prompt.
pub const PROMPT_BODY_CHARS: usize = 1000;
/// Characters of surrounding text included in an IOC classification prompt.
pub const PROMPT_CONTEXT_CHARS: usize = 500;

/// Upper bound on one backend request, on top of whatever the backend
/// enforces itself.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

const ANALYSIS_TEMPERATURE: f32 = 0.3;
const FALLBACK_CONFIDENCE: f64 = 0.3;
const DEFAULT_MODEL_CONFIDENCE: f64 = 0.7;
const FALLBACK_IOC_CONFIDENCE: f64 = 0.5;

const RANSOMWARE_WORDS: &[&str] = &["ransomware", "ransom"];

/// Checked in order once ransomware has been ruled out.
const KEYWORD_BUCKETS: [(&[&str], ThreatType, Severity); 4] = [
    (&["malware", "virus", "trojan", "backdoor"], ThreatType::Malware, Severity::High),
    (&["phishing", "phish", "scam"], ThreatType::Phishing, Severity::Medium),
    (&["vulnerability", "cve-", "exploit"], ThreatType::Vulnerability, Severity::High),
    (&["breach", "leak", "exposed"], ThreatType::DataBreach, Severity::High),
];

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("no JSON object in backend response")]
    Missing,

    #[error("malformed JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid field value: {0}")]
    InvalidField(String),
}

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    summary: String,
    threat_type: String,
    severity: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    threat_actors: Vec<String>,
    #[serde(default)]
    affected_systems: Vec<String>,
    confidence_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ClassificationPayload {
    is_malicious: bool,
    confidence: f64,
    threat_category: String,
    risk_level: String,
    #[serde(default)]
    notes: String,
}

/// Orchestrates analysis requests against an injected inference backend.
pub struct ThreatAnalyzer {
    backend: Option<Arc<dyn InferenceBackend>>,
    request_timeout: Duration,
}

impl ThreatAnalyzer {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend: Some(backend),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// An analyzer with no backend; every call takes the fallback path.
    pub fn offline() -> Self {
        Self {
            backend: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn model_name(&self) -> Option<String> {
        self.backend.as_ref().map(|b| b.model_name())
    }

    /// Forwards the backend's availability probe. `analyze` does not depend
    /// on it.
    pub async fn is_backend_available(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.is_available().await,
            None => false,
        }
    }

    /// Analyze one entry. Never fails: any backend or parse problem yields
    /// the keyword fallback.
    pub async fn analyze(&self, title: &str, body: &str) -> AnalysisResult {
        let start_time = Instant::now();

        let Some(backend) = &self.backend else {
            return fallback_analysis(title, body);
        };

        let request = InferenceRequest {
            prompt: build_analysis_prompt(title, body),
            temperature: ANALYSIS_TEMPERATURE,
        };

        let response = self.generate(&**backend, &request).await;
        let processing_time = start_time.elapsed().as_secs_f64();

        let text = match response {
            Ok(text) => text,
            Err(e) => {
                warn!("Inference backend unavailable, using fallback analysis: {}", e);
                return AnalysisResult {
                    processing_time,
                    ..fallback_analysis(title, body)
                };
            }
        };

        match parse_analysis_response(&text, &backend.model_name(), processing_time) {
            Ok(analysis) => {
                info!("AI analysis completed for: {}", truncate_chars(title, 50));
                analysis
            }
            Err(e) => {
                warn!("Could not use backend analysis, using fallback: {}", e);
                debug!("Raw backend response: {}", text);
                AnalysisResult {
                    processing_time,
                    ..fallback_analysis(title, body)
                }
            }
        }
    }

    /// Assess a single indicator. Absent an answer, the indicator is treated
    /// as malicious with medium confidence.
    pub async fn classify_ioc(&self, value: &str, ioc_type: IocType, context: &str) -> IocClassification {
        let Some(backend) = &self.backend else {
            return fallback_classification("Analysis unavailable");
        };

        let request = InferenceRequest {
            prompt: build_classification_prompt(value, ioc_type, context),
            temperature: ANALYSIS_TEMPERATURE,
        };

        let text = match self.generate(&**backend, &request).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Inference backend unavailable for IOC {}: {}", value, e);
                return fallback_classification("Analysis unavailable");
            }
        };

        match parse_classification_response(&text) {
            Ok(classification) => classification,
            Err(e) => {
                warn!("Error parsing IOC classification for {}: {}", value, e);
                fallback_classification("Parse error")
            }
        }
    }

    async fn generate(&self, backend: &dyn InferenceBackend, request: &InferenceRequest) -> anyhow::Result<String> {
        match tokio::time::timeout(self.request_timeout, backend.generate(request)).await {
            Ok(response) => response,
            Err(_) => anyhow::bail!("no reply within {:?}", self.request_timeout),
        }
    }
}

/// The substring from the first `{` to the last `}` inclusive, or `None`
/// when either is missing or the last `}` comes before the first `{`.
pub fn extract_json_envelope(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Read an `AnalysisResult` out of raw backend text, stamping the model and
/// elapsed time.
pub fn parse_analysis_response(
    text: &str,
    model_used: &str,
    processing_time: f64,
) -> std::result::Result<AnalysisResult, EnvelopeError> {
    let envelope = extract_json_envelope(text).ok_or(EnvelopeError::Missing)?;
    let payload: AnalysisPayload = serde_json::from_str(envelope)?;

    let severity = payload.severity.parse::<Severity>().map_err(EnvelopeError::InvalidField)?;
    let confidence_score = match payload.confidence_score {
        Some(score) if score.is_finite() => score.clamp(0.0, 1.0),
        Some(score) => return Err(EnvelopeError::InvalidField(format!("confidence_score {}", score))),
        None => DEFAULT_MODEL_CONFIDENCE,
    };

    Ok(AnalysisResult {
        summary: payload.summary,
        threat_type: ThreatType::from_label(&payload.threat_type),
        severity,
        key_points: payload.key_points,
        recommendations: payload.recommendations,
        threat_actors: payload.threat_actors,
        affected_systems: payload.affected_systems,
        confidence_score,
        model_used: model_used.to_string(),
        processing_time: processing_time.max(0.0),
    })
}

pub fn parse_classification_response(text: &str) -> std::result::Result<IocClassification, EnvelopeError> {
    let envelope = extract_json_envelope(text).ok_or(EnvelopeError::Missing)?;
    let payload: ClassificationPayload = serde_json::from_str(envelope)?;

    let risk_level = payload.risk_level.parse::<Severity>().map_err(EnvelopeError::InvalidField)?;
    if !payload.confidence.is_finite() {
        return Err(EnvelopeError::InvalidField(format!("confidence {}", payload.confidence)));
    }

    Ok(IocClassification {
        is_malicious: payload.is_malicious,
        confidence: payload.confidence.clamp(0.0, 1.0),
        threat_category: IocCategory::from_label(&payload.threat_category),
        risk_level,
        notes: payload.notes,
    })
}

/// Keyword classification over `title` and `body`. Pure: the same input
/// always yields the same result, with `processing_time` 0.
pub fn fallback_analysis(title: &str, body: &str) -> AnalysisResult {
    let (threat_type, severity) = classify_keywords(&format!("{} {}", title, body));

    AnalysisResult {
        summary: format!("Threat intelligence report: {}...", truncate_chars(title, 100)),
        threat_type,
        severity,
        key_points: vec!["Analysis unavailable - LLM service offline".to_string()],
        recommendations: vec!["Review article manually".to_string(), "Monitor for IOCs".to_string()],
        threat_actors: Vec::new(),
        affected_systems: Vec::new(),
        confidence_score: FALLBACK_CONFIDENCE,
        model_used: FALLBACK_MODEL.to_string(),
        processing_time: 0.0,
    }
}

/// Ransomware vocabulary wins over every other bucket; otherwise the first
/// matching bucket decides, and no match is `(Other, Medium)`.
pub fn classify_keywords(text: &str) -> (ThreatType, Severity) {
    let text_lower = text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|word| text_lower.contains(word));

    if mentions(RANSOMWARE_WORDS) {
        return (ThreatType::Ransomware, Severity::Critical);
    }

    KEYWORD_BUCKETS
        .iter()
        .find(|(words, _, _)| mentions(words))
        .map(|(_, threat_type, severity)| (*threat_type, *severity))
        .unwrap_or((ThreatType::Other, Severity::Medium))
}

fn fallback_classification(notes: &str) -> IocClassification {
    IocClassification {
        is_malicious: true,
        confidence: FALLBACK_IOC_CONFIDENCE,
        threat_category: IocCategory::Unknown,
        risk_level: Severity::Medium,
        notes: notes.to_string(),
    }
}

pub fn build_analysis_prompt(title: &str, body: &str) -> String {
    format!(
        r#"Analyze this cybersecurity article in 2-3 sentences.

Title: {}
Content: {}

Respond ONLY with a JSON object of this shape:
{{
    "summary": "Brief 2-3 sentence summary",
    "threat_type": "malware|phishing|vulnerability|ransomware|data_breach|other",
    "severity": "low|medium|high|critical",
    "key_points": ["Point 1", "Point 2"],
    "recommendations": ["Action 1", "Action 2"]
}}
"#,
        title,
        truncate_chars(body, PROMPT_BODY_CHARS)
    )
}

fn build_classification_prompt(value: &str, ioc_type: IocType, context: &str) -> String {
    format!(
        r#"You are a cybersecurity analyst. Assess this Indicator of Compromise.

IOC Type: {}
IOC Value: {}
Context: {}

Respond ONLY with a JSON object of this shape:
{{
    "is_malicious": true,
    "confidence": 0.0,
    "threat_category": "malware|phishing|c2|scanning|legitimate|unknown",
    "risk_level": "low|medium|high|critical",
    "notes": "Brief explanation of the assessment"
}}
"#,
        ioc_type,
        value,
        truncate_chars(context, PROMPT_CONTEXT_CHARS)
    )
}
