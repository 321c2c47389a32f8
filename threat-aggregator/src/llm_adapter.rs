use crate::types::{AggregatorError, InferenceBackend, InferenceRequest, OllamaConfig};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
}

/// Inference backend backed by a local Ollama server.
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(OllamaConfig::default())
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn model_name(&self) -> String {
        self.config.model.clone()
    }

    async fn is_available(&self) -> bool {
        let probe = self
            .client
            .get(self.endpoint("api/tags"))
            .timeout(Duration::from_secs(self.config.probe_timeout_seconds))
            .send()
            .await;

        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Ollama service not available: {}", e);
                false
            }
        }
    }

    async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<String> {
        let body = GenerateBody {
            model: &self.config.model,
            prompt: &request.prompt,
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                top_p: self.config.top_p,
                num_predict: self.config.max_tokens,
            },
        };

        debug!("Sending {} character prompt to {}", request.prompt.len(), self.config.model);

        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .json(&body)
            .send()
            .await
            .map_err(AggregatorError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AggregatorError::BackendUnavailable(format!("HTTP {}: {}", status, detail)).into());
        }

        let reply: GenerateReply = response.json().await.map_err(AggregatorError::Http)?;
        Ok(reply.response.trim().to_string())
    }
}

/// Scripted backend for development and testing.
///
/// Replies are handed out in order; the last one repeats. An empty script
/// behaves like an unreachable server.
pub struct MockInferenceBackend {
    name: String,
    replies: Vec<String>,
    available: bool,
    response_delay_ms: u64,
    prompts: Mutex<Vec<String>>,
}

impl MockInferenceBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: Vec::new(),
            available: true,
            response_delay_ms: 0,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `reply`.
    pub fn replying(name: &str, reply: &str) -> Self {
        Self::new(name).with_replies(vec![reply.to_string()])
    }

    /// Refuses every request and fails the probe.
    pub fn unavailable(name: &str) -> Self {
        Self::new(name).with_availability(false)
    }

    pub fn with_replies(mut self, replies: Vec<String>) -> Self {
        self.replies = replies;
        self
    }

    /// What the probe reports, independent of whether requests succeed.
    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InferenceBackend for MockInferenceBackend {
    fn model_name(&self) -> String {
        self.name.clone()
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<String> {
        let call_index = match self.prompts.lock() {
            Ok(mut prompts) => {
                prompts.push(request.prompt.clone());
                prompts.len() - 1
            }
            Err(_) => 0,
        };

        if self.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.response_delay_ms)).await;
        }

        let reply = self
            .replies
            .get(call_index)
            .or_else(|| self.replies.last())
            .ok_or_else(|| AggregatorError::BackendUnavailable(format!("{}: connection refused", self.name)))?;

        Ok(reply.clone())
    }
}
