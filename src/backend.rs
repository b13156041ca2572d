//! Language-model backends: a hosted chat-completion API and a self-hosted model server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::BackendCfg;
use crate::error::EngineError;
use crate::types::{BackendKind, ModelConfig};
use crate::utils::{mask_secret, snippet};

const ERROR_BODY_CHARS: usize = 800;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model identifier, recorded in the debug trace.
    fn model_name(&self) -> &str;

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, EngineError>;
}

/// Chooses a backend per user; tests substitute scripted backends here.
pub trait BackendFactory {
    fn backend_for(&self, model: &ModelConfig) -> Result<Box<dyn ModelBackend>, EngineError>;
}

/// Builds the HTTP variants from the process configuration.
pub struct HttpBackends {
    cfg: BackendCfg,
}

impl HttpBackends {
    pub fn new(cfg: BackendCfg) -> Self {
        Self { cfg }
    }
}

impl BackendFactory for HttpBackends {
    fn backend_for(&self, model: &ModelConfig) -> Result<Box<dyn ModelBackend>, EngineError> {
        build_backend(model, &self.cfg)
    }
}

/// Pick the variant for a user's model configuration.
pub fn build_backend(
    model: &ModelConfig,
    cfg: &BackendCfg,
) -> Result<Box<dyn ModelBackend>, EngineError> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_sec))
        .build()
        .map_err(|e| EngineError::NotConfigured(format!("http client: {e}")))?;

    match model.kind {
        BackendKind::HostedApi => {
            let api_key = model
                .api_key
                .clone()
                .or_else(|| cfg.hosted_api_key.clone())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    EngineError::NotConfigured("hosted backend requires an API key".into())
                })?;
            let base_url = model
                .base_url
                .clone()
                .unwrap_or_else(|| cfg.hosted_base_url.clone());
            debug!(
                "hosted backend: model={} base={} key={}",
                model.model,
                base_url,
                mask_secret(&api_key)
            );
            Ok(Box::new(HostedApiBackend {
                http,
                base_url,
                api_key,
                model: model.model.clone(),
                temperature: model.temperature,
            }))
        }
        BackendKind::LocalServer => {
            let base_url = model
                .base_url
                .clone()
                .unwrap_or_else(|| cfg.local_base_url.clone());
            debug!("local backend: model={} base={}", model.model, base_url);
            Ok(Box::new(LocalServerBackend {
                http,
                base_url,
                model: model.model.clone(),
                temperature: model.temperature,
            }))
        }
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Non-2xx is a backend error; a body that breaks off mid-read means the
/// server went away.
async fn read_body(resp: reqwest::Response) -> Result<String, EngineError> {
    let status = resp.status();
    let body = resp.text().await;
    if !status.is_success() {
        let body = match body {
            Ok(text) => snippet(&text, ERROR_BODY_CHARS),
            Err(e) => format!("<unreadable body: {e}>"),
        };
        return Err(EngineError::BackendError {
            status: status.as_u16(),
            body,
        });
    }
    body.map_err(|e| EngineError::BackendUnreachable(format!("reading response body: {e}")))
}

// ---------------- Hosted chat-completion API ----------------

pub struct HostedApiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    #[serde(default)]
    content: Option<String>,
}

impl HostedApiBackend {
    fn request(&self, system_prompt: &str, context: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: context.to_string(),
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        }
    }
}

fn chat_content(body: &str) -> Result<String, EngineError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| EngineError::MalformedResponse(format!("chat completion envelope: {e}")))?;
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .unwrap_or_default())
}

#[async_trait]
impl ModelBackend for HostedApiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, EngineError> {
        let start = Instant::now();
        let resp = self
            .http
            .post(endpoint(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&self.request(system_prompt, context))
            .send()
            .await
            .map_err(|e| EngineError::BackendUnreachable(e.to_string()))?;
        let body = read_body(resp).await?;
        let content = chat_content(&body)?;
        info!(
            "hosted model {} answered in {}ms ({} chars)",
            self.model,
            start.elapsed().as_millis(),
            content.len()
        );
        Ok(content)
    }
}

// ---------------- Local model server ----------------

pub struct LocalServerBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: &'static str,
    options: GenerateOptions,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl LocalServerBackend {
    fn request(&self, system_prompt: &str, context: &str) -> GenerateRequest {
        GenerateRequest {
            model: self.model.clone(),
            prompt: format!("{system_prompt}\n\n{context}"),
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        }
    }
}

fn generate_content(body: &str) -> Result<String, EngineError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| EngineError::MalformedResponse(format!("generate envelope: {e}")))?;
    Ok(parsed.response)
}

#[async_trait]
impl ModelBackend for LocalServerBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, context: &str) -> Result<String, EngineError> {
        let start = Instant::now();
        let resp = self
            .http
            .post(endpoint(&self.base_url, "api/generate"))
            .json(&self.request(system_prompt, context))
            .send()
            .await
            .map_err(|e| EngineError::BackendUnreachable(e.to_string()))?;
        let body = read_body(resp).await?;
        let content = generate_content(&body)?;
        info!(
            "local model {} answered in {}ms ({} chars)",
            self.model,
            start.elapsed().as_millis(),
            content.len()
        );
        Ok(content)
    }
}
