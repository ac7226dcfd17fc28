use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InvokeError;

#[derive(Clone, Copy, Debug)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    pub user: &'a str,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

/// One stateless chat completion.
pub trait ChatBackend: Send + Sync {
    fn chat(&self, req: &ChatRequest<'_>) -> Result<String, InvokeError>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiChatClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            api_key,
            timeout,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

const POLICY_MARKERS: [&str; 3] = ["content_filter", "content_policy", "safety"];

/// Maps an HTTP status and body to reply text or a typed failure.
fn interpret_reply(status: StatusCode, body: &str) -> Result<String, InvokeError> {
    if !status.is_success() {
        let lowered = body.to_ascii_lowercase();
        if status == StatusCode::BAD_REQUEST && POLICY_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Err(InvokeError::ContentPolicy(truncate(body)));
        }
        let retryable = status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS;
        if !retryable {
            return Err(InvokeError::Rejected(format!(
                "status {}: {}",
                status.as_u16(),
                truncate(body)
            )));
        }
        return Err(InvokeError::Service(format!(
            "status {}: {}",
            status.as_u16(),
            truncate(body)
        )));
    }

    let parsed: WireResponse = serde_json::from_str(body)
        .map_err(|e| InvokeError::Service(format!("undecodable response: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InvokeError::Service("response has no choices".to_string()))?;
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(InvokeError::ContentPolicy("finish_reason=content_filter".to_string()));
    }
    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(InvokeError::ContentPolicy(refusal));
    }
    let content = choice.message.content.unwrap_or_default();
    if content.trim().is_empty() {
        return Err(InvokeError::Service("empty reply".to_string()));
    }
    Ok(content)
}

fn truncate(body: &str) -> String {
    crate::textutil::truncate_chars(body.trim(), 400).to_string()
}

impl ChatBackend for OpenAiChatClient {
    fn chat(&self, req: &ChatRequest<'_>) -> Result<String, InvokeError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = req.system.filter(|s| !s.trim().is_empty()) {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: req.user,
        });
        let wire = WireRequest {
            model: req.model,
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(WireResponseFormat {
                kind: "json_object",
            }),
        };

        let mut request = self.client.post(&self.endpoint).json(&wire);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                InvokeError::Timeout(self.timeout)
            } else {
                InvokeError::Service(e.to_string())
            }
        })?;
        let status = response.status();
        let body = response.text().map_err(|e| {
            if e.is_timeout() {
                InvokeError::Timeout(self.timeout)
            } else {
                InvokeError::Service(format!("read body: {e}"))
            }
        })?;
        debug!(model = req.model, status = status.as_u16(), bytes = body.len(), "chat reply");
        interpret_reply(status, &body)
    }
}
