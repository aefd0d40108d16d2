use futures::future::BoxFuture;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use redraft_core::config::ModelConfig;
use redraft_core::error::{RedraftError, Result};
use redraft_core::traits::GenerationService;

use super::presets::{build_extra_headers, get_preset};
use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
    url: String,
    headers: Vec<(String, String)>,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        let preset = get_preset(&config.provider);
        if preset.as_ref().is_some_and(|p| p.needs_api_key) && config.api_key.is_none() {
            warn!(provider = %config.provider, "Provider expects an API key but none is configured");
        }
        let url = config
            .base_url
            .clone()
            .or_else(|| preset.as_ref().map(|p| p.default_base_url.to_string()))
            .unwrap_or_else(|| OPENAI_API_URL.to_string());
        let headers = match preset {
            Some(ref p) => build_extra_headers(p, &config.extra_headers),
            None => config
                .extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Self {
            http: Client::new(),
            config,
            url,
            headers,
        }
    }

    fn messages(system: &str, user: &str) -> Vec<OaiMessage> {
        vec![
            OaiMessage {
                role: "system".to_string(),
                content: system.to_string(),
            },
            OaiMessage {
                role: "user".to_string(),
                content: user.to_string(),
            },
        ]
    }

    fn request(
        &self,
        stream: bool,
        response_format: Option<ResponseFormat>,
        system: &str,
        user: &str,
    ) -> ChatRequest {
        // o-series models reject temperature
        let is_o_series = self.config.model_id.starts_with("o1")
            || self.config.model_id.starts_with("o3")
            || self.config.model_id.starts_with("o4");

        ChatRequest {
            model: self.config.model_id.clone(),
            messages: Self::messages(system, user),
            max_tokens: self.config.max_tokens,
            temperature: if is_o_series { None } else { Some(self.config.temperature) },
            stream,
            response_format,
        }
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let mut req = self.http.post(&self.url).json(body);

        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| RedraftError::LlmRequest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(RedraftError::LlmRequest(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: String,
    json_schema: JsonSchemaSpec,
}

#[derive(Serialize)]
struct JsonSchemaSpec {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Text carried by one streamed chunk, if any.
pub(crate) fn parse_chunk(event: &SseEvent) -> Option<String> {
    if event.is_done() {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => {
            let choice = chunk.choices.into_iter().next()?;
            if choice.finish_reason.as_deref() == Some("length") {
                warn!("Generation stopped at max_tokens; output is truncated");
            }
            choice
                .delta
                .and_then(|d| d.content)
                .filter(|text| !text.is_empty())
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            None
        }
    }
}

/// Extract and parse the JSON body of a structured completion.
pub(crate) fn parse_structured(body: &str) -> Result<serde_json::Value> {
    let response: CompletionResponse =
        serde_json::from_str(body).map_err(|e| RedraftError::LlmParse(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RedraftError::LlmParse("response has no choices".into()))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(RedraftError::SchemaViolation(format!("model refused: {}", refusal)));
    }
    if choice.finish_reason.as_deref() == Some("length") {
        return Err(RedraftError::LlmParse(
            "structured output truncated at max_tokens".into(),
        ));
    }
    let content = choice
        .message
        .content
        .ok_or_else(|| RedraftError::LlmParse("response message has no content".into()))?;

    serde_json::from_str(&content)
        .map_err(|e| RedraftError::SchemaViolation(format!("content is not valid JSON: {}", e)))
}

impl GenerationService for OpenAiClient {
    fn invoke<'a>(&'a self, system: &'a str, user: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let body = self.request(true, None, system, user);
            let response = self.send(&body).await?;

            let mut events = SseStream::new(response.bytes_stream());
            let mut text = String::new();
            while let Some(event) = events.next().await {
                let event = event?;
                if event.is_done() {
                    break;
                }
                if let Some(delta) = parse_chunk(&event) {
                    text.push_str(&delta);
                }
            }

            debug!(model = %self.config.model_id, chars = text.len(), "Generation complete");
            Ok(text)
        })
    }

    fn invoke_structured<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
        schema: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let format = ResponseFormat {
                r#type: "json_schema".to_string(),
                json_schema: JsonSchemaSpec {
                    name: "structured_output".to_string(),
                    schema: schema.clone(),
                    strict: true,
                },
            };
            let body = self.request(false, Some(format), system, user);
            let response = self.send(&body).await?;
            let text = response
                .text()
                .await
                .map_err(|e| RedraftError::LlmRequest(e.to_string()))?;
            parse_structured(&text)
        })
    }
}
