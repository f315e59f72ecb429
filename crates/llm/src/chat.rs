//! Chat model client
//!
//! Implements the Messages API: system prompt + messages array in, content
//! blocks and token usage out, with an SSE streaming variant. Calls are
//! gated by the chat circuit breaker and carry a hard 30s deadline; this
//! layer never retries (the caller decides).

use std::sync::Arc;
use std::time::Duration;

use dealership_config::ChatConfig;
use dealership_core::{BreakerError, CircuitBreaker};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::prompt::{Message, Role};
use crate::LlmError;

/// Hard deadline on generation calls
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const API_VERSION: &str = "2023-06-01";

/// A completed generation
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Messages-API chat client
pub struct ChatClient {
    client: Client,
    config: ChatConfig,
    breaker: Arc<CircuitBreaker>,
}

impl ChatClient {
    pub fn new(config: ChatConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            tracing::warn!("chat api key is empty, generation calls will fail");
        }
        let client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self {
            client,
            config,
            breaker,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Generate a completion.
    pub async fn generate(
        &self,
        system: Option<&str>,
        messages: &[Message],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<ChatResponse, LlmError> {
        let request = ApiRequest {
            model: &self.config.model,
            max_tokens,
            messages: convert_messages(messages),
            system,
            temperature: Some(temperature),
            stream: None,
        };

        let result = self
            .breaker
            .call(async {
                let send = self
                    .client
                    .post(format!("{}/v1/messages", self.config.endpoint))
                    .header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", API_VERSION)
                    .header("content-type", "application/json")
                    .json(&request)
                    .send();

                let response = tokio::time::timeout(CALL_TIMEOUT, send)
                    .await
                    .map_err(|_| LlmError::Timeout("chat call exceeded 30s".to_string()))?
                    .map_err(|e| LlmError::Network(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(LlmError::Api(format!("HTTP {status}: {body}")));
                }

                let parsed: ApiResponse = response
                    .json()
                    .await
                    .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

                let text = parsed
                    .content
                    .iter()
                    .map(|block| block.text.as_str())
                    .collect::<String>();

                Ok(ChatResponse {
                    text,
                    input_tokens: parsed.usage.input_tokens,
                    output_tokens: parsed.usage.output_tokens,
                })
            })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(BreakerError::Open { name, retry_in }) => Err(LlmError::Unavailable(format!(
                "{name} circuit open, retry in {retry_in:.1}s"
            ))),
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    /// Generate with streaming; text deltas are sent on `tx` as they
    /// arrive and the assembled response is returned at the end.
    pub async fn generate_stream(
        &self,
        system: Option<&str>,
        messages: &[Message],
        max_tokens: usize,
        temperature: f32,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError> {
        let request = ApiRequest {
            model: &self.config.model,
            max_tokens,
            messages: convert_messages(messages),
            system,
            temperature: Some(temperature),
            stream: Some(true),
        };

        let result = self
            .breaker
            .call(async {
                let response = self
                    .client
                    .post(format!("{}/v1/messages", self.config.endpoint))
                    .header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", API_VERSION)
                    .header("content-type", "application/json")
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| LlmError::Network(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(LlmError::Api(format!("HTTP {status}: {body}")));
                }

                // Process the SSE stream line by line
                use futures::StreamExt;
                let mut stream = response.bytes_stream();
                let mut buffer = String::new();
                let mut full_text = String::new();
                let mut input_tokens = 0;
                let mut output_tokens = 0;

                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| LlmError::Network(e.to_string()))?;
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer = buffer[line_end + 1..].to_string();

                        let Some(json_str) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if json_str == "[DONE]" {
                            continue;
                        }

                        if let Ok(event) = serde_json::from_str::<StreamEvent>(json_str) {
                            match event {
                                StreamEvent::MessageStart { message } => {
                                    if let Some(usage) = message.usage {
                                        input_tokens = usage.input_tokens;
                                    }
                                }
                                StreamEvent::ContentBlockDelta { delta } => {
                                    if let StreamDelta::TextDelta { text } = delta {
                                        full_text.push_str(&text);
                                        let _ = tx.send(text).await;
                                    }
                                }
                                StreamEvent::MessageDelta { usage } => {
                                    if let Some(usage) = usage {
                                        output_tokens = usage.output_tokens;
                                    }
                                }
                                StreamEvent::Other => {}
                            }
                        }
                    }
                }

                Ok(ChatResponse {
                    text: full_text,
                    input_tokens,
                    output_tokens,
                })
            })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(BreakerError::Open { name, retry_in }) => Err(LlmError::Unavailable(format!(
                "{name} circuit open, retry in {retry_in:.1}s"
            ))),
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    /// Cheap liveness signal for the health surface
    pub fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }
}

fn convert_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| ApiMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
        })
        .collect()
}

// Wire types

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockDelta {
        delta: StreamDelta,
    },
    MessageDelta {
        usage: Option<StreamUsageDelta>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    usage: Option<StreamUsageStart>,
}

#[derive(Debug, Deserialize)]
struct StreamUsageStart {
    input_tokens: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
}

#[derive(Debug, Deserialize)]
struct StreamUsageDelta {
    output_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = ApiRequest {
            model: "claude-sonnet-4-20250514",
            max_tokens: 1000,
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: "Hello".to_string(),
            }],
            system: Some("You are helpful"),
            temperature: Some(0.2),
            stream: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("claude-sonnet-4-20250514"));
        assert!(json.contains("You are helpful"));
        assert!(!json.contains("stream"));
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "content": [{"type": "text", "text": "The Camry is $28,000."}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 120, "output_tokens": 18}
        }"#;

        let parsed: ApiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content[0].text, "The Camry is $28,000.");
        assert_eq!(parsed.usage.input_tokens, 120);
        assert_eq!(parsed.usage.output_tokens, 18);
    }

    #[test]
    fn test_stream_event_parsing() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let event: StreamEvent = serde_json::from_str(delta).unwrap();
        assert!(matches!(
            event,
            StreamEvent::ContentBlockDelta {
                delta: StreamDelta::TextDelta { .. }
            }
        ));

        let ping = r#"{"type":"ping"}"#;
        let event: StreamEvent = serde_json::from_str(ping).unwrap();
        assert!(matches!(event, StreamEvent::Other));
    }

    #[test]
    fn test_system_messages_filtered_from_array() {
        let messages = vec![
            Message {
                role: Role::System,
                content: "system".to_string(),
            },
            Message::user("hi"),
        ];
        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
    }
}
