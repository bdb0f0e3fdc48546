//! HTTP chat client for an OpenAI-compatible completions endpoint.
//!
//! One POST per call; streaming is not required by the kernel. Transient
//! failures retry with exponential backoff plus jitter; rate limits use a
//! longer backoff floor; auth and quota failures abort immediately.

use super::{
    ChatClient, ChatResponse, FunctionDeclaration, Message, Role, TokenUsage, ToolCallRequest,
    ToolChoice,
};
use crate::config::KernelConfig;
use crate::errors::LlmError;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retry schedule for transient endpoint failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub rate_limit_floor: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            rate_limit_floor: Duration::from_secs(20),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based), with jitter applied.
    pub fn delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt - 1);
        let floor = if rate_limited {
            self.rate_limit_floor.as_millis() as u64
        } else {
            0
        };
        let capped = exp.max(floor).min(self.max_delay.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
        Duration::from_millis(capped + jitter)
    }
}

/// Chat client speaking the OpenAI completions wire format.
pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f64,
    retry: RetryPolicy,
}

impl HttpChatClient {
    pub fn new(config: &KernelConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.llm_base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn chat_once(
        &self,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        tool_choice: ToolChoice,
    ) -> Result<ChatResponse, LlmError> {
        let body = WireRequest::build(&self.model, self.temperature, messages, tools, tool_choice);

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(e.to_string())
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text));
        }

        let wire: WireResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::MalformedResponse(format!("{e}: {}", crate::util::truncate_with_marker(&text, 500))))?;
        wire.into_chat_response()
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        tool_choice: ToolChoice,
    ) -> Result<ChatResponse, LlmError> {
        let mut last_error: Option<LlmError> = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.chat_once(messages, tools, tool_choice).await {
                Ok(response) => return Ok(response),
                // A tool-call parse error goes straight back to the agent
                // loop, which re-asks with tool_choice=none instead of
                // replaying the identical request.
                Err(e @ LlmError::MalformedResponse(_)) => return Err(e),
                Err(e) if e.retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt, e.is_rate_limit());
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "LLM call failed, retrying");
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) if !e.retryable() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }
        let last = last_error.expect("at least one attempt ran");
        Err(LlmError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error: last.to_string(),
        })
    }
}

// --- Wire format ------------------------------------------------------------

#[derive(Serialize)]
struct WireRequest {
    model: String,
    temperature: f64,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

impl WireRequest {
    fn build(
        model: &str,
        temperature: f64,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        tool_choice: ToolChoice,
    ) -> Self {
        Self {
            model: model.to_string(),
            temperature,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.iter().map(WireTool::from).collect(),
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some(tool_choice.as_str())
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: m.content.clone(),
            tool_calls: m.tool_calls.iter().map(WireToolCall::from).collect(),
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

impl From<&ToolCallRequest> for WireToolCall {
    fn from(c: &ToolCallRequest) -> Self {
        Self {
            id: c.id.clone(),
            kind: "function".to_string(),
            function: WireFunctionCall {
                name: c.name.clone(),
                arguments: c.arguments.to_string(),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded argument object, per the wire format.
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDeclaration,
}

impl From<&FunctionDeclaration> for WireTool {
    fn from(f: &FunctionDeclaration) -> Self {
        Self {
            kind: "function",
            function: f.clone(),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireResponse {
    fn into_chat_response(mut self) -> Result<ChatResponse, LlmError> {
        if self.choices.is_empty() {
            return Err(LlmError::MalformedResponse("no choices in response".into()));
        }
        let choice = self.choices.remove(0);

        let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
        for call in choice.message.tool_calls {
            let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
                .map_err(|e| {
                    LlmError::MalformedResponse(format!(
                        "tool call arguments for {} are not valid JSON: {e}",
                        call.function.name
                    ))
                })?;
            tool_calls.push(ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }

        let usage = self.usage.unwrap_or_default();
        Ok(ChatResponse {
            message: Message {
                role: Role::Assistant,
                content: choice.message.content,
                tool_calls,
                tool_call_id: None,
            },
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
            finish_reason: choice.finish_reason,
        })
    }
}
