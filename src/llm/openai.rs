use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::ProviderError;
use crate::llm::{
    ChatModel, CompletionRequest, ModelCompletion, ModelMessage, ModelToolCall,
    ModelToolDefinition, ModelUsage, ResponseFormat, UserContent,
};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const LOGGED_BODY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
/// Connection settings for [`OpenAiModel`].
pub struct OpenAiConfig {
    /// Bearer token sent with every request.
    pub api_key: String,
    /// Base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    /// Model agents fall back to when none is set on the agent.
    pub default_model: Option<String>,
    /// Whole-request timeout.
    pub timeout: Option<Duration>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base_url: None,
            default_model: None,
            timeout: None,
        }
    }

    /// Reads `OPENAI_API_KEY`, and optionally `OPENAI_API_BASE` and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::Config("OPENAI_API_KEY is not set".to_string()))?;

        let mut config = Self::new(api_key);
        config.api_base_url = non_empty_env("OPENAI_API_BASE");
        config.default_model = non_empty_env("OPENAI_MODEL");
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = Some(base_url.into().trim().to_string());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiModel {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| ProviderError::Config(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(OpenAiConfig::from_env()?)
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<ModelCompletion, ProviderError> {
        let payload = build_request(request);
        let endpoint = self.endpoint();

        if tracing::enabled!(tracing::Level::DEBUG) {
            let body = serde_json::to_string(&payload).unwrap_or_default();
            debug!(method = "POST", url = %endpoint, "chat completion request");
            debug!(body = %truncate_body(&body), "chat completion request body");
        }

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                error!(method = "POST", url = %endpoint, error = %err, "chat completion request failed");
                ProviderError::Request(err.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;
        debug!(status = %status, "chat completion response");
        debug!(body = %truncate_body(body.trim()), "chat completion response body");

        if !status.is_success() {
            return Err(ProviderError::Request(describe_api_error(status, &body)));
        }

        let parsed = serde_json::from_str::<ChatCompletionResponse>(&body)
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        normalize_response(parsed)
    }

    fn default_model(&self) -> Option<&str> {
        self.config.default_model.as_deref()
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinitionPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct ToolDefinitionPayload {
    #[serde(rename = "type")]
    type_: &'static str,
    function: FunctionDefinitionPayload,
}

#[derive(Debug, Serialize)]
struct FunctionDefinitionPayload {
    name: String,
    description: String,
    parameters: Value,
    strict: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormatPayload {
    #[serde(rename = "type")]
    type_: &'static str,
    json_schema: JsonSchemaPayload,
}

#[derive(Debug, Serialize)]
struct JsonSchemaPayload {
    name: String,
    schema: Value,
    strict: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    type_: String,
    function: WireToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    finish_reason: Option<String>,
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<Value>,
}

fn build_request(request: &CompletionRequest) -> ChatCompletionRequest {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(request.tools.iter().map(tool_payload).collect::<Vec<_>>())
    };

    ChatCompletionRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(request_message).collect(),
        tools,
        response_format: request.response_format.as_ref().map(response_format_payload),
        temperature: request.temperature,
    }
}

fn tool_payload(tool: &ModelToolDefinition) -> ToolDefinitionPayload {
    ToolDefinitionPayload {
        type_: "function",
        function: FunctionDefinitionPayload {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
            strict: tool.strict,
        },
    }
}

fn response_format_payload(format: &ResponseFormat) -> ResponseFormatPayload {
    ResponseFormatPayload {
        type_: "json_schema",
        json_schema: JsonSchemaPayload {
            name: format.name.clone(),
            schema: format.schema.clone(),
            strict: format.strict,
        },
    }
}

fn request_message(message: &ModelMessage) -> RequestMessage {
    match message {
        ModelMessage::System { content } => RequestMessage::System {
            content: content.clone(),
        },
        ModelMessage::User { content } => RequestMessage::User {
            content: content.clone(),
        },
        ModelMessage::Assistant {
            content,
            tool_calls,
        } => {
            let tool_calls = tool_calls
                .iter()
                .map(|tool_call| WireToolCall {
                    id: tool_call.id.clone(),
                    type_: function_type(),
                    function: WireToolCallFunction {
                        name: tool_call.name.clone(),
                        arguments: tool_call.arguments.clone(),
                    },
                })
                .collect::<Vec<_>>();

            RequestMessage::Assistant {
                content: content.as_ref().filter(|text| !text.is_empty()).cloned(),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            }
        }
        ModelMessage::Tool {
            tool_call_id,
            content,
        } => RequestMessage::Tool {
            tool_call_id: tool_call_id.clone(),
            content: content.clone(),
        },
    }
}

fn normalize_response(response: ChatCompletionResponse) -> Result<ModelCompletion, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Response("no choices in response".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| ProviderError::Response("response choice has no message".to_string()))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|tool_call| ModelToolCall {
            id: tool_call.id,
            name: tool_call.function.name,
            arguments: tool_call.function.arguments,
        })
        .collect();

    let usage = response.usage.map(|usage| {
        let prompt_tokens = usage.prompt_tokens.unwrap_or(0);
        let completion_tokens = usage.completion_tokens.unwrap_or(0);
        ModelUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: usage
                .total_tokens
                .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens)),
        }
    });

    Ok(ModelCompletion {
        finish_reason: choice.finish_reason.unwrap_or_default(),
        content: message.content.unwrap_or_default(),
        tool_calls,
        usage,
    })
}

fn describe_api_error(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(body) {
        let code = parsed
            .error
            .code
            .map(|value| match value {
                Value::String(value) => value,
                other => other.to_string(),
            })
            .unwrap_or_else(|| status.as_u16().to_string());
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());

        return format!("api error {code} {error_type}: {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= LOGGED_BODY_LIMIT {
        return body.to_string();
    }
    let mut end = LOGGED_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
