//! Exposes registered tools over the Model Context Protocol.
//!
//! The server speaks newline-delimited JSON-RPC 2.0 on any async
//! reader/writer pair, usually stdin/stdout. Each `tools/call` deserializes a
//! fresh argument value and runs the tool exactly as the agent loop would.
//!
//! Only the stdio-style transport is provided. There is no HTTP/SSE endpoint
//! and no multi-route hub; callers that need one can put [`McpServer::serve`]
//! or [`McpServer::handle_message`] behind their own HTTP stack.

mod types;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::McpError;
use crate::tools::{ContextValues, ToolContext, ToolOutput, ToolRegistry};

pub use types::{
    CallToolParams, CallToolResult, Implementation, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, McpTool, PROTOCOL_VERSION, RequestId,
    ServerCapabilities, ToolResultContent, ToolsCapability,
};

pub struct McpServer {
    info: Implementation,
    registry: ToolRegistry,
    values: ContextValues,
}

impl McpServer {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        registry: ToolRegistry,
    ) -> Self {
        let info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        for tool in registry.iter() {
            info!(
                server = %info.name,
                tool = tool.id(),
                description = %tool.schema().description,
                "registered mcp tool"
            );
        }

        Self {
            info,
            registry,
            values: ContextValues::new(),
        }
    }

    /// Values handed to every tool call.
    pub fn with_values(mut self, values: ContextValues) -> Self {
        self.values = values;
        self
    }

    pub fn info(&self) -> &Implementation {
        &self.info
    }

    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Tool listing in registration order, keyed by tool id.
    pub fn tools(&self) -> Vec<McpTool> {
        self.registry
            .iter()
            .map(|tool| {
                let schema = tool.schema();
                McpTool {
                    name: schema.id.clone(),
                    description: Some(schema.description.clone()).filter(|d| !d.is_empty()),
                    input_schema: schema.json_schema.clone(),
                }
            })
            .collect()
    }

    pub async fn run_stdio(&self) -> Result<(), McpError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Answers requests read from `reader` until it reaches EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(server = %self.info.name, tools = self.tool_count(), "mcp server listening");

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            if let Some(response) = self.handle_message(message).await {
                let mut payload = serde_json::to_vec(&response)?;
                payload.push(b'\n');
                writer.write_all(&payload).await?;
                writer.flush().await?;
            }
        }

        debug!(server = %self.info.name, "mcp input closed");
        Ok(())
    }

    /// Handles one JSON-RPC message. Notifications produce no response.
    pub async fn handle_message(&self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(err) => {
                return Some(JsonRpcResponse::error(
                    None,
                    JsonRpcError::PARSE_ERROR,
                    format!("Parse error: {err}"),
                ));
            }
        };

        let Some(id) = request.id else {
            debug!(method = %request.method, "ignoring notification");
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                Some(id),
                InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability {
                            list_changed: false,
                        }),
                    },
                    server_info: self.info.clone(),
                },
            ),
            "ping" => JsonRpcResponse::success(Some(id), serde_json::json!({})),
            "tools/list" => JsonRpcResponse::success(
                Some(id),
                ListToolsResult {
                    tools: self.tools(),
                },
            ),
            "tools/call" => self.call_tool(id, request.params).await,
            other => JsonRpcResponse::error(
                Some(id),
                JsonRpcError::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };
        Some(response)
    }

    async fn call_tool(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params: CallToolParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(err)) => {
                return JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::INVALID_PARAMS,
                    format!("Invalid params: {err}"),
                );
            }
            None => {
                return JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::INVALID_PARAMS,
                    "Missing params",
                );
            }
        };

        let Some(tool) = self.registry.get(&params.name) else {
            return JsonRpcResponse::error(
                Some(id),
                JsonRpcError::INVALID_PARAMS,
                format!("Tool not found: {}", params.name),
            );
        };

        let arguments = match &params.arguments {
            Value::Null => "{}".to_string(),
            other => other.to_string(),
        };
        let ctx = ToolContext::new(Uuid::new_v4().to_string(), id.to_string())
            .with_values(self.values.clone());

        debug!(tool = %params.name, request_id = %id, "mcp tool call");
        let result = match tool.call(&arguments, ctx).await {
            Ok(output) => render_output(output),
            Err(err) => {
                warn!(tool = %params.name, error = %err, "mcp tool call failed");
                CallToolResult::error(format!("tool execution failed: {err}"))
            }
        };

        JsonRpcResponse::success(Some(id), result)
    }
}

/// Text passes through; structured values are returned as YAML text plus
/// `structuredContent`.
fn render_output(output: ToolOutput) -> CallToolResult {
    match output {
        ToolOutput::Json(value) => match serde_yaml::to_string(&value) {
            Ok(yaml) => CallToolResult::text(yaml).with_structured_content(value),
            Err(err) => CallToolResult::error(format!("failed to marshal result: {err}")),
        },
        other => CallToolResult::text(other.to_text()),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::error::ToolError;
    use crate::tools::{Tool, ToolInfo};

    #[derive(Debug, Deserialize, JsonSchema)]
    struct GetWeather {
        city: String,
    }

    #[async_trait]
    impl Tool for GetWeather {
        fn info() -> ToolInfo {
            ToolInfo::new("Get Weather", "current weather for a city")
        }

        async fn execute(&self, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            if self.city.is_empty() {
                return Err(ToolError::execution("Get Weather", "city is required"));
            }
            ToolOutput::json(&json!({"city": self.city, "celsius": 21}))
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Echo {
        text: String,
    }

    #[async_trait]
    impl Tool for Echo {
        async fn execute(&self, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(self.text.clone().into())
        }
    }

    fn server() -> McpServer {
        let mut registry = ToolRegistry::new();
        registry.register_tool::<GetWeather>().expect("registers");
        registry.register_tool::<Echo>().expect("registers");
        McpServer::new("weather", "1.0.0", registry)
    }

    async fn request(server: &McpServer, message: Value) -> JsonRpcResponse {
        server
            .handle_message(&message.to_string())
            .await
            .expect("response expected")
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let response = request(
            &server(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;

        let result = response.result.expect("result");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"], json!({"name": "weather", "version": "1.0.0"}));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    }

    #[tokio::test]
    async fn tools_are_listed_by_id() {
        let response = request(
            &server(),
            json!({"jsonrpc": "2.0", "id": "a", "method": "tools/list"}),
        )
        .await;

        assert_eq!(response.id, Some(RequestId::String("a".to_string())));
        let result: ListToolsResult =
            serde_json::from_value(response.result.expect("result")).expect("decodes");
        let names = result
            .tools
            .iter()
            .map(|tool| tool.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["get_weather", "echo"]);
        assert_eq!(
            result.tools[0].description.as_deref(),
            Some("current weather for a city")
        );
        assert_eq!(result.tools[0].input_schema["required"], json!(["city"]));
        assert_eq!(result.tools[1].description, None);
    }

    #[tokio::test]
    async fn structured_results_are_rendered_as_yaml() {
        let response = request(
            &server(),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {"name": "get_weather", "arguments": {"city": "Paris"}}
            }),
        )
        .await;

        let result: CallToolResult =
            serde_json::from_value(response.result.expect("result")).expect("decodes");
        assert!(!result.is_error);
        assert_eq!(
            result.content,
            [ToolResultContent::Text {
                text: "celsius: 21\ncity: Paris\n".to_string()
            }]
        );
        assert_eq!(
            result.structured_content,
            Some(json!({"city": "Paris", "celsius": 21}))
        );
    }

    #[tokio::test]
    async fn text_results_pass_through() {
        let response = request(
            &server(),
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "hello"}}
            }),
        )
        .await;

        let result: CallToolResult =
            serde_json::from_value(response.result.expect("result")).expect("decodes");
        assert_eq!(result, CallToolResult::text("hello"));
    }

    #[tokio::test]
    async fn tool_failures_become_error_results() {
        let server = server();

        let response = request(
            &server,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {"name": "get_weather", "arguments": {"city": ""}}
            }),
        )
        .await;
        let result: CallToolResult =
            serde_json::from_value(response.result.expect("result")).expect("decodes");
        assert!(result.is_error);

        let response = request(
            &server,
            json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "get_weather", "arguments": {"town": "Paris"}}
            }),
        )
        .await;
        let result: CallToolResult =
            serde_json::from_value(response.result.expect("result")).expect("decodes");
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn protocol_errors_use_json_rpc_codes() {
        let server = server();

        let response = server.handle_message("{oops").await.expect("response");
        assert_eq!(response.id, None);
        assert_eq!(response.error.map(|e| e.code), Some(JsonRpcError::PARSE_ERROR));

        let response = request(&server, json!({"jsonrpc": "2.0", "id": 1, "method": "nope"})).await;
        assert_eq!(
            response.error.map(|e| e.code),
            Some(JsonRpcError::METHOD_NOT_FOUND)
        );

        let response = request(
            &server,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "ghost"}}),
        )
        .await;
        assert_eq!(
            response.error.map(|e| e.code),
            Some(JsonRpcError::INVALID_PARAMS)
        );

        let response = request(&server, json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call"})).await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let response = server()
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn serves_newline_delimited_requests_until_eof() {
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let task = tokio::spawn(async move { server().serve(server_read, server_write).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let input = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
            String::new(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                   "params": {"name": "echo", "arguments": {"text": "hi"}}})
            .to_string(),
        ]
        .join("\n");
        client_write
            .write_all(format!("{input}\n").as_bytes())
            .await
            .expect("write");
        client_write.shutdown().await.expect("shutdown");

        task.await.expect("task joins").expect("serve succeeds");

        let mut output = String::new();
        client_read
            .read_to_string(&mut output)
            .await
            .expect("read");
        let responses = output
            .lines()
            .map(|line| serde_json::from_str::<JsonRpcResponse>(line).expect("valid response"))
            .collect::<Vec<_>>();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, Some(RequestId::Number(1)));
        assert_eq!(responses[0].result, Some(json!({})));
        assert_eq!(
            responses[1].result.as_ref().map(|result| result["content"][0]["text"].clone()),
            Some(json!("hi"))
        );
    }
}
