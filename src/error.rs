use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema for {type_name} could not be serialized: {source}")]
    Serialize {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("context value missing: {0}")]
    MissingValue(&'static str),
    #[error("tool {tool} failed: {message}")]
    Execution { tool: String, message: String },
    #[error("tool result could not be serialized: {0}")]
    Output(#[source] serde_json::Error),
    #[error("tool execution cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
    #[error("provider configuration error: {0}")]
    Config(String),
    #[error("provider call cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid invocation input: {0}")]
    Input(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("failed to parse output JSON: {0}")]
    OutputParse(#[source] serde_json::Error),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("max iterations ({max_iterations}) reached without completion")]
    MaxIterations { max_iterations: u32 },
    #[error("agent configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry configuration error: {0}")]
    Config(String),
    #[error("telemetry exporter error: {0}")]
    Exporter(String),
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("mcp transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mcp message could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}
