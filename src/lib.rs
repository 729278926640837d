//! Tool-calling agents for OpenAI-compatible chat-completions APIs.
//!
//! - `Agent<O>` loop: generation, sequential tool dispatch, plain-text or
//!   structured (`JsonSchema`) output
//! - `Tool` trait with schemas derived from the argument type
//! - lifecycle callbacks correlated by run id, with `tracing` and Langfuse
//!   (OpenTelemetry) observers
//! - MCP server exposing the same tools over JSON-RPC

pub mod agent;
pub mod callback;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod schema;
pub mod telemetry;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentOutput, InvokeConfig};
pub use callback::{AgentCallback, CallbackManager, ErrorStage, LoggingCallback, RunContext};
pub use error::{
    AgentError, McpError, ProviderError, SchemaError, TelemetryError, ToolError,
};
pub use llm::{
    ChatModel, CompletionRequest, ContentPart, ModelCompletion, ModelMessage, ModelToolCall,
    ModelToolDefinition, ModelUsage, OpenAiConfig, OpenAiModel, UserContent,
};
pub use mcp::McpServer;
pub use tools::{ContextValues, Tool, ToolContext, ToolInfo, ToolOutput, ToolRegistry, ToolSpec};
