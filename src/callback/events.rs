use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::llm::{ModelMessage, ModelToolCall, ModelUsage};

/// Correlation ids attached to every event.
///
/// `parent_run_id` is only set for nested runs: tool executions (parented to
/// the enclosing run) and agent invocations started with a parent run id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunContext {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunStartEvent<'a> {
    #[serde(flatten)]
    pub run: RunContext,
    pub model: &'a str,
    pub input: &'a str,
    pub has_output_class: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunEndEvent<'a> {
    #[serde(flatten)]
    pub run: RunContext,
    pub output: &'a Value,
    pub total_iterations: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerationStartEvent<'a> {
    #[serde(flatten)]
    pub run: RunContext,
    pub iteration: u32,
    pub messages: &'a [ModelMessage],
    pub model: &'a str,
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerationEndEvent<'a> {
    #[serde(flatten)]
    pub run: RunContext,
    pub finish_reason: &'a str,
    pub content: &'a str,
    pub tool_calls: &'a [ModelToolCall],
    pub usage: Option<&'a ModelUsage>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallStartEvent<'a> {
    #[serde(flatten)]
    pub run: RunContext,
    pub tool_name: &'a str,
    pub arguments: &'a Value,
    pub tool_call_id: &'a str,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallEndEvent<'a> {
    #[serde(flatten)]
    pub run: RunContext,
    pub tool_name: &'a str,
    pub arguments: &'a Value,
    pub result: Option<&'a Value>,
    pub tool_call_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorEvent {
    #[serde(flatten)]
    pub run: RunContext,
    pub error: String,
    pub stage: ErrorStage,
}

/// Loop stage in which an invocation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Run,
    Generation,
    Tool,
}

impl ErrorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Generation => "generation",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
