use tracing::{debug, info, warn};

use super::{
    AgentCallback, ErrorEvent, GenerationEndEvent, GenerationStartEvent, RunEndEvent,
    RunStartEvent, ToolCallEndEvent, ToolCallStartEvent,
};

/// Writes every lifecycle event to `tracing`.
///
/// Run boundaries and tool calls log at `info`, generations at `debug`,
/// failures at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallback;

impl LoggingCallback {
    pub fn new() -> Self {
        Self
    }
}

impl AgentCallback for LoggingCallback {
    fn name(&self) -> &str {
        "LoggingCallback"
    }

    fn on_run_start(&self, event: &RunStartEvent<'_>) {
        info!(
            run_id = %event.run.run_id,
            parent_run_id = event.run.parent_run_id.as_deref(),
            model = event.model,
            structured = event.has_output_class,
            "agent run started"
        );
    }

    fn on_run_end(&self, event: &RunEndEvent<'_>) {
        info!(
            run_id = %event.run.run_id,
            iterations = event.total_iterations,
            "agent run finished"
        );
    }

    fn on_generation_start(&self, event: &GenerationStartEvent<'_>) {
        debug!(
            run_id = %event.run.run_id,
            iteration = event.iteration,
            messages = event.messages.len(),
            model = event.model,
            "generation started"
        );
    }

    fn on_generation_end(&self, event: &GenerationEndEvent<'_>) {
        debug!(
            run_id = %event.run.run_id,
            finish_reason = event.finish_reason,
            tool_calls = event.tool_calls.len(),
            total_tokens = event.usage.map(|usage| usage.total_tokens),
            "generation finished"
        );
    }

    fn on_tool_call_start(&self, event: &ToolCallStartEvent<'_>) {
        info!(
            run_id = %event.run.run_id,
            tool = event.tool_name,
            tool_call_id = event.tool_call_id,
            arguments = %event.arguments,
            "tool call started"
        );
    }

    fn on_tool_call_end(&self, event: &ToolCallEndEvent<'_>) {
        match &event.error {
            Some(error) => warn!(
                run_id = %event.run.run_id,
                tool = event.tool_name,
                tool_call_id = event.tool_call_id,
                error = %error,
                "tool call failed"
            ),
            None => info!(
                run_id = %event.run.run_id,
                tool = event.tool_name,
                tool_call_id = event.tool_call_id,
                "tool call finished"
            ),
        }
    }

    fn on_error(&self, event: &ErrorEvent) {
        warn!(
            run_id = %event.run.run_id,
            stage = %event.stage,
            error = %event.error,
            "agent run failed"
        );
    }
}
