//! Lifecycle callbacks for agent runs.
//!
//! A [`CallbackManager`] is created per invocation. It owns the run id,
//! allocates nested run ids for tool calls and fans every event out to the
//! registered [`AgentCallback`]s in order.

mod events;
mod langfuse;
mod logging;
mod manager;

use std::sync::Arc;

pub use events::{
    ErrorEvent, ErrorStage, GenerationEndEvent, GenerationStartEvent, RunContext, RunEndEvent,
    RunStartEvent, ToolCallEndEvent, ToolCallStartEvent,
};
pub use langfuse::{LangfuseCallback, LangfuseCallbackConfig};
pub use logging::LoggingCallback;
pub use manager::CallbackManager;

/// Observer of agent lifecycle events.
///
/// Every method defaults to a no-op, so implementors override only what they
/// need. Callbacks run inline on the invoking task and must not block for
/// long.
pub trait AgentCallback: Send + Sync {
    /// Identity used when merging invocation and agent callbacks.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_run_start(&self, _event: &RunStartEvent<'_>) {}

    fn on_run_end(&self, _event: &RunEndEvent<'_>) {}

    fn on_generation_start(&self, _event: &GenerationStartEvent<'_>) {}

    fn on_generation_end(&self, _event: &GenerationEndEvent<'_>) {}

    fn on_tool_call_start(&self, _event: &ToolCallStartEvent<'_>) {}

    fn on_tool_call_end(&self, _event: &ToolCallEndEvent<'_>) {}

    fn on_error(&self, _event: &ErrorEvent) {}
}

pub type SharedCallback = Arc<dyn AgentCallback>;

/// Invocation callbacks first, then agent callbacks whose name was not
/// already taken by an invocation callback.
pub fn merge_callbacks(
    invocation: &[SharedCallback],
    agent: &[SharedCallback],
) -> Vec<SharedCallback> {
    let mut merged = invocation.to_vec();
    for callback in agent {
        let taken = invocation
            .iter()
            .any(|existing| existing.name() == callback.name());
        if !taken {
            merged.push(callback.clone());
        }
    }
    merged
}
