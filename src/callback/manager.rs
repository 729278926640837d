use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use super::{
    ErrorEvent, ErrorStage, GenerationEndEvent, GenerationStartEvent, RunContext, RunEndEvent,
    RunStartEvent, SharedCallback, ToolCallEndEvent, ToolCallStartEvent,
};
use crate::llm::{ModelMessage, ModelToolCall, ModelUsage};

/// Per-invocation event dispatcher.
///
/// Holds the run id, the optional parent run id and the map of open tool
/// calls to their nested run ids. Tool-call ids must be unique within one
/// run; an id that was never started (or already ended) is reported with the
/// run-level context instead of a nested one.
pub struct CallbackManager {
    callbacks: Vec<SharedCallback>,
    run_id: String,
    parent_run_id: Option<String>,
    nested_runs: HashMap<String, String>,
}

impl CallbackManager {
    pub fn new(callbacks: Vec<SharedCallback>, parent_run_id: Option<String>) -> Self {
        Self {
            callbacks,
            run_id: Uuid::new_v4().to_string(),
            parent_run_id,
            nested_runs: HashMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn parent_run_id(&self) -> Option<&str> {
        self.parent_run_id.as_deref()
    }

    /// Nested run id of an open tool call.
    pub fn nested_run_id(&self, tool_call_id: &str) -> Option<&str> {
        self.nested_runs.get(tool_call_id).map(String::as_str)
    }

    pub fn callbacks(&self) -> &[SharedCallback] {
        &self.callbacks
    }

    fn run_context(&self) -> RunContext {
        RunContext {
            run_id: self.run_id.clone(),
            parent_run_id: self.parent_run_id.clone(),
        }
    }

    fn nested_context(&self, nested_run_id: String) -> RunContext {
        RunContext {
            run_id: nested_run_id,
            parent_run_id: Some(self.run_id.clone()),
        }
    }

    pub fn on_run_start(&self, model: &str, input: &str, has_output_class: bool) {
        let event = RunStartEvent {
            run: self.run_context(),
            model,
            input,
            has_output_class,
        };
        for callback in &self.callbacks {
            callback.on_run_start(&event);
        }
    }

    pub fn on_run_end(&self, output: &Value, total_iterations: u32) {
        let event = RunEndEvent {
            run: self.run_context(),
            output,
            total_iterations,
        };
        for callback in &self.callbacks {
            callback.on_run_end(&event);
        }
    }

    pub fn on_generation_start(&self, iteration: u32, messages: &[ModelMessage], model: &str) {
        let event = GenerationStartEvent {
            run: self.run_context(),
            iteration,
            messages,
            model,
        };
        for callback in &self.callbacks {
            callback.on_generation_start(&event);
        }
    }

    pub fn on_generation_end(
        &self,
        finish_reason: &str,
        content: &str,
        tool_calls: &[ModelToolCall],
        usage: Option<&ModelUsage>,
    ) {
        let event = GenerationEndEvent {
            run: self.run_context(),
            finish_reason,
            content,
            tool_calls,
            usage,
        };
        for callback in &self.callbacks {
            callback.on_generation_end(&event);
        }
    }

    /// Opens a nested run for `tool_call_id` and returns its id.
    pub fn on_tool_call_start(
        &mut self,
        tool_name: &str,
        arguments: &Value,
        tool_call_id: &str,
    ) -> String {
        let nested_run_id = Uuid::new_v4().to_string();
        self.nested_runs
            .insert(tool_call_id.to_string(), nested_run_id.clone());

        let event = ToolCallStartEvent {
            run: self.nested_context(nested_run_id.clone()),
            tool_name,
            arguments,
            tool_call_id,
        };
        for callback in &self.callbacks {
            callback.on_tool_call_start(&event);
        }

        nested_run_id
    }

    /// Closes the nested run of `tool_call_id`.
    pub fn on_tool_call_end(
        &mut self,
        tool_name: &str,
        arguments: &Value,
        result: Option<&Value>,
        tool_call_id: &str,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) {
        let run = match self.nested_runs.remove(tool_call_id) {
            Some(nested_run_id) => self.nested_context(nested_run_id),
            None => {
                tracing::warn!(
                    run_id = %self.run_id,
                    tool_call_id,
                    "tool call ended without an open nested run"
                );
                self.run_context()
            }
        };

        let event = ToolCallEndEvent {
            run,
            tool_name,
            arguments,
            result,
            tool_call_id,
            error: error.map(ToString::to_string),
        };
        for callback in &self.callbacks {
            callback.on_tool_call_end(&event);
        }
    }

    pub fn on_error(&self, error: &(dyn std::error::Error + 'static), stage: ErrorStage) {
        let event = ErrorEvent {
            run: self.run_context(),
            error: error.to_string(),
            stage,
        };
        for callback in &self.callbacks {
            callback.on_error(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::callback::AgentCallback;
    use crate::error::ToolError;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, RunContext)>>,
    }

    impl Recorder {
        fn push(&self, kind: &str, run: &RunContext) {
            self.events
                .lock()
                .expect("lock poisoned")
                .push((kind.to_string(), run.clone()));
        }

        fn events(&self) -> Vec<(String, RunContext)> {
            self.events.lock().expect("lock poisoned").clone()
        }
    }

    impl AgentCallback for Recorder {
        fn on_run_start(&self, event: &RunStartEvent<'_>) {
            self.push("run_start", &event.run);
        }

        fn on_tool_call_start(&self, event: &ToolCallStartEvent<'_>) {
            self.push("tool_start", &event.run);
        }

        fn on_tool_call_end(&self, event: &ToolCallEndEvent<'_>) {
            let kind = match &event.error {
                Some(error) => format!("tool_end:{error}"),
                None => "tool_end".to_string(),
            };
            self.push(&kind, &event.run);
        }

        fn on_error(&self, event: &ErrorEvent) {
            self.push(&format!("error:{}", event.stage), &event.run);
        }
    }

    #[test]
    fn run_ids_are_fresh_per_manager() {
        let first = CallbackManager::new(Vec::new(), None);
        let second = CallbackManager::new(Vec::new(), None);
        assert_ne!(first.run_id(), second.run_id());
        assert!(Uuid::parse_str(first.run_id()).is_ok());
    }

    #[test]
    fn parent_run_id_is_attached_only_when_supplied() {
        let recorder = Arc::new(Recorder::default());
        let top = CallbackManager::new(vec![recorder.clone()], None);
        top.on_run_start("gpt-4o", "hi", false);

        let nested = CallbackManager::new(vec![recorder.clone()], Some(top.run_id().to_string()));
        nested.on_run_start("gpt-4o", "hi", false);

        let events = recorder.events();
        assert_eq!(events[0].1.parent_run_id, None);
        assert_eq!(events[1].1.parent_run_id.as_deref(), Some(top.run_id()));
        assert_eq!(events[1].1.run_id, nested.run_id());
    }

    #[test]
    fn tool_calls_run_as_nested_runs_until_they_end() {
        let recorder = Arc::new(Recorder::default());
        let mut manager = CallbackManager::new(vec![recorder.clone()], Some("outer".to_string()));
        let args = json!({"city": "Paris"});

        let nested = manager.on_tool_call_start("weather", &args, "call_1");
        assert_eq!(manager.nested_run_id("call_1"), Some(nested.as_str()));

        let result = json!("sunny");
        manager.on_tool_call_end("weather", &args, Some(&result), "call_1", None);
        assert_eq!(manager.nested_run_id("call_1"), None);

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        for (_, run) in &events {
            assert_eq!(run.run_id, nested);
            assert_eq!(run.parent_run_id.as_deref(), Some(manager.run_id()));
        }
    }

    #[test]
    fn unknown_tool_call_falls_back_to_run_context() {
        let recorder = Arc::new(Recorder::default());
        let mut manager = CallbackManager::new(vec![recorder.clone()], None);
        let err = ToolError::NotFound("ghost".to_string());

        manager.on_tool_call_end("ghost", &Value::Null, None, "call_9", Some(&err));

        let events = recorder.events();
        assert_eq!(events[0].0, "tool_end:tool not found: ghost");
        assert_eq!(events[0].1.run_id, manager.run_id());
        assert_eq!(events[0].1.parent_run_id, None);
    }

    #[test]
    fn errors_carry_stage_and_reach_every_callback() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let manager = CallbackManager::new(vec![first.clone(), second.clone()], None);

        let err = ToolError::execution("weather", "boom");
        manager.on_error(&err, ErrorStage::Tool);

        assert_eq!(first.events()[0].0, "error:tool");
        assert_eq!(second.events()[0].0, "error:tool");
    }
}
