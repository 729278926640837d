use std::collections::HashMap;

use opentelemetry::trace::{Span, SpanBuilder, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::{
    AgentCallback, ErrorEvent, GenerationEndEvent, GenerationStartEvent, RunEndEvent,
    RunStartEvent, ToolCallEndEvent, ToolCallStartEvent,
};

const DEFAULT_SERVICE_NAME: &str = "agent-kit";
const DEFAULT_LANGFUSE_HOST: &str = "https://cloud.langfuse.com";

const ATTR_MODEL: &str = "langfuse.observation.model.name";
const ATTR_INPUT: &str = "langfuse.observation.input";
const ATTR_OUTPUT: &str = "langfuse.observation.output";
const ATTR_USAGE: &str = "langfuse.observation.usage_details";

#[derive(Debug, Clone, Default)]
pub struct LangfuseCallbackConfig {
    /// Defaults to `agent-kit`.
    pub service_name: Option<String>,
    /// Reuse an existing trace id instead of the generated one.
    pub trace_id: Option<String>,
    /// Parent for the trace span, for callbacks created under another trace.
    pub parent_context: Option<Context>,
}

struct SpanState<S> {
    /// Parent of every `agent.run` span. Kept after the trace span ends so
    /// later top-level runs still land in the same trace.
    trace_cx: Context,
    trace_open: bool,
    root_cx: Option<Context>,
    root_run_id: Option<String>,
    generation: Option<S>,
    tools: HashMap<String, S>,
}

/// Builds an OpenTelemetry span tree following Langfuse conventions.
///
/// One `trace` span per callback and one `agent.run` span per top-level run
/// (runs with a parent run id add no root of their own), with
/// `llm.generation` / `tool.<name>` children under it. The trace span closes
/// with the first finished run; runs started afterwards keep its trace id.
/// `on_error` closes everything that is still open.
pub struct LangfuseCallback<T>
where
    T: Tracer,
{
    tracer: T,
    service_name: String,
    trace_id: String,
    state: Mutex<SpanState<T::Span>>,
}

impl<T> LangfuseCallback<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn new(tracer: T, config: LangfuseCallbackConfig) -> Self {
        let parent = config.parent_context.unwrap_or_else(Context::new);
        let mut trace_span = tracer.build_with_context(
            SpanBuilder::from_name("trace").with_kind(SpanKind::Internal),
            &parent,
        );

        let trace_id = match config.trace_id.filter(|id| !id.is_empty()) {
            Some(trace_id) => {
                trace_span.set_attribute(KeyValue::new("trace_id", trace_id.clone()));
                trace_id
            }
            None => trace_span.span_context().trace_id().to_string(),
        };

        Self {
            tracer,
            service_name: config
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            trace_id,
            state: Mutex::new(SpanState {
                trace_cx: parent.with_span(trace_span),
                trace_open: true,
                root_cx: None,
                root_run_id: None,
                generation: None,
                tools: HashMap::new(),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Context of the trace span while it is open; use it as the parent of
    /// child callbacks.
    pub fn trace_context(&self) -> Option<Context> {
        let state = self.state.lock();
        state.trace_open.then(|| state.trace_cx.clone())
    }

    /// Langfuse UI link for this trace; `host` defaults to Langfuse cloud.
    pub fn trace_url(&self, host: Option<&str>) -> String {
        if self.trace_id.is_empty() {
            return String::new();
        }
        let host = host
            .filter(|host| !host.is_empty())
            .unwrap_or(DEFAULT_LANGFUSE_HOST)
            .trim_end_matches('/');
        format!("{host}/trace/{}", self.trace_id)
    }

    fn start_child(&self, parent: &Context, name: String, kind: SpanKind) -> T::Span {
        self.tracer.build_with_context(
            SpanBuilder::from_name(name).with_kind(kind),
            parent,
        )
    }
}

impl<T> AgentCallback for LangfuseCallback<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "LangfuseCallback"
    }

    fn on_run_start(&self, event: &RunStartEvent<'_>) {
        if event.run.parent_run_id.is_some() {
            return;
        }

        let mut state = self.state.lock();
        if let Some(stale) = state.root_cx.take() {
            stale.span().end();
        }
        let trace_cx = state.trace_cx.clone();

        let mut root = self.start_child(&trace_cx, "agent.run".to_string(), SpanKind::Internal);
        root.set_attribute(KeyValue::new(ATTR_MODEL, event.model.to_string()));
        root.set_attribute(KeyValue::new(ATTR_INPUT, to_json(&event.input)));
        if event.has_output_class {
            root.set_attribute(KeyValue::new("has_structured_output", true));
        }
        root.set_attribute(KeyValue::new("run_id", event.run.run_id.clone()));

        state.root_cx = Some(trace_cx.with_span(root));
        state.root_run_id = Some(event.run.run_id.clone());
    }

    fn on_run_end(&self, event: &RunEndEvent<'_>) {
        let mut state = self.state.lock();
        if state.root_run_id.as_deref() != Some(event.run.run_id.as_str()) {
            return;
        }

        if let Some(root_cx) = state.root_cx.take() {
            let root = root_cx.span();
            if !event.output.is_null() {
                root.set_attribute(KeyValue::new(ATTR_OUTPUT, to_json(event.output)));
            }
            root.set_attribute(KeyValue::new(
                "total_iterations",
                i64::from(event.total_iterations),
            ));
            root.set_status(Status::Ok);
            root.end();
        }
        state.root_run_id = None;

        if std::mem::take(&mut state.trace_open) {
            let trace = state.trace_cx.span();
            trace.set_status(Status::Ok);
            trace.end();
        }
    }

    fn on_generation_start(&self, event: &GenerationStartEvent<'_>) {
        let mut state = self.state.lock();
        let Some(root_cx) = state.root_cx.clone() else {
            return;
        };

        let mut span = self.start_child(&root_cx, "llm.generation".to_string(), SpanKind::Client);
        span.set_attribute(KeyValue::new(ATTR_MODEL, event.model.to_string()));
        span.set_attribute(KeyValue::new("gen_ai.request.model", event.model.to_string()));
        span.set_attribute(KeyValue::new("iteration", i64::from(event.iteration)));
        span.set_attribute(KeyValue::new(ATTR_INPUT, to_json(&event.messages)));

        if let Some(mut previous) = state.generation.replace(span) {
            previous.end();
        }
    }

    fn on_generation_end(&self, event: &GenerationEndEvent<'_>) {
        let Some(mut span) = self.state.lock().generation.take() else {
            return;
        };

        span.set_attribute(KeyValue::new("finish_reason", event.finish_reason.to_string()));

        let mut output = Map::new();
        if !event.content.is_empty() {
            output.insert("content".to_string(), Value::String(event.content.to_string()));
        }
        if !event.tool_calls.is_empty() {
            let calls = event
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect::<Vec<_>>();
            output.insert("tool_calls".to_string(), Value::Array(calls));
            span.set_attribute(KeyValue::new("has_tool_calls", true));
            span.set_attribute(KeyValue::new(
                "tool_calls_count",
                event.tool_calls.len() as i64,
            ));
        }
        span.set_attribute(KeyValue::new(ATTR_OUTPUT, Value::Object(output).to_string()));

        if let Some(usage) = event.usage {
            span.set_attribute(KeyValue::new(ATTR_USAGE, to_json(usage)));
        }

        span.set_status(Status::Ok);
        span.end();
    }

    fn on_tool_call_start(&self, event: &ToolCallStartEvent<'_>) {
        let mut state = self.state.lock();
        let Some(root_cx) = state.root_cx.clone() else {
            return;
        };

        let mut span = self.start_child(
            &root_cx,
            format!("tool.{}", event.tool_name),
            SpanKind::Internal,
        );
        span.set_attribute(KeyValue::new("tool.name", event.tool_name.to_string()));
        span.set_attribute(KeyValue::new("tool_call_id", event.tool_call_id.to_string()));
        span.set_attribute(KeyValue::new(ATTR_INPUT, to_json(event.arguments)));

        if let Some(mut stale) = state.tools.insert(event.tool_call_id.to_string(), span) {
            stale.end();
        }
    }

    fn on_tool_call_end(&self, event: &ToolCallEndEvent<'_>) {
        let Some(mut span) = self.state.lock().tools.remove(event.tool_call_id) else {
            return;
        };

        if let Some(result) = event.result.filter(|result| !result.is_null()) {
            span.set_attribute(KeyValue::new(ATTR_OUTPUT, to_json(result)));
        }

        match &event.error {
            Some(error) => fail_span(&mut span, error),
            None => span.set_status(Status::Ok),
        }
        span.end();
    }

    fn on_error(&self, event: &ErrorEvent) {
        let mut state = self.state.lock();

        if let Some(mut span) = state.generation.take() {
            fail_span(&mut span, &event.error);
            span.end();
        }

        for (_, mut span) in state.tools.drain() {
            fail_span(&mut span, &event.error);
            span.end();
        }

        let trace_cx = std::mem::take(&mut state.trace_open).then(|| state.trace_cx.clone());
        for cx in [state.root_cx.take(), trace_cx].into_iter().flatten() {
            let span = cx.span();
            span.add_event(
                "exception",
                vec![KeyValue::new("exception.message", event.error.clone())],
            );
            span.set_status(Status::Error {
                description: event.error.clone().into(),
            });
            span.end();
        }
        state.root_run_id = None;
    }
}

fn fail_span<S: Span>(span: &mut S, message: &str) {
    span.add_event(
        "exception",
        vec![KeyValue::new("exception.message", message.to_string())],
    );
    span.set_status(Status::Error {
        description: message.to_string().into(),
    });
}

fn to_json<V: Serialize + ?Sized>(value: &V) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::noop::NoopTracer;
    use serde_json::json;

    use super::*;
    use crate::callback::{CallbackManager, ErrorStage, SharedCallback};
    use crate::error::ToolError;
    use std::sync::Arc;

    fn callback(trace_id: Option<&str>) -> Arc<LangfuseCallback<NoopTracer>> {
        Arc::new(LangfuseCallback::new(
            NoopTracer::new(),
            LangfuseCallbackConfig {
                trace_id: trace_id.map(str::to_string),
                ..Default::default()
            },
        ))
    }

    impl<T> LangfuseCallback<T>
    where
        T: Tracer,
    {
        fn open_tool_spans(&self) -> usize {
            self.state.lock().tools.len()
        }

        fn has_root(&self) -> bool {
            self.state.lock().root_cx.is_some()
        }

        fn has_trace(&self) -> bool {
            self.state.lock().trace_open
        }
    }

    #[test]
    fn trace_url_uses_configured_trace_id() {
        let langfuse = callback(Some("abc123"));
        assert_eq!(langfuse.trace_id(), "abc123");
        assert_eq!(
            langfuse.trace_url(None),
            "https://cloud.langfuse.com/trace/abc123"
        );
        assert_eq!(
            langfuse.trace_url(Some("https://langfuse.internal/")),
            "https://langfuse.internal/trace/abc123"
        );
        assert_eq!(langfuse.service_name(), "agent-kit");
    }

    #[test]
    fn successful_run_closes_every_span() {
        let langfuse = callback(None);
        let callbacks: Vec<SharedCallback> = vec![langfuse.clone()];
        let mut manager = CallbackManager::new(callbacks, None);

        manager.on_run_start("gpt-4o", "weather?", false);
        assert!(langfuse.has_root());

        manager.on_generation_start(1, &[], "gpt-4o");
        manager.on_generation_end("tool_calls", "", &[], None);

        let args = json!({"city": "Paris"});
        manager.on_tool_call_start("weather", &args, "call_1");
        assert_eq!(langfuse.open_tool_spans(), 1);
        manager.on_tool_call_end("weather", &args, Some(&json!("sunny")), "call_1", None);
        assert_eq!(langfuse.open_tool_spans(), 0);

        manager.on_run_end(&json!("done"), 2);
        assert!(!langfuse.has_root());
        assert!(!langfuse.has_trace());
    }

    #[test]
    fn nested_runs_do_not_open_a_root_span() {
        let langfuse = callback(None);
        let callbacks: Vec<SharedCallback> = vec![langfuse.clone()];
        let mut manager = CallbackManager::new(callbacks, Some("outer".to_string()));

        manager.on_run_start("gpt-4o", "sub task", false);
        assert!(!langfuse.has_root());

        let args = json!({});
        manager.on_tool_call_start("weather", &args, "call_1");
        assert_eq!(langfuse.open_tool_spans(), 0);
    }

    #[test]
    fn each_top_level_run_gets_its_own_root_span() {
        let langfuse = callback(None);
        let shared: SharedCallback = langfuse.clone();

        let mut first = CallbackManager::new(vec![shared.clone()], None);
        first.on_run_start("gpt-4o", "first", false);
        first.on_run_end(&json!("one"), 1);
        assert!(!langfuse.has_root());
        assert!(!langfuse.has_trace());

        let mut second = CallbackManager::new(vec![shared], None);
        second.on_run_start("gpt-4o", "second", false);
        assert!(langfuse.has_root());

        second.on_tool_call_start("weather", &json!({}), "call_1");
        assert_eq!(langfuse.open_tool_spans(), 1);
        second.on_tool_call_end("weather", &json!({}), None, "call_1", None);

        second.on_run_end(&json!("two"), 1);
        assert!(!langfuse.has_root());
    }

    #[test]
    fn runs_after_an_error_still_get_a_root_span() {
        let langfuse = callback(None);
        let shared: SharedCallback = langfuse.clone();

        let mut failed = CallbackManager::new(vec![shared.clone()], None);
        failed.on_run_start("gpt-4o", "first", false);
        failed.on_error(&ToolError::execution("weather", "boom"), ErrorStage::Tool);
        assert!(!langfuse.has_root());

        let mut next = CallbackManager::new(vec![shared], None);
        next.on_run_start("gpt-4o", "second", false);
        assert!(langfuse.has_root());
    }

    #[test]
    fn error_closes_open_spans() {
        let langfuse = callback(None);
        let callbacks: Vec<SharedCallback> = vec![langfuse.clone()];
        let mut manager = CallbackManager::new(callbacks, None);

        manager.on_run_start("gpt-4o", "weather?", true);
        manager.on_generation_start(1, &[], "gpt-4o");
        manager.on_tool_call_start("weather", &json!({}), "call_1");
        manager.on_tool_call_start("weather", &json!({}), "call_2");
        assert_eq!(langfuse.open_tool_spans(), 2);

        let err = ToolError::execution("weather", "boom");
        manager.on_error(&err, ErrorStage::Tool);

        assert_eq!(langfuse.open_tool_spans(), 0);
        assert!(!langfuse.has_root());
        assert!(!langfuse.has_trace());
        assert!(langfuse.trace_context().is_none());
    }
}
