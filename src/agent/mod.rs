use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::callback::{
    AgentCallback, CallbackManager, ErrorStage, SharedCallback, merge_callbacks,
};
use crate::error::{AgentError, ProviderError, SchemaError, ToolError};
use crate::llm::{
    ChatModel, CompletionRequest, ModelCompletion, ModelMessage, ModelToolCall, ResponseFormat,
};
use crate::schema::infer_json_schema;
use crate::tools::{
    ContextValues, Tool, ToolContext, ToolOutput, ToolRegistry, ToolSchema, ToolSpec,
};

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_ITERATIONS: u32 = 10;
const RESPONSE_FORMAT_NAME: &str = "response";

/// Types an agent can return. `String` means plain text; anything else is
/// requested as strict structured output and parsed from JSON.
pub trait AgentOutput: Serialize + DeserializeOwned + JsonSchema + Send + 'static {}

impl<T> AgentOutput for T where T: Serialize + DeserializeOwned + JsonSchema + Send + 'static {}

fn is_text_output<O: 'static>() -> bool {
    TypeId::of::<O>() == TypeId::of::<String>()
}

pub struct AgentBuilder<O = String> {
    client: Option<Arc<dyn ChatModel>>,
    model: Option<String>,
    tools: Vec<Result<ToolSpec, SchemaError>>,
    callbacks: Vec<SharedCallback>,
    max_iterations: u32,
    temperature: Option<f32>,
    values: ContextValues,
    _output: PhantomData<fn() -> O>,
}

impl<O: AgentOutput> Default for AgentBuilder<O> {
    fn default() -> Self {
        Self {
            client: None,
            model: None,
            tools: Vec::new(),
            callbacks: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: None,
            values: ContextValues::new(),
            _output: PhantomData,
        }
    }
}

impl<O: AgentOutput> AgentBuilder<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client<M>(mut self, client: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.client = Some(Arc::new(client));
        self
    }

    pub fn shared_client(mut self, client: Arc<dyn ChatModel>) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides the client's default model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn tool<T: Tool>(mut self) -> Self {
        self.tools.push(ToolSpec::of::<T>());
        self
    }

    pub fn tool_spec(mut self, tool: ToolSpec) -> Self {
        self.tools.push(Ok(tool));
        self
    }

    pub fn callback<C>(mut self, callback: C) -> Self
    where
        C: AgentCallback + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    pub fn shared_callback(mut self, callback: SharedCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Replaces the agent-level callbacks.
    pub fn callbacks(mut self, callbacks: Vec<SharedCallback>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Typed value visible to every tool call through [`ToolContext::value`].
    pub fn value<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.values.insert(value);
        self
    }

    pub fn named_value<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.values.insert_named(key, value);
        self
    }

    pub fn build(self) -> Result<Agent<O>, AgentError> {
        let Some(client) = self.client else {
            return Err(AgentError::Config(
                "agent client must be configured via AgentBuilder::client(...)".to_string(),
            ));
        };

        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool?);
        }

        let model = self
            .model
            .or_else(|| client.default_model().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let response_format = if is_text_output::<O>() {
            None
        } else {
            Some(ResponseFormat {
                name: RESPONSE_FORMAT_NAME.to_string(),
                schema: infer_json_schema::<O>()?,
                strict: true,
            })
        };

        Ok(Agent {
            client,
            registry,
            model,
            callbacks: self.callbacks,
            max_iterations: self.max_iterations,
            temperature: self.temperature,
            values: self.values,
            response_format,
            _output: PhantomData,
        })
    }
}

/// Per-call options for [`Agent::invoke`].
///
/// Exactly one of `prompt` and `messages` must be set.
#[derive(Clone, Default)]
pub struct InvokeConfig {
    pub prompt: Option<String>,
    pub messages: Vec<ModelMessage>,
    /// Take priority over agent callbacks with the same name.
    pub callbacks: Vec<SharedCallback>,
    pub parent_run_id: Option<String>,
    /// Prepended once, before the prompt or messages.
    pub system_prompt: Option<String>,
    pub max_iterations: Option<u32>,
    /// Overlaid on the agent-level values.
    pub values: ContextValues,
    pub cancellation: Option<CancellationToken>,
}

impl InvokeConfig {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn messages(messages: Vec<ModelMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_callback<C>(mut self, callback: C) -> Self
    where
        C: AgentCallback + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    pub fn with_shared_callback(mut self, callback: SharedCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_parent_run_id(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_value<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.values.insert(value);
        self
    }

    pub fn with_named_value<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.values.insert_named(key, value);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    fn prompt_text(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|prompt| !prompt.is_empty())
    }

    fn build_messages(&self) -> Result<Vec<ModelMessage>, AgentError> {
        let mut messages = Vec::with_capacity(self.messages.len() + 2);
        if let Some(system_prompt) = self.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ModelMessage::system(system_prompt));
        }

        match (self.prompt_text(), self.messages.is_empty()) {
            (Some(_), false) => {
                return Err(AgentError::Input(
                    "cannot specify both prompt and messages".to_string(),
                ));
            }
            (None, true) => {
                return Err(AgentError::Input(
                    "must specify either prompt or messages".to_string(),
                ));
            }
            (Some(prompt), true) => messages.push(ModelMessage::user(prompt)),
            (None, false) => messages.extend(self.messages.iter().cloned()),
        }

        Ok(messages)
    }
}

/// Tool-calling agent returning `O`.
///
/// An agent holds no per-invocation state; `&Agent` can drive any number of
/// concurrent invocations.
pub struct Agent<O = String> {
    client: Arc<dyn ChatModel>,
    registry: ToolRegistry,
    model: String,
    callbacks: Vec<SharedCallback>,
    max_iterations: u32,
    temperature: Option<f32>,
    values: ContextValues,
    response_format: Option<ResponseFormat>,
    _output: PhantomData<fn() -> O>,
}

struct LoopFailure {
    error: AgentError,
    stage: ErrorStage,
}

impl LoopFailure {
    fn new(error: impl Into<AgentError>, stage: ErrorStage) -> Self {
        Self {
            error: error.into(),
            stage,
        }
    }
}

impl<O: AgentOutput> Agent<O> {
    pub fn builder() -> AgentBuilder<O> {
        AgentBuilder::new()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Registered tool schemas in registration order.
    pub fn tools(&self) -> Vec<&ToolSchema> {
        self.registry.iter().map(ToolSpec::schema).collect()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub async fn invoke_prompt(&self, prompt: impl Into<String>) -> Result<O, AgentError> {
        self.invoke(InvokeConfig::prompt(prompt)).await
    }

    pub async fn invoke_messages(&self, messages: Vec<ModelMessage>) -> Result<O, AgentError> {
        self.invoke(InvokeConfig::messages(messages)).await
    }

    /// Runs the tool-calling loop until the model answers without tool calls.
    ///
    /// Input errors are returned before any callback fires. Every other
    /// failure is reported once through `on_error`; `on_run_end` fires only
    /// on success.
    pub async fn invoke(&self, config: InvokeConfig) -> Result<O, AgentError> {
        let messages = config.build_messages()?;

        let callbacks = merge_callbacks(&config.callbacks, &self.callbacks);
        let mut manager = CallbackManager::new(callbacks, config.parent_run_id.clone());

        let input = config.prompt_text().unwrap_or("messages");
        manager.on_run_start(&self.model, input, self.response_format.is_some());

        let max_iterations = config.max_iterations.unwrap_or(self.max_iterations);
        let values = self.values.merged_with(&config.values);
        let cancellation = config.cancellation.clone().unwrap_or_default();

        debug!(
            run_id = %manager.run_id(),
            model = %self.model,
            max_iterations,
            tools = self.registry.len(),
            "agent invocation started"
        );

        match self
            .run_loop(&mut manager, messages, &values, &cancellation, max_iterations)
            .await
        {
            Ok((output, iterations)) => {
                let value = serde_json::to_value(&output).unwrap_or(Value::Null);
                manager.on_run_end(&value, iterations);
                info!(run_id = %manager.run_id(), iterations, "agent invocation completed");
                Ok(output)
            }
            Err(LoopFailure { error, stage }) => {
                manager.on_error(&error, stage);
                debug!(
                    run_id = %manager.run_id(),
                    stage = %stage,
                    error = %error,
                    "agent invocation failed"
                );
                Err(error)
            }
        }
    }

    async fn run_loop(
        &self,
        manager: &mut CallbackManager,
        messages: Vec<ModelMessage>,
        values: &ContextValues,
        cancellation: &CancellationToken,
        max_iterations: u32,
    ) -> Result<(O, u32), LoopFailure> {
        let mut request = CompletionRequest {
            model: self.model.clone(),
            messages,
            tools: self.registry.definitions(),
            response_format: self.response_format.clone(),
            temperature: self.temperature,
        };

        for iteration in 1..=max_iterations {
            manager.on_generation_start(iteration, &request.messages, &self.model);
            debug!(run_id = %manager.run_id(), iteration, "requesting completion");

            let completion = self
                .generate(&request, cancellation)
                .await
                .map_err(|err| LoopFailure::new(err, ErrorStage::Generation))?;

            manager.on_generation_end(
                &completion.finish_reason,
                &completion.content,
                &completion.tool_calls,
                completion.usage.as_ref(),
            );
            request.messages.push(assistant_message(&completion));

            if completion.tool_calls.is_empty() {
                let output = parse_output::<O>(completion.content)
                    .map_err(|err| LoopFailure::new(err, ErrorStage::Generation))?;
                return Ok((output, iteration));
            }

            for tool_call in &completion.tool_calls {
                let output = self
                    .dispatch(manager, tool_call, values, cancellation)
                    .await
                    .map_err(|err| LoopFailure::new(err, ErrorStage::Tool))?;
                request
                    .messages
                    .push(ModelMessage::tool(&tool_call.id, output.to_text()));
            }
        }

        Err(LoopFailure::new(
            AgentError::MaxIterations { max_iterations },
            ErrorStage::Run,
        ))
    }

    async fn generate(
        &self,
        request: &CompletionRequest,
        cancellation: &CancellationToken,
    ) -> Result<ModelCompletion, ProviderError> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ProviderError::Cancelled),
            completion = self.client.complete(request) => completion,
        }
    }

    async fn dispatch(
        &self,
        manager: &mut CallbackManager,
        tool_call: &ModelToolCall,
        values: &ContextValues,
        cancellation: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let arguments = arguments_value(&tool_call.arguments);
        let nested_run_id = manager.on_tool_call_start(&tool_call.name, &arguments, &tool_call.id);

        let Some(tool) = self.registry.find_by_name(&tool_call.name) else {
            let err = ToolError::NotFound(tool_call.name.clone());
            manager.on_tool_call_end(
                &tool_call.name,
                &arguments,
                None,
                &tool_call.id,
                Some(&err),
            );
            return Err(err);
        };

        let ctx = ToolContext::new(nested_run_id, tool_call.id.clone())
            .with_values(values.clone())
            .with_cancellation(cancellation.child_token());

        debug!(
            run_id = %manager.run_id(),
            tool = %tool_call.name,
            tool_call_id = %tool_call.id,
            "dispatching tool call"
        );

        match tool.call(&tool_call.arguments, ctx).await {
            Ok(output) => {
                let result = output.to_value();
                manager.on_tool_call_end(
                    &tool_call.name,
                    &arguments,
                    Some(&result),
                    &tool_call.id,
                    None,
                );
                Ok(output)
            }
            Err(err) => {
                manager.on_tool_call_end(
                    &tool_call.name,
                    &arguments,
                    None,
                    &tool_call.id,
                    Some(&err),
                );
                Err(err)
            }
        }
    }
}

fn assistant_message(completion: &ModelCompletion) -> ModelMessage {
    let content = if completion.content.is_empty() && !completion.tool_calls.is_empty() {
        None
    } else {
        Some(completion.content.clone())
    };
    ModelMessage::Assistant {
        content,
        tool_calls: completion.tool_calls.clone(),
    }
}

/// Arguments as reported to callbacks. Unparseable input is passed on as the
/// raw string.
fn arguments_value(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_output<O: AgentOutput>(content: String) -> Result<O, AgentError> {
    let parsed = if is_text_output::<O>() {
        serde_json::from_value(Value::String(content))
    } else {
        serde_json::from_str(&content)
    };
    parsed.map_err(AgentError::OutputParse)
}
