mod context;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{SchemaError, ToolError};
use crate::llm::ModelToolDefinition;
use crate::schema::infer_json_schema;

pub use context::{ContextValues, ToolContext};

/// Name and description advertised to the model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A tool callable by the model.
///
/// The implementing type *is* the argument structure: every call deserializes
/// a fresh value from the model's JSON arguments and runs
/// [`execute`](Tool::execute) on it. Its JSON schema is generated from the
/// `JsonSchema` derive.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct GetWeather {
///     /// City to look up.
///     city: String,
/// }
///
/// #[async_trait]
/// impl Tool for GetWeather {
///     fn info() -> ToolInfo {
///         ToolInfo::new("get_weather", "Current weather for a city")
///     }
///
///     async fn execute(&self, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
///         Ok(format!("sunny in {}", self.city).into())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: DeserializeOwned + JsonSchema + Send + Sync + 'static {
    /// Static metadata. An empty name is derived from the type name.
    fn info() -> ToolInfo {
        ToolInfo::default()
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Value produced by a tool, normalized to text before it is sent back.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl ToolOutput {
    pub fn json<T>(value: &T) -> Result<Self, ToolError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(ToolError::Output)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Bytes(_))
    }

    /// Text sent to the model as the tool message.
    pub fn to_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Json(value) => value.to_string(),
        }
    }

    /// JSON view used by callbacks and structured protocol results.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Empty => Value::Null,
            Self::Text(text) => Value::String(text.clone()),
            Self::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            Self::Json(value) => value.clone(),
        }
    }
}

impl From<()> for ToolOutput {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<String> for ToolOutput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ToolOutput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for ToolOutput {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            other => Self::Json(other),
        }
    }
}

/// Tool metadata plus its argument schema.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub id: String,
    pub description: String,
    pub json_schema: Value,
}

impl ToolSchema {
    pub fn definition(&self) -> ModelToolDefinition {
        ModelToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema.clone(),
            strict: true,
        }
    }
}

/// Resolves the tool's info, deriving the name from the type when unset.
pub fn tool_info<T: Tool>() -> ToolInfo {
    let mut info = T::info();
    if info.name.is_empty() {
        info.name = type_name_to_tool_name(short_type_name(std::any::type_name::<T>()));
    }
    info
}

pub fn build_tool_schema<T: Tool>() -> Result<ToolSchema, SchemaError> {
    let info = tool_info::<T>();
    Ok(ToolSchema {
        id: tool_id(&info.name),
        name: info.name,
        description: info.description,
        json_schema: infer_json_schema::<T>()?,
    })
}

/// Registry key for a tool name: lower-cased, spaces and hyphens become `_`.
pub fn tool_id(name: &str) -> String {
    name.replace([' ', '-'], "_").to_lowercase()
}

/// Converts a CamelCase type name to lower_snake_case.
///
/// An underscore is inserted before an upper-case letter when the previous
/// character is lower-case or the next one is, so acronyms stay together:
/// `HTTPClient2Request` becomes `http_client2_request`.
pub fn type_name_to_tool_name(type_name: &str) -> String {
    if type_name.is_empty() {
        return "unnamed_tool".to_string();
    }

    let chars = type_name.chars().collect::<Vec<_>>();
    let mut result = String::with_capacity(type_name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            let prev_is_lower = chars[i - 1].is_ascii_lowercase();
            let next_is_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if prev_is_lower || next_is_lower {
                result.push('_');
            }
        }
        result.push(c);
    }

    result.to_lowercase()
}

fn short_type_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

type ToolHandler =
    dyn Fn(&str, ToolContext) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync;

/// A type-erased, registered tool.
#[derive(Clone)]
pub struct ToolSpec {
    schema: ToolSchema,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("schema", &self.schema)
            .finish()
    }
}

impl ToolSpec {
    pub fn of<T: Tool>() -> Result<Self, SchemaError> {
        let schema = build_tool_schema::<T>()?;
        let tool_name = schema.name.clone();

        let handler = move |arguments: &str, ctx: ToolContext| {
            let parsed = materialize_arguments::<T>(&tool_name, arguments);
            let future: BoxFuture<'static, Result<ToolOutput, ToolError>> =
                Box::pin(async move { parsed?.execute(&ctx).await });
            future
        };

        Ok(Self {
            schema,
            handler: Arc::new(handler),
        })
    }

    pub fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn id(&self) -> &str {
        &self.schema.id
    }

    /// Deserializes `arguments` into a fresh argument value and executes it.
    pub async fn call(&self, arguments: &str, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        (self.handler)(arguments, ctx).await
    }
}

fn materialize_arguments<T: Tool>(tool_name: &str, arguments: &str) -> Result<T, ToolError> {
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };

    serde_json::from_str::<T>(arguments).map_err(|err| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message: err.to_string(),
    })
}

/// Tools keyed by id, kept in registration order.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`. A tool whose id collides with an existing one
    /// replaces it.
    pub fn register(&mut self, tool: ToolSpec) {
        let id = tool.id().to_string();
        if self.tools.insert(id.clone(), tool).is_some() {
            tracing::debug!(tool_id = %id, "tool id already registered, replacing");
        } else {
            self.order.push(id);
        }
    }

    pub fn register_tool<T: Tool>(&mut self) -> Result<(), SchemaError> {
        self.register(ToolSpec::of::<T>()?);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ToolSpec> {
        self.tools.get(id)
    }

    /// Exact match on the advertised tool name.
    pub fn find_by_name(&self, name: &str) -> Option<&ToolSpec> {
        self.iter().find(|tool| tool.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> + '_ {
        self.order.iter().filter_map(|id| self.tools.get(id))
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.iter().map(|tool| tool.schema().clone()).collect()
    }

    pub fn definitions(&self) -> Vec<ModelToolDefinition> {
        self.iter().map(|tool| tool.schema().definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct HTTPClient2Request {
        url: String,
    }

    #[async_trait]
    impl Tool for HTTPClient2Request {
        async fn execute(&self, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(self.url.clone().into())
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Counter {
        #[serde(default)]
        count: u32,
    }

    #[async_trait]
    impl Tool for Counter {
        fn info() -> ToolInfo {
            ToolInfo::new("Count Things-Now", "counts things")
        }

        async fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            let step = ctx.value::<u32>().map(|step| *step).unwrap_or(1);
            ToolOutput::json(&json!({"count": self.count + step}))
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Replacement {}

    #[async_trait]
    impl Tool for Replacement {
        fn info() -> ToolInfo {
            ToolInfo::new("count things now", "replacement")
        }

        async fn execute(&self, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Empty)
        }
    }

    #[test]
    fn type_names_convert_to_snake_case() {
        assert_eq!(type_name_to_tool_name("MyTool"), "my_tool");
        assert_eq!(type_name_to_tool_name("HTTPClient"), "http_client");
        assert_eq!(type_name_to_tool_name("HTTPClient2Request"), "http_client2_request");
        assert_eq!(type_name_to_tool_name("search"), "search");
        assert_eq!(type_name_to_tool_name(""), "unnamed_tool");
    }

    #[test]
    fn tool_ids_fold_spaces_and_hyphens() {
        assert_eq!(tool_id("Count Things-Now"), "count_things_now");
        assert_eq!(tool_id("http_client2_request"), "http_client2_request");
    }

    #[test]
    fn default_info_is_derived_from_type_name() {
        let schema = build_tool_schema::<HTTPClient2Request>().expect("schema builds");
        assert_eq!(schema.name, "http_client2_request");
        assert_eq!(schema.id, "http_client2_request");
        assert_eq!(schema.description, "");
        assert_eq!(schema.json_schema["required"], json!(["url"]));
        assert_eq!(schema.json_schema["additionalProperties"], false);
    }

    #[test]
    fn explicit_info_keeps_name_and_normalizes_id() {
        let schema = build_tool_schema::<Counter>().expect("schema builds");
        assert_eq!(schema.name, "Count Things-Now");
        assert_eq!(schema.id, "count_things_now");
        assert_eq!(schema.definition().description, "counts things");
        assert!(schema.definition().strict);
    }

    #[tokio::test]
    async fn each_call_gets_fresh_arguments() {
        let tool = ToolSpec::of::<Counter>().expect("tool builds");

        let first = tool
            .call(r#"{"count": 4}"#, ToolContext::new("run", "call_1"))
            .await
            .expect("call succeeds");
        assert_eq!(first, ToolOutput::Json(json!({"count": 5})));

        let second = tool
            .call("", ToolContext::new("run", "call_2"))
            .await
            .expect("empty arguments default");
        assert_eq!(second, ToolOutput::Json(json!({"count": 1})));
    }

    #[tokio::test]
    async fn context_values_reach_the_tool() {
        let tool = ToolSpec::of::<Counter>().expect("tool builds");
        let mut values = ContextValues::new();
        values.insert::<u32>(10);

        let output = tool
            .call(r#"{"count": 1}"#, ToolContext::new("run", "call_1").with_values(values))
            .await
            .expect("call succeeds");
        assert_eq!(output.to_text(), r#"{"count":11}"#);
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected() {
        let tool = ToolSpec::of::<HTTPClient2Request>().expect("tool builds");

        let err = tool
            .call("{not json", ToolContext::new("run", "call_1"))
            .await
            .expect_err("must fail");
        match err {
            ToolError::InvalidArguments { tool, .. } => assert_eq!(tool, "http_client2_request"),
            other => panic!("unexpected error: {other}"),
        }

        let err = tool
            .call("{}", ToolContext::new("run", "call_2"))
            .await
            .expect_err("missing field");
        assert!(err.to_string().contains("missing field"));
    }

    #[test]
    fn outputs_normalize_to_text() {
        assert_eq!(ToolOutput::from(()).to_text(), "");
        assert_eq!(ToolOutput::from("plain").to_text(), "plain");
        assert_eq!(ToolOutput::from(b"raw".to_vec()).to_text(), "raw");
        assert_eq!(ToolOutput::from(json!({"a": [1, 2]})).to_text(), r#"{"a":[1,2]}"#);
        assert_eq!(ToolOutput::from(Value::Null), ToolOutput::Empty);
        assert_eq!(ToolOutput::Empty.to_value(), Value::Null);
    }

    #[test]
    fn colliding_ids_keep_last_registration() {
        let mut registry = ToolRegistry::new();
        registry.register_tool::<Counter>().expect("registers");
        registry
            .register_tool::<HTTPClient2Request>()
            .expect("registers");
        registry.register_tool::<Replacement>().expect("registers");

        assert_eq!(registry.len(), 2);
        let names = registry
            .iter()
            .map(|tool| tool.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, ["count things now", "http_client2_request"]);
        assert!(registry.find_by_name("Count Things-Now").is_none());
        assert!(registry.find_by_name("count things now").is_some());
        assert!(registry.get("count_things_now").is_some());
    }
}
