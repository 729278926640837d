use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

type DynValue = Arc<dyn Any + Send + Sync>;

/// Typed and named values handed to tools at execution time.
///
/// Cloning copies the maps, so a clone can be extended without touching the
/// original. Stored values themselves are shared and immutable.
#[derive(Clone, Default, Debug)]
pub struct ContextValues {
    typed: HashMap<TypeId, DynValue>,
    named: HashMap<String, DynValue>,
}

impl ContextValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.typed.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.typed.get(&TypeId::of::<T>())?.clone();
        Arc::downcast::<T>(value).ok()
    }

    pub fn insert_named<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.named.insert(key.into(), Arc::new(value));
    }

    pub fn get_named<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.named.get(key)?.clone();
        Arc::downcast::<T>(value).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.typed.is_empty() && self.named.is_empty()
    }

    /// Returns a new set holding `self` overlaid with `overrides`.
    pub fn merged_with(&self, overrides: &ContextValues) -> ContextValues {
        let mut merged = self.clone();
        merged
            .typed
            .extend(overrides.typed.iter().map(|(k, v)| (*k, v.clone())));
        merged
            .named
            .extend(overrides.named.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Execution handle passed to [`Tool::execute`](super::Tool::execute).
#[derive(Clone, Debug)]
pub struct ToolContext {
    run_id: String,
    tool_call_id: String,
    values: ContextValues,
    cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(run_id: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            tool_call_id: tool_call_id.into(),
            values: ContextValues::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_values(mut self, values: ContextValues) -> Self {
        self.values = values;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Run id of the tool execution (the nested run when called from an agent).
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn values(&self) -> &ContextValues {
        &self.values
    }

    pub fn value<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values.get::<T>()
    }

    pub fn named_value<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values.get_named::<T>(key)
    }

    /// Like [`value`](Self::value) but fails with [`ToolError::MissingValue`].
    pub fn require<T>(&self) -> Result<Arc<T>, ToolError>
    where
        T: Send + Sync + 'static,
    {
        self.value::<T>()
            .ok_or(ToolError::MissingValue(std::any::type_name::<T>()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
