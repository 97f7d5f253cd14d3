use crate::generation::Generator;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared services and settings handed to every run and step invocation.
///
/// Built once by the embedding application and given to the engine; there is
/// no process-wide registry.
#[derive(Clone, Default)]
pub struct RuntimeContext {
    values: HashMap<String, Value>,
    generator: Option<Arc<dyn Generator>>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        self.values
            .get(key)
            .map(|v| T::deserialize(v))
            .transpose()
            .map_err(|e| anyhow::anyhow!("Context value '{}' has unexpected shape: {}", key, e))
    }

    pub fn generator(&self) -> Option<Arc<dyn Generator>> {
        self.generator.clone()
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("values", &self.values)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}
