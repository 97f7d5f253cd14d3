use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

/// A check applied to values flowing in and out of steps.
///
/// The engine treats contracts as opaque predicates; richer schema languages
/// can be plugged in by implementing this trait.
pub trait Contract: Send + Sync {
    /// Returns a human readable reason when `value` is rejected
    fn validate(&self, value: &Value) -> Result<(), String>;
}

/// Accepts every value
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyValue;

impl Contract for AnyValue {
    fn validate(&self, _value: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// JSON value kinds understood by [`JsonShape`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Any,
}

impl JsonType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::Bool => value.is_boolean(),
            JsonType::Number => value.is_number(),
            JsonType::String => value.is_string(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
            JsonType::Any => true,
        }
    }
}

/// Requires an object carrying the listed fields with the listed kinds
#[derive(Debug, Clone, Default)]
pub struct JsonShape {
    required: Vec<(String, JsonType)>,
}

impl JsonShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, kind: JsonType) -> Self {
        self.required.push((name.into(), kind));
        self
    }
}

impl Contract for JsonShape {
    fn validate(&self, value: &Value) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("expected an object, got {}", kind_name(value)))?;

        for (name, kind) in &self.required {
            match object.get(name) {
                None => return Err(format!("missing required field '{}'", name)),
                Some(field) if !kind.matches(field) => {
                    return Err(format!(
                        "field '{}' should be {:?}, got {}",
                        name,
                        kind,
                        kind_name(field)
                    ))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Accepts values that deserialize into `T`
pub struct Typed<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Contract for Typed<T> {
    fn validate(&self, value: &Value) -> Result<(), String> {
        T::deserialize(value)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_json_shape() {
        let shape = JsonShape::new()
            .field("selection", JsonType::String)
            .field("count", JsonType::Number);

        assert!(shape.validate(&json!({"selection": "Bali", "count": 2})).is_ok());

        let err = shape.validate(&json!({"selection": "Bali"})).unwrap_err();
        assert!(err.contains("missing required field 'count'"));

        let err = shape.validate(&json!({"selection": 1, "count": 2})).unwrap_err();
        assert!(err.contains("'selection'"));

        assert!(shape.validate(&json!("Bali")).is_err());
    }

    #[test]
    fn test_typed_contract() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Selection {
            selection: String,
        }

        let contract = Typed::<Selection>::new();
        assert!(contract.validate(&json!({"selection": "Bali"})).is_ok());
        assert!(contract.validate(&json!({"choice": "Bali"})).is_err());
        assert!(AnyValue.validate(&Value::Null).is_ok());
    }
}
