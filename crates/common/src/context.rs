//! The ordered key/value bag threaded through saga step executions.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while reading from or merging into a [`SagaContext`].
#[derive(Debug, Error)]
pub enum ContextError {
    /// The key was already written by a different step (or the initial input).
    #[error("Context key '{key}' is owned by {owner}")]
    KeyConflict { key: String, owner: String },

    /// A required key is absent.
    #[error("Context key '{0}' is missing")]
    Missing(String),

    /// A JSON value could not be used as a context.
    #[error("Context payload must be a JSON object, got {0}")]
    NotAnObject(String),

    /// A value could not be converted to or from JSON.
    #[error("Context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Ordered mapping from string keys to JSON values.
///
/// Keys keep insertion order. Every key merged in by a step remembers the step
/// that wrote it: a later step may not overwrite it, while a re-attempt of the
/// same step may. Keys present in the initial input have no writer and are
/// read-only for every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaContext {
    values: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    writers: IndexMap<String, String>,
}

impl SagaContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from the fields of a JSON object.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        match value {
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
                writers: IndexMap::new(),
            }),
            Value::Null => Ok(Self::new()),
            other => Err(ContextError::NotAnObject(json_kind(&other).to_string())),
        }
    }

    /// Returns the values as a JSON object, in insertion order.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Sets a raw JSON value, returning the previous one.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// Serializes and sets a value.
    pub fn insert<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), ContextError> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    /// Builder-style [`SagaContext::set`].
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    /// Returns the raw JSON value for a key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Deserializes the value for a key, if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContextError> {
        match self.values.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Deserializes the value for a key that must be present.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        self.get(key)?
            .ok_or_else(|| ContextError::Missing(key.to_string()))
    }

    /// Returns the name of the step that wrote a key, if any.
    pub fn writer_of(&self, key: &str) -> Option<&str> {
        self.writers.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Iterates over key/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the keys no step has written, i.e. the initial input.
    pub fn unowned(&self) -> SagaContext {
        Self {
            values: self
                .values
                .iter()
                .filter(|(key, _)| !self.writers.contains_key(*key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            writers: IndexMap::new(),
        }
    }

    /// Checks whether `writer` may write every key of `delta`.
    pub fn check_merge(&self, writer: &str, delta: &SagaContext) -> Result<(), ContextError> {
        for key in delta.values.keys() {
            if !self.values.contains_key(key) {
                continue;
            }
            match self.writers.get(key) {
                Some(owner) if owner == writer => {}
                Some(owner) => {
                    return Err(ContextError::KeyConflict {
                        key: key.clone(),
                        owner: format!("step '{owner}'"),
                    });
                }
                None => {
                    return Err(ContextError::KeyConflict {
                        key: key.clone(),
                        owner: "the initial input".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Merges the keys written by `writer`.
    ///
    /// Either every key is merged or none is.
    pub fn merge(&mut self, writer: &str, delta: &SagaContext) -> Result<(), ContextError> {
        self.check_merge(writer, delta)?;
        for (key, value) in &delta.values {
            self.values.insert(key.clone(), value.clone());
            self.writers.insert(key.clone(), writer.to_string());
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
