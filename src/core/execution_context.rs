use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::BatchError;

/// Key-value checkpoint data attached to a job or step execution.
///
/// The engine persists the context after every committed chunk and hands it back
/// to readers and writers on restart, so they can resume where the last
/// successful chunk left off. Values are stored as JSON so the whole context can
/// be serialized by any repository implementation.
///
/// ```
/// use spring_batch_engine::core::execution_context::ExecutionContext;
///
/// let mut context = ExecutionContext::new();
/// context.put_long("reader.read.count", 42);
/// assert_eq!(context.get_long("reader.read.count").unwrap(), 42);
/// assert!(context.is_dirty());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores any serializable value under `key`.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), BatchError> {
        let value = serde_json::to_value(value)?;
        let previous = self.entries.insert(key.to_string(), value);
        self.dirty = match previous {
            Some(previous) => previous != self.entries[key] || self.dirty,
            None => true,
        };
        Ok(())
    }

    pub fn put_string(&mut self, key: &str, value: &str) {
        self.put_value(key, Value::from(value));
    }

    pub fn put_long(&mut self, key: &str, value: i64) {
        self.put_value(key, Value::from(value));
    }

    pub fn put_int(&mut self, key: &str, value: i32) {
        self.put_value(key, Value::from(value));
    }

    pub fn put_double(&mut self, key: &str, value: f64) {
        self.put_value(key, Value::from(value));
    }

    fn put_value(&mut self, key: &str, value: Value) {
        if self.entries.get(key) != Some(&value) {
            self.dirty = true;
        }
        self.entries.insert(key.to_string(), value);
    }

    /// Reads the value stored under `key`, `None` if the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BatchError> {
        match self.entries.get(key) {
            Some(value) => Ok(Some(T::deserialize(value).map_err(|err| {
                BatchError::ExecutionContext(format!("Value for key=[{}] is invalid: {}", key, err))
            })?)),
            None => Ok(None),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String, BatchError> {
        self.entries
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Self::type_error(key, "string"))
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> Result<String, BatchError> {
        if self.contains_key(key) {
            self.get_string(key)
        } else {
            Ok(default.to_string())
        }
    }

    pub fn get_long(&self, key: &str) -> Result<i64, BatchError> {
        self.entries
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| Self::type_error(key, "long"))
    }

    pub fn get_long_or(&self, key: &str, default: i64) -> Result<i64, BatchError> {
        if self.contains_key(key) {
            self.get_long(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i32, BatchError> {
        self.get_long(key).and_then(|value| {
            i32::try_from(value).map_err(|_| Self::type_error(key, "int"))
        })
    }

    pub fn get_double(&self, key: &str) -> Result<f64, BatchError> {
        self.entries
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| Self::type_error(key, "double"))
    }

    fn type_error(key: &str, expected: &str) -> BatchError {
        BatchError::ExecutionContext(format!(
            "Value for key=[{}] is not of type: [{}]",
            key, expected
        ))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the context changed since the last [`clear_dirty_flag`](Self::clear_dirty_flag).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty_flag(&mut self) {
        self.dirty = false;
    }

    pub fn to_json(&self) -> Result<String, BatchError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
