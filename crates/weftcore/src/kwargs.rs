use crate::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keyword arguments handed to a task run
///
/// Kept as a JSON object so the same bag can be carried by events and sent
/// to a worker process unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(Map<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Get required argument or return error
    pub fn require(&self, key: &str) -> Result<&Value, TaskError> {
        self.0
            .get(key)
            .ok_or_else(|| TaskError::MissingArgument(key.to_string()))
    }

    pub fn require_str(&self, key: &str) -> Result<&str, TaskError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| TaskError::InvalidArgument {
                name: key.to_string(),
                expected: "string".to_string(),
            })
    }

    /// Copies every entry of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: &Kwargs) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Keeps only the listed keys, for handlers that forward the subset
    /// relevant to their own run.
    pub fn subset(&self, keys: &[&str]) -> Kwargs {
        Kwargs(
            self.0
                .iter()
                .filter(|(k, _)| keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Kwargs {
    fn from(map: Map<String, Value>) -> Self {
        Kwargs(map)
    }
}

impl TryFrom<Value> for Kwargs {
    type Error = TaskError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Kwargs(map)),
            Value::Null => Ok(Kwargs::new()),
            _ => Err(TaskError::InvalidArgument {
                name: "kwargs".to_string(),
                expected: "JSON object".to_string(),
            }),
        }
    }
}
