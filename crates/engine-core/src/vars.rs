//! Typed accessors over the untyped process-variable bag.
//!
//! Variables travel as JSON on the wire and in storage, but executors and
//! expression evaluation need typed reads. `Variables` wraps a JSON object
//! and returns a typed error instead of panicking or silently coercing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use thiserror::Error;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Variables(pub Map<String, Json>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariableError {
    #[error("variable '{0}' is not set")]
    Missing(String),
    #[error("variable '{0}' is not a {1}")]
    WrongType(String, &'static str),
}

impl Variables {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_json(v: Json) -> Self {
        match v {
            Json::Object(m) => Self(m),
            _ => Self(Map::new()),
        }
    }

    pub fn into_json(self) -> Json {
        Json::Object(self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Json) {
        self.0.insert(key.into(), value);
    }

    /// Merge `other` into `self`, overwriting on key collision.
    pub fn merge(&mut self, other: &Variables) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::String(s)) => Ok(s),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "string")),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::Number(n)) => n
                .as_i64()
                .ok_or_else(|| VariableError::WrongType(key.to_string(), "i64")),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "i64")),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::Number(n)) => n
                .as_f64()
                .ok_or_else(|| VariableError::WrongType(key.to_string(), "f64")),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "f64")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::Bool(b)) => Ok(*b),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "bool")),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<&Vec<Json>, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::Array(a)) => Ok(a),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "list")),
        }
    }

    pub fn get_map(&self, key: &str) -> Result<&Map<String, Json>, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::Object(m)) => Ok(m),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "map")),
        }
    }

    /// Resolve a correlation key by reading the named variable as a scalar
    /// string (numbers and bools are stringified; used by message/signal
    /// catch subscriptions).
    pub fn correlation_key(&self, key: &str) -> Result<String, VariableError> {
        match self.0.get(key) {
            None => Err(VariableError::Missing(key.to_string())),
            Some(Json::String(s)) => Ok(s.clone()),
            Some(Json::Number(n)) => Ok(n.to_string()),
            Some(Json::Bool(b)) => Ok(b.to_string()),
            Some(_) => Err(VariableError::WrongType(key.to_string(), "scalar")),
        }
    }
}

impl From<Map<String, Json>> for Variables {
    fn from(m: Map<String, Json>) -> Self {
        Self(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_on_collision() {
        let mut a = Variables::from_json(json!({"x": 1, "y": 2}));
        let b = Variables::from_json(json!({"y": 3, "z": 4}));
        a.merge(&b);
        assert_eq!(a.get_i64("x").unwrap(), 1);
        assert_eq!(a.get_i64("y").unwrap(), 3);
        assert_eq!(a.get_i64("z").unwrap(), 4);
    }

    #[test]
    fn typed_get_reports_wrong_type() {
        let v = Variables::from_json(json!({"x": "hello"}));
        assert_eq!(
            v.get_i64("x"),
            Err(VariableError::WrongType("x".to_string(), "i64"))
        );
    }

    #[test]
    fn typed_get_reports_missing() {
        let v = Variables::new();
        assert_eq!(v.get_bool("flag"), Err(VariableError::Missing("flag".to_string())));
    }

    #[test]
    fn correlation_key_stringifies_scalars() {
        let v = Variables::from_json(json!({"orderId": 123}));
        assert_eq!(v.correlation_key("orderId").unwrap(), "123");
    }
}
