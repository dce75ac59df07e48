// Contract with the durable workflow engine that records every side effect
// a session performs.

use crate::constants::syscalls;
use crate::error::ActivityError;
use crate::ids::RunId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A value crossing the engine boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bytes(#[serde(with = "crate::protocol::base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value as JSON. Bytes become a JSON string when they are UTF-8,
    /// otherwise an array of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Json(v) => v.clone(),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(_) => serde_json::Value::from(b.clone()),
            },
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            other => Value::Json(other),
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// One durable invocation requested on behalf of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityCall {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl ActivityCall {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// A user activity: the opaque payload is the only argument.
    pub fn activity(function: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(function).arg(Value::Bytes(payload))
    }

    pub fn sleep(duration_ms: u64) -> Self {
        Self::new(syscalls::SLEEP).arg(serde_json::json!(duration_ms))
    }

    pub fn subscribe(connection: &str, filter: &str) -> Self {
        Self::new(syscalls::SUBSCRIBE)
            .arg(serde_json::json!(connection))
            .arg(serde_json::json!(filter))
    }

    pub fn next_event(subscription_ids: &[String], timeout_ms: Option<u64>) -> Self {
        Self::new(syscalls::NEXT_EVENT)
            .arg(serde_json::json!(subscription_ids))
            .kwarg("timeout_ms", serde_json::json!(timeout_ms))
    }

    pub fn unsubscribe(subscription_id: &str) -> Self {
        Self::new(syscalls::UNSUBSCRIBE).arg(serde_json::json!(subscription_id))
    }
}

/// The replay-capable engine a session delegates its side effects to.
///
/// Implementations record each call under `run_id` so that a replayed run
/// gets the recorded result instead of re-executing it.
#[async_trait]
pub trait DurableEngine: Send + Sync {
    /// Invoke and durably record one activity or control primitive.
    async fn call(&self, run_id: &RunId, call: ActivityCall) -> Result<Value, ActivityError>;

    /// Load the variables stored under `namespace` for the run.
    async fn load(
        &self,
        run_id: &RunId,
        namespace: &str,
    ) -> Result<HashMap<String, Value>, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_wire_shape() {
        let bytes = serde_json::to_value(Value::Bytes(b"ok".to_vec())).unwrap();
        assert_eq!(bytes, serde_json::json!({"kind": "bytes", "value": "b2s="}));

        let null = serde_json::to_value(Value::Null).unwrap();
        assert_eq!(null, serde_json::json!({"kind": "null"}));

        let back: Value = serde_json::from_value(bytes).unwrap();
        assert_eq!(back, Value::Bytes(b"ok".to_vec()));
    }

    #[test]
    fn control_primitives_map_to_named_calls() {
        let sleep = ActivityCall::sleep(250);
        assert_eq!(sleep.function, "sleep");
        assert_eq!(sleep.args, vec![Value::Json(serde_json::json!(250))]);

        let next = ActivityCall::next_event(&["a".to_string()], Some(10));
        assert_eq!(next.function, "next_event");
        assert_eq!(next.args, vec![Value::Json(serde_json::json!(["a"]))]);
        assert_eq!(
            next.kwargs.get("timeout_ms"),
            Some(&Value::Json(serde_json::json!(10)))
        );

        let no_timeout = ActivityCall::next_event(&[], None);
        assert_eq!(no_timeout.kwargs.get("timeout_ms"), Some(&Value::Null));

        let activity = ActivityCall::activity("fetch", vec![7, 8]);
        assert_eq!(activity.args, vec![Value::Bytes(vec![7, 8])]);
    }

    #[test]
    fn bytes_to_json_prefers_text() {
        assert_eq!(Value::Bytes(b"hi".to_vec()).to_json(), serde_json::json!("hi"));
        assert_eq!(Value::Bytes(vec![0xff]).to_json(), serde_json::json!([255]));
    }
}
