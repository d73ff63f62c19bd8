//! Wire protocol types for bridge-worker communication.
//!
//! One JSON object per line in both directions:
//! - **Outbound** (stdin): `{"id", "action", "params"}`
//! - **Inbound** (stdout): `{"id", "success", "data", "error", "details"}`, or the
//!   one-time `{"ready": true}` signal

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;

/// Correlation identifier binding a request to its response.
///
/// Generated from a v4 UUID so ids are never reused for the lifetime of the
/// process. Carried as a plain string on the wire; any string the worker echoes
/// back is accepted for lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request from bridge to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Request {
    /// Build a request with a fresh id.
    ///
    /// `params` must be a JSON object; `null` is treated as an empty object.
    pub fn new(action: impl Into<String>, params: Value) -> Result<Self, BridgeError> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(BridgeError::Encoding(format!(
                    "params must be a JSON object, got {}",
                    json_kind(&other)
                )));
            }
        };
        Ok(Self {
            id: RequestId::new(),
            action: action.into(),
            params,
        })
    }
}

/// Response from worker to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request id. Absent when the worker does not echo ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Response {
    pub fn success(id: Option<RequestId>, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
            details: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.into()),
            details,
        }
    }

    /// Missing or null `data` on success resolves to an empty object.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        if self.success {
            Ok(match self.data {
                Some(Value::Null) | None => Value::Object(Map::new()),
                Some(data) => data,
            })
        } else {
            Err(BridgeError::Backend {
                message: self
                    .error
                    .unwrap_or_else(|| "worker reported failure without a message".to_string()),
                details: self.details,
            })
        }
    }
}

/// A decoded line from the worker's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ready,
    Response(Response),
}

impl Inbound {
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        if value.get("ready").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::Ready);
        }
        serde_json::from_value(value)
            .map(Self::Response)
            .map_err(|e| BridgeError::Decoding(e.to_string()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, action: &str, params: Value) -> Request {
        let mut req = Request::new(action, params).unwrap();
        req.id = RequestId::from(id);
        req
    }

    #[test]
    fn request_serializes() {
        let req = request("req-1", "vault.search", json!({"query": "rust", "limit": 5}));
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": "req-1",
          "action": "vault.search",
          "params": {
            "limit": 5,
            "query": "rust"
          }
        }
        "#);
    }

    #[test]
    fn request_rejects_non_object_params() {
        let err = Request::new("ping", json!([1, 2])).unwrap_err();
        assert_eq!(
            err,
            BridgeError::Encoding("params must be a JSON object, got an array".to_string())
        );
    }

    #[test]
    fn request_null_params_become_empty_object() {
        let req = Request::new("ping", Value::Null).unwrap();
        assert!(req.params.is_empty());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn failure_response_serializes() {
        let resp = Response::failure(
            Some(RequestId::from("req-9")),
            "Note not found",
            Some("KeyError".to_string()),
        );
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "req-9",
          "success": false,
          "error": "Note not found",
          "details": "KeyError"
        }
        "#);
    }

    #[test]
    fn ready_signal_is_recognized() {
        let inbound = Inbound::from_value(json!({"ready": true})).unwrap();
        assert_eq!(inbound, Inbound::Ready);
    }

    #[test]
    fn response_without_id_decodes() {
        let inbound = Inbound::from_value(json!({"success": true, "data": {"n": 1}})).unwrap();
        match inbound {
            Inbound::Response(resp) => {
                assert!(resp.id.is_none());
                assert_eq!(resp.into_result().unwrap(), json!({"n": 1}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn object_without_success_is_a_decoding_error() {
        let err = Inbound::from_value(json!({"id": "x", "status": "ok"})).unwrap_err();
        assert!(matches!(err, BridgeError::Decoding(_)));
    }

    #[test]
    fn null_data_resolves_to_empty_object() {
        let resp: Response =
            serde_json::from_value(json!({"id": "a", "success": true, "data": null})).unwrap();
        assert_eq!(resp.into_result().unwrap(), json!({}));

        let resp: Response = serde_json::from_value(json!({"id": "a", "success": true})).unwrap();
        assert_eq!(resp.into_result().unwrap(), json!({}));
    }

    #[test]
    fn failure_maps_to_backend_error() {
        let resp: Response = serde_json::from_value(json!({
            "success": false,
            "error": "Missing required parameter: 'title'",
            "details": null
        }))
        .unwrap();
        assert_eq!(
            resp.into_result().unwrap_err(),
            BridgeError::Backend {
                message: "Missing required parameter: 'title'".to_string(),
                details: None,
            }
        );
    }
}
