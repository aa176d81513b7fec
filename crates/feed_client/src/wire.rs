//! Wire framing for the upstream feed socket.
//!
//! Everything is JSON text frames over one persistent WebSocket:
//!
//! Request:          `{"command": "...", "params": {...}, "rid": "<uuid>"}`
//! Response:         `{"rid": "...", "code": 0, "data": {...}}`
//! Push (direct):    `{"subid": "...", "data": <delta>}`
//! Push (batched):   `{"rid": 0, "data": {"<subid>": <delta>, ...}}`
//!
//! The frame kind is decided exactly once here; downstream handling is
//! exhaustive over [`Frame`].

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Session handshake command.
pub const CMD_SESSION: &str = "session";
/// One-shot / subscribing data query command.
pub const CMD_GET: &str = "get";
/// Best-effort subscription teardown command.
pub const CMD_UNSUBSCRIBE: &str = "unsubscribe";

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub command: String,
    pub params: Value,
    pub rid: String,
}

impl Request {
    pub fn new(command: &str, params: Value, rid: String) -> Self {
        Self {
            command: command.to_string(),
            params,
            rid,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// One inbound frame, classified at the demultiplexing boundary.
#[derive(Debug)]
pub enum Frame {
    /// Response to a pending request, matched by `rid`.
    Response {
        rid: String,
        code: i64,
        data: Value,
    },
    /// Push update addressed by subscription id directly.
    Push { subid: String, data: Value },
    /// One frame carrying deltas for several subscriptions at once
    /// (`rid: 0`); each entry is merged independently.
    BatchedPush { entries: Map<String, Value> },
    /// Anything else. Counted and dropped, connection stays open.
    Unknown(Value),
}

/// Classify one parsed inbound frame.
pub fn classify(value: Value) -> Frame {
    let obj = match value {
        Value::Object(ref m) => m,
        _ => return Frame::Unknown(value),
    };

    // Batched push: rid == 0 (numeric), data is an object of subid → delta.
    if obj.get("rid").and_then(Value::as_i64) == Some(0) {
        if let Some(Value::Object(entries)) = obj.get("data") {
            return Frame::BatchedPush {
                entries: entries.clone(),
            };
        }
        return Frame::Unknown(value);
    }

    // Response: string rid correlates a pending request.
    if let Some(rid) = obj.get("rid").and_then(Value::as_str) {
        let code = obj.get("code").and_then(Value::as_i64).unwrap_or(0);
        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        return Frame::Response {
            rid: rid.to_string(),
            code,
            data,
        };
    }

    // Direct push: subid, no rid.
    if let Some(subid) = obj.get("subid").and_then(Value::as_str) {
        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        return Frame::Push {
            subid: subid.to_string(),
            data,
        };
    }

    Frame::Unknown(value)
}

/// Message a non-zero response code carries, wherever the upstream put it.
pub fn upstream_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(m) => m
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)")
            .to_string(),
        _ => "(no message)".to_string(),
    }
}

/// A one-shot query result counts as empty when no entity container in it
/// has any entries at all — the upstream occasionally answers a valid
/// request with a hollow tree right after reconnecting.
pub fn is_empty_result(data: &Value) -> bool {
    fn has_entries(v: &Value) -> bool {
        match v {
            Value::Object(m) => m.values().any(|c| match c {
                Value::Object(inner) => !inner.is_empty(),
                _ => false,
            }),
            _ => false,
        }
    }

    match data {
        Value::Null => true,
        Value::Object(m) => {
            // `{"data": {...}}` wrapper or the container map itself.
            if let Some(inner) = m.get("data") {
                !has_entries(inner)
            } else {
                !has_entries(data)
            }
        }
        _ => true,
    }
}

pub fn params_with_subscribe(mut params: Value) -> Value {
    if let Value::Object(ref mut m) = params {
        m.insert("subscribe".to_string(), json!(true));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_response() {
        let f = classify(json!({"rid": "abc", "code": 0, "data": {"sid": "s1"}}));
        match f {
            Frame::Response { rid, code, data } => {
                assert_eq!(rid, "abc");
                assert_eq!(code, 0);
                assert_eq!(data["sid"], "s1");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_direct_push() {
        let f = classify(json!({"subid": "7", "data": {"game": {"10": {"price": "1.5"}}}}));
        match f {
            Frame::Push { subid, data } => {
                assert_eq!(subid, "7");
                assert!(data["game"]["10"].is_object());
            }
            other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn classifies_batched_push() {
        let f = classify(json!({"rid": 0, "data": {"7": {"a": 1}, "8": {"b": null}}}));
        match f {
            Frame::BatchedPush { entries } => {
                assert_eq!(entries.len(), 2);
                assert!(entries.contains_key("7") && entries.contains_key("8"));
            }
            other => panic!("expected batched push, got {other:?}"),
        }
    }

    #[test]
    fn unclassifiable_frames_are_unknown() {
        assert!(matches!(classify(json!([1, 2, 3])), Frame::Unknown(_)));
        assert!(matches!(classify(json!({"foo": "bar"})), Frame::Unknown(_)));
        // rid 0 but data not an object
        assert!(matches!(
            classify(json!({"rid": 0, "data": 42})),
            Frame::Unknown(_)
        ));
    }

    #[test]
    fn empty_result_detection() {
        assert!(is_empty_result(&Value::Null));
        assert!(is_empty_result(&json!({})));
        assert!(is_empty_result(&json!({"data": {"game": {}}})));
        assert!(!is_empty_result(&json!({"data": {"game": {"10": {"name": "x"}}}})));
        assert!(!is_empty_result(&json!({"sport": {"1": {"name": "CS2"}}})));
    }

    #[test]
    fn request_framing_carries_rid() {
        let req = Request::new(CMD_GET, json!({"source": "betting"}), "r-1".to_string());
        let v: Value = serde_json::from_str(&req.to_text()).unwrap();
        assert_eq!(v["command"], "get");
        assert_eq!(v["rid"], "r-1");
        assert_eq!(v["params"]["source"], "betting");
    }
}
