//! The three message shapes that cross a transport boundary: an RPC request,
//! its result, and an event. All three carry just enough routing metadata for
//! the dispatch engine; payload contents are opaque `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies an in-flight RPC message. Stable across the lifetime of one call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token produced by a result transport's `get_return_path`, carried on
/// an `RpcMessage` so the server side knows where to route its reply.
/// Transports may embed whatever addressing scheme they need inside the
/// string; the dispatch engine never inspects it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ReturnPath(pub String);

/// A remote procedure call in flight. Immutable after construction except for
/// `return_path`, which the client sets exactly once before dispatch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    pub id: MessageId,
    pub api_name: String,
    pub procedure_name: String,
    pub kwargs: Value,
    pub return_path: Option<ReturnPath>,
}

impl RpcMessage {
    pub fn new(api_name: impl Into<String>, procedure_name: impl Into<String>, kwargs: Value) -> Self {
        Self {
            id: MessageId::new(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            return_path: None,
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

/// Reply to one `RpcMessage`. `error == true` implies `result` carries a
/// human-readable description rather than a schema-validated payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub rpc_message_id: MessageId,
    pub result: Value,
    pub error: bool,
    pub trace: Option<String>,
}

impl ResultMessage {
    pub fn success(rpc_message_id: MessageId, result: Value) -> Self {
        Self {
            rpc_message_id,
            result,
            error: false,
            trace: None,
        }
    }

    pub fn failure(rpc_message_id: MessageId, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            rpc_message_id,
            result: Value::String(message.into()),
            error: true,
            trace: Some(trace.into()),
        }
    }
}

/// A fire-and-forget event published for zero-or-more listeners.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub id: MessageId,
    pub api_name: String,
    pub event_name: String,
    pub kwargs: Value,
}

impl EventMessage {
    pub fn new(api_name: impl Into<String>, event_name: impl Into<String>, kwargs: Value) -> Self {
        Self {
            id: MessageId::new(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
        }
    }
}

/// Direction a message is validated/logged in. Matches the reference
/// implementation's "incoming"/"outgoing" schema-validation split (SPEC §3 invariant 6).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_name_joins_api_and_procedure() {
        let msg = RpcMessage::new("accounts", "create", json!({}));
        assert_eq!(msg.canonical_name(), "accounts.create");
    }

    #[test]
    fn result_message_failure_carries_trace() {
        let id = MessageId::new();
        let result = ResultMessage::failure(id.clone(), "boom", "line 1\nline 2");
        assert!(result.error);
        assert_eq!(result.rpc_message_id, id);
        assert_eq!(result.trace.as_deref(), Some("line 1\nline 2"));
    }
}
