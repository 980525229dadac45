//! Command request/response model.
//!
//! The payload exchanged with a server is an opaque JSON document: a
//! top-level command-name key, command-specific fields, and optional
//! cross-cutting modifiers (write concern, read concern, max-time bound,
//! correlation comment). The harness never interprets command-specific
//! fields; it only assembles the wire document and classifies the reply.

use crate::types::NodeAddr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;

/// Write acknowledgement requirement attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    /// Acknowledged by a majority of voting members.
    Majority,
    /// Acknowledged by exactly `n` members.
    Nodes(u32),
}

impl WriteConcern {
    fn to_wire(&self) -> Value {
        match self {
            Self::Majority => json!({ "w": "majority" }),
            Self::Nodes(n) => json!({ "w": n }),
        }
    }
}

/// Read isolation requirement attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConcern {
    Local,
    Majority,
    Linearizable,
}

impl ReadConcern {
    fn level(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Majority => "majority",
            Self::Linearizable => "linearizable",
        }
    }
}

/// One structured command addressed to one endpoint.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Endpoint the command is sent to.
    pub target: NodeAddr,
    /// Command document; the first key is the command name.
    pub body: Value,
    pub write_concern: Option<WriteConcern>,
    pub read_concern: Option<ReadConcern>,
    /// Server-side execution bound; exceeded executions fail with
    /// MaxTimeExpired rather than hanging the client.
    pub max_time: Option<Duration>,
    /// Free-form correlation tag echoed into server logs and currentOp.
    pub comment: Option<String>,
}

impl CommandRequest {
    pub fn new(target: NodeAddr, body: Value) -> Self {
        Self {
            target,
            body,
            write_concern: None,
            read_concern: None,
            max_time: None,
            comment: None,
        }
    }

    #[must_use]
    pub fn with_write_concern(mut self, wc: WriteConcern) -> Self {
        self.write_concern = Some(wc);
        self
    }

    #[must_use]
    pub fn with_read_concern(mut self, rc: ReadConcern) -> Self {
        self.read_concern = Some(rc);
        self
    }

    #[must_use]
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The top-level command name (first key of the body document).
    pub fn command_name(&self) -> &str {
        self.body
            .as_object()
            .and_then(|obj| obj.keys().next())
            .map(String::as_str)
            .unwrap_or("<malformed>")
    }

    /// Assemble the full wire document: body plus cross-cutting modifiers.
    pub fn to_wire(&self) -> Value {
        let mut doc = match &self.body {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("<malformed>".to_string(), other.clone());
                map
            }
        };
        if let Some(wc) = &self.write_concern {
            doc.insert("writeConcern".to_string(), wc.to_wire());
        }
        if let Some(rc) = &self.read_concern {
            doc.insert("readConcern".to_string(), json!({ "level": rc.level() }));
        }
        if let Some(max_time) = self.max_time {
            doc.insert(
                "maxTimeMS".to_string(),
                json!(max_time.as_millis() as u64),
            );
        }
        if let Some(comment) = &self.comment {
            doc.insert("comment".to_string(), json!(comment));
        }
        Value::Object(doc)
    }
}

/// Structured error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: i32,
    #[serde(default)]
    pub code_name: String,
    pub message: String,
}

/// One structured reply to one request.
///
/// A transport-level failure is never represented as a response; it is a
/// distinct error kind raised by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Success flag; false responses carry `error`.
    pub ok: bool,
    /// Command-specific result payload.
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    /// Logical timestamp of the operation, when the server reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_time: Option<u64>,
    /// Gossiped cluster time, when the server reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_time: Option<u64>,
}

impl CommandResponse {
    pub fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload,
            error: None,
            operation_time: None,
            cluster_time: None,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: Value::Null,
            error: Some(CommandError {
                code,
                code_name: crate::errors::catalog::code_name(code).to_string(),
                message: message.into(),
            }),
            operation_time: None,
            cluster_time: None,
        }
    }

    #[must_use]
    pub fn with_operation_time(mut self, t: u64) -> Self {
        self.operation_time = Some(t);
        self
    }

    /// Numeric error code, when this is a failure response.
    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Fetch a field of the result payload by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NodeAddr {
        NodeAddr::new("db0", 27017)
    }

    #[test]
    fn test_command_name_is_first_key() {
        let req = CommandRequest::new(addr(), json!({ "find": "users", "filter": {} }));
        assert_eq!(req.command_name(), "find");
    }

    #[test]
    fn test_wire_doc_merges_modifiers() {
        let req = CommandRequest::new(addr(), json!({ "count": "orders" }))
            .with_max_time(Duration::from_millis(250))
            .with_write_concern(WriteConcern::Majority)
            .with_read_concern(ReadConcern::Majority)
            .with_comment("corr-17");
        let wire = req.to_wire();
        assert_eq!(wire["count"], json!("orders"));
        assert_eq!(wire["maxTimeMS"], json!(250));
        assert_eq!(wire["writeConcern"]["w"], json!("majority"));
        assert_eq!(wire["readConcern"]["level"], json!("majority"));
        assert_eq!(wire["comment"], json!("corr-17"));
    }

    #[test]
    fn test_wire_doc_without_modifiers_is_body() {
        let req = CommandRequest::new(addr(), json!({ "ping": 1 }));
        assert_eq!(req.to_wire(), json!({ "ping": 1 }));
    }

    #[test]
    fn test_numeric_write_concern() {
        let req = CommandRequest::new(addr(), json!({ "insert": "t" }))
            .with_write_concern(WriteConcern::Nodes(2));
        assert_eq!(req.to_wire()["writeConcern"]["w"], json!(2));
    }

    #[test]
    fn test_failure_response_names_the_code() {
        let resp = CommandResponse::failure(11000, "E11000 duplicate key");
        assert!(!resp.ok);
        assert_eq!(resp.error_code(), Some(11000));
        assert_eq!(resp.error.as_ref().unwrap().code_name, "DuplicateKey");
    }

    #[test]
    fn test_success_response_has_no_error() {
        let resp = CommandResponse::success(json!({ "n": 3 })).with_operation_time(42);
        assert!(resp.ok);
        assert_eq!(resp.error_code(), None);
        assert_eq!(resp.field("n"), Some(&json!(3)));
        assert_eq!(resp.operation_time, Some(42));
    }
}
