//! Newline-delimited JSON wire protocol between host and worker.
//!
//! Every message is a single JSON object on its own line:
//!
//! ```text
//! host   -> worker  {"code": "...", "variables": {..}, "tool_names": [..], "output_names": [..], "profile": "root"}
//! worker -> host    {"tool_call": {"name": "...", "args": [..], "kwargs": {..}}}   (zero or more)
//! host   -> worker  {"tool_result": ..} | {"tool_error": "..."}                  (one per tool_call)
//! worker -> host    {"stdout": "...", "stderr": "...", "final": {..} | null}      (exactly one)
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::profile::ExecutionProfile;

/// One unit of work for the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    /// Merged into session state before `code` runs.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Host tools the worker should expose to evaluated code for this request.
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// Labels for the positional values passed to the final-output call.
    #[serde(default)]
    pub output_names: Vec<String>,
    #[serde(default)]
    pub profile: ExecutionProfile,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            variables: Map::new(),
            tool_names: Vec::new(),
            output_names: Vec::new(),
            profile: ExecutionProfile::default(),
        }
    }
}

/// Terminal reply for a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "final", default)]
    pub final_output: Option<Value>,
}

impl ExecuteResponse {
    /// Reply used when a request line cannot be processed at all.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            final_output: None,
        }
    }
}

/// A host tool invocation requested by evaluated code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub tool_call: ToolCall,
}

/// The host's answer to exactly one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolReply {
    #[serde(rename = "tool_result")]
    Result(Value),
    #[serde(rename = "tool_error")]
    Error(String),
}

/// Anything the worker may write on its output stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    ToolCall(ToolCallMessage),
    Response(ExecuteResponse),
}

/// Decode one line of worker output.
pub fn decode_worker_line(line: &str) -> Result<WorkerMessage> {
    serde_json::from_str(line.trim()).context("decode worker message")
}

/// Encode a message as a single JSON line (trailing newline included).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message).context("encode protocol message")?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_defaults_optional_fields() {
        let request: ExecuteRequest = serde_json::from_str(r#"{"code": "1 + 1"}"#).expect("parse");
        assert_eq!(request, ExecuteRequest::new("1 + 1"));
        assert_eq!(request.profile, ExecutionProfile::Root);
    }

    #[test]
    fn response_serializes_missing_final_as_null() {
        let line = encode_line(&ExecuteResponse::default()).expect("encode");
        assert_eq!(line, "{\"stdout\":\"\",\"stderr\":\"\",\"final\":null}\n");
    }

    #[test]
    fn tool_reply_uses_wire_keys() {
        let ok = serde_json::to_value(ToolReply::Result(json!(3))).expect("encode");
        assert_eq!(ok, json!({"tool_result": 3}));
        let err = serde_json::to_value(ToolReply::Error("nope".into())).expect("encode");
        assert_eq!(err, json!({"tool_error": "nope"}));
    }

    #[test]
    fn decode_distinguishes_tool_calls_from_responses() {
        let call = decode_worker_line(r#"{"tool_call": {"name": "search", "args": ["q"]}}"#)
            .expect("decode call");
        match call {
            WorkerMessage::ToolCall(msg) => {
                assert_eq!(msg.tool_call.name, "search");
                assert_eq!(msg.tool_call.args, vec![json!("q")]);
                assert!(msg.tool_call.kwargs.is_empty());
            }
            other => panic!("expected tool call, got {other:?}"),
        }

        let response = decode_worker_line(r#"{"stdout": "hi\n", "stderr": "", "final": {"output": 1}}"#)
            .expect("decode response");
        assert_eq!(
            response,
            WorkerMessage::Response(ExecuteResponse {
                stdout: "hi\n".into(),
                stderr: String::new(),
                final_output: Some(json!({"output": 1})),
            })
        );
    }

    #[test]
    fn decode_rejects_unrelated_objects() {
        assert!(decode_worker_line(r#"{"hello": "world"}"#).is_err());
        assert!(decode_worker_line("not json").is_err());
    }
}
