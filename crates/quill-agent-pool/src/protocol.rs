//! Line-delimited JSON framing spoken with agent processes.
//!
//! Requests are one `{"type":"user",...}` object per line on stdin. Responses
//! arrive one object per line on stdout; only `system/init`, `assistant`,
//! `content_block_delta` and `result` carry meaning here.

use serde_json::{json, Value};
use thiserror::Error;

const FRAME_TYPE_SYSTEM: &str = "system";
const FRAME_SUBTYPE_INIT: &str = "init";
const FRAME_TYPE_ASSISTANT: &str = "assistant";
const FRAME_TYPE_CONTENT_DELTA: &str = "content_block_delta";
const FRAME_TYPE_RESULT: &str = "result";

#[derive(Debug, Clone, PartialEq, Eq)]
/// One decoded response line.
pub enum AgentFrame {
    Init {
        session_id: String,
    },
    Delta {
        text: String,
    },
    Result {
        session_id: Option<String>,
        is_error: bool,
        result: Option<String>,
    },
    Ignored {
        frame_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentFrameError {
    #[error("agent output line is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("agent output line is not a JSON object")]
    NotAnObject,
    #[error("agent init frame is missing session_id")]
    MissingSessionId,
}

pub fn decode_agent_frame(line: &str) -> Result<AgentFrame, AgentFrameError> {
    let value = serde_json::from_str::<Value>(line.trim())
        .map_err(|error| AgentFrameError::InvalidJson(error.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(AgentFrameError::NotAnObject);
    };
    let frame_type = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match frame_type {
        FRAME_TYPE_SYSTEM
            if object.get("subtype").and_then(Value::as_str) == Some(FRAME_SUBTYPE_INIT) =>
        {
            let session_id = non_empty_str(object.get("session_id"))
                .ok_or(AgentFrameError::MissingSessionId)?;
            Ok(AgentFrame::Init { session_id })
        }
        FRAME_TYPE_ASSISTANT => Ok(delta_or_ignored(
            frame_type,
            object.get("message").map(message_text).unwrap_or_default(),
        )),
        FRAME_TYPE_CONTENT_DELTA => Ok(delta_or_ignored(
            frame_type,
            object
                .get("delta")
                .and_then(|delta| delta.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        FRAME_TYPE_RESULT => Ok(AgentFrame::Result {
            session_id: non_empty_str(object.get("session_id")),
            is_error: object
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            result: object
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        other => Ok(AgentFrame::Ignored {
            frame_type: other.to_string(),
        }),
    }
}

/// Encodes one user turn as a newline-terminated request frame.
pub fn encode_user_frame(content: &str) -> String {
    let mut frame = json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        }
    })
    .to_string();
    frame.push('\n');
    frame
}

fn delta_or_ignored(frame_type: &str, text: String) -> AgentFrame {
    if text.is_empty() {
        AgentFrame::Ignored {
            frame_type: frame_type.to_string(),
        }
    } else {
        AgentFrame::Delta { text }
    }
}

fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::{decode_agent_frame, encode_user_frame, AgentFrame, AgentFrameError};

    #[test]
    fn unit_decodes_init_delta_and_result_frames() {
        assert_eq!(
            decode_agent_frame(r#"{"type":"system","subtype":"init","session_id":"s-1"}"#),
            Ok(AgentFrame::Init {
                session_id: "s-1".to_string()
            })
        );
        assert_eq!(
            decode_agent_frame(
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hel"},{"type":"tool_use"},{"type":"text","text":"lo"}]}}"#
            ),
            Ok(AgentFrame::Delta {
                text: "Hello".to_string()
            })
        );
        assert_eq!(
            decode_agent_frame(r#"{"type":"content_block_delta","delta":{"text":"!"}}"#),
            Ok(AgentFrame::Delta {
                text: "!".to_string()
            })
        );
        assert_eq!(
            decode_agent_frame(r#"{"type":"result","session_id":"s-1","result":"done"}"#),
            Ok(AgentFrame::Result {
                session_id: Some("s-1".to_string()),
                is_error: false,
                result: Some("done".to_string()),
            })
        );
    }

    #[test]
    fn unit_unknown_and_empty_frames_are_ignored() {
        assert_eq!(
            decode_agent_frame(r#"{"type":"system","subtype":"status"}"#),
            Ok(AgentFrame::Ignored {
                frame_type: "system".to_string()
            })
        );
        assert_eq!(
            decode_agent_frame(r#"{"type":"assistant","message":{"content":[]}}"#),
            Ok(AgentFrame::Ignored {
                frame_type: "assistant".to_string()
            })
        );
    }

    #[test]
    fn regression_malformed_lines_are_reported_not_panicking() {
        assert!(matches!(
            decode_agent_frame("{not json"),
            Err(AgentFrameError::InvalidJson(_))
        ));
        assert_eq!(decode_agent_frame("[1]"), Err(AgentFrameError::NotAnObject));
        assert_eq!(
            decode_agent_frame(r#"{"type":"system","subtype":"init"}"#),
            Err(AgentFrameError::MissingSessionId)
        );
    }

    #[test]
    fn unit_user_frame_is_single_json_line() {
        let frame = encode_user_frame("line one\nline two");
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(frame.trim()).expect("json");
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"], "line one\nline two");
    }
}
