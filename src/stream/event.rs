//! Stream Events
//!
//! The typed union carried over the `data: <json>` wire format. Decoding is
//! lenient about field names because several backends emit the same event
//! with different keys (`delta` vs `content`, `args` vs `tool_input`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Content {
        #[serde(alias = "content", default)]
        delta: String,
    },
    Thinking {
        #[serde(alias = "thinking", default)]
        delta: String,
    },
    ToolInput {
        #[serde(default)]
        tool_name: String,
        #[serde(alias = "tool_input", default)]
        args: Value,
    },
    #[serde(alias = "tool_output")]
    ToolResult {
        #[serde(default)]
        tool_name: String,
        #[serde(alias = "output", alias = "tool_output", default)]
        result: Value,
    },
    ChartConfig {
        data: ChartPayload,
    },
    ProcessingStep {
        step: String,
    },
    Error {
        #[serde(alias = "error")]
        message: String,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPayload {
    pub echarts_option: Value,
}

impl StreamEvent {
    pub fn content(delta: impl Into<String>) -> Self {
        StreamEvent::Content { delta: delta.into() }
    }

    pub fn thinking(delta: impl Into<String>) -> Self {
        StreamEvent::Thinking { delta: delta.into() }
    }

    pub fn step(step: impl Into<String>) -> Self {
        StreamEvent::ProcessingStep { step: step.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn done(outcome: impl Into<String>) -> Self {
        StreamEvent::Done {
            outcome: Some(outcome.into()),
        }
    }

    pub fn chart(echarts_option: Value) -> Self {
        StreamEvent::ChartConfig {
            data: ChartPayload { echarts_option },
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    /// Wire discriminant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ConnectionInit { .. } => "connection_init",
            StreamEvent::Content { .. } => "content",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::ToolInput { .. } => "tool_input",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::ChartConfig { .. } => "chart_config",
            StreamEvent::ProcessingStep { .. } => "processing_step",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_alternate_field_names() {
        let full: StreamEvent =
            serde_json::from_value(json!({"type": "content", "content": "hello"})).unwrap();
        assert_eq!(full, StreamEvent::content("hello"));

        let tool: StreamEvent = serde_json::from_value(
            json!({"type": "tool_input", "tool_name": "execute_sql", "tool_input": {"sql": "SELECT 1"}}),
        )
        .unwrap();
        assert_eq!(
            tool,
            StreamEvent::ToolInput {
                tool_name: "execute_sql".to_string(),
                args: json!({"sql": "SELECT 1"}),
            }
        );

        let output: StreamEvent =
            serde_json::from_value(json!({"type": "tool_output", "tool_name": "t", "output": 3}))
                .unwrap();
        assert_eq!(
            output,
            StreamEvent::ToolResult {
                tool_name: "t".to_string(),
                result: json!(3),
            }
        );

        let err: StreamEvent =
            serde_json::from_value(json!({"type": "error", "error": "boom"})).unwrap();
        assert_eq!(err, StreamEvent::error("boom"));
    }

    #[test]
    fn test_chart_config_shape() {
        let event = StreamEvent::chart(json!({"series": []}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "chart_config");
        assert_eq!(value["data"]["echarts_option"]["series"], json!([]));
    }

    #[test]
    fn test_done_tolerates_extra_fields() {
        let done: StreamEvent =
            serde_json::from_value(json!({"type": "done", "usage": {"tokens": 3}})).unwrap();
        assert!(done.is_done());
    }
}
