//! SSE stream types: event variants, wire framing, stream descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of SSE event kinds carried on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SseEventType {
    Keepalive,
    Start,
    Chunk,
    Progress,
    Status,
    Result,
    Error,
    Complete,
    StreamCreated,
}

impl SseEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SseEventType::Keepalive => "keepalive",
            SseEventType::Start => "start",
            SseEventType::Chunk => "chunk",
            SseEventType::Progress => "progress",
            SseEventType::Status => "status",
            SseEventType::Result => "result",
            SseEventType::Error => "error",
            SseEventType::Complete => "complete",
            SseEventType::StreamCreated => "stream_created",
        }
    }
}

/// Stream lifecycle. Terminal states lead to destruction once all
/// subscribers have drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Completed,
    Error,
    Timeout,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Active)
    }
}

/// One event on a stream. Every frame carries its own id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_type: SseEventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
}

impl StreamEvent {
    pub fn new(event_type: SseEventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
        }
    }

    /// Payload rendered into the `data:` field: the event data merged with
    /// the frame timestamp and event id.
    pub fn frame_data(&self) -> serde_json::Value {
        let mut payload = match &self.data {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                if !other.is_null() {
                    map.insert("data".to_string(), other.clone());
                }
                map
            }
        };
        payload.insert(
            "timestamp".to_string(),
            serde_json::Value::String(self.timestamp.to_rfc3339()),
        );
        payload.insert(
            "event_id".to_string(),
            serde_json::Value::String(self.event_id.to_string()),
        );
        serde_json::Value::Object(payload)
    }

    /// Render the full SSE wire frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.event_type.as_str(),
            self.frame_data()
        )
    }
}

/// Read-only stream descriptor for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: Uuid,
    pub service_id: String,
    pub user_id: Option<String>,
    pub tool_id: Option<String>,
    pub status: StreamStatus,
    pub events_sent: u64,
    pub connected_clients: u32,
    pub created_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_format() {
        let event = StreamEvent::new(
            SseEventType::Progress,
            serde_json::json!({"progress": 50}),
        );
        let frame = event.to_frame();
        assert!(frame.starts_with("event: progress\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"progress\":50"));
        assert!(frame.contains("event_id"));
        assert!(frame.contains("timestamp"));
    }

    #[test]
    fn test_frame_data_wraps_non_object_payloads() {
        let event = StreamEvent::new(SseEventType::Chunk, serde_json::json!("partial text"));
        let data = event.frame_data();
        assert_eq!(data["data"], "partial text");
    }

    #[test]
    fn test_terminal_stream_statuses() {
        assert!(!StreamStatus::Active.is_terminal());
        assert!(StreamStatus::Completed.is_terminal());
        assert!(StreamStatus::Error.is_terminal());
        assert!(StreamStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_event_type_round_trip() {
        let value = serde_json::to_string(&SseEventType::StreamCreated).unwrap();
        assert_eq!(value, "\"stream_created\"");
        let parsed: SseEventType = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed, SseEventType::StreamCreated);
    }
}
