//! Outbound event envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire `type` of an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Application events
    /// An execution began.
    ExecutionStarted,
    /// Incremental execution output.
    ExecutionProgress,
    /// An execution finished.
    ExecutionCompleted,
    /// An execution failed.
    ExecutionError,
    /// A message was added to a session.
    MessageCreated,
    /// Session metadata changed.
    SessionUpdated,
    /// Operator or system notice.
    SystemNotification,

    // Replies
    /// Sent right after connect.
    ConnectionEstablished,
    /// Reply to `ping`.
    Pong,
    /// Reply to `subscribe`.
    Subscribed,
    /// Reply to `unsubscribe`.
    Unsubscribed,
    /// Reply to `join_session`.
    SessionJoined,
    /// Reply to `query`.
    QueryResult,
    /// Reply to `query_all`.
    QueryAllResult,
    /// Reply to `status`.
    StatusResult,
    /// Any rejected or failed request.
    Error,
}

impl EventType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionProgress => "execution_progress",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionError => "execution_error",
            Self::MessageCreated => "message_created",
            Self::SessionUpdated => "session_updated",
            Self::SystemNotification => "system_notification",
            Self::ConnectionEstablished => "connection_established",
            Self::Pong => "pong",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::SessionJoined => "session_joined",
            Self::QueryResult => "query_result",
            Self::QueryAllResult => "query_all_result",
            Self::StatusResult => "status_result",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type, data, timestamp, correlation_id?}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event payload.
    pub data: Value,
    /// RFC 3339 with millisecond precision.
    pub timestamp: String,
    /// Echo of the request's correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl OutboundEvent {
    /// Envelope stamped with the current time.
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            correlation_id: None,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// `error` frame with a machine-readable code.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Error,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }
}
