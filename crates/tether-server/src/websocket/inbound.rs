//! Inbound frame parsing into a closed message set.

use serde_json::{Map, Value};
use tether_core::SessionId;
use thiserror::Error;
use uuid::Uuid;

/// A validated inbound request.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// Application-level ping.
    Ping,
    /// Subscribe to a topic.
    Subscribe {
        /// Topic name.
        subscription: String,
    },
    /// Unsubscribe from a topic.
    Unsubscribe {
        /// Topic name.
        subscription: String,
    },
    /// Move the connection to another session.
    JoinSession {
        /// Target session (UUID).
        session_id: SessionId,
    },
    /// Forwarded to the application handler.
    Query {
        /// Frame fields other than `type` and `correlation_id`.
        payload: Value,
    },
    /// Forwarded to the application handler.
    QueryAll {
        /// Frame fields other than `type` and `correlation_id`.
        payload: Value,
    },
    /// Forwarded to the application handler.
    Status {
        /// Frame fields other than `type` and `correlation_id`.
        payload: Value,
    },
}

impl InboundMessage {
    /// Wire `type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::JoinSession { .. } => "join_session",
            Self::Query { .. } => "query",
            Self::QueryAll { .. } => "query_all",
            Self::Status { .. } => "status",
        }
    }
}

/// Why an inbound frame was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidFrame {
    /// Not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// No string `type` field.
    #[error("missing message type")]
    MissingType,
    /// `type` outside the known set.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// A required field is absent.
    #[error("missing field '{field}' for {message_type}")]
    MissingField {
        /// Message type.
        message_type: &'static str,
        /// Field name.
        field: &'static str,
    },
    /// A field is present but unusable.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl InvalidFrame {
    /// Code for the `error` reply.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_frame",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
        }
    }
}

/// Result of parsing one text frame.
///
/// The correlation id is extracted even when the message itself is invalid,
/// so error replies can echo it.
#[derive(Debug)]
pub struct ParsedFrame {
    /// `correlation_id` of the frame, if any.
    pub correlation_id: Option<String>,
    /// The validated message.
    pub message: Result<InboundMessage, InvalidFrame>,
}

/// Parse one text frame.
pub fn parse_frame(text: &str) -> ParsedFrame {
    let mut object = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return ParsedFrame {
                correlation_id: None,
                message: Err(InvalidFrame::Malformed("expected a JSON object".into())),
            };
        }
        Err(e) => {
            return ParsedFrame {
                correlation_id: None,
                message: Err(InvalidFrame::Malformed(e.to_string())),
            };
        }
    };

    let correlation_id = match object.remove("correlation_id") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    ParsedFrame {
        correlation_id,
        message: parse_message(object),
    }
}

fn parse_message(mut object: Map<String, Value>) -> Result<InboundMessage, InvalidFrame> {
    let message_type = match object.remove("type") {
        Some(Value::String(t)) => t,
        _ => return Err(InvalidFrame::MissingType),
    };

    match message_type.as_str() {
        "ping" => Ok(InboundMessage::Ping),
        "subscribe" => Ok(InboundMessage::Subscribe {
            subscription: subscription(&object, "subscribe")?,
        }),
        "unsubscribe" => Ok(InboundMessage::Unsubscribe {
            subscription: subscription(&object, "unsubscribe")?,
        }),
        "join_session" => Ok(InboundMessage::JoinSession {
            session_id: session_id(&object)?,
        }),
        "query" => Ok(InboundMessage::Query {
            payload: Value::Object(object),
        }),
        "query_all" => Ok(InboundMessage::QueryAll {
            payload: Value::Object(object),
        }),
        "status" => Ok(InboundMessage::Status {
            payload: Value::Object(object),
        }),
        _ => Err(InvalidFrame::UnknownType(message_type)),
    }
}

fn subscription(
    object: &Map<String, Value>,
    message_type: &'static str,
) -> Result<String, InvalidFrame> {
    match object.get("subscription") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(InvalidFrame::InvalidField {
            field: "subscription",
            reason: "must not be empty".into(),
        }),
        Some(_) => Err(InvalidFrame::InvalidField {
            field: "subscription",
            reason: "must be a string".into(),
        }),
        None => Err(InvalidFrame::MissingField {
            message_type,
            field: "subscription",
        }),
    }
}

fn session_id(object: &Map<String, Value>) -> Result<SessionId, InvalidFrame> {
    let raw = match object.get("session_id") {
        Some(Value::String(s)) => s,
        Some(_) => {
            return Err(InvalidFrame::InvalidField {
                field: "session_id",
                reason: "must be a string".into(),
            });
        }
        None => {
            return Err(InvalidFrame::MissingField {
                message_type: "join_session",
                field: "session_id",
            });
        }
    };
    Uuid::parse_str(raw)
        .map(|_| SessionId::from(raw.as_str()))
        .map_err(|e| InvalidFrame::InvalidField {
            field: "session_id",
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn parse(value: &Value) -> ParsedFrame {
        parse_frame(&value.to_string())
    }

    #[test]
    fn ping() {
        let frame = parse(&json!({"type": "ping"}));
        assert_eq!(frame.message.unwrap(), InboundMessage::Ping);
        assert!(frame.correlation_id.is_none());
    }

    #[test]
    fn subscribe_requires_subscription() {
        let frame = parse(&json!({"type": "subscribe", "correlation_id": "c1"}));
        assert_eq!(frame.correlation_id.as_deref(), Some("c1"));
        assert_matches!(
            frame.message,
            Err(InvalidFrame::MissingField { field: "subscription", .. })
        );

        let frame = parse(&json!({"type": "unsubscribe", "subscription": "news"}));
        assert_eq!(
            frame.message.unwrap(),
            InboundMessage::Unsubscribe { subscription: "news".into() }
        );
    }

    #[test]
    fn subscription_must_be_a_non_empty_string() {
        let frame = parse(&json!({"type": "subscribe", "subscription": 7}));
        assert_matches!(frame.message, Err(InvalidFrame::InvalidField { .. }));
        let frame = parse(&json!({"type": "subscribe", "subscription": ""}));
        assert_matches!(frame.message, Err(InvalidFrame::InvalidField { .. }));
    }

    #[test]
    fn join_session_validates_uuid() {
        let id = Uuid::now_v7().to_string();
        let frame = parse(&json!({"type": "join_session", "session_id": id}));
        assert_matches!(
            frame.message,
            Ok(InboundMessage::JoinSession { session_id }) if session_id.as_str() == id
        );

        let frame = parse(&json!({"type": "join_session", "session_id": "not-a-uuid"}));
        assert_matches!(
            frame.message,
            Err(InvalidFrame::InvalidField { field: "session_id", .. })
        );

        let frame = parse(&json!({"type": "join_session"}));
        assert_matches!(frame.message, Err(InvalidFrame::MissingField { .. }));
    }

    #[test]
    fn query_payload_excludes_envelope_fields() {
        let frame = parse(&json!({"type": "query", "correlation_id": 42, "entity": "sessions"}));
        assert_eq!(frame.correlation_id.as_deref(), Some("42"));
        assert_eq!(
            frame.message.unwrap(),
            InboundMessage::Query { payload: json!({"entity": "sessions"}) }
        );
    }

    #[test]
    fn unknown_and_missing_types() {
        assert_matches!(
            parse(&json!({"type": "teleport"})).message,
            Err(InvalidFrame::UnknownType(t)) if t == "teleport"
        );
        assert_matches!(parse(&json!({"kind": "ping"})).message, Err(InvalidFrame::MissingType));
        assert_matches!(parse(&json!({"type": 3})).message, Err(InvalidFrame::MissingType));
    }

    #[test]
    fn malformed_input() {
        assert_matches!(parse_frame("{not json").message, Err(InvalidFrame::Malformed(_)));
        assert_matches!(parse_frame("[1, 2]").message, Err(InvalidFrame::Malformed(_)));
    }

    #[test]
    fn type_names_round_trip_through_parser() {
        for name in ["ping", "query", "query_all", "status"] {
            let msg = parse(&json!({"type": name})).message.unwrap();
            assert_eq!(msg.type_name(), name);
        }
    }
}
