//! Downstream stream framing (server-sent events).
//!
//! One stream per consumer: named data events plus comment-line heartbeats.
//! The broadcaster hands consumers [`StreamMessage`]s; the transport layer
//! turns them into wire text with [`StreamMessage::to_sse`].

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Games,
    Odds,
    Counts,
    Game,
    Error,
    Ready,
    End,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Games => "games",
            EventName::Odds => "odds",
            EventName::Counts => "counts",
            EventName::Game => "game",
            EventName::Error => "error",
            EventName::Ready => "ready",
            EventName::End => "end",
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamMessage {
    Event { name: EventName, data: Value },
    Ping { ts: String },
}

impl StreamMessage {
    pub fn event(name: EventName, data: Value) -> Self {
        StreamMessage::Event { name, data }
    }

    pub fn ping() -> Self {
        StreamMessage::Ping {
            ts: logger::now_iso(),
        }
    }

    pub fn to_sse(&self) -> String {
        match self {
            StreamMessage::Event { name, data } => {
                format!("event: {}\ndata: {}\n\n", name.as_str(), data)
            }
            StreamMessage::Ping { ts } => format!(": ping {ts}\n\n"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamMessage::Event {
                name: EventName::End | EventName::Error,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_event_wire_format() {
        let msg = StreamMessage::event(EventName::Games, json!({"sport": 1}));
        assert_eq!(msg.to_sse(), "event: games\ndata: {\"sport\":1}\n\n");
    }

    #[test]
    fn ping_is_a_comment_line() {
        let msg = StreamMessage::Ping {
            ts: "2026-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(msg.to_sse(), ": ping 2026-01-01T00:00:00Z\n\n");
    }

    #[test]
    fn terminal_classification() {
        assert!(StreamMessage::event(EventName::End, json!({})).is_terminal());
        assert!(StreamMessage::event(EventName::Error, json!({})).is_terminal());
        assert!(!StreamMessage::event(EventName::Games, json!({})).is_terminal());
        assert!(!StreamMessage::ping().is_terminal());
    }
}
