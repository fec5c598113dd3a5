use serde::Deserialize;

use fable_core::errors::GenerateError;
use fable_core::generate::ReplyEvent;

/// State machine for parsing the model-serving endpoint's SSE events.
///
/// The endpoint speaks four event types: `reply_start`, `reply_delta`,
/// `reply_end` and `error`. Delta text is accumulated so a `reply_end`
/// without a full text still yields a complete Done event.
pub struct SseParser {
    accumulated: String,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            accumulated: String::new(),
        }
    }

    /// Parse a single SSE event and return zero or more ReplyEvents.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<ReplyEvent> {
        let mut events = Vec::new();

        match event_type {
            "reply_start" => {
                events.push(ReplyEvent::Start);
            }

            "reply_delta" => {
                if let Ok(delta) = serde_json::from_str::<DeltaEvent>(data) {
                    self.accumulated.push_str(&delta.text);
                    events.push(ReplyEvent::Delta { text: delta.text });
                }
            }

            "reply_end" => {
                let full_text = serde_json::from_str::<EndEvent>(data)
                    .ok()
                    .and_then(|end| end.text)
                    .unwrap_or_else(|| self.accumulated.clone());
                events.push(ReplyEvent::Done { full_text });
            }

            "error" => {
                if let Ok(err) = serde_json::from_str::<ErrorEvent>(data) {
                    let error = classify_error(&err.error.error_type, &err.error.message);
                    events.push(ReplyEvent::Error { error });
                }
            }

            _ => {} // ping, etc.
        }

        events
    }

    /// Text accumulated from deltas so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }
}

fn classify_error(error_type: &str, message: &str) -> GenerateError {
    match error_type {
        "overloaded_error" => GenerateError::Overloaded,
        "quota_exceeded" | "rate_limit_error" => GenerateError::QuotaExceeded,
        "invalid_request_error" => GenerateError::InvalidTurn(message.to_string()),
        _ => GenerateError::Upstream {
            status: 500,
            body: message.to_string(),
        },
    }
}

/// Parse raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event: ") {
            current_event = event.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            current_data = data.to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    // Handle trailing event without blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

// --- Deserialization types for the endpoint's SSE events ---

#[derive(Deserialize)]
struct DeltaEvent {
    text: String,
}

#[derive(Deserialize)]
struct EndEvent {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_reply_stream() {
        let mut parser = SseParser::new();

        let events = parser.parse_event("reply_start", r#"{"persona":"bk_moby_dick"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReplyEvent::Start));

        let events = parser.parse_event("reply_delta", r#"{"text":"Call me"}"#);
        assert_eq!(events.len(), 1);
        if let ReplyEvent::Delta { text } = &events[0] {
            assert_eq!(text, "Call me");
        } else {
            panic!("expected Delta");
        }

        let events = parser.parse_event("reply_delta", r#"{"text":" Ishmael."}"#);
        assert_eq!(events.len(), 1);

        let events = parser.parse_event("reply_end", r#"{"text":"Call me Ishmael."}"#);
        assert_eq!(events.len(), 1);
        if let ReplyEvent::Done { full_text } = &events[0] {
            assert_eq!(full_text, "Call me Ishmael.");
        } else {
            panic!("expected Done");
        }
    }

    #[test]
    fn reply_end_without_text_uses_accumulated() {
        let mut parser = SseParser::new();
        parser.parse_event("reply_start", "{}");
        parser.parse_event("reply_delta", r#"{"text":"It was "}"#);
        parser.parse_event("reply_delta", r#"{"text":"the whale."}"#);
        assert_eq!(parser.accumulated(), "It was the whale.");

        let events = parser.parse_event("reply_end", "{}");
        if let ReplyEvent::Done { full_text } = &events[0] {
            assert_eq!(full_text, "It was the whale.");
        } else {
            panic!("expected Done");
        }
    }

    #[test]
    fn parse_overloaded_error() {
        let mut parser = SseParser::new();
        let events = parser.parse_event(
            "error",
            r#"{"error":{"type":"overloaded_error","message":"server busy"}}"#,
        );
        assert_eq!(events.len(), 1);
        if let ReplyEvent::Error { error } = &events[0] {
            assert!(error.is_retryable());
        } else {
            panic!("expected Error");
        }
    }

    #[test]
    fn parse_quota_error() {
        let mut parser = SseParser::new();
        let events = parser.parse_event(
            "error",
            r#"{"error":{"type":"quota_exceeded","message":"reply quota exhausted"}}"#,
        );
        assert!(matches!(
            &events[0],
            ReplyEvent::Error { error } if error.is_fatal()
        ));
    }

    #[test]
    fn parse_rate_limit_as_quota() {
        let mut parser = SseParser::new();
        let events = parser.parse_event(
            "error",
            r#"{"error":{"type":"rate_limit_error","message":"too many requests"}}"#,
        );
        assert!(matches!(
            &events[0],
            ReplyEvent::Error { error: GenerateError::QuotaExceeded }
        ));
    }

    #[test]
    fn parse_invalid_request_error() {
        let mut parser = SseParser::new();
        let events = parser.parse_event(
            "error",
            r#"{"error":{"type":"invalid_request_error","message":"empty turn"}}"#,
        );
        assert!(matches!(
            &events[0],
            ReplyEvent::Error { error: GenerateError::InvalidTurn(msg) } if msg == "empty turn"
        ));
    }

    #[test]
    fn unknown_error_type_is_upstream() {
        let mut parser = SseParser::new();
        let events = parser.parse_event(
            "error",
            r#"{"error":{"type":"mystery","message":"who knows"}}"#,
        );
        assert!(matches!(
            &events[0],
            ReplyEvent::Error { error } if error.is_retryable()
        ));
    }

    #[test]
    fn unknown_event_type_ignored() {
        let mut parser = SseParser::new();
        let events = parser.parse_event("ping", "{}");
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_delta_ignored() {
        let mut parser = SseParser::new();
        let events = parser.parse_event("reply_delta", "not json");
        assert!(events.is_empty());
        assert_eq!(parser.accumulated(), "");
    }

    #[test]
    fn parse_sse_lines_basic() {
        let raw = "event: reply_start\ndata: {}\n\nevent: reply_end\ndata: {}\n\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "reply_start");
        assert_eq!(events[1].0, "reply_end");
    }

    #[test]
    fn parse_sse_lines_trailing_event() {
        let raw = "event: reply_delta\ndata: {\"text\":\"hi\"}";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "reply_delta");
        assert_eq!(events[0].1, r#"{"text":"hi"}"#);
    }
}
