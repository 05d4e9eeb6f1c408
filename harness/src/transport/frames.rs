//! Gateway WebSocket frames and how agent events render as turn text.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PROTOCOL_VERSION: u32 = 1;
pub const METHOD_CHAT_SEND: &str = "chat.send";
pub const METHOD_TURN_RESUME: &str = "turn.resume";
/// `res.payload.status` of a turn paused on an approval or input request.
pub const STATUS_YIELDED: &str = "yielded";

/// Client to gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Hello {
        role: &'static str,
        device_id: String,
        caps: Capabilities,
    },
    Req {
        id: String,
        method: &'static str,
        params: Value,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub tools: Vec<String>,
    pub protocol_version: u32,
}

impl Outbound {
    pub fn hello() -> Self {
        Outbound::Hello {
            role: "operator",
            device_id: uuid::Uuid::new_v4().to_string(),
            caps: Capabilities {
                tools: Vec::new(),
                protocol_version: PROTOCOL_VERSION,
            },
        }
    }

    pub fn chat(message: &str) -> Self {
        Outbound::Req {
            id: uuid::Uuid::new_v4().to_string(),
            method: METHOD_CHAT_SEND,
            params: json!({ "message": message }),
        }
    }

    pub fn resume(params: Value) -> Self {
        Outbound::Req {
            id: uuid::Uuid::new_v4().to_string(),
            method: METHOD_TURN_RESUME,
            params,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Outbound::Req { id, .. } => Some(id),
            Outbound::Hello { .. } => None,
        }
    }
}

/// Gateway to client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Welcome {
        session_id: String,
        #[serde(default)]
        policy: Value,
    },
    Challenge {
        #[serde(default)]
        nonce: String,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    Res {
        id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl Inbound {
    /// True for a `res` that pauses the turn instead of ending it.
    pub fn is_yield(&self) -> bool {
        matches!(
            self,
            Inbound::Res { payload: Some(payload), .. }
                if payload.get("status").and_then(Value::as_str) == Some(STATUS_YIELDED)
        )
    }
}

/// What handling one agent event produced.
#[derive(Debug, Default, PartialEq)]
pub struct EventEffect {
    /// Text to append to the turn's response.
    pub text: Option<String>,
    /// `turn.resume` params to send back.
    pub resume: Option<Value>,
    pub tool_call: bool,
    /// `(input, output)` token counts reported by `agent.done`.
    pub tokens: Option<(u64, u64)>,
}

fn str_field<'a>(data: &'a Value, key: &str, fallback: &'a str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or(fallback)
}

/// Interpret one `event` frame the way an auto-approving operator client does.
pub fn interpret_event(event: &str, data: &Value) -> EventEffect {
    match event {
        "agent.thinking" => EventEffect {
            text: Some(str_field(data, "content", ""))
                .filter(|content| !content.is_empty())
                .map(|content| format!("{content}\n")),
            ..EventEffect::default()
        },
        "agent.tool_call" => EventEffect {
            text: Some(format!(
                "⏺ {}({})\n",
                str_field(data, "name", "?"),
                format_args_brief(data.get("args").unwrap_or(&Value::Null))
            )),
            tool_call: true,
            ..EventEffect::default()
        },
        "agent.tool_result" => {
            let ok = data.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let symbol = if ok { "✓" } else { "✗" };
            EventEffect {
                text: Some(format!("  ⎿ {symbol} {}\n", str_field(data, "name", "?"))),
                ..EventEffect::default()
            }
        }
        "agent.message" => EventEffect {
            text: data
                .get("text")
                .and_then(Value::as_str)
                .map(|text| format!("{text}\n")),
            ..EventEffect::default()
        },
        "agent.done" => {
            let count = |key: &str| data.get(key).and_then(Value::as_u64).unwrap_or(0);
            EventEffect {
                tokens: Some((count("input_tokens"), count("output_tokens"))),
                ..EventEffect::default()
            }
        }
        "agent.error" => EventEffect {
            text: Some(format!(
                "Error [{}]: {}\n",
                str_field(data, "code", "error"),
                str_field(data, "message", "Unknown error")
            )),
            ..EventEffect::default()
        },
        "agent.awaiting_approval" => EventEffect {
            text: Some(format!(
                "⚠ Auto-approved: {}({})\n",
                str_field(data, "tool_name", "?"),
                format_args_brief(data.get("tool_args").unwrap_or(&Value::Null))
            )),
            resume: Some(json!({
                "turn_id": str_field(data, "turn_id", ""),
                "tool_call_id": str_field(data, "tool_call_id", ""),
                "response_type": "approval",
                "approved": true,
            })),
            ..EventEffect::default()
        },
        "agent.awaiting_input" => EventEffect {
            resume: Some(json!({
                "turn_id": str_field(data, "turn_id", ""),
                "tool_call_id": str_field(data, "tool_call_id", ""),
                "response_type": "answers",
                "answers": {},
            })),
            ..EventEffect::default()
        },
        _ => EventEffect::default(),
    }
}

/// Turn summary line, same shape as the agent's own `[Duration: ...]` footer.
pub fn summary_line(elapsed_secs: f64, tokens: u64, tool_uses: u64) -> String {
    let tokens = if tokens >= 1000 {
        format!("{:.1}k", tokens as f64 / 1000.0)
    } else {
        tokens.to_string()
    };
    format!("[Duration: {elapsed_secs:.1}s | Tokens: {tokens} | Tools: {tool_uses}]\n")
}

const BRIEF_VALUE_CHARS: usize = 30;
const BRIEF_KEEP_CHARS: usize = 27;

/// First two arguments as `key: "value"`, long strings shortened.
pub fn format_args_brief(args: &Value) -> String {
    match args {
        Value::Object(map) => map
            .iter()
            .take(2)
            .map(|(key, value)| match value {
                Value::String(s) if s.chars().count() > BRIEF_VALUE_CHARS => {
                    let kept: String = s.chars().take(BRIEF_KEEP_CHARS).collect();
                    format!("{key}: \"{kept}...\"")
                }
                Value::String(s) => format!("{key}: \"{s}\""),
                other => format!("{key}: {other}"),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_matches_gateway_handshake() {
        let value = serde_json::to_value(Outbound::hello()).expect("serialize");
        assert_eq!(value["type"], "hello");
        assert_eq!(value["role"], "operator");
        assert_eq!(value["caps"]["protocol_version"], 1);
        assert!(value["caps"]["tools"].as_array().expect("tools").is_empty());
        assert!(value["device_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn chat_request_envelope() {
        let frame = Outbound::chat("hi");
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "chat.send");
        assert_eq!(value["params"]["message"], "hi");
        assert_eq!(value["id"].as_str(), frame.id());
    }

    #[test]
    fn parses_inbound_frames() {
        let welcome: Inbound =
            serde_json::from_str(r#"{"type":"welcome","session_id":"s1","policy":{"mode":"default","max_turns":12}}"#)
                .expect("welcome");
        assert!(matches!(welcome, Inbound::Welcome { session_id, .. } if session_id == "s1"));

        let yielded: Inbound =
            serde_json::from_str(r#"{"type":"res","id":"r1","ok":true,"payload":{"status":"yielded"}}"#)
                .expect("res");
        assert!(yielded.is_yield());

        let done: Inbound =
            serde_json::from_str(r#"{"type":"res","id":"r1","ok":true,"payload":{"status":"completed"}}"#)
                .expect("res");
        assert!(!done.is_yield());

        let other: Inbound = serde_json::from_str(r#"{"type":"pong"}"#).expect("unknown");
        assert!(matches!(other, Inbound::Unknown));
    }

    #[test]
    fn tool_events_render_like_the_operator_client() {
        let call = interpret_event(
            "agent.tool_call",
            &json!({"name": "Write", "args": {"file_path": "fixtures/scratch/test.txt", "content": "validation test passed"}}),
        );
        assert!(call.tool_call);
        assert_eq!(
            call.text.as_deref(),
            Some("⏺ Write(content: \"validation test passed\", file_path: \"fixtures/scratch/test.txt\")\n")
        );

        let result = interpret_event("agent.tool_result", &json!({"name": "Write", "ok": true}));
        assert_eq!(result.text.as_deref(), Some("  ⎿ ✓ Write\n"));

        let error = interpret_event("agent.error", &json!({"code": "max_turns", "message": "limit"}));
        assert_eq!(error.text.as_deref(), Some("Error [max_turns]: limit\n"));
    }

    #[test]
    fn approval_is_answered_with_resume() {
        let effect = interpret_event(
            "agent.awaiting_approval",
            &json!({"turn_id": "t1", "tool_call_id": "c1", "tool_name": "Bash", "tool_args": {"command": "ls"}}),
        );
        let resume = effect.resume.expect("resume");
        assert_eq!(resume["approved"], true);
        assert_eq!(resume["response_type"], "approval");
        assert_eq!(resume["turn_id"], "t1");
        assert_eq!(resume["tool_call_id"], "c1");
    }

    #[test]
    fn brief_args_truncate_on_char_boundaries() {
        let long = "é".repeat(40);
        let brief = format_args_brief(&json!({ "text": long }));
        assert_eq!(brief, format!("text: \"{}...\"", "é".repeat(27)));
        assert_eq!(format_args_brief(&json!({"n": 3})), "n: 3");
    }

    #[test]
    fn summary_line_formats_tokens() {
        assert_eq!(summary_line(1.24, 999, 2), "[Duration: 1.2s | Tokens: 999 | Tools: 2]\n");
        assert_eq!(summary_line(0.0, 1500, 0), "[Duration: 0.0s | Tokens: 1.5k | Tools: 0]\n");
    }
}
