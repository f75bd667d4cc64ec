//! WebSocket command serialization, server-message parsing, and
//! sequence-number bookkeeping.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Action for an `update_subscription` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    AddMarkets,
    RemoveMarkets,
}

impl UpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateAction::AddMarkets => "add_markets",
            UpdateAction::RemoveMarkets => "remove_markets",
        }
    }
}

/// Build a subscribe command message.
pub fn build_subscribe(id: u64, channels: &[String], market_tickers: Option<&[String]>) -> String {
    let mut params = serde_json::json!({ "channels": channels });
    if let Some(tickers) = market_tickers {
        params["market_tickers"] = serde_json::json!(tickers);
    }
    serde_json::json!({
        "id": id,
        "cmd": "subscribe",
        "params": params
    })
    .to_string()
}

/// Build an `update_subscription` command adding or removing markets.
pub fn build_update_subscription(
    id: u64,
    sid: u64,
    market_tickers: &[String],
    action: UpdateAction,
) -> String {
    serde_json::json!({
        "id": id,
        "cmd": "update_subscription",
        "params": {
            "sids": [sid],
            "market_tickers": market_tickers,
            "action": action.as_str(),
        }
    })
    .to_string()
}

/// Build an unsubscribe command message.
pub fn build_unsubscribe(id: u64, sids: &[u64]) -> String {
    serde_json::json!({
        "id": id,
        "cmd": "unsubscribe",
        "params": { "sids": sids }
    })
    .to_string()
}

/// Parsed server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A typed channel update: `{type, sid?, seq?, msg}`.
    Update {
        msg_type: String,
        sid: Option<i64>,
        seq: Option<i64>,
        msg: JsonValue,
    },
    /// A command response carrying an `id` but no `type`.
    CommandResponse { id: u64, msg: JsonValue },
    /// An error frame.
    Error { id: Option<u64>, code: String, message: String },
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<u64>,
    #[serde(rename = "type")]
    msg_type: Option<String>,
    sid: Option<i64>,
    seq: Option<i64>,
    msg: Option<JsonValue>,
    code: Option<String>,
    message: Option<String>,
    error: Option<ErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    code: Option<String>,
    message: Option<String>,
}

/// Parse an incoming WebSocket text frame.
pub fn parse_incoming(text: &str) -> Result<ServerMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(text)?;

    if let Some(error) = raw.error {
        return Ok(ServerMessage::Error {
            id: raw.id,
            code: error.code.unwrap_or_default(),
            message: error.message.unwrap_or_default(),
        });
    }

    if raw.code.is_some() && raw.msg_type.as_deref() != Some("error") {
        return Ok(ServerMessage::Error {
            id: raw.id,
            code: raw.code.unwrap_or_default(),
            message: raw.message.unwrap_or_default(),
        });
    }

    if let Some(msg_type) = raw.msg_type {
        return Ok(ServerMessage::Update {
            msg_type,
            sid: raw.sid,
            seq: raw.seq,
            msg: raw.msg.unwrap_or(JsonValue::Null),
        });
    }

    Ok(ServerMessage::CommandResponse {
        id: raw.id.unwrap_or(0),
        msg: raw.msg.unwrap_or(JsonValue::Null),
    })
}

/// A detected gap in a subscription's sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub sid: i64,
    pub expected: i64,
    pub received: i64,
}

/// Tracks the last seen sequence number per server subscription id.
///
/// Gaps are reported but never trigger a replay request; the next snapshot
/// re-synchronises orderbook state.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: HashMap<i64, i64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed `(sid, seq)` pair, returning the gap if one opened.
    ///
    /// `last_seen` always advances to the received value, gap or not.
    pub fn observe(&mut self, sid: i64, seq: i64) -> Option<SequenceGap> {
        let gap = match self.last_seen.get(&sid) {
            Some(&last) if seq > last + 1 => Some(SequenceGap {
                sid,
                expected: last + 1,
                received: seq,
            }),
            _ => None,
        };
        self.last_seen.insert(sid, seq);
        gap
    }

    /// Drop bookkeeping for a subscription.
    pub fn forget(&mut self, sid: i64) {
        self.last_seen.remove(&sid);
    }

    pub fn last_seen(&self, sid: i64) -> Option<i64> {
        self.last_seen.get(&sid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_subscribe_with_tickers() {
        let msg = build_subscribe(
            1,
            &["orderbook_delta".to_string()],
            Some(&["M1".to_string(), "M2".to_string()]),
        );
        let parsed: JsonValue = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["cmd"], "subscribe");
        assert_eq!(parsed["params"]["channels"], serde_json::json!(["orderbook_delta"]));
        assert_eq!(parsed["params"]["market_tickers"], serde_json::json!(["M1", "M2"]));
    }

    #[test]
    fn test_build_subscribe_broadcast() {
        let msg = build_subscribe(2, &["ticker_v2".to_string()], None);
        let parsed: JsonValue = serde_json::from_str(&msg).unwrap();
        assert!(parsed["params"].get("market_tickers").is_none());
    }

    #[test]
    fn test_build_update_subscription() {
        let msg = build_update_subscription(3, 7, &["M1".to_string()], UpdateAction::AddMarkets);
        let parsed: JsonValue = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["cmd"], "update_subscription");
        assert_eq!(parsed["params"]["sids"], serde_json::json!([7]));
        assert_eq!(parsed["params"]["action"], "add_markets");

        let msg = build_update_subscription(4, 7, &["M1".to_string()], UpdateAction::RemoveMarkets);
        let parsed: JsonValue = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["params"]["action"], "remove_markets");
    }

    #[test]
    fn test_build_unsubscribe() {
        let msg = build_unsubscribe(5, &[100, 200]);
        let parsed: JsonValue = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["cmd"], "unsubscribe");
        assert_eq!(parsed["params"]["sids"], serde_json::json!([100, 200]));
    }

    #[test]
    fn test_parse_update() {
        let json = r#"{"type": "trade", "sid": 42, "seq": 7, "msg": {"count": 5}}"#;
        match parse_incoming(json).unwrap() {
            ServerMessage::Update { msg_type, sid, seq, msg } => {
                assert_eq!(msg_type, "trade");
                assert_eq!(sid, Some(42));
                assert_eq!(seq, Some(7));
                assert_eq!(msg["count"], 5);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_command_response() {
        let json = r#"{"id": 9, "msg": {"sid": 3}}"#;
        match parse_incoming(json).unwrap() {
            ServerMessage::CommandResponse { id, msg } => {
                assert_eq!(id, 9);
                assert_eq!(msg["sid"], 3);
            }
            other => panic!("expected CommandResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_frames() {
        let json = r#"{"id": 1, "error": {"code": "invalid_params", "message": "bad ticker"}}"#;
        match parse_incoming(json).unwrap() {
            ServerMessage::Error { id, code, message } => {
                assert_eq!(id, Some(1));
                assert_eq!(code, "invalid_params");
                assert_eq!(message, "bad ticker");
            }
            other => panic!("expected Error, got {other:?}"),
        }

        let json = r#"{"code": "auth_failed", "message": "denied"}"#;
        assert!(matches!(
            parse_incoming(json).unwrap(),
            ServerMessage::Error { id: None, .. }
        ));
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_incoming("not json").is_err());
    }

    #[test]
    fn test_sequence_gap_detection() {
        let mut tracker = SequenceTracker::new();

        // First observation never gaps.
        assert_eq!(tracker.observe(7, 5), None);

        // 5 -> 9 gaps with expected=6, received=9.
        let gap = tracker.observe(7, 9).expect("gap expected");
        assert_eq!(gap.expected, 6);
        assert_eq!(gap.received, 9);

        // last_seen advanced to 9 despite the gap.
        assert_eq!(tracker.last_seen(7), Some(9));

        // Consecutive sequence: no gap.
        assert_eq!(tracker.observe(7, 10), None);
    }

    #[test]
    fn test_sequence_tracker_is_per_sid() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(1, 5);
        assert_eq!(tracker.observe(2, 100), None);
        assert_eq!(tracker.observe(1, 6), None);
        tracker.forget(1);
        assert_eq!(tracker.observe(1, 50), None);
    }
}
