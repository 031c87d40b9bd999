//! Gateway frame envelope, opcodes, and outbound payload builders.

use crate::config::GatewayConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Gateway opcodes this client understands.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
    DmUpdate = 13,
    GuildSubscriptionsBulk = 37,
    UpdateTimeSpentSessionId = 39,
    QosHeartbeat = 41,
}

/// The opcode-tagged envelope every gateway frame uses.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn opcode(&self) -> Option<OpCode> {
        serde_json::from_value(Value::from(self.op)).ok()
    }
}

/// Serialize an outbound frame with just an opcode and data.
pub fn outbound(op: OpCode, d: Value) -> String {
    // A two-field struct serializes infallibly.
    serde_json::to_string(&json!({ "op": op as u8, "d": d })).unwrap_or_default()
}

/// Build the IDENTIFY payload for a fresh session.
pub fn identify(config: &GatewayConfig) -> String {
    let mut d = json!({
        "token": config.token,
        "capabilities": 0,
        "properties": config.properties.identify_properties(),
        "compress": false,
        "intents": config.intents,
    });
    if config.shard_count > 1 {
        d["shard"] = json!([config.shard_id, config.shard_count]);
    }
    if let Some(presence) = &config.initial_presence {
        d["presence"] = presence.clone();
    }
    outbound(OpCode::Identify, d)
}

/// Build the RESUME payload for an interrupted session.
pub fn resume(token: &str, session_id: &str, sequence: i64) -> String {
    outbound(
        OpCode::Resume,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }),
    )
}

/// Build a heartbeat carrying the last seen sequence (`null` before the
/// first dispatch).
///
/// The QoS shape wraps the sequence with liveness metadata; it is only
/// used when the config opts in.
pub fn heartbeat(sequence: i64, qos: bool) -> String {
    let seq = if sequence < 0 { Value::Null } else { Value::from(sequence) };
    if qos {
        outbound(
            OpCode::QosHeartbeat,
            json!({
                "seq": seq,
                "qos": { "ver": 1, "active": true, "reasons": [] },
            }),
        )
    } else {
        outbound(OpCode::Heartbeat, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_dispatch() {
        let text = r#"{"op":0,"d":{"content":"hi"},"s":42,"t":"MESSAGE_CREATE"}"#;
        let frame: GatewayFrame = serde_json::from_str(text).expect("valid frame");
        assert_eq!(frame.opcode(), Some(OpCode::Dispatch));
        assert_eq!(frame.s, Some(42));
        assert_eq!(frame.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn unknown_opcode_is_not_an_error() {
        let text = r#"{"op":250,"d":null}"#;
        let frame: GatewayFrame = serde_json::from_str(text).expect("valid frame");
        assert_eq!(frame.opcode(), None);
    }

    #[test]
    fn hello_frame_parses_without_sequence() {
        let text = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let frame: GatewayFrame = serde_json::from_str(text).expect("valid frame");
        assert_eq!(frame.opcode(), Some(OpCode::Hello));
        assert_eq!(frame.s, None);
        let interval = frame.d.unwrap()["heartbeat_interval"].as_u64();
        assert_eq!(interval, Some(41_250));
    }

    #[test]
    fn heartbeat_carries_sequence_or_null() {
        let with_seq: Value = serde_json::from_str(&heartbeat(12, false)).unwrap();
        assert_eq!(with_seq["op"], 1);
        assert_eq!(with_seq["d"], 12);

        let no_seq: Value = serde_json::from_str(&heartbeat(-1, false)).unwrap();
        assert_eq!(no_seq["d"], Value::Null);
    }

    #[test]
    fn qos_heartbeat_wraps_the_sequence() {
        let frame: Value = serde_json::from_str(&heartbeat(7, true)).unwrap();
        assert_eq!(frame["op"], 41);
        assert_eq!(frame["d"]["seq"], 7);
        assert_eq!(frame["d"]["qos"]["ver"], 1);
        assert_eq!(frame["d"]["qos"]["active"], true);
    }

    #[test]
    fn identify_includes_shard_only_when_sharded() {
        let config = GatewayConfig::new("secret").with_intents(513);
        let single: Value = serde_json::from_str(&identify(&config)).unwrap();
        assert_eq!(single["op"], 2);
        assert_eq!(single["d"]["token"], "secret");
        assert_eq!(single["d"]["intents"], 513);
        assert!(single["d"].get("shard").is_none());

        let sharded_config = config.with_shard(2, 4);
        let sharded: Value = serde_json::from_str(&identify(&sharded_config)).unwrap();
        assert_eq!(sharded["d"]["shard"], json!([2, 4]));
    }

    #[test]
    fn resume_carries_session_and_sequence() {
        let frame: Value = serde_json::from_str(&resume("tok", "sess-1", 12)).unwrap();
        assert_eq!(frame["op"], 6);
        assert_eq!(frame["d"]["session_id"], "sess-1");
        assert_eq!(frame["d"]["seq"], 12);
    }
}
