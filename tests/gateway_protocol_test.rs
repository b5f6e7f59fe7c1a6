//! Golden tests for the wire protocol: frame shapes and the push → event
//! mapping observed by chat clients.

use clawdbot::gateway::{
    decode_frame, encode_frame, map_frame, ChatState, Frame, FrameError, GatewayEvent,
    MAX_FRAME_BYTES, MAX_JSON_DEPTH,
};
use serde_json::{json, Value};

fn decode(value: Value) -> Frame {
    decode_frame(&value.to_string()).expect("frame should decode")
}

// ============== Mapping scenarios ==============

#[test]
fn test_snapshot_health_maps_to_health_event() {
    let frame = decode(json!({
        "type": "push.snapshot",
        "snapshot": { "health": { "ok": false } }
    }));
    assert_eq!(map_frame(&frame), Some(GatewayEvent::Health { ok: false }));

    let frame = decode(json!({
        "type": "push.snapshot",
        "snapshot": { "health": { "ok": true } }
    }));
    assert_eq!(map_frame(&frame), Some(GatewayEvent::Health { ok: true }));
}

#[test]
fn test_health_event_maps_by_payload_ok() {
    let frame = decode(json!({
        "type": "event", "event": "health", "payload": { "ok": false }, "seq": 9
    }));
    assert_eq!(map_frame(&frame), Some(GatewayEvent::Health { ok: false }));
}

#[test]
fn test_tick_and_chat_events_map() {
    let tick = decode(json!({ "type": "event", "event": "tick", "seq": 1 }));
    assert_eq!(map_frame(&tick), Some(GatewayEvent::Tick));

    let chat = decode(json!({
        "type": "event",
        "event": "chat",
        "payload": {
            "runId": "r-9",
            "sessionKey": "agent:main:dm:+15551234",
            "state": "streaming"
        },
        "seq": 2
    }));
    assert_eq!(
        map_frame(&chat),
        Some(GatewayEvent::Chat {
            run_id: "r-9".to_string(),
            session_key: "agent:main:dm:+15551234".to_string(),
            state: ChatState::Streaming,
        })
    );
}

#[test]
fn test_unknown_event_frame_is_dropped() {
    let frame = decode(json!({ "type": "event", "event": "unknown", "seq": 3 }));
    assert_eq!(map_frame(&frame), None);

    let frame = decode(json!({ "type": "event", "event": "wizard.progress", "seq": 4 }));
    assert_eq!(map_frame(&frame), None);
}

#[test]
fn test_seq_gap_maps_with_both_counters() {
    let frame = decode(json!({ "type": "seqGap", "expected": 7, "received": 11 }));
    assert_eq!(
        map_frame(&frame),
        Some(GatewayEvent::SeqGap {
            expected: 7,
            received: 11
        })
    );
}

// ============== Envelope round-trips ==============

#[test]
fn test_rpc_envelopes_round_trip() {
    let req = decode(json!({
        "type": "rpc.req",
        "id": "42",
        "method": "node.invoke",
        "params": {
            "nodeId": "mac-1",
            "command": "canvas.snapshot",
            "idempotencyKey": "k-1"
        }
    }));
    let encoded: Value = serde_json::from_str(&encode_frame(&req).unwrap()).unwrap();
    assert_eq!(encoded["type"], "rpc.req");
    assert_eq!(encoded["method"], "node.invoke");
    assert_eq!(encoded["params"]["idempotencyKey"], "k-1");

    let res = decode(json!({
        "type": "rpc.res",
        "id": "42",
        "ok": false,
        "error": { "code": "UNAVAILABLE", "message": "node not connected" }
    }));
    let encoded: Value = serde_json::from_str(&encode_frame(&res).unwrap()).unwrap();
    assert_eq!(encoded["ok"], false);
    assert_eq!(encoded["error"]["code"], "UNAVAILABLE");
}

#[test]
fn test_unknown_keys_survive_pass_through() {
    let original = json!({
        "type": "event",
        "event": "chat",
        "payload": { "runId": "r", "sessionKey": "s", "state": "final" },
        "seq": 5,
        "experimental": { "traceId": "abc", "hops": [1, 2, 3] }
    });
    let frame = decode(original.clone());
    let encoded: Value = serde_json::from_str(&encode_frame(&frame).unwrap()).unwrap();
    assert_eq!(encoded["experimental"], original["experimental"]);
}

#[test]
fn test_deep_payload_round_trips_identically() {
    let payload = json!({
        "level1": { "level2": { "level3": [ { "mixed": [null, true, 1.5, "s"] } ] } }
    });
    let original = json!({
        "type": "rpc.req", "id": "d", "method": "chat.send", "params": payload
    });
    let frame = decode(original.clone());
    let encoded: Value = serde_json::from_str(&encode_frame(&frame).unwrap()).unwrap();
    assert_eq!(encoded["params"], original["params"]);
}

#[test]
fn test_oversize_frame_closes_with_reason() {
    let text = format!(
        r#"{{"type":"event","event":"chat","seq":1,"payload":"{}"}}"#,
        "x".repeat(MAX_FRAME_BYTES)
    );
    let err = decode_frame(&text).unwrap_err();
    assert!(matches!(err, FrameError::TooLarge { .. }));
    assert!(err.to_string().contains("frame-too-large"));
}

#[test]
fn test_over_nested_frame_rejected() {
    // 32 levels of nesting is the ceiling; one frame-object level plus
    // MAX_JSON_DEPTH arrays in the payload goes over it.
    let open = "[".repeat(MAX_JSON_DEPTH);
    let close = "]".repeat(MAX_JSON_DEPTH);
    let text = format!(
        r#"{{"type":"event","event":"chat","seq":1,"payload":{open}1{close}}}"#
    );
    let err = decode_frame(&text).unwrap_err();
    assert!(matches!(err, FrameError::TooDeep { .. }));
    assert!(err.to_string().contains("nesting depth"));

    // Bracket characters inside string values do not count as nesting.
    let text = r#"{"type":"event","event":"chat","seq":1,"payload":"[[[[[[[["}"#;
    assert!(decode_frame(text).is_ok());
}

#[test]
fn test_hello_frame_carries_credentials_and_commands() {
    let frame = decode(json!({
        "type": "hello",
        "role": "node",
        "clientName": "mac-node",
        "clientVersion": "1.2.3",
        "platform": "mac",
        "mode": "node",
        "instanceId": "mac-1",
        "scopes": [],
        "commands": ["system.run", "canvas.snapshot"],
        "token": "secret"
    }));
    let Frame::Hello(hello) = frame else {
        panic!("expected hello");
    };
    assert_eq!(hello.role, "node");
    assert_eq!(hello.instance_id.as_deref(), Some("mac-1"));
    assert_eq!(
        hello.commands.as_deref(),
        Some(&["system.run".to_string(), "canvas.snapshot".to_string()][..])
    );
    assert_eq!(hello.token.as_deref(), Some("secret"));
}
