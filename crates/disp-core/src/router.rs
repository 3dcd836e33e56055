//! Classifies broker payloads. The router never touches the store; it only
//! turns `(topic, raw payload bytes)` into a typed [`ClassifiedMessage`] (or a
//! [`RouteError`]) so the daemon's inbound handlers don't re-derive the
//! classification rules at every call site.

use serde_json::Value;

/// A payload that parsed as JSON but could not be classified into any of the
/// four known shapes falls through to `Unknown`; it is not an error by
/// itself (the router still recorded it), it is just uninteresting.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedMessage {
    Ack {
        node_id: Option<i64>,
        queue_id: Option<i64>,
        accepted: bool,
    },
    Completion {
        node_id: Option<i64>,
        queue_id: Option<i64>,
        raw_payload: String,
        status: Option<String>,
        detected: Option<i64>,
    },
    NodeState {
        node_id: Option<i64>,
        online: Option<bool>,
        ready: Option<bool>,
        uptime: Option<i64>,
    },
    Vision {
        queue_id: Option<i64>,
        count_detected: i64,
    },
    Unknown,
}

/// The only failure mode the router itself can produce: the payload was not
/// a well-formed JSON object. Topic-suffix parsing never fails — an
/// unparseable suffix just yields `node_id = None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    MalformedPayload,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::MalformedPayload => write!(f, "payload is not a JSON object"),
        }
    }
}

impl std::error::Error for RouteError {}

/// The last `/`-separated topic segment, parsed as a decimal node id.
/// Messages with no valid suffix (e.g. `disp/vision/room7`) still classify
/// fine; they just carry `node_id = None` and can only satisfy state events
/// that identify their own node some other way (none do here, so in
/// practice a vision message never needs a node id).
pub fn node_id_from_topic(topic: &str) -> Option<i64> {
    topic.rsplit('/').next()?.parse::<i64>().ok()
}

/// Classifies one inbound message. Checked in the order mandated by the
/// spec: `accepted` beats `done` beats `ready`/`online` beats
/// `count_detected`; first match wins.
pub fn classify(topic: &str, payload: &[u8]) -> Result<ClassifiedMessage, RouteError> {
    let node_id = node_id_from_topic(topic);
    let value: Value = serde_json::from_slice(payload).map_err(|_| RouteError::MalformedPayload)?;
    let Some(obj) = value.as_object() else {
        return Err(RouteError::MalformedPayload);
    };

    if obj.contains_key("accepted") {
        let accepted = obj.get("accepted").and_then(Value::as_i64).unwrap_or(0) != 0;
        let queue_id = obj.get("queue_id").and_then(Value::as_i64);
        return Ok(ClassifiedMessage::Ack {
            node_id,
            queue_id,
            accepted,
        });
    }

    if obj.get("done").and_then(Value::as_i64) == Some(1) {
        let queue_id = obj.get("queue_id").and_then(Value::as_i64);
        let status = obj.get("status").and_then(Value::as_str).map(str::to_string);
        let detected = obj.get("detected").and_then(Value::as_i64);
        let raw_payload = String::from_utf8_lossy(payload).into_owned();
        return Ok(ClassifiedMessage::Completion {
            node_id,
            queue_id,
            raw_payload,
            status,
            detected,
        });
    }

    if obj.contains_key("ready") || obj.contains_key("online") {
        let online = obj.get("online").and_then(Value::as_i64).map(|n| n != 0);
        let ready = obj.get("ready").and_then(Value::as_i64).map(|n| n != 0);
        let uptime = obj.get("uptime").and_then(Value::as_i64);
        return Ok(ClassifiedMessage::NodeState {
            node_id,
            online,
            ready,
            uptime,
        });
    }

    if let Some(count_detected) = obj.get("count_detected").and_then(Value::as_i64) {
        let queue_id = obj.get("queue_id").and_then(Value::as_i64);
        return Ok(ClassifiedMessage::Vision {
            queue_id,
            count_detected,
        });
    }

    Ok(ClassifiedMessage::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_suffix_parses_decimal_node_id() {
        assert_eq!(node_id_from_topic("disp/ack/1"), Some(1));
        assert_eq!(node_id_from_topic("disp/evt/2"), Some(2));
        assert_eq!(node_id_from_topic("disp/vision/room7"), None);
    }

    #[test]
    fn accepted_key_wins_even_if_done_also_present() {
        let msg = classify("disp/ack/1", br#"{"queue_id":5,"accepted":1,"done":1}"#).unwrap();
        assert_eq!(
            msg,
            ClassifiedMessage::Ack {
                node_id: Some(1),
                queue_id: Some(5),
                accepted: true
            }
        );
    }

    #[test]
    fn done_equal_one_classifies_as_completion() {
        let msg = classify(
            "disp/evt/2",
            br#"{"queue_id":9,"done":1,"status":"success","detected":3}"#,
        )
        .unwrap();
        match msg {
            ClassifiedMessage::Completion {
                node_id,
                queue_id,
                status,
                detected,
                ..
            } => {
                assert_eq!(node_id, Some(2));
                assert_eq!(queue_id, Some(9));
                assert_eq!(status.as_deref(), Some("success"));
                assert_eq!(detected, Some(3));
            }
            other => panic!("expected Completion, got {other:?}"),
        }
    }

    #[test]
    fn done_zero_is_not_a_completion() {
        let msg = classify("disp/evt/1", br#"{"queue_id":1,"done":0}"#).unwrap();
        assert_eq!(msg, ClassifiedMessage::Unknown);
    }

    #[test]
    fn ready_or_online_key_classifies_as_node_state() {
        let msg = classify("disp/state/1", br#"{"online":1,"ready":0,"uptime":42}"#).unwrap();
        assert_eq!(
            msg,
            ClassifiedMessage::NodeState {
                node_id: Some(1),
                online: Some(true),
                ready: Some(false),
                uptime: Some(42)
            }
        );
    }

    #[test]
    fn count_detected_alone_is_a_standalone_vision_report() {
        let msg = classify("disp/vision/cam1", br#"{"count_detected":4,"queue_id":7}"#).unwrap();
        assert_eq!(
            msg,
            ClassifiedMessage::Vision {
                queue_id: Some(7),
                count_detected: 4
            }
        );
    }

    #[test]
    fn unrecognized_shape_is_unknown() {
        let msg = classify("disp/whatever/1", br#"{"foo":"bar"}"#).unwrap();
        assert_eq!(msg, ClassifiedMessage::Unknown);
    }

    #[test]
    fn non_json_payload_is_a_route_error() {
        let err = classify("disp/ack/1", b"not json").unwrap_err();
        assert_eq!(err, RouteError::MalformedPayload);
    }

    #[test]
    fn json_array_is_a_route_error_because_it_is_not_an_object() {
        let err = classify("disp/ack/1", b"[1,2,3]").unwrap_err();
        assert_eq!(err, RouteError::MalformedPayload);
    }
}
