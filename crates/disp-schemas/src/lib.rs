//! Shared wire and row types for the dispensing dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue lifecycle status. `InProgress` and the two terminal states are
/// mutually exclusive; see the invariants on `Queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Success => "success",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "in_progress" => Some(QueueStatus::InProgress),
            "success" => Some(QueueStatus::Success),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Success | QueueStatus::Failed)
    }
}

/// One dispensing job for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: i64,
    pub patient_id: i64,
    pub target_room: i64,
    pub status: QueueStatus,
    pub queue_number: i64,
    pub created_at: DateTime<Utc>,
    pub served_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: i64,
    pub pill_id: i64,
    pub quantity: i64,
}

/// A fully loaded queue row plus its items, as returned by `NextPending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueWithItems {
    pub queue: Queue,
    pub items: Vec<QueueItem>,
}

/// Event kinds appended to the audit log. Kept as plain string constants
/// rather than a closed enum: the Joiner has to be able to fold in node
/// status strings it has never seen before (see the status taxonomy
/// decision) without the event kind set growing alongside it.
pub mod event_kind {
    pub const CREATED: &str = "created";
    pub const ACK_ACCEPTED: &str = "ack_accepted";
    pub const ACK_REJECTED: &str = "ack_rejected";
    pub const EVT_DONE_NODE1: &str = "evt_done_node1";
    pub const EVT_DONE_NODE2: &str = "evt_done_node2";
    pub const NODE_STATE: &str = "node_state";
    pub const NODE_VERIFICATION_PASS: &str = "node_verification_pass";
    pub const NODE_VERIFICATION_FAILED: &str = "node_verification_failed";
    pub const QUEUE_FAILED: &str = "queue_failed";
    pub const VISION_CHECK: &str = "vision_check";
    pub const ACK_UNKNOWN: &str = "ack_unknown";
    pub const ACK_PARSE_ERROR: &str = "ack_parse_error";

    pub fn evt_done_node(node_id: i64) -> String {
        format!("evt_done_node{node_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub queue_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub event_kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: i64,
    pub online: bool,
    pub ready: bool,
    pub uptime: Option<i64>,
    pub last_seen: DateTime<Utc>,
    pub last_ready_change: DateTime<Utc>,
    pub last_online_change: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PillType {
    Solid,
    Liquid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pill {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PillType,
    pub amount: i64,
}

/// A single pill item requested at queue-creation time, pre-normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub pill_id: i64,
    pub quantity: i64,
}

// ---- Broker payload schemas (disp/cmd/*, disp/ack/*, disp/evt/*, disp/state/*, disp/vision/*) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdNode1Item {
    pub pill_id: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdNode1Payload {
    pub queue_id: i64,
    pub patient_id: i64,
    pub target_room: i64,
    pub items: Vec<CmdNode1Item>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdNode2Payload {
    pub queue_id: i64,
    pub patient_id: i64,
    pub target_room: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckPayload {
    pub queue_id: Option<i64>,
    pub accepted: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvtDonePayload {
    pub queue_id: Option<i64>,
    pub done: i64,
    pub status: Option<String>,
    pub detected: Option<i64>,
    pub room: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatePayload {
    pub online: Option<i64>,
    pub ready: Option<i64>,
    pub uptime: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionPayload {
    pub count_detected: i64,
    pub queue_id: Option<i64>,
}
