//! JSON envelopes exchanged over an agent session.
//!
//! Every frame is `{ "type": ..., "payload": ... }`. Sessions are ordered
//! and reliable; within one task the agent sends
//! `task_started < task_progress* < task_cracking_completed <= batches_complete`,
//! with `crack_batch` frames interleaved anywhere before `batches_complete`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kh_core::attack::AttackConfig;
use kh_core::types::{AgentStatus, BenchmarkKind, BenchmarkOutcome, CrackEntry, DeviceInfo};

// ---------------------------------------------------------------------------
// Task assignment payload
// ---------------------------------------------------------------------------

/// Full task definition shipped to an agent.
///
/// Exactly one of the keyspace range or the rule range is meaningful,
/// depending on `is_rule_split`. `mask_override` replaces the config's mask
/// for increment-layer tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub hashlist_id: Uuid,
    pub hash_type_id: u32,
    pub attack: AttackConfig,
    pub keyspace_start: u64,
    pub keyspace_end: u64,
    pub is_rule_split: bool,
    #[serde(default)]
    pub rule_start_index: Option<u64>,
    #[serde(default)]
    pub rule_end_index: Option<u64>,
    #[serde(default)]
    pub mask_override: Option<String>,
    /// Known-exact chunk keyspace, when a previous run pinned it.
    #[serde(default)]
    pub chunk_actual_keyspace: Option<u64>,
}

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// Coordinator -> agent frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum ServerMessage {
    TaskAssign(TaskAssignment),
    /// Halt the task immediately; the agent must answer with
    /// `task_stopped` or `task_failed` within the ack timeout.
    JobStop {
        task_id: Uuid,
    },
    BenchmarkRequest {
        request_id: Uuid,
        kind: BenchmarkKind,
        hash_type_id: u32,
        attack: AttackConfig,
    },
    /// Re-send every crack batch for the task that the server has not
    /// acknowledged.
    CrackRetransmitRequest {
        task_id: Uuid,
    },
    Ping,
}

// ---------------------------------------------------------------------------
// AgentMessage
// ---------------------------------------------------------------------------

/// Agent -> coordinator frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat {
        status: AgentStatus,
        #[serde(default)]
        devices: Option<Vec<DeviceInfo>>,
    },
    TaskStarted {
        task_id: Uuid,
        started_at: DateTime<Utc>,
    },
    TaskProgress {
        task_id: Uuid,
        /// Candidates processed so far within this chunk, on the axis
        /// hashcat reports (rules included).
        keyspace_processed: u64,
        #[serde(default)]
        current_speed: Option<u64>,
        /// Hashcat's own progress denominator; the first report carrying
        /// it pins the task's actual chunk keyspace.
        #[serde(default)]
        hashcat_progress_total: Option<u64>,
    },
    CrackBatch {
        task_id: Uuid,
        batch_id: String,
        entries: Vec<CrackEntry>,
    },
    /// Hashcat exhausted the chunk; `expected_crack_count` cracks will have
    /// been sent once all batches arrive.
    TaskCrackingCompleted {
        task_id: Uuid,
        expected_crack_count: u64,
        finished_at: DateTime<Utc>,
    },
    /// The agent asserts every crack batch it intends to send was sent.
    BatchesComplete {
        task_id: Uuid,
    },
    /// Ack of `job_stop`.
    TaskStopped {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
    },
    BenchmarkResult {
        request_id: Uuid,
        outcome: BenchmarkOutcome,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_frames_use_type_payload_envelope() {
        let msg = ServerMessage::JobStop {
            task_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "job_stop");
        assert!(json["payload"]["task_id"].is_string());
    }

    #[test]
    fn agent_progress_round_trips() {
        let msg = AgentMessage::TaskProgress {
            task_id: Uuid::new_v4(),
            keyspace_processed: 123_456,
            current_speed: Some(100_000),
            hashcat_progress_total: None,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: AgentMessage = serde_json::from_str(&json).expect("deserialize");
        match back {
            AgentMessage::TaskProgress {
                keyspace_processed, ..
            } => assert_eq!(keyspace_processed, 123_456),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let raw = r#"{"type":"task_progress","payload":{
            "task_id":"8c4f4746-9fe8-4125-9374-4a3481ee577f",
            "keyspace_processed":10}}"#;
        let msg: AgentMessage = serde_json::from_str(raw).expect("deserialize");
        match msg {
            AgentMessage::TaskProgress {
                current_speed,
                hashcat_progress_total,
                ..
            } => {
                assert!(current_speed.is_none());
                assert!(hashcat_progress_total.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
