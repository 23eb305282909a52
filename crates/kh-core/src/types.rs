use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attack::AttackConfig;
pub use crate::attack::AttackMode;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no task dispatched yet.
    Pending,
    /// At least one task dispatched.
    Running,
    /// Hashcat work is done everywhere; crack persistence still outstanding.
    Processing,
    Completed,
    /// Operator-directed halt; state preserved for resume.
    Paused,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Paused)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Processing)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Paused)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
                | (JobStatus::Paused, JobStatus::Pending)
                | (JobStatus::Paused, JobStatus::Cancelled)
                | (JobStatus::Failed, JobStatus::Pending)
                | (JobStatus::Cancelled, JobStatus::Pending)
        )
    }

    /// Terminal states never leave except through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States in which the scheduler considers the job for work.
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// States from which `stop_job` is accepted.
    pub fn is_stoppable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::Processing | JobStatus::Paused
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Paused => "paused",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no agent.
    Pending,
    /// Agent acknowledged receipt; not yet started.
    Assigned,
    /// `task_started` received.
    Running,
    /// Hashcat finished on the agent; awaiting crack batches.
    Processing,
    Completed,
    /// Agent lost its heartbeat within grace; may recover or be re-issued.
    ReconnectPending,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Assigned)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Assigned, TaskStatus::Running)
                | (TaskStatus::Assigned, TaskStatus::ReconnectPending)
                | (TaskStatus::Assigned, TaskStatus::Failed)
                | (TaskStatus::Assigned, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Processing)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::ReconnectPending)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
                | (TaskStatus::ReconnectPending, TaskStatus::Running)
                | (TaskStatus::ReconnectPending, TaskStatus::Pending)
                | (TaskStatus::ReconnectPending, TaskStatus::Failed)
                | (TaskStatus::ReconnectPending, TaskStatus::Cancelled)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// States in which the task occupies an agent.
    pub fn holds_agent(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned
                | TaskStatus::Running
                | TaskStatus::ReconnectPending
                | TaskStatus::Processing
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::ReconnectPending => "reconnect_pending",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// OverflowMode
// ---------------------------------------------------------------------------

/// How free agents beyond the summed `max_agents` of same-priority jobs are
/// distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// All overflow goes to the oldest job.
    #[default]
    Fifo,
    /// Overflow cycles across jobs.
    RoundRobin,
}

impl OverflowMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fifo" => Some(OverflowMode::Fifo),
            "round_robin" => Some(OverflowMode::RoundRobin),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// LayerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A queued execution of an attack configuration against one hashlist.
///
/// The scheduler is the sole mutator of `status`, the keyspace counters, and
/// the completion timestamps; the crack-ingest path touches only the crack
/// counters on the job's tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub hashlist_id: Uuid,
    /// Higher runs first; bounded by the `max_job_priority` setting.
    pub priority: u32,
    /// 0 = unlimited.
    pub max_agents: u32,
    /// Target seconds of work per generated task (5..86400).
    pub chunk_size_seconds: u32,
    pub attack: AttackConfig,
    pub uses_rule_splitting: bool,
    /// Rule amplification factor; 1 when no rules apply.
    pub multiplication_factor: u64,
    pub base_keyspace: Option<u64>,
    pub effective_keyspace: Option<u64>,
    pub total_keyspace: Option<u64>,
    pub processed_keyspace: u64,
    pub dispatched_keyspace: u64,
    /// True once a forced benchmark supplied authoritative keyspace values.
    pub is_accurate_keyspace: bool,
    pub overall_progress_percent: f64,
    pub status: JobStatus,
    pub error_message: Option<String>,
    /// Preset this job was materialized from, when any.
    pub preset_id: Option<Uuid>,
    /// Whether a higher-priority job may preempt this one while running.
    pub allow_high_priority_override: bool,
    /// Set when a higher-priority job preempted this one.
    pub interrupted_by: Option<Uuid>,
    /// Opaque principal reference of the creator.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub cracking_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        hashlist_id: Uuid,
        attack: AttackConfig,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            hashlist_id,
            priority: 0,
            max_agents: 0,
            chunk_size_seconds: 1200,
            attack,
            uses_rule_splitting: false,
            multiplication_factor: 1,
            base_keyspace: None,
            effective_keyspace: None,
            total_keyspace: None,
            processed_keyspace: 0,
            dispatched_keyspace: 0,
            is_accurate_keyspace: false,
            overall_progress_percent: 0.0,
            status: JobStatus::Pending,
            error_message: None,
            preset_id: None,
            allow_high_priority_override: false,
            interrupted_by: None,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            started_at: None,
            cracking_completed_at: None,
            completed_at: None,
        }
    }

    pub fn attack_mode(&self) -> AttackMode {
        self.attack.mode()
    }

    /// The denominator used for progress math: effective keyspace when
    /// known and non-zero, otherwise total keyspace.
    pub fn progress_denominator(&self) -> Option<u64> {
        match self.effective_keyspace {
            Some(eff) if eff > 0 => Some(eff),
            _ => self.total_keyspace.filter(|t| *t > 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A contiguous slice of one job's work, executed by at most one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Non-null iff status holds an agent (invariant 6).
    pub agent_id: Option<Uuid>,
    pub status: TaskStatus,
    pub keyspace_start: u64,
    pub keyspace_end: u64,
    pub keyspace_processed: u64,
    /// Rule-split bookkeeping on the effective axis.
    pub effective_keyspace_start: Option<u64>,
    pub effective_keyspace_end: Option<u64>,
    pub effective_keyspace_processed: Option<u64>,
    pub rule_start_index: Option<u64>,
    pub rule_end_index: Option<u64>,
    pub is_rule_split_task: bool,
    /// Pinned by the first progress report that carries hashcat's own
    /// progress total; immutable afterwards.
    pub chunk_actual_keyspace: Option<u64>,
    pub benchmark_speed: Option<u64>,
    pub average_speed: Option<u64>,
    pub progress_percent: f64,
    /// Cracks persisted to the hash store and credited to this task.
    pub crack_count: u64,
    /// Total the agent said it will deliver.
    pub expected_crack_count: u64,
    /// Accepted over the wire, duplicates included.
    pub received_crack_count: u64,
    pub batches_complete_signaled: bool,
    pub retry_count: u32,
    pub consecutive_failures: u32,
    pub retransmit_count: u32,
    pub last_retransmit_at: Option<DateTime<Utc>>,
    pub increment_layer_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub cracking_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh keyspace-split task covering `[start, end)`.
    pub fn new_keyspace_chunk(job_id: Uuid, start: u64, end: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            agent_id: None,
            status: TaskStatus::Pending,
            keyspace_start: start,
            keyspace_end: end,
            keyspace_processed: 0,
            effective_keyspace_start: None,
            effective_keyspace_end: None,
            effective_keyspace_processed: None,
            rule_start_index: None,
            rule_end_index: None,
            is_rule_split_task: false,
            chunk_actual_keyspace: None,
            benchmark_speed: None,
            average_speed: None,
            progress_percent: 0.0,
            crack_count: 0,
            expected_crack_count: 0,
            received_crack_count: 0,
            batches_complete_signaled: false,
            retry_count: 0,
            consecutive_failures: 0,
            retransmit_count: 0,
            last_retransmit_at: None,
            increment_layer_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            cracking_completed_at: None,
            completed_at: None,
        }
    }

    /// A fresh rule-split task covering rules `[rule_start, rule_end)`.
    pub fn new_rule_chunk(
        job_id: Uuid,
        rule_start: u64,
        rule_end: u64,
        effective_start: u64,
        effective_end: u64,
    ) -> Self {
        let mut task = Self::new_keyspace_chunk(job_id, 0, 0);
        task.is_rule_split_task = true;
        task.rule_start_index = Some(rule_start);
        task.rule_end_index = Some(rule_end);
        task.effective_keyspace_start = Some(effective_start);
        task.effective_keyspace_end = Some(effective_end);
        task.effective_keyspace_processed = Some(0);
        task
    }

    /// Work assigned to this task, on whichever axis it was split.
    pub fn chunk_span(&self) -> u64 {
        if self.is_rule_split_task {
            match (self.effective_keyspace_start, self.effective_keyspace_end) {
                (Some(s), Some(e)) => e.saturating_sub(s),
                _ => 0,
            }
        } else {
            self.keyspace_end.saturating_sub(self.keyspace_start)
        }
    }
}

// ---------------------------------------------------------------------------
// IncrementLayer
// ---------------------------------------------------------------------------

/// One mask-length sublayer of an increment-mode mask job.
///
/// Unique per (`job_id`, `layer_index`); tasks link to at most one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementLayer {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 1-based position in dispatch order.
    pub layer_index: u32,
    /// The truncated mask for this length.
    pub mask: String,
    pub base_keyspace: u64,
    pub effective_keyspace: u64,
    pub processed_keyspace: u64,
    pub dispatched_keyspace: u64,
    pub is_accurate_keyspace: bool,
    pub overall_progress_percent: f64,
    pub status: LayerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IncrementLayer {
    pub fn new(job_id: Uuid, layer_index: u32, mask: impl Into<String>, base_keyspace: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            layer_index,
            mask: mask.into(),
            base_keyspace,
            effective_keyspace: base_keyspace,
            processed_keyspace: 0,
            dispatched_keyspace: 0,
            is_accurate_keyspace: false,
            overall_progress_percent: 0.0,
            status: LayerStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Offline,
    Disabled,
}

/// A single compute device reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Daily active window; outside it the scheduler will not assign work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    /// 0 = Monday .. 6 = Sunday, matching chrono's `weekday().num_days_from_monday()`.
    pub weekday: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSchedule {
    pub windows: Vec<ScheduleWindow>,
}

impl AgentSchedule {
    /// True when `at` falls inside any window for its weekday.
    /// An empty schedule means always active.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if self.windows.is_empty() {
            return true;
        }
        let weekday = chrono::Datelike::weekday(&at).num_days_from_monday() as u8;
        let time = at.time();
        self.windows
            .iter()
            .any(|w| w.weekday == weekday && w.start <= time && time <= w.end)
    }
}

/// A remote compute node that executes tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub owner_id: Option<String>,
    pub devices: Vec<DeviceInfo>,
    pub is_enabled: bool,
    pub schedule: Option<AgentSchedule>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub extra_parameters: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: AgentStatus::Offline,
            owner_id: None,
            devices: Vec::new(),
            is_enabled: true,
            schedule: None,
            last_heartbeat: None,
            extra_parameters: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for new work: online, enabled, and inside its schedule.
    pub fn is_schedulable_at(&self, at: DateTime<Utc>) -> bool {
        self.status == AgentStatus::Active
            && self.is_enabled
            && self.schedule.as_ref().map(|s| s.is_active_at(at)).unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Hashlist
// ---------------------------------------------------------------------------

/// An immutable (post-ingest) set of hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hashlist {
    pub id: Uuid,
    pub name: String,
    pub hash_type_id: u32,
    pub total_hashes: u64,
    /// Maintained by the crack-ingest path.
    pub cracked_hashes: u64,
    /// Disqualifies the hashlist from attack-mode 9.
    pub has_mixed_work_factors: bool,
    /// Ingest finished; the scheduler may run jobs against it.
    pub is_ready: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hashlist {
    pub fn new(name: impl Into<String>, hash_type_id: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            hash_type_id,
            total_hashes: 0,
            cracked_hashes: 0,
            has_mixed_work_factors: false,
            is_ready: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Measured speed for one (agent, attack mode, hash type) tuple.
/// Exactly one record exists per tuple (invariant 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub agent_id: Uuid,
    pub attack_mode: AttackMode,
    pub hash_type_id: u32,
    /// Hashes per second.
    pub speed: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    /// Standard hashcat speed probe.
    AgentSpeed,
    /// Full `--keyspace` run against the exact job config; pins
    /// authoritative keyspace.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkRequestStatus {
    Pending,
    Completed,
    Failed,
}

/// Typed result payload of a completed benchmark request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkOutcome {
    #[serde(default)]
    pub speed: Option<u64>,
    /// Hashcat-reported keyspace (forced flavor only).
    #[serde(default)]
    pub keyspace: Option<u64>,
    /// Per-layer keyspaces for increment jobs, keyed by layer index.
    #[serde(default)]
    pub layer_keyspaces: Vec<(u32, u64)>,
}

/// Coordination record for an async benchmark probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRequest {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Present for `forced` requests; ties the result to a job.
    pub job_id: Option<Uuid>,
    pub kind: BenchmarkKind,
    pub attack_mode: AttackMode,
    pub hash_type_id: u32,
    pub status: BenchmarkRequestStatus,
    pub outcome: Option<BenchmarkOutcome>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BenchmarkRequest {
    pub fn new(
        agent_id: Uuid,
        job_id: Option<Uuid>,
        kind: BenchmarkKind,
        attack_mode: AttackMode,
        hash_type_id: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            job_id,
            kind,
            attack_mode,
            hash_type_id,
            status: BenchmarkRequestStatus::Pending,
            outcome: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Presets & workflows
// ---------------------------------------------------------------------------

/// A reusable attack template jobs are materialized from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetJob {
    pub id: Uuid,
    pub name: String,
    pub attack: AttackConfig,
    pub priority: u32,
    pub max_agents: u32,
    pub chunk_size_seconds: u32,
    /// Required hashcat binary artifact; the scheduler skips jobs whose
    /// binary is missing.
    pub binary_id: Option<Uuid>,
    pub allow_high_priority_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered sequence of presets; each step materializes one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWorkflow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub preset_id: Uuid,
    pub step_order: u32,
}

// ---------------------------------------------------------------------------
// Cracks
// ---------------------------------------------------------------------------

/// One cracked-hash delivery inside a crack batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrackEntry {
    pub hash_value: String,
    pub plaintext: String,
    #[serde(default)]
    pub metadata: Option<String>,
}
