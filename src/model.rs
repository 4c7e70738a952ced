// src/model.rs
//
// =============================================================================
// TRANSCODE CLUSTER: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The data contracts shared by the coordinator and every worker. Mirrors the
// "Hybrid Relational" split used by the store: high-traffic fields are plain
// columns there, everything below is what actually travels over the wire and
// gets serialised into those columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// 1. NODE
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub address: String,

    // Hardware fingerprint
    pub cpu_threads: usize,
    pub cpu_model: String,
    pub ram_total_mb: u64,
    pub ram_free_mb: u64,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub capability_tags: Vec<String>,

    // Load
    #[serde(default)]
    pub cpu_use_pct: f32,
    #[serde(default)]
    pub current_job_id: Option<Uuid>,

    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Node {
    /// Constructs a freshly-registering node. `id`/timestamps are filled in
    /// by the store on insert; this is the payload a worker sends.
    pub fn new_registration(
        name: String,
        address: String,
        cpu_threads: usize,
        cpu_model: String,
        ram_total_mb: u64,
        ram_free_mb: u64,
        gpu_type: Option<String>,
        capability_tags: Vec<String>,
        labels: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            address,
            cpu_threads,
            cpu_model,
            ram_total_mb,
            ram_free_mb,
            gpu_type,
            capability_tags,
            cpu_use_pct: 0.0,
            current_job_id: None,
            status: NodeStatus::Available,
            last_heartbeat: now,
            registered_at: now,
            labels,
        }
    }

    /// Invariant from spec.md §3: `current_job_id` non-empty iff `busy`.
    pub fn invariant_holds(&self) -> bool {
        self.current_job_id.is_some() == (self.status == NodeStatus::Busy)
    }
}

// ============================================================================
// 2. JOB
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Auto,
    Ffmpeg,
    Gstreamer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Batch,
    Default,
    Live,
}

impl QueueClass {
    /// `live=3, default=2, batch=1` per spec.md §4.3.
    pub fn weight(self) -> u32 {
        match self {
            QueueClass::Live => 3,
            QueueClass::Default => 2,
            QueueClass::Batch => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// `high=3, medium=2, low=1` per spec.md §4.3.
    pub fn weight(self) -> u32 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

/// FSM states from spec.md §4.2. Legacy names (`pending`, `processing`) map
/// onto `Queued`/`Running` on read — see `JobStatus::from_legacy_str`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
    Retrying,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Retrying => "retrying",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Accepts both current and legacy state names on read, per spec.md §4.2.
    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" | "pending" => JobStatus::Queued,
            "assigned" => JobStatus::Assigned,
            "running" | "processing" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "timed_out" => JobStatus::TimedOut,
            "retrying" => JobStatus::Retrying,
            "canceled" | "cancelled" => JobStatus::Canceled,
            _ => return None,
        })
    }
}

/// Non-retryable vs retryable failure classifications, spec.md §4.2.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UserError,
    CapabilityMismatch,
    InputError,
    NetworkError,
    ResourceError,
    Timeout,
    RuntimeError,
}

impl FailureReason {
    pub fn is_retry_eligible(self) -> bool {
        matches!(
            self,
            FailureReason::RuntimeError
                | FailureReason::NetworkError
                | FailureReason::ResourceError
                | FailureReason::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Allocated atomically by the store under its write mutex; mandatory,
    /// per the Open Question resolution recorded in DESIGN.md.
    pub sequence_number: i64,

    pub scenario: String,
    pub engine: Engine,
    pub queue: QueueClass,
    pub priority: Priority,
    #[serde(default)]
    pub confidence_hint: Option<f64>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    pub status: JobStatus,
    #[serde(default)]
    pub assigned_node: Option<Uuid>,
    #[serde(default)]
    pub progress_pct: u8,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub logs: String,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub history: Vec<StateTransition>,
}

pub fn default_max_retries() -> u32 {
    3
}

/// Fields a client supplies on `submit`; the store fills in id/sequence/
/// timestamps/status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub scenario: String,
    pub engine: Engine,
    pub queue: QueueClass,
    pub priority: Priority,
    #[serde(default)]
    pub confidence_hint: Option<f64>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Job {
    pub fn from_spec(spec: JobSpec, sequence_number: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sequence_number,
            scenario: spec.scenario,
            engine: spec.engine,
            queue: spec.queue,
            priority: spec.priority,
            confidence_hint: spec.confidence_hint,
            parameters: spec.parameters,
            status: JobStatus::Queued,
            assigned_node: None,
            progress_pct: 0,
            retry_count: 0,
            max_retries: spec.max_retries,
            error_message: None,
            failure_reason: None,
            logs: String::new(),
            created_at: now,
            started_at: None,
            last_activity: now,
            completed_at: None,
            history: vec![StateTransition {
                from: JobStatus::Queued,
                to: JobStatus::Queued,
                timestamp: now,
                reason: "submitted".into(),
            }],
        }
    }

    /// Whether parameters declare a hardware-encoder requirement, used by
    /// the scheduler's capability check (spec.md §4.3 step 4).
    pub fn requires_gpu(&self) -> bool {
        let codec_wants_hw = self
            .parameters
            .get("codec")
            .and_then(|v| v.as_str())
            .map(|c| {
                let c = c.to_ascii_lowercase();
                c.contains("nvenc") || c.contains("qsv") || c.contains("vaapi")
            })
            .unwrap_or(false);
        let hwaccel_explicit = self
            .parameters
            .get("hwaccel")
            .and_then(|v| v.as_str())
            .map(|h| h != "none")
            .unwrap_or(false);
        codec_wants_hw || hwaccel_explicit
    }

    /// Declared duration in seconds, when the caller supplied one.
    pub fn declared_duration_secs(&self) -> Option<f64> {
        self.parameters.get("duration_secs").and_then(|v| v.as_f64())
    }
}

/// Lightweight projection for admin listings, grounded in the teacher's
/// TUI-optimized `get_jobs_summary` query — the dashboard it fed is gone,
/// but the shape is exactly what a `list` verb needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub sequence_number: i64,
    pub status: JobStatus,
    pub queue: QueueClass,
    pub priority: Priority,
    pub assigned_node: Option<Uuid>,
    pub progress_pct: u8,
    pub updated_at: DateTime<Utc>,
}
