use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A workspace-scoped project that owns epics, user stories, and tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a new project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Epic {
    pub id: i64,
    pub project_id: i64,
    pub key: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEpic {
    pub project_id: i64,
    pub key: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStory {
    pub id: i64,
    pub project_id: i64,
    pub epic_id: i64,
    pub key: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUserStory {
    pub project_id: i64,
    pub epic_id: i64,
    pub key: String,
    pub name: String,
    pub description: String,
}

/// Lifecycle states a task moves through. Transitions are monotone in normal
/// flow; only the trio engine may downgrade `ReadyToQa -> InProgress` on retry.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    ReadyToReview,
    ReadyToQa,
    Completed,
    Blocked,
    Cancelled,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses are never re-entered by the engine.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    /// `Blocked` is non-terminal but excluded from default selection.
    pub fn is_blocked(self) -> bool {
        matches!(self, TaskStatus::Blocked)
    }

    pub fn can_transition_to(self, new: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == new {
            return false;
        }
        match (self, new) {
            (current, _) if current.is_terminal() => false,
            (NotStarted, InProgress) => true,
            (NotStarted, Blocked | Cancelled) => true,
            (InProgress, ReadyToReview | Blocked | Failed | Cancelled) => true,
            (ReadyToReview, ReadyToQa | InProgress | Blocked | Failed | Cancelled) => true,
            // The trio engine is the only caller allowed to downgrade ready_to_qa.
            (ReadyToQa, Completed | InProgress | Blocked | Failed | Cancelled) => true,
            (Blocked, InProgress | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::ReadyToReview => "ready_to_review",
            TaskStatus::ReadyToQa => "ready_to_qa",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub epic_id: i64,
    pub story_id: i64,
    /// Globally unique within the workspace, e.g. "P-E1-US1-T01".
    pub key: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: f64,
    pub story_points: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub project_id: i64,
    pub epic_id: i64,
    pub story_id: i64,
    pub key: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: f64,
    pub story_points: Option<i32>,
}

fn default_priority() -> f64 {
    5.0
}

/// Directed edge `from -> to`: `from` depends on (is blocked by) `to`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskDependency {
    pub from_task_id: i64,
    pub to_task_id: i64,
}

/// Filter used by both direct task queries and `TaskSelector`. `TaskSelector`
/// always orders candidates by dependency (spec.md §4.3 names a single
/// algorithm, not a switchable one); `parallel` is accepted here as an
/// informational hint forwarded from the CLI (spec.md §4.3 step 7) — see
/// SPEC_FULL.md §7 for why `TrioEngine` doesn't yet act on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub project_key: Option<String>,
    pub epic_key: Option<String>,
    pub story_key: Option<String>,
    pub task_keys: Option<Vec<String>>,
    pub status_filter: Vec<TaskStatus>,
    pub limit: Option<u32>,
    pub parallel: bool,
}

impl TaskFilter {
    /// Default statuses per spec: everything reachable by normal progression.
    pub fn default_statuses() -> Vec<TaskStatus> {
        vec![
            TaskStatus::NotStarted,
            TaskStatus::InProgress,
            TaskStatus::ReadyToReview,
            TaskStatus::ReadyToQa,
        ]
    }
}

/// One row per CLI invocation; owns a task-run, token-usage event, and/or job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRun {
    pub id: i64,
    pub task_id: Option<i64>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Job state machine per spec.md §4.7.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Checkpointing,
    Paused,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Partial | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            JobState::Queued | JobState::Running | JobState::Checkpointing | JobState::Paused
        )
    }

    /// Resumable independent of `resume_supported`, which gates separately.
    pub fn is_resumable_state(self) -> bool {
        matches!(self, JobState::Paused | JobState::Failed | JobState::Partial)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Checkpointing => "checkpointing",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Partial => "partial",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub command_name: String,
    pub state: JobState,
    pub payload_json: serde_json::Value,
    pub resume_supported: bool,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub job_type: String,
    pub command_name: String,
    pub payload_json: serde_json::Value,
    pub resume_supported: bool,
}

/// Append-only checkpoint entry. `stage` convention: `task:<key>:<step>` or `completed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: i64,
    pub job_id: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// The three stages of a task's trio cycle.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Work,
    Review,
    Qa,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Work => "work",
            Step::Review => "review",
            Step::Qa => "qa",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Succeeded,
    Failed,
    Blocked,
    Skipped,
}

/// One row per (task, step, attempt).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub step: Step,
    pub attempt: i32,
    pub status: TaskRunStatus,
    pub decision: Option<String>,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRun {
    pub task_id: i64,
    pub step: Step,
    pub attempt: i32,
    pub status: TaskRunStatus,
    pub decision: Option<String>,
    pub outcome: Option<String>,
}

/// Immutable token-usage event. Never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenUsage {
    pub id: i64,
    pub workspace_id: String,
    pub project_id: Option<i64>,
    pub agent_id: Option<i64>,
    pub job_id: Option<String>,
    pub command_run_id: Option<i64>,
    pub task_id: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub cost_estimate: Option<f64>,
    pub action: Option<String>,
    pub invocation_kind: Option<String>,
    pub provider: Option<String>,
    pub currency: Option<String>,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// New token-usage event to append; `id` and ordering are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewTokenUsage {
    pub workspace_id: String,
    pub project_id: Option<i64>,
    pub agent_id: Option<i64>,
    pub job_id: Option<String>,
    pub command_run_id: Option<i64>,
    pub task_id: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub cost_estimate: Option<f64>,
    pub action: Option<String>,
    pub invocation_kind: Option<String>,
    pub provider: Option<String>,
    pub currency: Option<String>,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A global (never workspace-local) execution agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: i64,
    pub slug: String,
    pub adapter: String,
    pub default_model: String,
    pub capabilities: Vec<String>,
    pub rating: f64,
    pub reasoning_rating: f64,
    pub rating_samples: i64,
    pub max_complexity: i32,
    pub complexity_updated_at: Option<DateTime<Utc>>,
    pub cost_per_million: f64,
    /// Health as last observed by the router; not persisted history, just the
    /// latest probe result used to exclude unreachable agents from selection.
    pub reachable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub slug: String,
    pub adapter: String,
    pub default_model: String,
    pub capabilities: Vec<String>,
    pub cost_per_million: f64,
    #[serde(default = "default_max_complexity")]
    pub max_complexity: i32,
}

fn default_max_complexity() -> i32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRunRating {
    pub id: i64,
    pub agent_id: i64,
    pub job_id: Option<String>,
    pub task_id: Option<i64>,
    pub quality_score: f64,
    pub total_cost: f64,
    pub duration_seconds: f64,
    pub iterations: i32,
    pub run_score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgentRunRating {
    pub agent_id: i64,
    pub job_id: Option<String>,
    pub task_id: Option<i64>,
    pub quality_score: f64,
    pub total_cost: f64,
    pub duration_seconds: f64,
    pub iterations: i32,
    pub run_score: f64,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskProgressStatus {
    Pending,
    Completed,
    Blocked,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChosenAgents {
    pub work: Option<String>,
    pub review: Option<String>,
    pub qa: Option<String>,
}

/// Per-task progression record embedded in `TrioState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub task_key: String,
    pub attempts: i32,
    pub status: TaskProgressStatus,
    pub last_step: Option<Step>,
    pub last_decision: Option<String>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub chosen_agents: ChosenAgents,
}

impl TaskProgress {
    pub fn new(task_key: impl Into<String>) -> Self {
        Self {
            task_key: task_key.into(),
            attempts: 0,
            status: TaskProgressStatus::Pending,
            last_step: None,
            last_decision: None,
            last_outcome: None,
            last_error: None,
            chosen_agents: ChosenAgents::default(),
        }
    }
}

/// Per-job durable object written exclusively by the trio engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrioState {
    pub schema_version: i32,
    pub job_id: String,
    pub command_run_id: Option<i64>,
    pub cycle: i32,
    pub tasks: HashMap<String, TaskProgress>,
}

impl TrioState {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            schema_version: 1,
            job_id: job_id.into(),
            command_run_id: None,
            cycle: 0,
            tasks: HashMap::new(),
        }
    }
}

/// `{localRecording, remoteExport, optOut, strict}` telemetry toggles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    pub local_recording: bool,
    pub remote_export: bool,
    pub opt_out: bool,
    pub strict: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            local_recording: true,
            remote_export: false,
            opt_out: false,
            strict: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Blocked.is_blocked());
    }

    #[test]
    fn task_status_transitions() {
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::NotStarted.can_transition_to(TaskStatus::NotStarted));
        assert!(TaskStatus::ReadyToReview.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::ReadyToQa.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::ReadyToQa.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn job_state_classification() {
        assert!(JobState::Queued.is_cancelable());
        assert!(JobState::Paused.is_cancelable());
        assert!(!JobState::Completed.is_cancelable());
        assert!(JobState::Paused.is_resumable_state());
        assert!(JobState::Failed.is_resumable_state());
        assert!(!JobState::Running.is_resumable_state());
        assert!(JobState::Completed.is_terminal());
    }

    #[test]
    fn task_progress_starts_pending() {
        let p = TaskProgress::new("P-E1-US1-T01");
        assert_eq!(p.status, TaskProgressStatus::Pending);
        assert_eq!(p.attempts, 0);
        assert!(p.chosen_agents.work.is_none());
    }
}
