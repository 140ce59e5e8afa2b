use crate::error::McodaError;
use crate::models::{
    Agent, AgentRunRating, Checkpoint, CommandRun, Epic, Job, JobState, NewAgent,
    NewAgentRunRating, NewEpic, NewJob, NewProject, NewTask, NewTaskRun, NewTokenUsage,
    NewUserStory, Project, Task, TaskDependency, TaskFilter, TaskRun, TelemetryConfig,
    TokenUsage, TrioState, UserStory,
};
use async_trait::async_trait;
use serde::Serialize;

/// A single page of time-ordered token-usage rows, per `TelemetryLedger.Query`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsagePage {
    pub items: Vec<TokenUsage>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// One grouped row from `TelemetryLedger.Summarize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummaryRow {
    pub group_key: Vec<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub duration_ms: i64,
    pub cost_estimate: Option<f64>,
    pub calls: i64,
}

/// Time-window / dimension filter shared by `Summarize` and `Query`.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub workspace_id: Option<String>,
    pub project_id: Option<i64>,
    pub agent_id: Option<i64>,
    pub job_id: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
}

/// The seam between `mcoda-engine` and its durable backing store. One
/// implementation (`mcoda-store`) persists to SQLite; `mcoda-mocks` provides
/// an in-memory implementation for tests. All multi-row writes must be
/// internally transactional per spec.md §4.2/§5.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn migrate(&self) -> Result<(), McodaError>;

    // -- Projects / epics / stories -----------------------------------
    async fn create_project(&self, new: NewProject) -> Result<Project, McodaError>;
    async fn get_project_by_key(&self, key: &str) -> Result<Project, McodaError>;
    async fn create_epic(&self, new: NewEpic) -> Result<Epic, McodaError>;
    async fn get_epic_by_key(&self, key: &str) -> Result<Epic, McodaError>;
    async fn create_user_story(&self, new: NewUserStory) -> Result<UserStory, McodaError>;
    async fn get_user_story_by_key(&self, key: &str) -> Result<UserStory, McodaError>;

    // -- Tasks ----------------------------------------------------------
    async fn create_task(&self, new: NewTask) -> Result<Task, McodaError>;
    async fn get_task(&self, id: i64) -> Result<Task, McodaError>;
    async fn get_task_by_key(&self, key: &str) -> Result<Task, McodaError>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, McodaError>;
    /// Validates `current.can_transition_to(new_status)` before writing.
    async fn set_task_status(
        &self,
        task_id: i64,
        new_status: crate::models::TaskStatus,
    ) -> Result<Task, McodaError>;

    // -- Dependencies -----------------------------------------------------
    async fn add_dependency(&self, dep: TaskDependency) -> Result<(), McodaError>;
    async fn list_dependencies(
        &self,
        task_ids: &[i64],
    ) -> Result<Vec<TaskDependency>, McodaError>;

    // -- Command runs ------------------------------------------------------
    async fn create_command_run(
        &self,
        task_id: Option<i64>,
        job_id: Option<String>,
    ) -> Result<CommandRun, McodaError>;

    // -- Jobs -------------------------------------------------------------
    async fn create_job(&self, new: NewJob) -> Result<Job, McodaError>;
    async fn get_job(&self, id: &str) -> Result<Job, McodaError>;
    /// Atomic compare-and-swap on `row_version` to avoid lost updates, the
    /// same `UPDATE ... WHERE row_version = ?` claiming pattern used for
    /// task claims in the teacher store.
    async fn transition_job(
        &self,
        id: &str,
        expected_row_version: i64,
        new_state: JobState,
    ) -> Result<Job, McodaError>;
    async fn list_jobs(&self, limit: Option<u32>) -> Result<Vec<Job>, McodaError>;

    // -- Checkpoints --------------------------------------------------------
    async fn append_checkpoint(
        &self,
        job_id: &str,
        stage: &str,
        details: serde_json::Value,
    ) -> Result<Checkpoint, McodaError>;
    async fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, McodaError>;

    // -- Task runs -----------------------------------------------------------
    async fn create_task_run(&self, new: NewTaskRun) -> Result<TaskRun, McodaError>;
    async fn list_task_runs(&self, task_id: i64) -> Result<Vec<TaskRun>, McodaError>;

    // -- Token usage -----------------------------------------------------------
    async fn record_token_usage(&self, new: NewTokenUsage) -> Result<TokenUsage, McodaError>;
    async fn summarize_token_usage(
        &self,
        filter: &UsageFilter,
        group_by: &[String],
    ) -> Result<Vec<UsageSummaryRow>, McodaError>;
    async fn query_token_usage(
        &self,
        filter: &UsageFilter,
        page: u32,
        page_size: u32,
    ) -> Result<TokenUsagePage, McodaError>;

    // -- Agents (global registry) ---------------------------------------------
    async fn create_agent(&self, new: NewAgent) -> Result<Agent, McodaError>;
    async fn get_agent_by_slug(&self, slug: &str) -> Result<Agent, McodaError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, McodaError>;
    async fn update_agent_rating(
        &self,
        agent_id: i64,
        rating: f64,
        reasoning_rating: f64,
    ) -> Result<Agent, McodaError>;
    async fn update_agent_complexity(
        &self,
        agent_id: i64,
        max_complexity: i32,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Agent, McodaError>;
    async fn record_agent_run_rating(
        &self,
        new: NewAgentRunRating,
    ) -> Result<AgentRunRating, McodaError>;

    // -- TrioState ------------------------------------------------------------
    async fn load_trio_state(&self, job_id: &str) -> Result<Option<TrioState>, McodaError>;
    async fn save_trio_state(&self, state: &TrioState) -> Result<(), McodaError>;

    // -- Telemetry config -------------------------------------------------------
    async fn get_telemetry_config(&self) -> Result<TelemetryConfig, McodaError>;
    async fn set_telemetry_config(&self, config: TelemetryConfig) -> Result<(), McodaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_filter_defaults_are_unset() {
        let f = UsageFilter::default();
        assert!(f.project_id.is_none());
        assert!(f.since.is_none());
    }

    #[test]
    fn usage_summary_row_defaults_to_zero() {
        let row = UsageSummaryRow::default();
        assert_eq!(row.calls, 0);
        assert_eq!(row.cost_estimate, None);
    }
}
