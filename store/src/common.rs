use chrono::{DateTime, Utc};
use mcoda_core::{
    Agent, Checkpoint, CommandRun, Epic, Job, JobState, McodaError, Project, Step, Task,
    TaskDependency, TaskRun, TaskRunStatus, TaskStatus, TokenUsage, TrioState, UserStory,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

pub fn sqlx_error_to_mcoda_error(err: sqlx::Error) -> McodaError {
    match &err {
        sqlx::Error::RowNotFound => McodaError::not_found("row"),
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            McodaError::DuplicateKey(db_err.message().to_string())
        }
        other => McodaError::StoreUnavailable(other.to_string()),
    }
}

pub fn task_status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::NotStarted => "not_started",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::ReadyToReview => "ready_to_review",
        TaskStatus::ReadyToQa => "ready_to_qa",
        TaskStatus::Completed => "completed",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Failed => "failed",
    }
}

pub fn str_to_task_status(raw: &str) -> Result<TaskStatus, McodaError> {
    Ok(match raw {
        "not_started" => TaskStatus::NotStarted,
        "in_progress" => TaskStatus::InProgress,
        "ready_to_review" => TaskStatus::ReadyToReview,
        "ready_to_qa" => TaskStatus::ReadyToQa,
        "completed" => TaskStatus::Completed,
        "blocked" => TaskStatus::Blocked,
        "cancelled" => TaskStatus::Cancelled,
        "failed" => TaskStatus::Failed,
        other => return Err(McodaError::Fatal(format!("unknown task status '{other}'"))),
    })
}

pub fn job_state_to_str(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Running => "running",
        JobState::Checkpointing => "checkpointing",
        JobState::Paused => "paused",
        JobState::Completed => "completed",
        JobState::Partial => "partial",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

pub fn str_to_job_state(raw: &str) -> Result<JobState, McodaError> {
    Ok(match raw {
        "queued" => JobState::Queued,
        "running" => JobState::Running,
        "checkpointing" => JobState::Checkpointing,
        "paused" => JobState::Paused,
        "completed" => JobState::Completed,
        "partial" => JobState::Partial,
        "failed" => JobState::Failed,
        "cancelled" => JobState::Cancelled,
        other => return Err(McodaError::Fatal(format!("unknown job state '{other}'"))),
    })
}

pub fn step_to_str(step: Step) -> &'static str {
    match step {
        Step::Work => "work",
        Step::Review => "review",
        Step::Qa => "qa",
    }
}

pub fn str_to_step(raw: &str) -> Result<Step, McodaError> {
    Ok(match raw {
        "work" => Step::Work,
        "review" => Step::Review,
        "qa" => Step::Qa,
        other => return Err(McodaError::Fatal(format!("unknown step '{other}'"))),
    })
}

pub fn task_run_status_to_str(status: TaskRunStatus) -> &'static str {
    match status {
        TaskRunStatus::Succeeded => "succeeded",
        TaskRunStatus::Failed => "failed",
        TaskRunStatus::Blocked => "blocked",
        TaskRunStatus::Skipped => "skipped",
    }
}

pub fn str_to_task_run_status(raw: &str) -> Result<TaskRunStatus, McodaError> {
    Ok(match raw {
        "succeeded" => TaskRunStatus::Succeeded,
        "failed" => TaskRunStatus::Failed,
        "blocked" => TaskRunStatus::Blocked,
        "skipped" => TaskRunStatus::Skipped,
        other => return Err(McodaError::Fatal(format!("unknown task run status '{other}'"))),
    })
}

pub fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, McodaError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| McodaError::Fatal(format!("corrupt timestamp '{raw}': {e}")))
}

pub fn row_to_project(row: &SqliteRow) -> Result<Project, McodaError> {
    Ok(Project {
        id: row.get("id"),
        key: row.get("key"),
        name: row.get("name"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_rfc3339(row.get::<String, _>("updated_at").as_str())?,
    })
}

pub fn row_to_epic(row: &SqliteRow) -> Result<Epic, McodaError> {
    Ok(Epic {
        id: row.get("id"),
        project_id: row.get("project_id"),
        key: row.get("key"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
    })
}

pub fn row_to_user_story(row: &SqliteRow) -> Result<UserStory, McodaError> {
    Ok(UserStory {
        id: row.get("id"),
        project_id: row.get("project_id"),
        epic_id: row.get("epic_id"),
        key: row.get("key"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
    })
}

pub fn row_to_task(row: &SqliteRow) -> Result<Task, McodaError> {
    Ok(Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        epic_id: row.get("epic_id"),
        story_id: row.get("story_id"),
        key: row.get("key"),
        name: row.get("name"),
        description: row.get("description"),
        status: str_to_task_status(&row.get::<String, _>("status"))?,
        priority: row.get("priority"),
        story_points: row.try_get::<i32, _>("story_points").ok(),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_rfc3339(row.get::<String, _>("updated_at").as_str())?,
    })
}

pub fn row_to_dependency(row: &SqliteRow) -> TaskDependency {
    TaskDependency {
        from_task_id: row.get("from_task_id"),
        to_task_id: row.get("to_task_id"),
    }
}

pub fn row_to_command_run(row: &SqliteRow) -> Result<CommandRun, McodaError> {
    Ok(CommandRun {
        id: row.get("id"),
        task_id: row.try_get::<i64, _>("task_id").ok(),
        job_id: row.try_get::<String, _>("job_id").ok(),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
    })
}

pub fn row_to_job(row: &SqliteRow) -> Result<Job, McodaError> {
    let payload_raw: String = row.get("payload_json");
    Ok(Job {
        id: row.get("id"),
        job_type: row.get("job_type"),
        command_name: row.get("command_name"),
        state: str_to_job_state(&row.get::<String, _>("state"))?,
        payload_json: serde_json::from_str(&payload_raw)
            .map_err(|e| McodaError::Fatal(format!("corrupt job payload: {e}")))?,
        resume_supported: row.get::<i64, _>("resume_supported") != 0,
        row_version: row.get("row_version"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_rfc3339(row.get::<String, _>("updated_at").as_str())?,
    })
}

pub fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint, McodaError> {
    let details_raw: String = row.get("details_json");
    Ok(Checkpoint {
        id: row.get("id"),
        job_id: row.get("job_id"),
        stage: row.get("stage"),
        timestamp: parse_rfc3339(row.get::<String, _>("timestamp").as_str())?,
        details: serde_json::from_str(&details_raw)
            .map_err(|e| McodaError::Fatal(format!("corrupt checkpoint details: {e}")))?,
    })
}

pub fn row_to_task_run(row: &SqliteRow) -> Result<TaskRun, McodaError> {
    Ok(TaskRun {
        id: row.get("id"),
        task_id: row.get("task_id"),
        step: str_to_step(&row.get::<String, _>("step"))?,
        attempt: row.get("attempt"),
        status: str_to_task_run_status(&row.get::<String, _>("status"))?,
        decision: row.try_get::<String, _>("decision").ok(),
        outcome: row.try_get::<String, _>("outcome").ok(),
        created_at: parse_rfc3339(row.get::<String, _>("created_at").as_str())?,
    })
}

pub fn row_to_token_usage(row: &SqliteRow) -> Result<TokenUsage, McodaError> {
    Ok(TokenUsage {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        project_id: row.try_get("project_id").ok(),
        agent_id: row.try_get("agent_id").ok(),
        job_id: row.try_get::<String, _>("job_id").ok(),
        command_run_id: row.try_get("command_run_id").ok(),
        task_id: row.try_get("task_id").ok(),
        prompt_tokens: row.try_get("prompt_tokens").ok(),
        completion_tokens: row.try_get("completion_tokens").ok(),
        total_tokens: row.try_get("total_tokens").ok(),
        cached_tokens: row.try_get("cached_tokens").ok(),
        cache_read_tokens: row.try_get("cache_read_tokens").ok(),
        cache_write_tokens: row.try_get("cache_write_tokens").ok(),
        duration_ms: row.try_get("duration_ms").ok(),
        duration_seconds: row.try_get("duration_seconds").ok(),
        cost_estimate: row.try_get("cost_estimate").ok(),
        action: row.try_get::<String, _>("action").ok(),
        invocation_kind: row.try_get::<String, _>("invocation_kind").ok(),
        provider: row.try_get::<String, _>("provider").ok(),
        currency: row.try_get::<String, _>("currency").ok(),
        model: row.try_get::<String, _>("model").ok(),
        timestamp: parse_rfc3339(row.get::<String, _>("timestamp").as_str())?,
    })
}

pub fn row_to_agent(row: &SqliteRow) -> Result<Agent, McodaError> {
    let caps_raw: String = row.get("capabilities_json");
    let complexity_updated_at: Option<String> = row.try_get("complexity_updated_at").ok();
    Ok(Agent {
        id: row.get("id"),
        slug: row.get("slug"),
        adapter: row.get("adapter"),
        default_model: row.get("default_model"),
        capabilities: serde_json::from_str(&caps_raw)
            .map_err(|e| McodaError::Fatal(format!("corrupt capabilities: {e}")))?,
        rating: row.get("rating"),
        reasoning_rating: row.get("reasoning_rating"),
        rating_samples: row.get("rating_samples"),
        max_complexity: row.get("max_complexity"),
        complexity_updated_at: complexity_updated_at
            .map(|s| parse_rfc3339(&s))
            .transpose()?,
        cost_per_million: row.get("cost_per_million"),
        reachable: true,
    })
}

pub fn row_to_trio_state(row: &SqliteRow) -> Result<TrioState, McodaError> {
    let tasks_raw: String = row.get("tasks_json");
    Ok(TrioState {
        schema_version: row.get("schema_version"),
        job_id: row.get("job_id"),
        command_run_id: row.try_get("command_run_id").ok(),
        cycle: row.get("cycle"),
        tasks: serde_json::from_str(&tasks_raw)
            .map_err(|e| McodaError::Fatal(format!("corrupt trio state: {e}")))?,
    })
}
