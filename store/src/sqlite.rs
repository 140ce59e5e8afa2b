use crate::common::{
    job_state_to_str, row_to_agent, row_to_checkpoint, row_to_command_run, row_to_dependency,
    row_to_epic, row_to_job, row_to_project, row_to_task, row_to_task_run, row_to_token_usage,
    row_to_trio_state, row_to_user_story, sqlx_error_to_mcoda_error, step_to_str,
    task_run_status_to_str, task_status_to_str,
};
use async_trait::async_trait;
use chrono::Utc;
use mcoda_core::{
    Agent, AgentRunRating, Checkpoint, CommandRun, Epic, Job, JobState, McodaError, NewAgent,
    NewAgentRunRating, NewEpic, NewJob, NewProject, NewTask, NewTaskRun, NewTokenUsage,
    NewUserStory, Project, Task, TaskDependency, TaskFilter, TaskRun, TaskStatus,
    TelemetryConfig, TokenUsage, TrioState, UserStory, Validator, WorkspaceStore,
};
use mcoda_core::repository::{TokenUsagePage, UsageFilter, UsageSummaryRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};

/// SQLite-backed `WorkspaceStore`. One pool per workspace database; the
/// global agent registry at `<HOME>/.mcoda/mcoda.db` uses the same type with
/// a different path.
#[derive(Debug, Clone)]
pub struct SqliteWorkspaceStore {
    pool: SqlitePool,
}

impl SqliteWorkspaceStore {
    pub async fn new(database_url: &str) -> Result<Self, McodaError> {
        let db_url = if database_url.starts_with(":memory:") {
            database_url.to_string()
        } else if database_url.starts_with("sqlite://") {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false)
        {
            Sqlite::create_database(&db_url)
                .await
                .map_err(|e| McodaError::StoreUnavailable(format!("create database: {e}")))?;
        }

        let connect_options = if db_url.contains(":memory:") {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_url)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        };

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl WorkspaceStore for SqliteWorkspaceStore {
    async fn migrate(&self) -> Result<(), McodaError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| McodaError::Fatal(format!("migration failed: {e}")))?;
        tracing::info!("workspace store migrations applied");
        Ok(())
    }

    async fn create_project(&self, new: NewProject) -> Result<Project, McodaError> {
        Validator::validate_key(&new.key)?;
        Validator::validate_name(&new.name)?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO projects (key, name, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&new.key)
        .bind(&new.name)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        self.get_project_by_id(result.last_insert_rowid()).await
    }

    async fn get_project_by_key(&self, key: &str) -> Result<Project, McodaError> {
        let row = sqlx::query("SELECT * FROM projects WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("project '{key}'")))?;
        row_to_project(&row)
    }

    async fn create_epic(&self, new: NewEpic) -> Result<Epic, McodaError> {
        Validator::validate_key(&new.key)?;
        Validator::validate_name(&new.name)?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO epics (project_id, key, name, description, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new.project_id)
        .bind(&new.key)
        .bind(&new.name)
        .bind(&new.description)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM epics WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_epic(&row)
    }

    async fn get_epic_by_key(&self, key: &str) -> Result<Epic, McodaError> {
        let row = sqlx::query("SELECT * FROM epics WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("epic '{key}'")))?;
        row_to_epic(&row)
    }

    async fn create_user_story(&self, new: NewUserStory) -> Result<UserStory, McodaError> {
        Validator::validate_key(&new.key)?;
        Validator::validate_name(&new.name)?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO user_stories (project_id, epic_id, key, name, description, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(new.project_id)
        .bind(new.epic_id)
        .bind(&new.key)
        .bind(&new.name)
        .bind(&new.description)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM user_stories WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_user_story(&row)
    }

    async fn get_user_story_by_key(&self, key: &str) -> Result<UserStory, McodaError> {
        let row = sqlx::query("SELECT * FROM user_stories WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("user story '{key}'")))?;
        row_to_user_story(&row)
    }

    async fn create_task(&self, new: NewTask) -> Result<Task, McodaError> {
        Validator::validate_new_task(&new)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO tasks
                (project_id, epic_id, story_id, key, name, description, status, priority, story_points, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.project_id)
        .bind(new.epic_id)
        .bind(new.story_id)
        .bind(&new.key)
        .bind(&new.name)
        .bind(&new.description)
        .bind(task_status_to_str(TaskStatus::NotStarted))
        .bind(new.priority)
        .bind(new.story_points)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        self.get_task(result.last_insert_rowid()).await
    }

    async fn get_task(&self, id: i64) -> Result<Task, McodaError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("task #{id}")))?;
        row_to_task(&row)
    }

    async fn get_task_by_key(&self, key: &str) -> Result<Task, McodaError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("task '{key}'")))?;
        row_to_task(&row)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, McodaError> {
        let mut sql = String::from("SELECT t.* FROM tasks t WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref project_key) = filter.project_key {
            sql.push_str(" AND t.project_id = (SELECT id FROM projects WHERE key = ?)");
            binds.push(project_key.clone());
        }
        if let Some(ref epic_key) = filter.epic_key {
            sql.push_str(" AND t.epic_id = (SELECT id FROM epics WHERE key = ?)");
            binds.push(epic_key.clone());
        }
        if let Some(ref story_key) = filter.story_key {
            sql.push_str(" AND t.story_id = (SELECT id FROM user_stories WHERE key = ?)");
            binds.push(story_key.clone());
        }
        if let Some(ref task_keys) = filter.task_keys {
            if !task_keys.is_empty() {
                let placeholders = vec!["?"; task_keys.len()].join(", ");
                sql.push_str(&format!(" AND t.key IN ({placeholders})"));
                binds.extend(task_keys.iter().cloned());
            }
        }
        let statuses = if filter.status_filter.is_empty() {
            TaskFilter::default_statuses()
        } else {
            filter.status_filter.clone()
        };
        let status_placeholders = vec!["?"; statuses.len()].join(", ");
        sql.push_str(&format!(" AND t.status IN ({status_placeholders})"));
        let status_binds: Vec<&str> = statuses.iter().map(|s| task_status_to_str(*s)).collect();

        sql.push_str(" ORDER BY t.priority DESC, t.key ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        for s in &status_binds {
            query = query.bind(*s);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn set_task_status(
        &self,
        task_id: i64,
        new_status: TaskStatus,
    ) -> Result<Task, McodaError> {
        let current = self.get_task(task_id).await?;
        if !current.status.can_transition_to(new_status) {
            return Err(McodaError::invalid_transition(current.status, new_status));
        }
        let now = Utc::now();
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(task_status_to_str(new_status))
            .bind(now.to_rfc3339())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        self.get_task(task_id).await
    }

    async fn add_dependency(&self, dep: TaskDependency) -> Result<(), McodaError> {
        sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (from_task_id, to_task_id) VALUES (?, ?)",
        )
        .bind(dep.from_task_id)
        .bind(dep.to_task_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;
        Ok(())
    }

    async fn list_dependencies(
        &self,
        task_ids: &[i64],
    ) -> Result<Vec<TaskDependency>, McodaError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; task_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM task_dependencies WHERE from_task_id IN ({placeholders}) OR to_task_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in task_ids {
            query = query.bind(id);
        }
        for id in task_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        Ok(rows.iter().map(row_to_dependency).collect())
    }

    async fn create_command_run(
        &self,
        task_id: Option<i64>,
        job_id: Option<String>,
    ) -> Result<CommandRun, McodaError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO command_runs (task_id, job_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(task_id)
        .bind(&job_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM command_runs WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_command_run(&row)
    }

    async fn create_job(&self, new: NewJob) -> Result<Job, McodaError> {
        let now = Utc::now();
        let payload = serde_json::to_string(&new.payload_json)
            .map_err(|e| McodaError::Fatal(format!("serialize job payload: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, command_name, state, payload_json, resume_supported, row_version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&new.id)
        .bind(&new.job_type)
        .bind(&new.command_name)
        .bind(job_state_to_str(JobState::Queued))
        .bind(payload)
        .bind(new.resume_supported)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        self.get_job(&new.id).await
    }

    async fn get_job(&self, id: &str) -> Result<Job, McodaError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("job '{id}'")))?;
        row_to_job(&row)
    }

    async fn transition_job(
        &self,
        id: &str,
        expected_row_version: i64,
        new_state: JobState,
    ) -> Result<Job, McodaError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, row_version = row_version + 1, updated_at = ? WHERE id = ? AND row_version = ?",
        )
        .bind(job_state_to_str(new_state))
        .bind(now.to_rfc3339())
        .bind(id)
        .bind(expected_row_version)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        if result.rows_affected() == 0 {
            let current = self.get_job(id).await?;
            return Err(McodaError::precondition(format!(
                "job '{id}' row_version mismatch: expected {expected_row_version}, was {}",
                current.row_version
            )));
        }
        self.get_job(id).await
    }

    async fn list_jobs(&self, limit: Option<u32>) -> Result<Vec<Job>, McodaError> {
        let sql = match limit {
            Some(n) => format!("SELECT * FROM jobs ORDER BY created_at DESC LIMIT {n}"),
            None => "SELECT * FROM jobs ORDER BY created_at DESC".to_string(),
        };
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn append_checkpoint(
        &self,
        job_id: &str,
        stage: &str,
        details: serde_json::Value,
    ) -> Result<Checkpoint, McodaError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_mcoda_error)?;
        let now = Utc::now();
        let details_raw = serde_json::to_string(&details)
            .map_err(|e| McodaError::Fatal(format!("serialize checkpoint details: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO checkpoints (job_id, stage, timestamp, details_json) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(stage)
        .bind(now.to_rfc3339())
        .bind(details_raw)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        // Momentary checkpointing -> running transition, per spec.md §4.7, only
        // when the job is actually running; resume replay writes checkpoints
        // while paused and must not disturb that state.
        let current_state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;

        if current_state.as_deref() == Some("running") {
            sqlx::query(
                "UPDATE jobs SET state = 'checkpointing', row_version = row_version + 1, updated_at = ? WHERE id = ?",
            )
            .bind(now.to_rfc3339())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;

            sqlx::query(
                "UPDATE jobs SET state = 'running', row_version = row_version + 1, updated_at = ? WHERE id = ?",
            )
            .bind(now.to_rfc3339())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        }

        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        let checkpoint = row_to_checkpoint(&row)?;

        tx.commit().await.map_err(sqlx_error_to_mcoda_error)?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, McodaError> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn create_task_run(&self, new: NewTaskRun) -> Result<TaskRun, McodaError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO task_runs (task_id, step, attempt, status, decision, outcome, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.task_id)
        .bind(step_to_str(new.step))
        .bind(new.attempt)
        .bind(task_run_status_to_str(new.status))
        .bind(&new.decision)
        .bind(&new.outcome)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM task_runs WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_task_run(&row)
    }

    async fn list_task_runs(&self, task_id: i64) -> Result<Vec<TaskRun>, McodaError> {
        let rows = sqlx::query("SELECT * FROM task_runs WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        rows.iter().map(row_to_task_run).collect()
    }

    async fn record_token_usage(&self, new: NewTokenUsage) -> Result<TokenUsage, McodaError> {
        let result = sqlx::query(
            r#"
            INSERT INTO token_usage
                (workspace_id, project_id, agent_id, job_id, command_run_id, task_id,
                 prompt_tokens, completion_tokens, total_tokens, cached_tokens,
                 cache_read_tokens, cache_write_tokens, duration_ms, duration_seconds,
                 cost_estimate, action, invocation_kind, provider, currency, model, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.workspace_id)
        .bind(new.project_id)
        .bind(new.agent_id)
        .bind(&new.job_id)
        .bind(new.command_run_id)
        .bind(new.task_id)
        .bind(new.prompt_tokens)
        .bind(new.completion_tokens)
        .bind(new.total_tokens)
        .bind(new.cached_tokens)
        .bind(new.cache_read_tokens)
        .bind(new.cache_write_tokens)
        .bind(new.duration_ms)
        .bind(new.duration_seconds)
        .bind(new.cost_estimate)
        .bind(&new.action)
        .bind(&new.invocation_kind)
        .bind(&new.provider)
        .bind(&new.currency)
        .bind(&new.model)
        .bind(new.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM token_usage WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_token_usage(&row)
    }

    async fn summarize_token_usage(
        &self,
        filter: &UsageFilter,
        group_by: &[String],
    ) -> Result<Vec<UsageSummaryRow>, McodaError> {
        let groups: Vec<String> = if group_by.is_empty() {
            vec!["project".into(), "command".into(), "agent".into()]
        } else {
            group_by.to_vec()
        };

        let mut select_exprs = Vec::new();
        for g in &groups {
            let expr = match g.as_str() {
                "project" => "COALESCE(CAST(project_id AS TEXT), '')",
                "agent" => "COALESCE(CAST(agent_id AS TEXT), '')",
                "command" => "COALESCE(CAST(command_run_id AS TEXT), '')",
                "day" => "substr(timestamp, 1, 10)",
                "model" => "COALESCE(model, '')",
                "job" => "COALESCE(job_id, '')",
                "action" => "COALESCE(action, '')",
                other => {
                    return Err(McodaError::validation(
                        "group_by",
                        format!("unknown grouping dimension '{other}'"),
                    ))
                }
            };
            select_exprs.push(expr.to_string());
        }

        let (where_clause, binds) = build_usage_where(filter);
        let group_list = select_exprs.join(", ");
        let sql = format!(
            r#"
            SELECT {group_list},
                   COALESCE(SUM(prompt_tokens), 0) AS sum_prompt,
                   COALESCE(SUM(completion_tokens), 0) AS sum_completion,
                   COALESCE(SUM(total_tokens), 0) AS sum_total,
                   COALESCE(SUM(cached_tokens), 0) AS sum_cached,
                   COALESCE(SUM(cache_read_tokens), 0) AS sum_cache_read,
                   COALESCE(SUM(cache_write_tokens), 0) AS sum_cache_write,
                   COALESCE(SUM(COALESCE(duration_ms, duration_seconds * 1000)), 0) AS sum_duration_ms,
                   SUM(cost_estimate) AS sum_cost,
                   COUNT(*) AS calls
            FROM token_usage
            {where_clause}
            GROUP BY {group_list}
            ORDER BY {group_list}
            "#
        );

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut group_key = Vec::with_capacity(groups.len());
            for i in 0..groups.len() {
                group_key.push(row.get::<String, _>(i));
            }
            out.push(UsageSummaryRow {
                group_key,
                prompt_tokens: row.get("sum_prompt"),
                completion_tokens: row.get("sum_completion"),
                total_tokens: row.get("sum_total"),
                cached_tokens: row.get("sum_cached"),
                cache_read_tokens: row.get("sum_cache_read"),
                cache_write_tokens: row.get("sum_cache_write"),
                duration_ms: row.get::<i64, _>("sum_duration_ms"),
                cost_estimate: row.try_get::<f64, _>("sum_cost").ok(),
                calls: row.get("calls"),
            });
        }
        Ok(out)
    }

    async fn query_token_usage(
        &self,
        filter: &UsageFilter,
        page: u32,
        page_size: u32,
    ) -> Result<TokenUsagePage, McodaError> {
        if page == 0 {
            return Err(McodaError::validation("page", "must be 1-based"));
        }
        let page_size = page_size.min(1000).max(1);
        let (where_clause, binds) = build_usage_where(filter);

        let count_sql = format!("SELECT COUNT(*) FROM token_usage {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;

        let offset = (page - 1) as i64 * page_size as i64;
        let sql = format!(
            "SELECT * FROM token_usage {where_clause} ORDER BY timestamp ASC, id ASC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        query = query.bind(page_size as i64).bind(offset);
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        let items = rows
            .iter()
            .map(row_to_token_usage)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TokenUsagePage {
            items,
            page,
            page_size,
            total: total.max(0) as u64,
        })
    }

    async fn create_agent(&self, new: NewAgent) -> Result<Agent, McodaError> {
        Validator::validate_new_agent(&new)?;
        let caps = serde_json::to_string(&new.capabilities)
            .map_err(|e| McodaError::Fatal(format!("serialize capabilities: {e}")))?;
        let result = sqlx::query(
            r#"
            INSERT INTO agents (slug, adapter, default_model, capabilities_json, max_complexity, cost_per_million)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.slug)
        .bind(&new.adapter)
        .bind(&new.default_model)
        .bind(caps)
        .bind(new.max_complexity)
        .bind(new.cost_per_million)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_agent(&row)
    }

    async fn get_agent_by_slug(&self, slug: &str) -> Result<Agent, McodaError> {
        let row = sqlx::query("SELECT * FROM agents WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("agent '{slug}'")))?;
        row_to_agent(&row)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, McodaError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY slug ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn update_agent_rating(
        &self,
        agent_id: i64,
        rating: f64,
        reasoning_rating: f64,
    ) -> Result<Agent, McodaError> {
        sqlx::query(
            "UPDATE agents SET rating = ?, reasoning_rating = ?, rating_samples = rating_samples + 1 WHERE id = ?",
        )
        .bind(rating)
        .bind(reasoning_rating)
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("agent #{agent_id}")))?;
        row_to_agent(&row)
    }

    async fn update_agent_complexity(
        &self,
        agent_id: i64,
        max_complexity: i32,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Agent, McodaError> {
        sqlx::query("UPDATE agents SET max_complexity = ?, complexity_updated_at = ? WHERE id = ?")
            .bind(max_complexity)
            .bind(updated_at.to_rfc3339())
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;

        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?
            .ok_or_else(|| McodaError::not_found(format!("agent #{agent_id}")))?;
        row_to_agent(&row)
    }

    async fn record_agent_run_rating(
        &self,
        new: NewAgentRunRating,
    ) -> Result<AgentRunRating, McodaError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO agent_run_ratings
                (agent_id, job_id, task_id, quality_score, total_cost, duration_seconds, iterations, run_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.agent_id)
        .bind(&new.job_id)
        .bind(new.task_id)
        .bind(new.quality_score)
        .bind(new.total_cost)
        .bind(new.duration_seconds)
        .bind(new.iterations)
        .bind(new.run_score)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;

        Ok(AgentRunRating {
            id: result.last_insert_rowid(),
            agent_id: new.agent_id,
            job_id: new.job_id,
            task_id: new.task_id,
            quality_score: new.quality_score,
            total_cost: new.total_cost,
            duration_seconds: new.duration_seconds,
            iterations: new.iterations,
            run_score: new.run_score,
            created_at: now,
        })
    }

    async fn load_trio_state(&self, job_id: &str) -> Result<Option<TrioState>, McodaError> {
        let row = sqlx::query("SELECT * FROM trio_state WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row.map(|r| row_to_trio_state(&r)).transpose()
    }

    async fn save_trio_state(&self, state: &TrioState) -> Result<(), McodaError> {
        let tasks_raw = serde_json::to_string(&state.tasks)
            .map_err(|e| McodaError::Fatal(format!("serialize trio state: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO trio_state (job_id, schema_version, command_run_id, cycle, tasks_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                schema_version = excluded.schema_version,
                command_run_id = excluded.command_run_id,
                cycle = excluded.cycle,
                tasks_json = excluded.tasks_json
            "#,
        )
        .bind(&state.job_id)
        .bind(state.schema_version)
        .bind(state.command_run_id)
        .bind(state.cycle)
        .bind(tasks_raw)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;
        Ok(())
    }

    async fn get_telemetry_config(&self) -> Result<TelemetryConfig, McodaError> {
        let row = sqlx::query("SELECT * FROM telemetry_config WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        Ok(TelemetryConfig {
            local_recording: row.get::<i64, _>("local_recording") != 0,
            remote_export: row.get::<i64, _>("remote_export") != 0,
            opt_out: row.get::<i64, _>("opt_out") != 0,
            strict: row.get::<i64, _>("strict") != 0,
        })
    }

    async fn set_telemetry_config(&self, config: TelemetryConfig) -> Result<(), McodaError> {
        // `strict` also disables local recording, per spec.md §4.1.
        let local_recording = config.local_recording && !config.strict;
        sqlx::query(
            "UPDATE telemetry_config SET local_recording = ?, remote_export = ?, opt_out = ?, strict = ? WHERE id = 1",
        )
        .bind(local_recording)
        .bind(config.remote_export)
        .bind(config.opt_out)
        .bind(config.strict)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_mcoda_error)?;
        Ok(())
    }
}

impl SqliteWorkspaceStore {
    async fn get_project_by_id(&self, id: i64) -> Result<Project, McodaError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_mcoda_error)?;
        row_to_project(&row)
    }
}

fn build_usage_where(filter: &UsageFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(ref workspace_id) = filter.workspace_id {
        clauses.push("workspace_id = ?".to_string());
        binds.push(workspace_id.clone());
    }
    if let Some(project_id) = filter.project_id {
        clauses.push("project_id = ?".to_string());
        binds.push(project_id.to_string());
    }
    if let Some(agent_id) = filter.agent_id {
        clauses.push("agent_id = ?".to_string());
        binds.push(agent_id.to_string());
    }
    if let Some(ref job_id) = filter.job_id {
        clauses.push("job_id = ?".to_string());
        binds.push(job_id.clone());
    }
    if let Some(since) = filter.since {
        clauses.push("timestamp >= ?".to_string());
        binds.push(since.to_rfc3339());
    }
    if let Some(until) = filter.until {
        clauses.push("timestamp <= ?".to_string());
        binds.push(until.to_rfc3339());
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_core::NewProject;

    async fn setup() -> SqliteWorkspaceStore {
        let store = SqliteWorkspaceStore::new(":memory:")
            .await
            .expect("connect");
        store.migrate().await.expect("migrate");
        store
    }

    #[tokio::test]
    async fn migrations_are_idempotent_and_create_schema() {
        let store = setup().await;
        store.migrate().await.expect("second migrate is a no-op");
        let project = store
            .create_project(NewProject {
                key: "P".into(),
                name: "Project".into(),
            })
            .await
            .expect("create project");
        assert_eq!(project.key, "P");
    }

    #[tokio::test]
    async fn task_status_transition_is_validated() {
        let store = setup().await;
        let project = store
            .create_project(NewProject {
                key: "P".into(),
                name: "P".into(),
            })
            .await
            .unwrap();
        let epic = store
            .create_epic(NewEpic {
                project_id: project.id,
                key: "P-E1".into(),
                name: "E1".into(),
                description: "desc".into(),
            })
            .await
            .unwrap();
        let story = store
            .create_user_story(NewUserStory {
                project_id: project.id,
                epic_id: epic.id,
                key: "P-E1-US1".into(),
                name: "US1".into(),
                description: "desc".into(),
            })
            .await
            .unwrap();
        let task = store
            .create_task(NewTask {
                project_id: project.id,
                epic_id: epic.id,
                story_id: story.id,
                key: "P-E1-US1-T01".into(),
                name: "Task".into(),
                description: "desc".into(),
                priority: 5.0,
                story_points: None,
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::NotStarted);

        let updated = store
            .set_task_status(task.id, TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);

        let err = store
            .set_task_status(task.id, TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, McodaError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn job_transition_rejects_stale_row_version() {
        let store = setup().await;
        let job = store
            .create_job(NewJob {
                id: "job-1".into(),
                job_type: "gateway-trio".into(),
                command_name: "gateway-trio".into(),
                payload_json: serde_json::json!({}),
                resume_supported: true,
            })
            .await
            .unwrap();
        assert_eq!(job.row_version, 1);

        let running = store
            .transition_job(&job.id, 1, JobState::Running)
            .await
            .unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.row_version, 2);

        let stale = store.transition_job(&job.id, 1, JobState::Paused).await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn checkpoint_write_cycles_running_through_checkpointing() {
        let store = setup().await;
        let job = store
            .create_job(NewJob {
                id: "job-2".into(),
                job_type: "gateway-trio".into(),
                command_name: "gateway-trio".into(),
                payload_json: serde_json::json!({}),
                resume_supported: true,
            })
            .await
            .unwrap();
        store
            .transition_job(&job.id, 1, JobState::Running)
            .await
            .unwrap();

        store
            .append_checkpoint(&job.id, "task:T01:work", serde_json::json!({"outcome": "succeeded"}))
            .await
            .unwrap();

        let final_job = store.get_job(&job.id).await.unwrap();
        assert_eq!(final_job.state, JobState::Running);
        assert_eq!(final_job.row_version, 4); // running(2) -> checkpointing(3) -> running(4)

        let checkpoints = store.list_checkpoints(&job.id).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].stage, "task:T01:work");
    }

    #[tokio::test]
    async fn token_usage_summary_matches_query_total() {
        let store = setup().await;
        for i in 0..3 {
            store
                .record_token_usage(NewTokenUsage {
                    workspace_id: "ws".into(),
                    total_tokens: Some(100),
                    timestamp: Utc::now() + chrono::Duration::seconds(i),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let summary = store
            .summarize_token_usage(&UsageFilter::default(), &["project".to_string()])
            .await
            .unwrap();
        let summed: i64 = summary.iter().map(|r| r.total_tokens).sum();

        let page = store
            .query_token_usage(&UsageFilter::default(), 1, 1000)
            .await
            .unwrap();
        let queried: i64 = page.items.iter().filter_map(|u| u.total_tokens).sum();

        assert_eq!(summed, queried);
        assert_eq!(queried, 300);
    }
}
