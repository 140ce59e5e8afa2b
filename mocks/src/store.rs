use async_trait::async_trait;
use chrono::Utc;
use mcoda_core::repository::{TokenUsagePage, UsageFilter, UsageSummaryRow};
use mcoda_core::{
    Agent, AgentRunRating, Checkpoint, CommandRun, Epic, Job, JobState, McodaError, NewAgent,
    NewAgentRunRating, NewEpic, NewJob, NewProject, NewTask, NewTaskRun, NewTokenUsage,
    NewUserStory, Project, Task, TaskDependency, TaskFilter, TaskRun, TaskStatus,
    TelemetryConfig, TokenUsage, TrioState, UserStory, Validator, WorkspaceStore,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    projects: HashMap<i64, Project>,
    epics: HashMap<i64, Epic>,
    stories: HashMap<i64, UserStory>,
    tasks: HashMap<i64, Task>,
    dependencies: Vec<TaskDependency>,
    command_runs: HashMap<i64, CommandRun>,
    jobs: HashMap<String, Job>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    task_runs: HashMap<i64, Vec<TaskRun>>,
    token_usage: Vec<TokenUsage>,
    agents: HashMap<i64, Agent>,
    agent_run_ratings: Vec<AgentRunRating>,
    trio_states: HashMap<String, TrioState>,
    telemetry_config: TelemetryConfig,
    next_id: i64,
}

/// In-memory `WorkspaceStore` for engine/CLI unit tests. Single `Mutex`
/// guarding one `Inner`, in the spirit of the teacher's `MockTaskRepository`
/// but covering the full storage surface rather than one entity.
pub struct MockWorkspaceStore {
    inner: Mutex<Inner>,
}

impl Default for MockWorkspaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkspaceStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn next(inner: &mut Inner) -> i64 {
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }
}

#[async_trait]
impl WorkspaceStore for MockWorkspaceStore {
    async fn migrate(&self) -> Result<(), McodaError> {
        Ok(())
    }

    async fn create_project(&self, new: NewProject) -> Result<Project, McodaError> {
        Validator::validate_key(&new.key)?;
        let mut inner = self.inner.lock();
        if inner.projects.values().any(|p| p.key == new.key) {
            return Err(McodaError::DuplicateKey(new.key));
        }
        let id = Self::next(&mut inner);
        let now = Utc::now();
        let project = Project {
            id,
            key: new.key,
            name: new.name,
            created_at: now,
            updated_at: now,
        };
        inner.projects.insert(id, project.clone());
        Ok(project)
    }

    async fn get_project_by_key(&self, key: &str) -> Result<Project, McodaError> {
        self.inner
            .lock()
            .projects
            .values()
            .find(|p| p.key == key)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("project '{key}'")))
    }

    async fn create_epic(&self, new: NewEpic) -> Result<Epic, McodaError> {
        Validator::validate_key(&new.key)?;
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let epic = Epic {
            id,
            project_id: new.project_id,
            key: new.key,
            name: new.name,
            description: new.description,
            created_at: Utc::now(),
        };
        inner.epics.insert(id, epic.clone());
        Ok(epic)
    }

    async fn get_epic_by_key(&self, key: &str) -> Result<Epic, McodaError> {
        self.inner
            .lock()
            .epics
            .values()
            .find(|e| e.key == key)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("epic '{key}'")))
    }

    async fn create_user_story(&self, new: NewUserStory) -> Result<UserStory, McodaError> {
        Validator::validate_key(&new.key)?;
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let story = UserStory {
            id,
            project_id: new.project_id,
            epic_id: new.epic_id,
            key: new.key,
            name: new.name,
            description: new.description,
            created_at: Utc::now(),
        };
        inner.stories.insert(id, story.clone());
        Ok(story)
    }

    async fn get_user_story_by_key(&self, key: &str) -> Result<UserStory, McodaError> {
        self.inner
            .lock()
            .stories
            .values()
            .find(|s| s.key == key)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("user story '{key}'")))
    }

    async fn create_task(&self, new: NewTask) -> Result<Task, McodaError> {
        Validator::validate_new_task(&new)?;
        let mut inner = self.inner.lock();
        if inner.tasks.values().any(|t| t.key == new.key) {
            return Err(McodaError::DuplicateKey(new.key));
        }
        let id = Self::next(&mut inner);
        let now = Utc::now();
        let task = Task {
            id,
            project_id: new.project_id,
            epic_id: new.epic_id,
            story_id: new.story_id,
            key: new.key,
            name: new.name,
            description: new.description,
            status: TaskStatus::NotStarted,
            priority: new.priority,
            story_points: new.story_points,
            created_at: now,
            updated_at: now,
        };
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Task, McodaError> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("task #{id}")))
    }

    async fn get_task_by_key(&self, key: &str) -> Result<Task, McodaError> {
        self.inner
            .lock()
            .tasks
            .values()
            .find(|t| t.key == key)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("task '{key}'")))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, McodaError> {
        let inner = self.inner.lock();
        let statuses: Vec<TaskStatus> = if filter.status_filter.is_empty() {
            TaskFilter::default_statuses()
        } else {
            filter.status_filter.clone()
        };

        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                if let Some(ref keys) = filter.task_keys {
                    keys.contains(&t.key)
                } else {
                    statuses.contains(&t.status)
                }
            })
            .filter(|t| {
                filter
                    .project_key
                    .as_ref()
                    .map(|key| inner.projects.get(&t.project_id).map(|p| &p.key) == Some(key))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        if let Some(limit) = filter.limit {
            tasks.truncate(limit as usize);
        }
        Ok(tasks)
    }

    async fn set_task_status(
        &self,
        task_id: i64,
        new_status: TaskStatus,
    ) -> Result<Task, McodaError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| McodaError::not_found(format!("task #{task_id}")))?;
        if !task.status.can_transition_to(new_status) {
            return Err(McodaError::invalid_transition(task.status, new_status));
        }
        task.status = new_status;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn add_dependency(&self, dep: TaskDependency) -> Result<(), McodaError> {
        let mut inner = self.inner.lock();
        if !inner.dependencies.contains(&dep) {
            inner.dependencies.push(dep);
        }
        Ok(())
    }

    async fn list_dependencies(
        &self,
        task_ids: &[i64],
    ) -> Result<Vec<TaskDependency>, McodaError> {
        let ids: std::collections::HashSet<i64> = task_ids.iter().copied().collect();
        Ok(self
            .inner
            .lock()
            .dependencies
            .iter()
            .filter(|d| ids.contains(&d.from_task_id) || ids.contains(&d.to_task_id))
            .copied()
            .collect())
    }

    async fn create_command_run(
        &self,
        task_id: Option<i64>,
        job_id: Option<String>,
    ) -> Result<CommandRun, McodaError> {
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let run = CommandRun {
            id,
            task_id,
            job_id,
            created_at: Utc::now(),
        };
        inner.command_runs.insert(id, run.clone());
        Ok(run)
    }

    async fn create_job(&self, new: NewJob) -> Result<Job, McodaError> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&new.id) {
            return Err(McodaError::DuplicateKey(new.id));
        }
        let now = Utc::now();
        let job = Job {
            id: new.id.clone(),
            job_type: new.job_type,
            command_name: new.command_name,
            state: JobState::Queued,
            payload_json: new.payload_json,
            resume_supported: new.resume_supported,
            row_version: 1,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(new.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Job, McodaError> {
        self.inner
            .lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("job '{id}'")))
    }

    async fn transition_job(
        &self,
        id: &str,
        expected_row_version: i64,
        new_state: JobState,
    ) -> Result<Job, McodaError> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| McodaError::not_found(format!("job '{id}'")))?;
        if job.row_version != expected_row_version {
            return Err(McodaError::precondition(format!(
                "job '{id}' row_version mismatch: expected {expected_row_version}, was {}",
                job.row_version
            )));
        }
        job.state = new_state;
        job.row_version += 1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn list_jobs(&self, limit: Option<u32>) -> Result<Vec<Job>, McodaError> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit as usize);
        }
        Ok(jobs)
    }

    async fn append_checkpoint(
        &self,
        job_id: &str,
        stage: &str,
        details: serde_json::Value,
    ) -> Result<Checkpoint, McodaError> {
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let checkpoint = Checkpoint {
            id,
            job_id: job_id.to_string(),
            stage: stage.to_string(),
            timestamp: Utc::now(),
            details,
        };
        inner
            .checkpoints
            .entry(job_id.to_string())
            .or_default()
            .push(checkpoint.clone());

        if let Some(job) = inner.jobs.get_mut(job_id) {
            if job.state == JobState::Running {
                job.state = JobState::Checkpointing;
                job.row_version += 1;
                job.state = JobState::Running;
                job.row_version += 1;
                job.updated_at = Utc::now();
            }
        }
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, McodaError> {
        Ok(self
            .inner
            .lock()
            .checkpoints
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_task_run(&self, new: NewTaskRun) -> Result<TaskRun, McodaError> {
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let run = TaskRun {
            id,
            task_id: new.task_id,
            step: new.step,
            attempt: new.attempt,
            status: new.status,
            decision: new.decision,
            outcome: new.outcome,
            created_at: Utc::now(),
        };
        inner.task_runs.entry(new.task_id).or_default().push(run.clone());
        Ok(run)
    }

    async fn list_task_runs(&self, task_id: i64) -> Result<Vec<TaskRun>, McodaError> {
        Ok(self
            .inner
            .lock()
            .task_runs
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_token_usage(&self, new: NewTokenUsage) -> Result<TokenUsage, McodaError> {
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let usage = TokenUsage {
            id,
            workspace_id: new.workspace_id,
            project_id: new.project_id,
            agent_id: new.agent_id,
            job_id: new.job_id,
            command_run_id: new.command_run_id,
            task_id: new.task_id,
            prompt_tokens: new.prompt_tokens,
            completion_tokens: new.completion_tokens,
            total_tokens: new.total_tokens,
            cached_tokens: new.cached_tokens,
            cache_read_tokens: new.cache_read_tokens,
            cache_write_tokens: new.cache_write_tokens,
            duration_ms: new.duration_ms,
            duration_seconds: new.duration_seconds,
            cost_estimate: new.cost_estimate,
            action: new.action,
            invocation_kind: new.invocation_kind,
            provider: new.provider,
            currency: new.currency,
            model: new.model,
            timestamp: new.timestamp,
        };
        inner.token_usage.push(usage.clone());
        Ok(usage)
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
        let items = self.filtered_usage(filter);

        let mut buckets: HashMap<Vec<String>, UsageSummaryRow> = HashMap::new();
        for item in &items {
            let mut key = Vec::with_capacity(groups.len());
            for g in &groups {
                key.push(match g.as_str() {
                    "project" => item.project_id.map(|v| v.to_string()).unwrap_or_default(),
                    "agent" => item.agent_id.map(|v| v.to_string()).unwrap_or_default(),
                    "command" => item
                        .command_run_id
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    "day" => item.timestamp.format("%Y-%m-%d").to_string(),
                    "model" => item.model.clone().unwrap_or_default(),
                    "job" => item.job_id.clone().unwrap_or_default(),
                    "action" => item.action.clone().unwrap_or_default(),
                    other => {
                        return Err(McodaError::validation(
                            "group_by",
                            format!("unknown grouping dimension '{other}'"),
                        ))
                    }
                });
            }
            let entry = buckets.entry(key.clone()).or_insert_with(|| UsageSummaryRow {
                group_key: key,
                ..Default::default()
            });
            entry.prompt_tokens += item.prompt_tokens.unwrap_or(0);
            entry.completion_tokens += item.completion_tokens.unwrap_or(0);
            entry.total_tokens += item.total_tokens.unwrap_or(0);
            entry.cached_tokens += item.cached_tokens.unwrap_or(0);
            entry.cache_read_tokens += item.cache_read_tokens.unwrap_or(0);
            entry.cache_write_tokens += item.cache_write_tokens.unwrap_or(0);
            let duration_ms = item
                .duration_ms
                .or_else(|| item.duration_seconds.map(|s| (s * 1000.0) as i64))
                .unwrap_or(0);
            entry.duration_ms += duration_ms;
            if let Some(cost) = item.cost_estimate {
                entry.cost_estimate = Some(entry.cost_estimate.unwrap_or(0.0) + cost);
            }
            entry.calls += 1;
        }

        let mut rows: Vec<UsageSummaryRow> = buckets.into_values().collect();
        rows.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        Ok(rows)
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
        let mut items = self.filtered_usage(filter);
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let total = items.len() as u64;
        let start = ((page - 1) as usize) * page_size as usize;
        let page_items = items.into_iter().skip(start).take(page_size as usize).collect();
        Ok(TokenUsagePage {
            items: page_items,
            page,
            page_size,
            total,
        })
    }

    async fn create_agent(&self, new: NewAgent) -> Result<Agent, McodaError> {
        Validator::validate_new_agent(&new)?;
        let mut inner = self.inner.lock();
        if inner.agents.values().any(|a| a.slug == new.slug) {
            return Err(McodaError::DuplicateKey(new.slug));
        }
        let id = Self::next(&mut inner);
        let agent = Agent {
            id,
            slug: new.slug,
            adapter: new.adapter,
            default_model: new.default_model,
            capabilities: new.capabilities,
            rating: 5.0,
            reasoning_rating: 5.0,
            rating_samples: 0,
            max_complexity: new.max_complexity,
            complexity_updated_at: None,
            cost_per_million: new.cost_per_million,
            reachable: true,
        };
        inner.agents.insert(id, agent.clone());
        Ok(agent)
    }

    async fn get_agent_by_slug(&self, slug: &str) -> Result<Agent, McodaError> {
        self.inner
            .lock()
            .agents
            .values()
            .find(|a| a.slug == slug)
            .cloned()
            .ok_or_else(|| McodaError::not_found(format!("agent '{slug}'")))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, McodaError> {
        Ok(self.inner.lock().agents.values().cloned().collect())
    }

    async fn update_agent_rating(
        &self,
        agent_id: i64,
        rating: f64,
        reasoning_rating: f64,
    ) -> Result<Agent, McodaError> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| McodaError::not_found(format!("agent #{agent_id}")))?;
        agent.rating = rating;
        agent.reasoning_rating = reasoning_rating;
        agent.rating_samples += 1;
        Ok(agent.clone())
    }

    async fn update_agent_complexity(
        &self,
        agent_id: i64,
        max_complexity: i32,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Agent, McodaError> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| McodaError::not_found(format!("agent #{agent_id}")))?;
        agent.max_complexity = max_complexity;
        agent.complexity_updated_at = Some(updated_at);
        Ok(agent.clone())
    }

    async fn record_agent_run_rating(
        &self,
        new: NewAgentRunRating,
    ) -> Result<AgentRunRating, McodaError> {
        let mut inner = self.inner.lock();
        let id = Self::next(&mut inner);
        let rating = AgentRunRating {
            id,
            agent_id: new.agent_id,
            job_id: new.job_id,
            task_id: new.task_id,
            quality_score: new.quality_score,
            total_cost: new.total_cost,
            duration_seconds: new.duration_seconds,
            iterations: new.iterations,
            run_score: new.run_score,
            created_at: Utc::now(),
        };
        inner.agent_run_ratings.push(rating.clone());
        Ok(rating)
    }

    async fn load_trio_state(&self, job_id: &str) -> Result<Option<TrioState>, McodaError> {
        Ok(self.inner.lock().trio_states.get(job_id).cloned())
    }

    async fn save_trio_state(&self, state: &TrioState) -> Result<(), McodaError> {
        self.inner
            .lock()
            .trio_states
            .insert(state.job_id.clone(), state.clone());
        Ok(())
    }

    async fn get_telemetry_config(&self) -> Result<TelemetryConfig, McodaError> {
        Ok(self.inner.lock().telemetry_config)
    }

    async fn set_telemetry_config(&self, config: TelemetryConfig) -> Result<(), McodaError> {
        let mut config = config;
        if config.strict {
            config.local_recording = false;
        }
        self.inner.lock().telemetry_config = config;
        Ok(())
    }
}

impl MockWorkspaceStore {
    fn filtered_usage(&self, filter: &UsageFilter) -> Vec<TokenUsage> {
        self.inner
            .lock()
            .token_usage
            .iter()
            .filter(|u| {
                filter
                    .workspace_id
                    .as_ref()
                    .map(|w| &u.workspace_id == w)
                    .unwrap_or(true)
            })
            .filter(|u| filter.project_id.map(|p| u.project_id == Some(p)).unwrap_or(true))
            .filter(|u| filter.agent_id.map(|a| u.agent_id == Some(a)).unwrap_or(true))
            .filter(|u| {
                filter
                    .job_id
                    .as_ref()
                    .map(|j| u.job_id.as_deref() == Some(j.as_str()))
                    .unwrap_or(true)
            })
            .filter(|u| filter.since.map(|s| u.timestamp >= s).unwrap_or(true))
            .filter(|u| filter.until.map(|until| u.timestamp <= until).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_task_round_trips() {
        let store = MockWorkspaceStore::new();
        let task = store
            .create_task(NewTask {
                project_id: 1,
                epic_id: 1,
                story_id: 1,
                key: "T01".into(),
                name: "name".into(),
                description: "desc".into(),
                priority: 5.0,
                story_points: None,
            })
            .await
            .unwrap();
        let fetched = store.get_task_by_key("T01").await.unwrap();
        assert_eq!(task.id, fetched.id);
    }

    #[tokio::test]
    async fn duplicate_task_key_is_rejected() {
        let store = MockWorkspaceStore::new();
        let new = NewTask {
            project_id: 1,
            epic_id: 1,
            story_id: 1,
            key: "T01".into(),
            name: "name".into(),
            description: "desc".into(),
            priority: 5.0,
            story_points: None,
        };
        store.create_task(new.clone()).await.unwrap();
        let err = store.create_task(new).await.unwrap_err();
        assert!(matches!(err, McodaError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn job_row_version_cas_rejects_stale_callers() {
        let store = MockWorkspaceStore::new();
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
        store
            .transition_job(&job.id, job.row_version, JobState::Running)
            .await
            .unwrap();
        let err = store
            .transition_job(&job.id, job.row_version, JobState::Paused)
            .await
            .unwrap_err();
        assert!(matches!(err, McodaError::PreconditionFailed { .. }));
    }
}
