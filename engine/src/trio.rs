use crate::gateway::{GatewayAgent, GatewayPromptContext};
use crate::job_runtime::JobRuntime;
use crate::rating::{AgentRatingService, Budget, RunMeasurement};
use crate::router::{AgentRouter, RoutingRequest};
use crate::selector::TaskSelector;
use chrono::Utc;
use mcoda_core::{
    Agent, AgentAdapter, CancellationToken, InvokeInput, Job, JobState, McodaError, NewTaskRun,
    RouterRng, Step, Task, TaskFilter, TaskProgress, TaskProgressStatus, TaskRunStatus,
    TaskStatus, TrioState, WorkspaceStore,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Resolves a concrete `AgentAdapter` by registry slug. Engine callers supply
/// a `HashMapAdapterRegistry`; tests supply whatever shape is convenient.
pub trait AdapterRegistry: Send + Sync {
    fn get(&self, slug: &str) -> Option<&dyn AgentAdapter>;
}

/// `AdapterRegistry` backed by a plain map, the production shape: one
/// `StubAgentAdapter`/concrete-adapter instance per registered agent slug.
pub struct HashMapAdapterRegistry {
    adapters: HashMap<String, Box<dyn AgentAdapter>>,
}

impl HashMapAdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn insert(&mut self, adapter: Box<dyn AgentAdapter>) {
        self.adapters.insert(adapter.slug().to_string(), adapter);
    }
}

impl Default for HashMapAdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry for HashMapAdapterRegistry {
    fn get(&self, slug: &str) -> Option<&dyn AgentAdapter> {
        self.adapters.get(slug).map(|b| b.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct TrioEngineConfig {
    pub max_iterations: i32,
    pub max_cycles: i32,
    pub no_commit: bool,
    pub dry_run: bool,
}

impl Default for TrioEngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_cycles: 5,
            no_commit: false,
            dry_run: false,
        }
    }
}

/// Outcome of one finished job run, per spec.md §4.8's termination rule.
#[derive(Debug, Clone)]
pub struct TrioRunResult {
    pub job: Job,
    pub trio_state: TrioState,
    pub error_summary: Option<String>,
}

/// Drives tasks through the Work → Review → QA ladder, one job at a time.
/// The centerpiece component: composes `TaskSelector`, `GatewayAgent`,
/// `AgentRouter`, and `AgentRatingService` around a durable `TrioState`.
pub struct TrioEngine<'a> {
    store: &'a dyn WorkspaceStore,
    runtime: JobRuntime<'a>,
    router: AgentRouter,
    gateway_adapter: &'a dyn AgentAdapter,
    adapters: &'a dyn AdapterRegistry,
}

impl<'a> TrioEngine<'a> {
    pub fn new(
        store: &'a dyn WorkspaceStore,
        runtime: JobRuntime<'a>,
        gateway_adapter: &'a dyn AgentAdapter,
        adapters: &'a dyn AdapterRegistry,
    ) -> Self {
        Self {
            store,
            runtime,
            router: AgentRouter::default(),
            gateway_adapter,
            adapters,
        }
    }

    pub async fn run(
        &self,
        job_id: &str,
        filter: &TaskFilter,
        config: &TrioEngineConfig,
        rng: &mut dyn RouterRng,
        cancel: &CancellationToken,
    ) -> Result<TrioRunResult, McodaError> {
        let mut trio_state = self
            .store
            .load_trio_state(job_id)
            .await?
            .unwrap_or_else(|| TrioState::new(job_id.to_string()));

        let job = self.store.get_job(job_id).await?;
        if job.state == JobState::Queued {
            self.runtime.transition(job_id, job.row_version, JobState::Running).await?;
        }

        let selector = TaskSelector::new(self.store);
        let explicit_keys: Vec<String> = filter.task_keys.clone().unwrap_or_default();
        let mut cancelled = false;

        'cycles: for _cycle in 0..config.max_cycles {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            trio_state.cycle += 1;
            let selection = selector.select(filter).await?;

            for task in &selection.blocked {
                let progress = trio_state
                    .tasks
                    .entry(task.key.clone())
                    .or_insert_with(|| TaskProgress::new(task.key.clone()));
                if is_terminal_progress(progress.status) {
                    continue;
                }
                if !explicit_keys.contains(&task.key) {
                    progress.status = TaskProgressStatus::Skipped;
                    progress.last_error = Some("dependency_blocked".into());
                }
            }
            self.store.save_trio_state(&trio_state).await?;

            let mut attempted_any = false;

            for task in &selection.ordered {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'cycles;
                }

                if task.status.is_terminal() {
                    continue;
                }
                let already_terminal = trio_state
                    .tasks
                    .get(&task.key)
                    .map(|p| is_terminal_progress(p.status))
                    .unwrap_or(false);
                if already_terminal {
                    continue;
                }

                let progress = trio_state
                    .tasks
                    .entry(task.key.clone())
                    .or_insert_with(|| TaskProgress::new(task.key.clone()));

                if progress.attempts >= config.max_iterations {
                    progress.status = TaskProgressStatus::Failed;
                    progress.last_error = Some("max_iterations_reached".into());
                    self.store.save_trio_state(&trio_state).await?;
                    continue;
                }

                attempted_any = true;
                progress.attempts += 1;
                let attempt = progress.attempts;

                let outcome = self
                    .run_step_ladder(job_id, task, attempt, config, rng, cancel)
                    .await?;

                // Persisted right after this task's ladder finishes (rather than
                // once per cycle) so a crash between tasks loses at most the
                // in-flight task's progress, matching the per-step Checkpoint
                // cadence — spec.md §5/§8's TrioState atomicity invariant.
                let progress = trio_state.tasks.get_mut(&task.key).expect("just inserted above");
                apply_ladder_outcome(progress, outcome);
                self.store.save_trio_state(&trio_state).await?;
            }

            let all_terminal = trio_state.tasks.values().all(|p| is_terminal_progress(p.status));
            if all_terminal || !attempted_any {
                break;
            }
        }

        let all_completed = trio_state
            .tasks
            .values()
            .all(|p| p.status == TaskProgressStatus::Completed);
        let final_state = if cancelled {
            JobState::Cancelled
        } else if all_completed && !trio_state.tasks.is_empty() {
            JobState::Completed
        } else {
            JobState::Partial
        };

        let error_summary = if final_state == JobState::Partial || final_state == JobState::Cancelled {
            Some(summarize_errors(&trio_state))
        } else {
            None
        };

        let job = self.store.get_job(job_id).await?;
        let job = self.runtime.transition(job_id, job.row_version, final_state).await?;

        Ok(TrioRunResult {
            job,
            trio_state,
            error_summary,
        })
    }

    /// Runs Work, then (if it succeeded) Review, then (if that succeeded) QA,
    /// stopping at the first non-`Succeeded` outcome. Checkpoints after every
    /// step, per spec.md §4.8's cadence rule.
    async fn run_step_ladder(
        &self,
        job_id: &str,
        task: &Task,
        attempt: i32,
        config: &TrioEngineConfig,
        rng: &mut dyn RouterRng,
        cancel: &CancellationToken,
    ) -> Result<LadderOutcome, McodaError> {
        let work = self.run_step(job_id, task, Step::Work, attempt, config, rng, cancel).await?;
        self.checkpoint_step(job_id, task, attempt, Step::Work, &work).await?;
        if work.status != TaskRunStatus::Succeeded {
            return Ok(LadderOutcome { last_step: Step::Work, result: work });
        }
        if !config.dry_run {
            let _ = self.store.set_task_status(task.id, TaskStatus::ReadyToReview).await;
        }

        let review = self.run_step(job_id, task, Step::Review, attempt, config, rng, cancel).await?;
        self.checkpoint_step(job_id, task, attempt, Step::Review, &review).await?;
        if review.status != TaskRunStatus::Succeeded {
            return Ok(LadderOutcome { last_step: Step::Review, result: review });
        }
        if !config.dry_run {
            let _ = self.store.set_task_status(task.id, TaskStatus::ReadyToQa).await;
        }

        let qa = self.run_step(job_id, task, Step::Qa, attempt, config, rng, cancel).await?;
        self.checkpoint_step(job_id, task, attempt, Step::Qa, &qa).await?;
        if qa.status == TaskRunStatus::Succeeded && !config.dry_run {
            let _ = self.store.set_task_status(task.id, TaskStatus::Completed).await;
        }
        Ok(LadderOutcome { last_step: Step::Qa, result: qa })
    }

    async fn run_step(
        &self,
        _job_id: &str,
        task: &Task,
        step: Step,
        attempt: i32,
        _config: &TrioEngineConfig,
        rng: &mut dyn RouterRng,
        cancel: &CancellationToken,
    ) -> Result<StepResult, McodaError> {
        if cancel.is_cancelled() {
            return Ok(StepResult {
                status: TaskRunStatus::Failed,
                decision: None,
                outcome: None,
                error: Some(McodaError::Cancelled { reason: "cancelled before step start".into() }.to_string()),
                agent_slug: String::new(),
            });
        }

        let gateway = GatewayAgent::new(self.gateway_adapter);
        let analysis = gateway.analyze(task, &GatewayPromptContext::default()).await?;

        let agents = self.store.list_agents().await?;
        let required_caps = vec![discipline_capability(&analysis.discipline)];
        let request = RoutingRequest {
            complexity: analysis.complexity,
            required_capabilities: &required_caps,
            preferred_capabilities: &[],
            avoid_agents: &[],
        };
        let decision = self.router.select(&agents, &request, rng)?;

        let adapter = self.adapters.get(&decision.agent.slug).ok_or_else(|| McodaError::AgentUnreachable {
            agent: decision.agent.slug.clone(),
            reason: "no adapter registered for this slug".into(),
        })?;

        let prompt = format!("Task {} step {} (attempt {})", task.key, step, attempt);
        let input = InvokeInput {
            prompt,
            model: None,
            metadata: Default::default(),
        };
        // Each suspension point is cancelable via the token propagated from
        // the CLI (spec.md §5): if cancellation wins the race, the in-flight
        // step is recorded as failed with reason "cancelled" rather than
        // waiting for the adapter to return.
        let invocation = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(McodaError::Cancelled { reason: "cancelled during agent invocation".into() }),
            result = adapter.invoke(input) => result,
        };

        let (status, decision_str, outcome_str, error) = match invocation {
            Ok(output) => classify(step, &output.output),
            Err(e) => (TaskRunStatus::Failed, None, None, Some(e.to_string())),
        };

        self.store
            .create_task_run(NewTaskRun {
                task_id: task.id,
                step,
                attempt,
                status,
                decision: decision_str.clone(),
                outcome: outcome_str.clone(),
            })
            .await?;

        self.rate_if_terminal(&decision.agent, &analysis.complexity, status, job_quality_hint(status)).await;

        Ok(StepResult {
            status,
            decision: decision_str,
            outcome: outcome_str,
            error,
            agent_slug: decision.agent.slug,
        })
    }

    async fn rate_if_terminal(&self, agent: &Agent, complexity: &i32, status: TaskRunStatus, quality_hint: f64) {
        if status != TaskRunStatus::Succeeded && status != TaskRunStatus::Failed {
            return;
        }
        let budget = Budget::from_complexity(*complexity, 1.0, 120.0, 1.0);
        let measurement = RunMeasurement {
            quality_score: quality_hint,
            total_cost: 0.0,
            duration_seconds: 0.0,
            iterations: 1,
        };
        let rating_service = AgentRatingService::new(self.store);
        let _ = rating_service
            .finalize_run(agent, &measurement, quality_hint, *complexity, None, None, &budget, Utc::now())
            .await;
    }

    async fn checkpoint_step(
        &self,
        job_id: &str,
        task: &Task,
        attempt: i32,
        step: Step,
        result: &StepResult,
    ) -> Result<(), McodaError> {
        let stage = format!("task:{}:{}", task.key, step);
        let details = serde_json::json!({
            "attempt": attempt,
            "status": result.status,
            "decision": result.decision,
            "outcome": result.outcome,
            "error": result.error,
            "agent": result.agent_slug,
        });
        self.runtime.checkpoint(job_id, &stage, details).await?;
        if matches!(result.status, TaskRunStatus::Succeeded | TaskRunStatus::Failed) {
            info!(task = %task.key, %step, status = ?result.status, "trio step finished");
        } else {
            warn!(task = %task.key, %step, status = ?result.status, "trio step blocked or skipped");
        }
        Ok(())
    }
}

fn job_quality_hint(status: TaskRunStatus) -> f64 {
    match status {
        TaskRunStatus::Succeeded => 8.0,
        TaskRunStatus::Failed => 3.0,
        _ => 5.0,
    }
}

fn discipline_capability(discipline: &crate::gateway::Discipline) -> String {
    serde_json::to_value(discipline)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "code".to_string())
}

struct StepResult {
    status: TaskRunStatus,
    decision: Option<String>,
    outcome: Option<String>,
    error: Option<String>,
    agent_slug: String,
}

struct LadderOutcome {
    last_step: Step,
    result: StepResult,
}

fn apply_ladder_outcome(progress: &mut TaskProgress, ladder: LadderOutcome) {
    progress.last_step = Some(ladder.last_step);
    progress.last_decision = ladder.result.decision;
    progress.last_outcome = ladder.result.outcome;
    match ladder.result.status {
        TaskRunStatus::Succeeded if ladder.last_step == Step::Qa => {
            progress.status = TaskProgressStatus::Completed;
        }
        TaskRunStatus::Blocked => {
            progress.status = TaskProgressStatus::Blocked;
            progress.last_error = ladder.result.error.or(Some("blocked".into()));
        }
        TaskRunStatus::Skipped => {
            progress.status = TaskProgressStatus::Skipped;
            progress.last_error = ladder.result.error.or(Some("executor_skipped".into()));
        }
        TaskRunStatus::Failed => {
            progress.last_error = ladder.result.error.or(Some("step_failed".into()));
            // stays pending; the next cycle re-attempts from the work step
        }
        _ => {}
    }
}

/// Maps an executor/review/QA signal string to a `TaskRunStatus`, per the
/// outcome table in spec.md §4.8.
fn classify(step: Step, raw: &str) -> (TaskRunStatus, Option<String>, Option<String>, Option<String>) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return (TaskRunStatus::Failed, None, None, Some("unparseable step output".into())),
    };

    match step {
        Step::Work => {
            let result = value.get("result").and_then(Value::as_str).unwrap_or("failed");
            let status = match result {
                "succeeded" => TaskRunStatus::Succeeded,
                "blocked" => TaskRunStatus::Blocked,
                "skipped" => TaskRunStatus::Skipped,
                _ => TaskRunStatus::Failed,
            };
            let error = value.get("error").and_then(Value::as_str).map(str::to_string);
            (status, None, Some(result.to_string()), error)
        }
        Step::Review => {
            let decision = value.get("decision").and_then(Value::as_str).unwrap_or("revise");
            let status = match decision {
                "approve" => TaskRunStatus::Succeeded,
                "block" => TaskRunStatus::Blocked,
                _ => TaskRunStatus::Failed,
            };
            (status, Some(decision.to_string()), None, None)
        }
        Step::Qa => {
            let outcome = value.get("outcome").and_then(Value::as_str).unwrap_or("fix_required");
            let status = match outcome {
                "pass" => TaskRunStatus::Succeeded,
                "infra_issue" => TaskRunStatus::Blocked,
                _ => TaskRunStatus::Failed,
            };
            (status, None, Some(outcome.to_string()), None)
        }
    }
}

fn is_terminal_progress(status: TaskProgressStatus) -> bool {
    matches!(
        status,
        TaskProgressStatus::Completed | TaskProgressStatus::Blocked | TaskProgressStatus::Failed | TaskProgressStatus::Skipped
    )
}

fn summarize_errors(state: &TrioState) -> String {
    let failing: Vec<String> = state
        .tasks
        .values()
        .filter(|p| p.status != TaskProgressStatus::Completed)
        .map(|p| {
            format!(
                "{}: {}",
                p.task_key,
                p.last_error.clone().unwrap_or_else(|| format!("{:?}", p.status))
            )
        })
        .collect();
    failing.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_core::{NewAgent, NewTask};
    use mcoda_mocks::{MockWorkspaceStore, StubAgentAdapter};

    async fn seed_task(store: &MockWorkspaceStore, key: &str) -> Task {
        store
            .create_task(NewTask {
                project_id: 1,
                epic_id: 1,
                story_id: 1,
                key: key.to_string(),
                name: key.to_string(),
                description: "d".into(),
                priority: 5.0,
                story_points: None,
            })
            .await
            .unwrap()
    }

    async fn seed_agent(store: &MockWorkspaceStore, slug: &str) -> Agent {
        store
            .create_agent(NewAgent {
                slug: slug.to_string(),
                adapter: "stub".into(),
                default_model: "model-x".into(),
                capabilities: vec!["code".into()],
                cost_per_million: 1.0,
                max_complexity: 8,
            })
            .await
            .unwrap()
    }

    struct FixedRng;
    impl RouterRng for FixedRng {
        fn next_f64(&mut self) -> f64 {
            0.99
        }
    }

    fn gateway_json() -> String {
        serde_json::json!({
            "summary": "s",
            "filesLikelyTouched": [],
            "filesToCreate": [],
            "complexity": 3,
            "plan": ["p"],
            "discipline": "code",
        })
        .to_string()
    }

    #[tokio::test]
    async fn happy_trio_completes_both_tasks() {
        let store = MockWorkspaceStore::new();
        seed_task(&store, "T01").await;
        seed_task(&store, "T02").await;
        seed_agent(&store, "agent-a").await;

        let workspace = tempfile::TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({}), true)
            .await
            .unwrap();

        let gateway_adapter = StubAgentAdapter::new("gateway", "model-x");
        for _ in 0..6 {
            gateway_adapter.push_output(gateway_json());
        }
        let mut registry = HashMapAdapterRegistry::new();
        let worker = StubAgentAdapter::new("agent-a", "model-x");
        for _ in 0..6 {
            worker.push_output(serde_json::json!({"result": "succeeded"}).to_string());
        }
        worker.push_output(serde_json::json!({"decision": "approve"}).to_string());
        worker.push_output(serde_json::json!({"decision": "approve"}).to_string());
        worker.push_output(serde_json::json!({"outcome": "pass"}).to_string());
        worker.push_output(serde_json::json!({"outcome": "pass"}).to_string());
        registry.insert(Box::new(worker));

        let engine = TrioEngine::new(&store, runtime, &gateway_adapter, &registry);
        let mut rng = FixedRng;
        let result = engine
            .run(&job.id, &TaskFilter::default(), &TrioEngineConfig::default(), &mut rng, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.job.state, JobState::Completed);
        assert!(result
            .trio_state
            .tasks
            .values()
            .all(|p| p.status == TaskProgressStatus::Completed));
    }

    #[tokio::test]
    async fn retry_budget_fails_after_max_iterations() {
        let store = MockWorkspaceStore::new();
        seed_task(&store, "T01").await;
        seed_agent(&store, "agent-a").await;

        let workspace = tempfile::TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({}), true)
            .await
            .unwrap();

        let gateway_adapter = StubAgentAdapter::new("gateway", "model-x");
        for _ in 0..4 {
            gateway_adapter.push_output(gateway_json());
        }
        let mut registry = HashMapAdapterRegistry::new();
        let worker = StubAgentAdapter::new("agent-a", "model-x");
        worker.push_output(serde_json::json!({"result": "failed"}).to_string());
        worker.push_output(serde_json::json!({"result": "failed"}).to_string());
        registry.insert(Box::new(worker));

        let engine = TrioEngine::new(&store, runtime, &gateway_adapter, &registry);
        let mut rng = FixedRng;
        let config = TrioEngineConfig {
            max_iterations: 2,
            ..Default::default()
        };
        let result = engine
            .run(&job.id, &TaskFilter::default(), &config, &mut rng, &CancellationToken::new())
            .await
            .unwrap();

        let progress = &result.trio_state.tasks["T01"];
        assert_eq!(progress.status, TaskProgressStatus::Failed);
        assert_eq!(progress.last_error.as_deref(), Some("max_iterations_reached"));
        assert_eq!(progress.attempts, 2);
    }

    #[tokio::test]
    async fn resumed_run_skips_already_completed_task() {
        let store = MockWorkspaceStore::new();
        seed_task(&store, "T01").await;
        seed_task(&store, "T02").await;
        seed_agent(&store, "agent-a").await;

        let workspace = tempfile::TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({}), true)
            .await
            .unwrap();

        // Simulate a prior run that already finished T01: a TrioState with
        // one terminal task, persisted the way a checkpointed-then-paused
        // job would leave it, with no checkpoint taken for T01 this time.
        let mut prior_state = TrioState::new(job.id.clone());
        let mut t01_progress = TaskProgress::new("T01");
        t01_progress.status = TaskProgressStatus::Completed;
        t01_progress.attempts = 1;
        prior_state.tasks.insert("T01".to_string(), t01_progress);
        store.save_trio_state(&prior_state).await.unwrap();

        let gateway_adapter = StubAgentAdapter::new("gateway", "model-x");
        for _ in 0..3 {
            gateway_adapter.push_output(gateway_json());
        }
        let mut registry = HashMapAdapterRegistry::new();
        let worker = StubAgentAdapter::new("agent-a", "model-x");
        worker.push_output(serde_json::json!({"result": "succeeded"}).to_string());
        worker.push_output(serde_json::json!({"decision": "approve"}).to_string());
        worker.push_output(serde_json::json!({"outcome": "pass"}).to_string());
        registry.insert(Box::new(worker));

        let engine = TrioEngine::new(&store, runtime, &gateway_adapter, &registry);
        let mut rng = FixedRng;
        let result = engine
            .run(&job.id, &TaskFilter::default(), &TrioEngineConfig::default(), &mut rng, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.job.state, JobState::Completed);
        assert_eq!(result.trio_state.tasks["T01"].attempts, 1, "T01 was not re-run");
        assert_eq!(result.trio_state.tasks["T02"].status, TaskProgressStatus::Completed);
    }

    /// Wraps a `StubAgentAdapter` and trips the shared `CancellationToken`
    /// after a fixed number of invocations, simulating an operator cancelling
    /// the job right as one task's ladder finishes and the next is about to
    /// start — the scenario the atomicity invariant has to survive.
    struct CancelAfterAdapter {
        inner: mcoda_mocks::StubAgentAdapter,
        cancel: CancellationToken,
        remaining: std::sync::atomic::AtomicUsize,
    }

    impl CancelAfterAdapter {
        fn new(inner: mcoda_mocks::StubAgentAdapter, cancel: CancellationToken, after_calls: usize) -> Self {
            Self {
                inner,
                cancel,
                remaining: std::sync::atomic::AtomicUsize::new(after_calls),
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentAdapter for CancelAfterAdapter {
        fn slug(&self) -> &str {
            self.inner.slug()
        }

        async fn invoke(&self, input: InvokeInput) -> Result<mcoda_core::InvokeOutput, McodaError> {
            let output = self.inner.invoke(input).await;
            if self.remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                self.cancel.cancel();
            }
            output
        }

        async fn health_check(&self) -> Result<mcoda_core::HealthStatus, McodaError> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn cancelling_mid_cycle_persists_the_finished_tasks_progress() {
        let store = MockWorkspaceStore::new();
        seed_task(&store, "T01").await;
        seed_task(&store, "T02").await;
        seed_agent(&store, "agent-a").await;

        let workspace = tempfile::TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({}), true)
            .await
            .unwrap();

        let gateway_adapter = StubAgentAdapter::new("gateway", "model-x");
        for _ in 0..3 {
            gateway_adapter.push_output(gateway_json());
        }

        let cancel = CancellationToken::new();
        let worker = StubAgentAdapter::new("agent-a", "model-x");
        worker.push_output(serde_json::json!({"result": "succeeded"}).to_string());
        worker.push_output(serde_json::json!({"decision": "approve"}).to_string());
        worker.push_output(serde_json::json!({"outcome": "pass"}).to_string());
        // Trips `cancel` right after T01's 3rd (QA) call completes, before
        // T02 is ever attempted.
        let worker = CancelAfterAdapter::new(worker, cancel.clone(), 3);
        let mut registry = HashMapAdapterRegistry::new();
        registry.insert(Box::new(worker));

        let engine = TrioEngine::new(&store, runtime, &gateway_adapter, &registry);
        let mut rng = FixedRng;
        let result = engine
            .run(&job.id, &TaskFilter::default(), &TrioEngineConfig::default(), &mut rng, &cancel)
            .await
            .unwrap();

        assert_eq!(result.job.state, JobState::Cancelled);
        assert_eq!(result.trio_state.tasks["T01"].status, TaskProgressStatus::Completed);
        assert!(
            !result.trio_state.tasks.contains_key("T02"),
            "T02 should never have been attempted"
        );

        // The durable store, not just the in-memory result, must reflect T01
        // as finished: this is the crash-recovery property spec.md §8 names.
        let reloaded = store.load_trio_state(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.tasks["T01"].status, TaskProgressStatus::Completed);
        assert!(!reloaded.tasks.contains_key("T02"));
    }
}
