use chrono::Utc;
use mcoda_core::{Checkpoint, Job, JobState, McodaError, NewJob, WorkspaceStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

/// On-disk layout for one job's artifacts under
/// `<workspace>/.mcoda/jobs/<jobId>/`, per spec.md §6.
#[derive(Debug, Clone)]
pub struct JobArtifacts {
    root: PathBuf,
}

impl JobArtifacts {
    pub fn new(workspace_root: &Path, job_id: &str) -> Self {
        Self {
            root: workspace_root.join(".mcoda").join("jobs").join(job_id),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.root.join("checkpoints.jsonl")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    pub fn trio_state_path(&self) -> PathBuf {
        self.root.join("gateway-trio").join("state.json")
    }

    pub fn handoffs_dir(&self) -> PathBuf {
        self.root.join("gateway-trio").join("handoffs")
    }

    pub fn rating_path(&self) -> PathBuf {
        self.root.join("rating.json")
    }

    fn ensure_dirs(&self) -> Result<(), McodaError> {
        std::fs::create_dir_all(&self.root).map_err(io_err)?;
        std::fs::create_dir_all(self.handoffs_dir()).map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> McodaError {
    McodaError::Fatal(format!("job artifact I/O failed: {e}"))
}

/// `manifest.json` contents, checked on resume against the stored job row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobManifest {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub command_name: String,
    pub created_at: chrono::DateTime<Utc>,
}

/// Owns the job lifecycle: creation, checkpoint writes, cancellation, and
/// resume-precondition checking, per spec.md §4.7.
pub struct JobRuntime<'a> {
    store: &'a dyn WorkspaceStore,
    workspace_root: PathBuf,
}

impl<'a> JobRuntime<'a> {
    pub fn new(store: &'a dyn WorkspaceStore, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            workspace_root: workspace_root.into(),
        }
    }

    pub async fn create(
        &self,
        job_type: impl Into<String>,
        command_name: impl Into<String>,
        payload_json: Value,
        resume_supported: bool,
    ) -> Result<Job, McodaError> {
        let job_type = job_type.into();
        let command_name = command_name.into();
        let id = uuid::Uuid::new_v4().to_string();

        let job = self
            .store
            .create_job(NewJob {
                id: id.clone(),
                job_type: job_type.clone(),
                command_name: command_name.clone(),
                payload_json,
                resume_supported,
            })
            .await?;

        let artifacts = JobArtifacts::new(&self.workspace_root, &id);
        artifacts.ensure_dirs()?;
        let manifest = JobManifest {
            id: id.clone(),
            job_type,
            command_name,
            created_at: job.created_at,
        };
        std::fs::write(
            artifacts.manifest_path(),
            serde_json::to_vec_pretty(&manifest).map_err(|e| McodaError::Fatal(e.to_string()))?,
        )
        .map_err(io_err)?;

        info!(job_id = %job.id, "job created");
        Ok(job)
    }

    pub async fn transition(
        &self,
        job_id: &str,
        expected_row_version: i64,
        new_state: JobState,
    ) -> Result<Job, McodaError> {
        self.store.transition_job(job_id, expected_row_version, new_state).await
    }

    /// Appends to the durable checkpoint log and cycles the job through
    /// `checkpointing` per spec.md §4.7, mirroring the write to
    /// `checkpoints.jsonl` on disk.
    pub async fn checkpoint(
        &self,
        job_id: &str,
        stage: &str,
        details: Value,
    ) -> Result<Checkpoint, McodaError> {
        let checkpoint = self.store.append_checkpoint(job_id, stage, details).await?;

        let artifacts = JobArtifacts::new(&self.workspace_root, job_id);
        artifacts.ensure_dirs()?;
        let line = serde_json::to_string(&checkpoint).map_err(|e| McodaError::Fatal(e.to_string()))?;
        append_line(&artifacts.checkpoints_path(), &line)?;

        Ok(checkpoint)
    }

    /// Cancel is allowed from `{queued, running, checkpointing, paused}`;
    /// `force` additionally allows cancelling from a terminal state, purely
    /// for auditing (the job row already reflects its real outcome).
    pub async fn cancel(&self, job_id: &str, force: bool) -> Result<Job, McodaError> {
        let job = self.store.get_job(job_id).await?;
        if !job.state.is_cancelable() && !force {
            return Err(McodaError::precondition(format!(
                "job '{job_id}' is in terminal state '{}' and cannot be cancelled without --force",
                job.state
            )));
        }
        self.store.transition_job(job_id, job.row_version, JobState::Cancelled).await
    }

    /// Checks the four resume preconditions from spec.md §4.7 and returns the
    /// merged payload (caller overrides win for non-null fields) the trio
    /// engine should resume with.
    pub async fn resume_preconditions(
        &self,
        job_id: &str,
        overrides: Value,
    ) -> Result<(Job, Value), McodaError> {
        let job = self.store.get_job(job_id).await?;
        if !job.state.is_resumable_state() {
            return Err(McodaError::ResumeNotAllowed {
                job_id: job_id.to_string(),
                reason: format!("job is in state '{}', not {{paused, failed, partial}}", job.state),
            });
        }
        if !job.resume_supported {
            return Err(McodaError::ResumeNotAllowed {
                job_id: job_id.to_string(),
                reason: "job does not support resume".into(),
            });
        }

        let artifacts = JobArtifacts::new(&self.workspace_root, job_id);
        let manifest_bytes = std::fs::read(artifacts.manifest_path()).map_err(|_| McodaError::ResumeNotAllowed {
            job_id: job_id.to_string(),
            reason: "manifest.json is missing".into(),
        })?;
        let manifest: JobManifest = serde_json::from_slice(&manifest_bytes).map_err(|_| McodaError::ResumeNotAllowed {
            job_id: job_id.to_string(),
            reason: "manifest.json is corrupt".into(),
        })?;
        if manifest.id != job.id || manifest.job_type != job.job_type || manifest.command_name != job.command_name {
            return Err(McodaError::ResumeNotAllowed {
                job_id: job_id.to_string(),
                reason: "manifest does not match the job record".into(),
            });
        }

        let checkpoints = self.store.list_checkpoints(job_id).await?;
        if checkpoints.is_empty() {
            return Err(McodaError::ResumeNotAllowed {
                job_id: job_id.to_string(),
                reason: "no checkpoint recorded for this job".into(),
            });
        }

        let merged = merge_payload(job.payload_json.clone(), overrides);
        Ok((job, merged))
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), McodaError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    writeln!(file, "{line}").map_err(io_err)
}

/// Merges `overrides` into `base`; a key present and non-null in `overrides`
/// wins, otherwise the base value is kept. Only object-shaped payloads are
/// merged key-by-key; any other shape is replaced wholesale by `overrides`
/// when `overrides` is not `Value::Null`.
fn merge_payload(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base_map), Value::Object(override_map)) => {
            for (k, v) in override_map {
                if !v.is_null() {
                    base_map.insert(k, v);
                }
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overrides) => overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_mocks::MockWorkspaceStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_writes_manifest_and_job_row() {
        let store = MockWorkspaceStore::new();
        let workspace = TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());

        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({"a": 1}), true)
            .await
            .unwrap();

        let artifacts = JobArtifacts::new(workspace.path(), &job.id);
        assert!(artifacts.manifest_path().exists());
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn resume_fails_for_running_job() {
        let store = MockWorkspaceStore::new();
        let workspace = TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({}), true)
            .await
            .unwrap();
        runtime.transition(&job.id, job.row_version, JobState::Running).await.unwrap();

        let err = runtime
            .resume_preconditions(&job.id, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, McodaError::ResumeNotAllowed { .. }));
    }

    #[tokio::test]
    async fn resume_succeeds_after_paused_with_checkpoint() {
        let store = MockWorkspaceStore::new();
        let workspace = TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({"x": 1}), true)
            .await
            .unwrap();
        let job = runtime.transition(&job.id, job.row_version, JobState::Running).await.unwrap();
        runtime.checkpoint(&job.id, "task:T01:work", serde_json::json!({"outcome": "succeeded"})).await.unwrap();
        let job = store.get_job(&job.id).await.unwrap();
        runtime.transition(&job.id, job.row_version, JobState::Paused).await.unwrap();

        let (job, merged) = runtime
            .resume_preconditions(&job.id, serde_json::json!({"y": 2}))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }

    #[tokio::test]
    async fn cancel_from_terminal_state_requires_force() {
        let store = MockWorkspaceStore::new();
        let workspace = TempDir::new().unwrap();
        let runtime = JobRuntime::new(&store, workspace.path());
        let job = runtime
            .create("gateway-trio", "gateway-trio", serde_json::json!({}), true)
            .await
            .unwrap();
        let job = runtime.transition(&job.id, job.row_version, JobState::Running).await.unwrap();
        store.transition_job(&job.id, job.row_version, JobState::Completed).await.unwrap();

        assert!(runtime.cancel(&job.id, false).await.is_err());
        assert!(runtime.cancel(&job.id, true).await.is_ok());
    }
}
