use mcoda_core::{AgentAdapter, InvokeInput, McodaError, Task};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fields the gateway's JSON analysis must carry for a task to proceed to
/// routing, per spec.md §4.4. Order mirrors the contract's field list.
const REQUIRED_FIELDS: &[&str] = &[
    "summary",
    "filesLikelyTouched",
    "filesToCreate",
    "complexity",
    "plan",
    "discipline",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    Code,
    Docs,
    Qa,
    Ops,
    Research,
}

/// Structured plan a gateway agent produces for one task, per spec.md §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAnalysis {
    pub summary: String,
    #[serde(default)]
    pub reasoning_summary: Option<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub todo: Vec<String>,
    #[serde(default)]
    pub understanding: Option<String>,
    pub plan: Vec<String>,
    pub complexity: i32,
    pub discipline: Discipline,
    pub files_likely_touched: Vec<String>,
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub docdex_notes: Vec<String>,
}

/// Inputs assembled into the prompt sent to the gateway agent, per the
/// composition list in spec.md §4.4: job prompt, character prompt, command
/// prompt, repo memory, user profile, research summary.
#[derive(Debug, Clone, Default)]
pub struct GatewayPromptContext {
    pub job_prompt: Option<String>,
    pub character_prompt: Option<String>,
    pub command_prompt: Option<String>,
    pub repo_memory: Option<String>,
    pub user_profile: Option<String>,
    pub research_summary: Option<String>,
}

const MAX_REPAIR_ATTEMPTS: u32 = 2;

/// Drives a gateway `AgentAdapter` through up to `1 + MAX_REPAIR_ATTEMPTS`
/// invocations, repairing the prompt when required fields come back missing.
pub struct GatewayAgent<'a> {
    adapter: &'a dyn AgentAdapter,
}

impl<'a> GatewayAgent<'a> {
    pub fn new(adapter: &'a dyn AgentAdapter) -> Self {
        Self { adapter }
    }

    pub async fn analyze(
        &self,
        task: &Task,
        ctx: &GatewayPromptContext,
    ) -> Result<GatewayAnalysis, McodaError> {
        let mut prompt = strip_routing_guidance(&build_prompt(task, ctx));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let output = self
                .adapter
                .invoke(InvokeInput {
                    prompt: prompt.clone(),
                    model: None,
                    metadata: Default::default(),
                })
                .await?;

            match missing_fields(&output.output) {
                Ok(analysis) => return Ok(analysis),
                Err(missing) => {
                    if attempts > MAX_REPAIR_ATTEMPTS {
                        return Err(McodaError::GatewayUnparseable {
                            attempts,
                            reason: format!(
                                "missing required field(s): {}",
                                missing.join(", ")
                            ),
                        });
                    }
                    prompt = repair_prompt(&prompt, &missing);
                }
            }
        }
    }
}

fn build_prompt(task: &Task, ctx: &GatewayPromptContext) -> String {
    let mut sections = vec![format!(
        "Task {}: {}\n{}",
        task.key, task.name, task.description
    )];
    for (label, value) in [
        ("Job", &ctx.job_prompt),
        ("Character", &ctx.character_prompt),
        ("Command", &ctx.command_prompt),
        ("Repo memory", &ctx.repo_memory),
        ("User profile", &ctx.user_profile),
        ("Research summary", &ctx.research_summary),
    ] {
        if let Some(v) = value {
            sections.push(format!("{label}:\n{v}"));
        }
    }
    sections.join("\n\n")
}

/// Removes lines that leak routing-internal guidance (gateway framing, model
/// identifiers) before the prompt reaches an analysis agent.
fn strip_routing_guidance(prompt: &str) -> String {
    const BANNED_SUBSTRINGS: &[&str] = &["routing gateway", "model:", "model=", "agent-router"];
    prompt
        .lines()
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            !BANNED_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses `raw` and checks the required-field contract. `Ok` carries the
/// fully-typed analysis; `Err` carries the names of fields that are absent or
/// null, in `REQUIRED_FIELDS` order.
fn missing_fields(raw: &str) -> Result<GatewayAnalysis, Vec<String>> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Err(REQUIRED_FIELDS.iter().map(|s| s.to_string()).collect()),
    };

    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|field| value.get(field).map(Value::is_null).unwrap_or(true))
        .map(|s| s.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(missing);
    }

    serde_json::from_value(value)
        .map_err(|_| REQUIRED_FIELDS.iter().map(|s| s.to_string()).collect())
}

fn repair_prompt(previous: &str, missing: &[String]) -> String {
    format!(
        "{previous}\n\nYour previous response was missing the following required field(s): {}.\nRespond again with a complete JSON object.",
        missing.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_core::{NewTask, TaskStatus};
    use mcoda_mocks::StubAgentAdapter;

    fn sample_task() -> Task {
        Task {
            id: 1,
            project_id: 1,
            epic_id: 1,
            story_id: 1,
            key: "P-E1-US1-T01".into(),
            name: "Add retry budget".into(),
            description: "Cap work-step retries".into(),
            status: TaskStatus::NotStarted,
            priority: 5.0,
            story_points: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn valid_analysis_json() -> String {
        serde_json::json!({
            "summary": "short",
            "filesLikelyTouched": ["src/lib.rs"],
            "filesToCreate": [],
            "complexity": 3,
            "plan": ["do it"],
            "discipline": "code",
        })
        .to_string()
    }

    #[tokio::test]
    async fn parses_valid_first_response() {
        let adapter = StubAgentAdapter::new("gateway", "model-x");
        adapter.push_output(valid_analysis_json());
        let gateway = GatewayAgent::new(&adapter);
        let analysis = gateway
            .analyze(&sample_task(), &GatewayPromptContext::default())
            .await
            .unwrap();
        assert_eq!(analysis.complexity, 3);
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn repairs_then_succeeds() {
        let adapter = StubAgentAdapter::new("gateway", "model-x");
        adapter.push_output("{\"summary\": \"only this\"}");
        adapter.push_output(valid_analysis_json());
        let gateway = GatewayAgent::new(&adapter);
        let analysis = gateway
            .analyze(&sample_task(), &GatewayPromptContext::default())
            .await
            .unwrap();
        assert_eq!(analysis.discipline, Discipline::Code);
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausts_retries_and_fails() {
        let adapter = StubAgentAdapter::new("gateway", "model-x");
        for _ in 0..3 {
            adapter.push_output("not json");
        }
        let gateway = GatewayAgent::new(&adapter);
        let err = gateway
            .analyze(&sample_task(), &GatewayPromptContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McodaError::GatewayUnparseable { attempts: 3, .. }));
    }
}
