use async_trait::async_trait;
use chrono::Utc;
use mcoda_core::{
    AgentAdapter, HealthState, HealthStatus, InvokeInput, InvokeOutput, McodaError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Scripted `AgentAdapter` for engine tests: queues canned outputs, can be
/// told to fail the next N invocations, and records every prompt it saw so
/// assertions can check what the router/trio actually sent.
pub struct StubAgentAdapter {
    slug: String,
    model: String,
    outputs: Mutex<VecDeque<String>>,
    health: Mutex<HealthState>,
    fail_next: Mutex<u32>,
    calls: Mutex<Vec<String>>,
}

impl StubAgentAdapter {
    pub fn new(slug: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            model: model.into(),
            outputs: Mutex::new(VecDeque::new()),
            health: Mutex::new(HealthState::Healthy),
            fail_next: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_output(&self, output: impl Into<String>) {
        self.outputs.lock().push_back(output.into());
    }

    pub fn fail_next_invocations(&self, count: u32) {
        *self.fail_next.lock() = count;
    }

    pub fn set_health(&self, state: HealthState) {
        *self.health.lock() = state;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl AgentAdapter for StubAgentAdapter {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn invoke(&self, input: InvokeInput) -> Result<InvokeOutput, McodaError> {
        self.calls.lock().push(input.prompt.clone());

        let mut fail_next = self.fail_next.lock();
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(McodaError::AgentUnreachable {
                agent: self.slug.clone(),
                reason: "stubbed failure".into(),
            });
        }
        drop(fail_next);

        let output = self
            .outputs
            .lock()
            .pop_front()
            .unwrap_or_else(|| "{}".to_string());
        Ok(InvokeOutput {
            output,
            adapter: self.slug.clone(),
            model: input.model.unwrap_or_else(|| self.model.clone()),
            metadata: Default::default(),
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, McodaError> {
        let status = *self.health.lock();
        Ok(HealthStatus {
            status,
            latency_ms: Some(1),
            last_checked_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queued_outputs_in_order() {
        let adapter = StubAgentAdapter::new("claude-opus", "claude-opus-4");
        adapter.push_output("first");
        adapter.push_output("second");

        let first = adapter
            .invoke(InvokeInput {
                prompt: "do work".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.output, "first");
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn fail_next_forces_agent_unreachable() {
        let adapter = StubAgentAdapter::new("claude-opus", "claude-opus-4");
        adapter.fail_next_invocations(1);
        let err = adapter
            .invoke(InvokeInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McodaError::AgentUnreachable { .. }));
    }
}
