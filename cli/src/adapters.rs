use mcoda_engine::HashMapAdapterRegistry;
use mcoda_mocks::StubAgentAdapter;

/// A single JSON blob whose fields satisfy the Work, Review, and QA step
/// classifiers at once (`result`, `decision`, `outcome`), so a stubbed
/// adapter can answer any step in the trio ladder without knowing which one
/// it's being asked for.
fn universal_success() -> String {
    serde_json::json!({
        "result": "succeeded",
        "decision": "approve",
        "outcome": "pass",
    })
    .to_string()
}

fn stub_gateway_analysis() -> String {
    serde_json::json!({
        "summary": "stub gateway analysis for local smoke-testing",
        "filesLikelyTouched": [],
        "filesToCreate": [],
        "complexity": 3,
        "plan": ["stub plan step"],
        "discipline": "code",
    })
    .to_string()
}

/// Enough canned turns for a realistic CLI smoke run (a handful of tasks
/// across a few retry cycles); once exhausted the stub falls back to `{}`,
/// which surfaces as a normal unparseable-output failure rather than a panic.
const STUB_TURNS: usize = 512;

pub fn build_stub_gateway_adapter() -> StubAgentAdapter {
    let adapter = StubAgentAdapter::new("gateway", "stub-gateway-model");
    for _ in 0..STUB_TURNS {
        adapter.push_output(stub_gateway_analysis());
    }
    adapter
}

/// Builds one stub adapter per known agent slug and registers it under that
/// slug, so `AgentRouter`'s pick is always resolvable in stub mode.
pub fn build_stub_registry(slugs: &[String]) -> HashMapAdapterRegistry {
    let mut registry = HashMapAdapterRegistry::new();
    for slug in slugs {
        let adapter = StubAgentAdapter::new(slug.clone(), format!("{slug}-stub-model"));
        for _ in 0..STUB_TURNS {
            adapter.push_output(universal_success());
        }
        registry.insert(Box::new(adapter));
    }
    registry
}
