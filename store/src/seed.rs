use mcoda_core::{McodaError, NewAgent, WorkspaceStore};
use serde::Deserialize;

/// One entry in an agent-registry manifest, loaded at first run. Mirrors
/// `NewAgent` but keeps the manifest format decoupled from the domain type so
/// the on-disk shape can gain fields without touching `mcoda-core`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentManifestEntry {
    pub slug: String,
    pub adapter: String,
    pub default_model: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub cost_per_million: f64,
    #[serde(default = "default_max_complexity")]
    pub max_complexity: i32,
}

fn default_max_complexity() -> i32 {
    5
}

/// Populates the global agent registry from a manifest, skipping slugs that
/// already exist so this can run unconditionally on every startup.
pub async fn seed_agents(
    store: &dyn WorkspaceStore,
    manifest: &[AgentManifestEntry],
) -> Result<usize, McodaError> {
    let mut inserted = 0;
    for entry in manifest {
        if store.get_agent_by_slug(&entry.slug).await.is_ok() {
            continue;
        }
        store
            .create_agent(NewAgent {
                slug: entry.slug.clone(),
                adapter: entry.adapter.clone(),
                default_model: entry.default_model.clone(),
                capabilities: entry.capabilities.clone(),
                cost_per_million: entry.cost_per_million,
                max_complexity: entry.max_complexity,
            })
            .await?;
        inserted += 1;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteWorkspaceStore;

    #[tokio::test]
    async fn seeding_twice_does_not_duplicate() {
        let store = SqliteWorkspaceStore::new(":memory:").await.unwrap();
        store.migrate().await.unwrap();

        let manifest = vec![AgentManifestEntry {
            slug: "claude-opus".into(),
            adapter: "anthropic".into(),
            default_model: "claude-opus".into(),
            capabilities: vec!["code".into()],
            cost_per_million: 15.0,
            max_complexity: 8,
        }];

        let first = seed_agents(&store, &manifest).await.unwrap();
        let second = seed_agents(&store, &manifest).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let agents = store.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
    }
}
