use crate::config::Config;
use anyhow::{Context, Result};
use mcoda_core::WorkspaceStore;
use mcoda_store::{seed_agents, AgentManifestEntry, SqliteWorkspaceStore};

const DEFAULT_AGENT_MANIFEST: &str = include_str!("../config/agents.json");

/// Opens the workspace's SQLite store, running migrations and seeding the
/// default agent manifest on first use. Idempotent: safe to call on every
/// invocation.
pub async fn open_store(config: &Config) -> Result<SqliteWorkspaceStore> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("creating workspace .mcoda directory")?;
    }
    let store = SqliteWorkspaceStore::new(&db_path.to_string_lossy())
        .await
        .context("opening workspace database")?;
    store.migrate().await.context("running workspace migrations")?;

    let manifest: Vec<AgentManifestEntry> =
        serde_json::from_str(DEFAULT_AGENT_MANIFEST).context("parsing embedded agent manifest")?;
    seed_agents(&store, &manifest)
        .await
        .context("seeding default agent manifest")?;

    Ok(store)
}
