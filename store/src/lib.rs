//! SQLite persistence for mcoda's `WorkspaceStore`, implemented with `sqlx`.

mod common;
pub mod seed;
mod sqlite;

pub use seed::{seed_agents, AgentManifestEntry};
pub use sqlite::SqliteWorkspaceStore;
